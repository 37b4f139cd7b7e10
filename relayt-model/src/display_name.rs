/// Maximum display-name length accepted from the upstream API.
pub const DISPLAY_NAME_MAX: usize = 50;

/// Trim and truncate a display name reported by the upstream API.
///
/// Returns the sanitized name and whether truncation happened. Truncation
/// respects char boundaries; the upstream occasionally hands back names in
/// non-Latin scripts.
pub fn sanitize_display_name(raw: &str) -> (String, bool) {
    let trimmed = raw.trim();
    if trimmed.chars().count() <= DISPLAY_NAME_MAX {
        return (trimmed.to_string(), false);
    }
    (trimmed.chars().take(DISPLAY_NAME_MAX).collect(), true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_names_pass_through() {
        assert_eq!(
            sanitize_display_name("  Alice  "),
            ("Alice".to_string(), false)
        );
    }

    #[test]
    fn long_names_truncate_with_flag() {
        let raw = "x".repeat(80);
        let (name, truncated) = sanitize_display_name(&raw);
        assert_eq!(name.len(), DISPLAY_NAME_MAX);
        assert!(truncated);
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        let raw = "й".repeat(60);
        let (name, truncated) = sanitize_display_name(&raw);
        assert_eq!(name.chars().count(), DISPLAY_NAME_MAX);
        assert!(truncated);
    }
}
