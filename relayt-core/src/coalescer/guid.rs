//! Fallback identification of episodes from legacy platform GUIDs.
//!
//! Older media-server agents encode the show id and episode position in the
//! item GUID instead of exposing clean external ids:
//!
//! - `com.plexapp.agents.thetvdb://73739/4/8?lang=en`
//! - `com.plexapp.agents.themoviedb://1399/1/2`
//! - `com.plexapp.agents.hama://tvdb-73739/4/8`

/// Which catalog the GUID's show id belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuidProvider {
    Tvdb,
    Tmdb,
}

/// A show id plus episode position recovered from a GUID.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShowGuid {
    pub provider: GuidProvider,
    pub id: u64,
    pub season: u32,
    pub episode: u32,
}

/// Parse a platform GUID into show identity, or `None` when the scheme is
/// unknown or the `<id>/<season>/<episode>` pattern does not hold.
pub fn parse_show_guid(raw: &str) -> Option<ShowGuid> {
    let (scheme, rest) = raw.split_once("://")?;
    let rest = rest.split('?').next().unwrap_or(rest);
    let segments: Vec<&str> =
        rest.split('/').filter(|s| !s.is_empty()).collect();

    if scheme.ends_with("tvdb") {
        return from_segments(GuidProvider::Tvdb, &segments);
    }
    if scheme.ends_with("themoviedb") {
        return from_segments(GuidProvider::Tmdb, &segments);
    }
    if scheme.ends_with("hama") {
        // Composite host prefix: `tvdb-<id>` or `tvdb2-<id>`.
        let (prefix, id) = segments.first()?.split_once('-')?;
        if prefix != "tvdb" && prefix != "tvdb2" {
            return None;
        }
        let rewritten = [id, segments.get(1)?, segments.get(2)?];
        return from_segments(GuidProvider::Tvdb, &rewritten);
    }
    None
}

fn from_segments(
    provider: GuidProvider,
    segments: &[&str],
) -> Option<ShowGuid> {
    if segments.len() != 3 {
        return None;
    }
    Some(ShowGuid {
        provider,
        id: segments[0].parse().ok()?,
        season: segments[1].parse().ok()?,
        episode: segments[2].parse().ok()?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_thetvdb_scheme() {
        let guid = parse_show_guid(
            "com.plexapp.agents.thetvdb://73739/4/8?lang=en",
        )
        .unwrap();
        assert_eq!(guid.provider, GuidProvider::Tvdb);
        assert_eq!(guid.id, 73739);
        assert_eq!(guid.season, 4);
        assert_eq!(guid.episode, 8);
    }

    #[test]
    fn parses_themoviedb_scheme() {
        let guid =
            parse_show_guid("com.plexapp.agents.themoviedb://1399/1/2")
                .unwrap();
        assert_eq!(guid.provider, GuidProvider::Tmdb);
        assert_eq!(guid.id, 1399);
    }

    #[test]
    fn parses_hama_composite_prefixes() {
        let guid =
            parse_show_guid("com.plexapp.agents.hama://tvdb-73739/4/8")
                .unwrap();
        assert_eq!(guid.provider, GuidProvider::Tvdb);
        assert_eq!(guid.id, 73739);

        let guid =
            parse_show_guid("com.plexapp.agents.hama://tvdb2-73739/1/1?lang=en")
                .unwrap();
        assert_eq!(guid.id, 73739);
    }

    #[test]
    fn rejects_unknown_schemes_and_shapes() {
        assert!(parse_show_guid("plex://episode/5d9c0874ffd9ef").is_none());
        assert!(
            parse_show_guid("com.plexapp.agents.hama://anidb-1234/1/1")
                .is_none()
        );
        assert!(
            parse_show_guid("com.plexapp.agents.thetvdb://73739/4")
                .is_none()
        );
        assert!(
            parse_show_guid("com.plexapp.agents.thetvdb://abc/4/8")
                .is_none()
        );
        assert!(parse_show_guid("not a guid").is_none());
    }
}
