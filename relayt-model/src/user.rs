use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::UserId;

/// A playback-account credential holder.
///
/// One `User` corresponds to one media-server account name and carries the
/// Trakt tokens used for that account's own scrobbles. Family groups bind a
/// user's account name to additional credential holders.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    /// Media-server account name, lowercased, globally unique.
    pub username: String,
    pub access_token: String,
    pub refresh_token: String,
    pub token_expiry: DateTime<Utc>,
    /// Display name reported by the watch-tracking API, already sanitized.
    pub display_name: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl User {
    pub fn new(
        username: &str,
        access_token: String,
        refresh_token: String,
        token_expiry: DateTime<Utc>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: UserId::new(),
            username: username.trim().to_lowercase(),
            access_token,
            refresh_token,
            token_expiry,
            display_name: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether the stored access token has already lapsed.
    pub fn token_expired(&self) -> bool {
        self.token_expiry < Utc::now()
    }

    /// Whether the token should be refreshed ahead of use.
    pub fn token_needs_refresh(&self) -> bool {
        self.token_expiry < Utc::now() + chrono::Duration::hours(24)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn username_is_normalized() {
        let user = User::new(
            "  MixedCase ",
            "at".into(),
            "rt".into(),
            Utc::now() + Duration::hours(1),
        );
        assert_eq!(user.username, "mixedcase");
    }

    #[test]
    fn expiry_check() {
        let mut user = User::new(
            "u",
            "at".into(),
            "rt".into(),
            Utc::now() + Duration::hours(1),
        );
        assert!(!user.token_expired());
        user.token_expiry = Utc::now() - Duration::seconds(1);
        assert!(user.token_expired());
    }
}
