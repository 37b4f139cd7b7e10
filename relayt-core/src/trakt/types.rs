use serde::Deserialize;
use thiserror::Error;

use relayt_model::sanitize_display_name;

/// Upstream failure, classified for the retry decision.
#[derive(Debug, Clone, Error)]
pub enum TraktError {
    /// Non-success HTTP response.
    #[error("upstream returned {code}")]
    Status { code: u16 },

    /// Transport-level failure: timeout, reset, DNS, TLS.
    #[error("network error: {0}")]
    Network(String),

    /// The request future was cancelled before completion.
    #[error("canceled")]
    Canceled,

    /// A 2xx body that did not parse.
    #[error("failed to decode upstream response: {0}")]
    Decode(String),

    /// OAuth endpoint rejected the grant.
    #[error("oauth error {error}: {description}")]
    OAuth { error: String, description: String },
}

impl TraktError {
    /// The closed retryability set: 429/500/502/503/504 and anything
    /// transport-level. Everything else needs human action.
    pub fn is_retryable(&self) -> bool {
        match self {
            TraktError::Status { code } => {
                matches!(code, 429 | 500 | 502 | 503 | 504)
            }
            TraktError::Network(_) | TraktError::Canceled => true,
            TraktError::Decode(_) | TraktError::OAuth { .. } => false,
        }
    }

    /// Whether this failure means the member's credentials are dead.
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, TraktError::Status { code: 401 })
    }

    pub fn http_status(&self) -> Option<u16> {
        match self {
            TraktError::Status { code } => Some(*code),
            _ => None,
        }
    }
}

/// Result of a delivered scrobble.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScrobbleOutcome {
    pub status: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UserSettings {
    pub user: UserProfile,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct UserProfile {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub display: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
}

impl UserSettings {
    /// Best display name on offer, sanitized; the flag reports truncation.
    pub fn display_name(&self) -> Option<(String, bool)> {
        self.user
            .name
            .as_deref()
            .or(self.user.display.as_deref())
            .or(self.user.username.as_deref())
            .filter(|name| !name.trim().is_empty())
            .map(sanitize_display_name)
    }

    /// The account's login name, used for member identity.
    pub fn username(&self) -> Option<&str> {
        self.user
            .username
            .as_deref()
            .map(str::trim)
            .filter(|name| !name.is_empty())
    }
}

/// Error body shape of the OAuth endpoint.
#[derive(Debug, Deserialize)]
pub(crate) struct OAuthErrorBody {
    #[serde(default)]
    pub error: String,
    #[serde(default)]
    pub error_description: String,
}
