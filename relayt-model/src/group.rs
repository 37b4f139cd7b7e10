use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{ModelError, Result};
use crate::ids::{GroupId, MemberId};

/// Ceiling on members per group, enforced at the boundary.
pub const MAX_GROUP_MEMBERS: usize = 10;
/// Floor on members per group; a "family" of one is just a user.
pub const MIN_GROUP_MEMBERS: usize = 2;
/// Upper bound on the free-form member label.
pub const MAX_LABEL_LEN: usize = 100;

/// A named binding from one playback-account name to a set of
/// credential-holders.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FamilyGroup {
    pub id: GroupId,
    /// Case-normalized media-server account name, globally unique.
    pub plex_username: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl FamilyGroup {
    pub fn new(plex_username: &str) -> Result<Self> {
        let normalized = plex_username.trim().to_lowercase();
        if normalized.is_empty() {
            return Err(ModelError::InvalidField {
                field: "plex_username",
                reason: "must be non-empty".into(),
            });
        }
        let now = Utc::now();
        Ok(Self {
            id: GroupId::new(),
            plex_username: normalized,
            created_at: now,
            updated_at: now,
        })
    }
}

/// Authorization lifecycle of one credential-holder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthorizationStatus {
    /// Created, waiting for the identity exchange.
    Pending,
    /// Identity exchange succeeded; tokens are usable.
    Authorized,
    /// Token expiry passed or upstream rejected the credentials.
    Expired,
    /// The identity provider rejected a refresh.
    Failed,
}

impl AuthorizationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Authorized => "authorized",
            Self::Expired => "expired",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for AuthorizationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for AuthorizationStatus {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(Self::Pending),
            "authorized" => Ok(Self::Authorized),
            "expired" => Ok(Self::Expired),
            "failed" => Ok(Self::Failed),
            other => Err(ModelError::UnknownVariant {
                kind: "authorization status",
                value: other.to_string(),
            }),
        }
    }
}

/// One credential-holder inside a family group.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupMember {
    pub id: MemberId,
    pub family_group_id: GroupId,
    /// Free-form label shown while the member is still pending.
    pub temp_label: String,
    /// Lowercased Trakt username; present once authorized, unique within the
    /// group when present.
    pub trakt_username: Option<String>,
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
    pub token_expiry: Option<DateTime<Utc>>,
    pub authorization_status: AuthorizationStatus,
    pub created_at: DateTime<Utc>,
}

impl GroupMember {
    pub fn new(family_group_id: GroupId, temp_label: &str) -> Result<Self> {
        let label = temp_label.trim();
        if label.is_empty() || label.len() > MAX_LABEL_LEN {
            return Err(ModelError::InvalidField {
                field: "temp_label",
                reason: format!("must be 1..={MAX_LABEL_LEN} characters"),
            });
        }
        Ok(Self {
            id: MemberId::new(),
            family_group_id,
            temp_label: label.to_string(),
            trakt_username: None,
            access_token: None,
            refresh_token: None,
            token_expiry: None,
            authorization_status: AuthorizationStatus::Pending,
            created_at: Utc::now(),
        })
    }

    /// Transition to authorized after a successful identity exchange.
    pub fn authorize(
        &mut self,
        trakt_username: &str,
        access_token: String,
        refresh_token: String,
        token_expiry: DateTime<Utc>,
    ) {
        self.trakt_username = Some(trakt_username.trim().to_lowercase());
        self.access_token = Some(access_token);
        self.refresh_token = Some(refresh_token);
        self.token_expiry = Some(token_expiry);
        self.authorization_status = AuthorizationStatus::Authorized;
    }

    /// Whether this member can take part in a broadcast right now.
    pub fn is_dispatchable(&self) -> bool {
        self.authorization_status == AuthorizationStatus::Authorized
            && self.access_token.is_some()
    }

    /// Whether the stored expiry has lapsed.
    pub fn token_expired(&self) -> bool {
        self.token_expiry.is_some_and(|t| t < Utc::now())
    }

    /// Whether the token is inside the 24 h refresh-ahead window.
    pub fn token_needs_refresh(&self) -> bool {
        self.token_expiry
            .is_some_and(|t| t < Utc::now() + chrono::Duration::hours(24))
    }

    /// Name used in notifications and logs.
    pub fn label(&self) -> &str {
        self.trakt_username.as_deref().unwrap_or(&self.temp_label)
    }
}
