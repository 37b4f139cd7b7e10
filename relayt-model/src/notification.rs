use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ModelError;
use crate::ids::{GroupId, MemberId, NotificationId};

/// Banner categories surfaced to a group owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationType {
    PermanentFailure,
    AuthorizationExpired,
    MemberAdded,
    MemberRemoved,
}

impl NotificationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PermanentFailure => "permanent_failure",
            Self::AuthorizationExpired => "authorization_expired",
            Self::MemberAdded => "member_added",
            Self::MemberRemoved => "member_removed",
        }
    }
}

impl std::fmt::Display for NotificationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for NotificationType {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "permanent_failure" => Ok(Self::PermanentFailure),
            "authorization_expired" => Ok(Self::AuthorizationExpired),
            "member_added" => Ok(Self::MemberAdded),
            "member_removed" => Ok(Self::MemberRemoved),
            other => Err(ModelError::UnknownVariant {
                kind: "notification type",
                value: other.to_string(),
            }),
        }
    }
}

/// Persistent banner record addressed to a group owner.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub id: NotificationId,
    pub family_group_id: GroupId,
    pub group_member_id: Option<MemberId>,
    pub notification_type: NotificationType,
    pub message: String,
    pub metadata: Option<serde_json::Value>,
    pub dismissed: bool,
    pub created_at: DateTime<Utc>,
}

impl Notification {
    pub fn new(
        family_group_id: GroupId,
        group_member_id: Option<MemberId>,
        notification_type: NotificationType,
        message: impl Into<String>,
        metadata: Option<serde_json::Value>,
    ) -> Self {
        Self {
            id: NotificationId::new(),
            family_group_id,
            group_member_id,
            notification_type,
            message: message.into(),
            metadata,
            dismissed: false,
            created_at: Utc::now(),
        }
    }
}
