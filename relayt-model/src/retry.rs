use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ModelError;
use crate::ids::{GroupId, MemberId, RetryItemId};

/// Ceiling on delivery attempts before an item is finalized.
pub const MAX_ATTEMPTS: i32 = 5;

/// Lease state of a durable retry item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryStatus {
    /// Waiting for its next due time.
    Queued,
    /// Leased by exactly one worker.
    Retrying,
    /// Attempts exhausted; kept for the operator, never retried again.
    PermanentFailure,
}

impl RetryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Retrying => "retrying",
            Self::PermanentFailure => "permanent_failure",
        }
    }
}

impl std::fmt::Display for RetryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RetryStatus {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "retrying" => Ok(Self::Retrying),
            "permanent_failure" => Ok(Self::PermanentFailure),
            other => Err(ModelError::UnknownVariant {
                kind: "retry status",
                value: other.to_string(),
            }),
        }
    }
}

/// A durable pending scrobble for one group member.
///
/// Inserted by the broadcaster on a retryable failure, leased by retry
/// workers, deleted on success or finalized as a permanent failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryItem {
    pub id: RetryItemId,
    pub family_group_id: GroupId,
    pub group_member_id: MemberId,
    /// Opaque JSON of the scrobble request (action + body).
    pub payload: serde_json::Value,
    pub attempt_count: i32,
    pub next_attempt_at: DateTime<Utc>,
    pub last_error: Option<String>,
    pub status: RetryStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RetryItem {
    pub fn new(
        family_group_id: GroupId,
        group_member_id: MemberId,
        payload: serde_json::Value,
        next_attempt_at: DateTime<Utc>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: RetryItemId::new(),
            family_group_id,
            group_member_id,
            payload,
            attempt_count: 0,
            next_attempt_at,
            last_error: None,
            status: RetryStatus::Queued,
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether one more failed attempt would exhaust the item.
    pub fn exhausted_after_next(&self) -> bool {
        self.attempt_count + 1 >= MAX_ATTEMPTS
    }
}
