use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{QueuedEventId, UserId};
use crate::scrobble::{ScrobbleAction, ScrobbleBody};

/// Idempotency record for one `(player_id, rating_key)` pair.
///
/// Holds the last dispatched action, its progress, and the scrobble body
/// built on first sight of the item. Soft TTL of about three hours; backends
/// evict expired records on read or via store TTLs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedState {
    pub player_id: String,
    pub server_id: String,
    pub rating_key: String,
    pub last_action: ScrobbleAction,
    pub last_progress_percent: i32,
    pub scrobble_body: ScrobbleBody,
    pub updated_at: DateTime<Utc>,
}

impl CachedState {
    /// Soft TTL for cached state.
    pub const TTL_SECS: i64 = 3 * 60 * 60;

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now.signed_duration_since(self.updated_at).num_seconds()
            > Self::TTL_SECS
    }
}

/// One scrobble parked in a user's durable queue while the upstream API is
/// unreachable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedEvent {
    pub id: QueuedEventId,
    pub user_id: UserId,
    pub scrobble_body: ScrobbleBody,
    pub action: ScrobbleAction,
    pub progress: i32,
    pub created_at: DateTime<Utc>,
    pub retry_count: i32,
    pub last_attempt: Option<DateTime<Utc>>,
    /// Dedup key within the user's queue, together with `rating_key`.
    pub player_id: String,
    pub rating_key: String,
}

impl QueuedEvent {
    pub fn new(
        user_id: UserId,
        action: ScrobbleAction,
        body: ScrobbleBody,
        player_id: &str,
        rating_key: &str,
    ) -> Self {
        Self {
            id: QueuedEventId::new(),
            user_id,
            progress: body.progress,
            scrobble_body: body,
            action,
            created_at: Utc::now(),
            retry_count: 0,
            last_attempt: None,
            player_id: player_id.to_string(),
            rating_key: rating_key.to_string(),
        }
    }
}
