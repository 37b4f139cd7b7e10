//! Persistence contract and backends.
//!
//! A single [`Storage`] trait covers users, family groups, cached playback
//! state, the per-user scrobble queue, the durable retry queue, and owner
//! notifications. Three backends implement it: PostgreSQL (authoritative,
//! the only one with the row-level lease the retry engine needs), Redis, and
//! the local filesystem. Backends that cannot provide the retry queue return
//! [`BridgeError::Unsupported`]; the orchestrator checks
//! [`Storage::supports_retry_queue`] at startup and refuses to spawn the
//! retry worker instead of looping on the sentinel.

mod fallback;
mod filesystem;
mod postgres;
mod redis;

pub use fallback::FallbackBuffers;
pub use filesystem::FilesystemStorage;
pub use postgres::PostgresStorage;
pub use redis::RedisStorage;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use relayt_model::{
    AuthorizationStatus, CachedState, FamilyGroup, GroupId, GroupMember,
    MemberId, Notification, NotificationId, QueuedEvent, QueuedEventId,
    RetryItem, RetryItemId, User, UserId,
};

use crate::error::Result;

/// The persistence contract every backend implements.
///
/// All operations are cancel-safe: dropping the returned future aborts the
/// round-trip without leaving in-process state behind.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Storage: Send + Sync {
    /// Liveness probe against the underlying store.
    async fn ping(&self) -> Result<()>;

    /// Whether this backend provides the atomic lease the retry engine
    /// requires.
    fn supports_retry_queue(&self) -> bool;

    // -- User credentials --

    /// Insert or update a user; `username` lookups are case-insensitive.
    async fn write_user(&self, user: &User) -> Result<()>;
    async fn get_user(&self, id: UserId) -> Result<Option<User>>;
    async fn get_user_by_name(&self, username: &str) -> Result<Option<User>>;
    async fn delete_user(&self, id: UserId) -> Result<()>;
    /// All users, most recently updated first.
    async fn list_users(&self) -> Result<Vec<User>>;

    // -- Cached idempotency state --

    /// Fetch the cached record for one playback; `None` when absent or
    /// expired.
    async fn get_cached_state(
        &self,
        player_id: &str,
        rating_key: &str,
    ) -> Result<Option<CachedState>>;
    async fn write_cached_state(&self, state: &CachedState) -> Result<()>;

    // -- Family groups and members --

    async fn create_group(&self, group: &FamilyGroup) -> Result<()>;
    async fn get_group(&self, id: GroupId) -> Result<Option<FamilyGroup>>;
    async fn get_group_by_plex_username(
        &self,
        plex_username: &str,
    ) -> Result<Option<FamilyGroup>>;
    /// Destroy a group, cascading to members, retry items, notifications.
    async fn delete_group(&self, id: GroupId) -> Result<()>;
    async fn list_groups(&self) -> Result<Vec<FamilyGroup>>;

    async fn upsert_member(&self, member: &GroupMember) -> Result<()>;
    async fn get_member(&self, id: MemberId) -> Result<Option<GroupMember>>;
    async fn list_members(&self, group: GroupId) -> Result<Vec<GroupMember>>;
    async fn delete_member(&self, id: MemberId) -> Result<()>;
    async fn set_member_status(
        &self,
        id: MemberId,
        status: AuthorizationStatus,
    ) -> Result<()>;

    // -- Per-user scrobble queue --

    /// Park a scrobble in the user's queue. `(player_id, rating_key)` is the
    /// dedup key: a newer event for the same playback replaces the queued
    /// one in place. On overflow past the capacity the oldest events are
    /// evicted FIFO.
    async fn enqueue_scrobble(
        &self,
        event: &QueuedEvent,
        capacity: usize,
    ) -> Result<()>;
    /// Oldest events first, up to `limit`.
    async fn dequeue_oldest(
        &self,
        user_id: UserId,
        limit: i64,
    ) -> Result<Vec<QueuedEvent>>;
    /// Idempotent: deleting an event that no longer exists is a no-op.
    async fn delete_queued_scrobble(&self, id: QueuedEventId) -> Result<()>;
    async fn update_retry_count(
        &self,
        id: QueuedEventId,
        retry_count: i32,
        last_attempt: DateTime<Utc>,
    ) -> Result<()>;
    async fn queue_size(&self, user_id: UserId) -> Result<usize>;
    async fn users_with_queued_events(&self) -> Result<Vec<UserId>>;
    async fn purge_queue_for_user(&self, user_id: UserId) -> Result<()>;

    // -- Durable retry queue --

    async fn enqueue_retry_item(&self, item: &RetryItem) -> Result<()>;
    /// Atomically lease up to `limit` due items: select rows with
    /// `status IN (queued, retrying)` and `next_attempt_at <= now` ordered
    /// by due time, mark them `retrying`, and hand them to exactly one
    /// caller. Due `retrying` rows left behind by a crashed worker re-lease
    /// here.
    async fn lease_due_retry_items(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<RetryItem>>;
    /// Delete a delivered item.
    async fn mark_retry_success(&self, id: RetryItemId) -> Result<()>;
    /// Record a failed attempt: back to `queued` with a new due time, or
    /// finalized as `permanent_failure`.
    async fn mark_retry_failure(
        &self,
        id: RetryItemId,
        attempt_count: i32,
        next_attempt_at: DateTime<Utc>,
        last_error: &str,
        permanent: bool,
    ) -> Result<()>;
    async fn list_retry_items(
        &self,
        group: GroupId,
    ) -> Result<Vec<RetryItem>>;

    // -- Notifications --

    async fn create_notification(
        &self,
        notification: &Notification,
    ) -> Result<()>;
    async fn get_notifications(
        &self,
        group: GroupId,
        include_dismissed: bool,
    ) -> Result<Vec<Notification>>;
    async fn dismiss_notification(&self, id: NotificationId) -> Result<()>;
    async fn delete_notification(&self, id: NotificationId) -> Result<()>;
}
