use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::{AsyncCommands, aio::ConnectionManager};
use std::fmt;
use tracing::{debug, info};

use relayt_model::{
    AuthorizationStatus, CachedState, FamilyGroup, GroupId, GroupMember,
    MemberId, Notification, NotificationId, QueuedEvent, QueuedEventId,
    RetryItem, RetryItemId, User, UserId,
};

use super::Storage;
use crate::error::{BridgeError, Result};

/// In-memory key-value backend.
///
/// Users, groups, cached state, queues, and notifications live as JSON
/// values; per-user queues are sorted sets scored by enqueue time. The
/// durable retry queue needs a row-level lease this store cannot give, so
/// every retry operation returns [`BridgeError::Unsupported`] and the
/// orchestrator runs without the retry worker.
#[derive(Clone)]
pub struct RedisStorage {
    conn: ConnectionManager,
}

impl fmt::Debug for RedisStorage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisStorage")
            .field("connection", &"ConnectionManager")
            .finish()
    }
}

mod keys {
    use relayt_model::{GroupId, QueuedEventId, UserId};

    pub fn user(id: UserId) -> String {
        format!("user:{id}")
    }

    pub fn username(name: &str) -> String {
        format!("username:{}", name.trim().to_lowercase())
    }

    /// Sorted set of user ids scored by last update.
    pub const USERS: &str = "users";

    pub fn group(id: GroupId) -> String {
        format!("group:{id}")
    }

    pub fn group_name(name: &str) -> String {
        format!("groupname:{}", name.trim().to_lowercase())
    }

    pub const GROUPS: &str = "groups";

    pub fn members(group: GroupId) -> String {
        format!("members:{group}")
    }

    pub fn member(id: relayt_model::MemberId) -> String {
        format!("member:{id}")
    }

    pub fn state(player_id: &str, rating_key: &str) -> String {
        format!("state:{player_id}:{rating_key}")
    }

    pub fn queue(user: UserId) -> String {
        format!("queue:{user}")
    }

    pub fn queue_item(id: QueuedEventId) -> String {
        format!("queueitem:{id}")
    }

    /// Hash of `player|rating_key` to queued event id, per user.
    pub fn queue_dedup(user: UserId) -> String {
        format!("queuededup:{user}")
    }

    pub const QUEUED_USERS: &str = "queued_users";

    pub fn notifications(group: GroupId) -> String {
        format!("notifications:{group}")
    }

    pub fn notification(id: relayt_model::NotificationId) -> String {
        format!("notification:{id}")
    }

    pub fn dedup_field(player_id: &str, rating_key: &str) -> String {
        format!("{player_id}|{rating_key}")
    }
}

impl RedisStorage {
    pub async fn new(redis_url: &str) -> Result<Self> {
        info!("Connecting to Redis storage at {}", redis_url);

        let client = redis::Client::open(redis_url).map_err(|e| {
            BridgeError::Cache(format!("Failed to create Redis client: {e}"))
        })?;

        let conn = ConnectionManager::new(client).await.map_err(|e| {
            BridgeError::Cache(format!("Failed to connect to Redis: {e}"))
        })?;

        info!("Successfully connected to Redis");

        Ok(Self { conn })
    }

    fn conn(&self) -> ConnectionManager {
        self.conn.clone()
    }

    async fn read_json<T: serde::de::DeserializeOwned>(
        &self,
        key: &str,
    ) -> Result<Option<T>> {
        let raw: Option<String> =
            self.conn().get(key).await.map_err(|e| {
                BridgeError::Cache(format!("Redis GET failed: {e}"))
            })?;
        raw.map(|json| serde_json::from_str(&json).map_err(Into::into))
            .transpose()
    }

    async fn write_json<T: serde::Serialize + Sync>(
        &self,
        key: &str,
        value: &T,
    ) -> Result<()> {
        let json = serde_json::to_string(value)?;
        self.conn()
            .set::<_, _, ()>(key, json)
            .await
            .map_err(|e| BridgeError::Cache(format!("Redis SET failed: {e}")))
    }

    async fn delete_key(&self, key: &str) -> Result<()> {
        self.conn()
            .del::<_, ()>(key)
            .await
            .map_err(|e| BridgeError::Cache(format!("Redis DEL failed: {e}")))
    }

    async fn remove_queued(
        &self,
        event: &QueuedEvent,
    ) -> Result<()> {
        let mut conn = self.conn();
        conn.zrem::<_, _, ()>(
            keys::queue(event.user_id),
            event.id.to_string(),
        )
        .await
        .map_err(|e| BridgeError::Cache(format!("Redis ZREM failed: {e}")))?;
        conn.hdel::<_, _, ()>(
            keys::queue_dedup(event.user_id),
            keys::dedup_field(&event.player_id, &event.rating_key),
        )
        .await
        .map_err(|e| BridgeError::Cache(format!("Redis HDEL failed: {e}")))?;
        self.delete_key(&keys::queue_item(event.id)).await?;

        let remaining: i64 = conn
            .zcard(keys::queue(event.user_id))
            .await
            .map_err(|e| {
                BridgeError::Cache(format!("Redis ZCARD failed: {e}"))
            })?;
        if remaining == 0 {
            conn.srem::<_, _, ()>(
                keys::QUEUED_USERS,
                event.user_id.to_string(),
            )
            .await
            .map_err(|e| {
                BridgeError::Cache(format!("Redis SREM failed: {e}"))
            })?;
        }
        Ok(())
    }
}

#[async_trait]
impl Storage for RedisStorage {
    async fn ping(&self) -> Result<()> {
        redis::cmd("PING")
            .query_async::<String>(&mut self.conn())
            .await
            .map_err(|e| BridgeError::Cache(format!("Ping failed: {e}")))?;
        Ok(())
    }

    fn supports_retry_queue(&self) -> bool {
        false
    }

    async fn write_user(&self, user: &User) -> Result<()> {
        let mut updated = user.clone();
        updated.updated_at = Utc::now();

        self.write_json(&keys::user(user.id), &updated).await?;
        let mut conn = self.conn();
        conn.set::<_, _, ()>(
            keys::username(&user.username),
            user.id.to_string(),
        )
        .await
        .map_err(|e| BridgeError::Cache(format!("Redis SET failed: {e}")))?;
        conn.zadd::<_, _, _, ()>(
            keys::USERS,
            user.id.to_string(),
            updated.updated_at.timestamp_millis(),
        )
        .await
        .map_err(|e| BridgeError::Cache(format!("Redis ZADD failed: {e}")))
    }

    async fn get_user(&self, id: UserId) -> Result<Option<User>> {
        self.read_json(&keys::user(id)).await
    }

    async fn get_user_by_name(&self, username: &str) -> Result<Option<User>> {
        let id: Option<String> = self
            .conn()
            .get(keys::username(username))
            .await
            .map_err(|e| BridgeError::Cache(format!("Redis GET failed: {e}")))?;
        match id {
            Some(id) => {
                let id: UserId = id.parse().map_err(|_| {
                    BridgeError::Cache(format!("Corrupt user index: {id}"))
                })?;
                self.get_user(id).await
            }
            None => Ok(None),
        }
    }

    async fn delete_user(&self, id: UserId) -> Result<()> {
        if let Some(user) = self.get_user(id).await? {
            let mut conn = self.conn();
            conn.del::<_, ()>(keys::username(&user.username))
                .await
                .map_err(|e| {
                    BridgeError::Cache(format!("Redis DEL failed: {e}"))
                })?;
            conn.zrem::<_, _, ()>(keys::USERS, id.to_string())
                .await
                .map_err(|e| {
                    BridgeError::Cache(format!("Redis ZREM failed: {e}"))
                })?;
            self.delete_key(&keys::user(id)).await?;
            self.purge_queue_for_user(id).await?;
        }
        Ok(())
    }

    async fn list_users(&self) -> Result<Vec<User>> {
        // Highest score first: most recently updated.
        let ids: Vec<String> = self
            .conn()
            .zrevrange(keys::USERS, 0, -1)
            .await
            .map_err(|e| {
                BridgeError::Cache(format!("Redis ZREVRANGE failed: {e}"))
            })?;
        let mut users = Vec::with_capacity(ids.len());
        for id in ids {
            let id: UserId = id.parse().map_err(|_| {
                BridgeError::Cache(format!("Corrupt user index: {id}"))
            })?;
            if let Some(user) = self.get_user(id).await? {
                users.push(user);
            }
        }
        Ok(users)
    }

    async fn get_cached_state(
        &self,
        player_id: &str,
        rating_key: &str,
    ) -> Result<Option<CachedState>> {
        // The store TTL handles expiry; no cutoff check needed here.
        self.read_json(&keys::state(player_id, rating_key)).await
    }

    async fn write_cached_state(&self, state: &CachedState) -> Result<()> {
        let json = serde_json::to_string(state)?;
        self.conn()
            .set_ex::<_, _, ()>(
                keys::state(&state.player_id, &state.rating_key),
                json,
                CachedState::TTL_SECS as u64,
            )
            .await
            .map_err(|e| {
                BridgeError::Cache(format!("Redis SETEX failed: {e}"))
            })
    }

    async fn create_group(&self, group: &FamilyGroup) -> Result<()> {
        let name_key = keys::group_name(&group.plex_username);
        let existing: Option<String> =
            self.conn().get(&name_key).await.map_err(|e| {
                BridgeError::Cache(format!("Redis GET failed: {e}"))
            })?;
        if existing.is_some() {
            return Err(BridgeError::Internal(format!(
                "Group already exists for {}",
                group.plex_username
            )));
        }

        self.write_json(&keys::group(group.id), group).await?;
        let mut conn = self.conn();
        conn.set::<_, _, ()>(&name_key, group.id.to_string())
            .await
            .map_err(|e| {
                BridgeError::Cache(format!("Redis SET failed: {e}"))
            })?;
        conn.sadd::<_, _, ()>(keys::GROUPS, group.id.to_string())
            .await
            .map_err(|e| {
                BridgeError::Cache(format!("Redis SADD failed: {e}"))
            })
    }

    async fn get_group(&self, id: GroupId) -> Result<Option<FamilyGroup>> {
        self.read_json(&keys::group(id)).await
    }

    async fn get_group_by_plex_username(
        &self,
        plex_username: &str,
    ) -> Result<Option<FamilyGroup>> {
        let id: Option<String> = self
            .conn()
            .get(keys::group_name(plex_username))
            .await
            .map_err(|e| BridgeError::Cache(format!("Redis GET failed: {e}")))?;
        match id {
            Some(id) => {
                let id: GroupId = id.parse().map_err(|_| {
                    BridgeError::Cache(format!("Corrupt group index: {id}"))
                })?;
                self.get_group(id).await
            }
            None => Ok(None),
        }
    }

    async fn delete_group(&self, id: GroupId) -> Result<()> {
        let Some(group) = self.get_group(id).await? else {
            return Ok(());
        };
        for member in self.list_members(id).await? {
            self.delete_key(&keys::member(member.id)).await?;
        }
        for notification in self.get_notifications(id, true).await? {
            self.delete_key(&keys::notification(notification.id)).await?;
        }
        let mut conn = self.conn();
        conn.del::<_, ()>(keys::members(id)).await.map_err(|e| {
            BridgeError::Cache(format!("Redis DEL failed: {e}"))
        })?;
        conn.del::<_, ()>(keys::notifications(id)).await.map_err(|e| {
            BridgeError::Cache(format!("Redis DEL failed: {e}"))
        })?;
        conn.del::<_, ()>(keys::group_name(&group.plex_username))
            .await
            .map_err(|e| {
                BridgeError::Cache(format!("Redis DEL failed: {e}"))
            })?;
        conn.srem::<_, _, ()>(keys::GROUPS, id.to_string())
            .await
            .map_err(|e| {
                BridgeError::Cache(format!("Redis SREM failed: {e}"))
            })?;
        self.delete_key(&keys::group(id)).await
    }

    async fn list_groups(&self) -> Result<Vec<FamilyGroup>> {
        let ids: Vec<String> =
            self.conn().smembers(keys::GROUPS).await.map_err(|e| {
                BridgeError::Cache(format!("Redis SMEMBERS failed: {e}"))
            })?;
        let mut groups = Vec::with_capacity(ids.len());
        for id in ids {
            let id: GroupId = id.parse().map_err(|_| {
                BridgeError::Cache(format!("Corrupt group index: {id}"))
            })?;
            if let Some(group) = self.get_group(id).await? {
                groups.push(group);
            }
        }
        groups.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(groups)
    }

    async fn upsert_member(&self, member: &GroupMember) -> Result<()> {
        // Uniqueness of trakt_username within the group.
        if let Some(ref username) = member.trakt_username {
            for existing in
                self.list_members(member.family_group_id).await?
            {
                if existing.id != member.id
                    && existing.trakt_username.as_deref()
                        == Some(username.as_str())
                {
                    return Err(BridgeError::Internal(format!(
                        "Duplicate trakt username in group: {username}"
                    )));
                }
            }
        }

        self.write_json(&keys::member(member.id), member).await?;
        self.conn()
            .sadd::<_, _, ()>(
                keys::members(member.family_group_id),
                member.id.to_string(),
            )
            .await
            .map_err(|e| {
                BridgeError::Cache(format!("Redis SADD failed: {e}"))
            })
    }

    async fn get_member(&self, id: MemberId) -> Result<Option<GroupMember>> {
        self.read_json(&keys::member(id)).await
    }

    async fn list_members(&self, group: GroupId) -> Result<Vec<GroupMember>> {
        let ids: Vec<String> = self
            .conn()
            .smembers(keys::members(group))
            .await
            .map_err(|e| {
                BridgeError::Cache(format!("Redis SMEMBERS failed: {e}"))
            })?;
        let mut members = Vec::with_capacity(ids.len());
        for id in ids {
            let id: MemberId = id.parse().map_err(|_| {
                BridgeError::Cache(format!("Corrupt member index: {id}"))
            })?;
            if let Some(member) = self.get_member(id).await? {
                members.push(member);
            }
        }
        members.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(members)
    }

    async fn delete_member(&self, id: MemberId) -> Result<()> {
        if let Some(member) = self.get_member(id).await? {
            self.conn()
                .srem::<_, _, ()>(
                    keys::members(member.family_group_id),
                    id.to_string(),
                )
                .await
                .map_err(|e| {
                    BridgeError::Cache(format!("Redis SREM failed: {e}"))
                })?;
            self.delete_key(&keys::member(id)).await?;
        }
        Ok(())
    }

    async fn set_member_status(
        &self,
        id: MemberId,
        status: AuthorizationStatus,
    ) -> Result<()> {
        let Some(mut member) = self.get_member(id).await? else {
            return Err(BridgeError::NotFound(format!("member {id}")));
        };
        member.authorization_status = status;
        self.write_json(&keys::member(id), &member).await
    }

    async fn enqueue_scrobble(
        &self,
        event: &QueuedEvent,
        capacity: usize,
    ) -> Result<()> {
        let mut conn = self.conn();
        let dedup_key = keys::queue_dedup(event.user_id);
        let field = keys::dedup_field(&event.player_id, &event.rating_key);

        // A newer event for the same playback replaces the queued one.
        let existing: Option<String> =
            conn.hget(&dedup_key, &field).await.map_err(|e| {
                BridgeError::Cache(format!("Redis HGET failed: {e}"))
            })?;
        if let Some(old_id) = existing {
            conn.zrem::<_, _, ()>(keys::queue(event.user_id), &old_id)
                .await
                .map_err(|e| {
                    BridgeError::Cache(format!("Redis ZREM failed: {e}"))
                })?;
            if let Ok(old_id) = old_id.parse::<QueuedEventId>() {
                self.delete_key(&keys::queue_item(old_id)).await?;
            }
        }

        self.write_json(&keys::queue_item(event.id), event).await?;
        conn.zadd::<_, _, _, ()>(
            keys::queue(event.user_id),
            event.id.to_string(),
            event.created_at.timestamp_millis(),
        )
        .await
        .map_err(|e| BridgeError::Cache(format!("Redis ZADD failed: {e}")))?;
        conn.hset::<_, _, _, ()>(&dedup_key, &field, event.id.to_string())
            .await
            .map_err(|e| {
                BridgeError::Cache(format!("Redis HSET failed: {e}"))
            })?;
        conn.sadd::<_, _, ()>(
            keys::QUEUED_USERS,
            event.user_id.to_string(),
        )
        .await
        .map_err(|e| BridgeError::Cache(format!("Redis SADD failed: {e}")))?;

        // FIFO eviction past the per-user cap.
        let size: i64 =
            conn.zcard(keys::queue(event.user_id)).await.map_err(|e| {
                BridgeError::Cache(format!("Redis ZCARD failed: {e}"))
            })?;
        if size as usize > capacity {
            let overflow = size as usize - capacity;
            let victims: Vec<String> = conn
                .zrange(keys::queue(event.user_id), 0, overflow as isize - 1)
                .await
                .map_err(|e| {
                    BridgeError::Cache(format!("Redis ZRANGE failed: {e}"))
                })?;
            debug!(
                user_id = %event.user_id,
                evicted = victims.len(),
                "Evicted oldest queued scrobbles past capacity"
            );
            for victim in victims {
                if let Ok(id) = victim.parse::<QueuedEventId>()
                    && let Some(old) = self
                        .read_json::<QueuedEvent>(&keys::queue_item(id))
                        .await?
                {
                    self.remove_queued(&old).await?;
                }
            }
        }

        Ok(())
    }

    async fn dequeue_oldest(
        &self,
        user_id: UserId,
        limit: i64,
    ) -> Result<Vec<QueuedEvent>> {
        let ids: Vec<String> = self
            .conn()
            .zrange(keys::queue(user_id), 0, limit as isize - 1)
            .await
            .map_err(|e| {
                BridgeError::Cache(format!("Redis ZRANGE failed: {e}"))
            })?;
        let mut events = Vec::with_capacity(ids.len());
        for id in ids {
            let id: QueuedEventId = id.parse().map_err(|_| {
                BridgeError::Cache(format!("Corrupt queue index: {id}"))
            })?;
            if let Some(event) =
                self.read_json::<QueuedEvent>(&keys::queue_item(id)).await?
            {
                events.push(event);
            }
        }
        Ok(events)
    }

    async fn delete_queued_scrobble(&self, id: QueuedEventId) -> Result<()> {
        // Idempotent: nothing to do when the event is already gone.
        if let Some(event) =
            self.read_json::<QueuedEvent>(&keys::queue_item(id)).await?
        {
            self.remove_queued(&event).await?;
        }
        Ok(())
    }

    async fn update_retry_count(
        &self,
        id: QueuedEventId,
        retry_count: i32,
        last_attempt: DateTime<Utc>,
    ) -> Result<()> {
        if let Some(mut event) =
            self.read_json::<QueuedEvent>(&keys::queue_item(id)).await?
        {
            event.retry_count = retry_count;
            event.last_attempt = Some(last_attempt);
            self.write_json(&keys::queue_item(id), &event).await?;
        }
        Ok(())
    }

    async fn queue_size(&self, user_id: UserId) -> Result<usize> {
        let size: i64 = self
            .conn()
            .zcard(keys::queue(user_id))
            .await
            .map_err(|e| {
                BridgeError::Cache(format!("Redis ZCARD failed: {e}"))
            })?;
        Ok(size as usize)
    }

    async fn users_with_queued_events(&self) -> Result<Vec<UserId>> {
        let ids: Vec<String> = self
            .conn()
            .smembers(keys::QUEUED_USERS)
            .await
            .map_err(|e| {
                BridgeError::Cache(format!("Redis SMEMBERS failed: {e}"))
            })?;
        ids.into_iter()
            .map(|id| {
                id.parse().map_err(|_| {
                    BridgeError::Cache(format!("Corrupt queue index: {id}"))
                })
            })
            .collect()
    }

    async fn purge_queue_for_user(&self, user_id: UserId) -> Result<()> {
        let ids: Vec<String> = self
            .conn()
            .zrange(keys::queue(user_id), 0, -1)
            .await
            .map_err(|e| {
                BridgeError::Cache(format!("Redis ZRANGE failed: {e}"))
            })?;
        for id in ids {
            if let Ok(id) = id.parse::<QueuedEventId>() {
                self.delete_key(&keys::queue_item(id)).await?;
            }
        }
        let mut conn = self.conn();
        conn.del::<_, ()>(keys::queue(user_id)).await.map_err(|e| {
            BridgeError::Cache(format!("Redis DEL failed: {e}"))
        })?;
        conn.del::<_, ()>(keys::queue_dedup(user_id))
            .await
            .map_err(|e| {
                BridgeError::Cache(format!("Redis DEL failed: {e}"))
            })?;
        conn.srem::<_, _, ()>(keys::QUEUED_USERS, user_id.to_string())
            .await
            .map_err(|e| {
                BridgeError::Cache(format!("Redis SREM failed: {e}"))
            })
    }

    async fn enqueue_retry_item(&self, _item: &RetryItem) -> Result<()> {
        Err(BridgeError::Unsupported("retry queue"))
    }

    async fn lease_due_retry_items(
        &self,
        _now: DateTime<Utc>,
        _limit: i64,
    ) -> Result<Vec<RetryItem>> {
        Err(BridgeError::Unsupported("retry queue"))
    }

    async fn mark_retry_success(&self, _id: RetryItemId) -> Result<()> {
        Err(BridgeError::Unsupported("retry queue"))
    }

    async fn mark_retry_failure(
        &self,
        _id: RetryItemId,
        _attempt_count: i32,
        _next_attempt_at: DateTime<Utc>,
        _last_error: &str,
        _permanent: bool,
    ) -> Result<()> {
        Err(BridgeError::Unsupported("retry queue"))
    }

    async fn list_retry_items(
        &self,
        _group: GroupId,
    ) -> Result<Vec<RetryItem>> {
        Err(BridgeError::Unsupported("retry queue"))
    }

    async fn create_notification(
        &self,
        notification: &Notification,
    ) -> Result<()> {
        self.write_json(
            &keys::notification(notification.id),
            notification,
        )
        .await?;
        self.conn()
            .sadd::<_, _, ()>(
                keys::notifications(notification.family_group_id),
                notification.id.to_string(),
            )
            .await
            .map_err(|e| {
                BridgeError::Cache(format!("Redis SADD failed: {e}"))
            })
    }

    async fn get_notifications(
        &self,
        group: GroupId,
        include_dismissed: bool,
    ) -> Result<Vec<Notification>> {
        let ids: Vec<String> = self
            .conn()
            .smembers(keys::notifications(group))
            .await
            .map_err(|e| {
                BridgeError::Cache(format!("Redis SMEMBERS failed: {e}"))
            })?;
        let mut notifications = Vec::with_capacity(ids.len());
        for id in ids {
            let id: NotificationId = id.parse().map_err(|_| {
                BridgeError::Cache(format!(
                    "Corrupt notification index: {id}"
                ))
            })?;
            if let Some(notification) = self
                .read_json::<Notification>(&keys::notification(id))
                .await?
                && (include_dismissed || !notification.dismissed)
            {
                notifications.push(notification);
            }
        }
        notifications.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(notifications)
    }

    async fn dismiss_notification(&self, id: NotificationId) -> Result<()> {
        if let Some(mut notification) = self
            .read_json::<Notification>(&keys::notification(id))
            .await?
        {
            notification.dismissed = true;
            self.write_json(&keys::notification(id), &notification)
                .await?;
        }
        Ok(())
    }

    async fn delete_notification(&self, id: NotificationId) -> Result<()> {
        if let Some(notification) = self
            .read_json::<Notification>(&keys::notification(id))
            .await?
        {
            self.conn()
                .srem::<_, _, ()>(
                    keys::notifications(notification.family_group_id),
                    id.to_string(),
                )
                .await
                .map_err(|e| {
                    BridgeError::Cache(format!("Redis SREM failed: {e}"))
                })?;
            self.delete_key(&keys::notification(id)).await?;
        }
        Ok(())
    }
}
