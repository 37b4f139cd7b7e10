use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, info, warn};

use relayt_model::{
    AuthorizationStatus, CachedState, FamilyGroup, GroupId, GroupMember,
    MemberId, Notification, NotificationId, QueuedEvent, QueuedEventId,
    RetryItem, RetryItemId, User, UserId,
};

use super::Storage;
use crate::error::{BridgeError, Result};

/// Local filesystem backend.
///
/// One JSON file per record. Queue files are named
/// `<unix_millis>-<id>.json` so lexical sort order equals chronological
/// order. Retry operations are unsupported: there is no atomic cross-process
/// lease on plain files.
#[derive(Debug, Clone)]
pub struct FilesystemStorage {
    root: PathBuf,
}

impl FilesystemStorage {
    pub async fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        for dir in ["users", "groups", "members", "state", "queue", "notifications"]
        {
            fs::create_dir_all(root.join(dir)).await?;
        }
        info!(root = %root.display(), "Filesystem storage ready");
        Ok(Self { root })
    }

    fn user_path(&self, id: UserId) -> PathBuf {
        self.root.join("users").join(format!("{id}.json"))
    }

    fn group_path(&self, id: GroupId) -> PathBuf {
        self.root.join("groups").join(format!("{id}.json"))
    }

    fn members_dir(&self, group: GroupId) -> PathBuf {
        self.root.join("members").join(group.to_string())
    }

    fn member_path(&self, group: GroupId, id: MemberId) -> PathBuf {
        self.members_dir(group).join(format!("{id}.json"))
    }

    fn state_path(&self, player_id: &str, rating_key: &str) -> PathBuf {
        self.root.join("state").join(format!(
            "{}_{}.json",
            safe_component(player_id),
            safe_component(rating_key)
        ))
    }

    fn queue_dir(&self, user: UserId) -> PathBuf {
        self.root.join("queue").join(user.to_string())
    }

    fn queue_path(&self, event: &QueuedEvent) -> PathBuf {
        self.queue_dir(event.user_id).join(format!(
            "{:013}-{}.json",
            event.created_at.timestamp_millis(),
            event.id
        ))
    }

    fn notifications_dir(&self, group: GroupId) -> PathBuf {
        self.root.join("notifications").join(group.to_string())
    }

    async fn read_json<T: serde::de::DeserializeOwned>(
        path: &Path,
    ) -> Result<Option<T>> {
        match fs::read(path).await {
            Ok(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_json<T: serde::Serialize>(
        path: &Path,
        value: &T,
    ) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(path, serde_json::to_vec_pretty(value)?).await?;
        Ok(())
    }

    /// Entries of a directory in lexical (= chronological for queues) order.
    async fn sorted_entries(dir: &Path) -> Result<Vec<PathBuf>> {
        let mut entries = Vec::new();
        let mut reader = match fs::read_dir(dir).await {
            Ok(reader) => reader,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(entries);
            }
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = reader.next_entry().await? {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "json") {
                entries.push(path);
            }
        }
        entries.sort();
        Ok(entries)
    }

    async fn find_queue_file(
        &self,
        id: QueuedEventId,
    ) -> Result<Option<PathBuf>> {
        let suffix = format!("-{id}.json");
        let queue_root = self.root.join("queue");
        let mut users = match fs::read_dir(&queue_root).await {
            Ok(reader) => reader,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };
        while let Some(user_dir) = users.next_entry().await? {
            for path in Self::sorted_entries(&user_dir.path()).await? {
                if path
                    .file_name()
                    .and_then(|name| name.to_str())
                    .is_some_and(|name| name.ends_with(&suffix))
                {
                    return Ok(Some(path));
                }
            }
        }
        Ok(None)
    }
}

/// Keep identifiers filename-safe without losing uniqueness for the id
/// shapes the media server actually emits.
fn safe_component(raw: &str) -> String {
    raw.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

#[async_trait]
impl Storage for FilesystemStorage {
    async fn ping(&self) -> Result<()> {
        fs::metadata(&self.root).await?;
        Ok(())
    }

    fn supports_retry_queue(&self) -> bool {
        false
    }

    async fn write_user(&self, user: &User) -> Result<()> {
        let mut updated = user.clone();
        updated.updated_at = Utc::now();
        Self::write_json(&self.user_path(user.id), &updated).await
    }

    async fn get_user(&self, id: UserId) -> Result<Option<User>> {
        Self::read_json(&self.user_path(id)).await
    }

    async fn get_user_by_name(&self, username: &str) -> Result<Option<User>> {
        let wanted = username.trim().to_lowercase();
        for user in self.list_users().await? {
            if user.username == wanted {
                return Ok(Some(user));
            }
        }
        Ok(None)
    }

    async fn delete_user(&self, id: UserId) -> Result<()> {
        match fs::remove_file(self.user_path(id)).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        self.purge_queue_for_user(id).await
    }

    async fn list_users(&self) -> Result<Vec<User>> {
        let mut users = Vec::new();
        for path in Self::sorted_entries(&self.root.join("users")).await? {
            match Self::read_json::<User>(&path).await {
                Ok(Some(user)) => users.push(user),
                Ok(None) => {}
                Err(e) => {
                    warn!(path = %path.display(), "Skipping unreadable user file: {e}");
                }
            }
        }
        users.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(users)
    }

    async fn get_cached_state(
        &self,
        player_id: &str,
        rating_key: &str,
    ) -> Result<Option<CachedState>> {
        let path = self.state_path(player_id, rating_key);
        let Some(state) = Self::read_json::<CachedState>(&path).await? else {
            return Ok(None);
        };
        if state.is_expired(Utc::now()) {
            debug!(player_id, rating_key, "Evicting expired cached state");
            let _ = fs::remove_file(&path).await;
            return Ok(None);
        }
        Ok(Some(state))
    }

    async fn write_cached_state(&self, state: &CachedState) -> Result<()> {
        Self::write_json(
            &self.state_path(&state.player_id, &state.rating_key),
            state,
        )
        .await
    }

    async fn create_group(&self, group: &FamilyGroup) -> Result<()> {
        if self
            .get_group_by_plex_username(&group.plex_username)
            .await?
            .is_some()
        {
            return Err(BridgeError::Internal(format!(
                "Group already exists for {}",
                group.plex_username
            )));
        }
        Self::write_json(&self.group_path(group.id), group).await
    }

    async fn get_group(&self, id: GroupId) -> Result<Option<FamilyGroup>> {
        Self::read_json(&self.group_path(id)).await
    }

    async fn get_group_by_plex_username(
        &self,
        plex_username: &str,
    ) -> Result<Option<FamilyGroup>> {
        let wanted = plex_username.trim().to_lowercase();
        for group in self.list_groups().await? {
            if group.plex_username == wanted {
                return Ok(Some(group));
            }
        }
        Ok(None)
    }

    async fn delete_group(&self, id: GroupId) -> Result<()> {
        for dir in [self.members_dir(id), self.notifications_dir(id)] {
            match fs::remove_dir_all(&dir).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        match fs::remove_file(self.group_path(id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn list_groups(&self) -> Result<Vec<FamilyGroup>> {
        let mut groups = Vec::new();
        for path in Self::sorted_entries(&self.root.join("groups")).await? {
            if let Some(group) = Self::read_json::<FamilyGroup>(&path).await?
            {
                groups.push(group);
            }
        }
        groups.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(groups)
    }

    async fn upsert_member(&self, member: &GroupMember) -> Result<()> {
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
        Self::write_json(
            &self.member_path(member.family_group_id, member.id),
            member,
        )
        .await
    }

    async fn get_member(&self, id: MemberId) -> Result<Option<GroupMember>> {
        for group in self.list_groups().await? {
            let path = self.member_path(group.id, id);
            if let Some(member) =
                Self::read_json::<GroupMember>(&path).await?
            {
                return Ok(Some(member));
            }
        }
        Ok(None)
    }

    async fn list_members(&self, group: GroupId) -> Result<Vec<GroupMember>> {
        let mut members = Vec::new();
        for path in Self::sorted_entries(&self.members_dir(group)).await? {
            if let Some(member) =
                Self::read_json::<GroupMember>(&path).await?
            {
                members.push(member);
            }
        }
        members.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(members)
    }

    async fn delete_member(&self, id: MemberId) -> Result<()> {
        if let Some(member) = self.get_member(id).await? {
            let path = self.member_path(member.family_group_id, id);
            match fs::remove_file(path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
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
        self.upsert_member(&member).await
    }

    async fn enqueue_scrobble(
        &self,
        event: &QueuedEvent,
        capacity: usize,
    ) -> Result<()> {
        let dir = self.queue_dir(event.user_id);
        fs::create_dir_all(&dir).await?;

        // Replace an already-queued event for the same playback in place,
        // keeping its position in the queue.
        for path in Self::sorted_entries(&dir).await? {
            if let Some(existing) =
                Self::read_json::<QueuedEvent>(&path).await?
                && existing.player_id == event.player_id
                && existing.rating_key == event.rating_key
            {
                let mut replacement = event.clone();
                replacement.id = existing.id;
                replacement.created_at = existing.created_at;
                replacement.retry_count = 0;
                replacement.last_attempt = None;
                return Self::write_json(&path, &replacement).await;
            }
        }

        Self::write_json(&self.queue_path(event), event).await?;

        // FIFO eviction past the per-user cap.
        let entries = Self::sorted_entries(&dir).await?;
        if entries.len() > capacity {
            let overflow = entries.len() - capacity;
            debug!(
                user_id = %event.user_id,
                evicted = overflow,
                "Evicted oldest queued scrobbles past capacity"
            );
            for victim in entries.into_iter().take(overflow) {
                let _ = fs::remove_file(victim).await;
            }
        }
        Ok(())
    }

    async fn dequeue_oldest(
        &self,
        user_id: UserId,
        limit: i64,
    ) -> Result<Vec<QueuedEvent>> {
        let mut events = Vec::new();
        for path in Self::sorted_entries(&self.queue_dir(user_id)).await? {
            if events.len() as i64 >= limit {
                break;
            }
            if let Some(event) =
                Self::read_json::<QueuedEvent>(&path).await?
            {
                events.push(event);
            }
        }
        Ok(events)
    }

    async fn delete_queued_scrobble(&self, id: QueuedEventId) -> Result<()> {
        // Idempotent: the file may already be gone.
        if let Some(path) = self.find_queue_file(id).await? {
            match fs::remove_file(path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    async fn update_retry_count(
        &self,
        id: QueuedEventId,
        retry_count: i32,
        last_attempt: DateTime<Utc>,
    ) -> Result<()> {
        if let Some(path) = self.find_queue_file(id).await?
            && let Some(mut event) =
                Self::read_json::<QueuedEvent>(&path).await?
        {
            event.retry_count = retry_count;
            event.last_attempt = Some(last_attempt);
            Self::write_json(&path, &event).await?;
        }
        Ok(())
    }

    async fn queue_size(&self, user_id: UserId) -> Result<usize> {
        Ok(Self::sorted_entries(&self.queue_dir(user_id)).await?.len())
    }

    async fn users_with_queued_events(&self) -> Result<Vec<UserId>> {
        let mut users = Vec::new();
        let queue_root = self.root.join("queue");
        let mut reader = match fs::read_dir(&queue_root).await {
            Ok(reader) => reader,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(users);
            }
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = reader.next_entry().await? {
            let Some(name) = entry.file_name().to_str().map(String::from)
            else {
                continue;
            };
            let Ok(user_id) = name.parse::<UserId>() else {
                continue;
            };
            if !Self::sorted_entries(&entry.path()).await?.is_empty() {
                users.push(user_id);
            }
        }
        Ok(users)
    }

    async fn purge_queue_for_user(&self, user_id: UserId) -> Result<()> {
        match fs::remove_dir_all(self.queue_dir(user_id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
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
        let path = self
            .notifications_dir(notification.family_group_id)
            .join(format!("{}.json", notification.id));
        Self::write_json(&path, notification).await
    }

    async fn get_notifications(
        &self,
        group: GroupId,
        include_dismissed: bool,
    ) -> Result<Vec<Notification>> {
        let mut notifications = Vec::new();
        for path in
            Self::sorted_entries(&self.notifications_dir(group)).await?
        {
            if let Some(notification) =
                Self::read_json::<Notification>(&path).await?
                && (include_dismissed || !notification.dismissed)
            {
                notifications.push(notification);
            }
        }
        notifications.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(notifications)
    }

    async fn dismiss_notification(&self, id: NotificationId) -> Result<()> {
        for group in self.list_groups().await? {
            let path = self
                .notifications_dir(group.id)
                .join(format!("{id}.json"));
            if let Some(mut notification) =
                Self::read_json::<Notification>(&path).await?
            {
                notification.dismissed = true;
                return Self::write_json(&path, &notification).await;
            }
        }
        Ok(())
    }

    async fn delete_notification(&self, id: NotificationId) -> Result<()> {
        for group in self.list_groups().await? {
            let path = self
                .notifications_dir(group.id)
                .join(format!("{id}.json"));
            match fs::remove_file(&path).await {
                Ok(()) => return Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}
