//! Shared fixtures for the integration suites: a programmable upstream and
//! an in-memory retry-capable store.

// Each integration suite pulls in only part of this module.
#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

use relayt_core::trakt::{
    ScrobbleApi, ScrobbleOutcome, TokenGrant, TraktError, UserSettings,
};
use relayt_core::{BridgeError, Storage};
use relayt_model::{
    AuthorizationStatus, CachedState, FamilyGroup, GroupId, GroupMember,
    MemberId, Notification, NotificationId, QueuedEvent, QueuedEventId,
    RetryItem, RetryItemId, RetryStatus, User, UserId,
};

/// One recorded upstream call.
#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub action: relayt_model::ScrobbleAction,
    pub progress: i32,
    pub token: String,
}

/// Upstream double: answers from a scripted queue, then a default.
pub struct FakeTrakt {
    scripted: Mutex<VecDeque<Result<ScrobbleOutcome, TraktError>>>,
    default_response: fn() -> Result<ScrobbleOutcome, TraktError>,
    pub calls: Mutex<Vec<RecordedCall>>,
}

impl FakeTrakt {
    pub fn healthy() -> Self {
        Self {
            scripted: Mutex::new(VecDeque::new()),
            default_response: || Ok(ScrobbleOutcome { status: 200 }),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn failing(code: u16) -> Self {
        Self {
            scripted: Mutex::new(VecDeque::new()),
            default_response: match code {
                401 => || Err(TraktError::Status { code: 401 }),
                429 => || Err(TraktError::Status { code: 429 }),
                500 => || Err(TraktError::Status { code: 500 }),
                503 => || Err(TraktError::Status { code: 503 }),
                _ => || Err(TraktError::Network("connection reset".into())),
            },
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Queue a one-shot response consumed before the default kicks in.
    pub fn script(&self, response: Result<ScrobbleOutcome, TraktError>) {
        self.scripted.lock().unwrap().push_back(response);
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl ScrobbleApi for FakeTrakt {
    async fn scrobble(
        &self,
        action: relayt_model::ScrobbleAction,
        body: &relayt_model::ScrobbleBody,
        access_token: &str,
    ) -> Result<ScrobbleOutcome, TraktError> {
        self.calls.lock().unwrap().push(RecordedCall {
            action,
            progress: body.progress,
            token: access_token.to_string(),
        });
        match self.scripted.lock().unwrap().pop_front() {
            Some(response) => response,
            None => (self.default_response)(),
        }
    }

    async fn user_settings(
        &self,
        _access_token: &str,
    ) -> Result<UserSettings, TraktError> {
        match (self.default_response)() {
            Ok(_) => serde_json::from_str(
                r#"{"user": {"username": "fake", "name": "Fake User"}}"#,
            )
            .map_err(|e| TraktError::Decode(e.to_string())),
            Err(e) => Err(e),
        }
    }

    async fn exchange_code(
        &self,
        _code: &str,
    ) -> Result<TokenGrant, TraktError> {
        serde_json::from_str(
            r#"{"access_token": "fresh-access", "refresh_token": "fresh-refresh", "expires_in": 7776000}"#,
        )
        .map_err(|e| TraktError::Decode(e.to_string()))
    }

    async fn refresh_token(
        &self,
        _refresh_token: &str,
    ) -> Result<TokenGrant, TraktError> {
        self.exchange_code("").await
    }
}

/// Build an authorized member for tests.
pub fn authorized_member(group: GroupId, label: &str) -> GroupMember {
    let mut member = GroupMember::new(group, label).unwrap();
    member.authorize(
        label,
        format!("token-{label}"),
        format!("refresh-{label}"),
        Utc::now() + Duration::days(30),
    );
    member
}

static UNIQUE: AtomicUsize = AtomicUsize::new(0);

/// A group name that will not collide across tests sharing a backend.
pub fn unique_name(prefix: &str) -> String {
    format!("{prefix}-{}", UNIQUE.fetch_add(1, Ordering::Relaxed))
}

/// In-memory store with real retry-queue semantics, for driving the retry
/// engine without PostgreSQL. Operations the retry suites never touch
/// return the unsupported sentinel.
#[derive(Default)]
pub struct MemoryRetryStore {
    pub members: Mutex<HashMap<MemberId, GroupMember>>,
    pub items: Mutex<HashMap<RetryItemId, RetryItem>>,
    pub notifications: Mutex<Vec<Notification>>,
}

impl MemoryRetryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_member(&self, member: GroupMember) {
        self.members.lock().unwrap().insert(member.id, member);
    }

    pub fn insert_item(&self, item: RetryItem) {
        self.items.lock().unwrap().insert(item.id, item);
    }

    pub fn item(&self, id: RetryItemId) -> Option<RetryItem> {
        self.items.lock().unwrap().get(&id).cloned()
    }

    pub fn item_count(&self) -> usize {
        self.items.lock().unwrap().len()
    }

    /// Pull every pending item's due time into the past.
    pub fn force_due(&self) {
        let mut items = self.items.lock().unwrap();
        for item in items.values_mut() {
            if item.status != RetryStatus::PermanentFailure {
                item.next_attempt_at = Utc::now() - Duration::seconds(1);
            }
        }
    }

    pub fn notifications(&self) -> Vec<Notification> {
        self.notifications.lock().unwrap().clone()
    }
}

#[async_trait]
impl Storage for MemoryRetryStore {
    async fn ping(&self) -> relayt_core::Result<()> {
        Ok(())
    }

    fn supports_retry_queue(&self) -> bool {
        true
    }

    async fn write_user(&self, _user: &User) -> relayt_core::Result<()> {
        Err(BridgeError::Unsupported("test fake"))
    }

    async fn get_user(
        &self,
        _id: UserId,
    ) -> relayt_core::Result<Option<User>> {
        Ok(None)
    }

    async fn get_user_by_name(
        &self,
        _username: &str,
    ) -> relayt_core::Result<Option<User>> {
        Ok(None)
    }

    async fn delete_user(&self, _id: UserId) -> relayt_core::Result<()> {
        Err(BridgeError::Unsupported("test fake"))
    }

    async fn list_users(&self) -> relayt_core::Result<Vec<User>> {
        Ok(Vec::new())
    }

    async fn get_cached_state(
        &self,
        _player_id: &str,
        _rating_key: &str,
    ) -> relayt_core::Result<Option<CachedState>> {
        Ok(None)
    }

    async fn write_cached_state(
        &self,
        _state: &CachedState,
    ) -> relayt_core::Result<()> {
        Ok(())
    }

    async fn create_group(
        &self,
        _group: &FamilyGroup,
    ) -> relayt_core::Result<()> {
        Ok(())
    }

    async fn get_group(
        &self,
        _id: GroupId,
    ) -> relayt_core::Result<Option<FamilyGroup>> {
        Ok(None)
    }

    async fn get_group_by_plex_username(
        &self,
        _plex_username: &str,
    ) -> relayt_core::Result<Option<FamilyGroup>> {
        Ok(None)
    }

    async fn delete_group(&self, _id: GroupId) -> relayt_core::Result<()> {
        Err(BridgeError::Unsupported("test fake"))
    }

    async fn list_groups(&self) -> relayt_core::Result<Vec<FamilyGroup>> {
        Ok(Vec::new())
    }

    async fn upsert_member(
        &self,
        member: &GroupMember,
    ) -> relayt_core::Result<()> {
        self.insert_member(member.clone());
        Ok(())
    }

    async fn get_member(
        &self,
        id: MemberId,
    ) -> relayt_core::Result<Option<GroupMember>> {
        Ok(self.members.lock().unwrap().get(&id).cloned())
    }

    async fn list_members(
        &self,
        group: GroupId,
    ) -> relayt_core::Result<Vec<GroupMember>> {
        Ok(self
            .members
            .lock()
            .unwrap()
            .values()
            .filter(|m| m.family_group_id == group)
            .cloned()
            .collect())
    }

    async fn delete_member(&self, id: MemberId) -> relayt_core::Result<()> {
        self.members.lock().unwrap().remove(&id);
        Ok(())
    }

    async fn set_member_status(
        &self,
        id: MemberId,
        status: AuthorizationStatus,
    ) -> relayt_core::Result<()> {
        if let Some(member) = self.members.lock().unwrap().get_mut(&id) {
            member.authorization_status = status;
        }
        Ok(())
    }

    async fn enqueue_scrobble(
        &self,
        _event: &QueuedEvent,
        _capacity: usize,
    ) -> relayt_core::Result<()> {
        Err(BridgeError::Unsupported("test fake"))
    }

    async fn dequeue_oldest(
        &self,
        _user_id: UserId,
        _limit: i64,
    ) -> relayt_core::Result<Vec<QueuedEvent>> {
        Ok(Vec::new())
    }

    async fn delete_queued_scrobble(
        &self,
        _id: QueuedEventId,
    ) -> relayt_core::Result<()> {
        Ok(())
    }

    async fn update_retry_count(
        &self,
        _id: QueuedEventId,
        _retry_count: i32,
        _last_attempt: DateTime<Utc>,
    ) -> relayt_core::Result<()> {
        Ok(())
    }

    async fn queue_size(
        &self,
        _user_id: UserId,
    ) -> relayt_core::Result<usize> {
        Ok(0)
    }

    async fn users_with_queued_events(
        &self,
    ) -> relayt_core::Result<Vec<UserId>> {
        Ok(Vec::new())
    }

    async fn purge_queue_for_user(
        &self,
        _user_id: UserId,
    ) -> relayt_core::Result<()> {
        Ok(())
    }

    async fn enqueue_retry_item(
        &self,
        item: &RetryItem,
    ) -> relayt_core::Result<()> {
        self.insert_item(item.clone());
        Ok(())
    }

    async fn lease_due_retry_items(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> relayt_core::Result<Vec<RetryItem>> {
        let mut items = self.items.lock().unwrap();
        let mut due: Vec<&mut RetryItem> = items
            .values_mut()
            .filter(|item| {
                item.status != RetryStatus::PermanentFailure
                    && item.next_attempt_at <= now
            })
            .collect();
        due.sort_by_key(|item| item.next_attempt_at);
        Ok(due
            .into_iter()
            .take(limit as usize)
            .map(|item| {
                item.status = RetryStatus::Retrying;
                item.updated_at = now;
                item.clone()
            })
            .collect())
    }

    async fn mark_retry_success(
        &self,
        id: RetryItemId,
    ) -> relayt_core::Result<()> {
        self.items.lock().unwrap().remove(&id);
        Ok(())
    }

    async fn mark_retry_failure(
        &self,
        id: RetryItemId,
        attempt_count: i32,
        next_attempt_at: DateTime<Utc>,
        last_error: &str,
        permanent: bool,
    ) -> relayt_core::Result<()> {
        if let Some(item) = self.items.lock().unwrap().get_mut(&id) {
            item.attempt_count = attempt_count;
            item.next_attempt_at = next_attempt_at;
            item.last_error = Some(last_error.to_string());
            item.status = if permanent {
                RetryStatus::PermanentFailure
            } else {
                RetryStatus::Queued
            };
            item.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn list_retry_items(
        &self,
        group: GroupId,
    ) -> relayt_core::Result<Vec<RetryItem>> {
        Ok(self
            .items
            .lock()
            .unwrap()
            .values()
            .filter(|item| item.family_group_id == group)
            .cloned()
            .collect())
    }

    async fn create_notification(
        &self,
        notification: &Notification,
    ) -> relayt_core::Result<()> {
        self.notifications.lock().unwrap().push(notification.clone());
        Ok(())
    }

    async fn get_notifications(
        &self,
        group: GroupId,
        include_dismissed: bool,
    ) -> relayt_core::Result<Vec<Notification>> {
        Ok(self
            .notifications
            .lock()
            .unwrap()
            .iter()
            .filter(|n| {
                n.family_group_id == group
                    && (include_dismissed || !n.dismissed)
            })
            .cloned()
            .collect())
    }

    async fn dismiss_notification(
        &self,
        id: NotificationId,
    ) -> relayt_core::Result<()> {
        let mut notifications = self.notifications.lock().unwrap();
        if let Some(n) = notifications.iter_mut().find(|n| n.id == id) {
            n.dismissed = true;
        }
        Ok(())
    }

    async fn delete_notification(
        &self,
        id: NotificationId,
    ) -> relayt_core::Result<()> {
        self.notifications.lock().unwrap().retain(|n| n.id != id);
        Ok(())
    }
}
