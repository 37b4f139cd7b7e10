//! End-to-end behaviour of the coalesce → broadcast → queue/drain pipeline
//! over the filesystem backend.

mod support;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;

use relayt_config::Tuning;
use relayt_core::{
    BroadcastRequest, Broadcaster, DrainSupervisor, EventCoalescer,
    FallbackBuffers, FilesystemStorage, HealthController, Notifier,
    StoredTokenProbe, Storage, TelemetryRing,
};
use relayt_model::{
    AuthorizationStatus, EventVerb, FamilyGroup, GroupId, GroupMember,
    MediaEvent, MediaKind, NotificationType, RetryStatus, ScrobbleAction,
    UserId,
};

use support::{
    FakeTrakt, MemoryRetryStore, authorized_member, unique_name,
};

struct Stack {
    _dir: tempfile::TempDir,
    storage: Arc<FilesystemStorage>,
    api: Arc<FakeTrakt>,
    coalescer: EventCoalescer,
    broadcaster: Broadcaster,
    health: Arc<HealthController>,
    drainer: Arc<DrainSupervisor>,
}

async fn stack(api: FakeTrakt) -> Stack {
    let dir = tempfile::tempdir().unwrap();
    let storage = Arc::new(
        FilesystemStorage::new(dir.path()).await.unwrap(),
    );
    let api = Arc::new(api);
    let tuning = Tuning::default();
    let telemetry = Arc::new(TelemetryRing::new(64));
    let storage_dyn: Arc<dyn Storage> = storage.clone();
    let health = Arc::new(HealthController::new(
        Arc::new(StoredTokenProbe::new(api.clone(), storage_dyn.clone())),
        &tuning,
    ));
    let coalescer = EventCoalescer::new(storage_dyn.clone(), 90);
    let broadcaster = Broadcaster::new(
        api.clone(),
        storage_dyn.clone(),
        Notifier::new(storage_dyn.clone()),
        health.clone(),
        telemetry.clone(),
        Arc::new(FallbackBuffers::new(100)),
        Duration::from_secs(30),
        1000,
    );
    let drainer = Arc::new(DrainSupervisor::new(
        storage_dyn,
        api.clone(),
        telemetry,
        25,
    ));
    Stack {
        _dir: dir,
        storage,
        api,
        coalescer,
        broadcaster,
        health,
        drainer,
    }
}

async fn group_with_members(
    storage: &FilesystemStorage,
    count: usize,
) -> (FamilyGroup, Vec<GroupMember>) {
    let group = FamilyGroup::new(&unique_name("household")).unwrap();
    storage.create_group(&group).await.unwrap();
    let mut members = Vec::new();
    for i in 0..count {
        let member = authorized_member(group.id, &format!("member-{i}"));
        storage.upsert_member(&member).await.unwrap();
        members.push(member);
    }
    (group, members)
}

fn scrobble_event() -> MediaEvent {
    MediaEvent {
        player_id: "player-1".into(),
        server_id: "server-1".into(),
        rating_key: "42".into(),
        verb: EventVerb::Scrobble,
        kind: MediaKind::Movie,
        view_offset_ms: 6_900_000,
        duration_ms: 7_200_000,
        tmdb_id: Some(603),
        tvdb_id: None,
        imdb_id: None,
        guid: None,
        title: Some("The Matrix".into()),
        year: Some(1999),
        show_title: None,
        season: None,
        episode: None,
    }
}

fn request<'a>(
    prepared: &'a relayt_core::PreparedScrobble,
    event: &'a MediaEvent,
) -> BroadcastRequest<'a> {
    BroadcastRequest {
        action: prepared.action,
        body: &prepared.body,
        event_id: "event-1",
        media_title: "The Matrix",
        player_id: &event.player_id,
        rating_key: &event.rating_key,
    }
}

#[tokio::test]
async fn scrobble_fans_out_to_every_authorized_member() {
    let stack = stack(FakeTrakt::healthy()).await;
    let (_group, members) = group_with_members(&stack.storage, 3).await;

    let event = scrobble_event();
    let prepared =
        stack.coalescer.prepare(&event).await.unwrap().unwrap();
    assert_eq!(prepared.action, ScrobbleAction::Stop);
    assert_eq!(prepared.progress, 96);

    let errors = stack
        .broadcaster
        .broadcast(
            &CancellationToken::new(),
            &members,
            request(&prepared, &event),
        )
        .await;
    assert!(errors.is_empty());
    stack.coalescer.commit(prepared).await;

    let calls = stack.api.calls();
    assert_eq!(calls.len(), 3);
    for call in &calls {
        assert_eq!(call.action, ScrobbleAction::Stop);
        assert_eq!(call.progress, 96);
    }
    // Each member was hit with their own token.
    let mut tokens: Vec<_> =
        calls.iter().map(|c| c.token.clone()).collect();
    tokens.sort();
    tokens.dedup();
    assert_eq!(tokens.len(), 3);

    let cached = stack
        .storage
        .get_cached_state("player-1", "42")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(cached.last_action, ScrobbleAction::Stop);
    assert_eq!(cached.last_progress_percent, 96);
}

#[tokio::test]
async fn identical_pause_is_dispatched_once() {
    let stack = stack(FakeTrakt::healthy()).await;
    let (_group, members) = group_with_members(&stack.storage, 2).await;

    let mut event = scrobble_event();
    event.verb = EventVerb::Pause;
    event.view_offset_ms = 3_240_000;

    let prepared =
        stack.coalescer.prepare(&event).await.unwrap().unwrap();
    assert_eq!(prepared.action, ScrobbleAction::Pause);
    assert_eq!(prepared.progress, 45);
    stack
        .broadcaster
        .broadcast(
            &CancellationToken::new(),
            &members,
            request(&prepared, &event),
        )
        .await;
    stack.coalescer.commit(prepared).await;
    assert_eq!(stack.api.call_count(), 2);

    // The same report again: suppressed before any dispatch.
    let second = stack.coalescer.prepare(&event).await.unwrap();
    assert!(second.is_none());
    assert_eq!(stack.api.call_count(), 2);
}

#[tokio::test]
async fn queue_mode_parks_and_recovery_drains_oldest_first() {
    let stack = stack(FakeTrakt::healthy()).await;
    let (_group, members) = group_with_members(&stack.storage, 2).await;

    // Probe failure: queue mode.
    stack.health.observe(false, Utc::now());

    let event = scrobble_event();
    let prepared =
        stack.coalescer.prepare(&event).await.unwrap().unwrap();
    let errors = stack
        .broadcaster
        .broadcast(
            &CancellationToken::new(),
            &members,
            request(&prepared, &event),
        )
        .await;
    stack.coalescer.commit(prepared).await;

    assert!(errors.is_empty());
    assert_eq!(stack.api.call_count(), 0, "no direct calls in queue mode");
    for member in &members {
        let size = stack
            .storage
            .queue_size(UserId(member.id.0))
            .await
            .unwrap();
        assert_eq!(size, 1);
    }

    // Recovery: one drainer per queued user replays everything.
    stack.health.observe(true, Utc::now());
    stack.drainer.clone().drain_all().await;

    assert_eq!(stack.api.call_count(), 2);
    for member in &members {
        let size = stack
            .storage
            .queue_size(UserId(member.id.0))
            .await
            .unwrap();
        assert_eq!(size, 0);
    }
}

#[tokio::test]
async fn unauthorized_members_are_expired_and_notified() {
    let stack = stack(FakeTrakt::failing(401)).await;
    let (group, members) = group_with_members(&stack.storage, 2).await;

    let event = scrobble_event();
    let prepared =
        stack.coalescer.prepare(&event).await.unwrap().unwrap();
    let errors = stack
        .broadcaster
        .broadcast(
            &CancellationToken::new(),
            &members,
            request(&prepared, &event),
        )
        .await;
    stack.coalescer.commit(prepared).await;

    assert_eq!(errors.len(), 2);
    for error in &errors {
        assert!(!error.is_retryable());
        assert_eq!(error.http_status(), Some(401));
    }

    for member in &members {
        let reloaded = stack
            .storage
            .get_member(member.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            reloaded.authorization_status,
            AuthorizationStatus::Expired
        );
    }

    let notifications = stack
        .storage
        .get_notifications(group.id, false)
        .await
        .unwrap();
    assert_eq!(notifications.len(), 2);
    for notification in &notifications {
        assert_eq!(
            notification.notification_type,
            NotificationType::AuthorizationExpired
        );
    }
}

#[tokio::test]
async fn server_error_is_enqueued_as_a_retry_item() {
    // A member whose upstream answers 500 walks the durable retry path:
    // the failed dispatch lands in the retry queue with a fresh attempt
    // counter, due one base backoff out.
    let store = Arc::new(MemoryRetryStore::new());
    let api = Arc::new(FakeTrakt::failing(500));
    let storage: Arc<dyn Storage> = store.clone();
    let tuning = Tuning::default();
    let health = Arc::new(HealthController::new(
        Arc::new(StoredTokenProbe::new(api.clone(), storage.clone())),
        &tuning,
    ));
    let coalescer = EventCoalescer::new(storage.clone(), 90);
    let broadcaster = Broadcaster::new(
        api.clone(),
        storage.clone(),
        Notifier::new(storage.clone()),
        health,
        Arc::new(TelemetryRing::new(64)),
        Arc::new(FallbackBuffers::new(100)),
        Duration::from_secs(30),
        1000,
    );

    let group_id = GroupId::new();
    let members = vec![
        authorized_member(group_id, "alice"),
        authorized_member(group_id, "bob"),
    ];
    for member in &members {
        store.insert_member(member.clone());
    }

    let event = scrobble_event();
    let prepared = coalescer.prepare(&event).await.unwrap().unwrap();
    let errors = broadcaster
        .broadcast(
            &CancellationToken::new(),
            &members,
            request(&prepared, &event),
        )
        .await;
    coalescer.commit(prepared).await;

    assert_eq!(errors.len(), 2);
    for error in &errors {
        assert!(error.is_retryable());
        assert_eq!(error.http_status(), Some(500));
    }

    let items = store.list_retry_items(group_id).await.unwrap();
    assert_eq!(items.len(), 2);
    let mut owners: Vec<_> =
        items.iter().map(|item| item.group_member_id).collect();
    owners.sort();
    let mut expected: Vec<_> =
        members.iter().map(|member| member.id).collect();
    expected.sort();
    assert_eq!(owners, expected);
    for item in &items {
        assert_eq!(item.attempt_count, 0);
        assert_eq!(item.status, RetryStatus::Queued);
        let delay = item
            .next_attempt_at
            .signed_duration_since(Utc::now())
            .num_seconds();
        assert!(
            (25..=35).contains(&delay),
            "retry should be due in ~30s, got {delay}s"
        );
    }
}

#[tokio::test]
async fn retryable_failure_without_retry_queue_parks_per_user() {
    // The filesystem backend has no durable retry queue; a 429 falls back
    // to the per-user queue instead of being dropped.
    let stack = stack(FakeTrakt::failing(429)).await;
    let (_group, members) = group_with_members(&stack.storage, 2).await;

    let event = scrobble_event();
    let prepared =
        stack.coalescer.prepare(&event).await.unwrap().unwrap();
    let errors = stack
        .broadcaster
        .broadcast(
            &CancellationToken::new(),
            &members,
            request(&prepared, &event),
        )
        .await;
    stack.coalescer.commit(prepared).await;

    assert_eq!(errors.len(), 2);
    assert!(errors.iter().all(|e| e.is_retryable()));
    for member in &members {
        let size = stack
            .storage
            .queue_size(UserId(member.id.0))
            .await
            .unwrap();
        assert_eq!(size, 1);
    }
}
