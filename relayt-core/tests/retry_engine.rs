//! Retry engine behaviour against an in-memory retry-capable store.

mod support;

use std::sync::Arc;

use chrono::Utc;

use relayt_config::Tuning;
use relayt_core::{
    Notifier, RetryEngine, RetryPayload, Storage, TelemetryRing,
};
use relayt_model::{
    GroupId, MemberId, NotificationType, RetryItem, RetryStatus,
    ScrobbleAction, ScrobbleBody,
};

use support::{FakeTrakt, MemoryRetryStore, authorized_member};

fn payload() -> serde_json::Value {
    serde_json::to_value(RetryPayload {
        action: ScrobbleAction::Stop,
        body: ScrobbleBody {
            progress: 96,
            ..ScrobbleBody::default()
        },
        media_title: "The Matrix".into(),
    })
    .unwrap()
}

struct Harness {
    store: Arc<MemoryRetryStore>,
    api: Arc<FakeTrakt>,
    engine: RetryEngine,
}

fn harness(api: FakeTrakt) -> Harness {
    let store = Arc::new(MemoryRetryStore::new());
    let api = Arc::new(api);
    let storage: Arc<dyn Storage> = store.clone();
    let engine = RetryEngine::new(
        storage.clone(),
        api.clone(),
        Notifier::new(storage),
        Arc::new(TelemetryRing::new(64)),
        &Tuning::default(),
    );
    Harness { store, api, engine }
}

fn seeded_item(store: &MemoryRetryStore) -> RetryItem {
    let group = GroupId::new();
    let member = authorized_member(group, "alice");
    let member_id = member.id;
    store.insert_member(member);
    let item = RetryItem::new(
        group,
        member_id,
        payload(),
        Utc::now() - chrono::Duration::seconds(1),
    );
    store.insert_item(item.clone());
    item
}

#[tokio::test]
async fn delivered_item_is_deleted() {
    let harness = harness(FakeTrakt::healthy());
    seeded_item(&harness.store);

    harness.engine.tick().await.unwrap();

    assert_eq!(harness.api.call_count(), 1);
    assert_eq!(harness.store.item_count(), 0);
    assert!(harness.store.notifications().is_empty());
}

#[tokio::test]
async fn failure_walks_the_backoff_schedule_then_finalizes() {
    let harness = harness(FakeTrakt::failing(500));
    let item = seeded_item(&harness.store);

    // Four failed attempts: 30s, 60s, 2m, 4m.
    let expected_delays = [30i64, 60, 120, 240];
    for (i, expected) in expected_delays.iter().enumerate() {
        harness.store.force_due();
        harness.engine.tick().await.unwrap();

        let current = harness.store.item(item.id).unwrap();
        assert_eq!(current.attempt_count, i as i32 + 1);
        assert_eq!(current.status, RetryStatus::Queued);
        let delay = current
            .next_attempt_at
            .signed_duration_since(Utc::now())
            .num_seconds();
        assert!(
            (delay - expected).abs() <= 2,
            "attempt {} should be due in ~{expected}s, got {delay}s",
            i + 1
        );
    }

    // The fifth failure exhausts the ceiling.
    harness.store.force_due();
    harness.engine.tick().await.unwrap();

    let finalized = harness.store.item(item.id).unwrap();
    assert_eq!(finalized.status, RetryStatus::PermanentFailure);
    assert_eq!(finalized.attempt_count, 5);

    let notifications = harness.store.notifications();
    assert_eq!(notifications.len(), 1);
    assert_eq!(
        notifications[0].notification_type,
        NotificationType::PermanentFailure
    );
    assert_eq!(notifications[0].family_group_id, item.family_group_id);
    assert_eq!(
        notifications[0].group_member_id,
        Some(item.group_member_id)
    );

    // Finalized rows are never leased again.
    let calls_before = harness.api.call_count();
    harness.store.force_due();
    harness.engine.tick().await.unwrap();
    assert_eq!(harness.api.call_count(), calls_before);
}

#[tokio::test]
async fn transient_failure_recovers_on_the_next_attempt() {
    let api = FakeTrakt::healthy();
    api.script(Err(relayt_core::TraktError::Status { code: 503 }));
    let harness = harness(api);
    let item = seeded_item(&harness.store);

    harness.engine.tick().await.unwrap();
    let current = harness.store.item(item.id).unwrap();
    assert_eq!(current.attempt_count, 1);
    assert_eq!(current.status, RetryStatus::Queued);

    harness.store.force_due();
    harness.engine.tick().await.unwrap();
    assert_eq!(harness.store.item_count(), 0);
    assert_eq!(harness.api.call_count(), 2);
}

#[tokio::test]
async fn missing_member_finalizes_without_a_banner() {
    let harness = harness(FakeTrakt::healthy());
    let item = RetryItem::new(
        GroupId::new(),
        MemberId::new(),
        payload(),
        Utc::now() - chrono::Duration::seconds(1),
    );
    harness.store.insert_item(item.clone());

    harness.engine.tick().await.unwrap();

    let finalized = harness.store.item(item.id).unwrap();
    assert_eq!(finalized.status, RetryStatus::PermanentFailure);
    assert_eq!(finalized.last_error.as_deref(), Some("member not found"));
    assert_eq!(harness.api.call_count(), 0);
    assert!(harness.store.notifications().is_empty());
}

#[tokio::test]
async fn undecodable_payload_finalizes_without_dispatch() {
    let harness = harness(FakeTrakt::healthy());
    let group = GroupId::new();
    let member = authorized_member(group, "bob");
    let member_id = member.id;
    harness.store.insert_member(member);

    let item = RetryItem::new(
        group,
        member_id,
        serde_json::json!("not a scrobble"),
        Utc::now() - chrono::Duration::seconds(1),
    );
    harness.store.insert_item(item.clone());

    harness.engine.tick().await.unwrap();

    let finalized = harness.store.item(item.id).unwrap();
    assert_eq!(finalized.status, RetryStatus::PermanentFailure);
    assert_eq!(finalized.last_error.as_deref(), Some("invalid payload"));
    assert_eq!(harness.api.call_count(), 0);
}

#[tokio::test]
async fn retrying_rows_left_by_a_crash_are_releasable() {
    // A worker that crashed mid-flight leaves its row `retrying`; the
    // lease predicate picks it back up once due.
    let harness = harness(FakeTrakt::healthy());
    let item = seeded_item(&harness.store);
    {
        let mut items = harness.store.items.lock().unwrap();
        let row = items.get_mut(&item.id).unwrap();
        row.status = RetryStatus::Retrying;
        row.next_attempt_at = Utc::now() - chrono::Duration::minutes(5);
    }

    harness.engine.tick().await.unwrap();
    assert_eq!(harness.api.call_count(), 1);
    assert_eq!(harness.store.item_count(), 0);
}
