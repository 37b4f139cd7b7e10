//! Replay of per-user queues after the upstream comes back.
//!
//! A supervisor watches the mode channel; on every transition back to live
//! it spawns one drainer per user holding queued events. Users drain
//! independently of each other; within one user the order is strictly
//! oldest-first.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use dashmap::DashMap;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use relayt_model::{MemberId, QueuedEvent, UserId};

use crate::health::{HealthController, Mode};
use crate::storage::Storage;
use crate::telemetry::{TelemetryEvent, TelemetryOp, TelemetryRing};
use crate::trakt::{ScrobbleApi, TraktError};

/// Ceiling on per-event redelivery attempts during drains.
const MAX_DRAIN_RETRIES: i32 = 5;

/// Counters one drainer maintains for its user.
#[derive(Debug, Default)]
struct Counters {
    processed: AtomicU64,
    failed: AtomicU64,
}

/// Snapshot of one user's drain progress for the admin surface.
#[derive(Debug, Clone, Serialize)]
pub struct QueueStatus {
    pub user_id: UserId,
    pub events_processed: u64,
    pub events_failed: u64,
}

pub struct DrainSupervisor {
    storage: Arc<dyn Storage>,
    api: Arc<dyn ScrobbleApi>,
    telemetry: Arc<TelemetryRing>,
    batch: i64,
    counters: DashMap<UserId, Arc<Counters>>,
}

impl std::fmt::Debug for DrainSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DrainSupervisor")
            .field("batch", &self.batch)
            .finish_non_exhaustive()
    }
}

impl DrainSupervisor {
    pub fn new(
        storage: Arc<dyn Storage>,
        api: Arc<dyn ScrobbleApi>,
        telemetry: Arc<TelemetryRing>,
        batch: i64,
    ) -> Self {
        Self {
            storage,
            api,
            telemetry,
            batch,
            counters: DashMap::new(),
        }
    }

    /// Watch mode transitions and drain on every return to live. Also
    /// drains once at startup to pick up queues left over from a restart.
    pub async fn run(
        self: Arc<Self>,
        health: Arc<HealthController>,
        cancel: CancellationToken,
    ) {
        let mut rx = health.subscribe();
        if health.mode() == Mode::Live {
            self.clone().drain_all().await;
        }
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Drain supervisor stopping");
                    return;
                }
                changed = rx.changed() => {
                    if changed.is_err() {
                        return;
                    }
                    let mode = *rx.borrow_and_update();
                    if mode == Mode::Live {
                        self.clone().drain_all().await;
                    }
                }
            }
        }
    }

    /// Spawn one drainer per user with pending events and wait for all of
    /// them. Users are independent; failures in one do not stall another.
    pub async fn drain_all(self: Arc<Self>) {
        let users = match self.storage.users_with_queued_events().await {
            Ok(users) => users,
            Err(e) => {
                warn!("Could not list queued users: {e}");
                return;
            }
        };
        if users.is_empty() {
            return;
        }
        info!(users = users.len(), "Draining per-user queues");

        let handles: Vec<_> = users
            .into_iter()
            .map(|user_id| {
                let supervisor = self.clone();
                tokio::spawn(async move {
                    supervisor.drain_user(user_id).await;
                })
            })
            .collect();
        for handle in handles {
            let _ = handle.await;
        }
    }

    /// Drain one user's queue strictly oldest-first.
    pub async fn drain_user(&self, user_id: UserId) {
        let counters = self
            .counters
            .entry(user_id)
            .or_insert_with(|| Arc::new(Counters::default()))
            .clone();

        let Some(token) = self.resolve_token(user_id).await else {
            warn!(%user_id, "No usable credentials, purging queue");
            if let Err(e) = self.storage.purge_queue_for_user(user_id).await {
                warn!("Failed to purge queue: {e}");
            }
            return;
        };

        loop {
            let events = match self
                .storage
                .dequeue_oldest(user_id, self.batch)
                .await
            {
                Ok(events) => events,
                Err(e) => {
                    warn!(%user_id, "Dequeue failed, stopping drain: {e}");
                    return;
                }
            };
            if events.is_empty() {
                debug!(%user_id, "Queue drained");
                return;
            }

            for event in events {
                if !self.deliver(&event, &token, &counters).await {
                    // Upstream went away again; leave the rest queued.
                    return;
                }
            }
        }
    }

    /// Deliver one queued event. Returns `false` when the drain should
    /// stop for this user.
    async fn deliver(
        &self,
        event: &QueuedEvent,
        token: &str,
        counters: &Counters,
    ) -> bool {
        match self
            .api
            .scrobble(event.action, &event.scrobble_body, token)
            .await
        {
            Ok(_) => {
                counters.processed.fetch_add(1, Ordering::Relaxed);
                self.telemetry.record(
                    TelemetryEvent::now(TelemetryOp::QueueDrain)
                        .user(event.user_id)
                        .event(event.id.to_string())
                        .retries(event.retry_count),
                );
                if let Err(e) =
                    self.storage.delete_queued_scrobble(event.id).await
                {
                    warn!("Failed to delete drained event: {e}");
                }
                true
            }
            Err(error) if error.is_retryable() => {
                let next_count = event.retry_count + 1;
                if next_count > MAX_DRAIN_RETRIES {
                    warn!(
                        event = %event.id,
                        "Drain retries exhausted, dropping event"
                    );
                    counters.failed.fetch_add(1, Ordering::Relaxed);
                    self.record_failure(event, &error);
                    if let Err(e) =
                        self.storage.delete_queued_scrobble(event.id).await
                    {
                        warn!("Failed to drop exhausted event: {e}");
                    }
                    return true;
                }
                debug!(
                    event = %event.id,
                    retry = next_count,
                    "Transient drain failure, backing off"
                );
                if let Err(e) = self
                    .storage
                    .update_retry_count(event.id, next_count, Utc::now())
                    .await
                {
                    warn!("Failed to bump retry count: {e}");
                }
                false
            }
            Err(error) => {
                warn!(
                    event = %event.id,
                    "Terminal drain failure, dropping event: {error}"
                );
                counters.failed.fetch_add(1, Ordering::Relaxed);
                self.record_failure(event, &error);
                if let Err(e) =
                    self.storage.delete_queued_scrobble(event.id).await
                {
                    warn!("Failed to drop undeliverable event: {e}");
                }
                true
            }
        }
    }

    fn record_failure(&self, event: &QueuedEvent, error: &TraktError) {
        self.telemetry.record(
            TelemetryEvent::now(TelemetryOp::QueueDrain)
                .user(event.user_id)
                .event(event.id.to_string())
                .retries(event.retry_count)
                .error(error.to_string()),
        );
    }

    /// The queue owner is either an onboarded user or a group member;
    /// resolve whichever exists and hand back a current access token.
    async fn resolve_token(&self, user_id: UserId) -> Option<String> {
        match self.storage.get_user(user_id).await {
            Ok(Some(user)) => {
                if !user.token_needs_refresh() {
                    return Some(user.access_token);
                }
                match self.api.refresh_token(&user.refresh_token).await {
                    Ok(grant) => {
                        let mut updated = user;
                        updated.access_token = grant.access_token.clone();
                        updated.token_expiry = grant.expiry();
                        updated.refresh_token = grant.refresh_token;
                        if let Err(e) =
                            self.storage.write_user(&updated).await
                        {
                            warn!("Failed to persist refreshed tokens: {e}");
                        }
                        return Some(grant.access_token);
                    }
                    Err(e) => {
                        warn!("User token refresh failed: {e}");
                        return Some(user.access_token);
                    }
                }
            }
            Ok(None) => {}
            Err(e) => {
                warn!("Could not load queue owner: {e}");
                return None;
            }
        }

        match self.storage.get_member(MemberId(user_id.0)).await {
            Ok(Some(member)) if member.is_dispatchable() => {
                member.access_token
            }
            Ok(_) => None,
            Err(e) => {
                warn!("Could not load queue owner: {e}");
                None
            }
        }
    }

    /// Per-user drain counters, for the admin surface.
    pub fn status(&self) -> Vec<QueueStatus> {
        self.counters
            .iter()
            .map(|entry| QueueStatus {
                user_id: *entry.key(),
                events_processed: entry.value().processed.load(Ordering::Relaxed),
                events_failed: entry.value().failed.load(Ordering::Relaxed),
            })
            .collect()
    }
}
