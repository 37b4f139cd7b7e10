//! Durable at-least-once delivery for broadcast failures.
//!
//! Workers tick on a fixed interval, lease due items through the storage
//! layer's atomic `FOR UPDATE SKIP LOCKED` batch, and either deliver,
//! reschedule with exponential backoff, or finalize with an owner-facing
//! notification once the attempt ceiling is hit. Any number of workers may
//! run; exclusivity lives entirely in the lease.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use relayt_config::Tuning;
use relayt_model::{
    AuthorizationStatus, GroupMember, RetryItem, ScrobbleAction,
    ScrobbleBody, UserId,
};

use crate::notify::Notifier;
use crate::storage::Storage;
use crate::telemetry::{TelemetryEvent, TelemetryOp, TelemetryRing};
use crate::trakt::{ScrobbleApi, TraktError};

/// The opaque JSON stored in a retry row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPayload {
    pub action: ScrobbleAction,
    pub body: ScrobbleBody,
    #[serde(default)]
    pub media_title: String,
}

pub struct RetryEngine {
    storage: Arc<dyn Storage>,
    api: Arc<dyn ScrobbleApi>,
    notifier: Notifier,
    telemetry: Arc<TelemetryRing>,
    poll_interval: Duration,
    batch: i64,
    base_backoff: Duration,
    backoff_ceiling: Duration,
    max_attempts: i32,
}

impl std::fmt::Debug for RetryEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryEngine")
            .field("poll_interval", &self.poll_interval)
            .field("batch", &self.batch)
            .finish_non_exhaustive()
    }
}

impl RetryEngine {
    pub fn new(
        storage: Arc<dyn Storage>,
        api: Arc<dyn ScrobbleApi>,
        notifier: Notifier,
        telemetry: Arc<TelemetryRing>,
        tuning: &Tuning,
    ) -> Self {
        Self {
            storage,
            api,
            notifier,
            telemetry,
            poll_interval: tuning.retry_poll_interval,
            batch: tuning.retry_batch,
            base_backoff: tuning.base_backoff,
            backoff_ceiling: tuning.backoff_ceiling,
            max_attempts: tuning.max_attempts,
        }
    }

    /// Exponential backoff: `min(BASE * 2^(n-1), CEILING)`, with
    /// `backoff(0) = BASE`.
    pub fn backoff(&self, attempt: i32) -> Duration {
        if attempt <= 1 {
            return self.base_backoff;
        }
        let doubled = self
            .base_backoff
            .saturating_mul(2u32.saturating_pow((attempt - 1) as u32));
        doubled.min(self.backoff_ceiling)
    }

    /// Worker loop. Exits cleanly on cancellation; in-flight leases stay
    /// `retrying` and come back on their next due time.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        if !self.storage.supports_retry_queue() {
            error!(
                "Storage backend does not support the retry queue; worker not started"
            );
            return;
        }
        info!(
            interval_secs = self.poll_interval.as_secs(),
            batch = self.batch,
            "Retry worker started"
        );
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker
            .set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Retry worker stopping");
                    return;
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.tick().await {
                        // Persistence failures on the retry path never
                        // kill the loop.
                        warn!("Retry tick failed: {e}");
                    }
                }
            }
        }
    }

    /// One lease-and-process pass. Public for tests and for a drain on
    /// demand.
    pub async fn tick(&self) -> crate::error::Result<()> {
        let due = self
            .storage
            .lease_due_retry_items(Utc::now(), self.batch)
            .await?;
        if due.is_empty() {
            return Ok(());
        }
        debug!(count = due.len(), "Leased due retry items");
        for item in due {
            self.process_item(item).await;
        }
        Ok(())
    }

    async fn process_item(&self, item: RetryItem) {
        let member = match self.storage.get_member(item.group_member_id).await
        {
            Ok(Some(member)) => member,
            Ok(None) => {
                warn!(item = %item.id, "Member gone, finalizing retry item");
                self.finalize_without_notification(&item, "member not found")
                    .await;
                return;
            }
            Err(e) => {
                // Leave the row leased; it re-leases at its due time.
                warn!(item = %item.id, "Could not resolve member: {e}");
                return;
            }
        };

        let payload: RetryPayload =
            match serde_json::from_value(item.payload.clone()) {
                Ok(payload) => payload,
                Err(e) => {
                    warn!(item = %item.id, "Undecodable payload: {e}");
                    self.finalize_without_notification(
                        &item,
                        "invalid payload",
                    )
                    .await;
                    return;
                }
            };

        let Some(token) = self.usable_token(&member).await else {
            self.finalize_without_notification(&item, "member not authorized")
                .await;
            return;
        };

        match self
            .api
            .scrobble(payload.action, &payload.body, &token)
            .await
        {
            Ok(_) => {
                info!(
                    item = %item.id,
                    member = member.label(),
                    attempt = item.attempt_count,
                    "Retry delivered"
                );
                self.telemetry.record(
                    TelemetryEvent::now(TelemetryOp::RetryAttempt)
                        .user(UserId(member.id.0))
                        .event(item.id.to_string())
                        .retries(item.attempt_count),
                );
                if let Err(e) =
                    self.storage.mark_retry_success(item.id).await
                {
                    warn!("Failed to delete delivered retry item: {e}");
                }
            }
            Err(error) => {
                self.handle_failure(&item, &member, &payload, &error).await;
            }
        }
    }

    async fn handle_failure(
        &self,
        item: &RetryItem,
        member: &GroupMember,
        payload: &RetryPayload,
        error: &TraktError,
    ) {
        let next_attempt = item.attempt_count + 1;
        if next_attempt >= self.max_attempts {
            warn!(
                item = %item.id,
                member = member.label(),
                attempts = next_attempt,
                "Attempts exhausted, finalizing as permanent failure"
            );
            if let Err(e) = self
                .storage
                .mark_retry_failure(
                    item.id,
                    self.max_attempts,
                    Utc::now(),
                    &error.to_string(),
                    true,
                )
                .await
            {
                warn!("Failed to finalize retry item: {e}");
            }
            self.telemetry.record(
                TelemetryEvent::now(TelemetryOp::RetryExhausted)
                    .user(UserId(member.id.0))
                    .event(item.id.to_string())
                    .retries(self.max_attempts)
                    .error(error.to_string()),
            );
            let title = if payload.media_title.is_empty() {
                payload.body.display_title()
            } else {
                payload.media_title.clone()
            };
            self.notifier
                .permanent_failure(
                    item.family_group_id,
                    member,
                    &title,
                    &error.to_string(),
                )
                .await;
            return;
        }

        let next_at =
            Utc::now() + chrono::Duration::from_std(self.backoff(next_attempt))
                .unwrap_or_else(|_| chrono::Duration::seconds(30));
        debug!(
            item = %item.id,
            attempt = next_attempt,
            next_at = %next_at,
            "Rescheduling retry"
        );
        if let Err(e) = self
            .storage
            .mark_retry_failure(
                item.id,
                next_attempt,
                next_at,
                &error.to_string(),
                false,
            )
            .await
        {
            warn!("Failed to reschedule retry item: {e}");
        }
        self.telemetry.record(
            TelemetryEvent::now(TelemetryOp::RetryAttempt)
                .user(UserId(member.id.0))
                .event(item.id.to_string())
                .retries(next_attempt)
                .error(error.to_string()),
        );
    }

    /// Finalize an undeliverable row. These are operational dead ends, not
    /// upstream outages, so no owner banner is raised.
    async fn finalize_without_notification(
        &self,
        item: &RetryItem,
        reason: &str,
    ) {
        if let Err(e) = self
            .storage
            .mark_retry_failure(
                item.id,
                self.max_attempts,
                Utc::now(),
                reason,
                true,
            )
            .await
        {
            warn!("Failed to finalize retry item: {e}");
        }
    }

    async fn usable_token(&self, member: &GroupMember) -> Option<String> {
        if !member.is_dispatchable() {
            return None;
        }
        if !member.token_needs_refresh() {
            return member.access_token.clone();
        }
        let refresh_token = member.refresh_token.clone()?;
        match self.api.refresh_token(&refresh_token).await {
            Ok(grant) => {
                let mut updated = member.clone();
                updated.access_token = Some(grant.access_token.clone());
                updated.token_expiry = Some(grant.expiry());
                updated.refresh_token = Some(grant.refresh_token);
                if let Err(e) = self.storage.upsert_member(&updated).await {
                    warn!("Failed to persist refreshed tokens: {e}");
                }
                Some(grant.access_token)
            }
            Err(TraktError::OAuth { error, .. }) => {
                warn!(
                    member = member.label(),
                    error, "Refresh rejected, marking member failed"
                );
                if let Err(e) = self
                    .storage
                    .set_member_status(member.id, AuthorizationStatus::Failed)
                    .await
                {
                    warn!("Failed to mark member failed: {e}");
                }
                None
            }
            Err(_) => member.access_token.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relayt_config::Tuning;

    fn engine_with(tuning: &Tuning) -> RetryEngine {
        let storage = Arc::new(crate::storage::MockStorage::new());
        let api = Arc::new(crate::trakt::MockScrobbleApi::new());
        let notifier = Notifier::new(storage.clone());
        RetryEngine::new(
            storage,
            api,
            notifier,
            Arc::new(TelemetryRing::new(16)),
            tuning,
        )
    }

    #[test]
    fn backoff_doubles_up_to_the_ceiling() {
        let engine = engine_with(&Tuning::default());
        assert_eq!(engine.backoff(0), Duration::from_secs(30));
        assert_eq!(engine.backoff(1), Duration::from_secs(30));
        assert_eq!(engine.backoff(2), Duration::from_secs(60));
        assert_eq!(engine.backoff(3), Duration::from_secs(120));
        assert_eq!(engine.backoff(4), Duration::from_secs(240));
        assert_eq!(engine.backoff(5), Duration::from_secs(480));
        // Monotonic up to the ceiling, constant afterwards.
        assert_eq!(engine.backoff(7), Duration::from_secs(1800));
        assert_eq!(engine.backoff(30), Duration::from_secs(1800));
    }

    #[test]
    fn backoff_respects_custom_tuning() {
        let tuning = Tuning {
            base_backoff: Duration::from_secs(10),
            backoff_ceiling: Duration::from_secs(60),
            ..Tuning::default()
        };
        let engine = engine_with(&tuning);
        assert_eq!(engine.backoff(1), Duration::from_secs(10));
        assert_eq!(engine.backoff(3), Duration::from_secs(40));
        assert_eq!(engine.backoff(4), Duration::from_secs(60));
    }

    #[test]
    fn payload_round_trips() {
        let payload = RetryPayload {
            action: ScrobbleAction::Stop,
            body: ScrobbleBody {
                progress: 96,
                ..ScrobbleBody::default()
            },
            media_title: "The Matrix".into(),
        };
        let value = serde_json::to_value(&payload).unwrap();
        let back: RetryPayload = serde_json::from_value(value).unwrap();
        assert_eq!(back.action, ScrobbleAction::Stop);
        assert_eq!(back.body.progress, 96);
    }
}
