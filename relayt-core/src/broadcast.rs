//! Fan-out of one coalesced scrobble to every authorized group member.
//!
//! Members are dispatched concurrently under one cancellation token; each
//! failure is classified into the closed retryable/terminal sets and turned
//! into its per-member effect after the fan-out settles.

use std::sync::Arc;

use chrono::Utc;
use futures::future::join_all;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use relayt_model::{
    GroupMember, MemberId, QueuedEvent, RetryItem, ScrobbleAction,
    ScrobbleBody, UserId,
};

use crate::error::BridgeError;
use crate::health::{HealthController, Mode};
use crate::notify::Notifier;
use crate::retry::RetryPayload;
use crate::storage::{FallbackBuffers, Storage};
use crate::telemetry::{TelemetryEvent, TelemetryOp, TelemetryRing};
use crate::trakt::{ScrobbleApi, TraktError};

/// One member's failed dispatch.
#[derive(Debug, Clone)]
pub struct BroadcastError {
    pub member_id: MemberId,
    pub member_label: String,
    pub error: TraktError,
    pub event_id: String,
    pub media_title: String,
}

impl BroadcastError {
    pub fn is_retryable(&self) -> bool {
        self.error.is_retryable()
    }

    pub fn http_status(&self) -> Option<u16> {
        self.error.http_status()
    }

    pub fn network_error(&self) -> Option<String> {
        match &self.error {
            TraktError::Network(message) => Some(message.clone()),
            TraktError::Canceled => Some("canceled".to_string()),
            _ => None,
        }
    }
}

/// Everything the broadcaster needs to know about one dispatch.
#[derive(Debug, Clone, Copy)]
pub struct BroadcastRequest<'a> {
    pub action: ScrobbleAction,
    pub body: &'a ScrobbleBody,
    pub event_id: &'a str,
    pub media_title: &'a str,
    pub player_id: &'a str,
    pub rating_key: &'a str,
}

pub struct Broadcaster {
    api: Arc<dyn ScrobbleApi>,
    storage: Arc<dyn Storage>,
    notifier: Notifier,
    health: Arc<HealthController>,
    telemetry: Arc<TelemetryRing>,
    fallback: Arc<FallbackBuffers>,
    base_backoff: chrono::Duration,
    queue_capacity: usize,
}

impl std::fmt::Debug for Broadcaster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Broadcaster")
            .field("queue_capacity", &self.queue_capacity)
            .finish_non_exhaustive()
    }
}

impl Broadcaster {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        api: Arc<dyn ScrobbleApi>,
        storage: Arc<dyn Storage>,
        notifier: Notifier,
        health: Arc<HealthController>,
        telemetry: Arc<TelemetryRing>,
        fallback: Arc<FallbackBuffers>,
        base_backoff: std::time::Duration,
        queue_capacity: usize,
    ) -> Self {
        Self {
            api,
            storage,
            notifier,
            health,
            telemetry,
            fallback,
            base_backoff: chrono::Duration::from_std(base_backoff)
                .unwrap_or_else(|_| chrono::Duration::seconds(30)),
            queue_capacity,
        }
    }

    /// Dispatch one scrobble to every given member.
    ///
    /// Returns the per-member failures; an empty member list yields an
    /// empty result with no side effects. In queue mode the direct calls
    /// are skipped and the event is parked per member instead.
    pub async fn broadcast(
        &self,
        cancel: &CancellationToken,
        members: &[GroupMember],
        request: BroadcastRequest<'_>,
    ) -> Vec<BroadcastError> {
        if members.is_empty() {
            return Vec::new();
        }

        if self.health.mode() == Mode::Queue {
            debug!(
                event_id = request.event_id,
                "Queue mode: parking event instead of broadcasting"
            );
            self.enqueue_for_members(members, request).await;
            return Vec::new();
        }

        let mut dispatchable = Vec::with_capacity(members.len());
        for member in members {
            if let Some(member) = self.fresh_member(member).await {
                dispatchable.push(member);
            }
        }

        let attempts = dispatchable.iter().map(|member| {
            let token = member.access_token.clone().unwrap_or_default();
            async move {
                let result = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => Err(TraktError::Canceled),
                    result = self.api.scrobble(
                        request.action,
                        request.body,
                        &token,
                    ) => result.map(|_| ()),
                };
                (member, result)
            }
        });

        // The fan-out settles first; effects run afterwards.
        let outcomes = join_all(attempts).await;

        let mut errors = Vec::new();
        for (member, result) in outcomes {
            match result {
                Ok(()) => {
                    debug!(
                        member = member.label(),
                        event_id = request.event_id,
                        "Scrobble delivered"
                    );
                    self.telemetry.record(
                        TelemetryEvent::now(TelemetryOp::Broadcast)
                            .user(UserId(member.id.0))
                            .event(request.event_id),
                    );
                }
                Err(error) => {
                    self.telemetry.record(
                        TelemetryEvent::now(TelemetryOp::Broadcast)
                            .user(UserId(member.id.0))
                            .event(request.event_id)
                            .error(error.to_string()),
                    );
                    let error = BroadcastError {
                        member_id: member.id,
                        member_label: member.label().to_string(),
                        error,
                        event_id: request.event_id.to_string(),
                        media_title: request.media_title.to_string(),
                    };
                    self.apply_failure_effects(&error, member, request)
                        .await;
                    errors.push(error);
                }
            }
        }

        errors
    }

    /// Per-failure effects, applied after the fan-out settles.
    async fn apply_failure_effects(
        &self,
        error: &BroadcastError,
        member: &GroupMember,
        request: BroadcastRequest<'_>,
    ) {
        match &error.error {
            // Cancellation surfaces to the caller and nothing else.
            TraktError::Canceled => {}
            e if e.is_retryable() => {
                self.enqueue_retry(member, request, e).await;
            }
            e if e.is_unauthorized() => {
                warn!(
                    member = error.member_label,
                    "Credentials rejected, marking member expired"
                );
                if let Err(e) = self
                    .storage
                    .set_member_status(
                        member.id,
                        relayt_model::AuthorizationStatus::Expired,
                    )
                    .await
                {
                    warn!("Failed to mark member expired: {e}");
                }
                self.notifier
                    .authorization_expired(member.family_group_id, member)
                    .await;
            }
            e => {
                warn!(
                    member = error.member_label,
                    event_id = request.event_id,
                    "Terminal upstream failure, not retrying: {e}"
                );
            }
        }
    }

    async fn enqueue_retry(
        &self,
        member: &GroupMember,
        request: BroadcastRequest<'_>,
        error: &TraktError,
    ) {
        let payload = RetryPayload {
            action: request.action,
            body: request.body.clone(),
            media_title: request.media_title.to_string(),
        };
        let payload = match serde_json::to_value(&payload) {
            Ok(payload) => payload,
            Err(e) => {
                warn!("Failed to encode retry payload: {e}");
                return;
            }
        };
        let mut item = RetryItem::new(
            member.family_group_id,
            member.id,
            payload,
            Utc::now() + self.base_backoff,
        );
        item.last_error = Some(error.to_string());

        match self.storage.enqueue_retry_item(&item).await {
            Ok(()) => {
                info!(
                    member = member.label(),
                    event_id = request.event_id,
                    "Queued scrobble for retry"
                );
                self.telemetry.record(
                    TelemetryEvent::now(TelemetryOp::RetryAttempt)
                        .user(UserId(member.id.0))
                        .event(request.event_id)
                        .retries(0)
                        .error(error.to_string()),
                );
            }
            Err(BridgeError::Unsupported(_)) => {
                // No durable retry queue on this backend: the per-user
                // queue is the only parking lot available.
                debug!(
                    member = member.label(),
                    "Backend lacks a retry queue, parking per-user instead"
                );
                self.persist_queued(QueuedEvent::new(
                    UserId(member.id.0),
                    request.action,
                    request.body.clone(),
                    request.player_id,
                    request.rating_key,
                ))
                .await;
            }
            Err(e) => {
                warn!("Failed to enqueue retry item: {e}");
            }
        }
    }

    async fn enqueue_for_members(
        &self,
        members: &[GroupMember],
        request: BroadcastRequest<'_>,
    ) {
        for member in members {
            if !member.is_dispatchable() {
                continue;
            }
            self.persist_queued(QueuedEvent::new(
                UserId(member.id.0),
                request.action,
                request.body.clone(),
                request.player_id,
                request.rating_key,
            ))
            .await;
        }
    }

    /// Persist one queued event, falling back to the in-process ring when
    /// the primary store refuses the write.
    async fn persist_queued(&self, event: QueuedEvent) {
        let user_id = event.user_id;
        match self
            .storage
            .enqueue_scrobble(&event, self.queue_capacity)
            .await
        {
            Ok(()) => {
                self.telemetry.record(
                    TelemetryEvent::now(TelemetryOp::QueueEnqueue)
                        .user(user_id)
                        .event(event.id.to_string()),
                );
                self.flush_fallback(user_id).await;
            }
            Err(e) => {
                warn!(%user_id, "Queue write failed, buffering in process: {e}");
                self.telemetry.record(
                    TelemetryEvent::now(TelemetryOp::FallbackPush)
                        .user(user_id)
                        .error(e.to_string()),
                );
                self.fallback.push(event);
            }
        }
    }

    /// After a successful write, replay anything the fallback ring holds
    /// for this user.
    async fn flush_fallback(&self, user_id: UserId) {
        let parked = self.fallback.drain(user_id);
        if parked.is_empty() {
            return;
        }
        info!(
            %user_id,
            count = parked.len(),
            "Flushing fallback buffer into primary storage"
        );
        let mut remaining = parked.into_iter();
        while let Some(event) = remaining.next() {
            if let Err(e) = self
                .storage
                .enqueue_scrobble(&event, self.queue_capacity)
                .await
            {
                warn!(%user_id, "Fallback flush interrupted: {e}");
                self.fallback.push(event);
                for event in remaining {
                    self.fallback.push(event);
                }
                return;
            }
        }
    }

    /// Produce a member with a usable token, refreshing when the stored
    /// one has lapsed. `None` means the member is skipped this broadcast.
    async fn fresh_member(
        &self,
        member: &GroupMember,
    ) -> Option<GroupMember> {
        if !member.is_dispatchable() {
            return None;
        }
        if !member.token_needs_refresh() {
            return Some(member.clone());
        }

        let refresh_token = member.refresh_token.clone()?;
        match self.api.refresh_token(&refresh_token).await {
            Ok(grant) => {
                let mut updated = member.clone();
                updated.access_token = Some(grant.access_token.clone());
                updated.refresh_token = Some(grant.refresh_token.clone());
                updated.token_expiry = Some(grant.expiry());
                if let Err(e) = self.storage.upsert_member(&updated).await {
                    warn!("Failed to persist refreshed tokens: {e}");
                }
                Some(updated)
            }
            Err(TraktError::OAuth { error, .. }) => {
                warn!(
                    member = member.label(),
                    error, "Refresh rejected, marking member failed"
                );
                if let Err(e) = self
                    .storage
                    .set_member_status(
                        member.id,
                        relayt_model::AuthorizationStatus::Failed,
                    )
                    .await
                {
                    warn!("Failed to mark member failed: {e}");
                }
                None
            }
            Err(e) => {
                // Transient refresh trouble: try the stale token, the
                // scrobble outcome will classify it.
                debug!(
                    member = member.label(),
                    "Token refresh failed transiently: {e}"
                );
                Some(member.clone())
            }
        }
    }
}
