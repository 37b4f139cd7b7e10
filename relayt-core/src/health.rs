use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use relayt_config::Tuning;

use crate::storage::Storage;
use crate::trakt::ScrobbleApi;

/// Process-wide availability mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    /// Upstream reachable: broadcast directly.
    Live,
    /// Upstream down: park events in the per-user queues.
    Queue,
}

/// Snapshot of the controller's state.
#[derive(Debug, Clone, Serialize)]
pub struct HealthState {
    pub mode: Mode,
    pub downtime_since: Option<DateTime<Utc>>,
    pub next_check_at: DateTime<Utc>,
    pub consecutive_failures: u32,
    #[serde(with = "serde_secs")]
    pub check_interval: Duration,
}

mod serde_secs {
    use std::time::Duration;

    use serde::Serializer;

    pub fn serialize<S: Serializer>(
        duration: &Duration,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(duration.as_secs())
    }
}

/// One upstream availability check.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    /// `true` when the upstream answered 2xx/3xx within the deadline.
    async fn check(&self) -> bool;
}

/// Probes `GET /users/settings` with the freshest stored user token.
///
/// With no onboarded users there is nothing to scrobble either, so the
/// probe reports healthy rather than flapping the mode.
pub struct StoredTokenProbe {
    api: Arc<dyn ScrobbleApi>,
    storage: Arc<dyn Storage>,
}

impl StoredTokenProbe {
    pub fn new(api: Arc<dyn ScrobbleApi>, storage: Arc<dyn Storage>) -> Self {
        Self { api, storage }
    }
}

impl std::fmt::Debug for StoredTokenProbe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoredTokenProbe").finish_non_exhaustive()
    }
}

#[async_trait]
impl HealthProbe for StoredTokenProbe {
    async fn check(&self) -> bool {
        let token = match self.storage.list_users().await {
            Ok(users) => users.into_iter().next().map(|u| u.access_token),
            Err(e) => {
                warn!("Probe could not load a user token: {e}");
                None
            }
        };
        let Some(token) = token else {
            debug!("No stored tokens; skipping upstream probe");
            return true;
        };
        match self.api.user_settings(&token).await {
            Ok(_) => true,
            Err(e) => {
                debug!("Upstream probe failed: {e}");
                false
            }
        }
    }
}

/// Adaptive probe loop toggling the process between live and queue mode.
///
/// The watch channel is advisory and lossy; consumers read the controller's
/// state for the authoritative mode.
pub struct HealthController {
    state: RwLock<HealthState>,
    probe: Arc<dyn HealthProbe>,
    tx: watch::Sender<Mode>,
    short_interval: Duration,
    long_interval: Duration,
    extended_threshold: Duration,
}

impl std::fmt::Debug for HealthController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthController")
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl HealthController {
    pub fn new(probe: Arc<dyn HealthProbe>, tuning: &Tuning) -> Self {
        let (tx, _rx) = watch::channel(Mode::Live);
        Self {
            state: RwLock::new(HealthState {
                mode: Mode::Live,
                downtime_since: None,
                next_check_at: Utc::now()
                    + chrono::Duration::from_std(
                        tuning.health_short_interval,
                    )
                    .unwrap_or_else(|_| chrono::Duration::zero()),
                consecutive_failures: 0,
                check_interval: tuning.health_short_interval,
            }),
            probe,
            tx,
            short_interval: tuning.health_short_interval,
            long_interval: tuning.health_long_interval,
            extended_threshold: tuning.health_extended_threshold,
        }
    }

    /// Authoritative mode, read under the state lock.
    pub fn mode(&self) -> Mode {
        self.state.read().expect("health state poisoned").mode
    }

    pub fn state(&self) -> HealthState {
        self.state.read().expect("health state poisoned").clone()
    }

    /// Advisory mode transitions. Missed values are fine; re-read
    /// [`HealthController::mode`] on wake.
    pub fn subscribe(&self) -> watch::Receiver<Mode> {
        self.tx.subscribe()
    }

    /// Drive probes until cancelled. The ticker is re-armed with the
    /// current `check_interval` after every probe.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        info!("Health controller started in live mode");
        loop {
            let interval = self
                .state
                .read()
                .expect("health state poisoned")
                .check_interval;
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Health controller stopping");
                    return;
                }
                _ = tokio::time::sleep(interval) => {
                    let healthy = self.probe.check().await;
                    self.observe(healthy, Utc::now());
                }
            }
        }
    }

    /// Apply one probe result to the state machine.
    pub fn observe(&self, healthy: bool, now: DateTime<Utc>) -> Mode {
        let mut state = self.state.write().expect("health state poisoned");
        match (healthy, state.mode) {
            (true, Mode::Queue) => {
                info!("Upstream recovered, switching to live mode");
                state.mode = Mode::Live;
                state.downtime_since = None;
                state.consecutive_failures = 0;
                state.check_interval = self.short_interval;
                self.tx.send_replace(Mode::Live);
            }
            (true, Mode::Live) => {
                state.consecutive_failures = 0;
            }
            (false, Mode::Live) => {
                warn!("Upstream unreachable, switching to queue mode");
                state.mode = Mode::Queue;
                state.downtime_since = Some(now);
                state.consecutive_failures = 1;
                state.check_interval = self.short_interval;
                self.tx.send_replace(Mode::Queue);
            }
            (false, Mode::Queue) => {
                state.consecutive_failures += 1;
                let downtime = state
                    .downtime_since
                    .map(|since| now.signed_duration_since(since))
                    .unwrap_or_else(chrono::Duration::zero);
                let extended = chrono::Duration::from_std(
                    self.extended_threshold,
                )
                .unwrap_or_else(|_| chrono::Duration::zero());
                if downtime >= extended {
                    if state.check_interval != self.long_interval {
                        warn!(
                            failures = state.consecutive_failures,
                            "Extended outage, widening probe interval"
                        );
                    }
                    state.check_interval = self.long_interval;
                } else {
                    state.check_interval = self.short_interval;
                }
            }
        }
        state.next_check_at = now
            + chrono::Duration::from_std(state.check_interval)
                .unwrap_or_else(|_| chrono::Duration::zero());
        state.mode
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NeverProbe;

    #[async_trait]
    impl HealthProbe for NeverProbe {
        async fn check(&self) -> bool {
            false
        }
    }

    fn controller() -> HealthController {
        HealthController::new(Arc::new(NeverProbe), &Tuning::default())
    }

    #[test]
    fn unhealthy_probe_flips_live_to_queue() {
        let controller = controller();
        assert_eq!(controller.mode(), Mode::Live);

        let now = Utc::now();
        assert_eq!(controller.observe(false, now), Mode::Queue);

        let state = controller.state();
        assert_eq!(state.consecutive_failures, 1);
        assert_eq!(state.downtime_since, Some(now));
        assert_eq!(state.check_interval, Duration::from_secs(300));
    }

    #[test]
    fn recovery_resets_interval_and_failures() {
        let controller = controller();
        let now = Utc::now();
        controller.observe(false, now);
        controller.observe(false, now + chrono::Duration::minutes(5));
        assert_eq!(
            controller.observe(true, now + chrono::Duration::minutes(10)),
            Mode::Live
        );

        let state = controller.state();
        assert_eq!(state.consecutive_failures, 0);
        assert_eq!(state.downtime_since, None);
        assert_eq!(state.check_interval, Duration::from_secs(300));
    }

    #[test]
    fn extended_outage_widens_interval() {
        let controller = controller();
        let start = Utc::now();
        controller.observe(false, start);

        // Nineteen minutes in: still the short interval.
        controller.observe(false, start + chrono::Duration::minutes(19));
        assert_eq!(
            controller.state().check_interval,
            Duration::from_secs(300)
        );

        // Past the twenty-minute threshold: sixty-minute probes.
        controller.observe(false, start + chrono::Duration::minutes(20));
        assert_eq!(
            controller.state().check_interval,
            Duration::from_secs(3600)
        );
        assert_eq!(controller.state().consecutive_failures, 3);
    }

    #[test]
    fn mode_channel_sees_transitions() {
        let controller = controller();
        let rx = controller.subscribe();
        assert_eq!(*rx.borrow(), Mode::Live);

        controller.observe(false, Utc::now());
        assert_eq!(*rx.borrow(), Mode::Queue);

        controller.observe(true, Utc::now());
        assert_eq!(*rx.borrow(), Mode::Live);
    }

    #[test]
    fn healthy_in_live_is_a_noop_transition() {
        let controller = controller();
        let rx = controller.subscribe();
        controller.observe(true, Utc::now());
        assert_eq!(controller.mode(), Mode::Live);
        assert_eq!(*rx.borrow(), Mode::Live);
    }
}
