use std::sync::Arc;

use relayt_core::{
    Broadcaster, DrainSupervisor, EventCoalescer, HealthController,
    Notifier, ScrobbleApi, Storage, TelemetryRing,
};

/// Everything the handlers share.
#[derive(Clone)]
pub struct AppState {
    pub storage: Arc<dyn Storage>,
    pub api: Arc<dyn ScrobbleApi>,
    pub coalescer: Arc<EventCoalescer>,
    pub broadcaster: Arc<Broadcaster>,
    pub health: Arc<HealthController>,
    pub drainer: Arc<DrainSupervisor>,
    pub telemetry: Arc<TelemetryRing>,
    pub notifier: Notifier,
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState").finish_non_exhaustive()
    }
}
