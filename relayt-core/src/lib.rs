//! Core engine of the Relayt scrobble bridge.
//!
//! One media event received from the webhook surface is coalesced, fanned out
//! to every authorized member of a family group, and — when the upstream API
//! misbehaves — parked in a durable retry queue or a per-user scrobble queue
//! until it can be delivered.
//!
//! The modules map onto the moving parts:
//!
//! - [`storage`]: one persistence contract over Postgres, Redis, and the
//!   local filesystem, plus the in-process fallback buffer
//! - [`trakt`]: the authenticated upstream client and OAuth token plumbing
//! - [`coalescer`]: per-playback serialization, action inference, duplicate
//!   suppression
//! - [`broadcast`]: concurrent per-member fan-out and failure classification
//! - [`retry`]: the durable at-least-once retry worker
//! - [`health`]: the live/queue mode controller
//! - [`drainer`]: per-user queue replay after recovery
//! - [`notify`]: owner-facing banner records
//! - [`telemetry`]: the in-process observability ring

pub mod broadcast;
pub mod coalescer;
pub mod drainer;
pub mod error;
pub mod health;
pub mod notify;
pub mod retry;
pub mod storage;
pub mod telemetry;
pub mod trakt;

pub use broadcast::{BroadcastError, BroadcastRequest, Broadcaster};
pub use coalescer::{EventCoalescer, PreparedScrobble};
pub use drainer::{DrainSupervisor, QueueStatus};
pub use error::{BridgeError, Result};
pub use health::{
    HealthController, HealthProbe, HealthState, Mode, StoredTokenProbe,
};
pub use notify::Notifier;
pub use retry::{RetryEngine, RetryPayload};
pub use storage::{
    FallbackBuffers, FilesystemStorage, PostgresStorage, RedisStorage,
    Storage,
};
pub use telemetry::{TelemetryEvent, TelemetryOp, TelemetryRing};
pub use trakt::{ScrobbleApi, TokenGrant, TraktClient, TraktError};
