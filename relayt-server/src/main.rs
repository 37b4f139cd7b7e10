//! # Relayt Server
//!
//! Webhook-to-Trakt bridge for family groups: one media-server event fans
//! out as an authenticated scrobble to every authorized member of a group.
//!
//! ## Overview
//!
//! - **Webhook ingestion**: a single Plex-compatible endpoint, always 200
//! - **Broadcasting**: concurrent per-member dispatch with partial-failure
//!   isolation
//! - **Durable retry**: PostgreSQL-backed at-least-once queue with backoff
//! - **Adaptive degradation**: live/queue mode driven by upstream probes
//! - **Admin surface**: JSON endpoints for groups, notifications, queues,
//!   and telemetry
//!
//! ## Architecture
//!
//! The server is built on Axum and uses:
//! - PostgreSQL (authoritative), Redis, or the local filesystem for storage
//! - Trakt's v2 API upstream
//! - An in-process telemetry ring for operator visibility

/// Error types and handling
pub mod errors;

/// Admin JSON handlers
pub mod handlers;

/// Route organization
pub mod routes;

/// Shared application state
pub mod state;

/// Webhook ingestion and tolerant payload decoding
pub mod webhook;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use relayt_config::{Config, StorageBackend};
use relayt_core::{
    Broadcaster, DrainSupervisor, EventCoalescer, FallbackBuffers,
    FilesystemStorage, HealthController, Notifier, PostgresStorage,
    RedisStorage, RetryEngine, ScrobbleApi, Storage, StoredTokenProbe,
    TelemetryRing, TraktClient,
};

use crate::state::AppState;

/// Entries the telemetry ring keeps before overwriting the oldest.
const TELEMETRY_CAPACITY: usize = 512;

/// Command line arguments for the Relayt server
#[derive(Parser, Debug)]
#[command(name = "relayt-server")]
#[command(about = "Media-server webhook to Trakt scrobble bridge")]
struct Args {
    /// Path to the TOML configuration file
    #[arg(short, long, env = "RELAYT_CONFIG")]
    config: Option<PathBuf>,

    /// Server port (overrides config)
    #[arg(short, long, env = "SERVER_PORT")]
    port: Option<u16>,

    /// Server host (overrides config)
    #[arg(long, env = "SERVER_HOST")]
    host: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "relayt=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let mut config = relayt_config::load(args.config.as_deref())
        .context("failed to load configuration")?;
    if let Some(port) = args.port {
        config.server.port = port;
    }
    if let Some(host) = args.host {
        config.server.host = host;
    }

    let storage = build_storage(&config).await?;
    let api: Arc<dyn ScrobbleApi> = Arc::new(TraktClient::new(
        &config.trakt,
        config.tuning.request_timeout,
    )?);

    let telemetry = Arc::new(TelemetryRing::new(TELEMETRY_CAPACITY));
    let fallback =
        Arc::new(FallbackBuffers::new(config.tuning.fallback_capacity));
    let notifier = Notifier::new(storage.clone());

    let health = Arc::new(HealthController::new(
        Arc::new(StoredTokenProbe::new(api.clone(), storage.clone())),
        &config.tuning,
    ));
    let coalescer = Arc::new(EventCoalescer::new(
        storage.clone(),
        config.tuning.progress_threshold,
    ));
    let broadcaster = Arc::new(Broadcaster::new(
        api.clone(),
        storage.clone(),
        notifier.clone(),
        health.clone(),
        telemetry.clone(),
        fallback,
        config.tuning.base_backoff,
        config.tuning.queue_capacity,
    ));
    let drainer = Arc::new(DrainSupervisor::new(
        storage.clone(),
        api.clone(),
        telemetry.clone(),
        config.tuning.drain_batch,
    ));

    let cancel = CancellationToken::new();

    tokio::spawn(health.clone().run(cancel.child_token()));
    tokio::spawn(
        drainer
            .clone()
            .run(health.clone(), cancel.child_token()),
    );

    if storage.supports_retry_queue() {
        let engine = Arc::new(RetryEngine::new(
            storage.clone(),
            api.clone(),
            notifier.clone(),
            telemetry.clone(),
            &config.tuning,
        ));
        tokio::spawn(engine.run(cancel.child_token()));
    } else {
        warn!(
            "Storage backend has no retry queue; broadcast failures fall back to per-user queues"
        );
    }

    let state = AppState {
        storage,
        api,
        coalescer,
        broadcaster,
        health,
        drainer,
        telemetry,
        notifier,
    };

    let app = routes::create_router(state);
    let addr: SocketAddr =
        format!("{}:{}", config.server.host, config.server.port)
            .parse()
            .context("invalid listen address")?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!("Relayt server listening on {addr}");

    let shutdown = cancel.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for shutdown signal: {e}");
            return;
        }
        info!("Shutdown signal received");
        shutdown.cancel();
    });

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
        .context("server error")?;

    info!("Relayt server stopped");
    Ok(())
}

async fn build_storage(config: &Config) -> anyhow::Result<Arc<dyn Storage>> {
    Ok(match config.storage.backend {
        StorageBackend::Postgres => {
            let url = config
                .storage
                .database_url
                .as_deref()
                .context("storage.database_url is required")?;
            let storage = PostgresStorage::new(url).await?;
            storage.initialize_schema().await?;
            Arc::new(storage)
        }
        StorageBackend::Redis => {
            let url = config
                .storage
                .redis_url
                .as_deref()
                .context("storage.redis_url is required")?;
            Arc::new(RedisStorage::new(url).await?)
        }
        StorageBackend::Filesystem => {
            let dir = config
                .storage
                .data_dir
                .as_deref()
                .context("storage.data_dir is required")?;
            Arc::new(FilesystemStorage::new(dir).await?)
        }
    })
}
