//! Shared configuration library for Relayt.
//!
//! Centralizes config defaults, TOML loading, environment overrides, and
//! validation rules so `relayt-server` and the core services see a single
//! source of truth for every tunable.

pub mod error;
pub mod loader;
pub mod models;

pub use error::ConfigError;
pub use loader::load;
pub use models::{
    Config, ServerConfig, StorageBackend, StorageConfig, TraktConfig, Tuning,
};
