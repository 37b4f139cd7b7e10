use std::path::Path;

use tracing::{debug, info};

use crate::error::ConfigError;
use crate::models::{Config, StorageBackend};

/// Load configuration: defaults, then an optional TOML file, then `RELAYT_*`
/// environment overrides.
///
/// A `.env` file next to the process is honored the same way the rest of the
/// stack does it; absence is not an error.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    dotenvy::dotenv().ok();

    let mut config = match path {
        Some(path) => {
            let raw = std::fs::read_to_string(path).map_err(|source| {
                ConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                }
            })?;
            let config =
                toml::from_str(&raw).map_err(|source| ConfigError::Parse {
                    path: path.to_path_buf(),
                    source,
                })?;
            info!(path = %path.display(), "Loaded configuration file");
            config
        }
        None => {
            debug!("No config file given; starting from defaults");
            Config::default()
        }
    };

    apply_env_overrides(&mut config)?;
    config.validate()?;
    Ok(config)
}

fn apply_env_overrides(config: &mut Config) -> Result<(), ConfigError> {
    if let Some(value) = env_var("RELAYT_HOST") {
        config.server.host = value;
    }
    if let Some(value) = env_var("RELAYT_PORT") {
        config.server.port =
            value.parse().map_err(|_| ConfigError::Invalid {
                key: "RELAYT_PORT",
                reason: format!("not a port number: {value}"),
            })?;
    }
    if let Some(value) = env_var("RELAYT_STORAGE_BACKEND") {
        config.storage.backend = match value.as_str() {
            "postgres" => StorageBackend::Postgres,
            "redis" => StorageBackend::Redis,
            "filesystem" => StorageBackend::Filesystem,
            other => {
                return Err(ConfigError::Invalid {
                    key: "RELAYT_STORAGE_BACKEND",
                    reason: format!(
                        "expected postgres|redis|filesystem, got {other}"
                    ),
                });
            }
        };
    }
    if let Some(value) = env_var("RELAYT_DATABASE_URL")
        .or_else(|| env_var("DATABASE_URL"))
    {
        config.storage.database_url = Some(value);
    }
    if let Some(value) =
        env_var("RELAYT_REDIS_URL").or_else(|| env_var("REDIS_URL"))
    {
        config.storage.redis_url = Some(value);
    }
    if let Some(value) = env_var("RELAYT_DATA_DIR") {
        config.storage.data_dir = Some(value.into());
    }
    if let Some(value) = env_var("RELAYT_TRAKT_CLIENT_ID") {
        config.trakt.client_id = value;
    }
    if let Some(value) = env_var("RELAYT_TRAKT_CLIENT_SECRET") {
        config.trakt.client_secret = value;
    }
    if let Some(value) = env_var("RELAYT_TRAKT_REDIRECT_URI") {
        config.trakt.redirect_uri = value;
    }
    if let Some(value) = env_var("RELAYT_TRAKT_API_BASE") {
        config.trakt.api_base = value;
    }
    if let Some(value) = env_var("RELAYT_RETRY_POLL_INTERVAL") {
        config.tuning.retry_poll_interval = humantime::parse_duration(&value)
            .map_err(|_| ConfigError::InvalidDuration {
                key: "RELAYT_RETRY_POLL_INTERVAL",
                value,
            })?;
    }
    Ok(())
}

fn env_var(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn file_values_override_defaults() {
        let file = write_config(
            r#"
            [server]
            port = 9000

            [storage]
            backend = "filesystem"
            data_dir = "/tmp/relayt"

            [trakt]
            client_id = "cid"
            client_secret = "csecret"
            "#,
        );
        let config = load(Some(file.path())).unwrap();
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.storage.backend, StorageBackend::Filesystem);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let file = write_config(
            r#"
            [server]
            prot = 9000
            "#,
        );
        assert!(matches!(
            load(Some(file.path())),
            Err(ConfigError::Parse { .. })
        ));
    }

    #[test]
    fn missing_file_is_an_error() {
        assert!(matches!(
            load(Some(Path::new("/nonexistent/relayt.toml"))),
            Err(ConfigError::Read { .. })
        ));
    }
}
