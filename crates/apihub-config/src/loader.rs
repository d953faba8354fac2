use std::path::{Path, PathBuf};

use apihub_common::{Error, Result};
use tracing::{debug, info};

use crate::model::AppConfig;

pub const ENV_DATABASE_URL: &str = "DATABASE_URL";
pub const ENV_MAX_RETRIES: &str = "DB_INIT_MAX_RETRIES";
pub const ENV_RETRY_DELAY_MS: &str = "DB_INIT_RETRY_DELAY_MS";
pub const ENV_POOL_MAX_SIZE: &str = "DB_POOL_MAX_SIZE";
pub const ENV_CONNECT_TIMEOUT_MS: &str = "DB_CONNECT_TIMEOUT_MS";
pub const ENV_MIGRATIONS_DIR: &str = "MIGRATIONS_DIR";

/// Builds an `AppConfig` from an optional config file plus environment
/// overrides.
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration from `path` (if given) and the process environment.
    pub fn load(path: Option<&Path>) -> Result<AppConfig> {
        Self::load_with(path, |key| std::env::var(key).ok())
    }

    /// Same as [`ConfigLoader::load`] but reads variables through `lookup`.
    pub fn load_with<F>(path: Option<&Path>, lookup: F) -> Result<AppConfig>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = match path {
            Some(path) => {
                let config = read_config_file(path)?;
                info!("loaded config from {}", path.display());
                config
            }
            None => AppConfig::default(),
        };
        config.normalize();
        apply_env_overrides(&mut config, lookup);
        Ok(config)
    }
}

fn read_config_file(path: &Path) -> Result<AppConfig> {
    let contents = std::fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("failed to read {}: {e}", path.display())))?;

    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
    match ext {
        "yml" | "yaml" => serde_yaml::from_str(&contents)
            .map_err(|e| Error::Config(format!("YAML parse error in {}: {e}", path.display()))),
        "toml" => toml::from_str(&contents)
            .map_err(|e| Error::Config(format!("TOML parse error in {}: {e}", path.display()))),
        other => Err(Error::Config(format!(
            "unsupported config extension: {other}"
        ))),
    }
}

fn apply_env_overrides<F>(config: &mut AppConfig, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(url) = lookup(ENV_DATABASE_URL).filter(|v| !v.trim().is_empty()) {
        config.database.url = Some(url);
    }
    config.probe.max_attempts = parse_positive(
        lookup(ENV_MAX_RETRIES).as_deref(),
        config.probe.max_attempts,
    );
    config.probe.retry_delay_ms = parse_positive(
        lookup(ENV_RETRY_DELAY_MS).as_deref(),
        config.probe.retry_delay_ms,
    );
    config.database.max_connections = parse_positive(
        lookup(ENV_POOL_MAX_SIZE).as_deref(),
        config.database.max_connections,
    );
    config.database.connect_timeout_ms = parse_positive(
        lookup(ENV_CONNECT_TIMEOUT_MS).as_deref(),
        config.database.connect_timeout_ms,
    );
    if let Some(dir) = lookup(ENV_MIGRATIONS_DIR).filter(|v| !v.trim().is_empty()) {
        config.migrations.dir = Some(PathBuf::from(dir));
    }
}

/// Parse a strictly positive integer, falling back to `fallback` for
/// anything missing, non-numeric, zero or negative.
pub fn parse_positive<T>(value: Option<&str>, fallback: T) -> T
where
    T: std::str::FromStr + PartialOrd + Default,
{
    let Some(raw) = value else {
        return fallback;
    };
    match raw.trim().parse::<T>() {
        Ok(parsed) if parsed > T::default() => parsed,
        _ => {
            debug!("ignoring invalid override {raw:?}, keeping default");
            fallback
        }
    }
}
