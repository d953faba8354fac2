use std::path::PathBuf;
use std::time::Duration;

use apihub_common::{Error, Result};
use serde::{Deserialize, Serialize};

pub const DEFAULT_MAX_CONNECTIONS: u32 = 10;
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 5_000;
pub const DEFAULT_PROBE_MAX_ATTEMPTS: u32 = 10;
pub const DEFAULT_PROBE_RETRY_DELAY_MS: u64 = 2_000;
pub const DEFAULT_MIGRATION_LOCK_KEY: i64 = 84_732_019;

/// Top-level configuration for the bootstrap sequence.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub probe: ProbeConfig,
    pub migrations: MigrationsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Connection URL, `postgres://...` or `sqlite://<path>`.
    pub url: Option<String>,
    pub max_connections: u32,
    pub connect_timeout_ms: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
        }
    }
}

impl DatabaseConfig {
    pub fn with_url(url: impl Into<String>) -> Self {
        Self {
            url: Some(url.into()),
            ..Default::default()
        }
    }

    /// The connection URL. Its absence is fatal and is reported before any
    /// connection attempt is made.
    pub fn require_url(&self) -> Result<&str> {
        match self.url.as_deref().map(str::trim) {
            Some(url) if !url.is_empty() => Ok(url),
            _ => Err(Error::Config("DATABASE_URL is required".into())),
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

/// Connection probe settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeConfig {
    pub max_attempts: u32,
    pub retry_delay_ms: u64,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_PROBE_MAX_ATTEMPTS,
            retry_delay_ms: DEFAULT_PROBE_RETRY_DELAY_MS,
        }
    }
}

impl ProbeConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MigrationsConfig {
    /// Directory holding `<yyyymmdd>_<nnn>_<slug>.sql` files. When unset the
    /// migrations built into the binary are used.
    pub dir: Option<PathBuf>,
    /// Key of the exclusive lease held while migrations run.
    pub lock_key: i64,
}

impl Default for MigrationsConfig {
    fn default() -> Self {
        Self {
            dir: None,
            lock_key: DEFAULT_MIGRATION_LOCK_KEY,
        }
    }
}

impl AppConfig {
    /// Replace zero values with the defaults. Non-positive settings are never
    /// an error.
    pub fn normalize(&mut self) {
        if self.database.max_connections == 0 {
            self.database.max_connections = DEFAULT_MAX_CONNECTIONS;
        }
        if self.database.connect_timeout_ms == 0 {
            self.database.connect_timeout_ms = DEFAULT_CONNECT_TIMEOUT_MS;
        }
        if self.probe.max_attempts == 0 {
            self.probe.max_attempts = DEFAULT_PROBE_MAX_ATTEMPTS;
        }
        if self.probe.retry_delay_ms == 0 {
            self.probe.retry_delay_ms = DEFAULT_PROBE_RETRY_DELAY_MS;
        }
    }
}
