use std::sync::Arc;

use apihub_common::Result;
use apihub_config::AppConfig;
use serde::Serialize;
use tracing::info;

use crate::engine::{MigrationEngine, MigrationReport, MigrationStatus};
use crate::observer::{BootstrapObserver, TracingObserver};
use crate::probe::{ConnectionProbe, Sleeper, ThreadSleeper};
use crate::source::MigrationSource;
use crate::store::{StorePool, open_pool};

/// Summary of a successful bootstrap.
#[derive(Debug, Clone, Serialize)]
pub struct BootstrapReport {
    pub backend: &'static str,
    pub probe_attempts: u32,
    pub migrations: MigrationReport,
}

/// Startup sequence: wait for the store, then bring its schema up to date.
/// Must complete before anything else uses the store.
pub struct Bootstrap {
    config: AppConfig,
    sleeper: Arc<dyn Sleeper>,
    observer: Arc<dyn BootstrapObserver>,
}

impl Bootstrap {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config,
            sleeper: Arc::new(ThreadSleeper),
            observer: Arc::new(TracingObserver),
        }
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn BootstrapObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// Open the configured store and run the whole sequence.
    pub fn run(&self) -> Result<BootstrapReport> {
        let pool = open_pool(&self.config.database)?;
        self.run_with_pool(pool)
    }

    /// Probe, discover and migrate against an existing pool.
    pub fn run_with_pool(&self, pool: Arc<dyn StorePool>) -> Result<BootstrapReport> {
        let probe_attempts = self.probe(&pool)?;
        let source = self.migration_source();
        let definitions = source.discover()?;
        info!(
            "applying {} migration(s) from {}",
            definitions.len(),
            source.location()
        );
        let migrations = self.engine(&pool).run(&definitions)?;

        Ok(BootstrapReport {
            backend: pool.backend(),
            probe_attempts,
            migrations,
        })
    }

    /// Report every migration's ledger state without applying anything.
    pub fn status(&self) -> Result<Vec<MigrationStatus>> {
        let pool = open_pool(&self.config.database)?;
        self.status_with_pool(pool)
    }

    pub fn status_with_pool(&self, pool: Arc<dyn StorePool>) -> Result<Vec<MigrationStatus>> {
        self.probe(&pool)?;
        let definitions = self.migration_source().discover()?;
        self.engine(&pool).plan(&definitions)
    }

    fn probe(&self, pool: &Arc<dyn StorePool>) -> Result<u32> {
        ConnectionProbe::new(pool.clone())
            .with_sleeper(self.sleeper.clone())
            .with_observer(self.observer.clone())
            .establish(self.config.probe.max_attempts, self.config.probe.retry_delay())
    }

    /// The configured migrations directory, or the built-in migrations when
    /// none is set.
    pub fn migration_source(&self) -> MigrationSource {
        match &self.config.migrations.dir {
            Some(dir) => MigrationSource::directory(dir),
            None => MigrationSource::shipped(),
        }
    }

    fn engine(&self, pool: &Arc<dyn StorePool>) -> MigrationEngine {
        MigrationEngine::new(pool.clone())
            .with_lock_key(self.config.migrations.lock_key)
            .with_observer(self.observer.clone())
    }
}

/// Run the startup sequence for `config`.
pub fn bootstrap(config: &AppConfig) -> Result<BootstrapReport> {
    Bootstrap::new(config.clone()).run()
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    use apihub_common::Error;

    use super::*;
    use crate::observer::SilentObserver;
    use crate::probe::tests::{FlakyPool, RecordingSleeper};

    fn config_for(dir: &std::path::Path) -> AppConfig {
        let mut config = AppConfig::default();
        config.migrations.dir = Some(dir.to_path_buf());
        config.probe.max_attempts = 3;
        config.probe.retry_delay_ms = 5;
        config
    }

    #[test]
    fn missing_url_fails_before_probing() {
        let err = bootstrap(&AppConfig::default()).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        assert_eq!(err.stage(), "configuration");
    }

    #[test]
    fn unreachable_store_never_reaches_discovery() {
        let dir = tempfile::tempdir().unwrap();
        // Discovery would fail on this path if it ran.
        let config = config_for(&dir.path().join("does-not-exist"));
        let pool = Arc::new(FlakyPool::new(u32::MAX));
        let sleeper = Arc::new(RecordingSleeper::default());

        let err = Bootstrap::new(config)
            .with_sleeper(sleeper.clone())
            .with_observer(Arc::new(SilentObserver))
            .run_with_pool(pool.clone())
            .unwrap_err();

        assert!(matches!(err, Error::Connectivity { attempts: 3, .. }));
        assert_eq!(pool.checkouts.load(Ordering::SeqCst), 3);
        assert_eq!(
            *sleeper.sleeps.lock().unwrap(),
            vec![Duration::from_millis(5); 2]
        );
    }

    #[test]
    fn unreadable_source_is_a_discovery_failure() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_for(&dir.path().join("does-not-exist"));

        let err = Bootstrap::new(config)
            .with_sleeper(Arc::new(RecordingSleeper::default()))
            .with_observer(Arc::new(SilentObserver))
            .run_with_pool(Arc::new(FlakyPool::new(0)))
            .unwrap_err();

        assert_eq!(err.stage(), "discovery");
    }

    #[test]
    fn built_in_migrations_are_used_when_no_directory_is_set() {
        let boot = Bootstrap::new(AppConfig::default());
        assert!(matches!(boot.migration_source(), MigrationSource::Embedded(_)));

        let dir = tempfile::tempdir().unwrap();
        let boot = Bootstrap::new(config_for(dir.path()));
        assert_eq!(
            boot.migration_source().location(),
            dir.path().display().to_string()
        );
    }
}
