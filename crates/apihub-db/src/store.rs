use std::sync::Arc;

use apihub_common::{Error, Result};
use apihub_config::DatabaseConfig;

use crate::ledger::LedgerEntry;
use crate::postgres_store::PostgresStore;
use crate::sqlite_store::SqliteStore;

/// A shared pool of store connections.
///
/// The pool is owned by the bootstrap orchestrator and handed to the probe
/// and the migration engine. Connections go back to the pool when the
/// returned box is dropped.
pub trait StorePool: Send + Sync {
    fn checkout(&self) -> Result<Box<dyn StoreConnection>>;

    /// Short backend name used in logs ("sqlite", "postgres").
    fn backend(&self) -> &'static str;
}

/// One checked-out connection. Implementations map driver failures to
/// [`Error::Database`]; callers classify them.
pub trait StoreConnection {
    /// Trivial round trip (`SELECT 1`).
    fn ping(&mut self) -> Result<()>;

    /// Run one or more statements verbatim.
    fn execute_script(&mut self, sql: &str) -> Result<()>;

    /// Whether `sql` may run inside `begin_step`/`commit_step`. Content that
    /// the backend refuses inside a transaction block returns `false`.
    fn supports_step(&self, _sql: &str) -> bool {
        true
    }

    fn begin_step(&mut self) -> Result<()>;
    fn commit_step(&mut self) -> Result<()>;
    fn rollback_step(&mut self) -> Result<()>;

    /// Block until the exclusive lease named by `key` is held by this
    /// connection.
    fn acquire_lease(&mut self, key: i64) -> Result<()>;
    fn release_lease(&mut self, key: i64) -> Result<()>;

    /// Create or additively upgrade the `schema_migrations` table.
    fn ensure_ledger_schema(&mut self) -> Result<()>;
    fn fetch_ledger_entry(&mut self, version: &str) -> Result<Option<LedgerEntry>>;
    fn insert_ledger_entry(&mut self, version: &str, description: &str, checksum: &str)
    -> Result<()>;
    /// Returns the number of rows updated.
    fn update_ledger_metadata(
        &mut self,
        version: &str,
        description: &str,
        checksum: &str,
    ) -> Result<u64>;
    fn list_ledger_entries(&mut self) -> Result<Vec<LedgerEntry>>;
}

/// Open a lazily-connecting pool for the configured database URL.
pub fn open_pool(config: &DatabaseConfig) -> Result<Arc<dyn StorePool>> {
    let url = config.require_url()?;
    if url.starts_with("postgres://") || url.starts_with("postgresql://") {
        Ok(Arc::new(PostgresStore::connect(url, config)?))
    } else if let Some(path) = url.strip_prefix("sqlite://") {
        if path.is_empty() {
            return Err(Error::Config("sqlite URL is missing a file path".into()));
        }
        Ok(Arc::new(SqliteStore::open(path, config)?))
    } else {
        let scheme = url.split("://").next().unwrap_or(url);
        Err(Error::Config(format!(
            "unsupported database URL scheme: {scheme}"
        )))
    }
}
