use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use apihub_common::{Error, Result};
use apihub_config::DatabaseConfig;
use chrono::{DateTime, Utc};
use r2d2::{ManageConnection, Pool, PooledConnection};
use rusqlite::{Connection, OptionalExtension, Row, TransactionBehavior, params};
use tracing::{debug, info};

use crate::ledger::LedgerEntry;
use crate::store::{StoreConnection, StorePool};

/// Pause between retries while another connection holds the write lock.
const BUSY_RETRY_MS: u64 = 10;

const LEDGER_COLUMNS: &str = "version TEXT PRIMARY KEY,
    description TEXT NOT NULL DEFAULT '',
    checksum TEXT,
    applied_at TEXT NOT NULL DEFAULT (datetime('now'))";

/// r2d2 manager handing out rusqlite connections to one database file.
#[derive(Debug, Clone)]
pub struct SqliteConnectionManager {
    path: PathBuf,
}

impl SqliteConnectionManager {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl ManageConnection for SqliteConnectionManager {
    type Connection = Connection;
    type Error = rusqlite::Error;

    fn connect(&self) -> std::result::Result<Connection, rusqlite::Error> {
        let conn = Connection::open(&self.path)?;
        // A writer waiting on another writer keeps waiting instead of failing
        // with SQLITE_BUSY.
        conn.busy_handler(Some(wait_while_busy))?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
        Ok(conn)
    }

    fn is_valid(&self, conn: &mut Connection) -> std::result::Result<(), rusqlite::Error> {
        conn.query_row("SELECT 1", [], |_| Ok(()))
    }

    fn has_broken(&self, _conn: &mut Connection) -> bool {
        false
    }
}

fn wait_while_busy(_attempt: i32) -> bool {
    std::thread::sleep(Duration::from_millis(BUSY_RETRY_MS));
    true
}

/// SQLite-backed store.
///
/// The migration lease is the database write lock: `BEGIN IMMEDIATE` is held
/// for the whole run and each migration is a savepoint inside it.
pub struct SqliteStore {
    path: PathBuf,
    pool: Pool<SqliteConnectionManager>,
}

impl SqliteStore {
    /// Build a pool for `path`. No connection is opened until the first
    /// checkout.
    pub fn open(path: impl AsRef<Path>, config: &DatabaseConfig) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        info!("opening sqlite store at {}", path.display());
        let pool = Pool::builder()
            .max_size(config.max_connections.max(1))
            .min_idle(Some(0))
            .connection_timeout(config.connect_timeout())
            .build_unchecked(SqliteConnectionManager::new(&path));
        Ok(Self { path, pool })
    }

    pub fn open_path(path: &Path) -> Result<Self> {
        Self::open(path, &DatabaseConfig::default())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl StorePool for SqliteStore {
    fn checkout(&self) -> Result<Box<dyn StoreConnection>> {
        let conn = self.pool.get().map_err(|e| {
            Error::Database(format!(
                "failed to open sqlite database {}: {e}",
                self.path.display()
            ))
        })?;
        Ok(Box::new(SqliteConnection { conn }))
    }

    fn backend(&self) -> &'static str {
        "sqlite"
    }
}

pub struct SqliteConnection {
    conn: PooledConnection<SqliteConnectionManager>,
}

impl SqliteConnection {
    fn batch(&self, sql: &str, what: &str) -> Result<()> {
        self.conn
            .execute_batch(sql)
            .map_err(|e| Error::Database(format!("failed to {what}: {e}")))
    }
}

impl StoreConnection for SqliteConnection {
    fn ping(&mut self) -> Result<()> {
        self.conn
            .query_row("SELECT 1", [], |row| row.get::<_, i64>(0))
            .map_err(|e| Error::Database(format!("ping failed: {e}")))?;
        Ok(())
    }

    fn execute_script(&mut self, sql: &str) -> Result<()> {
        self.conn
            .execute_batch(sql)
            .map_err(|e| Error::Database(e.to_string()))
    }

    fn begin_step(&mut self) -> Result<()> {
        self.batch("SAVEPOINT migration_step", "open migration savepoint")
    }

    fn commit_step(&mut self) -> Result<()> {
        self.batch("RELEASE migration_step", "release migration savepoint")
    }

    fn rollback_step(&mut self) -> Result<()> {
        self.batch(
            "ROLLBACK TO migration_step; RELEASE migration_step",
            "roll back migration savepoint",
        )
    }

    fn acquire_lease(&mut self, _key: i64) -> Result<()> {
        debug!("waiting for sqlite write lock");
        self.batch("BEGIN IMMEDIATE", "acquire write lock")
    }

    fn release_lease(&mut self, _key: i64) -> Result<()> {
        if self.conn.is_autocommit() {
            return Ok(());
        }
        self.batch("COMMIT", "commit migration run")
    }

    fn ensure_ledger_schema(&mut self) -> Result<()> {
        upgrade_ledger(&mut self.conn)
            .map_err(|e| Error::Database(format!("failed to upgrade ledger schema: {e}")))
    }

    fn fetch_ledger_entry(&mut self, version: &str) -> Result<Option<LedgerEntry>> {
        self.conn
            .query_row(
                "SELECT version, description, checksum, applied_at
                 FROM schema_migrations WHERE version = ?1",
                params![version],
                ledger_entry_from_row,
            )
            .optional()
            .map_err(|e| Error::Database(format!("failed to query ledger: {e}")))
    }

    fn insert_ledger_entry(
        &mut self,
        version: &str,
        description: &str,
        checksum: &str,
    ) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO schema_migrations (version, description, checksum)
                 VALUES (?1, ?2, ?3)",
                params![version, description, checksum],
            )
            .map_err(|e| Error::Database(format!("failed to insert ledger row: {e}")))?;
        Ok(())
    }

    fn update_ledger_metadata(
        &mut self,
        version: &str,
        description: &str,
        checksum: &str,
    ) -> Result<u64> {
        let updated = self
            .conn
            .execute(
                "UPDATE schema_migrations SET checksum = ?2, description = ?3 WHERE version = ?1",
                params![version, checksum, description],
            )
            .map_err(|e| Error::Database(format!("failed to update ledger row: {e}")))?;
        Ok(updated as u64)
    }

    fn list_ledger_entries(&mut self) -> Result<Vec<LedgerEntry>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT version, description, checksum, applied_at
                 FROM schema_migrations ORDER BY version",
            )
            .map_err(|e| Error::Database(format!("failed to prepare query: {e}")))?;

        let rows = stmt
            .query_map([], ledger_entry_from_row)
            .map_err(|e| Error::Database(format!("failed to query ledger: {e}")))?;

        let mut entries = Vec::new();
        for row in rows {
            entries.push(
                row.map_err(|e| Error::Database(format!("failed to read ledger row: {e}")))?,
            );
        }
        Ok(entries)
    }
}

/// Create the ledger or bring an older one up to the current columns. Runs
/// under the write lock so concurrent starters cannot both add a column.
fn upgrade_ledger(conn: &mut Connection) -> rusqlite::Result<()> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    tx.execute_batch(&format!(
        "CREATE TABLE IF NOT EXISTS schema_migrations ({LEDGER_COLUMNS})"
    ))?;

    let columns = ledger_columns(&tx)?;
    if !columns.contains_key("checksum") {
        info!("adding checksum column to schema_migrations");
        tx.execute_batch("ALTER TABLE schema_migrations ADD COLUMN checksum TEXT")?;
    }
    match columns.get("description") {
        None => {
            info!("adding description column to schema_migrations");
            tx.execute_batch(
                "ALTER TABLE schema_migrations ADD COLUMN description TEXT NOT NULL DEFAULT ''",
            )?;
        }
        Some(false) => {
            // SQLite cannot add NOT NULL to an existing column; rebuild.
            info!("enforcing non-null description on schema_migrations");
            tx.execute_batch(&format!(
                "UPDATE schema_migrations SET description = '' WHERE description IS NULL;
                 CREATE TABLE schema_migrations_upgrade ({LEDGER_COLUMNS});
                 INSERT INTO schema_migrations_upgrade (version, description, checksum, applied_at)
                     SELECT version, description, checksum, COALESCE(applied_at, datetime('now'))
                     FROM schema_migrations;
                 DROP TABLE schema_migrations;
                 ALTER TABLE schema_migrations_upgrade RENAME TO schema_migrations;"
            ))?;
        }
        Some(true) => {}
    }
    tx.commit()
}

/// Column name -> NOT NULL flag.
fn ledger_columns(conn: &Connection) -> rusqlite::Result<HashMap<String, bool>> {
    let mut stmt = conn.prepare("PRAGMA table_info(schema_migrations)")?;
    let rows = stmt.query_map([], |row| {
        Ok((row.get::<_, String>(1)?, row.get::<_, i64>(3)? != 0))
    })?;
    rows.collect()
}

fn ledger_entry_from_row(row: &Row<'_>) -> rusqlite::Result<LedgerEntry> {
    Ok(LedgerEntry {
        version: row.get(0)?,
        description: row.get::<_, Option<String>>(1)?.unwrap_or_default(),
        checksum: row.get(2)?,
        applied_at: parse_datetime(row.get::<_, String>(3)?),
    })
}

fn parse_datetime(s: String) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(&s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| {
            // SQLite datetime('now') produces "YYYY-MM-DD HH:MM:SS"
            chrono::NaiveDateTime::parse_from_str(&s, "%Y-%m-%d %H:%M:%S")
                .map(|naive| naive.and_utc())
                .unwrap_or_else(|_| Utc::now())
        })
}
