use apihub_common::{Error, Result};
use apihub_config::DatabaseConfig;
use chrono::{DateTime, Utc};
use postgres::{NoTls, Row};
use r2d2::{ManageConnection, Pool, PooledConnection};
use r2d2_postgres::PostgresConnectionManager;
use tracing::{debug, info, warn};

use crate::ledger::LedgerEntry;
use crate::store::{StoreConnection, StorePool};

/// Connection failure whose text carries the server diagnostics. The pool
/// keeps only the `Display` form of the last connect error.
#[derive(Debug)]
pub struct ConnectError(postgres::Error);

impl std::fmt::Display for ConnectError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&describe(&self.0))
    }
}

impl std::error::Error for ConnectError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.0)
    }
}

/// `r2d2_postgres` manager reporting failures as [`ConnectError`].
pub struct Manager(PostgresConnectionManager<NoTls>);

impl ManageConnection for Manager {
    type Connection = postgres::Client;
    type Error = ConnectError;

    fn connect(&self) -> std::result::Result<postgres::Client, ConnectError> {
        self.0.connect().map_err(ConnectError)
    }

    fn is_valid(&self, conn: &mut postgres::Client) -> std::result::Result<(), ConnectError> {
        self.0.is_valid(conn).map_err(ConnectError)
    }

    fn has_broken(&self, conn: &mut postgres::Client) -> bool {
        self.0.has_broken(conn)
    }
}

/// Transaction-scoped advisory lock serializing ledger setup across
/// instances. Distinct from the run lease, which is taken only after the
/// ledger exists.
pub const LEDGER_SETUP_LOCK_KEY: i64 = 84_732_018;

/// Statements bringing any earlier ledger layout up to the current one.
/// Every statement is additive and safe to repeat.
const ENSURE_LEDGER_SQL: &str = "
CREATE TABLE IF NOT EXISTS schema_migrations (
    version TEXT PRIMARY KEY,
    description TEXT NOT NULL DEFAULT '',
    checksum TEXT,
    applied_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
);
ALTER TABLE schema_migrations ADD COLUMN IF NOT EXISTS description TEXT;
ALTER TABLE schema_migrations ADD COLUMN IF NOT EXISTS checksum TEXT;
UPDATE schema_migrations SET description = '' WHERE description IS NULL;
ALTER TABLE schema_migrations ALTER COLUMN description SET DEFAULT '';
ALTER TABLE schema_migrations ALTER COLUMN description SET NOT NULL;
";

/// Postgres-backed store. The migration lease is a session-level advisory
/// lock.
pub struct PostgresStore {
    pool: Option<Pool<Manager>>,
}

impl Drop for PostgresStore {
    fn drop(&mut self) {
        // Blocking clients must not be torn down on an async worker.
        if let Some(pool) = self.pool.take() {
            let _ = std::thread::spawn(move || drop(pool));
        }
    }
}

impl PostgresStore {
    /// Parse `url` and build a lazily-connecting pool.
    pub fn connect(url: &str, config: &DatabaseConfig) -> Result<Self> {
        let mut pg_config = url
            .parse::<postgres::Config>()
            .map_err(|e| Error::Config(format!("invalid postgres URL: {e}")))?;
        pg_config.connect_timeout(config.connect_timeout());

        let pool = Pool::builder()
            .max_size(config.max_connections.max(1))
            .min_idle(Some(0))
            .connection_timeout(config.connect_timeout())
            .build_unchecked(Manager(PostgresConnectionManager::new(pg_config, NoTls)));
        info!(
            "postgres pool configured (max {} connections)",
            config.max_connections
        );
        Ok(Self { pool: Some(pool) })
    }
}

impl StorePool for PostgresStore {
    fn checkout(&self) -> Result<Box<dyn StoreConnection>> {
        let client = self
            .pool
            .as_ref()
            .ok_or_else(|| Error::Database("postgres store closed".into()))?
            .get()
            .map_err(|e| Error::Database(format!("failed to connect to postgres: {e}")))?;
        Ok(Box::new(PostgresConnection { client }))
    }

    fn backend(&self) -> &'static str {
        "postgres"
    }
}

pub struct PostgresConnection {
    client: PooledConnection<Manager>,
}

impl PostgresConnection {
    fn batch(&mut self, sql: &str, what: &str) -> Result<()> {
        self.client
            .batch_execute(sql)
            .map_err(|e| Error::Database(format!("failed to {what}: {}", describe(&e))))
    }
}

impl StoreConnection for PostgresConnection {
    fn ping(&mut self) -> Result<()> {
        self.client
            .query_one("SELECT 1", &[])
            .map_err(|e| Error::Database(format!("ping failed: {}", describe(&e))))?;
        Ok(())
    }

    fn execute_script(&mut self, sql: &str) -> Result<()> {
        self.client
            .batch_execute(sql)
            .map_err(|e| Error::Database(describe(&e)))
    }

    fn begin_step(&mut self) -> Result<()> {
        self.batch("BEGIN", "begin migration transaction")
    }

    fn commit_step(&mut self) -> Result<()> {
        self.batch("COMMIT", "commit migration transaction")
    }

    fn rollback_step(&mut self) -> Result<()> {
        self.batch("ROLLBACK", "roll back migration transaction")
    }

    fn acquire_lease(&mut self, key: i64) -> Result<()> {
        debug!("waiting for advisory lock {key}");
        self.client
            .execute("SELECT pg_advisory_lock($1)", &[&key])
            .map_err(|e| {
                Error::Database(format!("failed to acquire advisory lock: {}", describe(&e)))
            })?;
        Ok(())
    }

    fn release_lease(&mut self, key: i64) -> Result<()> {
        let row = self
            .client
            .query_one("SELECT pg_advisory_unlock($1)", &[&key])
            .map_err(|e| {
                Error::Database(format!("failed to release advisory lock: {}", describe(&e)))
            })?;
        let released: bool = row
            .try_get(0)
            .map_err(|e| {
                Error::Database(format!(
                    "unexpected advisory unlock result: {}",
                    describe(&e)
                ))
            })?;
        if !released {
            warn!("advisory lock {key} was not held at release");
        }
        Ok(())
    }

    fn ensure_ledger_schema(&mut self) -> Result<()> {
        let fail = |e: postgres::Error| {
            Error::Database(format!("failed to upgrade ledger schema: {}", describe(&e)))
        };
        // Concurrent CREATE TABLE IF NOT EXISTS races on the catalog; the lock
        // makes later starters wait and then find the table in place.
        let mut tx = self.client.transaction().map_err(fail)?;
        tx.execute("SELECT pg_advisory_xact_lock($1)", &[&LEDGER_SETUP_LOCK_KEY])
            .map_err(fail)?;
        tx.batch_execute(ENSURE_LEDGER_SQL).map_err(fail)?;
        tx.commit().map_err(fail)
    }

    fn supports_step(&self, sql: &str) -> bool {
        !requires_autocommit(sql)
    }

    fn fetch_ledger_entry(&mut self, version: &str) -> Result<Option<LedgerEntry>> {
        let row = self
            .client
            .query_opt(
                "SELECT version, description, checksum, applied_at
                 FROM schema_migrations WHERE version = $1",
                &[&version],
            )
            .map_err(|e| Error::Database(format!("failed to query ledger: {}", describe(&e))))?;
        row.as_ref().map(ledger_entry_from_row).transpose()
    }

    fn insert_ledger_entry(
        &mut self,
        version: &str,
        description: &str,
        checksum: &str,
    ) -> Result<()> {
        self.client
            .execute(
                "INSERT INTO schema_migrations (version, description, checksum)
                 VALUES ($1, $2, $3)",
                &[&version, &description, &checksum],
            )
            .map_err(|e| Error::Database(format!("failed to insert ledger row: {}", describe(&e))))?;
        Ok(())
    }

    fn update_ledger_metadata(
        &mut self,
        version: &str,
        description: &str,
        checksum: &str,
    ) -> Result<u64> {
        self.client
            .execute(
                "UPDATE schema_migrations SET checksum = $2, description = $3 WHERE version = $1",
                &[&version, &checksum, &description],
            )
            .map_err(|e| Error::Database(format!("failed to update ledger row: {}", describe(&e))))
    }

    fn list_ledger_entries(&mut self) -> Result<Vec<LedgerEntry>> {
        let rows = self
            .client
            .query(
                "SELECT version, description, checksum, applied_at
                 FROM schema_migrations ORDER BY version",
                &[],
            )
            .map_err(|e| Error::Database(format!("failed to query ledger: {}", describe(&e))))?;
        rows.iter().map(ledger_entry_from_row).collect()
    }
}

fn ledger_entry_from_row(row: &Row) -> Result<LedgerEntry> {
    let decode =
        |e: postgres::Error| Error::Database(format!("failed to read ledger row: {}", describe(&e)));
    Ok(LedgerEntry {
        version: row.try_get(0).map_err(decode)?,
        description: row.try_get(1).map_err(decode)?,
        checksum: row.try_get(2).map_err(decode)?,
        applied_at: row.try_get::<_, DateTime<Utc>>(3).map_err(decode)?,
    })
}

/// Server diagnostics (message, SQLSTATE, detail, hint) when the failure came
/// from Postgres; the client error text otherwise.
pub(crate) fn describe(err: &postgres::Error) -> String {
    let Some(db) = err.as_db_error() else {
        return err.to_string();
    };
    let mut out = format!("{} (SQLSTATE {})", db.message(), db.code().code());
    if let Some(detail) = db.detail() {
        out.push_str(&format!("; detail: {detail}"));
    }
    if let Some(hint) = db.hint() {
        out.push_str(&format!("; hint: {hint}"));
    }
    out
}

/// Whether `sql` holds a statement Postgres refuses inside a transaction
/// block: `CREATE`/`DROP INDEX CONCURRENTLY`, `REINDEX ... CONCURRENTLY`,
/// `VACUUM`, `ALTER SYSTEM`, and database or tablespace creation and removal.
pub(crate) fn requires_autocommit(sql: &str) -> bool {
    let code: String = sql
        .lines()
        .map(|line| line.split("--").next().unwrap_or(""))
        .collect::<Vec<_>>()
        .join("\n");

    code.split(';').any(|statement| {
        let words: Vec<String> = statement
            .split_whitespace()
            .map(|w| w.to_ascii_uppercase())
            .collect();
        let first = words.first().map(String::as_str).unwrap_or("");
        let second = words.get(1).map(String::as_str).unwrap_or("");
        let concurrently = words.iter().any(|w| w == "CONCURRENTLY");
        match (first, second) {
            ("VACUUM", _) => true,
            ("ALTER", "SYSTEM") => true,
            ("CREATE" | "DROP", "DATABASE" | "TABLESPACE") => true,
            ("CREATE", _) | ("DROP", "INDEX") | ("REINDEX", _) => {
                concurrently && (first != "CREATE" || words.iter().any(|w| w == "INDEX"))
            }
            _ => false,
        }
    })
}
