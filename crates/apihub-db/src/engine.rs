use std::collections::BTreeMap;
use std::sync::Arc;

use apihub_common::{Error, Result};
use apihub_config::model::DEFAULT_MIGRATION_LOCK_KEY;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::ledger::{LedgerEntry, MigrationLedger, ledger_error};
use crate::observer::{BootstrapObserver, TracingObserver};
use crate::source::MigrationDefinition;
use crate::store::{StoreConnection, StorePool};

/// What happened to one migration during a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationOutcome {
    Applied,
    AlreadyApplied,
    /// Legacy ledger row whose checksum and description were filled in.
    Healed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MigrationResult {
    pub version: String,
    pub outcome: MigrationOutcome,
}

/// Per-migration outcomes of one run, in application order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MigrationReport {
    pub results: Vec<MigrationResult>,
}

impl MigrationReport {
    fn push(&mut self, version: &str, outcome: MigrationOutcome) {
        self.results.push(MigrationResult {
            version: version.to_string(),
            outcome,
        });
    }

    fn versions(&self, outcome: MigrationOutcome) -> Vec<&str> {
        self.results
            .iter()
            .filter(|r| r.outcome == outcome)
            .map(|r| r.version.as_str())
            .collect()
    }

    pub fn applied(&self) -> Vec<&str> {
        self.versions(MigrationOutcome::Applied)
    }

    pub fn already_applied(&self) -> Vec<&str> {
        self.versions(MigrationOutcome::AlreadyApplied)
    }

    pub fn healed(&self) -> Vec<&str> {
        self.versions(MigrationOutcome::Healed)
    }
}

/// Ledger state of a migration as reported by [`MigrationEngine::plan`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum MigrationState {
    Pending,
    Applied { applied_at: DateTime<Utc> },
    /// Recorded before checksums were tracked.
    Legacy { applied_at: DateTime<Utc> },
    /// Content changed after it was applied.
    Drifted {
        recorded: String,
        applied_at: DateTime<Utc>,
    },
    /// In the ledger but no longer on disk.
    Orphaned { applied_at: DateTime<Utc> },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MigrationStatus {
    pub version: String,
    pub description: String,
    #[serde(flatten)]
    pub state: MigrationState,
}

/// Applies pending migrations under an exclusive lease.
pub struct MigrationEngine {
    pool: Arc<dyn StorePool>,
    lock_key: i64,
    observer: Arc<dyn BootstrapObserver>,
}

impl MigrationEngine {
    pub fn new(pool: Arc<dyn StorePool>) -> Self {
        Self {
            pool,
            lock_key: DEFAULT_MIGRATION_LOCK_KEY,
            observer: Arc::new(TracingObserver),
        }
    }

    pub fn with_lock_key(mut self, lock_key: i64) -> Self {
        self.lock_key = lock_key;
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn BootstrapObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// Apply `migrations` in the given order.
    ///
    /// The ledger is created or upgraded first, then the lease is taken and
    /// held until the run ends. A concurrent run on another connection waits
    /// for the lease and then finds everything already applied. The first
    /// failure ends the run; migrations applied before it stay applied.
    pub fn run(&self, migrations: &[MigrationDefinition]) -> Result<MigrationReport> {
        let mut conn = self.checkout()?;
        MigrationLedger::new(conn.as_mut()).ensure_schema()?;

        let mut lease = MigrationLease::acquire(conn.as_mut(), self.lock_key)?;
        debug!("holding migration lock {}", self.lock_key);

        let mut report = MigrationReport::default();
        for migration in migrations {
            let outcome = self.step(lease.connection(), migration)?;
            match outcome {
                MigrationOutcome::Applied => self.observer.migration_applied(&migration.version),
                MigrationOutcome::AlreadyApplied => {
                    self.observer.migration_skipped(&migration.version)
                }
                MigrationOutcome::Healed => self.observer.migration_healed(&migration.version),
            }
            report.push(&migration.version, outcome);
        }
        lease.release()?;

        info!(
            "migrations complete: {} applied, {} already applied, {} healed",
            report.applied().len(),
            report.already_applied().len(),
            report.healed().len()
        );
        Ok(report)
    }

    /// Compare `migrations` with the ledger without executing anything.
    pub fn plan(&self, migrations: &[MigrationDefinition]) -> Result<Vec<MigrationStatus>> {
        let mut conn = self.checkout()?;
        let mut ledger = MigrationLedger::new(conn.as_mut());
        ledger.ensure_schema()?;

        let mut recorded: BTreeMap<String, LedgerEntry> = ledger
            .entries()?
            .into_iter()
            .map(|entry| (entry.version.clone(), entry))
            .collect();

        let mut statuses: Vec<MigrationStatus> = migrations
            .iter()
            .map(|migration| {
                let state = match recorded.remove(&migration.version) {
                    None => MigrationState::Pending,
                    Some(entry) => match entry.checksum {
                        Some(checksum) if checksum == migration.checksum => {
                            MigrationState::Applied {
                                applied_at: entry.applied_at,
                            }
                        }
                        Some(checksum) => MigrationState::Drifted {
                            recorded: checksum,
                            applied_at: entry.applied_at,
                        },
                        None => MigrationState::Legacy {
                            applied_at: entry.applied_at,
                        },
                    },
                };
                MigrationStatus {
                    version: migration.version.clone(),
                    description: migration.description.clone(),
                    state,
                }
            })
            .collect();

        statuses.extend(recorded.into_values().map(|entry| MigrationStatus {
            version: entry.version,
            description: entry.description,
            state: MigrationState::Orphaned {
                applied_at: entry.applied_at,
            },
        }));
        statuses.sort_by(|a, b| a.version.cmp(&b.version));
        Ok(statuses)
    }

    fn checkout(&self) -> Result<Box<dyn StoreConnection>> {
        self.pool
            .checkout()
            .map_err(|e| ledger_error("checking out a connection", e))
    }

    fn step(
        &self,
        conn: &mut dyn StoreConnection,
        migration: &MigrationDefinition,
    ) -> Result<MigrationOutcome> {
        let recorded = MigrationLedger::new(&mut *conn).lookup(&migration.version)?;
        let Some(entry) = recorded else {
            self.apply(conn, migration)?;
            return Ok(MigrationOutcome::Applied);
        };

        match entry.checksum {
            Some(recorded) if recorded == migration.checksum => Ok(MigrationOutcome::AlreadyApplied),
            Some(recorded) => Err(Error::ChecksumMismatch {
                version: migration.version.clone(),
                recorded,
                current: migration.checksum.clone(),
            }),
            None => {
                MigrationLedger::new(conn).heal_metadata(
                    &migration.version,
                    &migration.description,
                    &migration.checksum,
                )?;
                Ok(MigrationOutcome::Healed)
            }
        }
    }

    /// Execute the content and record it as one step. Content the backend
    /// cannot run in a step is executed on its own and recorded afterwards,
    /// with no rollback if it fails partway.
    fn apply(&self, conn: &mut dyn StoreConnection, migration: &MigrationDefinition) -> Result<()> {
        debug!("applying migration {}", migration.version);
        if !conn.supports_step(&migration.content) {
            warn!(
                "migration {} cannot run in a transaction, applying without rollback",
                migration.version
            );
            conn.execute_script(&migration.content)
                .map_err(|e| sql_error(migration, e))?;
            return MigrationLedger::new(conn).record_applied(
                &migration.version,
                &migration.description,
                &migration.checksum,
            );
        }

        conn.begin_step().map_err(|e| sql_error(migration, e))?;

        let result = match conn.execute_script(&migration.content) {
            Ok(()) => MigrationLedger::new(&mut *conn).record_applied(
                &migration.version,
                &migration.description,
                &migration.checksum,
            ),
            Err(e) => Err(sql_error(migration, e)),
        };

        match result {
            Ok(()) => conn.commit_step().map_err(|e| sql_error(migration, e)),
            Err(e) => {
                if let Err(rollback) = conn.rollback_step() {
                    warn!(
                        "failed to roll back migration {}: {rollback}",
                        migration.version
                    );
                }
                Err(e)
            }
        }
    }
}

fn sql_error(migration: &MigrationDefinition, err: Error) -> Error {
    let message = match err {
        Error::Database(message) => message,
        other => other.to_string(),
    };
    Error::SqlExecution {
        version: migration.version.clone(),
        message,
    }
}

/// Exclusive lease over a connection. Released explicitly on success and on
/// drop for every early return.
struct MigrationLease<'c> {
    conn: &'c mut dyn StoreConnection,
    key: i64,
    held: bool,
}

impl<'c> MigrationLease<'c> {
    fn acquire(conn: &'c mut dyn StoreConnection, key: i64) -> Result<Self> {
        conn.acquire_lease(key)
            .map_err(|e| ledger_error("acquiring migration lock", e))?;
        Ok(Self {
            conn,
            key,
            held: true,
        })
    }

    fn connection(&mut self) -> &mut dyn StoreConnection {
        &mut *self.conn
    }

    fn release(mut self) -> Result<()> {
        self.held = false;
        self.conn
            .release_lease(self.key)
            .map_err(|e| ledger_error("releasing migration lock", e))
    }
}

impl Drop for MigrationLease<'_> {
    fn drop(&mut self) {
        if !self.held {
            return;
        }
        if let Err(e) = self.conn.release_lease(self.key) {
            warn!("failed to release migration lock {}: {e}", self.key);
        }
    }
}
