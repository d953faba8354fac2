use apihub_common::{Error, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::store::StoreConnection;

/// Name of the table recording applied migrations.
pub const LEDGER_TABLE: &str = "schema_migrations";

/// One row of the migration ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LedgerEntry {
    pub version: String,
    pub description: String,
    /// `None` only for rows written before checksums were tracked.
    pub checksum: Option<String>,
    pub applied_at: DateTime<Utc>,
}

/// Read-modify-write access to the ledger over a single connection.
///
/// Driver failures surface as [`Error::LedgerWrite`] naming the operation.
pub struct MigrationLedger<'c> {
    conn: &'c mut dyn StoreConnection,
}

impl<'c> MigrationLedger<'c> {
    pub fn new(conn: &'c mut dyn StoreConnection) -> Self {
        Self { conn }
    }

    /// Create the table or add the columns an older deployment lacks. Safe
    /// to call on every startup.
    pub fn ensure_schema(&mut self) -> Result<()> {
        self.conn
            .ensure_ledger_schema()
            .map_err(|e| ledger_error("ensuring ledger schema", e))
    }

    pub fn lookup(&mut self, version: &str) -> Result<Option<LedgerEntry>> {
        self.conn
            .fetch_ledger_entry(version)
            .map_err(|e| ledger_error(&format!("looking up {version}"), e))
    }

    /// Insert the row for a freshly applied migration. An existing row for
    /// `version` is an error.
    pub fn record_applied(&mut self, version: &str, description: &str, checksum: &str) -> Result<()> {
        self.conn
            .insert_ledger_entry(version, description, checksum)
            .map_err(|e| ledger_error(&format!("recording {version}"), e))
    }

    /// Fill in checksum and description on a legacy row. `applied_at` is
    /// left untouched.
    pub fn heal_metadata(&mut self, version: &str, description: &str, checksum: &str) -> Result<()> {
        let updated = self
            .conn
            .update_ledger_metadata(version, description, checksum)
            .map_err(|e| ledger_error(&format!("healing {version}"), e))?;
        if updated == 0 {
            return Err(Error::LedgerWrite {
                context: format!("healing {version}"),
                message: "no ledger row to update".into(),
            });
        }
        Ok(())
    }

    pub fn entries(&mut self) -> Result<Vec<LedgerEntry>> {
        self.conn
            .list_ledger_entries()
            .map_err(|e| ledger_error("listing ledger entries", e))
    }
}

pub(crate) fn ledger_error(context: &str, err: Error) -> Error {
    let message = match err {
        Error::Database(message) => message,
        other => other.to_string(),
    };
    Error::LedgerWrite {
        context: context.to_string(),
        message,
    }
}
