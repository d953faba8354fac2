pub mod bootstrap;
pub mod engine;
pub mod ledger;
pub mod observer;
pub mod postgres_store;
pub mod probe;
pub mod source;
pub mod sqlite_store;
pub mod store;

pub use bootstrap::{Bootstrap, BootstrapReport, bootstrap};
pub use engine::{
    MigrationEngine, MigrationOutcome, MigrationReport, MigrationResult, MigrationState,
    MigrationStatus,
};
pub use ledger::{LedgerEntry, MigrationLedger};
pub use observer::{BootstrapObserver, SilentObserver, TracingObserver};
pub use postgres_store::PostgresStore;
pub use probe::{ConnectionProbe, Sleeper, ThreadSleeper};
pub use source::{MigrationDefinition, MigrationSource, SHIPPED_MIGRATIONS};
pub use sqlite_store::SqliteStore;
pub use store::{StoreConnection, StorePool, open_pool};
