use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("database unreachable after {attempts} attempt(s): {message}")]
    Connectivity { attempts: u32, message: String },

    #[error("failed to read migrations from {}: {message}", path.display())]
    SourceRead { path: PathBuf, message: String },

    #[error("checksum mismatch for migration {version}: recorded {recorded}, found {current}")]
    ChecksumMismatch {
        version: String,
        recorded: String,
        current: String,
    },

    #[error("migration {version} failed: {message}")]
    SqlExecution { version: String, message: String },

    #[error("migration ledger error while {context}: {message}")]
    LedgerWrite { context: String, message: String },

    #[error("database error: {0}")]
    Database(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// The bootstrap stage this error belongs to, used in operator-facing
    /// diagnostics.
    pub fn stage(&self) -> &'static str {
        match self {
            Error::Config(_) => "configuration",
            Error::Connectivity { .. } => "connectivity",
            Error::SourceRead { .. } | Error::Io(_) => "discovery",
            Error::ChecksumMismatch { .. } | Error::SqlExecution { .. } => "migration",
            Error::LedgerWrite { .. } | Error::Database(_) => "ledger",
        }
    }

    /// Migration version named by the error, if any.
    pub fn version(&self) -> Option<&str> {
        match self {
            Error::ChecksumMismatch { version, .. } | Error::SqlExecution { version, .. } => {
                Some(version)
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::Error;

    #[test]
    fn error_display_includes_context() {
        let e = Error::Config("DATABASE_URL is required".into());
        assert_eq!(e.to_string(), "configuration error: DATABASE_URL is required");

        let e = Error::Connectivity {
            attempts: 2,
            message: "connection refused".into(),
        };
        assert_eq!(
            e.to_string(),
            "database unreachable after 2 attempt(s): connection refused"
        );

        let e = Error::ChecksumMismatch {
            version: "20240101_001_init".into(),
            recorded: "aa".into(),
            current: "bb".into(),
        };
        assert_eq!(
            e.to_string(),
            "checksum mismatch for migration 20240101_001_init: recorded aa, found bb"
        );
    }

    #[test]
    fn stages_name_the_failing_step() {
        assert_eq!(Error::Config("x".into()).stage(), "configuration");
        assert_eq!(
            Error::Connectivity {
                attempts: 1,
                message: "x".into()
            }
            .stage(),
            "connectivity"
        );
        assert_eq!(
            Error::SourceRead {
                path: "migrations".into(),
                message: "x".into()
            }
            .stage(),
            "discovery"
        );
        assert_eq!(
            Error::SqlExecution {
                version: "v".into(),
                message: "x".into()
            }
            .stage(),
            "migration"
        );
        assert_eq!(
            Error::LedgerWrite {
                context: "x".into(),
                message: "y".into()
            }
            .stage(),
            "ledger"
        );
    }

    #[test]
    fn version_is_reported_for_migration_failures() {
        let e = Error::SqlExecution {
            version: "20240102_001_add_index".into(),
            message: "syntax error".into(),
        };
        assert_eq!(e.version(), Some("20240102_001_add_index"));
        assert_eq!(Error::Database("boom".into()).version(), None);
    }
}
