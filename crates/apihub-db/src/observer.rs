use std::time::Duration;

use apihub_common::Error;
use tracing::{debug, info, warn};

/// Receives bootstrap progress events. All methods default to no-ops, so an
/// implementation only overrides what it cares about.
pub trait BootstrapObserver: Send + Sync {
    fn probe_retry(&self, _attempt: u32, _max_attempts: u32, _delay: Duration, _error: &Error) {}

    fn migration_applied(&self, _version: &str) {}

    fn migration_skipped(&self, _version: &str) {}

    fn migration_healed(&self, _version: &str) {}
}

/// Forwards events to `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl BootstrapObserver for TracingObserver {
    fn probe_retry(&self, attempt: u32, max_attempts: u32, delay: Duration, error: &Error) {
        warn!(
            attempt,
            max_attempts,
            retry_delay_ms = delay.as_millis() as u64,
            error = %error,
            "database initialization failed, retrying"
        );
    }

    fn migration_applied(&self, version: &str) {
        info!(version, "applied migration");
    }

    fn migration_skipped(&self, version: &str) {
        debug!(version, "migration already applied");
    }

    fn migration_healed(&self, version: &str) {
        info!(version, "backfilled checksum for legacy ledger row");
    }
}

/// Drops every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct SilentObserver;

impl BootstrapObserver for SilentObserver {}
