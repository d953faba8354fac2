use std::sync::Arc;
use std::time::Duration;

use apihub_common::{Error, Result};
use tracing::info;

use crate::observer::{BootstrapObserver, TracingObserver};
use crate::store::StorePool;

/// Suspends the caller between probe attempts.
pub trait Sleeper: Send + Sync {
    fn sleep(&self, delay: Duration);
}

/// Blocks the current thread.
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadSleeper;

impl Sleeper for ThreadSleeper {
    fn sleep(&self, delay: Duration) {
        std::thread::sleep(delay);
    }
}

/// Waits for the store to accept connections.
pub struct ConnectionProbe {
    pool: Arc<dyn StorePool>,
    sleeper: Arc<dyn Sleeper>,
    observer: Arc<dyn BootstrapObserver>,
}

impl ConnectionProbe {
    pub fn new(pool: Arc<dyn StorePool>) -> Self {
        Self {
            pool,
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

    /// Check out a connection and run `SELECT 1`, retrying with a constant
    /// `delay` up to `max_attempts` times. Returns the number of attempts
    /// used. After the last failed attempt the error is
    /// [`Error::Connectivity`] carrying the underlying failure.
    pub fn establish(&self, max_attempts: u32, delay: Duration) -> Result<u32> {
        let max_attempts = max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match self.attempt() {
                Ok(()) => {
                    if attempt > 1 {
                        info!(
                            "database reachable after {attempt} attempt(s) ({})",
                            self.pool.backend()
                        );
                    }
                    return Ok(attempt);
                }
                Err(e) if attempt < max_attempts => {
                    self.observer.probe_retry(attempt, max_attempts, delay, &e);
                    self.sleeper.sleep(delay);
                    attempt += 1;
                }
                Err(e) => {
                    return Err(Error::Connectivity {
                        attempts: attempt,
                        message: e.to_string(),
                    });
                }
            }
        }
    }

    fn attempt(&self) -> Result<()> {
        // The connection goes back to the pool when it drops, on both paths.
        let mut conn = self.pool.checkout()?;
        conn.ping()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

    use super::*;
    use crate::ledger::LedgerEntry;
    use crate::store::StoreConnection;

    /// Pool whose first `failures` checkouts fail. Tracks live connections.
    pub(crate) struct FlakyPool {
        failures: u32,
        pub(crate) checkouts: AtomicU32,
        pub(crate) live: Arc<AtomicUsize>,
    }

    impl FlakyPool {
        pub(crate) fn new(failures: u32) -> Self {
            Self {
                failures,
                checkouts: AtomicU32::new(0),
                live: Arc::new(AtomicUsize::new(0)),
            }
        }
    }

    impl StorePool for FlakyPool {
        fn checkout(&self) -> Result<Box<dyn StoreConnection>> {
            let n = self.checkouts.fetch_add(1, Ordering::SeqCst) + 1;
            if n <= self.failures {
                return Err(Error::Database("connection refused".into()));
            }
            self.live.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(FakeConnection {
                live: self.live.clone(),
                ping_fails: false,
            }))
        }

        fn backend(&self) -> &'static str {
            "fake"
        }
    }

    /// Pool that always connects but whose ping always fails.
    struct DeadPingPool {
        live: Arc<AtomicUsize>,
    }

    impl StorePool for DeadPingPool {
        fn checkout(&self) -> Result<Box<dyn StoreConnection>> {
            self.live.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(FakeConnection {
                live: self.live.clone(),
                ping_fails: true,
            }))
        }

        fn backend(&self) -> &'static str {
            "fake"
        }
    }

    struct FakeConnection {
        live: Arc<AtomicUsize>,
        ping_fails: bool,
    }

    impl Drop for FakeConnection {
        fn drop(&mut self) {
            self.live.fetch_sub(1, Ordering::SeqCst);
        }
    }

    impl StoreConnection for FakeConnection {
        fn ping(&mut self) -> Result<()> {
            if self.ping_fails {
                Err(Error::Database("server closed the connection".into()))
            } else {
                Ok(())
            }
        }
        fn execute_script(&mut self, _sql: &str) -> Result<()> {
            Ok(())
        }
        fn begin_step(&mut self) -> Result<()> {
            Ok(())
        }
        fn commit_step(&mut self) -> Result<()> {
            Ok(())
        }
        fn rollback_step(&mut self) -> Result<()> {
            Ok(())
        }
        fn acquire_lease(&mut self, _key: i64) -> Result<()> {
            Ok(())
        }
        fn release_lease(&mut self, _key: i64) -> Result<()> {
            Ok(())
        }
        fn ensure_ledger_schema(&mut self) -> Result<()> {
            Ok(())
        }
        fn fetch_ledger_entry(&mut self, _version: &str) -> Result<Option<LedgerEntry>> {
            Ok(None)
        }
        fn insert_ledger_entry(&mut self, _: &str, _: &str, _: &str) -> Result<()> {
            Ok(())
        }
        fn update_ledger_metadata(&mut self, _: &str, _: &str, _: &str) -> Result<u64> {
            Ok(0)
        }
        fn list_ledger_entries(&mut self) -> Result<Vec<LedgerEntry>> {
            Ok(Vec::new())
        }
    }

    #[derive(Default)]
    pub(crate) struct RecordingSleeper {
        pub(crate) sleeps: Mutex<Vec<Duration>>,
    }

    impl Sleeper for RecordingSleeper {
        fn sleep(&self, delay: Duration) {
            self.sleeps.lock().unwrap().push(delay);
        }
    }

    #[derive(Default)]
    pub(crate) struct RecordingObserver {
        pub(crate) retries: Mutex<Vec<(u32, u32, Duration, String)>>,
    }

    impl BootstrapObserver for RecordingObserver {
        fn probe_retry(&self, attempt: u32, max_attempts: u32, delay: Duration, error: &Error) {
            self.retries
                .lock()
                .unwrap()
                .push((attempt, max_attempts, delay, error.to_string()));
        }
    }

    #[test]
    fn succeeds_on_second_attempt_with_one_logged_retry() {
        let pool = Arc::new(FlakyPool::new(1));
        let sleeper = Arc::new(RecordingSleeper::default());
        let observer = Arc::new(RecordingObserver::default());
        let probe = ConnectionProbe::new(pool.clone())
            .with_sleeper(sleeper.clone())
            .with_observer(observer.clone());

        let attempts = probe.establish(3, Duration::from_millis(2000)).unwrap();

        assert_eq!(attempts, 2);
        assert_eq!(pool.checkouts.load(Ordering::SeqCst), 2);
        assert_eq!(*sleeper.sleeps.lock().unwrap(), vec![Duration::from_millis(2000)]);
        let retries = observer.retries.lock().unwrap();
        assert_eq!(retries.len(), 1);
        assert_eq!(retries[0].0, 1);
        assert_eq!(retries[0].1, 3);
        assert_eq!(pool.live.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn exhausted_attempts_raise_connectivity_error() {
        let pool = Arc::new(FlakyPool::new(u32::MAX));
        let sleeper = Arc::new(RecordingSleeper::default());
        let probe = ConnectionProbe::new(pool.clone())
            .with_sleeper(sleeper.clone())
            .with_observer(Arc::new(crate::observer::SilentObserver));

        let err = probe.establish(2, Duration::from_millis(10)).unwrap_err();

        assert_eq!(pool.checkouts.load(Ordering::SeqCst), 2);
        // No sleep after the final attempt.
        assert_eq!(sleeper.sleeps.lock().unwrap().len(), 1);
        match err {
            Error::Connectivity { attempts, message } => {
                assert_eq!(attempts, 2);
                assert!(message.contains("connection refused"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn delay_is_constant_between_attempts() {
        let pool = Arc::new(FlakyPool::new(3));
        let sleeper = Arc::new(RecordingSleeper::default());
        let probe = ConnectionProbe::new(pool).with_sleeper(sleeper.clone());

        assert_eq!(probe.establish(10, Duration::from_millis(250)).unwrap(), 4);
        assert_eq!(
            *sleeper.sleeps.lock().unwrap(),
            vec![Duration::from_millis(250); 3]
        );
    }

    #[test]
    fn failed_ping_releases_connection_every_attempt() {
        let live = Arc::new(AtomicUsize::new(0));
        let pool = Arc::new(DeadPingPool { live: live.clone() });
        let probe = ConnectionProbe::new(pool).with_sleeper(Arc::new(RecordingSleeper::default()));

        let err = probe.establish(3, Duration::from_millis(1)).unwrap_err();

        assert!(err.to_string().contains("server closed the connection"));
        assert_eq!(live.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn zero_attempts_still_tries_once() {
        let pool = Arc::new(FlakyPool::new(0));
        let probe = ConnectionProbe::new(pool.clone());
        assert_eq!(probe.establish(0, Duration::ZERO).unwrap(), 1);
        assert_eq!(pool.checkouts.load(Ordering::SeqCst), 1);
    }
}
