//! Retention purge worker
//!
//! Every pass computes `now - purge delay`, purges the change-number index
//! up to that point and then purges every replica log up to the CSN of the
//! oldest index record left. Replica records still referenced by the index
//! are never removed. The worker sleeps until the oldest remaining record
//! becomes purgeable or the purge interval elapses, whichever comes first.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use changelog_core::{now_millis, ChangelogError, ChangelogResult, Csn};
use changelog_storage::{ChangeNumberIndexLog, DomainLogStore};
use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, info};

use crate::FatalErrorHandler;

/// Name of the purge worker thread
pub const PURGER_THREAD_NAME: &str = "changelog-purger";

/// Everything one purge pass touches
#[derive(Clone)]
pub struct PurgeContext {
    store: Arc<DomainLogStore>,
    cn_index: Arc<ChangeNumberIndexLog>,
    compute_change_number: Arc<AtomicBool>,
    /// Held for a whole pass; structural operations take it to exclude purging
    purge_lock: Arc<Mutex<()>>,
}

impl PurgeContext {
    /// Bundle the logs a purge pass works on
    pub fn new(
        store: Arc<DomainLogStore>,
        cn_index: Arc<ChangeNumberIndexLog>,
        compute_change_number: Arc<AtomicBool>,
        purge_lock: Arc<Mutex<()>>,
    ) -> Self {
        PurgeContext {
            store,
            cn_index,
            compute_change_number,
            purge_lock,
        }
    }

    /// Purge everything older than `purge_csn` that the index no longer needs.
    ///
    /// Returns the CSN of the oldest update left in any replica log.
    pub fn run_once(&self, purge_csn: &Csn) -> ChangelogResult<Option<Csn>> {
        let _purging = self.purge_lock.lock();

        let bound = if self.compute_change_number.load(Ordering::SeqCst) {
            match self.cn_index.purge_up_to(purge_csn)? {
                Some(oldest_indexed) => oldest_indexed.min(*purge_csn),
                None => {
                    debug!(target: "changelog::purge", "Change number index is empty, nothing to purge");
                    return Ok(self.oldest_replica_csn());
                }
            }
        } else {
            *purge_csn
        };

        let mut oldest: Option<Csn> = None;
        for (_, log) in self.store.all_replicas() {
            if let Some(survivor) = log.purge_up_to(&bound)? {
                oldest = Some(oldest.map_or(survivor, |o| o.min(survivor)));
            }
        }
        debug!(target: "changelog::purge", %bound, oldest = ?oldest, "Purge pass done");
        Ok(oldest)
    }

    fn oldest_replica_csn(&self) -> Option<Csn> {
        self.store
            .all_replicas()
            .iter()
            .filter_map(|(_, log)| log.oldest_csn())
            .min()
    }
}

struct PurgerSync {
    shutdown: bool,
    delay: Duration,
    failure: Option<String>,
    stopped: bool,
    passes: u64,
}

struct PurgerShared {
    sync: Mutex<PurgerSync>,
    /// Signalled on shutdown, on a delay change and after each pass
    wake: Condvar,
}

/// Handle on the purge worker
pub struct Purger {
    shared: Arc<PurgerShared>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Purger {
    /// Spawn the purge worker.
    ///
    /// A zero `delay` keeps the worker idle until a delay is set.
    pub fn start(
        context: PurgeContext,
        delay: Duration,
        interval: Duration,
        fatal: Option<FatalErrorHandler>,
    ) -> ChangelogResult<Self> {
        let shared = Arc::new(PurgerShared {
            sync: Mutex::new(PurgerSync {
                shutdown: false,
                delay,
                failure: None,
                stopped: false,
                passes: 0,
            }),
            wake: Condvar::new(),
        });
        let worker_shared = Arc::clone(&shared);
        let handle = std::thread::Builder::new()
            .name(PURGER_THREAD_NAME.to_string())
            .spawn(move || purge_loop(&worker_shared, &context, interval, fatal))
            .map_err(|e| ChangelogError::storage(format!("failed to spawn purge thread: {}", e)))?;
        Ok(Purger {
            shared,
            handle: Mutex::new(Some(handle)),
        })
    }

    /// Change the retention period; zero disables purging
    pub fn set_purge_delay(&self, delay: Duration) {
        let mut sync = self.shared.sync.lock();
        sync.delay = delay;
        info!(target: "changelog::purge", delay_secs = delay.as_secs(), "Purge delay changed");
        self.shared.wake.notify_all();
    }

    /// Current retention period
    pub fn purge_delay(&self) -> Duration {
        self.shared.sync.lock().delay
    }

    /// Number of completed purge passes
    pub fn passes(&self) -> u64 {
        self.shared.sync.lock().passes
    }

    /// Error that stopped the worker, if any
    pub fn failure(&self) -> Option<String> {
        self.shared.sync.lock().failure.clone()
    }

    /// True once the worker exited
    pub fn is_stopped(&self) -> bool {
        self.shared.sync.lock().stopped
    }

    /// Stop the worker and wait for it to exit. Idempotent.
    pub fn shutdown(&self) {
        {
            let mut sync = self.shared.sync.lock();
            sync.shutdown = true;
            self.shared.wake.notify_all();
        }
        if let Some(handle) = self.handle.lock().take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Purger {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// How long to sleep before the next pass
fn next_sleep(oldest: Option<Csn>, delay: Duration, interval: Duration) -> Duration {
    let Some(oldest) = oldest else {
        return interval;
    };
    let purgeable_at = oldest.time().saturating_add(delay.as_millis() as i64);
    let wait_ms = purgeable_at.saturating_sub(now_millis()).max(1) as u64;
    Duration::from_millis(wait_ms).min(interval)
}

fn purge_loop(
    shared: &PurgerShared,
    context: &PurgeContext,
    interval: Duration,
    fatal: Option<FatalErrorHandler>,
) {
    info!(target: "changelog::purge", "Purger started");
    loop {
        let delay = {
            let sync = shared.sync.lock();
            if sync.shutdown {
                break;
            }
            sync.delay
        };

        let sleep = if delay.is_zero() {
            interval
        } else {
            let purge_csn = Csn::new(now_millis() - delay.as_millis() as i64, 0, 0);
            match context.run_once(&purge_csn) {
                Ok(oldest) => next_sleep(oldest, delay, interval),
                Err(e) => {
                    error!(target: "changelog::purge", error = %e, "Purger stopped on fatal error");
                    {
                        let mut sync = shared.sync.lock();
                        sync.failure = Some(e.to_string());
                        sync.stopped = true;
                        shared.wake.notify_all();
                    }
                    if let Some(fatal) = &fatal {
                        fatal(&e);
                    }
                    return;
                }
            }
        };

        let mut sync = shared.sync.lock();
        if !delay.is_zero() {
            sync.passes += 1;
        }
        if !sync.shutdown {
            shared.wake.wait_for(&mut sync, sleep);
        }
    }

    shared.sync.lock().stopped = true;
    info!(target: "changelog::purge", "Purger stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use changelog_core::{BaseDn, UpdateMsg};
    use changelog_storage::ChangelogStateStore;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        context: PurgeContext,
        store: Arc<DomainLogStore>,
        cn_index: Arc<ChangeNumberIndexLog>,
    }

    fn fixture(indexing: bool) -> Fixture {
        let dir = TempDir::new().unwrap();
        let state = ChangelogStateStore::open(dir.path()).unwrap();
        let cn_index = Arc::new(ChangeNumberIndexLog::open(&state.cn_index_dir(), false).unwrap());
        let store = Arc::new(DomainLogStore::open(state, false).unwrap());
        let context = PurgeContext::new(
            Arc::clone(&store),
            Arc::clone(&cn_index),
            Arc::new(AtomicBool::new(indexing)),
            Arc::new(Mutex::new(())),
        );
        Fixture {
            _dir: dir,
            context,
            store,
            cn_index,
        }
    }

    fn dn() -> BaseDn {
        BaseDn::new("o=purge").unwrap()
    }

    fn write(f: &Fixture, times: &[i64]) {
        let log = f.store.get_or_create(&dn(), 1).unwrap();
        for t in times {
            log.add(&UpdateMsg::new(Csn::new(*t, 0, 1), vec![])).unwrap();
        }
    }

    #[test]
    fn test_purge_without_index_uses_time_bound() {
        let f = fixture(false);
        write(&f, &[10, 20, 30]);

        let oldest = f.context.run_once(&Csn::new(25, 0, 0)).unwrap();
        assert_eq!(oldest, Some(Csn::new(30, 0, 1)));

        let again = f.context.run_once(&Csn::new(25, 0, 0)).unwrap();
        assert_eq!(again, oldest);
    }

    #[test]
    fn test_purge_keeps_records_still_indexed() {
        let f = fixture(true);
        write(&f, &[10, 20, 30]);
        f.cn_index
            .add_record(String::new(), dn(), Csn::new(10, 0, 1))
            .unwrap();
        f.cn_index
            .add_record(String::new(), dn(), Csn::new(20, 0, 1))
            .unwrap();

        let oldest = f.context.run_once(&Csn::new(100, 0, 0)).unwrap();
        assert_eq!(oldest, Some(Csn::new(20, 0, 1)));
        assert_eq!(f.cn_index.number_of_records(), 1);
    }

    #[test]
    fn test_empty_index_purges_nothing() {
        let f = fixture(true);
        write(&f, &[10]);
        let oldest = f.context.run_once(&Csn::new(100, 0, 0)).unwrap();
        assert_eq!(oldest, Some(Csn::new(10, 0, 1)));
        assert_eq!(f.store.replica(&dn(), 1).unwrap().number_of_records(), 1);
    }

    #[test]
    fn test_next_sleep_is_bounded() {
        let interval = Duration::from_millis(500);
        assert_eq!(next_sleep(None, Duration::from_secs(1), interval), interval);

        let old = Csn::new(0, 0, 1);
        assert_eq!(
            next_sleep(Some(old), Duration::from_secs(1), interval),
            Duration::from_millis(1)
        );

        let recent = Csn::new(now_millis(), 0, 1);
        assert_eq!(
            next_sleep(Some(recent), Duration::from_secs(3600), interval),
            interval
        );
    }

    #[test]
    fn test_worker_purges_and_stops() {
        let f = fixture(false);
        write(&f, &[1, 2, 3]);
        let purger = Purger::start(
            f.context.clone(),
            Duration::from_millis(10),
            Duration::from_millis(10),
            None,
        )
        .unwrap();

        let log = f.store.replica(&dn(), 1).unwrap();
        for _ in 0..500 {
            if log.is_empty() {
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        assert!(log.is_empty());
        assert!(purger.passes() > 0);

        purger.shutdown();
        assert!(purger.is_stopped());
        assert!(purger.failure().is_none());
        purger.shutdown();
    }
}
