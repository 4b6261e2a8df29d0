//! Change-number indexer
//!
//! A dedicated worker thread merges the updates of every replica of every
//! domain in CSN order and assigns each one a change number, but only once
//! the update is below the medium consistency point: every online replica
//! of its domain has been heard from with a newer CSN, so nothing older can
//! still arrive.
//!
//! # Lifecycle
//!
//! ```text
//! Initializing -> Running -> Draining -> Initializing -> Running ...
//!                    |                        |
//!                    +-----> ShuttingDown ----+--> Stopped
//! ```
//!
//! Publishers record liveness and wake the worker through one mutex and
//! condition variable pair. Administrative callers use a second condition
//! variable to wait for the worker to acknowledge a state change.

mod liveness;
mod worker;

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use changelog_core::{BaseDn, ChangelogError, ChangelogResult, Csn, MultiDomainServerState};
use changelog_storage::{ChangeNumberIndexLog, DomainLogStore};
use parking_lot::{Condvar, Mutex};
use tracing::{debug, info};

use crate::FatalErrorHandler;
use liveness::Liveness;
use worker::IndexerWorker;

/// Name of the indexer worker thread
pub const INDEXER_THREAD_NAME: &str = "changelog-indexer";

/// State of the indexer worker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexerState {
    /// Rebuilding cursors and consistency state from disk
    Initializing,
    /// Indexing admitted updates
    Running,
    /// Cursors released while an administrative operation runs
    Draining,
    /// Shutdown requested, worker exiting
    ShuttingDown,
    /// Worker exited, normally or after a fatal error
    Stopped,
}

impl fmt::Display for IndexerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            IndexerState::Initializing => "initializing",
            IndexerState::Running => "running",
            IndexerState::Draining => "draining",
            IndexerState::ShuttingDown => "shutting down",
            IndexerState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// State shared between the worker and its callers
#[derive(Debug)]
pub(crate) struct IndexerSync {
    pub(crate) state: IndexerState,
    pub(crate) failure: Option<String>,
    /// Error that prevented the first initialization
    pub(crate) startup_error: Option<ChangelogError>,
    /// Bumped on every notification that may let the worker progress
    pub(crate) epoch: u64,
    /// Replicas heard from since the worker last looked
    pub(crate) new_replicas: BTreeSet<(BaseDn, i32)>,
    pub(crate) shutdown: bool,
    pub(crate) pause_requests: usize,
    pub(crate) reset_requested: bool,
    pub(crate) liveness: Liveness,
    pub(crate) medium_consistency: Option<(BaseDn, Csn)>,
    /// CSN of the last indexed update of every replica
    pub(crate) ruv: MultiDomainServerState,
}

pub(crate) struct IndexerShared {
    pub(crate) sync: Mutex<IndexerSync>,
    /// Wakes the worker
    pub(crate) wake: Condvar,
    /// Wakes callers waiting on the worker
    pub(crate) ack: Condvar,
}

impl IndexerShared {
    fn new() -> Self {
        IndexerShared {
            sync: Mutex::new(IndexerSync {
                state: IndexerState::Initializing,
                failure: None,
                startup_error: None,
                epoch: 0,
                new_replicas: BTreeSet::new(),
                shutdown: false,
                pause_requests: 0,
                reset_requested: false,
                liveness: Liveness::default(),
                medium_consistency: None,
                ruv: MultiDomainServerState::new(),
            }),
            wake: Condvar::new(),
            ack: Condvar::new(),
        }
    }
}

/// Handle on the running change-number indexer
pub struct ChangeNumberIndexer {
    shared: Arc<IndexerShared>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl ChangeNumberIndexer {
    /// Spawn the worker and wait until it finished initializing.
    ///
    /// # Errors
    ///
    /// Returns the initialization failure, e.g. a `Consistency` error when
    /// the newest index record is not found in its replica log.
    pub fn start(
        store: Arc<DomainLogStore>,
        cn_index: Arc<ChangeNumberIndexLog>,
        wake_interval: Duration,
        fatal: Option<FatalErrorHandler>,
    ) -> ChangelogResult<Self> {
        let shared = Arc::new(IndexerShared::new());
        let worker = IndexerWorker::new(
            Arc::clone(&shared),
            store,
            cn_index,
            wake_interval,
            fatal,
        );
        let handle = std::thread::Builder::new()
            .name(INDEXER_THREAD_NAME.to_string())
            .spawn(move || worker.run())
            .map_err(|e| {
                ChangelogError::storage(format!("failed to spawn indexer thread: {}", e))
            })?;
        let indexer = ChangeNumberIndexer {
            shared,
            handle: Mutex::new(Some(handle)),
        };

        let mut sync = indexer.shared.sync.lock();
        while sync.state == IndexerState::Initializing {
            indexer.shared.ack.wait(&mut sync);
        }
        if sync.state == IndexerState::Stopped {
            let error = sync.startup_error.take().unwrap_or_else(|| {
                ChangelogError::InvalidOperation("indexer stopped during initialization".into())
            });
            drop(sync);
            indexer.join();
            return Err(error);
        }
        drop(sync);
        Ok(indexer)
    }

    /// A replica stored an update
    pub fn publish_update_msg(&self, domain: &BaseDn, csn: &Csn) {
        let mut sync = self.shared.sync.lock();
        sync.liveness.alive(domain, *csn);
        sync.new_replicas.insert((domain.clone(), csn.server_id()));
        sync.epoch += 1;
        self.shared.wake.notify_all();
    }

    /// A replica proved it has passed `csn` without sending an update
    pub fn publish_heartbeat(&self, domain: &BaseDn, csn: &Csn) {
        let mut sync = self.shared.sync.lock();
        sync.liveness.alive(domain, *csn);
        sync.epoch += 1;
        self.shared.wake.notify_all();
    }

    /// A replica disconnected; its last CSN was `csn`
    pub fn replica_offline(&self, domain: &BaseDn, csn: &Csn) {
        let mut sync = self.shared.sync.lock();
        sync.liveness.set_offline(domain, *csn);
        sync.epoch += 1;
        self.shared.wake.notify_all();
    }

    /// Newest indexed update, with its domain
    pub fn medium_consistency(&self) -> Option<(BaseDn, Csn)> {
        self.shared.sync.lock().medium_consistency.clone()
    }

    /// CSN of the last indexed update of every replica
    pub fn medium_consistency_cookie(&self) -> MultiDomainServerState {
        self.shared.sync.lock().ruv.clone()
    }

    /// Newest CSN every replica was heard from with
    pub fn last_alive_state(&self) -> MultiDomainServerState {
        self.shared.sync.lock().liveness.last_alive().clone()
    }

    /// Block until the medium consistency point reaches `csn`.
    ///
    /// Returns false on timeout or if the worker stopped first.
    pub fn await_medium_consistency(&self, csn: &Csn, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut sync = self.shared.sync.lock();
        loop {
            if let Some((_, reached)) = &sync.medium_consistency {
                if reached.is_newer_than_or_equal(csn) {
                    return true;
                }
            }
            if sync.state == IndexerState::Stopped {
                return false;
            }
            if self.shared.ack.wait_until(&mut sync, deadline).timed_out() {
                return sync
                    .medium_consistency
                    .as_ref()
                    .map_or(false, |(_, reached)| reached.is_newer_than_or_equal(csn));
            }
        }
    }

    /// Current worker state
    pub fn state(&self) -> IndexerState {
        self.shared.sync.lock().state
    }

    /// Error that stopped the worker, if any
    pub fn failure(&self) -> Option<String> {
        self.shared.sync.lock().failure.clone()
    }

    /// Run `f` while the worker holds no cursor.
    ///
    /// The worker releases every cursor, `f` runs, then the worker rebuilds
    /// its state from disk. With `reset`, in-memory liveness and the medium
    /// consistency point are discarded first. Returns once the worker is
    /// running again (or stopped).
    pub fn pause_while<T>(
        &self,
        reset: bool,
        f: impl FnOnce() -> ChangelogResult<T>,
    ) -> ChangelogResult<T> {
        let mut sync = self.shared.sync.lock();
        sync.pause_requests += 1;
        if reset {
            sync.reset_requested = true;
        }
        self.shared.wake.notify_all();
        while !matches!(sync.state, IndexerState::Draining | IndexerState::Stopped) {
            self.shared.ack.wait(&mut sync);
        }
        drop(sync);

        debug!(target: "changelog::indexer", reset, "Indexer paused");
        let result = f();

        let mut sync = self.shared.sync.lock();
        sync.pause_requests -= 1;
        self.shared.wake.notify_all();
        while sync.pause_requests == 0
            && matches!(
                sync.state,
                IndexerState::Draining | IndexerState::Initializing
            )
        {
            self.shared.ack.wait(&mut sync);
        }
        result
    }

    /// Discard cursors and liveness and rebuild them from disk
    pub fn clear(&self) -> ChangelogResult<()> {
        self.pause_while(true, || Ok(()))
    }

    /// Drop every trace of `domain` from the consistency state.
    ///
    /// Call from within [`ChangeNumberIndexer::pause_while`] so no cursor
    /// of the domain is open.
    pub fn forget_domain(&self, domain: &BaseDn) {
        let mut sync = self.shared.sync.lock();
        sync.liveness.forget_domain(domain);
        sync.ruv.remove_domain(domain);
        sync.new_replicas.retain(|(dn, _)| dn != domain);
    }

    /// Stop the worker and wait for it to exit. Idempotent.
    pub fn shutdown(&self) {
        {
            let mut sync = self.shared.sync.lock();
            if !sync.shutdown {
                sync.shutdown = true;
                if sync.state != IndexerState::Stopped {
                    sync.state = IndexerState::ShuttingDown;
                }
                info!(target: "changelog::indexer", "Indexer shutdown requested");
            }
            self.shared.wake.notify_all();
        }
        self.join();
    }

    fn join(&self) {
        if let Some(handle) = self.handle.lock().take() {
            let _ = handle.join();
        }
    }
}

impl Drop for ChangeNumberIndexer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use changelog_core::UpdateMsg;
    use changelog_storage::{ChangelogCursor, ChangelogStateStore};
    use tempfile::TempDir;

    const WAIT: Duration = Duration::from_secs(5);

    struct Fixture {
        _dir: TempDir,
        store: Arc<DomainLogStore>,
        cn_index: Arc<ChangeNumberIndexLog>,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let state = ChangelogStateStore::open(dir.path()).unwrap();
        let cn_index = Arc::new(ChangeNumberIndexLog::open(&state.cn_index_dir(), false).unwrap());
        let store = Arc::new(DomainLogStore::open(state, false).unwrap());
        Fixture {
            _dir: dir,
            store,
            cn_index,
        }
    }

    fn dn() -> BaseDn {
        BaseDn::new("dc=example,dc=com").unwrap()
    }

    fn start(f: &Fixture) -> ChangeNumberIndexer {
        ChangeNumberIndexer::start(
            Arc::clone(&f.store),
            Arc::clone(&f.cn_index),
            Duration::from_millis(20),
            None,
        )
        .unwrap()
    }

    fn publish(f: &Fixture, indexer: &ChangeNumberIndexer, csn: Csn) {
        f.store
            .get_or_create(&dn(), csn.server_id())
            .unwrap()
            .add(&UpdateMsg::new(csn, vec![]))
            .unwrap();
        indexer.publish_update_msg(&dn(), &csn);
    }

    fn indexed(f: &Fixture) -> Vec<Csn> {
        let mut cursor = f.cn_index.cursor_from(1).unwrap();
        let mut out = Vec::new();
        while cursor.advance().unwrap() {
            out.push(cursor.record().unwrap().value().csn());
        }
        out
    }

    #[test]
    fn test_starts_running_on_empty_changelog() {
        let f = fixture();
        let indexer = start(&f);
        assert_eq!(indexer.state(), IndexerState::Running);
        assert!(indexer.medium_consistency().is_none());
        indexer.shutdown();
        assert_eq!(indexer.state(), IndexerState::Stopped);
        indexer.shutdown();
    }

    #[test]
    fn test_update_is_indexed_after_next_heartbeat() {
        let f = fixture();
        let indexer = start(&f);
        publish(&f, &indexer, Csn::new(10, 0, 1));
        assert!(!indexer.await_medium_consistency(&Csn::new(10, 0, 1), Duration::from_millis(100)));

        indexer.publish_heartbeat(&dn(), &Csn::new(11, 0, 1));
        assert!(indexer.await_medium_consistency(&Csn::new(10, 0, 1), WAIT));
        assert_eq!(indexed(&f), vec![Csn::new(10, 0, 1)]);
        assert_eq!(
            indexer.medium_consistency_cookie().csn(&dn(), 1),
            Some(&Csn::new(10, 0, 1))
        );
    }

    #[test]
    fn test_offline_replica_lets_indexing_proceed() {
        let f = fixture();
        let indexer = start(&f);
        publish(&f, &indexer, Csn::new(10, 0, 1));
        publish(&f, &indexer, Csn::new(12, 0, 2));
        indexer.publish_heartbeat(&dn(), &Csn::new(20, 0, 1));
        assert!(indexer.await_medium_consistency(&Csn::new(10, 0, 1), WAIT));
        assert!(!indexer.await_medium_consistency(&Csn::new(12, 0, 2), Duration::from_millis(100)));

        indexer.replica_offline(&dn(), &Csn::new(12, 0, 2));
        assert!(indexer.await_medium_consistency(&Csn::new(12, 0, 2), WAIT));
        assert_eq!(indexed(&f), vec![Csn::new(10, 0, 1), Csn::new(12, 0, 2)]);
    }

    #[test]
    fn test_clear_rebuilds_from_disk() {
        let f = fixture();
        let indexer = start(&f);
        publish(&f, &indexer, Csn::new(10, 0, 1));
        indexer.publish_heartbeat(&dn(), &Csn::new(11, 0, 1));
        assert!(indexer.await_medium_consistency(&Csn::new(10, 0, 1), WAIT));

        indexer.clear().unwrap();
        assert_eq!(indexer.state(), IndexerState::Running);
        assert_eq!(
            indexer.medium_consistency().map(|(_, c)| c),
            Some(Csn::new(10, 0, 1))
        );

        publish(&f, &indexer, Csn::new(12, 0, 1));
        indexer.publish_heartbeat(&dn(), &Csn::new(13, 0, 1));
        assert!(indexer.await_medium_consistency(&Csn::new(12, 0, 1), WAIT));
        assert_eq!(indexed(&f), vec![Csn::new(10, 0, 1), Csn::new(12, 0, 1)]);
    }

    #[test]
    fn test_restart_resumes_after_newest_record() {
        let f = fixture();
        {
            let indexer = start(&f);
            publish(&f, &indexer, Csn::new(10, 0, 1));
            publish(&f, &indexer, Csn::new(11, 0, 1));
            indexer.publish_heartbeat(&dn(), &Csn::new(12, 0, 1));
            assert!(indexer.await_medium_consistency(&Csn::new(11, 0, 1), WAIT));
        }

        let indexer = start(&f);
        assert_eq!(
            indexer.medium_consistency(),
            Some((dn(), Csn::new(11, 0, 1)))
        );
        publish(&f, &indexer, Csn::new(13, 0, 1));
        indexer.publish_heartbeat(&dn(), &Csn::new(14, 0, 1));
        assert!(indexer.await_medium_consistency(&Csn::new(13, 0, 1), WAIT));
        assert_eq!(
            indexed(&f),
            vec![Csn::new(10, 0, 1), Csn::new(11, 0, 1), Csn::new(13, 0, 1)]
        );
    }

    #[test]
    fn test_diverged_index_fails_to_start() {
        let f = fixture();
        f.store.get_or_create(&dn(), 1).unwrap();
        f.cn_index
            .add_record(String::new(), dn(), Csn::new(99, 0, 1))
            .unwrap();

        let result = ChangeNumberIndexer::start(
            Arc::clone(&f.store),
            Arc::clone(&f.cn_index),
            Duration::from_millis(20),
            None,
        );
        assert!(matches!(result, Err(ChangelogError::Consistency(_))));
    }

    fn store_update(f: &Fixture, csn: Csn) {
        f.store
            .get_or_create(&dn(), csn.server_id())
            .unwrap()
            .add(&UpdateMsg::new(csn, vec![]))
            .unwrap();
    }

    fn cookie(csns: &[Csn]) -> String {
        let mut state = MultiDomainServerState::new();
        for csn in csns {
            state.update(&dn(), *csn);
        }
        state.to_string()
    }

    #[test]
    fn test_index_skipping_another_replica_fails_to_start() {
        let f = fixture();
        store_update(&f, Csn::new(10, 0, 1));
        store_update(&f, Csn::new(20, 0, 1));
        store_update(&f, Csn::new(15, 0, 2));
        f.cn_index
            .add_record(String::new(), dn(), Csn::new(10, 0, 1))
            .unwrap();
        f.cn_index
            .add_record(cookie(&[Csn::new(10, 0, 1)]), dn(), Csn::new(20, 0, 1))
            .unwrap();

        let result = ChangeNumberIndexer::start(
            Arc::clone(&f.store),
            Arc::clone(&f.cn_index),
            Duration::from_millis(20),
            None,
        );
        match result {
            Err(ChangelogError::Consistency(msg)) => {
                assert!(msg.contains(&Csn::new(15, 0, 2).to_string()));
            }
            Err(e) => panic!("unexpected error: {}", e),
            Ok(_) => panic!("indexer started on a diverged index"),
        }
    }

    #[test]
    fn test_restart_with_two_replicas_consumes_newest_record() {
        let f = fixture();
        store_update(&f, Csn::new(10, 0, 1));
        store_update(&f, Csn::new(15, 0, 2));
        store_update(&f, Csn::new(20, 0, 1));
        f.cn_index
            .add_record(String::new(), dn(), Csn::new(10, 0, 1))
            .unwrap();
        f.cn_index
            .add_record(cookie(&[Csn::new(10, 0, 1)]), dn(), Csn::new(15, 0, 2))
            .unwrap();
        f.cn_index
            .add_record(
                cookie(&[Csn::new(10, 0, 1), Csn::new(15, 0, 2)]),
                dn(),
                Csn::new(20, 0, 1),
            )
            .unwrap();

        let indexer = start(&f);
        assert_eq!(
            indexer.medium_consistency(),
            Some((dn(), Csn::new(20, 0, 1)))
        );
        publish(&f, &indexer, Csn::new(30, 0, 2));
        indexer.publish_heartbeat(&dn(), &Csn::new(40, 0, 1));
        indexer.publish_heartbeat(&dn(), &Csn::new(40, 0, 2));
        assert!(indexer.await_medium_consistency(&Csn::new(30, 0, 2), WAIT));
        assert_eq!(
            indexed(&f),
            vec![
                Csn::new(10, 0, 1),
                Csn::new(15, 0, 2),
                Csn::new(20, 0, 1),
                Csn::new(30, 0, 2)
            ]
        );
    }
}
