//! Changelog registry
//!
//! `ChangelogRegistry` owns everything stored under one changelog root:
//! the replica logs of every domain, the change-number index, the indexer
//! and the purge worker. It is the only entry point collaborators use.
//!
//! # Locking
//!
//! - `structure` is read-locked by publishers and write-locked by domain
//!   removal, so no append races a directory deletion.
//! - `purge_lock` is held by a whole purge pass and by structural
//!   operations, which therefore never run concurrently with a purge.
//! - Structural operations pause the indexer so it holds no cursor on the
//!   logs being removed.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use changelog_core::{
    check_server_id, BaseDn, ChangelogError, ChangelogResult, Csn, MultiDomainServerState,
    ServerState, UpdateMsg,
};
use changelog_storage::{
    ChangeNumberIndexCursor, ChangeNumberIndexLog, ChangelogStateStore, CompositeCursor,
    DomainLogStore, ReplicaLogCursor,
};
use parking_lot::{Mutex, RwLock};
use tracing::{info, warn};

use crate::config::{ChangelogConfig, CONFIG_FILE_NAME};
use crate::indexer::ChangeNumberIndexer;
use crate::purger::{PurgeContext, Purger};
use crate::FatalErrorHandler;

/// Lock file guarding a changelog root against a second process
pub const LOCK_FILE_NAME: &str = ".lock";

/// Merge over the replicas of one domain, tagged by replica id
pub type DomainCursor = CompositeCursor<ReplicaLogCursor, i32>;

/// Merge over every domain, tagged by `(domain, replica id)`
pub type CookieCursor = CompositeCursor<ReplicaLogCursor, (BaseDn, i32)>;

/// Entry point of the replication changelog
pub struct ChangelogRegistry {
    root: PathBuf,
    config: ChangelogConfig,
    store: Arc<DomainLogStore>,
    cn_index: Arc<ChangeNumberIndexLog>,
    indexer: RwLock<Option<ChangeNumberIndexer>>,
    purger: Purger,
    compute_change_number: Arc<AtomicBool>,
    structure: RwLock<()>,
    purge_lock: Arc<Mutex<()>>,
    fatal_hook: Arc<RwLock<Option<FatalErrorHandler>>>,
    shutdown: AtomicBool,
    lock_file: Mutex<Option<File>>,
}

impl ChangelogRegistry {
    /// Open the changelog stored under `root`, creating it if needed.
    ///
    /// Settings come from `<root>/changelog.toml`, written with defaults on
    /// first open.
    pub fn open(root: impl AsRef<Path>) -> ChangelogResult<Self> {
        let root = root.as_ref();
        std::fs::create_dir_all(root)?;
        let config_path = root.join(CONFIG_FILE_NAME);
        ChangelogConfig::write_default_if_missing(&config_path)?;
        let config = ChangelogConfig::from_file(&config_path)?;
        Self::open_with_config(root, config)
    }

    /// Open the changelog stored under `root` with explicit settings
    pub fn open_with_config(root: impl AsRef<Path>, config: ChangelogConfig) -> ChangelogResult<Self> {
        config.validate()?;
        let root = root.as_ref();
        std::fs::create_dir_all(root)?;
        let lock_file = acquire_lock(root)?;

        let sync_on_append = config.durability_mode()?.sync_on_append();
        let state = ChangelogStateStore::open(root)?;
        let cn_index = Arc::new(ChangeNumberIndexLog::open(&state.cn_index_dir(), sync_on_append)?);
        let store = Arc::new(DomainLogStore::open(state, sync_on_append)?);

        let fatal_hook: Arc<RwLock<Option<FatalErrorHandler>>> = Arc::new(RwLock::new(None));
        let compute_change_number = Arc::new(AtomicBool::new(config.compute_change_number));
        let purge_lock = Arc::new(Mutex::new(()));

        let indexer = if config.compute_change_number {
            Some(ChangeNumberIndexer::start(
                Arc::clone(&store),
                Arc::clone(&cn_index),
                config.indexer_wake_interval(),
                Some(forward_to(&fatal_hook)),
            )?)
        } else {
            None
        };

        let purger = Purger::start(
            PurgeContext::new(
                Arc::clone(&store),
                Arc::clone(&cn_index),
                Arc::clone(&compute_change_number),
                Arc::clone(&purge_lock),
            ),
            config.purge_delay(),
            config.purge_interval(),
            Some(forward_to(&fatal_hook)),
        )?;

        info!(
            target: "changelog::registry",
            root = %root.display(),
            domains = store.domains().len(),
            compute_change_number = config.compute_change_number,
            "Changelog opened"
        );

        Ok(ChangelogRegistry {
            root: root.to_path_buf(),
            config,
            store,
            cn_index,
            indexer: RwLock::new(indexer),
            purger,
            compute_change_number,
            structure: RwLock::new(()),
            purge_lock,
            fatal_hook,
            shutdown: AtomicBool::new(false),
            lock_file: Mutex::new(Some(lock_file)),
        })
    }

    /// Root directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Settings the changelog was opened with
    pub fn config(&self) -> &ChangelogConfig {
        &self.config
    }

    fn ensure_open(&self) -> ChangelogResult<()> {
        if self.shutdown.load(Ordering::SeqCst) {
            return Err(ChangelogError::InvalidOperation(
                "changelog is shut down".to_string(),
            ));
        }
        Ok(())
    }

    /// Store an update of `domain` and notify the indexer.
    ///
    /// # Errors
    ///
    /// `InvalidOperation` for a replica id outside `1..=MAX_SERVER_ID` or
    /// after shutdown; storage errors from the append.
    pub fn publish_update(&self, domain: &BaseDn, update: &UpdateMsg) -> ChangelogResult<()> {
        self.ensure_open()?;
        let csn = update.csn();
        check_server_id(csn.server_id())?;

        let _structure = self.structure.read();
        let log = self.store.get_or_create(domain, csn.server_id())?;
        log.add(update)?;
        self.store.clear_offline(domain, csn.server_id())?;
        if let Some(indexer) = self.indexer.read().as_ref() {
            indexer.publish_update_msg(domain, &csn);
        }
        Ok(())
    }

    /// A replica proved it has passed `csn`
    pub fn publish_heartbeat(&self, domain: &BaseDn, csn: &Csn) -> ChangelogResult<()> {
        self.ensure_open()?;
        check_server_id(csn.server_id())?;
        let _structure = self.structure.read();
        let back_online = self
            .store
            .offline_replicas()
            .csn(domain, csn.server_id())
            .map_or(false, |offline| csn.is_newer_than(offline));
        if back_online {
            self.store.clear_offline(domain, csn.server_id())?;
        }
        if let Some(indexer) = self.indexer.read().as_ref() {
            indexer.publish_heartbeat(domain, csn);
        }
        Ok(())
    }

    /// A replica disconnected after `csn`
    pub fn replica_offline(&self, domain: &BaseDn, csn: &Csn) -> ChangelogResult<()> {
        self.ensure_open()?;
        check_server_id(csn.server_id())?;
        let _structure = self.structure.read();
        self.store.get_or_create(domain, csn.server_id())?;
        self.store.set_offline(domain, csn)?;
        if let Some(indexer) = self.indexer.read().as_ref() {
            indexer.replica_offline(domain, csn);
        }
        info!(target: "changelog::registry", base_dn = %domain, %csn, "Replica offline");
        Ok(())
    }

    /// Cursor over the updates of `domain` after `after`.
    ///
    /// Replicas missing from `after` are read from their first update.
    pub fn get_cursor_from(&self, domain: &BaseDn, after: &ServerState) -> ChangelogResult<DomainCursor> {
        self.ensure_open()?;
        let mut cursor = CompositeCursor::new();
        if let Some(logs) = self.store.domain(domain) {
            for log in logs.replicas() {
                let start = after.csn(log.server_id()).copied();
                cursor.add_cursor(log.server_id(), log.cursor_after(start)?);
            }
        }
        Ok(cursor)
    }

    /// Cursor over the updates of every domain after `cookie`
    pub fn get_cursor_from_cookie(&self, cookie: &MultiDomainServerState) -> ChangelogResult<CookieCursor> {
        self.ensure_open()?;
        let mut cursor = CompositeCursor::new();
        for (dn, log) in self.store.all_replicas() {
            let start = cookie.csn(&dn, log.server_id()).copied();
            let tag = (dn, log.server_id());
            cursor.add_cursor(tag, log.cursor_after(start)?);
        }
        Ok(cursor)
    }

    /// Change-number index
    pub fn change_number_index(&self) -> Arc<ChangeNumberIndexLog> {
        Arc::clone(&self.cn_index)
    }

    /// Cursor over index records from `change_number` on
    pub fn change_number_cursor(&self, change_number: i64) -> ChangelogResult<ChangeNumberIndexCursor> {
        self.ensure_open()?;
        self.cn_index.cursor_from(change_number)
    }

    /// Start or stop change-number computation. Blocks until the indexer
    /// is running or stopped.
    pub fn set_compute_change_number(&self, enabled: bool) -> ChangelogResult<()> {
        self.ensure_open()?;
        let mut indexer = self.indexer.write();
        if enabled {
            self.compute_change_number.store(true, Ordering::SeqCst);
            if indexer.is_none() {
                *indexer = Some(ChangeNumberIndexer::start(
                    Arc::clone(&self.store),
                    Arc::clone(&self.cn_index),
                    self.config.indexer_wake_interval(),
                    Some(forward_to(&self.fatal_hook)),
                )?);
            }
        } else {
            if let Some(running) = indexer.take() {
                running.shutdown();
            }
            self.compute_change_number.store(false, Ordering::SeqCst);
        }
        info!(target: "changelog::registry", enabled, "Change number computation changed");
        Ok(())
    }

    /// Whether change numbers are computed
    pub fn compute_change_number(&self) -> bool {
        self.compute_change_number.load(Ordering::SeqCst)
    }

    /// Change the retention period; zero disables purging
    pub fn set_purge_delay(&self, delay: Duration) {
        self.purger.set_purge_delay(delay);
    }

    /// Current retention period
    pub fn purge_delay(&self) -> Duration {
        self.purger.purge_delay()
    }

    /// Delete every log of `domain`
    pub fn remove_domain(&self, domain: &BaseDn) -> ChangelogResult<()> {
        self.ensure_open()?;
        let _purging = self.purge_lock.lock();
        let _structure = self.structure.write();
        let indexer = self.indexer.read();
        match indexer.as_ref() {
            Some(indexer) => indexer.pause_while(false, || {
                indexer.forget_domain(domain);
                self.store.remove_domain(domain)
            }),
            None => self.store.remove_domain(domain),
        }
    }

    /// Delete every replica log and the change-number index
    pub fn clear_all(&self) -> ChangelogResult<()> {
        self.ensure_open()?;
        let _purging = self.purge_lock.lock();
        let _structure = self.structure.write();
        let clear = || -> ChangelogResult<()> {
            self.cn_index.clear()?;
            self.store.remove_all()
        };
        let indexer = self.indexer.read();
        match indexer.as_ref() {
            Some(indexer) => indexer.pause_while(true, clear)?,
            None => clear()?,
        }
        info!(target: "changelog::registry", "Changelog cleared");
        Ok(())
    }

    /// Known domains in DN order
    pub fn domains(&self) -> Vec<BaseDn> {
        self.store.domains()
    }

    /// Oldest stored CSN of every replica of `domain`
    pub fn domain_oldest_state(&self, domain: &BaseDn) -> ServerState {
        self.store
            .domain(domain)
            .map(|d| d.oldest_state())
            .unwrap_or_default()
    }

    /// Newest stored CSN of every replica of `domain`
    pub fn domain_newest_state(&self, domain: &BaseDn) -> ServerState {
        self.store
            .domain(domain)
            .map(|d| d.newest_state())
            .unwrap_or_default()
    }

    /// Newest stored CSN of every replica of every domain
    pub fn newest_cookie(&self) -> MultiDomainServerState {
        self.store.newest_cookie()
    }

    /// Number of updates stored for one replica
    pub fn replica_record_count(&self, domain: &BaseDn, server_id: i32) -> u64 {
        self.store
            .replica(domain, server_id)
            .map_or(0, |log| log.number_of_records())
    }

    /// Newest indexed update, when change numbers are computed
    pub fn medium_consistency(&self) -> Option<(BaseDn, Csn)> {
        self.indexer
            .read()
            .as_ref()
            .and_then(|indexer| indexer.medium_consistency())
    }

    /// Cookie of the last indexed update of every replica
    pub fn medium_consistency_cookie(&self) -> MultiDomainServerState {
        self.indexer
            .read()
            .as_ref()
            .map(|indexer| indexer.medium_consistency_cookie())
            .unwrap_or_default()
    }

    /// Block until the medium consistency point reaches `csn`.
    ///
    /// Returns false on timeout or when change numbers are not computed.
    pub fn await_medium_consistency(&self, csn: &Csn, timeout: Duration) -> bool {
        self.indexer
            .read()
            .as_ref()
            .map_or(false, |indexer| indexer.await_medium_consistency(csn, timeout))
    }

    /// Register a handler called when a background worker dies
    pub fn set_fatal_error_handler(&self, handler: FatalErrorHandler) {
        *self.fatal_hook.write() = Some(handler);
    }

    /// Fail if a background worker died
    pub fn check_health(&self) -> ChangelogResult<()> {
        if let Some(failure) = self.indexer.read().as_ref().and_then(|i| i.failure()) {
            return Err(ChangelogError::storage(format!(
                "change number indexer stopped: {}",
                failure
            )));
        }
        if let Some(failure) = self.purger.failure() {
            return Err(ChangelogError::storage(format!("purger stopped: {}", failure)));
        }
        Ok(())
    }

    /// Force every log to durable storage
    pub fn sync(&self) -> ChangelogResult<()> {
        self.store.sync_all()?;
        self.cn_index.sync()
    }

    /// Stop the workers and close every log. Idempotent.
    pub fn shutdown(&self) {
        if self.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }
        self.purger.shutdown();
        if let Some(indexer) = self.indexer.write().take() {
            indexer.shutdown();
        }
        self.store.close_all();
        if let Err(e) = self.cn_index.close() {
            warn!(target: "changelog::registry", error = %e, "Failed to close change number index");
        }
        if let Some(lock_file) = self.lock_file.lock().take() {
            if let Err(e) = fs2::FileExt::unlock(&lock_file) {
                warn!(target: "changelog::registry", error = %e, "Failed to release lock file");
            }
        }
        info!(target: "changelog::registry", root = %self.root.display(), "Changelog shut down");
    }
}

impl Drop for ChangelogRegistry {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn acquire_lock(root: &Path) -> ChangelogResult<File> {
    let lock_path = root.join(LOCK_FILE_NAME);
    let lock_file = std::fs::OpenOptions::new()
        .create(true)
        .truncate(false)
        .read(true)
        .write(true)
        .open(&lock_path)
        .map_err(|e| ChangelogError::storage(format!("failed to open lock file: {}", e)))?;
    fs2::FileExt::try_lock_exclusive(&lock_file).map_err(|_| {
        ChangelogError::storage(format!(
            "changelog at '{}' is already in use by another process",
            root.display()
        ))
    })?;
    Ok(lock_file)
}

/// Handler that calls whatever is registered on the registry at failure time
fn forward_to(hook: &Arc<RwLock<Option<FatalErrorHandler>>>) -> FatalErrorHandler {
    let hook = Arc::clone(hook);
    Arc::new(move |error: &ChangelogError| {
        if let Some(handler) = hook.read().as_ref() {
            handler(error);
        }
    })
}
