//! Indexer worker loop

use std::collections::BTreeSet;
use std::mem;
use std::sync::Arc;
use std::time::Duration;

use changelog_core::{BaseDn, ChangelogError, ChangelogResult, Csn, MultiDomainServerState};
use changelog_storage::{
    ChangeNumberIndexLog, ChangelogCursor, CompositeCursor, DomainLogStore, ReplicaLogCursor,
};
use tracing::{debug, error, info, trace};

use super::{IndexerShared, IndexerState};
use crate::FatalErrorHandler;

/// Why the main loop returned
enum Exit {
    Shutdown,
    Pause,
}

pub(crate) struct IndexerWorker {
    shared: Arc<IndexerShared>,
    store: Arc<DomainLogStore>,
    cn_index: Arc<ChangeNumberIndexLog>,
    wake_interval: Duration,
    fatal: Option<FatalErrorHandler>,
    merge: CompositeCursor<ReplicaLogCursor, (BaseDn, i32)>,
    tracked: BTreeSet<(BaseDn, i32)>,
}

impl IndexerWorker {
    pub(crate) fn new(
        shared: Arc<IndexerShared>,
        store: Arc<DomainLogStore>,
        cn_index: Arc<ChangeNumberIndexLog>,
        wake_interval: Duration,
        fatal: Option<FatalErrorHandler>,
    ) -> Self {
        IndexerWorker {
            shared,
            store,
            cn_index,
            wake_interval,
            fatal,
            merge: CompositeCursor::new(),
            tracked: BTreeSet::new(),
        }
    }

    pub(crate) fn run(mut self) {
        if let Err(e) = self.initialize() {
            error!(target: "changelog::indexer", error = %e, "Indexer initialization failed");
            self.release_cursors();
            let mut sync = self.shared.sync.lock();
            sync.failure = Some(e.to_string());
            sync.startup_error = Some(e);
            sync.state = IndexerState::Stopped;
            self.shared.ack.notify_all();
            return;
        }
        let result = self.run_until_shutdown();
        self.release_cursors();

        let mut sync = self.shared.sync.lock();
        sync.state = IndexerState::Stopped;
        if let Err(e) = &result {
            error!(target: "changelog::indexer", error = %e, "Indexer stopped on fatal error");
            sync.failure = Some(e.to_string());
        } else {
            info!(target: "changelog::indexer", "Indexer stopped");
        }
        self.shared.ack.notify_all();
        drop(sync);

        if let (Err(e), Some(fatal)) = (&result, &self.fatal) {
            fatal(e);
        }
    }

    fn run_until_shutdown(&mut self) -> ChangelogResult<()> {
        loop {
            match self.index_admitted()? {
                Exit::Shutdown => return Ok(()),
                Exit::Pause => {
                    self.release_cursors();
                    if !self.wait_while_paused() {
                        return Ok(());
                    }
                    self.initialize()?;
                }
            }
        }
    }

    fn release_cursors(&mut self) {
        self.merge.close_all();
        self.merge = CompositeCursor::new();
        self.tracked.clear();
    }

    /// Enter `Draining` until no pause is pending. False on shutdown.
    fn wait_while_paused(&mut self) -> bool {
        let mut sync = self.shared.sync.lock();
        sync.state = IndexerState::Draining;
        info!(target: "changelog::indexer", "Indexer draining");
        self.shared.ack.notify_all();
        while sync.pause_requests > 0 && !sync.shutdown {
            self.shared.wake.wait(&mut sync);
        }
        if sync.shutdown {
            return false;
        }
        if mem::take(&mut sync.reset_requested) {
            sync.liveness.clear();
            sync.medium_consistency = None;
            sync.ruv.clear();
            debug!(target: "changelog::indexer", "Indexer state reset");
        }
        sync.state = IndexerState::Initializing;
        true
    }

    /// Rebuild the merge and the consistency state from the stored logs.
    ///
    /// The merge is positioned after the newest index record's previous
    /// cookie. Its first update must be that record's own update, otherwise
    /// the index and the logs have diverged. That update is then consumed.
    fn initialize(&mut self) -> ChangelogResult<()> {
        self.release_cursors();

        let newest = self.cn_index.newest_record();
        let mut ruv = MultiDomainServerState::new();
        if let Some(record) = &newest {
            ruv = record.previous_cookie().parse()?;
            ruv.retain_domains(|dn| self.store.has_domain(dn));
        }

        let replicas = self.store.all_replicas();
        for (dn, log) in &replicas {
            let after = ruv.csn(dn, log.server_id()).copied();
            self.merge
                .add_cursor((dn.clone(), log.server_id()), log.cursor_after(after)?);
            self.tracked.insert((dn.clone(), log.server_id()));
        }

        let mut medium_consistency = None;
        if let Some(record) = newest.filter(|r| self.store.has_domain(r.base_dn())) {
            let expected = (record.base_dn().clone(), record.csn());
            let found = if self.merge.refresh()? {
                match (self.merge.record(), self.merge.data()) {
                    (Some(msg), Some((dn, _))) => Some((dn.clone(), msg.csn())),
                    _ => None,
                }
            } else {
                None
            };
            if found.as_ref() != Some(&expected) {
                return Err(ChangelogError::Consistency(format!(
                    "newest change number {} points to {} in {} but the next stored update is {}",
                    record.change_number(),
                    expected.1,
                    expected.0,
                    found.map_or_else(
                        || "nothing".to_string(),
                        |(dn, csn)| format!("{} in {}", csn, dn)
                    )
                )));
            }
            self.merge.advance()?;
            let (dn, csn) = expected;
            ruv.update(&dn, csn);
            medium_consistency = Some((dn, csn));
        }

        let offline = self.store.offline_replicas();
        let mut sync = self.shared.sync.lock();
        for (dn, log) in &replicas {
            let alive = log
                .newest_csn()
                .unwrap_or_else(|| Csn::oldest_possible(log.server_id()));
            sync.liveness.alive(dn, alive);
        }
        for (dn, state) in offline.iter() {
            for csn in state.iter() {
                sync.liveness.set_offline(dn, *csn);
            }
        }
        if let Some((dn, csn)) = medium_consistency {
            let newer = sync
                .medium_consistency
                .as_ref()
                .map_or(true, |(_, current)| csn.is_newer_than(current));
            if newer {
                sync.medium_consistency = Some((dn, csn));
            }
        }
        sync.ruv = ruv;
        sync.new_replicas.clear();
        sync.state = IndexerState::Running;
        info!(
            target: "changelog::indexer",
            replicas = self.tracked.len(),
            medium_consistency = ?sync.medium_consistency,
            "Indexer running"
        );
        self.shared.ack.notify_all();
        Ok(())
    }

    /// Index every admissible update until shutdown or a pause request
    fn index_admitted(&mut self) -> ChangelogResult<Exit> {
        loop {
            let (epoch, discovered) = {
                let mut sync = self.shared.sync.lock();
                if sync.shutdown {
                    return Ok(Exit::Shutdown);
                }
                if sync.pause_requests > 0 {
                    return Ok(Exit::Pause);
                }
                let new_replicas = mem::take(&mut sync.new_replicas);
                let discovered: Vec<(BaseDn, i32, Option<Csn>)> = new_replicas
                    .into_iter()
                    .filter(|key| !self.tracked.contains(key))
                    .map(|(dn, id)| {
                        let after = sync.ruv.csn(&dn, id).copied();
                        (dn, id, after)
                    })
                    .collect();
                (sync.epoch, discovered)
            };

            for (dn, server_id, after) in discovered {
                if let Some(log) = self.store.replica(&dn, server_id) {
                    debug!(target: "changelog::indexer", base_dn = %dn, server_id, "Tracking replica");
                    self.merge
                        .add_cursor((dn.clone(), server_id), log.cursor_after(after)?);
                    self.tracked.insert((dn, server_id));
                }
            }

            let oldest = if self.merge.refresh()? {
                match (self.merge.record(), self.merge.data()) {
                    (Some(msg), Some((dn, _))) => Some((dn.clone(), msg.csn())),
                    _ => None,
                }
            } else {
                None
            };

            let mut sync = self.shared.sync.lock();
            let admitted = match &oldest {
                Some((dn, csn)) => sync.liveness.can_admit(dn, csn),
                None => false,
            };
            if !admitted {
                if sync.epoch == epoch && !sync.shutdown && sync.pause_requests == 0 {
                    self.shared.wake.wait_for(&mut sync, self.wake_interval);
                }
                continue;
            }
            let Some((dn, csn)) = oldest else {
                continue;
            };

            let previous_cookie = sync.ruv.to_string();
            drop(sync);

            let change_number = self
                .cn_index
                .add_record(previous_cookie, dn.clone(), csn)?;

            let mut sync = self.shared.sync.lock();
            sync.ruv.update(&dn, csn);
            let newer = sync
                .medium_consistency
                .as_ref()
                .map_or(true, |(_, current)| csn.is_newer_than(current));
            if newer {
                sync.medium_consistency = Some((dn.clone(), csn));
            }
            for server_id in sync.liveness.passed(&dn, &csn) {
                debug!(target: "changelog::indexer", base_dn = %dn, server_id, "Offline replica passed");
            }
            self.shared.ack.notify_all();
            drop(sync);

            trace!(target: "changelog::indexer", change_number, base_dn = %dn, %csn, "Admitted update");
            self.merge.advance()?;
        }
    }
}
