//! Registry of replica logs per domain
//!
//! Replica logs are created lazily on the first update of a replica. Two
//! writers racing to create the same log create it once: the lookup is
//! retried under a per-domain creation lock before opening anything.
//! Writers of different domains never share that lock.

use std::collections::BTreeMap;
use std::sync::Arc;

use changelog_core::{BaseDn, ChangelogResult, Csn, MultiDomainServerState, ServerState};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tracing::{info, warn};

use crate::replica_log::ReplicaLog;
use crate::state::ChangelogStateStore;

/// Replica logs of one domain
pub struct DomainLogs {
    base_dn: BaseDn,
    replicas: RwLock<BTreeMap<i32, Arc<ReplicaLog>>>,
    create_lock: Mutex<()>,
}

impl DomainLogs {
    fn new(base_dn: BaseDn) -> Self {
        DomainLogs {
            base_dn,
            replicas: RwLock::new(BTreeMap::new()),
            create_lock: Mutex::new(()),
        }
    }

    /// Domain name
    pub fn base_dn(&self) -> &BaseDn {
        &self.base_dn
    }

    /// Log of one replica
    pub fn replica(&self, server_id: i32) -> Option<Arc<ReplicaLog>> {
        self.replicas.read().get(&server_id).cloned()
    }

    /// Logs in replica id order
    pub fn replicas(&self) -> Vec<Arc<ReplicaLog>> {
        self.replicas.read().values().cloned().collect()
    }

    /// Newest stored CSN of every replica
    pub fn newest_state(&self) -> ServerState {
        self.replicas
            .read()
            .values()
            .filter_map(|log| log.newest_csn())
            .collect()
    }

    /// Oldest stored CSN of every replica
    pub fn oldest_state(&self) -> ServerState {
        self.replicas
            .read()
            .values()
            .filter_map(|log| log.oldest_csn())
            .collect()
    }
}

/// All replica logs of the changelog
pub struct DomainLogStore {
    state: ChangelogStateStore,
    domains: DashMap<BaseDn, Arc<DomainLogs>>,
    /// Offline replicas, mirrored from the on-disk markers
    offline: Mutex<MultiDomainServerState>,
    sync_on_append: bool,
}

impl DomainLogStore {
    /// Open every replica log found under the state store's root
    pub fn open(state: ChangelogStateStore, sync_on_append: bool) -> ChangelogResult<Self> {
        let persisted = state.read_state()?;
        let store = DomainLogStore {
            state,
            domains: DashMap::new(),
            offline: Mutex::new(persisted.offline),
            sync_on_append,
        };

        let mut opened = 0usize;
        for (dn, ids) in persisted.replicas {
            let domain = store.domain_entry(&dn);
            let mut replicas = domain.replicas.write();
            for id in ids {
                let dir = store.state.replica_dir(&dn, id)?;
                let log = ReplicaLog::open(&dir, dn.clone(), id, sync_on_append)?;
                replicas.insert(id, Arc::new(log));
                opened += 1;
            }
        }
        info!(
            target: "changelog::store",
            root = %store.state.root().display(),
            domains = store.domains.len(),
            replicas = opened,
            "Opened replica logs"
        );
        Ok(store)
    }

    /// Layout owner
    pub fn state(&self) -> &ChangelogStateStore {
        &self.state
    }

    fn domain_entry(&self, dn: &BaseDn) -> Arc<DomainLogs> {
        if let Some(domain) = self.domains.get(dn) {
            return Arc::clone(domain.value());
        }
        Arc::clone(
            self.domains
                .entry(dn.clone())
                .or_insert_with(|| Arc::new(DomainLogs::new(dn.clone())))
                .value(),
        )
    }

    /// Log of `(dn, server_id)`, created if missing
    pub fn get_or_create(&self, dn: &BaseDn, server_id: i32) -> ChangelogResult<Arc<ReplicaLog>> {
        let domain = self.domain_entry(dn);
        if let Some(log) = domain.replica(server_id) {
            return Ok(log);
        }

        let _creating = domain.create_lock.lock();
        if let Some(log) = domain.replica(server_id) {
            return Ok(log);
        }
        let dir = self.state.replica_dir(dn, server_id)?;
        let log = Arc::new(ReplicaLog::open(&dir, dn.clone(), server_id, self.sync_on_append)?);
        domain.replicas.write().insert(server_id, Arc::clone(&log));
        info!(target: "changelog::store", base_dn = %dn, server_id, "Created replica log");
        Ok(log)
    }

    /// Log of `(dn, server_id)` if it exists
    pub fn replica(&self, dn: &BaseDn, server_id: i32) -> Option<Arc<ReplicaLog>> {
        self.domains.get(dn).and_then(|d| d.replica(server_id))
    }

    /// Logs of one domain
    pub fn domain(&self, dn: &BaseDn) -> Option<Arc<DomainLogs>> {
        self.domains.get(dn).map(|d| Arc::clone(d.value()))
    }

    /// Known domains in DN order
    pub fn domains(&self) -> Vec<BaseDn> {
        let mut dns: Vec<BaseDn> = self.domains.iter().map(|e| e.key().clone()).collect();
        dns.sort();
        dns
    }

    /// Whether the domain has at least been registered
    pub fn has_domain(&self, dn: &BaseDn) -> bool {
        self.domains.contains_key(dn)
    }

    /// Every replica log with its domain, in `(dn, server id)` order
    pub fn all_replicas(&self) -> Vec<(BaseDn, Arc<ReplicaLog>)> {
        let mut all = Vec::new();
        for dn in self.domains() {
            if let Some(domain) = self.domain(&dn) {
                for log in domain.replicas() {
                    all.push((dn.clone(), log));
                }
            }
        }
        all
    }

    /// Newest CSN of every replica of every domain
    pub fn newest_cookie(&self) -> MultiDomainServerState {
        let mut cookie = MultiDomainServerState::new();
        for dn in self.domains() {
            if let Some(domain) = self.domain(&dn) {
                cookie.update_state(&dn, &domain.newest_state());
            }
        }
        cookie
    }

    /// Persist that a replica went offline at `csn`
    pub fn set_offline(&self, dn: &BaseDn, csn: &Csn) -> ChangelogResult<()> {
        let mut offline = self.offline.lock();
        self.state.set_offline(dn, csn)?;
        offline.remove(dn, csn.server_id());
        offline.update(dn, *csn);
        Ok(())
    }

    /// Forget that a replica was offline. Cheap when it was not.
    pub fn clear_offline(&self, dn: &BaseDn, server_id: i32) -> ChangelogResult<()> {
        let mut offline = self.offline.lock();
        if offline.csn(dn, server_id).is_none() {
            return Ok(());
        }
        self.state.clear_offline(dn, server_id)?;
        offline.remove(dn, server_id);
        Ok(())
    }

    /// Replicas currently marked offline
    pub fn offline_replicas(&self) -> MultiDomainServerState {
        self.offline.lock().clone()
    }

    /// Close and delete every log of a domain
    pub fn remove_domain(&self, dn: &BaseDn) -> ChangelogResult<()> {
        if let Some((_, domain)) = self.domains.remove(dn) {
            close_logs(&domain.replicas());
        }
        self.offline.lock().remove_domain(dn);
        self.state.remove_domain(dn)?;
        info!(target: "changelog::store", base_dn = %dn, "Removed domain");
        Ok(())
    }

    /// Close and delete every replica log
    pub fn remove_all(&self) -> ChangelogResult<()> {
        let domains: Vec<Arc<DomainLogs>> =
            self.domains.iter().map(|e| Arc::clone(e.value())).collect();
        self.domains.clear();
        for domain in domains {
            close_logs(&domain.replicas());
        }
        self.offline.lock().clear();
        self.state.remove_all()?;
        info!(target: "changelog::store", "Removed all domains");
        Ok(())
    }

    /// Flush and close every log
    pub fn close_all(&self) {
        for (_, log) in self.all_replicas() {
            if let Err(e) = log.close() {
                warn!(
                    target: "changelog::store",
                    base_dn = %log.base_dn(),
                    server_id = log.server_id(),
                    error = %e,
                    "Failed to close replica log"
                );
            }
        }
    }

    /// Fsync every log
    pub fn sync_all(&self) -> ChangelogResult<()> {
        for (_, log) in self.all_replicas() {
            log.sync()?;
        }
        Ok(())
    }
}

fn close_logs(logs: &[Arc<ReplicaLog>]) {
    for log in logs {
        if let Err(e) = log.close() {
            warn!(
                target: "changelog::store",
                base_dn = %log.base_dn(),
                server_id = log.server_id(),
                error = %e,
                "Failed to close replica log"
            );
        }
    }
}
