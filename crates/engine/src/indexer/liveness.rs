//! Replica liveness tracking for the change-number indexer
//!
//! For every domain, the indexer remembers the newest CSN each replica has
//! been heard from with (an update or a heartbeat) and which replicas are
//! offline. A record may be indexed once every online replica of its
//! domain has been heard from with a strictly newer CSN: no replica can
//! then still deliver an older update.

use changelog_core::{BaseDn, Csn, MultiDomainServerState};

#[derive(Debug, Default, Clone)]
pub(crate) struct Liveness {
    last_alive: MultiDomainServerState,
    offline: MultiDomainServerState,
}

impl Liveness {
    /// Record that a replica was heard from at `csn`
    pub(crate) fn alive(&mut self, domain: &BaseDn, csn: Csn) {
        self.last_alive.update(domain, csn);
        let back_online = self
            .offline
            .csn(domain, csn.server_id())
            .map_or(false, |offline| csn.is_newer_than(offline));
        if back_online {
            self.offline.remove(domain, csn.server_id());
        }
    }

    /// Record that a replica went offline at `csn`
    pub(crate) fn set_offline(&mut self, domain: &BaseDn, csn: Csn) {
        self.last_alive.update(domain, csn);
        self.offline.remove(domain, csn.server_id());
        self.offline.update(domain, csn);
    }

    /// Whether `csn` of `domain` can be exposed.
    ///
    /// Stricter than checking the producing replica alone: every online
    /// replica of the domain, producer included, must have been heard from
    /// past `csn`. An unheard-of producer blocks unless it is offline.
    pub(crate) fn can_admit(&self, domain: &BaseDn, csn: &Csn) -> bool {
        let Some(state) = self.last_alive.server_state(domain) else {
            return false;
        };
        let producer = csn.server_id();
        if state.csn(producer).is_none() && self.offline.csn(domain, producer).is_none() {
            return false;
        }

        state.iter().all(|alive| {
            self.offline.csn(domain, alive.server_id()).is_some() || alive.is_newer_than(csn)
        })
    }

    /// Stop tracking offline replicas of `domain` that `csn` has passed
    pub(crate) fn passed(&mut self, domain: &BaseDn, csn: &Csn) -> Vec<i32> {
        let Some(offline) = self.offline.server_state(domain) else {
            return Vec::new();
        };
        let done: Vec<i32> = offline
            .iter()
            .filter(|off| off.is_older_than_or_equal(csn))
            .map(|off| off.server_id())
            .collect();
        for server_id in &done {
            self.offline.remove(domain, *server_id);
            self.last_alive.remove(domain, *server_id);
        }
        done
    }

    pub(crate) fn forget_domain(&mut self, domain: &BaseDn) {
        self.last_alive.remove_domain(domain);
        self.offline.remove_domain(domain);
    }

    pub(crate) fn clear(&mut self) {
        self.last_alive.clear();
        self.offline.clear();
    }

    pub(crate) fn last_alive(&self) -> &MultiDomainServerState {
        &self.last_alive
    }

    #[cfg(test)]
    pub(crate) fn is_offline(&self, domain: &BaseDn, server_id: i32) -> bool {
        self.offline.csn(domain, server_id).is_some()
    }
}
