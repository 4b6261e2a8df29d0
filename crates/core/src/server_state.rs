//! Server states and cookies
//!
//! A [`ServerState`] maps replica ids to the newest CSN seen from each
//! replica of one domain. A [`MultiDomainServerState`] does the same across
//! domains; its text form is the cookie handed to changelog readers:
//!
//! ```text
//! dc=example,dc=com:0000018c0a1b2c3d0001000000000000 0000018c0a1b2c3e0002000000000003;o=other:;
//! ```
//!
//! Both states only move forward: an update older than or equal to the
//! stored CSN of its replica is ignored.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::base_dn::BaseDn;
use crate::csn::Csn;
use crate::error::{ChangelogError, ChangelogResult};

/// Newest CSN per replica for one domain
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerState {
    csns: BTreeMap<i32, Csn>,
}

impl ServerState {
    /// Empty state
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `csn` for its replica if it is newer than the stored one.
    ///
    /// Returns true when the state changed.
    pub fn update(&mut self, csn: Csn) -> bool {
        match self.csns.get(&csn.server_id()) {
            Some(current) if !csn.is_newer_than(current) => false,
            _ => {
                self.csns.insert(csn.server_id(), csn);
                true
            }
        }
    }

    /// Merge every CSN of `other` into this state
    pub fn update_all(&mut self, other: &ServerState) -> bool {
        let mut changed = false;
        for csn in other.iter() {
            changed |= self.update(*csn);
        }
        changed
    }

    /// Stored CSN for a replica
    pub fn csn(&self, server_id: i32) -> Option<&Csn> {
        self.csns.get(&server_id)
    }

    /// Forget a replica
    pub fn remove(&mut self, server_id: i32) -> Option<Csn> {
        self.csns.remove(&server_id)
    }

    /// Replica ids in ascending order
    pub fn server_ids(&self) -> impl Iterator<Item = i32> + '_ {
        self.csns.keys().copied()
    }

    /// CSNs in replica id order
    pub fn iter(&self) -> impl Iterator<Item = &Csn> {
        self.csns.values()
    }

    /// Number of replicas tracked
    pub fn len(&self) -> usize {
        self.csns.len()
    }

    /// No replica tracked
    pub fn is_empty(&self) -> bool {
        self.csns.is_empty()
    }
}

impl FromIterator<Csn> for ServerState {
    fn from_iter<I: IntoIterator<Item = Csn>>(iter: I) -> Self {
        let mut state = ServerState::new();
        for csn in iter {
            state.update(csn);
        }
        state
    }
}

impl fmt::Display for ServerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, csn) in self.csns.values().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            write!(f, "{}", csn)?;
        }
        Ok(())
    }
}

impl FromStr for ServerState {
    type Err = ChangelogError;

    fn from_str(s: &str) -> ChangelogResult<Self> {
        let mut state = ServerState::new();
        for token in s.split_whitespace() {
            state.update(token.parse()?);
        }
        Ok(state)
    }
}

/// Newest CSN per replica per domain, printed as a cookie
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MultiDomainServerState {
    domains: BTreeMap<BaseDn, ServerState>,
}

impl MultiDomainServerState {
    /// Empty state
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `csn` for `domain`. Returns true when the state changed.
    pub fn update(&mut self, domain: &BaseDn, csn: Csn) -> bool {
        if let Some(state) = self.domains.get_mut(domain) {
            return state.update(csn);
        }
        let mut state = ServerState::new();
        state.update(csn);
        self.domains.insert(domain.clone(), state);
        true
    }

    /// Merge a whole server state into `domain`
    pub fn update_state(&mut self, domain: &BaseDn, state: &ServerState) -> bool {
        self.domains
            .entry(domain.clone())
            .or_default()
            .update_all(state)
    }

    /// Server state of one domain
    pub fn server_state(&self, domain: &BaseDn) -> Option<&ServerState> {
        self.domains.get(domain)
    }

    /// Stored CSN of one replica of one domain
    pub fn csn(&self, domain: &BaseDn, server_id: i32) -> Option<&Csn> {
        self.domains.get(domain).and_then(|s| s.csn(server_id))
    }

    /// Forget one replica of one domain
    pub fn remove(&mut self, domain: &BaseDn, server_id: i32) -> Option<Csn> {
        let state = self.domains.get_mut(domain)?;
        let removed = state.remove(server_id);
        if state.is_empty() {
            self.domains.remove(domain);
        }
        removed
    }

    /// Forget a whole domain
    pub fn remove_domain(&mut self, domain: &BaseDn) -> Option<ServerState> {
        self.domains.remove(domain)
    }

    /// Keep only the domains for which `keep` returns true
    pub fn retain_domains(&mut self, mut keep: impl FnMut(&BaseDn) -> bool) {
        self.domains.retain(|dn, _| keep(dn));
    }

    /// Domains in DN order
    pub fn domains(&self) -> impl Iterator<Item = &BaseDn> {
        self.domains.keys()
    }

    /// `(domain, state)` pairs in DN order
    pub fn iter(&self) -> impl Iterator<Item = (&BaseDn, &ServerState)> {
        self.domains.iter()
    }

    /// No domain tracked
    pub fn is_empty(&self) -> bool {
        self.domains.is_empty()
    }

    /// Drop all state
    pub fn clear(&mut self) {
        self.domains.clear();
    }
}

impl fmt::Display for MultiDomainServerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (dn, state) in &self.domains {
            write!(f, "{}:{};", dn, state)?;
        }
        Ok(())
    }
}

impl FromStr for MultiDomainServerState {
    type Err = ChangelogError;

    fn from_str(s: &str) -> ChangelogResult<Self> {
        let mut result = MultiDomainServerState::new();
        for entry in s.split(';') {
            let entry = entry.trim();
            if entry.is_empty() {
                continue;
            }
            let (dn, csns) = entry.split_once(':').ok_or_else(|| {
                ChangelogError::parse(format!("cookie entry '{}' has no ':' separator", entry))
            })?;
            let dn = BaseDn::new(dn)?;
            let state: ServerState = csns.parse()?;
            result.update_state(&dn, &state);
        }
        Ok(result)
    }
}
