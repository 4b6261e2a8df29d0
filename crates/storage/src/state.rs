//! On-disk layout of the changelog
//!
//! ```text
//! <root>/
//!   domains.state              "<index>:<base dn>" per line
//!   changenumberindex/current.log
//!   <index>.dom/
//!     <server id>.server/
//!       current.log
//!       offline.state          CSN at which the replica went offline
//! ```
//!
//! Domains get a numeric directory so DN characters never reach the file
//! system. `domains.state` is rewritten through a temporary file and a
//! rename, so a crash leaves either the old or the new mapping.

use std::collections::BTreeMap;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use changelog_core::{BaseDn, ChangelogError, ChangelogResult, Csn, MultiDomainServerState};
use parking_lot::Mutex;
use tracing::{debug, warn};

/// File mapping domain indexes to base DNs
pub const DOMAINS_STATE_FILE: &str = "domains.state";
/// Marker written in a replica directory while the replica is offline
pub const OFFLINE_STATE_FILE: &str = "offline.state";
/// Directory of the change-number index
pub const CN_INDEX_DIR: &str = "changenumberindex";

const DOMAIN_DIR_SUFFIX: &str = ".dom";
const SERVER_DIR_SUFFIX: &str = ".server";

/// Everything found on disk at startup
#[derive(Debug, Default)]
pub struct PersistedState {
    /// Known replica ids per domain
    pub replicas: BTreeMap<BaseDn, Vec<i32>>,
    /// Replicas that were offline when the changelog stopped
    pub offline: MultiDomainServerState,
}

/// Owner of the changelog directory layout
pub struct ChangelogStateStore {
    root: PathBuf,
    domains: Mutex<BTreeMap<BaseDn, u32>>,
}

impl ChangelogStateStore {
    /// Open the layout under `root`, creating it if missing
    pub fn open(root: &Path) -> ChangelogResult<Self> {
        fs::create_dir_all(root)?;
        let domains = read_domains_state(&root.join(DOMAINS_STATE_FILE))?;
        Ok(ChangelogStateStore {
            root: root.to_path_buf(),
            domains: Mutex::new(domains),
        })
    }

    /// Root directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory of the change-number index
    pub fn cn_index_dir(&self) -> PathBuf {
        self.root.join(CN_INDEX_DIR)
    }

    /// Scan the layout for known domains, replicas and offline markers
    pub fn read_state(&self) -> ChangelogResult<PersistedState> {
        let domains = self.domains.lock().clone();
        let mut state = PersistedState::default();

        for (dn, index) in domains {
            let dir = self.domain_dir_for(index);
            let mut ids = Vec::new();
            let entries = match fs::read_dir(&dir) {
                Ok(entries) => entries,
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            for entry in entries {
                let entry = entry?;
                let name = entry.file_name();
                let Some(id) = name
                    .to_str()
                    .and_then(|n| n.strip_suffix(SERVER_DIR_SUFFIX))
                    .and_then(|n| n.parse::<i32>().ok())
                else {
                    continue;
                };
                ids.push(id);

                let marker = entry.path().join(OFFLINE_STATE_FILE);
                if let Some(csn) = read_offline_marker(&marker)? {
                    state.offline.update(&dn, csn);
                }
            }
            ids.sort_unstable();
            state.replicas.insert(dn, ids);
        }
        Ok(state)
    }

    /// Directory of `domain`, registering the domain if it is new
    pub fn domain_dir(&self, domain: &BaseDn) -> ChangelogResult<PathBuf> {
        let mut domains = self.domains.lock();
        if let Some(index) = domains.get(domain) {
            return Ok(self.domain_dir_for(*index));
        }

        let index = domains.values().max().map_or(1, |max| max + 1);
        domains.insert(domain.clone(), index);
        if let Err(e) = write_domains_state(&self.root, &domains) {
            domains.remove(domain);
            return Err(e);
        }
        debug!(target: "changelog::state", base_dn = %domain, index, "Registered domain");
        Ok(self.domain_dir_for(index))
    }

    /// Directory of one replica of `domain`, registering the domain if new
    pub fn replica_dir(&self, domain: &BaseDn, server_id: i32) -> ChangelogResult<PathBuf> {
        Ok(self
            .domain_dir(domain)?
            .join(format!("{}{}", server_id, SERVER_DIR_SUFFIX)))
    }

    /// Persist that a replica went offline at `csn`
    pub fn set_offline(&self, domain: &BaseDn, csn: &Csn) -> ChangelogResult<()> {
        let dir = self.replica_dir(domain, csn.server_id())?;
        fs::create_dir_all(&dir)?;
        let tmp = dir.join(format!("{}.tmp", OFFLINE_STATE_FILE));
        {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(csn.to_string().as_bytes())?;
            file.sync_all()?;
        }
        fs::rename(&tmp, dir.join(OFFLINE_STATE_FILE))?;
        Ok(())
    }

    /// Remove the offline marker of a replica. Returns true if one existed.
    pub fn clear_offline(&self, domain: &BaseDn, server_id: i32) -> ChangelogResult<bool> {
        let Some(index) = self.domains.lock().get(domain).copied() else {
            return Ok(false);
        };
        let marker = self
            .domain_dir_for(index)
            .join(format!("{}{}", server_id, SERVER_DIR_SUFFIX))
            .join(OFFLINE_STATE_FILE);
        match fs::remove_file(&marker) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Delete a domain directory and forget the domain
    pub fn remove_domain(&self, domain: &BaseDn) -> ChangelogResult<()> {
        let mut domains = self.domains.lock();
        let Some(index) = domains.remove(domain) else {
            return Ok(());
        };
        write_domains_state(&self.root, &domains)?;
        remove_dir_if_present(&self.domain_dir_for(index))
    }

    /// Delete every domain directory
    pub fn remove_all(&self) -> ChangelogResult<()> {
        let mut domains = self.domains.lock();
        for index in domains.values() {
            remove_dir_if_present(&self.domain_dir_for(*index))?;
        }
        domains.clear();
        write_domains_state(&self.root, &domains)
    }

    fn domain_dir_for(&self, index: u32) -> PathBuf {
        self.root.join(format!("{}{}", index, DOMAIN_DIR_SUFFIX))
    }
}

fn remove_dir_if_present(dir: &Path) -> ChangelogResult<()> {
    match fs::remove_dir_all(dir) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

fn read_domains_state(path: &Path) -> ChangelogResult<BTreeMap<BaseDn, u32>> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
        Err(e) => return Err(e.into()),
    };

    let mut domains = BTreeMap::new();
    for line in content.lines().map(str::trim).filter(|l| !l.is_empty()) {
        let (index, dn) = line.split_once(':').ok_or_else(|| {
            ChangelogError::storage(format!("malformed line '{}' in {}", line, path.display()))
        })?;
        let index: u32 = index.parse().map_err(|_| {
            ChangelogError::storage(format!("bad domain index '{}' in {}", index, path.display()))
        })?;
        domains.insert(BaseDn::new(dn)?, index);
    }
    Ok(domains)
}

fn write_domains_state(root: &Path, domains: &BTreeMap<BaseDn, u32>) -> ChangelogResult<()> {
    let path = root.join(DOMAINS_STATE_FILE);
    let tmp = root.join(format!("{}.tmp", DOMAINS_STATE_FILE));
    {
        let mut file = fs::File::create(&tmp)?;
        for (dn, index) in domains {
            writeln!(file, "{}:{}", index, dn)?;
        }
        file.sync_all()?;
    }
    fs::rename(&tmp, &path)?;
    Ok(())
}

fn read_offline_marker(path: &Path) -> ChangelogResult<Option<Csn>> {
    match fs::read_to_string(path) {
        Ok(content) => match content.trim().parse::<Csn>() {
            Ok(csn) => Ok(Some(csn)),
            Err(e) => {
                warn!(target: "changelog::state", path = %path.display(), error = %e, "Ignoring malformed offline marker");
                Ok(None)
            }
        },
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}
