//! On-disk layout of the changelog.
//!
//! ```text
//! <root>/
//!   domains.state                 "<domainId>:<baseDN>" per line
//!   <domainId>.dom/
//!     generation<id>.id           generation id of the domain
//!     <replicaId>.server/         one replica log
//!       offline.state             CSN at which the replica went offline
//!   changenumberindex/            change-number index log
//! ```
//!
//! Domain ids are never reused. Removing a domain deletes its directory
//! but keeps its line in `domains.state`.

use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tracing::{debug, info, warn};

use crate::error::{ChangelogError, IoResultExt, poisoned};
use crate::log::{Log, LogOptions, LogRegistry, RecordParser};
use crate::replication::{ChangeNumberIndexRecord, Csn, Dn, MultiDomainServerState, UpdateMsg};

const DOMAINS_STATE_FILE: &str = "domains.state";
const DOMAIN_DIR_SUFFIX: &str = ".dom";
const SERVER_DIR_SUFFIX: &str = ".server";
const OFFLINE_STATE_FILE: &str = "offline.state";
const GENERATION_ID_PREFIX: &str = "generation";
const GENERATION_ID_SUFFIX: &str = ".id";
const CN_INDEX_DIR: &str = "changenumberindex";
const TMP_SUFFIX: &str = ".tmp";

/// What the changelog directory says about domains and replicas.
#[derive(Debug, Clone, Default)]
pub struct ChangelogState {
    generation_ids: BTreeMap<Dn, u64>,
    replicas: BTreeMap<Dn, BTreeSet<u16>>,
    offline_replicas: MultiDomainServerState,
}

impl ChangelogState {
    /// Domains holding at least one replica log or a generation id.
    pub fn domains(&self) -> impl Iterator<Item = &Dn> {
        self.replicas
            .keys()
            .chain(self.generation_ids.keys())
            .collect::<BTreeSet<_>>()
            .into_iter()
    }

    pub fn generation_id(&self, base_dn: &Dn) -> Option<u64> {
        self.generation_ids.get(base_dn).copied()
    }

    pub fn generation_ids(&self) -> impl Iterator<Item = (&Dn, u64)> {
        self.generation_ids.iter().map(|(dn, id)| (dn, *id))
    }

    pub fn replica_ids(&self, base_dn: &Dn) -> impl Iterator<Item = u16> + '_ {
        self.replicas.get(base_dn).into_iter().flatten().copied()
    }

    /// Offline CSN of every replica that went offline and did not publish
    /// since.
    pub fn offline_replicas(&self) -> &MultiDomainServerState {
        &self.offline_replicas
    }
}

struct EnvironmentState {
    domain_ids: BTreeMap<Dn, u32>,
    next_domain_id: u32,
    changelog: ChangelogState,
}

/// Owner of the changelog directory tree and of the [`LogRegistry`] every
/// log in it is opened through.
pub struct ReplicationEnvironment {
    root: PathBuf,
    registry: LogRegistry,
    state: Mutex<EnvironmentState>,
}

impl ReplicationEnvironment {
    /// Opens the changelog rooted at `root`, creating it when missing, and
    /// reads back the state of every domain.
    pub fn open(root: &Path) -> Result<Self, ChangelogError> {
        fs::create_dir_all(root).at(root)?;
        let domain_ids = read_domains_state(&root.join(DOMAINS_STATE_FILE))?;
        let next_domain_id = domain_ids.values().max().map_or(1, |max| max + 1);

        let mut changelog = ChangelogState::default();
        for (base_dn, id) in &domain_ids {
            let dir = root.join(domain_dir_name(*id));
            if dir.is_dir() {
                read_domain_dir(&dir, base_dn, &mut changelog)?;
            }
        }
        info!(
            root = %root.display(),
            domains = domain_ids.len(),
            offline = %changelog.offline_replicas,
            "replication environment opened"
        );

        Ok(Self {
            root: root.to_path_buf(),
            registry: LogRegistry::new(),
            state: Mutex::new(EnvironmentState {
                domain_ids,
                next_domain_id,
                changelog,
            }),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn registry(&self) -> &LogRegistry {
        &self.registry
    }

    /// Snapshot of the persisted domain and replica state.
    pub fn changelog_state(&self) -> Result<ChangelogState, ChangelogError> {
        Ok(self.state.lock().map_err(poisoned("environment"))?.changelog.clone())
    }

    /// Opens (or creates) the log of replica `server_id` of `base_dn`.
    pub fn open_replica_log(
        &self,
        base_dn: &Dn,
        server_id: u16,
        parser: Arc<dyn RecordParser<Csn, UpdateMsg>>,
        options: LogOptions,
    ) -> Result<Log<Csn, UpdateMsg>, ChangelogError> {
        let mut state = self.state.lock().map_err(poisoned("environment"))?;
        let domain_dir = self.domain_dir(&mut state, base_dn)?;
        let path = domain_dir.join(server_dir_name(server_id));
        let log = self.registry.open_log(&path, parser, options)?;
        if state
            .changelog
            .replicas
            .entry(base_dn.clone())
            .or_default()
            .insert(server_id)
        {
            debug!(%base_dn, server_id, path = %path.display(), "replica log created");
        }
        Ok(log)
    }

    /// Opens (or creates) the change-number index log.
    pub fn open_change_number_index_log(
        &self,
        parser: Arc<dyn RecordParser<u64, ChangeNumberIndexRecord>>,
        options: LogOptions,
    ) -> Result<Log<u64, ChangeNumberIndexRecord>, ChangelogError> {
        self.registry.open_log(&self.root.join(CN_INDEX_DIR), parser, options)
    }

    /// Persists that the replica of `offline` went offline at that CSN.
    pub fn notify_replica_offline(&self, base_dn: &Dn, offline: Csn) -> Result<(), ChangelogError> {
        let mut state = self.state.lock().map_err(poisoned("environment"))?;
        let server_dir = self
            .domain_dir(&mut state, base_dn)?
            .join(server_dir_name(offline.server_id()));
        fs::create_dir_all(&server_dir).at(&server_dir)?;
        write_state_file(&server_dir, OFFLINE_STATE_FILE, offline.to_string().as_bytes())?;

        if let Some(previous) = state.changelog.offline_replicas.get_csn(base_dn, offline.server_id()) {
            state.changelog.offline_replicas.remove_csn(base_dn, &previous);
        }
        state.changelog.offline_replicas.update(base_dn, offline);
        info!(%base_dn, csn = %offline, "replica offline state persisted");
        Ok(())
    }

    /// Forgets the offline state of a replica that published again.
    /// Returns whether the replica was offline.
    pub fn notify_replica_online(&self, base_dn: &Dn, server_id: u16) -> Result<bool, ChangelogError> {
        let mut state = self.state.lock().map_err(poisoned("environment"))?;
        let Some(offline) = state.changelog.offline_replicas.get_csn(base_dn, server_id) else {
            return Ok(false);
        };
        if let Some(id) = state.domain_ids.get(base_dn) {
            let path = self
                .root
                .join(domain_dir_name(*id))
                .join(server_dir_name(server_id))
                .join(OFFLINE_STATE_FILE);
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e).at(&path),
            }
        }
        state.changelog.offline_replicas.remove_csn(base_dn, &offline);
        info!(%base_dn, server_id, "replica back online");
        Ok(true)
    }

    /// Persists the generation id of `base_dn`. Returns the previous one.
    pub fn set_generation_id(&self, base_dn: &Dn, generation_id: u64) -> Result<Option<u64>, ChangelogError> {
        let mut state = self.state.lock().map_err(poisoned("environment"))?;
        let dir = self.domain_dir(&mut state, base_dn)?;
        let previous = state.changelog.generation_ids.get(base_dn).copied();
        if previous == Some(generation_id) {
            return Ok(previous);
        }
        if let Some(previous) = previous {
            let old = dir.join(generation_file_name(previous));
            match fs::remove_file(&old) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e).at(&old),
            }
        }
        write_state_file(&dir, &generation_file_name(generation_id), &[])?;
        state.changelog.generation_ids.insert(base_dn.clone(), generation_id);
        info!(%base_dn, generation_id, ?previous, "generation id persisted");
        Ok(previous)
    }

    /// Deletes the directory of `base_dn`. Its logs must be closed first.
    pub fn remove_domain(&self, base_dn: &Dn) -> Result<(), ChangelogError> {
        let mut state = self.state.lock().map_err(poisoned("environment"))?;
        if let Some(id) = state.domain_ids.get(base_dn) {
            let dir = self.root.join(domain_dir_name(*id));
            if dir.exists() {
                fs::remove_dir_all(&dir).at(&dir)?;
            }
        }
        state.changelog.replicas.remove(base_dn);
        state.changelog.generation_ids.remove(base_dn);
        state.changelog.offline_replicas.remove_domain(base_dn);
        info!(%base_dn, "domain removed from the changelog");
        Ok(())
    }

    /// Directory of `base_dn`, assigning a domain id and creating the
    /// directory on first use.
    fn domain_dir(&self, state: &mut EnvironmentState, base_dn: &Dn) -> Result<PathBuf, ChangelogError> {
        let id = match state.domain_ids.get(base_dn) {
            Some(id) => *id,
            None => {
                if base_dn.as_str().contains(['\n', '\r']) {
                    return Err(ChangelogError::InvalidArgument(format!(
                        "base DN {base_dn:?} contains a line break"
                    )));
                }
                let id = state.next_domain_id;
                append_domain_line(&self.root.join(DOMAINS_STATE_FILE), id, base_dn)?;
                state.domain_ids.insert(base_dn.clone(), id);
                state.next_domain_id += 1;
                info!(%base_dn, id, "domain registered");
                id
            }
        };
        let dir = self.root.join(domain_dir_name(id));
        fs::create_dir_all(&dir).at(&dir)?;
        Ok(dir)
    }
}

impl std::fmt::Debug for ReplicationEnvironment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicationEnvironment")
            .field("root", &self.root)
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}

fn domain_dir_name(id: u32) -> String {
    format!("{id}{DOMAIN_DIR_SUFFIX}")
}

fn server_dir_name(server_id: u16) -> String {
    format!("{server_id}{SERVER_DIR_SUFFIX}")
}

fn generation_file_name(generation_id: u64) -> String {
    format!("{GENERATION_ID_PREFIX}{generation_id}{GENERATION_ID_SUFFIX}")
}

fn read_domains_state(path: &Path) -> Result<BTreeMap<Dn, u32>, ChangelogError> {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
        Err(e) => return Err(e).at(path),
    };
    let mut domains = BTreeMap::new();
    let mut offset = 0u64;
    for line in contents.lines() {
        let line_offset = offset;
        offset += line.len() as u64 + 1;
        if line.trim().is_empty() {
            continue;
        }
        let parsed = line
            .split_once(':')
            .and_then(|(id, dn)| id.parse::<u32>().ok().map(|id| (id, dn)));
        let Some((id, dn)) = parsed else {
            return Err(ChangelogError::Corrupted {
                path: path.to_path_buf(),
                offset: line_offset,
                reason: format!("invalid domain line {line:?}"),
            });
        };
        if domains.insert(Dn::from(dn), id).is_some() {
            warn!(path = %path.display(), dn, id, "domain listed twice, keeping the last id");
        }
    }
    Ok(domains)
}

fn append_domain_line(path: &Path, id: u32, base_dn: &Dn) -> Result<(), ChangelogError> {
    let mut file = OpenOptions::new().create(true).append(true).open(path).at(path)?;
    writeln!(file, "{id}:{base_dn}").at(path)?;
    file.sync_all().at(path)
}

fn read_domain_dir(dir: &Path, base_dn: &Dn, changelog: &mut ChangelogState) -> Result<(), ChangelogError> {
    for entry in fs::read_dir(dir).at(dir)? {
        let entry = entry.at(dir)?;
        let name = entry.file_name().to_string_lossy().into_owned();

        if let Some(id) = name
            .strip_prefix(GENERATION_ID_PREFIX)
            .and_then(|rest| rest.strip_suffix(GENERATION_ID_SUFFIX))
        {
            match id.parse::<u64>() {
                Ok(id) => {
                    changelog.generation_ids.insert(base_dn.clone(), id);
                }
                Err(_) => warn!(file = %entry.path().display(), "ignoring invalid generation id file"),
            }
            continue;
        }

        let Some(server_id) = name
            .strip_suffix(SERVER_DIR_SUFFIX)
            .and_then(|id| id.parse::<u16>().ok())
        else {
            continue;
        };
        changelog.replicas.entry(base_dn.clone()).or_default().insert(server_id);

        let offline_path = entry.path().join(OFFLINE_STATE_FILE);
        match fs::read_to_string(&offline_path) {
            Ok(contents) => {
                let csn: Csn = contents.trim().parse()?;
                changelog.offline_replicas.update(base_dn, csn);
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e).at(&offline_path),
        }
    }
    Ok(())
}

/// Replaces `dir/name` with `contents` through a temporary file.
fn write_state_file(dir: &Path, name: &str, contents: &[u8]) -> Result<(), ChangelogError> {
    let tmp_path = dir.join(format!("{name}{TMP_SUFFIX}"));
    {
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp_path)
            .at(&tmp_path)?;
        file.write_all(contents).at(&tmp_path)?;
        file.sync_all().at(&tmp_path)?;
    }
    let final_path = dir.join(name);
    fs::rename(&tmp_path, &final_path).at(&final_path)?;
    File::open(dir).and_then(|d| d.sync_all()).at(dir)
}
