//! On-host state store.
//!
//! All daemon state lives in a single versioned JSON document. Reads return a
//! cloned snapshot; every mutation goes through the writer lock and is
//! persisted with a write-temp-then-rename so a crash never leaves a torn
//! document behind.

mod migrate;

pub use migrate::CURRENT_DATA_VERSION;

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io::Write;
use std::path::PathBuf;
use std::sync::RwLock;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// How many generations of a service are kept on disk and reachable by
/// rollback.
pub const MAX_GENERATIONS: u64 = 10;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("service not found: {0}")]
    ServiceNotFound(String),

    #[error("state document version {found} is newer than supported version {supported}")]
    SchemaAhead { found: u32, supported: u32 },

    #[error("no migration path from state document version {0}")]
    NoMigrator(u32),

    #[error("migration from version {from} failed: {reason}")]
    MigrationFailed { from: u32, reason: String },

    #[error("{0}")]
    Invalid(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Serde(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Backend that runs a service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ServiceType {
    Systemd,
    DockerCompose,
}

impl fmt::Display for ServiceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServiceType::Systemd => write!(f, "systemd"),
            ServiceType::DockerCompose => write!(f, "docker-compose"),
        }
    }
}

/// Closed set of artifact names a generation may carry.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "kebab-case")]
pub enum ArtifactName {
    Binary,
    Script,
    EnvFile,
    ComposeFile,
    ComposeNetworkFile,
    UnitFile,
    TimerUnitFile,
    NetnsUnitFile,
}

impl ArtifactName {
    pub fn as_str(&self) -> &'static str {
        match self {
            ArtifactName::Binary => "binary",
            ArtifactName::Script => "script",
            ArtifactName::EnvFile => "env-file",
            ArtifactName::ComposeFile => "compose-file",
            ArtifactName::ComposeNetworkFile => "compose-network-file",
            ArtifactName::UnitFile => "unit-file",
            ArtifactName::TimerUnitFile => "timer-unit-file",
            ArtifactName::NetnsUnitFile => "netns-unit-file",
        }
    }

    pub fn from_str_opt(s: &str) -> Option<Self> {
        Some(match s {
            "binary" => ArtifactName::Binary,
            "script" => ArtifactName::Script,
            "env-file" => ArtifactName::EnvFile,
            "compose-file" => ArtifactName::ComposeFile,
            "compose-network-file" => ArtifactName::ComposeNetworkFile,
            "unit-file" => ArtifactName::UnitFile,
            "timer-unit-file" => ArtifactName::TimerUnitFile,
            "netns-unit-file" => ArtifactName::NetnsUnitFile,
            _ => return None,
        })
    }
}

impl fmt::Display for ArtifactName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reference name under which a staged-but-not-running generation is filed.
pub const REF_STAGED: &str = "staged";
/// Reference name for the generation the supervisor was last asked to run.
pub const REF_RUN: &str = "run";

/// A named file belonging to one or more generations of a service.
///
/// `refs` maps a symbolic reference (`staged`, `run`, or a numeric generation
/// string) to the on-disk location of the artifact content for that
/// reference.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    pub refs: BTreeMap<String, PathBuf>,
}

/// Per-service artifact index. At most one artifact of each name per
/// generation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Artifacts(pub BTreeMap<ArtifactName, Artifact>);

impl Artifacts {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, name: ArtifactName) -> Option<&Artifact> {
        self.0.get(&name)
    }

    /// Path of the artifact at an explicit generation.
    pub fn gen(&self, name: ArtifactName, generation: u64) -> Option<PathBuf> {
        self.0
            .get(&name)?
            .refs
            .get(&generation.to_string())
            .cloned()
    }

    /// Path of the artifact at its newest numeric generation.
    pub fn latest(&self, name: ArtifactName) -> Option<PathBuf> {
        let art = self.0.get(&name)?;
        art.refs
            .iter()
            .filter_map(|(r, p)| r.parse::<u64>().ok().map(|g| (g, p)))
            .max_by_key(|(g, _)| *g)
            .map(|(_, p)| p.clone())
    }

    /// Path of the staged artifact, if one exists.
    pub fn staged(&self, name: ArtifactName) -> Option<PathBuf> {
        self.0.get(&name)?.refs.get(REF_STAGED).cloned()
    }

    /// File the given path under a reference for `name`.
    pub fn set_ref(&mut self, name: ArtifactName, reference: impl Into<String>, path: PathBuf) {
        self.0
            .entry(name)
            .or_default()
            .refs
            .insert(reference.into(), path);
    }

    /// Drop a single reference. Removes the artifact entry entirely when its
    /// last reference goes away.
    pub fn remove_ref(&mut self, name: ArtifactName, reference: &str) {
        if let Some(art) = self.0.get_mut(&name) {
            art.refs.remove(reference);
            if art.refs.is_empty() {
                self.0.remove(&name);
            }
        }
    }

    /// Whether any artifact carries a numeric ref for `g`.
    pub fn gen_exists(&self, g: u64) -> bool {
        let key = g.to_string();
        self.0.values().any(|a| a.refs.contains_key(&key))
    }

    /// Evict numeric references older than the retention window ending at
    /// `latest`. Returns the paths that no remaining reference points at so
    /// the caller can delete the files.
    pub fn retain_last(&mut self, latest: u64, window: u64) -> Vec<PathBuf> {
        let min = latest.saturating_sub(window.saturating_sub(1));
        let mut evicted = Vec::new();
        for art in self.0.values_mut() {
            let old: Vec<String> = art
                .refs
                .keys()
                .filter(|r| matches!(r.parse::<u64>(), Ok(g) if g < min))
                .cloned()
                .collect();
            for r in old {
                if let Some(path) = art.refs.remove(&r) {
                    if !art.refs.values().any(|p| *p == path) {
                        evicted.push(path);
                    }
                }
            }
        }
        self.0.retain(|_, a| !a.refs.is_empty());
        evicted
    }

    /// All paths referenced by any reference of any artifact.
    pub fn all_paths(&self) -> Vec<PathBuf> {
        let mut out: Vec<PathBuf> = self
            .0
            .values()
            .flat_map(|a| a.refs.values().cloned())
            .collect();
        out.sort();
        out.dedup();
        out
    }
}

/// A named deployable owned by this host.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Service {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service_type: Option<ServiceType>,
    /// Currently selected generation; 0 before the first commit.
    #[serde(default)]
    pub generation: u64,
    /// Monotonically increasing high-water mark.
    #[serde(default)]
    pub latest_generation: u64,
    /// Unix user the service's files are owned by.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub user: String,
    /// Arguments appended to the service invocation.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub network: Option<crate::netns::NetworkSpec>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timer: Option<TimerSpec>,
    #[serde(default, skip_serializing_if = "Artifacts::is_empty")]
    pub artifacts: Artifacts,
}

impl Service {
    /// Whether the service has ever been committed.
    pub fn committed(&self) -> bool {
        self.generation > 0
    }
}

/// Timer companion spec for cron-style services.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimerSpec {
    pub on_calendar: String,
    pub persistent: bool,
}

/// Host-level bind mount managed via a mount unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Volume {
    pub name: String,
    /// `host:path` source.
    pub src: String,
    /// Mount point under the mounts root.
    pub path: PathBuf,
    pub mount_type: String,
    pub opts: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub deps: String,
}

/// A stored manifest reference inside an image repository.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageManifest {
    pub content_type: String,
    pub blob_hash: String,
}

/// An image repository (`<service>/<container>`) in the embedded registry.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageRepo {
    pub refs: BTreeMap<String, ImageManifest>,
}

/// Root of the persisted state document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Data {
    pub version: u32,
    #[serde(default)]
    pub services: BTreeMap<String, Service>,
    #[serde(default)]
    pub volumes: BTreeMap<String, Volume>,
    #[serde(default)]
    pub images: BTreeMap<String, ImageRepo>,
    /// Loopback address of the embedded registry, assigned at daemon start.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub registry_addr: String,
}

impl Default for Data {
    fn default() -> Self {
        Data {
            version: CURRENT_DATA_VERSION,
            services: BTreeMap::new(),
            volumes: BTreeMap::new(),
            images: BTreeMap::new(),
            registry_addr: String::new(),
        }
    }
}

/// Single-writer store over the JSON state document.
#[derive(Debug)]
pub struct Store {
    path: PathBuf,
    data: RwLock<Data>,
}

impl Store {
    /// Open (or create) the state document at `path`, migrating it to the
    /// current schema version. A document written by a newer daemon is a
    /// fatal error.
    pub fn open(path: impl Into<PathBuf>) -> Result<Store> {
        let path = path.into();
        let data = match fs::read(&path) {
            Ok(raw) => {
                let mut data: Data = serde_json::from_slice(&raw)?;
                migrate::run(&mut data)?;
                data
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Data::default(),
            Err(err) => return Err(err.into()),
        };
        let store = Store {
            path,
            data: RwLock::new(data),
        };
        store.persist(&store.data.read().expect("store lock poisoned"))?;
        Ok(store)
    }

    /// Consistent snapshot of the whole document.
    pub fn get(&self) -> Data {
        self.data.read().expect("store lock poisoned").clone()
    }

    /// Snapshot of a single service.
    pub fn service(&self, name: &str) -> Result<Service> {
        self.data
            .read()
            .expect("store lock poisoned")
            .services
            .get(name)
            .cloned()
            .ok_or_else(|| StoreError::ServiceNotFound(name.to_string()))
    }

    /// Replace the whole document atomically.
    pub fn set(&self, data: Data) -> Result<()> {
        let mut guard = self.data.write().expect("store lock poisoned");
        self.persist(&data)?;
        *guard = data;
        Ok(())
    }

    /// Read-modify-write under the writer lock. The closure receives a
    /// mutable copy; returning an error aborts the mutation and nothing is
    /// persisted.
    pub fn mutate<F>(&self, f: F) -> Result<Data>
    where
        F: FnOnce(&mut Data) -> Result<()>,
    {
        let mut guard = self.data.write().expect("store lock poisoned");
        let mut next = guard.clone();
        f(&mut next)?;
        self.persist(&next)?;
        *guard = next.clone();
        Ok(next)
    }

    /// Mutate a single service, creating the entry if absent. Returns the
    /// service as stored.
    pub fn mutate_service<F>(&self, name: &str, f: F) -> Result<Service>
    where
        F: FnOnce(&mut Data, &mut Service) -> Result<()>,
    {
        let updated = self.mutate(|data| {
            let mut svc = data.services.get(name).cloned().unwrap_or_else(|| Service {
                name: name.to_string(),
                ..Service::default()
            });
            f(data, &mut svc)?;
            data.services.insert(name.to_string(), svc);
            Ok(())
        })?;
        Ok(updated
            .services
            .get(name)
            .cloned()
            .expect("service upserted above"))
    }

    fn persist(&self, data: &Data) -> Result<()> {
        let raw = serde_json::to_vec_pretty(data)?;
        let dir = self
            .path
            .parent()
            .ok_or_else(|| StoreError::Invalid(format!("bad store path: {:?}", self.path)))?;
        fs::create_dir_all(dir)?;
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        tmp.write_all(&raw)?;
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path).map_err(|e| e.error)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open_store(dir: &TempDir) -> Store {
        Store::open(dir.path().join("db.json")).unwrap()
    }

    #[test]
    fn open_creates_empty_document() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        let data = store.get();
        assert_eq!(data.version, CURRENT_DATA_VERSION);
        assert!(data.services.is_empty());
        assert!(dir.path().join("db.json").exists());
    }

    #[test]
    fn mutations_survive_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("db.json");
        {
            let store = Store::open(&path).unwrap();
            store
                .mutate_service("web", |_, svc| {
                    svc.service_type = Some(ServiceType::Systemd);
                    svc.latest_generation = 3;
                    svc.generation = 3;
                    Ok(())
                })
                .unwrap();
        }
        let store = Store::open(&path).unwrap();
        let svc = store.service("web").unwrap();
        assert_eq!(svc.generation, 3);
        assert_eq!(svc.service_type, Some(ServiceType::Systemd));
    }

    #[test]
    fn failed_mutation_leaves_snapshot_unchanged() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        let before = store.get();
        let err = store.mutate(|data| {
            data.services.insert("x".into(), Service::default());
            Err(StoreError::Invalid("abort".into()))
        });
        assert!(err.is_err());
        assert_eq!(store.get(), before);
    }

    #[test]
    fn schema_ahead_is_fatal() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("db.json");
        std::fs::write(
            &path,
            format!("{{\"version\": {}}}", CURRENT_DATA_VERSION + 1),
        )
        .unwrap();
        match Store::open(&path) {
            Err(StoreError::SchemaAhead { .. }) => {}
            other => panic!("expected SchemaAhead, got {other:?}"),
        }
    }

    #[test]
    fn artifact_latest_picks_highest_generation() {
        let mut arts = Artifacts::default();
        arts.set_ref(ArtifactName::Binary, "1", PathBuf::from("/srv/bin/web-1"));
        arts.set_ref(ArtifactName::Binary, "3", PathBuf::from("/srv/bin/web-3"));
        arts.set_ref(ArtifactName::Binary, "2", PathBuf::from("/srv/bin/web-2"));
        arts.set_ref(
            ArtifactName::Binary,
            REF_STAGED,
            PathBuf::from("/srv/bin/web-3"),
        );
        assert_eq!(
            arts.latest(ArtifactName::Binary),
            Some(PathBuf::from("/srv/bin/web-3"))
        );
        assert_eq!(
            arts.gen(ArtifactName::Binary, 2),
            Some(PathBuf::from("/srv/bin/web-2"))
        );
    }

    #[test]
    fn retain_last_evicts_old_generations_only() {
        let mut arts = Artifacts::default();
        for g in 1..=12u64 {
            arts.set_ref(
                ArtifactName::Binary,
                g.to_string(),
                PathBuf::from(format!("/srv/bin/web-{g}")),
            );
        }
        let evicted = arts.retain_last(12, MAX_GENERATIONS);
        // Generations 1 and 2 fall out of the window [3, 12].
        let mut names: Vec<String> = evicted
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        names.sort();
        assert_eq!(names, vec!["web-1", "web-2"]);
        assert_eq!(arts.gen(ArtifactName::Binary, 3), Some("/srv/bin/web-3".into()));
        assert_eq!(arts.gen(ArtifactName::Binary, 2), None);
    }

    #[test]
    fn retain_last_spares_paths_still_referenced() {
        let mut arts = Artifacts::default();
        arts.set_ref(ArtifactName::EnvFile, "1", PathBuf::from("/srv/env/env-1"));
        // The run reference still points at the generation-1 file.
        arts.set_ref(ArtifactName::EnvFile, REF_RUN, PathBuf::from("/srv/env/env-1"));
        for g in 2..=11u64 {
            arts.set_ref(
                ArtifactName::EnvFile,
                g.to_string(),
                PathBuf::from(format!("/srv/env/env-{g}")),
            );
        }
        let evicted = arts.retain_last(11, MAX_GENERATIONS);
        assert!(evicted.is_empty(), "run ref must keep the file alive: {evicted:?}");
    }
}
