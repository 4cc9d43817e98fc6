//! Daemon core.
//!
//! Owns the store, event bus, authorizer, and per-service bookkeeping that
//! every front-end shares. Long-running tasks (heartbeat, supervisor
//! monitors, listeners) are children of the daemon's cancellation root and
//! are joined on shutdown.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use dashmap::DashMap;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::authz::Authorizer;
use crate::events::{Event, EventBus, EventType};
use crate::runner::{
    aggregate, CommandFactory, ComponentStatus, ComposeRunner, Runner, ServiceState,
    SystemdRunner,
};
use crate::settings::{Paths, Settings};
use crate::store::{Service, ServiceType, Store};
use crate::{CATCH_SERVICE, SYSTEM_SERVICE};

/// How often the supervisor monitors poll component states.
const MONITOR_INTERVAL: Duration = Duration::from_secs(2);

/// Presentation type of a service, as carried in status payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceDataType {
    Service,
    Cron,
    Docker,
    Unknown,
}

impl ServiceDataType {
    pub fn of(service: &Service) -> ServiceDataType {
        match service.service_type {
            Some(ServiceType::Systemd) if service.timer.is_some() => ServiceDataType::Cron,
            Some(ServiceType::Systemd) => ServiceDataType::Service,
            Some(ServiceType::DockerCompose) => ServiceDataType::Docker,
            None => ServiceDataType::Unknown,
        }
    }
}

/// One component's state in a status payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComponentStatusData {
    pub name: String,
    pub status: ComponentStatus,
}

/// Per-service status payload, as printed by `status` and carried on
/// `ServiceStatusChanged` events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceStatusData {
    pub service_name: String,
    pub service_type: ServiceDataType,
    pub components: Vec<ComponentStatusData>,
}

impl ServiceStatusData {
    /// Aggregate state per the status state machine.
    pub fn state(&self) -> ServiceState {
        let components: Vec<ComponentStatus> =
            self.components.iter().map(|c| c.status).collect();
        aggregate(&components)
    }
}

/// Shared daemon state handed to every subsystem.
pub struct Daemon {
    pub settings: Settings,
    pub paths: Paths,
    pub store: Arc<Store>,
    pub events: EventBus,
    pub authorizer: Arc<dyn Authorizer>,
    pub cancel: CancellationToken,
    pub tracker: TaskTracker,
    /// Per-service installer locks; installs on one service exclude each
    /// other but not reads or other services.
    service_locks: DashMap<String, Arc<Mutex<()>>>,
    /// Last observed component states, for monitor diffing.
    last_statuses: DashMap<String, BTreeMap<String, ComponentStatus>>,
}

impl Daemon {
    pub fn new(settings: Settings, store: Store, authorizer: Arc<dyn Authorizer>) -> Arc<Daemon> {
        let paths = settings.paths();
        Arc::new(Daemon {
            settings,
            paths,
            store: Arc::new(store),
            events: EventBus::new(),
            authorizer,
            cancel: CancellationToken::new(),
            tracker: TaskTracker::new(),
            service_locks: DashMap::new(),
            last_statuses: DashMap::new(),
        })
    }

    /// Spawn the daemon's own background tasks (heartbeat + monitors).
    pub fn start_background(self: &Arc<Daemon>) {
        let bus = self.events.clone();
        let cancel = self.cancel.clone();
        self.tracker.spawn(bus.heartbeat(cancel));
        let daemon = self.clone();
        self.tracker.spawn(async move { daemon.monitor_statuses().await });
    }

    /// Cancel the root and wait for every spawned task to exit.
    pub async fn shutdown(&self) {
        info!("shutting down");
        self.cancel.cancel();
        self.tracker.close();
        self.tracker.wait().await;
    }

    pub fn is_reserved(service: &str) -> bool {
        service == SYSTEM_SERVICE || service == CATCH_SERVICE
    }

    /// The per-service installer lock.
    pub fn service_lock(&self, service: &str) -> Arc<Mutex<()>> {
        self.service_locks
            .entry(service.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Create the service directory skeleton, owned by `user` when set.
    pub fn ensure_dirs(&self, service: &str, user: &str) -> Result<()> {
        let dirs = [
            self.paths.service_bin_dir(service),
            self.paths.service_data_dir(service),
            self.paths.service_env_dir(service),
            self.paths.service_run_dir(service),
        ];
        for dir in &dirs {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("creating {}", dir.display()))?;
        }
        if !user.is_empty() && user != "root" {
            let entry = nix::unistd::User::from_name(user)
                .with_context(|| format!("looking up user {user}"))?
                .ok_or_else(|| anyhow::anyhow!("unknown user: {user}"))?;
            for dir in &dirs {
                nix::unistd::chown(dir.as_path(), Some(entry.uid), Some(entry.gid))
                    .with_context(|| format!("chowning {}", dir.display()))?;
            }
        }
        Ok(())
    }

    /// Build the backend runner for a service's selected generation.
    pub fn runner_for(&self, service: &str, factory: CommandFactory) -> Result<Runner> {
        let svc = self.store.service(service)?;
        self.runner_from(&svc, factory)
    }

    /// Build a runner from an explicit service view (e.g. a staged one).
    pub fn runner_from(&self, svc: &Service, factory: CommandFactory) -> Result<Runner> {
        let Some(service_type) = svc.service_type else {
            bail!("no service configured: {}", svc.name);
        };
        match service_type {
            ServiceType::Systemd => Ok(Runner::Systemd(SystemdRunner::new(svc, factory)?)),
            ServiceType::DockerCompose => {
                let data = self.store.get();
                Ok(Runner::Compose(ComposeRunner::new(
                    svc,
                    self.paths.service_data_dir(&svc.name),
                    data.registry_addr,
                    data.images,
                    factory,
                )?))
            }
        }
    }

    /// Component states for one service. Staged-only services are inspected
    /// through their staged generation so their declared components show up
    /// as stopped.
    pub async fn service_status(
        &self,
        service: &str,
        factory: CommandFactory,
    ) -> Result<ServiceStatusData> {
        let mut svc = self.store.service(service)?;
        if svc.generation == 0 && svc.latest_generation > 0 {
            svc.generation = svc.latest_generation;
        }
        let runner = self.runner_from(&svc, factory)?;
        let mut statuses = runner.statuses().await.unwrap_or_default();
        if statuses.is_empty() {
            for component in declared_components(&svc) {
                statuses.insert(component, ComponentStatus::Stopped);
            }
        }
        if statuses.is_empty() {
            statuses.insert(service.to_string(), ComponentStatus::Stopped);
        }
        Ok(ServiceStatusData {
            service_name: service.to_string(),
            service_type: ServiceDataType::of(&svc),
            components: statuses
                .into_iter()
                .map(|(name, status)| ComponentStatusData { name, status })
                .collect(),
        })
    }

    /// Component states for every known service. Services whose runner
    /// cannot be built report a single unknown component.
    pub async fn all_statuses(&self, factory: CommandFactory) -> Vec<ServiceStatusData> {
        let data = self.store.get();
        let mut out = Vec::new();
        for (name, svc) in &data.services {
            match self.service_status(name, factory.clone()).await {
                Ok(status) => out.push(status),
                Err(err) => {
                    debug!("status for {name}: {err:#}");
                    out.push(ServiceStatusData {
                        service_name: name.clone(),
                        service_type: ServiceDataType::of(svc),
                        components: vec![ComponentStatusData {
                            name: name.clone(),
                            status: ComponentStatus::Unknown,
                        }],
                    });
                }
            }
        }
        out.sort_by(|a, b| a.service_name.cmp(&b.service_name));
        out
    }

    /// Whether any component of the service is running.
    pub async fn is_running(&self, service: &str, factory: CommandFactory) -> Result<bool> {
        let runner = match self.runner_for(service, factory) {
            Ok(r) => r,
            Err(_) => return Ok(false),
        };
        let statuses = runner.statuses().await.unwrap_or_default();
        Ok(statuses
            .values()
            .any(|s| *s == ComponentStatus::Running))
    }

    /// Destroy a stopped service: runner removal happened already; delete
    /// everything under the service root except `data/`, then drop the
    /// store entry and announce the deletion.
    pub async fn remove_service(&self, service: &str, factory: CommandFactory) -> Result<()> {
        if self.is_running(service, factory).await? {
            bail!("service is not stopped");
        }
        let root = self.paths.service_root(service);
        let entries = match std::fs::read_dir(&root) {
            Ok(entries) => entries.collect::<std::io::Result<Vec<_>>>()?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(err) => return Err(err).context("listing service directory"),
        };
        for entry in entries {
            if entry.file_name() == "data" {
                continue;
            }
            let path = entry.path();
            info!("removing {}", path.display());
            if path.is_dir() {
                std::fs::remove_dir_all(&path)
                    .with_context(|| format!("removing {}", path.display()))?;
            } else {
                std::fs::remove_file(&path)
                    .with_context(|| format!("removing {}", path.display()))?;
            }
        }
        self.store.mutate(|data| {
            data.services.remove(service);
            Ok(())
        })?;
        self.last_statuses.remove(service);
        self.events
            .publish(Event::new(EventType::ServiceDeleted, service));
        Ok(())
    }

    /// Poll supervisors and publish `ServiceStatusChanged` whenever a
    /// component transitions.
    async fn monitor_statuses(self: Arc<Daemon>) {
        let factory = crate::runner::quiet_commands();
        let mut tick = tokio::time::interval(MONITOR_INTERVAL);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = tick.tick() => {}
            }
            for status in self.all_statuses(factory.clone()).await {
                let name = status.service_name.clone();
                let current: BTreeMap<String, ComponentStatus> = status
                    .components
                    .iter()
                    .map(|c| (c.name.clone(), c.status))
                    .collect();
                let changed = match self.last_statuses.get(&name) {
                    Some(prev) => *prev != current,
                    None => true,
                };
                if changed {
                    self.last_statuses.insert(name.clone(), current);
                    match serde_json::to_value(&status) {
                        Ok(data) => self.events.publish(
                            Event::new(EventType::ServiceStatusChanged, &name).with_data(data),
                        ),
                        Err(err) => warn!("encoding status event for {name}: {err}"),
                    }
                }
            }
        }
    }

    /// Env artifact path for a service: the staged one when `staged`,
    /// otherwise the newest generation's.
    pub fn env_file(&self, service: &str, staged: bool) -> Result<PathBuf> {
        let svc = self.store.service(service)?;
        let path = if staged {
            svc.artifacts
                .staged(crate::store::ArtifactName::EnvFile)
                .or_else(|| svc.artifacts.latest(crate::store::ArtifactName::EnvFile))
        } else {
            svc.artifacts.latest(crate::store::ArtifactName::EnvFile)
        };
        path.ok_or_else(|| anyhow::anyhow!("no env file found"))
    }
}

/// Build information reported by `version` and `/api/v0/info`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerInfo {
    pub version: String,
    pub os: String,
    pub arch: String,
}

pub fn server_info() -> ServerInfo {
    ServerInfo {
        version: option_env!("CATCHD_BUILD_COMMIT")
            .unwrap_or(env!("CARGO_PKG_VERSION"))
            .to_string(),
        os: std::env::consts::OS.to_string(),
        arch: std::env::consts::ARCH.to_string(),
    }
}

/// Components a service declares before the engine has created anything:
/// the service names of its compose file, or the service itself.
fn declared_components(svc: &Service) -> Vec<String> {
    if svc.service_type != Some(ServiceType::DockerCompose) {
        return vec![svc.name.clone()];
    }
    let Some(path) = svc
        .artifacts
        .gen(crate::store::ArtifactName::ComposeFile, svc.generation)
    else {
        return vec![svc.name.clone()];
    };
    #[derive(serde::Deserialize)]
    struct ComposeShape {
        #[serde(default)]
        services: std::collections::BTreeMap<String, serde_yaml::Value>,
    }
    match std::fs::read(&path)
        .ok()
        .and_then(|raw| serde_yaml::from_slice::<ComposeShape>(&raw).ok())
    {
        Some(shape) if !shape.services.is_empty() => shape.services.into_keys().collect(),
        _ => vec![svc.name.clone()],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::authz::StaticAuthorizer;
    use tempfile::TempDir;

    pub(crate) fn test_daemon(dir: &TempDir) -> Arc<Daemon> {
        let settings = Settings {
            data_dir: dir.path().to_path_buf(),
            ..Settings::default()
        };
        let store = Store::open(settings.paths().db_file()).unwrap();
        Daemon::new(settings, store, Arc::new(StaticAuthorizer::allow_all()))
    }

    #[test]
    fn reserved_names() {
        assert!(Daemon::is_reserved("sys"));
        assert!(Daemon::is_reserved("catch"));
        assert!(!Daemon::is_reserved("web"));
    }

    #[test]
    fn ensure_dirs_creates_skeleton() {
        let dir = TempDir::new().unwrap();
        let daemon = test_daemon(&dir);
        daemon.ensure_dirs("web", "").unwrap();
        for sub in ["bin", "data", "env", "run"] {
            assert!(dir.path().join("services/web").join(sub).is_dir());
        }
    }

    #[tokio::test]
    async fn remove_preserves_data_dir() {
        let dir = TempDir::new().unwrap();
        let daemon = test_daemon(&dir);
        daemon.ensure_dirs("web", "").unwrap();
        std::fs::write(dir.path().join("services/web/data/keep.txt"), b"x").unwrap();
        std::fs::write(dir.path().join("services/web/bin/web-1"), b"x").unwrap();
        daemon
            .store
            .mutate_service("web", |_, _| Ok(()))
            .unwrap();

        let (_h, mut rx) = daemon.events.add_listener(|_| true);
        daemon
            .remove_service("web", crate::runner::quiet_commands())
            .await
            .unwrap();

        assert!(dir.path().join("services/web/data/keep.txt").exists());
        assert!(!dir.path().join("services/web/bin").exists());
        assert!(daemon.store.service("web").is_err());
        let event = rx.recv().await.unwrap();
        assert_eq!(event.event_type, EventType::ServiceDeleted);
        assert_eq!(event.service_name, "web");
    }

    #[test]
    fn service_data_type_classification() {
        let mut svc = Service {
            name: "a".into(),
            service_type: Some(ServiceType::Systemd),
            ..Service::default()
        };
        assert_eq!(ServiceDataType::of(&svc), ServiceDataType::Service);
        svc.timer = Some(crate::store::TimerSpec {
            on_calendar: "*-*-* 0:0:00".into(),
            persistent: true,
        });
        assert_eq!(ServiceDataType::of(&svc), ServiceDataType::Cron);
        svc.service_type = Some(ServiceType::DockerCompose);
        svc.timer = None;
        assert_eq!(ServiceDataType::of(&svc), ServiceDataType::Docker);
    }
}
