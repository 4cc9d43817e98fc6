//! Installer pipeline.
//!
//! Coordinates the full mutation of a service: stage the payload under a new
//! generation, classify it, render units, record artifacts in the store,
//! then either stop at staging or promote and reconcile the supervisor.
//! Any failure after staging deletes the staged files and leaves the store
//! as it was.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{bail, Context, Result};
use log::{debug, info, warn};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::classify::{self, PayloadKind};
use crate::daemon::Daemon;
use crate::events::{Event, EventType};
use crate::netns::NetworkSpec;
use crate::render::{self, ExecKind, UnitView};
use crate::runner::CommandFactory;
use crate::store::{
    ArtifactName, Service, ServiceType, TimerSpec, MAX_GENERATIONS, REF_RUN, REF_STAGED,
};

/// Upload accounting shared with whatever renders progress.
#[derive(Debug)]
pub struct RateMeter {
    received: AtomicU64,
    start: Instant,
}

impl RateMeter {
    pub fn new() -> Arc<RateMeter> {
        Arc::new(RateMeter {
            received: AtomicU64::new(0),
            start: Instant::now(),
        })
    }

    fn add(&self, n: u64) {
        self.received.fetch_add(n, Ordering::Relaxed);
    }

    pub fn received(&self) -> u64 {
        self.received.load(Ordering::Relaxed)
    }

    /// Average bytes per second since the upload began.
    pub fn rate(&self) -> f64 {
        let elapsed = self.start.elapsed().as_secs_f64();
        if elapsed <= 0.0 {
            return 0.0;
        }
        self.received() as f64 / elapsed
    }
}

/// Render a byte count the way a human wants to read it.
pub fn human_bytes(bytes: f64) -> String {
    const UNIT: f64 = 1024.0;
    if bytes <= UNIT {
        return format!("{bytes:.2} B");
    }
    let prefixes = ['K', 'M', 'G', 'T', 'P', 'E'];
    let mut n = bytes;
    let mut i = 0usize;
    while n > UNIT && i < prefixes.len() {
        n /= UNIT;
        i += 1;
    }
    format!("{n:.2} {}B", prefixes[i - 1])
}

/// What to change about a service, besides the payload itself.
#[derive(Debug, Clone, Default)]
pub struct InstallRequest {
    pub service: String,
    /// Unix user the service files belong to; empty keeps the current one.
    pub user: String,
    /// Replace the service arguments when set.
    pub args: Option<Vec<String>>,
    /// Replace the network spec when set.
    pub network: Option<NetworkSpec>,
    /// Install as a cron-style timer service when set.
    pub timer: Option<TimerSpec>,
    /// Materialize and record the new generation but do not promote it.
    pub stage_only: bool,
    /// Ask the supervisor to reconcile after promotion.
    pub restart: bool,
    /// The payload is an env file rather than a deployable.
    pub env_file: bool,
}

impl InstallRequest {
    pub fn new(service: impl Into<String>) -> InstallRequest {
        InstallRequest {
            service: service.into(),
            restart: true,
            ..InstallRequest::default()
        }
    }
}

/// One service mutation. Holds the daemon handle and the command factory
/// used for supervisor reconciliation.
pub struct Installer {
    daemon: Arc<Daemon>,
    factory: CommandFactory,
}

impl Installer {
    pub fn new(daemon: Arc<Daemon>, factory: CommandFactory) -> Installer {
        Installer { daemon, factory }
    }

    /// Install from a payload stream. The whole pipeline runs under the
    /// per-service lock; `meter` observes received bytes for progress.
    pub async fn install_stream<R>(
        &self,
        req: &InstallRequest,
        reader: &mut R,
        meter: Option<Arc<RateMeter>>,
    ) -> Result<Service>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let lock = self.daemon.service_lock(&req.service);
        let _guard = lock.lock().await;
        self.daemon.ensure_dirs(&req.service, &req.user)?;

        let staged = self
            .stage_payload(req, reader, meter)
            .await
            .context("staging payload")?;
        self.finish(req, Some(staged)).await
    }

    /// Install a configuration-only change: no payload, the exec artifact is
    /// carried forward and units are re-rendered.
    pub async fn install_config(&self, req: &InstallRequest) -> Result<Service> {
        let lock = self.daemon.service_lock(&req.service);
        let _guard = lock.lock().await;
        self.daemon.ensure_dirs(&req.service, &req.user)?;
        self.finish(req, None).await
    }

    /// Promote whatever is currently staged for the service.
    pub async fn commit_staged(&self, req: &InstallRequest) -> Result<Service> {
        let lock = self.daemon.service_lock(&req.service);
        let _guard = lock.lock().await;

        let svc = self.daemon.store.service(&req.service)?;
        let g = svc.latest_generation;
        let has_staged = svc
            .artifacts
            .0
            .values()
            .any(|a| a.refs.contains_key(REF_STAGED));
        if g == 0 || (!has_staged && svc.generation == g) {
            bail!("nothing staged for {}", req.service);
        }
        // On failure, fall back to the staged (pre-promotion) state.
        self.promote(req, g, Vec::new(), Some(svc)).await
    }

    /// File externally prepared artifact contents (e.g. from the edit flow)
    /// as a staged generation: replaced artifacts point at the new files,
    /// everything else is carried forward.
    pub async fn stage_artifacts(
        &self,
        service: &str,
        replace: Vec<(ArtifactName, PathBuf)>,
    ) -> Result<Service> {
        let lock = self.daemon.service_lock(service);
        let _guard = lock.lock().await;

        let stored = self.daemon.store.mutate_service(service, |_, svc| {
            let g = svc.latest_generation + 1;
            let carried: Vec<(ArtifactName, PathBuf)> = svc
                .artifacts
                .0
                .keys()
                .filter(|name| !replace.iter().any(|(n, _)| n == *name))
                .filter_map(|name| svc.artifacts.latest(*name).map(|p| (*name, p)))
                .collect();
            for (name, path) in carried {
                svc.artifacts.set_ref(name, g.to_string(), path);
            }
            for (name, path) in &replace {
                svc.artifacts.set_ref(*name, g.to_string(), path.clone());
                svc.artifacts.set_ref(*name, REF_STAGED, path.clone());
            }
            svc.latest_generation = g;
            Ok(())
        })?;
        self.daemon
            .events
            .publish(Event::new(EventType::ServiceConfigStaged, service));
        Ok(stored)
    }

    /// Reconcile the supervisor against the currently selected generation.
    /// Used by rollback and config edits; no generation is cut.
    pub async fn install_current(&self, service: &str) -> Result<()> {
        let lock = self.daemon.service_lock(service);
        let _guard = lock.lock().await;
        self.sync_runtime_env(service)?;
        let runner = self.daemon.runner_for(service, self.factory.clone())?;
        runner.reconcile().await
    }

    /// Stage a payload into generation-numbered files. Returns the list of
    /// files created, for cleanup on later failure.
    async fn stage_payload<R>(
        &self,
        req: &InstallRequest,
        reader: &mut R,
        meter: Option<Arc<RateMeter>>,
    ) -> Result<StagedPayload>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let service = &req.service;
        let root = self.daemon.paths.service_root(service);
        let mut tmp = tempfile::Builder::new()
            .prefix(".staged-")
            .tempfile_in(&root)
            .context("creating staging file")?;

        {
            let file = tmp.as_file_mut();
            let mut buf = vec![0u8; 64 * 1024];
            loop {
                let n = reader.read(&mut buf).await.context("reading payload")?;
                if n == 0 {
                    break;
                }
                use std::io::Write;
                file.write_all(&buf[..n]).context("writing staging file")?;
                if let Some(m) = &meter {
                    m.add(n as u64);
                }
            }
            use std::io::Write;
            file.flush()?;
        }

        if req.env_file {
            return Ok(StagedPayload {
                kind: StagedKind::Env,
                tmp,
            });
        }

        let header = read_head(tmp.path(), 1 << 20)?;
        let kind = classify::classify(&header, std::env::consts::OS, std::env::consts::ARCH)?;
        let kind = match kind {
            PayloadKind::Zstd => {
                // Decompress and classify the inner payload.
                let mut inner = tempfile::Builder::new()
                    .prefix(".staged-")
                    .tempfile_in(&root)
                    .context("creating decompression file")?;
                let src = std::fs::File::open(tmp.path())?;
                let mut decoder = zstd::stream::read::Decoder::new(src)?;
                std::io::copy(&mut decoder, inner.as_file_mut())
                    .context("decompressing payload")?;
                tmp = inner;
                let header = read_head(tmp.path(), 1 << 20)?;
                classify::classify(&header, std::env::consts::OS, std::env::consts::ARCH)?
            }
            other => other,
        };

        let staged_kind = match kind {
            PayloadKind::Binary => StagedKind::Exec(ExecKind::Binary),
            PayloadKind::Script => StagedKind::Exec(ExecKind::Script),
            PayloadKind::TypeScript => StagedKind::Exec(ExecKind::TypeScript),
            PayloadKind::Compose => StagedKind::Compose,
            PayloadKind::Zstd | PayloadKind::Unknown => {
                bail!("unable to detect payload type")
            }
        };
        Ok(StagedPayload {
            kind: staged_kind,
            tmp,
        })
    }

    /// Cut the new generation: materialize artifacts, render units, record
    /// refs, then stage or promote.
    async fn finish(&self, req: &InstallRequest, payload: Option<StagedPayload>) -> Result<Service> {
        let service = &req.service;
        let prev = self.daemon.store.get().services.get(service).cloned();
        let prev_svc = prev.clone().unwrap_or_else(|| Service {
            name: service.clone(),
            ..Service::default()
        });
        let g = prev_svc.latest_generation + 1;

        // Work out the service shape for this generation.
        let mut next = prev_svc.clone();
        if !req.user.is_empty() {
            next.user = req.user.clone();
        } else if next.user.is_empty() {
            next.user = self.daemon.settings.default_user.clone();
        }
        if let Some(args) = &req.args {
            next.args = args.clone();
        }
        if let Some(network) = &req.network {
            next.network = Some(merge_stable_id(network.clone(), prev_svc.network.as_ref()));
        }
        if let Some(timer) = &req.timer {
            next.timer = Some(timer.clone());
        }

        let mut created: Vec<PathBuf> = Vec::new();
        let result = self
            .materialize(req, payload, &mut next, g, &mut created)
            .await;
        let arts = match result {
            Ok(arts) => arts,
            Err(err) => {
                remove_files(&created);
                return Err(err);
            }
        };

        // Record the generation in the store. Staging already files the
        // generation and advances the high-water mark; promotion below only
        // moves the selected generation.
        let stored = self.daemon.store.mutate_service(service, |_, svc| {
            svc.service_type = next.service_type;
            svc.user = next.user.clone();
            svc.args = next.args.clone();
            svc.network = next.network.clone();
            svc.timer = next.timer.clone();
            for (name, path) in &arts {
                svc.artifacts.set_ref(*name, g.to_string(), path.clone());
                svc.artifacts.set_ref(*name, REF_STAGED, path.clone());
            }
            svc.latest_generation = g;
            Ok(())
        });
        let stored = match stored {
            Ok(s) => s,
            Err(err) => {
                remove_files(&created);
                return Err(err.into());
            }
        };

        if req.stage_only {
            // The first contact with a service announces its creation even
            // when nothing runs yet; later stagings are config events.
            let event_type = if prev.is_none() {
                EventType::ServiceCreated
            } else {
                EventType::ServiceConfigStaged
            };
            self.daemon.events.publish(Event::new(event_type, service));
            return Ok(stored);
        }

        // A failed promotion reverts to the pre-install snapshot: the staged
        // refs recorded above disappear with it.
        self.promote(req, g, created, prev).await
    }

    /// Materialize every artifact of generation `g`, returning the artifact
    /// map. Carried-forward artifacts reuse the previous generation's file;
    /// renders whose digest matches the previous render do too.
    async fn materialize(
        &self,
        req: &InstallRequest,
        payload: Option<StagedPayload>,
        next: &mut Service,
        g: u64,
        created: &mut Vec<PathBuf>,
    ) -> Result<Vec<(ArtifactName, PathBuf)>> {
        let service = &req.service;
        let bin_dir = self.daemon.paths.service_bin_dir(service);
        let env_dir = self.daemon.paths.service_env_dir(service);
        let run_dir = self.daemon.paths.service_run_dir(service);
        let data_dir = self.daemon.paths.service_data_dir(service);

        let mut arts: Vec<(ArtifactName, PathBuf)> = Vec::new();
        let mut exec_kind: Option<ExecKind> = None;
        let env_only = matches!(
            payload,
            Some(StagedPayload {
                kind: StagedKind::Env,
                ..
            })
        );

        match payload {
            Some(StagedPayload {
                kind: StagedKind::Env,
                tmp,
            }) => {
                let dst = env_dir.join(format!("env-{g}"));
                persist_temp(tmp, &dst)?;
                created.push(dst.clone());
                arts.push((ArtifactName::EnvFile, dst));
            }
            Some(StagedPayload {
                kind: StagedKind::Exec(kind),
                tmp,
            }) => {
                let name = match kind {
                    ExecKind::Binary => ArtifactName::Binary,
                    ExecKind::Script | ExecKind::TypeScript => ArtifactName::Script,
                };
                let dst = bin_dir.join(format!("{service}-{g}"));
                persist_temp(tmp, &dst)?;
                set_executable(&dst)?;
                created.push(dst.clone());
                arts.push((name, dst));
                exec_kind = Some(kind);
                next.service_type = Some(ServiceType::Systemd);
            }
            Some(StagedPayload {
                kind: StagedKind::Compose,
                tmp,
            }) => {
                let dst = run_dir.join(format!("compose-{g}.yml"));
                persist_temp(tmp, &dst)?;
                created.push(dst.clone());
                arts.push((ArtifactName::ComposeFile, dst));
                next.service_type = Some(ServiceType::DockerCompose);
            }
            None => {}
        }

        // Carry forward artifacts this generation did not replace. Rendered
        // artifacts are always re-rendered below.
        for name in [
            ArtifactName::Binary,
            ArtifactName::Script,
            ArtifactName::EnvFile,
            ArtifactName::ComposeFile,
        ] {
            if arts.iter().any(|(n, _)| *n == name) {
                continue;
            }
            if let Some(path) = next.artifacts.latest(name) {
                arts.push((name, path));
            }
        }

        let Some(service_type) = next.service_type else {
            if env_only {
                // An env file may arrive before the service's first payload;
                // there is nothing to render yet.
                return Ok(arts);
            }
            bail!("no service configured: {service}");
        };

        let has_env = arts.iter().any(|(n, _)| *n == ArtifactName::EnvFile);
        let runtime_env = env_dir.join(format!("{service}.env"));

        // Namespace side unit comes first so the main unit can order on it.
        if let Some(spec) = next.network.clone().filter(|n| !n.is_none()) {
            let content = render::render_netns_unit(service, &spec, &run_dir);
            let path = self.write_rendered(
                next,
                ArtifactName::NetnsUnitFile,
                run_dir.join(format!("netns-{g}.service")),
                content.as_bytes(),
                created,
            )?;
            arts.push((ArtifactName::NetnsUnitFile, path));
        }

        match service_type {
            ServiceType::Systemd => {
                let (exec_art, exec_path) = arts
                    .iter()
                    .find(|(n, _)| matches!(n, ArtifactName::Binary | ArtifactName::Script))
                    .cloned()
                    .ok_or_else(|| anyhow::anyhow!("no executable artifact for {service}"))?;
                let kind = match exec_kind {
                    Some(k) => k,
                    None => sniff_exec_kind(exec_art, &exec_path)?,
                };
                let view = UnitView {
                    service: next,
                    exec_kind: kind,
                    exec_path: &exec_path,
                    env_path: has_env.then_some(runtime_env.as_path()),
                    data_dir: &data_dir,
                    run_dir: &run_dir,
                };
                let unit = render::render_unit(&view);
                let path = self.write_rendered(
                    next,
                    ArtifactName::UnitFile,
                    run_dir.join(format!("unit-{g}.service")),
                    unit.as_bytes(),
                    created,
                )?;
                arts.push((ArtifactName::UnitFile, path));

                if let Some(timer) = &next.timer {
                    let content = render::render_timer(service, timer);
                    let path = self.write_rendered(
                        next,
                        ArtifactName::TimerUnitFile,
                        run_dir.join(format!("timer-{g}.timer")),
                        content.as_bytes(),
                        created,
                    )?;
                    arts.push((ArtifactName::TimerUnitFile, path));
                }
            }
            ServiceType::DockerCompose => {
                let compose = arts
                    .iter()
                    .find(|(n, _)| *n == ArtifactName::ComposeFile)
                    .map(|(_, p)| p.clone())
                    .ok_or_else(|| anyhow::anyhow!("no compose artifact for {service}"))?;
                let mut compose_files = vec![compose];

                if next.network.as_ref().is_some_and(|n| !n.is_none()) {
                    let content = render::render_compose_network(service);
                    let path = self.write_rendered(
                        next,
                        ArtifactName::ComposeNetworkFile,
                        run_dir.join(format!("compose-net-{g}.yml")),
                        content.as_bytes(),
                        created,
                    )?;
                    compose_files.push(path.clone());
                    arts.push((ArtifactName::ComposeNetworkFile, path));
                }

                let refs: Vec<&Path> = compose_files.iter().map(PathBuf::as_path).collect();
                let unit = render::render_compose_unit(next, &refs, &data_dir);
                let path = self.write_rendered(
                    next,
                    ArtifactName::UnitFile,
                    run_dir.join(format!("unit-{g}.service")),
                    unit.as_bytes(),
                    created,
                )?;
                arts.push((ArtifactName::UnitFile, path));
            }
        }

        Ok(arts)
    }

    /// Write a rendered artifact, reusing the previous generation's file
    /// when the content digest is unchanged.
    fn write_rendered(
        &self,
        svc: &Service,
        name: ArtifactName,
        dst: PathBuf,
        content: &[u8],
        created: &mut Vec<PathBuf>,
    ) -> Result<PathBuf> {
        if let Some(prev) = svc.artifacts.latest(name) {
            if let Ok(existing) = std::fs::read(&prev) {
                if render::digest(&existing) == render::digest(content) {
                    debug!("{name} unchanged, reusing {}", prev.display());
                    return Ok(prev);
                }
            }
        }
        std::fs::write(&dst, content).with_context(|| format!("writing {}", dst.display()))?;
        created.push(dst.clone());
        Ok(dst)
    }

    /// Promote generation `g`: bump the generation counters, move the run
    /// refs, reconcile the supervisor, publish, and evict old generations.
    /// Failure restores the service entry to `backup` and deletes `created`.
    async fn promote(
        &self,
        req: &InstallRequest,
        g: u64,
        created: Vec<PathBuf>,
        backup: Option<Service>,
    ) -> Result<Service> {
        let service = &req.service;
        let first_commit = self
            .daemon
            .store
            .get()
            .services
            .get(service)
            .map(|s| s.generation == 0)
            .unwrap_or(true);

        let promoted = self.daemon.store.mutate_service(service, |_, svc| {
            if !svc.artifacts.gen_exists(g) {
                return Err(crate::store::StoreError::Invalid(format!(
                    "generation {g} has no artifacts"
                )));
            }
            svc.latest_generation = svc.latest_generation.max(g);
            svc.generation = g;
            let names: Vec<ArtifactName> = svc.artifacts.0.keys().cloned().collect();
            for name in names {
                if let Some(path) = svc.artifacts.gen(name, g) {
                    svc.artifacts.set_ref(name, REF_RUN, path);
                }
                svc.artifacts.remove_ref(name, REF_STAGED);
            }
            Ok(())
        })?;

        self.sync_runtime_env(service)?;

        if req.restart {
            // A supervisor reload can fail transiently; retry once before
            // rolling the promotion back.
            let mut reconciled = self.reconcile(service).await;
            if reconciled.is_err() {
                tokio::time::sleep(std::time::Duration::from_millis(500)).await;
                reconciled = self.reconcile(service).await;
            }
            if let Err(err) = reconciled {
                warn!("reconcile failed for {service}, rolling back: {err:#}");
                self.rollback_promotion(service, backup);
                remove_files(&created);
                return Err(err);
            }
        }

        let event_type = if first_commit {
            EventType::ServiceCreated
        } else {
            EventType::ServiceConfigChanged
        };
        self.daemon
            .events
            .publish(Event::new(event_type, service));

        if let Some(NetworkSpec::Tailscale(_)) = promoted.network {
            let _ = crate::netns::persist_stable_id(
                &self.daemon.store,
                service,
                &self.daemon.paths.service_run_dir(service),
            )
            .await;
        }

        self.retain(service)?;
        info!("{service} now at generation {g}");
        self.daemon.store.service(service).map_err(Into::into)
    }

    async fn reconcile(&self, service: &str) -> Result<()> {
        let runner = self.daemon.runner_for(service, self.factory.clone())?;
        runner.reconcile().await
    }

    /// Restore the pre-promotion service entry.
    fn rollback_promotion(&self, service: &str, backup: Option<Service>) {
        let result = self.daemon.store.mutate(|data| {
            match &backup {
                Some(svc) => {
                    data.services.insert(service.to_string(), svc.clone());
                }
                None => {
                    data.services.remove(service);
                }
            }
            Ok(())
        });
        if let Err(err) = result {
            warn!("rolling back store for {service}: {err}");
        }
    }

    /// Copy the selected generation's env artifact to the runtime location
    /// referenced by the unit; remove it when the generation has none.
    fn sync_runtime_env(&self, service: &str) -> Result<()> {
        let svc = self.daemon.store.service(service)?;
        let runtime = self
            .daemon
            .paths
            .service_env_dir(service)
            .join(format!("{service}.env"));
        match svc.artifacts.gen(ArtifactName::EnvFile, svc.generation) {
            Some(src) => {
                std::fs::copy(&src, &runtime)
                    .with_context(|| format!("copying env file to {}", runtime.display()))?;
            }
            None => match std::fs::remove_file(&runtime) {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => return Err(err).context("removing stale runtime env"),
            },
        }
        Ok(())
    }

    /// Evict generations outside the retention window and delete their
    /// files.
    fn retain(&self, service: &str) -> Result<()> {
        let mut evicted = Vec::new();
        self.daemon.store.mutate_service(service, |_, svc| {
            evicted = svc
                .artifacts
                .retain_last(svc.latest_generation, MAX_GENERATIONS);
            Ok(())
        })?;
        remove_files(&evicted);
        Ok(())
    }
}

enum StagedKind {
    Exec(ExecKind),
    Compose,
    Env,
}

struct StagedPayload {
    kind: StagedKind,
    tmp: tempfile::NamedTempFile,
}

/// Preserve the mesh node id across respecifications of the same mode.
fn merge_stable_id(mut next: NetworkSpec, prev: Option<&NetworkSpec>) -> NetworkSpec {
    if let (NetworkSpec::Tailscale(ts), Some(NetworkSpec::Tailscale(old))) = (&mut next, prev) {
        if ts.stable_id.is_none() {
            ts.stable_id = old.stable_id.clone();
        }
    }
    next
}

fn persist_temp(tmp: tempfile::NamedTempFile, dst: &Path) -> Result<()> {
    tmp.persist(dst)
        .map(|_| ())
        .map_err(|e| anyhow::Error::from(e.error))
        .with_context(|| format!("persisting {}", dst.display()))
}

fn set_executable(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755))
        .with_context(|| format!("chmod {}", path.display()))
}

fn sniff_exec_kind(name: ArtifactName, path: &Path) -> Result<ExecKind> {
    if name == ArtifactName::Binary {
        return Ok(ExecKind::Binary);
    }
    let head = read_head(path, 2)?;
    if head.starts_with(b"#!") {
        Ok(ExecKind::Script)
    } else {
        Ok(ExecKind::TypeScript)
    }
}

fn read_head(path: &Path, limit: usize) -> Result<Vec<u8>> {
    use std::io::Read;
    let file = std::fs::File::open(path)
        .with_context(|| format!("opening {}", path.display()))?;
    let mut buf = Vec::new();
    file.take(limit as u64)
        .read_to_end(&mut buf)
        .with_context(|| format!("reading {}", path.display()))?;
    Ok(buf)
}

fn remove_files(paths: &[PathBuf]) {
    for path in paths {
        match std::fs::remove_file(path) {
            Ok(()) => debug!("removed {}", path.display()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => warn!("removing {}: {err}", path.display()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::authz::StaticAuthorizer;
    use crate::runner::quiet_commands;
    use crate::settings::Settings;
    use crate::store::Store;
    use tempfile::TempDir;

    fn daemon(dir: &TempDir) -> Arc<Daemon> {
        let settings = Settings {
            data_dir: dir.path().to_path_buf(),
            ..Settings::default()
        };
        let store = Store::open(settings.paths().db_file()).unwrap();
        Daemon::new(settings, store, Arc::new(StaticAuthorizer::allow_all()))
    }

    fn script() -> Vec<u8> {
        b"#!/bin/sh\nexec sleep infinity\n".to_vec()
    }

    /// Stage-only installs must not touch the supervisor, so they are safe
    /// to run in tests.
    fn stage_req(service: &str) -> InstallRequest {
        InstallRequest {
            stage_only: true,
            ..InstallRequest::new(service)
        }
    }

    #[tokio::test]
    async fn stage_only_files_generation_without_promoting() {
        let dir = TempDir::new().unwrap();
        let daemon = daemon(&dir);
        let installer = Installer::new(daemon.clone(), quiet_commands());
        let (_h, mut rx) = daemon.events.add_listener(|_| true);

        let payload = script();
        let svc = installer
            .install_stream(&stage_req("web"), &mut payload.as_slice(), None)
            .await
            .unwrap();

        assert_eq!(svc.generation, 0);
        assert_eq!(svc.latest_generation, 1);
        assert_eq!(svc.service_type, Some(ServiceType::Systemd));
        let staged = svc.artifacts.staged(ArtifactName::Script).unwrap();
        assert_eq!(std::fs::read(&staged).unwrap(), script());
        let unit = svc.artifacts.staged(ArtifactName::UnitFile).unwrap();
        let text = std::fs::read_to_string(unit).unwrap();
        assert!(text.contains(&format!("ExecStart={}", staged.display())));

        // First contact announces creation; a second staging is a config
        // event.
        let event = rx.recv().await.unwrap();
        assert_eq!(event.event_type, EventType::ServiceCreated);
        let payload = script();
        installer
            .install_stream(&stage_req("web"), &mut payload.as_slice(), None)
            .await
            .unwrap();
        let event = rx.recv().await.unwrap();
        assert_eq!(event.event_type, EventType::ServiceConfigStaged);
    }

    #[tokio::test]
    async fn staged_generation_commits_without_a_new_payload() {
        let dir = TempDir::new().unwrap();
        let daemon = daemon(&dir);
        let installer = Installer::new(daemon.clone(), quiet_commands());

        let payload = script();
        installer
            .install_stream(&stage_req("web"), &mut payload.as_slice(), None)
            .await
            .unwrap();
        let mut req = InstallRequest::new("web");
        req.restart = false;
        let svc = installer.commit_staged(&req).await.unwrap();
        assert_eq!(svc.generation, 1);
        assert_eq!(svc.latest_generation, 1);
        // Staged refs are consumed by the promotion.
        assert!(svc.artifacts.staged(ArtifactName::Script).is_none());
        assert!(svc.artifacts.get(ArtifactName::Script).unwrap().refs[REF_RUN]
            .exists());

        // Committing again with nothing staged is an error.
        assert!(installer.commit_staged(&req).await.is_err());
    }

    #[tokio::test]
    async fn promotion_without_restart_bumps_generation() {
        let dir = TempDir::new().unwrap();
        let daemon = daemon(&dir);
        let installer = Installer::new(daemon.clone(), quiet_commands());
        let (_h, mut rx) = daemon.events.add_listener(|e| {
            e.event_type == EventType::ServiceCreated
                || e.event_type == EventType::ServiceConfigChanged
        });

        let mut req = InstallRequest::new("web");
        req.restart = false; // skip supervisor reconciliation under test
        let payload = script();
        let svc = installer
            .install_stream(&req, &mut payload.as_slice(), None)
            .await
            .unwrap();
        assert_eq!(svc.generation, 1);
        assert_eq!(svc.latest_generation, 1);
        assert!(svc.artifacts.get(ArtifactName::Script).unwrap().refs[REF_RUN]
            .to_string_lossy()
            .contains("web-1"));
        assert_eq!(rx.recv().await.unwrap().event_type, EventType::ServiceCreated);

        let svc = installer
            .install_stream(&req, &mut payload.as_slice(), None)
            .await
            .unwrap();
        assert_eq!(svc.generation, 2);
        assert_eq!(
            rx.recv().await.unwrap().event_type,
            EventType::ServiceConfigChanged
        );
    }

    #[tokio::test]
    async fn unknown_payload_leaves_store_and_staging_clean() {
        let dir = TempDir::new().unwrap();
        let daemon = daemon(&dir);
        let installer = Installer::new(daemon.clone(), quiet_commands());
        let before = daemon.store.get();

        let payload = vec![0xde, 0xad, 0xbe, 0xef, 0x01, 0x02];
        let err = installer
            .install_stream(&stage_req("web"), &mut payload.as_slice(), None)
            .await;
        assert!(err.is_err());
        assert_eq!(daemon.store.get(), before);
        // Only the (empty) skeleton remains: no staged files anywhere.
        let stray: Vec<_> = walk(dir.path())
            .into_iter()
            .filter(|p| p.is_file() && p.file_name().unwrap() != "db.json")
            .collect();
        assert!(stray.is_empty(), "staged leftovers: {stray:?}");
    }

    #[tokio::test]
    async fn zstd_payload_is_decompressed_before_classification() {
        let dir = TempDir::new().unwrap();
        let daemon = daemon(&dir);
        let installer = Installer::new(daemon.clone(), quiet_commands());

        let compressed = zstd::encode_all(script().as_slice(), 0).unwrap();
        let svc = installer
            .install_stream(&stage_req("web"), &mut compressed.as_slice(), None)
            .await
            .unwrap();
        let staged = svc.artifacts.staged(ArtifactName::Script).unwrap();
        assert_eq!(std::fs::read(staged).unwrap(), script());
    }

    #[tokio::test]
    async fn env_install_carries_exec_artifact_forward() {
        let dir = TempDir::new().unwrap();
        let daemon = daemon(&dir);
        let installer = Installer::new(daemon.clone(), quiet_commands());

        let payload = script();
        let mut req = InstallRequest::new("web");
        req.restart = false;
        installer
            .install_stream(&req, &mut payload.as_slice(), None)
            .await
            .unwrap();

        let mut env_req = InstallRequest::new("web");
        env_req.restart = false;
        env_req.env_file = true;
        let env = b"FOO=1\n".to_vec();
        let svc = installer
            .install_stream(&env_req, &mut env.as_slice(), None)
            .await
            .unwrap();

        assert_eq!(svc.generation, 2);
        // The script is shared between generations 1 and 2.
        assert_eq!(
            svc.artifacts.gen(ArtifactName::Script, 1),
            svc.artifacts.gen(ArtifactName::Script, 2)
        );
        let env_path = svc.artifacts.gen(ArtifactName::EnvFile, 2).unwrap();
        assert_eq!(std::fs::read(env_path).unwrap(), env);
        // Runtime env location was synced for the unit to read.
        let runtime = dir.path().join("services/web/env/web.env");
        assert_eq!(std::fs::read(runtime).unwrap(), env);
    }

    #[tokio::test]
    async fn rate_meter_counts_received_bytes() {
        let dir = TempDir::new().unwrap();
        let daemon = daemon(&dir);
        let installer = Installer::new(daemon.clone(), quiet_commands());
        let meter = RateMeter::new();

        let payload = script();
        installer
            .install_stream(&stage_req("web"), &mut payload.as_slice(), Some(meter.clone()))
            .await
            .unwrap();
        assert_eq!(meter.received(), script().len() as u64);
    }

    #[test]
    fn human_bytes_formatting() {
        assert_eq!(human_bytes(512.0), "512.00 B");
        assert_eq!(human_bytes(2048.0), "2.00 KB");
        assert_eq!(human_bytes(3.5 * 1024.0 * 1024.0), "3.50 MB");
    }

    fn walk(root: &Path) -> Vec<PathBuf> {
        let mut out = Vec::new();
        let mut stack = vec![root.to_path_buf()];
        while let Some(dir) = stack.pop() {
            let Ok(entries) = std::fs::read_dir(&dir) else {
                continue;
            };
            for entry in entries.flatten() {
                let path = entry.path();
                if path.is_dir() {
                    stack.push(path.clone());
                }
                out.push(path);
            }
        }
        out
    }
}
