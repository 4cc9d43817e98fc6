//! Container-compose backend.
//!
//! Lifecycle commands shell out to the engine's compose subcommand with an
//! explicit project name and the compose files of the selected generation.
//! A thin wrapper unit (handled by the systemd runner) ties the project to
//! boot and to the namespace side unit.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;

use anyhow::{bail, Context, Result};
use log::{debug, warn};
use tokio::sync::OnceCell;

use super::{CommandFactory, ComponentStatus, LogOptions, SystemdRunner};
use crate::registry::INTERNAL_REGISTRY_HOST;
use crate::store::{ArtifactName, ImageRepo, Service};

/// Runner for a single container-compose service.
pub struct ComposeRunner {
    service: String,
    project: String,
    data_dir: PathBuf,
    compose_files: Vec<PathBuf>,
    env_file: Option<PathBuf>,
    /// Loopback address of the embedded registry, for retagging.
    registry_addr: String,
    images: BTreeMap<String, ImageRepo>,
    sd: SystemdRunner,
    factory: CommandFactory,
    env_installed: OnceCell<()>,
}

impl ComposeRunner {
    pub fn new(
        service: &Service,
        data_dir: PathBuf,
        registry_addr: String,
        images: BTreeMap<String, ImageRepo>,
        factory: CommandFactory,
    ) -> Result<ComposeRunner> {
        let generation = service.generation;
        let Some(compose) = service.artifacts.gen(ArtifactName::ComposeFile, generation) else {
            bail!("compose file not found for generation {generation}");
        };
        let mut compose_files = vec![compose];
        if let Some(net) = service
            .artifacts
            .gen(ArtifactName::ComposeNetworkFile, generation)
        {
            compose_files.push(net);
        }
        let sd = SystemdRunner::new(service, factory.clone())?;
        Ok(ComposeRunner {
            service: service.name.clone(),
            project: format!("yeet-{}", service.name),
            data_dir,
            compose_files,
            env_file: service.artifacts.gen(ArtifactName::EnvFile, generation),
            registry_addr,
            images,
            sd,
            factory,
            env_installed: OnceCell::new(),
        })
    }

    /// Compose reads project env from `.env` in the project directory; the
    /// generation's env artifact is copied there once per runner.
    async fn ensure_env(&self) -> Result<()> {
        self.env_installed
            .get_or_try_init(|| async {
                let dst = self.data_dir.join(".env");
                match &self.env_file {
                    Some(src) => {
                        tokio::fs::copy(src, &dst)
                            .await
                            .context("copying env file")?;
                    }
                    None => match tokio::fs::remove_file(&dst).await {
                        Ok(()) => {}
                        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                        Err(err) => return Err(err).context("removing stale env file"),
                    },
                }
                Ok::<(), anyhow::Error>(())
            })
            .await?;
        Ok(())
    }

    fn compose_args(&self, args: &[&str]) -> Vec<String> {
        let mut full = vec![
            "compose".to_string(),
            "--project-name".to_string(),
            self.project.clone(),
            "--project-directory".to_string(),
            self.data_dir.display().to_string(),
        ];
        for f in &self.compose_files {
            full.push("--file".to_string());
            full.push(f.display().to_string());
        }
        full.extend(args.iter().map(|s| s.to_string()));
        full
    }

    async fn run_compose(&self, args: &[&str]) -> Result<()> {
        self.ensure_env().await?;
        let args = self.compose_args(args);
        let status = (self.factory)("docker", &args)
            .status()
            .await
            .context("running docker compose")?;
        if !status.success() {
            bail!("docker compose {} exited with {status}", args.join(" "));
        }
        Ok(())
    }

    async fn run_docker(&self, args: &[&str]) -> Result<()> {
        let args: Vec<String> = args.iter().map(|s| s.to_string()).collect();
        let status = (self.factory)("docker", &args)
            .status()
            .await
            .context("running docker")?;
        if !status.success() {
            bail!("docker {} exited with {status}", args.join(" "));
        }
        Ok(())
    }

    /// Image repos of this service that carry the given reference.
    fn matching_repos(&self, reference: &str) -> Vec<String> {
        self.images
            .iter()
            .filter(|(repo, ir)| {
                repo.split_once('/')
                    .is_some_and(|(svc, _)| svc == self.service)
                    && ir.refs.contains_key(reference)
            })
            .map(|(repo, _)| repo.clone())
            .collect()
    }

    /// Images pushed to the loopback registry are retagged to the canonical
    /// host so compose files reference a stable name, then the loopback tag
    /// is dropped. Returns whether any internal image is in play, which
    /// decides the pull policy for `up`.
    async fn retag_internal_images(&self) -> Result<bool> {
        let repos = self.matching_repos("latest");
        if repos.is_empty() {
            return Ok(false);
        }
        for repo in repos {
            let internal = format!("{}/{repo}:latest", self.registry_addr);
            let canonical = format!("{INTERNAL_REGISTRY_HOST}/{repo}:latest");
            self.run_docker(&["pull", &internal]).await?;
            self.run_docker(&["tag", &internal, &canonical]).await?;
            self.run_docker(&["rmi", &internal]).await?;
            debug!("retagged {internal} as {canonical}");
        }
        Ok(true)
    }

    /// Whether the project currently has containers.
    async fn exists(&self) -> Result<bool> {
        Ok(!self.statuses().await?.is_empty())
    }

    /// Tear down the previous project (if any), install the wrapper and
    /// namespace units, and bring the project up against the selected
    /// generation.
    pub async fn install(&self) -> Result<()> {
        self.down().await.context("stopping previous project")?;
        self.sd.install().await?;
        self.up().await
    }

    pub async fn up(&self) -> Result<()> {
        self.sd.start().await.ok();
        let internal = self.retag_internal_images().await?;
        // The canonical host is virtual; never ask the engine to pull it.
        let pull = if internal { "never" } else { "always" };
        self.run_compose(&["up", "--pull", pull, "-d"]).await
    }

    pub async fn down(&self) -> Result<()> {
        if !self.exists().await? {
            return Ok(());
        }
        self.run_compose(&["down", "--remove-orphans"]).await
    }

    pub async fn start(&self) -> Result<()> {
        self.sd.start().await.ok();
        self.run_compose(&["start"]).await
    }

    pub async fn stop(&self) -> Result<()> {
        if !self.exists().await? {
            return Ok(());
        }
        if let Err(err) = self.sd.stop().await {
            warn!("stopping wrapper unit for {}: {err:#}", self.service);
        }
        self.run_compose(&["stop"]).await
    }

    pub async fn restart(&self) -> Result<()> {
        if !self.exists().await? {
            return Ok(());
        }
        self.run_compose(&["restart"]).await
    }

    pub async fn enable(&self) -> Result<()> {
        self.sd.enable().await
    }

    pub async fn disable(&self) -> Result<()> {
        self.sd.disable().await
    }

    pub async fn remove(&self) -> Result<()> {
        self.down().await?;
        self.sd.stop().await.ok();
        self.sd.remove().await
    }

    pub async fn logs(&self, opts: LogOptions) -> Result<()> {
        let tail = opts.lines.to_string();
        let mut args = vec!["logs"];
        if opts.follow {
            args.push("--follow");
        }
        if opts.lines >= 0 {
            args.push("--tail");
            args.push(&tail);
        }
        self.run_compose(&args).await
    }

    /// Component states per container. An empty map means the project has
    /// no containers defined yet.
    pub async fn statuses(&self) -> Result<BTreeMap<String, ComponentStatus>> {
        let args = self.compose_args(&[
            "ps",
            "-a",
            "--format",
            r#"{{.Label "com.docker.compose.service"}},{{.State}}"#,
        ]);
        let mut cmd = (self.factory)("docker", &args);
        cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
        let output = cmd.output().await.context("running docker compose ps")?;
        if !output.status.success() {
            bail!(
                "docker compose ps exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(parse_ps_output(&String::from_utf8_lossy(&output.stdout)))
    }
}

/// Parse `NAME,STATE` lines from compose ps output.
fn parse_ps_output(text: &str) -> BTreeMap<String, ComponentStatus> {
    let mut statuses = BTreeMap::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let Some((name, state)) = line.split_once(',') else {
            warn!("unexpected compose ps line: {line:?}");
            continue;
        };
        let status = match state {
            "running" => ComponentStatus::Running,
            "restarting" => ComponentStatus::Starting,
            "removing" => ComponentStatus::Stopping,
            "exited" | "created" | "dead" => ComponentStatus::Stopped,
            _ => ComponentStatus::Unknown,
        };
        statuses.insert(name.to_string(), status);
    }
    statuses
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ps_output_parses_into_component_map() {
        let text = "web,running\nworker,exited\nodd,paused\n\n";
        let statuses = parse_ps_output(text);
        assert_eq!(statuses.get("web"), Some(&ComponentStatus::Running));
        assert_eq!(statuses.get("worker"), Some(&ComponentStatus::Stopped));
        assert_eq!(statuses.get("odd"), Some(&ComponentStatus::Unknown));
        assert_eq!(statuses.len(), 3);
    }

    #[test]
    fn empty_ps_output_is_an_empty_map() {
        assert!(parse_ps_output("").is_empty());
        assert!(parse_ps_output("  \n").is_empty());
    }

    #[test]
    fn runner_requires_a_compose_file() {
        let svc = Service {
            name: "myapp".to_string(),
            generation: 1,
            ..Service::default()
        };
        let err = ComposeRunner::new(
            &svc,
            PathBuf::from("/srv/myapp/data"),
            "127.0.0.1:5000".to_string(),
            BTreeMap::new(),
            super::super::quiet_commands(),
        );
        assert!(err.is_err());
    }
}
