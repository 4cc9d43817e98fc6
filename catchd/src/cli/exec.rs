//! Command dispatch.
//!
//! An [`Executor`] runs one parsed command against the daemon on behalf of a
//! session. Output goes to the session stream; child processes (editor,
//! journal tailer, engine CLIs) get their stdio from the injected command
//! factory so they work under a pty. Handlers return errors from a single
//! entry point; the session prints `Error: …` and exits non-zero.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use clap::ArgMatches;
use log::warn;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

use crate::cron::cron_to_calendar;
use crate::daemon::{server_info, Daemon, ServiceStatusData};
use crate::installer::{human_bytes, InstallRequest, Installer, RateMeter};
use crate::netns::{MacvlanSpec, NetworkSpec, TailscaleSpec};
use crate::runner::{CommandFactory, LogOptions, NotInstalled};
use crate::store::{ArtifactName, Service, ServiceType, TimerSpec, Volume, MAX_GENERATIONS};
use crate::{CATCH_SERVICE, SYSTEM_SERVICE};

/// Marker line separating artifacts when several are edited in one buffer.
pub const EDIT_SEPARATOR: &str =
    "=====================================|{}|=====================================";

fn edit_separator_re() -> &'static regex::Regex {
    static RE: once_cell::sync::Lazy<regex::Regex> = once_cell::sync::Lazy::new(|| {
        regex::Regex::new(r"=====================================\|([^|]+)\|=====================================")
            .expect("static regex")
    });
    &RE
}

/// Session-facing byte streams.
pub struct SessionIo {
    pub reader: Box<dyn AsyncRead + Send + Unpin>,
    pub writer: Box<dyn AsyncWrite + Send + Unpin>,
}

/// One command invocation bound to a session.
pub struct Executor {
    pub daemon: Arc<Daemon>,
    pub service: String,
    pub user: String,
    pub io: SessionIo,
    pub factory: CommandFactory,
    pub is_pty: bool,
    pub term: String,
    pub cancel: CancellationToken,
    /// Closes the surrounding session, e.g. on an upload timeout.
    pub closer: Option<Arc<dyn Fn() + Send + Sync>>,
}

impl Executor {
    /// Parse and run a command line. Errors are printed to the session;
    /// the returned code is the session exit status.
    pub async fn run(&mut self, args: Vec<String>) -> i32 {
        let matches = match super::root_command().try_get_matches_from(&args) {
            Ok(m) => m,
            Err(err) => {
                let rendered = err.render().to_string();
                let _ = self.print(&rendered).await;
                return 2;
            }
        };
        match self.dispatch(matches).await {
            Ok(()) => 0,
            Err(err) => {
                let _ = self.print(&format!("Error: {err:#}\n")).await;
                1
            }
        }
    }

    async fn dispatch(&mut self, matches: ArgMatches) -> Result<()> {
        let (name, sub) = matches
            .subcommand()
            .map(|(n, s)| (n.to_string(), s.clone()))
            .ok_or_else(|| anyhow!("missing command"))?;
        match name.as_str() {
            "run" => self.cmd_run(&sub).await,
            "stage" => self.cmd_stage(&sub).await,
            "start" => self.cmd_start().await,
            "stop" => self.cmd_stop().await,
            "restart" => self.cmd_restart().await,
            "rollback" => self.cmd_rollback().await,
            "enable" => self.cmd_enable().await,
            "disable" => self.cmd_disable().await,
            "remove" => self.cmd_remove().await,
            "edit" => self.cmd_edit(&sub).await,
            "env" => self.cmd_env().await,
            "logs" => self.cmd_logs(&sub).await,
            "status" => self.cmd_status(&sub).await,
            "events" => self.cmd_events(&sub).await,
            "cron" => self.cmd_cron(&sub).await,
            "mount" => self.cmd_mount(&sub).await,
            "umount" => self.cmd_umount(&sub).await,
            "ip" => self.cmd_ip().await,
            "ts" => self.cmd_ts(&sub).await,
            "version" => self.cmd_version(&sub).await,
            other => bail!("unhandled command {other:?}"),
        }
    }

    async fn print(&mut self, text: &str) -> Result<()> {
        self.io
            .writer
            .write_all(text.as_bytes())
            .await
            .context("writing to session")?;
        self.io.writer.flush().await.ok();
        Ok(())
    }

    fn installer(&self) -> Installer {
        Installer::new(self.daemon.clone(), self.factory.clone())
    }

    fn guard_reserved(&self, action: &str) -> Result<()> {
        if Daemon::is_reserved(&self.service) {
            bail!("cannot {action}, reserved service name");
        }
        Ok(())
    }

    /// Network flags shared by run/stage/cron.
    fn network_from_flags(m: &ArgMatches) -> Result<Option<NetworkSpec>> {
        match m.get_one::<String>("net").map(String::as_str) {
            None => Ok(None),
            Some("none") => Ok(Some(NetworkSpec::None)),
            Some("ts") => Ok(Some(NetworkSpec::Tailscale(TailscaleSpec {
                version: m.get_one::<String>("ts-ver").cloned().unwrap_or_default(),
                tags: m
                    .get_many::<String>("ts-tags")
                    .map(|v| v.cloned().collect())
                    .unwrap_or_default(),
                exit_node: m.get_one::<String>("ts-exit").cloned().unwrap_or_default(),
                auth_key: m
                    .get_one::<String>("ts-auth-key")
                    .cloned()
                    .unwrap_or_default(),
                stable_id: None,
            }))),
            Some("macvlan") => {
                let parent = m
                    .get_one::<String>("macvlan-parent")
                    .cloned()
                    .ok_or_else(|| anyhow!("--macvlan-parent is required when net=macvlan"))?;
                Ok(Some(NetworkSpec::Macvlan(MacvlanSpec {
                    parent,
                    mac: m
                        .get_one::<String>("macvlan-mac")
                        .cloned()
                        .unwrap_or_default(),
                    vlan: m.get_one::<u16>("macvlan-vlan").copied().unwrap_or(0),
                })))
            }
            Some(other) => bail!("unknown network mode {other:?}"),
        }
    }

    fn install_request(&self, m: &ArgMatches) -> Result<InstallRequest> {
        Ok(InstallRequest {
            service: self.service.clone(),
            user: self.user.clone(),
            args: m
                .get_many::<String>("args")
                .map(|v| v.cloned().collect::<Vec<_>>()),
            network: Self::network_from_flags(m)?,
            timer: None,
            stage_only: false,
            restart: m.get_one::<bool>("restart").copied().unwrap_or(true),
            env_file: false,
        })
    }

    /// Stream the session's stdin through the installer, with the upload
    /// progress line and the 1-second first-byte timeout.
    async fn install_from_stdin(&mut self, req: InstallRequest) -> Result<()> {
        self.print(&format!("Installing service {:?}\n", self.service))
            .await?;

        // Abort early when the client never sends payload bytes.
        let mut first = [0u8; 1];
        let n = match tokio::time::timeout(
            std::time::Duration::from_secs(1),
            self.io.reader.read(&mut first),
        )
        .await
        {
            Ok(read) => read.context("reading payload")?,
            Err(_) => {
                self.print("Error: timeout waiting for bytes in\n").await?;
                if let Some(closer) = &self.closer {
                    closer();
                }
                bail!("timeout waiting for payload");
            }
        };
        if n == 0 {
            bail!("empty payload");
        }

        let meter = RateMeter::new();
        let installer = self.installer();
        let result = {
            let mut reader = std::io::Cursor::new(first.to_vec()).chain(&mut self.io.reader);
            let install = installer.install_stream(&req, &mut reader, Some(meter.clone()));
            tokio::pin!(install);
            let mut progress = tokio::time::interval(std::time::Duration::from_millis(100));
            let mut last_len = 0usize;
            loop {
                tokio::select! {
                    res = &mut install => break res,
                    _ = progress.tick() => {
                        let line = format!(
                            "\rReceived: {}\tRate: {}/s",
                            human_bytes(meter.received() as f64),
                            human_bytes(meter.rate()),
                        );
                        let pad = last_len.saturating_sub(line.len());
                        last_len = line.len();
                        self.io
                            .writer
                            .write_all(format!("{line}{}", " ".repeat(pad)).as_bytes())
                            .await
                            .ok();
                        self.io.writer.flush().await.ok();
                    }
                    _ = self.cancel.cancelled() => {
                        break Err(anyhow!("session closed"));
                    }
                }
            }
        };
        self.print("\n").await.ok();
        result.map(|_| ())
    }

    async fn cmd_run(&mut self, m: &ArgMatches) -> Result<()> {
        self.guard_reserved("run")?;
        let req = self.install_request(m)?;
        self.install_from_stdin(req).await
    }

    async fn cmd_cron(&mut self, m: &ArgMatches) -> Result<()> {
        self.guard_reserved("install a cron")?;
        let all: Vec<String> = m
            .get_many::<String>("args")
            .map(|v| v.cloned().collect())
            .unwrap_or_default();
        // The expression arrives either quoted as one argument or as five
        // bare fields.
        let (expr, rest) = if !all.is_empty() && all[0].split_whitespace().count() == 5 {
            (all[0].clone(), &all[1..])
        } else if all.len() >= 5 {
            (all[..5].join(" "), &all[5..])
        } else {
            bail!("cron needs a 5-field expression");
        };
        let on_calendar = cron_to_calendar(&expr).context("invalid cron expression")?;
        let mut req = InstallRequest::new(&self.service);
        req.user = self.user.clone();
        req.args = Some(rest.to_vec());
        req.timer = Some(TimerSpec {
            on_calendar,
            persistent: true,
        });
        self.install_from_stdin(req).await
    }

    async fn cmd_stage(&mut self, m: &ArgMatches) -> Result<()> {
        if self.service == SYSTEM_SERVICE {
            bail!("cannot stage system service");
        }
        match m.subcommand() {
            Some(("show", show)) => {
                let svc = self.daemon.store.service(&self.service)?;
                if show.get_flag("env") {
                    let path = self.daemon.env_file(&self.service, true)?;
                    let content =
                        std::fs::read_to_string(&path).context("reading env file")?;
                    self.print(&content).await?;
                    self.print("\n").await
                } else {
                    let rendered = serde_json::to_string_pretty(&svc)?;
                    self.print(&rendered).await?;
                    self.print("\n").await
                }
            }
            Some(("clear", _)) => bail!("not implemented"),
            Some(("commit", commit)) => {
                let mut req = InstallRequest::new(&self.service);
                req.user = self.user.clone();
                req.restart = commit.get_one::<bool>("restart").copied().unwrap_or(true);
                self.installer().commit_staged(&req).await?;
                Ok(())
            }
            Some((other, _)) => bail!("invalid argument {other:?}"),
            None => {
                // Bare `stage` with flags: stage a configuration change, no
                // payload.
                let mut req = self.install_request(m)?;
                req.stage_only = true;
                self.daemon.ensure_dirs(&self.service, &self.user)?;
                let svc = self.installer().install_config(&req).await?;
                let rendered = serde_json::to_string_pretty(&svc)?;
                self.print(&rendered).await?;
                self.print("\n").await
            }
        }
    }

    async fn cmd_start(&mut self) -> Result<()> {
        self.guard_reserved("start")?;
        let runner = self.daemon.runner_for(&self.service, self.factory.clone())?;
        runner.start().await.context("failed to start service")
    }

    async fn cmd_stop(&mut self) -> Result<()> {
        self.guard_reserved("stop")?;
        let runner = self.daemon.runner_for(&self.service, self.factory.clone())?;
        runner.stop().await.context("failed to stop service")
    }

    async fn cmd_restart(&mut self) -> Result<()> {
        self.guard_reserved("restart")?;
        self.print(&format!("Restarting service {:?}\n", self.service))
            .await?;
        let runner = self.daemon.runner_for(&self.service, self.factory.clone())?;
        runner.restart().await.context("failed to restart service")?;
        self.print(&format!("Restarted service {:?}\n", self.service))
            .await
    }

    async fn cmd_rollback(&mut self) -> Result<()> {
        self.guard_reserved("rollback")?;
        let svc = self.daemon.store.mutate_service(&self.service, |_, svc| {
            if svc.generation == 0 {
                return Err(crate::store::StoreError::Invalid(
                    "no generation to rollback".to_string(),
                ));
            }
            let gen = svc.generation - 1;
            let min = svc.latest_generation.saturating_sub(MAX_GENERATIONS) + 1;
            if gen < min {
                return Err(crate::store::StoreError::Invalid(format!(
                    "generation {gen} is too old, earliest rollback is {min}"
                )));
            }
            if gen == 0 {
                return Err(crate::store::StoreError::Invalid(format!(
                    "generation {} is the oldest, cannot rollback",
                    svc.generation
                )));
            }
            svc.generation = gen;
            Ok(())
        })?;
        self.print(&format!(
            "Rolled back {:?} to generation {}\n",
            self.service, svc.generation
        ))
        .await?;
        self.installer().install_current(&self.service).await
    }

    async fn cmd_enable(&mut self) -> Result<()> {
        self.guard_reserved("enable")?;
        let runner = self.daemon.runner_for(&self.service, self.factory.clone())?;
        runner.enable().await
    }

    async fn cmd_disable(&mut self) -> Result<()> {
        self.guard_reserved("disable")?;
        let runner = self.daemon.runner_for(&self.service, self.factory.clone())?;
        runner.disable().await
    }

    async fn cmd_remove(&mut self) -> Result<()> {
        self.guard_reserved("remove")?;
        let runner = match self.daemon.runner_for(&self.service, self.factory.clone()) {
            Ok(runner) => Some(runner),
            Err(_) => None,
        };
        if runner.is_none() && self.daemon.store.service(&self.service).is_err() {
            self.print(&format!("service {:?} not found\n", self.service))
                .await?;
            return Ok(());
        }

        if !self
            .confirm(&format!(
                "Are you sure you want to remove service {:?}?",
                self.service
            ))
            .await?
        {
            return Ok(());
        }

        if let Some(runner) = runner {
            match runner.remove().await {
                Ok(()) => {}
                Err(err) if err.is::<NotInstalled>() => {
                    self.print(&format!(
                        "warning: service {:?} was not installed\n",
                        self.service
                    ))
                    .await?;
                }
                Err(err) => return Err(err.context("failed to remove service")),
            }
        }
        self.daemon
            .remove_service(&self.service, self.factory.clone())
            .await
    }

    async fn cmd_edit(&mut self, m: &ArgMatches) -> Result<()> {
        self.guard_reserved("edit")?;
        let restart = m.get_one::<bool>("restart").copied().unwrap_or(true);
        if m.get_flag("env") {
            return self.edit_env(restart).await;
        }
        if m.get_flag("config") {
            return self.edit_config().await;
        }
        let svc = self.daemon.store.service(&self.service)?;
        match svc.service_type {
            Some(ServiceType::DockerCompose) => self.edit_compose(&svc, restart).await,
            Some(ServiceType::Systemd) => self.edit_units(&svc, restart).await,
            None => bail!("no service configured"),
        }
    }

    async fn edit_env(&mut self, restart: bool) -> Result<()> {
        let src = self.daemon.env_file(&self.service, false).ok();
        let tmp = copy_to_tmp(src.as_deref())?;
        self.edit_file(tmp.path()).await?;
        if !changed(src.as_deref(), tmp.path())? {
            return self.print("No changes detected\n").await;
        }
        let mut req = InstallRequest::new(&self.service);
        req.user = self.user.clone();
        req.env_file = true;
        req.restart = restart;
        let content = std::fs::read(tmp.path())?;
        self.installer()
            .install_stream(&req, &mut content.as_slice(), None)
            .await?;
        Ok(())
    }

    async fn edit_config(&mut self) -> Result<()> {
        let svc = self.daemon.store.service(&self.service)?;
        let tmp = tempfile::NamedTempFile::new().context("creating temp file")?;
        std::fs::write(tmp.path(), serde_json::to_vec_pretty(&svc)?)?;
        self.edit_file(tmp.path()).await?;
        let raw = std::fs::read(tmp.path())?;
        let updated: Service =
            serde_json::from_slice(&raw).context("parsing edited service record")?;
        if updated == svc {
            return self.print("No changes detected\n").await;
        }
        self.daemon.store.mutate_service(&self.service, |_, s| {
            *s = updated.clone();
            Ok(())
        })?;
        self.installer().install_current(&self.service).await
    }

    async fn edit_compose(&mut self, svc: &Service, restart: bool) -> Result<()> {
        let src = svc
            .artifacts
            .latest(ArtifactName::ComposeFile)
            .ok_or_else(|| anyhow!("no compose file found"))?;
        let tmp = copy_to_tmp(Some(&src))?;
        self.edit_file(tmp.path()).await?;
        if !changed(Some(&src), tmp.path())? {
            return self.print("No changes detected\n").await;
        }
        let mut req = InstallRequest::new(&self.service);
        req.user = self.user.clone();
        req.restart = restart;
        req.stage_only = !restart;
        let content = std::fs::read(tmp.path())?;
        self.installer()
            .install_stream(&req, &mut content.as_slice(), None)
            .await?;
        Ok(())
    }

    /// Unit and timer files are edited in one buffer, bracketed by marker
    /// lines; the buffer is split back into per-artifact contents.
    async fn edit_units(&mut self, svc: &Service, restart: bool) -> Result<()> {
        let mut sources: Vec<(ArtifactName, PathBuf)> = Vec::new();
        for name in [ArtifactName::UnitFile, ArtifactName::TimerUnitFile] {
            if let Some(path) = svc.artifacts.latest(name) {
                sources.push((name, path));
            }
        }
        if sources.is_empty() {
            bail!("no unit files found");
        }

        let mut buffer = String::new();
        for (i, (name, path)) in sources.iter().enumerate() {
            if i > 0 {
                buffer.push_str("\n\n");
            }
            buffer.push_str(&EDIT_SEPARATOR.replace("{}", name.as_str()));
            buffer.push_str("\n\n");
            buffer.push_str(
                &std::fs::read_to_string(path)
                    .with_context(|| format!("reading {}", path.display()))?,
            );
        }
        let original = buffer.clone();
        let tmp = tempfile::NamedTempFile::new().context("creating temp file")?;
        std::fs::write(tmp.path(), &buffer)?;
        self.edit_file(tmp.path()).await?;
        let edited = std::fs::read_to_string(tmp.path())?;
        if edited == original {
            return self.print("No changes detected\n").await;
        }

        let sections = split_edited_units(&edited)?;
        if sections.len() != sources.len() {
            bail!("mismatched number of unit files and contents");
        }
        let run_dir = self.daemon.paths.service_run_dir(&self.service);
        let mut replace = Vec::new();
        for (header, content) in sections {
            let name = ArtifactName::from_str_opt(&header)
                .ok_or_else(|| anyhow!("no unit file found for {header:?}"))?;
            if !sources.iter().any(|(n, _)| *n == name) {
                bail!("no unit file found for {header:?}");
            }
            let dst = run_dir.join(format!("{}-edit-{}", name, uuid::Uuid::new_v4()));
            std::fs::write(&dst, content.trim())
                .with_context(|| format!("writing {}", dst.display()))?;
            replace.push((name, dst));
        }
        self.installer().stage_artifacts(&self.service, replace).await?;
        if restart {
            let mut req = InstallRequest::new(&self.service);
            req.user = self.user.clone();
            self.installer().commit_staged(&req).await?;
        }
        Ok(())
    }

    async fn edit_file(&mut self, path: &std::path::Path) -> Result<()> {
        if !self.is_pty {
            bail!("edit requires a pty, please run ssh with -t");
        }
        let editor = std::env::var("EDITOR").unwrap_or_else(|_| "vim".to_string());
        let mut cmd = (self.factory)(&editor, &[path.display().to_string()]);
        cmd.env("TERM", &self.term);
        let status = cmd.status().await.context("running editor")?;
        if !status.success() {
            bail!("editor exited with {status}");
        }
        Ok(())
    }

    async fn cmd_env(&mut self) -> Result<()> {
        let path = self.daemon.env_file(&self.service, false)?;
        let content = std::fs::read_to_string(&path).context("reading env file")?;
        self.print(&content).await?;
        self.print("\n").await
    }

    async fn cmd_logs(&mut self, m: &ArgMatches) -> Result<()> {
        if self.service == SYSTEM_SERVICE {
            bail!("cannot show logs for system service");
        }
        let runner = self.daemon.runner_for(&self.service, self.factory.clone())?;
        runner
            .logs(LogOptions {
                follow: m.get_flag("follow"),
                lines: m.get_one::<i64>("lines").copied().unwrap_or(-1),
            })
            .await
    }

    async fn cmd_status(&mut self, m: &ArgMatches) -> Result<()> {
        let statuses: Vec<ServiceStatusData> = if self.service == SYSTEM_SERVICE {
            self.daemon.all_statuses(self.factory.clone()).await
        } else {
            vec![
                self.daemon
                    .service_status(&self.service, self.factory.clone())
                    .await?,
            ]
        };

        match m.get_one::<String>("format").map(String::as_str) {
            Some("json") => {
                let rendered = serde_json::to_string(&statuses)?;
                self.print(&rendered).await?;
                self.print("\n").await
            }
            Some("json-pretty") => {
                let rendered = serde_json::to_string_pretty(&statuses)?;
                self.print(&rendered).await?;
                self.print("\n").await
            }
            _ => {
                let table = render_status_table(&statuses);
                self.print(&table).await
            }
        }
    }

    async fn cmd_events(&mut self, m: &ArgMatches) -> Result<()> {
        let all = m.get_flag("all");
        let service = self.service.clone();
        let (handle, mut rx) = self.daemon.events.add_listener(move |event| {
            all || event.service_name == service
        });
        let result = loop {
            tokio::select! {
                event = rx.recv() => match event {
                    Some(event) => {
                        let line = format!(
                            "Received event: {}\n",
                            serde_json::to_string(&event).unwrap_or_default()
                        );
                        if self.print(&line).await.is_err() {
                            break Ok(());
                        }
                    }
                    None => break Ok(()),
                },
                _ = self.cancel.cancelled() => break Ok(()),
            }
        };
        self.daemon.events.remove_listener(handle);
        result
    }

    async fn cmd_mount(&mut self, m: &ArgMatches) -> Result<()> {
        let Some(source) = m.get_one::<String>("source").cloned() else {
            // Bare `mount` lists the volumes.
            let data = self.daemon.store.get();
            let mut rows = vec![[
                "NAME".to_string(),
                "SRC".to_string(),
                "PATH".to_string(),
                "TYPE".to_string(),
                "OPTS".to_string(),
            ]];
            for v in data.volumes.values() {
                rows.push([
                    v.name.clone(),
                    v.src.clone(),
                    v.path.display().to_string(),
                    v.mount_type.clone(),
                    v.opts.clone(),
                ]);
            }
            let table = render_table(&rows);
            return self.print(&table).await;
        };

        let (_, src_path) = source
            .split_once(':')
            .ok_or_else(|| anyhow!("source {source:?} must be in the format host:path"))?;
        let name = match m.get_one::<String>("name") {
            Some(name) => name.clone(),
            None => std::path::Path::new(src_path)
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .ok_or_else(|| anyhow!("cannot derive mount name from {source:?}"))?,
        };
        if name.contains('/') {
            bail!("target cannot contain a /");
        }
        let mount_type = m.get_one::<String>("type").cloned().unwrap_or_default();
        if !crate::mounts::helper_exists(&mount_type) {
            bail!("mount command \"/sbin/mount.{mount_type}\" not found");
        }
        let opts = m.get_one::<String>("opts").cloned().unwrap_or_default();
        let deps: Vec<String> = m
            .get_many::<String>("deps")
            .map(|v| v.cloned().collect())
            .unwrap_or_default();
        let target = self.daemon.paths.mounts_root().join(&name);

        if self.daemon.store.get().volumes.contains_key(&name) {
            bail!("volume {name:?} already exists; please remove it first");
        }
        let volume = Volume {
            name: name.clone(),
            src: source.clone(),
            path: target.clone(),
            mount_type,
            opts,
            deps: deps.join(" "),
        };
        self.daemon.store.mutate(|data| {
            data.volumes.insert(name.clone(), volume.clone());
            Ok(())
        })?;
        crate::mounts::mount(&volume, &self.factory).await?;
        self.print(&format!("Mounted {} at {}\n", source, target.display()))
            .await
    }

    async fn cmd_umount(&mut self, m: &ArgMatches) -> Result<()> {
        let name = m
            .get_one::<String>("name")
            .cloned()
            .ok_or_else(|| anyhow!("invalid number of arguments"))?;
        let volume = self
            .daemon
            .store
            .get()
            .volumes
            .get(&name)
            .cloned()
            .ok_or_else(|| anyhow!("volume {name:?} not found"))?;
        crate::mounts::umount(&volume, &self.factory)
            .await
            .with_context(|| format!("failed to umount {}", volume.path.display()))?;
        self.daemon.store.mutate(|data| {
            data.volumes.remove(&name);
            Ok(())
        })?;
        Ok(())
    }

    async fn cmd_ip(&mut self) -> Result<()> {
        if self.service == CATCH_SERVICE {
            let output = tokio::process::Command::new("tailscale")
                .arg("ip")
                .output()
                .await
                .context("failed to get IP address")?;
            if !output.status.success() {
                bail!(
                    "tailscale ip: {}",
                    String::from_utf8_lossy(&output.stderr).trim()
                );
            }
            let text = String::from_utf8_lossy(&output.stdout).into_owned();
            return self.print(&text).await;
        }

        let mut args = vec![
            "-o".to_string(),
            "-4".to_string(),
            "addr".to_string(),
            "list".to_string(),
        ];
        if self.service != SYSTEM_SERVICE {
            let svc = self.daemon.store.service(&self.service)?;
            if svc
                .artifacts
                .gen(ArtifactName::NetnsUnitFile, svc.generation)
                .is_some()
            {
                let ns = crate::netns::netns_name(&self.service);
                args = ["netns", "exec", &ns, "ip"]
                    .iter()
                    .map(|s| s.to_string())
                    .chain(args)
                    .collect();
            }
        }
        let output = tokio::process::Command::new("ip")
            .args(&args)
            .output()
            .await
            .context("failed to get IP addresses")?;
        let text = String::from_utf8_lossy(&output.stdout);
        for ip in parse_ipv4_addresses(&text) {
            if ip == "127.0.0.1" {
                continue;
            }
            self.print(&format!("{ip}\n")).await?;
        }
        Ok(())
    }

    async fn cmd_ts(&mut self, m: &ArgMatches) -> Result<()> {
        if Daemon::is_reserved(&self.service) {
            bail!("ts command not supported for sys or catch service");
        }
        let svc = self.daemon.store.service(&self.service)?;
        if !matches!(svc.network, Some(NetworkSpec::Tailscale(_))) {
            bail!("service is not connected to the mesh");
        }
        let sock = self
            .daemon
            .paths
            .service_run_dir(&self.service)
            .join("tailscaled.sock");
        if !sock.exists() {
            bail!("tailscaled socket not found: {}", sock.display());
        }
        let mut args = vec![format!("--socket={}", sock.display())];
        if let Some(extra) = m.get_many::<String>("args") {
            args.extend(extra.cloned());
        }
        let status = (self.factory)("tailscale", &args)
            .status()
            .await
            .context("failed to run tailscale command")?;
        if !status.success() {
            bail!("tailscale exited with {status}");
        }
        Ok(())
    }

    async fn cmd_version(&mut self, m: &ArgMatches) -> Result<()> {
        if m.get_flag("json") {
            let rendered = serde_json::to_string(&server_info())?;
            self.print(&rendered).await?;
            self.print("\n").await
        } else {
            let info = server_info();
            self.print(&format!("{}\n", info.version)).await
        }
    }

    /// Ask a y/N question over the session.
    async fn confirm(&mut self, prompt: &str) -> Result<bool> {
        self.print(&format!("{prompt} [y/N]: ")).await?;
        let mut answer = String::new();
        let mut byte = [0u8; 1];
        loop {
            let n = self.io.reader.read(&mut byte).await?;
            if n == 0 || byte[0] == b'\n' || byte[0] == b'\r' {
                break;
            }
            answer.push(byte[0] as char);
            if answer.len() > 16 {
                break;
            }
        }
        if self.is_pty {
            self.print("\n").await.ok();
        }
        Ok(matches!(answer.trim(), "y" | "Y" | "yes"))
    }
}

/// Split an edited multi-unit buffer back into (artifact name, content)
/// pairs.
fn split_edited_units(buffer: &str) -> Result<Vec<(String, String)>> {
    let re = edit_separator_re();
    let names: Vec<String> = re
        .captures_iter(buffer)
        .map(|c| c[1].to_string())
        .collect();
    if names.is_empty() {
        bail!("no unit files found");
    }
    let mut contents: Vec<String> = re.split(buffer).map(str::to_string).collect();
    // The text before the first marker is empty by construction.
    contents.remove(0);
    if contents.len() != names.len() {
        bail!("mismatched number of unit files and contents");
    }
    Ok(names.into_iter().zip(contents).collect())
}

/// Extract plain IPv4 addresses from `ip -o -4 addr list` output.
fn parse_ipv4_addresses(text: &str) -> Vec<String> {
    static RE: once_cell::sync::Lazy<regex::Regex> = once_cell::sync::Lazy::new(|| {
        regex::Regex::new(r"\b(?:\d{1,3}\.){3}\d{1,3}/\d{1,2}\b").expect("static regex")
    });
    RE.find_iter(text)
        .filter_map(|m| m.as_str().split('/').next().map(str::to_string))
        .collect()
}

/// Left-aligned columns with three spaces of padding.
fn render_table<const N: usize>(rows: &[[String; N]]) -> String {
    let mut widths = [0usize; N];
    for row in rows {
        for (i, cell) in row.iter().enumerate() {
            widths[i] = widths[i].max(cell.len());
        }
    }
    let mut out = String::new();
    for row in rows {
        for (i, cell) in row.iter().enumerate() {
            out.push_str(cell);
            if i + 1 < N {
                out.push_str(&" ".repeat(widths[i] - cell.len() + 3));
            }
        }
        out.push('\n');
    }
    out
}

fn render_status_table(statuses: &[ServiceStatusData]) -> String {
    use crate::daemon::ServiceDataType;
    let mut rows = vec![[
        "SERVICE".to_string(),
        "TYPE".to_string(),
        "CONTAINER".to_string(),
        "STATUS".to_string(),
    ]];
    for status in statuses {
        for component in &status.components {
            let type_label = match status.service_type {
                ServiceDataType::Service => "service",
                ServiceDataType::Cron => "cron",
                ServiceDataType::Docker => "docker",
                ServiceDataType::Unknown => "unknown",
            };
            let container = if status.service_type == ServiceDataType::Docker {
                component.name.clone()
            } else {
                "-".to_string()
            };
            rows.push([
                status.service_name.clone(),
                type_label.to_string(),
                container,
                component.status.to_string(),
            ]);
        }
    }
    render_table(&rows)
}

/// Copy a file to a fresh temp file; an absent source yields an empty one.
fn copy_to_tmp(src: Option<&std::path::Path>) -> Result<tempfile::NamedTempFile> {
    let tmp = tempfile::NamedTempFile::new().context("creating temp file")?;
    if let Some(src) = src {
        std::fs::copy(src, tmp.path())
            .with_context(|| format!("copying {}", src.display()))?;
    }
    Ok(tmp)
}

/// Whether the edited copy differs from the source.
fn changed(src: Option<&std::path::Path>, edited: &std::path::Path) -> Result<bool> {
    let after = std::fs::read(edited)?;
    let before = match src {
        Some(src) => std::fs::read(src).unwrap_or_default(),
        None => Vec::new(),
    };
    if before == after {
        warn!("edit produced identical content");
        return Ok(false);
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::authz::StaticAuthorizer;
    use crate::settings::Settings;
    use crate::store::Store;
    use tempfile::TempDir;

    /// Executor wired to an in-memory session; returns the client-side
    /// stream for inspecting output.
    fn test_executor(dir: &TempDir, service: &str) -> (Executor, tokio::io::DuplexStream) {
        let settings = Settings {
            data_dir: dir.path().to_path_buf(),
            ..Settings::default()
        };
        let store = Store::open(settings.paths().db_file()).unwrap();
        let daemon = Daemon::new(settings, store, Arc::new(StaticAuthorizer::allow_all()));
        let (client, server) = tokio::io::duplex(64 * 1024);
        let (read_half, write_half) = tokio::io::split(server);
        let executor = Executor {
            daemon,
            service: service.to_string(),
            user: String::new(),
            io: SessionIo {
                reader: Box::new(read_half),
                writer: Box::new(write_half),
            },
            factory: crate::runner::quiet_commands(),
            is_pty: false,
            term: "dumb".to_string(),
            cancel: CancellationToken::new(),
            closer: None,
        };
        (executor, client)
    }

    async fn read_output(client: &mut tokio::io::DuplexStream) -> String {
        let mut buf = vec![0u8; 16 * 1024];
        let n = tokio::time::timeout(std::time::Duration::from_secs(1), client.read(&mut buf))
            .await
            .unwrap()
            .unwrap();
        String::from_utf8_lossy(&buf[..n]).into_owned()
    }

    #[tokio::test]
    async fn rollback_refuses_generation_zero() {
        let dir = TempDir::new().unwrap();
        let (mut executor, mut client) = test_executor(&dir, "web");
        executor
            .daemon
            .store
            .mutate_service("web", |_, svc| {
                svc.generation = 0;
                svc.latest_generation = 1;
                Ok(())
            })
            .unwrap();
        let code = executor.run(vec!["rollback".to_string()]).await;
        assert_eq!(code, 1);
        assert!(read_output(&mut client).await.contains("Error:"));
        assert_eq!(executor.daemon.store.service("web").unwrap().generation, 0);
    }

    #[tokio::test]
    async fn rollback_respects_the_retention_window() {
        let dir = TempDir::new().unwrap();
        let (mut executor, mut client) = test_executor(&dir, "web");
        executor
            .daemon
            .store
            .mutate_service("web", |_, svc| {
                svc.generation = 5;
                svc.latest_generation = 15;
                Ok(())
            })
            .unwrap();
        let code = executor.run(vec!["rollback".to_string()]).await;
        assert_eq!(code, 1);
        let output = read_output(&mut client).await;
        assert!(output.contains("too old"), "{output}");
        // The failed rollback must not move the selected generation.
        assert_eq!(executor.daemon.store.service("web").unwrap().generation, 5);
    }

    #[tokio::test]
    async fn reserved_services_refuse_lifecycle_commands() {
        let dir = TempDir::new().unwrap();
        let (mut executor, mut client) = test_executor(&dir, "sys");
        let code = executor.run(vec!["run".to_string()]).await;
        assert_eq!(code, 1);
        assert!(read_output(&mut client).await.contains("reserved service name"));
    }

    #[tokio::test]
    async fn status_json_reports_staged_components() {
        let dir = TempDir::new().unwrap();
        let (mut executor, mut client) = test_executor(&dir, "web");
        // A staged-only script service: one component, stopped.
        let payload = b"#!/bin/sh\nexit 0\n".to_vec();
        let installer = Installer::new(executor.daemon.clone(), crate::runner::quiet_commands());
        let req = InstallRequest {
            stage_only: true,
            ..InstallRequest::new("web")
        };
        installer
            .install_stream(&req, &mut payload.as_slice(), None)
            .await
            .unwrap();

        let code = executor
            .run(vec!["status".to_string(), "--format".to_string(), "json".to_string()])
            .await;
        assert_eq!(code, 0);
        let output = read_output(&mut client).await;
        let statuses: Vec<ServiceStatusData> =
            serde_json::from_str(output.trim()).unwrap();
        assert_eq!(statuses.len(), 1);
        assert_eq!(statuses[0].service_name, "web");
    }

    #[test]
    fn edited_units_split_back_into_sections() {
        let buffer = format!(
            "{}\n\n[Unit]\nA=1\n\n{}\n\n[Timer]\nB=2\n",
            EDIT_SEPARATOR.replace("{}", "unit-file"),
            EDIT_SEPARATOR.replace("{}", "timer-unit-file"),
        );
        let sections = split_edited_units(&buffer).unwrap();
        assert_eq!(sections.len(), 2);
        assert_eq!(sections[0].0, "unit-file");
        assert!(sections[0].1.contains("[Unit]"));
        assert_eq!(sections[1].0, "timer-unit-file");
        assert!(sections[1].1.contains("[Timer]"));
    }

    #[test]
    fn split_rejects_markerless_buffer() {
        assert!(split_edited_units("[Unit]\nA=1\n").is_err());
    }

    #[test]
    fn ipv4_parser_extracts_addresses() {
        let text = "\
1: lo    inet 127.0.0.1/8 scope host lo
2: eth0  inet 192.168.1.10/24 brd 192.168.1.255 scope global eth0
3: ts0   inet 100.64.0.5/32 scope global ts0
";
        assert_eq!(
            parse_ipv4_addresses(text),
            vec!["127.0.0.1", "192.168.1.10", "100.64.0.5"]
        );
    }

    #[test]
    fn table_columns_align() {
        let rows = vec![
            ["NAME".to_string(), "STATUS".to_string()],
            ["web".to_string(), "running".to_string()],
            ["long-name".to_string(), "stopped".to_string()],
        ];
        let table = render_table(&rows);
        let lines: Vec<&str> = table.lines().collect();
        assert!(lines[0].starts_with("NAME"));
        let col = lines[0].find("STATUS").unwrap();
        assert_eq!(lines[1].find("running").unwrap(), col);
        assert_eq!(lines[2].find("stopped").unwrap(), col);
    }
}
