//! Process-supervisor backend.
//!
//! Rendered unit files are copied into the supervisor's configuration
//! directory, the supervisor reloads, and lifecycle commands are plain
//! `systemctl` invocations. Log streaming tails the journal filtered by
//! unit name.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;

use anyhow::{bail, Context, Result};
use log::{debug, warn};

use super::{CommandFactory, ComponentStatus, LogOptions, NotInstalled};
use crate::render;
use crate::store::{ArtifactName, Service};

const DEFAULT_UNIT_DIR: &str = "/etc/systemd/system";

/// Runner for a single process-unit service.
pub struct SystemdRunner {
    service: String,
    /// (unit file name, rendered artifact path) for the selected generation.
    units: Vec<(String, PathBuf)>,
    /// Timer-driven services are enabled through their timer unit.
    has_timer: bool,
    unit_dir: PathBuf,
    factory: CommandFactory,
}

impl SystemdRunner {
    /// Build a runner for the service's currently selected generation.
    pub fn new(service: &Service, factory: CommandFactory) -> Result<SystemdRunner> {
        let generation = service.generation;
        let mut units = Vec::new();
        if let Some(path) = service.artifacts.gen(ArtifactName::NetnsUnitFile, generation) {
            units.push((render::netns_unit_name(&service.name), path));
        }
        let Some(unit) = service.artifacts.gen(ArtifactName::UnitFile, generation) else {
            bail!("no unit file for generation {generation}");
        };
        units.push((render::unit_name(&service.name), unit));
        let has_timer =
            if let Some(path) = service.artifacts.gen(ArtifactName::TimerUnitFile, generation) {
                units.push((render::timer_name(&service.name), path));
                true
            } else {
                false
            };
        Ok(SystemdRunner {
            service: service.name.clone(),
            units,
            has_timer,
            unit_dir: PathBuf::from(DEFAULT_UNIT_DIR),
            factory,
        })
    }

    #[cfg(test)]
    pub fn with_unit_dir(mut self, dir: impl Into<PathBuf>) -> SystemdRunner {
        self.unit_dir = dir.into();
        self
    }

    /// Unit the lifecycle commands address: the timer when one exists,
    /// otherwise the service unit.
    fn target_unit(&self) -> String {
        if self.has_timer {
            render::timer_name(&self.service)
        } else {
            render::unit_name(&self.service)
        }
    }

    fn service_unit(&self) -> String {
        render::unit_name(&self.service)
    }

    async fn systemctl(&self, args: &[&str]) -> Result<()> {
        let args: Vec<String> = args.iter().map(|s| s.to_string()).collect();
        let status = (self.factory)("systemctl", &args)
            .status()
            .await
            .context("running systemctl")?;
        if !status.success() {
            // Exit code 4 is systemd's "no such unit".
            if status.code() == Some(4) {
                return Err(NotInstalled.into());
            }
            bail!("systemctl {} exited with {status}", args.join(" "));
        }
        Ok(())
    }

    /// Write unit files into place, reload the supervisor, enable and start.
    pub async fn install(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.unit_dir)
            .await
            .context("creating unit directory")?;
        for (name, src) in &self.units {
            let dst = self.unit_dir.join(name);
            tokio::fs::copy(src, &dst)
                .await
                .with_context(|| format!("installing {name}"))?;
            debug!("installed unit {}", dst.display());
        }
        self.systemctl(&["daemon-reload"]).await?;
        // Restart catches the case where the unit was already enabled and
        // running an older generation.
        self.systemctl(&["enable", "--now", &self.target_unit()])
            .await?;
        if !self.has_timer {
            self.systemctl(&["restart", &self.service_unit()]).await?;
        }
        Ok(())
    }

    pub async fn start(&self) -> Result<()> {
        self.systemctl(&["start", &self.target_unit()]).await
    }

    pub async fn stop(&self) -> Result<()> {
        if self.has_timer {
            self.systemctl(&["stop", &self.target_unit()]).await?;
        }
        self.systemctl(&["stop", &self.service_unit()]).await
    }

    pub async fn restart(&self) -> Result<()> {
        self.systemctl(&["restart", &self.service_unit()]).await
    }

    pub async fn enable(&self) -> Result<()> {
        self.systemctl(&["enable", "--now", &self.target_unit()])
            .await
    }

    pub async fn disable(&self) -> Result<()> {
        self.systemctl(&["stop", &self.service_unit()]).await?;
        self.systemctl(&["disable", &self.target_unit()]).await
    }

    /// Stop, disable, and delete the installed unit files. "Unit not known"
    /// is tolerated so a half-installed service can be purged.
    pub async fn remove(&self) -> Result<()> {
        let mut not_installed = false;
        for op in [&["stop"][..], &["disable"][..]] {
            let mut args = op.to_vec();
            let unit = self.target_unit();
            args.push(&unit);
            if let Err(err) = self.systemctl(&args).await {
                if err.is::<NotInstalled>() {
                    not_installed = true;
                } else {
                    warn!("systemctl {:?} for {}: {err:#}", op, self.service);
                }
            }
        }
        let mut removed_any = false;
        for (name, _) in &self.units {
            let path = self.unit_dir.join(name);
            match tokio::fs::remove_file(&path).await {
                Ok(()) => removed_any = true,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => return Err(err).with_context(|| format!("removing {name}")),
            }
        }
        if removed_any {
            self.systemctl(&["daemon-reload"]).await?;
        } else if not_installed {
            return Err(NotInstalled.into());
        }
        Ok(())
    }

    /// Tail the journal for this unit through the caller's stdio.
    pub async fn logs(&self, opts: LogOptions) -> Result<()> {
        let mut args = vec!["--no-pager".to_string(), "--output=cat".to_string()];
        if opts.follow {
            args.push("--follow".to_string());
        }
        if opts.lines >= 0 {
            args.push(format!("--lines={}", opts.lines));
        }
        args.push(format!("--unit={}", self.service_unit()));
        let status = (self.factory)("journalctl", &args)
            .status()
            .await
            .context("running journalctl")?;
        if !status.success() {
            bail!("journalctl exited with {status}");
        }
        Ok(())
    }

    /// Single-component status map keyed by the service name.
    pub async fn statuses(&self) -> Result<BTreeMap<String, ComponentStatus>> {
        let mut cmd = (self.factory)(
            "systemctl",
            &[
                "show".to_string(),
                self.service_unit(),
                "--property=LoadState,ActiveState".to_string(),
            ],
        );
        cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
        let output = cmd.output().await.context("running systemctl show")?;
        let text = String::from_utf8_lossy(&output.stdout);
        let status = parse_show_output(&text);
        Ok(BTreeMap::from([(self.service.clone(), status)]))
    }
}

/// Map `systemctl show` property output onto a component status.
fn parse_show_output(text: &str) -> ComponentStatus {
    let mut load_state = "";
    let mut active_state = "";
    for line in text.lines() {
        if let Some(v) = line.strip_prefix("LoadState=") {
            load_state = v.trim();
        } else if let Some(v) = line.strip_prefix("ActiveState=") {
            active_state = v.trim();
        }
    }
    if load_state == "not-found" || load_state.is_empty() {
        return ComponentStatus::Unknown;
    }
    match active_state {
        "active" => ComponentStatus::Running,
        "activating" | "reloading" => ComponentStatus::Starting,
        "deactivating" => ComponentStatus::Stopping,
        "inactive" | "failed" => ComponentStatus::Stopped,
        _ => ComponentStatus::Unknown,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn show_output_maps_to_statuses() {
        assert_eq!(
            parse_show_output("LoadState=loaded\nActiveState=active\n"),
            ComponentStatus::Running
        );
        assert_eq!(
            parse_show_output("LoadState=loaded\nActiveState=activating\n"),
            ComponentStatus::Starting
        );
        assert_eq!(
            parse_show_output("LoadState=loaded\nActiveState=deactivating\n"),
            ComponentStatus::Stopping
        );
        assert_eq!(
            parse_show_output("LoadState=loaded\nActiveState=failed\n"),
            ComponentStatus::Stopped
        );
        assert_eq!(
            parse_show_output("LoadState=not-found\nActiveState=inactive\n"),
            ComponentStatus::Unknown
        );
        assert_eq!(parse_show_output(""), ComponentStatus::Unknown);
    }

    #[test]
    fn runner_requires_a_unit_file() {
        let svc = Service {
            name: "web".to_string(),
            generation: 1,
            ..Service::default()
        };
        assert!(SystemdRunner::new(&svc, super::super::quiet_commands()).is_err());
    }

    #[test]
    fn timer_services_target_the_timer_unit() {
        let mut svc = Service {
            name: "backup".to_string(),
            generation: 2,
            ..Service::default()
        };
        svc.artifacts.set_ref(
            ArtifactName::UnitFile,
            "2",
            PathBuf::from("/srv/backup/run/unit-2"),
        );
        svc.artifacts.set_ref(
            ArtifactName::TimerUnitFile,
            "2",
            PathBuf::from("/srv/backup/run/timer-2"),
        );
        let runner = SystemdRunner::new(&svc, super::super::quiet_commands()).unwrap();
        assert_eq!(runner.target_unit(), "yeet-backup.timer");
        assert_eq!(runner.service_unit(), "yeet-backup.service");
    }
}
