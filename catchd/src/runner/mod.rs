//! Supervisor runners.
//!
//! Two backends satisfy one contract: systemd units for process services and
//! docker compose for container services. The set is closed, so the runner
//! is a tagged union keyed by the service type rather than a trait object.
//!
//! Runners never capture the session; they receive an injected command
//! factory that ties child process stdio to whatever the caller is (an SSH
//! pty, a WebSocket pipe, or the daemon's own logs).

mod compose;
mod systemd;

pub use compose::ComposeRunner;
pub use systemd::SystemdRunner;

use std::fmt;
use std::process::Stdio;
use std::sync::Arc;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::process::Command;

/// Marker error for operations against a unit the supervisor does not know.
/// `remove` demotes this to a warning so a half-installed service can still
/// be purged.
#[derive(Debug, Error)]
#[error("the service is not installed")]
pub struct NotInstalled;

/// Options for log streaming.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogOptions {
    pub follow: bool,
    /// Number of trailing lines; negative means the backend default.
    pub lines: i64,
}

/// Builds child process commands with caller-appropriate stdio.
pub type CommandFactory = Arc<dyn Fn(&str, &[String]) -> Command + Send + Sync>;

/// Factory for daemon-context invocations: no stdin, output to the void
/// unless the runner captures it.
pub fn quiet_commands() -> CommandFactory {
    Arc::new(|program, args| {
        let mut cmd = Command::new(program);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        cmd
    })
}

/// Observed state of one component (a unit, or one container of a compose
/// project).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentStatus {
    Starting,
    Running,
    Stopping,
    Stopped,
    Unknown,
}

impl fmt::Display for ComponentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ComponentStatus::Starting => "starting",
            ComponentStatus::Running => "running",
            ComponentStatus::Stopping => "stopping",
            ComponentStatus::Stopped => "stopped",
            ComponentStatus::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// Aggregated state of a whole service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceState {
    Starting,
    Running,
    Stopping,
    Stopped,
    /// Container services only: some components running, some not.
    Partial,
    Unknown,
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ServiceState::Starting => "starting",
            ServiceState::Running => "running",
            ServiceState::Stopping => "stopping",
            ServiceState::Stopped => "stopped",
            ServiceState::Partial => "partial",
            ServiceState::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// Fold component states into a service state.
///
/// Stopping wins over starting; a uniform set reports its shared state;
/// anything mixed is partial. An empty set is unknown.
pub fn aggregate(components: &[ComponentStatus]) -> ServiceState {
    if components.is_empty() {
        return ServiceState::Unknown;
    }
    if components.contains(&ComponentStatus::Stopping) {
        return ServiceState::Stopping;
    }
    if components.contains(&ComponentStatus::Starting) {
        return ServiceState::Starting;
    }
    let first = components[0];
    if components.iter().all(|c| *c == first) {
        return match first {
            ComponentStatus::Running => ServiceState::Running,
            ComponentStatus::Stopped => ServiceState::Stopped,
            ComponentStatus::Unknown => ServiceState::Unknown,
            // Handled above.
            ComponentStatus::Starting => ServiceState::Starting,
            ComponentStatus::Stopping => ServiceState::Stopping,
        };
    }
    ServiceState::Partial
}

/// Backend-specific runner for one service.
pub enum Runner {
    Systemd(SystemdRunner),
    Compose(ComposeRunner),
}

impl Runner {
    pub async fn start(&self) -> Result<()> {
        match self {
            Runner::Systemd(r) => r.start().await,
            Runner::Compose(r) => r.start().await,
        }
    }

    pub async fn stop(&self) -> Result<()> {
        match self {
            Runner::Systemd(r) => r.stop().await,
            Runner::Compose(r) => r.stop().await,
        }
    }

    pub async fn restart(&self) -> Result<()> {
        match self {
            Runner::Systemd(r) => r.restart().await,
            Runner::Compose(r) => r.restart().await,
        }
    }

    /// Install the current generation's units and (re)start.
    pub async fn reconcile(&self) -> Result<()> {
        match self {
            Runner::Systemd(r) => r.install().await,
            Runner::Compose(r) => r.install().await,
        }
    }

    pub async fn remove(&self) -> Result<()> {
        match self {
            Runner::Systemd(r) => r.remove().await,
            Runner::Compose(r) => r.remove().await,
        }
    }

    pub async fn enable(&self) -> Result<()> {
        match self {
            Runner::Systemd(r) => r.enable().await,
            Runner::Compose(r) => r.enable().await,
        }
    }

    pub async fn disable(&self) -> Result<()> {
        match self {
            Runner::Systemd(r) => r.disable().await,
            Runner::Compose(r) => r.disable().await,
        }
    }

    pub async fn logs(&self, opts: LogOptions) -> Result<()> {
        match self {
            Runner::Systemd(r) => r.logs(opts).await,
            Runner::Compose(r) => r.logs(opts).await,
        }
    }

    /// Component states keyed by component name. Process services report a
    /// single component named after the service.
    pub async fn statuses(&self) -> Result<std::collections::BTreeMap<String, ComponentStatus>> {
        match self {
            Runner::Systemd(r) => r.statuses().await,
            Runner::Compose(r) => r.statuses().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ComponentStatus::*;

    #[test]
    fn empty_set_is_unknown() {
        assert_eq!(aggregate(&[]), ServiceState::Unknown);
    }

    #[test]
    fn stopping_dominates() {
        assert_eq!(
            aggregate(&[Running, Stopping, Starting]),
            ServiceState::Stopping
        );
    }

    #[test]
    fn starting_dominates_when_nothing_stops() {
        assert_eq!(aggregate(&[Running, Starting]), ServiceState::Starting);
    }

    #[test]
    fn uniform_states_pass_through() {
        assert_eq!(aggregate(&[Running, Running]), ServiceState::Running);
        assert_eq!(aggregate(&[Stopped]), ServiceState::Stopped);
        assert_eq!(aggregate(&[Unknown, Unknown]), ServiceState::Unknown);
    }

    #[test]
    fn mixed_terminal_states_are_partial() {
        assert_eq!(aggregate(&[Running, Stopped]), ServiceState::Partial);
        assert_eq!(aggregate(&[Running, Unknown]), ServiceState::Partial);
    }
}
