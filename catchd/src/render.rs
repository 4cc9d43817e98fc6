//! Unit rendering.
//!
//! Pure functions from a service view to execution-unit bytes: systemd unit
//! files, timer companions, namespace side units, and compose files. Output
//! is content-addressed so identical renders can be recognized without a
//! byte comparison of the artifacts on disk.

use std::fmt::Write as _;
use std::path::Path;

use sha2::{Digest, Sha256};

use crate::netns::{self, NetworkSpec};
use crate::store::{Service, TimerSpec};

/// How the main process of a unit-backed service is launched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecKind {
    /// Native binary, executed directly.
    Binary,
    /// Interpreted via its shebang.
    Script,
    /// TypeScript entrypoint, executed through bun.
    TypeScript,
}

/// Everything the renderer needs to emit the main unit for one generation.
pub struct UnitView<'a> {
    pub service: &'a Service,
    pub exec_kind: ExecKind,
    /// Path of the generation's binary/script artifact.
    pub exec_path: &'a Path,
    /// Env artifact for this generation, if one is staged.
    pub env_path: Option<&'a Path>,
    pub data_dir: &'a Path,
    pub run_dir: &'a Path,
}

/// systemd unit name of the main unit.
pub fn unit_name(service: &str) -> String {
    format!("yeet-{service}.service")
}

/// systemd unit name of the timer companion.
pub fn timer_name(service: &str) -> String {
    format!("yeet-{service}.timer")
}

/// systemd unit name of the namespace side unit.
pub fn netns_unit_name(service: &str) -> String {
    format!("{}.service", netns::netns_name(service))
}

/// Hex SHA-256 digest used to content-address rendered artifacts.
pub fn digest(content: &[u8]) -> String {
    hex::encode(Sha256::digest(content))
}

/// Render the main unit file for a process-backed service.
pub fn render_unit(view: &UnitView<'_>) -> String {
    let name = &view.service.name;
    let mut out = String::new();
    let _ = writeln!(out, "[Unit]");
    let _ = writeln!(out, "Description=yeet service {name}");
    let _ = writeln!(out, "After=network-online.target");
    let has_ns = view
        .service
        .network
        .as_ref()
        .is_some_and(|n| !n.is_none());
    if has_ns {
        let ns_unit = netns_unit_name(name);
        let _ = writeln!(out, "After={ns_unit}");
        let _ = writeln!(out, "Requires={ns_unit}");
    }
    let _ = writeln!(out);
    let _ = writeln!(out, "[Service]");

    let exec = match view.exec_kind {
        ExecKind::Binary | ExecKind::Script => view.exec_path.display().to_string(),
        ExecKind::TypeScript => format!("/usr/bin/env bun {}", view.exec_path.display()),
    };
    let mut exec_line = exec;
    for arg in &view.service.args {
        let _ = write!(exec_line, " {arg}");
    }
    let _ = writeln!(out, "ExecStart={exec_line}");

    if view.service.timer.is_some() {
        let _ = writeln!(out, "Type=oneshot");
    } else {
        let _ = writeln!(out, "Restart=always");
        let _ = writeln!(out, "RestartSec=2");
    }
    if let Some(env) = view.env_path {
        let _ = writeln!(out, "EnvironmentFile=-{}", env.display());
    }
    let _ = writeln!(out, "WorkingDirectory={}", view.data_dir.display());
    if !view.service.user.is_empty() && view.service.user != "root" {
        let _ = writeln!(out, "User={}", view.service.user);
    }
    if has_ns {
        let _ = writeln!(
            out,
            "NetworkNamespacePath=/run/netns/{}",
            netns::netns_name(name)
        );
    }
    let _ = writeln!(out);
    let _ = writeln!(out, "[Install]");
    let _ = writeln!(out, "WantedBy=multi-user.target");
    out
}

/// Render the timer companion for a cron-style service.
pub fn render_timer(service: &str, timer: &TimerSpec) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "[Unit]");
    let _ = writeln!(out, "Description=yeet timer for {service}");
    let _ = writeln!(out);
    let _ = writeln!(out, "[Timer]");
    let _ = writeln!(out, "OnCalendar={}", timer.on_calendar);
    if timer.persistent {
        let _ = writeln!(out, "Persistent=true");
    }
    let _ = writeln!(out, "Unit={}", unit_name(service));
    let _ = writeln!(out);
    let _ = writeln!(out, "[Install]");
    let _ = writeln!(out, "WantedBy=timers.target");
    out
}

/// Render the wrapper unit that ties a compose project to boot and to the
/// namespace side unit.
pub fn render_compose_unit(service: &Service, compose_files: &[&Path], data_dir: &Path) -> String {
    let name = &service.name;
    let project = format!("yeet-{name}");
    let mut files = String::new();
    for f in compose_files {
        let _ = write!(files, " --file {}", f.display());
    }
    let base = format!(
        "docker compose --project-name {project} --project-directory {}{files}",
        data_dir.display()
    );

    let mut out = String::new();
    let _ = writeln!(out, "[Unit]");
    let _ = writeln!(out, "Description=yeet compose service {name}");
    let _ = writeln!(out, "After=network-online.target docker.service");
    let _ = writeln!(out, "Requires=docker.service");
    let has_ns = service.network.as_ref().is_some_and(|n| !n.is_none());
    if has_ns {
        let ns_unit = netns_unit_name(name);
        let _ = writeln!(out, "After={ns_unit}");
        let _ = writeln!(out, "Requires={ns_unit}");
    }
    let _ = writeln!(out);
    let _ = writeln!(out, "[Service]");
    let _ = writeln!(out, "Type=oneshot");
    let _ = writeln!(out, "RemainAfterExit=yes");
    let _ = writeln!(out, "ExecStart={base} up -d");
    let _ = writeln!(out, "ExecStop={base} stop");
    let _ = writeln!(out, "WorkingDirectory={}", data_dir.display());
    let _ = writeln!(out);
    let _ = writeln!(out, "[Install]");
    let _ = writeln!(out, "WantedBy=multi-user.target");
    out
}

/// Render the namespace side unit for a service whose spec is not `none`.
pub fn render_netns_unit(service: &str, spec: &NetworkSpec, run_dir: &Path) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "[Unit]");
    let _ = writeln!(out, "Description=network namespace for {service}");
    let _ = writeln!(out, "Before={}", unit_name(service));
    let _ = writeln!(out, "BindsTo={}", unit_name(service));
    let _ = writeln!(out, "StopWhenUnneeded=true");
    let _ = writeln!(out);
    let _ = writeln!(out, "[Service]");
    let _ = writeln!(out, "Type=oneshot");
    let _ = writeln!(out, "RemainAfterExit=yes");
    for cmd in netns::setup_commands(service, spec, run_dir) {
        let _ = writeln!(out, "ExecStart={cmd}");
    }
    for cmd in netns::engine_network_commands(service, spec) {
        let _ = writeln!(out, "ExecStart={cmd}");
    }
    for cmd in netns::teardown_commands(service, spec) {
        let _ = writeln!(out, "ExecStop={cmd}");
    }
    out
}

/// Render the default compose file for an image-only deploy.
pub fn render_default_compose(service: &str, image: &str, data_dir: &Path) -> String {
    format!(
        "services:\n  {service}:\n    image: {image}\n    restart: unless-stopped\n    volumes:\n      - {}:/data\n",
        data_dir.display()
    )
}

/// Render the compose override that attaches the project to the managed
/// engine network.
pub fn render_compose_network(service: &str) -> String {
    format!(
        "networks:\n  default:\n    name: {}\n    external: true\n",
        netns::engine_network_name(service)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::netns::TailscaleSpec;
    use std::path::PathBuf;

    fn service(name: &str) -> Service {
        Service {
            name: name.to_string(),
            ..Service::default()
        }
    }

    #[test]
    fn unit_references_generation_artifact() {
        let svc = service("web");
        let view = UnitView {
            service: &svc,
            exec_kind: ExecKind::Binary,
            exec_path: Path::new("/srv/web/bin/web-4"),
            env_path: None,
            data_dir: Path::new("/srv/web/data"),
            run_dir: Path::new("/srv/web/run"),
        };
        let unit = render_unit(&view);
        assert!(unit.contains("ExecStart=/srv/web/bin/web-4\n"));
        assert!(unit.contains("Restart=always"));
        assert!(!unit.contains("NetworkNamespacePath"));
    }

    #[test]
    fn rendering_is_deterministic() {
        let svc = service("web");
        let view = UnitView {
            service: &svc,
            exec_kind: ExecKind::Script,
            exec_path: Path::new("/srv/web/bin/web-1"),
            env_path: Some(Path::new("/srv/web/env/env-1")),
            data_dir: Path::new("/srv/web/data"),
            run_dir: Path::new("/srv/web/run"),
        };
        let a = render_unit(&view);
        let b = render_unit(&view);
        assert_eq!(digest(a.as_bytes()), digest(b.as_bytes()));
    }

    #[test]
    fn netns_service_joins_namespace_and_orders_after_side_unit() {
        let mut svc = service("api");
        svc.network = Some(NetworkSpec::Tailscale(TailscaleSpec::default()));
        let view = UnitView {
            service: &svc,
            exec_kind: ExecKind::Binary,
            exec_path: Path::new("/srv/api/bin/api-2"),
            env_path: None,
            data_dir: Path::new("/srv/api/data"),
            run_dir: Path::new("/srv/api/run"),
        };
        let unit = render_unit(&view);
        assert!(unit.contains("After=yeet-api-ns.service"));
        assert!(unit.contains("Requires=yeet-api-ns.service"));
        assert!(unit.contains("NetworkNamespacePath=/run/netns/yeet-api-ns"));
    }

    #[test]
    fn timer_unit_carries_calendar_and_persistence() {
        let timer = TimerSpec {
            on_calendar: "*-*-* 2:30:00".to_string(),
            persistent: true,
        };
        let unit = render_timer("backup", &timer);
        assert!(unit.contains("OnCalendar=*-*-* 2:30:00"));
        assert!(unit.contains("Persistent=true"));
        assert!(unit.contains("Unit=yeet-backup.service"));
    }

    #[test]
    fn timer_services_are_oneshot() {
        let mut svc = service("backup");
        svc.timer = Some(TimerSpec {
            on_calendar: "*-*-* 2:30:00".to_string(),
            persistent: true,
        });
        let view = UnitView {
            service: &svc,
            exec_kind: ExecKind::Binary,
            exec_path: Path::new("/srv/backup/bin/backup-1"),
            env_path: None,
            data_dir: Path::new("/srv/backup/data"),
            run_dir: Path::new("/srv/backup/run"),
        };
        let unit = render_unit(&view);
        assert!(unit.contains("Type=oneshot"));
        assert!(!unit.contains("Restart=always"));
    }

    #[test]
    fn default_compose_matches_template() {
        let compose =
            render_default_compose("myapp", "catchit.dev/myapp/web:latest", Path::new("/srv/myapp/data"));
        assert_eq!(
            compose,
            "services:\n  myapp:\n    image: catchit.dev/myapp/web:latest\n    restart: unless-stopped\n    volumes:\n      - /srv/myapp/data:/data\n"
        );
    }

    #[test]
    fn compose_unit_lists_all_compose_files() {
        let svc = service("myapp");
        let files = [
            PathBuf::from("/srv/myapp/run/compose-1.yml"),
            PathBuf::from("/srv/myapp/run/compose-net-1.yml"),
        ];
        let refs: Vec<&Path> = files.iter().map(PathBuf::as_path).collect();
        let unit = render_compose_unit(&svc, &refs, Path::new("/srv/myapp/data"));
        assert!(unit.contains("--project-name yeet-myapp"));
        assert!(unit.contains("--file /srv/myapp/run/compose-1.yml"));
        assert!(unit.contains("--file /srv/myapp/run/compose-net-1.yml"));
        assert!(unit.contains("ExecStop="));
    }

    #[test]
    fn netns_unit_is_bound_to_main_unit() {
        let spec = NetworkSpec::Tailscale(TailscaleSpec::default());
        let unit = render_netns_unit("api", &spec, Path::new("/srv/api/run"));
        assert!(unit.contains("Before=yeet-api.service"));
        assert!(unit.contains("BindsTo=yeet-api.service"));
        assert!(unit.contains("ExecStart=/usr/sbin/ip netns add yeet-api-ns"));
        assert!(unit.contains("ExecStop=/usr/sbin/ip netns del yeet-api-ns"));
    }
}
