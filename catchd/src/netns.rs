//! Network namespace attachment.
//!
//! Services with a network spec run inside a private namespace named
//! `yeet-<svc>-ns`. A side unit creates the namespace and the interface in
//! it before the main unit starts, and tears both down on stop. The main
//! unit joins the namespace via `NetworkNamespacePath=`; compose services
//! join through an external engine network managed by the same side unit.

use std::path::Path;

use anyhow::{Context, Result};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use tokio::process::Command;

use crate::store::Store;

/// Declarative description of the namespace a service runs in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "kebab-case")]
pub enum NetworkSpec {
    /// Host namespace, no side unit.
    None,
    /// Private namespace with a per-service mesh interface.
    Tailscale(TailscaleSpec),
    /// Private namespace with a macvlan child of a host interface.
    Macvlan(MacvlanSpec),
}

impl NetworkSpec {
    pub fn is_none(&self) -> bool {
        matches!(self, NetworkSpec::None)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TailscaleSpec {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub version: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub exit_node: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub auth_key: String,
    /// Assigned by the mesh control plane on first up; persisted so the
    /// node survives restarts under the same identity.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stable_id: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MacvlanSpec {
    pub parent: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub mac: String,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub vlan: u16,
}

fn is_zero(v: &u16) -> bool {
    *v == 0
}

/// Namespace name for a service.
pub fn netns_name(service: &str) -> String {
    format!("yeet-{service}-ns")
}

/// Name of the engine network compose services attach to.
pub fn engine_network_name(service: &str) -> String {
    format!("yeet-{service}")
}

/// Shell command lines executed by the side unit on start, in order.
pub fn setup_commands(service: &str, spec: &NetworkSpec, run_dir: &Path) -> Vec<String> {
    let ns = netns_name(service);
    let mut cmds = vec![
        format!("/usr/sbin/ip netns add {ns}"),
        format!("/usr/sbin/ip -n {ns} link set lo up"),
    ];
    match spec {
        NetworkSpec::None => return Vec::new(),
        NetworkSpec::Tailscale(ts) => {
            let sock = run_dir.join("tailscaled.sock");
            let state = run_dir.join("ts-state");
            cmds.push(format!(
                "/usr/sbin/ip netns exec {ns} tailscaled --statedir={} --socket={} --tun=yeet{}",
                state.display(),
                sock.display(),
                short_hash(service),
            ));
            let mut up = format!(
                "tailscale --socket={} up --hostname={service}",
                sock.display()
            );
            if !ts.auth_key.is_empty() {
                up.push_str(&format!(" --auth-key={}", ts.auth_key));
            }
            if !ts.tags.is_empty() {
                up.push_str(&format!(" --advertise-tags={}", ts.tags.join(",")));
            }
            if !ts.exit_node.is_empty() {
                up.push_str(&format!(" --exit-node={}", ts.exit_node));
            }
            cmds.push(up);
        }
        NetworkSpec::Macvlan(mv) => {
            let ifname = format!("yeet{}", short_hash(service));
            let parent = if mv.vlan > 0 {
                let vlan_if = format!("{}.{}", mv.parent, mv.vlan);
                cmds.push(format!(
                    "/usr/sbin/ip link add link {} name {vlan_if} type vlan id {}",
                    mv.parent, mv.vlan
                ));
                vlan_if
            } else {
                mv.parent.clone()
            };
            cmds.push(format!(
                "/usr/sbin/ip link add {ifname} link {parent} type macvlan mode bridge"
            ));
            cmds.push(format!("/usr/sbin/ip link set {ifname} netns {ns}"));
            if !mv.mac.is_empty() {
                cmds.push(format!(
                    "/usr/sbin/ip -n {ns} link set {ifname} address {}",
                    mv.mac
                ));
            }
            cmds.push(format!("/usr/sbin/ip -n {ns} link set {ifname} up"));
        }
    }
    cmds
}

/// Shell command lines executed by the side unit on stop. Deleting the
/// namespace destroys the interfaces that were moved into it.
pub fn teardown_commands(service: &str, spec: &NetworkSpec) -> Vec<String> {
    let ns = netns_name(service);
    let mut cmds = Vec::new();
    if let NetworkSpec::Macvlan(mv) = spec {
        if mv.vlan > 0 {
            cmds.push(format!(
                "-/usr/sbin/ip link del {}.{}",
                mv.parent, mv.vlan
            ));
        }
    }
    cmds.push(format!("/usr/sbin/ip netns del {ns}"));
    cmds
}

/// Engine network creation for compose services, run by the side unit after
/// the namespace is up.
pub fn engine_network_commands(service: &str, spec: &NetworkSpec) -> Vec<String> {
    let net = engine_network_name(service);
    match spec {
        NetworkSpec::None => Vec::new(),
        NetworkSpec::Tailscale(_) => vec![format!("-docker network create {net}")],
        NetworkSpec::Macvlan(mv) => {
            let mut cmd = format!("-docker network create -d macvlan -o parent={}", mv.parent);
            if mv.vlan > 0 {
                cmd = format!(
                    "-docker network create -d macvlan -o parent={}.{}",
                    mv.parent, mv.vlan
                );
            }
            cmd.push(' ');
            cmd.push_str(&net);
            vec![cmd]
        }
    }
}

/// Interface names are capped at 15 bytes, so derive a short stable suffix
/// from the service name instead of embedding it.
fn short_hash(service: &str) -> String {
    use sha2::Digest;
    let digest = sha2::Sha256::digest(service.as_bytes());
    hex::encode(&digest[..4])
}

/// Read the node id assigned by the mesh control plane and persist it into
/// the service's network spec. Called after the first successful start of a
/// mesh-attached service; a node that already has a stable id is left alone.
pub async fn persist_stable_id(store: &Store, service: &str, run_dir: &Path) -> Result<()> {
    let svc = store.service(service)?;
    match &svc.network {
        Some(NetworkSpec::Tailscale(ts)) if ts.stable_id.is_none() => {}
        _ => return Ok(()),
    }

    let sock = run_dir.join("tailscaled.sock");
    let output = Command::new("tailscale")
        .arg(format!("--socket={}", sock.display()))
        .args(["status", "--json"])
        .output()
        .await
        .context("running tailscale status")?;
    if !output.status.success() {
        warn!(
            "tailscale status for {service} failed: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        );
        return Ok(());
    }
    let status: serde_json::Value =
        serde_json::from_slice(&output.stdout).context("parsing tailscale status")?;
    let Some(id) = status
        .pointer("/Self/ID")
        .and_then(|v| v.as_str())
        .map(str::to_string)
    else {
        return Ok(());
    };

    store.mutate_service(service, |_, svc| {
        if let Some(NetworkSpec::Tailscale(ts)) = svc.network.as_mut() {
            if ts.stable_id.is_none() {
                ts.stable_id = Some(id.clone());
            }
        }
        Ok(())
    })?;
    info!("persisted mesh node id for {service}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn none_spec_has_no_commands() {
        assert!(setup_commands("web", &NetworkSpec::None, Path::new("/run")).is_empty());
        assert!(engine_network_commands("web", &NetworkSpec::None).is_empty());
    }

    #[test]
    fn tailscale_setup_binds_per_service_socket() {
        let spec = NetworkSpec::Tailscale(TailscaleSpec {
            auth_key: "tskey-abc".into(),
            tags: vec!["tag:prod".into()],
            ..TailscaleSpec::default()
        });
        let cmds = setup_commands("web", &spec, &PathBuf::from("/srv/web/run"));
        assert_eq!(cmds[0], "/usr/sbin/ip netns add yeet-web-ns");
        assert!(cmds
            .iter()
            .any(|c| c.contains("--socket=/srv/web/run/tailscaled.sock")));
        assert!(cmds
            .iter()
            .any(|c| c.contains("--auth-key=tskey-abc") && c.contains("--advertise-tags=tag:prod")));
    }

    #[test]
    fn macvlan_with_vlan_creates_tagged_parent() {
        let spec = NetworkSpec::Macvlan(MacvlanSpec {
            parent: "eth0".into(),
            mac: "02:42:ac:11:00:02".into(),
            vlan: 42,
        });
        let cmds = setup_commands("db", &spec, Path::new("/srv/db/run"));
        assert!(cmds.iter().any(|c| c.contains("type vlan id 42")));
        assert!(cmds.iter().any(|c| c.contains("type macvlan mode bridge")));
        assert!(cmds.iter().any(|c| c.contains("address 02:42:ac:11:00:02")));
        let down = teardown_commands("db", &spec);
        assert_eq!(down.last().unwrap(), "/usr/sbin/ip netns del yeet-db-ns");
    }

    #[test]
    fn interface_suffix_is_short_and_stable() {
        let a = short_hash("averyveryverylongservicename");
        assert_eq!(a, short_hash("averyveryverylongservicename"));
        assert!(4 + a.len() <= 15);
    }

    #[test]
    fn spec_round_trips_through_json() {
        let spec = NetworkSpec::Macvlan(MacvlanSpec {
            parent: "eth0".into(),
            mac: String::new(),
            vlan: 0,
        });
        let raw = serde_json::to_string(&spec).unwrap();
        assert_eq!(serde_json::from_str::<NetworkSpec>(&raw).unwrap(), spec);
    }
}
