//! Caller authorization.
//!
//! Identity comes from the mesh: every incoming connection (SSH) or request
//! (HTTP, registry) is resolved to a mesh peer and checked against a single
//! rule derived from tag ownership. The mesh client library is an external
//! collaborator reached through its CLI.

use std::net::SocketAddr;
use std::process::Stdio;

use anyhow::{Context, Result};
use async_trait::async_trait;
use log::debug;
use serde::Deserialize;
use thiserror::Error;
use tokio::process::Command;

#[derive(Debug, Error)]
#[error("unauthorized connection")]
pub struct Unauthorized;

/// Accept/reject decision for one remote peer.
#[async_trait]
pub trait Authorizer: Send + Sync {
    /// Returns `Ok(())` when the peer may use the daemon. Failures to
    /// resolve the peer at all are errors too, and deny.
    async fn authorize(&self, remote: SocketAddr) -> Result<()>;
}

/// Identity facts about a node, as reported by the mesh.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeIdentity {
    pub tags: Vec<String>,
    pub user_id: i64,
}

impl NodeIdentity {
    pub fn is_tagged(&self) -> bool {
        !self.tags.is_empty()
    }
}

/// The single authorization rule.
///
/// A tagged node's identity is the machine: tagged peers need an
/// overlapping tag, untagged peers are welcome. An untagged node's identity
/// is its user: tagged peers are welcome, untagged peers must belong to the
/// same user.
pub fn allowed(own: &NodeIdentity, peer: &NodeIdentity) -> bool {
    if peer.is_tagged() {
        return own.is_tagged() && peer.tags.iter().any(|t| own.tags.contains(t));
    }
    if own.is_tagged() {
        return true;
    }
    own.user_id == peer.user_id
}

/// Production authorizer backed by the mesh client CLI.
pub struct TailscaleAuthorizer;

#[derive(Debug, Deserialize)]
struct StatusJson {
    #[serde(rename = "Self")]
    own: StatusSelf,
}

#[derive(Debug, Deserialize)]
struct StatusSelf {
    #[serde(rename = "Tags", default)]
    tags: Vec<String>,
    #[serde(rename = "UserID", default)]
    user_id: i64,
}

#[derive(Debug, Deserialize)]
struct WhoisJson {
    #[serde(rename = "Node")]
    node: WhoisNode,
}

#[derive(Debug, Deserialize)]
struct WhoisNode {
    #[serde(rename = "Tags", default)]
    tags: Vec<String>,
    #[serde(rename = "User", default)]
    user: i64,
}

impl TailscaleAuthorizer {
    async fn run_json<T: serde::de::DeserializeOwned>(args: &[&str]) -> Result<T> {
        let output = Command::new("tailscale")
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await
            .context("running tailscale")?;
        if !output.status.success() {
            anyhow::bail!(
                "tailscale {} failed: {}",
                args.join(" "),
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        serde_json::from_slice(&output.stdout).context("parsing tailscale output")
    }

    async fn own_identity(&self) -> Result<NodeIdentity> {
        let status: StatusJson = Self::run_json(&["status", "--json", "--peers=false"]).await?;
        Ok(NodeIdentity {
            tags: status.own.tags,
            user_id: status.own.user_id,
        })
    }

    async fn peer_identity(&self, remote: SocketAddr) -> Result<NodeIdentity> {
        let addr = remote.to_string();
        let whois: WhoisJson = Self::run_json(&["whois", "--json", &addr]).await?;
        Ok(NodeIdentity {
            tags: whois.node.tags,
            user_id: whois.node.user,
        })
    }
}

#[async_trait]
impl Authorizer for TailscaleAuthorizer {
    async fn authorize(&self, remote: SocketAddr) -> Result<()> {
        let own = self.own_identity().await.context("resolving own identity")?;
        let peer = self
            .peer_identity(remote)
            .await
            .with_context(|| format!("resolving peer {remote}"))?;
        if allowed(&own, &peer) {
            debug!("authorized {remote}");
            Ok(())
        } else {
            Err(Unauthorized.into())
        }
    }
}

/// Fixed-outcome authorizer for tests and loopback-only deployments.
pub struct StaticAuthorizer {
    allow: bool,
}

impl StaticAuthorizer {
    pub fn allow_all() -> StaticAuthorizer {
        StaticAuthorizer { allow: true }
    }

    pub fn deny_all() -> StaticAuthorizer {
        StaticAuthorizer { allow: false }
    }
}

#[async_trait]
impl Authorizer for StaticAuthorizer {
    async fn authorize(&self, _remote: SocketAddr) -> Result<()> {
        if self.allow {
            Ok(())
        } else {
            Err(Unauthorized.into())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tagged(tags: &[&str]) -> NodeIdentity {
        NodeIdentity {
            tags: tags.iter().map(|s| s.to_string()).collect(),
            user_id: 0,
        }
    }

    fn user(id: i64) -> NodeIdentity {
        NodeIdentity {
            tags: Vec::new(),
            user_id: id,
        }
    }

    #[test]
    fn tagged_peers_need_overlap() {
        let own = tagged(&["tag:prod", "tag:infra"]);
        assert!(allowed(&own, &tagged(&["tag:prod"])));
        assert!(!allowed(&own, &tagged(&["tag:dev"])));
        // A tagged peer against an untagged node is rejected.
        assert!(!allowed(&user(7), &tagged(&["tag:prod"])));
    }

    #[test]
    fn tagged_node_accepts_untagged_peers() {
        assert!(allowed(&tagged(&["tag:prod"]), &user(42)));
    }

    #[test]
    fn untagged_node_requires_same_user() {
        assert!(allowed(&user(7), &user(7)));
        assert!(!allowed(&user(7), &user(8)));
    }

    #[test]
    fn whois_json_shape_parses() {
        let raw = r#"{"Node": {"Tags": ["tag:prod"], "User": 12}}"#;
        let whois: WhoisJson = serde_json::from_str(raw).unwrap();
        assert_eq!(whois.node.tags, vec!["tag:prod"]);
        assert_eq!(whois.node.user, 12);
    }
}
