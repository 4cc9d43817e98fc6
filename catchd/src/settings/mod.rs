//! Daemon configuration.
//!
//! Settings are layered: built-in defaults, an optional TOML file, then
//! `CATCHD_*` environment overrides. Serve flags override the lot.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Root of all daemon state.
    pub data_dir: PathBuf,
    /// Hostname the daemon is known by on the mesh.
    pub hostname: String,
    /// SSH listen port.
    pub ssh_port: u16,
    /// HTTP API listen port.
    pub http_port: u16,
    /// Loopback bind address for the embedded registry; port 0 picks one.
    pub registry_internal_addr: String,
    /// User new service directories are owned by.
    pub default_user: String,
    /// Directory of web UI assets, served at `/` when present.
    pub assets_dir: Option<PathBuf>,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            data_dir: PathBuf::from("/var/lib/catchd"),
            hostname: "catch".to_string(),
            ssh_port: 22,
            http_port: 443,
            registry_internal_addr: "127.0.0.1:0".to_string(),
            default_user: "root".to_string(),
            assets_dir: None,
        }
    }
}

impl Settings {
    /// Load settings from an optional config file plus the environment.
    pub fn load(config_file: Option<&Path>) -> Result<Settings> {
        let mut builder = Config::builder();
        if let Some(path) = config_file {
            builder = builder.add_source(
                File::from(path.to_path_buf())
                    .format(FileFormat::Toml)
                    .required(true),
            );
        } else {
            builder = builder.add_source(
                File::with_name("/etc/catchd/config")
                    .format(FileFormat::Toml)
                    .required(false),
            );
        }
        let cfg = builder
            .add_source(Environment::with_prefix("CATCHD").separator("__"))
            .build()
            .context("loading configuration")?;
        let mut settings = Settings::default();
        settings = cfg
            .try_deserialize::<PartialSettings>()
            .context("parsing configuration")?
            .apply(settings);
        Ok(settings)
    }

    pub fn paths(&self) -> Paths {
        Paths {
            root: self.data_dir.clone(),
        }
    }
}

/// File/env settings are all optional so defaults and flags can fill gaps.
#[derive(Debug, Default, Deserialize)]
struct PartialSettings {
    data_dir: Option<PathBuf>,
    hostname: Option<String>,
    ssh_port: Option<u16>,
    http_port: Option<u16>,
    registry_internal_addr: Option<String>,
    default_user: Option<String>,
    assets_dir: Option<PathBuf>,
}

impl PartialSettings {
    fn apply(self, mut base: Settings) -> Settings {
        if let Some(v) = self.data_dir {
            base.data_dir = v;
        }
        if let Some(v) = self.hostname {
            base.hostname = v;
        }
        if let Some(v) = self.ssh_port {
            base.ssh_port = v;
        }
        if let Some(v) = self.http_port {
            base.http_port = v;
        }
        if let Some(v) = self.registry_internal_addr {
            base.registry_internal_addr = v;
        }
        if let Some(v) = self.default_user {
            base.default_user = v;
        }
        if let Some(v) = self.assets_dir {
            base.assets_dir = Some(v);
        }
        base
    }
}

/// Derived filesystem layout under the data directory.
#[derive(Debug, Clone)]
pub struct Paths {
    root: PathBuf,
}

impl Paths {
    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn db_file(&self) -> PathBuf {
        self.root.join("db.json")
    }

    pub fn host_key_file(&self) -> PathBuf {
        self.root.join("id_ed25519")
    }

    pub fn services_root(&self) -> PathBuf {
        self.root.join("services")
    }

    pub fn mounts_root(&self) -> PathBuf {
        self.root.join("mounts")
    }

    pub fn registry_root(&self) -> PathBuf {
        self.root.join("registry")
    }

    pub fn service_root(&self, service: &str) -> PathBuf {
        self.services_root().join(service)
    }

    pub fn service_bin_dir(&self, service: &str) -> PathBuf {
        self.service_root(service).join("bin")
    }

    pub fn service_data_dir(&self, service: &str) -> PathBuf {
        self.service_root(service).join("data")
    }

    pub fn service_env_dir(&self, service: &str) -> PathBuf {
        self.service_root(service).join("env")
    }

    pub fn service_run_dir(&self, service: &str) -> PathBuf {
        self.service_root(service).join("run")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let s = Settings::default();
        assert_eq!(s.ssh_port, 22);
        assert_eq!(s.registry_internal_addr, "127.0.0.1:0");
        let p = s.paths();
        assert_eq!(p.db_file(), PathBuf::from("/var/lib/catchd/db.json"));
        assert_eq!(
            p.service_bin_dir("web"),
            PathBuf::from("/var/lib/catchd/services/web/bin")
        );
    }

    #[test]
    fn file_overrides_defaults() {
        let dir = tempfile::TempDir::new().unwrap();
        let file = dir.path().join("config.toml");
        std::fs::write(&file, "hostname = \"deploy-host\"\nssh_port = 2222\n").unwrap();
        let s = Settings::load(Some(&file)).unwrap();
        assert_eq!(s.hostname, "deploy-host");
        assert_eq!(s.ssh_port, 2222);
        assert_eq!(s.http_port, Settings::default().http_port);
    }
}
