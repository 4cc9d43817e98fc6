//! Host-level volume mounts.
//!
//! A volume is a named mount under the mounts root, realized as a systemd
//! mount unit so it survives reboots and can order against service units.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use log::info;

use crate::runner::CommandFactory;
use crate::store::Volume;

const UNIT_DIR: &str = "/etc/systemd/system";

/// Whether a mount helper for the filesystem type is installed.
pub fn helper_exists(mount_type: &str) -> bool {
    Path::new(&format!("/sbin/mount.{mount_type}")).exists()
}

/// systemd requires the unit name to be the escaped mount path.
pub fn unit_name_for(path: &Path) -> String {
    format!("{}.mount", escape_path(path))
}

/// Escape a path the way `systemd-escape --path` does: strip slashes,
/// join components with `-`, and hex-escape everything else unsafe.
fn escape_path(path: &Path) -> String {
    let trimmed = path.to_string_lossy();
    let trimmed = trimmed.trim_matches('/');
    if trimmed.is_empty() {
        return "-".to_string();
    }
    let mut out = String::new();
    for (i, byte) in trimmed.bytes().enumerate() {
        match byte {
            b'/' => out.push('-'),
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'_' => out.push(byte as char),
            b'.' if i > 0 => out.push('.'),
            _ => {
                let _ = write!(out, "\\x{byte:02x}");
            }
        }
    }
    out
}

/// Render the mount unit for a volume.
pub fn render_mount_unit(volume: &Volume) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "[Unit]");
    let _ = writeln!(out, "Description=yeet mount {}", volume.name);
    let _ = writeln!(out, "After=network-online.target");
    if !volume.deps.is_empty() {
        let _ = writeln!(out, "After={}", volume.deps);
        let _ = writeln!(out, "Requires={}", volume.deps);
    }
    let _ = writeln!(out);
    let _ = writeln!(out, "[Mount]");
    let _ = writeln!(out, "What={}", volume.src);
    let _ = writeln!(out, "Where={}", volume.path.display());
    let _ = writeln!(out, "Type={}", volume.mount_type);
    let _ = writeln!(out, "Options={}", volume.opts);
    let _ = writeln!(out);
    let _ = writeln!(out, "[Install]");
    let _ = writeln!(out, "WantedBy=multi-user.target");
    out
}

async fn systemctl(factory: &CommandFactory, args: &[&str]) -> Result<()> {
    let args: Vec<String> = args.iter().map(|s| s.to_string()).collect();
    let status = (factory)("systemctl", &args)
        .status()
        .await
        .context("running systemctl")?;
    if !status.success() {
        bail!("systemctl {} exited with {status}", args.join(" "));
    }
    Ok(())
}

/// Install and start the mount unit for a volume.
pub async fn mount(volume: &Volume, factory: &CommandFactory) -> Result<()> {
    std::fs::create_dir_all(&volume.path)
        .with_context(|| format!("creating mount point {}", volume.path.display()))?;
    let unit = unit_name_for(&volume.path);
    let unit_path = PathBuf::from(UNIT_DIR).join(&unit);
    std::fs::write(&unit_path, render_mount_unit(volume))
        .with_context(|| format!("writing {}", unit_path.display()))?;
    systemctl(factory, &["daemon-reload"]).await?;
    systemctl(factory, &["enable", "--now", &unit]).await?;
    info!("mounted {} at {}", volume.src, volume.path.display());
    Ok(())
}

/// Stop and delete the mount unit for a volume.
pub async fn umount(volume: &Volume, factory: &CommandFactory) -> Result<()> {
    let unit = unit_name_for(&volume.path);
    systemctl(factory, &["disable", "--now", &unit]).await?;
    let unit_path = PathBuf::from(UNIT_DIR).join(&unit);
    match std::fs::remove_file(&unit_path) {
        Ok(()) => {}
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => return Err(err).with_context(|| format!("removing {}", unit_path.display())),
    }
    systemctl(factory, &["daemon-reload"]).await?;
    info!("unmounted {}", volume.path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escaping_matches_systemd_convention() {
        assert_eq!(
            escape_path(Path::new("/var/lib/catchd/mounts/media")),
            "var-lib-catchd-mounts-media"
        );
        assert_eq!(
            unit_name_for(Path::new("/srv/my-data")),
            "srv-my\\x2ddata.mount"
        );
        assert_eq!(escape_path(Path::new("/")), "-");
    }

    #[test]
    fn mount_unit_carries_source_and_options() {
        let volume = Volume {
            name: "media".to_string(),
            src: "nas:/export/media".to_string(),
            path: PathBuf::from("/var/lib/catchd/mounts/media"),
            mount_type: "nfs".to_string(),
            opts: "ro,soft".to_string(),
            deps: String::new(),
        };
        let unit = render_mount_unit(&volume);
        assert!(unit.contains("What=nas:/export/media"));
        assert!(unit.contains("Where=/var/lib/catchd/mounts/media"));
        assert!(unit.contains("Type=nfs"));
        assert!(unit.contains("Options=ro,soft"));
        assert!(!unit.contains("Requires=\n"));
    }

    #[test]
    fn mount_unit_orders_after_deps() {
        let volume = Volume {
            name: "media".to_string(),
            src: "nas:/export/media".to_string(),
            path: PathBuf::from("/var/lib/catchd/mounts/media"),
            mount_type: "nfs".to_string(),
            opts: "defaults".to_string(),
            deps: "wg.service".to_string(),
        };
        let unit = render_mount_unit(&volume);
        assert!(unit.contains("After=wg.service"));
        assert!(unit.contains("Requires=wg.service"));
    }
}
