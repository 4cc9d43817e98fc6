//! SFTP subsystem.
//!
//! File transfer is the upload path for payloads. A handful of virtual
//! paths drive the installer — `/` and `/stage` install the main artifact
//! (commit vs stage), `/env` and `/stage/env` the env file — while
//! `/data/…` maps straight into the service's data directory with no
//! pipeline in between. Reads surface the same virtual paths.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use log::{debug, info, warn};
use russh_sftp::protocol::{
    Attrs, Data, File, FileAttributes, Handle, Name, OpenFlags, Status, StatusCode, Version,
};

use crate::daemon::Daemon;
use crate::installer::{InstallRequest, Installer};
use crate::runner::quiet_commands;

/// Where the bytes of an opened-for-write handle end up on close.
enum WriteDest {
    /// Through the installer as the main payload.
    Payload { commit: bool },
    /// Through the installer as the env file.
    Env { commit: bool },
    /// Straight into the data directory.
    Direct(PathBuf),
}

enum OpenHandle {
    Write {
        dest: WriteDest,
        tmp: tempfile::NamedTempFile,
    },
    Read {
        file: std::fs::File,
    },
    Dir {
        path: PathBuf,
        listed: bool,
    },
}

pub struct SftpHandler {
    daemon: Arc<Daemon>,
    service: String,
    user: String,
    handles: HashMap<String, OpenHandle>,
    next_handle: u64,
}

impl SftpHandler {
    pub fn new(daemon: Arc<Daemon>, service: String, user: String) -> SftpHandler {
        SftpHandler {
            daemon,
            service,
            user,
            handles: HashMap::new(),
            next_handle: 0,
        }
    }

    fn alloc_handle(&mut self, open: OpenHandle) -> String {
        let id = format!("h{}", self.next_handle);
        self.next_handle += 1;
        self.handles.insert(id.clone(), open);
        id
    }

    /// Resolve a read path: the env virtual paths or a data path.
    fn resolve_read(&self, path: &str) -> Result<PathBuf, StatusCode> {
        if path == "/env" || path == "/stage/env" {
            return self
                .daemon
                .env_file(&self.service, path == "/stage/env")
                .map_err(|_| StatusCode::NoSuchFile);
        }
        self.resolve_data(path)
    }

    /// Resolve `/data/…` under the service root, rejecting escapes and the
    /// reserved env location.
    fn resolve_data(&self, path: &str) -> Result<PathBuf, StatusCode> {
        let rest = path.strip_prefix("/data").ok_or(StatusCode::NoSuchFile)?;
        if !rest.is_empty() && !rest.starts_with('/') {
            return Err(StatusCode::NoSuchFile);
        }
        if rest == "/.env" {
            return Err(StatusCode::PermissionDenied);
        }
        let mut clean = PathBuf::new();
        for part in std::path::Path::new(rest).components() {
            match part {
                std::path::Component::Normal(c) => clean.push(c),
                std::path::Component::RootDir => {}
                _ => return Err(StatusCode::PermissionDenied),
            }
        }
        Ok(self.daemon.paths.service_data_dir(&self.service).join(clean))
    }

    fn ok_status(id: u32) -> Status {
        Status {
            id,
            status_code: StatusCode::Ok,
            error_message: "Ok".to_string(),
            language_tag: "en-US".to_string(),
        }
    }

    async fn finish_write(&mut self, dest: WriteDest, tmp: tempfile::NamedTempFile) -> anyhow::Result<()> {
        match dest {
            WriteDest::Direct(_) => Ok(()),
            WriteDest::Payload { commit } => {
                let req = InstallRequest {
                    user: self.user.clone(),
                    stage_only: !commit,
                    restart: commit,
                    ..InstallRequest::new(&self.service)
                };
                self.run_installer(req, tmp).await
            }
            WriteDest::Env { commit } => {
                // Env files may only stage until the service exists.
                let commit = commit && self.daemon.store.service(&self.service).is_ok();
                let req = InstallRequest {
                    user: self.user.clone(),
                    stage_only: !commit,
                    restart: commit,
                    env_file: true,
                    ..InstallRequest::new(&self.service)
                };
                self.run_installer(req, tmp).await
            }
        }
    }

    async fn run_installer(
        &self,
        req: InstallRequest,
        tmp: tempfile::NamedTempFile,
    ) -> anyhow::Result<()> {
        let file = tmp.reopen()?;
        let mut reader = tokio::fs::File::from_std(file);
        let installer = Installer::new(self.daemon.clone(), quiet_commands());
        installer.install_stream(&req, &mut reader, None).await?;
        Ok(())
    }
}

impl russh_sftp::server::Handler for SftpHandler {
    type Error = StatusCode;

    fn unimplemented(&self) -> Self::Error {
        StatusCode::OpUnsupported
    }

    async fn init(
        &mut self,
        version: u32,
        _extensions: HashMap<String, String>,
    ) -> Result<Version, Self::Error> {
        debug!("sftp init, client version {version}");
        Ok(Version::new())
    }

    async fn open(
        &mut self,
        id: u32,
        filename: String,
        pflags: OpenFlags,
        _attrs: FileAttributes,
    ) -> Result<Handle, Self::Error> {
        debug!("sftp open {filename:?} flags {pflags:?}");
        if pflags.contains(OpenFlags::WRITE) {
            let dest = match filename.as_str() {
                "/" | "/stage" => WriteDest::Payload {
                    commit: filename == "/",
                },
                "/env" | "/stage/env" => WriteDest::Env {
                    commit: filename == "/env",
                },
                path if path.starts_with("/data/") => {
                    let target = self.resolve_data(path)?;
                    WriteDest::Direct(target)
                }
                other => {
                    warn!("sftp write to unsupported path {other:?}");
                    return Err(StatusCode::PermissionDenied);
                }
            };
            self.daemon
                .ensure_dirs(&self.service, &self.user)
                .map_err(|err| {
                    warn!("ensuring dirs for {}: {err:#}", self.service);
                    StatusCode::Failure
                })?;
            let tmp = match &dest {
                // Direct writes stage next to the target for an atomic
                // rename on close.
                WriteDest::Direct(target) => {
                    let dir = target.parent().ok_or(StatusCode::NoSuchFile)?;
                    std::fs::create_dir_all(dir).map_err(|_| StatusCode::Failure)?;
                    tempfile::NamedTempFile::new_in(dir).map_err(|_| StatusCode::Failure)?
                }
                _ => tempfile::NamedTempFile::new_in(self.daemon.paths.service_root(&self.service))
                    .map_err(|_| StatusCode::Failure)?,
            };
            let handle = self.alloc_handle(OpenHandle::Write { dest, tmp });
            return Ok(Handle { id, handle });
        }

        let path = self.resolve_read(&filename)?;
        let file = std::fs::File::open(&path).map_err(|_| StatusCode::NoSuchFile)?;
        let handle = self.alloc_handle(OpenHandle::Read { file });
        Ok(Handle { id, handle })
    }

    async fn write(
        &mut self,
        id: u32,
        handle: String,
        offset: u64,
        data: Vec<u8>,
    ) -> Result<Status, Self::Error> {
        let Some(OpenHandle::Write { tmp, .. }) = self.handles.get_mut(&handle) else {
            return Err(StatusCode::Failure);
        };
        use std::os::unix::fs::FileExt;
        tmp.as_file()
            .write_at(&data, offset)
            .map_err(|_| StatusCode::Failure)?;
        Ok(Self::ok_status(id))
    }

    async fn read(
        &mut self,
        id: u32,
        handle: String,
        offset: u64,
        len: u32,
    ) -> Result<Data, Self::Error> {
        let Some(OpenHandle::Read { file }) = self.handles.get_mut(&handle) else {
            return Err(StatusCode::Failure);
        };
        use std::os::unix::fs::FileExt;
        let mut buf = vec![0u8; len as usize];
        let n = file.read_at(&mut buf, offset).map_err(|_| StatusCode::Failure)?;
        if n == 0 {
            return Err(StatusCode::Eof);
        }
        buf.truncate(n);
        Ok(Data { id, data: buf })
    }

    async fn close(&mut self, id: u32, handle: String) -> Result<Status, Self::Error> {
        let Some(open) = self.handles.remove(&handle) else {
            return Err(StatusCode::Failure);
        };
        match open {
            OpenHandle::Read { .. } | OpenHandle::Dir { .. } => Ok(Self::ok_status(id)),
            OpenHandle::Write { dest, tmp } => {
                if let WriteDest::Direct(target) = &dest {
                    let target = target.clone();
                    tmp.persist(&target).map_err(|err| {
                        warn!("persisting {}: {}", target.display(), err.error);
                        StatusCode::Failure
                    })?;
                    info!("wrote {}", target.display());
                    return Ok(Self::ok_status(id));
                }
                match self.finish_write(dest, tmp).await {
                    Ok(()) => Ok(Self::ok_status(id)),
                    Err(err) => {
                        warn!("install via sftp for {}: {err:#}", self.service);
                        Err(StatusCode::Failure)
                    }
                }
            }
        }
    }

    async fn opendir(&mut self, id: u32, path: String) -> Result<Handle, Self::Error> {
        let resolved = self.resolve_data(&path)?;
        if !resolved.is_dir() {
            return Err(StatusCode::NoSuchFile);
        }
        let handle = self.alloc_handle(OpenHandle::Dir {
            path: resolved,
            listed: false,
        });
        Ok(Handle { id, handle })
    }

    async fn readdir(&mut self, id: u32, handle: String) -> Result<Name, Self::Error> {
        let Some(OpenHandle::Dir { path, listed }) = self.handles.get_mut(&handle) else {
            return Err(StatusCode::Failure);
        };
        if *listed {
            return Err(StatusCode::Eof);
        }
        *listed = true;
        let entries = std::fs::read_dir(&*path).map_err(|_| StatusCode::NoSuchFile)?;
        let mut files = Vec::new();
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().into_owned();
            let attrs = entry
                .metadata()
                .map(|m| attrs_for(&m))
                .unwrap_or_default();
            files.push(File::new(name, attrs));
        }
        Ok(Name { id, files })
    }

    async fn realpath(&mut self, id: u32, path: String) -> Result<Name, Self::Error> {
        // The virtual tree has no links; normalization is cosmetic.
        let normalized = if path.is_empty() || path == "." {
            "/".to_string()
        } else if path.starts_with('/') {
            path
        } else {
            format!("/{path}")
        };
        Ok(Name {
            id,
            files: vec![File::new(normalized, FileAttributes::default())],
        })
    }

    async fn stat(&mut self, id: u32, path: String) -> Result<Attrs, Self::Error> {
        let resolved = self.resolve_read(&path)?;
        let meta = std::fs::metadata(&resolved).map_err(|_| StatusCode::NoSuchFile)?;
        Ok(Attrs {
            id,
            attrs: attrs_for(&meta),
        })
    }

    async fn lstat(&mut self, id: u32, path: String) -> Result<Attrs, Self::Error> {
        self.stat(id, path).await
    }

    async fn setstat(
        &mut self,
        id: u32,
        path: String,
        _attrs: FileAttributes,
    ) -> Result<Status, Self::Error> {
        // Clients setstat after uploads; accept it for any path we know.
        if path == "/" || path == "/stage" || path == "/env" || path == "/stage/env" {
            return Ok(Self::ok_status(id));
        }
        self.resolve_data(&path)?;
        Ok(Self::ok_status(id))
    }
}

fn attrs_for(meta: &std::fs::Metadata) -> FileAttributes {
    use std::os::unix::fs::MetadataExt;
    FileAttributes {
        size: Some(meta.len()),
        uid: Some(meta.uid()),
        gid: Some(meta.gid()),
        permissions: Some(meta.mode()),
        atime: Some(meta.atime().max(0) as u32),
        mtime: Some(meta.mtime().max(0) as u32),
        ..FileAttributes::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::authz::StaticAuthorizer;
    use crate::settings::Settings;
    use crate::store::Store;
    use tempfile::TempDir;

    fn handler(dir: &TempDir) -> SftpHandler {
        let settings = Settings {
            data_dir: dir.path().to_path_buf(),
            ..Settings::default()
        };
        let store = Store::open(settings.paths().db_file()).unwrap();
        let daemon = Daemon::new(settings, store, Arc::new(StaticAuthorizer::allow_all()));
        SftpHandler::new(daemon, "web".to_string(), String::new())
    }

    #[test]
    fn data_paths_resolve_under_the_service_root() {
        let dir = TempDir::new().unwrap();
        let h = handler(&dir);
        let resolved = h.resolve_data("/data/config/settings.json").unwrap();
        assert_eq!(
            resolved,
            dir.path().join("services/web/data/config/settings.json")
        );
    }

    #[test]
    fn data_path_escapes_are_rejected() {
        let dir = TempDir::new().unwrap();
        let h = handler(&dir);
        assert!(h.resolve_data("/data/../secrets").is_err());
        assert!(h.resolve_data("/etc/passwd").is_err());
        assert!(h.resolve_data("/data/.env").is_err());
    }

    #[tokio::test]
    async fn env_upload_to_stage_goes_through_the_installer() {
        use russh_sftp::server::Handler as _;
        let dir = TempDir::new().unwrap();
        let mut h = handler(&dir);
        let open = h
            .open(
                1,
                "/stage/env".to_string(),
                OpenFlags::WRITE | OpenFlags::CREATE,
                FileAttributes::default(),
            )
            .await
            .unwrap();
        h.write(2, open.handle.clone(), 0, b"FOO=1\n".to_vec())
            .await
            .unwrap();
        h.close(3, open.handle).await.unwrap();

        let svc = h.daemon.store.service("web").unwrap();
        let staged = svc
            .artifacts
            .staged(crate::store::ArtifactName::EnvFile)
            .unwrap();
        assert_eq!(std::fs::read(staged).unwrap(), b"FOO=1\n");
        assert_eq!(svc.generation, 0);
    }

    #[tokio::test]
    async fn direct_data_write_lands_in_the_data_dir() {
        use russh_sftp::server::Handler as _;
        let dir = TempDir::new().unwrap();
        let mut h = handler(&dir);
        h.daemon.ensure_dirs("web", "").unwrap();
        let open = h
            .open(
                1,
                "/data/notes.txt".to_string(),
                OpenFlags::WRITE | OpenFlags::CREATE,
                FileAttributes::default(),
            )
            .await
            .unwrap();
        h.write(2, open.handle.clone(), 0, b"hello".to_vec())
            .await
            .unwrap();
        h.close(3, open.handle).await.unwrap();
        assert_eq!(
            std::fs::read(dir.path().join("services/web/data/notes.txt")).unwrap(),
            b"hello"
        );
    }
}
