//! SSH front-end.
//!
//! Every connection is authorized against the mesh peer identity before any
//! channel opens. The SSH user portion routes to a service (`[user@]service`,
//! empty service meaning `sys`), exec requests run the shared command tree,
//! and the `sftp` subsystem exposes the virtual upload paths. When the
//! client asks for a terminal a real pty is opened server-side and its
//! window tracks the client's.

mod pty;
mod sftp;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use log::{debug, info, warn};
use russh::keys::key::KeyPair;
use russh::server::{Auth, Handler, Msg, Server as _, Session};
use russh::{Channel, ChannelId, MethodSet};
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

use crate::cli::exec::{Executor, SessionIo};
use crate::daemon::Daemon;
use crate::SYSTEM_SERVICE;

pub use pty::PtyPair;

/// Load the host key, generating one on first start.
pub fn load_host_key(daemon: &Daemon) -> Result<KeyPair> {
    let path = daemon.paths.host_key_file();
    match std::fs::read_to_string(&path) {
        Ok(pem) => russh::keys::decode_secret_key(&pem, None)
            .with_context(|| format!("parsing host key {}", path.display())),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            let key = KeyPair::generate_ed25519().context("generating host key")?;
            let mut pem = Vec::new();
            russh::keys::encode_pkcs8_pem(&key, &mut pem).context("encoding host key")?;
            std::fs::write(&path, &pem)
                .with_context(|| format!("writing host key {}", path.display()))?;
            Ok(key)
        }
        Err(err) => Err(err).with_context(|| format!("reading host key {}", path.display())),
    }
}

/// Accept SSH connections until the daemon shuts down.
pub async fn serve(daemon: Arc<Daemon>, addr: SocketAddr) -> Result<()> {
    let key = load_host_key(&daemon)?;
    let config = Arc::new(russh::server::Config {
        methods: MethodSet::NONE,
        keys: vec![key],
        ..russh::server::Config::default()
    });
    let mut server = SshServer {
        daemon: daemon.clone(),
    };
    info!("ssh listening on {addr}");
    tokio::select! {
        result = server.run_on_address(config, addr) => result.context("ssh server"),
        _ = daemon.cancel.cancelled() => Ok(()),
    }
}

struct SshServer {
    daemon: Arc<Daemon>,
}

impl russh::server::Server for SshServer {
    type Handler = SshSession;

    fn new_client(&mut self, peer_addr: Option<SocketAddr>) -> SshSession {
        SshSession {
            daemon: self.daemon.clone(),
            peer_addr,
            ssh_user: String::new(),
            channels: HashMap::new(),
            cancel: self.daemon.cancel.child_token(),
        }
    }
}

struct ChannelState {
    channel: Option<Channel<Msg>>,
    pty: Option<PtyPair>,
    term: String,
}

pub struct SshSession {
    daemon: Arc<Daemon>,
    peer_addr: Option<SocketAddr>,
    ssh_user: String,
    channels: HashMap<ChannelId, ChannelState>,
    cancel: CancellationToken,
}

impl SshSession {
    /// Parse `[user@]service` from the SSH user. An empty service routes to
    /// the meta-service. The service portion becomes a path component, so
    /// anything outside the service-name alphabet is rejected here.
    pub fn service_and_user(ssh_user: &str) -> Result<(String, String)> {
        if ssh_user.is_empty() {
            anyhow::bail!("empty user");
        }
        let (service, user) = match ssh_user.split_once('@') {
            None => (ssh_user.to_string(), String::new()),
            Some((user, service)) => {
                if service.contains('@') {
                    anyhow::bail!("invalid user: {ssh_user:?}");
                }
                let service = if service.is_empty() {
                    SYSTEM_SERVICE.to_string()
                } else {
                    service.to_string()
                };
                (service, user.to_string())
            }
        };
        if !crate::valid_service_name(&service) {
            anyhow::bail!("invalid service name: {service:?}");
        }
        Ok((service, user))
    }

    fn spawn_exec(
        &mut self,
        channel_id: ChannelId,
        session: &mut Session,
        args: Vec<String>,
    ) {
        let Some(state) = self.channels.get_mut(&channel_id) else {
            return;
        };
        let Some(channel) = state.channel.take() else {
            return;
        };
        let pty = state.pty.take();
        let term = state.term.clone();
        let daemon = self.daemon.clone();
        let ssh_user = self.ssh_user.clone();
        let handle = session.handle();
        let cancel = self.cancel.child_token();

        self.daemon.tracker.spawn(async move {
            let (service, mut user) = match Self::service_and_user(&ssh_user) {
                Ok(parsed) => parsed,
                Err(err) => {
                    let msg = format!("Error: {err}\n");
                    let _ = handle
                        .data(channel_id, russh::CryptoVec::from_slice(msg.as_bytes()))
                        .await;
                    let _ = handle.exit_status_request(channel_id, 1).await;
                    let _ = handle.close(channel_id).await;
                    return;
                }
            };
            if user.is_empty() {
                user = daemon.settings.default_user.clone();
            }

            let stream = channel.into_stream();
            let (read_half, mut write_half) = tokio::io::split(stream);

            let close_cancel = cancel.clone();
            let closer: Arc<dyn Fn() + Send + Sync> = Arc::new(move || close_cancel.cancel());

            let code = match pty {
                Some(pair) => {
                    // The executor and its children talk to the pty slave;
                    // two pump tasks tie the master to the channel.
                    let pumps = pair.pump(read_half, handle.clone(), channel_id);
                    let io = match pair.executor_io() {
                        Ok(io) => io,
                        Err(err) => {
                            warn!("pty io: {err:#}");
                            let _ = handle.exit_status_request(channel_id, 1).await;
                            let _ = handle.close(channel_id).await;
                            return;
                        }
                    };
                    let factory = pair.command_factory(&term);
                    let mut executor = Executor {
                        daemon: daemon.clone(),
                        service,
                        user,
                        io,
                        factory,
                        is_pty: true,
                        term,
                        cancel: cancel.clone(),
                        closer: Some(closer),
                    };
                    let code = tokio::select! {
                        code = executor.run(args) => code,
                        _ = cancel.cancelled() => 130,
                    };
                    drop(executor);
                    pair.shutdown();
                    pumps.finish().await;
                    code
                }
                None => {
                    let factory =
                        pty::piped_command_factory(handle.clone(), channel_id, &daemon);
                    let io = SessionIo {
                        reader: Box::new(read_half),
                        writer: Box::new(pty::HandleWriter::new(
                            handle.clone(),
                            channel_id,
                        )),
                    };
                    let mut executor = Executor {
                        daemon: daemon.clone(),
                        service,
                        user,
                        io,
                        factory,
                        is_pty: false,
                        term,
                        cancel: cancel.clone(),
                        closer: Some(closer),
                    };
                    let code = tokio::select! {
                        code = executor.run(args) => code,
                        _ = cancel.cancelled() => 130,
                    };
                    let _ = write_half.shutdown().await;
                    code
                }
            };

            let _ = handle.exit_status_request(channel_id, code as u32).await;
            let _ = handle.eof(channel_id).await;
            let _ = handle.close(channel_id).await;
        });
    }
}

#[async_trait]
impl Handler for SshSession {
    type Error = anyhow::Error;

    async fn auth_none(&mut self, user: &str) -> Result<Auth, Self::Error> {
        let Some(addr) = self.peer_addr else {
            return Ok(Auth::Reject {
                proceed_with_methods: None,
            });
        };
        match self.daemon.authorizer.authorize(addr).await {
            Ok(()) => {
                self.ssh_user = user.to_string();
                Ok(Auth::Accept)
            }
            Err(err) => {
                warn!("ssh caller {addr} rejected: {err:#}");
                Ok(Auth::Reject {
                    proceed_with_methods: None,
                })
            }
        }
    }

    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        self.channels.insert(
            channel.id(),
            ChannelState {
                channel: Some(channel),
                pty: None,
                term: "xterm".to_string(),
            },
        );
        Ok(true)
    }

    async fn pty_request(
        &mut self,
        channel: ChannelId,
        term: &str,
        col_width: u32,
        row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        _modes: &[(russh::Pty, u32)],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        if let Some(state) = self.channels.get_mut(&channel) {
            let pair = PtyPair::open(col_width as u16, row_height as u16)?;
            state.pty = Some(pair);
            state.term = term.to_string();
        }
        session.channel_success(channel);
        Ok(())
    }

    async fn window_change_request(
        &mut self,
        channel: ChannelId,
        col_width: u32,
        row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        if let Some(state) = self.channels.get(&channel) {
            if let Some(pty) = &state.pty {
                pty.resize(col_width as u16, row_height as u16);
            }
        }
        Ok(())
    }

    async fn exec_request(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let line = String::from_utf8_lossy(data).into_owned();
        debug!("exec from {:?}: {line}", self.ssh_user);
        let args = split_command_line(&line);
        session.channel_success(channel);
        self.spawn_exec(channel, session, args);
        Ok(())
    }

    async fn shell_request(
        &mut self,
        channel: ChannelId,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        // No interactive shell: a bare session prints the command help.
        session.channel_success(channel);
        self.spawn_exec(channel, session, Vec::new());
        Ok(())
    }

    async fn subsystem_request(
        &mut self,
        channel_id: ChannelId,
        name: &str,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        if name != "sftp" {
            session.channel_failure(channel_id);
            return Ok(());
        }
        let Some(state) = self.channels.get_mut(&channel_id) else {
            session.channel_failure(channel_id);
            return Ok(());
        };
        let Some(channel) = state.channel.take() else {
            session.channel_failure(channel_id);
            return Ok(());
        };
        session.channel_success(channel_id);

        let (service, mut user) = Self::service_and_user(&self.ssh_user)?;
        if user.is_empty() {
            user = self.daemon.settings.default_user.clone();
        }
        info!("sftp session for {service} started");
        let handler = sftp::SftpHandler::new(self.daemon.clone(), service, user);
        self.daemon.tracker.spawn(async move {
            russh_sftp::server::run(channel.into_stream(), handler).await;
        });
        Ok(())
    }

    async fn channel_close(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.channels.remove(&channel);
        Ok(())
    }
}

impl Drop for SshSession {
    fn drop(&mut self) {
        // Closing the connection aborts any in-flight command.
        self.cancel.cancel();
    }
}

/// Split an exec command line the way a shell would, honoring single and
/// double quotes.
pub fn split_command_line(line: &str) -> Vec<String> {
    let mut args = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;
    let mut any = false;
    for c in line.chars() {
        match quote {
            Some(q) => {
                if c == q {
                    quote = None;
                } else {
                    current.push(c);
                }
            }
            None => match c {
                '\'' | '"' => {
                    quote = Some(c);
                    any = true;
                }
                c if c.is_whitespace() => {
                    if any || !current.is_empty() {
                        args.push(std::mem::take(&mut current));
                        any = false;
                    }
                }
                c => current.push(c),
            },
        }
    }
    if any || !current.is_empty() {
        args.push(current);
    }
    args
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_routing() {
        assert_eq!(
            SshSession::service_and_user("web").unwrap(),
            ("web".to_string(), String::new())
        );
        assert_eq!(
            SshSession::service_and_user("alice@web").unwrap(),
            ("web".to_string(), "alice".to_string())
        );
        assert_eq!(
            SshSession::service_and_user("alice@").unwrap(),
            ("sys".to_string(), "alice".to_string())
        );
        assert!(SshSession::service_and_user("").is_err());
        assert!(SshSession::service_and_user("a@b@c").is_err());
    }

    #[test]
    fn user_routing_rejects_path_like_service_names() {
        assert!(SshSession::service_and_user("../../etc").is_err());
        assert!(SshSession::service_and_user("alice@../../etc").is_err());
        assert!(SshSession::service_and_user("alice@a/b").is_err());
        assert!(SshSession::service_and_user("Alice@web").is_ok());
        assert!(SshSession::service_and_user("alice@Web").is_err());
    }

    #[test]
    fn command_line_splitting() {
        assert_eq!(split_command_line("status --format json"), ["status", "--format", "json"]);
        assert_eq!(
            split_command_line(r#"cron "*/5 * * * *" -- --flag"#),
            ["cron", "*/5 * * * *", "--", "--flag"]
        );
        assert_eq!(split_command_line("run '' x"), ["", "x"]);
        assert!(split_command_line("   ").is_empty());
    }
}
