//! Server-side pty plumbing.
//!
//! A pty session owns a master/slave pair: the executor and every child
//! process it spawns talk to the slave (with the slave as controlling
//! terminal), while two pump tasks tie the master to the SSH channel.
//! Window-change requests land on the pty via ioctl.

use std::os::fd::{AsRawFd, OwnedFd};
use std::process::Stdio;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use log::debug;
use nix::pty::Winsize;
use russh::server::Handle;
use russh::{ChannelId, CryptoVec};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio_util::sync::PollSender;

use crate::cli::exec::SessionIo;
use crate::daemon::Daemon;
use crate::runner::CommandFactory;

pub struct PtyPair {
    master: Arc<OwnedFd>,
    /// Dropped on shutdown so the master sees EOF once the last child and
    /// executor handle close.
    slave: Mutex<Option<Arc<OwnedFd>>>,
}

fn winsize(cols: u16, rows: u16) -> Winsize {
    Winsize {
        ws_row: rows,
        ws_col: cols,
        ws_xpixel: 0,
        ws_ypixel: 0,
    }
}

fn dup_file(fd: &OwnedFd) -> Result<std::fs::File> {
    let dup = fd.try_clone().context("duping pty fd")?;
    Ok(std::fs::File::from(dup))
}

impl PtyPair {
    pub fn open(cols: u16, rows: u16) -> Result<PtyPair> {
        let pair = nix::pty::openpty(Some(&winsize(cols, rows)), None)
            .context("opening pty")?;
        Ok(PtyPair {
            master: Arc::new(pair.master),
            slave: Mutex::new(Some(Arc::new(pair.slave))),
        })
    }

    /// Apply a client window-size change.
    pub fn resize(&self, cols: u16, rows: u16) {
        let ws = winsize(cols, rows);
        let fd = self.master.as_raw_fd();
        // TIOCSWINSZ also signals SIGWINCH to the foreground process group.
        let rc = unsafe { libc::ioctl(fd, libc::TIOCSWINSZ, &ws) };
        if rc != 0 {
            debug!("TIOCSWINSZ failed: {}", std::io::Error::last_os_error());
        }
    }

    fn slave_fd(&self) -> Result<Arc<OwnedFd>> {
        self.slave
            .lock()
            .expect("pty lock poisoned")
            .clone()
            .context("pty already shut down")
    }

    /// Session streams for the executor: both halves are the pty slave.
    pub fn executor_io(&self) -> Result<SessionIo> {
        let slave = self.slave_fd()?;
        let reader = tokio::fs::File::from_std(dup_file(&slave)?);
        let writer = tokio::fs::File::from_std(dup_file(&slave)?);
        Ok(SessionIo {
            reader: Box::new(reader),
            writer: Box::new(writer),
        })
    }

    /// Master-side streams, for front-ends that pump the pty themselves
    /// (the WebSocket terminal).
    pub fn master_io(&self) -> Result<SessionIo> {
        let reader = tokio::fs::File::from_std(dup_file(&self.master)?);
        let writer = tokio::fs::File::from_std(dup_file(&self.master)?);
        Ok(SessionIo {
            reader: Box::new(reader),
            writer: Box::new(writer),
        })
    }

    /// Command factory whose children run on the pty slave as their
    /// controlling terminal, with the client's TERM.
    pub fn command_factory(&self, term: &str) -> CommandFactory {
        let slave = self.slave.lock().expect("pty lock poisoned").clone();
        let term = term.to_string();
        Arc::new(move |program, args| {
            let mut cmd = Command::new(program);
            cmd.args(args).env("TERM", &term);
            if let Some(slave) = &slave {
                if let (Ok(sin), Ok(sout), Ok(serr)) =
                    (dup_file(slave), dup_file(slave), dup_file(slave))
                {
                    cmd.stdin(Stdio::from(sin))
                        .stdout(Stdio::from(sout))
                        .stderr(Stdio::from(serr));
                    unsafe {
                        cmd.pre_exec(|| {
                            // New session with the slave as controlling tty.
                            if libc::setsid() < 0 {
                                return Err(std::io::Error::last_os_error());
                            }
                            if libc::ioctl(0, libc::TIOCSCTTY as _, 0) < 0 {
                                return Err(std::io::Error::last_os_error());
                            }
                            Ok(())
                        });
                    }
                }
            }
            cmd
        })
    }

    /// Start the channel pumps: client bytes into the master, master output
    /// back to the channel.
    pub fn pump<R>(&self, mut from_client: R, handle: Handle, id: ChannelId) -> Pumps
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        let master_in = self.master.clone();
        let writer = tokio::spawn(async move {
            let Ok(file) = dup_file(&master_in) else {
                return;
            };
            let mut master = tokio::fs::File::from_std(file);
            let mut buf = vec![0u8; 8 * 1024];
            loop {
                match from_client.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if master.write_all(&buf[..n]).await.is_err() {
                            break;
                        }
                        let _ = master.flush().await;
                    }
                }
            }
        });

        let master_out = self.master.clone();
        let reader = tokio::spawn(async move {
            let Ok(file) = dup_file(&master_out) else {
                return;
            };
            let mut master = tokio::fs::File::from_std(file);
            let mut buf = vec![0u8; 8 * 1024];
            loop {
                match master.read(&mut buf).await {
                    // EIO means every slave handle is gone.
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if handle
                            .data(id, CryptoVec::from_slice(&buf[..n]))
                            .await
                            .is_err()
                        {
                            break;
                        }
                    }
                }
            }
        });

        Pumps { reader, writer }
    }

    /// Drop our slave handle; the master reaches EOF when the executor and
    /// children release theirs.
    pub fn shutdown(&self) {
        self.slave.lock().expect("pty lock poisoned").take();
    }
}

pub struct Pumps {
    reader: tokio::task::JoinHandle<()>,
    writer: tokio::task::JoinHandle<()>,
}

impl Pumps {
    /// Wait for pending output to drain, then stop feeding the pty.
    pub async fn finish(self) {
        let _ = tokio::time::timeout(std::time::Duration::from_secs(2), self.reader).await;
        self.writer.abort();
    }
}

/// Writer that forwards executor output over the session channel. Used for
/// non-pty sessions where there is no slave to write to.
pub struct HandleWriter {
    tx: PollSender<Vec<u8>>,
}

impl HandleWriter {
    pub fn new(handle: Handle, id: ChannelId) -> HandleWriter {
        let (tx, mut rx) = tokio::sync::mpsc::channel::<Vec<u8>>(32);
        tokio::spawn(async move {
            while let Some(chunk) = rx.recv().await {
                if handle.data(id, CryptoVec::from_slice(&chunk)).await.is_err() {
                    break;
                }
            }
        });
        HandleWriter {
            tx: PollSender::new(tx),
        }
    }
}

impl tokio::io::AsyncWrite for HandleWriter {
    fn poll_write(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &[u8],
    ) -> std::task::Poll<std::io::Result<usize>> {
        match self.tx.poll_reserve(cx) {
            std::task::Poll::Pending => std::task::Poll::Pending,
            std::task::Poll::Ready(Err(_)) => std::task::Poll::Ready(Err(
                std::io::Error::new(std::io::ErrorKind::BrokenPipe, "channel closed"),
            )),
            std::task::Poll::Ready(Ok(())) => {
                if self.tx.send_item(buf.to_vec()).is_err() {
                    return std::task::Poll::Ready(Err(std::io::Error::new(
                        std::io::ErrorKind::BrokenPipe,
                        "channel closed",
                    )));
                }
                std::task::Poll::Ready(Ok(buf.len()))
            }
        }
    }

    fn poll_flush(
        self: std::pin::Pin<&mut Self>,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn poll_shutdown(
        mut self: std::pin::Pin<&mut Self>,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        self.tx.close();
        std::task::Poll::Ready(Ok(()))
    }
}

/// Command factory for sessions without a terminal: children read nothing
/// and their output is pumped to the channel as it appears.
pub fn piped_command_factory(
    handle: Handle,
    id: ChannelId,
    daemon: &Arc<Daemon>,
) -> CommandFactory {
    let tracker = daemon.tracker.clone();
    Arc::new(move |program, args| {
        let mut cmd = Command::new(program);
        cmd.args(args).stdin(Stdio::null());
        match nix::unistd::pipe() {
            Ok((read_end, write_end)) => match write_end.try_clone() {
                Ok(dup) => {
                    cmd.stdout(Stdio::from(std::fs::File::from(dup)))
                        .stderr(Stdio::from(std::fs::File::from(write_end)));
                    let handle = handle.clone();
                    let file = tokio::fs::File::from_std(std::fs::File::from(read_end));
                    tracker.spawn(pump_file(file, handle, id));
                }
                Err(_) => {
                    cmd.stdout(Stdio::null()).stderr(Stdio::null());
                }
            },
            Err(_) => {
                cmd.stdout(Stdio::null()).stderr(Stdio::null());
            }
        }
        cmd
    })
}

async fn pump_file(mut file: tokio::fs::File, handle: Handle, id: ChannelId) {
    let mut buf = vec![0u8; 8 * 1024];
    loop {
        match file.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if handle
                    .data(id, CryptoVec::from_slice(&buf[..n]))
                    .await
                    .is_err()
                {
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pty_opens_and_resizes() {
        let pair = PtyPair::open(80, 24).unwrap();
        pair.resize(120, 40);
        let io = pair.executor_io().unwrap();
        drop(io);
        pair.shutdown();
        assert!(pair.executor_io().is_err());
    }
}
