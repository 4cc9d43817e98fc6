//! WebSocket endpoints: terminal-over-WebSocket command execution and the
//! event stream.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{FromRequestParts, Query, State};
use axum::response::{IntoResponse, Response};
use futures::{SinkExt, StreamExt};
use log::{debug, warn};
use serde::Deserialize;
use tokio::io::AsyncReadExt;
use tokio_util::sync::PollSender;

use super::error::ApiError;
use super::routes::ApiState;
use crate::cli::exec::{Executor, SessionIo};
use crate::ssh::PtyPair;

/// Resize control message: a 0x01 tag followed by `[8;<rows>;<cols>t`.
const RESIZE_TAG: u8 = 0x01;

#[derive(Debug, Deserialize)]
pub struct RunCommandQuery {
    pub service: Option<String>,
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    pub tty: Option<bool>,
    pub rows: Option<u16>,
    pub cols: Option<u16>,
}

/// GET /api/v0/run-command
///
/// With `tty=true` (the default) the request upgrades to a WebSocket that
/// multiplexes pty I/O and resize control messages. Without a terminal the
/// command's output streams back as the response body.
pub async fn run_command(
    State(state): State<ApiState>,
    Query(query): Query<RunCommandQuery>,
    request: axum::extract::Request,
) -> Result<Response, ApiError> {
    let service = query
        .service
        .clone()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| ApiError::bad_request("missing required parameters"))?;
    if !crate::valid_service_name(&service) {
        return Err(ApiError::bad_request(format!(
            "invalid service name: {service:?}"
        )));
    }
    let command = query
        .command
        .clone()
        .filter(|c| !c.is_empty())
        .ok_or_else(|| ApiError::bad_request("missing required parameters"))?;
    let mut args = vec![command];
    args.extend(query.args.iter().cloned());
    let tty = query.tty.unwrap_or(true);

    if tty {
        let (Some(rows), Some(cols)) = (query.rows, query.cols) else {
            return Err(ApiError::bad_request("missing required parameters"));
        };
        let (mut parts, _body) = request.into_parts();
        let upgrade = WebSocketUpgrade::from_request_parts(&mut parts, &state)
            .await
            .map_err(|_| ApiError::bad_request("tty output requires a websocket"))?;
        let daemon = state.daemon.clone();
        return Ok(upgrade.on_upgrade(move |socket| {
            run_tty_command(daemon, socket, service, args, rows, cols)
        }));
    }

    // Plain mode: request body is the command's stdin, the response body
    // streams its output.
    let daemon = state.daemon.clone();
    let body_reader = tokio_util::io::StreamReader::new(
        request
            .into_body()
            .into_data_stream()
            .map(|chunk| chunk.map_err(std::io::Error::other)),
    );
    let (out_tx, out_rx) = tokio::sync::mpsc::channel::<Vec<u8>>(32);
    let cancel = daemon.cancel.child_token();
    let factory = piped_factory(out_tx.clone(), &daemon);
    daemon.tracker.clone().spawn(async move {
        let mut executor = Executor {
            daemon: daemon.clone(),
            service,
            user: daemon.settings.default_user.clone(),
            io: SessionIo {
                reader: Box::new(body_reader),
                writer: Box::new(SenderWriter::new(out_tx)),
            },
            factory,
            is_pty: false,
            term: "dumb".to_string(),
            cancel,
            closer: None,
        };
        let code = executor.run(args).await;
        debug!("run-command exited with {code}");
    });

    let stream = tokio_stream::wrappers::ReceiverStream::new(out_rx)
        .map(|chunk| Ok::<_, std::io::Error>(axum::body::Bytes::from(chunk)));
    Ok(axum::body::Body::from_stream(stream).into_response())
}

async fn run_tty_command(
    daemon: Arc<crate::daemon::Daemon>,
    socket: WebSocket,
    service: String,
    args: Vec<String>,
    rows: u16,
    cols: u16,
) {
    let pair = match PtyPair::open(cols, rows) {
        Ok(pair) => Arc::new(pair),
        Err(err) => {
            warn!("opening pty: {err:#}");
            return;
        }
    };
    let cancel = daemon.cancel.child_token();
    let (mut ws_tx, mut ws_rx) = socket.split();

    let io = match pair.executor_io() {
        Ok(io) => io,
        Err(err) => {
            warn!("pty io: {err:#}");
            return;
        }
    };
    let factory = pair.command_factory("xterm");

    // Pty master output -> websocket.
    let out_pair = pair.clone();
    let out_cancel = cancel.clone();
    let output = tokio::spawn(async move {
        let Ok(mut io) = out_pair.master_io() else {
            return;
        };
        let mut buf = vec![0u8; 8 * 1024];
        loop {
            tokio::select! {
                read = io.reader.read(&mut buf) => match read {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if ws_tx.send(Message::Binary(buf[..n].to_vec().into())).await.is_err() {
                            break;
                        }
                    }
                },
                _ = out_cancel.cancelled() => break,
            }
        }
        let _ = ws_tx.close().await;
    });

    // Websocket -> pty master, with resize control messages peeled off.
    let in_pair = pair.clone();
    let in_cancel = cancel.clone();
    let input = tokio::spawn(async move {
        use tokio::io::AsyncWriteExt;
        let Ok(mut io) = in_pair.master_io() else {
            return;
        };
        while let Some(Ok(message)) = ws_rx.next().await {
            let data = match message {
                Message::Binary(b) => b.to_vec(),
                Message::Text(t) => t.as_bytes().to_vec(),
                Message::Close(_) => break,
                _ => continue,
            };
            if let Some((rows, cols)) = parse_resize(&data) {
                in_pair.resize(cols, rows);
                continue;
            }
            if io.writer.write_all(&data).await.is_err() {
                break;
            }
            let _ = io.writer.flush().await;
        }
        // Socket gone: abort the in-flight command.
        in_cancel.cancel();
    });

    let mut executor = Executor {
        daemon: daemon.clone(),
        service,
        user: daemon.settings.default_user.clone(),
        io,
        factory,
        is_pty: true,
        term: "xterm".to_string(),
        cancel: cancel.clone(),
        closer: Some(Arc::new({
            let cancel = cancel.clone();
            move || cancel.cancel()
        })),
    };
    let code = tokio::select! {
        code = executor.run(args) => code,
        _ = cancel.cancelled() => 130,
    };
    debug!("tty command exited with {code}");
    drop(executor);
    pair.shutdown();
    let _ = tokio::time::timeout(std::time::Duration::from_secs(2), output).await;
    input.abort();
}

/// GET /api/v0/events: forward every event, unfiltered, as JSON text
/// messages.
pub async fn events(
    State(state): State<ApiState>,
    upgrade: WebSocketUpgrade,
) -> Response {
    let daemon = state.daemon.clone();
    upgrade.on_upgrade(move |mut socket| async move {
        let (handle, mut rx) = daemon.events.add_listener(|_| true);
        loop {
            tokio::select! {
                event = rx.recv() => {
                    let Some(event) = event else { break };
                    let Ok(text) = serde_json::to_string(&event) else { continue };
                    if socket.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                message = socket.recv() => match message {
                    None | Some(Err(_)) | Some(Ok(Message::Close(_))) => break,
                    Some(Ok(_)) => {}
                },
                _ = daemon.cancel.cancelled() => break,
            }
        }
        daemon.events.remove_listener(handle);
    })
}

/// Parse a `0x01 [8;<rows>;<cols>t` resize control message.
pub fn parse_resize(data: &[u8]) -> Option<(u16, u16)> {
    if data.len() < 5 || data[0] != RESIZE_TAG || &data[1..4] != b"[8;" {
        return None;
    }
    let text = std::str::from_utf8(&data[4..]).ok()?;
    let rest = text.strip_suffix('t')?;
    let (rows, cols) = rest.split_once(';')?;
    Some((rows.parse().ok()?, cols.parse().ok()?))
}

/// AsyncWrite into an mpsc channel; the receiver side becomes the response
/// body stream.
struct SenderWriter {
    tx: PollSender<Vec<u8>>,
}

impl SenderWriter {
    fn new(tx: tokio::sync::mpsc::Sender<Vec<u8>>) -> SenderWriter {
        SenderWriter {
            tx: PollSender::new(tx),
        }
    }
}

impl tokio::io::AsyncWrite for SenderWriter {
    fn poll_write(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &[u8],
    ) -> std::task::Poll<std::io::Result<usize>> {
        match self.tx.poll_reserve(cx) {
            std::task::Poll::Pending => std::task::Poll::Pending,
            std::task::Poll::Ready(Err(_)) => std::task::Poll::Ready(Err(
                std::io::Error::new(std::io::ErrorKind::BrokenPipe, "response closed"),
            )),
            std::task::Poll::Ready(Ok(())) => {
                if self.tx.send_item(buf.to_vec()).is_err() {
                    return std::task::Poll::Ready(Err(std::io::Error::new(
                        std::io::ErrorKind::BrokenPipe,
                        "response closed",
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

/// Command factory for plain (non-tty) HTTP runs: children get no stdin and
/// their output is pumped into the response channel.
fn piped_factory(
    tx: tokio::sync::mpsc::Sender<Vec<u8>>,
    daemon: &Arc<crate::daemon::Daemon>,
) -> crate::runner::CommandFactory {
    use std::process::Stdio;
    let tracker = daemon.tracker.clone();
    Arc::new(move |program, args| {
        let mut cmd = tokio::process::Command::new(program);
        cmd.args(args).stdin(Stdio::null());
        match nix::unistd::pipe() {
            Ok((read_end, write_end)) => match write_end.try_clone() {
                Ok(dup) => {
                    cmd.stdout(Stdio::from(std::fs::File::from(dup)))
                        .stderr(Stdio::from(std::fs::File::from(write_end)));
                    let tx = tx.clone();
                    let mut file =
                        tokio::fs::File::from_std(std::fs::File::from(read_end));
                    tracker.spawn(async move {
                        let mut buf = vec![0u8; 8 * 1024];
                        loop {
                            match file.read(&mut buf).await {
                                Ok(0) | Err(_) => break,
                                Ok(n) => {
                                    if tx.send(buf[..n].to_vec()).await.is_err() {
                                        break;
                                    }
                                }
                            }
                        }
                    });
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resize_messages_parse() {
        let mut msg = vec![RESIZE_TAG];
        msg.extend_from_slice(b"[8;40;120t");
        assert_eq!(parse_resize(&msg), Some((40, 120)));
    }

    #[test]
    fn non_resize_payloads_pass_through() {
        assert_eq!(parse_resize(b"plain input"), None);
        assert_eq!(parse_resize(&[RESIZE_TAG, b'x']), None);
        let mut bad = vec![RESIZE_TAG];
        bad.extend_from_slice(b"[8;40;120"); // missing trailing t
        assert_eq!(parse_resize(&bad), None);
    }
}
