//! Exec and attach sessions over the API server's WebSocket channel
//! protocol.
//!
//! Every binary frame starts with a channel byte. Version 5 of the protocol
//! adds a close frame so stdin can reach EOF while output keeps flowing;
//! version 4 servers only see stdin end with the session.

use futures::{SinkExt, StreamExt};
use reqwest::StatusCode;
use reqwest::header::{
    CONNECTION, SEC_WEBSOCKET_KEY, SEC_WEBSOCKET_PROTOCOL, SEC_WEBSOCKET_VERSION, UPGRADE,
};
use serde_json::{Value, json};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::handshake::client::generate_key;
use tokio_tungstenite::tungstenite::protocol::Role;

use crate::application::ports::Stdio;
use crate::domain::{BackendError, TtySize};

const PROTOCOL_V5: &str = "v5.channel.k8s.io";
const PROTOCOL_V4: &str = "v4.channel.k8s.io";

const STDIN: u8 = 0;
const STDOUT: u8 = 1;
const STDERR: u8 = 2;
const STATUS: u8 = 3;
const RESIZE: u8 = 4;
const CLOSE: u8 = 255;

fn ws_error(e: tokio_tungstenite::tungstenite::Error) -> BackendError {
    BackendError::Api(anyhow::Error::new(e).context("exec channel"))
}

fn io_error(e: std::io::Error) -> BackendError {
    BackendError::Api(anyhow::Error::new(e).context("streaming exec I/O"))
}

fn frame(channel: u8, payload: &[u8]) -> Message {
    let mut data = Vec::with_capacity(payload.len() + 1);
    data.push(channel);
    data.extend_from_slice(payload);
    Message::Binary(data)
}

/// An upgraded exec or attach connection.
pub(crate) struct Channels {
    ws: WebSocketStream<reqwest::Upgraded>,
    can_close: bool,
}

/// Upgrade a GET on `url` (an `exec` or `attach` subresource).
pub(crate) async fn open(client: &reqwest::Client, url: reqwest::Url) -> Result<Channels, BackendError> {
    let resp = client
        .get(url)
        .header(CONNECTION, "Upgrade")
        .header(UPGRADE, "websocket")
        .header(SEC_WEBSOCKET_VERSION, "13")
        .header(SEC_WEBSOCKET_KEY, generate_key())
        .header(SEC_WEBSOCKET_PROTOCOL, format!("{PROTOCOL_V5}, {PROTOCOL_V4}"))
        .send()
        .await
        .map_err(|e| BackendError::Api(e.into()))?;
    let status = resp.status();
    if status != StatusCode::SWITCHING_PROTOCOLS {
        let body = resp.text().await.unwrap_or_default();
        return Err(match status {
            StatusCode::NOT_FOUND => BackendError::NotFound,
            _ => BackendError::Api(anyhow::anyhow!("API server refused upgrade with {status}: {body}")),
        });
    }
    let can_close = resp
        .headers()
        .get(SEC_WEBSOCKET_PROTOCOL)
        .and_then(|v| v.to_str().ok())
        == Some(PROTOCOL_V5);
    let upgraded = resp.upgrade().await.map_err(|e| BackendError::Api(e.into()))?;
    let ws = WebSocketStream::from_raw_socket(upgraded, Role::Client, None).await;
    Ok(Channels { ws, can_close })
}

async fn read_some(
    stdin: Option<&mut (dyn AsyncRead + Unpin + Send)>,
    buf: &mut [u8],
) -> std::io::Result<usize> {
    match stdin {
        Some(stdin) => stdin.read(buf).await,
        None => std::future::pending().await,
    }
}

impl Channels {
    /// Relay `stdio` and terminal resizes until the server closes the
    /// session. Returns the exit code from the status channel, `None` when
    /// the server sent none.
    pub(crate) async fn relay(
        self,
        stdio: Stdio<'_>,
        mut resize: mpsc::UnboundedReceiver<TtySize>,
    ) -> Result<Option<i64>, BackendError> {
        let Stdio {
            mut stdin,
            stdout,
            mut stderr,
        } = stdio;
        let can_close = self.can_close;
        let (mut sink, mut source) = self.ws.split();
        let mut buf = vec![0u8; 32 * 1024];
        let mut exit_code = None;

        loop {
            tokio::select! {
                message = source.next() => {
                    let data = match message {
                        None => break,
                        Some(message) => match message.map_err(ws_error)? {
                            Message::Binary(data) => data,
                            Message::Close(_) => break,
                            _ => continue,
                        },
                    };
                    let Some((&channel, payload)) = data.split_first() else {
                        continue;
                    };
                    match channel {
                        STDOUT => stdout.write_all(payload).await.map_err(io_error)?,
                        STDERR => match stderr.as_deref_mut() {
                            Some(err) => err.write_all(payload).await.map_err(io_error)?,
                            None => stdout.write_all(payload).await.map_err(io_error)?,
                        },
                        STATUS => exit_code = Some(status_exit_code(payload)?),
                        _ => {}
                    }
                }
                read = read_some(stdin.as_deref_mut().map(|s| s as _), &mut buf), if stdin.is_some() => {
                    let n = read.map_err(io_error)?;
                    if n == 0 {
                        stdin = None;
                        if can_close {
                            sink.send(frame(CLOSE, &[STDIN])).await.map_err(ws_error)?;
                        }
                    } else {
                        sink.send(frame(STDIN, &buf[..n])).await.map_err(ws_error)?;
                    }
                }
                Some(size) = resize.recv() => {
                    let body = json!({"Width": size.width, "Height": size.height}).to_string();
                    sink.send(frame(RESIZE, body.as_bytes())).await.map_err(ws_error)?;
                }
            }
        }
        stdout.flush().await.map_err(io_error)?;
        Ok(exit_code)
    }
}

/// Exit code carried by the status channel's `Status` object.
pub(crate) fn status_exit_code(payload: &[u8]) -> Result<i64, BackendError> {
    let status: Value =
        serde_json::from_slice(payload).map_err(|e| BackendError::Api(e.into()))?;
    if status["status"] == "Success" {
        return Ok(0);
    }
    if status["reason"] == "NonZeroExitCode" {
        let code = status["details"]["causes"]
            .as_array()
            .and_then(|causes| causes.iter().find(|c| c["reason"] == "ExitCode"))
            .and_then(|c| c["message"].as_str())
            .and_then(|m| m.parse().ok());
        if let Some(code) = code {
            return Ok(code);
        }
    }
    Err(BackendError::Api(anyhow::anyhow!(
        "exec failed: {}",
        status["message"].as_str().unwrap_or("no message")
    )))
}
