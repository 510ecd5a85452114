//! Terminal client for a ptyhub server.
//!
//! `attach` waits for the server to answer `/health`, opens the session
//! WebSocket and proxies the local terminal over it. A dropped connection
//! is retried with the live backoff until the agent exits, stdin closes,
//! or the server says the session is gone.

use std::io::Write;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{Sink, SinkExt, Stream, StreamExt};
use reqwest::{StatusCode, Url};
use serde::Deserialize;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use crate::codec::{BinaryFrame, ServerMessage, TerminalDims, SESSION_CLOSED_CODE};
use crate::reconnect::{Backoff, Probe, ReconnectError, Reconnector, TokioScheduler};
use crate::terminal::{self, RawModeGuard, TerminalError};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const HEALTH_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("invalid server address {0:?}")]
    Address(String),
    #[error("could not connect to ptyhub server at {0} (is the server running?)")]
    Connect(String),
    #[error("request to {0} timed out")]
    Timeout(String),
    #[error("session not found: {0}")]
    NotFound(String),
    #[error("server returned {status}: {message}")]
    Status { status: StatusCode, message: String },
    #[error(transparent)]
    Http(reqwest::Error),
    #[error(transparent)]
    WebSocket(#[from] tungstenite::Error),
    #[error(transparent)]
    Terminal(#[from] TerminalError),
    #[error(transparent)]
    Reconnect(#[from] ReconnectError),
}

/// Session summary as returned by `GET /sessions`.
#[derive(Debug, Clone, Deserialize)]
pub struct SessionListEntry {
    pub id: String,
    pub name: String,
    pub agent: String,
    pub cwd: String,
    pub viewers: usize,
    pub state: String,
    pub yolo: bool,
}

/// How one attach connection ended.
#[derive(Debug, PartialEq, Eq)]
pub enum LoopEnd {
    /// The agent exited with this code.
    Exited(i32),
    /// Local stdin closed; the user is done.
    StdinClosed,
    /// The session was closed on the server; reconnecting would not find it.
    SessionClosed,
    /// Socket dropped or closed by the server.
    Disconnected,
}

#[derive(Debug, Clone)]
pub struct Client {
    base: Url,
    http: reqwest::Client,
}

impl Client {
    /// `server` is `host:port` or an `http://` URL.
    pub fn new(server: &str) -> Result<Self, ClientError> {
        let raw = if server.contains("://") {
            server.to_string()
        } else {
            format!("http://{server}")
        };
        let base = Url::parse(&raw).map_err(|_| ClientError::Address(server.to_string()))?;
        if !matches!(base.scheme(), "http" | "https") || base.host_str().is_none() {
            return Err(ClientError::Address(server.to_string()));
        }
        Ok(Self {
            base,
            http: reqwest::Client::new(),
        })
    }

    fn url(&self, path: &str) -> Result<Url, ClientError> {
        self.base.join(path).map_err(|_| ClientError::Address(path.to_string()))
    }

    fn map_reqwest(&self, e: reqwest::Error) -> ClientError {
        if e.is_connect() {
            ClientError::Connect(self.base.to_string())
        } else if e.is_timeout() {
            ClientError::Timeout(self.base.to_string())
        } else {
            ClientError::Http(e)
        }
    }

    /// WebSocket URL for a session, with the optional display name.
    pub fn session_ws_url(&self, session: &str, name: Option<&str>) -> Result<Url, ClientError> {
        let mut url = self.url(&format!("/sessions/{session}/ws"))?;
        let scheme = if url.scheme() == "https" { "wss" } else { "ws" };
        url.set_scheme(scheme)
            .map_err(|_| ClientError::Address(self.base.to_string()))?;
        if let Some(name) = name {
            url.query_pairs_mut().append_pair("name", name);
        }
        Ok(url)
    }

    pub async fn health(&self) -> Result<(), ClientError> {
        let resp = self
            .http
            .get(self.url("/health")?)
            .timeout(HEALTH_TIMEOUT)
            .send()
            .await
            .map_err(|e| self.map_reqwest(e))?;
        check_status(resp).await.map(|_| ())
    }

    /// Poll `/health` with the readiness backoff until it answers.
    pub async fn wait_until_ready(&self, cancel: &CancellationToken) -> Result<(), ClientError> {
        let mut reconnector = Reconnector::new(Backoff::READINESS, TokioScheduler);
        let mut probe = HealthProbe { client: self };
        reconnector.run(&mut probe, cancel).await?;
        Ok(())
    }

    pub async fn list_sessions(&self) -> Result<Vec<SessionListEntry>, ClientError> {
        let resp = self
            .http
            .get(self.url("/sessions")?)
            .send()
            .await
            .map_err(|e| self.map_reqwest(e))?;
        let resp = check_status(resp).await?;
        resp.json().await.map_err(ClientError::Http)
    }

    pub async fn close_session(&self, session: &str) -> Result<(), ClientError> {
        let resp = self
            .http
            .delete(self.url(&format!("/sessions/{session}"))?)
            .send()
            .await
            .map_err(|e| self.map_reqwest(e))?;
        match check_status(resp).await {
            Err(ClientError::Status { status, .. }) if status == StatusCode::NOT_FOUND => {
                Err(ClientError::NotFound(session.to_string()))
            }
            other => other.map(|_| ()),
        }
    }

    /// Attach the local terminal to `session`.
    ///
    /// Returns the agent's exit code, or `None` when stdin closed or the
    /// session was closed first.
    pub async fn attach(&self, session: &str, name: Option<&str>, cancel: CancellationToken) -> Result<Option<i32>, ClientError> {
        self.wait_until_ready(&cancel).await?;
        let url = self.session_ws_url(session, name)?;

        let _raw = RawModeGuard::new()?;
        let mut stdin_rx = terminal::stdin_reader(64);
        let mut resize_rx = terminal::resize_events();
        let mut stdout = std::io::stdout();

        let mut reconnector = Reconnector::new(Backoff::LIVE, TokioScheduler);
        let mut probe = WsProbe { url: url.to_string() };
        loop {
            let ws = reconnector.run(&mut probe, &cancel).await?;
            tracing::debug!(%url, "attached");
            let initial = terminal::terminal_size();
            let end = tokio::select! {
                end = streaming_loop(ws, initial, &mut stdin_rx, &mut resize_rx, &mut stdout) => end,
                _ = cancel.cancelled() => return Err(ReconnectError::Cancelled.into()),
            };
            match end {
                LoopEnd::Exited(code) => {
                    let _ = write!(stdout, "\r\n[agent exited with code {code}]\r\n");
                    let _ = stdout.flush();
                    return Ok(Some(code));
                }
                LoopEnd::StdinClosed => return Ok(None),
                LoopEnd::SessionClosed => {
                    let _ = write!(stdout, "\r\n[session closed]\r\n");
                    let _ = stdout.flush();
                    return Ok(None);
                }
                LoopEnd::Disconnected => {
                    tracing::warn!("connection lost, reconnecting");
                    reconnector.reset();
                }
            }
        }
    }
}

async fn check_status(resp: reqwest::Response) -> Result<reqwest::Response, ClientError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let message = resp
        .json::<serde_json::Value>()
        .await
        .ok()
        .and_then(|v| v.pointer("/error/message").and_then(|m| m.as_str()).map(str::to_string))
        .unwrap_or_else(|| status.canonical_reason().unwrap_or("request failed").to_string());
    Err(ClientError::Status { status, message })
}

struct HealthProbe<'a> {
    client: &'a Client,
}

#[async_trait]
impl Probe for HealthProbe<'_> {
    type Output = ();
    type Error = ClientError;

    async fn attempt(&mut self) -> Result<(), ClientError> {
        self.client.health().await
    }
}

struct WsProbe {
    url: String,
}

#[async_trait]
impl Probe for WsProbe {
    type Output = WsStream;
    type Error = tungstenite::Error;

    async fn attempt(&mut self) -> Result<WsStream, tungstenite::Error> {
        let (ws, _) = tokio_tungstenite::connect_async(self.url.as_str()).await?;
        Ok(ws)
    }

    /// The server answered the upgrade with a 4xx: the session is gone,
    /// closed, or refuses us. Asking again gets the same answer.
    fn is_fatal(&self, error: &tungstenite::Error) -> bool {
        matches!(error, tungstenite::Error::Http(resp) if resp.status().is_client_error())
    }
}

/// Proxy one connection until it ends.
///
/// Sends the current terminal size first so the agent renders at the
/// right dimensions after every reconnect.
pub async fn streaming_loop<S, W>(
    mut ws: S,
    initial: Option<TerminalDims>,
    stdin_rx: &mut mpsc::Receiver<Bytes>,
    resize_rx: &mut mpsc::Receiver<TerminalDims>,
    out: &mut W,
) -> LoopEnd
where
    S: Stream<Item = Result<Message, tungstenite::Error>> + Sink<Message, Error = tungstenite::Error> + Unpin,
    W: Write,
{
    if let Some(TerminalDims { rows, cols }) = initial {
        if send_frame(&mut ws, BinaryFrame::Resize { rows, cols }).await.is_err() {
            return LoopEnd::Disconnected;
        }
    }

    let end = loop {
        tokio::select! {
            data = stdin_rx.recv() => match data {
                Some(data) => {
                    if send_frame(&mut ws, BinaryFrame::Input(data)).await.is_err() {
                        break LoopEnd::Disconnected;
                    }
                }
                None => break LoopEnd::StdinClosed,
            },

            dims = resize_rx.recv() => {
                if let Some(TerminalDims { rows, cols }) = dims {
                    if send_frame(&mut ws, BinaryFrame::Resize { rows, cols }).await.is_err() {
                        break LoopEnd::Disconnected;
                    }
                }
            }

            msg = ws.next() => match msg {
                Some(Ok(Message::Binary(data))) => {
                    if out.write_all(&data).and_then(|_| out.flush()).is_err() {
                        break LoopEnd::StdinClosed;
                    }
                }
                Some(Ok(Message::Text(text))) => {
                    if let Ok(ServerMessage::Exit { code, .. }) = serde_json::from_str(text.as_str()) {
                        break LoopEnd::Exited(code);
                    }
                }
                Some(Ok(Message::Close(frame))) => {
                    tracing::debug!(?frame, "server closed the connection");
                    if frame.is_some_and(|f| u16::from(f.code) == SESSION_CLOSED_CODE) {
                        break LoopEnd::SessionClosed;
                    }
                    break LoopEnd::Disconnected;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    tracing::debug!(error = %e, "websocket error");
                    break LoopEnd::Disconnected;
                }
                None => break LoopEnd::Disconnected,
            },
        }
    };

    let _ = ws.close().await;
    end
}

async fn send_frame<S>(ws: &mut S, frame: BinaryFrame) -> Result<(), tungstenite::Error>
where
    S: Sink<Message, Error = tungstenite::Error> + Unpin,
{
    match frame.encode() {
        Ok(bytes) => ws.send(Message::Binary(bytes)).await,
        Err(e) => {
            tracing::debug!(error = %e, "dropping unencodable frame");
            Ok(())
        }
    }
}
