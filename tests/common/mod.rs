#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use ptyhub::agent::AgentProfile;
use ptyhub::api::{self, AppState};
use ptyhub::codec::BinaryFrame;
use ptyhub::config::Config;
use ptyhub::process::NativeLauncher;
use serde_json::Value;
use tempfile::TempDir;
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

pub type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub const STEP_TIMEOUT: Duration = Duration::from_secs(10);

/// `/bin/sh -c <script>` as an agent. Mode arguments land in `$0`, so the
/// script can tell a fresh start (`fresh`) from a resume (`resume`).
/// Validation accepts only the token `good`.
pub fn shell_profile(script: &str) -> AgentProfile {
    AgentProfile {
        program: "/bin/sh".into(),
        args: vec!["-c".into(), script.into()],
        fresh_args: vec!["fresh".into()],
        resume_args: vec!["resume".into()],
        validate_args: vec!["-c".into(), "test {token} = good".into()],
        yolo_args: Vec::new(),
        env: Default::default(),
        token_file: None,
    }
}

pub fn test_config(dir: &std::path::Path, script: &str) -> Config {
    let mut config = Config::default();
    config.sessions.workspace_root = dir.join("work");
    config.sessions.state_dir = dir.join("state");
    config.sessions.reap_interval_ms = 0;
    config.server.status_interval_ms = 0;
    config.process.default_agent = "sh".into();
    config.process.grace_period_ms = 500;
    config.process.validate_timeout_ms = 2_000;
    config.agents.clear();
    config.agents.insert("sh".into(), shell_profile(script));
    config
}

pub struct TestServer {
    pub addr: SocketAddr,
    pub state: AppState,
    pub dir: TempDir,
    stop_tx: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl TestServer {
    pub async fn start(script: &str) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path(), script);
        Self::start_with(config, dir).await
    }

    pub async fn start_with(config: Config, dir: TempDir) -> Self {
        let state = AppState::new(Arc::new(config), Arc::new(NativeLauncher));
        let app = api::router(state.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let handle = tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    stop_rx.await.ok();
                })
                .await
                .unwrap();
        });

        let server = Self {
            addr,
            state,
            dir,
            stop_tx: Some(stop_tx),
            handle: Some(handle),
        };
        server.wait_for_ready().await;
        server
    }

    pub fn http(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    pub fn ws_url(&self, path: &str) -> String {
        format!("ws://{}{}", self.addr, path)
    }

    async fn wait_for_ready(&self) {
        let client = reqwest::Client::new();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while tokio::time::Instant::now() < deadline {
            if let Ok(resp) = client.get(self.http("/health")).send().await {
                if resp.status().is_success() {
                    return;
                }
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("server did not become ready");
    }

    /// Open a session WebSocket as `name`.
    pub async fn viewer(&self, session: &str, name: &str) -> Ws {
        let url = self.ws_url(&format!("/sessions/{session}/ws?name={name}"));
        let (ws, _) = tokio::time::timeout(STEP_TIMEOUT, tokio_tungstenite::connect_async(url))
            .await
            .expect("connect timed out")
            .expect("connect failed");
        ws
    }

    pub async fn stop(mut self) {
        self.state.shutdown.shutdown();
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
        self.state.registry.drain().await;
    }
}

pub fn new_session_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Everything one viewer received, in arrival order.
#[derive(Debug, Default, Clone)]
pub struct Transcript {
    pub output: Vec<u8>,
    pub control: Vec<Value>,
}

impl Transcript {
    pub fn output_str(&self) -> String {
        String::from_utf8_lossy(&self.output).into_owned()
    }

    pub fn of_type(&self, ty: &str) -> Vec<&Value> {
        self.control.iter().filter(|v| v["type"] == ty).collect()
    }
}

/// Read until `done` returns true for a control message (inclusive).
pub async fn read_until<F>(ws: &mut Ws, mut done: F) -> Transcript
where
    F: FnMut(&Value) -> bool,
{
    let mut t = Transcript::default();
    loop {
        let msg = tokio::time::timeout(STEP_TIMEOUT, ws.next())
            .await
            .expect("timed out waiting for message")
            .expect("socket closed")
            .expect("socket error");
        match msg {
            Message::Binary(b) => t.output.extend_from_slice(&b),
            Message::Text(text) => {
                let v: Value = serde_json::from_str(text.as_str()).expect("control frames are JSON");
                let stop = done(&v);
                t.control.push(v);
                if stop {
                    return t;
                }
            }
            Message::Close(frame) => panic!("unexpected close: {frame:?}"),
            _ => {}
        }
    }
}

/// Read until PTY output contains `needle`.
pub async fn read_output_until(ws: &mut Ws, needle: &str) -> Transcript {
    let mut t = Transcript::default();
    loop {
        if t.output_str().contains(needle) {
            return t;
        }
        let msg = tokio::time::timeout(STEP_TIMEOUT, ws.next())
            .await
            .unwrap_or_else(|_| panic!("timed out waiting for {needle:?}; got {:?}", t.output_str()))
            .expect("socket closed")
            .expect("socket error");
        match msg {
            Message::Binary(b) => t.output.extend_from_slice(&b),
            Message::Text(text) => t.control.push(serde_json::from_str(text.as_str()).unwrap()),
            Message::Close(frame) => panic!("unexpected close: {frame:?}"),
            _ => {}
        }
    }
}

pub async fn read_until_exit(ws: &mut Ws) -> Transcript {
    read_until(ws, |v| v["type"] == "exit").await
}

pub async fn send_input(ws: &mut Ws, data: &[u8]) {
    let frame = BinaryFrame::Input(Bytes::copy_from_slice(data)).encode().unwrap();
    ws.send(Message::Binary(frame)).await.unwrap();
}

pub async fn send_json(ws: &mut Ws, value: Value) {
    ws.send(Message::Text(value.to_string().into())).await.unwrap();
}
