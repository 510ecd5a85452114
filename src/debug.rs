//! Relay between a browser preview and the agent inspecting it.
//!
//! Each debug channel has at most one browser sender and one agent
//! receiver. A newer connection on either side replaces the older one.
//!
//! - Browser → agent: telemetry events, tagged by `t`, stamped with a
//!   receipt time when they carry none, kept in a bounded backlog.
//! - Agent → browser: DOM queries. Only one may be pending; a new query
//!   supersedes the old one, and a result is only delivered when it
//!   answers the query that is currently pending.

use std::collections::{HashMap, VecDeque};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::{mpsc, oneshot};

use crate::broadcast::now_ms;

const LINK_QUEUE: usize = 256;

/// Telemetry discriminants accepted from the browser.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TelemetryKind {
    #[serde(rename = "load")]
    Load,
    #[serde(rename = "urlChange")]
    UrlChange,
    #[serde(rename = "navState")]
    NavState,
    #[serde(rename = "console")]
    Console,
    #[serde(rename = "error")]
    Error,
    #[serde(rename = "rejection")]
    Rejection,
    #[serde(rename = "network")]
    Network,
}

impl TelemetryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Load => "load",
            Self::UrlChange => "urlChange",
            Self::NavState => "navState",
            Self::Console => "console",
            Self::Error => "error",
            Self::Rejection => "rejection",
            Self::Network => "network",
        }
    }
}

impl FromStr for TelemetryKind {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "load" => Self::Load,
            "urlChange" => Self::UrlChange,
            "navState" => Self::NavState,
            "console" => Self::Console,
            "error" => Self::Error,
            "rejection" => Self::Rejection,
            "network" => Self::Network,
            _ => return Err(()),
        })
    }
}

/// A validated telemetry event. The body is relayed as received, plus `ts`.
#[derive(Debug, Clone, PartialEq)]
pub struct TelemetryEvent {
    pub kind: TelemetryKind,
    body: Map<String, Value>,
}

impl TelemetryEvent {
    /// Validate a browser event. Unknown kinds and malformed network
    /// events are rejected.
    pub fn from_value(value: Value) -> Option<Self> {
        let Value::Object(mut body) = value else {
            return None;
        };
        let kind: TelemetryKind = body.get("t")?.as_str()?.parse().ok()?;
        if kind == TelemetryKind::Network {
            let numeric_or_absent = |k: &str| body.get(k).map_or(true, Value::is_number);
            if !numeric_or_absent("duration") || !numeric_or_absent("status") {
                return None;
            }
        }
        if !body.get("ts").is_some_and(Value::is_number) {
            body.insert("ts".into(), Value::from(now_ms()));
        }
        Some(Self { kind, body })
    }

    pub fn ts(&self) -> u64 {
        self.body.get("ts").and_then(Value::as_u64).unwrap_or(0)
    }

    pub fn duration(&self) -> Option<f64> {
        self.body.get("duration").and_then(Value::as_f64)
    }

    pub fn status(&self) -> Option<u64> {
        self.body.get("status").and_then(Value::as_u64)
    }

    pub fn to_value(&self) -> Value {
        Value::Object(self.body.clone())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

/// Browser's answer to a DOM query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomQueryResult {
    pub id: String,
    pub found: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub html: Option<String>,
    #[serde(default)]
    pub visible: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rect: Option<BoundingBox>,
}

/// Messages the agent side may send.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "t")]
enum AgentMessage {
    #[serde(rename = "query")]
    Query {
        #[serde(default)]
        id: Option<String>,
        selector: String,
    },
}

/// Messages written to either side.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "t")]
enum RelayMessage<'a> {
    #[serde(rename = "query")]
    Query { id: &'a str, selector: &'a str },
    #[serde(rename = "queryResult")]
    QueryResult(&'a DomQueryResult),
    #[serde(rename = "querySuperseded")]
    QuerySuperseded { id: &'a str },
}

impl RelayMessage<'_> {
    fn to_text(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| String::from("{}"))
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum DebugError {
    #[error("no browser connected to debug channel")]
    NoBrowser,
    #[error("query superseded by a newer one")]
    Superseded,
    #[error("query timed out")]
    Timeout,
}

enum QueryOutcome {
    Answered(DomQueryResult),
    Superseded,
}

struct PendingQuery {
    id: String,
    selector: String,
    waiter: Option<oneshot::Sender<QueryOutcome>>,
}

struct Endpoint {
    conn: u64,
    tx: mpsc::Sender<String>,
}

struct ChannelInner {
    browser: Option<Endpoint>,
    agent: Option<Endpoint>,
    backlog: VecDeque<TelemetryEvent>,
    pending: Option<PendingQuery>,
    next_conn: u64,
    next_query: u64,
}

/// One side's connection: outgoing text frames plus the id used to
/// disconnect without clobbering a newer replacement.
pub struct Link {
    pub conn: u64,
    pub rx: mpsc::Receiver<String>,
}

pub struct DebugChannel {
    pub id: String,
    backlog_limit: usize,
    inner: Mutex<ChannelInner>,
}

fn send(endpoint: &Option<Endpoint>, text: String) {
    if let Some(ep) = endpoint {
        if ep.tx.try_send(text).is_err() {
            tracing::debug!(conn = ep.conn, "debug link queue unavailable, dropping message");
        }
    }
}

impl DebugChannel {
    fn new(id: String, backlog_limit: usize) -> Self {
        Self {
            id,
            backlog_limit,
            inner: Mutex::new(ChannelInner {
                browser: None,
                agent: None,
                backlog: VecDeque::new(),
                pending: None,
                next_conn: 1,
                next_query: 1,
            }),
        }
    }

    pub fn connect_browser(&self) -> Link {
        let (tx, rx) = mpsc::channel(LINK_QUEUE);
        let mut inner = self.inner.lock();
        let conn = inner.next_conn;
        inner.next_conn += 1;
        if let Some(p) = &inner.pending {
            let _ = tx.try_send(RelayMessage::Query { id: &p.id, selector: &p.selector }.to_text());
        }
        if inner.browser.replace(Endpoint { conn, tx }).is_some() {
            tracing::info!(channel = %self.id, "browser sender replaced");
        }
        Link { conn, rx }
    }

    /// Connect the agent side. The backlog is queued first.
    pub fn connect_agent(&self) -> Link {
        let (tx, rx) = mpsc::channel(LINK_QUEUE.max(self.backlog_limit + 16));
        let mut inner = self.inner.lock();
        let conn = inner.next_conn;
        inner.next_conn += 1;
        for event in &inner.backlog {
            let _ = tx.try_send(event.to_value().to_string());
        }
        if inner.agent.replace(Endpoint { conn, tx }).is_some() {
            tracing::info!(channel = %self.id, "agent receiver replaced");
        }
        Link { conn, rx }
    }

    pub fn disconnect_browser(&self, conn: u64) {
        let mut inner = self.inner.lock();
        if inner.browser.as_ref().is_some_and(|b| b.conn == conn) {
            inner.browser = None;
        }
    }

    pub fn disconnect_agent(&self, conn: u64) {
        let mut inner = self.inner.lock();
        if inner.agent.as_ref().is_some_and(|a| a.conn == conn) {
            inner.agent = None;
        }
    }

    pub fn is_idle(&self) -> bool {
        let inner = self.inner.lock();
        inner.browser.is_none() && inner.agent.is_none() && inner.pending.is_none()
    }

    pub fn backlog(&self) -> Vec<Value> {
        self.inner.lock().backlog.iter().map(TelemetryEvent::to_value).collect()
    }

    /// Handle a text frame from the browser. Anything unrecognized is dropped.
    pub fn ingest_browser(&self, text: &str) {
        let Ok(value) = serde_json::from_str::<Value>(text) else {
            tracing::trace!(channel = %self.id, "dropping undecodable browser frame");
            return;
        };
        if value.get("t").and_then(Value::as_str) == Some("queryResult") {
            match serde_json::from_value::<DomQueryResult>(value) {
                Ok(result) => self.deliver_result(result),
                Err(e) => tracing::debug!(channel = %self.id, error = %e, "malformed query result"),
            }
            return;
        }
        let Some(event) = TelemetryEvent::from_value(value) else {
            tracing::trace!(channel = %self.id, "dropping unknown telemetry");
            return;
        };
        let mut inner = self.inner.lock();
        send(&inner.agent, event.to_value().to_string());
        if self.backlog_limit > 0 {
            if inner.backlog.len() >= self.backlog_limit {
                inner.backlog.pop_front();
            }
            inner.backlog.push_back(event);
        }
    }

    fn deliver_result(&self, result: DomQueryResult) {
        let mut inner = self.inner.lock();
        if !inner.pending.as_ref().is_some_and(|p| p.id == result.id) {
            tracing::debug!(channel = %self.id, query = %result.id, "dropping result for stale query");
            return;
        }
        let Some(pending) = inner.pending.take() else {
            return;
        };
        match pending.waiter {
            Some(waiter) => {
                let _ = waiter.send(QueryOutcome::Answered(result));
            }
            None => send(&inner.agent, RelayMessage::QueryResult(&result).to_text()),
        }
    }

    /// Handle a text frame from the agent.
    pub fn ingest_agent(&self, text: &str) {
        match serde_json::from_str::<AgentMessage>(text) {
            Ok(AgentMessage::Query { id, selector }) => {
                self.submit_query(id, selector, None);
            }
            Err(e) => tracing::trace!(channel = %self.id, error = %e, "dropping agent frame"),
        }
    }

    fn submit_query(&self, id: Option<String>, selector: String, waiter: Option<oneshot::Sender<QueryOutcome>>) -> String {
        let mut inner = self.inner.lock();
        let id = id.unwrap_or_else(|| {
            let n = inner.next_query;
            inner.next_query += 1;
            format!("q{n}")
        });
        if let Some(old) = inner.pending.take() {
            tracing::debug!(channel = %self.id, old = %old.id, new = %id, "query superseded");
            match old.waiter {
                Some(w) => {
                    let _ = w.send(QueryOutcome::Superseded);
                }
                None => send(&inner.agent, RelayMessage::QuerySuperseded { id: &old.id }.to_text()),
            }
        }
        send(&inner.browser, RelayMessage::Query { id: &id, selector: &selector }.to_text());
        inner.pending = Some(PendingQuery { id: id.clone(), selector, waiter });
        id
    }

    /// Run one query on behalf of an HTTP caller.
    pub async fn query(&self, selector: String, timeout: Duration) -> Result<DomQueryResult, DebugError> {
        if self.inner.lock().browser.is_none() {
            return Err(DebugError::NoBrowser);
        }
        let (tx, rx) = oneshot::channel();
        let id = self.submit_query(None, selector, Some(tx));
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(QueryOutcome::Answered(result))) => Ok(result),
            Ok(Ok(QueryOutcome::Superseded)) | Ok(Err(_)) => Err(DebugError::Superseded),
            Err(_) => {
                let mut inner = self.inner.lock();
                if inner.pending.as_ref().is_some_and(|p| p.id == id) {
                    inner.pending = None;
                }
                Err(DebugError::Timeout)
            }
        }
    }
}

/// All debug channels, keyed by their own identifier.
pub struct DebugHub {
    channels: Mutex<HashMap<String, Arc<DebugChannel>>>,
    backlog_limit: usize,
}

impl DebugHub {
    pub fn new(backlog_limit: usize) -> Self {
        Self {
            channels: Mutex::new(HashMap::new()),
            backlog_limit,
        }
    }

    pub fn channel(&self, id: &str) -> Arc<DebugChannel> {
        self.channels
            .lock()
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(DebugChannel::new(id.to_string(), self.backlog_limit)))
            .clone()
    }

    pub fn get(&self, id: &str) -> Option<Arc<DebugChannel>> {
        self.channels.lock().get(id).cloned()
    }

    /// Drop the channel once both ends are gone.
    pub fn release(&self, id: &str) {
        let mut channels = self.channels.lock();
        if channels.get(id).is_some_and(|c| c.is_idle()) {
            channels.remove(id);
            tracing::debug!(channel = id, "debug channel released");
        }
    }

    pub fn len(&self) -> usize {
        self.channels.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
