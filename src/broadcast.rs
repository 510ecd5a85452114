//! Per-session fan-out of PTY output and control events.
//!
//! Every viewer owns a bounded queue. Publishing walks the viewer list under
//! one lock with `try_send`, so:
//!
//! - all viewers observe items in the same order they were published,
//! - publishing never waits on a viewer,
//! - a viewer whose queue is full is kicked (its cancellation token fires)
//!   and removed; the others are unaffected.
//!
//! Recent PTY output is kept in a bounded history. A new subscriber gets the
//! history as its first item, taken under the same lock that registers it,
//! so it sees no gap and no duplicate between replay and live output.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::codec::ServerMessage;

/// Milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// One item in a viewer's outbound queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// Raw PTY output, sent as a binary frame.
    Output(Bytes),
    /// Serialized control message, sent as a text frame.
    Text(Arc<str>),
}

impl Outbound {
    pub fn control(msg: &ServerMessage) -> Self {
        Self::Text(Arc::from(msg.to_text()))
    }
}

pub type ViewerId = u64;

/// Identity and transient state of one attached viewer.
#[derive(Debug)]
pub struct ViewerInfo {
    pub id: ViewerId,
    pub display_name: Option<String>,
    pub connected_at: u64,
    last_ping: AtomicU64,
}

impl ViewerInfo {
    pub fn touch_ping(&self) {
        self.last_ping.store(now_ms(), Ordering::Release);
    }

    /// Milliseconds timestamp of the last ping, 0 if none yet.
    pub fn last_ping(&self) -> u64 {
        self.last_ping.load(Ordering::Acquire)
    }
}

struct ViewerSlot {
    info: Arc<ViewerInfo>,
    tx: mpsc::Sender<Outbound>,
    kicked: CancellationToken,
}

struct Inner {
    viewers: Vec<ViewerSlot>,
    history: VecDeque<Bytes>,
    history_bytes: usize,
    next_id: ViewerId,
    closed: bool,
}

/// Receiving side handed to a newly attached viewer.
pub struct Subscription {
    pub info: Arc<ViewerInfo>,
    pub rx: mpsc::Receiver<Outbound>,
    /// Sender for direct replies (pong, upload results) to this viewer only.
    pub tx: mpsc::Sender<Outbound>,
    /// Fires when the broadcaster drops this viewer.
    pub kicked: CancellationToken,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscribeError {
    Closed,
    Full { max: usize },
}

pub struct Broadcaster {
    inner: Mutex<Inner>,
    queue_capacity: usize,
    replay_limit: usize,
    max_viewers: usize,
}

impl Broadcaster {
    pub fn new(queue_capacity: usize, replay_limit: usize, max_viewers: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                viewers: Vec::new(),
                history: VecDeque::new(),
                history_bytes: 0,
                next_id: 1,
                closed: false,
            }),
            queue_capacity: queue_capacity.max(1),
            replay_limit,
            max_viewers,
        }
    }

    /// Register a viewer, seeding its queue with the output history.
    pub fn subscribe(&self, display_name: Option<String>) -> Result<Subscription, SubscribeError> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(SubscribeError::Closed);
        }
        if inner.viewers.len() >= self.max_viewers {
            return Err(SubscribeError::Full { max: self.max_viewers });
        }

        let id = inner.next_id;
        inner.next_id += 1;
        let info = Arc::new(ViewerInfo {
            id,
            display_name,
            connected_at: now_ms(),
            last_ping: AtomicU64::new(0),
        });
        let (tx, rx) = mpsc::channel(self.queue_capacity);

        if !inner.history.is_empty() {
            let mut replay = BytesMut::with_capacity(inner.history_bytes);
            for chunk in &inner.history {
                replay.extend_from_slice(chunk);
            }
            // Fresh queue with capacity >= 1, cannot be full.
            let _ = tx.try_send(Outbound::Output(replay.freeze()));
        }

        let kicked = CancellationToken::new();
        inner.viewers.push(ViewerSlot {
            info: info.clone(),
            tx: tx.clone(),
            kicked: kicked.clone(),
        });
        Ok(Subscription { info, rx, tx, kicked })
    }

    /// Remove a viewer. Returns false if it was already gone.
    pub fn unsubscribe(&self, id: ViewerId) -> bool {
        let mut inner = self.inner.lock();
        let before = inner.viewers.len();
        inner.viewers.retain(|v| v.info.id != id);
        inner.viewers.len() != before
    }

    /// Publish PTY output to every viewer and record it for replay.
    pub fn publish_output(&self, data: Bytes) {
        if data.is_empty() {
            return;
        }
        let mut inner = self.inner.lock();
        if self.replay_limit > 0 {
            inner.history_bytes += data.len();
            inner.history.push_back(data.clone());
            while inner.history_bytes > self.replay_limit {
                match inner.history.pop_front() {
                    Some(old) => inner.history_bytes -= old.len(),
                    None => break,
                }
            }
        }
        Self::fan_out(&mut inner, Outbound::Output(data));
    }

    /// Publish a control message to every viewer.
    pub fn publish(&self, msg: &ServerMessage) {
        let item = Outbound::control(msg);
        let mut inner = self.inner.lock();
        Self::fan_out(&mut inner, item);
    }

    fn fan_out(inner: &mut Inner, item: Outbound) {
        inner.viewers.retain(|viewer| match viewer.tx.try_send(item.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!(viewer = viewer.info.id, "viewer queue full, disconnecting lagging viewer");
                viewer.kicked.cancel();
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::debug!(viewer = viewer.info.id, "viewer queue closed");
                false
            }
        });
    }

    pub fn viewer_count(&self) -> usize {
        self.inner.lock().viewers.len()
    }

    /// Kick every viewer and refuse new subscriptions.
    pub fn close(&self) {
        let mut inner = self.inner.lock();
        inner.closed = true;
        for viewer in inner.viewers.drain(..) {
            viewer.kicked.cancel();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }
}
