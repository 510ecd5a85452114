use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::{broadcast as tokio_broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::broadcast::{Outbound, SubscribeError, ViewerInfo};
use crate::config::Config;
use crate::persist::RecordStore;
use crate::process::{ProcessLauncher, ProcessState};
use crate::session::{Inbound, Session, SessionError, SessionMeta, SessionSettings, ViewerContext};

/// Closed ids remembered so a straggling reconnect cannot recreate them.
const CLOSED_IDS_KEPT: usize = 1024;

/// Storage for live sessions, keyed by id.
pub trait SessionStore: Send + Sync + 'static {
    fn get(&self, id: &Uuid) -> Option<Arc<Session>>;
    /// Insert `session`. Returns false if the id is already present.
    fn insert(&self, session: Arc<Session>) -> bool;
    fn remove(&self, id: &Uuid) -> Option<Arc<Session>>;
    fn list(&self) -> Vec<Arc<Session>>;
}

#[derive(Default)]
pub struct InMemorySessionStore {
    sessions: RwLock<HashMap<Uuid, Arc<Session>>>,
}

impl SessionStore for InMemorySessionStore {
    fn get(&self, id: &Uuid) -> Option<Arc<Session>> {
        self.sessions.read().get(id).cloned()
    }

    fn insert(&self, session: Arc<Session>) -> bool {
        let mut sessions = self.sessions.write();
        if sessions.contains_key(&session.id) {
            return false;
        }
        sessions.insert(session.id, session);
        true
    }

    fn remove(&self, id: &Uuid) -> Option<Arc<Session>> {
        self.sessions.write().remove(id)
    }

    fn list(&self) -> Vec<Arc<Session>> {
        self.sessions.read().values().cloned().collect()
    }
}

/// What a viewer supplies when attaching.
#[derive(Debug, Clone, Default)]
pub struct ViewerMeta {
    pub display_name: Option<String>,
    /// Agent profile for a newly created session. Ignored for existing ones.
    pub agent: Option<String>,
}

/// Server-level session lifecycle events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Created { id: Uuid },
    Destroyed { id: Uuid },
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("session not found: {0}")]
    NotFound(String),
    #[error("attach refused: {0}")]
    Forbidden(String),
    #[error("unknown agent: {0}")]
    UnknownAgent(String),
    #[error("session was closed: {0}")]
    Closed(String),
    #[error("failed to prepare working directory {0}: {1}")]
    Workspace(PathBuf, #[source] std::io::Error),
    #[error(transparent)]
    Session(#[from] SessionError),
}

/// Summary returned by [`SessionRegistry::list`].
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub id: Uuid,
    pub name: String,
    pub agent: String,
    pub cwd: String,
    pub viewers: usize,
    pub state: &'static str,
    pub yolo: bool,
}

struct RegistryInner {
    store: Box<dyn SessionStore>,
    config: Arc<Config>,
    settings: Arc<SessionSettings>,
    launcher: Arc<dyn ProcessLauncher>,
    records: RecordStore,
    /// Serializes get-or-create so two first attaches make one session.
    create_lock: tokio::sync::Mutex<()>,
    events_tx: tokio_broadcast::Sender<SessionEvent>,
    draining: AtomicBool,
    closed: Mutex<VecDeque<Uuid>>,
}

/// Maps session ids to live sessions and their viewers.
#[derive(Clone)]
pub struct SessionRegistry {
    inner: Arc<RegistryInner>,
}

impl SessionRegistry {
    pub fn new(config: Arc<Config>, launcher: Arc<dyn ProcessLauncher>) -> Self {
        Self::with_store(config, launcher, Box::new(InMemorySessionStore::default()))
    }

    pub fn with_store(config: Arc<Config>, launcher: Arc<dyn ProcessLauncher>, store: Box<dyn SessionStore>) -> Self {
        let (events_tx, _) = tokio_broadcast::channel(64);
        Self {
            inner: Arc::new(RegistryInner {
                store,
                settings: Arc::new(SessionSettings::from_config(&config)),
                records: RecordStore::new(config.sessions.state_dir.clone()),
                config,
                launcher,
                create_lock: tokio::sync::Mutex::new(()),
                events_tx,
                draining: AtomicBool::new(false),
                closed: Mutex::new(VecDeque::new()),
            }),
        }
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn get(&self, id: &Uuid) -> Option<Arc<Session>> {
        self.inner.store.get(id)
    }

    pub fn len(&self) -> usize {
        self.inner.store.list().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// True once [`drain`](Self::drain) has begun.
    pub fn is_draining(&self) -> bool {
        self.inner.draining.load(Ordering::Acquire)
    }

    /// True if `id` was explicitly closed on this server.
    pub fn was_closed(&self, id: &Uuid) -> bool {
        self.inner.closed.lock().contains(id)
    }

    fn remember_closed(&self, id: Uuid) {
        let mut closed = self.inner.closed.lock();
        if closed.len() >= CLOSED_IDS_KEPT {
            closed.pop_front();
        }
        closed.push_back(id);
    }

    pub fn subscribe_events(&self) -> tokio_broadcast::Receiver<SessionEvent> {
        self.inner.events_tx.subscribe()
    }

    pub fn list(&self) -> Vec<SessionInfo> {
        let mut out: Vec<SessionInfo> = self
            .inner
            .store
            .list()
            .into_iter()
            .map(|s| {
                let meta = s.meta();
                SessionInfo {
                    id: s.id,
                    name: meta.name,
                    agent: meta.agent,
                    cwd: meta.cwd.display().to_string(),
                    viewers: s.viewer_count(),
                    state: s.state().as_str(),
                    yolo: meta.yolo,
                }
            })
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));
        out
    }

    /// Attach a viewer, creating the session on first use.
    ///
    /// An idle or exited session starts its process in the background.
    pub async fn attach(&self, id: &str, meta: ViewerMeta) -> Result<ViewerHandle, RegistryError> {
        let id = Uuid::parse_str(id).map_err(|_| RegistryError::NotFound(id.to_string()))?;
        if self.is_draining() {
            return Err(RegistryError::Forbidden("server is shutting down".into()));
        }
        if self.was_closed(&id) {
            return Err(RegistryError::Closed(id.to_string()));
        }

        let session = match self.inner.store.get(&id) {
            Some(s) => s,
            None => {
                let _guard = self.inner.create_lock.lock().await;
                match self.inner.store.get(&id) {
                    Some(s) => s,
                    None if self.was_closed(&id) => return Err(RegistryError::Closed(id.to_string())),
                    None => self.create(id, &meta).await?,
                }
            }
        };

        let sub = session.subscribe(meta.display_name).map_err(|e| match e {
            SubscribeError::Closed => RegistryError::Forbidden("session is closing".into()),
            SubscribeError::Full { max } => RegistryError::Forbidden(format!("session has {max} viewers")),
        })?;
        session.publish_status();

        if session.state().can_start() {
            let starting = session.clone();
            tokio::spawn(async move {
                if let Err(e) = starting.start().await {
                    tracing::debug!(session = %starting.id, error = %e, "start on attach not applied");
                }
            });
        }

        let ctx = ViewerContext::new(sub.info.clone(), sub.tx, self.inner.config.uploads.max_bytes + 64 * 1024);
        Ok(ViewerHandle {
            session,
            ctx,
            rx: sub.rx,
            kicked: sub.kicked,
        })
    }

    async fn create(&self, id: Uuid, viewer: &ViewerMeta) -> Result<Arc<Session>, RegistryError> {
        let record = self.inner.records.load(&id).await;
        if record.is_none() && !self.inner.config.sessions.auto_create {
            return Err(RegistryError::NotFound(id.to_string()));
        }

        let requested = record.as_ref().map(|r| r.agent.as_str()).or(viewer.agent.as_deref());
        let (agent, profile) = self
            .inner
            .config
            .agent(requested)
            .ok_or_else(|| RegistryError::UnknownAgent(requested.unwrap_or_default().to_string()))?;

        let meta = match record {
            Some(r) => SessionMeta {
                name: r.name,
                cwd: r.cwd,
                agent: agent.to_string(),
                yolo: r.yolo,
                resume_token: r.resume_token,
            },
            None => SessionMeta {
                name: id.simple().to_string()[..8].to_string(),
                cwd: self.inner.config.sessions.workspace_root.join(id.to_string()),
                agent: agent.to_string(),
                yolo: false,
                resume_token: None,
            },
        };
        tokio::fs::create_dir_all(&meta.cwd)
            .await
            .map_err(|e| RegistryError::Workspace(meta.cwd.clone(), e))?;

        let session = Session::new(
            id,
            meta,
            profile.clone(),
            self.inner.launcher.clone(),
            self.inner.settings.clone(),
            Some(self.inner.records.clone()),
        );
        if let Err(e) = self.inner.records.save(&session.record()).await {
            tracing::warn!(session = %id, error = %e, "failed to persist new session record");
        }
        session.refresh_ports().await;
        session.spawn_status_ticker();
        self.inner.store.insert(session.clone());
        tracing::info!(session = %id, agent, "session created");
        let _ = self.inner.events_tx.send(SessionEvent::Created { id });
        Ok(session)
    }

    pub async fn route_input(&self, id: &Uuid, data: Bytes) -> Result<(), RegistryError> {
        let session = self
            .inner
            .store
            .get(id)
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;
        session.route_input(data).await?;
        Ok(())
    }

    /// Close a session for good and forget its record.
    pub async fn close(&self, id: &Uuid) -> Result<(), RegistryError> {
        let session = {
            // Shares the create lock so no attach recreates the id in between.
            let _guard = self.inner.create_lock.lock().await;
            let session = self
                .inner
                .store
                .remove(id)
                .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;
            self.remember_closed(*id);
            session
        };
        session.close().await;
        self.inner.records.remove(id).await;
        let _ = self.inner.events_tx.send(SessionEvent::Destroyed { id: *id });
        Ok(())
    }

    /// Close every session, keeping records so they can be resumed after a
    /// restart. New attaches are refused from here on.
    pub async fn drain(&self) {
        self.inner.draining.store(true, Ordering::Release);
        let sessions = self.inner.store.list();
        let closes = sessions.into_iter().map(|s| {
            let registry = self.clone();
            async move {
                registry.inner.store.remove(&s.id);
                s.close().await;
                let _ = registry.inner.events_tx.send(SessionEvent::Destroyed { id: s.id });
            }
        });
        futures::future::join_all(closes).await;
    }

    /// Close sessions whose working directory has been removed.
    pub async fn reap_once(&self) -> Vec<Uuid> {
        let mut reaped = Vec::new();
        for session in self.inner.store.list() {
            let cwd = session.meta().cwd;
            if tokio::fs::metadata(&cwd).await.is_err() {
                tracing::info!(session = %session.id, cwd = %cwd.display(), "working directory gone, closing session");
                if self.close(&session.id).await.is_ok() {
                    reaped.push(session.id);
                }
            }
        }
        reaped
    }

    pub fn spawn_reaper(&self, interval: Duration, cancel: CancellationToken) -> Option<tokio::task::JoinHandle<()>> {
        if interval.is_zero() {
            return None;
        }
        let registry = self.clone();
        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => { registry.reap_once().await; }
                    _ = cancel.cancelled() => break,
                }
            }
        }))
    }
}

/// One attached viewer. Dropping it detaches.
pub struct ViewerHandle {
    session: Arc<Session>,
    ctx: ViewerContext,
    /// Items to send to this viewer, in broadcast order.
    pub rx: mpsc::Receiver<Outbound>,
    kicked: CancellationToken,
}

impl ViewerHandle {
    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    pub fn info(&self) -> &Arc<ViewerInfo> {
        &self.ctx.info
    }

    /// Fires when the broadcaster drops this viewer (lagging or closing).
    pub fn kicked(&self) -> CancellationToken {
        self.kicked.clone()
    }

    pub async fn dispatch(&mut self, frame: Inbound) {
        self.session.dispatch(&mut self.ctx, frame).await;
    }

    pub fn state(&self) -> ProcessState {
        self.session.state()
    }
}

impl Drop for ViewerHandle {
    fn drop(&mut self) {
        self.session.detach(self.ctx.info.id);
    }
}
