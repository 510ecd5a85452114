use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use uuid::Uuid;

use crate::agent::{new_token, AgentProfile};
use crate::broadcast::{now_ms, Broadcaster, Outbound, SubscribeError, Subscription, ViewerId, ViewerInfo};
use crate::codec::{
    BinaryFrame, ChunkAssembler, ClientMessage, LaunchMode, ProcessStatus, ServerMessage, SessionSummary,
    StatusSnapshot, TerminalDims,
};
use crate::config::Config;
use crate::persist::{RecordStore, SessionRecord};
use crate::process::{ProcessHandle, ProcessLauncher, ProcessSignaller, ProcessState, PtyResizer};
use crate::pty::PtyError;
use crate::upload::{save_upload, UploadError};
use crate::worktree;

const MAX_NAME_LEN: usize = 128;
const WORKTREE_TIMEOUT: Duration = Duration::from_secs(2);

/// Per-session tunables, resolved once from [`Config`].
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub viewer_queue: usize,
    pub replay_bytes: usize,
    pub max_viewers: usize,
    pub pending_input: usize,
    pub status_interval: Duration,
    pub validate_timeout: Duration,
    pub spawn_timeout: Duration,
    pub grace_period: Duration,
    pub worktree_base: String,
    pub ignored_ports: Vec<u16>,
    pub uploads_dir: PathBuf,
    pub upload_max_bytes: usize,
    pub default_rows: u16,
    pub default_cols: u16,
}

impl SessionSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            viewer_queue: config.server.viewer_queue,
            replay_bytes: config.server.replay_bytes,
            max_viewers: config.server.max_viewers,
            pending_input: config.server.pending_input,
            status_interval: config.server.status_interval(),
            validate_timeout: config.process.validate_timeout(),
            spawn_timeout: config.process.spawn_timeout(),
            grace_period: config.process.grace_period(),
            worktree_base: config.process.worktree_base.clone(),
            ignored_ports: config.server.ignored_ports.clone(),
            uploads_dir: config.uploads.dir.clone(),
            upload_max_bytes: config.uploads.max_bytes,
            default_rows: config.process.default_rows,
            default_cols: config.process.default_cols,
        }
    }
}

/// Mutable, last-write-wins session metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionMeta {
    pub name: String,
    pub cwd: PathBuf,
    pub agent: String,
    pub yolo: bool,
    pub resume_token: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("session is closing")]
    Closing,
    #[error("a process transition is already in progress")]
    Busy,
    #[error("failed to start process: {0}")]
    Spawn(#[from] PtyError),
    #[error("process spawn timed out after {0:?}")]
    SpawnTimeout(Duration),
    #[error("spawn task failed: {0}")]
    SpawnTask(String),
}

struct Slot {
    state: ProcessState,
    handle: Option<ProcessHandle>,
    pending: VecDeque<Bytes>,
    /// Bumped on every claimed start; stale completions compare against it.
    generation: u64,
}

/// One PTY-bound process slot plus everyone watching it.
pub struct Session {
    pub id: Uuid,
    meta: RwLock<SessionMeta>,
    size: Mutex<TerminalDims>,
    /// Kept outside `slot` so a resize never waits on a transition.
    resizer: Mutex<Option<PtyResizer>>,
    broadcaster: Arc<Broadcaster>,
    slot: tokio::sync::Mutex<Slot>,
    state_tx: watch::Sender<ProcessState>,
    ports: Mutex<Vec<u16>>,
    profile: AgentProfile,
    launcher: Arc<dyn ProcessLauncher>,
    settings: Arc<SessionSettings>,
    records: Option<RecordStore>,
    closing: CancellationToken,
    inflight: TaskTracker,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("name", &self.meta.read().name)
            .field("state", &*self.state_tx.borrow())
            .finish_non_exhaustive()
    }
}

impl Session {
    pub fn new(
        id: Uuid,
        meta: SessionMeta,
        profile: AgentProfile,
        launcher: Arc<dyn ProcessLauncher>,
        settings: Arc<SessionSettings>,
        records: Option<RecordStore>,
    ) -> Arc<Self> {
        let (state_tx, _) = watch::channel(ProcessState::Idle);
        Arc::new(Self {
            id,
            meta: RwLock::new(meta),
            size: Mutex::new(TerminalDims {
                rows: settings.default_rows,
                cols: settings.default_cols,
            }),
            resizer: Mutex::new(None),
            broadcaster: Arc::new(Broadcaster::new(
                settings.viewer_queue,
                settings.replay_bytes,
                settings.max_viewers,
            )),
            slot: tokio::sync::Mutex::new(Slot {
                state: ProcessState::Idle,
                handle: None,
                pending: VecDeque::new(),
                generation: 0,
            }),
            state_tx,
            ports: Mutex::new(Vec::new()),
            profile,
            launcher,
            settings,
            records,
            closing: CancellationToken::new(),
            inflight: TaskTracker::new(),
        })
    }

    // ── Accessors ──────────────────────────────────────────────────

    pub fn meta(&self) -> SessionMeta {
        self.meta.read().clone()
    }

    pub fn state(&self) -> ProcessState {
        self.state_tx.borrow().clone()
    }

    /// Watch process state transitions.
    pub fn watch_state(&self) -> watch::Receiver<ProcessState> {
        self.state_tx.subscribe()
    }

    pub fn viewer_count(&self) -> usize {
        self.broadcaster.viewer_count()
    }

    pub fn is_closing(&self) -> bool {
        self.closing.is_cancelled()
    }

    /// Fires when teardown begins.
    pub fn closing_token(&self) -> CancellationToken {
        self.closing.clone()
    }

    pub fn terminal_size(&self) -> TerminalDims {
        *self.size.lock()
    }

    pub fn status(&self) -> StatusSnapshot {
        let meta = self.meta.read().clone();
        let state = self.state();
        let (pid, started_at, exit_code) = match state {
            ProcessState::Running { pid, started_at } => (pid, Some(started_at), None),
            ProcessState::Exited { code } => (None, None, Some(code)),
            _ => (None, None, None),
        };
        StatusSnapshot {
            session: SessionSummary {
                id: self.id.to_string(),
                name: meta.name,
                agent: meta.agent,
                cwd: meta.cwd.display().to_string(),
            },
            terminal: self.terminal_size(),
            viewers: self.viewer_count(),
            yolo: meta.yolo,
            ports: self.ports.lock().clone(),
            process: ProcessStatus {
                state: state.as_str().to_string(),
                pid,
                exit_code,
                started_at,
            },
        }
    }

    pub fn publish_status(&self) {
        self.broadcaster.publish(&ServerMessage::Status(self.status()));
    }

    fn set_state(&self, slot: &mut Slot, state: ProcessState) {
        slot.state = state.clone();
        self.state_tx.send_replace(state);
    }

    // ── Viewers ────────────────────────────────────────────────────

    pub fn subscribe(&self, display_name: Option<String>) -> Result<Subscription, SubscribeError> {
        let sub = self.broadcaster.subscribe(display_name)?;
        tracing::info!(session = %self.id, viewer = sub.info.id, viewers = self.viewer_count(), "viewer attached");
        Ok(sub)
    }

    pub fn detach(&self, viewer: ViewerId) {
        if self.broadcaster.unsubscribe(viewer) {
            tracing::info!(session = %self.id, viewer, viewers = self.viewer_count(), "viewer detached");
            self.publish_status();
        }
    }

    // ── Process lifecycle ──────────────────────────────────────────

    /// Claim a start and run it to completion.
    ///
    /// `exec_start` goes out as soon as the claim succeeds, before the
    /// validation probe. A token that fails validation degrades to a fresh
    /// start announced with a second `exec_start`.
    pub async fn start(self: &Arc<Self>) -> Result<LaunchMode, SessionError> {
        let (generation, stored_token) = {
            let mut slot = self.slot.lock().await;
            if self.is_closing() {
                return Err(SessionError::Closing);
            }
            if !slot.state.can_start() {
                return Err(SessionError::Busy);
            }
            let token = self.meta.read().resume_token.clone();
            let next = if token.is_some() && self.profile.can_validate() {
                ProcessState::Validating
            } else {
                ProcessState::Starting
            };
            slot.generation += 1;
            self.set_state(&mut slot, next);
            (slot.generation, token)
        };

        let intended = if stored_token.is_some() { LaunchMode::Resume } else { LaunchMode::Fresh };
        self.broadcaster.publish(&ServerMessage::ExecStart { mode: intended });
        self.publish_status();

        let cwd = self.meta.read().cwd.clone();
        let (mode, token) = match stored_token {
            Some(token) => match self.profile.validation_command(&token, &cwd) {
                Some(probe) => {
                    if self.launcher.validate(&probe, self.settings.validate_timeout).await {
                        (LaunchMode::Resume, token)
                    } else {
                        tracing::warn!(session = %self.id, "resume token rejected, starting fresh");
                        self.broadcaster.publish(&ServerMessage::ExecStart { mode: LaunchMode::Fresh });
                        (LaunchMode::Fresh, new_token())
                    }
                }
                None => (LaunchMode::Resume, token),
            },
            None => (LaunchMode::Fresh, new_token()),
        };

        {
            let mut slot = self.slot.lock().await;
            if slot.generation != generation || self.is_closing() {
                return Err(SessionError::Closing);
            }
            if slot.state != ProcessState::Starting {
                self.set_state(&mut slot, ProcessState::Starting);
                drop(slot);
                self.publish_status();
            }
        }

        match self.spawn_process(mode, token, generation).await {
            Ok(()) => Ok(mode),
            Err(SessionError::Closing) => Err(SessionError::Closing),
            Err(e) => {
                tracing::error!(session = %self.id, error = %e, "failed to start agent");
                self.fail_start(generation, e.to_string()).await;
                Err(e)
            }
        }
    }

    async fn spawn_process(self: &Arc<Self>, mode: LaunchMode, token: String, generation: u64) -> Result<(), SessionError> {
        let (cwd, yolo) = {
            let meta = self.meta.read();
            (meta.cwd.clone(), meta.yolo)
        };
        let cmd = self.profile.launch_command(mode, &token, &cwd, yolo);
        let dims = self.terminal_size();
        let launcher = self.launcher.clone();
        tracing::info!(session = %self.id, program = %cmd.program, ?mode, "spawning agent");

        let spawn = tokio::task::spawn_blocking(move || launcher.spawn(&cmd, dims.rows, dims.cols));
        let pty = match tokio::time::timeout(self.settings.spawn_timeout, spawn).await {
            Ok(Ok(result)) => result?,
            Ok(Err(join)) => return Err(SessionError::SpawnTask(join.to_string())),
            Err(_) => return Err(SessionError::SpawnTimeout(self.settings.spawn_timeout)),
        };
        let (handle, exit_rx) = ProcessHandle::attach(
            pty,
            token.clone(),
            self.broadcaster.clone(),
            self.settings.pending_input.max(1),
        )?;
        let pid = handle.pid;

        {
            let mut slot = self.slot.lock().await;
            if slot.generation != generation || self.is_closing() {
                // Teardown began while we were spawning.
                handle.signaller().kill();
                return Err(SessionError::Closing);
            }
            // The input channel has room for every pending frame, so this
            // never waits on the child while the slot is held.
            let input = handle.input_sender();
            while let Some(data) = slot.pending.pop_front() {
                if input.try_send(data).is_err() {
                    tracing::warn!(session = %self.id, "process input unavailable, dropping pending input");
                    slot.pending.clear();
                    break;
                }
            }
            {
                let mut resizer = self.resizer.lock();
                *resizer = Some(handle.resizer());
                // A resize may have landed while the spawn was in flight.
                let current = self.terminal_size();
                if current != dims {
                    if let Err(e) = handle.resize(current.rows, current.cols) {
                        tracing::warn!(session = %self.id, error = %e, "PTY resize failed");
                    }
                }
            }
            let started_at = handle.started_at;
            slot.handle = Some(handle);
            self.set_state(&mut slot, ProcessState::Running { pid, started_at });
        }
        tracing::info!(session = %self.id, ?pid, "agent running");

        self.meta.write().resume_token = Some(token);
        self.persist().await;
        self.publish_status();

        let this = self.clone();
        tokio::spawn(async move {
            let code = exit_rx.await.unwrap_or(-1);
            this.on_exit(generation, code).await;
        });
        Ok(())
    }

    async fn fail_start(&self, generation: u64, error: String) {
        {
            let mut slot = self.slot.lock().await;
            if slot.generation != generation {
                return;
            }
            self.set_state(&mut slot, ProcessState::Exited { code: -1 });
        }
        self.broadcaster.publish(&ServerMessage::Exit {
            code: -1,
            worktree: None,
            error: Some(error),
        });
        self.publish_status();
    }

    async fn on_exit(&self, generation: u64, code: i32) {
        tracing::info!(session = %self.id, code, "agent exited");
        let cwd = self.meta.read().cwd.clone();
        let worktree = worktree::inspect(&cwd, &self.settings.worktree_base, WORKTREE_TIMEOUT).await;
        if let Some(token) = self.profile.read_token_file(&cwd).await {
            self.meta.write().resume_token = Some(token);
        }

        {
            let mut slot = self.slot.lock().await;
            if slot.generation == generation {
                slot.handle = None;
                *self.resizer.lock() = None;
                self.set_state(&mut slot, ProcessState::Exited { code });
            }
        }
        self.persist().await;
        self.broadcaster.publish(&ServerMessage::Exit { code, worktree, error: None });
        self.publish_status();
    }

    async fn signaller(&self) -> Option<ProcessSignaller> {
        self.slot.lock().await.handle.as_ref().map(|h| h.signaller())
    }

    /// Wait until the process slot is no longer running, up to `timeout`.
    async fn wait_not_running(&self, timeout: Duration) -> bool {
        let mut rx = self.state_tx.subscribe();
        tokio::time::timeout(timeout, rx.wait_for(|s| !s.is_running()))
            .await
            .map(|r| r.is_ok())
            .unwrap_or(false)
    }

    /// SIGHUP the process group, SIGKILL after the grace period.
    async fn terminate(&self) {
        let Some(signaller) = self.signaller().await else {
            return;
        };
        signaller.hangup();
        if !self.wait_not_running(self.settings.grace_period).await {
            tracing::warn!(session = %self.id, "agent ignored SIGHUP, sending SIGKILL");
            signaller.kill();
            self.wait_not_running(self.settings.grace_period).await;
        }
    }

    /// Stop the running process (if any) and start again, resuming by token.
    pub async fn restart(self: &Arc<Self>) -> Result<LaunchMode, SessionError> {
        if self.is_closing() {
            return Err(SessionError::Closing);
        }
        {
            let slot = self.slot.lock().await;
            if matches!(slot.state, ProcessState::Validating | ProcessState::Starting) {
                return Err(SessionError::Busy);
            }
        }
        tracing::info!(session = %self.id, "restarting agent");
        self.terminate().await;
        self.start().await
    }

    // ── Input and control ──────────────────────────────────────────

    /// Deliver input to the process, or buffer it until the next start.
    pub async fn route_input(&self, data: Bytes) -> Result<(), SessionError> {
        let _inflight = self.inflight.token();
        if self.is_closing() {
            return Err(SessionError::Closing);
        }
        let sender = {
            let mut slot = self.slot.lock().await;
            match (&slot.state, &slot.handle) {
                (ProcessState::Running { .. }, Some(handle)) => handle.input_sender(),
                _ => {
                    if slot.pending.len() >= self.settings.pending_input.max(1) {
                        slot.pending.pop_front();
                        tracing::debug!(session = %self.id, "pending input full, dropping oldest");
                    }
                    slot.pending.push_back(data);
                    return Ok(());
                }
            }
        };
        if sender.send(data).await.is_err() {
            tracing::debug!(session = %self.id, "process input closed, dropping input");
        }
        Ok(())
    }

    pub fn resize(&self, rows: u16, cols: u16) {
        if rows == 0 || cols == 0 {
            tracing::debug!(session = %self.id, rows, cols, "ignoring zero-sized resize");
            return;
        }
        {
            // Held across the size update so a spawn finishing concurrently
            // either sees the new size or hands us its resizer.
            let resizer = self.resizer.lock();
            {
                let mut size = self.size.lock();
                if size.rows == rows && size.cols == cols {
                    return;
                }
                *size = TerminalDims { rows, cols };
            }
            if let Some(resizer) = resizer.as_ref() {
                if let Err(e) = resizer.resize(rows, cols) {
                    tracing::warn!(session = %self.id, error = %e, "PTY resize failed");
                }
            }
        }
        self.publish_status();
    }

    pub async fn rename(&self, name: &str) -> bool {
        let name = name.trim();
        if name.is_empty() || name.chars().count() > MAX_NAME_LEN {
            tracing::debug!(session = %self.id, "rejecting invalid session name");
            return false;
        }
        self.meta.write().name = name.to_string();
        self.broadcaster.publish(&ServerMessage::SessionRenamed { name: name.to_string() });
        self.publish_status();
        self.persist().await;
        true
    }

    /// Set (or flip) yolo. A running process is restarted to pick it up.
    pub async fn toggle_yolo(self: &Arc<Self>, enabled: Option<bool>) -> bool {
        let enabled = {
            let mut meta = self.meta.write();
            meta.yolo = enabled.unwrap_or(!meta.yolo);
            meta.yolo
        };
        self.broadcaster.publish(&ServerMessage::YoloToggled { enabled });
        self.publish_status();
        self.persist().await;
        if self.state().is_running() {
            let this = self.clone();
            tokio::spawn(async move {
                if let Err(e) = this.restart().await {
                    tracing::warn!(session = %this.id, error = %e, "restart after yolo toggle failed");
                }
            });
        }
        enabled
    }

    pub fn chat(&self, from: Option<String>, text: String) {
        self.broadcaster.publish(&ServerMessage::ChatMsg { from, text, ts: now_ms() });
    }

    pub async fn upload(&self, filename: &str, data: &[u8]) -> Result<PathBuf, UploadError> {
        let dir = self.meta.read().cwd.join(&self.settings.uploads_dir);
        save_upload(&dir, filename, data, self.settings.upload_max_bytes).await
    }

    // ── Background ─────────────────────────────────────────────────

    /// Refresh cached ports and push a status snapshot every interval.
    pub fn spawn_status_ticker(self: &Arc<Self>) {
        if self.settings.status_interval.is_zero() {
            return;
        }
        let weak = Arc::downgrade(self);
        let closing = self.closing.clone();
        let period = self.settings.status_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = closing.cancelled() => break,
                }
                let Some(session) = weak.upgrade() else { break };
                session.refresh_ports().await;
                if session.viewer_count() > 0 {
                    session.publish_status();
                }
            }
        });
    }

    pub async fn refresh_ports(&self) {
        let ports = crate::ports::listening_ports(&self.settings.ignored_ports).await;
        *self.ports.lock() = ports;
    }

    pub fn record(&self) -> SessionRecord {
        let meta = self.meta.read();
        SessionRecord {
            id: self.id,
            name: meta.name.clone(),
            agent: meta.agent.clone(),
            cwd: meta.cwd.clone(),
            yolo: meta.yolo,
            resume_token: meta.resume_token.clone(),
        }
    }

    async fn persist(&self) {
        let Some(records) = &self.records else {
            return;
        };
        if self.is_closing() {
            return;
        }
        if let Err(e) = records.save(&self.record()).await {
            tracing::warn!(session = %self.id, error = %e, "failed to persist session record");
        }
    }

    /// Tear the session down.
    ///
    /// New routing is refused at once. Requests already in flight get up to
    /// the grace period to finish, then every viewer is kicked and the
    /// process group receives SIGHUP, then SIGKILL if it is still alive.
    pub async fn close(&self) {
        if self.closing.is_cancelled() {
            return;
        }
        tracing::info!(session = %self.id, "closing session");
        self.closing.cancel();
        self.inflight.close();
        if tokio::time::timeout(self.settings.grace_period, self.inflight.wait()).await.is_err() {
            tracing::warn!(session = %self.id, "in-flight requests still running at teardown");
        }
        self.broadcaster.close();
        self.terminate().await;
    }
}

// ── Per-viewer dispatch ────────────────────────────────────────────

/// A frame received from a viewer's transport.
#[derive(Debug, Clone)]
pub enum Inbound {
    Binary(Bytes),
    Text(String),
}

/// Per-connection state for one viewer.
pub struct ViewerContext {
    pub info: Arc<ViewerInfo>,
    reply: mpsc::Sender<Outbound>,
    chunks: ChunkAssembler,
}

impl ViewerContext {
    pub fn new(info: Arc<ViewerInfo>, reply: mpsc::Sender<Outbound>, max_bytes: usize) -> Self {
        Self {
            info,
            reply,
            chunks: ChunkAssembler::new(max_bytes),
        }
    }

    fn reply(&self, msg: &ServerMessage) {
        if self.reply.try_send(Outbound::control(msg)).is_err() {
            tracing::debug!(viewer = self.info.id, "reply dropped, viewer queue unavailable");
        }
    }
}

impl Session {
    /// Apply one inbound frame from `viewer`. Undecodable frames are dropped.
    pub async fn dispatch(self: &Arc<Self>, viewer: &mut ViewerContext, frame: Inbound) {
        match frame {
            Inbound::Binary(data) => {
                let frame = match BinaryFrame::decode(data) {
                    Ok(f) => f,
                    Err(e) => {
                        tracing::debug!(session = %self.id, viewer = viewer.info.id, error = %e, "dropping binary frame");
                        return;
                    }
                };
                let frame = match frame {
                    BinaryFrame::Chunk { index, total, payload } => {
                        match viewer.chunks.push(index, total, &payload) {
                            Ok(Some(logical)) => match BinaryFrame::decode(logical) {
                                Ok(BinaryFrame::Chunk { .. }) => {
                                    tracing::debug!(session = %self.id, "dropping nested chunk frame");
                                    return;
                                }
                                Ok(inner) => inner,
                                Err(e) => {
                                    tracing::debug!(session = %self.id, error = %e, "dropping reassembled frame");
                                    return;
                                }
                            },
                            Ok(None) => return,
                            Err(e) => {
                                tracing::debug!(session = %self.id, viewer = viewer.info.id, error = %e, "chunk sequence discarded");
                                return;
                            }
                        }
                    }
                    other => other,
                };
                self.apply_binary(viewer, frame).await;
            }
            Inbound::Text(text) => {
                if let Some(msg) = crate::codec::decode_client_message(&text) {
                    self.apply_control(viewer, msg).await;
                }
            }
        }
    }

    async fn apply_binary(self: &Arc<Self>, viewer: &ViewerContext, frame: BinaryFrame) {
        match frame {
            BinaryFrame::Resize { rows, cols } => self.resize(rows, cols),
            BinaryFrame::Input(data) => {
                let _ = self.route_input(data).await;
            }
            BinaryFrame::Upload { filename, data } => self.handle_upload(viewer, &filename, &data).await,
            BinaryFrame::Chunk { .. } => {}
        }
    }

    async fn apply_control(self: &Arc<Self>, viewer: &ViewerContext, msg: ClientMessage) {
        match msg {
            ClientMessage::Ping { payload } => {
                viewer.info.touch_ping();
                viewer.reply(&ServerMessage::Pong { payload });
            }
            ClientMessage::Resize { rows, cols } => self.resize(rows, cols),
            ClientMessage::FileUpload { filename, data } => {
                match base64::engine::general_purpose::STANDARD.decode(data.as_bytes()) {
                    Ok(bytes) => self.handle_upload(viewer, &filename, &bytes).await,
                    Err(e) => viewer.reply(&ServerMessage::FileUploaded {
                        filename,
                        success: false,
                        path: None,
                        error: Some(UploadError::from(e).to_string()),
                    }),
                }
            }
            ClientMessage::RenameSession { name } => {
                self.rename(&name).await;
            }
            ClientMessage::ToggleYolo { enabled } => {
                self.toggle_yolo(enabled).await;
            }
            ClientMessage::Chat { text } => self.chat(viewer.info.display_name.clone(), text),
            ClientMessage::Input { data } => {
                let _ = self.route_input(Bytes::from(data)).await;
            }
            ClientMessage::Restart => {
                let this = self.clone();
                tokio::spawn(async move {
                    if let Err(e) = this.restart().await {
                        tracing::debug!(session = %this.id, error = %e, "restart request not applied");
                    }
                });
            }
        }
    }

    async fn handle_upload(&self, viewer: &ViewerContext, filename: &str, data: &[u8]) {
        let _inflight = self.inflight.token();
        let reply = match self.upload(filename, data).await {
            Ok(path) => ServerMessage::FileUploaded {
                filename: filename.to_string(),
                success: true,
                path: Some(path.display().to_string()),
                error: None,
            },
            Err(e) => {
                tracing::warn!(session = %self.id, error = %e, "upload failed");
                ServerMessage::FileUploaded {
                    filename: filename.to_string(),
                    success: false,
                    path: None,
                    error: Some(e.to_string()),
                }
            }
        };
        viewer.reply(&reply);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::NativeLauncher;

    fn settings() -> Arc<SessionSettings> {
        let mut config = Config::default();
        config.server.status_interval_ms = 0;
        config.process.grace_period_ms = 500;
        Arc::new(SessionSettings::from_config(&config))
    }

    fn shell_profile(script: &str) -> AgentProfile {
        AgentProfile {
            program: "/bin/sh".into(),
            args: vec!["-c".into(), script.into()],
            fresh_args: Vec::new(),
            resume_args: Vec::new(),
            validate_args: vec!["-c".into(), "test {token} = good".into()],
            yolo_args: Vec::new(),
            env: Default::default(),
            token_file: None,
        }
    }

    fn session(script: &str, token: Option<&str>) -> (Arc<Session>, tempfile::TempDir) {
        session_with(shell_profile(script), token, None)
    }

    fn session_with(
        profile: AgentProfile,
        token: Option<&str>,
        records: Option<RecordStore>,
    ) -> (Arc<Session>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let meta = SessionMeta {
            name: "test".into(),
            cwd: dir.path().to_path_buf(),
            agent: "sh".into(),
            yolo: false,
            resume_token: token.map(str::to_string),
        };
        let s = Session::new(Uuid::new_v4(), meta, profile, Arc::new(NativeLauncher), settings(), records);
        (s, dir)
    }

    fn running_pid(s: &Session) -> Option<u32> {
        match s.state() {
            ProcessState::Running { pid, .. } => pid,
            other => panic!("unexpected state {other:?}"),
        }
    }

    /// Collect PTY output until it contains `needle`.
    async fn output_until(rx: &mut mpsc::Receiver<Outbound>, needle: &str) -> String {
        let mut out = Vec::new();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        loop {
            let text = String::from_utf8_lossy(&out).into_owned();
            if text.contains(needle) {
                return text;
            }
            match tokio::time::timeout_at(deadline, rx.recv()).await {
                Ok(Some(Outbound::Output(b))) => out.extend_from_slice(&b),
                Ok(Some(_)) => {}
                Ok(None) => panic!("viewer queue closed; output so far {text:?}"),
                Err(_) => panic!("timed out waiting for {needle:?}; output so far {text:?}"),
            }
        }
    }

    async fn wait_for_state(s: &Session, pred: impl Fn(&ProcessState) -> bool) -> ProcessState {
        let mut rx = s.watch_state();
        let state = tokio::time::timeout(Duration::from_secs(10), rx.wait_for(|st| pred(st)))
            .await
            .expect("state timeout")
            .expect("state channel closed")
            .clone();
        state
    }

    fn texts(rx: &mut mpsc::Receiver<Outbound>) -> Vec<serde_json::Value> {
        let mut out = Vec::new();
        while let Ok(item) = rx.try_recv() {
            if let Outbound::Text(t) = item {
                out.push(serde_json::from_str(&t).unwrap());
            }
        }
        out
    }

    #[tokio::test]
    async fn fresh_start_runs_and_reports_exit() {
        let (s, _dir) = session("exit 42", None);
        let mut sub = s.subscribe(None).unwrap();
        assert_eq!(s.start().await.unwrap(), LaunchMode::Fresh);
        wait_for_state(&s, |st| matches!(st, ProcessState::Exited { code: 42 })).await;
        // The exit broadcast follows the state change.
        tokio::time::sleep(Duration::from_millis(50)).await;

        let msgs = texts(&mut sub.rx);
        assert_eq!(msgs[0]["type"], "exec_start");
        assert_eq!(msgs[0]["mode"], "fresh");
        let exit = msgs.iter().find(|m| m["type"] == "exit").unwrap();
        assert_eq!(exit["code"], 42);
        assert!(s.meta().resume_token.is_some());
    }

    #[tokio::test]
    async fn second_start_while_running_is_busy() {
        let (s, _dir) = session("sleep 5", None);
        s.start().await.unwrap();
        assert!(matches!(s.start().await, Err(SessionError::Busy)));
        s.close().await;
        assert!(!s.state().is_running());
    }

    #[tokio::test]
    async fn invalid_token_falls_back_to_fresh() {
        let (s, _dir) = session("sleep 5", Some("stale"));
        let mut sub = s.subscribe(None).unwrap();
        assert_eq!(s.start().await.unwrap(), LaunchMode::Fresh);
        assert!(s.state().is_running());

        let modes: Vec<_> = texts(&mut sub.rx)
            .into_iter()
            .filter(|m| m["type"] == "exec_start")
            .map(|m| m["mode"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(modes, vec!["resume", "fresh"]);
        assert_ne!(s.meta().resume_token.as_deref(), Some("stale"));
        s.close().await;
    }

    #[tokio::test]
    async fn valid_token_resumes() {
        let (s, _dir) = session("sleep 5", Some("good"));
        assert_eq!(s.start().await.unwrap(), LaunchMode::Resume);
        assert_eq!(s.meta().resume_token.as_deref(), Some("good"));
        s.close().await;
    }

    #[tokio::test]
    async fn input_before_start_is_buffered_and_delivered_in_order() {
        let (s, _dir) = session("read a; read b; exit $((a * 10 + b))", None);
        s.route_input(Bytes::from_static(b"4\n")).await.unwrap();
        s.route_input(Bytes::from_static(b"2\n")).await.unwrap();
        s.start().await.unwrap();
        wait_for_state(&s, |st| matches!(st, ProcessState::Exited { code: 42 })).await;
    }

    #[tokio::test]
    async fn spawn_failure_reports_exit_minus_one() {
        let (s, _dir) = session("true", None);
        let mut broken = s.profile.clone();
        broken.program = "/nonexistent/agent".into();
        let s = Session::new(s.id, s.meta(), broken, Arc::new(NativeLauncher), settings(), None);
        let mut sub = s.subscribe(None).unwrap();
        assert!(s.start().await.is_err());
        assert_eq!(s.state(), ProcessState::Exited { code: -1 });
        let exit = texts(&mut sub.rx).into_iter().find(|m| m["type"] == "exit").unwrap();
        assert_eq!(exit["code"], -1);
        assert!(exit["error"].is_string());
    }

    #[tokio::test]
    async fn rename_and_yolo_are_broadcast_with_status() {
        let (s, _dir) = session("true", None);
        let mut sub = s.subscribe(None).unwrap();
        assert!(s.rename("  api work ").await);
        assert!(!s.rename("   ").await);
        assert!(s.toggle_yolo(None).await);
        assert!(!s.toggle_yolo(Some(false)).await);

        let msgs = texts(&mut sub.rx);
        let kinds: Vec<_> = msgs.iter().map(|m| m["type"].as_str().unwrap().to_string()).collect();
        assert_eq!(kinds, vec!["renameSession", "status", "toggleYolo", "status", "toggleYolo", "status"]);
        assert_eq!(msgs[0]["name"], "api work");
        assert_eq!(msgs[1]["session"]["name"], "api work");
        assert_eq!(msgs[2]["enabled"], true);
        assert_eq!(msgs[3]["yolo"], true);
    }

    #[tokio::test]
    async fn ping_gets_pong_only_for_sender() {
        let (s, _dir) = session("true", None);
        let mut a = s.subscribe(None).unwrap();
        let mut b = s.subscribe(None).unwrap();
        let mut ctx = ViewerContext::new(a.info.clone(), a.tx.clone(), 1024);
        s.dispatch(&mut ctx, Inbound::Text(r#"{"type":"ping","payload":7}"#.into())).await;
        let pongs = texts(&mut a.rx);
        assert_eq!(pongs, vec![serde_json::json!({"type":"pong","payload":7})]);
        assert!(texts(&mut b.rx).is_empty());
        assert!(a.info.last_ping() > 0);
    }

    #[tokio::test]
    async fn malformed_frames_are_ignored() {
        let (s, _dir) = session("true", None);
        let mut a = s.subscribe(None).unwrap();
        let mut ctx = ViewerContext::new(a.info.clone(), a.tx.clone(), 1024);
        s.dispatch(&mut ctx, Inbound::Text("{not json".into())).await;
        s.dispatch(&mut ctx, Inbound::Binary(Bytes::from_static(&[0x7F]))).await;
        s.dispatch(&mut ctx, Inbound::Binary(Bytes::from_static(&[0x00, 1]))).await;
        assert!(texts(&mut a.rx).is_empty());
        assert_eq!(s.terminal_size(), TerminalDims { rows: 24, cols: 80 });
    }

    #[tokio::test]
    async fn chunked_resize_applies_after_reassembly() {
        let (s, _dir) = session("true", None);
        let sub = s.subscribe(None).unwrap();
        let mut ctx = ViewerContext::new(sub.info.clone(), sub.tx.clone(), 1024);
        let logical = BinaryFrame::Resize { rows: 50, cols: 132 }.encode().unwrap();
        let frags = crate::codec::encode_chunks(&logical, 2).unwrap();
        assert_eq!(frags.len(), 3);
        for f in &frags[..2] {
            s.dispatch(&mut ctx, Inbound::Binary(f.clone())).await;
            assert_eq!(s.terminal_size().rows, 24);
        }
        s.dispatch(&mut ctx, Inbound::Binary(frags[2].clone())).await;
        assert_eq!(s.terminal_size(), TerminalDims { rows: 50, cols: 132 });
    }

    #[tokio::test]
    async fn nested_chunks_are_rejected() {
        let (s, _dir) = session("true", None);
        let sub = s.subscribe(None).unwrap();
        let mut ctx = ViewerContext::new(sub.info.clone(), sub.tx.clone(), 1024);
        let inner = BinaryFrame::Resize { rows: 10, cols: 10 }.encode().unwrap();
        let inner_chunk = BinaryFrame::Chunk { index: 0, total: 1, payload: inner }.encode().unwrap();
        let outer = BinaryFrame::Chunk { index: 0, total: 1, payload: inner_chunk }.encode().unwrap();
        s.dispatch(&mut ctx, Inbound::Binary(outer)).await;
        assert_eq!(s.terminal_size().rows, 24);
    }

    #[tokio::test]
    async fn uploads_land_in_session_directory() {
        let (s, dir) = session("true", None);
        let mut sub = s.subscribe(None).unwrap();
        let mut ctx = ViewerContext::new(sub.info.clone(), sub.tx.clone(), 1 << 20);
        let frame = BinaryFrame::Upload { filename: "notes.txt".into(), data: Bytes::from_static(b"hi") }
            .encode()
            .unwrap();
        s.dispatch(&mut ctx, Inbound::Binary(frame)).await;
        s.dispatch(
            &mut ctx,
            Inbound::Text(r#"{"type":"fileUpload","filename":"b.txt","data":"aGk="}"#.into()),
        )
        .await;
        s.dispatch(
            &mut ctx,
            Inbound::Text(r#"{"type":"fileUpload","filename":"c.txt","data":"!!"}"#.into()),
        )
        .await;

        let msgs = texts(&mut sub.rx);
        assert_eq!(msgs.len(), 3);
        assert_eq!(msgs[0]["success"], true);
        assert_eq!(msgs[1]["success"], true);
        assert_eq!(msgs[2]["success"], false);
        assert_eq!(std::fs::read(dir.path().join("uploads/notes.txt")).unwrap(), b"hi");
        assert_eq!(std::fs::read(dir.path().join("uploads/b.txt")).unwrap(), b"hi");
    }

    #[tokio::test]
    async fn close_refuses_routing_and_kicks_viewers() {
        let (s, _dir) = session("sleep 30", None);
        let sub = s.subscribe(None).unwrap();
        s.start().await.unwrap();
        s.close().await;
        assert!(sub.kicked.is_cancelled());
        assert!(matches!(s.route_input(Bytes::from_static(b"x")).await, Err(SessionError::Closing)));
        assert!(matches!(s.start().await, Err(SessionError::Closing)));
        assert!(matches!(s.subscribe(None), Err(SubscribeError::Closed)));
        wait_for_state(&s, |st| matches!(st, ProcessState::Exited { .. })).await;
    }

    #[tokio::test]
    async fn restart_replaces_running_process() {
        let (s, _dir) = session("sleep 30", None);
        s.start().await.unwrap();
        let first_pid = match s.state() {
            ProcessState::Running { pid, .. } => pid,
            other => panic!("unexpected state {other:?}"),
        };
        let token = s.meta().resume_token.clone();
        // The stored token is not "good", so the probe rejects it.
        s.restart().await.unwrap();
        match s.state() {
            ProcessState::Running { pid, .. } => assert_ne!(pid, first_pid),
            other => panic!("unexpected state {other:?}"),
        }
        assert_ne!(s.meta().resume_token, token);
        s.close().await;
    }

    #[tokio::test]
    async fn resize_reaches_pty_while_slot_is_held() {
        let (s, _dir) = session("read x; stty size; sleep 5", None);
        let mut sub = s.subscribe(None).unwrap();
        s.start().await.unwrap();

        {
            // Stand-in for a concurrent input route or restart.
            let _slot = s.slot.lock().await;
            s.resize(50, 132);
        }
        assert_eq!(s.terminal_size(), TerminalDims { rows: 50, cols: 132 });

        s.route_input(Bytes::from_static(b"\n")).await.unwrap();
        output_until(&mut sub.rx, "50 132").await;
        s.close().await;
    }

    #[tokio::test]
    async fn pending_input_flush_does_not_wait_on_the_child() {
        let (s, _dir) = session("sleep 30", None);
        // Far more than the PTY will take while nobody reads it.
        let line = Bytes::from(format!("{}\n", "x".repeat(1023)));
        for _ in 0..200 {
            s.route_input(line.clone()).await.unwrap();
        }

        tokio::time::timeout(Duration::from_secs(5), s.start())
            .await
            .expect("start blocked on pending input")
            .unwrap();
        assert!(s.state().is_running());

        // Routing and teardown still get the slot.
        tokio::time::timeout(Duration::from_secs(5), s.route_input(Bytes::from_static(b"y")))
            .await
            .expect("route_input blocked")
            .unwrap();
        tokio::time::timeout(Duration::from_secs(5), s.close())
            .await
            .expect("close blocked");
        wait_for_state(&s, |st| matches!(st, ProcessState::Exited { .. })).await;
    }

    #[tokio::test]
    async fn toggling_yolo_while_running_restarts_with_yolo_args() {
        let mut profile = shell_profile(r#"echo "args=$0 $*"; sleep 30"#);
        profile.fresh_args = vec!["fresh".into()];
        profile.resume_args = vec!["resume".into()];
        profile.yolo_args = vec!["--yolo".into()];
        let (s, _dir) = session_with(profile, None, None);
        let mut sub = s.subscribe(None).unwrap();

        s.start().await.unwrap();
        let first = running_pid(&s);
        let out = output_until(&mut sub.rx, "args=").await;
        assert!(!out.contains("--yolo"));

        assert!(s.toggle_yolo(Some(true)).await);
        let state = wait_for_state(&s, |st| matches!(st, ProcessState::Running { pid, .. } if *pid != first)).await;
        assert!(matches!(state, ProcessState::Running { pid: Some(_), .. }));
        output_until(&mut sub.rx, "--yolo").await;
        s.close().await;
    }

    #[tokio::test]
    async fn token_from_token_file_is_persisted_and_resumed() {
        let mut profile = shell_profile(r#"echo "mode=$0 token=$1"; printf good > .agent-token"#);
        profile.fresh_args = vec!["fresh".into(), "{token}".into()];
        profile.resume_args = vec!["resume".into(), "{token}".into()];
        profile.token_file = Some(PathBuf::from(".agent-token"));
        let state_dir = tempfile::tempdir().unwrap();
        let records = RecordStore::new(state_dir.path().to_path_buf());
        let (s, _dir) = session_with(profile, None, Some(records.clone()));
        let mut sub = s.subscribe(None).unwrap();

        assert_eq!(s.start().await.unwrap(), LaunchMode::Fresh);
        output_until(&mut sub.rx, "mode=fresh").await;
        wait_for_state(&s, |st| matches!(st, ProcessState::Exited { code: 0 })).await;

        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        loop {
            let stored = records.load(&s.id).await.and_then(|r| r.resume_token);
            if stored.as_deref() == Some("good") {
                break;
            }
            assert!(tokio::time::Instant::now() < deadline, "token file never persisted: {stored:?}");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(s.meta().resume_token.as_deref(), Some("good"));

        assert_eq!(s.start().await.unwrap(), LaunchMode::Resume);
        output_until(&mut sub.rx, "mode=resume token=good").await;
    }
}
