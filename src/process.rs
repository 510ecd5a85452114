//! PTY-bound agent process: launching, I/O pumps, signals and exit.

use std::io::{Read, Write};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};

use crate::agent::AgentCommand;
use crate::broadcast::{now_ms, Broadcaster};
use crate::pty::{Pty, PtyError};

/// How long to keep draining PTY output after the child has exited.
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

const INPUT_CHANNEL_CAPACITY: usize = 64;

/// Lifecycle of the one process slot a session owns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessState {
    Idle,
    Validating,
    Starting,
    Running { pid: Option<u32>, started_at: u64 },
    Exited { code: i32 },
}

impl ProcessState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Validating => "validating",
            Self::Starting => "starting",
            Self::Running { .. } => "running",
            Self::Exited { .. } => "exited",
        }
    }

    /// A start can be claimed from this state.
    pub fn can_start(&self) -> bool {
        matches!(self, Self::Idle | Self::Exited { .. })
    }

    pub fn is_running(&self) -> bool {
        matches!(self, Self::Running { .. })
    }
}

/// Spawns agent processes. Injected so tests can stand in for real agents.
#[async_trait]
pub trait ProcessLauncher: Send + Sync + 'static {
    /// Spawn `cmd` on a fresh PTY. Blocking; callers run it off the runtime.
    fn spawn(&self, cmd: &AgentCommand, rows: u16, cols: u16) -> Result<Pty, PtyError>;

    /// Run the resume validation probe. Any failure, including a timeout,
    /// is `false`.
    async fn validate(&self, cmd: &AgentCommand, timeout: Duration) -> bool;
}

/// Launches real processes through `portable-pty` and `tokio::process`.
#[derive(Debug, Default, Clone, Copy)]
pub struct NativeLauncher;

#[async_trait]
impl ProcessLauncher for NativeLauncher {
    fn spawn(&self, cmd: &AgentCommand, rows: u16, cols: u16) -> Result<Pty, PtyError> {
        Pty::spawn(cmd, rows, cols)
    }

    async fn validate(&self, cmd: &AgentCommand, timeout: Duration) -> bool {
        let status = tokio::process::Command::new(&cmd.program)
            .args(&cmd.args)
            .current_dir(&cmd.cwd)
            .envs(cmd.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .status();
        match tokio::time::timeout(timeout, status).await {
            Ok(Ok(status)) => status.success(),
            Ok(Err(e)) => {
                tracing::warn!(program = %cmd.program, error = %e, "validation probe failed to run");
                false
            }
            Err(_) => {
                tracing::warn!(program = %cmd.program, ?timeout, "validation probe timed out");
                false
            }
        }
    }
}

/// Signals a process group without holding the handle.
///
/// Signals are skipped once the child is known to have exited so a recycled
/// PID is never hit.
#[derive(Debug, Clone)]
pub struct ProcessSignaller {
    pid: Option<u32>,
    exited: Arc<AtomicBool>,
}

impl ProcessSignaller {
    fn send(&self, signal: libc::c_int, name: &str) {
        let Some(pid) = self.pid else {
            return;
        };
        if pid == 0 || pid > i32::MAX as u32 {
            tracing::warn!(pid, "PID is 0 or exceeds i32::MAX, cannot send signal");
            return;
        }
        if self.exited.load(Ordering::Acquire) {
            tracing::debug!(pid, signal = name, "child already exited, skipping signal");
            return;
        }
        tracing::debug!(pid, signal = name, "signalling process group");
        // portable-pty calls setsid() for the child, so it leads its own group.
        #[cfg(unix)]
        unsafe {
            libc::kill(-(pid as i32), signal);
        }
    }

    pub fn hangup(&self) {
        self.send(libc::SIGHUP, "SIGHUP");
    }

    pub fn kill(&self) {
        self.send(libc::SIGKILL, "SIGKILL");
    }

    pub fn has_exited(&self) -> bool {
        self.exited.load(Ordering::Acquire)
    }
}

/// Resizes a running PTY without holding the handle.
#[derive(Clone)]
pub struct PtyResizer {
    pty: Arc<parking_lot::Mutex<Pty>>,
}

impl PtyResizer {
    pub fn resize(&self, rows: u16, cols: u16) -> Result<(), PtyError> {
        self.pty.lock().resize(rows, cols)
    }
}

/// A running child with its I/O pumps attached.
pub struct ProcessHandle {
    pub pid: Option<u32>,
    pub started_at: u64,
    pub resume_token: String,
    input_tx: mpsc::Sender<Bytes>,
    pty: Arc<parking_lot::Mutex<Pty>>,
    signaller: ProcessSignaller,
}

impl std::fmt::Debug for ProcessHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessHandle")
            .field("pid", &self.pid)
            .field("started_at", &self.started_at)
            .finish_non_exhaustive()
    }
}

impl ProcessHandle {
    /// Wire up a freshly spawned PTY.
    ///
    /// Output is published to `output` as it is read. The returned receiver
    /// yields the exit code once the child has exited and its remaining
    /// output has been drained (or the drain timed out).
    ///
    /// The input channel holds `extra_input` frames on top of the usual
    /// capacity, so a caller can queue that many without waiting.
    pub fn attach(
        mut pty: Pty,
        resume_token: String,
        output: Arc<Broadcaster>,
        extra_input: usize,
    ) -> Result<(Self, oneshot::Receiver<i32>), PtyError> {
        let reader = pty.take_reader()?;
        let writer = pty.take_writer()?;
        let child = pty.take_child()?;
        let pid = pty.pid();
        let exited = Arc::new(AtomicBool::new(false));

        let (reader_done_tx, reader_done_rx) = oneshot::channel::<()>();
        tokio::task::spawn_blocking(move || {
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                let mut reader = reader;
                let mut buf = [0u8; 4096];
                loop {
                    match reader.read(&mut buf) {
                        Ok(0) => break,
                        Ok(n) => output.publish_output(Bytes::copy_from_slice(&buf[..n])),
                        // EIO once the slave side is gone.
                        Err(_) => break,
                    }
                }
            }));
            if let Err(e) = result {
                tracing::error!("PTY reader task panicked: {:?}", e);
            }
            let _ = reader_done_tx.send(());
        });

        let (input_tx, input_rx) = mpsc::channel::<Bytes>(INPUT_CHANNEL_CAPACITY + extra_input);
        tokio::task::spawn_blocking(move || {
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                let mut writer = writer;
                let mut rx = input_rx;
                while let Some(data) = rx.blocking_recv() {
                    if writer.write_all(&data).is_err() {
                        break;
                    }
                    let _ = writer.flush();
                }
            }));
            if let Err(e) = result {
                tracing::error!("PTY writer task panicked: {:?}", e);
            }
        });

        let (wait_tx, wait_rx) = oneshot::channel::<i32>();
        tokio::task::spawn_blocking(move || {
            let mut child = child;
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| match child.wait() {
                Ok(status) => {
                    tracing::debug!(?status, "agent process exited");
                    i32::try_from(status.exit_code()).unwrap_or(-1)
                }
                Err(e) => {
                    tracing::error!(?e, "error waiting for agent process");
                    -1
                }
            }));
            let code = result.unwrap_or_else(|e| {
                tracing::error!("child exit monitor task panicked: {:?}", e);
                -1
            });
            let _ = wait_tx.send(code);
        });

        let (exit_tx, exit_rx) = oneshot::channel::<i32>();
        let exited_flag = exited.clone();
        tokio::spawn(async move {
            let code = wait_rx.await.unwrap_or(-1);
            exited_flag.store(true, Ordering::Release);
            if tokio::time::timeout(OUTPUT_DRAIN_TIMEOUT, reader_done_rx).await.is_err() {
                tracing::debug!("PTY output still open after child exit, not waiting further");
            }
            let _ = exit_tx.send(code);
        });

        let handle = Self {
            pid,
            started_at: now_ms(),
            resume_token,
            input_tx,
            pty: Arc::new(parking_lot::Mutex::new(pty)),
            signaller: ProcessSignaller { pid, exited },
        };
        Ok((handle, exit_rx))
    }

    pub fn input_sender(&self) -> mpsc::Sender<Bytes> {
        self.input_tx.clone()
    }

    pub fn resize(&self, rows: u16, cols: u16) -> Result<(), PtyError> {
        self.pty.lock().resize(rows, cols)
    }

    pub fn signaller(&self) -> ProcessSignaller {
        self.signaller.clone()
    }

    pub fn resizer(&self) -> PtyResizer {
        PtyResizer { pty: self.pty.clone() }
    }
}
