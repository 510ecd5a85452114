//! Local terminal plumbing for `ptyhub attach`.

use bytes::Bytes;
use crossterm::terminal::{disable_raw_mode, enable_raw_mode, size};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::codec::TerminalDims;

#[derive(Error, Debug)]
pub enum TerminalError {
    #[error("failed to enable raw mode: {0}")]
    EnableRawMode(#[source] std::io::Error),
}

/// Raw mode for the lifetime of the guard, restored on drop (including
/// unwinding) so the user's shell is usable again.
pub struct RawModeGuard {
    _private: (),
}

impl RawModeGuard {
    pub fn new() -> Result<Self, TerminalError> {
        enable_raw_mode().map_err(TerminalError::EnableRawMode)?;
        Ok(Self { _private: () })
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        let _ = disable_raw_mode();
    }
}

/// Current size of the controlling terminal.
///
/// crossterm reports `(cols, rows)`; this returns rows first like the wire
/// format. `None` when stdout is not a terminal or reports a zero size.
pub fn terminal_size() -> Option<TerminalDims> {
    match size() {
        Ok((cols, rows)) if rows > 0 && cols > 0 => Some(TerminalDims { rows, cols }),
        _ => None,
    }
}

/// Stream stdin in a blocking thread. The channel closes on EOF.
pub fn stdin_reader(capacity: usize) -> mpsc::Receiver<Bytes> {
    let (tx, rx) = mpsc::channel(capacity);
    tokio::task::spawn_blocking(move || {
        use std::io::Read;
        let mut stdin = std::io::stdin();
        let mut buf = [0u8; 4096];
        loop {
            match stdin.read(&mut buf) {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if tx.blocking_send(Bytes::copy_from_slice(&buf[..n])).is_err() {
                        break;
                    }
                }
            }
        }
    });
    rx
}

/// Emit the new terminal size on every SIGWINCH.
pub fn resize_events() -> mpsc::Receiver<TerminalDims> {
    let (tx, rx) = mpsc::channel(4);
    tokio::spawn(async move {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigwinch = match signal(SignalKind::window_change()) {
            Ok(s) => s,
            Err(e) => {
                tracing::debug!(error = %e, "SIGWINCH handler unavailable");
                return;
            }
        };
        while sigwinch.recv().await.is_some() {
            if let Some(dims) = terminal_size() {
                if tx.send(dims).await.is_err() {
                    break;
                }
            }
        }
    });
    rx
}
