//! Client-side reconnection with exponential backoff.
//!
//! The loop is an explicit state machine:
//!
//! ```text
//! Idle ─► Probing(0) ─ok─► Connected
//!              │fail
//!              ▼
//!        Waiting(1, d) ─► Probing(1) ─ ... ─► Exhausted
//! ```
//!
//! The first attempt runs immediately. Attempt `n` (n ≥ 1) waits
//! `min(base × 2^(n-1), max)` first. Timers come from a [`Scheduler`] so
//! tests can run the machine without real time passing.

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub base: Duration,
    pub max: Duration,
    /// `None` retries forever.
    pub max_attempts: Option<u32>,
}

impl Backoff {
    /// Re-attaching a live session after the connection dropped.
    pub const LIVE: Self = Self {
        base: Duration::from_millis(1_000),
        max: Duration::from_millis(60_000),
        max_attempts: None,
    };

    /// Waiting for a server to come up.
    pub const READINESS: Self = Self {
        base: Duration::from_millis(2_000),
        max: Duration::from_millis(30_000),
        max_attempts: Some(10),
    };

    /// `min(base × 2^attempts, max)`, saturating.
    pub fn delay(&self, attempts: u32) -> Duration {
        let factor = 1u32.checked_shl(attempts).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.max)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconnectState {
    Idle,
    Waiting { attempt: u32, delay: Duration },
    Probing { attempt: u32 },
    Connected,
    Exhausted { attempts: u32 },
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ReconnectError {
    #[error("gave up after {attempts} attempts")]
    Exhausted { attempts: u32 },
    #[error("reconnection cancelled")]
    Cancelled,
    #[error("connection refused for good: {0}")]
    Rejected(String),
}

/// Source of delays.
#[async_trait]
pub trait Scheduler: Send + Sync {
    async fn sleep(&self, delay: Duration);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TokioScheduler;

#[async_trait]
impl Scheduler for TokioScheduler {
    async fn sleep(&self, delay: Duration) {
        tokio::time::sleep(delay).await;
    }
}

/// One connection attempt.
#[async_trait]
pub trait Probe: Send {
    type Output: Send;
    type Error: std::fmt::Display + Send;

    async fn attempt(&mut self) -> Result<Self::Output, Self::Error>;

    /// Errors for which retrying cannot help. They end the run at once.
    fn is_fatal(&self, _error: &Self::Error) -> bool {
        false
    }
}

pub struct Reconnector<S> {
    backoff: Backoff,
    scheduler: S,
    /// Failed attempts since the last success.
    attempts: u32,
    state_tx: watch::Sender<ReconnectState>,
}

impl<S: Scheduler> Reconnector<S> {
    pub fn new(backoff: Backoff, scheduler: S) -> Self {
        let (state_tx, _) = watch::channel(ReconnectState::Idle);
        Self {
            backoff,
            scheduler,
            attempts: 0,
            state_tx,
        }
    }

    pub fn state(&self) -> ReconnectState {
        self.state_tx.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<ReconnectState> {
        self.state_tx.subscribe()
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    fn set(&self, state: ReconnectState) {
        self.state_tx.send_replace(state);
    }

    /// Mark the current connection lost; the next `run` starts a new cycle.
    pub fn reset(&mut self) {
        self.set(ReconnectState::Idle);
    }

    /// Drive attempts until one succeeds, the cap is hit, or `cancel` fires.
    ///
    /// After cancellation no further state is published.
    pub async fn run<P: Probe>(&mut self, probe: &mut P, cancel: &CancellationToken) -> Result<P::Output, ReconnectError> {
        loop {
            if cancel.is_cancelled() {
                return Err(ReconnectError::Cancelled);
            }
            if let Some(max) = self.backoff.max_attempts {
                if self.attempts >= max {
                    self.set(ReconnectState::Exhausted { attempts: self.attempts });
                    return Err(ReconnectError::Exhausted { attempts: self.attempts });
                }
            }

            if self.attempts > 0 {
                let delay = self.backoff.delay(self.attempts - 1);
                self.set(ReconnectState::Waiting { attempt: self.attempts, delay });
                tokio::select! {
                    _ = self.scheduler.sleep(delay) => {}
                    _ = cancel.cancelled() => return Err(ReconnectError::Cancelled),
                }
            }

            self.set(ReconnectState::Probing { attempt: self.attempts });
            let result = tokio::select! {
                r = probe.attempt() => r,
                _ = cancel.cancelled() => return Err(ReconnectError::Cancelled),
            };
            match result {
                Ok(out) => {
                    self.attempts = 0;
                    self.set(ReconnectState::Connected);
                    return Ok(out);
                }
                Err(e) => {
                    self.attempts += 1;
                    if probe.is_fatal(&e) {
                        tracing::debug!(attempt = self.attempts, error = %e, "connection rejected, not retrying");
                        self.set(ReconnectState::Idle);
                        return Err(ReconnectError::Rejected(e.to_string()));
                    }
                    tracing::debug!(attempt = self.attempts, error = %e, "connection attempt failed");
                }
            }
        }
    }
}
