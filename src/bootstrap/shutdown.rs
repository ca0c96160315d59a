use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Shutdown state machine
///
/// States:
/// 1. Running - normal operation
/// 2. Draining - listeners stopped, sessions and services being closed
/// 3. Terminated - drain finished or timed out
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownState {
    Running,
    Draining,
    Terminated,
}

/// Coordinates graceful shutdown with a bounded drain period
pub struct ShutdownManager {
    /// Current state
    state: watch::Sender<ShutdownState>,

    /// Drain period duration
    drain_period: Duration,

    /// Cancelled when draining starts; listeners stop accepting
    accepting: CancellationToken,
}

impl ShutdownManager {
    pub fn new(drain_period: Duration) -> Arc<Self> {
        let (state, _) = watch::channel(ShutdownState::Running);

        Arc::new(Self {
            state,
            drain_period,
            accepting: CancellationToken::new(),
        })
    }

    /// Get current state
    pub fn state(&self) -> ShutdownState {
        *self.state.borrow()
    }

    /// Subscribe to state changes
    pub fn subscribe(&self) -> watch::Receiver<ShutdownState> {
        self.state.subscribe()
    }

    pub fn drain_period(&self) -> Duration {
        self.drain_period
    }

    /// Token cancelled once draining starts. Hand one to each listener.
    pub fn listener_token(&self) -> CancellationToken {
        self.accepting.child_token()
    }

    /// Start draining (called on SIGTERM/SIGINT)
    pub fn start_drain(&self) {
        if self.state() != ShutdownState::Running {
            return;
        }

        info!(
            drain_period_ms = self.drain_period.as_millis() as u64,
            "starting graceful shutdown drain"
        );

        self.accepting.cancel();
        let _ = self.state.send(ShutdownState::Draining);
    }

    /// Run `drain` within the drain period. Returns false on timeout.
    pub async fn drain<F>(&self, drain: F) -> bool
    where
        F: std::future::Future<Output = ()>,
    {
        self.start_drain();

        let finished = tokio::time::timeout(self.drain_period, drain).await.is_ok();
        if !finished {
            warn!(
                drain_period_ms = self.drain_period.as_millis() as u64,
                "drain timeout reached, forcing shutdown"
            );
        }

        self.terminate();
        finished
    }

    /// Complete shutdown
    pub fn terminate(&self) {
        if self.state() == ShutdownState::Terminated {
            return;
        }

        self.accepting.cancel();
        info!("shutdown complete");
        let _ = self.state.send(ShutdownState::Terminated);
    }

    /// Wait until the manager reaches `Terminated`.
    pub async fn terminated(&self) {
        let mut rx = self.subscribe();
        while *rx.borrow_and_update() != ShutdownState::Terminated {
            if rx.changed().await.is_err() {
                break;
            }
        }
    }

    /// Check if accepting new connections
    pub fn is_accepting(&self) -> bool {
        self.state() == ShutdownState::Running
    }
}
