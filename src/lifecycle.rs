//! LifecycleManager: signal-driven graceful shutdown.
//!
//! ```text
//! RUNNING ──signal──▶ DRAINING ──server done──▶ STOPPED (graceful)
//!                        │
//!                        └──deadline elapsed──▶ STOPPED (forced)
//! ```
//!
//! Each transition happens at most once. The state lives in a single atomic
//! and moves only by compare-and-set, so a second signal observes
//! `Draining` and does nothing. Once draining, the listener stops accepting
//! and in-flight requests run to completion under the drain deadline.

use axum::Router;
use std::future::{Future, IntoFuture};
use std::io;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Process-wide shutdown state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ShutdownState {
    Running = 0,
    Draining = 1,
    Stopped = 2,
}

impl ShutdownState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ShutdownState::Running,
            1 => ShutdownState::Draining,
            _ => ShutdownState::Stopped,
        }
    }
}

/// How the server came to a stop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownOutcome {
    /// Every in-flight request completed within the deadline
    Graceful,
    /// The drain deadline elapsed first
    Forced,
}

/// Shutdown state machine shared by the signal listener and the server
#[derive(Debug)]
pub struct Lifecycle {
    state: AtomicU8,
    deadline: Duration,
    draining: watch::Sender<bool>,
}

impl Lifecycle {
    pub fn new(deadline: Duration) -> Self {
        let (draining, _) = watch::channel(false);
        Self {
            state: AtomicU8::new(ShutdownState::Running as u8),
            deadline,
            draining,
        }
    }

    pub fn state(&self) -> ShutdownState {
        ShutdownState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Drain budget
    pub fn deadline(&self) -> Duration {
        self.deadline
    }

    /// `RUNNING → DRAINING`. Returns whether this call made the transition.
    pub fn begin_drain(&self) -> bool {
        let transitioned = self
            .state
            .compare_exchange(
                ShutdownState::Running as u8,
                ShutdownState::Draining as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok();

        if transitioned {
            self.draining.send_replace(true);
        }
        transitioned
    }

    /// `DRAINING → STOPPED`. Returns whether this call made the transition.
    pub fn mark_stopped(&self) -> bool {
        self.state
            .compare_exchange(
                ShutdownState::Draining as u8,
                ShutdownState::Stopped as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Resolves once draining has begun.
    pub async fn drained(&self) {
        let mut rx = self.draining.subscribe();
        // The sender lives in `self`, so the channel cannot close here
        let _ = rx.wait_for(|draining| *draining).await;
    }

    /// Owned variant of [`drained`](Self::drained) for `with_graceful_shutdown`.
    pub fn shutdown_signal(self: &Arc<Self>) -> impl Future<Output = ()> + Send + 'static {
        let lifecycle = Arc::clone(self);
        async move { lifecycle.drained().await }
    }

    /// Run `server` until it finishes or, once draining, until the deadline.
    ///
    /// The deadline is measured from the first drain only. A server that
    /// exits on its own while still running is marked stopped at once.
    pub async fn drive<F, E>(&self, server: F) -> Result<ShutdownOutcome, E>
    where
        F: Future<Output = Result<(), E>>,
    {
        tokio::pin!(server);

        let early = tokio::select! {
            result = &mut server => Some(result),
            () = self.drained() => None,
        };

        if let Some(result) = early {
            // Server stopped by itself; walk the state machine to the end
            self.begin_drain();
            self.mark_stopped();
            return result.map(|()| ShutdownOutcome::Graceful);
        }

        let outcome = match tokio::time::timeout(self.deadline, &mut server).await {
            Ok(result) => result.map(|()| ShutdownOutcome::Graceful),
            Err(_) => {
                warn!(
                    deadline_secs = self.deadline.as_secs(),
                    "Drain deadline elapsed, forcing shutdown"
                );
                Ok(ShutdownOutcome::Forced)
            }
        };

        self.mark_stopped();
        if let Ok(outcome) = &outcome {
            info!(?outcome, "Server stopped");
        }
        outcome
    }
}

/// Spawn a task that starts the drain on SIGINT or SIGTERM.
///
/// Later signals are logged and ignored.
pub fn listen_for_signals(lifecycle: Arc<Lifecycle>) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let Some(signal) = next_signal().await else {
                return;
            };

            if lifecycle.begin_drain() {
                info!(
                    signal,
                    deadline_secs = lifecycle.deadline().as_secs(),
                    "Shutdown signal received, draining in-flight requests"
                );
            } else {
                debug!(signal, state = ?lifecycle.state(), "Shutdown already in progress");
            }
        }
    })
}

#[cfg(unix)]
async fn next_signal() -> Option<&'static str> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(sig) => sig,
        Err(e) => {
            error!(error = %e, "Failed to install SIGTERM handler");
            return None;
        }
    };
    let mut interrupt = match signal(SignalKind::interrupt()) {
        Ok(sig) => sig,
        Err(e) => {
            error!(error = %e, "Failed to install SIGINT handler");
            return None;
        }
    };

    tokio::select! {
        _ = terminate.recv() => Some("SIGTERM"),
        _ = interrupt.recv() => Some("SIGINT"),
    }
}

#[cfg(not(unix))]
async fn next_signal() -> Option<&'static str> {
    match tokio::signal::ctrl_c().await {
        Ok(()) => Some("ctrl_c"),
        Err(e) => {
            error!(error = %e, "Failed to install Ctrl+C handler");
            None
        }
    }
}

/// Serve `app` on `listener` until the lifecycle drains.
pub async fn run(
    listener: TcpListener,
    app: Router,
    lifecycle: &Arc<Lifecycle>,
) -> io::Result<ShutdownOutcome> {
    let server = axum::serve(listener, app).with_graceful_shutdown(lifecycle.shutdown_signal());
    lifecycle.drive(server.into_future()).await
}
