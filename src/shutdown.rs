//! Graceful shutdown handling.
//!
//! This module provides:
//! - Signal handling (SIGTERM, SIGINT, SIGHUP)
//! - A shutdown signal observed by the idle sweeper and the HTTP server
//! - Ordered teardown: stop the sweeper, then close every cached connection

use crate::cache::ConnectionCache;
use crate::constants::DEFAULT_DRAIN_TIMEOUT;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Shutdown signal that can be awaited.
#[derive(Clone)]
pub struct ShutdownSignal {
    receiver: watch::Receiver<bool>,
}

impl ShutdownSignal {
    /// Wait for the shutdown signal.
    pub async fn recv(&mut self) {
        let _ = self.receiver.wait_for(|&v| v).await;
    }

    /// Check if shutdown has been signaled without blocking.
    pub fn is_shutdown(&self) -> bool {
        *self.receiver.borrow()
    }
}

/// Controller for managing graceful shutdown.
pub struct ShutdownController {
    sender: watch::Sender<bool>,
    shutting_down: Arc<AtomicBool>,
    phase_sender: broadcast::Sender<ShutdownPhase>,

    /// Upper bound on waiting for the sweeper to stop.
    drain_timeout: Duration,
}

/// Shutdown phases for coordinated cleanup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownPhase {
    /// Shutdown has been initiated.
    Initiated,

    /// Waiting for the idle sweeper task to exit.
    StoppingSweeper,

    /// Closing cached database connections.
    ClosingConnections,

    /// Final cleanup complete.
    Complete,
}

impl std::fmt::Display for ShutdownPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShutdownPhase::Initiated => write!(f, "initiated"),
            ShutdownPhase::StoppingSweeper => write!(f, "stopping_sweeper"),
            ShutdownPhase::ClosingConnections => write!(f, "closing_connections"),
            ShutdownPhase::Complete => write!(f, "complete"),
        }
    }
}

impl ShutdownController {
    /// Create a new shutdown controller with the default drain timeout.
    pub fn new() -> Self {
        Self::with_drain_timeout(DEFAULT_DRAIN_TIMEOUT)
    }

    /// Create a shutdown controller with a custom drain timeout.
    pub fn with_drain_timeout(drain_timeout: Duration) -> Self {
        let (sender, _) = watch::channel(false);
        let (phase_sender, _) = broadcast::channel(16);

        Self {
            sender,
            shutting_down: Arc::new(AtomicBool::new(false)),
            phase_sender,
            drain_timeout,
        }
    }

    /// Get a shutdown signal receiver.
    pub fn signal(&self) -> ShutdownSignal {
        ShutdownSignal {
            receiver: self.sender.subscribe(),
        }
    }

    /// Subscribe to shutdown phase notifications.
    pub fn subscribe_phases(&self) -> broadcast::Receiver<ShutdownPhase> {
        self.phase_sender.subscribe()
    }

    /// Check if shutdown is in progress.
    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Initiate shutdown. Only the first call has any effect.
    pub fn shutdown(&self) {
        if self
            .shutting_down
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            info!("Initiating graceful shutdown...");
            let _ = self.sender.send(true);
            let _ = self.phase_sender.send(ShutdownPhase::Initiated);
        }
    }

    fn notify_phase(&self, phase: ShutdownPhase) {
        info!("Shutdown phase: {}", phase);
        let _ = self.phase_sender.send(phase);
    }

    /// Perform graceful shutdown.
    ///
    /// 1. Signals shutdown (stops the sweeper and the HTTP listener)
    /// 2. Waits for the sweeper task, up to the drain timeout
    /// 3. Closes every cached connection
    pub async fn graceful_shutdown(
        &self,
        cache: &ConnectionCache,
        sweeper: Option<JoinHandle<()>>,
    ) {
        self.shutdown();

        self.notify_phase(ShutdownPhase::StoppingSweeper);
        if let Some(handle) = sweeper {
            self.stop_sweeper(handle).await;
        }

        self.notify_phase(ShutdownPhase::ClosingConnections);
        info!("Connection cache at shutdown: {}", cache.stats());
        let closed = cache.close_all().await;
        info!("Closed {} cached connection(s)", closed);

        self.notify_phase(ShutdownPhase::Complete);
        info!("Graceful shutdown complete");
    }

    async fn stop_sweeper(&self, mut handle: JoinHandle<()>) {
        match tokio::time::timeout(self.drain_timeout, &mut handle).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("Idle sweeper ended abnormally: {}", e),
            Err(_) => {
                warn!(
                    "Idle sweeper did not stop within {:?}, aborting",
                    self.drain_timeout
                );
                handle.abort();
            }
        }
    }

    /// Get the drain timeout.
    pub fn drain_timeout(&self) -> Duration {
        self.drain_timeout
    }
}

impl Default for ShutdownController {
    fn default() -> Self {
        Self::new()
    }
}

/// Shared shutdown controller type.
pub type SharedShutdownController = Arc<ShutdownController>;

/// Create a shared shutdown controller from configuration.
pub fn new_shutdown_controller(config: &ShutdownConfig) -> SharedShutdownController {
    Arc::new(ShutdownController::with_drain_timeout(config.drain_timeout))
}

/// Install signal handlers for graceful shutdown.
///
/// SIGINT (Ctrl+C) everywhere; SIGTERM and SIGHUP on Unix. Each triggers
/// the shutdown controller.
pub async fn install_signal_handlers(controller: SharedShutdownController) {
    let ctrl_c_controller = controller.clone();

    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Received Ctrl+C, initiating shutdown...");
                ctrl_c_controller.shutdown();
            }
            Err(e) => {
                error!("Failed to listen for Ctrl+C signal: {}", e);
            }
        }
    });

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        for (kind, name) in [
            (SignalKind::terminate(), "SIGTERM"),
            (SignalKind::hangup(), "SIGHUP"),
        ] {
            let controller = controller.clone();
            tokio::spawn(async move {
                match signal(kind) {
                    Ok(mut stream) => {
                        stream.recv().await;
                        info!("Received {}, initiating shutdown...", name);
                        controller.shutdown();
                    }
                    Err(e) => {
                        error!("Failed to install {} handler: {}", name, e);
                    }
                }
            });
        }
    }
}

/// Shutdown configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShutdownConfig {
    /// Upper bound on waiting for background tasks to stop.
    pub drain_timeout: Duration,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
        }
    }
}
