//! Coordinates graceful termination of the capture and evaluation tasks.

use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Why the daemon is stopping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    /// Ctrl+C or SIGTERM
    Signal,
    /// A task cancelled the shared token itself (e.g. a capture failure)
    Internal,
}

pub struct ShutdownManager {
    /// Token to signal shutdown to all tasks
    cancel_token: CancellationToken,
    task_handles: Vec<JoinHandle<()>>,
    grace_period: Duration,
}

impl ShutdownManager {
    pub fn new() -> Self {
        Self::with_grace_period(Duration::from_secs(10))
    }

    pub fn with_grace_period(grace_period: Duration) -> Self {
        Self {
            cancel_token: CancellationToken::new(),
            task_handles: Vec::new(),
            grace_period,
        }
    }

    /// Get a clone of the cancellation token for spawning tasks
    pub fn token(&self) -> CancellationToken {
        self.cancel_token.clone()
    }

    pub fn register_task(&mut self, handle: JoinHandle<()>) {
        self.task_handles.push(handle);
    }

    /// Wait for a termination signal or an internal cancel, then stop all
    /// registered tasks. Tasks still running after the grace period are
    /// abandoned.
    pub async fn wait_for_shutdown(self) -> ShutdownReason {
        let reason = tokio::select! {
            _ = terminate_signal() => {
                tracing::info!("🛑 Shutdown signal received");
                ShutdownReason::Signal
            }
            _ = self.cancel_token.cancelled() => {
                tracing::warn!("🛑 Shutdown requested internally");
                ShutdownReason::Internal
            }
        };

        self.shutdown().await;
        reason
    }

    /// Cancel all tasks and wait for them up to the grace period.
    pub async fn shutdown(mut self) {
        self.cancel_token.cancel();

        let shutdown_tasks = std::pin::pin!(async {
            for handle in self.task_handles.drain(..) {
                if let Err(e) = handle.await {
                    tracing::error!("Task failed during shutdown: {}", e);
                }
            }
        });

        match tokio::time::timeout(self.grace_period, shutdown_tasks).await {
            Ok(_) => {
                tracing::info!("✓ All tasks shut down gracefully");
            }
            Err(_) => {
                tracing::warn!("⏱️  Shutdown timeout: Some tasks did not complete");
            }
        }
    }
}

impl Default for ShutdownManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(unix)]
async fn terminate_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(e) => {
            tracing::warn!("Failed to install SIGTERM handler: {}", e);
            ctrl_c().await;
            return;
        }
    };

    tokio::select! {
        _ = ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}

#[cfg(not(unix))]
async fn terminate_signal() {
    ctrl_c().await;
}

async fn ctrl_c() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_internal_cancel_stops_tasks() {
        let mut manager = ShutdownManager::with_grace_period(Duration::from_secs(1));
        let stopped = Arc::new(AtomicBool::new(false));

        let token = manager.token();
        let flag = stopped.clone();
        manager.register_task(tokio::spawn(async move {
            token.cancelled().await;
            flag.store(true, Ordering::SeqCst);
        }));

        let trigger = manager.token();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        assert_eq!(manager.wait_for_shutdown().await, ShutdownReason::Internal);
        assert!(stopped.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_grace_period_abandons_stuck_task() {
        let mut manager = ShutdownManager::with_grace_period(Duration::from_millis(50));
        manager.register_task(tokio::spawn(async {
            tokio::time::sleep(Duration::from_secs(60)).await;
        }));

        let started = tokio::time::Instant::now();
        manager.shutdown().await;
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
