//! Graceful shutdown signalling.
//!
//! Every pipeline loop checks the signal between iterations; in-flight
//! database transactions run to completion before the loop exits.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::signal;
use tokio::sync::Notify;
use tracing::info;

/// Shutdown signal shared by all component loops.
#[derive(Clone)]
pub struct ShutdownSignal {
    shutdown: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        Self {
            shutdown: Arc::new(AtomicBool::new(false)),
            notify: Arc::new(Notify::new()),
        }
    }

    /// Check whether shutdown has been requested.
    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Request shutdown; all clones observe it.
    pub fn trigger(&self) {
        if !self.shutdown.swap(true, Ordering::SeqCst) {
            info!("shutdown requested");
            self.notify.notify_waiters();
        }
    }

    /// Wait until shutdown is signalled.
    pub async fn wait(&self) {
        if self.is_shutdown() {
            return;
        }
        self.notify.notified().await;
    }

    /// Sleep for `duration`, returning early if shutdown is signalled.
    pub async fn sleep(&self, duration: std::time::Duration) {
        tokio::select! {
            _ = tokio::time::sleep(duration) => {}
            _ = self.wait() => {}
        }
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// Spawn a task that triggers the signal on SIGTERM / Ctrl-C.
pub fn listen_for_signals(signal_handle: ShutdownSignal) {
    tokio::spawn(async move {
        let ctrl_c = async {
            let _ = signal::ctrl_c().await;
        };

        #[cfg(unix)]
        let terminate = async {
            match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                Ok(mut sig) => {
                    sig.recv().await;
                }
                Err(_) => std::future::pending::<()>().await,
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => info!("received ctrl-c"),
            _ = terminate => info!("received SIGTERM"),
        }

        signal_handle.trigger();
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn trigger_is_observed_by_clones() {
        let signal = ShutdownSignal::new();
        let clone = signal.clone();
        assert!(!clone.is_shutdown());

        signal.trigger();
        assert!(clone.is_shutdown());
        // wait() returns immediately once shut down.
        clone.wait().await;
    }

    #[tokio::test]
    async fn sleep_returns_early_on_trigger() {
        let signal = ShutdownSignal::new();
        let clone = signal.clone();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            clone.trigger();
        });

        let start = std::time::Instant::now();
        signal.sleep(Duration::from_secs(5)).await;
        assert!(start.elapsed() < Duration::from_secs(1));
    }
}
