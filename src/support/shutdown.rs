//! Shutdown signalling
//!
//! A [`ShutdownSignal`] is a one-shot latch shared by every task an
//! endpoint spawns. Once triggered it stays triggered, so a task that
//! subscribes late still observes it.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{info, warn};

/// Shutdown signal that can be cloned and shared across tasks
#[derive(Clone, Debug)]
pub struct ShutdownSignal {
    sender: Arc<watch::Sender<bool>>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        let (sender, _) = watch::channel(false);
        Self {
            sender: Arc::new(sender),
        }
    }

    pub fn is_triggered(&self) -> bool {
        *self.sender.borrow()
    }

    /// Trigger the signal. Returns `true` for the call that actually fired it.
    pub fn trigger(&self) -> bool {
        self.sender.send_if_modified(|triggered| {
            let fire = !*triggered;
            *triggered = true;
            fire
        })
    }

    /// Resolve once the signal has been triggered.
    pub fn wait(&self) -> impl Future<Output = ()> + Send + 'static {
        let mut rx = self.sender.subscribe();
        async move {
            // The sender lives inside `self`'s clones; an error means every
            // clone was dropped, which also ends the wait.
            let _ = rx.wait_for(|triggered| *triggered).await;
        }
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// Listen for OS shutdown signals (SIGTERM, SIGINT) and trigger `shutdown`.
pub async fn listen_for_shutdown_signals(shutdown: ShutdownSignal) -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;

        tokio::select! {
            _ = sigterm.recv() => {
                info!("📡 Received SIGTERM signal");
            }
            _ = sigint.recv() => {
                info!("📡 Received SIGINT signal (Ctrl+C)");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("📡 Received Ctrl+C signal");
    }

    shutdown.trigger();
    Ok(())
}

/// Run `cleanup` once `signal` fires, bounded by `timeout`.
///
/// Returns `false` when the cleanup did not finish in time.
pub async fn shutdown_with_cleanup<F, Fut>(signal: &ShutdownSignal, timeout: Duration, cleanup: F) -> bool
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = ()>,
{
    signal.wait().await;
    info!("⏳ Starting graceful shutdown (timeout: {:?})...", timeout);

    match tokio::time::timeout(timeout, cleanup()).await {
        Ok(()) => {
            info!("✅ Graceful shutdown completed");
            true
        }
        Err(_) => {
            warn!("⚠️ Graceful shutdown timed out after {:?}", timeout);
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn trigger_fires_once() {
        let signal = ShutdownSignal::new();
        assert!(!signal.is_triggered());
        assert!(signal.trigger());
        assert!(!signal.trigger());
        assert!(signal.is_triggered());
    }

    #[tokio::test]
    async fn late_waiter_sees_trigger() {
        let signal = ShutdownSignal::new();
        signal.trigger();
        tokio::time::timeout(Duration::from_millis(100), signal.wait())
            .await
            .expect("wait should resolve immediately");
    }

    #[tokio::test]
    async fn waiter_wakes_on_trigger() {
        let signal = ShutdownSignal::new();
        let wait = signal.wait();
        let handle = tokio::spawn(wait);
        tokio::time::sleep(Duration::from_millis(10)).await;
        signal.trigger();
        tokio::time::timeout(Duration::from_millis(200), handle)
            .await
            .expect("waiter should wake")
            .unwrap();
    }

    #[tokio::test]
    async fn cleanup_timeout_reports_false() {
        let signal = ShutdownSignal::new();
        signal.trigger();
        let finished = shutdown_with_cleanup(&signal, Duration::from_millis(20), || async {
            tokio::time::sleep(Duration::from_secs(5)).await;
        })
        .await;
        assert!(!finished);
    }
}
