use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info};

use crate::handlers::HandlerRegistry;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Phase {
    Running,
    DrainSignaled,
    Delaying,
    ShuttingDown,
    Stopped,
}

/// SIGINT / SIGTERM, registered up front so a failure surfaces at startup.
pub struct TerminationSignal {
    #[cfg(unix)]
    interrupt: tokio::signal::unix::Signal,
    #[cfg(unix)]
    terminate: tokio::signal::unix::Signal,
}

impl TerminationSignal {
    #[cfg(unix)]
    pub fn register() -> std::io::Result<Self> {
        use tokio::signal::unix::{SignalKind, signal};
        Ok(Self {
            interrupt: signal(SignalKind::interrupt())?,
            terminate: signal(SignalKind::terminate())?,
        })
    }

    #[cfg(not(unix))]
    pub fn register() -> std::io::Result<Self> {
        Ok(Self {})
    }

    /// Resolves with the name of the first signal received.
    #[cfg(unix)]
    pub async fn recv(&mut self) -> &'static str {
        tokio::select! {
            _ = self.interrupt.recv() => "SIGINT",
            _ = self.terminate.recv() => "SIGTERM",
        }
    }

    #[cfg(not(unix))]
    pub async fn recv(&mut self) -> &'static str {
        let _ = tokio::signal::ctrl_c().await;
        "ctrl-c"
    }
}

/// Drives one shutdown cycle: stop every handler, hold for the configured
/// delay while the listener keeps serving, then release the listener.
pub struct ShutdownCoordinator {
    registry: Arc<HandlerRegistry>,
    delay: Duration,
    phase: watch::Sender<Phase>,
}

impl ShutdownCoordinator {
    pub fn new(registry: Arc<HandlerRegistry>, delay: Duration) -> Self {
        let (phase, _) = watch::channel(Phase::Running);
        Self {
            registry,
            delay,
            phase,
        }
    }

    pub fn phase(&self) -> Phase {
        *self.phase.borrow()
    }

    #[cfg(test)]
    pub fn subscribe(&self) -> watch::Receiver<Phase> {
        self.phase.subscribe()
    }

    fn advance(&self, next: Phase) {
        debug!(from = ?self.phase(), to = ?next, "shutdown phase");
        self.phase.send_replace(next);
    }

    /// Returns once the listener should stop accepting new connections.
    /// Only the first `signal` is honored.
    pub async fn drain<F>(&self, signal: F)
    where
        F: Future,
        F::Output: fmt::Debug,
    {
        let received = signal.await;
        info!(signal = ?received, "signal received, signaling handlers");
        self.advance(Phase::DrainSignaled);
        self.registry.shutdown_all();

        self.advance(Phase::Delaying);
        info!(delay = ?self.delay, "shutting down with delay");
        tokio::time::sleep(self.delay).await;
        info!("proceeding with shutdown");

        self.advance(Phase::ShuttingDown);
    }

    pub fn finish(&self) {
        self.advance(Phase::Stopped);
        info!("shutdown complete");
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::ServerOptions;
    use crate::snapshot::ServerSnapshot;
    use chrono::Utc;
    use tokio::sync::oneshot;

    fn coordinator(delay: Duration) -> (ServerSnapshot, Arc<ShutdownCoordinator>) {
        let snapshot = ServerSnapshot::new("box", Utc::now());
        let registry = HandlerRegistry::standard(&snapshot, &ServerOptions::default()).unwrap();
        (
            snapshot,
            Arc::new(ShutdownCoordinator::new(Arc::new(registry), delay)),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn walks_phases_in_order() {
        let (snapshot, coordinator) = coordinator(Duration::from_secs(15));
        let mut phases = coordinator.subscribe();
        assert_eq!(coordinator.phase(), Phase::Running);

        let (tx, rx) = oneshot::channel::<()>();
        let drain = tokio::spawn({
            let coordinator = coordinator.clone();
            async move { coordinator.drain(rx).await }
        });

        tokio::task::yield_now().await;
        assert_eq!(coordinator.phase(), Phase::Running);
        assert!(!snapshot.is_stopping());

        tx.send(()).unwrap();
        phases.wait_for(|p| *p == Phase::Delaying).await.unwrap();
        assert!(snapshot.is_stopping());

        tokio::time::advance(Duration::from_secs(14)).await;
        assert_eq!(coordinator.phase(), Phase::Delaying);

        drain.await.unwrap();
        assert_eq!(coordinator.phase(), Phase::ShuttingDown);
        coordinator.finish();
        assert_eq!(coordinator.phase(), Phase::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn holds_for_the_full_delay() {
        let (_, coordinator) = coordinator(Duration::from_secs(5));
        let start = tokio::time::Instant::now();
        coordinator.drain(async { "SIGTERM" }).await;
        assert!(start.elapsed() >= Duration::from_secs(5));
    }

    #[test]
    fn phases_are_ordered() {
        assert!(Phase::Running < Phase::DrainSignaled);
        assert!(Phase::Delaying < Phase::ShuttingDown);
        assert!(Phase::ShuttingDown < Phase::Stopped);
    }
}
