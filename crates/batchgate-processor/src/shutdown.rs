//! Two-stage shutdown.
//!
//! The first trigger starts a graceful drain: no new jobs are dequeued and
//! running jobs stop starting new lines. A second trigger forces shutdown
//! without waiting for the drain.

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Which stage a trigger reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownStage {
    Graceful,
    Forced,
}

/// Process-wide shutdown signal. Clones share state.
#[derive(Debug, Clone, Default)]
pub struct Shutdown {
    graceful: CancellationToken,
    forced: CancellationToken,
}

impl Shutdown {
    pub fn new() -> Self {
        Self::default()
    }

    /// Advance one stage.
    pub fn trigger(&self) -> ShutdownStage {
        if self.graceful.is_cancelled() {
            self.forced.cancel();
            ShutdownStage::Forced
        } else {
            self.graceful.cancel();
            ShutdownStage::Graceful
        }
    }

    /// Jump straight to the forced stage.
    pub fn force(&self) {
        self.graceful.cancel();
        self.forced.cancel();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.graceful.is_cancelled()
    }

    pub fn is_forced(&self) -> bool {
        self.forced.is_cancelled()
    }

    /// Resolves once the graceful stage has begun.
    pub async fn cancelled(&self) {
        self.graceful.cancelled().await
    }

    /// Resolves once shutdown is forced.
    pub async fn forced(&self) {
        self.forced.cancelled().await
    }

    /// Token cancelled at the graceful stage, for running jobs.
    pub fn token(&self) -> CancellationToken {
        self.graceful.clone()
    }
}

/// Trigger `shutdown` on SIGINT or SIGTERM, once per signal.
pub fn listen_for_signals(shutdown: Shutdown) -> JoinHandle<()> {
    tokio::spawn(async move {
        #[cfg(unix)]
        let mut terminate =
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(signal) => signal,
                Err(e) => {
                    warn!(error = %e, "Failed to install SIGTERM handler");
                    return;
                }
            };

        loop {
            #[cfg(unix)]
            let received = tokio::select! {
                r = tokio::signal::ctrl_c() => r.map(|_| "SIGINT"),
                _ = terminate.recv() => Ok("SIGTERM"),
            };
            #[cfg(not(unix))]
            let received = tokio::signal::ctrl_c().await.map(|_| "ctrl-c");

            let signal = match received {
                Ok(signal) => signal,
                Err(e) => {
                    warn!(error = %e, "Failed to listen for shutdown signals");
                    return;
                }
            };

            match shutdown.trigger() {
                ShutdownStage::Graceful => {
                    info!(signal, "Shutdown signal received, draining in-flight jobs")
                }
                ShutdownStage::Forced => {
                    warn!(signal, "Second shutdown signal received, forcing exit");
                    return;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_two_stages() {
        let shutdown = Shutdown::new();
        assert!(!shutdown.is_shutting_down());

        assert_eq!(shutdown.trigger(), ShutdownStage::Graceful);
        assert!(shutdown.is_shutting_down());
        assert!(!shutdown.is_forced());

        assert_eq!(shutdown.trigger(), ShutdownStage::Forced);
        assert!(shutdown.is_forced());
        assert_eq!(shutdown.trigger(), ShutdownStage::Forced);
    }

    #[test]
    fn test_force_skips_graceful() {
        let shutdown = Shutdown::new();
        shutdown.force();
        assert!(shutdown.is_shutting_down());
        assert!(shutdown.is_forced());
    }

    #[tokio::test]
    async fn test_clones_share_state() {
        let shutdown = Shutdown::new();
        let token = shutdown.token();
        let waiter = {
            let shutdown = shutdown.clone();
            tokio::spawn(async move { shutdown.cancelled().await })
        };

        shutdown.trigger();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(token.is_cancelled());
    }
}
