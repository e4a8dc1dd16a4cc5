//! Graceful shutdown controller for the meridian node.
//!
//! Listens for SIGINT/SIGTERM and cancels a shared
//! [`CancellationToken`] that every background loop selects on.

use tokio::signal;
use tokio_util::sync::CancellationToken;

pub struct ShutdownController {
    token: CancellationToken,
}

impl ShutdownController {
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
        }
    }

    /// A token cancelled when shutdown starts. Child tokens are cancelled
    /// with it.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Trigger shutdown programmatically.
    pub fn shutdown(&self) {
        self.token.cancel();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Wait for SIGTERM, SIGINT or a programmatic shutdown.
    pub async fn wait_for_signal(&self) {
        let ctrl_c = signal::ctrl_c();

        #[cfg(unix)]
        let terminate = async {
            match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                Ok(mut sig) => {
                    sig.recv().await;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "cannot install SIGTERM handler");
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => { tracing::info!("received SIGINT, shutting down"); }
            _ = terminate => { tracing::info!("received SIGTERM, shutting down"); }
            _ = self.token.cancelled() => {}
        }

        self.shutdown();
    }
}

impl Default for ShutdownController {
    fn default() -> Self {
        Self::new()
    }
}
