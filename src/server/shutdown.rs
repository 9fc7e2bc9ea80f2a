//! Graceful shutdown trigger for the control surface

use std::future::Future;
use std::io;

use tracing::{error, info};

/// Resolve once `signal` fires.
///
/// If the listener cannot be installed this never resolves, so the server
/// keeps running.
pub async fn wait_for_shutdown<F>(signal: F)
where
    F: Future<Output = io::Result<()>>,
{
    match signal.await {
        Ok(()) => info!("Shutdown signal received"),
        Err(e) => {
            error!("Failed to listen for shutdown signal: {}", e);
            std::future::pending::<()>().await;
        }
    }
}

/// Wait for Ctrl-C
pub async fn shutdown_signal() {
    wait_for_shutdown(tokio::signal::ctrl_c()).await
}
