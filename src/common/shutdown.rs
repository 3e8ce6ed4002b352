//! Unified shutdown handling
//!
//! # Design Principles (KISS)
//! - Single function to setup Ctrl+C / SIGTERM handling with a broadcast channel
//! - Returns (sender, receiver) for component use
//! - Components call run(shutdown_rx) and `resubscribe()` for their tasks

use tokio::signal;
use tokio::sync::broadcast;
use tracing::{info, warn};

/// Shutdown signal type (unit type, just signals "shutdown now")
pub type ShutdownSignal = ();

/// Shutdown channel sender
pub type ShutdownSender = broadcast::Sender<ShutdownSignal>;

/// Shutdown channel receiver
pub type ShutdownReceiver = broadcast::Receiver<ShutdownSignal>;

/// Setup shutdown handling with Ctrl+C and SIGTERM
///
/// Creates a broadcast channel and spawns a task that sends on the first
/// termination signal. Kubernetes stops pods with SIGTERM, so both are
/// handled.
///
/// # Example
/// ```ignore
/// let (_shutdown_tx, shutdown_rx) = setup_shutdown();
/// tailer.run(std::io::stdout(), shutdown_rx).await?;
/// ```
pub fn setup_shutdown() -> (ShutdownSender, ShutdownReceiver) {
    let (tx, rx) = broadcast::channel::<ShutdownSignal>(1);

    let tx_clone = tx.clone();
    tokio::spawn(async move {
        wait_for_signal().await;
        let _ = tx_clone.send(());
    });

    (tx, rx)
}

#[cfg(unix)]
async fn wait_for_signal() {
    let mut terminate = match signal::unix::signal(signal::unix::SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            warn!(error = %e, "Failed to listen for SIGTERM, only Ctrl+C will stop the tailer");
            wait_for_ctrl_c().await;
            return;
        }
    };

    tokio::select! {
        _ = wait_for_ctrl_c() => {}
        _ = terminate.recv() => info!("SIGTERM received, initiating shutdown"),
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    wait_for_ctrl_c().await;
}

async fn wait_for_ctrl_c() {
    match signal::ctrl_c().await {
        Ok(()) => info!("Ctrl+C received, initiating shutdown"),
        Err(e) => {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_shutdown_channel_creation() {
        let (tx, mut rx) = broadcast::channel::<ShutdownSignal>(1);

        tx.send(()).unwrap();

        let result = rx.recv().await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_resubscribed_receivers_see_signal() {
        let (tx, rx) = setup_shutdown();
        let mut a = rx.resubscribe();
        let mut b = tx.subscribe();

        tx.send(()).unwrap();

        assert!(a.recv().await.is_ok());
        assert!(b.recv().await.is_ok());
    }
}
