//! Signal handling for graceful shutdown

use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{error, info, warn};

/// Setup signal handlers; the returned receiver flips to `true` on SIGINT or SIGTERM
pub fn setup_signal_handlers() -> Result<watch::Receiver<bool>> {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let shutdown_tx = Arc::new(shutdown_tx);

    // Handle Ctrl+C (SIGINT)
    {
        let shutdown_tx = shutdown_tx.clone();
        tokio::spawn(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for Ctrl+C signal: {}", e);
                return;
            }

            info!("Ctrl+C signal received");
            let _ = shutdown_tx.send(true);
        });
    }

    // Handle SIGTERM (Unix only)
    #[cfg(unix)]
    {
        use signal_hook::consts::SIGTERM;
        use std::sync::atomic::{AtomicBool, Ordering};

        let shutdown_flag = Arc::new(AtomicBool::new(false));
        signal_hook::flag::register(SIGTERM, shutdown_flag.clone())?;

        tokio::spawn(async move {
            loop {
                if shutdown_flag.load(Ordering::Relaxed) {
                    info!("SIGTERM signal received");
                    let _ = shutdown_tx.send(true);
                    break;
                }
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        });
    }

    Ok(shutdown_rx)
}

/// Resolve once `shutdown` is true or its sender is gone
pub async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    while !*shutdown.borrow() {
        if shutdown.changed().await.is_err() {
            break;
        }
    }
}

/// Wait for background loops to finish, abandoning any that overrun `limit`
pub async fn graceful_shutdown(tasks: Vec<(&'static str, JoinHandle<()>)>, limit: Duration) {
    info!("Starting graceful shutdown...");

    for (name, handle) in tasks {
        match timeout(limit, handle).await {
            Ok(Ok(())) => info!("{} stopped gracefully", name),
            Ok(Err(e)) => error!("{} task failed: {}", name, e),
            Err(_) => warn!("{} did not stop within {:?}, forcing shutdown", name, limit),
        }
    }

    info!("Graceful shutdown complete");
}
