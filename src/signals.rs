//! OS signal handling for graceful shutdown

use tokio_util::sync::CancellationToken;

use herd_core::prelude::*;

/// Spawn a task that cancels `cancel` on SIGINT or SIGTERM
pub fn spawn_signal_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        tokio::select! {
            _ = cancel.cancelled() => {}
            outcome = wait_for_signal() => match outcome {
                Ok(()) => {
                    info!("Shutdown signal received");
                    cancel.cancel();
                }
                Err(e) => error!("Signal handler error: {}", e),
            }
        }
    });
}

/// Wait for a termination signal
async fn wait_for_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigint = signal(SignalKind::interrupt())?;
        let mut sigterm = signal(SignalKind::terminate())?;

        tokio::select! {
            _ = sigint.recv() => {
                info!("Received SIGINT");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM");
            }
        }

        Ok(())
    }

    #[cfg(windows)]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_signal_handler_spawn() {
        let cancel = CancellationToken::new();
        spawn_signal_handler(cancel.clone());

        tokio::time::sleep(tokio::time::Duration::from_millis(10)).await;
        assert!(!cancel.is_cancelled());

        // Cancelling from elsewhere also ends the handler task
        cancel.cancel();
    }
}
