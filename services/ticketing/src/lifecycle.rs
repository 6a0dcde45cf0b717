//! Process lifecycle shared by both service binaries.

use outpost_runtime::ServiceHandle;
use std::time::Duration;
use tracing::{info, warn};

/// Resolve on Ctrl+C or, on Unix, SIGTERM.
///
/// A signal source that cannot be installed is logged and ignored; the other
/// one still triggers shutdown.
pub async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            },
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            },
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("Received Ctrl+C, shutting down"),
        () = terminate => info!("Received SIGTERM, shutting down"),
    }
}

/// Stop background services in order, giving each up to `timeout`.
///
/// Returns `true` if every service stopped in time.
pub async fn await_shutdown(services: Vec<ServiceHandle>, timeout: Duration) -> bool {
    let mut clean = true;
    for service in services {
        let name = service.name();
        if !service.stop(timeout).await {
            warn!(service = name, "Service did not stop in time");
            clean = false;
        }
    }
    clean
}
