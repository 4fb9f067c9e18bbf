use tokio::signal;
use tokio_util::sync::CancellationToken;

/// Cancels `shutdown` on Ctrl+C or SIGTERM. Returns early if `shutdown` is
/// cancelled from elsewhere first.
pub async fn shutdown_signal(shutdown: CancellationToken) {
    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received Ctrl+C signal");
        },
        () = terminate => {
            tracing::info!("Received SIGTERM signal");
        },
        () = shutdown.cancelled() => return,
    }

    tracing::info!("Shutdown signal received, releasing the slot...");
    shutdown.cancel();
}
