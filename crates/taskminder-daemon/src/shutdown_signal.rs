//! Waits for Ctrl-C or SIGTERM so timers can be torn down cleanly.

use tokio::signal;
use tracing::info;

pub(super) async fn shutdown_signal() {
    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    let reason = tokio::select! {
        _ = signal::ctrl_c() => "interrupt",
        _ = terminate => "terminate",
    };
    info!(reason, "shutdown requested");
}
