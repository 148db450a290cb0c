//! Signal handling for graceful shutdown.

use tracing::info;

/// Wait for a shutdown signal (SIGINT, SIGTERM, or SIGQUIT on Unix).
///
/// A signal whose handler cannot be installed is logged and never fires;
/// the others still do.
#[cfg(unix)]
pub async fn shutdown_signal() {
    use tokio::signal::unix::SignalKind;

    let name = tokio::select! {
        name = unix::recv(SignalKind::interrupt(), "SIGINT") => name,
        name = unix::recv(SignalKind::terminate(), "SIGTERM") => name,
        name = unix::recv(SignalKind::quit(), "SIGQUIT") => name,
    };
    info!(message = "Signal received.", signal = name);
}

#[cfg(unix)]
mod unix {
    use tokio::signal::unix::{SignalKind, signal};
    use tracing::warn;

    pub(super) async fn recv(kind: SignalKind, name: &'static str) -> &'static str {
        match signal(kind) {
            Ok(mut stream) => {
                stream.recv().await;
                name
            }
            Err(e) => {
                warn!(signal = name, error = %e, "Failed to install signal handler");
                std::future::pending().await
            }
        }
    }
}

/// Wait for Ctrl-C on platforms without Unix signals.
#[cfg(not(unix))]
pub async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_ok() {
        info!(message = "Signal received.", signal = "CTRL_C");
    }
}
