//! Process signals that start a graceful shutdown.

use std::future::Future;

/// Installs SIGINT and SIGTERM handlers and returns a future that resolves on
/// the first of them.
///
/// The handlers are in place before this returns, so a signal that arrives
/// before the future is first polled still counts.
#[cfg(unix)]
pub fn shutdown_signal() -> impl Future<Output = ()> {
    use tokio::signal::unix::{signal, Signal, SignalKind};

    fn install(kind: SignalKind, name: &str) -> Option<Signal> {
        match signal(kind) {
            Ok(sig) => Some(sig),
            Err(e) => {
                log::error!("Failed to install {} handler: {}", name, e);
                None
            }
        }
    }

    async fn recv(sig: Option<Signal>) {
        match sig {
            Some(mut sig) => {
                sig.recv().await;
            }
            None => std::future::pending().await,
        }
    }

    let interrupt = install(SignalKind::interrupt(), "SIGINT");
    let terminate = install(SignalKind::terminate(), "SIGTERM");

    async move {
        tokio::select! {
            _ = recv(interrupt) => log::info!("Received SIGINT, shutting down"),
            _ = recv(terminate) => log::info!("Received SIGTERM, shutting down"),
        }
    }
}

#[cfg(not(unix))]
pub fn shutdown_signal() -> impl Future<Output = ()> {
    async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            log::error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
        log::info!("Ctrl+C received, shutting down");
    }
}
