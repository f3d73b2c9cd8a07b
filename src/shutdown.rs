//! Process termination handling shared by the server and worker binaries.

/// Resolve once the process is asked to stop (SIGINT or SIGTERM).
///
/// Only ctrl-c is wired on non-unix targets.
pub async fn wait_for_termination() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm =
            signal(SignalKind::terminate()).expect("SIGTERM handler registration failed");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }

    tracing::info!("termination signal received, shutting down");
}
