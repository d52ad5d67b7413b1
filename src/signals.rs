/// Signal handling for graceful shutdown.
///
/// SIGINT (Ctrl-C) and SIGTERM both cancel the shutdown token; the supervisor
/// forwards that to the child as SIGTERM. The watchdog itself is unaffected.
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;

/// Spawn a listener that cancels `token` on the first SIGINT or SIGTERM.
pub fn install(token: CancellationToken) -> std::io::Result<()> {
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => tracing::info!("received SIGTERM, shutting down"),
            _ = sigint.recv() => tracing::info!("received SIGINT, shutting down"),
            _ = token.cancelled() => return,
        }
        token.cancel();
    });
    Ok(())
}
