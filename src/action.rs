//! Timeout actions an owner can hand to a [`Watchdog`](crate::Watchdog).
//!
//! The watchdog only detects that feeding stopped. What happens next is the
//! owner's policy, expressed as a [`TimeoutAction`]. Actions run on the
//! watchdog's check task, so they should return quickly.

use nix::errno::Errno;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Zero-argument callback invoked when a liveness timeout is detected.
pub type TimeoutAction = Arc<dyn Fn() + Send + Sync>;

/// Log the disconnect at error level and terminate the process immediately,
/// skipping destructors and any graceful shutdown.
///
/// This is the default action of [`Watchdog::new`](crate::Watchdog::new).
pub fn exit_process(source: &str, code: i32) -> TimeoutAction {
    let source = source.to_string();
    Arc::new(move || {
        tracing::error!(
            source = %source,
            exit_code = code,
            "watchdog timeout: {source} disconnected, self-destructing"
        );
        std::process::exit(code);
    })
}

/// Alert and keep running.
pub fn log_only(source: &str) -> TimeoutAction {
    let source = source.to_string();
    Arc::new(move || {
        tracing::warn!(source = %source, "watchdog timeout: {source} has gone quiet");
    })
}

/// Cancel `token` so the owner can run its own shutdown.
pub fn cancel(token: CancellationToken) -> TimeoutAction {
    Arc::new(move || token.cancel())
}

/// Deliver `signal` to every process in group `pgid`.
///
/// A group that has already exited is not an error.
pub fn signal_process_group(pgid: i32, signal: Signal) -> TimeoutAction {
    Arc::new(move || deliver(pgid, signal))
}

pub(crate) fn deliver(pgid: i32, signal: Signal) {
    match killpg(Pid::from_raw(pgid), signal) {
        Ok(()) => tracing::info!(pgid, signal = signal.as_str(), "signalled process group"),
        Err(Errno::ESRCH) => tracing::debug!(pgid, "process group already gone"),
        Err(e) => tracing::warn!(
            pgid,
            signal = signal.as_str(),
            error = %e,
            "failed to signal process group"
        ),
    }
}

/// Run each action in order.
pub fn chain(actions: Vec<TimeoutAction>) -> TimeoutAction {
    Arc::new(move || {
        for action in &actions {
            action();
        }
    })
}
