/// Child supervision: spawn a command, treat every line it prints as a
/// watchdog feed, and signal its process group if it goes quiet for too long.
use crate::action;
use crate::config::{ConfigError, DeadmanConfig};
use crate::watchdog::{Watchdog, WatchdogError};
use nix::sys::signal::Signal;
use std::os::unix::process::ExitStatusExt;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// How long to keep draining output after the child exits. A grandchild
/// that inherited the pipes can otherwise hold them open indefinitely.
const DRAIN_GRACE: Duration = Duration::from_secs(1);

/// Result of a supervised run.
#[derive(Debug)]
pub struct SuperviseOutcome {
    /// Process exit code (None if killed by signal).
    pub exit_code: Option<i32>,
    /// Signal that terminated the child, if any.
    pub signal: Option<i32>,
    /// Whether the watchdog fired during the run.
    pub timed_out: bool,
    /// Wall-clock duration of the run.
    pub duration: Duration,
    /// Lines read from the child's stdout and stderr (each one a feed).
    pub lines: u64,
    /// Child PID (for logging/diagnostics).
    pub pid: u32,
}

impl SuperviseOutcome {
    /// Exit status to report for this run, shell-style for signal deaths.
    pub fn exit_status(&self, timeout_exit_code: i32) -> i32 {
        if self.timed_out {
            return timeout_exit_code;
        }
        match (self.exit_code, self.signal) {
            (Some(code), _) => code,
            (None, Some(sig)) => 128 + sig,
            (None, None) => 1,
        }
    }
}

/// Errors that can occur during a supervised run.
#[derive(Debug)]
pub enum SuperviseError {
    /// Supervisor settings were unusable.
    Config(ConfigError),
    /// Failed to spawn the child.
    Spawn {
        command: String,
        source: std::io::Error,
    },
    /// Failed waiting on the child.
    Io { source: std::io::Error },
    /// The watchdog could not be started.
    Watchdog(WatchdogError),
}

impl std::fmt::Display for SuperviseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SuperviseError::Config(e) => write!(f, "{}", e),
            SuperviseError::Spawn { command, source } => {
                write!(f, "failed to spawn {}: {}", command, source)
            }
            SuperviseError::Io { source } => write!(f, "I/O error while supervising: {}", source),
            SuperviseError::Watchdog(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for SuperviseError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SuperviseError::Config(e) => Some(e),
            SuperviseError::Spawn { source, .. } => Some(source),
            SuperviseError::Io { source } => Some(source),
            SuperviseError::Watchdog(e) => Some(e),
        }
    }
}

/// Run `command` under a watchdog until it exits.
///
/// The child gets its own process group so the timeout signal reaches
/// everything it spawned. Cancelling `shutdown` forwards SIGTERM to that group.
pub async fn run(
    command: &str,
    args: &[String],
    config: &DeadmanConfig,
    shutdown: CancellationToken,
) -> Result<SuperviseOutcome, SuperviseError> {
    config.validate().map_err(SuperviseError::Config)?;
    let kill_signal = config
        .supervise
        .kill_signal()
        .map_err(SuperviseError::Config)?;

    tracing::info!(command = %command, args = ?args, "spawning supervised command");
    let start = Instant::now();

    let mut child = Command::new(command)
        .args(args)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .process_group(0) // New process group for clean kill
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| SuperviseError::Spawn {
            command: command.to_string(),
            source: e,
        })?;

    let (pid, pgid) = process_group_id(child.id())?;
    tracing::info!(pid, "child started");

    let timed_out = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&timed_out);
    let watchdog = Watchdog::builder(command)
        .config(config.watchdog.clone())
        .on_timeout(action::chain(vec![
            Arc::new(move || flag.store(true, Ordering::SeqCst)),
            action::signal_process_group(pgid, kill_signal),
        ]))
        .build();

    let arm_on_output = config.supervise.arm_on_first_output;
    if arm_on_output {
        watchdog.set_enabled(false);
    }
    let handle = watchdog.start().map_err(SuperviseError::Watchdog)?;

    let lines = Arc::new(AtomicU64::new(0));
    let mut pumps: Vec<JoinHandle<()>> = Vec::new();
    if let Some(stdout) = child.stdout.take() {
        pumps.push(tokio::spawn(pump(
            stdout,
            tokio::io::stdout(),
            watchdog.clone(),
            arm_on_output,
            Arc::clone(&lines),
        )));
    }
    if let Some(stderr) = child.stderr.take() {
        pumps.push(tokio::spawn(pump(
            stderr,
            tokio::io::stderr(),
            watchdog.clone(),
            arm_on_output,
            Arc::clone(&lines),
        )));
    }

    let status = tokio::select! {
        status = child.wait() => status,
        _ = shutdown.cancelled() => {
            tracing::info!(pid, "forwarding shutdown to child");
            action::deliver(pgid, Signal::SIGTERM);
            child.wait().await
        }
    };
    handle.stop().await;
    let status = status.map_err(|e| SuperviseError::Io { source: e })?;

    for pump in pumps {
        let abort = pump.abort_handle();
        if tokio::time::timeout(DRAIN_GRACE, pump).await.is_err() {
            tracing::debug!("output still open after child exit, abandoning");
            abort.abort();
        }
    }

    let outcome = SuperviseOutcome {
        exit_code: status.code(),
        signal: status.signal(),
        timed_out: timed_out.load(Ordering::SeqCst),
        duration: start.elapsed(),
        lines: lines.load(Ordering::Relaxed),
        pid,
    };
    tracing::info!(
        exit_code = ?outcome.exit_code,
        signal = ?outcome.signal,
        timed_out = outcome.timed_out,
        lines = outcome.lines,
        duration_secs = outcome.duration.as_secs(),
        "supervised command finished"
    );
    Ok(outcome)
}

/// Process group id of a freshly spawned child, which leads its own group.
///
/// Group 0 would mean our own group to `killpg`, so a missing or out-of-range
/// pid is an error rather than a default.
fn process_group_id(pid: Option<u32>) -> Result<(u32, i32), SuperviseError> {
    let pid = pid.ok_or_else(|| SuperviseError::Io {
        source: std::io::Error::new(
            std::io::ErrorKind::Other,
            "child exited before its pid could be read",
        ),
    })?;
    match i32::try_from(pid) {
        Ok(pgid) if pgid > 0 => Ok((pid, pgid)),
        _ => Err(SuperviseError::Io {
            source: std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("child pid {pid} is not a usable process group id"),
            ),
        }),
    }
}

/// Copy `reader` to `writer` line by line, feeding the watchdog per line.
async fn pump<R, W>(
    reader: R,
    mut writer: W,
    watchdog: Watchdog,
    arm: bool,
    lines: Arc<AtomicU64>,
) where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(error = %e, "failed to read child output");
                break;
            }
        }

        if arm && !watchdog.is_enabled() {
            tracing::info!("first output from child, arming watchdog");
            watchdog.set_enabled(true);
        }
        watchdog.feed();
        lines.fetch_add(1, Ordering::Relaxed);

        if let Err(e) = writer.write_all(&buf).await {
            tracing::debug!(error = %e, "failed to forward child output");
            continue;
        }
        if let Err(e) = writer.flush().await {
            tracing::debug!(error = %e, "failed to flush child output");
        }
    }
}
