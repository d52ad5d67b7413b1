//! Liveness watchdog: a dead man's switch for a controller connection.
//!
//! Arm it once with [`Watchdog::start`], call [`Watchdog::feed`] on every proof
//! that the monitored party is alive, and the check task invokes the timeout
//! action as soon as a tick finds the last feed older than the threshold.
//!
//! Feeding is a single atomic `fetch_max`; it never blocks and never contends
//! with the check task.

use crate::action::{self, TimeoutAction};
use crate::config::{FirePolicy, WatchdogConfig};
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Instrument};

/// Errors returned by [`Watchdog::start`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchdogError {
    /// `start` was already called on this watchdog (or a clone of it).
    AlreadyStarted,
    /// `start` was called outside a tokio runtime.
    NoRuntime,
}

impl fmt::Display for WatchdogError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WatchdogError::AlreadyStarted => write!(f, "watchdog is already started"),
            WatchdogError::NoRuntime => {
                write!(f, "watchdog must be started from within a tokio runtime")
            }
        }
    }
}

impl std::error::Error for WatchdogError {}

/// Point-in-time view of a watchdog, for status output.
#[derive(Debug, Clone, Serialize)]
pub struct WatchdogStatus {
    pub source: String,
    pub started: bool,
    pub enabled: bool,
    pub since_last_feed_ms: u64,
    pub timeout_ms: u64,
    pub fire_count: u64,
}

struct Inner {
    source: String,
    span: tracing::Span,
    /// Construction instant; feed times are stored as nanoseconds past it.
    base: Instant,
    last_feed_nanos: AtomicU64,
    enabled: AtomicBool,
    started: AtomicBool,
    fire_count: AtomicU64,
    check_interval: Duration,
    timeout: Duration,
    fire: FirePolicy,
    on_timeout: TimeoutAction,
}

impl Inner {
    fn feed(&self) {
        let nanos = self.nanos_since_base(Instant::now());
        // fetch_max keeps the timestamp monotonic when feeders race.
        self.last_feed_nanos.fetch_max(nanos, Ordering::AcqRel);
    }

    fn nanos_since_base(&self, at: Instant) -> u64 {
        let nanos = at.saturating_duration_since(self.base).as_nanos();
        u64::try_from(nanos).unwrap_or(u64::MAX)
    }

    fn last_feed(&self) -> Instant {
        self.base + Duration::from_nanos(self.last_feed_nanos.load(Ordering::Acquire))
    }

    fn since_last_feed(&self) -> Duration {
        self.since_nanos(self.last_feed_nanos.load(Ordering::Acquire))
    }

    fn since_nanos(&self, nanos: u64) -> Duration {
        Instant::now().saturating_duration_since(self.base + Duration::from_nanos(nanos))
    }
}

/// Process-wide liveness monitor.
///
/// Cloning is cheap and every clone shares the same clock, gate and check
/// task, so feeders can each hold their own handle.
#[derive(Clone)]
pub struct Watchdog {
    inner: Arc<Inner>,
}

impl fmt::Debug for Watchdog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Watchdog")
            .field("source", &self.inner.source)
            .field("check_interval", &self.inner.check_interval)
            .field("timeout", &self.inner.timeout)
            .field("fire", &self.inner.fire)
            .field("enabled", &self.is_enabled())
            .field("started", &self.is_started())
            .finish_non_exhaustive()
    }
}

/// Builder for a [`Watchdog`] with non-default timing or timeout action.
pub struct WatchdogBuilder {
    source: String,
    config: WatchdogConfig,
    on_timeout: Option<TimeoutAction>,
}

impl WatchdogBuilder {
    pub fn config(mut self, config: WatchdogConfig) -> Self {
        self.config = config;
        self
    }

    /// Replace the default exit-the-process action.
    pub fn on_timeout(mut self, action: TimeoutAction) -> Self {
        self.on_timeout = Some(action);
        self
    }

    pub fn build(self) -> Watchdog {
        let on_timeout = self
            .on_timeout
            .unwrap_or_else(|| action::exit_process(&self.source, 0));
        let span = tracing::info_span!("watchdog", source = %self.source);
        // tokio intervals panic on a zero period.
        let check_interval = self.config.check_interval().max(Duration::from_millis(1));

        Watchdog {
            inner: Arc::new(Inner {
                source: self.source,
                span,
                base: Instant::now(),
                last_feed_nanos: AtomicU64::new(0),
                enabled: AtomicBool::new(self.config.enabled),
                started: AtomicBool::new(false),
                fire_count: AtomicU64::new(0),
                check_interval,
                timeout: self.config.timeout(),
                fire: self.config.fire,
                on_timeout,
            }),
        }
    }
}

impl Watchdog {
    /// A watchdog with default timing (1s checks, 3s threshold) whose timeout
    /// action logs that `source` disconnected and exits the process with status 0.
    ///
    /// Nothing runs until [`start`](Self::start) is called.
    pub fn new(source: impl Into<String>) -> Self {
        Self::builder(source).build()
    }

    pub fn builder(source: impl Into<String>) -> WatchdogBuilder {
        WatchdogBuilder {
            source: source.into(),
            config: WatchdogConfig::default(),
            on_timeout: None,
        }
    }

    /// Record "now" as the latest proof of liveness.
    ///
    /// Safe to call from any number of tasks or threads, before or after `start`.
    pub fn feed(&self) {
        self.inner.feed();
    }

    /// Gate timeout detection. Enabling feeds first so the clock starts fresh;
    /// while disabled every tick is a no-op.
    pub fn set_enabled(&self, enable: bool) {
        if enable {
            self.inner.feed();
        }
        let was = self.inner.enabled.swap(enable, Ordering::AcqRel);
        if was != enable {
            debug!(parent: &self.inner.span, enabled = enable, "watchdog gate changed");
        }
    }

    /// Feed once, then spawn the check task on the current tokio runtime.
    ///
    /// The task runs until the process exits or the returned handle is
    /// stopped. Dropping the handle detaches it; the task keeps running.
    pub fn start(&self) -> Result<WatchdogHandle, WatchdogError> {
        let runtime =
            tokio::runtime::Handle::try_current().map_err(|_| WatchdogError::NoRuntime)?;
        if self.inner.started.swap(true, Ordering::AcqRel) {
            return Err(WatchdogError::AlreadyStarted);
        }

        self.inner.feed();

        let token = CancellationToken::new();
        let span = self.inner.span.clone();
        let task = runtime.spawn(
            check_loop(Arc::clone(&self.inner), token.clone()).instrument(span),
        );
        Ok(WatchdogHandle { token, task })
    }

    pub fn source(&self) -> &str {
        &self.inner.source
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.enabled.load(Ordering::Acquire)
    }

    pub fn is_started(&self) -> bool {
        self.inner.started.load(Ordering::Acquire)
    }

    /// Instant of the most recent feed (the construction instant if never fed).
    pub fn last_feed(&self) -> Instant {
        self.inner.last_feed()
    }

    pub fn since_last_feed(&self) -> Duration {
        self.inner.since_last_feed()
    }

    /// How many times the timeout action has been invoked.
    pub fn fire_count(&self) -> u64 {
        self.inner.fire_count.load(Ordering::Acquire)
    }

    pub fn status(&self) -> WatchdogStatus {
        WatchdogStatus {
            source: self.inner.source.clone(),
            started: self.is_started(),
            enabled: self.is_enabled(),
            since_last_feed_ms: u64::try_from(self.since_last_feed().as_millis())
                .unwrap_or(u64::MAX),
            timeout_ms: u64::try_from(self.inner.timeout.as_millis()).unwrap_or(u64::MAX),
            fire_count: self.fire_count(),
        }
    }
}

async fn check_loop(inner: Arc<Inner>, token: CancellationToken) {
    let mut ticker = tokio::time::interval_at(
        Instant::now() + inner.check_interval,
        inner.check_interval,
    );
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    info!(
        check_interval_ms = inner.check_interval.as_millis() as u64,
        timeout_ms = inner.timeout.as_millis() as u64,
        fire = %inner.fire,
        "watchdog armed"
    );

    // Feed stamp of the breach that last fired; a newer feed opens a new breach.
    let mut tripped: Option<u64> = None;
    loop {
        tokio::select! {
            biased;
            _ = token.cancelled() => {
                debug!("watchdog stopped");
                return;
            }
            _ = ticker.tick() => {}
        }

        if !inner.enabled.load(Ordering::Acquire) {
            continue;
        }

        let last = inner.last_feed_nanos.load(Ordering::Acquire);
        let elapsed = inner.since_nanos(last);
        if tripped.is_some_and(|fired_at| last > fired_at) || elapsed <= inner.timeout {
            if tripped.take().is_some() {
                info!(elapsed_ms = elapsed.as_millis() as u64, "liveness restored");
            }
            if elapsed <= inner.timeout {
                continue;
            }
        }

        if tripped.is_some() && inner.fire == FirePolicy::Once {
            continue;
        }
        tripped = Some(last);

        let fire_count = inner.fire_count.fetch_add(1, Ordering::AcqRel) + 1;
        warn!(
            elapsed_ms = elapsed.as_millis() as u64,
            timeout_ms = inner.timeout.as_millis() as u64,
            fire_count,
            "liveness timeout"
        );
        (inner.on_timeout)();
    }
}

/// Teardown handle for a started watchdog's check task.
#[derive(Debug)]
pub struct WatchdogHandle {
    token: CancellationToken,
    task: JoinHandle<()>,
}

impl WatchdogHandle {
    /// Ask the check task to stop without waiting for it.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Stop the check task and wait for it to exit.
    pub async fn stop(self) {
        self.token.cancel();
        if let Err(e) = self.task.await {
            if e.is_panic() {
                warn!(error = %e, "watchdog task panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    fn counting(fire: FirePolicy) -> (Watchdog, Arc<AtomicUsize>) {
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        let watchdog = Watchdog::builder("ui")
            .config(WatchdogConfig {
                check_interval_ms: 1000,
                timeout_ms: 3000,
                fire,
                enabled: true,
            })
            .on_timeout(Arc::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }))
            .build();
        (watchdog, fired)
    }

    #[tokio::test(start_paused = true)]
    async fn test_regular_feeding_never_fires() {
        let (watchdog, fired) = counting(FirePolicy::EveryTick);
        let _handle = watchdog.start().unwrap();

        for _ in 0..20 {
            tokio::time::sleep(ms(2900)).await;
            watchdog.feed();
        }
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert_eq!(watchdog.fire_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_feeds_implicitly() {
        let (watchdog, fired) = counting(FirePolicy::Once);
        // A long gap between construction and start must not count.
        tokio::time::sleep(ms(10_000)).await;
        let _handle = watchdog.start().unwrap();

        tokio::time::sleep(ms(2900)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fires_within_one_interval_of_threshold() {
        let (watchdog, fired) = counting(FirePolicy::Once);
        let _handle = watchdog.start().unwrap();

        // Tick at t=3 sees exactly 3s elapsed, which is not a breach.
        tokio::time::sleep(ms(3500)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        tokio::time::sleep(ms(600)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_last_feed_plus_threshold_scenario() {
        let (watchdog, fired) = counting(FirePolicy::Once);
        let _handle = watchdog.start().unwrap();

        tokio::time::sleep(ms(2500)).await;
        watchdog.feed();

        tokio::time::sleep(ms(2900)).await; // t = 5.4
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        tokio::time::sleep(ms(700)).await; // t = 6.1, first tick past 5.5
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fire_once_waits_for_recovery() {
        let (watchdog, fired) = counting(FirePolicy::Once);
        let _handle = watchdog.start().unwrap();

        tokio::time::sleep(ms(9500)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        // Recover at t=9.5, then go quiet again: next breach is seen at t=13.
        watchdog.feed();
        tokio::time::sleep(ms(3300)).await; // t = 12.8
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        tokio::time::sleep(ms(400)).await; // t = 13.2
        assert_eq!(fired.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fire_once_rearms_on_feed_between_ticks() {
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        let watchdog = Watchdog::builder("ui")
            .config(WatchdogConfig {
                check_interval_ms: 5000,
                timeout_ms: 1000,
                fire: FirePolicy::Once,
                enabled: true,
            })
            .on_timeout(Arc::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }))
            .build();
        let _handle = watchdog.start().unwrap();

        tokio::time::sleep(ms(5200)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        // Fresh feed at t=5.2 goes stale long before the next tick at t=10.
        watchdog.feed();
        tokio::time::sleep(ms(5000)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 2);

        // No feed since the second breach: still one firing per breach.
        tokio::time::sleep(ms(5000)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fire_every_tick_repeats() {
        let (watchdog, fired) = counting(FirePolicy::EveryTick);
        let _handle = watchdog.start().unwrap();

        // Breached ticks at t=4, 5, 6.
        tokio::time::sleep(ms(6500)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 3);
        assert_eq!(watchdog.fire_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disabled_never_fires_and_enable_resets_clock() {
        let (watchdog, fired) = counting(FirePolicy::Once);
        watchdog.set_enabled(false);
        let _handle = watchdog.start().unwrap();

        tokio::time::sleep(ms(10_050)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        watchdog.set_enabled(true);
        assert!(watchdog.is_enabled());
        assert!(watchdog.since_last_feed() < ms(1));

        tokio::time::sleep(ms(2900)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        // Ticks fall on whole seconds; t=14 is 3.95s after enabling.
        tokio::time::sleep(ms(1200)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disable_after_breach_suppresses_repeats() {
        let (watchdog, fired) = counting(FirePolicy::EveryTick);
        let _handle = watchdog.start().unwrap();

        tokio::time::sleep(ms(4500)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        watchdog.set_enabled(false);
        tokio::time::sleep(ms(5000)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_ends_check_task() {
        let (watchdog, fired) = counting(FirePolicy::EveryTick);
        let handle = watchdog.start().unwrap();
        handle.stop().await;

        tokio::time::sleep(ms(10_000)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert!(watchdog.is_started());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_then_task_finishes() {
        let (watchdog, _fired) = counting(FirePolicy::Once);
        let handle = watchdog.start().unwrap();
        handle.cancel();
        tokio::time::sleep(ms(10)).await;
        assert!(handle.is_finished());
    }

    #[tokio::test]
    async fn test_second_start_is_rejected() {
        let (watchdog, _fired) = counting(FirePolicy::Once);
        let handle = watchdog.start().unwrap();
        let clone = watchdog.clone();
        assert_eq!(clone.start().unwrap_err(), WatchdogError::AlreadyStarted);
        handle.stop().await;
    }

    #[test]
    fn test_start_without_runtime_fails() {
        let (watchdog, _fired) = counting(FirePolicy::Once);
        assert_eq!(watchdog.start().unwrap_err(), WatchdogError::NoRuntime);
        assert!(!watchdog.is_started());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_feeds_stay_monotonic() {
        let (watchdog, fired) = counting(FirePolicy::Once);
        let handle = watchdog.start().unwrap();

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let watchdog = watchdog.clone();
            tasks.push(tokio::spawn(async move {
                for _ in 0..1000 {
                    let before = Instant::now();
                    watchdog.feed();
                    assert!(watchdog.last_feed() >= before);
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(fired.load(Ordering::SeqCst), 0);
        handle.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_status_snapshot() {
        let (watchdog, _fired) = counting(FirePolicy::Once);
        let status = watchdog.status();
        assert!(!status.started);
        assert!(status.enabled);
        assert_eq!(status.timeout_ms, 3000);

        let _handle = watchdog.start().unwrap();
        tokio::time::sleep(ms(1500)).await;
        let json = serde_json::to_value(watchdog.status()).unwrap();
        assert_eq!(json["source"], "ui");
        assert_eq!(json["started"], true);
        let since = json["since_last_feed_ms"].as_u64().unwrap();
        assert!((1500..1600).contains(&since));
        assert_eq!(json["fire_count"], 0);
    }

    #[test]
    fn test_new_uses_default_timing() {
        let watchdog = Watchdog::new("ui");
        assert_eq!(watchdog.source(), "ui");
        assert!(watchdog.is_enabled());
        assert!(!watchdog.is_started());
        let debug = format!("{watchdog:?}");
        assert!(debug.contains("timeout: 3s"));
    }
}
