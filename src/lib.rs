//! A liveness watchdog ("dead man's switch") and a command supervisor built on it.
//!
//! Construct a [`Watchdog`], [`start`](Watchdog::start) it once, and
//! [`feed`](Watchdog::feed) it on every proof that the monitored party is
//! alive. If feeding stops for longer than the threshold, the injected
//! [`TimeoutAction`] runs; by default it exits the process.

pub mod action;
pub mod config;
pub mod signals;
pub mod supervise;
pub mod watchdog;

pub use action::TimeoutAction;
pub use config::{DeadmanConfig, FirePolicy, WatchdogConfig};
pub use watchdog::{Watchdog, WatchdogBuilder, WatchdogError, WatchdogHandle, WatchdogStatus};
