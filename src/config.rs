use nix::sys::signal::Signal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Top-level configuration loaded from deadman.toml.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DeadmanConfig {
    pub watchdog: WatchdogConfig,
    pub supervise: SuperviseConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchdogConfig {
    pub check_interval_ms: u64,
    pub timeout_ms: u64,
    pub fire: FirePolicy,
    pub enabled: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SuperviseConfig {
    pub arm_on_first_output: bool,
    pub kill_signal: String,
    pub timeout_exit_code: i32,
}

/// What the check loop does when a breach persists across several ticks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FirePolicy {
    /// Fire once per breach. Any feed newer than the one that breached re-arms it.
    #[default]
    Once,
    /// Fire on every tick for as long as the breach lasts.
    EveryTick,
}

impl FromStr for FirePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "once" => Ok(FirePolicy::Once),
            "every-tick" | "every_tick" => Ok(FirePolicy::EveryTick),
            other => Err(format!(
                "unknown fire policy '{other}' (expected 'once' or 'every-tick')"
            )),
        }
    }
}

impl fmt::Display for FirePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FirePolicy::Once => f.write_str("once"),
            FirePolicy::EveryTick => f.write_str("every-tick"),
        }
    }
}

/// Errors that can occur while loading or validating configuration.
#[derive(Debug)]
pub enum ConfigError {
    /// The config file exists but could not be read.
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    /// The config file is not valid TOML for this schema.
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    /// A value parsed but makes no sense.
    Invalid(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Read { path, source } => {
                write!(f, "failed to read config {}: {}", path.display(), source)
            }
            ConfigError::Parse { path, source } => {
                write!(f, "failed to parse config {}: {}", path.display(), source)
            }
            ConfigError::Invalid(msg) => write!(f, "invalid config: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Read { source, .. } => Some(source),
            ConfigError::Parse { source, .. } => Some(source),
            ConfigError::Invalid(_) => None,
        }
    }
}

impl DeadmanConfig {
    /// Load config from `path`. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "config file not found, using defaults");
                return Ok(Self::default());
            }
            Err(e) => {
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source: e,
                })
            }
        };

        let config: Self = toml::from_str(&contents).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            source: e,
        })?;
        tracing::debug!(path = %path.display(), "loaded config");
        Ok(config)
    }

    /// Reject values the watchdog or supervisor cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.watchdog.check_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "watchdog.check_interval_ms must be greater than 0".to_string(),
            ));
        }
        if self.watchdog.timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "watchdog.timeout_ms must be greater than 0".to_string(),
            ));
        }
        if !self.watchdog.enabled && !self.supervise.arm_on_first_output {
            return Err(ConfigError::Invalid(
                "watchdog.enabled = false needs supervise.arm_on_first_output, \
                 or nothing ever enables the watchdog"
                    .to_string(),
            ));
        }
        self.supervise.kill_signal()?;
        Ok(())
    }
}

impl WatchdogConfig {
    pub fn check_interval(&self) -> Duration {
        Duration::from_millis(self.check_interval_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl SuperviseConfig {
    /// Parse `kill_signal`. Accepts `SIGKILL`, `KILL` or `kill`.
    pub fn kill_signal(&self) -> Result<Signal, ConfigError> {
        let name = self.kill_signal.trim().to_ascii_uppercase();
        let name = if name.starts_with("SIG") {
            name
        } else {
            format!("SIG{name}")
        };
        Signal::from_str(&name).map_err(|_| {
            ConfigError::Invalid(format!(
                "supervise.kill_signal '{}' is not a known signal",
                self.kill_signal
            ))
        })
    }
}

// --- Default implementations ---

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            check_interval_ms: 1000,
            timeout_ms: 3000,
            fire: FirePolicy::Once,
            enabled: true,
        }
    }
}

impl Default for SuperviseConfig {
    fn default() -> Self {
        Self {
            arm_on_first_output: false,
            kill_signal: "SIGKILL".to_string(),
            timeout_exit_code: 0,
        }
    }
}
