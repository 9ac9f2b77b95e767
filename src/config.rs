//! Layered runtime configuration.
//!
//! Configuration is assembled with `figment`: defaults, then an optional TOML file,
//! then environment variables prefixed `BENCH_CONTROLLER_` (double underscore as the
//! nested-key separator, e.g. `BENCH_CONTROLLER_SESSION__POLL_MS=100`). This mirrors
//! the layered file+env configuration the teacher's server crates build on `figment`.

use std::path::PathBuf;
use std::time::Duration;

use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};

use crate::error::{AppResult, ControllerError};

/// Poll-loop and error-recovery tuning for every `DeviceSession`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Poll period while a session is healthy.
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
    /// Poll period while a session is recovering from errors.
    #[serde(with = "humantime_serde")]
    pub poll_interval_backoff: Duration,
    /// Consecutive poll/command failures before `connectionStatus` becomes `error`.
    pub max_consecutive_errors: u32,
    /// Per-operation transport timeout.
    #[serde(with = "humantime_serde")]
    pub transport_timeout: Duration,
    /// Rolling measurement-history window kept in memory.
    #[serde(with = "humantime_serde")]
    pub history_window: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(250),
            poll_interval_backoff: Duration::from_secs(1),
            max_consecutive_errors: 3,
            transport_timeout: Duration::from_secs(2),
            history_window: Duration::from_secs(120),
        }
    }
}

/// Sequence-playback timing defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SequenceConfig {
    /// Floor applied to every step's dwell to bound timer-wakeup rate.
    pub min_interval_ms: u64,
}

impl Default for SequenceConfig {
    fn default() -> Self {
        Self {
            min_interval_ms: 50,
        }
    }
}

/// Trigger-script evaluation cadence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerConfig {
    /// Cadence of the time-condition evaluation tick.
    #[serde(with = "humantime_serde")]
    pub tick_interval: Duration,
}

impl Default for TriggerConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_millis(100),
        }
    }
}

/// Where durable libraries are persisted and how aggressively client send queues
/// are allowed to back up before measurement messages are dropped.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Overrides the OS-default data directory when set.
    pub data_dir: Option<PathBuf>,
    /// Maximum number of definitions a library file may hold.
    pub max_library_size: usize,
    /// Per-client send-queue high watermark before measurement messages are dropped.
    pub client_queue_watermark: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: None,
            max_library_size: 500,
            client_queue_watermark: 256,
        }
    }
}

/// Top-level configuration document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ControllerConfig {
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub sequence: SequenceConfig,
    #[serde(default)]
    pub trigger: TriggerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

impl ControllerConfig {
    /// Loads configuration from defaults, an optional TOML file at `path`, and
    /// `BENCH_CONTROLLER_`-prefixed environment variables, in that precedence order.
    pub fn load(path: Option<&std::path::Path>) -> AppResult<Self> {
        let mut figment = Figment::from(Serialized::defaults(ControllerConfig::default()));
        if let Some(path) = path {
            figment = figment.merge(Toml::file(path));
        }
        figment = figment.merge(Env::prefixed("BENCH_CONTROLLER_").split("__"));
        figment.extract().map_err(ControllerError::from)
    }

    /// Resolves the directory durable libraries are stored under, following the
    /// explicit override > XDG data home > OS default order.
    pub fn resolve_data_dir(&self) -> AppResult<PathBuf> {
        if let Some(dir) = &self.storage.data_dir {
            return Ok(dir.clone());
        }
        dirs::data_dir()
            .map(|d| d.join("lab-controller"))
            .ok_or_else(|| {
                ControllerError::Configuration("could not resolve a data directory".into())
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_load_without_a_file() {
        let cfg = ControllerConfig::load(None).expect("defaults must load");
        assert_eq!(cfg.session.max_consecutive_errors, 3);
        assert_eq!(cfg.sequence.min_interval_ms, 50);
    }

    #[test]
    fn test_env_override() {
        std::env::set_var("BENCH_CONTROLLER_SESSION__MAX_CONSECUTIVE_ERRORS", "7");
        let cfg = ControllerConfig::load(None).expect("env override must parse");
        assert_eq!(cfg.session.max_consecutive_errors, 7);
        std::env::remove_var("BENCH_CONTROLLER_SESSION__MAX_CONSECUTIVE_ERRORS");
    }
}
