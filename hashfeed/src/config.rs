//! Scheduler configuration.
//!
//! Tunables load from a JSON file named by `HASHFEED_CONFIG`. Every field has
//! a default, so a partial file (or none at all) is fine. Values are checked
//! once with [`SchedulerConfig::validate`] before the scheduler starts and are
//! immutable afterwards.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::tracing::prelude::*;

/// Environment variable naming the configuration file.
pub const CONFIG_VAR: &str = "HASHFEED_CONFIG";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Malformed configuration: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.into(),
    }
}

/// Implemented by entities whose settings can be read and replaced at runtime.
pub trait Configurable {
    type Settings: Clone;

    fn settings(&self) -> Self::Settings;

    /// Replace the settings. Invalid settings are rejected and the old ones
    /// stay in effect.
    fn apply_settings(&self, settings: Self::Settings) -> Result<(), ConfigError>;
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SchedulerConfig {
    pub queue: QueueConfig,
    pub bias: BiasConfig,
    pub upload: UploadPolicy,
}

/// Work queue and fetcher tunables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct QueueConfig {
    /// Jobs expiring sooner than this are not handed to workers.
    pub lookahead_secs: f64,
    /// How often expired jobs are swept out.
    pub sweep_interval_ms: u64,
    /// Seconds of work to keep buffered at the aggregate worker speed.
    pub buffer_secs: f64,
    /// Queue target never drops below this.
    pub min_target: usize,
    /// Pause before a producer gives up after an empty or failed fetch.
    pub fetch_retry_ms: u64,
    /// Bound on joining background tasks at shutdown.
    pub shutdown_timeout_secs: f64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            lookahead_secs: 10.0,
            sweep_interval_ms: 1000,
            buffer_secs: 30.0,
            min_target: 2,
            fetch_retry_ms: 1000,
            shutdown_timeout_secs: 10.0,
        }
    }
}

impl QueueConfig {
    pub fn lookahead(&self) -> Duration {
        Duration::from_secs_f64(self.lookahead_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    pub fn fetch_retry(&self) -> Duration {
        Duration::from_millis(self.fetch_retry_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.shutdown_timeout_secs)
    }
}

/// Score adjustments applied to work sources on scheduling events.
///
/// Share-related values are multiplied by the job difficulty.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BiasConfig {
    pub request: f64,
    pub fetch_failure: f64,
    pub share: f64,
    pub stale: f64,
    pub upload_retry: f64,
    pub job_start: f64,
    pub job_finish: f64,
    /// Score multiplier applied each selection round.
    pub decay: f64,
    /// Fraction of deferred credit released into the score each round.
    pub deferred_release: f64,
}

impl Default for BiasConfig {
    fn default() -> Self {
        Self {
            request: -1.0,
            fetch_failure: -3000.0,
            share: 4000.0,
            stale: -15000.0,
            upload_retry: -100.0,
            job_start: 0.0,
            job_finish: 0.0,
            decay: 0.9995,
            deferred_release: 0.1,
        }
    }
}

/// Share upload retry policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct UploadPolicy {
    pub max_attempts: u32,
    pub retry_delay_ms: u64,
}

impl Default for UploadPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            retry_delay_ms: 1000,
        }
    }
}

impl UploadPolicy {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

impl SchedulerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let q = &self.queue;
        if !(q.lookahead_secs.is_finite() && q.lookahead_secs >= 0.0) {
            return Err(invalid("queue.lookahead_secs", "must be a non-negative number"));
        }
        if q.sweep_interval_ms == 0 {
            return Err(invalid("queue.sweep_interval_ms", "must be positive"));
        }
        if !(q.buffer_secs.is_finite() && q.buffer_secs > 0.0) {
            return Err(invalid("queue.buffer_secs", "must be positive"));
        }
        if !(q.shutdown_timeout_secs.is_finite() && q.shutdown_timeout_secs >= 0.0) {
            return Err(invalid("queue.shutdown_timeout_secs", "must be a non-negative number"));
        }
        if q.min_target == 0 {
            return Err(invalid("queue.min_target", "must be at least 1"));
        }

        let b = &self.bias;
        if !(b.decay > 0.0 && b.decay <= 1.0) {
            return Err(invalid("bias.decay", "must be in (0, 1]"));
        }
        if !(0.0..=1.0).contains(&b.deferred_release) {
            return Err(invalid("bias.deferred_release", "must be in [0, 1]"));
        }
        let all = [
            b.request,
            b.fetch_failure,
            b.share,
            b.stale,
            b.upload_retry,
            b.job_start,
            b.job_finish,
        ];
        if all.iter().any(|v| !v.is_finite()) {
            return Err(invalid("bias", "adjustments must be finite"));
        }

        if self.upload.max_attempts == 0 {
            return Err(invalid("upload.max_attempts", "must be at least 1"));
        }
        Ok(())
    }

    /// Parse and validate a JSON configuration document.
    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&text)
    }

    /// Load from the file named by `HASHFEED_CONFIG`, or use defaults when
    /// the variable is unset.
    pub fn from_env() -> Result<Self, ConfigError> {
        match std::env::var(CONFIG_VAR) {
            Ok(path) => {
                let config = Self::load(Path::new(&path))?;
                info!(path = %path, "Loaded scheduler configuration");
                Ok(config)
            }
            Err(_) => {
                debug!("No configuration file given, using defaults");
                Ok(Self::default())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_defaults_are_valid() {
        let config = SchedulerConfig::default();
        config.validate().unwrap();
        assert_eq!(config.bias.stale, -15000.0);
        assert_eq!(config.upload.max_attempts, 10);
        assert_eq!(config.queue.lookahead(), Duration::from_secs(10));
    }

    #[test]
    fn test_partial_document_keeps_defaults() {
        let config = SchedulerConfig::from_json(r#"{"bias": {"share": 10.0}}"#).unwrap();
        assert_eq!(config.bias.share, 10.0);
        assert_eq!(config.bias.request, -1.0);
        assert_eq!(config.queue, QueueConfig::default());
    }

    #[test]
    fn test_unknown_field_rejected() {
        let err = SchedulerConfig::from_json(r#"{"queue": {"lookahead": 3}}"#).unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_invalid_decay_rejected() {
        let err = SchedulerConfig::from_json(r#"{"bias": {"decay": 1.5}}"#).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field: "bias.decay", .. }));
    }

    #[test]
    fn test_zero_upload_attempts_rejected() {
        let mut config = SchedulerConfig::default();
        config.upload.max_attempts = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    #[serial]
    fn test_from_env_defaults_when_unset() {
        std::env::remove_var(CONFIG_VAR);
        assert_eq!(SchedulerConfig::from_env().unwrap(), SchedulerConfig::default());
    }

    #[test]
    #[serial]
    fn test_from_env_missing_file() {
        std::env::set_var(CONFIG_VAR, "/nonexistent/hashfeed.json");
        let err = SchedulerConfig::from_env().unwrap_err();
        std::env::remove_var(CONFIG_VAR);
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}
