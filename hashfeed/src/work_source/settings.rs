//! Per-source settings.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::ConfigError;

pub const DEFAULT_SOURCE_NAME: &str = "Untitled work source";
pub const DEFAULT_GROUP_NAME: &str = "Untitled work source group";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SourceSettings {
    pub name: String,
    pub enabled: bool,
    /// Share of the parent's hashing capacity relative to its siblings.
    pub priority: f64,
    /// Hashrate this source is guaranteed regardless of priority, in MH/s.
    #[serde(alias = "hashrate")]
    pub hashrate_mhps: f64,
    /// Failure handling. Only meaningful for leaf sources.
    pub errors: ErrorPolicy,
}

impl Default for SourceSettings {
    fn default() -> Self {
        Self::named(DEFAULT_SOURCE_NAME)
    }
}

impl SourceSettings {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            enabled: true,
            priority: 1.0,
            hashrate_mhps: 0.0,
            errors: ErrorPolicy::default(),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.trim().is_empty() {
            return Err(ConfigError::Invalid {
                field: "name",
                reason: "must not be empty".into(),
            });
        }
        if !(self.priority.is_finite() && self.priority >= 0.0) {
            return Err(ConfigError::Invalid {
                field: "priority",
                reason: "must be a non-negative number".into(),
            });
        }
        if !(self.hashrate_mhps.is_finite() && self.hashrate_mhps >= 0.0) {
            return Err(ConfigError::Invalid {
                field: "hashrate_mhps",
                reason: "must be a non-negative number".into(),
            });
        }
        self.errors.validate()
    }
}

/// How a leaf source backs off after failures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ErrorPolicy {
    /// Consecutive failures before the long lockout kicks in.
    pub limit: u32,
    pub lockout_factor_secs: f64,
    pub lockout_max_secs: f64,
    /// Lockout after a rejected share.
    pub stale_lockout_secs: f64,
    /// Lockout after any single failure.
    pub retry_backoff_secs: f64,
}

impl Default for ErrorPolicy {
    fn default() -> Self {
        Self {
            limit: 3,
            lockout_factor_secs: 10.0,
            lockout_max_secs: 500.0,
            stale_lockout_secs: 25.0,
            retry_backoff_secs: 3.0,
        }
    }
}

impl ErrorPolicy {
    fn validate(&self) -> Result<(), ConfigError> {
        let durations = [
            ("errors.lockout_factor_secs", self.lockout_factor_secs),
            ("errors.lockout_max_secs", self.lockout_max_secs),
            ("errors.stale_lockout_secs", self.stale_lockout_secs),
            ("errors.retry_backoff_secs", self.retry_backoff_secs),
        ];
        for (field, value) in durations {
            if !(value.is_finite() && value >= 0.0) {
                return Err(ConfigError::Invalid {
                    field,
                    reason: "must be a non-negative number of seconds".into(),
                });
            }
        }
        if self.limit == 0 {
            return Err(ConfigError::Invalid {
                field: "errors.limit",
                reason: "must be at least 1".into(),
            });
        }
        Ok(())
    }

    /// Lockout to apply after `errors` consecutive failures.
    pub fn lockout_after(&self, errors: u32) -> Duration {
        let mut secs = self.retry_backoff_secs;
        if errors >= self.limit {
            let long = (self.lockout_factor_secs + errors as f64).min(self.lockout_max_secs);
            secs = secs.max(long);
        }
        Duration::from_secs_f64(secs)
    }

    pub fn stale_lockout(&self) -> Duration {
        Duration::from_secs_f64(self.stale_lockout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lockout_grows_after_limit() {
        let policy = ErrorPolicy::default();
        assert_eq!(policy.lockout_after(1), Duration::from_secs(3));
        assert_eq!(policy.lockout_after(2), Duration::from_secs(3));
        assert_eq!(policy.lockout_after(3), Duration::from_secs(13));
        assert_eq!(policy.lockout_after(10), Duration::from_secs(20));
        assert_eq!(policy.lockout_after(1000), Duration::from_secs(500));
    }

    #[test]
    fn test_negative_priority_rejected() {
        let mut settings = SourceSettings::named("pool");
        settings.priority = -1.0;
        assert!(settings.validate().is_err());
        settings.priority = 0.0;
        settings.validate().unwrap();
    }

    #[test]
    fn test_legacy_hashrate_key() {
        let settings: SourceSettings =
            serde_json::from_str(r#"{"name": "p", "hashrate": 50}"#).unwrap();
        assert_eq!(settings.hashrate_mhps, 50.0);
        assert!(settings.enabled);
        assert_eq!(settings.errors, ErrorPolicy::default());
    }
}
