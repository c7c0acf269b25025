//! Configuration types.

use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Default cron schedule for the lifecycle sweep: every day at 06:00 UTC.
pub const DEFAULT_SWEEP_SCHEDULE: &str = "0 0 6 * * *";

/// Day thresholds driving the account lifecycle.
///
/// Passed explicitly into the lifecycle engine; never read from globals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LifecycleThresholds {
    /// Accounts quiet for longer than this many days become `Slow`.
    pub slow_after_days: i64,
    /// Accounts quiet for longer than this many days become `Inactive`.
    pub inactive_after_days: i64,
}

impl LifecycleThresholds {
    /// Build thresholds, enforcing `inactive_after_days > slow_after_days > 0`.
    pub fn new(slow_after_days: i64, inactive_after_days: i64) -> Result<Self, ConfigError> {
        if slow_after_days <= 0 {
            return Err(ConfigError::InvalidValue {
                key: "slow_after_days".into(),
                message: format!("must be positive, got {slow_after_days}"),
            });
        }
        if inactive_after_days <= slow_after_days {
            return Err(ConfigError::InvalidValue {
                key: "inactive_after_days".into(),
                message: format!(
                    "must be greater than slow_after_days ({slow_after_days}), got {inactive_after_days}"
                ),
            });
        }
        Ok(Self {
            slow_after_days,
            inactive_after_days,
        })
    }
}

impl Default for LifecycleThresholds {
    fn default() -> Self {
        Self {
            slow_after_days: 30,
            inactive_after_days: 180,
        }
    }
}

/// Sweep scheduling.
#[derive(Debug, Clone)]
pub struct SweepConfig {
    /// Whether the background sweep ticker runs at all.
    pub enabled: bool,
    /// Cron expression (seconds resolution).
    pub schedule: cron::Schedule,
}

/// Service configuration.
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Path of the libSQL database file.
    pub db_path: PathBuf,
    /// HTTP listen port.
    pub port: u16,
    pub thresholds: LifecycleThresholds,
    pub sweep: SweepConfig,
    /// Directory for rolling log files. Stderr only when unset.
    pub log_dir: Option<PathBuf>,
}

impl AppConfig {
    /// Load configuration from process environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let db_path = get("CRM_INTAKE_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("./data/crm-intake.db"));

        let port = parse_or("CRM_INTAKE_PORT", get("CRM_INTAKE_PORT"), 8080u16)?;

        let defaults = LifecycleThresholds::default();
        let slow = parse_or(
            "CRM_SLOW_AFTER_DAYS",
            get("CRM_SLOW_AFTER_DAYS"),
            defaults.slow_after_days,
        )?;
        let inactive = parse_or(
            "CRM_INACTIVE_AFTER_DAYS",
            get("CRM_INACTIVE_AFTER_DAYS"),
            defaults.inactive_after_days,
        )?;
        let thresholds = LifecycleThresholds::new(slow, inactive)?;

        let enabled = match get("CRM_SWEEP_ENABLED").as_deref() {
            None => true,
            Some("1" | "true" | "yes" | "on") => true,
            Some("0" | "false" | "no" | "off") => false,
            Some(other) => {
                return Err(ConfigError::InvalidValue {
                    key: "CRM_SWEEP_ENABLED".into(),
                    message: format!("expected a boolean, got {other:?}"),
                });
            }
        };
        let expr = get("CRM_SWEEP_SCHEDULE").unwrap_or_else(|| DEFAULT_SWEEP_SCHEDULE.to_string());
        let schedule = parse_schedule(&expr)?;

        Ok(Self {
            db_path,
            port,
            thresholds,
            sweep: SweepConfig { enabled, schedule },
            log_dir: get("CRM_INTAKE_LOG_DIR").map(PathBuf::from),
        })
    }
}

/// Parse a cron expression for the sweep ticker.
pub fn parse_schedule(expr: &str) -> Result<cron::Schedule, ConfigError> {
    cron::Schedule::from_str(expr).map_err(|e| ConfigError::InvalidValue {
        key: "CRM_SWEEP_SCHEDULE".into(),
        message: format!("invalid cron expression {expr:?}: {e}"),
    })
}

fn parse_or<T>(key: &str, raw: Option<String>, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match raw {
        None => Ok(default),
        Some(raw) => raw.parse().map_err(|e: T::Err| ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("{raw:?}: {e}"),
        }),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_when_unset() {
        let config = AppConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.port, 8080);
        assert_eq!(config.thresholds, LifecycleThresholds::default());
        assert_eq!(config.thresholds.slow_after_days, 30);
        assert_eq!(config.thresholds.inactive_after_days, 180);
        assert!(config.sweep.enabled);
        assert!(config.log_dir.is_none());
        assert_eq!(config.db_path, PathBuf::from("./data/crm-intake.db"));
    }

    #[test]
    fn reads_overrides() {
        let config = AppConfig::from_lookup(lookup(&[
            ("CRM_INTAKE_PORT", "9090"),
            ("CRM_SLOW_AFTER_DAYS", "14"),
            ("CRM_INACTIVE_AFTER_DAYS", "90"),
            ("CRM_SWEEP_ENABLED", "false"),
            ("CRM_SWEEP_SCHEDULE", "0 30 * * * *"),
            ("CRM_INTAKE_LOG_DIR", "/tmp/logs"),
        ]))
        .unwrap();
        assert_eq!(config.port, 9090);
        assert_eq!(config.thresholds.slow_after_days, 14);
        assert_eq!(config.thresholds.inactive_after_days, 90);
        assert!(!config.sweep.enabled);
        assert_eq!(config.log_dir, Some(PathBuf::from("/tmp/logs")));
    }

    #[test]
    fn blank_values_fall_back_to_defaults() {
        let config = AppConfig::from_lookup(lookup(&[("CRM_INTAKE_PORT", "  ")])).unwrap();
        assert_eq!(config.port, 8080);
    }

    #[test]
    fn rejects_inverted_thresholds() {
        let err = AppConfig::from_lookup(lookup(&[
            ("CRM_SLOW_AFTER_DAYS", "200"),
            ("CRM_INACTIVE_AFTER_DAYS", "100"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref key, .. } if key == "inactive_after_days"));
    }

    #[test]
    fn rejects_zero_slow_threshold() {
        assert!(LifecycleThresholds::new(0, 10).is_err());
        assert!(LifecycleThresholds::new(-5, 10).is_err());
        assert!(LifecycleThresholds::new(10, 10).is_err());
        assert!(LifecycleThresholds::new(10, 11).is_ok());
    }

    #[test]
    fn rejects_non_numeric_port() {
        let err = AppConfig::from_lookup(lookup(&[("CRM_INTAKE_PORT", "eighty")])).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref key, .. } if key == "CRM_INTAKE_PORT"));
    }

    #[test]
    fn rejects_bad_cron() {
        let err = AppConfig::from_lookup(lookup(&[("CRM_SWEEP_SCHEDULE", "not a cron")])).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }

    #[test]
    fn rejects_bad_boolean() {
        assert!(AppConfig::from_lookup(lookup(&[("CRM_SWEEP_ENABLED", "maybe")])).is_err());
    }
}
