// ABOUTME: Configuration loading and validation for the fleetd binary.
// ABOUTME: Reads FLEETD_* environment variables into paths, the initial mode, and recovery tunables.

use std::path::{Path, PathBuf};
use std::time::Duration;

use fleetd_core::Mode;
use fleetd_recovery::RecoveryConfig;
use thiserror::Error;

/// Errors that can occur during configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("FLEETD_MODE is not a valid mode: {0}")]
    InvalidMode(String),

    #[error("{name} must be a non-negative integer, got {value:?}")]
    InvalidNumber { name: &'static str, value: String },

    #[error("FLEETD_MAX_RECOVERY_ATTEMPTS must be at least 1")]
    ZeroAttempts,

    #[error("FLEETD_MAX_RETRY_DELAY_MS ({max_ms}) is below FLEETD_RETRY_DELAY_MS ({base_ms})")]
    CeilingBelowBase { base_ms: u64, max_ms: u64 },
}

/// Process configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct FleetConfig {
    pub home: PathBuf,
    pub device_types_path: PathBuf,
    /// Used only when the stored snapshot does not record a mode.
    pub mode: Mode,
    pub recovery: RecoveryConfig,
}

impl FleetConfig {
    /// Load configuration from environment variables with sensible defaults.
    ///
    /// Environment variables:
    /// - FLEETD_HOME: data directory (default: ~/.fleetd)
    /// - FLEETD_DEVICE_TYPES: device type YAML (default: $FLEETD_HOME/device_types.yaml)
    /// - FLEETD_MODE: development or production (default: development)
    /// - FLEETD_MAX_RECOVERY_ATTEMPTS (default: 3)
    /// - FLEETD_RETRY_DELAY_MS (default: 1000)
    /// - FLEETD_MAX_RETRY_DELAY_MS (default: 30000)
    /// - FLEETD_RECOVERY_TIMEOUT_MS (default: 10000)
    /// - FLEETD_STALENESS_THRESHOLD_MS (default: 5000)
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as `from_env`, reading variables through `lookup`. Empty values
    /// count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let home = var("FLEETD_HOME").map(PathBuf::from).unwrap_or_else(|| {
            var("HOME")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("/tmp"))
                .join(".fleetd")
        });

        let device_types_path = var("FLEETD_DEVICE_TYPES")
            .map(PathBuf::from)
            .unwrap_or_else(|| home.join("device_types.yaml"));

        let mode = match var("FLEETD_MODE") {
            Some(raw) => raw.parse().map_err(|_| ConfigError::InvalidMode(raw))?,
            None => Mode::Development,
        };

        let defaults = RecoveryConfig::default();
        let millis = |name: &'static str, default: Duration| -> Result<Duration, ConfigError> {
            match var(name) {
                Some(raw) => raw
                    .trim()
                    .parse::<u64>()
                    .map(Duration::from_millis)
                    .map_err(|_| ConfigError::InvalidNumber { name, value: raw }),
                None => Ok(default),
            }
        };

        let max_attempts = match var("FLEETD_MAX_RECOVERY_ATTEMPTS") {
            Some(raw) => raw
                .trim()
                .parse::<u32>()
                .map_err(|_| ConfigError::InvalidNumber {
                    name: "FLEETD_MAX_RECOVERY_ATTEMPTS",
                    value: raw,
                })?,
            None => defaults.max_attempts,
        };
        if max_attempts == 0 {
            return Err(ConfigError::ZeroAttempts);
        }

        let retry_delay = millis("FLEETD_RETRY_DELAY_MS", defaults.retry_delay)?;
        let max_retry_delay = millis("FLEETD_MAX_RETRY_DELAY_MS", defaults.max_retry_delay)?;
        if max_retry_delay < retry_delay {
            return Err(ConfigError::CeilingBelowBase {
                base_ms: retry_delay.as_millis() as u64,
                max_ms: max_retry_delay.as_millis() as u64,
            });
        }

        let recovery = RecoveryConfig {
            max_attempts,
            retry_delay,
            max_retry_delay,
            recovery_timeout: millis("FLEETD_RECOVERY_TIMEOUT_MS", defaults.recovery_timeout)?,
            staleness_threshold: millis(
                "FLEETD_STALENESS_THRESHOLD_MS",
                defaults.staleness_threshold,
            )?,
            ..defaults
        };

        Ok(Self {
            home,
            device_types_path,
            mode,
            recovery,
        })
    }

    /// Directory holding `registry.json` and `registry.lock`.
    pub fn data_dir(&self) -> &Path {
        &self.home
    }

    pub fn audit_log_path(&self) -> PathBuf {
        self.home.join("audit.jsonl")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> Result<FleetConfig, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        FleetConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn config_loads_defaults() {
        let config = load(&[("HOME", "/home/ops")]).unwrap();

        assert_eq!(config.home, PathBuf::from("/home/ops/.fleetd"));
        assert_eq!(
            config.device_types_path,
            PathBuf::from("/home/ops/.fleetd/device_types.yaml")
        );
        assert_eq!(config.audit_log_path(), PathBuf::from("/home/ops/.fleetd/audit.jsonl"));
        assert_eq!(config.mode, Mode::Development);
        assert_eq!(config.recovery, RecoveryConfig::default());
    }

    #[test]
    fn config_reads_overrides() {
        let config = load(&[
            ("FLEETD_HOME", "/var/lib/fleetd"),
            ("FLEETD_DEVICE_TYPES", "/etc/fleetd/types.yaml"),
            ("FLEETD_MODE", "PROD"),
            ("FLEETD_MAX_RECOVERY_ATTEMPTS", "5"),
            ("FLEETD_RETRY_DELAY_MS", "250"),
            ("FLEETD_MAX_RETRY_DELAY_MS", "4000"),
            ("FLEETD_RECOVERY_TIMEOUT_MS", "2500"),
            ("FLEETD_STALENESS_THRESHOLD_MS", "8000"),
        ])
        .unwrap();

        assert_eq!(config.data_dir(), Path::new("/var/lib/fleetd"));
        assert_eq!(config.device_types_path, PathBuf::from("/etc/fleetd/types.yaml"));
        assert_eq!(config.mode, Mode::Production);
        assert_eq!(config.recovery.max_attempts, 5);
        assert_eq!(config.recovery.retry_delay, Duration::from_millis(250));
        assert_eq!(config.recovery.max_retry_delay, Duration::from_millis(4000));
        assert_eq!(config.recovery.recovery_timeout, Duration::from_millis(2500));
        assert_eq!(config.recovery.staleness_threshold, Duration::from_millis(8000));
        assert_eq!(config.recovery.settle_interval, Duration::from_secs(1));
    }

    #[test]
    fn empty_values_count_as_unset() {
        let config = load(&[("FLEETD_HOME", "/srv/fleet"), ("FLEETD_MODE", "")]).unwrap();
        assert_eq!(config.mode, Mode::Development);
    }

    #[test]
    fn config_rejects_bad_values() {
        let err = load(&[("FLEETD_MODE", "staging")]).unwrap_err();
        assert!(err.to_string().contains("FLEETD_MODE"), "{}", err);

        let err = load(&[("FLEETD_RETRY_DELAY_MS", "soon")]).unwrap_err();
        assert!(
            matches!(err, ConfigError::InvalidNumber { name: "FLEETD_RETRY_DELAY_MS", .. }),
            "{}",
            err
        );

        assert!(matches!(
            load(&[("FLEETD_MAX_RECOVERY_ATTEMPTS", "0")]),
            Err(ConfigError::ZeroAttempts)
        ));

        assert!(matches!(
            load(&[("FLEETD_RETRY_DELAY_MS", "5000"), ("FLEETD_MAX_RETRY_DELAY_MS", "1000")]),
            Err(ConfigError::CeilingBelowBase { base_ms: 5000, max_ms: 1000 })
        ));
    }
}
