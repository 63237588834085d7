// ABOUTME: Tunables for the recovery engine: attempt budget, backoff, timeouts, and staleness cadence.
// ABOUTME: backoff_delay computes min(retry_delay * 2^attempts, max_retry_delay) without overflow.

use std::time::Duration;

/// Recovery engine settings. The binary fills these from `FLEETD_*`
/// environment variables; `Default` matches the documented defaults.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveryConfig {
    /// Attempts allowed per incident before `RecoveryFailed` is emitted.
    pub max_attempts: u32,
    pub retry_delay: Duration,
    pub max_retry_delay: Duration,
    /// Upper bound on one run of the recovery procedure.
    pub recovery_timeout: Duration,
    /// Silence after which a connected device is considered disconnected.
    pub staleness_threshold: Duration,
    pub staleness_check_interval: Duration,
    /// Pause between disconnect and reconnect during recovery.
    pub settle_interval: Duration,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            retry_delay: Duration::from_millis(1000),
            max_retry_delay: Duration::from_millis(30_000),
            recovery_timeout: Duration::from_millis(10_000),
            staleness_threshold: Duration::from_millis(5000),
            staleness_check_interval: Duration::from_secs(1),
            settle_interval: Duration::from_secs(1),
        }
    }
}

impl RecoveryConfig {
    /// Delay before the next attempt after `attempts` attempts have been made.
    pub fn backoff_delay(&self, attempts: u32) -> Duration {
        let factor = 2u32.checked_pow(attempts).unwrap_or(u32::MAX);
        self.retry_delay
            .saturating_mul(factor)
            .min(self.max_retry_delay)
    }
}
