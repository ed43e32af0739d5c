use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{SyncError, SyncResult};

/// Tuning for the replication engine. Every field has a default.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Failed attempts after which a pair needs operator attention.
    pub max_attempts: u32,
    /// Lease lifetime. Must outlast the slowest expected transfer.
    pub lease_ttl_secs: u64,
    pub backoff_base_secs: u64,
    pub backoff_max_secs: u64,
    /// Concurrent transfers per target unit.
    pub per_unit_concurrency: usize,
    /// Pause between cycles of the periodic runner.
    pub interval_secs: u64,
    /// Upper bound on one unit's status probe.
    pub status_timeout_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            lease_ttl_secs: 15 * 60,
            backoff_base_secs: 30,
            backoff_max_secs: 60 * 60,
            per_unit_concurrency: 4,
            interval_secs: 60,
            status_timeout_ms: 2_000,
        }
    }
}

impl SyncConfig {
    pub fn validate(&self) -> SyncResult<()> {
        if self.max_attempts == 0 {
            return Err(SyncError::Configuration("max_attempts must be at least 1".into()));
        }
        if self.lease_ttl_secs == 0 {
            return Err(SyncError::Configuration("lease_ttl_secs must be positive".into()));
        }
        if self.per_unit_concurrency == 0 {
            return Err(SyncError::Configuration(
                "per_unit_concurrency must be at least 1".into(),
            ));
        }
        if self.backoff_max_secs < self.backoff_base_secs {
            return Err(SyncError::Configuration(
                "backoff_max_secs must not be below backoff_base_secs".into(),
            ));
        }
        Ok(())
    }

    pub fn lease_ttl(&self) -> Duration {
        Duration::from_secs(self.lease_ttl_secs)
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn status_timeout(&self) -> Duration {
        Duration::from_millis(self.status_timeout_ms)
    }

    /// Wait before the next attempt after `attempts` failures:
    /// `min(base * 2^(attempts - 1), max)`.
    pub fn backoff(&self, attempts: u32) -> Duration {
        if attempts == 0 {
            return Duration::ZERO;
        }
        let factor = 1u64.checked_shl(attempts - 1).unwrap_or(u64::MAX);
        let secs = self
            .backoff_base_secs
            .saturating_mul(factor)
            .min(self.backoff_max_secs);
        Duration::from_secs(secs)
    }
}
