use crate::error::LakeguardError;

/// Runtime configuration for an [`crate::AccessBroker`].
///
/// Durations are plain millisecond fields so a config file or env layer can
/// populate them without a parser for human-readable units.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Total wall-clock budget for one issuance, retries included.
    pub issue_timeout_ms: u64,
    /// Total attempts against the issuer for one issuance (first try included).
    pub issue_max_attempts: u32,
    /// Base delay for exponential backoff between issuance attempts.
    pub issue_retry_base_delay_ms: u64,
    /// Upper bound on a single backoff delay.
    pub issue_retry_max_delay_ms: u64,
    /// Fraction of a lease's lifetime after which a background refresh is
    /// attempted while the lease keeps being served. Must be in (0, 1).
    pub lease_refresh_fraction: f64,
    /// How long an expired, unused lease may linger before the sweeper drops it.
    pub lease_evict_grace_ms: u64,
    /// Upper bound on cached leases; least-recently-used entries are evicted
    /// beyond this.
    pub credential_cache_capacity: usize,
    /// Interval for the cache sweep task.
    pub cache_sweep_interval_ms: u64,
    /// Interval at which the snapshot poller asks the grant store for a newer
    /// snapshot.
    pub snapshot_poll_interval_ms: u64,
    /// Depth of the buffered audit queue; events beyond this are dropped and
    /// counted rather than blocking the request path.
    pub audit_queue_depth: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            issue_timeout_ms: 10_000,
            issue_max_attempts: 3,
            issue_retry_base_delay_ms: 100,
            issue_retry_max_delay_ms: 2_000,
            lease_refresh_fraction: 0.8,
            lease_evict_grace_ms: 60_000,
            credential_cache_capacity: 1_024,
            cache_sweep_interval_ms: 30_000,
            snapshot_poll_interval_ms: 5_000,
            audit_queue_depth: 4_096,
        }
    }
}

impl BrokerConfig {
    /// Conservative profile: longer issuance budget, tighter cache bound.
    pub fn production() -> Self {
        Self {
            issue_timeout_ms: 15_000,
            issue_max_attempts: 4,
            ..Self::default()
        }
    }

    /// Fast-feedback profile for local development and tests.
    pub fn development() -> Self {
        Self {
            issue_timeout_ms: 2_000,
            issue_retry_base_delay_ms: 10,
            issue_retry_max_delay_ms: 100,
            snapshot_poll_interval_ms: 250,
            cache_sweep_interval_ms: 250,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), LakeguardError> {
        if self.issue_max_attempts == 0 {
            return Err(LakeguardError::InvalidConfig {
                message: "issue_max_attempts must be at least 1".to_string(),
            });
        }
        if !(self.lease_refresh_fraction > 0.0 && self.lease_refresh_fraction < 1.0) {
            return Err(LakeguardError::InvalidConfig {
                message: format!(
                    "lease_refresh_fraction must be in (0, 1), got {}",
                    self.lease_refresh_fraction
                ),
            });
        }
        if self.credential_cache_capacity == 0 {
            return Err(LakeguardError::InvalidConfig {
                message: "credential_cache_capacity must be non-zero".to_string(),
            });
        }
        if self.audit_queue_depth == 0 {
            return Err(LakeguardError::InvalidConfig {
                message: "audit_queue_depth must be non-zero".to_string(),
            });
        }
        Ok(())
    }
}
