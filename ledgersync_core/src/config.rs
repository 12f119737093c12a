use crate::sync::backoff::RetryPolicy;
use crate::{Error, Result};
use std::time::Duration;

/// Tuning knobs for the sync orchestration engine.
///
/// Every field has a working default; `from_env` overrides from
/// `LEDGERSYNC_*` variables where set.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Delay between sync cycles for an account when no work remains.
    pub sync_interval: Duration,
    /// Refresh credentials this long before they actually expire.
    pub credential_lead_time: Duration,
    /// Records requested per vendor page.
    pub page_size: u32,
    /// Attempts per page window before the kind is deferred to the next cycle.
    pub max_attempts: u32,
    /// First retry delay; doubles per attempt.
    pub retry_base: Duration,
    /// Retry delay cap.
    pub retry_max: Duration,
    /// Wait applied to rate-limit responses that carry no Retry-After hint.
    pub rate_limit_backoff: Duration,
    /// Timeout applied to each vendor fetch and each persistence call.
    pub op_timeout: Duration,
    /// Per-account execution lease duration; must outlast one cycle.
    pub lease_ttl: Duration,
    /// Credential refresh attempts before the account is marked errored.
    pub max_refresh_attempts: u32,
    /// Pages drained per kind per cycle before yielding with `has_more`.
    pub max_pages_per_cycle: u32,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            sync_interval: Duration::from_secs(300),
            credential_lead_time: Duration::from_secs(300),
            page_size: 500,
            max_attempts: 3,
            retry_base: Duration::from_secs(1),
            retry_max: Duration::from_secs(300),
            rate_limit_backoff: Duration::from_secs(30),
            op_timeout: Duration::from_secs(30),
            lease_ttl: Duration::from_secs(600),
            max_refresh_attempts: 3,
            max_pages_per_cycle: 50,
        }
    }
}

impl SyncConfig {
    pub fn from_env() -> Result<Self> {
        let mut cfg = Self::default();

        if let Some(secs) = env_u64("LEDGERSYNC_SYNC_INTERVAL_SECS") {
            cfg.sync_interval = Duration::from_secs(secs);
        }
        if let Some(secs) = env_u64("LEDGERSYNC_CREDENTIAL_LEAD_SECS") {
            cfg.credential_lead_time = Duration::from_secs(secs);
        }
        if let Some(n) = env_u64("LEDGERSYNC_PAGE_SIZE") {
            cfg.page_size = n as u32;
        }
        if let Some(n) = env_u64("LEDGERSYNC_MAX_ATTEMPTS") {
            cfg.max_attempts = n as u32;
        }
        if let Some(ms) = env_u64("LEDGERSYNC_RETRY_BASE_MS") {
            cfg.retry_base = Duration::from_millis(ms);
        }
        if let Some(ms) = env_u64("LEDGERSYNC_RETRY_MAX_MS") {
            cfg.retry_max = Duration::from_millis(ms);
        }
        if let Some(secs) = env_u64("LEDGERSYNC_RATE_LIMIT_BACKOFF_SECS") {
            cfg.rate_limit_backoff = Duration::from_secs(secs);
        }
        if let Some(secs) = env_u64("LEDGERSYNC_OP_TIMEOUT_SECS") {
            cfg.op_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = env_u64("LEDGERSYNC_LEASE_TTL_SECS") {
            cfg.lease_ttl = Duration::from_secs(secs);
        }
        if let Some(n) = env_u64("LEDGERSYNC_MAX_REFRESH_ATTEMPTS") {
            cfg.max_refresh_attempts = n as u32;
        }
        if let Some(n) = env_u64("LEDGERSYNC_MAX_PAGES_PER_CYCLE") {
            cfg.max_pages_per_cycle = n as u32;
        }

        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.sync_interval.is_zero() {
            return Err(Error::InvalidInput("sync_interval must be > 0".to_string()));
        }
        if self.page_size == 0 {
            return Err(Error::InvalidInput("page_size must be > 0".to_string()));
        }
        if self.max_attempts == 0 {
            return Err(Error::InvalidInput("max_attempts must be > 0".to_string()));
        }
        if self.retry_base.is_zero() {
            return Err(Error::InvalidInput("retry_base must be > 0".to_string()));
        }
        if self.retry_max < self.retry_base {
            return Err(Error::InvalidInput(
                "retry_max must be >= retry_base".to_string(),
            ));
        }
        if self.op_timeout.is_zero() {
            return Err(Error::InvalidInput("op_timeout must be > 0".to_string()));
        }
        if self.lease_ttl.is_zero() {
            return Err(Error::InvalidInput("lease_ttl must be > 0".to_string()));
        }
        if self.max_refresh_attempts == 0 {
            return Err(Error::InvalidInput(
                "max_refresh_attempts must be > 0".to_string(),
            ));
        }
        if self.max_pages_per_cycle == 0 {
            return Err(Error::InvalidInput(
                "max_pages_per_cycle must be > 0".to_string(),
            ));
        }
        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            base: self.retry_base,
            max: self.retry_max,
        }
    }
}

fn env_u64(key: &str) -> Option<u64> {
    std::env::var(key).ok().and_then(|v| v.parse::<u64>().ok())
}
