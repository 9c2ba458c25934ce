// ABOUTME: Tunable parameters of the sandbox pool, read once at startup
// ABOUTME: Sizes, lease and timing budgets, provisioning retry policy and recycle behaviour

use crate::types::ResourceSpec;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SettingsError {
    #[error("baseline size {baseline} exceeds max size {max}")]
    BaselineAboveMax { baseline: usize, max: usize },

    #[error("max size must be at least 1")]
    ZeroMaxSize,

    #[error("invalid lease settings: {0}")]
    InvalidLease(String),

    #[error("invalid setting {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Upper bound accepted for `max_lease`
pub const MAX_LEASE_LIMIT: Duration = Duration::from_secs(30 * 24 * 3600);

/// What happens to a sandbox after its lease is released
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecyclePolicy {
    /// Return the sandbox to the pool as Free
    #[default]
    Reuse,
    /// Destroy the sandbox and provision a fresh one in its place
    Replace,
}

impl RecyclePolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Reuse => "reuse",
            Self::Replace => "replace",
        }
    }
}

impl FromStr for RecyclePolicy {
    type Err = SettingsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "reuse" => Ok(Self::Reuse),
            "replace" => Ok(Self::Replace),
            other => Err(SettingsError::Invalid {
                field: "recycle",
                reason: format!("expected 'reuse' or 'replace', got '{}'", other),
            }),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PoolSettings {
    /// Free-or-allocated slots the pool keeps warm
    pub baseline_size: usize,
    /// Hard ceiling on slots in any state
    pub max_size: usize,
    pub resource_spec: ResourceSpec,

    /// Lease granted when the caller does not ask for one
    pub default_lease: Duration,
    pub max_lease: Duration,
    /// How long acquire waits for a slot when the caller does not say
    pub default_wait_timeout: Duration,

    pub sweep_interval: Duration,
    /// Slots not probed successfully for this long are probed again
    pub probe_staleness: Duration,
    /// Free slots above baseline idle for this long are drained
    pub idle_timeout: Option<Duration>,

    /// Provisioning attempts after the first failure
    pub provision_retries: u32,
    /// First retry delay, doubled on every further attempt
    pub provision_backoff: Duration,
    pub max_provision_backoff: Duration,
    pub max_concurrent_provisions: usize,

    pub shutdown_timeout: Duration,
    pub recycle: RecyclePolicy,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            baseline_size: 3,
            max_size: 10,
            resource_spec: ResourceSpec::default(),
            default_lease: Duration::from_secs(3600),
            max_lease: Duration::from_secs(4 * 3600),
            default_wait_timeout: Duration::from_secs(60),
            sweep_interval: Duration::from_secs(60),
            probe_staleness: Duration::from_secs(1200),
            idle_timeout: None,
            provision_retries: 3,
            provision_backoff: Duration::from_secs(2),
            max_provision_backoff: Duration::from_secs(60),
            max_concurrent_provisions: 128,
            shutdown_timeout: Duration::from_secs(60),
            recycle: RecyclePolicy::Reuse,
        }
    }
}

impl PoolSettings {
    pub fn validate(&self) -> Result<(), SettingsError> {
        if self.max_size == 0 {
            return Err(SettingsError::ZeroMaxSize);
        }
        if self.baseline_size > self.max_size {
            return Err(SettingsError::BaselineAboveMax {
                baseline: self.baseline_size,
                max: self.max_size,
            });
        }
        if self.default_lease.is_zero() {
            return Err(SettingsError::InvalidLease(
                "default lease must be positive".to_string(),
            ));
        }
        if self.default_lease > self.max_lease {
            return Err(SettingsError::InvalidLease(format!(
                "default lease {:?} exceeds max lease {:?}",
                self.default_lease, self.max_lease
            )));
        }
        if self.max_lease > MAX_LEASE_LIMIT {
            return Err(SettingsError::InvalidLease(format!(
                "max lease {:?} exceeds the {} day limit",
                self.max_lease,
                MAX_LEASE_LIMIT.as_secs() / 86_400
            )));
        }
        if self.sweep_interval.is_zero() {
            return Err(SettingsError::Invalid {
                field: "sweep_interval",
                reason: "must be positive".to_string(),
            });
        }
        if self.max_concurrent_provisions == 0 {
            return Err(SettingsError::Invalid {
                field: "max_concurrent_provisions",
                reason: "must be at least 1".to_string(),
            });
        }
        Ok(())
    }

    /// Delay before retry number `attempt` (1-based)
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.provision_backoff
            .saturating_mul(factor)
            .min(self.max_provision_backoff)
    }
}
