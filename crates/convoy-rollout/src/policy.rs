//! Rollout policy — batching, timeouts and failure handling.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use convoy_placement::HostPickingStrategy;

use crate::error::{RolloutError, RolloutResult};

/// What a rollout does once a host fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Mark the rollout FAILED at the first failing host, let the current
    /// batch resolve, then schedule nothing further.
    #[default]
    AbortOnFirstFailure,
    /// Attempt every host and report the aggregate.
    BestEffort,
}

/// How to roll a job out across a deployment group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RolloutPolicy {
    /// Hosts per batch.
    pub parallelism: u32,
    /// How long to wait for a host to reach a terminal state.
    pub host_timeout_ms: u64,
    /// Grace period handed to agents for the health check.
    pub grace_period_ms: u64,
    pub on_failure: FailurePolicy,
    pub strategy: HostPickingStrategy,
    /// Overall deadline for the rollout, if any.
    pub deadline_ms: Option<u64>,
}

impl Default for RolloutPolicy {
    fn default() -> Self {
        Self {
            parallelism: 1,
            host_timeout_ms: 120_000,
            grace_period_ms: 60_000,
            on_failure: FailurePolicy::AbortOnFirstFailure,
            strategy: HostPickingStrategy::Random,
            deadline_ms: None,
        }
    }
}

impl RolloutPolicy {
    pub fn validate(&self) -> RolloutResult<()> {
        if self.parallelism == 0 {
            return Err(RolloutError::InvalidPolicy("parallelism must be at least 1".into()));
        }
        if self.host_timeout_ms == 0 {
            return Err(RolloutError::InvalidPolicy("host_timeout_ms must be positive".into()));
        }
        if self.deadline_ms == Some(0) {
            return Err(RolloutError::InvalidPolicy("deadline_ms must be positive".into()));
        }
        Ok(())
    }

    pub fn host_timeout(&self) -> Duration {
        Duration::from_millis(self.host_timeout_ms)
    }

    pub fn deadline(&self) -> Option<Duration> {
        self.deadline_ms.map(Duration::from_millis)
    }

    pub fn batch_size(&self) -> usize {
        usize::try_from(self.parallelism).unwrap_or(usize::MAX).max(1)
    }

    /// Number of batches needed for `hosts` hosts.
    pub fn batch_count(&self, hosts: usize) -> usize {
        hosts.div_ceil(self.batch_size())
    }
}
