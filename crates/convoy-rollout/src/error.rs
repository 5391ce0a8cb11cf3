//! Rollout error types.

use thiserror::Error;

use convoy_state::{StoreError, ValidationError};

/// Reasons a rollout cannot be started or an undeploy cannot be issued.
///
/// Per-host failures are not errors; they are recorded as
/// [`HostOutcome`](crate::HostOutcome)s in the rollout status.
#[derive(Debug, Error)]
pub enum RolloutError {
    #[error("not the current leader")]
    NotLeader,

    #[error("deployment group {0} has no hosts")]
    EmptyGroup(String),

    #[error("invalid rollout policy: {0}")]
    InvalidPolicy(String),

    #[error("invalid job spec: {0}")]
    InvalidJob(#[from] ValidationError),

    #[error("state store error: {0}")]
    Store(#[from] StoreError),
}

pub type RolloutResult<T> = Result<T, RolloutError>;
