//! Deployment error types.

use std::time::Duration;

use thiserror::Error;

use convoy_health::ProbeTimeout;
use convoy_state::StoreError;

/// Why a deployment ended in FAILED.
///
/// Being superseded by a newer generation is not an error; it is the
/// [`MachineOutcome::Superseded`](crate::MachineOutcome::Superseded) outcome.
#[derive(Debug, Error)]
pub enum DeployError {
    #[error("instance did not start within {0:?}")]
    StartTimeout(Duration),

    #[error(transparent)]
    ProbeTimeout(#[from] ProbeTimeout),

    #[error("runtime error: {0}")]
    Runtime(String),

    #[error("job spec {0} not found")]
    JobNotFound(String),

    #[error("state store error: {0}")]
    Store(#[from] StoreError),
}
