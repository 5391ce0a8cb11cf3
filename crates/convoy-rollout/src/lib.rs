//! Convoy rollouts — batched deployment of a job across a group.
//!
//! # Components
//!
//! - **`policy`** — batching, timeouts, failure handling, host ordering
//! - **`controller`** — the coordinator (start, cancel, undeploy)
//! - **`status`** — per-host outcomes, aggregate phase, reconstruction
//!   from store state

pub mod controller;
pub mod error;
pub mod policy;
pub mod status;

pub use controller::{RolloutCoordinator, RolloutHandle};
pub use error::{RolloutError, RolloutResult};
pub use policy::{FailurePolicy, RolloutPolicy};
pub use status::{HostOutcome, HostReport, OutcomeCounts, RolloutPhase, RolloutStatus};
