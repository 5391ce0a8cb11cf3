//! # convoy-agent
//!
//! Host-side half of a rollout. The agent on each host watches its slice
//! of desired state and drives every assigned job through the deployment
//! lifecycle, reporting progress as ephemeral status nodes.
//!
//! ## Architecture
//!
//! ```text
//! /deployments/{host}/*  ──watch──►  Agent (supervisor)
//!                                      │ one slot per job
//!                                      ▼
//!                              DeploymentMachine ──► InstanceRuntime
//!                                      │                (start/stop)
//!                                      ├──► Prober (health checks)
//!                                      ▼
//!                          /statuses/{host}/{job} (ephemeral, guarded)
//! ```

pub mod error;
pub mod machine;
pub mod runtime;
pub mod supervisor;

pub use error::DeployError;
pub use machine::{DeploymentMachine, MachineConfig, MachineOutcome};
pub use runtime::{
    HostScript, Instance, InstanceRuntime, ScriptedRuntime, StartBehavior, published_ports,
};
pub use supervisor::Agent;
