//! convoy-health — health probing for Convoy deployments.
//!
//! Interprets a job's [`HealthCheck`](convoy_state::HealthCheck) against a
//! running instance. The deployment state machine starts the prober once
//! the instance is up and moves to RUNNING on the first pass, or to FAILED
//! when the grace period runs out.
//!
//! # Architecture
//!
//! ```text
//! Prober::await_healthy(check, target, grace)
//!   └── every interval, until pass or deadline
//!       └── Prober::probe() dispatches on the check variant
//!           ├── http_probe()  GET host:port/path, 2xx passes
//!           ├── tcp_probe()   connect host:port
//!           └── exec_probe()  Exec seam, exit 0 passes
//! ```
//!
//! Transient errors (refused connections, timeouts, non-zero exits) are
//! failed attempts, never errors. Only [`ProbeTimeout`] is fatal.

pub mod checker;
pub mod prober;

pub use checker::{BoxFuture, Exec, LocalExec, ProbeResult};
pub use prober::{ProbeReport, ProbeTarget, ProbeTimeout, Prober};
