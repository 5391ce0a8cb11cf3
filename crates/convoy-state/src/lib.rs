//! convoy-state — shared coordination state for Convoy.
//!
//! Everything the leader and the agents exchange flows through a
//! hierarchical, versioned, watchable store. This crate holds the data
//! model, the store capability and its in-process implementation, a typed
//! client, and leader election.
//!
//! # Architecture
//!
//! ```text
//! StoreClient (JSON, paths, retry on Unavailable)
//!   └── Arc<dyn CoordinationStore>
//!         └── LocalStore
//!               ├── persistent nodes → redb (survive restart)
//!               ├── ephemeral nodes  → memory, tied to a session
//!               └── prefix watches   → tokio mpsc
//! ```
//!
//! Desired state (`/jobs`, `/groups`, `/deployments`, `/generations`) is
//! written only by the leader, conditioned on node versions and, under a
//! [`LeaderLatch`], on the leader's session still owning `/leader`. Actual
//! state (`/statuses`) is written only by the agent session owning that
//! host.

pub mod client;
pub mod error;
pub mod leader;
pub mod paths;
pub mod store;
pub mod types;

pub use client::{Guard, RetryPolicy, StoreClient, Versioned};
pub use error::{StoreError, StoreResult, ValidationError};
pub use leader::{FixedLeadership, LeaderLatch, Leadership};
pub use store::{
    ChangeEvent, ChangeKind, CoordinationStore, LocalStore, Node, Op, SessionId, Stat, Watch,
};
pub use types::*;
