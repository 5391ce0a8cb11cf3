//! Error types for the Convoy coordination store.

use thiserror::Error;

/// Result type alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors that can occur during coordination store operations.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("node not found: {0}")]
    NotFound(String),

    #[error("node already exists: {0}")]
    NodeExists(String),

    #[error("version conflict on {path}: expected {expected}, found {actual}")]
    VersionConflict {
        path: String,
        expected: u64,
        actual: u64,
    },

    #[error("coordination store unavailable")]
    Unavailable,

    #[error("node {0} is owned by another session")]
    NotOwner(String),

    #[error("session {0} has expired")]
    SessionExpired(u64),

    #[error("invalid path: {0}")]
    InvalidPath(String),

    #[error("persistence error: {0}")]
    Persist(String),

    #[error("serialization error: {0}")]
    Serialize(String),

    #[error("deserialization error: {0}")]
    Deserialize(String),
}

impl StoreError {
    /// Whether the caller should re-read and retry.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::VersionConflict { .. } | Self::NodeExists(_) | Self::NotFound(_))
    }

    /// Whether a commit fenced on `fence` was rejected because the
    /// committing session no longer owns that node.
    pub fn is_fenced_out(&self, fence: &str) -> bool {
        match self {
            Self::NotOwner(p) | Self::NotFound(p) => p == fence,
            Self::SessionExpired(_) => true,
            _ => false,
        }
    }

    /// Node path the error refers to, if any.
    pub fn path(&self) -> Option<&str> {
        match self {
            Self::NotFound(p)
            | Self::NodeExists(p)
            | Self::NotOwner(p)
            | Self::InvalidPath(p)
            | Self::VersionConflict { path: p, .. } => Some(p),
            _ => None,
        }
    }
}

/// A job or health check descriptor failed validation.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("{0} must not be empty")]
    Empty(&'static str),

    #[error("job name {0:?} must not contain '/' or ':'")]
    InvalidName(String),

    #[error("health check references undeclared port {0:?}")]
    UnknownPort(String),

    #[error("health check port reference is empty")]
    EmptyPort,

    #[error("exec health check command is empty")]
    EmptyCommand,
}
