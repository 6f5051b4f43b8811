//! Error types for the configuration store.

use thiserror::Error;
use vmgrid_core::{ErrorKind, GridError};

/// Result type alias for state store operations.
pub type StateResult<T> = Result<T, StateError>;

#[derive(Debug, Error)]
pub enum StateError {
    #[error("configuration document not found")]
    NotFound,

    #[error("lock error: {0}")]
    Lock(String),

    #[error("read error: {0}")]
    Read(String),

    #[error("write error: {0}")]
    Write(String),

    #[error("serialization error: {0}")]
    Serialize(String),

    #[error("deserialization error: {0}")]
    Deserialize(String),

    #[error("on-disk version {found} predates the oldest supported version {oldest}; install an intermediate release first")]
    IntermediateUpgradeRequired { found: u32, oldest: u32 },

    #[error("on-disk version {found} is newer than supported version {current}")]
    TooNew { found: u32, current: u32 },

    #[error("migration from version {from} failed: {reason}")]
    Migration { from: u32, reason: String },

    #[error("failed to open stats database: {0}")]
    Open(String),

    #[error("transaction error: {0}")]
    Transaction(String),

    #[error("table error: {0}")]
    Table(String),

    /// The update callback refused the change.
    #[error(transparent)]
    Rejected(#[from] GridError),
}

impl From<StateError> for GridError {
    fn from(e: StateError) -> Self {
        match e {
            StateError::Rejected(inner) => inner,
            StateError::NotFound => GridError::new(ErrorKind::ConfigNotFound, e.to_string()),
            StateError::IntermediateUpgradeRequired { .. } => {
                GridError::new(ErrorKind::IntermediateUpgradeRequired, e.to_string())
            }
            StateError::TooNew { .. } => GridError::new(ErrorKind::VersionMismatch, e.to_string()),
            other => GridError::bug(other.to_string()),
        }
    }
}
