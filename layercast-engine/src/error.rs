//! Error types for layercast-engine
//!
//! Configuration errors are itemized and reported before a run starts.
//! Asset errors (a selected trait with no image) never surface here: the
//! compositor skips the layer and logs it. Infrastructure errors (storage,
//! compositing, task failures) abort the run and move the session to ERROR.

use thiserror::Error;
use uuid::Uuid;

use crate::combination::CombinationError;
use crate::compositor::CompositeError;
use crate::layers::LayerError;
use crate::persistence::PersistenceError;
use crate::storage::StorageError;

/// Engine error type
#[derive(Debug, Error)]
pub enum EngineError {
    /// No session with this id
    #[error("Session not found: {0}")]
    SessionNotFound(Uuid),

    /// Configuration rejected; one message per problem
    #[error("Invalid configuration: {}", .0.join("; "))]
    InvalidConfig(Vec<String>),

    /// Uploaded layers rejected; one message per problem
    #[error("Invalid layers: {}", .0.join("; "))]
    InvalidLayers(Vec<String>),

    /// Operation not allowed in the session's current state
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Layer loading error
    #[error(transparent)]
    Layer(#[from] LayerError),

    /// Combination generation error
    #[error(transparent)]
    Combination(#[from] CombinationError),

    /// Compositing error
    #[error(transparent)]
    Composite(#[from] CompositeError),

    /// Storage collaborator error
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// Document encoding error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Session snapshot could not be read or written
    #[error(transparent)]
    Persistence(#[from] PersistenceError),

    /// Worker task panicked or was aborted
    #[error("Task failed: {0}")]
    TaskFailed(String),
}

impl From<tokio::task::JoinError> for EngineError {
    fn from(err: tokio::task::JoinError) -> Self {
        EngineError::TaskFailed(err.to_string())
    }
}

/// Result type for engine operations
pub type EngineResult<T> = Result<T, EngineError>;
