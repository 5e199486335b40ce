//! Error taxonomy for Convene coordination.

use convene_state::{HandleFailure, HandleId, RegistryError};

/// Malformed input to the core API.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ValidationError {
    #[error("collaboration needs at least one participant")]
    NoParticipants,

    #[error("max_rounds must be positive, got {0}")]
    NonPositiveRounds(i64),

    #[error("unknown collaboration mode: {0}")]
    UnknownMode(String),

    #[error("unknown wait mode: {0}")]
    UnknownWaitMode(String),

    #[error("task description must not be empty")]
    EmptyTask,

    #[error("duplicate participant id: {0}")]
    DuplicateParticipant(String),

    #[error("participant id must not be empty")]
    EmptyParticipantId,

    #[error("temperature {value} for {scope} is outside 0.0..=2.0")]
    TemperatureOutOfRange { scope: String, value: f32 },

    #[error("wait set must contain at least one handle id")]
    EmptyWaitSet,

    #[error("unknown operation: {0}")]
    UnknownOperation(String),

    #[error("invalid arguments for {operation}: {reason}")]
    InvalidArguments { operation: String, reason: String },
}

/// Convene core errors.
#[derive(Debug, thiserror::Error)]
pub enum ConveneError {
    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("timed out after {waited_ms}ms waiting for {pending:?}")]
    Timeout {
        waited_ms: u64,
        pending: Vec<HandleId>,
    },

    #[error("handle {0} was cancelled")]
    Cancelled(HandleId),

    #[error("dispatch error: {0}")]
    Dispatch(String),

    #[error("session {id} failed: {failure}")]
    SessionFailed { id: HandleId, failure: HandleFailure },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type for Convene core operations.
pub type Result<T> = std::result::Result<T, ConveneError>;
