//! Error types for convene-state

use thiserror::Error;

use crate::handle::{HandleId, HandleStatus};

/// Errors raised by the handle registry.
///
/// Every variant is a programming error on the caller's side: the registry
/// never produces them for expected runtime conditions such as a timeout or a
/// failed unit of work, which are recorded as handle states instead.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// No handle with this id is registered (or it was purged)
    #[error("handle not found: {id}")]
    NotFound { id: HandleId },

    /// A handle with this id already exists
    #[error("duplicate handle id: {id}")]
    DuplicateId { id: HandleId },

    /// A terminal transition was attempted on a handle that already resolved
    #[error("handle {id} already resolved as {status}")]
    AlreadyResolved { id: HandleId, status: HandleStatus },
}

/// Result type for registry operations
pub type RegistryResult<T> = std::result::Result<T, RegistryError>;
