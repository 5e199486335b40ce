//! Convene-State: wait-handle registry
//!
//! This crate owns the state of every wait handle in the process: a uniquely
//! identified reference to an in-flight or resolved unit of asynchronous work.
//!
//! ## Layer 0 - State
//!
//! Focus: write-once terminal transitions, lazy deadline enforcement, and
//! change notification. No I/O.
//!
//! ## Key Components
//!
//! - `HandleRegistry`: the only writer of handle status
//! - `HandleSnapshot`: point-in-time copy of a handle
//! - `HandleWatch`: per-handle status subscription used by waiters

mod error;
pub mod handle;
pub mod registry;

pub use error::{RegistryError, RegistryResult};
pub use handle::{
    HandleFailure, HandleFilter, HandleId, HandleKind, HandleSnapshot, HandleSpec, HandleStatus,
    Metadata,
};
pub use registry::{HandleRegistry, HandleWatch};

pub use tokio_util::sync::CancellationToken;
