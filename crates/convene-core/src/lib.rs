//! Convene Core Library
//!
//! Waiters, background task dispatch and round-based collaboration
//! scheduling on top of the `convene-state` handle registry.
//!
//! - `waiter`: block on one handle, or on many with ALL / ANY / RACE semantics
//! - `dispatcher`: run a unit of work in the background and report it into a handle
//! - `collaboration`: multi-round, multi-participant sessions
//! - `tools`: JSON operation surface for agent tool callers

pub mod collaboration;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod generator;
pub mod metrics;
pub mod obs;
pub mod telemetry;
pub mod tools;
pub mod waiter;

/// Crate version, as published in the workspace manifest.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub use collaboration::{
    CollaborationMode, CollaborationOutcome, CollaborationRequest, CollaborationScheduler,
    CollaborationSession, Contribution, GenerationDefaults, ParticipantSpec, SessionReport,
    SynthesisStrategy,
};
pub use config::{ConveneConfig, WaitConfig};
pub use dispatcher::TaskDispatcher;
pub use error::{ConveneError, Result, ValidationError};
pub use generator::{EchoGenerator, Generation, GenerationConfig, GenerationError, Generator, Usage};
pub use tools::HandleTools;
pub use waiter::{MultiWaitOutcome, MultiWaitStatus, WaitMode, WaitOutcome, Waiter};

pub use convene_state::{
    CancellationToken, HandleFailure, HandleFilter, HandleId, HandleKind, HandleRegistry,
    HandleSnapshot, HandleSpec, HandleStatus, RegistryError,
};
