//! Multi-participant collaboration sessions.
//!
//! - `participant`: participant specs and generation-parameter precedence
//! - `session`: requests, contributions, live session state and reports
//! - `prompt`: turn, selection and synthesis prompts
//! - `scheduler`: the `CollaborationScheduler` that drives sessions

pub mod participant;
pub mod prompt;
pub mod scheduler;
pub mod session;

pub use participant::{resolve_generation, GenerationDefaults, ParticipantSpec};
pub use scheduler::CollaborationScheduler;
pub use session::{
    CollaborationMode, CollaborationOutcome, CollaborationRequest, CollaborationSession,
    Contribution, SessionReport, SynthesisStrategy,
};
