//! Structured lifecycle events for handles, turns, waits and sessions.
//!
//! Every function emits one `tracing` event with an `event` field naming it,
//! so log pipelines can filter on `event = "session.finished"` and friends.

use convene_state::{HandleId, HandleKind, HandleStatus};
use tracing::{info, warn};

/// Span carrying `session_id`; attach it to a session's future with
/// `tracing::Instrument::instrument`.
pub fn session_span(session_id: &HandleId) -> tracing::Span {
    tracing::info_span!("convene.session", session_id = %session_id)
}

pub fn emit_handle_created(id: &HandleId, kind: HandleKind) {
    tracing::debug!(event = "handle.created", handle_id = %id, kind = %kind);
}

pub fn emit_handle_resolved(id: &HandleId, status: HandleStatus) {
    tracing::debug!(event = "handle.resolved", handle_id = %id, status = %status);
}

pub fn emit_session_started(session_id: &HandleId, mode: &str, participants: usize, max_rounds: u32) {
    info!(
        event = "session.started",
        session_id = %session_id,
        mode = %mode,
        participants = participants,
        max_rounds = max_rounds,
    );
}

pub fn emit_session_finished(session_id: &HandleId, status: HandleStatus, attempts: usize, failed: usize) {
    info!(
        event = "session.finished",
        session_id = %session_id,
        status = %status,
        turn_attempts = attempts,
        failed_turns = failed,
    );
}

pub fn emit_turn_finished(participant: &str, round: u32, status: HandleStatus, waited_ms: u64) {
    if status.is_success() {
        info!(event = "turn.finished", participant = %participant, round = round, waited_ms = waited_ms);
    } else {
        warn!(
            event = "turn.finished",
            participant = %participant,
            round = round,
            status = %status,
            waited_ms = waited_ms,
        );
    }
}

pub fn emit_wait_finished(mode: &str, status: &str, completed: usize, total: usize, waited_ms: u64) {
    tracing::debug!(
        event = "wait.finished",
        mode = %mode,
        status = %status,
        completed = completed,
        total = total,
        waited_ms = waited_ms,
    );
}
