//! Prompt construction for turns, selection and synthesis.
//!
//! Every prompt starts with a `Role:` line so generators (and the echo stub)
//! can tell who is speaking.

use super::participant::ParticipantSpec;
use super::session::Contribution;

fn context_block(out: &mut String, context: &[Contribution]) {
    if context.is_empty() {
        out.push_str("Contributions so far: none\n");
        return;
    }
    out.push_str("Contributions so far:\n");
    for c in context {
        let text = c.text.as_deref().unwrap_or_default();
        out.push_str(&format!("[{}, round {}] {}\n", c.participant_id, c.round, text));
    }
}

/// Prompt for one participant turn. The task comes last.
pub fn turn_prompt(
    task: &str,
    participant: &ParticipantSpec,
    round: u32,
    max_rounds: u32,
    context: &[Contribution],
) -> String {
    let mut out = String::new();
    out.push_str(&format!("Participant: {}\n", participant.id));
    out.push_str(&format!("Role: {}\n", participant.persona()));
    out.push_str(&format!("Round: {round} of {max_rounds}\n"));
    context_block(&mut out, context);
    out.push_str(&format!("Task: {task}"));
    out
}

/// Prompt asking which participants should speak next.
pub fn selection_prompt(
    task: &str,
    round: u32,
    context: &[Contribution],
    candidates: &[ParticipantSpec],
) -> String {
    let mut out = String::new();
    out.push_str("Role: moderator\n");
    out.push_str(&format!("Task: {task}\n"));
    context_block(&mut out, context);
    out.push_str(&format!(
        "Name the participants most relevant to the latest contributions for round {round}.\n"
    ));
    let ids: Vec<&str> = candidates.iter().map(|p| p.id.as_str()).collect();
    out.push_str(&format!("Candidates: {}", ids.join(", ")));
    out
}

/// Participants named in a selection reply, in configured order.
///
/// Matching is by whole token and case-insensitive.
pub fn parse_selection(reply: &str, candidates: &[ParticipantSpec]) -> Vec<ParticipantSpec> {
    let tokens: Vec<String> = reply
        .split(|c: char| !(c.is_alphanumeric() || matches!(c, '-' | '_' | '.')))
        .map(|t| t.trim_matches('.').to_lowercase())
        .filter(|t| !t.is_empty())
        .collect();
    candidates
        .iter()
        .filter(|p| {
            let id = p.id.to_lowercase();
            tokens.iter().any(|t| *t == id)
        })
        .cloned()
        .collect()
}

/// Prompt for a generated final synthesis.
pub fn synthesis_prompt(task: &str, context: &[Contribution]) -> String {
    let mut out = String::new();
    out.push_str("Role: synthesizer\n");
    out.push_str(&format!("Task: {task}\n"));
    context_block(&mut out, context);
    out.push_str("Summarize the contributions above into one final answer.");
    out
}

/// `[participant-id] text` per successful contribution.
pub fn concatenate(context: &[Contribution]) -> String {
    context
        .iter()
        .filter(|c| c.succeeded())
        .map(|c| format!("[{}] {}", c.participant_id, c.text.as_deref().unwrap_or_default()))
        .collect::<Vec<_>>()
        .join("\n")
}
