//! Collaboration session model: requests, contributions, live session state
//! and the report handed back to synchronous callers.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use convene_state::{HandleFailure, HandleId, HandleStatus};

use super::participant::{check_temperature, GenerationDefaults, ParticipantSpec};
use crate::error::ValidationError;
use crate::generator::{GenerationConfig, Usage};

/// How participants take turns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CollaborationMode {
    /// One round, participants in listed order, each seeing earlier turns
    Linear,
    /// All participants concurrently, no visibility within the round
    Parallel,
    /// Listed order for every round; context grows across the session
    #[default]
    Rounds,
    /// Like `Rounds`, but a selection step picks who speaks each round
    IntelligentSubset,
}

impl std::fmt::Display for CollaborationMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CollaborationMode::Linear => "linear",
            CollaborationMode::Parallel => "parallel",
            CollaborationMode::Rounds => "rounds",
            CollaborationMode::IntelligentSubset => "intelligent-subset",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for CollaborationMode {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "linear" => Ok(CollaborationMode::Linear),
            "parallel" => Ok(CollaborationMode::Parallel),
            "rounds" => Ok(CollaborationMode::Rounds),
            "intelligent-subset" => Ok(CollaborationMode::IntelligentSubset),
            _ => Err(ValidationError::UnknownMode(s.to_string())),
        }
    }
}

/// How the final synthesis is produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SynthesisStrategy {
    /// `[participant-id] text` per successful contribution
    #[default]
    Concatenate,
    /// Ask the generator to summarize; falls back to concatenation
    Generated,
}

impl std::str::FromStr for SynthesisStrategy {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "concatenate" => Ok(SynthesisStrategy::Concatenate),
            "generated" => Ok(SynthesisStrategy::Generated),
            _ => Err(ValidationError::InvalidArguments {
                operation: "synthesis".to_string(),
                reason: format!("unknown strategy {s:?}"),
            }),
        }
    }
}

/// Everything needed to start a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollaborationRequest {
    pub task: String,
    pub participants: Vec<ParticipantSpec>,
    pub max_rounds: u32,
    #[serde(default)]
    pub mode: CollaborationMode,
    #[serde(default)]
    pub defaults: GenerationDefaults,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_timeout_ms: Option<u64>,
    /// Overrides the configured strategy for this session
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub synthesis: Option<SynthesisStrategy>,
}

impl CollaborationRequest {
    pub fn new(task: &str, participants: Vec<ParticipantSpec>) -> Self {
        CollaborationRequest {
            task: task.to_string(),
            participants,
            max_rounds: 1,
            mode: CollaborationMode::default(),
            defaults: GenerationDefaults::default(),
            session_timeout_ms: None,
            synthesis: None,
        }
    }

    pub fn with_mode(mut self, mode: CollaborationMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_max_rounds(mut self, max_rounds: u32) -> Self {
        self.max_rounds = max_rounds;
        self
    }

    pub fn with_defaults(mut self, defaults: GenerationDefaults) -> Self {
        self.defaults = defaults;
        self
    }

    pub fn with_session_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.session_timeout_ms = Some(timeout_ms);
        self
    }

    pub fn with_synthesis(mut self, synthesis: SynthesisStrategy) -> Self {
        self.synthesis = Some(synthesis);
        self
    }

    /// Reject malformed requests before any handle is created.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.task.trim().is_empty() {
            return Err(ValidationError::EmptyTask);
        }
        if self.participants.is_empty() {
            return Err(ValidationError::NoParticipants);
        }
        if self.max_rounds == 0 {
            return Err(ValidationError::NonPositiveRounds(0));
        }
        check_temperature("session defaults", self.defaults.temperature)?;

        let mut seen = HashSet::new();
        for p in &self.participants {
            if p.id.trim().is_empty() {
                return Err(ValidationError::EmptyParticipantId);
            }
            if !seen.insert(p.id.as_str()) {
                return Err(ValidationError::DuplicateParticipant(p.id.clone()));
            }
            check_temperature(&format!("participant {}", p.id), p.temperature)?;
        }
        Ok(())
    }

    /// Rounds actually run: linear mode is a single pass.
    pub fn effective_rounds(&self) -> u32 {
        match self.mode {
            CollaborationMode::Linear => 1,
            _ => self.max_rounds,
        }
    }
}

/// One participant turn, successful or not.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Contribution {
    pub participant_id: String,
    pub role: String,
    pub round: u32,
    /// 1-based attempt number across the whole session
    pub turn: u32,
    pub handle_id: HandleId,
    pub status: HandleStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<HandleFailure>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
    pub config: GenerationConfig,
}

impl Contribution {
    pub fn succeeded(&self) -> bool {
        self.status.is_success()
    }

    pub fn error_message(&self) -> String {
        match &self.error {
            Some(e) => e.to_string(),
            None => self.status.to_string(),
        }
    }
}

/// Live state of a session, readable while it runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollaborationSession {
    pub session_id: HandleId,
    pub task: String,
    pub mode: CollaborationMode,
    pub max_rounds: u32,
    pub participants: Vec<ParticipantSpec>,
    pub status: HandleStatus,
    /// Successful contributions in the order they became visible
    pub accumulated_context: Vec<Contribution>,
    /// Every attempt, grouped by round
    pub round_results: Vec<Vec<Contribution>>,
    pub round_handles: Vec<HandleId>,
    pub turn_attempts: usize,
    pub failed_turns: usize,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub final_synthesis: Option<String>,
}

impl CollaborationSession {
    pub(crate) fn new(session_id: HandleId, request: &CollaborationRequest, started_at: DateTime<Utc>) -> Self {
        CollaborationSession {
            session_id,
            task: request.task.clone(),
            mode: request.mode,
            max_rounds: request.max_rounds,
            participants: request.participants.clone(),
            status: HandleStatus::Pending,
            accumulated_context: Vec::new(),
            round_results: Vec::new(),
            round_handles: Vec::new(),
            turn_attempts: 0,
            failed_turns: 0,
            started_at,
            finished_at: None,
            final_synthesis: None,
        }
    }

    pub(crate) fn begin_round(&mut self, round_handle: HandleId) {
        self.round_handles.push(round_handle);
        self.round_results.push(Vec::new());
    }

    pub(crate) fn record(&mut self, contribution: Contribution) {
        self.turn_attempts += 1;
        if contribution.succeeded() {
            self.accumulated_context.push(contribution.clone());
        } else {
            self.failed_turns += 1;
        }
        match self.round_results.last_mut() {
            Some(round) => round.push(contribution),
            None => self.round_results.push(vec![contribution]),
        }
    }
}

/// Value stored in the session handle on success.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollaborationOutcome {
    pub session_id: HandleId,
    pub rounds_run: usize,
    pub turn_attempts: usize,
    pub failed_turns: usize,
    pub round_results: Vec<Vec<Contribution>>,
    pub final_synthesis: String,
}

/// What a synchronous `run` returns. Callers branch on `status`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionReport {
    pub session_id: HandleId,
    pub status: HandleStatus,
    pub round_results: Vec<Vec<Contribution>>,
    pub accumulated_context: Vec<Contribution>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_synthesis: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<HandleFailure>,
    pub turn_attempts: usize,
    pub failed_turns: usize,
    pub waited_ms: u64,
}
