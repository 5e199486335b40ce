//! Wait-handle data model
//!
//! These types describe a handle as callers see it:
//! - `HandleId`: unique identifier within the registry's lifetime
//! - `HandleKind` / `HandleStatus`: classification and lifecycle state
//! - `HandleFailure`: typed failure payload for `failed` / `timed_out` handles
//! - `HandleSnapshot`: point-in-time copy of a handle's full state
//! - `HandleSpec`: creation request (id, kind, metadata, timeout, parent)

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Caller-supplied annotation bag. The registry stores it verbatim and never
/// reads it for control decisions.
pub type Metadata = serde_json::Map<String, serde_json::Value>;

/// Unique identifier for a wait handle
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HandleId(pub String);

impl HandleId {
    /// Generate a new random HandleId
    pub fn new() -> Self {
        HandleId(uuid::Uuid::new_v4().to_string())
    }

    /// Generate a random id with a readable prefix, e.g. `turn-3f2a...`
    pub fn with_prefix(prefix: &str) -> Self {
        HandleId(format!("{}-{}", prefix, uuid::Uuid::new_v4().simple()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for HandleId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for HandleId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for HandleId {
    fn from(s: &str) -> Self {
        HandleId(s.to_string())
    }
}

impl From<String> for HandleId {
    fn from(s: String) -> Self {
        HandleId(s)
    }
}

/// Free-form classification of the work behind a handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HandleKind {
    #[default]
    Generic,
    ParticipantTurn,
    Round,
    Session,
    WorkflowStep,
}

impl std::fmt::Display for HandleKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            HandleKind::Generic => "generic",
            HandleKind::ParticipantTurn => "participant-turn",
            HandleKind::Round => "round",
            HandleKind::Session => "session",
            HandleKind::WorkflowStep => "workflow-step",
        };
        write!(f, "{s}")
    }
}

/// Lifecycle state of a handle.
///
/// `Pending` is the only non-terminal state. Once terminal, a handle never
/// changes again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandleStatus {
    Pending,
    Completed,
    Failed,
    TimedOut,
    Cancelled,
}

impl HandleStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, HandleStatus::Pending)
    }

    pub fn is_success(self) -> bool {
        matches!(self, HandleStatus::Completed)
    }
}

impl std::fmt::Display for HandleStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            HandleStatus::Pending => "pending",
            HandleStatus::Completed => "completed",
            HandleStatus::Failed => "failed",
            HandleStatus::TimedOut => "timed_out",
            HandleStatus::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

/// Why a handle did not complete successfully.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum HandleFailure {
    /// The unit of work returned an error
    #[error("{message}")]
    Work { message: String },

    /// The unit of work panicked
    #[error("work panicked: {message}")]
    Panicked { message: String },

    /// The handle's own deadline passed while it was pending
    #[error("deadline of {timeout_ms}ms exceeded")]
    DeadlineExceeded { timeout_ms: u64 },

    /// A waiter gave up before the handle resolved; never stored in the registry
    #[error("wait timed out after {waited_ms}ms")]
    WaitTimedOut { waited_ms: u64 },

    /// Work stopped because its session was cancelled; never stored on a
    /// cancelled handle
    #[error("cancelled")]
    Cancelled,

    /// Several child units of work failed
    #[error("{failed} of {total} failed: {}", .messages.join("; "))]
    Aggregate {
        failed: usize,
        total: usize,
        messages: Vec<String>,
    },
}

impl HandleFailure {
    pub fn work(message: impl Into<String>) -> Self {
        HandleFailure::Work {
            message: message.into(),
        }
    }
}

impl From<String> for HandleFailure {
    fn from(message: String) -> Self {
        HandleFailure::Work { message }
    }
}

impl From<&str> for HandleFailure {
    fn from(message: &str) -> Self {
        HandleFailure::work(message)
    }
}

/// Point-in-time copy of a handle.
///
/// `result` is present iff `status == Completed`; `error` is present iff the
/// status is `Failed` or `TimedOut`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandleSnapshot {
    pub id: HandleId,
    pub kind: HandleKind,
    pub status: HandleStatus,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub deadline: Option<DateTime<Utc>>,
    pub timeout_ms: Option<u64>,
    pub parent: Option<HandleId>,
    pub result: Option<serde_json::Value>,
    pub error: Option<HandleFailure>,
    pub metadata: Metadata,
}

impl HandleSnapshot {
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// Creation request for a handle.
#[derive(Debug, Clone, Default)]
pub struct HandleSpec {
    /// Explicit id; a random one is generated when `None`
    pub id: Option<HandleId>,
    pub kind: HandleKind,
    pub metadata: Metadata,
    /// Deadline relative to creation time
    pub timeout: Option<Duration>,
    /// Owning handle; cancellation of the parent cascades to this handle
    pub parent: Option<HandleId>,
}

impl HandleSpec {
    pub fn new(kind: HandleKind) -> Self {
        Self {
            kind,
            ..Self::default()
        }
    }

    pub fn with_id(mut self, id: impl Into<HandleId>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_parent(mut self, parent: HandleId) -> Self {
        self.parent = Some(parent);
        self
    }

    pub fn with_metadata(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }
}

/// Read-only filter for [`crate::HandleRegistry::list`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandleFilter {
    pub status: Option<HandleStatus>,
    pub kind: Option<HandleKind>,
}

impl HandleFilter {
    pub fn matches(&self, snapshot: &HandleSnapshot) -> bool {
        self.status.map_or(true, |s| s == snapshot.status)
            && self.kind.map_or(true, |k| k == snapshot.kind)
    }
}
