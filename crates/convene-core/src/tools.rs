//! JSON tool surface over handles and collaboration sessions.
//!
//! Each operation has a typed method and a serde parameter struct.
//! [`HandleTools::call`] dispatches by operation name on raw JSON, for
//! callers that expose these operations as agent tools.

use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use convene_state::{
    HandleFailure, HandleFilter, HandleId, HandleKind, HandleSnapshot, HandleSpec, HandleStatus,
    Metadata,
};

use crate::collaboration::{
    CollaborationMode, CollaborationRequest, CollaborationScheduler, GenerationDefaults,
    ParticipantSpec, SessionReport, SynthesisStrategy,
};
use crate::error::{Result, ValidationError};
use crate::obs;
use crate::waiter::{MultiWaitOutcome, WaitMode, WaitOutcome};

/// Operation names accepted by [`HandleTools::call`].
pub const OPERATIONS: &[&str] = &[
    "create_handle",
    "wait_for",
    "wait_for_multiple",
    "complete_handle",
    "fail_handle",
    "cancel_handle",
    "list_handles",
    "purge_handles",
    "start_collaboration",
    "run_collaboration",
];

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PurgeHandlesParams {
    /// Defaults to the configured retention window
    #[serde(default)]
    pub retention_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PurgeHandlesResponse {
    pub purged: usize,
    pub remaining: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreateHandleParams {
    #[serde(default)]
    pub id: Option<HandleId>,
    #[serde(default)]
    pub kind: HandleKind,
    #[serde(default)]
    pub metadata: Metadata,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub parent: Option<HandleId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WaitForParams {
    pub id: HandleId,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub poll_interval_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WaitForMultipleParams {
    pub ids: Vec<HandleId>,
    /// `all`, `any` or `race`
    #[serde(default = "default_wait_mode")]
    pub mode: String,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub poll_interval_ms: Option<u64>,
}

fn default_wait_mode() -> String {
    "all".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompleteHandleParams {
    pub id: HandleId,
    #[serde(default)]
    pub result: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailHandleParams {
    pub id: HandleId,
    pub error: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelHandleParams {
    pub id: HandleId,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListHandlesParams {
    #[serde(default)]
    pub status: Option<HandleStatus>,
    #[serde(default)]
    pub kind: Option<HandleKind>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListHandlesResponse {
    pub count: usize,
    pub handles: Vec<HandleSnapshot>,
}

/// Loosely typed collaboration request as it arrives over JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollaborationParams {
    pub task: String,
    pub participants: Vec<ParticipantSpec>,
    pub max_rounds: i64,
    #[serde(default = "default_collaboration_mode")]
    pub mode: String,
    #[serde(default)]
    pub defaults: GenerationDefaults,
    #[serde(default)]
    pub session_timeout_ms: Option<u64>,
    #[serde(default)]
    pub synthesis: Option<SynthesisStrategy>,
}

fn default_collaboration_mode() -> String {
    "rounds".to_string()
}

impl TryFrom<CollaborationParams> for CollaborationRequest {
    type Error = ValidationError;

    fn try_from(params: CollaborationParams) -> std::result::Result<Self, Self::Error> {
        if params.max_rounds <= 0 {
            return Err(ValidationError::NonPositiveRounds(params.max_rounds));
        }
        let max_rounds =
            u32::try_from(params.max_rounds).map_err(|_| ValidationError::InvalidArguments {
                operation: "collaboration".to_string(),
                reason: format!("max_rounds {} is too large", params.max_rounds),
            })?;
        let mode: CollaborationMode = params.mode.parse()?;
        Ok(CollaborationRequest {
            task: params.task,
            participants: params.participants,
            max_rounds,
            mode,
            defaults: params.defaults,
            session_timeout_ms: params.session_timeout_ms,
            synthesis: params.synthesis,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartCollaborationResponse {
    pub session_id: HandleId,
}

/// Handle and collaboration operations for tool callers.
#[derive(Debug, Clone)]
pub struct HandleTools {
    scheduler: CollaborationScheduler,
}

impl HandleTools {
    pub fn new(scheduler: CollaborationScheduler) -> Self {
        Self { scheduler }
    }

    pub fn scheduler(&self) -> &CollaborationScheduler {
        &self.scheduler
    }

    pub fn create_handle(&self, params: CreateHandleParams) -> Result<HandleSnapshot> {
        let mut spec = HandleSpec::new(params.kind);
        spec.id = params.id;
        spec.metadata = params.metadata;
        spec.timeout = params.timeout_ms.map(Duration::from_millis);
        spec.parent = params.parent;
        let snapshot = self.scheduler.registry().create(spec)?;
        obs::emit_handle_created(&snapshot.id, snapshot.kind);
        Ok(snapshot)
    }

    pub async fn wait_for(&self, params: WaitForParams) -> Result<WaitOutcome> {
        self.scheduler
            .waiter()
            .wait_for(
                &params.id,
                params.timeout_ms.map(Duration::from_millis),
                params.poll_interval_ms.map(Duration::from_millis),
            )
            .await
    }

    pub async fn wait_for_multiple(&self, params: WaitForMultipleParams) -> Result<MultiWaitOutcome> {
        let mode: WaitMode = params.mode.parse()?;
        self.scheduler
            .waiter()
            .wait_for_multiple(
                &params.ids,
                mode,
                params.timeout_ms.map(Duration::from_millis),
                params.poll_interval_ms.map(Duration::from_millis),
            )
            .await
    }

    pub fn complete_handle(&self, params: CompleteHandleParams) -> Result<HandleSnapshot> {
        let snapshot = self.scheduler.registry().complete(&params.id, params.result)?;
        obs::emit_handle_resolved(&snapshot.id, snapshot.status);
        Ok(snapshot)
    }

    pub fn fail_handle(&self, params: FailHandleParams) -> Result<HandleSnapshot> {
        let snapshot = self
            .scheduler
            .registry()
            .fail(&params.id, HandleFailure::work(params.error))?;
        obs::emit_handle_resolved(&snapshot.id, snapshot.status);
        Ok(snapshot)
    }

    pub fn cancel_handle(&self, params: CancelHandleParams) -> Result<HandleSnapshot> {
        let snapshot = self.scheduler.registry().cancel(&params.id)?;
        obs::emit_handle_resolved(&snapshot.id, snapshot.status);
        Ok(snapshot)
    }

    pub fn list_handles(&self, params: ListHandlesParams) -> ListHandlesResponse {
        let handles = self.scheduler.registry().list(HandleFilter {
            status: params.status,
            kind: params.kind,
        });
        ListHandlesResponse {
            count: handles.len(),
            handles,
        }
    }

    /// Drop resolved handles and finished sessions past the retention window.
    pub fn purge_handles(&self, params: PurgeHandlesParams) -> PurgeHandlesResponse {
        let retention = params
            .retention_ms
            .map(Duration::from_millis)
            .unwrap_or_else(|| self.scheduler.config().retention());
        let purged = self.scheduler.purge_older_than(retention);
        PurgeHandlesResponse {
            purged,
            remaining: self.scheduler.registry().len(),
        }
    }

    pub fn start_collaboration(&self, params: CollaborationParams) -> Result<StartCollaborationResponse> {
        let request = CollaborationRequest::try_from(params)?;
        let session_id = self.scheduler.start(request)?;
        Ok(StartCollaborationResponse { session_id })
    }

    pub async fn run_collaboration(&self, params: CollaborationParams) -> Result<SessionReport> {
        let request = CollaborationRequest::try_from(params)?;
        self.scheduler.run(request).await
    }

    /// Run operation `name` with JSON arguments and return its JSON result.
    pub async fn call(&self, name: &str, args: Value) -> Result<Value> {
        let value = match name {
            "create_handle" => to_value(self.create_handle(parse(name, args)?)?)?,
            "wait_for" => to_value(self.wait_for(parse(name, args)?).await?)?,
            "wait_for_multiple" => to_value(self.wait_for_multiple(parse(name, args)?).await?)?,
            "complete_handle" => to_value(self.complete_handle(parse(name, args)?)?)?,
            "fail_handle" => to_value(self.fail_handle(parse(name, args)?)?)?,
            "cancel_handle" => to_value(self.cancel_handle(parse(name, args)?)?)?,
            "list_handles" => to_value(self.list_handles(parse(name, args)?))?,
            "purge_handles" => to_value(self.purge_handles(parse(name, args)?))?,
            "start_collaboration" => to_value(self.start_collaboration(parse(name, args)?)?)?,
            "run_collaboration" => to_value(self.run_collaboration(parse(name, args)?).await?)?,
            other => return Err(ValidationError::UnknownOperation(other.to_string()).into()),
        };
        Ok(value)
    }
}

fn parse<P: DeserializeOwned>(operation: &str, args: Value) -> Result<P> {
    // Operations whose parameters are all optional accept a missing body.
    let args = if args.is_null() {
        Value::Object(serde_json::Map::new())
    } else {
        args
    };
    serde_json::from_value(args).map_err(|e| {
        ValidationError::InvalidArguments {
            operation: operation.to_string(),
            reason: e.to_string(),
        }
        .into()
    })
}

fn to_value<T: Serialize>(value: T) -> Result<Value> {
    Ok(serde_json::to_value(value)?)
}
