//! Blocking on wait handles.
//!
//! [`Waiter`] suspends the calling task until one or more handles reach a
//! terminal state or a timeout elapses. Resolution is observed through the
//! registry's per-handle `watch` channel; the poll interval only bounds how
//! stale a reading can get if a notification is missed.
//!
//! A waiter never writes a handle's status. When its own timeout fires it
//! reports `timed_out` for whatever is still pending, while the registry keeps
//! the authoritative state and may still resolve the handle later.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{FuturesUnordered, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::instrument;

use convene_state::{
    HandleFailure, HandleId, HandleRegistry, HandleSnapshot, HandleStatus, HandleWatch,
    RegistryResult,
};

use crate::config::WaitConfig;
use crate::error::{ConveneError, Result, ValidationError};
use crate::metrics::METRICS;
use crate::obs;

/// How `wait_for_multiple` decides it is done.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WaitMode {
    /// Every handle terminal, successes and failures alike
    All,
    /// First handle to reach any terminal state
    Any,
    /// First handle to complete successfully; failures do not end the race
    Race,
}

impl std::fmt::Display for WaitMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            WaitMode::All => "all",
            WaitMode::Any => "any",
            WaitMode::Race => "race",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for WaitMode {
    type Err = ValidationError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "all" => Ok(WaitMode::All),
            "any" => Ok(WaitMode::Any),
            "race" => Ok(WaitMode::Race),
            other => Err(ValidationError::UnknownWaitMode(other.to_string())),
        }
    }
}

/// One handle's outcome as seen by a waiter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WaitOutcome {
    pub id: HandleId,
    pub status: HandleStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<HandleFailure>,
    pub waited_ms: u64,
}

impl WaitOutcome {
    fn from_snapshot(snapshot: HandleSnapshot, waited_ms: u64) -> Self {
        WaitOutcome {
            id: snapshot.id,
            status: snapshot.status,
            result: snapshot.result,
            error: snapshot.error,
            waited_ms,
        }
    }

    fn wait_timed_out(id: HandleId, waited_ms: u64) -> Self {
        WaitOutcome {
            id,
            status: HandleStatus::TimedOut,
            result: None,
            error: Some(HandleFailure::WaitTimedOut { waited_ms }),
            waited_ms,
        }
    }

    /// Collapse the outcome into a `Result`, for callers that only care about
    /// the success value.
    pub fn into_result(self) -> Result<serde_json::Value> {
        match self.status {
            HandleStatus::Completed => Ok(self.result.unwrap_or(serde_json::Value::Null)),
            HandleStatus::Cancelled => Err(ConveneError::Cancelled(self.id)),
            HandleStatus::TimedOut | HandleStatus::Pending => Err(ConveneError::Timeout {
                waited_ms: self.waited_ms,
                pending: vec![self.id],
            }),
            HandleStatus::Failed => Err(ConveneError::Dispatch(
                self.error
                    .map(|e| e.to_string())
                    .unwrap_or_else(|| "unknown failure".to_string()),
            )),
        }
    }
}

/// Aggregate status of a multi-handle wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MultiWaitStatus {
    /// The mode's stop condition was met
    Completed,
    /// `race` only: every contender resolved and none succeeded
    Failed,
    /// The overall timeout fired first
    TimedOut,
}

impl std::fmt::Display for MultiWaitStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            MultiWaitStatus::Completed => "completed",
            MultiWaitStatus::Failed => "failed",
            MultiWaitStatus::TimedOut => "timed_out",
        };
        write!(f, "{s}")
    }
}

/// Result of [`Waiter::wait_for_multiple`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MultiWaitOutcome {
    pub mode: WaitMode,
    pub status: MultiWaitStatus,
    /// Handles terminal in the registry at return time
    pub completed_count: usize,
    pub total_count: usize,
    pub waited_ms: u64,
    /// For `any`/`race`: the handle that ended the wait
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trigger: Option<HandleId>,
    /// Point-in-time outcome of every waited handle
    pub results: BTreeMap<HandleId, WaitOutcome>,
}

impl MultiWaitOutcome {
    pub fn trigger_outcome(&self) -> Option<&WaitOutcome> {
        self.trigger.as_ref().and_then(|id| self.results.get(id))
    }
}

/// Suspends callers until handles resolve.
#[derive(Debug, Clone)]
pub struct Waiter {
    registry: Arc<HandleRegistry>,
    config: WaitConfig,
}

impl Waiter {
    pub fn new(registry: Arc<HandleRegistry>, config: WaitConfig) -> Self {
        Self { registry, config }
    }

    pub fn registry(&self) -> &Arc<HandleRegistry> {
        &self.registry
    }

    /// Wait for a single handle.
    ///
    /// Returns immediately if the handle is already terminal. On timeout the
    /// registry is re-read once: an outcome that landed concurrently wins over
    /// the local timeout observation.
    #[instrument(skip(self), fields(handle_id = %id))]
    pub async fn wait_for(
        &self,
        id: &HandleId,
        timeout: Option<Duration>,
        poll_interval: Option<Duration>,
    ) -> Result<WaitOutcome> {
        let started = Instant::now();
        let timeout = timeout.unwrap_or_else(|| self.config.default_timeout());
        let poll = poll_interval.unwrap_or_else(|| self.config.poll_interval());

        let watch = self.registry.subscribe(id)?;
        let waited = tokio::time::timeout(
            timeout,
            until_terminal(&self.registry, id.clone(), watch, poll),
        )
        .await;

        let outcome = match waited {
            Ok(snapshot) => WaitOutcome::from_snapshot(snapshot?, elapsed_ms(started)),
            Err(_) => {
                let snapshot = self.registry.get(id)?;
                let waited_ms = elapsed_ms(started);
                if snapshot.is_terminal() {
                    WaitOutcome::from_snapshot(snapshot, waited_ms)
                } else {
                    METRICS.inc_waits_timed_out();
                    WaitOutcome::wait_timed_out(id.clone(), waited_ms)
                }
            }
        };

        let completed = usize::from(outcome.status.is_terminal());
        obs::emit_wait_finished("single", &outcome.status.to_string(), completed, 1, outcome.waited_ms);
        Ok(outcome)
    }

    /// Wait for several handles under one overall timeout.
    ///
    /// Unknown ids fail the call up front. Duplicate ids are waited once.
    /// Handles that are still pending when the wait returns keep running.
    #[instrument(skip(self, ids), fields(total = ids.len()))]
    pub async fn wait_for_multiple(
        &self,
        ids: &[HandleId],
        mode: WaitMode,
        timeout: Option<Duration>,
        poll_interval: Option<Duration>,
    ) -> Result<MultiWaitOutcome> {
        let started = Instant::now();
        let timeout = timeout.unwrap_or_else(|| self.config.default_timeout());
        let poll = poll_interval.unwrap_or_else(|| self.config.poll_interval());

        let mut seen = HashSet::new();
        let ids: Vec<HandleId> = ids
            .iter()
            .filter(|id| seen.insert((*id).clone()))
            .cloned()
            .collect();
        if ids.is_empty() {
            return Err(ValidationError::EmptyWaitSet.into());
        }

        let mut watches = Vec::with_capacity(ids.len());
        for id in &ids {
            watches.push((id.clone(), self.registry.subscribe(id)?));
        }

        let mut contenders: FuturesUnordered<_> = watches
            .into_iter()
            .map(|(id, watch)| {
                let registry = &self.registry;
                async move {
                    let snapshot = until_terminal(registry, id.clone(), watch, poll).await;
                    (id, snapshot)
                }
            })
            .collect();

        let expiry = async {
            match started.checked_add(timeout) {
                Some(at) => tokio::time::sleep_until(at).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::pin!(expiry);
        let mut resolved: BTreeMap<HandleId, HandleSnapshot> = BTreeMap::new();
        let mut trigger: Option<HandleId> = None;
        loop {
            tokio::select! {
                next = contenders.next() => match next {
                    None => break,
                    Some((id, snapshot)) => {
                        let snapshot = snapshot?;
                        let ends_wait = match mode {
                            WaitMode::All => false,
                            WaitMode::Any => true,
                            WaitMode::Race => snapshot.status.is_success(),
                        };
                        resolved.insert(id.clone(), snapshot);
                        if ends_wait {
                            trigger = Some(id);
                            break;
                        }
                    }
                },
                _ = &mut expiry => break,
            }
        }
        drop(contenders);

        let waited_ms = elapsed_ms(started);
        let mut results = BTreeMap::new();
        let mut completed_count = 0;
        let mut late_trigger: Option<HandleId> = None;
        for id in &ids {
            let snapshot = match resolved.remove(id) {
                Some(snapshot) => snapshot,
                None => self.registry.get(id)?,
            };
            let outcome = if snapshot.is_terminal() {
                completed_count += 1;
                let stops = match mode {
                    WaitMode::All => false,
                    WaitMode::Any => true,
                    WaitMode::Race => snapshot.status.is_success(),
                };
                if stops && late_trigger.is_none() {
                    late_trigger = Some(id.clone());
                }
                WaitOutcome::from_snapshot(snapshot, waited_ms)
            } else if mode == WaitMode::All || trigger.is_none() {
                WaitOutcome::wait_timed_out(id.clone(), waited_ms)
            } else {
                WaitOutcome::from_snapshot(snapshot, waited_ms)
            };
            results.insert(id.clone(), outcome);
        }

        let total_count = ids.len();
        let trigger = trigger.or(late_trigger);
        let status = match mode {
            WaitMode::All if completed_count == total_count => MultiWaitStatus::Completed,
            WaitMode::All => MultiWaitStatus::TimedOut,
            WaitMode::Any | WaitMode::Race if trigger.is_some() => MultiWaitStatus::Completed,
            WaitMode::Race if completed_count == total_count => MultiWaitStatus::Failed,
            WaitMode::Any | WaitMode::Race => MultiWaitStatus::TimedOut,
        };
        if status == MultiWaitStatus::TimedOut {
            METRICS.inc_waits_timed_out();
        }

        obs::emit_wait_finished(
            &mode.to_string(),
            &status.to_string(),
            completed_count,
            total_count,
            waited_ms,
        );
        Ok(MultiWaitOutcome {
            mode,
            status,
            completed_count,
            total_count,
            waited_ms,
            trigger: if mode == WaitMode::All { None } else { trigger },
            results,
        })
    }
}

/// Resolve once the handle is terminal, waking on status notifications, on the
/// handle's own deadline (so the registry can expire it), or on the poll tick.
async fn until_terminal(
    registry: &HandleRegistry,
    id: HandleId,
    watch: HandleWatch,
    poll: Duration,
) -> RegistryResult<HandleSnapshot> {
    let HandleWatch {
        snapshot,
        mut status_rx,
        deadline,
    } = watch;
    if snapshot.is_terminal() {
        return Ok(snapshot);
    }

    loop {
        let expiry = async {
            match deadline {
                Some(at) => tokio::time::sleep_until(at).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::select! {
            _ = status_rx.changed() => {}
            _ = expiry => {}
            _ = tokio::time::sleep(poll) => {}
        }

        let snapshot = registry.get(&id)?;
        if snapshot.is_terminal() {
            return Ok(snapshot);
        }
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}
