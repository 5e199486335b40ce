//! Round-based multi-participant collaboration on top of wait handles.
//!
//! A session is one `session` handle whose unit of work is the whole
//! orchestration loop. Each round gets a `round` handle (child of the
//! session) and each turn a `participant-turn` handle (child of its round),
//! so cancelling or expiring the session reaches every in-flight turn.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Instrument};

use convene_state::{
    HandleFailure, HandleId, HandleKind, HandleRegistry, HandleSnapshot, HandleSpec, HandleStatus,
    RegistryError,
};

use super::participant::{resolve_generation, resolve_session_generation, ParticipantSpec};
use super::prompt;
use super::session::{
    CollaborationMode, CollaborationOutcome, CollaborationRequest, CollaborationSession,
    Contribution, SessionReport, SynthesisStrategy,
};
use crate::config::ConveneConfig;
use crate::dispatcher::TaskDispatcher;
use crate::error::Result;
use crate::generator::{Generation, GenerationConfig, Generator};
use crate::metrics::METRICS;
use crate::obs;
use crate::waiter::{WaitMode, WaitOutcome, Waiter};

type SessionTable = Arc<Mutex<HashMap<HandleId, CollaborationSession>>>;

/// Runs collaboration sessions.
///
/// Cloning is cheap; clones share the registry, dispatcher and session table.
#[derive(Clone)]
pub struct CollaborationScheduler {
    registry: Arc<HandleRegistry>,
    dispatcher: TaskDispatcher,
    waiter: Waiter,
    generator: Arc<dyn Generator>,
    config: Arc<ConveneConfig>,
    sessions: SessionTable,
}

impl std::fmt::Debug for CollaborationScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CollaborationScheduler")
            .field("sessions", &self.sessions.lock().len())
            .field("in_flight", &self.dispatcher.in_flight())
            .finish_non_exhaustive()
    }
}

/// Fixed inputs of one round.
struct RoundPlan<'a> {
    session_id: &'a HandleId,
    round_handle: &'a HandleId,
    request: &'a CollaborationRequest,
    round: u32,
    /// Attempts recorded before this round started
    turn_base: u32,
}

/// A dispatched turn awaiting its outcome.
struct PendingTurn {
    handle_id: HandleId,
    participant_id: String,
    role: String,
    round: u32,
    turn: u32,
    config: GenerationConfig,
}

impl PendingTurn {
    fn into_contribution(self, outcome: &WaitOutcome) -> Contribution {
        let (status, text, usage, error) = match outcome.status {
            HandleStatus::Completed => match outcome
                .result
                .clone()
                .map(serde_json::from_value::<Generation>)
            {
                Some(Ok(generation)) => (
                    HandleStatus::Completed,
                    Some(generation.text),
                    generation.usage,
                    None,
                ),
                Some(Err(e)) => (
                    HandleStatus::Failed,
                    None,
                    None,
                    Some(HandleFailure::work(format!("unreadable generation: {e}"))),
                ),
                None => (
                    HandleStatus::Failed,
                    None,
                    None,
                    Some(HandleFailure::work("generation missing from completed turn")),
                ),
            },
            other => (other, None, None, outcome.error.clone()),
        };

        Contribution {
            participant_id: self.participant_id,
            role: self.role,
            round: self.round,
            turn: self.turn,
            handle_id: self.handle_id,
            status,
            text,
            error,
            usage,
            config: self.config,
        }
    }
}

#[derive(Debug, Default)]
struct RoundTally {
    total: usize,
    failures: Vec<String>,
    /// Failure of a fatal participant; aborts the session
    fatal: Option<HandleFailure>,
}

/// Records the end of a session exactly once, including when the session
/// future is dropped after a cancellation or an expired deadline.
struct SessionFinish {
    scheduler: CollaborationScheduler,
    session_id: HandleId,
    done: bool,
}

impl SessionFinish {
    fn record(&mut self, status: HandleStatus, synthesis: Option<String>) {
        if std::mem::replace(&mut self.done, true) {
            return;
        }
        let (attempts, failed) = self
            .scheduler
            .update(&self.session_id, |s| {
                s.status = status;
                s.finished_at = Some(Utc::now());
                s.final_synthesis = synthesis;
                (s.turn_attempts, s.failed_turns)
            })
            .unwrap_or_default();

        METRICS.inc_sessions_finished();
        obs::emit_session_finished(&self.session_id, status, attempts, failed);
    }
}

impl Drop for SessionFinish {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        let status = self
            .scheduler
            .registry
            .get(&self.session_id)
            .map(|s| s.status)
            .unwrap_or(HandleStatus::Cancelled);
        self.record(status, None);
    }
}

fn internal(err: impl std::fmt::Display) -> HandleFailure {
    HandleFailure::work(err.to_string())
}

impl CollaborationScheduler {
    pub fn new(
        registry: Arc<HandleRegistry>,
        generator: Arc<dyn Generator>,
        config: ConveneConfig,
    ) -> Self {
        Self {
            dispatcher: TaskDispatcher::new(Arc::clone(&registry)),
            waiter: Waiter::new(Arc::clone(&registry), config.wait),
            registry,
            generator,
            config: Arc::new(config),
            sessions: SessionTable::default(),
        }
    }

    pub fn registry(&self) -> &Arc<HandleRegistry> {
        &self.registry
    }

    pub fn waiter(&self) -> &Waiter {
        &self.waiter
    }

    pub fn dispatcher(&self) -> &TaskDispatcher {
        &self.dispatcher
    }

    pub fn config(&self) -> &ConveneConfig {
        &self.config
    }

    /// Validate `request`, create its session handle and start it in the
    /// background. Returns the session handle id at once.
    pub fn start(&self, request: CollaborationRequest) -> Result<HandleId> {
        request.validate()?;

        let mut spec = HandleSpec::new(HandleKind::Session)
            .with_metadata("mode", request.mode.to_string())
            .with_metadata("participants", request.participants.len())
            .with_metadata("max_rounds", request.max_rounds);
        if let Some(ms) = request.session_timeout_ms {
            spec = spec.with_timeout(Duration::from_millis(ms));
        }
        let snapshot = self.registry.create(spec)?;
        let session_id = snapshot.id.clone();
        obs::emit_handle_created(&session_id, HandleKind::Session);

        self.sessions.lock().insert(
            session_id.clone(),
            CollaborationSession::new(session_id.clone(), &request, snapshot.created_at),
        );
        obs::emit_session_started(
            &session_id,
            &request.mode.to_string(),
            request.participants.len(),
            request.max_rounds,
        );

        let this = self.clone();
        let span = obs::session_span(&session_id);
        let id = session_id.clone();
        self.dispatcher.dispatch_with_token(&session_id, move |token| {
            this.run_session(id, request, token).instrument(span)
        })?;
        Ok(session_id)
    }

    /// Start a session and wait for it to finish.
    ///
    /// The wait is bounded by the session timeout if one is set, else by the
    /// configured default wait timeout. A session still running when the wait
    /// gives up is cancelled.
    pub async fn run(&self, request: CollaborationRequest) -> Result<SessionReport> {
        let wait_timeout = request.session_timeout_ms.map(Duration::from_millis);
        let session_id = self.start(request)?;
        let outcome = self.waiter.wait_for(&session_id, wait_timeout, None).await?;

        if !self.registry.get(&session_id)?.is_terminal() {
            match self.registry.cancel(&session_id) {
                Ok(_) => warn!(session_id = %session_id, "session abandoned after wait timeout"),
                Err(RegistryError::AlreadyResolved { .. }) => {}
                Err(e) => return Err(e.into()),
            }
        }

        let session = self.session(&session_id)?;
        Ok(SessionReport {
            session_id,
            status: outcome.status,
            round_results: session.round_results,
            accumulated_context: session.accumulated_context,
            final_synthesis: session.final_synthesis,
            error: outcome.error,
            turn_attempts: session.turn_attempts,
            failed_turns: session.failed_turns,
            waited_ms: outcome.waited_ms,
        })
    }

    /// Snapshot of a session, with its status read from the registry.
    pub fn session(&self, session_id: &HandleId) -> Result<CollaborationSession> {
        let handle = self.registry.get(session_id)?;
        let mut session = self
            .sessions
            .lock()
            .get(session_id)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound {
                id: session_id.clone(),
            })?;
        session.status = handle.status;
        if session.finished_at.is_none() {
            session.finished_at = handle.completed_at;
        }
        Ok(session)
    }

    /// Ids of every session still known to the scheduler.
    pub fn session_ids(&self) -> Vec<HandleId> {
        let mut ids: Vec<HandleId> = self.sessions.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Cancel a session; the cancellation cascades to its rounds and turns.
    pub fn cancel(&self, session_id: &HandleId) -> Result<HandleSnapshot> {
        let snapshot = self.registry.cancel(session_id)?;
        info!(session_id = %session_id, "session cancelled");
        Ok(snapshot)
    }

    /// Drop resolved handles older than the configured retention window,
    /// along with the session records whose handles are gone.
    ///
    /// Nothing purges on a timer; long-lived hosts call this (or the
    /// `purge_handles` tool operation) periodically.
    pub fn purge(&self) -> usize {
        self.purge_older_than(self.config.retention())
    }

    pub fn purge_older_than(&self, retention: Duration) -> usize {
        let purged = self.registry.purge_resolved(retention);
        let registry = &self.registry;
        self.sessions.lock().retain(|id, _| registry.get(id).is_ok());
        purged
    }

    fn update<R>(
        &self,
        session_id: &HandleId,
        f: impl FnOnce(&mut CollaborationSession) -> R,
    ) -> Option<R> {
        self.sessions.lock().get_mut(session_id).map(f)
    }

    async fn run_session(
        self,
        session_id: HandleId,
        request: CollaborationRequest,
        token: CancellationToken,
    ) -> std::result::Result<CollaborationOutcome, HandleFailure> {
        let mut finish = SessionFinish {
            scheduler: self.clone(),
            session_id: session_id.clone(),
            done: false,
        };
        let result = self.drive(&session_id, &request, &token).await;

        let status = if result.is_ok() {
            HandleStatus::Completed
        } else {
            HandleStatus::Failed
        };
        let synthesis = result.as_ref().ok().map(|o| o.final_synthesis.clone());
        finish.record(status, synthesis);
        result
    }

    async fn drive(
        &self,
        session_id: &HandleId,
        request: &CollaborationRequest,
        token: &CancellationToken,
    ) -> std::result::Result<CollaborationOutcome, HandleFailure> {
        let mut rounds_run = 0;
        for round in 1..=request.effective_rounds() {
            if token.is_cancelled() {
                return Err(HandleFailure::Cancelled);
            }

            let speakers = if request.mode == CollaborationMode::IntelligentSubset {
                self.select_speakers(session_id, request, round).await
            } else {
                request.participants.clone()
            };
            if speakers.is_empty() {
                info!(session_id = %session_id, round, "no eligible participants, ending session");
                break;
            }

            let round_handle = self.open_round(session_id, round, &speakers)?;
            rounds_run += 1;
            let plan = RoundPlan {
                session_id,
                round_handle: &round_handle,
                request,
                round,
                turn_base: self.update(session_id, |s| s.turn_attempts).unwrap_or(0) as u32,
            };

            let tally = match request.mode {
                CollaborationMode::Parallel => self.run_parallel_round(&plan, &speakers).await?,
                _ => self.run_sequential_round(&plan, &speakers).await?,
            };
            self.close_round(&round_handle, round, &tally);
            if let Some(failure) = tally.fatal {
                warn!(session_id = %session_id, round, error = %failure, "fatal participant failed, aborting session");
                return Err(failure);
            }
        }

        let (context, round_results, attempts, failed) = self
            .update(session_id, |s| {
                (
                    s.accumulated_context.clone(),
                    s.round_results.clone(),
                    s.turn_attempts,
                    s.failed_turns,
                )
            })
            .unwrap_or_default();

        if context.is_empty() {
            let mut messages: Vec<String> = round_results
                .iter()
                .flatten()
                .map(|c| format!("{} (round {}): {}", c.participant_id, c.round, c.error_message()))
                .collect();
            if messages.is_empty() {
                messages.push("no participant was selected".to_string());
            }
            return Err(HandleFailure::Aggregate {
                failed,
                total: attempts,
                messages,
            });
        }

        let final_synthesis = self.synthesize(session_id, request, &context).await;
        Ok(CollaborationOutcome {
            session_id: session_id.clone(),
            rounds_run,
            turn_attempts: attempts,
            failed_turns: failed,
            round_results,
            final_synthesis,
        })
    }

    fn open_round(
        &self,
        session_id: &HandleId,
        round: u32,
        speakers: &[ParticipantSpec],
    ) -> std::result::Result<HandleId, HandleFailure> {
        let ids: Vec<&str> = speakers.iter().map(|p| p.id.as_str()).collect();
        let spec = HandleSpec::new(HandleKind::Round)
            .with_parent(session_id.clone())
            .with_metadata("round", round)
            .with_metadata("participants", ids);
        let round_handle = self.registry.create(spec).map_err(internal)?.id;
        obs::emit_handle_created(&round_handle, HandleKind::Round);
        self.update(session_id, |s| s.begin_round(round_handle.clone()));
        debug!(session_id = %session_id, round, speakers = speakers.len(), "round started");
        Ok(round_handle)
    }

    fn close_round(&self, round_handle: &HandleId, round: u32, tally: &RoundTally) {
        let failed = tally.failures.len();
        let succeeded = tally.total - failed;
        let resolved = match &tally.fatal {
            Some(failure) => self.registry.fail(round_handle, failure.clone()),
            None if succeeded > 0 => self.registry.complete(
                round_handle,
                json!({ "round": round, "succeeded": succeeded, "failed": failed }),
            ),
            None => self.registry.fail(
                round_handle,
                HandleFailure::Aggregate {
                    failed,
                    total: tally.total,
                    messages: tally.failures.clone(),
                },
            ),
        };
        match resolved {
            Ok(snapshot) => obs::emit_handle_resolved(round_handle, snapshot.status),
            Err(e) => debug!(handle_id = %round_handle, error = %e, "round handle not updated"),
        }
    }

    async fn run_sequential_round(
        &self,
        plan: &RoundPlan<'_>,
        speakers: &[ParticipantSpec],
    ) -> std::result::Result<RoundTally, HandleFailure> {
        let mut tally = RoundTally::default();
        for (offset, participant) in speakers.iter().enumerate() {
            // Re-read so this turn sees every earlier turn of the round.
            let context = self
                .update(plan.session_id, |s| s.accumulated_context.clone())
                .unwrap_or_default();
            let turn = plan.turn_base + offset as u32 + 1;
            let pending = self.dispatch_turn(plan, participant, turn, &context)?;
            let outcome = self.await_handle(&pending.handle_id).await?;
            let waited_ms = outcome.waited_ms;
            self.settle(
                plan.session_id,
                participant,
                pending.into_contribution(&outcome),
                waited_ms,
                &mut tally,
            );
            if tally.fatal.is_some() {
                break;
            }
        }
        Ok(tally)
    }

    async fn run_parallel_round(
        &self,
        plan: &RoundPlan<'_>,
        speakers: &[ParticipantSpec],
    ) -> std::result::Result<RoundTally, HandleFailure> {
        // Every turn sees the context as it stood when the round began.
        let context = self
            .update(plan.session_id, |s| s.accumulated_context.clone())
            .unwrap_or_default();

        let mut pending = Vec::with_capacity(speakers.len());
        for (offset, participant) in speakers.iter().enumerate() {
            let turn = plan.turn_base + offset as u32 + 1;
            pending.push(self.dispatch_turn(plan, participant, turn, &context)?);
        }
        let ids: Vec<HandleId> = pending.iter().map(|p| p.handle_id.clone()).collect();
        let waited = self
            .waiter
            .wait_for_multiple(&ids, WaitMode::All, Some(self.config.turn_timeout()), None)
            .await
            .map_err(internal)?;

        let mut tally = RoundTally::default();
        for (turn, participant) in pending.into_iter().zip(speakers) {
            let outcome = waited
                .results
                .get(&turn.handle_id)
                .cloned()
                .ok_or_else(|| internal(format!("no outcome for turn {}", turn.handle_id)))?;
            self.abandon_if_wait_timed_out(&outcome);
            let waited_ms = outcome.waited_ms;
            self.settle(
                plan.session_id,
                participant,
                turn.into_contribution(&outcome),
                waited_ms,
                &mut tally,
            );
        }
        Ok(tally)
    }

    fn dispatch_turn(
        &self,
        plan: &RoundPlan<'_>,
        participant: &ParticipantSpec,
        turn: u32,
        context: &[Contribution],
    ) -> std::result::Result<PendingTurn, HandleFailure> {
        let config = resolve_generation(participant, &plan.request.defaults, &self.config);
        let prompt = prompt::turn_prompt(
            &plan.request.task,
            participant,
            plan.round,
            plan.request.effective_rounds(),
            context,
        );
        let spec = HandleSpec::new(HandleKind::ParticipantTurn)
            .with_parent(plan.round_handle.clone())
            .with_timeout(self.config.turn_timeout())
            .with_metadata("participant", participant.id.as_str())
            .with_metadata("round", plan.round)
            .with_metadata("turn", turn)
            .with_metadata("model", config.model.as_str());
        let handle_id = self.registry.create(spec).map_err(internal)?.id;
        obs::emit_handle_created(&handle_id, HandleKind::ParticipantTurn);

        METRICS.inc_turns_dispatched();
        let generator = Arc::clone(&self.generator);
        let call_config = config.clone();
        let dispatched = self.dispatcher.dispatch(&handle_id, async move {
            generator.generate(&prompt, &call_config).await
        });
        match dispatched {
            // A turn born under a cancelled round is already terminal.
            Ok(()) | Err(RegistryError::AlreadyResolved { .. }) => {}
            Err(e) => return Err(internal(e)),
        }

        Ok(PendingTurn {
            handle_id,
            participant_id: participant.id.clone(),
            role: participant.persona().to_string(),
            round: plan.round,
            turn,
            config,
        })
    }

    /// Wait for a turn or step handle, bounded by the turn timeout.
    async fn await_handle(
        &self,
        id: &HandleId,
    ) -> std::result::Result<WaitOutcome, HandleFailure> {
        let outcome = self
            .waiter
            .wait_for(id, Some(self.config.turn_timeout()), None)
            .await
            .map_err(internal)?;
        self.abandon_if_wait_timed_out(&outcome);
        Ok(outcome)
    }

    fn abandon_if_wait_timed_out(&self, outcome: &WaitOutcome) {
        if !matches!(outcome.error, Some(HandleFailure::WaitTimedOut { .. })) {
            return;
        }
        match self.registry.cancel(&outcome.id) {
            Ok(_) => debug!(handle_id = %outcome.id, "abandoned turn cancelled"),
            Err(RegistryError::AlreadyResolved { .. }) => {}
            Err(e) => warn!(handle_id = %outcome.id, error = %e, "could not cancel abandoned turn"),
        }
    }

    fn settle(
        &self,
        session_id: &HandleId,
        participant: &ParticipantSpec,
        contribution: Contribution,
        waited_ms: u64,
        tally: &mut RoundTally,
    ) {
        tally.total += 1;
        obs::emit_turn_finished(
            &contribution.participant_id,
            contribution.round,
            contribution.status,
            waited_ms,
        );
        if !contribution.succeeded() {
            METRICS.inc_turns_failed();
            let failure = match (&contribution.error, contribution.status) {
                (Some(error), _) => error.clone(),
                (None, HandleStatus::Cancelled) => HandleFailure::Cancelled,
                (None, status) => HandleFailure::work(status.to_string()),
            };
            tally.failures.push(format!(
                "{} (round {}): {}",
                contribution.participant_id, contribution.round, failure
            ));
            if participant.fatal && tally.fatal.is_none() {
                tally.fatal = Some(failure);
            }
        }
        self.update(session_id, |s| s.record(contribution));
    }

    /// Ask the generator which participants should speak in `round`.
    ///
    /// Runs before every round, the first included, where the prompt carries
    /// only the task. A failed selection keeps every participant; a reply
    /// naming nobody yields an empty list, which ends the session.
    async fn select_speakers(
        &self,
        session_id: &HandleId,
        request: &CollaborationRequest,
        round: u32,
    ) -> Vec<ParticipantSpec> {
        let context = self
            .update(session_id, |s| s.accumulated_context.clone())
            .unwrap_or_default();
        let prompt = prompt::selection_prompt(&request.task, round, &context, &request.participants);

        match self.run_step(session_id, "selection", prompt, request).await {
            Ok(reply) => {
                let picked = prompt::parse_selection(&reply, &request.participants);
                let ids: Vec<&str> = picked.iter().map(|p| p.id.as_str()).collect();
                info!(session_id = %session_id, round, selected = ?ids, "participants selected");
                picked
            }
            Err(failure) => {
                warn!(session_id = %session_id, round, error = %failure, "selection failed, keeping every participant");
                request.participants.clone()
            }
        }
    }

    async fn synthesize(
        &self,
        session_id: &HandleId,
        request: &CollaborationRequest,
        context: &[Contribution],
    ) -> String {
        match request.synthesis.unwrap_or(self.config.synthesis) {
            SynthesisStrategy::Concatenate => prompt::concatenate(context),
            SynthesisStrategy::Generated => {
                let prompt = prompt::synthesis_prompt(&request.task, context);
                match self.run_step(session_id, "synthesis", prompt, request).await {
                    Ok(text) if !text.trim().is_empty() => text,
                    Ok(_) => prompt::concatenate(context),
                    Err(failure) => {
                        warn!(session_id = %session_id, error = %failure, "generated synthesis failed, concatenating");
                        prompt::concatenate(context)
                    }
                }
            }
        }
    }

    /// Run one generator call as a `workflow-step` handle under the session.
    async fn run_step(
        &self,
        session_id: &HandleId,
        step: &str,
        prompt: String,
        request: &CollaborationRequest,
    ) -> std::result::Result<String, HandleFailure> {
        let spec = HandleSpec::new(HandleKind::WorkflowStep)
            .with_parent(session_id.clone())
            .with_timeout(self.config.turn_timeout())
            .with_metadata("step", step);
        let id = self.registry.create(spec).map_err(internal)?.id;
        obs::emit_handle_created(&id, HandleKind::WorkflowStep);

        let generator = Arc::clone(&self.generator);
        let config = resolve_session_generation(&request.defaults, &self.config);
        match self
            .dispatcher
            .dispatch(&id, async move { generator.generate(&prompt, &config).await })
        {
            Ok(()) | Err(RegistryError::AlreadyResolved { .. }) => {}
            Err(e) => return Err(internal(e)),
        }

        let value = self.await_handle(&id).await?.into_result().map_err(internal)?;
        let generation: Generation = serde_json::from_value(value).map_err(internal)?;
        Ok(generation.text)
    }
}
