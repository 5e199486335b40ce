//! End-to-end collaboration sessions against scripted generators.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use convene_core::{
    CollaborationMode, CollaborationOutcome, CollaborationRequest, CollaborationScheduler,
    ConveneConfig, ConveneError, EchoGenerator, Generation, GenerationConfig, GenerationDefaults,
    GenerationError, Generator, HandleFailure, HandleFilter, HandleKind, HandleRegistry,
    HandleStatus, ParticipantSpec, SynthesisStrategy, ValidationError, WaitConfig,
};
use convene_core::metrics::METRICS;

fn config() -> ConveneConfig {
    ConveneConfig::default()
        .with_default_model("test-model")
        .with_default_temperature(0.3)
        .with_turn_timeout(Duration::from_secs(30))
        .with_wait(WaitConfig {
            default_timeout_ms: 60_000,
            poll_interval_ms: 100,
        })
        .with_synthesis(SynthesisStrategy::Concatenate)
}

fn field<'a>(prompt: &'a str, key: &str) -> Option<&'a str> {
    prompt
        .lines()
        .find_map(|l| l.strip_prefix(key))
        .map(str::trim)
}

/// Generator with per-participant failures and delays, canned selection and
/// synthesis replies, and a log of every call.
///
/// Selection replies are used in order, one per round; the last one repeats.
#[derive(Default)]
struct Scripted {
    failing: HashSet<String>,
    slow: HashMap<String, Duration>,
    selections: Vec<Result<String, String>>,
    synthesis: Option<Result<String, String>>,
    calls: Mutex<Vec<(String, GenerationConfig)>>,
}

impl Scripted {
    fn failing(mut self, participant: &str) -> Self {
        self.failing.insert(participant.to_string());
        self
    }

    fn slow(mut self, participant: &str, delay: Duration) -> Self {
        self.slow.insert(participant.to_string(), delay);
        self
    }

    fn selecting(mut self, reply: Result<&str, &str>) -> Self {
        self.selections
            .push(reply.map(String::from).map_err(String::from));
        self
    }

    fn selection_prompts(&self) -> Vec<String> {
        self.calls
            .lock()
            .iter()
            .filter(|(p, _)| p.starts_with("Role: moderator"))
            .map(|(p, _)| p.clone())
            .collect()
    }

    fn synthesizing(mut self, reply: Result<&str, &str>) -> Self {
        self.synthesis = Some(reply.map(String::from).map_err(String::from));
        self
    }

    fn turn_prompts(&self) -> Vec<(String, GenerationConfig)> {
        self.calls
            .lock()
            .iter()
            .filter(|(p, _)| field(p, "Participant:").is_some())
            .cloned()
            .collect()
    }

    fn prompt_of(&self, participant: &str, round: u32, rounds: u32) -> String {
        let round_line = format!("{round} of {rounds}");
        self.turn_prompts()
            .into_iter()
            .find(|(p, _)| {
                field(p, "Participant:") == Some(participant)
                    && field(p, "Round:") == Some(round_line.as_str())
            })
            .map(|(p, _)| p)
            .unwrap_or_else(|| panic!("no prompt for {participant} in round {round}"))
    }
}

fn canned(reply: &Result<String, String>) -> Result<Generation, GenerationError> {
    match reply {
        Ok(text) => Ok(Generation::text(text.clone())),
        Err(e) => Err(GenerationError::Provider(e.clone())),
    }
}

#[async_trait]
impl Generator for Scripted {
    async fn generate(
        &self,
        prompt: &str,
        config: &GenerationConfig,
    ) -> Result<Generation, GenerationError> {
        self.calls.lock().push((prompt.to_string(), config.clone()));

        let role = field(prompt, "Role:").unwrap_or_default();
        if role == "moderator" && !self.selections.is_empty() {
            let asked = self.selection_prompts().len();
            let index = (asked - 1).min(self.selections.len() - 1);
            return canned(&self.selections[index]);
        }
        if role == "synthesizer" {
            if let Some(reply) = &self.synthesis {
                return canned(reply);
            }
        }

        let participant = field(prompt, "Participant:").unwrap_or("anonymous").to_string();
        let round = field(prompt, "Round:").unwrap_or("?").to_string();
        if let Some(delay) = self.slow.get(&participant) {
            tokio::time::sleep(*delay).await;
        }
        if self.failing.contains(&participant) {
            return Err(GenerationError::Provider(format!("{participant} unavailable")));
        }
        Ok(Generation::text(format!("{participant} says: round {round}")))
    }
}

fn scheduler_with(generator: Arc<dyn Generator>, config: ConveneConfig) -> CollaborationScheduler {
    CollaborationScheduler::new(Arc::new(HandleRegistry::new()), generator, config)
}

fn participants(ids: &[&str]) -> Vec<ParticipantSpec> {
    ids.iter().map(|id| ParticipantSpec::new(id)).collect()
}

#[tokio::test(start_paused = true)]
async fn test_two_participant_rounds_session_with_echo() {
    let scheduler = scheduler_with(Arc::new(EchoGenerator::default()), config());
    let request = CollaborationRequest::new(
        "design an API",
        participants(&["architect", "reviewer"]),
    )
    .with_max_rounds(2)
    .with_mode(CollaborationMode::Rounds);

    let report = scheduler.run(request).await.unwrap();

    assert_eq!(report.status, HandleStatus::Completed);
    assert_eq!(report.round_results.len(), 2);
    assert!(report.round_results.iter().all(|round| round.len() == 2));
    let synthesis = report.final_synthesis.unwrap();
    assert!(!synthesis.is_empty());
    assert!(synthesis.contains("architect"));
    assert!(synthesis.contains("reviewer"));
    assert!(report.round_results[0][0]
        .text
        .as_deref()
        .unwrap()
        .starts_with("architect says:"));
}

#[tokio::test(start_paused = true)]
async fn test_started_session_resolves_its_handle_with_outcome() {
    let scheduler = scheduler_with(Arc::new(EchoGenerator::default()), config());
    let session_id = scheduler
        .start(
            CollaborationRequest::new("design an API", participants(&["architect", "reviewer"]))
                .with_max_rounds(2),
        )
        .unwrap();

    let waited = scheduler
        .waiter()
        .wait_for(&session_id, None, None)
        .await
        .unwrap();
    assert_eq!(waited.status, HandleStatus::Completed);

    let outcome: CollaborationOutcome = serde_json::from_value(waited.result.unwrap()).unwrap();
    assert_eq!(outcome.session_id, session_id);
    assert_eq!(outcome.rounds_run, 2);
    assert_eq!(outcome.turn_attempts, 4);

    let rounds = scheduler.registry().list(HandleFilter {
        status: None,
        kind: Some(HandleKind::Round),
    });
    assert_eq!(rounds.len(), 2);
    assert!(rounds
        .iter()
        .all(|r| r.parent.as_ref() == Some(&session_id) && r.status == HandleStatus::Completed));

    let turns = scheduler.registry().list(HandleFilter {
        status: Some(HandleStatus::Completed),
        kind: Some(HandleKind::ParticipantTurn),
    });
    assert_eq!(turns.len(), 4);
}

#[tokio::test(start_paused = true)]
async fn test_rounds_mode_context_grows_and_is_visible_in_order() {
    let generator = Arc::new(Scripted::default());
    let scheduler = scheduler_with(generator.clone(), config());
    let request = CollaborationRequest::new("plan a launch", participants(&["p1", "p2", "p3"]))
        .with_max_rounds(2);

    let report = scheduler.run(request).await.unwrap();

    assert_eq!(report.turn_attempts, 6);
    assert_eq!(report.round_results.iter().map(Vec::len).sum::<usize>(), 6);
    assert_eq!(report.accumulated_context.len(), 6);
    let after_round_one = report
        .accumulated_context
        .iter()
        .filter(|c| c.round == 1)
        .count();
    assert_eq!(after_round_one, 3);
    let turns: Vec<u32> = report.accumulated_context.iter().map(|c| c.turn).collect();
    assert_eq!(turns, vec![1, 2, 3, 4, 5, 6]);

    let p3_round_one = generator.prompt_of("p3", 1, 2);
    assert!(p3_round_one.contains("[p1, round 1]"));
    assert!(p3_round_one.contains("[p2, round 1]"));

    let p1_round_two = generator.prompt_of("p1", 2, 2);
    assert!(p1_round_two.contains("[p3, round 1]"));
    assert!(!p1_round_two.contains("round 2]"));
}

#[tokio::test(start_paused = true)]
async fn test_participant_overrides_take_precedence() {
    let generator = Arc::new(Scripted::default());
    let scheduler = scheduler_with(generator.clone(), config());
    let request = CollaborationRequest::new(
        "review the draft",
        vec![
            ParticipantSpec::new("critic").with_temperature(0.9),
            ParticipantSpec::new("scribe").with_model("big-model").with_max_tokens(64),
        ],
    )
    .with_defaults(GenerationDefaults {
        temperature: Some(0.5),
        ..GenerationDefaults::default()
    });

    let report = scheduler.run(request).await.unwrap();
    assert_eq!(report.status, HandleStatus::Completed);

    let calls = generator.turn_prompts();
    let config_of = |id: &str| {
        calls
            .iter()
            .find(|(p, _)| field(p, "Participant:") == Some(id))
            .map(|(_, c)| c.clone())
            .unwrap()
    };
    let critic = config_of("critic");
    assert_eq!(critic.temperature, 0.9);
    assert_eq!(critic.model, "test-model");

    let scribe = config_of("scribe");
    assert_eq!(scribe.temperature, 0.5);
    assert_eq!(scribe.model, "big-model");
    assert_eq!(scribe.max_tokens, 64);

    assert_eq!(report.round_results[0][0].config.temperature, 0.9);
}

#[tokio::test(start_paused = true)]
async fn test_parallel_turns_do_not_see_each_other() {
    let generator = Arc::new(Scripted::default().slow("p2", Duration::from_millis(300)));
    let scheduler = scheduler_with(generator.clone(), config());
    let request = CollaborationRequest::new("brainstorm", participants(&["p1", "p2", "p3"]))
        .with_max_rounds(2)
        .with_mode(CollaborationMode::Parallel);

    let report = scheduler.run(request).await.unwrap();
    assert_eq!(report.status, HandleStatus::Completed);

    for id in ["p1", "p2", "p3"] {
        let first = generator.prompt_of(id, 1, 2);
        assert!(first.contains("Contributions so far: none"), "{id}: {first}");

        let second = generator.prompt_of(id, 2, 2);
        for earlier in ["[p1, round 1]", "[p2, round 1]", "[p3, round 1]"] {
            assert!(second.contains(earlier), "{id} round 2 misses {earlier}");
        }
        assert!(!second.contains("round 2]"));
    }

    // Results are recorded in listed order even though p2 finished last.
    let order: Vec<&str> = report.round_results[0]
        .iter()
        .map(|c| c.participant_id.as_str())
        .collect();
    assert_eq!(order, vec!["p1", "p2", "p3"]);
}

#[tokio::test(start_paused = true)]
async fn test_linear_mode_runs_a_single_round() {
    let generator = Arc::new(Scripted::default());
    let scheduler = scheduler_with(generator.clone(), config());
    let request = CollaborationRequest::new("write docs", participants(&["a", "b", "c"]))
        .with_max_rounds(5)
        .with_mode(CollaborationMode::Linear);

    let report = scheduler.run(request).await.unwrap();
    assert_eq!(report.round_results.len(), 1);
    assert_eq!(report.turn_attempts, 3);
    assert!(generator.prompt_of("c", 1, 1).contains("[b, round 1]"));
}

#[tokio::test(start_paused = true)]
async fn test_failed_turn_is_recorded_and_session_continues() {
    let generator = Arc::new(Scripted::default().failing("flaky"));
    let scheduler = scheduler_with(generator, config());
    let request = CollaborationRequest::new("triage", participants(&["steady", "flaky"]))
        .with_max_rounds(2);

    let report = scheduler.run(request).await.unwrap();

    assert_eq!(report.status, HandleStatus::Completed);
    assert_eq!(report.turn_attempts, 4);
    assert_eq!(report.failed_turns, 2);
    let flaky = &report.round_results[0][1];
    assert_eq!(flaky.status, HandleStatus::Failed);
    assert_eq!(
        flaky.error,
        Some(HandleFailure::work("provider error: flaky unavailable"))
    );
    let synthesis = report.final_synthesis.unwrap();
    assert!(synthesis.contains("[steady]"));
    assert!(!synthesis.contains("[flaky]"));
}

#[tokio::test(start_paused = true)]
async fn test_fatal_participant_aborts_session() {
    let generator = Arc::new(Scripted::default().failing("gatekeeper"));
    let scheduler = scheduler_with(generator.clone(), config());
    let request = CollaborationRequest::new(
        "ship it",
        vec![
            ParticipantSpec::new("author"),
            ParticipantSpec::new("gatekeeper").fatal(),
            ParticipantSpec::new("bystander"),
        ],
    )
    .with_max_rounds(2);

    let report = scheduler.run(request).await.unwrap();

    assert_eq!(report.status, HandleStatus::Failed);
    assert_eq!(
        report.error,
        Some(HandleFailure::work("provider error: gatekeeper unavailable"))
    );
    assert_eq!(report.round_results.len(), 1);
    assert_eq!(report.round_results[0].len(), 2);
    assert_eq!(report.final_synthesis, None);
    assert!(generator
        .turn_prompts()
        .iter()
        .all(|(p, _)| field(p, "Participant:") != Some("bystander")));

    let session = scheduler.session(&report.session_id).unwrap();
    let round = scheduler.registry().get(&session.round_handles[0]).unwrap();
    assert_eq!(round.status, HandleStatus::Failed);
}

#[tokio::test(start_paused = true)]
async fn test_all_turns_failing_fails_session_with_aggregate() {
    let generator = Arc::new(Scripted::default().failing("a").failing("b"));
    let scheduler = scheduler_with(generator, config());
    let request = CollaborationRequest::new("doomed", participants(&["a", "b"])).with_max_rounds(2);

    let report = scheduler.run(request).await.unwrap();

    assert_eq!(report.status, HandleStatus::Failed);
    assert_eq!(report.final_synthesis, None);
    match report.error {
        Some(HandleFailure::Aggregate {
            failed,
            total,
            messages,
        }) => {
            assert_eq!((failed, total), (4, 4));
            assert_eq!(messages.len(), 4);
            assert!(messages[0].starts_with("a (round 1):"));
        }
        other => panic!("expected aggregate failure, got {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn test_intelligent_subset_runs_selected_participants() {
    let generator = Arc::new(
        Scripted::default()
            .selecting(Ok("architect"))
            .selecting(Ok("reviewer should respond next")),
    );
    let scheduler = scheduler_with(generator.clone(), config());
    let request = CollaborationRequest::new("design an API", participants(&["architect", "reviewer"]))
        .with_max_rounds(3)
        .with_mode(CollaborationMode::IntelligentSubset);

    let report = scheduler.run(request).await.unwrap();

    let speakers: Vec<Vec<&str>> = report
        .round_results
        .iter()
        .map(|round| round.iter().map(|c| c.participant_id.as_str()).collect())
        .collect();
    assert_eq!(
        speakers,
        vec![vec!["architect"], vec!["reviewer"], vec!["reviewer"]]
    );

    let steps = scheduler.registry().list(HandleFilter {
        status: None,
        kind: Some(HandleKind::WorkflowStep),
    });
    assert_eq!(steps.len(), 3);

    let prompts = generator.selection_prompts();
    assert_eq!(prompts.len(), 3);
    assert!(prompts[0].contains("Task: design an API"));
    assert!(prompts[0].contains("Contributions so far: none"));
    assert!(prompts[0].contains("for round 1."));
    assert!(prompts[0].ends_with("Candidates: architect, reviewer"));
    assert!(prompts[1].contains("[architect, round 1]"));
}

#[tokio::test(start_paused = true)]
async fn test_intelligent_subset_ends_when_nobody_is_selected() {
    let generator = Arc::new(
        Scripted::default()
            .selecting(Ok("reviewer"))
            .selecting(Ok("none of them")),
    );
    let scheduler = scheduler_with(generator, config());
    let request = CollaborationRequest::new("design an API", participants(&["architect", "reviewer"]))
        .with_max_rounds(3)
        .with_mode(CollaborationMode::IntelligentSubset);

    let report = scheduler.run(request).await.unwrap();
    assert_eq!(report.status, HandleStatus::Completed);
    assert_eq!(report.round_results.len(), 1);
    assert_eq!(report.round_results[0][0].participant_id, "reviewer");
}

#[tokio::test(start_paused = true)]
async fn test_intelligent_subset_selecting_nobody_up_front_fails() {
    let generator = Arc::new(Scripted::default().selecting(Ok("none of them")));
    let scheduler = scheduler_with(generator, config());
    let request = CollaborationRequest::new("design an API", participants(&["architect", "reviewer"]))
        .with_mode(CollaborationMode::IntelligentSubset);

    let report = scheduler.run(request).await.unwrap();
    assert_eq!(report.status, HandleStatus::Failed);
    assert!(report.round_results.is_empty());
    match report.error {
        Some(HandleFailure::Aggregate { failed, total, messages }) => {
            assert_eq!((failed, total), (0, 0));
            assert_eq!(messages, vec!["no participant was selected".to_string()]);
        }
        other => panic!("expected aggregate failure, got {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn test_failed_selection_keeps_every_participant() {
    let generator = Arc::new(Scripted::default().selecting(Err("moderator offline")));
    let scheduler = scheduler_with(generator, config());
    let request = CollaborationRequest::new("design an API", participants(&["architect", "reviewer"]))
        .with_max_rounds(2)
        .with_mode(CollaborationMode::IntelligentSubset);

    let report = scheduler.run(request).await.unwrap();
    let sizes: Vec<usize> = report.round_results.iter().map(Vec::len).collect();
    assert_eq!(sizes, vec![2, 2]);
}

#[tokio::test(start_paused = true)]
async fn test_generated_synthesis_and_its_fallback() {
    let generator = Arc::new(Scripted::default().synthesizing(Ok("one agreed design")));
    let scheduler = scheduler_with(generator, config());
    let request = CollaborationRequest::new("design", participants(&["a", "b"]))
        .with_synthesis(SynthesisStrategy::Generated);
    let report = scheduler.run(request).await.unwrap();
    assert_eq!(report.final_synthesis.as_deref(), Some("one agreed design"));

    let generator = Arc::new(Scripted::default().synthesizing(Err("quota exceeded")));
    let scheduler = scheduler_with(generator, config());
    let request = CollaborationRequest::new("design", participants(&["a", "b"]))
        .with_synthesis(SynthesisStrategy::Generated);
    let report = scheduler.run(request).await.unwrap();
    assert_eq!(report.status, HandleStatus::Completed);
    let synthesis = report.final_synthesis.unwrap();
    assert!(synthesis.contains("[a]") && synthesis.contains("[b]"));
}

#[tokio::test(start_paused = true)]
async fn test_turn_deadline_times_out_single_turn() {
    let generator = Arc::new(Scripted::default().slow("slowpoke", Duration::from_secs(10)));
    let scheduler = scheduler_with(
        generator,
        config().with_turn_timeout(Duration::from_millis(200)),
    );
    let request = CollaborationRequest::new("race", participants(&["quick", "slowpoke"]));

    let report = scheduler.run(request).await.unwrap();

    assert_eq!(report.status, HandleStatus::Completed);
    let slow = &report.round_results[0][1];
    assert_eq!(slow.status, HandleStatus::TimedOut);
    assert_eq!(
        slow.error,
        Some(HandleFailure::DeadlineExceeded { timeout_ms: 200 })
    );
    assert_eq!(report.failed_turns, 1);
}

#[tokio::test(start_paused = true)]
async fn test_cancelling_session_reaches_in_flight_turns() {
    let generator = Arc::new(Scripted::default().slow("thinker", Duration::from_secs(10)));
    let scheduler = scheduler_with(generator, config());
    let session_id = scheduler
        .start(CollaborationRequest::new("ponder", participants(&["thinker", "talker"])).with_max_rounds(2))
        .unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    let finished_before = METRICS.sessions_finished();
    scheduler.cancel(&session_id).unwrap();
    scheduler.dispatcher().drain().await;
    assert!(METRICS.sessions_finished() > finished_before);

    let session = scheduler.session(&session_id).unwrap();
    assert_eq!(session.status, HandleStatus::Cancelled);
    assert!(session.finished_at.is_some());
    assert_eq!(session.turn_attempts, 0);

    let registry = scheduler.registry();
    let pending = registry.list(HandleFilter {
        status: Some(HandleStatus::Pending),
        kind: None,
    });
    assert!(pending.is_empty(), "left pending: {pending:?}");
    let turns = registry.list(HandleFilter {
        status: None,
        kind: Some(HandleKind::ParticipantTurn),
    });
    assert_eq!(turns.len(), 1);
    assert_eq!(turns[0].status, HandleStatus::Cancelled);
    assert_eq!(turns[0].error, None);
}

#[tokio::test(start_paused = true)]
async fn test_session_timeout_is_reported_and_cascades() {
    let generator = Arc::new(Scripted::default().slow("thinker", Duration::from_secs(10)));
    let scheduler = scheduler_with(generator, config());
    let request = CollaborationRequest::new("ponder", participants(&["thinker"]))
        .with_session_timeout_ms(500);

    let report = scheduler.run(request).await.unwrap();
    assert_eq!(report.status, HandleStatus::TimedOut);
    assert_eq!(
        report.error,
        Some(HandleFailure::DeadlineExceeded { timeout_ms: 500 })
    );
    assert_eq!(report.final_synthesis, None);

    scheduler.dispatcher().drain().await;
    let turns = scheduler.registry().list(HandleFilter {
        status: None,
        kind: Some(HandleKind::ParticipantTurn),
    });
    assert!(turns.iter().all(|t| t.status == HandleStatus::Cancelled));
}

#[tokio::test(start_paused = true)]
async fn test_invalid_requests_raise_validation_errors() {
    let scheduler = scheduler_with(Arc::new(EchoGenerator::default()), config());

    let err = scheduler
        .start(CollaborationRequest::new("task", Vec::new()))
        .unwrap_err();
    assert!(matches!(
        err,
        ConveneError::Validation(ValidationError::NoParticipants)
    ));

    let err = scheduler
        .start(CollaborationRequest::new("task", participants(&["a"])).with_max_rounds(0))
        .unwrap_err();
    assert!(matches!(
        err,
        ConveneError::Validation(ValidationError::NonPositiveRounds(0))
    ));

    assert!("debate".parse::<CollaborationMode>().is_err());
    assert!(scheduler.registry().is_empty());
    assert!(scheduler.session_ids().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_purge_forgets_finished_sessions() {
    let mut cfg = config();
    cfg.retention_ms = 0;
    let scheduler = scheduler_with(Arc::new(EchoGenerator::default()), cfg);
    let report = scheduler
        .run(CollaborationRequest::new("t", participants(&["a"])))
        .await
        .unwrap();
    scheduler.dispatcher().drain().await;

    assert!(scheduler.purge() >= 3);
    assert!(scheduler.registry().is_empty());
    assert!(scheduler.session_ids().is_empty());
    assert!(scheduler.session(&report.session_id).is_err());
}
