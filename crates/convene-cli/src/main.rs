//! Convene CLI
//!
//! The `convene` command runs collaboration sessions and handle operations
//! against an in-process registry. Turns are produced by the deterministic
//! echo generator.
//!
//! ## Commands
//!
//! - `collaborate`: run a session and print its report
//! - `tool`: invoke one tool operation with JSON arguments
//! - `config`: print the effective configuration

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde_json::Value;
use tracing::{info, Level};

use convene_core::{
    CollaborationMode, CollaborationRequest, CollaborationScheduler, ConveneConfig,
    EchoGenerator, GenerationDefaults, HandleTools, ParticipantSpec, SessionReport,
    SynthesisStrategy,
};
use convene_state::{HandleRegistry, HandleStatus};

#[derive(Parser)]
#[command(name = "convene")]
#[command(author = "Stevedores Org")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Round-based multi-participant collaboration over wait handles", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a collaboration session and print its report
    Collaborate(CollaborateArgs),

    /// Invoke one tool operation with JSON arguments
    Tool {
        /// Operation name, e.g. `run_collaboration` or `list_handles`
        operation: String,

        /// JSON object with the operation's arguments
        #[arg(long, default_value = "{}")]
        args: String,
    },

    /// Print the effective configuration as JSON
    Config,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    #[default]
    Text,
    Json,
}

#[derive(Args, Debug)]
struct CollaborateArgs {
    /// Task description shared by every participant
    #[arg(short, long)]
    task: String,

    /// Participant as `id` or `id:role`; repeat for each participant
    #[arg(short, long = "participant", required = true, value_parser = parse_participant)]
    participants: Vec<ParticipantSpec>,

    /// Maximum number of rounds
    #[arg(short, long, default_value_t = 2)]
    rounds: u32,

    /// linear, parallel, rounds or intelligent-subset
    #[arg(short, long, default_value = "rounds", value_parser = parse_mode)]
    mode: CollaborationMode,

    /// concatenate or generated
    #[arg(long, value_parser = parse_synthesis)]
    synthesis: Option<SynthesisStrategy>,

    /// Session-level default temperature
    #[arg(long)]
    temperature: Option<f32>,

    /// Session-level default model
    #[arg(long)]
    model: Option<String>,

    /// Deadline for the whole session
    #[arg(long)]
    session_timeout_ms: Option<u64>,

    /// Report format
    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    output: OutputFormat,
}

impl CollaborateArgs {
    fn request(&self) -> CollaborationRequest {
        let mut request = CollaborationRequest::new(&self.task, self.participants.clone())
            .with_max_rounds(self.rounds)
            .with_mode(self.mode)
            .with_defaults(GenerationDefaults {
                model: self.model.clone(),
                temperature: self.temperature,
                max_tokens: None,
            });
        if let Some(synthesis) = self.synthesis {
            request = request.with_synthesis(synthesis);
        }
        if let Some(ms) = self.session_timeout_ms {
            request = request.with_session_timeout_ms(ms);
        }
        request
    }
}

fn parse_participant(raw: &str) -> Result<ParticipantSpec, String> {
    let (id, role) = match raw.split_once(':') {
        Some((id, role)) => (id.trim(), Some(role.trim())),
        None => (raw.trim(), None),
    };
    if id.is_empty() {
        return Err(format!("participant {raw:?} has an empty id"));
    }
    let spec = ParticipantSpec::new(id);
    Ok(match role {
        Some(role) if !role.is_empty() => spec.with_role(role),
        _ => spec,
    })
}

fn parse_mode(raw: &str) -> Result<CollaborationMode, String> {
    raw.parse().map_err(|e: convene_core::ValidationError| e.to_string())
}

fn parse_synthesis(raw: &str) -> Result<SynthesisStrategy, String> {
    raw.parse().map_err(|e: convene_core::ValidationError| e.to_string())
}

fn scheduler(config: ConveneConfig) -> CollaborationScheduler {
    CollaborationScheduler::new(
        Arc::new(HandleRegistry::new()),
        Arc::new(EchoGenerator::default()),
        config,
    )
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    convene_core::telemetry::init_tracing(cli.json, level);

    let config = ConveneConfig::from_env();
    match cli.command {
        Commands::Collaborate(args) => cmd_collaborate(config, &args).await,
        Commands::Tool { operation, args } => cmd_tool(config, &operation, &args).await,
        Commands::Config => {
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

async fn cmd_collaborate(config: ConveneConfig, args: &CollaborateArgs) -> Result<()> {
    let scheduler = scheduler(config);
    let report = scheduler
        .run(args.request())
        .await
        .context("Failed to run collaboration session")?;
    info!(session_id = %report.session_id, status = %report.status, "session finished");
    convene_core::metrics::METRICS.flush();

    match args.output {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
        OutputFormat::Text => print!("{}", render_report(&report)),
    }

    if report.status != HandleStatus::Completed {
        bail!(
            "session {} finished with status {}",
            report.session_id,
            report.status
        );
    }
    Ok(())
}

async fn cmd_tool(config: ConveneConfig, operation: &str, raw_args: &str) -> Result<()> {
    let args: Value = serde_json::from_str(raw_args)
        .with_context(|| format!("--args is not valid JSON: {raw_args}"))?;
    let tools = HandleTools::new(scheduler(config));
    let value = tools
        .call(operation, args)
        .await
        .with_context(|| format!("{operation} failed"))?;
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}

fn render_report(report: &SessionReport) -> String {
    let mut out = format!(
        "Session {}: {} ({} turns, {} failed, {}ms)\n",
        report.session_id, report.status, report.turn_attempts, report.failed_turns, report.waited_ms
    );
    for (index, round) in report.round_results.iter().enumerate() {
        out.push_str(&format!("Round {}\n", index + 1));
        for c in round {
            match &c.text {
                Some(text) if c.succeeded() => {
                    out.push_str(&format!("  [{}] {}\n", c.participant_id, text))
                }
                _ => out.push_str(&format!(
                    "  [{}] {}: {}\n",
                    c.participant_id,
                    c.status,
                    c.error_message()
                )),
            }
        }
    }
    if let Some(error) = &report.error {
        out.push_str(&format!("Error: {error}\n"));
    }
    if let Some(synthesis) = &report.final_synthesis {
        out.push_str("Synthesis:\n");
        out.push_str(synthesis);
        out.push('\n');
    }
    out
}
