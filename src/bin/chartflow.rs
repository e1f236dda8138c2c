//! chartflow CLI
//!
//! Usage:
//!   chartflow chat
//!   chartflow ask "show category counts" --conversation c1
//!   chartflow resume --conversation c1 yes
//!   chartflow state --conversation c1
//!   chartflow graph --direct

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::json;
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;

use chartflow::config::CheckpointBackend;
use chartflow::services::fixtures::Fixtures;
use chartflow::workflow::DATA_QUERY_PROMPT;
use chartflow::{
    build_workflow, FlowConfig, FlowError, RunOutcome, StateSnapshot, WorkflowMode, WorkflowState,
};

/// Ask questions about your data, get charts back
#[derive(Parser, Debug)]
#[command(name = "chartflow")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Suppress non-error output
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Path to a YAML configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Use fixture services instead of the database and model providers
    #[arg(long, global = true)]
    test_mode: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Interactive conversation
    Chat {
        /// Skip the confirmation and refinement prompts
        #[arg(long)]
        direct: bool,

        /// Conversation id (random when omitted)
        #[arg(long)]
        conversation: Option<String>,
    },

    /// Start a turn and print the outcome as JSON
    Ask {
        question: String,

        #[arg(long)]
        conversation: Option<String>,

        #[arg(long)]
        direct: bool,
    },

    /// Answer the pending prompt of a conversation
    Resume {
        #[arg(long)]
        conversation: String,

        /// Answer to the pending prompt (may be empty)
        #[arg(default_value = "")]
        answer: String,
    },

    /// Show the latest checkpoint of a conversation
    State {
        #[arg(long)]
        conversation: String,
    },

    /// Print the stage graph as Mermaid
    Graph {
        #[arg(long)]
        direct: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let log_level = match (cli.quiet, cli.verbose) {
        (true, _) => tracing::Level::ERROR,
        (_, 0) => tracing::Level::WARN,
        (_, 1) => tracing::Level::INFO,
        (_, 2) => tracing::Level::DEBUG,
        (_, _) => tracing::Level::TRACE,
    };

    tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_target(false)
        .with_writer(io::stderr)
        .init();

    let mut config = load_config(cli.config.as_ref())?;
    if cli.test_mode {
        config.test_mode = true;
    }

    match cli.command {
        Commands::Chat {
            direct,
            conversation,
        } => chat(&config, mode_for(&config, direct), conversation),

        Commands::Ask {
            question,
            conversation,
            direct,
        } => ask(&config, mode_for(&config, direct), &question, conversation),

        Commands::Resume {
            conversation,
            answer,
        } => resume(&config, &conversation, &answer),

        Commands::State { conversation } => show_state(&config, &conversation),

        Commands::Graph { direct } => print_graph(mode_for(&config, direct)),
    }
}

fn load_config(path: Option<&PathBuf>) -> Result<FlowConfig> {
    let mut config = match path {
        Some(path) => FlowConfig::load_from_file(path)
            .with_context(|| format!("Failed to load config from {:?}", path))?,
        None => FlowConfig::default(),
    };
    config.apply_env();
    Ok(config)
}

fn mode_for(config: &FlowConfig, direct: bool) -> WorkflowMode {
    if direct {
        WorkflowMode::Direct
    } else {
        config.mode
    }
}

fn new_conversation_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

/// One-shot commands span processes, so their checkpoints must outlive them
fn persistent(config: &FlowConfig) -> FlowConfig {
    let mut config = config.clone();
    if config.checkpoint.backend == CheckpointBackend::Memory {
        tracing::info!(dir = %config.checkpoint.dir.display(), "using file checkpoints");
        config.checkpoint.backend = CheckpointBackend::File;
    }
    config
}

fn chat(config: &FlowConfig, mode: WorkflowMode, conversation: Option<String>) -> Result<()> {
    let executor = config
        .build_executor(mode)
        .context("Failed to set up the workflow")?;
    let conversation = conversation.unwrap_or_else(new_conversation_id);
    let stdin = io::stdin();
    let mut lines = stdin.lock().lines();

    println!("Conversation {conversation} ({mode} mode). Type 'exit' to leave.");

    // Prompt of the interrupt waiting for an answer, if any
    let mut pending: Option<String> = None;

    loop {
        match &pending {
            Some(prompt) => println!("\n{prompt}"),
            None => println!("\nWhat do you want to know about your data?"),
        }
        print!("> ");
        io::stdout().flush()?;

        let Some(line) = lines.next() else {
            break;
        };
        let line = line?;
        let input = line.trim();
        let command = input.to_lowercase();

        // 'exit' leaves even while a prompt is pending
        if command == "exit" {
            break;
        }
        if pending.is_none() {
            if matches!(command.as_str(), "quit" | "stop" | "q") {
                break;
            }
            if input.is_empty() {
                continue;
            }
        }

        let result = match pending.take() {
            Some(_) => executor.resume(&conversation, input),
            None => executor.invoke(&conversation, input),
        };

        match result {
            Ok(RunOutcome::Interrupted { interrupt, state }) => {
                if interrupt.stage == DATA_QUERY_PROMPT {
                    print_results(&state);
                }
                pending = Some(interrupt.prompt);
            }
            Ok(RunOutcome::Completed { state }) => {
                if mode == WorkflowMode::Direct {
                    print_results(&state);
                }
            }
            Err(err) if err.is_turn_fatal() => {
                tracing::debug!(error = %err, "turn failed");
                println!("{}", err.user_message());
            }
            Err(err) => return Err(err).context("Conversation can't continue"),
        }
    }

    Ok(())
}

fn print_results(state: &WorkflowState) {
    if let Some(chart) = &state.chart {
        println!("\nChart: {}", chart.path.display());
        if !chart.caption.is_empty() {
            println!("{}", chart.caption);
        }
    }
    if !state.summary.is_empty() {
        println!("\n{}", state.summary);
    }
}

fn outcome_json(conversation: &str, outcome: &RunOutcome) -> serde_json::Value {
    let status = if outcome.is_interrupted() {
        "interrupted"
    } else {
        "completed"
    };
    json!({
        "conversation_id": conversation,
        "status": status,
        "interrupt": outcome.interrupt(),
        "state": outcome.state(),
    })
}

fn ask(
    config: &FlowConfig,
    mode: WorkflowMode,
    question: &str,
    conversation: Option<String>,
) -> Result<()> {
    let executor = persistent(config).build_executor(mode)?;
    let conversation = conversation.unwrap_or_else(new_conversation_id);

    let outcome = executor.invoke(&conversation, question)?;
    println!(
        "{}",
        serde_json::to_string_pretty(&outcome_json(&conversation, &outcome))?
    );
    Ok(())
}

fn resume(config: &FlowConfig, conversation: &str, answer: &str) -> Result<()> {
    let executor = persistent(config).build_executor(config.mode)?;

    let outcome = executor.resume(conversation, answer)?;
    println!(
        "{}",
        serde_json::to_string_pretty(&outcome_json(conversation, &outcome))?
    );
    Ok(())
}

fn show_state(config: &FlowConfig, conversation: &str) -> Result<()> {
    let checkpointer = persistent(config).build_checkpointer()?;
    let snapshot = checkpointer
        .load(conversation)?
        .map(StateSnapshot::from)
        .ok_or_else(|| FlowError::ConversationNotFound(conversation.to_string()))?;

    println!("{}", serde_json::to_string_pretty(&snapshot)?);
    Ok(())
}

fn print_graph(mode: WorkflowMode) -> Result<()> {
    // Stage functions are never run here, fixtures are enough to build the graph
    let services = Arc::new(Fixtures::new().services(std::env::temp_dir()));
    let graph = build_workflow(services, mode)?;
    println!("{}", graph.to_mermaid());
    Ok(())
}

