//! agentguard-cli: submit one agent trace through the AgentGuard runtime
//!
//! Useful for checking connectivity, credentials and threshold settings
//! against a live verification service.
//!
//! # Subcommands
//! - `verify --agent-id <id> --input <json> --output <json>`  sync verification, prints the result
//! - `emit --agent-id <id> --input <json> --output <json>`    async ingestion, prints delivery stats
//! - `config`                                                 print the effective configuration

use agentguard_core::{GuardConfig, GuardError, Mode};
use agentguard_runtime::AgentGuard;
use clap::{Args, Parser, Subcommand};
use tracing_subscriber::{fmt, EnvFilter};

/// Exit status when the verifier blocks the output.
const EXIT_BLOCKED: i32 = 2;

// ============================================================================
// CLI Definition
// ============================================================================

#[derive(Debug, Parser)]
#[command(
    name = "agentguard-cli",
    version,
    about = "AgentGuard CLI: submit a single agent trace for verification or ingestion"
)]
struct Cli {
    /// Configuration file (TOML); missing files fall back to defaults
    #[arg(short, long, env = "AGENTGUARD_CONFIG", default_value = "agentguard.toml")]
    config: String,

    /// API key sent as X-AgentGuard-Key
    #[arg(long, env = "AGENTGUARD_API_KEY", hide_env_values = true)]
    api_key: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Verify one execution inline and print the guarded result
    Verify(TraceArgs),

    /// Queue one execution for async ingestion and flush it
    Emit(TraceArgs),

    /// Print the effective configuration
    Config,
}

#[derive(Debug, Args)]
struct TraceArgs {
    /// Agent identifier
    #[arg(long)]
    agent_id: String,

    /// Task description
    #[arg(long, default_value = "")]
    task: String,

    /// Agent input (JSON, or a plain string)
    #[arg(long)]
    input: String,

    /// Agent output (JSON, or a plain string)
    #[arg(long)]
    output: String,

    /// Attach the trace to a session
    #[arg(long)]
    session_id: Option<String>,
}

// ============================================================================
// Main
// ============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let cli = Cli::parse();

    fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .with_writer(std::io::stderr)
        .init();

    let config = match GuardConfig::load(&cli.config) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load config from {}: {}", cli.config, e);
            std::process::exit(1);
        }
    };

    match cli.command {
        Commands::Config => {
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
        Commands::Verify(args) => {
            let api_key = require_api_key(cli.api_key)?;
            let config = GuardConfig {
                mode: Mode::Sync,
                ..config
            };
            cmd_verify(api_key, config, args).await
        }
        Commands::Emit(args) => {
            let api_key = require_api_key(cli.api_key)?;
            let config = GuardConfig {
                mode: Mode::Async,
                ..config
            };
            cmd_emit(api_key, config, args).await
        }
    }
}

fn require_api_key(api_key: Option<String>) -> anyhow::Result<String> {
    api_key
        .filter(|k| !k.is_empty())
        .ok_or_else(|| anyhow::anyhow!("No API key: pass --api-key or set AGENTGUARD_API_KEY"))
}

/// Accept JSON where it parses, otherwise treat the argument as a string.
fn parse_value(raw: &str) -> serde_json::Value {
    serde_json::from_str(raw).unwrap_or_else(|_| serde_json::Value::String(raw.to_string()))
}

// ============================================================================
// Commands
// ============================================================================

async fn cmd_verify(api_key: String, config: GuardConfig, args: TraceArgs) -> anyhow::Result<()> {
    let guard = AgentGuard::new(api_key, config)?;
    let outcome = submit(&guard, &args).await;
    guard.close().await;

    match outcome {
        Ok(result) => {
            println!("{}", serde_json::to_string_pretty(&result)?);
            Ok(())
        }
        Err(GuardError::Blocked(result)) => {
            println!("{}", serde_json::to_string_pretty(&result)?);
            eprintln!("Output blocked");
            std::process::exit(EXIT_BLOCKED);
        }
        Err(e) => Err(e.into()),
    }
}

async fn cmd_emit(api_key: String, config: GuardConfig, args: TraceArgs) -> anyhow::Result<()> {
    let guard = AgentGuard::new(api_key, config)?;
    let outcome = submit(&guard, &args).await;
    guard.close().await;
    let result = outcome?;

    let stats = guard.delivery_stats();
    println!(
        "{}",
        serde_json::to_string_pretty(&serde_json::json!({
            "execution_id": result.execution_id,
            "delivery": stats,
        }))?
    );
    if stats.delivered == 0 {
        anyhow::bail!("Trace was not delivered (see logs)");
    }
    Ok(())
}

/// Record one trace from the command-line arguments.
///
/// Callers close the guard whatever the outcome, so queued traces are drained
/// before the process exits.
async fn submit(
    guard: &AgentGuard,
    args: &TraceArgs,
) -> Result<agentguard_core::GuardResult, GuardError> {
    let input = parse_value(&args.input);
    let output = parse_value(&args.output);

    let scope = match &args.session_id {
        Some(id) => guard
            .session(&args.agent_id, Some(id.clone()))
            .trace(args.task.clone(), input)?,
        None => guard.trace(args.agent_id.clone(), args.task.clone(), input)?,
    };
    scope.record(output).await
}
