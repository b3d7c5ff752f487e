use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::sync::broadcast;

use steward_core::config::AgentConfig;
use steward_core::events::BrokerEvent;
use steward_core::ids::UserId;
use steward_core::session::SessionMode;
use steward_engine::{ClientPool, NullArchiver, PoolConfig, SessionOrchestrator};
use steward_hooks::HookPipeline;
use steward_policy::builtin::{CommandPatternPolicy, ToolListPolicy};
use steward_policy::PolicyEngine;
use steward_runtime::ProcessRuntime;
use steward_store::decisions::DecisionRepo;
use steward_store::hook_executions::HookExecutionRepo;
use steward_store::Database;
use steward_telemetry::{init_telemetry, TelemetryConfig};

/// Broker one agent session: send a prompt, stream the replies, audit
/// every tool decision.
#[derive(Parser, Debug)]
#[command(name = "steward", version)]
struct Args {
    /// Prompt to send to the session.
    prompt: String,

    /// Working directory for the session.
    #[arg(long, default_value = ".")]
    cwd: PathBuf,

    /// Model identifier passed to the agent runtime.
    #[arg(long)]
    model: Option<String>,

    /// Agent CLI binary to spawn.
    #[arg(long, default_value = "claude")]
    agent: String,

    /// Database path (defaults to ~/.steward/steward.db).
    #[arg(long)]
    db: Option<PathBuf>,

    /// Tool name patterns to disallow (repeatable).
    #[arg(long = "deny-tool")]
    deny_tools: Vec<String>,

    /// Emit JSON logs.
    #[arg(long)]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    init_telemetry(&TelemetryConfig {
        json_output: args.json_logs,
        ..Default::default()
    });

    let db_path = match &args.db {
        Some(path) => path.clone(),
        None => default_db_path(),
    };
    let db = Database::open(&db_path)?;

    let mut config = AgentConfig::default();
    if let Some(model) = args.model {
        config.model = model;
    }
    config.disallowed_tools = args.deny_tools.clone();

    let mut policies = PolicyEngine::new()
        .with_cache()
        .with_decision_log(DecisionRepo::new(db.clone()));
    policies.register(Arc::new(ToolListPolicy::from_config(&config)?));
    policies.register(Arc::new(CommandPatternPolicy::with_defaults()));

    let hooks = HookPipeline::new().with_execution_log(HookExecutionRepo::new(db.clone()));

    let runtime = Arc::new(ProcessRuntime::new(&args.agent));
    let pool = Arc::new(ClientPool::new(runtime, PoolConfig::default()));
    let (events_tx, mut events_rx) = broadcast::channel::<BrokerEvent>(1024);

    let orchestrator = SessionOrchestrator::new(
        db,
        pool,
        Arc::new(policies),
        Arc::new(hooks),
        Arc::new(NullArchiver),
        events_tx,
    );

    let cwd = args.cwd.canonicalize().unwrap_or(args.cwd);
    let session = orchestrator.create_session(
        UserId::new(),
        SessionMode::NonInteractive,
        config,
        &cwd.to_string_lossy(),
    )?;
    tracing::info!(session_id = %session.id, "session created");

    // Print streamed replies while the exchange runs.
    let printer = tokio::spawn(async move {
        while let Ok(event) = events_rx.recv().await {
            match event {
                BrokerEvent::AssistantText { text, .. } => println!("{text}"),
                BrokerEvent::ToolCallStarted { tool_name, .. } => {
                    tracing::info!(tool_name, "tool call started");
                }
                BrokerEvent::ToolCallResolved { status, .. } => {
                    tracing::info!(status, "tool call resolved");
                }
                _ => {}
            }
        }
    });

    let send = orchestrator.send_message(&session.id, &args.prompt);
    tokio::pin!(send);
    let outcome = tokio::select! {
        outcome = &mut send => outcome,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("interrupted, shutting down");
            orchestrator.shutdown().await;
            printer.abort();
            return Ok(());
        }
    };

    orchestrator.shutdown().await;
    printer.abort();

    match outcome {
        Ok(outcome) if outcome.is_error => {
            anyhow::bail!(
                "runtime reported an error: {}",
                outcome.result.unwrap_or_default()
            )
        }
        Ok(_) => Ok(()),
        Err(e) => Err(e.into()),
    }
}

fn default_db_path() -> PathBuf {
    let home = std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"));
    home.join(".steward").join("steward.db")
}
