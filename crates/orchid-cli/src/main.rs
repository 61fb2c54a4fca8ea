//! orchid - workflow orchestration CLI
//!
//! The `orchid` command drives tasks through the fixed
//! plan/build/critique/verify graph over a filesystem-backed run store.
//!
//! ## Commands
//!
//! - `submit`: Create a run and drive it to a terminal state with scripted roles
//! - `status`: Show where a run is in the graph
//! - `history`: Show every step record of a run
//! - `list`: List all runs with their status
//! - `sweep`: Run the crash-recovery sweep once

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use serde_json::json;
use tokio::sync::watch;
use tracing::{info, Level};

use orchid_core::{
    EngineConfig, GraphEngine, LogDelivery, RecoveryManager, RecoveryOutcome, RewardSink,
    RoleRegistry, RoleResult, ScriptedRole,
};
use orchid_state::{
    FsWorkflowStore, RunId, StepOutcome, Task, TaskBudget, WorkflowNode, WorkflowStore,
};

#[derive(Parser)]
#[command(name = "orchid")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Multi-role workflow orchestration engine", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    /// Directory holding the run store
    #[arg(long, global = true, default_value = ".orchid")]
    state_dir: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Submit a task and drive it to a terminal state with scripted roles
    Submit {
        /// What the workflow should accomplish
        #[arg(short, long)]
        goal: String,

        /// Retries allowed per node beyond the initial attempt
        #[arg(long)]
        max_retries: Option<u32>,

        /// Total role invocations allowed across the run
        #[arg(long)]
        max_steps: Option<u32>,

        /// Scripted behavior of the demo roles
        #[arg(long, value_enum, default_value_t = ScriptPreset::Clean)]
        script: ScriptPreset,
    },

    /// Show a run's position in the graph
    Status {
        /// Run ID to inspect
        run_id: String,
    },

    /// Show every step record of a run
    History {
        /// Run ID to inspect
        run_id: String,
    },

    /// List all runs with their status
    List,

    /// Examine stale runs once: resume recoverable ones, abandon dead ones
    Sweep {
        /// Liveness threshold in seconds; runs not updated for this long
        /// count as orphaned
        #[arg(long, default_value_t = 300)]
        older_than_secs: u64,

        /// Scripted behavior of the roles used to resume runs
        #[arg(long, value_enum, default_value_t = ScriptPreset::Clean)]
        script: ScriptPreset,
    },
}

/// Canned role behaviors for demonstration runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum ScriptPreset {
    /// Every node succeeds on the first attempt
    Clean,
    /// Verification fails twice, then passes
    FlakyVerify,
    /// The critic rejects every patch until retries run out
    RejectingCritic,
}

fn demo_registry(preset: ScriptPreset) -> RoleRegistry {
    let plan = ScriptedRole::producing(
        WorkflowNode::Plan,
        json!(["outline the change", "write the patch", "cover it with tests"]),
    );
    let build = ScriptedRole::producing(
        WorkflowNode::Build,
        json!({"diff": "+fn solve() -> Answer { .. }", "files_touched": 2}),
    );
    let critique = match preset {
        ScriptPreset::RejectingCritic => ScriptedRole::producing(
            WorkflowNode::Critique,
            json!({"judgment": "reject", "notes": "patch does not match the plan"}),
        ),
        _ => ScriptedRole::producing(
            WorkflowNode::Critique,
            json!({"judgment": "accept", "notes": "looks consistent"}),
        ),
    };
    let verify = match preset {
        ScriptPreset::FlakyVerify => ScriptedRole::new(vec![
            RoleResult::Produced {
                name: "verification_report".to_string(),
                value: json!({"verdict": "fail", "detail": "2 tests red"}),
            },
            RoleResult::Produced {
                name: "verification_report".to_string(),
                value: json!({"verdict": "fail", "detail": "1 test red"}),
            },
            RoleResult::Produced {
                name: "verification_report".to_string(),
                value: json!({"verdict": "pass"}),
            },
        ]),
        _ => ScriptedRole::producing(WorkflowNode::Verify, json!({"verdict": "pass"})),
    };

    RoleRegistry::new()
        .bind(WorkflowNode::Plan, Arc::new(plan))
        .bind(WorkflowNode::Build, Arc::new(build))
        .bind(WorkflowNode::Critique, Arc::new(critique))
        .bind(WorkflowNode::Verify, Arc::new(verify))
}

fn open_engine(state_dir: &PathBuf, registry: RoleRegistry) -> Result<GraphEngine> {
    let store = FsWorkflowStore::new(state_dir)
        .with_context(|| format!("Failed to open run store at {}", state_dir.display()))?;
    Ok(GraphEngine::new(
        Arc::new(store),
        registry,
        EngineConfig::default(),
    ))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    orchid_core::init_tracing(cli.json, level);

    match cli.command {
        Commands::Submit {
            goal,
            max_retries,
            max_steps,
            script,
        } => cmd_submit(&cli.state_dir, &goal, max_retries, max_steps, script).await,
        Commands::Status { run_id } => cmd_status(&cli.state_dir, &run_id, cli.json).await,
        Commands::History { run_id } => cmd_history(&cli.state_dir, &run_id).await,
        Commands::List => cmd_list(&cli.state_dir).await,
        Commands::Sweep {
            older_than_secs,
            script,
        } => cmd_sweep(&cli.state_dir, older_than_secs, script).await,
    }
}

async fn cmd_submit(
    state_dir: &PathBuf,
    goal: &str,
    max_retries: Option<u32>,
    max_steps: Option<u32>,
    script: ScriptPreset,
) -> Result<()> {
    let config = EngineConfig::default();
    let sink = RewardSink::spawn(Arc::new(LogDelivery), config.reward_capacity);
    let engine = open_engine(state_dir, demo_registry(script))?.with_reward_sink(sink);

    let mut budget = TaskBudget::default();
    if let Some(retries) = max_retries {
        budget.max_retries_per_node = retries;
    }
    if let Some(steps) = max_steps {
        budget.max_steps = steps;
    }
    let task = Task::new(goal).with_budget(budget);

    let run_id = engine.submit(task).await.context("Failed to submit task")?;
    println!("run {run_id} submitted");

    // Ctrl-C requests a graceful abort of the in-flight run.
    let (cancel_tx, cancel_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("abort requested");
            let _ = cancel_tx.send(true);
        }
    });

    let state = engine
        .drive(&run_id, cancel_rx)
        .await
        .context("Run could not be driven to completion")?;

    println!("run {run_id} finished: {}", state.status);
    if let Some(reason) = &state.terminal_reason {
        println!("  reason:   {}", serde_json::to_string(reason)?);
    }
    println!("  steps:    {}", state.history.len());
    for node in WorkflowNode::all() {
        let attempts = state.attempts(*node);
        if attempts > 0 {
            println!("  {:>8}: {attempts} attempt(s)", node.as_str());
        }
    }
    Ok(())
}

async fn cmd_status(state_dir: &PathBuf, run_id: &str, as_json: bool) -> Result<()> {
    let engine = open_engine(state_dir, RoleRegistry::new())?;
    let view = engine
        .status(&RunId(run_id.to_string()))
        .await
        .with_context(|| format!("Failed to load run {run_id}"))?;

    if as_json {
        println!("{}", serde_json::to_string_pretty(&view)?);
        return Ok(());
    }

    println!("run {}", view.run_id);
    println!("  status:     {}", view.status);
    if let Some(node) = view.current_node {
        println!("  at node:    {node}");
    }
    if let Some(reason) = &view.terminal_reason {
        println!("  reason:     {}", serde_json::to_string(reason)?);
    }
    println!("  steps:      {}", view.steps);
    println!("  updated at: {}", view.updated_at.to_rfc3339());
    if !view.artifacts.is_empty() {
        let names: Vec<&str> = view.artifacts.keys().map(String::as_str).collect();
        println!("  artifacts:  {}", names.join(", "));
    }
    Ok(())
}

async fn cmd_history(state_dir: &PathBuf, run_id: &str) -> Result<()> {
    let store = FsWorkflowStore::new(state_dir)
        .with_context(|| format!("Failed to open run store at {}", state_dir.display()))?;
    let state = store
        .load(&RunId(run_id.to_string()))
        .await
        .with_context(|| format!("Failed to load run {run_id}"))?;

    println!("run {} ({} steps)", state.run_id, state.history.len());
    for (i, record) in state.history.iter().enumerate() {
        let outcome = match &record.outcome {
            StepOutcome::Success { artifact } => {
                let short = artifact.digest.get(..12).unwrap_or(&artifact.digest);
                format!("success ({} {short})", artifact.name)
            }
            StepOutcome::RetryableFailure { reason } => format!("retryable: {reason}"),
            StepOutcome::FatalFailure { reason } => format!("fatal: {reason}"),
        };
        println!(
            "  {:>3}. {:>8} #{} {} {outcome}",
            i + 1,
            record.node.as_str(),
            record.attempt,
            record.finished_at.to_rfc3339(),
        );
    }
    Ok(())
}

async fn cmd_list(state_dir: &PathBuf) -> Result<()> {
    let store = FsWorkflowStore::new(state_dir)
        .with_context(|| format!("Failed to open run store at {}", state_dir.display()))?;
    let mut run_ids = store.list_runs().await.context("Failed to list runs")?;
    run_ids.sort_by(|a, b| a.as_str().cmp(b.as_str()));

    if run_ids.is_empty() {
        println!("no runs in {}", state_dir.display());
        return Ok(());
    }
    for run_id in run_ids {
        let state = store
            .load(&run_id)
            .await
            .with_context(|| format!("Failed to load run {run_id}"))?;
        println!(
            "{}  {:<9}  {} steps  updated {}",
            state.run_id,
            state.status.to_string(),
            state.history.len(),
            state.updated_at.to_rfc3339(),
        );
    }
    Ok(())
}

async fn cmd_sweep(state_dir: &PathBuf, older_than_secs: u64, script: ScriptPreset) -> Result<()> {
    let engine = Arc::new(open_engine(state_dir, demo_registry(script))?);
    let recovery = RecoveryManager::new(engine, Duration::from_secs(older_than_secs))
        .context("Invalid liveness threshold")?;

    let report = recovery.sweep().await.context("Sweep failed")?;
    println!(
        "examined {} stale run(s): {} resumed, {} abandoned",
        report.examined,
        report.resumed(),
        report.abandoned(),
    );
    for (run_id, outcome) in &report.outcomes {
        let line = match outcome {
            RecoveryOutcome::Skipped { reason } => format!("skipped ({reason})"),
            RecoveryOutcome::Resumed { status } => format!("resumed -> {status}"),
            RecoveryOutcome::MarkedAbandoned => "abandoned".to_string(),
            RecoveryOutcome::Errored { error } => format!("error: {error}"),
        };
        println!("  {run_id}  {line}");
    }
    Ok(())
}
