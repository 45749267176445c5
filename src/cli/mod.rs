//! Command-line interface for stagecoach.
//!
//! Provides commands for starting runs, checking status, deciding
//! approvals, aborting, replaying and recovering runs, and diagnosing the
//! store transport.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::Value;
use tokio::net::TcpListener;
use tracing::info;

use crate::agents::AgentRegistry;
use crate::config::Settings;
use crate::controller::{RunController, RunView};
use crate::core::stages::Workflow;
use crate::domain::RunStatus;
use crate::store::{binary, MemoryStore, StoreClientFactory};

/// stagecoach - checkpointed multi-stage agent workflows
#[derive(Parser, Debug)]
#[command(name = "stagecoach")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Workflow definition (overrides config and STAGECOACH_WORKFLOW)
    #[arg(short, long, global = true, env = "STAGECOACH_WORKFLOW")]
    pub workflow: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start a run and drive it until it completes or pauses
    Start {
        /// Subject the run is for (e.g. a brand key)
        subject_key: String,

        /// Run parameters as a JSON object
        #[arg(short, long, default_value = "{}")]
        params: String,

        /// Give up waiting after this many seconds
        #[arg(long, default_value = "3600")]
        timeout: u64,
    },

    /// Check the status of a run
    Status {
        /// Run ID (UUID)
        run_id: String,

        /// Print the full run view as JSON
        #[arg(long)]
        json: bool,
    },

    /// List known runs
    Runs {
        /// Maximum number of runs to show
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },

    /// Decide a pending approval
    Approve {
        /// Run ID awaiting approval
        run_id: String,

        /// approve, reject or revise
        #[arg(short, long, default_value = "approve")]
        decision: String,

        /// Reviewer notes
        #[arg(short, long)]
        notes: Option<String>,

        /// Who is deciding
        #[arg(long, env = "USER")]
        decider: Option<String>,

        /// Stage name or index to resume at (revise only)
        #[arg(long)]
        revise_to: Option<String>,

        /// Give up waiting after this many seconds
        #[arg(long, default_value = "3600")]
        timeout: u64,
    },

    /// Abort a running or paused run
    Abort {
        /// Run ID to abort
        run_id: String,
    },

    /// Re-execute a run from a stage as a new run
    Replay {
        /// Source run ID
        run_id: String,

        /// Stage name or index to replay from
        #[arg(long)]
        from: String,

        /// Give up waiting after this many seconds
        #[arg(long, default_value = "3600")]
        timeout: u64,
    },

    /// Resume a run after a restart from its latest checkpoint
    Resume {
        /// Run ID to resume
        run_id: String,

        /// Give up waiting after this many seconds
        #[arg(long, default_value = "3600")]
        timeout: u64,
    },

    /// Probe the store transports and show the decision
    Probe,

    /// Validate the workflow definition and agent configuration
    Validate,

    /// Show the journal of a run
    History {
        /// Run ID (UUID)
        run_id: String,
    },

    /// Show resolved configuration (debug)
    Config,

    /// Serve an in-memory store over the binary transport (development)
    ServeStore {
        /// Address to bind to
        #[arg(short, long, default_value = "127.0.0.1:7400")]
        listen: String,
    },
}

impl Cli {
    /// Execute the CLI command
    pub async fn execute(self) -> Result<()> {
        let mut settings = Settings::load()?;
        if let Some(path) = self.workflow {
            settings.workflow_path = path;
        }

        match self.command {
            Commands::Start {
                subject_key,
                params,
                timeout,
            } => start_run(&settings, &subject_key, &params, timeout).await,
            Commands::Status { run_id, json } => show_status(&settings, &run_id, json).await,
            Commands::Runs { limit } => list_runs(&settings, limit).await,
            Commands::Approve {
                run_id,
                decision,
                notes,
                decider,
                revise_to,
                timeout,
            } => {
                approve_run(&settings, &run_id, &decision, notes, decider, revise_to, timeout).await
            }
            Commands::Abort { run_id } => abort_run(&settings, &run_id).await,
            Commands::Replay {
                run_id,
                from,
                timeout,
            } => replay_run(&settings, &run_id, &from, timeout).await,
            Commands::Resume { run_id, timeout } => resume_run(&settings, &run_id, timeout).await,
            Commands::Probe => probe(&settings).await,
            Commands::Validate => validate(&settings),
            Commands::History { run_id } => show_history(&settings, &run_id).await,
            Commands::Config => show_config(&settings),
            Commands::ServeStore { listen } => serve_store(&listen).await,
        }
    }
}

fn controller(settings: &Settings) -> Result<RunController> {
    RunController::from_settings(settings).with_context(|| {
        format!(
            "Failed to set up orchestrator (workflow: {})",
            settings.workflow_path.display()
        )
    })
}

/// Start a run and wait until it settles
async fn start_run(settings: &Settings, subject_key: &str, params: &str, timeout: u64) -> Result<()> {
    let params: Value = serde_json::from_str(params).context("--params is not valid JSON")?;

    let controller = controller(settings)?;
    let reaper = controller.spawn_expiry_reaper(Duration::from_secs(
        settings.approval.sweep_interval_seconds,
    ));

    let run_id = controller.start_run(subject_key, params).await?;
    eprintln!("[Run {} started]", run_id);

    let view = controller
        .wait_settled(&run_id.to_string(), Duration::from_secs(timeout))
        .await?;
    controller.shutdown();
    reaper.await.ok();

    report_settled(&view)
}

/// Show the status of a run
async fn show_status(settings: &Settings, run_id: &str, json: bool) -> Result<()> {
    let controller = controller(settings)?;
    let view = controller.get_run(run_id).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&view)?);
        return Ok(());
    }

    println!("Run ID: {}", view.run_id);
    println!("Subject: {}", view.subject_key);
    println!("Status: {}", view.status);
    println!(
        "Current stage: {}",
        view.current_stage.as_deref().unwrap_or("(finished)")
    );
    println!("Revision: {}", view.revision);
    if view.checkpoint_degraded {
        println!("Checkpoints: degraded (held in memory only)");
    }
    if let Some(origin) = &view.replay_of {
        println!("Replay of: {} from stage {}", origin.run_id, origin.from_stage);
    }
    if let Some(error) = &view.error {
        println!("Error: [{}] {}", error.kind, error.message);
    }
    if let Some(approval) = &view.approval {
        println!("\nAwaiting approval (expires {}):", approval.expires_at);
        println!("{}", approval.summary);
    }

    println!("\nArtifacts:");
    if view.artifacts.is_empty() {
        println!("  (none)");
    }
    for (name, artifact) in &view.artifacts {
        println!(
            "  {} (stage {}, by {}, {} bytes)",
            name, artifact.stage_index, artifact.produced_by, artifact.size_bytes
        );
    }

    Ok(())
}

/// List known runs
async fn list_runs(settings: &Settings, limit: usize) -> Result<()> {
    let controller = controller(settings)?;
    let runs = controller.list_runs().await?;

    if runs.is_empty() {
        println!("No runs found");
        return Ok(());
    }

    println!("{:<38} {:<20} {:<18} {:<15}", "RUN ID", "SUBJECT", "STATUS", "STAGE");
    println!("{}", "-".repeat(93));

    for view in runs.iter().rev().take(limit) {
        println!(
            "{:<38} {:<20} {:<18} {:<15}",
            view.run_id,
            view.subject_key,
            view.status.as_str(),
            view.current_stage.as_deref().unwrap_or("-")
        );
    }

    Ok(())
}

/// Decide a pending approval and wait for the run to settle again
async fn approve_run(
    settings: &Settings,
    run_id: &str,
    decision: &str,
    notes: Option<String>,
    decider: Option<String>,
    revise_to: Option<String>,
    timeout: u64,
) -> Result<()> {
    let controller = controller(settings)?;
    let revise_to = revise_to
        .map(|stage| resolve_stage(controller.workflow(), &stage))
        .transpose()?;

    let decided = controller
        .submit_approval(run_id, decision, notes, decider, revise_to)
        .await?;
    eprintln!("[Approval {} recorded for run {}]", decided.decision, run_id);

    let view = controller
        .wait_settled(run_id, Duration::from_secs(timeout))
        .await?;
    report_settled(&view)
}

/// Abort a run
async fn abort_run(settings: &Settings, run_id: &str) -> Result<()> {
    let controller = controller(settings)?;
    let view = controller.abort_run(run_id).await?;

    eprintln!(
        "[Run {} aborted at stage {}]",
        view.run_id, view.current_stage_index
    );
    Ok(())
}

/// Replay a run from a stage
async fn replay_run(settings: &Settings, run_id: &str, from: &str, timeout: u64) -> Result<()> {
    let controller = controller(settings)?;
    let from_stage = resolve_stage(controller.workflow(), from)?;

    let new_id = controller.replay_run(run_id, from_stage).await?;
    eprintln!("[Run {} replaying {} from stage {}]", new_id, run_id, from_stage);

    let view = controller
        .wait_settled(&new_id.to_string(), Duration::from_secs(timeout))
        .await?;
    report_settled(&view)
}

/// Resume a run after a restart
async fn resume_run(settings: &Settings, run_id: &str, timeout: u64) -> Result<()> {
    let controller = controller(settings)?;
    let view = controller.recover_run(run_id).await?;
    eprintln!(
        "[Run {} recovered at stage {} ({})]",
        view.run_id, view.current_stage_index, view.status
    );

    let view = controller
        .wait_settled(run_id, Duration::from_secs(timeout))
        .await?;
    report_settled(&view)
}

/// Probe the store transports
async fn probe(settings: &Settings) -> Result<()> {
    let stores = StoreClientFactory::from_settings(&settings.store, &settings.probe)
        .context("Failed to build store clients")?;

    let Some(probe) = stores.probe() else {
        println!("Store backend is in-memory; no transport to probe");
        return Ok(());
    };

    let decision = probe.probe_now().await;
    println!("Transport: {}", decision.mode);
    if let Some(latency) = decision.measured_latency {
        println!("Latency: {}ms", latency.as_millis());
    }
    println!("Valid for: {}s", decision.ttl.as_secs());
    println!("Reason: {}", decision.report.reason);
    println!("\nSteps ({}ms):", decision.report.elapsed_ms);
    for step in &decision.report.steps {
        println!("  {}", serde_json::to_string(step)?);
    }

    Ok(())
}

/// Validate the workflow and agents
fn validate(settings: &Settings) -> Result<()> {
    let workflow = Workflow::from_file(&settings.workflow_path)?;
    workflow.validate()?;
    workflow.validate_agents(&AgentRegistry::from_specs(&settings.agents))?;

    println!(
        "Workflow '{}' is valid ({} stages)",
        workflow.name,
        workflow.len()
    );
    for (i, stage) in workflow.stages.iter().enumerate() {
        let executor = match &stage.agent {
            Some(agent) => format!("agent {}", agent),
            None => "approval".to_string(),
        };
        println!("  {}. {} ({})", i, stage.name, executor);
    }

    Ok(())
}

/// Show the journal of a run
async fn show_history(settings: &Settings, run_id: &str) -> Result<()> {
    let controller = controller(settings)?;
    let events = controller.history(run_id).await?;

    if events.is_empty() {
        println!("No journal entries for run {}", run_id);
        return Ok(());
    }

    for event in events {
        let stage = event
            .stage_index
            .map(|i| format!("[{}]", i))
            .unwrap_or_default();
        let error = event
            .error
            .map(|e| format!(" ({})", e))
            .unwrap_or_default();
        println!(
            "{} {:?}{} {}{}",
            event.timestamp.format("%Y-%m-%d %H:%M:%S"),
            event.event_type,
            stage,
            event.summary,
            error
        );
    }

    Ok(())
}

fn show_config(settings: &Settings) -> Result<()> {
    println!("stagecoach configuration");
    println!();
    println!(
        "Config file: {}",
        settings
            .config_file
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "(none - using defaults)".to_string())
    );
    println!();
    println!("Paths:");
    println!("  Home:     {}", settings.home.display());
    println!("  Workflow: {}", settings.workflow_path.display());
    println!(
        "  Runs:     {}{}",
        settings.runs_dir().display(),
        if settings.journal { "" } else { " (journal disabled)" }
    );
    println!();
    println!("Store:");
    println!("  Backend:  {:?}", settings.store.backend);
    println!(
        "  Binary:   {}",
        settings.store.binary_endpoint.as_deref().unwrap_or("(not configured)")
    );
    println!(
        "  Text:     {}",
        settings.store.text_endpoint.as_deref().unwrap_or("(not configured)")
    );
    println!("  Probe budget: {}ms", settings.probe.budget().as_millis());
    println!();
    println!("Execution:");
    println!("  Timeout:        {}s", settings.execution.timeout_seconds);
    println!("  Max retries:    {}", settings.execution.max_retries);
    println!("  Max tool calls: {}", settings.execution.max_tool_calls);
    println!("  Checkpoint failures: {:?}", settings.checkpoint.on_failure);
    println!("  Approval wait:  {}s", settings.approval.max_wait_seconds);
    println!();
    println!("Agents:");
    if settings.agents.is_empty() {
        println!("  (none)");
    }
    for (name, spec) in &settings.agents {
        println!("  {}: {} {}", name, spec.command, spec.args.join(" "));
    }

    Ok(())
}

/// Serve an in-memory store over the binary transport
async fn serve_store(listen: &str) -> Result<()> {
    let listener = TcpListener::bind(listen)
        .await
        .with_context(|| format!("Failed to bind {}", listen))?;
    info!(address = listen, "serving in-memory store over the binary transport");

    binary::serve(listener, Arc::new(MemoryStore::new()))
        .await
        .context("Store server stopped")
}

/// Stage given by name or index
fn resolve_stage(workflow: &Workflow, stage: &str) -> Result<usize> {
    if let Ok(index) = stage.parse::<usize>() {
        return Ok(index);
    }
    workflow
        .stage_index(stage)
        .with_context(|| format!("Unknown stage '{}'", stage))
}

/// Print the outcome of a settled run; failures exit non-zero
fn report_settled(view: &RunView) -> Result<()> {
    match view.status {
        RunStatus::Completed => {
            if let Some((name, artifact)) = view
                .artifacts
                .iter()
                .max_by_key(|(_, a)| (a.stage_index, a.created_at))
            {
                println!("{}", render(&artifact.content));
                eprintln!("\n[Run {} completed; last artifact: {}]", view.run_id, name);
            } else {
                eprintln!("\n[Run {} completed]", view.run_id);
            }
        }
        RunStatus::AwaitingApproval => {
            if let Some(approval) = &view.approval {
                println!("{}", approval.summary);
            }
            eprintln!(
                "\n[Run {} awaiting approval at stage {}; decide with `stagecoach approve {}`]",
                view.run_id,
                view.current_stage.as_deref().unwrap_or("?"),
                view.run_id
            );
        }
        RunStatus::Failed | RunStatus::Aborted => {
            let reason = view
                .error
                .as_ref()
                .map(|e| format!("[{}] {}", e.kind, e.message))
                .unwrap_or_default();
            eprintln!("\n[Run {} {}: {}]", view.run_id, view.status, reason);
            std::process::exit(1);
        }
        status => {
            eprintln!("\n[Run {} in state: {}]", view.run_id, status);
        }
    }

    Ok(())
}

fn render(content: &Value) -> String {
    match content {
        Value::String(text) => text.clone(),
        other => serde_json::to_string_pretty(other).unwrap_or_else(|_| other.to_string()),
    }
}
