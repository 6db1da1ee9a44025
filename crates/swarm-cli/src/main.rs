//! swarm CLI - parallel coding-agent orchestration
//!
//! Usage:
//!   swarm init                  Write .swarm/config.toml
//!   swarm plan <objective>      Plan a run without executing it
//!   swarm run <objective>       Plan, execute, integrate and deliver
//!   swarm resume                Continue the active run
//!   swarm approve               Approve the checkpoint the run is paused at
//!   swarm abort                 Abort the active run
//!   swarm cleanup <run-id>      Remove a finished run's worktrees and branches
//!   swarm cleanup <run-id> --worker <id>
//!                               Remove one worker's worktree, keep its branch
//!   swarm status                Show the active (or latest) run
//!
//! Exit codes: 0 success, 1 pipeline failure, 2 validation error,
//! 3 run paused awaiting approval.

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::{Parser, Subcommand, ValueEnum};
use std::io::{IsTerminal, Write};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use swarm_agent::ClaudeCli;
use swarm_core::{
    Checkpoint, ErrorKind, OversightPolicy, Run, RunId, RunStatus, SwarmConfig, SwarmError,
};
use swarm_orchestrator::{Approver, Capabilities, Orchestrator};
use swarm_vcs::{GitCommand, VcsExecutor};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "swarm")]
#[command(author, version, about = "Parallel coding-agent orchestration")]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Repository path (defaults to current directory)
    #[arg(long, global = true, default_value = ".")]
    repo: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write the default configuration to .swarm/config.toml
    Init,

    /// Decompose an objective into a plan and persist it as the active run
    Plan {
        objective: String,

        #[command(flatten)]
        overrides: Overrides,
    },

    /// Plan and drive a run as far as the oversight policy allows
    Run {
        objective: String,

        #[command(flatten)]
        overrides: Overrides,
    },

    /// Continue the active run from wherever it stopped
    Resume,

    /// Approve the checkpoint the active run is paused at
    Approve,

    /// Abort the active run
    Abort,

    /// Remove worktrees, branches and coordination artifacts of a finished run
    Cleanup {
        /// Run ID (omit with --all)
        run_id: Option<String>,

        /// Remove every swarm worktree and branch
        #[arg(long, conflicts_with = "run_id")]
        all: bool,

        /// Only remove this worker's worktree; its branch is kept
        #[arg(long, requires = "run_id", conflicts_with = "all")]
        worker: Option<String>,
    },

    /// Show a run (the active one, else the most recent)
    Status {
        run_id: Option<String>,

        /// Print the raw run record
        #[arg(long)]
        json: bool,
    },
}

/// Per-invocation overrides of .swarm/config.toml
#[derive(clap::Args, Default)]
struct Overrides {
    /// Maximum concurrently running workers
    #[arg(short = 'c', long)]
    concurrency: Option<usize>,

    /// Maximum tasks in the plan
    #[arg(long)]
    max_tasks: Option<usize>,

    /// Oversight policy for the run
    #[arg(long)]
    policy: Option<CliPolicy>,

    /// Ref worker branches start from
    #[arg(long)]
    base: Option<String>,
}

impl Overrides {
    fn apply(&self, mut config: SwarmConfig) -> swarm_core::Result<SwarmConfig> {
        if let Some(max) = self.concurrency {
            config = config.with_max_concurrency(max);
        }
        if let Some(max) = self.max_tasks {
            config.max_tasks = max;
        }
        if let Some(policy) = self.policy {
            config = config.with_policy(policy.into());
        }
        if let Some(base) = &self.base {
            config.base_branch = Some(base.clone());
        }
        config.validate()?;
        Ok(config)
    }
}

/// CLI-friendly oversight policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum CliPolicy {
    Autonomous,
    Gated,
    Checkpoint,
}

impl From<CliPolicy> for OversightPolicy {
    fn from(p: CliPolicy) -> Self {
        match p {
            CliPolicy::Autonomous => OversightPolicy::Autonomous,
            CliPolicy::Gated => OversightPolicy::Gated,
            CliPolicy::Checkpoint => OversightPolicy::Checkpoint,
        }
    }
}

/// Asks on the terminal; answers nothing when stdin is not interactive
struct StdinApprover;

#[async_trait]
impl Approver for StdinApprover {
    async fn confirm(
        &self,
        _run: &Run,
        checkpoint: Checkpoint,
        summary: &str,
    ) -> swarm_core::Result<Option<bool>> {
        if !std::io::stdin().is_terminal() {
            return Ok(None);
        }

        println!("\n{}", summary);
        print!("Proceed past {}? [Y/n] ", checkpoint);
        std::io::stdout().flush()?;

        let mut line = String::new();
        let read = BufReader::new(tokio::io::stdin()).read_line(&mut line).await?;
        if read == 0 {
            return Ok(None);
        }
        Ok(parse_answer(&line))
    }
}

fn parse_answer(line: &str) -> Option<bool> {
    match line.trim().to_lowercase().as_str() {
        "" | "y" | "yes" => Some(true),
        "n" | "no" => Some(false),
        _ => None,
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    match dispatch(cli).await {
        Ok(code) => code,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::from(exit_code_for(&e))
        }
    }
}

async fn dispatch(cli: Cli) -> Result<ExitCode> {
    let executor = GitCommand::detect_from(&cli.repo)
        .await
        .context("Not in a git repository")?;
    let repo_root = executor.repo_root().clone();

    if let Commands::Init = cli.command {
        return cmd_init(&repo_root);
    }

    let config = SwarmConfig::load_or_default(&repo_root).context("Failed to load .swarm/config.toml")?;
    let config = match &cli.command {
        Commands::Plan { overrides, .. } | Commands::Run { overrides, .. } => {
            overrides.apply(config)?
        }
        _ => config,
    };

    let capabilities = Capabilities::from_cli(ClaudeCli::new(config.agent.clone()));
    let orchestrator = Orchestrator::new(Arc::new(executor), config, capabilities)
        .with_approver(Arc::new(StdinApprover));

    let token = orchestrator.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted; stopping agents");
            token.cancel();
        }
    });

    match cli.command {
        Commands::Init => Ok(ExitCode::SUCCESS),
        Commands::Plan { objective, .. } => {
            let run = orchestrator.plan(&objective).await.context("Planning failed")?;
            print_plan(&run);
            println!("\nNext: swarm resume");
            Ok(ExitCode::SUCCESS)
        }
        Commands::Run { objective, .. } => {
            let run = orchestrator.run(&objective).await.context("Run failed")?;
            Ok(report(&run))
        }
        Commands::Resume => {
            let run = orchestrator.resume().await.context("Resume failed")?;
            Ok(report(&run))
        }
        Commands::Approve => {
            let run = orchestrator.approve().await.context("Approve failed")?;
            Ok(report(&run))
        }
        Commands::Abort => {
            let run = orchestrator.abort().await.context("Abort failed")?;
            println!("Aborted run {}", run.run_id);
            println!("Worktrees are kept; remove them with: swarm cleanup {}", run.run_id);
            Ok(ExitCode::SUCCESS)
        }
        Commands::Cleanup {
            run_id,
            all,
            worker,
        } => cmd_cleanup(&orchestrator, run_id, all, worker).await,
        Commands::Status { run_id, json } => {
            let run_id = run_id.as_deref().map(RunId::from);
            match orchestrator.status(run_id.as_ref()).await? {
                Some(run) if json => println!("{}", serde_json::to_string_pretty(&run)?),
                Some(run) => print_run(&run),
                None => println!("No runs recorded"),
            }
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn cmd_init(repo_root: &std::path::Path) -> Result<ExitCode> {
    let path = SwarmConfig::write_default(repo_root).context("Failed to write config")?;
    println!("Initialized swarm in {}", repo_root.display());
    println!("Config: {}", path.display());
    Ok(ExitCode::SUCCESS)
}

async fn cmd_cleanup(
    orchestrator: &Orchestrator<GitCommand>,
    run_id: Option<String>,
    all: bool,
    worker: Option<String>,
) -> Result<ExitCode> {
    if let (Some(id), Some(worker)) = (run_id.as_deref(), worker.as_deref()) {
        let removed = orchestrator
            .release_worker(&RunId::from(id), worker)
            .await?;
        if removed {
            println!("Removed worktree of {} (branch kept)", worker);
        } else {
            println!("No worktree on disk for {}", worker);
        }
        return Ok(ExitCode::SUCCESS);
    }

    let report = match (run_id, all) {
        (_, true) => orchestrator.cleanup_all().await?,
        (Some(id), false) => orchestrator.cleanup(&RunId::from(id.as_str())).await?,
        (None, false) => {
            return Err(SwarmError::Validation(
                "cleanup needs a run id or --all".to_string(),
            )
            .into())
        }
    };
    println!(
        "Removed {} worktrees and {} branches",
        report.worktrees_removed, report.branches_deleted
    );
    Ok(ExitCode::SUCCESS)
}

/// Print the run and map its status to an exit code
fn report(run: &Run) -> ExitCode {
    print_run(run);
    match run.status {
        RunStatus::Completed => ExitCode::SUCCESS,
        RunStatus::AwaitingApproval => {
            println!("\nPaused. Continue with: swarm approve  (or: swarm abort)");
            ExitCode::from(3)
        }
        _ => ExitCode::from(1),
    }
}

fn print_plan(run: &Run) {
    println!("Run {} planned on {}", run.run_id, run.base_ref);
    if let Some(plan) = &run.plan {
        for task in &plan.tasks {
            println!("  - {}: {}", task.id, task.display_title());
            if !task.coupled_with.is_empty() {
                let coupled: Vec<&str> = task.coupled_with.iter().map(String::as_str).collect();
                println!("      coupled with {}", coupled.join(", "));
            }
        }
    }
}

fn print_run(run: &Run) {
    println!("Run {}", run.run_id);
    println!("==========");
    println!("Objective: {}", run.objective);
    println!("Status:    {}", run.status);
    println!("Policy:    {}", run.oversight);
    println!("Base:      {}", run.base_ref);
    println!("Cost:      ${:.2} over {} attempts", run.cost.total_usd, run.cost.attempts);
    if let Some(checkpoint) = run.pending_checkpoint {
        println!("Waiting:   {}", checkpoint);
    }

    if !run.workers.is_empty() {
        println!("\nWorkers:");
        for worker in &run.workers {
            println!(
                "  {:<20} {:<10} attempts {} ({}) ${:.2}",
                worker.worker_id, worker.status, worker.attempts, worker.tier, worker.cost_usd
            );
            if let Some(reason) = worker.skip_reason.as_ref().or(worker.last_error.as_ref()) {
                println!("      {}", reason.lines().next().unwrap_or(reason));
            }
        }
    }

    if let Some(record) = &run.integration {
        println!("\nIntegration: {}", record.branch);
        println!("  merged:   {}", record.merged.join(", "));
        if !record.resolved.is_empty() {
            println!("  resolved: {}", record.resolved.join(", "));
        }
        if !record.findings.is_empty() {
            println!(
                "  findings: {}{}",
                record.findings.len(),
                if record.findings_fixed { " (fixed)" } else { "" }
            );
        }
        println!(
            "  checks:   {}",
            if record.checks_passed() { "passed" } else { "failed" }
        );
    }
    if let Some(delivery) = &run.delivery {
        println!("\nDelivered: {}", delivery);
    }
    if let Some(error) = &run.error {
        println!("\nError: {}", error);
    }
}

/// 2 for validation and configuration errors, 1 for anything else
fn exit_code_for(err: &anyhow::Error) -> u8 {
    let kind = err
        .chain()
        .find_map(|cause| cause.downcast_ref::<SwarmError>())
        .map(SwarmError::kind);
    match kind {
        Some(ErrorKind::Validation) => 2,
        _ => 1,
    }
}
