use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use grove::cleanup::{CleanupConfig, CleanupManager};
use grove::config::{load_task_specs, OrchestratorConfig};
use grove::core::{TaskId, TaskStatus, WorkerId};
use grove::git::GitOps;
use grove::orchestration::signal::write_signal_file;
use grove::orchestration::{ExecutionSignal, Scheduler, SchedulerEvent, SignalKind};
use grove::registry::{CoordinationRegistry, ListFilter, RegistryEntry};
use grove::{glog, Error, Result};

/// Grove - run dependent tasks in parallel, isolated git worktrees
#[derive(Parser, Debug)]
#[command(name = "grove")]
#[command(version, about, long_about = None)]
#[command(after_help = "ENVIRONMENT:\n    GROVE_DEBUG=1     Enable debug logging (alternative to --debug)\n    GROVE_LOG=LEVEL   Log threshold: error, warn, info, debug or trace")]
pub struct Cli {
    /// Enable debug logging (writes to <state dir>/grove.log)
    #[arg(short = 'd', long, global = true)]
    pub debug: bool,

    /// Config file (default: ~/.grove/grove.toml)
    #[arg(short = 'c', long, global = true)]
    pub config: Option<PathBuf>,

    /// Repository to orchestrate (default: current directory)
    #[arg(short = 'r', long, global = true)]
    pub repo: Option<PathBuf>,

    /// Directory for registry, signals and worktrees
    #[arg(long, global = true)]
    pub state_dir: Option<PathBuf>,

    /// Print machine-readable JSON
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Schedule a task list until every task is merged, failed or cancelled
    Run {
        /// Task list (.json or .toml)
        tasks: PathBuf,

        /// Maximum concurrently running workspaces
        #[arg(short = 'j', long)]
        max_concurrent: Option<usize>,

        /// Branch completed work is merged into
        #[arg(long)]
        target_branch: Option<String>,

        /// Default per-task deadline in seconds
        #[arg(long)]
        deadline_secs: Option<u64>,

        /// Run a single tick and exit
        #[arg(long)]
        once: bool,
    },

    /// List registry entries
    Status {
        /// Only entries with this status
        #[arg(short = 's', long)]
        status: Option<TaskStatus>,

        /// Include archived attempts
        #[arg(short = 'a', long)]
        all: bool,
    },

    /// Show the registry entry for a task
    Query {
        task_id: String,

        /// Show every attempt
        #[arg(long)]
        history: bool,
    },

    /// Print the workspace path of a running task
    Where { task_id: String },

    /// List tasks owned by a worker
    Owner { worker_id: WorkerId },

    /// Report a worker result to the running scheduler
    Signal {
        task_id: String,

        /// started, success, failure or cancel
        #[arg(value_parser = parse_signal_kind)]
        result: SignalKind,

        #[arg(short = 'm', long)]
        summary: Option<String>,

        /// Worker id; stale workers' signals are ignored
        #[arg(short = 'w', long)]
        worker: Option<WorkerId>,
    },

    /// Withdraw a task from the running scheduler
    Cancel { task_id: String },

    /// Rewrite the registry journal, dropping superseded records
    Compact,

    /// Find leftover worktrees and task branches
    Cleanup {
        /// Actually delete (default: just report)
        #[arg(long)]
        delete: bool,

        /// Also consider branches of merged and cancelled tasks
        #[arg(long)]
        branches: bool,
    },
}

fn parse_signal_kind(s: &str) -> std::result::Result<SignalKind, String> {
    match s {
        "started" => Ok(SignalKind::Started),
        "success" => Ok(SignalKind::Success),
        "failure" => Ok(SignalKind::Failure),
        "cancel" => Ok(SignalKind::Cancel),
        other => Err(format!(
            "unknown signal '{}' (expected started, success, failure or cancel)",
            other
        )),
    }
}

fn main() {
    let cli = Cli::parse();
    if let Err(e) = run(cli) {
        eprintln!("error: {}", e);
        std::process::exit(if e.is_configuration() { 2 } else { 1 });
    }
}

fn run(cli: Cli) -> Result<()> {
    let mut config = match &cli.config {
        Some(path) => OrchestratorConfig::load_from(path)?,
        None => OrchestratorConfig::load()?,
    };
    if let Some(dir) = &cli.state_dir {
        config.state_dir = Some(dir.to_string_lossy().to_string());
    }
    grove::log::init_in(&config.state_dir()?, cli.debug);
    if cli.debug {
        glog!("Grove starting (debug mode enabled)");
    }

    let repo_path = match &cli.repo {
        Some(path) => path.clone(),
        None => std::env::current_dir()?,
    };

    match cli.command {
        Command::Run {
            tasks,
            max_concurrent,
            target_branch,
            deadline_secs,
            once,
        } => {
            if let Some(n) = max_concurrent {
                config.max_concurrent = n;
            }
            if let Some(branch) = target_branch {
                config.target_branch = branch;
            }
            if deadline_secs.is_some() {
                config.default_deadline_secs = deadline_secs;
            }
            run_tasks(config, &repo_path, &tasks, once, cli.json)
        }
        Command::Status { status, all } => run_status(&config, status, all, cli.json),
        Command::Query { task_id, history } => run_query(&config, &task_id, history, cli.json),
        Command::Where { task_id } => run_where(&config, &task_id),
        Command::Owner { worker_id } => run_owner(&config, worker_id, cli.json),
        Command::Signal {
            task_id,
            result,
            summary,
            worker,
        } => {
            let mut signal = match result {
                SignalKind::Started => ExecutionSignal::started(task_id.as_str()),
                SignalKind::Success => ExecutionSignal::success(task_id.as_str(), ""),
                SignalKind::Failure => ExecutionSignal::failure(task_id.as_str(), ""),
                SignalKind::Cancel => ExecutionSignal::cancel(task_id.as_str()),
            };
            signal.summary = summary;
            if let Some(worker) = worker {
                signal = signal.from_worker(worker);
            }
            run_signal(&config, &signal)
        }
        Command::Cancel { task_id } => {
            run_signal(&config, &ExecutionSignal::cancel(task_id.as_str()))
        }
        Command::Compact => {
            let registry = open_registry(&config)?;
            let kept = registry.compact()?;
            println!("Registry compacted: {} record(s) kept", kept);
            Ok(())
        }
        Command::Cleanup { delete, branches } => {
            run_cleanup(&config, &repo_path, delete, branches, cli.json)
        }
    }
}

fn open_registry(config: &OrchestratorConfig) -> Result<CoordinationRegistry> {
    CoordinationRegistry::open(&config.registry_path()?)
}

/// Submit the task list and drive the scheduler until it finishes.
fn run_tasks(
    config: OrchestratorConfig,
    repo_path: &Path,
    tasks_file: &Path,
    once: bool,
    json: bool,
) -> Result<()> {
    glog!(
        "Run command: tasks={}, repo={}, once={}",
        tasks_file.display(),
        repo_path.display(),
        once
    );
    let specs = load_task_specs(tasks_file)?;
    let interval = config.tick_interval();

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let (event_tx, mut event_rx) = mpsc::channel::<SchedulerEvent>(1024);
        let mut scheduler = Scheduler::open(config, repo_path, event_tx)?;
        scheduler.submit(&specs)?;

        let printer = tokio::spawn(async move {
            while let Some(event) = event_rx.recv().await {
                print_event(&event, json);
            }
        });

        if once {
            scheduler.tick().await?;
        } else {
            let token = CancellationToken::new();
            let on_interrupt = token.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    on_interrupt.cancel();
                }
            });
            scheduler.run(interval, token).await?;
        }

        let summary: Vec<(TaskId, TaskStatus)> = scheduler
            .tasks()
            .iter()
            .map(|t| (t.id.clone(), t.status))
            .collect();
        let failed: Vec<TaskId> = summary
            .iter()
            .filter(|(_, status)| *status == TaskStatus::Failed)
            .map(|(id, _)| id.clone())
            .collect();
        let reports: Vec<String> = failed
            .iter()
            .filter_map(|id| scheduler.failure_report(id).ok())
            .filter(|r| r.propagated_from.is_none())
            .map(|r| r.to_string())
            .collect();
        drop(scheduler);
        let _ = printer.await;

        if json {
            let tasks: Vec<serde_json::Value> = summary
                .iter()
                .map(|(id, status)| serde_json::json!({ "id": id, "status": status }))
                .collect();
            println!("{}", serde_json::to_string_pretty(&serde_json::json!({ "tasks": tasks }))?);
        } else {
            println!();
            for (id, status) in &summary {
                println!("  {:<24} {}", id.as_str(), status);
            }
            for report in &reports {
                println!();
                println!("{}", report);
            }
        }
        Ok::<(), Error>(())
    })
}

fn print_event(event: &SchedulerEvent, json: bool) {
    if json {
        return;
    }
    match event {
        SchedulerEvent::TaskReady { .. } => {}
        SchedulerEvent::TaskAssigned {
            task_id,
            worker,
            path,
            branch,
        } => println!(
            "assigned  {} -> {} (worker {}, branch {})",
            task_id,
            path.display(),
            worker,
            branch
        ),
        SchedulerEvent::TaskStarted { task_id } => println!("started   {}", task_id),
        SchedulerEvent::TaskCompleted { task_id } => println!("completed {}", task_id),
        SchedulerEvent::TaskMerged { task_id, commit } => {
            println!("merged    {} at {}", task_id, &commit[..commit.len().min(8)])
        }
        SchedulerEvent::MergeConflict { task_id, files } => {
            println!("conflict  {} in {} file(s)", task_id, files.len());
            for file in files {
                println!("            {}", file.display());
            }
        }
        SchedulerEvent::TaskFailed { task_id, reason } => {
            println!("failed    {}: {}", task_id, reason)
        }
        SchedulerEvent::TaskCancelled { task_id } => println!("cancelled {}", task_id),
        SchedulerEvent::AllTasksFinished => println!("all tasks finished"),
    }
}

fn print_entries(entries: &[RegistryEntry], json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(entries)?);
        return Ok(());
    }
    if entries.is_empty() {
        println!("No matching tasks");
        return Ok(());
    }
    println!(
        "{:<24} {:<12} {:>7}  {:<10} {}",
        "TASK", "STATUS", "ATTEMPT", "OWNER", "SUMMARY"
    );
    for entry in entries {
        let owner = entry.owner.map(|w| w.short()).unwrap_or_else(|| "-".to_string());
        let mut summary = entry.summary.clone().unwrap_or_default();
        if let Some(culprit) = &entry.propagated_from {
            summary = format!("{} (caused by {})", summary, culprit);
        }
        if entry.cancel_requested && !entry.status.is_terminal() {
            summary = format!("{} [cancel requested]", summary);
        }
        println!(
            "{:<24} {:<12} {:>7}  {:<10} {}",
            entry.task_id.as_str(),
            entry.status.as_str(),
            entry.attempt,
            owner,
            summary.trim()
        );
    }
    Ok(())
}

fn run_status(
    config: &OrchestratorConfig,
    status: Option<TaskStatus>,
    all: bool,
    json: bool,
) -> Result<()> {
    let registry = open_registry(config)?;
    let mut filter = ListFilter::all();
    if let Some(status) = status {
        filter = filter.with_status(status);
    }
    if all {
        filter = filter.including_archived();
    }
    print_entries(&registry.list(&filter), json)
}

fn run_query(config: &OrchestratorConfig, task_id: &str, history: bool, json: bool) -> Result<()> {
    let registry = open_registry(config)?;
    let task_id = TaskId::from(task_id);
    let entries = if history {
        registry.history(&task_id)
    } else {
        vec![registry.query(&task_id)?]
    };
    if entries.is_empty() {
        return Err(Error::NotFound(format!("task {}", task_id)));
    }
    if json || history {
        return print_entries(&entries, json);
    }

    let entry = &entries[0];
    println!("  Task:        {} ({})", entry.task_id, entry.label);
    println!("  Status:      {}", entry.status);
    println!("  Attempt:     {}", entry.attempt);
    if let Some(owner) = entry.owner {
        println!("  Owner:       {}", owner);
    }
    if let Some(ws) = &entry.workspace {
        println!("  Workspace:   {}", ws.path.display());
        println!("  Branch:      {}", ws.branch);
        println!("  Base:        {}", ws.base_revision);
    }
    if !entry.dependencies.is_empty() {
        let deps: Vec<&str> = entry.dependencies.iter().map(TaskId::as_str).collect();
        println!("  Depends on:  {}", deps.join(", "));
    }
    if let Some(summary) = &entry.summary {
        println!("  Summary:     {}", summary);
    }
    if let Some(culprit) = &entry.propagated_from {
        println!("  Caused by:   {}", culprit);
    }
    println!("  Updated:     {}", entry.updated_at.format("%Y-%m-%d %H:%M:%S UTC"));
    Ok(())
}

fn run_where(config: &OrchestratorConfig, task_id: &str) -> Result<()> {
    let registry = open_registry(config)?;
    let task_id = TaskId::from(task_id);
    let entry = registry
        .active(&task_id)
        .filter(|e| e.status.holds_workspace())
        .ok_or_else(|| Error::NotFound(format!("no workspace for task {}", task_id)))?;
    let ws = entry
        .workspace
        .ok_or_else(|| Error::NotFound(format!("no workspace for task {}", task_id)))?;
    println!("{}", ws.path.display());
    Ok(())
}

fn run_owner(config: &OrchestratorConfig, worker: WorkerId, json: bool) -> Result<()> {
    let registry = open_registry(config)?;
    print_entries(&registry.query_by_owner(worker), json)
}

fn run_signal(config: &OrchestratorConfig, signal: &ExecutionSignal) -> Result<()> {
    signal.task_id.validate()?;
    let path = write_signal_file(&config.signals_dir()?, signal)?;
    glog!("Signal {:?} for {} queued at {}", signal.result, signal.task_id, path.display());
    println!("Queued {:?} for {}", signal.result, signal.task_id);
    Ok(())
}

fn run_cleanup(
    config: &OrchestratorConfig,
    repo_path: &Path,
    delete: bool,
    branches: bool,
    json: bool,
) -> Result<()> {
    glog!("Cleanup command: delete={}, branches={}", delete, branches);
    let registry = open_registry(config)?;
    let manager = CleanupManager::new(
        GitOps::new(repo_path)?,
        &config.worktrees_dir()?,
        &config.branch_prefix,
        CleanupConfig {
            remove: delete,
            delete_finished_branches: branches,
            ..Default::default()
        },
    );
    let report = manager.run(&registry)?;

    if json {
        let value = serde_json::json!({
            "orphaned": report.orphaned,
            "removed": report.removed,
            "pruned": report.pruned,
            "staleBranches": report.stale_branches,
            "deletedBranches": report.deleted_branches,
            "failed": report.failed,
        });
        println!("{}", serde_json::to_string_pretty(&value)?);
        return Ok(());
    }

    println!("Orphaned worktrees: {}", report.orphaned.len());
    for path in &report.orphaned {
        println!("   • {}", path.display());
    }
    if branches {
        println!("Stale branches: {}", report.stale_branches.len());
        for branch in &report.stale_branches {
            println!("   • {}", branch);
        }
    }
    if report.is_clean() && report.removed.is_empty() {
        println!("Nothing to clean up");
        return Ok(());
    }
    if !delete {
        println!();
        println!("Run with --delete to remove them.");
        return Ok(());
    }
    println!();
    println!("  Worktrees removed:   {}", report.removed.len());
    println!("  Records pruned:      {}", report.pruned);
    println!("  Branches deleted:    {}", report.deleted_branches.len());
    for (what, error) in &report.failed {
        println!("  Failed: {} ({})", what, error);
    }
    Ok(())
}
