//! # duetask — due-date driven task lifecycle
//!
//! Usage:
//!   duetask run                                        # Start the job runner
//!   duetask create --owner u1 --topic "Report" --due +15m
//!   duetask status <task-id> done                      # User-driven status change
//!   duetask edit <task-id> --topic "Report v2" --due +1d
//!   duetask show <task-id> | list --owner u1 | delete <task-id>
//!   duetask jobs                                       # Job counts per state
//!   duetask init                                       # Write a default config file

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use duetask_core::task::parse_due_date;
use duetask_core::{Clock, DuetaskConfig, NewTask, SystemClock, TaskStatus, TaskUpdate};
use duetask_scheduler::{
    JobKind, JobQueue, Notifier, SchedulerDb, SchedulerEngine, StatusTransitionWorker,
    TaskLifecycleOrchestrator, TaskStore,
};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "duetask",
    version,
    about = "⏰ duetask — due dates, overdue tracking and push reminders"
)]
struct Cli {
    /// Config file (default: ~/.duetask/config.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the job runner until Ctrl-C
    Run,
    /// Create a task and schedule its reminders
    Create {
        /// Owner (notification recipient) user ID
        #[arg(long)]
        owner: String,
        #[arg(long)]
        topic: String,
        #[arg(long, default_value = "")]
        description: String,
        /// RFC 3339 timestamp or offset like +15m, +2h, +1d
        #[arg(long)]
        due: String,
    },
    /// Set a task's status (to_do, in_progress, overdue, done)
    Status { id: String, status: String },
    /// Edit a task's topic, description or due date
    Edit {
        id: String,
        #[arg(long)]
        topic: Option<String>,
        #[arg(long)]
        description: Option<String>,
        /// RFC 3339 timestamp or offset like +15m, +2h, +1d
        #[arg(long)]
        due: Option<String>,
    },
    /// Show a task and its scheduled jobs
    Show { id: String },
    /// List tasks for an owner
    List {
        #[arg(long)]
        owner: String,
    },
    /// Delete a task (its jobs become no-ops)
    Delete { id: String },
    /// Show job counts per delivery state
    Jobs,
    /// Write the effective config to the config path
    Init,
}

fn load_config(path: Option<&PathBuf>) -> Result<DuetaskConfig> {
    let config = match path {
        Some(p) => DuetaskConfig::load_from(p)
            .with_context(|| format!("loading {}", p.display()))?
            .with_env_overrides(),
        None => DuetaskConfig::load()?,
    };
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        "duetask=debug,duetask_scheduler=debug"
    } else {
        "duetask=info,duetask_scheduler=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .with_target(false)
        .init();

    let config = load_config(cli.config.as_ref())?;

    if let Command::Init = cli.command {
        let path = cli.config.clone().unwrap_or_else(DuetaskConfig::default_path);
        config.save_to(&path)?;
        println!("✅ Config written to {}", path.display());
        return Ok(());
    }

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let db_path = config.database.resolved_path();
    let db = Arc::new(
        SchedulerDb::open(&db_path)
            .with_context(|| format!("opening database {}", db_path.display()))?,
    );
    let notifier = Arc::new(Notifier::from_config(&config.push)?);

    match cli.command {
        Command::Run => {
            let worker = Arc::new(StatusTransitionWorker::new(
                db.clone(),
                notifier.clone(),
                clock.clone(),
            ));
            let mut engine = SchedulerEngine::new(db.clone(), clock.clone(), &config.scheduler);
            engine.register(JobKind::Warn, worker.clone());
            engine.register(JobKind::Overdue, worker);

            tracing::info!(db = %db_path.display(), "duetask runner starting");
            Arc::new(engine)
                .run(async {
                    tokio::signal::ctrl_c().await.ok();
                })
                .await;
        }
        Command::Create {
            owner,
            topic,
            description,
            due,
        } => {
            let due_date = parse_due_date(&due, clock.now())?;
            let orchestrator = TaskLifecycleOrchestrator::new(
                db.clone(),
                db.clone(),
                notifier,
                clock.clone(),
                config.scheduler.warn_window(),
            );
            let (task, report) = orchestrator
                .create_task(
                    NewTask {
                        topic,
                        description,
                        due_date,
                    },
                    &owner,
                )
                .await?;

            // Short-lived process: give the assigned notice a chance to go out.
            let wait = config.push.timeout() + std::time::Duration::from_secs(1);
            let notified = matches!(
                tokio::time::timeout(wait, report.assigned_notice).await,
                Ok(Ok(true))
            );

            println!("✅ Task created: {}", task.id);
            println!("   Due:      {}", task.due_date.to_rfc3339());
            println!("   Warn in:  {}s", report.delays.warn.num_seconds());
            println!("   Overdue:  {}s", report.delays.overdue.num_seconds());
            if report.warn_job.is_none() || report.overdue_job.is_none() {
                println!("   ⚠️  Some reminders could not be scheduled (see log)");
            }
            if !notified {
                println!("   (assigned notice not delivered)");
            }
        }
        Command::Status { id, status } => {
            let status: TaskStatus = status.parse()?;
            match db.update_status(&id, status).await? {
                Some(task) => println!("✅ {} → {}", task.id, task.status),
                None => anyhow::bail!("task not found: {id}"),
            }
        }
        Command::Edit {
            id,
            topic,
            description,
            due,
        } => {
            let update = TaskUpdate {
                topic,
                description,
                due_date: due.map(|d| parse_due_date(&d, clock.now())).transpose()?,
            };
            if update.is_empty() {
                anyhow::bail!("nothing to edit: pass --topic, --description or --due");
            }
            let rescheduled = update.due_date.is_some();
            let task = db
                .update(&id, update)
                .await?
                .with_context(|| format!("task not found: {id}"))?;
            println!("✅ Task updated: {}", task.id);
            println!("   Due:      {}", task.due_date.to_rfc3339());
            if rescheduled {
                println!("   (reminders keep their original schedule)");
            }
        }
        Command::Show { id } => {
            let task = db
                .find_by_id(&id)
                .await?
                .with_context(|| format!("task not found: {id}"))?;
            println!("{}", serde_json::to_string_pretty(&task)?);
            for job in db.jobs_for_task(&id)? {
                println!(
                    "  {:<8} {:<10} fire_at={} attempts={}{}",
                    job.kind,
                    job.state.as_str(),
                    job.fire_at.to_rfc3339(),
                    job.attempts,
                    job.last_error
                        .as_deref()
                        .map(|e| format!(" last_error={e}"))
                        .unwrap_or_default()
                );
            }
        }
        Command::List { owner } => {
            let tasks = db.list_for_owner(&owner).await?;
            if tasks.is_empty() {
                println!("No tasks for {owner}");
            }
            for task in tasks {
                println!(
                    "{}  {:<12} {}  {}",
                    task.id,
                    task.status.as_str(),
                    task.due_date.format("%Y-%m-%d %H:%M"),
                    task.topic
                );
            }
        }
        Command::Delete { id } => {
            if db.delete(&id).await? {
                println!("🗑️  Deleted {id}");
            } else {
                anyhow::bail!("task not found: {id}");
            }
        }
        Command::Jobs => {
            let counts = db.counts().await?;
            println!("{}", serde_json::to_string_pretty(&counts)?);
        }
        Command::Init => {}
    }

    Ok(())
}
