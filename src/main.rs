use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::{DateTime, Local, Utc};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

use cadence::catchup::CatchUpCandidate;
use cadence::config::{CadenceConfig, LoggingConfig};
use cadence::history::TriggeredBy;
use cadence::platform::{SchedulerError, SchedulerKind};
use cadence::runner::{OutcomeStatus, RunOutcome};
use cadence::schedule::{describe, next_occurrence_after};
use cadence::tasks::{ScheduledTask, TaskRegistry};
use cadence::App;

#[derive(Parser)]
#[command(
    name = "cadence",
    about = "Recurring tasks on the OS scheduler, with missed-run catch-up",
    version,
    long_about = None
)]
struct Cli {
    /// Config file (default: $CADENCE_CONFIG, then ~/.cadence/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// JSON output for machine parsing
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage task definitions
    Task {
        #[command(subcommand)]
        action: TaskAction,
    },

    /// Register tasks with the OS scheduler
    Schedule {
        #[command(subcommand)]
        action: ScheduleAction,
    },

    /// Find and re-run missed scheduled runs
    Catchup {
        #[command(subcommand)]
        action: CatchupAction,
    },

    /// Show recent runs, newest first
    History {
        /// Only show runs of this task
        #[arg(long)]
        task: Option<String>,

        /// Maximum number of runs to show
        #[arg(long, default_value = "20")]
        limit: usize,
    },

    /// Run a task now
    Run {
        /// Task name
        name: String,

        /// Invoked by the OS scheduler; skipped unless a slot is actually due
        #[arg(long)]
        scheduled: bool,
    },
}

#[derive(Subcommand)]
enum TaskAction {
    /// List all tasks
    List,

    /// Add a new task (disabled until `schedule enable`)
    Add {
        /// Task name
        name: String,

        /// Cron expression (5-field, or @hourly/@daily/...)
        #[arg(long)]
        schedule: String,

        /// Executor id handed to the executor program
        #[arg(long)]
        executor: String,

        /// Catch up missed runs when asked to reconcile
        #[arg(long)]
        catch_up: bool,

        /// Oldest missed slot, in seconds, still worth catching up
        #[arg(long, requires = "catch_up")]
        max_age: Option<u64>,

        /// Register with the OS scheduler right away
        #[arg(long)]
        enable: bool,
    },

    /// Change an existing task; enabled tasks are re-registered
    Update {
        /// Task name
        name: String,

        #[arg(long)]
        schedule: Option<String>,

        #[arg(long)]
        executor: Option<String>,

        #[arg(long)]
        catch_up: Option<bool>,

        #[arg(long)]
        max_age: Option<u64>,
    },

    /// Remove a task and its OS registration
    Remove {
        /// Task name
        name: String,
    },
}

#[derive(Subcommand)]
enum ScheduleAction {
    /// Register a task with the OS scheduler
    Enable {
        /// Task name
        name: String,
    },

    /// Remove a task's OS registration
    Disable {
        /// Task name
        name: String,
    },

    /// List entries registered with the OS scheduler
    List,
}

#[derive(Subcommand)]
enum CatchupAction {
    /// Tasks that missed a run
    List {
        /// Show the decision for every opted-in task
        #[arg(long)]
        all: bool,
    },

    /// Run missed tasks now
    Run {
        /// Candidates to run
        #[arg(required_unless_present = "all", conflicts_with = "all")]
        names: Vec<String>,

        /// Run every candidate
        #[arg(long)]
        all: bool,
    },
}

#[derive(Serialize)]
struct TaskView<'a> {
    #[serde(flatten)]
    task: &'a ScheduledTask,
    description: Option<String>,
    next_run: Option<DateTime<Utc>>,
    os_scheduled: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => CadenceConfig::load(path)?,
        None => CadenceConfig::load_or_default(),
    };
    init_tracing(&config.logging);

    let app = App::open(config)?;
    let json = cli.json;

    match cli.command {
        Commands::Task { action } => match action {
            TaskAction::List => list_tasks(&app, json).await?,
            TaskAction::Add {
                name,
                schedule,
                executor,
                catch_up,
                max_age,
                enable,
            } => {
                let mut task = ScheduledTask::new(&name, schedule, executor);
                if catch_up {
                    task = task.with_catch_up(max_age);
                }
                app.registry.add(&task).await?;
                println!("Task '{}' added.", name);
                if enable {
                    enable_task(&app, &name).await?;
                }
            }
            TaskAction::Update {
                name,
                schedule,
                executor,
                catch_up,
                max_age,
            } => {
                let mut task = require_task(&app.registry, &name).await?;
                if let Some(schedule) = schedule {
                    task.schedule = schedule;
                }
                if let Some(executor) = executor {
                    task.executor_id = executor;
                }
                if let Some(catch_up) = catch_up {
                    task.catch_up_on_startup = catch_up;
                }
                if max_age.is_some() {
                    task.max_catch_up_age_secs = max_age;
                }
                app.update_task(&task).await?;
                println!("Task '{}' updated.", name);
            }
            TaskAction::Remove { name } => {
                require_task(&app.registry, &name).await?;
                if app.port.is_scheduled(&name) {
                    app.port.unschedule(&name)?;
                }
                app.registry.remove(&name).await?;
                println!("Task '{}' removed.", name);
            }
        },
        Commands::Schedule { action } => match action {
            ScheduleAction::Enable { name } => enable_task(&app, &name).await?,
            ScheduleAction::Disable { name } => {
                require_task(&app.registry, &name).await?;
                app.registry.set_enabled(&name, false).await?;
                match app.port.unschedule(&name) {
                    Ok(()) => {}
                    Err(SchedulerError::NotScheduled { .. }) => {
                        tracing::warn!(task = %name, "Task was not registered with the OS scheduler");
                    }
                    Err(e) => return Err(e.into()),
                }
                println!("Task '{}' disabled.", name);
            }
            ScheduleAction::List => {
                let entries = app.port.list_scheduled()?;
                if json {
                    println!("{}", serde_json::to_string_pretty(&entries)?);
                } else if entries.is_empty() {
                    println!("No tasks registered with {}.", app.port.scheduler_kind());
                } else {
                    println!("{:<20} | {:<15} | Location", "Name", "Schedule");
                    println!("{:-<20}-|-{:-<15}-|-{:-<40}", "", "", "");
                    for entry in entries {
                        println!(
                            "{:<20} | {:<15} | {}",
                            entry.name,
                            entry.schedule.as_deref().unwrap_or("?"),
                            entry.location
                        );
                    }
                }
            }
        },
        Commands::Catchup { action } => {
            let catch_up = app.catch_up();
            let now = Local::now();
            match action {
                CatchupAction::List { all } => {
                    let list = if all {
                        catch_up.evaluate(&now).await?
                    } else {
                        catch_up.candidates(&now).await?
                    };
                    print_candidates(&list, json)?;
                }
                CatchupAction::Run { names, all } => {
                    let candidates = catch_up.candidates(&now).await?;
                    let selected: Vec<ScheduledTask> = if all {
                        candidates.into_iter().map(|c| c.task).collect()
                    } else {
                        for name in &names {
                            if !candidates.iter().any(|c| &c.task.name == name) {
                                tracing::warn!(task = %name, "Not a catch-up candidate, skipping");
                            }
                        }
                        candidates
                            .into_iter()
                            .filter(|c| names.contains(&c.task.name))
                            .map(|c| c.task)
                            .collect()
                    };

                    if selected.is_empty() {
                        println!("Nothing to catch up.");
                        return Ok(());
                    }

                    let report = catch_up.run_catch_up_for(&selected).await?;
                    print_outcomes(&report.outcomes, json)?;
                    let failed = report.failures().len();
                    if failed > 0 {
                        anyhow::bail!("{} of {} catch-up runs failed", failed, report.outcomes.len());
                    }
                }
            }
        }
        Commands::History { task, limit } => {
            let history = app.runner.history();
            let records = match &task {
                Some(name) => history.recent_for(name, limit),
                None => history.recent(limit),
            }
            .context("Failed to read run history")?;

            if json {
                println!("{}", serde_json::to_string_pretty(&records)?);
            } else if records.is_empty() {
                println!("No runs recorded.");
            } else {
                println!(
                    "{:<20} | {:<19} | {:<9} | {:<9} | Error",
                    "Task", "Started", "Status", "Trigger"
                );
                println!("{:-<20}-|-{:-<19}-|-{:-<9}-|-{:-<9}-|-{:-<20}", "", "", "", "", "");
                for r in records {
                    println!(
                        "{:<20} | {:<19} | {:<9} | {:<9} | {}",
                        r.task_name,
                        local_time(r.started_at),
                        r.status.to_string(),
                        r.triggered_by.to_string(),
                        r.error.as_deref().unwrap_or("")
                    );
                }
            }
        }
        Commands::Run { name, scheduled } => {
            let task = require_task(&app.registry, &name).await?;
            let outcome = if scheduled {
                if !task.enabled {
                    tracing::warn!(task = %name, "Scheduled trigger for a disabled task ignored");
                    return Ok(());
                }
                app.runner.run_scheduled(&task, &Local::now()).await
            } else {
                app.runner.run(&task, TriggeredBy::Manual).await
            };

            print_outcomes(std::slice::from_ref(&outcome), json)?;
            if let OutcomeStatus::Failed { error } = outcome.status {
                anyhow::bail!("Task '{}' failed: {}", name, error);
            }
        }
    }

    Ok(())
}

fn init_tracing(logging: &LoggingConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn require_task(registry: &TaskRegistry, name: &str) -> Result<ScheduledTask> {
    registry
        .get(name)
        .await?
        .with_context(|| format!("Task '{}' not found", name))
}

async fn enable_task(app: &App, name: &str) -> Result<()> {
    let mut task = require_task(&app.registry, name).await?;
    task.enabled = true;
    app.port.schedule(&task, app.schedule_options())?;
    app.registry.set_enabled(name, true).await?;
    println!(
        "Task '{}' enabled ({}).",
        name,
        describe(&task.schedule).unwrap_or_else(|| task.schedule.clone())
    );
    Ok(())
}

async fn list_tasks(app: &App, json: bool) -> Result<()> {
    let tasks = app.registry.list().await?;
    let now = Local::now();
    let os_known = app.port.scheduler_kind() != SchedulerKind::Unsupported;

    let views: Vec<TaskView<'_>> = tasks
        .iter()
        .map(|task| TaskView {
            task,
            description: describe(&task.schedule),
            next_run: next_occurrence_after(&task.schedule, &now).ok().flatten(),
            os_scheduled: os_known && app.port.is_scheduled(&task.name),
        })
        .collect();

    if json {
        println!("{}", serde_json::to_string_pretty(&views)?);
        return Ok(());
    }
    if views.is_empty() {
        println!("No tasks found.");
        return Ok(());
    }

    println!(
        "{:<20} | {:<30} | {:<16} | {:<7} | {:<8} | OS",
        "Name", "Schedule", "Next run", "Enabled", "Catch-up"
    );
    println!("{:-<20}-|-{:-<30}-|-{:-<16}-|-{:-<7}-|-{:-<8}-|-{:-<3}", "", "", "", "", "", "");
    for v in views {
        let schedule = v.description.unwrap_or_else(|| v.task.schedule.clone());
        let next = v.next_run.map(local_time).unwrap_or_else(|| "-".to_string());
        let catch_up = if v.task.catch_up_on_startup {
            format!("{}s", v.task.effective_max_age_secs())
        } else {
            "off".to_string()
        };
        let os = match (os_known, v.os_scheduled) {
            (false, _) => "-",
            (true, true) => "yes",
            (true, false) => "no",
        };
        println!(
            "{:<20} | {:<30} | {:<16} | {:<7} | {:<8} | {}",
            v.task.name, schedule, next, v.task.enabled, catch_up, os
        );
    }
    Ok(())
}

fn print_candidates(list: &[CatchUpCandidate], json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(list)?);
        return Ok(());
    }
    if list.is_empty() {
        println!("No missed runs.");
        return Ok(());
    }
    println!("{:<20} | {:<16} | {:<19} | Run", "Task", "Missed slot", "Reason");
    println!("{:-<20}-|-{:-<16}-|-{:-<19}-|-{:-<3}", "", "", "", "");
    for c in list {
        println!(
            "{:<20} | {:<16} | {:<19} | {}",
            c.task.name,
            c.decision
                .scheduled_at
                .map(local_time)
                .unwrap_or_else(|| "-".to_string()),
            c.decision.reason.to_string(),
            if c.decision.should_run { "yes" } else { "no" }
        );
    }
    Ok(())
}

fn print_outcomes(outcomes: &[RunOutcome], json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(outcomes)?);
        return Ok(());
    }
    for o in outcomes {
        match &o.status {
            OutcomeStatus::Completed => println!("{}: completed ({})", o.task_name, o.triggered_by),
            OutcomeStatus::Failed { error } => {
                println!("{}: FAILED ({}): {}", o.task_name, o.triggered_by, error)
            }
            OutcomeStatus::Skipped { reason } => println!("{}: skipped ({})", o.task_name, reason),
        }
    }
    Ok(())
}

fn local_time(t: DateTime<Utc>) -> String {
    t.with_timezone(&Local).format("%Y-%m-%d %H:%M").to_string()
}
