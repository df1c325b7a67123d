//! cadence -- recurring tasks on the OS scheduler, with missed-run catch-up.
//!
//! Tasks live in a SQLite registry and are registered with launchd or the
//! user crontab. Every run is recorded in a JSON history file, which is what
//! catch-up consults to find slots that were missed while the machine slept.

pub mod catchup;
pub mod config;
pub mod executor;
pub mod history;
pub mod platform;
pub mod runner;
pub mod schedule;
pub mod storage;
pub mod tasks;

use std::sync::Arc;

use anyhow::{Context, Result};

use crate::catchup::CatchUp;
use crate::config::CadenceConfig;
use crate::executor::CommandExecutor;
use crate::history::RunHistory;
use crate::platform::{resolve_kind, ScheduleOptions, SchedulerPort};
use crate::runner::Runner;
use crate::tasks::{ScheduledTask, TaskRegistry};

/// Everything a CLI invocation needs, wired from one configuration.
pub struct App {
    pub config: CadenceConfig,
    pub registry: TaskRegistry,
    pub runner: Runner,
    pub port: SchedulerPort,
}

impl App {
    /// Open storage and resolve the scheduler backend.
    pub fn open(config: CadenceConfig) -> Result<Self> {
        let db_path = config.database_path();
        tracing::debug!(path = %db_path.display(), "Opening task database");
        let pool = storage::open_pool(&db_path)?;
        let registry = TaskRegistry::new(pool);

        let history = Arc::new(RunHistory::new(config.history_path()));
        let executor = Arc::new(CommandExecutor::from_config(&config.executor));
        let runner = Runner::new(history, executor);

        let kind = resolve_kind(config.scheduler.backend);
        tracing::debug!(backend = %kind, "Resolved OS scheduler");
        let port = SchedulerPort::from_config(kind, &config);

        Ok(Self {
            config,
            registry,
            runner,
            port,
        })
    }

    pub fn catch_up(&self) -> CatchUp {
        CatchUp::new(self.registry.clone(), self.runner.clone())
    }

    pub fn schedule_options(&self) -> ScheduleOptions {
        ScheduleOptions {
            run_at_load: self.config.scheduler.run_at_load,
        }
    }

    /// Replace a stored task definition.
    ///
    /// An enabled task is re-registered with the OS scheduler before the
    /// registry is touched; if the registry update then fails, the previous
    /// registration is restored.
    pub async fn update_task(&self, task: &ScheduledTask) -> Result<()> {
        let previous = self
            .registry
            .get(&task.name)
            .await?
            .with_context(|| format!("Task '{}' not found", task.name))?;

        if previous.enabled {
            self.port.schedule(task, self.schedule_options())?;
        }

        if let Err(e) = self.registry.update(task).await {
            if previous.enabled {
                if let Err(restore) = self.port.schedule(&previous, self.schedule_options()) {
                    tracing::warn!(task = %task.name, "Failed to restore OS registration: {}", restore);
                }
            }
            return Err(e);
        }
        Ok(())
    }
}
