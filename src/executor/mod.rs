//! Task execution.
//!
//! The catch-up core never looks inside a run: it hands the task to a
//! [`TaskExecutor`] and records whether it succeeded.

pub mod command;

pub use command::CommandExecutor;

use anyhow::Result;
use thiserror::Error;

use crate::history::TriggeredBy;
use crate::tasks::ScheduledTask;

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("no executor program configured (set [executor].program)")]
    NotConfigured,

    #[error("failed to start '{program}': {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },

    #[error("'{program}' exited with {status}: {stderr}")]
    Exit {
        program: String,
        status: String,
        stderr: String,
    },

    #[error("'{program}' timed out after {secs}s")]
    TimedOut { program: String, secs: u64 },
}

/// Runs a task's payload.
#[async_trait::async_trait]
pub trait TaskExecutor: Send + Sync {
    /// Execute `task` once. Errors mark the run as failed.
    async fn execute(&self, task: &ScheduledTask, triggered_by: TriggeredBy) -> Result<()>;
}
