//! Scheduled task definitions and the task registry.

pub mod registry;

pub use registry::TaskRegistry;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::schedule::{CronExpr, ScheduleError};

/// Catch-up window applied when a task does not set its own: 24 hours.
pub const DEFAULT_MAX_CATCH_UP_AGE_SECS: u64 = 24 * 60 * 60;

#[derive(Debug, Error)]
pub enum TaskError {
    #[error("task name must not be empty")]
    EmptyName,

    #[error("task name '{0}' may only contain ASCII letters, digits, '-', '_' and '.'")]
    InvalidName(String),

    #[error("task '{name}' has no executor")]
    MissingExecutor { name: String },

    #[error("task '{name}' enables catch-up but has no schedule")]
    CatchUpWithoutSchedule { name: String },

    #[error("task '{name}': {source}")]
    Schedule {
        name: String,
        source: ScheduleError,
    },
}

/// A recurring task registered for OS scheduling.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduledTask {
    pub name: String,
    pub schedule: String,
    pub executor_id: String,
    pub catch_up_on_startup: bool,
    pub max_catch_up_age_secs: Option<u64>,
    pub enabled: bool,
}

impl ScheduledTask {
    /// A disabled task with catch-up off and no explicit window.
    pub fn new(
        name: impl Into<String>,
        schedule: impl Into<String>,
        executor_id: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            schedule: schedule.into(),
            executor_id: executor_id.into(),
            catch_up_on_startup: false,
            max_catch_up_age_secs: None,
            enabled: false,
        }
    }

    pub fn with_catch_up(mut self, max_age_secs: Option<u64>) -> Self {
        self.catch_up_on_startup = true;
        self.max_catch_up_age_secs = max_age_secs;
        self
    }

    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// The task's catch-up window, falling back to
    /// [`DEFAULT_MAX_CATCH_UP_AGE_SECS`].
    pub fn effective_max_age_secs(&self) -> u64 {
        self.max_catch_up_age_secs
            .unwrap_or(DEFAULT_MAX_CATCH_UP_AGE_SECS)
    }

    /// Check the fields that cannot be fixed up at use time.
    pub fn validate(&self) -> Result<(), TaskError> {
        validate_name(&self.name)?;

        if self.executor_id.trim().is_empty() {
            return Err(TaskError::MissingExecutor {
                name: self.name.clone(),
            });
        }

        if self.schedule.trim().is_empty() {
            if self.catch_up_on_startup {
                return Err(TaskError::CatchUpWithoutSchedule {
                    name: self.name.clone(),
                });
            }
            return Err(TaskError::Schedule {
                name: self.name.clone(),
                source: ScheduleError::Empty,
            });
        }

        CronExpr::parse(&self.schedule).map_err(|source| TaskError::Schedule {
            name: self.name.clone(),
            source,
        })?;
        Ok(())
    }
}

/// Names end up in launchd labels, file names and crontab markers.
pub fn validate_name(name: &str) -> Result<(), TaskError> {
    if name.is_empty() {
        return Err(TaskError::EmptyName);
    }
    let ok = name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if !ok || name.starts_with('.') || name.starts_with('-') {
        return Err(TaskError::InvalidName(name.to_string()));
    }
    Ok(())
}
