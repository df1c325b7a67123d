//! The run pipeline shared by manual, scheduled and catch-up triggers.
//!
//! A run is recorded as `running` before the executor starts and patched
//! with the outcome afterwards. History bookkeeping never stops a task from
//! running: storage errors are logged and the run goes ahead. A run whose
//! start could not be recorded is not patched either, so an older record of
//! the same task is never overwritten.

use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use serde::Serialize;
use tracing::{error, info, warn};

use crate::catchup::DecisionReason;
use crate::executor::TaskExecutor;
use crate::history::{RunHistory, RunPatch, RunRecord, TriggeredBy};
use crate::platform::guard;
use crate::tasks::ScheduledTask;

/// How a single run attempt ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum OutcomeStatus {
    Completed,
    Failed { error: String },
    /// Rejected by the RunAtLoad guard; nothing was executed or recorded.
    Skipped { reason: DecisionReason },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunOutcome {
    pub task_name: String,
    pub triggered_by: TriggeredBy,
    #[serde(flatten)]
    pub status: OutcomeStatus,
}

impl RunOutcome {
    pub fn is_failure(&self) -> bool {
        matches!(self.status, OutcomeStatus::Failed { .. })
    }
}

/// Executes tasks and keeps the run history in step.
#[derive(Clone)]
pub struct Runner {
    history: Arc<RunHistory>,
    executor: Arc<dyn TaskExecutor>,
}

impl Runner {
    pub fn new(history: Arc<RunHistory>, executor: Arc<dyn TaskExecutor>) -> Self {
        Self { history, executor }
    }

    pub fn history(&self) -> &RunHistory {
        &self.history
    }

    /// Run `task` once, unconditionally.
    pub async fn run(&self, task: &ScheduledTask, triggered_by: TriggeredBy) -> RunOutcome {
        let started = Utc::now();
        let recorded = match self
            .history
            .append(RunRecord::start(&task.name, triggered_by, started))
        {
            Ok(()) => true,
            Err(e) => {
                warn!(task = %task.name, "Failed to record run start: {}", e);
                false
            }
        };

        info!(task = %task.name, trigger = %triggered_by, "Run started");
        let result = self.executor.execute(task, triggered_by).await;
        let finished = Utc::now();

        let (patch, status) = match result {
            Ok(()) => {
                info!(task = %task.name, trigger = %triggered_by, "Run completed");
                (RunPatch::completed(finished), OutcomeStatus::Completed)
            }
            Err(e) => {
                let message = format!("{e:#}");
                error!(task = %task.name, trigger = %triggered_by, "Run failed: {}", message);
                (
                    RunPatch::failed(finished, message.clone()),
                    OutcomeStatus::Failed { error: message },
                )
            }
        };

        if recorded {
            match self.history.update_latest(&task.name, patch) {
                Ok(true) => {}
                Ok(false) => warn!(task = %task.name, "No run record to complete"),
                Err(e) => warn!(task = %task.name, "Failed to record run outcome: {}", e),
            }
        } else {
            warn!(task = %task.name, "Run start was not recorded, leaving history untouched");
        }

        RunOutcome {
            task_name: task.name.clone(),
            triggered_by,
            status,
        }
    }

    /// Entry point for invocations made by the OS scheduler.
    ///
    /// The RunAtLoad guard decides first; a rejected invocation is logged
    /// and returned as skipped without touching the history.
    pub async fn run_scheduled<Tz: TimeZone>(
        &self,
        task: &ScheduledTask,
        now: &DateTime<Tz>,
    ) -> RunOutcome {
        let last_run = match self.history.last_run(&task.name) {
            Ok(last) => last,
            Err(e) => {
                warn!(task = %task.name, "Run history unavailable, assuming no previous run: {}", e);
                None
            }
        };

        let decision = guard::admit(task, last_run, now);
        if !decision.should_run {
            info!(
                task = %task.name,
                reason = %decision.reason,
                scheduled_at = ?decision.scheduled_at,
                "Scheduler trigger skipped"
            );
            return RunOutcome {
                task_name: task.name.clone(),
                triggered_by: TriggeredBy::Scheduled,
                status: OutcomeStatus::Skipped {
                    reason: decision.reason,
                },
            };
        }

        self.run(task, TriggeredBy::Scheduled).await
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::history::RunStatus;
    use chrono::Duration;
    use std::sync::Mutex;

    /// Records calls; fails for tasks named in `failing`.
    #[derive(Default)]
    pub(crate) struct FakeExecutor {
        pub failing: Vec<String>,
        pub calls: Mutex<Vec<(String, TriggeredBy)>>,
    }

    impl FakeExecutor {
        pub fn failing(names: &[&str]) -> Self {
            Self {
                failing: names.iter().map(|n| n.to_string()).collect(),
                calls: Mutex::new(Vec::new()),
            }
        }

        pub fn call_count(&self) -> usize {
            self.calls.lock().unwrap().len()
        }
    }

    #[async_trait::async_trait]
    impl TaskExecutor for FakeExecutor {
        async fn execute(&self, task: &ScheduledTask, triggered_by: TriggeredBy) -> anyhow::Result<()> {
            self.calls
                .lock()
                .unwrap()
                .push((task.name.clone(), triggered_by));
            if self.failing.contains(&task.name) {
                anyhow::bail!("{} exploded", task.name);
            }
            Ok(())
        }
    }

    /// Puts `content` back into the history file, then fails.
    struct RestoringExecutor {
        path: std::path::PathBuf,
        content: String,
    }

    #[async_trait::async_trait]
    impl TaskExecutor for RestoringExecutor {
        async fn execute(&self, _task: &ScheduledTask, _triggered_by: TriggeredBy) -> anyhow::Result<()> {
            std::fs::write(&self.path, &self.content)?;
            anyhow::bail!("boom")
        }
    }

    fn runner(executor: Arc<FakeExecutor>) -> (tempfile::TempDir, Runner) {
        let dir = tempfile::TempDir::new().unwrap();
        let history = Arc::new(RunHistory::new(dir.path().join("history.json")));
        (dir, Runner::new(history, executor))
    }

    #[tokio::test]
    async fn test_successful_run_is_recorded() {
        let exec = Arc::new(FakeExecutor::default());
        let (_dir, runner) = runner(exec.clone());
        let task = ScheduledTask::new("sync", "0 * * * *", "agent");

        let outcome = runner.run(&task, TriggeredBy::Manual).await;
        assert_eq!(outcome.status, OutcomeStatus::Completed);

        let records = runner.history().load_all().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status, RunStatus::Completed);
        assert_eq!(records[0].triggered_by, TriggeredBy::Manual);
        assert!(records[0].completed_at.is_some());
    }

    #[tokio::test]
    async fn test_failed_run_is_recorded_with_error() {
        let exec = Arc::new(FakeExecutor::failing(&["sync"]));
        let (_dir, runner) = runner(exec);
        let task = ScheduledTask::new("sync", "0 * * * *", "agent");

        let outcome = runner.run(&task, TriggeredBy::Manual).await;
        assert!(outcome.is_failure());

        let records = runner.history().load_all().unwrap();
        assert_eq!(records[0].status, RunStatus::Failed);
        assert_eq!(records[0].error.as_deref(), Some("sync exploded"));
    }

    #[tokio::test]
    async fn test_broken_history_does_not_block_execution() {
        let exec = Arc::new(FakeExecutor::default());
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("history.json");
        std::fs::write(&path, "not json").unwrap();
        let runner = Runner::new(Arc::new(RunHistory::new(path)), exec.clone());

        let task = ScheduledTask::new("sync", "0 * * * *", "agent");
        let outcome = runner.run(&task, TriggeredBy::Scheduled).await;
        assert_eq!(outcome.status, OutcomeStatus::Completed);
        assert_eq!(exec.call_count(), 1);
    }

    #[tokio::test]
    async fn test_unrecorded_start_never_patches_an_older_record() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("history.json");
        let yesterday = Utc::now() - Duration::days(1);
        let previous = RunRecord {
            task_name: "sync".to_string(),
            started_at: yesterday,
            completed_at: Some(yesterday + Duration::minutes(1)),
            status: RunStatus::Completed,
            triggered_by: TriggeredBy::Scheduled,
            error: None,
        };
        let content = serde_json::to_string(&vec![previous.clone()]).unwrap();

        // Unreadable when the run starts, restored while it executes.
        std::fs::write(&path, "not json").unwrap();
        let exec = Arc::new(RestoringExecutor {
            path: path.clone(),
            content,
        });
        let runner = Runner::new(Arc::new(RunHistory::new(path)), exec);

        let task = ScheduledTask::new("sync", "0 * * * *", "agent");
        let outcome = runner.run(&task, TriggeredBy::Manual).await;
        assert!(outcome.is_failure());

        let records = runner.history().load_all().unwrap();
        assert_eq!(records, vec![previous]);
    }

    #[tokio::test]
    async fn test_scheduled_trigger_on_fresh_registration_is_skipped() {
        // Weekly task created mid-week: the last firing predates the window.
        let exec = Arc::new(FakeExecutor::default());
        let (_dir, runner) = runner(exec.clone());
        let task = ScheduledTask::new("weekly", "0 0 * * 0", "agent");
        let now = Utc.with_ymd_and_hms(2024, 3, 6, 12, 0, 0).unwrap();

        let outcome = runner.run_scheduled(&task, &now).await;
        assert_eq!(
            outcome.status,
            OutcomeStatus::Skipped {
                reason: DecisionReason::ExceededMaxAge
            }
        );
        assert_eq!(exec.call_count(), 0);
        assert!(runner.history().load_all().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_scheduled_trigger_at_real_slot_runs() {
        let exec = Arc::new(FakeExecutor::default());
        let (_dir, runner) = runner(exec.clone());
        let task = ScheduledTask::new("hourly", "0 * * * *", "agent");
        let now = Utc.with_ymd_and_hms(2024, 3, 6, 12, 0, 2).unwrap();
        runner
            .history()
            .append(RunRecord::start("hourly", TriggeredBy::Scheduled, now - Duration::hours(1)))
            .unwrap();

        let outcome = runner.run_scheduled(&task, &now).await;
        assert_eq!(outcome.status, OutcomeStatus::Completed);
        assert_eq!(exec.calls.lock().unwrap()[0].1, TriggeredBy::Scheduled);
    }

    #[tokio::test]
    async fn test_scheduled_trigger_after_recent_run_is_skipped() {
        let exec = Arc::new(FakeExecutor::default());
        let (_dir, runner) = runner(exec.clone());
        let task = ScheduledTask::new("hourly", "0 * * * *", "agent");
        let now = Utc.with_ymd_and_hms(2024, 3, 6, 12, 20, 0).unwrap();
        runner
            .history()
            .append(RunRecord::start("hourly", TriggeredBy::Manual, now - Duration::minutes(10)))
            .unwrap();

        let outcome = runner.run_scheduled(&task, &now).await;
        assert_eq!(
            outcome.status,
            OutcomeStatus::Skipped {
                reason: DecisionReason::NoMissedRun
            }
        );
        assert_eq!(exec.call_count(), 0);
    }
}
