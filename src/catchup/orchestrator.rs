use anyhow::{Context, Result};
use chrono::{DateTime, TimeZone};
use futures::future::join_all;
use serde::Serialize;
use tracing::{info, warn};

use super::{decide_catch_up, CatchUpDecision};
use crate::history::{latest_start, TriggeredBy};
use crate::runner::{RunOutcome, Runner};
use crate::tasks::{ScheduledTask, TaskRegistry};

/// A task paired with its catch-up decision.
#[derive(Debug, Clone, Serialize)]
pub struct CatchUpCandidate {
    pub task: ScheduledTask,
    pub decision: CatchUpDecision,
}

/// Per-task results of a catch-up batch.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CatchUpReport {
    pub outcomes: Vec<RunOutcome>,
}

impl CatchUpReport {
    pub fn failures(&self) -> Vec<&RunOutcome> {
        self.outcomes.iter().filter(|o| o.is_failure()).collect()
    }

    pub fn succeeded(&self) -> usize {
        self.outcomes.len() - self.failures().len()
    }
}

/// Finds missed runs across all registered tasks and re-runs them.
pub struct CatchUp {
    registry: TaskRegistry,
    runner: Runner,
}

impl CatchUp {
    pub fn new(registry: TaskRegistry, runner: Runner) -> Self {
        Self { registry, runner }
    }

    /// Decisions for every enabled task that opted into catch-up.
    ///
    /// Tasks that fail validation are skipped with a warning. Failing to
    /// read the registry or the run history is an error.
    pub async fn evaluate<Tz: TimeZone>(&self, now: &DateTime<Tz>) -> Result<Vec<CatchUpCandidate>> {
        let tasks = self.registry.list().await.context("Failed to load tasks")?;
        let records = self
            .runner
            .history()
            .load_all()
            .context("Failed to read run history")?;

        let mut out = Vec::new();
        for task in tasks {
            if !task.enabled || !task.catch_up_on_startup {
                continue;
            }
            if let Err(e) = task.validate() {
                warn!(task = %task.name, "Skipping task in catch-up scan: {}", e);
                continue;
            }
            let last_run = latest_start(&records, &task.name);
            let decision = decide_catch_up(&task, last_run, now);
            out.push(CatchUpCandidate { task, decision });
        }
        Ok(out)
    }

    /// Tasks that missed a run and should be caught up now.
    pub async fn candidates<Tz: TimeZone>(&self, now: &DateTime<Tz>) -> Result<Vec<CatchUpCandidate>> {
        let mut all = self.evaluate(now).await?;
        all.retain(|c| c.decision.should_run);
        Ok(all)
    }

    /// Run `tasks` concurrently as catch-up runs.
    ///
    /// Every task gets its own history record and outcome; a failing task
    /// never stops the others.
    pub async fn run_catch_up_for(&self, tasks: &[ScheduledTask]) -> Result<CatchUpReport> {
        info!(count = tasks.len(), "Starting catch-up batch");
        let outcomes = join_all(
            tasks
                .iter()
                .map(|task| self.runner.run(task, TriggeredBy::Catchup)),
        )
        .await;

        let report = CatchUpReport { outcomes };
        info!(
            succeeded = report.succeeded(),
            failed = report.failures().len(),
            "Catch-up batch finished"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catchup::DecisionReason;
    use crate::history::{RunHistory, RunRecord, RunStatus};
    use crate::runner::tests::FakeExecutor;
    use crate::runner::OutcomeStatus;
    use crate::storage::open_pool;
    use chrono::{Duration, Utc};
    use std::sync::Arc;

    struct Fixture {
        _dir: tempfile::TempDir,
        registry: TaskRegistry,
        history: Arc<RunHistory>,
        executor: Arc<FakeExecutor>,
        catch_up: CatchUp,
    }

    fn fixture(executor: FakeExecutor) -> Fixture {
        let dir = tempfile::TempDir::new().unwrap();
        let pool = open_pool(&dir.path().join("tasks.db")).unwrap();
        let registry = TaskRegistry::new(pool);
        let history = Arc::new(RunHistory::new(dir.path().join("history.json")));
        let executor = Arc::new(executor);
        let runner = Runner::new(history.clone(), executor.clone());
        let catch_up = CatchUp::new(registry.clone(), runner);
        Fixture {
            _dir: dir,
            registry,
            history,
            executor,
            catch_up,
        }
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 6, 12, 20, 0).unwrap()
    }

    fn hourly(name: &str) -> ScheduledTask {
        ScheduledTask::new(name, "0 * * * *", "agent")
            .with_catch_up(Some(3600))
            .enabled(true)
    }

    #[tokio::test]
    async fn test_candidates_only_include_missed_opted_in_tasks() {
        let f = fixture(FakeExecutor::default());
        f.registry.add(&hourly("missed")).await.unwrap();
        f.registry.add(&hourly("fresh")).await.unwrap();
        f.registry
            .add(&hourly("paused").enabled(false))
            .await
            .unwrap();
        f.registry
            .add(&ScheduledTask::new("opted-out", "0 * * * *", "agent").enabled(true))
            .await
            .unwrap();

        f.history
            .append(RunRecord::start("missed", TriggeredBy::Scheduled, now() - Duration::minutes(90)))
            .unwrap();
        f.history
            .append(RunRecord::start("fresh", TriggeredBy::Scheduled, now() - Duration::minutes(15)))
            .unwrap();

        let evaluated = f.catch_up.evaluate(&now()).await.unwrap();
        assert_eq!(evaluated.len(), 2);
        let fresh = evaluated.iter().find(|c| c.task.name == "fresh").unwrap();
        assert_eq!(fresh.decision.reason, DecisionReason::NoMissedRun);

        let candidates = f.catch_up.candidates(&now()).await.unwrap();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].task.name, "missed");
        assert_eq!(
            candidates[0].decision.scheduled_at,
            Some(Utc.with_ymd_and_hms(2024, 3, 6, 12, 0, 0).unwrap())
        );
    }

    #[tokio::test]
    async fn test_unreadable_history_fails_the_scan() {
        let f = fixture(FakeExecutor::default());
        f.registry.add(&hourly("missed")).await.unwrap();
        std::fs::write(f.history.path(), "[{").unwrap();
        assert!(f.catch_up.candidates(&now()).await.is_err());
    }

    #[tokio::test]
    async fn test_batch_partial_failure() {
        let f = fixture(FakeExecutor::failing(&["two"]));
        let tasks = [hourly("one"), hourly("two"), hourly("three")];

        let report = f.catch_up.run_catch_up_for(&tasks).await.unwrap();

        assert_eq!(report.outcomes.len(), 3);
        assert_eq!(report.succeeded(), 2);
        let failures = report.failures();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].task_name, "two");
        assert!(matches!(&failures[0].status, OutcomeStatus::Failed { error } if !error.is_empty()));

        let records = f.history.load_all().unwrap();
        assert_eq!(records.len(), 3);
        for record in &records {
            assert_eq!(record.triggered_by, TriggeredBy::Catchup);
            let expected = if record.task_name == "two" {
                RunStatus::Failed
            } else {
                RunStatus::Completed
            };
            assert_eq!(record.status, expected, "{}", record.task_name);
        }
        let two = records.iter().find(|r| r.task_name == "two").unwrap();
        assert!(two.error.as_deref().is_some_and(|e| !e.is_empty()));
        assert_eq!(f.executor.call_count(), 3);
    }

    #[tokio::test]
    async fn test_caught_up_task_is_no_longer_a_candidate() {
        let f = fixture(FakeExecutor::default());
        f.registry.add(&hourly("missed")).await.unwrap();
        f.history
            .append(RunRecord::start("missed", TriggeredBy::Scheduled, now() - Duration::minutes(90)))
            .unwrap();

        let real_now = Utc::now();
        let before = f.catch_up.candidates(&real_now).await.unwrap();
        assert_eq!(before.len(), 1);

        let tasks: Vec<ScheduledTask> = before.into_iter().map(|c| c.task).collect();
        f.catch_up.run_catch_up_for(&tasks).await.unwrap();

        let after = f.catch_up.candidates(&Utc::now()).await.unwrap();
        assert!(after.is_empty());
    }
}
