use chrono::{DateTime, TimeDelta, TimeZone, Utc};

use super::{CatchUpDecision, DecisionReason};
use crate::schedule::CronExpr;
use crate::tasks::ScheduledTask;

/// Decide whether `task` missed a scheduled run that should happen now.
///
/// `last_run` is the start of the task's most recent run (any status).
/// The schedule is evaluated in `now`'s time zone. A task without its own
/// catch-up window gets the 24 hour default, so a brand-new task can pick up
/// its latest slot but never older history.
pub fn decide_catch_up<Tz: TimeZone>(
    task: &ScheduledTask,
    last_run: Option<DateTime<Utc>>,
    now: &DateTime<Tz>,
) -> CatchUpDecision {
    if !task.catch_up_on_startup {
        return CatchUpDecision::skip(DecisionReason::Disabled);
    }

    let Ok(expr) = CronExpr::parse(&task.schedule) else {
        return CatchUpDecision::skip(DecisionReason::NoSchedule);
    };

    let Some(missed) = expr.last_at_or_before(now).map(|t| t.with_timezone(&Utc)) else {
        return CatchUpDecision::skip(DecisionReason::NoMissedRun);
    };

    // Also covers a clock that moved backwards past the last run.
    if last_run.is_some_and(|last| last >= missed) {
        return CatchUpDecision::skip(DecisionReason::NoMissedRun);
    }

    let age = now.with_timezone(&Utc) - missed;
    let max_age = i64::try_from(task.effective_max_age_secs())
        .ok()
        .and_then(TimeDelta::try_seconds)
        .unwrap_or(TimeDelta::MAX);

    if age > max_age {
        return CatchUpDecision {
            should_run: false,
            scheduled_at: Some(missed),
            reason: DecisionReason::ExceededMaxAge,
        };
    }

    CatchUpDecision {
        should_run: true,
        scheduled_at: Some(missed),
        reason: DecisionReason::MissedRunDetected,
    }
}
