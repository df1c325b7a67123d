//! RunAtLoad guard.
//!
//! launchd starts a `RunAtLoad` agent every time it is loaded: at login, on
//! wake, and also the moment the task is first registered. Every
//! scheduler-initiated invocation is therefore re-checked against the
//! catch-up rules, with catch-up forced on, and only proceeds when a real
//! slot was missed or is firing now.

use chrono::{DateTime, TimeZone, Utc};

use crate::catchup::{decide_catch_up, CatchUpDecision};
use crate::tasks::ScheduledTask;

/// Decide whether a scheduler-initiated invocation of `task` may run.
pub fn admit<Tz: TimeZone>(
    task: &ScheduledTask,
    last_run: Option<DateTime<Utc>>,
    now: &DateTime<Tz>,
) -> CatchUpDecision {
    let mut probe = task.clone();
    probe.catch_up_on_startup = true;
    decide_catch_up(&probe, last_run, now)
}
