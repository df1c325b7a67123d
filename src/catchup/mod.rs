//! Missed-run detection and catch-up.
//!
//! [`decide_catch_up`] is the pure decision procedure; [`CatchUp`] applies it
//! across the registry and re-runs what was missed.

pub mod decision;
pub mod orchestrator;

pub use decision::decide_catch_up;
pub use orchestrator::{CatchUp, CatchUpCandidate, CatchUpReport};

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Why a catch-up decision came out the way it did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum DecisionReason {
    NoSchedule,
    Disabled,
    NoMissedRun,
    ExceededMaxAge,
    MissedRunDetected,
}

impl DecisionReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NoSchedule => "no-schedule",
            Self::Disabled => "disabled",
            Self::NoMissedRun => "no-missed-run",
            Self::ExceededMaxAge => "exceeded-max-age",
            Self::MissedRunDetected => "missed-run-detected",
        }
    }
}

impl std::fmt::Display for DecisionReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of [`decide_catch_up`].
///
/// `scheduled_at` carries the missed occurrence when one was found, whether
/// it is run or rejected as too old.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CatchUpDecision {
    pub should_run: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scheduled_at: Option<DateTime<Utc>>,
    pub reason: DecisionReason,
}

impl CatchUpDecision {
    pub(crate) fn skip(reason: DecisionReason) -> Self {
        Self {
            should_run: false,
            scheduled_at: None,
            reason,
        }
    }
}
