//! User crontab backend.
//!
//! Each task owns one line tagged with a trailing `# cadence:<task>` marker;
//! lines without a marker are never touched. cron has no run-at-load
//! behaviour, so that option is ignored here.

use std::path::PathBuf;
use std::sync::Arc;

use tracing::debug;

use super::{
    run_checked, CommandRunner, ScheduleOptions, ScheduledEntry, SchedulerBackend, SchedulerError,
    SchedulerKind,
};
use crate::schedule::CronExpr;
use crate::tasks::{validate_name, ScheduledTask};

const CRONTAB: &str = "crontab";
const MARKER: &str = "# cadence:";

pub struct CrontabBackend {
    program: PathBuf,
    log_dir: PathBuf,
    runner: Arc<dyn CommandRunner>,
}

impl CrontabBackend {
    pub fn new(program: PathBuf, log_dir: PathBuf, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            program,
            log_dir,
            runner,
        }
    }

    /// The crontab line registered for `task`.
    pub fn line_for(&self, task: &ScheduledTask, expr: &CronExpr) -> String {
        let log = self.log_dir.join(format!("{}.log", task.name));
        format!(
            "{} {} run {} --scheduled >> {} 2>&1 {MARKER}{}",
            expr.fields().join(" "),
            cron_quote(&self.program.to_string_lossy()),
            task.name,
            cron_quote(&log.to_string_lossy()),
            task.name
        )
    }

    fn read_lines(&self) -> Result<Vec<String>, SchedulerError> {
        let out = self
            .runner
            .run(CRONTAB, &["-l"], None)
            .map_err(|e| SchedulerError::Command {
                command: "crontab -l".to_string(),
                detail: e.to_string(),
            })?;

        if !out.success {
            // An empty table is reported as an error by most cron implementations.
            if out.stderr.to_ascii_lowercase().contains("no crontab") {
                return Ok(Vec::new());
            }
            return Err(SchedulerError::Command {
                command: "crontab -l".to_string(),
                detail: out.stderr.trim().to_string(),
            });
        }
        Ok(out.stdout.lines().map(str::to_string).collect())
    }

    fn write_lines(&self, lines: &[String]) -> Result<(), SchedulerError> {
        let mut content = lines.join("\n");
        content.push('\n');
        run_checked(self.runner.as_ref(), CRONTAB, &["-"], Some(&content))?;
        Ok(())
    }
}

impl SchedulerBackend for CrontabBackend {
    fn kind(&self) -> SchedulerKind {
        SchedulerKind::Crontab
    }

    fn install(&self, task: &ScheduledTask, options: ScheduleOptions) -> Result<(), SchedulerError> {
        validate_name(&task.name)?;
        let expr = CronExpr::parse(&task.schedule).map_err(|e| SchedulerError::Unrepresentable {
            schedule: task.schedule.clone(),
            backend: SchedulerKind::Crontab,
            reason: e.to_string(),
        })?;
        if options.run_at_load {
            debug!(task = %task.name, "crontab has no run-at-load; option ignored");
        }

        std::fs::create_dir_all(&self.log_dir).map_err(|e| {
            SchedulerError::io(format!("failed to create {}", self.log_dir.display()), e)
        })?;

        let mut lines = self.read_lines()?;
        lines.retain(|line| marker_name(line) != Some(task.name.as_str()));
        lines.push(self.line_for(task, &expr));
        self.write_lines(&lines)
    }

    fn remove(&self, name: &str) -> Result<(), SchedulerError> {
        validate_name(name)?;
        let mut lines = self.read_lines()?;
        let before = lines.len();
        lines.retain(|line| marker_name(line) != Some(name));
        if lines.len() == before {
            return Err(SchedulerError::NotScheduled {
                name: name.to_string(),
            });
        }
        self.write_lines(&lines)
    }

    fn is_installed(&self, name: &str) -> Result<bool, SchedulerError> {
        validate_name(name)?;
        Ok(self
            .read_lines()?
            .iter()
            .any(|line| marker_name(line) == Some(name)))
    }

    fn list(&self) -> Result<Vec<ScheduledEntry>, SchedulerError> {
        let mut out: Vec<ScheduledEntry> = self
            .read_lines()?
            .iter()
            .filter_map(|line| {
                let name = marker_name(line)?;
                let fields: Vec<&str> = line.split_whitespace().take(5).collect();
                Some(ScheduledEntry {
                    name: name.to_string(),
                    schedule: (fields.len() == 5).then(|| fields.join(" ")),
                    location: CRONTAB.to_string(),
                })
            })
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(out)
    }
}

/// Task name from a managed line's trailing marker.
fn marker_name(line: &str) -> Option<&str> {
    let trimmed = line.trim();
    if trimmed.starts_with('#') {
        return None;
    }
    let (_, name) = trimmed.rsplit_once(MARKER)?;
    let name = name.trim();
    (!name.is_empty()).then_some(name)
}

/// Single-quote for `/bin/sh` and escape `%`, which cron turns into newlines.
fn cron_quote(s: &str) -> String {
    let escaped = s.replace('\'', r"'\''").replace('%', r"\%");
    format!("'{escaped}'")
}
