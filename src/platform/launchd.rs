//! launchd user agents (macOS).
//!
//! Each task becomes `~/Library/LaunchAgents/<prefix>.<task>.plist`, loaded
//! with `launchctl load -w`. launchd fires an agent as soon as it is loaded
//! when `RunAtLoad` is set, including right after registration; the
//! RunAtLoad guard filters those invocations.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, warn};

use super::calendar::{self, CalendarInterval};
use super::{
    run_checked, CommandRunner, ScheduleOptions, ScheduledEntry, SchedulerBackend, SchedulerError,
    SchedulerKind,
};
use crate::schedule::CronExpr;
use crate::tasks::{validate_name, ScheduledTask};

const LAUNCHCTL: &str = "launchctl";
const SCHEDULE_COMMENT: &str = "cadence-schedule:";

pub struct LaunchdBackend {
    agents_dir: PathBuf,
    label_prefix: String,
    program: PathBuf,
    log_dir: PathBuf,
    runner: Arc<dyn CommandRunner>,
}

impl LaunchdBackend {
    pub fn new(
        agents_dir: PathBuf,
        label_prefix: String,
        program: PathBuf,
        log_dir: PathBuf,
        runner: Arc<dyn CommandRunner>,
    ) -> Self {
        Self {
            agents_dir,
            label_prefix,
            program,
            log_dir,
            runner,
        }
    }

    pub fn label(&self, name: &str) -> String {
        format!("{}.{}", self.label_prefix, name)
    }

    pub fn plist_path(&self, name: &str) -> PathBuf {
        self.agents_dir.join(format!("{}.plist", self.label(name)))
    }

    /// Render the property list for `task`.
    pub fn render_plist(
        &self,
        task: &ScheduledTask,
        intervals: &[CalendarInterval],
        options: ScheduleOptions,
    ) -> String {
        let log = self.log_dir.join(format!("{}.log", task.name));
        let mut out = String::new();

        out.push_str("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n");
        out.push_str(
            "<!DOCTYPE plist PUBLIC \"-//Apple//DTD PLIST 1.0//EN\" \
             \"http://www.apple.com/DTDs/PropertyList-1.0.dtd\">\n",
        );
        let _ = writeln!(
            out,
            "<!-- {SCHEDULE_COMMENT} {} -->",
            task.schedule.trim().replace("--", "- -")
        );
        out.push_str("<plist version=\"1.0\">\n<dict>\n");

        let _ = writeln!(out, "    <key>Label</key>\n    <string>{}</string>", xml_escape(&self.label(&task.name)));

        out.push_str("    <key>ProgramArguments</key>\n    <array>\n");
        let program = self.program.to_string_lossy();
        for arg in [program.as_ref(), "run", task.name.as_str(), "--scheduled"] {
            let _ = writeln!(out, "        <string>{}</string>", xml_escape(arg));
        }
        out.push_str("    </array>\n");

        out.push_str("    <key>StartCalendarInterval</key>\n    <array>\n");
        for interval in intervals {
            out.push_str("        <dict>\n");
            for (key, value) in interval.keys() {
                let _ = writeln!(
                    out,
                    "            <key>{key}</key>\n            <integer>{value}</integer>"
                );
            }
            out.push_str("        </dict>\n");
        }
        out.push_str("    </array>\n");

        let _ = writeln!(
            out,
            "    <key>RunAtLoad</key>\n    <{}/>",
            if options.run_at_load { "true" } else { "false" }
        );

        let log = xml_escape(&log.to_string_lossy());
        let _ = writeln!(out, "    <key>StandardOutPath</key>\n    <string>{log}</string>");
        let _ = writeln!(out, "    <key>StandardErrorPath</key>\n    <string>{log}</string>");

        out.push_str("</dict>\n</plist>\n");
        out
    }

    fn task_name_from_file(&self, file_name: &str) -> Option<String> {
        let label = file_name.strip_suffix(".plist")?;
        let name = label.strip_prefix(&self.label_prefix)?.strip_prefix('.')?;
        (!name.is_empty()).then(|| name.to_string())
    }
}

impl SchedulerBackend for LaunchdBackend {
    fn kind(&self) -> SchedulerKind {
        SchedulerKind::Launchd
    }

    fn install(&self, task: &ScheduledTask, options: ScheduleOptions) -> Result<(), SchedulerError> {
        validate_name(&task.name)?;
        let expr = CronExpr::parse(&task.schedule).map_err(|e| SchedulerError::Unrepresentable {
            schedule: task.schedule.clone(),
            backend: SchedulerKind::Launchd,
            reason: e.to_string(),
        })?;
        let intervals =
            calendar::intervals(&expr).map_err(|reason| SchedulerError::Unrepresentable {
                schedule: task.schedule.clone(),
                backend: SchedulerKind::Launchd,
                reason,
            })?;

        std::fs::create_dir_all(&self.agents_dir).map_err(|e| {
            SchedulerError::io(format!("failed to create {}", self.agents_dir.display()), e)
        })?;
        std::fs::create_dir_all(&self.log_dir).map_err(|e| {
            SchedulerError::io(format!("failed to create {}", self.log_dir.display()), e)
        })?;

        let path = self.plist_path(&task.name);
        let path_str = path.to_string_lossy().into_owned();

        // Re-registration: launchd keeps the old definition until unloaded.
        if path.exists() {
            if let Err(e) = run_checked(self.runner.as_ref(), LAUNCHCTL, &["unload", &path_str], None) {
                debug!(task = %task.name, "unload before reload failed: {}", e);
            }
        }

        write_atomic(&path, &self.render_plist(task, &intervals, options))?;

        if let Err(e) = run_checked(self.runner.as_ref(), LAUNCHCTL, &["load", "-w", &path_str], None) {
            let _ = std::fs::remove_file(&path);
            return Err(e);
        }
        Ok(())
    }

    fn remove(&self, name: &str) -> Result<(), SchedulerError> {
        validate_name(name)?;
        let path = self.plist_path(name);
        if !path.exists() {
            return Err(SchedulerError::NotScheduled {
                name: name.to_string(),
            });
        }

        let path_str = path.to_string_lossy().into_owned();
        if let Err(e) = run_checked(self.runner.as_ref(), LAUNCHCTL, &["unload", "-w", &path_str], None) {
            warn!(task = %name, "launchctl unload failed, removing plist anyway: {}", e);
        }
        std::fs::remove_file(&path)
            .map_err(|e| SchedulerError::io(format!("failed to remove {}", path.display()), e))
    }

    fn is_installed(&self, name: &str) -> Result<bool, SchedulerError> {
        validate_name(name)?;
        Ok(self.plist_path(name).exists())
    }

    fn list(&self) -> Result<Vec<ScheduledEntry>, SchedulerError> {
        let entries = match std::fs::read_dir(&self.agents_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(SchedulerError::io(
                    format!("failed to read {}", self.agents_dir.display()),
                    e,
                ))
            }
        };

        let mut out = Vec::new();
        for entry in entries.filter_map(|e| e.ok()) {
            let file_name = entry.file_name().to_string_lossy().into_owned();
            let Some(name) = self.task_name_from_file(&file_name) else {
                continue;
            };
            let path = entry.path();
            let schedule = std::fs::read_to_string(&path)
                .ok()
                .and_then(|content| schedule_from_plist(&content));
            out.push(ScheduledEntry {
                name,
                schedule,
                location: path.to_string_lossy().into_owned(),
            });
        }
        out.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(out)
    }
}

fn schedule_from_plist(content: &str) -> Option<String> {
    content.lines().find_map(|line| {
        let inner = line.trim().strip_prefix("<!--")?.strip_suffix("-->")?;
        let schedule = inner.trim().strip_prefix(SCHEDULE_COMMENT)?.trim();
        (!schedule.is_empty()).then(|| schedule.to_string())
    })
}

/// Write through a uniquely named temp file so concurrent writers never
/// share one.
fn write_atomic(path: &Path, content: &str) -> Result<(), SchedulerError> {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "agent.plist".to_string());
    let tmp_path = path.with_file_name(format!(".{file_name}.{}.tmp", uuid::Uuid::new_v4()));
    std::fs::write(&tmp_path, content)
        .map_err(|e| SchedulerError::io(format!("failed to write {}", tmp_path.display()), e))?;
    if let Err(e) = std::fs::rename(&tmp_path, path) {
        let _ = std::fs::remove_file(&tmp_path);
        return Err(SchedulerError::io(format!("failed to finalize {}", path.display()), e));
    }
    Ok(())
}

fn xml_escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            _ => out.push(c),
        }
    }
    out
}
