//! OS scheduler integration.
//!
//! [`SchedulerPort`] is the only entry point: it wraps one backend (launchd
//! agents on macOS, the user crontab elsewhere) chosen once at startup from
//! configuration. On platforms with neither, the port reports
//! [`SchedulerKind::Unsupported`] instead of failing with a generic error.
//!
//! Both backends register `<program> run <task> --scheduled`; the
//! [`guard`] then decides whether such an invocation is a real slot.

pub mod calendar;
pub mod crontab;
pub mod guard;
pub mod launchd;

use std::io::Write;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};

use crate::config::{BackendChoice, CadenceConfig};
use crate::tasks::{ScheduledTask, TaskError};

pub use crontab::CrontabBackend;
pub use launchd::LaunchdBackend;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("OS scheduling is not supported on this platform ({platform})")]
    Unsupported { platform: String },

    #[error("task '{name}' is not scheduled")]
    NotScheduled { name: String },

    #[error("schedule '{schedule}' cannot be registered with {backend}: {reason}")]
    Unrepresentable {
        schedule: String,
        backend: SchedulerKind,
        reason: String,
    },

    #[error(transparent)]
    Task(#[from] TaskError),

    #[error("`{command}` failed: {detail}")]
    Command { command: String, detail: String },

    #[error("{context}: {source}")]
    Io {
        context: String,
        source: std::io::Error,
    },
}

impl SchedulerError {
    pub(crate) fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }
}

/// Which OS scheduler backs the port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SchedulerKind {
    Launchd,
    Crontab,
    Unsupported,
}

impl std::fmt::Display for SchedulerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Launchd => write!(f, "launchd"),
            Self::Crontab => write!(f, "crontab"),
            Self::Unsupported => write!(f, "unsupported"),
        }
    }
}

/// Options applied when registering a task.
#[derive(Debug, Clone, Copy, Default)]
pub struct ScheduleOptions {
    /// Ask the OS scheduler to fire the job as soon as it is loaded
    /// (launchd `RunAtLoad`). Used so a sleeping machine catches up at login.
    pub run_at_load: bool,
}

/// A registration as seen by the OS scheduler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScheduledEntry {
    pub name: String,
    /// The cron expression recorded in the artifact, when recoverable.
    pub schedule: Option<String>,
    /// Plist path, or `crontab` for crontab lines.
    pub location: String,
}

/// One OS scheduling mechanism.
pub trait SchedulerBackend: Send + Sync {
    fn kind(&self) -> SchedulerKind;

    fn install(&self, task: &ScheduledTask, options: ScheduleOptions) -> Result<(), SchedulerError>;

    fn remove(&self, name: &str) -> Result<(), SchedulerError>;

    fn is_installed(&self, name: &str) -> Result<bool, SchedulerError>;

    fn list(&self) -> Result<Vec<ScheduledEntry>, SchedulerError>;
}

/// Output of an external command.
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

/// Runs platform tools (`launchctl`, `crontab`).
pub trait CommandRunner: Send + Sync {
    fn run(&self, program: &str, args: &[&str], stdin: Option<&str>) -> std::io::Result<CommandOutput>;
}

/// [`CommandRunner`] backed by `std::process`.
pub struct SystemCommandRunner;

impl CommandRunner for SystemCommandRunner {
    fn run(&self, program: &str, args: &[&str], stdin: Option<&str>) -> std::io::Result<CommandOutput> {
        let mut cmd = Command::new(program);
        cmd.args(args)
            .stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = cmd.spawn()?;
        if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
            pipe.write_all(input.as_bytes())?;
        }
        let out = child.wait_with_output()?;

        Ok(CommandOutput {
            success: out.status.success(),
            stdout: String::from_utf8_lossy(&out.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&out.stderr).into_owned(),
        })
    }
}

/// Run a command and turn spawn failures or non-zero exits into errors.
pub(crate) fn run_checked(
    runner: &dyn CommandRunner,
    program: &str,
    args: &[&str],
    stdin: Option<&str>,
) -> Result<CommandOutput, SchedulerError> {
    let command = std::iter::once(program)
        .chain(args.iter().copied())
        .collect::<Vec<_>>()
        .join(" ");
    let out = runner
        .run(program, args, stdin)
        .map_err(|e| SchedulerError::Command {
            command: command.clone(),
            detail: e.to_string(),
        })?;
    if !out.success {
        return Err(SchedulerError::Command {
            command,
            detail: out.stderr.trim().to_string(),
        });
    }
    Ok(out)
}

/// Pick the backend for this machine.
pub fn detect() -> SchedulerKind {
    if cfg!(target_os = "macos") {
        SchedulerKind::Launchd
    } else if cfg!(unix) && which::which("crontab").is_ok() {
        SchedulerKind::Crontab
    } else {
        SchedulerKind::Unsupported
    }
}

/// Resolve the configured backend choice to a concrete kind.
pub fn resolve_kind(choice: BackendChoice) -> SchedulerKind {
    match choice {
        BackendChoice::Auto => detect(),
        BackendChoice::Launchd => SchedulerKind::Launchd,
        BackendChoice::Crontab => SchedulerKind::Crontab,
        BackendChoice::None => SchedulerKind::Unsupported,
    }
}

/// The OS scheduler, as seen by the rest of the crate.
pub struct SchedulerPort {
    backend: Option<Box<dyn SchedulerBackend>>,
}

impl SchedulerPort {
    /// Build the port for `kind` using paths from `config`.
    pub fn from_config(kind: SchedulerKind, config: &CadenceConfig) -> Self {
        let runner: Arc<dyn CommandRunner> = Arc::new(SystemCommandRunner);
        let program = config
            .scheduler
            .program
            .clone()
            .or_else(|| std::env::current_exe().ok())
            .unwrap_or_else(|| PathBuf::from("cadence"));
        let log_dir = config.log_dir();

        let backend: Option<Box<dyn SchedulerBackend>> = match kind {
            SchedulerKind::Launchd => Some(Box::new(LaunchdBackend::new(
                config.launch_agents_dir(),
                config.scheduler.label_prefix.clone(),
                program,
                log_dir,
                runner,
            ))),
            SchedulerKind::Crontab => Some(Box::new(CrontabBackend::new(program, log_dir, runner))),
            SchedulerKind::Unsupported => None,
        };
        Self { backend }
    }

    pub fn with_backend(backend: Box<dyn SchedulerBackend>) -> Self {
        Self {
            backend: Some(backend),
        }
    }

    pub fn unsupported() -> Self {
        Self { backend: None }
    }

    pub fn scheduler_kind(&self) -> SchedulerKind {
        self.backend
            .as_ref()
            .map(|b| b.kind())
            .unwrap_or(SchedulerKind::Unsupported)
    }

    fn backend(&self) -> Result<&dyn SchedulerBackend, SchedulerError> {
        self.backend
            .as_deref()
            .ok_or_else(|| SchedulerError::Unsupported {
                platform: std::env::consts::OS.to_string(),
            })
    }

    /// Register (or re-register) `task` with the OS scheduler.
    pub fn schedule(&self, task: &ScheduledTask, options: ScheduleOptions) -> Result<(), SchedulerError> {
        let backend = self.backend()?;
        task.validate()?;
        backend.install(task, options)?;
        info!(task = %task.name, backend = %backend.kind(), run_at_load = options.run_at_load, "Task scheduled");
        Ok(())
    }

    pub fn unschedule(&self, name: &str) -> Result<(), SchedulerError> {
        let backend = self.backend()?;
        backend.remove(name)?;
        info!(task = %name, backend = %backend.kind(), "Task unscheduled");
        Ok(())
    }

    /// `false` on unsupported platforms and when the backend cannot be read.
    pub fn is_scheduled(&self, name: &str) -> bool {
        let Some(backend) = self.backend.as_deref() else {
            return false;
        };
        backend.is_installed(name).unwrap_or_else(|e| {
            warn!(task = %name, "Could not query OS scheduler: {}", e);
            false
        })
    }

    pub fn list_scheduled(&self) -> Result<Vec<ScheduledEntry>, SchedulerError> {
        self.backend()?.list()
    }
}
