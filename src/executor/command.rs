//! Executor that runs a configured program per task.
//!
//! Arguments may contain `{task}`, `{executor}` and `{trigger}` placeholders.
//! The default configuration (`sh -c {executor}`) treats a task's executor id
//! as a shell command line.

use std::process::Stdio;
use std::time::Duration;

use anyhow::Result;
use tracing::{debug, info};

use super::{ExecutorError, TaskExecutor};
use crate::config::ExecutorConfig;
use crate::history::TriggeredBy;
use crate::tasks::ScheduledTask;

/// Bytes of stderr kept in a failure message.
const STDERR_TAIL: usize = 512;

pub struct CommandExecutor {
    program: String,
    args: Vec<String>,
    timeout: Option<Duration>,
}

impl CommandExecutor {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            timeout: None,
        }
    }

    pub fn from_config(config: &ExecutorConfig) -> Self {
        Self {
            program: config.program.clone(),
            args: config.args.clone(),
            timeout: config.timeout_secs.map(Duration::from_secs),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    fn expand_args(&self, task: &ScheduledTask, triggered_by: TriggeredBy) -> Vec<String> {
        let trigger = triggered_by.to_string();
        self.args
            .iter()
            .map(|arg| {
                arg.replace("{task}", &task.name)
                    .replace("{executor}", &task.executor_id)
                    .replace("{trigger}", &trigger)
            })
            .collect()
    }
}

#[async_trait::async_trait]
impl TaskExecutor for CommandExecutor {
    async fn execute(&self, task: &ScheduledTask, triggered_by: TriggeredBy) -> Result<()> {
        if self.program.trim().is_empty() {
            return Err(ExecutorError::NotConfigured.into());
        }

        let args = self.expand_args(task, triggered_by);
        debug!(task = %task.name, program = %self.program, ?args, "spawning executor");

        let mut cmd = tokio::process::Command::new(&self.program);
        cmd.args(&args)
            .env("CADENCE_TASK", &task.name)
            .env("CADENCE_EXECUTOR", &task.executor_id)
            .env("CADENCE_TRIGGER", triggered_by.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if triggered_by.is_headless() {
            cmd.env("CADENCE_HEADLESS", "1");
        }

        let child = cmd.spawn().map_err(|source| ExecutorError::Spawn {
            program: self.program.clone(),
            source,
        })?;

        let output = match self.timeout {
            Some(limit) => match tokio::time::timeout(limit, child.wait_with_output()).await {
                Ok(output) => output,
                Err(_) => {
                    return Err(ExecutorError::TimedOut {
                        program: self.program.clone(),
                        secs: limit.as_secs(),
                    }
                    .into())
                }
            },
            None => child.wait_with_output().await,
        }
        .map_err(|source| ExecutorError::Spawn {
            program: self.program.clone(),
            source,
        })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ExecutorError::Exit {
                program: self.program.clone(),
                status: output.status.to_string(),
                stderr: tail(stderr.trim(), STDERR_TAIL).to_string(),
            }
            .into());
        }

        info!(
            task = %task.name,
            trigger = %triggered_by,
            stdout_bytes = output.stdout.len(),
            "executor finished"
        );
        Ok(())
    }
}

fn tail(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut start = s.len() - max;
    while !s.is_char_boundary(start) {
        start += 1;
    }
    &s[start..]
}
