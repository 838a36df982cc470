//! Task execution for hive nodes
//!
//! A claimed task is handed to an external command (`runner.command` in the
//! config), run through `bash -c` with the task exposed as environment
//! variables:
//! - `HIVE_TASK_ID`, `HIVE_TASK_TITLE`, `HIVE_TASK_DESCRIPTION`
//! - `HIVE_TASK_SKILLS` (comma separated)
//!
//! Stdout is read line by line. A line `HIVE_PROGRESS <n>` reports progress;
//! every other line feeds the bounded output preview of the next heartbeat.
//! Exit code 0 completes the task, anything else (or the timeout) fails it.

use async_trait::async_trait;
use hive_kernel::config::RunnerConf;
use hive_kernel::error::{HiveError, Result};
use hive_kernel::participant::{ProgressReporter, TaskOutcome, TaskRunner};
use hive_kernel::tasks::TaskState;
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command as AsyncCommand};
use tracing::{debug, info, warn};

pub const PROGRESS_PREFIX: &str = "HIVE_PROGRESS";

#[derive(Debug, Error)]
pub enum ExecError {
    #[error("failed to spawn `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("stdout of the task command was not captured")]
    NoStdout,
    #[error("failed to wait for the task command: {0}")]
    Wait(#[source] std::io::Error),
}

impl From<ExecError> for HiveError {
    fn from(e: ExecError) -> Self {
        HiveError::Runner(e.to_string())
    }
}

/// Parses `HIVE_PROGRESS <n>`; values above 100 are clamped.
pub fn parse_progress(line: &str) -> Option<u8> {
    let rest = line.trim().strip_prefix(PROGRESS_PREFIX)?;
    let value: u32 = rest.trim().trim_end_matches('%').parse().ok()?;
    Some(value.min(100) as u8)
}

pub struct CommandRunner {
    command: String,
    timeout: Duration,
}

impl CommandRunner {
    pub fn new(command: impl Into<String>, timeout: Duration) -> Self {
        Self {
            command: command.into(),
            timeout,
        }
    }

    fn spawn(&self, task: &TaskState) -> std::result::Result<Child, ExecError> {
        AsyncCommand::new("bash")
            .arg("-c")
            .arg(&self.command)
            .env("HIVE_TASK_ID", &task.id)
            .env("HIVE_TASK_TITLE", &task.title)
            .env("HIVE_TASK_DESCRIPTION", &task.description)
            .env("HIVE_TASK_SKILLS", task.required_skills.join(","))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| ExecError::Spawn {
                command: self.command.clone(),
                source,
            })
    }

    async fn stream(&self, child: &mut Child, progress: &mut ProgressReporter<'_>) -> Result<ExitStatus> {
        let stdout = child.stdout.take().ok_or(ExecError::NoStdout)?;
        let mut lines = BufReader::new(stdout).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => match parse_progress(&line) {
                    Some(percent) => progress.report(percent).await?,
                    None => {
                        debug!("[exec] {} | {}", progress.task_id(), line);
                        progress.output(line);
                    }
                },
                Ok(None) => break,
                Err(e) => {
                    warn!("[exec] stdout of {} unreadable: {}", progress.task_id(), e);
                    break;
                }
            }
        }
        Ok(child.wait().await.map_err(ExecError::Wait)?)
    }
}

impl From<&RunnerConf> for CommandRunner {
    fn from(conf: &RunnerConf) -> Self {
        Self::new(conf.command.clone(), Duration::from_secs(conf.timeout_secs))
    }
}

#[async_trait]
impl TaskRunner for CommandRunner {
    async fn run(&self, task: &TaskState, progress: &mut ProgressReporter<'_>) -> Result<TaskOutcome> {
        let started = Instant::now();
        info!("[exec] running {} ({})", task.id, task.title);
        let mut child = self.spawn(task)?;

        let status = match tokio::time::timeout(self.timeout, self.stream(&mut child, progress)).await {
            Ok(status) => status?,
            Err(_) => {
                if let Err(e) = child.kill().await {
                    warn!("[exec] could not kill timed out task {}: {}", task.id, e);
                }
                return Ok(TaskOutcome::Failed {
                    reason: format!("timed out after {:?}", self.timeout),
                });
            }
        };

        info!(
            "[exec] {} exited with {} after {} ms",
            task.id,
            status,
            started.elapsed().as_millis()
        );
        if status.success() {
            Ok(TaskOutcome::Completed)
        } else {
            Ok(TaskOutcome::Failed {
                reason: format!("command exited with {}", status),
            })
        }
    }
}
