//! Local process execution
//!
//! Runs an [`Execute`] command on this machine and reports the outcome in the
//! same shape the debug server uses for remote executions.

use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;

use crate::types::{Execute, ExecutionCompleted, ExecutionStatus};

#[derive(Error, Debug)]
pub enum ProcessError {
    #[error("Failed to start process: {0}")]
    StartError(#[from] std::io::Error),
    #[error("Unbalanced quotes in arguments: {0}")]
    InvalidArguments(String),
    #[error("Process was cancelled")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, ProcessError>;

pub struct ObservableProcess {
    command: Execute,
}

impl ObservableProcess {
    pub fn new(command: Execute) -> Self {
        Self { command }
    }

    /// Runs the process to completion (or timeout) and captures its output.
    ///
    /// Launch failures are reported as [`ExecutionStatus::CouldNotLaunch`],
    /// not as errors; only cancellation is an error.
    pub async fn start_and_observe(&self, cancel: &CancellationToken) -> Result<ExecutionCompleted> {
        let mut child = match self.spawn() {
            Ok(child) => child,
            Err(e) => {
                log::warn!("Could not launch {}: {}", self.command.executable, e);
                return Ok(Self::completed(ExecutionStatus::CouldNotLaunch, -1, String::new(), e.to_string()));
            }
        };
        log::debug!("Started {} with PID: {:?}", self.command.executable, child.id());

        if !self.command.wait_for_completion {
            // Detached: the child keeps running after the handle is dropped
            return Ok(Self::completed(ExecutionStatus::Completed, 0, String::new(), String::new()));
        }

        let mut stdout = child.stdout.take();
        let mut stderr = child.stderr.take();
        let read_out = async {
            let mut buf = Vec::new();
            if let Some(s) = stdout.as_mut() {
                let _ = s.read_to_end(&mut buf).await;
            }
            buf
        };
        let read_err = async {
            let mut buf = Vec::new();
            if let Some(s) = stderr.as_mut() {
                let _ = s.read_to_end(&mut buf).await;
            }
            buf
        };
        let run = async { tokio::join!(read_out, read_err, child.wait()) };

        let timeout = match self.command.execution_timeout_secs {
            0 => None,
            secs => Some(Duration::from_secs(u64::from(secs))),
        };

        let outcome = tokio::select! {
            _ = cancel.cancelled() => return Err(ProcessError::Cancelled),
            res = async {
                match timeout {
                    Some(limit) => tokio::time::timeout(limit, run).await.ok(),
                    None => Some(run.await),
                }
            } => res,
        };

        // Dropping `child` after a timeout or cancellation kills the process (kill_on_drop)
        match outcome {
            Some((out, err, status)) => {
                let exit_code = status.ok().and_then(|s| s.code()).unwrap_or(-1);
                log::debug!("{} exited with code {}", self.command.executable, exit_code);
                Ok(Self::completed(
                    ExecutionStatus::Completed,
                    exit_code,
                    String::from_utf8_lossy(&out).into_owned(),
                    String::from_utf8_lossy(&err).into_owned(),
                ))
            }
            None => {
                log::warn!(
                    "{} exceeded the {}s timeout and is terminated",
                    self.command.executable,
                    self.command.execution_timeout_secs
                );
                Ok(Self::completed(ExecutionStatus::TimedOut, -1, String::new(), String::new()))
            }
        }
    }

    fn spawn(&self) -> Result<Child> {
        if self.command.run_as_administrator {
            log::warn!("Elevation is not supported for local execution, running {} as the current user", self.command.executable);
        }
        let args = split_arguments(&self.command.arguments)?;

        let mut command = Command::new(&self.command.executable);
        command
            .args(args)
            .envs(&self.command.environment_variables)
            .stdin(Stdio::null())
            .kill_on_drop(self.command.wait_for_completion);
        if self.command.wait_for_completion {
            command.stdout(Stdio::piped()).stderr(Stdio::piped());
        } else {
            command.stdout(Stdio::null()).stderr(Stdio::null());
        }
        if !self.command.working_directory.is_empty() {
            command.current_dir(&self.command.working_directory);
        }
        Ok(command.spawn()?)
    }

    fn completed(status: ExecutionStatus, exit_code: i32, stdout: String, stderr: String) -> ExecutionCompleted {
        ExecutionCompleted { status, exit_code, stdout, stderr }
    }
}

/// Splits a command line on whitespace, keeping double-quoted runs together.
pub fn split_arguments(line: &str) -> Result<Vec<String>> {
    let mut args = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut has_token = false;

    for c in line.chars() {
        match c {
            '"' => {
                in_quotes = !in_quotes;
                has_token = true;
            }
            c if c.is_whitespace() && !in_quotes => {
                if has_token {
                    args.push(std::mem::take(&mut current));
                    has_token = false;
                }
            }
            c => {
                current.push(c);
                has_token = true;
            }
        }
    }
    if in_quotes {
        return Err(ProcessError::InvalidArguments(line.to_string()));
    }
    if has_token {
        args.push(current);
    }
    Ok(args)
}
