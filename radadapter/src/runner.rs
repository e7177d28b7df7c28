//! Action runner
//!
//! Executes action steps in order against a [`Channel`], timing each one and
//! recording a [`StepResult`] per step. Step failures are data; only
//! connection errors and cancellation end a run early with an error.

use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::actions::*;
use crate::break_state::{BreakState, BreakStateData, BreakStateOutputFile};
use crate::communication::{Channel, ChannelError, Result};
use crate::parser::{dwords_to_bytes, parse_text_output, parse_valid_watches, BreakStateDispatchParameters};
use crate::process::{ObservableProcess, ProcessError};
use crate::types::*;

/// Hooks for the host application
pub trait ActionRunnerCallbacks: Send + Sync {
    fn on_next_step_started(&self) {}

    fn on_open_file_in_editor_requested(&self, _path: &str, _line_marker: &str) {}
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopCallbacks;

impl ActionRunnerCallbacks for NoopCallbacks {}

/// Paths and watches the steps are evaluated against
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActionEnvironment {
    pub local_workdir: String,
    pub remote_workdir: String,
    pub watches: Vec<String>,
}

type RunFuture<'a> = Pin<Box<dyn Future<Output = Result<ActionRunResult>> + Send + 'a>>;

pub struct ActionRunner {
    channel: Arc<dyn Channel>,
    callbacks: Arc<dyn ActionRunnerCallbacks>,
    environment: ActionEnvironment,
    initial_timestamps: HashMap<(StepEnvironment, String), Timestamp>,
}

impl ActionRunner {
    pub fn new(
        channel: Arc<dyn Channel>,
        callbacks: Arc<dyn ActionRunnerCallbacks>,
        environment: ActionEnvironment,
    ) -> Self {
        Self {
            channel,
            callbacks,
            environment,
            initial_timestamps: HashMap::new(),
        }
    }

    /// Timestamp recorded before the first step ran; unset if the file was missing
    pub fn initial_timestamp(&self, location: StepEnvironment, path: &str) -> Timestamp {
        self.initial_timestamps
            .get(&(location, path.to_string()))
            .copied()
            .unwrap_or_default()
    }

    /// Runs `steps` in order. With `continue_on_error` false the run stops at
    /// the first failed step; later steps are never attempted.
    pub async fn run(
        &mut self,
        action_name: &str,
        steps: &[ActionStep],
        continue_on_error: bool,
        cancel: &CancellationToken,
    ) -> Result<ActionRunResult> {
        log::debug!("Running action {} ({} steps)", action_name, steps.len());
        let mut result = ActionRunResult::new(action_name, steps.to_vec(), continue_on_error);

        self.fill_initial_timestamps(steps, cancel).await?;
        result.record_init_timestamp_fetch();

        self.run_steps(result, continue_on_error, cancel).await
    }

    fn run_steps<'a>(
        &'a mut self,
        mut result: ActionRunResult,
        continue_on_error: bool,
        cancel: &'a CancellationToken,
    ) -> RunFuture<'a> {
        Box::pin(async move {
            for i in 0..result.steps.len() {
                if cancel.is_cancelled() {
                    return Err(ChannelError::Cancelled);
                }
                self.callbacks.on_next_step_started();

                let step = result.steps[i].clone();
                log::debug!("Step {}: {}", i + 1, step);
                let step_result = match &step {
                    ActionStep::CopyFile(s) => self.do_copy(s, cancel).await?,
                    ActionStep::Execute(s) => self.do_execute(s, cancel).await?,
                    ActionStep::OpenInEditor(s) => self.do_open_in_editor(s),
                    ActionStep::RunAction(s) => self.do_run_action(s, continue_on_error, cancel).await?,
                    ActionStep::ReadDebugData(s) => self.do_read_debug_data(s, cancel).await?,
                    ActionStep::VerifyFileModified(s) => self.do_verify_file_modified(s, cancel).await?,
                };

                let failed = !step_result.successful;
                if failed {
                    log::warn!("Step {} ({}) failed: {}", i + 1, step.kind(), step_result.warning);
                }
                result.record_step(i, step_result);
                if failed && !continue_on_error {
                    break;
                }
            }
            result.finish_run();
            Ok(result)
        })
    }

    async fn fill_initial_timestamps(&mut self, steps: &[ActionStep], cancel: &CancellationToken) -> Result<()> {
        let mut files = Vec::new();
        collect_timestamp_files(steps, &mut files);
        files.dedup();

        for (location, path) in files {
            if self.initial_timestamps.contains_key(&(location, path.clone())) {
                continue;
            }
            let timestamp = match location {
                StepEnvironment::Local => local_timestamp(&self.local_path(&path)).await.unwrap_or_default(),
                StepEnvironment::Remote => self.remote_timestamp(&path, cancel).await?,
            };
            log::trace!("Initial timestamp of {} ({}): {}", path, location.machine(), timestamp);
            self.initial_timestamps.insert((location, path), timestamp);
        }
        Ok(())
    }

    async fn remote_timestamp(&self, path: &str, cancel: &CancellationToken) -> Result<Timestamp> {
        let metadata = self
            .channel
            .fetch_metadata(FetchMetadata { file_path: path.to_string(), binary_output: true }, cancel)
            .await?;
        Ok(match metadata.status {
            FetchStatus::Successful => metadata.timestamp,
            FetchStatus::FileNotFound => Timestamp::default(),
        })
    }

    fn local_path(&self, path: &str) -> PathBuf {
        let path = Path::new(path);
        if path.is_absolute() || self.environment.local_workdir.is_empty() {
            path.to_path_buf()
        } else {
            Path::new(&self.environment.local_workdir).join(path)
        }
    }

    fn is_unchanged(&self, location: StepEnvironment, path: &str, current: Timestamp) -> bool {
        self.initial_timestamp(location, path) == current
    }

    async fn do_copy(&self, step: &CopyFileStep, cancel: &CancellationToken) -> Result<StepResult> {
        match step.direction {
            CopyDirection::LocalToLocal => {
                if step.source_path == step.target_path {
                    return Ok(StepResult::success_with_log(
                        "Copy skipped. The source and target locations are identical.\r\n",
                    ));
                }
                let data = match read_local_file(&self.local_path(&step.source_path), 0).await {
                    Ok(data) => data,
                    Err(e) => return Ok(StepResult::failure(e)),
                };
                Ok(match write_local_file(&self.local_path(&step.target_path), &data).await {
                    Ok(()) => StepResult::success(),
                    Err(e) => StepResult::failure(e),
                })
            }
            CopyDirection::LocalToRemote => {
                let data = match read_local_file(&self.local_path(&step.source_path), 0).await {
                    Ok(data) => data,
                    Err(e) => return Ok(StepResult::failure(e)),
                };
                let command = PutFile {
                    path: step.target_path.clone(),
                    working_dir: self.environment.remote_workdir.clone(),
                    data,
                };
                let response = self.channel.put_file(command, cancel).await?;
                Ok(match response.status {
                    WriteStatus::Successful => StepResult::success(),
                    WriteStatus::PermissionDenied => StepResult::failure(format!(
                        "Access denied. Failed to write remote file {}. Make sure that the path is not marked as read-only.",
                        step.target_path
                    )),
                    WriteStatus::OtherIOError => {
                        StepResult::failure(format!("Failed to write remote file {}.", step.target_path))
                    }
                })
            }
            CopyDirection::RemoteToLocal => {
                let response = self
                    .channel
                    .fetch_result_range(whole_file(&step.source_path), cancel)
                    .await?;
                if response.status == FetchStatus::FileNotFound {
                    return Ok(StepResult::failure(format!(
                        "File is not found on the remote machine at {}",
                        step.source_path
                    )));
                }
                if step.check_timestamp && self.is_unchanged(StepEnvironment::Remote, &step.source_path, response.timestamp) {
                    return Ok(StepResult::failure(format!(
                        "File is not changed on the remote machine at {}",
                        step.source_path
                    )));
                }
                Ok(match write_local_file(&self.local_path(&step.target_path), &response.data).await {
                    Ok(()) => StepResult::success(),
                    Err(e) => StepResult::failure(e),
                })
            }
        }
    }

    async fn do_execute(&self, step: &ExecuteStep, cancel: &CancellationToken) -> Result<StepResult> {
        let working_directory = if step.working_directory.is_empty() {
            match step.environment {
                StepEnvironment::Local => self.environment.local_workdir.clone(),
                StepEnvironment::Remote => self.environment.remote_workdir.clone(),
            }
        } else {
            step.working_directory.clone()
        };
        let command = Execute {
            working_directory,
            executable: step.executable.clone(),
            arguments: step.arguments.clone(),
            run_as_administrator: step.run_as_admin,
            wait_for_completion: step.wait_for_completion,
            execution_timeout_secs: step.timeout_secs,
            ..Execute::default()
        };

        let response = match step.environment {
            StepEnvironment::Local => match ObservableProcess::new(command).start_and_observe(cancel).await {
                Ok(response) => response,
                Err(ProcessError::Cancelled) => return Err(ChannelError::Cancelled),
                Err(e) => ExecutionCompleted {
                    status: ExecutionStatus::CouldNotLaunch,
                    exit_code: -1,
                    stdout: String::new(),
                    stderr: e.to_string(),
                },
            },
            StepEnvironment::Remote => self.channel.execute(command, cancel).await?,
        };

        Ok(classify_execution(step, &response))
    }

    fn do_open_in_editor(&self, step: &OpenInEditorStep) -> StepResult {
        self.callbacks.on_open_file_in_editor_requested(&step.path, &step.line_marker);
        StepResult::success()
    }

    async fn do_run_action(
        &mut self,
        step: &RunActionStep,
        continue_on_error: bool,
        cancel: &CancellationToken,
    ) -> Result<StepResult> {
        // Timestamps of nested steps were collected with the top-level ones
        let mut nested = ActionRunResult::new(step.name.clone(), step.steps.clone(), continue_on_error);
        nested.record_init_timestamp_fetch();
        let sub = self.run_steps(nested, continue_on_error, cancel).await?;
        Ok(StepResult {
            successful: sub.successful(),
            sub_action: Some(Box::new(sub)),
            ..StepResult::default()
        })
    }

    async fn do_read_debug_data(&self, step: &ReadDebugDataStep, cancel: &CancellationToken) -> Result<StepResult> {
        let watches = match &step.watches_file {
            Some(file) => match self.read_debug_data_file("Valid watches", file, cancel).await? {
                Ok(data) => parse_valid_watches(&String::from_utf8_lossy(&data)),
                Err(e) => return Ok(StepResult::failure(e)),
            },
            None => self.environment.watches.clone(),
        };

        let status_text = match &step.dispatch_params_file {
            Some(file) => match self.read_debug_data_file("Dispatch parameters", file, cancel).await? {
                Ok(data) => Some(String::from_utf8_lossy(&data).replace("\r\n", "\n")),
                Err(e) => return Ok(StepResult::failure(e)),
            },
            None => None,
        };

        let output = &step.output_file;
        let data = match output.location {
            StepEnvironment::Remote => {
                let metadata = self
                    .channel
                    .fetch_metadata(
                        FetchMetadata { file_path: output.path.clone(), binary_output: step.binary_output },
                        cancel,
                    )
                    .await?;
                if metadata.status == FetchStatus::FileNotFound {
                    return Ok(StepResult::failure(format!(
                        "Debug data is missing. Output file could not be found on the remote machine at {}",
                        output.path
                    )));
                }
                if output.check_timestamp && self.is_unchanged(StepEnvironment::Remote, &output.path, metadata.timestamp) {
                    return Ok(StepResult::failure(not_modified("Output", &output.path)));
                }
                let header_bytes = if step.binary_output { step.output_offset } else { step.output_offset * 4 };
                let dword_count = (metadata.byte_count.saturating_sub(header_bytes) / 4) as usize;
                let file = BreakStateOutputFile {
                    path: output.path.clone(),
                    binary_output: step.binary_output,
                    offset: step.output_offset,
                    timestamp: metadata.timestamp,
                    dword_count,
                };
                BreakStateData::new(watches, file)
            }
            StepEnvironment::Local => {
                let path = self.local_path(&output.path);
                let timestamp = local_timestamp(&path).await.unwrap_or_default();
                if output.check_timestamp && self.is_unchanged(StepEnvironment::Local, &output.path, timestamp) {
                    return Ok(StepResult::failure(not_modified("Output", &output.path)));
                }
                let skip = if step.binary_output { step.output_offset as u64 } else { 0 };
                let bytes = match read_local_file(&path, skip).await {
                    Ok(bytes) => bytes,
                    Err(e) => return Ok(StepResult::failure(format!("Debug data is missing. {}", e))),
                };
                let bytes = if step.binary_output {
                    bytes
                } else {
                    let text = String::from_utf8_lossy(&bytes);
                    dwords_to_bytes(&parse_text_output(&text, step.output_offset as usize))
                };
                let file = BreakStateOutputFile {
                    path: output.path.clone(),
                    binary_output: step.binary_output,
                    offset: 0,
                    timestamp,
                    dword_count: bytes.len() / 4,
                };
                BreakStateData::from_local(watches, file, &bytes)
            }
        };

        let dispatch_params = match BreakStateDispatchParameters::parse(status_text.as_deref()) {
            Ok(params) => params,
            Err(e) => return Ok(StepResult::failure(e.to_string())),
        };

        let log = format!(
            "Read {} dwords of debug data from {} ({} watches)\r\n",
            data.output_file().dword_count,
            output.path,
            data.watches().len()
        );
        Ok(StepResult {
            successful: true,
            log,
            break_state: Some(BreakState::new(data, dispatch_params)),
            ..StepResult::default()
        })
    }

    /// Reads an auxiliary debug file. The inner error is the step failure message.
    async fn read_debug_data_file(
        &self,
        kind: &str,
        file: &BuiltinActionFile,
        cancel: &CancellationToken,
    ) -> Result<std::result::Result<Vec<u8>, String>> {
        match file.location {
            StepEnvironment::Remote => {
                let response = self.channel.fetch_result_range(whole_file(&file.path), cancel).await?;
                if response.status == FetchStatus::FileNotFound {
                    return Ok(Err(format!(
                        "{} data is missing. File could not be found on the remote machine at {}",
                        kind, file.path
                    )));
                }
                if file.check_timestamp && self.is_unchanged(StepEnvironment::Remote, &file.path, response.timestamp) {
                    return Ok(Err(not_modified(kind, &file.path)));
                }
                Ok(Ok(response.data))
            }
            StepEnvironment::Local => {
                let path = self.local_path(&file.path);
                if file.check_timestamp {
                    let timestamp = local_timestamp(&path).await.unwrap_or_default();
                    if self.is_unchanged(StepEnvironment::Local, &file.path, timestamp) {
                        return Ok(Err(not_modified(kind, &file.path)));
                    }
                }
                Ok(read_local_file(&path, 0)
                    .await
                    .map_err(|e| format!("{} data is missing. {}", kind, e)))
            }
        }
    }

    async fn do_verify_file_modified(
        &self,
        step: &VerifyFileModifiedStep,
        cancel: &CancellationToken,
    ) -> Result<StepResult> {
        let current = match step.location {
            StepEnvironment::Local => match local_timestamp(&self.local_path(&step.path)).await {
                Ok(timestamp) => timestamp,
                Err(e) => {
                    return Ok(StepResult::failure(format!(
                        "Failed to retrieve last write time of local path {}. {}",
                        step.path, e
                    )))
                }
            },
            StepEnvironment::Remote => self.remote_timestamp(&step.path, cancel).await?,
        };

        if !self.is_unchanged(step.location, &step.path, current) {
            return Ok(StepResult::success());
        }
        let warning = match &step.error_message {
            Some(message) if !message.is_empty() => message.clone(),
            _ => format!("File is not modified at {}", step.path),
        };
        Ok(StepResult::new(!step.abort_if_not_modified, warning, ""))
    }
}

fn collect_timestamp_files(steps: &[ActionStep], files: &mut Vec<(StepEnvironment, String)>) {
    for step in steps {
        match step {
            ActionStep::CopyFile(s) if s.check_timestamp && s.direction == CopyDirection::RemoteToLocal => {
                files.push((StepEnvironment::Remote, s.source_path.clone()));
            }
            ActionStep::ReadDebugData(s) => {
                for file in s.files().filter(|f| f.check_timestamp) {
                    files.push((file.location, file.path.clone()));
                }
            }
            ActionStep::VerifyFileModified(s) => files.push((s.location, s.path.clone())),
            ActionStep::RunAction(s) => collect_timestamp_files(&s.steps, files),
            _ => {}
        }
    }
}

fn whole_file(path: &str) -> FetchResultRange {
    FetchResultRange {
        file_path: path.to_string(),
        binary_output: true,
        byte_offset: 0,
        byte_count: 0,
        output_offset: 0,
    }
}

fn not_modified(kind: &str, path: &str) -> String {
    format!("{} file ({}) was not modified. Data may be stale.", kind, path)
}

fn classify_execution(step: &ExecuteStep, response: &ExecutionCompleted) -> StepResult {
    let status = match response.status {
        ExecutionStatus::Completed => format!("exit code {}", response.exit_code),
        ExecutionStatus::TimedOut => "timed out".to_string(),
        ExecutionStatus::CouldNotLaunch => "could not launch".to_string(),
    };
    let stdout = response.stdout.trim_end_matches(['\r', '\n']);
    let stderr = response.stderr.trim_end_matches(['\r', '\n']);

    let mut log = String::new();
    if stdout.is_empty() && stderr.is_empty() {
        log.push_str(&format!("No stdout/stderr captured ({})\r\n", status));
    }
    if !stdout.is_empty() {
        log.push_str(&format!("Captured stdout ({}):\r\n{}\r\n", status, stdout));
    }
    if !stderr.is_empty() {
        log.push_str(&format!("Captured stderr ({}):\r\n{}\r\n", status, stderr));
    }

    let machine = step.environment.machine();
    match response.status {
        ExecutionStatus::Completed if response.exit_code == 0 => StepResult::new(true, "", log),
        ExecutionStatus::Completed => StepResult::new(
            false,
            format!(
                "Check the command output for errors. (The {} `{}` process exited with non-zero code {}.)",
                machine, step.executable, response.exit_code
            ),
            log,
        ),
        ExecutionStatus::TimedOut => StepResult::new(
            false,
            format!(
                "Execution timeout is exceeded. (The {} `{}` process is terminated.)",
                machine, step.executable
            ),
            log,
        ),
        ExecutionStatus::CouldNotLaunch => StepResult::new(
            false,
            format!(
                "Check that the executable is specified correctly. (The {} `{}` process could not be started.)",
                machine, step.executable
            ),
            log,
        ),
    }
}

async fn local_timestamp(path: &Path) -> io::Result<Timestamp> {
    let modified = tokio::fs::metadata(path).await?.modified()?;
    Ok(Timestamp::from_system_time(modified))
}

/// Reads a local file from `byte_offset` to the end. The error is a step
/// failure message.
async fn read_local_file(path: &Path, byte_offset: u64) -> std::result::Result<Vec<u8>, String> {
    match tokio::fs::read(path).await {
        Ok(data) => {
            let skip = usize::try_from(byte_offset).unwrap_or(usize::MAX).min(data.len());
            Ok(data[skip..].to_vec())
        }
        Err(e) => Err(match e.kind() {
            io::ErrorKind::PermissionDenied => format!("Access denied. Failed to read local file {}", path.display()),
            io::ErrorKind::NotFound => format!("File not found. Failed to read local file {}", path.display()),
            _ => format!("Failed to read local file {}. {}", path.display(), e),
        }),
    }
}

/// Writes a local file, creating parent directories. The error is a step
/// failure message.
async fn write_local_file(path: &Path, data: &[u8]) -> std::result::Result<(), String> {
    let write = async {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(path, data).await
    };
    write.await.map_err(|e| match e.kind() {
        io::ErrorKind::PermissionDenied => format!(
            "Access denied. Failed to write local file {}. Make sure that the path is not marked as read-only.",
            path.display()
        ),
        io::ErrorKind::InvalidInput => format!(
            "Failed to write local file {}. The path contains illegal characters.",
            path.display()
        ),
        _ => format!("Failed to write local file {}. {}", path.display(), e),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn execute_step(environment: StepEnvironment) -> ExecuteStep {
        ExecuteStep {
            environment,
            executable: "python3".into(),
            arguments: "build.py".into(),
            working_directory: String::new(),
            run_as_admin: false,
            wait_for_completion: true,
            timeout_secs: 10,
        }
    }

    fn completed(status: ExecutionStatus, exit_code: i32, stdout: &str, stderr: &str) -> ExecutionCompleted {
        ExecutionCompleted { status, exit_code, stdout: stdout.into(), stderr: stderr.into() }
    }

    #[test]
    fn test_classify_success_keeps_output() {
        let step = execute_step(StepEnvironment::Remote);
        let result = classify_execution(&step, &completed(ExecutionStatus::Completed, 0, "built\r\n", ""));
        assert!(result.successful);
        assert!(result.warning.is_empty());
        assert_eq!(result.log, "Captured stdout (exit code 0):\r\nbuilt\r\n");
    }

    #[test]
    fn test_classify_failures() {
        let step = execute_step(StepEnvironment::Remote);

        let result = classify_execution(&step, &completed(ExecutionStatus::Completed, 2, "", "error: x\n"));
        assert!(!result.successful);
        assert!(result.warning.ends_with("(The remote `python3` process exited with non-zero code 2.)"));
        assert_eq!(result.log, "Captured stderr (exit code 2):\r\nerror: x\r\n");

        let result = classify_execution(&step, &completed(ExecutionStatus::TimedOut, 0, "", ""));
        assert_eq!(
            result.warning,
            "Execution timeout is exceeded. (The remote `python3` process is terminated.)"
        );
        assert_eq!(result.log, "No stdout/stderr captured (timed out)\r\n");

        let local = execute_step(StepEnvironment::Local);
        let result = classify_execution(&local, &completed(ExecutionStatus::CouldNotLaunch, 0, "", ""));
        assert_eq!(
            result.warning,
            "Check that the executable is specified correctly. (The local `python3` process could not be started.)"
        );
    }

    #[test]
    fn test_collect_timestamp_files_recurses() {
        let steps = vec![
            ActionStep::CopyFile(CopyFileStep {
                direction: CopyDirection::RemoteToLocal,
                source_path: "/r/out.bin".into(),
                target_path: "out.bin".into(),
                check_timestamp: true,
            }),
            ActionStep::CopyFile(CopyFileStep {
                direction: CopyDirection::LocalToRemote,
                source_path: "a".into(),
                target_path: "/r/a".into(),
                check_timestamp: true,
            }),
            ActionStep::RunAction(RunActionStep {
                name: "Nested".into(),
                steps: vec![ActionStep::VerifyFileModified(VerifyFileModifiedStep {
                    location: StepEnvironment::Local,
                    path: "log.txt".into(),
                    abort_if_not_modified: true,
                    error_message: None,
                })],
            }),
        ];
        let mut files = Vec::new();
        collect_timestamp_files(&steps, &mut files);
        assert_eq!(
            files,
            vec![
                (StepEnvironment::Remote, "/r/out.bin".to_string()),
                (StepEnvironment::Local, "log.txt".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_local_file_errors() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing.bin");
        let err = read_local_file(&missing, 0).await.unwrap_err();
        assert_eq!(err, format!("File not found. Failed to read local file {}", missing.display()));

        let nested = dir.path().join("a/b/c.bin");
        write_local_file(&nested, &[1, 2, 3, 4]).await.unwrap();
        assert_eq!(read_local_file(&nested, 2).await.unwrap(), vec![3, 4]);
    }
}
