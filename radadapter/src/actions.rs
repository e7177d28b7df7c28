//! Action definitions and run results
//!
//! An action is a named, ordered list of steps. Steps are deserialized from
//! profile files with a `type` tag, e.g. `type = "copy_file"`.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::fmt::Write as _;
use std::time::Instant;

use crate::break_state::BreakState;

fn yes() -> bool {
    true
}

/// Machine a step operates on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepEnvironment {
    Local,
    #[default]
    Remote,
}

impl StepEnvironment {
    pub fn machine(self) -> &'static str {
        match self {
            StepEnvironment::Local => "local",
            StepEnvironment::Remote => "remote",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CopyDirection {
    RemoteToLocal,
    LocalToRemote,
    LocalToLocal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CopyFileStep {
    pub direction: CopyDirection,
    pub source_path: String,
    pub target_path: String,
    /// Fail the step if the remote source is unchanged since the run started
    #[serde(default)]
    pub check_timestamp: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecuteStep {
    #[serde(default)]
    pub environment: StepEnvironment,
    pub executable: String,
    #[serde(default)]
    pub arguments: String,
    /// Empty means the environment's working directory
    #[serde(default)]
    pub working_directory: String,
    #[serde(default)]
    pub run_as_admin: bool,
    #[serde(default = "yes")]
    pub wait_for_completion: bool,
    #[serde(default)]
    pub timeout_secs: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenInEditorStep {
    pub path: String,
    #[serde(default)]
    pub line_marker: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunActionStep {
    pub name: String,
    /// Filled in from the named action when the profile is loaded
    #[serde(default)]
    pub steps: Vec<ActionStep>,
}

/// A file read by [`ReadDebugDataStep`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuiltinActionFile {
    #[serde(default)]
    pub location: StepEnvironment,
    pub path: String,
    /// Fail if the file was not rewritten during the run
    #[serde(default = "yes")]
    pub check_timestamp: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadDebugDataStep {
    pub output_file: BuiltinActionFile,
    #[serde(default)]
    pub watches_file: Option<BuiltinActionFile>,
    #[serde(default)]
    pub dispatch_params_file: Option<BuiltinActionFile>,
    #[serde(default = "yes")]
    pub binary_output: bool,
    /// Header size: bytes for binary output, lines for text output
    #[serde(default)]
    pub output_offset: u32,
}

impl ReadDebugDataStep {
    pub fn files(&self) -> impl Iterator<Item = &BuiltinActionFile> {
        self.watches_file
            .iter()
            .chain(self.dispatch_params_file.iter())
            .chain(std::iter::once(&self.output_file))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifyFileModifiedStep {
    #[serde(default)]
    pub location: StepEnvironment,
    pub path: String,
    /// When false, an unmodified file only produces a warning
    #[serde(default = "yes")]
    pub abort_if_not_modified: bool,
    #[serde(default)]
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ActionStep {
    CopyFile(CopyFileStep),
    Execute(ExecuteStep),
    OpenInEditor(OpenInEditorStep),
    RunAction(RunActionStep),
    ReadDebugData(ReadDebugDataStep),
    VerifyFileModified(VerifyFileModifiedStep),
}

impl ActionStep {
    /// Steps reported for progress, nested actions included
    pub fn total_step_count(steps: &[ActionStep]) -> usize {
        steps
            .iter()
            .map(|step| match step {
                ActionStep::RunAction(run) => 1 + Self::total_step_count(&run.steps),
                _ => 1,
            })
            .sum()
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ActionStep::CopyFile(_) => "Copy File",
            ActionStep::Execute(_) => "Execute",
            ActionStep::OpenInEditor(_) => "Open in Editor",
            ActionStep::RunAction(_) => "Run Action",
            ActionStep::ReadDebugData(_) => "Read Debug Data",
            ActionStep::VerifyFileModified(_) => "Verify File Modified",
        }
    }
}

impl fmt::Display for ActionStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActionStep::CopyFile(s) => {
                let arrow = match s.direction {
                    CopyDirection::RemoteToLocal => "remote -> local",
                    CopyDirection::LocalToRemote => "local -> remote",
                    CopyDirection::LocalToLocal => "local -> local",
                };
                write!(f, "Copy {} to {} ({})", s.source_path, s.target_path, arrow)
            }
            ActionStep::Execute(s) => {
                write!(f, "Execute ({}) {}", s.environment.machine(), s.executable)?;
                if !s.arguments.is_empty() {
                    write!(f, " {}", s.arguments)?;
                }
                Ok(())
            }
            ActionStep::OpenInEditor(s) => write!(f, "Open {}", s.path),
            ActionStep::RunAction(s) => write!(f, "Run {}", s.name),
            ActionStep::ReadDebugData(s) => write!(f, "Read debug data from {}", s.output_file.path),
            ActionStep::VerifyFileModified(s) => {
                write!(f, "Verify {} ({}) is modified", s.path, s.location.machine())
            }
        }
    }
}

/// Outcome of one step. Failures are recorded here rather than raised.
#[derive(Debug, Default, Serialize)]
pub struct StepResult {
    pub successful: bool,
    pub warning: String,
    pub log: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sub_action: Option<Box<ActionRunResult>>,
    #[serde(skip)]
    pub break_state: Option<BreakState>,
}

impl StepResult {
    pub fn success() -> Self {
        Self { successful: true, ..Self::default() }
    }

    pub fn success_with_log(log: impl Into<String>) -> Self {
        Self { successful: true, log: log.into(), ..Self::default() }
    }

    pub fn failure(warning: impl Into<String>) -> Self {
        Self { successful: false, warning: warning.into(), ..Self::default() }
    }

    pub fn new(successful: bool, warning: impl Into<String>, log: impl Into<String>) -> Self {
        Self { successful, warning: warning.into(), log: log.into(), ..Self::default() }
    }
}

/// Timing and results of one action run.
///
/// `step_results` always has one entry per step; steps that never ran keep
/// the default (unsuccessful) result.
#[derive(Debug, Serialize)]
pub struct ActionRunResult {
    pub action_name: String,
    pub continue_on_error: bool,
    pub steps: Vec<ActionStep>,
    pub step_run_millis: Vec<u64>,
    pub step_results: Vec<StepResult>,
    pub init_timestamp_fetch_millis: u64,
    pub total_millis: u64,
    #[serde(skip)]
    steps_run: usize,
    #[serde(skip)]
    started: Instant,
    #[serde(skip)]
    last_sample_millis: u64,
}

impl ActionRunResult {
    pub fn new(action_name: impl Into<String>, steps: Vec<ActionStep>, continue_on_error: bool) -> Self {
        let count = steps.len();
        Self {
            action_name: action_name.into(),
            continue_on_error,
            steps,
            step_run_millis: vec![0; count],
            step_results: std::iter::repeat_with(StepResult::default).take(count).collect(),
            init_timestamp_fetch_millis: 0,
            total_millis: 0,
            steps_run: 0,
            started: Instant::now(),
            last_sample_millis: 0,
        }
    }

    fn elapsed_millis(&self) -> u64 {
        u64::try_from(self.started.elapsed().as_millis()).unwrap_or(u64::MAX)
    }

    /// Time since the previous sample, so consecutive intervals add up to the total
    fn measure_interval(&mut self) -> u64 {
        let now = self.elapsed_millis();
        let interval = now - self.last_sample_millis;
        self.last_sample_millis = now;
        interval
    }

    pub fn record_init_timestamp_fetch(&mut self) {
        self.init_timestamp_fetch_millis = self.measure_interval();
    }

    pub fn record_step(&mut self, index: usize, result: StepResult) {
        self.step_run_millis[index] = self.measure_interval();
        self.step_results[index] = result;
        self.steps_run = self.steps_run.max(index + 1);
    }

    pub fn finish_run(&mut self) {
        self.total_millis = self.elapsed_millis();
    }

    pub fn successful(&self) -> bool {
        self.step_results.iter().all(|r| r.successful)
    }

    pub fn steps_run(&self) -> usize {
        self.steps_run
    }

    /// Moves the break state out of the last step that produced one,
    /// searching nested actions as well.
    pub fn take_break_state(&mut self) -> Option<BreakState> {
        self.step_results.iter_mut().rev().find_map(|result| {
            if result.break_state.is_some() {
                return result.break_state.take();
            }
            result.sub_action.as_mut().and_then(|sub| sub.take_break_state())
        })
    }

    /// Human-readable per-step report
    pub fn summary(&self) -> String {
        let mut out = String::new();
        self.write_summary(&mut out, 0);
        out
    }

    fn write_summary(&self, out: &mut String, depth: usize) {
        let indent = "  ".repeat(depth);
        let _ = writeln!(
            out,
            "{}=== Action {} {} in {}ms (timestamp fetch: {}ms)",
            indent,
            self.action_name,
            if self.successful() { "succeeded" } else { "failed" },
            self.total_millis,
            self.init_timestamp_fetch_millis
        );

        for (i, step) in self.steps.iter().enumerate() {
            if i >= self.steps_run {
                let _ = writeln!(out, "{}[{}] {} SKIPPED", indent, i + 1, step);
                continue;
            }
            let result = &self.step_results[i];
            let status = if result.successful { "OK" } else { "FAILED" };
            let _ = writeln!(out, "{}[{}] {} {} in {}ms", indent, i + 1, step, status, self.step_run_millis[i]);
            if !result.warning.is_empty() {
                let _ = writeln!(out, "{}    {}", indent, result.warning);
            }
            for line in result.log.lines().filter(|l| !l.is_empty()) {
                let _ = writeln!(out, "{}    {}", indent, line);
            }
            if let Some(sub) = &result.sub_action {
                sub.write_summary(out, depth + 1);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn execute(executable: &str) -> ActionStep {
        ActionStep::Execute(ExecuteStep {
            environment: StepEnvironment::Remote,
            executable: executable.into(),
            arguments: String::new(),
            working_directory: String::new(),
            run_as_admin: false,
            wait_for_completion: true,
            timeout_secs: 0,
        })
    }

    #[test]
    fn test_total_step_count_includes_nested() {
        let nested = ActionStep::RunAction(RunActionStep {
            name: "Build".into(),
            steps: vec![
                execute("make"),
                ActionStep::RunAction(RunActionStep { name: "Deep".into(), steps: vec![execute("true")] }),
            ],
        });
        let steps = vec![execute("a"), nested];
        assert_eq!(ActionStep::total_step_count(&steps), 5);
    }

    #[test]
    fn test_step_deserialization_defaults() {
        let step: ActionStep = serde_json::from_str(
            r#"{"type": "verify_file_modified", "path": "/tmp/out.bin"}"#,
        )
        .unwrap();
        match step {
            ActionStep::VerifyFileModified(s) => {
                assert_eq!(s.location, StepEnvironment::Remote);
                assert!(s.abort_if_not_modified);
                assert_eq!(s.error_message, None);
            }
            other => panic!("unexpected step: {:?}", other),
        }

        let step: ActionStep = serde_json::from_str(
            r#"{"type": "read_debug_data", "output_file": {"path": "out.bin", "location": "local"}}"#,
        )
        .unwrap();
        match step {
            ActionStep::ReadDebugData(s) => {
                assert!(s.binary_output);
                assert!(s.output_file.check_timestamp);
                assert_eq!(s.output_file.location, StepEnvironment::Local);
                assert_eq!(s.files().count(), 1);
            }
            other => panic!("unexpected step: {:?}", other),
        }
    }

    #[test]
    fn test_run_result_is_fully_sized_and_reports_skipped() {
        let mut result = ActionRunResult::new("Debug", vec![execute("a"), execute("b"), execute("c")], false);
        result.record_init_timestamp_fetch();
        result.record_step(0, StepResult::success_with_log("ok\r\n"));
        result.record_step(1, StepResult::failure("boom"));
        result.finish_run();

        assert_eq!(result.step_results.len(), 3);
        assert_eq!(result.step_run_millis.len(), 3);
        assert!(!result.successful());
        assert!(!result.step_results[2].successful);
        assert_eq!(result.steps_run(), 2);

        let summary = result.summary();
        assert!(summary.contains("Action Debug failed"));
        assert!(summary.contains("[2] Execute (remote) b FAILED"));
        assert!(summary.contains("    boom"));
        assert!(summary.contains("[3] Execute (remote) c SKIPPED"));
    }

    #[test]
    fn test_empty_action_is_successful() {
        let mut result = ActionRunResult::new("Empty", Vec::new(), true);
        result.finish_run();
        assert!(result.successful());
    }

    #[test]
    fn test_serializes_without_break_state() {
        let mut result = ActionRunResult::new("Build", vec![execute("make")], true);
        result.record_step(0, StepResult::success());
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["action_name"], "Build");
        assert_eq!(json["steps"][0]["type"], "execute");
        assert_eq!(json["step_results"][0]["successful"], true);
        assert!(json["step_results"][0].get("break_state").is_none());
    }
}
