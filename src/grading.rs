//! Grading data model: configurations, submissions and results.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::path::{Component, Path};
use std::sync::Arc;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::config::{ByteSize, MilliSecond};
use crate::error::GradingConfigError;
use crate::sandbox::SandboxLimits;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct SubmissionId(pub i64);

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct GradingConfigId(pub i64);

impl fmt::Display for SubmissionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for GradingConfigId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A file handed in by a student, already validated by the web layer
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct SubmittedFile {
    pub name: String,
    pub content: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct Submission {
    pub id: SubmissionId,
    pub grading_config_id: GradingConfigId,
    pub files: Vec<SubmittedFile>,
}

/// Instructor-defined grading configuration.
///
/// Obtained through [`GradingConfig::from_json`] or [`GradingConfig::validate`];
/// once a run starts it is shared read-only behind an `Arc`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct GradingConfig {
    pub id: GradingConfigId,
    /// Name of the resource pool that runs this configuration
    #[serde(default = "default_resource_class")]
    pub resource_class: String,
    pub steps: Vec<CommandStep>,
    #[serde(default)]
    pub feedback: FeedbackPolicy,
    pub limits: SubmissionLimits,
    #[serde(default)]
    pub sandbox: SandboxLimits,
    /// Extra environment passed to every command
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
}

fn default_resource_class() -> String {
    "default".to_string()
}

/// Limits that apply to the whole grading run
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubmissionLimits {
    /// Wall time budget shared by all steps
    pub total_time: MilliSecond,
    /// Maximum number of points a submission can earn
    pub total_points: u32,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct CommandStep {
    pub name: String,
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Directory relative to the sandbox root
    #[serde(default)]
    pub working_dir: Option<String>,
    #[serde(default)]
    pub stdin: Option<String>,
    #[serde(default)]
    pub limits: StepLimits,
    #[serde(default)]
    pub points: u32,
    #[serde(default)]
    pub deduction: u32,
    /// Earlier steps that must pass for this one to run
    #[serde(default)]
    pub skip_if_failed: Vec<String>,
    #[serde(default)]
    pub visibility: Option<Visibility>,
    #[serde(flatten)]
    pub kind: StepKind,
}

impl CommandStep {
    pub fn argv(&self) -> Vec<String> {
        let mut argv = Vec::with_capacity(self.args.len() + 1);
        argv.push(self.program.clone());
        argv.extend(self.args.iter().cloned());
        argv
    }
}

/// Per-step limits; each one can only tighten the sandbox-wide limit
#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StepLimits {
    pub cpu_time: Option<MilliSecond>,
    pub wall_time: Option<MilliSecond>,
    pub memory: Option<ByteSize>,
    pub processes: Option<u32>,
    pub output: Option<ByteSize>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StepKind {
    /// Builds the artifacts later steps run
    Compile {
        #[serde(default)]
        artifacts: Vec<String>,
    },
    /// Checks exit status and output against inline expectations
    Test {
        #[serde(default)]
        expected_exit: ExpectedExit,
        #[serde(default)]
        stdout: Option<OutputMatch>,
        #[serde(default)]
        stderr: Option<OutputMatch>,
    },
    /// Compares the output against an expected file inside the sandbox
    Diff {
        expected_file: String,
        #[serde(default)]
        actual: DiffTarget,
        #[serde(default)]
        options: MatchOptions,
    },
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ExpectedExit {
    #[default]
    None,
    Zero,
    Nonzero,
}

impl ExpectedExit {
    pub fn accepts(self, exit_code: Option<i32>) -> bool {
        match self {
            Self::None => true,
            Self::Zero => exit_code == Some(0),
            Self::Nonzero => matches!(exit_code, Some(code) if code != 0),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutputMatch {
    Exact {
        expected: String,
        #[serde(default)]
        options: MatchOptions,
    },
    Pattern {
        regex: Pattern,
    },
}

/// Normalizations applied before comparing outputs, named after their diff flags
#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
#[serde(default)]
pub struct MatchOptions {
    /// diff -i
    pub ignore_case: bool,
    /// diff -w
    pub ignore_whitespace: bool,
    /// diff -b
    pub ignore_whitespace_changes: bool,
    /// diff -B
    pub ignore_blank_lines: bool,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DiffTarget {
    #[default]
    Stdout,
    File(String),
}

/// A regular expression compiled when the configuration is parsed
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(try_from = "String", into = "String")]
pub struct Pattern(Regex);

impl Pattern {
    pub fn is_match(&self, haystack: &str) -> bool {
        self.0.is_match(haystack)
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl TryFrom<String> for Pattern {
    type Error = regex::Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Regex::new(&value).map(Pattern)
    }
}

impl From<Pattern> for String {
    fn from(value: Pattern) -> Self {
        value.0.as_str().to_string()
    }
}

impl PartialEq for Pattern {
    fn eq(&self, other: &Self) -> bool {
        self.as_str() == other.as_str()
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Visibility {
    #[default]
    Always,
    OnFailure,
    Never,
}

impl Visibility {
    pub fn is_visible(self, passed: bool) -> bool {
        match self {
            Self::Always => true,
            Self::OnFailure => !passed,
            Self::Never => false,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
#[serde(default)]
pub struct FeedbackPolicy {
    pub default: Visibility,
    /// Append captured output or a diff excerpt to the feedback text
    pub show_output: bool,
}

impl FeedbackPolicy {
    pub fn visibility_of(&self, step: &CommandStep) -> Visibility {
        step.visibility.unwrap_or(self.default)
    }
}

impl GradingConfig {
    /// Parses and validates a configuration document
    pub fn from_json(body: &str) -> Result<Arc<Self>, GradingConfigError> {
        let config: GradingConfig =
            serde_json::from_str(body).map_err(|e| GradingConfigError::Parse(e.to_string()))?;
        config.validate()
    }

    /// Checks the invariants the evaluator relies on
    pub fn validate(self) -> Result<Arc<Self>, GradingConfigError> {
        if self.resource_class.is_empty() {
            return Err(GradingConfigError::EmptyResourceClass);
        }
        if self.steps.is_empty() {
            return Err(GradingConfigError::NoSteps);
        }
        validate_sandbox_limits(&self.sandbox)?;

        let mut seen: HashSet<&str> = HashSet::new();
        for (idx, step) in self.steps.iter().enumerate() {
            if step.name.is_empty() {
                return Err(GradingConfigError::EmptyName(idx));
            }
            if step.program.is_empty() {
                return Err(GradingConfigError::EmptyProgram(step.name.clone()));
            }
            // Dependencies may only point backwards, so the step order is a
            // valid execution order.
            for dependency in &step.skip_if_failed {
                if !seen.contains(dependency.as_str()) {
                    return Err(GradingConfigError::UnknownDependency {
                        step: step.name.clone(),
                        dependency: dependency.clone(),
                    });
                }
            }
            if !seen.insert(step.name.as_str()) {
                return Err(GradingConfigError::DuplicateName(step.name.clone()));
            }
            if let Some(dir) = &step.working_dir
                && !is_contained_path(dir)
            {
                return Err(GradingConfigError::InvalidWorkingDir(step.name.clone()));
            }
            validate_step_limits(step)?;
        }

        let awards_points = self.steps.iter().any(|s| s.points > 0);
        if awards_points && self.limits.total_points == 0 {
            return Err(GradingConfigError::ZeroTotalPoints);
        }

        Ok(Arc::new(self))
    }

    pub fn step(&self, name: &str) -> Option<&CommandStep> {
        self.steps.iter().find(|s| s.name == name)
    }
}

fn validate_step_limits(step: &CommandStep) -> Result<(), GradingConfigError> {
    let limits = &step.limits;
    let zero = [
        ("cpu_time", limits.cpu_time.is_some_and(|v| v.0 == 0)),
        ("wall_time", limits.wall_time.is_some_and(|v| v.0 == 0)),
        ("memory", limits.memory.is_some_and(|v| v.0 == 0)),
        ("processes", limits.processes == Some(0)),
        ("output", limits.output.is_some_and(|v| v.0 == 0)),
    ];
    match zero.into_iter().find(|(_, is_zero)| *is_zero) {
        Some((limit, _)) => Err(GradingConfigError::ZeroLimit {
            step: step.name.clone(),
            limit,
        }),
        None => Ok(()),
    }
}

fn validate_sandbox_limits(limits: &SandboxLimits) -> Result<(), GradingConfigError> {
    let zero = [
        ("cpu_time", limits.cpu_time.0 == 0),
        ("wall_time", limits.wall_time.0 == 0),
        ("memory", limits.memory.0 == 0),
        ("processes", limits.processes == 0),
        ("output", limits.output.0 == 0),
    ];
    match zero.into_iter().find(|(_, is_zero)| *is_zero) {
        Some((limit, _)) => Err(GradingConfigError::ZeroSandboxLimit(limit)),
        None => Ok(()),
    }
}

/// Whether `path` is relative and stays inside the directory it is joined to
pub fn is_contained_path(path: &str) -> bool {
    !path.is_empty()
        && Path::new(path)
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
}

/// What a single command did, captured as data
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandResult {
    pub exit_code: Option<i32>,
    /// Terminating signal, when the command did not exit normally
    pub signal: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub stdout_truncated: bool,
    pub stderr_truncated: bool,
    pub wall_time: MilliSecond,
    pub timed_out: bool,
    pub resource_killed: bool,
}

impl CommandResult {
    /// Exit status 0 without a timeout or resource kill
    pub fn succeeded(&self) -> bool {
        self.exit_code == Some(0) && !self.timed_out && !self.resource_killed
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Executed,
    /// A declared dependency did not pass
    Skipped,
    /// The run ended before this step was reached
    NotRun,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct StepOutcome {
    pub name: String,
    pub status: StepStatus,
    pub result: Option<CommandResult>,
    pub passed: bool,
    /// Signed: deductions make it negative
    pub points_awarded: i64,
    pub feedback_text: String,
    pub visible: bool,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum GradingStatus {
    Completed,
    TimedOut,
    InfrastructureError,
    Cancelled,
}

impl GradingStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::TimedOut => "timed_out",
            Self::InfrastructureError => "infrastructure_error",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for GradingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct GradingResult {
    pub submission_id: SubmissionId,
    pub grading_config_id: GradingConfigId,
    pub attempt: u32,
    pub status: GradingStatus,
    pub steps: Vec<StepOutcome>,
    pub total_points: u32,
    pub max_points: u32,
    /// A sandbox leak was detected while tearing down this attempt
    pub needs_review: bool,
    pub error: Option<String>,
    pub started_time: String,
    pub finished_time: String,
}

impl GradingResult {
    /// A result for an attempt that never reached a sandbox
    pub fn without_steps(
        submission_id: SubmissionId,
        grading_config_id: GradingConfigId,
        attempt: u32,
        max_points: u32,
        status: GradingStatus,
        error: Option<String>,
    ) -> Self {
        let now = crate::create_timestamp();
        Self {
            submission_id,
            grading_config_id,
            attempt,
            status,
            steps: Vec::new(),
            total_points: 0,
            max_points,
            needs_review: false,
            error,
            started_time: now.clone(),
            finished_time: now,
        }
    }
}

/// Sums awarded points and clamps the total into `[0, max]`
pub fn total_points(outcomes: &[StepOutcome], max: u32) -> u32 {
    let sum: i64 = outcomes.iter().map(|o| o.points_awarded).sum();
    sum.clamp(0, i64::from(max)) as u32
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const CONFIG: &str = r#"{
        "id": 7,
        "resource_class": "light",
        "limits": { "total_time": 60000, "total_points": 10 },
        "feedback": { "default": "on_failure", "show_output": true },
        "steps": [
            {
                "name": "compile",
                "kind": "compile",
                "program": "gcc",
                "args": ["-o", "main", "main.c"],
                "artifacts": ["main"]
            },
            {
                "name": "hello",
                "kind": "test",
                "program": "./main",
                "stdin": "world\n",
                "points": 5,
                "skip_if_failed": ["compile"],
                "expected_exit": "zero",
                "stdout": { "type": "exact", "expected": "hello world\n",
                            "options": { "ignore_whitespace_changes": true } }
            },
            {
                "name": "fuzzy",
                "kind": "test",
                "program": "./main",
                "points": 3,
                "deduction": 1,
                "skip_if_failed": ["compile"],
                "visibility": "always",
                "stderr": { "type": "pattern", "regex": "^warn.*$" }
            },
            {
                "name": "golden",
                "kind": "diff",
                "program": "./main",
                "points": 2,
                "limits": { "wall_time": 1000 },
                "expected_file": "expected/golden.out",
                "actual": { "file": "out/golden.txt" }
            }
        ]
    }"#;

    #[test]
    fn test_grading_config_deserialization() {
        let config = GradingConfig::from_json(CONFIG).unwrap();
        assert_eq!(config.id, GradingConfigId(7));
        assert_eq!(config.resource_class, "light");
        assert_eq!(config.steps.len(), 4);
        assert_eq!(config.feedback.default, Visibility::OnFailure);

        let hello = config.step("hello").unwrap();
        assert_eq!(hello.skip_if_failed, vec!["compile".to_string()]);
        assert_eq!(hello.argv(), vec!["./main".to_string()]);
        match &hello.kind {
            StepKind::Test {
                expected_exit,
                stdout: Some(OutputMatch::Exact { options, .. }),
                stderr: None,
            } => {
                assert_eq!(*expected_exit, ExpectedExit::Zero);
                assert!(options.ignore_whitespace_changes);
                assert!(!options.ignore_case);
            }
            other => panic!("unexpected kind {other:?}"),
        }

        let golden = config.step("golden").unwrap();
        assert_eq!(golden.limits.wall_time, Some(MilliSecond(1000)));
        assert!(matches!(
            &golden.kind,
            StepKind::Diff { actual: DiffTarget::File(path), .. } if path == "out/golden.txt"
        ));
        assert_eq!(config.sandbox, SandboxLimits::default());
    }

    #[test]
    fn test_invalid_pattern_rejected_at_load() {
        let body = CONFIG.replace("^warn.*$", "(unclosed");
        assert!(matches!(
            GradingConfig::from_json(&body),
            Err(GradingConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_forward_dependency_rejected() {
        let mut config: GradingConfig = serde_json::from_str(CONFIG).unwrap();
        config.steps[1].skip_if_failed = vec!["golden".to_string()];
        assert_eq!(
            config.validate().unwrap_err(),
            GradingConfigError::UnknownDependency {
                step: "hello".to_string(),
                dependency: "golden".to_string(),
            }
        );
    }

    #[test]
    fn test_duplicate_step_name_rejected() {
        let mut config: GradingConfig = serde_json::from_str(CONFIG).unwrap();
        config.steps[2].name = "hello".to_string();
        assert_eq!(
            config.validate().unwrap_err(),
            GradingConfigError::DuplicateName("hello".to_string())
        );
    }

    #[test]
    fn test_escaping_working_dir_rejected() {
        let mut config: GradingConfig = serde_json::from_str(CONFIG).unwrap();
        config.steps[0].working_dir = Some("../outside".to_string());
        assert_eq!(
            config.validate().unwrap_err(),
            GradingConfigError::InvalidWorkingDir("compile".to_string())
        );
    }

    #[test]
    fn test_zero_limit_rejected() {
        let mut config: GradingConfig = serde_json::from_str(CONFIG).unwrap();
        config.steps[1].limits.processes = Some(0);
        assert_eq!(
            config.validate().unwrap_err(),
            GradingConfigError::ZeroLimit {
                step: "hello".to_string(),
                limit: "processes",
            }
        );
    }

    #[test]
    fn test_zero_output_limit_rejected() {
        let mut config: GradingConfig = serde_json::from_str(CONFIG).unwrap();
        config.steps[0].limits.output = Some(ByteSize(0));
        assert_eq!(
            config.validate().unwrap_err(),
            GradingConfigError::ZeroLimit {
                step: "compile".to_string(),
                limit: "output",
            }
        );
    }

    #[test]
    fn test_zero_sandbox_limit_rejected() {
        let mut config: GradingConfig = serde_json::from_str(CONFIG).unwrap();
        config.sandbox.wall_time = MilliSecond(0);
        assert_eq!(
            config.validate().unwrap_err(),
            GradingConfigError::ZeroSandboxLimit("wall_time")
        );

        let mut config: GradingConfig = serde_json::from_str(CONFIG).unwrap();
        config.sandbox.output = ByteSize(0);
        assert_eq!(
            config.validate().unwrap_err(),
            GradingConfigError::ZeroSandboxLimit("output")
        );
    }

    #[test]
    fn test_points_without_total_rejected() {
        let mut config: GradingConfig = serde_json::from_str(CONFIG).unwrap();
        config.limits.total_points = 0;
        assert_eq!(
            config.validate().unwrap_err(),
            GradingConfigError::ZeroTotalPoints
        );
    }

    #[test]
    fn test_expected_exit() {
        assert!(ExpectedExit::None.accepts(None));
        assert!(ExpectedExit::Zero.accepts(Some(0)));
        assert!(!ExpectedExit::Zero.accepts(Some(3)));
        assert!(ExpectedExit::Nonzero.accepts(Some(3)));
        assert!(!ExpectedExit::Nonzero.accepts(None));
    }

    #[test]
    fn test_visibility() {
        assert!(Visibility::Always.is_visible(true));
        assert!(!Visibility::OnFailure.is_visible(true));
        assert!(Visibility::OnFailure.is_visible(false));
        assert!(!Visibility::Never.is_visible(false));
    }

    #[test]
    fn test_contained_paths() {
        assert!(is_contained_path("src/main.c"));
        assert!(is_contained_path("./build"));
        assert!(!is_contained_path("/etc/passwd"));
        assert!(!is_contained_path("a/../../b"));
        assert!(!is_contained_path(""));
    }

    fn outcome(points: i64) -> StepOutcome {
        StepOutcome {
            name: "s".to_string(),
            status: StepStatus::Executed,
            result: None,
            passed: points > 0,
            points_awarded: points,
            feedback_text: String::new(),
            visible: true,
        }
    }

    #[test]
    fn test_total_points_is_clamped() {
        assert_eq!(total_points(&[outcome(5), outcome(5), outcome(5)], 10), 10);
        assert_eq!(total_points(&[outcome(-3), outcome(1)], 10), 0);
        assert_eq!(total_points(&[outcome(4), outcome(-1)], 10), 3);
    }
}
