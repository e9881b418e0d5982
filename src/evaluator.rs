mod matching;

pub use matching::{diff_excerpt, outputs_match};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use crate::config::MilliSecond;
use crate::create_timestamp;
use crate::error::SandboxError;
use crate::executor::{ExecContext, Executor};
use crate::grading::{
    CommandResult, CommandStep, DiffTarget, ExpectedExit, GradingConfig, GradingResult, GradingStatus,
    MatchOptions, OutputMatch, StepKind, StepOutcome, StepStatus, Submission, total_points,
};
use crate::sandbox::{SandboxAdapter, SandboxHandle};

use matching::truncate_text;

/// Longest output or diff excerpt appended to feedback text
const FEEDBACK_DETAIL_LIMIT: usize = 4096;

/// Drives the executor through the steps of a grading configuration
pub struct Evaluator {
    executor: Arc<Executor>,
}

/// Verdict of one executed step before points and visibility are applied
struct Judgement {
    passed: bool,
    summary: String,
    detail: Option<String>,
}

impl Judgement {
    fn pass() -> Self {
        Self {
            passed: true,
            summary: "passed".to_string(),
            detail: None,
        }
    }

    fn fail(summary: impl Into<String>, detail: Option<String>) -> Self {
        Self {
            passed: false,
            summary: summary.into(),
            detail,
        }
    }
}

impl Evaluator {
    pub fn new(executor: Arc<Executor>) -> Self {
        Self { executor }
    }

    fn adapter(&self) -> &SandboxAdapter {
        self.executor.adapter()
    }

    /// Runs every step of `config` against `submission` in `handle`
    ///
    /// Never fails: infrastructure errors, budget exhaustion and
    /// cancellation all end up in the returned result's status.
    pub async fn evaluate(
        &self,
        handle: &SandboxHandle,
        config: &GradingConfig,
        submission: &Submission,
        attempt: u32,
        cancel: &CancellationToken,
    ) -> GradingResult {
        let started_time = create_timestamp();
        let deadline = Instant::now() + Duration::from(config.limits.total_time);
        let env: Vec<(String, String)> = config
            .environment
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        let mut outcomes: Vec<StepOutcome> = Vec::with_capacity(config.steps.len());
        let mut status = GradingStatus::Completed;
        let mut error = None;

        if let Err(e) = self.adapter().copy_in(handle, &submission.files).await {
            log::error!(
                "Failed to copy submission {} into sandbox {}: {e}",
                submission.id,
                handle.id()
            );
            status = GradingStatus::InfrastructureError;
            error = Some(e.to_string());
        }

        let mut passed: HashMap<&str, bool> = HashMap::new();
        for step in &config.steps {
            if status != GradingStatus::Completed {
                break;
            }
            if cancel.is_cancelled() {
                status = GradingStatus::Cancelled;
                break;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                status = GradingStatus::TimedOut;
                break;
            }

            if let Some(dependency) = step
                .skip_if_failed
                .iter()
                .find(|d| !passed.get(d.as_str()).copied().unwrap_or(false))
            {
                passed.insert(&step.name, false);
                outcomes.push(skipped(config, step, dependency));
                continue;
            }

            // Rounded up so a step cut by the budget ends past the deadline
            let context = ExecContext {
                env: env.clone(),
                wall_budget: Some(MilliSecond(remaining.as_nanos().div_ceil(1_000_000) as u64)),
            };
            let run = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                res = self.executor.run(handle, step, &context) => Some(res),
            };
            let Some(run) = run else {
                log::info!("Grading of submission {} cancelled during step {}", submission.id, step.name);
                if let Err(e) = self.adapter().kill_all(handle).await {
                    log::warn!("Failed to stop step {} after cancellation: {e}", step.name);
                }
                status = GradingStatus::Cancelled;
                break;
            };

            let outcome = match run {
                Ok(result) => self.judge(handle, config, step, result).await,
                Err(e) => Err(e),
            };
            match outcome {
                Ok(outcome) => {
                    let budget_spent = outcome.result.as_ref().is_some_and(|r| r.timed_out)
                        && Instant::now() >= deadline;
                    passed.insert(&step.name, outcome.passed);
                    outcomes.push(outcome);
                    if budget_spent {
                        status = GradingStatus::TimedOut;
                    }
                }
                Err(e) => {
                    log::error!(
                        "Infrastructure failure in step {} of submission {}: {e}",
                        step.name,
                        submission.id
                    );
                    status = GradingStatus::InfrastructureError;
                    error = Some(e.to_string());
                }
            }
        }

        for step in &config.steps[outcomes.len()..] {
            outcomes.push(not_run(config, step, status));
        }

        let max_points = config.limits.total_points;
        GradingResult {
            submission_id: submission.id,
            grading_config_id: config.id,
            attempt,
            status,
            total_points: total_points(&outcomes, max_points),
            max_points,
            steps: outcomes,
            needs_review: false,
            error,
            started_time,
            finished_time: create_timestamp(),
        }
    }

    async fn judge(
        &self,
        handle: &SandboxHandle,
        config: &GradingConfig,
        step: &CommandStep,
        result: CommandResult,
    ) -> Result<StepOutcome, SandboxError> {
        let judgement = if result.timed_out {
            Judgement::fail(
                format!("timed out after {} ms", result.wall_time.0),
                captured_output(&result),
            )
        } else if result.resource_killed {
            Judgement::fail(
                "killed for exceeding resource limits",
                captured_output(&result),
            )
        } else {
            match &step.kind {
                StepKind::Compile { artifacts } => {
                    self.judge_compile(handle, artifacts, &result).await?
                }
                StepKind::Test {
                    expected_exit,
                    stdout,
                    stderr,
                } => {
                    if !expected_exit.accepts(result.exit_code) {
                        Judgement::fail(
                            format!(
                                "expected {} exit status, got {}",
                                match expected_exit {
                                    ExpectedExit::Zero => "a zero",
                                    _ => "a nonzero",
                                },
                                describe_exit(&result)
                            ),
                            captured_output(&result),
                        )
                    } else if let Some(failed) = check_output("stdout", &result.stdout, stdout.as_ref())
                    {
                        failed
                    } else if let Some(failed) = check_output("stderr", &result.stderr, stderr.as_ref())
                    {
                        failed
                    } else {
                        Judgement::pass()
                    }
                }
                StepKind::Diff {
                    expected_file,
                    actual,
                    options,
                } => {
                    self.judge_diff(handle, expected_file, actual, options, &result)
                        .await?
                }
            }
        };

        let points_awarded = if judgement.passed {
            i64::from(step.points)
        } else {
            -i64::from(step.deduction)
        };
        let mut feedback_text = judgement.summary;
        if config.feedback.show_output
            && let Some(detail) = judgement.detail
        {
            feedback_text.push('\n');
            feedback_text.push_str(truncate_text(&detail, FEEDBACK_DETAIL_LIMIT));
        }

        Ok(StepOutcome {
            name: step.name.clone(),
            status: StepStatus::Executed,
            result: Some(result),
            passed: judgement.passed,
            points_awarded,
            feedback_text,
            visible: config.feedback.visibility_of(step).is_visible(judgement.passed),
        })
    }

    async fn judge_compile(
        &self,
        handle: &SandboxHandle,
        artifacts: &[String],
        result: &CommandResult,
    ) -> Result<Judgement, SandboxError> {
        if result.exit_code != Some(0) {
            return Ok(Judgement::fail(
                format!("compilation failed with {}", describe_exit(result)),
                captured_output(result),
            ));
        }
        for artifact in artifacts {
            match self.adapter().copy_out(handle, std::slice::from_ref(artifact)).await {
                Ok(_) => {}
                Err(SandboxError::NotFound { path, .. }) => {
                    return Ok(Judgement::fail(
                        format!("artifact {path} was not produced"),
                        captured_output(result),
                    ));
                }
                Err(e) => return Err(e),
            }
        }
        Ok(Judgement::pass())
    }

    async fn judge_diff(
        &self,
        handle: &SandboxHandle,
        expected_file: &str,
        actual: &DiffTarget,
        options: &MatchOptions,
        result: &CommandResult,
    ) -> Result<Judgement, SandboxError> {
        // The expected file is instructor material: its absence is a broken
        // configuration, not a student outcome
        let expected = self.read_file(handle, expected_file).await?;
        let actual = match actual {
            DiffTarget::Stdout => result.stdout.clone(),
            DiffTarget::File(path) => match self.read_file(handle, path).await {
                Ok(content) => content,
                Err(SandboxError::NotFound { .. }) => {
                    return Ok(Judgement::fail(
                        format!("output file {path} was not produced"),
                        captured_output(result),
                    ));
                }
                Err(e) => return Err(e),
            },
        };

        if outputs_match(&actual, &expected, options) {
            Ok(Judgement::pass())
        } else {
            Ok(Judgement::fail(
                "output differs from the expected output",
                Some(diff_excerpt(&expected, &actual, options)),
            ))
        }
    }

    async fn read_file(&self, handle: &SandboxHandle, path: &str) -> Result<String, SandboxError> {
        let mut files = self
            .adapter()
            .copy_out(handle, std::slice::from_ref(&path.to_string()))
            .await?;
        let (_, bytes) = files.remove(0);
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }
}

fn check_output(stream: &str, actual: &str, expectation: Option<&OutputMatch>) -> Option<Judgement> {
    match expectation? {
        OutputMatch::Exact { expected, options } => (!outputs_match(actual, expected, options))
            .then(|| {
                Judgement::fail(
                    format!("{stream} does not match the expected output"),
                    Some(diff_excerpt(expected, actual, options)),
                )
            }),
        OutputMatch::Pattern { regex } => (!regex.is_match(actual)).then(|| {
            Judgement::fail(
                format!("{stream} does not match /{}/", regex.as_str()),
                Some(actual.to_string()),
            )
        }),
    }
}

fn describe_exit(result: &CommandResult) -> String {
    match (result.exit_code, result.signal) {
        (Some(code), _) => format!("exit code {code}"),
        (None, Some(signal)) => format!("signal {signal}"),
        (None, None) => "no exit status".to_string(),
    }
}

fn captured_output(result: &CommandResult) -> Option<String> {
    let mut out = String::new();
    if !result.stdout.is_empty() {
        out.push_str(&result.stdout);
    }
    if !result.stderr.is_empty() {
        if !out.is_empty() && !out.ends_with('\n') {
            out.push('\n');
        }
        out.push_str(&result.stderr);
    }
    (!out.is_empty()).then_some(out)
}

fn skipped(config: &GradingConfig, step: &CommandStep, dependency: &str) -> StepOutcome {
    StepOutcome {
        name: step.name.clone(),
        status: StepStatus::Skipped,
        result: None,
        passed: false,
        points_awarded: 0,
        feedback_text: format!("skipped because {dependency} did not pass"),
        visible: config.feedback.visibility_of(step).is_visible(false),
    }
}

fn not_run(config: &GradingConfig, step: &CommandStep, status: GradingStatus) -> StepOutcome {
    let reason = match status {
        GradingStatus::TimedOut => "not run: the time budget for this submission ran out",
        GradingStatus::Cancelled => "not run: grading was cancelled",
        GradingStatus::InfrastructureError => "not run: grading failed on our side",
        GradingStatus::Completed => "not run",
    };
    StepOutcome {
        name: step.name.clone(),
        status: StepStatus::NotRun,
        result: None,
        passed: false,
        points_awarded: 0,
        feedback_text: reason.to_string(),
        visible: config.feedback.visibility_of(step).is_visible(false),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SandboxConfig;
    use crate::grading::{GradingConfigId, SubmissionId, SubmittedFile};
    use crate::sandbox::ProcessRuntime;
    use pretty_assertions::assert_eq;

    struct Fixture {
        _dir: tempfile::TempDir,
        adapter: Arc<SandboxAdapter>,
        evaluator: Evaluator,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let runtime = Arc::new(ProcessRuntime::with_work_root(dir.path().to_path_buf()));
        let config = SandboxConfig::default();
        let adapter = Arc::new(SandboxAdapter::new(runtime, &config));
        let executor = Arc::new(Executor::new(adapter.clone(), &config));
        Fixture {
            _dir: dir,
            adapter,
            evaluator: Evaluator::new(executor),
        }
    }

    fn submission(files: &[(&str, &str)]) -> Submission {
        Submission {
            id: SubmissionId(1),
            grading_config_id: GradingConfigId(1),
            files: files
                .iter()
                .map(|(name, content)| SubmittedFile {
                    name: name.to_string(),
                    content: content.as_bytes().to_vec(),
                })
                .collect(),
        }
    }

    async fn evaluate(
        fixture: &Fixture,
        config: &str,
        submission: &Submission,
        cancel: &CancellationToken,
    ) -> GradingResult {
        let config = GradingConfig::from_json(config).unwrap();
        let handle = fixture.adapter.acquire(&config.sandbox).await.unwrap();
        let result = fixture
            .evaluator
            .evaluate(&handle, &config, submission, 1, cancel)
            .await;
        fixture.adapter.release(&handle).await.unwrap();
        result
    }

    #[tokio::test]
    async fn test_budget_exhaustion_stops_remaining_steps() {
        let fixture = fixture();
        let config = r#"{
            "id": 1,
            "limits": { "total_time": 300, "total_points": 2 },
            "steps": [
                { "name": "quick", "kind": "test", "program": "true", "points": 1 },
                { "name": "slow", "kind": "test", "program": "sleep", "args": ["5"], "points": 1 },
                { "name": "never", "kind": "test", "program": "true", "points": 1 }
            ]
        }"#;

        let result = evaluate(&fixture, config, &submission(&[]), &CancellationToken::new()).await;

        assert_eq!(result.status, GradingStatus::TimedOut);
        let statuses: Vec<StepStatus> = result.steps.iter().map(|s| s.status).collect();
        assert_eq!(
            statuses,
            vec![StepStatus::Executed, StepStatus::Executed, StepStatus::NotRun]
        );
        assert!(result.steps[1].result.as_ref().unwrap().timed_out);
        assert_eq!(result.total_points, 1);
    }

    #[tokio::test]
    async fn test_cancellation_interrupts_running_step() {
        let fixture = fixture();
        let config = r#"{
            "id": 1,
            "limits": { "total_time": 60000, "total_points": 1 },
            "steps": [
                { "name": "slow", "kind": "test", "program": "sleep", "args": ["30"] },
                { "name": "after", "kind": "test", "program": "true", "points": 1 }
            ]
        }"#;
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            trigger.cancel();
        });

        let start = Instant::now();
        let result = evaluate(&fixture, config, &submission(&[]), &cancel).await;

        assert!(start.elapsed() < Duration::from_secs(5));
        assert_eq!(result.status, GradingStatus::Cancelled);
        assert!(result.steps.iter().all(|s| s.status == StepStatus::NotRun));
        assert_eq!(result.total_points, 0);
    }

    #[tokio::test]
    async fn test_diff_step_against_expected_file() {
        let fixture = fixture();
        let config = r#"{
            "id": 1,
            "limits": { "total_time": 60000, "total_points": 4 },
            "feedback": { "show_output": true },
            "steps": [
                { "name": "stdout", "kind": "diff", "program": "cat", "args": ["answer.txt"],
                  "points": 2, "expected_file": "expected.txt",
                  "options": { "ignore_case": true } },
                { "name": "file", "kind": "diff", "program": "true", "points": 2,
                  "expected_file": "expected.txt", "actual": { "file": "out.txt" } }
            ]
        }"#;
        let files = submission(&[("answer.txt", "HELLO\n"), ("expected.txt", "hello\n")]);

        let result = evaluate(&fixture, config, &files, &CancellationToken::new()).await;

        assert_eq!(result.status, GradingStatus::Completed);
        assert!(result.steps[0].passed);
        assert!(!result.steps[1].passed);
        assert_eq!(result.steps[1].feedback_text, "output file out.txt was not produced");
        assert_eq!(result.total_points, 2);
    }

    #[tokio::test]
    async fn test_missing_expected_file_is_infrastructure_error() {
        let fixture = fixture();
        let config = r#"{
            "id": 1,
            "limits": { "total_time": 60000, "total_points": 1 },
            "steps": [
                { "name": "diff", "kind": "diff", "program": "true", "points": 1,
                  "expected_file": "expected.txt" }
            ]
        }"#;

        let result = evaluate(&fixture, config, &submission(&[]), &CancellationToken::new()).await;

        assert_eq!(result.status, GradingStatus::InfrastructureError);
        assert!(result.error.unwrap().contains("expected.txt"));
        assert_eq!(result.steps[0].status, StepStatus::NotRun);
    }

    #[tokio::test]
    async fn test_feedback_visibility_and_deductions() {
        let fixture = fixture();
        let config = r#"{
            "id": 1,
            "limits": { "total_time": 60000, "total_points": 10 },
            "feedback": { "default": "on_failure", "show_output": false },
            "steps": [
                { "name": "ok", "kind": "test", "program": "/bin/sh",
                  "args": ["-c", "echo 42"], "points": 6,
                  "stdout": { "type": "pattern", "regex": "^4\\d\\s*$" } },
                { "name": "bad", "kind": "test", "program": "/bin/sh",
                  "args": ["-c", "echo oops; exit 2"], "points": 4, "deduction": 1,
                  "expected_exit": "zero" },
                { "name": "hidden", "kind": "test", "program": "false",
                  "expected_exit": "zero", "visibility": "never" }
            ]
        }"#;

        let result = evaluate(&fixture, config, &submission(&[]), &CancellationToken::new()).await;

        let ok = &result.steps[0];
        assert!(ok.passed);
        assert!(!ok.visible);
        assert_eq!(ok.points_awarded, 6);

        let bad = &result.steps[1];
        assert!(!bad.passed);
        assert!(bad.visible);
        assert_eq!(bad.points_awarded, -1);
        assert_eq!(bad.feedback_text, "expected a zero exit status, got exit code 2");

        assert!(!result.steps[2].visible);
        assert_eq!(result.total_points, 5);
    }

    #[tokio::test]
    async fn test_missing_artifact_fails_compile() {
        let fixture = fixture();
        let config = r#"{
            "id": 1,
            "limits": { "total_time": 60000, "total_points": 1 },
            "steps": [
                { "name": "build", "kind": "compile", "program": "true", "artifacts": ["main"] },
                { "name": "run", "kind": "test", "program": "./main", "points": 1,
                  "skip_if_failed": ["build"] }
            ]
        }"#;

        let result = evaluate(&fixture, config, &submission(&[]), &CancellationToken::new()).await;

        assert_eq!(result.status, GradingStatus::Completed);
        assert_eq!(result.steps[0].feedback_text, "artifact main was not produced");
        assert_eq!(result.steps[1].status, StepStatus::Skipped);
        assert_eq!(result.steps[1].feedback_text, "skipped because build did not pass");
    }

    #[test]
    fn test_captured_output_joins_streams() {
        let result = CommandResult {
            stdout: "out".to_string(),
            stderr: "err\n".to_string(),
            ..Default::default()
        };
        assert_eq!(captured_output(&result).as_deref(), Some("out\nerr\n"));
        assert_eq!(captured_output(&CommandResult::default()), None);
    }
}
