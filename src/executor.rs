use std::sync::Arc;
use std::time::Duration;

use crate::config::{MilliSecond, SandboxConfig};
use crate::error::SandboxError;
use crate::grading::{CommandResult, CommandStep};
use crate::sandbox::{ExecRequest, RawExecution, SandboxAdapter, SandboxHandle};

/// Per-run context shared by every step of a grading run
#[derive(Debug, Clone, Default)]
pub struct ExecContext {
    pub env: Vec<(String, String)>,
    /// What is left of the submission-wide time budget
    pub wall_budget: Option<MilliSecond>,
}

/// Runs single commands inside an acquired sandbox
///
/// Anything the student's program does is reported as data in the returned
/// [`CommandResult`]; only sandbox failures are errors.
pub struct Executor {
    adapter: Arc<SandboxAdapter>,
    watchdog_grace: Duration,
}

impl Executor {
    pub fn new(adapter: Arc<SandboxAdapter>, config: &SandboxConfig) -> Self {
        Self {
            adapter,
            watchdog_grace: config.watchdog_grace.into(),
        }
    }

    pub fn adapter(&self) -> &Arc<SandboxAdapter> {
        &self.adapter
    }

    pub async fn run(
        &self,
        handle: &SandboxHandle,
        step: &CommandStep,
        context: &ExecContext,
    ) -> Result<CommandResult, SandboxError> {
        let mut limits = handle.limits().tighten(&step.limits);
        if let Some(budget) = context.wall_budget {
            limits = limits.with_wall_time_at_most(budget);
        }
        let request = ExecRequest {
            argv: step.argv(),
            working_dir: step.working_dir.clone(),
            stdin: step.stdin.as_ref().map(|s| s.as_bytes().to_vec()),
            env: context.env.clone(),
            limits,
        };

        // The backend enforces the wall limit itself; this one fires only
        // when the backend is stuck.
        let watchdog = Duration::from(limits.wall_time) + self.watchdog_grace;
        let raw = match tokio::time::timeout(watchdog, self.adapter.exec(handle, &request)).await
        {
            Ok(raw) => raw?,
            Err(_) => {
                log::warn!(
                    "Watchdog fired after {} ms for step {} in sandbox {}",
                    watchdog.as_millis(),
                    step.name,
                    handle.id()
                );
                self.adapter.kill_all(handle).await?;
                RawExecution {
                    wall_time: watchdog,
                    timed_out: true,
                    ..Default::default()
                }
            }
        };

        log::debug!(
            "Step {} in sandbox {} finished: exit {:?}, signal {:?}, {} ms",
            step.name,
            handle.id(),
            raw.exit_code,
            raw.signal,
            raw.wall_time.as_millis()
        );
        Ok(normalize(raw, limits.output.0 as usize))
    }
}

fn normalize(raw: RawExecution, cap: usize) -> CommandResult {
    let stdout = raw.stdout.capped(cap);
    let stderr = raw.stderr.capped(cap);
    CommandResult {
        exit_code: raw.exit_code,
        signal: raw.signal,
        stdout: stdout.to_string_lossy(),
        stderr: stderr.to_string_lossy(),
        stdout_truncated: stdout.truncated,
        stderr_truncated: stderr.truncated,
        wall_time: raw.wall_time.into(),
        timed_out: raw.timed_out,
        resource_killed: raw.resource_killed && !raw.timed_out,
    }
}
