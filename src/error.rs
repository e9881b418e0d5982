//! Error taxonomy of the grading core.
//!
//! Student misbehavior is never an error: it is captured as data in
//! `CommandResult`/`StepOutcome`. Only infrastructure failures travel through
//! these types.

use thiserror::Error;

use crate::grading::{GradingConfigId, SubmissionId};
use crate::scheduler::TicketId;

/// Errors raised by the sandbox runtime adapter and its backends
#[derive(Error, Debug)]
pub enum SandboxError {
    /// The isolated environment could not be created or reached
    #[error("failed to provision sandbox: {0}")]
    Provisioning(String),

    /// An expected file does not exist inside the sandbox
    #[error("{path} not found in sandbox {sandbox}")]
    NotFound { sandbox: String, path: String },

    /// Processes survived the teardown of a sandbox
    #[error("sandbox {sandbox} leaked {} process(es) after release: {pids:?}", .pids.len())]
    LeakDetected { sandbox: String, pids: Vec<u32> },

    /// Copying files into or out of the sandbox took too long
    #[error("sandbox I/O timed out after {0} ms")]
    IoTimeout(u64),

    /// The handle was already released
    #[error("sandbox {0} has already been released")]
    Released(String),

    /// The backend failed while driving a command
    #[error("sandbox backend failure: {0}")]
    Backend(String),

    #[error("sandbox I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl SandboxError {
    /// Whether a fresh attempt on another slot may succeed
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::LeakDetected { .. })
    }
}

/// A grading configuration that failed validation at load time
#[derive(Error, Debug, PartialEq, Eq)]
pub enum GradingConfigError {
    #[error("grading config is not valid JSON: {0}")]
    Parse(String),

    #[error("grading config has no steps")]
    NoSteps,

    #[error("step #{0} has an empty name")]
    EmptyName(usize),

    #[error("step name {0:?} is used more than once")]
    DuplicateName(String),

    #[error("step {0:?} has an empty program")]
    EmptyProgram(String),

    #[error("step {step:?} depends on {dependency:?}, which is not an earlier step")]
    UnknownDependency { step: String, dependency: String },

    #[error("step {step:?} sets the {limit} limit to zero")]
    ZeroLimit { step: String, limit: &'static str },

    #[error("the sandbox {0} limit is zero")]
    ZeroSandboxLimit(&'static str),

    #[error("step {0:?} has an invalid working directory")]
    InvalidWorkingDir(String),

    #[error("resource class must not be empty")]
    EmptyResourceClass,

    #[error("steps award points but the total is 0")]
    ZeroTotalPoints,
}

/// Errors surfaced by the result stores
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("submission {0} not found")]
    SubmissionNotFound(SubmissionId),

    #[error("grading config {0} not found")]
    GradingConfigNotFound(GradingConfigId),

    #[error(transparent)]
    InvalidGradingConfig(#[from] GradingConfigError),

    #[error("failed to encode result: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl StoreError {
    /// Whether repeating the same operation may succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Database(_))
    }
}

/// Errors returned to callers of the scheduler
#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error("no resource pool named {0:?}")]
    UnknownPool(String),

    #[error("ticket {0} not found")]
    UnknownTicket(TicketId),

    #[error("scheduler is shutting down")]
    ShuttingDown,

    #[error(transparent)]
    Store(#[from] StoreError),
}
