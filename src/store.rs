//! Storage seams of the grading core.
//!
//! Submissions and grading configurations are produced by the web
//! application and only read here. Grading results are append-only records
//! keyed by `(submission_id, attempt)`.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::StoreError;
use crate::grading::{GradingConfig, GradingConfigId, GradingResult, Submission, SubmissionId};

/// Id of a persisted grading result
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(transparent)]
pub struct ResultId(pub i64);

impl fmt::Display for ResultId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct StoredResult {
    pub id: ResultId,
    #[serde(flatten)]
    pub result: GradingResult,
}

#[async_trait]
pub trait SubmissionSource: Send + Sync {
    async fn submission(&self, id: SubmissionId) -> Result<Submission, StoreError>;

    /// Loads and validates a grading configuration
    async fn grading_config(&self, id: GradingConfigId) -> Result<Arc<GradingConfig>, StoreError>;
}

#[async_trait]
pub trait ResultStore: Send + Sync {
    /// Inserts a result unless one exists for its `(submission_id, attempt)`;
    /// either way returns the id of the stored record
    async fn insert_result(&self, result: &GradingResult) -> Result<ResultId, StoreError>;

    /// All attempts of a submission, oldest first
    async fn results_for(&self, submission: SubmissionId) -> Result<Vec<StoredResult>, StoreError>;

    /// Highest attempt number recorded for a submission, 0 if none
    async fn latest_attempt(&self, submission: SubmissionId) -> Result<u32, StoreError>;
}

/// In-memory store used by tests and the scheduler's unit tests
#[derive(Default)]
pub struct MemoryStore {
    submissions: Mutex<HashMap<SubmissionId, Submission>>,
    configs: Mutex<HashMap<GradingConfigId, Arc<GradingConfig>>>,
    results: Mutex<Vec<StoredResult>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_submission(&self, submission: Submission) {
        self.submissions.lock().insert(submission.id, submission);
    }

    pub fn add_grading_config(&self, config: Arc<GradingConfig>) {
        self.configs.lock().insert(config.id, config);
    }

    pub fn results(&self) -> Vec<StoredResult> {
        self.results.lock().clone()
    }
}

#[async_trait]
impl SubmissionSource for MemoryStore {
    async fn submission(&self, id: SubmissionId) -> Result<Submission, StoreError> {
        self.submissions
            .lock()
            .get(&id)
            .cloned()
            .ok_or(StoreError::SubmissionNotFound(id))
    }

    async fn grading_config(&self, id: GradingConfigId) -> Result<Arc<GradingConfig>, StoreError> {
        self.configs
            .lock()
            .get(&id)
            .cloned()
            .ok_or(StoreError::GradingConfigNotFound(id))
    }
}

#[async_trait]
impl ResultStore for MemoryStore {
    async fn insert_result(&self, result: &GradingResult) -> Result<ResultId, StoreError> {
        let mut results = self.results.lock();
        if let Some(existing) = results.iter().find(|r| {
            r.result.submission_id == result.submission_id && r.result.attempt == result.attempt
        }) {
            return Ok(existing.id);
        }
        let id = ResultId(results.len() as i64 + 1);
        results.push(StoredResult {
            id,
            result: result.clone(),
        });
        Ok(id)
    }

    async fn results_for(&self, submission: SubmissionId) -> Result<Vec<StoredResult>, StoreError> {
        let mut results: Vec<StoredResult> = self
            .results
            .lock()
            .iter()
            .filter(|r| r.result.submission_id == submission)
            .cloned()
            .collect();
        results.sort_by_key(|r| r.result.attempt);
        Ok(results)
    }

    async fn latest_attempt(&self, submission: SubmissionId) -> Result<u32, StoreError> {
        Ok(self
            .results
            .lock()
            .iter()
            .filter(|r| r.result.submission_id == submission)
            .map(|r| r.result.attempt)
            .max()
            .unwrap_or(0))
    }
}
