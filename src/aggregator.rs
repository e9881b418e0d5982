use std::sync::Arc;
use std::time::Duration;

use crate::config::AggregatorConfig;
use crate::error::StoreError;
use crate::grading::{GradingResult, GradingStatus};
use crate::scheduler::TicketId;
use crate::store::{ResultId, ResultStore};

/// Turns evaluator output into persisted, append-only grading records
pub struct Aggregator {
    store: Arc<dyn ResultStore>,
    max_infrastructure_retries: u32,
    persist_attempts: u32,
    persist_backoff: Duration,
}

impl Aggregator {
    pub fn new(store: Arc<dyn ResultStore>, config: &AggregatorConfig) -> Self {
        Self {
            store,
            max_infrastructure_retries: config.max_infrastructure_retries,
            persist_attempts: config.persist_attempts.max(1),
            persist_backoff: config.persist_backoff.into(),
        }
    }

    pub fn store(&self) -> &Arc<dyn ResultStore> {
        &self.store
    }

    /// Persists the result of one attempt
    ///
    /// Idempotent on `(submission_id, attempt)`: finalizing the same attempt
    /// again stores nothing and returns the id of the first record. Transient
    /// store failures are retried with exponential backoff.
    pub async fn finalize(
        &self,
        ticket: TicketId,
        mut result: GradingResult,
    ) -> Result<ResultId, StoreError> {
        if result.total_points > result.max_points {
            log::warn!(
                "Ticket {ticket}: clamping {} points to the maximum of {}",
                result.total_points,
                result.max_points
            );
            result.total_points = result.max_points;
        }

        let id = self.persist(ticket, &result).await?;
        log::info!(
            "Ticket {ticket}: submission {} attempt {} finalized as {} ({}/{} points) -> result {id}",
            result.submission_id,
            result.attempt,
            result.status,
            result.total_points,
            result.max_points
        );
        if result.needs_review {
            log::error!(
                "Ticket {ticket}: submission {} attempt {} needs manual review",
                result.submission_id,
                result.attempt
            );
        }
        Ok(id)
    }

    async fn persist(&self, ticket: TicketId, result: &GradingResult) -> Result<ResultId, StoreError> {
        let mut delay = self.persist_backoff;
        let mut tries = 1;
        loop {
            match self.store.insert_result(result).await {
                Ok(id) => return Ok(id),
                Err(e) if e.is_transient() && tries < self.persist_attempts => {
                    log::warn!(
                        "Ticket {ticket}: persisting result failed ({tries}/{}): {e}, retrying in {} ms",
                        self.persist_attempts,
                        delay.as_millis()
                    );
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                    tries += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Whether a finished attempt should be retried automatically
    pub fn should_requeue(&self, result: &GradingResult, retries_so_far: u32) -> bool {
        result.status == GradingStatus::InfrastructureError && self.may_retry(retries_so_far)
    }

    /// Whether the retry budget allows another automatic attempt
    pub fn may_retry(&self, retries_so_far: u32) -> bool {
        retries_so_far < self.max_infrastructure_retries
    }
}
