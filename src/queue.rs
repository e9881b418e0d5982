use std::collections::VecDeque;

use tokio::sync::{Mutex, Notify};

use crate::grading::{GradingConfigId, SubmissionId};
use crate::scheduler::TicketId;

/// One grading attempt waiting for a slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueuedGrading {
    pub ticket: TicketId,
    pub submission_id: SubmissionId,
    pub grading_config_id: GradingConfigId,
    pub attempt: u32,
    /// Maximum points of the configuration at enqueue time
    pub max_points: u32,
    /// Automatic retries that led to this attempt
    pub retry: u32,
}

impl QueuedGrading {
    /// Attempts sharing this key never run at the same time
    pub fn key(&self) -> (SubmissionId, GradingConfigId) {
        (self.submission_id, self.grading_config_id)
    }
}

/// FIFO of one resource pool
pub struct GradingQueue {
    queue: Mutex<VecDeque<QueuedGrading>>,
    notify: Notify,
}

impl GradingQueue {
    pub fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
        }
    }

    pub async fn push(&self, job: QueuedGrading) {
        self.queue.lock().await.push_back(job);
        self.notify.notify_waiters();
    }

    pub async fn pop(&self) -> QueuedGrading {
        self.pop_where(|_| true).await
    }

    /// Takes the oldest job `claim` accepts, waiting until there is one
    ///
    /// Rejected jobs keep their position. `claim` runs under the queue lock
    /// and is called at most once with a `true` outcome.
    pub async fn pop_where<F>(&self, mut claim: F) -> QueuedGrading
    where
        F: FnMut(&QueuedGrading) -> bool,
    {
        loop {
            // Registered before the scan so a push or wake in between is not lost
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut queue = self.queue.lock().await;
                let claimed = queue.iter().position(|job| claim(job));
                if let Some(job) = claimed.and_then(|idx| queue.remove(idx)) {
                    return job;
                }
            }
            notified.await;
        }
    }

    /// Makes waiting consumers scan the queue again
    pub fn wake(&self) {
        self.notify.notify_waiters();
    }

    /// Removes a ticket that has not been picked up yet
    pub async fn remove(&self, ticket: TicketId) -> bool {
        let mut queue = self.queue.lock().await;
        let before_len = queue.len();
        queue.retain(|j| j.ticket != ticket);
        before_len != queue.len()
    }

    pub async fn len(&self) -> usize {
        self.queue.lock().await.len()
    }
}

impl Default for GradingQueue {
    fn default() -> Self {
        Self::new()
    }
}
