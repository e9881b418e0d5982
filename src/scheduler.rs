use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::{AbortHandle, JoinSet};
use tokio_util::sync::CancellationToken;

use crate::aggregator::Aggregator;
use crate::config::{PoolConfig, SchedulerConfig};
use crate::create_timestamp;
use crate::error::{SandboxError, SchedulerError, StoreError};
use crate::evaluator::Evaluator;
use crate::grading::{GradingConfigId, GradingResult, GradingStatus, SubmissionId};
use crate::queue::{GradingQueue, QueuedGrading};
use crate::sandbox::{SandboxAdapter, SandboxLease};
use crate::store::{ResultId, SubmissionSource};
use crate::worker::worker;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct TicketId(pub u64);

impl fmt::Display for TicketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle of a ticket; no transition leaves a terminal state
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TicketState {
    Queued,
    Running,
    Completed,
    TimedOut,
    InfrastructureError,
    Cancelled,
}

impl TicketState {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Queued | Self::Running)
    }
}

impl From<GradingStatus> for TicketState {
    fn from(status: GradingStatus) -> Self {
        match status {
            GradingStatus::Completed => Self::Completed,
            GradingStatus::TimedOut => Self::TimedOut,
            GradingStatus::InfrastructureError => Self::InfrastructureError,
            GradingStatus::Cancelled => Self::Cancelled,
        }
    }
}

/// What callers can see of a ticket
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct TicketView {
    pub ticket: TicketId,
    pub submission_id: SubmissionId,
    pub grading_config_id: GradingConfigId,
    pub pool: String,
    pub attempt: u32,
    pub state: TicketState,
    /// Set once the attempt's result is persisted
    pub result_id: Option<ResultId>,
    /// Ticket of the automatic retry scheduled after this attempt
    pub requeued_as: Option<TicketId>,
    /// Why the attempt's result could not be persisted
    pub error: Option<String>,
    pub created_time: String,
}

struct TicketEntry {
    view: TicketView,
    cancel: CancellationToken,
    watchdog: Option<AbortHandle>,
    max_points: u32,
    /// When the ticket reached its final state and its result was handled
    settled_at: Option<Instant>,
}

/// A resource pool: one FIFO and a fixed number of sandbox slots
pub struct Pool {
    name: String,
    queue: GradingQueue,
    slots: Arc<Semaphore>,
    slot_count: usize,
    queue_wait_timeout: Duration,
}

impl Pool {
    fn new(config: &PoolConfig) -> Self {
        Self {
            name: config.name.clone(),
            queue: GradingQueue::new(),
            slots: Arc::new(Semaphore::new(config.slots)),
            slot_count: config.slots,
            queue_wait_timeout: config.queue_wait_timeout.into(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn queue(&self) -> &GradingQueue {
        &self.queue
    }

    pub fn slots(&self) -> &Arc<Semaphore> {
        &self.slots
    }
}

type GradingKey = (SubmissionId, GradingConfigId);

/// Accepts grading requests and runs them on per-pool workers
///
/// Pools are partitioned by the resource class of the grading
/// configuration, so a backlog in one class never delays another.
/// Settled tickets stay visible for `ticket_retention`, then are forgotten.
pub struct Scheduler {
    pools: HashMap<String, Arc<Pool>>,
    tickets: Mutex<HashMap<TicketId, TicketEntry>>,
    next_ticket: AtomicU64,
    ticket_retention: Duration,
    /// Last attempt number handed out per submission with unsettled tickets
    attempts: tokio::sync::Mutex<HashMap<SubmissionId, u32>>,
    /// Keys with an attempt between dispatch and completion
    running_keys: Mutex<HashSet<GradingKey>>,
    source: Arc<dyn SubmissionSource>,
    aggregator: Arc<Aggregator>,
    evaluator: Arc<Evaluator>,
    adapter: Arc<SandboxAdapter>,
    shutdown: CancellationToken,
}

impl Scheduler {
    pub fn new(
        pools: &[PoolConfig],
        config: &SchedulerConfig,
        source: Arc<dyn SubmissionSource>,
        aggregator: Arc<Aggregator>,
        evaluator: Arc<Evaluator>,
        adapter: Arc<SandboxAdapter>,
        shutdown: CancellationToken,
    ) -> Arc<Self> {
        let pools = pools
            .iter()
            .map(|config| (config.name.clone(), Arc::new(Pool::new(config))))
            .collect();
        Arc::new(Self {
            pools,
            tickets: Mutex::new(HashMap::new()),
            next_ticket: AtomicU64::new(1),
            ticket_retention: config.ticket_retention.into(),
            attempts: tokio::sync::Mutex::new(HashMap::new()),
            running_keys: Mutex::new(HashSet::new()),
            source,
            aggregator,
            evaluator,
            adapter,
            shutdown,
        })
    }

    /// Spawns one worker per slot of every pool
    pub fn spawn_workers(self: &Arc<Self>, workers: &mut JoinSet<anyhow::Result<()>>) {
        for pool in self.pools.values() {
            for i in 1..=pool.slot_count {
                workers.spawn(worker(
                    format!("{}-{i}", pool.name),
                    pool.clone(),
                    self.clone(),
                    self.shutdown.clone(),
                ));
            }
        }
    }

    pub fn pool_names(&self) -> Vec<&str> {
        self.pools.keys().map(String::as_str).collect()
    }

    /// Queues a grading of `submission_id` against `grading_config_id`
    pub async fn enqueue(
        self: &Arc<Self>,
        submission_id: SubmissionId,
        grading_config_id: GradingConfigId,
    ) -> Result<TicketView, SchedulerError> {
        if self.shutdown.is_cancelled() {
            return Err(SchedulerError::ShuttingDown);
        }
        let config = self.source.grading_config(grading_config_id).await?;
        self.source.submission(submission_id).await?;

        let pool = self
            .pools
            .get(&config.resource_class)
            .cloned()
            .ok_or_else(|| SchedulerError::UnknownPool(config.resource_class.clone()))?;

        Ok(self
            .push_ticket(
                &pool,
                submission_id,
                grading_config_id,
                config.limits.total_points,
                0,
            )
            .await?)
    }

    /// Cancels a ticket
    ///
    /// A queued ticket is removed and never runs; a running one is asked to
    /// stop. Returns `false` when the ticket already reached a terminal state.
    pub async fn cancel(&self, ticket: TicketId) -> Result<bool, SchedulerError> {
        enum Action {
            Dequeue(Arc<Pool>, QueuedKey),
            Interrupt,
            Nothing,
        }

        let action = {
            let mut tickets = self.tickets.lock();
            let entry = tickets
                .get_mut(&ticket)
                .ok_or(SchedulerError::UnknownTicket(ticket))?;
            match entry.view.state {
                TicketState::Queued => {
                    entry.view.state = TicketState::Cancelled;
                    if let Some(watchdog) = entry.watchdog.take() {
                        watchdog.abort();
                    }
                    match self.pools.get(&entry.view.pool) {
                        Some(pool) => Action::Dequeue(pool.clone(), QueuedKey::of(entry)),
                        None => Action::Nothing,
                    }
                }
                TicketState::Running => {
                    entry.cancel.cancel();
                    Action::Interrupt
                }
                _ => Action::Nothing,
            }
        };

        match action {
            Action::Dequeue(pool, key) => {
                pool.queue.remove(ticket).await;
                log::info!("Ticket {ticket} cancelled while queued");
                let result = GradingResult::without_steps(
                    key.submission_id,
                    key.grading_config_id,
                    key.attempt,
                    key.max_points,
                    GradingStatus::Cancelled,
                    None,
                );
                self.record(ticket, result).await;
                self.settle(ticket, None, None);
                self.forget_attempts(key.submission_id).await;
                Ok(true)
            }
            Action::Interrupt => {
                log::info!("Ticket {ticket} cancellation requested while running");
                Ok(true)
            }
            Action::Nothing => Ok(false),
        }
    }

    pub fn status(&self, ticket: TicketId) -> Result<TicketView, SchedulerError> {
        self.tickets
            .lock()
            .get(&ticket)
            .map(|entry| entry.view.clone())
            .ok_or(SchedulerError::UnknownTicket(ticket))
    }

    async fn push_ticket(
        self: &Arc<Self>,
        pool: &Arc<Pool>,
        submission_id: SubmissionId,
        grading_config_id: GradingConfigId,
        max_points: u32,
        retry: u32,
    ) -> Result<TicketView, StoreError> {
        self.prune();

        // The ticket joins the table before the attempt lock is released, so
        // `forget_attempts` never drops a counter that is still in use.
        let view = {
            let mut attempts = self.attempts.lock().await;
            let last = match attempts.get(&submission_id) {
                Some(last) => *last,
                None => self.aggregator.store().latest_attempt(submission_id).await?,
            };
            let attempt = last + 1;
            attempts.insert(submission_id, attempt);

            let ticket = TicketId(self.next_ticket.fetch_add(1, Ordering::Relaxed));
            let view = TicketView {
                ticket,
                submission_id,
                grading_config_id,
                pool: pool.name.clone(),
                attempt,
                state: TicketState::Queued,
                result_id: None,
                requeued_as: None,
                error: None,
                created_time: create_timestamp(),
            };
            self.tickets.lock().insert(
                ticket,
                TicketEntry {
                    view: view.clone(),
                    cancel: self.shutdown.child_token(),
                    watchdog: None,
                    max_points,
                    settled_at: None,
                },
            );
            view
        };
        let ticket = view.ticket;

        // Armed before the ticket becomes visible to workers
        let watchdog = tokio::spawn({
            let scheduler = self.clone();
            let pool = pool.clone();
            async move {
                tokio::select! {
                    _ = scheduler.shutdown.cancelled() => {}
                    _ = tokio::time::sleep(pool.queue_wait_timeout) => {
                        scheduler.expire(&pool, ticket).await;
                    }
                }
            }
        });
        match self.tickets.lock().get_mut(&ticket) {
            Some(entry) if entry.view.state == TicketState::Queued => {
                entry.watchdog = Some(watchdog.abort_handle());
            }
            _ => watchdog.abort(),
        }

        pool.queue
            .push(QueuedGrading {
                ticket,
                submission_id,
                grading_config_id,
                attempt: view.attempt,
                max_points,
                retry,
            })
            .await;

        log::info!(
            "Ticket {ticket}: submission {submission_id} attempt {} queued in pool {}",
            view.attempt,
            pool.name
        );
        Ok(view)
    }

    /// Drops settled tickets older than the retention window
    fn prune(&self) {
        let now = Instant::now();
        let mut tickets = self.tickets.lock();
        let before_len = tickets.len();
        tickets.retain(|_, entry| {
            entry
                .settled_at
                .is_none_or(|at| now.duration_since(at) < self.ticket_retention)
        });
        let evicted = before_len - tickets.len();
        if evicted > 0 {
            log::debug!("Evicted {evicted} settled ticket(s)");
        }
    }

    /// Lets the store seed the attempt counter again once a submission has
    /// nothing queued or running
    async fn forget_attempts(&self, submission: SubmissionId) {
        let mut attempts = self.attempts.lock().await;
        let busy = self
            .tickets
            .lock()
            .values()
            .any(|entry| entry.view.submission_id == submission && entry.settled_at.is_none());
        if !busy {
            attempts.remove(&submission);
        }
    }

    /// Fails a ticket that waited too long for a slot
    async fn expire(&self, pool: &Pool, ticket: TicketId) {
        let key = {
            let mut tickets = self.tickets.lock();
            let Some(entry) = tickets.get_mut(&ticket) else {
                return;
            };
            if entry.view.state != TicketState::Queued {
                return;
            }
            entry.view.state = TicketState::InfrastructureError;
            entry.watchdog = None;
            QueuedKey::of(entry)
        };

        pool.queue.remove(ticket).await;
        log::warn!(
            "Ticket {ticket} waited more than {} ms in pool {}, giving up",
            pool.queue_wait_timeout.as_millis(),
            pool.name
        );
        let result = GradingResult::without_steps(
            key.submission_id,
            key.grading_config_id,
            key.attempt,
            key.max_points,
            GradingStatus::InfrastructureError,
            Some(format!(
                "no free slot in pool {} within {} ms",
                pool.name,
                pool.queue_wait_timeout.as_millis()
            )),
        );
        self.record(ticket, result).await;
        self.settle(ticket, None, None);
        self.forget_attempts(key.submission_id).await;
    }

    /// Claims the key of a queued attempt for dispatch
    ///
    /// Returns `false` while another attempt with the same submission and
    /// configuration is running; that ticket then keeps its queue position.
    pub(crate) fn claim_key(&self, key: GradingKey) -> bool {
        self.running_keys.lock().insert(key)
    }

    /// Releases a claimed key and lets the pool's workers look at the
    /// tickets that were waiting for it
    pub(crate) fn release_key(&self, pool: &Pool, key: GradingKey) {
        self.running_keys.lock().remove(&key);
        pool.queue.wake();
    }

    /// Moves a ticket from queued to running
    ///
    /// Returns its cancellation token, or `None` when the ticket was
    /// cancelled or expired in the meantime.
    pub(crate) fn try_start(&self, ticket: TicketId) -> Option<CancellationToken> {
        let mut tickets = self.tickets.lock();
        let entry = tickets.get_mut(&ticket)?;
        if entry.view.state != TicketState::Queued {
            return None;
        }
        entry.view.state = TicketState::Running;
        if let Some(watchdog) = entry.watchdog.take() {
            watchdog.abort();
        }
        Some(entry.cancel.clone())
    }

    /// Runs one attempt from sandbox acquisition to release
    pub(crate) async fn run(
        &self,
        job: QueuedGrading,
        permit: OwnedSemaphorePermit,
        cancel: CancellationToken,
    ) -> GradingResult {
        let failed = |error: String| {
            GradingResult::without_steps(
                job.submission_id,
                job.grading_config_id,
                job.attempt,
                job.max_points,
                GradingStatus::InfrastructureError,
                Some(error),
            )
        };

        let config = match self.source.grading_config(job.grading_config_id).await {
            Ok(config) => config,
            Err(e) => return failed(e.to_string()),
        };
        let submission = match self.source.submission(job.submission_id).await {
            Ok(submission) => submission,
            Err(e) => return failed(e.to_string()),
        };

        let lease = match SandboxLease::acquire(self.adapter.clone(), &config.sandbox, permit).await
        {
            Ok(lease) => lease,
            Err(e) => {
                log::error!("Ticket {}: {e}", job.ticket);
                return failed(e.to_string());
            }
        };
        let handle = lease.handle();
        log::info!(
            "Ticket {}: grading submission {} attempt {} in sandbox {}",
            job.ticket,
            job.submission_id,
            job.attempt,
            handle.id()
        );

        let mut result = self
            .evaluator
            .evaluate(&handle, &config, &submission, job.attempt, &cancel)
            .await;

        match lease.release().await {
            Ok(()) => {}
            Err(SandboxError::LeakDetected { sandbox, pids }) => {
                log::error!(
                    "Ticket {}: sandbox {sandbox} leaked {pids:?}, flagging attempt for review",
                    job.ticket
                );
                result.needs_review = true;
            }
            Err(e) => log::error!("Ticket {}: failed to release sandbox: {e}", job.ticket),
        }
        result
    }

    /// Persists an attempt, settles its ticket and retries if warranted
    ///
    /// The ticket only turns terminal once its result is handled; an attempt
    /// whose result could not be persisted ends as an infrastructure error.
    pub(crate) async fn complete(
        self: &Arc<Self>,
        pool: &Arc<Pool>,
        job: QueuedGrading,
        result: GradingResult,
    ) {
        let status = result.status;
        let requeue_on_status = self.aggregator.should_requeue(&result, job.retry);
        let persisted = self.record(job.ticket, result).await;
        let state = if persisted {
            status.into()
        } else {
            TicketState::InfrastructureError
        };

        let requeue = requeue_on_status || (!persisted && self.aggregator.may_retry(job.retry));
        let mut requeued_as = None;
        if requeue && !self.shutdown.is_cancelled() {
            match self
                .push_ticket(
                    pool,
                    job.submission_id,
                    job.grading_config_id,
                    job.max_points,
                    job.retry + 1,
                )
                .await
            {
                Ok(view) => {
                    log::warn!(
                        "Ticket {}: infrastructure error, retrying as ticket {} (retry {})",
                        job.ticket,
                        view.ticket,
                        job.retry + 1
                    );
                    requeued_as = Some(view.ticket);
                }
                Err(e) => log::error!("Ticket {}: failed to requeue: {e}", job.ticket),
            }
        }

        self.settle(job.ticket, Some(state), requeued_as);
        self.forget_attempts(job.submission_id).await;
    }

    /// Persists the result of an attempt; returns whether a record exists
    async fn record(&self, ticket: TicketId, result: GradingResult) -> bool {
        let outcome = self.aggregator.finalize(ticket, result).await;
        let mut tickets = self.tickets.lock();
        let entry = tickets.get_mut(&ticket);
        match outcome {
            Ok(id) => {
                if let Some(entry) = entry {
                    entry.view.result_id = Some(id);
                }
                true
            }
            Err(e) => {
                log::error!("Ticket {ticket}: result lost, failed to persist it: {e}");
                if let Some(entry) = entry {
                    entry.view.error = Some(format!("failed to persist result: {e}"));
                }
                false
            }
        }
    }

    /// Moves a ticket to its final state; a `None` state keeps the current one
    fn settle(&self, ticket: TicketId, state: Option<TicketState>, requeued_as: Option<TicketId>) {
        if let Some(entry) = self.tickets.lock().get_mut(&ticket) {
            if let Some(state) = state
                && entry.view.state == TicketState::Running
            {
                entry.view.state = state;
            }
            entry.view.requeued_as = requeued_as;
            entry.settled_at = Some(Instant::now());
        }
    }
}

/// Identity of a ticket's attempt, copied out of the ticket table
struct QueuedKey {
    submission_id: SubmissionId,
    grading_config_id: GradingConfigId,
    attempt: u32,
    max_points: u32,
}

impl QueuedKey {
    fn of(entry: &TicketEntry) -> Self {
        Self {
            submission_id: entry.view.submission_id,
            grading_config_id: entry.view.grading_config_id,
            attempt: entry.view.attempt,
            max_points: entry.max_points,
        }
    }
}
