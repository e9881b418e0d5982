#![allow(dead_code)]

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use autograder::aggregator::Aggregator;
use autograder::config::{
    AggregatorConfig, MilliSecond, PoolConfig, SandboxConfig, SchedulerConfig,
};
use autograder::error::{SandboxError, StoreError};
use autograder::evaluator::Evaluator;
use autograder::executor::Executor;
use autograder::grading::{
    GradingConfig, GradingConfigId, GradingResult, Submission, SubmissionId, SubmittedFile,
};
use autograder::sandbox::{
    ExecRequest, ProcessRuntime, RawExecution, SandboxAdapter, SandboxHandle, SandboxLimits,
    SandboxRuntime,
};
use autograder::scheduler::{Scheduler, TicketId, TicketState, TicketView};
use autograder::store::{MemoryStore, ResultId, ResultStore, StoredResult};

/// A complete grading stack on top of an in-memory store
pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub scheduler: Arc<Scheduler>,
    pub shutdown: CancellationToken,
    pub workers: JoinSet<anyhow::Result<()>>,
}

/// Knobs of a harness beyond its runtime and pools
#[derive(Default)]
pub struct HarnessOptions {
    /// Result inserts that fail with a database error before inserts work
    pub failing_inserts: u32,
    pub ticket_retention: Option<MilliSecond>,
}

impl Harness {
    pub fn start(runtime: Arc<dyn SandboxRuntime>, pools: Vec<PoolConfig>) -> Self {
        Self::start_with(runtime, pools, HarnessOptions::default())
    }

    pub fn start_with(
        runtime: Arc<dyn SandboxRuntime>,
        pools: Vec<PoolConfig>,
        options: HarnessOptions,
    ) -> Self {
        let sandbox_config = SandboxConfig {
            acquire_attempts: 1,
            acquire_backoff: MilliSecond(0),
            ..SandboxConfig::default()
        };
        let aggregator_config = AggregatorConfig {
            persist_attempts: 3,
            persist_backoff: MilliSecond(5),
            ..AggregatorConfig::default()
        };
        let mut scheduler_config = SchedulerConfig::default();
        if let Some(retention) = options.ticket_retention {
            scheduler_config.ticket_retention = retention;
        }

        let store = Arc::new(MemoryStore::new());
        let results = Arc::new(FlakyResults {
            inner: store.clone(),
            failures: AtomicU32::new(options.failing_inserts),
        });
        let adapter = Arc::new(SandboxAdapter::new(runtime, &sandbox_config));
        let executor = Arc::new(Executor::new(adapter.clone(), &sandbox_config));
        let evaluator = Arc::new(Evaluator::new(executor));
        let aggregator = Arc::new(Aggregator::new(results, &aggregator_config));
        let shutdown = CancellationToken::new();
        let scheduler = Scheduler::new(
            &pools,
            &scheduler_config,
            store.clone(),
            aggregator,
            evaluator,
            adapter,
            shutdown.clone(),
        );

        let mut workers = JoinSet::new();
        scheduler.spawn_workers(&mut workers);

        Self {
            store,
            scheduler,
            shutdown,
            workers,
        }
    }

    pub fn add_config(&self, body: &str) -> Arc<GradingConfig> {
        let config = GradingConfig::from_json(body).unwrap();
        self.store.add_grading_config(config.clone());
        config
    }

    pub fn add_submission(&self, id: i64, config: GradingConfigId, files: &[(&str, &str)]) {
        self.store.add_submission(Submission {
            id: SubmissionId(id),
            grading_config_id: config,
            files: files
                .iter()
                .map(|(name, content)| SubmittedFile {
                    name: name.to_string(),
                    content: content.as_bytes().to_vec(),
                })
                .collect(),
        });
    }

    /// Polls a ticket until it is terminal and its result was handled
    pub async fn wait_terminal(&self, ticket: TicketId) -> TicketView {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(20);
        loop {
            let view = self.scheduler.status(ticket).unwrap();
            if view.state.is_terminal() && (view.result_id.is_some() || view.error.is_some()) {
                return view;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "ticket {ticket} stuck in {:?}",
                view.state
            );
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    /// Follows automatic retries to the last attempt of a ticket
    pub async fn wait_settled(&self, ticket: TicketId) -> TicketView {
        let mut view = self.wait_terminal(ticket).await;
        while let Some(next) = view.requeued_as {
            view = self.wait_terminal(next).await;
        }
        view
    }

    pub async fn stop(mut self) {
        self.shutdown.cancel();
        while let Some(res) = self.workers.join_next().await {
            res.unwrap().unwrap();
        }
    }
}

/// Result store whose first inserts fail with a database error
pub struct FlakyResults {
    inner: Arc<MemoryStore>,
    failures: AtomicU32,
}

#[async_trait]
impl ResultStore for FlakyResults {
    async fn insert_result(&self, result: &GradingResult) -> Result<ResultId, StoreError> {
        let failing = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if failing {
            return Err(StoreError::Database(sqlx::Error::PoolTimedOut));
        }
        self.inner.insert_result(result).await
    }

    async fn results_for(&self, submission: SubmissionId) -> Result<Vec<StoredResult>, StoreError> {
        self.inner.results_for(submission).await
    }

    async fn latest_attempt(&self, submission: SubmissionId) -> Result<u32, StoreError> {
        self.inner.latest_attempt(submission).await
    }
}

pub fn pool(name: &str, slots: usize) -> PoolConfig {
    PoolConfig {
        name: name.to_string(),
        slots,
        queue_wait_timeout: MilliSecond(30_000),
    }
}

pub fn process_runtime(dir: &tempfile::TempDir) -> Arc<dyn SandboxRuntime> {
    Arc::new(ProcessRuntime::with_work_root(dir.path().to_path_buf()))
}

/// How a scripted command misbehaves
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// The backend reports a failure
    Error,
    /// The grading task panics
    Panic,
}

/// Runtime whose commands never start real processes
///
/// Programs named `explode` fail in the backend and `panic` panics; every
/// other program exits 0 with empty output. Creation can be made to fail and
/// teardown can be made to leave processes behind.
pub struct ScriptedRuntime {
    root: tempfile::TempDir,
    counter: AtomicU64,
    pub fail_create: bool,
    /// Pids reported as surviving every sandbox
    pub survivors: Vec<u32>,
    pub created: Mutex<Vec<String>>,
    pub destroyed: Mutex<Vec<String>>,
    live: Mutex<HashSet<String>>,
}

impl ScriptedRuntime {
    pub fn new() -> Self {
        Self {
            root: tempfile::tempdir().unwrap(),
            counter: AtomicU64::new(0),
            fail_create: false,
            survivors: Vec::new(),
            created: Mutex::new(Vec::new()),
            destroyed: Mutex::new(Vec::new()),
            live: Mutex::new(HashSet::new()),
        }
    }

    pub fn failing_create() -> Self {
        Self {
            fail_create: true,
            ..Self::new()
        }
    }

    pub fn leaking(pids: &[u32]) -> Self {
        Self {
            survivors: pids.to_vec(),
            ..Self::new()
        }
    }

    pub fn live_count(&self) -> usize {
        self.live.lock().len()
    }

    fn fault(program: &str) -> Option<Fault> {
        match program {
            "explode" => Some(Fault::Error),
            "panic" => Some(Fault::Panic),
            _ => None,
        }
    }
}

#[async_trait]
impl SandboxRuntime for ScriptedRuntime {
    fn name(&self) -> &'static str {
        "scripted"
    }

    async fn create(&self, limits: &SandboxLimits) -> Result<SandboxHandle, SandboxError> {
        if self.fail_create {
            return Err(SandboxError::Provisioning("no sandbox for you".to_string()));
        }
        let id = format!("scripted-{}", self.counter.fetch_add(1, Ordering::SeqCst));
        let root: PathBuf = self.root.path().join(&id);
        tokio::fs::create_dir_all(&root).await?;
        self.created.lock().push(id.clone());
        self.live.lock().insert(id.clone());
        Ok(SandboxHandle::new(id, root, None, *limits))
    }

    async fn destroy(&self, handle: &SandboxHandle) -> Result<(), SandboxError> {
        self.destroyed.lock().push(handle.id().to_string());
        self.live.lock().remove(handle.id());
        Ok(())
    }

    async fn surviving_processes(&self, _handle: &SandboxHandle) -> Result<Vec<u32>, SandboxError> {
        Ok(self.survivors.clone())
    }

    async fn exec(
        &self,
        _handle: &SandboxHandle,
        request: &ExecRequest,
    ) -> Result<RawExecution, SandboxError> {
        match Self::fault(&request.argv[0]) {
            Some(Fault::Error) => Err(SandboxError::Backend("scripted failure".to_string())),
            Some(Fault::Panic) => panic!("scripted panic"),
            None => Ok(RawExecution {
                exit_code: Some(0),
                wall_time: Duration::from_millis(1),
                ..Default::default()
            }),
        }
    }

    async fn kill_all(&self, _handle: &SandboxHandle) -> Result<(), SandboxError> {
        Ok(())
    }

    async fn sweep_stale(&self) -> Result<usize, SandboxError> {
        Ok(0)
    }
}

pub fn assert_state(view: &TicketView, state: TicketState) {
    assert_eq!(view.state, state, "unexpected state of ticket {}", view.ticket);
}
