mod isolate_runtime;
mod procfs;
mod process_runtime;
mod runtime;

pub use isolate_runtime::IsolateRuntime;
pub use process_runtime::ProcessRuntime;
pub use runtime::{Captured, ExecRequest, RawExecution, SandboxRuntime, read_capped};

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tokio::sync::OwnedSemaphorePermit;

use crate::config::{ByteSize, MilliSecond, SandboxBackend, SandboxConfig};
use crate::error::SandboxError;
use crate::grading::{StepLimits, SubmittedFile, is_contained_path};

/// Resource limits of one sandbox
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(default)]
pub struct SandboxLimits {
    pub cpu_time: MilliSecond,
    pub wall_time: MilliSecond,
    pub memory: ByteSize,
    pub processes: u32,
    /// Cap on captured bytes per output stream
    pub output: ByteSize,
    pub network: bool,
}

impl Default for SandboxLimits {
    fn default() -> Self {
        Self {
            cpu_time: MilliSecond(10_000),
            wall_time: MilliSecond(30_000),
            memory: ByteSize(512 * 1024 * 1024),
            processes: 64,
            output: ByteSize(1024 * 1024),
            network: false,
        }
    }
}

impl SandboxLimits {
    /// Layers step limits under these ones; a step can only tighten
    pub fn tighten(&self, step: &StepLimits) -> Self {
        Self {
            cpu_time: min_opt(self.cpu_time, step.cpu_time),
            wall_time: min_opt(self.wall_time, step.wall_time),
            memory: min_opt(self.memory, step.memory),
            processes: min_opt(self.processes, step.processes),
            output: min_opt(self.output, step.output),
            network: self.network,
        }
    }

    pub fn with_wall_time_at_most(mut self, budget: MilliSecond) -> Self {
        self.wall_time = self.wall_time.min(budget);
        self
    }
}

fn min_opt<T: Ord + Copy>(base: T, tighter: Option<T>) -> T {
    tighter.map_or(base, |t| base.min(t))
}

/// A live isolated execution context
///
/// Owned by exactly one grading run. It is not `Clone`; a run shares it
/// between its own tasks behind an `Arc`.
#[derive(Debug)]
pub struct SandboxHandle {
    id: String,
    root: PathBuf,
    box_id: Option<u32>,
    limits: SandboxLimits,
    released: AtomicBool,
}

impl SandboxHandle {
    pub fn new(id: String, root: PathBuf, box_id: Option<u32>, limits: SandboxLimits) -> Self {
        Self {
            id,
            root,
            box_id,
            limits,
            released: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Host path of the sandbox's file tree
    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn box_id(&self) -> Option<u32> {
        self.box_id
    }

    pub fn limits(&self) -> &SandboxLimits {
        &self.limits
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }

    /// Resolves a sandbox-relative path on the host
    pub fn host_path(&self, path: &str) -> Result<PathBuf, SandboxError> {
        if !is_contained_path(path) {
            return Err(SandboxError::Backend(format!(
                "path {path:?} escapes sandbox {}",
                self.id
            )));
        }
        Ok(self.root.join(path))
    }

    /// Returns true for the first caller only
    fn mark_released(&self) -> bool {
        !self.released.swap(true, Ordering::SeqCst)
    }
}

/// Front door to a [`SandboxRuntime`]
///
/// Adds what the raw runtimes do not guarantee: bounded acquire retries,
/// idempotent release with leak verification, and I/O timeouts.
pub struct SandboxAdapter {
    runtime: Arc<dyn SandboxRuntime>,
    acquire_attempts: u32,
    acquire_backoff: Duration,
    io_timeout: Duration,
}

impl SandboxAdapter {
    pub fn new(runtime: Arc<dyn SandboxRuntime>, config: &SandboxConfig) -> Self {
        Self {
            runtime,
            acquire_attempts: config.acquire_attempts.max(1),
            acquire_backoff: config.acquire_backoff.into(),
            io_timeout: config.io_timeout.into(),
        }
    }

    pub fn runtime_name(&self) -> &'static str {
        self.runtime.name()
    }

    /// Creates a sandbox, retrying with exponential backoff
    pub async fn acquire(&self, limits: &SandboxLimits) -> Result<SandboxHandle, SandboxError> {
        let mut delay = self.acquire_backoff;
        let mut last_error = None;

        for attempt in 1..=self.acquire_attempts {
            match self.runtime.create(limits).await {
                Ok(handle) => {
                    log::debug!(
                        "Acquired {} sandbox {} on attempt {attempt}",
                        self.runtime.name(),
                        handle.id()
                    );
                    return Ok(handle);
                }
                Err(e) => {
                    log::warn!(
                        "Sandbox acquire attempt {attempt}/{} failed: {e}",
                        self.acquire_attempts
                    );
                    let retryable = e.is_retryable();
                    last_error = Some(e);
                    if !retryable {
                        break;
                    }
                }
            }
            if attempt < self.acquire_attempts {
                tokio::time::sleep(delay).await;
                delay = delay.saturating_mul(2);
            }
        }

        Err(SandboxError::Provisioning(format!(
            "gave up after {} attempts: {}",
            self.acquire_attempts,
            last_error.map_or_else(|| "unknown error".to_string(), |e| e.to_string())
        )))
    }

    /// Destroys a sandbox and verifies that nothing survived
    ///
    /// Safe to call any number of times; only the first call does work.
    pub async fn release(&self, handle: &SandboxHandle) -> Result<(), SandboxError> {
        if !handle.mark_released() {
            log::debug!("Sandbox {} already released", handle.id());
            return Ok(());
        }

        if let Err(e) = self.runtime.destroy(handle).await {
            log::error!("Failed to destroy sandbox {}: {e}", handle.id());
        }

        let mut survivors = self.runtime.surviving_processes(handle).await?;
        if !survivors.is_empty() {
            // Killed processes may still be on their way out
            let _ = self.runtime.kill_all(handle).await;
            tokio::time::sleep(Duration::from_millis(100)).await;
            survivors = self.runtime.surviving_processes(handle).await?;
        }

        if survivors.is_empty() {
            log::debug!("Released sandbox {}", handle.id());
            Ok(())
        } else {
            log::error!(
                "OPERATOR ALERT: sandbox {} leaked processes {survivors:?} after release",
                handle.id()
            );
            Err(SandboxError::LeakDetected {
                sandbox: handle.id().to_string(),
                pids: survivors,
            })
        }
    }

    /// Copies submission files into the sandbox root
    pub async fn copy_in(
        &self,
        handle: &SandboxHandle,
        files: &[SubmittedFile],
    ) -> Result<(), SandboxError> {
        self.ensure_live(handle)?;
        self.with_io_timeout(async {
            for file in files {
                self.runtime
                    .write_file(handle, &file.name, &file.content)
                    .await?;
            }
            Ok(())
        })
        .await
    }

    /// Reads files out of the sandbox; a missing path is `NotFound`
    pub async fn copy_out(
        &self,
        handle: &SandboxHandle,
        paths: &[String],
    ) -> Result<Vec<(String, Vec<u8>)>, SandboxError> {
        self.ensure_live(handle)?;
        self.with_io_timeout(async {
            let mut out = Vec::with_capacity(paths.len());
            for path in paths {
                let bytes = self.runtime.read_file(handle, path).await?;
                out.push((path.clone(), bytes));
            }
            Ok(out)
        })
        .await
    }

    pub async fn exec(
        &self,
        handle: &SandboxHandle,
        request: &ExecRequest,
    ) -> Result<RawExecution, SandboxError> {
        self.ensure_live(handle)?;
        self.runtime.exec(handle, request).await
    }

    pub async fn kill_all(&self, handle: &SandboxHandle) -> Result<(), SandboxError> {
        self.runtime.kill_all(handle).await
    }

    /// Cleans up sandboxes orphaned by an earlier crash
    pub async fn sweep_stale(&self) -> Result<usize, SandboxError> {
        self.runtime.sweep_stale().await
    }

    fn ensure_live(&self, handle: &SandboxHandle) -> Result<(), SandboxError> {
        if handle.is_released() {
            return Err(SandboxError::Released(handle.id().to_string()));
        }
        Ok(())
    }

    async fn with_io_timeout<T>(
        &self,
        fut: impl Future<Output = Result<T, SandboxError>>,
    ) -> Result<T, SandboxError> {
        match tokio::time::timeout(self.io_timeout, fut).await {
            Ok(res) => res,
            Err(_) => Err(SandboxError::IoTimeout(self.io_timeout.as_millis() as u64)),
        }
    }
}

/// A sandbox bound to the pool slot it occupies
///
/// `release` is the normal exit. If a lease is dropped without it (panic,
/// cancelled future) the drop hook releases the sandbox in the background,
/// and the slot is freed only once that release has finished.
pub struct SandboxLease {
    adapter: Arc<SandboxAdapter>,
    handle: Option<Arc<SandboxHandle>>,
    permit: Option<OwnedSemaphorePermit>,
}

impl SandboxLease {
    pub async fn acquire(
        adapter: Arc<SandboxAdapter>,
        limits: &SandboxLimits,
        permit: OwnedSemaphorePermit,
    ) -> Result<Self, SandboxError> {
        // On failure the permit is dropped here, freeing the slot
        let handle = adapter.acquire(limits).await?;
        Ok(Self {
            adapter,
            handle: Some(Arc::new(handle)),
            permit: Some(permit),
        })
    }

    pub fn handle(&self) -> Arc<SandboxHandle> {
        match &self.handle {
            Some(handle) => handle.clone(),
            None => unreachable!("lease used after release"),
        }
    }

    pub async fn release(mut self) -> Result<(), SandboxError> {
        let handle = self.handle.take();
        let permit = self.permit.take();
        let res = match handle {
            Some(handle) => self.adapter.release(&handle).await,
            None => Ok(()),
        };
        drop(permit);
        res
    }
}

impl Drop for SandboxLease {
    fn drop(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        let permit = self.permit.take();
        let adapter = self.adapter.clone();

        log::warn!("Sandbox {} dropped without release, releasing", handle.id());
        match tokio::runtime::Handle::try_current() {
            Ok(rt) => {
                rt.spawn(async move {
                    if let Err(e) = adapter.release(&handle).await {
                        log::error!("Background release of sandbox {} failed: {e}", handle.id());
                    }
                    drop(permit);
                });
            }
            Err(_) => {
                log::error!(
                    "Sandbox {} dropped outside of a runtime and could not be released",
                    handle.id()
                );
            }
        }
    }
}

/// Creates the sandbox runtime selected by configuration
///
/// `auto` picks `isolate` when the binary is installed and falls back to the
/// process runtime, which provides no security isolation.
pub fn create_sandbox_runtime(config: &SandboxConfig) -> Result<Arc<dyn SandboxRuntime>> {
    let backend = match config.backend {
        SandboxBackend::Auto => {
            let has_isolate = std::process::Command::new("which")
                .arg("isolate")
                .output()
                .map(|output| output.status.success())
                .unwrap_or(false);
            if has_isolate {
                SandboxBackend::Isolate
            } else {
                SandboxBackend::Process
            }
        }
        other => other,
    };

    match backend {
        SandboxBackend::Isolate => {
            log::info!("Using isolate sandbox runtime ({} boxes)", config.box_count);
            Ok(Arc::new(IsolateRuntime::build(config)?))
        }
        _ => {
            log::info!("Using process sandbox runtime");
            Ok(Arc::new(ProcessRuntime::build(config)?))
        }
    }
}
