use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::SandboxError;

use super::{SandboxHandle, SandboxLimits};

/// Trait for the host isolation mechanisms a sandbox can be built on
///
/// A runtime only knows how to create, drive and destroy one isolated
/// environment. Retries, idempotent release and leak verification live in
/// [`super::SandboxAdapter`], which every caller goes through.
#[async_trait]
pub trait SandboxRuntime: Send + Sync {
    /// Short name used in logs
    fn name(&self) -> &'static str;

    /// Creates one isolated environment; a single attempt, no retries
    async fn create(&self, limits: &SandboxLimits) -> Result<SandboxHandle, SandboxError>;

    /// Hard-kills everything in the sandbox and removes it
    async fn destroy(&self, handle: &SandboxHandle) -> Result<(), SandboxError>;

    /// Pids of live processes that originated in the sandbox
    async fn surviving_processes(&self, handle: &SandboxHandle) -> Result<Vec<u32>, SandboxError>;

    /// Runs a command with already-effective limits and captures its output
    async fn exec(
        &self,
        handle: &SandboxHandle,
        request: &ExecRequest,
    ) -> Result<RawExecution, SandboxError>;

    /// Kills every process in the sandbox without destroying it
    async fn kill_all(&self, handle: &SandboxHandle) -> Result<(), SandboxError>;

    /// Removes environments left behind by a previous crash; returns how many
    async fn sweep_stale(&self) -> Result<usize, SandboxError>;

    /// Writes a file below the sandbox root, creating parent directories
    async fn write_file(
        &self,
        handle: &SandboxHandle,
        path: &str,
        content: &[u8],
    ) -> Result<(), SandboxError> {
        let target = handle.host_path(path)?;
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&target, content).await?;
        Ok(())
    }

    /// Reads a file below the sandbox root
    async fn read_file(&self, handle: &SandboxHandle, path: &str) -> Result<Vec<u8>, SandboxError> {
        let target = handle.host_path(path)?;
        match tokio::fs::read(&target).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(SandboxError::NotFound {
                sandbox: handle.id().to_string(),
                path: path.to_string(),
            }),
            Err(e) => Err(e.into()),
        }
    }
}

/// A command to run inside a sandbox
#[derive(Debug, Clone)]
pub struct ExecRequest {
    pub argv: Vec<String>,
    /// Relative to the sandbox root
    pub working_dir: Option<String>,
    pub stdin: Option<Vec<u8>>,
    pub env: Vec<(String, String)>,
    /// Sandbox limits with the step's limits already layered in
    pub limits: SandboxLimits,
}

/// Output of a stream, cut at the byte cap
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Captured {
    pub bytes: Vec<u8>,
    pub truncated: bool,
}

impl Captured {
    /// Cuts already captured bytes down to `cap`
    pub fn capped(mut self, cap: usize) -> Self {
        if self.bytes.len() > cap {
            self.bytes.truncate(cap);
            self.truncated = true;
        }
        self
    }

    pub fn to_string_lossy(&self) -> String {
        String::from_utf8_lossy(&self.bytes).into_owned()
    }
}

/// What the backend observed; normalized into a `CommandResult` by the executor
#[derive(Debug, Clone, Default)]
pub struct RawExecution {
    pub exit_code: Option<i32>,
    pub signal: Option<i32>,
    pub stdout: Captured,
    pub stderr: Captured,
    pub wall_time: Duration,
    pub timed_out: bool,
    pub resource_killed: bool,
}

/// Reads a stream to its end, keeping at most `cap` bytes
///
/// Excess bytes are drained and dropped so the writer never blocks on a full
/// pipe.
pub async fn read_capped<R>(mut reader: R, cap: usize) -> std::io::Result<Captured>
where
    R: AsyncRead + Unpin,
{
    let mut bytes = Vec::with_capacity(cap.min(64 * 1024));
    let mut chunk = [0u8; 8192];
    let mut truncated = false;

    loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        let room = cap.saturating_sub(bytes.len());
        if n > room {
            truncated = true;
        }
        bytes.extend_from_slice(&chunk[..n.min(room)]);
    }

    Ok(Captured { bytes, truncated })
}

/// Reads a file produced inside the sandbox, keeping at most `cap` bytes
pub async fn read_file_capped(path: &Path, cap: usize) -> std::io::Result<Captured> {
    match tokio::fs::File::open(path).await {
        Ok(file) => read_capped(file, cap).await,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Captured::default()),
        Err(e) => Err(e),
    }
}
