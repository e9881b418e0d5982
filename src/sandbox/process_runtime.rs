use std::collections::HashMap;
use std::io;
use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::config::SandboxConfig;
use crate::error::SandboxError;

use super::procfs;
use super::runtime::{Captured, ExecRequest, RawExecution, SandboxRuntime, read_capped};
use super::{SandboxHandle, SandboxLimits};

const DEFAULT_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";
const FILE_SIZE_LIMIT: u64 = 64 * 1024 * 1024;
/// How long output pipes may stay open after the command's group was killed
const PIPE_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);
const DIR_PREFIX: &str = "proc-";

/// A runtime that runs commands as plain child processes
///
/// Every command gets its own process group and `setrlimit` CPU, address
/// space and file size limits. There is no filesystem, network or user
/// isolation: this runtime is meant for development and testing only.
pub struct ProcessRuntime {
    work_root: PathBuf,
    counter: AtomicU64,
    /// Process groups of each live sandbox that may still have members
    groups: Mutex<HashMap<String, Vec<i32>>>,
}

impl ProcessRuntime {
    pub fn build(config: &SandboxConfig) -> Result<Self> {
        let work_root = match &config.work_root {
            Some(path) => PathBuf::from(path),
            None => {
                let proj_dirs = directories::ProjectDirs::from("", "", "autograder")
                    .ok_or_else(|| anyhow!("Unable to find user directory"))?;
                proj_dirs.cache_dir().join("process")
            }
        };
        std::fs::create_dir_all(&work_root)?;

        log::warn!("ProcessRuntime provides NO security isolation - use only in trusted environments");
        log::warn!("ProcessRuntime cannot disable network access or bound process counts");

        Ok(Self::with_work_root(work_root))
    }

    pub fn with_work_root(work_root: PathBuf) -> Self {
        Self {
            work_root,
            counter: AtomicU64::new(0),
            groups: Mutex::new(HashMap::new()),
        }
    }

    fn kill_groups(&self, handle: &SandboxHandle) {
        let groups = self
            .groups
            .lock()
            .get(handle.id())
            .cloned()
            .unwrap_or_default();
        for pgid in groups {
            kill_group(pgid);
        }
    }

    /// Stops tracking a group with no live members, since the kernel may
    /// hand its id to an unrelated process later
    fn forget_exited_group(&self, handle: &SandboxHandle, pgid: i32) {
        match procfs::live_in_groups(&[pgid]) {
            Ok(live) if live.is_empty() => {
                if let Some(groups) = self.groups.lock().get_mut(handle.id()) {
                    groups.retain(|g| *g != pgid);
                }
            }
            Ok(_) => {}
            Err(e) => log::warn!("Failed to scan process group {pgid}: {e}"),
        }
    }
}

#[async_trait]
impl SandboxRuntime for ProcessRuntime {
    fn name(&self) -> &'static str {
        "process"
    }

    async fn create(&self, limits: &SandboxLimits) -> Result<SandboxHandle, SandboxError> {
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        let id = format!("{DIR_PREFIX}{}-{n}", std::process::id());
        let root = self.work_root.join(&id);

        tokio::fs::create_dir_all(&root)
            .await
            .map_err(|e| SandboxError::Provisioning(format!("{}: {e}", root.display())))?;
        self.groups.lock().insert(id.clone(), Vec::new());

        Ok(SandboxHandle::new(id, root, None, *limits))
    }

    async fn destroy(&self, handle: &SandboxHandle) -> Result<(), SandboxError> {
        self.kill_groups(handle);
        match tokio::fs::remove_dir_all(handle.root()).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn surviving_processes(&self, handle: &SandboxHandle) -> Result<Vec<u32>, SandboxError> {
        let groups = self
            .groups
            .lock()
            .get(handle.id())
            .cloned()
            .unwrap_or_default();
        let survivors = if groups.is_empty() {
            Vec::new()
        } else {
            procfs::live_in_groups(&groups)?
        };
        if survivors.is_empty() {
            self.groups.lock().remove(handle.id());
        }
        Ok(survivors)
    }

    async fn exec(
        &self,
        handle: &SandboxHandle,
        request: &ExecRequest,
    ) -> Result<RawExecution, SandboxError> {
        let Some((program, args)) = request.argv.split_first() else {
            return Err(SandboxError::Backend("empty command".to_string()));
        };
        let cwd = match &request.working_dir {
            Some(dir) => handle.host_path(dir)?,
            None => handle.root().to_path_buf(),
        };
        let limits = request.limits;
        let cap = limits.output.0 as usize;

        let mut cmd = Command::new(program);
        cmd.args(args)
            .current_dir(&cwd)
            .env_clear()
            .env("PATH", DEFAULT_PATH)
            .env("HOME", handle.root())
            .envs(request.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(if request.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true);

        let cpu_secs = limits.cpu_time.0.div_ceil(1000).max(1);
        let memory = limits.memory.0;
        // SAFETY: the closure only calls setrlimit, which is async-signal-safe.
        unsafe {
            cmd.pre_exec(move || {
                set_limits(cpu_secs, memory)?;
                Ok(())
            });
        }

        let start = Instant::now();
        let mut child = match cmd.spawn() {
            Ok(child) => child,
            // The program is the student's business: report it like a shell would
            Err(e) if matches!(e.kind(), io::ErrorKind::NotFound | io::ErrorKind::PermissionDenied) => {
                return Ok(RawExecution {
                    exit_code: Some(127),
                    stderr: Captured {
                        bytes: format!("{program}: {e}\n").into_bytes(),
                        truncated: false,
                    }
                    .capped(cap),
                    wall_time: start.elapsed(),
                    ..Default::default()
                });
            }
            Err(e) => return Err(e.into()),
        };

        let Some(pgid) = child.id().map(|pid| pid as i32) else {
            return Err(SandboxError::Backend("child exited before it was tracked".to_string()));
        };
        if let Some(groups) = self.groups.lock().get_mut(handle.id()) {
            groups.push(pgid);
        }

        if let (Some(mut stdin), Some(input)) = (child.stdin.take(), request.stdin.clone()) {
            tokio::spawn(async move {
                // The command may exit without reading its input
                let _ = stdin.write_all(&input).await;
                let _ = stdin.shutdown().await;
            });
        }
        let stdout = child
            .stdout
            .take()
            .map(|out| tokio::spawn(read_capped(out, cap)));
        let stderr = child
            .stderr
            .take()
            .map(|err| tokio::spawn(read_capped(err, cap)));

        let wall: Duration = limits.wall_time.into();
        let (status, timed_out) = match tokio::time::timeout(wall, child.wait()).await {
            Ok(status) => (status?, false),
            Err(_) => {
                kill_group(pgid);
                (child.wait().await?, true)
            }
        };
        let wall_time = start.elapsed();
        // Background children must not outlive the command
        kill_group(pgid);

        let stdout = join_reader(stdout).await;
        let stderr = join_reader(stderr).await;
        self.forget_exited_group(handle, pgid);

        let signal = status.signal();
        let resource_killed = !timed_out
            && matches!(signal, Some(libc::SIGXCPU | libc::SIGXFSZ | libc::SIGKILL));

        Ok(RawExecution {
            exit_code: status.code(),
            signal,
            stdout,
            stderr,
            wall_time,
            timed_out,
            resource_killed,
        })
    }

    async fn kill_all(&self, handle: &SandboxHandle) -> Result<(), SandboxError> {
        self.kill_groups(handle);
        Ok(())
    }

    async fn sweep_stale(&self) -> Result<usize, SandboxError> {
        let own_prefix = format!("{DIR_PREFIX}{}-", std::process::id());
        let mut removed = 0;
        let mut entries = tokio::fs::read_dir(&self.work_root).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if !name.starts_with(DIR_PREFIX) || name.starts_with(&own_prefix) {
                continue;
            }
            match tokio::fs::remove_dir_all(entry.path()).await {
                Ok(()) => removed += 1,
                Err(e) => log::warn!("Failed to remove stale sandbox {name}: {e}"),
            }
        }
        Ok(removed)
    }
}

fn kill_group(pgid: i32) {
    // SAFETY: plain syscall; ESRCH for a vanished group is expected.
    unsafe {
        libc::killpg(pgid, libc::SIGKILL);
    }
}

fn set_limits(cpu_secs: u64, memory: u64) -> io::Result<()> {
    let limit = |soft: u64, hard: u64| libc::rlimit {
        rlim_cur: soft as libc::rlim_t,
        rlim_max: hard as libc::rlim_t,
    };
    // SAFETY: setrlimit only reads the passed struct.
    unsafe {
        if libc::setrlimit(libc::RLIMIT_CPU, &limit(cpu_secs, cpu_secs + 1)) != 0 {
            return Err(io::Error::last_os_error());
        }
        if libc::setrlimit(libc::RLIMIT_AS, &limit(memory, memory)) != 0 {
            return Err(io::Error::last_os_error());
        }
        if libc::setrlimit(libc::RLIMIT_FSIZE, &limit(FILE_SIZE_LIMIT, FILE_SIZE_LIMIT)) != 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

async fn join_reader(reader: Option<tokio::task::JoinHandle<io::Result<Captured>>>) -> Captured {
    let Some(mut reader) = reader else {
        return Captured::default();
    };
    match tokio::time::timeout(PIPE_DRAIN_TIMEOUT, &mut reader).await {
        Ok(Ok(Ok(captured))) => captured,
        Ok(Ok(Err(e))) => {
            log::warn!("Failed to read command output: {e}");
            Captured::default()
        }
        Ok(Err(e)) => {
            log::warn!("Output reader task failed: {e}");
            Captured::default()
        }
        Err(_) => {
            // A process that left the group still holds the pipe
            reader.abort();
            log::warn!("Output pipe still open after the command exited");
            Captured::default()
        }
    }
}
