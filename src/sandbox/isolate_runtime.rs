use std::collections::{HashSet, VecDeque};
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::process::Command;

use crate::config::SandboxConfig;
use crate::error::SandboxError;

use super::procfs;
use super::runtime::{Captured, ExecRequest, RawExecution, SandboxRuntime, read_file_capped};
use super::{SandboxHandle, SandboxLimits};

// Must match `first_uid` in isolate's configuration
const ISOLATE_FIRST_UID: u32 = 60000;
const RUNTIME_OPEN_FILES: u32 = 64;
const RUNTIME_FILE_SIZE_KB: u64 = 65536;
const DEFAULT_PATH: &str = "PATH=/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

// Sandbox cache directory permissions
const CACHE_DIR_PERMISSIONS: u32 = 0o700;

/// A runtime backed by the `isolate` CLI with control groups
///
/// Box ids are leased from `0..box_count`. A box whose teardown leaves
/// processes behind is quarantined and never handed out again.
pub struct IsolateRuntime {
    box_count: u32,
    free_boxes: Mutex<VecDeque<u32>>,
    in_use: Mutex<HashSet<u32>>,
    /// Host directory for meta files, outside every box
    meta_dir: PathBuf,
    counter: AtomicU64,
}

impl IsolateRuntime {
    pub fn build(config: &SandboxConfig) -> Result<Self> {
        let meta_dir = Self::setup_cache_directory()?;
        log::info!("IsolateRuntime initialized with {} boxes", config.box_count);
        Ok(Self {
            box_count: config.box_count,
            free_boxes: Mutex::new((0..config.box_count).collect()),
            in_use: Mutex::new(HashSet::new()),
            meta_dir,
            counter: AtomicU64::new(0),
        })
    }

    fn setup_cache_directory() -> Result<PathBuf> {
        let proj_dirs = directories::ProjectDirs::from("", "", "autograder")
            .ok_or_else(|| anyhow!("Unable to find user directory"))?;

        let cache_dir = proj_dirs.cache_dir().join("isolate");
        fs::create_dir_all(&cache_dir)?;
        fs::set_permissions(&cache_dir, fs::Permissions::from_mode(CACHE_DIR_PERMISSIONS))?;
        Ok(cache_dir)
    }

    fn box_id(handle: &SandboxHandle) -> Result<u32, SandboxError> {
        handle
            .box_id()
            .ok_or_else(|| SandboxError::Backend(format!("{} is not an isolate box", handle.id())))
    }

    fn box_uid(box_id: u32) -> u32 {
        ISOLATE_FIRST_UID + box_id
    }

    async fn init_box(box_id: u32) -> Result<PathBuf, SandboxError> {
        let output = Command::new("isolate")
            .args(["-b", &box_id.to_string(), "--cg", "--init"])
            .output()
            .await
            .map_err(|e| SandboxError::Provisioning(format!("failed to spawn isolate --init: {e}")))?;

        if !output.status.success() {
            return Err(SandboxError::Provisioning(format!(
                "isolate --init on box {box_id} failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        let root_dir = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if root_dir.is_empty() {
            return Err(SandboxError::Provisioning(format!(
                "isolate --init on box {box_id} produced empty stdout"
            )));
        }
        Ok(PathBuf::from(root_dir).join("box"))
    }

    async fn cleanup_box(box_id: u32) -> Result<(), SandboxError> {
        let output = Command::new("isolate")
            .args(["-b", &box_id.to_string(), "--cg", "--cleanup"])
            .output()
            .await?;
        if output.status.success() {
            Ok(())
        } else {
            Err(SandboxError::Backend(format!(
                "isolate --cleanup on box {box_id} failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )))
        }
    }

    fn run_args(box_id: u32, request: &ExecRequest, files: &RunFiles) -> Vec<String> {
        let limits = &request.limits;
        let cpu = limits.cpu_time.0 as f64 / 1000.0;
        let wall = limits.wall_time.0 as f64 / 1000.0;

        let mut args = vec![
            "-b".to_string(),
            box_id.to_string(),
            "--cg".to_string(),
            "--run".to_string(),
            format!("--time={cpu:.3}"),
            format!("--wall-time={wall:.3}"),
            format!("--cg-mem={}", limits.memory.kib()),
            format!("--processes={}", limits.processes),
            format!("--open-files={RUNTIME_OPEN_FILES}"),
            format!("--fsize={}", RUNTIME_FILE_SIZE_KB.max(limits.output.kib())),
            "-M".to_string(),
            files.meta.to_string_lossy().into_owned(),
            "-o".to_string(),
            files.inner_stdout.clone(),
            "-r".to_string(),
            files.inner_stderr.clone(),
            "-E".to_string(),
            DEFAULT_PATH.to_string(),
            "--silent".to_string(),
        ];
        if let Some(stdin) = &files.inner_stdin {
            args.push("-i".to_string());
            args.push(stdin.clone());
        }
        if let Some(dir) = &request.working_dir {
            args.push(format!("--chdir=/box/{dir}"));
        }
        if limits.network {
            args.push("--share-net".to_string());
        }
        for (key, value) in &request.env {
            args.push("-E".to_string());
            args.push(format!("{key}={value}"));
        }
        args.push("--".to_string());
        args.extend(request.argv.iter().cloned());
        args
    }
}

/// Per-run file names; output files live in the box, meta outside of it
struct RunFiles {
    meta: PathBuf,
    inner_stdin: Option<String>,
    inner_stdout: String,
    inner_stderr: String,
    host_files: Vec<PathBuf>,
}

impl RunFiles {
    fn new(meta_dir: &Path, root: &Path, box_id: u32, n: u64, has_stdin: bool) -> Self {
        let name = |stream: &str| format!(".grader-{n}.{stream}");
        let inner_stdin = has_stdin.then(|| format!("/box/{}", name("stdin")));
        let mut host_files = vec![root.join(name("stdout")), root.join(name("stderr"))];
        if has_stdin {
            host_files.push(root.join(name("stdin")));
        }
        Self {
            meta: meta_dir.join(format!("{box_id}-{n}.meta")),
            inner_stdin,
            inner_stdout: format!("/box/{}", name("stdout")),
            inner_stderr: format!("/box/{}", name("stderr")),
            host_files,
        }
    }

    fn host_stdout(&self) -> &Path {
        &self.host_files[0]
    }

    fn host_stderr(&self) -> &Path {
        &self.host_files[1]
    }

    fn host_stdin(&self) -> Option<&Path> {
        self.host_files.get(2).map(PathBuf::as_path)
    }

    async fn remove(&self) {
        for path in self.host_files.iter().chain(std::iter::once(&self.meta)) {
            let _ = tokio::fs::remove_file(path).await;
        }
    }
}

#[async_trait]
impl SandboxRuntime for IsolateRuntime {
    fn name(&self) -> &'static str {
        "isolate"
    }

    async fn create(&self, limits: &SandboxLimits) -> Result<SandboxHandle, SandboxError> {
        let Some(box_id) = self.free_boxes.lock().pop_front() else {
            return Err(SandboxError::Provisioning(format!(
                "all {} isolate boxes are in use",
                self.box_count
            )));
        };

        match Self::init_box(box_id).await {
            Ok(root) => {
                self.in_use.lock().insert(box_id);
                Ok(SandboxHandle::new(
                    format!("isolate-{box_id}"),
                    root,
                    Some(box_id),
                    *limits,
                ))
            }
            Err(e) => {
                self.free_boxes.lock().push_back(box_id);
                Err(e)
            }
        }
    }

    async fn destroy(&self, handle: &SandboxHandle) -> Result<(), SandboxError> {
        let box_id = Self::box_id(handle)?;
        self.kill_all(handle).await?;
        Self::cleanup_box(box_id).await
    }

    async fn surviving_processes(&self, handle: &SandboxHandle) -> Result<Vec<u32>, SandboxError> {
        let box_id = Self::box_id(handle)?;
        let survivors = procfs::live_owned_by(Self::box_uid(box_id))?;
        if survivors.is_empty() {
            if self.in_use.lock().remove(&box_id) {
                self.free_boxes.lock().push_back(box_id);
            }
        } else {
            log::error!("Isolate box {box_id} quarantined");
        }
        Ok(survivors)
    }

    async fn exec(
        &self,
        handle: &SandboxHandle,
        request: &ExecRequest,
    ) -> Result<RawExecution, SandboxError> {
        if request.argv.is_empty() {
            return Err(SandboxError::Backend("empty command".to_string()));
        }
        let box_id = Self::box_id(handle)?;
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        let files = RunFiles::new(
            &self.meta_dir,
            handle.root(),
            box_id,
            n,
            request.stdin.is_some(),
        );

        if let (Some(path), Some(input)) = (files.host_stdin(), &request.stdin) {
            tokio::fs::write(path, input).await?;
        }

        let args = Self::run_args(box_id, request, &files);
        let start = Instant::now();
        let output = Command::new("isolate")
            .args(&args)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| SandboxError::Backend(format!("failed to spawn isolate --run: {e}")))?;
        let elapsed = start.elapsed();

        let meta = match tokio::fs::read_to_string(&files.meta).await {
            Ok(content) => Meta::parse(&content),
            Err(e) => {
                files.remove().await;
                return Err(SandboxError::Backend(format!(
                    "failed to read meta file ({e}); isolate said: {}",
                    String::from_utf8_lossy(&output.stderr).trim()
                )));
            }
        };
        if meta.status.as_deref() == Some("XX") {
            files.remove().await;
            return Err(SandboxError::Backend(format!(
                "isolate internal error: {}",
                meta.message.unwrap_or_default()
            )));
        }

        let cap = request.limits.output.0 as usize;
        let stdout = read_file_capped(files.host_stdout(), cap).await?;
        let stderr = read_file_capped(files.host_stderr(), cap).await?;
        files.remove().await;

        Ok(meta.into_raw(stdout, stderr, elapsed))
    }

    async fn kill_all(&self, handle: &SandboxHandle) -> Result<(), SandboxError> {
        let box_id = Self::box_id(handle)?;
        for pid in procfs::live_owned_by(Self::box_uid(box_id))? {
            // SAFETY: plain syscall; ESRCH for a vanished pid is expected.
            unsafe {
                libc::kill(pid as i32, libc::SIGKILL);
            }
        }
        Ok(())
    }

    async fn sweep_stale(&self) -> Result<usize, SandboxError> {
        let mut cleaned = 0;
        for box_id in 0..self.box_count {
            match Self::cleanup_box(box_id).await {
                Ok(()) => cleaned += 1,
                Err(e) => log::warn!("{e}"),
            }
        }
        Ok(cleaned)
    }
}

/// The parts of an isolate meta file the executor needs
#[derive(Debug, Default, PartialEq)]
struct Meta {
    status: Option<String>,
    message: Option<String>,
    exit_code: Option<i32>,
    exit_signal: Option<i32>,
    killed: bool,
    oom_killed: bool,
    wall_time: Option<Duration>,
}

impl Meta {
    fn parse(content: &str) -> Self {
        let mut meta = Meta::default();
        for line in content.lines() {
            if let Some((key, value)) = line.split_once(':') {
                match key {
                    "status" => meta.status = Some(value.to_string()),
                    "message" => meta.message = Some(value.to_string()),
                    "exitcode" => meta.exit_code = value.parse().ok(),
                    "exitsig" => meta.exit_signal = value.parse().ok(),
                    "killed" => meta.killed = value == "1",
                    "cg-oom-killed" => meta.oom_killed = value == "1",
                    "time-wall" => {
                        meta.wall_time = value.parse::<f64>().ok().map(Duration::from_secs_f64)
                    }
                    _ => {}
                }
            }
        }
        meta
    }

    fn into_raw(self, stdout: Captured, stderr: Captured, elapsed: Duration) -> RawExecution {
        let time_limit_hit = self.status.as_deref() == Some("TO");
        // isolate words a wall clock overrun as "Time limit exceeded (wall clock)"
        let wall_clock = self
            .message
            .as_deref()
            .is_some_and(|m| m.contains("wall clock"));

        let timed_out = time_limit_hit && wall_clock;
        // A clean exit has no exitcode line at all
        let exit_code = if self.killed || self.exit_signal.is_some() {
            self.exit_code
        } else {
            Some(self.exit_code.unwrap_or(0))
        };
        let resource_killed = self.oom_killed || (time_limit_hit && !wall_clock);

        RawExecution {
            exit_code,
            signal: self.exit_signal,
            stdout,
            stderr,
            wall_time: self.wall_time.unwrap_or(elapsed),
            timed_out,
            resource_killed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_meta_exit_code() {
        let meta = Meta::parse("time:0.002\ntime-wall:0.010\nmax-rss:1400\nexitcode:3\nstatus:RE\nmessage:Exited with error status 3\n");
        let raw = meta.into_raw(Captured::default(), Captured::default(), Duration::ZERO);
        assert_eq!(raw.exit_code, Some(3));
        assert_eq!(raw.wall_time, Duration::from_millis(10));
        assert!(!raw.timed_out);
        assert!(!raw.resource_killed);
    }

    #[test]
    fn test_meta_clean_exit_has_no_exitcode_line() {
        let raw = Meta::parse("time:0.001\ntime-wall:0.004\n").into_raw(
            Captured::default(),
            Captured::default(),
            Duration::ZERO,
        );
        assert_eq!(raw.exit_code, Some(0));
    }

    #[test]
    fn test_meta_wall_clock_timeout() {
        let raw = Meta::parse("status:TO\nmessage:Time limit exceeded (wall clock)\nkilled:1\ntime-wall:2.001\n")
            .into_raw(Captured::default(), Captured::default(), Duration::ZERO);
        assert!(raw.timed_out);
        assert!(!raw.resource_killed);
        assert_eq!(raw.exit_code, None);
    }

    #[test]
    fn test_meta_cpu_timeout_and_oom_are_resource_kills() {
        let cpu = Meta::parse("status:TO\nmessage:Time limit exceeded\nkilled:1\n")
            .into_raw(Captured::default(), Captured::default(), Duration::ZERO);
        assert!(cpu.resource_killed);
        assert!(!cpu.timed_out);

        let oom = Meta::parse("status:SG\nexitsig:9\ncg-oom-killed:1\nkilled:1\n")
            .into_raw(Captured::default(), Captured::default(), Duration::ZERO);
        assert!(oom.resource_killed);
        assert_eq!(oom.signal, Some(9));
        assert_eq!(oom.exit_code, None);
    }

    #[test]
    fn test_run_args_layout() {
        let request = ExecRequest {
            argv: vec!["./main".to_string(), "--fast".to_string()],
            working_dir: Some("build".to_string()),
            stdin: Some(b"1 2".to_vec()),
            env: vec![("LANG".to_string(), "C".to_string())],
            limits: SandboxLimits::default(),
        };
        let files = RunFiles::new(Path::new("/meta"), Path::new("/var/box/3/box"), 3, 7, true);
        let args = IsolateRuntime::run_args(3, &request, &files);

        assert_eq!(&args[..4], &["-b", "3", "--cg", "--run"]);
        assert!(args.contains(&"--wall-time=30.000".to_string()));
        assert!(args.contains(&"--cg-mem=524288".to_string()));
        assert!(args.contains(&"--chdir=/box/build".to_string()));
        assert!(args.contains(&"/box/.grader-7.stdin".to_string()));
        assert!(args.contains(&"LANG=C".to_string()));
        assert!(!args.contains(&"--share-net".to_string()));
        assert_eq!(&args[args.len() - 3..], &["--", "./main", "--fast"]);
        assert_eq!(files.host_stdout(), Path::new("/var/box/3/box/.grader-7.stdout"));
    }
}
