use std::time::Duration;

use clap::Parser;
use serde::{Deserialize, Serialize};

#[derive(Parser)]
#[command(name = "autograder", version = "1.0", about, long_about = None)]
pub struct CliArgs {
    /// Path to the configuration file
    #[arg(long = "config", short = 'c')]
    pub config_path: String,

    /// Whether to flush the existing database
    #[arg(long = "flush-data", short = 'f', default_value_t = false)]
    pub flush_data: bool,

    /// Override the sandbox backend from the configuration file
    #[arg(long = "backend", short = 'b', value_enum)]
    pub backend: Option<SandboxBackend>,
}

impl CliArgs {
    /// Load the configuration from the specified file
    pub fn to_config(&self) -> std::io::Result<Config> {
        let file = std::fs::File::open(&self.config_path)?;
        let reader = std::io::BufReader::new(file);
        let mut config: Config = serde_json::from_reader(reader)?;
        if let Some(backend) = self.backend {
            config.sandbox.backend = backend;
        }
        config
            .validate()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        Ok(config)
    }
}

#[derive(Deserialize, Debug, Clone)]
pub struct Config {
    pub server: ServerConfig,
    #[serde(default)]
    pub sandbox: SandboxConfig,
    pub pools: Vec<PoolConfig>,
    #[serde(default)]
    pub aggregator: AggregatorConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
}

impl Config {
    /// Rejects pool layouts the scheduler cannot serve
    pub fn validate(&self) -> Result<(), String> {
        if self.pools.is_empty() {
            return Err("at least one resource pool must be configured".to_string());
        }
        for (i, pool) in self.pools.iter().enumerate() {
            if pool.name.is_empty() {
                return Err(format!("pool #{i} has an empty name"));
            }
            if pool.slots == 0 {
                return Err(format!("pool {} must have at least one slot", pool.name));
            }
            if self.pools[..i].iter().any(|p| p.name == pool.name) {
                return Err(format!("pool {} is configured twice", pool.name));
            }
        }
        if self.sandbox.acquire_attempts == 0 {
            return Err("sandbox.acquire_attempts must not be 0".to_string());
        }
        if self.aggregator.persist_attempts == 0 {
            return Err("aggregator.persist_attempts must not be 0".to_string());
        }
        Ok(())
    }
}

#[derive(Deserialize, Debug, Clone)]
pub struct ServerConfig {
    pub bind_address: Option<String>,
    pub bind_port: Option<u16>,
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum SandboxBackend {
    /// `isolate` if it is installed, the process backend otherwise
    Auto,
    Isolate,
    Process,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct SandboxConfig {
    pub backend: SandboxBackend,
    /// Attempts made by `acquire` before giving up with a provisioning error
    pub acquire_attempts: u32,
    /// Base delay of the exponential backoff between acquire attempts
    pub acquire_backoff: MilliSecond,
    /// Upper bound for copying files into or out of a sandbox
    pub io_timeout: MilliSecond,
    /// Extra time the executor watchdog grants a backend before killing it
    pub watchdog_grace: MilliSecond,
    /// Number of isolate boxes this daemon may use
    pub box_count: u32,
    /// Root of the process backend's working directories
    pub work_root: Option<String>,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            backend: SandboxBackend::Auto,
            acquire_attempts: 3,
            acquire_backoff: MilliSecond(200),
            io_timeout: MilliSecond(10_000),
            watchdog_grace: MilliSecond(500),
            box_count: 64,
            work_root: None,
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
pub struct PoolConfig {
    pub name: String,
    pub slots: usize,
    /// Longest time a ticket may wait for a slot before it is failed
    #[serde(default = "default_queue_wait_timeout")]
    pub queue_wait_timeout: MilliSecond,
}

fn default_queue_wait_timeout() -> MilliSecond {
    MilliSecond(30 * 60 * 1000)
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct AggregatorConfig {
    /// Additional attempts after an infrastructure error
    pub max_infrastructure_retries: u32,
    /// Tries at persisting one result before giving up on it
    pub persist_attempts: u32,
    /// Base delay of the exponential backoff between persist tries
    pub persist_backoff: MilliSecond,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            max_infrastructure_retries: 2,
            persist_attempts: 5,
            persist_backoff: MilliSecond(100),
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct SchedulerConfig {
    /// How long a finished ticket stays visible to status queries
    pub ticket_retention: MilliSecond,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            ticket_retention: MilliSecond(60 * 60 * 1000),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MilliSecond(pub u64);

impl From<MilliSecond> for Duration {
    fn from(value: MilliSecond) -> Self {
        Duration::from_millis(value.0)
    }
}

impl From<Duration> for MilliSecond {
    fn from(value: Duration) -> Self {
        MilliSecond(value.as_millis() as u64)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ByteSize(pub u64);

impl ByteSize {
    pub fn kib(self) -> u64 {
        self.0.div_ceil(1024)
    }
}
