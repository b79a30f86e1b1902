use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub inputs: InputConfig,
    pub registry: RegistryConfig,
    #[serde(default)]
    pub spooler: SpoolerConfig,
    pub output: OutputConfig,
    #[serde(default)]
    pub shutdown: ShutdownConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputConfig {
    /// Glob patterns of files to harvest
    pub paths: Vec<String>,
    /// Glob patterns removed from the matched set
    #[serde(default)]
    pub exclude: Vec<String>,
    #[serde(with = "humantime_serde", default = "default_scan_interval")]
    pub scan_interval: Duration,
    #[serde(with = "humantime_serde", default = "default_eof_poll_interval")]
    pub eof_poll_interval: Duration,
    /// Start first-seen files at their current end instead of offset 0
    #[serde(default)]
    pub tail_from_end: bool,
    #[serde(default = "default_max_line_bytes")]
    pub max_line_bytes: usize,
    /// No default: operators must choose how over-long lines are handled
    pub on_long_line: LongLinePolicy,
}

fn default_scan_interval() -> Duration {
    Duration::from_secs(10)
}

fn default_eof_poll_interval() -> Duration {
    Duration::from_millis(250)
}

fn default_max_line_bytes() -> usize {
    1024 * 1024
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LongLinePolicy {
    /// Emit consecutive events of at most `max_line_bytes` each
    Split,
    /// Emit the first `max_line_bytes` flagged as truncated, skip the rest
    Truncate,
    /// Skip the whole line
    Drop,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    pub path: PathBuf,
    #[serde(with = "humantime_serde", default = "default_flush_interval")]
    pub flush_interval: Duration,
    /// Entries for files not seen for this long are pruned
    #[serde(with = "humantime_serde", default = "default_clean_inactive")]
    pub clean_inactive: Duration,
}

fn default_flush_interval() -> Duration {
    Duration::from_secs(5)
}

fn default_clean_inactive() -> Duration {
    Duration::from_secs(72 * 3600)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpoolerConfig {
    #[serde(default = "default_capacity")]
    pub capacity: usize,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(with = "humantime_serde", default = "default_batch_timeout")]
    pub batch_timeout: Duration,
}

impl Default for SpoolerConfig {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
            batch_size: default_batch_size(),
            batch_timeout: default_batch_timeout(),
        }
    }
}

fn default_capacity() -> usize {
    4096
}

fn default_batch_size() -> usize {
    256
}

fn default_batch_timeout() -> Duration {
    Duration::from_millis(100)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputConfig {
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub format: WireFormat,
    #[serde(default = "default_log_type")]
    pub log_type: String,
    #[serde(default = "default_max_datagram_bytes")]
    pub max_datagram_bytes: usize,
    #[serde(default = "default_oversize_policy")]
    pub on_oversize: OversizePolicy,
    #[serde(default)]
    pub retry: RetryConfig,
}

impl OutputConfig {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn default_log_type() -> String {
    "log".to_string()
}

fn default_max_datagram_bytes() -> usize {
    1024
}

fn default_oversize_policy() -> OversizePolicy {
    OversizePolicy::Truncate
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WireFormat {
    /// One JSON document per datagram
    #[default]
    Json,
    /// `json:<type>:<document>`, as parsed by udplogbeat collectors
    Udplogbeat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OversizePolicy {
    Truncate,
    Split,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(with = "humantime_serde", default = "default_initial_backoff")]
    pub initial_backoff: Duration,
    #[serde(with = "humantime_serde", default = "default_max_backoff")]
    pub max_backoff: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_backoff: default_initial_backoff(),
            max_backoff: default_max_backoff(),
        }
    }
}

fn default_max_retries() -> u32 {
    3
}

fn default_initial_backoff() -> Duration {
    Duration::from_millis(50)
}

fn default_max_backoff() -> Duration {
    Duration::from_secs(2)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShutdownConfig {
    #[serde(with = "humantime_serde", default = "default_grace_period")]
    pub grace_period: Duration,
    /// File that exists while the agent is running, for external health checks
    #[serde(default)]
    pub running_marker: Option<PathBuf>,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            grace_period: default_grace_period(),
            running_marker: None,
        }
    }
}

fn default_grace_period() -> Duration {
    Duration::from_secs(5)
}
