//! Configuration for stagecoach.
//!
//! Configuration sources (highest priority first):
//! 1. Environment variables (STAGECOACH_HOME, STAGECOACH_WORKFLOW,
//!    STAGECOACH_TEXT_ENDPOINT, STAGECOACH_BINARY_ENDPOINT)
//! 2. Config file (.stagecoach/config.yaml)
//! 3. Defaults (~/.stagecoach)
//!
//! Config file discovery:
//! - Searches current directory and parents for .stagecoach/config.yaml
//! - Paths in config file are relative to the .stagecoach/ directory
//!
//! The result is an immutable [`Settings`] value handed to constructors;
//! nothing reads configuration from global state.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::core::retry::RetryPolicy;

/// Raw config file schema (matches YAML structure)
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub journal: Option<bool>,
    #[serde(default)]
    pub store: StoreSettings,
    #[serde(default)]
    pub probe: ProbeSettings,
    #[serde(default)]
    pub execution: ExecutionSettings,
    #[serde(default)]
    pub checkpoint: CheckpointSettings,
    #[serde(default)]
    pub approval: ApprovalSettings,
    #[serde(default)]
    pub agents: BTreeMap<String, AgentSpec>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PathsConfig {
    /// Engine state directory (relative to config file)
    pub home: Option<String>,
    /// Workflow definition (relative to config file)
    pub workflow: Option<String>,
}

/// Which store the orchestrator persists to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreBackend {
    /// Remote durable store, transport chosen by the probe
    Remote,
    /// Process memory only (local dry runs)
    Memory,
}

impl Default for StoreBackend {
    fn default() -> Self {
        Self::Remote
    }
}

/// Durable store endpoints and per-call timeouts
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreSettings {
    #[serde(default)]
    pub backend: StoreBackend,

    /// host:port of the binary transport
    #[serde(default)]
    pub binary_endpoint: Option<String>,

    /// Service-discovery name that must resolve before the binary transport is tried
    #[serde(default)]
    pub discovery_host: Option<String>,

    /// Base URL of the HTTP/JSON transport
    #[serde(default)]
    pub text_endpoint: Option<String>,

    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

fn default_connect_timeout_ms() -> u64 {
    2000
}
fn default_request_timeout_ms() -> u64 {
    5000
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            binary_endpoint: None,
            discovery_host: None,
            text_endpoint: None,
            connect_timeout_ms: default_connect_timeout_ms(),
            request_timeout_ms: default_request_timeout_ms(),
        }
    }
}

impl StoreSettings {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// Transport probe budget, thresholds and cache lifetimes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeSettings {
    /// Hard cap on one full probe
    #[serde(default = "default_probe_budget_ms")]
    pub budget_ms: u64,

    #[serde(default = "default_dns_timeout_ms")]
    pub dns_timeout_ms: u64,

    #[serde(default = "default_round_trip_timeout_ms")]
    pub round_trip_timeout_ms: u64,

    /// Binary transport is chosen only below this round-trip latency
    #[serde(default = "default_binary_threshold_ms")]
    pub binary_threshold_ms: u64,

    /// Text transport is chosen only below this round-trip latency
    #[serde(default = "default_text_threshold_ms")]
    pub text_threshold_ms: u64,

    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,

    /// Degraded decisions are re-probed sooner
    #[serde(default = "default_degraded_ttl_secs")]
    pub degraded_ttl_secs: u64,

    /// Consecutive failures of the chosen transport that force a re-probe
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
}

fn default_probe_budget_ms() -> u64 {
    5000
}
fn default_dns_timeout_ms() -> u64 {
    1000
}
fn default_round_trip_timeout_ms() -> u64 {
    1500
}
fn default_binary_threshold_ms() -> u64 {
    250
}
fn default_text_threshold_ms() -> u64 {
    1000
}
fn default_ttl_secs() -> u64 {
    300
}
fn default_degraded_ttl_secs() -> u64 {
    30
}
fn default_failure_threshold() -> u32 {
    3
}

impl Default for ProbeSettings {
    fn default() -> Self {
        Self {
            budget_ms: default_probe_budget_ms(),
            dns_timeout_ms: default_dns_timeout_ms(),
            round_trip_timeout_ms: default_round_trip_timeout_ms(),
            binary_threshold_ms: default_binary_threshold_ms(),
            text_threshold_ms: default_text_threshold_ms(),
            ttl_secs: default_ttl_secs(),
            degraded_ttl_secs: default_degraded_ttl_secs(),
            failure_threshold: default_failure_threshold(),
        }
    }
}

impl ProbeSettings {
    pub fn budget(&self) -> Duration {
        Duration::from_millis(self.budget_ms)
    }
    pub fn dns_timeout(&self) -> Duration {
        Duration::from_millis(self.dns_timeout_ms)
    }
    pub fn round_trip_timeout(&self) -> Duration {
        Duration::from_millis(self.round_trip_timeout_ms)
    }
    pub fn binary_threshold(&self) -> Duration {
        Duration::from_millis(self.binary_threshold_ms)
    }
    pub fn text_threshold(&self) -> Duration {
        Duration::from_millis(self.text_threshold_ms)
    }
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
    pub fn degraded_ttl(&self) -> Duration {
        Duration::from_secs(self.degraded_ttl_secs)
    }
}

/// Default task budget and backoff for agent stages
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionSettings {
    /// Per-attempt wall-clock timeout (default: 300 = 5 min)
    #[serde(default = "default_step_timeout")]
    pub timeout_seconds: u64,

    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_max_tool_calls")]
    pub max_tool_calls: u32,

    #[serde(default)]
    pub retry: RetryPolicy,
}

fn default_step_timeout() -> u64 {
    300
}
fn default_max_retries() -> u32 {
    3
}
fn default_max_tool_calls() -> u32 {
    20
}

impl Default for ExecutionSettings {
    fn default() -> Self {
        Self {
            timeout_seconds: default_step_timeout(),
            max_retries: default_max_retries(),
            max_tool_calls: default_max_tool_calls(),
            retry: RetryPolicy::default(),
        }
    }
}

/// What to do when a checkpoint cannot be written durably
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointPolicy {
    /// Keep going with an in-memory checkpoint; the run becomes non-resumable
    Degrade,
    /// Fail the run
    FailFast,
}

impl Default for CheckpointPolicy {
    fn default() -> Self {
        Self::Degrade
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointSettings {
    #[serde(default)]
    pub on_failure: CheckpointPolicy,

    /// Background attempts to flush degraded checkpoints
    #[serde(default = "default_checkpoint_retry_attempts")]
    pub retry_attempts: u32,

    #[serde(default)]
    pub retry: RetryPolicy,
}

fn default_checkpoint_retry_attempts() -> u32 {
    5
}

impl Default for CheckpointSettings {
    fn default() -> Self {
        Self {
            on_failure: CheckpointPolicy::default(),
            retry_attempts: default_checkpoint_retry_attempts(),
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalSettings {
    /// Pending approvals older than this fail the run (default: 7 days)
    #[serde(default = "default_max_wait_seconds")]
    pub max_wait_seconds: u64,

    /// How often the expiry reaper scans pending approvals
    #[serde(default = "default_sweep_interval_seconds")]
    pub sweep_interval_seconds: u64,
}

fn default_max_wait_seconds() -> u64 {
    7 * 24 * 3600
}
fn default_sweep_interval_seconds() -> u64 {
    60
}

impl Default for ApprovalSettings {
    fn default() -> Self {
        Self {
            max_wait_seconds: default_max_wait_seconds(),
            sweep_interval_seconds: default_sweep_interval_seconds(),
        }
    }
}

impl ApprovalSettings {
    pub fn max_wait(&self) -> Duration {
        Duration::from_secs(self.max_wait_seconds)
    }
}

/// External command implementing an agent
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSpec {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

/// Resolved configuration with absolute paths
#[derive(Debug, Clone)]
pub struct Settings {
    /// Absolute path to stagecoach home (journals, local state)
    pub home: PathBuf,
    /// Workflow definition file
    pub workflow_path: PathBuf,
    /// Path to config file (if found)
    pub config_file: Option<PathBuf>,
    /// Write per-run JSONL journals under `home/runs`
    pub journal: bool,
    pub store: StoreSettings,
    pub probe: ProbeSettings,
    pub execution: ExecutionSettings,
    pub checkpoint: CheckpointSettings,
    pub approval: ApprovalSettings,
    pub agents: BTreeMap<String, AgentSpec>,
}

impl Settings {
    /// Settings rooted at `home` with every section at its default
    pub fn with_home(home: impl Into<PathBuf>) -> Self {
        let home = home.into();
        Self {
            workflow_path: home.join("workflow.yaml"),
            home,
            config_file: None,
            journal: true,
            store: StoreSettings::default(),
            probe: ProbeSettings::default(),
            execution: ExecutionSettings::default(),
            checkpoint: CheckpointSettings::default(),
            approval: ApprovalSettings::default(),
            agents: BTreeMap::new(),
        }
    }

    /// Directory holding per-run journals
    pub fn runs_dir(&self) -> PathBuf {
        self.home.join("runs")
    }

    /// Load settings from all sources
    pub fn load() -> Result<Self> {
        let config_file = find_config_file();
        let file = match config_file {
            Some(ref path) => Some(load_config_file(path)?),
            None => None,
        };
        resolve(config_file, file, |name| std::env::var(name).ok())
    }
}

/// Find config file by searching current directory and parents
fn find_config_file() -> Option<PathBuf> {
    let mut current = std::env::current_dir().ok()?;

    loop {
        let config_path = current.join(".stagecoach").join("config.yaml");
        if config_path.exists() {
            return Some(config_path);
        }

        if !current.pop() {
            break;
        }
    }

    None
}

/// Load and parse config file
fn load_config_file(path: &Path) -> Result<ConfigFile> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Resolve a path that may be relative to the config file's parent
fn resolve_path(base: &Path, path_str: &str) -> PathBuf {
    let path = PathBuf::from(path_str);
    if path.is_absolute() {
        path
    } else {
        base.join(path)
            .canonicalize()
            .unwrap_or_else(|_| base.join(path_str))
    }
}

/// Merge file contents, environment overrides and defaults
fn resolve<F>(config_path: Option<PathBuf>, file: Option<ConfigFile>, env: F) -> Result<Settings>
where
    F: Fn(&str) -> Option<String>,
{
    let default_home = dirs::home_dir()
        .context("Failed to determine home directory")?
        .join(".stagecoach");

    let file = file.unwrap_or_default();
    let config_dir = config_path
        .as_deref()
        .and_then(Path::parent)
        .map(Path::to_path_buf);

    let home = if let Some(env_home) = env("STAGECOACH_HOME") {
        PathBuf::from(env_home)
    } else {
        match (&config_dir, &file.paths.home) {
            (Some(dir), Some(home_path)) => resolve_path(dir, home_path),
            _ => default_home,
        }
    };

    let workflow_path = if let Some(env_workflow) = env("STAGECOACH_WORKFLOW") {
        PathBuf::from(env_workflow)
    } else {
        match (&config_dir, &file.paths.workflow) {
            (Some(dir), Some(workflow)) => resolve_path(dir, workflow),
            (Some(dir), None) => dir.join("workflow.yaml"),
            _ => home.join("workflow.yaml"),
        }
    };

    let mut store = file.store;
    if let Some(endpoint) = env("STAGECOACH_TEXT_ENDPOINT") {
        store.text_endpoint = Some(endpoint);
    }
    if let Some(endpoint) = env("STAGECOACH_BINARY_ENDPOINT") {
        store.binary_endpoint = Some(endpoint);
    }

    Ok(Settings {
        home,
        workflow_path,
        config_file: config_path,
        journal: file.journal.unwrap_or(true),
        store,
        probe: file.probe,
        execution: file.execution,
        checkpoint: file.checkpoint,
        approval: file.approval,
        agents: file.agents,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    const SAMPLE: &str = r#"
version: "1.0"
paths:
  home: ./state
  workflow: ./campaign.yaml
store:
  binary_endpoint: store.internal:7400
  text_endpoint: https://store.internal
  request_timeout_ms: 3000
probe:
  budget_ms: 2000
checkpoint:
  on_failure: fail_fast
approval:
  max_wait_seconds: 3600
agents:
  researcher:
    command: ./agents/research.sh
    args: ["--fast"]
"#;

    #[test]
    fn test_defaults_without_file() {
        let settings = resolve(None, None, |_| None).unwrap();

        let expected_home = dirs::home_dir().unwrap().join(".stagecoach");
        assert_eq!(settings.home, expected_home);
        assert_eq!(settings.workflow_path, expected_home.join("workflow.yaml"));
        assert_eq!(settings.store.backend, StoreBackend::Remote);
        assert_eq!(settings.checkpoint.on_failure, CheckpointPolicy::Degrade);
        assert!(settings.config_file.is_none());
    }

    #[test]
    fn test_config_file_parsing() {
        let temp = TempDir::new().unwrap();
        let dir = temp.path().join(".stagecoach");
        std::fs::create_dir_all(&dir).unwrap();

        let config_path = dir.join("config.yaml");
        let mut file = std::fs::File::create(&config_path).unwrap();
        writeln!(file, "{}", SAMPLE).unwrap();

        let parsed = load_config_file(&config_path).unwrap();
        let settings = resolve(Some(config_path.clone()), Some(parsed), |_| None).unwrap();

        assert_eq!(settings.home, dir.join("state"));
        assert_eq!(settings.workflow_path, dir.join("campaign.yaml"));
        assert_eq!(
            settings.store.binary_endpoint.as_deref(),
            Some("store.internal:7400")
        );
        assert_eq!(settings.store.request_timeout(), Duration::from_secs(3));
        assert_eq!(settings.store.connect_timeout_ms, 2000);
        assert_eq!(settings.probe.budget(), Duration::from_secs(2));
        assert_eq!(settings.probe.failure_threshold, 3);
        assert_eq!(settings.checkpoint.on_failure, CheckpointPolicy::FailFast);
        assert_eq!(settings.approval.max_wait_seconds, 3600);
        assert_eq!(settings.agents["researcher"].args, vec!["--fast"]);
    }

    #[test]
    fn test_env_overrides_file() {
        let parsed: ConfigFile = serde_yaml::from_str(SAMPLE).unwrap();
        let settings = resolve(
            Some(PathBuf::from("/project/.stagecoach/config.yaml")),
            Some(parsed),
            |name| match name {
                "STAGECOACH_HOME" => Some("/var/lib/stagecoach".to_string()),
                "STAGECOACH_TEXT_ENDPOINT" => Some("http://localhost:8080".to_string()),
                _ => None,
            },
        )
        .unwrap();

        assert_eq!(settings.home, PathBuf::from("/var/lib/stagecoach"));
        assert_eq!(
            settings.store.text_endpoint.as_deref(),
            Some("http://localhost:8080")
        );
        assert_eq!(
            settings.store.binary_endpoint.as_deref(),
            Some("store.internal:7400")
        );
    }

    #[test]
    fn test_resolve_relative_path() {
        let base = PathBuf::from("/home/user/project");

        assert_eq!(
            resolve_path(&base, "./subdir"),
            PathBuf::from("/home/user/project/subdir")
        );
        assert_eq!(
            resolve_path(&base, "/absolute/path"),
            PathBuf::from("/absolute/path")
        );
    }
}
