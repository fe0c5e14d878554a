//! Configuration for the fleet control plane.
//!
//! Configuration is layered: built-in defaults, then an optional
//! `fleet.toml` file, then `FLEET_*` environment variables. A missing file
//! or variable falls back to the layer below, so an empty environment gives
//! exactly the documented defaults.
//!
//! # Example
//!
//! ```
//! use fleet_config::Config;
//!
//! let config = Config::default();
//! assert_eq!(config.health.interval_seconds, 30);
//! assert_eq!(config.queue.max_size, 1000);
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use fleet_retry::BackoffConfig;

/// Default configuration file name
pub const CONFIG_FILE: &str = "fleet.toml";

/// Environment variable prefix
pub const ENV_PREFIX: &str = "FLEET_";

/// Get the config file path for a directory
pub fn config_path(dir: &Path) -> PathBuf {
    dir.join(CONFIG_FILE)
}

/// Complete control-plane configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub health: HealthConfig,
    #[serde(default)]
    pub thresholds: Thresholds,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub build: BuildOptions,
    #[serde(default)]
    pub deployment: DeploymentOptions,
    #[serde(default)]
    pub alerts: AlertOptions,
    #[serde(default)]
    pub pipelines: PipelineOptions,
    #[serde(default)]
    pub groups: GroupOptions,
    #[serde(default)]
    pub transport: TransportOptions,
    #[serde(default)]
    pub state: StateOptions,
}

impl Config {
    /// Load from `<dir>/fleet.toml` (if present) and then apply `FLEET_*`
    /// environment variables on top.
    pub fn load(dir: &Path) -> Result<Self> {
        let mut config = Self::load_file(dir)?;
        config.apply_env(std::env::vars());
        Ok(config)
    }

    /// Load from file only, without touching the process environment.
    pub fn load_file(dir: &Path) -> Result<Self> {
        let path = config_path(dir);
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        toml::from_str(&content)
            .with_context(|| format!("failed to parse config file {}", path.display()))
    }

    /// Apply recognized `FLEET_*` variables. Unknown keys and unparsable
    /// values are ignored; a missing value keeps the current one.
    pub fn apply_env<I>(&mut self, vars: I)
    where
        I: IntoIterator<Item = (String, String)>,
    {
        for (key, value) in vars {
            let Some(rest) = key.strip_prefix(ENV_PREFIX) else {
                continue;
            };
            match rest {
                "HEALTH_INTERVAL_SECONDS" => set(&mut self.health.interval_seconds, &value),
                "HEALTH_JITTER" => set(&mut self.health.jitter, &value),
                "HEALTH_MAX_PARALLEL" => set(&mut self.health.max_parallel, &value),
                "THRESHOLDS_CPU_WARNING_PERCENT" => {
                    set(&mut self.thresholds.cpu_warning_percent, &value)
                }
                "THRESHOLDS_CPU_CRITICAL_PERCENT" => {
                    set(&mut self.thresholds.cpu_critical_percent, &value)
                }
                "THRESHOLDS_MEMORY_WARNING_PERCENT" => {
                    set(&mut self.thresholds.memory_warning_percent, &value)
                }
                "THRESHOLDS_MEMORY_CRITICAL_PERCENT" => {
                    set(&mut self.thresholds.memory_critical_percent, &value)
                }
                "THRESHOLDS_STORAGE_WARNING_PERCENT" => {
                    set(&mut self.thresholds.storage_warning_percent, &value)
                }
                "THRESHOLDS_STORAGE_CRITICAL_PERCENT" => {
                    set(&mut self.thresholds.storage_critical_percent, &value)
                }
                "THRESHOLDS_DISK_SPACE_WARNING_GB" => {
                    set(&mut self.thresholds.disk_space_warning_gb, &value)
                }
                "THRESHOLDS_DISK_SPACE_CRITICAL_GB" => {
                    set(&mut self.thresholds.disk_space_critical_gb, &value)
                }
                "THRESHOLDS_TEMPERATURE_WARNING_CELSIUS" => {
                    set(&mut self.thresholds.temperature_warning_celsius, &value)
                }
                "THRESHOLDS_TEMPERATURE_CRITICAL_CELSIUS" => {
                    set(&mut self.thresholds.temperature_critical_celsius, &value)
                }
                "THRESHOLDS_RESPONSE_TIME_WARNING_MS" => {
                    set(&mut self.thresholds.response_time_warning_ms, &value)
                }
                "THRESHOLDS_RESPONSE_TIME_CRITICAL_MS" => {
                    set(&mut self.thresholds.response_time_critical_ms, &value)
                }
                "THRESHOLDS_CONSECUTIVE_FAILURE_LIMIT" => {
                    set(&mut self.thresholds.consecutive_failure_limit, &value)
                }
                "QUEUE_MAX_SIZE" => set(&mut self.queue.max_size, &value),
                "QUEUE_TICK_SECONDS" => set(&mut self.queue.tick_seconds, &value),
                "BUILD_ARTIFACT_ROOT" => self.build.artifact_root = PathBuf::from(&value),
                "BUILD_RETENTION_DAYS" => set(&mut self.build.retention_days, &value),
                "BUILD_WORKSPACE_KEEP" => set(&mut self.build.workspace_keep, &value),
                "DEPLOYMENT_BOOT_TIMEOUT" => set(&mut self.deployment.boot_timeout_seconds, &value),
                "DEPLOYMENT_TRANSFER_TIMEOUT" => {
                    set(&mut self.deployment.transfer_timeout_seconds, &value)
                }
                "ALERTS_COOLDOWN_SECONDS" => set(&mut self.alerts.cooldown_seconds, &value),
                "ALERTS_MAX_HISTORY" => set(&mut self.alerts.max_history, &value),
                "PIPELINES_DEFAULT_MAX_RETRIES" => {
                    set(&mut self.pipelines.default_max_retries, &value)
                }
                "PIPELINES_RETRY_BACKOFF_SECONDS" => {
                    set(&mut self.pipelines.retry_backoff_seconds, &value)
                }
                "GROUPS_DEFAULT_MAX_ALLOCATION_DURATION" => {
                    if let Ok(duration) = humantime::parse_duration(&value) {
                        self.groups.default_max_allocation_duration = Some(duration);
                    }
                }
                "STATE_DIR" => self.state.dir = PathBuf::from(&value),
                _ => {}
            }
        }
    }
}

fn set<T: std::str::FromStr>(slot: &mut T, value: &str) {
    if let Ok(parsed) = value.parse::<T>() {
        *slot = parsed;
    }
}

/// Health probe loop settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthConfig {
    /// Seconds between probe rounds for each asset.
    #[serde(default = "default_health_interval")]
    pub interval_seconds: u64,
    /// Fractional jitter applied to the interval to avoid probe convoys.
    #[serde(default = "default_health_jitter")]
    pub jitter: f64,
    /// Global cap on concurrently running probes.
    #[serde(default = "default_health_max_parallel")]
    pub max_parallel: usize,
}

fn default_health_interval() -> u64 {
    30
}

fn default_health_jitter() -> f64 {
    0.1
}

fn default_health_max_parallel() -> usize {
    32
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval_seconds: default_health_interval(),
            jitter: default_health_jitter(),
            max_parallel: default_health_max_parallel(),
        }
    }
}

impl HealthConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_seconds)
    }
}

/// Health classification thresholds. Per-asset overrides fall back to these.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Thresholds {
    #[serde(default = "default_warn_percent")]
    pub cpu_warning_percent: f64,
    #[serde(default = "default_crit_percent")]
    pub cpu_critical_percent: f64,
    #[serde(default = "default_warn_percent")]
    pub memory_warning_percent: f64,
    #[serde(default = "default_crit_percent")]
    pub memory_critical_percent: f64,
    #[serde(default = "default_warn_percent")]
    pub storage_warning_percent: f64,
    #[serde(default = "default_crit_percent")]
    pub storage_critical_percent: f64,
    #[serde(default = "default_disk_warn_gb")]
    pub disk_space_warning_gb: f64,
    #[serde(default = "default_disk_crit_gb")]
    pub disk_space_critical_gb: f64,
    #[serde(default = "default_temp_warn")]
    pub temperature_warning_celsius: f64,
    #[serde(default = "default_temp_crit")]
    pub temperature_critical_celsius: f64,
    #[serde(default = "default_response_warn_ms")]
    pub response_time_warning_ms: u64,
    #[serde(default = "default_response_crit_ms")]
    pub response_time_critical_ms: u64,
    /// Consecutive unreachable probes before a board is given up on.
    #[serde(default = "default_consecutive_failures")]
    pub consecutive_failure_limit: u32,
}

fn default_warn_percent() -> f64 {
    85.0
}

fn default_crit_percent() -> f64 {
    95.0
}

fn default_disk_warn_gb() -> f64 {
    10.0
}

fn default_disk_crit_gb() -> f64 {
    5.0
}

fn default_temp_warn() -> f64 {
    70.0
}

fn default_temp_crit() -> f64 {
    85.0
}

fn default_response_warn_ms() -> u64 {
    5_000
}

fn default_response_crit_ms() -> u64 {
    10_000
}

fn default_consecutive_failures() -> u32 {
    3
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            cpu_warning_percent: default_warn_percent(),
            cpu_critical_percent: default_crit_percent(),
            memory_warning_percent: default_warn_percent(),
            memory_critical_percent: default_crit_percent(),
            storage_warning_percent: default_warn_percent(),
            storage_critical_percent: default_crit_percent(),
            disk_space_warning_gb: default_disk_warn_gb(),
            disk_space_critical_gb: default_disk_crit_gb(),
            temperature_warning_celsius: default_temp_warn(),
            temperature_critical_celsius: default_temp_crit(),
            response_time_warning_ms: default_response_warn_ms(),
            response_time_critical_ms: default_response_crit_ms(),
            consecutive_failure_limit: default_consecutive_failures(),
        }
    }
}

/// Build queue settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Admission is refused once the queue holds this many jobs.
    #[serde(default = "default_queue_max")]
    pub max_size: usize,
    /// Scheduler wake interval in seconds (it also wakes on asset events).
    #[serde(default = "default_queue_tick")]
    pub tick_seconds: u64,
}

fn default_queue_max() -> usize {
    1000
}

fn default_queue_tick() -> u64 {
    10
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_size: default_queue_max(),
            tick_seconds: default_queue_tick(),
        }
    }
}

impl QueueConfig {
    pub fn tick(&self) -> Duration {
        Duration::from_secs(self.tick_seconds)
    }
}

/// Build and artifact storage settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildOptions {
    #[serde(default = "default_artifact_root")]
    pub artifact_root: PathBuf,
    /// Unpinned, untagged builds older than this are eligible for deletion.
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
    /// Keep remote build workspaces after completion.
    #[serde(default)]
    pub workspace_keep: bool,
}

fn default_artifact_root() -> PathBuf {
    PathBuf::from("/var/lib/artifacts")
}

fn default_retention_days() -> u32 {
    30
}

impl Default for BuildOptions {
    fn default() -> Self {
        Self {
            artifact_root: default_artifact_root(),
            retention_days: default_retention_days(),
            workspace_keep: false,
        }
    }
}

/// Deployment timeouts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentOptions {
    #[serde(default = "default_boot_timeout")]
    pub boot_timeout_seconds: u64,
    #[serde(default = "default_transfer_timeout")]
    pub transfer_timeout_seconds: u64,
}

fn default_boot_timeout() -> u64 {
    120
}

fn default_transfer_timeout() -> u64 {
    300
}

impl Default for DeploymentOptions {
    fn default() -> Self {
        Self {
            boot_timeout_seconds: default_boot_timeout(),
            transfer_timeout_seconds: default_transfer_timeout(),
        }
    }
}

impl DeploymentOptions {
    pub fn boot_timeout(&self) -> Duration {
        Duration::from_secs(self.boot_timeout_seconds)
    }

    pub fn transfer_timeout(&self) -> Duration {
        Duration::from_secs(self.transfer_timeout_seconds)
    }
}

/// Alert service settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlertOptions {
    /// Minimum seconds between repeat alerts for one (resource, category).
    #[serde(default = "default_cooldown")]
    pub cooldown_seconds: u64,
    #[serde(default = "default_alert_history")]
    pub max_history: usize,
}

fn default_cooldown() -> u64 {
    300
}

fn default_alert_history() -> usize {
    10_000
}

impl Default for AlertOptions {
    fn default() -> Self {
        Self {
            cooldown_seconds: default_cooldown(),
            max_history: default_alert_history(),
        }
    }
}

impl AlertOptions {
    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_seconds)
    }
}

/// Pipeline engine settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineOptions {
    #[serde(default = "default_stage_retries")]
    pub default_max_retries: u32,
    #[serde(default = "default_retry_backoff")]
    pub retry_backoff_seconds: u64,
}

fn default_stage_retries() -> u32 {
    2
}

fn default_retry_backoff() -> u64 {
    1
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            default_max_retries: default_stage_retries(),
            retry_backoff_seconds: default_retry_backoff(),
        }
    }
}

impl PipelineOptions {
    pub fn retry_backoff(&self) -> Duration {
        Duration::from_secs(self.retry_backoff_seconds)
    }
}

/// Resource group settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GroupOptions {
    /// Applied to allocations in groups whose policy sets no duration.
    /// Unset means allocations never expire by default.
    #[serde(
        default,
        with = "humantime_serde",
        skip_serializing_if = "Option::is_none"
    )]
    pub default_max_allocation_duration: Option<Duration>,
}

/// Transport adapter settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransportOptions {
    /// Maximum pooled connections per (user, host, port).
    #[serde(default = "default_pool_max")]
    pub pool_max_per_key: usize,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_seconds: u64,
    /// Default remote exec deadline, overridable per call.
    #[serde(default = "default_exec_timeout")]
    pub exec_timeout_seconds: u64,
    /// Backoff for transport-level retries.
    #[serde(default = "BackoffConfig::transport")]
    pub retry: BackoffConfig,
}

fn default_pool_max() -> usize {
    4
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_exec_timeout() -> u64 {
    300
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            pool_max_per_key: default_pool_max(),
            connect_timeout_seconds: default_connect_timeout(),
            exec_timeout_seconds: default_exec_timeout(),
            retry: BackoffConfig::transport(),
        }
    }
}

impl TransportOptions {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_seconds)
    }

    pub fn exec_timeout(&self) -> Duration {
        Duration::from_secs(self.exec_timeout_seconds)
    }
}

/// State persistence settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateOptions {
    /// Directory holding the per-kind JSON state files.
    #[serde(default = "default_state_dir")]
    pub dir: PathBuf,
}

fn default_state_dir() -> PathBuf {
    PathBuf::from(".fleet")
}

impl Default for StateOptions {
    fn default() -> Self {
        Self {
            dir: default_state_dir(),
        }
    }
}
