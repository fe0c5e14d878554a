//! # Types
//!
//! Core domain types for the fleet control plane: assets, build jobs,
//! artifacts, deployments, pipelines, resource groups, alerts, and the
//! error taxonomy shared by every subsystem.
//!
//! The fleet manages three asset classes:
//! - [`BuildServer`] - cross-compiles kernel/BSP source into artifacts
//! - [`VirtHost`] - runs guest VMs for virtualized test environments
//! - [`Board`] - physical hardware reached over shell, serial, and power
//!
//! ## Serialization
//!
//! Most types implement `Serialize` and `Deserialize` from `serde` for
//! persistence to the per-kind JSON state files. Durations in config-facing
//! types use `humantime_serde` so they round-trip as human-readable strings.
//! Short-lived in-memory holds ([`Reservation`]) are deliberately not
//! serializable.
//!
//! ## Errors
//!
//! [`Error`] is the closed taxonomy used across component boundaries.
//! Components never unwind across each other; every fallible operation
//! returns [`Result`].

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Generate a fresh opaque identifier with a short kind prefix,
/// e.g. `job-1f0c…`. Identifiers are unique within the process.
pub fn new_id(prefix: &str) -> String {
    format!("{}-{}", prefix, uuid::Uuid::new_v4())
}

/// Deserialize a Duration from either a string (human-readable) or u64 (seconds)
pub fn deserialize_duration<'de, D>(deserializer: D) -> std::result::Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum DurationHelper {
        String(String),
        U64(u64),
    }

    match DurationHelper::deserialize(deserializer)? {
        DurationHelper::String(s) => humantime::parse_duration(&s)
            .map_err(|e| serde::de::Error::custom(format!("invalid duration: {}", e))),
        DurationHelper::U64(secs) => Ok(Duration::from_secs(secs)),
    }
}

/// Serialize a Duration as whole seconds so it roundtrips with deserialize_duration
pub fn serialize_duration<S>(duration: &Duration, serializer: S) -> std::result::Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_u64(duration.as_secs())
}

// ---------------------------------------------------------------------------
// Architectures
// ---------------------------------------------------------------------------

/// Architecture equivalence used when matching artifacts against deployment
/// targets: x86_64 = amd64, arm64 = aarch64, armv7 = armhf = arm,
/// riscv64 = riscv. Everything else only matches itself.
pub fn arch_compatible(target: &str, artifact: &str) -> bool {
    let target = target.to_ascii_lowercase();
    let artifact = artifact.to_ascii_lowercase();
    if target == artifact {
        return true;
    }
    equivalents(&target).contains(&artifact.as_str())
}

fn equivalents(arch: &str) -> &'static [&'static str] {
    match arch {
        "x86_64" | "amd64" => &["x86_64", "amd64"],
        "arm64" | "aarch64" => &["arm64", "aarch64"],
        "armv7" | "arm" | "armhf" => &["armv7", "arm", "armhf"],
        "riscv64" | "riscv" => &["riscv64", "riscv"],
        _ => &[],
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Classification of a transport-layer failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportErrorKind {
    /// Could not establish a connection (network-level failure).
    Connect,
    /// Authentication was rejected by the remote end.
    Auth,
    /// The operation exceeded its deadline.
    Timeout,
    /// An established channel failed mid-operation.
    Io,
    /// The session or pool was closed underneath the caller.
    Closed,
}

/// A failure in an adapter reaching an asset. Retried with backoff inside
/// the adapter layer; surfaced only on exhaustion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{kind:?} transport error: {message}")]
pub struct TransportError {
    pub kind: TransportErrorKind,
    pub message: String,
}

impl TransportError {
    pub fn new(kind: TransportErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::Timeout, message)
    }

    pub fn connect(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::Connect, message)
    }

    /// Whether a retry at the transport layer could plausibly succeed.
    /// Auth rejections are permanent; everything else is transient.
    pub fn is_retryable(&self) -> bool {
        self.kind != TransportErrorKind::Auth
    }
}

/// The error taxonomy shared by every subsystem.
///
/// Each variant maps onto one propagation rule:
/// - `Validation` and `NotFound` are never retried.
/// - `Conflict` (policy violations included) is never retried automatically.
/// - `Transport` is retried with backoff inside the adapter and surfaced
///   only on exhaustion.
/// - `Remote` (command ran, outcome bad) is never retried by the adapter
///   but may be retried by a pipeline stage within its budget.
/// - `Exhausted` is the scheduler's "no candidate / queue full" outcome and
///   carries a wait estimate instead of being an error to the scheduler.
/// - `Cancelled` is terminal and never becomes `failed`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[serde(rename_all = "snake_case", tag = "code", content = "detail")]
pub enum Error {
    #[error("invalid input: {0}")]
    Validation(String),

    #[error("{kind} not found: {id}")]
    NotFound { kind: String, id: String },

    #[error("conflict: {0}")]
    Conflict(String),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("remote failure: {0}")]
    Remote(String),

    #[error("no capacity available{}", wait_hint(.wait_estimate))]
    Exhausted {
        /// Estimated seconds until a candidate could become eligible.
        /// `None` when no registered asset could ever satisfy the request.
        wait_estimate: Option<u64>,
    },

    #[error("operation cancelled")]
    Cancelled,
}

fn wait_hint(estimate: &Option<u64>) -> String {
    match estimate {
        Some(secs) => format!(" (retry in ~{}s)", secs),
        None => String::new(),
    }
}

impl Error {
    pub fn not_found(kind: &str, id: &str) -> Self {
        Error::NotFound {
            kind: kind.to_string(),
            id: id.to_string(),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Error::Validation(message.into())
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Error::Conflict(message.into())
    }
}

pub type Result<T> = std::result::Result<T, Error>;

// ---------------------------------------------------------------------------
// Health
// ---------------------------------------------------------------------------

/// Health level of an asset, derived from threshold evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthLevel {
    Healthy,
    Degraded,
    Unhealthy,
    Unreachable,
    #[default]
    Unknown,
}

impl HealthLevel {
    /// Severity rank for worst-wins folding. `Unknown` ranks below
    /// `Healthy` so a single observed metric always dominates it.
    pub fn severity(self) -> u8 {
        match self {
            HealthLevel::Unknown => 0,
            HealthLevel::Healthy => 1,
            HealthLevel::Degraded => 2,
            HealthLevel::Unhealthy => 3,
            HealthLevel::Unreachable => 4,
        }
    }

    /// The worse of two levels.
    pub fn worst(self, other: HealthLevel) -> HealthLevel {
        if other.severity() > self.severity() {
            other
        } else {
            self
        }
    }

    pub fn is_worse_than(self, other: HealthLevel) -> bool {
        self.severity() > other.severity()
    }
}

/// Kind of a managed asset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssetKind {
    BuildServer,
    VirtHost,
    Board,
}

impl std::fmt::Display for AssetKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            AssetKind::BuildServer => "build_server",
            AssetKind::VirtHost => "virt_host",
            AssetKind::Board => "board",
        };
        f.write_str(s)
    }
}

/// Point-in-time utilization snapshot reported by a health probe.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceUtilization {
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub storage_percent: f64,
    #[serde(default)]
    pub network_bytes_in: u64,
    #[serde(default)]
    pub network_bytes_out: u64,
}

impl ResourceUtilization {
    /// Whether any resource exceeds the threshold.
    pub fn is_overloaded(&self, threshold: f64) -> bool {
        self.cpu_percent > threshold
            || self.memory_percent > threshold
            || self.storage_percent > threshold
    }

    pub fn average(&self) -> f64 {
        (self.cpu_percent + self.memory_percent + self.storage_percent) / 3.0
    }
}

/// Reference to remote-shell access for an asset. Secrets never live here;
/// `key_path` points at material resolved by the adapter at connect time.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ShellCredentials {
    pub hostname: String,
    pub username: String,
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key_path: Option<String>,
}

fn default_ssh_port() -> u16 {
    22
}

impl ShellCredentials {
    /// Pool key: connections are shared per (user, host, port).
    pub fn pool_key(&self) -> String {
        format!("{}@{}:{}", self.username, self.hostname, self.port)
    }
}

// ---------------------------------------------------------------------------
// Build servers
// ---------------------------------------------------------------------------

/// Cross-compilation toolchain installed on a build server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Toolchain {
    /// e.g. `aarch64-linux-gnu-gcc`
    pub name: String,
    pub version: String,
    pub target_architecture: String,
    pub path: String,
    #[serde(default = "default_true")]
    pub available: bool,
}

fn default_true() -> bool {
    true
}

impl Toolchain {
    pub fn supports_architecture(&self, arch: &str) -> bool {
        self.available && self.target_architecture.eq_ignore_ascii_case(arch)
    }
}

/// Status of a build server or virtualization host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerStatus {
    Online,
    Offline,
    Degraded,
    Maintenance,
    #[default]
    Unknown,
}

/// A build server for compiling kernel/BSP source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildServer {
    pub id: String,
    pub hostname: String,
    pub credentials: ShellCredentials,
    pub supported_architectures: Vec<String>,
    pub toolchains: Vec<Toolchain>,
    pub total_cpu_cores: u32,
    pub total_memory_mb: u64,
    pub total_storage_gb: u64,
    #[serde(default)]
    pub status: ServerStatus,
    #[serde(default)]
    pub health_level: HealthLevel,
    #[serde(default)]
    pub utilization: ResourceUtilization,
    #[serde(default)]
    pub active_build_count: u32,
    #[serde(default = "default_max_builds")]
    pub max_concurrent_builds: u32,
    #[serde(default)]
    pub queue_depth: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<String>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub maintenance: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_probe_at: Option<DateTime<Utc>>,
}

fn default_max_builds() -> u32 {
    4
}

impl BuildServer {
    /// Whether any available toolchain targets the given architecture.
    pub fn has_toolchain_for(&self, architecture: &str) -> bool {
        self.toolchains
            .iter()
            .any(|tc| tc.supports_architecture(architecture))
    }

    pub fn toolchain_for(&self, architecture: &str) -> Option<&Toolchain> {
        self.toolchains
            .iter()
            .find(|tc| tc.supports_architecture(architecture))
    }

    /// Ready for new work: online, not in maintenance, below its build cap,
    /// and not overloaded.
    pub fn can_accept_build(&self) -> bool {
        self.status == ServerStatus::Online
            && !self.maintenance
            && self.active_build_count < self.max_concurrent_builds
            && !self.utilization.is_overloaded(85.0)
    }

    /// Current headroom after subtracting utilization.
    pub fn capacity(&self) -> ServerCapacity {
        ServerCapacity {
            available_cpu_cores: remaining(self.total_cpu_cores as u64, self.utilization.cpu_percent)
                as u32,
            available_memory_mb: remaining(self.total_memory_mb, self.utilization.memory_percent),
            available_storage_gb: remaining(
                self.total_storage_gb,
                self.utilization.storage_percent,
            ),
            can_accept_build: self.can_accept_build(),
            estimated_queue_time_seconds: u64::from(self.queue_depth) * 300,
        }
    }
}

fn remaining(total: u64, used_percent: f64) -> u64 {
    let used = (total as f64 * used_percent / 100.0) as u64;
    total.saturating_sub(used)
}

/// Available headroom on a build server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerCapacity {
    pub available_cpu_cores: u32,
    pub available_memory_mb: u64,
    pub available_storage_gb: u64,
    pub can_accept_build: bool,
    pub estimated_queue_time_seconds: u64,
}

impl ServerCapacity {
    pub fn meets(&self, cpu: u32, memory_mb: u64, storage_gb: u64) -> bool {
        self.can_accept_build
            && self.available_cpu_cores >= cpu
            && self.available_memory_mb >= memory_mb
            && self.available_storage_gb >= storage_gb
    }
}

// ---------------------------------------------------------------------------
// Virtualization hosts
// ---------------------------------------------------------------------------

/// A virtualization host for running guest VMs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VirtHost {
    pub id: String,
    pub hostname: String,
    pub credentials: ShellCredentials,
    pub architecture: String,
    pub total_cpu_cores: u32,
    pub total_memory_mb: u64,
    pub total_storage_gb: u64,
    #[serde(default)]
    pub status: ServerStatus,
    #[serde(default)]
    pub health_level: HealthLevel,
    #[serde(default)]
    pub hw_assist: bool,
    #[serde(default)]
    pub nested_virt: bool,
    #[serde(default)]
    pub utilization: ResourceUtilization,
    #[serde(default)]
    pub running_guest_count: u32,
    #[serde(default = "default_max_guests")]
    pub max_guests: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<String>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub maintenance: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_probe_at: Option<DateTime<Utc>>,
}

fn default_max_guests() -> u32 {
    10
}

impl VirtHost {
    pub fn supports_architecture(&self, arch: &str) -> bool {
        self.architecture.eq_ignore_ascii_case(arch)
    }

    pub fn can_allocate_guest(&self) -> bool {
        self.status == ServerStatus::Online
            && !self.maintenance
            && self.running_guest_count < self.max_guests
            && !self.utilization.is_overloaded(85.0)
    }

    pub fn capacity(&self) -> HostCapacity {
        let available_cpu =
            remaining(self.total_cpu_cores as u64, self.utilization.cpu_percent) as u32;
        let available_memory = remaining(self.total_memory_mb, self.utilization.memory_percent);
        HostCapacity {
            available_cpu_cores: available_cpu,
            available_memory_mb: available_memory,
            available_storage_gb: remaining(
                self.total_storage_gb,
                self.utilization.storage_percent,
            ),
            can_allocate_guest: self.can_allocate_guest(),
            // Leave headroom for the host itself.
            max_guest_cpu: available_cpu.saturating_sub(1).max(1),
            max_guest_memory_mb: available_memory.saturating_sub(1024).max(512),
        }
    }
}

/// Available headroom on a virtualization host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostCapacity {
    pub available_cpu_cores: u32,
    pub available_memory_mb: u64,
    pub available_storage_gb: u64,
    pub can_allocate_guest: bool,
    pub max_guest_cpu: u32,
    pub max_guest_memory_mb: u64,
}

impl HostCapacity {
    pub fn meets(&self, cpu: u32, memory_mb: u64, storage_gb: u64) -> bool {
        self.can_allocate_guest
            && self.available_cpu_cores >= cpu
            && self.available_memory_mb >= memory_mb
            && self.available_storage_gb >= storage_gb
    }
}

// ---------------------------------------------------------------------------
// Boards
// ---------------------------------------------------------------------------

/// Out-of-band power control method for a board.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PowerMethod {
    UsbHub,
    NetworkPdu,
    GpioRelay,
    Manual,
}

/// Power control wiring for a board. The method-specific locator fields are
/// only meaningful for their own method.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PowerControlConfig {
    pub method: PowerMethod,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usb_hub_port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pdu_address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pdu_outlet: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gpio_pin: Option<u16>,
}

impl PowerControlConfig {
    pub fn manual() -> Self {
        Self {
            method: PowerMethod::Manual,
            usb_hub_port: None,
            pdu_address: None,
            pdu_outlet: None,
            gpio_pin: None,
        }
    }

    /// Manual power control can never be commanded by the control plane.
    pub fn is_automated(&self) -> bool {
        self.method != PowerMethod::Manual
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PowerStatus {
    On,
    Off,
    Cycling,
    #[default]
    Unknown,
}

/// Status of a physical board.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BoardStatus {
    Available,
    InUse,
    Flashing,
    Offline,
    Maintenance,
    Recovery,
    #[default]
    Unknown,
}

/// Last observed health of a board, filled in by the probe loop.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BoardHealth {
    #[serde(default)]
    pub connectivity: HealthLevel,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature_celsius: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_percent: Option<f64>,
    #[serde(default)]
    pub power_status: PowerStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_response_time_ms: Option<u64>,
}

impl BoardHealth {
    pub fn is_healthy(&self) -> bool {
        self.connectivity == HealthLevel::Healthy
    }
}

/// A physical test board.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Board {
    pub id: String,
    pub name: String,
    /// e.g. `raspberry_pi_4`, `beaglebone_black`, `visionfive_2`
    pub board_type: String,
    pub architecture: String,
    pub power_control: PowerControlConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub serial_number: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credentials: Option<ShellCredentials>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub serial_device: Option<String>,
    #[serde(default = "default_baud")]
    pub serial_baud_rate: u32,
    #[serde(default)]
    pub status: BoardStatus,
    #[serde(default)]
    pub health: BoardHealth,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flash_station_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_firmware_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_flash_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_test_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<String>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub peripherals: Vec<String>,
    #[serde(default)]
    pub maintenance: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_probe_at: Option<DateTime<Utc>>,
}

fn default_baud() -> u32 {
    115_200
}

impl Board {
    pub fn supports_architecture(&self, arch: &str) -> bool {
        self.architecture.eq_ignore_ascii_case(arch)
    }

    pub fn is_available(&self) -> bool {
        self.status == BoardStatus::Available && !self.maintenance && self.health.is_healthy()
    }

    /// Selection admits available and never-probed boards, never boards that
    /// are flashing, offline, or mid-recovery.
    pub fn can_be_allocated(&self) -> bool {
        matches!(self.status, BoardStatus::Available | BoardStatus::Unknown) && !self.maintenance
    }

    pub fn has_peripherals(&self, required: &[String]) -> bool {
        required.iter().all(|need| {
            self.peripherals
                .iter()
                .any(|have| have.eq_ignore_ascii_case(need))
        })
    }

    pub fn matches_type(&self, board_types: &[String]) -> bool {
        board_types.is_empty()
            || board_types
                .iter()
                .any(|t| t.eq_ignore_ascii_case(&self.board_type))
    }
}

// ---------------------------------------------------------------------------
// Assets (unified view)
// ---------------------------------------------------------------------------

/// Any managed asset, as stored by the registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum Asset {
    BuildServer(BuildServer),
    VirtHost(VirtHost),
    Board(Board),
}

impl Asset {
    pub fn id(&self) -> &str {
        match self {
            Asset::BuildServer(s) => &s.id,
            Asset::VirtHost(h) => &h.id,
            Asset::Board(b) => &b.id,
        }
    }

    pub fn kind(&self) -> AssetKind {
        match self {
            Asset::BuildServer(_) => AssetKind::BuildServer,
            Asset::VirtHost(_) => AssetKind::VirtHost,
            Asset::Board(_) => AssetKind::Board,
        }
    }

    pub fn group_id(&self) -> Option<&str> {
        match self {
            Asset::BuildServer(s) => s.group_id.as_deref(),
            Asset::VirtHost(h) => h.group_id.as_deref(),
            Asset::Board(b) => b.group_id.as_deref(),
        }
    }

    pub fn labels(&self) -> &BTreeMap<String, String> {
        match self {
            Asset::BuildServer(s) => &s.labels,
            Asset::VirtHost(h) => &h.labels,
            Asset::Board(b) => &b.labels,
        }
    }

    pub fn maintenance(&self) -> bool {
        match self {
            Asset::BuildServer(s) => s.maintenance,
            Asset::VirtHost(h) => h.maintenance,
            Asset::Board(b) => b.maintenance,
        }
    }

    pub fn health_level(&self) -> HealthLevel {
        match self {
            Asset::BuildServer(s) => s.health_level,
            Asset::VirtHost(h) => h.health_level,
            Asset::Board(b) => b.health.connectivity,
        }
    }

    pub fn utilization(&self) -> Option<ResourceUtilization> {
        match self {
            Asset::BuildServer(s) => Some(s.utilization),
            Asset::VirtHost(h) => Some(h.utilization),
            Asset::Board(_) => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Build jobs
// ---------------------------------------------------------------------------

/// Queue priority of a build job. Declared in ascending order so the derive
/// gives urgent > high > normal > low.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobPriority {
    Low,
    #[default]
    Normal,
    High,
    Urgent,
}

/// How to drive the build on the server.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BuildConfig {
    /// defconfig name or path; `None` runs the custom command sequences.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kernel_config: Option<String>,
    #[serde(default)]
    pub extra_make_args: Vec<String>,
    #[serde(default = "default_true")]
    pub enable_modules: bool,
    #[serde(default = "default_true")]
    pub build_dtbs: bool,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Verbatim command sequences for the custom build path.
    #[serde(default)]
    pub pre_build_commands: Vec<String>,
    #[serde(default)]
    pub build_commands: Vec<String>,
    #[serde(default)]
    pub post_build_commands: Vec<String>,
}

impl BuildConfig {
    pub fn is_custom(&self) -> bool {
        self.kernel_config.is_none() && !self.build_commands.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildJobStatus {
    #[default]
    Queued,
    Building,
    Completed,
    Failed,
    Cancelled,
}

impl BuildJobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            BuildJobStatus::Completed | BuildJobStatus::Failed | BuildJobStatus::Cancelled
        )
    }
}

/// A kernel/BSP build job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildJob {
    pub id: String,
    pub source_repository: String,
    pub branch: String,
    pub commit_hash: String,
    pub target_architecture: String,
    pub build_config: BuildConfig,
    #[serde(default)]
    pub status: BuildJobStatus,
    #[serde(default)]
    pub priority: JobPriority,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_id: Option<String>,
    #[serde(default)]
    pub artifact_ids: Vec<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_seconds: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl BuildJob {
    pub fn is_active(&self) -> bool {
        matches!(self.status, BuildJobStatus::Queued | BuildJobStatus::Building)
    }
}

// ---------------------------------------------------------------------------
// Artifacts
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    KernelImage,
    Initrd,
    Rootfs,
    DeviceTree,
    KernelModules,
    BuildLog,
}

/// A content-addressed build output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    pub id: String,
    pub build_id: String,
    pub kind: ArtifactKind,
    pub filename: String,
    pub path: String,
    pub size_bytes: u64,
    pub sha256: String,
    pub architecture: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl Artifact {
    pub fn matches_architecture(&self, arch: &str) -> bool {
        self.architecture.eq_ignore_ascii_case(arch)
    }
}

/// Which artifacts a deployment or pipeline wants. Valid when at least one
/// selector is set; `branch` requires `use_latest`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ArtifactSelection {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    #[serde(default)]
    pub use_latest: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub architecture: Option<String>,
}

impl ArtifactSelection {
    pub fn for_build(build_id: impl Into<String>) -> Self {
        Self {
            build_id: Some(build_id.into()),
            ..Self::default()
        }
    }

    pub fn is_valid(&self) -> bool {
        self.build_id.is_some()
            || self.commit_hash.is_some()
            || (self.branch.is_some() && self.use_latest)
    }
}

// ---------------------------------------------------------------------------
// Deployments
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentTarget {
    VirtHost,
    Board,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentStatus {
    #[default]
    Pending,
    Transferring,
    Flashing,
    Booting,
    Verifying,
    Completed,
    Failed,
    RolledBack,
}

/// A transfer + boot + verify of build artifacts onto a target.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Deployment {
    pub id: String,
    pub target: DeploymentTarget,
    pub target_id: String,
    pub build_id: String,
    pub artifact_ids: Vec<String>,
    #[serde(default)]
    pub status: DeploymentStatus,
    #[serde(default)]
    pub boot_verified: bool,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// Every status transition with its timestamp, oldest first.
    #[serde(default)]
    pub transitions: Vec<DeploymentTransition>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentTransition {
    pub status: DeploymentStatus,
    pub at: DateTime<Utc>,
}

impl Deployment {
    pub fn is_active(&self) -> bool {
        matches!(
            self.status,
            DeploymentStatus::Pending
                | DeploymentStatus::Transferring
                | DeploymentStatus::Flashing
                | DeploymentStatus::Booting
                | DeploymentStatus::Verifying
        )
    }

    pub fn is_successful(&self) -> bool {
        self.status == DeploymentStatus::Completed && self.boot_verified
    }

    pub fn can_rollback(&self) -> bool {
        matches!(
            self.status,
            DeploymentStatus::Completed | DeploymentStatus::Failed
        )
    }
}

// ---------------------------------------------------------------------------
// Pipelines
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvironmentKind {
    Virt,
    Board,
}

/// The fixed stage order of a pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageType {
    Build,
    Deploy,
    Boot,
    Test,
}

impl StageType {
    pub const ORDER: [StageType; 4] = [
        StageType::Build,
        StageType::Deploy,
        StageType::Boot,
        StageType::Test,
    ];

    pub fn name(self) -> &'static str {
        match self {
            StageType::Build => "build",
            StageType::Deploy => "deploy",
            StageType::Boot => "boot",
            StageType::Test => "test",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

/// One stage of a pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineStage {
    pub stage_type: StageType,
    #[serde(default)]
    pub status: StageStatus,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default = "default_stage_retries")]
    pub max_retries: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Identifier of what the stage produced (build id, deployment id, ...).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

fn default_stage_retries() -> u32 {
    2
}

impl PipelineStage {
    pub fn new(stage_type: StageType, max_retries: u32) -> Self {
        Self {
            stage_type,
            status: StageStatus::Pending,
            retry_count: 0,
            max_retries,
            started_at: None,
            completed_at: None,
            output_id: None,
            error_message: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl PipelineStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            PipelineStatus::Completed | PipelineStatus::Failed | PipelineStatus::Cancelled
        )
    }
}

/// An end-to-end build, deploy, boot, test run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pipeline {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub source_repository: String,
    pub branch: String,
    pub commit_hash: String,
    pub target_architecture: String,
    pub environment: EnvironmentKind,
    #[serde(default)]
    pub environment_config: BTreeMap<String, String>,
    pub stages: Vec<PipelineStage>,
    #[serde(default)]
    pub status: PipelineStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_stage: Option<StageType>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl Pipeline {
    pub fn stage(&self, stage_type: StageType) -> Option<&PipelineStage> {
        self.stages.iter().find(|s| s.stage_type == stage_type)
    }

    pub fn stage_mut(&mut self, stage_type: StageType) -> Option<&mut PipelineStage> {
        self.stages.iter_mut().find(|s| s.stage_type == stage_type)
    }

    pub fn next_pending_stage(&self) -> Option<StageType> {
        self.stages
            .iter()
            .find(|s| s.status == StageStatus::Pending)
            .map(|s| s.stage_type)
    }

    pub fn is_active(&self) -> bool {
        matches!(self.status, PipelineStatus::Pending | PipelineStatus::Running)
    }
}

// ---------------------------------------------------------------------------
// Resource groups and allocations
// ---------------------------------------------------------------------------

/// Allocation policy attached to a resource group.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AllocationPolicy {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_concurrent_allocations: Option<u32>,
    #[serde(default)]
    pub reserved_for_teams: Vec<String>,
    #[serde(default)]
    pub priority_boost: i32,
    #[serde(default)]
    pub require_approval: bool,
    #[serde(default, with = "humantime_serde", skip_serializing_if = "Option::is_none")]
    pub max_allocation_duration: Option<Duration>,
}

impl AllocationPolicy {
    pub fn allows_team(&self, team: &str) -> bool {
        self.reserved_for_teams.is_empty() || self.reserved_for_teams.iter().any(|t| t == team)
    }

    pub fn can_allocate(&self, current_open: u32) -> bool {
        match self.max_concurrent_allocations {
            Some(max) => current_open < max,
            None => true,
        }
    }
}

/// A named partition of assets of one kind.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceGroup {
    pub id: String,
    pub name: String,
    pub kind: AssetKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub policy: AllocationPolicy,
    #[serde(default)]
    pub member_ids: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ResourceGroup {
    pub fn has_member(&self, resource_id: &str) -> bool {
        self.member_ids.iter().any(|m| m == resource_id)
    }
}

/// A policy-governed binding of a resource to a requester.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Allocation {
    pub id: String,
    pub group_id: String,
    pub resource_id: String,
    pub requester: String,
    pub team: String,
    pub allocated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub released_at: Option<DateTime<Utc>>,
}

impl Allocation {
    pub fn is_open(&self) -> bool {
        self.released_at.is_none()
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.is_open() && self.expires_at.is_some_and(|exp| exp <= now)
    }
}

// ---------------------------------------------------------------------------
// Alerts and health events
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertSeverity {
    Info,
    Warning,
    Error,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertStatus {
    #[default]
    Active,
    Acknowledged,
    Resolved,
    Suppressed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertCategory {
    Connectivity,
    Utilization,
    Temperature,
    Provisioning,
    Capacity,
    Flash,
}

/// Delivery channel for alert routing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelKind {
    Dashboard,
    Email,
    Webhook,
    Chat,
}

/// Outcome of one channel delivery attempt, recorded on the alert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryRecord {
    pub channel: ChannelKind,
    pub delivered: bool,
    pub at: DateTime<Utc>,
}

/// An infrastructure alert.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub id: String,
    pub resource_id: String,
    pub resource_kind: AssetKind,
    pub severity: AlertSeverity,
    pub category: AlertCategory,
    #[serde(default)]
    pub status: AlertStatus,
    pub title: String,
    pub message: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub acknowledged_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub acknowledged_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_by: Option<String>,
    /// Milliseconds between the degradation being observable and this
    /// alert being recorded. The contract bound is 30 000 ms.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generation_latency_ms: Option<u64>,
    #[serde(default)]
    pub deliveries: Vec<DeliveryRecord>,
}

impl Alert {
    pub fn is_active(&self) -> bool {
        self.status == AlertStatus::Active
    }

    pub fn acknowledge(&mut self, actor: &str, at: DateTime<Utc>) {
        self.status = AlertStatus::Acknowledged;
        self.acknowledged_at = Some(at);
        self.acknowledged_by = Some(actor.to_string());
        self.updated_at = at;
    }

    pub fn resolve(&mut self, actor: &str, at: DateTime<Utc>) {
        self.status = AlertStatus::Resolved;
        self.resolved_at = Some(at);
        self.resolved_by = Some(actor.to_string());
        self.updated_at = at;
    }
}

/// A health degradation observed by the probe loop, handed to the alert
/// service over a bounded channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthEvent {
    pub resource_id: String,
    pub resource_kind: AssetKind,
    pub previous_level: HealthLevel,
    pub level: HealthLevel,
    pub categories: Vec<AlertCategory>,
    pub message: String,
    pub detected_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Reservations
// ---------------------------------------------------------------------------

/// Short-lived hold on an asset taken during selection. Released on success
/// (the work transitions to a build assignment or allocation) or reaped on
/// TTL expiry. Never persisted.
#[derive(Debug, Clone)]
pub struct Reservation {
    pub id: String,
    pub asset_id: String,
    pub acquired_at: Instant,
    pub ttl: Duration,
    pub purpose: String,
}

impl Reservation {
    pub fn is_expired_at(&self, now: Instant) -> bool {
        now.duration_since(self.acquired_at) >= self.ttl
    }
}
