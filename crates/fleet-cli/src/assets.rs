//! Asset intake file parsing.
//!
//! Operators describe their fleet in a TOML file and import it into the
//! state directory. The intake specs carry only what an operator knows;
//! runtime fields (status, health, counters, timestamps) start at their
//! defaults.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::Utc;
use serde::Deserialize;

use fleet_types::{
    Asset, Board, BoardHealth, BoardStatus, BuildServer, HealthLevel, PowerControlConfig,
    ResourceUtilization, ServerStatus, ShellCredentials, Toolchain, VirtHost,
};

/// The whole intake file.
#[derive(Debug, Default, Deserialize)]
pub struct FleetFile {
    #[serde(default)]
    pub build_servers: Vec<ServerSpec>,
    #[serde(default)]
    pub hosts: Vec<HostSpec>,
    #[serde(default)]
    pub boards: Vec<BoardSpec>,
}

impl FleetFile {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read assets file {}", path.display()))?;
        toml::from_str(&content)
            .with_context(|| format!("failed to parse assets file {}", path.display()))
    }

    /// Convert every spec into a registrable asset.
    pub fn into_assets(self) -> Vec<Asset> {
        let mut assets = Vec::new();
        for spec in self.build_servers {
            assets.push(Asset::BuildServer(spec.into_server()));
        }
        for spec in self.hosts {
            assets.push(Asset::VirtHost(spec.into_host()));
        }
        for spec in self.boards {
            assets.push(Asset::Board(spec.into_board()));
        }
        assets
    }
}

#[derive(Debug, Deserialize)]
pub struct ServerSpec {
    pub id: String,
    pub hostname: String,
    pub credentials: ShellCredentials,
    #[serde(default)]
    pub architectures: Vec<String>,
    #[serde(default)]
    pub toolchains: Vec<Toolchain>,
    pub cpu_cores: u32,
    pub memory_mb: u64,
    pub storage_gb: u64,
    #[serde(default = "default_max_builds")]
    pub max_concurrent_builds: u32,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

fn default_max_builds() -> u32 {
    4
}

impl ServerSpec {
    fn into_server(self) -> BuildServer {
        let now = Utc::now();
        BuildServer {
            id: self.id,
            hostname: self.hostname,
            credentials: self.credentials,
            supported_architectures: self.architectures,
            toolchains: self.toolchains,
            total_cpu_cores: self.cpu_cores,
            total_memory_mb: self.memory_mb,
            total_storage_gb: self.storage_gb,
            status: ServerStatus::Unknown,
            health_level: HealthLevel::Unknown,
            utilization: ResourceUtilization::default(),
            active_build_count: 0,
            max_concurrent_builds: self.max_concurrent_builds,
            queue_depth: 0,
            group_id: None,
            labels: self.labels,
            maintenance: false,
            created_at: now,
            updated_at: now,
            last_probe_at: None,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct HostSpec {
    pub id: String,
    pub hostname: String,
    pub credentials: ShellCredentials,
    pub architecture: String,
    pub cpu_cores: u32,
    pub memory_mb: u64,
    pub storage_gb: u64,
    #[serde(default)]
    pub hw_assist: bool,
    #[serde(default)]
    pub nested_virt: bool,
    #[serde(default = "default_max_guests")]
    pub max_guests: u32,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

fn default_max_guests() -> u32 {
    10
}

impl HostSpec {
    fn into_host(self) -> VirtHost {
        let now = Utc::now();
        VirtHost {
            id: self.id,
            hostname: self.hostname,
            credentials: self.credentials,
            architecture: self.architecture,
            total_cpu_cores: self.cpu_cores,
            total_memory_mb: self.memory_mb,
            total_storage_gb: self.storage_gb,
            status: ServerStatus::Unknown,
            health_level: HealthLevel::Unknown,
            hw_assist: self.hw_assist,
            nested_virt: self.nested_virt,
            utilization: ResourceUtilization::default(),
            running_guest_count: 0,
            max_guests: self.max_guests,
            group_id: None,
            labels: self.labels,
            maintenance: false,
            created_at: now,
            updated_at: now,
            last_probe_at: None,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct BoardSpec {
    pub id: String,
    pub name: String,
    pub board_type: String,
    pub architecture: String,
    pub power_control: PowerControlConfig,
    #[serde(default)]
    pub credentials: Option<ShellCredentials>,
    #[serde(default)]
    pub serial_device: Option<String>,
    #[serde(default = "default_baud")]
    pub serial_baud_rate: u32,
    #[serde(default)]
    pub flash_station_id: Option<String>,
    #[serde(default)]
    pub peripherals: Vec<String>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

fn default_baud() -> u32 {
    115_200
}

impl BoardSpec {
    fn into_board(self) -> Board {
        let now = Utc::now();
        Board {
            id: self.id,
            name: self.name,
            board_type: self.board_type,
            architecture: self.architecture,
            power_control: self.power_control,
            serial_number: None,
            credentials: self.credentials,
            serial_device: self.serial_device,
            serial_baud_rate: self.serial_baud_rate,
            status: BoardStatus::Unknown,
            health: BoardHealth::default(),
            flash_station_id: self.flash_station_id,
            current_firmware_version: None,
            last_flash_at: None,
            assigned_test_id: None,
            group_id: None,
            labels: self.labels,
            peripherals: self.peripherals,
            maintenance: false,
            created_at: now,
            updated_at: now,
            last_probe_at: None,
        }
    }
}
