//! Shared fixtures for the core's tests.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use fleet_artifacts::{ArtifactIndex, BuildMeta};
use fleet_config::{DeploymentOptions, QueueConfig};
use fleet_registry::Registry;
use fleet_retry::{BackoffConfig, BackoffStrategy};
use fleet_transport::mock::{MockFlash, MockPower, MockSerial, MockShell, MockVirt};
use fleet_transport::pool::{PoolConfig, ShellPool};
use fleet_transport::CancelToken;
use fleet_types::{
    Artifact, ArtifactKind, Asset, Board, BoardHealth, BoardStatus, BuildConfig, BuildJob,
    BuildJobStatus, BuildServer, HealthLevel, JobPriority, PowerControlConfig, PowerMethod,
    ResourceUtilization, ServerStatus, ShellCredentials, Toolchain, VirtHost,
};

use crate::deploy::DeploymentManager;
use crate::events::EventLog;
use crate::executor::{ArtifactDraft, BuildRunner};
use crate::logs::LogBuffer;

pub fn utc(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(secs, 0).expect("timestamp")
}

pub fn creds(host: &str) -> ShellCredentials {
    ShellCredentials {
        hostname: host.to_string(),
        username: "fleet".to_string(),
        port: 22,
        key_path: None,
    }
}

pub fn toolchain(name: &str, arch: &str) -> Toolchain {
    Toolchain {
        name: name.to_string(),
        version: "12.3".to_string(),
        target_architecture: arch.to_string(),
        path: format!("/opt/toolchains/{}", name),
        available: true,
    }
}

pub fn sample_server(id: &str, arch: &str) -> BuildServer {
    BuildServer {
        id: id.to_string(),
        hostname: id.to_string(),
        credentials: creds(&format!("{}.lab", id)),
        supported_architectures: vec![arch.to_string()],
        toolchains: vec![toolchain("cross-gcc", arch)],
        total_cpu_cores: 8,
        total_memory_mb: 16_384,
        total_storage_gb: 500,
        status: ServerStatus::Online,
        health_level: HealthLevel::Healthy,
        utilization: ResourceUtilization::default(),
        active_build_count: 0,
        max_concurrent_builds: 4,
        queue_depth: 0,
        group_id: None,
        labels: BTreeMap::new(),
        maintenance: false,
        created_at: utc(0),
        updated_at: utc(0),
        last_probe_at: None,
    }
}

pub fn sample_server_asset(id: &str, arch: &str) -> Asset {
    Asset::BuildServer(sample_server(id, arch))
}

pub fn sample_host(id: &str, arch: &str) -> VirtHost {
    VirtHost {
        id: id.to_string(),
        hostname: id.to_string(),
        credentials: creds(&format!("{}.lab", id)),
        architecture: arch.to_string(),
        total_cpu_cores: 16,
        total_memory_mb: 32_768,
        total_storage_gb: 1000,
        status: ServerStatus::Online,
        health_level: HealthLevel::Healthy,
        hw_assist: true,
        nested_virt: false,
        utilization: ResourceUtilization::default(),
        running_guest_count: 0,
        max_guests: 10,
        group_id: None,
        labels: BTreeMap::new(),
        maintenance: false,
        created_at: utc(0),
        updated_at: utc(0),
        last_probe_at: None,
    }
}

pub fn sample_host_asset(id: &str, arch: &str) -> Asset {
    Asset::VirtHost(sample_host(id, arch))
}

pub fn sample_board(id: &str, arch: &str, method: PowerMethod) -> Board {
    Board {
        id: id.to_string(),
        name: id.to_string(),
        board_type: "raspberry_pi_4".to_string(),
        architecture: arch.to_string(),
        power_control: PowerControlConfig {
            method,
            usb_hub_port: Some(1),
            ..PowerControlConfig::manual()
        },
        serial_number: None,
        credentials: Some(creds(&format!("{}.lab", id))),
        serial_device: None,
        serial_baud_rate: 115_200,
        status: BoardStatus::Available,
        health: BoardHealth {
            connectivity: HealthLevel::Healthy,
            ..BoardHealth::default()
        },
        flash_station_id: None,
        current_firmware_version: None,
        last_flash_at: None,
        assigned_test_id: None,
        group_id: None,
        labels: BTreeMap::new(),
        peripherals: Vec::new(),
        maintenance: false,
        created_at: utc(0),
        updated_at: utc(0),
        last_probe_at: None,
    }
}

pub fn sample_board_asset(id: &str, arch: &str, method: PowerMethod) -> Asset {
    Asset::Board(sample_board(id, arch, method))
}

pub fn sample_job(id: &str, arch: &str) -> BuildJob {
    BuildJob {
        id: id.to_string(),
        source_repository: "https://git.example/linux.git".to_string(),
        branch: "main".to_string(),
        commit_hash: "c0ffee".to_string(),
        target_architecture: arch.to_string(),
        build_config: BuildConfig {
            kernel_config: Some("defconfig".to_string()),
            ..BuildConfig::default()
        },
        status: BuildJobStatus::Building,
        priority: JobPriority::Normal,
        server_id: None,
        artifact_ids: Vec::new(),
        created_at: utc(0),
        started_at: None,
        completed_at: None,
        duration_seconds: None,
        error_message: None,
    }
}

pub fn fast_pool_config() -> PoolConfig {
    PoolConfig {
        max_per_key: 2,
        connect_timeout: Duration::from_secs(5),
        retry: BackoffConfig {
            strategy: BackoffStrategy::Immediate,
            max_attempts: 3,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            jitter: 0.0,
        },
    }
}

pub fn fast_queue_config() -> QueueConfig {
    QueueConfig {
        max_size: 100,
        tick_seconds: 1,
    }
}

/// Poll a condition under the paused clock until it holds.
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..10_000 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
        tokio::task::yield_now().await;
    }
    panic!("condition never held");
}

/// Scripted in-process build runner for queue tests.
pub enum StubBehavior {
    Succeed,
    Fail(String),
    HangUntilCancel,
}

pub struct StubRunner {
    behaviors: Mutex<VecDeque<StubBehavior>>,
    staging: tempfile::TempDir,
}

impl StubRunner {
    pub fn new() -> Self {
        Self {
            behaviors: Mutex::new(VecDeque::new()),
            staging: tempfile::tempdir().expect("tempdir"),
        }
    }

    pub fn script(&self, behavior: StubBehavior) {
        self.behaviors.lock().expect("stub lock").push_back(behavior);
    }
}

#[async_trait]
impl BuildRunner for StubRunner {
    async fn run(
        &self,
        job: &BuildJob,
        _server: &BuildServer,
        logs: &LogBuffer,
        cancel: &CancelToken,
    ) -> fleet_types::Result<Vec<ArtifactDraft>> {
        let behavior = self
            .behaviors
            .lock()
            .expect("stub lock")
            .pop_front()
            .unwrap_or(StubBehavior::Succeed);
        logs.append(format!("stub build for {}", job.id));
        match behavior {
            StubBehavior::Succeed => {
                let path = self.staging.path().join(format!("{}-Image", job.id));
                std::fs::write(&path, b"stub kernel").expect("write");
                Ok(vec![ArtifactDraft {
                    kind: ArtifactKind::KernelImage,
                    filename: "Image".to_string(),
                    local_path: path,
                }])
            }
            StubBehavior::Fail(message) => Err(fleet_types::Error::Remote(message)),
            StubBehavior::HangUntilCancel => {
                cancel.cancelled().await;
                Err(fleet_types::Error::Cancelled)
            }
        }
    }
}

/// Everything a deployment test needs, wired over mocks.
pub struct DeployFixture {
    pub registry: Arc<Registry>,
    pub shell: Arc<MockShell>,
    pub virt: Arc<MockVirt>,
    pub power: Arc<MockPower>,
    pub flash: Arc<MockFlash>,
    pub serial: Arc<MockSerial>,
    pub artifacts: Arc<ArtifactIndex>,
    pub manager: Arc<DeploymentManager>,
    pub events: Arc<EventLog>,
    _artifact_root: tempfile::TempDir,
}

pub fn deploy_fixture() -> DeployFixture {
    let registry = Arc::new(Registry::new());
    let shell = Arc::new(MockShell::new());
    let pool = Arc::new(ShellPool::new(shell.clone(), fast_pool_config()));
    let virt = Arc::new(MockVirt::new());
    let power = Arc::new(MockPower::new());
    let flash = Arc::new(MockFlash::new());
    let serial = Arc::new(MockSerial::new());
    let artifact_root = tempfile::tempdir().expect("tempdir");
    let artifacts = Arc::new(ArtifactIndex::new(artifact_root.path(), 30));
    let events = Arc::new(EventLog::new());
    let manager = Arc::new(DeploymentManager::new(
        Arc::clone(&registry),
        Arc::clone(&artifacts),
        pool,
        virt.clone(),
        power.clone(),
        flash.clone(),
        serial.clone(),
        Arc::clone(&events),
        DeploymentOptions::default(),
    ));
    DeployFixture {
        registry,
        shell,
        virt,
        power,
        flash,
        serial,
        artifacts,
        manager,
        events,
        _artifact_root: artifact_root,
    }
}

/// Register a build and ingest one kernel image for it.
pub async fn ingest_kernel(
    artifacts: &ArtifactIndex,
    build_id: &str,
    arch: &str,
    bytes: &[u8],
) -> Artifact {
    artifacts
        .register_build(BuildMeta {
            build_id: build_id.to_string(),
            branch: "main".to_string(),
            architecture: arch.to_string(),
            commit_hash: format!("c-{}", build_id),
            created_at: Utc::now(),
        })
        .expect("register build");
    let source = tempfile::NamedTempFile::new().expect("temp file");
    std::fs::write(source.path(), bytes).expect("write");
    let artifact = artifacts
        .ingest_file(build_id, ArtifactKind::KernelImage, "Image", source.path())
        .await
        .expect("ingest");
    artifacts.finalize_build(build_id).expect("finalize");
    artifact
}
