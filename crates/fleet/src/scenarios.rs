//! End-to-end scenarios over the full stack with mock adapters.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use fleet_alerts::AlertService;
use fleet_artifacts::ArtifactIndex;
use fleet_config::{AlertOptions, HealthConfig, PipelineOptions, Thresholds};
use fleet_health::HealthMonitor;
use fleet_registry::Registry;
use fleet_select::board::{BoardRequirements, BoardSelector};
use fleet_select::build::{BuildRequirements, BuildServerSelector};
use fleet_transport::mock::{MockPower, MockShell};
use fleet_transport::pool::ShellPool;
use fleet_transport::CancelToken;
use fleet_types::{
    AlertCategory, AlertSeverity, ArtifactKind, ArtifactSelection, Asset, BuildJobStatus,
    DeploymentStatus, EnvironmentKind, Error, PipelineStatus, PowerMethod, StageStatus, StageType,
};

use crate::deploy::FIRMWARE_VERSION_KEY;
use crate::events::EventLog;
use crate::executor::ShellBuildRunner;
use crate::pipeline::{BuildStageHandler, PipelineEngine, PipelineSpec};
use crate::queue::{BuildJobManager, NewBuildJob};
use crate::test_support::{
    deploy_fixture, fast_pool_config, fast_queue_config, ingest_kernel, sample_board_asset,
    sample_server, sample_server_asset, toolchain, wait_until, StubBehavior, StubRunner,
};

/// S1: a registered build server takes a job end to end and the kernel
/// image lands in the artifact index.
#[tokio::test(start_paused = true)]
async fn s1_build_job_end_to_end() {
    let registry = Arc::new(Registry::new());
    let mut server = sample_server("srv-h", "arm64");
    server.toolchains = vec![
        toolchain("aarch64-gcc-12", "arm64"),
        toolchain("gcc-11", "x86_64"),
    ];
    registry
        .register(Asset::BuildServer(server))
        .expect("register");

    let shell = Arc::new(MockShell::new());
    shell.put_remote_file("/b/arch/arm64/boot/Image", b"arm64 kernel");
    shell.script_exec_ok("-name Image", "/b/arch/arm64/boot/Image\n");
    let pool = Arc::new(ShellPool::new(shell.clone(), fast_pool_config()));

    let staging = tempfile::tempdir().expect("tempdir");
    let artifact_root = tempfile::tempdir().expect("tempdir");
    let artifacts = Arc::new(ArtifactIndex::new(artifact_root.path(), 30));
    let manager = Arc::new(BuildJobManager::new(
        Arc::clone(&registry),
        Arc::new(BuildServerSelector::new(Arc::clone(&registry))),
        Arc::new(ShellBuildRunner::new(
            pool,
            staging.path().to_path_buf(),
            false,
            Duration::from_secs(600),
        )),
        Arc::clone(&artifacts),
        Arc::new(EventLog::new()),
        fast_queue_config(),
        None,
    ));

    let job = manager
        .submit(NewBuildJob::simple(
            "https://git.example/linux.git",
            "main",
            "c0ffee",
            "arm64",
        ))
        .await
        .expect("submit");

    assert_eq!(job.status, BuildJobStatus::Building);
    assert_eq!(job.server_id.as_deref(), Some("srv-h"));
    assert_eq!(
        registry.server("srv-h").expect("server").active_build_count,
        1
    );

    wait_until(|| manager.job(&job.id).expect("job").status == BuildJobStatus::Completed).await;

    let done = manager.job(&job.id).expect("job");
    assert!(done.completed_at.is_some());
    assert_eq!(
        registry.server("srv-h").expect("server").active_build_count,
        0
    );
    let indexed = artifacts.by_build(&job.id);
    assert!(
        indexed
            .iter()
            .any(|a| a.kind == ArtifactKind::KernelImage && a.architecture == "arm64")
    );
}

/// S2: with identical utilization, the server with fewer active builds
/// wins selection.
#[tokio::test]
async fn s2_less_loaded_server_wins() {
    let registry = Arc::new(Registry::new());
    let mut busy = sample_server("srv-h2", "arm64");
    busy.active_build_count = 3;
    let idle = sample_server("srv-h1", "arm64");
    registry.register(Asset::BuildServer(busy)).expect("register");
    registry.register(Asset::BuildServer(idle)).expect("register");

    let selector = BuildServerSelector::new(registry);
    let selection = selector
        .select(&BuildRequirements::for_architecture("arm64"))
        .expect("select");
    assert_eq!(selection.server.id, "srv-h1");
}

/// S3: a build stage that keeps failing exhausts its retries, fails the
/// pipeline, and skips every later stage.
#[tokio::test(start_paused = true)]
async fn s3_failing_build_stage_fails_pipeline() {
    let registry = Arc::new(Registry::new());
    registry
        .register(sample_server_asset("srv-1", "x86_64"))
        .expect("register");

    let runner = Arc::new(StubRunner::new());
    for _ in 0..3 {
        runner.script(StubBehavior::Fail("defconfig not found".to_string()));
    }
    let artifact_root = tempfile::tempdir().expect("tempdir");
    let queue = Arc::new(BuildJobManager::new(
        Arc::clone(&registry),
        Arc::new(BuildServerSelector::new(Arc::clone(&registry))),
        runner,
        Arc::new(ArtifactIndex::new(artifact_root.path(), 30)),
        Arc::new(EventLog::new()),
        fast_queue_config(),
        None,
    ));

    let engine = PipelineEngine::new(PipelineOptions::default(), Arc::new(EventLog::new()), None);
    engine.register_handler(StageType::Build, Arc::new(BuildStageHandler::new(queue)));

    let pipeline = engine
        .create(PipelineSpec::simple(
            "https://git.example/linux.git",
            "main",
            "c0ffee",
            "x86_64",
            EnvironmentKind::Virt,
        ))
        .expect("create");
    let result = engine.run(&pipeline.id).await.expect("run");

    assert_eq!(result.status, PipelineStatus::Failed);
    assert!(result.error_message.as_deref().unwrap_or("").contains("build"));
    for stage in [StageType::Deploy, StageType::Boot, StageType::Test] {
        assert_eq!(
            result.stage(stage).expect("stage").status,
            StageStatus::Skipped
        );
    }
}

/// S4: a warm board degrades with a temperature finding; the alert comes
/// out once and the repeat probe stays quiet.
#[tokio::test]
async fn s4_temperature_alert_with_dedup() {
    let registry = Arc::new(Registry::new());
    registry
        .register(sample_board_asset("brd-b", "arm64", PowerMethod::UsbHub))
        .expect("register");

    let shell = Arc::new(MockShell::new());
    shell.script_exec_ok("echo", "storage=40 temp=72");
    shell.script_exec_ok("echo", "storage=40 temp=72");
    let pool = Arc::new(ShellPool::new(shell, fast_pool_config()));

    let (events_tx, mut events_rx) = mpsc::channel(16);
    let monitor = Arc::new(HealthMonitor::new(
        Arc::clone(&registry),
        pool,
        Arc::new(MockPower::new()),
        HealthConfig::default(),
        Thresholds::default(),
        events_tx,
        Duration::from_secs(30),
    ));
    let alerts = AlertService::new(AlertOptions::default());

    // First probe: degraded, one temperature alert.
    monitor.probe_asset("brd-b").await.expect("probe");
    let event = events_rx.try_recv().expect("event");
    let outcomes = alerts.handle_event(event).await.expect("handle");
    let alert = outcomes[0].created().expect("created");
    assert_eq!(alert.severity, AlertSeverity::Warning);
    assert_eq!(alert.category, AlertCategory::Temperature);

    // Second probe inside the cool-down: same level, no new alert.
    monitor.probe_asset("brd-b").await.expect("probe");
    assert!(events_rx.try_recv().is_err());
    assert_eq!(alerts.active_count(), 1);
}

/// S5: allocation policy enforces the concurrency cap and the team
/// reservation with distinct rejection reasons.
#[tokio::test]
async fn s5_policy_rejections() {
    use crate::groups::{AllocationRequest, GroupManager, NewGroup};
    use fleet_types::{AllocationPolicy, AssetKind};

    let registry = Arc::new(Registry::new());
    let manager = GroupManager::new(Arc::clone(&registry), fleet_config::GroupOptions::default());
    let group = manager
        .create_group(NewGroup {
            name: "kernel-ci".to_string(),
            kind: AssetKind::BuildServer,
            description: None,
            labels: BTreeMap::new(),
            policy: AllocationPolicy {
                max_concurrent_allocations: Some(2),
                reserved_for_teams: vec!["kernel".to_string()],
                ..AllocationPolicy::default()
            },
        })
        .expect("create");
    for id in ["srv-1", "srv-2", "srv-3"] {
        registry
            .register(sample_server_asset(id, "arm64"))
            .expect("register");
        manager.add_member(&group.id, id).expect("add");
    }

    let request = |team: &str| AllocationRequest {
        group_id: group.id.clone(),
        resource_id: None,
        requester: "ci".to_string(),
        team: team.to_string(),
        duration: None,
    };

    assert!(manager.allocate(request("kernel")).is_ok());
    assert!(manager.allocate(request("kernel")).is_ok());
    match manager.allocate(request("kernel")) {
        Err(Error::Conflict(message)) => assert!(message.contains("max concurrent")),
        other => panic!("expected cap rejection, got {:?}", other),
    }
    match manager.allocate(request("storage")) {
        Err(Error::Conflict(message)) => assert!(message.contains("teams")),
        other => panic!("expected team rejection, got {:?}", other),
    }
}

/// S6: a board on firmware v1 selected for a v2 request reports that a
/// flash is needed, and the deployment leaves it on v2.
#[tokio::test(start_paused = true)]
async fn s6_firmware_upgrade_flow() {
    let f = deploy_fixture();
    let mut board = sample_board_asset("brd-1", "arm64", PowerMethod::UsbHub);
    if let Asset::Board(b) = &mut board {
        b.current_firmware_version = Some("v1".to_string());
    }
    f.registry.register(board).expect("register");

    let artifact = ingest_kernel(&f.artifacts, "bld-v2", "arm64", b"firmware v2").await;
    f.artifacts
        .annotate(&artifact.id, FIRMWARE_VERSION_KEY, "v2")
        .expect("annotate");

    // Selection reports the firmware gap.
    let selector = BoardSelector::new(Arc::clone(&f.registry));
    let mut requirements = BoardRequirements::for_architecture("arm64");
    requirements.firmware_version = Some("v2".to_string());
    let selection = selector.select(&requirements).expect("select");
    assert!(selection.requires_flashing);
    selector.release(&selection.reservation.id);

    // The deployment flashes, boots, verifies, and records v2.
    let deployment = f
        .manager
        .deploy_to_board(
            "brd-1",
            &ArtifactSelection::for_build("bld-v2"),
            &CancelToken::none(),
        )
        .await
        .expect("deploy");

    assert_eq!(deployment.status, DeploymentStatus::Completed);
    let statuses: Vec<DeploymentStatus> =
        deployment.transitions.iter().map(|t| t.status).collect();
    assert!(statuses.contains(&DeploymentStatus::Flashing));
    assert!(statuses.contains(&DeploymentStatus::Booting));
    assert!(statuses.contains(&DeploymentStatus::Verifying));

    assert_eq!(
        f.registry
            .board("brd-1")
            .expect("board")
            .current_firmware_version
            .as_deref(),
        Some("v2")
    );
}
