//! Operator CLI for the fleet control plane.
//!
//! `fleet run` wires the whole stack (registry, health engine, alert
//! service, queue scheduler, deployment and pipeline managers, allocation
//! reaper, artifact retention) and runs until interrupted. The remaining
//! commands are offline: import an asset file, show the registry
//! overview, print the effective configuration.
//!
//! Only the deterministic local adapters ship in-tree; real backends
//! (ssh, libvirt, serial, PDU, vendor flashers) implement the same traits
//! out of tree and slot in here, at the composition root.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

use fleet::deploy::DeploymentManager;
use fleet::events::EventLog;
use fleet::executor::ShellBuildRunner;
use fleet::groups::GroupManager;
use fleet::pipeline::{BootStageHandler, BuildStageHandler, DeployStageHandler, PipelineEngine};
use fleet::queue::BuildJobManager;
use fleet_alerts::{AlertService, DashboardChannel, WebhookChannel};
use fleet_artifacts::ArtifactIndex;
use fleet_config::Config;
use fleet_health::HealthMonitor;
use fleet_registry::Registry;
use fleet_select::{BoardSelector, BuildServerSelector, VirtHostSelector};
use fleet_transport::mock::{MockFlash, MockPower, MockSerial, MockShell, MockVirt};
use fleet_transport::pool::{PoolConfig, ShellPool};
use fleet_transport::CancelToken;
use fleet_types::StageType;
use fleet_webhook::WebhookConfig;

mod assets;

#[derive(Parser)]
#[command(name = "fleet", version, about = "Control plane for a test-infrastructure fleet")]
struct Cli {
    /// Directory holding fleet.toml (configuration is optional).
    #[arg(long, default_value = ".")]
    config_dir: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the control plane until interrupted.
    Run,
    /// Import assets from a TOML file into the state directory.
    Import {
        /// Path to the assets file.
        #[arg(long)]
        file: PathBuf,
    },
    /// Show registry counts from the persisted state.
    Overview,
    /// Print the effective configuration.
    Config,
    /// Pilot a pipeline through the deterministic default stage handlers.
    Pipeline {
        #[arg(long)]
        repo: String,
        #[arg(long, default_value = "main")]
        branch: String,
        #[arg(long, default_value = "")]
        commit: String,
        #[arg(long)]
        arch: String,
        /// Target environment: virt or board.
        #[arg(long, default_value = "virt")]
        env: String,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = Config::load(&cli.config_dir).context("failed to load configuration")?;

    match cli.command {
        Command::Run => run_daemon(config),
        Command::Import { file } => import_assets(&config, &file),
        Command::Overview => show_overview(&config),
        Command::Config => {
            println!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
        Command::Pipeline {
            repo,
            branch,
            commit,
            arch,
            env,
        } => pilot_pipeline(&config, &repo, &branch, &commit, &arch, &env),
    }
}

/// Run one pipeline with no handlers registered: every stage goes through
/// the deterministic default, which is exactly what a dry-run needs.
fn pilot_pipeline(
    config: &Config,
    repo: &str,
    branch: &str,
    commit: &str,
    arch: &str,
    env: &str,
) -> Result<()> {
    let environment = match env {
        "virt" => fleet_types::EnvironmentKind::Virt,
        "board" => fleet_types::EnvironmentKind::Board,
        other => anyhow::bail!("unknown environment {other:?} (expected virt or board)"),
    };

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to start runtime")?;
    runtime.block_on(async {
        let engine = PipelineEngine::new(config.pipelines, Arc::new(EventLog::new()), None);
        let pipeline = engine.create(fleet::pipeline::PipelineSpec {
            name: None,
            source_repository: repo.to_string(),
            branch: branch.to_string(),
            commit_hash: commit.to_string(),
            target_architecture: arch.to_string(),
            environment,
            environment_config: Default::default(),
            max_retries: None,
        })?;
        let finished = engine.run(&pipeline.id).await?;
        println!("pipeline {}: {:?}", finished.id, finished.status);
        for stage in &finished.stages {
            println!(
                "  {:<8} {:?} {}",
                stage.stage_type.name(),
                stage.status,
                stage.output_id.as_deref().unwrap_or("-")
            );
        }
        Ok(())
    })
}

fn import_assets(config: &Config, file: &PathBuf) -> Result<()> {
    let fleet_file = assets::FleetFile::load(file)?;
    let registry = Registry::load_from(&config.state.dir)
        .with_context(|| format!("failed to load state from {}", config.state.dir.display()))?;

    let mut imported = 0usize;
    for asset in fleet_file.into_assets() {
        let id = asset.id().to_string();
        match registry.register(asset) {
            Ok(()) => imported += 1,
            Err(error) => warn!(asset = %id, %error, "skipping asset"),
        }
    }
    registry
        .save_to(&config.state.dir)
        .context("failed to persist imported assets")?;
    println!(
        "imported {} asset(s) into {}",
        imported,
        config.state.dir.display()
    );
    Ok(())
}

fn show_overview(config: &Config) -> Result<()> {
    let registry = Registry::load_from(&config.state.dir)
        .with_context(|| format!("failed to load state from {}", config.state.dir.display()))?;
    let overview = registry.overview();
    println!("build servers: {}/{} ready ({} in maintenance)",
        overview.build_servers.ready, overview.build_servers.total, overview.build_servers.maintenance);
    println!("virt hosts:    {}/{} ready ({} in maintenance)",
        overview.virt_hosts.ready, overview.virt_hosts.total, overview.virt_hosts.maintenance);
    println!("boards:        {}/{} available ({} in use, {} in maintenance)",
        overview.boards.ready, overview.boards.total, overview.boards_in_use, overview.boards.maintenance);
    println!("active builds: {}", overview.active_builds);
    println!("running guests: {}", overview.running_guests);
    Ok(())
}

fn run_daemon(config: Config) -> Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start runtime")?;
    runtime.block_on(daemon(config))
}

async fn daemon(config: Config) -> Result<()> {
    let state_dir = config.state.dir.clone();
    let registry = Arc::new(
        Registry::load_from(&state_dir)
            .with_context(|| format!("failed to load state from {}", state_dir.display()))?,
    );
    info!(assets = registry.len(), state_dir = %state_dir.display(), "registry loaded");

    // Adapter stack. The deterministic local set stands in until real
    // backends are wired here.
    let shell = Arc::new(MockShell::new());
    let pool = Arc::new(ShellPool::new(
        shell,
        PoolConfig {
            max_per_key: config.transport.pool_max_per_key,
            connect_timeout: config.transport.connect_timeout(),
            retry: config.transport.retry.clone(),
        },
    ));
    let virt = Arc::new(MockVirt::new());
    let power = Arc::new(MockPower::new());
    let flash = Arc::new(MockFlash::new());
    let serial = Arc::new(MockSerial::new());

    let events = Arc::new(EventLog::new());
    let artifacts = Arc::new(ArtifactIndex::new(
        config.build.artifact_root.clone(),
        config.build.retention_days,
    ));

    let build_selector = Arc::new(BuildServerSelector::new(Arc::clone(&registry)));
    let host_selector = Arc::new(VirtHostSelector::new(Arc::clone(&registry)));
    let board_selector = Arc::new(BoardSelector::new(Arc::clone(&registry)));

    let runner = Arc::new(ShellBuildRunner::new(
        Arc::clone(&pool),
        state_dir.join("staging"),
        config.build.workspace_keep,
        config.transport.exec_timeout(),
    ));
    let queue = Arc::new(BuildJobManager::new(
        Arc::clone(&registry),
        Arc::clone(&build_selector),
        runner,
        Arc::clone(&artifacts),
        Arc::clone(&events),
        config.queue,
        Some(state_dir.clone()),
    ));

    let deploy = Arc::new(DeploymentManager::new(
        Arc::clone(&registry),
        Arc::clone(&artifacts),
        Arc::clone(&pool),
        virt,
        Arc::clone(&power) as Arc<dyn fleet_transport::power::PowerControl>,
        flash,
        serial,
        Arc::clone(&events),
        config.deployment,
    ));

    let pipelines = Arc::new(PipelineEngine::new(
        config.pipelines,
        Arc::clone(&events),
        Some(state_dir.clone()),
    ));
    pipelines.register_handler(
        StageType::Build,
        Arc::new(BuildStageHandler::new(Arc::clone(&queue))),
    );
    pipelines.register_handler(
        StageType::Deploy,
        Arc::new(DeployStageHandler::new(
            Arc::clone(&deploy),
            Arc::clone(&host_selector),
            Arc::clone(&board_selector),
        )),
    );
    pipelines.register_handler(
        StageType::Boot,
        Arc::new(BootStageHandler::new(Arc::clone(&deploy))),
    );

    let groups = Arc::new(GroupManager::new(
        Arc::clone(&registry),
        config.groups.clone(),
    ));

    let alerts = Arc::new(AlertService::new(config.alerts));
    alerts.register_channel(Arc::new(DashboardChannel::new()));
    if let Ok(url) = std::env::var("FLEET_ALERT_WEBHOOK_URL") {
        alerts.register_channel(Arc::new(WebhookChannel::new(WebhookConfig {
            url,
            ..WebhookConfig::default()
        })));
        info!("webhook alert channel registered");
    }

    let (event_tx, event_rx) = mpsc::channel(256);
    let monitor = Arc::new(HealthMonitor::new(
        Arc::clone(&registry),
        Arc::clone(&pool),
        power,
        config.health.clone(),
        config.thresholds,
        event_tx,
        config.transport.exec_timeout(),
    ));

    // Long-running tasks.
    let cancel = CancelToken::new();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let persister = {
        let registry = Arc::clone(&registry);
        let dir = state_dir.clone();
        tokio::spawn(async move { registry.run_persister(dir, shutdown_rx).await })
    };
    let health = tokio::spawn(Arc::clone(&monitor).run(cancel.clone()));
    let alert_monitor = {
        let alerts = Arc::clone(&alerts);
        tokio::spawn(async move { alerts.run_monitor(event_rx).await })
    };
    let scheduler = tokio::spawn(Arc::clone(&queue).run_scheduler(cancel.clone()));
    let reaper = tokio::spawn(
        Arc::clone(&groups).run_reaper(Duration::from_secs(60), cancel.clone()),
    );
    let retention = {
        let artifacts = Arc::clone(&artifacts);
        let cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_secs(24 * 3600)) => {}
                    _ = cancel.cancelled() => break,
                }
                match artifacts.run_retention(chrono::Utc::now()).await {
                    Ok(report) => info!(
                        builds = report.builds_deleted,
                        bytes = report.bytes_freed,
                        "retention pass finished"
                    ),
                    Err(error) => warn!(%error, "retention pass failed"),
                }
            }
        })
    };

    info!("fleet control plane running; ctrl-c to stop");
    tokio::signal::ctrl_c().await.context("signal handler")?;
    info!("shutting down");

    cancel.cancel();
    let _ = shutdown_tx.send(true);
    let _ = tokio::join!(health, scheduler, reaper, retention, persister);
    drop(alert_monitor);

    if let Err(error) = events.flush_to_file(&fleet::events::events_path(&state_dir)) {
        warn!(%error, "failed to flush event log");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn import_then_overview_round_trip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let assets_path = dir.path().join("assets.toml");
        std::fs::write(
            &assets_path,
            r#"
[[build_servers]]
id = "srv-1"
hostname = "build01"
architectures = ["arm64"]
cpu_cores = 8
memory_mb = 16384
storage_gb = 500

[build_servers.credentials]
hostname = "10.0.0.1"
username = "builder"
"#,
        )
        .expect("write");

        let mut config = Config::default();
        config.state.dir = dir.path().join("state");

        import_assets(&config, &assets_path).expect("import");
        let registry = Registry::load_from(&config.state.dir).expect("load");
        assert_eq!(registry.len(), 1);
        assert!(registry.server("srv-1").is_ok());

        // Re-import skips the duplicate without failing.
        import_assets(&config, &assets_path).expect("import again");
        let registry = Registry::load_from(&config.state.dir).expect("load");
        assert_eq!(registry.len(), 1);

        show_overview(&config).expect("overview");
    }
}
