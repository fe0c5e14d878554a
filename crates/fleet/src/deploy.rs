//! Deployment orchestration: transfer, flash, boot, verify, rollback.
//!
//! Each deployment is a finite-state machine (`pending -> transferring ->
//! flashing (boards) -> booting -> verifying -> completed | failed`) with
//! every transition timestamped on the record. Architecture compatibility
//! is checked against the equivalence map before anything touches an
//! adapter. Rollback re-runs the last completed deployment on the same
//! target and marks the current one rolled back.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use tracing::{info, warn};

use fleet_artifacts::ArtifactIndex;
use fleet_config::DeploymentOptions;
use fleet_registry::Registry;
use fleet_transport::flash::FlashStation;
use fleet_transport::pool::ShellPool;
use fleet_transport::power::PowerControl;
use fleet_transport::serial::{SerialConsole, SerialSettings};
use fleet_transport::virt::{GuestConfig, VirtAdapter};
use fleet_transport::CancelToken;
use fleet_types::{
    arch_compatible, Artifact, ArtifactKind, ArtifactSelection, Board, BoardStatus, Deployment,
    DeploymentStatus, DeploymentTarget, DeploymentTransition, Error, Result, ServerStatus,
    ShellCredentials, new_id,
};

use crate::events::{EventKind, EventLog};

/// Per-target deployment history bound.
const HISTORY_LIMIT: usize = 100;

/// Artifact metadata key naming the firmware version a kernel image
/// represents; falls back to the build id when absent.
pub const FIRMWARE_VERSION_KEY: &str = "firmware_version";

/// Guest sizing for a virt deployment.
#[derive(Debug, Clone)]
pub struct GuestSpec {
    pub name: Option<String>,
    pub cpu_cores: u32,
    pub memory_mb: u64,
}

impl Default for GuestSpec {
    fn default() -> Self {
        Self {
            name: None,
            cpu_cores: 2,
            memory_mb: 2048,
        }
    }
}

#[derive(Default)]
struct DeployState {
    deployments: HashMap<String, Deployment>,
    history: HashMap<String, VecDeque<String>>,
    guest_names: HashMap<String, String>,
}

/// Orchestrates deployments onto virt hosts and boards.
pub struct DeploymentManager {
    registry: Arc<Registry>,
    artifacts: Arc<ArtifactIndex>,
    pool: Arc<ShellPool>,
    virt: Arc<dyn VirtAdapter>,
    power: Arc<dyn PowerControl>,
    flash: Arc<dyn FlashStation>,
    serial: Arc<dyn SerialConsole>,
    events: Arc<EventLog>,
    options: DeploymentOptions,
    state: Mutex<DeployState>,
}

impl DeploymentManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registry: Arc<Registry>,
        artifacts: Arc<ArtifactIndex>,
        pool: Arc<ShellPool>,
        virt: Arc<dyn VirtAdapter>,
        power: Arc<dyn PowerControl>,
        flash: Arc<dyn FlashStation>,
        serial: Arc<dyn SerialConsole>,
        events: Arc<EventLog>,
        options: DeploymentOptions,
    ) -> Self {
        Self {
            registry,
            artifacts,
            pool,
            virt,
            power,
            flash,
            serial,
            events,
            options,
            state: Mutex::new(DeployState::default()),
        }
    }

    pub fn deployment(&self, deployment_id: &str) -> Result<Deployment> {
        self.state
            .lock()
            .expect("deploy lock")
            .deployments
            .get(deployment_id)
            .cloned()
            .ok_or_else(|| Error::not_found("deployment", deployment_id))
    }

    /// Deployment ids for a target, newest first.
    pub fn history_for(&self, target_id: &str) -> Vec<String> {
        self.state
            .lock()
            .expect("deploy lock")
            .history
            .get(target_id)
            .map(|h| h.iter().rev().cloned().collect())
            .unwrap_or_default()
    }

    fn create(&self, target: DeploymentTarget, target_id: &str, artifacts: &[Artifact]) -> Deployment {
        let now = Utc::now();
        let deployment = Deployment {
            id: new_id("dep"),
            target,
            target_id: target_id.to_string(),
            build_id: artifacts
                .first()
                .map(|a| a.build_id.clone())
                .unwrap_or_default(),
            artifact_ids: artifacts.iter().map(|a| a.id.clone()).collect(),
            status: DeploymentStatus::Pending,
            boot_verified: false,
            created_at: now,
            started_at: None,
            completed_at: None,
            error_message: None,
            transitions: vec![DeploymentTransition {
                status: DeploymentStatus::Pending,
                at: now,
            }],
        };
        let mut state = self.state.lock().expect("deploy lock");
        state
            .deployments
            .insert(deployment.id.clone(), deployment.clone());
        let history = state.history.entry(target_id.to_string()).or_default();
        history.push_back(deployment.id.clone());
        while history.len() > HISTORY_LIMIT {
            history.pop_front();
        }
        drop(state);
        self.events.record(
            &deployment.id,
            EventKind::DeploymentCreated {
                target_id: target_id.to_string(),
            },
        );
        deployment
    }

    fn transition(&self, deployment_id: &str, status: DeploymentStatus) {
        let now = Utc::now();
        let mut state = self.state.lock().expect("deploy lock");
        if let Some(deployment) = state.deployments.get_mut(deployment_id) {
            deployment.status = status;
            deployment.transitions.push(DeploymentTransition { status, at: now });
            match status {
                DeploymentStatus::Transferring => deployment.started_at = Some(now),
                DeploymentStatus::Completed
                | DeploymentStatus::Failed
                | DeploymentStatus::RolledBack => deployment.completed_at = Some(now),
                _ => {}
            }
        }
        drop(state);
        self.events.record(
            deployment_id,
            EventKind::DeploymentTransition {
                status: format!("{:?}", status).to_lowercase(),
            },
        );
    }

    fn fail(&self, deployment_id: &str, error: &Error) {
        {
            let mut state = self.state.lock().expect("deploy lock");
            if let Some(deployment) = state.deployments.get_mut(deployment_id) {
                deployment.error_message = Some(error.to_string());
            }
        }
        self.transition(deployment_id, DeploymentStatus::Failed);
        warn!(deployment = %deployment_id, %error, "deployment failed");
    }

    fn resolve_artifacts(&self, selection: &ArtifactSelection) -> Result<Vec<Artifact>> {
        let artifacts = self.artifacts.by_selection(selection);
        if artifacts.is_empty() {
            return Err(Error::validation("artifact selection matched nothing"));
        }
        Ok(artifacts)
    }

    fn check_architecture(target_arch: &str, artifacts: &[Artifact]) -> Result<()> {
        for artifact in artifacts {
            // Build logs are architecture-neutral records, not payloads.
            if artifact.kind == ArtifactKind::BuildLog {
                continue;
            }
            if !arch_compatible(target_arch, &artifact.architecture) {
                return Err(Error::validation(format!(
                    "artifact {} is {} but the target is {}",
                    artifact.filename, artifact.architecture, target_arch
                )));
            }
        }
        Ok(())
    }

    /// Deploy artifacts as a new guest on a virt host.
    pub async fn deploy_to_virt(
        &self,
        host_id: &str,
        selection: &ArtifactSelection,
        guest: GuestSpec,
        cancel: &CancelToken,
    ) -> Result<Deployment> {
        let host = self.registry.host(host_id)?;
        if host.maintenance || host.status != ServerStatus::Online {
            return Err(Error::conflict(format!("host {} is not deployable", host_id)));
        }
        let artifacts = self.resolve_artifacts(selection)?;

        let deployment = self.create(DeploymentTarget::VirtHost, host_id, &artifacts);
        let guest_name = guest
            .name
            .clone()
            .unwrap_or_else(|| format!("fleet-{}", deployment.id));
        self.state
            .lock()
            .expect("deploy lock")
            .guest_names
            .insert(deployment.id.clone(), guest_name.clone());

        if let Err(error) = Self::check_architecture(&host.architecture, &artifacts) {
            self.fail(&deployment.id, &error);
            return Err(error);
        }

        match self
            .run_virt(&deployment.id, &host.credentials, &host.architecture, &artifacts, &guest, &guest_name, cancel)
            .await
        {
            Ok(()) => {
                let _ = self.registry.update_host(host_id, |h| {
                    h.running_guest_count += 1;
                });
                self.transition(&deployment.id, DeploymentStatus::Completed);
                info!(deployment = %deployment.id, host = %host_id, "deployment completed");
                self.deployment(&deployment.id)
            }
            Err(error) => {
                self.fail(&deployment.id, &error);
                Err(error)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_virt(
        &self,
        deployment_id: &str,
        credentials: &ShellCredentials,
        architecture: &str,
        artifacts: &[Artifact],
        guest: &GuestSpec,
        guest_name: &str,
        cancel: &CancelToken,
    ) -> Result<()> {
        let destination = format!("/var/lib/fleet/guests/{}", guest_name);

        self.transition(deployment_id, DeploymentStatus::Transferring);
        let remote_paths = self
            .transfer(credentials, &destination, artifacts, cancel)
            .await?;

        self.transition(deployment_id, DeploymentStatus::Booting);
        let kernel = remote_for(artifacts, &remote_paths, ArtifactKind::KernelImage)
            .ok_or_else(|| Error::validation("selection contains no kernel image"))?;
        let config = GuestConfig {
            name: guest_name.to_string(),
            architecture: architecture.to_string(),
            cpu_cores: guest.cpu_cores,
            memory_mb: guest.memory_mb,
            kernel_path: kernel,
            initrd_path: remote_for(artifacts, &remote_paths, ArtifactKind::Initrd),
            rootfs_path: remote_for(artifacts, &remote_paths, ArtifactKind::Rootfs),
            kernel_cmdline: None,
        };
        self.virt.create_guest(credentials, &config, cancel).await?;

        self.transition(deployment_id, DeploymentStatus::Verifying);
        let running = self
            .virt
            .list_guests(credentials, false, cancel)
            .await?
            .into_iter()
            .any(|g| g.name == guest_name);
        if !running {
            return Err(Error::Remote(format!(
                "guest {} is not running after start",
                guest_name
            )));
        }
        self.mark_verified(deployment_id);
        Ok(())
    }

    /// Deploy artifacts onto a physical board.
    pub async fn deploy_to_board(
        &self,
        board_id: &str,
        selection: &ArtifactSelection,
        cancel: &CancelToken,
    ) -> Result<Deployment> {
        let board = self.registry.board(board_id)?;
        if board.maintenance {
            return Err(Error::conflict(format!("board {} is in maintenance", board_id)));
        }
        if matches!(board.status, BoardStatus::Offline | BoardStatus::Flashing) {
            return Err(Error::conflict(format!(
                "board {} is {:?}",
                board_id, board.status
            )));
        }
        let artifacts = self.resolve_artifacts(selection)?;

        let deployment = self.create(DeploymentTarget::Board, board_id, &artifacts);

        if let Err(error) = Self::check_architecture(&board.architecture, &artifacts) {
            self.fail(&deployment.id, &error);
            return Err(error);
        }

        let prior_status = board.status;
        match self.run_board(&deployment.id, &board, &artifacts, cancel).await {
            Ok(firmware_version) => {
                let _ = self.registry.update_board(board_id, |b| {
                    b.status = prior_status;
                    b.current_firmware_version = Some(firmware_version.clone());
                    b.last_flash_at = Some(Utc::now());
                });
                self.transition(&deployment.id, DeploymentStatus::Completed);
                info!(deployment = %deployment.id, board = %board_id, "deployment completed");
                self.deployment(&deployment.id)
            }
            Err(error) => {
                let _ = self.registry.update_board(board_id, |b| {
                    b.status = prior_status;
                });
                self.fail(&deployment.id, &error);
                Err(error)
            }
        }
    }

    async fn run_board(
        &self,
        deployment_id: &str,
        board: &Board,
        artifacts: &[Artifact],
        cancel: &CancelToken,
    ) -> Result<String> {
        self.transition(deployment_id, DeploymentStatus::Transferring);
        if let Some(credentials) = &board.credentials {
            let staging = format!("/var/lib/fleet/staging/{}", deployment_id);
            self.transfer(credentials, &staging, artifacts, cancel).await?;
        }

        self.transition(deployment_id, DeploymentStatus::Flashing);
        let _ = self.registry.update_board(&board.id, |b| {
            b.status = BoardStatus::Flashing;
        });

        let kernel = artifacts
            .iter()
            .find(|a| a.kind == ArtifactKind::KernelImage)
            .ok_or_else(|| Error::validation("selection contains no kernel image"))?;
        let station_credentials = board.credentials.clone().unwrap_or(ShellCredentials {
            hostname: board.flash_station_id.clone().unwrap_or_default(),
            username: "flash".to_string(),
            port: 22,
            key_path: None,
        });
        let outcome = self
            .flash
            .flash(
                &board.id,
                Path::new(&kernel.path),
                &station_credentials,
                &board.board_type,
                true,
                cancel,
            )
            .await?;
        if !outcome.verified {
            return Err(Error::Remote(format!(
                "flash of {} did not verify",
                kernel.filename
            )));
        }

        self.transition(deployment_id, DeploymentStatus::Booting);
        if board.power_control.is_automated() {
            self.power
                .power_cycle(&board.id, &board.power_control, Duration::from_secs(2), cancel)
                .await?;
        }

        self.transition(deployment_id, DeploymentStatus::Verifying);
        self.verify_board_boot(board, cancel).await?;
        self.mark_verified(deployment_id);

        Ok(kernel
            .metadata
            .get(FIRMWARE_VERSION_KEY)
            .cloned()
            .unwrap_or_else(|| kernel.build_id.clone()))
    }

    /// Probe shell and serial until the board answers or the boot timeout
    /// passes.
    async fn verify_board_boot(&self, board: &Board, cancel: &CancelToken) -> Result<()> {
        let attempt_loop = async {
            loop {
                cancel.check()?;
                if let Some(credentials) = &board.credentials {
                    let live = self
                        .pool
                        .exec(
                            credentials,
                            "echo fleet-boot-ok",
                            Duration::from_secs(10),
                            &BTreeMap::new(),
                            cancel,
                        )
                        .await;
                    if live.as_ref().is_ok_and(|r| r.success()) {
                        return Ok(());
                    }
                }
                if let Some(device) = &board.serial_device {
                    let settings = SerialSettings {
                        device: device.clone(),
                        baud_rate: board.serial_baud_rate,
                        data_bits: 8,
                        stop_bits: 1,
                        parity: fleet_transport::serial::Parity::None,
                    };
                    if let Ok(link) = self.serial.open(&settings, cancel).await {
                        let read = self
                            .serial
                            .read_until(&link, "login:", Duration::from_secs(10), cancel)
                            .await;
                        let _ = self.serial.close(link).await;
                        if read.is_ok() {
                            return Ok(());
                        }
                    }
                }
                tokio::time::sleep(Duration::from_secs(5)).await;
            }
        };

        match tokio::time::timeout(self.options.boot_timeout(), attempt_loop).await {
            Ok(result) => result,
            Err(_) => Err(Error::Remote(format!(
                "board {} did not come up within {}s",
                board.id,
                self.options.boot_timeout().as_secs()
            ))),
        }
    }

    fn mark_verified(&self, deployment_id: &str) {
        let mut state = self.state.lock().expect("deploy lock");
        if let Some(deployment) = state.deployments.get_mut(deployment_id) {
            deployment.boot_verified = true;
        }
    }

    /// Upload artifacts into the destination directory and verify each
    /// landed, all within the transfer timeout.
    async fn transfer(
        &self,
        credentials: &ShellCredentials,
        destination: &str,
        artifacts: &[Artifact],
        cancel: &CancelToken,
    ) -> Result<HashMap<String, String>> {
        let work = async {
            let lease = self.pool.lease(credentials, cancel).await?;
            let shell = self.pool.backend();
            let result: Result<HashMap<String, String>> = async {
                shell
                    .exec(
                        &lease.session,
                        &format!("mkdir -p {}", destination),
                        Duration::from_secs(30),
                        &BTreeMap::new(),
                        cancel,
                    )
                    .await?
                    .ok()?;

                let mut remote_paths = HashMap::new();
                for artifact in artifacts {
                    let remote = format!("{}/{}", destination, artifact.filename);
                    shell
                        .upload(&lease.session, Path::new(&artifact.path), &remote, cancel)
                        .await?;
                    shell
                        .exec(
                            &lease.session,
                            &format!("test -f {}", remote),
                            Duration::from_secs(30),
                            &BTreeMap::new(),
                            cancel,
                        )
                        .await?
                        .ok()
                        .map_err(|_| {
                            Error::Remote(format!("{} missing after upload", remote))
                        })?;
                    remote_paths.insert(artifact.id.clone(), remote);
                }
                Ok(remote_paths)
            }
            .await;
            match &result {
                Err(Error::Transport(_)) | Err(Error::Cancelled) => self.pool.discard(lease).await,
                _ => self.pool.restore(lease),
            }
            result
        };

        match tokio::time::timeout(self.options.transfer_timeout(), work).await {
            Ok(result) => result,
            Err(_) => Err(Error::Transport(fleet_types::TransportError::timeout(
                format!(
                    "transfer to {} exceeded {}s",
                    destination,
                    self.options.transfer_timeout().as_secs()
                ),
            ))),
        }
    }

    /// Re-run the last completed deployment for the target and mark this
    /// one rolled back.
    pub async fn rollback(&self, deployment_id: &str, cancel: &CancelToken) -> Result<Deployment> {
        let deployment = self.deployment(deployment_id)?;
        if !deployment.can_rollback() {
            return Err(Error::conflict(format!(
                "deployment {} is {:?} and cannot be rolled back",
                deployment_id, deployment.status
            )));
        }

        let previous_build = {
            let state = self.state.lock().expect("deploy lock");
            state
                .history
                .get(&deployment.target_id)
                .into_iter()
                .flatten()
                .rev()
                .filter(|id| id.as_str() != deployment_id)
                .filter_map(|id| state.deployments.get(id))
                .find(|d| d.status == DeploymentStatus::Completed)
                .map(|d| d.build_id.clone())
        };
        let Some(previous_build) = previous_build else {
            return Err(Error::conflict(format!(
                "no prior completed deployment for target {}",
                deployment.target_id
            )));
        };

        info!(
            deployment = %deployment_id,
            build = %previous_build,
            "rolling back to previous build"
        );
        let selection = ArtifactSelection::for_build(previous_build);
        let replacement = match deployment.target {
            DeploymentTarget::VirtHost => {
                self.deploy_to_virt(&deployment.target_id, &selection, GuestSpec::default(), cancel)
                    .await?
            }
            DeploymentTarget::Board => {
                self.deploy_to_board(&deployment.target_id, &selection, cancel)
                    .await?
            }
        };

        self.transition(deployment_id, DeploymentStatus::RolledBack);
        self.events.record(
            deployment_id,
            EventKind::DeploymentRolledBack {
                replacement_id: replacement.id.clone(),
            },
        );
        self.deployment(deployment_id)
    }
}

fn remote_for(
    artifacts: &[Artifact],
    remote_paths: &HashMap<String, String>,
    kind: ArtifactKind,
) -> Option<String> {
    artifacts
        .iter()
        .find(|a| a.kind == kind)
        .and_then(|a| remote_paths.get(&a.id))
        .cloned()
}
