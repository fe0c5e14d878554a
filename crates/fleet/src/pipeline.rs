//! Pipeline engine: build, deploy, boot, test in strict order.
//!
//! The central invariant: stage N starts only after stage N-1 completed. A
//! stage that fails after its retry budget fails the whole pipeline and
//! every later stage is marked skipped; no later stage may ever execute.
//! Cancellation is terminal: a cancelled pipeline never becomes completed
//! or failed.
//!
//! Stage handlers are looked up by stage type at execution time from the
//! registrations made at start-up; a deterministic default handler stands
//! in when nothing is registered, which keeps pilots and tests cheap. The
//! engine composes one way only: it drives the build and deployment
//! managers through handlers, and those managers know nothing about
//! pipelines. A pipeline finds its outputs via the output id recorded on
//! each stage.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{info, warn};

use fleet_config::PipelineOptions;
use fleet_registry::statefile;
use fleet_transport::CancelToken;
use fleet_types::{
    BuildJobStatus, EnvironmentKind, Error, Pipeline, PipelineStage, PipelineStatus, Result,
    StageStatus, StageType, new_id,
};

use crate::events::{EventKind, EventLog};

/// State file for pipeline persistence
pub const PIPELINES_FILE: &str = "pipelines.json";

/// A pipeline submission.
#[derive(Debug, Clone)]
pub struct PipelineSpec {
    pub name: Option<String>,
    pub source_repository: String,
    pub branch: String,
    pub commit_hash: String,
    pub target_architecture: String,
    pub environment: EnvironmentKind,
    pub environment_config: BTreeMap<String, String>,
    /// Per-stage retry budget; the configured default when absent.
    pub max_retries: Option<u32>,
}

impl PipelineSpec {
    pub fn simple(repo: &str, branch: &str, commit: &str, arch: &str, env: EnvironmentKind) -> Self {
        Self {
            name: None,
            source_repository: repo.to_string(),
            branch: branch.to_string(),
            commit_hash: commit.to_string(),
            target_architecture: arch.to_string(),
            environment: env,
            environment_config: BTreeMap::new(),
            max_retries: None,
        }
    }
}

/// What a stage produced.
#[derive(Debug, Clone, Default)]
pub struct StageOutcome {
    /// Build id, deployment id, or similar.
    pub output_id: Option<String>,
}

/// Executes one stage of a pipeline.
#[async_trait]
pub trait StageHandler: Send + Sync {
    async fn run(
        &self,
        pipeline: &Pipeline,
        stage: StageType,
        cancel: &CancelToken,
    ) -> Result<StageOutcome>;
}

/// Deterministic stand-in used when no handler is registered.
struct DefaultStageHandler;

#[async_trait]
impl StageHandler for DefaultStageHandler {
    async fn run(
        &self,
        pipeline: &Pipeline,
        stage: StageType,
        _cancel: &CancelToken,
    ) -> Result<StageOutcome> {
        Ok(StageOutcome {
            output_id: Some(format!("{}-{}", stage.name(), pipeline.id)),
        })
    }
}

/// Aggregate pipeline statistics.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize)]
pub struct PipelineStats {
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub success_rate: f64,
    pub average_duration_seconds: Option<f64>,
}

#[derive(Default)]
struct PipeState {
    pipelines: HashMap<String, Pipeline>,
    cancels: HashMap<String, CancelToken>,
}

/// The pipeline engine.
pub struct PipelineEngine {
    options: PipelineOptions,
    handlers: RwLock<HashMap<StageType, Arc<dyn StageHandler>>>,
    events: Arc<EventLog>,
    state: Mutex<PipeState>,
    state_dir: Option<PathBuf>,
}

impl PipelineEngine {
    pub fn new(options: PipelineOptions, events: Arc<EventLog>, state_dir: Option<PathBuf>) -> Self {
        Self {
            options,
            handlers: RwLock::new(HashMap::new()),
            events,
            state: Mutex::new(PipeState::default()),
            state_dir,
        }
    }

    /// Register a handler for a stage type. Call at start-up, before
    /// pipelines run.
    pub fn register_handler(&self, stage: StageType, handler: Arc<dyn StageHandler>) {
        self.handlers
            .write()
            .expect("handlers lock")
            .insert(stage, handler);
    }

    fn handler_for(&self, stage: StageType) -> Arc<dyn StageHandler> {
        self.handlers
            .read()
            .expect("handlers lock")
            .get(&stage)
            .cloned()
            .unwrap_or_else(|| Arc::new(DefaultStageHandler))
    }

    /// Create a pipeline in pending state with the fixed stage order.
    pub fn create(&self, spec: PipelineSpec) -> Result<Pipeline> {
        if spec.source_repository.trim().is_empty() {
            return Err(Error::validation("source repository must not be empty"));
        }
        if spec.target_architecture.trim().is_empty() {
            return Err(Error::validation("target architecture must not be empty"));
        }

        let max_retries = spec.max_retries.unwrap_or(self.options.default_max_retries);
        let pipeline = Pipeline {
            id: new_id("pipe"),
            name: spec.name,
            source_repository: spec.source_repository,
            branch: spec.branch,
            commit_hash: spec.commit_hash,
            target_architecture: spec.target_architecture,
            environment: spec.environment,
            environment_config: spec.environment_config,
            stages: StageType::ORDER
                .iter()
                .map(|stage| PipelineStage::new(*stage, max_retries))
                .collect(),
            status: PipelineStatus::Pending,
            current_stage: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            error_message: None,
        };

        self.state
            .lock()
            .expect("pipeline lock")
            .pipelines
            .insert(pipeline.id.clone(), pipeline.clone());
        self.events.record(&pipeline.id, EventKind::PipelineCreated);
        self.persist();
        Ok(pipeline)
    }

    pub fn pipeline(&self, pipeline_id: &str) -> Result<Pipeline> {
        self.state
            .lock()
            .expect("pipeline lock")
            .pipelines
            .get(pipeline_id)
            .cloned()
            .ok_or_else(|| Error::not_found("pipeline", pipeline_id))
    }

    /// All pipelines, newest first.
    pub fn pipelines(&self) -> Vec<Pipeline> {
        let state = self.state.lock().expect("pipeline lock");
        let mut pipelines: Vec<Pipeline> = state.pipelines.values().cloned().collect();
        pipelines.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(a.id.cmp(&b.id)));
        pipelines
    }

    /// Run a pipeline to a terminal state.
    pub async fn run(&self, pipeline_id: &str) -> Result<Pipeline> {
        let cancel = {
            let mut state = self.state.lock().expect("pipeline lock");
            let pipeline = state
                .pipelines
                .get_mut(pipeline_id)
                .ok_or_else(|| Error::not_found("pipeline", pipeline_id))?;
            if pipeline.status != PipelineStatus::Pending {
                return Err(Error::conflict(format!(
                    "pipeline {} is {:?}",
                    pipeline_id, pipeline.status
                )));
            }
            pipeline.status = PipelineStatus::Running;
            pipeline.started_at = Some(Utc::now());
            let token = CancelToken::new();
            state.cancels.insert(pipeline_id.to_string(), token.clone());
            token
        };

        self.drive(pipeline_id, &cancel).await;

        self.state
            .lock()
            .expect("pipeline lock")
            .cancels
            .remove(pipeline_id);
        self.persist();
        self.pipeline(pipeline_id)
    }

    /// The stage loop. Stages run strictly in order; a stage only starts
    /// when the previous one completed, and failure skips everything
    /// after it.
    async fn drive(&self, pipeline_id: &str, cancel: &CancelToken) {
        loop {
            // Snapshot under the lock; execute outside it.
            let next = {
                let state = self.state.lock().expect("pipeline lock");
                let Some(pipeline) = state.pipelines.get(pipeline_id) else {
                    return;
                };
                if pipeline.status != PipelineStatus::Running {
                    return;
                }
                match pipeline.next_pending_stage() {
                    Some(stage) => Some((stage, pipeline.clone())),
                    None => None,
                }
            };

            let Some((stage, snapshot)) = next else {
                // Every stage completed.
                let mut state = self.state.lock().expect("pipeline lock");
                if let Some(pipeline) = state.pipelines.get_mut(pipeline_id) {
                    if pipeline.status == PipelineStatus::Running {
                        pipeline.status = PipelineStatus::Completed;
                        pipeline.completed_at = Some(Utc::now());
                        pipeline.current_stage = None;
                    }
                }
                drop(state);
                self.events.record(
                    pipeline_id,
                    EventKind::PipelineFinished {
                        status: "completed".to_string(),
                    },
                );
                info!(pipeline = %pipeline_id, "pipeline completed");
                return;
            };

            let attempt = {
                let mut state = self.state.lock().expect("pipeline lock");
                let Some(pipeline) = state.pipelines.get_mut(pipeline_id) else {
                    return;
                };
                if pipeline.status != PipelineStatus::Running {
                    return;
                }
                pipeline.current_stage = Some(stage);
                let stage_record = pipeline.stage_mut(stage).expect("stage present");
                stage_record.status = StageStatus::Running;
                if stage_record.started_at.is_none() {
                    stage_record.started_at = Some(Utc::now());
                }
                stage_record.retry_count + 1
            };

            self.events.record(
                pipeline_id,
                EventKind::StageStarted {
                    stage: stage.name().to_string(),
                    attempt,
                },
            );

            let handler = self.handler_for(stage);
            let outcome = handler.run(&snapshot, stage, cancel).await;

            match outcome {
                Ok(result) => {
                    let mut state = self.state.lock().expect("pipeline lock");
                    if let Some(pipeline) = state.pipelines.get_mut(pipeline_id) {
                        if pipeline.status != PipelineStatus::Running {
                            return;
                        }
                        let stage_record = pipeline.stage_mut(stage).expect("stage present");
                        stage_record.status = StageStatus::Completed;
                        stage_record.completed_at = Some(Utc::now());
                        stage_record.output_id = result.output_id;
                    }
                    drop(state);
                    self.events.record(
                        pipeline_id,
                        EventKind::StageCompleted {
                            stage: stage.name().to_string(),
                        },
                    );
                    self.persist();
                }
                Err(Error::Cancelled) => {
                    // cancel() already rewrote the statuses.
                    return;
                }
                Err(error) => {
                    let exhausted = {
                        let mut state = self.state.lock().expect("pipeline lock");
                        let Some(pipeline) = state.pipelines.get_mut(pipeline_id) else {
                            return;
                        };
                        if pipeline.status != PipelineStatus::Running {
                            return;
                        }
                        let stage_record = pipeline.stage_mut(stage).expect("stage present");
                        if stage_record.retry_count < stage_record.max_retries {
                            stage_record.retry_count += 1;
                            stage_record.status = StageStatus::Pending;
                            false
                        } else {
                            stage_record.status = StageStatus::Failed;
                            stage_record.completed_at = Some(Utc::now());
                            stage_record.error_message = Some(error.to_string());
                            // Nothing after a failed stage may ever run.
                            for later in pipeline
                                .stages
                                .iter_mut()
                                .filter(|s| s.status == StageStatus::Pending)
                            {
                                later.status = StageStatus::Skipped;
                            }
                            pipeline.status = PipelineStatus::Failed;
                            pipeline.completed_at = Some(Utc::now());
                            pipeline.error_message = Some(format!(
                                "stage {} failed: {}",
                                stage.name(),
                                error
                            ));
                            true
                        }
                    };

                    if exhausted {
                        self.events.record(
                            pipeline_id,
                            EventKind::StageFailed {
                                stage: stage.name().to_string(),
                                message: error.to_string(),
                            },
                        );
                        self.events.record(
                            pipeline_id,
                            EventKind::PipelineFinished {
                                status: "failed".to_string(),
                            },
                        );
                        warn!(pipeline = %pipeline_id, stage = %stage.name(), %error, "pipeline failed");
                        self.persist();
                        return;
                    }

                    warn!(
                        pipeline = %pipeline_id,
                        stage = %stage.name(),
                        %error,
                        "stage failed; retrying"
                    );
                    tokio::time::sleep(self.options.retry_backoff()).await;
                }
            }
        }
    }

    /// Cancel a pipeline. Running and pending stages become skipped; the
    /// pipeline is cancelled and stays cancelled.
    pub fn cancel(&self, pipeline_id: &str) -> Result<Pipeline> {
        let cancelled = {
            let mut state = self.state.lock().expect("pipeline lock");
            let pipeline = state
                .pipelines
                .get_mut(pipeline_id)
                .ok_or_else(|| Error::not_found("pipeline", pipeline_id))?;
            if pipeline.status.is_terminal() {
                return Err(Error::conflict(format!(
                    "pipeline {} is already {:?}",
                    pipeline_id, pipeline.status
                )));
            }
            for stage in pipeline
                .stages
                .iter_mut()
                .filter(|s| matches!(s.status, StageStatus::Pending | StageStatus::Running))
            {
                stage.status = StageStatus::Skipped;
            }
            pipeline.status = PipelineStatus::Cancelled;
            pipeline.completed_at = Some(Utc::now());
            pipeline.current_stage = None;
            let cancelled = pipeline.clone();
            if let Some(token) = state.cancels.get(pipeline_id) {
                token.cancel();
            }
            cancelled
        };
        self.events.record(
            pipeline_id,
            EventKind::PipelineFinished {
                status: "cancelled".to_string(),
            },
        );
        self.persist();
        Ok(cancelled)
    }

    /// Reset a failed pipeline's stage and everything after it, then run
    /// again from that point. Earlier stages keep their completed state.
    pub async fn retry_from(&self, pipeline_id: &str, from: StageType) -> Result<Pipeline> {
        {
            let mut state = self.state.lock().expect("pipeline lock");
            let pipeline = state
                .pipelines
                .get_mut(pipeline_id)
                .ok_or_else(|| Error::not_found("pipeline", pipeline_id))?;
            if pipeline.status != PipelineStatus::Failed {
                return Err(Error::conflict(format!(
                    "pipeline {} is {:?}, not failed",
                    pipeline_id, pipeline.status
                )));
            }
            let from_index = StageType::ORDER
                .iter()
                .position(|s| *s == from)
                .expect("known stage");
            for (index, stage_type) in StageType::ORDER.iter().enumerate() {
                if index < from_index {
                    continue;
                }
                let stage = pipeline.stage_mut(*stage_type).expect("stage present");
                stage.status = StageStatus::Pending;
                stage.retry_count = 0;
                stage.started_at = None;
                stage.completed_at = None;
                stage.output_id = None;
                stage.error_message = None;
            }
            pipeline.status = PipelineStatus::Pending;
            pipeline.completed_at = None;
            pipeline.error_message = None;
        }
        self.persist();
        self.run(pipeline_id).await
    }

    /// Success rate and durations, optionally filtered by repo and branch.
    /// Only terminal pipelines count; average duration only covers
    /// completed pipelines with both timestamps.
    pub fn stats(&self, repo: Option<&str>, branch: Option<&str>) -> PipelineStats {
        let state = self.state.lock().expect("pipeline lock");
        let mut stats = PipelineStats::default();
        let mut durations = Vec::new();
        for pipeline in state.pipelines.values() {
            if repo.is_some_and(|r| pipeline.source_repository != r) {
                continue;
            }
            if branch.is_some_and(|b| pipeline.branch != b) {
                continue;
            }
            if !pipeline.status.is_terminal() {
                continue;
            }
            stats.total += 1;
            match pipeline.status {
                PipelineStatus::Completed => {
                    stats.completed += 1;
                    if let (Some(start), Some(end)) = (pipeline.started_at, pipeline.completed_at) {
                        durations.push((end - start).num_milliseconds() as f64 / 1000.0);
                    }
                }
                PipelineStatus::Failed => stats.failed += 1,
                PipelineStatus::Cancelled => stats.cancelled += 1,
                _ => {}
            }
        }
        stats.success_rate = if stats.total == 0 {
            0.0
        } else {
            stats.completed as f64 / stats.total as f64
        };
        stats.average_duration_seconds = if durations.is_empty() {
            None
        } else {
            Some(durations.iter().sum::<f64>() / durations.len() as f64)
        };
        stats
    }

    fn persist(&self) {
        let Some(dir) = &self.state_dir else {
            return;
        };
        let snapshot: std::collections::BTreeMap<String, Pipeline> = {
            let state = self.state.lock().expect("pipeline lock");
            state
                .pipelines
                .iter()
                .map(|(id, pipeline)| (id.clone(), pipeline.clone()))
                .collect()
        };
        if let Err(error) = statefile::save_map(&dir.join(PIPELINES_FILE), &snapshot) {
            warn!(%error, "failed to persist pipelines");
        }
    }
}

// ---------------------------------------------------------------------------
// Wired handlers
// ---------------------------------------------------------------------------

/// Build stage: submit a job for the pipeline's source and wait it out.
pub struct BuildStageHandler {
    queue: Arc<crate::queue::BuildJobManager>,
}

impl BuildStageHandler {
    pub fn new(queue: Arc<crate::queue::BuildJobManager>) -> Self {
        Self { queue }
    }
}

#[async_trait]
impl StageHandler for BuildStageHandler {
    async fn run(
        &self,
        pipeline: &Pipeline,
        _stage: StageType,
        cancel: &CancelToken,
    ) -> Result<StageOutcome> {
        let job = self
            .queue
            .submit(crate::queue::NewBuildJob::simple(
                &pipeline.source_repository,
                &pipeline.branch,
                &pipeline.commit_hash,
                &pipeline.target_architecture,
            ))
            .await?;

        loop {
            cancel.check()?;
            let current = self.queue.job(&job.id)?;
            match current.status {
                BuildJobStatus::Completed => {
                    return Ok(StageOutcome {
                        output_id: Some(job.id),
                    });
                }
                BuildJobStatus::Failed => {
                    return Err(Error::Remote(
                        current
                            .error_message
                            .unwrap_or_else(|| "build failed".to_string()),
                    ));
                }
                BuildJobStatus::Cancelled => return Err(Error::Cancelled),
                _ => tokio::time::sleep(Duration::from_secs(1)).await,
            }
        }
    }
}

/// Deploy stage: select a target for the pipeline's environment and
/// deploy the build stage's output onto it.
pub struct DeployStageHandler {
    deploy: Arc<crate::deploy::DeploymentManager>,
    hosts: Arc<fleet_select::virt::VirtHostSelector>,
    boards: Arc<fleet_select::board::BoardSelector>,
}

impl DeployStageHandler {
    pub fn new(
        deploy: Arc<crate::deploy::DeploymentManager>,
        hosts: Arc<fleet_select::virt::VirtHostSelector>,
        boards: Arc<fleet_select::board::BoardSelector>,
    ) -> Self {
        Self {
            deploy,
            hosts,
            boards,
        }
    }
}

#[async_trait]
impl StageHandler for DeployStageHandler {
    async fn run(
        &self,
        pipeline: &Pipeline,
        _stage: StageType,
        cancel: &CancelToken,
    ) -> Result<StageOutcome> {
        let build_id = pipeline
            .stage(StageType::Build)
            .and_then(|s| s.output_id.clone())
            .ok_or_else(|| Error::validation("deploy stage has no build output"))?;
        let selection = fleet_types::ArtifactSelection::for_build(build_id);

        match pipeline.environment {
            EnvironmentKind::Virt => {
                let picked = self.hosts.select(
                    &fleet_select::virt::GuestRequirements::for_architecture(
                        &pipeline.target_architecture,
                    ),
                )?;
                let outcome = self
                    .deploy
                    .deploy_to_virt(
                        &picked.host.id,
                        &selection,
                        crate::deploy::GuestSpec::default(),
                        cancel,
                    )
                    .await;
                self.hosts.release(&picked.reservation.id);
                let deployment = outcome?;
                Ok(StageOutcome {
                    output_id: Some(deployment.id),
                })
            }
            EnvironmentKind::Board => {
                let picked = self.boards.select(
                    &fleet_select::board::BoardRequirements::for_architecture(
                        &pipeline.target_architecture,
                    ),
                )?;
                let outcome = self
                    .deploy
                    .deploy_to_board(&picked.board.id, &selection, cancel)
                    .await;
                self.boards.release(&picked.reservation.id);
                let deployment = outcome?;
                Ok(StageOutcome {
                    output_id: Some(deployment.id),
                })
            }
        }
    }
}

/// Boot stage: confirm the deploy stage's deployment came up verified.
pub struct BootStageHandler {
    deploy: Arc<crate::deploy::DeploymentManager>,
}

impl BootStageHandler {
    pub fn new(deploy: Arc<crate::deploy::DeploymentManager>) -> Self {
        Self { deploy }
    }
}

#[async_trait]
impl StageHandler for BootStageHandler {
    async fn run(
        &self,
        pipeline: &Pipeline,
        _stage: StageType,
        _cancel: &CancelToken,
    ) -> Result<StageOutcome> {
        let deployment_id = pipeline
            .stage(StageType::Deploy)
            .and_then(|s| s.output_id.clone())
            .ok_or_else(|| Error::validation("boot stage has no deployment output"))?;
        let deployment = self.deploy.deployment(&deployment_id)?;
        if !deployment.boot_verified {
            return Err(Error::Remote(format!(
                "deployment {} never verified boot",
                deployment_id
            )));
        }
        Ok(StageOutcome {
            output_id: Some(deployment_id),
        })
    }
}
