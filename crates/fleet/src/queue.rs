//! Build-job queue, admission, and the scheduling loop.
//!
//! Admission validates the source coordinates and rejects when the queue
//! is at its cap. A submitted job gets one immediate placement attempt;
//! otherwise it waits in the queue, ordered priority-first (urgent > high >
//! normal > low) and FIFO within a priority. The scheduler walks the queue
//! head-first on every tick and on every registry change.
//!
//! Server capacity is enforced twice: the selector's capacity filter keeps
//! full servers out of the candidate set, and a per-server semaphore sized
//! at `max_concurrent_builds` bounds what the executor can actually run.
//!
//! Terminal job states are immutable: a cancelled job never becomes
//! completed or failed, even when its executor finishes afterwards.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use fleet_artifacts::{ArtifactIndex, BuildMeta};
use fleet_config::QueueConfig;
use fleet_registry::{Registry, statefile};
use fleet_select::build::{BuildRequirements, BuildServerSelector, ServerSelection};
use fleet_transport::CancelToken;
use fleet_types::{
    BuildConfig, BuildJob, BuildJobStatus, Error, JobPriority, Result, new_id,
};

use crate::events::{EventKind, EventLog};
use crate::executor::BuildRunner;
use crate::logs::{LogBuffer, LogLine, LogStream};

/// State file for job persistence
pub const BUILD_JOBS_FILE: &str = "build_jobs.json";

/// A build submission.
#[derive(Debug, Clone)]
pub struct NewBuildJob {
    pub source_repository: String,
    pub branch: String,
    pub commit_hash: String,
    pub target_architecture: String,
    pub build_config: BuildConfig,
    pub priority: JobPriority,
    /// Selection constraints beyond the architecture; derived from the
    /// architecture when absent.
    pub requirements: Option<BuildRequirements>,
}

impl NewBuildJob {
    pub fn simple(repo: &str, branch: &str, commit: &str, arch: &str) -> Self {
        Self {
            source_repository: repo.to_string(),
            branch: branch.to_string(),
            commit_hash: commit.to_string(),
            target_architecture: arch.to_string(),
            build_config: BuildConfig {
                kernel_config: Some("defconfig".to_string()),
                ..BuildConfig::default()
            },
            priority: JobPriority::Normal,
            requirements: None,
        }
    }
}

/// Queue counters for the status surface.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct QueueStatus {
    pub queued: usize,
    pub building: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
}

#[derive(Debug, Clone)]
struct QueueEntry {
    job_id: String,
    priority: JobPriority,
    seq: u64,
}

#[derive(Default)]
struct QueueState {
    jobs: HashMap<String, BuildJob>,
    queue: Vec<QueueEntry>,
    logs: HashMap<String, Arc<LogBuffer>>,
    cancels: HashMap<String, CancelToken>,
    requirements: HashMap<String, BuildRequirements>,
    seq: u64,
}

/// The build-job manager: admission, queueing, dispatch, execution.
pub struct BuildJobManager {
    registry: Arc<Registry>,
    selector: Arc<BuildServerSelector>,
    runner: Arc<dyn BuildRunner>,
    artifacts: Arc<ArtifactIndex>,
    events: Arc<EventLog>,
    config: QueueConfig,
    state: Mutex<QueueState>,
    semaphores: Mutex<HashMap<String, Arc<Semaphore>>>,
    state_dir: Option<PathBuf>,
}

impl BuildJobManager {
    pub fn new(
        registry: Arc<Registry>,
        selector: Arc<BuildServerSelector>,
        runner: Arc<dyn BuildRunner>,
        artifacts: Arc<ArtifactIndex>,
        events: Arc<EventLog>,
        config: QueueConfig,
        state_dir: Option<PathBuf>,
    ) -> Self {
        Self {
            registry,
            selector,
            runner,
            artifacts,
            events,
            config,
            state: Mutex::new(QueueState::default()),
            semaphores: Mutex::new(HashMap::new()),
            state_dir,
        }
    }

    /// Admit a new job. Tries to place it immediately; otherwise it waits
    /// in the queue.
    pub async fn submit(self: &Arc<Self>, new_job: NewBuildJob) -> Result<BuildJob> {
        if new_job.source_repository.trim().is_empty() {
            return Err(Error::validation("source repository must not be empty"));
        }
        if new_job.branch.trim().is_empty() {
            return Err(Error::validation("branch must not be empty"));
        }
        if new_job.target_architecture.trim().is_empty() {
            return Err(Error::validation("target architecture must not be empty"));
        }

        let job = {
            let mut state = self.state.lock().expect("queue lock");
            if state.queue.len() >= self.config.max_size {
                return Err(Error::conflict(format!(
                    "build queue full ({} jobs)",
                    state.queue.len()
                )));
            }

            let now = Utc::now();
            let job = BuildJob {
                id: new_id("job"),
                source_repository: new_job.source_repository.clone(),
                branch: new_job.branch.clone(),
                commit_hash: new_job.commit_hash.clone(),
                target_architecture: new_job.target_architecture.clone(),
                build_config: new_job.build_config.clone(),
                status: BuildJobStatus::Queued,
                priority: new_job.priority,
                server_id: None,
                artifact_ids: Vec::new(),
                created_at: now,
                started_at: None,
                completed_at: None,
                duration_seconds: None,
                error_message: None,
            };

            let requirements = new_job.requirements.clone().unwrap_or_else(|| {
                BuildRequirements::for_architecture(&new_job.target_architecture)
            });

            state.seq += 1;
            let entry = QueueEntry {
                job_id: job.id.clone(),
                priority: job.priority,
                seq: state.seq,
            };
            state.queue.push(entry);
            state
                .queue
                .sort_by(|a, b| b.priority.cmp(&a.priority).then(a.seq.cmp(&b.seq)));
            state.logs.insert(job.id.clone(), Arc::new(LogBuffer::new()));
            state.requirements.insert(job.id.clone(), requirements);
            state.jobs.insert(job.id.clone(), job.clone());
            job
        };

        self.events.record(
            &job.id,
            EventKind::JobQueued {
                priority: format!("{:?}", job.priority).to_lowercase(),
            },
        );
        info!(job = %job.id, arch = %job.target_architecture, "build job admitted");

        self.try_dispatch(&job.id);
        self.persist();
        Ok(self.job(&job.id)?)
    }

    /// One placement attempt for a queued job. Returns whether it started.
    fn try_dispatch(self: &Arc<Self>, job_id: &str) -> bool {
        let requirements = {
            let state = self.state.lock().expect("queue lock");
            match state.jobs.get(job_id) {
                Some(job) if job.status == BuildJobStatus::Queued => {
                    state.requirements.get(job_id).cloned()
                }
                _ => return false,
            }
        };
        let Some(requirements) = requirements else {
            return false;
        };

        let selection = match self.selector.select(&requirements) {
            Ok(selection) => selection,
            Err(Error::Exhausted { wait_estimate }) => {
                debug!(job = %job_id, ?wait_estimate, "no build server available");
                return false;
            }
            Err(error) => {
                warn!(job = %job_id, %error, "selection failed");
                return false;
            }
        };

        let server_id = selection.server.id.clone();
        {
            let mut state = self.state.lock().expect("queue lock");
            let Some(job) = state.jobs.get_mut(job_id) else {
                self.selector.release(&selection.reservation.id);
                return false;
            };
            if job.status != BuildJobStatus::Queued {
                self.selector.release(&selection.reservation.id);
                return false;
            }
            job.status = BuildJobStatus::Building;
            job.server_id = Some(server_id.clone());
            job.started_at = Some(Utc::now());
            state.queue.retain(|entry| entry.job_id != job_id);
        }

        if self
            .registry
            .update_server(&server_id, |server| server.active_build_count += 1)
            .is_err()
        {
            // Server vanished between selection and dispatch.
            let mut state = self.state.lock().expect("queue lock");
            let priority = state.jobs.get(job_id).map(|job| job.priority);
            if let Some(priority) = priority {
                if let Some(job) = state.jobs.get_mut(job_id) {
                    job.status = BuildJobStatus::Queued;
                    job.server_id = None;
                    job.started_at = None;
                }
                state.seq += 1;
                let entry = QueueEntry {
                    job_id: job_id.to_string(),
                    priority,
                    seq: state.seq,
                };
                state.queue.push(entry);
                state
                    .queue
                    .sort_by(|a, b| b.priority.cmp(&a.priority).then(a.seq.cmp(&b.seq)));
            }
            self.selector.release(&selection.reservation.id);
            return false;
        }

        self.events.record(
            job_id,
            EventKind::JobAssigned {
                server_id: server_id.clone(),
            },
        );
        info!(job = %job_id, server = %server_id, "build dispatched");

        let manager = Arc::clone(self);
        let job_id = job_id.to_string();
        tokio::spawn(async move {
            manager.run_build(&job_id, selection).await;
        });
        true
    }

    fn semaphore_for(&self, server_id: &str, capacity: u32) -> Arc<Semaphore> {
        let mut semaphores = self.semaphores.lock().expect("semaphore lock");
        Arc::clone(
            semaphores
                .entry(server_id.to_string())
                .or_insert_with(|| Arc::new(Semaphore::new(capacity.max(1) as usize))),
        )
    }

    async fn run_build(self: &Arc<Self>, job_id: &str, selection: ServerSelection) {
        let server = selection.server;
        let semaphore = self.semaphore_for(&server.id, server.max_concurrent_builds);
        let Ok(permit) = semaphore.acquire_owned().await else {
            return;
        };

        // The reservation's job is done once the assignment holds capacity.
        self.selector.release(&selection.reservation.id);

        let (job, logs, cancel) = {
            let mut state = self.state.lock().expect("queue lock");
            let Some(job) = state.jobs.get(job_id).cloned() else {
                return;
            };
            let logs = Arc::clone(state.logs.entry(job_id.to_string()).or_default());
            let cancel = state
                .cancels
                .entry(job_id.to_string())
                .or_insert_with(CancelToken::new)
                .clone();
            (job, logs, cancel)
        };

        let started = std::time::Instant::now();
        let outcome = self.runner.run(&job, &server, &logs, &cancel).await;
        let duration = started.elapsed();

        match outcome {
            Ok(drafts) => {
                let still_building = {
                    let state = self.state.lock().expect("queue lock");
                    state
                        .jobs
                        .get(job_id)
                        .is_some_and(|j| j.status == BuildJobStatus::Building)
                };
                if still_building {
                    match self.index_artifacts(&job, drafts).await {
                        Ok(artifact_ids) => {
                            let count = artifact_ids.len();
                            self.finish(job_id, |j| {
                                j.status = BuildJobStatus::Completed;
                                j.artifact_ids = artifact_ids;
                                j.completed_at = Some(Utc::now());
                                j.duration_seconds = Some(duration.as_secs());
                            });
                            self.events.record(
                                job_id,
                                EventKind::JobCompleted {
                                    duration_ms: duration.as_millis() as u64,
                                    artifact_count: count,
                                },
                            );
                            info!(job = %job_id, "build completed");
                        }
                        Err(error) => {
                            self.finish(job_id, |j| {
                                j.status = BuildJobStatus::Failed;
                                j.error_message = Some(error.to_string());
                                j.completed_at = Some(Utc::now());
                                j.duration_seconds = Some(duration.as_secs());
                            });
                            self.events.record(
                                job_id,
                                EventKind::JobFailed {
                                    message: error.to_string(),
                                },
                            );
                        }
                    }
                }
            }
            Err(Error::Cancelled) => {
                debug!(job = %job_id, "build aborted by cancellation");
            }
            Err(error) => {
                let was_building = {
                    let state = self.state.lock().expect("queue lock");
                    state
                        .jobs
                        .get(job_id)
                        .is_some_and(|j| j.status == BuildJobStatus::Building)
                };
                if was_building {
                    self.finish(job_id, |j| {
                        j.status = BuildJobStatus::Failed;
                        j.error_message = Some(error.to_string());
                        j.completed_at = Some(Utc::now());
                        j.duration_seconds = Some(duration.as_secs());
                    });
                    self.events.record(
                        job_id,
                        EventKind::JobFailed {
                            message: error.to_string(),
                        },
                    );
                    warn!(job = %job_id, %error, "build failed");
                }
            }
        }

        drop(permit);
        let _ = self
            .registry
            .update_server(&server.id, |server| {
                server.active_build_count = server.active_build_count.saturating_sub(1);
            });
        self.persist();
    }

    async fn index_artifacts(
        &self,
        job: &BuildJob,
        drafts: Vec<crate::executor::ArtifactDraft>,
    ) -> Result<Vec<String>> {
        self.artifacts.register_build(BuildMeta {
            build_id: job.id.clone(),
            branch: job.branch.clone(),
            architecture: job.target_architecture.clone(),
            commit_hash: job.commit_hash.clone(),
            created_at: job.created_at,
        })?;
        let mut artifact_ids = Vec::with_capacity(drafts.len());
        for draft in drafts {
            let artifact = self
                .artifacts
                .ingest_file(&job.id, draft.kind, &draft.filename, &draft.local_path)
                .await?;
            artifact_ids.push(artifact.id);
        }
        self.artifacts.finalize_build(&job.id)?;
        Ok(artifact_ids)
    }

    fn finish(&self, job_id: &str, apply: impl FnOnce(&mut BuildJob)) {
        let mut state = self.state.lock().expect("queue lock");
        if let Some(job) = state.jobs.get_mut(job_id) {
            apply(job);
        }
        state.cancels.remove(job_id);
    }

    /// Walk the queue head-first, dispatching everything placeable.
    pub async fn process_queue(self: &Arc<Self>) -> usize {
        let candidates: Vec<String> = {
            let state = self.state.lock().expect("queue lock");
            state.queue.iter().map(|e| e.job_id.clone()).collect()
        };
        let mut dispatched = 0;
        for job_id in candidates {
            if self.try_dispatch(&job_id) {
                dispatched += 1;
            }
        }
        if dispatched > 0 {
            self.persist();
        }
        dispatched
    }

    /// Scheduling loop: wakes on the tick interval and on registry
    /// changes (a freed server, a recovered board).
    pub async fn run_scheduler(self: Arc<Self>, cancel: CancelToken) {
        let mut changes = self.registry.subscribe();
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.config.tick()) => {}
                changed = changes.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = cancel.cancelled() => break,
            }
            self.process_queue().await;
        }
        info!("build scheduler stopped");
    }

    pub fn job(&self, job_id: &str) -> Result<BuildJob> {
        self.state
            .lock()
            .expect("queue lock")
            .jobs
            .get(job_id)
            .cloned()
            .ok_or_else(|| Error::not_found("build_job", job_id))
    }

    /// All jobs, newest first, optionally filtered by status.
    pub fn jobs(&self, status: Option<BuildJobStatus>) -> Vec<BuildJob> {
        let state = self.state.lock().expect("queue lock");
        let mut jobs: Vec<BuildJob> = state
            .jobs
            .values()
            .filter(|j| status.is_none_or(|s| j.status == s))
            .cloned()
            .collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(a.id.cmp(&b.id)));
        jobs
    }

    pub fn queue_status(&self) -> QueueStatus {
        let state = self.state.lock().expect("queue lock");
        let mut status = QueueStatus::default();
        for job in state.jobs.values() {
            match job.status {
                BuildJobStatus::Queued => status.queued += 1,
                BuildJobStatus::Building => status.building += 1,
                BuildJobStatus::Completed => status.completed += 1,
                BuildJobStatus::Failed => status.failed += 1,
                BuildJobStatus::Cancelled => status.cancelled += 1,
            }
        }
        status
    }

    /// Queue position of a queued job, head = 0.
    pub fn queue_position(&self, job_id: &str) -> Option<usize> {
        let state = self.state.lock().expect("queue lock");
        state.queue.iter().position(|e| e.job_id == job_id)
    }

    pub fn log_lines(&self, job_id: &str) -> Result<Vec<LogLine>> {
        let state = self.state.lock().expect("queue lock");
        state
            .logs
            .get(job_id)
            .map(|l| l.lines())
            .ok_or_else(|| Error::not_found("build_job", job_id))
    }

    /// Back-log plus live lines for a job.
    pub fn subscribe_logs(&self, job_id: &str) -> Result<LogStream> {
        let state = self.state.lock().expect("queue lock");
        state
            .logs
            .get(job_id)
            .map(|l| l.subscribe())
            .ok_or_else(|| Error::not_found("build_job", job_id))
    }

    /// Cancel a job. Queued jobs cancel immediately; building jobs get an
    /// abort signal and their terminal state sticks regardless of how the
    /// executor winds down.
    pub fn cancel(&self, job_id: &str) -> Result<BuildJob> {
        let job = {
            let mut state = self.state.lock().expect("queue lock");
            let Some(job) = state.jobs.get_mut(job_id) else {
                return Err(Error::not_found("build_job", job_id));
            };
            match job.status {
                BuildJobStatus::Queued => {
                    job.status = BuildJobStatus::Cancelled;
                    job.completed_at = Some(Utc::now());
                    let id = job.id.clone();
                    state.queue.retain(|e| e.job_id != id);
                }
                BuildJobStatus::Building => {
                    job.status = BuildJobStatus::Cancelled;
                    job.completed_at = Some(Utc::now());
                    if let Some(token) = state.cancels.get(job_id) {
                        token.cancel();
                    }
                }
                _ => {
                    return Err(Error::conflict(format!(
                        "job {} is already {:?}",
                        job_id, job.status
                    )));
                }
            }
            state.jobs.get(job_id).cloned().expect("job present")
        };
        self.events.record(job_id, EventKind::JobCancelled);
        self.persist();
        Ok(job)
    }

    /// Retry a finished job as a brand-new job with a fresh id.
    pub async fn retry(self: &Arc<Self>, job_id: &str) -> Result<BuildJob> {
        let (source, requirements) = {
            let state = self.state.lock().expect("queue lock");
            let job = state
                .jobs
                .get(job_id)
                .ok_or_else(|| Error::not_found("build_job", job_id))?;
            if !job.status.is_terminal() {
                return Err(Error::conflict(format!(
                    "job {} is still {:?}",
                    job_id, job.status
                )));
            }
            (job.clone(), state.requirements.get(job_id).cloned())
        };

        self.submit(NewBuildJob {
            source_repository: source.source_repository,
            branch: source.branch,
            commit_hash: source.commit_hash,
            target_architecture: source.target_architecture,
            build_config: source.build_config,
            priority: source.priority,
            requirements,
        })
        .await
    }

    fn persist(&self) {
        let Some(dir) = &self.state_dir else {
            return;
        };
        let snapshot: std::collections::BTreeMap<String, BuildJob> = {
            let state = self.state.lock().expect("queue lock");
            state
                .jobs
                .iter()
                .map(|(id, job)| (id.clone(), job.clone()))
                .collect()
        };
        if let Err(error) = statefile::save_map(&dir.join(BUILD_JOBS_FILE), &snapshot) {
            warn!(%error, "failed to persist build jobs");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{
        StubBehavior, StubRunner, fast_queue_config, sample_server, wait_until,
    };
    use fleet_types::Asset;

    struct Fixture {
        registry: Arc<Registry>,
        runner: Arc<StubRunner>,
        manager: Arc<BuildJobManager>,
        _artifact_root: tempfile::TempDir,
    }

    fn fixture_with(config: QueueConfig, state_dir: Option<PathBuf>) -> Fixture {
        let registry = Arc::new(Registry::new());
        let selector = Arc::new(BuildServerSelector::new(Arc::clone(&registry)));
        let runner = Arc::new(StubRunner::new());
        let artifact_root = tempfile::tempdir().expect("tempdir");
        let artifacts = Arc::new(ArtifactIndex::new(artifact_root.path(), 30));
        let manager = Arc::new(BuildJobManager::new(
            Arc::clone(&registry),
            selector,
            runner.clone(),
            artifacts,
            Arc::new(EventLog::new()),
            config,
            state_dir,
        ));
        Fixture {
            registry,
            runner,
            manager,
            _artifact_root: artifact_root,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(fast_queue_config(), None)
    }

    #[tokio::test(start_paused = true)]
    async fn submit_dispatches_and_completes() {
        let f = fixture();
        f.registry
            .register(Asset::BuildServer(sample_server("srv-1", "arm64")))
            .expect("register");

        let job = f
            .manager
            .submit(NewBuildJob::simple("https://git.example/linux.git", "main", "c0ffee", "arm64"))
            .await
            .expect("submit");
        assert_eq!(job.status, BuildJobStatus::Building);
        assert_eq!(job.server_id.as_deref(), Some("srv-1"));
        assert_eq!(
            f.registry.server("srv-1").expect("server").active_build_count,
            1
        );

        wait_until(|| {
            f.manager.job(&job.id).expect("job").status == BuildJobStatus::Completed
        })
        .await;

        let done = f.manager.job(&job.id).expect("job");
        assert!(!done.artifact_ids.is_empty());
        assert!(done.completed_at.is_some());
        assert_eq!(
            f.registry.server("srv-1").expect("server").active_build_count,
            0
        );
    }

    #[tokio::test(start_paused = true)]
    async fn no_capacity_enqueues_until_processed() {
        let f = fixture();

        let job = f
            .manager
            .submit(NewBuildJob::simple("repo", "main", "c1", "arm64"))
            .await
            .expect("submit");
        assert_eq!(job.status, BuildJobStatus::Queued);
        assert_eq!(f.manager.queue_position(&job.id), Some(0));

        f.registry
            .register(Asset::BuildServer(sample_server("srv-1", "arm64")))
            .expect("register");
        assert_eq!(f.manager.process_queue().await, 1);

        wait_until(|| {
            f.manager.job(&job.id).expect("job").status == BuildJobStatus::Completed
        })
        .await;
    }

    #[tokio::test]
    async fn admission_validates_input() {
        let f = fixture();
        let result = f
            .manager
            .submit(NewBuildJob::simple("", "main", "c1", "arm64"))
            .await;
        assert!(matches!(result, Err(Error::Validation(_))));

        let result = f
            .manager
            .submit(NewBuildJob::simple("repo", "", "c1", "arm64"))
            .await;
        assert!(matches!(result, Err(Error::Validation(_))));
    }

    #[tokio::test]
    async fn queue_cap_rejects_with_conflict() {
        let f = fixture_with(
            QueueConfig {
                max_size: 1,
                tick_seconds: 1,
            },
            None,
        );
        f.manager
            .submit(NewBuildJob::simple("repo", "main", "c1", "arm64"))
            .await
            .expect("submit");
        let second = f
            .manager
            .submit(NewBuildJob::simple("repo", "main", "c2", "arm64"))
            .await;
        assert!(matches!(second, Err(Error::Conflict(_))));
    }

    #[tokio::test]
    async fn queue_orders_by_priority_then_fifo() {
        let f = fixture();
        let mut normal_1 = NewBuildJob::simple("repo", "main", "c1", "arm64");
        normal_1.priority = JobPriority::Normal;
        let mut low = NewBuildJob::simple("repo", "main", "c2", "arm64");
        low.priority = JobPriority::Low;
        let mut urgent = NewBuildJob::simple("repo", "main", "c3", "arm64");
        urgent.priority = JobPriority::Urgent;
        let mut normal_2 = NewBuildJob::simple("repo", "main", "c4", "arm64");
        normal_2.priority = JobPriority::Normal;

        let normal_1 = f.manager.submit(normal_1).await.expect("submit");
        let low = f.manager.submit(low).await.expect("submit");
        let urgent = f.manager.submit(urgent).await.expect("submit");
        let normal_2 = f.manager.submit(normal_2).await.expect("submit");

        assert_eq!(f.manager.queue_position(&urgent.id), Some(0));
        assert_eq!(f.manager.queue_position(&normal_1.id), Some(1));
        assert_eq!(f.manager.queue_position(&normal_2.id), Some(2));
        assert_eq!(f.manager.queue_position(&low.id), Some(3));
    }

    #[tokio::test(start_paused = true)]
    async fn capacity_cap_holds_second_job_back() {
        let f = fixture();
        let mut server = sample_server("srv-1", "arm64");
        server.max_concurrent_builds = 1;
        f.registry
            .register(Asset::BuildServer(server))
            .expect("register");
        f.runner.script(StubBehavior::HangUntilCancel);

        let first = f
            .manager
            .submit(NewBuildJob::simple("repo", "main", "c1", "arm64"))
            .await
            .expect("submit");
        assert_eq!(first.status, BuildJobStatus::Building);

        let second = f
            .manager
            .submit(NewBuildJob::simple("repo", "main", "c2", "arm64"))
            .await
            .expect("submit");
        assert_eq!(second.status, BuildJobStatus::Queued);
        assert_eq!(
            f.registry.server("srv-1").expect("server").active_build_count,
            1
        );

        // Releasing the first frees the slot for the second.
        f.manager.cancel(&first.id).expect("cancel");
        wait_until(|| {
            f.registry.server("srv-1").expect("server").active_build_count == 0
        })
        .await;
        assert_eq!(f.manager.process_queue().await, 1);
        wait_until(|| {
            f.manager.job(&second.id).expect("job").status == BuildJobStatus::Completed
        })
        .await;
    }

    #[tokio::test]
    async fn cancel_queued_is_immediate_and_terminal() {
        let f = fixture();
        let job = f
            .manager
            .submit(NewBuildJob::simple("repo", "main", "c1", "arm64"))
            .await
            .expect("submit");

        let cancelled = f.manager.cancel(&job.id).expect("cancel");
        assert_eq!(cancelled.status, BuildJobStatus::Cancelled);
        assert_eq!(f.manager.queue_position(&job.id), None);
        // Cancelling again conflicts.
        assert!(f.manager.cancel(&job.id).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_building_job_never_completes() {
        let f = fixture();
        f.registry
            .register(Asset::BuildServer(sample_server("srv-1", "arm64")))
            .expect("register");
        f.runner.script(StubBehavior::HangUntilCancel);

        let job = f
            .manager
            .submit(NewBuildJob::simple("repo", "main", "c1", "arm64"))
            .await
            .expect("submit");
        assert_eq!(job.status, BuildJobStatus::Building);

        f.manager.cancel(&job.id).expect("cancel");
        wait_until(|| {
            f.registry.server("srv-1").expect("server").active_build_count == 0
        })
        .await;

        // The executor has wound down; the job is still cancelled.
        assert_eq!(
            f.manager.job(&job.id).expect("job").status,
            BuildJobStatus::Cancelled
        );
    }

    #[tokio::test(start_paused = true)]
    async fn failed_build_records_error() {
        let f = fixture();
        f.registry
            .register(Asset::BuildServer(sample_server("srv-1", "arm64")))
            .expect("register");
        f.runner
            .script(StubBehavior::Fail("make exited 2".to_string()));

        let job = f
            .manager
            .submit(NewBuildJob::simple("repo", "main", "c1", "arm64"))
            .await
            .expect("submit");

        wait_until(|| f.manager.job(&job.id).expect("job").status == BuildJobStatus::Failed)
            .await;
        let failed = f.manager.job(&job.id).expect("job");
        assert!(failed.error_message.as_deref().unwrap_or("").contains("make exited 2"));
        assert_eq!(
            f.registry.server("srv-1").expect("server").active_build_count,
            0
        );
    }

    #[tokio::test(start_paused = true)]
    async fn retry_creates_a_fresh_job() {
        let f = fixture();
        f.registry
            .register(Asset::BuildServer(sample_server("srv-1", "arm64")))
            .expect("register");
        f.runner
            .script(StubBehavior::Fail("transient".to_string()));

        let job = f
            .manager
            .submit(NewBuildJob::simple("repo", "main", "c1", "arm64"))
            .await
            .expect("submit");
        wait_until(|| f.manager.job(&job.id).expect("job").status == BuildJobStatus::Failed)
            .await;

        let retried = f.manager.retry(&job.id).await.expect("retry");
        assert_ne!(retried.id, job.id);
        assert_eq!(retried.commit_hash, "c1");
        wait_until(|| {
            f.manager.job(&retried.id).expect("job").status == BuildJobStatus::Completed
        })
        .await;

        // Retrying an active job is a conflict.
        let active = f
            .manager
            .submit(NewBuildJob::simple("repo", "main", "c9", "arm64"))
            .await
            .expect("submit");
        assert!(f.manager.retry(&active.id).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn log_subscribers_get_backlog_then_live() {
        let f = fixture();
        f.registry
            .register(Asset::BuildServer(sample_server("srv-1", "arm64")))
            .expect("register");

        let job = f
            .manager
            .submit(NewBuildJob::simple("repo", "main", "c1", "arm64"))
            .await
            .expect("submit");
        wait_until(|| {
            f.manager.job(&job.id).expect("job").status == BuildJobStatus::Completed
        })
        .await;

        let lines = f.manager.log_lines(&job.id).expect("logs");
        assert!(!lines.is_empty());
        let mut stream = f.manager.subscribe_logs(&job.id).expect("subscribe");
        let first = stream.next().await.expect("line");
        assert_eq!(first.line, lines[0].line);
    }

    #[tokio::test(start_paused = true)]
    async fn jobs_persist_to_state_file() {
        let state_dir = tempfile::tempdir().expect("tempdir");
        let f = fixture_with(fast_queue_config(), Some(state_dir.path().to_path_buf()));
        f.registry
            .register(Asset::BuildServer(sample_server("srv-1", "arm64")))
            .expect("register");

        let job = f
            .manager
            .submit(NewBuildJob::simple("repo", "main", "c1", "arm64"))
            .await
            .expect("submit");
        wait_until(|| {
            f.manager.job(&job.id).expect("job").status == BuildJobStatus::Completed
        })
        .await;

        let saved: std::collections::BTreeMap<String, BuildJob> =
            statefile::load_map(&state_dir.path().join(BUILD_JOBS_FILE)).expect("load");
        assert_eq!(saved.len(), 1);
        assert_eq!(saved[&job.id].status, BuildJobStatus::Completed);
    }
}
