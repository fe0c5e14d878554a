//! Remote build execution over the shell adapter.
//!
//! The executor owns one build from workspace creation to artifact
//! download: clone, configure, make (or the job's verbatim custom command
//! sequences), collect outputs by pattern, and pull them into the local
//! staging directory for the artifact index. Every step's output lands in
//! the job's log buffer. Cleanup always runs, including after failures and
//! cancellation.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};

use fleet_transport::pool::{PooledSession, ShellPool};
use fleet_transport::CancelToken;
use fleet_types::{ArtifactKind, BuildJob, BuildServer, Error, Result};

use crate::logs::LogBuffer;

/// A build output staged locally, ready for the artifact index.
#[derive(Debug, Clone)]
pub struct ArtifactDraft {
    pub kind: ArtifactKind,
    pub filename: String,
    pub local_path: PathBuf,
}

/// Runs one build job on a selected server.
#[async_trait]
pub trait BuildRunner: Send + Sync {
    async fn run(
        &self,
        job: &BuildJob,
        server: &BuildServer,
        logs: &LogBuffer,
        cancel: &CancelToken,
    ) -> Result<Vec<ArtifactDraft>>;
}

/// The real executor: drives the build over a pooled shell session.
pub struct ShellBuildRunner {
    pool: Arc<ShellPool>,
    staging_root: PathBuf,
    keep_workspace: bool,
    exec_timeout: Duration,
}

impl ShellBuildRunner {
    pub fn new(
        pool: Arc<ShellPool>,
        staging_root: impl Into<PathBuf>,
        keep_workspace: bool,
        exec_timeout: Duration,
    ) -> Self {
        Self {
            pool,
            staging_root: staging_root.into(),
            keep_workspace,
            exec_timeout,
        }
    }

    fn workspace_for(job: &BuildJob) -> String {
        format!("/tmp/fleet-build-{}", job.id)
    }

    async fn run_step(
        &self,
        lease: &PooledSession,
        command: &str,
        env: &BTreeMap<String, String>,
        logs: &LogBuffer,
        cancel: &CancelToken,
    ) -> Result<fleet_transport::shell::ExecResult> {
        logs.append(format!("$ {}", command));
        let result = self
            .pool
            .backend()
            .exec(&lease.session, command, self.exec_timeout, env, cancel)
            .await?;
        logs.append_block(&result.stdout);
        if !result.stderr.is_empty() {
            logs.append_block(&result.stderr);
        }
        Ok(result)
    }

    async fn execute(
        &self,
        lease: &PooledSession,
        job: &BuildJob,
        server: &BuildServer,
        workspace: &str,
        logs: &LogBuffer,
        cancel: &CancelToken,
    ) -> Result<Vec<ArtifactDraft>> {
        let env = &job.build_config.env;
        let source = format!("{}/src", workspace);

        self.run_step(lease, &format!("mkdir -p {}", workspace), env, logs, cancel)
            .await?
            .ok()?;

        let clone = format!(
            "git clone --depth 1 --branch {} --recurse-submodules {} {}",
            job.branch, job.source_repository, source
        );
        self.run_step(lease, &clone, env, logs, cancel).await?.ok()?;

        if !job.commit_hash.is_empty() {
            self.run_step(
                lease,
                &format!("git -C {} checkout {}", source, job.commit_hash),
                env,
                logs,
                cancel,
            )
            .await?
            .ok()?;
        }

        let config = &job.build_config;
        if config.is_custom() {
            for command in config
                .pre_build_commands
                .iter()
                .chain(&config.build_commands)
                .chain(&config.post_build_commands)
            {
                // Custom sequences run verbatim from the source tree.
                self.run_step(lease, &format!("cd {} && {}", source, command), env, logs, cancel)
                    .await?
                    .ok()?;
            }
        } else {
            let jobs = server.total_cpu_cores.saturating_sub(1).max(1);
            if let Some(defconfig) = &config.kernel_config {
                self.run_step(
                    lease,
                    &format!("make -C {} {}", source, defconfig),
                    env,
                    logs,
                    cancel,
                )
                .await?
                .ok()?;
            }
            let extra = if config.extra_make_args.is_empty() {
                String::new()
            } else {
                format!(" {}", config.extra_make_args.join(" "))
            };
            self.run_step(
                lease,
                &format!("make -C {} -j{}{}", source, jobs, extra),
                env,
                logs,
                cancel,
            )
            .await?
            .ok()?;
            if config.enable_modules {
                self.run_step(
                    lease,
                    &format!("make -C {} -j{} modules", source, jobs),
                    env,
                    logs,
                    cancel,
                )
                .await?
                .ok()?;
            }
            if config.build_dtbs {
                self.run_step(lease, &format!("make -C {} dtbs", source), env, logs, cancel)
                    .await?
                    .ok()?;
            }
        }

        self.collect(lease, job, &source, logs, cancel).await
    }

    async fn collect(
        &self,
        lease: &PooledSession,
        job: &BuildJob,
        source: &str,
        logs: &LogBuffer,
        cancel: &CancelToken,
    ) -> Result<Vec<ArtifactDraft>> {
        let staging = self.staging_root.join(&job.id);
        std::fs::create_dir_all(&staging)
            .map_err(|e| Error::validation(format!("create {}: {}", staging.display(), e)))?;

        let mut patterns: Vec<(ArtifactKind, String)> = vec![
            (
                ArtifactKind::KernelImage,
                format!(
                    "find {} -type f \\( -name Image -o -name Image.gz -o -name zImage -o -name bzImage -o -name vmlinuz \\)",
                    source
                ),
            ),
            (
                ArtifactKind::Initrd,
                format!(
                    "find {} -type f \\( -name 'initrd*' -o -name 'initramfs*' \\)",
                    source
                ),
            ),
        ];
        if job.build_config.build_dtbs {
            patterns.push((
                ArtifactKind::DeviceTree,
                format!("find {} -type f -name '*.dtb'", source),
            ));
        }

        let mut drafts = Vec::new();
        for (kind, command) in patterns {
            let listing = self
                .run_step(lease, &command, &job.build_config.env, logs, cancel)
                .await?
                .ok()?;
            for remote in listing.stdout.lines().filter(|l| !l.trim().is_empty()) {
                let filename = remote.rsplit('/').next().unwrap_or(remote).to_string();
                let local = staging.join(&filename);
                let bytes = self
                    .pool
                    .backend()
                    .download(&lease.session, remote.trim(), &local, cancel)
                    .await?;
                debug!(job = %job.id, file = %filename, bytes, "artifact staged");
                logs.append(format!("collected {} ({} bytes)", filename, bytes));
                drafts.push(ArtifactDraft {
                    kind,
                    filename,
                    local_path: local,
                });
            }
        }

        if !drafts.iter().any(|d| d.kind == ArtifactKind::KernelImage) {
            return Err(Error::Remote(
                "build produced no kernel image".to_string(),
            ));
        }

        // The job's own log rides along as a build-log artifact.
        let log_path = staging.join("build.log");
        let text: String = logs
            .lines()
            .iter()
            .map(|l| format!("{} {}\n", l.at.to_rfc3339(), l.line))
            .collect();
        std::fs::write(&log_path, text)
            .map_err(|e| Error::validation(format!("write {}: {}", log_path.display(), e)))?;
        drafts.push(ArtifactDraft {
            kind: ArtifactKind::BuildLog,
            filename: "build.log".to_string(),
            local_path: log_path,
        });

        Ok(drafts)
    }
}

#[async_trait]
impl BuildRunner for ShellBuildRunner {
    async fn run(
        &self,
        job: &BuildJob,
        server: &BuildServer,
        logs: &LogBuffer,
        cancel: &CancelToken,
    ) -> Result<Vec<ArtifactDraft>> {
        let lease = self.pool.lease(&server.credentials, cancel).await?;
        let workspace = Self::workspace_for(job);

        let outcome = self
            .execute(&lease, job, server, &workspace, logs, cancel)
            .await;

        // Cleanup always runs, even after failure or cancellation.
        if self.keep_workspace {
            logs.append(format!("workspace kept at {}", workspace));
        } else {
            let cleanup = self
                .run_step(
                    &lease,
                    &format!("rm -rf {}", workspace),
                    &BTreeMap::new(),
                    logs,
                    &CancelToken::none(),
                )
                .await;
            if let Err(error) = cleanup {
                warn!(job = %job.id, %error, "workspace cleanup failed");
            }
        }

        match &outcome {
            Err(Error::Transport(_)) | Err(Error::Cancelled) => self.pool.discard(lease).await,
            _ => self.pool.restore(lease),
        }
        outcome
    }
}
