//! Content-addressed artifact index.
//!
//! Build outputs are ingested with a streamed sha-256 (chunked reads, so a
//! large rootfs never pins a worker), stored under
//! `<root>/<build-id>/<filename>`, and indexed by build, by commit, and by
//! a per-(branch, architecture) latest pointer that is only advanced when
//! a build is finalized as successful.
//!
//! Retention deletes whole builds older than the window unless they are
//! pinned or carry the `preserve` tag; latest pointers are retargeted to
//! the newest surviving build (or cleared) so they never dangle.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::io::AsyncReadExt;
use tracing::{debug, info};

use fleet_types::{Artifact, ArtifactKind, ArtifactSelection, Error, Result, new_id};

/// Tag that exempts a build from retention, alongside pinning.
pub const PRESERVE_TAG: &str = "preserve";

const HASH_CHUNK: usize = 64 * 1024;

/// Identity of a build whose artifacts are being ingested.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildMeta {
    pub build_id: String,
    pub branch: String,
    pub architecture: String,
    pub commit_hash: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct BuildRecord {
    meta: BuildMeta,
    pinned: bool,
    tags: Vec<String>,
    finalized: bool,
}

/// Outcome of a retention pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupReport {
    pub builds_deleted: usize,
    pub artifacts_deleted: usize,
    pub bytes_freed: u64,
}

/// Aggregate storage numbers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageStats {
    pub build_count: usize,
    pub artifact_count: usize,
    pub total_bytes: u64,
}

#[derive(Default)]
struct IndexState {
    artifacts: HashMap<String, Artifact>,
    by_build: HashMap<String, Vec<String>>,
    builds: HashMap<String, BuildRecord>,
    by_commit: HashMap<String, Vec<String>>,
    latest: HashMap<(String, String), String>,
}

/// The artifact store and its lookup indexes.
pub struct ArtifactIndex {
    root: PathBuf,
    retention_days: u32,
    state: Mutex<IndexState>,
}

impl ArtifactIndex {
    pub fn new(root: impl Into<PathBuf>, retention_days: u32) -> Self {
        Self {
            root: root.into(),
            retention_days,
            state: Mutex::new(IndexState::default()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Register a build before ingesting its files.
    pub fn register_build(&self, meta: BuildMeta) -> Result<()> {
        let mut state = self.state.lock().expect("index lock");
        if state.builds.contains_key(&meta.build_id) {
            return Err(Error::conflict(format!(
                "build {} already registered",
                meta.build_id
            )));
        }
        state
            .by_commit
            .entry(meta.commit_hash.clone())
            .or_default()
            .push(meta.build_id.clone());
        state.builds.insert(
            meta.build_id.clone(),
            BuildRecord {
                meta,
                pinned: false,
                tags: Vec::new(),
                finalized: false,
            },
        );
        Ok(())
    }

    /// Copy a file into the store, hashing it on the way through.
    pub async fn ingest_file(
        &self,
        build_id: &str,
        kind: ArtifactKind,
        filename: &str,
        source: &Path,
    ) -> Result<Artifact> {
        let meta = {
            let state = self.state.lock().expect("index lock");
            let record = state
                .builds
                .get(build_id)
                .ok_or_else(|| Error::not_found("build", build_id))?;
            if state
                .by_build
                .get(build_id)
                .is_some_and(|ids| {
                    ids.iter()
                        .filter_map(|id| state.artifacts.get(id))
                        .any(|a| a.filename == filename)
                })
            {
                return Err(Error::conflict(format!(
                    "artifact {} already ingested for build {}",
                    filename, build_id
                )));
            }
            record.meta.clone()
        };

        let destination_dir = self.root.join(build_id);
        tokio::fs::create_dir_all(&destination_dir)
            .await
            .map_err(|e| Error::validation(format!("create {}: {}", destination_dir.display(), e)))?;
        let destination = destination_dir.join(filename);

        let (size_bytes, sha256) = copy_and_hash(source, &destination).await?;

        let artifact = Artifact {
            id: new_id("art"),
            build_id: build_id.to_string(),
            kind,
            filename: filename.to_string(),
            path: destination.display().to_string(),
            size_bytes,
            sha256,
            architecture: meta.architecture.clone(),
            created_at: Utc::now(),
            metadata: Default::default(),
        };

        let mut state = self.state.lock().expect("index lock");
        state
            .by_build
            .entry(build_id.to_string())
            .or_default()
            .push(artifact.id.clone());
        state.artifacts.insert(artifact.id.clone(), artifact.clone());
        debug!(build = %build_id, file = %filename, bytes = size_bytes, "artifact ingested");
        Ok(artifact)
    }

    /// Mark a build successful, advancing the (branch, arch) latest pointer.
    pub fn finalize_build(&self, build_id: &str) -> Result<()> {
        let mut state = self.state.lock().expect("index lock");
        let record = state
            .builds
            .get_mut(build_id)
            .ok_or_else(|| Error::not_found("build", build_id))?;
        record.finalized = true;
        let key = (
            record.meta.branch.clone(),
            record.meta.architecture.clone(),
        );
        state.latest.insert(key, build_id.to_string());
        Ok(())
    }

    /// Attach a metadata key to an ingested artifact (e.g. the firmware
    /// version a kernel image represents).
    pub fn annotate(&self, artifact_id: &str, key: &str, value: &str) -> Result<()> {
        let mut state = self.state.lock().expect("index lock");
        let artifact = state
            .artifacts
            .get_mut(artifact_id)
            .ok_or_else(|| Error::not_found("artifact", artifact_id))?;
        artifact
            .metadata
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    pub fn get(&self, artifact_id: &str) -> Option<Artifact> {
        self.state
            .lock()
            .expect("index lock")
            .artifacts
            .get(artifact_id)
            .cloned()
    }

    pub fn by_build(&self, build_id: &str) -> Vec<Artifact> {
        let state = self.state.lock().expect("index lock");
        state
            .by_build
            .get(build_id)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| state.artifacts.get(id))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Build id behind latest(branch, arch), when set.
    pub fn latest_build(&self, branch: &str, architecture: &str) -> Option<String> {
        self.state
            .lock()
            .expect("index lock")
            .latest
            .get(&(branch.to_string(), architecture.to_string()))
            .cloned()
    }

    /// Resolve a selection. An invalid selection (nothing set) is empty,
    /// not an error.
    pub fn by_selection(&self, selection: &ArtifactSelection) -> Vec<Artifact> {
        if !selection.is_valid() {
            return Vec::new();
        }

        if let Some(build_id) = &selection.build_id {
            return self.filter_arch(self.by_build(build_id), selection);
        }

        if let Some(commit) = &selection.commit_hash {
            let build_ids = {
                let state = self.state.lock().expect("index lock");
                state.by_commit.get(commit).cloned().unwrap_or_default()
            };
            // Newest build for the commit wins.
            let newest = {
                let state = self.state.lock().expect("index lock");
                build_ids
                    .iter()
                    .filter_map(|id| state.builds.get(id))
                    .filter(|record| {
                        selection
                            .architecture
                            .as_deref()
                            .is_none_or(|arch| record.meta.architecture.eq_ignore_ascii_case(arch))
                    })
                    .max_by_key(|record| record.meta.created_at)
                    .map(|record| record.meta.build_id.clone())
            };
            return newest
                .map(|id| self.filter_arch(self.by_build(&id), selection))
                .unwrap_or_default();
        }

        if let (Some(branch), true) = (&selection.branch, selection.use_latest) {
            let Some(arch) = &selection.architecture else {
                return Vec::new();
            };
            return self
                .latest_build(branch, arch)
                .map(|id| self.by_build(&id))
                .unwrap_or_default();
        }

        Vec::new()
    }

    fn filter_arch(&self, artifacts: Vec<Artifact>, selection: &ArtifactSelection) -> Vec<Artifact> {
        match &selection.architecture {
            None => artifacts,
            Some(arch) => artifacts
                .into_iter()
                .filter(|a| a.matches_architecture(arch))
                .collect(),
        }
    }

    /// Re-hash an artifact's bytes against the recorded digest.
    pub async fn verify(&self, artifact_id: &str) -> Result<bool> {
        let artifact = self
            .get(artifact_id)
            .ok_or_else(|| Error::not_found("artifact", artifact_id))?;
        let actual = hash_file(Path::new(&artifact.path)).await?;
        Ok(actual == artifact.sha256)
    }

    pub fn pin_build(&self, build_id: &str) -> Result<()> {
        self.set_pin(build_id, true)
    }

    pub fn unpin_build(&self, build_id: &str) -> Result<()> {
        self.set_pin(build_id, false)
    }

    fn set_pin(&self, build_id: &str, pinned: bool) -> Result<()> {
        let mut state = self.state.lock().expect("index lock");
        let record = state
            .builds
            .get_mut(build_id)
            .ok_or_else(|| Error::not_found("build", build_id))?;
        record.pinned = pinned;
        Ok(())
    }

    pub fn tag_build(&self, build_id: &str, tag: &str) -> Result<()> {
        let mut state = self.state.lock().expect("index lock");
        let record = state
            .builds
            .get_mut(build_id)
            .ok_or_else(|| Error::not_found("build", build_id))?;
        if !record.tags.iter().any(|t| t == tag) {
            record.tags.push(tag.to_string());
        }
        Ok(())
    }

    pub fn build_tags(&self, build_id: &str) -> Vec<String> {
        self.state
            .lock()
            .expect("index lock")
            .builds
            .get(build_id)
            .map(|record| record.tags.clone())
            .unwrap_or_default()
    }

    pub fn is_pinned(&self, build_id: &str) -> bool {
        self.state
            .lock()
            .expect("index lock")
            .builds
            .get(build_id)
            .is_some_and(|record| record.pinned)
    }

    /// Delete builds older than the retention window, skipping pinned and
    /// preserve-tagged builds. Latest pointers are retargeted or cleared.
    pub async fn run_retention(&self, now: DateTime<Utc>) -> Result<CleanupReport> {
        let cutoff = now - chrono::Duration::days(i64::from(self.retention_days));

        let (doomed, files): (Vec<String>, Vec<(PathBuf, u64)>) = {
            let state = self.state.lock().expect("index lock");
            let doomed: Vec<String> = state
                .builds
                .values()
                .filter(|record| {
                    record.meta.created_at < cutoff
                        && !record.pinned
                        && !record.tags.iter().any(|t| t == PRESERVE_TAG)
                })
                .map(|record| record.meta.build_id.clone())
                .collect();
            let files = doomed
                .iter()
                .flat_map(|build_id| {
                    state
                        .by_build
                        .get(build_id)
                        .into_iter()
                        .flatten()
                        .filter_map(|id| state.artifacts.get(id))
                        .map(|a| (PathBuf::from(&a.path), a.size_bytes))
                })
                .collect();
            (doomed, files)
        };

        if doomed.is_empty() {
            return Ok(CleanupReport::default());
        }

        let mut report = CleanupReport::default();
        for (path, size) in &files {
            if tokio::fs::remove_file(path).await.is_ok() {
                report.bytes_freed += size;
            }
            report.artifacts_deleted += 1;
        }

        let mut state = self.state.lock().expect("index lock");
        for build_id in &doomed {
            if let Some(ids) = state.by_build.remove(build_id) {
                for id in ids {
                    state.artifacts.remove(&id);
                }
            }
            if let Some(record) = state.builds.remove(build_id) {
                if let Some(ids) = state.by_commit.get_mut(&record.meta.commit_hash) {
                    ids.retain(|id| id != build_id);
                }
            }
            report.builds_deleted += 1;
        }

        // Latest pointers must never dangle: retarget each orphaned pointer
        // to the newest surviving finalized build, or clear it.
        let keys: Vec<(String, String)> = state
            .latest
            .iter()
            .filter(|(_, build_id)| !state.builds.contains_key(*build_id))
            .map(|(key, _)| key.clone())
            .collect();
        for key in keys {
            let replacement = state
                .builds
                .values()
                .filter(|record| {
                    record.finalized
                        && record.meta.branch == key.0
                        && record.meta.architecture == key.1
                })
                .max_by_key(|record| record.meta.created_at)
                .map(|record| record.meta.build_id.clone());
            match replacement {
                Some(build_id) => {
                    state.latest.insert(key, build_id);
                }
                None => {
                    state.latest.remove(&key);
                }
            }
        }

        info!(
            builds = report.builds_deleted,
            bytes = report.bytes_freed,
            "retention pass complete"
        );
        Ok(report)
    }

    pub fn storage_stats(&self) -> StorageStats {
        let state = self.state.lock().expect("index lock");
        StorageStats {
            build_count: state.builds.len(),
            artifact_count: state.artifacts.len(),
            total_bytes: state.artifacts.values().map(|a| a.size_bytes).sum(),
        }
    }
}

/// Stream a file into the destination while hashing it. Chunked so large
/// images yield between reads.
async fn copy_and_hash(source: &Path, destination: &Path) -> Result<(u64, String)> {
    use tokio::io::AsyncWriteExt;

    let mut input = tokio::fs::File::open(source)
        .await
        .map_err(|e| Error::validation(format!("open {}: {}", source.display(), e)))?;
    let mut output = tokio::fs::File::create(destination)
        .await
        .map_err(|e| Error::validation(format!("create {}: {}", destination.display(), e)))?;

    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; HASH_CHUNK];
    let mut total = 0u64;
    loop {
        let read = input
            .read(&mut buffer)
            .await
            .map_err(|e| Error::validation(format!("read {}: {}", source.display(), e)))?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
        output
            .write_all(&buffer[..read])
            .await
            .map_err(|e| Error::validation(format!("write {}: {}", destination.display(), e)))?;
        total += read as u64;
        tokio::task::yield_now().await;
    }
    output
        .flush()
        .await
        .map_err(|e| Error::validation(format!("flush {}: {}", destination.display(), e)))?;
    Ok((total, hex::encode(hasher.finalize())))
}

/// Streamed sha-256 of a file on disk.
pub async fn hash_file(path: &Path) -> Result<String> {
    let mut input = tokio::fs::File::open(path)
        .await
        .map_err(|e| Error::validation(format!("open {}: {}", path.display(), e)))?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; HASH_CHUNK];
    loop {
        let read = input
            .read(&mut buffer)
            .await
            .map_err(|e| Error::validation(format!("read {}: {}", path.display(), e)))?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
        tokio::task::yield_now().await;
    }
    Ok(hex::encode(hasher.finalize()))
}
