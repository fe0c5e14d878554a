//! Build-server selection.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use fleet_registry::Registry;
use fleet_types::{BuildServer, Error, Reservation, Result};

use crate::ledger::ReservationLedger;

/// What a build job needs from a server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildRequirements {
    pub target_architecture: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub required_toolchain: Option<String>,
    #[serde(default = "default_min_cpu")]
    pub min_cpu_cores: u32,
    #[serde(default = "default_min_memory")]
    pub min_memory_mb: u64,
    #[serde(default = "default_min_storage")]
    pub min_storage_gb: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preferred_server_id: Option<String>,
    #[serde(default)]
    pub required_labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<String>,
}

fn default_min_cpu() -> u32 {
    1
}

fn default_min_memory() -> u64 {
    2048
}

fn default_min_storage() -> u64 {
    10
}

impl BuildRequirements {
    pub fn for_architecture(arch: &str) -> Self {
        Self {
            target_architecture: arch.to_string(),
            required_toolchain: None,
            min_cpu_cores: default_min_cpu(),
            min_memory_mb: default_min_memory(),
            min_storage_gb: default_min_storage(),
            preferred_server_id: None,
            required_labels: BTreeMap::new(),
            group_id: None,
        }
    }
}

/// A selected server plus its hold and runners-up.
#[derive(Debug, Clone)]
pub struct ServerSelection {
    pub server: BuildServer,
    pub reservation: Reservation,
    pub alternatives: Vec<BuildServer>,
}

/// Scores and reserves build servers.
pub struct BuildServerSelector {
    registry: Arc<Registry>,
    ledger: ReservationLedger,
    utilization_weight: f64,
    queue_weight: f64,
    capacity_weight: f64,
}

impl BuildServerSelector {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self {
            registry,
            ledger: ReservationLedger::default(),
            utilization_weight: 0.4,
            queue_weight: 0.3,
            capacity_weight: 0.3,
        }
    }

    pub fn ledger(&self) -> &ReservationLedger {
        &self.ledger
    }

    /// Pick the best eligible server and reserve it.
    pub fn select(&self, requirements: &BuildRequirements) -> Result<ServerSelection> {
        // Fast path: an eligible preferred server wins outright.
        if let Some(preferred) = &requirements.preferred_server_id {
            if let Ok(server) = self.registry.server(preferred) {
                if self.meets(&server, requirements) && !self.ledger.is_reserved(&server.id) {
                    let reservation = self.ledger.try_reserve(&server.id, "build")?;
                    return Ok(ServerSelection {
                        server,
                        reservation,
                        alternatives: Vec::new(),
                    });
                }
            }
        }

        let mut candidates: Vec<(BuildServer, f64)> = self
            .registry
            .servers()
            .into_iter()
            .filter(|s| self.meets(s, requirements) && !self.ledger.is_reserved(&s.id))
            .map(|s| {
                let score = self.score(&s, requirements);
                (s, score)
            })
            .collect();

        if candidates.is_empty() {
            return Err(Error::Exhausted {
                wait_estimate: self.estimate_wait(requirements),
            });
        }

        // Score descending, then lower load, then id for determinism.
        candidates.sort_by(|(a, sa), (b, sb)| {
            sb.partial_cmp(sa)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.active_build_count.cmp(&b.active_build_count))
                .then(a.id.cmp(&b.id))
        });

        for (index, (server, score)) in candidates.iter().enumerate() {
            match self.ledger.try_reserve(&server.id, "build") {
                Ok(reservation) => {
                    debug!(server = %server.id, score, "build server selected");
                    let alternatives = candidates
                        .iter()
                        .enumerate()
                        .filter(|(i, _)| *i != index)
                        .take(3)
                        .map(|(_, (s, _))| s.clone())
                        .collect();
                    return Ok(ServerSelection {
                        server: server.clone(),
                        reservation,
                        alternatives,
                    });
                }
                // Raced with another selection; try the runner-up.
                Err(Error::Conflict(_)) => continue,
                Err(other) => return Err(other),
            }
        }

        Err(Error::Exhausted {
            wait_estimate: self.estimate_wait(requirements),
        })
    }

    pub fn release(&self, reservation_id: &str) -> bool {
        self.ledger.release(reservation_id)
    }

    fn meets(&self, server: &BuildServer, requirements: &BuildRequirements) -> bool {
        if !server.has_toolchain_for(&requirements.target_architecture) {
            return false;
        }
        if let Some(toolchain) = &requirements.required_toolchain {
            if !server
                .toolchains
                .iter()
                .any(|tc| &tc.name == toolchain && tc.available)
            {
                return false;
            }
        }
        if !server.capacity().meets(
            requirements.min_cpu_cores,
            requirements.min_memory_mb,
            requirements.min_storage_gb,
        ) {
            return false;
        }
        if let Some(group) = &requirements.group_id {
            if server.group_id.as_deref() != Some(group.as_str()) {
                return false;
            }
        }
        requirements
            .required_labels
            .iter()
            .all(|(key, value)| server.labels.get(key) == Some(value))
    }

    /// Weighted score in [0, 1]: idle capacity, short queue, headroom.
    fn score(&self, server: &BuildServer, requirements: &BuildRequirements) -> f64 {
        let utilization_score = 1.0 - (server.utilization.average() / 100.0);

        let max_queue = (server.max_concurrent_builds * 2).max(1) as f64;
        let queue_score = 1.0 - (f64::from(server.queue_depth) / max_queue).min(1.0);

        let capacity = server.capacity();
        let cpu_ratio = ratio(
            capacity.available_cpu_cores as f64,
            requirements.min_cpu_cores as f64,
        );
        let memory_ratio = ratio(
            capacity.available_memory_mb as f64,
            requirements.min_memory_mb as f64,
        );
        let storage_ratio = ratio(
            capacity.available_storage_gb as f64,
            requirements.min_storage_gb as f64,
        );
        let capacity_score = (cpu_ratio + memory_ratio + storage_ratio) / 3.0;

        self.utilization_weight * utilization_score
            + self.queue_weight * queue_score
            + self.capacity_weight * capacity_score
    }

    /// Seconds until a server could plausibly free up; `None` when no
    /// registered server could ever run this architecture.
    fn estimate_wait(&self, requirements: &BuildRequirements) -> Option<u64> {
        let potential: Vec<BuildServer> = self
            .registry
            .servers()
            .into_iter()
            .filter(|s| s.has_toolchain_for(&requirements.target_architecture))
            .collect();
        if potential.is_empty() {
            return None;
        }
        let total_queue: u64 = potential.iter().map(|s| u64::from(s.queue_depth)).sum();
        let average_queue = total_queue as f64 / potential.len() as f64;
        // A typical kernel build runs about ten minutes.
        Some((average_queue * 600.0) as u64)
    }
}

fn ratio(available: f64, needed: f64) -> f64 {
    (available / needed.max(1.0)).min(2.0) / 2.0
}
