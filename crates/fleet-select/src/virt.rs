//! Virtualization-host selection.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use fleet_registry::Registry;
use fleet_types::{Error, Reservation, Result, VirtHost};

use crate::ledger::ReservationLedger;

/// What a guest needs from a host.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuestRequirements {
    pub architecture: String,
    #[serde(default = "default_min_cpu")]
    pub min_cpu_cores: u32,
    #[serde(default = "default_min_memory")]
    pub min_memory_mb: u64,
    #[serde(default = "default_min_storage")]
    pub min_storage_gb: u64,
    #[serde(default)]
    pub require_hw_assist: bool,
    #[serde(default)]
    pub require_nested_virt: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preferred_host_id: Option<String>,
    #[serde(default)]
    pub required_labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<String>,
}

fn default_min_cpu() -> u32 {
    1
}

fn default_min_memory() -> u64 {
    1024
}

fn default_min_storage() -> u64 {
    10
}

impl GuestRequirements {
    pub fn for_architecture(arch: &str) -> Self {
        Self {
            architecture: arch.to_string(),
            min_cpu_cores: default_min_cpu(),
            min_memory_mb: default_min_memory(),
            min_storage_gb: default_min_storage(),
            require_hw_assist: false,
            require_nested_virt: false,
            preferred_host_id: None,
            required_labels: BTreeMap::new(),
            group_id: None,
        }
    }
}

/// A selected host plus its hold and runners-up.
#[derive(Debug, Clone)]
pub struct HostSelection {
    pub host: VirtHost,
    pub reservation: Reservation,
    pub alternatives: Vec<VirtHost>,
}

/// Scores and reserves virtualization hosts.
pub struct VirtHostSelector {
    registry: Arc<Registry>,
    ledger: ReservationLedger,
    utilization_weight: f64,
    capacity_weight: f64,
    guest_weight: f64,
    hw_assist_bonus: f64,
}

impl VirtHostSelector {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self {
            registry,
            ledger: ReservationLedger::default(),
            utilization_weight: 0.4,
            capacity_weight: 0.35,
            guest_weight: 0.25,
            hw_assist_bonus: 0.1,
        }
    }

    pub fn ledger(&self) -> &ReservationLedger {
        &self.ledger
    }

    pub fn select(&self, requirements: &GuestRequirements) -> Result<HostSelection> {
        if let Some(preferred) = &requirements.preferred_host_id {
            if let Ok(host) = self.registry.host(preferred) {
                if self.meets(&host, requirements) && !self.ledger.is_reserved(&host.id) {
                    let reservation = self.ledger.try_reserve(&host.id, "guest")?;
                    return Ok(HostSelection {
                        host,
                        reservation,
                        alternatives: Vec::new(),
                    });
                }
            }
        }

        let mut candidates: Vec<(VirtHost, f64)> = self
            .registry
            .hosts()
            .into_iter()
            .filter(|h| self.meets(h, requirements) && !self.ledger.is_reserved(&h.id))
            .map(|h| {
                let score = self.score(&h, requirements);
                (h, score)
            })
            .collect();

        if candidates.is_empty() {
            return Err(Error::Exhausted {
                wait_estimate: self.estimate_wait(requirements),
            });
        }

        candidates.sort_by(|(a, sa), (b, sb)| {
            sb.partial_cmp(sa)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.running_guest_count.cmp(&b.running_guest_count))
                .then(a.id.cmp(&b.id))
        });

        for (index, (host, score)) in candidates.iter().enumerate() {
            match self.ledger.try_reserve(&host.id, "guest") {
                Ok(reservation) => {
                    debug!(host = %host.id, score, "virt host selected");
                    let alternatives = candidates
                        .iter()
                        .enumerate()
                        .filter(|(i, _)| *i != index)
                        .take(3)
                        .map(|(_, (h, _))| h.clone())
                        .collect();
                    return Ok(HostSelection {
                        host: host.clone(),
                        reservation,
                        alternatives,
                    });
                }
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

    fn meets(&self, host: &VirtHost, requirements: &GuestRequirements) -> bool {
        if !host.supports_architecture(&requirements.architecture) {
            return false;
        }
        if requirements.require_hw_assist && !host.hw_assist {
            return false;
        }
        if requirements.require_nested_virt && !host.nested_virt {
            return false;
        }
        if !host.capacity().meets(
            requirements.min_cpu_cores,
            requirements.min_memory_mb,
            requirements.min_storage_gb,
        ) {
            return false;
        }
        if let Some(group) = &requirements.group_id {
            if host.group_id.as_deref() != Some(group.as_str()) {
                return false;
            }
        }
        requirements
            .required_labels
            .iter()
            .all(|(key, value)| host.labels.get(key) == Some(value))
    }

    /// Weighted score in [0, 1]: idle capacity, headroom, guest slots, and
    /// a bonus when hardware assist is required and present.
    fn score(&self, host: &VirtHost, requirements: &GuestRequirements) -> f64 {
        let utilization_score = 1.0 - (host.utilization.average() / 100.0);

        let capacity = host.capacity();
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

        let guest_score =
            1.0 - (f64::from(host.running_guest_count) / f64::from(host.max_guests.max(1))).min(1.0);

        let mut score = self.utilization_weight * utilization_score
            + self.capacity_weight * capacity_score
            + self.guest_weight * guest_score;
        if requirements.require_hw_assist && host.hw_assist {
            score += self.hw_assist_bonus;
        }
        score.min(1.0)
    }

    fn estimate_wait(&self, requirements: &GuestRequirements) -> Option<u64> {
        let potential: Vec<VirtHost> = self
            .registry
            .hosts()
            .into_iter()
            .filter(|h| h.supports_architecture(&requirements.architecture))
            .collect();
        if potential.is_empty() {
            return None;
        }
        let total_guests: u64 = potential
            .iter()
            .map(|h| u64::from(h.running_guest_count))
            .sum();
        let average = total_guests as f64 / potential.len() as f64;
        // Guests for test runs are short-lived, about ten minutes.
        Some((average * 600.0) as u64)
    }
}

fn ratio(available: f64, needed: f64) -> f64 {
    (available / needed.max(1.0)).min(2.0) / 2.0
}
