//! Resource groups, allocation policy, and decommission gating.
//!
//! Groups partition assets of one kind; an asset belongs to at most one
//! group and moving it re-links. The allocation check runs before any
//! group resource is handed out: approval-gated groups reject outright,
//! team reservations reject outsiders, and the concurrent-allocation cap
//! bounds open allocations. An asset in maintenance is never allocatable.
//!
//! At any instant a resource has at most one open allocation. Expired
//! allocations are closed by the reaper. Decommission only succeeds for
//! an asset with no open allocation and no active workload; `force`
//! bypasses the check but still releases open allocations before removal.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use fleet_config::GroupOptions;
use fleet_registry::Registry;
use fleet_transport::CancelToken;
use fleet_types::{
    Allocation, AllocationPolicy, Asset, AssetKind, BoardStatus, Error, ResourceGroup, Result,
    new_id,
};

/// A group definition.
#[derive(Debug, Clone)]
pub struct NewGroup {
    pub name: String,
    pub kind: AssetKind,
    pub description: Option<String>,
    pub labels: BTreeMap<String, String>,
    pub policy: AllocationPolicy,
}

/// A request for a policy-governed allocation out of a group.
#[derive(Debug, Clone)]
pub struct AllocationRequest {
    pub group_id: String,
    /// A specific member, or `None` for any free one.
    pub resource_id: Option<String>,
    pub requester: String,
    pub team: String,
    /// Requested lease length; the policy's or configured default applies
    /// when absent.
    pub duration: Option<Duration>,
}

/// Aggregated view over a group's members and allocations.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize)]
pub struct GroupStatistics {
    pub group_id: String,
    pub member_count: usize,
    pub members_by_status: BTreeMap<String, usize>,
    pub total_cpu_cores: u64,
    pub total_memory_mb: u64,
    pub total_storage_gb: u64,
    /// Average across members that report utilization (boards do not).
    pub average_utilization: Option<f64>,
    pub active_workloads: u32,
    pub queued_workloads: u32,
    pub open_allocations: usize,
    pub max_allocations: Option<u32>,
}

#[derive(Default)]
struct GroupState {
    groups: HashMap<String, ResourceGroup>,
    allocations: HashMap<String, Allocation>,
}

/// Group and allocation management.
pub struct GroupManager {
    registry: Arc<Registry>,
    options: GroupOptions,
    state: Mutex<GroupState>,
}

impl GroupManager {
    pub fn new(registry: Arc<Registry>, options: GroupOptions) -> Self {
        Self {
            registry,
            options,
            state: Mutex::new(GroupState::default()),
        }
    }

    pub fn create_group(&self, new_group: NewGroup) -> Result<ResourceGroup> {
        if new_group.name.trim().is_empty() {
            return Err(Error::validation("group name must not be empty"));
        }
        let mut state = self.state.lock().expect("group lock");
        if state.groups.values().any(|g| g.name == new_group.name) {
            return Err(Error::conflict(format!(
                "group named {} already exists",
                new_group.name
            )));
        }
        let now = Utc::now();
        let group = ResourceGroup {
            id: new_id("grp"),
            name: new_group.name,
            kind: new_group.kind,
            description: new_group.description,
            labels: new_group.labels,
            policy: new_group.policy,
            member_ids: Vec::new(),
            created_at: now,
            updated_at: now,
        };
        state.groups.insert(group.id.clone(), group.clone());
        Ok(group)
    }

    pub fn group(&self, group_id: &str) -> Result<ResourceGroup> {
        self.state
            .lock()
            .expect("group lock")
            .groups
            .get(group_id)
            .cloned()
            .ok_or_else(|| Error::not_found("group", group_id))
    }

    pub fn group_by_name(&self, name: &str) -> Option<ResourceGroup> {
        self.state
            .lock()
            .expect("group lock")
            .groups
            .values()
            .find(|g| g.name == name)
            .cloned()
    }

    pub fn groups(&self, kind: Option<AssetKind>) -> Vec<ResourceGroup> {
        let state = self.state.lock().expect("group lock");
        let mut groups: Vec<ResourceGroup> = state
            .groups
            .values()
            .filter(|g| kind.is_none_or(|k| g.kind == k))
            .cloned()
            .collect();
        groups.sort_by(|a, b| a.id.cmp(&b.id));
        groups
    }

    pub fn update_policy(&self, group_id: &str, policy: AllocationPolicy) -> Result<ResourceGroup> {
        let mut state = self.state.lock().expect("group lock");
        let group = state
            .groups
            .get_mut(group_id)
            .ok_or_else(|| Error::not_found("group", group_id))?;
        group.policy = policy;
        group.updated_at = Utc::now();
        Ok(group.clone())
    }

    /// Delete a group with no open allocations, unlinking its members.
    pub fn delete_group(&self, group_id: &str) -> Result<()> {
        let members = {
            let mut state = self.state.lock().expect("group lock");
            if !state.groups.contains_key(group_id) {
                return Err(Error::not_found("group", group_id));
            }
            if state
                .allocations
                .values()
                .any(|a| a.group_id == group_id && a.is_open())
            {
                return Err(Error::conflict(format!(
                    "group {} has open allocations",
                    group_id
                )));
            }
            let group = state.groups.remove(group_id).expect("group present");
            group.member_ids
        };
        for member in members {
            let _ = self.registry.set_group(&member, None);
        }
        Ok(())
    }

    /// Add a resource to a group, moving it out of any previous group.
    pub fn add_member(&self, group_id: &str, resource_id: &str) -> Result<()> {
        let asset = self
            .registry
            .get(resource_id)
            .ok_or_else(|| Error::not_found("asset", resource_id))?;

        {
            let mut state = self.state.lock().expect("group lock");
            let Some(group) = state.groups.get(group_id) else {
                return Err(Error::not_found("group", group_id));
            };
            if group.kind != asset.kind() {
                return Err(Error::validation(format!(
                    "group {} holds {} assets, not {}",
                    group_id,
                    group.kind,
                    asset.kind()
                )));
            }

            // Moving re-links: drop the resource from any other group.
            for other in state.groups.values_mut() {
                other.member_ids.retain(|m| m != resource_id);
            }
            let group = state.groups.get_mut(group_id).expect("group present");
            if !group.has_member(resource_id) {
                group.member_ids.push(resource_id.to_string());
            }
            group.updated_at = Utc::now();
        }

        self.registry
            .set_group(resource_id, Some(group_id.to_string()))?;
        Ok(())
    }

    pub fn remove_member(&self, group_id: &str, resource_id: &str) -> Result<()> {
        {
            let mut state = self.state.lock().expect("group lock");
            let group = state
                .groups
                .get_mut(group_id)
                .ok_or_else(|| Error::not_found("group", group_id))?;
            let before = group.member_ids.len();
            group.member_ids.retain(|m| m != resource_id);
            if group.member_ids.len() == before {
                return Err(Error::not_found("group member", resource_id));
            }
            group.updated_at = Utc::now();
        }
        self.registry.set_group(resource_id, None)?;
        Ok(())
    }

    /// The allocation policy gate, evaluated before any group resource is
    /// handed out.
    pub fn check_allocation(&self, group_id: &str, team: &str) -> Result<()> {
        let state = self.state.lock().expect("group lock");
        let group = state
            .groups
            .get(group_id)
            .ok_or_else(|| Error::not_found("group", group_id))?;
        Self::check_policy_locked(&state, group, team)
    }

    fn check_policy_locked(state: &GroupState, group: &ResourceGroup, team: &str) -> Result<()> {
        if group.policy.require_approval {
            return Err(Error::conflict(format!(
                "group {} requires approval for allocations",
                group.name
            )));
        }
        if !group.policy.allows_team(team) {
            return Err(Error::conflict(format!(
                "group {} is reserved for teams {:?}",
                group.name, group.policy.reserved_for_teams
            )));
        }
        let open = state
            .allocations
            .values()
            .filter(|a| a.group_id == group.id && a.is_open())
            .count() as u32;
        if !group.policy.can_allocate(open) {
            return Err(Error::conflict(format!(
                "group {} reached max concurrent allocations",
                group.name
            )));
        }
        Ok(())
    }

    /// Allocate a member of the group to the requester, under policy.
    pub fn allocate(&self, request: AllocationRequest) -> Result<Allocation> {
        // Registry is consulted before the group lock is taken (lock order
        // is registry before groups, never under it). Membership changes
        // between the snapshot and the check just shrink the candidates.
        let members = self.group(&request.group_id)?.member_ids;
        let usable: std::collections::HashSet<String> = members
            .iter()
            .filter(|id| {
                self.registry
                    .get(id)
                    .is_some_and(|asset| !asset.maintenance())
            })
            .cloned()
            .collect();

        let mut state = self.state.lock().expect("group lock");
        let group = state
            .groups
            .get(&request.group_id)
            .cloned()
            .ok_or_else(|| Error::not_found("group", &request.group_id))?;

        Self::check_policy_locked(&state, &group, &request.team)?;

        let candidate_ids: Vec<String> = match &request.resource_id {
            Some(resource_id) => {
                if !group.has_member(resource_id) {
                    return Err(Error::not_found("group member", resource_id));
                }
                vec![resource_id.clone()]
            }
            None => {
                let mut members = group.member_ids.clone();
                members.sort();
                members
            }
        };

        let chosen = candidate_ids.into_iter().find(|id| {
            let free = !state
                .allocations
                .values()
                .any(|a| a.resource_id == *id && a.is_open());
            free && usable.contains(id)
        });

        let Some(resource_id) = chosen else {
            return Err(Error::Exhausted {
                wait_estimate: None,
            });
        };

        let now = Utc::now();
        let duration = request
            .duration
            .or(group.policy.max_allocation_duration)
            .or(self.options.default_max_allocation_duration);
        let allocation = Allocation {
            id: new_id("alloc"),
            group_id: request.group_id.clone(),
            resource_id,
            requester: request.requester,
            team: request.team,
            allocated_at: now,
            expires_at: duration
                .and_then(|d| chrono::Duration::from_std(d).ok())
                .map(|d| now + d),
            released_at: None,
        };
        state
            .allocations
            .insert(allocation.id.clone(), allocation.clone());
        info!(
            allocation = %allocation.id,
            group = %allocation.group_id,
            resource = %allocation.resource_id,
            team = %allocation.team,
            "resource allocated"
        );
        Ok(allocation)
    }

    pub fn release(&self, allocation_id: &str) -> Result<Allocation> {
        let mut state = self.state.lock().expect("group lock");
        let allocation = state
            .allocations
            .get_mut(allocation_id)
            .ok_or_else(|| Error::not_found("allocation", allocation_id))?;
        if !allocation.is_open() {
            return Err(Error::conflict(format!(
                "allocation {} already released",
                allocation_id
            )));
        }
        allocation.released_at = Some(Utc::now());
        Ok(allocation.clone())
    }

    pub fn open_allocations(&self, group_id: &str) -> Vec<Allocation> {
        let state = self.state.lock().expect("group lock");
        let mut allocations: Vec<Allocation> = state
            .allocations
            .values()
            .filter(|a| a.group_id == group_id && a.is_open())
            .cloned()
            .collect();
        allocations.sort_by(|a, b| a.allocated_at.cmp(&b.allocated_at));
        allocations
    }

    pub fn allocation(&self, allocation_id: &str) -> Option<Allocation> {
        self.state
            .lock()
            .expect("group lock")
            .allocations
            .get(allocation_id)
            .cloned()
    }

    /// Close every allocation whose lease has expired.
    pub fn reap_expired(&self, now: DateTime<Utc>) -> Vec<Allocation> {
        let mut state = self.state.lock().expect("group lock");
        let mut reaped = Vec::new();
        for allocation in state.allocations.values_mut() {
            if allocation.is_expired_at(now) {
                allocation.released_at = Some(now);
                reaped.push(allocation.clone());
            }
        }
        if !reaped.is_empty() {
            info!(count = reaped.len(), "expired allocations reaped");
        }
        reaped
    }

    /// Periodic reaper task.
    pub async fn run_reaper(self: Arc<Self>, interval: Duration, cancel: CancelToken) {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = cancel.cancelled() => break,
            }
            self.reap_expired(Utc::now());
        }
    }

    /// Whether the asset currently runs anything: builds, guests, an
    /// assigned test, or a flash in progress.
    pub fn has_active_workload(&self, asset: &Asset) -> bool {
        match asset {
            Asset::BuildServer(server) => server.active_build_count > 0,
            Asset::VirtHost(host) => host.running_guest_count > 0,
            Asset::Board(board) => {
                board.assigned_test_id.is_some()
                    || matches!(board.status, BoardStatus::Flashing | BoardStatus::InUse)
            }
        }
    }

    /// Remove an asset from the fleet. Refused while the asset has an
    /// open allocation or an active workload, unless forced; force still
    /// releases the open allocations atomically before removal.
    pub fn decommission(&self, resource_id: &str, force: bool) -> Result<Asset> {
        let asset = self
            .registry
            .get(resource_id)
            .ok_or_else(|| Error::not_found("asset", resource_id))?;

        {
            let mut state = self.state.lock().expect("group lock");
            let open: Vec<String> = state
                .allocations
                .values()
                .filter(|a| a.resource_id == resource_id && a.is_open())
                .map(|a| a.id.clone())
                .collect();

            if !force {
                if !open.is_empty() {
                    return Err(Error::conflict(format!(
                        "asset {} has {} open allocation(s)",
                        resource_id,
                        open.len()
                    )));
                }
                if self.has_active_workload(&asset) {
                    return Err(Error::conflict(format!(
                        "asset {} has active workloads",
                        resource_id
                    )));
                }
            } else if !open.is_empty() {
                let now = Utc::now();
                for id in &open {
                    if let Some(allocation) = state.allocations.get_mut(id) {
                        allocation.released_at = Some(now);
                    }
                }
                warn!(
                    asset = %resource_id,
                    released = open.len(),
                    "forced decommission released open allocations"
                );
            }

            for group in state.groups.values_mut() {
                group.member_ids.retain(|m| m != resource_id);
            }
        }

        let removed = self.registry.remove(resource_id)?;
        info!(asset = %resource_id, "asset decommissioned");
        Ok(removed)
    }

    /// Aggregate statistics over a group's members.
    pub fn statistics(&self, group_id: &str) -> Result<GroupStatistics> {
        let group = self.group(group_id)?;
        let mut stats = GroupStatistics {
            group_id: group_id.to_string(),
            member_count: group.member_ids.len(),
            max_allocations: group.policy.max_concurrent_allocations,
            ..GroupStatistics::default()
        };
        stats.open_allocations = self.open_allocations(group_id).len();

        let mut utilizations = Vec::new();
        for member in &group.member_ids {
            let Some(asset) = self.registry.get(member) else {
                continue;
            };
            let status = match &asset {
                Asset::BuildServer(s) => format!("{:?}", s.status).to_lowercase(),
                Asset::VirtHost(h) => format!("{:?}", h.status).to_lowercase(),
                Asset::Board(b) => format!("{:?}", b.status).to_lowercase(),
            };
            *stats.members_by_status.entry(status).or_insert(0) += 1;

            match &asset {
                Asset::BuildServer(s) => {
                    stats.total_cpu_cores += u64::from(s.total_cpu_cores);
                    stats.total_memory_mb += s.total_memory_mb;
                    stats.total_storage_gb += s.total_storage_gb;
                    stats.active_workloads += s.active_build_count;
                    stats.queued_workloads += s.queue_depth;
                }
                Asset::VirtHost(h) => {
                    stats.total_cpu_cores += u64::from(h.total_cpu_cores);
                    stats.total_memory_mb += h.total_memory_mb;
                    stats.total_storage_gb += h.total_storage_gb;
                    stats.active_workloads += h.running_guest_count;
                }
                Asset::Board(b) => {
                    if b.assigned_test_id.is_some() {
                        stats.active_workloads += 1;
                    }
                }
            }
            if let Some(utilization) = asset.utilization() {
                utilizations.push(utilization.average());
            }
        }
        stats.average_utilization = if utilizations.is_empty() {
            None
        } else {
            Some(utilizations.iter().sum::<f64>() / utilizations.len() as f64)
        };
        Ok(stats)
    }
}
