//! # Fleet
//!
//! Control plane core for a heterogeneous test-infrastructure fleet: build
//! servers that cross-compile kernel/BSP source, virtualization hosts that
//! run guest VMs, and physical boards reached over shell, serial, and
//! out-of-band power.
//!
//! ## Subsystems
//!
//! - **Build queue + executor** ([`queue`], [`executor`]) - priority
//!   admission, per-server concurrency caps, remote execution, log
//!   streaming, retry.
//! - **Deployment orchestrator** ([`deploy`]) - transfer, flash, boot,
//!   verify, rollback to the last known-good build.
//! - **Pipeline engine** ([`pipeline`]) - build, deploy, boot, test in
//!   strict order with per-stage retry budgets.
//! - **Group/policy engine** ([`groups`]) - team reservations, allocation
//!   caps, maintenance gating, decommission safety.
//! - **Audit trail** ([`events`]) - append-only JSONL log of every job,
//!   deployment, and pipeline transition.
//! - **Log streaming** ([`logs`]) - per-job buffers with live,
//!   drop-slow-readers subscriptions.
//!
//! The surrounding workspace provides the rest: `fleet-registry` owns
//! asset records, `fleet-health` probes them, `fleet-alerts` routes
//! degradations, `fleet-select` picks capacity, `fleet-artifacts` stores
//! build outputs, and `fleet-transport` abstracts every wire (with
//! deterministic mocks for tests).
//!
//! ## Flow
//!
//! A submission enters the queue (or the deployment/pipeline manager),
//! the selector filters and scores candidates against the registry's
//! live state and takes a short reservation, the executor runs the work
//! over the transport adapters, and the artifact index records the
//! outputs. The health engine keeps the registry honest in the
//! background; the alert service narrates the degradations.

/// Transfer, flash, boot, verify, rollback.
pub mod deploy;

/// Append-only JSONL audit log.
pub mod events;

/// Remote build execution over the shell adapter.
pub mod executor;

/// Resource groups, allocation policy, decommission gating.
pub mod groups;

/// Build-log buffering and live streaming.
pub mod logs;

/// Pipeline engine with strict stage ordering.
pub mod pipeline;

/// Build-job queue, admission, and the scheduling loop.
pub mod queue;

#[cfg(test)]
pub(crate) mod test_support;

/// End-to-end scenarios over the full stack with mock adapters.
#[cfg(test)]
mod scenarios;
