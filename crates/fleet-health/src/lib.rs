//! Health engine for the fleet control plane.
//!
//! Periodically probes every registered asset over the transport layer,
//! classifies the results against configurable thresholds, drives status
//! transitions in the registry, and feeds degradation events to the alert
//! service over a bounded channel.
//!
//! Level mapping is worst-of-all-checks: any failed check makes the asset
//! unhealthy, any warning makes it degraded, a transport failure makes it
//! unreachable, and only an all-clear probe is healthy. Servers and hosts
//! map unreachable to offline; boards go through a power-cycle recovery
//! path first when their power control is automatable.

pub mod monitor;
pub mod probe;

pub use monitor::{HealthCheckResult, HealthMonitor};
pub use probe::{CheckFinding, MetricSample, evaluate, parse_metrics};
