//! The probe loop and status transitions.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use tokio::sync::{Semaphore, mpsc};
use tracing::{debug, info, warn};

use fleet_config::{HealthConfig, Thresholds};
use fleet_registry::Registry;
use fleet_transport::pool::ShellPool;
use fleet_transport::power::PowerControl;
use fleet_transport::CancelToken;
use fleet_types::{
    AlertCategory, Asset, AssetKind, BoardStatus, Error, HealthEvent, HealthLevel, Result,
    ServerStatus, ShellCredentials,
};

use crate::probe::{
    BOARD_METRICS_COMMAND, CheckFinding, METRICS_COMMAND, MetricSample, evaluate, parse_metrics,
};

/// Result of one probe tick for one asset.
#[derive(Debug, Clone)]
pub struct HealthCheckResult {
    pub resource_id: String,
    pub resource_kind: AssetKind,
    pub timestamp: DateTime<Utc>,
    pub level: HealthLevel,
    pub response_time: Duration,
    pub sample: MetricSample,
    pub findings: Vec<CheckFinding>,
    pub error_message: Option<String>,
}

/// Periodic health engine.
///
/// Each tick probes every registered asset (bounded by the global probe
/// semaphore), interprets metrics against thresholds, updates the
/// registry, and emits a [`HealthEvent`] whenever an asset's level gets
/// worse than what was stored, or recovers to healthy. Per-asset ticks
/// never overlap: an asset still being probed is skipped.
pub struct HealthMonitor {
    registry: Arc<Registry>,
    pool: Arc<ShellPool>,
    power: Arc<dyn PowerControl>,
    config: HealthConfig,
    defaults: Thresholds,
    overrides: Mutex<HashMap<String, Thresholds>>,
    events: mpsc::Sender<HealthEvent>,
    in_flight: Mutex<HashSet<String>>,
    probe_limit: Arc<Semaphore>,
    failures: Mutex<HashMap<String, u32>>,
    exec_timeout: Duration,
    /// Off time inside a recovery power cycle.
    cycle_delay: Duration,
    /// Wait after a power cycle before the verification probe.
    settle_delay: Duration,
}

impl HealthMonitor {
    pub fn new(
        registry: Arc<Registry>,
        pool: Arc<ShellPool>,
        power: Arc<dyn PowerControl>,
        config: HealthConfig,
        defaults: Thresholds,
        events: mpsc::Sender<HealthEvent>,
        exec_timeout: Duration,
    ) -> Self {
        let max_parallel = config.max_parallel.max(1);
        Self {
            registry,
            pool,
            power,
            config,
            defaults,
            overrides: Mutex::new(HashMap::new()),
            events,
            in_flight: Mutex::new(HashSet::new()),
            probe_limit: Arc::new(Semaphore::new(max_parallel)),
            failures: Mutex::new(HashMap::new()),
            exec_timeout,
            cycle_delay: Duration::from_secs(2),
            settle_delay: Duration::from_secs(5),
        }
    }

    /// Override thresholds for one asset.
    pub fn set_thresholds(&self, resource_id: &str, thresholds: Thresholds) {
        self.overrides
            .lock()
            .expect("thresholds lock")
            .insert(resource_id.to_string(), thresholds);
    }

    pub fn clear_thresholds(&self, resource_id: &str) {
        self.overrides
            .lock()
            .expect("thresholds lock")
            .remove(resource_id);
    }

    pub fn thresholds_for(&self, resource_id: &str) -> Thresholds {
        self.overrides
            .lock()
            .expect("thresholds lock")
            .get(resource_id)
            .copied()
            .unwrap_or(self.defaults)
    }

    pub fn consecutive_failures(&self, resource_id: &str) -> u32 {
        self.failures
            .lock()
            .expect("failures lock")
            .get(resource_id)
            .copied()
            .unwrap_or(0)
    }

    /// Run probe rounds until cancelled.
    pub async fn run(self: Arc<Self>, cancel: CancelToken) {
        loop {
            let interval = self.jittered_interval();
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = cancel.cancelled() => break,
            }
            self.probe_all().await;
        }
        info!("health monitor stopped");
    }

    fn jittered_interval(&self) -> Duration {
        let base = self.config.interval().as_secs_f64();
        let jitter = self.config.jitter.clamp(0.0, 1.0);
        if jitter == 0.0 {
            return self.config.interval();
        }
        let factor = rand::thread_rng().gen_range((1.0 - jitter)..=(1.0 + jitter));
        Duration::from_secs_f64((base * factor).max(0.001))
    }

    /// Probe every registered asset once, concurrently, bounded by the
    /// probe semaphore. Assets with a probe still in flight are skipped.
    pub async fn probe_all(self: &Arc<Self>) {
        let assets = self.registry.list(None);
        let mut handles = Vec::new();
        for asset in assets {
            let id = asset.id().to_string();
            {
                let mut in_flight = self.in_flight.lock().expect("in-flight lock");
                if !in_flight.insert(id.clone()) {
                    debug!(asset = %id, "probe still in flight; skipping tick");
                    continue;
                }
            }
            let monitor = Arc::clone(self);
            handles.push(tokio::spawn(async move {
                let _permit = monitor
                    .probe_limit
                    .clone()
                    .acquire_owned()
                    .await
                    .expect("probe semaphore closed");
                let outcome = monitor.probe_asset(&id).await;
                if let Err(error) = &outcome {
                    debug!(asset = %id, %error, "probe errored");
                }
                monitor
                    .in_flight
                    .lock()
                    .expect("in-flight lock")
                    .remove(&id);
            }));
        }
        for handle in handles {
            let _ = handle.await;
        }
    }

    /// Probe one asset and apply the outcome to the registry.
    pub async fn probe_asset(&self, id: &str) -> Result<HealthCheckResult> {
        let asset = self
            .registry
            .get(id)
            .ok_or_else(|| Error::not_found("asset", id))?;
        match asset {
            Asset::BuildServer(server) => {
                self.probe_server_like(id, AssetKind::BuildServer, &server.credentials)
                    .await
            }
            Asset::VirtHost(host) => {
                self.probe_server_like(id, AssetKind::VirtHost, &host.credentials)
                    .await
            }
            Asset::Board(board) => self.probe_board(&board.id).await,
        }
    }

    async fn shell_sample(
        &self,
        credentials: &ShellCredentials,
        command: &str,
    ) -> Result<(MetricSample, Duration)> {
        let started = std::time::Instant::now();
        let result = self
            .pool
            .exec(
                credentials,
                command,
                self.exec_timeout,
                &Default::default(),
                &CancelToken::none(),
            )
            .await?;
        let elapsed = started.elapsed();
        if !result.success() {
            return Err(Error::Remote(format!(
                "metrics command exited {}",
                result.exit_code
            )));
        }
        Ok((parse_metrics(&result.stdout), elapsed))
    }

    async fn probe_server_like(
        &self,
        id: &str,
        kind: AssetKind,
        credentials: &ShellCredentials,
    ) -> Result<HealthCheckResult> {
        let now = Utc::now();
        let previous = match kind {
            AssetKind::BuildServer => self.registry.server(id)?.health_level,
            _ => self.registry.host(id)?.health_level,
        };

        match self.shell_sample(credentials, METRICS_COMMAND).await {
            Ok((sample, response_time)) => {
                let thresholds = self.thresholds_for(id);
                let (level, findings) = evaluate(&sample, response_time, &thresholds);
                self.apply_server_level(id, kind, level, &sample, now)?;
                self.emit_transition(id, kind, previous, level, &findings, now);
                Ok(HealthCheckResult {
                    resource_id: id.to_string(),
                    resource_kind: kind,
                    timestamp: now,
                    level,
                    response_time,
                    sample,
                    findings,
                    error_message: None,
                })
            }
            Err(Error::Transport(transport)) => {
                let level = HealthLevel::Unreachable;
                self.apply_server_level(id, kind, level, &MetricSample::default(), now)?;
                self.emit_unreachable(id, kind, previous, &transport.message, now);
                Ok(HealthCheckResult {
                    resource_id: id.to_string(),
                    resource_kind: kind,
                    timestamp: now,
                    level,
                    response_time: Duration::ZERO,
                    sample: MetricSample::default(),
                    findings: Vec::new(),
                    error_message: Some(transport.message),
                })
            }
            Err(Error::Remote(message)) => {
                // The host answered but could not report metrics.
                let level = HealthLevel::Unhealthy;
                self.apply_server_level(id, kind, level, &MetricSample::default(), now)?;
                let findings = vec![CheckFinding {
                    category: AlertCategory::Connectivity,
                    level,
                    message: message.clone(),
                }];
                self.emit_transition(id, kind, previous, level, &findings, now);
                Ok(HealthCheckResult {
                    resource_id: id.to_string(),
                    resource_kind: kind,
                    timestamp: now,
                    level,
                    response_time: Duration::ZERO,
                    sample: MetricSample::default(),
                    findings,
                    error_message: Some(message),
                })
            }
            Err(other) => Err(other),
        }
    }

    fn apply_server_level(
        &self,
        id: &str,
        kind: AssetKind,
        level: HealthLevel,
        sample: &MetricSample,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let status = match level {
            HealthLevel::Unreachable => ServerStatus::Offline,
            HealthLevel::Unhealthy | HealthLevel::Degraded => ServerStatus::Degraded,
            HealthLevel::Healthy => ServerStatus::Online,
            HealthLevel::Unknown => ServerStatus::Unknown,
        };
        match kind {
            AssetKind::BuildServer => {
                self.registry.update_server(id, |server| {
                    server.health_level = level;
                    if !server.maintenance {
                        server.status = status;
                    }
                    if let Some(cpu) = sample.cpu_percent {
                        server.utilization.cpu_percent = cpu;
                    }
                    if let Some(mem) = sample.memory_percent {
                        server.utilization.memory_percent = mem;
                    }
                    if let Some(storage) = sample.storage_percent {
                        server.utilization.storage_percent = storage;
                    }
                    server.last_probe_at = Some(now);
                })?;
            }
            _ => {
                self.registry.update_host(id, |host| {
                    host.health_level = level;
                    if !host.maintenance {
                        host.status = status;
                    }
                    if let Some(cpu) = sample.cpu_percent {
                        host.utilization.cpu_percent = cpu;
                    }
                    if let Some(mem) = sample.memory_percent {
                        host.utilization.memory_percent = mem;
                    }
                    if let Some(storage) = sample.storage_percent {
                        host.utilization.storage_percent = storage;
                    }
                    host.last_probe_at = Some(now);
                })?;
            }
        }
        Ok(())
    }

    async fn probe_board(&self, id: &str) -> Result<HealthCheckResult> {
        let board = self.registry.board(id)?;
        let now = Utc::now();
        let previous = board.health.connectivity;

        let Some(credentials) = board.credentials.clone() else {
            // Nothing to probe over; the board is only reachable out of band.
            return Ok(HealthCheckResult {
                resource_id: id.to_string(),
                resource_kind: AssetKind::Board,
                timestamp: now,
                level: HealthLevel::Unknown,
                response_time: Duration::ZERO,
                sample: MetricSample::default(),
                findings: Vec::new(),
                error_message: Some("no shell credentials configured".to_string()),
            });
        };

        match self.shell_sample(&credentials, BOARD_METRICS_COMMAND).await {
            Ok((sample, response_time)) => {
                self.failures.lock().expect("failures lock").remove(id);
                let thresholds = self.thresholds_for(id);
                let (level, findings) = evaluate(&sample, response_time, &thresholds);
                self.apply_board_level(id, level, &sample, response_time, now)?;
                self.emit_transition(id, AssetKind::Board, previous, level, &findings, now);
                Ok(HealthCheckResult {
                    resource_id: id.to_string(),
                    resource_kind: AssetKind::Board,
                    timestamp: now,
                    level,
                    response_time,
                    sample,
                    findings,
                    error_message: None,
                })
            }
            Err(Error::Transport(transport)) => {
                self.board_unreachable(&board.id, previous, &transport.message, now)
                    .await
            }
            Err(Error::Remote(message)) => {
                let level = HealthLevel::Unhealthy;
                self.registry.update_board(id, |b| {
                    b.health.connectivity = level;
                    b.last_probe_at = Some(now);
                })?;
                let findings = vec![CheckFinding {
                    category: AlertCategory::Connectivity,
                    level,
                    message: message.clone(),
                }];
                self.emit_transition(id, AssetKind::Board, previous, level, &findings, now);
                Ok(HealthCheckResult {
                    resource_id: id.to_string(),
                    resource_kind: AssetKind::Board,
                    timestamp: now,
                    level,
                    response_time: Duration::ZERO,
                    sample: MetricSample::default(),
                    findings,
                    error_message: Some(message),
                })
            }
            Err(other) => Err(other),
        }
    }

    fn apply_board_level(
        &self,
        id: &str,
        level: HealthLevel,
        sample: &MetricSample,
        response_time: Duration,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.registry.update_board(id, |board| {
            board.health.connectivity = level;
            board.health.temperature_celsius = sample.temperature_celsius;
            board.health.storage_percent = sample.storage_percent;
            board.health.last_response_time_ms = Some(response_time.as_millis() as u64);
            board.last_probe_at = Some(now);
            if !board.maintenance
                && matches!(
                    board.status,
                    BoardStatus::Unknown | BoardStatus::Offline | BoardStatus::Recovery
                )
            {
                board.status = BoardStatus::Available;
            }
        })?;
        Ok(())
    }

    /// Unreachable board path: count the failure and, when power control is
    /// automatable, go through recovery (cycle, settle, verify probe).
    async fn board_unreachable(
        &self,
        id: &str,
        previous: HealthLevel,
        message: &str,
        now: DateTime<Utc>,
    ) -> Result<HealthCheckResult> {
        let failures = {
            let mut failures = self.failures.lock().expect("failures lock");
            let count = failures.entry(id.to_string()).or_insert(0);
            *count += 1;
            *count
        };
        let board = self.registry.board(id)?;
        let limit = self.thresholds_for(id).consecutive_failure_limit.max(1);

        let automated = board.power_control.is_automated()
            && !board.maintenance
            && board.status != BoardStatus::InUse
            && board.status != BoardStatus::Flashing;

        if automated {
            info!(board = %id, failures, "board unreachable; attempting power recovery");
            self.registry.update_board(id, |b| {
                b.status = BoardStatus::Recovery;
                b.health.connectivity = HealthLevel::Unreachable;
                b.last_probe_at = Some(now);
            })?;
            self.emit_unreachable(id, AssetKind::Board, previous, message, now);

            let cycled = self
                .power
                .power_cycle(
                    id,
                    &board.power_control,
                    self.cycle_delay,
                    &CancelToken::none(),
                )
                .await;

            if cycled.is_ok() {
                tokio::time::sleep(self.settle_delay).await;
                if let Some(credentials) = board.credentials.clone() {
                    if let Ok((sample, response_time)) =
                        self.shell_sample(&credentials, BOARD_METRICS_COMMAND).await
                    {
                        self.failures.lock().expect("failures lock").remove(id);
                        let thresholds = self.thresholds_for(id);
                        let (level, findings) = evaluate(&sample, response_time, &thresholds);
                        self.apply_board_level(id, level, &sample, response_time, now)?;
                        info!(board = %id, "board recovered after power cycle");
                        self.emit_transition(
                            id,
                            AssetKind::Board,
                            HealthLevel::Unreachable,
                            level,
                            &findings,
                            now,
                        );
                        return Ok(HealthCheckResult {
                            resource_id: id.to_string(),
                            resource_kind: AssetKind::Board,
                            timestamp: now,
                            level,
                            response_time,
                            sample,
                            findings,
                            error_message: None,
                        });
                    }
                }
            }

            warn!(board = %id, "board did not come back after power cycle");
            self.registry.update_board(id, |b| {
                b.status = BoardStatus::Offline;
                b.health.connectivity = HealthLevel::Unreachable;
            })?;
        } else {
            self.registry.update_board(id, |b| {
                b.health.connectivity = HealthLevel::Unreachable;
                b.last_probe_at = Some(now);
                if failures >= limit && !b.maintenance && b.status != BoardStatus::InUse {
                    b.status = BoardStatus::Offline;
                }
            })?;
            self.emit_unreachable(id, AssetKind::Board, previous, message, now);
        }

        Ok(HealthCheckResult {
            resource_id: id.to_string(),
            resource_kind: AssetKind::Board,
            timestamp: now,
            level: HealthLevel::Unreachable,
            response_time: Duration::ZERO,
            sample: MetricSample::default(),
            findings: Vec::new(),
            error_message: Some(message.to_string()),
        })
    }

    fn emit_transition(
        &self,
        id: &str,
        kind: AssetKind,
        previous: HealthLevel,
        level: HealthLevel,
        findings: &[CheckFinding],
        now: DateTime<Utc>,
    ) {
        let worse = level.is_worse_than(previous);
        let recovered = level == HealthLevel::Healthy
            && previous.is_worse_than(HealthLevel::Healthy)
            && previous != HealthLevel::Unknown;
        if !worse && !recovered {
            return;
        }

        let mut categories: Vec<AlertCategory> = Vec::new();
        for finding in findings {
            if !categories.contains(&finding.category) {
                categories.push(finding.category);
            }
        }
        if categories.is_empty() {
            categories.push(AlertCategory::Connectivity);
        }

        let message = if findings.is_empty() {
            format!("{:?}", level).to_lowercase()
        } else {
            findings
                .iter()
                .map(|f| f.message.as_str())
                .collect::<Vec<_>>()
                .join("; ")
        };

        self.send_event(HealthEvent {
            resource_id: id.to_string(),
            resource_kind: kind,
            previous_level: previous,
            level,
            categories,
            message,
            detected_at: now,
        });
    }

    fn emit_unreachable(
        &self,
        id: &str,
        kind: AssetKind,
        previous: HealthLevel,
        message: &str,
        now: DateTime<Utc>,
    ) {
        if !HealthLevel::Unreachable.is_worse_than(previous) {
            return;
        }
        self.send_event(HealthEvent {
            resource_id: id.to_string(),
            resource_kind: kind,
            previous_level: previous,
            level: HealthLevel::Unreachable,
            categories: vec![AlertCategory::Connectivity],
            message: message.to_string(),
            detected_at: now,
        });
    }

    fn send_event(&self, event: HealthEvent) {
        // Bounded channel; a full queue drops the event rather than stall
        // the probe loop. The next worse transition will re-emit.
        if let Err(error) = self.events.try_send(event) {
            warn!(%error, "health event queue full; dropping event");
        }
    }
}
