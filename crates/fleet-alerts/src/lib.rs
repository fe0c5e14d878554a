//! Alert service: turns health degradations into routed alert records.
//!
//! Deduplication and cool-down are per (resource, category): an active
//! alert for a pair short-circuits new ones, and after an alert for a pair
//! is generated, repeats are suppressed for the cool-down window (default
//! 5 minutes, overridable per rule).
//!
//! The latency contract: the gap between a degradation being observable
//! (`detected_at` on the event) and the alert being recorded must stay
//! under 30 seconds. Both timestamps are recorded on the alert and a
//! violation logs a warning; it never blocks the alert.
//!
//! Routing fans out to the channels registered at start-up. Delivery is
//! best-effort, recorded per channel on the alert, and never rolls back
//! alert creation.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{info, warn};

use fleet_config::AlertOptions;
use fleet_types::{
    Alert, AlertCategory, AlertSeverity, AlertStatus, AssetKind, ChannelKind, DeliveryRecord,
    Error, HealthEvent, HealthLevel, Result, new_id,
};
use fleet_webhook::{WebhookConfig, WebhookPayload, send_webhook};

/// The alert-generation latency bound from the service contract.
pub const LATENCY_BOUND: Duration = Duration::from_secs(30);

/// Per-category cool-down override.
#[derive(Debug, Clone)]
pub struct AlertRule {
    pub id: String,
    pub category: AlertCategory,
    pub cooldown: Duration,
}

/// What a generate call did.
#[derive(Debug, Clone)]
pub enum AlertOutcome {
    /// A new alert was recorded and routed.
    Created(Alert),
    /// An active alert for the same (resource, category) already exists.
    Deduplicated(String),
    /// Within the cool-down window for the pair; nothing recorded.
    Suppressed,
}

impl AlertOutcome {
    pub fn created(&self) -> Option<&Alert> {
        match self {
            AlertOutcome::Created(alert) => Some(alert),
            _ => None,
        }
    }
}

/// A new alert to be recorded.
#[derive(Debug, Clone)]
pub struct NewAlert {
    pub resource_id: String,
    pub resource_kind: AssetKind,
    pub severity: AlertSeverity,
    pub category: AlertCategory,
    pub title: String,
    pub message: String,
    /// When the underlying condition became observable.
    pub detected_at: DateTime<Utc>,
}

/// A delivery channel handler, registered at start-up.
#[async_trait]
pub trait AlertChannel: Send + Sync {
    fn kind(&self) -> ChannelKind;
    async fn deliver(&self, alert: &Alert) -> anyhow::Result<()>;
}

/// In-memory channel: the dashboard feed, and the recorder used in tests.
#[derive(Default)]
pub struct DashboardChannel {
    delivered: Mutex<Vec<Alert>>,
}

impl DashboardChannel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn delivered(&self) -> Vec<Alert> {
        self.delivered.lock().expect("channel lock").clone()
    }
}

#[async_trait]
impl AlertChannel for DashboardChannel {
    fn kind(&self) -> ChannelKind {
        ChannelKind::Dashboard
    }

    async fn deliver(&self, alert: &Alert) -> anyhow::Result<()> {
        self.delivered.lock().expect("channel lock").push(alert.clone());
        Ok(())
    }
}

/// Webhook channel posting alerts to a configured endpoint.
pub struct WebhookChannel {
    config: WebhookConfig,
    kind: ChannelKind,
}

impl WebhookChannel {
    pub fn new(config: WebhookConfig) -> Self {
        Self {
            config,
            kind: ChannelKind::Webhook,
        }
    }

    /// Chat integrations ride the same webhook transport.
    pub fn chat(config: WebhookConfig) -> Self {
        Self {
            config,
            kind: ChannelKind::Chat,
        }
    }
}

#[async_trait]
impl AlertChannel for WebhookChannel {
    fn kind(&self) -> ChannelKind {
        self.kind
    }

    async fn deliver(&self, alert: &Alert) -> anyhow::Result<()> {
        let payload = WebhookPayload {
            message: alert.message.clone(),
            title: Some(alert.title.clone()),
            severity: Some(format!("{:?}", alert.severity).to_lowercase()),
            resource_id: Some(alert.resource_id.clone()),
            resource_kind: Some(alert.resource_kind.to_string()),
            category: Some(format!("{:?}", alert.category).to_lowercase()),
            extra: Default::default(),
        };
        send_webhook(&self.config, &payload).await
    }
}

type PairKey = (String, AlertCategory);

#[derive(Default)]
struct AlertState {
    alerts: HashMap<String, Alert>,
    order: VecDeque<String>,
    active_by_pair: HashMap<PairKey, String>,
    cooldown_until: HashMap<PairKey, Instant>,
    rules: Vec<AlertRule>,
}

/// The alert service.
pub struct AlertService {
    options: AlertOptions,
    state: Mutex<AlertState>,
    channels: RwLock<Vec<Arc<dyn AlertChannel>>>,
}

impl AlertService {
    pub fn new(options: AlertOptions) -> Self {
        Self {
            options,
            state: Mutex::new(AlertState::default()),
            channels: RwLock::new(Vec::new()),
        }
    }

    /// Register a delivery channel. Call before the monitor starts.
    pub fn register_channel(&self, channel: Arc<dyn AlertChannel>) {
        self.channels.write().expect("channels lock").push(channel);
    }

    pub fn add_rule(&self, rule: AlertRule) {
        self.state.lock().expect("alert lock").rules.push(rule);
    }

    pub fn remove_rule(&self, rule_id: &str) -> bool {
        let mut state = self.state.lock().expect("alert lock");
        let before = state.rules.len();
        state.rules.retain(|r| r.id != rule_id);
        state.rules.len() != before
    }

    fn cooldown_for(state: &AlertState, category: AlertCategory, default: Duration) -> Duration {
        state
            .rules
            .iter()
            .find(|r| r.category == category)
            .map(|r| r.cooldown)
            .unwrap_or(default)
    }

    /// Record and route a new alert, applying dedup and cool-down.
    pub async fn generate(&self, new_alert: NewAlert) -> Result<AlertOutcome> {
        let now = Utc::now();
        let pair = (new_alert.resource_id.clone(), new_alert.category);

        let alert = {
            let mut state = self.state.lock().expect("alert lock");

            if let Some(existing_id) = state.active_by_pair.get(&pair) {
                if state
                    .alerts
                    .get(existing_id)
                    .is_some_and(|a| a.is_active())
                {
                    return Ok(AlertOutcome::Deduplicated(existing_id.clone()));
                }
            }

            if let Some(until) = state.cooldown_until.get(&pair) {
                if Instant::now() < *until {
                    return Ok(AlertOutcome::Suppressed);
                }
            }

            let latency = (now - new_alert.detected_at).to_std().unwrap_or(Duration::ZERO);
            if latency > LATENCY_BOUND {
                warn!(
                    resource = %new_alert.resource_id,
                    category = ?new_alert.category,
                    latency_ms = latency.as_millis() as u64,
                    "alert generation latency exceeded contract"
                );
            }

            let alert = Alert {
                id: new_id("alert"),
                resource_id: new_alert.resource_id.clone(),
                resource_kind: new_alert.resource_kind,
                severity: new_alert.severity,
                category: new_alert.category,
                status: AlertStatus::Active,
                title: new_alert.title,
                message: new_alert.message,
                created_at: now,
                updated_at: now,
                acknowledged_at: None,
                acknowledged_by: None,
                resolved_at: None,
                resolved_by: None,
                generation_latency_ms: Some(latency.as_millis() as u64),
                deliveries: Vec::new(),
            };

            let cooldown = Self::cooldown_for(&state, new_alert.category, self.options.cooldown());
            state.cooldown_until.insert(pair.clone(), Instant::now() + cooldown);
            state.active_by_pair.insert(pair, alert.id.clone());
            state.alerts.insert(alert.id.clone(), alert.clone());
            state.order.push_back(alert.id.clone());
            Self::trim_history(&mut state, self.options.max_history);
            alert
        };

        info!(
            alert = %alert.id,
            resource = %alert.resource_id,
            severity = ?alert.severity,
            category = ?alert.category,
            "alert generated"
        );

        let deliveries = self.route(&alert).await;
        let alert = {
            let mut state = self.state.lock().expect("alert lock");
            if let Some(stored) = state.alerts.get_mut(&alert.id) {
                stored.deliveries = deliveries;
                stored.clone()
            } else {
                alert
            }
        };

        Ok(AlertOutcome::Created(alert))
    }

    fn trim_history(state: &mut AlertState, max_history: usize) {
        while state.order.len() > max_history {
            let Some(oldest) = state.order.pop_front() else {
                break;
            };
            if let Some(removed) = state.alerts.remove(&oldest) {
                let pair = (removed.resource_id.clone(), removed.category);
                if state.active_by_pair.get(&pair) == Some(&oldest) {
                    state.active_by_pair.remove(&pair);
                }
            }
        }
    }

    async fn route(&self, alert: &Alert) -> Vec<DeliveryRecord> {
        let channels: Vec<Arc<dyn AlertChannel>> =
            self.channels.read().expect("channels lock").clone();
        let mut records = Vec::with_capacity(channels.len());
        for channel in channels {
            let delivered = match channel.deliver(alert).await {
                Ok(()) => true,
                Err(error) => {
                    warn!(channel = ?channel.kind(), %error, "alert delivery failed");
                    false
                }
            };
            records.push(DeliveryRecord {
                channel: channel.kind(),
                delivered,
                at: Utc::now(),
            });
        }
        records
    }

    /// Translate a health event into alerts. A recovery back to healthy
    /// generates nothing; it auto-resolves the resource's connectivity
    /// alerts instead.
    pub async fn handle_event(&self, event: HealthEvent) -> Result<Vec<AlertOutcome>> {
        if event.level == HealthLevel::Healthy {
            let resolved = self.auto_resolve(&event.resource_id, Some(AlertCategory::Connectivity));
            if !resolved.is_empty() {
                info!(
                    resource = %event.resource_id,
                    count = resolved.len(),
                    "connectivity alerts auto-resolved"
                );
            }
            return Ok(Vec::new());
        }
        let severity = severity_for(event.level);
        let mut outcomes = Vec::new();
        for category in &event.categories {
            let outcome = self
                .generate(NewAlert {
                    resource_id: event.resource_id.clone(),
                    resource_kind: event.resource_kind,
                    severity,
                    category: *category,
                    title: format!(
                        "{} {} {:?}",
                        event.resource_kind, event.resource_id, event.level
                    ),
                    message: event.message.clone(),
                    detected_at: event.detected_at,
                })
                .await?;
            outcomes.push(outcome);
        }
        Ok(outcomes)
    }

    /// Consume health events until the channel closes.
    pub async fn run_monitor(&self, mut events: mpsc::Receiver<HealthEvent>) {
        while let Some(event) = events.recv().await {
            if let Err(error) = self.handle_event(event).await {
                warn!(%error, "failed to process health event");
            }
        }
    }

    pub fn get(&self, alert_id: &str) -> Option<Alert> {
        self.state
            .lock()
            .expect("alert lock")
            .alerts
            .get(alert_id)
            .cloned()
    }

    pub fn acknowledge(&self, alert_id: &str, actor: &str) -> Result<Alert> {
        let mut state = self.state.lock().expect("alert lock");
        let alert = state
            .alerts
            .get_mut(alert_id)
            .ok_or_else(|| Error::not_found("alert", alert_id))?;
        if alert.status != AlertStatus::Active {
            return Err(Error::conflict(format!(
                "alert {} is not active",
                alert_id
            )));
        }
        alert.acknowledge(actor, Utc::now());
        Ok(alert.clone())
    }

    pub fn resolve(&self, alert_id: &str, actor: &str) -> Result<Alert> {
        let mut state = self.state.lock().expect("alert lock");
        let alert = state
            .alerts
            .get_mut(alert_id)
            .ok_or_else(|| Error::not_found("alert", alert_id))?;
        if matches!(alert.status, AlertStatus::Resolved) {
            return Err(Error::conflict(format!("alert {} already resolved", alert_id)));
        }
        alert.resolve(actor, Utc::now());
        let pair = (alert.resource_id.clone(), alert.category);
        let resolved = alert.clone();
        if state.active_by_pair.get(&pair) == Some(&resolved.id) {
            state.active_by_pair.remove(&pair);
        }
        Ok(resolved)
    }

    /// Resolve active alerts for a resource, optionally category-filtered.
    /// Used by auto-recovery when the next probe comes back healthy.
    pub fn auto_resolve(&self, resource_id: &str, category: Option<AlertCategory>) -> Vec<Alert> {
        let mut state = self.state.lock().expect("alert lock");
        let now = Utc::now();
        let targets: Vec<String> = state
            .active_by_pair
            .iter()
            .filter(|((resource, cat), _)| {
                resource == resource_id && category.is_none_or(|c| *cat == c)
            })
            .map(|(_, id)| id.clone())
            .collect();

        let mut resolved = Vec::new();
        for id in targets {
            if let Some(alert) = state.alerts.get_mut(&id) {
                if alert.is_active() || alert.status == AlertStatus::Acknowledged {
                    alert.resolve("auto-recovery", now);
                    resolved.push(alert.clone());
                }
            }
            // Pair is cleared regardless; the alert is no longer active.
        }
        for alert in &resolved {
            let pair = (alert.resource_id.clone(), alert.category);
            state.active_by_pair.remove(&pair);
        }
        resolved
    }

    /// Active alerts matching the filters, newest first.
    pub fn active(
        &self,
        resource_id: Option<&str>,
        severity: Option<AlertSeverity>,
        category: Option<AlertCategory>,
    ) -> Vec<Alert> {
        let state = self.state.lock().expect("alert lock");
        let mut alerts: Vec<Alert> = state
            .order
            .iter()
            .rev()
            .filter_map(|id| state.alerts.get(id))
            .filter(|a| a.is_active())
            .filter(|a| resource_id.is_none_or(|r| a.resource_id == r))
            .filter(|a| severity.is_none_or(|s| a.severity == s))
            .filter(|a| category.is_none_or(|c| a.category == c))
            .cloned()
            .collect();
        alerts.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        alerts
    }

    /// Most recent alerts regardless of status, newest first.
    pub fn history(&self, limit: usize) -> Vec<Alert> {
        let state = self.state.lock().expect("alert lock");
        state
            .order
            .iter()
            .rev()
            .take(limit)
            .filter_map(|id| state.alerts.get(id))
            .cloned()
            .collect()
    }

    pub fn count_by_severity(&self) -> BTreeMap<AlertSeverity, usize> {
        let state = self.state.lock().expect("alert lock");
        let mut counts = BTreeMap::new();
        for alert in state.alerts.values().filter(|a| a.is_active()) {
            *counts.entry(alert.severity).or_insert(0) += 1;
        }
        counts
    }

    pub fn active_count(&self) -> usize {
        let state = self.state.lock().expect("alert lock");
        state.alerts.values().filter(|a| a.is_active()).count()
    }
}

/// Severity for a degradation level.
fn severity_for(level: HealthLevel) -> AlertSeverity {
    match level {
        HealthLevel::Unreachable => AlertSeverity::Critical,
        HealthLevel::Unhealthy => AlertSeverity::Error,
        HealthLevel::Degraded => AlertSeverity::Warning,
        HealthLevel::Healthy | HealthLevel::Unknown => AlertSeverity::Info,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service() -> AlertService {
        AlertService::new(AlertOptions::default())
    }

    fn temp_alert(resource: &str) -> NewAlert {
        NewAlert {
            resource_id: resource.to_string(),
            resource_kind: AssetKind::Board,
            severity: AlertSeverity::Warning,
            category: AlertCategory::Temperature,
            title: format!("board {} degraded", resource),
            message: "temperature 72C".to_string(),
            detected_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn generate_creates_and_routes() {
        let service = service();
        let dashboard = Arc::new(DashboardChannel::new());
        service.register_channel(dashboard.clone());

        let outcome = service.generate(temp_alert("brd-1")).await.expect("generate");
        let alert = outcome.created().expect("created");
        assert_eq!(alert.status, AlertStatus::Active);
        assert_eq!(alert.deliveries.len(), 1);
        assert!(alert.deliveries[0].delivered);
        assert_eq!(dashboard.delivered().len(), 1);
        assert_eq!(service.active_count(), 1);
    }

    #[tokio::test]
    async fn active_pair_deduplicates() {
        let service = service();
        let first = service.generate(temp_alert("brd-1")).await.expect("generate");
        let first_id = first.created().expect("created").id.clone();

        let second = service.generate(temp_alert("brd-1")).await.expect("generate");
        match second {
            AlertOutcome::Deduplicated(id) => assert_eq!(id, first_id),
            other => panic!("expected dedup, got {:?}", other),
        }
        assert_eq!(service.active_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cooldown_suppresses_after_resolution() {
        let service = service();
        let outcome = service.generate(temp_alert("brd-1")).await.expect("generate");
        let id = outcome.created().expect("created").id.clone();
        service.resolve(&id, "oncall").expect("resolve");

        // Resolved, so no dedup hit, but still inside the cool-down.
        let again = service.generate(temp_alert("brd-1")).await.expect("generate");
        assert!(matches!(again, AlertOutcome::Suppressed));

        tokio::time::advance(Duration::from_secs(301)).await;
        let after = service.generate(temp_alert("brd-1")).await.expect("generate");
        assert!(after.created().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn per_rule_cooldown_overrides_default() {
        let service = service();
        service.add_rule(AlertRule {
            id: "temp-fast".to_string(),
            category: AlertCategory::Temperature,
            cooldown: Duration::from_secs(10),
        });

        let outcome = service.generate(temp_alert("brd-1")).await.expect("generate");
        let id = outcome.created().expect("created").id.clone();
        service.resolve(&id, "oncall").expect("resolve");

        tokio::time::advance(Duration::from_secs(11)).await;
        let after = service.generate(temp_alert("brd-1")).await.expect("generate");
        assert!(after.created().is_some());
    }

    #[tokio::test]
    async fn different_categories_do_not_dedup() {
        let service = service();
        service.generate(temp_alert("brd-1")).await.expect("generate");
        let mut connectivity = temp_alert("brd-1");
        connectivity.category = AlertCategory::Connectivity;
        let outcome = service.generate(connectivity).await.expect("generate");
        assert!(outcome.created().is_some());
        assert_eq!(service.active_count(), 2);
    }

    #[tokio::test]
    async fn latency_is_recorded() {
        let service = service();
        let mut late = temp_alert("brd-1");
        late.detected_at = Utc::now() - chrono::Duration::seconds(45);
        let outcome = service.generate(late).await.expect("generate");
        let alert = outcome.created().expect("created");
        assert!(alert.generation_latency_ms.expect("latency") >= 45_000);
    }

    #[tokio::test]
    async fn failed_delivery_does_not_block_creation() {
        struct FailingChannel;

        #[async_trait]
        impl AlertChannel for FailingChannel {
            fn kind(&self) -> ChannelKind {
                ChannelKind::Email
            }
            async fn deliver(&self, _alert: &Alert) -> anyhow::Result<()> {
                anyhow::bail!("smtp unreachable")
            }
        }

        let service = service();
        service.register_channel(Arc::new(FailingChannel));
        let outcome = service.generate(temp_alert("brd-1")).await.expect("generate");
        let alert = outcome.created().expect("created");
        assert_eq!(alert.deliveries.len(), 1);
        assert!(!alert.deliveries[0].delivered);
        assert_eq!(service.active_count(), 1);
    }

    #[tokio::test]
    async fn acknowledge_then_resolve_lifecycle() {
        let service = service();
        let outcome = service.generate(temp_alert("brd-1")).await.expect("generate");
        let id = outcome.created().expect("created").id.clone();

        let acked = service.acknowledge(&id, "oncall").expect("ack");
        assert_eq!(acked.status, AlertStatus::Acknowledged);
        assert!(service.acknowledge(&id, "oncall").is_err());

        let resolved = service.resolve(&id, "oncall").expect("resolve");
        assert_eq!(resolved.status, AlertStatus::Resolved);
        assert!(service.resolve(&id, "oncall").is_err());
        assert_eq!(service.active_count(), 0);
    }

    #[tokio::test]
    async fn auto_resolve_clears_connectivity() {
        let service = service();
        let mut connectivity = temp_alert("brd-1");
        connectivity.category = AlertCategory::Connectivity;
        service.generate(connectivity).await.expect("generate");
        service.generate(temp_alert("brd-1")).await.expect("generate");

        let resolved = service.auto_resolve("brd-1", Some(AlertCategory::Connectivity));
        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved[0].resolved_by.as_deref(), Some("auto-recovery"));
        // Temperature alert stays active.
        assert_eq!(service.active_count(), 1);
    }

    #[tokio::test]
    async fn healthy_event_auto_resolves_connectivity() {
        let service = service();
        let mut down = temp_alert("srv-1");
        down.category = AlertCategory::Connectivity;
        down.severity = AlertSeverity::Critical;
        service.generate(down).await.expect("generate");
        assert_eq!(service.active_count(), 1);

        let outcomes = service
            .handle_event(HealthEvent {
                resource_id: "srv-1".to_string(),
                resource_kind: AssetKind::BuildServer,
                previous_level: HealthLevel::Unreachable,
                level: HealthLevel::Healthy,
                categories: vec![AlertCategory::Connectivity],
                message: "probe succeeded".to_string(),
                detected_at: Utc::now(),
            })
            .await
            .expect("handle");
        assert!(outcomes.is_empty());
        assert_eq!(service.active_count(), 0);
    }

    #[tokio::test]
    async fn handle_event_maps_level_to_severity() {
        let service = service();
        let outcomes = service
            .handle_event(HealthEvent {
                resource_id: "srv-1".to_string(),
                resource_kind: AssetKind::BuildServer,
                previous_level: HealthLevel::Healthy,
                level: HealthLevel::Unreachable,
                categories: vec![AlertCategory::Connectivity],
                message: "ssh connect timed out".to_string(),
                detected_at: Utc::now(),
            })
            .await
            .expect("handle");
        let alert = outcomes[0].created().expect("created");
        assert_eq!(alert.severity, AlertSeverity::Critical);
        assert_eq!(alert.category, AlertCategory::Connectivity);
    }

    #[tokio::test]
    async fn filters_and_counts() {
        let service = service();
        service.generate(temp_alert("brd-1")).await.expect("generate");
        let mut other = temp_alert("brd-2");
        other.severity = AlertSeverity::Error;
        other.category = AlertCategory::Utilization;
        service.generate(other).await.expect("generate");

        assert_eq!(service.active(Some("brd-1"), None, None).len(), 1);
        assert_eq!(service.active(None, Some(AlertSeverity::Error), None).len(), 1);
        assert_eq!(
            service
                .active(None, None, Some(AlertCategory::Temperature))
                .len(),
            1
        );
        assert_eq!(service.active(None, None, None).len(), 2);

        let counts = service.count_by_severity();
        assert_eq!(counts.get(&AlertSeverity::Warning), Some(&1));
        assert_eq!(counts.get(&AlertSeverity::Error), Some(&1));
    }

    #[tokio::test]
    async fn history_is_bounded() {
        let service = AlertService::new(AlertOptions {
            cooldown_seconds: 0,
            max_history: 3,
        });
        for i in 0..5 {
            let mut alert = temp_alert(&format!("brd-{}", i));
            alert.category = AlertCategory::Utilization;
            service.generate(alert).await.expect("generate");
        }
        assert_eq!(service.history(10).len(), 3);
        // Newest first.
        assert_eq!(service.history(1)[0].resource_id, "brd-4");
    }

    #[tokio::test]
    async fn monitor_consumes_events() {
        let service = Arc::new(service());
        let (tx, rx) = mpsc::channel(16);

        let monitor = {
            let service = Arc::clone(&service);
            tokio::spawn(async move { service.run_monitor(rx).await })
        };

        tx.send(HealthEvent {
            resource_id: "srv-1".to_string(),
            resource_kind: AssetKind::BuildServer,
            previous_level: HealthLevel::Healthy,
            level: HealthLevel::Degraded,
            categories: vec![AlertCategory::Utilization],
            message: "cpu 91%".to_string(),
            detected_at: Utc::now(),
        })
        .await
        .expect("send");
        drop(tx);
        monitor.await.expect("join");

        assert_eq!(service.active_count(), 1);
    }
}
