//! Webhook delivery for fleet alerts.
//!
//! The alert router's webhook channel posts JSON to a configured URL,
//! with payload shaping for Slack and Discord incoming webhooks alongside
//! a generic JSON POST.
//!
//! # Example
//!
//! ```ignore
//! use fleet_webhook::{WebhookConfig, WebhookPayload, send_webhook};
//!
//! let config = WebhookConfig {
//!     url: "https://hooks.slack.com/services/...".to_string(),
//!     ..WebhookConfig::default()
//! };
//!
//! let payload = WebhookPayload {
//!     title: Some("board pi4-a degraded".to_string()),
//!     message: "temperature 72C exceeds warning threshold".to_string(),
//!     ..Default::default()
//! };
//!
//! send_webhook(&config, &payload).await.expect("send");
//! ```

use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::json;

/// Webhook type
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WebhookType {
    /// Generic webhook (POST JSON)
    #[default]
    Generic,
    /// Slack incoming webhook
    Slack,
    /// Discord webhook
    Discord,
}

/// Webhook configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookConfig {
    /// Webhook URL
    pub url: String,
    /// Type of webhook
    #[serde(default)]
    pub webhook_type: WebhookType,
    /// Timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
}

fn default_timeout() -> u64 {
    30
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            webhook_type: WebhookType::default(),
            timeout_secs: default_timeout(),
        }
    }
}

/// Webhook payload
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WebhookPayload {
    /// Main message
    pub message: String,
    /// Optional title
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    /// Alert severity (info, warning, error, critical)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub severity: Option<String>,
    /// Affected resource id
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource_id: Option<String>,
    /// Affected resource kind
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource_kind: Option<String>,
    /// Alert category
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    /// Additional fields
    #[serde(flatten)]
    pub extra: std::collections::BTreeMap<String, serde_json::Value>,
}

/// Send a webhook notification
pub async fn send_webhook(config: &WebhookConfig, payload: &WebhookPayload) -> Result<()> {
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(config.timeout_secs))
        .build()
        .context("failed to create HTTP client")?;

    let body = format_payload(config.webhook_type, payload)?;

    let response = client
        .post(&config.url)
        .header("Content-Type", "application/json")
        .body(body)
        .send()
        .await
        .context("failed to send webhook request")?;

    if !response.status().is_success() {
        return Err(anyhow::anyhow!(
            "webhook request failed with status {}: {}",
            response.status(),
            response.text().await.unwrap_or_default()
        ));
    }

    Ok(())
}

/// Render the payload body for the configured webhook type.
pub fn format_payload(webhook_type: WebhookType, payload: &WebhookPayload) -> Result<String> {
    match webhook_type {
        WebhookType::Generic => Ok(serde_json::to_string(payload)?),
        WebhookType::Slack => slack_payload(payload),
        WebhookType::Discord => discord_payload(payload),
    }
}

fn severity_color(severity: Option<&str>) -> &'static str {
    match severity {
        Some("critical") | Some("error") => "danger",
        Some("warning") => "warning",
        _ => "good",
    }
}

/// Format payload for Slack
fn slack_payload(payload: &WebhookPayload) -> Result<String> {
    let color = severity_color(payload.severity.as_deref());

    let mut fields = vec![];

    if let Some(resource_id) = &payload.resource_id {
        fields.push(json!({
            "title": "Resource",
            "value": resource_id,
            "short": true
        }));
    }

    if let Some(category) = &payload.category {
        fields.push(json!({
            "title": "Category",
            "value": category,
            "short": true
        }));
    }

    if let Some(severity) = &payload.severity {
        fields.push(json!({
            "title": "Severity",
            "value": severity,
            "short": true
        }));
    }

    let attachment = json!({
        "color": color,
        "title": payload.title.as_deref().unwrap_or("Fleet alert"),
        "text": payload.message,
        "fields": fields
    });

    Ok(serde_json::to_string(&json!({
        "attachments": [attachment]
    }))?)
}

/// Format payload for Discord
fn discord_payload(payload: &WebhookPayload) -> Result<String> {
    // Discord embed colors are decimal RGB.
    let color = match payload.severity.as_deref() {
        Some("critical") | Some("error") => 0xcc_00_00,
        Some("warning") => 0xff_aa_00,
        _ => 0x00_88_00,
    };

    let mut fields = vec![];
    if let Some(resource_id) = &payload.resource_id {
        fields.push(json!({ "name": "Resource", "value": resource_id, "inline": true }));
    }
    if let Some(category) = &payload.category {
        fields.push(json!({ "name": "Category", "value": category, "inline": true }));
    }

    let embed = json!({
        "title": payload.title.as_deref().unwrap_or("Fleet alert"),
        "description": payload.message,
        "color": color,
        "fields": fields
    });

    Ok(serde_json::to_string(&json!({ "embeds": [embed] }))?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_payload() -> WebhookPayload {
        WebhookPayload {
            message: "temperature 72C exceeds warning threshold".to_string(),
            title: Some("board pi4-a degraded".to_string()),
            severity: Some("warning".to_string()),
            resource_id: Some("brd-1".to_string()),
            resource_kind: Some("board".to_string()),
            category: Some("temperature".to_string()),
            extra: Default::default(),
        }
    }

    #[test]
    fn generic_payload_is_plain_json() {
        let body = format_payload(WebhookType::Generic, &sample_payload()).expect("format");
        let value: serde_json::Value = serde_json::from_str(&body).expect("parse");
        assert_eq!(value["message"], "temperature 72C exceeds warning threshold");
        assert_eq!(value["resource_id"], "brd-1");
        assert_eq!(value["category"], "temperature");
    }

    #[test]
    fn slack_payload_uses_attachments() {
        let body = format_payload(WebhookType::Slack, &sample_payload()).expect("format");
        let value: serde_json::Value = serde_json::from_str(&body).expect("parse");
        let attachment = &value["attachments"][0];
        assert_eq!(attachment["color"], "warning");
        assert_eq!(attachment["title"], "board pi4-a degraded");
        assert_eq!(attachment["fields"][0]["title"], "Resource");
    }

    #[test]
    fn slack_severity_colors() {
        for (severity, color) in [
            ("critical", "danger"),
            ("error", "danger"),
            ("warning", "warning"),
            ("info", "good"),
        ] {
            let payload = WebhookPayload {
                severity: Some(severity.to_string()),
                ..sample_payload()
            };
            let body = format_payload(WebhookType::Slack, &payload).expect("format");
            let value: serde_json::Value = serde_json::from_str(&body).expect("parse");
            assert_eq!(value["attachments"][0]["color"], color, "severity {severity}");
        }
    }

    #[test]
    fn discord_payload_uses_embeds() {
        let body = format_payload(WebhookType::Discord, &sample_payload()).expect("format");
        let value: serde_json::Value = serde_json::from_str(&body).expect("parse");
        let embed = &value["embeds"][0];
        assert_eq!(embed["description"], "temperature 72C exceeds warning threshold");
        assert_eq!(embed["color"], 0xff_aa_00);
    }

    #[test]
    fn missing_title_falls_back() {
        let payload = WebhookPayload {
            title: None,
            ..sample_payload()
        };
        let body = format_payload(WebhookType::Slack, &payload).expect("format");
        assert!(body.contains("Fleet alert"));
    }

    #[test]
    fn extra_fields_flatten_into_generic_payload() {
        let mut payload = sample_payload();
        payload
            .extra
            .insert("deployment_id".to_string(), json!("dep-42"));
        let body = format_payload(WebhookType::Generic, &payload).expect("format");
        let value: serde_json::Value = serde_json::from_str(&body).expect("parse");
        assert_eq!(value["deployment_id"], "dep-42");
    }
}
