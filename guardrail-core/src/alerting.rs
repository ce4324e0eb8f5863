//! Alert rules and notification dispatch
//!
//! Rules match on a minimum severity (optionally narrowed to specific codes)
//! and fan out to email or webhook channels. A per-rule cooldown keeps one
//! failing dependency from flooding the channels. Dispatch failures are
//! logged and never returned to the code that reported the error.

use crate::error::{GuardrailError, GuardrailResult};
use crate::taxonomy::{ErrorCode, Severity, TypedError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info};

pub const SEND_ALERT_EMAIL_FUNCTION: &str = "send-alert-email";

fn default_cooldown() -> Duration {
    Duration::from_secs(300)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AlertChannel {
    Email { to: Vec<String> },
    Webhook { url: String },
}

impl AlertChannel {
    fn kind(&self) -> &'static str {
        match self {
            AlertChannel::Email { .. } => "email",
            AlertChannel::Webhook { .. } => "webhook",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertRule {
    pub name: String,
    pub min_severity: Severity,
    /// Restrict the rule to these codes; `None` matches every code
    #[serde(default)]
    pub codes: Option<Vec<ErrorCode>>,
    pub channels: Vec<AlertChannel>,
    #[serde(default = "default_cooldown", with = "humantime_serde")]
    pub cooldown: Duration,
}

impl AlertRule {
    pub fn new(name: impl Into<String>, min_severity: Severity) -> Self {
        Self {
            name: name.into(),
            min_severity,
            codes: None,
            channels: Vec::new(),
            cooldown: default_cooldown(),
        }
    }

    pub fn with_channel(mut self, channel: AlertChannel) -> Self {
        self.channels.push(channel);
        self
    }

    pub fn with_codes(mut self, codes: Vec<ErrorCode>) -> Self {
        self.codes = Some(codes);
        self
    }

    pub fn with_cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = cooldown;
        self
    }

    pub fn matches(&self, error: &TypedError) -> bool {
        error.severity() >= self.min_severity
            && self
                .codes
                .as_ref()
                .map_or(true, |codes| codes.contains(&error.code()))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmailPayload {
    pub to: Vec<String>,
    pub subject: String,
    pub html_body: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookError {
    pub code: ErrorCode,
    pub message: String,
    pub severity: Severity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fingerprint_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookPayload {
    pub alert_name: String,
    pub error: WebhookError,
    pub timestamp: DateTime<Utc>,
}

impl EmailPayload {
    fn for_rule(rule: &AlertRule, to: &[String], error: &TypedError, fingerprint_id: Option<&str>) -> Self {
        let subject = format!("[{}] {}: {}", error.severity(), rule.name, error.code());
        let html_body = format!(
            "<h2>{}</h2>\
             <p><strong>Code:</strong> {}</p>\
             <p><strong>Severity:</strong> {}</p>\
             <p><strong>Message:</strong> {}</p>\
             <p><strong>Fingerprint:</strong> {}</p>\
             <p><strong>Time:</strong> {}</p>",
            rule.name,
            error.code(),
            error.severity(),
            html_escape(error.message()),
            fingerprint_id.unwrap_or("n/a"),
            error.context().timestamp.to_rfc3339(),
        );
        Self {
            to: to.to_vec(),
            subject,
            html_body,
        }
    }
}

fn html_escape(raw: &str) -> String {
    raw.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

/// Delivery mechanism for alert notifications
#[async_trait]
pub trait AlertTransport: Send + Sync {
    async fn send_email(&self, payload: &EmailPayload) -> GuardrailResult<()>;

    async fn post_webhook(&self, url: &str, payload: &WebhookPayload) -> GuardrailResult<()>;
}

/// Webhooks are posted directly; email goes through the store's
/// `send-alert-email` function endpoint.
pub struct HttpAlertTransport {
    client: reqwest::Client,
    functions_base: Option<String>,
    api_key: Option<String>,
}

impl HttpAlertTransport {
    pub fn new(client: reqwest::Client, store_url: Option<String>, api_key: Option<String>) -> Self {
        Self {
            client,
            functions_base: store_url.map(|u| format!("{}/functions/v1", u.trim_end_matches('/'))),
            api_key,
        }
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => request
                .header("apikey", key)
                .header("Authorization", format!("Bearer {}", key)),
            None => request,
        }
    }
}

#[async_trait]
impl AlertTransport for HttpAlertTransport {
    async fn send_email(&self, payload: &EmailPayload) -> GuardrailResult<()> {
        let base = self.functions_base.as_ref().ok_or_else(|| {
            GuardrailError::configuration("alerts", "Email alerts require a store URL")
        })?;
        let url = format!("{}/{}", base, SEND_ALERT_EMAIL_FUNCTION);

        let response = self
            .authorize(self.client.post(&url).json(payload))
            .send()
            .await
            .map_err(|e| GuardrailError::alert("email", e))?;
        if !response.status().is_success() {
            return Err(GuardrailError::alert(
                "email",
                format!("endpoint returned {}", response.status()),
            ));
        }
        Ok(())
    }

    async fn post_webhook(&self, url: &str, payload: &WebhookPayload) -> GuardrailResult<()> {
        let response = self
            .client
            .post(url)
            .json(payload)
            .send()
            .await
            .map_err(|e| GuardrailError::alert("webhook", e))?;
        if !response.status().is_success() {
            return Err(GuardrailError::alert(
                "webhook",
                format!("{} returned {}", url, response.status()),
            ));
        }
        Ok(())
    }
}

/// Evaluates rules against an error and dispatches matching alerts
pub struct AlertDispatcher {
    rules: Vec<AlertRule>,
    transport: Arc<dyn AlertTransport>,
    /// Keyed by rule name and fingerprint
    last_fired: Mutex<HashMap<(String, Option<String>), Instant>>,
}

impl AlertDispatcher {
    pub fn new(rules: Vec<AlertRule>, transport: Arc<dyn AlertTransport>) -> Self {
        Self {
            rules,
            transport,
            last_fired: Mutex::new(HashMap::new()),
        }
    }

    pub fn rules(&self) -> &[AlertRule] {
        &self.rules
    }

    /// Claim the cooldown slot for this rule and fingerprint. False while
    /// that pair is cooling down.
    fn try_fire(&self, rule: &AlertRule, fingerprint_id: Option<&str>) -> bool {
        let now = Instant::now();
        let key = (rule.name.clone(), fingerprint_id.map(str::to_string));
        let mut last_fired = self.last_fired.lock();
        match last_fired.get(&key) {
            Some(at) if now.duration_since(*at) < rule.cooldown => false,
            _ => {
                last_fired.insert(key, now);
                true
            }
        }
    }

    /// Dispatch every matching rule. Returns the number of notifications
    /// delivered; failures are logged and skipped.
    pub async fn evaluate(&self, error: &TypedError, fingerprint_id: Option<&str>) -> usize {
        let mut delivered = 0;

        for rule in self.rules.iter().filter(|r| r.matches(error)) {
            if !self.try_fire(rule, fingerprint_id) {
                debug!(rule = %rule.name, "Alert suppressed by cooldown");
                continue;
            }

            for channel in &rule.channels {
                let result = match channel {
                    AlertChannel::Email { to } => {
                        let payload = EmailPayload::for_rule(rule, to, error, fingerprint_id);
                        self.transport.send_email(&payload).await
                    }
                    AlertChannel::Webhook { url } => {
                        let payload = WebhookPayload {
                            alert_name: rule.name.clone(),
                            error: WebhookError {
                                code: error.code(),
                                message: error.message().to_string(),
                                severity: error.severity(),
                                fingerprint_id: fingerprint_id.map(str::to_string),
                            },
                            timestamp: Utc::now(),
                        };
                        self.transport.post_webhook(url, &payload).await
                    }
                };

                match result {
                    Ok(()) => {
                        delivered += 1;
                        info!(rule = %rule.name, channel = channel.kind(), "Alert dispatched");
                    }
                    Err(e) => {
                        error!(rule = %rule.name, channel = channel.kind(), error = %e, "Alert dispatch failed");
                    }
                }
            }
        }

        delivered
    }
}
