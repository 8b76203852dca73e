use anyhow::{Context, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::Client;
use serde::Serialize;
use std::time::Duration;
use tracing::{info, warn};

use crate::config::DeliveryConfig;
use crate::envelope::{AlertEvent, AlertKind};

/// Time, host and program from a classic syslog prefix, e.g.
/// `Mar  1 08:15:00 web-2 nginx: ...`.
static SYSLOG_PREFIX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^(?P<time>\w{3}\s+\d{1,2}\s\d{1,2}:\d{1,2}:\d{1,2})\s+(?P<hostname>\S+?)\s+(?P<program>\S+?):",
    )
    .expect("syslog prefix pattern is valid")
});

const MISSING: &str = "-";

#[cfg_attr(test, mockall::automock)]
#[async_trait::async_trait]
pub trait DeliverySink: Send + Sync {
    /// Best effort: errors are logged by the caller and never retried.
    async fn deliver(&self, alert: &AlertEvent) -> Result<()>;
    fn name(&self) -> &'static str;
}

#[derive(Debug, Serialize)]
pub struct RobotMessage {
    pub title: String,
    pub text: String,
}

/// Posts alerts as `{title, text}` JSON to a chat-robot webhook.
pub struct WebhookSink {
    config: DeliveryConfig,
    alert_url: String,
    client: Client,
}

impl WebhookSink {
    pub fn new(config: DeliveryConfig) -> Result<Self> {
        let alert_url = config
            .alert_url
            .clone()
            .context("No alert URL configured for webhook delivery")?;

        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .danger_accept_invalid_certs(!config.verify_certificates)
            .build()
            .context("Failed to build HTTP client")?;

        info!(
            "Webhook delivery initialized (timeout {}s, verify certificates: {})",
            config.timeout_secs, config.verify_certificates
        );

        Ok(Self {
            config,
            alert_url,
            client,
        })
    }

    pub fn build_message(&self, alert: &AlertEvent) -> RobotMessage {
        RobotMessage {
            title: self.config.title.clone(),
            text: render(alert, self.config.instance_name.as_deref()),
        }
    }
}

#[async_trait::async_trait]
impl DeliverySink for WebhookSink {
    async fn deliver(&self, alert: &AlertEvent) -> Result<()> {
        let message = self.build_message(alert);

        let response = self
            .client
            .post(&self.alert_url)
            .json(&message)
            .send()
            .await
            .with_context(|| format!("Failed to send alert {}", alert.id))?;

        if response.status().is_success() {
            info!("Delivered alert {} for incident {}", alert.id, alert.incident);
        } else {
            anyhow::bail!("Webhook returned HTTP {} for alert {}", response.status(), alert.id);
        }

        Ok(())
    }

    fn name(&self) -> &'static str {
        "webhook"
    }
}

/// Writes alerts to the log when webhook delivery is disabled.
pub struct LogSink {
    instance_name: Option<String>,
}

impl LogSink {
    pub fn new(config: &DeliveryConfig) -> Self {
        Self {
            instance_name: config.instance_name.clone(),
        }
    }
}

#[async_trait::async_trait]
impl DeliverySink for LogSink {
    async fn deliver(&self, alert: &AlertEvent) -> Result<()> {
        warn!(
            alert_id = %alert.id,
            incident = %alert.incident,
            kind = alert.kind.as_str(),
            "{}",
            render(alert, self.instance_name.as_deref())
        );
        Ok(())
    }

    fn name(&self) -> &'static str {
        "log"
    }
}

pub fn sink_from_config(config: &DeliveryConfig) -> Result<Box<dyn DeliverySink>> {
    if config.enabled {
        Ok(Box::new(WebhookSink::new(config.clone())?))
    } else {
        info!("Webhook delivery disabled, alerts go to the log");
        Ok(Box::new(LogSink::new(config)))
    }
}

/// Human-readable alert body. Kubernetes records use their pod metadata;
/// anything else falls back to fields parsed from a syslog prefix.
pub fn render(alert: &AlertEvent, instance_name: Option<&str>) -> String {
    let envelope = &alert.envelope;
    let env = envelope.env().unwrap_or(MISSING);

    let mut text = match envelope.container_name() {
        Some(_) => {
            let k8s = &envelope.kubernetes;
            format!(
                "Time: {}\nEnv: {}\nNamespace: {}\nService: {}\nPod: {}\nNode: {}\n",
                or_missing(&envelope.timestamp),
                env,
                or_missing(&k8s.namespace),
                lookup(&k8s.labels, "app"),
                lookup(&k8s.pod, "name"),
                lookup(&k8s.node, "name"),
            )
        }
        None => {
            let captures = SYSLOG_PREFIX.captures(&envelope.message);
            let group = |name: &str| {
                captures
                    .as_ref()
                    .and_then(|c| c.name(name))
                    .map_or(MISSING, |m| m.as_str())
            };
            format!(
                "Time: {}\nEnv: {}\nService: {}\nNode: {}\n",
                or_missing(&envelope.timestamp),
                env,
                group("program"),
                group("hostname"),
            )
        }
    };

    match (alert.kind, alert.previous_alert) {
        (AlertKind::RecurringStale, Some(previous)) => text.push_str(&format!(
            "Status: recurring (last alerted {})\n",
            previous.format("%Y-%m-%d %H:%M:%S UTC")
        )),
        (AlertKind::RecurringStale, None) => text.push_str("Status: recurring\n"),
        (AlertKind::NewIncident, _) => text.push_str("Status: new incident\n"),
    }
    if let Some(instance) = instance_name {
        text.push_str(&format!("Reported by: {}\n", instance));
    }
    text.push_str(&format!("Content:\n{}", envelope.message));
    text
}

fn or_missing(value: &str) -> &str {
    if value.is_empty() {
        MISSING
    } else {
        value
    }
}

fn lookup<'a>(map: &'a std::collections::HashMap<String, String>, key: &str) -> &'a str {
    map.get(key).map_or(MISSING, String::as_str)
}
