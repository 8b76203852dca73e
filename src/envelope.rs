use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::dedup::fingerprint::Fingerprint;

/// A log record as shipped by filebeat through Kafka/Redis.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LogEnvelope {
    #[serde(rename = "@timestamp")]
    pub timestamp: String,
    pub fields: HashMap<String, String>,
    pub host: HashMap<String, serde_json::Value>,
    pub message: String,
    pub kubernetes: KubernetesMeta,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct KubernetesMeta {
    pub namespace: String,
    pub container: HashMap<String, String>,
    pub replicaset: HashMap<String, String>,
    pub labels: HashMap<String, String>,
    pub pod: HashMap<String, String>,
    pub node: HashMap<String, String>,
}

#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("malformed log envelope: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("record is not valid UTF-8: {0}")]
    InvalidUtf8(#[from] std::str::Utf8Error),
}

impl LogEnvelope {
    pub fn from_json(raw: &str) -> Result<Self, EnvelopeError> {
        Ok(serde_json::from_str(raw)?)
    }

    /// Wrap a bare line of text; metadata stays empty.
    pub fn from_text(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Default::default()
        }
    }

    pub fn env(&self) -> Option<&str> {
        self.fields.get("env").map(String::as_str)
    }

    /// Container name, present only for records collected from Kubernetes.
    pub fn container_name(&self) -> Option<&str> {
        self.kubernetes.container.get("name").map(String::as_str)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum AlertKind {
    NewIncident,
    RecurringStale,
}

impl AlertKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertKind::NewIncident => "new_incident",
            AlertKind::RecurringStale => "recurring",
        }
    }
}

/// An alert admitted by the decision engine, on its way to the delivery sink.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertEvent {
    pub id: String,
    pub kind: AlertKind,
    pub fingerprint: Fingerprint,
    pub incident: Fingerprint,
    pub arrival_time: DateTime<Utc>,
    pub previous_alert: Option<DateTime<Utc>>,
    pub envelope: LogEnvelope,
}

impl AlertEvent {
    pub fn new(
        kind: AlertKind,
        fingerprint: Fingerprint,
        incident: Fingerprint,
        arrival_time: DateTime<Utc>,
        envelope: LogEnvelope,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            kind,
            fingerprint,
            incident,
            arrival_time,
            previous_alert: None,
            envelope,
        }
    }

    pub fn with_previous_alert(mut self, at: DateTime<Utc>) -> Self {
        self.previous_alert = Some(at);
        self
    }
}
