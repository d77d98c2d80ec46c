//! Webhook event envelope
//!
//! Every delivery posts `{event, instanceId, timestamp, data}`. The
//! dispatcher does not interpret `event` or `data`.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use serde_json::{json, Value};

/// Lifecycle status changes of an instance
pub const SESSION_STATUS: &str = "session.status";

/// Connectivity probe sent by `WebhookDispatcher::test_connectivity`
pub const WEBHOOK_TEST: &str = "webhook.test";

/// One event to be delivered
#[derive(Debug, Clone, PartialEq)]
pub struct WebhookEnvelope {
    pub event: String,
    pub instance_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub data: Value,
}

impl WebhookEnvelope {
    pub fn new(event: impl Into<String>, instance_id: Option<String>, data: Value) -> Self {
        Self {
            event: event.into(),
            instance_id,
            timestamp: Utc::now(),
            data,
        }
    }

    /// `session.status` envelope for an instance
    pub fn session_status(instance_id: &str, data: SessionStatusData) -> Self {
        Self::new(SESSION_STATUS, Some(instance_id.to_string()), data.to_value())
    }

    /// JSON body as posted. `instanceId` is `null` when absent.
    pub fn to_value(&self) -> Value {
        json!({
            "event": self.event,
            "instanceId": self.instance_id,
            "timestamp": self.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true),
            "data": self.data,
        })
    }
}

/// `data` of a `session.status` event
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatusData {
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phone_number: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub qr_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl SessionStatusData {
    pub fn qr(code: &str) -> Self {
        Self {
            status: "qr".to_string(),
            qr_code: Some(code.to_string()),
            ..Self::default()
        }
    }

    pub fn connected(phone_number: Option<&str>) -> Self {
        Self {
            status: "connected".to_string(),
            phone_number: phone_number.map(str::to_string),
            ..Self::default()
        }
    }

    pub fn disconnected(reason: &str) -> Self {
        Self {
            status: "disconnected".to_string(),
            reason: Some(reason.to_string()),
            ..Self::default()
        }
    }

    pub fn to_value(&self) -> Value {
        let mut data = json!({ "status": self.status });
        if let Some(phone_number) = &self.phone_number {
            data["phoneNumber"] = json!(phone_number);
        }
        if let Some(qr_code) = &self.qr_code {
            data["qrCode"] = json!(qr_code);
        }
        if let Some(reason) = &self.reason {
            data["reason"] = json!(reason);
        }
        data
    }
}
