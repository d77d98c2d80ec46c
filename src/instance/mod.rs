//! Instance lifecycle
//!
//! An instance is one managed messaging account. Its status is driven by the
//! transition table in [`state_machine`], applied under a per-instance lock
//! held in the [`registry`], and orchestrated by [`InstanceManager`].

pub mod manager;
pub mod readiness;
pub mod registry;
pub mod state_machine;

#[cfg(test)]
mod proptests;

pub use manager::{InitOptions, InstanceManager, ManagerSettings};
pub use readiness::{AppStateReadiness, ReadySource};
pub use registry::InstanceRegistry;
pub use state_machine::{Effect, Trigger};

use crate::persistence::InstanceRecord;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Connection status of an instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    Uninitialized,
    QrPending,
    PairingPending,
    Connecting,
    Connected,
    Disconnected,
    LoggedOut,
}

impl InstanceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Uninitialized => "uninitialized",
            Self::QrPending => "qr_pending",
            Self::PairingPending => "pairing_pending",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
            Self::LoggedOut => "logged_out",
        }
    }

    /// Whether a transport session exists (or is being brought up) in this state.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            Self::Connecting | Self::QrPending | Self::PairingPending | Self::Connected
        )
    }
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InstanceStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "uninitialized" => Self::Uninitialized,
            "qr_pending" => Self::QrPending,
            "pairing_pending" => Self::PairingPending,
            "connecting" => Self::Connecting,
            "connected" => Self::Connected,
            "disconnected" => Self::Disconnected,
            "logged_out" => Self::LoggedOut,
            other => return Err(format!("unknown instance status '{}'", other)),
        })
    }
}

/// In-memory view of one instance
///
/// Fields are only mutated by the transition table and by webhook
/// configuration; everything else reads snapshots.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Instance {
    id: String,
    status: InstanceStatus,
    phone_number: Option<String>,
    qr_code: Option<String>,
    pairing_code: Option<String>,
    webhook_url: Option<String>,
    reconnect_attempts: u32,
    updated_at: DateTime<Utc>,
}

impl Instance {
    pub fn new(id: impl Into<String>) -> Self {
        Self::restore(InstanceRecord::new(id))
    }

    /// Rebuild an instance from its persisted row.
    ///
    /// No transport session survives a restart, so a row saved in a session
    /// state comes back as `Disconnected` with its codes cleared.
    pub fn restore(record: InstanceRecord) -> Self {
        let mut instance = Self {
            id: record.id,
            status: record.status,
            phone_number: record.phone_number,
            qr_code: record.qr_code,
            pairing_code: record.pairing_code,
            webhook_url: record.webhook_url,
            reconnect_attempts: record.reconnect_attempts,
            updated_at: record.updated_at,
        };
        if instance.status.is_active() {
            instance.status = InstanceStatus::Disconnected;
            instance.phone_number = None;
            instance.qr_code = None;
            instance.pairing_code = None;
            instance.reconnect_attempts = 0;
        }
        instance
    }

    pub fn to_record(&self) -> InstanceRecord {
        InstanceRecord {
            id: self.id.clone(),
            status: self.status,
            phone_number: self.phone_number.clone(),
            qr_code: self.qr_code.clone(),
            pairing_code: self.pairing_code.clone(),
            webhook_url: self.webhook_url.clone(),
            reconnect_attempts: self.reconnect_attempts,
            updated_at: self.updated_at,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn status(&self) -> InstanceStatus {
        self.status
    }

    pub fn phone_number(&self) -> Option<&str> {
        self.phone_number.as_deref()
    }

    pub fn qr_code(&self) -> Option<&str> {
        self.qr_code.as_deref()
    }

    pub fn pairing_code(&self) -> Option<&str> {
        self.pairing_code.as_deref()
    }

    pub fn webhook_url(&self) -> Option<&str> {
        self.webhook_url.as_deref()
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.reconnect_attempts
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    pub fn is_connected(&self) -> bool {
        self.status == InstanceStatus::Connected
    }

    /// Set or clear the webhook URL. Blank strings clear it.
    pub fn set_webhook_url(&mut self, url: Option<String>) {
        self.webhook_url = url.filter(|u| !u.trim().is_empty());
        self.touch();
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_string_roundtrip() {
        for status in [
            InstanceStatus::Uninitialized,
            InstanceStatus::QrPending,
            InstanceStatus::PairingPending,
            InstanceStatus::Connecting,
            InstanceStatus::Connected,
            InstanceStatus::Disconnected,
            InstanceStatus::LoggedOut,
        ] {
            assert_eq!(status.as_str().parse::<InstanceStatus>().unwrap(), status);
            assert_eq!(
                serde_json::to_value(status).unwrap(),
                serde_json::Value::String(status.as_str().to_string())
            );
        }
        assert!("open".parse::<InstanceStatus>().is_err());
    }

    #[test]
    fn test_restore_demotes_session_states() {
        let mut record = InstanceRecord::new("inst-1");
        record.status = InstanceStatus::QrPending;
        record.qr_code = Some("qr".to_string());
        record.phone_number = Some("15550001111".to_string());
        record.reconnect_attempts = 3;
        record.webhook_url = Some("https://example.com/hook".to_string());

        let instance = Instance::restore(record);
        assert_eq!(instance.status(), InstanceStatus::Disconnected);
        assert_eq!(instance.qr_code(), None);
        assert_eq!(instance.phone_number(), None);
        assert_eq!(instance.reconnect_attempts(), 0);
        assert_eq!(instance.webhook_url(), Some("https://example.com/hook"));
    }

    #[test]
    fn test_restore_drops_phone_of_connected_row() {
        let mut record = InstanceRecord::new("inst-1");
        record.status = InstanceStatus::Connected;
        record.phone_number = Some("15550001111".to_string());

        let instance = Instance::restore(record);
        assert_eq!(instance.status(), InstanceStatus::Disconnected);
        assert_eq!(instance.phone_number(), None);
    }

    #[test]
    fn test_restore_keeps_logged_out() {
        let mut record = InstanceRecord::new("inst-1");
        record.status = InstanceStatus::LoggedOut;
        assert_eq!(Instance::restore(record).status(), InstanceStatus::LoggedOut);
    }

    #[test]
    fn test_blank_webhook_url_clears() {
        let mut instance = Instance::new("inst-1");
        instance.set_webhook_url(Some("https://example.com/hook".to_string()));
        assert!(instance.webhook_url().is_some());
        instance.set_webhook_url(Some("  ".to_string()));
        assert_eq!(instance.webhook_url(), None);
    }

    #[test]
    fn test_record_roundtrip() {
        let mut instance = Instance::new("inst-1");
        instance.set_webhook_url(Some("https://example.com/hook".to_string()));
        let record = instance.to_record();
        assert_eq!(Instance::restore(record), instance);
    }
}
