//! Persistence Gateway trait and record types
//!
//! The gateway is a plain record store: instance rows keyed by id and an
//! append-then-update webhook delivery log keyed by delivery id. In-memory
//! state stays authoritative; callers treat every write as best-effort.

use crate::instance::InstanceStatus;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Result type for persistence operations
pub type PersistenceResult<T> = Result<T, PersistenceError>;

/// Persistence errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PersistenceError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

impl From<sqlx::Error> for PersistenceError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => Self::NotFound("row".to_string()),
            other => Self::Database(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for PersistenceError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// Persisted instance row
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceRecord {
    pub id: String,
    pub status: InstanceStatus,
    pub phone_number: Option<String>,
    pub qr_code: Option<String>,
    pub pairing_code: Option<String>,
    pub webhook_url: Option<String>,
    pub reconnect_attempts: u32,
    pub updated_at: DateTime<Utc>,
}

impl InstanceRecord {
    /// Fresh record for an instance that has never connected
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            status: InstanceStatus::Uninitialized,
            phone_number: None,
            qr_code: None,
            pairing_code: None,
            webhook_url: None,
            reconnect_attempts: 0,
            updated_at: Utc::now(),
        }
    }
}

/// Outcome of a delivery chain as recorded in the log
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    Success,
    Failed,
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeliveryStatus {
    type Err = PersistenceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "success" => Ok(Self::Success),
            "failed" => Ok(Self::Failed),
            other => Err(PersistenceError::Serialization(format!(
                "unknown delivery status '{}'",
                other
            ))),
        }
    }
}

/// One row per delivery chain, updated in place on every retry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookLogRecord {
    pub delivery_id: String,
    pub instance_id: Option<String>,
    pub url: String,
    pub event: String,
    /// Envelope exactly as posted
    pub payload: serde_json::Value,
    pub status: DeliveryStatus,
    pub status_code: Option<u16>,
    pub error: Option<String>,
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WebhookLogRecord {
    /// Apply a retry outcome to this row.
    pub fn apply(&mut self, update: &WebhookLogUpdate) {
        self.status = update.status;
        self.status_code = update.status_code;
        self.error = update.error.clone();
        self.attempts = update.attempts;
        self.updated_at = update.updated_at;
    }
}

/// Fields rewritten on each retry attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebhookLogUpdate {
    pub status: DeliveryStatus,
    pub status_code: Option<u16>,
    pub error: Option<String>,
    pub attempts: u32,
    pub updated_at: DateTime<Utc>,
}

/// Filter for webhook log queries. Unset fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogFilter {
    pub instance_id: Option<String>,
    pub event: Option<String>,
    pub status: Option<DeliveryStatus>,
    /// Only rows created at or after this instant
    pub since: Option<DateTime<Utc>>,
    /// Newest rows first, at most this many
    pub limit: Option<usize>,
}

impl LogFilter {
    pub fn since(since: DateTime<Utc>) -> Self {
        Self {
            since: Some(since),
            ..Self::default()
        }
    }

    /// Whether a row passes every set criterion (limit is not considered).
    pub fn matches(&self, record: &WebhookLogRecord) -> bool {
        if let Some(instance_id) = &self.instance_id {
            if record.instance_id.as_deref() != Some(instance_id.as_str()) {
                return false;
            }
        }
        if let Some(event) = &self.event {
            if &record.event != event {
                return false;
            }
        }
        if let Some(status) = self.status {
            if record.status != status {
                return false;
            }
        }
        if let Some(since) = self.since {
            if record.created_at < since {
                return false;
            }
        }
        true
    }
}

/// Durable store for instance records and webhook delivery logs
#[async_trait]
pub trait PersistenceGateway: Send + Sync {
    /// Insert or replace an instance row.
    async fn upsert_instance(&self, record: &InstanceRecord) -> PersistenceResult<()>;

    async fn find_instance(&self, id: &str) -> PersistenceResult<Option<InstanceRecord>>;

    async fn list_instances(&self) -> PersistenceResult<Vec<InstanceRecord>>;

    /// Delete an instance row. Deleting a missing row is not an error.
    async fn delete_instance(&self, id: &str) -> PersistenceResult<()>;

    async fn append_webhook_log(&self, record: &WebhookLogRecord) -> PersistenceResult<()>;

    /// Rewrite a log row in place. Fails with `NotFound` if the row is missing.
    async fn update_webhook_log(
        &self,
        delivery_id: &str,
        update: &WebhookLogUpdate,
    ) -> PersistenceResult<()>;

    async fn find_webhook_log(&self, delivery_id: &str)
        -> PersistenceResult<Option<WebhookLogRecord>>;

    /// Rows matching `filter`, newest first.
    async fn query_webhook_logs(&self, filter: &LogFilter)
        -> PersistenceResult<Vec<WebhookLogRecord>>;
}
