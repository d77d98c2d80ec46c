//! Webhook HTTP sender
//!
//! `WebhookSender` performs exactly one POST per call. Retry policy lives in
//! the dispatcher; senders only classify the outcome.

use crate::error::WebhookError;
use async_trait::async_trait;
use std::time::Duration;

pub const HEADER_WEBHOOK_ID: &str = "X-Webhook-ID";
pub const HEADER_INSTANCE_ID: &str = "X-Instance-ID";
pub const HEADER_RETRY_ATTEMPT: &str = "X-Retry-Attempt";

/// One HTTP attempt of a delivery chain
#[derive(Debug, Clone, PartialEq)]
pub struct DeliveryRequest {
    pub url: String,
    pub delivery_id: String,
    pub instance_id: Option<String>,
    /// 1 for the first attempt, 2..=4 for retries
    pub attempt: u32,
    pub body: serde_json::Value,
}

impl DeliveryRequest {
    /// Correlation headers. `X-Instance-ID` is omitted for instance-less
    /// events and `X-Retry-Attempt` (the retry number) only appears on retries.
    pub fn headers(&self) -> Vec<(&'static str, String)> {
        let mut headers = vec![(HEADER_WEBHOOK_ID, self.delivery_id.clone())];
        if let Some(instance_id) = &self.instance_id {
            headers.push((HEADER_INSTANCE_ID, instance_id.clone()));
        }
        if self.attempt > 1 {
            headers.push((HEADER_RETRY_ATTEMPT, (self.attempt - 1).to_string()));
        }
        headers
    }
}

/// Why a single attempt failed
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeliveryError {
    #[error("HTTP {0}")]
    Status(u16),

    #[error("request timed out")]
    Timeout,

    #[error("network error: {0}")]
    Network(String),
}

impl DeliveryError {
    pub fn status_code(&self) -> Option<u16> {
        match self {
            Self::Status(code) => Some(*code),
            _ => None,
        }
    }
}

/// Performs one delivery attempt
#[async_trait]
pub trait WebhookSender: Send + Sync {
    /// POST the request body. `Ok` carries the 2xx status code.
    async fn send(&self, request: &DeliveryRequest) -> Result<u16, DeliveryError>;
}

/// `reqwest`-backed sender
#[derive(Clone)]
pub struct HttpSender {
    client: reqwest::Client,
}

impl HttpSender {
    pub fn new(timeout: Duration, user_agent: &str) -> Result<Self, WebhookError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(user_agent)
            .build()
            .map_err(|e| WebhookError::Client(e.to_string()))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl WebhookSender for HttpSender {
    async fn send(&self, request: &DeliveryRequest) -> Result<u16, DeliveryError> {
        let mut builder = self.client.post(&request.url).json(&request.body);
        for (name, value) in request.headers() {
            builder = builder.header(name, value);
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                DeliveryError::Timeout
            } else {
                DeliveryError::Network(e.to_string())
            }
        })?;

        let status = response.status();
        if status.is_success() {
            Ok(status.as_u16())
        } else {
            Err(DeliveryError::Status(status.as_u16()))
        }
    }
}
