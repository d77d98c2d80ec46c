//! Webhook Delivery Engine
//!
//! `dispatch` makes one synchronous attempt and logs it. On failure the rest
//! of the chain runs in the background: retry `n` waits `n × base` after the
//! previous attempt, reuses the delivery id and payload, and rewrites the
//! same log row. Persistence failures never stop an attempt.

use super::envelope::{WebhookEnvelope, WEBHOOK_TEST};
use super::scheduler::RetryScheduler;
use super::sender::{DeliveryError, DeliveryRequest, HttpSender, WebhookSender};
use super::stats::WebhookStats;
use crate::config::WebhookConfig;
use crate::error::{NonFatalReporter, WebhookError};
use crate::persistence::{
    DeliveryStatus, LogFilter, PersistenceGateway, WebhookLogRecord, WebhookLogUpdate,
};
use crate::retry::LinearBackoff;
use chrono::Utc;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Result of starting a delivery chain
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// No webhook URL configured; nothing sent, nothing logged.
    Skipped,
    /// First attempt succeeded.
    Delivered { delivery_id: String },
    /// First attempt failed; retries are scheduled.
    Failed { delivery_id: String },
    /// Manual retry of a chain that already succeeded.
    AlreadyDelivered { delivery_id: String },
}

impl DispatchOutcome {
    pub fn delivery_id(&self) -> Option<&str> {
        match self {
            Self::Skipped => None,
            Self::Delivered { delivery_id }
            | Self::Failed { delivery_id }
            | Self::AlreadyDelivered { delivery_id } => Some(delivery_id),
        }
    }
}

#[derive(Clone)]
pub struct WebhookDispatcher {
    inner: Arc<DispatcherInner>,
}

struct DispatcherInner {
    sender: Arc<dyn WebhookSender>,
    store: Arc<dyn PersistenceGateway>,
    retry: LinearBackoff,
    scheduler: RetryScheduler,
    reporter: NonFatalReporter,
}

impl WebhookDispatcher {
    pub fn new(
        sender: Arc<dyn WebhookSender>,
        store: Arc<dyn PersistenceGateway>,
        retry: LinearBackoff,
        reporter: NonFatalReporter,
    ) -> Self {
        Self {
            inner: Arc::new(DispatcherInner {
                sender,
                store,
                retry,
                scheduler: RetryScheduler::new(),
                reporter,
            }),
        }
    }

    /// Dispatcher with an HTTP sender built from `[webhook]` settings
    pub fn from_config(
        config: &WebhookConfig,
        store: Arc<dyn PersistenceGateway>,
        reporter: NonFatalReporter,
    ) -> Result<Self, WebhookError> {
        let sender = HttpSender::new(config.timeout, &config.user_agent)?;
        Ok(Self::new(
            Arc::new(sender),
            store,
            LinearBackoff::new(config.retry_base_delay, config.max_retries),
            reporter,
        ))
    }

    /// Deliver `envelope` to `url`.
    ///
    /// Returns after the first attempt. A missing or blank URL skips the
    /// delivery entirely.
    pub async fn dispatch(&self, url: Option<&str>, envelope: WebhookEnvelope) -> DispatchOutcome {
        let Some(url) = url.map(str::trim).filter(|u| !u.is_empty()) else {
            debug!(event = %envelope.event, "no webhook configured, skipping");
            return DispatchOutcome::Skipped;
        };

        let body = envelope.to_value();
        self.start_chain(url.to_string(), envelope.event, envelope.instance_id, body)
            .await
    }

    async fn start_chain(
        &self,
        url: String,
        event: String,
        instance_id: Option<String>,
        body: Value,
    ) -> DispatchOutcome {
        let request = DeliveryRequest {
            url,
            delivery_id: Uuid::new_v4().to_string(),
            instance_id,
            attempt: 1,
            body,
        };

        let result = self.inner.sender.send(&request).await;

        let now = Utc::now();
        let (status, status_code, error) = outcome_fields(&result);
        let record = WebhookLogRecord {
            delivery_id: request.delivery_id.clone(),
            instance_id: request.instance_id.clone(),
            url: request.url.clone(),
            event: event.clone(),
            payload: request.body.clone(),
            status,
            status_code,
            error,
            attempts: 1,
            created_at: now,
            updated_at: now,
        };
        if let Err(e) = self.inner.store.append_webhook_log(&record).await {
            self.inner.reporter.persistence("append_webhook_log", e);
        }

        let delivery_id = request.delivery_id.clone();
        match result {
            Ok(code) => {
                info!(delivery = %delivery_id, event = %event, status = code, "webhook delivered");
                DispatchOutcome::Delivered { delivery_id }
            }
            Err(e) => {
                warn!(delivery = %delivery_id, event = %event, error = %e, "webhook delivery failed, scheduling retries");
                self.schedule_retries(request);
                DispatchOutcome::Failed { delivery_id }
            }
        }
    }

    fn schedule_retries(&self, request: DeliveryRequest) {
        if self.inner.retry.limit() == 0 {
            return;
        }
        let this = self.clone();
        let key = request.delivery_id.clone();
        self.inner
            .scheduler
            .schedule(key, async move { this.run_retries(request).await });
    }

    async fn run_retries(&self, mut request: DeliveryRequest) {
        let delivery_id = request.delivery_id.clone();

        for (retry, delay) in self.inner.retry.schedule() {
            tokio::time::sleep(delay).await;

            match self.inner.store.find_webhook_log(&delivery_id).await {
                Ok(Some(record)) if record.status == DeliveryStatus::Success => {
                    debug!(delivery = %delivery_id, "already delivered, dropping retry chain");
                    return;
                }
                Ok(_) => {}
                Err(e) => self.inner.reporter.persistence("find_webhook_log", e),
            }

            request.attempt = retry + 1;
            let result = self.inner.sender.send(&request).await;

            let (status, status_code, error) = outcome_fields(&result);
            let update = WebhookLogUpdate {
                status,
                status_code,
                error,
                attempts: request.attempt,
                updated_at: Utc::now(),
            };
            if let Err(e) = self.inner.store.update_webhook_log(&delivery_id, &update).await {
                self.inner.reporter.persistence("update_webhook_log", e);
            }

            match result {
                Ok(code) => {
                    info!(delivery = %delivery_id, retry, status = code, "webhook delivered on retry");
                    return;
                }
                Err(e) => {
                    warn!(delivery = %delivery_id, retry, error = %e, "webhook retry failed");
                }
            }
        }

        warn!(
            delivery = %delivery_id,
            attempts = request.attempt,
            "webhook retry budget exhausted"
        );
    }

    /// Manually re-trigger a logged delivery.
    ///
    /// A chain that already succeeded is left alone. Otherwise any pending
    /// retries of the old chain are cancelled and the original payload starts
    /// a new chain under a fresh delivery id.
    pub async fn retry(&self, delivery_id: &str) -> Result<DispatchOutcome, WebhookError> {
        let record = self
            .inner
            .store
            .find_webhook_log(delivery_id)
            .await?
            .ok_or_else(|| WebhookError::NotFound(delivery_id.to_string()))?;

        if record.status == DeliveryStatus::Success {
            return Ok(DispatchOutcome::AlreadyDelivered {
                delivery_id: record.delivery_id,
            });
        }

        if self.inner.scheduler.cancel(delivery_id) {
            debug!(delivery = %delivery_id, "cancelled pending retries before manual retry");
        }
        info!(delivery = %delivery_id, event = %record.event, "manual webhook retry");
        Ok(self
            .start_chain(record.url, record.event, record.instance_id, record.payload)
            .await)
    }

    /// Send a `webhook.test` event (no instance) to `url`.
    pub async fn test_connectivity(&self, url: &str) -> Result<DispatchOutcome, WebhookError> {
        validate_url(url)?;
        let envelope = WebhookEnvelope::new(
            WEBHOOK_TEST,
            None,
            json!({ "message": "Webhook connectivity test" }),
        );
        Ok(self.dispatch(Some(url), envelope).await)
    }

    /// Aggregate log rows matching `filter`.
    pub async fn stats(&self, filter: &LogFilter) -> Result<WebhookStats, WebhookError> {
        let rows = self.inner.store.query_webhook_logs(filter).await?;
        Ok(WebhookStats::from_records(&rows))
    }

    /// Log rows matching `filter`, newest first.
    pub async fn logs(&self, filter: &LogFilter) -> Result<Vec<WebhookLogRecord>, WebhookError> {
        Ok(self.inner.store.query_webhook_logs(filter).await?)
    }

    /// Wait until every scheduled retry chain has finished.
    pub async fn wait_idle(&self) {
        self.inner.scheduler.wait_idle().await;
    }

    pub fn pending_retries(&self) -> usize {
        self.inner.scheduler.pending()
    }

    pub fn is_retry_pending(&self, delivery_id: &str) -> bool {
        self.inner.scheduler.is_scheduled(delivery_id)
    }
}

fn outcome_fields(
    result: &Result<u16, DeliveryError>,
) -> (DeliveryStatus, Option<u16>, Option<String>) {
    match result {
        Ok(code) => (DeliveryStatus::Success, Some(*code), None),
        Err(e) => (DeliveryStatus::Failed, e.status_code(), Some(e.to_string())),
    }
}

/// Accept only absolute http(s) URLs.
pub fn validate_url(url: &str) -> Result<(), WebhookError> {
    let parsed = reqwest::Url::parse(url).map_err(|e| WebhookError::InvalidUrl {
        url: url.to_string(),
        reason: e.to_string(),
    })?;
    match parsed.scheme() {
        "http" | "https" => Ok(()),
        other => Err(WebhookError::InvalidUrl {
            url: url.to_string(),
            reason: format!("unsupported scheme '{}'", other),
        }),
    }
}
