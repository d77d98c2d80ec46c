//! Webhook operator commands
//!
//! `test` and `retry` wait for the whole retry chain before returning, so a
//! short-lived process never drops a scheduled retry.

use chrono::{Duration as ChronoDuration, Utc};
use session_relay::config::RelayConfig;
use session_relay::persistence::{DeliveryStatus, LogFilter, PersistenceGateway, WebhookLogRecord};
use session_relay::webhook::{DispatchOutcome, WebhookDispatcher, WebhookStats};
use session_relay::NonFatalReporter;
use std::sync::Arc;

fn dispatcher(
    config: &RelayConfig,
    store: Arc<dyn PersistenceGateway>,
) -> Result<WebhookDispatcher, Box<dyn std::error::Error>> {
    Ok(WebhookDispatcher::from_config(
        &config.webhook,
        store,
        NonFatalReporter::logging_only(),
    )?)
}

/// Send a `webhook.test` event and report the final outcome
pub async fn test(
    config: &RelayConfig,
    store: Arc<dyn PersistenceGateway>,
    url: String,
) -> Result<(), Box<dyn std::error::Error>> {
    let dispatcher = dispatcher(config, Arc::clone(&store))?;
    println!("Sending webhook.test to {}", url);
    let outcome = dispatcher.test_connectivity(&url).await?;
    finish(&dispatcher, store.as_ref(), outcome).await
}

/// Manually re-send a logged delivery
pub async fn retry(
    config: &RelayConfig,
    store: Arc<dyn PersistenceGateway>,
    delivery_id: String,
) -> Result<(), Box<dyn std::error::Error>> {
    let dispatcher = dispatcher(config, Arc::clone(&store))?;
    let outcome = dispatcher.retry(&delivery_id).await?;
    finish(&dispatcher, store.as_ref(), outcome).await
}

async fn finish(
    dispatcher: &WebhookDispatcher,
    store: &dyn PersistenceGateway,
    outcome: DispatchOutcome,
) -> Result<(), Box<dyn std::error::Error>> {
    let delivery_id = match outcome {
        DispatchOutcome::Skipped => {
            println!("No URL, nothing sent.");
            return Ok(());
        }
        DispatchOutcome::AlreadyDelivered { delivery_id } => {
            println!("✅ Delivery {} already succeeded, nothing to do.", delivery_id);
            return Ok(());
        }
        DispatchOutcome::Delivered { delivery_id } => delivery_id,
        DispatchOutcome::Failed { delivery_id } => {
            let pending = dispatcher.pending_retries();
            println!(
                "First attempt failed, waiting for {} scheduled retry chain(s)...",
                pending
            );
            dispatcher.wait_idle().await;
            delivery_id
        }
    };

    match store.find_webhook_log(&delivery_id).await? {
        Some(record) => {
            print_outcome(&record);
            Ok(())
        }
        None => Err(format!("Delivery log {} missing", delivery_id).into()),
    }
}

fn print_outcome(record: &WebhookLogRecord) {
    match record.status {
        DeliveryStatus::Success => println!(
            "✅ Delivered {} (HTTP {}, {} attempt(s))",
            record.delivery_id,
            record.status_code.unwrap_or_default(),
            record.attempts
        ),
        DeliveryStatus::Failed => println!(
            "❌ Delivery {} failed after {} attempt(s): {}",
            record.delivery_id,
            record.attempts,
            record.error.as_deref().unwrap_or("unknown error")
        ),
    }
}

/// Print delivery log rows
pub async fn logs(
    config: &RelayConfig,
    store: Arc<dyn PersistenceGateway>,
    instance: Option<String>,
    event: Option<String>,
    status: Option<String>,
    limit: usize,
) -> Result<(), Box<dyn std::error::Error>> {
    let status = status
        .map(|s| s.parse::<DeliveryStatus>())
        .transpose()?;
    let filter = LogFilter {
        instance_id: instance,
        event,
        status,
        since: None,
        limit: Some(limit),
    };

    let rows = dispatcher(config, store)?.logs(&filter).await?;
    if rows.is_empty() {
        println!("No webhook deliveries.");
        return Ok(());
    }

    for row in rows {
        println!(
            "{}  {:<8} {:<4} x{}  {:<18} {:<16} {}",
            row.created_at.format("%Y-%m-%d %H:%M:%S"),
            row.status.as_str(),
            row.status_code
                .map(|code| code.to_string())
                .unwrap_or_else(|| "-".to_string()),
            row.attempts,
            row.event,
            row.instance_id.as_deref().unwrap_or("-"),
            row.delivery_id,
        );
        if let Some(error) = &row.error {
            println!("    {}", error);
        }
    }
    Ok(())
}

/// Print delivery statistics for the last `hours` hours
pub async fn stats(
    config: &RelayConfig,
    store: Arc<dyn PersistenceGateway>,
    instance: Option<String>,
    hours: u32,
) -> Result<(), Box<dyn std::error::Error>> {
    let filter = LogFilter {
        instance_id: instance,
        ..LogFilter::since(Utc::now() - ChronoDuration::hours(i64::from(hours)))
    };
    let stats = dispatcher(config, store)?.stats(&filter).await?;
    print_stats(&stats, hours);
    Ok(())
}

fn print_stats(stats: &WebhookStats, hours: u32) {
    println!("📊 Webhook deliveries, last {}h", hours);
    println!(
        "  total {}  success {}  failed {}  success rate {:.2}%",
        stats.total, stats.success, stats.failed, stats.success_rate
    );
    for (event, counts) in &stats.by_event {
        println!(
            "  {:<24} total {:<6} success {:<6} failed {:<6} {:.2}%",
            event,
            counts.total,
            counts.success,
            counts.failed,
            counts.success_rate()
        );
    }
}
