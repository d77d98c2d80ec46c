use session_relay::persistence::PersistenceGateway;
use session_relay::webhook::validate_url;
use std::sync::Arc;

/// Print every persisted instance
pub async fn list(store: Arc<dyn PersistenceGateway>) -> Result<(), Box<dyn std::error::Error>> {
    let records = store.list_instances().await?;
    if records.is_empty() {
        println!("No instances.");
        return Ok(());
    }

    println!(
        "{:<24} {:<16} {:<16} {:<9} WEBHOOK",
        "ID", "STATUS", "PHONE", "ATTEMPTS"
    );
    for record in records {
        println!(
            "{:<24} {:<16} {:<16} {:<9} {}",
            record.id,
            record.status.as_str(),
            record.phone_number.as_deref().unwrap_or("-"),
            record.reconnect_attempts,
            record.webhook_url.as_deref().unwrap_or("-"),
        );
    }
    Ok(())
}

/// Set or clear the webhook URL on a persisted instance record
pub async fn set_webhook(
    store: Arc<dyn PersistenceGateway>,
    instance: String,
    url: Option<String>,
    clear: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let Some(mut record) = store.find_instance(&instance).await? else {
        return Err(format!("Instance not found: {}", instance).into());
    };

    let url = if clear {
        None
    } else {
        let url = url.ok_or("either --url or --clear is required")?;
        validate_url(&url)?;
        Some(url)
    };

    record.webhook_url = url;
    record.updated_at = chrono::Utc::now();
    store.upsert_instance(&record).await?;

    match &record.webhook_url {
        Some(url) => println!("✅ Webhook for {} set to {}", instance, url),
        None => println!("✅ Webhook for {} cleared", instance),
    }
    Ok(())
}
