//! In-memory Persistence Gateway
//!
//! Used by tests and by embedders that do not need records to survive a
//! restart. `set_unavailable` makes every call fail so callers' non-fatal
//! handling can be exercised.

use super::traits::*;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::RwLock;

/// In-memory store
#[derive(Default)]
pub struct MemoryStore {
    instances: RwLock<HashMap<String, InstanceRecord>>,
    logs: RwLock<HashMap<String, WebhookLogRecord>>,
    unavailable: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate an outage: every operation fails with `Unavailable`.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check(&self) -> PersistenceResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(PersistenceError::Unavailable(
                "memory store offline".to_string(),
            ));
        }
        Ok(())
    }

    /// Number of webhook log rows (test helper)
    pub async fn webhook_log_count(&self) -> usize {
        self.logs.read().await.len()
    }
}

#[async_trait]
impl PersistenceGateway for MemoryStore {
    async fn upsert_instance(&self, record: &InstanceRecord) -> PersistenceResult<()> {
        self.check()?;
        self.instances
            .write()
            .await
            .insert(record.id.clone(), record.clone());
        Ok(())
    }

    async fn find_instance(&self, id: &str) -> PersistenceResult<Option<InstanceRecord>> {
        self.check()?;
        Ok(self.instances.read().await.get(id).cloned())
    }

    async fn list_instances(&self) -> PersistenceResult<Vec<InstanceRecord>> {
        self.check()?;
        let mut records: Vec<_> = self.instances.read().await.values().cloned().collect();
        records.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(records)
    }

    async fn delete_instance(&self, id: &str) -> PersistenceResult<()> {
        self.check()?;
        self.instances.write().await.remove(id);
        Ok(())
    }

    async fn append_webhook_log(&self, record: &WebhookLogRecord) -> PersistenceResult<()> {
        self.check()?;
        self.logs
            .write()
            .await
            .insert(record.delivery_id.clone(), record.clone());
        Ok(())
    }

    async fn update_webhook_log(
        &self,
        delivery_id: &str,
        update: &WebhookLogUpdate,
    ) -> PersistenceResult<()> {
        self.check()?;
        let mut logs = self.logs.write().await;
        let record = logs
            .get_mut(delivery_id)
            .ok_or_else(|| PersistenceError::NotFound(delivery_id.to_string()))?;
        record.apply(update);
        Ok(())
    }

    async fn find_webhook_log(
        &self,
        delivery_id: &str,
    ) -> PersistenceResult<Option<WebhookLogRecord>> {
        self.check()?;
        Ok(self.logs.read().await.get(delivery_id).cloned())
    }

    async fn query_webhook_logs(
        &self,
        filter: &LogFilter,
    ) -> PersistenceResult<Vec<WebhookLogRecord>> {
        self.check()?;
        let mut rows: Vec<_> = self
            .logs
            .read()
            .await
            .values()
            .filter(|record| filter.matches(record))
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        if let Some(limit) = filter.limit {
            rows.truncate(limit);
        }
        Ok(rows)
    }
}
