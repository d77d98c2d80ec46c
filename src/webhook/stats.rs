//! Delivery statistics over a window of log rows

use crate::persistence::{DeliveryStatus, WebhookLogRecord};
use serde::Serialize;
use std::collections::BTreeMap;

/// Total/success/failed counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct OutcomeCounts {
    pub total: u64,
    pub success: u64,
    pub failed: u64,
}

impl OutcomeCounts {
    fn record(&mut self, status: DeliveryStatus) {
        self.total += 1;
        match status {
            DeliveryStatus::Success => self.success += 1,
            DeliveryStatus::Failed => self.failed += 1,
        }
    }

    /// Success percentage rounded to two decimals; 0 when empty.
    pub fn success_rate(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        let rate = self.success as f64 * 100.0 / self.total as f64;
        (rate * 100.0).round() / 100.0
    }
}

/// Aggregate over a set of log rows
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookStats {
    pub total: u64,
    pub success: u64,
    pub failed: u64,
    pub success_rate: f64,
    pub by_event: BTreeMap<String, OutcomeCounts>,
}

impl WebhookStats {
    pub fn from_records<'a>(records: impl IntoIterator<Item = &'a WebhookLogRecord>) -> Self {
        let mut overall = OutcomeCounts::default();
        let mut by_event: BTreeMap<String, OutcomeCounts> = BTreeMap::new();

        for record in records {
            overall.record(record.status);
            by_event
                .entry(record.event.clone())
                .or_default()
                .record(record.status);
        }

        Self {
            total: overall.total,
            success: overall.success,
            failed: overall.failed,
            success_rate: overall.success_rate(),
            by_event,
        }
    }
}
