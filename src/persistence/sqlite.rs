//! SQLite Persistence Gateway
//!
//! Two tables: `instances` (one row per instance id) and `webhook_logs` (one
//! row per delivery chain). Timestamps are stored as fixed-width RFC 3339
//! strings so lexical order matches chronological order.

use super::traits::*;
use crate::instance::InstanceStatus;
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{QueryBuilder, Row, Sqlite};
use std::path::Path;
use std::str::FromStr;
use tracing::debug;

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS instances (
        id TEXT PRIMARY KEY NOT NULL,
        status TEXT NOT NULL,
        phone_number TEXT,
        qr_code TEXT,
        pairing_code TEXT,
        webhook_url TEXT,
        reconnect_attempts INTEGER NOT NULL DEFAULT 0,
        updated_at TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS webhook_logs (
        delivery_id TEXT PRIMARY KEY NOT NULL,
        instance_id TEXT,
        url TEXT NOT NULL,
        event TEXT NOT NULL,
        payload TEXT NOT NULL,
        status TEXT NOT NULL,
        status_code INTEGER,
        error TEXT,
        attempts INTEGER NOT NULL,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_webhook_logs_created_at ON webhook_logs (created_at)",
    "CREATE INDEX IF NOT EXISTS idx_webhook_logs_instance ON webhook_logs (instance_id)",
];

const LOG_COLUMNS: &str = "delivery_id, instance_id, url, event, payload, status, \
                           status_code, error, attempts, created_at, updated_at";

/// SQLite-backed store
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (creating if needed) the database file at `path`.
    pub async fn open(path: &Path) -> PersistenceResult<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    PersistenceError::Database(format!(
                        "failed to create database directory '{}': {}",
                        parent.display(),
                        e
                    ))
                })?;
            }
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.migrate().await?;
        debug!(path = %path.display(), "opened sqlite store");
        Ok(store)
    }

    /// Private in-memory database (single connection, so it is never dropped).
    pub async fn in_memory() -> PersistenceResult<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> PersistenceResult<()> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

fn encode_time(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn decode_time(raw: &str) -> PersistenceResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|at| at.with_timezone(&Utc))
        .map_err(|e| PersistenceError::Serialization(format!("bad timestamp '{}': {}", raw, e)))
}

fn decode_count(raw: i64, column: &str) -> PersistenceResult<u32> {
    u32::try_from(raw)
        .map_err(|_| PersistenceError::Serialization(format!("{} out of range: {}", column, raw)))
}

fn instance_from_row(row: &SqliteRow) -> PersistenceResult<InstanceRecord> {
    let status: String = row.try_get("status")?;
    let updated_at: String = row.try_get("updated_at")?;
    Ok(InstanceRecord {
        id: row.try_get("id")?,
        status: InstanceStatus::from_str(&status)
            .map_err(|e| PersistenceError::Serialization(e.to_string()))?,
        phone_number: row.try_get("phone_number")?,
        qr_code: row.try_get("qr_code")?,
        pairing_code: row.try_get("pairing_code")?,
        webhook_url: row.try_get("webhook_url")?,
        reconnect_attempts: decode_count(row.try_get("reconnect_attempts")?, "reconnect_attempts")?,
        updated_at: decode_time(&updated_at)?,
    })
}

fn log_from_row(row: &SqliteRow) -> PersistenceResult<WebhookLogRecord> {
    let payload: String = row.try_get("payload")?;
    let status: String = row.try_get("status")?;
    let status_code: Option<i64> = row.try_get("status_code")?;
    let created_at: String = row.try_get("created_at")?;
    let updated_at: String = row.try_get("updated_at")?;

    Ok(WebhookLogRecord {
        delivery_id: row.try_get("delivery_id")?,
        instance_id: row.try_get("instance_id")?,
        url: row.try_get("url")?,
        event: row.try_get("event")?,
        payload: serde_json::from_str(&payload)?,
        status: status.parse()?,
        status_code: status_code
            .map(|code| {
                u16::try_from(code).map_err(|_| {
                    PersistenceError::Serialization(format!("status_code out of range: {}", code))
                })
            })
            .transpose()?,
        error: row.try_get("error")?,
        attempts: decode_count(row.try_get("attempts")?, "attempts")?,
        created_at: decode_time(&created_at)?,
        updated_at: decode_time(&updated_at)?,
    })
}

#[async_trait]
impl PersistenceGateway for SqliteStore {
    async fn upsert_instance(&self, record: &InstanceRecord) -> PersistenceResult<()> {
        sqlx::query(
            "INSERT INTO instances
                (id, status, phone_number, qr_code, pairing_code, webhook_url,
                 reconnect_attempts, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                status = excluded.status,
                phone_number = excluded.phone_number,
                qr_code = excluded.qr_code,
                pairing_code = excluded.pairing_code,
                webhook_url = excluded.webhook_url,
                reconnect_attempts = excluded.reconnect_attempts,
                updated_at = excluded.updated_at",
        )
        .bind(&record.id)
        .bind(record.status.as_str())
        .bind(&record.phone_number)
        .bind(&record.qr_code)
        .bind(&record.pairing_code)
        .bind(&record.webhook_url)
        .bind(i64::from(record.reconnect_attempts))
        .bind(encode_time(&record.updated_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn find_instance(&self, id: &str) -> PersistenceResult<Option<InstanceRecord>> {
        let row = sqlx::query("SELECT * FROM instances WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(instance_from_row).transpose()
    }

    async fn list_instances(&self) -> PersistenceResult<Vec<InstanceRecord>> {
        let rows = sqlx::query("SELECT * FROM instances ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(instance_from_row).collect()
    }

    async fn delete_instance(&self, id: &str) -> PersistenceResult<()> {
        sqlx::query("DELETE FROM instances WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn append_webhook_log(&self, record: &WebhookLogRecord) -> PersistenceResult<()> {
        let payload = serde_json::to_string(&record.payload)?;
        sqlx::query(&format!(
            "INSERT INTO webhook_logs ({}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            LOG_COLUMNS
        ))
        .bind(&record.delivery_id)
        .bind(&record.instance_id)
        .bind(&record.url)
        .bind(&record.event)
        .bind(payload)
        .bind(record.status.as_str())
        .bind(record.status_code.map(i64::from))
        .bind(&record.error)
        .bind(i64::from(record.attempts))
        .bind(encode_time(&record.created_at))
        .bind(encode_time(&record.updated_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_webhook_log(
        &self,
        delivery_id: &str,
        update: &WebhookLogUpdate,
    ) -> PersistenceResult<()> {
        let result = sqlx::query(
            "UPDATE webhook_logs
             SET status = ?, status_code = ?, error = ?, attempts = ?, updated_at = ?
             WHERE delivery_id = ?",
        )
        .bind(update.status.as_str())
        .bind(update.status_code.map(i64::from))
        .bind(&update.error)
        .bind(i64::from(update.attempts))
        .bind(encode_time(&update.updated_at))
        .bind(delivery_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(PersistenceError::NotFound(delivery_id.to_string()));
        }
        Ok(())
    }

    async fn find_webhook_log(
        &self,
        delivery_id: &str,
    ) -> PersistenceResult<Option<WebhookLogRecord>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM webhook_logs WHERE delivery_id = ?",
            LOG_COLUMNS
        ))
        .bind(delivery_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(log_from_row).transpose()
    }

    async fn query_webhook_logs(
        &self,
        filter: &LogFilter,
    ) -> PersistenceResult<Vec<WebhookLogRecord>> {
        let mut query: QueryBuilder<Sqlite> = QueryBuilder::new(format!(
            "SELECT {} FROM webhook_logs WHERE 1 = 1",
            LOG_COLUMNS
        ));

        if let Some(instance_id) = &filter.instance_id {
            query.push(" AND instance_id = ").push_bind(instance_id.clone());
        }
        if let Some(event) = &filter.event {
            query.push(" AND event = ").push_bind(event.clone());
        }
        if let Some(status) = filter.status {
            query.push(" AND status = ").push_bind(status.as_str());
        }
        if let Some(since) = &filter.since {
            query.push(" AND created_at >= ").push_bind(encode_time(since));
        }
        query.push(" ORDER BY created_at DESC");
        if let Some(limit) = filter.limit {
            query
                .push(" LIMIT ")
                .push_bind(i64::try_from(limit).unwrap_or(i64::MAX));
        }

        let rows = query.build().fetch_all(&self.pool).await?;
        rows.iter().map(log_from_row).collect()
    }
}
