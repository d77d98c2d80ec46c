//! Persistence Gateway
//!
//! Durable store for instance records and webhook delivery logs. Writes are
//! best-effort from the caller's point of view: the in-memory registry is
//! authoritative and a failed write is reported as non-fatal.

pub mod memory;
pub mod sqlite;
pub mod traits;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;
pub use traits::{
    DeliveryStatus, InstanceRecord, LogFilter, PersistenceError, PersistenceGateway,
    PersistenceResult, WebhookLogRecord, WebhookLogUpdate,
};
