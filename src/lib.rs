//! Session Relay - managed messaging sessions with webhook fan-out
//!
//! Runs one reconnecting transport session per instance and republishes
//! session and message lifecycle events to a user-supplied HTTP endpoint.
//!
//! Key pieces:
//! - `instance`: connection state machine, registry, readiness gate
//! - `webhook`: one-shot delivery with background linear-backoff retries
//! - `transport`: the adapter seam to the messaging-protocol client
//! - `persistence`: instance records and webhook delivery logs
//!
//! Delivery is best-effort: a failed webhook is retried and logged, never
//! surfaced to the code path that produced the event.

pub mod config;
pub mod error;
pub mod instance;
pub mod persistence;
pub mod retry;
pub mod transport;
pub mod webhook;

pub use error::{InstanceError, NonFatalError, NonFatalReporter, WebhookError};
pub use instance::{InitOptions, Instance, InstanceManager, InstanceStatus, ManagerSettings};
pub use webhook::{WebhookDispatcher, WebhookEnvelope};
