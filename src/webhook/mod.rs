//! Webhook Delivery Engine
//!
//! Delivers lifecycle and passthrough events to a user-supplied HTTP
//! endpoint: one synchronous attempt, then a bounded background retry chain
//! that rewrites a single log row per delivery id.

pub mod dispatcher;
pub mod envelope;
pub mod mock;
pub mod scheduler;
pub mod sender;
pub mod stats;

pub use dispatcher::{validate_url, DispatchOutcome, WebhookDispatcher};
pub use envelope::{SessionStatusData, WebhookEnvelope, SESSION_STATUS, WEBHOOK_TEST};
pub use mock::{MockSender, RecordedRequest};
pub use scheduler::RetryScheduler;
pub use sender::{DeliveryError, DeliveryRequest, HttpSender, WebhookSender};
pub use stats::{OutcomeCounts, WebhookStats};
