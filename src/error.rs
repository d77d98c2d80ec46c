//! Caller-facing errors and the non-fatal error channel
//!
//! Commands invoked directly by a caller return `InstanceError` or
//! `WebhookError`. Failures that happen during bookkeeping or in background
//! tasks never reach a caller; they are reported as `NonFatalError` through a
//! `NonFatalReporter`, which logs them and optionally forwards them to a
//! subscriber.

use crate::instance::InstanceStatus;
use crate::persistence::PersistenceError;
use crate::transport::TransportError;
use tokio::sync::mpsc;
use tracing::warn;

/// Errors returned by `InstanceManager` commands
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InstanceError {
    #[error("Instance not found: {0}")]
    NotFound(String),

    #[error("Instance {0} could not bring up a transport session")]
    NotConnectable(String),

    #[error("Instance {0} is not connected")]
    NotConnected(String),

    #[error("Instance {0} is already connected")]
    AlreadyConnected(String),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Invalid transition from {from} on {trigger}")]
    InvalidTransition {
        from: InstanceStatus,
        trigger: &'static str,
    },
}

/// Errors returned by caller-invoked webhook commands
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WebhookError {
    #[error("Webhook delivery not found: {0}")]
    NotFound(String),

    #[error("Persistence error: {0}")]
    Persistence(#[from] PersistenceError),

    #[error("Invalid webhook URL '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("HTTP client error: {0}")]
    Client(String),
}

/// A failure that was logged and swallowed instead of surfacing to a caller
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NonFatalError {
    #[error("persistence write '{operation}' failed: {source}")]
    Persistence {
        operation: &'static str,
        #[source]
        source: PersistenceError,
    },

    #[error("removing session artifacts for {instance_id} failed: {source}")]
    Artifacts {
        instance_id: String,
        #[source]
        source: TransportError,
    },

    #[error("logout of {instance_id} during delete failed: {source}")]
    Logout {
        instance_id: String,
        #[source]
        source: TransportError,
    },

    #[error("reconnect of {instance_id} failed: {source}")]
    Reconnect {
        instance_id: String,
        #[source]
        source: TransportError,
    },
}

/// Sink for non-fatal errors
///
/// Every report is logged at `warn`. When built with [`NonFatalReporter::channel`]
/// the error is also forwarded to the returned receiver.
#[derive(Debug, Clone, Default)]
pub struct NonFatalReporter {
    tx: Option<mpsc::UnboundedSender<NonFatalError>>,
}

impl NonFatalReporter {
    /// Reporter that only logs
    pub fn logging_only() -> Self {
        Self::default()
    }

    /// Reporter that logs and forwards to the returned receiver
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<NonFatalError>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx: Some(tx) }, rx)
    }

    pub fn report(&self, error: NonFatalError) {
        warn!(error = %error, "non-fatal error");
        if let Some(tx) = &self.tx {
            // Subscriber may have gone away; the log line above is enough.
            let _ = tx.send(error);
        }
    }

    /// Report a failed persistence write.
    pub fn persistence(&self, operation: &'static str, source: PersistenceError) {
        self.report(NonFatalError::Persistence { operation, source });
    }
}
