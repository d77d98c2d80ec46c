//! Transport Adapter Trait Abstractions
//!
//! The messaging-protocol client (handshake, encryption, wire I/O) is an
//! external collaborator. The relay only consumes its typed event stream and
//! issues commands through these traits, which lets `MockTransport` replace a
//! real connection in tests.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Close code the transport reports when the account was logged out remotely.
pub const LOGGED_OUT_CODE: u16 = 401;

/// Close code used when a connection attempt itself failed.
pub const CONNECTION_LOST_CODE: u16 = 408;

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

/// Transport errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Session closed")]
    SessionClosed,

    #[error("Session artifact error: {0}")]
    Artifacts(String),
}

/// Why a transport session closed.
///
/// Only `LoggedOut` is terminal. Every other close is eligible for a
/// reconnect attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DisconnectReason {
    /// Credentials were revoked; the session must not be retried.
    LoggedOut,
    /// Network drop, server restart request, stream error, etc.
    Recoverable(u16),
}

impl DisconnectReason {
    /// Map a raw close code to a reason.
    pub fn from_code(code: u16) -> Self {
        if code == LOGGED_OUT_CODE {
            Self::LoggedOut
        } else {
            Self::Recoverable(code)
        }
    }

    /// Raw close code.
    pub fn code(&self) -> u16 {
        match self {
            Self::LoggedOut => LOGGED_OUT_CODE,
            Self::Recoverable(code) => *code,
        }
    }

    pub fn is_logged_out(&self) -> bool {
        matches!(self, Self::LoggedOut)
    }
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LoggedOut => write!(f, "logged_out"),
            Self::Recoverable(code) => write!(f, "recoverable({})", code),
        }
    }
}

/// Discrete events emitted by a live transport session, in wire order.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// A QR code was issued for device linking.
    Qr { code: String },

    /// Session credentials rotated (the transport persisted them).
    CredsUpdated,

    /// Handshake completed. `user` is the account's phone number or JID.
    ConnectionOpened { user: Option<String> },

    /// The connection closed.
    ConnectionClosed { reason: DisconnectReason },

    /// The initial app-state sync finished.
    AppStateSynced,

    /// Message, group, call or label event forwarded verbatim.
    Message {
        event: String,
        data: serde_json::Value,
    },
}

/// Outgoing message content
#[derive(Debug, Clone, PartialEq)]
pub enum MessageContent {
    Text(String),
    /// Transport-specific structured payload (media, buttons, reactions, ...)
    Structured(serde_json::Value),
}

/// Options passed to the adapter when opening a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectOptions {
    /// Capacity of the bounded event channel.
    pub event_buffer: usize,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self { event_buffer: 64 }
    }
}

/// A freshly opened session plus its event stream.
pub struct SessionHandle {
    pub session: Arc<dyn TransportSession>,
    pub events: mpsc::Receiver<TransportEvent>,
}

/// Commands accepted by a live session
#[async_trait]
pub trait TransportSession: Send + Sync {
    /// Send a message, returning the transport's message id.
    async fn send(&self, jid: &str, content: &MessageContent) -> TransportResult<String>;

    /// Ask the server for a phone-number pairing code.
    async fn request_pairing_code(&self, phone_number: &str) -> TransportResult<String>;

    /// Log out and revoke the session's credentials.
    async fn logout(&self) -> TransportResult<()>;

    /// Drop the socket without touching credentials.
    fn close(&self);
}

/// Factory for transport sessions, one live session per instance
#[async_trait]
pub trait TransportAdapter: Send + Sync {
    /// Open a session for `instance_id`.
    async fn connect(
        &self,
        instance_id: &str,
        options: ConnectOptions,
    ) -> TransportResult<SessionHandle>;

    /// Delete on-disk session credentials for `instance_id`.
    async fn remove_artifacts(&self, instance_id: &str) -> TransportResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_logged_out_code_is_terminal() {
        let reason = DisconnectReason::from_code(401);
        assert_eq!(reason, DisconnectReason::LoggedOut);
        assert!(reason.is_logged_out());
        assert_eq!(reason.code(), 401);
    }

    #[test]
    fn test_other_codes_are_recoverable() {
        for code in [408, 428, 440, 500, 503, 515] {
            let reason = DisconnectReason::from_code(code);
            assert_eq!(reason, DisconnectReason::Recoverable(code));
            assert!(!reason.is_logged_out());
            assert_eq!(reason.code(), code);
        }
    }

    #[test]
    fn test_disconnect_reason_display() {
        assert_eq!(DisconnectReason::LoggedOut.to_string(), "logged_out");
        assert_eq!(
            DisconnectReason::Recoverable(515).to_string(),
            "recoverable(515)"
        );
    }
}
