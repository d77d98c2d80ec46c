//! Transport Adapter Integration
//!
//! One live connection per instance. The adapter emits a bounded stream of
//! typed events and accepts send/logout commands; the connection state
//! machine in `crate::instance` is the only consumer.

pub mod mock;
pub mod traits;

pub use mock::{MockTransport, SentMessage, MOCK_PAIRING_CODE};
pub use traits::{
    ConnectOptions, DisconnectReason, MessageContent, SessionHandle, TransportAdapter,
    TransportError, TransportEvent, TransportResult, TransportSession, CONNECTION_LOST_CODE,
    LOGGED_OUT_CODE,
};
