//! Mock Transport for Testing
//!
//! Scriptable stand-in for a messaging-protocol client. Tests push events
//! into the current session of an instance and inspect the commands the
//! relay issued.

use super::traits::*;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;

/// Pairing code every mock session hands out.
pub const MOCK_PAIRING_CODE: &str = "MOCK-CODE";

/// Mock transport adapter
#[derive(Clone, Default)]
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
}

#[derive(Default)]
struct MockState {
    next_session: u64,
    connects: HashMap<String, u32>,
    fail_connects: u32,
    fail_logout: bool,
    fail_send: bool,
    fail_artifacts: bool,
    artifacts_delay: Option<Duration>,
    /// Current session per instance: (session serial, event sender)
    live: HashMap<String, (u64, mpsc::Sender<TransportEvent>)>,
    sent_messages: Vec<SentMessage>,
    logouts: Vec<String>,
    pairing_requests: Vec<(String, String)>,
    removed_artifacts: Vec<String>,
}

/// A message the relay asked the transport to send
#[derive(Debug, Clone, PartialEq)]
pub struct SentMessage {
    pub instance_id: String,
    pub jid: String,
    pub content: MessageContent,
}

impl MockTransport {
    /// Create new mock transport
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make the next `count` connect attempts fail with a network error.
    pub fn fail_next_connects(&self, count: u32) {
        self.state().fail_connects = count;
    }

    pub fn set_fail_logout(&self, fail: bool) {
        self.state().fail_logout = fail;
    }

    pub fn set_fail_send(&self, fail: bool) {
        self.state().fail_send = fail;
    }

    pub fn set_fail_artifacts(&self, fail: bool) {
        self.state().fail_artifacts = fail;
    }

    /// Make artifact removal take `delay` before it completes.
    pub fn set_artifacts_delay(&self, delay: Duration) {
        self.state().artifacts_delay = Some(delay);
    }

    /// Push an event into the instance's current session.
    ///
    /// Returns false when the instance has no open session.
    pub async fn emit(&self, instance_id: &str, event: TransportEvent) -> bool {
        let sender = self
            .state()
            .live
            .get(instance_id)
            .map(|(_, tx)| tx.clone());

        match sender {
            Some(tx) => tx.send(event).await.is_ok(),
            None => false,
        }
    }

    /// Number of sessions opened for an instance
    pub fn connect_count(&self, instance_id: &str) -> u32 {
        self.state()
            .connects
            .get(instance_id)
            .copied()
            .unwrap_or(0)
    }

    /// Whether an instance currently has an open session
    pub fn is_open(&self, instance_id: &str) -> bool {
        self.state().live.contains_key(instance_id)
    }

    pub fn logout_count(&self, instance_id: &str) -> usize {
        self.state()
            .logouts
            .iter()
            .filter(|id| id.as_str() == instance_id)
            .count()
    }

    pub fn sent_messages(&self) -> Vec<SentMessage> {
        self.state().sent_messages.clone()
    }

    /// (instance, phone number) pairs for every pairing-code request
    pub fn pairing_requests(&self) -> Vec<(String, String)> {
        self.state().pairing_requests.clone()
    }

    pub fn removed_artifacts(&self) -> Vec<String> {
        self.state().removed_artifacts.clone()
    }
}

#[async_trait]
impl TransportAdapter for MockTransport {
    async fn connect(
        &self,
        instance_id: &str,
        options: ConnectOptions,
    ) -> TransportResult<SessionHandle> {
        let mut state = self.state();
        *state.connects.entry(instance_id.to_string()).or_default() += 1;

        if state.fail_connects > 0 {
            state.fail_connects -= 1;
            return Err(TransportError::Network("connection refused".to_string()));
        }

        state.next_session += 1;
        let serial = state.next_session;
        let (tx, rx) = mpsc::channel(options.event_buffer.max(1));
        // Replacing the sender closes the previous session's event stream.
        state.live.insert(instance_id.to_string(), (serial, tx));

        let session = MockSession {
            instance_id: instance_id.to_string(),
            serial,
            state: Arc::clone(&self.state),
        };

        Ok(SessionHandle {
            session: Arc::new(session),
            events: rx,
        })
    }

    async fn remove_artifacts(&self, instance_id: &str) -> TransportResult<()> {
        let delay = self.state().artifacts_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state();
        if state.fail_artifacts {
            return Err(TransportError::Artifacts(format!(
                "permission denied removing session dir for {}",
                instance_id
            )));
        }
        state.removed_artifacts.push(instance_id.to_string());
        Ok(())
    }
}

/// Session handed out by `MockTransport`
struct MockSession {
    instance_id: String,
    serial: u64,
    state: Arc<Mutex<MockState>>,
}

impl MockSession {
    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn drop_live(&self, state: &mut MockState) {
        if state
            .live
            .get(&self.instance_id)
            .is_some_and(|(serial, _)| *serial == self.serial)
        {
            state.live.remove(&self.instance_id);
        }
    }
}

#[async_trait]
impl TransportSession for MockSession {
    async fn send(&self, jid: &str, content: &MessageContent) -> TransportResult<String> {
        let mut state = self.state();
        if state.fail_send {
            return Err(TransportError::Network("socket write failed".to_string()));
        }
        state.sent_messages.push(SentMessage {
            instance_id: self.instance_id.clone(),
            jid: jid.to_string(),
            content: content.clone(),
        });
        Ok(format!("MOCK{:06}", state.sent_messages.len()))
    }

    async fn request_pairing_code(&self, phone_number: &str) -> TransportResult<String> {
        let mut state = self.state();
        state
            .pairing_requests
            .push((self.instance_id.clone(), phone_number.to_string()));
        Ok(MOCK_PAIRING_CODE.to_string())
    }

    async fn logout(&self) -> TransportResult<()> {
        let mut state = self.state();
        if state.fail_logout {
            return Err(TransportError::Network("logout request timed out".to_string()));
        }
        state.logouts.push(self.instance_id.clone());
        self.drop_live(&mut state);
        Ok(())
    }

    fn close(&self) {
        let mut state = self.state();
        self.drop_live(&mut state);
    }
}
