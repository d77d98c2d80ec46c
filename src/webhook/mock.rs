//! Mock webhook sender for testing
//!
//! Responses are scripted in order; once the script runs out every request
//! gets the fallback response (200 unless changed). Each request is recorded
//! with the tokio clock so paused-time tests can check retry spacing.

use super::sender::{DeliveryError, DeliveryRequest, WebhookSender};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::time::Instant;

/// A request the dispatcher made
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub request: DeliveryRequest,
    pub at: Instant,
}

#[derive(Clone)]
pub struct MockSender {
    state: Arc<Mutex<MockSenderState>>,
}

struct MockSenderState {
    script: VecDeque<Result<u16, DeliveryError>>,
    fallback: Result<u16, DeliveryError>,
    requests: Vec<RecordedRequest>,
}

impl Default for MockSender {
    fn default() -> Self {
        Self {
            state: Arc::new(Mutex::new(MockSenderState {
                script: VecDeque::new(),
                fallback: Ok(200),
                requests: Vec::new(),
            })),
        }
    }
}

impl MockSender {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sender that answers every request with `response`.
    pub fn always(response: Result<u16, DeliveryError>) -> Self {
        let sender = Self::default();
        sender.set_fallback(response);
        sender
    }

    fn state(&self) -> MutexGuard<'_, MockSenderState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue responses for the next requests.
    pub fn push_responses(&self, responses: impl IntoIterator<Item = Result<u16, DeliveryError>>) {
        self.state().script.extend(responses);
    }

    pub fn set_fallback(&self, response: Result<u16, DeliveryError>) {
        self.state().fallback = response;
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.state().requests.clone()
    }

    pub fn request_count(&self) -> usize {
        self.state().requests.len()
    }
}

#[async_trait]
impl WebhookSender for MockSender {
    async fn send(&self, request: &DeliveryRequest) -> Result<u16, DeliveryError> {
        let mut state = self.state();
        state.requests.push(RecordedRequest {
            request: request.clone(),
            at: Instant::now(),
        });
        match state.script.pop_front() {
            Some(response) => response,
            None => state.fallback.clone(),
        }
    }
}
