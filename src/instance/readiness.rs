//! App-state readiness gate
//!
//! After a connection opens, the session is considered ready either when the
//! transport reports the initial app-state sync or when a timeout elapses,
//! whichever happens first. The flag flips exactly once per session.

use std::sync::atomic::{AtomicU8, Ordering};

const NOT_READY: u8 = 0;
const BY_SIGNAL: u8 = 1;
const BY_TIMEOUT: u8 = 2;

/// Which path made the session ready
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadySource {
    /// The transport emitted `AppStateSynced`.
    Signal,
    /// The readiness window elapsed first.
    Timeout,
}

impl ReadySource {
    fn encode(self) -> u8 {
        match self {
            Self::Signal => BY_SIGNAL,
            Self::Timeout => BY_TIMEOUT,
        }
    }
}

/// Lock-free, set-once readiness flag
#[derive(Debug, Default)]
pub struct AppStateReadiness {
    state: AtomicU8,
}

impl AppStateReadiness {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark the session ready. Returns true only for the first caller.
    pub fn mark(&self, source: ReadySource) -> bool {
        self.state
            .compare_exchange(NOT_READY, source.encode(), Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Forget readiness for a new session.
    pub fn reset(&self) {
        self.state.store(NOT_READY, Ordering::Release);
    }

    pub fn is_ready(&self) -> bool {
        self.state.load(Ordering::Acquire) != NOT_READY
    }

    pub fn source(&self) -> Option<ReadySource> {
        match self.state.load(Ordering::Acquire) {
            BY_SIGNAL => Some(ReadySource::Signal),
            BY_TIMEOUT => Some(ReadySource::Timeout),
            _ => None,
        }
    }
}
