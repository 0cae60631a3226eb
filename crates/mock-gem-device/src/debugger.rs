//! Debugger/inspection hooks.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::tracker::{ResourceKind, ResourceTracker, Token};

#[derive(Debug)]
pub struct Debugger {
    sessions: AtomicU64,
    _token: Token,
}

impl Debugger {
    pub fn init(tracker: &ResourceTracker) -> Self {
        tracing::debug!("debugger hooks initialised");
        Self {
            sessions: AtomicU64::new(0),
            _token: tracker.acquire(ResourceKind::Debugger),
        }
    }

    /// Open a debug session, returning its id.
    pub fn attach(&self) -> u64 {
        self.sessions.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn sessions(&self) -> u64 {
        self.sessions.load(Ordering::Relaxed)
    }

    pub fn fini(self) {
        tracing::debug!(sessions = self.sessions(), "debugger hooks finalised");
    }
}
