use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::FenceError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FenceState {
    Pending,
    Signaled,
    Failed(FenceError),
}

/// One-shot completion object.
///
/// A fence starts pending and is signalled exactly once, either successfully or with a
/// [`FenceError`]. Later signals are ignored.
#[derive(Debug)]
pub struct Fence {
    seqno: u64,
    state: Mutex<FenceState>,
    cond: Condvar,
}

impl Fence {
    pub fn new(seqno: u64) -> Self {
        Self {
            seqno,
            state: Mutex::new(FenceState::Pending),
            cond: Condvar::new(),
        }
    }

    pub fn seqno(&self) -> u64 {
        self.seqno
    }

    fn lock(&self) -> MutexGuard<'_, FenceState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Signal success. Returns `false` if the fence was already signalled.
    pub fn signal(&self) -> bool {
        self.complete(FenceState::Signaled)
    }

    /// Signal with an error. Returns `false` if the fence was already signalled.
    pub fn signal_error(&self, err: FenceError) -> bool {
        self.complete(FenceState::Failed(err))
    }

    fn complete(&self, next: FenceState) -> bool {
        let mut state = self.lock();
        if *state != FenceState::Pending {
            return false;
        }
        *state = next;
        self.cond.notify_all();
        true
    }

    pub fn is_signaled(&self) -> bool {
        *self.lock() != FenceState::Pending
    }

    pub fn error(&self) -> Option<FenceError> {
        match *self.lock() {
            FenceState::Failed(err) => Some(err),
            _ => None,
        }
    }

    /// Block until the fence is signalled or `timeout` elapses. Returns whether it signalled.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let Some(deadline) = Instant::now().checked_add(timeout) else {
            self.wait();
            return true;
        };
        let mut state = self.lock();
        while *state == FenceState::Pending {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            state = match self.cond.wait_timeout(state, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
        true
    }

    /// Block until the fence is signalled.
    pub fn wait(&self) {
        let mut state = self.lock();
        while *state == FenceState::Pending {
            state = match self.cond.wait(state) {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
        }
    }
}
