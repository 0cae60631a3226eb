use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, Weak};
use std::time::{Duration, Instant};

use crate::workqueue::WorkqueueHandle;
use crate::{CpuMask, Result, SchedError, Workqueue};

pub type Job = Box<dyn FnOnce() + Send + 'static>;

struct Queued {
    seqno: u64,
    job: Job,
}

#[derive(Default)]
struct SchedState {
    queue: VecDeque<Queued>,
    inflight: usize,
    next_seqno: u64,
    retired: u64,
    cancelled: u64,
    released: bool,
}

impl SchedState {
    fn active(&self) -> usize {
        self.queue.len() + self.inflight
    }
}

struct Shared {
    width: usize,
    affinity: CpuMask,
    wq: WorkqueueHandle,
    state: Mutex<SchedState>,
    progress: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, SchedState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn wait<'a>(&self, guard: MutexGuard<'a, SchedState>) -> MutexGuard<'a, SchedState> {
        match self.progress.wait(guard) {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn submit(self: &Arc<Self>, job: Job) -> Result<u64> {
        let mut state = self.lock();
        if state.released {
            return Err(SchedError::Released("sched engine"));
        }
        state.next_seqno += 1;
        let seqno = state.next_seqno;
        state.queue.push_back(Queued { seqno, job });
        self.kick(&mut state);
        Ok(seqno)
    }

    /// Move queued jobs onto the workqueue while slots are free. Called with the state lock held;
    /// the workqueue lock is always taken after ours.
    fn kick(self: &Arc<Self>, state: &mut SchedState) {
        while state.inflight < self.width {
            let Some(Queued { seqno, job }) = state.queue.pop_front() else {
                break;
            };

            let shared = Arc::clone(self);
            let queued = self.wq.queue_boxed(Box::new(move || {
                if panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
                    tracing::warn!(seqno, "job panicked");
                }
                shared.complete(seqno);
            }));

            match queued {
                Ok(()) => state.inflight += 1,
                Err(err) => {
                    tracing::warn!(seqno, %err, "dropping job: workqueue unavailable");
                    state.cancelled += 1;
                    self.progress.notify_all();
                }
            }
        }
    }

    fn complete(self: &Arc<Self>, seqno: u64) {
        let mut state = self.lock();
        state.inflight -= 1;
        state.retired += 1;
        tracing::trace!(seqno, "job retired");
        self.kick(&mut state);
        self.progress.notify_all();
    }

    fn cancel_pending(&self) -> usize {
        let mut state = self.lock();
        let dropped = state.queue.len();
        state.queue.clear();
        state.cancelled += dropped as u64;
        self.progress.notify_all();
        dropped
    }
}

/// Orders submitted jobs and dispatches them onto a [`Workqueue`], running at most `width` of
/// them at once.
///
/// Dropping the engine releases it: new submissions are refused, jobs that were never
/// dispatched are cancelled and the caller blocks until in-flight jobs have finished.
pub struct SchedEngine {
    shared: Arc<Shared>,
}

impl SchedEngine {
    pub fn create_cpu(width: usize, wq: &Workqueue, affinity: CpuMask) -> Result<Self> {
        if width == 0 {
            return Err(SchedError::InvalidWidth);
        }
        tracing::debug!(width, ?affinity, wq = wq.name(), "sched engine created");
        Ok(Self {
            shared: Arc::new(Shared {
                width,
                affinity,
                wq: wq.handle(),
                state: Mutex::new(SchedState::default()),
                progress: Condvar::new(),
            }),
        })
    }

    pub fn width(&self) -> usize {
        self.shared.width
    }

    pub fn affinity(&self) -> CpuMask {
        self.shared.affinity
    }

    /// Queue a job. Returns its submission sequence number.
    pub fn submit(&self, job: impl FnOnce() + Send + 'static) -> Result<u64> {
        self.shared.submit(Box::new(job))
    }

    /// Jobs queued or running.
    pub fn active(&self) -> usize {
        self.shared.lock().active()
    }

    pub fn retired(&self) -> u64 {
        self.shared.lock().retired
    }

    pub fn cancelled(&self) -> u64 {
        self.shared.lock().cancelled
    }

    /// Drop every job that has not been dispatched yet. Returns how many were dropped.
    pub fn cancel_pending(&self) -> usize {
        self.shared.cancel_pending()
    }

    /// Wait up to `timeout` for the engine to go idle. Returns the number of jobs still active.
    ///
    /// A timeout too large to represent as a deadline waits without bound.
    pub fn wait_idle_timeout(&self, timeout: Duration) -> usize {
        let Some(deadline) = Instant::now().checked_add(timeout) else {
            self.wait_idle();
            return 0;
        };
        let mut state = self.shared.lock();
        while state.active() != 0 {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            state = match self.shared.progress.wait_timeout(state, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
        state.active()
    }

    /// Wait for every queued and in-flight job, without bound.
    pub fn wait_idle(&self) {
        let mut state = self.shared.lock();
        while state.active() != 0 {
            state = self.shared.wait(state);
        }
    }

    pub fn handle(&self) -> SchedHandle {
        SchedHandle {
            shared: Arc::downgrade(&self.shared),
        }
    }
}

impl Drop for SchedEngine {
    fn drop(&mut self) {
        let cancelled = {
            let mut state = self.shared.lock();
            state.released = true;
            let dropped = state.queue.len();
            state.queue.clear();
            state.cancelled += dropped as u64;
            dropped
        };
        if cancelled != 0 {
            tracing::warn!(cancelled, "sched engine released with undispatched jobs");
        }

        let mut state = self.shared.lock();
        while state.inflight != 0 {
            state = self.shared.wait(state);
        }
        tracing::debug!(retired = state.retired, "sched engine released");
    }
}

impl std::fmt::Debug for SchedEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchedEngine")
            .field("width", &self.shared.width)
            .field("affinity", &self.shared.affinity)
            .field("active", &self.active())
            .finish()
    }
}

/// Non-owning submission handle for a [`SchedEngine`].
#[derive(Clone)]
pub struct SchedHandle {
    shared: Weak<Shared>,
}

impl SchedHandle {
    pub fn submit(&self, job: impl FnOnce() + Send + 'static) -> Result<u64> {
        let shared = self
            .shared
            .upgrade()
            .ok_or(SchedError::Released("sched engine"))?;
        shared.submit(Box::new(job))
    }

    pub fn is_alive(&self) -> bool {
        self.shared
            .upgrade()
            .is_some_and(|shared| !shared.lock().released)
    }
}

impl std::fmt::Debug for SchedHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchedHandle")
            .field("alive", &self.is_alive())
            .finish()
    }
}
