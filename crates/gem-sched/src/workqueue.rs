use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, Weak};
use std::thread::{self, JoinHandle};

use bitflags::bitflags;

use crate::{Result, SchedError};

/// Number of workers used when a queue is allocated with `max_active == 0`.
pub const DEFAULT_MAX_ACTIVE: usize = 4;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct WorkqueueFlags: u32 {
        /// Workers are not bound to any particular CPU.
        const UNBOUND = 1 << 1;
    }
}

pub type Work = Box<dyn FnOnce() + Send + 'static>;

#[derive(Default)]
struct QueueState {
    queue: VecDeque<Work>,
    running: usize,
    completed: u64,
    shutdown: bool,
}

struct Shared {
    name: String,
    state: Mutex<QueueState>,
    work_ready: Condvar,
    idle: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn enqueue(&self, work: Work) -> Result<()> {
        let mut state = self.lock();
        if state.shutdown {
            return Err(SchedError::Released("workqueue"));
        }
        state.queue.push_back(work);
        self.work_ready.notify_one();
        Ok(())
    }

    fn worker_loop(&self) {
        let mut state = self.lock();
        loop {
            if let Some(work) = state.queue.pop_front() {
                state.running += 1;
                drop(state);

                // A panicking item must not take the worker down with it.
                if panic::catch_unwind(AssertUnwindSafe(work)).is_err() {
                    tracing::warn!(name = %self.name, "work item panicked");
                }

                state = self.lock();
                state.running -= 1;
                state.completed += 1;
                if state.queue.is_empty() && state.running == 0 {
                    self.idle.notify_all();
                }
            } else if state.shutdown {
                return;
            } else {
                state = match self.work_ready.wait(state) {
                    Ok(guard) => guard,
                    Err(poisoned) => poisoned.into_inner(),
                };
            }
        }
    }

    fn flush(&self) {
        let mut state = self.lock();
        while !state.queue.is_empty() || state.running != 0 {
            state = match self.idle.wait(state) {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
        }
    }
}

/// Named pool of worker threads executing queued work in FIFO order.
///
/// Dropping the workqueue drains it: every item queued before the drop still runs, then the
/// workers exit and are joined.
pub struct Workqueue {
    shared: Arc<Shared>,
    flags: WorkqueueFlags,
    workers: Vec<JoinHandle<()>>,
}

impl Workqueue {
    pub fn alloc(name: &str, flags: WorkqueueFlags, max_active: usize) -> Result<Self> {
        let max_active = if max_active == 0 {
            DEFAULT_MAX_ACTIVE
        } else {
            max_active
        };

        let shared = Arc::new(Shared {
            name: name.to_owned(),
            state: Mutex::new(QueueState::default()),
            work_ready: Condvar::new(),
            idle: Condvar::new(),
        });

        let mut wq = Self {
            shared,
            flags,
            workers: Vec::with_capacity(max_active),
        };

        for n in 0..max_active {
            let shared = Arc::clone(&wq.shared);
            let spawned = thread::Builder::new()
                .name(format!("{name}/{n}"))
                .spawn(move || shared.worker_loop());
            match spawned {
                Ok(handle) => wq.workers.push(handle),
                Err(source) => {
                    // `wq` drops here and joins the workers that did start.
                    return Err(SchedError::Spawn {
                        name: name.to_owned(),
                        source,
                    });
                }
            }
        }

        tracing::debug!(name, workers = max_active, ?flags, "workqueue allocated");
        Ok(wq)
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn flags(&self) -> WorkqueueFlags {
        self.flags
    }

    pub fn max_active(&self) -> usize {
        self.workers.len()
    }

    pub fn queue(&self, work: impl FnOnce() + Send + 'static) -> Result<()> {
        self.shared.enqueue(Box::new(work))
    }

    /// Block until nothing is queued or running.
    pub fn flush(&self) {
        self.shared.flush();
    }

    /// Items queued or running.
    pub fn pending(&self) -> usize {
        let state = self.shared.lock();
        state.queue.len() + state.running
    }

    pub fn completed(&self) -> u64 {
        self.shared.lock().completed
    }

    pub fn handle(&self) -> WorkqueueHandle {
        WorkqueueHandle {
            shared: Arc::downgrade(&self.shared),
        }
    }
}

impl Drop for Workqueue {
    fn drop(&mut self) {
        {
            let mut state = self.shared.lock();
            state.shutdown = true;
            self.shared.work_ready.notify_all();
        }
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                tracing::warn!(name = %self.shared.name, "workqueue worker panicked");
            }
        }
        tracing::debug!(name = %self.shared.name, "workqueue destroyed");
    }
}

impl std::fmt::Debug for Workqueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Workqueue")
            .field("name", &self.shared.name)
            .field("flags", &self.flags)
            .field("workers", &self.workers.len())
            .finish()
    }
}

/// Non-owning reference to a [`Workqueue`].
#[derive(Clone)]
pub struct WorkqueueHandle {
    shared: Weak<Shared>,
}

impl WorkqueueHandle {
    pub fn queue(&self, work: impl FnOnce() + Send + 'static) -> Result<()> {
        self.queue_boxed(Box::new(work))
    }

    pub(crate) fn queue_boxed(&self, work: Work) -> Result<()> {
        let shared = self
            .shared
            .upgrade()
            .ok_or(SchedError::Released("workqueue"))?;
        shared.enqueue(work)
    }

    /// Block until the queue is idle. Returns `false` if the queue no longer exists.
    pub fn flush(&self) -> bool {
        match self.shared.upgrade() {
            Some(shared) => {
                shared.flush();
                true
            }
            None => false,
        }
    }

    pub fn is_alive(&self) -> bool {
        self.shared
            .upgrade()
            .is_some_and(|shared| !shared.lock().shutdown)
    }
}

impl std::fmt::Debug for WorkqueueHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkqueueHandle")
            .field("alive", &self.is_alive())
            .finish()
    }
}
