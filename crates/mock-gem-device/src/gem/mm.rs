//! Device-level GEM memory management.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use gem_sched::{SchedHandle, WorkqueueHandle};

use super::context::ContextRegistry;
use super::object::{GemObject, ObjectInner};
use crate::tracker::ResourceTracker;
use crate::Result;

/// Passes over the workqueue before giving up on deferred frees that keep requeueing.
const DRAIN_PASSES: usize = 3;

/// Objects waiting for deferred release.
#[derive(Default)]
pub(crate) struct FreeList {
    objects: Mutex<Vec<ObjectInner>>,
    freed: AtomicU64,
}

impl FreeList {
    fn lock(&self) -> MutexGuard<'_, Vec<ObjectInner>> {
        match self.objects.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub(crate) fn push(&self, object: ObjectInner) {
        self.lock().push(object);
    }

    pub(crate) fn free_all(&self) -> usize {
        let objects = std::mem::take(&mut *self.lock());
        let count = objects.len();
        drop(objects);
        self.freed.fetch_add(count as u64, Ordering::Relaxed);
        count
    }

    fn len(&self) -> usize {
        self.lock().len()
    }
}

pub struct GemMm {
    free_list: Arc<FreeList>,
    wq: Option<WorkqueueHandle>,
    sched: Option<SchedHandle>,
    contexts: ContextRegistry,
}

impl Default for GemMm {
    fn default() -> Self {
        Self::new()
    }
}

impl GemMm {
    pub fn new() -> Self {
        Self {
            free_list: Arc::new(FreeList::default()),
            wq: None,
            sched: None,
            contexts: ContextRegistry::new(),
        }
    }

    /// Record the device workqueue and scheduler so GEM code can reach them.
    pub(crate) fn bind(&mut self, wq: WorkqueueHandle, sched: SchedHandle) {
        self.wq = Some(wq);
        self.sched = Some(sched);
    }

    pub fn wq(&self) -> Option<&WorkqueueHandle> {
        self.wq.as_ref()
    }

    pub fn sched(&self) -> Option<&SchedHandle> {
        self.sched.as_ref()
    }

    pub fn contexts(&self) -> &ContextRegistry {
        &self.contexts
    }

    pub(crate) fn create_object(&self, size: u64, tracker: &ResourceTracker) -> Result<GemObject> {
        GemObject::new(
            size,
            tracker,
            Arc::downgrade(&self.free_list),
            self.wq.clone(),
        )
    }

    /// Objects dropped by their users but not yet released.
    pub fn pending_frees(&self) -> usize {
        self.free_list.len()
    }

    pub fn objects_freed(&self) -> u64 {
        self.free_list.freed.load(Ordering::Relaxed)
    }

    /// Let queued deferred-free work run to completion.
    pub fn drain_workqueue(&self) {
        let Some(wq) = &self.wq else {
            return;
        };
        for _ in 0..DRAIN_PASSES {
            if !wq.flush() || self.pending_frees() == 0 {
                break;
            }
        }
    }

    /// Release every object still waiting on the deferred-free list. Returns how many there were.
    pub fn drain_freed_objects(&self) -> usize {
        let freed = self.free_list.free_all();
        if freed != 0 {
            tracing::debug!(freed, "released deferred gem objects");
        }
        freed
    }
}

impl std::fmt::Debug for GemMm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GemMm")
            .field("pending_frees", &self.pending_frees())
            .field("contexts", &self.contexts.len())
            .finish()
    }
}
