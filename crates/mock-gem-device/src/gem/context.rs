use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::tracker::{ResourceKind, ResourceTracker, Token};

/// A user context. The registry keeps a reference until the context is closed or the device is
/// released.
#[derive(Debug)]
pub struct MockContext {
    id: u32,
    name: String,
    _token: Token,
}

impl MockContext {
    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

#[derive(Debug, Default)]
pub struct ContextRegistry {
    next_id: AtomicU32,
    live: Mutex<Vec<Arc<MockContext>>>,
}

impl ContextRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Arc<MockContext>>> {
        match self.live.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn create(&self, name: &str, tracker: &ResourceTracker) -> Arc<MockContext> {
        let ctx = Arc::new(MockContext {
            id: self.next_id.fetch_add(1, Ordering::Relaxed) + 1,
            name: name.to_owned(),
            _token: tracker.acquire(ResourceKind::Context),
        });
        self.lock().push(Arc::clone(&ctx));
        ctx
    }

    /// Drop the registry's reference to `ctx`.
    pub fn close(&self, ctx: &MockContext) -> bool {
        let mut live = self.lock();
        match live.iter().position(|c| c.id == ctx.id) {
            Some(pos) => {
                live.remove(pos);
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every reference the registry holds. Returns how many contexts were open.
    pub fn release_all(&self) -> usize {
        let live = std::mem::take(&mut *self.lock());
        live.len()
    }
}
