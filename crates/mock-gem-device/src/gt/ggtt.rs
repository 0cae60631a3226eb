//! Mock global GTT.
//!
//! The translation table maps CPU-visible pages into the device address space. Allocation is a
//! first-fit search over the holes between bound nodes.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::tracker::{ResourceKind, ResourceTracker, Token};
use crate::{DeviceError, Result};

pub const GTT_PAGE_SIZE: u64 = 4096;
pub const MOCK_GGTT_PAGES: u64 = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GttNode {
    pub start: u64,
    pub size: u64,
}

impl GttNode {
    pub fn end(&self) -> u64 {
        self.start + self.size
    }
}

/// Device address space. Shared by reference count; it may outlive the [`Ggtt`] that created it
/// if another consumer still holds a reference.
#[derive(Debug)]
pub struct AddressSpace {
    total: u64,
    nodes: Mutex<BTreeMap<u64, u64>>,
    closed: AtomicBool,
    _token: Token,
}

impl AddressSpace {
    fn new(total: u64, tracker: &ResourceTracker) -> Self {
        Self {
            total,
            nodes: Mutex::new(BTreeMap::new()),
            closed: AtomicBool::new(false),
            _token: tracker.acquire(ResourceKind::AddressSpace),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<u64, u64>> {
        match self.nodes.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Reserve `size` bytes of device address space.
    pub fn insert(&self, size: u64) -> Result<GttNode> {
        if size == 0 || size % GTT_PAGE_SIZE != 0 {
            return Err(DeviceError::InvalidArgument(format!(
                "gtt node size {size:#x} is not a non-zero multiple of the page size"
            )));
        }
        if self.is_closed() {
            return Err(DeviceError::Busy("closed address space"));
        }

        let mut nodes = self.lock();
        let mut hole_start = 0u64;
        for (&start, &len) in nodes.iter() {
            if start - hole_start >= size {
                break;
            }
            hole_start = start + len;
        }
        if self.total - hole_start < size {
            return Err(DeviceError::NoSpace("ggtt"));
        }
        nodes.insert(hole_start, size);
        Ok(GttNode {
            start: hole_start,
            size,
        })
    }

    pub fn remove(&self, node: GttNode) -> bool {
        let mut nodes = self.lock();
        match nodes.get(&node.start) {
            Some(&size) if size == node.size => {
                nodes.remove(&node.start);
                true
            }
            _ => false,
        }
    }

    pub fn bound_bytes(&self) -> u64 {
        self.lock().values().sum()
    }

    /// Unmap everything and refuse further insertions.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.lock().clear();
    }
}

#[derive(Debug)]
pub struct Ggtt {
    vm: Arc<AddressSpace>,
    _token: Token,
}

impl Ggtt {
    pub fn init(tracker: &ResourceTracker) -> Self {
        let token = tracker.acquire(ResourceKind::Ggtt);
        let vm = Arc::new(AddressSpace::new(MOCK_GGTT_PAGES * GTT_PAGE_SIZE, tracker));
        tracing::debug!(total = vm.total(), "mock ggtt initialised");
        Self { vm, _token: token }
    }

    /// Take a reference to the address space.
    pub fn vm(&self) -> Arc<AddressSpace> {
        Arc::clone(&self.vm)
    }

    pub fn fini(self) {
        self.vm.close();
        tracing::debug!(
            external_refs = Arc::strong_count(&self.vm) - 1,
            "mock ggtt finalised"
        );
    }
}
