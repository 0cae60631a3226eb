use std::sync::{Arc, Weak};

use gem_sched::WorkqueueHandle;

use super::mm::FreeList;
use crate::gt::{AddressSpace, GttNode, GTT_PAGE_SIZE};
use crate::tracker::{ResourceKind, ResourceTracker, Token};
use crate::{DeviceError, Result};

/// What is left of a GEM object once its handle is gone. Dropping it unbinds the object and
/// records its release.
pub(crate) struct ObjectInner {
    binding: Option<(Arc<AddressSpace>, GttNode)>,
    _token: Option<Token>,
}

impl Drop for ObjectInner {
    fn drop(&mut self) {
        if let Some((vm, node)) = self.binding.take() {
            vm.remove(node);
        }
    }
}

/// A buffer object. Dropping it queues the backing state for deferred release on the device
/// workqueue; the release happens inline once the device is gone.
pub struct GemObject {
    size: u64,
    binding: Option<(Arc<AddressSpace>, GttNode)>,
    token: Option<Token>,
    free_list: Weak<FreeList>,
    wq: Option<WorkqueueHandle>,
}

impl GemObject {
    pub(crate) fn new(
        size: u64,
        tracker: &ResourceTracker,
        free_list: Weak<FreeList>,
        wq: Option<WorkqueueHandle>,
    ) -> Result<Self> {
        if size == 0 || size % GTT_PAGE_SIZE != 0 {
            return Err(DeviceError::InvalidArgument(format!(
                "object size {size:#x} is not a non-zero multiple of the page size"
            )));
        }
        Ok(Self {
            size,
            binding: None,
            token: Some(tracker.acquire(ResourceKind::GemObject)),
            free_list,
            wq,
        })
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Bind the object into `vm`. Binding an already bound object returns the existing node.
    pub fn pin(&mut self, vm: &Arc<AddressSpace>) -> Result<GttNode> {
        if let Some((bound, node)) = &self.binding {
            if Arc::ptr_eq(bound, vm) {
                return Ok(*node);
            }
            return Err(DeviceError::Busy("gem object bound to another address space"));
        }
        let node = vm.insert(self.size)?;
        self.binding = Some((Arc::clone(vm), node));
        Ok(node)
    }

    pub fn unbind(&mut self) -> bool {
        match self.binding.take() {
            Some((vm, node)) => vm.remove(node),
            None => false,
        }
    }

    pub fn node(&self) -> Option<GttNode> {
        self.binding.as_ref().map(|(_, node)| *node)
    }
}

impl Drop for GemObject {
    fn drop(&mut self) {
        let inner = ObjectInner {
            binding: self.binding.take(),
            _token: self.token.take(),
        };
        let Some(free_list) = self.free_list.upgrade() else {
            return;
        };
        free_list.push(inner);

        let queued = self.wq.as_ref().map(|wq| {
            let free_list = Arc::clone(&free_list);
            wq.queue(move || {
                free_list.free_all();
            })
        });
        if !matches!(queued, Some(Ok(()))) {
            free_list.free_all();
        }
    }
}

impl std::fmt::Debug for GemObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GemObject")
            .field("size", &self.size())
            .field("node", &self.node())
            .finish()
    }
}
