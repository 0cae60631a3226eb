//! Grouped device-managed resources.
//!
//! A [`DevresGroup`] is opened against a device and collects release actions. Releasing the group
//! (explicitly or by dropping it) runs them newest first.

use std::sync::{Mutex, MutexGuard};

use crate::pci::PciDevRef;
use crate::tracker::{ResourceKind, ResourceTracker, Token};

type Action = Box<dyn FnOnce() + Send>;

struct Entry {
    name: &'static str,
    action: Action,
}

pub struct DevresGroup {
    entries: Mutex<Vec<Entry>>,
    _token: Token,
    dev: PciDevRef,
}

impl DevresGroup {
    pub fn open(dev: &PciDevRef, tracker: &ResourceTracker) -> Self {
        tracing::debug!(dev = dev.name(), "devres group opened");
        Self {
            entries: Mutex::new(Vec::new()),
            _token: tracker.acquire(ResourceKind::DevresGroup),
            dev: PciDevRef::clone(dev),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Entry>> {
        match self.entries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Register a release action.
    pub fn add(&self, name: &'static str, action: impl FnOnce() + Send + 'static) {
        self.lock().push(Entry {
            name,
            action: Box::new(action),
        });
    }

    /// Tie the lifetime of a tracker token to the group.
    pub fn add_token(&self, name: &'static str, token: Token) {
        self.add(name, move || drop(token));
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn release(self) {
        drop(self);
    }

    fn release_entries(&self) {
        let entries = std::mem::take(&mut *self.lock());
        for Entry { name, action } in entries.into_iter().rev() {
            tracing::trace!(name, "devres release");
            action();
        }
    }
}

impl Drop for DevresGroup {
    fn drop(&mut self) {
        self.release_entries();
        tracing::debug!(dev = self.dev.name(), "devres group released");
    }
}

impl std::fmt::Debug for DevresGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DevresGroup")
            .field("dev", &self.dev.name())
            .field("entries", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pci::{IommuMode, PciDev};
    use pretty_assertions::assert_eq;
    use std::sync::Arc;

    #[test]
    fn release_runs_actions_newest_first() {
        let tracker = ResourceTracker::new();
        let dev = PciDev::allocate("mock", 64, IommuMode::Identity, &tracker, Box::new(|_| {}))
            .unwrap();
        let group = DevresGroup::open(&dev, &tracker);
        let order = Arc::new(Mutex::new(Vec::new()));

        for name in ["first", "second", "third"] {
            let order = Arc::clone(&order);
            group.add(name, move || order.lock().unwrap().push(name));
        }
        assert_eq!(group.len(), 3);
        group.release();

        assert_eq!(*order.lock().unwrap(), vec!["third", "second", "first"]);
        assert!(!tracker.is_live(ResourceKind::DevresGroup));
    }

    #[test]
    fn tokens_are_released_with_the_group() {
        let tracker = ResourceTracker::new();
        let dev = PciDev::allocate("mock", 64, IommuMode::Identity, &tracker, Box::new(|_| {}))
            .unwrap();
        let group = DevresGroup::open(&dev, &tracker);
        group.add_token("device", tracker.acquire(ResourceKind::Device));
        drop(group);

        assert_eq!(
            tracker.releases(),
            vec![ResourceKind::Device, ResourceKind::DevresGroup]
        );
        drop(dev);
        assert!(tracker.live().is_empty());
    }
}
