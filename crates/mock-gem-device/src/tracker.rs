//! Resource accounting for the mock device.
//!
//! Every collaborator handle owns a [`Token`] minted by a shared [`ResourceTracker`] when the
//! resource is acquired. Dropping the token records the release, so a resource can only ever be
//! released once and the tracker always knows which resources are still live.
//!
//! Tests use the recorded [`TrackerEvent`] stream to check unwind ordering, drain-before-free and
//! leak freedom.

use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ResourceKind {
    Identity,
    DevresGroup,
    Device,
    Params,
    ModeConfig,
    Uncore,
    MemoryRegions,
    Workqueue,
    Scheduler,
    Ggtt,
    AddressSpace,
    Engine,
    Debugger,
    GemObject,
    Context,
    MockRegion,
}

/// The steps of a full device teardown, in the order they run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TeardownStep {
    DebuggerFini,
    Drain,
    RemoveEngines,
    DrainFreedObjects,
    FiniGgtt,
    ReleaseScheduler,
    LateRelease,
    DestroyWorkqueue,
    ModeConfigCleanup,
    UncoreUninit,
    ReleaseIdentity,
    FreeParams,
}

impl TeardownStep {
    pub const ALL: [TeardownStep; 12] = [
        TeardownStep::DebuggerFini,
        TeardownStep::Drain,
        TeardownStep::RemoveEngines,
        TeardownStep::DrainFreedObjects,
        TeardownStep::FiniGgtt,
        TeardownStep::ReleaseScheduler,
        TeardownStep::LateRelease,
        TeardownStep::DestroyWorkqueue,
        TeardownStep::ModeConfigCleanup,
        TeardownStep::UncoreUninit,
        TeardownStep::ReleaseIdentity,
        TeardownStep::FreeParams,
    ];
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackerEvent {
    Acquired(ResourceKind),
    Released(ResourceKind),
    Teardown(TeardownStep),
    Drained { outstanding: usize },
}

#[derive(Debug, Default)]
struct TrackerState {
    events: Vec<TrackerEvent>,
    live: Vec<ResourceKind>,
}

/// Shared, thread-safe resource ledger. Clones observe the same state.
#[derive(Debug, Clone, Default)]
pub struct ResourceTracker {
    state: Arc<Mutex<TrackerState>>,
}

impl ResourceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, TrackerState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Record an acquisition and return the token that releases it.
    pub fn acquire(&self, kind: ResourceKind) -> Token {
        let mut state = self.lock();
        state.events.push(TrackerEvent::Acquired(kind));
        state.live.push(kind);
        tracing::trace!(?kind, "acquired");
        Token {
            kind,
            tracker: self.clone(),
        }
    }

    fn release(&self, kind: ResourceKind) {
        let mut state = self.lock();
        if let Some(pos) = state.live.iter().rposition(|&k| k == kind) {
            state.live.remove(pos);
        }
        state.events.push(TrackerEvent::Released(kind));
        tracing::trace!(?kind, "released");
    }

    pub(crate) fn teardown_step(&self, step: TeardownStep) {
        tracing::debug!(?step, "teardown");
        self.lock().events.push(TrackerEvent::Teardown(step));
    }

    pub(crate) fn drained(&self, outstanding: usize) {
        self.lock()
            .events
            .push(TrackerEvent::Drained { outstanding });
    }

    pub fn events(&self) -> Vec<TrackerEvent> {
        self.lock().events.clone()
    }

    /// Resources acquired and not yet released, in acquisition order.
    pub fn live(&self) -> Vec<ResourceKind> {
        self.lock().live.clone()
    }

    pub fn is_live(&self, kind: ResourceKind) -> bool {
        self.lock().live.contains(&kind)
    }

    pub fn acquired(&self, kind: ResourceKind) -> usize {
        self.count(TrackerEvent::Acquired(kind))
    }

    pub fn released(&self, kind: ResourceKind) -> usize {
        self.count(TrackerEvent::Released(kind))
    }

    fn count(&self, event: TrackerEvent) -> usize {
        self.lock().events.iter().filter(|&&e| e == event).count()
    }

    /// Every acquisition, in order.
    pub fn acquisitions(&self) -> Vec<ResourceKind> {
        self.lock()
            .events
            .iter()
            .filter_map(|e| match e {
                TrackerEvent::Acquired(kind) => Some(*kind),
                _ => None,
            })
            .collect()
    }

    /// Every release, in order.
    pub fn releases(&self) -> Vec<ResourceKind> {
        self.lock()
            .events
            .iter()
            .filter_map(|e| match e {
                TrackerEvent::Released(kind) => Some(*kind),
                _ => None,
            })
            .collect()
    }

    pub fn teardown_steps(&self) -> Vec<TeardownStep> {
        self.lock()
            .events
            .iter()
            .filter_map(|e| match e {
                TrackerEvent::Teardown(step) => Some(*step),
                _ => None,
            })
            .collect()
    }

    pub fn clear_events(&self) {
        self.lock().events.clear();
    }
}

/// Proof that a resource is held. Dropping it records the release.
#[derive(Debug)]
pub struct Token {
    kind: ResourceKind,
    tracker: ResourceTracker,
}

impl Token {
    pub fn kind(&self) -> ResourceKind {
        self.kind
    }
}

impl Drop for Token {
    fn drop(&mut self) {
        self.tracker.release(self.kind);
    }
}

/// A foreign handle paired with its token. The value is dropped before the release is recorded.
#[derive(Debug)]
pub struct Tracked<T> {
    value: T,
    _token: Token,
}

impl<T> Tracked<T> {
    pub fn new(value: T, token: Token) -> Self {
        Self {
            value,
            _token: token,
        }
    }
}

impl<T> Deref for Tracked<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.value
    }
}

impl<T> DerefMut for Tracked<T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.value
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn token_drop_records_release() {
        let tracker = ResourceTracker::new();
        let token = tracker.acquire(ResourceKind::Uncore);
        assert!(tracker.is_live(ResourceKind::Uncore));
        drop(token);

        assert!(tracker.live().is_empty());
        assert_eq!(
            tracker.events(),
            vec![
                TrackerEvent::Acquired(ResourceKind::Uncore),
                TrackerEvent::Released(ResourceKind::Uncore),
            ]
        );
    }

    #[test]
    fn tracked_value_drops_before_release_is_recorded() {
        struct Probe(ResourceTracker);
        impl Drop for Probe {
            fn drop(&mut self) {
                assert!(self.0.is_live(ResourceKind::Workqueue));
            }
        }

        let tracker = ResourceTracker::new();
        let tracked = Tracked::new(
            Probe(tracker.clone()),
            tracker.acquire(ResourceKind::Workqueue),
        );
        drop(tracked);
        assert_eq!(tracker.released(ResourceKind::Workqueue), 1);
    }

    #[test]
    fn counts_multiple_instances() {
        let tracker = ResourceTracker::new();
        let a = tracker.acquire(ResourceKind::GemObject);
        let b = tracker.acquire(ResourceKind::GemObject);
        drop(a);
        assert_eq!(tracker.acquired(ResourceKind::GemObject), 2);
        assert_eq!(tracker.released(ResourceKind::GemObject), 1);
        assert_eq!(tracker.live(), vec![ResourceKind::GemObject]);
        drop(b);
        assert!(tracker.live().is_empty());
    }
}
