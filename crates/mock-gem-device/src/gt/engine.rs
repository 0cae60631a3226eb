//! Emulated compute engine.
//!
//! A request's payload runs on the command scheduler. Once it has run, the request lands on the
//! emulated hardware queue and completes after its delay, or immediately when the engine is
//! flushed. Requests stay on the engine timeline until they are retired.

use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use gem_sched::{Fence, FenceError, Job, SchedHandle};

use crate::device_info::EngineMask;
use crate::tracker::{ResourceKind, ResourceTracker, Token};
use crate::{DeviceError, Result};

pub const NUM_ENGINES: usize = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EngineId {
    Rcs0,
}

impl EngineId {
    pub const ALL: [EngineId; NUM_ENGINES] = [EngineId::Rcs0];

    pub fn index(self) -> usize {
        match self {
            EngineId::Rcs0 => 0,
        }
    }

    pub fn mask(self) -> EngineMask {
        match self {
            EngineId::Rcs0 => EngineMask::RCS0,
        }
    }

    /// Name under which the engine is exposed to users.
    pub fn uabi_name(self) -> &'static str {
        match self {
            EngineId::Rcs0 => "rcs0",
        }
    }
}

/// Work submitted to an engine.
#[derive(Default)]
pub struct Request {
    delay: Duration,
    payload: Option<Job>,
}

impl Request {
    pub fn new() -> Self {
        Self::default()
    }

    /// Emulated execution time on the hardware queue.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_payload(mut self, payload: impl FnOnce() + Send + 'static) -> Self {
        self.payload = Some(Box::new(payload));
        self
    }
}

impl std::fmt::Debug for Request {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Request")
            .field("delay", &self.delay)
            .field("payload", &self.payload.is_some())
            .finish()
    }
}

struct HwRequest {
    fence: Arc<Fence>,
    /// `None` never completes on its own, only by flushing.
    deadline: Option<Instant>,
}

struct EngineShared {
    name: String,
    next_seqno: AtomicU64,
    timeline: Mutex<VecDeque<Arc<Fence>>>,
    hw: Mutex<VecDeque<HwRequest>>,
}

impl EngineShared {
    fn timeline(&self) -> MutexGuard<'_, VecDeque<Arc<Fence>>> {
        match self.timeline.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn hw(&self) -> MutexGuard<'_, VecDeque<HwRequest>> {
        match self.hw.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn hw_submit(&self, fence: Arc<Fence>, delay: Duration) {
        // Cancelled while waiting on the scheduler.
        if fence.is_signaled() {
            return;
        }
        if delay.is_zero() {
            fence.signal();
            return;
        }
        self.hw().push_back(HwRequest {
            fence,
            deadline: Instant::now().checked_add(delay),
        });
    }

    /// Complete requests whose deadline has passed, in submission order.
    fn advance(&self, now: Instant) {
        let mut hw = self.hw();
        while hw
            .front()
            .is_some_and(|rq| rq.deadline.is_some_and(|deadline| deadline <= now))
        {
            if let Some(rq) = hw.pop_front() {
                rq.fence.signal();
            }
        }
    }

    fn flush(&self) -> usize {
        let drained: Vec<HwRequest> = self.hw().drain(..).collect();
        for rq in &drained {
            rq.fence.signal();
        }
        drained.len()
    }
}

pub struct MockEngine {
    id: EngineId,
    shared: Arc<EngineShared>,
    sched: Option<SchedHandle>,
    _token: Token,
}

impl MockEngine {
    pub fn new(name: &str, id: EngineId, tracker: &ResourceTracker) -> Self {
        tracing::debug!(engine = name, ?id, "mock engine constructed");
        Self {
            id,
            shared: Arc::new(EngineShared {
                name: name.to_owned(),
                next_seqno: AtomicU64::new(0),
                timeline: Mutex::new(VecDeque::new()),
                hw: Mutex::new(VecDeque::new()),
            }),
            sched: None,
            _token: tracker.acquire(ResourceKind::Engine),
        }
    }

    /// Bind the engine to the scheduler that executes request payloads.
    pub fn init(&mut self, sched: SchedHandle) -> Result<()> {
        if !sched.is_alive() {
            return Err(DeviceError::Init {
                component: "engine",
                status: -crate::error::errno::ENODEV,
            });
        }
        self.sched = Some(sched);
        tracing::debug!(engine = %self.shared.name, "mock engine initialised");
        Ok(())
    }

    pub fn id(&self) -> EngineId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn is_initialised(&self) -> bool {
        self.sched.is_some()
    }

    pub fn submit(&self, request: Request) -> Result<Arc<Fence>> {
        let sched = self.sched.as_ref().ok_or_else(|| {
            DeviceError::InvalidArgument(format!("engine {} is not initialised", self.name()))
        })?;

        let seqno = self.shared.next_seqno.fetch_add(1, Ordering::Relaxed) + 1;
        let fence = Arc::new(Fence::new(seqno));
        self.shared.timeline().push_back(Arc::clone(&fence));

        let Request { delay, payload } = request;
        let shared = Arc::clone(&self.shared);
        let hw_fence = Arc::clone(&fence);
        let submitted = sched.submit(move || {
            if hw_fence.is_signaled() {
                return;
            }
            if let Some(payload) = payload {
                if panic::catch_unwind(AssertUnwindSafe(payload)).is_err() {
                    tracing::warn!(engine = %shared.name, seqno, "request payload panicked");
                    hw_fence.signal_error(FenceError::Aborted);
                    return;
                }
            }
            shared.hw_submit(hw_fence, delay);
        });

        if let Err(err) = submitted {
            self.shared
                .timeline()
                .retain(|f| !Arc::ptr_eq(f, &fence));
            return Err(err.into());
        }
        Ok(fence)
    }

    /// Complete everything currently on the hardware queue. Returns how many completed.
    pub fn flush(&self) -> usize {
        self.shared.flush()
    }

    /// Drop completed requests from the timeline. Returns the number still outstanding.
    pub fn retire(&self) -> usize {
        self.shared.advance(Instant::now());
        let mut timeline = self.shared.timeline();
        timeline.retain(|f| !f.is_signaled());
        timeline.len()
    }

    pub fn outstanding(&self) -> usize {
        self.shared
            .timeline()
            .iter()
            .filter(|f| !f.is_signaled())
            .count()
    }

    /// Fail every outstanding request with `err`. Returns how many were cancelled.
    pub fn cancel(&self, err: FenceError) -> usize {
        self.shared.hw().clear();
        self.shared
            .timeline()
            .iter()
            .filter(|f| f.signal_error(err))
            .count()
    }
}

impl std::fmt::Debug for MockEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockEngine")
            .field("id", &self.id)
            .field("name", &self.shared.name)
            .field("initialised", &self.is_initialised())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gem_sched::{CpuMask, SchedEngine, Workqueue, WorkqueueFlags};
    use std::sync::atomic::AtomicBool;

    fn setup() -> (ResourceTracker, Workqueue, SchedEngine) {
        let tracker = ResourceTracker::new();
        let wq = Workqueue::alloc("engine-test", WorkqueueFlags::UNBOUND, 2).unwrap();
        let sched = SchedEngine::create_cpu(3, &wq, CpuMask::all()).unwrap();
        (tracker, wq, sched)
    }

    #[test]
    fn submit_requires_init() {
        let tracker = ResourceTracker::new();
        let engine = MockEngine::new("mock", EngineId::Rcs0, &tracker);
        assert!(engine.submit(Request::new()).is_err());
        assert_eq!(engine.outstanding(), 0);
    }

    #[test]
    fn zero_delay_request_completes_after_payload() {
        let (tracker, _wq, sched) = setup();
        let mut engine = MockEngine::new("mock", EngineId::Rcs0, &tracker);
        engine.init(sched.handle()).unwrap();

        let ran = Arc::new(AtomicBool::new(false));
        let fence = {
            let ran = Arc::clone(&ran);
            engine
                .submit(Request::new().with_payload(move || ran.store(true, Ordering::SeqCst)))
                .unwrap()
        };

        assert!(fence.wait_timeout(Duration::from_secs(5)));
        assert!(ran.load(Ordering::SeqCst));
        assert_eq!(engine.retire(), 0);
    }

    #[test]
    fn flush_completes_delayed_requests() {
        let (tracker, _wq, sched) = setup();
        let mut engine = MockEngine::new("mock", EngineId::Rcs0, &tracker);
        engine.init(sched.handle()).unwrap();

        let fence = engine
            .submit(Request::new().with_delay(Duration::from_secs(3600)))
            .unwrap();
        sched.wait_idle();
        assert!(!fence.is_signaled());
        assert_eq!(engine.retire(), 1);

        assert_eq!(engine.flush(), 1);
        assert!(fence.is_signaled());
        assert_eq!(fence.error(), None);
        assert_eq!(engine.retire(), 0);
    }

    #[test]
    fn unbounded_delay_completes_only_on_flush() {
        let (tracker, _wq, sched) = setup();
        let mut engine = MockEngine::new("mock", EngineId::Rcs0, &tracker);
        engine.init(sched.handle()).unwrap();

        let fence = engine
            .submit(Request::new().with_delay(Duration::MAX))
            .unwrap();
        sched.wait_idle();
        assert_eq!(engine.retire(), 1);

        assert_eq!(engine.flush(), 1);
        assert_eq!(engine.retire(), 0);
        assert_eq!(fence.error(), None);
    }

    #[test]
    fn panicking_payload_aborts_its_request() {
        let (tracker, _wq, sched) = setup();
        let mut engine = MockEngine::new("mock", EngineId::Rcs0, &tracker);
        engine.init(sched.handle()).unwrap();

        let failed = engine
            .submit(Request::new().with_payload(|| panic!("payload failed")))
            .unwrap();
        let next = engine.submit(Request::new()).unwrap();

        assert!(failed.wait_timeout(Duration::from_secs(5)));
        assert_eq!(failed.error(), Some(FenceError::Aborted));
        assert!(next.wait_timeout(Duration::from_secs(5)));
        assert_eq!(next.error(), None);
        assert_eq!(engine.retire(), 0);
    }

    #[test]
    fn cancel_fails_outstanding_fences() {
        let (tracker, _wq, sched) = setup();
        let mut engine = MockEngine::new("mock", EngineId::Rcs0, &tracker);
        engine.init(sched.handle()).unwrap();

        let fence = engine
            .submit(Request::new().with_delay(Duration::from_secs(3600)))
            .unwrap();
        sched.wait_idle();

        assert_eq!(engine.cancel(FenceError::Wedged), 1);
        assert_eq!(fence.error(), Some(FenceError::Wedged));
        assert_eq!(engine.flush(), 0);
        assert_eq!(engine.retire(), 0);
    }

    #[test]
    fn submit_after_scheduler_release_is_rejected() {
        let (tracker, _wq, sched) = setup();
        let mut engine = MockEngine::new("mock", EngineId::Rcs0, &tracker);
        engine.init(sched.handle()).unwrap();
        drop(sched);

        assert!(matches!(
            engine.submit(Request::new()),
            Err(DeviceError::Sched(_))
        ));
        assert_eq!(engine.outstanding(), 0);
    }

    #[test]
    fn uabi_names() {
        assert_eq!(EngineId::Rcs0.uabi_name(), "rcs0");
        assert_eq!(EngineId::Rcs0.mask(), EngineMask::RCS0);
        assert_eq!(EngineId::Rcs0.index(), 0);
    }
}
