//! The root graphics tile of the mock device.

mod engine;
mod ggtt;

pub use engine::{EngineId, MockEngine, Request, NUM_ENGINES};
pub use ggtt::{AddressSpace, Ggtt, GttNode, GTT_PAGE_SIZE, MOCK_GGTT_PAGES};

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bitflags::bitflags;
use gem_sched::{FenceError, SchedEngine};

use crate::device_info::EngineMask;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct GtResetFlags: u32 {
        const WEDGED = 1 << 0;
    }
}

#[derive(Debug)]
pub struct Gt {
    name: &'static str,
    mock: bool,
    /// Power transitions never happen on the mock tile.
    wakeref_disabled: bool,
    reset: AtomicU32,
    engine_mask: EngineMask,
    engines: [Option<MockEngine>; NUM_ENGINES],
    ggtt: Option<Ggtt>,
    vm: Option<Arc<AddressSpace>>,
}

impl Default for Gt {
    fn default() -> Self {
        Self::new()
    }
}

impl Gt {
    /// Early init: no engines, no translation table, wedged until engines register.
    pub fn new() -> Self {
        Self {
            name: "",
            mock: false,
            wakeref_disabled: false,
            reset: AtomicU32::new(GtResetFlags::WEDGED.bits()),
            engine_mask: EngineMask::empty(),
            engines: Default::default(),
            ggtt: None,
            vm: None,
        }
    }

    pub(crate) fn init_early_mock(&mut self) {
        self.mock = true;
    }

    pub(crate) fn probe_mock(&mut self) {
        self.wakeref_disabled = true;
        self.name = "Mock GT";
    }

    pub fn name(&self) -> &str {
        self.name
    }

    pub fn is_mock(&self) -> bool {
        self.mock
    }

    pub fn wakeref_disabled(&self) -> bool {
        self.wakeref_disabled
    }

    pub fn reset_flags(&self) -> GtResetFlags {
        GtResetFlags::from_bits_retain(self.reset.load(Ordering::Acquire))
    }

    pub fn is_wedged(&self) -> bool {
        self.reset_flags().contains(GtResetFlags::WEDGED)
    }

    pub(crate) fn clear_wedged(&self) {
        self.reset
            .fetch_and(!GtResetFlags::WEDGED.bits(), Ordering::AcqRel);
    }

    /// Mark the tile wedged and fail everything still outstanding. Returns the number of requests
    /// that were cancelled.
    pub fn set_wedged(&self, sched: Option<&SchedEngine>) -> usize {
        let was = self.reset.fetch_or(GtResetFlags::WEDGED.bits(), Ordering::AcqRel);
        if was & GtResetFlags::WEDGED.bits() == 0 {
            tracing::warn!(gt = self.name, "wedging gt");
        }
        if let Some(sched) = sched {
            sched.cancel_pending();
        }
        self.engines()
            .map(|engine| engine.cancel(FenceError::Wedged))
            .sum()
    }

    pub fn engine_mask(&self) -> EngineMask {
        self.engine_mask
    }

    pub(crate) fn set_engine_mask(&mut self, mask: EngineMask) {
        self.engine_mask = mask;
    }

    pub(crate) fn bind_ggtt(&mut self, ggtt: Ggtt) {
        self.vm = Some(ggtt.vm());
        self.ggtt = Some(ggtt);
    }

    pub fn ggtt(&self) -> Option<&Ggtt> {
        self.ggtt.as_ref()
    }

    pub fn vm(&self) -> Option<&Arc<AddressSpace>> {
        self.vm.as_ref()
    }

    /// Drop the tile's address-space reference and finalise the translation table.
    pub(crate) fn fini_ggtt(&mut self) {
        self.vm = None;
        if let Some(ggtt) = self.ggtt.take() {
            ggtt.fini();
        }
    }

    pub(crate) fn install_engine(&mut self, engine: MockEngine) {
        let slot = engine.id().index();
        self.engines[slot] = Some(engine);
    }

    pub(crate) fn engine_slot_mut(&mut self, id: EngineId) -> Option<&mut MockEngine> {
        self.engines[id.index()].as_mut()
    }

    pub fn engine(&self, id: EngineId) -> Option<&MockEngine> {
        self.engines[id.index()].as_ref()
    }

    pub fn engines(&self) -> impl Iterator<Item = &MockEngine> {
        self.engines.iter().flatten()
    }

    pub fn flush_engines(&self) -> usize {
        self.engines().map(MockEngine::flush).sum()
    }

    /// Wait up to `remaining` for the scheduler to go idle, then retire completed requests.
    /// `remaining` is reduced by the time spent waiting. Returns the number of requests still
    /// outstanding.
    pub fn retire_requests_timeout(&self, sched: &SchedEngine, remaining: &mut Duration) -> usize {
        let start = Instant::now();
        let busy = sched.wait_idle_timeout(*remaining);
        *remaining = remaining.saturating_sub(start.elapsed());

        let outstanding: usize = self.engines().map(MockEngine::retire).sum();
        outstanding.max(busy)
    }

    /// Remove every engine from the tile.
    pub(crate) fn driver_remove(&mut self) {
        for engine in self.engines.iter_mut().filter_map(Option::take) {
            tracing::debug!(engine = engine.name(), "engine removed");
        }
    }

    /// Forget everything set up after early init that has not been released yet.
    pub(crate) fn driver_late_release_all(&mut self) {
        self.driver_remove();
        self.fini_ggtt();
        self.engine_mask = EngineMask::empty();
        self.reset
            .fetch_or(GtResetFlags::WEDGED.bits(), Ordering::AcqRel);
    }
}
