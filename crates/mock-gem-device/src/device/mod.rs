//! The mock GEM device aggregate.
//!
//! [`MockGemDevice::create`] acquires the device's collaborators in dependency order and either
//! returns a fully constructed device or releases exactly what it had acquired. Dropping the
//! device (or calling [`MockGemDevice::destroy`]) drains outstanding work and then releases
//! everything in reverse order.

mod probe;
mod release;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use gem_sched::{Fence, SchedEngine, Workqueue};

use crate::debugger::Debugger;
use crate::device_info::{DeviceInfo, RuntimeInfo};
use crate::devres::DevresGroup;
use crate::gem::{GemMm, GemObject, MockContext};
use crate::gt::{AddressSpace, EngineId, Gt, MockEngine, Request};
use crate::mode_config::ModeConfig;
use crate::pci::PciDevRef;
use crate::regions::{MemoryRegions, MockRegion, MockRegionInstances};
use crate::tracker::{ResourceTracker, Tracked};
use crate::uncore::MockUncore;
use crate::{DeviceError, Params, ProbeStep, Result};

/// Name the device is bound under.
pub const DRIVER_NAME: &str = "mock";

/// A best-effort construction step that failed without aborting construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    pub step: ProbeStep,
    pub errno: i32,
    pub message: String,
}

impl Diagnostic {
    fn new(step: ProbeStep, err: &DeviceError) -> Self {
        Self {
            step,
            errno: err.errno(),
            message: err.to_string(),
        }
    }
}

pub struct MockGemDevice {
    /// Set once construction completes; gates the full teardown.
    do_release: bool,
    tracker: ResourceTracker,
    flush_timeout: Duration,
    info: DeviceInfo,
    runtime_info: RuntimeInfo,
    diagnostics: Vec<Diagnostic>,

    params: Option<Tracked<Params>>,
    mode_config: Option<ModeConfig>,
    uncore: Option<MockUncore>,
    gt: Gt,
    regions: MemoryRegions,
    mm: GemMm,
    wq: Option<Tracked<Workqueue>>,
    sched: Option<Tracked<SchedEngine>>,
    uabi_engines: BTreeMap<&'static str, EngineId>,
    mock_regions: MockRegionInstances,
    debugger: Option<Debugger>,

    group: Option<DevresGroup>,
    pdev: Option<PciDevRef>,
}

impl MockGemDevice {
    pub fn tracker(&self) -> &ResourceTracker {
        &self.tracker
    }

    /// Whether the device reached the fully constructed state.
    pub fn is_release_ready(&self) -> bool {
        self.do_release
    }

    pub fn pci_dev(&self) -> Option<&PciDevRef> {
        self.pdev.as_ref()
    }

    /// The device's private parameter copy.
    pub fn params(&self) -> Option<&Params> {
        self.params.as_deref()
    }

    pub fn info(&self) -> &DeviceInfo {
        &self.info
    }

    pub fn runtime_info(&self) -> &RuntimeInfo {
        &self.runtime_info
    }

    pub fn diagnostics(&self) -> &[Diagnostic] {
        &self.diagnostics
    }

    pub fn flush_timeout(&self) -> Duration {
        self.flush_timeout
    }

    pub fn mode_config(&self) -> Option<&ModeConfig> {
        self.mode_config.as_ref()
    }

    pub fn uncore(&self) -> Option<&MockUncore> {
        self.uncore.as_ref()
    }

    pub fn gt(&self) -> &Gt {
        &self.gt
    }

    pub fn regions(&self) -> &MemoryRegions {
        &self.regions
    }

    pub fn mm(&self) -> &GemMm {
        &self.mm
    }

    pub fn wq(&self) -> Option<&Workqueue> {
        self.wq.as_deref()
    }

    pub fn sched(&self) -> Option<&SchedEngine> {
        self.sched.as_deref()
    }

    pub fn debugger(&self) -> Option<&Debugger> {
        self.debugger.as_ref()
    }

    /// Take a reference to the root tile's address space.
    pub fn vm(&self) -> Option<Arc<AddressSpace>> {
        self.gt.vm().cloned()
    }

    pub fn engine(&self, id: EngineId) -> Result<&MockEngine> {
        self.gt.engine(id).ok_or(DeviceError::NoSuchEngine(id))
    }

    /// Look an engine up by its user-visible name.
    pub fn engine_by_name(&self, name: &str) -> Option<&MockEngine> {
        self.uabi_engines
            .get(name)
            .and_then(|&id| self.gt.engine(id))
    }

    pub fn uabi_engine_names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.uabi_engines.keys().copied()
    }

    pub fn submit(&self, id: EngineId, request: Request) -> Result<Arc<Fence>> {
        if self.gt.is_wedged() {
            return Err(DeviceError::Wedged);
        }
        self.engine(id)?.submit(request)
    }

    pub fn create_object(&self, size: u64) -> Result<GemObject> {
        self.mm.create_object(size, &self.tracker)
    }

    pub fn create_context(&self, name: &str) -> Arc<MockContext> {
        self.mm.contexts().create(name, &self.tracker)
    }

    pub fn create_mock_region(&self, size: u64) -> Result<MockRegion> {
        self.mock_regions.create(size, &self.tracker)
    }
}

impl std::fmt::Debug for MockGemDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockGemDevice")
            .field("pdev", &self.pdev)
            .field("do_release", &self.do_release)
            .field("gt", &self.gt.name())
            .field("wedged", &self.gt.is_wedged())
            .field("engines", &self.uabi_engines)
            .field("diagnostics", &self.diagnostics)
            .finish_non_exhaustive()
    }
}
