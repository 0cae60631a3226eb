use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use gem_sched::{CpuMask, SchedEngine, Workqueue, WorkqueueFlags};

use super::{Diagnostic, MockGemDevice, DRIVER_NAME};
use crate::debugger::Debugger;
use crate::device_info::{DeviceInfo, EngineMask, RegionMask, RuntimeInfo};
use crate::devres::DevresGroup;
use crate::gem::GemMm;
use crate::gt::{EngineId, Ggtt, Gt, MockEngine};
use crate::inject::inject_probe_point;
use crate::mode_config::ModeConfig;
use crate::pci::{IommuMode, PciDev, PciDevRef, PmDomain};
use crate::regions::{MemoryRegions, MockRegionInstances};
use crate::tracker::{ResourceKind, ResourceTracker, Tracked};
use crate::uncore::MockUncore;
use crate::{MockDeviceConfig, ProbeStep, Result};

/// Acquisitions after the device aggregate exists, in the order construction performs them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(super) enum Stage {
    ModeConfig,
    Uncore,
    MemoryRegions,
    Workqueue,
    Scheduler,
    Ggtt,
    Engine,
}

/// Stages acquired so far. Only ever a prefix of the construction order.
#[derive(Debug, Default)]
struct UnwindLedger {
    stages: Vec<Stage>,
}

impl UnwindLedger {
    fn push(&mut self, stage: Stage) {
        debug_assert!(
            self.stages.last().map_or(true, |&last| last < stage),
            "{stage:?} acquired out of order"
        );
        self.stages.push(stage);
    }

    fn unwind(self, dev: &mut MockGemDevice) {
        for stage in self.stages.into_iter().rev() {
            tracing::debug!(?stage, "unwinding");
            dev.release_stage(stage);
        }
    }
}

fn release_dev(dev: &PciDev) {
    tracing::debug!(dev = dev.name(), address = %dev.address(), "pci device released");
}

impl MockGemDevice {
    /// Build a device with a tracker of its own.
    pub fn create(config: MockDeviceConfig) -> Result<Self> {
        Self::create_with_tracker(config, ResourceTracker::new())
    }

    /// Build a device whose acquisitions and releases are recorded on `tracker`.
    pub fn create_with_tracker(config: MockDeviceConfig, tracker: ResourceTracker) -> Result<Self> {
        let step = config.params.inject_probe_failure;
        Self::probe(config, tracker).map_err(|err| {
            tracing::error!(%err, errno = err.errno(), injected = ?step, "failed to create mock gem device");
            err
        })
    }

    fn probe(config: MockDeviceConfig, tracker: ResourceTracker) -> Result<Self> {
        let MockDeviceConfig {
            name,
            dma_mask_bits,
            iommu_identity_map,
            sched_width,
            sched_affinity,
            flush_timeout,
            smem_size,
            params,
        } = config;
        let plan = params.inject_probe_failure;

        inject_probe_point(plan, ProbeStep::AllocIdentity)?;
        let iommu = if iommu_identity_map {
            IommuMode::Identity
        } else {
            IommuMode::Translated
        };
        let pdev = PciDev::allocate(&name, dma_mask_bits, iommu, &tracker, Box::new(release_dev))?;

        inject_probe_point(plan, ProbeStep::OpenDevresGroup)?;
        let group = DevresGroup::open(&pdev, &tracker);

        inject_probe_point(plan, ProbeStep::AllocDevice)?;
        // Past this point an early return drops `dev` before it is release-ready, which only
        // releases the grouped scope, the identity and the parameter copy.
        let mut dev = Self::alloc(pdev, group, tracker, flush_timeout);

        dev.init_runtime_pm(plan);

        let token = dev.tracker.acquire(ResourceKind::Params);
        dev.params = Some(Tracked::new(params, token));

        let mut ledger = UnwindLedger::default();
        if let Err(err) = dev.probe_stages(&mut ledger, sched_width, sched_affinity, smem_size) {
            ledger.unwind(&mut dev);
            return Err(err);
        }

        dev.do_release = true;
        dev.mock_regions = MockRegionInstances::new();
        dev.init_debugger(plan);

        tracing::info!(
            dev = %name,
            engines = ?dev.uabi_engines.keys().collect::<Vec<_>>(),
            diagnostics = dev.diagnostics.len(),
            "mock gem device created"
        );
        Ok(dev)
    }

    /// Allocate the aggregate, binding it to the identity through the grouped scope.
    fn alloc(
        pdev: PciDevRef,
        group: DevresGroup,
        tracker: ResourceTracker,
        flush_timeout: Duration,
    ) -> Self {
        group.add_token("mock gem device", tracker.acquire(ResourceKind::Device));

        pdev.set_drvdata(Some(DRIVER_NAME));
        let weak = Arc::downgrade(&pdev);
        group.add("drvdata", move || {
            if let Some(pdev) = weak.upgrade() {
                pdev.set_drvdata(None);
            }
        });

        Self {
            do_release: false,
            tracker,
            flush_timeout,
            info: DeviceInfo::default(),
            runtime_info: RuntimeInfo::default(),
            diagnostics: Vec::new(),
            params: None,
            mode_config: None,
            uncore: None,
            gt: Gt::new(),
            regions: MemoryRegions::default(),
            mm: GemMm::new(),
            wq: None,
            sched: None,
            uabi_engines: BTreeMap::new(),
            mock_regions: MockRegionInstances::new(),
            debugger: None,
            group: Some(group),
            pdev: Some(pdev),
        }
    }

    fn init_runtime_pm(&mut self, plan: Option<ProbeStep>) {
        let (Some(pdev), Some(group)) = (&self.pdev, &self.group) else {
            return;
        };

        pdev.set_pm_domain(Some(PmDomain::generic()));
        pdev.pm_runtime_enable();
        pdev.pm_runtime_dont_use_autosuspend();
        let weak = Arc::downgrade(pdev);
        group.add("pm_runtime_disable", move || {
            if let Some(pdev) = weak.upgrade() {
                pdev.pm_runtime_disable();
                pdev.set_pm_domain(None);
            }
        });

        if !pdev.pm_runtime_enabled() {
            return;
        }
        let synced = inject_probe_point(plan, ProbeStep::RuntimePmSync)
            .and_then(|()| pdev.pm_runtime_get_sync());
        if let Err(err) = synced {
            tracing::warn!(%err, "runtime pm sync failed, continuing");
            self.diagnostics
                .push(Diagnostic::new(ProbeStep::RuntimePmSync, &err));
        }
    }

    /// Everything between the parameter copy and the device becoming release-ready. Each
    /// acquisition is pushed on `ledger` as soon as it succeeds.
    fn probe_stages(
        &mut self,
        ledger: &mut UnwindLedger,
        sched_width: usize,
        sched_affinity: CpuMask,
        smem_size: u64,
    ) -> Result<()> {
        let plan = self
            .params
            .as_ref()
            .and_then(|params| params.inject_probe_failure);

        // Using the global GTT may ask questions about KMS users.
        self.mode_config = Some(ModeConfig::init(&self.tracker));
        ledger.push(Stage::ModeConfig);

        self.info.init_mock();
        self.runtime_info.init_mock();
        self.gt.init_early_mock();

        inject_probe_point(plan, ProbeStep::UncoreInit)?;
        self.uncore = Some(MockUncore::init(&self.tracker)?);
        ledger.push(Stage::Uncore);

        self.gt.probe_mock();
        self.info.memory_regions = RegionMask::SMEM;
        self.regions
            .hw_probe(self.info.memory_regions, smem_size, &self.tracker);
        ledger.push(Stage::MemoryRegions);

        self.mm = GemMm::new();

        inject_probe_point(plan, ProbeStep::AllocWorkqueue)?;
        let wq = Workqueue::alloc(DRIVER_NAME, WorkqueueFlags::UNBOUND, 0)?;
        let token = self.tracker.acquire(ResourceKind::Workqueue);
        let wq = self.wq.insert(Tracked::new(wq, token));
        ledger.push(Stage::Workqueue);

        inject_probe_point(plan, ProbeStep::CreateScheduler)?;
        let sched = SchedEngine::create_cpu(sched_width, wq, sched_affinity)?;
        let token = self.tracker.acquire(ResourceKind::Scheduler);
        let sched = self.sched.insert(Tracked::new(sched, token));
        ledger.push(Stage::Scheduler);

        let sched = sched.handle();
        self.mm.bind(wq.handle(), sched.clone());

        inject_probe_point(plan, ProbeStep::AllocGgtt)?;
        self.gt.bind_ggtt(Ggtt::init(&self.tracker));
        ledger.push(Stage::Ggtt);

        self.info.platform_engine_mask = EngineMask::RCS0;
        self.gt.set_engine_mask(EngineMask::RCS0);

        inject_probe_point(plan, ProbeStep::ConstructEngine)?;
        self.gt
            .install_engine(MockEngine::new(DRIVER_NAME, EngineId::Rcs0, &self.tracker));
        ledger.push(Stage::Engine);

        inject_probe_point(plan, ProbeStep::InitEngine)?;
        if let Some(engine) = self.gt.engine_slot_mut(EngineId::Rcs0) {
            engine.init(sched)?;
        }

        self.gt.clear_wedged();
        self.register_engines();
        Ok(())
    }

    /// Expose every engine on the tile under its user-visible name.
    fn register_engines(&mut self) {
        for engine in self.gt.engines() {
            let id = engine.id();
            self.uabi_engines.insert(id.uabi_name(), id);
        }
    }

    fn init_debugger(&mut self, plan: Option<ProbeStep>) {
        let enabled = self
            .params
            .as_ref()
            .is_some_and(|params| params.enable_debugger);
        if !enabled {
            return;
        }
        match inject_probe_point(plan, ProbeStep::DebuggerInit) {
            Ok(()) => self.debugger = Some(Debugger::init(&self.tracker)),
            Err(err) => {
                tracing::warn!(%err, "debugger init failed, continuing without debugger");
                self.diagnostics
                    .push(Diagnostic::new(ProbeStep::DebuggerInit, &err));
            }
        }
    }

    /// Release one stage acquired by [`Self::probe_stages`]. Shared by the unwind path and the
    /// full teardown; each stage is released at most once.
    pub(super) fn release_stage(&mut self, stage: Stage) {
        match stage {
            Stage::Engine => {
                self.uabi_engines.clear();
                self.gt.driver_remove();
            }
            Stage::Ggtt => self.gt.fini_ggtt(),
            Stage::Scheduler => self.sched = None,
            Stage::MemoryRegions => {
                self.gt.driver_late_release_all();
                let contexts = self.mm.contexts().release_all();
                if contexts != 0 {
                    tracing::debug!(contexts, "released contexts");
                }
                self.regions.driver_release();
            }
            Stage::Workqueue => self.wq = None,
            Stage::Uncore => {
                if let Some(uncore) = self.uncore.take() {
                    uncore.uninit();
                }
            }
            Stage::ModeConfig => {
                if let Some(mode_config) = self.mode_config.take() {
                    mode_config.cleanup();
                }
            }
        }
    }
}
