use std::time::Duration;

use gem_sched::CpuMask;

use crate::ProbeStep;

/// Driver parameters. The device keeps its own copy, taken during construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Params {
    pub modeset: i32,
    pub enable_guc: i32,
    pub enable_hangcheck: bool,
    pub reset: u32,
    pub error_capture: bool,
    pub enable_debugger: bool,
    pub dmc_firmware_path: Option<String>,
    pub guc_firmware_path: Option<String>,
    /// Fail construction at this step (see [`crate::inject`]).
    pub inject_probe_failure: Option<ProbeStep>,
}

impl Default for Params {
    fn default() -> Self {
        Self {
            modeset: -1,
            enable_guc: -1,
            enable_hangcheck: true,
            reset: 3,
            error_capture: true,
            enable_debugger: false,
            dmc_firmware_path: None,
            guc_firmware_path: None,
            inject_probe_failure: None,
        }
    }
}

/// Construction-time snapshot consumed by [`MockGemDevice::create`](crate::MockGemDevice::create).
#[derive(Debug, Clone)]
pub struct MockDeviceConfig {
    /// Bus device name.
    pub name: String,
    pub dma_mask_bits: u32,
    /// Force an identity IOMMU mapping for the device.
    pub iommu_identity_map: bool,
    /// Concurrent job slots of the command scheduler.
    pub sched_width: usize,
    pub sched_affinity: CpuMask,
    /// Upper bound on the teardown drain before outstanding work is cancelled.
    pub flush_timeout: Duration,
    pub smem_size: u64,
    pub params: Params,
}

impl Default for MockDeviceConfig {
    fn default() -> Self {
        Self {
            name: "mock".to_owned(),
            dma_mask_bits: 64,
            iommu_identity_map: true,
            sched_width: 3,
            sched_affinity: CpuMask::all(),
            flush_timeout: Duration::from_secs(30),
            smem_size: 1 << 30,
            params: Params::default(),
        }
    }
}

impl MockDeviceConfig {
    pub fn with_probe_failure(mut self, step: ProbeStep) -> Self {
        self.params.inject_probe_failure = Some(step);
        self
    }
}
