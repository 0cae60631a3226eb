#![allow(dead_code)]

use mock_gem_device::{MockDeviceConfig, MockGemDevice, ResourceKind, ResourceTracker};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}

/// Every acquisition of a fully constructed device without debugger hooks, in order.
pub const FULL_CHAIN: [ResourceKind; 12] = [
    ResourceKind::Identity,
    ResourceKind::DevresGroup,
    ResourceKind::Device,
    ResourceKind::Params,
    ResourceKind::ModeConfig,
    ResourceKind::Uncore,
    ResourceKind::MemoryRegions,
    ResourceKind::Workqueue,
    ResourceKind::Scheduler,
    ResourceKind::Ggtt,
    ResourceKind::AddressSpace,
    ResourceKind::Engine,
];

pub fn create(config: MockDeviceConfig) -> (MockGemDevice, ResourceTracker) {
    init_tracing();
    let tracker = ResourceTracker::new();
    let dev = MockGemDevice::create_with_tracker(config, tracker.clone()).unwrap();
    (dev, tracker)
}

/// The order a failed construction must release `acquired` in: newest first, with the parameter
/// copy always freed last.
pub fn expected_unwind(acquired: &[ResourceKind]) -> Vec<ResourceKind> {
    let mut expected: Vec<_> = acquired
        .iter()
        .rev()
        .copied()
        .filter(|&kind| kind != ResourceKind::Params)
        .collect();
    if acquired.contains(&ResourceKind::Params) {
        expected.push(ResourceKind::Params);
    }
    expected
}
