//! Memory-region bookkeeping.

use std::sync::{Arc, Mutex, MutexGuard};

use crate::device_info::RegionMask;
use crate::ida::Ida;
use crate::tracker::{ResourceKind, ResourceTracker, Token};
use crate::{DeviceError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionKind {
    System,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryRegion {
    pub kind: RegionKind,
    pub instance: u16,
    pub name: String,
    pub size: u64,
}

/// Regions discovered by [`MemoryRegions::hw_probe`].
#[derive(Debug, Default)]
pub struct MemoryRegions {
    regions: Vec<MemoryRegion>,
    token: Option<Token>,
}

impl MemoryRegions {
    /// Record the regions named by `mask`. Only system memory exists on the mock device.
    pub fn hw_probe(&mut self, mask: RegionMask, smem_size: u64, tracker: &ResourceTracker) {
        if mask.contains(RegionMask::SMEM) {
            self.regions.push(MemoryRegion {
                kind: RegionKind::System,
                instance: 0,
                name: "system".to_owned(),
                size: smem_size,
            });
        }
        let missing = mask - RegionMask::SMEM;
        if !missing.is_empty() {
            tracing::debug!(?missing, "no backing for requested memory regions");
        }
        if !self.regions.is_empty() && self.token.is_none() {
            self.token = Some(tracker.acquire(ResourceKind::MemoryRegions));
        }
    }

    pub fn driver_release(&mut self) {
        self.regions.clear();
        self.token = None;
    }

    pub fn regions(&self) -> &[MemoryRegion] {
        &self.regions
    }

    pub fn find(&self, kind: RegionKind) -> Option<&MemoryRegion> {
        self.regions.iter().find(|r| r.kind == kind)
    }
}

/// Instance numbering for self-test mock regions.
#[derive(Debug, Clone, Default)]
pub struct MockRegionInstances {
    ida: Arc<Mutex<Ida>>,
}

impl MockRegionInstances {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Ida> {
        match self.ida.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn create(&self, size: u64, tracker: &ResourceTracker) -> Result<MockRegion> {
        if size == 0 {
            return Err(DeviceError::InvalidArgument("zero-sized mock region".into()));
        }
        let instance = self
            .lock()
            .alloc_range(0, u32::from(u16::MAX))
            .ok_or(DeviceError::NoSpace("mock region instances"))?;
        Ok(MockRegion {
            instance,
            size,
            instances: self.clone(),
            _token: tracker.acquire(ResourceKind::MockRegion),
        })
    }

    pub fn in_use(&self) -> usize {
        self.lock().len()
    }
}

/// A self-test memory region. Its instance number is returned on drop.
#[derive(Debug)]
pub struct MockRegion {
    instance: u32,
    size: u64,
    instances: MockRegionInstances,
    _token: Token,
}

impl MockRegion {
    pub fn instance(&self) -> u32 {
        self.instance
    }

    pub fn size(&self) -> u64 {
        self.size
    }
}

impl Drop for MockRegion {
    fn drop(&mut self) {
        self.instances.lock().free(self.instance);
    }
}
