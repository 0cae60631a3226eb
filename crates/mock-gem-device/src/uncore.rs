//! Register shim.
//!
//! The mock device has no MMIO BAR. [`MockUncore`] backs the register space with a sparse map:
//! unwritten registers read as zero and every write is retained. Forcewake is accounted but has
//! no effect.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use crate::tracker::{ResourceKind, ResourceTracker, Token};
use crate::{DeviceError, Result};

/// Size of the emulated register BAR.
pub const MMIO_SIZE: u32 = 2 << 20;

#[derive(Debug, Default)]
struct Regs {
    values: BTreeMap<u32, u32>,
    forcewake: u32,
    reads: u64,
    writes: u64,
}

#[derive(Debug)]
pub struct MockUncore {
    regs: Mutex<Regs>,
    _token: Token,
}

impl MockUncore {
    pub fn init(tracker: &ResourceTracker) -> Result<Self> {
        tracing::debug!("mock uncore init");
        Ok(Self {
            regs: Mutex::new(Regs::default()),
            _token: tracker.acquire(ResourceKind::Uncore),
        })
    }

    pub fn uninit(self) {
        let regs = self.lock();
        tracing::debug!(reads = regs.reads, writes = regs.writes, "mock uncore uninit");
    }

    fn lock(&self) -> MutexGuard<'_, Regs> {
        match self.regs.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn check(offset: u32) -> Result<()> {
        if offset % 4 != 0 || offset >= MMIO_SIZE {
            return Err(DeviceError::InvalidArgument(format!(
                "register offset {offset:#x}"
            )));
        }
        Ok(())
    }

    pub fn read32(&self, offset: u32) -> Result<u32> {
        Self::check(offset)?;
        let mut regs = self.lock();
        regs.reads += 1;
        Ok(regs.values.get(&offset).copied().unwrap_or(0))
    }

    pub fn write32(&self, offset: u32, value: u32) -> Result<()> {
        Self::check(offset)?;
        let mut regs = self.lock();
        regs.writes += 1;
        regs.values.insert(offset, value);
        Ok(())
    }

    /// Clear then set bits, returning the previous value.
    pub fn rmw32(&self, offset: u32, clear: u32, set: u32) -> Result<u32> {
        Self::check(offset)?;
        let mut regs = self.lock();
        regs.reads += 1;
        regs.writes += 1;
        let old = regs.values.get(&offset).copied().unwrap_or(0);
        regs.values.insert(offset, (old & !clear) | set);
        Ok(old)
    }

    pub fn forcewake_get(&self) {
        self.lock().forcewake += 1;
    }

    pub fn forcewake_put(&self) {
        let mut regs = self.lock();
        regs.forcewake = regs.forcewake.saturating_sub(1);
    }

    pub fn forcewake_held(&self) -> bool {
        self.lock().forcewake != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registers_default_to_zero_and_retain_writes() {
        let tracker = ResourceTracker::new();
        let uncore = MockUncore::init(&tracker).unwrap();

        assert_eq!(uncore.read32(0x2000).unwrap(), 0);
        uncore.write32(0x2000, 0xdead_beef).unwrap();
        assert_eq!(uncore.read32(0x2000).unwrap(), 0xdead_beef);
        assert_eq!(uncore.rmw32(0x2000, 0xffff, 0x1).unwrap(), 0xdead_beef);
        assert_eq!(uncore.read32(0x2000).unwrap(), 0xdead_0001);

        uncore.uninit();
        assert!(tracker.live().is_empty());
    }

    #[test]
    fn rejects_unaligned_and_out_of_range_offsets() {
        let tracker = ResourceTracker::new();
        let uncore = MockUncore::init(&tracker).unwrap();
        assert!(uncore.read32(0x2001).is_err());
        assert!(uncore.write32(MMIO_SIZE, 0).is_err());
    }

    #[test]
    fn forcewake_is_reference_counted() {
        let tracker = ResourceTracker::new();
        let uncore = MockUncore::init(&tracker).unwrap();
        uncore.forcewake_get();
        uncore.forcewake_get();
        uncore.forcewake_put();
        assert!(uncore.forcewake_held());
        uncore.forcewake_put();
        assert!(!uncore.forcewake_held());
    }
}
