use std::fmt;

/// CPU affinity mask covering up to 64 CPUs.
///
/// Worker threads are not pinned; the mask is carried so that schedulers report the affinity
/// they were created with.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct CpuMask(u64);

impl CpuMask {
    pub const MAX_CPUS: usize = 64;

    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn from_bits(bits: u64) -> Self {
        Self(bits)
    }

    /// Mask of every CPU the host reports as available (clamped to [`Self::MAX_CPUS`]).
    pub fn all() -> Self {
        let cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
            .min(Self::MAX_CPUS);
        if cpus == Self::MAX_CPUS {
            Self(u64::MAX)
        } else {
            Self((1u64 << cpus) - 1)
        }
    }

    pub fn single(cpu: usize) -> Option<Self> {
        (cpu < Self::MAX_CPUS).then(|| Self(1u64 << cpu))
    }

    pub const fn bits(self) -> u64 {
        self.0
    }

    pub fn contains(self, cpu: usize) -> bool {
        cpu < Self::MAX_CPUS && self.0 & (1u64 << cpu) != 0
    }

    pub fn weight(self) -> u32 {
        self.0.count_ones()
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Debug for CpuMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CpuMask({:#x})", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_covers_at_least_one_cpu() {
        let mask = CpuMask::all();
        assert!(mask.weight() >= 1);
        assert!(mask.contains(0));
        assert!(!mask.contains(CpuMask::MAX_CPUS));
    }

    #[test]
    fn single_rejects_out_of_range() {
        assert_eq!(CpuMask::single(3).map(CpuMask::bits), Some(0b1000));
        assert_eq!(CpuMask::single(64), None);
        assert!(CpuMask::empty().is_empty());
    }
}
