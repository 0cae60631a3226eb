//! Static capability metadata of the mock device.

use bitflags::bitflags;

pub const MAX_CACHE_LEVEL: usize = 4;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct PageSizes: u32 {
        const SIZE_4K = 1 << 12;
        const SIZE_64K = 1 << 16;
        const SIZE_2M = 1 << 21;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct RegionMask: u32 {
        const SMEM = 1 << 0;
        const LMEM = 1 << 1;
        const STOLEN_SMEM = 1 << 2;
        const STOLEN_LMEM = 1 << 3;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct EngineMask: u32 {
        const RCS0 = 1 << 0;
    }
}

/// Write-once device description.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    /// `-1` marks an unknown graphics version.
    pub graphics_ver: i32,
    pub page_sizes: PageSizes,
    pub cachelevel_to_pat: [u32; MAX_CACHE_LEVEL],
    pub memory_regions: RegionMask,
    pub platform_engine_mask: EngineMask,
}

impl Default for DeviceInfo {
    fn default() -> Self {
        Self {
            graphics_ver: 0,
            page_sizes: PageSizes::empty(),
            cachelevel_to_pat: [0; MAX_CACHE_LEVEL],
            memory_regions: RegionMask::empty(),
            platform_engine_mask: EngineMask::empty(),
        }
    }
}

impl DeviceInfo {
    /// Populate the fields the mock device reports before its tile is probed.
    pub fn init_mock(&mut self) {
        self.graphics_ver = -1;
        self.page_sizes = PageSizes::SIZE_4K | PageSizes::SIZE_64K | PageSizes::SIZE_2M;
        // Legacy cache levels map straight onto PAT indices.
        for (level, pat) in self.cachelevel_to_pat.iter_mut().enumerate() {
            *pat = level as u32;
        }
    }

    pub fn pat_index(&self, cache_level: usize) -> Option<u32> {
        self.cachelevel_to_pat.get(cache_level).copied()
    }
}

/// Runtime-discovered information.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RuntimeInfo {
    /// `!0` marks an unknown graphics version.
    pub graphics_ver: u32,
}

impl RuntimeInfo {
    pub fn init_mock(&mut self) {
        self.graphics_ver = !0;
    }
}
