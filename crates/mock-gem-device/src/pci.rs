//! Identity provider: the emulated PCI function backing a mock device.
//!
//! A [`PciDev`] is reference counted. The release callback supplied at allocation runs when the
//! last [`PciDevRef`] is dropped, after which the identity's tracker token is released.

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::tracker::{ResourceKind, ResourceTracker, Token};
use crate::{DeviceError, Result};

pub const PCI_BASE_CLASS_DISPLAY: u32 = 0x03;

static NEXT_INSTANCE: AtomicU32 = AtomicU32::new(0);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BusAddress {
    pub domain: u16,
    pub bus: u8,
    pub device: u8,
    pub function: u8,
}

impl BusAddress {
    /// Spread an instance number over every address field, so distinct instances never share an
    /// address.
    pub fn from_instance(n: u32) -> Self {
        Self {
            domain: (n >> 16) as u16,
            bus: (n & 0xff) as u8,
            device: ((n >> 8) & 0x1f) as u8,
            function: ((n >> 13) & 0x7) as u8,
        }
    }

    /// Address for the next device instance, or `None` once every address has been handed out.
    fn next() -> Option<Self> {
        NEXT_INSTANCE
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_add(1))
            .ok()
            .map(Self::from_instance)
    }
}

impl fmt::Display for BusAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:04x}:{:02x}:{:02x}.{}",
            self.domain, self.bus, self.device, self.function
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IommuMode {
    Translated,
    /// DMA addresses are physical addresses.
    Identity,
}

pub fn dma_bit_mask(bits: u32) -> u64 {
    if bits >= 64 {
        u64::MAX
    } else {
        (1u64 << bits) - 1
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RpmStatus {
    Active,
    Suspended,
}

/// Runtime suspend/resume callbacks for a device.
#[derive(Clone, Copy)]
pub struct PmDomain {
    pub runtime_suspend: fn(&PciDev) -> Result<()>,
    pub runtime_resume: fn(&PciDev) -> Result<()>,
}

impl PmDomain {
    /// Domain that delegates to the generic runtime callbacks.
    pub fn generic() -> Self {
        Self {
            runtime_suspend: pm_generic_runtime_suspend,
            runtime_resume: pm_generic_runtime_resume,
        }
    }
}

impl fmt::Debug for PmDomain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PmDomain").finish_non_exhaustive()
    }
}

// No driver-level runtime callbacks are bound to a mock device.
fn pm_generic_runtime_suspend(_dev: &PciDev) -> Result<()> {
    Ok(())
}

fn pm_generic_runtime_resume(_dev: &PciDev) -> Result<()> {
    Ok(())
}

#[derive(Debug)]
struct DevPm {
    domain: Option<PmDomain>,
    enabled: bool,
    usage_count: u32,
    status: RpmStatus,
    use_autosuspend: bool,
}

impl Default for DevPm {
    fn default() -> Self {
        Self {
            domain: None,
            enabled: false,
            usage_count: 0,
            status: RpmStatus::Suspended,
            use_autosuspend: true,
        }
    }
}

pub type ReleaseFn = Box<dyn FnOnce(&PciDev) + Send>;

pub type PciDevRef = Arc<PciDev>;

pub struct PciDev {
    name: String,
    address: BusAddress,
    class: u32,
    dma_mask: u64,
    coherent_dma_mask: u64,
    iommu: IommuMode,
    drvdata: Mutex<Option<String>>,
    pm: Mutex<DevPm>,
    release: Mutex<Option<ReleaseFn>>,
    _token: Token,
}

impl PciDev {
    pub fn allocate(
        name: &str,
        dma_mask_bits: u32,
        iommu: IommuMode,
        tracker: &ResourceTracker,
        release: ReleaseFn,
    ) -> Result<PciDevRef> {
        if dma_mask_bits == 0 || dma_mask_bits > 64 {
            return Err(DeviceError::InvalidArgument(format!(
                "dma mask of {dma_mask_bits} bits"
            )));
        }

        let address = BusAddress::next().ok_or(DeviceError::NoSpace("pci bus addresses"))?;
        let dma_mask = dma_bit_mask(dma_mask_bits);
        let dev = Arc::new(Self {
            name: name.to_owned(),
            address,
            class: PCI_BASE_CLASS_DISPLAY << 16,
            dma_mask,
            coherent_dma_mask: dma_mask,
            iommu,
            drvdata: Mutex::new(None),
            pm: Mutex::new(DevPm::default()),
            release: Mutex::new(Some(release)),
            _token: tracker.acquire(ResourceKind::Identity),
        });
        tracing::debug!(name, address = %dev.address, ?iommu, "pci device allocated");
        Ok(dev)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn address(&self) -> BusAddress {
        self.address
    }

    pub fn class(&self) -> u32 {
        self.class
    }

    pub fn dma_mask(&self) -> u64 {
        self.dma_mask
    }

    pub fn coherent_dma_mask(&self) -> u64 {
        self.coherent_dma_mask
    }

    pub fn iommu(&self) -> IommuMode {
        self.iommu
    }

    pub fn set_drvdata(&self, driver: Option<&str>) {
        *lock(&self.drvdata) = driver.map(str::to_owned);
    }

    pub fn drvdata(&self) -> Option<String> {
        lock(&self.drvdata).clone()
    }

    pub fn set_pm_domain(&self, domain: Option<PmDomain>) {
        lock(&self.pm).domain = domain;
    }

    pub fn pm_runtime_enable(&self) {
        lock(&self.pm).enabled = true;
    }

    pub fn pm_runtime_disable(&self) {
        lock(&self.pm).enabled = false;
    }

    pub fn pm_runtime_enabled(&self) -> bool {
        lock(&self.pm).enabled
    }

    pub fn pm_runtime_dont_use_autosuspend(&self) {
        lock(&self.pm).use_autosuspend = false;
    }

    pub fn pm_runtime_uses_autosuspend(&self) -> bool {
        lock(&self.pm).use_autosuspend
    }

    pub fn pm_runtime_status(&self) -> RpmStatus {
        lock(&self.pm).status
    }

    pub fn pm_runtime_usage_count(&self) -> u32 {
        lock(&self.pm).usage_count
    }

    /// Take a usage reference and resume the device if needed.
    ///
    /// The reference is kept even when resuming fails.
    pub fn pm_runtime_get_sync(&self) -> Result<()> {
        let domain = {
            let mut pm = lock(&self.pm);
            pm.usage_count += 1;
            if !pm.enabled || pm.status == RpmStatus::Active {
                return Ok(());
            }
            pm.domain
        };

        if let Some(domain) = domain {
            (domain.runtime_resume)(self)?;
        }
        lock(&self.pm).status = RpmStatus::Active;
        Ok(())
    }

    /// Drop a usage reference, suspending the device once it is unused.
    pub fn pm_runtime_put(&self) -> Result<()> {
        let domain = {
            let mut pm = lock(&self.pm);
            pm.usage_count = pm.usage_count.saturating_sub(1);
            if pm.usage_count != 0 || !pm.enabled || pm.status == RpmStatus::Suspended {
                return Ok(());
            }
            pm.domain
        };

        if let Some(domain) = domain {
            (domain.runtime_suspend)(self)?;
        }
        lock(&self.pm).status = RpmStatus::Suspended;
        Ok(())
    }
}

impl Drop for PciDev {
    fn drop(&mut self) {
        let release = lock(&self.release).take();
        if let Some(release) = release {
            release(self);
        }
    }
}

impl fmt::Debug for PciDev {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PciDev")
            .field("name", &self.name)
            .field("address", &self.address)
            .field("class", &format_args!("{:#08x}", self.class))
            .field("iommu", &self.iommu)
            .finish_non_exhaustive()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    fn alloc(tracker: &ResourceTracker, release: ReleaseFn) -> PciDevRef {
        PciDev::allocate("mock", 64, IommuMode::Identity, tracker, release).unwrap()
    }

    #[test]
    fn release_callback_runs_on_last_reference() {
        let tracker = ResourceTracker::new();
        let released = Arc::new(AtomicBool::new(false));
        let dev = {
            let released = Arc::clone(&released);
            alloc(
                &tracker,
                Box::new(move |dev| {
                    assert_eq!(dev.name(), "mock");
                    released.store(true, Ordering::SeqCst);
                }),
            )
        };

        let second = Arc::clone(&dev);
        drop(dev);
        assert!(!released.load(Ordering::SeqCst));
        assert!(tracker.is_live(ResourceKind::Identity));

        drop(second);
        assert!(released.load(Ordering::SeqCst));
        assert!(!tracker.is_live(ResourceKind::Identity));
    }

    #[test]
    fn display_class_and_full_dma_mask() {
        let tracker = ResourceTracker::new();
        let dev = alloc(&tracker, Box::new(|_| {}));
        assert_eq!(dev.class(), 0x03_0000);
        assert_eq!(dev.dma_mask(), u64::MAX);
        assert_eq!(dev.coherent_dma_mask(), u64::MAX);
        assert_eq!(dma_bit_mask(32), 0xffff_ffff);
    }

    #[test]
    fn rejects_empty_dma_mask() {
        let tracker = ResourceTracker::new();
        let err = PciDev::allocate("mock", 0, IommuMode::Translated, &tracker, Box::new(|_| {}))
            .unwrap_err();
        assert!(matches!(err, DeviceError::InvalidArgument(_)));
        assert!(tracker.live().is_empty());
    }

    #[test]
    fn bus_addresses_are_unique() {
        let tracker = ResourceTracker::new();
        let a = alloc(&tracker, Box::new(|_| {}));
        let b = alloc(&tracker, Box::new(|_| {}));
        assert_ne!(a.address(), b.address());
        assert!(a.address().to_string().starts_with("0000:"));
    }

    #[test]
    fn addresses_stay_distinct_past_the_bus_and_device_range() {
        let first = BusAddress::from_instance(0);
        let wrapped = BusAddress::from_instance(1 << 13);
        assert_ne!(first, wrapped);
        assert_eq!(wrapped.function, 1);
        assert_eq!(BusAddress::from_instance(1 << 16).domain, 1);

        let last = BusAddress::from_instance(u32::MAX);
        assert_eq!(last.to_string(), "ffff:ff:1f.7");
        assert_ne!(last, BusAddress::from_instance(u32::MAX >> 1));
    }

    #[test]
    fn get_sync_resumes_through_domain_and_keeps_reference() {
        let tracker = ResourceTracker::new();
        let dev = alloc(&tracker, Box::new(|_| {}));
        dev.set_pm_domain(Some(PmDomain::generic()));
        dev.pm_runtime_enable();
        dev.pm_runtime_dont_use_autosuspend();

        assert_eq!(dev.pm_runtime_status(), RpmStatus::Suspended);
        dev.pm_runtime_get_sync().unwrap();
        assert_eq!(dev.pm_runtime_status(), RpmStatus::Active);
        assert_eq!(dev.pm_runtime_usage_count(), 1);
        assert!(!dev.pm_runtime_uses_autosuspend());

        dev.pm_runtime_put().unwrap();
        assert_eq!(dev.pm_runtime_status(), RpmStatus::Suspended);
    }

    #[test]
    fn resume_failure_still_takes_reference() {
        fn failing_resume(_: &PciDev) -> Result<()> {
            Err(DeviceError::Busy("resume"))
        }

        let tracker = ResourceTracker::new();
        let dev = alloc(&tracker, Box::new(|_| {}));
        dev.set_pm_domain(Some(PmDomain {
            runtime_suspend: |_| Ok(()),
            runtime_resume: failing_resume,
        }));
        dev.pm_runtime_enable();

        assert!(dev.pm_runtime_get_sync().is_err());
        assert_eq!(dev.pm_runtime_usage_count(), 1);
        assert_eq!(dev.pm_runtime_status(), RpmStatus::Suspended);
    }
}
