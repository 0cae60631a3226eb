mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use common::create;
use mock_gem_device::gt::GTT_PAGE_SIZE;
use mock_gem_device::{DeviceError, EngineId, MockDeviceConfig, Request, ResourceKind};
use pretty_assertions::assert_eq;

#[test]
fn concurrent_submissions_from_many_threads() {
    let (dev, tracker) = create(MockDeviceConfig::default());
    let ran = Arc::new(AtomicUsize::new(0));

    std::thread::scope(|s| {
        for _ in 0..4 {
            let dev = &dev;
            let ran = Arc::clone(&ran);
            s.spawn(move || {
                let fences: Vec<_> = (0..25)
                    .map(|_| {
                        let ran = Arc::clone(&ran);
                        dev.submit(
                            EngineId::Rcs0,
                            Request::new().with_payload(move || {
                                ran.fetch_add(1, Ordering::SeqCst);
                            }),
                        )
                        .unwrap()
                    })
                    .collect();
                for fence in fences {
                    assert!(fence.wait_timeout(Duration::from_secs(10)));
                }
            });
        }
    });

    assert_eq!(ran.load(Ordering::SeqCst), 100);
    assert_eq!(dev.engine(EngineId::Rcs0).unwrap().retire(), 0);
    dev.destroy();
    assert!(tracker.live().is_empty());
}

#[test]
fn engines_are_found_by_user_visible_name() {
    let (dev, _tracker) = create(MockDeviceConfig::default());

    let rcs0 = dev.engine_by_name("rcs0").unwrap();
    assert_eq!(rcs0.id(), EngineId::Rcs0);
    assert_eq!(rcs0.name(), "mock");
    assert!(rcs0.is_initialised());
    assert!(dev.engine_by_name("bcs0").is_none());
}

#[test]
fn objects_bind_into_the_global_gtt() {
    let (dev, _tracker) = create(MockDeviceConfig::default());
    let vm = dev.vm().unwrap();

    let mut a = dev.create_object(GTT_PAGE_SIZE).unwrap();
    let mut b = dev.create_object(2 * GTT_PAGE_SIZE).unwrap();
    let na = a.pin(&vm).unwrap();
    let nb = b.pin(&vm).unwrap();
    assert_eq!(na.end(), nb.start);
    assert_eq!(a.pin(&vm).unwrap(), na);
    assert_eq!(vm.bound_bytes(), 3 * GTT_PAGE_SIZE);

    assert!(a.unbind());
    assert_eq!(a.node(), None);
    assert!(matches!(
        dev.create_object(100),
        Err(DeviceError::InvalidArgument(_))
    ));
}

#[test]
fn contexts_are_released_with_the_device_unless_held() {
    let (dev, tracker) = create(MockDeviceConfig::default());
    let kept = dev.create_context("kept");
    let registered = dev.create_context("registered");
    drop(registered);
    assert_eq!(dev.mm().contexts().len(), 2);
    dev.destroy();

    assert_eq!(tracker.live(), vec![ResourceKind::Context]);
    assert_eq!(kept.name(), "kept");
    drop(kept);
    assert!(tracker.live().is_empty());
}

#[test]
fn mock_region_instances_are_lowest_free() {
    let (dev, _tracker) = create(MockDeviceConfig::default());
    let a = dev.create_mock_region(1 << 20).unwrap();
    let b = dev.create_mock_region(1 << 20).unwrap();
    assert_eq!((a.instance(), b.instance()), (0, 1));
    drop(a);
    let c = dev.create_mock_region(1 << 21).unwrap();
    assert_eq!(c.instance(), 0);
    assert_eq!(c.size(), 1 << 21);
}

#[test]
fn register_shim_retains_writes() {
    let (dev, _tracker) = create(MockDeviceConfig::default());
    let uncore = dev.uncore().unwrap();
    uncore.forcewake_get();
    uncore.write32(0x2030, 0x1234).unwrap();
    assert_eq!(uncore.read32(0x2030).unwrap(), 0x1234);
    uncore.forcewake_put();
    assert!(!uncore.forcewake_held());
}

#[test]
fn engine_handles_accept_direct_submissions() {
    let (dev, _tracker) = create(MockDeviceConfig::default());
    let engine = dev.engine(EngineId::Rcs0).unwrap();
    let fence = engine.submit(Request::new()).unwrap();
    assert!(fence.wait_timeout(Duration::from_secs(5)));
    assert_eq!(fence.error(), None);
    assert_eq!(
        DeviceError::NoSuchEngine(EngineId::Rcs0).errno(),
        -mock_gem_device::error::errno::ENODEV
    );
}
