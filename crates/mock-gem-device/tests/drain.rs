mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

use common::create;
use gem_sched::FenceError;
use mock_gem_device::gt::GTT_PAGE_SIZE;
use mock_gem_device::{
    DeviceError, EngineId, MockDeviceConfig, Request, ResourceKind, TeardownStep, TrackerEvent,
};
use pretty_assertions::assert_eq;

const LONG: Duration = Duration::from_secs(3600);

fn position(events: &[TrackerEvent], event: TrackerEvent) -> usize {
    events
        .iter()
        .position(|e| *e == event)
        .unwrap_or_else(|| panic!("{event:?} not recorded"))
}

#[test]
fn destroy_drains_outstanding_requests_before_releasing_engines() {
    let (dev, tracker) = create(MockDeviceConfig::default());
    let fences: Vec<_> = (0..8)
        .map(|_| {
            dev.submit(EngineId::Rcs0, Request::new().with_delay(LONG))
                .unwrap()
        })
        .collect();
    dev.destroy();

    for fence in &fences {
        assert!(fence.is_signaled());
        assert_eq!(fence.error(), None);
    }

    let events = tracker.events();
    let engine_released = position(&events, TrackerEvent::Released(ResourceKind::Engine));
    let ggtt_released = position(&events, TrackerEvent::Released(ResourceKind::Ggtt));
    let last_drain = events[..engine_released]
        .iter()
        .rposition(|e| matches!(e, TrackerEvent::Drained { .. }))
        .unwrap();
    assert_eq!(events[last_drain], TrackerEvent::Drained { outstanding: 0 });
    assert!(last_drain < ggtt_released);
    assert!(tracker.live().is_empty());
}

#[test]
fn payloads_run_before_teardown_proceeds() {
    let (dev, tracker) = create(MockDeviceConfig::default());
    let ran = Arc::new(AtomicUsize::new(0));
    for _ in 0..32 {
        let ran = Arc::clone(&ran);
        dev.submit(
            EngineId::Rcs0,
            Request::new().with_payload(move || {
                std::thread::sleep(Duration::from_millis(1));
                ran.fetch_add(1, Ordering::SeqCst);
            }),
        )
        .unwrap();
    }
    dev.destroy();

    assert_eq!(ran.load(Ordering::SeqCst), 32);
    assert!(tracker.live().is_empty());
}

#[test]
fn flush_quiesces_a_live_device() {
    let (dev, _tracker) = create(MockDeviceConfig::default());
    let fence = dev
        .submit(EngineId::Rcs0, Request::new().with_delay(LONG))
        .unwrap();

    dev.flush();
    assert!(fence.is_signaled());
    let engine = dev.engine(EngineId::Rcs0).unwrap();
    assert_eq!(engine.outstanding(), 0);
    assert!(!dev.gt().is_wedged());
    assert_eq!(dev.sched().unwrap().active(), 0);

    // Still usable afterwards.
    let fence = dev.submit(EngineId::Rcs0, Request::new()).unwrap();
    assert!(fence.wait_timeout(Duration::from_secs(5)));
}

#[test]
fn flush_timeout_wedges_the_gt() {
    let config = MockDeviceConfig {
        sched_width: 1,
        flush_timeout: Duration::from_millis(50),
        ..MockDeviceConfig::default()
    };
    let (dev, tracker) = create(config);

    let running = dev
        .submit(
            EngineId::Rcs0,
            Request::new().with_payload(|| std::thread::sleep(Duration::from_millis(300))),
        )
        .unwrap();
    let queued = dev
        .submit(EngineId::Rcs0, Request::new().with_delay(LONG))
        .unwrap();

    dev.flush();

    assert_eq!(running.error(), Some(FenceError::Wedged));
    assert_eq!(queued.error(), Some(FenceError::Wedged));
    assert!(dev.gt().is_wedged());
    assert!(dev.sched().unwrap().cancelled() >= 1);
    assert!(matches!(
        dev.submit(EngineId::Rcs0, Request::new()),
        Err(DeviceError::Wedged)
    ));
    assert!(tracker
        .events()
        .contains(&TrackerEvent::Drained { outstanding: 0 }));

    dev.destroy();
    assert!(tracker.live().is_empty());
}

#[test]
fn deferred_object_frees_complete_before_the_ggtt_is_finalised() {
    let (dev, tracker) = create(MockDeviceConfig::default());
    let vm = dev.vm().unwrap();
    for _ in 0..4 {
        let mut obj = dev.create_object(4 * GTT_PAGE_SIZE).unwrap();
        obj.pin(&vm).unwrap();
    }
    drop(vm);
    dev.destroy();

    let events = tracker.events();
    let fini_ggtt = position(&events, TrackerEvent::Teardown(TeardownStep::FiniGgtt));
    let freed: Vec<usize> = events
        .iter()
        .enumerate()
        .filter(|(_, e)| **e == TrackerEvent::Released(ResourceKind::GemObject))
        .map(|(i, _)| i)
        .collect();
    assert_eq!(freed.len(), 4);
    assert!(freed.iter().all(|&i| i < fini_ggtt));
    assert!(tracker.live().is_empty());
}

#[test]
fn objects_held_past_destroy_keep_the_address_space_alive() {
    let (dev, tracker) = create(MockDeviceConfig::default());
    let vm = dev.vm().unwrap();
    let mut obj = dev.create_object(GTT_PAGE_SIZE).unwrap();
    obj.pin(&vm).unwrap();
    drop(vm);
    dev.destroy();

    assert_eq!(
        tracker.live(),
        vec![ResourceKind::AddressSpace, ResourceKind::GemObject]
    );
    drop(obj);
    assert!(tracker.live().is_empty());
}

#[test]
fn panicking_payload_does_not_block_teardown() {
    let config = MockDeviceConfig {
        flush_timeout: Duration::from_millis(100),
        ..MockDeviceConfig::default()
    };
    let (dev, tracker) = create(config);
    let failed = dev
        .submit(
            EngineId::Rcs0,
            Request::new().with_payload(|| panic!("payload failed")),
        )
        .unwrap();
    let next = dev.submit(EngineId::Rcs0, Request::new()).unwrap();

    let (done_tx, done_rx) = mpsc::channel();
    std::thread::spawn(move || {
        dev.destroy();
        let _ = done_tx.send(());
    });
    assert!(done_rx.recv_timeout(Duration::from_secs(10)).is_ok());

    assert_eq!(failed.error(), Some(FenceError::Aborted));
    assert_eq!(next.error(), None);
    assert!(next.is_signaled());
    assert_eq!(tracker.teardown_steps(), TeardownStep::ALL.to_vec());
    assert!(tracker.live().is_empty());
}
