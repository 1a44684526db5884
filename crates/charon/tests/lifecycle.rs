//! Session lifecycle against the virtual device port: shared-refcount
//! open/close, event registration and dispatch, capability and parameter
//! transport.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use charon::port::Capability;
use charon::prelude::*;
use parking_lot::Mutex;

fn registry() -> (CameraRegistry, Arc<VirtualPort>) {
    let port = Arc::new(VirtualPort::new().expect("virtual port"));
    let registry = CameraRegistry::new(vec![Arc::clone(&port) as Arc<dyn DevicePort>]);
    (registry, port)
}

fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
    for _ in 0..400 {
        if cond() {
            return;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    panic!("timed out waiting for {what}");
}

#[test]
fn reopen_shares_the_session_and_refcounts() {
    let (registry, _port) = registry();
    let first = registry.open(0).expect("open");
    let second = registry.open(0).expect("reopen");
    assert_eq!(first, second);
    assert_eq!(registry.refcount(first), 2);

    registry.close(first).expect("first close");
    assert_eq!(registry.refcount(first), 1);
    assert!(registry.session(first).is_some(), "still open after one close");

    registry.close(second).expect("second close");
    assert!(registry.session(first).is_none(), "gone after last close");
    assert_eq!(registry.refcount(first), 0);
}

#[test]
fn concurrent_opens_return_the_identical_handle() {
    let (registry, _port) = registry();
    let registry = Arc::new(registry);
    let mut workers = Vec::new();
    for _ in 0..4 {
        let registry = registry.clone();
        workers.push(std::thread::spawn(move || registry.open(0).expect("open")));
    }
    let handles: Vec<Handle> = workers.into_iter().map(|w| w.join().unwrap()).collect();
    assert!(handles.windows(2).all(|pair| pair[0] == pair[1]));
    assert_eq!(registry.refcount(handles[0]), 4);
    for handle in &handles {
        registry.close(*handle).expect("close");
    }
    assert!(registry.session(handles[0]).is_none());
}

#[test]
fn close_of_a_stale_handle_is_a_benign_miss() {
    let (registry, _port) = registry();
    let handle = registry.open(0).expect("open");
    registry.close(handle).expect("close");
    let err = registry.close(handle).expect_err("stale close");
    assert_eq!(err.code(), "invalid_handle");

    // The slot is reusable and the old handle stays dead.
    let fresh = registry.open(0).expect("reopen");
    assert_ne!(fresh, handle);
    assert!(registry.session(handle).is_none());
    registry.close(fresh).expect("close");
}

#[test]
fn events_dispatch_to_matching_classes_only() {
    let (registry, port) = registry();
    let handle = registry.open(0).expect("open");
    let session = registry.session(handle).expect("session");

    let info_seen = Arc::new(Mutex::new(Vec::new()));
    let vendor_seen = Arc::new(AtomicUsize::new(0));

    let info_log = info_seen.clone();
    let info_token = session
        .register_event_notify(
            EventClass::Info,
            Arc::new(move |session_handle, kind| {
                info_log.lock().push((session_handle, kind.clone()));
            }),
        )
        .expect("register info");
    let vendor_count = vendor_seen.clone();
    let _vendor_token = session
        .register_event_notify(
            EventClass::Vendor,
            Arc::new(move |_, _| {
                vendor_count.fetch_add(1, Ordering::SeqCst);
            }),
        )
        .expect("register vendor");

    port.post_notify(EventKind::Info { code: 7 });
    wait_until("info event", || !info_seen.lock().is_empty());
    {
        let seen = info_seen.lock();
        assert_eq!(seen[0].0, handle);
        assert_eq!(seen[0].1, EventKind::Info { code: 7 });
    }
    // The info event must not reach the vendor callback.
    assert_eq!(vendor_seen.load(Ordering::SeqCst), 0);

    // Server death goes to everyone.
    port.kill_server();
    wait_until("death fan-out", || vendor_seen.load(Ordering::SeqCst) == 1);
    wait_until("death to info cb", || {
        info_seen.lock().iter().any(|(_, k)| *k == EventKind::ServerDied)
    });
    assert!(session.server_died());

    session.unregister_event_notify(info_token).expect("unregister");
    registry.close(handle).expect("close");
}

#[test]
fn registration_crossings_drive_kernel_subscription() {
    let (registry, port) = registry();
    let handle = registry.open(0).expect("open");
    let session = registry.session(handle).expect("session");

    // Baseline class subscribed at open.
    assert!(port.is_subscribed(EventClass::Info));
    assert!(!port.is_subscribed(EventClass::Channel));

    let noop: EventNotify = Arc::new(|_, _| {});
    let first = session
        .register_event_notify(EventClass::Channel, noop.clone())
        .expect("first");
    let second = session
        .register_event_notify(EventClass::Channel, noop)
        .expect("second");
    assert!(port.is_subscribed(EventClass::Channel));

    session.unregister_event_notify(first).expect("unreg first");
    assert!(
        port.is_subscribed(EventClass::Channel),
        "one registration left"
    );
    session.unregister_event_notify(second).expect("unreg second");
    assert!(!port.is_subscribed(EventClass::Channel));

    registry.close(handle).expect("close");
}

#[test]
fn capability_travels_through_the_mapped_buffer() {
    let capability = Capability {
        version: 3,
        max_channels: 2,
        max_streams_per_channel: 4,
        max_buffers_per_stream: 12,
    };
    let port = Arc::new(VirtualPort::with_capability(capability).expect("port"));
    let registry = CameraRegistry::new(vec![Arc::clone(&port) as Arc<dyn DevicePort>]);

    let handle = registry.open(0).expect("open");
    let session = registry.session(handle).expect("session");
    assert_eq!(session.query_capability().expect("capability"), capability);
    // The capability buffer stays mapped for repeat queries.
    assert_eq!(session.query_capability().expect("capability"), capability);
    registry.close(handle).expect("close");
}

#[test]
fn parameter_blobs_round_trip_through_shared_memory() {
    let (registry, _port) = registry();
    let handle = registry.open(0).expect("open");
    let session = registry.session(handle).expect("session");

    let blob = b"exposure=1/50;iso=800;af=continuous".to_vec();
    session.set_parms(&blob).expect("set_parms");
    assert_eq!(session.get_parms().expect("get_parms"), blob);

    // Overwrite with a shorter blob; the readback length follows.
    session.set_parms(b"iso=100").expect("set_parms");
    assert_eq!(session.get_parms().expect("get_parms"), b"iso=100".to_vec());
    registry.close(handle).expect("close");
}
