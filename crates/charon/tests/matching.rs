//! End-to-end channel/stream/bundle behavior over the virtual port: the
//! full path from frame injection through the poll thread, the matching
//! thread and the dispatch thread to the bundle callback.

use std::sync::Arc;
use std::time::Duration;

use charon::prelude::*;
use parking_lot::Mutex;

fn registry() -> (CameraRegistry, Arc<VirtualPort>) {
    let port = Arc::new(VirtualPort::new().expect("virtual port"));
    let registry = CameraRegistry::new(vec![Arc::clone(&port) as Arc<dyn DevicePort>]);
    (registry, port)
}

fn stream_config(stream_type: StreamType) -> StreamConfig {
    StreamConfig {
        stream_type,
        format: StreamFormat::new(
            FourCc::new(*b"NV12"),
            Resolution::new(64, 64).expect("resolution"),
        ),
        buf_count: 8,
        buf_size: 4096,
    }
}

fn collecting_sink() -> (Arc<Mutex<Vec<SuperBuf>>>, SuperBufNotify) {
    let seen: Arc<Mutex<Vec<SuperBuf>>> = Arc::new(Mutex::new(Vec::new()));
    let log = seen.clone();
    let sink: SuperBufNotify = Arc::new(move |superbuf| {
        log.lock().push(superbuf);
    });
    (seen, sink)
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

struct Rig {
    registry: CameraRegistry,
    port: Arc<VirtualPort>,
    cam: Handle,
    session: Arc<CameraSession>,
    channel: Arc<Channel>,
    streams: Vec<Handle>,
    server_ids: Vec<u32>,
}

fn rig(attr: BundleAttr, sink: SuperBufNotify) -> Rig {
    let (registry, port) = registry();
    let cam = registry.open(0).expect("open");
    let session = registry.session(cam).expect("session");
    let ch = session.add_channel().expect("add_channel");
    let channel = session.channel(ch).expect("channel");

    let mut streams = Vec::new();
    for stream_type in [StreamType::Preview, StreamType::Video] {
        let stream = channel.add_stream().expect("add_stream");
        channel
            .config_stream(stream, stream_config(stream_type))
            .expect("config_stream");
        streams.push(stream);
    }
    channel.init_bundle(attr, sink).expect("init_bundle");
    channel.start().expect("start");
    let server_ids = streams
        .iter()
        .map(|s| {
            channel
                .stream(*s)
                .expect("stream")
                .server_id()
                .expect("server id")
        })
        .collect();
    Rig {
        registry,
        port,
        cam,
        session,
        channel,
        streams,
        server_ids,
    }
}

impl Rig {
    fn inject_both(&self, frame_idx: u64) {
        for id in &self.server_ids {
            self.port.inject_frame(*id, frame_idx).expect("inject");
        }
    }

    fn finish(self) {
        self.channel.stop().expect("stop");
        self.session.del_channel(self.channel.handle()).expect("del");
        self.registry.close(self.cam).expect("close");
    }
}

#[test]
fn superbuf_delivered_after_the_last_contribution() {
    let (seen, sink) = collecting_sink();
    let rig = rig(
        BundleAttr {
            water_mark: 1,
            ..BundleAttr::default()
        },
        sink,
    );

    // Stream A alone must not complete the bundle.
    rig.port.inject_frame(rig.server_ids[0], 5).expect("inject");
    std::thread::sleep(Duration::from_millis(50));
    assert!(seen.lock().is_empty(), "no delivery before the second stream");

    rig.port.inject_frame(rig.server_ids[1], 5).expect("inject");
    wait_until("matched superbuf", || !seen.lock().is_empty());
    {
        let seen = seen.lock();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].frame_idx, 5);
        assert_eq!(seen[0].bufs.len(), 2);
        assert_eq!(seen[0].channel, rig.channel.handle());
        assert_eq!(seen[0].session, rig.cam);
    }
    rig.finish();
}

#[test]
fn continuous_mode_delivers_every_match_in_order() {
    let (seen, sink) = collecting_sink();
    let rig = rig(BundleAttr::default(), sink);

    for frame_idx in 0..6 {
        rig.inject_both(frame_idx);
    }
    wait_until("six superbufs", || seen.lock().len() == 6);
    let order: Vec<u64> = seen.lock().iter().map(|s| s.frame_idx).collect();
    assert_eq!(order, vec![0, 1, 2, 3, 4, 5]);

    // Returning every delivered buffer restores the hardware queues.
    for superbuf in seen.lock().drain(..) {
        for buf in &superbuf.bufs {
            rig.channel
                .return_buf(buf.stream, buf.buf_index)
                .expect("return_buf");
        }
    }
    for id in &rig.server_ids {
        assert_eq!(rig.port.queued_count(*id), 8);
    }
    rig.finish();
}

#[test]
fn burst_request_delivers_exactly_the_requested_count() {
    let (seen, sink) = collecting_sink();
    let rig = rig(
        BundleAttr {
            notify_mode: NotifyMode::Burst,
            water_mark: 4,
            look_back: 2,
            ..BundleAttr::default()
        },
        sink,
    );

    for frame_idx in 0..3 {
        rig.inject_both(frame_idx);
    }
    wait_until("matches accumulate", || {
        rig.session.counters().matches() == 3
    });
    assert!(seen.lock().is_empty(), "burst mode holds frames");

    rig.channel.request_super_buf(2).expect("request");
    wait_until("burst of two", || seen.lock().len() == 2);
    // Look-back of 2: the burst returns the two newest held frames.
    let order: Vec<u64> = seen.lock().iter().map(|s| s.frame_idx).collect();
    assert_eq!(order, vec![1, 2]);

    // Burst satisfied: further matches are held again.
    rig.inject_both(3);
    wait_until("fourth match", || rig.session.counters().matches() == 4);
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(seen.lock().len(), 2);
    rig.finish();
}

#[test]
fn cancelled_burst_request_delivers_nothing() {
    let (seen, sink) = collecting_sink();
    let rig = rig(
        BundleAttr {
            notify_mode: NotifyMode::Burst,
            water_mark: 4,
            look_back: 4,
            ..BundleAttr::default()
        },
        sink,
    );

    rig.channel.request_super_buf(3).expect("request");
    rig.channel.cancel_super_buf_request().expect("cancel");
    for frame_idx in 0..3 {
        rig.inject_both(frame_idx);
    }
    wait_until("matches exist", || rig.session.counters().matches() >= 1);
    std::thread::sleep(Duration::from_millis(50));
    assert!(seen.lock().is_empty(), "cancelled request must not deliver");
    rig.finish();
}

#[test]
fn flush_discards_queued_state_up_to_an_index() {
    let (seen, sink) = collecting_sink();
    let rig = rig(BundleAttr::default(), sink);

    // A lone contribution that the flush must discard.
    rig.port.inject_frame(rig.server_ids[0], 6).expect("inject");
    wait_until("frame seen by matcher", || {
        rig.session.counters().frames() == 1
    });
    rig.channel.flush_super_buf_queue(10).expect("flush");

    // Below the new expected index: dropped as stale.
    rig.inject_both(8);
    // At the expected index: delivered.
    rig.inject_both(10);
    wait_until("post-flush delivery", || !seen.lock().is_empty());
    let order: Vec<u64> = seen.lock().iter().map(|s| s.frame_idx).collect();
    assert_eq!(order, vec![10]);
    rig.finish();
}

#[test]
fn stop_then_start_restores_delivery_without_re_adding_streams() {
    let (seen, sink) = collecting_sink();
    let rig = rig(BundleAttr::default(), sink);

    rig.inject_both(0);
    wait_until("first delivery", || seen.lock().len() == 1);

    rig.channel.stop().expect("stop");
    assert_eq!(rig.channel.state(), ChannelState::Stopped);
    // Idempotent: stopping a stopped channel succeeds.
    rig.channel.stop().expect("stop again");

    rig.channel.start().expect("restart");
    assert_eq!(rig.channel.state(), ChannelState::Active);
    // Starting an active channel is also a success no-op.
    rig.channel.start().expect("start again");

    rig.inject_both(1);
    wait_until("post-restart delivery", || seen.lock().len() == 2);
    rig.finish();
}

#[test]
fn start_failure_rolls_back_partial_starts() {
    let (registry, port) = registry();
    let cam = registry.open(0).expect("open");
    let session = registry.session(cam).expect("session");
    let ch = session.add_channel().expect("add_channel");
    let channel = session.channel(ch).expect("channel");

    let ok_stream = channel.add_stream().expect("add");
    channel
        .config_stream(ok_stream, stream_config(StreamType::Preview))
        .expect("config");
    let doomed = channel.add_stream().expect("add");
    channel
        .config_stream(doomed, stream_config(StreamType::Video))
        .expect("config");

    // Pull the second stream out from under the channel server-side.
    let doomed_id = channel
        .stream(doomed)
        .expect("stream")
        .server_id()
        .expect("server id");
    let port_dyn: &dyn DevicePort = port.as_ref();
    port_dyn.stream_detach(doomed_id).expect("detach");

    let (_, sink) = collecting_sink();
    channel.init_bundle(BundleAttr::default(), sink).expect("bundle");
    let err = channel.start().expect_err("start must fail");
    assert_eq!(err.code(), "invalid_handle");
    assert_eq!(channel.state(), ChannelState::Stopped);
    assert!(!channel.stream(ok_stream).expect("stream").is_active());

    registry.close(cam).expect("close");
}

#[test]
fn deferred_stream_types_allocate_at_start() {
    let (registry, port) = registry();
    let cam = registry.open(0).expect("open");
    let session = registry.session(cam).expect("session");
    let ch = session.add_channel().expect("add_channel");
    let channel = session.channel(ch).expect("channel");

    let preview = channel.add_stream().expect("add");
    channel
        .config_stream(preview, stream_config(StreamType::Preview))
        .expect("config");
    // Preview maps its whole buffer set at config time.
    assert_eq!(port.mapping_count(), 8);

    let snapshot = channel.add_stream().expect("add");
    channel
        .config_stream(snapshot, stream_config(StreamType::Snapshot))
        .expect("config");
    // Snapshot defers: nothing new mapped yet.
    assert_eq!(port.mapping_count(), 8);

    let (_, sink) = collecting_sink();
    channel.init_bundle(BundleAttr::default(), sink).expect("bundle");
    channel.start().expect("start");
    assert_eq!(port.mapping_count(), 16);

    channel.stop().expect("stop");
    channel.del_stream(preview).expect("del");
    channel.del_stream(snapshot).expect("del");
    assert_eq!(port.mapping_count(), 0);
    session.del_channel(ch).expect("del_channel");
    registry.close(cam).expect("close");
}

#[test]
fn state_machine_guards_reject_wrong_state_operations() {
    let (seen, sink) = collecting_sink();
    let rig = rig(BundleAttr::default(), sink);
    drop(seen);

    // Channel is ACTIVE: structural changes are refused.
    let err = rig.channel.add_stream().expect_err("add while active");
    assert_eq!(err.code(), "invalid_state");
    let err = rig
        .channel
        .config_stream(rig.streams[0], stream_config(StreamType::Preview))
        .expect_err("config while active");
    assert_eq!(err.code(), "invalid_state");
    let err = rig.channel.del_stream(rig.streams[0]).expect_err("del while active");
    assert_eq!(err.code(), "invalid_state");

    rig.channel.stop().expect("stop");
    // Burst plumbing requires an active channel.
    let err = rig.channel.request_super_buf(1).expect_err("request stopped");
    assert_eq!(err.code(), "invalid_state");
    rig.finish();
}

#[test]
fn empty_or_unbundled_channels_refuse_to_start() {
    let (registry, _port) = registry();
    let cam = registry.open(0).expect("open");
    let session = registry.session(cam).expect("session");
    let ch = session.add_channel().expect("add_channel");
    let channel = session.channel(ch).expect("channel");

    assert_eq!(channel.start().expect_err("no streams").code(), "no_streams");

    let stream = channel.add_stream().expect("add");
    channel
        .config_stream(stream, stream_config(StreamType::Preview))
        .expect("config");
    assert_eq!(channel.start().expect_err("no bundle").code(), "no_bundle");
    registry.close(cam).expect("close");
}

#[test]
fn async_teardown_from_the_dispatch_path_does_not_deadlock() {
    let (registry, port) = registry();
    let cam = registry.open(0).expect("open");
    let session = registry.session(cam).expect("session");
    let ch = session.add_channel().expect("add_channel");
    let channel = session.channel(ch).expect("channel");

    let stream = channel.add_stream().expect("add");
    channel
        .config_stream(stream, stream_config(StreamType::Preview))
        .expect("config");

    // The callback runs on the channel's dispatch thread; a synchronous
    // stop from there would join the very thread it runs on. The async
    // path hands the stop to the session's command thread instead.
    let teardown_session = session.clone();
    let sink: SuperBufNotify = Arc::new(move |superbuf: SuperBuf| {
        teardown_session
            .async_teardown_streams(superbuf.channel)
            .expect("async teardown");
    });
    channel
        .init_bundle(BundleAttr::default(), sink)
        .expect("bundle");
    channel.start().expect("start");

    let server_id = channel
        .stream(stream)
        .expect("stream")
        .server_id()
        .expect("server id");
    port.inject_frame(server_id, 0).expect("inject");

    wait_until("async stop completes", || {
        channel.state() == ChannelState::Stopped
    });
    // Blocking stop now returns immediately: already stopped.
    channel.stop().expect("stop");
    session.del_channel(ch).expect("del_channel");
    registry.close(cam).expect("close");
}

#[test]
fn linked_stream_feeds_a_second_channels_matcher() {
    let (registry, port) = registry();
    let cam = registry.open(0).expect("open");
    let session = registry.session(cam).expect("session");

    // Owner channel with a single preview stream.
    let owner_ch = session.add_channel().expect("owner channel");
    let owner = session.channel(owner_ch).expect("channel");
    let stream = owner.add_stream().expect("add");
    owner
        .config_stream(stream, stream_config(StreamType::Preview))
        .expect("config");
    let (owner_seen, owner_sink) = collecting_sink();
    owner
        .init_bundle(BundleAttr::default(), owner_sink)
        .expect("bundle");

    // Second channel references the same stream for matching only.
    let other_ch = session.add_channel().expect("other channel");
    let other = session.channel(other_ch).expect("channel");
    let own_stream = other.add_stream().expect("add");
    other
        .config_stream(own_stream, stream_config(StreamType::Video))
        .expect("config");
    other
        .link_stream(owner.stream(stream).expect("stream"))
        .expect("link");
    let (other_seen, other_sink) = collecting_sink();
    other
        .init_bundle(BundleAttr::default(), other_sink)
        .expect("bundle");

    other.start().expect("start other");
    owner.start().expect("start owner");

    let owner_id = owner
        .stream(stream)
        .expect("stream")
        .server_id()
        .expect("id");
    let own_id = other
        .stream(own_stream)
        .expect("stream")
        .server_id()
        .expect("id");

    port.inject_frame(owner_id, 0).expect("inject");
    port.inject_frame(own_id, 0).expect("inject");

    // Owner matches on its own single stream; the second channel needs
    // both its own stream and the linked one.
    wait_until("owner delivery", || owner_seen.lock().len() == 1);
    wait_until("linked delivery", || other_seen.lock().len() == 1);
    assert_eq!(other_seen.lock()[0].bufs.len(), 2);

    owner.stop().expect("stop");
    other.stop().expect("stop");
    registry.close(cam).expect("close");
}
