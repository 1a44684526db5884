//! Channel: an aggregate of streams with an explicit state machine and,
//! when bundled, a super-buffer matching queue.
//!
//! State machine: a channel slot starts STOPPED when added
//! (NOTUSED -> STOPPED), accepts stream add/config while STOPPED, moves to
//! ACTIVE on `start` (rolling back partial starts on failure) and back on
//! `stop` (which flushes the matching queue). Start and stop are
//! idempotent success no-ops so redundant calls from upper layers stay
//! cheap. While ACTIVE, a command thread runs the matching logic and a
//! second thread dispatches matched super-buffers to the caller.

use std::collections::HashMap;
use std::sync::Arc;

use charon_core::cmd::{CmdSender, CmdThread};
use charon_core::format::StreamType;
use charon_core::handle::{Handle, HandleArena};
use charon_core::metrics::MatchCounters;
use charon_core::poll::{CallMode, PollThread, Readiness};
use charon_mem::BufPool;
use parking_lot::Mutex;
use smallvec::SmallVec;
use tracing::{debug, error, info, warn};

use crate::bundle::{BundleAttr, MatchQueue, NotifyMode, StreamBuf, SuperBuf, SuperBufNotify};
use crate::error::CamError;
use crate::port::DevicePort;
use crate::session::SessionIpc;
use crate::stream::{FrameSink, Stream, StreamConfig};

/// Streams per channel, matching the bundle table width.
pub const MAX_STREAMS_PER_CHANNEL: usize = 8;

/// Channel lifecycle state. A channel that does not exist in its session's
/// table is conceptually NOTUSED.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Stopped,
    Active,
}

impl ChannelState {
    fn name(self) -> &'static str {
        match self {
            ChannelState::Stopped => "stopped",
            ChannelState::Active => "active",
        }
    }
}

/// Commands processed on the channel's matching thread.
enum BufCmd {
    Data(StreamBuf),
    RequestSuperBuf { count: u32 },
    CancelRequest,
    ConfigNotify(NotifyMode),
    Flush { up_to: u64 },
}

/// Matching state shared with the channel's command thread.
struct MatchEngine {
    session: Handle,
    channel: Handle,
    queue: Mutex<MatchQueue>,
    /// Outstanding burst frames; mutated only on the command thread.
    pending_cnt: Mutex<u32>,
    dispatcher: CmdSender<SuperBuf>,
    returner: Arc<dyn Fn(&StreamBuf) + Send + Sync>,
    counters: Arc<MatchCounters>,
}

impl MatchEngine {
    fn process(&self, cmd: BufCmd) {
        let mut rejects = Vec::new();
        match cmd {
            BufCmd::Data(buf) => {
                self.counters.frame();
                let mut queue = self.queue.lock();
                let matches_before = queue.match_cnt();
                let absorbed = queue.feed(buf, &mut rejects);
                if queue.match_cnt() > matches_before {
                    self.counters.matched();
                }
                if !absorbed {
                    self.counters.dropped_stale();
                }
            }
            BufCmd::RequestSuperBuf { count } => {
                *self.pending_cnt.lock() = count;
                // A burst may reach back into matched history, but no
                // deeper than the configured look-back.
                let mut queue = self.queue.lock();
                let look_back = queue.attr().look_back;
                queue.trim_matched_to(look_back, &mut rejects);
            }
            BufCmd::CancelRequest => {
                *self.pending_cnt.lock() = 0;
            }
            BufCmd::ConfigNotify(mode) => {
                self.queue.lock().set_notify_mode(mode);
            }
            BufCmd::Flush { up_to } => {
                let mut queue = self.queue.lock();
                queue.flush(Some(up_to), &mut rejects);
                drop(queue);
                self.requeue(rejects);
                // Flush discards state and dispatches nothing.
                return;
            }
        }
        {
            let mut queue = self.queue.lock();
            let water_mark = queue.attr().water_mark;
            queue.trim_matched_to(water_mark, &mut rejects);
        }
        self.requeue(rejects);
        self.dispatch();
    }

    fn dispatch(&self) {
        loop {
            let burst = matches!(self.queue.lock().attr().notify_mode, NotifyMode::Burst);
            if burst && *self.pending_cnt.lock() == 0 {
                break;
            }
            let Some((frame_idx, bufs)) = self.queue.lock().dequeue_matched() else {
                break;
            };
            if burst {
                let mut pending = self.pending_cnt.lock();
                *pending -= 1;
                if *pending == 0 {
                    debug!(
                        channel = self.channel.raw(),
                        "burst request complete; steady-state delivery resumes"
                    );
                }
            }
            self.dispatcher.enqueue(SuperBuf {
                session: self.session,
                channel: self.channel,
                frame_idx,
                bufs,
            });
        }
    }

    fn requeue(&self, rejects: Vec<StreamBuf>) {
        for buf in rejects {
            (self.returner)(&buf);
        }
    }
}

struct BundleSetup {
    attr: BundleAttr,
    notify: SuperBufNotify,
}

struct BundleRuntime {
    engine: Arc<MatchEngine>,
    cmd: CmdThread<BufCmd>,
    dispatcher: CmdThread<SuperBuf>,
}

struct ChannelInner {
    state: ChannelState,
    bundle: Option<BundleSetup>,
    runtime: Option<BundleRuntime>,
    /// Streams owned by other channels, referenced here for matching only.
    linked: Vec<Arc<Stream>>,
}

/// An aggregate of streams started and stopped as a unit.
pub struct Channel {
    handle: Handle,
    session: Handle,
    port: Arc<dyn DevicePort>,
    poller: Arc<PollThread>,
    ipc: Arc<SessionIpc>,
    pool: BufPool,
    counters: Arc<MatchCounters>,
    streams: HandleArena<Arc<Stream>>,
    inner: Mutex<ChannelInner>,
}

impl Channel {
    pub(crate) fn new(
        handle: Handle,
        session: Handle,
        port: Arc<dyn DevicePort>,
        poller: Arc<PollThread>,
        ipc: Arc<SessionIpc>,
        pool: BufPool,
        counters: Arc<MatchCounters>,
    ) -> Self {
        Channel {
            handle,
            session,
            port,
            poller,
            ipc,
            pool,
            counters,
            streams: HandleArena::new(MAX_STREAMS_PER_CHANNEL),
            inner: Mutex::new(ChannelInner {
                state: ChannelState::Stopped,
                bundle: None,
                runtime: None,
                linked: Vec::new(),
            }),
        }
    }

    pub fn handle(&self) -> Handle {
        self.handle
    }

    pub fn state(&self) -> ChannelState {
        self.inner.lock().state
    }

    /// Allocate a stream slot. No hardware buffers are allocated yet.
    pub fn add_stream(&self) -> Result<Handle, CamError> {
        let inner = self.inner.lock();
        self.require_stopped(&inner, "add_stream")?;
        let port = self.port.clone();
        let ipc = self.ipc.clone();
        let pool = self.pool.clone();
        let channel = self.handle;
        self.streams
            .insert_with(|handle| Arc::new(Stream::new(handle, channel, port, ipc, pool)))
            .ok_or(CamError::TableFull)
    }

    /// Configure a stream (format, geometry, buffer count).
    pub fn config_stream(&self, stream: Handle, config: StreamConfig) -> Result<(), CamError> {
        let inner = self.inner.lock();
        self.require_stopped(&inner, "config_stream")?;
        let stream = self.streams.get(stream).ok_or(CamError::InvalidHandle)?;
        stream.configure(config)
    }

    /// Delete a stopped stream.
    pub fn del_stream(&self, stream: Handle) -> Result<(), CamError> {
        let inner = self.inner.lock();
        self.require_stopped(&inner, "del_stream")?;
        let target = self.streams.get(stream).ok_or(CamError::InvalidHandle)?;
        target.release()?;
        self.streams.remove(stream);
        Ok(())
    }

    /// Resolve a stream handle.
    pub fn stream(&self, stream: Handle) -> Result<Arc<Stream>, CamError> {
        self.streams.get(stream).ok_or(CamError::InvalidHandle)
    }

    /// Reference a stream owned by another channel in this channel's
    /// matching. The stream is never started/stopped/deleted from here.
    pub fn link_stream(&self, stream: Arc<Stream>) -> Result<(), CamError> {
        let mut inner = self.inner.lock();
        self.require_stopped(&inner, "link_stream")?;
        if inner.linked.iter().any(|s| s.handle() == stream.handle()) {
            return Ok(());
        }
        inner.linked.push(stream);
        Ok(())
    }

    /// Drop a linked-stream reference.
    pub fn unlink_stream(&self, stream: Handle) -> Result<(), CamError> {
        let mut inner = self.inner.lock();
        self.require_stopped(&inner, "unlink_stream")?;
        inner.linked.retain(|s| s.handle() != stream);
        Ok(())
    }

    /// Configure bundling: notify mode, eviction tuning and the callback.
    pub fn init_bundle(&self, attr: BundleAttr, notify: SuperBufNotify) -> Result<(), CamError> {
        let mut inner = self.inner.lock();
        self.require_stopped(&inner, "init_bundle")?;
        inner.bundle = Some(BundleSetup { attr, notify });
        Ok(())
    }

    /// Remove the bundle configuration.
    pub fn destroy_bundle(&self) -> Result<(), CamError> {
        let mut inner = self.inner.lock();
        self.require_stopped(&inner, "destroy_bundle")?;
        inner.bundle = None;
        Ok(())
    }

    /// Start every stream in the channel. Fails (and rolls back partial
    /// starts) if any member stream fails; a started channel is a success
    /// no-op.
    pub fn start(&self) -> Result<(), CamError> {
        let mut inner = self.inner.lock();
        if matches!(inner.state, ChannelState::Active) {
            debug!(channel = self.handle.raw(), "channel already started");
            return Ok(());
        }
        let mut owned: Vec<Arc<Stream>> = self
            .streams
            .snapshot()
            .into_iter()
            .map(|(_, stream)| stream)
            .collect();
        if owned.is_empty() {
            return Err(CamError::NoStreams);
        }
        let bundle = inner.bundle.as_ref().ok_or(CamError::NoBundle)?;

        // Metadata first: its frames steer matching for the others.
        owned.sort_by_key(|s| match s.stream_type() {
            Some(StreamType::Metadata) => 0,
            _ => 1,
        });

        let mut bundled: SmallVec<[Handle; 4]> = owned.iter().map(|s| s.handle()).collect();
        for linked in &inner.linked {
            bundled.push(linked.handle());
        }

        let runtime = self.launch_runtime(bundle, bundled, &owned, &inner.linked)?;
        let sender = runtime.cmd.sender();

        let mut started: Vec<Arc<Stream>> = Vec::new();
        let mut failure: Option<CamError> = None;
        for stream in &owned {
            let data_sink = self.data_sink(&sender);
            let result = stream.ensure_ready().and_then(|_| stream.start(data_sink));
            match result {
                Ok(data_fd) => {
                    let target = stream.clone();
                    self.poller.add_fd(
                        stream.handle(),
                        data_fd,
                        Arc::new(move |_, readiness| {
                            if readiness == Readiness::Readable {
                                target.on_data();
                            }
                        }),
                        CallMode::Sync,
                    );
                    started.push(stream.clone());
                }
                Err(err) => {
                    error!(
                        channel = self.handle.raw(),
                        stream = stream.handle().raw(),
                        %err,
                        "stream start failed"
                    );
                    failure = Some(err);
                    break;
                }
            }
        }

        if let Some(err) = failure {
            warn!(channel = self.handle.raw(), "rolling back partial start");
            for stream in started {
                self.poller.remove_fd(stream.handle(), CallMode::Sync);
                if let Err(stop_err) = stream.stop() {
                    warn!(stream = stream.handle().raw(), %stop_err, "rollback stop failed");
                }
            }
            // Dropping the runtime joins both worker threads.
            drop(runtime);
            return Err(err);
        }

        for linked in &inner.linked {
            linked.set_linked_sink(Some(self.data_sink(&sender)));
        }
        inner.runtime = Some(runtime);
        inner.state = ChannelState::Active;
        info!(
            channel = self.handle.raw(),
            streams = owned.len(),
            linked = inner.linked.len(),
            "channel started"
        );
        Ok(())
    }

    /// Stop every stream and flush the matching queue. A stopped channel
    /// is a success no-op.
    pub fn stop(&self) -> Result<(), CamError> {
        let mut inner = self.inner.lock();
        if matches!(inner.state, ChannelState::Stopped) {
            debug!(channel = self.handle.raw(), "channel already stopped");
            return Ok(());
        }
        for (_, stream) in self.streams.snapshot() {
            self.poller.remove_fd(stream.handle(), CallMode::Sync);
            if let Err(err) = stream.stop() {
                warn!(stream = stream.handle().raw(), %err, "stream stop failed");
            }
        }
        for linked in &inner.linked {
            linked.set_linked_sink(None);
        }
        if let Some(runtime) = inner.runtime.take() {
            // Drain in-flight matching work, flush what is left, then let
            // the dispatcher drain its already-matched deliveries.
            runtime.cmd.shutdown();
            let mut rejects = Vec::new();
            runtime.engine.queue.lock().flush(None, &mut rejects);
            runtime.engine.requeue(rejects);
            runtime.dispatcher.shutdown();
        }
        inner.state = ChannelState::Stopped;
        info!(channel = self.handle.raw(), "channel stopped");
        Ok(())
    }

    /// Ask for exactly `count` matched frames in burst mode. `count` of
    /// zero cancels like [`Channel::cancel_super_buf_request`].
    pub fn request_super_buf(&self, count: u32) -> Result<(), CamError> {
        let inner = self.inner.lock();
        let runtime = self.require_runtime(&inner, "request_super_buf")?;
        if count == 0 {
            runtime.cmd.sender().enqueue(BufCmd::CancelRequest);
        } else {
            runtime
                .cmd
                .sender()
                .enqueue(BufCmd::RequestSuperBuf { count });
        }
        Ok(())
    }

    /// Abort an outstanding burst request.
    pub fn cancel_super_buf_request(&self) -> Result<(), CamError> {
        self.request_super_buf(0)
    }

    /// Discard all queued/matching state up to `frame_idx` (e.g. after an
    /// autofocus move made queued frames stale).
    pub fn flush_super_buf_queue(&self, frame_idx: u64) -> Result<(), CamError> {
        let inner = self.inner.lock();
        let runtime = self.require_runtime(&inner, "flush_super_buf_queue")?;
        runtime
            .cmd
            .sender()
            .enqueue(BufCmd::Flush { up_to: frame_idx });
        Ok(())
    }

    /// Change the steady-state notify mode.
    pub fn set_notify_mode(&self, mode: NotifyMode) -> Result<(), CamError> {
        let mut inner = self.inner.lock();
        if let Some(runtime) = inner.runtime.as_ref() {
            runtime.cmd.sender().enqueue(BufCmd::ConfigNotify(mode));
        } else if let Some(bundle) = inner.bundle.as_mut() {
            bundle.attr.notify_mode = mode;
        } else {
            return Err(CamError::NoBundle);
        }
        Ok(())
    }

    /// Return a delivered buffer to the hardware.
    ///
    /// Legal from callback context: resolves only the stream table, never
    /// the channel lock.
    pub fn return_buf(&self, stream: Handle, buf_index: u32) -> Result<(), CamError> {
        if let Some(owner) = self
            .streams
            .snapshot()
            .into_iter()
            .map(|(_, s)| s)
            .find(|s| s.handle() == stream)
        {
            return owner.return_buf(buf_index);
        }
        let linked = {
            let inner = self.inner.lock();
            inner
                .linked
                .iter()
                .find(|s| s.handle() == stream)
                .cloned()
        };
        match linked {
            Some(stream) => stream.return_buf(buf_index),
            None => Err(CamError::InvalidHandle),
        }
    }

    /// Tear down for deletion: a live stream here is a bug in the caller's
    /// sequencing, reported loudly rather than silently ignored.
    pub(crate) fn teardown(&self) {
        if matches!(self.state(), ChannelState::Active) {
            error!(
                channel = self.handle.raw(),
                "deleting an active channel; stopping first (caller bug)"
            );
            if let Err(err) = self.stop() {
                warn!(channel = self.handle.raw(), %err, "stop during teardown failed");
            }
        }
        for (handle, stream) in self.streams.snapshot() {
            error!(
                channel = self.handle.raw(),
                stream = handle.raw(),
                "stream still present at channel delete (caller bug)"
            );
            if let Err(err) = stream.release() {
                warn!(stream = handle.raw(), %err, "stream release failed");
            }
            self.streams.remove(handle);
        }
        let mut inner = self.inner.lock();
        inner.linked.clear();
        inner.bundle = None;
    }

    fn launch_runtime(
        &self,
        bundle: &BundleSetup,
        bundled: SmallVec<[Handle; 4]>,
        owned: &[Arc<Stream>],
        linked: &[Arc<Stream>],
    ) -> Result<BundleRuntime, CamError> {
        let notify = bundle.notify.clone();
        let dispatcher = CmdThread::launch("cam-superbuf-cb", move |superbuf: SuperBuf| {
            notify(superbuf);
        })?;

        let mut by_handle: HashMap<Handle, Arc<Stream>> = HashMap::new();
        for stream in owned.iter().chain(linked.iter()) {
            by_handle.insert(stream.handle(), stream.clone());
        }
        let returner = Arc::new(move |buf: &StreamBuf| {
            if let Some(stream) = by_handle.get(&buf.stream) {
                if let Err(err) = stream.return_buf(buf.buf_index) {
                    warn!(stream = buf.stream.raw(), %err, "buffer requeue failed");
                }
            }
        });

        let engine = Arc::new(MatchEngine {
            session: self.session,
            channel: self.handle,
            queue: Mutex::new(MatchQueue::new(
                bundle.attr,
                bundled,
                self.counters.clone(),
            )),
            pending_cnt: Mutex::new(0),
            dispatcher: dispatcher.sender(),
            returner,
            counters: self.counters.clone(),
        });
        let worker = engine.clone();
        let cmd = CmdThread::launch("cam-superbuf", move |cmd: BufCmd| worker.process(cmd))?;
        Ok(BundleRuntime {
            engine,
            cmd,
            dispatcher,
        })
    }

    fn data_sink(&self, sender: &CmdSender<BufCmd>) -> FrameSink {
        let sender = sender.clone();
        Arc::new(move |buf: StreamBuf| {
            sender.enqueue(BufCmd::Data(buf));
        })
    }

    fn require_stopped(&self, inner: &ChannelInner, op: &'static str) -> Result<(), CamError> {
        match inner.state {
            ChannelState::Stopped => Ok(()),
            state => Err(CamError::InvalidState {
                op,
                state: state.name(),
            }),
        }
    }

    fn require_runtime<'a>(
        &self,
        inner: &'a ChannelInner,
        op: &'static str,
    ) -> Result<&'a BundleRuntime, CamError> {
        match inner.state {
            ChannelState::Active => inner.runtime.as_ref().ok_or(CamError::NoBundle),
            state => Err(CamError::InvalidState {
                op,
                state: state.name(),
            }),
        }
    }
}
