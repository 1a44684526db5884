//! Camera session: control fd, mapping socket, channel table, event
//! dispatch and per-session threads.
//!
//! One session exists per open camera index. It runs three threads: the
//! poll thread (control fd + every started stream's data fd), the event
//! dispatch thread (runs registered callbacks off the poll thread), and
//! the async-command thread (teardown work that must not block the caller,
//! e.g. stops issued from a poll-thread callback).

use std::os::fd::BorrowedFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use charon_core::cmd::CmdThread;
use charon_core::handle::{Handle, HandleArena};
use charon_core::metrics::MatchCounters;
use charon_core::poll::{CallMode, PollNotify, PollThread};
use charon_ipc::gate::{MapGate, MapStatus};
use charon_ipc::packet::{ControlPacket, MapTarget, SessionBufKind};
use charon_ipc::socket::CameraSocket;
use charon_ipc::IpcError;
use charon_mem::{single_plane, BufPool, CacheOp, MappedBuf};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::channel::Channel;
use crate::error::CamError;
use crate::event::{EventClass, EventKind, EventNotify, EventToken};
use crate::port::{ctrl, Capability, DevicePort, PortEvent};

/// Channels per session.
pub const MAX_CHANNELS: usize = 8;
/// Event callback slots per session.
pub const MAX_EVENT_ENTRIES: usize = 8;
/// Deadline for one mapping round-trip. Unlike the original protocol, a
/// hung server fails the caller instead of parking it forever.
pub const MAP_TIMEOUT: Duration = Duration::from_secs(5);
/// Bounded retries for opening the device-side resources at session open.
pub const OPEN_TRIES: u32 = 20;
/// Fixed backoff between open attempts.
pub const OPEN_RETRY_SLEEP: Duration = Duration::from_millis(20);

const CAPABILITY_BUF_SIZE: usize = 4096;
const PARM_BUF_SIZE: usize = 8192;

/// Shared per-session IPC state: socket, reply gate and timeout.
pub struct SessionIpc {
    socket: CameraSocket,
    gate: MapGate,
    map_timeout: Duration,
}

impl SessionIpc {
    fn new(socket: CameraSocket) -> Self {
        SessionIpc {
            socket,
            gate: MapGate::new(),
            map_timeout: MAP_TIMEOUT,
        }
    }

    /// One gated map round-trip: packet + fd out, completion event back.
    pub(crate) fn map_fd(
        &self,
        target: MapTarget,
        fd: BorrowedFd<'_>,
        size: u64,
    ) -> Result<(), IpcError> {
        self.gate.round_trip(self.map_timeout, || {
            self.socket
                .send_packet(&ControlPacket::MapFd { target, size }, Some(fd))
        })
    }

    /// One gated unmap round-trip.
    pub(crate) fn unmap_fd(&self, target: MapTarget) -> Result<(), IpcError> {
        self.gate.round_trip(self.map_timeout, || {
            self.socket
                .send_packet(&ControlPacket::UnmapFd { target }, None)
        })
    }

    fn complete(&self, status: MapStatus) {
        self.gate.complete(status);
    }
}

struct CbEntry {
    token: u64,
    class: EventClass,
    notify: EventNotify,
}

struct CallbackTable {
    entries: Vec<Option<CbEntry>>,
    next_token: u64,
}

impl CallbackTable {
    fn class_count(&self, class: EventClass) -> usize {
        self.entries
            .iter()
            .flatten()
            .filter(|e| e.class == class)
            .count()
    }
}

#[derive(Default)]
struct SessionBufs {
    capability: Option<MappedBuf>,
    set_parm: Option<MappedBuf>,
    get_parm: Option<MappedBuf>,
}

enum AsyncJob {
    TeardownStreams { channel: Handle },
}

/// One open camera.
pub struct CameraSession {
    handle: Handle,
    index: usize,
    port: Arc<dyn DevicePort>,
    ipc: Arc<SessionIpc>,
    poller: Arc<PollThread>,
    pool: BufPool,
    counters: Arc<MatchCounters>,
    channels: Arc<HandleArena<Arc<Channel>>>,
    callbacks: Arc<Mutex<CallbackTable>>,
    dispatch: Mutex<Option<CmdThread<EventKind>>>,
    async_cmd: Mutex<Option<CmdThread<AsyncJob>>>,
    parm: Mutex<SessionBufs>,
    server_dead: Arc<AtomicBool>,
}

impl CameraSession {
    /// Open the session: socket (with bounded retries inside the
    /// transport), poll thread, dispatch thread, async thread, baseline
    /// event subscription.
    pub(crate) fn open(
        index: usize,
        handle: Handle,
        port: Arc<dyn DevicePort>,
    ) -> Result<Arc<CameraSession>, CamError> {
        // Transient I/O errors during bring-up (daemon still starting)
        // are retried a bounded number of times with fixed backoff.
        let socket = {
            let mut attempt = 0;
            loop {
                attempt += 1;
                match port.open_socket() {
                    Ok(socket) => break socket,
                    Err(err) if err.retryable() && attempt < OPEN_TRIES => {
                        debug!(index, attempt, %err, "socket open retry");
                        std::thread::sleep(OPEN_RETRY_SLEEP);
                    }
                    Err(err) => return Err(err),
                }
            }
        };
        let ipc = Arc::new(SessionIpc::new(socket));
        let counters = Arc::new(MatchCounters::default());
        let callbacks = Arc::new(Mutex::new(CallbackTable {
            entries: (0..MAX_EVENT_ENTRIES).map(|_| None).collect(),
            next_token: 1,
        }));
        let channels: Arc<HandleArena<Arc<Channel>>> = Arc::new(HandleArena::new(MAX_CHANNELS));
        let server_dead = Arc::new(AtomicBool::new(false));

        let poller = Arc::new(PollThread::launch("cam-poll")?);

        let dispatch_cbs = callbacks.clone();
        let dispatch_counters = counters.clone();
        let dispatch = CmdThread::launch("cam-dispatch", move |kind: EventKind| {
            dispatch_counters.event();
            let table = dispatch_cbs.lock();
            for entry in table.entries.iter().flatten() {
                let wanted = match kind.class() {
                    Some(class) => entry.class == class,
                    // Server death goes to everyone.
                    None => true,
                };
                if wanted {
                    (entry.notify)(handle, &kind);
                }
            }
        })?;

        let async_channels = channels.clone();
        let async_cmd = CmdThread::launch("cam-async", move |job: AsyncJob| match job {
            AsyncJob::TeardownStreams { channel } => match async_channels.get(channel) {
                Some(target) => {
                    if let Err(err) = target.stop() {
                        warn!(channel = channel.raw(), %err, "async stream teardown failed");
                    }
                }
                None => debug!(channel = channel.raw(), "async teardown raced channel delete"),
            },
        })?;

        // Control-fd readiness: map completions feed the reply gate; all
        // other events go to the dispatch thread. The vendor node raises
        // POLLPRI, the virtual port POLLIN; both land here.
        let evt_port = port.clone();
        let evt_ipc = ipc.clone();
        let evt_sender = dispatch.sender();
        let evt_dead = server_dead.clone();
        let control_cb: PollNotify = Arc::new(move |_, _| loop {
            match evt_port.dequeue_event() {
                Ok(PortEvent::MapDone { status }) => evt_ipc.complete(status),
                Ok(PortEvent::Notify(kind)) => {
                    if kind == EventKind::ServerDied {
                        evt_dead.store(true, Ordering::SeqCst);
                        // Fail any in-flight mapping wait too.
                        evt_ipc.complete(MapStatus::ServerDied);
                    }
                    evt_sender.enqueue(kind);
                }
                Err(CamError::Starved) => break,
                Err(err) => {
                    warn!(%err, "event dequeue failed");
                    break;
                }
            }
        });

        port.subscribe(EventClass::Info, true)?;
        poller.add_fd(handle, port.event_fd(), control_cb, CallMode::Sync);

        info!(index, handle = handle.raw(), "camera session opened");
        Ok(Arc::new(CameraSession {
            handle,
            index,
            port,
            ipc,
            poller,
            pool: BufPool::new(32),
            counters,
            channels,
            callbacks,
            dispatch: Mutex::new(Some(dispatch)),
            async_cmd: Mutex::new(Some(async_cmd)),
            parm: Mutex::new(SessionBufs::default()),
            server_dead,
        }))
    }

    pub fn handle(&self) -> Handle {
        self.handle
    }

    pub fn index(&self) -> usize {
        self.index
    }

    /// Matching/dispatch counters for observability.
    pub fn counters(&self) -> MatchCounters {
        (*self.counters).clone()
    }

    /// Add a channel; the new channel starts in the STOPPED state.
    pub fn add_channel(&self) -> Result<Handle, CamError> {
        let session = self.handle;
        let port = self.port.clone();
        let poller = self.poller.clone();
        let ipc = self.ipc.clone();
        let pool = self.pool.clone();
        let counters = self.counters.clone();
        self.channels
            .insert_with(|handle| {
                Arc::new(Channel::new(
                    handle, session, port, poller, ipc, pool, counters,
                ))
            })
            .ok_or(CamError::TableFull)
    }

    /// Resolve a channel handle. A miss is benign (shared-open peers may
    /// already have torn the channel down).
    pub fn channel(&self, handle: Handle) -> Result<Arc<Channel>, CamError> {
        self.channels.get(handle).ok_or(CamError::InvalidHandle)
    }

    /// Delete a channel. Live streams at this point are a caller bug and
    /// are reported, then torn down.
    pub fn del_channel(&self, handle: Handle) -> Result<(), CamError> {
        let channel = self.channels.get(handle).ok_or(CamError::InvalidHandle)?;
        channel.teardown();
        self.channels.remove(handle);
        Ok(())
    }

    /// Stop a channel's streams without blocking the caller; the actual
    /// stop runs on the session's async-command thread. Safe to call from
    /// poll-thread callbacks.
    pub fn async_teardown_streams(&self, channel: Handle) -> Result<(), CamError> {
        let guard = self.async_cmd.lock();
        match guard.as_ref() {
            Some(worker) => {
                worker.enqueue(AsyncJob::TeardownStreams { channel });
                Ok(())
            }
            None => Err(CamError::InvalidState {
                op: "async_teardown_streams",
                state: "closing",
            }),
        }
    }

    /// Register an event callback for one class. Crossing from zero to one
    /// registered callbacks of a class subscribes it with the kernel.
    pub fn register_event_notify(
        &self,
        class: EventClass,
        notify: EventNotify,
    ) -> Result<EventToken, CamError> {
        let (token, first_of_class) = {
            let mut table = self.callbacks.lock();
            let first = table.class_count(class) == 0;
            let slot = table
                .entries
                .iter()
                .position(|e| e.is_none())
                .ok_or(CamError::TableFull)?;
            let token = table.next_token;
            table.next_token += 1;
            table.entries[slot] = Some(CbEntry {
                token,
                class,
                notify,
            });
            (token, first)
        };
        if first_of_class {
            self.port.subscribe(class, true)?;
        }
        Ok(EventToken(token))
    }

    /// Unregister a callback. Crossing from one to zero for its class
    /// unsubscribes the class with the kernel.
    pub fn unregister_event_notify(&self, token: EventToken) -> Result<(), CamError> {
        let last_of_class = {
            let mut table = self.callbacks.lock();
            let slot = table
                .entries
                .iter()
                .position(|e| e.as_ref().is_some_and(|entry| entry.token == token.0))
                .ok_or(CamError::InvalidHandle)?;
            let class = table.entries[slot].as_ref().map(|e| e.class);
            table.entries[slot] = None;
            class.filter(|c| table.class_count(*c) == 0)
        };
        if let Some(class) = last_of_class {
            self.port.subscribe(class, false)?;
        }
        Ok(())
    }

    /// Map a session-scope buffer to the server.
    pub fn map_buf(
        &self,
        kind: SessionBufKind,
        fd: BorrowedFd<'_>,
        size: u64,
    ) -> Result<(), CamError> {
        if self.server_died() {
            return Err(CamError::Ipc(IpcError::ServerDied));
        }
        self.ipc
            .map_fd(MapTarget::Session { kind }, fd, size)
            .map_err(CamError::from)
    }

    /// Unmap a session-scope buffer.
    pub fn unmap_buf(&self, kind: SessionBufKind) -> Result<(), CamError> {
        self.ipc
            .unmap_fd(MapTarget::Session { kind })
            .map_err(CamError::from)
    }

    /// Query device capability through the mapped capability buffer: the
    /// server writes into its view of the shared memory, we read ours.
    pub fn query_capability(&self) -> Result<Capability, CamError> {
        let mut parm = self.parm.lock();
        if parm.capability.is_none() {
            let buf = MappedBuf::alloc(
                "cam-capability",
                CAPABILITY_BUF_SIZE,
                single_plane(CAPABILITY_BUF_SIZE, CAPABILITY_BUF_SIZE),
            )?;
            self.map_buf(
                SessionBufKind::Capability,
                buf.fd(),
                CAPABILITY_BUF_SIZE as u64,
            )?;
            parm.capability = Some(buf);
        }
        self.port.set_ctrl(ctrl::QUERY_CAPABILITY, 0)?;
        let buf = parm.capability.as_ref().ok_or(CamError::InvalidHandle)?;
        buf.cache_op(CacheOp::Invalidate)?;
        Capability::decode(buf.as_slice())
            .ok_or_else(|| CamError::Device("malformed capability block".into()))
    }

    /// Hand an opaque parameter blob to the server through the mapped
    /// set-parameter buffer.
    pub fn set_parms(&self, blob: &[u8]) -> Result<(), CamError> {
        if blob.len() > PARM_BUF_SIZE {
            return Err(CamError::InvalidConfig(format!(
                "parameter blob {} bytes exceeds buffer",
                blob.len()
            )));
        }
        let mut parm = self.parm.lock();
        if parm.set_parm.is_none() {
            let buf = MappedBuf::alloc(
                "cam-setparm",
                PARM_BUF_SIZE,
                single_plane(PARM_BUF_SIZE, PARM_BUF_SIZE),
            )?;
            self.map_buf(SessionBufKind::SetParm, buf.fd(), PARM_BUF_SIZE as u64)?;
            parm.set_parm = Some(buf);
        }
        let buf = parm.set_parm.as_mut().ok_or(CamError::InvalidHandle)?;
        buf.as_mut_slice()[..blob.len()].copy_from_slice(blob);
        buf.cache_op(CacheOp::Clean)?;
        self.port.set_ctrl(ctrl::SET_PARMS, blob.len() as i32)?;
        Ok(())
    }

    /// Fetch the server's current parameter blob through the mapped
    /// get-parameter buffer.
    pub fn get_parms(&self) -> Result<Vec<u8>, CamError> {
        let mut parm = self.parm.lock();
        if parm.get_parm.is_none() {
            let buf = MappedBuf::alloc(
                "cam-getparm",
                PARM_BUF_SIZE,
                single_plane(PARM_BUF_SIZE, PARM_BUF_SIZE),
            )?;
            self.map_buf(SessionBufKind::GetParm, buf.fd(), PARM_BUF_SIZE as u64)?;
            parm.get_parm = Some(buf);
        }
        let len = self.port.set_ctrl(ctrl::GET_PARMS, 0)?;
        let len = usize::try_from(len).unwrap_or(0).min(PARM_BUF_SIZE);
        let buf = parm.get_parm.as_ref().ok_or(CamError::InvalidHandle)?;
        buf.cache_op(CacheOp::Invalidate)?;
        Ok(buf.as_slice()[..len].to_vec())
    }

    /// Whether the server has been reported dead.
    pub fn server_died(&self) -> bool {
        self.server_dead.load(Ordering::SeqCst)
    }

    /// Full teardown; called by the registry when the last reference
    /// closes.
    pub(crate) fn shutdown(&self) {
        info!(index = self.index, handle = self.handle.raw(), "closing camera session");
        // Drain async teardown work while channels still resolve.
        if let Some(worker) = self.async_cmd.lock().take() {
            worker.shutdown();
        }
        for (handle, channel) in self.channels.snapshot() {
            warn!(
                channel = handle.raw(),
                "channel still present at session close"
            );
            channel.teardown();
            self.channels.remove(handle);
        }
        // Session-scope buffers: skip the unmap round-trips when the
        // server is gone, nobody would answer.
        if !self.server_died() {
            let parm = self.parm.lock();
            for (kind, buf) in [
                (SessionBufKind::Capability, &parm.capability),
                (SessionBufKind::SetParm, &parm.set_parm),
                (SessionBufKind::GetParm, &parm.get_parm),
            ] {
                if buf.is_some() {
                    if let Err(err) = self.ipc.unmap_fd(MapTarget::Session { kind }) {
                        warn!(?kind, %err, "session buffer unmap failed");
                    }
                }
            }
        }
        *self.parm.lock() = SessionBufs::default();
        if let Err(err) = self.port.subscribe(EventClass::Info, false) {
            warn!(%err, "baseline unsubscribe failed");
        }
        self.poller.remove_fd(self.handle, CallMode::Sync);
        // Poll thread first, then the dispatch thread, so nothing is
        // polled into a dispatcher that is already gone.
        self.poller.shutdown();
        if let Some(worker) = self.dispatch.lock().take() {
            worker.shutdown();
        }
    }
}
