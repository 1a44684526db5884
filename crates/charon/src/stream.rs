//! Stream: an endpoint bound to one hardware data source.
//!
//! A stream belongs to exactly one channel. It owns its buffer set (with
//! per-index camera/client ownership), its server-side attachment and its
//! on/off state. Buffer allocation for latency-insensitive stream types is
//! deferred from configuration to channel start, keeping start-of-preview
//! fast.

use std::os::fd::{AsRawFd, RawFd};
use std::sync::Arc;

use charon_core::format::{StreamFormat, StreamType};
use charon_core::handle::Handle;
use charon_ipc::packet::{MapTarget, StreamBufKind};
use charon_mem::{single_plane, BufPool, BufferOwner, BufferSet};
use parking_lot::Mutex;
use smallvec::SmallVec;
use tracing::{debug, warn};

use crate::bundle::StreamBuf;
use crate::error::CamError;
use crate::port::{DevicePort, ServerStream};
use crate::session::SessionIpc;

/// Frame sink: receives client-owned stream buffers.
pub type FrameSink = Arc<dyn Fn(StreamBuf) + Send + Sync>;

/// Per-stream configuration set while the owning channel is stopped.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct StreamConfig {
    pub stream_type: StreamType,
    pub format: StreamFormat,
    /// Buffers in the stream's set.
    pub buf_count: usize,
    /// Bytes per buffer; the caller computes this from the format.
    pub buf_size: usize,
}

impl StreamConfig {
    pub(crate) fn validate(&self) -> Result<(), CamError> {
        if self.buf_count == 0 || self.buf_count > 256 {
            return Err(CamError::InvalidConfig(format!(
                "buffer count {} out of range",
                self.buf_count
            )));
        }
        if self.buf_size == 0 {
            return Err(CamError::InvalidConfig("zero buffer size".into()));
        }
        Ok(())
    }
}

struct StreamInner {
    config: Option<StreamConfig>,
    server: Option<ServerStream>,
    bufs: Option<BufferSet>,
    mapped: bool,
    active: bool,
    primary_sink: Option<FrameSink>,
    linked_sink: Option<FrameSink>,
}

/// One data endpoint inside a channel.
pub struct Stream {
    handle: Handle,
    channel: Handle,
    port: Arc<dyn DevicePort>,
    ipc: Arc<SessionIpc>,
    pool: BufPool,
    // buf_lock: guards buffer/config state only; never nested inside the
    // channel lock on the data path.
    inner: Mutex<StreamInner>,
}

impl Stream {
    pub(crate) fn new(
        handle: Handle,
        channel: Handle,
        port: Arc<dyn DevicePort>,
        ipc: Arc<SessionIpc>,
        pool: BufPool,
    ) -> Self {
        Stream {
            handle,
            channel,
            port,
            ipc,
            pool,
            inner: Mutex::new(StreamInner {
                config: None,
                server: None,
                bufs: None,
                mapped: false,
                active: false,
                primary_sink: None,
                linked_sink: None,
            }),
        }
    }

    pub fn handle(&self) -> Handle {
        self.handle
    }

    pub fn is_active(&self) -> bool {
        self.inner.lock().active
    }

    /// Server-side stream id, once configured.
    pub fn server_id(&self) -> Option<u32> {
        self.inner.lock().server.as_ref().map(|s| s.server_id)
    }

    pub fn stream_type(&self) -> Option<StreamType> {
        self.inner.lock().config.as_ref().map(|c| c.stream_type)
    }

    pub fn format(&self) -> Option<StreamFormat> {
        self.inner.lock().config.as_ref().map(|c| c.format)
    }

    /// Configure (or reconfigure) the stream. Only legal while stopped.
    ///
    /// Attaches the stream server-side. Buffers are allocated and mapped
    /// here for immediate stream types; snapshot/metadata/raw defer both
    /// to channel start.
    pub(crate) fn configure(&self, config: StreamConfig) -> Result<(), CamError> {
        config.validate()?;
        let mut inner = self.inner.lock();
        if inner.active {
            return Err(CamError::InvalidState {
                op: "config_stream",
                state: "active",
            });
        }
        self.teardown_locked(&mut inner);
        let server = self.port.stream_attach(&config)?;
        debug!(
            stream = self.handle.raw(),
            server_id = server.server_id,
            ty = ?config.stream_type,
            "stream attached"
        );
        let defer = config.stream_type.defers_allocation();
        inner.server = Some(server);
        inner.config = Some(config);
        if !defer {
            self.ensure_buffers_locked(&mut inner)?;
            self.map_buffers_locked(&mut inner)?;
        }
        Ok(())
    }

    /// Make the stream deliverable: buffers allocated, mapped, and queued
    /// to the hardware. Runs at channel start (deferred-allocation path).
    pub(crate) fn ensure_ready(&self) -> Result<(), CamError> {
        let mut inner = self.inner.lock();
        if inner.config.is_none() {
            return Err(CamError::InvalidState {
                op: "start_stream",
                state: "unconfigured",
            });
        }
        self.ensure_buffers_locked(&mut inner)?;
        self.map_buffers_locked(&mut inner)?;
        self.queue_all_locked(&mut inner)?;
        Ok(())
    }

    /// Turn hardware delivery on, idempotently. Returns the data fd for
    /// poll registration.
    pub(crate) fn start(&self, sink: FrameSink) -> Result<RawFd, CamError> {
        let mut inner = self.inner.lock();
        let server = inner.server.as_ref().ok_or(CamError::InvalidState {
            op: "start_stream",
            state: "unconfigured",
        })?;
        let server_id = server.server_id;
        let data_fd = server.data_fd.as_raw_fd();
        if inner.active {
            debug!(stream = self.handle.raw(), "stream already started");
            return Ok(data_fd);
        }
        inner.primary_sink = Some(sink);
        self.port.stream_on(server_id)?;
        inner.active = true;
        Ok(data_fd)
    }

    /// Turn hardware delivery off. A stopped stream is a success no-op.
    pub(crate) fn stop(&self) -> Result<(), CamError> {
        let mut inner = self.inner.lock();
        if !inner.active {
            debug!(stream = self.handle.raw(), "stream already stopped");
            return Ok(());
        }
        let server_id = inner
            .server
            .as_ref()
            .map(|s| s.server_id)
            .ok_or(CamError::InvalidHandle)?;
        self.port.stream_off(server_id)?;
        inner.active = false;
        inner.primary_sink = None;
        Ok(())
    }

    /// Install/remove the sink of a channel this stream is linked into.
    pub(crate) fn set_linked_sink(&self, sink: Option<FrameSink>) {
        self.inner.lock().linked_sink = sink;
    }

    /// Return a client-owned buffer to the hardware.
    ///
    /// Runs in data-callback context too; the channel lock is deliberately
    /// not taken anywhere on this path.
    pub fn return_buf(&self, buf_index: u32) -> Result<(), CamError> {
        let mut inner = self.inner.lock();
        let server_id = inner
            .server
            .as_ref()
            .map(|s| s.server_id)
            .ok_or(CamError::InvalidHandle)?;
        if let Some(bufs) = inner.bufs.as_mut() {
            bufs.set_owner(buf_index as usize, BufferOwner::Camera)?;
        }
        self.port.qbuf(server_id, buf_index)
    }

    /// Data-fd readiness: dequeue one buffer and hand it to the sinks.
    pub(crate) fn on_data(&self) {
        let mut inner = self.inner.lock();
        let Some(server_id) = inner.server.as_ref().map(|s| s.server_id) else {
            return;
        };
        let desc = match self.port.dqbuf(server_id) {
            Ok(desc) => desc,
            Err(CamError::Starved) => return,
            Err(err) => {
                warn!(stream = self.handle.raw(), %err, "dqbuf failed");
                return;
            }
        };
        let stream_type = inner
            .config
            .as_ref()
            .map(|c| c.stream_type)
            .unwrap_or(StreamType::Preview);
        let Some(bufs) = inner.bufs.as_mut() else {
            return;
        };
        if let Err(err) = bufs.set_owner(desc.buf_index as usize, BufferOwner::Client) {
            warn!(stream = self.handle.raw(), %err, "dequeued unknown buffer index");
            return;
        }
        let memory = match bufs.memory_handle(
            desc.buf_index as usize,
            matches!(stream_type, StreamType::Metadata),
        ) {
            Ok(memory) => memory,
            Err(err) => {
                warn!(stream = self.handle.raw(), %err, "no memory handle for buffer");
                return;
            }
        };
        let buf = StreamBuf {
            stream: self.handle,
            stream_type,
            buf_index: desc.buf_index,
            frame_idx: desc.frame_idx,
            ts_nanos: desc.ts_nanos,
            memory,
        };
        let mut sinks: SmallVec<[FrameSink; 2]> = SmallVec::new();
        if let Some(sink) = inner.primary_sink.as_ref() {
            sinks.push(sink.clone());
        }
        if let Some(sink) = inner.linked_sink.as_ref() {
            sinks.push(sink.clone());
        }
        drop(inner);
        for sink in sinks {
            sink(buf.clone());
        }
    }

    /// Tear the stream down for deletion. Requires the stream stopped.
    pub(crate) fn release(&self) -> Result<(), CamError> {
        let mut inner = self.inner.lock();
        if inner.active {
            return Err(CamError::InvalidState {
                op: "del_stream",
                state: "active",
            });
        }
        if inner.config.is_none() {
            // Deinit before init: a detected bug condition, kept forgiving
            // for redundant teardown calls from upper layers.
            warn!(stream = self.handle.raw(), "releasing an unconfigured stream");
        }
        self.teardown_locked(&mut inner);
        Ok(())
    }

    fn ensure_buffers_locked(&self, inner: &mut StreamInner) -> Result<(), CamError> {
        if inner.bufs.is_some() {
            return Ok(());
        }
        let config = inner.config.as_ref().ok_or(CamError::InvalidState {
            op: "alloc_buffers",
            state: "unconfigured",
        })?;
        let stride = config.format.resolution.width.get() as usize;
        let set = BufferSet::allocate(
            &self.pool,
            "stream-buf",
            config.buf_count,
            config.buf_size,
            single_plane(config.buf_size, stride),
        )?;
        debug!(
            stream = self.handle.raw(),
            count = config.buf_count,
            size = config.buf_size,
            "stream buffers allocated"
        );
        inner.bufs = Some(set);
        Ok(())
    }

    fn map_buffers_locked(&self, inner: &mut StreamInner) -> Result<(), CamError> {
        if inner.mapped {
            return Ok(());
        }
        let Some(bufs) = inner.bufs.as_ref() else {
            return Err(CamError::InvalidState {
                op: "map_stream_buf",
                state: "unallocated",
            });
        };
        for index in 0..bufs.len() {
            let target = self.frame_target(index as u32);
            let size = bufs.size(index)? as u64;
            let result = self.ipc.map_fd(target, bufs.fd(index)?, size);
            if let Err(err) = result {
                // Roll back mappings installed so far; the server may or
                // may not have seen the failed one.
                for undo in (0..index).rev() {
                    let _ = self.ipc.unmap_fd(self.frame_target(undo as u32));
                }
                return Err(err.into());
            }
        }
        inner.mapped = true;
        Ok(())
    }

    fn unmap_buffers_locked(&self, inner: &mut StreamInner) {
        if !inner.mapped {
            return;
        }
        let count = inner.bufs.as_ref().map(|b| b.len()).unwrap_or(0);
        for index in 0..count {
            if let Err(err) = self.ipc.unmap_fd(self.frame_target(index as u32)) {
                warn!(stream = self.handle.raw(), %err, "unmap_stream_buf failed");
            }
        }
        inner.mapped = false;
    }

    fn queue_all_locked(&self, inner: &mut StreamInner) -> Result<(), CamError> {
        let server_id = inner
            .server
            .as_ref()
            .map(|s| s.server_id)
            .ok_or(CamError::InvalidHandle)?;
        let Some(bufs) = inner.bufs.as_mut() else {
            return Ok(());
        };
        for index in 0..bufs.len() {
            if bufs.owner(index)? == BufferOwner::Camera {
                self.port.qbuf(server_id, index as u32)?;
            }
        }
        Ok(())
    }

    fn teardown_locked(&self, inner: &mut StreamInner) {
        self.unmap_buffers_locked(inner);
        inner.bufs = None;
        if let Some(server) = inner.server.take() {
            if let Err(err) = self.port.stream_detach(server.server_id) {
                warn!(stream = self.handle.raw(), %err, "stream detach failed");
            }
        }
        inner.config = None;
        inner.primary_sink = None;
        inner.linked_sink = None;
    }

    fn frame_target(&self, buf_index: u32) -> MapTarget {
        MapTarget::Stream {
            channel: self.channel.raw(),
            stream: self.handle.raw(),
            kind: StreamBufKind::Frame,
            buf_index,
            plane_index: 0,
        }
    }
}
