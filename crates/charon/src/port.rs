//! The seam to the vendor kernel/daemon.
//!
//! Everything below the control plane — the control device's event queue,
//! vendor-private controls, stream start/stop and buffer queueing, plus
//! the server end of the mapping socket — sits behind [`DevicePort`]. The
//! production implementation wraps the vendor device node; [`VirtualPort`]
//! implements the same contract in-process for tests and bring-up.
//!
//! [`VirtualPort`]: crate::vport::VirtualPort

use std::os::fd::{OwnedFd, RawFd};

use charon_ipc::gate::MapStatus;
use charon_ipc::socket::CameraSocket;

use crate::error::CamError;
use crate::event::{EventClass, EventKind};
use crate::stream::StreamConfig;

/// Vendor-private control IDs carried over the control fd.
pub mod ctrl {
    /// Ask the server to fill the mapped capability buffer.
    pub const QUERY_CAPABILITY: u32 = 0x0800_0001;
    /// Ask the server to consume the mapped set-parameter blob.
    pub const SET_PARMS: u32 = 0x0800_0002;
    /// Ask the server to fill the mapped get-parameter blob.
    pub const GET_PARMS: u32 = 0x0800_0003;
}

/// One event dequeued from the control fd.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PortEvent {
    /// Completion of a map/unmap round-trip; consumed by the reply gate,
    /// never dispatched upward.
    MapDone { status: MapStatus },
    /// Ordinary notification for registered callbacks.
    Notify(EventKind),
}

/// Capability block the server writes into the mapped capability buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Capability {
    pub version: u32,
    pub max_channels: u32,
    pub max_streams_per_channel: u32,
    pub max_buffers_per_stream: u32,
}

impl Capability {
    /// Encoded size inside the capability buffer.
    pub const WIRE_SIZE: usize = 16;

    /// Encode into the mapped-buffer layout (little-endian).
    pub fn encode(&self) -> [u8; Self::WIRE_SIZE] {
        let mut wire = [0u8; Self::WIRE_SIZE];
        wire[0..4].copy_from_slice(&self.version.to_le_bytes());
        wire[4..8].copy_from_slice(&self.max_channels.to_le_bytes());
        wire[8..12].copy_from_slice(&self.max_streams_per_channel.to_le_bytes());
        wire[12..16].copy_from_slice(&self.max_buffers_per_stream.to_le_bytes());
        wire
    }

    /// Decode from the mapped-buffer layout.
    pub fn decode(wire: &[u8]) -> Option<Self> {
        if wire.len() < Self::WIRE_SIZE {
            return None;
        }
        let word = |at: usize| {
            let mut bytes = [0u8; 4];
            bytes.copy_from_slice(&wire[at..at + 4]);
            u32::from_le_bytes(bytes)
        };
        Some(Capability {
            version: word(0),
            max_channels: word(4),
            max_streams_per_channel: word(8),
            max_buffers_per_stream: word(12),
        })
    }
}

/// A dequeued buffer descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufDesc {
    /// Index into the stream's buffer set.
    pub buf_index: u32,
    /// Monotonically non-decreasing frame index from the source.
    pub frame_idx: u64,
    /// Source timestamp.
    pub ts_nanos: u64,
}

/// Server-side identity of an attached stream plus its data fd.
pub struct ServerStream {
    pub server_id: u32,
    /// Readable when a buffer is ready to dequeue. Ownership moves to the
    /// stream object for the poll thread's lifetime of the stream.
    pub data_fd: OwnedFd,
}

/// Downward interface to the kernel/daemon pair.
///
/// All methods may be called from any thread; implementations synchronize
/// internally. `dequeue_event` is only called after the control fd
/// signalled readiness.
pub trait DevicePort: Send + Sync {
    /// The control fd to register with the session's poll thread. The
    /// vendor node signals `POLLPRI`; in-process ports signal `POLLIN`.
    fn event_fd(&self) -> RawFd;

    /// Subscribe/unsubscribe one event class.
    fn subscribe(&self, class: EventClass, enable: bool) -> Result<(), CamError>;

    /// Dequeue the next pending event.
    fn dequeue_event(&self) -> Result<PortEvent, CamError>;

    /// Open the client end of the per-session mapping socket.
    fn open_socket(&self) -> Result<CameraSocket, CamError>;

    /// Write a vendor-private control; returns the (possibly updated)
    /// value.
    fn set_ctrl(&self, id: u32, value: i32) -> Result<i32, CamError>;

    /// Read a vendor-private control.
    fn get_ctrl(&self, id: u32) -> Result<i32, CamError>;

    /// Register a stream server-side, yielding its id and data fd.
    fn stream_attach(&self, config: &StreamConfig) -> Result<ServerStream, CamError>;

    /// Tear down a server-side stream.
    fn stream_detach(&self, server_id: u32) -> Result<(), CamError>;

    /// Start hardware delivery on a stream.
    fn stream_on(&self, server_id: u32) -> Result<(), CamError>;

    /// Stop hardware delivery on a stream.
    fn stream_off(&self, server_id: u32) -> Result<(), CamError>;

    /// Queue a buffer (by index) back to the hardware.
    fn qbuf(&self, server_id: u32, buf_index: u32) -> Result<(), CamError>;

    /// Dequeue the next ready buffer after data-fd readiness.
    fn dqbuf(&self, server_id: u32) -> Result<BufDesc, CamError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capability_round_trips() {
        let cap = Capability {
            version: 2,
            max_channels: 8,
            max_streams_per_channel: 4,
            max_buffers_per_stream: 16,
        };
        assert_eq!(Capability::decode(&cap.encode()), Some(cap));
        assert_eq!(Capability::decode(&[0u8; 3]), None);
    }
}
