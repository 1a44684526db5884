//! Fixed-layout control packets for the mapping socket.
//!
//! Every datagram is exactly [`ControlPacket::WIRE_SIZE`] bytes: a message
//! tag, a target payload identifying the buffer slot/plane, and (for maps)
//! the buffer size. All fields are little-endian. The layout is shared
//! with the server process, so it never changes shape per variant — unused
//! fields are sent as zero.

const TAG_MAP_FD: u32 = 1;
const TAG_UNMAP_FD: u32 = 2;

const TARGET_SESSION: u32 = 1;
const TARGET_STREAM: u32 = 2;

/// Session-scope buffers mappable to the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionBufKind {
    /// Capability query result buffer.
    Capability,
    /// Parameter blob written by the client, read by the server.
    SetParm,
    /// Parameter blob written by the server, read by the client.
    GetParm,
}

impl SessionBufKind {
    fn to_wire(self) -> u32 {
        match self {
            SessionBufKind::Capability => 1,
            SessionBufKind::SetParm => 2,
            SessionBufKind::GetParm => 3,
        }
    }

    fn from_wire(raw: u32) -> Result<Self, PacketError> {
        match raw {
            1 => Ok(SessionBufKind::Capability),
            2 => Ok(SessionBufKind::SetParm),
            3 => Ok(SessionBufKind::GetParm),
            other => Err(PacketError::UnknownBufKind(other)),
        }
    }
}

/// Stream-scope buffers mappable to the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamBufKind {
    /// A frame buffer plane.
    Frame,
    /// The per-stream info/config block.
    StreamInfo,
}

impl StreamBufKind {
    fn to_wire(self) -> u32 {
        match self {
            StreamBufKind::Frame => 1,
            StreamBufKind::StreamInfo => 2,
        }
    }

    fn from_wire(raw: u32) -> Result<Self, PacketError> {
        match raw {
            1 => Ok(StreamBufKind::Frame),
            2 => Ok(StreamBufKind::StreamInfo),
            other => Err(PacketError::UnknownBufKind(other)),
        }
    }
}

/// Which buffer slot a map/unmap addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MapTarget {
    /// Session-level buffer (capability, parameter blobs).
    Session { kind: SessionBufKind },
    /// Per-stream buffer plane.
    Stream {
        channel: u32,
        stream: u32,
        kind: StreamBufKind,
        buf_index: u32,
        plane_index: u32,
    },
}

/// A control message on the mapping socket.
///
/// # Example
/// ```rust
/// use charon_ipc::packet::{ControlPacket, MapTarget, SessionBufKind};
///
/// let packet = ControlPacket::MapFd {
///     target: MapTarget::Session { kind: SessionBufKind::Capability },
///     size: 4096,
/// };
/// let wire = packet.encode();
/// assert_eq!(ControlPacket::decode(&wire).unwrap(), packet);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlPacket {
    /// Share a buffer fd with the server (fd travels as ancillary data).
    MapFd { target: MapTarget, size: u64 },
    /// Revoke a previously mapped buffer.
    UnmapFd { target: MapTarget },
}

/// Decode failure for a control packet.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PacketError {
    #[error("packet truncated: {0} bytes")]
    Truncated(usize),
    #[error("unknown message tag {0}")]
    UnknownTag(u32),
    #[error("unknown target kind {0}")]
    UnknownTarget(u32),
    #[error("unknown buffer kind {0}")]
    UnknownBufKind(u32),
}

impl ControlPacket {
    /// Fixed datagram size.
    pub const WIRE_SIZE: usize = 40;

    /// Encode into the fixed wire layout.
    pub fn encode(&self) -> [u8; Self::WIRE_SIZE] {
        let mut wire = [0u8; Self::WIRE_SIZE];
        let (tag, target, size) = match self {
            ControlPacket::MapFd { target, size } => (TAG_MAP_FD, target, *size),
            ControlPacket::UnmapFd { target } => (TAG_UNMAP_FD, target, 0),
        };
        wire[0..4].copy_from_slice(&tag.to_le_bytes());
        match target {
            MapTarget::Session { kind } => {
                wire[4..8].copy_from_slice(&TARGET_SESSION.to_le_bytes());
                wire[8..12].copy_from_slice(&kind.to_wire().to_le_bytes());
            }
            MapTarget::Stream {
                channel,
                stream,
                kind,
                buf_index,
                plane_index,
            } => {
                wire[4..8].copy_from_slice(&TARGET_STREAM.to_le_bytes());
                wire[8..12].copy_from_slice(&kind.to_wire().to_le_bytes());
                wire[12..16].copy_from_slice(&channel.to_le_bytes());
                wire[16..20].copy_from_slice(&stream.to_le_bytes());
                wire[20..24].copy_from_slice(&buf_index.to_le_bytes());
                wire[24..28].copy_from_slice(&plane_index.to_le_bytes());
            }
        }
        wire[28..36].copy_from_slice(&size.to_le_bytes());
        wire
    }

    /// Decode from a received datagram.
    pub fn decode(wire: &[u8]) -> Result<Self, PacketError> {
        if wire.len() < Self::WIRE_SIZE {
            return Err(PacketError::Truncated(wire.len()));
        }
        let tag = read_u32(wire, 0);
        let target_kind = read_u32(wire, 4);
        let target = match target_kind {
            TARGET_SESSION => MapTarget::Session {
                kind: SessionBufKind::from_wire(read_u32(wire, 8))?,
            },
            TARGET_STREAM => MapTarget::Stream {
                kind: StreamBufKind::from_wire(read_u32(wire, 8))?,
                channel: read_u32(wire, 12),
                stream: read_u32(wire, 16),
                buf_index: read_u32(wire, 20),
                plane_index: read_u32(wire, 24),
            },
            other => return Err(PacketError::UnknownTarget(other)),
        };
        let size = read_u64(wire, 28);
        match tag {
            TAG_MAP_FD => Ok(ControlPacket::MapFd { target, size }),
            TAG_UNMAP_FD => Ok(ControlPacket::UnmapFd { target }),
            other => Err(PacketError::UnknownTag(other)),
        }
    }
}

fn read_u32(wire: &[u8], offset: usize) -> u32 {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&wire[offset..offset + 4]);
    u32::from_le_bytes(bytes)
}

fn read_u64(wire: &[u8], offset: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&wire[offset..offset + 8]);
    u64::from_le_bytes(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_map_round_trips() {
        let packet = ControlPacket::MapFd {
            target: MapTarget::Stream {
                channel: 0x201,
                stream: 0x302,
                kind: StreamBufKind::Frame,
                buf_index: 5,
                plane_index: 1,
            },
            size: 3 * 1920 * 1080,
        };
        assert_eq!(ControlPacket::decode(&packet.encode()).unwrap(), packet);
    }

    #[test]
    fn unmap_carries_zero_size() {
        let packet = ControlPacket::UnmapFd {
            target: MapTarget::Session {
                kind: SessionBufKind::SetParm,
            },
        };
        let wire = packet.encode();
        assert_eq!(&wire[28..36], &[0u8; 8]);
        assert_eq!(ControlPacket::decode(&wire).unwrap(), packet);
    }

    #[test]
    fn truncated_and_unknown_fields_are_rejected() {
        let packet = ControlPacket::UnmapFd {
            target: MapTarget::Session {
                kind: SessionBufKind::GetParm,
            },
        };
        let mut wire = packet.encode();
        assert_eq!(
            ControlPacket::decode(&wire[..10]),
            Err(PacketError::Truncated(10))
        );
        wire[0..4].copy_from_slice(&99u32.to_le_bytes());
        assert_eq!(ControlPacket::decode(&wire), Err(PacketError::UnknownTag(99)));
    }
}
