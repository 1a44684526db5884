#![doc = include_str!("../README.md")]

pub use charon_core as core;
pub use charon_ipc as ipc;
pub use charon_mem as mem;

pub mod bundle;
pub mod channel;
mod error;
pub mod event;
pub mod port;
pub mod registry;
pub mod session;
pub mod stream;
pub mod vport;

pub use error::CamError;

pub mod prelude {
    pub use crate::bundle::{BundleAttr, NotifyMode, StreamBuf, SuperBuf, SuperBufNotify};
    pub use crate::channel::{Channel, ChannelState, MAX_STREAMS_PER_CHANNEL};
    pub use crate::event::{EventClass, EventKind, EventNotify, EventToken};
    pub use crate::port::{BufDesc, Capability, DevicePort, PortEvent, ServerStream};
    pub use crate::registry::CameraRegistry;
    pub use crate::session::{CameraSession, MAX_CHANNELS, MAP_TIMEOUT};
    pub use crate::stream::{FrameSink, Stream, StreamConfig};
    pub use crate::vport::VirtualPort;
    pub use crate::CamError;
    pub use charon_core::prelude::*;
    pub use charon_ipc::packet::SessionBufKind;
    pub use charon_mem::{BufPool, BufferOwner, CacheOp, MemoryHandle};
}
