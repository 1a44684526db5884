//! Virtual device port: the full [`DevicePort`] contract in-process.
//!
//! The virtual port stands in for the kernel/daemon pair: a real server
//! thread receives mapping packets (and their passed descriptors) on a
//! socketpair, events arrive through a real pipe the poll thread can wait
//! on, and every stream gets a pipe-backed data fd. Tests drive frame
//! delivery with [`VirtualPort::inject_frame`] and fault paths with
//! [`VirtualPort::fail_next_map`] / [`VirtualPort::kill_server`].

use std::collections::{HashMap, HashSet, VecDeque};
use std::fs::File;
use std::io::{Read, Write};
use std::os::fd::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use charon_ipc::gate::MapStatus;
use charon_ipc::packet::{ControlPacket, MapTarget, SessionBufKind};
use charon_ipc::socket::CameraSocket;
use charon_ipc::IpcError;
use nix::fcntl::OFlag;
use nix::sys::uio::{pread, pwrite};
use nix::unistd::pipe2;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::error::CamError;
use crate::event::{EventClass, EventKind};
use crate::port::{ctrl, BufDesc, Capability, DevicePort, PortEvent, ServerStream};
use crate::stream::StreamConfig;

struct VpStream {
    on: bool,
    /// Camera-owned buffer indices, in queueing order.
    queued: VecDeque<u32>,
    /// Injected frames awaiting dequeue.
    ready: VecDeque<BufDesc>,
    data_tx: File,
    /// Shares the open file description with the client's data fd, so a
    /// read here drains the readiness byte the client polled on.
    data_drain: File,
}

struct VpShared {
    capability: Capability,
    events: Mutex<VecDeque<PortEvent>>,
    event_tx: Mutex<File>,
    event_rx: Mutex<File>,
    event_rx_raw: RawFd,
    streams: Mutex<HashMap<u32, VpStream>>,
    next_stream_id: AtomicU32,
    mappings: Mutex<HashMap<MapTarget, MappedEntry>>,
    subscriptions: Mutex<HashSet<EventClass>>,
    ctrls: Mutex<HashMap<u32, i32>>,
    parms: Mutex<Vec<u8>>,
    fail_next_map: AtomicBool,
    stall_next_map: AtomicBool,
    dead: AtomicBool,
}

struct MappedEntry {
    fd: std::os::fd::OwnedFd,
    size: u64,
}

impl VpShared {
    fn post_event(&self, event: PortEvent) {
        self.events.lock().push_back(event);
        if let Err(err) = self.event_tx.lock().write_all(&[1]) {
            warn!(?err, "virtual port event pipe write failed");
        }
    }

    fn session_mapping_write(&self, kind: SessionBufKind, bytes: &[u8]) -> Result<(), CamError> {
        let mappings = self.mappings.lock();
        let entry = mappings
            .get(&MapTarget::Session { kind })
            .ok_or_else(|| CamError::Device(format!("{kind:?} buffer not mapped")))?;
        pwrite(&entry.fd, bytes, 0).map_err(|errno| CamError::Device(errno.to_string()))?;
        Ok(())
    }

    fn session_mapping_read(&self, kind: SessionBufKind, len: usize) -> Result<Vec<u8>, CamError> {
        let mappings = self.mappings.lock();
        let entry = mappings
            .get(&MapTarget::Session { kind })
            .ok_or_else(|| CamError::Device(format!("{kind:?} buffer not mapped")))?;
        let len = len.min(entry.size as usize);
        let mut bytes = vec![0u8; len];
        pread(&entry.fd, &mut bytes, 0).map_err(|errno| CamError::Device(errno.to_string()))?;
        Ok(bytes)
    }
}

/// In-process implementation of the whole device-port contract.
pub struct VirtualPort {
    shared: Arc<VpShared>,
}

impl VirtualPort {
    /// Create a port advertising the given capability.
    pub fn with_capability(capability: Capability) -> Result<Self, CamError> {
        // Nonblocking both ways: event dequeue must never park the poll
        // thread on a spurious wakeup.
        let (rx, tx) = pipe2(OFlag::O_NONBLOCK)
            .map_err(|errno| CamError::Device(format!("event pipe: {errno}")))?;
        let event_rx_raw = rx.as_raw_fd();
        Ok(VirtualPort {
            shared: Arc::new(VpShared {
                capability,
                events: Mutex::new(VecDeque::new()),
                event_tx: Mutex::new(File::from(tx)),
                event_rx: Mutex::new(File::from(rx)),
                event_rx_raw,
                streams: Mutex::new(HashMap::new()),
                next_stream_id: AtomicU32::new(1),
                mappings: Mutex::new(HashMap::new()),
                subscriptions: Mutex::new(HashSet::new()),
                ctrls: Mutex::new(HashMap::new()),
                parms: Mutex::new(Vec::new()),
                fail_next_map: AtomicBool::new(false),
                stall_next_map: AtomicBool::new(false),
                dead: AtomicBool::new(false),
            }),
        })
    }

    /// Create a port with a stock capability block.
    pub fn new() -> Result<Self, CamError> {
        Self::with_capability(Capability {
            version: 1,
            max_channels: 8,
            max_streams_per_channel: 8,
            max_buffers_per_stream: 16,
        })
    }

    // ---- test/bring-up drivers ------------------------------------------

    /// Deliver one frame on a started stream, consuming its oldest queued
    /// buffer.
    pub fn inject_frame(&self, server_id: u32, frame_idx: u64) -> Result<(), CamError> {
        let mut streams = self.shared.streams.lock();
        let stream = streams.get_mut(&server_id).ok_or(CamError::InvalidHandle)?;
        if !stream.on {
            return Err(CamError::InvalidState {
                op: "inject_frame",
                state: "stream off",
            });
        }
        let buf_index = stream.queued.pop_front().ok_or(CamError::Starved)?;
        stream.ready.push_back(BufDesc {
            buf_index,
            frame_idx,
            ts_nanos: frame_idx.wrapping_mul(33_333_333),
        });
        stream
            .data_tx
            .write_all(&[1])
            .map_err(|err| CamError::Device(format!("data pipe: {err}")))?;
        Ok(())
    }

    /// Queue an ordinary upward event.
    pub fn post_notify(&self, kind: EventKind) {
        self.shared.post_event(PortEvent::Notify(kind));
    }

    /// Make the next map/unmap request fail with a rejection status.
    pub fn fail_next_map(&self) {
        self.shared.fail_next_map.store(true, Ordering::SeqCst);
    }

    /// Swallow the next map/unmap request without answering, leaving the
    /// caller parked on the reply gate.
    pub fn stall_next_map(&self) {
        self.shared.stall_next_map.store(true, Ordering::SeqCst);
    }

    /// Simulate the server process dying: the mapping server stops
    /// answering and the distinguished death event is delivered.
    pub fn kill_server(&self) {
        self.shared.dead.store(true, Ordering::SeqCst);
        self.post_notify(EventKind::ServerDied);
    }

    /// Number of buffers currently mapped server-side.
    pub fn mapping_count(&self) -> usize {
        self.shared.mappings.lock().len()
    }

    /// Whether an event class is currently subscribed.
    pub fn is_subscribed(&self, class: EventClass) -> bool {
        self.shared.subscriptions.lock().contains(&class)
    }

    /// Camera-owned (queued) buffer count for a stream.
    pub fn queued_count(&self, server_id: u32) -> usize {
        self.shared
            .streams
            .lock()
            .get(&server_id)
            .map(|s| s.queued.len())
            .unwrap_or(0)
    }
}

impl DevicePort for VirtualPort {
    fn event_fd(&self) -> RawFd {
        self.shared.event_rx_raw
    }

    fn subscribe(&self, class: EventClass, enable: bool) -> Result<(), CamError> {
        let mut subs = self.shared.subscriptions.lock();
        if enable {
            subs.insert(class);
        } else {
            subs.remove(&class);
        }
        Ok(())
    }

    fn dequeue_event(&self) -> Result<PortEvent, CamError> {
        let mut byte = [0u8; 1];
        match self.shared.event_rx.lock().read(&mut byte) {
            Ok(1) => {}
            Ok(_) => return Err(CamError::Starved),
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                return Err(CamError::Starved)
            }
            Err(err) => return Err(CamError::Device(format!("event pipe: {err}"))),
        }
        self.shared
            .events
            .lock()
            .pop_front()
            .ok_or(CamError::Starved)
    }

    fn open_socket(&self) -> Result<CameraSocket, CamError> {
        let (client, server) = CameraSocket::pair()?;
        let shared = self.shared.clone();
        std::thread::Builder::new()
            .name("vport-map-server".into())
            .spawn(move || mapping_server(shared, server))
            .map_err(|err| CamError::Device(format!("server thread: {err}")))?;
        Ok(client)
    }

    fn set_ctrl(&self, id: u32, value: i32) -> Result<i32, CamError> {
        if self.shared.dead.load(Ordering::SeqCst) {
            return Err(CamError::Device("server died".into()));
        }
        match id {
            ctrl::QUERY_CAPABILITY => {
                self.shared
                    .session_mapping_write(SessionBufKind::Capability, &self.shared.capability.encode())?;
                Ok(0)
            }
            ctrl::SET_PARMS => {
                let len = usize::try_from(value).unwrap_or(0);
                let blob = self
                    .shared
                    .session_mapping_read(SessionBufKind::SetParm, len)?;
                *self.shared.parms.lock() = blob;
                Ok(value)
            }
            ctrl::GET_PARMS => {
                let parms = self.shared.parms.lock().clone();
                self.shared
                    .session_mapping_write(SessionBufKind::GetParm, &parms)?;
                Ok(parms.len() as i32)
            }
            other => {
                // Generic vendor control: remember the value.
                self.shared.ctrls.lock().insert(other, value);
                Ok(value)
            }
        }
    }

    fn get_ctrl(&self, id: u32) -> Result<i32, CamError> {
        self.shared
            .ctrls
            .lock()
            .get(&id)
            .copied()
            .ok_or(CamError::BadControl(id))
    }

    fn stream_attach(&self, config: &StreamConfig) -> Result<ServerStream, CamError> {
        let (rx, tx) = pipe2(OFlag::O_NONBLOCK)
            .map_err(|errno| CamError::Device(format!("data pipe: {errno}")))?;
        // The drain dup shares the open file description with the client's
        // data fd: one read here consumes the readiness byte the client
        // polled on.
        let data_drain = File::from(
            rx.try_clone()
                .map_err(|err| CamError::Device(format!("data pipe dup: {err}")))?,
        );
        let server_id = self.shared.next_stream_id.fetch_add(1, Ordering::SeqCst);
        debug!(server_id, ty = ?config.stream_type, "virtual stream attached");
        self.shared.streams.lock().insert(
            server_id,
            VpStream {
                on: false,
                queued: VecDeque::new(),
                ready: VecDeque::new(),
                data_tx: File::from(tx),
                data_drain,
            },
        );
        Ok(ServerStream {
            server_id,
            data_fd: rx,
        })
    }

    fn stream_detach(&self, server_id: u32) -> Result<(), CamError> {
        self.shared
            .streams
            .lock()
            .remove(&server_id)
            .map(|_| ())
            .ok_or(CamError::InvalidHandle)
    }

    fn stream_on(&self, server_id: u32) -> Result<(), CamError> {
        let mut streams = self.shared.streams.lock();
        let stream = streams.get_mut(&server_id).ok_or(CamError::InvalidHandle)?;
        stream.on = true;
        Ok(())
    }

    fn stream_off(&self, server_id: u32) -> Result<(), CamError> {
        let mut streams = self.shared.streams.lock();
        let stream = streams.get_mut(&server_id).ok_or(CamError::InvalidHandle)?;
        stream.on = false;
        Ok(())
    }

    fn qbuf(&self, server_id: u32, buf_index: u32) -> Result<(), CamError> {
        let mut streams = self.shared.streams.lock();
        let stream = streams.get_mut(&server_id).ok_or(CamError::InvalidHandle)?;
        if !stream.queued.contains(&buf_index) {
            stream.queued.push_back(buf_index);
        }
        Ok(())
    }

    fn dqbuf(&self, server_id: u32) -> Result<BufDesc, CamError> {
        let mut streams = self.shared.streams.lock();
        let stream = streams.get_mut(&server_id).ok_or(CamError::InvalidHandle)?;
        let mut byte = [0u8; 1];
        match stream.data_drain.read(&mut byte) {
            Ok(1) => {}
            Ok(_) => return Err(CamError::Starved),
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                return Err(CamError::Starved)
            }
            Err(err) => return Err(CamError::Device(format!("data pipe: {err}"))),
        }
        stream.ready.pop_front().ok_or(CamError::Starved)
    }
}

fn mapping_server(shared: Arc<VpShared>, server: CameraSocket) {
    loop {
        match server.recv_packet() {
            Ok((packet, fd)) => {
                if shared.dead.load(Ordering::SeqCst)
                    || shared.stall_next_map.swap(false, Ordering::SeqCst)
                {
                    // A dead (or stalled) server answers nothing; the
                    // client's gate times out or is failed by the death
                    // event.
                    continue;
                }
                let status = if shared.fail_next_map.swap(false, Ordering::SeqCst) {
                    MapStatus::Failed
                } else {
                    match packet {
                        ControlPacket::MapFd { target, size } => match fd {
                            Some(fd) => {
                                shared
                                    .mappings
                                    .lock()
                                    .insert(target, MappedEntry { fd, size });
                                MapStatus::Success
                            }
                            None => MapStatus::Failed,
                        },
                        ControlPacket::UnmapFd { target } => {
                            if shared.mappings.lock().remove(&target).is_some() {
                                MapStatus::Success
                            } else {
                                MapStatus::Failed
                            }
                        }
                    }
                };
                shared.post_event(PortEvent::MapDone { status });
            }
            Err(IpcError::Closed) => break,
            Err(err) => {
                warn!(%err, "virtual mapping server receive failed");
                break;
            }
        }
    }
    debug!("virtual mapping server exited");
}

#[cfg(test)]
mod tests {
    use super::*;
    use charon_core::format::{FourCc, Resolution, StreamFormat, StreamType};

    fn config() -> StreamConfig {
        StreamConfig {
            stream_type: StreamType::Preview,
            format: StreamFormat::new(
                FourCc::new(*b"NV12"),
                Resolution::new(640, 480).expect("resolution"),
            ),
            buf_count: 4,
            buf_size: 640 * 480 * 3 / 2,
        }
    }

    #[test]
    fn injected_frames_dequeue_in_order() {
        let port = VirtualPort::new().unwrap();
        let stream = port.stream_attach(&config()).unwrap();
        port.stream_on(stream.server_id).unwrap();
        port.qbuf(stream.server_id, 0).unwrap();
        port.qbuf(stream.server_id, 1).unwrap();

        port.inject_frame(stream.server_id, 10).unwrap();
        port.inject_frame(stream.server_id, 11).unwrap();

        let first = port.dqbuf(stream.server_id).unwrap();
        let second = port.dqbuf(stream.server_id).unwrap();
        assert_eq!((first.buf_index, first.frame_idx), (0, 10));
        assert_eq!((second.buf_index, second.frame_idx), (1, 11));
        assert!(matches!(
            port.dqbuf(stream.server_id),
            Err(CamError::Starved)
        ));
    }

    #[test]
    fn inject_without_queued_buffers_starves() {
        let port = VirtualPort::new().unwrap();
        let stream = port.stream_attach(&config()).unwrap();
        port.stream_on(stream.server_id).unwrap();
        assert!(matches!(
            port.inject_frame(stream.server_id, 0),
            Err(CamError::Starved)
        ));
    }

    #[test]
    fn vendor_controls_are_remembered() {
        let port = VirtualPort::new().unwrap();
        assert!(matches!(port.get_ctrl(0x42), Err(CamError::BadControl(_))));
        port.set_ctrl(0x42, 7).unwrap();
        assert_eq!(port.get_ctrl(0x42).unwrap(), 7);
    }

    #[test]
    fn event_pipe_signals_queued_events() {
        let port = VirtualPort::new().unwrap();
        assert!(matches!(port.dequeue_event(), Err(CamError::Starved)));
        port.post_notify(EventKind::Info { code: 3 });
        match port.dequeue_event().unwrap() {
            PortEvent::Notify(EventKind::Info { code }) => assert_eq!(code, 3),
            other => panic!("unexpected event {other:?}"),
        }
    }
}
