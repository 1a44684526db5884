//! Datagram Unix-domain-socket transport for control packets.
//!
//! One socket exists per camera session. Control packets are fixed-size
//! datagrams; a mapped buffer's file descriptor travels attached to its
//! `MapFd` packet as `SCM_RIGHTS` ancillary data, so the server receives
//! its own descriptor for the same underlying buffer — the zero-copy
//! hand-off. The server end of the same type is used in-process by the
//! virtual device port and by tests.

use std::io::{IoSlice, IoSliceMut};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::path::Path;
use std::time::Duration;

use nix::cmsg_space;
use nix::errno::Errno;
use nix::sys::socket::{
    connect, recvmsg, sendmsg, socket, socketpair, AddressFamily, ControlMessage,
    ControlMessageOwned, MsgFlags, SockFlag, SockType, UnixAddr,
};
use tracing::{debug, warn};

use crate::packet::ControlPacket;
use crate::IpcError;

/// Default bounded-retry policy for opening the socket, mirroring the
/// control device open policy.
pub const CONNECT_TRIES: u32 = 20;
/// Fixed backoff between connect attempts.
pub const CONNECT_BACKOFF: Duration = Duration::from_millis(20);

/// One end of the per-session mapping socket.
#[derive(Debug)]
pub struct CameraSocket {
    fd: OwnedFd,
}

impl CameraSocket {
    /// Connect to the server's socket at `path`, retrying transient
    /// failures up to `tries` times with a fixed `backoff`.
    pub fn connect(path: &Path, tries: u32, backoff: Duration) -> Result<Self, IpcError> {
        let mut last = Errno::EIO;
        for attempt in 1..=tries.max(1) {
            match try_connect(path) {
                Ok(fd) => {
                    debug!(?path, attempt, "mapping socket connected");
                    return Ok(CameraSocket { fd });
                }
                Err(errno) => {
                    last = errno;
                    if attempt < tries {
                        std::thread::sleep(backoff);
                    }
                }
            }
        }
        warn!(?path, tries, errno = %last, "mapping socket connect failed");
        Err(IpcError::Connect {
            tries,
            source: std::io::Error::from(last),
        })
    }

    /// Create a connected in-process pair (client end, server end).
    pub fn pair() -> Result<(CameraSocket, CameraSocket), IpcError> {
        let (client, server) = socketpair(
            AddressFamily::Unix,
            SockType::Datagram,
            None,
            SockFlag::empty(),
        )
        .map_err(IpcError::Send)?;
        Ok((CameraSocket { fd: client }, CameraSocket { fd: server }))
    }

    /// Send a control packet, attaching `fd` as ancillary data when given.
    ///
    /// The descriptor is only borrowed; the caller keeps its own copy open.
    /// The kernel installs an independent duplicate in the receiver, so a
    /// failed send can neither leak nor double-close the local descriptor.
    pub fn send_packet(
        &self,
        packet: &ControlPacket,
        fd: Option<BorrowedFd<'_>>,
    ) -> Result<(), IpcError> {
        let wire = packet.encode();
        let iov = [IoSlice::new(&wire)];
        let raw_fds = fd.map(|fd| [fd.as_raw_fd()]);
        let cmsgs = raw_fds
            .as_ref()
            .map(|fds| [ControlMessage::ScmRights(&fds[..])]);
        let cmsgs: &[ControlMessage<'_>] = cmsgs.as_ref().map(|c| &c[..]).unwrap_or(&[]);
        sendmsg::<()>(self.fd.as_raw_fd(), &iov, cmsgs, MsgFlags::empty(), None)
            .map_err(map_send_errno)?;
        Ok(())
    }

    /// Receive one control packet plus any attached descriptor.
    ///
    /// Blocks until a datagram arrives; returns [`IpcError::Closed`] when
    /// the peer is gone.
    pub fn recv_packet(&self) -> Result<(ControlPacket, Option<OwnedFd>), IpcError> {
        let mut wire = [0u8; ControlPacket::WIRE_SIZE];
        let mut iov = [IoSliceMut::new(&mut wire)];
        let mut cmsg_buf = cmsg_space!([RawFd; 1]);
        let received = match recvmsg::<UnixAddr>(
            self.fd.as_raw_fd(),
            &mut iov,
            Some(&mut cmsg_buf),
            MsgFlags::empty(),
        ) {
            Ok(msg) => msg,
            Err(Errno::ECONNRESET) => return Err(IpcError::Closed),
            Err(errno) => return Err(IpcError::Recv(errno)),
        };
        let received_bytes = received.bytes;
        if received_bytes == 0 {
            return Err(IpcError::Closed);
        }
        let mut attached = None;
        for cmsg in received.cmsgs().map_err(IpcError::Recv)? {
            if let ControlMessageOwned::ScmRights(fds) = cmsg {
                for raw in fds {
                    if raw < 0 {
                        continue;
                    }
                    // SAFETY: the kernel just created this descriptor for
                    // us and it is recorded nowhere else.
                    let fd = unsafe { OwnedFd::from_raw_fd(raw) };
                    if attached.is_none() {
                        attached = Some(fd);
                    } else {
                        warn!("dropping extra descriptor on control packet");
                    }
                }
            }
        }
        let packet = ControlPacket::decode(&wire[..received_bytes])?;
        Ok((packet, attached))
    }
}

impl AsFd for CameraSocket {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

fn try_connect(path: &Path) -> Result<OwnedFd, Errno> {
    let fd = socket(
        AddressFamily::Unix,
        SockType::Datagram,
        SockFlag::empty(),
        None,
    )?;
    let addr = UnixAddr::new(path)?;
    connect(fd.as_raw_fd(), &addr)?;
    Ok(fd)
}

fn map_send_errno(errno: Errno) -> IpcError {
    match errno {
        Errno::ECONNRESET | Errno::ECONNREFUSED | Errno::EPIPE => IpcError::Closed,
        other => IpcError::Send(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{MapTarget, SessionBufKind, StreamBufKind};
    use std::fs::File;
    use std::io::{Read, Write};

    #[test]
    fn packet_crosses_the_pair() {
        let (client, server) = CameraSocket::pair().unwrap();
        let packet = ControlPacket::UnmapFd {
            target: MapTarget::Session {
                kind: SessionBufKind::Capability,
            },
        };
        client.send_packet(&packet, None).unwrap();
        let (received, fd) = server.recv_packet().unwrap();
        assert_eq!(received, packet);
        assert!(fd.is_none());
    }

    #[test]
    fn descriptor_travels_with_map_packet() {
        let (client, server) = CameraSocket::pair().unwrap();
        let (pipe_rx, pipe_tx) = nix::unistd::pipe().unwrap();
        let packet = ControlPacket::MapFd {
            target: MapTarget::Stream {
                channel: 1,
                stream: 2,
                kind: StreamBufKind::Frame,
                buf_index: 0,
                plane_index: 0,
            },
            size: 64,
        };
        client
            .send_packet(&packet, Some(pipe_tx.as_fd()))
            .unwrap();
        let (received, fd) = server.recv_packet().unwrap();
        assert_eq!(received, packet);

        // The received descriptor must address the same pipe.
        let mut received_end = File::from(fd.expect("fd attached"));
        received_end.write_all(b"ok").unwrap();
        drop(received_end);
        drop(pipe_tx);
        let mut readback = String::new();
        File::from(pipe_rx).read_to_string(&mut readback).unwrap();
        assert_eq!(readback, "ok");
    }

    #[test]
    fn connect_fails_with_bounded_retries() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("no-server");
        let err = CameraSocket::connect(&missing, 3, Duration::from_millis(1)).unwrap_err();
        assert_eq!(err.code(), "socket_connect_failed");
        assert!(err.retryable());
    }

    #[test]
    fn recv_reports_closed_peer() {
        let (client, server) = CameraSocket::pair().unwrap();
        drop(client);
        assert!(matches!(server.recv_packet(), Err(IpcError::Closed)));
    }
}
