#![doc = include_str!("../README.md")]

use std::io;

use nix::errno::Errno;

pub mod gate;
pub mod packet;
pub mod socket;

/// Errors from the buffer-sharing transport.
///
/// # Example
/// ```rust
/// use charon_ipc::IpcError;
///
/// let err = IpcError::Timeout;
/// assert_eq!(err.code(), "map_timeout");
/// assert!(!err.retryable());
/// ```
#[derive(Debug, thiserror::Error)]
pub enum IpcError {
    #[error("socket connect failed after {tries} attempts: {source}")]
    Connect {
        tries: u32,
        #[source]
        source: io::Error,
    },
    #[error("socket send failed: {0}")]
    Send(Errno),
    #[error("socket recv failed: {0}")]
    Recv(Errno),
    #[error("peer closed the mapping socket")]
    Closed,
    #[error("malformed control packet: {0}")]
    Packet(#[from] packet::PacketError),
    #[error("server rejected the mapping request")]
    MapRejected,
    #[error("server died during a mapping round-trip")]
    ServerDied,
    #[error("timed out waiting for mapping completion")]
    Timeout,
}

impl IpcError {
    /// Stable string code for error classification.
    pub fn code(&self) -> &'static str {
        match self {
            IpcError::Connect { .. } => "socket_connect_failed",
            IpcError::Send(_) => "socket_send_failed",
            IpcError::Recv(_) => "socket_recv_failed",
            IpcError::Closed => "socket_closed",
            IpcError::Packet(_) => "malformed_packet",
            IpcError::MapRejected => "map_rejected",
            IpcError::ServerDied => "server_died",
            IpcError::Timeout => "map_timeout",
        }
    }

    /// Whether the error may succeed when retried.
    ///
    /// Mapping failures are deliberately not retryable: a map that may or
    /// may not have taken effect server-side needs coordinated teardown,
    /// not a blind resend.
    pub fn retryable(&self) -> bool {
        matches!(self, IpcError::Connect { .. } | IpcError::Send(_))
    }
}
