use std::io;

use charon_core::cmd::ThreadSpawnError;
use charon_ipc::IpcError;
use charon_mem::MemError;

/// Errors surfaced by the control plane.
///
/// # Example
/// ```rust
/// use charon::CamError;
///
/// let err = CamError::InvalidHandle;
/// assert_eq!(err.code(), "invalid_handle");
/// ```
#[derive(Debug, thiserror::Error)]
pub enum CamError {
    #[error("control device open failed after {tries} attempts: {source}")]
    DeviceOpen {
        tries: u32,
        #[source]
        source: io::Error,
    },
    #[error(transparent)]
    Ipc(#[from] IpcError),
    #[error(transparent)]
    Mem(#[from] MemError),
    #[error(transparent)]
    Thread(#[from] ThreadSpawnError),
    #[error("handle does not resolve to a live object")]
    InvalidHandle,
    #[error("{op} not allowed in state {state}")]
    InvalidState {
        op: &'static str,
        state: &'static str,
    },
    #[error("object table is full")]
    TableFull,
    #[error("configuration rejected: {0}")]
    InvalidConfig(String),
    #[error("channel has no bundle configured")]
    NoBundle,
    #[error("channel has no streams to start")]
    NoStreams,
    #[error("unknown vendor control 0x{0:08x}")]
    BadControl(u32),
    #[error("no buffer available on stream")]
    Starved,
    #[error("device error: {0}")]
    Device(String),
}

impl CamError {
    /// Stable string code for error classification.
    pub fn code(&self) -> &'static str {
        match self {
            CamError::DeviceOpen { .. } => "device_open_failed",
            CamError::Ipc(err) => err.code(),
            CamError::Mem(_) => "buffer_memory",
            CamError::Thread(_) => "thread_spawn_failed",
            CamError::InvalidHandle => "invalid_handle",
            CamError::InvalidState { .. } => "invalid_state",
            CamError::TableFull => "table_full",
            CamError::InvalidConfig(_) => "invalid_config",
            CamError::NoBundle => "no_bundle",
            CamError::NoStreams => "no_streams",
            CamError::BadControl(_) => "bad_control",
            CamError::Starved => "starved",
            CamError::Device(_) => "device_error",
        }
    }

    /// Whether the error may succeed when retried.
    pub fn retryable(&self) -> bool {
        match self {
            CamError::DeviceOpen { .. } | CamError::Starved => true,
            CamError::Ipc(err) => err.retryable(),
            _ => false,
        }
    }
}
