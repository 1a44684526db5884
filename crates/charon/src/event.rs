//! Asynchronous events delivered upward from the server/kernel.
//!
//! Each event is a tagged variant rather than an integer-keyed union, so
//! dispatch is exhaustiveness-checked at compile time. Server death is an
//! ordinary event kind: it rides the same path as hardware events, which
//! is how upper layers learn about it without a second channel.

use std::sync::Arc;

use charon_core::handle::Handle;

/// Subscription classes for event callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventClass {
    Channel,
    Control,
    Stats,
    Info,
    Vendor,
}

/// An event delivered through a session's dispatch thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventKind {
    /// Channel-scope notification (e.g. reprocess stage done).
    Channel { channel: u32, code: u32 },
    /// A control changed server-side.
    Control { id: u32, value: i32 },
    /// Stats unit produced something.
    Stats { kind: u32 },
    /// Informational notification.
    Info { code: u32 },
    /// Vendor-private payload.
    Vendor { code: u32, payload: Vec<u8> },
    /// The server/daemon process died. Delivered to every registered
    /// callback regardless of class.
    ServerDied,
}

impl EventKind {
    /// Which subscription class this event belongs to, `None` for server
    /// death (broadcast).
    pub fn class(&self) -> Option<EventClass> {
        match self {
            EventKind::Channel { .. } => Some(EventClass::Channel),
            EventKind::Control { .. } => Some(EventClass::Control),
            EventKind::Stats { .. } => Some(EventClass::Stats),
            EventKind::Info { .. } => Some(EventClass::Info),
            EventKind::Vendor { .. } => Some(EventClass::Vendor),
            EventKind::ServerDied => None,
        }
    }
}

/// Event callback: `(session handle, event)`.
///
/// Runs on the session's dispatch thread with no session or channel lock
/// held. Must not reenter the same session synchronously; teardown from a
/// callback goes through the async-command path.
pub type EventNotify = Arc<dyn Fn(Handle, &EventKind) + Send + Sync>;

/// Registration token returned by `register_event_notify`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventToken(pub(crate) u64);
