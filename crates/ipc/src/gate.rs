//! Reply gate: makes the asynchronous mapping round-trip look synchronous.
//!
//! The server acknowledges a map/unmap by echoing a completion event back
//! through the control-fd event path, not through the socket. The gate
//! holds an outer in-flight lock for the whole send-and-wait, so only one
//! round-trip exists per session at a time and a completion can never be
//! attributed to the wrong request. Unlike the original protocol, the wait
//! carries an explicit timeout: a hung server surfaces as
//! [`IpcError::Timeout`] instead of blocking the caller forever.

use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::IpcError;

/// Completion status posted from the event path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapStatus {
    /// Server installed/removed the mapping.
    Success,
    /// Server rejected the request.
    Failed,
    /// The server process died while the request was in flight.
    ServerDied,
}

/// Serializes mapping round-trips and parks the caller until completion.
///
/// # Example
/// ```rust
/// use std::time::Duration;
/// use charon_ipc::gate::MapGate;
///
/// let gate = MapGate::new();
/// // No completion ever arrives: the caller gets a timeout, not a hang.
/// let result = gate.round_trip(Duration::from_millis(10), || Ok(()));
/// assert_eq!(result.unwrap_err().code(), "map_timeout");
/// ```
pub struct MapGate {
    msg_lock: Mutex<()>,
    state: Mutex<Option<MapStatus>>,
    completed: Condvar,
}

impl Default for MapGate {
    fn default() -> Self {
        Self::new()
    }
}

impl MapGate {
    pub fn new() -> Self {
        MapGate {
            msg_lock: Mutex::new(()),
            state: Mutex::new(None),
            completed: Condvar::new(),
        }
    }

    /// Run one round-trip: send under the in-flight lock, then wait for
    /// the completion event (or the deadline).
    ///
    /// `send` runs while the gate is armed, so a completion racing ahead
    /// of the wait is still observed.
    pub fn round_trip<F>(&self, timeout: Duration, send: F) -> Result<(), IpcError>
    where
        F: FnOnce() -> Result<(), IpcError>,
    {
        let _in_flight = self.msg_lock.lock();
        *self.state.lock() = None;
        send()?;

        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        loop {
            match state.take() {
                Some(MapStatus::Success) => return Ok(()),
                Some(MapStatus::Failed) => return Err(IpcError::MapRejected),
                Some(MapStatus::ServerDied) => return Err(IpcError::ServerDied),
                None => {}
            }
            if self.completed.wait_until(&mut state, deadline).timed_out() {
                return Err(IpcError::Timeout);
            }
        }
    }

    /// Post a completion status from the event path.
    ///
    /// A completion with no round-trip in flight is discarded by the next
    /// `round_trip`, which re-arms the state before sending.
    pub fn complete(&self, status: MapStatus) {
        *self.state.lock() = Some(status);
        self.completed.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn completion_releases_the_waiter() {
        let gate = Arc::new(MapGate::new());
        let gate2 = gate.clone();
        let poster = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            gate2.complete(MapStatus::Success);
        });
        let result = gate.round_trip(Duration::from_secs(2), || Ok(()));
        assert!(result.is_ok());
        poster.join().unwrap();
    }

    #[test]
    fn failure_status_maps_to_rejection() {
        let gate = Arc::new(MapGate::new());
        let gate2 = gate.clone();
        let poster = std::thread::spawn(move || {
            gate2.complete(MapStatus::Failed);
        });
        poster.join().unwrap();
        // Completion arrived before the round-trip: it must be discarded,
        // and the fresh request then times out.
        let result = gate.round_trip(Duration::from_millis(10), || Ok(()));
        assert_eq!(result.unwrap_err().code(), "map_timeout");
    }

    #[test]
    fn server_death_fails_the_wait() {
        let gate = Arc::new(MapGate::new());
        let gate2 = gate.clone();
        let poster = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(10));
            gate2.complete(MapStatus::ServerDied);
        });
        let result = gate.round_trip(Duration::from_secs(2), || Ok(()));
        assert_eq!(result.unwrap_err().code(), "server_died");
        poster.join().unwrap();
    }

    #[test]
    fn send_failure_skips_the_wait() {
        let gate = MapGate::new();
        let started = Instant::now();
        let result = gate.round_trip(Duration::from_secs(5), || {
            Err(IpcError::Send(nix::errno::Errno::EPIPE))
        });
        assert!(result.is_err());
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn round_trips_serialize() {
        let gate = Arc::new(MapGate::new());
        let mut workers = Vec::new();
        for _ in 0..4 {
            let gate2 = gate.clone();
            workers.push(std::thread::spawn(move || {
                // The completion is posted while this round-trip holds the
                // in-flight lock, so it cannot be attributed elsewhere.
                let g3 = gate2.clone();
                let result = gate2.round_trip(Duration::from_secs(2), move || {
                    std::thread::spawn(move || {
                        std::thread::sleep(Duration::from_millis(5));
                        g3.complete(MapStatus::Success);
                    });
                    Ok(())
                });
                result.is_ok()
            }));
        }
        for worker in workers {
            assert!(worker.join().unwrap());
        }
    }
}
