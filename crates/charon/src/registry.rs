//! Camera registry: the explicit root object owning one slot per camera.
//!
//! Opening an index that is already open increments the slot's reference
//! count and returns the same handle — shared-ownership open/close. The
//! registry lock is held only to resolve/refcount; session-scope work then
//! proceeds under the session's own locks, so operations on independent
//! cameras never contend.

use std::sync::Arc;

use charon_core::handle::Handle;
use parking_lot::Mutex;
use tracing::debug;

use crate::error::CamError;
use crate::port::DevicePort;
use crate::session::CameraSession;

const GENERATION_MASK: u32 = 0x00ff_ffff;

struct RegistrySlot {
    generation: u32,
    refcount: usize,
    session: Option<Arc<CameraSession>>,
}

/// Root object for a process's camera subsystem.
///
/// Constructed with one [`DevicePort`] per camera index; there is no
/// process-wide singleton, callers pass the registry by reference.
pub struct CameraRegistry {
    ports: Vec<Arc<dyn DevicePort>>,
    slots: Mutex<Vec<RegistrySlot>>,
}

impl CameraRegistry {
    /// Build a registry over the given device ports (at most 256).
    pub fn new(ports: Vec<Arc<dyn DevicePort>>) -> Self {
        debug_assert!(ports.len() <= 256);
        let slots = (0..ports.len())
            .map(|_| RegistrySlot {
                generation: 1,
                refcount: 0,
                session: None,
            })
            .collect();
        CameraRegistry {
            ports,
            slots: Mutex::new(slots),
        }
    }

    /// Number of cameras known to this registry.
    pub fn num_cameras(&self) -> usize {
        self.ports.len()
    }

    /// Open a camera by index. Re-opening an open index shares the
    /// existing session and returns the identical handle.
    pub fn open(&self, index: usize) -> Result<Handle, CamError> {
        let mut slots = self.slots.lock();
        let slot = slots.get_mut(index).ok_or(CamError::InvalidHandle)?;
        if let Some(session) = slot.session.as_ref() {
            slot.refcount += 1;
            debug!(index, refcount = slot.refcount, "camera open shared");
            return Ok(session.handle());
        }
        let handle = compose_handle(slot.generation, index);
        let session = CameraSession::open(index, handle, self.ports[index].clone())?;
        slot.session = Some(session);
        slot.refcount = 1;
        Ok(handle)
    }

    /// Close one reference. The session is torn down only when the last
    /// reference closes; closes are serialized by the registry lock so the
    /// last one wins deterministically.
    pub fn close(&self, handle: Handle) -> Result<(), CamError> {
        let mut slots = self.slots.lock();
        let slot = slots.get_mut(handle.index()).ok_or(CamError::InvalidHandle)?;
        let live = slot
            .session
            .as_ref()
            .is_some_and(|s| s.handle() == handle);
        if !live {
            // Benign: a shared-open peer already finished the teardown.
            return Err(CamError::InvalidHandle);
        }
        slot.refcount -= 1;
        if slot.refcount > 0 {
            debug!(
                index = handle.index(),
                refcount = slot.refcount,
                "camera close deferred, references remain"
            );
            return Ok(());
        }
        let session = slot.session.take();
        slot.generation = next_generation(slot.generation);
        if let Some(session) = session {
            session.shutdown();
        }
        Ok(())
    }

    /// Resolve a handle to its session. Held only long enough to clone the
    /// Arc; callers then work under the session's own locks.
    pub fn session(&self, handle: Handle) -> Option<Arc<CameraSession>> {
        let slots = self.slots.lock();
        let slot = slots.get(handle.index())?;
        slot.session
            .as_ref()
            .filter(|s| s.handle() == handle)
            .cloned()
    }

    /// Current reference count behind a handle (0 when closed).
    pub fn refcount(&self, handle: Handle) -> usize {
        let slots = self.slots.lock();
        slots
            .get(handle.index())
            .filter(|slot| {
                slot.session
                    .as_ref()
                    .is_some_and(|s| s.handle() == handle)
            })
            .map(|slot| slot.refcount)
            .unwrap_or(0)
    }
}

fn compose_handle(generation: u32, index: usize) -> Handle {
    Handle::from_raw(((generation & GENERATION_MASK) << 8) | (index as u32 & 0xff))
}

fn next_generation(current: u32) -> u32 {
    let next = (current + 1) & GENERATION_MASK;
    if next == 0 {
        1
    } else {
        next
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handles_compose_like_the_wire_format() {
        let handle = compose_handle(7, 3);
        assert_eq!(handle.index(), 3);
        assert_eq!(handle.generation(), 7);
        assert!(handle.is_valid());
    }

    #[test]
    fn generation_skips_zero() {
        assert_eq!(next_generation(GENERATION_MASK), 1);
    }
}
