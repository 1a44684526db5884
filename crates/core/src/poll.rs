//! Poll thread: one thread multiplexing readiness for many fds.
//!
//! A session runs a single poll thread across its control fd and any
//! per-stream data fds. Entries can be added and removed at runtime: the
//! caller mutates the master entry list and wakes the worker through a
//! pipe; the worker rebuilds its snapshot and acknowledges through a
//! condition variable. Readiness callbacks run synchronously on the poll
//! thread and must not block — a slow callback stalls event delivery for
//! every other fd in the same session.

use std::fs::File;
use std::io::{Read, Write};
use std::os::fd::{AsFd, BorrowedFd, RawFd};
use std::sync::Arc;
use std::thread::JoinHandle;

use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use parking_lot::{Condvar, Mutex};
use tracing::{error, warn};

use crate::cmd::ThreadSpawnError;
use crate::handle::Handle;

const CMD_REFRESH: u8 = 0;
const CMD_EXIT: u8 = 1;

/// What became ready on a registered fd.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    /// Data readable (`POLLIN`), used by stream data fds.
    Readable,
    /// Priority/exception condition (`POLLPRI`), used by the control fd
    /// for pending events.
    Priority,
}

/// Whether an entry update waits for the worker to pick it up.
///
/// `Async` exists for updates issued from poll-thread callback context,
/// where waiting for the acknowledgement would deadlock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallMode {
    Sync,
    Async,
}

/// Readiness callback. Runs on the poll thread; must not block.
pub type PollNotify = Arc<dyn Fn(Handle, Readiness) + Send + Sync>;

#[derive(Clone)]
struct Entry {
    handle: Handle,
    fd: RawFd,
    notify: PollNotify,
}

struct SignalGate {
    wake_tx: File,
    done: bool,
    closed: bool,
}

struct PollShared {
    entries: Mutex<Vec<Entry>>,
    gate: Mutex<SignalGate>,
    done_cond: Condvar,
}

impl PollShared {
    /// Wake the worker with a command byte; in `Sync` mode wait until the
    /// worker has picked it up.
    fn signal(&self, cmd: u8, mode: CallMode) {
        let mut gate = self.gate.lock();
        if gate.closed {
            // The worker is gone (or going); writing would land in a pipe
            // nobody reads.
            return;
        }
        if cmd == CMD_EXIT {
            gate.closed = true;
        }
        gate.done = false;
        if let Err(err) = gate.wake_tx.write_all(&[cmd]) {
            // Avoid waiting for a signal that can never arrive.
            warn!(?err, "poll wake pipe write failed");
            return;
        }
        if matches!(mode, CallMode::Sync) {
            while !gate.done {
                self.done_cond.wait(&mut gate);
            }
        }
    }

    fn signal_done(&self) {
        let mut gate = self.gate.lock();
        gate.done = true;
        self.done_cond.notify_one();
    }
}

/// Dedicated thread polling a runtime-updatable set of fds.
///
/// Registered fds must remain open for as long as they stay registered;
/// the entry stores the raw descriptor, not an owned duplicate.
pub struct PollThread {
    shared: Arc<PollShared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl PollThread {
    /// Spawn the poll worker under `name` with an empty entry set.
    pub fn launch(name: &str) -> Result<Self, ThreadSpawnError> {
        let (rx, tx) = nix::unistd::pipe().map_err(|errno| ThreadSpawnError {
            name: name.to_owned(),
            source: std::io::Error::from(errno),
        })?;
        let shared = Arc::new(PollShared {
            entries: Mutex::new(Vec::new()),
            gate: Mutex::new(SignalGate {
                wake_tx: File::from(tx),
                done: false,
                closed: false,
            }),
            done_cond: Condvar::new(),
        });
        let worker_shared = shared.clone();
        let wake_rx = File::from(rx);
        let worker = std::thread::Builder::new()
            .name(name.to_owned())
            .spawn(move || poll_loop(worker_shared, wake_rx))
            .map_err(|source| ThreadSpawnError {
                name: name.to_owned(),
                source,
            })?;
        Ok(PollThread {
            shared,
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Register (or replace) the entry for `handle`.
    pub fn add_fd(&self, handle: Handle, fd: RawFd, notify: PollNotify, mode: CallMode) {
        {
            let mut entries = self.shared.entries.lock();
            if let Some(entry) = entries.iter_mut().find(|e| e.handle == handle) {
                entry.fd = fd;
                entry.notify = notify;
            } else {
                entries.push(Entry { handle, fd, notify });
            }
        }
        self.shared.signal(CMD_REFRESH, mode);
    }

    /// Remove the entry for `handle`, if any.
    pub fn remove_fd(&self, handle: Handle, mode: CallMode) {
        {
            let mut entries = self.shared.entries.lock();
            entries.retain(|e| e.handle != handle);
        }
        self.shared.signal(CMD_REFRESH, mode);
    }

    /// Stop the worker and join it. Safe to call more than once; later
    /// entry updates become no-ops.
    pub fn shutdown(&self) {
        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            self.shared.signal(CMD_EXIT, CallMode::Sync);
            if worker.join().is_err() {
                warn!("poll worker panicked before join");
            }
        }
    }
}

impl Drop for PollThread {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn poll_loop(shared: Arc<PollShared>, mut wake_rx: File) {
    let mut snapshot: Vec<Entry> = Vec::new();
    loop {
        let mut revents: Vec<PollFlags> = Vec::with_capacity(snapshot.len());
        let wake_ready;
        {
            let mut fds: Vec<PollFd> = Vec::with_capacity(snapshot.len() + 1);
            fds.push(PollFd::new(wake_rx.as_fd(), PollFlags::POLLIN));
            for entry in &snapshot {
                // SAFETY: registered fds are required to outlive their
                // registration; the borrow ends before this iteration does.
                let fd = unsafe { BorrowedFd::borrow_raw(entry.fd) };
                fds.push(PollFd::new(fd, PollFlags::POLLIN | PollFlags::POLLPRI));
            }
            match poll(&mut fds, PollTimeout::NONE) {
                Ok(_) => {}
                Err(Errno::EINTR) => continue,
                Err(errno) => {
                    error!(%errno, "poll failed");
                    std::thread::sleep(std::time::Duration::from_millis(1));
                    continue;
                }
            }
            wake_ready = fds[0]
                .revents()
                .unwrap_or(PollFlags::empty())
                .contains(PollFlags::POLLIN);
            for fd in fds.iter().skip(1) {
                revents.push(fd.revents().unwrap_or(PollFlags::empty()));
            }
        }

        if wake_ready {
            // A pending command invalidates the snapshot; process only the
            // pipe in this iteration.
            let mut cmd = [0u8; 1];
            match wake_rx.read(&mut cmd) {
                Ok(1) => {}
                Ok(_) | Err(_) => {
                    warn!("poll wake pipe read failed");
                    continue;
                }
            }
            match cmd[0] {
                CMD_REFRESH => {
                    snapshot = shared.entries.lock().clone();
                    shared.signal_done();
                }
                CMD_EXIT => {
                    shared.signal_done();
                    break;
                }
                other => warn!(cmd = other, "unknown poll wake command"),
            }
            continue;
        }

        for (entry, flags) in snapshot.iter().zip(&revents) {
            if flags.contains(PollFlags::POLLPRI) {
                (entry.notify)(entry.handle, Readiness::Priority);
            }
            if flags.contains(PollFlags::POLLIN) {
                (entry.notify)(entry.handle, Readiness::Readable);
            }
        }
    }
}
