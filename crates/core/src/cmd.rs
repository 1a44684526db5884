//! Generic command worker: a FIFO queue drained by a dedicated thread.
//!
//! The same worker shape is reused for event dispatch, asynchronous
//! teardown and super-buffer processing: producers enqueue a job and post
//! the wakeup; the worker blocks while idle and runs a caller-supplied
//! dispatch function per job. A distinguished exit job terminates the
//! loop.

use std::io;
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_queue::SegQueue;
use parking_lot::{Condvar, Mutex};
use tracing::warn;

enum Cmd<T> {
    Job(T),
    Exit,
}

struct CmdShared<T> {
    queue: SegQueue<Cmd<T>>,
    pending: Mutex<usize>,
    wake: Condvar,
}

impl<T> CmdShared<T> {
    fn post(&self, cmd: Cmd<T>) {
        self.queue.push(cmd);
        let mut pending = self.pending.lock();
        *pending += 1;
        self.wake.notify_one();
    }
}

/// Failure to spawn a named worker thread.
#[derive(Debug, thiserror::Error)]
#[error("failed to spawn thread {name}: {source}")]
pub struct ThreadSpawnError {
    pub name: String,
    #[source]
    pub source: io::Error,
}

/// Cloneable producer handle for a [`CmdThread`].
///
/// Jobs enqueued after the worker exits are dropped unrun.
pub struct CmdSender<T> {
    shared: Arc<CmdShared<T>>,
}

impl<T> Clone for CmdSender<T> {
    fn clone(&self) -> Self {
        CmdSender {
            shared: self.shared.clone(),
        }
    }
}

impl<T> CmdSender<T> {
    /// Append a job and wake the worker.
    pub fn enqueue(&self, job: T) {
        self.shared.post(Cmd::Job(job));
    }
}

/// A dedicated worker thread fed by an unbounded FIFO queue.
///
/// Jobs run in enqueue order on the worker thread. Dropping the handle
/// (or calling [`CmdThread::shutdown`]) enqueues the exit job and joins,
/// so all previously enqueued jobs still run.
///
/// # Example
/// ```rust
/// use std::sync::{Arc, atomic::{AtomicUsize, Ordering}};
/// use charon_core::cmd::CmdThread;
///
/// let seen = Arc::new(AtomicUsize::new(0));
/// let seen2 = seen.clone();
/// let worker = CmdThread::launch("count", move |n: usize| {
///     seen2.fetch_add(n, Ordering::SeqCst);
/// })
/// .unwrap();
/// worker.enqueue(2);
/// worker.enqueue(3);
/// worker.shutdown();
/// assert_eq!(seen.load(Ordering::SeqCst), 5);
/// ```
pub struct CmdThread<T: Send + 'static> {
    shared: Arc<CmdShared<T>>,
    worker: Option<JoinHandle<()>>,
    name: String,
}

impl<T: Send + 'static> CmdThread<T> {
    /// Spawn the worker under `name` with the given dispatch function.
    pub fn launch<F>(name: &str, mut dispatch: F) -> Result<Self, ThreadSpawnError>
    where
        F: FnMut(T) + Send + 'static,
    {
        let shared = Arc::new(CmdShared {
            queue: SegQueue::new(),
            pending: Mutex::new(0),
            wake: Condvar::new(),
        });
        let worker_shared = shared.clone();
        let worker = std::thread::Builder::new()
            .name(name.to_owned())
            .spawn(move || loop {
                {
                    let mut pending = worker_shared.pending.lock();
                    while *pending == 0 {
                        worker_shared.wake.wait(&mut pending);
                    }
                    *pending -= 1;
                }
                match worker_shared.queue.pop() {
                    Some(Cmd::Job(job)) => dispatch(job),
                    // A missing node would mean the pending count ran ahead
                    // of the queue; treat it like exit.
                    Some(Cmd::Exit) | None => break,
                }
            })
            .map_err(|source| ThreadSpawnError {
                name: name.to_owned(),
                source,
            })?;
        Ok(CmdThread {
            shared,
            worker: Some(worker),
            name: name.to_owned(),
        })
    }

    /// Append a job and wake the worker.
    pub fn enqueue(&self, job: T) {
        self.shared.post(Cmd::Job(job));
    }

    /// Producer handle usable from callback contexts.
    pub fn sender(&self) -> CmdSender<T> {
        CmdSender {
            shared: self.shared.clone(),
        }
    }

    /// Stop the worker after draining previously enqueued jobs.
    pub fn shutdown(mut self) {
        self.shutdown_in_place();
    }

    fn shutdown_in_place(&mut self) {
        if let Some(worker) = self.worker.take() {
            self.shared.post(Cmd::Exit);
            if worker.join().is_err() {
                warn!(thread = %self.name, "command worker panicked before join");
            }
        }
    }
}

impl<T: Send + 'static> Drop for CmdThread<T> {
    fn drop(&mut self) {
        self.shutdown_in_place();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;

    #[test]
    fn jobs_run_in_fifo_order() {
        let (tx, rx) = mpsc::channel();
        let worker = CmdThread::launch("fifo", move |n: u32| {
            let _ = tx.send(n);
        })
        .unwrap();
        for n in 0..16 {
            worker.enqueue(n);
        }
        worker.shutdown();
        let drained: Vec<u32> = rx.try_iter().collect();
        assert_eq!(drained, (0..16).collect::<Vec<_>>());
    }

    #[test]
    fn shutdown_drains_pending_jobs() {
        let count = Arc::new(AtomicUsize::new(0));
        let count2 = count.clone();
        let worker = CmdThread::launch("drain", move |_: ()| {
            count2.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
        for _ in 0..100 {
            worker.enqueue(());
        }
        worker.shutdown();
        assert_eq!(count.load(Ordering::SeqCst), 100);
    }

    #[test]
    fn drop_joins_the_worker() {
        let count = Arc::new(AtomicUsize::new(0));
        let count2 = count.clone();
        {
            let worker = CmdThread::launch("drop", move |_: ()| {
                count2.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
            worker.enqueue(());
        }
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
