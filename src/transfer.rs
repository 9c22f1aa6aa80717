//! Transfer-completion poller.
//!
//! Asynchronous data transfers cannot interrupt workers, so a dedicated
//! thread periodically probes every in-flight handle and fires its
//! continuation on completion. Continuations run with no lock held; they are
//! free to release workflow steps, which may in turn re-enter the scheduler.

use crate::cluster::Continuation;
use crossbeam_queue::SegQueue;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// An in-flight asynchronous transfer: a non-blocking completion probe plus
/// the continuation to fire once it reports true.
pub struct DataTransfer {
    probe: Box<dyn FnMut() -> bool + Send>,
    continuation: Continuation,
}

impl DataTransfer {
    pub fn new(probe: impl FnMut() -> bool + Send + 'static, continuation: Continuation) -> Self {
        Self {
            probe: Box::new(probe),
            continuation,
        }
    }

    /// Transfer whose completion is signalled through a shared flag. This is
    /// what a message-based transport typically hands us.
    pub fn flagged(completed: Arc<AtomicBool>, continuation: Continuation) -> Self {
        Self::new(move || completed.load(Ordering::Acquire), continuation)
    }
}

impl std::fmt::Debug for DataTransfer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataTransfer").finish_non_exhaustive()
    }
}

pub struct TransferCompletion {
    pending: Arc<SegQueue<DataTransfer>>,
    pending_count: Arc<AtomicUsize>,
    running: Arc<AtomicBool>,
    poll_interval: Duration,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl TransferCompletion {
    pub(crate) fn new(poll_interval: Duration) -> Self {
        Self {
            pending: Arc::new(SegQueue::new()),
            pending_count: Arc::new(AtomicUsize::new(0)),
            running: Arc::new(AtomicBool::new(false)),
            poll_interval,
            handle: Mutex::new(None),
        }
    }

    /// Starts the poller thread. Idempotent.
    pub fn register(&self) {
        if self.running.swap(true, Ordering::AcqRel) {
            return;
        }

        let pending = self.pending.clone();
        let pending_count = self.pending_count.clone();
        let running = self.running.clone();
        let interval = self.poll_interval;

        let handle = thread::Builder::new()
            .name("quarry-transfer-poll".into())
            .spawn(move || poll_loop(&pending, &pending_count, &running, interval))
            .expect("failed to spawn transfer poller thread");

        *self.handle.lock() = Some(handle);
    }

    /// Enqueues an in-flight transfer for completion polling. Accepted even
    /// while the poller drains: the drain loop keeps going until the queue is
    /// empty.
    pub fn add_pending(&self, transfer: DataTransfer) {
        self.pending_count.fetch_add(1, Ordering::AcqRel);
        self.pending.push(transfer);
    }

    pub fn pending_count(&self) -> usize {
        self.pending_count.load(Ordering::Acquire)
    }

    /// Stops the poller: keeps polling until every pending transfer has
    /// completed, then joins the thread. Idempotent.
    pub fn unregister(&self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }

        if let Some(handle) = self.handle.lock().take() {
            handle
                .join()
                .expect("transfer poller thread panicked during drain");
        }

        debug_assert_eq!(self.pending_count(), 0);
    }
}

impl Drop for TransferCompletion {
    fn drop(&mut self) {
        self.unregister();
    }
}

fn poll_loop(
    pending: &SegQueue<DataTransfer>,
    pending_count: &AtomicUsize,
    running: &AtomicBool,
    interval: Duration,
) {
    let mut incomplete: Vec<DataTransfer> = Vec::new();
    let mut completed: Vec<DataTransfer> = Vec::new();

    loop {
        let stopping = !running.load(Ordering::Acquire);

        while let Some(mut transfer) = pending.pop() {
            if (transfer.probe)() {
                completed.push(transfer);
            } else {
                incomplete.push(transfer);
            }
        }

        // Re-queue first so continuations observing `pending_count` see a
        // consistent picture, then fire with no lock held. The order of
        // continuations within one iteration is unspecified.
        for transfer in incomplete.drain(..) {
            pending.push(transfer);
        }

        let fired = completed.len();
        for transfer in completed.drain(..) {
            (transfer.continuation)();
        }
        if fired > 0 {
            pending_count.fetch_sub(fired, Ordering::AcqRel);
            tracing::trace!(fired, "data transfers completed");
        }

        if stopping && pending_count.load(Ordering::Acquire) == 0 {
            break;
        }

        thread::sleep(interval);
    }
}
