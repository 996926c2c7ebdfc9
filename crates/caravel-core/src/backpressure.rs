//! Bounded hand-off queue between an ingestion stage and processing workers.
//!
//! [`BoundedQueue`] is an mpsc channel with three additions the raw channel
//! does not give us: precise occupancy tracking (a semaphore permit per
//! buffered item), a `close()` that stops writers while letting readers
//! drain what is already buffered, and counters for observability.
//!
//! Writers block when the queue is full; they never drop items.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use tokio::sync::{mpsc, Mutex, Semaphore};

use crate::error::{Error, Result};

/// A bounded multi-producer multi-consumer queue with blocking writes.
///
/// `len()` never exceeds the configured capacity: the underlying channel
/// enforces the bound and occupancy is only counted after an item is
/// actually buffered.
pub struct BoundedQueue<T> {
    /// Writer handle; `None` after close so the channel can drain to empty.
    tx: parking_lot::Mutex<Option<mpsc::Sender<T>>>,
    rx: Mutex<mpsc::Receiver<T>>,
    /// One permit per buffered item; readers park here while empty.
    occupancy: Semaphore,
    depth: AtomicUsize,
    capacity: usize,
    closed: AtomicBool,
    stats: QueueStats,
}

impl<T> BoundedQueue<T> {
    /// Create a queue buffering at most `capacity` items (minimum 1).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (tx, rx) = mpsc::channel(capacity);
        Self {
            tx: parking_lot::Mutex::new(Some(tx)),
            rx: Mutex::new(rx),
            occupancy: Semaphore::new(0),
            depth: AtomicUsize::new(0),
            capacity,
            closed: AtomicBool::new(false),
            stats: QueueStats::default(),
        }
    }

    /// Enqueue `value`, waiting while the queue is full.
    ///
    /// # Errors
    /// Returns [`Error::QueueClosed`] once [`close`](Self::close) was called.
    pub async fn send(&self, value: T) -> Result<()> {
        let tx = match self.tx.lock().as_ref() {
            Some(tx) => tx.clone(),
            None => return Err(Error::QueueClosed),
        };
        tx.send(value).await.map_err(|_| Error::QueueClosed)?;
        self.depth.fetch_add(1, Ordering::AcqRel);
        self.occupancy.add_permits(1);
        self.stats.enqueued.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Enqueue without waiting; a full queue rejects the value back.
    pub fn try_send(&self, value: T) -> std::result::Result<(), mpsc::error::TrySendError<T>> {
        let tx = match self.tx.lock().as_ref() {
            Some(tx) => tx.clone(),
            None => return Err(mpsc::error::TrySendError::Closed(value)),
        };
        match tx.try_send(value) {
            Ok(()) => {
                self.depth.fetch_add(1, Ordering::AcqRel);
                self.occupancy.add_permits(1);
                self.stats.enqueued.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(err) => {
                if matches!(err, mpsc::error::TrySendError::Full(_)) {
                    self.stats.rejected.fetch_add(1, Ordering::Relaxed);
                }
                Err(err)
            }
        }
    }

    /// Dequeue the next item, waiting while the queue is empty.
    ///
    /// Returns `None` only after the queue was closed and every buffered
    /// item was drained.
    pub async fn recv(&self) -> Option<T> {
        match self.occupancy.acquire().await {
            Ok(permit) => permit.forget(),
            // Closed: permits are dead, fall through and drain the channel
            // directly until the buffer is empty.
            Err(_) => {}
        }
        let value = self.rx.lock().await.recv().await;
        if value.is_some() {
            self.depth_dec();
            self.stats.dequeued.fetch_add(1, Ordering::Relaxed);
        }
        value
    }

    /// Mark the queue complete: subsequent sends fail, waiting readers wake,
    /// buffered items remain readable until drained. Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.tx.lock().take();
        self.occupancy.close();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Items currently buffered (pulled in but not yet handed out).
    pub fn len(&self) -> usize {
        self.depth.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn stats(&self) -> QueueStatsSnapshot {
        QueueStatsSnapshot {
            enqueued: self.stats.enqueued.load(Ordering::Relaxed),
            dequeued: self.stats.dequeued.load(Ordering::Relaxed),
            rejected: self.stats.rejected.load(Ordering::Relaxed),
            depth: self.len(),
            capacity: self.capacity,
        }
    }

    fn depth_dec(&self) {
        // Saturating: the drain path after close() reads the channel without
        // permit accounting, so a racing writer's increment may not have
        // landed yet.
        let _ = self
            .depth
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |d| {
                Some(d.saturating_sub(1))
            });
    }
}

impl<T> std::fmt::Debug for BoundedQueue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoundedQueue")
            .field("depth", &self.len())
            .field("capacity", &self.capacity)
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[derive(Default)]
struct QueueStats {
    enqueued: AtomicU64,
    dequeued: AtomicU64,
    rejected: AtomicU64,
}

#[derive(Debug, Clone)]
pub struct QueueStatsSnapshot {
    pub enqueued: u64,
    pub dequeued: u64,
    /// Non-blocking sends refused because the queue was full.
    pub rejected: u64,
    pub depth: usize,
    pub capacity: usize,
}
