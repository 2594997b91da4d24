use std::collections::VecDeque;
use tokio::sync::{Mutex, Notify};
use tokio::time::{timeout, Duration};

use crate::shutdown::ShutdownSignal;

/// Bounded multi-producer/multi-consumer FIFO handed off between the
/// dispatcher and the sender workers (C3). Bound is `2 * worker_count`
/// per §4.3 so a slow connection manager can't let the dispatcher run
/// unboundedly far ahead of what workers can drain.
///
/// `put`/`get` don't use a channel's own disconnect signalling — both
/// wait in `poll_interval` slices so the caller can re-check `shutdown`
/// between attempts instead of blocking forever on a full/empty queue.
pub struct WorkQueue<T> {
    capacity: usize,
    items: Mutex<VecDeque<T>>,
    not_full: Notify,
    not_empty: Notify,
}

impl<T> WorkQueue<T> {
    pub fn new(capacity: usize) -> Self {
        WorkQueue {
            capacity,
            items: Mutex::new(VecDeque::with_capacity(capacity)),
            not_full: Notify::new(),
            not_empty: Notify::new(),
        }
    }

    /// Blocks until a slot is free, returning the item back to the
    /// caller if `shutdown` fires first.
    pub async fn put(&self, item: T, poll_interval: Duration, shutdown: &ShutdownSignal) -> Result<(), T> {
        let mut item = Some(item);

        loop {
            {
                let mut q = self.items.lock().await;
                if q.len() < self.capacity {
                    q.push_back(item.take().unwrap());
                    drop(q);
                    self.not_empty.notify_one();
                    return Ok(());
                }
            }

            if shutdown.is_set() {
                return Err(item.unwrap());
            }

            let _ = timeout(poll_interval, self.not_full.notified()).await;
        }
    }

    /// Pops the oldest item, draining whatever remains even after
    /// `shutdown` fires. Returns `None` only once the queue is empty
    /// and shutdown has been observed.
    pub async fn get(&self, poll_interval: Duration, shutdown: &ShutdownSignal) -> Option<T> {
        loop {
            {
                let mut q = self.items.lock().await;
                if let Some(item) = q.pop_front() {
                    drop(q);
                    self.not_full.notify_one();
                    return Some(item);
                }
            }

            if shutdown.is_set() {
                return None;
            }

            let _ = timeout(poll_interval, self.not_empty.notified()).await;
        }
    }

    pub async fn len(&self) -> usize {
        self.items.lock().await.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
