//! Per-worker inbound queues.
//!
//! Every connection is pinned to one shard at accept time and each shard is
//! drained, in FIFO order, by exactly one worker thread. A slow handler
//! therefore stalls only the connections sharing its shard.

use crate::runtime::table::Entry;
use bytes::Bytes;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Bytes from one socket read, plus the connection they came from.
pub(crate) struct InboundMessage<S> {
    pub entry: Arc<Entry<S>>,
    pub data: Bytes,
}

pub(crate) struct ShardQueue<S> {
    id: usize,
    queue: Mutex<VecDeque<InboundMessage<S>>>,
    ready: Condvar,
}

impl<S> ShardQueue<S> {
    pub fn new(id: usize) -> Self {
        Self {
            id,
            queue: Mutex::new(VecDeque::new()),
            ready: Condvar::new(),
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<InboundMessage<S>>> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn push(&self, message: InboundMessage<S>) {
        self.lock().push_back(message);
        self.ready.notify_one();
    }

    /// Take the oldest message, waiting for one to arrive.
    ///
    /// Returns `None` once `shutdown` is set. The wait is re-checked at least
    /// every `wait`, so a missed wakeup costs at most that long.
    pub fn pop(&self, shutdown: &AtomicBool, wait: Duration) -> Option<InboundMessage<S>> {
        let mut queue = self.lock();
        loop {
            if shutdown.load(Ordering::Acquire) {
                return None;
            }
            if let Some(message) = queue.pop_front() {
                return Some(message);
            }
            queue = self
                .ready
                .wait_timeout(queue, wait)
                .map(|(guard, _)| guard)
                .unwrap_or_else(|e| e.into_inner().0);
        }
    }

    /// Wake the worker so it re-checks the shutdown flag.
    pub fn wake(&self) {
        // Taking the lock orders this after any in-progress flag check.
        drop(self.lock());
        self.ready.notify_all();
    }

    /// Remove every queued message. Returns how many were dropped.
    pub fn drain(&self) -> usize {
        let drained = std::mem::take(&mut *self.lock());
        drained.len()
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}
