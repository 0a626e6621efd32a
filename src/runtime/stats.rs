//! Engine-wide counters.

use std::sync::atomic::{AtomicU64, Ordering};

/// Counters updated by every engine role.
#[derive(Debug, Default)]
pub struct EngineStats {
    accepted: AtomicU64,
    disconnected: AtomicU64,
    reaped: AtomicU64,
    messages_read: AtomicU64,
    messages_handled: AtomicU64,
    messages_discarded: AtomicU64,
    handler_rejections: AtomicU64,
    bytes_read: AtomicU64,
    bytes_written: AtomicU64,
}

/// Point-in-time copy of [`EngineStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Connections accepted and registered.
    pub accepted: u64,
    /// Disconnects observed by the read loop.
    pub disconnected: u64,
    /// Connections removed from the table and closed.
    pub reaped: u64,
    /// Messages queued onto a shard.
    pub messages_read: u64,
    /// Messages passed to the handler.
    pub messages_handled: u64,
    /// Messages dropped because their connection was already gone.
    pub messages_discarded: u64,
    /// Messages the handler reported as not handled.
    pub handler_rejections: u64,
    pub bytes_read: u64,
    pub bytes_written: u64,
}

impl EngineStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_accept(&self) {
        self.accepted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_disconnect(&self) {
        self.disconnected.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_reap(&self) {
        self.reaped.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_read(&self, bytes: usize) {
        self.bytes_read.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_enqueued(&self) {
        self.messages_read.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_handled(&self, handled: bool) {
        self.messages_handled.fetch_add(1, Ordering::Relaxed);
        if !handled {
            self.handler_rejections.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn record_discard(&self) {
        self.messages_discarded.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_write(&self, bytes: usize) {
        self.bytes_written.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            accepted: self.accepted.load(Ordering::Relaxed),
            disconnected: self.disconnected.load(Ordering::Relaxed),
            reaped: self.reaped.load(Ordering::Relaxed),
            messages_read: self.messages_read.load(Ordering::Relaxed),
            messages_handled: self.messages_handled.load(Ordering::Relaxed),
            messages_discarded: self.messages_discarded.load(Ordering::Relaxed),
            handler_rejections: self.handler_rejections.load(Ordering::Relaxed),
            bytes_read: self.bytes_read.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
        }
    }
}
