//! Connection table: the single source of truth for which connections exist.
//!
//! Slots live in a slab and are named by [`ConnId`], a slot index plus a
//! generation. Once a connection is reaped its id never resolves again, even
//! after the slot is reused. Every change to lifetime state (registration,
//! pending counts, disconnect, reap) happens under the table lock through the
//! handful of operations below; the live socket set is only mutated while
//! that lock is held too, so a socket is never live without an owner.
//!
//! Lock order is table, then live socket set.

use crate::runtime::{ConcurrentVec, Connection};
use slab::Slab;
use std::fmt;
use std::os::fd::RawFd;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, TryLockError};

/// Stable identifier of a registered connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnId {
    index: usize,
    generation: u64,
}

impl ConnId {
    pub(crate) fn new(index: usize, generation: u64) -> Self {
        Self { index, generation }
    }

    /// Slot index. Reused after a reap.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Registration sequence number. Never reused.
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.index, self.generation)
    }
}

/// An entry of the live socket set polled by the read loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LiveSocket {
    pub fd: RawFd,
    pub id: ConnId,
}

/// A connection together with its application session.
pub(crate) struct Entry<S> {
    pub conn: Connection,
    session: Mutex<S>,
}

impl<S> Entry<S> {
    pub fn new(conn: Connection, session: S) -> Self {
        Self {
            conn,
            session: Mutex::new(session),
        }
    }

    pub fn session(&self) -> MutexGuard<'_, S> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// `None` if the session is currently in use.
    pub fn try_session(&self) -> Option<MutexGuard<'_, S>> {
        match self.session.try_lock() {
            Ok(guard) => Some(guard),
            Err(TryLockError::Poisoned(e)) => Some(e.into_inner()),
            Err(TryLockError::WouldBlock) => None,
        }
    }
}

struct Slot<S> {
    generation: u64,
    /// `None` while reserved by the accept loop.
    entry: Option<Arc<Entry<S>>>,
}

struct Inner<S> {
    slots: Slab<Slot<S>>,
    next_generation: u64,
}

impl<S> Inner<S> {
    fn lookup(&self, id: ConnId) -> Option<&Arc<Entry<S>>> {
        self.slots
            .get(id.index)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.entry.as_ref())
    }

    fn remove(&mut self, id: ConnId) -> Option<Arc<Entry<S>>> {
        let matches = self
            .slots
            .get(id.index)
            .is_some_and(|slot| slot.generation == id.generation);
        if matches {
            self.slots.remove(id.index).entry
        } else {
            None
        }
    }
}

/// Outcome of [`ConnectionTable::mark_disconnected`].
pub(crate) enum Disconnect<S> {
    /// No messages outstanding: removed from the table, caller destroys it.
    Reaped(Arc<Entry<S>>),
    /// Messages still queued; the worker that handles the last one reaps it.
    Deferred { entry: Arc<Entry<S>>, pending: u32 },
    /// Already reaped, or already marked disconnected.
    Stale,
}

pub(crate) struct ConnectionTable<S> {
    inner: Mutex<Inner<S>>,
    live: ConcurrentVec<LiveSocket>,
}

impl<S> ConnectionTable<S> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                slots: Slab::new(),
                next_generation: 1,
            }),
            live: ConcurrentVec::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner<S>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Sockets the read loop should poll.
    pub fn live_sockets(&self) -> &ConcurrentVec<LiveSocket> {
        &self.live
    }

    /// Claim a slot for a connection that is about to be built.
    pub fn reserve(&self) -> ConnId {
        let mut inner = self.lock();
        let generation = inner.next_generation;
        inner.next_generation += 1;
        let index = inner.slots.insert(Slot {
            generation,
            entry: None,
        });
        ConnId { index, generation }
    }

    /// Give back a reservation whose connection could not be built.
    pub fn abandon(&self, id: ConnId) {
        let mut inner = self.lock();
        let reserved = inner
            .slots
            .get(id.index)
            .is_some_and(|slot| slot.generation == id.generation && slot.entry.is_none());
        if reserved {
            inner.slots.remove(id.index);
        }
    }

    /// Publish a built connection: fill its slot and add its socket to the
    /// live set in one critical section.
    ///
    /// Returns `false` if the reservation was swept by shutdown meanwhile.
    pub fn activate(&self, entry: Arc<Entry<S>>) -> bool {
        let id = entry.conn.id();
        let socket = LiveSocket {
            fd: entry.conn.fd(),
            id,
        };
        let rejected = {
            let mut inner = self.lock();
            match inner.slots.get_mut(id.index) {
                Some(slot) if slot.generation == id.generation => {
                    slot.entry = Some(entry);
                    self.live.push(socket);
                    None
                }
                _ => Some(entry),
            }
        };
        // Closing joins the writer, so only after the lock is released.
        if let Some(entry) = rejected {
            entry.conn.close();
            return false;
        }
        true
    }

    pub fn get(&self, id: ConnId) -> Option<Arc<Entry<S>>> {
        self.lock().lookup(id).cloned()
    }

    #[cfg(test)]
    pub fn contains(&self, id: ConnId) -> bool {
        self.lock().lookup(id).is_some()
    }

    /// Account for one more inbound message. `None` if the connection has
    /// already been reaped.
    pub fn begin_message(&self, id: ConnId) -> Option<Arc<Entry<S>>> {
        let inner = self.lock();
        let entry = inner.lookup(id)?;
        entry.conn.increment_pending();
        Some(Arc::clone(entry))
    }

    /// Account for a handled message. Returns the entry if this was the last
    /// outstanding message of a disconnected connection.
    pub fn finish_message(&self, id: ConnId) -> Option<Arc<Entry<S>>> {
        let mut inner = self.lock();
        let reap = {
            let entry = inner.lookup(id)?;
            entry.conn.decrement_pending();
            entry.conn.is_reapable()
        };
        if reap {
            inner.remove(id)
        } else {
            None
        }
    }

    /// Record that the read loop saw this socket go away and drop it from
    /// the live set.
    pub fn mark_disconnected(&self, socket: LiveSocket) -> Disconnect<S> {
        let mut inner = self.lock();
        self.live.erase(&socket);

        let Some(entry) = inner.lookup(socket.id) else {
            return Disconnect::Stale;
        };
        if !entry.conn.mark_disconnected() {
            return Disconnect::Stale;
        }
        if entry.conn.is_reapable() {
            match inner.remove(socket.id) {
                Some(entry) => Disconnect::Reaped(entry),
                None => Disconnect::Stale,
            }
        } else {
            Disconnect::Deferred {
                entry: Arc::clone(entry),
                pending: entry.conn.pending_messages(),
            }
        }
    }

    /// Remove every connection and reservation, for shutdown.
    pub fn drain(&self) -> Vec<Arc<Entry<S>>> {
        let mut inner = self.lock();
        self.live.clear();
        inner
            .slots
            .drain()
            .filter_map(|slot| slot.entry)
            .collect()
    }

    /// Number of published connections, including disconnected ones still
    /// waiting for their last message.
    pub fn len(&self) -> usize {
        self.lock()
            .slots
            .iter()
            .filter(|(_, slot)| slot.entry.is_some())
            .count()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
