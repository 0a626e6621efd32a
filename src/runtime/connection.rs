//! Accepted connections and their outbound writer threads.
//!
//! Each connection carries the lifecycle fields the table uses to decide
//! when it may be reaped (`pending_messages`, `connected`) and an outbound
//! queue drained by a dedicated writer thread. Enqueueing never blocks on
//! I/O; the writer performs blocking writes of one entry at a time.

use crate::runtime::{ConnId, EngineStats};
use bytes::Bytes;
use std::collections::VecDeque;
use std::fmt;
use std::io::{self, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::os::fd::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, trace};

/// Outbound state shared with the writer thread. Guarded by one lock so
/// `bytes_pending` always matches the queue contents.
#[derive(Default)]
struct WriteQueue {
    entries: VecDeque<Bytes>,
    bytes_pending: usize,
    /// Writer must stop; queued data is discarded.
    closing: bool,
    /// Shut the socket down once `entries` is empty.
    finishing: bool,
}

struct Outbound {
    stream: TcpStream,
    queue: Mutex<WriteQueue>,
    ready: Condvar,
    stats: Arc<EngineStats>,
}

impl Outbound {
    fn lock(&self) -> MutexGuard<'_, WriteQueue> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A client connection owned by the engine.
pub struct Connection {
    id: ConnId,
    peer: SocketAddr,
    shard_id: usize,
    fd: RawFd,
    /// Messages read but not yet fully handled. Mutated under the table lock.
    pending: AtomicU32,
    /// Cleared once, when the read loop sees EOF, hangup or error.
    connected: AtomicBool,
    outbound: Arc<Outbound>,
    writer: Mutex<Option<JoinHandle<()>>>,
}

impl Connection {
    /// Wrap an accepted stream and start its writer thread.
    ///
    /// The writer wakes at least every `writer_wait` to observe closing.
    pub(crate) fn spawn(
        id: ConnId,
        stream: TcpStream,
        peer: SocketAddr,
        shard_id: usize,
        writer_wait: Duration,
        stats: Arc<EngineStats>,
    ) -> io::Result<Self> {
        let fd = stream.as_raw_fd();
        let outbound = Arc::new(Outbound {
            stream,
            queue: Mutex::new(WriteQueue::default()),
            ready: Condvar::new(),
            stats,
        });

        let writer = {
            let outbound = Arc::clone(&outbound);
            thread::Builder::new()
                .name(format!("writer-{}", id.index()))
                .spawn(move || write_loop(&outbound, id, writer_wait))?
        };

        Ok(Self {
            id,
            peer,
            shard_id,
            fd,
            pending: AtomicU32::new(0),
            connected: AtomicBool::new(true),
            outbound,
            writer: Mutex::new(Some(writer)),
        })
    }

    pub fn id(&self) -> ConnId {
        self.id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Shard whose worker receives this connection's messages. Fixed at accept.
    pub fn shard_id(&self) -> usize {
        self.shard_id
    }

    /// Raw socket descriptor. Stays valid until the connection is dropped.
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn pending_messages(&self) -> u32 {
        self.pending.load(Ordering::Acquire)
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    pub(crate) fn stream(&self) -> &TcpStream {
        &self.outbound.stream
    }

    pub(crate) fn increment_pending(&self) {
        self.pending.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn decrement_pending(&self) {
        let previous = self.pending.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(previous > 0, "pending message count underflow");
    }

    /// Returns `true` if this call flipped the flag.
    pub(crate) fn mark_disconnected(&self) -> bool {
        self.connected.swap(false, Ordering::AcqRel)
    }

    /// Both reap conditions hold. Callers check this under the table lock.
    pub(crate) fn is_reapable(&self) -> bool {
        !self.is_connected() && self.pending_messages() == 0
    }

    /// Queue `data` for the writer thread.
    ///
    /// Returns `false` once the connection is closing or finishing.
    pub fn enqueue_write(&self, data: impl Into<Bytes>) -> bool {
        let data = data.into();
        let mut queue = self.outbound.lock();
        if queue.closing || queue.finishing {
            return false;
        }
        if data.is_empty() {
            return true;
        }
        queue.bytes_pending += data.len();
        queue.entries.push_back(data);
        drop(queue);
        self.outbound.ready.notify_one();
        true
    }

    /// Bytes queued but not yet handed to the socket.
    pub fn bytes_pending(&self) -> usize {
        self.outbound.lock().bytes_pending
    }

    /// Number of queued write entries.
    pub fn queued_writes(&self) -> usize {
        self.outbound.lock().entries.len()
    }

    /// Stop accepting writes and shut the socket down once the queue drains.
    ///
    /// The read loop then sees the hangup and runs the normal disconnect.
    pub fn finish(&self) {
        let mut queue = self.outbound.lock();
        if queue.closing || queue.finishing {
            return;
        }
        queue.finishing = true;
        drop(queue);
        self.outbound.ready.notify_one();
    }

    pub fn is_closing(&self) -> bool {
        self.outbound.lock().closing
    }

    /// Shut down both directions of the socket without releasing the
    /// descriptor. Blocked reads and writes return immediately.
    pub(crate) fn shutdown_socket(&self) {
        if let Err(e) = self.outbound.stream.shutdown(Shutdown::Both) {
            if e.kind() != io::ErrorKind::NotConnected {
                trace!(conn_id = %self.id, error = %e, "Socket shutdown failed");
            }
        }
    }

    /// Stop the writer, drop queued data and shut the socket down.
    ///
    /// Idempotent. Joins the writer thread unless called from it.
    pub fn close(&self) {
        {
            let mut queue = self.outbound.lock();
            if queue.closing {
                return;
            }
            queue.closing = true;
            queue.entries.clear();
            queue.bytes_pending = 0;
        }

        self.shutdown_socket();
        self.outbound.ready.notify_all();

        let writer = self
            .writer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = writer {
            if handle.thread().id() != thread::current().id() && handle.join().is_err() {
                debug!(conn_id = %self.id, "Writer thread panicked");
            }
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("shard_id", &self.shard_id)
            .field("fd", &self.fd)
            .field("pending", &self.pending_messages())
            .field("connected", &self.is_connected())
            .finish()
    }
}

enum Next {
    Write(Bytes),
    Finish,
    Stop,
}

fn write_loop(outbound: &Outbound, id: ConnId, wait: Duration) {
    loop {
        let next = {
            let mut queue = outbound.lock();
            loop {
                if queue.closing {
                    break Next::Stop;
                }
                if let Some(data) = queue.entries.pop_front() {
                    queue.bytes_pending -= data.len();
                    break Next::Write(data);
                }
                if queue.finishing {
                    break Next::Finish;
                }
                queue = outbound
                    .ready
                    .wait_timeout(queue, wait)
                    .map(|(guard, _)| guard)
                    .unwrap_or_else(|e| e.into_inner().0);
            }
        };

        match next {
            Next::Write(data) => match (&outbound.stream).write_all(&data) {
                Ok(()) => outbound.stats.record_write(data.len()),
                Err(e) => {
                    debug!(conn_id = %id, bytes = data.len(), error = %e, "Dropped outbound write");
                }
            },
            Next::Finish => {
                if let Err(e) = outbound.stream.shutdown(Shutdown::Both) {
                    trace!(conn_id = %id, error = %e, "Socket shutdown failed");
                }
                trace!(conn_id = %id, "Writer finished");
                return;
            }
            Next::Stop => return,
        }
    }
}
