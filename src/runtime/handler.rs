//! Application hooks the engine calls into.
//!
//! The engine owns sockets, queues and lifetimes. What a message *means* is
//! up to the embedding application, which supplies a [`Handler`] that opens
//! one [`Session`] per accepted connection.

use crate::runtime::Connection;

/// Per-connection application state.
///
/// Only the worker owning the connection's shard touches a session while the
/// connection is live, so no further synchronisation is needed inside it.
pub trait Session: Send + 'static {
    /// Consume one inbound message: the bytes of a single socket read.
    ///
    /// `data` is only borrowed for the duration of the call. Returns whether
    /// the message was handled.
    fn feed_message(&mut self, conn: &Connection, data: &[u8]) -> bool;

    /// Called exactly once, after the connection has been removed from the
    /// table and its writer stopped.
    fn on_close(&mut self, _conn: &Connection) {}
}

/// Factory for sessions plus the per-message dispatch hook.
pub trait Handler: Send + Sync + 'static {
    type Session: Session;

    /// Create the session for a freshly accepted connection.
    fn open(&self, conn: &Connection) -> Self::Session;

    /// Invoked by the shard worker for every inbound message.
    fn on_message(
        &self,
        _shard_id: usize,
        conn: &Connection,
        session: &mut Self::Session,
        data: &[u8],
    ) -> bool {
        session.feed_message(conn, data)
    }
}

impl<F, S> Handler for F
where
    F: Fn(&Connection) -> S + Send + Sync + 'static,
    S: Session,
{
    type Session = S;

    fn open(&self, conn: &Connection) -> S {
        self(conn)
    }
}
