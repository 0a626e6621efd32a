//! Echo protocol: every inbound message is written back verbatim.
//!
//! There is no framing. Each message is one socket read, so a client sees
//! its bytes back in order but not necessarily in the chunks it sent.

use crate::runtime::{Connection, Handler, Session};
use bytes::Bytes;

#[derive(Debug, Default, Clone, Copy)]
pub struct EchoHandler;

#[derive(Debug, Default)]
pub struct EchoSession;

impl Handler for EchoHandler {
    type Session = EchoSession;

    fn open(&self, _conn: &Connection) -> EchoSession {
        EchoSession
    }
}

impl Session for EchoSession {
    fn feed_message(&mut self, conn: &Connection, data: &[u8]) -> bool {
        conn.enqueue_write(Bytes::copy_from_slice(data))
    }
}
