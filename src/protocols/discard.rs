//! Discard protocol: inbound bytes are accepted and dropped.

use crate::runtime::{Connection, Session};

/// Session that counts what it swallowed. Also usable directly as a
/// handler through `|_: &Connection| Discard::default()`.
#[derive(Debug, Default)]
pub struct Discard {
    bytes: u64,
}

impl Discard {
    pub fn bytes_discarded(&self) -> u64 {
        self.bytes
    }
}

impl Session for Discard {
    fn feed_message(&mut self, _conn: &Connection, data: &[u8]) -> bool {
        self.bytes += data.len() as u64;
        true
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct DiscardHandler;

impl crate::runtime::Handler for DiscardHandler {
    type Session = Discard;

    fn open(&self, _conn: &Connection) -> Discard {
        Discard::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::testing::tcp_pair;
    use crate::runtime::{ConnId, EngineStats};
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_discard_counts_and_writes_nothing() {
        let (_client, server) = tcp_pair();
        let peer = server.peer_addr().unwrap();
        let conn = Connection::spawn(
            ConnId::new(0, 1),
            server,
            peer,
            0,
            Duration::from_millis(5),
            Arc::new(EngineStats::new()),
        )
        .unwrap();

        let mut session = Discard::default();
        assert!(session.feed_message(&conn, b"abc"));
        assert!(session.feed_message(&conn, &[0u8; 100]));
        assert_eq!(session.bytes_discarded(), 103);
        assert_eq!(conn.queued_writes(), 0);
    }
}
