//! Ping protocol session.

use super::parser::{self, Command, ParseResult};
use crate::runtime::{Connection, Session};
use bytes::{Buf, BytesMut};
use tracing::debug;

const MAX_LINE_LENGTH: usize = 1024;

/// Handler for the ping protocol: one [`PingSession`] per connection.
#[derive(Debug, Default, Clone, Copy)]
pub struct PingHandler;

impl crate::runtime::Handler for PingHandler {
    type Session = PingSession;

    fn open(&self, _conn: &Connection) -> PingSession {
        PingSession::default()
    }
}

/// Buffers partial lines across reads, since a message is whatever a
/// single read returned.
#[derive(Debug, Default)]
pub struct PingSession {
    buffer: BytesMut,
    quit: bool,
}

impl Session for PingSession {
    fn feed_message(&mut self, conn: &Connection, data: &[u8]) -> bool {
        if self.quit {
            return false;
        }
        self.buffer.extend_from_slice(data);

        let mut response = BytesMut::new();
        let mut handled = true;
        loop {
            match parser::parse(&self.buffer) {
                ParseResult::Complete(command, consumed) => {
                    match command {
                        Command::Ping => response.extend_from_slice(parser::PONG),
                        Command::PingMsg(msg) => parser::write_pong_msg(msg, &mut response),
                        Command::Quit => {
                            response.extend_from_slice(parser::OK);
                            self.quit = true;
                        }
                    }
                    self.buffer.advance(consumed);
                    if self.quit {
                        self.buffer.clear();
                        break;
                    }
                }
                ParseResult::Error(consumed) => {
                    response.extend_from_slice(parser::ERROR);
                    self.buffer.advance(consumed);
                    handled = false;
                }
                ParseResult::Incomplete => {
                    if self.buffer.len() > MAX_LINE_LENGTH {
                        debug!(conn_id = %conn.id(), bytes = self.buffer.len(), "Ping line too long");
                        response.extend_from_slice(parser::ERROR);
                        self.buffer.clear();
                        handled = false;
                    }
                    break;
                }
            }
        }

        if !response.is_empty() {
            conn.enqueue_write(response.freeze());
        }
        if self.quit {
            conn.finish();
        }
        handled
    }
}
