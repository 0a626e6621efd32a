//! Ping protocol parser.

use bytes::{BufMut, BytesMut};

/// Parsed ping command, borrowing from the input buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command<'a> {
    /// Simple ping (no message).
    Ping,
    /// Ping with a message to echo back.
    PingMsg(&'a [u8]),
    /// Quit command.
    Quit,
}

/// Parse result.
#[derive(Debug)]
pub enum ParseResult<'a> {
    /// Parsed command and the bytes consumed, line ending included.
    Complete(Command<'a>, usize),
    /// Need more data.
    Incomplete,
    /// Unknown command; the whole line is consumed.
    Error(usize),
}

/// Parse one ping protocol line from the front of `input`.
pub fn parse(input: &[u8]) -> ParseResult<'_> {
    let Some(line_end) = find_crlf(input) else {
        return ParseResult::Incomplete;
    };

    let line = &input[..line_end];
    let consumed = line_end + 2;

    // Case-insensitive
    if line.eq_ignore_ascii_case(b"PING") {
        ParseResult::Complete(Command::Ping, consumed)
    } else if line.eq_ignore_ascii_case(b"QUIT") {
        ParseResult::Complete(Command::Quit, consumed)
    } else if line.len() > 5 && line[..5].eq_ignore_ascii_case(b"PING ") {
        ParseResult::Complete(Command::PingMsg(&line[5..]), consumed)
    } else {
        ParseResult::Error(consumed)
    }
}

pub const PONG: &[u8] = b"PONG\r\n";
pub const OK: &[u8] = b"OK\r\n";
pub const ERROR: &[u8] = b"ERROR unknown command\r\n";

/// Append `PONG <msg>\r\n` to `output`.
pub fn write_pong_msg(msg: &[u8], output: &mut BytesMut) {
    output.reserve(5 + msg.len() + 2);
    output.put_slice(b"PONG ");
    output.put_slice(msg);
    output.put_slice(b"\r\n");
}

/// Find \r\n in buffer, returning the position of \r.
fn find_crlf(buffer: &[u8]) -> Option<usize> {
    buffer.windows(2).position(|w| w == b"\r\n")
}
