//! Ping protocol implementation.
//!
//! A minimal line protocol for health checks and latency measurement:
//! - Client sends: `PING\r\n` or `PING <message>\r\n`
//! - Server responds: `PONG\r\n` or `PONG <message>\r\n`
//!
//! ## Use Cases
//!
//! 1. **Health checks**: verify the engine is accepting, reading and
//!    dispatching without any application logic in the way.
//!
//! 2. **Latency measurement**: measures the accept → read → shard → writer
//!    path on its own.
//!
//! ## Protocol Format
//!
//! ```text
//! Request:  PING\r\n
//! Response: PONG\r\n
//!
//! Request:  PING hello\r\n
//! Response: PONG hello\r\n
//!
//! Request:  QUIT\r\n
//! Response: OK\r\n          (then the server closes its side)
//! ```
//!
//! Anything else is answered with `ERROR unknown command\r\n`.

pub mod handler;
pub mod parser;

pub use handler::{PingHandler, PingSession};
