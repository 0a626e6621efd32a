//! Bundled message handlers.
//!
//! These are small demo protocols the `shardline` binary can serve. Real
//! applications implement [`Handler`](crate::runtime::Handler) themselves.
//!
//! - `echo`: writes every message back
//! - `ping`: line-based ping/pong for health checks
//! - `discard`: throughput sink

pub mod discard;
pub mod echo;
pub mod ping;

pub use discard::{Discard, DiscardHandler};
pub use echo::{EchoHandler, EchoSession};
pub use ping::{PingHandler, PingSession};
