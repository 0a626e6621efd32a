//! Thread-per-role runtime for a sharded TCP server.
//!
//! Roles:
//! - Accept: one thread, `mio` readiness on the listener
//! - Read: one thread, level-triggered `poll(2)` over every live socket
//! - Workers: one thread per shard, each draining a FIFO queue
//! - Writers: one thread per connection, flushing its outbound queue
//!
//! Shared pieces:
//! - `ConcurrentVec`: mutex-guarded growable array (the live socket set)
//! - `ConnectionTable`: slab of connections keyed by [`ConnId`]
//! - `ShardQueue`: inbound messages for one worker
//! - [`Handler`] / [`Session`]: what the application plugs in

mod concurrent_vec;
mod connection;
mod handler;
pub mod poll;
mod server;
mod shard;
mod stats;
mod table;

#[cfg(test)]
pub(crate) mod testing;

pub use concurrent_vec::{ConcurrentVec, Guarded};
pub use connection::Connection;
pub use handler::{Handler, Session};
pub use server::{LaunchError, Server};
pub use stats::{EngineStats, StatsSnapshot};
pub use table::{ConnId, LiveSocket};
