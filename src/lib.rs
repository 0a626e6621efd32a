//! shardline: a sharded multi-threaded TCP server engine.
//!
//! One thread accepts, one thread reads every socket, a fixed pool of shard
//! workers runs the application's [`Handler`](runtime::Handler), and each
//! connection has a writer thread. Messages from one connection are always
//! handled by the same worker, in arrival order.

pub mod config;
pub mod protocols;
pub mod runtime;

pub use config::{Config, ConfigError, EngineConfig};
pub use runtime::{Connection, Handler, LaunchError, Server, Session};
