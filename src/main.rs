//! shardline: run the sharded TCP engine with a bundled handler.
//!
//! Handlers:
//! - `echo`: writes every message back
//! - `ping`: PING/PONG line protocol
//! - `discard`: drops everything it reads
//!
//! Configuration via CLI arguments or TOML file. SIGINT/SIGTERM close the
//! server cleanly.

use shardline::config::{Config, ProtocolType};
use shardline::protocols::{DiscardHandler, EchoHandler, PingHandler};
use shardline::runtime::{Handler, Server};
use std::io;
use std::process::ExitCode;
use std::sync::Arc;
use std::thread;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

fn main() -> ExitCode {
    let config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::FAILURE;
        }
    };

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        host = %config.engine.host,
        port = config.engine.port,
        shards = config.engine.shards,
        protocol = ?config.protocol,
        max_message_size = config.engine.max_message_size,
        "Starting shardline server"
    );

    // Blocked before any engine thread exists, so every thread inherits it
    // and only the signal thread ever sees these signals.
    let signals = match block_signals() {
        Ok(signals) => signals,
        Err(e) => {
            error!(error = %e, "Failed to block termination signals");
            return ExitCode::FAILURE;
        }
    };

    match config.protocol {
        ProtocolType::Echo => serve(config, EchoHandler, signals),
        ProtocolType::Ping => serve(config, PingHandler, signals),
        ProtocolType::Discard => serve(config, DiscardHandler, signals),
    }
}

fn serve<H: Handler>(config: Config, handler: H, signals: libc::sigset_t) -> ExitCode {
    let server = Arc::new(Server::new(config.engine, handler));
    if server.launch().is_err() {
        return ExitCode::FAILURE;
    }

    let closer = Arc::clone(&server);
    let spawned = thread::Builder::new()
        .name("signals".into())
        .spawn(move || {
            match wait_for_signal(&signals) {
                Ok(signal) => info!(signal, "Received termination signal"),
                Err(e) => error!(error = %e, "Waiting for signals failed"),
            }
            closer.close();
        });
    if let Err(e) = spawned {
        error!(error = %e, "Could not spawn signal thread");
        server.close();
        return ExitCode::FAILURE;
    }

    server.wait();
    let stats = server.stats();
    info!(
        accepted = stats.accepted,
        messages = stats.messages_handled,
        bytes_read = stats.bytes_read,
        bytes_written = stats.bytes_written,
        "Server stopped"
    );
    ExitCode::SUCCESS
}

/// Block SIGINT and SIGTERM for the calling thread and its future children.
fn block_signals() -> io::Result<libc::sigset_t> {
    // SAFETY: the set is initialised by sigemptyset before use and only
    // passed to libc by reference.
    unsafe {
        let mut set: libc::sigset_t = std::mem::zeroed();
        libc::sigemptyset(&mut set);
        libc::sigaddset(&mut set, libc::SIGINT);
        libc::sigaddset(&mut set, libc::SIGTERM);
        let rc = libc::pthread_sigmask(libc::SIG_BLOCK, &set, std::ptr::null_mut());
        if rc != 0 {
            return Err(io::Error::from_raw_os_error(rc));
        }
        Ok(set)
    }
}

fn wait_for_signal(set: &libc::sigset_t) -> io::Result<libc::c_int> {
    let mut signal: libc::c_int = 0;
    // SAFETY: `set` is a valid, initialised signal set.
    let rc = unsafe { libc::sigwait(set, &mut signal) };
    if rc != 0 {
        return Err(io::Error::from_raw_os_error(rc));
    }
    Ok(signal)
}
