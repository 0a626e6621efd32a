//! Engine behaviour while the process is out of file descriptors.
//!
//! These tests lower `RLIMIT_NOFILE` for the whole process, so they live in
//! their own test binary and take `LIMIT` to run one at a time.

use shardline::config::EngineConfig;
use shardline::protocols::{DiscardHandler, EchoHandler};
use shardline::runtime::{Handler, Server};
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::io::{Read, Write};
use std::net::{IpAddr, Ipv4Addr, TcpStream};
use std::os::fd::AsRawFd;
use std::sync::{Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

static LIMIT: Mutex<()> = Mutex::new(());

fn nofile() -> libc::rlimit {
    let mut limit = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    // SAFETY: `limit` is a valid out-pointer for the duration of the call.
    assert_eq!(unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, &mut limit) }, 0);
    limit
}

fn set_nofile(limit: &libc::rlimit) {
    // SAFETY: `limit` points to an initialised rlimit.
    assert_eq!(unsafe { libc::setrlimit(libc::RLIMIT_NOFILE, limit) }, 0);
}

/// Puts the original descriptor limit back when dropped.
struct LoweredLimit(libc::rlimit);

impl LoweredLimit {
    fn to(soft: libc::rlim_t) -> Self {
        let original = nofile();
        set_nofile(&libc::rlimit {
            rlim_cur: soft,
            rlim_max: original.rlim_max,
        });
        LoweredLimit(original)
    }
}

impl Drop for LoweredLimit {
    fn drop(&mut self) {
        set_nofile(&self.0);
    }
}

fn start<H: Handler>(handler: H) -> Server<H> {
    let config = EngineConfig {
        host: IpAddr::V4(Ipv4Addr::LOCALHOST),
        port: 0,
        shards: 1,
        poll_interval: Duration::from_millis(5),
        ..EngineConfig::default()
    };
    let server = Server::new(config, handler);
    server.launch().unwrap();
    server
}

fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(2));
    }
    condition()
}

#[test]
fn test_backlog_accepted_once_descriptors_free_up() {
    let _serial = LIMIT.lock().unwrap_or_else(PoisonError::into_inner);
    let server = start(DiscardHandler);
    let addr = SockAddr::from(server.local_addr().unwrap());

    // Created up front so connecting needs no new descriptor.
    let clients: Vec<Socket> = (0..3)
        .map(|_| Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP)).unwrap())
        .collect();
    let highest = clients.iter().map(|c| c.as_raw_fd()).max().unwrap();

    let lowered = LoweredLimit::to((highest + 1) as libc::rlim_t);
    for client in &clients {
        client.connect(&addr).unwrap();
    }
    thread::sleep(Duration::from_millis(300));
    drop(lowered);

    // No further client activity: the waiting connections alone must be
    // picked up.
    assert!(eventually(|| server.stats().accepted == 3));
    assert!(eventually(|| server.connections() == 3));
}

#[test]
fn test_read_loop_survives_failed_poll() {
    let _serial = LIMIT.lock().unwrap_or_else(PoisonError::into_inner);
    let server = start(EchoHandler);

    let mut client = TcpStream::connect(server.local_addr().unwrap()).unwrap();
    client
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    assert!(eventually(|| server.stats().accepted == 1));

    // poll(2) rejects more descriptors than RLIMIT_NOFILE allows.
    let lowered = LoweredLimit::to(1);
    thread::sleep(Duration::from_millis(100));
    drop(lowered);

    client.write_all(b"still here").unwrap();
    let mut buf = [0u8; 10];
    client.read_exact(&mut buf).unwrap();
    assert_eq!(&buf, b"still here");
    assert!(server.is_running());
}
