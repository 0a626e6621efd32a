//! Level-triggered readiness polling over raw descriptors.
//!
//! The read loop rebuilds its descriptor set from the live socket snapshot
//! every cycle, which is exactly what poll(2) is shaped for. A [`Notifier`]
//! sits in the same set so another thread can cut the wait short.

use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::time::Duration;

/// Readiness reported for one descriptor after a poll.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Readiness {
    /// Data (or EOF) can be read without blocking.
    pub readable: bool,
    /// Peer hung up, or the socket was shut down locally.
    pub hangup: bool,
    /// Error pending on the socket, or the descriptor is invalid.
    pub error: bool,
}

impl Readiness {
    fn from_revents(revents: libc::c_short) -> Self {
        Self {
            readable: revents & libc::POLLIN != 0,
            hangup: revents & libc::POLLHUP != 0,
            error: revents & (libc::POLLERR | libc::POLLNVAL) != 0,
        }
    }

    /// Anything at all was reported.
    pub fn is_ready(&self) -> bool {
        self.readable || self.hangup || self.error
    }
}

/// A reusable poll(2) descriptor set.
pub struct PollSet {
    fds: Vec<libc::pollfd>,
}

impl PollSet {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            fds: Vec::with_capacity(capacity),
        }
    }

    pub fn clear(&mut self) {
        self.fds.clear();
    }

    /// Watch `fd` for readability. Returns its slot in the set.
    pub fn push(&mut self, fd: RawFd) -> usize {
        self.fds.push(libc::pollfd {
            fd,
            events: libc::POLLIN,
            revents: 0,
        });
        self.fds.len() - 1
    }

    pub fn len(&self) -> usize {
        self.fds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fds.is_empty()
    }

    /// Wait until a descriptor is ready or `timeout` passes (`None` waits
    /// forever). Returns the number of ready descriptors; an interrupted
    /// wait reports zero.
    pub fn poll(&mut self, timeout: Option<Duration>) -> io::Result<usize> {
        let timeout_ms = match timeout {
            None => -1,
            Some(t) if t.is_zero() => 0,
            // Round sub-millisecond waits up so they still block.
            Some(t) => t.as_millis().clamp(1, libc::c_int::MAX as u128) as libc::c_int,
        };

        // SAFETY: `fds` is a live, exclusively borrowed buffer of
        // `fds.len()` initialised pollfd structs.
        let rc = unsafe {
            libc::poll(
                self.fds.as_mut_ptr(),
                self.fds.len() as libc::nfds_t,
                timeout_ms,
            )
        };

        if rc >= 0 {
            return Ok(rc as usize);
        }
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::Interrupted {
            for pfd in &mut self.fds {
                pfd.revents = 0;
            }
            Ok(0)
        } else {
            Err(err)
        }
    }

    /// Readiness of the descriptor at `slot` from the last poll.
    pub fn readiness(&self, slot: usize) -> Readiness {
        self.fds
            .get(slot)
            .map(|pfd| Readiness::from_revents(pfd.revents))
            .unwrap_or_default()
    }
}

/// Number of bytes that can be read from `fd` right now (FIONREAD).
pub fn bytes_available(fd: RawFd) -> io::Result<usize> {
    let mut count: libc::c_int = 0;
    // SAFETY: FIONREAD writes a single c_int through the pointer.
    let rc = unsafe { libc::ioctl(fd, libc::FIONREAD, &mut count as *mut libc::c_int) };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(count.max(0) as usize)
}

/// Wakes a thread blocked in [`PollSet::poll`].
///
/// Backed by a non-blocking socket pair: [`notify`](Self::notify) writes a
/// byte, the poller sees [`fd`](Self::fd) readable and calls
/// [`drain`](Self::drain).
#[derive(Debug)]
pub struct Notifier {
    reader: UnixStream,
    writer: UnixStream,
}

impl Notifier {
    pub fn new() -> io::Result<Self> {
        let (reader, writer) = UnixStream::pair()?;
        reader.set_nonblocking(true)?;
        writer.set_nonblocking(true)?;
        Ok(Self { reader, writer })
    }

    /// Descriptor to include in the poll set.
    pub fn fd(&self) -> RawFd {
        self.reader.as_raw_fd()
    }

    /// Wake the poller. A full pipe already guarantees a wakeup, so
    /// `WouldBlock` is ignored.
    pub fn notify(&self) {
        match (&self.writer).write(&[1]) {
            Ok(_) => {}
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => tracing::warn!(error = %e, "Failed to signal notifier"),
        }
    }

    /// Consume pending wakeups.
    pub fn drain(&self) {
        let mut buf = [0u8; 64];
        loop {
            match (&self.reader).read(&mut buf) {
                Ok(n) if n == buf.len() => continue,
                Ok(_) => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(_) => break,
            }
        }
    }
}
