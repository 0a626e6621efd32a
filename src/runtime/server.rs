//! The server engine.
//!
//! Four kinds of threads share one [`ConnectionTable`]:
//!
//! - `accept`: waits on the listener, registers each new connection and
//!   assigns it round-robin to a shard.
//! - `read`: polls every live socket (level-triggered), turns each read into
//!   an inbound message on the owning shard's queue, and runs the disconnect
//!   path on EOF, hangup or error.
//! - `shard-<n>`: pops its queue in FIFO order, calls the handler, then
//!   settles the message against the table.
//! - `writer-<conn>`: one per connection, see [`Connection`].
//!
//! A connection is reaped exactly once, when it is disconnected and has no
//! pending messages. Whichever of the read loop (at disconnect) or a worker
//! (after its last message) observes that first removes it from the table.
//! Locks cover metadata only; no lock is held across socket I/O or a handler
//! call.

use crate::config::{ConfigError, EngineConfig};
use crate::runtime::poll::{bytes_available, Notifier, PollSet, Readiness};
use crate::runtime::shard::{InboundMessage, ShardQueue};
use crate::runtime::table::{ConnectionTable, Disconnect, Entry, LiveSocket};
use crate::runtime::{ConnId, Connection, EngineStats, Handler, Session, StatsSnapshot};
use bytes::Bytes;
use mio::net::TcpListener;
use mio::{Events, Interest, Poll, Token, Waker};
use socket2::{Domain, Protocol, SockRef, Socket, Type};
use std::fmt;
use std::io::{self, Read};
use std::net::{SocketAddr, TcpStream};
use std::os::fd::RawFd;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, OnceLock, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, trace, warn};

const LISTENER_TOKEN: Token = Token(0);
const WAKER_TOKEN: Token = Token(1);

/// Delay before accept retries a listener it could not drain, and before
/// either loop retries a failed readiness wait.
const RETRY_DELAY: Duration = Duration::from_millis(20);

/// Why [`Server::launch`] failed. No engine thread is left running.
#[derive(Debug)]
pub enum LaunchError {
    /// The server was already launched or closed.
    AlreadyLaunched,
    Config(ConfigError),
    /// Creating or configuring the listening socket failed.
    Socket(io::Error),
    Bind(SocketAddr, io::Error),
    Listen(io::Error),
    /// Poller or notifier setup failed.
    Setup(io::Error),
    Spawn(&'static str, io::Error),
}

impl fmt::Display for LaunchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LaunchError::AlreadyLaunched => write!(f, "Server already launched or closed"),
            LaunchError::Config(e) => write!(f, "{e}"),
            LaunchError::Socket(e) => write!(f, "Could not create the server socket: {e}"),
            LaunchError::Bind(addr, e) => {
                write!(f, "Could not bind the server socket to {addr}: {e}")
            }
            LaunchError::Listen(e) => write!(f, "Could not listen on the server socket: {e}"),
            LaunchError::Setup(e) => write!(f, "Could not set up the event poller: {e}"),
            LaunchError::Spawn(role, e) => write!(f, "Could not spawn {role} thread: {e}"),
        }
    }
}

impl std::error::Error for LaunchError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            LaunchError::AlreadyLaunched => None,
            LaunchError::Config(e) => Some(e),
            LaunchError::Socket(e)
            | LaunchError::Bind(_, e)
            | LaunchError::Listen(e)
            | LaunchError::Setup(e)
            | LaunchError::Spawn(_, e) => Some(e),
        }
    }
}

/// State every engine thread shares.
struct Shared<H: Handler> {
    config: EngineConfig,
    handler: H,
    table: ConnectionTable<H::Session>,
    shards: Vec<ShardQueue<H::Session>>,
    stats: Arc<EngineStats>,
    shutdown: AtomicBool,
}

/// Handles owned while the engine runs.
struct Running {
    waker: Arc<Waker>,
    wakeup: Arc<Notifier>,
    accept: Option<JoinHandle<()>>,
    read: Option<JoinHandle<()>>,
    workers: Vec<JoinHandle<()>>,
}

enum State {
    Idle,
    Running(Running),
    Stopping,
    Stopped,
}

/// A sharded TCP server.
///
/// ```no_run
/// use shardline::config::EngineConfig;
/// use shardline::protocols::EchoHandler;
/// use shardline::runtime::Server;
///
/// let server = Server::new(EngineConfig::new(4, 8000), EchoHandler);
/// server.launch().expect("launch");
/// server.wait();
/// ```
pub struct Server<H: Handler> {
    shared: Arc<Shared<H>>,
    state: Mutex<State>,
    stopped: Condvar,
    local_addr: OnceLock<SocketAddr>,
}

impl<H: Handler> Server<H> {
    /// Create an engine. Nothing is bound until [`launch`](Self::launch).
    pub fn new(config: EngineConfig, handler: H) -> Self {
        let shards = (0..config.shards).map(ShardQueue::new).collect();
        Self {
            shared: Arc::new(Shared {
                config,
                handler,
                table: ConnectionTable::new(),
                shards,
                stats: Arc::new(EngineStats::new()),
                shutdown: AtomicBool::new(false),
            }),
            state: Mutex::new(State::Idle),
            stopped: Condvar::new(),
            local_addr: OnceLock::new(),
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Bind, listen and start every engine thread.
    pub fn launch(&self) -> Result<(), LaunchError> {
        let mut state = self.lock_state();
        if !matches!(*state, State::Idle) {
            return Err(LaunchError::AlreadyLaunched);
        }

        let running = self
            .shared
            .config
            .validate()
            .map_err(LaunchError::Config)
            .and_then(|()| self.start());
        match running {
            Ok((running, local_addr)) => {
                let _ = self.local_addr.set(local_addr);
                info!(
                    addr = %local_addr,
                    shards = self.shared.shards.len(),
                    "Server listening"
                );
                *state = State::Running(running);
                Ok(())
            }
            Err(e) => {
                error!(error = %e, "Failed to launch server");
                Err(e)
            }
        }
    }

    fn start(&self) -> Result<(Running, SocketAddr), LaunchError> {
        let config = &self.shared.config;
        let listener = bind_listener(config.listen_addr(), config.backlog)?;
        let local_addr = listener.local_addr().map_err(LaunchError::Socket)?;
        let mut listener = TcpListener::from_std(listener);

        let poll = Poll::new().map_err(LaunchError::Setup)?;
        poll.registry()
            .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)
            .map_err(LaunchError::Setup)?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN).map_err(LaunchError::Setup)?);
        let wakeup = Arc::new(Notifier::new().map_err(LaunchError::Setup)?);

        let mut running = Running {
            waker,
            wakeup,
            accept: None,
            read: None,
            workers: Vec::with_capacity(self.shared.shards.len()),
        };

        if let Err(e) = self.spawn_tasks(&mut running, poll, listener) {
            self.stop(running);
            self.shared.shutdown.store(false, Ordering::Release);
            return Err(e);
        }
        Ok((running, local_addr))
    }

    /// Workers first, so nothing is accepted before its shard is served.
    fn spawn_tasks(
        &self,
        running: &mut Running,
        poll: Poll,
        listener: TcpListener,
    ) -> Result<(), LaunchError> {
        for shard_id in 0..self.shared.shards.len() {
            let shared = Arc::clone(&self.shared);
            let handle = thread::Builder::new()
                .name(format!("shard-{shard_id}"))
                .spawn(move || shared.worker_loop(shard_id))
                .map_err(|e| LaunchError::Spawn("worker", e))?;
            running.workers.push(handle);
        }

        let shared = Arc::clone(&self.shared);
        let wakeup = Arc::clone(&running.wakeup);
        running.read = Some(
            thread::Builder::new()
                .name("read".into())
                .spawn(move || shared.read_loop(&wakeup))
                .map_err(|e| LaunchError::Spawn("read", e))?,
        );

        let shared = Arc::clone(&self.shared);
        let wakeup = Arc::clone(&running.wakeup);
        running.accept = Some(
            thread::Builder::new()
                .name("accept".into())
                .spawn(move || shared.accept_loop(poll, listener, &wakeup))
                .map_err(|e| LaunchError::Spawn("accept", e))?,
        );
        Ok(())
    }

    /// Signal every thread, join them (accept, read, workers), then close
    /// every remaining connection and drop queued messages.
    fn stop(&self, running: Running) {
        self.shared.shutdown.store(true, Ordering::Release);
        if let Err(e) = running.waker.wake() {
            warn!(error = %e, "Failed to wake accept loop");
        }
        running.wakeup.notify();
        for shard in &self.shared.shards {
            shard.wake();
        }

        join_task(running.accept, "accept");
        join_task(running.read, "read");
        for worker in running.workers {
            join_task(Some(worker), "worker");
        }

        // The listener closed with the accept thread.
        let connections = self.shared.table.drain();
        let closed = connections.len();
        for entry in connections {
            self.shared.sweep(&entry);
        }
        let dropped: usize = self.shared.shards.iter().map(ShardQueue::drain).sum();
        info!(connections = closed, dropped_messages = dropped, "Server closed");
    }

    /// Block until the engine has been closed. Returns immediately if it was
    /// never launched.
    pub fn wait(&self) {
        let mut state = self.lock_state();
        while matches!(*state, State::Running(_) | State::Stopping) {
            state = self
                .stopped
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Shut everything down. Idempotent, and safe to call from any thread,
    /// including a handler running on a worker.
    pub fn close(&self) {
        let running = {
            let mut state = self.lock_state();
            match std::mem::replace(&mut *state, State::Stopping) {
                State::Running(running) => running,
                State::Idle => {
                    *state = State::Stopped;
                    self.stopped.notify_all();
                    return;
                }
                previous => {
                    *state = previous;
                    return;
                }
            }
        };

        info!("Closing server");
        self.stop(running);

        *self.lock_state() = State::Stopped;
        self.stopped.notify_all();
    }

    /// Address the listener is bound to, once launched.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr.get().copied()
    }

    pub fn is_running(&self) -> bool {
        matches!(*self.lock_state(), State::Running(_))
    }

    pub fn config(&self) -> &EngineConfig {
        &self.shared.config
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.shared.stats.snapshot()
    }

    /// Connections in the table, including disconnected ones whose messages
    /// are still being handled.
    pub fn connections(&self) -> usize {
        self.shared.table.len()
    }
}

impl<H: Handler> Drop for Server<H> {
    fn drop(&mut self) {
        self.close();
    }
}

fn join_task(handle: Option<JoinHandle<()>>, role: &'static str) {
    let Some(handle) = handle else {
        return;
    };
    // close() may run on a worker, which cannot join itself.
    if handle.thread().id() == thread::current().id() {
        return;
    }
    if handle.join().is_err() {
        error!(role, "Engine thread panicked");
    }
}

/// Outcome of servicing one ready socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Serviced {
    Done,
    /// Still readable, no progress made; leave it out of the next poll.
    Throttled,
}

/// Rebuild the read loop's poll set: the wakeup notifier in slot 0, then
/// every live socket not in `skip`. `polled[i]` is the socket in slot `i + 1`.
fn fill_poll_set(
    poll_set: &mut PollSet,
    wakeup_fd: RawFd,
    sockets: &[LiveSocket],
    skip: &[ConnId],
    polled: &mut Vec<LiveSocket>,
) {
    poll_set.clear();
    polled.clear();
    poll_set.push(wakeup_fd);
    for socket in sockets {
        if !skip.contains(&socket.id) {
            poll_set.push(socket.fd);
            polled.push(*socket);
        }
    }
}

/// Accept failures that clear once descriptors or memory are released.
fn is_resource_exhausted(e: &io::Error) -> bool {
    matches!(
        e.raw_os_error(),
        Some(libc::EMFILE | libc::ENFILE | libc::ENOBUFS | libc::ENOMEM)
    )
}

fn bind_listener(addr: SocketAddr, backlog: i32) -> Result<std::net::TcpListener, LaunchError> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
        .map_err(LaunchError::Socket)?;
    socket.set_reuse_address(true).map_err(LaunchError::Socket)?;
    socket.set_nonblocking(true).map_err(LaunchError::Socket)?;
    socket
        .bind(&addr.into())
        .map_err(|e| LaunchError::Bind(addr, e))?;
    socket.listen(backlog).map_err(LaunchError::Listen)?;
    Ok(socket.into())
}

impl<H: Handler> Shared<H> {
    fn is_shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    fn accept_loop(&self, mut poll: Poll, listener: TcpListener, wakeup: &Notifier) {
        let mut events = Events::with_capacity(128);
        let mut next_shard = 0;
        // The listener is edge-triggered: once accept stops short of
        // WouldBlock, no event announces what is left in the backlog.
        let mut backlog = false;

        debug!("Accept loop started");
        while !self.is_shutting_down() {
            let timeout = backlog.then_some(RETRY_DELAY);
            if let Err(e) = poll.poll(&mut events, timeout) {
                if e.kind() != io::ErrorKind::Interrupted {
                    error!(error = %e, "Accept poll failed");
                    thread::sleep(RETRY_DELAY);
                }
                continue;
            }

            let listener_ready = events.iter().any(|event| event.token() == LISTENER_TOKEN);
            if listener_ready || backlog {
                backlog = !self.accept_pending(&listener, &mut next_shard, wakeup);
            }
        }
        debug!("Accept loop stopped");
    }

    /// Accept until the listener would block. Returns `false` if an error
    /// stopped it first, leaving connections in the backlog.
    fn accept_pending(
        &self,
        listener: &TcpListener,
        next_shard: &mut usize,
        wakeup: &Notifier,
    ) -> bool {
        let listener = SockRef::from(listener);
        while !self.is_shutting_down() {
            let (socket, peer) = match listener.accept() {
                Ok((socket, addr)) => match addr.as_socket() {
                    Some(peer) => (socket, peer),
                    None => {
                        warn!("Accepted a non-IP socket");
                        continue;
                    }
                },
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::Interrupted | io::ErrorKind::ConnectionAborted
                    ) =>
                {
                    continue
                }
                Err(e) if is_resource_exhausted(&e) => {
                    warn!(error = %e, "Accept deferred, out of resources");
                    return false;
                }
                Err(e) => {
                    error!(error = %e, "Accept error");
                    return false;
                }
            };

            let shard_id = *next_shard;
            *next_shard = (*next_shard + 1) % self.shards.len();

            match self.register(socket, peer, shard_id) {
                Ok(id) => {
                    wakeup.notify();
                    debug!(conn_id = %id, peer = %peer, shard = shard_id, "Accepted connection");
                }
                Err(e) => warn!(peer = %peer, error = %e, "Failed to register connection"),
            }
        }
        true
    }

    fn register(&self, socket: Socket, peer: SocketAddr, shard_id: usize) -> io::Result<ConnId> {
        socket.set_nonblocking(false)?;
        socket.set_nodelay(true)?;
        let stream: TcpStream = socket.into();

        let id = self.table.reserve();
        let conn = match Connection::spawn(
            id,
            stream,
            peer,
            shard_id,
            self.config.writer_wait,
            Arc::clone(&self.stats),
        ) {
            Ok(conn) => conn,
            Err(e) => {
                self.table.abandon(id);
                return Err(e);
            }
        };

        let session = self.handler.open(&conn);
        if !self.table.activate(Arc::new(Entry::new(conn, session))) {
            return Err(io::Error::new(io::ErrorKind::Other, "server is shutting down"));
        }
        self.stats.record_accept();
        Ok(id)
    }

    fn read_loop(&self, wakeup: &Notifier) {
        let mut sockets = Vec::new();
        let mut polled = Vec::new();
        let mut throttled = Vec::new();
        let mut poll_set = PollSet::with_capacity(64);

        debug!("Read loop started");
        while !self.is_shutting_down() {
            self.table.live_sockets().snapshot_into(&mut sockets);
            fill_poll_set(&mut poll_set, wakeup.fd(), &sockets, &throttled, &mut polled);
            throttled.clear();

            match poll_set.poll(Some(self.config.poll_interval)) {
                Ok(0) => continue,
                Ok(_) => {}
                Err(e) => {
                    // EINVAL once the set outgrows RLIMIT_NOFILE, among others.
                    error!(error = %e, sockets = polled.len(), "Readiness poll failed");
                    thread::sleep(RETRY_DELAY);
                    continue;
                }
            }

            if poll_set.readiness(0).is_ready() {
                wakeup.drain();
            }

            for (slot, socket) in polled.iter().enumerate() {
                if self.is_shutting_down() {
                    break;
                }
                let readiness = poll_set.readiness(slot + 1);
                if readiness.is_ready() && self.service(*socket, readiness) == Serviced::Throttled {
                    throttled.push(socket.id);
                }
            }
        }
        debug!("Read loop stopped");
    }

    /// Handle one ready socket: read a message or run the disconnect path.
    fn service(&self, socket: LiveSocket, readiness: Readiness) -> Serviced {
        // Pending data is delivered before a hangup is acted on.
        if readiness.error || (readiness.hangup && !readiness.readable) {
            self.disconnect(socket);
            return Serviced::Done;
        }

        let available = match bytes_available(socket.fd) {
            Ok(0) => {
                self.disconnect(socket);
                return Serviced::Done;
            }
            Ok(n) => n,
            Err(e) => {
                debug!(conn_id = %socket.id, error = %e, "Could not query readable bytes");
                self.disconnect(socket);
                return Serviced::Done;
            }
        };

        let Some(entry) = self.table.get(socket.id) else {
            return Serviced::Done;
        };

        let len = available.min(self.config.max_message_size);
        let mut buf = Vec::new();
        if let Err(e) = buf.try_reserve_exact(len) {
            // The bytes stay in the socket, which is left out of the next poll.
            warn!(conn_id = %socket.id, bytes = len, error = %e, "Read buffer allocation failed");
            return Serviced::Throttled;
        }
        buf.resize(len, 0);

        let mut stream = entry.conn.stream();
        let n = match stream.read(&mut buf) {
            Ok(0) => {
                self.disconnect(socket);
                return Serviced::Done;
            }
            Ok(n) => n,
            Err(ref e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
                ) =>
            {
                return Serviced::Done
            }
            Err(e) => {
                debug!(conn_id = %socket.id, error = %e, "Read failed");
                self.disconnect(socket);
                return Serviced::Done;
            }
        };
        buf.truncate(n);
        self.stats.record_read(n);

        self.dispatch(socket.id, Bytes::from(buf));
        Serviced::Done
    }

    /// Count the message against its connection and queue it on the
    /// connection's shard.
    fn dispatch(&self, id: ConnId, data: Bytes) {
        match self.table.begin_message(id) {
            Some(entry) => {
                let shard_id = entry.conn.shard_id();
                self.stats.record_enqueued();
                self.shards[shard_id].push(InboundMessage { entry, data });
            }
            None => {
                // Reaped by a concurrent disconnect; expected, not an error.
                trace!(conn_id = %id, bytes = data.len(), "Discarding message for reaped connection");
                self.stats.record_discard();
            }
        }
    }

    fn disconnect(&self, socket: LiveSocket) {
        match self.table.mark_disconnected(socket) {
            Disconnect::Reaped(entry) => {
                self.stats.record_disconnect();
                entry.conn.shutdown_socket();
                debug!(conn_id = %socket.id, "Client disconnected");
                self.destroy(&entry);
            }
            Disconnect::Deferred { entry, pending } => {
                self.stats.record_disconnect();
                entry.conn.shutdown_socket();
                debug!(conn_id = %socket.id, pending, "Client disconnected, messages pending");
            }
            Disconnect::Stale => {
                trace!(conn_id = %socket.id, "Disconnect for unknown connection");
            }
        }
    }

    fn worker_loop(&self, shard_id: usize) {
        let shard = &self.shards[shard_id];

        debug!(shard = shard.id(), "Worker started");
        while let Some(message) = shard.pop(&self.shutdown, self.config.worker_wait) {
            let InboundMessage { entry, data } = message;
            let conn = &entry.conn;

            let handled = {
                let mut session = entry.session();
                panic::catch_unwind(AssertUnwindSafe(|| {
                    self.handler
                        .on_message(shard_id, conn, &mut *session, &data)
                }))
                .unwrap_or_else(|_| {
                    error!(conn_id = %conn.id(), shard = shard_id, "Message handler panicked");
                    false
                })
            };
            self.stats.record_handled(handled);
            if !handled {
                debug!(
                    conn_id = %conn.id(),
                    shard = shard_id,
                    bytes = data.len(),
                    "Handler did not handle message"
                );
            }
            drop(data);

            if let Some(reaped) = self.table.finish_message(conn.id()) {
                self.destroy(&reaped);
            }
        }
        debug!(shard = shard_id, "Worker stopped");
    }

    /// Release a connection that has just been removed from the table.
    fn destroy(&self, entry: &Entry<H::Session>) {
        entry.conn.close();
        entry.session().on_close(&entry.conn);
        self.stats.record_reap();
        debug!(
            conn_id = %entry.conn.id(),
            peer = %entry.conn.peer_addr(),
            "Connection reaped"
        );
    }

    /// Shutdown variant of [`destroy`](Self::destroy). A session still held
    /// by a handler (close() called from inside it) skips its close hook.
    fn sweep(&self, entry: &Entry<H::Session>) {
        entry.conn.close();
        match entry.try_session() {
            Some(mut session) => session.on_close(&entry.conn),
            None => debug!(conn_id = %entry.conn.id(), "Session busy at shutdown"),
        }
        self.stats.record_reap();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::testing::eventually;
    use std::io::Write;
    use std::net::{IpAddr, Ipv4Addr};
    use std::time::Duration;

    /// Everything the recording handler observed.
    #[derive(Default)]
    struct Recorder {
        opened: Mutex<Vec<(ConnId, usize)>>,
        messages: Mutex<Vec<(ConnId, usize, Vec<u8>)>>,
        closed: Mutex<Vec<ConnId>>,
    }

    impl Recorder {
        fn opened(&self) -> Vec<(ConnId, usize)> {
            self.opened.lock().unwrap().clone()
        }

        fn closed(&self) -> Vec<ConnId> {
            self.closed.lock().unwrap().clone()
        }

        fn bytes_from(&self, id: ConnId) -> Vec<u8> {
            self.messages
                .lock()
                .unwrap()
                .iter()
                .filter(|(conn, _, _)| *conn == id)
                .flat_map(|(_, _, data)| data.iter().copied())
                .collect()
        }

        fn shards_for(&self, id: ConnId) -> Vec<usize> {
            self.messages
                .lock()
                .unwrap()
                .iter()
                .filter(|(conn, _, _)| *conn == id)
                .map(|(_, shard, _)| *shard)
                .collect()
        }
    }

    /// Blocks handlers until opened.
    #[derive(Default)]
    struct Gate {
        open: Mutex<bool>,
        changed: Condvar,
    }

    impl Gate {
        fn closed() -> Arc<Self> {
            Arc::new(Self::default())
        }

        fn pass(&self) {
            let mut open = self.open.lock().unwrap();
            while !*open {
                open = self.changed.wait(open).unwrap();
            }
        }

        fn open(&self) {
            *self.open.lock().unwrap() = true;
            self.changed.notify_all();
        }
    }

    struct Recording {
        recorder: Arc<Recorder>,
        gate: Option<Arc<Gate>>,
        echo: bool,
    }

    struct RecordingSession {
        recorder: Arc<Recorder>,
        gate: Option<Arc<Gate>>,
        echo: bool,
    }

    impl Session for RecordingSession {
        fn feed_message(&mut self, conn: &Connection, data: &[u8]) -> bool {
            if let Some(gate) = &self.gate {
                gate.pass();
            }
            self.recorder
                .messages
                .lock()
                .unwrap()
                .push((conn.id(), conn.shard_id(), data.to_vec()));
            if self.echo {
                conn.enqueue_write(Bytes::copy_from_slice(data));
            }
            true
        }

        fn on_close(&mut self, conn: &Connection) {
            self.recorder.closed.lock().unwrap().push(conn.id());
        }
    }

    impl Handler for Recording {
        type Session = RecordingSession;

        fn open(&self, conn: &Connection) -> RecordingSession {
            self.recorder
                .opened
                .lock()
                .unwrap()
                .push((conn.id(), conn.shard_id()));
            RecordingSession {
                recorder: Arc::clone(&self.recorder),
                gate: self.gate.clone(),
                echo: self.echo,
            }
        }
    }

    fn test_config(shards: usize) -> EngineConfig {
        EngineConfig {
            host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: 0,
            shards,
            poll_interval: Duration::from_millis(5),
            ..EngineConfig::default()
        }
    }

    fn recording(shards: usize, gate: Option<Arc<Gate>>, echo: bool) -> (Server<Recording>, Arc<Recorder>) {
        let recorder = Arc::new(Recorder::default());
        let server = Server::new(
            test_config(shards),
            Recording {
                recorder: Arc::clone(&recorder),
                gate,
                echo,
            },
        );
        server.launch().unwrap();
        (server, recorder)
    }

    fn connect<H: Handler>(server: &Server<H>) -> TcpStream {
        TcpStream::connect(server.local_addr().unwrap()).unwrap()
    }

    /// Connect and wait until the engine has registered the connection.
    fn connect_registered(
        server: &Server<Recording>,
        recorder: &Recorder,
    ) -> (TcpStream, ConnId, usize) {
        let before = recorder.opened().len();
        let stream = connect(server);
        assert!(eventually(|| recorder.opened().len() == before + 1));
        let (id, shard) = recorder.opened()[before];
        (stream, id, shard)
    }

    fn pending(server: &Server<Recording>, id: ConnId) -> Option<u32> {
        server
            .shared
            .table
            .get(id)
            .map(|entry| entry.conn.pending_messages())
    }

    #[test]
    fn test_launch_reports_address_once() {
        let (server, _) = recording(1, None, false);
        assert!(server.is_running());
        assert_ne!(server.local_addr().unwrap().port(), 0);
        assert!(matches!(server.launch(), Err(LaunchError::AlreadyLaunched)));
        server.close();
        assert!(!server.is_running());
    }

    #[test]
    fn test_launch_fails_when_port_taken() {
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let mut config = test_config(2);
        config.port = taken.local_addr().unwrap().port();

        let server = Server::new(config, |_: &Connection| crate::protocols::Discard::default());
        assert!(matches!(server.launch(), Err(LaunchError::Bind(_, _))));
        assert!(!server.is_running());
        assert!(server.local_addr().is_none());
    }

    #[test]
    fn test_launch_rejects_zero_shards() {
        let server = Server::new(test_config(0), |_: &Connection| crate::protocols::Discard::default());
        assert!(matches!(server.launch(), Err(LaunchError::Config(_))));
    }

    #[test]
    fn test_message_then_disconnect_reaps_immediately() {
        let (server, recorder) = recording(2, None, false);
        let (mut client, id, shard) = connect_registered(&server, &recorder);
        assert_eq!(shard, 0);

        client.write_all(b"0123456789").unwrap();
        assert!(eventually(|| recorder.bytes_from(id).len() == 10));
        assert_eq!(recorder.bytes_from(id), b"0123456789");
        assert!(recorder.shards_for(id).iter().all(|&s| s == 0));
        assert!(eventually(|| pending(&server, id) == Some(0)));

        drop(client);
        assert!(eventually(|| server.stats().reaped == 1));
        assert!(!server.shared.table.contains(id));
        assert_eq!(recorder.closed(), vec![id]);

        let stats = server.stats();
        assert_eq!(stats.accepted, 1);
        assert_eq!(stats.disconnected, 1);
        assert_eq!(stats.reaped, 1);
        assert_eq!(stats.bytes_read, 10);
    }

    #[test]
    fn test_silent_client_reaped_without_worker() {
        let (server, recorder) = recording(2, None, false);
        let (_a, _, shard_a) = connect_registered(&server, &recorder);
        let (b, id_b, shard_b) = connect_registered(&server, &recorder);
        assert_eq!((shard_a, shard_b), (0, 1));

        drop(b);
        assert!(eventually(|| server.stats().reaped == 1));
        assert!(!server.shared.table.contains(id_b));
        assert_eq!(recorder.closed(), vec![id_b]);
        assert!(recorder.shards_for(id_b).is_empty());
        assert_eq!(server.stats().messages_handled, 0);
        assert_eq!(server.connections(), 1);
    }

    #[test]
    fn test_round_robin_shard_assignment() {
        let (server, recorder) = recording(3, None, false);
        let mut clients = Vec::new();
        for _ in 0..7 {
            let (client, _, _) = connect_registered(&server, &recorder);
            clients.push(client);
        }

        let shards: Vec<usize> = recorder.opened().iter().map(|(_, s)| *s).collect();
        assert_eq!(shards, vec![0, 1, 2, 0, 1, 2, 0]);
    }

    #[test]
    fn test_messages_per_connection_arrive_in_order() {
        let (server, recorder) = recording(2, None, false);

        let mut clients = Vec::new();
        for _ in 0..3 {
            clients.push(connect_registered(&server, &recorder));
        }

        let expected: Vec<Vec<u8>> = (0..3)
            .map(|c| {
                (0..200)
                    .flat_map(|i| format!("c{c}-m{i};").into_bytes())
                    .collect()
            })
            .collect();

        let writers: Vec<_> = clients
            .iter()
            .zip(&expected)
            .map(|((client, _, _), payload)| {
                let mut client = client.try_clone().unwrap();
                let payload = payload.clone();
                thread::spawn(move || {
                    for chunk in payload.chunks(7) {
                        client.write_all(chunk).unwrap();
                    }
                })
            })
            .collect();
        for writer in writers {
            writer.join().unwrap();
        }

        for ((_, id, shard), payload) in clients.iter().zip(&expected) {
            assert!(eventually(|| recorder.bytes_from(*id).len() == payload.len()));
            assert_eq!(&recorder.bytes_from(*id), payload);
            assert!(recorder.shards_for(*id).iter().all(|s| s == shard));
        }
    }

    #[test]
    fn test_disconnect_before_drain_waits_for_pending() {
        let gate = Gate::closed();
        let (server, recorder) = recording(1, Some(Arc::clone(&gate)), false);
        let (mut client, id, _) = connect_registered(&server, &recorder);

        client.write_all(b"first").unwrap();
        assert!(eventually(|| server.stats().messages_read == 1));
        client.write_all(b"second").unwrap();
        assert!(eventually(|| server.stats().messages_read == 2));
        assert_eq!(pending(&server, id), Some(2));

        drop(client);
        assert!(eventually(|| server.stats().disconnected == 1));

        // Disconnected, but both messages are still outstanding.
        let entry = server.shared.table.get(id).expect("connection survives");
        assert!(!entry.conn.is_connected());
        assert_eq!(entry.conn.pending_messages(), 2);
        assert!(recorder.closed().is_empty());
        drop(entry);

        gate.open();
        assert!(eventually(|| server.stats().reaped == 1));
        assert!(!server.shared.table.contains(id));
        assert_eq!(recorder.bytes_from(id), b"firstsecond");
        assert_eq!(recorder.closed(), vec![id]);
    }

    #[test]
    fn test_message_for_reaped_connection_is_discarded() {
        let (server, recorder) = recording(1, None, false);
        let (client, id, _) = connect_registered(&server, &recorder);
        drop(client);
        assert!(eventually(|| server.stats().reaped == 1));

        server.shared.dispatch(id, Bytes::from_static(b"late"));
        assert_eq!(server.stats().messages_discarded, 1);
        assert_eq!(server.stats().messages_read, 0);
    }

    #[test]
    fn test_echo_round_trip() {
        let (server, recorder) = recording(2, None, true);
        let (mut client, _, _) = connect_registered(&server, &recorder);

        client.write_all(b"hello").unwrap();
        let mut buf = [0u8; 5];
        client.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"hello");
        assert!(eventually(|| server.stats().bytes_written == 5));
    }

    #[test]
    fn test_churn_leaks_nothing() {
        let (server, recorder) = recording(4, None, false);
        let addr = server.local_addr().unwrap();

        let clients: Vec<_> = (0..20)
            .map(|i| {
                thread::spawn(move || {
                    let mut client = TcpStream::connect(addr).unwrap();
                    client.write_all(format!("client {i}").as_bytes()).unwrap();
                })
            })
            .collect();
        for client in clients {
            client.join().unwrap();
        }

        assert!(eventually(|| server.stats().reaped == 20));
        let stats = server.stats();
        assert_eq!(stats.accepted, 20);
        assert_eq!(stats.messages_handled, stats.messages_read);
        assert_eq!(server.connections(), 0);

        let mut closed = recorder.closed();
        closed.sort_by_key(|id| id.generation());
        closed.dedup();
        assert_eq!(closed.len(), 20);
    }

    #[test]
    fn test_close_disconnects_clients_and_is_idempotent() {
        let (server, recorder) = recording(2, None, false);
        let (mut client, id, _) = connect_registered(&server, &recorder);

        server.close();
        server.close();
        assert_eq!(server.connections(), 0);
        assert_eq!(recorder.closed(), vec![id]);

        client
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        let mut buf = [0u8; 1];
        assert!(matches!(client.read(&mut buf), Ok(0) | Err(_)));
        assert!(TcpStream::connect(server.local_addr().unwrap()).is_err());
    }

    #[test]
    fn test_wait_returns_after_close_from_another_thread() {
        let (server, _) = recording(1, None, false);
        let server = Arc::new(server);

        let closer = {
            let server = Arc::clone(&server);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                server.close();
            })
        };
        server.wait();
        assert!(!server.is_running());
        closer.join().unwrap();
    }

    #[test]
    fn test_wait_and_close_before_launch() {
        let server = Server::new(test_config(1), |_: &Connection| crate::protocols::Discard::default());
        server.wait();
        server.close();
        assert!(matches!(server.launch(), Err(LaunchError::AlreadyLaunched)));
    }

    #[test]
    fn test_throttled_socket_sits_out_one_poll() {
        let sockets = [
            LiveSocket { fd: 10, id: ConnId::new(0, 1) },
            LiveSocket { fd: 11, id: ConnId::new(1, 2) },
            LiveSocket { fd: 12, id: ConnId::new(2, 3) },
        ];
        let mut poll_set = PollSet::with_capacity(4);
        let mut polled = Vec::new();

        fill_poll_set(&mut poll_set, 3, &sockets, &[ConnId::new(1, 2)], &mut polled);
        assert_eq!(polled, vec![sockets[0], sockets[2]]);
        assert_eq!(poll_set.len(), 3);

        fill_poll_set(&mut poll_set, 3, &sockets, &[], &mut polled);
        assert_eq!(polled, sockets.to_vec());
        assert_eq!(poll_set.len(), 4);
    }

    #[test]
    fn test_descriptor_exhaustion_is_retryable() {
        for errno in [libc::EMFILE, libc::ENFILE, libc::ENOBUFS, libc::ENOMEM] {
            assert!(is_resource_exhausted(&io::Error::from_raw_os_error(errno)));
        }
        assert!(!is_resource_exhausted(&io::Error::from_raw_os_error(libc::EBADF)));
        assert!(!is_resource_exhausted(&io::ErrorKind::WouldBlock.into()));
    }

    /// Closes the server from inside a handler.
    struct Closer {
        server: Arc<OnceLock<Arc<Server<Closer>>>>,
    }

    struct CloserSession {
        server: Arc<OnceLock<Arc<Server<Closer>>>>,
    }

    impl Session for CloserSession {
        fn feed_message(&mut self, _conn: &Connection, _data: &[u8]) -> bool {
            if let Some(server) = self.server.get() {
                server.close();
            }
            true
        }
    }

    impl Handler for Closer {
        type Session = CloserSession;

        fn open(&self, _conn: &Connection) -> CloserSession {
            CloserSession {
                server: Arc::clone(&self.server),
            }
        }
    }

    #[test]
    fn test_close_from_handler() {
        let slot = Arc::new(OnceLock::new());
        let server = Arc::new(Server::new(
            test_config(1),
            Closer {
                server: Arc::clone(&slot),
            },
        ));
        assert!(slot.set(Arc::clone(&server)).is_ok());
        server.launch().unwrap();

        let mut client = connect(&server);
        client.write_all(b"stop").unwrap();
        server.wait();
        assert!(!server.is_running());
        assert_eq!(server.connections(), 0);
    }
}
