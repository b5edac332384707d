// src/tcp/reactor.rs - Single-threaded Reactor event loop
//
// Core features:
// - Event-driven IO using Poller (epoll/kqueue/WSAPoll)
// - Listener, reads and writes all happen on the reactor thread
// - Cross-thread change requests drained at the top of every turn
// - Strict drain until WouldBlock semantics (required for edge-triggered)
// - ConnectionToken prevents ID reuse conflicts
// - Explicit cancellation and graceful shutdown

use crate::error::Error;
use crate::tcp::connection::{
    ChangeRequest, Connection, ConnectionToken, Lifecycle, ReactorNotifier,
};
use crate::tcp::handler::ConnectionHandler;
use crate::tcp::poller::{raw_handle_of, Event, Interest, Poller, RawHandle, Waker, WAKE_TOKEN};
use crate::tcp::write_queue::{FlushResult, WriteCursor, DEFAULT_MAX_PENDING_BYTES};
use dashmap::DashMap;
use log::{debug, error, info, warn};
use std::collections::{HashMap, HashSet};
use std::io::{self, Read};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

// ============================================================================
// Constants
// ============================================================================

const READ_BUFFER_SIZE: usize = 8192;
const MAX_READ_PER_POLL: usize = 512 * 1024; // 512KB max read per event, then yield to others
const IDLE_CHECK_INTERVAL_MS: u64 = 100;
const ACCEPT_RETRY_MS: u64 = 100;
const GRACEFUL_SHUTDOWN_TIMEOUT_SECS: u64 = 5;
const DEFAULT_MAX_CONNECTIONS: usize = 10000; // Default max connections (auto-adjusted by system FD limit)
#[cfg(windows)]
const DEFAULT_MAX_CONNECTIONS_WINDOWS: usize = 8000;

/// Poller token of the listening socket
const LISTENER_TOKEN: usize = WAKE_TOKEN - 1;

// ============================================================================
// System Helpers
// ============================================================================

/// Get system file descriptor limit (cross-platform)
fn get_fd_limit() -> Option<usize> {
    #[cfg(unix)]
    {
        use std::mem::MaybeUninit;
        let mut rlim = MaybeUninit::<libc::rlimit>::uninit();
        // SAFETY: getrlimit initialises rlim when it returns 0.
        if unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, rlim.as_mut_ptr()) } == 0 {
            // SAFETY: getrlimit returned 0, so rlim is initialised.
            let rlim = unsafe { rlim.assume_init() };
            return Some(usize::try_from(rlim.rlim_cur).unwrap_or(usize::MAX));
        }
        None
    }
    #[cfg(windows)]
    {
        Some(DEFAULT_MAX_CONNECTIONS_WINDOWS)
    }
    #[cfg(not(any(unix, windows)))]
    {
        None
    }
}

/// Calculate effective max connections based on config and system limits.
///
/// Uses the configured value or `DEFAULT_MAX_CONNECTIONS`, capped at 80% of
/// the process FD limit. Always at least 1.
pub fn effective_max_connections(config_max: Option<usize>) -> usize {
    let config_value = config_max.unwrap_or(DEFAULT_MAX_CONNECTIONS);
    let result = match get_fd_limit() {
        Some(fd_limit) => config_value.min((fd_limit as f64 * 0.8) as usize),
        None => config_value,
    };
    result.max(1)
}

// ============================================================================
// Configuration
// ============================================================================

/// Reactor tuning
#[derive(Debug, Clone)]
pub struct ReactorConfig {
    /// Maximum simultaneous connections (None = auto-detect from FD limit)
    pub max_connections: Option<usize>,
    /// Byte limit of each connection's outbound queue
    pub max_pending_bytes: usize,
    /// Tear down connections without any I/O for this long (None = never)
    pub idle_timeout: Option<Duration>,
    /// How long `shutdown` keeps flushing queued data before closing sockets
    pub shutdown_timeout: Duration,
    /// Size of the buffer handed to `on_data`
    pub read_buffer_size: usize,
}

impl Default for ReactorConfig {
    fn default() -> Self {
        Self {
            max_connections: None,
            max_pending_bytes: DEFAULT_MAX_PENDING_BYTES,
            idle_timeout: None,
            shutdown_timeout: Duration::from_secs(GRACEFUL_SHUTDOWN_TIMEOUT_SECS),
            read_buffer_size: READ_BUFFER_SIZE,
        }
    }
}

// ============================================================================
// Cancellation
// ============================================================================

/// Stops a running reactor from any thread.
///
/// Checked at the top of every loop turn; `cancel` also wakes the poller so a
/// reactor parked in its readiness wait notices immediately.
#[derive(Clone)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
    waker: Arc<Waker>,
}

impl CancellationToken {
    fn new(waker: Arc<Waker>) -> Self {
        Self {
            cancelled: Arc::new(AtomicBool::new(false)),
            waker,
        }
    }

    pub fn cancel(&self) {
        if !self.cancelled.swap(true, Ordering::AcqRel) {
            if let Err(e) = self.waker.wake() {
                warn!("Failed to wake reactor for cancellation: {e}");
            }
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

/// Why `Reactor::run` returned
#[derive(Debug)]
pub enum RunOutcome {
    /// The cancellation token fired
    Cancelled,
    /// The readiness wait failed and cannot continue
    Failed(io::Error),
}

// ============================================================================
// Reactor Connection
// ============================================================================

/// Reactor-side state of one connection
struct ReactorConnection {
    handle: Connection,
    socket: TcpStream,
    raw_handle: RawHandle,
    cursor: WriteCursor,
    current_interest: Interest,
    last_activity: Instant,
    /// Peer sent FIN; only queued writes remain
    read_closed: bool,
}

impl ReactorConnection {
    fn has_pending_writes(&self) -> bool {
        self.cursor.has_partial() || !self.handle.queue().is_empty()
    }

    fn socket_error(&self) -> Error {
        match self.socket.take_error() {
            Ok(Some(e)) | Err(e) => Error::Io(e),
            Ok(None) => Error::Io(io::Error::new(
                io::ErrorKind::Other,
                "socket reported an error condition",
            )),
        }
    }
}

/// How a connection ends
enum Teardown {
    Closed,
    Failed(Error),
}

// ============================================================================
// Reactor
// ============================================================================

/// Main Reactor structure
pub struct Reactor<H: ConnectionHandler> {
    /// Event poller
    poller: Poller,
    /// Listening socket; taken on shutdown
    listener: Option<TcpListener>,
    /// Connection storage (using slab allocation)
    connections: slab::Slab<ReactorConnection>,
    /// Generation counter (for each slot)
    generations: HashMap<usize, u32>,
    /// Live connections, readable from other threads
    registry: Arc<DashMap<ConnectionToken, Connection>>,
    handler: H,
    change_receiver: crossbeam_channel::Receiver<ChangeRequest>,
    notifier: ReactorNotifier,
    cancel: CancellationToken,
    config: ReactorConfig,
    /// Maximum allowed connections (auto-adjusted by system FD limit)
    max_connections: usize,
    read_buffer: Vec<u8>,
    /// Connections that hit MAX_READ_PER_POLL and still have data to read
    read_backlog: HashSet<usize>,
    /// Accept failed with something other than WouldBlock; retry soon
    accept_retry: bool,
}

impl<H: ConnectionHandler> Reactor<H> {
    /// Create a reactor serving `listener`.
    ///
    /// The effective max_connections is `min(config, 0.8 * system_fd_limit)`.
    pub fn new(listener: TcpListener, handler: H, config: ReactorConfig) -> io::Result<Self> {
        let mut poller = Poller::new()?;

        listener.set_nonblocking(true)?;
        poller.register(raw_handle_of(&listener), LISTENER_TOKEN, Interest::READABLE)?;

        let (change_sender, change_receiver) = crossbeam_channel::unbounded();
        let notifier = ReactorNotifier::new(change_sender, poller.waker());
        let cancel = CancellationToken::new(poller.waker());
        let max_connections = effective_max_connections(config.max_connections);
        let read_buffer = vec![0u8; config.read_buffer_size.max(1)];

        Ok(Self {
            poller,
            listener: Some(listener),
            connections: slab::Slab::with_capacity(1024),
            generations: HashMap::new(),
            registry: Arc::new(DashMap::new()),
            handler,
            change_receiver,
            notifier,
            cancel,
            config,
            max_connections,
            read_buffer,
            read_backlog: HashSet::new(),
            accept_retry: false,
        })
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub(crate) fn registry(&self) -> Arc<DashMap<ConnectionToken, Connection>> {
        self.registry.clone()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn max_connections(&self) -> usize {
        self.max_connections
    }

    /// Run reactor main loop until cancelled, then shut down gracefully.
    pub fn run(&mut self) -> RunOutcome {
        info!(
            "Reactor started (max_connections: {}, idle_timeout: {:?})",
            self.max_connections, self.config.idle_timeout
        );

        let outcome = loop {
            if self.cancel.is_cancelled() {
                info!("Reactor received stop signal");
                break RunOutcome::Cancelled;
            }

            let timeout = self.poll_timeout();
            if let Err(e) = self.turn(timeout) {
                error!("Poller error: {e}");
                break RunOutcome::Failed(e);
            }
        };

        self.shutdown();
        info!("Reactor stopped");
        outcome
    }

    /// One loop iteration: apply change requests, wait for readiness (at most
    /// `timeout`), dispatch events, reap idle connections.
    pub fn turn(&mut self, timeout: Option<Duration>) -> io::Result<()> {
        // 1. Apply interest changes posted by other threads
        self.apply_change_requests();

        // 2. Continue reads that yielded at MAX_READ_PER_POLL
        self.resume_backlogged_reads();

        // 3. Poll IO events
        let timeout = if self.read_backlog.is_empty() {
            timeout
        } else {
            Some(Duration::ZERO)
        };
        let events = self.poller.poll(timeout)?;

        // 4. Process IO events
        for event in events {
            self.dispatch(event);
        }

        // 5. Retry a failed accept
        if self.accept_retry {
            self.accept_retry = false;
            self.accept_ready();
        }

        // 6. Check timeouts
        self.check_timeouts();

        Ok(())
    }

    fn poll_timeout(&self) -> Option<Duration> {
        if self.accept_retry {
            Some(Duration::from_millis(ACCEPT_RETRY_MS))
        } else if self.config.idle_timeout.is_some() {
            Some(Duration::from_millis(IDLE_CHECK_INTERVAL_MS))
        } else {
            None
        }
    }

    fn dispatch(&mut self, event: Event) {
        if event.token == LISTENER_TOKEN {
            self.accept_ready();
            return;
        }

        // Validate token and get connection id (checks generation)
        let Some(id) = self.validate_connection(event.token) else {
            return;
        };

        let teardown = if event.is_error() {
            self.connections.get(id).map(|c| Teardown::Failed(c.socket_error()))
        } else {
            // Hangup is handled by reading: buffered data first, then EOF.
            let read_closed = self.connections.get(id).map_or(true, |c| c.read_closed);
            let mut teardown = None;
            if (event.is_readable() || event.is_hangup()) && !read_closed {
                teardown = self.handle_readable(id);
            }
            if teardown.is_none() && (event.is_writable() || (read_closed && event.is_hangup())) {
                teardown = self.handle_writable(id);
            }
            teardown
        };

        if let Some(teardown) = teardown {
            self.remove_connection(id, teardown);
        }
    }

    // ------------------------------------------------------------------------
    // Accept
    // ------------------------------------------------------------------------

    /// Accept until WouldBlock (edge-triggered listener)
    fn accept_ready(&mut self) {
        loop {
            let Some(listener) = self.listener.as_ref() else {
                return;
            };

            match listener.accept() {
                Ok((socket, remote_addr)) => match self.add_connection(socket, remote_addr) {
                    Ok(token) => {
                        if let Some(conn) = self.connections.get(token.id) {
                            let handle = conn.handle.clone();
                            debug!("Connection {} accepted ({})", handle, token);
                            self.handler.on_connected(&handle);
                        }
                    }
                    Err(e) => debug!("Connection from {remote_addr} rejected: {e}"),
                },
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    // e.g. EMFILE: pending connections stay queued, retry after a pause.
                    warn!("Accept failed: {e}");
                    self.accept_retry = true;
                    return;
                }
            }
        }
    }

    /// Add new connection
    ///
    /// Returns error if max_connections limit is reached; the socket is closed.
    fn add_connection(
        &mut self,
        socket: TcpStream,
        remote_addr: SocketAddr,
    ) -> io::Result<ConnectionToken> {
        if self.connections.len() >= self.max_connections {
            let _ = socket.shutdown(Shutdown::Both);
            return Err(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                format!(
                    "max connections limit reached ({}/{})",
                    self.connections.len(),
                    self.max_connections
                ),
            ));
        }

        socket.set_nonblocking(true)?;
        let local_port = socket.local_addr()?.port();

        let entry = self.connections.vacant_entry();
        let id = entry.key();

        // Get or initialize generation
        let generation = self.generations.entry(id).or_insert(0);
        *generation = generation.wrapping_add(1);
        let token = ConnectionToken::new(id, *generation);

        let handle = Connection::new(
            token,
            remote_addr,
            local_port,
            self.config.max_pending_bytes,
            self.notifier.clone(),
        );

        let raw_handle = raw_handle_of(&socket);
        self.poller
            .register(raw_handle, token.to_poller_token(), Interest::READABLE)?;

        self.registry.insert(token, handle.clone());
        entry.insert(ReactorConnection {
            handle,
            socket,
            raw_handle,
            cursor: WriteCursor::new(),
            current_interest: Interest::READABLE,
            last_activity: Instant::now(),
            read_closed: false,
        });

        Ok(token)
    }

    /// Remove connection: release the socket, forget the slot, tell the handler.
    fn remove_connection(&mut self, id: usize, teardown: Teardown) {
        let Some(conn) = self.connections.try_remove(id) else {
            return;
        };

        if let Err(e) = self.poller.deregister(conn.raw_handle) {
            debug!("Failed to deregister connection {id} from poller: {e}");
        }
        if let Err(e) = conn.socket.shutdown(Shutdown::Both) {
            debug!("Socket shutdown error (expected if already closed): {e}");
        }

        let handle = conn.handle;
        handle.queue().mark_closed();
        let discarded = handle.queue().discard();
        self.registry.remove(&handle.token());
        self.read_backlog.remove(&id);

        match teardown {
            Teardown::Closed => {
                debug!("Connection {} closed ({} bytes discarded)", handle, discarded);
                self.handler.on_closed(&handle);
            }
            Teardown::Failed(cause) => {
                debug!("Connection {} failed: {}", handle, cause);
                self.handler.on_error(&handle, &cause);
            }
        }
        // Dropping conn.socket here closes the descriptor.
    }

    /// Validate connection exists and generation matches
    ///
    /// Returns Some(id) if connection is valid, None if stale event
    fn validate_connection(&self, poller_token: usize) -> Option<usize> {
        let token = ConnectionToken::from_poller_token(poller_token);
        let conn = self.connections.get(token.id)?;
        // 32-bit tokens carry no generation
        if cfg!(target_pointer_width = "32") || conn.handle.token() == token {
            return Some(token.id);
        }
        debug!(
            "Stale event for connection {}: expected gen {}, got {}",
            token.id,
            conn.handle.token().generation,
            token.generation
        );
        None
    }

    // ------------------------------------------------------------------------
    // Interest changes
    // ------------------------------------------------------------------------

    /// Drain the change-request queue; the only place write interest is added.
    fn apply_change_requests(&mut self) {
        let mut failed = Vec::new();

        while let Ok(request) = self.change_receiver.try_recv() {
            let id = request.token.id;
            let Some(conn) = self.connections.get_mut(id) else {
                continue;
            };
            if conn.handle.token() != request.token {
                continue;
            }
            let interest = if conn.read_closed {
                Interest::WRITABLE
            } else {
                request.interest
            };
            if conn.current_interest == interest {
                continue;
            }
            match self
                .poller
                .modify(conn.raw_handle, request.token.to_poller_token(), interest)
            {
                Ok(()) => conn.current_interest = interest,
                Err(e) => {
                    warn!("Failed to update interest for connection {}: {e}", conn.handle);
                    failed.push((id, e));
                }
            }
        }

        for (id, e) in failed {
            self.remove_connection(id, Teardown::Failed(Error::Io(e)));
        }
    }

    fn set_interest(&mut self, id: usize, interest: Interest) -> Option<Teardown> {
        let conn = self.connections.get_mut(id)?;
        if conn.current_interest == interest {
            return None;
        }
        match self
            .poller
            .modify(conn.raw_handle, conn.handle.token().to_poller_token(), interest)
        {
            Ok(()) => {
                conn.current_interest = interest;
                None
            }
            Err(e) => Some(Teardown::Failed(Error::Io(e))),
        }
    }

    // ------------------------------------------------------------------------
    // Read / write
    // ------------------------------------------------------------------------

    /// Handle readable event (drain until WouldBlock)
    ///
    /// Each read is handed to `on_data` as it arrives. Reading stops after
    /// MAX_READ_PER_POLL bytes; the rest is picked up on the next turn.
    fn handle_readable(&mut self, id: usize) -> Option<Teardown> {
        let mut total = 0usize;

        loop {
            if total >= MAX_READ_PER_POLL {
                self.read_backlog.insert(id);
                return None;
            }

            let conn = self.connections.get_mut(id)?;
            match conn.socket.read(&mut self.read_buffer) {
                Ok(0) => {
                    debug!("Connection {} closed by peer", conn.handle);
                    return self.finish_after_peer_eof(id);
                }
                Ok(n) => {
                    total += n;
                    conn.last_activity = Instant::now();
                    self.handler.on_data(&conn.handle, &self.read_buffer[..n]);
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return None,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    debug!("Connection {} read error: {e}", conn.handle);
                    return Some(Teardown::Failed(Error::Io(e)));
                }
            }
        }
    }

    /// The peer finished sending. Replies already queued are still written;
    /// the connection closes once they are out.
    fn finish_after_peer_eof(&mut self, id: usize) -> Option<Teardown> {
        let conn = self.connections.get_mut(id)?;
        conn.read_closed = true;
        // Rejects further sends, so an empty queue stays empty.
        conn.handle.queue().mark_closing();
        self.read_backlog.remove(&id);

        if !conn.has_pending_writes() {
            return Some(Teardown::Closed);
        }
        debug!(
            "Connection {} half-closed, flushing {} pending bytes",
            conn.handle,
            conn.handle.pending_bytes()
        );
        if let Some(teardown) = self.set_interest(id, Interest::WRITABLE) {
            return Some(teardown);
        }
        self.handle_writable(id)
    }

    fn resume_backlogged_reads(&mut self) {
        if self.read_backlog.is_empty() {
            return;
        }
        let ids: Vec<usize> = self.read_backlog.drain().collect();
        for id in ids {
            if let Some(teardown) = self.handle_readable(id) {
                self.remove_connection(id, teardown);
            }
        }
    }

    /// Handle writable event
    ///
    /// Writes queued chunks until the socket would block (keep write interest),
    /// the queue is empty (drop write interest) or the close marker is reached
    /// (close the connection).
    fn handle_writable(&mut self, id: usize) -> Option<Teardown> {
        loop {
            let conn = self.connections.get_mut(id)?;
            let flushed = conn.cursor.try_flush(conn.handle.queue(), &mut conn.socket);

            match flushed {
                Ok(FlushResult::WouldBlock { bytes_written }) => {
                    if bytes_written > 0 {
                        conn.last_activity = Instant::now();
                    }
                    return None;
                }
                Ok(FlushResult::Drained { bytes_written }) => {
                    if bytes_written > 0 {
                        conn.last_activity = Instant::now();
                    }
                    if conn.handle.clear_write_request() {
                        if conn.read_closed {
                            return Some(Teardown::Closed);
                        }
                        // Prevents CPU churn on level-triggered systems (WSAPoll)
                        return self.set_interest(id, Interest::READABLE);
                    }
                    // A producer raced the drain; keep writing.
                }
                Ok(FlushResult::CloseRequested { .. }) => {
                    debug!("Connection {} flushed, closing", conn.handle);
                    return Some(Teardown::Closed);
                }
                Ok(FlushResult::Closed) => {
                    return Some(Teardown::Failed(Error::PeerClosedWrite {
                        connection: conn.handle.to_string(),
                    }));
                }
                Err(e) => {
                    debug!("Connection {} write error: {e}", conn.handle);
                    return Some(Teardown::Failed(Error::Io(e)));
                }
            }
        }
    }

    /// Check timed out connections
    fn check_timeouts(&mut self) {
        let Some(timeout) = self.config.idle_timeout else {
            return;
        };

        let timed_out: Vec<(usize, Duration)> = self
            .connections
            .iter()
            .filter_map(|(id, conn)| {
                let idle = conn.last_activity.elapsed();
                (idle > timeout).then_some((id, idle))
            })
            .collect();

        for (id, idle) in timed_out {
            let Some(conn) = self.connections.get(id) else {
                continue;
            };
            debug!("Connection {} timed out", conn.handle);
            let cause = Error::IdleTimeout {
                connection: conn.handle.to_string(),
                idle,
            };
            self.remove_connection(id, Teardown::Failed(cause));
        }
    }

    // ------------------------------------------------------------------------
    // Shutdown
    // ------------------------------------------------------------------------

    /// Graceful shutdown
    ///
    /// Stops accepting, rejects further sends, flushes queued data for up to
    /// `shutdown_timeout`, then closes every connection.
    pub fn shutdown(&mut self) {
        info!("Starting graceful shutdown...");

        if let Some(listener) = self.listener.take() {
            if let Err(e) = self.poller.deregister(raw_handle_of(&listener)) {
                debug!("Failed to deregister listener: {e}");
            }
        }

        for (_, conn) in self.connections.iter() {
            conn.handle.queue().mark_closing();
        }

        let deadline = Instant::now() + self.config.shutdown_timeout;
        loop {
            let ids: Vec<usize> = self
                .connections
                .iter()
                .filter(|(_, conn)| conn.has_pending_writes())
                .map(|(id, _)| id)
                .collect();
            if ids.is_empty() {
                break;
            }

            for id in ids {
                let Some(conn) = self.connections.get_mut(id) else {
                    continue;
                };
                match conn.cursor.try_flush(conn.handle.queue(), &mut conn.socket) {
                    Ok(FlushResult::WouldBlock { .. }) | Ok(FlushResult::Drained { .. }) => {}
                    Ok(FlushResult::CloseRequested { .. }) => {
                        self.remove_connection(id, Teardown::Closed);
                    }
                    Ok(FlushResult::Closed) => {
                        let cause = Error::PeerClosedWrite {
                            connection: conn.handle.to_string(),
                        };
                        self.remove_connection(id, Teardown::Failed(cause));
                    }
                    Err(e) => {
                        debug!("Failed to flush connection during shutdown: {e}");
                        self.remove_connection(id, Teardown::Failed(Error::Io(e)));
                    }
                }
            }

            if Instant::now() >= deadline {
                warn!("Graceful shutdown timed out with unflushed connections");
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }

        let ids: Vec<usize> = self.connections.iter().map(|(id, _)| id).collect();
        for id in ids {
            self.remove_connection(id, Teardown::Closed);
        }

        info!("Graceful shutdown complete");
    }

    /// Current interest of a live connection (test only)
    #[cfg(test)]
    fn interest_of(&self, id: usize) -> Option<Interest> {
        self.connections.get(id).map(|c| c.current_interest)
    }
}

impl<H: ConnectionHandler> Drop for Reactor<H> {
    fn drop(&mut self) {
        // Handles may outlive the reactor; make sure none of them reports Open.
        for (_, conn) in self.connections.iter() {
            if conn.handle.lifecycle() != Lifecycle::Closed {
                conn.handle.queue().mark_closed();
            }
        }
        self.registry.clear();
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[derive(Debug)]
    enum Seen {
        Connected(Connection),
        Data(Connection, Vec<u8>),
        Closed(Connection),
        Error(Connection, String),
    }

    struct Recorder {
        sender: crossbeam_channel::Sender<Seen>,
    }

    impl ConnectionHandler for Recorder {
        fn on_connected(&mut self, connection: &Connection) {
            let _ = self.sender.send(Seen::Connected(connection.clone()));
        }

        fn on_data(&mut self, connection: &Connection, data: &[u8]) {
            let _ = self.sender.send(Seen::Data(connection.clone(), data.to_vec()));
        }

        fn on_closed(&mut self, connection: &Connection) {
            let _ = self.sender.send(Seen::Closed(connection.clone()));
        }

        fn on_error(&mut self, connection: &Connection, cause: &Error) {
            let _ = self
                .sender
                .send(Seen::Error(connection.clone(), cause.to_string()));
        }
    }

    fn reactor_with(
        config: ReactorConfig,
    ) -> (Reactor<Recorder>, SocketAddr, crossbeam_channel::Receiver<Seen>) {
        let _ = env_logger::builder().is_test(true).try_init();
        let listener = TcpListener::bind("127.0.0.1:0").expect("Failed to bind");
        let addr = listener.local_addr().expect("Failed to get address");
        let (sender, receiver) = crossbeam_channel::unbounded();
        let reactor = Reactor::new(listener, Recorder { sender }, config)
            .expect("Failed to create reactor");
        (reactor, addr, receiver)
    }

    fn reactor() -> (Reactor<Recorder>, SocketAddr, crossbeam_channel::Receiver<Seen>) {
        reactor_with(ReactorConfig::default())
    }

    /// Turn the reactor until `cond` holds or a second has passed.
    fn turn_until<H: ConnectionHandler>(reactor: &mut Reactor<H>, mut cond: impl FnMut(&Reactor<H>) -> bool) {
        let deadline = Instant::now() + Duration::from_secs(1);
        while !cond(reactor) {
            assert!(Instant::now() < deadline, "condition not reached in time");
            reactor
                .turn(Some(Duration::from_millis(10)))
                .expect("Failed to turn reactor");
        }
    }

    fn accept_one(
        reactor: &mut Reactor<Recorder>,
        addr: SocketAddr,
        seen: &crossbeam_channel::Receiver<Seen>,
    ) -> (TcpStream, Connection) {
        let client = TcpStream::connect(addr).expect("Failed to connect");
        let before = reactor.connection_count();
        turn_until(reactor, |r| r.connection_count() > before);
        match seen.try_recv() {
            Ok(Seen::Connected(conn)) => (client, conn),
            other => panic!("expected Connected, got {other:?}"),
        }
    }

    #[test]
    fn test_accept_registers_read_interest() {
        let (mut reactor, addr, seen) = reactor();
        let (client, conn) = accept_one(&mut reactor, addr, &seen);

        assert_eq!(reactor.interest_of(conn.token().id), Some(Interest::READABLE));
        assert_eq!(conn.remote_port(), client.local_addr().unwrap().port());
        assert_eq!(conn.local_port(), addr.port());
        assert!(reactor.registry.contains_key(&conn.token()));
    }

    #[test]
    fn test_read_delivers_data_in_order() {
        let (mut reactor, addr, seen) = reactor();
        let (mut client, conn) = accept_one(&mut reactor, addr, &seen);

        client.write_all(b"first,").unwrap();
        client.write_all(b"second").unwrap();

        let mut received = Vec::new();
        let deadline = Instant::now() + Duration::from_secs(1);
        while received.len() < 12 && Instant::now() < deadline {
            reactor.turn(Some(Duration::from_millis(10))).unwrap();
            while let Ok(Seen::Data(c, data)) = seen.try_recv() {
                assert_eq!(c, conn);
                received.extend(data);
            }
        }
        assert_eq!(received, b"first,second");
    }

    #[test]
    fn test_send_adds_then_drops_write_interest() {
        let (mut reactor, addr, seen) = reactor();
        let (mut client, conn) = accept_one(&mut reactor, addr, &seen);
        let id = conn.token().id;

        conn.send(&b"ping"[..]).unwrap();

        // The change request turns write interest on, the writable event flushes
        // the queue and turns it off again.
        turn_until(&mut reactor, |r| {
            r.interest_of(id) == Some(Interest::READABLE) && conn.pending_bytes() == 0
        });

        let mut buf = [0u8; 4];
        client.set_read_timeout(Some(Duration::from_secs(1))).unwrap();
        client.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"ping");
    }

    #[test]
    fn test_close_flushes_then_releases() {
        let (mut reactor, addr, seen) = reactor();
        let (mut client, conn) = accept_one(&mut reactor, addr, &seen);

        conn.send_line("HELLO").unwrap();
        conn.close();
        turn_until(&mut reactor, |r| r.connection_count() == 0);

        assert_eq!(conn.lifecycle(), Lifecycle::Closed);
        assert!(!reactor.registry.contains_key(&conn.token()));
        assert!(matches!(seen.try_recv(), Ok(Seen::Closed(c)) if c == conn));

        client.set_read_timeout(Some(Duration::from_secs(1))).unwrap();
        let mut received = Vec::new();
        client.read_to_end(&mut received).unwrap();
        assert_eq!(received, b"HELLO\r\n");
    }

    #[test]
    fn test_peer_close_reports_closed() {
        let (mut reactor, addr, seen) = reactor();
        let (client, conn) = accept_one(&mut reactor, addr, &seen);

        drop(client);
        turn_until(&mut reactor, |r| r.connection_count() == 0);

        assert!(matches!(seen.try_recv(), Ok(Seen::Closed(c)) if c == conn));
        assert!(conn.is_closed());
        assert!(conn.send(&b"late"[..]).is_err());
    }

    #[test]
    fn test_half_close_flushes_queued_data() {
        let (mut reactor, addr, seen) = reactor();
        let (mut client, conn) = accept_one(&mut reactor, addr, &seen);

        conn.send_text("reply").unwrap();
        client.shutdown(Shutdown::Write).unwrap();
        turn_until(&mut reactor, |r| r.connection_count() == 0);

        assert!(matches!(seen.try_recv(), Ok(Seen::Closed(c)) if c == conn));
        assert!(conn.send_text("late").is_err());

        client.set_read_timeout(Some(Duration::from_secs(1))).unwrap();
        let mut received = Vec::new();
        client.read_to_end(&mut received).unwrap();
        assert_eq!(received, b"reply");
    }

    #[test]
    fn test_idle_timeout_tears_down() {
        let config = ReactorConfig {
            idle_timeout: Some(Duration::from_millis(50)),
            ..ReactorConfig::default()
        };
        let (mut reactor, addr, seen) = reactor_with(config);
        let (_client, conn) = accept_one(&mut reactor, addr, &seen);

        std::thread::sleep(Duration::from_millis(80));
        turn_until(&mut reactor, |r| r.connection_count() == 0);

        match seen.try_recv() {
            Ok(Seen::Error(c, cause)) => {
                assert_eq!(c, conn);
                assert!(cause.contains("idle"), "unexpected cause: {cause}");
            }
            other => panic!("expected Error, got {other:?}"),
        }
    }

    #[test]
    fn test_max_connections_rejects_extra() {
        let config = ReactorConfig {
            max_connections: Some(1),
            ..ReactorConfig::default()
        };
        let (mut reactor, addr, seen) = reactor_with(config);
        let (_first, _conn) = accept_one(&mut reactor, addr, &seen);

        let mut second = TcpStream::connect(addr).expect("Failed to connect");
        for _ in 0..10 {
            reactor.turn(Some(Duration::from_millis(10))).unwrap();
        }
        assert_eq!(reactor.connection_count(), 1);

        second.set_read_timeout(Some(Duration::from_secs(1))).unwrap();
        let mut buf = [0u8; 1];
        // Rejected sockets are shut down: EOF or reset, never data.
        assert!(matches!(second.read(&mut buf), Ok(0) | Err(_)));
    }

    #[test]
    fn test_connection_generation_increments() {
        let (mut reactor, addr, seen) = reactor();

        let (client1, conn1) = accept_one(&mut reactor, addr, &seen);
        drop(client1);
        turn_until(&mut reactor, |r| r.connection_count() == 0);
        let _ = seen.try_recv();

        let (_client2, conn2) = accept_one(&mut reactor, addr, &seen);

        // Same slot, different generation, different identity
        assert_eq!(conn1.token().id, conn2.token().id);
        assert_eq!(conn2.token().generation, conn1.token().generation + 1);
        assert_ne!(conn1, conn2);
    }

    /// Stale events for a closed connection must not reach the slot's new owner
    #[test]
    #[cfg(target_pointer_width = "64")]
    fn test_generation_prevents_aba_problem() {
        let (mut reactor, addr, seen) = reactor();

        let (client_a, conn_a) = accept_one(&mut reactor, addr, &seen);
        let stale_poller_token = conn_a.token().to_poller_token();
        drop(client_a);
        turn_until(&mut reactor, |r| r.connection_count() == 0);
        let _ = seen.try_recv();

        let (_client_b, conn_b) = accept_one(&mut reactor, addr, &seen);

        assert!(reactor
            .validate_connection(conn_b.token().to_poller_token())
            .is_some());
        assert!(reactor.validate_connection(stale_poller_token).is_none());
    }

    #[test]
    fn test_stale_change_request_is_ignored() {
        let (mut reactor, addr, seen) = reactor();
        let (client_a, conn_a) = accept_one(&mut reactor, addr, &seen);
        drop(client_a);
        turn_until(&mut reactor, |r| r.connection_count() == 0);
        let _ = seen.try_recv();

        let (_client_b, conn_b) = accept_one(&mut reactor, addr, &seen);
        reactor.notifier.post(ChangeRequest {
            token: conn_a.token(),
            interest: Interest::READ_WRITE,
        });
        reactor.turn(Some(Duration::from_millis(10))).unwrap();
        assert_eq!(
            reactor.interest_of(conn_b.token().id),
            Some(Interest::READABLE)
        );
    }

    #[test]
    fn test_shutdown_closes_everything() {
        let (mut reactor, addr, seen) = reactor();
        let (mut client, conn) = accept_one(&mut reactor, addr, &seen);

        conn.send_text("bye").unwrap();
        reactor.shutdown();

        assert_eq!(reactor.connection_count(), 0);
        assert!(reactor.registry.is_empty());
        assert_eq!(conn.lifecycle(), Lifecycle::Closed);
        assert!(matches!(seen.try_recv(), Ok(Seen::Closed(_))));

        // Queued data was flushed before the socket closed.
        client.set_read_timeout(Some(Duration::from_secs(1))).unwrap();
        let mut received = Vec::new();
        client.read_to_end(&mut received).unwrap();
        assert_eq!(received, b"bye");

        // The listener is gone.
        assert!(reactor.listener.is_none());
    }

    #[test]
    fn test_cancelled_run_returns_cancelled() {
        let (mut reactor, _addr, _seen) = reactor();
        let token = reactor.cancellation_token();

        let handle = std::thread::spawn(move || reactor.run());
        std::thread::sleep(Duration::from_millis(50));
        token.cancel();

        let outcome = handle.join().expect("reactor thread panicked");
        assert!(matches!(outcome, RunOutcome::Cancelled));
        assert!(token.is_cancelled());
    }

    #[test]
    fn test_effective_max_connections() {
        assert_eq!(effective_max_connections(Some(0)), 1);
        assert!(effective_max_connections(Some(5)) <= 5);
        assert!(effective_max_connections(None) <= DEFAULT_MAX_CONNECTIONS);
    }

    #[test]
    fn test_many_connections_creation() {
        let (mut reactor, addr, seen) = reactor();

        let num_connections = 50;
        let mut clients = Vec::new();
        for _ in 0..num_connections {
            clients.push(TcpStream::connect(addr).expect("Failed to connect"));
        }
        turn_until(&mut reactor, |r| r.connection_count() == num_connections);
        assert_eq!(seen.try_iter().count(), num_connections);

        drop(clients);
        turn_until(&mut reactor, |r| r.connection_count() == 0);
    }
}
