// src/tcp/tcp_server.rs - Typestate server facade
//
// Binds the listener, moves a Reactor onto the `tcp-reactor` thread and
// stops it again: Initialization -> Running -> Ended.

use crate::error::Error;
use crate::tcp::connection::{Connection, ConnectionToken};
use crate::tcp::handler::ConnectionHandler;
use crate::tcp::reactor::{CancellationToken, Reactor, ReactorConfig, RunOutcome};
use dashmap::DashMap;
use log::{error, info};
use std::marker::PhantomData;
use std::net::{SocketAddr, TcpListener};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

pub struct Initialization;
pub struct Running;
pub struct Ended;

/// A TCP server driven by one reactor thread.
///
/// The type parameter tracks where the server is in its life:
/// [`Initialization`] (configurable), [`Running`] and [`Ended`].
pub struct TcpServer<S> {
    host: String,
    port: u16,
    config: ReactorConfig,
    bound_addr: Option<SocketAddr>,
    registry: Arc<DashMap<ConnectionToken, Connection>>,
    cancel: Option<CancellationToken>,
    thread: Option<JoinHandle<RunOutcome>>,
    outcome: Option<RunOutcome>,
    state: PhantomData<S>,
}

impl<S> TcpServer<S> {
    fn into_state<T>(mut self) -> TcpServer<T> {
        TcpServer {
            host: std::mem::take(&mut self.host),
            port: self.port,
            config: self.config.clone(),
            bound_addr: self.bound_addr,
            registry: self.registry.clone(),
            cancel: self.cancel.take(),
            thread: self.thread.take(),
            outcome: self.outcome.take(),
            state: PhantomData,
        }
    }

    /// Checks whether the server has stopped.
    ///
    /// `true` once [`stop`](TcpServer<Running>::stop) was called or the reactor
    /// thread exited on its own (poller failure).
    pub fn is_stopped(&self) -> bool {
        if let Some(cancel) = &self.cancel {
            if cancel.is_cancelled() {
                return true;
            }
        }
        match &self.thread {
            Some(thread) => thread.is_finished(),
            None => self.outcome.is_some(),
        }
    }

    /// Signal the reactor, wait for it and keep its outcome.
    fn shutdown_reactor(&mut self) {
        if let Some(cancel) = &self.cancel {
            cancel.cancel();
        }
        if let Some(thread) = self.thread.take() {
            let outcome = thread.join().unwrap_or_else(|_| {
                error!("Thread[tcp-reactor] panicked");
                RunOutcome::Failed(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    "reactor thread panicked",
                ))
            });
            self.outcome = Some(outcome);
        }
    }
}

impl TcpServer<Initialization> {
    /// Creates a server that will listen on `host:port` once started.
    ///
    /// Port 0 picks a free port; read it back with
    /// [`local_addr`](TcpServer<Running>::local_addr).
    pub fn new(host: impl Into<String>, port: u16) -> TcpServer<Initialization> {
        Self {
            host: host.into(),
            port,
            config: ReactorConfig::default(),
            bound_addr: None,
            registry: Arc::new(DashMap::new()),
            cancel: None,
            thread: None,
            outcome: None,
            state: PhantomData,
        }
    }

    /// Sets the maximum number of concurrent connections allowed.
    ///
    /// If not set, the limit is auto-detected based on system file descriptor limits
    /// (default: 10000, capped at 80% of system FD limit).
    pub fn set_max_connections(mut self, max_connections: usize) -> Self {
        self.config.max_connections = Some(max_connections);
        self
    }

    /// Byte limit of each connection's outbound queue. Sends that would reach
    /// it fail with [`Error::Backpressure`].
    pub fn set_max_pending_bytes(mut self, max_pending_bytes: usize) -> Self {
        self.config.max_pending_bytes = max_pending_bytes;
        self
    }

    /// Tear down connections that saw no reads or writes for `idle_timeout`.
    pub fn set_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.config.idle_timeout = Some(idle_timeout);
        self
    }

    pub fn set_shutdown_timeout(mut self, shutdown_timeout: Duration) -> Self {
        self.config.shutdown_timeout = shutdown_timeout;
        self
    }

    pub fn set_read_buffer_size(mut self, read_buffer_size: usize) -> Self {
        self.config.read_buffer_size = read_buffer_size;
        self
    }

    /// Binds the listening socket and starts the reactor thread.
    ///
    /// # Returns
    ///
    /// * `Ok(TcpServer<Running>)` once the server accepts connections.
    /// * [`Error::Bind`] if the address cannot be bound, [`Error::Io`] if the
    ///   poller cannot be created, [`Error::ReactorThreadSpawn`] if the thread
    ///   cannot start. Nothing keeps running on failure.
    pub fn start<H: ConnectionHandler>(
        mut self,
        handler: H,
    ) -> crate::error::Result<TcpServer<Running>> {
        let address = format!("{}:{}", self.host, self.port);
        let listener = TcpListener::bind((self.host.as_str(), self.port)).map_err(|source| {
            Error::Bind {
                address: address.clone(),
                source,
            }
        })?;

        // Get actual bound address (important for port 0)
        let actual_addr = listener.local_addr()?;
        self.bound_addr = Some(actual_addr);

        let mut reactor = Reactor::new(listener, handler, self.config.clone())?;
        let max_connections = reactor.max_connections();
        self.registry = reactor.registry();
        self.cancel = Some(reactor.cancellation_token());

        let thread = std::thread::Builder::new()
            .name("tcp-reactor".to_string())
            .spawn(move || reactor.run())
            .map_err(|e| {
                error!("Thread[tcp-reactor] failed to start: {e}");
                Error::ReactorThreadSpawn(e)
            })?;
        self.thread = Some(thread);

        info!(
            "Tcp server listening for connections on {} (actual: {}, max_connections: {}).",
            address, actual_addr, max_connections
        );

        Ok(self.into_state())
    }
}

impl TcpServer<Running> {
    /// Returns the actual bound socket address of the server.
    ///
    /// ```rust,ignore
    /// let server = TcpServer::new("127.0.0.1", 0).start(handler).unwrap();
    /// let actual_port = server.local_addr().unwrap().port();
    /// ```
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.bound_addr
    }

    pub fn connection_count(&self) -> usize {
        self.registry.len()
    }

    /// Snapshot of the open connections.
    pub fn connections(&self) -> Vec<Connection> {
        self.registry.iter().map(|entry| entry.value().clone()).collect()
    }

    /// Stops the server: no new connections are accepted, queued data is
    /// flushed for up to the shutdown timeout, then every connection is closed
    /// and reported through `on_closed`. Blocks until the reactor thread exits.
    pub fn stop(mut self) -> TcpServer<Ended> {
        self.shutdown_reactor();
        info!("Tcp server on {}:{} stopped.", self.host, self.port);
        self.into_state()
    }
}

impl TcpServer<Ended> {
    /// How the reactor loop ended.
    pub fn outcome(&self) -> Option<&RunOutcome> {
        self.outcome.as_ref()
    }
}

impl<S> Drop for TcpServer<S> {
    fn drop(&mut self) {
        if self.thread.is_some() {
            self.shutdown_reactor();
        }
    }
}
