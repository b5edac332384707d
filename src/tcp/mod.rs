//! The **TCP** module is a non-blocking connection layer: one reactor thread owns every
//! socket, while any number of application threads queue outbound bytes on a
//! [`Connection`] handle and never touch a socket themselves.
//!
//! # Architecture
//!
//! A single-thread **Reactor** multiplexes the listener and all accepted connections:
//! - **Linux**: epoll (edge-triggered), woken through an eventfd
//! - **macOS/BSD**: kqueue (EV_CLEAR edge-triggered), woken through a self-pipe
//! - **Windows**: WSAPoll (level-triggered), woken through a loopback UDP pair
//!
//! ## Key Components
//!
//! - `Reactor`: Single-thread event loop; accepts, reads, flushes and closes
//! - `Poller`: Cross-platform IO multiplexer abstraction with a thread-safe waker
//! - `OutboundQueue`: Per-connection FIFO of byte chunks and the terminal close marker
//! - `Connection`: Cloneable handle used from any thread to send and close
//! - `ConnectionHandler`: Application callbacks (`on_connected`, `on_data`, `on_closed`, `on_error`)
//!
//! ## Write Path
//!
//! `send` appends to the queue and, if no write is already pending, posts a change
//! request and wakes the poller. The reactor applies change requests at the top of each
//! turn, writes until the socket would block, and drops write interest once the queue is
//! empty. `close` appends a close marker: everything queued before it is still written.
//!
//! ## Backpressure Management
//!
//! | Level | Threshold | Behavior |
//! |-------|-----------|----------|
//! | Normal | < 25% of limit | Accepted |
//! | Warning | 25-50% | Accepted |
//! | High | 50-100% | Accepted, logged |
//! | Full | would reach limit | `send` fails with `Error::Backpressure` |
//!
//! The limit defaults to 4MB per connection (`TcpServer::set_max_pending_bytes`).
//! An empty queue accepts a chunk of any size.
//!
//! # Example
//!
//! ```rust,ignore
//! struct Greeter;
//!
//! impl ConnectionHandler for Greeter {
//!     fn on_connected(&mut self, connection: &Connection) {
//!         let _ = connection.send_line("HELLO");
//!         connection.close();
//!     }
//!
//!     fn on_data(&mut self, _connection: &Connection, _data: &[u8]) {}
//! }
//!
//! let server = TcpServer::new("127.0.0.1", 7000).start(Greeter).unwrap();
//! // ...
//! let ended = server.stop();
//! ```

mod connection;
mod handler;
mod poller;
mod reactor;
pub mod tcp_server;
mod write_queue;

pub use connection::{Connection, ConnectionToken, Lifecycle};
pub use handler::ConnectionHandler;
pub use reactor::{effective_max_connections, CancellationToken, Reactor, ReactorConfig, RunOutcome};
pub use tcp_server::TcpServer;
pub use write_queue::{BackpressureLevel, DEFAULT_MAX_PENDING_BYTES};
