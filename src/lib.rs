//! # ez-tcp
//!
//! A small, embeddable TCP server built on a single-threaded reactor.
//!
//! Implement [`ConnectionHandler`](tcp::ConnectionHandler) for your protocol, start a
//! [`TcpServer`](tcp::TcpServer), and reply through the [`Connection`](tcp::Connection)
//! handles you are given. Handles can be cloned and used from any thread; all socket
//! I/O stays on the reactor thread.
//!
//! ```rust,ignore
//! use ez_tcp::tcp::{Connection, ConnectionHandler, TcpServer};
//!
//! struct Echo;
//!
//! impl ConnectionHandler for Echo {
//!     fn on_data(&mut self, connection: &Connection, data: &[u8]) {
//!         let _ = connection.send(data.to_vec());
//!     }
//! }
//!
//! let server = TcpServer::new("0.0.0.0", 7000).start(Echo)?;
//! ```
//!
//! Diagnostics go through the [`log`](https://docs.rs/log) facade.

pub mod error;
pub mod tcp;
