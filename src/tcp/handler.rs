// src/tcp/handler.rs - Application callbacks invoked on the reactor thread

use crate::error::Error;
use crate::tcp::connection::Connection;

/// Protocol logic plugged into the reactor.
///
/// All callbacks run on the reactor thread, so they should return quickly;
/// hand long work to another thread and reply through [`Connection::send`].
/// Each connection sees exactly one `on_connected` and then exactly one of
/// `on_closed` or `on_error`.
pub trait ConnectionHandler: Send + 'static {
    fn on_connected(&mut self, _connection: &Connection) {}

    /// Bytes received from the peer, in the order they were read.
    fn on_data(&mut self, connection: &Connection, data: &[u8]);

    /// The connection finished normally: the peer closed its side, a
    /// requested close completed, or the server stopped.
    fn on_closed(&mut self, _connection: &Connection) {}

    /// The connection was torn down because of a transport failure.
    fn on_error(&mut self, _connection: &Connection, _cause: &Error) {}
}
