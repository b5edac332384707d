use std::io;
use std::time::Duration;
use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Error, Debug)]
pub enum Error {
    /// A send was attempted after `close()` was requested or after the reactor
    /// released the socket.
    #[error("Connection already closed: {connection}")]
    ConnectionClosed { connection: String },

    /// The outbound queue would exceed its configured byte limit.
    #[error("Outbound queue full for {connection}: {pending} bytes pending (limit {limit})")]
    Backpressure {
        connection: String,
        pending: usize,
        limit: usize,
    },

    #[error("Peer stopped accepting data on {connection}")]
    PeerClosedWrite { connection: String },

    #[error("Connection {connection} idle for {idle:?}")]
    IdleTimeout { connection: String, idle: Duration },

    #[error("Failed to bind {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: io::Error,
    },

    #[error("Failed to spawn reactor thread: {0}")]
    ReactorThreadSpawn(#[source] io::Error),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    /// Whether this error reports a caller mistake (send on a closed or full
    /// connection) rather than a transport failure.
    pub fn is_state_error(&self) -> bool {
        matches!(self, Error::ConnectionClosed { .. } | Error::Backpressure { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_error_classification() {
        let closed = Error::ConnectionClosed {
            connection: "80<=127.0.0.1:5000".to_string(),
        };
        assert!(closed.is_state_error());
        assert_eq!(
            closed.to_string(),
            "Connection already closed: 80<=127.0.0.1:5000"
        );

        let io_err: Error = io::Error::from(io::ErrorKind::ConnectionReset).into();
        assert!(!io_err.is_state_error());
    }
}
