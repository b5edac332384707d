// src/tcp/connection.rs - Thread-safe connection handle
//
// A `Connection` never touches its socket. Sends and closes go into the
// connection's `OutboundQueue`; the reactor is told about it through a
// change request plus a wake, and performs the actual I/O on its own thread.

use crate::error::{Error, Result};
use crate::tcp::poller::{Interest, Waker};
use crate::tcp::write_queue::{BackpressureLevel, OutboundQueue, PushError};
use bytes::Bytes;
use log::{debug, warn};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;

const LINE_TERMINATOR: &[u8] = b"\r\n";

// ============================================================================
// Connection Token - Prevents ID reuse conflicts
// ============================================================================

/// Connection token - Contains ID and generation counter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionToken {
    /// Connection ID (slab index)
    pub id: usize,
    /// Generation counter - Incremented each time ID is reused
    pub generation: u32,
}

impl ConnectionToken {
    pub(crate) fn new(id: usize, generation: u32) -> Self {
        Self { id, generation }
    }

    /// Encode token for poller (combines id and generation)
    ///
    /// Layout: [generation: 32 bits][id: 32 bits]
    #[cfg(target_pointer_width = "64")]
    pub(crate) fn to_poller_token(self) -> usize {
        ((self.generation as usize) << 32) | (self.id & 0xFFFF_FFFF)
    }

    /// Decode token from poller event
    #[cfg(target_pointer_width = "64")]
    pub(crate) fn from_poller_token(token: usize) -> Self {
        Self {
            id: token & 0xFFFF_FFFF,
            generation: (token >> 32) as u32,
        }
    }

    /// Fallback for 32-bit systems - no generation encoding possible
    #[cfg(target_pointer_width = "32")]
    pub(crate) fn to_poller_token(self) -> usize {
        self.id
    }

    /// Fallback for 32-bit systems
    #[cfg(target_pointer_width = "32")]
    pub(crate) fn from_poller_token(token: usize) -> Self {
        Self {
            id: token,
            generation: 0,
        }
    }
}

impl fmt::Display for ConnectionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.id, self.generation)
    }
}

// ============================================================================
// Lifecycle
// ============================================================================

/// Connection lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    /// Sends accepted
    Open,
    /// Close requested, queued data still flushing
    Closing,
    /// Socket released
    Closed,
}

// ============================================================================
// Change requests
// ============================================================================

/// Request to set a socket's interest, applied by the reactor thread only
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChangeRequest {
    pub token: ConnectionToken,
    pub interest: Interest,
}

/// Producer side of the reactor's change-request queue
#[derive(Clone)]
pub(crate) struct ReactorNotifier {
    sender: crossbeam_channel::Sender<ChangeRequest>,
    waker: Arc<Waker>,
}

impl ReactorNotifier {
    pub(crate) fn new(sender: crossbeam_channel::Sender<ChangeRequest>, waker: Arc<Waker>) -> Self {
        Self { sender, waker }
    }

    /// Queue the request, then interrupt a blocking wait so it is seen promptly.
    ///
    /// Returns `false` when the reactor has already gone away.
    pub(crate) fn post(&self, request: ChangeRequest) -> bool {
        if self.sender.send(request).is_err() {
            return false;
        }
        if let Err(e) = self.waker.wake() {
            warn!("Failed to wake reactor: {e}");
        }
        true
    }
}

// ============================================================================
// Connection
// ============================================================================

const LEVEL_UNSET: u8 = 0;

struct Shared {
    token: ConnectionToken,
    remote_addr: SocketAddr,
    remote_host: String,
    local_port: u16,
    pending: OutboundQueue,
    /// Set while a write change request is outstanding
    write_requested: AtomicBool,
    /// Last backpressure level reported in the log
    logged_level: AtomicU8,
    notifier: ReactorNotifier,
}

/// Handle to one accepted TCP connection.
///
/// Cheap to clone and safe to use from any thread. Two handles are equal iff
/// they refer to the same accepted socket; a later connection that happens to
/// get the same OS descriptor is a different connection.
#[derive(Clone)]
pub struct Connection {
    shared: Arc<Shared>,
}

impl Connection {
    pub(crate) fn new(
        token: ConnectionToken,
        remote_addr: SocketAddr,
        local_port: u16,
        max_pending_bytes: usize,
        notifier: ReactorNotifier,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                token,
                remote_addr,
                remote_host: host_string(remote_addr.ip()),
                local_port,
                pending: OutboundQueue::new(max_pending_bytes),
                write_requested: AtomicBool::new(false),
                logged_level: AtomicU8::new(LEVEL_UNSET),
                notifier,
            }),
        }
    }

    /// Enqueue bytes for transmission.
    ///
    /// Chunks sent from one thread reach the peer in call order. Fails with
    /// [`Error::ConnectionClosed`] once `close()` was called, and with
    /// [`Error::Backpressure`] when the outbound queue is full.
    pub fn send(&self, data: impl Into<Bytes>) -> Result<()> {
        let pushed = self.shared.pending.push(data.into());
        self.after_push(pushed)
    }

    /// Send the UTF-8 bytes of `text`.
    pub fn send_text(&self, text: &str) -> Result<()> {
        self.send(Bytes::copy_from_slice(text.as_bytes()))
    }

    /// Send `line` followed by CR LF (as a separate chunk). Both chunks are
    /// queued together, or neither is.
    pub fn send_line(&self, line: &str) -> Result<()> {
        let pushed = self.shared.pending.push_all([
            Bytes::copy_from_slice(line.as_bytes()),
            Bytes::from_static(LINE_TERMINATOR),
        ]);
        self.after_push(pushed)
    }

    /// Request a graceful close: everything already queued is still written,
    /// then the reactor closes the socket. Repeated calls have no effect.
    pub fn close(&self) {
        if self.shared.pending.push_close() {
            debug!("Connection {} close requested", self);
            self.request_write();
        }
    }

    /// `true` once `close()` was called or the reactor released the socket.
    pub fn is_closed(&self) -> bool {
        self.lifecycle() != Lifecycle::Open
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.shared.pending.lifecycle()
    }

    pub fn token(&self) -> ConnectionToken {
        self.shared.token
    }

    pub fn remote_host(&self) -> &str {
        &self.shared.remote_host
    }

    pub fn remote_port(&self) -> u16 {
        self.shared.remote_addr.port()
    }

    /// Remote `(host, port)`
    pub fn remote_address(&self) -> (&str, u16) {
        (self.remote_host(), self.remote_port())
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.shared.remote_addr
    }

    pub fn local_port(&self) -> u16 {
        self.shared.local_port
    }

    /// Bytes queued and not yet written to the socket
    pub fn pending_bytes(&self) -> usize {
        self.shared.pending.pending_bytes()
    }

    pub fn backpressure_level(&self) -> BackpressureLevel {
        self.shared.pending.backpressure_level()
    }

    pub(crate) fn queue(&self) -> &OutboundQueue {
        &self.shared.pending
    }

    fn after_push(&self, pushed: std::result::Result<BackpressureLevel, PushError>) -> Result<()> {
        let level = match pushed {
            Ok(level) => level,
            Err(PushError::Closed) => {
                return Err(Error::ConnectionClosed {
                    connection: self.to_string(),
                })
            }
            Err(PushError::Full { pending, limit }) => {
                return Err(Error::Backpressure {
                    connection: self.to_string(),
                    pending,
                    limit,
                })
            }
        };
        self.note_backpressure(level);
        self.request_write();
        Ok(())
    }

    /// Post a write-interest change request unless one is already outstanding.
    fn request_write(&self) {
        if self.shared.write_requested.swap(true, Ordering::SeqCst) {
            return;
        }
        let request = ChangeRequest {
            token: self.shared.token,
            interest: Interest::READ_WRITE,
        };
        if !self.shared.notifier.post(request) {
            debug!("Connection {} outlived its reactor", self);
        }
    }

    /// Called by the reactor after it drained the queue. Returns `true` if the
    /// queue is still empty afterwards, i.e. write interest may be dropped.
    ///
    /// The flag is cleared before the re-check, so a producer racing with us
    /// either lands before the check or sees the cleared flag and posts again.
    pub(crate) fn clear_write_request(&self) -> bool {
        self.shared.write_requested.store(false, Ordering::SeqCst);
        self.shared.pending.is_empty()
    }

    fn note_backpressure(&self, level: BackpressureLevel) {
        let code = level as u8 + 1;
        let previous = self.shared.logged_level.swap(code, Ordering::Relaxed);
        if previous != code && level >= BackpressureLevel::High {
            warn!(
                "Connection {} outbound queue at {:?} ({} bytes pending)",
                self,
                level,
                self.pending_bytes()
            );
        }
    }
}

fn host_string(ip: IpAddr) -> String {
    match ip {
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => v4.to_string(),
            None => v6.to_string(),
        },
        IpAddr::V4(v4) => v4.to_string(),
    }
}

impl PartialEq for Connection {
    fn eq(&self, other: &Self) -> bool {
        self.shared.token == other.shared.token
    }
}

impl Eq for Connection {}

impl Hash for Connection {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.shared.token.hash(state);
    }
}

impl fmt::Display for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}<={}:{}",
            self.shared.local_port,
            self.shared.remote_host,
            self.remote_port()
        )
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("token", &self.shared.token)
            .field("peer", &self.to_string())
            .field("lifecycle", &self.lifecycle())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tcp::poller::Poller;
    use crate::tcp::write_queue::DEFAULT_MAX_PENDING_BYTES;
    use std::collections::HashSet;

    struct Harness {
        receiver: crossbeam_channel::Receiver<ChangeRequest>,
        notifier: ReactorNotifier,
        _poller: Poller,
    }

    fn harness() -> Harness {
        let poller = Poller::new().expect("Failed to create poller");
        let (sender, receiver) = crossbeam_channel::unbounded();
        Harness {
            receiver,
            notifier: ReactorNotifier::new(sender, poller.waker()),
            _poller: poller,
        }
    }

    fn connection(h: &Harness, id: usize, generation: u32) -> Connection {
        Connection::new(
            ConnectionToken::new(id, generation),
            "127.0.0.1:40000".parse().unwrap(),
            8080,
            DEFAULT_MAX_PENDING_BYTES,
            h.notifier.clone(),
        )
    }

    #[test]
    fn test_display_and_addressing() {
        let h = harness();
        let conn = connection(&h, 0, 1);
        assert_eq!(conn.to_string(), "8080<=127.0.0.1:40000");
        assert_eq!(conn.remote_address(), ("127.0.0.1", 40000));
        assert_eq!(conn.local_port(), 8080);
    }

    #[test]
    fn test_mapped_ipv6_host_is_rendered_as_ipv4() {
        let ip: IpAddr = "::ffff:10.0.0.7".parse().unwrap();
        assert_eq!(host_string(ip), "10.0.0.7");
        let ip: IpAddr = "::1".parse().unwrap();
        assert_eq!(host_string(ip), "::1");
    }

    #[test]
    fn test_identity_by_token() {
        let h = harness();
        let a = connection(&h, 3, 1);
        let a_clone = a.clone();
        let reused_slot = connection(&h, 3, 2);

        assert_eq!(a, a_clone);
        assert_ne!(a, reused_slot);

        let mut set = HashSet::new();
        set.insert(a.clone());
        assert!(set.contains(&a_clone));
        assert!(!set.contains(&reused_slot));
    }

    #[test]
    fn test_repeated_sends_post_one_change_request() {
        let h = harness();
        let conn = connection(&h, 0, 1);

        conn.send(&b"one"[..]).unwrap();
        conn.send(&b"two"[..]).unwrap();
        conn.send_line("three").unwrap();

        let requests: Vec<_> = h.receiver.try_iter().collect();
        assert_eq!(
            requests,
            vec![ChangeRequest {
                token: conn.token(),
                interest: Interest::READ_WRITE
            }]
        );
        assert_eq!(conn.pending_bytes(), 3 + 3 + 5 + 2);
    }

    #[test]
    fn test_clear_write_request_rearms_signal() {
        let h = harness();
        let conn = connection(&h, 0, 1);

        conn.send(&b"x"[..]).unwrap();
        assert_eq!(h.receiver.try_iter().count(), 1);

        // Queue still holds "x": not safe to drop write interest.
        assert!(!conn.clear_write_request());
        while conn.queue().pop().is_some() {}
        assert!(conn.clear_write_request());

        conn.send(&b"y"[..]).unwrap();
        assert_eq!(h.receiver.try_iter().count(), 1);
    }

    #[test]
    fn test_send_after_close_fails() {
        let h = harness();
        let conn = connection(&h, 0, 1);

        conn.send_text("bye").unwrap();
        conn.close();
        assert!(conn.is_closed());
        assert_eq!(conn.lifecycle(), Lifecycle::Closing);

        let err = conn.send(&b"late"[..]).unwrap_err();
        assert!(matches!(err, Error::ConnectionClosed { .. }));
        assert!(conn.send_line("late").is_err());
        assert!(conn.send_text("late").is_err());
    }

    #[test]
    fn test_close_twice_enqueues_one_marker() {
        let h = harness();
        let conn = connection(&h, 0, 1);
        conn.close();
        conn.close();
        assert_eq!(conn.queue().pending_entries(), 1);
    }

    #[test]
    fn test_backpressure_surfaces_as_error() {
        let h = harness();
        let conn = Connection::new(
            ConnectionToken::new(0, 1),
            "127.0.0.1:1".parse().unwrap(),
            2,
            16,
            h.notifier.clone(),
        );
        conn.send(vec![0u8; 10]).unwrap();
        let err = conn.send(vec![0u8; 10]).unwrap_err();
        assert!(matches!(err, Error::Backpressure { pending: 10, limit: 16, .. }));
        assert!(err.is_state_error());
    }

    #[test]
    fn test_send_line_never_leaves_half_a_line() {
        let h = harness();
        let conn = Connection::new(
            ConnectionToken::new(0, 1),
            "127.0.0.1:1".parse().unwrap(),
            2,
            16,
            h.notifier.clone(),
        );
        conn.send_text("0123456789").unwrap();

        // "abcd" alone would fit, but not together with CR LF.
        let err = conn.send_line("abcd").unwrap_err();
        assert!(matches!(err, Error::Backpressure { pending: 10, .. }));
        assert_eq!(conn.pending_bytes(), 10);
        assert_eq!(conn.queue().pending_entries(), 1);
    }

    #[test]
    #[cfg(target_pointer_width = "64")]
    fn test_poller_token_roundtrip() {
        let token = ConnectionToken::new(42, 7);
        assert_eq!(ConnectionToken::from_poller_token(token.to_poller_token()), token);
    }
}
