// src/tcp/poller.rs - Cross-platform readiness selection
//
// Provides a unified IO multiplexing abstraction:
// - Linux: epoll (edge-triggered), woken through an eventfd
// - macOS/BSD: kqueue (EV_CLEAR edge-triggered), woken through a pipe
// - Windows: WSAPoll (level-triggered), woken through a loopback UDP pair
//
// The poller is owned by the reactor thread. The only piece shared with other
// threads is the `Waker`, which interrupts an in-progress `poll`.

use std::io;
use std::time::Duration;

/// Token reserved for the internal wake source. Never handed out for sockets.
pub const WAKE_TOKEN: usize = usize::MAX;

const MAX_EVENTS: usize = 256;

/// Event interest flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Interest {
    pub readable: bool,
    pub writable: bool,
}

impl Interest {
    pub const READABLE: Interest = Interest {
        readable: true,
        writable: false,
    };

    pub const WRITABLE: Interest = Interest {
        readable: false,
        writable: true,
    };

    pub const READ_WRITE: Interest = Interest {
        readable: true,
        writable: true,
    };
}

/// IO event
#[derive(Debug, Clone, Copy)]
pub struct Event {
    pub token: usize,
    pub readable: bool,
    pub writable: bool,
    pub error: bool,
    pub hangup: bool,
}

impl Event {
    pub fn is_readable(&self) -> bool {
        self.readable
    }

    pub fn is_writable(&self) -> bool {
        self.writable
    }

    pub fn is_error(&self) -> bool {
        self.error
    }

    pub fn is_hangup(&self) -> bool {
        self.hangup
    }
}

fn timeout_millis(timeout: Option<Duration>) -> i32 {
    match timeout {
        // Round up so a sub-millisecond timeout does not turn into a busy spin.
        Some(d) => {
            let ms = d.as_millis() + u128::from(d.subsec_nanos() % 1_000_000 != 0);
            ms.min(i32::MAX as u128) as i32
        }
        None => -1,
    }
}

// ============================================================================
// Linux: epoll + eventfd
// ============================================================================

#[cfg(target_os = "linux")]
mod linux {
    use super::*;
    use std::os::unix::io::RawFd;
    use std::sync::Arc;

    pub type RawHandle = RawFd;

    /// Interrupts a blocked `Poller::poll` from any thread.
    #[derive(Debug)]
    pub struct Waker {
        eventfd: RawFd,
    }

    impl Waker {
        fn new() -> io::Result<Self> {
            // SAFETY: eventfd takes no pointers; the result is checked below.
            let eventfd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
            if eventfd < 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(Waker { eventfd })
        }

        /// Make the next (or current) `poll` return.
        ///
        /// Wakes coalesce: the counter saturating or already being non-zero is fine.
        pub fn wake(&self) -> io::Result<()> {
            let buf: u64 = 1;
            // SAFETY: writes 8 bytes from a valid stack u64 to an fd owned by self.
            let ret = unsafe {
                libc::write(self.eventfd, &buf as *const u64 as *const libc::c_void, 8)
            };
            if ret < 0 {
                let err = io::Error::last_os_error();
                // Counter full: a wake is already pending.
                if err.kind() == io::ErrorKind::WouldBlock {
                    return Ok(());
                }
                return Err(err);
            }
            Ok(())
        }

        fn reset(&self) {
            let mut buf: u64 = 0;
            // SAFETY: reads at most 8 bytes into a valid stack u64; EAGAIN is harmless.
            unsafe {
                libc::read(self.eventfd, &mut buf as *mut u64 as *mut libc::c_void, 8);
            }
        }
    }

    impl Drop for Waker {
        fn drop(&mut self) {
            // SAFETY: the eventfd is owned by this Waker and closed exactly once.
            unsafe { libc::close(self.eventfd) };
        }
    }

    pub struct Poller {
        epfd: RawFd,
        events: Vec<libc::epoll_event>,
        waker: Arc<Waker>,
    }

    impl Poller {
        pub fn new() -> io::Result<Self> {
            // SAFETY: epoll_create1 takes no pointers; the result is checked below.
            let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
            if epfd < 0 {
                return Err(io::Error::last_os_error());
            }

            let waker = match Waker::new() {
                Ok(w) => Arc::new(w),
                Err(e) => {
                    // SAFETY: epfd was created above and is not shared yet.
                    unsafe { libc::close(epfd) };
                    return Err(e);
                }
            };

            let mut poller = Poller {
                epfd,
                events: Vec::with_capacity(MAX_EVENTS),
                waker,
            };

            // Level-triggered so a wake that races with reset is never lost.
            let mut event = libc::epoll_event {
                events: libc::EPOLLIN as u32,
                u64: WAKE_TOKEN as u64,
            };
            poller.ctl(libc::EPOLL_CTL_ADD, poller.waker.eventfd, &mut event)?;
            Ok(poller)
        }

        pub fn waker(&self) -> Arc<Waker> {
            self.waker.clone()
        }

        fn ctl(&mut self, op: i32, fd: RawHandle, event: *mut libc::epoll_event) -> io::Result<()> {
            // SAFETY: self.epfd is a valid epoll fd owned by self; `event` points to
            // a live epoll_event on the caller's stack or is null for EPOLL_CTL_DEL.
            let ret = unsafe { libc::epoll_ctl(self.epfd, op, fd, event) };
            if ret < 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        }

        pub fn register(&mut self, fd: RawHandle, token: usize, interest: Interest) -> io::Result<()> {
            let mut event = libc::epoll_event {
                events: interest_to_epoll(interest) | libc::EPOLLET as u32,
                u64: token as u64,
            };
            self.ctl(libc::EPOLL_CTL_ADD, fd, &mut event)
        }

        /// Replace the interest set. Re-arming reports readiness that is already
        /// present, so adding WRITABLE on an idle socket yields an event at once.
        pub fn modify(&mut self, fd: RawHandle, token: usize, interest: Interest) -> io::Result<()> {
            let mut event = libc::epoll_event {
                events: interest_to_epoll(interest) | libc::EPOLLET as u32,
                u64: token as u64,
            };
            self.ctl(libc::EPOLL_CTL_MOD, fd, &mut event)
        }

        pub fn deregister(&mut self, fd: RawHandle) -> io::Result<()> {
            self.ctl(libc::EPOLL_CTL_DEL, fd, std::ptr::null_mut())
        }

        pub fn poll(&mut self, timeout: Option<Duration>) -> io::Result<Vec<Event>> {
            let timeout_ms = timeout_millis(timeout);

            let n = loop {
                // SAFETY: the buffer has MAX_EVENTS capacity and epoll_wait writes at
                // most that many entries; len is set from the returned count below.
                let ret = unsafe {
                    libc::epoll_wait(
                        self.epfd,
                        self.events.as_mut_ptr(),
                        MAX_EVENTS as i32,
                        timeout_ms,
                    )
                };
                if ret < 0 {
                    let err = io::Error::last_os_error();
                    if err.kind() == io::ErrorKind::Interrupted {
                        continue;
                    }
                    return Err(err);
                }
                break ret as usize;
            };

            // SAFETY: epoll_wait initialised the first n entries.
            unsafe { self.events.set_len(n) };

            let mut result = Vec::with_capacity(n);
            for ev in self.events.drain(..) {
                let token = ev.u64 as usize;
                let flags = ev.events;
                if token == WAKE_TOKEN {
                    self.waker.reset();
                    continue;
                }
                result.push(Event {
                    token,
                    readable: flags & libc::EPOLLIN as u32 != 0,
                    writable: flags & libc::EPOLLOUT as u32 != 0,
                    error: flags & libc::EPOLLERR as u32 != 0,
                    hangup: flags & libc::EPOLLHUP as u32 != 0,
                });
            }
            Ok(result)
        }
    }

    impl Drop for Poller {
        fn drop(&mut self) {
            // SAFETY: epfd is owned exclusively by self and closed exactly once.
            unsafe { libc::close(self.epfd) };
        }
    }

    fn interest_to_epoll(interest: Interest) -> u32 {
        let mut events = 0;
        if interest.readable {
            events |= libc::EPOLLIN as u32;
        }
        if interest.writable {
            events |= libc::EPOLLOUT as u32;
        }
        events
    }
}

// ============================================================================
// macOS / BSD: kqueue + self-pipe
// ============================================================================

#[cfg(any(
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "openbsd",
    target_os = "netbsd",
    target_os = "dragonfly"
))]
mod bsd {
    use super::*;
    use std::collections::HashMap;
    use std::os::unix::io::RawFd;
    use std::sync::Arc;

    pub type RawHandle = RawFd;

    /// Interrupts a blocked `Poller::poll` from any thread.
    #[derive(Debug)]
    pub struct Waker {
        read_fd: RawFd,
        write_fd: RawFd,
    }

    fn set_nonblocking_cloexec(fd: RawFd) -> io::Result<()> {
        // SAFETY: fcntl on an fd we just created; results are checked.
        unsafe {
            let flags = libc::fcntl(fd, libc::F_GETFL);
            if flags < 0 || libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
                return Err(io::Error::last_os_error());
            }
            if libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC) < 0 {
                return Err(io::Error::last_os_error());
            }
        }
        Ok(())
    }

    impl Waker {
        fn new() -> io::Result<Self> {
            let mut fds = [0 as RawFd; 2];
            // SAFETY: fds is a valid two-element array as pipe(2) requires.
            if unsafe { libc::pipe(fds.as_mut_ptr()) } < 0 {
                return Err(io::Error::last_os_error());
            }
            let waker = Waker {
                read_fd: fds[0],
                write_fd: fds[1],
            };
            set_nonblocking_cloexec(waker.read_fd)?;
            set_nonblocking_cloexec(waker.write_fd)?;
            Ok(waker)
        }

        /// Make the next (or current) `poll` return.
        pub fn wake(&self) -> io::Result<()> {
            let buf = [1u8];
            // SAFETY: writes one byte from a valid buffer to a pipe owned by self.
            let ret = unsafe { libc::write(self.write_fd, buf.as_ptr() as *const libc::c_void, 1) };
            if ret < 0 {
                let err = io::Error::last_os_error();
                // Pipe full: plenty of wakes already pending.
                if err.kind() == io::ErrorKind::WouldBlock {
                    return Ok(());
                }
                return Err(err);
            }
            Ok(())
        }

        fn reset(&self) {
            let mut buf = [0u8; 64];
            loop {
                // SAFETY: reads into a valid stack buffer from a pipe owned by self.
                let n = unsafe {
                    libc::read(self.read_fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len())
                };
                if n <= 0 {
                    break;
                }
            }
        }
    }

    impl Drop for Waker {
        fn drop(&mut self) {
            // SAFETY: both pipe ends are owned by this Waker and closed exactly once.
            unsafe {
                libc::close(self.read_fd);
                libc::close(self.write_fd);
            }
        }
    }

    pub struct Poller {
        kq: RawFd,
        waker: Arc<Waker>,
    }

    fn kevent_for(fd: RawHandle, filter: i32, flags: u32, token: usize) -> libc::kevent {
        // SAFETY: kevent is a plain C struct; all-zero is a valid empty value.
        let mut ev: libc::kevent = unsafe { std::mem::zeroed() };
        ev.ident = fd as _;
        ev.filter = filter as _;
        ev.flags = flags as _;
        ev.udata = token as _;
        ev
    }

    impl Poller {
        pub fn new() -> io::Result<Self> {
            // SAFETY: kqueue takes no arguments; the result is checked below.
            let kq = unsafe { libc::kqueue() };
            if kq < 0 {
                return Err(io::Error::last_os_error());
            }
            let waker = match Waker::new() {
                Ok(w) => Arc::new(w),
                Err(e) => {
                    // SAFETY: kq was created above and is not shared yet.
                    unsafe { libc::close(kq) };
                    return Err(e);
                }
            };
            let poller = Poller { kq, waker };
            let change = kevent_for(
                poller.waker.read_fd,
                libc::EVFILT_READ as i32,
                (libc::EV_ADD | libc::EV_ENABLE) as u32,
                WAKE_TOKEN,
            );
            poller.submit(&[change])?;
            Ok(poller)
        }

        pub fn waker(&self) -> Arc<Waker> {
            self.waker.clone()
        }

        fn submit(&self, changes: &[libc::kevent]) -> io::Result<()> {
            if changes.is_empty() {
                return Ok(());
            }
            // SAFETY: changes points to a valid slice of kevents; no event list
            // and a null timeout are passed, so kevent only applies the changes.
            let ret = unsafe {
                libc::kevent(
                    self.kq,
                    changes.as_ptr(),
                    changes.len() as _,
                    std::ptr::null_mut(),
                    0,
                    std::ptr::null(),
                )
            };
            if ret < 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        }

        fn changes_for(fd: RawHandle, token: usize, interest: Interest) -> Vec<libc::kevent> {
            let add = (libc::EV_ADD | libc::EV_ENABLE | libc::EV_CLEAR) as u32;
            let mut changes = Vec::with_capacity(2);
            if interest.readable {
                changes.push(kevent_for(fd, libc::EVFILT_READ as i32, add, token));
            }
            if interest.writable {
                changes.push(kevent_for(fd, libc::EVFILT_WRITE as i32, add, token));
            }
            changes
        }

        pub fn register(&mut self, fd: RawHandle, token: usize, interest: Interest) -> io::Result<()> {
            self.submit(&Self::changes_for(fd, token, interest))
        }

        pub fn modify(&mut self, fd: RawHandle, token: usize, interest: Interest) -> io::Result<()> {
            self.submit(&Self::changes_for(fd, token, interest))?;

            // Filters are independent on kqueue: drop the ones no longer wanted.
            // Deleting a filter that was never added reports ENOENT, which is fine.
            let delete = libc::EV_DELETE as u32;
            if !interest.readable {
                let _ = self.submit(&[kevent_for(fd, libc::EVFILT_READ as i32, delete, 0)]);
            }
            if !interest.writable {
                let _ = self.submit(&[kevent_for(fd, libc::EVFILT_WRITE as i32, delete, 0)]);
            }
            Ok(())
        }

        pub fn deregister(&mut self, fd: RawHandle) -> io::Result<()> {
            let delete = libc::EV_DELETE as u32;
            let _ = self.submit(&[kevent_for(fd, libc::EVFILT_READ as i32, delete, 0)]);
            let _ = self.submit(&[kevent_for(fd, libc::EVFILT_WRITE as i32, delete, 0)]);
            Ok(())
        }

        pub fn poll(&mut self, timeout: Option<Duration>) -> io::Result<Vec<Event>> {
            let timespec = timeout.map(|d| libc::timespec {
                tv_sec: d.as_secs() as _,
                tv_nsec: d.subsec_nanos() as _,
            });
            let timeout_ptr = timespec
                .as_ref()
                .map(|t| t as *const libc::timespec)
                .unwrap_or(std::ptr::null());

            // SAFETY: kevent is a plain C struct; the array is overwritten by kevent().
            let mut events: [libc::kevent; MAX_EVENTS] = unsafe { std::mem::zeroed() };

            let n = loop {
                // SAFETY: events is a valid writable array of MAX_EVENTS entries and
                // timeout_ptr is either null or points to a live timespec.
                let ret = unsafe {
                    libc::kevent(
                        self.kq,
                        std::ptr::null(),
                        0,
                        events.as_mut_ptr(),
                        MAX_EVENTS as _,
                        timeout_ptr,
                    )
                };
                if ret < 0 {
                    let err = io::Error::last_os_error();
                    if err.kind() == io::ErrorKind::Interrupted {
                        continue;
                    }
                    return Err(err);
                }
                break ret as usize;
            };

            // One kevent per filter; fold them into one Event per token.
            let mut by_token: HashMap<usize, Event> = HashMap::with_capacity(n);
            for ev in &events[..n] {
                let token = ev.udata as usize;
                if token == WAKE_TOKEN {
                    self.waker.reset();
                    continue;
                }
                let entry = by_token.entry(token).or_insert(Event {
                    token,
                    readable: false,
                    writable: false,
                    error: false,
                    hangup: false,
                });
                if ev.filter == libc::EVFILT_READ {
                    entry.readable = true;
                } else if ev.filter == libc::EVFILT_WRITE {
                    entry.writable = true;
                }
                if ev.flags & libc::EV_ERROR != 0 {
                    entry.error = true;
                }
                if ev.flags & libc::EV_EOF != 0 {
                    entry.hangup = true;
                }
            }
            Ok(by_token.into_values().collect())
        }
    }

    impl Drop for Poller {
        fn drop(&mut self) {
            // SAFETY: kq is owned exclusively by self and closed exactly once.
            unsafe { libc::close(self.kq) };
        }
    }
}

// ============================================================================
// Windows: WSAPoll + loopback UDP wake pair
// ============================================================================

#[cfg(target_os = "windows")]
mod windows {
    use super::*;
    use std::net::UdpSocket;
    use std::os::windows::io::{AsRawSocket, RawSocket};
    use std::sync::Arc;

    pub type RawHandle = RawSocket;

    const POLLIN: i16 = 0x0100 | 0x0200; // POLLRDNORM | POLLRDBAND
    const POLLOUT: i16 = 0x0010;
    const POLLERR: i16 = 0x0001;
    const POLLHUP: i16 = 0x0002;

    #[repr(C)]
    #[derive(Clone, Copy)]
    struct WSAPollFd {
        fd: RawSocket,
        events: i16,
        revents: i16,
    }

    // SAFETY: callers pass a valid array of `nfds` WSAPollFd entries. Winsock is
    // already initialised by std before any socket exists.
    #[link(name = "ws2_32")]
    extern "system" {
        fn WSAPoll(fds: *mut WSAPollFd, nfds: u32, timeout: i32) -> i32;
        fn WSAGetLastError() -> i32;
    }

    /// Interrupts a blocked `Poller::poll` from any thread.
    #[derive(Debug)]
    pub struct Waker {
        sender: UdpSocket,
    }

    impl Waker {
        /// Make the next (or current) `poll` return.
        pub fn wake(&self) -> io::Result<()> {
            match self.sender.send(&[1]) {
                Ok(_) => Ok(()),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(()),
                Err(e) => Err(e),
            }
        }
    }

    struct FdEntry {
        fd: RawSocket,
        token: usize,
        interest: Interest,
    }

    pub struct Poller {
        entries: Vec<FdEntry>,
        wake_receiver: UdpSocket,
        waker: Arc<Waker>,
    }

    impl Poller {
        pub fn new() -> io::Result<Self> {
            let wake_receiver = UdpSocket::bind("127.0.0.1:0")?;
            wake_receiver.set_nonblocking(true)?;
            let sender = UdpSocket::bind("127.0.0.1:0")?;
            sender.connect(wake_receiver.local_addr()?)?;
            sender.set_nonblocking(true)?;

            Ok(Poller {
                entries: Vec::with_capacity(64),
                wake_receiver,
                waker: Arc::new(Waker { sender }),
            })
        }

        pub fn waker(&self) -> Arc<Waker> {
            self.waker.clone()
        }

        pub fn register(&mut self, fd: RawHandle, token: usize, interest: Interest) -> io::Result<()> {
            if self.entries.iter().any(|e| e.fd == fd) {
                return Err(io::Error::new(
                    io::ErrorKind::AlreadyExists,
                    "socket already registered",
                ));
            }
            self.entries.push(FdEntry { fd, token, interest });
            Ok(())
        }

        pub fn modify(&mut self, fd: RawHandle, token: usize, interest: Interest) -> io::Result<()> {
            match self.entries.iter_mut().find(|e| e.fd == fd) {
                Some(entry) => {
                    entry.token = token;
                    entry.interest = interest;
                    Ok(())
                }
                None => Err(io::Error::new(io::ErrorKind::NotFound, "socket not registered")),
            }
        }

        pub fn deregister(&mut self, fd: RawHandle) -> io::Result<()> {
            match self.entries.iter().position(|e| e.fd == fd) {
                Some(pos) => {
                    self.entries.swap_remove(pos);
                    Ok(())
                }
                None => Err(io::Error::new(io::ErrorKind::NotFound, "socket not registered")),
            }
        }

        fn reset_waker(&self) {
            let mut buf = [0u8; 64];
            while self.wake_receiver.recv(&mut buf).is_ok() {}
        }

        pub fn poll(&mut self, timeout: Option<Duration>) -> io::Result<Vec<Event>> {
            let timeout_ms = timeout_millis(timeout);

            // Slot 0 is always the wake socket.
            let mut pollfds: Vec<WSAPollFd> = Vec::with_capacity(self.entries.len() + 1);
            pollfds.push(WSAPollFd {
                fd: self.wake_receiver.as_raw_socket(),
                events: POLLIN,
                revents: 0,
            });
            pollfds.extend(self.entries.iter().map(|e| WSAPollFd {
                fd: e.fd,
                events: interest_to_poll(e.interest),
                revents: 0,
            }));

            loop {
                // SAFETY: pollfds is a valid, writable array of the given length.
                let ret = unsafe { WSAPoll(pollfds.as_mut_ptr(), pollfds.len() as u32, timeout_ms) };
                if ret < 0 {
                    // SAFETY: no arguments; reads the thread-local Winsock error.
                    let err = unsafe { WSAGetLastError() };
                    if err == 10004 {
                        // WSAEINTR
                        continue;
                    }
                    return Err(io::Error::from_raw_os_error(err));
                }
                break;
            }

            if pollfds[0].revents != 0 {
                self.reset_waker();
            }

            let mut result = Vec::new();
            for (pollfd, entry) in pollfds[1..].iter().zip(self.entries.iter()) {
                if pollfd.revents != 0 {
                    result.push(Event {
                        token: entry.token,
                        readable: pollfd.revents & POLLIN != 0,
                        writable: pollfd.revents & POLLOUT != 0,
                        error: pollfd.revents & POLLERR != 0,
                        hangup: pollfd.revents & POLLHUP != 0,
                    });
                }
            }
            Ok(result)
        }
    }

    fn interest_to_poll(interest: Interest) -> i16 {
        let mut events: i16 = 0;
        if interest.readable {
            events |= POLLIN;
        }
        if interest.writable {
            events |= POLLOUT;
        }
        events
    }
}

// ============================================================================
// Re-export platform-specific implementation
// ============================================================================

#[cfg(target_os = "linux")]
pub use linux::{Poller, RawHandle, Waker};

#[cfg(any(
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "openbsd",
    target_os = "netbsd",
    target_os = "dragonfly"
))]
pub use bsd::{Poller, RawHandle, Waker};

#[cfg(target_os = "windows")]
pub use windows::{Poller, RawHandle, Waker};

/// Raw handle of anything the poller can watch.
#[cfg(unix)]
pub fn raw_handle_of<T: std::os::unix::io::AsRawFd>(io: &T) -> RawHandle {
    io.as_raw_fd()
}

/// Raw handle of anything the poller can watch.
#[cfg(windows)]
pub fn raw_handle_of<T: std::os::windows::io::AsRawSocket>(io: &T) -> RawHandle {
    io.as_raw_socket()
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::net::{TcpListener, TcpStream};
    use std::time::Instant;

    fn tcp_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").expect("Failed to bind");
        let addr = listener.local_addr().expect("Failed to get address");
        let client = TcpStream::connect(addr).expect("Failed to connect");
        let (server, _) = listener.accept().expect("Failed to accept");
        client.set_nonblocking(true).expect("Failed to set nonblocking");
        server.set_nonblocking(true).expect("Failed to set nonblocking");
        (client, server)
    }

    #[test]
    fn test_poller_basic() {
        let mut poller = Poller::new().expect("Failed to create poller");
        let (client, mut server) = tcp_pair();

        poller
            .register(raw_handle_of(&client), 1, Interest::READABLE)
            .expect("Failed to register");
        poller
            .register(raw_handle_of(&server), 2, Interest::WRITABLE)
            .expect("Failed to register");

        let events = poller.poll(Some(Duration::from_millis(100))).expect("Failed to poll");
        assert!(events.iter().any(|e| e.token == 2 && e.is_writable()));

        server.write_all(b"hello").expect("Failed to write");

        let events = poller.poll(Some(Duration::from_millis(100))).expect("Failed to poll");
        assert!(events.iter().any(|e| e.token == 1 && e.is_readable()));

        poller.deregister(raw_handle_of(&client)).expect("Failed to deregister");
        poller.deregister(raw_handle_of(&server)).expect("Failed to deregister");
    }

    #[test]
    fn test_deregister_no_events() {
        let mut poller = Poller::new().expect("Failed to create poller");
        let (client, mut server) = tcp_pair();

        poller
            .register(raw_handle_of(&client), 1, Interest::READABLE)
            .expect("Failed to register");
        poller.deregister(raw_handle_of(&client)).expect("Failed to deregister");

        server.write_all(b"ignored").expect("Failed to write");

        let events = poller.poll(Some(Duration::from_millis(50))).expect("Failed to poll");
        assert!(!events.iter().any(|e| e.token == 1));
    }

    #[test]
    fn test_modify_interest() {
        let mut poller = Poller::new().expect("Failed to create poller");
        let (_client, server) = tcp_pair();
        let fd = raw_handle_of(&server);

        poller.register(fd, 7, Interest::READABLE).expect("Failed to register");

        // Nothing to read yet, and writability is not watched.
        let events = poller.poll(Some(Duration::from_millis(50))).expect("Failed to poll");
        assert!(!events.iter().any(|e| e.token == 7 && e.is_writable()));

        poller.modify(fd, 7, Interest::READ_WRITE).expect("Failed to modify");
        let events = poller.poll(Some(Duration::from_millis(100))).expect("Failed to poll");
        assert!(events.iter().any(|e| e.token == 7 && e.is_writable()));

        poller.deregister(fd).expect("Failed to deregister");
    }

    #[test]
    fn test_wake_interrupts_blocking_poll() {
        let mut poller = Poller::new().expect("Failed to create poller");
        let waker = poller.waker();

        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            waker.wake().expect("Failed to wake");
        });

        let start = Instant::now();
        let events = poller.poll(None).expect("Failed to poll");
        assert!(events.is_empty(), "wake events are not reported");
        assert!(start.elapsed() < Duration::from_secs(5));

        handle.join().expect("waker thread panicked");
    }

    #[test]
    fn test_wake_is_consumed() {
        let mut poller = Poller::new().expect("Failed to create poller");
        let waker = poller.waker();

        waker.wake().expect("Failed to wake");
        waker.wake().expect("Failed to wake");
        poller.poll(Some(Duration::from_millis(100))).expect("Failed to poll");

        // Both wakes were coalesced and drained; the next poll times out.
        let start = Instant::now();
        poller.poll(Some(Duration::from_millis(50))).expect("Failed to poll");
        assert!(start.elapsed() >= Duration::from_millis(40));
    }

    #[test]
    fn test_timeout_millis_rounds_up() {
        assert_eq!(timeout_millis(None), -1);
        assert_eq!(timeout_millis(Some(Duration::from_micros(10))), 1);
        assert_eq!(timeout_millis(Some(Duration::from_millis(100))), 100);
    }
}
