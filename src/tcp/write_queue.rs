// src/tcp/write_queue.rs - Outbound queue implementation
//
// Core features:
// - Many producers append under a short lock, the reactor thread pops
// - Terminal close marker, appended exactly once, always last
// - Bounded by bytes: pushes that would reach the limit are rejected
// - Partial write support through a reactor-owned cursor

use crate::tcp::connection::Lifecycle;
use bytes::Bytes;
use crossbeam::atomic::AtomicCell;
use std::collections::VecDeque;
use std::io::{self, Write};
use std::sync::{Mutex, MutexGuard};

/// Default byte limit of one connection's outbound queue (4MB)
pub const DEFAULT_MAX_PENDING_BYTES: usize = 4 * 1024 * 1024;

/// Queue entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Chunk {
    Data(Bytes),
    /// Terminal close marker: flush everything before it, then close.
    Close,
}

/// Backpressure level, relative to the queue's byte limit
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum BackpressureLevel {
    Normal,   // < 25%
    Warning,  // 25-50%
    High,     // 50-100%
    Critical, // limit reached, pushes rejected
}

impl BackpressureLevel {
    fn for_usage(pending: usize, limit: usize) -> Self {
        if pending >= limit {
            BackpressureLevel::Critical
        } else if pending >= limit / 2 {
            BackpressureLevel::High
        } else if pending >= limit / 4 {
            BackpressureLevel::Warning
        } else {
            BackpressureLevel::Normal
        }
    }
}

/// Why a push was refused
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PushError {
    /// Close was requested or the socket is gone.
    Closed,
    /// Accepting the chunk would reach the byte limit.
    Full { pending: usize, limit: usize },
}

struct Inner {
    chunks: VecDeque<Chunk>,
    /// Bytes enqueued and not yet fully written (includes the chunk in flight).
    pending_bytes: usize,
}

/// Outbound queue shared between producer threads and the reactor
pub struct OutboundQueue {
    inner: Mutex<Inner>,
    lifecycle: AtomicCell<Lifecycle>,
    max_pending_bytes: usize,
}

impl OutboundQueue {
    pub fn new(max_pending_bytes: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                chunks: VecDeque::with_capacity(16),
                pending_bytes: 0,
            }),
            lifecycle: AtomicCell::new(Lifecycle::Open),
            max_pending_bytes: max_pending_bytes.max(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // A panicking producer cannot leave Inner half-updated, so recover.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Enqueue data
    pub(crate) fn push(&self, data: Bytes) -> Result<BackpressureLevel, PushError> {
        self.push_all([data])
    }

    /// Enqueue several chunks as one unit: either all of them or none.
    ///
    /// The lifecycle check and the append happen under one lock, so a chunk can
    /// never land behind the close marker.
    pub(crate) fn push_all<const N: usize>(
        &self,
        chunks: [Bytes; N],
    ) -> Result<BackpressureLevel, PushError> {
        let mut inner = self.lock();
        if self.lifecycle.load() != Lifecycle::Open {
            return Err(PushError::Closed);
        }

        // Check the limit BEFORE adding to prevent overshoot. An empty queue
        // takes any size, otherwise data at or above the limit could never be sent.
        let len: usize = chunks.iter().map(Bytes::len).sum();
        let after = inner.pending_bytes.saturating_add(len);
        if inner.pending_bytes > 0 && len > 0 && after >= self.max_pending_bytes {
            return Err(PushError::Full {
                pending: inner.pending_bytes,
                limit: self.max_pending_bytes,
            });
        }

        inner.pending_bytes = after;
        inner.chunks.extend(chunks.into_iter().map(Chunk::Data));
        Ok(BackpressureLevel::for_usage(after, self.max_pending_bytes))
    }

    /// Append the close marker. Returns `true` only for the call that moved the
    /// lifecycle from `Open` to `Closing`.
    pub(crate) fn push_close(&self) -> bool {
        let mut inner = self.lock();
        if self
            .lifecycle
            .compare_exchange(Lifecycle::Open, Lifecycle::Closing)
            .is_err()
        {
            return false;
        }
        inner.chunks.push_back(Chunk::Close);
        true
    }

    /// Pop the head chunk (reactor thread only)
    pub(crate) fn pop(&self) -> Option<Chunk> {
        self.lock().chunks.pop_front()
    }

    /// Account for bytes that reached the socket (reactor thread only)
    pub(crate) fn release(&self, n: usize) {
        let mut inner = self.lock();
        inner.pending_bytes = inner.pending_bytes.saturating_sub(n);
    }

    /// Drop everything still queued; used when the socket is already gone.
    pub(crate) fn discard(&self) -> usize {
        let mut inner = self.lock();
        inner.chunks.clear();
        std::mem::take(&mut inner.pending_bytes)
    }

    pub fn is_empty(&self) -> bool {
        self.lock().chunks.is_empty()
    }

    pub fn pending_bytes(&self) -> usize {
        self.lock().pending_bytes
    }

    /// Current backpressure level
    pub fn backpressure_level(&self) -> BackpressureLevel {
        BackpressureLevel::for_usage(self.pending_bytes(), self.max_pending_bytes)
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.lifecycle.load()
    }

    /// `Closing` on behalf of the reactor (shutdown), without a marker.
    pub(crate) fn mark_closing(&self) {
        let _guard = self.lock();
        let _ = self
            .lifecycle
            .compare_exchange(Lifecycle::Open, Lifecycle::Closing);
    }

    pub(crate) fn mark_closed(&self) {
        let _guard = self.lock();
        self.lifecycle.store(Lifecycle::Closed);
    }

    /// Entry count in queue (test only)
    #[cfg(test)]
    pub(crate) fn pending_entries(&self) -> usize {
        self.lock().chunks.len()
    }
}

/// Flush result
#[derive(Debug, PartialEq, Eq)]
pub enum FlushResult {
    /// Queue drained, nothing left to write
    Drained { bytes_written: usize },
    /// WouldBlock encountered, partial write
    WouldBlock { bytes_written: usize },
    /// Close marker reached after everything before it was written
    CloseRequested { bytes_written: usize },
    /// Writer accepted zero bytes of a non-empty buffer
    Closed,
}

struct WriteEntry {
    data: Bytes,
    offset: usize,
}

impl WriteEntry {
    fn remaining(&self) -> &[u8] {
        &self.data[self.offset..]
    }

    fn is_complete(&self) -> bool {
        self.offset >= self.data.len()
    }
}

/// Reactor-side write position: holds the chunk that was popped but not fully
/// written yet, so the next writable event resumes mid-chunk.
#[derive(Default)]
pub struct WriteCursor {
    current: Option<WriteEntry>,
}

impl WriteCursor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has_partial(&self) -> bool {
        self.current.is_some()
    }

    /// Try to flush to writer (drain until WouldBlock)
    pub fn try_flush<W: Write>(
        &mut self,
        queue: &OutboundQueue,
        writer: &mut W,
    ) -> io::Result<FlushResult> {
        let mut bytes_written = 0;

        loop {
            if self.current.is_none() {
                match queue.pop() {
                    Some(Chunk::Data(data)) => {
                        // Empty chunks are legal and carry nothing.
                        if data.is_empty() {
                            continue;
                        }
                        self.current = Some(WriteEntry { data, offset: 0 });
                    }
                    Some(Chunk::Close) => {
                        return Ok(FlushResult::CloseRequested { bytes_written });
                    }
                    None => return Ok(FlushResult::Drained { bytes_written }),
                }
            }

            let Some(entry) = self.current.as_mut() else {
                continue;
            };

            match writer.write(entry.remaining()) {
                Ok(0) => return Ok(FlushResult::Closed),
                Ok(n) => {
                    bytes_written += n;
                    entry.offset += n;
                    if entry.is_complete() {
                        queue.release(entry.data.len());
                        self.current = None;
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return Ok(FlushResult::WouldBlock { bytes_written });
                }
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }
}
