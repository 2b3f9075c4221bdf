//! The event reader loop.
//!
//! Exactly one reader exists per kernel handle. Each iteration suspends once,
//! waiting for bytes, then synchronously decodes every complete record in its
//! buffer and routes it by watch descriptor. Records are dispatched in the
//! order the kernel produced them.
//!
//! Per-record problems (orphaned descriptors, undecodable bytes, closed
//! subscriptions) are logged and skipped. Only a failing read ends the loop
//! with an error.

use std::io;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

use crate::codec::{self, RawEvent, WatchId, HEADER_LEN, MAX_NAME_LEN};
use crate::error::{DecodeError, NotifyError, NotifyResult};
use crate::event::Event;
use crate::queue::EventQueue;
use crate::registry::WatchRegistry;

/// Smallest read the kernel accepts without `EINVAL`: one maximal record.
pub const MIN_CHUNK_SIZE: usize = HEADER_LEN + NAME_MAX + 1;

const NAME_MAX: usize = 255;

/// Default bound on bytes read per wake-up.
pub const DEFAULT_CHUNK_SIZE: usize = 256 * 1024;

/// How the reader loop ended without error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReaderExit {
    /// The byte source reported end-of-stream.
    Eof,
    /// Shutdown was requested.
    Cancelled,
}

/// Counters kept by a reader.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReaderStats {
    /// Records routed to a subscription.
    pub dispatched: u64,
    /// Records whose descriptor had no live subscription.
    pub orphaned: u64,
    /// Kernel overflow records surfaced to the queue.
    pub overflows: u64,
    /// Bytes discarded because they could not be decoded.
    pub discarded_bytes: u64,
}

/// Decodes raw bytes into records and dispatches them.
#[derive(Debug)]
pub struct EventReader {
    registry: Arc<WatchRegistry>,
    queue: Arc<EventQueue>,
    chunk_size: usize,
    pending: Vec<u8>,
    stats: ReaderStats,
}

impl EventReader {
    /// Creates a reader. `chunk_size` is clamped to at least [`MIN_CHUNK_SIZE`].
    #[must_use]
    pub fn new(registry: Arc<WatchRegistry>, queue: Arc<EventQueue>, chunk_size: usize) -> Self {
        Self {
            registry,
            queue,
            chunk_size: chunk_size.max(MIN_CHUNK_SIZE),
            pending: Vec::new(),
            stats: ReaderStats::default(),
        }
    }

    /// Bytes requested per read.
    #[must_use]
    pub const fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Counters accumulated so far.
    #[must_use]
    pub const fn stats(&self) -> ReaderStats {
        self.stats
    }

    /// Bytes buffered while waiting for the rest of a record.
    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Runs until end-of-stream, cancellation, or a fatal read error.
    ///
    /// On every exit path the queue is closed and every still-registered
    /// subscription is detached.
    ///
    /// # Errors
    /// `NotifyError::Read` if the source fails with anything but `Interrupted`.
    pub async fn run<R>(mut self, mut source: R, cancel: CancellationToken) -> NotifyResult<ReaderExit>
    where
        R: AsyncRead + Unpin,
    {
        let mut chunk = vec![0u8; self.chunk_size];

        let result = loop {
            let read = tokio::select! {
                biased;
                () = cancel.cancelled() => break Ok(ReaderExit::Cancelled),
                read = source.read(&mut chunk) => read,
            };

            match read {
                Ok(0) => break Ok(ReaderExit::Eof),
                Ok(len) => {
                    self.feed(&chunk[..len]);
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(source) => {
                    error!(error = %source, "fatal read error on inotify handle");
                    break Err(NotifyError::Read { source });
                }
            }
        };

        drop(source);
        self.finish();
        debug!(?result, stats = ?self.stats, "reader loop finished");
        result
    }

    /// Buffers `bytes` and dispatches every complete record.
    ///
    /// Returns the number of records decoded.
    pub fn feed(&mut self, bytes: &[u8]) -> usize {
        self.pending.extend_from_slice(bytes);

        let mut offset = 0;
        let mut decoded = 0;
        loop {
            match codec::decode(&self.pending[offset..]) {
                Ok((raw, used)) => {
                    offset += used;
                    decoded += 1;
                    self.dispatch(&raw);
                }
                Err(DecodeError::ShortRead { .. }) => break,
                Err(err @ DecodeError::NameTooLong { .. }) => {
                    // No way to find the next record boundary.
                    let skipped = self.pending.len() - offset;
                    debug!(error = %err, skipped, max = MAX_NAME_LEN, "discarding undecodable bytes");
                    self.stats.discarded_bytes += skipped as u64;
                    offset = self.pending.len();
                    break;
                }
            }
        }

        self.pending.drain(..offset);
        decoded
    }

    fn dispatch(&mut self, raw: &RawEvent) {
        if raw.watch_id == WatchId::OVERFLOW && raw.mask.is_overflow() {
            warn!("kernel event queue overflowed; events were lost");
            self.stats.overflows += 1;
            self.queue.push(Event::unbound(raw));
            return;
        }

        match self.registry.lookup(raw.watch_id) {
            Ok(target) => {
                self.stats.dispatched += 1;
                if let Err(err) = target.dispatch(raw) {
                    trace!(id = %raw.watch_id, error = %err, "dropping record for closed watch");
                }
            }
            Err(err) => {
                self.stats.orphaned += 1;
                debug!(error = %err, mask = %raw.mask, "orphaned event");
            }
        }
    }

    fn finish(&mut self) {
        if !self.pending.is_empty() {
            debug!(bytes = self.pending.len(), "discarding partial record at shutdown");
            self.pending.clear();
        }
        self.queue.close();
        for target in self.registry.drain() {
            target.detach();
        }
    }
}
