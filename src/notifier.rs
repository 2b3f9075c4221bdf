//! Notifier: the public façade over one kernel handle.
//!
//! A `Notifier` owns the inotify handle, the watch registry, the shared event
//! queue and the reader task. Subscriptions created through it all feed the
//! same queue; consumers drain it with `next`, `stream` or the blocking
//! receivers.
//!
//! The reader task runs on the tokio runtime that was current when the
//! notifier was opened. It closes the kernel handle on every exit path.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures::Stream;
use parking_lot::Mutex;
use serde::Deserialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::{NotifyError, NotifyResult};
use crate::event::Event;
use crate::mask::EventMask;
use crate::queue::EventQueue;
use crate::reader::{EventReader, ReaderExit, DEFAULT_CHUNK_SIZE, MIN_CHUNK_SIZE};
use crate::registry::WatchRegistry;
use crate::sys::{HandleReader, InotifyHandle, WatchBackend};
use crate::watch::Watch;

/// Tunables for a [`Notifier`].
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct NotifierConfig {
    /// Max queued events before new ones are dropped.
    pub queue_capacity: usize,
    /// Max bytes read from the kernel per wake-up.
    pub read_chunk_size: usize,
}

impl Default for NotifierConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 2048,
            read_chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

impl NotifierConfig {
    /// Clamps every field into its usable range.
    #[must_use]
    pub fn normalized(self) -> Self {
        Self {
            queue_capacity: self.queue_capacity.max(1),
            read_chunk_size: self.read_chunk_size.max(MIN_CHUNK_SIZE),
        }
    }
}

type ReaderTask = JoinHandle<NotifyResult<ReaderExit>>;

/// Aggregates every subscription on one inotify handle into one queue.
#[derive(Debug)]
pub struct Notifier {
    cfg: NotifierConfig,
    handle: Arc<InotifyHandle>,
    registry: Arc<WatchRegistry>,
    queue: Arc<EventQueue>,
    cancel: CancellationToken,
    reader: Mutex<Option<ReaderTask>>,
}

impl Notifier {
    /// Opens a kernel handle and starts its reader task.
    ///
    /// # Errors
    /// - `Internal` if called outside a tokio runtime
    /// - `Init` if the kernel refuses a new inotify instance
    pub fn open(cfg: NotifierConfig) -> NotifyResult<Self> {
        let cfg = cfg.normalized();
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| NotifyError::internal(format!("notifier requires a tokio runtime: {e}")))?;

        let handle = Arc::new(InotifyHandle::open(true)?);
        let source = HandleReader::new(Arc::clone(&handle))?;

        let registry = Arc::new(WatchRegistry::new());
        let queue = Arc::new(EventQueue::new(cfg.queue_capacity));
        let cancel = CancellationToken::new();

        let reader = EventReader::new(Arc::clone(&registry), Arc::clone(&queue), cfg.read_chunk_size);
        let task_handle = Arc::clone(&handle);
        let task_cancel = cancel.clone();
        let task = runtime.spawn(async move {
            // `run` drops the reactor registration before returning.
            let result = reader.run(source, task_cancel).await;
            task_handle.close();
            result
        });

        info!(
            queue_capacity = cfg.queue_capacity,
            read_chunk_size = cfg.read_chunk_size,
            "notifier started"
        );

        Ok(Self {
            cfg,
            handle,
            registry,
            queue,
            cancel,
            reader: Mutex::new(Some(task)),
        })
    }

    /// Opens a notifier with the default configuration.
    ///
    /// # Errors
    /// See [`Notifier::open`].
    pub fn with_defaults() -> NotifyResult<Self> {
        Self::open(NotifierConfig::default())
    }

    /// The normalized configuration in effect.
    #[must_use]
    pub fn config(&self) -> &NotifierConfig {
        &self.cfg
    }

    /// Creates an unarmed subscription feeding this notifier's queue.
    #[must_use]
    pub fn watch(&self, path: impl Into<PathBuf>, mask: EventMask) -> Watch {
        let backend: Arc<dyn WatchBackend> = self.handle.clone();
        Watch::new(
            path,
            mask,
            backend,
            Arc::clone(&self.registry),
            Arc::clone(&self.queue),
        )
    }

    /// Creates and arms a subscription.
    ///
    /// # Errors
    /// Any error from [`Watch::arm`]; `HandleClosed` once the reader has
    /// stopped.
    pub fn add_watch(&self, path: impl Into<PathBuf>, mask: EventMask) -> NotifyResult<Watch> {
        let watch = self.watch(path, mask);
        watch.arm()?;
        Ok(watch)
    }

    /// Number of armed subscriptions.
    #[must_use]
    pub fn watch_count(&self) -> usize {
        self.registry.len()
    }

    /// Waits for the next event. `None` once closed and drained.
    pub async fn next(&self) -> Option<Event> {
        self.queue.next().await
    }

    /// Takes the next event if one is ready.
    #[must_use]
    pub fn try_next(&self) -> Option<Event> {
        self.queue.try_next()
    }

    /// Blocks the current thread until an event arrives or the queue ends.
    ///
    /// Must not be called from an async task.
    #[must_use]
    pub fn recv_blocking(&self) -> Option<Event> {
        self.queue.recv_blocking()
    }

    /// Blocking receive with a timeout.
    ///
    /// # Errors
    /// `Timeout` if nothing arrived in time.
    pub fn recv_timeout(&self, timeout: Duration) -> NotifyResult<Option<Event>> {
        self.queue.recv_timeout(timeout)
    }

    /// Every event until the notifier is closed and drained.
    pub fn stream(&self) -> impl Stream<Item = Event> + '_ {
        self.queue.stream()
    }

    /// Events dropped because the queue was full.
    #[must_use]
    pub fn dropped_events(&self) -> u64 {
        self.queue.dropped()
    }

    /// Whether the reader task has ended.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.reader.lock().as_ref().map_or(true, JoinHandle::is_finished)
    }

    /// Whether `close` has been called or the reader has ended.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.queue.is_closed()
    }

    /// Ends the event stream and asks the reader to stop.
    ///
    /// Already queued events stay retrievable. Idempotent.
    pub fn close(&self) {
        if self.queue.close() {
            debug!("notifier closed");
        }
        self.cancel.cancel();
    }

    /// Waits for the reader task to end without requesting it.
    ///
    /// # Errors
    /// - `Read` if the reader hit a fatal read error
    /// - `HandleClosed` if the outcome was already collected
    /// - `Internal` if the task panicked or was aborted
    pub async fn wait(&self) -> NotifyResult<ReaderExit> {
        let task = self.reader.lock().take().ok_or(NotifyError::HandleClosed)?;
        task.await
            .map_err(|e| NotifyError::internal(format!("reader task failed: {e}")))?
    }

    /// Closes the notifier and waits for the reader task to finish.
    ///
    /// # Errors
    /// See [`Notifier::wait`].
    pub async fn shutdown(&self) -> NotifyResult<ReaderExit> {
        self.close();
        self.wait().await
    }
}

impl Drop for Notifier {
    fn drop(&mut self) {
        // The task closes the handle once it observes cancellation.
        self.queue.close();
        self.cancel.cancel();
    }
}
