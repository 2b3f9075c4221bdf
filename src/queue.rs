//! Bounded, closeable event queue shared by all subscriptions of a notifier.
//!
//! The producer is the single reader loop and must never stall on a slow
//! consumer: `push` uses a non-blocking `try_send` and drops (and counts) the
//! event when the queue is full. Closing drops the sender, so consumers drain
//! what is left and then observe end-of-stream.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TryRecvError, TrySendError};
use futures::Stream;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::warn;

use crate::error::{NotifyError, NotifyResult};
use crate::event::Event;

/// What happened to a pushed event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    /// The event is waiting for a consumer.
    Queued,
    /// The queue was full; the drop counter was incremented.
    Dropped,
    /// The queue was closed; the event was discarded without counting.
    Closed,
}

/// Bounded multi-producer queue of `Event`s with drop-when-full semantics.
#[derive(Debug)]
pub struct EventQueue {
    capacity: usize,
    tx: Mutex<Option<Sender<Event>>>,
    rx: Receiver<Event>,
    notify: Notify,
    dropped: AtomicU64,
}

impl EventQueue {
    /// Creates a queue holding at most `capacity` events (minimum 1).
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (tx, rx) = bounded(capacity);
        Self {
            capacity,
            tx: Mutex::new(Some(tx)),
            rx,
            notify: Notify::new(),
            dropped: AtomicU64::new(0),
        }
    }

    /// Non-blocking enqueue.
    pub fn push(&self, event: Event) -> PushOutcome {
        let outcome = {
            let tx = self.tx.lock();
            let Some(tx) = tx.as_ref() else {
                return PushOutcome::Closed;
            };
            match tx.try_send(event) {
                Ok(()) => PushOutcome::Queued,
                Err(TrySendError::Full(_)) => PushOutcome::Dropped,
                Err(TrySendError::Disconnected(_)) => PushOutcome::Closed,
            }
        };

        match outcome {
            PushOutcome::Queued => self.notify.notify_waiters(),
            PushOutcome::Dropped => {
                let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                if total.is_power_of_two() {
                    warn!(dropped = total, capacity = self.capacity, "event queue full, dropping events");
                }
            }
            PushOutcome::Closed => {}
        }
        outcome
    }

    /// Marks the queue closed and wakes every pending consumer.
    ///
    /// Already queued events stay retrievable. Returns true if this call
    /// closed the queue.
    pub fn close(&self) -> bool {
        let closed = self.tx.lock().take().is_some();
        self.notify.notify_waiters();
        closed
    }

    /// Whether `close` has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.tx.lock().is_none()
    }

    /// Number of events dropped because the queue was full.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Maximum number of queued events.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of events waiting.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    /// Whether no event is waiting.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    /// Takes the next event if one is ready.
    #[must_use]
    pub fn try_next(&self) -> Option<Event> {
        self.rx.try_recv().ok()
    }

    /// Waits for the next event.
    ///
    /// Returns `None` once the queue is closed and drained.
    pub async fn next(&self) -> Option<Event> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.rx.try_recv() {
                Ok(event) => return Some(event),
                Err(TryRecvError::Disconnected) => return None,
                Err(TryRecvError::Empty) => notified.await,
            }
        }
    }

    /// Receive the next event (blocking the current thread).
    ///
    /// Returns `None` once the queue is closed and drained.
    #[must_use]
    pub fn recv_blocking(&self) -> Option<Event> {
        self.rx.recv().ok()
    }

    /// Receive the next event with a timeout.
    ///
    /// Returns `Ok(None)` once the queue is closed and drained.
    ///
    /// # Errors
    /// `NotifyError::Timeout` if nothing arrived in time.
    pub fn recv_timeout(&self, timeout: Duration) -> NotifyResult<Option<Event>> {
        match self.rx.recv_timeout(timeout) {
            Ok(event) => Ok(Some(event)),
            Err(RecvTimeoutError::Disconnected) => Ok(None),
            Err(RecvTimeoutError::Timeout) => Err(NotifyError::Timeout {
                duration_ms: timeout.as_millis().min(u128::from(u64::MAX)) as u64,
            }),
        }
    }

    /// The queue as a finite async stream.
    pub fn stream(&self) -> impl Stream<Item = Event> + '_ {
        futures::stream::unfold(self, |queue| async move {
            queue.next().await.map(|event| (event, queue))
        })
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::sync::Arc;

    use futures::StreamExt;

    use super::*;
    use crate::mask::EventMask;

    fn ev(i: u32) -> Event {
        Event {
            path: PathBuf::from(format!("/w/{i}")),
            cookie: i,
            mask: EventMask::CREATE,
        }
    }

    #[test]
    fn overflow_drops_exactly_one_and_keeps_order() {
        let queue = EventQueue::new(3);
        for i in 0..3 {
            assert_eq!(queue.push(ev(i)), PushOutcome::Queued);
        }
        assert_eq!(queue.push(ev(3)), PushOutcome::Dropped);
        assert_eq!(queue.dropped(), 1);

        let got: Vec<u32> = std::iter::from_fn(|| queue.try_next()).map(|e| e.cookie).collect();
        assert_eq!(got, vec![0, 1, 2]);
    }

    #[test]
    fn push_after_close_is_discarded_without_counting() {
        let queue = EventQueue::new(4);
        assert!(queue.close());
        assert!(!queue.close());
        assert_eq!(queue.push(ev(0)), PushOutcome::Closed);
        assert_eq!(queue.dropped(), 0);
        assert!(queue.is_empty());
    }

    #[test]
    fn zero_capacity_is_clamped() {
        let queue = EventQueue::new(0);
        assert_eq!(queue.capacity(), 1);
        assert_eq!(queue.push(ev(0)), PushOutcome::Queued);
        assert_eq!(queue.push(ev(1)), PushOutcome::Dropped);
    }

    #[test]
    fn blocking_consumer_drains_then_sees_end() {
        let queue = EventQueue::new(4);
        queue.push(ev(7));
        queue.close();
        assert_eq!(queue.recv_blocking().map(|e| e.cookie), Some(7));
        assert_eq!(queue.recv_blocking(), None);
    }

    #[test]
    fn recv_timeout_reports_timeout() {
        let queue = EventQueue::new(4);
        let err = queue.recv_timeout(Duration::from_millis(10)).unwrap_err();
        assert!(matches!(err, NotifyError::Timeout { duration_ms: 10 }));

        queue.close();
        assert!(queue.recv_timeout(Duration::from_millis(10)).unwrap().is_none());
    }

    #[tokio::test]
    async fn next_wakes_on_push() {
        let queue = Arc::new(EventQueue::new(4));
        let consumer = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.next().await })
        };
        tokio::task::yield_now().await;
        queue.push(ev(5));
        let got = consumer.await.unwrap();
        assert_eq!(got.map(|e| e.cookie), Some(5));
    }

    #[tokio::test]
    async fn next_wakes_on_close() {
        let queue = Arc::new(EventQueue::new(4));
        let consumer = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.next().await })
        };
        tokio::task::yield_now().await;
        queue.close();
        assert_eq!(consumer.await.unwrap(), None);
    }

    #[tokio::test]
    async fn stream_is_finite() {
        let queue = EventQueue::new(8);
        for i in 0..3 {
            queue.push(ev(i));
        }
        queue.close();
        let cookies: Vec<u32> = queue.stream().map(|e| e.cookie).collect().await;
        assert_eq!(cookies, vec![0, 1, 2]);
    }
}
