//! Per-path watch subscriptions.
//!
//! A `Watch` moves through `Unarmed → Armed → Closed`:
//! - `arm` validates the mask, asks the backend for a watch and registers the
//!   subscription under the returned descriptor.
//! - While armed, every record routed to it becomes an `Event` on the shared
//!   queue. A record carrying `IGNORED` is forwarded and then closes the
//!   subscription; the kernel has already discarded the watch.
//! - `close` (or dropping the `Watch`) unregisters and removes the kernel
//!   watch, tolerating a removal failure caused by a racing invalidation.
//!
//! The state lock is always taken before the registry lock.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::codec::{RawEvent, WatchId};
use crate::error::{NotifyError, NotifyResult, RegistryError};
use crate::event::Event;
use crate::mask::EventMask;
use crate::queue::EventQueue;
use crate::registry::{DispatchTarget, WatchRegistry};
use crate::sys::WatchBackend;

/// Lifecycle of a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchState {
    /// Created, not yet registered with the kernel.
    Unarmed,
    /// Registered under a live descriptor.
    Armed(WatchId),
    /// Terminal.
    Closed,
}

#[derive(Debug)]
struct WatchShared {
    path: PathBuf,
    mask: EventMask,
    state: Mutex<WatchState>,
    backend: Arc<dyn WatchBackend>,
    registry: Arc<WatchRegistry>,
    sink: Arc<EventQueue>,
}

impl WatchShared {
    fn wants(&self, raw: &RawEvent) -> bool {
        raw.mask.intersects(self.mask | EventMask::ALWAYS_DELIVERED)
    }
}

impl DispatchTarget for WatchShared {
    fn dispatch(&self, raw: &RawEvent) -> NotifyResult<()> {
        let mut state = self.state.lock();
        let WatchState::Armed(id) = *state else {
            return Err(NotifyError::SubscriptionClosed {
                path: self.path.clone(),
            });
        };

        if self.wants(raw) {
            let event = Event::from_raw(&self.path, raw);
            trace!(%id, %event, "dispatch");
            self.sink.push(event);
        }

        if raw.mask.is_ignored() {
            *state = WatchState::Closed;
            self.registry.unregister(id);
            debug!(%id, path = %self.path.display(), "watch invalidated by kernel");
        }
        Ok(())
    }

    fn detach(&self) {
        let mut state = self.state.lock();
        if *state != WatchState::Closed {
            debug!(path = %self.path.display(), "watch detached from closed handle");
            *state = WatchState::Closed;
        }
    }
}

/// One caller's interest in one path.
///
/// Owned by the caller; dropping it closes the subscription.
#[derive(Debug)]
pub struct Watch {
    shared: Arc<WatchShared>,
}

impl Watch {
    /// Creates an unarmed subscription.
    #[must_use]
    pub fn new(
        path: impl Into<PathBuf>,
        mask: EventMask,
        backend: Arc<dyn WatchBackend>,
        registry: Arc<WatchRegistry>,
        sink: Arc<EventQueue>,
    ) -> Self {
        Self {
            shared: Arc::new(WatchShared {
                path: path.into(),
                mask,
                state: Mutex::new(WatchState::Unarmed),
                backend,
                registry,
                sink,
            }),
        }
    }

    /// The watched path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.shared.path
    }

    /// The requested interest mask.
    #[must_use]
    pub fn mask(&self) -> EventMask {
        self.shared.mask
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> WatchState {
        *self.shared.state.lock()
    }

    /// The live descriptor, while armed.
    #[must_use]
    pub fn watch_id(&self) -> Option<WatchId> {
        match self.state() {
            WatchState::Armed(id) => Some(id),
            _ => None,
        }
    }

    /// Whether the subscription holds a live descriptor.
    #[must_use]
    pub fn is_armed(&self) -> bool {
        matches!(self.state(), WatchState::Armed(_))
    }

    /// Whether the subscription reached its terminal state.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state() == WatchState::Closed
    }

    /// Registers the watch with the kernel and the registry.
    ///
    /// On failure the subscription stays `Unarmed`.
    ///
    /// # Errors
    /// - `EmptyMask` / `InvalidArgument` for an unusable mask
    /// - `ArmedAlready` if already armed
    /// - `SubscriptionClosed` if already closed
    /// - `Path` if the kernel refused the path
    /// - `Registry(AlreadyRegistered)` if another live subscription on this
    ///   notifier already watches the same path. The kernel watch has already
    ///   been widened with this mask by then and stays widened; the other
    ///   subscription filters out the extra bits.
    /// - `HandleClosed` if the reader loop has already shut down; the new
    ///   kernel watch is removed again
    pub fn arm(&self) -> NotifyResult<WatchId> {
        let shared = &self.shared;
        let mut state = shared.state.lock();
        match *state {
            WatchState::Unarmed => {}
            WatchState::Armed(_) => {
                return Err(NotifyError::ArmedAlready {
                    path: shared.path.clone(),
                })
            }
            WatchState::Closed => {
                return Err(NotifyError::SubscriptionClosed {
                    path: shared.path.clone(),
                })
            }
        }

        shared.mask.interest()?;
        let id = shared.backend.add_watch(&shared.path, shared.mask)?;

        let weak: Weak<WatchShared> = Arc::downgrade(shared);
        match shared.registry.register(id, weak) {
            Ok(()) => {}
            Err(RegistryError::Closed) => {
                if let Err(err) = shared.backend.remove_watch(id) {
                    debug!(%id, error = %err, "could not remove watch armed after shutdown");
                }
                return Err(NotifyError::HandleClosed);
            }
            // AlreadyRegistered: the descriptor belongs to another live
            // subscription, so it is not removed here.
            Err(err) => return Err(err.into()),
        }

        *state = WatchState::Armed(id);
        debug!(%id, path = %shared.path.display(), mask = %shared.mask, "watch armed");
        Ok(id)
    }

    /// Closes the subscription. Idempotent.
    ///
    /// A removal failure is logged and swallowed: the kernel may already
    /// have discarded the watch.
    pub fn close(&self) {
        let shared = &self.shared;
        let mut state = shared.state.lock();
        let previous = std::mem::replace(&mut *state, WatchState::Closed);
        let WatchState::Armed(id) = previous else {
            return;
        };

        shared.registry.unregister(id);
        match shared.backend.remove_watch(id) {
            Ok(()) => debug!(%id, path = %shared.path.display(), "watch closed"),
            Err(err) => debug!(%id, error = %err, "watch already gone at close"),
        }
    }

    /// The subscription as a registry target.
    #[must_use]
    pub fn as_target(&self) -> Arc<dyn DispatchTarget> {
        let target: Arc<WatchShared> = Arc::clone(&self.shared);
        target
    }
}

impl Drop for Watch {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::io;
    use std::sync::atomic::{AtomicI32, Ordering};
    use std::sync::Barrier;
    use std::thread;

    use super::*;

    /// In-memory backend that behaves like the kernel for add/remove.
    #[derive(Debug, Default)]
    struct FakeBackend {
        next: AtomicI32,
        live: Mutex<HashMap<PathBuf, WatchId>>,
        removed: Mutex<Vec<WatchId>>,
        remove_calls: Mutex<Vec<WatchId>>,
    }

    impl FakeBackend {
        /// Simulates kernel-side invalidation.
        fn forget(&self, id: WatchId) {
            self.live.lock().retain(|_, v| *v != id);
        }
    }

    impl WatchBackend for FakeBackend {
        fn add_watch(&self, path: &Path, mask: EventMask) -> NotifyResult<WatchId> {
            if mask.is_empty() {
                return Err(NotifyError::invalid_argument("zero mask"));
            }
            if path.as_os_str().is_empty() {
                return Err(NotifyError::Path {
                    path: path.to_path_buf(),
                    source: io::Error::from_raw_os_error(libc::ENOENT),
                });
            }
            let mut live = self.live.lock();
            let id = *live
                .entry(path.to_path_buf())
                .or_insert_with(|| WatchId(self.next.fetch_add(1, Ordering::SeqCst) + 1));
            Ok(id)
        }

        fn remove_watch(&self, id: WatchId) -> NotifyResult<()> {
            self.remove_calls.lock().push(id);
            let mut live = self.live.lock();
            let before = live.len();
            live.retain(|_, v| *v != id);
            if live.len() == before {
                return Err(NotifyError::Watch {
                    id,
                    source: io::Error::from_raw_os_error(libc::EINVAL),
                });
            }
            self.removed.lock().push(id);
            Ok(())
        }
    }

    struct Fixture {
        backend: Arc<FakeBackend>,
        registry: Arc<WatchRegistry>,
        queue: Arc<EventQueue>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                backend: Arc::new(FakeBackend::default()),
                registry: Arc::new(WatchRegistry::new()),
                queue: Arc::new(EventQueue::new(16)),
            }
        }

        fn watch(&self, path: &str, mask: EventMask) -> Watch {
            let backend: Arc<dyn WatchBackend> = self.backend.clone();
            Watch::new(path, mask, backend, Arc::clone(&self.registry), Arc::clone(&self.queue))
        }

        fn route(&self, raw: &RawEvent) -> NotifyResult<()> {
            self.registry.lookup(raw.watch_id)?.dispatch(raw)
        }
    }

    fn raw(id: WatchId, mask: EventMask, name: Option<&str>) -> RawEvent {
        RawEvent {
            watch_id: id,
            mask,
            cookie: 0,
            name: name.map(PathBuf::from),
        }
    }

    #[test]
    fn arm_registers_and_forwards_events() {
        let fx = Fixture::new();
        let watch = fx.watch("/tmp/x", EventMask::CREATE | EventMask::DELETE);
        let id = watch.arm().unwrap();
        assert_eq!(watch.state(), WatchState::Armed(id));
        assert!(fx.registry.contains(id));

        fx.route(&raw(id, EventMask::CREATE, Some("a"))).unwrap();
        let ev = fx.queue.try_next().unwrap();
        assert_eq!(ev.path, PathBuf::from("/tmp/x/a"));
        assert_eq!(ev.mask, EventMask::CREATE);
    }

    #[test]
    fn arm_rejects_empty_mask_and_stays_unarmed() {
        let fx = Fixture::new();
        let watch = fx.watch("/tmp/x", EventMask::empty());
        assert!(matches!(watch.arm(), Err(NotifyError::EmptyMask)));
        assert_eq!(watch.state(), WatchState::Unarmed);
        assert!(fx.registry.is_empty());
    }

    #[test]
    fn arm_failure_stays_unarmed() {
        let fx = Fixture::new();
        let watch = fx.watch("", EventMask::CREATE);
        let err = watch.arm().unwrap_err();
        assert!(matches!(err, NotifyError::Path { .. }));
        assert_eq!(watch.state(), WatchState::Unarmed);
    }

    #[test]
    fn double_arm_is_an_error() {
        let fx = Fixture::new();
        let watch = fx.watch("/tmp/x", EventMask::CREATE);
        watch.arm().unwrap();
        assert!(matches!(watch.arm(), Err(NotifyError::ArmedAlready { .. })));
    }

    #[test]
    fn second_watch_on_same_path_is_rejected_without_harming_first() {
        let fx = Fixture::new();
        let first = fx.watch("/tmp/x", EventMask::CREATE);
        let id = first.arm().unwrap();

        let second = fx.watch("/tmp/x", EventMask::DELETE);
        let err = second.arm().unwrap_err();
        assert!(matches!(err, NotifyError::Registry(_)));
        assert_eq!(second.state(), WatchState::Unarmed);
        drop(second);

        assert_eq!(first.state(), WatchState::Armed(id));
        assert!(fx.registry.contains(id));
        assert!(fx.backend.removed.lock().is_empty());
    }

    #[test]
    fn close_unregisters_and_removes_once() {
        let fx = Fixture::new();
        let watch = fx.watch("/tmp/x", EventMask::CREATE);
        let id = watch.arm().unwrap();

        watch.close();
        watch.close();
        assert!(watch.is_closed());
        assert!(!fx.registry.contains(id));
        assert_eq!(*fx.backend.removed.lock(), vec![id]);
        assert!(matches!(watch.arm(), Err(NotifyError::SubscriptionClosed { .. })));
    }

    #[test]
    fn drop_closes() {
        let fx = Fixture::new();
        let id = {
            let watch = fx.watch("/tmp/x", EventMask::CREATE);
            watch.arm().unwrap()
        };
        assert!(!fx.registry.contains(id));
        assert_eq!(*fx.backend.removed.lock(), vec![id]);
    }

    #[test]
    fn ignored_forwards_then_closes_without_remove() {
        let fx = Fixture::new();
        let watch = fx.watch("/tmp/x", EventMask::DELETE_SELF);
        let id = watch.arm().unwrap();

        fx.route(&raw(id, EventMask::DELETE_SELF, None)).unwrap();
        fx.backend.forget(id);
        fx.route(&raw(id, EventMask::IGNORED, None)).unwrap();

        assert!(watch.is_closed());
        assert_eq!(watch.watch_id(), None);
        assert!(!fx.registry.contains(id));

        let first = fx.queue.try_next().unwrap();
        assert!(first.mask.is_delete_self());
        let second = fx.queue.try_next().unwrap();
        assert!(second.is_ignored());
        assert_eq!(second.path, PathBuf::from("/tmp/x"));

        // Explicit close after invalidation is a no-op: no removal attempted.
        watch.close();
        assert!(fx.backend.removed.lock().is_empty());
    }

    #[test]
    fn close_tolerates_racing_invalidation() {
        let fx = Fixture::new();
        let watch = fx.watch("/tmp/x", EventMask::CREATE);
        let id = watch.arm().unwrap();

        // Kernel dropped the watch but the IGNORED record has not been read yet.
        fx.backend.forget(id);
        watch.close();
        assert!(watch.is_closed());
        assert!(!fx.registry.contains(id));

        // The late record is now an orphan.
        assert!(fx.route(&raw(id, EventMask::IGNORED, None)).is_err());
    }

    #[test]
    fn dispatch_into_closed_subscription_is_rejected() {
        let fx = Fixture::new();
        let watch = fx.watch("/tmp/x", EventMask::CREATE);
        let id = watch.arm().unwrap();
        let target = watch.as_target();
        watch.close();

        let err = target.dispatch(&raw(id, EventMask::CREATE, Some("late"))).unwrap_err();
        assert!(matches!(err, NotifyError::SubscriptionClosed { .. }));
        assert!(fx.queue.is_empty());
    }

    #[test]
    fn unrequested_bits_are_filtered() {
        let fx = Fixture::new();
        let watch = fx.watch("/tmp/x", EventMask::CREATE);
        let id = watch.arm().unwrap();

        fx.route(&raw(id, EventMask::MODIFY, Some("f"))).unwrap();
        assert!(fx.queue.is_empty());

        fx.route(&raw(id, EventMask::CREATE | EventMask::ISDIR, Some("d"))).unwrap();
        assert!(fx.queue.try_next().unwrap().is_dir());
    }

    #[test]
    fn detach_closes_without_kernel_calls() {
        let fx = Fixture::new();
        let watch = fx.watch("/tmp/x", EventMask::CREATE);
        watch.arm().unwrap();

        for target in fx.registry.drain() {
            target.detach();
        }
        assert!(watch.is_closed());
        watch.close();
        assert!(fx.backend.removed.lock().is_empty());
    }

    #[test]
    fn arm_after_reader_shutdown_is_refused_and_cleaned_up() {
        let fx = Fixture::new();
        let early = fx.watch("/tmp/early", EventMask::CREATE);
        early.arm().unwrap();

        // What the reader loop does on exit.
        fx.queue.close();
        for target in fx.registry.drain() {
            target.detach();
        }
        assert!(early.is_closed());

        let late = fx.watch("/tmp/late", EventMask::CREATE);
        let err = late.arm().unwrap_err();
        assert!(matches!(err, NotifyError::HandleClosed));
        assert_eq!(late.state(), WatchState::Unarmed);
        assert!(fx.registry.is_empty());

        // The descriptor obtained for the late watch was handed back.
        assert_eq!(fx.backend.removed.lock().len(), 1);
        assert!(fx.backend.live.lock().get(Path::new("/tmp/late")).is_none());
    }

    #[test]
    fn close_racing_invalidation_never_leaks_or_removes_twice() {
        for _ in 0..200 {
            let fx = Fixture::new();
            let watch = fx.watch("/tmp/race", EventMask::DELETE_SELF);
            let id = watch.arm().unwrap();

            // The kernel has discarded the watch; its IGNORED record is in flight.
            fx.backend.forget(id);

            let barrier = Arc::new(Barrier::new(2));
            let reader = {
                let registry = Arc::clone(&fx.registry);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    if let Ok(target) = registry.lookup(id) {
                        let _ = target.dispatch(&raw(id, EventMask::IGNORED, None));
                    }
                })
            };

            barrier.wait();
            watch.close();
            reader.join().unwrap();

            assert!(watch.is_closed());
            assert!(fx.registry.is_empty());
            assert!(fx.backend.removed.lock().is_empty());

            let calls = fx.backend.remove_calls.lock().len();
            assert!(calls <= 1);
            let saw_ignored = std::iter::from_fn(|| fx.queue.try_next()).any(|ev| ev.is_ignored());
            if saw_ignored {
                // Invalidation was observed first: close must not touch the kernel.
                assert_eq!(calls, 0);
            } else {
                assert_eq!(calls, 1);
            }
        }
    }
}
