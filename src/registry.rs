//! Watch registry: the live `WatchId` → subscription table.
//!
//! Mutated by subscriptions as they arm and close; read by the single reader
//! loop on every dispatched record. One coarse lock guards the map. Hold
//! times are single map operations; targets are cloned out before dispatch
//! so no subscription code ever runs under the lock.
//!
//! Draining the table closes it: the reader loop drains on exit, and no
//! subscription may register afterwards.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::debug;

use crate::codec::{RawEvent, WatchId};
use crate::error::{NotifyResult, RegistryError};

/// Something the reader loop can route a raw record to.
pub trait DispatchTarget: Send + Sync {
    /// Delivers one record.
    ///
    /// # Errors
    /// `SubscriptionClosed` if the target closed before the record arrived.
    fn dispatch(&self, event: &RawEvent) -> NotifyResult<()>;

    /// Marks the target closed because the kernel handle went away.
    ///
    /// Issues no kernel calls.
    fn detach(&self);
}

#[derive(Default)]
struct Table {
    entries: HashMap<WatchId, Weak<dyn DispatchTarget>>,
    closed: bool,
}

/// Non-owning map from watch descriptor to dispatch target.
#[derive(Default)]
pub struct WatchRegistry {
    table: Mutex<Table>,
}

impl WatchRegistry {
    /// Creates an empty, open registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a mapping.
    ///
    /// A leftover entry whose target has already been dropped is replaced.
    ///
    /// # Errors
    /// - `Closed` once the registry has been drained
    /// - `AlreadyRegistered` if a live target holds `id`
    pub fn register(&self, id: WatchId, target: Weak<dyn DispatchTarget>) -> Result<(), RegistryError> {
        let mut guard = self.table.lock();
        if guard.closed {
            return Err(RegistryError::Closed);
        }
        let table = &mut guard.entries;
        if let Some(existing) = table.get(&id) {
            if existing.strong_count() > 0 {
                return Err(RegistryError::AlreadyRegistered { id });
            }
            debug!(%id, "replacing stale registry entry");
        }
        table.insert(id, target);
        Ok(())
    }

    /// Finds the target for `id`.
    ///
    /// # Errors
    /// `NotFound` if nothing live is registered under `id`. This is expected
    /// for records that race an unregister.
    pub fn lookup(&self, id: WatchId) -> Result<Arc<dyn DispatchTarget>, RegistryError> {
        let mut guard = self.table.lock();
        let table = &mut guard.entries;
        let Some(weak) = table.get(&id) else {
            return Err(RegistryError::NotFound { id });
        };
        match weak.upgrade() {
            Some(target) => Ok(target),
            None => {
                table.remove(&id);
                Err(RegistryError::NotFound { id })
            }
        }
    }

    /// Removes the mapping for `id`. Tolerates `id` being absent.
    ///
    /// Returns true if an entry was removed.
    pub fn unregister(&self, id: WatchId) -> bool {
        self.table.lock().entries.remove(&id).is_some()
    }

    /// Whether `id` has an entry, live or not.
    #[must_use]
    pub fn contains(&self, id: WatchId) -> bool {
        self.table.lock().entries.contains_key(&id)
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.table.lock().entries.len()
    }

    /// Whether the table has no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.table.lock().entries.is_empty()
    }

    /// Whether `drain` has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.table.lock().closed
    }

    /// Currently registered descriptors, sorted.
    #[must_use]
    pub fn ids(&self) -> Vec<WatchId> {
        let mut ids: Vec<WatchId> = self.table.lock().entries.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Closes the table, empties it and returns every target that is still
    /// alive. Later `register` calls fail with `Closed`.
    pub fn drain(&self) -> Vec<Arc<dyn DispatchTarget>> {
        let drained: Vec<_> = {
            let mut guard = self.table.lock();
            guard.closed = true;
            guard.entries.drain().map(|(_, weak)| weak).collect()
        };
        drained.iter().filter_map(Weak::upgrade).collect()
    }
}

impl fmt::Debug for WatchRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WatchRegistry")
            .field("ids", &self.ids())
            .field("closed", &self.is_closed())
            .finish()
    }
}
