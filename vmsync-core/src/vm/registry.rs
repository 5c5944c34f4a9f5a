//! View-Model Registry
//!
//! The registry is the single owner of every live view-model instance in
//! the process. Controllers borrow an instance for the length of one
//! exchange through an [`EntryGuard`] and never keep it afterwards; every
//! access goes back through the registry by key.
//!
//! # Concurrency
//!
//! The key map is a `DashMap`, so inserts and removals are atomic per shard
//! and there is no global lock. Each [`Entry`] carries its own mutex, the
//! per-instance critical section. Resolve, update, push and evict for the
//! same key all take it, which is what keeps a push from diffing against a
//! half-applied update.
//!
//! Lock order is always "entry, then map shard". Nothing holds a map shard
//! while waiting on an entry.
//!
//! # Entry Lifecycle
//!
//! ```text
//!   Vacant ──construct──▶ Live ──evict/dispose──▶ Retired
//!      └────factory error──────────────────────────▲
//! ```
//!
//! A retired entry is already out of the map. Anyone still holding the
//! `Arc<Entry>` sees `lock()` return `None` and must treat the instance as
//! gone.

use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::{MappedMutexGuard, Mutex, MutexGuard};
use tokio::task::JoinHandle;

use super::{PushSignal, ViewModel, VmHandle};
use crate::config::SyncConfig;
use crate::error::{InstantiationError, SyncError, SyncResult};
use crate::ids::{ConnectionId, EntryKey};
use crate::state::{DirtyValues, Observer, Snapshot};

/// A live instance together with its observer and last-pushed baseline.
struct LiveVm {
    vm: Box<dyn ViewModel>,
    observer: Observer,
    baseline: Snapshot,
}

enum Slot {
    Vacant,
    Live(LiveVm),
    Retired,
}

/// Registry entry for one instance key.
pub struct Entry {
    key: EntryKey,
    type_name: String,
    slot: Mutex<Slot>,
    last_touched: Mutex<Instant>,
}

impl Entry {
    fn vacant(key: EntryKey, type_name: &str) -> Self {
        Self {
            key,
            type_name: type_name.to_owned(),
            slot: Mutex::new(Slot::Vacant),
            last_touched: Mutex::new(Instant::now()),
        }
    }

    pub fn key(&self) -> &EntryKey {
        &self.key
    }

    /// Type name the instance was requested as.
    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    /// Enter the entry's critical section.
    ///
    /// Returns `None` if the instance was disposed or never constructed.
    pub fn lock(&self) -> Option<EntryGuard<'_>> {
        MutexGuard::try_map(self.slot.lock(), |slot| match slot {
            Slot::Live(live) => Some(live),
            _ => None,
        })
        .ok()
        .map(|live| EntryGuard { live })
    }

    /// Reset the idle timer.
    pub fn touch(&self) {
        *self.last_touched.lock() = Instant::now();
    }

    /// Time of the last exchange.
    pub fn last_touched(&self) -> Instant {
        *self.last_touched.lock()
    }

    fn is_idle(&self, now: Instant, timeout: Duration) -> bool {
        now.saturating_duration_since(self.last_touched()) >= timeout
    }
}

impl std::fmt::Debug for Entry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Entry")
            .field("key", &self.key)
            .field("type_name", &self.type_name)
            .finish_non_exhaustive()
    }
}

/// Exclusive access to a live instance for the length of one exchange.
pub struct EntryGuard<'a> {
    live: MappedMutexGuard<'a, LiveVm>,
}

impl EntryGuard<'_> {
    pub fn vm(&self) -> &dyn ViewModel {
        &*self.live.vm
    }

    pub fn vm_mut(&mut self) -> &mut dyn ViewModel {
        &mut *self.live.vm
    }

    pub fn observer(&self) -> &Observer {
        &self.live.observer
    }

    /// State the client is known to hold.
    pub fn baseline(&self) -> &Snapshot {
        &self.live.baseline
    }

    pub fn set_baseline(&mut self, baseline: Snapshot) {
        self.live.baseline = baseline;
    }

    /// Full snapshot of the instance.
    pub fn snapshot(&self) -> Snapshot {
        self.live.observer.snapshot(&*self.live.vm)
    }

    /// Drain the instance's dirty set.
    pub fn take_dirty(&self) -> DirtyValues {
        self.live.observer.take_dirty(&*self.live.vm)
    }
}

/// Process-wide map of live view-model instances.
pub struct VmRegistry {
    entries: DashMap<EntryKey, Arc<Entry>>,
    idle_timeout: Duration,
}

impl VmRegistry {
    /// Create a registry that evicts entries idle for `idle_timeout`.
    pub fn new(idle_timeout: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            idle_timeout,
        }
    }

    pub fn from_config(config: &SyncConfig) -> Self {
        Self::new(config.idle_timeout())
    }

    pub fn idle_timeout(&self) -> Duration {
        self.idle_timeout
    }

    /// Return the live entry for `key`, constructing the instance with
    /// `factory` if there is none.
    ///
    /// Concurrent calls for the same unseen key construct exactly once: the
    /// first caller builds while holding the entry's lock, the others wait
    /// on that lock and then find the instance live.
    pub fn resolve<F>(
        &self,
        key: &EntryKey,
        type_name: &str,
        push: PushSignal,
        factory: F,
    ) -> Result<Arc<Entry>, InstantiationError>
    where
        F: FnOnce() -> Result<Box<dyn ViewModel>, InstantiationError>,
    {
        loop {
            // Clone the Arc out so the shard lock is released before we
            // wait on the entry.
            let entry = self
                .entries
                .entry(key.clone())
                .or_insert_with(|| Arc::new(Entry::vacant(key.clone(), type_name)))
                .clone();

            let mut slot = entry.slot.lock();

            // Evicted between lookup and lock. The map no longer holds it,
            // so the next lookup starts fresh.
            if matches!(*slot, Slot::Retired) {
                continue;
            }

            if matches!(*slot, Slot::Live(_)) {
                drop(slot);
                if entry.type_name != type_name {
                    tracing::warn!(
                        key = %key,
                        existing = %entry.type_name,
                        requested = type_name,
                        "instance already exists with another type"
                    );
                }
                entry.touch();
                return Ok(entry);
            }

            let built = panic::catch_unwind(AssertUnwindSafe(|| -> Result<LiveVm, InstantiationError> {
                let mut vm = factory()?;
                let observer = Observer::new(vm.properties());
                vm.attach(VmHandle::new(key.instance.clone(), observer.tracker(), push));
                Ok(LiveVm {
                    vm,
                    observer,
                    baseline: Snapshot::new(),
                })
            }))
            .unwrap_or_else(|_| Err(InstantiationError::Panicked(type_name.to_owned())));

            match built {
                Ok(live) => {
                    *slot = Slot::Live(live);
                    drop(slot);
                    entry.touch();
                    tracing::debug!(key = %key, type_name, "instance created");
                    return Ok(entry);
                }
                Err(err) => {
                    *slot = Slot::Retired;
                    self.entries.remove_if(key, |_, current| Arc::ptr_eq(current, &entry));
                    drop(slot);
                    tracing::error!(key = %key, type_name, error = %err, "instantiation failed");
                    return Err(err);
                }
            }
        }
    }

    /// Look up an entry without creating one.
    pub fn get(&self, key: &EntryKey) -> Option<Arc<Entry>> {
        self.entries.get(key).map(|entry| Arc::clone(entry.value()))
    }

    /// Look up an entry that the caller expects to exist.
    pub fn require(&self, key: &EntryKey) -> SyncResult<Arc<Entry>> {
        self.get(key).ok_or_else(|| SyncError::InstanceNotFound(key.clone()))
    }

    pub fn contains(&self, key: &EntryKey) -> bool {
        self.entries.contains_key(key)
    }

    /// Reset the idle timer of `key`. Returns false if there is no entry.
    pub fn touch(&self, key: &EntryKey) -> bool {
        match self.entries.get(key) {
            Some(entry) => {
                entry.touch();
                true
            }
            None => false,
        }
    }

    /// Remove `key` and dispose its instance.
    ///
    /// Blocks until any exchange in flight for the key has finished. The
    /// instance's dispose hook has run by the time this returns. Returns
    /// true iff a live instance was disposed.
    pub fn evict(&self, key: &EntryKey) -> bool {
        let Some((_, entry)) = self.entries.remove(key) else {
            return false;
        };
        let mut slot = entry.slot.lock();
        retire(&entry.key, &mut slot)
    }

    /// Evict every entry that belongs to `connection`.
    pub fn evict_connection(&self, connection: ConnectionId) -> usize {
        let keys: Vec<EntryKey> = self
            .entries
            .iter()
            .filter(|entry| entry.key().connection == connection)
            .map(|entry| entry.key().clone())
            .collect();

        keys.iter().filter(|key| self.evict(key)).count()
    }

    /// Evict every entry idle for at least the idle timeout as of `now`.
    ///
    /// Entries whose critical section is held are busy and skipped.
    pub fn sweep_idle(&self, now: Instant) -> usize {
        let candidates: Vec<Arc<Entry>> = self
            .entries
            .iter()
            .filter(|entry| entry.value().is_idle(now, self.idle_timeout))
            .map(|entry| Arc::clone(entry.value()))
            .collect();

        let mut evicted = 0;
        for entry in candidates {
            let Some(mut slot) = entry.slot.try_lock() else {
                continue;
            };
            // Touched while we were collecting.
            if !entry.is_idle(now, self.idle_timeout) {
                continue;
            }
            if self
                .entries
                .remove_if(&entry.key, |_, current| Arc::ptr_eq(current, &entry))
                .is_none()
            {
                continue;
            }
            if retire(&entry.key, &mut slot) {
                tracing::debug!(key = %entry.key, "evicted idle instance");
                evicted += 1;
            }
        }
        evicted
    }

    /// Run [`sweep_idle`](Self::sweep_idle) every `interval` until the
    /// registry is dropped.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let registry: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(registry) = registry.upgrade() else {
                    break;
                };
                let evicted = registry.sweep_idle(Instant::now());
                if evicted > 0 {
                    tracing::info!(evicted, remaining = registry.len(), "idle sweep");
                }
            }
        })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl std::fmt::Debug for VmRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VmRegistry")
            .field("entries", &self.entries.len())
            .field("idle_timeout", &self.idle_timeout)
            .finish()
    }
}

/// Retire a slot and run the instance's dispose hook.
fn retire(key: &EntryKey, slot: &mut Slot) -> bool {
    match std::mem::replace(slot, Slot::Retired) {
        Slot::Live(mut live) => {
            if panic::catch_unwind(AssertUnwindSafe(|| live.vm.dispose())).is_err() {
                tracing::error!(key = %key, "dispose hook panicked");
            }
            true
        }
        Slot::Vacant | Slot::Retired => false,
    }
}
