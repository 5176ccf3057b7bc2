use parking_lot::Mutex;
use parking_lot::RwLock;
use parking_lot::RwLockReadGuard;
use parking_lot::RwLockWriteGuard;
use std::fmt::Debug;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::warn;

/// Shared handle of a cached value. Whoever holds one may mutate the value in place; doing so through
/// [`CacheEntry::write`] or [`CacheEntry::modify`] marks the entry dirty.
pub type EntryRef<V> = Arc<CacheEntry<V>>;

/// A cached value with the metadata its container needs to decide when to persist and when to evict it.
///
/// - `dirty` is raised by any write and cleared only by a save pass.
/// - `locked` pins the entry in memory no matter how stale or clean it is.
/// - `last_access` is refreshed by container reads, not by plain writes.
/// - `detached` marks an entry its container has already evicted.
/// - `in_flight` counts save passes that took the value and haven't heard back from the store yet. Such an entry is
///   never evicted.
pub struct CacheEntry<V> {
    value:       RwLock<V>,
    dirty:       AtomicBool,
    locked:      AtomicBool,
    detached:    AtomicBool,
    in_flight:   AtomicUsize,
    last_access: Mutex<Instant>,
}

impl<V> CacheEntry<V> {
    pub fn new(value: V, dirty: bool) -> Self {
        Self {
            value:       RwLock::new(value),
            dirty:       AtomicBool::new(dirty),
            locked:      AtomicBool::new(false),
            detached:    AtomicBool::new(false),
            in_flight:   AtomicUsize::new(0),
            last_access: Mutex::new(Instant::now()),
        }
    }

    /// Freshly created in-memory value, not yet known to the store.
    pub fn new_dirty(value: V) -> EntryRef<V> {
        Arc::new(Self::new(value, true))
    }

    /// Value that came from the store.
    pub fn new_clean(value: V) -> EntryRef<V> {
        Arc::new(Self::new(value, false))
    }

    #[inline]
    pub fn read(&self) -> RwLockReadGuard<'_, V> {
        self.value.read()
    }

    /// Write access to the value. The entry is marked dirty before the guard is handed out so a concurrent save
    /// pass can never clear the flag for a write it hasn't seen yet.
    pub fn write(&self) -> RwLockWriteGuard<'_, V> {
        self.mark_dirty();
        self.value.write()
    }

    pub fn modify<R>(&self, f: impl FnOnce(&mut V) -> R) -> R {
        f(&mut *self.write())
    }

    #[inline]
    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    pub fn mark_dirty(&self) {
        if self.is_detached() {
            warn!("Write to an evicted cache entry will not reach the store");
        }
        self.dirty.store(true, Ordering::Release);
    }

    /// Clears the dirty flag, returning its previous state.
    #[inline]
    pub(crate) fn take_dirty(&self) -> bool {
        self.dirty.swap(false, Ordering::AcqRel)
    }

    #[inline]
    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Acquire)
    }

    #[inline]
    pub fn lock(&self) {
        self.locked.store(true, Ordering::Release);
    }

    #[inline]
    pub fn unlock(&self) {
        self.locked.store(false, Ordering::Release);
    }

    #[inline]
    pub fn is_detached(&self) -> bool {
        self.detached.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn detach(&self) {
        self.detached.store(true, Ordering::Release);
    }

    #[inline]
    pub(crate) fn reattach(&self) {
        self.detached.store(false, Ordering::Release);
    }

    #[inline]
    pub fn is_in_flight(&self) -> bool {
        self.in_flight.load(Ordering::Acquire) > 0
    }

    /// Clear the dirty flag on behalf of a save pass. The entry stays pinned until the returned handle is dropped.
    pub(crate) fn begin_save(entry: &EntryRef<V>) -> Option<InFlight<V>> {
        // Pinned before the flag is cleared: a flush never sees the entry clean and unpinned in between.
        entry.in_flight.fetch_add(1, Ordering::AcqRel);
        if entry.take_dirty() {
            Some(InFlight {
                entry:     entry.clone(),
                confirmed: false,
            })
        }
        else {
            entry.in_flight.fetch_sub(1, Ordering::AcqRel);
            None
        }
    }

    #[inline]
    pub fn touch(&self) {
        *self.last_access.lock() = Instant::now();
    }

    #[inline]
    pub fn last_access(&self) -> Instant {
        *self.last_access.lock()
    }

    /// An entry is stale when it is clean and hasn't been read for longer than `threshold`.
    pub fn is_stale(&self, threshold: Duration) -> bool {
        !self.is_dirty() && self.last_access().elapsed() > threshold
    }

    /// Whether a flush is allowed to evict this entry.
    pub(crate) fn is_evictable(&self, aggressive: bool, threshold: Duration) -> bool {
        // Dirty is checked before in-flight, the reverse of the order `begin_save` changes them in.
        !self.is_locked()
            && !self.is_dirty()
            && !self.is_in_flight()
            && (aggressive || self.last_access().elapsed() > threshold)
    }
}

/// A value a save pass took out of its entry and handed to the store. Until the handle is gone the entry can't be
/// evicted. Dropping the handle without calling [`confirm`](Self::confirm) marks the entry dirty again, so a store
/// failure or a cancelled save pass leaves the value for the next one.
pub struct InFlight<V> {
    entry:     EntryRef<V>,
    confirmed: bool,
}

impl<V> InFlight<V> {
    #[inline]
    pub fn entry(&self) -> &EntryRef<V> {
        &self.entry
    }

    #[inline]
    pub fn read(&self) -> RwLockReadGuard<'_, V> {
        self.entry.read()
    }

    /// The store has the value.
    pub fn confirm(mut self) {
        self.confirmed = true;
    }
}

impl<V> Drop for InFlight<V> {
    fn drop(&mut self) {
        if !self.confirmed {
            self.entry.dirty.store(true, Ordering::Release);
        }
        self.entry.in_flight.fetch_sub(1, Ordering::AcqRel);
    }
}

impl<V: Debug> Debug for InFlight<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InFlight")
            .field("entry", &self.entry)
            .field("confirmed", &self.confirmed)
            .finish()
    }
}

impl<V: Clone> CacheEntry<V> {
    /// A copy of the current value.
    pub fn snapshot(&self) -> V {
        self.value.read().clone()
    }
}

impl<V: Debug> Debug for CacheEntry<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheEntry")
            .field("value", &*self.value.read())
            .field("dirty", &self.is_dirty())
            .field("locked", &self.is_locked())
            .field("detached", &self.is_detached())
            .field("in_flight", &self.is_in_flight())
            .finish()
    }
}
