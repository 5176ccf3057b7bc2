use crate::entry::CacheEntry;
use crate::entry::EntryRef;
use crate::entry::InFlight;
use crate::types::CacheStats;
use moka::ops::compute::Op;
use moka::sync::Cache;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt::Debug;
use std::future::Future;
use std::hash::Hash;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use tracing::error;
use tracing::warn;

// Everything the cache knows about a single key. The `loaded` marker tells whether the store's values for the key
// have already been merged in; `locked` pins the whole key.
struct Slot<V> {
    values: Mutex<Vec<EntryRef<V>>>,
    loaded: AtomicBool,
    locked: AtomicBool,
}

impl<V> Default for Slot<V> {
    fn default() -> Self {
        Self {
            values: Mutex::new(Vec::new()),
            loaded: AtomicBool::new(false),
            locked: AtomicBool::new(false),
        }
    }
}

impl<V: PartialEq + Clone> Slot<V> {
    fn is_loaded(&self) -> bool {
        self.loaded.load(Ordering::Acquire)
    }

    fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Acquire)
    }

    // Append what isn't there yet. Values already present keep their entries and flags.
    fn merge(&self, loaded: Vec<V>) -> usize {
        let mut values = self.values.lock();
        let mut merged = 0;
        for value in loaded {
            if !values.iter().any(|entry| *entry.read() == value) {
                values.push(CacheEntry::new_clean(value));
                merged += 1;
            }
        }
        merged
    }

    fn snapshot(&self) -> Vec<V> {
        self.values
            .lock()
            .iter()
            .map(|entry| {
                entry.touch();
                entry.snapshot()
            })
            .collect()
    }
}

/// Cache of value lists keyed by `K`. A key's list in memory may be partial: values can be added before the store
/// has been asked for the rest, and [`get_or_load`](Self::get_or_load) merges the two.
pub struct MultimapCache<K, V>
where
    K: Debug + Hash + Eq + Clone + Send + Sync + 'static,
    V: PartialEq + Clone + Send + Sync + 'static,
{
    name:              String,
    stale_after:       Duration,
    slots:             Cache<K, Arc<Slot<V>>>,
    unsaved_evictions: AtomicU64,
}

impl<K, V> MultimapCache<K, V>
where
    K: Debug + Hash + Eq + Clone + Send + Sync + 'static,
    V: PartialEq + Clone + Send + Sync + 'static,
{
    pub fn new<S: Into<String>>(name: S, stale_after: Duration) -> Self {
        let name = name.into();
        Self {
            slots: Cache::builder().name(&name).build(),
            name,
            stale_after,
            unsaved_evictions: AtomicU64::new(0),
        }
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    // Slot membership only ever changes inside a per-key compute so a concurrent flush can't drop a slot somebody is
    // appending to.
    fn with_slot<R>(&self, key: K, f: impl FnOnce(&Slot<V>) -> R) -> R {
        let mut outcome = None;
        self.slots.entry(key).and_compute_with(|maybe_slot| {
            let slot = maybe_slot.map(|cached| cached.into_value()).unwrap_or_default();
            outcome = Some(f(&slot));
            Op::Put(slot)
        });
        outcome.unwrap_or_else(|| unreachable!("compute closure always runs"))
    }

    /// Append a new value under `key`.
    pub fn put(&self, key: K, value: V) -> EntryRef<V> {
        debug!("[{}] PUT({key:?})", self.name);
        let entry = CacheEntry::new_dirty(value);
        self.with_slot(key, |slot| slot.values.lock().push(entry.clone()));
        entry
    }

    pub fn put_all(&self, key: K, values: impl IntoIterator<Item = V>) {
        let entries = values.into_iter().map(CacheEntry::new_dirty);
        self.with_slot(key, |slot| slot.values.lock().extend(entries));
    }

    /// Values currently in memory. Unknown keys yield an empty list.
    pub fn get_cached(&self, key: &K) -> Vec<V> {
        self.slots.get(key).map(|slot| slot.snapshot()).unwrap_or_default()
    }

    /// Values for `key`, loading from the store once. Anything put before or while the loader was running is kept
    /// alongside the loaded values. A failed load leaves the cache as it was.
    pub async fn get_or_load<F, E>(&self, key: &K, loader: F) -> Result<Vec<V>, E>
    where
        F: Future<Output = Result<Vec<V>, E>>,
    {
        if let Some(slot) = self.slots.get(key) {
            if slot.is_loaded() {
                return Ok(slot.snapshot());
            }
        }

        debug!("[{}] MISS({key:?})", self.name);
        let loaded = loader.await?;
        Ok(self.with_slot(key.clone(), |slot| {
            slot.merge(loaded);
            slot.loaded.store(true, Ordering::Release);
            slot.snapshot()
        }))
    }

    /// Load values for many keys at once and merge them group by group. Every key that received values is marked as
    /// loaded. Returns the loaded collection.
    pub async fn load_bulk<F, E>(&self, loader: F, key_of: impl Fn(&V) -> K) -> Result<Vec<V>, E>
    where
        F: Future<Output = Result<Vec<V>, E>>,
    {
        let loaded = loader.await?;
        let mut groups: HashMap<K, Vec<V>> = HashMap::new();
        for value in &loaded {
            groups.entry(key_of(value)).or_default().push(value.clone());
        }
        for (key, group) in groups {
            self.with_slot(key, |slot| {
                slot.merge(group);
                slot.loaded.store(true, Ordering::Release);
            });
        }
        Ok(loaded)
    }

    /// Take every dirty value of `key` out for saving.
    pub fn take(&self, key: &K) -> Vec<InFlight<V>> {
        let Some(slot) = self.slots.get(key)
        else {
            warn!("[{}] Cannot save {key:?}: no such key in cache", self.name);
            return Vec::new();
        };
        let taken: Vec<_> = slot.values.lock().iter().filter_map(CacheEntry::begin_save).collect();
        taken
    }

    /// [`take`](Self::take) for every key.
    pub fn take_all(&self) -> Vec<(K, InFlight<V>)> {
        let mut taken = Vec::new();
        for (key, slot) in self.slots.iter() {
            let values = slot.values.lock();
            taken.extend(
                values
                    .iter()
                    .filter_map(CacheEntry::begin_save)
                    .map(|value| (K::clone(&key), value)),
            );
        }
        taken
    }

    /// Hand every dirty value of `key` to `consumer`. A key that was never loaded is then aggressively flushed since
    /// its in-memory list is only a fragment of what the store holds. Returns the number of values saved.
    pub fn save(&self, key: &K, mut consumer: impl FnMut(&V)) -> usize {
        let taken = self.take(key);
        let saved = taken.len();
        for value in taken {
            consumer(&value.read());
            value.confirm();
        }

        if !self.is_loaded(key) {
            self.flush(key, true);
        }
        saved
    }

    pub fn save_all(&self, mut consumer: impl FnMut(&K, &V)) -> usize {
        self.keys()
            .iter()
            .map(|key| self.save(key, |value| consumer(key, value)))
            .sum()
    }

    /// Forget that `key` was loaded and evict its values that are clean and either stale or, with `aggressive`,
    /// regardless of age. A locked key keeps all its values. A key left with no values and no lock is dropped.
    /// Returns the number of evicted values.
    pub fn flush(&self, key: &K, aggressive: bool) -> usize {
        let mut evicted = Vec::new();
        let mut unsaved = 0u64;

        self.slots.entry(key.clone()).and_compute_with(|maybe_slot| {
            let Some(cached) = maybe_slot
            else {
                return Op::Nop;
            };
            let slot = cached.into_value();
            slot.loaded.store(false, Ordering::Release);
            if slot.is_locked() {
                return Op::Nop;
            }

            let now_empty = {
                let mut values = slot.values.lock();
                values.retain(|entry| {
                    if entry.is_evictable(aggressive, self.stale_after) {
                        evicted.push(entry.clone());
                        false
                    }
                    else {
                        unsaved += (aggressive && entry.is_dirty()) as u64;
                        true
                    }
                });
                values.is_empty()
            };

            if now_empty {
                Op::Remove
            }
            else {
                Op::Nop
            }
        });

        if unsaved > 0 {
            self.unsaved_evictions.fetch_add(unsaved, Ordering::Relaxed);
            error!("[{}] Refusing to evict {unsaved} unsaved value(s) of {key:?}", self.name);
        }

        for entry in &evicted {
            entry.detach();
        }
        evicted.len()
    }

    pub fn flush_all(&self, aggressive: bool) -> usize {
        self.keys().iter().map(|key| self.flush(key, aggressive)).sum()
    }

    /// Pin the key. An unknown key becomes resident with an empty list.
    pub fn lock(&self, key: &K) {
        self.with_slot(key.clone(), |slot| slot.locked.store(true, Ordering::Release));
    }

    pub fn unlock(&self, key: &K) {
        if let Some(slot) = self.slots.get(key) {
            slot.locked.store(false, Ordering::Release);
        }
    }

    pub fn is_loaded(&self, key: &K) -> bool {
        self.slots.get(key).is_some_and(|slot| slot.is_loaded())
    }

    /// Drop the key with all its values, saved or not.
    pub fn remove(&self, key: &K) -> Vec<EntryRef<V>> {
        let Some(slot) = self.slots.remove(key)
        else {
            return Vec::new();
        };
        let values = std::mem::take(&mut *slot.values.lock());
        for entry in &values {
            entry.detach();
        }
        values
    }

    pub fn keys(&self) -> Vec<K> {
        self.slots.iter().map(|(key, _)| K::clone(&key)).collect()
    }

    /// Counts values, not keys. `locked` is the number of locked keys.
    pub fn stats(&self) -> CacheStats {
        let mut stats = CacheStats {
            unsaved_evictions: self.unsaved_evictions.load(Ordering::Relaxed),
            ..Default::default()
        };
        for (_, slot) in self.slots.iter() {
            stats.locked += slot.is_locked() as usize;
            for entry in slot.values.lock().iter() {
                stats.entries += 1;
                stats.dirty += entry.is_dirty() as usize;
            }
        }
        stats
    }
}

impl<K, V> Debug for MultimapCache<K, V>
where
    K: Debug + Hash + Eq + Clone + Send + Sync + 'static,
    V: PartialEq + Clone + Send + Sync + 'static,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MultimapCache")
            .field("name", &self.name)
            .field("stats", &self.stats())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::oneshot;

    const STALE: Duration = Duration::from_secs(120);

    fn cache() -> MultimapCache<u8, &'static str> {
        MultimapCache::new("events", STALE)
    }

    #[tokio::test]
    async fn put_during_load_is_merged() {
        let cache = Arc::new(cache());
        let (tx, rx) = oneshot::channel::<Vec<&'static str>>();

        cache.put(1, "early");
        let loader_cache = cache.clone();
        let pending = tokio::spawn(async move {
            loader_cache
                .get_or_load(&1, async move { Ok::<_, ()>(rx.await.unwrap()) })
                .await
                .unwrap()
        });
        tokio::task::yield_now().await;

        cache.put(1, "during");
        tx.send(vec!["stored", "early"]).unwrap();

        let mut merged = pending.await.unwrap();
        merged.sort();
        assert_eq!(merged, vec!["during", "early", "stored"]);
        assert!(cache.is_loaded(&1));

        let stats = cache.stats();
        assert_eq!(stats.entries, 3);
        assert_eq!(stats.dirty, 2, "only the loaded value arrives clean");
    }

    #[tokio::test]
    async fn loaded_key_is_served_from_memory() {
        let cache = cache();
        let calls = AtomicUsize::new(0);
        let load = || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok::<_, ()>(vec!["a", "b"])
        };

        assert_eq!(cache.get_or_load(&1, load()).await.unwrap().len(), 2);
        assert_eq!(cache.get_or_load(&1, load()).await.unwrap().len(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        assert!(cache.get_or_load(&2, async { Err::<Vec<&str>, _>(()) }).await.is_err());
        assert!(cache.get_cached(&2).is_empty());
        assert!(!cache.is_loaded(&2));
    }

    #[tokio::test]
    async fn bulk_load_merges_per_key() {
        let cache = cache();
        cache.put(1, "x1");
        cache
            .load_bulk(async { Ok::<_, ()>(vec!["x1", "x2", "y1"]) }, |v| if v.starts_with('x') { 1 } else { 2 })
            .await
            .unwrap();

        assert_eq!(cache.get_cached(&1).len(), 2);
        assert_eq!(cache.get_cached(&2), vec!["y1"]);
        assert!(cache.is_loaded(&1) && cache.is_loaded(&2));
    }

    #[test]
    fn save_of_unloaded_key_flushes_it() {
        let cache = cache();
        cache.put_all(1, ["a", "b"]);
        let mut saved = vec![];
        assert_eq!(cache.save(&1, |v| saved.push(*v)), 2);
        assert_eq!(saved, vec!["a", "b"]);
        assert!(cache.keys().is_empty());
        assert_eq!(cache.save(&1, |_| ()), 0);
    }

    #[test]
    fn locked_key_survives_flush() {
        let cache = cache();
        cache.lock(&3);
        assert_eq!(cache.keys(), vec![3]);
        cache.put(3, "kill");
        assert_eq!(cache.save(&3, |_| ()), 1);
        assert_eq!(cache.get_cached(&3), vec!["kill"]);

        cache.unlock(&3);
        assert_eq!(cache.flush(&3, true), 1);
        assert!(cache.keys().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn flush_clears_loaded_marker() {
        let cache = cache();
        cache.get_or_load(&1, async { Ok::<_, ()>(vec!["old"]) }).await.unwrap();
        cache.put(1, "new");

        tokio::time::advance(STALE * 2).await;
        assert_eq!(cache.flush(&1, false), 1);
        assert!(!cache.is_loaded(&1));
        assert_eq!(cache.get_cached(&1), vec!["new"]);

        assert_eq!(cache.flush(&1, true), 0);
        assert_eq!(cache.stats().unsaved_evictions, 1);
    }

    #[test]
    fn values_being_saved_are_not_evicted() {
        let cache = cache();
        cache.put_all(1, ["a", "b"]);
        cache.put(2, "c");

        let taken = cache.take(&1);
        assert_eq!(taken.len(), 2);
        let rest = cache.take_all();
        assert_eq!(rest.len(), 1);
        rest.into_iter().for_each(|(_, value)| value.confirm());

        assert_eq!(cache.flush_all(true), 1);
        assert_eq!(cache.keys(), vec![1]);

        drop(taken);
        assert_eq!(cache.stats().dirty, 2);
        assert_eq!(cache.save(&1, |_| ()), 2);
        assert!(cache.keys().is_empty());
    }
}
