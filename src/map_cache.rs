use crate::entry::CacheEntry;
use crate::entry::EntryRef;
use crate::entry::InFlight;
use crate::types::CacheStats;
use moka::ops::compute::CompResult;
use moka::ops::compute::Op;
use moka::sync::Cache;
use std::fmt::Debug;
use std::future::Future;
use std::hash::Hash;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tracing::debug;
use tracing::error;
use tracing::warn;

/// Key-addressed container of write-back entries.
///
/// The underlying moka cache is unbounded and has no expiration policy: entries leave only through [`flush`] or
/// [`remove`], which is what keeps unsaved values from disappearing behind our back.
///
/// [`flush`]: MapCache::flush
/// [`remove`]: MapCache::remove
pub struct MapCache<K, V>
where
    K: Debug + Hash + Eq + Clone + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    name:              String,
    stale_after:       Duration,
    entries:           Cache<K, EntryRef<V>>,
    unsaved_evictions: AtomicU64,
}

impl<K, V> MapCache<K, V>
where
    K: Debug + Hash + Eq + Clone + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    pub fn new<S: Into<String>>(name: S, stale_after: Duration) -> Self {
        let name = name.into();
        Self {
            entries: Cache::builder().name(&name).build(),
            name,
            stale_after,
            unsaved_evictions: AtomicU64::new(0),
        }
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn stale_after(&self) -> Duration {
        self.stale_after
    }

    /// Insert or replace the value under `key`. The new entry is dirty since the store hasn't seen it yet.
    pub fn put(&self, key: K, value: V) -> EntryRef<V> {
        debug!("[{}] PUT({key:?})", self.name);
        let entry = CacheEntry::new_dirty(value);
        self.entries.entry(key).and_compute_with(|old| {
            if let Some(old) = old {
                old.into_value().detach();
            }
            Op::Put(entry.clone())
        });
        entry
    }

    /// Insert `value` unless the key is already cached. Returns the resident entry either way.
    pub fn put_if_absent(&self, key: K, value: V) -> EntryRef<V> {
        self.entries
            .entry(key)
            .or_insert_with(|| CacheEntry::new_dirty(value))
            .into_value()
    }

    /// Memory-only lookup.
    pub fn get_cached(&self, key: &K) -> Option<EntryRef<V>> {
        self.entries.get(key).inspect(|entry| entry.touch())
    }

    #[inline]
    pub fn contains_key(&self, key: &K) -> bool {
        self.entries.contains_key(key)
    }

    /// Return the cached entry or ask `loader` for the value. A loaded value is inserted clean, unless somebody has
    /// put a value under the same key while the loader was running; that value wins and is returned instead.
    ///
    /// The loader is never polled on a hit. Neither `Ok(None)` nor an error from the loader changes the cache.
    pub async fn get_or_load<F, E>(&self, key: &K, loader: F) -> Result<Option<EntryRef<V>>, E>
    where
        F: Future<Output = Result<Option<V>, E>>,
    {
        if let Some(entry) = self.get_cached(key) {
            return Ok(Some(entry));
        }

        debug!("[{}] MISS({key:?})", self.name);
        let Some(value) = loader.await?
        else {
            return Ok(None);
        };

        let entry = self
            .entries
            .entry(key.clone())
            .or_insert_with(|| CacheEntry::new_clean(value))
            .into_value();
        entry.touch();
        Ok(Some(entry))
    }

    /// Run a bulk loader and merge its values into the cache. Keys already cached keep their current entries. The
    /// full loaded collection is returned either way.
    pub async fn load_bulk<F, E>(&self, loader: F, key_of: impl Fn(&V) -> K) -> Result<Vec<V>, E>
    where
        F: Future<Output = Result<Vec<V>, E>>,
        V: Clone,
    {
        let loaded = loader.await?;
        let mut merged = 0usize;
        for value in &loaded {
            let inserted = self
                .entries
                .entry(key_of(value))
                .or_insert_with(|| CacheEntry::new_clean(value.clone()));
            if inserted.is_fresh() {
                merged += 1;
            }
        }
        debug!("[{}] bulk load: {} loaded, {merged} merged", self.name, loaded.len());
        Ok(loaded)
    }

    /// Take the value out for saving if it is dirty. The dirty flag stays cleared only if the returned handle is
    /// confirmed with [`InFlight::confirm`].
    pub fn take(&self, key: &K) -> Option<InFlight<V>> {
        let Some(entry) = self.entries.get(key)
        else {
            warn!("[{}] Cannot save {key:?}: no such entry in cache", self.name);
            return None;
        };
        CacheEntry::begin_save(&entry)
    }

    /// [`take`](Self::take) every dirty entry.
    pub fn take_all(&self) -> Vec<(K, InFlight<V>)> {
        self.entries
            .iter()
            .filter_map(|(key, entry)| CacheEntry::begin_save(&entry).map(|taken| (K::clone(&key), taken)))
            .collect()
    }

    /// Hand the value to `consumer` if it is dirty and clear the flag. Returns `true` if the consumer ran.
    pub fn save(&self, key: &K, consumer: impl FnOnce(&V)) -> bool {
        let Some(taken) = self.take(key)
        else {
            return false;
        };
        consumer(&taken.read());
        taken.confirm();
        true
    }

    /// [`save`](Self::save) every dirty entry. Returns the number of values handed over.
    pub fn save_all(&self, mut consumer: impl FnMut(&K, &V)) -> usize {
        let taken = self.take_all();
        let saved = taken.len();
        for (key, value) in taken {
            consumer(&key, &value.read());
            value.confirm();
        }
        saved
    }

    pub fn mark_dirty(&self, key: &K) {
        if let Some(entry) = self.entries.get(key) {
            entry.mark_dirty();
        }
    }

    /// Evict the entry if it is unlocked, clean, and either stale or `aggressive` is requested. A dirty entry met
    /// by an aggressive flush is an inconsistency: it is reported and kept.
    pub fn flush(&self, key: &K, aggressive: bool) -> bool {
        let mut unsaved = false;
        let outcome = self.entries.entry(key.clone()).and_compute_with(|maybe_entry| {
            let Some(cached) = maybe_entry
            else {
                return Op::Nop;
            };
            let entry = cached.into_value();
            if entry.is_evictable(aggressive, self.stale_after) {
                Op::Remove
            }
            else {
                unsaved = aggressive && !entry.is_locked() && entry.is_dirty();
                Op::Nop
            }
        });

        if unsaved {
            self.unsaved_evictions.fetch_add(1, Ordering::Relaxed);
            error!("[{}] Refusing to evict unsaved entry {key:?}", self.name);
        }

        match outcome {
            CompResult::Removed(removed) => {
                removed.into_value().detach();
                debug!("[{}] FLUSHED({key:?})", self.name);
                true
            }
            _ => false,
        }
    }

    /// [`flush`](Self::flush) every key. Returns how many entries were evicted.
    pub fn flush_all(&self, aggressive: bool) -> usize {
        self.keys().iter().filter(|key| self.flush(key, aggressive)).count()
    }

    pub fn lock(&self, key: &K) {
        if let Some(entry) = self.entries.get(key) {
            entry.lock();
        }
    }

    pub fn unlock(&self, key: &K) {
        if let Some(entry) = self.entries.get(key) {
            entry.unlock();
        }
    }

    /// Take an evicted entry back under `key` so handles to it reach the store again. If the key has meanwhile got
    /// another entry, that one stays and is returned.
    pub fn readmit(&self, key: K, entry: &EntryRef<V>) -> EntryRef<V> {
        self.entries
            .entry(key)
            .or_insert_with(|| {
                entry.reattach();
                entry.clone()
            })
            .into_value()
    }

    /// Drop the entry regardless of its state.
    pub fn remove(&self, key: &K) -> Option<EntryRef<V>> {
        self.entries.remove(key).inspect(|entry| entry.detach())
    }

    pub fn keys(&self) -> Vec<K> {
        self.entries.iter().map(|(key, _)| K::clone(&key)).collect()
    }

    pub fn values(&self) -> Vec<EntryRef<V>> {
        self.entries.iter().map(|(_, entry)| entry).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.iter().count()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.iter().next().is_none()
    }

    pub fn stats(&self) -> CacheStats {
        let mut stats = CacheStats {
            unsaved_evictions: self.unsaved_evictions.load(Ordering::Relaxed),
            ..Default::default()
        };
        for (_, entry) in self.entries.iter() {
            stats.entries += 1;
            stats.dirty += entry.is_dirty() as usize;
            stats.locked += entry.is_locked() as usize;
        }
        stats
    }
}

impl<K, V> Debug for MapCache<K, V>
where
    K: Debug + Hash + Eq + Clone + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MapCache")
            .field("name", &self.name)
            .field("stats", &self.stats())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;
    use tokio::sync::oneshot;

    const STALE: Duration = Duration::from_secs(300);

    fn cache() -> MapCache<u32, String> {
        MapCache::new("test", STALE)
    }

    #[tokio::test]
    async fn get_or_load_caches_clean_value() {
        let cache = cache();
        let calls = AtomicUsize::new(0);
        let load = || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok::<_, ()>(Some("stored".to_string()))
        };

        let entry = cache.get_or_load(&1, load()).await.unwrap().unwrap();
        assert_eq!(*entry.read(), "stored");
        assert!(!entry.is_dirty());

        let again = cache.get_or_load(&1, load()).await.unwrap().unwrap();
        assert!(Arc::ptr_eq(&entry, &again));
        assert_eq!(calls.load(Ordering::SeqCst), 1, "loader must not run on a hit");
    }

    #[tokio::test]
    async fn absent_and_failed_loads_leave_cache_untouched() {
        let cache = cache();
        assert!(cache.get_or_load(&1, async { Ok::<_, ()>(None) }).await.unwrap().is_none());
        assert!(cache.get_or_load(&2, async { Err::<Option<String>, _>("boom") }).await.is_err());
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn racing_put_wins_over_load() {
        let cache = Arc::new(cache());
        let (tx, rx) = oneshot::channel::<Option<String>>();

        let loader_cache = cache.clone();
        let pending = tokio::spawn(async move {
            loader_cache
                .get_or_load(&7, async move { Ok::<_, ()>(rx.await.unwrap()) })
                .await
                .unwrap()
                .unwrap()
        });
        tokio::task::yield_now().await;

        cache.put(7, "fresh".into());
        tx.send(Some("stale".into())).unwrap();

        let entry = pending.await.unwrap();
        assert_eq!(*entry.read(), "fresh");
        assert!(entry.is_dirty());
        assert_eq!(*cache.get_cached(&7).unwrap().read(), "fresh");
    }

    #[tokio::test]
    async fn bulk_load_does_not_clobber() {
        let cache = cache();
        cache.put(1, "local".into());

        let loaded = cache
            .load_bulk(
                async { Ok::<_, ()>(vec!["1:remote".to_string(), "2:remote".to_string()]) },
                |v: &String| v[..1].parse().unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(loaded.len(), 2);
        assert_eq!(*cache.get_cached(&1).unwrap().read(), "local");
        assert_eq!(*cache.get_cached(&2).unwrap().read(), "2:remote");
        assert!(!cache.get_cached(&2).unwrap().is_dirty());
    }

    #[test]
    fn save_only_dirty_entries() {
        let cache = cache();
        let entry = cache.put(1, "a".into());
        let mut seen = vec![];

        assert!(cache.save(&1, |v| seen.push(v.clone())));
        assert!(!cache.save(&1, |v| seen.push(v.clone())));
        entry.write().push('b');
        assert!(cache.save(&1, |v| seen.push(v.clone())));
        assert!(!cache.save(&42, |v| seen.push(v.clone())));

        assert_eq!(seen, vec!["a", "ab"]);
    }

    #[tokio::test(start_paused = true)]
    async fn flush_rules() {
        let cache = cache();
        cache.put(1, "dirty".into());
        cache.put(2, "locked".into());
        cache.put(3, "stale".into());
        cache.lock(&2);
        cache.save_all(|_, _| ());
        cache.mark_dirty(&1);

        // Nothing is stale yet.
        assert_eq!(cache.flush_all(false), 0);

        tokio::time::advance(STALE + Duration::from_secs(1)).await;
        assert!(!cache.flush(&1, false));
        assert!(!cache.flush(&2, false));
        assert!(cache.flush(&3, false));

        // Aggressive flush keeps the dirty entry and counts it.
        assert!(!cache.flush(&1, true));
        assert!(!cache.flush(&2, true));
        let stats = cache.stats();
        assert_eq!(stats.entries, 2);
        assert_eq!(stats.unsaved_evictions, 1);
        assert_eq!(stats.locked, 1);

        cache.unlock(&2);
        assert!(cache.flush(&2, true));
        assert!(!cache.flush(&2, true), "absent key is a no-op");
    }

    #[test]
    fn evicted_entries_are_detached() {
        let cache = cache();
        let entry = cache.put(1, "x".into());
        cache.save(&1, |_| ());
        assert!(cache.flush(&1, true));
        assert!(entry.is_detached());

        let replaced = cache.put(2, "y".into());
        cache.put(2, "z".into());
        assert!(replaced.is_detached());
        assert!(cache.remove(&2).unwrap().is_detached());
    }

    #[test]
    fn pending_save_blocks_eviction() {
        let cache = cache();
        let entry = cache.put(1, "x".into());
        let taken = cache.take(&1).unwrap();

        assert!(!cache.flush(&1, true));
        assert_eq!(cache.stats().unsaved_evictions, 0);

        // The store rejected it: dirty again and still resident.
        drop(taken);
        assert!(entry.is_dirty());
        assert!(!cache.flush(&1, true));

        let taken = cache.take_all();
        assert_eq!(taken.len(), 1);
        taken.into_iter().for_each(|(_, value)| value.confirm());
        assert!(cache.flush(&1, true));
    }

    #[test]
    fn readmit_takes_back_evicted_entry() {
        let cache = cache();
        let entry = cache.put(1, "x".into());
        cache.save(&1, |_| ());
        cache.flush(&1, true);

        let resident = cache.readmit(1, &entry);
        assert!(Arc::ptr_eq(&resident, &entry));
        assert!(!entry.is_detached());

        cache.remove(&1);
        let other = cache.put(1, "y".into());
        let resident = cache.readmit(1, &entry);
        assert!(Arc::ptr_eq(&resident, &other));
    }
}
