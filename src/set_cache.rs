use crate::entry::CacheEntry;
use crate::entry::EntryRef;
use crate::entry::InFlight;
use crate::map_cache::MapCache;
use crate::traits::Indexed;
use crate::types::CacheStats;
use std::fmt::Debug;
use std::future::Future;
use std::time::Duration;

/// Collection of write-back entries without an external key. Elements are told apart by [`Indexed::index`], so
/// "the same element" means "the element with the same index" regardless of what its other fields hold.
pub struct SetCache<V>
where
    V: Indexed + Send + Sync + 'static,
{
    inner: MapCache<V::Index, V>,
}

impl<V> SetCache<V>
where
    V: Indexed + Send + Sync + 'static,
{
    pub fn new<S: Into<String>>(name: S, stale_after: Duration) -> Self {
        Self {
            inner: MapCache::new(name, stale_after),
        }
    }

    #[inline]
    pub fn name(&self) -> &str {
        self.inner.name()
    }

    /// Add a new element. An element with the same index is replaced.
    pub fn add(&self, value: V) -> EntryRef<V> {
        self.inner.put(value.index(), value)
    }

    /// Add the element unless one with the same index is already there, in which case the resident element is
    /// returned.
    pub fn add_if_absent(&self, value: V) -> EntryRef<V> {
        self.inner.put_if_absent(value.index(), value)
    }

    pub fn get_cached(&self, index: &V::Index) -> Option<EntryRef<V>> {
        self.inner.get_cached(index)
    }

    /// First element satisfying the predicate. Its access time is refreshed.
    pub fn find(&self, predicate: impl Fn(&V) -> bool) -> Option<EntryRef<V>> {
        self.inner
            .values()
            .into_iter()
            .find(|entry| predicate(&entry.read()))
            .inspect(|entry| entry.touch())
    }

    pub async fn get_or_load<F, E>(&self, index: &V::Index, loader: F) -> Result<Option<EntryRef<V>>, E>
    where
        F: Future<Output = Result<Option<V>, E>>,
    {
        self.inner.get_or_load(index, loader).await
    }

    /// Mutate an element in place. Returns `None` if there is no element with this index.
    pub fn modify<R>(&self, index: &V::Index, mutator: impl FnOnce(&mut V) -> R) -> Option<R> {
        let entry = self.inner.get_cached(index)?;
        Some(entry.modify(mutator))
    }

    /// Mark an element dirty and refresh its access time without changing it.
    pub fn touch_dirty(&self, index: &V::Index) -> bool {
        self.inner
            .get_cached(index)
            .map(|entry| entry.mark_dirty())
            .is_some()
    }

    #[inline]
    pub fn mark_dirty(&self, index: &V::Index) {
        self.inner.mark_dirty(index)
    }

    #[inline]
    pub fn lock(&self, index: &V::Index) {
        self.inner.lock(index)
    }

    #[inline]
    pub fn unlock(&self, index: &V::Index) {
        self.inner.unlock(index)
    }

    /// Take every dirty element out for saving.
    pub fn take_all(&self) -> Vec<InFlight<V>> {
        self.inner.take_all().into_iter().map(|(_, taken)| taken).collect()
    }

    /// Like [`take_all`](Self::take_all) but only for dirty elements matching the predicate.
    pub fn take_matching(&self, predicate: impl Fn(&V) -> bool) -> Vec<InFlight<V>> {
        self.inner
            .values()
            .iter()
            .filter(|entry| entry.is_dirty() && predicate(&entry.read()))
            .filter_map(CacheEntry::begin_save)
            .collect()
    }

    /// Hand every dirty element to `consumer`. Returns the number of elements saved.
    pub fn save(&self, mut consumer: impl FnMut(&V)) -> usize {
        self.inner.save_all(|_, value| consumer(value))
    }

    /// Like [`save`](Self::save) but only for dirty elements matching the predicate.
    pub fn save_matching(&self, predicate: impl Fn(&V) -> bool, mut consumer: impl FnMut(&V)) -> usize {
        let taken = self.take_matching(predicate);
        let saved = taken.len();
        for value in taken {
            consumer(&value.read());
            value.confirm();
        }
        saved
    }

    /// Take an evicted element back. An element that has meanwhile taken its index stays and is returned.
    pub fn readmit(&self, entry: &EntryRef<V>) -> EntryRef<V> {
        let index = entry.read().index();
        self.inner.readmit(index, entry)
    }

    #[inline]
    pub fn flush(&self, aggressive: bool) -> usize {
        self.inner.flush_all(aggressive)
    }

    pub fn remove(&self, index: &V::Index) -> Option<EntryRef<V>> {
        self.inner.remove(index)
    }

    pub fn values(&self) -> Vec<EntryRef<V>> {
        self.inner.values()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    #[inline]
    pub fn stats(&self) -> CacheStats {
        self.inner.stats()
    }
}

impl<V> Debug for SetCache<V>
where
    V: Indexed + Send + Sync + 'static,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SetCache").field("inner", &self.inner).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    struct Score {
        a:      u32,
        b:      u32,
        points: i32,
    }

    impl Indexed for Score {
        type Index = (u32, u32);

        fn index(&self) -> Self::Index {
            (self.a.min(self.b), self.a.max(self.b))
        }
    }

    fn score(a: u32, b: u32) -> Score {
        Score { a, b, points: 0 }
    }

    #[test]
    fn elements_are_identified_by_index() {
        let set = SetCache::new("scores", Duration::from_secs(60));
        set.add(score(1, 2));
        set.add(score(2, 1));
        assert_eq!(set.len(), 1);

        assert_eq!(set.modify(&(1, 2), |s| {
            s.points += 3;
            s.points
        }), Some(3));
        assert_eq!(set.modify(&(5, 6), |s| s.points), None);
        assert_eq!(set.find(|s| s.points == 3).unwrap().read().a, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn save_and_flush() {
        let set = SetCache::new("scores", Duration::from_secs(60));
        set.add(score(1, 2));
        set.add(score(1, 3));
        set.add(score(4, 5));

        let mut saved = vec![];
        assert_eq!(set.save_matching(|s| s.a == 1, |s| saved.push(s.index())), 2);
        assert_eq!(set.save(|s| saved.push(s.index())), 1);
        assert_eq!(set.save(|s| saved.push(s.index())), 0);
        saved.sort();
        assert_eq!(saved, vec![(1, 2), (1, 3), (4, 5)]);

        set.lock(&(4, 5));
        assert!(set.touch_dirty(&(1, 3)));
        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(set.flush(false), 1);
        assert!(set.get_cached(&(1, 2)).is_none());
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn rejected_elements_stay_resident() {
        let set = SetCache::new("scores", Duration::from_secs(60));
        let kept = set.add(score(1, 2));
        set.add(score(3, 4));

        let taken = set.take_matching(|s| s.a == 1);
        assert_eq!(taken.len(), 1);
        let others = set.take_all();
        assert_eq!(others.len(), 1);
        others.into_iter().for_each(InFlight::confirm);
        assert_eq!(set.flush(true), 1);

        drop(taken);
        assert!(kept.is_dirty());
        assert!(set.get_cached(&(1, 2)).is_some());
    }

    #[test]
    fn readmitted_element_is_resident_again() {
        let set = SetCache::new("scores", Duration::from_secs(60));
        let element = set.add(score(1, 2));
        set.save(|_| ());
        assert_eq!(set.flush(true), 1);
        assert!(element.is_detached());

        let resident = set.readmit(&element);
        assert!(std::sync::Arc::ptr_eq(&resident, &element));
        assert_eq!(set.len(), 1);
    }
}
