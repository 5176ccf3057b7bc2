use crate::error::StoreError;
use crate::record::Record;
use crate::record::TallyEntry;
use crate::record::VersusTally;
use crate::traits::StatStore;
use crate::types::PairKey;
use crate::types::StatType;
use async_trait::async_trait;
use parking_lot::Mutex;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tracing::instrument;
use uuid::Uuid;

#[derive(Debug, Default)]
struct Tables {
    records: HashMap<Uuid, Record>,
    tallies: HashMap<PairKey, VersusTally>,
    entries: HashSet<TallyEntry>,
}

/// In-process [`StatStore`]. Keeps everything in hash maps, can simulate latency, and can be told to fail on demand.
/// Counts the calls it receives so callers can see what reached the store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables:      RwLock<HashMap<String, Tables>>,
    latency:     Mutex<Option<Duration>>,
    closed:      AtomicBool,
    fail_loads:  AtomicBool,
    fail_saves:  AtomicBool,
    fail_close:  AtomicBool,
    load_calls:  AtomicUsize,
    save_calls:  AtomicUsize,
    close_calls: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every call sleeps this long before touching the tables.
    pub fn with_latency(self, latency: Duration) -> Self {
        *self.latency.lock() = Some(latency);
        self
    }

    pub fn set_fail_loads(&self, fail: bool) {
        self.fail_loads.store(fail, Ordering::Relaxed);
    }

    pub fn set_fail_saves(&self, fail: bool) {
        self.fail_saves.store(fail, Ordering::Relaxed);
    }

    pub fn set_fail_close(&self, fail: bool) {
        self.fail_close.store(fail, Ordering::Relaxed);
    }

    pub fn load_calls(&self) -> usize {
        self.load_calls.load(Ordering::Relaxed)
    }

    pub fn save_calls(&self) -> usize {
        self.save_calls.load(Ordering::Relaxed)
    }

    pub fn close_calls(&self) -> usize {
        self.close_calls.load(Ordering::Relaxed)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Put a record straight into the tables, bypassing any tracker.
    pub fn seed_record(&self, tracker: &str, record: Record) {
        self.tables
            .write()
            .entry(tracker.to_string())
            .or_default()
            .records
            .insert(record.id(), record);
    }

    pub fn stored_record(&self, tracker: &str, id: Uuid) -> Option<Record> {
        self.tables.read().get(tracker)?.records.get(&id).cloned()
    }

    pub fn stored_records(&self, tracker: &str) -> Vec<Record> {
        self.tables
            .read()
            .get(tracker)
            .map(|t| t.records.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn stored_tally(&self, tracker: &str, a: Uuid, b: Uuid) -> Option<VersusTally> {
        self.tables.read().get(tracker)?.tallies.get(&PairKey::new(a, b)).cloned()
    }

    pub fn stored_entries(&self, tracker: &str) -> Vec<TallyEntry> {
        let mut entries = self
            .tables
            .read()
            .get(tracker)
            .map(|t| t.entries.iter().copied().collect::<Vec<_>>())
            .unwrap_or_default();
        entries.sort_by_key(|e| e.timestamp);
        entries
    }

    async fn enter(&self, counter: &AtomicUsize, fail: &AtomicBool) -> Result<(), StoreError> {
        counter.fetch_add(1, Ordering::Relaxed);
        let latency = *self.latency.lock();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        if self.is_closed() {
            return Err(StoreError::Closed);
        }
        if fail.load(Ordering::Relaxed) {
            return Err(StoreError::backend("injected failure"));
        }
        Ok(())
    }

    fn with_tables<R>(&self, tracker: &str, f: impl FnOnce(&mut Tables) -> R) -> R {
        f(self.tables.write().entry(tracker.to_string()).or_default())
    }
}

#[async_trait]
impl StatStore for MemoryStore {
    #[instrument(level = "trace", skip(self))]
    async fn load_record(&self, tracker: &str, id: Uuid) -> Result<Option<Record>, StoreError> {
        self.enter(&self.load_calls, &self.fail_loads).await?;
        Ok(self.stored_record(tracker, id))
    }

    #[instrument(level = "trace", skip(self))]
    async fn load_top_records(
        &self,
        tracker: &str,
        limit: usize,
        order_by: &StatType,
    ) -> Result<Vec<Record>, StoreError> {
        self.enter(&self.load_calls, &self.fail_loads).await?;
        let mut records = self.stored_records(tracker);
        records.sort_by(|a, b| b.stat(order_by).total_cmp(&a.stat(order_by)));
        records.truncate(limit);
        Ok(records)
    }

    #[instrument(level = "trace", skip(self))]
    async fn load_versus_tally(&self, tracker: &str, a: Uuid, b: Uuid) -> Result<Option<VersusTally>, StoreError> {
        self.enter(&self.load_calls, &self.fail_loads).await?;
        Ok(self.stored_tally(tracker, a, b))
    }

    #[instrument(level = "trace", skip(self))]
    async fn load_tally_entries(&self, tracker: &str, id: Uuid) -> Result<Vec<TallyEntry>, StoreError> {
        self.enter(&self.load_calls, &self.fail_loads).await?;
        Ok(self
            .stored_entries(tracker)
            .into_iter()
            .filter(|e| e.involves(id))
            .collect())
    }

    #[instrument(level = "trace", skip(self, records), fields(count = records.len()))]
    async fn save_records(&self, tracker: &str, records: Vec<Record>) -> Result<(), StoreError> {
        self.enter(&self.save_calls, &self.fail_saves).await?;
        self.with_tables(tracker, |t| {
            for record in records {
                t.records.insert(record.id(), record);
            }
        });
        Ok(())
    }

    #[instrument(level = "trace", skip(self, tallies), fields(count = tallies.len()))]
    async fn save_versus_tallies(&self, tracker: &str, tallies: Vec<VersusTally>) -> Result<(), StoreError> {
        self.enter(&self.save_calls, &self.fail_saves).await?;
        self.with_tables(tracker, |t| {
            for tally in tallies {
                t.tallies.insert(tally.pair_key(), tally);
            }
        });
        Ok(())
    }

    #[instrument(level = "trace", skip(self, entries), fields(count = entries.len()))]
    async fn save_tally_entries(&self, tracker: &str, entries: Vec<TallyEntry>) -> Result<(), StoreError> {
        self.enter(&self.save_calls, &self.fail_saves).await?;
        self.with_tables(tracker, |t| t.entries.extend(entries));
        Ok(())
    }

    #[instrument(level = "trace", skip(self))]
    async fn remove_record(&self, tracker: &str, id: Uuid) -> Result<(), StoreError> {
        self.enter(&self.save_calls, &self.fail_saves).await?;
        self.with_tables(tracker, |t| t.records.remove(&id));
        Ok(())
    }

    async fn close(&self) -> Result<(), StoreError> {
        self.close_calls.fetch_add(1, Ordering::Relaxed);
        if self.fail_close.load(Ordering::Relaxed) {
            return Err(StoreError::backend("failed to release connection"));
        }
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}
