use crate::config::AdvancedSettings;
use crate::config::Settings;
use crate::config::TrackerSettings;
use crate::entry::EntryRef;
use crate::entry::InFlight;
use crate::error::Result;
use crate::error::StoreError;
use crate::error::TrackerError;
use crate::map_cache::MapCache;
use crate::multimap_cache::MultimapCache;
use crate::rating::CalculatorRegistry;
use crate::rating::RatingCalculator;
use crate::record::Record;
use crate::record::TallyContext;
use crate::record::TallyEntry;
use crate::record::VersusTally;
use crate::set_cache::SetCache;
use crate::traits::StatStore;
use crate::types::CacheStats;
use crate::types::PairKey;
use crate::types::StatType;
use fieldx_plus::fx_plus;
use garde::Validate;
use parking_lot::RwLockWriteGuard;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::Weak;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_stream::wrappers::IntervalStream;
use tokio_stream::StreamExt;
use tracing::debug;
use tracing::error;
use tracing::instrument;
use tracing::warn;
use uuid::Uuid;

/// Dirty values taken out of the containers by one save pass. Each handle keeps its entry resident until the store
/// answers; a handle dropped unconfirmed makes its entry dirty again.
#[derive(Debug)]
struct SaveBatch {
    records: Vec<InFlight<Record>>,
    tallies: Vec<InFlight<VersusTally>>,
    entries: Vec<InFlight<TallyEntry>>,
}

impl SaveBatch {
    fn is_empty(&self) -> bool {
        self.records.is_empty() && self.tallies.is_empty() && self.entries.is_empty()
    }
}

/// Combat statistics of one kind (PvP, an arena, ...) for any number of identities.
///
/// The tracker owns three write-back containers: per-identity [`Record`]s, pairwise [`VersusTally`]s, and
/// [`TallyEntry`] histories keyed by either participant. Everything game code does (kills, match outcomes, stat
/// updates) happens in memory; the store is only consulted on a cache miss and written by [`save`](Self::save),
/// [`save_all`](Self::save_all), or the autosave task.
///
/// ```ignore
/// let tracker = Tracker::builder()
///     .store(store)
///     .name("pvp")
///     .calculator(Arc::new(EloCalculator::default()))
///     .build()?;
///
/// let killer = tracker.lock_identity(killer_id, "alice").await;
/// let killed = tracker.get_or_create_record(killed_id, "bob").await;
/// tracker.record_kill(&killer, &killed).await;
/// tracker.release_identity(killer_id).await?;
/// ```
#[fx_plus(
    parent,
    no_new,
    default(off),
    sync,
    builder(
        doc("Builder object of [`Tracker`].", "", "See [`Tracker::builder()`] method."),
        method_doc("Implement builder pattern for [`Tracker`]."),
    )
)]
pub struct Tracker<S>
where
    S: StatStore,
{
    #[fieldx(vis(pub(crate)), builder(vis(pub), required), get(clone))]
    store: Arc<S>,

    /// Tracker name. Namespaces everything the tracker stores.
    #[fieldx(get, builder(vis(pub), required, into))]
    name: String,

    #[fieldx(get(clone), builder(vis(pub), required))]
    calculator: Arc<dyn RatingCalculator>,

    #[fieldx(get(copy), default(AdvancedSettings::default()))]
    advanced: AdvancedSettings,

    /// Stats persisted for every identity.
    #[fieldx(get, default(StatType::overall_columns()))]
    overall_columns: Vec<StatType>,

    /// Stats persisted for every pair of identities.
    #[fieldx(get, default(StatType::versus_columns()))]
    versus_columns: Vec<StatType>,

    #[fieldx(lazy, get(clone), builder(off))]
    records: Arc<MapCache<Uuid, Record>>,

    #[fieldx(lazy, get(clone), builder(off))]
    tallies: Arc<SetCache<VersusTally>>,

    #[fieldx(lazy, get(clone), builder(off))]
    histories: Arc<MultimapCache<Uuid, TallyEntry>>,

    #[fieldx(lock, private, get(copy), set, builder(off), default(None))]
    last_top_load: Option<Instant>,

    #[fieldx(private, clearer, lock, get, set, builder(off))]
    autosave_task: JoinHandle<()>,

    /// Tells the autosave task to stop once its current pass is over.
    #[fieldx(private, get(clone), builder(off), default(Arc::new(Notify::new())))]
    shutdown: Arc<Notify>,

    #[fieldx(lock, private, get(copy), set, builder(off), default(false))]
    destroyed: bool,
}

impl<S> Tracker<S>
where
    S: StatStore,
{
    fn build_records(&self) -> Arc<MapCache<Uuid, Record>> {
        Arc::new(MapCache::new(
            format!("{}:records", self.name),
            self.advanced.stale_after(),
        ))
    }

    fn build_tallies(&self) -> Arc<SetCache<VersusTally>> {
        Arc::new(SetCache::new(
            format!("{}:tallies", self.name),
            self.advanced.stale_after(),
        ))
    }

    fn build_histories(&self) -> Arc<MultimapCache<Uuid, TallyEntry>> {
        Arc::new(MultimapCache::new(
            format!("{}:tally_entries", self.name),
            self.advanced.stale_after(),
        ))
    }

    /// Build a tracker from its configuration section and start autosave. The calculator is looked up in
    /// `calculators` by the name the section gives.
    pub fn from_settings(
        settings: &Settings,
        tracker: &TrackerSettings,
        store: Arc<S>,
        calculators: &CalculatorRegistry,
    ) -> Result<Arc<Self>> {
        settings.validate()?;
        tracker.validate()?;

        let calculator = calculators.get(tracker.calculator())?;
        let tracker = Self::builder()
            .store(store)
            .name(tracker.name())
            .calculator(calculator)
            .advanced(settings.advanced())
            .overall_columns(tracker.overall_columns().clone())
            .versus_columns(tracker.versus_columns().clone())
            .build()?;

        tracker.start_autosave();
        Ok(tracker)
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed()
    }

    fn check_alive(&self) -> Result<()> {
        if self.destroyed() {
            Err(TrackerError::Destroyed(self.name.clone()))
        }
        else {
            Ok(())
        }
    }

    // --- Records

    /// Resident record or the one the store has. A failed load is logged and reported as a missing record.
    #[instrument(level = "debug", skip(self), fields(tracker = %self.name))]
    pub async fn get_record(&self, id: Uuid) -> Option<EntryRef<Record>> {
        let store = self.store();
        let default_rating = self.calculator.default_rating();
        let loader = async {
            let loaded = store.load_record(&self.name, id).await?;
            Ok::<_, StoreError>(loaded.map(|mut record| {
                record.ensure_rating(default_rating);
                record
            }))
        };

        match self.records().get_or_load(&id, loader).await {
            Ok(entry) => entry,
            Err(err) => {
                warn!("[{}] Failed to load record {id}: {err}", self.name);
                None
            }
        }
    }

    /// Record of an identity that is already in memory.
    pub fn get_cached_record(&self, id: Uuid) -> Option<EntryRef<Record>> {
        self.records().get_cached(&id)
    }

    /// Load the record or start a fresh one if the store doesn't have it or can't be reached.
    pub async fn get_or_create_record(&self, id: Uuid, name: &str) -> EntryRef<Record> {
        if let Some(entry) = self.get_record(id).await {
            return entry;
        }
        self.records().put_if_absent(id, self.new_record(id, name))
    }

    /// Start a fresh record, replacing any resident one.
    pub fn create_record<N: Into<String>>(&self, id: Uuid, name: N) -> EntryRef<Record> {
        debug!("[{}] New record for {id}", self.name);
        self.records().put(id, self.new_record(id, name))
    }

    /// Adopt a record built elsewhere. A record without a rating gets the calculator's default.
    pub fn add_record(&self, mut record: Record) -> EntryRef<Record> {
        record.ensure_rating(self.calculator.default_rating());
        self.records().put(record.id(), record)
    }

    fn new_record<N: Into<String>>(&self, id: Uuid, name: N) -> Record {
        let mut record = Record::zeroed(id, name, &self.overall_columns);
        record.set_rating(self.calculator.default_rating());
        record
    }

    /// Forget the identity both in memory and in the store.
    #[instrument(level = "debug", skip(self), fields(tracker = %self.name))]
    pub async fn remove_record(&self, id: Uuid) -> Result<()> {
        self.check_alive()?;
        self.records().remove(&id);
        self.store().remove_record(&self.name, id).await?;
        Ok(())
    }

    /// The `limit` best records by `order_by`. The store is queried at most once per `top_refresh` period; the
    /// result always reflects in-memory changes.
    #[instrument(level = "debug", skip(self), fields(tracker = %self.name))]
    pub async fn top_records(&self, limit: usize, order_by: &StatType) -> Vec<Record> {
        let refresh = self.advanced.top_refresh_period();
        let expired = self.last_top_load().is_none_or(|at| at.elapsed() >= refresh);

        if expired {
            let store = self.store();
            let default_rating = self.calculator.default_rating();
            let loader = async {
                let mut loaded = store.load_top_records(&self.name, limit, order_by).await?;
                for record in &mut loaded {
                    record.ensure_rating(default_rating);
                }
                Ok::<_, StoreError>(loaded)
            };
            let loaded = self.records().load_bulk(loader, Record::id).await;
            match loaded {
                Ok(loaded) => {
                    debug!("[{}] Loaded {} top records by {order_by}", self.name, loaded.len());
                    self.set_last_top_load(Some(Instant::now()));
                }
                Err(err) => warn!("[{}] Failed to load top records: {err}", self.name),
            }
        }

        let mut top = self
            .records()
            .values()
            .iter()
            .map(|entry| entry.snapshot())
            .collect::<Vec<_>>();
        top.sort_by(|a, b| b.stat(order_by).total_cmp(&a.stat(order_by)));
        top.truncate(limit);
        top
    }

    // --- Tallies

    /// Tally of two identities, in either order.
    #[instrument(level = "debug", skip(self), fields(tracker = %self.name))]
    pub async fn get_versus_tally(&self, a: Uuid, b: Uuid) -> Option<EntryRef<VersusTally>> {
        let store = self.store();
        match self
            .tallies()
            .get_or_load(&PairKey::new(a, b), store.load_versus_tally(&self.name, a, b))
            .await
        {
            Ok(entry) => entry,
            Err(err) => {
                warn!("[{}] Failed to load tally of {a} and {b}: {err}", self.name);
                None
            }
        }
    }

    /// Zeroed tally from `a`'s point of view. If the pair already has a resident tally that one is returned.
    pub fn create_versus_tally(&self, a: Uuid, b: Uuid) -> EntryRef<VersusTally> {
        let statistics = self.versus_columns.iter().map(|st| (st.clone(), 0.0)).collect();
        self.tallies().add_if_absent(VersusTally::new(a, b, statistics))
    }

    pub async fn get_or_create_versus_tally(&self, a: Uuid, b: Uuid) -> EntryRef<VersusTally> {
        match self.get_versus_tally(a, b).await {
            Some(tally) => tally,
            None => self.create_versus_tally(a, b),
        }
    }

    /// Change a tally through its context. A handle obtained before the tally was evicted still works: the tally is
    /// taken back in, or, if the pair has a resident tally again, that one is changed.
    pub fn modify_tally<R>(
        &self,
        tally: &EntryRef<VersusTally>,
        mutator: impl FnOnce(&mut TallyContext<'_>) -> R,
    ) -> R {
        let resident = if tally.is_detached() {
            debug!("[{}] Tally {} is not resident, taking it back", self.name, tally.read().pair_key());
            self.tallies().readmit(tally)
        }
        else {
            tally.clone()
        };
        resident.modify(|tally| mutator(&mut TallyContext::new(tally)))
    }

    /// Add an outcome to the histories of both participants.
    pub fn record_tally_entry(&self, entry: TallyEntry) {
        let entries = self.histories();
        entries.put(entry.id1, entry);
        if entry.id2 != entry.id1 {
            entries.put(entry.id2, entry);
        }

        let records = self.records();
        if !records.contains_key(&entry.id1) || !records.contains_key(&entry.id2) {
            warn!(
                "[{}] Tally entry for {} and {} recorded while one of the records is not resident",
                self.name, entry.id1, entry.id2
            );
        }
    }

    /// Outcomes involving `id`. Unless `include_losses` is set only those `id` won or tied as the first side are
    /// returned. A failed load yields an empty list.
    #[instrument(level = "debug", skip(self), fields(tracker = %self.name))]
    pub async fn tally_entries(&self, id: Uuid, include_losses: bool) -> Vec<TallyEntry> {
        let store = self.store();
        match self
            .histories()
            .get_or_load(&id, store.load_tally_entries(&self.name, id))
            .await
        {
            Ok(entries) if include_losses => entries,
            Ok(entries) => entries.into_iter().filter(|entry| entry.id1 == id).collect(),
            Err(err) => {
                error!("[{}] Failed to load tally entries of {id}: {err}", self.name);
                Vec::new()
            }
        }
    }

    // --- Stats

    async fn with_record(&self, id: Uuid, op: &str, f: impl FnOnce(&mut Record)) -> bool {
        match self.get_record(id).await {
            Some(entry) => {
                entry.modify(f);
                true
            }
            None => {
                warn!("[{}] Cannot {op} for {id}: no such record", self.name);
                false
            }
        }
    }

    /// Returns `false` if the identity has no record.
    pub async fn set_value(&self, id: Uuid, stat: StatType, value: f32) -> bool {
        self.with_record(id, "set value", |record| record.set_stat(stat, value))
            .await
    }

    pub async fn increment_value(&self, id: Uuid, stat: StatType) -> bool {
        self.with_record(id, "increment value", |record| record.increment(stat, 1.0))
            .await
    }

    pub async fn decrement_value(&self, id: Uuid, stat: StatType) -> bool {
        self.with_record(id, "decrement value", |record| record.decrement(stat, 1.0))
            .await
    }

    pub async fn enable_tracking(&self, id: Uuid) -> bool {
        self.with_record(id, "enable tracking", |record| record.set_tracking(true))
            .await
    }

    /// Outcomes involving a non-tracking identity leave its rating and counters alone.
    pub async fn disable_tracking(&self, id: Uuid) -> bool {
        self.with_record(id, "disable tracking", |record| record.set_tracking(false))
            .await
    }

    // --- Outcomes

    fn settle(&self, winner: &mut Record, loser: &mut Record, tie: bool) {
        self.calculator.update_rating(winner, loser, tie);
        winner.raise_max(&StatType::Rating, StatType::MaxRating);

        if tie {
            winner.increment(StatType::Ties, 1.0);
            loser.increment(StatType::Ties, 1.0);
        }

        winner.update_kd_ratio();
        loser.update_kd_ratio();
        winner.raise_max(&StatType::KdRatio, StatType::MaxKdRatio);

        loser.set_stat(StatType::Streak, 0.0);
        winner.increment(StatType::Streak, 1.0);
        winner.raise_max(&StatType::Streak, StatType::MaxStreak);
    }

    /// Full bookkeeping of a one-on-one outcome: ratings, maximums, ties, k/d ratios, and streaks.
    ///
    /// Outcome methods accept handles of evicted records too. Such a record is taken back into the cache before it
    /// changes, unless its identity has been loaded again meanwhile; then the resident record is the one updated.
    pub fn update_rating(&self, winner: &EntryRef<Record>, loser: &EntryRef<Record>, tie: bool) {
        let records = self.residents([winner, loser]);
        let Some(mut guards) = self.write_in_order(&records)
        else {
            return;
        };
        let (winner, loser) = guards.split_at_mut(1);
        self.settle(&mut winner[0], &mut loser[0], tie);
    }

    /// A kill: counters, rating, the pair's tally, and a tally entry.
    #[instrument(level = "debug", skip_all, fields(tracker = %self.name))]
    pub async fn record_kill(&self, killer: &EntryRef<Record>, killed: &EntryRef<Record>) {
        let (killer_id, killed_id) = {
            let records = self.residents([killer, killed]);
            let Some(mut guards) = self.write_in_order(&records)
            else {
                return;
            };
            let (killer, killed) = guards.split_at_mut(1);
            let (killer, killed) = (&mut *killer[0], &mut *killed[0]);
            if killer.is_tracking() {
                killer.increment(StatType::Kills, 1.0);
            }
            if killed.is_tracking() {
                killed.increment(StatType::Deaths, 1.0);
            }
            self.settle(killer, killed, false);
            (killer.id(), killed.id())
        };

        let tally = self.get_or_create_versus_tally(killer_id, killed_id).await;
        self.modify_tally(&tally, |ctx| {
            if ctx.tally().id1() == killer_id {
                ctx.increment(StatType::Kills);
            }
            else {
                ctx.increment(StatType::Deaths);
            }
        });

        self.record_tally_entry(TallyEntry::now(killer_id, killed_id, false));
    }

    /// One identity against several, e.g. a player leaving a match conceding to everybody else.
    pub fn update_rating_one_vs_many(&self, winner: &EntryRef<Record>, losers: &[EntryRef<Record>], tie: bool) {
        let participants = self.residents(std::iter::once(winner).chain(losers));
        let Some(mut guards) = self.write_in_order(&participants)
        else {
            return;
        };

        let (winner, losers) = guards.split_at_mut(1);
        let mut losers = losers.iter_mut().map(|guard| &mut **guard).collect::<Vec<_>>();
        self.calculator.update_rating_one_vs_many(&mut winner[0], &mut losers, tie);

        for record in std::iter::once(&mut *winner[0]).chain(losers) {
            record.raise_max(&StatType::Rating, StatType::MaxRating);
        }
    }

    /// Team outcome. Tracking victors are credited a win, tracking losers a loss.
    pub fn update_rating_groups(&self, winners: &[EntryRef<Record>], losers: &[EntryRef<Record>], tie: bool) {
        let participants = self.residents(winners.iter().chain(losers));
        let Some(mut guards) = self.write_in_order(&participants)
        else {
            return;
        };

        let (winners, losers) = guards.split_at_mut(winners.len());
        let mut winners = winners.iter_mut().map(|guard| &mut **guard).collect::<Vec<_>>();
        let mut losers = losers.iter_mut().map(|guard| &mut **guard).collect::<Vec<_>>();
        self.calculator.update_rating_groups(&mut winners, &mut losers, tie);

        for (group, outcome) in [(winners, StatType::wins()), (losers, StatType::losses())] {
            for record in group.into_iter().filter(|record| record.is_tracking()) {
                record.increment(outcome.clone(), 1.0);
                record.raise_max(&StatType::Rating, StatType::MaxRating);
            }
        }
    }

    /// Everybody against everybody, typically a draw.
    pub fn update_rating_free_for_all(&self, participants: &[EntryRef<Record>], tie: bool) {
        let participants = self.residents(participants);
        let Some(mut guards) = self.write_in_order(&participants)
        else {
            return;
        };

        let mut records = guards.iter_mut().map(|guard| &mut **guard).collect::<Vec<_>>();
        self.calculator.update_rating_free_for_all(&mut records, tie);

        for record in records.into_iter().filter(|record| record.is_tracking()) {
            if tie {
                record.increment(StatType::Ties, 1.0);
            }
            record.raise_max(&StatType::Rating, StatType::MaxRating);
        }
    }

    // Cached entries for the given handles, taking evicted ones back.
    fn residents<'r>(&self, records: impl IntoIterator<Item = &'r EntryRef<Record>>) -> Vec<EntryRef<Record>> {
        records
            .into_iter()
            .map(|record| {
                if !record.is_detached() {
                    return record.clone();
                }
                let id = record.read().id();
                debug!("[{}] Record {id} is not resident, taking it back", self.name);
                self.records().readmit(id, record)
            })
            .collect()
    }

    /// Write guards of all `entries`, acquired in ascending id order and returned in the order given. `None` if an
    /// identity is listed twice.
    fn write_in_order<'a>(&self, entries: &'a [EntryRef<Record>]) -> Option<Vec<RwLockWriteGuard<'a, Record>>> {
        let ids = entries.iter().map(|entry| entry.read().id()).collect::<Vec<_>>();
        if ids.iter().collect::<HashSet<_>>().len() != ids.len() {
            warn!("[{}] Outcome ignored: an identity takes part more than once", self.name);
            return None;
        }

        let mut order = (0..entries.len()).collect::<Vec<_>>();
        order.sort_by_key(|&i| ids[i]);

        let mut guards = entries.iter().map(|_| None).collect::<Vec<_>>();
        for i in order {
            guards[i] = Some(entries[i].write());
        }
        Some(guards.into_iter().flatten().collect())
    }

    // --- Residency

    /// The identity became active: make sure its record is resident and pin it along with its tally entries.
    pub async fn lock_identity(&self, id: Uuid, name: &str) -> EntryRef<Record> {
        let record = self.get_or_create_record(id, name).await;
        self.records().lock(&id);
        self.histories().lock(&id);
        record
    }

    /// The identity is gone: save it and unpin. With `flush_on_leave` its clean values are evicted right away; values
    /// an autosave pass is still waiting on the store for stay until that pass is over.
    pub async fn release_identity(&self, id: Uuid) -> Result<()> {
        let saved = self.save(id).await;
        self.records().unlock(&id);
        self.histories().unlock(&id);

        if saved.is_ok() && self.advanced.flush_on_leave() {
            self.records().flush(&id, true);
            self.histories().flush(&id, true);
        }
        saved
    }

    // --- Persistence

    /// Persist everything dirty about `id`: its record, the tallies it takes part in, and its tally entries.
    #[instrument(level = "debug", skip(self), fields(tracker = %self.name))]
    pub async fn save(&self, id: Uuid) -> Result<()> {
        self.check_alive()?;

        let batch = SaveBatch {
            records: self.records().take(&id).into_iter().collect(),
            tallies: self.tallies().take_matching(|tally| tally.involves(id)),
            entries: self.histories().take(&id),
        };
        self.persist(batch).await
    }

    /// Persist every dirty value of the tracker.
    #[instrument(level = "debug", skip(self), fields(tracker = %self.name))]
    pub async fn save_all(&self) -> Result<()> {
        self.check_alive()?;
        self.save_everything().await
    }

    async fn save_everything(&self) -> Result<()> {
        let batch = SaveBatch {
            records: self.records().take_all().into_iter().map(|(_, taken)| taken).collect(),
            tallies: self.tallies().take_all(),
            entries: self.histories().take_all().into_iter().map(|(_, taken)| taken).collect(),
        };
        self.persist(batch).await
    }

    // Hands a batch to the store. Handles of whatever the store rejects are dropped unconfirmed, which puts those
    // values back into the dirty state for the next pass.
    async fn persist(&self, batch: SaveBatch) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }

        let SaveBatch {
            records,
            tallies,
            entries,
        } = batch;
        debug!(
            "[{}] Saving {} records, {} tallies, {} tally entries",
            self.name,
            records.len(),
            tallies.len(),
            entries.len()
        );

        // Every value is captured before the first store call so the batch is consistent.
        let persisted_records = records
            .iter()
            .map(|taken| taken.read().persisted(&self.overall_columns))
            .collect::<Vec<_>>();
        let persisted_tallies = tallies
            .iter()
            .map(|taken| taken.read().persisted(&self.versus_columns))
            .collect::<Vec<_>>();
        // Every tally entry sits under both of its participants.
        let unique_entries = entries
            .iter()
            .map(|taken| *taken.read())
            .collect::<HashSet<_>>()
            .into_iter()
            .collect::<Vec<_>>();

        let store = self.store();
        let mut failure = None;

        if !persisted_records.is_empty() {
            match store.save_records(&self.name, persisted_records).await {
                Ok(()) => records.into_iter().for_each(InFlight::confirm),
                Err(err) => {
                    error!("[{}] Failed to save {} records: {err}", self.name, records.len());
                    failure.get_or_insert(err);
                }
            }
        }

        if !persisted_tallies.is_empty() {
            match store.save_versus_tallies(&self.name, persisted_tallies).await {
                Ok(()) => tallies.into_iter().for_each(InFlight::confirm),
                Err(err) => {
                    error!("[{}] Failed to save {} tallies: {err}", self.name, tallies.len());
                    failure.get_or_insert(err);
                }
            }
        }

        if !unique_entries.is_empty() {
            match store.save_tally_entries(&self.name, unique_entries).await {
                Ok(()) => entries.into_iter().for_each(InFlight::confirm),
                Err(err) => {
                    error!("[{}] Failed to save {} tally entries: {err}", self.name, entries.len());
                    failure.get_or_insert(err);
                }
            }
        }

        match failure {
            Some(err) => Err(err.into()),
            None => Ok(()),
        }
    }

    /// Evict clean, unlocked values from all containers: stale ones, or all of them if `aggressive`. Returns the
    /// number of evicted values.
    pub fn flush(&self, aggressive: bool) -> usize {
        let evicted = self.records().flush_all(aggressive)
            + self.tallies().flush(aggressive)
            + self.histories().flush_all(aggressive);
        debug!("[{}] Flushed {evicted} values (aggressive: {aggressive})", self.name);
        evicted
    }

    /// Container statistics in the order records, tallies, tally entries.
    pub fn stats(&self) -> [CacheStats; 3] {
        [
            self.records().stats(),
            self.tallies().stats(),
            self.histories().stats(),
        ]
    }

    /// Spawn the periodic save and flush task unless `save_interval` disables it. Idempotent while the task is
    /// running. Requires a Tokio runtime; without one autosave stays off.
    pub fn start_autosave(&self) {
        let Some(period) = self.advanced.save_period()
        else {
            debug!("[{}] Autosave disabled", self.name);
            return;
        };

        if self.autosave_task().as_ref().is_some_and(|task| !task.is_finished()) {
            return;
        }

        let Ok(runtime) = tokio::runtime::Handle::try_current()
        else {
            warn!("[{}] No Tokio runtime, autosave is not started", self.name);
            return;
        };

        let Some(myself) = self.myself()
        else {
            return;
        };

        debug!("[{}] Starting autosave every {period:?}", self.name);
        let tracker = Arc::downgrade(&myself);
        self.set_autosave_task(runtime.spawn(Self::autosave(tracker, self.shutdown(), period)));
    }

    async fn autosave(tracker: Weak<Self>, shutdown: Arc<Notify>, period: Duration) {
        let mut ticks = IntervalStream::new(tokio::time::interval_at(Instant::now() + period, period));
        loop {
            tokio::select! {
                biased;
                _ = shutdown.notified() => break,
                tick = ticks.next() => {
                    if tick.is_none() {
                        break;
                    }
                }
            }

            let Some(tracker) = tracker.upgrade()
            else {
                break;
            };

            match tracker.save_all().await {
                Ok(()) => {
                    tracker.flush(false);
                }
                Err(TrackerError::Destroyed(_)) => break,
                // Failed values are dirty again and will be retried on the next tick.
                Err(err) => error!("[{}] Autosave failed: {err}", tracker.name),
            }
        }
    }

    /// Stop autosave, save everything, and release the store. An autosave pass already talking to the store is
    /// waited for, not cancelled. A store that fails to close is reported as [`TrackerError::Teardown`] since the
    /// final save may not have reached it.
    #[instrument(level = "debug", skip(self), fields(tracker = %self.name))]
    pub async fn destroy(&self) -> Result<()> {
        self.check_alive()?;
        self.set_destroyed(true);

        if let Some(task) = self.clear_autosave_task() {
            self.shutdown.notify_one();
            if let Err(err) = task.await {
                error!("[{}] Autosave task ended abnormally: {err}", self.name);
            }
        }

        let saved = self.save_everything().await;
        if let Err(err) = &saved {
            error!("[{}] Final save failed: {err}", self.name);
        }

        self.store()
            .close()
            .await
            .map_err(|err| TrackerError::Teardown {
                tracker: self.name.clone(),
                source:  Arc::new(err),
            })?;

        debug!("[{}] Destroyed", self.name);
        saved
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rating::EloCalculator;
    use crate::store::MemoryStore;
    use chrono::TimeZone;
    use chrono::Utc;

    fn tracker_with(store: &Arc<MemoryStore>, advanced: AdvancedSettings) -> Arc<Tracker<MemoryStore>> {
        Tracker::builder()
            .store(store.clone())
            .name("pvp")
            .calculator(Arc::new(EloCalculator::default()))
            .advanced(advanced)
            .build()
            .unwrap()
    }

    fn tracker(store: &Arc<MemoryStore>) -> Arc<Tracker<MemoryStore>> {
        let mut advanced = AdvancedSettings::default();
        advanced.set_save_interval(-1);
        tracker_with(store, advanced)
    }

    #[tokio::test]
    async fn new_records_get_default_rating() {
        let store = Arc::new(MemoryStore::new());
        let tracker = tracker(&store);
        let id = Uuid::new_v4();

        let record = tracker.get_or_create_record(id, "alice").await;
        assert_eq!(record.read().rating(), 1250.0);
        assert_eq!(record.read().stat(&StatType::Kills), 0.0);
        assert!(record.is_dirty());

        let same = tracker.get_or_create_record(id, "alice").await;
        assert!(Arc::ptr_eq(&record, &same));
        assert_eq!(store.load_calls(), 1);
    }

    #[tokio::test]
    async fn loaded_records_are_clean() {
        let store = Arc::new(MemoryStore::new());
        let id = Uuid::new_v4();
        store.seed_record("pvp", Record::zeroed(id, "bob", &[StatType::Kills]));
        let tracker = tracker(&store);

        let record = tracker.get_record(id).await.unwrap();
        assert!(!record.is_dirty());
        assert_eq!(record.read().rating(), 1250.0);
        assert!(tracker.get_cached_record(id).is_some());
    }

    #[tokio::test]
    async fn load_failure_is_absent_and_not_cached() {
        let store = Arc::new(MemoryStore::new());
        store.set_fail_loads(true);
        let tracker = tracker(&store);
        let id = Uuid::new_v4();

        assert!(tracker.get_record(id).await.is_none());
        assert!(tracker.get_cached_record(id).is_none());
        assert!(tracker.tally_entries(id, true).await.is_empty());
        assert!(!tracker.set_value(id, StatType::Kills, 3.0).await);
    }

    #[tokio::test]
    async fn kill_updates_everything() {
        let store = Arc::new(MemoryStore::new());
        let tracker = tracker(&store);
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let killer = tracker.get_or_create_record(a, "alice").await;
        let killed = tracker.get_or_create_record(b, "bob").await;

        tracker.record_kill(&killer, &killed).await;

        {
            let killer = killer.read();
            assert_eq!(killer.stat(&StatType::Kills), 1.0);
            assert_eq!(killer.stat(&StatType::Streak), 1.0);
            assert_eq!(killer.stat(&StatType::MaxStreak), 1.0);
            assert_eq!(killer.stat(&StatType::KdRatio), 1.0);
            assert!(killer.rating() > 1250.0);
            assert_eq!(killer.stat(&StatType::MaxRating), killer.rating());
        }
        {
            let killed = killed.read();
            assert_eq!(killed.stat(&StatType::Deaths), 1.0);
            assert_eq!(killed.stat(&StatType::Streak), 0.0);
            assert!(killed.rating() < 1250.0);
        }

        let tally = tracker.get_versus_tally(b, a).await.unwrap();
        assert_eq!(tally.read().id1(), a);
        assert_eq!(tally.read().stat(&StatType::Kills), 1.0);
        assert_eq!(tally.read().stat(&StatType::Deaths), 0.0);

        let won = tracker.tally_entries(a, false).await;
        assert_eq!(won.len(), 1);
        assert!(tracker.tally_entries(b, false).await.is_empty());
        assert_eq!(tracker.tally_entries(b, true).await.len(), 1);
    }

    #[tokio::test]
    async fn untracked_identity_keeps_its_counters() {
        let store = Arc::new(MemoryStore::new());
        let tracker = tracker(&store);
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let killer = tracker.get_or_create_record(a, "alice").await;
        let killed = tracker.get_or_create_record(b, "bob").await;
        assert!(tracker.disable_tracking(b).await);

        tracker.record_kill(&killer, &killed).await;

        assert_eq!(killed.read().stat(&StatType::Deaths), 0.0);
        assert_eq!(killed.read().rating(), 1250.0);
        assert_eq!(killer.read().stat(&StatType::Kills), 1.0);
    }

    #[tokio::test]
    async fn same_identity_outcome_is_ignored() {
        let store = Arc::new(MemoryStore::new());
        let tracker = tracker(&store);
        let record = tracker.create_record(Uuid::new_v4(), "solo");

        tracker.update_rating(&record, &record, false);
        assert_eq!(record.read().rating(), 1250.0);
        assert_eq!(record.read().stat(&StatType::Streak), 0.0);
    }

    #[tokio::test]
    async fn group_outcome_credits_wins_and_losses() {
        let store = Arc::new(MemoryStore::new());
        let tracker = tracker(&store);
        let winners = vec![
            tracker.create_record(Uuid::new_v4(), "w1"),
            tracker.create_record(Uuid::new_v4(), "w2"),
        ];
        let losers = vec![
            tracker.create_record(Uuid::new_v4(), "l1"),
            tracker.create_record(Uuid::new_v4(), "l2"),
        ];

        tracker.update_rating_groups(&winners, &losers, false);

        for winner in &winners {
            let winner = winner.read();
            assert_eq!(winner.stat(&StatType::wins()), 1.0);
            assert_eq!(winner.rating(), 1300.0);
            assert_eq!(winner.stat(&StatType::MaxRating), 1300.0);
        }
        for loser in &losers {
            assert_eq!(loser.read().stat(&StatType::losses()), 1.0);
            assert_eq!(loser.read().rating(), 1200.0);
        }
    }

    #[tokio::test]
    async fn draw_counts_ties() {
        let store = Arc::new(MemoryStore::new());
        let tracker = tracker(&store);
        let players = (0..3)
            .map(|i| tracker.create_record(Uuid::new_v4(), format!("p{i}")))
            .collect::<Vec<_>>();

        tracker.update_rating_free_for_all(&players, true);
        for player in &players {
            assert_eq!(player.read().stat(&StatType::Ties), 1.0);
            assert_eq!(player.read().rating(), 1250.0);
        }
    }

    #[tokio::test]
    async fn save_persists_record_tallies_and_entries() {
        let store = Arc::new(MemoryStore::new());
        let tracker = tracker(&store);
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let killer = tracker.get_or_create_record(a, "alice").await;
        let killed = tracker.get_or_create_record(b, "bob").await;
        tracker.record_kill(&killer, &killed).await;

        tracker.save(a).await.unwrap();

        let stored = store.stored_record("pvp", a).unwrap();
        assert_eq!(stored.stat(&StatType::Kills), 1.0);
        assert!(!stored.has_stat(&StatType::Streak));
        assert!(store.stored_record("pvp", b).is_none());
        assert!(store.stored_tally("pvp", a, b).is_some());
        assert_eq!(store.stored_entries("pvp").len(), 1);
        assert!(!killer.is_dirty());
        assert!(killed.is_dirty());

        let calls = store.save_calls();
        tracker.save(a).await.unwrap();
        assert_eq!(store.save_calls(), calls);
    }

    #[tokio::test]
    async fn failed_save_restores_dirty_state() {
        let store = Arc::new(MemoryStore::new());
        let tracker = tracker(&store);
        let record = tracker.create_record(Uuid::new_v4(), "carol");
        let other = tracker.create_record(Uuid::new_v4(), "dave");
        tracker.record_kill(&record, &other).await;

        store.set_fail_saves(true);
        assert!(matches!(tracker.save_all().await, Err(TrackerError::Store(_))));
        assert!(record.is_dirty());
        assert_eq!(tracker.flush(true), 0);

        store.set_fail_saves(false);
        tracker.save_all().await.unwrap();
        assert!(!record.is_dirty());
        assert_eq!(store.stored_records("pvp").len(), 2);
        assert_eq!(store.stored_entries("pvp").len(), 1);
    }

    #[tokio::test]
    async fn modify_tally_takes_back_evicted_tally() {
        let store = Arc::new(MemoryStore::new());
        let tracker = tracker(&store);
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let tally = tracker.create_versus_tally(a, b);
        tracker.save_all().await.unwrap();
        tracker.flush(true);
        assert!(tally.is_detached());

        tracker.modify_tally(&tally, |ctx| ctx.record_stat(StatType::Ties, 4.0));
        let resident = tracker.get_versus_tally(b, a).await.unwrap();
        assert_eq!(resident.read().stat(&StatType::Ties), 4.0);
        assert!(resident.is_dirty());
    }

    #[tokio::test]
    async fn residency_pins_and_releases() {
        let store = Arc::new(MemoryStore::new());
        let mut advanced = AdvancedSettings::default();
        advanced.set_save_interval(-1);
        advanced.set_flush_on_leave(true);
        let tracker = tracker_with(&store, advanced);
        let id = Uuid::new_v4();

        let record = tracker.lock_identity(id, "erin").await;
        tracker.save(id).await.unwrap();
        tracker.flush(true);
        assert!(tracker.get_cached_record(id).is_some());
        assert!(record.is_locked());

        tracker.release_identity(id).await.unwrap();
        assert!(tracker.get_cached_record(id).is_none());
        assert!(store.stored_record("pvp", id).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn top_records_respect_refresh_window() {
        let store = Arc::new(MemoryStore::new());
        for (name, rating) in [("low", 1000.0), ("high", 2000.0)] {
            let mut record = Record::zeroed(Uuid::new_v4(), name, &[]);
            record.set_rating(rating);
            store.seed_record("pvp", record);
        }
        let tracker = tracker(&store);

        let top = tracker.top_records(10, &StatType::Rating).await;
        assert_eq!(top.iter().map(|r| r.name()).collect::<Vec<_>>(), vec!["high", "low"]);
        let calls = store.load_calls();

        let mid = tracker.create_record(Uuid::new_v4(), "mid");
        mid.modify(|r| r.set_rating(1500.0));
        let top = tracker.top_records(2, &StatType::Rating).await;
        assert_eq!(top.iter().map(|r| r.name()).collect::<Vec<_>>(), vec!["high", "mid"]);
        assert_eq!(store.load_calls(), calls);

        tokio::time::advance(Duration::from_secs(61)).await;
        tracker.top_records(2, &StatType::Rating).await;
        assert_eq!(store.load_calls(), calls + 1);
    }

    #[tokio::test(start_paused = true)]
    async fn autosave_saves_and_flushes() {
        let store = Arc::new(MemoryStore::new());
        let mut advanced = AdvancedSettings::default();
        advanced.set_save_interval(10);
        advanced.set_stale_entry_time(30);
        let tracker = tracker_with(&store, advanced);
        tracker.start_autosave();

        let id = Uuid::new_v4();
        let record = tracker.create_record(id, "frank");
        let at = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        tracker.record_tally_entry(TallyEntry::new(id, Uuid::new_v4(), true, at));

        tokio::time::sleep(Duration::from_secs(11)).await;
        assert!(store.stored_record("pvp", id).is_some());
        assert_eq!(store.stored_entries("pvp").len(), 1);
        assert!(!record.is_dirty());
        assert!(!record.is_detached());

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(record.is_detached());
        assert!(tracker.get_cached_record(id).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn destroy_waits_for_running_autosave() {
        let store = Arc::new(MemoryStore::new().with_latency(Duration::from_secs(5)));
        let mut advanced = AdvancedSettings::default();
        advanced.set_save_interval(10);
        let tracker = tracker_with(&store, advanced);
        tracker.start_autosave();

        let id = Uuid::new_v4();
        let record = tracker.create_record(id, "heidi");

        // The autosave pass took the record at 10s and is still waiting for the store.
        tokio::time::sleep(Duration::from_secs(11)).await;
        assert!(!record.is_dirty());
        assert!(store.stored_record("pvp", id).is_none());

        tracker.destroy().await.unwrap();
        assert!(store.stored_record("pvp", id).is_some());
        assert!(store.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_autosave_outlives_release() {
        let store = Arc::new(MemoryStore::new().with_latency(Duration::from_secs(5)));
        let mut advanced = AdvancedSettings::default();
        advanced.set_save_interval(10);
        advanced.set_flush_on_leave(true);
        let tracker = tracker_with(&store, advanced);
        tracker.start_autosave();

        let id = Uuid::new_v4();
        let record = tracker.lock_identity(id, "ivan").await;
        store.set_fail_saves(true);

        // Autosave takes the record at 10s; the store rejects it at 15s.
        tokio::time::sleep(Duration::from_secs(6)).await;
        tracker.release_identity(id).await.unwrap();
        assert!(tracker.get_cached_record(id).is_some());

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(record.is_dirty());
        assert!(!record.is_detached());

        store.set_fail_saves(false);
        tracker.save_all().await.unwrap();
        assert_eq!(store.stored_record("pvp", id).unwrap().name(), "ivan");
        assert!(!record.is_dirty());
    }

    #[tokio::test]
    async fn top_records_get_default_rating() {
        let store = Arc::new(MemoryStore::new());
        let id = Uuid::new_v4();
        let mut record = Record::zeroed(id, "judy", &[StatType::Kills]);
        record.set_stat(StatType::Kills, 3.0);
        store.seed_record("pvp", record);
        let tracker = tracker(&store);

        let top = tracker.top_records(5, &StatType::Kills).await;
        assert_eq!(top.len(), 1);
        assert_eq!(top[0].rating(), 1250.0);
        assert_eq!(tracker.get_cached_record(id).unwrap().read().rating(), 1250.0);
    }

    #[tokio::test]
    async fn outcomes_reach_evicted_records() {
        let store = Arc::new(MemoryStore::new());
        let tracker = tracker(&store);
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let killer = tracker.create_record(a, "karl");
        let killed = tracker.create_record(b, "lena");
        tracker.save_all().await.unwrap();
        tracker.flush(true);
        assert!(killer.is_detached());

        tracker.record_kill(&killer, &killed).await;
        let resident = tracker.get_cached_record(a).unwrap();
        assert!(Arc::ptr_eq(&resident, &killer));
        assert!(!killer.is_detached());
        assert_eq!(resident.read().stat(&StatType::Kills), 1.0);

        tracker.save_all().await.unwrap();
        assert_eq!(store.stored_record("pvp", a).unwrap().stat(&StatType::Kills), 1.0);
        assert_eq!(store.stored_record("pvp", b).unwrap().stat(&StatType::Deaths), 1.0);

        // Once the identity is loaded again, the stale handle updates the loaded record.
        tracker.flush(true);
        let reloaded = tracker.get_record(b).await.unwrap();
        let before = reloaded.read().rating();
        tracker.update_rating(&killer, &killed, false);
        assert!(reloaded.read().rating() < before);
        assert!(reloaded.is_dirty());
        assert!(killed.is_detached());
    }

    #[tokio::test]
    async fn same_millisecond_outcomes_are_one_entry() {
        let store = Arc::new(MemoryStore::new());
        let tracker = tracker(&store);
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let at = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();

        let first = TallyEntry::new(a, b, false, at + chrono::Duration::microseconds(100));
        let second = TallyEntry::new(a, b, false, at + chrono::Duration::microseconds(900));
        assert_eq!(first, second);
        tracker.record_tally_entry(first);
        tracker.record_tally_entry(second);
        tracker.record_tally_entry(TallyEntry::new(a, b, false, at + chrono::Duration::milliseconds(1)));

        tracker.save_all().await.unwrap();
        assert_eq!(store.stored_entries("pvp").len(), 2);
    }

    #[tokio::test]
    async fn destroy_closes_store_once() {
        let store = Arc::new(MemoryStore::new());
        let tracker = tracker(&store);
        let id = Uuid::new_v4();
        tracker.create_record(id, "grace");

        tracker.destroy().await.unwrap();
        assert!(store.is_closed());
        assert!(store.stored_record("pvp", id).is_some());
        assert!(tracker.is_destroyed());
        assert!(matches!(tracker.destroy().await, Err(TrackerError::Destroyed(_))));
        assert!(matches!(tracker.save_all().await, Err(TrackerError::Destroyed(_))));
        assert_eq!(store.close_calls(), 1);
    }

    #[tokio::test]
    async fn destroy_surfaces_close_failure() {
        let store = Arc::new(MemoryStore::new());
        store.set_fail_close(true);
        let tracker = tracker(&store);

        let err = tracker.destroy().await.unwrap_err();
        assert!(matches!(err, TrackerError::Teardown { ref tracker, .. } if tracker == "pvp"));
    }

    #[tokio::test]
    async fn from_settings_resolves_calculator() {
        let store = Arc::new(MemoryStore::new());
        let settings = Settings::from_json(r#"{ "advanced": { "save_interval": -1 } }"#).unwrap();
        let registry = CalculatorRegistry::with_elo(&settings.rating().elo());

        let arena = TrackerSettings::new("arena").with_column(StatType::wins());
        let tracker = Tracker::from_settings(&settings, &arena, store.clone(), &registry).unwrap();
        assert_eq!(tracker.name(), "arena");
        assert!(tracker.overall_columns().contains(&StatType::wins()));

        let json = r#"{"name": "broken", "calculator": "glicko"}"#;
        let broken: TrackerSettings = serde_json::from_str(json).unwrap();
        assert!(matches!(
            Tracker::from_settings(&settings, &broken, store, &registry),
            Err(TrackerError::UnknownCalculator(_))
        ));
    }
}
