use crate::traits::Indexed;
use crate::types::PairKey;
use crate::types::StatType;
use chrono::DateTime;
use chrono::SubsecRound;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;
use std::collections::HashMap;
use std::hash::Hash;
use uuid::Uuid;

/// Statistics of a single identity within a tracker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Record {
    id:         Uuid,
    name:       String,
    statistics: HashMap<StatType, f32>,
    #[serde(default = "tracking_default")]
    tracking:   bool,
}

fn tracking_default() -> bool {
    true
}

impl Record {
    /// The running k/d ratio is derived from kills and deaths right away since it is never persisted.
    pub fn new<S: Into<String>>(id: Uuid, name: S, statistics: HashMap<StatType, f32>) -> Self {
        let mut record = Self {
            id,
            name: name.into(),
            statistics,
            tracking: true,
        };
        record.update_kd_ratio();
        record
    }

    /// A record with every given column set to zero.
    pub fn zeroed<S: Into<String>>(id: Uuid, name: S, columns: &[StatType]) -> Self {
        Self::new(id, name, columns.iter().map(|st| (st.clone(), 0.0)).collect())
    }

    #[inline]
    pub fn id(&self) -> Uuid {
        self.id
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_name<S: Into<String>>(&mut self, name: S) {
        self.name = name.into();
    }

    pub fn statistics(&self) -> &HashMap<StatType, f32> {
        &self.statistics
    }

    #[inline]
    pub fn is_tracking(&self) -> bool {
        self.tracking
    }

    pub fn set_tracking(&mut self, tracking: bool) {
        self.tracking = tracking;
    }

    pub fn has_stat(&self, stat: &StatType) -> bool {
        self.statistics.contains_key(stat)
    }

    /// Value of a stat, `0` if the record doesn't have it.
    pub fn stat(&self, stat: &StatType) -> f32 {
        self.statistics.get(stat).copied().unwrap_or(0.0)
    }

    pub fn set_stat(&mut self, stat: StatType, value: f32) {
        self.statistics.insert(stat, value);
    }

    pub fn increment(&mut self, stat: StatType, by: f32) {
        *self.statistics.entry(stat).or_insert(0.0) += by;
    }

    pub fn decrement(&mut self, stat: StatType, by: f32) {
        *self.statistics.entry(stat).or_insert(0.0) -= by;
    }

    #[inline]
    pub fn rating(&self) -> f32 {
        self.stat(&StatType::Rating)
    }

    pub fn set_rating(&mut self, rating: f32) {
        self.set_stat(StatType::Rating, rating);
    }

    /// Make sure the record has a rating, using `default` if it hasn't.
    pub(crate) fn ensure_rating(&mut self, default: f32) {
        self.statistics.entry(StatType::Rating).or_insert(default);
    }

    pub fn kd_ratio(&self) -> f32 {
        self.stat(&StatType::Kills) / self.stat(&StatType::Deaths).max(1.0)
    }

    pub fn update_kd_ratio(&mut self) {
        let kd = self.kd_ratio();
        self.set_stat(StatType::KdRatio, kd);
    }

    /// Raise `max` to the current value of `current` if it's bigger.
    pub(crate) fn raise_max(&mut self, current: &StatType, max: StatType) {
        let value = self.stat(current);
        if value > self.stat(&max) {
            self.set_stat(max, value);
        }
    }

    /// Copy of the record with statistics limited to the given columns. Columns the record lacks are stored as zeros.
    pub fn persisted(&self, columns: &[StatType]) -> Record {
        Record {
            id:         self.id,
            name:       self.name.clone(),
            statistics: columns.iter().map(|st| (st.clone(), self.stat(st))).collect(),
            tracking:   self.tracking,
        }
    }
}

impl PartialEq for Record {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Record {}

impl Hash for Record {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state)
    }
}

/// Head-to-head statistics of two identities. Stats are kept from `id1`'s point of view: `kills` are kills of `id2`
/// by `id1`, `deaths` the other way around.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersusTally {
    id1:        Uuid,
    id2:        Uuid,
    statistics: HashMap<StatType, f32>,
}

impl VersusTally {
    pub fn new(id1: Uuid, id2: Uuid, statistics: HashMap<StatType, f32>) -> Self {
        Self { id1, id2, statistics }
    }

    #[inline]
    pub fn id1(&self) -> Uuid {
        self.id1
    }

    #[inline]
    pub fn id2(&self) -> Uuid {
        self.id2
    }

    pub fn statistics(&self) -> &HashMap<StatType, f32> {
        &self.statistics
    }

    pub fn stat(&self, stat: &StatType) -> f32 {
        self.statistics.get(stat).copied().unwrap_or(0.0)
    }

    /// Whether the tally is about `a` and `b`, in either order.
    pub fn is_tally_for(&self, a: Uuid, b: Uuid) -> bool {
        (self.id1 == a && self.id2 == b) || (self.id1 == b && self.id2 == a)
    }

    pub fn involves(&self, id: Uuid) -> bool {
        self.id1 == id || self.id2 == id
    }

    #[inline]
    pub fn pair_key(&self) -> PairKey {
        PairKey::new(self.id1, self.id2)
    }

    /// Limit statistics to the given columns, filling missing ones with zeros.
    pub fn persisted(&self, columns: &[StatType]) -> VersusTally {
        VersusTally {
            id1:        self.id1,
            id2:        self.id2,
            statistics: columns.iter().map(|st| (st.clone(), self.stat(st))).collect(),
        }
    }
}

impl PartialEq for VersusTally {
    fn eq(&self, other: &Self) -> bool {
        self.pair_key() == other.pair_key()
    }
}

impl Eq for VersusTally {}

impl Hash for VersusTally {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.pair_key().hash(state)
    }
}

impl Indexed for VersusTally {
    type Index = PairKey;

    fn index(&self) -> PairKey {
        self.pair_key()
    }
}

/// Mutation handle passed to [`Tracker::modify_tally`](crate::tracker::Tracker::modify_tally).
pub struct TallyContext<'a> {
    tally: &'a mut VersusTally,
}

impl<'a> TallyContext<'a> {
    pub(crate) fn new(tally: &'a mut VersusTally) -> Self {
        Self { tally }
    }

    pub fn tally(&self) -> &VersusTally {
        self.tally
    }

    pub fn stat(&self, stat: &StatType) -> f32 {
        self.tally.stat(stat)
    }

    pub fn record_stat(&mut self, stat: StatType, value: f32) {
        self.tally.statistics.insert(stat, value);
    }

    pub fn increment(&mut self, stat: StatType) {
        let value = self.tally.stat(&stat) + 1.0;
        self.record_stat(stat, value);
    }
}

/// A single outcome between two identities. Immutable once recorded.
///
/// An entry is identified by `(id1, id2, timestamp)` with the timestamp at millisecond precision. Two outcomes of the
/// same pair, same sides and same millisecond are one entry: the store keeps a single row for them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TallyEntry {
    /// Victor, or either side on a tie.
    pub id1:       Uuid,
    /// Loser.
    pub id2:       Uuid,
    pub tie:       bool,
    pub timestamp: DateTime<Utc>,
}

impl TallyEntry {
    /// The timestamp is kept at millisecond precision, the finest stores are required to keep.
    pub fn new(id1: Uuid, id2: Uuid, tie: bool, timestamp: DateTime<Utc>) -> Self {
        Self {
            id1,
            id2,
            tie,
            timestamp: timestamp.trunc_subsecs(3),
        }
    }

    /// Entry stamped with the current time.
    pub fn now(id1: Uuid, id2: Uuid, tie: bool) -> Self {
        Self::new(id1, id2, tie, Utc::now())
    }

    pub fn involves(&self, id: Uuid) -> bool {
        self.id1 == id || self.id2 == id
    }
}
