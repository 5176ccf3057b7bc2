use async_trait::async_trait;
use std::fmt::Debug;
use std::hash::Hash;
use uuid::Uuid;

use crate::error::StoreError;
use crate::record::Record;
use crate::record::TallyEntry;
use crate::record::VersusTally;
use crate::types::StatType;

/// Values stored in a [`SetCache`](crate::set_cache::SetCache) identify themselves with an index derived from their
/// content.
pub trait Indexed {
    type Index: Debug + Hash + Eq + Clone + Send + Sync + 'static;

    fn index(&self) -> Self::Index;
}

/// Durable storage behind the trackers.
///
/// One store object serves any number of trackers; every call is namespaced by the tracker name. Save methods are
/// upserts and must be safe to retry with the same data.
#[async_trait]
pub trait StatStore: Debug + Send + Sync + 'static {
    async fn load_record(&self, tracker: &str, id: Uuid) -> Result<Option<Record>, StoreError>;

    /// Up to `limit` records with the highest `order_by` values, best first.
    async fn load_top_records(
        &self,
        tracker: &str,
        limit: usize,
        order_by: &StatType,
    ) -> Result<Vec<Record>, StoreError>;

    /// The tally of two identities, regardless of the order they were stored in.
    async fn load_versus_tally(&self, tracker: &str, a: Uuid, b: Uuid) -> Result<Option<VersusTally>, StoreError>;

    /// All tally entries where `id` is either side.
    async fn load_tally_entries(&self, tracker: &str, id: Uuid) -> Result<Vec<TallyEntry>, StoreError>;

    async fn save_records(&self, tracker: &str, records: Vec<Record>) -> Result<(), StoreError>;

    async fn save_versus_tallies(&self, tracker: &str, tallies: Vec<VersusTally>) -> Result<(), StoreError>;

    /// Entries are identified by `(id1, id2, timestamp)`, the timestamp in milliseconds. Saving an equal entry again
    /// is a no-op.
    async fn save_tally_entries(&self, tracker: &str, entries: Vec<TallyEntry>) -> Result<(), StoreError>;

    async fn remove_record(&self, tracker: &str, id: Uuid) -> Result<(), StoreError>;

    /// Release the underlying resources. Any further call may fail with [`StoreError::Closed`]. Every tracker sharing
    /// the store calls this on teardown, so closing more than once must succeed.
    async fn close(&self) -> Result<(), StoreError>;
}
