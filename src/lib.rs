//! # combat-tracker
//!
//! Write-back cached combat statistics and Elo-style ratings for game servers.
//!
//! Game events arrive on many workers at once and must never wait for a database. The crate keeps every statistic
//! a tracker needs in memory, mutates it synchronously, and writes it back to durable storage in batches: when an
//! identity leaves, on a periodic autosave, or when the tracker is torn down.
//!
//! # The Basics
//!
//! - A [`Tracker`](tracker::Tracker) follows one kind of combat (PvP, an arena, ...). It owns per-identity
//!   [`Record`](record::Record)s, pairwise [`VersusTally`](record::VersusTally)s, and histories of
//!   [`TallyEntry`](record::TallyEntry) outcomes.
//! - Storage is reached through the [`StatStore`](traits::StatStore) port. [`MemoryStore`](store::MemoryStore) is
//!   always available; [`SqlStore`](store::SqlStore) is enabled with the `sqlite`, `pg`, or `mysql` feature. One
//!   store object is meant to be shared by all trackers of a process.
//! - Ratings are computed by a [`RatingCalculator`](rating::RatingCalculator); [`EloCalculator`](rating::EloCalculator)
//!   is the default.
//!
//! # Containers
//!
//! Three containers back a tracker, all built on top of [moka](https://crates.io/crates/moka) with eviction left
//! entirely to us:
//!
//! - [`MapCache`](map_cache::MapCache): one value per key.
//! - [`SetCache`](set_cache::SetCache): values that carry their own index (tallies are indexed by their unordered
//!   pair of identities).
//! - [`MultimapCache`](multimap_cache::MultimapCache): lists of values per key, merged with whatever the store has.
//!
//! Every cached value is wrapped into a [`CacheEntry`](entry::CacheEntry) that tracks whether it is dirty, locked,
//! and when it was last read. A flush never evicts a dirty or a locked entry, nor one whose value a save pass is still
//! waiting on the store for.
//!
//! # Configuration
//!
//! [`Settings`](config::Settings) is deserialized from JSON and validated with [garde](https://crates.io/crates/garde).
//! [`Tracker::from_settings`](tracker::Tracker::from_settings) turns a tracker section into a running tracker.

pub mod config;
pub mod entry;
pub mod error;
pub mod map_cache;
pub mod multimap_cache;
pub mod rating;
pub mod record;
pub mod set_cache;
#[cfg(feature = "simulation")]
pub mod simulation;
pub mod store;
pub mod tracker;
pub mod traits;
pub mod types;

#[doc(inline)]
pub use tracker::Tracker;
#[doc(inline)]
pub use traits::StatStore;

pub mod prelude {
    pub use crate::config::Settings;
    pub use crate::config::TrackerSettings;
    pub use crate::entry::CacheEntry;
    pub use crate::entry::EntryRef;
    pub use crate::entry::InFlight;
    pub use crate::error::StoreError;
    pub use crate::error::TrackerError;
    pub use crate::rating::CalculatorRegistry;
    pub use crate::rating::EloCalculator;
    pub use crate::rating::RatingCalculator;
    pub use crate::record::Record;
    pub use crate::record::TallyEntry;
    pub use crate::record::VersusTally;
    pub use crate::store::MemoryStore;
    #[cfg(feature = "sql")]
    pub use crate::store::SqlStore;
    pub use crate::tracker::Tracker;
    pub use crate::traits::StatStore;
    pub use crate::types::*;
}
