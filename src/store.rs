//! [`StatStore`](crate::traits::StatStore) implementations.

pub mod memory;
#[cfg(feature = "sql")]
pub mod sql;

pub use memory::MemoryStore;
#[cfg(feature = "sql")]
pub use sql::SqlStore;
