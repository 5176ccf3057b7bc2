use std::sync::Arc;

use thiserror::Error;

/// Errors reported by [`StatStore`](crate::traits::StatStore) implementations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store backend failure: {0}")]
    Backend(String),

    #[error("store has been closed")]
    Closed,

    #[error("failed to (de)serialize stored value: {0}")]
    Serialization(#[from] serde_json::Error),

    #[cfg(feature = "sql")]
    #[error(transparent)]
    Db(#[from] sea_orm::DbErr),
}

impl StoreError {
    pub fn backend<S: ToString>(msg: S) -> Self {
        Self::Backend(msg.to_string())
    }
}

#[derive(Debug, Error)]
pub enum TrackerError {
    #[error(transparent)]
    Store(#[from] Arc<StoreError>),

    #[error("invalid configuration: {0}")]
    Config(#[from] garde::Report),

    #[error("failed to read configuration: {0}")]
    ConfigFormat(#[from] serde_json::Error),

    #[error("failed to read configuration file: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Builder(#[from] fieldx::error::FieldXError),

    #[error("unknown rating calculator '{0}'")]
    UnknownCalculator(String),

    #[error("tracker '{tracker}' failed to release its store: {source}")]
    Teardown {
        tracker: String,
        #[source]
        source:  Arc<StoreError>,
    },

    #[error("tracker '{0}' has already been destroyed")]
    Destroyed(String),
}

impl From<StoreError> for TrackerError {
    fn from(err: StoreError) -> Self {
        Self::Store(Arc::new(err))
    }
}

pub type Result<T, E = TrackerError> = std::result::Result<T, E>;
