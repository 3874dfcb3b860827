//! Error types shared across the hub.

use std::time::Duration;

/// Errors surfaced by a [`MessageStore`](crate::store::MessageStore) implementation.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The call did not complete within the configured deadline.
    #[error("store call timed out after {0:?}")]
    Timeout(Duration),

    /// A row the caller depends on does not exist.
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: i64 },

    /// Any other backend failure (connection loss, constraint violation, ...).
    #[error("store backend error: {0}")]
    Backend(String),
}

/// Errors raised while loading a [`HubConfig`](crate::config::HubConfig).
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("environment variable {name} has an invalid value {value:?}")]
    InvalidValue { name: &'static str, value: String },

    #[error("{0} must be greater than zero")]
    Zero(&'static str),
}

/// Errors raised by a single notification write.
#[derive(Debug, thiserror::Error)]
pub enum FanoutError {
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The preference lookup failed; the coalesced error is shared by every waiter.
    #[error("preference lookup failed: {0}")]
    Preferences(String),

    /// The job queue is full and the caller asked not to wait.
    #[error("notification queue is full")]
    QueueFull,

    /// The worker pool has shut down.
    #[error("notification queue is closed")]
    QueueClosed,
}

/// Runs a store call under `limit`, mapping an elapsed deadline to [`StoreError::Timeout`].
pub(crate) async fn bounded<T, F>(limit: Duration, call: F) -> Result<T, StoreError>
where
    F: Future<Output = Result<T, StoreError>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(StoreError::Timeout(limit)),
    }
}
