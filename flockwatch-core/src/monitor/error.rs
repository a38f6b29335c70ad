use thiserror::Error;

use crate::rate_limit::RateLimitError;
use crate::storage::StorageError;

#[derive(Debug, Error)]
pub enum MonitorError {
    #[error("source error: {0}")]
    Source(String),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    RateLimit(#[from] RateLimitError),
    #[error("notification error: {0}")]
    Notify(String),
}

pub type MonitorResult<T> = std::result::Result<T, MonitorError>;
