use thiserror::Error;

pub type RateLimitResult<T> = Result<T, RateLimitError>;

#[derive(Debug, Error, PartialEq)]
pub enum RateLimitError {
    #[error("invalid rate limit config: {0}")]
    InvalidConfig(String),
    #[error("weight {weight} exceeds the {window} limit of {limit}")]
    WeightExceedsLimit {
        weight: u32,
        limit: u32,
        window: &'static str,
    },
}
