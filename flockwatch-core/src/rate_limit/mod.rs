mod action;
mod error;
mod limiter;

pub use action::{ActionKind, ActionRateLimiter, DEFAULT_ACTION};
pub use error::{RateLimitError, RateLimitResult};
pub use limiter::{RateLimitConfig, RateLimitStats, RateLimiter};
