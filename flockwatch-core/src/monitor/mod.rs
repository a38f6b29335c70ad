//! Orchestrators that pull account state from a scraper, persist it and
//! report what changed.

mod account;
mod engagement;
mod error;
mod models;
mod source;
mod unfollower;

use std::sync::Arc;

use crate::rate_limit::{ActionKind, ActionRateLimiter};
use crate::storage::{StorageError, StorageResult};

pub use account::AccountMonitor;
pub use engagement::{EngagementTracker, DEFAULT_SAMPLE_SIZE};
pub use error::{MonitorError, MonitorResult};
pub use models::{
    AccountChange, AccountCheck, AccountCycleReport, AccountFailure, AccountSnapshot,
    EngagementSummary, GrowthReport, MonitorNotification, PostStats, ProfileStats,
    UnfollowerReport, AVG_LIKES, AVG_REPLIES, AVG_RETWEETS, AVG_VIEWS, ENGAGEMENT_RATE,
    FOLLOWERS_COUNT, FOLLOWERS_SNAPSHOT, FOLLOWING_COUNT, LIKES_COUNT, TWEET_COUNT,
};
pub use source::{EngagementSource, FollowerSource, LogReportSink, ProfileSource, ReportSink};
pub use unfollower::UnfollowerDetector;

/// Runs a blocking store call off the async runtime.
async fn run_blocking<T, F>(task: F) -> MonitorResult<T>
where
    F: FnOnce() -> StorageResult<T> + Send + 'static,
    T: Send + 'static,
{
    let result = tokio::task::spawn_blocking(task)
        .await
        .map_err(StorageError::from)?;
    Ok(result?)
}

/// Waits for a scrape slot when a limiter is attached.
async fn pace_scrape(limiter: Option<&Arc<ActionRateLimiter>>) -> MonitorResult<()> {
    if let Some(limiter) = limiter {
        limiter.acquire_kind(ActionKind::Scrape).await?;
    }
    Ok(())
}
