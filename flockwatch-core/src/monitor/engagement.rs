use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use tracing::info;

use crate::config::MonitoringSection;
use crate::rate_limit::ActionRateLimiter;
use crate::storage::{DataPoint, SqliteTimeSeriesStore};

use super::error::MonitorResult;
use super::models::{
    EngagementSummary, GrowthReport, FOLLOWERS_COUNT, FOLLOWING_COUNT, TWEET_COUNT,
};
use super::source::{EngagementSource, ProfileSource};
use super::{pace_scrape, run_blocking};

const GROWTH_METRICS: [&str; 3] = [FOLLOWERS_COUNT, FOLLOWING_COUNT, TWEET_COUNT];
pub const DEFAULT_SAMPLE_SIZE: usize = 20;

pub struct EngagementTracker {
    posts: Arc<dyn EngagementSource>,
    profiles: Arc<dyn ProfileSource>,
    series: SqliteTimeSeriesStore,
    sample_size: usize,
    limiter: Option<Arc<ActionRateLimiter>>,
}

impl EngagementTracker {
    pub fn new(
        posts: Arc<dyn EngagementSource>,
        profiles: Arc<dyn ProfileSource>,
        series: SqliteTimeSeriesStore,
    ) -> Self {
        Self {
            posts,
            profiles,
            series,
            sample_size: DEFAULT_SAMPLE_SIZE,
            limiter: None,
        }
    }

    pub fn with_monitoring_config(mut self, monitoring: &MonitoringSection) -> Self {
        self.sample_size = monitoring.engagement_sample_size;
        self
    }

    pub fn sample_size(&self) -> usize {
        self.sample_size
    }

    pub fn with_rate_limiter(mut self, limiter: Arc<ActionRateLimiter>) -> Self {
        self.limiter = Some(limiter);
        self
    }

    /// `track` with the configured sample size.
    pub async fn track_default(&self, username: &str) -> MonitorResult<EngagementSummary> {
        self.track(username, self.sample_size).await
    }

    /// Samples the latest posts and records their engagement aggregates.
    pub async fn track(
        &self,
        username: &str,
        sample_size: usize,
    ) -> MonitorResult<EngagementSummary> {
        pace_scrape(self.limiter.as_ref()).await?;
        let posts = self.posts.fetch_recent_posts(username, sample_size).await?;
        pace_scrape(self.limiter.as_ref()).await?;
        let profile = self.profiles.fetch_profile(username).await?;

        let summary = EngagementSummary::from_posts(username, &posts, profile.followers);
        let now = Utc::now();
        let points: Vec<DataPoint> = summary
            .metrics()
            .iter()
            .map(|(metric, value)| DataPoint::new(*metric, username, *value, now))
            .collect();
        let series = self.series.clone();
        run_blocking(move || series.record_many(&points)).await?;

        info!(
            subject = username,
            posts = summary.posts_sampled,
            engagement_rate = summary.engagement_rate,
            "engagement tracked"
        );
        Ok(summary)
    }

    /// Follower, following and tweet count growth over the last `days`.
    pub async fn growth_report(&self, username: &str, days: u32) -> MonitorResult<GrowthReport> {
        let series = self.series.clone();
        let subject = username.to_string();
        let (changes, daily) = run_blocking(move || {
            let mut changes = BTreeMap::new();
            let mut daily = BTreeMap::new();
            for metric in GROWTH_METRICS {
                if let Some(change) = series.get_change(metric, &subject, days)? {
                    changes.insert(metric.to_string(), change);
                }
                daily.insert(
                    metric.to_string(),
                    series.get_daily_series(metric, &subject, days)?,
                );
            }
            Ok((changes, daily))
        })
        .await?;

        Ok(GrowthReport {
            username: username.to_string(),
            days,
            changes,
            daily,
        })
    }
}
