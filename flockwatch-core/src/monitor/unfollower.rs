use std::sync::Arc;

use tracing::{debug, info};

use crate::config::MonitoringSection;
use crate::rate_limit::ActionRateLimiter;
use crate::storage::{RetentionPolicy, SqliteSnapshotStore, SqliteTimeSeriesStore, SnapshotDiff};

use super::error::MonitorResult;
use super::models::{MonitorNotification, UnfollowerReport, FOLLOWERS_COUNT, FOLLOWERS_SNAPSHOT};
use super::source::{FollowerSource, ProfileSource, ReportSink};
use super::{pace_scrape, run_blocking};

/// Compares follower lists across runs and reports who left.
pub struct UnfollowerDetector {
    followers: Arc<dyn FollowerSource>,
    profiles: Arc<dyn ProfileSource>,
    sink: Arc<dyn ReportSink>,
    snapshots: SqliteSnapshotStore,
    series: SqliteTimeSeriesStore,
    retention: RetentionPolicy,
    notify_on_new_followers: bool,
    limiter: Option<Arc<ActionRateLimiter>>,
}

struct Observation {
    previous_count: Option<u64>,
    had_snapshot: bool,
    diff: SnapshotDiff,
}

impl UnfollowerDetector {
    pub fn new(
        followers: Arc<dyn FollowerSource>,
        profiles: Arc<dyn ProfileSource>,
        sink: Arc<dyn ReportSink>,
        snapshots: SqliteSnapshotStore,
        series: SqliteTimeSeriesStore,
    ) -> Self {
        Self {
            followers,
            profiles,
            sink,
            snapshots,
            series,
            retention: RetentionPolicy::default(),
            notify_on_new_followers: false,
            limiter: None,
        }
    }

    /// Snapshot retention and new-follower notification from `[monitoring]`.
    pub fn with_monitoring_config(self, monitoring: &MonitoringSection) -> Self {
        self.with_retention(monitoring.retention_policy())
            .notify_on_new_followers(monitoring.notify_on_new_followers)
    }

    pub fn with_retention(mut self, retention: RetentionPolicy) -> Self {
        self.retention = retention;
        self
    }

    pub fn notify_on_new_followers(mut self, enabled: bool) -> Self {
        self.notify_on_new_followers = enabled;
        self
    }

    pub fn with_rate_limiter(mut self, limiter: Arc<ActionRateLimiter>) -> Self {
        self.limiter = Some(limiter);
        self
    }

    pub async fn check(&self, username: &str) -> MonitorResult<UnfollowerReport> {
        pace_scrape(self.limiter.as_ref()).await?;
        let followers = self.followers.fetch_followers(username).await?;
        pace_scrape(self.limiter.as_ref()).await?;
        let profile = self.profiles.fetch_profile(username).await?;
        let current_count = profile.followers;

        let snapshots = self.snapshots.clone();
        let series = self.series.clone();
        let retention = self.retention;
        let subject = username.to_string();
        let observation = run_blocking(move || {
            let previous = snapshots.load_latest(FOLLOWERS_SNAPSHOT, &subject)?;
            let previous_count = match series.get_latest(FOLLOWERS_COUNT, &subject)? {
                Some(point) => Some(point.value.max(0.0) as u64),
                None => previous.as_ref().map(|snapshot| snapshot.member_count() as u64),
            };

            snapshots.save_snapshot(FOLLOWERS_SNAPSHOT, &subject, &followers)?;
            series.record_now(FOLLOWERS_COUNT, &subject, current_count as f64)?;
            let diff = snapshots.compare_snapshots(FOLLOWERS_SNAPSHOT, &subject)?;
            snapshots.prune(FOLLOWERS_SNAPSHOT, &subject, &retention)?;

            Ok(Observation {
                previous_count,
                had_snapshot: previous.is_some(),
                diff,
            })
        })
        .await?;

        if !observation.had_snapshot {
            info!(subject = username, followers = current_count, "baseline follower snapshot saved");
            return Ok(UnfollowerReport::baseline(username, current_count));
        }

        let report = UnfollowerReport::new(
            username,
            observation.diff.removed,
            observation.diff.added,
            observation.previous_count.unwrap_or(current_count),
            current_count,
        );
        info!(
            subject = username,
            unfollowers = report.unfollowers.len(),
            new_followers = report.new_followers.len(),
            net_change = report.net_change,
            "follower check complete"
        );

        let notify = report.has_unfollowers()
            || (self.notify_on_new_followers && !report.new_followers.is_empty());
        if notify {
            self.sink
                .deliver(&MonitorNotification::Followers(report.clone()))
                .await?;
        } else {
            debug!(subject = username, "no follower changes to report");
        }
        Ok(report)
    }
}
