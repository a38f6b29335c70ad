use std::sync::Arc;

use chrono::Utc;
use tracing::{info, warn};

use crate::config::MonitoringSection;
use crate::rate_limit::ActionRateLimiter;
use crate::storage::{DataPoint, SqliteTimeSeriesStore, StorageResult};

use super::error::MonitorResult;
use super::models::{
    AccountChange, AccountCheck, AccountCycleReport, AccountFailure, AccountSnapshot,
    MonitorNotification, FOLLOWERS_COUNT, FOLLOWING_COUNT, LIKES_COUNT, TWEET_COUNT,
};
use super::source::{ProfileSource, ReportSink};
use super::{pace_scrape, run_blocking};

/// Tracks profile counters for a set of accounts.
pub struct AccountMonitor {
    profiles: Arc<dyn ProfileSource>,
    sink: Arc<dyn ReportSink>,
    series: SqliteTimeSeriesStore,
    retention_days: Option<u32>,
    watch_accounts: Vec<String>,
    limiter: Option<Arc<ActionRateLimiter>>,
}

impl AccountMonitor {
    pub fn new(
        profiles: Arc<dyn ProfileSource>,
        sink: Arc<dyn ReportSink>,
        series: SqliteTimeSeriesStore,
    ) -> Self {
        Self {
            profiles,
            sink,
            series,
            retention_days: None,
            watch_accounts: Vec::new(),
            limiter: None,
        }
    }

    /// Watch list and time series retention from `[monitoring]`.
    pub fn with_monitoring_config(mut self, monitoring: &MonitoringSection) -> Self {
        self.watch_accounts = monitoring.watch_accounts.clone();
        self.with_retention_days(monitoring.timeseries_retention_days)
    }

    /// Points older than `days` are pruned at the end of each `check_all`.
    pub fn with_retention_days(mut self, days: Option<u32>) -> Self {
        self.retention_days = days;
        self
    }

    pub fn with_rate_limiter(mut self, limiter: Arc<ActionRateLimiter>) -> Self {
        self.limiter = Some(limiter);
        self
    }

    pub fn watch_accounts(&self) -> &[String] {
        &self.watch_accounts
    }

    pub async fn check(&self, username: &str) -> MonitorResult<AccountCheck> {
        pace_scrape(self.limiter.as_ref()).await?;
        let profile = self.profiles.fetch_profile(username).await?;
        let now = Utc::now();
        let mut snapshot = AccountSnapshot::from_profile(&profile, now);
        snapshot.username = username.to_string();

        let series = self.series.clone();
        let current = snapshot.clone();
        let previous = run_blocking(move || {
            let previous = load_previous(&series, &current)?;
            let points: Vec<DataPoint> = current
                .metrics()
                .iter()
                .map(|(metric, value)| {
                    DataPoint::new(*metric, current.username.as_str(), *value as f64, now)
                })
                .collect();
            series.record_many(&points)?;
            Ok(previous)
        })
        .await?;

        let change = previous.map(|previous| AccountChange::between(previous, snapshot.clone()));
        if let Some(change) = change.as_ref().filter(|change| change.has_changes()) {
            info!(
                subject = username,
                followers = change.followers_change,
                following = change.following_change,
                tweets = change.tweets_change,
                "account counters changed"
            );
            self.sink
                .deliver(&MonitorNotification::AccountChanged(change.clone()))
                .await?;
        }
        Ok(AccountCheck { snapshot, change })
    }

    /// One `check_all` cycle over the configured watch list.
    pub async fn check_watched(&self) -> AccountCycleReport {
        self.check_all(&self.watch_accounts).await
    }

    /// Checks every account in turn. One failing account does not stop the cycle.
    pub async fn check_all(&self, usernames: &[String]) -> AccountCycleReport {
        let mut report = AccountCycleReport::default();
        for username in usernames {
            match self.check(username).await {
                Ok(check) => report.checked.push(check),
                Err(err) => {
                    warn!(subject = %username, error = %err, "account check failed");
                    report.failures.push(AccountFailure {
                        username: username.clone(),
                        error: err.to_string(),
                    });
                }
            }
        }

        if let Some(days) = self.retention_days {
            let series = self.series.clone();
            if let Err(err) = run_blocking(move || series.prune_older_than(days)).await {
                warn!(error = %err, "time series pruning failed");
            }
        }

        info!(
            checked = report.checked.len(),
            changed = report.changes().count(),
            failed = report.failures.len(),
            "account monitoring cycle complete"
        );
        report
    }
}

fn load_previous(
    series: &SqliteTimeSeriesStore,
    current: &AccountSnapshot,
) -> StorageResult<Option<AccountSnapshot>> {
    let username = current.username.as_str();
    let Some(followers) = series.get_latest(FOLLOWERS_COUNT, username)? else {
        return Ok(None);
    };
    let value_of = |metric: &str| -> StorageResult<u64> {
        Ok(series
            .get_latest(metric, username)?
            .map(|point| point.value.max(0.0) as u64)
            .unwrap_or(0))
    };
    Ok(Some(AccountSnapshot {
        username: username.to_string(),
        captured_at: followers.timestamp,
        followers: followers.value.max(0.0) as u64,
        following: value_of(FOLLOWING_COUNT)?,
        tweets: value_of(TWEET_COUNT)?,
        likes: value_of(LIKES_COUNT)?,
    }))
}
