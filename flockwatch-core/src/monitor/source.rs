use std::collections::BTreeSet;

use async_trait::async_trait;
use tracing::{info, warn};

use super::error::MonitorResult;
use super::models::{MonitorNotification, PostStats, ProfileStats};

/// Scrapes the follower list of an account.
#[async_trait]
pub trait FollowerSource: Send + Sync {
    async fn fetch_followers(&self, username: &str) -> MonitorResult<BTreeSet<String>>;
}

#[async_trait]
pub trait ProfileSource: Send + Sync {
    async fn fetch_profile(&self, username: &str) -> MonitorResult<ProfileStats>;
}

#[async_trait]
pub trait EngagementSource: Send + Sync {
    async fn fetch_recent_posts(&self, username: &str, limit: usize)
        -> MonitorResult<Vec<PostStats>>;
}

/// Receives reports produced by the monitors.
#[async_trait]
pub trait ReportSink: Send + Sync {
    async fn deliver(&self, notification: &MonitorNotification) -> MonitorResult<()>;
}

/// Writes notifications to the tracing subscriber.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogReportSink;

#[async_trait]
impl ReportSink for LogReportSink {
    async fn deliver(&self, notification: &MonitorNotification) -> MonitorResult<()> {
        match notification {
            MonitorNotification::Followers(report) if report.has_unfollowers() => {
                warn!(
                    subject = %report.subject,
                    unfollowers = report.unfollowers.len(),
                    net_change = report.net_change,
                    "{notification}"
                );
            }
            _ => info!(subject = %notification.subject(), "{notification}"),
        }
        Ok(())
    }
}
