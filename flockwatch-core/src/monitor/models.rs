use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::storage::{DailyValue, MetricChange};

pub const FOLLOWERS_SNAPSHOT: &str = "followers";

pub const FOLLOWERS_COUNT: &str = "followers_count";
pub const FOLLOWING_COUNT: &str = "following_count";
pub const TWEET_COUNT: &str = "tweet_count";
pub const LIKES_COUNT: &str = "likes_count";

pub const ENGAGEMENT_RATE: &str = "engagement_rate";
pub const AVG_LIKES: &str = "avg_likes";
pub const AVG_RETWEETS: &str = "avg_retweets";
pub const AVG_REPLIES: &str = "avg_replies";
pub const AVG_VIEWS: &str = "avg_views";

/// Profile counters as reported by the platform.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileStats {
    pub username: String,
    pub followers: u64,
    pub following: u64,
    pub tweets: u64,
    pub likes: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostStats {
    pub id: String,
    pub likes: u64,
    pub retweets: u64,
    pub replies: u64,
    pub views: u64,
    pub posted_at: Option<DateTime<Utc>>,
}

/// Outcome of one follower check.
///
/// `net_change` comes from the reported follower counts, so it can differ
/// from `new_followers.len() - unfollowers.len()` when the scraped list is
/// partial.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnfollowerReport {
    pub subject: String,
    pub detected_at: DateTime<Utc>,
    pub unfollowers: BTreeSet<String>,
    pub new_followers: BTreeSet<String>,
    pub previous_count: u64,
    pub current_count: u64,
    pub net_change: i64,
    /// First observation of this subject; nothing to diff against.
    pub baseline: bool,
}

impl UnfollowerReport {
    pub fn new(
        subject: impl Into<String>,
        unfollowers: BTreeSet<String>,
        new_followers: BTreeSet<String>,
        previous_count: u64,
        current_count: u64,
    ) -> Self {
        Self {
            subject: subject.into(),
            detected_at: Utc::now(),
            unfollowers,
            new_followers,
            previous_count,
            current_count,
            net_change: signed_delta(previous_count, current_count),
            baseline: false,
        }
    }

    pub fn baseline(subject: impl Into<String>, current_count: u64) -> Self {
        let mut report = Self::new(
            subject,
            BTreeSet::new(),
            BTreeSet::new(),
            current_count,
            current_count,
        );
        report.baseline = true;
        report
    }

    pub fn has_unfollowers(&self) -> bool {
        !self.unfollowers.is_empty()
    }
}

/// Profile counters at one instant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountSnapshot {
    pub username: String,
    pub captured_at: DateTime<Utc>,
    pub followers: u64,
    pub following: u64,
    pub tweets: u64,
    pub likes: u64,
}

impl AccountSnapshot {
    pub fn from_profile(profile: &ProfileStats, captured_at: DateTime<Utc>) -> Self {
        Self {
            username: profile.username.clone(),
            captured_at,
            followers: profile.followers,
            following: profile.following,
            tweets: profile.tweets,
            likes: profile.likes,
        }
    }

    pub(crate) fn metrics(&self) -> [(&'static str, u64); 4] {
        [
            (FOLLOWERS_COUNT, self.followers),
            (FOLLOWING_COUNT, self.following),
            (TWEET_COUNT, self.tweets),
            (LIKES_COUNT, self.likes),
        ]
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountChange {
    pub previous: AccountSnapshot,
    pub current: AccountSnapshot,
    pub followers_change: i64,
    pub following_change: i64,
    pub tweets_change: i64,
    pub likes_change: i64,
}

impl AccountChange {
    pub fn between(previous: AccountSnapshot, current: AccountSnapshot) -> Self {
        Self {
            followers_change: signed_delta(previous.followers, current.followers),
            following_change: signed_delta(previous.following, current.following),
            tweets_change: signed_delta(previous.tweets, current.tweets),
            likes_change: signed_delta(previous.likes, current.likes),
            previous,
            current,
        }
    }

    pub fn username(&self) -> &str {
        &self.current.username
    }

    pub fn has_changes(&self) -> bool {
        self.followers_change != 0
            || self.following_change != 0
            || self.tweets_change != 0
            || self.likes_change != 0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountCheck {
    pub snapshot: AccountSnapshot,
    /// `None` on the first observation.
    pub change: Option<AccountChange>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountFailure {
    pub username: String,
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AccountCycleReport {
    pub checked: Vec<AccountCheck>,
    pub failures: Vec<AccountFailure>,
}

impl AccountCycleReport {
    pub fn changes(&self) -> impl Iterator<Item = &AccountChange> {
        self.checked
            .iter()
            .filter_map(|check| check.change.as_ref())
            .filter(|change| change.has_changes())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngagementSummary {
    pub username: String,
    pub posts_sampled: usize,
    pub followers: u64,
    pub total_likes: u64,
    pub total_retweets: u64,
    pub total_replies: u64,
    pub total_views: u64,
    pub avg_likes: f64,
    pub avg_retweets: f64,
    pub avg_replies: f64,
    pub avg_views: f64,
    /// Interactions per post as a percentage of followers.
    pub engagement_rate: f64,
}

impl EngagementSummary {
    pub fn from_posts(username: impl Into<String>, posts: &[PostStats], followers: u64) -> Self {
        let total_likes: u64 = posts.iter().map(|post| post.likes).sum();
        let total_retweets: u64 = posts.iter().map(|post| post.retweets).sum();
        let total_replies: u64 = posts.iter().map(|post| post.replies).sum();
        let total_views: u64 = posts.iter().map(|post| post.views).sum();

        let average = |total: u64| {
            if posts.is_empty() {
                0.0
            } else {
                total as f64 / posts.len() as f64
            }
        };
        let interactions = (total_likes + total_retweets + total_replies) as f64;
        let engagement_rate = if posts.is_empty() || followers == 0 {
            0.0
        } else {
            interactions / posts.len() as f64 / followers as f64 * 100.0
        };

        Self {
            username: username.into(),
            posts_sampled: posts.len(),
            followers,
            total_likes,
            total_retweets,
            total_replies,
            total_views,
            avg_likes: average(total_likes),
            avg_retweets: average(total_retweets),
            avg_replies: average(total_replies),
            avg_views: average(total_views),
            engagement_rate,
        }
    }

    pub(crate) fn metrics(&self) -> [(&'static str, f64); 5] {
        [
            (ENGAGEMENT_RATE, self.engagement_rate),
            (AVG_LIKES, self.avg_likes),
            (AVG_RETWEETS, self.avg_retweets),
            (AVG_REPLIES, self.avg_replies),
            (AVG_VIEWS, self.avg_views),
        ]
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GrowthReport {
    pub username: String,
    pub days: u32,
    /// Metrics without a value at the start of the window are absent.
    pub changes: BTreeMap<String, MetricChange>,
    pub daily: BTreeMap<String, Vec<DailyValue>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MonitorNotification {
    Followers(UnfollowerReport),
    AccountChanged(AccountChange),
}

impl MonitorNotification {
    pub fn subject(&self) -> &str {
        match self {
            MonitorNotification::Followers(report) => &report.subject,
            MonitorNotification::AccountChanged(change) => change.username(),
        }
    }
}

impl fmt::Display for MonitorNotification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MonitorNotification::Followers(report) => write!(
                f,
                "@{}: {} unfollowed, {} new, followers {} -> {} ({:+})",
                report.subject,
                report.unfollowers.len(),
                report.new_followers.len(),
                report.previous_count,
                report.current_count,
                report.net_change,
            ),
            MonitorNotification::AccountChanged(change) => write!(
                f,
                "@{}: followers {:+}, following {:+}, tweets {:+}, likes {:+}",
                change.username(),
                change.followers_change,
                change.following_change,
                change.tweets_change,
                change.likes_change,
            ),
        }
    }
}

fn signed_delta(previous: u64, current: u64) -> i64 {
    current as i64 - previous as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(items: &[&str]) -> BTreeSet<String> {
        items.iter().map(|item| item.to_string()).collect()
    }

    #[test]
    fn net_change_uses_reported_counts() {
        let report = UnfollowerReport::new("alice", set(&["x", "y"]), set(&["z"]), 1000, 1010);
        assert_eq!(report.net_change, 10);
        assert!(report.has_unfollowers());
        assert!(!report.baseline);
    }

    #[test]
    fn engagement_rate_is_per_post_and_follower() {
        let posts = vec![
            PostStats {
                id: "1".into(),
                likes: 10,
                retweets: 5,
                replies: 5,
                views: 400,
                posted_at: None,
            },
            PostStats {
                id: "2".into(),
                likes: 20,
                retweets: 0,
                replies: 0,
                views: 600,
                posted_at: None,
            },
        ];
        let summary = EngagementSummary::from_posts("alice", &posts, 1000);
        assert_eq!(summary.total_likes, 30);
        assert_eq!(summary.avg_views, 500.0);
        assert!((summary.engagement_rate - 2.0).abs() < 1e-9);
    }

    #[test]
    fn engagement_rate_is_zero_without_followers_or_posts() {
        let posts = vec![PostStats {
            likes: 3,
            ..PostStats::default()
        }];
        assert_eq!(EngagementSummary::from_posts("a", &posts, 0).engagement_rate, 0.0);
        let empty = EngagementSummary::from_posts("a", &[], 100);
        assert_eq!(empty.engagement_rate, 0.0);
        assert_eq!(empty.avg_likes, 0.0);
    }

    #[test]
    fn account_change_detects_any_counter() {
        let now = Utc::now();
        let base = ProfileStats {
            username: "alice".into(),
            followers: 10,
            following: 5,
            tweets: 3,
            likes: 1,
        };
        let previous = AccountSnapshot::from_profile(&base, now);
        let unchanged = AccountChange::between(previous.clone(), previous.clone());
        assert!(!unchanged.has_changes());

        let mut current = previous.clone();
        current.likes = 0;
        let change = AccountChange::between(previous, current);
        assert_eq!(change.likes_change, -1);
        assert!(change.has_changes());
    }
}
