use std::collections::BTreeSet;

use chrono::{DateTime, Duration, NaiveDate, TimeZone, Utc};
use rusqlite::types::Type;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// A point-in-time membership set, e.g. the followers of one account.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: i64,
    pub snapshot_type: String,
    pub subject: String,
    pub captured_at: DateTime<Utc>,
    pub members: BTreeSet<String>,
}

impl Snapshot {
    pub fn member_count(&self) -> usize {
        self.members.len()
    }
}

/// Header of a stored snapshot, without its member set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotMetadata {
    pub id: i64,
    pub snapshot_type: String,
    pub subject: String,
    pub captured_at: DateTime<Utc>,
    pub member_count: usize,
    pub digest: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotDiff {
    /// In the newer snapshot only.
    pub added: BTreeSet<String>,
    /// In the older snapshot only.
    pub removed: BTreeSet<String>,
}

impl SnapshotDiff {
    pub fn between(older: &BTreeSet<String>, newer: &BTreeSet<String>) -> Self {
        Self {
            added: newer.difference(older).cloned().collect(),
            removed: older.difference(newer).cloned().collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotKey {
    pub snapshot_type: String,
    pub subject: String,
    pub snapshots: usize,
    pub latest_at: DateTime<Utc>,
}

/// Snapshot retention. The newest snapshot of a key is always kept.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionPolicy {
    pub max_count: Option<usize>,
    pub max_age_days: Option<u32>,
}

impl RetentionPolicy {
    pub fn is_unbounded(&self) -> bool {
        self.max_count.is_none() && self.max_age_days.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataPoint {
    pub metric: String,
    pub subject: String,
    pub timestamp: DateTime<Utc>,
    pub value: f64,
}

impl DataPoint {
    pub fn new(
        metric: impl Into<String>,
        subject: impl Into<String>,
        value: f64,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            metric: metric.into(),
            subject: subject.into(),
            timestamp,
            value,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricChange {
    pub metric: String,
    pub subject: String,
    pub days: u32,
    pub old_value: f64,
    pub new_value: f64,
    pub old_timestamp: DateTime<Utc>,
    pub new_timestamp: DateTime<Utc>,
    pub change: f64,
    pub change_percentage: f64,
}

impl MetricChange {
    pub(crate) fn from_points(days: u32, old: &DataPoint, new: &DataPoint) -> Self {
        let change = new.value - old.value;
        let change_percentage = if old.value == 0.0 {
            0.0
        } else {
            change / old.value * 100.0
        };
        Self {
            metric: new.metric.clone(),
            subject: new.subject.clone(),
            days,
            old_value: old.value,
            new_value: new.value,
            old_timestamp: old.timestamp,
            new_timestamp: new.timestamp,
            change,
            change_percentage,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyValue {
    pub date: NaiveDate,
    pub value: f64,
}

pub(crate) fn to_millis(timestamp: DateTime<Utc>) -> i64 {
    timestamp.timestamp_millis()
}

pub(crate) fn from_millis(column: usize, millis: i64) -> rusqlite::Result<DateTime<Utc>> {
    Utc.timestamp_millis_opt(millis).single().ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            column,
            Type::Integer,
            format!("timestamp out of range: {millis}").into(),
        )
    })
}

/// `days` before `now`, saturating at the earliest representable instant.
pub(crate) fn days_before(now: DateTime<Utc>, days: u32) -> DateTime<Utc> {
    Duration::try_days(i64::from(days))
        .and_then(|span| now.checked_sub_signed(span))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Each member is length-prefixed so no two distinct sets share a digest.
pub(crate) fn members_digest(members: &BTreeSet<String>) -> String {
    let mut hasher = Sha256::new();
    for member in members {
        hasher.update((member.len() as u64).to_le_bytes());
        hasher.update(member.as_bytes());
    }
    hex::encode(hasher.finalize())
}
