use std::path::Path;

use chrono::{Duration, TimeZone, Utc};
use flockwatch_core::{DataPoint, SqliteTimeSeriesStore};
use tempfile::TempDir;

fn temp_store(dir: &Path) -> SqliteTimeSeriesStore {
    let store = SqliteTimeSeriesStore::builder()
        .path(dir.join("timeseries.sqlite"))
        .create_if_missing(true)
        .build()
        .expect("create store");
    store.initialize().expect("initialize store");
    store
}

#[test]
fn change_over_period_reports_absolute_and_percentage() {
    let dir = TempDir::new().unwrap();
    let store = temp_store(dir.path());
    let now = Utc::now();
    store
        .record("followers_count", "alice", 100.0, now - Duration::days(8))
        .unwrap();
    store
        .record("followers_count", "alice", 150.0, now - Duration::minutes(1))
        .unwrap();

    let change = store
        .get_change("followers_count", "alice", 7)
        .unwrap()
        .expect("anchor exists");
    assert_eq!(change.old_value, 100.0);
    assert_eq!(change.new_value, 150.0);
    assert_eq!(change.change, 50.0);
    assert_eq!(change.change_percentage, 50.0);
}

#[test]
fn change_from_zero_has_zero_percentage() {
    let dir = TempDir::new().unwrap();
    let store = temp_store(dir.path());
    let now = Utc::now();
    store
        .record("followers_count", "alice", 0.0, now - Duration::days(10))
        .unwrap();
    store
        .record("followers_count", "alice", 12.0, now - Duration::minutes(1))
        .unwrap();

    let change = store.get_change("followers_count", "alice", 7).unwrap().unwrap();
    assert_eq!(change.change, 12.0);
    assert_eq!(change.change_percentage, 0.0);
}

#[test]
fn change_without_anchor_is_none() {
    let dir = TempDir::new().unwrap();
    let store = temp_store(dir.path());
    assert!(store.get_change("followers_count", "alice", 7).unwrap().is_none());

    store
        .record("followers_count", "alice", 10.0, Utc::now() - Duration::days(1))
        .unwrap();
    assert!(store.get_change("followers_count", "alice", 7).unwrap().is_none());
}

#[test]
fn series_excludes_points_outside_window() {
    let dir = TempDir::new().unwrap();
    let store = temp_store(dir.path());
    let now = Utc::now();
    let points = vec![
        DataPoint::new("followers_count", "alice", 1.0, now - Duration::days(9)),
        DataPoint::new("followers_count", "alice", 3.0, now - Duration::days(1)),
        DataPoint::new("followers_count", "alice", 2.0, now - Duration::days(5)),
        DataPoint::new("followers_count", "bob", 9.0, now - Duration::days(1)),
    ];
    assert_eq!(store.record_many(&points).unwrap(), 4);

    let series = store.get_series("followers_count", "alice", 7).unwrap();
    let values: Vec<f64> = series.iter().map(|point| point.value).collect();
    assert_eq!(values, vec![2.0, 3.0]);
    assert!(series[0].timestamp < series[1].timestamp);
}

#[test]
fn latest_returns_most_recent_value() {
    let dir = TempDir::new().unwrap();
    let store = temp_store(dir.path());
    assert!(store.get_latest("tweet_count", "alice").unwrap().is_none());

    let now = Utc::now();
    store
        .record("tweet_count", "alice", 5.0, now - Duration::hours(2))
        .unwrap();
    store
        .record("tweet_count", "alice", 7.0, now - Duration::hours(1))
        .unwrap();
    let latest = store.get_latest("tweet_count", "alice").unwrap().unwrap();
    assert_eq!(latest.value, 7.0);
}

#[test]
fn daily_series_keeps_last_value_of_each_day() {
    let dir = TempDir::new().unwrap();
    let store = temp_store(dir.path());
    let today = Utc::now().date_naive();
    let yesterday = today - Duration::days(1);
    let at = |date: chrono::NaiveDate, hour: u32| {
        Utc.from_utc_datetime(&date.and_hms_opt(hour, 0, 0).unwrap())
    };
    store
        .record("followers_count", "alice", 10.0, at(yesterday - Duration::days(1), 0))
        .unwrap();
    store
        .record("followers_count", "alice", 11.0, at(yesterday, 1))
        .unwrap();
    store
        .record("followers_count", "alice", 12.0, at(yesterday, 2))
        .unwrap();
    store
        .record("followers_count", "alice", 13.0, at(yesterday, 3))
        .unwrap();

    let daily = store.get_daily_series("followers_count", "alice", 7).unwrap();
    assert_eq!(daily.len(), 2);
    assert_eq!(daily[0].value, 10.0);
    assert_eq!(daily[1].date, yesterday);
    assert_eq!(daily[1].value, 13.0);
}

#[test]
fn prune_removes_points_past_horizon() {
    let dir = TempDir::new().unwrap();
    let store = temp_store(dir.path());
    let now = Utc::now();
    store
        .record("likes_count", "alice", 1.0, now - Duration::days(400))
        .unwrap();
    store
        .record("likes_count", "alice", 2.0, now - Duration::days(10))
        .unwrap();

    assert_eq!(store.prune_older_than(365).unwrap(), 1);
    assert_eq!(store.list_metrics("alice").unwrap(), vec!["likes_count"]);
    assert_eq!(store.get_series("likes_count", "alice", 30).unwrap().len(), 1);
}

#[test]
fn huge_windows_cover_all_history() {
    let dir = TempDir::new().unwrap();
    let store = temp_store(dir.path());
    let now = Utc::now();
    store
        .record("followers_count", "alice", 1.0, now - Duration::days(3_000))
        .unwrap();
    store
        .record("followers_count", "alice", 2.0, now - Duration::minutes(1))
        .unwrap();

    let series = store
        .get_series("followers_count", "alice", u32::MAX)
        .unwrap();
    assert_eq!(series.len(), 2);
    assert_eq!(
        store
            .get_daily_series("followers_count", "alice", u32::MAX)
            .unwrap()
            .len(),
        2
    );
    // no point predates the window start, so there is nothing to anchor on
    assert!(store
        .get_change("followers_count", "alice", u32::MAX)
        .unwrap()
        .is_none());
    assert_eq!(store.prune_older_than(u32::MAX).unwrap(), 0);
}
