use std::collections::BTreeSet;
use std::path::Path;

use chrono::{Duration, Utc};
use flockwatch_core::{RetentionPolicy, SqliteSnapshotStore};
use tempfile::TempDir;

fn temp_store(dir: &Path) -> SqliteSnapshotStore {
    let store = SqliteSnapshotStore::builder()
        .path(dir.join("snapshots.sqlite"))
        .create_if_missing(true)
        .build()
        .expect("create store");
    store.initialize().expect("initialize store");
    store
}

fn set(items: &[&str]) -> BTreeSet<String> {
    items.iter().map(|item| item.to_string()).collect()
}

#[test]
fn compare_reports_added_and_removed() {
    let dir = TempDir::new().unwrap();
    let store = temp_store(dir.path());
    store
        .save_snapshot("followers", "alice", &set(&["a", "b", "c"]))
        .unwrap();
    store
        .save_snapshot("followers", "alice", &set(&["a", "b", "d"]))
        .unwrap();

    let diff = store.compare_snapshots("followers", "alice").unwrap();
    assert_eq!(diff.added, set(&["d"]));
    assert_eq!(diff.removed, set(&["c"]));
}

#[test]
fn compare_with_fewer_than_two_snapshots_is_empty() {
    let dir = TempDir::new().unwrap();
    let store = temp_store(dir.path());
    assert!(store.compare_snapshots("followers", "alice").unwrap().is_empty());

    store
        .save_snapshot("followers", "alice", &set(&["a"]))
        .unwrap();
    assert!(store.compare_snapshots("followers", "alice").unwrap().is_empty());
}

#[test]
fn latest_snapshot_is_scoped_by_type_and_subject() {
    let dir = TempDir::new().unwrap();
    let store = temp_store(dir.path());
    assert_eq!(store.load_latest_snapshot("followers", "alice").unwrap(), None);

    store
        .save_snapshot("followers", "alice", &set(&["a", "b"]))
        .unwrap();
    store
        .save_snapshot("following", "alice", &set(&["z"]))
        .unwrap();
    store
        .save_snapshot("followers", "bob", &set(&["q"]))
        .unwrap();

    let latest = store.load_latest_snapshot("followers", "alice").unwrap();
    assert_eq!(latest, Some(set(&["a", "b"])));
}

#[test]
fn same_timestamp_prefers_last_inserted() {
    let dir = TempDir::new().unwrap();
    let store = temp_store(dir.path());
    let at = Utc::now();
    store
        .save_snapshot_at("followers", "alice", &set(&["first"]), at)
        .unwrap();
    store
        .save_snapshot_at("followers", "alice", &set(&["second"]), at)
        .unwrap();

    let latest = store.load_latest_snapshot("followers", "alice").unwrap();
    assert_eq!(latest, Some(set(&["second"])));
}

#[test]
fn metadata_lists_newest_first() {
    let dir = TempDir::new().unwrap();
    let store = temp_store(dir.path());
    let start = Utc::now() - Duration::hours(3);
    let sizes = [
        set(&["a"]),
        set(&["a", "b"]),
        set(&["a", "b", "c"]),
    ];
    for (offset, members) in sizes.iter().enumerate() {
        store
            .save_snapshot_at(
                "followers",
                "alice",
                members,
                start + Duration::hours(offset as i64),
            )
            .unwrap();
    }

    let history = store.get_snapshot_metadata("followers", "alice", 10).unwrap();
    let counts: Vec<usize> = history.iter().map(|entry| entry.member_count).collect();
    assert_eq!(counts, vec![3, 2, 1]);
    assert!(history[0].captured_at > history[1].captured_at);
    assert_ne!(history[0].digest, history[1].digest);

    let limited = store.get_snapshot_metadata("followers", "alice", 1).unwrap();
    assert_eq!(limited.len(), 1);
    assert_eq!(limited[0].member_count, 3);
}

#[test]
fn empty_member_set_round_trips() {
    let dir = TempDir::new().unwrap();
    let store = temp_store(dir.path());
    let metadata = store
        .save_snapshot("followers", "ghost", &BTreeSet::new())
        .unwrap();
    assert_eq!(metadata.member_count, 0);
    assert_eq!(
        store.load_latest_snapshot("followers", "ghost").unwrap(),
        Some(BTreeSet::new())
    );
}

#[test]
fn prune_keeps_newest_and_applies_count_and_age() {
    let dir = TempDir::new().unwrap();
    let store = temp_store(dir.path());
    let now = Utc::now();
    for days_ago in [40, 30, 20, 10, 0] {
        store
            .save_snapshot_at(
                "followers",
                "alice",
                &set(&["a"]),
                now - Duration::days(days_ago),
            )
            .unwrap();
    }

    let by_count = RetentionPolicy {
        max_count: Some(4),
        max_age_days: None,
    };
    assert_eq!(store.prune_at("followers", "alice", &by_count, now).unwrap(), 1);
    assert_eq!(store.count("followers", "alice").unwrap(), 4);

    let by_age = RetentionPolicy {
        max_count: None,
        max_age_days: Some(15),
    };
    assert_eq!(store.prune_at("followers", "alice", &by_age, now).unwrap(), 2);
    assert_eq!(store.count("followers", "alice").unwrap(), 2);

    let everything_old = RetentionPolicy {
        max_count: None,
        max_age_days: Some(0),
    };
    let later = now + Duration::days(1);
    store
        .prune_at("followers", "alice", &everything_old, later)
        .unwrap();
    assert_eq!(store.count("followers", "alice").unwrap(), 1);
}

#[test]
fn list_keys_groups_by_type_and_subject() {
    let dir = TempDir::new().unwrap();
    let store = temp_store(dir.path());
    store.save_snapshot("followers", "alice", &set(&["a"])).unwrap();
    store.save_snapshot("followers", "alice", &set(&["b"])).unwrap();
    store.save_snapshot("followers", "bob", &set(&["c"])).unwrap();

    let keys = store.list_keys().unwrap();
    assert_eq!(keys.len(), 2);
    assert_eq!(keys[0].subject, "alice");
    assert_eq!(keys[0].snapshots, 2);
    assert_eq!(keys[1].subject, "bob");
    assert_eq!(keys[1].snapshots, 1);
}

#[test]
fn reopened_store_sees_saved_snapshots() {
    let dir = TempDir::new().unwrap();
    temp_store(dir.path())
        .save_snapshot("followers", "alice", &set(&["a"]))
        .unwrap();

    let reader = SqliteSnapshotStore::builder()
        .path(dir.path().join("snapshots.sqlite"))
        .create_if_missing(false)
        .build()
        .unwrap();
    assert_eq!(reader.count("followers", "alice").unwrap(), 1);
}

#[test]
fn prune_with_unbounded_age_keeps_everything() {
    let dir = TempDir::new().unwrap();
    let store = temp_store(dir.path());
    let now = Utc::now();
    for days_ago in [900, 30, 0] {
        store
            .save_snapshot_at(
                "followers",
                "alice",
                &set(&["a"]),
                now - Duration::days(days_ago),
            )
            .unwrap();
    }

    let policy = RetentionPolicy {
        max_count: None,
        max_age_days: Some(u32::MAX),
    };
    assert_eq!(store.prune_all(&policy).unwrap(), 0);
    assert_eq!(store.prune("followers", "alice", &policy).unwrap(), 0);
    assert_eq!(store.count("followers", "alice").unwrap(), 3);
}
