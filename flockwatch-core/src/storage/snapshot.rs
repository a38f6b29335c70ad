use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::debug;

use crate::sqlite::SqliteHandle;

use super::models::{
    days_before, from_millis, members_digest, to_millis, RetentionPolicy, Snapshot, SnapshotDiff,
    SnapshotKey, SnapshotMetadata,
};
use super::{StorageError, StorageResult};

const SNAPSHOT_SCHEMA: &str = include_str!("../../../sql/snapshots.sql");

#[derive(Debug, Clone)]
pub struct SqliteSnapshotStoreBuilder {
    path: Option<PathBuf>,
    read_only: bool,
    create_if_missing: bool,
}

impl Default for SqliteSnapshotStoreBuilder {
    fn default() -> Self {
        Self {
            path: None,
            read_only: false,
            create_if_missing: true,
        }
    }
}

impl SqliteSnapshotStoreBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn path(mut self, path: impl AsRef<Path>) -> Self {
        self.path = Some(path.as_ref().to_path_buf());
        self
    }

    pub fn read_only(mut self, value: bool) -> Self {
        self.read_only = value;
        self
    }

    pub fn create_if_missing(mut self, value: bool) -> Self {
        self.create_if_missing = value;
        self
    }

    pub fn build(self) -> StorageResult<SqliteSnapshotStore> {
        let path = self.path.ok_or(StorageError::MissingStore)?;
        Ok(SqliteSnapshotStore {
            handle: SqliteHandle::new(path, self.read_only, self.create_if_missing),
        })
    }
}

/// Append-only membership snapshots keyed by (snapshot type, subject).
#[derive(Debug, Clone)]
pub struct SqliteSnapshotStore {
    handle: SqliteHandle,
}

impl SqliteSnapshotStore {
    pub fn builder() -> SqliteSnapshotStoreBuilder {
        SqliteSnapshotStoreBuilder::new()
    }

    pub fn new(path: impl AsRef<Path>) -> StorageResult<Self> {
        SqliteSnapshotStoreBuilder::new().path(path).build()
    }

    pub fn path(&self) -> &Path {
        self.handle.path()
    }

    fn open(&self) -> StorageResult<Connection> {
        self.handle
            .open()
            .map_err(|source| StorageError::OpenDatabase {
                path: self.handle.path().to_path_buf(),
                source,
            })
    }

    pub fn initialize(&self) -> StorageResult<()> {
        let conn = self.open()?;
        conn.execute_batch(SNAPSHOT_SCHEMA)?;
        Ok(())
    }

    pub fn save_snapshot(
        &self,
        snapshot_type: &str,
        subject: &str,
        members: &BTreeSet<String>,
    ) -> StorageResult<SnapshotMetadata> {
        self.save_snapshot_at(snapshot_type, subject, members, Utc::now())
    }

    pub fn save_snapshot_at(
        &self,
        snapshot_type: &str,
        subject: &str,
        members: &BTreeSet<String>,
        captured_at: DateTime<Utc>,
    ) -> StorageResult<SnapshotMetadata> {
        let payload = serde_json::to_string(members)?;
        let digest = members_digest(members);
        let mut conn = self.open()?;
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO snapshots (
                snapshot_type, subject, captured_at_ms, member_count, digest, members
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                snapshot_type,
                subject,
                to_millis(captured_at),
                members.len() as i64,
                &digest,
                payload,
            ],
        )?;
        let id = tx.last_insert_rowid();
        tx.commit()?;
        debug!(
            snapshot_type,
            subject,
            members = members.len(),
            id,
            "snapshot saved"
        );
        Ok(SnapshotMetadata {
            id,
            snapshot_type: snapshot_type.to_string(),
            subject: subject.to_string(),
            captured_at,
            member_count: members.len(),
            digest,
        })
    }

    pub fn load_latest_snapshot(
        &self,
        snapshot_type: &str,
        subject: &str,
    ) -> StorageResult<Option<BTreeSet<String>>> {
        Ok(self
            .load_latest(snapshot_type, subject)?
            .map(|snapshot| snapshot.members))
    }

    pub fn load_latest(&self, snapshot_type: &str, subject: &str) -> StorageResult<Option<Snapshot>> {
        let conn = self.open()?;
        let snapshot = conn
            .query_row(
                "SELECT id, snapshot_type, subject, captured_at_ms, members
                 FROM snapshots
                 WHERE snapshot_type = ?1 AND subject = ?2
                 ORDER BY captured_at_ms DESC, id DESC
                 LIMIT 1",
                params![snapshot_type, subject],
                snapshot_from_row,
            )
            .optional()?;
        Ok(snapshot)
    }

    pub fn load_recent(
        &self,
        snapshot_type: &str,
        subject: &str,
        limit: usize,
    ) -> StorageResult<Vec<Snapshot>> {
        let conn = self.open()?;
        let mut stmt = conn.prepare(
            "SELECT id, snapshot_type, subject, captured_at_ms, members
             FROM snapshots
             WHERE snapshot_type = ?1 AND subject = ?2
             ORDER BY captured_at_ms DESC, id DESC
             LIMIT ?3",
        )?;
        let rows = stmt
            .query_map(
                params![snapshot_type, subject, limit as i64],
                snapshot_from_row,
            )?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Diff of the two most recent snapshots. Empty when fewer than two exist.
    pub fn compare_snapshots(
        &self,
        snapshot_type: &str,
        subject: &str,
    ) -> StorageResult<SnapshotDiff> {
        let recent = self.load_recent(snapshot_type, subject, 2)?;
        match recent.as_slice() {
            [newer, older] => Ok(SnapshotDiff::between(&older.members, &newer.members)),
            _ => Ok(SnapshotDiff::default()),
        }
    }

    /// Newest-first headers; member payloads are never read.
    pub fn get_snapshot_metadata(
        &self,
        snapshot_type: &str,
        subject: &str,
        limit: usize,
    ) -> StorageResult<Vec<SnapshotMetadata>> {
        let conn = self.open()?;
        let mut stmt = conn.prepare(
            "SELECT id, snapshot_type, subject, captured_at_ms, member_count, digest
             FROM snapshots
             WHERE snapshot_type = ?1 AND subject = ?2
             ORDER BY captured_at_ms DESC, id DESC
             LIMIT ?3",
        )?;
        let rows = stmt
            .query_map(params![snapshot_type, subject, limit as i64], |row| {
                Ok(SnapshotMetadata {
                    id: row.get(0)?,
                    snapshot_type: row.get(1)?,
                    subject: row.get(2)?,
                    captured_at: from_millis(3, row.get(3)?)?,
                    member_count: row.get::<_, i64>(4)? as usize,
                    digest: row.get(5)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn count(&self, snapshot_type: &str, subject: &str) -> StorageResult<usize> {
        let conn = self.open()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM snapshots WHERE snapshot_type = ?1 AND subject = ?2",
            params![snapshot_type, subject],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    pub fn list_keys(&self) -> StorageResult<Vec<SnapshotKey>> {
        let conn = self.open()?;
        let mut stmt = conn.prepare(
            "SELECT snapshot_type, subject, COUNT(*), MAX(captured_at_ms)
             FROM snapshots
             GROUP BY snapshot_type, subject
             ORDER BY snapshot_type, subject",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok(SnapshotKey {
                    snapshot_type: row.get(0)?,
                    subject: row.get(1)?,
                    snapshots: row.get::<_, i64>(2)? as usize,
                    latest_at: from_millis(3, row.get(3)?)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Applies `policy` to one key and returns the number of snapshots deleted.
    pub fn prune(
        &self,
        snapshot_type: &str,
        subject: &str,
        policy: &RetentionPolicy,
    ) -> StorageResult<usize> {
        self.prune_at(snapshot_type, subject, policy, Utc::now())
    }

    pub fn prune_at(
        &self,
        snapshot_type: &str,
        subject: &str,
        policy: &RetentionPolicy,
        now: DateTime<Utc>,
    ) -> StorageResult<usize> {
        if policy.is_unbounded() {
            return Ok(0);
        }
        let mut conn = self.open()?;
        let tx = conn.transaction()?;
        let deleted = prune_key(&tx, snapshot_type, subject, policy, now)?;
        tx.commit()?;
        if deleted > 0 {
            debug!(snapshot_type, subject, deleted, "pruned snapshots");
        }
        Ok(deleted)
    }

    pub fn prune_all(&self, policy: &RetentionPolicy) -> StorageResult<usize> {
        if policy.is_unbounded() {
            return Ok(0);
        }
        let now = Utc::now();
        let keys = self.list_keys()?;
        let mut conn = self.open()?;
        let tx = conn.transaction()?;
        let mut deleted = 0;
        for key in &keys {
            deleted += prune_key(&tx, &key.snapshot_type, &key.subject, policy, now)?;
        }
        tx.commit()?;
        Ok(deleted)
    }
}

fn prune_key(
    conn: &Connection,
    snapshot_type: &str,
    subject: &str,
    policy: &RetentionPolicy,
    now: DateTime<Utc>,
) -> StorageResult<usize> {
    let cutoff = policy
        .max_age_days
        .map(|days| to_millis(days_before(now, days)));
    let mut stmt = conn.prepare(
        "SELECT id, captured_at_ms FROM snapshots
         WHERE snapshot_type = ?1 AND subject = ?2
         ORDER BY captured_at_ms DESC, id DESC",
    )?;
    let rows = stmt
        .query_map(params![snapshot_type, subject], |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let doomed: Vec<i64> = rows
        .iter()
        .enumerate()
        // index 0 is the newest snapshot and always survives
        .skip(1)
        .filter(|(rank, (_, captured_at_ms))| {
            let over_count = policy.max_count.map_or(false, |max| *rank >= max);
            let too_old = cutoff.map_or(false, |cutoff| *captured_at_ms < cutoff);
            over_count || too_old
        })
        .map(|(_, (id, _))| *id)
        .collect();

    let mut delete = conn.prepare("DELETE FROM snapshots WHERE id = ?1")?;
    for id in &doomed {
        delete.execute([id])?;
    }
    Ok(doomed.len())
}

fn snapshot_from_row(row: &Row<'_>) -> rusqlite::Result<Snapshot> {
    let payload: String = row.get(4)?;
    let members: BTreeSet<String> = serde_json::from_str(&payload).map_err(|err| {
        rusqlite::Error::FromSqlConversionFailure(4, rusqlite::types::Type::Text, Box::new(err))
    })?;
    Ok(Snapshot {
        id: row.get(0)?,
        snapshot_type: row.get(1)?,
        subject: row.get(2)?,
        captured_at: from_millis(3, row.get(3)?)?,
        members,
    })
}
