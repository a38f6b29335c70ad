use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::debug;

use crate::sqlite::SqliteHandle;

use super::models::{
    days_before, from_millis, to_millis, DailyValue, DataPoint, MetricChange,
};
use super::{StorageError, StorageResult};

const TIMESERIES_SCHEMA: &str = include_str!("../../../sql/timeseries.sql");

#[derive(Debug, Clone)]
pub struct SqliteTimeSeriesStoreBuilder {
    path: Option<PathBuf>,
    read_only: bool,
    create_if_missing: bool,
}

impl Default for SqliteTimeSeriesStoreBuilder {
    fn default() -> Self {
        Self {
            path: None,
            read_only: false,
            create_if_missing: true,
        }
    }
}

impl SqliteTimeSeriesStoreBuilder {
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

    pub fn build(self) -> StorageResult<SqliteTimeSeriesStore> {
        let path = self.path.ok_or(StorageError::MissingStore)?;
        Ok(SqliteTimeSeriesStore {
            handle: SqliteHandle::new(path, self.read_only, self.create_if_missing),
        })
    }
}

/// Scalar observations keyed by (metric, subject).
#[derive(Debug, Clone)]
pub struct SqliteTimeSeriesStore {
    handle: SqliteHandle,
}

impl SqliteTimeSeriesStore {
    pub fn builder() -> SqliteTimeSeriesStoreBuilder {
        SqliteTimeSeriesStoreBuilder::new()
    }

    pub fn new(path: impl AsRef<Path>) -> StorageResult<Self> {
        SqliteTimeSeriesStoreBuilder::new().path(path).build()
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
        conn.execute_batch(TIMESERIES_SCHEMA)?;
        Ok(())
    }

    pub fn record(
        &self,
        metric: &str,
        subject: &str,
        value: f64,
        timestamp: DateTime<Utc>,
    ) -> StorageResult<()> {
        let conn = self.open()?;
        conn.execute(
            "INSERT INTO timeseries (metric, subject, recorded_at_ms, value) VALUES (?1, ?2, ?3, ?4)",
            params![metric, subject, to_millis(timestamp), value],
        )?;
        Ok(())
    }

    pub fn record_now(&self, metric: &str, subject: &str, value: f64) -> StorageResult<()> {
        self.record(metric, subject, value, Utc::now())
    }

    /// Appends all points in one transaction.
    pub fn record_many(&self, points: &[DataPoint]) -> StorageResult<usize> {
        let mut conn = self.open()?;
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO timeseries (metric, subject, recorded_at_ms, value)
                 VALUES (?1, ?2, ?3, ?4)",
            )?;
            for point in points {
                stmt.execute(params![
                    &point.metric,
                    &point.subject,
                    to_millis(point.timestamp),
                    point.value,
                ])?;
            }
        }
        tx.commit()?;
        Ok(points.len())
    }

    /// Points in `[now - days, now]`, oldest first.
    pub fn get_series(&self, metric: &str, subject: &str, days: u32) -> StorageResult<Vec<DataPoint>> {
        let now = Utc::now();
        self.get_range(metric, subject, days_before(now, days), now)
    }

    pub fn get_range(
        &self,
        metric: &str,
        subject: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> StorageResult<Vec<DataPoint>> {
        let conn = self.open()?;
        let mut stmt = conn.prepare(
            "SELECT metric, subject, recorded_at_ms, value
             FROM timeseries
             WHERE metric = ?1 AND subject = ?2
               AND recorded_at_ms >= ?3 AND recorded_at_ms <= ?4
             ORDER BY recorded_at_ms ASC, id ASC",
        )?;
        let rows = stmt
            .query_map(
                params![metric, subject, to_millis(start), to_millis(end)],
                point_from_row,
            )?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn get_latest(&self, metric: &str, subject: &str) -> StorageResult<Option<DataPoint>> {
        let conn = self.open()?;
        let point = conn
            .query_row(
                "SELECT metric, subject, recorded_at_ms, value
                 FROM timeseries
                 WHERE metric = ?1 AND subject = ?2
                 ORDER BY recorded_at_ms DESC, id DESC
                 LIMIT 1",
                params![metric, subject],
                point_from_row,
            )
            .optional()?;
        Ok(point)
    }

    /// Latest point at or before `at`.
    pub fn get_value_at(
        &self,
        metric: &str,
        subject: &str,
        at: DateTime<Utc>,
    ) -> StorageResult<Option<DataPoint>> {
        let conn = self.open()?;
        let point = conn
            .query_row(
                "SELECT metric, subject, recorded_at_ms, value
                 FROM timeseries
                 WHERE metric = ?1 AND subject = ?2 AND recorded_at_ms <= ?3
                 ORDER BY recorded_at_ms DESC, id DESC
                 LIMIT 1",
                params![metric, subject, to_millis(at)],
                point_from_row,
            )
            .optional()?;
        Ok(point)
    }

    /// Change between the latest value and the value as of `days` ago.
    ///
    /// Returns `None` when nothing was recorded at or before the start of the
    /// window, since there is no value to anchor the comparison on.
    pub fn get_change(
        &self,
        metric: &str,
        subject: &str,
        days: u32,
    ) -> StorageResult<Option<MetricChange>> {
        let anchor_at = days_before(Utc::now(), days);
        let Some(anchor) = self.get_value_at(metric, subject, anchor_at)? else {
            return Ok(None);
        };
        let Some(latest) = self.get_latest(metric, subject)? else {
            return Ok(None);
        };
        Ok(Some(MetricChange::from_points(days, &anchor, &latest)))
    }

    /// Last value of each UTC calendar day in the window, oldest day first.
    pub fn get_daily_series(
        &self,
        metric: &str,
        subject: &str,
        days: u32,
    ) -> StorageResult<Vec<DailyValue>> {
        let mut by_day = BTreeMap::new();
        for point in self.get_series(metric, subject, days)? {
            by_day.insert(point.timestamp.date_naive(), point.value);
        }
        Ok(by_day
            .into_iter()
            .map(|(date, value)| DailyValue { date, value })
            .collect())
    }

    pub fn prune_older_than(&self, days: u32) -> StorageResult<usize> {
        let cutoff = days_before(Utc::now(), days);
        let conn = self.open()?;
        let deleted = conn.execute(
            "DELETE FROM timeseries WHERE recorded_at_ms < ?1",
            [to_millis(cutoff)],
        )?;
        if deleted > 0 {
            debug!(deleted, days, "pruned time series points");
        }
        Ok(deleted)
    }

    pub fn list_metrics(&self, subject: &str) -> StorageResult<Vec<String>> {
        let conn = self.open()?;
        let mut stmt = conn.prepare(
            "SELECT DISTINCT metric FROM timeseries WHERE subject = ?1 ORDER BY metric",
        )?;
        let rows = stmt
            .query_map([subject], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}

fn point_from_row(row: &Row<'_>) -> rusqlite::Result<DataPoint> {
    Ok(DataPoint {
        metric: row.get(0)?,
        subject: row.get(1)?,
        timestamp: from_millis(2, row.get(2)?)?,
        value: row.get(3)?,
    })
}
