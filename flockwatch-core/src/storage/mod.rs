mod error;
mod models;
mod snapshot;
mod timeseries;

pub use error::{StorageError, StorageResult};
pub use models::{
    DailyValue, DataPoint, MetricChange, RetentionPolicy, Snapshot, SnapshotDiff, SnapshotKey,
    SnapshotMetadata,
};
pub use snapshot::{SqliteSnapshotStore, SqliteSnapshotStoreBuilder};
pub use timeseries::{SqliteTimeSeriesStore, SqliteTimeSeriesStoreBuilder};
