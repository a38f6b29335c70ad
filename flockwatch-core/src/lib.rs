pub mod config;
pub mod error;
pub mod monitor;
pub mod rate_limit;
pub mod sqlite;
pub mod storage;

pub use config::{
    load_flockwatch_config, FlockwatchConfig, LoggingSection, MonitoringSection, PacingSection,
    PathsSection, RateLimitSection, RateLimitsSection,
};
pub use error::{ConfigError, Result};
pub use monitor::{
    AccountMonitor, EngagementSource, EngagementTracker, FollowerSource, LogReportSink,
    MonitorError, MonitorNotification, MonitorResult, ProfileSource, ReportSink,
    UnfollowerDetector, UnfollowerReport,
};
pub use rate_limit::{
    ActionKind, ActionRateLimiter, RateLimitConfig, RateLimitError, RateLimitResult,
    RateLimitStats, RateLimiter,
};
pub use storage::{
    DataPoint, MetricChange, RetentionPolicy, SnapshotDiff, SnapshotMetadata, SqliteSnapshotStore,
    SqliteTimeSeriesStore, StorageError, StorageResult,
};
