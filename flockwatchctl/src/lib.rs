use std::collections::BTreeSet;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use clap::{Args, Parser, Subcommand, ValueEnum};
use flockwatch_core::storage::{
    DailyValue, DataPoint, MetricChange, RetentionPolicy, SnapshotKey, SnapshotMetadata,
    SqliteSnapshotStore, SqliteTimeSeriesStore,
};
use flockwatch_core::{load_flockwatch_config, ActionRateLimiter, FlockwatchConfig};
use rusqlite::{Connection, OpenFlags};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

pub type Result<T> = std::result::Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("config error: {0}")]
    Config(#[from] flockwatch_core::ConfigError),
    #[error("storage error: {0}")]
    Storage(#[from] flockwatch_core::StorageError),
    #[error("rate limit error: {0}")]
    RateLimit(#[from] flockwatch_core::RateLimitError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("required resource missing: {0}")]
    MissingResource(String),
    #[error("invalid argument {name}: {reason}")]
    InvalidArgument { name: &'static str, reason: String },
    #[error("health check failed: {failed} of {total} checks reported errors")]
    HealthCheckFailed { failed: usize, total: usize },
}

#[derive(Parser, Debug)]
#[command(author, version, about = "flockwatch operator console", long_about = None)]
pub struct Cli {
    /// Path to flockwatch.toml
    #[arg(long, default_value = "configs/flockwatch.toml")]
    pub config: PathBuf,
    /// Overrides paths.data_dir
    #[arg(long)]
    pub data_dir: Option<PathBuf>,
    /// Alternative snapshots database
    #[arg(long)]
    pub snapshots_db: Option<PathBuf>,
    /// Alternative time series database
    #[arg(long)]
    pub timeseries_db: Option<PathBuf>,
    /// Output format
    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    pub format: OutputFormat,
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Configured rate limits
    #[command(subcommand)]
    Limits(LimitsCommands),
    /// Follower snapshot history
    #[command(subcommand)]
    Snapshot(SnapshotCommands),
    /// Recorded metrics
    #[command(subcommand)]
    Series(SeriesCommands),
    /// Integrity checks
    #[command(subcommand)]
    Health(HealthCommands),
}

#[derive(Subcommand, Debug)]
pub enum LimitsCommands {
    /// Per-action limits and pacing
    Show,
}

#[derive(Subcommand, Debug)]
pub enum SnapshotCommands {
    /// Stored (type, subject) keys
    List,
    /// Snapshot headers, newest first
    History(SnapshotHistoryArgs),
    /// Difference between the two most recent snapshots
    Diff(SnapshotKeyArgs),
    /// Applies a retention policy to every key
    Prune(SnapshotPruneArgs),
}

#[derive(Args, Debug)]
pub struct SnapshotKeyArgs {
    #[arg(long = "type", default_value = "followers")]
    pub snapshot_type: String,
    #[arg(long)]
    pub subject: String,
}

#[derive(Args, Debug)]
pub struct SnapshotHistoryArgs {
    #[command(flatten)]
    pub key: SnapshotKeyArgs,
    #[arg(long, default_value_t = 10)]
    pub limit: usize,
}

#[derive(Args, Debug)]
pub struct SnapshotPruneArgs {
    /// Snapshots kept per key; defaults to monitoring.snapshot_retention_count
    #[arg(long)]
    pub keep: Option<usize>,
    /// Defaults to monitoring.snapshot_retention_days
    #[arg(long)]
    pub max_age_days: Option<u32>,
}

#[derive(Subcommand, Debug)]
pub enum SeriesCommands {
    /// Raw points in the window, oldest first
    Show(SeriesArgs),
    /// Change between the start of the window and now
    Change(SeriesArgs),
    /// Last value of each day in the window
    Daily(SeriesArgs),
}

#[derive(Args, Debug)]
pub struct SeriesArgs {
    #[arg(long)]
    pub metric: String,
    #[arg(long)]
    pub subject: String,
    #[arg(long, default_value_t = 7)]
    pub days: u32,
}

#[derive(Subcommand, Debug)]
pub enum HealthCommands {
    /// Checks configuration and databases
    Check,
}

/// Installs the fmt subscriber. `RUST_LOG` wins over the configured filter.
pub fn init_tracing(default_filter: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

pub fn run(cli: Cli) -> Result<()> {
    let context = AppContext::new(&cli)?;
    init_tracing(&context.config.logging.filter);
    debug!(config = %context.config_path.display(), "configuration loaded");

    match &cli.command {
        Commands::Limits(LimitsCommands::Show) => {
            let report = context.limits_show()?;
            render(&report, cli.format)?;
        }
        Commands::Snapshot(SnapshotCommands::List) => {
            let keys = context.snapshot_list()?;
            render(&keys, cli.format)?;
        }
        Commands::Snapshot(SnapshotCommands::History(args)) => {
            let history = context.snapshot_history(args)?;
            render(&history, cli.format)?;
        }
        Commands::Snapshot(SnapshotCommands::Diff(args)) => {
            let diff = context.snapshot_diff(args)?;
            render(&diff, cli.format)?;
        }
        Commands::Snapshot(SnapshotCommands::Prune(args)) => {
            let result = context.snapshot_prune(args)?;
            render(&result, cli.format)?;
        }
        Commands::Series(SeriesCommands::Show(args)) => {
            let series = context.series_show(args)?;
            render(&series, cli.format)?;
        }
        Commands::Series(SeriesCommands::Change(args)) => {
            let change = context.series_change(args)?;
            render(&change, cli.format)?;
        }
        Commands::Series(SeriesCommands::Daily(args)) => {
            let daily = context.series_daily(args)?;
            render(&daily, cli.format)?;
        }
        Commands::Health(HealthCommands::Check) => {
            let report = context.health_check();
            render(&report, cli.format)?;
            ensure_healthy(&report)?;
        }
    }

    Ok(())
}

fn ensure_healthy(report: &[HealthEntry]) -> Result<()> {
    let failed = report
        .iter()
        .filter(|entry| matches!(entry.status, CheckStatus::Error))
        .count();
    if failed > 0 {
        return Err(AppError::HealthCheckFailed {
            failed,
            total: report.len(),
        });
    }
    Ok(())
}

fn render<T>(value: &T, format: OutputFormat) -> Result<()>
where
    T: Serialize + DisplayFallback,
{
    match format {
        OutputFormat::Text => {
            println!("{}", value.display());
            Ok(())
        }
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(value)?;
            println!("{}", json);
            Ok(())
        }
    }
}

trait DisplayFallback {
    fn display(&self) -> String;
}

#[derive(Debug)]
struct AppContext {
    config: FlockwatchConfig,
    config_path: PathBuf,
    data_dir: PathBuf,
    snapshots_db: PathBuf,
    timeseries_db: PathBuf,
}

impl AppContext {
    fn new(cli: &Cli) -> Result<Self> {
        let config_path = cli.config.clone();
        let config = load_flockwatch_config(&config_path)?;

        let data_dir = cli
            .data_dir
            .clone()
            .unwrap_or_else(|| config.data_dir().to_path_buf());
        let snapshots_db = cli
            .snapshots_db
            .clone()
            .unwrap_or_else(|| config.snapshots_db_path_in(&data_dir));
        let timeseries_db = cli
            .timeseries_db
            .clone()
            .unwrap_or_else(|| config.timeseries_db_path_in(&data_dir));

        Ok(Self {
            config,
            config_path,
            data_dir,
            snapshots_db,
            timeseries_db,
        })
    }

    fn limits_show(&self) -> Result<LimitsReport> {
        let registry = ActionRateLimiter::from_config(&self.config.rate_limits)?;
        let rows = registry
            .configs()
            .into_iter()
            .map(|(action, config)| {
                let (jitter_min, jitter_max) = config.jitter_range();
                LimitEntry {
                    action,
                    max_per_minute: config.max_per_minute(),
                    max_per_hour: config.max_per_hour(),
                    jitter_min,
                    jitter_max,
                }
            })
            .collect();
        Ok(LimitsReport {
            rows,
            min_delay_seconds: self.config.pacing.min_delay_seconds,
            max_delay_seconds: self.config.pacing.max_delay_seconds,
        })
    }

    fn snapshot_list(&self) -> Result<SnapshotKeyList> {
        let rows = self.snapshot_store()?.list_keys()?;
        Ok(SnapshotKeyList { rows })
    }

    fn snapshot_history(&self, args: &SnapshotHistoryArgs) -> Result<SnapshotHistory> {
        let rows = self.snapshot_store()?.get_snapshot_metadata(
            &args.key.snapshot_type,
            &args.key.subject,
            args.limit,
        )?;
        Ok(SnapshotHistory {
            snapshot_type: args.key.snapshot_type.clone(),
            subject: args.key.subject.clone(),
            rows,
        })
    }

    fn snapshot_diff(&self, args: &SnapshotKeyArgs) -> Result<SnapshotDiffReport> {
        let store = self.snapshot_store()?;
        let diff = store.compare_snapshots(&args.snapshot_type, &args.subject)?;
        let history = store.get_snapshot_metadata(&args.snapshot_type, &args.subject, 2)?;
        let (newer_at, older_at) = match history.as_slice() {
            [newer, older] => (Some(newer.captured_at), Some(older.captured_at)),
            _ => (None, None),
        };
        Ok(SnapshotDiffReport {
            snapshot_type: args.snapshot_type.clone(),
            subject: args.subject.clone(),
            older_at,
            newer_at,
            added: diff.added,
            removed: diff.removed,
        })
    }

    fn snapshot_prune(&self, args: &SnapshotPruneArgs) -> Result<PruneResult> {
        let defaults = self.config.monitoring.retention_policy();
        let policy = RetentionPolicy {
            max_count: args.keep.or(defaults.max_count),
            max_age_days: args.max_age_days.or(defaults.max_age_days),
        };
        if policy.max_count == Some(0) {
            return Err(AppError::InvalidArgument {
                name: "--keep",
                reason: "must retain at least one snapshot".to_string(),
            });
        }
        let deleted = self.snapshot_store()?.prune_all(&policy)?;
        info!(deleted, "snapshot prune finished");
        Ok(PruneResult { policy, deleted })
    }

    fn series_show(&self, args: &SeriesArgs) -> Result<SeriesReport> {
        let points = self
            .timeseries_store()?
            .get_series(&args.metric, &args.subject, args.days)?;
        Ok(SeriesReport {
            metric: args.metric.clone(),
            subject: args.subject.clone(),
            days: args.days,
            points,
        })
    }

    fn series_change(&self, args: &SeriesArgs) -> Result<ChangeReport> {
        let change = self
            .timeseries_store()?
            .get_change(&args.metric, &args.subject, args.days)?;
        Ok(ChangeReport {
            metric: args.metric.clone(),
            subject: args.subject.clone(),
            days: args.days,
            change,
        })
    }

    fn series_daily(&self, args: &SeriesArgs) -> Result<DailyReport> {
        let days = self
            .timeseries_store()?
            .get_daily_series(&args.metric, &args.subject, args.days)?;
        Ok(DailyReport {
            metric: args.metric.clone(),
            subject: args.subject.clone(),
            values: days,
        })
    }

    fn health_check(&self) -> Vec<HealthEntry> {
        vec![
            self.check_path("flockwatch.toml", &self.config_path),
            HealthEntry::ok(
                "rate_limits",
                format!(
                    "{} action categories configured",
                    self.config.rate_limits.actions.len()
                ),
            ),
            self.check_directory("data_dir", &self.data_dir),
            self.check_database("snapshots.sqlite", &self.snapshots_db, "snapshots"),
            self.check_database("timeseries.sqlite", &self.timeseries_db, "timeseries"),
        ]
    }

    fn check_path(&self, name: &str, path: &Path) -> HealthEntry {
        if path.exists() {
            HealthEntry::ok(name, format!("{}", path.display()))
        } else {
            HealthEntry::error(name, format!("{} missing", path.display()))
        }
    }

    fn check_directory(&self, name: &str, path: &Path) -> HealthEntry {
        match fs::metadata(path) {
            Ok(meta) if meta.is_dir() => HealthEntry::ok(name, format!("{}", path.display())),
            Ok(_) => HealthEntry::warn(name, format!("{} is not a directory", path.display())),
            Err(_) => HealthEntry::warn(name, format!("{} not found", path.display())),
        }
    }

    fn check_database(&self, name: &str, path: &Path, table: &str) -> HealthEntry {
        if !path.exists() {
            return HealthEntry::warn(name, format!("{} not found", path.display()));
        }
        let conn = match Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_ONLY) {
            Ok(conn) => conn,
            Err(err) => return HealthEntry::error(name, format!("failed to open: {err}")),
        };
        let integrity: rusqlite::Result<String> =
            conn.query_row("PRAGMA integrity_check;", [], |row| row.get(0));
        match integrity {
            Ok(result) if result.eq_ignore_ascii_case("ok") => {}
            Ok(result) => return HealthEntry::warn(name, format!("integrity_check: {result}")),
            Err(err) => return HealthEntry::error(name, format!("integrity_check failed: {err}")),
        }
        let rows: rusqlite::Result<i64> =
            conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| row.get(0));
        match rows {
            Ok(count) => HealthEntry::ok(name, format!("integrity ok, {count} rows")),
            Err(err) => HealthEntry::warn(name, format!("schema missing: {err}")),
        }
    }

    fn snapshot_store(&self) -> Result<SqliteSnapshotStore> {
        require_database(&self.snapshots_db)?;
        let store = SqliteSnapshotStore::builder()
            .path(&self.snapshots_db)
            .create_if_missing(false)
            .build()?;
        Ok(store)
    }

    fn timeseries_store(&self) -> Result<SqliteTimeSeriesStore> {
        require_database(&self.timeseries_db)?;
        let store = SqliteTimeSeriesStore::builder()
            .path(&self.timeseries_db)
            .create_if_missing(false)
            .build()?;
        Ok(store)
    }
}

fn require_database(path: &Path) -> Result<()> {
    if path.exists() {
        Ok(())
    } else {
        Err(AppError::MissingResource(format!(
            "database missing: {}",
            path.display()
        )))
    }
}

#[derive(Debug, Serialize)]
pub struct LimitsReport {
    pub rows: Vec<LimitEntry>,
    pub min_delay_seconds: f64,
    pub max_delay_seconds: f64,
}

#[derive(Debug, Serialize)]
pub struct LimitEntry {
    pub action: String,
    pub max_per_minute: u32,
    pub max_per_hour: u32,
    pub jitter_min: f64,
    pub jitter_max: f64,
}

impl DisplayFallback for LimitsReport {
    fn display(&self) -> String {
        let mut lines = Vec::new();
        for entry in &self.rows {
            lines.push(format!(
                "{action:<10} {minute:>4}/min {hour:>5}/h  jitter {min:.2}-{max:.2}",
                action = entry.action,
                minute = entry.max_per_minute,
                hour = entry.max_per_hour,
                min = entry.jitter_min,
                max = entry.jitter_max,
            ));
        }
        lines.push(format!(
            "pacing: {:.1}-{:.1} s between bulk actions",
            self.min_delay_seconds, self.max_delay_seconds
        ));
        lines.join("\n")
    }
}

#[derive(Debug, Serialize)]
pub struct SnapshotKeyList {
    pub rows: Vec<SnapshotKey>,
}

impl DisplayFallback for SnapshotKeyList {
    fn display(&self) -> String {
        if self.rows.is_empty() {
            return "No snapshots stored".to_string();
        }
        self.rows
            .iter()
            .map(|key| {
                format!(
                    "{}/{}: {} snapshots, latest {}",
                    key.snapshot_type,
                    key.subject,
                    key.snapshots,
                    format_timestamp(&key.latest_at)
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[derive(Debug, Serialize)]
pub struct SnapshotHistory {
    pub snapshot_type: String,
    pub subject: String,
    pub rows: Vec<SnapshotMetadata>,
}

impl DisplayFallback for SnapshotHistory {
    fn display(&self) -> String {
        if self.rows.is_empty() {
            return format!("No snapshots for {}/{}", self.snapshot_type, self.subject);
        }
        let mut lines = Vec::new();
        for entry in &self.rows {
            let short_digest: String = entry.digest.chars().take(12).collect();
            lines.push(format!(
                "#{id} {at} members={count} digest={digest}",
                id = entry.id,
                at = format_timestamp(&entry.captured_at),
                count = entry.member_count,
                digest = short_digest,
            ));
        }
        lines.join("\n")
    }
}

#[derive(Debug, Serialize)]
pub struct SnapshotDiffReport {
    pub snapshot_type: String,
    pub subject: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub older_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub newer_at: Option<DateTime<Utc>>,
    pub added: BTreeSet<String>,
    pub removed: BTreeSet<String>,
}

impl DisplayFallback for SnapshotDiffReport {
    fn display(&self) -> String {
        let (Some(older), Some(newer)) = (&self.older_at, &self.newer_at) else {
            return format!(
                "Fewer than two snapshots for {}/{}",
                self.snapshot_type, self.subject
            );
        };
        let mut lines = vec![format!(
            "{}/{}: {} -> {}",
            self.snapshot_type,
            self.subject,
            format_timestamp(older),
            format_timestamp(newer)
        )];
        lines.push(format!("added ({}):", self.added.len()));
        lines.extend(self.added.iter().map(|member| format!("  + {member}")));
        lines.push(format!("removed ({}):", self.removed.len()));
        lines.extend(self.removed.iter().map(|member| format!("  - {member}")));
        lines.join("\n")
    }
}

#[derive(Debug, Serialize)]
pub struct PruneResult {
    pub policy: RetentionPolicy,
    pub deleted: usize,
}

impl DisplayFallback for PruneResult {
    fn display(&self) -> String {
        let keep = self
            .policy
            .max_count
            .map(|count| count.to_string())
            .unwrap_or_else(|| "unbounded".to_string());
        let age = self
            .policy
            .max_age_days
            .map(|days| format!("{days} days"))
            .unwrap_or_else(|| "unbounded".to_string());
        format!(
            "Deleted {} snapshots (keep {keep}, max age {age})",
            self.deleted
        )
    }
}

#[derive(Debug, Serialize)]
pub struct SeriesReport {
    pub metric: String,
    pub subject: String,
    pub days: u32,
    pub points: Vec<DataPoint>,
}

impl DisplayFallback for SeriesReport {
    fn display(&self) -> String {
        if self.points.is_empty() {
            return format!(
                "No {} points for {} in the last {} days",
                self.metric, self.subject, self.days
            );
        }
        self.points
            .iter()
            .map(|point| format!("{}  {}", format_timestamp(&point.timestamp), point.value))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[derive(Debug, Serialize)]
pub struct ChangeReport {
    pub metric: String,
    pub subject: String,
    pub days: u32,
    pub change: Option<MetricChange>,
}

impl DisplayFallback for ChangeReport {
    fn display(&self) -> String {
        match &self.change {
            Some(change) => format!(
                "{} for {} over {} days: {} -> {} ({:+}, {:+.1}%)",
                self.metric,
                self.subject,
                self.days,
                change.old_value,
                change.new_value,
                change.change,
                change.change_percentage
            ),
            None => format!(
                "No {} value for {} at least {} days old",
                self.metric, self.subject, self.days
            ),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct DailyReport {
    pub metric: String,
    pub subject: String,
    pub values: Vec<DailyValue>,
}

impl DisplayFallback for DailyReport {
    fn display(&self) -> String {
        if self.values.is_empty() {
            return format!("No {} values for {}", self.metric, self.subject);
        }
        self.values
            .iter()
            .map(|day| format!("{}  {}", day.date, day.value))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[derive(Debug, Serialize)]
pub struct HealthEntry {
    pub name: String,
    pub status: CheckStatus,
    pub detail: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckStatus {
    Ok,
    Warn,
    Error,
}

impl fmt::Display for CheckStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            CheckStatus::Ok => "OK",
            CheckStatus::Warn => "WARN",
            CheckStatus::Error => "ERROR",
        };
        write!(f, "{}", label)
    }
}

impl HealthEntry {
    fn ok(name: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::with_status(name, CheckStatus::Ok, detail)
    }

    fn warn(name: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::with_status(name, CheckStatus::Warn, detail)
    }

    fn error(name: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::with_status(name, CheckStatus::Error, detail)
    }

    fn with_status(
        name: impl Into<String>,
        status: CheckStatus,
        detail: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            status,
            detail: detail.into(),
        }
    }
}

impl DisplayFallback for Vec<HealthEntry> {
    fn display(&self) -> String {
        self.iter()
            .map(|entry| format!("[{}] {}: {}", entry.status, entry.name, entry.detail))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

fn format_timestamp(value: &DateTime<Utc>) -> String {
    value.format("%Y-%m-%d %H:%M:%S").to_string()
}
