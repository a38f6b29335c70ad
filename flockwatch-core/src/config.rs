use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, Result};
use crate::monitor::DEFAULT_SAMPLE_SIZE;
use crate::rate_limit::RateLimitConfig;
use crate::storage::RetentionPolicy;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct FlockwatchConfig {
    pub paths: PathsSection,
    pub rate_limits: RateLimitsSection,
    #[serde(default)]
    pub pacing: PacingSection,
    #[serde(default)]
    pub monitoring: MonitoringSection,
    #[serde(default)]
    pub logging: LoggingSection,
}

impl FlockwatchConfig {
    pub fn data_dir(&self) -> &Path {
        Path::new(&self.paths.data_dir)
    }

    pub fn resolve_path<P: AsRef<Path>>(&self, candidate: P) -> PathBuf {
        resolve_in(self.data_dir(), candidate.as_ref())
    }

    pub fn snapshots_db_path(&self) -> PathBuf {
        self.snapshots_db_path_in(self.data_dir())
    }

    pub fn timeseries_db_path(&self) -> PathBuf {
        self.timeseries_db_path_in(self.data_dir())
    }

    /// Snapshot database location when `data_dir` replaces `paths.data_dir`.
    pub fn snapshots_db_path_in(&self, data_dir: &Path) -> PathBuf {
        resolve_in(data_dir, Path::new(&self.paths.snapshots_db))
    }

    pub fn timeseries_db_path_in(&self, data_dir: &Path) -> PathBuf {
        resolve_in(data_dir, Path::new(&self.paths.timeseries_db))
    }

    /// Rejects values that would only fail later, at first use.
    pub fn validate(&self) -> Result<()> {
        check_limits("rate_limits.default", &self.rate_limits.default)?;
        for (action, section) in &self.rate_limits.actions {
            check_limits(&format!("rate_limits.actions.{action}"), section)?;
        }
        let pacing = &self.pacing;
        if !pacing.min_delay_seconds.is_finite()
            || !pacing.max_delay_seconds.is_finite()
            || pacing.min_delay_seconds < 0.0
            || pacing.max_delay_seconds < 0.0
        {
            return Err(ConfigError::Invalid {
                field: "pacing".to_string(),
                reason: "delays must be finite and non-negative".to_string(),
            });
        }
        if self.monitoring.snapshot_retention_count == Some(0) {
            return Err(ConfigError::Invalid {
                field: "monitoring.snapshot_retention_count".to_string(),
                reason: "must keep at least one snapshot".to_string(),
            });
        }
        if self.monitoring.engagement_sample_size == 0 {
            return Err(ConfigError::Invalid {
                field: "monitoring.engagement_sample_size".to_string(),
                reason: "must sample at least one post".to_string(),
            });
        }
        Ok(())
    }
}

fn resolve_in(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

fn check_limits(field: &str, section: &RateLimitSection) -> Result<()> {
    RateLimitConfig::try_from(section)
        .map(|_| ())
        .map_err(|err| ConfigError::Invalid {
            field: field.to_string(),
            reason: err.to_string(),
        })
}

#[derive(Debug, Clone, Deserialize)]
pub struct PathsSection {
    pub data_dir: String,
    pub snapshots_db: String,
    pub timeseries_db: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitsSection {
    pub default: RateLimitSection,
    #[serde(default)]
    pub actions: BTreeMap<String, RateLimitSection>,
}

#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
pub struct RateLimitSection {
    pub max_per_minute: u32,
    pub max_per_hour: u32,
    #[serde(default = "default_jitter_range")]
    pub jitter_range: [f64; 2],
}

fn default_jitter_range() -> [f64; 2] {
    [0.8, 1.2]
}

#[derive(Debug, Clone, Deserialize)]
pub struct PacingSection {
    pub min_delay_seconds: f64,
    pub max_delay_seconds: f64,
}

impl Default for PacingSection {
    fn default() -> Self {
        Self {
            min_delay_seconds: 2.0,
            max_delay_seconds: 5.0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MonitoringSection {
    pub snapshot_retention_count: Option<usize>,
    pub snapshot_retention_days: Option<u32>,
    pub timeseries_retention_days: Option<u32>,
    pub notify_on_new_followers: bool,
    pub engagement_sample_size: usize,
    pub watch_accounts: Vec<String>,
}

impl Default for MonitoringSection {
    fn default() -> Self {
        Self {
            snapshot_retention_count: Some(30),
            snapshot_retention_days: Some(90),
            timeseries_retention_days: None,
            notify_on_new_followers: false,
            engagement_sample_size: DEFAULT_SAMPLE_SIZE,
            watch_accounts: Vec::new(),
        }
    }
}

impl MonitoringSection {
    pub fn retention_policy(&self) -> RetentionPolicy {
        RetentionPolicy {
            max_count: self.snapshot_retention_count,
            max_age_days: self.snapshot_retention_days,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingSection {
    pub filter: String,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            filter: "info".to_string(),
        }
    }
}

pub fn load_flockwatch_config<P: AsRef<Path>>(path: P) -> Result<FlockwatchConfig> {
    let config: FlockwatchConfig = load_toml(path)?;
    config.validate()?;
    Ok(config)
}

fn load_toml<T, P>(path: P) -> Result<T>
where
    T: DeserializeOwned,
    P: AsRef<Path>,
{
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        source,
        path: path.to_path_buf(),
    })?;
    toml::from_str(&content).map_err(|source| ConfigError::Parse {
        source,
        path: path.to_path_buf(),
    })
}
