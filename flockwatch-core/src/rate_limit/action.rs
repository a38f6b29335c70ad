use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::config::RateLimitsSection;

use super::error::RateLimitResult;
use super::limiter::{RateLimitConfig, RateLimitStats, RateLimiter};

pub const DEFAULT_ACTION: &str = "default";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActionKind {
    Like,
    Unlike,
    Follow,
    Unfollow,
    Comment,
    Retweet,
    Bookmark,
    Search,
    Scrape,
}

impl ActionKind {
    pub const ALL: [ActionKind; 9] = [
        ActionKind::Like,
        ActionKind::Unlike,
        ActionKind::Follow,
        ActionKind::Unfollow,
        ActionKind::Comment,
        ActionKind::Retweet,
        ActionKind::Bookmark,
        ActionKind::Search,
        ActionKind::Scrape,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::Like => "like",
            ActionKind::Unlike => "unlike",
            ActionKind::Follow => "follow",
            ActionKind::Unfollow => "unfollow",
            ActionKind::Comment => "comment",
            ActionKind::Retweet => "retweet",
            ActionKind::Bookmark => "bookmark",
            ActionKind::Search => "search",
            ActionKind::Scrape => "scrape",
        }
    }

    /// Built-in (per minute, per hour) limits used when no config is supplied.
    fn builtin_limits(&self) -> (u32, u32) {
        match self {
            ActionKind::Like | ActionKind::Unlike => (10, 100),
            ActionKind::Follow | ActionKind::Unfollow => (5, 50),
            ActionKind::Comment => (3, 30),
            ActionKind::Retweet => (5, 50),
            ActionKind::Bookmark => (10, 100),
            ActionKind::Search => (10, 200),
            ActionKind::Scrape => (30, 600),
        }
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ActionKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase();
        ActionKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == normalized)
            .ok_or_else(|| format!("unknown action kind: {s}"))
    }
}

/// Independent [`RateLimiter`]s per action tag, with a `default` fallback.
#[derive(Debug, Clone)]
pub struct ActionRateLimiter {
    limiters: BTreeMap<String, Arc<RateLimiter>>,
    default: Arc<RateLimiter>,
}

impl ActionRateLimiter {
    pub fn new(default: RateLimitConfig) -> Self {
        Self::with_default_limiter(RateLimiter::new(DEFAULT_ACTION, default))
    }

    pub fn with_default_limiter(limiter: RateLimiter) -> Self {
        Self {
            limiters: BTreeMap::new(),
            default: Arc::new(limiter),
        }
    }

    pub fn with_defaults() -> Self {
        let jitter = (0.8, 1.3);
        let mut registry = Self::new(builtin_config(20, 300, jitter));
        for kind in ActionKind::ALL {
            let (per_minute, per_hour) = kind.builtin_limits();
            registry =
                registry.with_action(kind.as_str(), builtin_config(per_minute, per_hour, jitter));
        }
        registry
    }

    pub fn from_config(section: &RateLimitsSection) -> RateLimitResult<Self> {
        let mut registry = Self::new(RateLimitConfig::try_from(&section.default)?);
        for (action, limits) in &section.actions {
            registry = registry.with_limiter(RateLimiter::from_section(
                normalize(action),
                limits,
            )?);
        }
        Ok(registry)
    }

    pub fn with_action(self, action: &str, config: RateLimitConfig) -> Self {
        self.with_limiter(RateLimiter::new(normalize(action), config))
    }

    /// Registers a prebuilt limiter under its own name.
    pub fn with_limiter(mut self, limiter: RateLimiter) -> Self {
        let tag = normalize(limiter.name());
        if tag == DEFAULT_ACTION {
            self.default = Arc::new(limiter);
        } else {
            self.limiters.insert(tag, Arc::new(limiter));
        }
        self
    }

    /// The limiter for `action`, or the default limiter for unknown tags.
    pub fn limiter(&self, action: &str) -> &Arc<RateLimiter> {
        self.limiters
            .get(normalize(action).as_str())
            .unwrap_or(&self.default)
    }

    pub fn is_configured(&self, action: &str) -> bool {
        self.limiters.contains_key(normalize(action).as_str())
    }

    pub async fn acquire(&self, action: &str, weight: u32) -> RateLimitResult<Duration> {
        let limiter = self.limiter(action);
        let waited = limiter.acquire(weight).await?;
        if !waited.is_zero() {
            debug!(
                action,
                limiter = limiter.name(),
                waited_ms = waited.as_millis() as u64,
                "action admitted after waiting"
            );
        }
        Ok(waited)
    }

    pub async fn acquire_kind(&self, kind: ActionKind) -> RateLimitResult<Duration> {
        self.acquire(kind.as_str(), 1).await
    }

    /// Inter-action pacing on the default limiter's jitter profile.
    pub async fn wait_random(&self, min_secs: f64, max_secs: f64) -> Duration {
        self.default.wait_random(min_secs, max_secs).await
    }

    pub fn trigger_cooldown(&self, action: &str, duration: Duration) {
        self.limiter(action).trigger_cooldown(duration);
    }

    /// Cooldown on every category, for platform-wide blocks.
    pub fn trigger_cooldown_all(&self, duration: Duration) {
        self.default.trigger_cooldown(duration);
        for limiter in self.limiters.values() {
            limiter.trigger_cooldown(duration);
        }
    }

    pub fn reset_all(&self) {
        self.default.reset();
        for limiter in self.limiters.values() {
            limiter.reset();
        }
    }

    pub fn get_all_stats(&self) -> BTreeMap<String, RateLimitStats> {
        let mut stats: BTreeMap<String, RateLimitStats> = self
            .limiters
            .iter()
            .map(|(action, limiter)| (action.clone(), limiter.get_stats()))
            .collect();
        stats.insert(DEFAULT_ACTION.to_string(), self.default.get_stats());
        stats
    }

    pub fn configs(&self) -> BTreeMap<String, RateLimitConfig> {
        let mut configs: BTreeMap<String, RateLimitConfig> = self
            .limiters
            .iter()
            .map(|(action, limiter)| (action.clone(), *limiter.config()))
            .collect();
        configs.insert(DEFAULT_ACTION.to_string(), *self.default.config());
        configs
    }
}

impl Default for ActionRateLimiter {
    fn default() -> Self {
        Self::with_defaults()
    }
}

fn builtin_config(per_minute: u32, per_hour: u32, jitter: (f64, f64)) -> RateLimitConfig {
    RateLimitConfig::builtin(per_minute, per_hour, jitter)
}

fn normalize(action: &str) -> String {
    action.trim().to_ascii_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RateLimitSection;

    fn config(per_minute: u32, per_hour: u32) -> RateLimitConfig {
        RateLimitConfig::new(per_minute, per_hour, (1.0, 1.0)).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_action_falls_back_to_default() {
        let registry = ActionRateLimiter::new(config(7, 70)).with_action("like", config(2, 20));
        let waited = registry.acquire("totally_unknown", 1).await.unwrap();
        assert_eq!(waited, Duration::ZERO);

        let stats = registry.get_all_stats();
        assert_eq!(stats[DEFAULT_ACTION].total_requests, 1);
        assert_eq!(stats[DEFAULT_ACTION].max_per_minute, 7);
        assert_eq!(stats["like"].total_requests, 0);
        assert!(!registry.is_configured("totally_unknown"));
    }

    #[tokio::test(start_paused = true)]
    async fn categories_keep_independent_history() {
        let registry = ActionRateLimiter::new(config(10, 100))
            .with_action("like", config(1, 10))
            .with_action("follow", config(1, 10));
        registry.acquire("like", 1).await.unwrap();
        assert_eq!(registry.acquire("follow", 1).await.unwrap(), Duration::ZERO);
        let waited = registry.acquire(" LIKE ", 1).await.unwrap();
        assert!(waited >= Duration::from_secs(60));

        let stats = registry.get_all_stats();
        assert_eq!(stats["like"].total_requests, 2);
        assert_eq!(stats["follow"].total_requests, 1);
        assert_eq!(stats[DEFAULT_ACTION].total_requests, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn cooldown_all_blocks_every_category() {
        let registry = ActionRateLimiter::with_defaults();
        registry.trigger_cooldown_all(Duration::from_secs(30));
        let stats = registry.get_all_stats();
        assert_eq!(stats.len(), ActionKind::ALL.len() + 1);
        assert!(stats.values().all(|entry| entry.in_cooldown));

        let waited = registry.acquire_kind(ActionKind::Comment).await.unwrap();
        assert!(waited >= Duration::from_secs(30));

        registry.reset_all();
        assert!(registry.get_all_stats().values().all(|entry| !entry.in_cooldown));
    }

    #[test]
    fn builds_from_config_section() {
        let mut actions = BTreeMap::new();
        actions.insert(
            "Follow".to_string(),
            RateLimitSection {
                max_per_minute: 4,
                max_per_hour: 40,
                jitter_range: [1.0, 2.0],
            },
        );
        let section = RateLimitsSection {
            default: RateLimitSection {
                max_per_minute: 12,
                max_per_hour: 120,
                jitter_range: [0.8, 1.2],
            },
            actions,
        };
        let registry = ActionRateLimiter::from_config(&section).unwrap();
        assert_eq!(registry.limiter("follow").config().max_per_minute(), 4);
        assert_eq!(registry.limiter("like").config().max_per_minute(), 12);

        let mut invalid = section.clone();
        invalid.default.max_per_hour = 0;
        assert!(ActionRateLimiter::from_config(&invalid).is_err());
    }

    #[test]
    fn parses_action_kinds() {
        assert_eq!("Retweet".parse::<ActionKind>().unwrap(), ActionKind::Retweet);
        assert!("dance".parse::<ActionKind>().is_err());
    }
}
