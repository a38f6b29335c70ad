use std::collections::VecDeque;
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;
use serde::Serialize;
use tokio::sync::Mutex as AsyncMutex;
use tokio::time::{sleep, Instant};
use tracing::{debug, warn};

use crate::config::RateLimitSection;

use super::error::{RateLimitError, RateLimitResult};

const MINUTE_WINDOW: Duration = Duration::from_secs(60);
const HOUR_WINDOW: Duration = Duration::from_secs(3600);
const MINUTE_JITTER_SECS: (f64, f64) = (1.0, 5.0);
const HOUR_JITTER_SECS: (f64, f64) = (10.0, 60.0);
/// Upper bound for cooldowns; longer requests are clamped to it.
const MAX_COOLDOWN: Duration = Duration::from_secs(100 * 365 * 24 * 3600);
/// Upper bound for the base delay of `wait_random`.
const MAX_RANDOM_WAIT_SECS: f64 = 86_400.0;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct RateLimitConfig {
    max_per_minute: u32,
    max_per_hour: u32,
    jitter_range: (f64, f64),
}

impl RateLimitConfig {
    pub fn new(
        max_per_minute: u32,
        max_per_hour: u32,
        jitter_range: (f64, f64),
    ) -> RateLimitResult<Self> {
        if max_per_minute == 0 {
            return Err(RateLimitError::InvalidConfig(
                "max_per_minute must be greater than zero".to_string(),
            ));
        }
        if max_per_hour == 0 {
            return Err(RateLimitError::InvalidConfig(
                "max_per_hour must be greater than zero".to_string(),
            ));
        }
        let (low, high) = jitter_range;
        if !low.is_finite() || !high.is_finite() || low <= 0.0 || low > high {
            return Err(RateLimitError::InvalidConfig(format!(
                "jitter_range must satisfy 0 < min <= max, got [{low}, {high}]"
            )));
        }
        Ok(Self {
            max_per_minute,
            max_per_hour,
            jitter_range,
        })
    }

    /// Constructor for compiled-in limits that are known to be valid.
    pub(super) const fn builtin(
        max_per_minute: u32,
        max_per_hour: u32,
        jitter_range: (f64, f64),
    ) -> Self {
        Self {
            max_per_minute,
            max_per_hour,
            jitter_range,
        }
    }

    pub fn max_per_minute(&self) -> u32 {
        self.max_per_minute
    }

    pub fn max_per_hour(&self) -> u32 {
        self.max_per_hour
    }

    pub fn jitter_range(&self) -> (f64, f64) {
        self.jitter_range
    }
}

impl TryFrom<&RateLimitSection> for RateLimitConfig {
    type Error = RateLimitError;

    fn try_from(section: &RateLimitSection) -> RateLimitResult<Self> {
        Self::new(
            section.max_per_minute,
            section.max_per_hour,
            (section.jitter_range[0], section.jitter_range[1]),
        )
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct RateLimitStats {
    pub requests_last_minute: usize,
    pub requests_last_hour: usize,
    pub total_requests: u64,
    pub times_rate_limited: u64,
    pub times_throttled: u64,
    pub in_cooldown: bool,
    pub cooldown_remaining_secs: f64,
    pub seconds_since_last_request: Option<f64>,
    pub max_per_minute: u32,
    pub max_per_hour: u32,
}

#[derive(Debug, Default)]
struct RateLimitState {
    history: VecDeque<Instant>,
    last_request: Option<Instant>,
    cooldown_until: Option<Instant>,
    total_requests: u64,
    times_rate_limited: u64,
    times_throttled: u64,
}

impl RateLimitState {
    fn prune(&mut self, now: Instant) {
        while let Some(oldest) = self.history.front() {
            if now.saturating_duration_since(*oldest) >= HOUR_WINDOW {
                self.history.pop_front();
            } else {
                break;
            }
        }
    }

    /// Entries strictly inside the trailing window (age < window).
    fn count_within(&self, now: Instant, window: Duration) -> usize {
        self.history
            .iter()
            .rev()
            .take_while(|ts| now.saturating_duration_since(**ts) < window)
            .count()
    }

    fn cooldown_remaining(&self, now: Instant) -> Option<Duration> {
        self.cooldown_until
            .and_then(|until| until.checked_duration_since(now))
            .filter(|remaining| !remaining.is_zero())
    }

    /// Time until `weight` more units fit into the window, without jitter.
    fn window_wait(
        &self,
        now: Instant,
        window: Duration,
        limit: u32,
        weight: u32,
    ) -> Option<Duration> {
        let count = self.count_within(now, window);
        let (limit, weight) = (limit as usize, weight as usize);
        if count + weight <= limit {
            return None;
        }
        // weight <= limit, so the excess is covered by entries inside the window
        let excess = count + weight - limit;
        let first_in_window = self.history.len() - count;
        let blocking = self.history[first_in_window + excess - 1];
        let age = now.saturating_duration_since(blocking);
        Some(window.saturating_sub(age))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WaitReason {
    Cooldown,
    MinuteWindow,
    HourWindow,
}

impl fmt::Display for WaitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            WaitReason::Cooldown => "cooldown",
            WaitReason::MinuteWindow => "minute_window",
            WaitReason::HourWindow => "hour_window",
        };
        f.write_str(label)
    }
}

/// Two-tier sliding-window limiter with jitter and externally triggered cooldowns.
///
/// `acquire` holds an async gate for its whole check-suspend-append sequence, so
/// concurrent callers on the same instance are admitted one at a time. The
/// window state sits behind a separate short-lived lock, which keeps
/// `get_stats`, `trigger_cooldown` and `reset` responsive while an acquire is
/// suspended.
#[derive(Debug)]
pub struct RateLimiter {
    name: String,
    config: RateLimitConfig,
    state: Mutex<RateLimitState>,
    gate: AsyncMutex<()>,
    rng: Mutex<ChaCha20Rng>,
}

impl RateLimiter {
    pub fn new(name: impl Into<String>, config: RateLimitConfig) -> Self {
        Self {
            name: name.into(),
            config,
            state: Mutex::new(RateLimitState::default()),
            gate: AsyncMutex::new(()),
            rng: Mutex::new(ChaCha20Rng::from_entropy()),
        }
    }

    pub fn from_section(
        name: impl Into<String>,
        section: &RateLimitSection,
    ) -> RateLimitResult<Self> {
        Ok(Self::new(name, RateLimitConfig::try_from(section)?))
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = Mutex::new(ChaCha20Rng::seed_from_u64(seed));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Waits until `weight` units can be admitted, records them and returns the
    /// time spent suspended.
    pub async fn acquire(&self, weight: u32) -> RateLimitResult<Duration> {
        self.check_weight(weight)?;
        if weight == 0 {
            return Ok(Duration::ZERO);
        }

        let _admission = self.gate.lock().await;
        let mut waited = Duration::ZERO;
        let mut throttles = 0u64;
        loop {
            let pending = {
                let mut state = self.state();
                let now = Instant::now();
                if let Some(remaining) = state.cooldown_remaining(now) {
                    Some((remaining, WaitReason::Cooldown))
                } else {
                    state.prune(now);
                    if let Some(base) =
                        state.window_wait(now, MINUTE_WINDOW, self.config.max_per_minute, weight)
                    {
                        Some((base + self.jitter(MINUTE_JITTER_SECS), WaitReason::MinuteWindow))
                    } else if let Some(base) =
                        state.window_wait(now, HOUR_WINDOW, self.config.max_per_hour, weight)
                    {
                        Some((base + self.jitter(HOUR_JITTER_SECS), WaitReason::HourWindow))
                    } else {
                        state.history.extend(std::iter::repeat(now).take(weight as usize));
                        state.last_request = Some(now);
                        state.total_requests = state.total_requests.saturating_add(weight as u64);
                        state.times_throttled = state.times_throttled.saturating_add(throttles);
                        None
                    }
                }
            };

            let Some((delay, reason)) = pending else {
                return Ok(waited);
            };
            if reason != WaitReason::Cooldown {
                throttles += 1;
            }
            debug!(
                limiter = %self.name,
                reason = %reason,
                delay_ms = delay.as_millis() as u64,
                "rate limiter suspending caller"
            );
            let started = Instant::now();
            sleep(delay).await;
            waited += started.elapsed();
        }
    }

    /// Blocks admission for `duration` from now, capped at a century. Later
    /// calls overwrite the expiry.
    pub fn trigger_cooldown(&self, duration: Duration) {
        let duration = duration.min(MAX_COOLDOWN);
        let now = Instant::now();
        let mut state = self.state();
        state.cooldown_until = Some(
            now.checked_add(duration)
                .or_else(|| now.checked_add(MAX_COOLDOWN))
                .unwrap_or(now),
        );
        state.times_rate_limited = state.times_rate_limited.saturating_add(1);
        warn!(
            limiter = %self.name,
            cooldown_secs = duration.as_secs_f64(),
            times_rate_limited = state.times_rate_limited,
            "rate limit cooldown triggered"
        );
    }

    /// Sleeps for a uniform delay in `[min_secs, max_secs]` scaled by the jitter
    /// factor. Bounds are clamped to `[0, MAX_RANDOM_WAIT_SECS]`; NaN counts as 0.
    pub async fn wait_random(&self, min_secs: f64, max_secs: f64) -> Duration {
        let clamp = |secs: f64| {
            if secs.is_nan() {
                0.0
            } else {
                secs.clamp(0.0, MAX_RANDOM_WAIT_SECS)
            }
        };
        let (min_secs, max_secs) = (clamp(min_secs), clamp(max_secs));
        let low = min_secs.min(max_secs);
        let high = min_secs.max(max_secs);
        let delay = {
            let mut rng = self.rng();
            let base = if high > low {
                rng.gen_range(low..=high)
            } else {
                low
            };
            let (jitter_low, jitter_high) = self.config.jitter_range;
            base * rng.gen_range(jitter_low..=jitter_high)
        };
        let delay = Duration::from_secs_f64(delay);
        sleep(delay).await;
        delay
    }

    pub fn get_stats(&self) -> RateLimitStats {
        let state = self.state();
        let now = Instant::now();
        let cooldown = state.cooldown_remaining(now);
        RateLimitStats {
            requests_last_minute: state.count_within(now, MINUTE_WINDOW),
            requests_last_hour: state.count_within(now, HOUR_WINDOW),
            total_requests: state.total_requests,
            times_rate_limited: state.times_rate_limited,
            times_throttled: state.times_throttled,
            in_cooldown: cooldown.is_some(),
            cooldown_remaining_secs: cooldown.map(|d| d.as_secs_f64()).unwrap_or(0.0),
            seconds_since_last_request: state
                .last_request
                .map(|last| now.saturating_duration_since(last).as_secs_f64()),
            max_per_minute: self.config.max_per_minute,
            max_per_hour: self.config.max_per_hour,
        }
    }

    pub fn reset(&self) {
        *self.state() = RateLimitState::default();
        debug!(limiter = %self.name, "rate limiter reset");
    }

    fn check_weight(&self, weight: u32) -> RateLimitResult<()> {
        if weight > self.config.max_per_minute {
            return Err(RateLimitError::WeightExceedsLimit {
                weight,
                limit: self.config.max_per_minute,
                window: "per-minute",
            });
        }
        if weight > self.config.max_per_hour {
            return Err(RateLimitError::WeightExceedsLimit {
                weight,
                limit: self.config.max_per_hour,
                window: "per-hour",
            });
        }
        Ok(())
    }

    fn jitter(&self, bounds: (f64, f64)) -> Duration {
        let mut rng = self.rng();
        let (jitter_low, jitter_high) = self.config.jitter_range;
        let base = rng.gen_range(bounds.0..=bounds.1);
        Duration::from_secs_f64(base * rng.gen_range(jitter_low..=jitter_high))
    }

    fn state(&self) -> MutexGuard<'_, RateLimitState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn rng(&self) -> MutexGuard<'_, ChaCha20Rng> {
        self.rng.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn limiter(per_minute: u32, per_hour: u32) -> RateLimiter {
        let config = RateLimitConfig::new(per_minute, per_hour, (1.0, 1.0)).unwrap();
        RateLimiter::new("test", config).with_seed(7)
    }

    #[test]
    fn rejects_invalid_config() {
        assert!(RateLimitConfig::new(0, 10, (1.0, 1.0)).is_err());
        assert!(RateLimitConfig::new(10, 0, (1.0, 1.0)).is_err());
        assert!(RateLimitConfig::new(10, 10, (0.0, 1.0)).is_err());
        assert!(RateLimitConfig::new(10, 10, (2.0, 1.0)).is_err());
        assert!(RateLimitConfig::new(10, 10, (1.0, f64::INFINITY)).is_err());
        assert!(RateLimitConfig::new(10, 10, (0.5, 1.5)).is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn admits_under_limit_without_waiting() {
        let limiter = limiter(3, 100);
        for _ in 0..3 {
            assert_eq!(limiter.acquire(1).await.unwrap(), Duration::ZERO);
        }
        let stats = limiter.get_stats();
        assert_eq!(stats.requests_last_minute, 3);
        assert_eq!(stats.total_requests, 3);
        assert_eq!(stats.times_throttled, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn minute_window_waits_for_oldest_entry() {
        let limiter = limiter(2, 100);
        limiter.acquire(1).await.unwrap();
        limiter.acquire(1).await.unwrap();

        let waited = limiter.acquire(1).await.unwrap();
        assert!(waited >= Duration::from_secs(61), "waited {waited:?}");
        assert!(waited <= Duration::from_secs(65), "waited {waited:?}");

        let stats = limiter.get_stats();
        assert_eq!(stats.requests_last_minute, 1);
        assert_eq!(stats.requests_last_hour, 3);
        assert_eq!(stats.times_throttled, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn minute_window_never_exceeds_limit() {
        let limiter = limiter(4, 1_000);
        for _ in 0..25 {
            limiter.acquire(1).await.unwrap();
            assert!(limiter.get_stats().requests_last_minute <= 4);
        }
        assert_eq!(limiter.get_stats().total_requests, 25);
    }

    #[tokio::test(start_paused = true)]
    async fn hour_window_applies_larger_wait() {
        let limiter = limiter(100, 3);
        for _ in 0..3 {
            limiter.acquire(1).await.unwrap();
        }
        let waited = limiter.acquire(1).await.unwrap();
        assert!(waited >= Duration::from_secs(3_610), "waited {waited:?}");
        assert!(waited <= Duration::from_secs(3_660), "waited {waited:?}");
        assert_eq!(limiter.get_stats().requests_last_hour, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cooldown_delays_next_acquire() {
        let limiter = limiter(10, 100);
        limiter.trigger_cooldown(Duration::from_secs(60));
        let stats = limiter.get_stats();
        assert!(stats.in_cooldown);
        assert_eq!(stats.times_rate_limited, 1);

        let waited = limiter.acquire(1).await.unwrap();
        assert!(waited >= Duration::from_secs(60));
        assert!(waited < Duration::from_secs(61));
        assert!(!limiter.get_stats().in_cooldown);
    }

    #[tokio::test(start_paused = true)]
    async fn cooldown_is_overwritten_by_latest_call() {
        let limiter = limiter(10, 100);
        limiter.trigger_cooldown(Duration::from_secs(120));
        limiter.trigger_cooldown(Duration::from_secs(10));
        let stats = limiter.get_stats();
        assert_eq!(stats.times_rate_limited, 2);
        assert!((stats.cooldown_remaining_secs - 10.0).abs() < 1e-6);

        let waited = limiter.acquire(1).await.unwrap();
        assert!(waited < Duration::from_secs(11));
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_acquire_leaves_history_untouched() {
        let limiter = limiter(10, 100);
        limiter.trigger_cooldown(Duration::from_secs(60));
        let result = tokio::time::timeout(Duration::from_secs(5), limiter.acquire(1)).await;
        assert!(result.is_err());

        let stats = limiter.get_stats();
        assert_eq!(stats.total_requests, 0);
        assert_eq!(stats.requests_last_minute, 0);
        assert!(stats.in_cooldown);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_callers_respect_window() {
        let limiter = Arc::new(limiter(2, 100));
        let calls = (0..5).map(|_| {
            let limiter = Arc::clone(&limiter);
            async move {
                limiter.acquire(1).await.unwrap();
                Instant::now()
            }
        });
        let mut admitted = futures::future::join_all(calls).await;
        admitted.sort();
        for pair in admitted.windows(3) {
            assert!(pair[2].duration_since(pair[0]) >= MINUTE_WINDOW);
        }
        assert_eq!(limiter.get_stats().total_requests, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn weighted_acquire_counts_each_unit() {
        let limiter = limiter(5, 100);
        limiter.acquire(3).await.unwrap();
        assert_eq!(limiter.get_stats().requests_last_minute, 3);

        let waited = limiter.acquire(3).await.unwrap();
        assert!(waited >= Duration::from_secs(61));
        assert_eq!(limiter.get_stats().requests_last_minute, 3);
        assert_eq!(limiter.get_stats().total_requests, 6);

        let err = limiter.acquire(6).await.unwrap_err();
        assert!(matches!(err, RateLimitError::WeightExceedsLimit { weight: 6, .. }));
        assert_eq!(limiter.acquire(0).await.unwrap(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn reset_discards_history_and_counters() {
        let limiter = limiter(2, 100);
        limiter.acquire(2).await.unwrap();
        limiter.trigger_cooldown(Duration::from_secs(30));
        limiter.reset();

        let stats = limiter.get_stats();
        assert_eq!(stats.total_requests, 0);
        assert_eq!(stats.requests_last_hour, 0);
        assert!(!stats.in_cooldown);
        assert_eq!(stats.max_per_minute, 2);
        assert_eq!(limiter.acquire(1).await.unwrap(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn wait_random_stays_within_bounds() {
        let limiter = limiter(10, 100);
        for _ in 0..10 {
            let delay = limiter.wait_random(2.0, 4.0).await;
            assert!(delay >= Duration::from_secs(2) && delay <= Duration::from_secs(4));
        }
        let reversed = limiter.wait_random(4.0, 2.0).await;
        assert!(reversed >= Duration::from_secs(2) && reversed <= Duration::from_secs(4));
        assert_eq!(limiter.wait_random(0.0, 0.0).await, Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn oversized_cooldown_is_capped() {
        let limiter = limiter(10, 100);
        limiter.trigger_cooldown(Duration::MAX);
        let stats = limiter.get_stats();
        assert!(stats.in_cooldown);
        assert!(stats.cooldown_remaining_secs <= MAX_COOLDOWN.as_secs_f64());
        assert!(stats.cooldown_remaining_secs > 99.0 * 365.0 * 24.0 * 3600.0);

        limiter.trigger_cooldown(Duration::from_secs(5));
        assert!(limiter.acquire(1).await.unwrap() < Duration::from_secs(6));
    }

    #[tokio::test(start_paused = true)]
    async fn wait_random_clamps_unbounded_inputs() {
        let limiter = limiter(10, 100);
        let capped = Duration::from_secs_f64(MAX_RANDOM_WAIT_SECS);
        assert_eq!(limiter.wait_random(f64::INFINITY, f64::INFINITY).await, capped);
        assert!(limiter.wait_random(1.0, f64::MAX).await <= capped);
        assert_eq!(limiter.wait_random(f64::NAN, f64::NAN).await, Duration::ZERO);
        assert_eq!(limiter.wait_random(-5.0, -1.0).await, Duration::ZERO);
    }
}
