//! Per-platform fixed-window rate limiting
//!
//! Quotas are tracked per (subject, platform, endpoint, window) over a
//! pluggable [`CounterStore`]. Windows are fixed, not sliding: a counter is
//! created with a TTL on first increment and expires wholesale.
//!
//! Platforms without any configured limits are allowed through (fail-open),
//! logged once per platform. This mirrors the shipped behavior of the
//! platform integrations and is an explicit graceful-degradation policy.

use std::collections::{HashMap, HashSet};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::domain::errors::{DispatchError, DispatchResult};
use crate::domain::repositories::CounterStore;

static WINDOW_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(\d+)([smhd])$").expect("window spec pattern is valid")
});

/// A fixed time window such as `15m` or `24h`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct WindowSpec {
    value: u32,
    unit: WindowUnit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum WindowUnit {
    Seconds,
    Minutes,
    Hours,
    Days,
}

impl WindowSpec {
    pub const fn seconds(value: u32) -> Self {
        Self {
            value,
            unit: WindowUnit::Seconds,
        }
    }

    pub const fn minutes(value: u32) -> Self {
        Self {
            value,
            unit: WindowUnit::Minutes,
        }
    }

    pub const fn hours(value: u32) -> Self {
        Self {
            value,
            unit: WindowUnit::Hours,
        }
    }

    pub const fn days(value: u32) -> Self {
        Self {
            value,
            unit: WindowUnit::Days,
        }
    }

    pub fn duration(self) -> Duration {
        let secs = match self.unit {
            WindowUnit::Seconds => u64::from(self.value),
            WindowUnit::Minutes => u64::from(self.value) * 60,
            WindowUnit::Hours => u64::from(self.value) * 3600,
            WindowUnit::Days => u64::from(self.value) * 86_400,
        };
        Duration::from_secs(secs)
    }
}

impl std::fmt::Display for WindowSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let unit = match self.unit {
            WindowUnit::Seconds => 's',
            WindowUnit::Minutes => 'm',
            WindowUnit::Hours => 'h',
            WindowUnit::Days => 'd',
        };
        write!(f, "{}{}", self.value, unit)
    }
}

impl FromStr for WindowSpec {
    type Err = DispatchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let caps = WINDOW_RE
            .captures(s)
            .ok_or_else(|| DispatchError::Validation(format!("invalid time window: {s}")))?;
        let value: u32 = caps[1]
            .parse()
            .map_err(|_| DispatchError::Validation(format!("invalid time window: {s}")))?;
        let unit = match &caps[2] {
            "s" => WindowUnit::Seconds,
            "m" => WindowUnit::Minutes,
            "h" => WindowUnit::Hours,
            "d" => WindowUnit::Days,
            other => {
                return Err(DispatchError::Validation(format!(
                    "unknown time unit: {other}"
                )));
            }
        };
        Ok(Self { value, unit })
    }
}

impl TryFrom<String> for WindowSpec {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse().map_err(|e: DispatchError| e.to_string())
    }
}

impl From<WindowSpec> for String {
    fn from(w: WindowSpec) -> Self {
        w.to_string()
    }
}

/// One (window, limit) pair.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct WindowLimit {
    pub window: WindowSpec,
    pub limit: u64,
}

impl WindowLimit {
    pub const fn new(window: WindowSpec, limit: u64) -> Self {
        Self { window, limit }
    }
}

/// Limits for one platform: endpoint-pattern lists plus a default list.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PlatformLimits {
    /// Used when no endpoint pattern matches.
    #[serde(rename = "default", default)]
    pub default_limits: Vec<WindowLimit>,
    /// Endpoint-name-pattern (literal substring) to limits.
    #[serde(default)]
    pub endpoints: HashMap<String, Vec<WindowLimit>>,
}

/// Full rate-limit configuration, keyed by lowercase platform name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    pub platforms: HashMap<String, PlatformLimits>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self::builtin()
    }
}

impl RateLimitConfig {
    /// Built-in limits for the supported platforms, used when the operator
    /// supplies no `rate_limits` section.
    pub fn builtin() -> Self {
        fn limits(pairs: &[(WindowSpec, u64)]) -> Vec<WindowLimit> {
            pairs.iter().map(|&(w, l)| WindowLimit::new(w, l)).collect()
        }

        let mut platforms = HashMap::new();

        platforms.insert(
            "instagram".to_string(),
            PlatformLimits {
                default_limits: limits(&[
                    (WindowSpec::hours(1), 200),
                    (WindowSpec::hours(24), 1000),
                ]),
                endpoints: HashMap::from([
                    (
                        "media/publish".to_string(),
                        limits(&[(WindowSpec::hours(1), 25), (WindowSpec::hours(24), 100)]),
                    ),
                    (
                        "insights".to_string(),
                        limits(&[(WindowSpec::hours(1), 30)]),
                    ),
                ]),
            },
        );

        platforms.insert(
            "facebook".to_string(),
            PlatformLimits {
                default_limits: limits(&[
                    (WindowSpec::hours(1), 200),
                    (WindowSpec::hours(24), 1000),
                ]),
                endpoints: HashMap::from([(
                    "feed".to_string(),
                    limits(&[(WindowSpec::hours(1), 25), (WindowSpec::hours(24), 100)]),
                )]),
            },
        );

        platforms.insert(
            "twitter".to_string(),
            PlatformLimits {
                default_limits: limits(&[(WindowSpec::minutes(15), 100)]),
                endpoints: HashMap::from([
                    ("tweets".to_string(), limits(&[(WindowSpec::hours(3), 300)])),
                    (
                        "users".to_string(),
                        limits(&[(WindowSpec::minutes(15), 100)]),
                    ),
                ]),
            },
        );

        platforms.insert(
            "tiktok".to_string(),
            PlatformLimits {
                default_limits: limits(&[
                    (WindowSpec::minutes(1), 60),
                    (WindowSpec::hours(1), 3600),
                ]),
                endpoints: HashMap::from([
                    (
                        "video/upload".to_string(),
                        limits(&[(WindowSpec::hours(1), 10)]),
                    ),
                    (
                        "video/list".to_string(),
                        limits(&[(WindowSpec::minutes(1), 30)]),
                    ),
                ]),
            },
        );

        Self { platforms }
    }
}

/// Per-window status returned by [`RateLimiter::record`] and
/// [`RateLimiter::status`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WindowStatus {
    pub window: WindowSpec,
    pub limit: u64,
    pub remaining: u64,
    pub reset_at: Option<DateTime<Utc>>,
}

/// Outcome of recording one request against every configured window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordOutcome {
    /// False when the platform has no configuration (fail-open path).
    pub recorded: bool,
    pub windows: Vec<WindowStatus>,
}

/// Fixed-window quota gate over a pluggable counter store.
pub struct RateLimiter {
    store: Arc<dyn CounterStore>,
    config: RateLimitConfig,
    warned_platforms: std::sync::Mutex<HashSet<String>>,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn CounterStore>, config: RateLimitConfig) -> Self {
        Self {
            store,
            config,
            warned_platforms: std::sync::Mutex::new(HashSet::new()),
        }
    }

    /// Limiter over the in-memory store with the built-in platform table.
    pub fn in_memory() -> Self {
        Self::new(Arc::new(InMemoryCounterStore::new()), RateLimitConfig::builtin())
    }

    /// Resolve the limit list for an endpoint: the longest literal pattern
    /// contained in the endpoint name wins, falling back to the platform
    /// default. `None` means the platform is entirely unconfigured.
    fn limits_for(&self, platform: &str, endpoint: &str) -> Option<&[WindowLimit]> {
        let platform_limits = self.config.platforms.get(&platform.to_lowercase())?;

        let best = platform_limits
            .endpoints
            .iter()
            .filter(|(pattern, _)| endpoint.contains(pattern.as_str()))
            .max_by_key(|(pattern, _)| pattern.len())
            .map(|(_, limits)| limits.as_slice());

        best.or_else(|| {
            if platform_limits.default_limits.is_empty() {
                None
            } else {
                Some(platform_limits.default_limits.as_slice())
            }
        })
    }

    fn counter_key(subject: &str, platform: &str, endpoint: &str, window: WindowSpec) -> String {
        format!("ratelimit:{subject}:{platform}:{endpoint}:{window}")
    }

    fn warn_fail_open(&self, platform: &str) {
        let mut warned = self
            .warned_platforms
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if warned.insert(platform.to_string()) {
            warn!(
                platform,
                "no rate limits configured for platform, allowing requests (fail-open)"
            );
        }
    }

    /// Check every configured window without consuming quota.
    ///
    /// Returns false as soon as any window is at its limit (first violation
    /// wins). Unconfigured platforms are allowed through.
    pub async fn can_proceed(
        &self,
        subject: &str,
        platform: &str,
        endpoint: &str,
    ) -> DispatchResult<bool> {
        let Some(limits) = self.limits_for(platform, endpoint) else {
            self.warn_fail_open(platform);
            return Ok(true);
        };

        for wl in limits {
            let key = Self::counter_key(subject, platform, endpoint, wl.window);
            let count = self.store.get_count(&key).await?;
            if count >= wl.limit {
                debug!(key, count, limit = wl.limit, "rate limit window exhausted");
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Record one request against every configured window.
    ///
    /// Each counter is incremented atomically, created with a TTL equal to
    /// its window duration when absent.
    pub async fn record(
        &self,
        subject: &str,
        platform: &str,
        endpoint: &str,
    ) -> DispatchResult<RecordOutcome> {
        let Some(limits) = self.limits_for(platform, endpoint) else {
            return Ok(RecordOutcome {
                recorded: false,
                windows: Vec::new(),
            });
        };
        let limits = limits.to_vec();

        let mut windows = Vec::with_capacity(limits.len());
        for wl in limits {
            let key = Self::counter_key(subject, platform, endpoint, wl.window);
            let count = self.store.increment_count(&key, wl.window.duration()).await?;
            let ttl = self.store.get_ttl(&key).await?;
            windows.push(WindowStatus {
                window: wl.window,
                limit: wl.limit,
                remaining: wl.limit.saturating_sub(count),
                reset_at: ttl.map(|t| Utc::now() + chrono::Duration::seconds(t.as_secs() as i64)),
            });
        }

        Ok(RecordOutcome {
            recorded: true,
            windows,
        })
    }

    /// Read-only snapshot of every configured window for an endpoint.
    pub async fn status(
        &self,
        subject: &str,
        platform: &str,
        endpoint: &str,
    ) -> DispatchResult<Option<Vec<WindowStatus>>> {
        let Some(limits) = self.limits_for(platform, endpoint) else {
            return Ok(None);
        };
        let limits = limits.to_vec();

        let mut windows = Vec::with_capacity(limits.len());
        for wl in limits {
            let key = Self::counter_key(subject, platform, endpoint, wl.window);
            let count = self.store.get_count(&key).await?;
            let ttl = self.store.get_ttl(&key).await?;
            windows.push(WindowStatus {
                window: wl.window,
                limit: wl.limit,
                remaining: wl.limit.saturating_sub(count),
                reset_at: ttl.map(|t| Utc::now() + chrono::Duration::seconds(t.as_secs() as i64)),
            });
        }
        Ok(Some(windows))
    }

    /// Poll [`Self::can_proceed`] until it allows the request or `max_wait`
    /// elapses. Returns false on timeout.
    pub async fn await_availability(
        &self,
        subject: &str,
        platform: &str,
        endpoint: &str,
        max_wait: Duration,
        poll_interval: Duration,
    ) -> DispatchResult<bool> {
        let started = Instant::now();
        loop {
            if self.can_proceed(subject, platform, endpoint).await? {
                return Ok(true);
            }
            if started.elapsed() + poll_interval > max_wait {
                return Ok(false);
            }
            tokio::time::sleep(poll_interval).await;
        }
    }
}

struct CounterEntry {
    count: u64,
    expires_at: Instant,
}

/// In-memory counter store. Sufficient for a single process; increments are
/// serialized behind one mutex so concurrent callers can never lose an
/// update. Expired counters are purged on access.
#[derive(Default)]
pub struct InMemoryCounterStore {
    counters: Mutex<HashMap<String, CounterEntry>>,
}

impl InMemoryCounterStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn purge_expired(counters: &mut HashMap<String, CounterEntry>) {
        let now = Instant::now();
        counters.retain(|_, entry| entry.expires_at > now);
    }
}

#[async_trait::async_trait]
impl CounterStore for InMemoryCounterStore {
    async fn get_count(&self, key: &str) -> DispatchResult<u64> {
        let mut counters = self.counters.lock().await;
        Self::purge_expired(&mut counters);
        Ok(counters.get(key).map(|e| e.count).unwrap_or(0))
    }

    async fn increment_count(&self, key: &str, ttl: Duration) -> DispatchResult<u64> {
        let mut counters = self.counters.lock().await;
        Self::purge_expired(&mut counters);
        let entry = counters.entry(key.to_string()).or_insert_with(|| CounterEntry {
            count: 0,
            expires_at: Instant::now() + ttl,
        });
        entry.count += 1;
        Ok(entry.count)
    }

    async fn get_ttl(&self, key: &str) -> DispatchResult<Option<Duration>> {
        let mut counters = self.counters.lock().await;
        Self::purge_expired(&mut counters);
        let now = Instant::now();
        Ok(counters
            .get(key)
            .map(|e| e.expires_at.saturating_duration_since(now)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter_with(platform: &str, endpoint: &str, window: WindowSpec, limit: u64) -> RateLimiter {
        let mut platforms = HashMap::new();
        platforms.insert(
            platform.to_string(),
            PlatformLimits {
                default_limits: Vec::new(),
                endpoints: HashMap::from([(
                    endpoint.to_string(),
                    vec![WindowLimit::new(window, limit)],
                )]),
            },
        );
        RateLimiter::new(
            Arc::new(InMemoryCounterStore::new()),
            RateLimitConfig { platforms },
        )
    }

    #[test]
    fn window_spec_parsing() {
        assert_eq!("1h".parse::<WindowSpec>().unwrap(), WindowSpec::hours(1));
        assert_eq!("15m".parse::<WindowSpec>().unwrap(), WindowSpec::minutes(15));
        assert_eq!("24h".parse::<WindowSpec>().unwrap().duration(), Duration::from_secs(86_400));
        assert_eq!(WindowSpec::days(2).to_string(), "2d");
        assert!("h1".parse::<WindowSpec>().is_err());
        assert!("10x".parse::<WindowSpec>().is_err());
    }

    #[tokio::test]
    async fn denies_exactly_at_the_limit() {
        let limiter = limiter_with("instagram", "media/publish", WindowSpec::hours(1), 25);

        for i in 0..25 {
            assert!(
                limiter
                    .can_proceed("user-1", "instagram", "media/publish")
                    .await
                    .unwrap(),
                "call {} should be allowed",
                i + 1
            );
            limiter
                .record("user-1", "instagram", "media/publish")
                .await
                .unwrap();
        }

        // 26th check in the window is denied
        assert!(
            !limiter
                .can_proceed("user-1", "instagram", "media/publish")
                .await
                .unwrap()
        );
    }

    #[tokio::test]
    async fn subjects_are_isolated() {
        let limiter = limiter_with("tiktok", "video/upload", WindowSpec::hours(1), 1);
        limiter
            .record("user-1", "tiktok", "video/upload")
            .await
            .unwrap();

        assert!(!limiter.can_proceed("user-1", "tiktok", "video/upload").await.unwrap());
        assert!(limiter.can_proceed("user-2", "tiktok", "video/upload").await.unwrap());
    }

    #[tokio::test]
    async fn most_specific_pattern_wins() {
        let mut endpoints = HashMap::new();
        endpoints.insert("video".to_string(), vec![WindowLimit::new(WindowSpec::hours(1), 100)]);
        endpoints.insert(
            "video/upload".to_string(),
            vec![WindowLimit::new(WindowSpec::hours(1), 1)],
        );
        let mut platforms = HashMap::new();
        platforms.insert(
            "tiktok".to_string(),
            PlatformLimits {
                default_limits: vec![WindowLimit::new(WindowSpec::hours(1), 1000)],
                endpoints,
            },
        );
        let limiter = RateLimiter::new(
            Arc::new(InMemoryCounterStore::new()),
            RateLimitConfig { platforms },
        );

        // the tighter `video/upload` list applies, not the `video` one
        limiter.record("u", "tiktok", "v1/video/upload").await.unwrap();
        assert!(!limiter.can_proceed("u", "tiktok", "v1/video/upload").await.unwrap());
        // unrelated endpoint falls back to the default list
        assert!(limiter.can_proceed("u", "tiktok", "account/info").await.unwrap());
    }

    #[tokio::test]
    async fn unconfigured_platform_fails_open() {
        let limiter = limiter_with("tiktok", "video/upload", WindowSpec::hours(1), 1);
        assert!(limiter.can_proceed("u", "myspace", "anything").await.unwrap());
        let outcome = limiter.record("u", "myspace", "anything").await.unwrap();
        assert!(!outcome.recorded);
    }

    #[tokio::test]
    async fn record_reports_remaining_and_reset() {
        let limiter = limiter_with("instagram", "media/publish", WindowSpec::hours(1), 25);
        let outcome = limiter
            .record("user-1", "instagram", "media/publish")
            .await
            .unwrap();
        assert!(outcome.recorded);
        assert_eq!(outcome.windows.len(), 1);
        assert_eq!(outcome.windows[0].limit, 25);
        assert_eq!(outcome.windows[0].remaining, 24);
        assert!(outcome.windows[0].reset_at.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn window_expires_after_ttl() {
        let limiter = limiter_with("tiktok", "video/upload", WindowSpec::seconds(60), 1);
        limiter.record("u", "tiktok", "video/upload").await.unwrap();
        assert!(!limiter.can_proceed("u", "tiktok", "video/upload").await.unwrap());

        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(limiter.can_proceed("u", "tiktok", "video/upload").await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn await_availability_times_out_then_succeeds() {
        let limiter = Arc::new(limiter_with(
            "tiktok",
            "video/upload",
            WindowSpec::seconds(30),
            1,
        ));
        limiter.record("u", "tiktok", "video/upload").await.unwrap();

        // too short to outlive the window
        let ok = limiter
            .await_availability(
                "u",
                "tiktok",
                "video/upload",
                Duration::from_secs(5),
                Duration::from_secs(1),
            )
            .await
            .unwrap();
        assert!(!ok);

        // long enough for the window to expire
        let ok = limiter
            .await_availability(
                "u",
                "tiktok",
                "video/upload",
                Duration::from_secs(60),
                Duration::from_secs(1),
            )
            .await
            .unwrap();
        assert!(ok);
    }

    #[tokio::test]
    async fn concurrent_increments_are_not_lost() {
        let store = Arc::new(InMemoryCounterStore::new());
        let mut handles = Vec::new();
        for _ in 0..50 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                store
                    .increment_count("ratelimit:k", Duration::from_secs(600))
                    .await
                    .unwrap()
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(store.get_count("ratelimit:k").await.unwrap(), 50);
    }
}
