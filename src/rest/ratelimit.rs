//! Rate-limit discovery from response headers and per-bucket cooldown state.
//!
//! Routes start out with their own state. Once the host names the shared
//! bucket a route belongs to, the route is aliased onto that bucket and
//! every aliased route consults the same state.

use std::collections::HashMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::Deserialize;
use tokio::time::Instant;
use tracing::{debug, info};

pub const HEADER_REMAINING: &str = "x-ratelimit-remaining";
pub const HEADER_RESET: &str = "x-ratelimit-reset";
pub const HEADER_RESET_AFTER: &str = "x-ratelimit-reset-after";
pub const HEADER_BUCKET: &str = "x-ratelimit-bucket";
pub const HEADER_GLOBAL: &str = "x-ratelimit-global";
pub const HEADER_SCOPE: &str = "x-ratelimit-scope";
pub const HEADER_RETRY_AFTER: &str = "retry-after";

/// Broad outcome of a response, as far as admission cares.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusCategory {
    Success,
    RateLimited,
    ClientError,
    ServerError,
}

impl StatusCategory {
    pub fn from_status(status: u16) -> Self {
        match status {
            429 => StatusCategory::RateLimited,
            400..=499 => StatusCategory::ClientError,
            500..=599 => StatusCategory::ServerError,
            _ => StatusCategory::Success,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct RateLimitBody {
    retry_after: Option<f64>,
    #[serde(default)]
    global: bool,
}

/// Seconds from a header or body, rejecting negative, non-finite and
/// out-of-range values.
fn seconds(value: f64) -> Option<Duration> {
    Duration::try_from_secs_f64(value).ok()
}

/// Rate-limit metadata carried by one response.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RateLimitHeaders {
    pub remaining: Option<u32>,
    pub reset_after: Option<Duration>,
    pub bucket: Option<String>,
    pub global: bool,
    pub scope: Option<String>,
    pub retry_after: Option<Duration>,
}

impl RateLimitHeaders {
    /// Parse from lower-cased header names. A 429 body may add
    /// `retry_after` and `global`.
    pub fn parse(headers: &HashMap<String, String>, body: Option<&str>) -> Self {
        let get = |name: &str| headers.get(name).map(|v| v.trim());

        let reset_after = get(HEADER_RESET_AFTER)
            .and_then(|v| v.parse::<f64>().ok())
            .and_then(seconds)
            .or_else(|| {
                let reset_at = get(HEADER_RESET)?.parse::<f64>().ok()?;
                let now = SystemTime::now().duration_since(UNIX_EPOCH).ok()?;
                let delta = reset_at - now.as_secs_f64();
                if delta <= 0.0 {
                    Some(Duration::ZERO)
                } else {
                    seconds(delta)
                }
            });

        let mut parsed = Self {
            remaining: get(HEADER_REMAINING).and_then(|v| v.parse().ok()),
            reset_after,
            bucket: get(HEADER_BUCKET)
                .filter(|v| !v.is_empty())
                .map(str::to_string),
            global: get(HEADER_GLOBAL).is_some_and(|v| v.eq_ignore_ascii_case("true")),
            scope: get(HEADER_SCOPE).map(str::to_string),
            retry_after: get(HEADER_RETRY_AFTER)
                .and_then(|v| v.parse::<f64>().ok())
                .and_then(seconds),
        };

        if let Some(body) = body.and_then(|b| serde_json::from_str::<RateLimitBody>(b).ok()) {
            parsed.global |= body.global;
            if parsed.retry_after.is_none() {
                parsed.retry_after = body.retry_after.and_then(seconds);
            }
        }
        parsed
    }

    pub fn is_shared_scope(&self) -> bool {
        self.scope.as_deref() == Some("shared")
    }
}

/// Learned limit for one bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BucketState {
    pub remaining: u32,
    pub reset_at: Instant,
}

impl BucketState {
    fn is_expired(&self, now: Instant) -> bool {
        self.reset_at <= now
    }

    /// Keep the more restrictive view of one window.
    fn reconcile(&mut self, other: BucketState, now: Instant) {
        if self.is_expired(now) {
            *self = other;
            return;
        }
        self.remaining = self.remaining.min(other.remaining);
        self.reset_at = self.reset_at.max(other.reset_at);
    }
}

/// Outcome of feeding one response into the tracker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Observation {
    /// Bucket id the host assigned, if any.
    pub bucket_id: Option<String>,
    /// How long to wait before retrying, when the response was a 429.
    pub retry_after: Option<Duration>,
    pub global: bool,
}

/// Per-bucket and global rate-limit state.
#[derive(Debug, Default)]
pub struct RateLimitTracker {
    states: HashMap<String, BucketState>,
    aliases: HashMap<String, String>,
    global_until: Option<Instant>,
}

impl RateLimitTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn state_key(&self, route: &str) -> String {
        match self.aliases.get(route) {
            Some(bucket_id) => shared_key(bucket_id),
            None => route.to_string(),
        }
    }

    pub fn bucket_id(&self, route: &str) -> Option<&str> {
        self.aliases.get(route).map(String::as_str)
    }

    pub fn state(&self, route: &str) -> Option<BucketState> {
        self.states.get(&self.state_key(route)).copied()
    }

    /// Whether the route's limit has been learned for the current window.
    pub fn is_known(&self, route: &str, now: Instant) -> bool {
        self.state(route).is_some_and(|s| !s.is_expired(now))
    }

    pub fn global_wait(&self, now: Instant) -> Option<Duration> {
        self.global_until
            .filter(|until| *until > now)
            .map(|until| until - now)
    }

    /// Time the route must wait before its next request, if any.
    pub fn wait_time(&self, route: &str, now: Instant) -> Option<Duration> {
        if let Some(wait) = self.global_wait(now) {
            return Some(wait);
        }
        self.state(route)
            .filter(|s| s.remaining == 0 && !s.is_expired(now))
            .map(|s| s.reset_at - now)
    }

    /// Count an admitted request against the route's known remaining.
    pub fn consume(&mut self, route: &str, now: Instant) {
        let key = self.state_key(route);
        if let Some(state) = self.states.get_mut(&key) {
            if !state.is_expired(now) {
                state.remaining = state.remaining.saturating_sub(1);
            }
        }
    }

    /// Record the rate-limit metadata of a completed request.
    pub fn observe(
        &mut self,
        route: &str,
        status: u16,
        headers: &RateLimitHeaders,
        now: Instant,
        default_retry_after: Duration,
    ) -> Observation {
        if let Some(bucket_id) = &headers.bucket {
            self.alias(route, bucket_id, now);
        }

        if let (Some(remaining), Some(reset_after)) = (headers.remaining, headers.reset_after) {
            match now.checked_add(reset_after) {
                Some(reset_at) => self.update(route, BucketState { remaining, reset_at }, now),
                None => debug!(route, "ignoring unrepresentable rate limit reset"),
            }
        }

        let rate_limited = StatusCategory::from_status(status) == StatusCategory::RateLimited;
        let retry_after = rate_limited.then(|| {
            headers
                .retry_after
                .or(headers.reset_after)
                .filter(|wait| now.checked_add(*wait).is_some())
                .unwrap_or(default_retry_after)
        });

        if let Some(wait) = retry_after {
            if headers.global {
                let until = now + wait;
                self.global_until = Some(self.global_until.map_or(until, |u| u.max(until)));
                info!(route, wait_ms = wait.as_millis() as u64, "global rate limit hit");
            } else {
                // A 429 means the window is spent even if the headers disagree.
                self.update(
                    route,
                    BucketState {
                        remaining: 0,
                        reset_at: now + wait,
                    },
                    now,
                );
                debug!(route, wait_ms = wait.as_millis() as u64, "route rate limited");
            }
        }

        Observation {
            bucket_id: headers.bucket.clone(),
            retry_after,
            global: headers.global && rate_limited,
        }
    }

    fn update(&mut self, route: &str, incoming: BucketState, now: Instant) {
        let key = self.state_key(route);
        self.states
            .entry(key)
            .and_modify(|state| state.reconcile(incoming, now))
            .or_insert(incoming);
    }

    fn alias(&mut self, route: &str, bucket_id: &str, now: Instant) {
        if self.aliases.get(route).map(String::as_str) == Some(bucket_id) {
            return;
        }
        debug!(route, bucket_id, "route mapped to shared bucket");
        let current_key = self.state_key(route);
        let previous = self.states.remove(&current_key);
        self.aliases.insert(route.to_string(), bucket_id.to_string());
        if let Some(state) = previous {
            self.update(route, state, now);
        }
    }

    /// Forget a route whose queue was retired.
    ///
    /// The route's shared-bucket alias is dropped. A still-active shared
    /// window is copied onto the route key so a returning route keeps
    /// honouring it, and the shared entry goes once no alias names it.
    pub fn forget(&mut self, route: &str, now: Instant) {
        let Some(bucket_id) = self.aliases.remove(route) else {
            return;
        };
        let key = shared_key(&bucket_id);
        let still_shared = self.aliases.values().any(|other| *other == bucket_id);
        let active = if still_shared {
            self.states.get(&key).copied()
        } else {
            self.states.remove(&key)
        };
        if let Some(state) = active.filter(|s| !s.is_expired(now)) {
            self.states.insert(route.to_string(), state);
        }
    }

    /// Routes currently mapped onto a shared bucket.
    pub fn alias_count(&self) -> usize {
        self.aliases.len()
    }

    /// Bucket states held, shared or per route.
    pub fn state_count(&self) -> usize {
        self.states.len()
    }

    /// Drop expired state so long-running managers do not accumulate it.
    pub fn prune(&mut self, now: Instant) {
        self.states.retain(|_, state| !state.is_expired(now));
        if self.global_until.is_some_and(|until| until <= now) {
            self.global_until = None;
        }
    }

    pub fn is_globally_limited(&self, now: Instant) -> bool {
        self.global_wait(now).is_some()
    }
}

fn shared_key(bucket_id: &str) -> String {
    format!("bucket:{bucket_id}")
}
