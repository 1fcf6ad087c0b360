//! Fixed-window rate limiting keyed by caller identity.
//!
//! The counter lives in a shared [`CounterStore`]. Each hit increments the
//! window counter and, on the first hit of a window, arms its expiry in the
//! same atomic step. A window allows bursts of up to twice the limit across
//! its boundary.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use redis::Script;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

use crate::structs::UserId;

pub const KEY_PREFIX: &str = "rate_limit:";

/// How often the in-memory store drops expired windows.
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Increment, arm the expiry on the first hit, and repair a counter that
/// somehow lost its TTL. Returns `{count, ttl_seconds}`.
const HIT_SCRIPT: &str = r#"
local count = redis.call('INCR', KEYS[1])
if count == 1 then
    redis.call('EXPIRE', KEYS[1], ARGV[1])
end
local ttl = redis.call('TTL', KEYS[1])
if ttl < 0 then
    redis.call('EXPIRE', KEYS[1], ARGV[1])
    ttl = tonumber(ARGV[1])
end
return {count, ttl}
"#;

/// Who a request is counted against.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Identity {
    User(UserId),
    Ip(String),
}

impl Identity {
    pub fn counter_key(&self) -> String {
        format!("{KEY_PREFIX}{self}")
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::User(id) => write!(f, "user:{id}"),
            Self::Ip(addr) => write!(f, "ip:{addr}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitPolicy {
    pub limit: u32,
    pub window: Duration,
}

impl Default for RateLimitPolicy {
    fn default() -> Self {
        Self {
            limit: 100,
            window: Duration::from_secs(60),
        }
    }
}

/// Counter state right after a hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterHit {
    pub count: u64,
    pub ttl: Duration,
}

#[derive(Debug, thiserror::Error)]
pub enum RateLimitError {
    #[error("counter store unavailable: {0}")]
    Store(String),
    #[error("unexpected counter store reply: {0:?}")]
    Reply(Vec<i64>),
}

impl From<redis::RedisError> for RateLimitError {
    fn from(err: redis::RedisError) -> Self {
        Self::Store(err.to_string())
    }
}

/// Atomic increment-with-expiry over a shared counter namespace.
#[async_trait]
pub trait CounterStore: Send + Sync {
    async fn hit(&self, key: &str, window: Duration) -> Result<CounterHit, RateLimitError>;
}

pub struct RedisCounterStore {
    connection_manager: ConnectionManager,
    script: Script,
}

impl RedisCounterStore {
    pub async fn connect(url: &str) -> Result<Self, RateLimitError> {
        let client = redis::Client::open(url)?;
        let connection_manager = client.get_connection_manager().await?;
        Ok(Self {
            connection_manager,
            script: Script::new(HIT_SCRIPT),
        })
    }
}

#[async_trait]
impl CounterStore for RedisCounterStore {
    async fn hit(&self, key: &str, window: Duration) -> Result<CounterHit, RateLimitError> {
        let mut connection = self.connection_manager.clone();
        let reply: Vec<i64> = self
            .script
            .key(key)
            .arg(window.as_secs().max(1))
            .invoke_async(&mut connection)
            .await?;

        match reply.as_slice() {
            [count, ttl] if *count > 0 => Ok(CounterHit {
                count: u64::try_from(*count).unwrap_or(u64::MAX),
                ttl: Duration::from_secs(u64::try_from(*ttl).unwrap_or(0)),
            }),
            _ => Err(RateLimitError::Reply(reply)),
        }
    }
}

struct Window {
    count: u64,
    expires_at: Instant,
}

struct Windows {
    live: HashMap<String, Window>,
    last_sweep: Instant,
}

/// Process-local counters for development and tests. Not shared between
/// server instances.
pub struct MemoryCounterStore {
    windows: Mutex<Windows>,
}

impl MemoryCounterStore {
    pub fn new() -> Self {
        Self {
            windows: Mutex::new(Windows {
                live: HashMap::new(),
                last_sweep: Instant::now(),
            }),
        }
    }
}

impl Default for MemoryCounterStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CounterStore for MemoryCounterStore {
    async fn hit(&self, key: &str, window: Duration) -> Result<CounterHit, RateLimitError> {
        let now = Instant::now();
        let mut windows = self.windows.lock().await;

        if now.duration_since(windows.last_sweep) >= SWEEP_INTERVAL {
            windows.live.retain(|_, w| w.expires_at > now);
            windows.last_sweep = now;
        }

        let entry = windows.live.entry(key.to_string()).or_insert(Window {
            count: 0,
            expires_at: now + window,
        });
        if entry.expires_at <= now {
            entry.count = 0;
            entry.expires_at = now + window;
        }
        entry.count += 1;

        Ok(CounterHit {
            count: entry.count,
            ttl: entry.expires_at.saturating_duration_since(now),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitDecision {
    pub admitted: bool,
    pub limit: u32,
    pub remaining: u32,
    pub reset_at: DateTime<Utc>,
}

impl RateLimitDecision {
    /// Whole seconds until the window resets, rounded up.
    pub fn retry_after_secs(&self, now: DateTime<Utc>) -> i64 {
        let millis = (self.reset_at - now).num_milliseconds().max(0);
        (millis + 999) / 1000
    }
}

#[derive(Clone)]
pub struct RateLimiter {
    store: Arc<dyn CounterStore>,
    policy: RateLimitPolicy,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn CounterStore>, policy: RateLimitPolicy) -> Self {
        Self { store, policy }
    }

    /// Counts one request against `identity`. The hit is recorded whether
    /// or not the request is admitted.
    pub async fn check(&self, identity: &Identity) -> Result<RateLimitDecision, RateLimitError> {
        let hit = self
            .store
            .hit(&identity.counter_key(), self.policy.window)
            .await?;

        let limit = u64::from(self.policy.limit);
        let remaining = u32::try_from(limit.saturating_sub(hit.count)).unwrap_or(0);
        let ttl = chrono::Duration::from_std(hit.ttl).unwrap_or_else(|_| chrono::Duration::zero());

        debug!(
            identity = %identity,
            count = hit.count,
            limit = self.policy.limit,
            "Counted request"
        );

        Ok(RateLimitDecision {
            admitted: hit.count <= limit,
            limit: self.policy.limit,
            remaining,
            reset_at: Utc::now() + ttl,
        })
    }
}
