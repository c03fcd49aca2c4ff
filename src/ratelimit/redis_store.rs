//! Redis-backed rate limit store.
//!
//! Every strategy runs as a single Lua script, so the whole read-modify-write
//! is one atomic server-side step no matter how many instances share the
//! store. The scripts carry the same arithmetic as the `*_step` functions in
//! [`strategy`](super::strategy); keep them in sync.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{Client, Script};
use tracing::{debug, info};

use super::store::RateLimitStore;
use super::strategy::{BucketOutcome, CounterOutcome, LogOutcome};
use crate::error::{RateWardenError, Result};

const FIXED_WINDOW_SCRIPT: &str = r#"
local cost = tonumber(ARGV[1])
local limit = tonumber(ARGV[2])
local ttl = tonumber(ARGV[3])

local count = redis.call('INCRBY', KEYS[1], cost)
redis.call('EXPIRE', KEYS[1], ttl)
if count > limit then
  count = redis.call('DECRBY', KEYS[1], cost)
  return {0, count}
end
return {1, count}
"#;

const SLIDING_WINDOW_SCRIPT: &str = r#"
local key = KEYS[1]
local now = ARGV[1]
local cutoff = ARGV[2]
local cost = tonumber(ARGV[3])
local limit = tonumber(ARGV[4])
local ttl = tonumber(ARGV[5])
local member = ARGV[6]

redis.call('ZREMRANGEBYSCORE', key, '-inf', cutoff)
local count = redis.call('ZCARD', key)
local admitted = 0
if count + cost <= limit then
  -- never record behind the newest entry, so the log stays in time order
  local at = now
  local newest = redis.call('ZRANGE', key, -1, -1, 'WITHSCORES')
  if newest[2] and tonumber(newest[2]) > tonumber(now) then
    at = newest[2]
  end
  for i = 1, cost do
    redis.call('ZADD', key, at, member .. ':' .. i)
  end
  count = count + cost
  admitted = 1
end
redis.call('EXPIRE', key, ttl)

local oldest = redis.call('ZRANGE', key, 0, 0, 'WITHSCORES')
local oldest_score = ''
if oldest[2] then
  oldest_score = oldest[2]
end
return {admitted, count, oldest_score}
"#;

const TOKEN_BUCKET_SCRIPT: &str = r#"
local key = KEYS[1]
local cost = tonumber(ARGV[1])
local capacity = tonumber(ARGV[2])
local rate = tonumber(ARGV[3])
local now = tonumber(ARGV[4])
local ttl = tonumber(ARGV[5])
local eps = 1e-9

local state = redis.call('HMGET', key, 'level', 'updated_at')
local level = tonumber(state[1])
local updated_at = tonumber(state[2])
if level == nil or updated_at == nil then
  level = capacity
  updated_at = now
end

local elapsed = math.max(0, now - updated_at)
level = math.min(capacity, level + elapsed * rate)
local admitted = 0
if level + eps >= cost then
  level = math.max(0, level - cost)
  admitted = 1
end

local level_str = string.format('%.9f', level)
redis.call('HSET', key, 'level', level_str, 'updated_at', string.format('%.6f', math.max(now, updated_at)))
redis.call('EXPIRE', key, ttl)
return {admitted, level_str}
"#;

const LEAKY_BUCKET_SCRIPT: &str = r#"
local key = KEYS[1]
local cost = tonumber(ARGV[1])
local capacity = tonumber(ARGV[2])
local rate = tonumber(ARGV[3])
local now = tonumber(ARGV[4])
local ttl = tonumber(ARGV[5])
local eps = 1e-9

local state = redis.call('HMGET', key, 'level', 'updated_at')
local volume = tonumber(state[1])
local updated_at = tonumber(state[2])
if volume == nil or updated_at == nil then
  volume = 0
  updated_at = now
end

local elapsed = math.max(0, now - updated_at)
volume = math.max(0, volume - elapsed * rate)
local admitted = 0
if volume + cost <= capacity + eps then
  volume = volume + cost
  admitted = 1
end

local volume_str = string.format('%.9f', volume)
redis.call('HSET', key, 'level', volume_str, 'updated_at', string.format('%.6f', math.max(now, updated_at)))
redis.call('EXPIRE', key, ttl)
return {admitted, volume_str}
"#;

/// A rate limit store shared through Redis.
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
    fixed_window: Script,
    sliding_window: Script,
    token_bucket: Script,
    leaky_bucket: Script,
}

impl RedisStore {
    /// Connect to Redis at `url`.
    pub async fn connect(url: &str) -> Result<Self> {
        info!(url = %sanitize_url(url), "Connecting rate limit store to Redis");

        let client = Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;

        Ok(Self::with_connection(conn))
    }

    /// Build a store over an existing connection manager.
    pub fn with_connection(conn: ConnectionManager) -> Self {
        Self {
            conn,
            fixed_window: Script::new(FIXED_WINDOW_SCRIPT),
            sliding_window: Script::new(SLIDING_WINDOW_SCRIPT),
            token_bucket: Script::new(TOKEN_BUCKET_SCRIPT),
            leaky_bucket: Script::new(LEAKY_BUCKET_SCRIPT),
        }
    }
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore").finish_non_exhaustive()
    }
}

#[async_trait]
impl RateLimitStore for RedisStore {
    async fn fixed_window(
        &self,
        key: &str,
        cost: u64,
        limit: u64,
        _now: f64,
        ttl_secs: u64,
    ) -> Result<CounterOutcome> {
        let mut conn = self.conn.clone();
        let (admitted, count): (i64, i64) = self
            .fixed_window
            .key(key)
            .arg(cost)
            .arg(limit)
            .arg(ttl_secs)
            .invoke_async(&mut conn)
            .await?;

        Ok(CounterOutcome {
            admitted: admitted == 1,
            count: count.max(0) as u64,
        })
    }

    async fn sliding_window(
        &self,
        key: &str,
        cost: u64,
        limit: u64,
        window_secs: f64,
        now: f64,
        ttl_secs: u64,
    ) -> Result<LogOutcome> {
        let mut conn = self.conn.clone();
        let member = format!("{:.6}:{}", now, uuid::Uuid::new_v4());
        let (admitted, count, oldest): (i64, i64, String) = self
            .sliding_window
            .key(key)
            .arg(format!("{:.6}", now))
            .arg(format!("{:.6}", now - window_secs))
            .arg(cost)
            .arg(limit)
            .arg(ttl_secs)
            .arg(member)
            .invoke_async(&mut conn)
            .await?;

        Ok(LogOutcome {
            admitted: admitted == 1,
            count: count.max(0) as u64,
            oldest: parse_score(&oldest)?,
        })
    }

    async fn token_bucket(
        &self,
        key: &str,
        cost: f64,
        capacity: f64,
        rate: f64,
        now: f64,
        ttl_secs: u64,
    ) -> Result<BucketOutcome> {
        let mut conn = self.conn.clone();
        let (admitted, level): (i64, String) = self
            .token_bucket
            .key(key)
            .arg(cost)
            .arg(capacity)
            .arg(rate)
            .arg(format!("{:.6}", now))
            .arg(ttl_secs)
            .invoke_async(&mut conn)
            .await?;

        Ok(BucketOutcome {
            admitted: admitted == 1,
            level: parse_level(&level)?,
        })
    }

    async fn leaky_bucket(
        &self,
        key: &str,
        cost: f64,
        capacity: f64,
        rate: f64,
        now: f64,
        ttl_secs: u64,
    ) -> Result<BucketOutcome> {
        let mut conn = self.conn.clone();
        let (admitted, level): (i64, String) = self
            .leaky_bucket
            .key(key)
            .arg(cost)
            .arg(capacity)
            .arg(rate)
            .arg(format!("{:.6}", now))
            .arg(ttl_secs)
            .invoke_async(&mut conn)
            .await?;

        Ok(BucketOutcome {
            admitted: admitted == 1,
            level: parse_level(&level)?,
        })
    }

    async fn ping(&self) -> Result<()> {
        let mut conn = self.conn.clone();
        let pong: String = redis::cmd("PING").query_async(&mut conn).await?;
        debug!(reply = %pong, "Redis ping");
        Ok(())
    }

    fn name(&self) -> &'static str {
        "redis"
    }
}

fn parse_score(raw: &str) -> Result<Option<f64>> {
    if raw.is_empty() {
        return Ok(None);
    }
    raw.parse::<f64>()
        .map(Some)
        .map_err(|e| RateWardenError::Store(format!("invalid sorted set score '{}': {}", raw, e)))
}

fn parse_level(raw: &str) -> Result<f64> {
    raw.parse::<f64>()
        .map_err(|e| RateWardenError::Store(format!("invalid bucket level '{}': {}", raw, e)))
}

/// Strip credentials from a Redis URL before logging it.
fn sanitize_url(url: &str) -> String {
    match (url.find("://"), url.rfind('@')) {
        (Some(scheme_end), Some(at)) if at > scheme_end => {
            format!("{}://***@{}", &url[..scheme_end], &url[at + 1..])
        }
        _ => url.to_string(),
    }
}
