//! Shared counter store on Redis.
//!
//! Each multi-step update is shipped as a Lua script so it runs atomically
//! on the server, no matter how many limiter processes race on a key.
//! Client and network failures are reported as [`StoreError::Unavailable`].

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{Client, RedisError, Script};
use tracing::{info, trace};

use super::{
    ttl_millis, CounterScript, CounterStore, ScriptOutput, SlidingWindowOutcome, StoreError,
    StoreResult, TokenBucketOutcome,
};

/// INCR, attaching the TTL whenever the key has none (i.e. it was just created).
const INCREMENT_WITH_EXPIRY: &str = r#"
local value = redis.call('INCR', KEYS[1])
if redis.call('PTTL', KEYS[1]) < 0 then
  redis.call('PEXPIRE', KEYS[1], ARGV[1])
end
return value
"#;

/// Sorted-set log scored by timestamp. Returns {admitted, count, oldest or -1}.
const SLIDING_WINDOW: &str = r#"
local key = KEYS[1]
local now = tonumber(ARGV[1])
local window = tonumber(ARGV[2])
local limit = tonumber(ARGV[3])

redis.call('ZREMRANGEBYSCORE', key, '-inf', now - window)
local count = redis.call('ZCARD', key)
local admitted = 0
if count < limit then
  redis.call('ZADD', key, now, ARGV[4])
  count = count + 1
  admitted = 1
end
redis.call('PEXPIRE', key, window)

local oldest = -1
local head = redis.call('ZRANGE', key, 0, 0, 'WITHSCORES')
if head[2] then
  oldest = tonumber(head[2])
end
return {admitted, count, oldest}
"#;

/// Hash {tokens, last_refill}. Returns {admitted, tokens, floor(last_refill)}.
const TOKEN_BUCKET: &str = r#"
local key = KEYS[1]
local now = tonumber(ARGV[1])
local capacity = tonumber(ARGV[2])
local interval = tonumber(ARGV[3])
local ttl = tonumber(ARGV[4])

local state = redis.call('HMGET', key, 'tokens', 'last_refill')
local tokens = tonumber(state[1])
local last = tonumber(state[2])
if tokens == nil or last == nil then
  tokens = capacity
  last = now
end

if now > last then
  local intervals = math.floor((now - last) / interval)
  if intervals >= 1 then
    tokens = math.min(capacity, tokens + intervals)
    last = last + intervals * interval
  end
end
if tokens >= capacity then
  last = now
end

local admitted = 0
if tokens >= 1 then
  tokens = tokens - 1
  admitted = 1
end

redis.call('HSET', key, 'tokens', tokens, 'last_refill', string.format('%.3f', last))
redis.call('PEXPIRE', key, ttl)
return {admitted, tokens, math.floor(last)}
"#;

fn unavailable(err: RedisError) -> StoreError {
    StoreError::Unavailable(format!("redis: {}", err))
}

fn malformed(script: &str, reply: &[i64]) -> StoreError {
    StoreError::Unavailable(format!("redis: malformed {} reply {:?}", script, reply))
}

/// Counter store shared by every limiter process pointed at the same Redis.
pub struct RedisStore {
    connection: ConnectionManager,
    increment: Script,
    sliding_window: Script,
    token_bucket: Script,
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore").finish_non_exhaustive()
    }
}

impl RedisStore {
    /// Connect to `url`, giving up after `timeout`.
    pub async fn connect(url: &str, timeout: Duration) -> StoreResult<Self> {
        let client = Client::open(url).map_err(unavailable)?;
        let connection = tokio::time::timeout(timeout, ConnectionManager::new(client))
            .await
            .map_err(|_| {
                StoreError::Unavailable(format!("redis: connect timed out after {:?}", timeout))
            })?
            .map_err(unavailable)?;

        info!(backend = "redis", "Connected to counter store");

        Ok(Self {
            connection,
            increment: Script::new(INCREMENT_WITH_EXPIRY),
            sliding_window: Script::new(SLIDING_WINDOW),
            token_bucket: Script::new(TOKEN_BUCKET),
        })
    }
}

#[async_trait]
impl CounterStore for RedisStore {
    async fn get(&self, key: &str) -> StoreResult<Option<i64>> {
        let mut connection = self.connection.clone();
        redis::cmd("GET")
            .arg(key)
            .query_async::<_, Option<i64>>(&mut connection)
            .await
            .map_err(unavailable)
    }

    async fn set(&self, key: &str, value: i64, ttl: Duration) -> StoreResult<()> {
        let mut connection = self.connection.clone();
        redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query_async::<_, ()>(&mut connection)
            .await
            .map_err(unavailable)
    }

    async fn increment_with_expiry(&self, key: &str, ttl: Duration) -> StoreResult<i64> {
        let mut connection = self.connection.clone();
        let value = self
            .increment
            .key(key)
            .arg(ttl_millis(ttl))
            .invoke_async::<_, i64>(&mut connection)
            .await
            .map_err(unavailable)?;

        trace!(key = %key, value = value, "Incremented counter");
        Ok(value)
    }

    async fn eval(&self, key: &str, script: &CounterScript) -> StoreResult<ScriptOutput> {
        let mut connection = self.connection.clone();

        let output = match script {
            CounterScript::SlidingWindow {
                now_ms,
                window_ms,
                limit,
                member,
            } => {
                let reply = self
                    .sliding_window
                    .key(key)
                    .arg(*now_ms)
                    .arg(*window_ms)
                    .arg(*limit)
                    .arg(member.as_str())
                    .invoke_async::<_, Vec<i64>>(&mut connection)
                    .await
                    .map_err(unavailable)?;

                let &[admitted, count, oldest] = reply.as_slice() else {
                    return Err(malformed(script.name(), &reply));
                };
                ScriptOutput::SlidingWindow(SlidingWindowOutcome {
                    admitted: admitted == 1,
                    count: count.max(0) as u64,
                    oldest_ms: (oldest >= 0).then_some(oldest as u64),
                })
            }
            CounterScript::TokenBucket {
                now_ms,
                capacity,
                interval_ms,
                ttl_ms,
            } => {
                let reply = self
                    .token_bucket
                    .key(key)
                    .arg(*now_ms)
                    .arg(*capacity)
                    .arg(*interval_ms)
                    .arg(*ttl_ms)
                    .invoke_async::<_, Vec<i64>>(&mut connection)
                    .await
                    .map_err(unavailable)?;

                let &[admitted, tokens, last_refill] = reply.as_slice() else {
                    return Err(malformed(script.name(), &reply));
                };
                ScriptOutput::TokenBucket(TokenBucketOutcome {
                    admitted: admitted == 1,
                    tokens: tokens.max(0) as u64,
                    last_refill_ms: last_refill.max(0) as u64,
                })
            }
        };

        trace!(key = %key, script = script.name(), output = ?output, "Evaluated counter script");
        Ok(output)
    }

    fn backend_name(&self) -> &'static str {
        "redis"
    }
}
