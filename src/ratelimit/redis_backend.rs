use std::sync::Arc;

use async_trait::async_trait;
use redis::Script;

use crate::{
    clock::Clock,
    error::GatewayResult,
    ratelimit::{BucketDecision, RateLimitBackend, WindowDecision},
    store::SharedStore,
};

// Fixed-window counter: atomic increment-with-TTL. A post-increment count
// above the limit is decremented back so denied requests keep no budget.
const FIXED_WINDOW_LUA: &str = r#"
local key = KEYS[1]
local limit = tonumber(ARGV[1])
local ttl = tonumber(ARGV[2])

local count = redis.call('INCR', key)
if count == 1 then
  redis.call('EXPIRE', key, ttl)
end

if count > limit then
  redis.call('DECR', key)
  return {0, 0}
end

return {1, limit - count}
"#;

// Token bucket: refill by elapsed time, consume if enough. `now` comes from
// the store's own clock; the caller's wall clock is an argument and the
// later of the two wins, so a gateway instance with a fast clock cannot
// move the bucket backwards.
const TOKEN_BUCKET_LUA: &str = r#"
redis.replicate_commands()

local key = KEYS[1]
local capacity = tonumber(ARGV[1])
local refill = tonumber(ARGV[2])
local caller_now_ms = tonumber(ARGV[3])
local ttl = tonumber(ARGV[4])
local cost = tonumber(ARGV[5])

local t = redis.call('TIME')
local now_ms = t[1] * 1000 + math.floor(t[2] / 1000)
if caller_now_ms > now_ms then
  now_ms = caller_now_ms
end

local state = redis.call('HMGET', key, 'tokens', 'ts')
local tokens = tonumber(state[1])
local ts = tonumber(state[2])

if tokens == nil then
  tokens = capacity
  ts = now_ms
end

local delta_seconds = math.max(0, now_ms - ts) / 1000.0
tokens = math.min(capacity, tokens + (delta_seconds * refill))

local allowed = 0
local retry_after = 0

if tokens >= cost then
  tokens = tokens - cost
  allowed = 1
else
  retry_after = math.max(1, math.ceil((cost - tokens) / refill))
end

redis.call('HMSET', key, 'tokens', tokens, 'ts', now_ms)
redis.call('EXPIRE', key, ttl)

return {allowed, math.floor(tokens), retry_after}
"#;

pub struct RedisRateLimitBackend {
    store: SharedStore,
    clock: Arc<dyn Clock>,
    window_script: Script,
    bucket_script: Script,
}

impl RedisRateLimitBackend {
    pub fn new(store: SharedStore, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            clock,
            window_script: Script::new(FIXED_WINDOW_LUA),
            bucket_script: Script::new(TOKEN_BUCKET_LUA),
        }
    }
}

#[async_trait]
impl RateLimitBackend for RedisRateLimitBackend {
    async fn check_window(
        &self,
        identity: &str,
        limit: u64,
        window_secs: u64,
    ) -> GatewayResult<WindowDecision> {
        let mut conn = self.store.connection();
        let now_secs = self.clock.now_secs();
        let window_idx = now_secs / window_secs;
        let key = self
            .store
            .key(&format!("ratelimit:window:{identity}:{window_idx}"));
        // TTL spans two windows so a stale record never outlives its key.
        let ttl = (window_secs * 2) as i64;

        let (allowed, remaining): (i64, i64) = self
            .window_script
            .key(&key)
            .arg(limit as i64)
            .arg(ttl)
            .invoke_async(&mut conn)
            .await?;

        Ok(WindowDecision {
            allowed: allowed == 1,
            remaining: remaining.max(0) as u64,
            reset_in_secs: window_secs - (now_secs % window_secs),
        })
    }

    async fn consume_token(
        &self,
        identity: &str,
        capacity: u32,
        refill_per_sec: f64,
        cost: u32,
    ) -> GatewayResult<BucketDecision> {
        let mut conn = self.store.connection();
        let key = self.store.key(&format!("ratelimit:bucket:{identity}"));
        let ttl = ((capacity as f64 / refill_per_sec).ceil() as i64).max(1) * 2;

        let (allowed, remaining, retry_after): (i64, i64, i64) = self
            .bucket_script
            .key(&key)
            .arg(capacity as i64)
            .arg(refill_per_sec)
            .arg(self.clock.now_ms() as i64)
            .arg(ttl)
            .arg(cost as i64)
            .invoke_async(&mut conn)
            .await?;

        Ok(BucketDecision {
            allowed: allowed == 1,
            remaining: remaining.max(0) as u64,
            retry_after_secs: retry_after.max(0) as u64,
        })
    }
}
