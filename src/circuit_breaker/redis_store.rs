use std::{
    collections::HashMap,
    sync::Arc,
};

use async_trait::async_trait;
use redis::Script;

use crate::{
    circuit_breaker::{AdmitOutcome, CircuitRecord, CircuitState, CircuitStore},
    clock::Clock,
    config::CircuitBreakerConfig,
    error::GatewayResult,
    store::SharedStore,
};

// Each breaker operation is one server-side script, so concurrent gateway
// instances serialize their transitions in the store instead of racing.
// The hash has no TTL: breaker state survives gateway rollouts.
//
// Time is read from the store's own clock; the caller's wall clock is
// passed in and the later of the two wins.

const ADMIT_LUA: &str = r#"
redis.replicate_commands()

local key = KEYS[1]
local caller_now_ms = tonumber(ARGV[1])
local recovery_ms = tonumber(ARGV[2])
local probe_budget = tonumber(ARGV[3])

local t = redis.call('TIME')
local now_ms = t[1] * 1000 + math.floor(t[2] / 1000)
if caller_now_ms > now_ms then
  now_ms = caller_now_ms
end

local state = redis.call('HGET', key, 'state')
if not state or state == 'closed' then
  return {1, 0, 0}
end

if state == 'open' then
  local opened_at = tonumber(redis.call('HGET', key, 'opened_at_ms')) or 0
  local elapsed = now_ms - opened_at
  if elapsed >= recovery_ms then
    redis.call('HMSET', key, 'state', 'half_open', 'in_flight', 1, 'successes', 0)
    return {1, 1, 0}
  end
  local retry = math.ceil((recovery_ms - elapsed) / 1000)
  if retry < 1 then
    retry = 1
  end
  return {0, 0, retry}
end

local in_flight = tonumber(redis.call('HGET', key, 'in_flight')) or 0
if in_flight < probe_budget then
  redis.call('HSET', key, 'in_flight', in_flight + 1)
  return {1, 1, 0}
end
return {0, 0, 1}
"#;

const SUCCESS_LUA: &str = r#"
local key = KEYS[1]
local success_threshold = tonumber(ARGV[1])

local state = redis.call('HGET', key, 'state')
if state == 'half_open' then
  local successes = (tonumber(redis.call('HGET', key, 'successes')) or 0) + 1
  if successes >= success_threshold then
    redis.call('HMSET', key, 'state', 'closed', 'failures', 0, 'successes', 0, 'in_flight', 0, 'opened_at_ms', 0)
    return 1
  end
  local in_flight = tonumber(redis.call('HGET', key, 'in_flight')) or 0
  if in_flight > 0 then
    in_flight = in_flight - 1
  end
  redis.call('HMSET', key, 'successes', successes, 'in_flight', in_flight)
  return 0
end

if not state or state == 'closed' then
  redis.call('HMSET', key, 'state', 'closed', 'failures', 0)
  return 0
end

return 0
"#;

const FAILURE_LUA: &str = r#"
redis.replicate_commands()

local key = KEYS[1]
local failure_threshold = tonumber(ARGV[1])
local caller_now_ms = tonumber(ARGV[2])

local t = redis.call('TIME')
local now_ms = t[1] * 1000 + math.floor(t[2] / 1000)
if caller_now_ms > now_ms then
  now_ms = caller_now_ms
end

local state = redis.call('HGET', key, 'state')
if state == 'half_open' then
  local failures = (tonumber(redis.call('HGET', key, 'failures')) or 0) + 1
  redis.call('HMSET', key, 'state', 'open', 'failures', failures, 'opened_at_ms', now_ms, 'in_flight', 0, 'successes', 0)
  return 1
end

if not state or state == 'closed' then
  local failures = (tonumber(redis.call('HGET', key, 'failures')) or 0) + 1
  if failures >= failure_threshold then
    redis.call('HMSET', key, 'state', 'open', 'failures', failures, 'opened_at_ms', now_ms, 'in_flight', 0, 'successes', 0)
    return 1
  end
  redis.call('HSET', key, 'failures', failures)
  return 0
end

return 0
"#;

const RELEASE_LUA: &str = r#"
local key = KEYS[1]
if redis.call('HGET', key, 'state') == 'half_open' then
  local in_flight = tonumber(redis.call('HGET', key, 'in_flight')) or 0
  if in_flight > 0 then
    redis.call('HSET', key, 'in_flight', in_flight - 1)
  end
end
return 0
"#;

pub struct RedisCircuitStore {
    store: SharedStore,
    clock: Arc<dyn Clock>,
    admit_script: Script,
    success_script: Script,
    failure_script: Script,
    release_script: Script,
}

impl RedisCircuitStore {
    pub fn new(store: SharedStore, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            clock,
            admit_script: Script::new(ADMIT_LUA),
            success_script: Script::new(SUCCESS_LUA),
            failure_script: Script::new(FAILURE_LUA),
            release_script: Script::new(RELEASE_LUA),
        }
    }

    fn key(&self, service: &str) -> String {
        self.store.key(&format!("circuit:{service}"))
    }
}

#[async_trait]
impl CircuitStore for RedisCircuitStore {
    async fn admit(
        &self,
        service: &str,
        cfg: &CircuitBreakerConfig,
    ) -> GatewayResult<AdmitOutcome> {
        let mut conn = self.store.connection();
        let (admitted, probe, retry_after): (i64, i64, i64) = self
            .admit_script
            .key(self.key(service))
            .arg(self.clock.now_ms() as i64)
            .arg((cfg.recovery_timeout_secs * 1_000) as i64)
            .arg(cfg.probe_budget as i64)
            .invoke_async(&mut conn)
            .await?;

        if admitted == 1 {
            Ok(AdmitOutcome::Admitted { probe: probe == 1 })
        } else {
            Ok(AdmitOutcome::Rejected {
                retry_after_secs: retry_after.max(1) as u64,
            })
        }
    }

    async fn record_success(
        &self,
        service: &str,
        cfg: &CircuitBreakerConfig,
    ) -> GatewayResult<()> {
        let mut conn = self.store.connection();
        let closed: i64 = self
            .success_script
            .key(self.key(service))
            .arg(cfg.success_threshold as i64)
            .invoke_async(&mut conn)
            .await?;

        if closed == 1 {
            tracing::info!(service = %service, "circuit closed after recovery");
        }
        Ok(())
    }

    async fn record_failure(
        &self,
        service: &str,
        cfg: &CircuitBreakerConfig,
    ) -> GatewayResult<()> {
        let mut conn = self.store.connection();
        let opened: i64 = self
            .failure_script
            .key(self.key(service))
            .arg(cfg.failure_threshold as i64)
            .arg(self.clock.now_ms() as i64)
            .invoke_async(&mut conn)
            .await?;

        if opened == 1 {
            tracing::warn!(service = %service, "circuit opened");
        }
        Ok(())
    }

    async fn release_probe(&self, service: &str) -> GatewayResult<()> {
        let mut conn = self.store.connection();
        let _: i64 = self
            .release_script
            .key(self.key(service))
            .invoke_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn force_close(&self, service: &str) -> GatewayResult<()> {
        let mut conn = self.store.connection();
        let _: () = redis::cmd("HSET")
            .arg(self.key(service))
            .arg("state")
            .arg("closed")
            .arg("failures")
            .arg(0)
            .arg("successes")
            .arg(0)
            .arg("in_flight")
            .arg(0)
            .arg("opened_at_ms")
            .arg(0)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn load(&self, service: &str) -> GatewayResult<CircuitRecord> {
        let mut conn = self.store.connection();
        let fields: HashMap<String, String> = redis::cmd("HGETALL")
            .arg(self.key(service))
            .query_async(&mut conn)
            .await?;

        if fields.is_empty() {
            return Ok(CircuitRecord::default());
        }

        let get_u32 = |name: &str| {
            fields
                .get(name)
                .and_then(|v| v.parse::<u32>().ok())
                .unwrap_or(0)
        };
        let state = fields
            .get("state")
            .map(|s| CircuitState::parse(s))
            .unwrap_or(CircuitState::Closed);
        let opened_at_ms = fields
            .get("opened_at_ms")
            .and_then(|v| v.parse::<u64>().ok())
            .filter(|ms| *ms > 0 && state == CircuitState::Open);

        Ok(CircuitRecord {
            state,
            consecutive_failures: get_u32("failures"),
            consecutive_successes: get_u32("successes"),
            opened_at_ms,
            half_open_in_flight: get_u32("in_flight"),
        })
    }
}
