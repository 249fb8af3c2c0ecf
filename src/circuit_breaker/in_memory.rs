use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::Mutex;

use crate::{
    circuit_breaker::{AdmitOutcome, CircuitRecord, CircuitState, CircuitStore},
    clock::Clock,
    config::CircuitBreakerConfig,
    error::GatewayResult,
};

/// Process-local circuit store: one mutex-guarded record per service, same
/// transition table as the Redis scripts. Single-instance mode and tests.
pub struct InMemoryCircuitStore {
    states: DashMap<String, Arc<Mutex<CircuitRecord>>>,
    clock: Arc<dyn Clock>,
}

impl InMemoryCircuitStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            states: DashMap::new(),
            clock,
        }
    }

    fn record_for(&self, service: &str) -> Arc<Mutex<CircuitRecord>> {
        self.states
            .entry(service.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(CircuitRecord::default())))
            .clone()
    }
}

#[async_trait]
impl CircuitStore for InMemoryCircuitStore {
    async fn admit(
        &self,
        service: &str,
        cfg: &CircuitBreakerConfig,
    ) -> GatewayResult<AdmitOutcome> {
        let record = self.record_for(service);
        let mut record = record.lock().await;
        let now_ms = self.clock.now_ms();

        match record.state {
            CircuitState::Closed => Ok(AdmitOutcome::Admitted { probe: false }),
            CircuitState::Open => {
                let opened_at = record.opened_at_ms.unwrap_or(0);
                let recovery_ms = cfg.recovery_timeout_secs * 1_000;
                let elapsed = now_ms.saturating_sub(opened_at);
                if elapsed >= recovery_ms {
                    record.state = CircuitState::HalfOpen;
                    record.half_open_in_flight = 1;
                    record.consecutive_successes = 0;
                    Ok(AdmitOutcome::Admitted { probe: true })
                } else {
                    let retry_after_secs = (recovery_ms - elapsed).div_ceil(1_000).max(1);
                    Ok(AdmitOutcome::Rejected { retry_after_secs })
                }
            }
            CircuitState::HalfOpen => {
                if record.half_open_in_flight < cfg.probe_budget {
                    record.half_open_in_flight += 1;
                    Ok(AdmitOutcome::Admitted { probe: true })
                } else {
                    Ok(AdmitOutcome::Rejected {
                        retry_after_secs: 1,
                    })
                }
            }
        }
    }

    async fn record_success(
        &self,
        service: &str,
        cfg: &CircuitBreakerConfig,
    ) -> GatewayResult<()> {
        let record = self.record_for(service);
        let mut record = record.lock().await;

        match record.state {
            CircuitState::HalfOpen => {
                if record.consecutive_successes + 1 >= cfg.success_threshold {
                    *record = CircuitRecord::default();
                } else {
                    record.consecutive_successes += 1;
                    record.half_open_in_flight = record.half_open_in_flight.saturating_sub(1);
                }
            }
            CircuitState::Closed => {
                record.consecutive_failures = 0;
            }
            // A response that raced the transition to Open changes nothing.
            CircuitState::Open => {}
        }
        Ok(())
    }

    async fn record_failure(
        &self,
        service: &str,
        cfg: &CircuitBreakerConfig,
    ) -> GatewayResult<()> {
        let record = self.record_for(service);
        let mut record = record.lock().await;
        let now_ms = self.clock.now_ms();

        match record.state {
            CircuitState::HalfOpen => {
                record.state = CircuitState::Open;
                record.opened_at_ms = Some(now_ms);
                record.consecutive_failures += 1;
                record.consecutive_successes = 0;
                record.half_open_in_flight = 0;
            }
            CircuitState::Closed => {
                record.consecutive_failures += 1;
                if record.consecutive_failures >= cfg.failure_threshold {
                    record.state = CircuitState::Open;
                    record.opened_at_ms = Some(now_ms);
                    record.consecutive_successes = 0;
                    record.half_open_in_flight = 0;
                }
            }
            CircuitState::Open => {}
        }
        Ok(())
    }

    async fn release_probe(&self, service: &str) -> GatewayResult<()> {
        let record = self.record_for(service);
        let mut record = record.lock().await;
        if record.state == CircuitState::HalfOpen {
            record.half_open_in_flight = record.half_open_in_flight.saturating_sub(1);
        }
        Ok(())
    }

    async fn force_close(&self, service: &str) -> GatewayResult<()> {
        let record = self.record_for(service);
        let mut record = record.lock().await;
        *record = CircuitRecord::default();
        Ok(())
    }

    async fn load(&self, service: &str) -> GatewayResult<CircuitRecord> {
        let record = self.record_for(service);
        let record = record.lock().await;
        Ok(record.clone())
    }
}
