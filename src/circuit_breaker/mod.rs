pub mod in_memory;
pub mod redis_store;

use std::{
    collections::VecDeque,
    sync::{
        Arc,
        Mutex,
    },
    time::{
        Duration,
        Instant,
    },
};

use async_trait::async_trait;
use dashmap::DashMap;
use serde::Serialize;

use crate::{
    clock::Clock,
    config::CircuitBreakerConfig,
    error::GatewayResult,
    metrics::MetricsRegistry,
};

/// Snapshots older than this are refreshed from the store before being
/// served to the admin/health surfaces. Admission never uses the cache.
const SNAPSHOT_MAX_AGE: Duration = Duration::from_secs(1);

/// Bound on outcome updates waiting for the store to come back.
const WRITE_BEHIND_CAPACITY: usize = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }

    pub fn parse(raw: &str) -> Self {
        match raw {
            "open" => Self::Open,
            "half_open" => Self::HalfOpen,
            _ => Self::Closed,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CircuitRecord {
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub opened_at_ms: Option<u64>,
    pub half_open_in_flight: u32,
}

impl Default for CircuitRecord {
    fn default() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            consecutive_successes: 0,
            opened_at_ms: None,
            half_open_in_flight: 0,
        }
    }
}

impl CircuitRecord {
    /// Whether a request would currently be admitted: Closed and HalfOpen
    /// are available, Open only once the recovery timeout has elapsed.
    pub fn is_available(&self, now_ms: u64, recovery_timeout_secs: u64) -> bool {
        match self.state {
            CircuitState::Open => {
                let opened_at = self.opened_at_ms.unwrap_or(0);
                now_ms.saturating_sub(opened_at) >= recovery_timeout_secs * 1_000
            }
            _ => true,
        }
    }
}

/// Result of an admission check against the store.
#[derive(Debug)]
pub enum AdmitOutcome {
    /// `probe` is true when a half-open slot was taken and must be
    /// released or resolved by an outcome.
    Admitted { probe: bool },
    Rejected { retry_after_secs: u64 },
}

#[async_trait]
pub trait CircuitStore: Send + Sync {
    async fn admit(
        &self,
        service: &str,
        cfg: &CircuitBreakerConfig,
    ) -> GatewayResult<AdmitOutcome>;

    async fn record_success(
        &self,
        service: &str,
        cfg: &CircuitBreakerConfig,
    ) -> GatewayResult<()>;

    async fn record_failure(
        &self,
        service: &str,
        cfg: &CircuitBreakerConfig,
    ) -> GatewayResult<()>;

    /// Give back a half-open slot without recording an outcome (cancelled
    /// probe).
    async fn release_probe(&self, service: &str) -> GatewayResult<()>;

    /// Admin reset: Closed with zero counters, idempotent.
    async fn force_close(&self, service: &str) -> GatewayResult<()>;

    async fn load(&self, service: &str) -> GatewayResult<CircuitRecord>;
}

/// Holds a half-open probe slot. Dropping the guard without an outcome
/// (client disconnected mid-probe) releases the slot so the budget
/// invariant survives cancellation.
pub struct ProbeGuard {
    service: String,
    store: Arc<dyn CircuitStore>,
    defused: bool,
}

impl ProbeGuard {
    fn new(service: &str, store: Arc<dyn CircuitStore>) -> Self {
        Self {
            service: service.to_string(),
            store,
            defused: false,
        }
    }

    /// The outcome recording owns the slot from here on.
    pub fn defuse(mut self) {
        self.defused = true;
    }
}

impl Drop for ProbeGuard {
    fn drop(&mut self) {
        if self.defused {
            return;
        }
        let store = self.store.clone();
        let service = self.service.clone();
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                if let Err(err) = store.release_probe(&service).await {
                    tracing::warn!(
                        service = %service,
                        error = %err.message(),
                        "failed to release half-open probe slot"
                    );
                }
            });
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum PendingOutcome {
    Success,
    Failure,
}

pub enum Admission {
    Granted { probe: Option<ProbeGuard> },
    Rejected { retry_after_secs: u64 },
}

/// Per-upstream circuit breaker over a shared store. Admission fails open
/// when the store is unreachable; outcome updates that cannot be persisted
/// are kept in a bounded drop-oldest queue and replayed on the next
/// successful store interaction.
pub struct CircuitBreaker {
    cfg: CircuitBreakerConfig,
    store: Arc<dyn CircuitStore>,
    metrics: Arc<MetricsRegistry>,
    clock: Arc<dyn Clock>,
    snapshots: DashMap<String, (CircuitRecord, Instant)>,
    pending: Mutex<VecDeque<(String, PendingOutcome)>>,
}

impl CircuitBreaker {
    pub fn new(
        cfg: CircuitBreakerConfig,
        store: Arc<dyn CircuitStore>,
        metrics: Arc<MetricsRegistry>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            cfg,
            store,
            metrics,
            clock,
            snapshots: DashMap::new(),
            pending: Mutex::new(VecDeque::new()),
        }
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.cfg
    }

    pub async fn admit(&self, service: &str) -> Admission {
        self.flush_pending().await;

        match self.store.admit(service, &self.cfg).await {
            Ok(AdmitOutcome::Admitted { probe }) => Admission::Granted {
                probe: probe.then(|| ProbeGuard::new(service, self.store.clone())),
            },
            Ok(AdmitOutcome::Rejected { retry_after_secs }) => {
                Admission::Rejected { retry_after_secs }
            }
            Err(err) => {
                // Cannot read breaker state: admit rather than block traffic.
                self.metrics.incr_store_errors();
                tracing::warn!(
                    service = %service,
                    error = %err.message(),
                    "circuit store unreachable on admission; failing open"
                );
                Admission::Granted { probe: None }
            }
        }
    }

    pub async fn record_success(&self, service: &str, probe: Option<ProbeGuard>) {
        if let Some(probe) = probe {
            probe.defuse();
        }
        self.flush_pending().await;
        if let Err(err) = self.store.record_success(service, &self.cfg).await {
            self.metrics.incr_store_errors();
            tracing::warn!(
                service = %service,
                error = %err.message(),
                "could not persist breaker success; queueing"
            );
            self.enqueue(service, PendingOutcome::Success);
        }
        self.snapshots.remove(service);
    }

    pub async fn record_failure(&self, service: &str, probe: Option<ProbeGuard>) {
        if let Some(probe) = probe {
            probe.defuse();
        }
        self.flush_pending().await;
        if let Err(err) = self.store.record_failure(service, &self.cfg).await {
            self.metrics.incr_store_errors();
            tracing::warn!(
                service = %service,
                error = %err.message(),
                "could not persist breaker failure; queueing"
            );
            self.enqueue(service, PendingOutcome::Failure);
        }
        self.snapshots.remove(service);
    }

    pub async fn force_close(&self, service: &str) -> GatewayResult<()> {
        self.store.force_close(service).await?;
        self.snapshots.remove(service);
        Ok(())
    }

    /// Read-side view with bounded staleness for listing endpoints.
    pub async fn snapshot(&self, service: &str) -> CircuitRecord {
        if let Some(entry) = self.snapshots.get(service)
            && entry.1.elapsed() <= SNAPSHOT_MAX_AGE
        {
            return entry.0.clone();
        }

        match self.store.load(service).await {
            Ok(record) => {
                self.snapshots
                    .insert(service.to_string(), (record.clone(), Instant::now()));
                record
            }
            Err(_) => {
                self.metrics.incr_store_errors();
                // Serve the stale entry if we have one, else assume closed.
                self.snapshots
                    .get(service)
                    .map(|e| e.0.clone())
                    .unwrap_or_default()
            }
        }
    }

    pub fn is_available(&self, record: &CircuitRecord) -> bool {
        record.is_available(self.clock.now_ms(), self.cfg.recovery_timeout_secs)
    }

    fn enqueue(&self, service: &str, outcome: PendingOutcome) {
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        if pending.len() >= WRITE_BEHIND_CAPACITY {
            pending.pop_front();
        }
        pending.push_back((service.to_string(), outcome));
    }

    async fn flush_pending(&self) {
        loop {
            let next = {
                let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
                pending.pop_front()
            };
            let Some((service, outcome)) = next else {
                return;
            };

            let result = match outcome {
                PendingOutcome::Success => self.store.record_success(&service, &self.cfg).await,
                PendingOutcome::Failure => self.store.record_failure(&service, &self.cfg).await,
            };

            if result.is_err() {
                let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
                pending.push_front((service, outcome));
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit_breaker::in_memory::InMemoryCircuitStore;
    use std::sync::atomic::{
        AtomicU64,
        Ordering,
    };

    #[derive(Debug)]
    struct ManualClock {
        now_ms: AtomicU64,
    }

    impl ManualClock {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                now_ms: AtomicU64::new(1_000_000_000),
            })
        }

        fn advance_secs(&self, secs: u64) {
            self.now_ms.fetch_add(secs * 1_000, Ordering::SeqCst);
        }
    }

    impl Clock for ManualClock {
        fn now_ms(&self) -> u64 {
            self.now_ms.load(Ordering::SeqCst)
        }
    }

    fn cfg() -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: 3,
            recovery_timeout_secs: 30,
            success_threshold: 2,
            probe_budget: 1,
        }
    }

    fn breaker(clock: Arc<ManualClock>) -> CircuitBreaker {
        let store = Arc::new(InMemoryCircuitStore::new(clock.clone()));
        CircuitBreaker::new(
            cfg(),
            store,
            Arc::new(MetricsRegistry::new()),
            clock,
        )
    }

    async fn fail_once(breaker: &CircuitBreaker, service: &str) {
        match breaker.admit(service).await {
            Admission::Granted { probe } => breaker.record_failure(service, probe).await,
            Admission::Rejected { .. } => panic!("expected admission"),
        }
    }

    #[tokio::test]
    async fn opens_after_consecutive_failures() {
        let clock = ManualClock::new();
        let breaker = breaker(clock.clone());

        for _ in 0..3 {
            fail_once(&breaker, "users").await;
        }

        match breaker.admit("users").await {
            Admission::Rejected { retry_after_secs } => {
                assert!(retry_after_secs > 0 && retry_after_secs <= 30);
            }
            Admission::Granted { .. } => panic!("circuit should be open"),
        }
    }

    #[tokio::test]
    async fn success_resets_failure_streak_in_closed() {
        let clock = ManualClock::new();
        let breaker = breaker(clock.clone());

        fail_once(&breaker, "users").await;
        fail_once(&breaker, "users").await;
        match breaker.admit("users").await {
            Admission::Granted { probe } => breaker.record_success("users", probe).await,
            Admission::Rejected { .. } => panic!("expected admission"),
        }
        // The streak restarted, so two more failures do not trip it.
        fail_once(&breaker, "users").await;
        fail_once(&breaker, "users").await;
        assert!(matches!(
            breaker.admit("users").await,
            Admission::Granted { .. }
        ));
    }

    #[tokio::test]
    async fn recovers_through_half_open_probes() {
        let clock = ManualClock::new();
        let breaker = breaker(clock.clone());

        for _ in 0..3 {
            fail_once(&breaker, "users").await;
        }
        assert!(matches!(
            breaker.admit("users").await,
            Admission::Rejected { .. }
        ));

        clock.advance_secs(30);

        // First probe admitted; success_threshold=2 keeps it half-open
        // after one success, closed after the second.
        for _ in 0..2 {
            match breaker.admit("users").await {
                Admission::Granted { probe } => {
                    assert!(probe.is_some(), "recovery requests are probes");
                    breaker.record_success("users", probe).await;
                }
                Admission::Rejected { .. } => panic!("probe should be admitted"),
            }
        }

        let record = breaker.snapshot("users").await;
        assert_eq!(record.state, CircuitState::Closed);
        assert_eq!(record.consecutive_failures, 0);
    }

    #[tokio::test]
    async fn half_open_failure_reopens() {
        let clock = ManualClock::new();
        let breaker = breaker(clock.clone());

        for _ in 0..3 {
            fail_once(&breaker, "users").await;
        }
        clock.advance_secs(30);

        match breaker.admit("users").await {
            Admission::Granted { probe } => breaker.record_failure("users", probe).await,
            Admission::Rejected { .. } => panic!("probe should be admitted"),
        }

        assert!(matches!(
            breaker.admit("users").await,
            Admission::Rejected { .. }
        ));
    }

    #[tokio::test]
    async fn probe_budget_bounds_half_open_admissions() {
        let clock = ManualClock::new();
        let breaker = breaker(clock.clone());

        for _ in 0..3 {
            fail_once(&breaker, "users").await;
        }
        clock.advance_secs(30);

        // Budget is 1: the first recovery request takes the only slot, a
        // second concurrent request is rejected while it is in flight.
        let Admission::Granted { probe: Some(_slot) } = breaker.admit("users").await else {
            panic!("first recovery request should take the probe slot");
        };
        assert!(matches!(
            breaker.admit("users").await,
            Admission::Rejected { .. }
        ));
        drop(_slot);
    }

    #[tokio::test]
    async fn dropped_probe_releases_slot() {
        let clock = ManualClock::new();
        let breaker = breaker(clock.clone());

        for _ in 0..3 {
            fail_once(&breaker, "users").await;
        }
        clock.advance_secs(30);

        match breaker.admit("users").await {
            Admission::Granted { probe } => drop(probe),
            Admission::Rejected { .. } => panic!("probe should be admitted"),
        }
        // Release happens on a spawned task.
        tokio::task::yield_now().await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(matches!(
            breaker.admit("users").await,
            Admission::Granted { probe: Some(_) }
        ));
    }

    #[tokio::test]
    async fn reset_is_idempotent() {
        let clock = ManualClock::new();
        let breaker = breaker(clock.clone());

        for _ in 0..3 {
            fail_once(&breaker, "users").await;
        }

        for _ in 0..2 {
            breaker.force_close("users").await.unwrap();
            let record = breaker.snapshot("users").await;
            assert_eq!(record.state, CircuitState::Closed);
            assert_eq!(record.consecutive_failures, 0);
            assert_eq!(record.consecutive_successes, 0);
            assert_eq!(record.half_open_in_flight, 0);
            assert!(record.opened_at_ms.is_none());
        }

        assert!(matches!(
            breaker.admit("users").await,
            Admission::Granted { .. }
        ));
    }

    #[tokio::test]
    async fn distinct_services_do_not_interfere() {
        let clock = ManualClock::new();
        let breaker = breaker(clock.clone());

        for _ in 0..3 {
            fail_once(&breaker, "users").await;
        }

        assert!(matches!(
            breaker.admit("users").await,
            Admission::Rejected { .. }
        ));
        assert!(matches!(
            breaker.admit("orders").await,
            Admission::Granted { .. }
        ));
    }
}
