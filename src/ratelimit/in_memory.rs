use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::Mutex;

use crate::{
    clock::Clock,
    error::GatewayResult,
    ratelimit::{BucketDecision, RateLimitBackend, WindowDecision},
};

/// Process-local backend with the same quantized-window and bucket
/// semantics as the Redis scripts. Used in single-instance mode and tests.
pub struct InMemoryRateLimitBackend {
    windows: DashMap<String, Arc<Mutex<WindowSlot>>>,
    buckets: DashMap<String, Arc<Mutex<BucketSlot>>>,
    clock: Arc<dyn Clock>,
}

struct WindowSlot {
    window_idx: u64,
    count: u64,
}

struct BucketSlot {
    tokens: f64,
    last_refill_ms: u64,
}

impl InMemoryRateLimitBackend {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            windows: DashMap::new(),
            buckets: DashMap::new(),
            clock,
        }
    }
}

#[async_trait]
impl RateLimitBackend for InMemoryRateLimitBackend {
    async fn check_window(
        &self,
        identity: &str,
        limit: u64,
        window_secs: u64,
    ) -> GatewayResult<WindowDecision> {
        let now_secs = self.clock.now_secs();
        let window_idx = now_secs / window_secs;

        let slot = self
            .windows
            .entry(identity.to_string())
            .or_insert_with(|| {
                Arc::new(Mutex::new(WindowSlot {
                    window_idx,
                    count: 0,
                }))
            })
            .clone();
        let mut slot = slot.lock().await;

        if slot.window_idx != window_idx {
            slot.window_idx = window_idx;
            slot.count = 0;
        }

        let reset_in_secs = window_secs - (now_secs % window_secs);
        if slot.count + 1 > limit {
            return Ok(WindowDecision {
                allowed: false,
                remaining: 0,
                reset_in_secs,
            });
        }

        slot.count += 1;
        Ok(WindowDecision {
            allowed: true,
            remaining: limit - slot.count,
            reset_in_secs,
        })
    }

    async fn consume_token(
        &self,
        identity: &str,
        capacity: u32,
        refill_per_sec: f64,
        cost: u32,
    ) -> GatewayResult<BucketDecision> {
        let now_ms = self.clock.now_ms();

        let slot = self
            .buckets
            .entry(identity.to_string())
            .or_insert_with(|| {
                Arc::new(Mutex::new(BucketSlot {
                    tokens: capacity as f64,
                    last_refill_ms: now_ms,
                }))
            })
            .clone();
        let mut slot = slot.lock().await;

        let elapsed = now_ms.saturating_sub(slot.last_refill_ms) as f64 / 1_000.0;
        slot.last_refill_ms = now_ms;
        slot.tokens = (slot.tokens + elapsed * refill_per_sec).min(capacity as f64);

        let cost = cost as f64;
        if slot.tokens >= cost {
            slot.tokens -= cost;
            Ok(BucketDecision {
                allowed: true,
                remaining: slot.tokens.floor() as u64,
                retry_after_secs: 0,
            })
        } else {
            let needed = cost - slot.tokens;
            Ok(BucketDecision {
                allowed: false,
                remaining: slot.tokens.floor() as u64,
                retry_after_secs: (needed / refill_per_sec).ceil().max(1.0) as u64,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
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

    #[tokio::test]
    async fn window_remaining_is_non_increasing_and_denies_keep_budget() {
        let clock = ManualClock::new();
        let backend = InMemoryRateLimitBackend::new(clock.clone());

        // limit=3, window=10s: three allowed with remaining 2,1,0.
        for expected_remaining in [2u64, 1, 0] {
            let decision = backend.check_window("alice", 3, 10).await.unwrap();
            assert!(decision.allowed);
            assert_eq!(decision.remaining, expected_remaining);
        }

        // Fourth is denied and must not consume budget: remaining stays 0
        // and later denials report the same.
        let denied = backend.check_window("alice", 3, 10).await.unwrap();
        assert!(!denied.allowed);
        assert_eq!(denied.remaining, 0);
        assert!(denied.reset_in_secs <= 10);

        let denied = backend.check_window("alice", 3, 10).await.unwrap();
        assert!(!denied.allowed);
    }

    #[tokio::test]
    async fn window_resets_after_boundary() {
        let clock = ManualClock::new();
        let backend = InMemoryRateLimitBackend::new(clock.clone());

        for _ in 0..3 {
            backend.check_window("alice", 3, 10).await.unwrap();
        }
        assert!(!backend.check_window("alice", 3, 10).await.unwrap().allowed);

        clock.advance_secs(10);
        let decision = backend.check_window("alice", 3, 10).await.unwrap();
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 2);
    }

    #[tokio::test]
    async fn distinct_identities_have_distinct_budgets() {
        let clock = ManualClock::new();
        let backend = InMemoryRateLimitBackend::new(clock);

        for _ in 0..3 {
            assert!(backend.check_window("alice", 3, 10).await.unwrap().allowed);
        }
        assert!(!backend.check_window("alice", 3, 10).await.unwrap().allowed);
        // Bob's window is untouched by Alice's exhaustion.
        let decision = backend.check_window("bob", 3, 10).await.unwrap();
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 2);
    }

    #[tokio::test]
    async fn bucket_burst_then_refill() {
        let clock = ManualClock::new();
        let backend = InMemoryRateLimitBackend::new(clock.clone());

        // capacity=5, refill=1/s: five instant requests pass, sixth fails.
        for _ in 0..5 {
            assert!(
                backend
                    .consume_token("alice", 5, 1.0, 1)
                    .await
                    .unwrap()
                    .allowed
            );
        }
        let denied = backend.consume_token("alice", 5, 1.0, 1).await.unwrap();
        assert!(!denied.allowed);
        assert!(denied.retry_after_secs >= 1);

        // After 3s, exactly three more fit.
        clock.advance_secs(3);
        for _ in 0..3 {
            assert!(
                backend
                    .consume_token("alice", 5, 1.0, 1)
                    .await
                    .unwrap()
                    .allowed
            );
        }
        assert!(
            !backend
                .consume_token("alice", 5, 1.0, 1)
                .await
                .unwrap()
                .allowed
        );
    }

    #[tokio::test]
    async fn bucket_conservation_over_interval() {
        let clock = ManualClock::new();
        let backend = InMemoryRateLimitBackend::new(clock.clone());

        // capacity=10, refill=2/s over 5s: allowance bounded by C + r*t = 20.
        let mut allowed = 0u64;
        for step in 0..50 {
            if step > 0 && step % 10 == 0 {
                clock.advance_secs(1);
            }
            if backend
                .consume_token("alice", 10, 2.0, 1)
                .await
                .unwrap()
                .allowed
            {
                allowed += 1;
            }
        }
        assert!(allowed <= 20, "allowed {allowed} exceeds C + r*t");
    }

    #[tokio::test]
    async fn bucket_never_exceeds_capacity() {
        let clock = ManualClock::new();
        let backend = InMemoryRateLimitBackend::new(clock.clone());

        assert!(
            backend
                .consume_token("alice", 5, 1.0, 1)
                .await
                .unwrap()
                .allowed
        );
        // A long idle period refills to capacity, not beyond.
        clock.advance_secs(3_600);
        let decision = backend.consume_token("alice", 5, 1.0, 1).await.unwrap();
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 4);
    }
}
