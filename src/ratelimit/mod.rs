pub mod in_memory;
pub mod redis_backend;

use std::sync::Arc;

use async_trait::async_trait;

use crate::{
    config::RateLimitConfig,
    error::GatewayResult,
};

/// Outcome of a fixed-window check.
#[derive(Debug, Clone, Default)]
pub struct WindowDecision {
    pub allowed: bool,
    pub remaining: u64,
    pub reset_in_secs: u64,
}

/// Outcome of a token-bucket consume.
#[derive(Debug, Clone, Default)]
pub struct BucketDecision {
    pub allowed: bool,
    pub remaining: u64,
    pub retry_after_secs: u64,
}

#[async_trait]
pub trait RateLimitBackend: Send + Sync {
    /// Count a request against `identity`'s current window. A denied
    /// request must not consume window budget.
    async fn check_window(
        &self,
        identity: &str,
        limit: u64,
        window_secs: u64,
    ) -> GatewayResult<WindowDecision>;

    /// Refill `identity`'s bucket by elapsed time, then take `cost` tokens
    /// if available. Atomic in the backing store.
    async fn consume_token(
        &self,
        identity: &str,
        capacity: u32,
        refill_per_sec: f64,
        cost: u32,
    ) -> GatewayResult<BucketDecision>;
}

#[derive(Clone)]
pub struct RateLimiter {
    backend: Arc<dyn RateLimitBackend>,
    policy: RateLimitConfig,
}

impl RateLimiter {
    pub fn new(backend: Arc<dyn RateLimitBackend>, policy: RateLimitConfig) -> Self {
        Self { backend, policy }
    }

    pub fn window_limit(&self) -> u64 {
        self.policy.window_limit
    }

    pub fn window_secs(&self) -> u64 {
        self.policy.window_secs
    }

    pub async fn check_window(&self, identity: &str) -> GatewayResult<WindowDecision> {
        self.backend
            .check_window(identity, self.policy.window_limit, self.policy.window_secs)
            .await
    }

    pub async fn consume_token(&self, identity: &str) -> GatewayResult<BucketDecision> {
        self.backend
            .consume_token(
                identity,
                self.policy.bucket_capacity,
                self.policy.bucket_refill_per_sec,
                1,
            )
            .await
    }
}
