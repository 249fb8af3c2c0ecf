use std::sync::Arc;

use async_trait::async_trait;
use axum::{
    body::Body,
    http::{HeaderName, HeaderValue},
    response::{IntoResponse, Response},
};

use crate::{
    context::RequestContext,
    error::{GatewayError, GatewayResult},
    metrics::MetricsRegistry,
    middleware::{ControlFlow, GatewayMiddleware},
    ratelimit::RateLimiter,
};

const LIMIT_KEY: &str = "ratelimit.limit";
const REMAINING_KEY: &str = "ratelimit.remaining";
const WINDOW_KEY: &str = "ratelimit.window";
const BUCKET_REMAINING_KEY: &str = "bucket.remaining";

/// Sliding-window check first, then the token bucket. The window caps
/// sustained volume per identity; the bucket shapes bursts. Backend
/// failure allows the request through — availability over strictness.
pub struct RateLimitMiddleware {
    limiter: RateLimiter,
    exempt_prefixes: Vec<String>,
    metrics: Arc<MetricsRegistry>,
}

impl RateLimitMiddleware {
    pub fn new(
        limiter: RateLimiter,
        exempt_prefixes: Vec<String>,
        metrics: Arc<MetricsRegistry>,
    ) -> Self {
        Self {
            limiter,
            exempt_prefixes,
            metrics,
        }
    }

    fn denied_response(&self, ctx: &RequestContext, retry_after_secs: u64) -> Response<Body> {
        self.metrics.incr_rate_limited();
        let mut response = GatewayError::RateLimited {
            retry_after_secs: retry_after_secs.max(1),
        }
        .into_response();
        attach_headers(ctx, &mut response);
        response
    }
}

#[async_trait]
impl GatewayMiddleware for RateLimitMiddleware {
    fn name(&self) -> &'static str {
        "rate-limit"
    }

    async fn on_request(&self, ctx: &mut RequestContext) -> GatewayResult<ControlFlow> {
        let path = ctx.uri.path();
        if self
            .exempt_prefixes
            .iter()
            .any(|prefix| path.starts_with(prefix))
        {
            return Ok(ControlFlow::Continue);
        }

        let identity = ctx.rate_limit_identity();

        ctx.metadata.insert(
            LIMIT_KEY.to_string(),
            self.limiter.window_limit().to_string(),
        );
        ctx.metadata.insert(
            WINDOW_KEY.to_string(),
            self.limiter.window_secs().to_string(),
        );

        match self.limiter.check_window(&identity).await {
            Ok(decision) => {
                ctx.metadata
                    .insert(REMAINING_KEY.to_string(), decision.remaining.to_string());
                if !decision.allowed {
                    return Ok(ControlFlow::ShortCircuit(
                        self.denied_response(ctx, decision.reset_in_secs),
                    ));
                }
            }
            Err(err) => {
                self.metrics.incr_limiter_fail_open();
                tracing::warn!(
                    request_id = %ctx.request_id,
                    error = %err.message(),
                    "window limiter backend failed; failing open"
                );
                return Ok(ControlFlow::Continue);
            }
        }

        match self.limiter.consume_token(&identity).await {
            Ok(decision) => {
                ctx.metadata.insert(
                    BUCKET_REMAINING_KEY.to_string(),
                    decision.remaining.to_string(),
                );
                if !decision.allowed {
                    return Ok(ControlFlow::ShortCircuit(
                        self.denied_response(ctx, decision.retry_after_secs),
                    ));
                }
            }
            Err(err) => {
                self.metrics.incr_limiter_fail_open();
                tracing::warn!(
                    request_id = %ctx.request_id,
                    error = %err.message(),
                    "token bucket backend failed; failing open"
                );
            }
        }

        Ok(ControlFlow::Continue)
    }

    async fn on_response(
        &self,
        ctx: &RequestContext,
        response: &mut Response<Body>,
    ) -> GatewayResult<()> {
        attach_headers(ctx, response);
        Ok(())
    }
}

fn attach_headers(ctx: &RequestContext, response: &mut Response<Body>) {
    let pairs = [
        (LIMIT_KEY, "x-ratelimit-limit"),
        (REMAINING_KEY, "x-ratelimit-remaining"),
        (WINDOW_KEY, "x-ratelimit-window"),
        (BUCKET_REMAINING_KEY, "x-tokenbucket-remaining"),
    ];
    for (meta_key, header) in pairs {
        if let Some(value) = ctx.metadata.get(meta_key)
            && let Ok(value) = HeaderValue::from_str(value)
        {
            response
                .headers_mut()
                .insert(HeaderName::from_static(header), value);
        }
    }
}
