use std::{
    net::IpAddr,
    sync::Arc,
};

use axum::{
    body::{
        Body,
        to_bytes,
    },
    http::{
        HeaderName,
        HeaderValue,
        Request,
    },
    response::{
        IntoResponse,
        Response,
    },
};
use uuid::Uuid;

use crate::{
    admin,
    auth::{
        TokenAuthority,
        credentials::{CredentialStore, InMemoryCredentialStore},
    },
    circuit_breaker::{
        Admission,
        CircuitBreaker,
        CircuitStore,
        in_memory::InMemoryCircuitStore,
        redis_store::RedisCircuitStore,
    },
    clock::{Clock, SystemClock},
    config::{GatewayConfig, StoreConfig},
    context::RequestContext,
    error::{GatewayError, GatewayResult},
    metrics::MetricsRegistry,
    middleware::{
        ControlFlow,
        GatewayMiddleware,
        auth::BearerAuthMiddleware,
        logging::RequestLoggingMiddleware,
        rate_limit::RateLimitMiddleware,
        validation::RequestValidationMiddleware,
    },
    ratelimit::{
        RateLimitBackend,
        RateLimiter,
        in_memory::InMemoryRateLimitBackend,
        redis_backend::RedisRateLimitBackend,
    },
    router::RouteTable,
    store::SharedStore,
    upstream::Dispatcher,
};

/// Stamped on every response leaving the gateway, success or error.
const GATEWAY_RESPONSE_HEADERS: [(&str, &str); 3] = [
    ("x-content-type-options", "nosniff"),
    ("x-frame-options", "DENY"),
    ("referrer-policy", "no-referrer"),
];

pub struct Gateway {
    middlewares: Vec<Arc<dyn GatewayMiddleware>>,
    pub(crate) routes: Arc<RouteTable>,
    pub(crate) dispatcher: Dispatcher,
    pub(crate) breaker: CircuitBreaker,
    pub(crate) metrics: Arc<MetricsRegistry>,
    pub(crate) tokens: Arc<TokenAuthority>,
    pub(crate) credentials: Arc<dyn CredentialStore>,
    pub(crate) store: Option<SharedStore>,
    max_body_bytes: usize,
}

impl Gateway {
    pub async fn from_config(config: GatewayConfig) -> GatewayResult<Self> {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let metrics = Arc::new(MetricsRegistry::new());
        let routes = Arc::new(RouteTable::new(config.routes.clone()));

        let tokens = Arc::new(TokenAuthority::new(
            config.auth.secret.as_bytes().to_vec(),
            config.auth.permitted_algs.clone(),
            config.auth.clock_skew_secs,
            config.auth.token_ttl_secs,
            clock.clone(),
        ));

        let (store, limit_backend, circuit_store): (
            Option<SharedStore>,
            Arc<dyn RateLimitBackend>,
            Arc<dyn CircuitStore>,
        ) = match &config.store {
            StoreConfig::Redis { url, key_prefix } => {
                let store = SharedStore::connect(url, key_prefix.clone()).await?;
                (
                    Some(store.clone()),
                    Arc::new(RedisRateLimitBackend::new(store.clone(), clock.clone())),
                    Arc::new(RedisCircuitStore::new(store, clock.clone())),
                )
            }
            StoreConfig::InMemory => (
                None,
                Arc::new(InMemoryRateLimitBackend::new(clock.clone())),
                Arc::new(InMemoryCircuitStore::new(clock.clone())),
            ),
        };

        let limiter = RateLimiter::new(limit_backend, config.rate_limit.clone());
        let breaker = CircuitBreaker::new(
            config.circuit_breaker.clone(),
            circuit_store,
            metrics.clone(),
            clock.clone(),
        );

        // Fixed pipeline order: logging, request validation, auth (so the
        // limiter can key on the principal), then both rate limits. The
        // breaker check sits between route resolution and dispatch below.
        let middlewares: Vec<Arc<dyn GatewayMiddleware>> = vec![
            Arc::new(RequestLoggingMiddleware),
            Arc::new(RequestValidationMiddleware::new(config.validation.clone())),
            Arc::new(BearerAuthMiddleware::new(
                tokens.clone(),
                routes.clone(),
                config.auth.public_prefixes.clone(),
                metrics.clone(),
            )),
            Arc::new(RateLimitMiddleware::new(
                limiter,
                vec!["/health".to_string(), "/metrics".to_string()],
                metrics.clone(),
            )),
        ];

        Ok(Self {
            middlewares,
            routes,
            dispatcher: Dispatcher::new()?,
            breaker,
            metrics,
            tokens,
            credentials: Arc::new(InMemoryCredentialStore::new()),
            store,
            max_body_bytes: config.validation.max_body_bytes,
        })
    }

    pub async fn handle_http(
        &self,
        request: Request<Body>,
        client_ip: Option<IpAddr>,
    ) -> Response<Body> {
        let (parts, body) = request.into_parts();
        let max_capture = self.max_body_bytes.saturating_add(1);
        let body = match to_bytes(body, max_capture).await {
            Ok(body) => body,
            Err(_) => {
                // No context exists yet, so no hooks to unwind.
                let mut response = GatewayError::PayloadTooLarge.into_response();
                stamp_gateway_headers(&mut response, None);
                return response;
            }
        };

        let request_id = parts
            .headers
            .get("x-request-id")
            .and_then(|v| v.to_str().ok())
            .map(ToString::to_string)
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let mut ctx = RequestContext::new(
            request_id,
            parts.method,
            parts.uri,
            parts.headers,
            body,
            client_ip,
        );

        let mut executed = Vec::new();

        for (idx, middleware) in self.middlewares.iter().enumerate() {
            match middleware.on_request(&mut ctx).await {
                Ok(ControlFlow::Continue) => executed.push(idx),
                Ok(ControlFlow::ShortCircuit(response)) => {
                    return self.finalize(&executed, &ctx, response).await;
                }
                Err(err) => {
                    tracing::warn!(
                        request_id = %ctx.request_id,
                        middleware = middleware.name(),
                        error = %err.message(),
                        "middleware rejected request"
                    );
                    return self.finalize(&executed, &ctx, err.into_response()).await;
                }
            }
        }

        // Gateway-owned surface first; everything else is proxied.
        if let Some(response) = admin::dispatch(self, &ctx).await {
            return self.finalize(&executed, &ctx, response).await;
        }

        let (route, rest) = match self.routes.resolve(ctx.uri.path()) {
            Some(resolved) => (resolved.route.clone(), resolved.rest),
            None => {
                return self
                    .finalize(&executed, &ctx, GatewayError::RouteNotFound.into_response())
                    .await;
            }
        };
        ctx.route = Some(route.clone());

        if !route.public && !route.required_scopes.is_empty() {
            let scope_check = match &ctx.principal {
                Some(principal) => principal.ensure_scopes(&route.required_scopes),
                None => Err(crate::auth::AuthError::Missing),
            };
            if let Err(err) = scope_check {
                return self
                    .finalize(&executed, &ctx, GatewayError::Auth(err).into_response())
                    .await;
            }
        }

        let probe = match self.breaker.admit(&route.name).await {
            Admission::Granted { probe } => probe,
            Admission::Rejected { retry_after_secs } => {
                self.metrics.incr_breaker_rejected();
                let rejection = GatewayError::CircuitOpen {
                    service: route.name.clone(),
                    retry_after_secs,
                };
                return self
                    .finalize(&executed, &ctx, rejection.into_response())
                    .await;
            }
        };

        let dispatched = self.dispatcher.dispatch(&route, &rest, &ctx).await;

        if dispatched.failure {
            self.breaker.record_failure(&route.name, probe).await;
        } else {
            self.breaker.record_success(&route.name, probe).await;
        }

        let response = match dispatched.result {
            Ok(response) => response,
            Err(err) => err.into_response(),
        };
        self.metrics.record_proxied(
            &route.name,
            response.status().as_u16(),
            dispatched.latency,
        );

        self.finalize(&executed, &ctx, response).await
    }

    pub(crate) async fn store_up(&self) -> bool {
        match &self.store {
            Some(store) => store.ping().await,
            // Single-instance mode has no external store to probe.
            None => true,
        }
    }

    /// Every exit path funnels through here: unwind the `on_response` hook
    /// of each stage that ran (in reverse order), then stamp the request id
    /// and the fixed gateway header set on the way out.
    async fn finalize(
        &self,
        executed: &[usize],
        ctx: &RequestContext,
        mut response: Response<Body>,
    ) -> Response<Body> {
        for idx in executed.iter().rev() {
            let stage = &self.middlewares[*idx];
            if let Err(err) = stage.on_response(ctx, &mut response).await {
                tracing::warn!(
                    request_id = %ctx.request_id,
                    middleware = stage.name(),
                    error = %err.message(),
                    "middleware post-response hook failed"
                );
            }
        }

        stamp_gateway_headers(&mut response, Some(&ctx.request_id));
        response
    }
}

fn stamp_gateway_headers(response: &mut Response<Body>, request_id: Option<&str>) {
    let headers = response.headers_mut();
    for (name, value) in GATEWAY_RESPONSE_HEADERS {
        headers.insert(
            HeaderName::from_static(name),
            HeaderValue::from_static(value),
        );
    }

    if let Some(request_id) = request_id
        && let Ok(value) = HeaderValue::from_str(request_id)
    {
        headers.insert(HeaderName::from_static("x-request-id"), value);
    }
}
