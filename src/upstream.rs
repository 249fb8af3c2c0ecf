use axum::body::Body;
use axum::response::Response;
use http::header::HeaderName;
use std::time::{
    Duration,
    Instant,
};

use crate::{
    context::RequestContext,
    error::{GatewayError, GatewayResult},
    router::ServiceRoute,
};

/// Result of one forwarding attempt. `latency` is measured up to response
/// headers; `failure` is the breaker classification (status ≥ 500, connect
/// error, or timeout — client 4xx is not an upstream fault).
pub struct Dispatched {
    pub result: GatewayResult<Response<Body>>,
    pub latency: Duration,
    pub failure: bool,
}

pub struct Dispatcher {
    client: reqwest::Client,
}

impl Dispatcher {
    pub fn new() -> GatewayResult<Self> {
        let client = reqwest::Client::builder()
            .pool_idle_timeout(Duration::from_secs(30))
            .pool_max_idle_per_host(32)
            .tcp_nodelay(true)
            .build()
            .map_err(|e| GatewayError::Internal(e.to_string()))?;

        Ok(Self { client })
    }

    /// Forward the buffered request to `route`'s upstream at `rest`,
    /// streaming the response body back without re-buffering it.
    pub async fn dispatch(
        &self,
        route: &ServiceRoute,
        rest: &str,
        ctx: &RequestContext,
    ) -> Dispatched {
        let query = ctx
            .uri
            .query()
            .map(|q| format!("?{q}"))
            .unwrap_or_default();
        let target_url = format!("{}{}{}", route.base_url, rest, query);

        let mut request = self
            .client
            .request(ctx.method.clone(), &target_url)
            .body(ctx.body.clone());

        for (name, value) in &ctx.headers {
            if should_forward_header(name) {
                request = request.header(name, value);
            }
        }

        request = request.header("x-request-id", ctx.request_id.clone());
        request = request.header("x-forwarded-proto", "http");
        if let Some(client_ip) = ctx.client_ip {
            let forwarded_for = match ctx
                .headers
                .get("x-forwarded-for")
                .and_then(|v| v.to_str().ok())
            {
                Some(existing) => format!("{existing}, {client_ip}"),
                None => client_ip.to_string(),
            };
            request = request.header("x-forwarded-for", forwarded_for);
        }

        let started = Instant::now();
        let response = request.timeout(route.timeout).send().await;
        let latency = started.elapsed();

        match response {
            Ok(upstream_response) => {
                let status = upstream_response.status();
                let failure = !is_breaker_success(status.as_u16());

                let mut builder = Response::builder().status(status);
                for (name, value) in upstream_response.headers() {
                    if should_forward_header(name) {
                        builder = builder.header(name, value);
                    }
                }

                let result = builder
                    .body(Body::from_stream(upstream_response.bytes_stream()))
                    .map_err(|e| GatewayError::Internal(e.to_string()));

                Dispatched {
                    result,
                    latency,
                    failure,
                }
            }
            Err(err) if err.is_timeout() => Dispatched {
                result: Err(GatewayError::UpstreamTimeout {
                    service: route.name.clone(),
                }),
                latency,
                failure: true,
            },
            Err(err) => {
                tracing::warn!(
                    request_id = %ctx.request_id,
                    service = %route.name,
                    error = %err,
                    "upstream transport error"
                );
                Dispatched {
                    result: Err(GatewayError::UpstreamUnreachable {
                        service: route.name.clone(),
                    }),
                    latency,
                    failure: true,
                }
            }
        }
    }
}

fn is_breaker_success(status: u16) -> bool {
    (200..500).contains(&status)
}

/// Hop-by-hop headers stay on their own connection leg; the gateway-owned
/// headers are re-derived instead of forwarded.
fn should_forward_header(name: &HeaderName) -> bool {
    let lowercase = name.as_str().to_ascii_lowercase();
    !matches!(
        lowercase.as_str(),
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailer"
            | "trailers"
            | "transfer-encoding"
            | "upgrade"
            | "host"
            | "content-length"
            | "x-request-id"
            | "x-forwarded-for"
            | "x-forwarded-proto"
    )
}
