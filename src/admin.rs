use axum::{
    Json,
    body::Body,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::{
    Deserialize,
    Serialize,
};

use crate::{
    circuit_breaker::CircuitRecord,
    context::RequestContext,
    error::GatewayError,
    gateway::Gateway,
};

#[derive(Debug, Deserialize)]
struct LoginRequest {
    username: String,
    password: String,
}

#[derive(Debug, Serialize)]
struct LoginResponse {
    access_token: String,
    token_type: &'static str,
    expires_in: u64,
}

#[derive(Debug, Serialize)]
struct CircuitStatusResponse {
    service: String,
    state: &'static str,
    failures: u32,
    successes: u32,
    half_open_in_flight: u32,
    available: bool,
}

#[derive(Debug, Serialize)]
struct ServiceResponse {
    name: String,
    url: String,
    circuit_state: &'static str,
    available: bool,
}

/// Gateway-owned endpoints, matched after the middleware chain has run so
/// they are logged, authenticated and rate-limited like proxied traffic.
/// Returns `None` when the path is not part of the admin surface.
pub(crate) async fn dispatch(gateway: &Gateway, ctx: &RequestContext) -> Option<Response<Body>> {
    let method = ctx.method.as_str();
    let path = ctx.uri.path();

    match (method, path) {
        ("GET", "/health") => Some(health(gateway).await),
        ("GET", "/health/detailed") => Some(health_detailed(gateway).await),
        ("GET", "/metrics") => Some(metrics_json(gateway)),
        ("GET", "/metrics/prometheus") => Some(metrics_prometheus(gateway).await),
        ("POST", "/api/auth/login") => Some(login(gateway, ctx).await),
        ("POST", "/api/auth/register") => Some(register(gateway, ctx).await),
        ("GET", "/api/services") => Some(list_services(gateway).await),
        ("GET", "/api/circuits") => Some(list_circuits(gateway).await),
        ("POST", _) => {
            let service = path
                .strip_prefix("/api/circuits/")
                .and_then(|rest| rest.strip_suffix("/reset"))?;
            Some(reset_circuit(gateway, service).await)
        }
        _ => None,
    }
}

async fn health(gateway: &Gateway) -> Response<Body> {
    let store_up = gateway.store_up().await;
    let status = if store_up { "ok" } else { "degraded" };
    Json(serde_json::json!({
        "status": status,
        "store": if store_up { "up" } else { "down" },
    }))
    .into_response()
}

async fn health_detailed(gateway: &Gateway) -> Response<Body> {
    let store_up = gateway.store_up().await;
    let circuits: Vec<serde_json::Value> = {
        let mut out = Vec::new();
        for (service, record) in circuit_snapshots(gateway).await {
            out.push(serde_json::json!({
                "service": service,
                "state": record.state.as_str(),
                "available": gateway.breaker.is_available(&record),
            }));
        }
        out
    };

    Json(serde_json::json!({
        "status": if store_up { "ok" } else { "degraded" },
        "store": if store_up { "up" } else { "down" },
        "circuits": circuits,
    }))
    .into_response()
}

fn metrics_json(gateway: &Gateway) -> Response<Body> {
    Json(gateway.metrics.snapshot()).into_response()
}

async fn metrics_prometheus(gateway: &Gateway) -> Response<Body> {
    let circuits = circuit_snapshots(gateway).await;
    let body = gateway.metrics.render_prometheus(&circuits);
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4")],
        body,
    )
        .into_response()
}

async fn login(gateway: &Gateway, ctx: &RequestContext) -> Response<Body> {
    let request: LoginRequest = match serde_json::from_slice(&ctx.body) {
        Ok(request) => request,
        Err(_) => {
            return GatewayError::Validation("invalid JSON body".to_string()).into_response();
        }
    };

    match gateway
        .credentials
        .verify(&request.username, &request.password)
        .await
    {
        Some(grants) => {
            let access_token =
                gateway
                    .tokens
                    .issue(&request.username, &grants.roles, &grants.scopes);
            Json(LoginResponse {
                access_token,
                token_type: "bearer",
                expires_in: gateway.tokens.token_ttl_secs(),
            })
            .into_response()
        }
        None => (
            StatusCode::UNAUTHORIZED,
            Json(serde_json::json!({
                "error": "invalid_credentials",
                "message": "Invalid username or password",
            })),
        )
            .into_response(),
    }
}

async fn register(gateway: &Gateway, ctx: &RequestContext) -> Response<Body> {
    let request: LoginRequest = match serde_json::from_slice(&ctx.body) {
        Ok(request) => request,
        Err(_) => {
            return GatewayError::Validation("invalid JSON body".to_string()).into_response();
        }
    };

    match gateway
        .credentials
        .register(&request.username, &request.password)
        .await
    {
        Ok(()) => (
            StatusCode::CREATED,
            Json(serde_json::json!({
                "message": "User registered successfully",
                "username": request.username,
            })),
        )
            .into_response(),
        Err(err) => err.into_response(),
    }
}

async fn list_services(gateway: &Gateway) -> Response<Body> {
    let mut services = Vec::new();
    for route in gateway.routes.iter() {
        let record = gateway.breaker.snapshot(&route.name).await;
        services.push(ServiceResponse {
            name: route.name.clone(),
            url: route.base_url.clone(),
            circuit_state: record.state.as_str(),
            available: gateway.breaker.is_available(&record),
        });
    }

    Json(serde_json::json!({ "services": services })).into_response()
}

async fn list_circuits(gateway: &Gateway) -> Response<Body> {
    let mut circuits = Vec::new();
    for (service, record) in circuit_snapshots(gateway).await {
        circuits.push(CircuitStatusResponse {
            available: gateway.breaker.is_available(&record),
            state: record.state.as_str(),
            failures: record.consecutive_failures,
            successes: record.consecutive_successes,
            half_open_in_flight: record.half_open_in_flight,
            service,
        });
    }

    Json(circuits).into_response()
}

async fn reset_circuit(gateway: &Gateway, service: &str) -> Response<Body> {
    if gateway.routes.get(service).is_none() {
        return GatewayError::ServiceNotFound(service.to_string()).into_response();
    }

    match gateway.breaker.force_close(service).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(err) => err.into_response(),
    }
}

async fn circuit_snapshots(gateway: &Gateway) -> Vec<(String, CircuitRecord)> {
    let mut out = Vec::new();
    for name in gateway.routes.service_names() {
        let record = gateway.breaker.snapshot(&name).await;
        out.push((name, record));
    }
    out
}
