pub mod auth;
pub mod logging;
pub mod rate_limit;
pub mod validation;

use async_trait::async_trait;
use axum::{
    body::Body,
    response::Response,
};

use crate::{
    context::RequestContext,
    error::GatewayResult,
};

#[derive(Debug)]
pub enum ControlFlow {
    Continue,
    ShortCircuit(Response<Body>),
}

/// One stage of the request pipeline. `on_request` either passes the
/// request forward or produces the response itself; errors are values the
/// gateway maps to status codes — no stage unwinds past another.
#[async_trait]
pub trait GatewayMiddleware: Send + Sync {
    fn name(&self) -> &'static str;

    async fn on_request(&self, ctx: &mut RequestContext) -> GatewayResult<ControlFlow>;

    async fn on_response(
        &self,
        _ctx: &RequestContext,
        _response: &mut Response<Body>,
    ) -> GatewayResult<()> {
        Ok(())
    }
}
