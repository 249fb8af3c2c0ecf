use std::sync::Arc;

use async_trait::async_trait;

use crate::{
    auth::{AuthError, TokenAuthority},
    context::RequestContext,
    error::{GatewayError, GatewayResult},
    metrics::MetricsRegistry,
    middleware::{ControlFlow, GatewayMiddleware},
    router::RouteTable,
};

/// Verifies the bearer token on protected paths and attaches the principal
/// to the request context. Public paths — by configured prefix or a
/// route's public flag — pass through untouched.
pub struct BearerAuthMiddleware {
    authority: Arc<TokenAuthority>,
    routes: Arc<RouteTable>,
    public_prefixes: Vec<String>,
    metrics: Arc<MetricsRegistry>,
}

impl BearerAuthMiddleware {
    pub fn new(
        authority: Arc<TokenAuthority>,
        routes: Arc<RouteTable>,
        public_prefixes: Vec<String>,
        metrics: Arc<MetricsRegistry>,
    ) -> Self {
        Self {
            authority,
            routes,
            public_prefixes,
            metrics,
        }
    }

    fn is_public(&self, path: &str) -> bool {
        if self
            .public_prefixes
            .iter()
            .any(|prefix| path.starts_with(prefix))
        {
            return true;
        }
        self.routes
            .resolve(path)
            .map(|resolved| resolved.route.public)
            .unwrap_or(false)
    }

    fn bearer_token<'a>(&self, ctx: &'a RequestContext) -> Result<&'a str, AuthError> {
        let header = ctx
            .headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .ok_or(AuthError::Missing)?;

        header.strip_prefix("Bearer ").ok_or(AuthError::Malformed)
    }
}

#[async_trait]
impl GatewayMiddleware for BearerAuthMiddleware {
    fn name(&self) -> &'static str {
        "bearer-auth"
    }

    async fn on_request(&self, ctx: &mut RequestContext) -> GatewayResult<ControlFlow> {
        if self.is_public(ctx.uri.path()) {
            return Ok(ControlFlow::Continue);
        }

        let verified = self
            .bearer_token(ctx)
            .and_then(|token| self.authority.verify(token));

        match verified {
            Ok(principal) => {
                ctx.principal = Some(principal);
                Ok(ControlFlow::Continue)
            }
            Err(err) => {
                self.metrics.incr_auth_failures();
                Err(GatewayError::Auth(err))
            }
        }
    }
}
