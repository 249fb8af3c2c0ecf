use async_trait::async_trait;

use crate::{
    config::ValidationConfig,
    context::RequestContext,
    error::{GatewayError, GatewayResult},
    middleware::{ControlFlow, GatewayMiddleware},
};

/// Structural guard at the front of the chain: a request that is malformed
/// at the HTTP level is turned away with 400/413 before any auth or store
/// work happens on its behalf.
pub struct RequestValidationMiddleware {
    cfg: ValidationConfig,
}

impl RequestValidationMiddleware {
    pub fn new(cfg: ValidationConfig) -> Self {
        Self { cfg }
    }

    fn check_method(&self, ctx: &RequestContext) -> GatewayResult<()> {
        let method = ctx.method.as_str().to_ascii_uppercase();
        if self
            .cfg
            .allowed_methods
            .iter()
            .any(|allowed| *allowed == method)
        {
            return Ok(());
        }
        Err(reject(format!("Method {method} is not allowed")))
    }

    fn check_headers(&self, ctx: &RequestContext) -> GatewayResult<()> {
        if self.cfg.require_host_header && ctx.headers.get("host").is_none() {
            return Err(reject("Missing required Host header".to_string()));
        }

        let count = ctx.headers.len();
        if count > self.cfg.max_headers {
            return Err(reject(format!(
                "Too many headers: {count} exceeds the limit of {}",
                self.cfg.max_headers
            )));
        }
        Ok(())
    }

    fn check_body(&self, ctx: &RequestContext) -> GatewayResult<()> {
        if ctx.body.len() > self.cfg.max_body_bytes {
            return Err(GatewayError::PayloadTooLarge);
        }

        let declared = ctx
            .headers
            .get("content-length")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<usize>().ok());
        match declared {
            Some(declared) if declared != ctx.body.len() => Err(reject(
                "content-length does not match payload size".to_string(),
            )),
            _ => Ok(()),
        }
    }
}

fn reject(message: String) -> GatewayError {
    GatewayError::Validation(message)
}

#[async_trait]
impl GatewayMiddleware for RequestValidationMiddleware {
    fn name(&self) -> &'static str {
        "request-validation"
    }

    async fn on_request(&self, ctx: &mut RequestContext) -> GatewayResult<ControlFlow> {
        self.check_method(ctx)?;
        self.check_headers(ctx)?;
        self.check_body(ctx)?;
        Ok(ControlFlow::Continue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use http::{HeaderMap, Method, Uri};

    fn cfg() -> ValidationConfig {
        ValidationConfig {
            max_body_bytes: 16,
            allowed_methods: vec!["GET".to_string(), "POST".to_string()],
            require_host_header: true,
            max_headers: 4,
        }
    }

    fn request(method: Method, body: &'static [u8]) -> RequestContext {
        let mut headers = HeaderMap::new();
        headers.insert("host", "gateway.test".parse().unwrap());
        RequestContext::new(
            "req-1".to_string(),
            method,
            Uri::from_static("/api/users/1"),
            headers,
            Bytes::from_static(body),
            None,
        )
    }

    #[tokio::test]
    async fn well_formed_request_passes() {
        let middleware = RequestValidationMiddleware::new(cfg());
        let mut ctx = request(Method::GET, b"");

        assert!(matches!(
            middleware.on_request(&mut ctx).await.unwrap(),
            ControlFlow::Continue
        ));
    }

    #[tokio::test]
    async fn disallowed_method_is_rejected() {
        let middleware = RequestValidationMiddleware::new(cfg());
        let mut ctx = request(Method::DELETE, b"");

        let err = middleware.on_request(&mut ctx).await.unwrap_err();
        assert!(matches!(err, GatewayError::Validation(_)));
    }

    #[tokio::test]
    async fn missing_host_header_is_rejected() {
        let middleware = RequestValidationMiddleware::new(cfg());
        let mut ctx = request(Method::GET, b"");
        ctx.headers.remove("host");

        let err = middleware.on_request(&mut ctx).await.unwrap_err();
        assert!(matches!(err, GatewayError::Validation(_)));
    }

    #[tokio::test]
    async fn oversized_body_is_413() {
        let middleware = RequestValidationMiddleware::new(cfg());
        let mut ctx = request(Method::POST, b"this body is longer than sixteen bytes");

        let err = middleware.on_request(&mut ctx).await.unwrap_err();
        assert!(matches!(err, GatewayError::PayloadTooLarge));
    }

    #[tokio::test]
    async fn mismatched_content_length_is_rejected() {
        let middleware = RequestValidationMiddleware::new(cfg());
        let mut ctx = request(Method::POST, b"ten bytes!");
        ctx.headers.insert("content-length", "3".parse().unwrap());

        let err = middleware.on_request(&mut ctx).await.unwrap_err();
        assert!(matches!(err, GatewayError::Validation(_)));
    }
}
