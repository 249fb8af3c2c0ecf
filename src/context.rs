use bytes::Bytes;
use http::{HeaderMap, Method, Uri};
use std::{
    collections::HashMap,
    net::IpAddr,
    time::Instant,
};

use crate::{
    auth::Principal,
    router::ServiceRoute,
};

#[derive(Debug, Clone)]
pub struct RequestContext {
    pub request_id: String,
    pub method: Method,
    pub uri: Uri,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub client_ip: Option<IpAddr>,
    pub started_at: Instant,
    pub principal: Option<Principal>,
    pub route: Option<ServiceRoute>,
    pub metadata: HashMap<String, String>,
}

impl RequestContext {
    pub fn new(
        request_id: String,
        method: Method,
        uri: Uri,
        headers: HeaderMap,
        body: Bytes,
        client_ip: Option<IpAddr>,
    ) -> Self {
        Self {
            request_id,
            method,
            uri,
            headers,
            body,
            client_ip,
            started_at: Instant::now(),
            principal: None,
            route: None,
            metadata: HashMap::new(),
        }
    }

    /// Identity the limiter keys on: authenticated subject when present,
    /// else the client network address.
    pub fn rate_limit_identity(&self) -> String {
        if let Some(principal) = &self.principal {
            return format!("user:{}", principal.subject);
        }
        if let Some(ip) = self.client_ip {
            return format!("ip:{ip}");
        }
        "anonymous".to_string()
    }
}
