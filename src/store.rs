use redis::aio::ConnectionManager;

use crate::error::GatewayResult;

/// Thin client over the shared Redis store. The limiter and breaker stores
/// hold clones; all atomicity lives in their server-side scripts.
#[derive(Clone)]
pub struct SharedStore {
    manager: ConnectionManager,
    key_prefix: String,
}

impl SharedStore {
    /// Establish the connection once at startup. A failure here is fatal;
    /// after startup every store error is a per-operation value.
    pub async fn connect(url: &str, key_prefix: String) -> GatewayResult<Self> {
        let client = redis::Client::open(url)?;
        let manager = client.get_connection_manager().await?;
        Ok(Self {
            manager,
            key_prefix,
        })
    }

    pub fn connection(&self) -> ConnectionManager {
        self.manager.clone()
    }

    pub fn key(&self, suffix: &str) -> String {
        format!("{}:{}", self.key_prefix, suffix)
    }

    pub async fn ping(&self) -> bool {
        let mut conn = self.manager.clone();
        redis::cmd("PING")
            .query_async::<String>(&mut conn)
            .await
            .is_ok()
    }
}
