use async_trait::async_trait;
use dashmap::DashMap;
use sha2::{
    Digest,
    Sha256,
};
use uuid::Uuid;

use crate::error::{GatewayError, GatewayResult};

/// Roles and scopes granted to a registered user; becomes the principal's
/// claims when a token is issued at login.
#[derive(Debug, Clone)]
pub struct UserGrants {
    pub roles: Vec<String>,
    pub scopes: Vec<String>,
}

impl Default for UserGrants {
    fn default() -> Self {
        Self {
            roles: vec!["user".to_string()],
            scopes: vec!["read".to_string(), "write".to_string()],
        }
    }
}

/// Credential verification seam. The user registry proper is an external
/// collaborator; the gateway only needs register + verify.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn register(&self, username: &str, password: &str) -> GatewayResult<()>;

    async fn verify(&self, username: &str, password: &str) -> Option<UserGrants>;
}

struct StoredUser {
    salt: [u8; 16],
    digest: [u8; 32],
    grants: UserGrants,
}

/// In-process credential store. Passwords are kept as salted SHA-256
/// digests, never in the clear.
#[derive(Default)]
pub struct InMemoryCredentialStore {
    users: DashMap<String, StoredUser>,
}

impl InMemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn digest(salt: &[u8; 16], password: &str) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(salt);
        hasher.update(password.as_bytes());
        hasher.finalize().into()
    }
}

#[async_trait]
impl CredentialStore for InMemoryCredentialStore {
    async fn register(&self, username: &str, password: &str) -> GatewayResult<()> {
        if username.is_empty() || password.is_empty() {
            return Err(GatewayError::Validation(
                "username and password must not be empty".to_string(),
            ));
        }
        if self.users.contains_key(username) {
            return Err(GatewayError::Conflict(format!(
                "user '{username}' already exists"
            )));
        }

        let salt = *Uuid::new_v4().as_bytes();
        let digest = Self::digest(&salt, password);
        self.users.insert(
            username.to_string(),
            StoredUser {
                salt,
                digest,
                grants: UserGrants::default(),
            },
        );
        Ok(())
    }

    async fn verify(&self, username: &str, password: &str) -> Option<UserGrants> {
        let user = self.users.get(username)?;
        let candidate = Self::digest(&user.salt, password);
        if candidate == user.digest {
            Some(user.grants.clone())
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn register_then_login() {
        let store = InMemoryCredentialStore::new();
        store.register("alice", "s3cret").await.unwrap();

        assert!(store.verify("alice", "s3cret").await.is_some());
        assert!(store.verify("alice", "wrong").await.is_none());
        assert!(store.verify("bob", "s3cret").await.is_none());
    }

    #[tokio::test]
    async fn duplicate_registration_conflicts() {
        let store = InMemoryCredentialStore::new();
        store.register("alice", "s3cret").await.unwrap();

        let err = store.register("alice", "other").await.unwrap_err();
        assert!(matches!(err, GatewayError::Conflict(_)));
    }
}
