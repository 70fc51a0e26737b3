//! Persistence of OAuth authorization codes and minted tokens.
//!
//! Codes and tokens are stored by SHA-256 hash only. Two interchangeable
//! implementations exist: the in-memory map below and the SQLite adaptor in
//! [`crate::auth::sqlite`].

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Error;

/// An OAuth authorization code, keyed by hash. Single-use.
#[derive(Debug, Clone)]
pub struct AuthCode {
    pub code_hash: String,
    pub client_id: String,
    pub redirect_uri: String,
    pub code_challenge: String,
    pub scope: String,
    pub expires_at: DateTime<Utc>,
    pub used: bool,
}

/// A persisted access or refresh token, keyed by hash.
#[derive(Debug, Clone)]
pub struct StoredToken {
    pub token_hash: String,
    /// `"access"` or `"refresh"`.
    pub token_type: String,
    pub client_id: String,
    pub scope: String,
    pub expires_at: DateTime<Utc>,
    pub revoked: bool,
}

#[async_trait]
pub trait AuthStore: Send + Sync {
    async fn store_code(&self, code: AuthCode);

    /// Fetch and atomically mark a code used. Fails if the code is missing,
    /// already used, or expired.
    async fn consume_code(&self, code_hash: &str) -> Result<AuthCode, Error>;

    async fn store_token(&self, token: StoredToken);

    /// Fails if the token is missing, revoked, or expired.
    async fn get_token(&self, token_hash: &str) -> Result<StoredToken, Error>;

    async fn revoke_token(&self, token_hash: &str);

    /// Drop expired codes and expired-or-revoked tokens.
    async fn cleanup(&self);
}

/// In-memory [`AuthStore`] guarded by a reader-writer lock.
#[derive(Default)]
pub struct MemoryAuthStore {
    inner: RwLock<MemoryInner>,
}

#[derive(Default)]
struct MemoryInner {
    codes: HashMap<String, AuthCode>,
    tokens: HashMap<String, StoredToken>,
}

impl MemoryAuthStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AuthStore for MemoryAuthStore {
    async fn store_code(&self, code: AuthCode) {
        let mut inner = self.inner.write().expect("auth store lock");
        inner.codes.insert(code.code_hash.clone(), code);
    }

    async fn consume_code(&self, code_hash: &str) -> Result<AuthCode, Error> {
        let mut inner = self.inner.write().expect("auth store lock");
        let code = inner
            .codes
            .get_mut(code_hash)
            .ok_or_else(|| Error::Unauthorized("authorization code not found".into()))?;
        if code.used {
            return Err(Error::Unauthorized("authorization code already used".into()));
        }
        if Utc::now() > code.expires_at {
            return Err(Error::Unauthorized("authorization code expired".into()));
        }
        code.used = true;
        Ok(code.clone())
    }

    async fn store_token(&self, token: StoredToken) {
        let mut inner = self.inner.write().expect("auth store lock");
        inner.tokens.insert(token.token_hash.clone(), token);
    }

    async fn get_token(&self, token_hash: &str) -> Result<StoredToken, Error> {
        let inner = self.inner.read().expect("auth store lock");
        let token = inner
            .tokens
            .get(token_hash)
            .ok_or_else(|| Error::Unauthorized("token not found".into()))?;
        if token.revoked {
            return Err(Error::Unauthorized("token revoked".into()));
        }
        if Utc::now() > token.expires_at {
            return Err(Error::Unauthorized("token expired".into()));
        }
        Ok(token.clone())
    }

    async fn revoke_token(&self, token_hash: &str) {
        let mut inner = self.inner.write().expect("auth store lock");
        if let Some(token) = inner.tokens.get_mut(token_hash) {
            token.revoked = true;
        }
    }

    async fn cleanup(&self) {
        let now = Utc::now();
        let mut inner = self.inner.write().expect("auth store lock");
        inner.codes.retain(|_, c| now <= c.expires_at);
        inner
            .tokens
            .retain(|_, t| now <= t.expires_at && !t.revoked);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn code(hash: &str, expires_in: i64) -> AuthCode {
        AuthCode {
            code_hash: hash.into(),
            client_id: "c".into(),
            redirect_uri: "http://localhost/cb".into(),
            code_challenge: "ch".into(),
            scope: "mcp".into(),
            expires_at: Utc::now() + Duration::seconds(expires_in),
            used: false,
        }
    }

    fn token(hash: &str, expires_in: i64) -> StoredToken {
        StoredToken {
            token_hash: hash.into(),
            token_type: "access".into(),
            client_id: "c".into(),
            scope: "mcp".into(),
            expires_at: Utc::now() + Duration::seconds(expires_in),
            revoked: false,
        }
    }

    #[tokio::test]
    async fn consume_code_succeeds_exactly_once() {
        let store = MemoryAuthStore::new();
        store.store_code(code("h1", 600)).await;

        let first = store.consume_code("h1").await.unwrap();
        assert_eq!(first.client_id, "c");

        let err = store.consume_code("h1").await.unwrap_err();
        assert!(err.to_string().contains("already used"));
    }

    #[tokio::test]
    async fn consume_unknown_code_fails() {
        let store = MemoryAuthStore::new();
        assert!(store.consume_code("nope").await.is_err());
    }

    #[tokio::test]
    async fn consume_expired_code_fails() {
        let store = MemoryAuthStore::new();
        store.store_code(code("h1", -1)).await;
        let err = store.consume_code("h1").await.unwrap_err();
        assert!(err.to_string().contains("expired"));
    }

    #[tokio::test]
    async fn get_token_checks_revocation_and_expiry() {
        let store = MemoryAuthStore::new();
        store.store_token(token("t1", 600)).await;
        assert!(store.get_token("t1").await.is_ok());

        store.revoke_token("t1").await;
        let err = store.get_token("t1").await.unwrap_err();
        assert!(err.to_string().contains("revoked"));

        store.store_token(token("t2", -1)).await;
        let err = store.get_token("t2").await.unwrap_err();
        assert!(err.to_string().contains("expired"));

        assert!(store.get_token("missing").await.is_err());
    }

    #[tokio::test]
    async fn cleanup_drops_expired_and_revoked() {
        let store = MemoryAuthStore::new();
        store.store_code(code("c-live", 600)).await;
        store.store_code(code("c-dead", -1)).await;
        store.store_token(token("t-live", 600)).await;
        store.store_token(token("t-dead", -1)).await;
        store.store_token(token("t-rev", 600)).await;
        store.revoke_token("t-rev").await;

        store.cleanup().await;

        assert!(store.consume_code("c-live").await.is_ok());
        assert!(store.consume_code("c-dead").await.is_err());
        assert!(store.get_token("t-live").await.is_ok());
        assert!(store.get_token("t-dead").await.is_err());
        assert!(store.get_token("t-rev").await.is_err());
    }
}
