//! SQLite-backed [`AuthStore`] adapting the shared [`Store`].

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::error;

use super::store::{AuthCode, AuthStore, StoredToken};
use crate::error::Error;
use crate::storage::{AuthCodeRow, Store, TokenRow};

pub struct SqliteAuthStore {
    db: Arc<Store>,
}

impl SqliteAuthStore {
    pub fn new(db: Arc<Store>) -> Self {
        Self { db }
    }
}

#[async_trait]
impl AuthStore for SqliteAuthStore {
    async fn store_code(&self, code: AuthCode) {
        let row = AuthCodeRow {
            code_hash: code.code_hash,
            client_id: code.client_id,
            redirect_uri: code.redirect_uri,
            code_challenge: code.code_challenge,
            scope: code.scope,
            expires_at: code.expires_at.to_rfc3339(),
            used: code.used,
        };
        if let Err(e) = self.db.store_auth_code(&row).await {
            error!(err = %e, "failed to store auth code");
        }
    }

    async fn consume_code(&self, code_hash: &str) -> Result<AuthCode, Error> {
        let row = self.db.consume_auth_code(code_hash).await?;
        Ok(AuthCode {
            code_hash: row.code_hash,
            client_id: row.client_id,
            redirect_uri: row.redirect_uri,
            code_challenge: row.code_challenge,
            scope: row.scope,
            expires_at: parse_expiry(&row.expires_at),
            used: row.used,
        })
    }

    async fn store_token(&self, token: StoredToken) {
        let row = TokenRow {
            token_hash: token.token_hash,
            token_type: token.token_type,
            client_id: token.client_id,
            scope: token.scope,
            expires_at: token.expires_at.to_rfc3339(),
            revoked: token.revoked,
        };
        if let Err(e) = self.db.store_token(&row).await {
            error!(err = %e, "failed to store token");
        }
    }

    async fn get_token(&self, token_hash: &str) -> Result<StoredToken, Error> {
        let row = self.db.get_token(token_hash).await?;
        Ok(StoredToken {
            token_hash: row.token_hash,
            token_type: row.token_type,
            client_id: row.client_id,
            scope: row.scope,
            expires_at: parse_expiry(&row.expires_at),
            revoked: row.revoked,
        })
    }

    async fn revoke_token(&self, token_hash: &str) {
        if let Err(e) = self.db.revoke_token(token_hash).await {
            error!(err = %e, "failed to revoke token");
        }
    }

    async fn cleanup(&self) {
        if let Err(e) = self.db.cleanup_auth().await {
            error!(err = %e, "failed to clean up expired auth entries");
        }
    }
}

fn parse_expiry(rfc3339: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(rfc3339)
        .map(|t| t.with_timezone(&Utc))
        // The store already rejected unparseable expiries as expired.
        .unwrap_or_else(|_| Utc::now())
}
