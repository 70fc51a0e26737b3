//! OAuth 2.1 authorization server: authorization-code flow with mandatory
//! PKCE (S256), refresh rotation, and the access-token validation facade
//! used by the bearer-auth middleware.

use std::sync::Arc;

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::{Duration as ChronoDuration, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use super::store::{AuthCode, AuthStore, StoredToken};
use super::token::{self, Claims, TOKEN_TYPE_ACCESS, TOKEN_TYPE_REFRESH};
use crate::config::AuthConfig;
use crate::error::Error;

/// Authorization codes are valid for ten minutes.
const CODE_TTL_MINUTES: i64 = 10;

#[derive(Debug, Deserialize)]
pub struct AuthorizeParams {
    #[serde(default)]
    pub response_type: String,
    #[serde(default)]
    pub client_id: String,
    #[serde(default)]
    pub redirect_uri: String,
    #[serde(default)]
    pub scope: String,
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub code_challenge: String,
    #[serde(default)]
    pub code_challenge_method: String,
}

#[derive(Debug, Deserialize)]
pub struct TokenParams {
    #[serde(default)]
    pub grant_type: String,
    #[serde(default)]
    pub code: String,
    #[serde(default)]
    pub code_verifier: String,
    #[serde(default)]
    pub refresh_token: String,
    #[serde(default)]
    pub client_id: String,
    #[serde(default)]
    pub client_secret: String,
    #[serde(default)]
    pub redirect_uri: String,
}

#[derive(Debug, Serialize)]
pub struct TokenResponse {
    pub access_token: String,
    pub token_type: &'static str,
    pub expires_in: u64,
    pub refresh_token: String,
    pub scope: String,
}

pub struct OAuthServer {
    cfg: AuthConfig,
    issuer: String,
    secret: Vec<u8>,
    store: Arc<dyn AuthStore>,
}

impl OAuthServer {
    pub fn new(cfg: AuthConfig, issuer: String, store: Arc<dyn AuthStore>) -> Self {
        let secret = if cfg.jwt_secret.is_empty() {
            warn!("auth.jwt_secret not configured; using an ephemeral key, tokens will not survive a restart");
            let mut key = vec![0u8; 32];
            rand::thread_rng().fill_bytes(&mut key);
            key
        } else {
            cfg.jwt_secret.as_bytes().to_vec()
        };
        Self {
            cfg,
            issuer,
            secret,
            store,
        }
    }

    /// Handle an authorization request. On success returns the redirect URL
    /// carrying the freshly minted code.
    pub async fn authorize(&self, p: &AuthorizeParams) -> Result<String, Error> {
        if p.response_type != "code" {
            return Err(Error::invalid("response_type must be \"code\""));
        }
        if p.client_id != self.cfg.client_id {
            return Err(Error::Unauthorized("unknown client_id".into()));
        }
        if p.redirect_uri.is_empty() {
            return Err(Error::invalid("redirect_uri is required"));
        }
        // PKCE is mandatory; S256 is the only accepted method.
        if p.code_challenge.is_empty() {
            return Err(Error::invalid("code_challenge is required (PKCE)"));
        }
        if p.code_challenge_method != "S256" {
            return Err(Error::invalid("code_challenge_method must be S256"));
        }

        let code = random_hex(32);
        self.store
            .store_code(AuthCode {
                code_hash: token::hash_token(&code),
                client_id: p.client_id.clone(),
                redirect_uri: p.redirect_uri.clone(),
                code_challenge: p.code_challenge.clone(),
                scope: p.scope.clone(),
                expires_at: Utc::now() + ChronoDuration::minutes(CODE_TTL_MINUTES),
                used: false,
            })
            .await;

        let sep = if p.redirect_uri.contains('?') { '&' } else { '?' };
        let mut url = format!("{}{}code={}", p.redirect_uri, sep, code);
        if !p.state.is_empty() {
            url.push_str("&state=");
            url.push_str(&p.state);
        }
        Ok(url)
    }

    /// Handle the token endpoint for both supported grants.
    pub async fn token(&self, p: &TokenParams) -> Result<TokenResponse, Error> {
        match p.grant_type.as_str() {
            "authorization_code" => self.exchange_code(p).await,
            "refresh_token" => self.refresh(p).await,
            other => Err(Error::invalid(format!("unsupported grant_type {other:?}"))),
        }
    }

    async fn exchange_code(&self, p: &TokenParams) -> Result<TokenResponse, Error> {
        if p.code.is_empty() {
            return Err(Error::invalid("code is required"));
        }
        let code = self.store.consume_code(&token::hash_token(&p.code)).await?;

        if !p.client_id.is_empty() && p.client_id != code.client_id {
            return Err(Error::Unauthorized("client_id mismatch".into()));
        }
        if !p.redirect_uri.is_empty() && p.redirect_uri != code.redirect_uri {
            return Err(Error::Unauthorized("redirect_uri mismatch".into()));
        }
        verify_pkce(&code.code_challenge, &p.code_verifier)?;
        self.check_client_secret(&p.client_secret)?;

        self.mint_pair(&code.client_id, &code.scope).await
    }

    /// Refresh-token rotation: the presented refresh token is revoked
    /// atomically with the issuance of the new pair.
    async fn refresh(&self, p: &TokenParams) -> Result<TokenResponse, Error> {
        if p.refresh_token.is_empty() {
            return Err(Error::invalid("refresh_token is required"));
        }
        let claims = token::verify(&p.refresh_token, &self.secret)?;
        if claims.token_type != TOKEN_TYPE_REFRESH {
            return Err(Error::Unauthorized("not a refresh token".into()));
        }

        let hash = token::hash_token(&p.refresh_token);
        let stored = self.store.get_token(&hash).await?;
        self.check_client_secret(&p.client_secret)?;

        self.store.revoke_token(&hash).await;
        self.mint_pair(&stored.client_id, &stored.scope).await
    }

    /// Validate a bearer access token: signature + expiry, then the store
    /// lookup that enforces revocation.
    pub async fn validate_access_token(&self, raw: &str) -> Result<Claims, Error> {
        let claims = token::verify(raw, &self.secret)?;
        if claims.token_type != TOKEN_TYPE_ACCESS {
            return Err(Error::Unauthorized("not an access token".into()));
        }
        self.store.get_token(&token::hash_token(raw)).await?;
        Ok(claims)
    }

    /// RFC 8414 metadata for `/.well-known/oauth-authorization-server`.
    pub fn metadata(&self) -> serde_json::Value {
        serde_json::json!({
            "issuer": self.issuer,
            "authorization_endpoint": format!("{}/oauth/authorize", self.issuer),
            "token_endpoint": format!("{}/oauth/token", self.issuer),
            "response_types_supported": ["code"],
            "grant_types_supported": ["authorization_code", "refresh_token"],
            "code_challenge_methods_supported": ["S256"],
            "token_endpoint_auth_methods_supported": ["client_secret_post", "none"],
        })
    }

    pub async fn cleanup(&self) {
        self.store.cleanup().await;
    }

    fn check_client_secret(&self, presented: &str) -> Result<(), Error> {
        // Empty configured secret means a public client.
        if self.cfg.client_secret.is_empty() {
            return Ok(());
        }
        if presented != self.cfg.client_secret {
            return Err(Error::Unauthorized("invalid client credentials".into()));
        }
        Ok(())
    }

    async fn mint_pair(&self, client_id: &str, scope: &str) -> Result<TokenResponse, Error> {
        let now = Utc::now();
        let access_exp = now
            + ChronoDuration::from_std(self.cfg.access_token_ttl)
                .unwrap_or_else(|_| ChronoDuration::hours(1));
        let refresh_exp = now
            + ChronoDuration::from_std(self.cfg.refresh_token_ttl)
                .unwrap_or_else(|_| ChronoDuration::days(30));

        let base = Claims {
            sub: client_id.to_string(),
            client_id: client_id.to_string(),
            scope: scope.to_string(),
            iat: now.timestamp(),
            iss: self.issuer.clone(),
            ..Default::default()
        };

        let access = token::sign(
            Claims {
                token_type: TOKEN_TYPE_ACCESS.into(),
                exp: access_exp.timestamp(),
                ..base.clone()
            },
            &self.secret,
        )?;
        let refresh = token::sign(
            Claims {
                token_type: TOKEN_TYPE_REFRESH.into(),
                exp: refresh_exp.timestamp(),
                ..base
            },
            &self.secret,
        )?;

        self.store
            .store_token(StoredToken {
                token_hash: token::hash_token(&access),
                token_type: TOKEN_TYPE_ACCESS.into(),
                client_id: client_id.to_string(),
                scope: scope.to_string(),
                expires_at: access_exp,
                revoked: false,
            })
            .await;
        self.store
            .store_token(StoredToken {
                token_hash: token::hash_token(&refresh),
                token_type: TOKEN_TYPE_REFRESH.into(),
                client_id: client_id.to_string(),
                scope: scope.to_string(),
                expires_at: refresh_exp,
                revoked: false,
            })
            .await;

        debug!(client_id, scope, "minted token pair");

        Ok(TokenResponse {
            access_token: access,
            token_type: "Bearer",
            expires_in: self.cfg.access_token_ttl.as_secs(),
            refresh_token: refresh,
            scope: scope.to_string(),
        })
    }
}

fn verify_pkce(challenge: &str, verifier: &str) -> Result<(), Error> {
    if verifier.is_empty() {
        return Err(Error::invalid("code_verifier is required"));
    }
    let computed = URL_SAFE_NO_PAD.encode(Sha256::digest(verifier.as_bytes()));
    if computed != challenge {
        return Err(Error::Unauthorized("PKCE verification failed".into()));
    }
    Ok(())
}

fn random_hex(bytes: usize) -> String {
    let mut buf = vec![0u8; bytes];
    rand::thread_rng().fill_bytes(&mut buf);
    buf.iter().map(|b| format!("{b:02x}")).collect()
}
