//! Compact HS256 JWTs for the OAuth surface.
//!
//! Raw token strings are never persisted; storage keys are the SHA-256 hex
//! hash from [`hash_token`].

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::Error;

type HmacSha256 = Hmac<Sha256>;

pub const TOKEN_TYPE_ACCESS: &str = "access";
pub const TOKEN_TYPE_REFRESH: &str = "refresh";

/// JWT claims payload.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Claims {
    #[serde(default)]
    pub jti: String,
    #[serde(default)]
    pub sub: String,
    #[serde(default)]
    pub client_id: String,
    #[serde(default)]
    pub scope: String,
    #[serde(default)]
    pub token_type: String,
    #[serde(default)]
    pub iat: i64,
    #[serde(default)]
    pub exp: i64,
    #[serde(default)]
    pub iss: String,
}

impl Claims {
    pub fn is_expired(&self) -> bool {
        chrono::Utc::now().timestamp() > self.exp
    }
}

/// Fixed header segment: `{"alg":"HS256","typ":"JWT"}` base64url-encoded.
fn header_segment() -> String {
    URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256","typ":"JWT"}"#)
}

/// Sign `claims` into a three-segment JWT. A random 128-bit `jti` is filled
/// in when the caller left it empty.
pub fn sign(mut claims: Claims, secret: &[u8]) -> Result<String, Error> {
    if claims.jti.is_empty() {
        claims.jti = uuid::Uuid::new_v4().simple().to_string();
    }
    let payload = serde_json::to_vec(&claims)
        .map_err(|e| Error::Internal(anyhow::anyhow!("marshaling claims: {e}")))?;

    let signing_input = format!("{}.{}", header_segment(), URL_SAFE_NO_PAD.encode(payload));
    let mut mac = HmacSha256::new_from_slice(secret).expect("HMAC accepts any key length");
    mac.update(signing_input.as_bytes());
    let signature = URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes());

    Ok(format!("{signing_input}.{signature}"))
}

/// Verify a JWT's signature and expiry, returning its claims.
pub fn verify(token: &str, secret: &[u8]) -> Result<Claims, Error> {
    let parts: Vec<&str> = token.splitn(3, '.').collect();
    if parts.len() != 3 {
        return Err(Error::Unauthorized("invalid token format".into()));
    }

    let signature = URL_SAFE_NO_PAD
        .decode(parts[2])
        .map_err(|_| Error::Unauthorized("invalid signature encoding".into()))?;

    let signing_input = format!("{}.{}", parts[0], parts[1]);
    let mut mac = HmacSha256::new_from_slice(secret).expect("HMAC accepts any key length");
    mac.update(signing_input.as_bytes());
    // verify_slice is a constant-time comparison.
    mac.verify_slice(&signature)
        .map_err(|_| Error::Unauthorized("invalid signature".into()))?;

    let payload = URL_SAFE_NO_PAD
        .decode(parts[1])
        .map_err(|_| Error::Unauthorized("invalid payload encoding".into()))?;
    let claims: Claims = serde_json::from_slice(&payload)
        .map_err(|_| Error::Unauthorized("invalid payload".into()))?;

    if claims.is_expired() {
        return Err(Error::Unauthorized("token expired".into()));
    }

    Ok(claims)
}

/// SHA-256 hex hash of a token string, used as its storage key.
pub fn hash_token(token: &str) -> String {
    let digest = Sha256::digest(token.as_bytes());
    digest.iter().map(|b| format!("{b:02x}")).collect()
}
