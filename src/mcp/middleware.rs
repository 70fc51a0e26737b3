//! The request gate: security headers, rate limiting, and bearer auth.
//!
//! Chain order, outermost first: security headers → IP or token rate limit
//! → bearer auth → MCP dispatcher.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{ConnectInfo, Request, State},
    http::{header, HeaderValue, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use tracing::{debug, warn};

use crate::auth::Claims;
use crate::AppContext;

/// Security headers set on every response.
pub async fn security_headers(req: Request, next: Next) -> Response {
    let mut res = next.run(req).await;
    let headers = res.headers_mut();
    headers.insert("X-Content-Type-Options", HeaderValue::from_static("nosniff"));
    headers.insert("X-Frame-Options", HeaderValue::from_static("DENY"));
    headers.insert(
        "Referrer-Policy",
        HeaderValue::from_static("strict-origin-when-cross-origin"),
    );
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
    headers.insert("X-XSS-Protection", HeaderValue::from_static("0"));
    res
}

/// Per-client-IP rate limiting for unauthenticated (OAuth) endpoints.
pub async fn ip_rate_limit(
    State(ctx): State<Arc<AppContext>>,
    req: Request,
    next: Next,
) -> Response {
    let Some(limiter) = &ctx.ip_limiter else {
        return next.run(req).await;
    };
    let key = client_ip(&req);
    let (allowed, retry_after) = limiter.allow(&key);
    if !allowed {
        warn!(ip = %key, retry_after, "ip rate limit exceeded");
        return too_many_requests(retry_after);
    }
    next.run(req).await
}

/// Per-bearer-token rate limiting for the MCP endpoint. Requests without a
/// token fall through; auth will reject them, keeping failure attribution
/// clean.
pub async fn token_rate_limit(
    State(ctx): State<Arc<AppContext>>,
    req: Request,
    next: Next,
) -> Response {
    let Some(limiter) = &ctx.token_limiter else {
        return next.run(req).await;
    };
    let Some(token) = bearer_token(&req) else {
        return next.run(req).await;
    };
    let (allowed, retry_after) = limiter.allow(&token);
    if !allowed {
        warn!(retry_after, "token rate limit exceeded");
        return too_many_requests(retry_after);
    }
    next.run(req).await
}

/// OAuth 2.1 bearer validation. On success the verified claims are stored
/// in request extensions for handlers.
pub async fn bearer_auth(
    State(ctx): State<Arc<AppContext>>,
    mut req: Request,
    next: Next,
) -> Response {
    if !ctx.config.auth.enabled {
        return next.run(req).await;
    }

    let Some(token) = bearer_token(&req) else {
        return unauthorized("missing or malformed Authorization header");
    };

    match ctx.oauth.validate_access_token(&token).await {
        Ok(claims) => {
            debug!(client_id = %claims.client_id, scope = %claims.scope, "request authenticated");
            req.extensions_mut().insert::<Claims>(claims);
            next.run(req).await
        }
        Err(e) => {
            debug!(err = %e, "token validation failed");
            unauthorized("invalid or expired token")
        }
    }
}

/// Extract the bearer token: case-insensitive scheme, exactly one space.
fn bearer_token(req: &Request) -> Option<String> {
    let header = req.headers().get(header::AUTHORIZATION)?.to_str().ok()?;
    parse_bearer(header).map(str::to_string)
}

pub fn parse_bearer(header: &str) -> Option<&str> {
    let (scheme, token) = header.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") || token.is_empty() || token.contains(' ') {
        return None;
    }
    Some(token)
}

/// Client IP for rate-limit keying: first `X-Forwarded-For` entry (reverse
/// proxies), else the remote address without its port.
pub fn client_ip(req: &Request) -> String {
    if let Some(xff) = req
        .headers()
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
    {
        let first = xff.split(',').next().unwrap_or(xff).trim();
        if !first.is_empty() {
            return first.to_string();
        }
    }
    req.extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_default()
}

fn unauthorized(msg: &str) -> Response {
    (
        StatusCode::UNAUTHORIZED,
        [(
            header::WWW_AUTHENTICATE,
            HeaderValue::from_static(r#"Bearer error="invalid_token""#),
        )],
        msg.to_string(),
    )
        .into_response()
}

fn too_many_requests(retry_after: f64) -> Response {
    (
        StatusCode::TOO_MANY_REQUESTS,
        [(
            header::RETRY_AFTER,
            // Round up and add a second of slack.
            HeaderValue::from_str(&format!("{:.0}", retry_after.ceil() + 1.0))
                .unwrap_or(HeaderValue::from_static("1")),
        )],
        "rate limit exceeded".to_string(),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_bearer_accepts_case_insensitive_scheme() {
        assert_eq!(parse_bearer("Bearer abc"), Some("abc"));
        assert_eq!(parse_bearer("bearer abc"), Some("abc"));
        assert_eq!(parse_bearer("BEARER abc"), Some("abc"));
    }

    #[test]
    fn parse_bearer_rejects_malformed() {
        assert_eq!(parse_bearer("Bearer"), None);
        assert_eq!(parse_bearer("Bearer "), None);
        assert_eq!(parse_bearer("Basic abc"), None);
        assert_eq!(parse_bearer("Bearer a b"), None);
        assert_eq!(parse_bearer(""), None);
    }

    #[test]
    fn client_ip_prefers_forwarded_for() {
        let req = Request::builder()
            .header("x-forwarded-for", "203.0.113.7, 10.0.0.1")
            .body(axum::body::Body::empty())
            .unwrap();
        assert_eq!(client_ip(&req), "203.0.113.7");
    }

    #[test]
    fn client_ip_strips_port_from_remote() {
        let mut req = Request::builder()
            .body(axum::body::Body::empty())
            .unwrap();
        req.extensions_mut()
            .insert(ConnectInfo::<SocketAddr>("192.0.2.4:51234".parse().unwrap()));
        assert_eq!(client_ip(&req), "192.0.2.4");
    }
}
