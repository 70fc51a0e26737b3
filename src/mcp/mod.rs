//! The HTTP/MCP surface.
//!
//! `POST /mcp` carries JSON-RPC (initialize, tools/list, tools/call) behind
//! the request gate; `GET /mcp` streams server→client notifications per MCP
//! session over SSE. OAuth endpoints sit on the same router behind the IP
//! rate limit.

pub mod handlers;
pub mod middleware;
pub mod protocol;
pub mod ratelimit;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, RwLock};

use anyhow::Result;
use axum::{
    extract::{Query, State},
    http::{HeaderMap, HeaderName, StatusCode},
    middleware::{from_fn, from_fn_with_state},
    response::{
        sse::{Event as SseEvent, KeepAlive, Sse},
        IntoResponse, Json, Redirect, Response,
    },
    routing::{get, post},
    Form, Router,
};
use futures_util::StreamExt;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::auth::{AuthorizeParams, TokenParams};
use crate::error::Error;
use crate::notify::mcp::NotificationSender;
use crate::AppContext;
use protocol::{
    notification, RpcRequest, RpcResponse, INVALID_PARAMS, INVALID_REQUEST, MCP_PROTOCOL_VERSION,
    METHOD_NOT_FOUND, PARSE_ERROR,
};

const SESSION_HEADER: &str = "mcp-session-id";

// ─── MCP session registry ────────────────────────────────────────────────────

struct SessionChannel {
    tx: mpsc::UnboundedSender<String>,
    /// Claimed by the session's SSE stream on `GET /mcp`.
    rx: Mutex<Option<mpsc::UnboundedReceiver<String>>>,
}

/// Tracks connected MCP sessions and delivers notifications to them.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, SessionChannel>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(&self) -> String {
        let id = uuid::Uuid::new_v4().to_string();
        let (tx, rx) = mpsc::unbounded_channel();
        self.sessions.write().expect("session registry lock").insert(
            id.clone(),
            SessionChannel {
                tx,
                rx: Mutex::new(Some(rx)),
            },
        );
        debug!(session_id = %id, "mcp session created");
        id
    }

    pub fn contains(&self, id: &str) -> bool {
        self.sessions
            .read()
            .expect("session registry lock")
            .contains_key(id)
    }

    /// Claim the notification stream for a session. Each session has one.
    fn subscribe(&self, id: &str) -> Option<mpsc::UnboundedReceiver<String>> {
        let sessions = self.sessions.read().expect("session registry lock");
        let rx = sessions.get(id)?.rx.lock().expect("session rx lock").take();
        rx
    }

    pub fn remove(&self, id: &str) -> bool {
        self.sessions
            .write()
            .expect("session registry lock")
            .remove(id)
            .is_some()
    }
}

impl NotificationSender for SessionRegistry {
    fn send_to_session(&self, session_id: &str, method: &str, params: Value) {
        let sessions = self.sessions.read().expect("session registry lock");
        if let Some(session) = sessions.get(session_id) {
            let _ = session.tx.send(notification(method, params));
        }
    }

    fn send_to_all(&self, method: &str, params: Value) {
        let message = notification(method, params);
        let sessions = self.sessions.read().expect("session registry lock");
        for session in sessions.values() {
            let _ = session.tx.send(message.clone());
        }
    }
}

// ─── Router ──────────────────────────────────────────────────────────────────

pub fn router(ctx: Arc<AppContext>) -> Router {
    let mcp_routes = Router::new()
        .route(
            "/mcp",
            post(handle_mcp_post).get(handle_mcp_sse).delete(handle_mcp_delete),
        )
        .layer(from_fn_with_state(ctx.clone(), middleware::bearer_auth))
        .layer(from_fn_with_state(ctx.clone(), middleware::token_rate_limit));

    let oauth_routes = Router::new()
        .route(
            "/.well-known/oauth-authorization-server",
            get(oauth_metadata),
        )
        .route("/oauth/authorize", get(oauth_authorize))
        .route("/oauth/token", post(oauth_token))
        .layer(from_fn_with_state(ctx.clone(), middleware::ip_rate_limit));

    Router::new()
        .merge(mcp_routes)
        .merge(oauth_routes)
        .layer(from_fn(middleware::security_headers))
        .with_state(ctx)
}

/// Bind and serve until shutdown (SIGTERM or Ctrl-C).
pub async fn serve(ctx: Arc<AppContext>) -> Result<()> {
    let addr = format!("{}:{}", ctx.config.server.host, ctx.config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(addr = %addr, "herald listening");

    let app = router(ctx);
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;
    info!("herald stopped");
    Ok(())
}

/// Resolves on SIGTERM (Unix) or Ctrl-C.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).expect("failed to register SIGTERM");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.ok();
    }
}

// ─── MCP endpoint ────────────────────────────────────────────────────────────

async fn handle_mcp_post(
    State(ctx): State<Arc<AppContext>>,
    headers: HeaderMap,
    body: String,
) -> Response {
    let req: RpcRequest = match serde_json::from_str(&body) {
        Ok(r) => r,
        Err(_) => {
            return rpc_json(
                RpcResponse::failure(Value::Null, PARSE_ERROR, "Parse error"),
                None,
            );
        }
    };
    if req.jsonrpc != protocol::JSONRPC_VERSION {
        return rpc_json(
            RpcResponse::failure(req.id.unwrap_or(Value::Null), INVALID_REQUEST, "Invalid Request"),
            None,
        );
    }

    if req.is_notification() {
        // notifications/initialized and friends: accepted, no body.
        return StatusCode::ACCEPTED.into_response();
    }

    let session_id = header_session(&headers);
    let id = req.id.clone().unwrap_or(Value::Null);
    let params = req.params.unwrap_or(Value::Null);
    debug!(method = %req.method, "mcp dispatch");

    match req.method.as_str() {
        "initialize" => {
            let new_session = ctx.sessions.create();
            let result = json!({
                "protocolVersion": MCP_PROTOCOL_VERSION,
                "capabilities": {
                    "tools": {"listChanged": false},
                    "logging": {},
                },
                "serverInfo": {
                    "name": "Herald",
                    "version": env!("CARGO_PKG_VERSION"),
                },
            });
            rpc_json(RpcResponse::success(id, result), Some(new_session))
        }
        "ping" => rpc_json(RpcResponse::success(id, json!({})), None),
        "tools/list" => rpc_json(
            RpcResponse::success(id, json!({"tools": handlers::definitions()})),
            None,
        ),
        "tools/call" => {
            let Some(name) = params.get("name").and_then(Value::as_str) else {
                return rpc_json(
                    RpcResponse::failure(id, INVALID_PARAMS, "tool name is required"),
                    None,
                );
            };
            let default_args = json!({});
            let args = params.get("arguments").unwrap_or(&default_args);
            let result = handlers::dispatch_tool(&ctx, name, args, &session_id).await;
            rpc_json(RpcResponse::success(id, result), None)
        }
        other => rpc_json(
            RpcResponse::failure(id, METHOD_NOT_FOUND, format!("Method not found: {other}")),
            None,
        ),
    }
}

/// Server→client notification stream for one MCP session.
async fn handle_mcp_sse(State(ctx): State<Arc<AppContext>>, headers: HeaderMap) -> Response {
    let session_id = header_session(&headers);
    if session_id.is_empty() {
        return (StatusCode::BAD_REQUEST, "Mcp-Session-Id header required").into_response();
    }
    let Some(rx) = ctx.sessions.subscribe(&session_id) else {
        return (StatusCode::NOT_FOUND, "unknown or already-streaming session").into_response();
    };

    let stream = tokio_stream::wrappers::UnboundedReceiverStream::new(rx)
        .map(|msg| Ok::<SseEvent, std::convert::Infallible>(SseEvent::default().data(msg)));
    Sse::new(stream)
        .keep_alive(
            KeepAlive::new()
                .interval(std::time::Duration::from_secs(15))
                .text("ping"),
        )
        .into_response()
}

async fn handle_mcp_delete(State(ctx): State<Arc<AppContext>>, headers: HeaderMap) -> Response {
    let session_id = header_session(&headers);
    if ctx.sessions.remove(&session_id) {
        StatusCode::NO_CONTENT.into_response()
    } else {
        StatusCode::NOT_FOUND.into_response()
    }
}

fn header_session(headers: &HeaderMap) -> String {
    headers
        .get(SESSION_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string()
}

fn rpc_json(resp: RpcResponse, new_session: Option<String>) -> Response {
    let mut response = Json(resp).into_response();
    if let Some(session) = new_session {
        if let Ok(value) = session.parse() {
            response
                .headers_mut()
                .insert(HeaderName::from_static(SESSION_HEADER), value);
        }
    }
    response
}

// ─── OAuth endpoints ─────────────────────────────────────────────────────────

async fn oauth_metadata(State(ctx): State<Arc<AppContext>>) -> Response {
    Json(ctx.oauth.metadata()).into_response()
}

async fn oauth_authorize(
    State(ctx): State<Arc<AppContext>>,
    Query(params): Query<AuthorizeParams>,
) -> Response {
    match ctx.oauth.authorize(&params).await {
        Ok(url) => Redirect::to(&url).into_response(),
        Err(e) => (e.status_code(), e.to_string()).into_response(),
    }
}

async fn oauth_token(
    State(ctx): State<Arc<AppContext>>,
    Form(params): Form<TokenParams>,
) -> Response {
    match ctx.oauth.token(&params).await {
        Ok(resp) => Json(resp).into_response(),
        Err(e) => {
            // Token endpoint failures use the RFC 6749 error envelope.
            let code = match &e {
                Error::InvalidArgument(_) => "invalid_request",
                Error::Unauthorized(_) => "invalid_grant",
                _ => "server_error",
            };
            let status = match &e {
                Error::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
                _ => StatusCode::BAD_REQUEST,
            };
            (
                status,
                Json(json!({"error": code, "error_description": e.to_string()})),
            )
                .into_response()
        }
    }
}
