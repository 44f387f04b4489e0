//! Public HTTP surface for RTunnel Relay
//!
//! A WebSocket upgrade on the tunnel path attaches a client. Every other
//! request, including plain requests to the tunnel path, is relayed through
//! the active channel.

use axum::{
    body::Body,
    extract::{ws::WebSocketUpgrade, FromRequestParts, State},
    http::{header::UPGRADE, HeaderMap, Request, StatusCode},
    response::{IntoResponse, Response},
    routing::any,
    Router,
};
use http_body_util::LengthLimitError;
use hyper::ext::ReasonPhrase;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use rtunnel_shared::headers::{from_header_map, strip_hop_by_hop, to_header_map};
use rtunnel_shared::protocol::{non_empty, RequestData, ResponseData, MAX_MESSAGE_SIZE};
use rtunnel_shared::RelayError;

use crate::auth::AuthGate;
use crate::config::RelayConfig;
use crate::correlation::CorrelationEngine;
use crate::registry::ChannelRegistry;
use crate::tunnel;

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<ChannelRegistry>,
    pub engine: Arc<CorrelationEngine>,
    pub auth: AuthGate,
    pub body_limit: usize,
    pub handshake_timeout: Duration,
    pub idle_timeout: Duration,
}

impl AppState {
    pub fn new(config: &RelayConfig, auth: AuthGate) -> Self {
        let registry = Arc::new(ChannelRegistry::new());
        let engine = Arc::new(CorrelationEngine::new(registry.clone(), config.timeout()));
        Self {
            registry,
            engine,
            auth,
            body_limit: config.body_limit,
            handshake_timeout: config.handshake_timeout(),
            idle_timeout: config.idle_timeout(),
        }
    }
}

/// Build the relay's router.
pub fn app(state: AppState, tunnel_path: &str) -> Router {
    Router::new()
        .route(tunnel_path, any(tunnel_handler))
        .fallback(proxy_handler)
        .with_state(state)
}

async fn tunnel_handler(State(state): State<AppState>, req: Request<Body>) -> Response {
    if !wants_websocket(req.headers()) {
        return proxy_handler(State(state), req).await;
    }

    let (mut parts, _) = req.into_parts();
    match WebSocketUpgrade::from_request_parts(&mut parts, &state).await {
        Ok(ws) => ws_handler(ws, &parts.headers, state).await,
        Err(rejection) => {
            warn!(error = %rejection, "malformed tunnel upgrade");
            rejection.into_response()
        }
    }
}

fn wants_websocket(headers: &HeaderMap) -> bool {
    headers
        .get(UPGRADE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("websocket"))
}

async fn ws_handler(ws: WebSocketUpgrade, headers: &HeaderMap, state: AppState) -> Response {
    match state.auth.authorize(headers).await {
        Ok(admission) => ws
            .max_message_size(MAX_MESSAGE_SIZE)
            .on_upgrade(move |socket| tunnel::handle_socket(socket, state, admission)),
        Err(e) => {
            warn!(error = %e, "tunnel connection rejected");
            error_response(&e)
        }
    }
}

async fn proxy_handler(State(state): State<AppState>, req: Request<Body>) -> Response {
    let (parts, body) = req.into_parts();

    let body = match axum::body::to_bytes(body, state.body_limit).await {
        Ok(b) => b,
        Err(e) if exceeds_limit(&e) => {
            warn!(limit = state.body_limit, "request body too large");
            return (StatusCode::PAYLOAD_TOO_LARGE, "Payload Too Large").into_response();
        }
        Err(e) => {
            warn!(error = %e, "failed to read request body");
            return (StatusCode::BAD_REQUEST, "Bad Request").into_response();
        }
    };

    let mut headers = from_header_map(&parts.headers);
    strip_hop_by_hop(&mut headers);

    let request = RequestData {
        method: parts.method.to_string(),
        url: parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| "/".to_string()),
        headers,
        body: non_empty(body.to_vec()),
    };

    match state.engine.relay(request, state.engine.timeout()).await {
        Ok(resp) => into_response(resp),
        Err(e) => error_response(&e),
    }
}

fn exceeds_limit(err: &axum::Error) -> bool {
    let mut source = std::error::Error::source(err);
    while let Some(e) = source {
        if e.is::<LengthLimitError>() {
            return true;
        }
        source = e.source();
    }
    false
}

/// Write a relayed response back: status, reason phrase, headers, body.
fn into_response(resp: ResponseData) -> Response {
    let Ok(status) = StatusCode::from_u16(resp.status) else {
        warn!(status = resp.status, "client returned an invalid status code");
        return error_response(&RelayError::Protocol(format!("invalid status {}", resp.status)));
    };

    let mut headers = resp.headers;
    strip_hop_by_hop(&mut headers);

    let mut response = Response::new(Body::from(resp.body.unwrap_or_default()));
    *response.status_mut() = status;
    *response.headers_mut() = to_header_map(&headers);

    if status.canonical_reason() != Some(resp.status_text.as_str()) && !resp.status_text.is_empty() {
        match ReasonPhrase::try_from(resp.status_text.into_bytes()) {
            Ok(reason) => {
                response.extensions_mut().insert(reason);
            }
            Err(_) => debug!("dropping invalid reason phrase"),
        }
    }
    response
}

/// Synthesized response for a relay failure. Only the generic status text
/// reaches the caller.
fn error_response(err: &RelayError) -> Response {
    (err.status(), err.status_text()).into_response()
}
