//! Relay, client session and target services wired together over real sockets.

use axum::{
    body::Bytes,
    extract::Query,
    http::{StatusCode, Uri},
    routing::{any, get},
    Json, Router,
};
use futures_util::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use url::Url;

use rtunnel::forward::{ForwardOptions, ForwardingExecutor};
use rtunnel::router::TargetRouter;
use rtunnel::session::Session;
use rtunnel::token::{TokenProvider, TokenSource};
use rtunnel_relay::auth::{Admission, AuthGate, TokenInfoVerifier, DEFAULT_ASSERTION_HEADER};
use rtunnel_relay::{app, AppState, RelayConfig};
use rtunnel_shared::protocol::{ChannelId, ForwardResponse, Headers, ResponseData, TunnelMessage};

async fn serve(router: Router) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move { axum::serve(listener, router).await.unwrap() });
    addr
}

async fn start_relay(auth: AuthGate) -> (SocketAddr, AppState) {
    let config = RelayConfig {
        timeout_secs: 10,
        ..Default::default()
    };
    let state = AppState::new(&config, auth);
    let addr = serve(app(state.clone(), &config.tunnel_path)).await;
    (addr, state)
}

/// Echoes the body and reports which target saw which path.
async fn start_target(name: &'static str) -> Url {
    let router = Router::new()
        .route("/a/missing", any(|| async { (StatusCode::NOT_FOUND, "not here") }))
        .fallback(move |uri: Uri, body: Bytes| async move {
            (
                StatusCode::OK,
                [("x-target", name.to_string()), ("x-path", uri.path().to_string())],
                body,
            )
        });
    let addr = serve(router).await;
    Url::parse(&format!("http://{}", addr)).unwrap()
}

fn start_client(
    relay: SocketAddr,
    tokens: TokenSource,
    patterns: &[&str],
    targets: Vec<Url>,
    reconnect_delay: Duration,
) -> oneshot::Sender<()> {
    let session = Session::new(
        Url::parse(&format!("ws://{}/_tunnel", relay)).unwrap(),
        TokenProvider::new(tokens),
        TargetRouter::new(patterns.iter().map(|p| p.to_string()).collect(), targets).unwrap(),
        ForwardingExecutor::new(ForwardOptions::default()).unwrap(),
        reconnect_delay,
    );

    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    tokio::spawn(async move {
        session
            .run(async {
                stop_rx.await.ok();
            })
            .await
    });
    stop_tx
}

/// Wait until a channel whose client id satisfies `pred` is registered.
async fn wait_for_channel<F>(state: &AppState, pred: F)
where
    F: Fn(ChannelId) -> bool,
{
    for _ in 0..200 {
        if let Some(handle) = state.registry.active().await {
            if pred(handle.client_id) {
                return;
            }
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("no matching channel registered");
}

fn http() -> reqwest::Client {
    reqwest::Client::builder().no_proxy().build().unwrap()
}

#[tokio::test]
async fn test_requests_routed_through_tunnel() {
    let (relay, state) = start_relay(AuthGate::open()).await;
    let t1 = start_target("t1").await;
    let t2 = start_target("t2").await;
    let _stop = start_client(
        relay,
        TokenSource::None,
        &["/a/**", "/b/**"],
        vec![t1, t2],
        Duration::from_millis(100),
    );
    wait_for_channel(&state, |_| true).await;

    let http = http();
    let base = format!("http://{}", relay);

    let resp = http.get(format!("{}/a/x?page=2", base)).send().await.unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(resp.headers()["x-target"], "t1");
    assert_eq!(resp.headers()["x-path"], "/a/x");

    let resp = http.get(format!("{}/b/y", base)).send().await.unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(resp.headers()["x-target"], "t2");

    // no pattern matches
    let resp = http.get(format!("{}/c/z", base)).send().await.unwrap();
    assert_eq!(resp.status(), 502);
    assert_eq!(resp.text().await.unwrap(), "Bad Gateway");

    // target errors pass through untouched
    let resp = http.get(format!("{}/a/missing", base)).send().await.unwrap();
    assert_eq!(resp.status(), 404);
    assert_eq!(resp.text().await.unwrap(), "not here");
}

#[tokio::test]
async fn test_binary_body_round_trip() {
    let (relay, state) = start_relay(AuthGate::open()).await;
    let target = start_target("t1").await;
    let _stop = start_client(relay, TokenSource::None, &[], vec![target], Duration::from_millis(100));
    wait_for_channel(&state, |_| true).await;

    let payload: Vec<u8> = (0..=255u8).cycle().take(4096).collect();
    let resp = http()
        .post(format!("http://{}/upload", relay))
        .body(payload.clone())
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(resp.bytes().await.unwrap().to_vec(), payload);
}

#[tokio::test]
async fn test_concurrent_requests_get_their_own_responses() {
    let (relay, state) = start_relay(AuthGate::open()).await;
    let target = start_target("t1").await;
    let _stop = start_client(relay, TokenSource::None, &[], vec![target], Duration::from_millis(100));
    wait_for_channel(&state, |_| true).await;

    let http = http();
    let calls = (0..20).map(|i| {
        let http = http.clone();
        let url = format!("http://{}/item/{}", relay, i);
        async move {
            let resp = http.get(url).send().await.unwrap();
            (i, resp.headers()["x-path"].to_str().unwrap().to_string())
        }
    });
    for (i, path) in futures_util::future::join_all(calls).await {
        assert_eq!(path, format!("/item/{}", i));
    }
}

#[tokio::test]
async fn test_no_client_is_502() {
    let (relay, _state) = start_relay(AuthGate::open()).await;

    let started = std::time::Instant::now();
    let resp = http().get(format!("http://{}/anything", relay)).send().await.unwrap();
    assert_eq!(resp.status(), 502);
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[tokio::test]
async fn test_newest_client_supersedes() {
    let (relay, state) = start_relay(AuthGate::open()).await;
    let target = start_target("t1").await;
    // long delay keeps the superseded session from reattaching during the test
    let _stop = start_client(relay, TokenSource::None, &[], vec![target], Duration::from_secs(60));
    wait_for_channel(&state, |_| true).await;

    let (ws, _) = connect_async(format!("ws://{}/_tunnel", relay)).await.unwrap();
    let (mut write, mut read) = ws.split();

    let frame = read.next().await.unwrap().unwrap().into_data();
    assert_eq!(TunnelMessage::decode(&frame).unwrap(), TunnelMessage::InitRequest);

    let raw_id = ChannelId::new();
    let init = TunnelMessage::InitResponse { channel_id: raw_id };
    write.send(Message::Text(init.encode().unwrap())).await.unwrap();
    wait_for_channel(&state, |id| id == raw_id).await;

    tokio::spawn(async move {
        while let Some(Ok(msg)) = read.next().await {
            if let Ok(TunnelMessage::ForwardRequest(ev)) = TunnelMessage::decode(&msg.into_data()) {
                let reply = TunnelMessage::ForwardResponse(ForwardResponse {
                    correlation_id: ev.correlation_id,
                    response: ResponseData {
                        status: 201,
                        status_text: "Created".into(),
                        headers: Headers::new(),
                        body: Some(b"from raw client".to_vec()),
                    },
                });
                write.send(Message::Text(reply.encode().unwrap())).await.unwrap();
            }
        }
    });

    let resp = http().get(format!("http://{}/who", relay)).send().await.unwrap();
    assert_eq!(resp.status(), 201);
    assert_eq!(resp.text().await.unwrap(), "from raw client");
}

async fn start_token_info() -> String {
    async fn tokeninfo(Query(params): Query<HashMap<String, String>>) -> (StatusCode, Json<serde_json::Value>) {
        match params.get("id_token").map(String::as_str) {
            Some("good") => (
                StatusCode::OK,
                Json(serde_json::json!({
                    "sub": "svc-123",
                    "email": "svc@example.com",
                    "aud": "relay-audience",
                    "exp": "4102444800",
                })),
            ),
            _ => (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({ "error": "invalid_token" })),
            ),
        }
    }

    let addr = serve(Router::new().route("/tokeninfo", get(tokeninfo))).await;
    format!("http://{}/tokeninfo", addr)
}

fn verifying_gate(verify_url: String) -> AuthGate {
    let verifier = TokenInfoVerifier::new(verify_url, Some("relay-audience".into())).unwrap();
    AuthGate::new(
        Some(Arc::new(verifier)),
        axum::http::HeaderName::from_static(DEFAULT_ASSERTION_HEADER),
    )
}

#[tokio::test]
async fn test_auth_required_rejects_missing_token() {
    let verify_url = start_token_info().await;
    let (relay, state) = start_relay(verifying_gate(verify_url)).await;

    assert!(connect_async(format!("ws://{}/_tunnel", relay)).await.is_err());
    assert!(state.registry.active().await.is_none());

    let resp = http().get(format!("http://{}/x", relay)).send().await.unwrap();
    assert_eq!(resp.status(), 502);
}

#[tokio::test]
async fn test_auth_required_admits_verified_token() {
    let verify_url = start_token_info().await;
    let (relay, state) = start_relay(verifying_gate(verify_url)).await;
    let target = start_target("t1").await;
    let _stop = start_client(
        relay,
        TokenSource::Static("good".into()),
        &[],
        vec![target],
        Duration::from_millis(100),
    );
    wait_for_channel(&state, |_| true).await;

    let handle = state.registry.active().await.unwrap();
    assert!(matches!(handle.admission, Admission::Verified(_)));
    assert_eq!(handle.admission.subject(), Some("svc@example.com"));

    let resp = http().get(format!("http://{}/ok", relay)).send().await.unwrap();
    assert_eq!(resp.status(), 200);
}
