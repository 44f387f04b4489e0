//! Client side of the tunnel
//!
//! Dials the relay, answers the handshake and serves forward requests
//! concurrently until the connection drops, then dials again.

use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval_at, sleep, timeout, Instant};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{header::AUTHORIZATION, HeaderValue};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, info_span, warn, Instrument};
use url::Url;

use rtunnel_shared::protocol::{ChannelId, ForwardEvent, ForwardResponse, TunnelMessage};
use rtunnel_shared::RelayError;

use crate::forward::ForwardingExecutor;
use crate::router::TargetRouter;
use crate::token::TokenProvider;

const PING_INTERVAL: Duration = Duration::from_secs(25);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const OUTBOUND_QUEUE: usize = 256;

/// How one connection ended
#[derive(Debug, PartialEq, Eq)]
pub enum SessionEnd {
    /// Local shutdown was requested
    Shutdown,
    /// The relay went away; reconnect
    Closed(String),
}

pub struct Session {
    endpoint: Url,
    channel_id: ChannelId,
    tokens: TokenProvider,
    router: Arc<TargetRouter>,
    executor: Arc<ForwardingExecutor>,
    reconnect_delay: Duration,
}

impl Session {
    pub fn new(
        endpoint: Url,
        tokens: TokenProvider,
        router: TargetRouter,
        executor: ForwardingExecutor,
        reconnect_delay: Duration,
    ) -> Self {
        Self {
            endpoint,
            channel_id: ChannelId::new(),
            tokens,
            router: Arc::new(router),
            executor: Arc::new(executor),
            reconnect_delay,
        }
    }

    pub fn channel_id(&self) -> ChannelId {
        self.channel_id
    }

    /// Stay attached to the relay until `shutdown` resolves.
    pub async fn run<F>(&self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);

        loop {
            match self.connect_and_serve(shutdown.as_mut()).await {
                Ok(SessionEnd::Shutdown) => return Ok(()),
                Ok(SessionEnd::Closed(reason)) => {
                    warn!(reason = %reason, "tunnel closed, reconnecting in {:?}", self.reconnect_delay)
                }
                Err(e) => {
                    warn!(error = %e, "tunnel failed, reconnecting in {:?}", self.reconnect_delay)
                }
            }

            tokio::select! {
                _ = shutdown.as_mut() => return Ok(()),
                _ = sleep(self.reconnect_delay) => {}
            }
        }
    }

    /// One connection: dial, handshake, serve.
    pub async fn connect_and_serve<F>(&self, mut shutdown: Pin<&mut F>) -> Result<SessionEnd>
    where
        F: Future<Output = ()>,
    {
        let mut request = self
            .endpoint
            .as_str()
            .into_client_request()
            .context("invalid relay endpoint")?;
        if let Some(token) = self.tokens.resolve().await.context("failed to obtain token")? {
            let value = HeaderValue::from_str(&format!("Bearer {}", token))
                .context("token is not a valid header value")?;
            request.headers_mut().insert(AUTHORIZATION, value);
        }

        info!(endpoint = %self.endpoint, "connecting to relay");
        let (ws_stream, _) = timeout(CONNECT_TIMEOUT, connect_async(request))
            .await
            .context("timed out connecting to relay")?
            .context("failed to connect to relay")?;

        let (mut write, mut read) = ws_stream.split();
        let (out_tx, mut out_rx) = mpsc::channel::<TunnelMessage>(OUTBOUND_QUEUE);
        let mut ping = interval_at(Instant::now() + PING_INTERVAL, PING_INTERVAL);

        loop {
            tokio::select! {
                _ = shutdown.as_mut() => {
                    info!("shutting down");
                    let bye = TunnelMessage::Disconnect { reason: "client shutdown".into() };
                    let _ = write.send(Message::Text(bye.encode()?)).await;
                    let _ = write.close().await;
                    return Ok(SessionEnd::Shutdown);
                }
                msg = read.next() => {
                    let frame = match msg {
                        Some(Ok(Message::Text(text))) => text.into_bytes(),
                        Some(Ok(Message::Binary(data))) => data,
                        Some(Ok(Message::Ping(data))) => {
                            write.send(Message::Pong(data)).await?;
                            continue;
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            return Ok(SessionEnd::Closed("relay closed connection".into()));
                        }
                        Some(Ok(_)) => continue,
                        Some(Err(e)) => return Err(e).context("websocket error"),
                    };

                    let msg = match TunnelMessage::decode(&frame) {
                        Ok(m) => m,
                        Err(e) => {
                            warn!(error = %e, "undecodable frame from relay");
                            continue;
                        }
                    };

                    match msg {
                        TunnelMessage::InitRequest => {
                            let reply = TunnelMessage::InitResponse { channel_id: self.channel_id };
                            write.send(Message::Text(reply.encode()?)).await?;
                            info!(channel_id = %self.channel_id, "tunnel established");
                        }
                        TunnelMessage::ForwardRequest(event) => self.spawn_forward(event, out_tx.clone()),
                        TunnelMessage::Disconnect { reason } => {
                            return Ok(SessionEnd::Closed(reason));
                        }
                        other => warn!(kind = other.kind(), "unexpected message from relay"),
                    }
                }
                Some(out) = out_rx.recv() => {
                    write.send(Message::Text(out.encode()?)).await?;
                }
                _ = ping.tick() => {
                    debug!("ping");
                    write.send(Message::Ping(Vec::new())).await?;
                }
            }
        }
    }

    fn spawn_forward(&self, event: ForwardEvent, out: mpsc::Sender<TunnelMessage>) {
        let router = self.router.clone();
        let executor = self.executor.clone();
        let span = info_span!("forward", correlation_id = %event.correlation_id);

        tokio::spawn(
            async move {
                let resp = respond(&router, &executor, &event).await;
                if out.send(TunnelMessage::ForwardResponse(resp)).await.is_err() {
                    warn!("connection gone before the response could be sent");
                }
            }
            .instrument(span),
        );
    }
}

/// Route one relayed request and produce its response envelope.
pub async fn respond(
    router: &TargetRouter,
    executor: &ForwardingExecutor,
    event: &ForwardEvent,
) -> ForwardResponse {
    match router.select(&event.request.url) {
        Some(target) => executor.execute(target, event).await,
        None => {
            let err = RelayError::NoTargetMatch(event.request.url.clone());
            warn!(error = %err, "no route");
            ForwardResponse::failed(event.correlation_id, &err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::forward::ForwardOptions;
    use rtunnel_shared::protocol::{Headers, RequestData};

    fn event(url: &str) -> ForwardEvent {
        ForwardEvent::new(RequestData {
            method: "GET".into(),
            url: url.into(),
            headers: Headers::new(),
            body: None,
        })
    }

    #[tokio::test]
    async fn test_unrouted_request_is_502() {
        let router = TargetRouter::new(
            vec!["/a/**".into()],
            vec![Url::parse("http://127.0.0.1:9").unwrap()],
        )
        .unwrap();
        let executor = ForwardingExecutor::new(ForwardOptions::default()).unwrap();

        let ev = event("/c/z");
        let resp = respond(&router, &executor, &ev).await;
        assert_eq!(resp.correlation_id, ev.correlation_id);
        assert_eq!(resp.response.status, 502);
        assert_eq!(resp.response.status_text, "Bad Gateway");
        assert_eq!(resp.response.body, Some(b"Bad Gateway".to_vec()));
    }

    #[tokio::test]
    async fn test_unreachable_relay_is_an_error() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let session = Session::new(
            Url::parse(&format!("ws://{}/_tunnel", addr)).unwrap(),
            TokenProvider::new(crate::token::TokenSource::None),
            TargetRouter::new(vec![], vec![Url::parse("http://127.0.0.1:9").unwrap()]).unwrap(),
            ForwardingExecutor::new(ForwardOptions::default()).unwrap(),
            Duration::from_millis(10),
        );
        let shutdown = std::future::pending::<()>();
        tokio::pin!(shutdown);
        assert!(session.connect_and_serve(shutdown.as_mut()).await.is_err());
    }
}
