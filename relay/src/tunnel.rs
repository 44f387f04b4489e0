//! Tunnel sessions for RTunnel Relay
//!
//! One task per WebSocket: handshake, register, then multiplex forward
//! requests out and forward responses in until either side goes away.

use axum::extract::ws::{Message, WebSocket};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{sleep_until, timeout_at, Instant};
use tracing::{debug, info, info_span, warn, Instrument};

use rtunnel_shared::protocol::{ChannelId, TunnelMessage};
use rtunnel_shared::RelayError;

use crate::auth::Admission;
use crate::registry::ChannelHandle;
use crate::server::AppState;

/// Forward requests queued for one client before senders wait
const OUTBOUND_QUEUE: usize = 256;

pub async fn handle_socket(socket: WebSocket, state: AppState, admission: Admission) {
    let connection_id = ChannelId::new();
    let span = info_span!("tunnel", connection_id = %connection_id);
    let (sender, receiver) = socket.split();
    run_session(sender, receiver, state, admission, connection_id)
        .instrument(span)
        .await
}

async fn run_session<S, R, E>(
    mut sender: S,
    mut receiver: R,
    state: AppState,
    admission: Admission,
    connection_id: ChannelId,
) where
    S: Sink<Message> + Unpin,
    S::Error: Display,
    R: Stream<Item = Result<Message, E>> + Unpin,
    E: Display,
{
    let client_id = match handshake(&mut sender, &mut receiver, state.handshake_timeout).await {
        Ok(id) => id,
        Err(e) => {
            warn!(error = %e, "tunnel handshake failed");
            let _ = send_message(&mut sender, &disconnect(e.to_string())).await;
            let _ = sender.close().await;
            return;
        }
    };

    let (tx, mut rx) = mpsc::channel::<TunnelMessage>(OUTBOUND_QUEUE);
    let handle = Arc::new(ChannelHandle::new(connection_id, client_id, admission, tx));
    state.registry.register(handle.clone()).await;

    let mut last_seen = Instant::now();
    let reason = loop {
        tokio::select! {
            _ = handle.closed() => break handle.close_reason().to_string(),
            _ = sleep_until(last_seen + state.idle_timeout) => {
                break format!("client idle for {:?}", state.idle_timeout);
            }
            msg = receiver.next() => {
                last_seen = Instant::now();
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        if let Some(reason) = dispatch(&handle, text.as_bytes()) {
                            break reason;
                        }
                    }
                    Some(Ok(Message::Binary(data))) => {
                        if let Some(reason) = dispatch(&handle, &data) {
                            break reason;
                        }
                    }
                    Some(Ok(Message::Ping(d))) => { let _ = sender.send(Message::Pong(d)).await; }
                    Some(Ok(Message::Pong(_))) => {}
                    Some(Ok(Message::Close(_))) | None => break "client closed connection".to_string(),
                    Some(Err(e)) => break format!("websocket error: {}", e),
                }
            }
            Some(out) = rx.recv() => {
                if let Err(e) = send_message(&mut sender, &out).await {
                    break format!("send failed: {}", e);
                }
            }
        }
    };

    // fail what is still pending with the real reason, then give up the slot
    let pending = handle.pending_count();
    handle.close(&reason);
    state.registry.evict(connection_id).await;

    let _ = send_message(&mut sender, &disconnect(reason.clone())).await;
    let _ = sender.close().await;
    info!(
        channel_id = %client_id,
        pending,
        uptime_secs = handle.registered_at.elapsed().as_secs(),
        reason = %reason,
        "tunnel closed"
    );
}

/// `init_request` out, `init_response` back. Returns the client's channel id.
async fn handshake<S, R, E>(
    sender: &mut S,
    receiver: &mut R,
    wait: Duration,
) -> Result<ChannelId, RelayError>
where
    S: Sink<Message> + Unpin,
    S::Error: Display,
    R: Stream<Item = Result<Message, E>> + Unpin,
    E: Display,
{
    send_message(sender, &TunnelMessage::InitRequest).await?;
    let deadline = Instant::now() + wait;

    loop {
        let msg = timeout_at(deadline, receiver.next())
            .await
            .map_err(|_| RelayError::Protocol("no init_response before deadline".into()))?;

        let frame = match msg {
            Some(Ok(Message::Text(text))) => text.into_bytes(),
            Some(Ok(Message::Binary(data))) => data,
            Some(Ok(Message::Ping(d))) => {
                let _ = sender.send(Message::Pong(d)).await;
                continue;
            }
            Some(Ok(Message::Pong(_))) => continue,
            Some(Ok(Message::Close(_))) | None => {
                return Err(RelayError::ChannelLost("closed during handshake".into()))
            }
            Some(Err(e)) => return Err(RelayError::ChannelLost(e.to_string())),
        };

        return match TunnelMessage::decode(&frame)? {
            TunnelMessage::InitResponse { channel_id } => {
                debug!(channel_id = %channel_id, "init_response received");
                Ok(channel_id)
            }
            other => Err(RelayError::Protocol(format!(
                "expected init_response, got {}",
                other.kind()
            ))),
        };
    }
}

/// Handle one inbound frame. Returns a reason when the session should end.
fn dispatch(handle: &ChannelHandle, frame: &[u8]) -> Option<String> {
    match TunnelMessage::decode(frame) {
        Ok(TunnelMessage::ForwardResponse(resp)) => {
            let id = resp.correlation_id;
            if !handle.complete(resp) {
                debug!(correlation_id = %id, "dropping unmatched forward response");
            }
            None
        }
        Ok(TunnelMessage::Disconnect { reason }) => Some(format!("client disconnected: {}", reason)),
        Ok(other) => {
            warn!(kind = other.kind(), "unexpected message from client");
            None
        }
        Err(e) => {
            warn!(error = %e, "undecodable frame from client");
            None
        }
    }
}

async fn send_message<S>(sender: &mut S, msg: &TunnelMessage) -> Result<(), RelayError>
where
    S: Sink<Message> + Unpin,
    S::Error: Display,
{
    let text = msg.encode()?;
    sender
        .send(Message::Text(text))
        .await
        .map_err(|e| RelayError::ChannelLost(e.to_string()))
}

fn disconnect(reason: String) -> TunnelMessage {
    TunnelMessage::Disconnect { reason }
}
