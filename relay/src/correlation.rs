//! Request/response correlation
//!
//! Each public request becomes a ForwardEvent on the active channel and
//! waits, bounded by a deadline, for the ForwardResponse carrying the same
//! correlation id. Exactly one outcome reaches the caller: the response,
//! a timeout, or the loss of the channel.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info, info_span, warn, Instrument};

use rtunnel_shared::protocol::{ForwardEvent, RequestData, ResponseData, TunnelMessage};
use rtunnel_shared::RelayError;

use crate::registry::ChannelRegistry;

/// Default time to wait for the client's response
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);

pub struct CorrelationEngine {
    registry: Arc<ChannelRegistry>,
    timeout: Duration,
}

impl CorrelationEngine {
    pub fn new(registry: Arc<ChannelRegistry>, timeout: Duration) -> Self {
        Self { registry, timeout }
    }

    /// Configured per-request deadline
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Relay one request through the active channel and wait for its reply.
    pub async fn relay(
        &self,
        request: RequestData,
        deadline: Duration,
    ) -> Result<ResponseData, RelayError> {
        let event = ForwardEvent::new(request);
        let span = info_span!(
            "relay",
            correlation_id = %event.correlation_id,
            method = %event.request.method,
            url = %event.request.url,
        );

        async move {
            let created_at = event.created_at;
            let outcome = self.forward(event, deadline).await;
            let duration_ms = (Utc::now() - created_at).num_milliseconds();

            match &outcome {
                Ok(resp) => info!(status = resp.status, duration_ms, "relayed"),
                Err(e) => warn!(status = e.status().as_u16(), duration_ms, error = %e, "relay failed"),
            }
            outcome
        }
        .instrument(span)
        .await
    }

    async fn forward(
        &self,
        event: ForwardEvent,
        deadline: Duration,
    ) -> Result<ResponseData, RelayError> {
        // Created → no channel: fail without entering Sent
        let channel = self.registry.active().await.ok_or(RelayError::NoActiveChannel)?;
        let id = event.correlation_id;

        // the waiter must exist before the event can be answered
        let (tx, mut rx) = oneshot::channel();
        channel.add_waiter(id, tx);

        // queueing counts against the deadline: a backed-up channel times out too
        let expires = Instant::now() + deadline;
        let exchange = async {
            match channel.send(TunnelMessage::ForwardRequest(event)).await {
                Ok(()) => debug!(connection_id = %channel.connection_id, "forward request sent"),
                Err(e) => {
                    if let Some(waiter) = channel.take_waiter(&id) {
                        let _ = waiter.send(Err(e));
                    }
                }
            }
            (&mut rx).await
        };
        let outcome = timeout_at(expires, exchange).await;

        match outcome {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(RelayError::ChannelLost("waiter dropped".into())),
            Err(_) => match channel.take_waiter(&id) {
                Some(_) => Err(RelayError::CorrelationTimeout(deadline)),
                // a response or channel loss won the race; its outcome is in flight
                None => rx
                    .await
                    .unwrap_or_else(|_| Err(RelayError::ChannelLost("waiter dropped".into()))),
            },
        }
    }
}
