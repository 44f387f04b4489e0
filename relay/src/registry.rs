//! Channel registry for RTunnel Relay
//!
//! Holds the one tunnel connection that serves new requests. A connection
//! that registers while another is active supersedes it: the old one is
//! closed and every request still waiting on it fails.

use dashmap::DashMap;
use std::sync::{Arc, OnceLock};
use std::time::Instant;
use tokio::sync::{mpsc, oneshot, RwLock};
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use tracing::{debug, info};

use rtunnel_shared::protocol::{ChannelId, CorrelationId, ForwardResponse, ResponseData, TunnelMessage};
use rtunnel_shared::RelayError;

use crate::auth::Admission;

/// Completion side of one PendingWait.
pub type Waiter = oneshot::Sender<Result<ResponseData, RelayError>>;

/// Server-side view of an attached client.
pub struct ChannelHandle {
    /// Assigned by the relay when the socket was accepted
    pub connection_id: ChannelId,
    /// Reported by the client in `init_response`
    pub client_id: ChannelId,
    pub admission: Admission,
    pub registered_at: Instant,
    /// Outbound queue drained by the socket loop
    tx: mpsc::Sender<TunnelMessage>,
    /// PendingWaits addressed to this connection
    pending: DashMap<CorrelationId, Waiter>,
    closed: CancellationToken,
    close_reason: OnceLock<String>,
}

impl ChannelHandle {
    pub fn new(
        connection_id: ChannelId,
        client_id: ChannelId,
        admission: Admission,
        tx: mpsc::Sender<TunnelMessage>,
    ) -> Self {
        Self {
            connection_id,
            client_id,
            admission,
            registered_at: Instant::now(),
            tx,
            pending: DashMap::new(),
            closed: CancellationToken::new(),
            close_reason: OnceLock::new(),
        }
    }

    /// Queue a message for the client. Gives up as soon as the channel closes.
    pub async fn send(&self, msg: TunnelMessage) -> Result<(), RelayError> {
        if self.is_closed() {
            return Err(self.lost());
        }
        tokio::select! {
            _ = self.closed() => Err(self.lost()),
            sent = self.tx.send(msg) => {
                sent.map_err(|_| RelayError::ChannelLost("outbound queue closed".into()))
            }
        }
    }

    /// Register a PendingWait. If the channel closed concurrently the waiter
    /// is failed right away instead of being left for the deadline.
    pub fn add_waiter(&self, id: CorrelationId, waiter: Waiter) {
        self.pending.insert(id, waiter);
        if self.is_closed() {
            if let Some(waiter) = self.take_waiter(&id) {
                let _ = waiter.send(Err(self.lost()));
            }
        }
    }

    /// Single-winner removal of a PendingWait.
    pub fn take_waiter(&self, id: &CorrelationId) -> Option<Waiter> {
        self.pending.remove(id).map(|(_, waiter)| waiter)
    }

    /// Deliver a response to its waiter. Returns false when nothing was
    /// waiting for it (timed out, or addressed to another connection).
    pub fn complete(&self, resp: ForwardResponse) -> bool {
        match self.take_waiter(&resp.correlation_id) {
            Some(waiter) => {
                // the receiver may have given up in the same instant
                let _ = waiter.send(Ok(resp.response));
                true
            }
            None => false,
        }
    }

    /// Close the channel and fail everything still pending on it. Idempotent.
    pub fn close(&self, reason: &str) {
        let _ = self.close_reason.set(reason.to_string());
        self.closed.cancel();

        let ids: Vec<CorrelationId> = self.pending.iter().map(|e| *e.key()).collect();
        let mut failed = 0;
        for id in ids {
            if let Some(waiter) = self.take_waiter(&id) {
                let _ = waiter.send(Err(self.lost()));
                failed += 1;
            }
        }
        if failed > 0 {
            info!(connection_id = %self.connection_id, failed, "failed pending requests on closed channel");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Resolves once the channel has been closed.
    pub fn closed(&self) -> WaitForCancellationFuture<'_> {
        self.closed.cancelled()
    }

    pub fn close_reason(&self) -> &str {
        self.close_reason.get().map(String::as_str).unwrap_or("closed")
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    fn lost(&self) -> RelayError {
        RelayError::ChannelLost(self.close_reason().to_string())
    }
}

/// Registry of attached tunnel channels.
///
/// Holds a single active slot; the handle carries its own identity so a
/// keyed map can replace the slot without changing callers.
#[derive(Default)]
pub struct ChannelRegistry {
    active: RwLock<Option<Arc<ChannelHandle>>>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `handle` the active channel, closing whichever one it replaces.
    /// The swap and the close happen under the same write lock.
    pub async fn register(&self, handle: Arc<ChannelHandle>) -> Option<Arc<ChannelHandle>> {
        let mut slot = self.active.write().await;
        let previous = slot.replace(handle.clone());
        if let Some(prev) = &previous {
            prev.close("superseded by a newer connection");
            info!(
                connection_id = %prev.connection_id,
                replaced_by = %handle.connection_id,
                "evicted superseded channel"
            );
        }
        info!(
            connection_id = %handle.connection_id,
            channel_id = %handle.client_id,
            subject = handle.admission.subject().unwrap_or("-"),
            "channel registered"
        );
        previous
    }

    /// Currently active channel, never one that has been closed.
    pub async fn active(&self) -> Option<Arc<ChannelHandle>> {
        let slot = self.active.read().await;
        slot.as_ref().filter(|h| !h.is_closed()).cloned()
    }

    /// Remove the channel if it is still the active one. Idempotent.
    pub async fn evict(&self, connection_id: ChannelId) -> bool {
        let mut slot = self.active.write().await;
        let is_active = slot
            .as_ref()
            .map_or(false, |h| h.connection_id == connection_id);
        if !is_active {
            debug!(connection_id = %connection_id, "evict: not the active channel");
            return false;
        }
        if let Some(h) = slot.take() {
            h.close("channel disconnected");
        }
        info!(connection_id = %connection_id, "channel evicted");
        true
    }
}
