//! Paired in-memory channel.
//!
//! Behaves like an origin-gated cross-document channel: each end stamps its
//! own origin on delivery, delivery is restricted to the target origin, and
//! the guest end only accepts traffic once it has signalled readiness.

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use async_trait::async_trait;
use framebridge_core::{
    Envelope, Inbound, Transport, TransportError, config::ANY_ORIGIN,
};
use futures::{StreamExt, stream::BoxStream};
use serde_json::Value;
use tokio::sync::broadcast;
use tokio_stream::wrappers::{BroadcastStream, errors::BroadcastStreamRecvError};

use crate::protocol;

const CHANNEL_CAPACITY: usize = 1024;

/// One end of an in-memory channel.
#[derive(Clone)]
pub struct MemoryTransport {
    origin: String,
    peer_origin: String,
    inbox: broadcast::Sender<Inbound>,
    peer_inbox: broadcast::Sender<Inbound>,
    ready: Arc<AtomicBool>,
}

/// Create a connected host/guest pair. Both ends start ready.
#[must_use]
pub fn pair(
    host_origin: impl Into<String>,
    guest_origin: impl Into<String>,
) -> (MemoryTransport, MemoryTransport) {
    let (host, guest) = pair_unready(host_origin, guest_origin);
    host.set_ready(true);
    (host, guest)
}

/// Create a pair whose guest has not signalled readiness yet.
///
/// Sends from either end fail with [`TransportError::NotReady`] until
/// [`MemoryTransport::set_ready`] is called.
#[must_use]
pub fn pair_unready(
    host_origin: impl Into<String>,
    guest_origin: impl Into<String>,
) -> (MemoryTransport, MemoryTransport) {
    let (host_origin, guest_origin) = (host_origin.into(), guest_origin.into());
    let (host_inbox, _) = broadcast::channel(CHANNEL_CAPACITY);
    let (guest_inbox, _) = broadcast::channel(CHANNEL_CAPACITY);
    let ready = Arc::new(AtomicBool::new(false));

    let host = MemoryTransport {
        origin: host_origin.clone(),
        peer_origin: guest_origin.clone(),
        inbox: host_inbox.clone(),
        peer_inbox: guest_inbox.clone(),
        ready: Arc::clone(&ready),
    };
    let guest = MemoryTransport {
        origin: guest_origin,
        peer_origin: host_origin,
        inbox: guest_inbox,
        peer_inbox: host_inbox,
        ready,
    };
    (host, guest)
}

impl MemoryTransport {
    /// Origin this end stamps on delivered messages.
    #[must_use]
    pub fn origin(&self) -> &str {
        &self.origin
    }

    /// Mark the channel ready (or not). Shared by both ends.
    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::SeqCst);
    }

    /// Push a raw message into this end's inbox as if `origin` had sent it.
    ///
    /// Used to simulate unrelated traffic on the same channel.
    pub fn inject(&self, data: Value, origin: impl Into<String>) {
        let _ = self.inbox.send(Inbound {
            data,
            origin: origin.into(),
        });
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn transmit(
        &self,
        envelope: &Envelope,
        target_origin: &str,
    ) -> Result<(), TransportError> {
        if !self.is_ready() {
            return Err(TransportError::NotReady);
        }
        if target_origin != ANY_ORIGIN && target_origin != self.peer_origin {
            tracing::trace!(
                target_origin,
                peer_origin = %self.peer_origin,
                "Target origin mismatch, message not delivered"
            );
            return Ok(());
        }

        let text = protocol::encode(envelope).map_err(|e| match e {
            protocol::WireError::Json(e) => TransportError::Encode(e),
            protocol::WireError::NotAnObject => TransportError::Closed,
        })?;
        let data = protocol::decode(&text).map_err(|_| TransportError::Closed)?;

        // No live receiver means the peer is gone; like the browser, drop it.
        let _ = self.peer_inbox.send(Inbound {
            data,
            origin: self.origin.clone(),
        });
        Ok(())
    }

    fn subscribe(&self) -> BoxStream<'static, Inbound> {
        BroadcastStream::new(self.inbox.subscribe())
            .filter_map(|res| async move {
                match res {
                    Ok(inbound) => Some(inbound),
                    Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "Inbound channel lagged, messages dropped");
                        None
                    }
                }
            })
            .boxed()
    }

    fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }
}
