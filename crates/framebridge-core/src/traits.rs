//! Transport seam.

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde_json::Value;
use thiserror::Error;

use crate::Envelope;

/// A raw inbound message and the origin the channel observed it from.
///
/// `data` is unvalidated: it may be noise from unrelated channel traffic.
#[derive(Debug, Clone, PartialEq)]
pub struct Inbound {
    pub data: Value,
    pub origin: String,
}

/// Transport error.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Transport not ready")]
    NotReady,
    #[error("Transport closed")]
    Closed,
    #[error("Encoding error: {0}")]
    Encode(#[from] serde_json::Error),
}

/// The raw cross-context channel a messenger is bound to.
///
/// Implement this trait to plug in a concrete channel.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Deliver an envelope to the peer, restricted to `target_origin`.
    async fn transmit(&self, envelope: &Envelope, target_origin: &str)
    -> Result<(), TransportError>;

    /// Stream of inbound messages. Dropping the stream unsubscribes.
    fn subscribe(&self) -> BoxStream<'static, Inbound>;

    /// Whether the peer has signalled readiness and can receive.
    fn is_ready(&self) -> bool {
        true
    }
}
