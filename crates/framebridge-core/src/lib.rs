//! Core abstractions for host/guest messaging.
//!
//! This crate provides the fundamental building blocks:
//! - `Envelope` - The flat wire unit exchanged between the two sides
//! - `Context` / `ContextPatch` - Shared state document and its shallow merge
//! - `MessengerConfig` / `ContextConfig` - Explicit role and tuning knobs
//! - `Transport` - The seam to the raw cross-context channel

pub mod config;
pub mod context;
pub mod envelope;
pub mod traits;

pub use config::{ContextConfig, MessengerConfig};
pub use context::{AppState, Breadcrumb, Context, ContextPatch, NavigationState, PatchError};
pub use envelope::{Category, Envelope, ErrorPayload, MessageId, Role};
pub use traits::{Inbound, Transport, TransportError};

/// Milliseconds since the Unix epoch.
#[must_use]
pub fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}
