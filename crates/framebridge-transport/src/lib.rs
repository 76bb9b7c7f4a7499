//! Transport layer for host/guest messaging.
//!
//! Provides:
//! - Wire codec (flat JSON text)
//! - Paired in-memory channel (feature: memory)

pub mod protocol;

#[cfg(feature = "memory")]
pub mod memory;

#[cfg(feature = "memory")]
pub use memory::{MemoryTransport, pair, pair_unready};
pub use protocol::{WireError, decode, encode};
