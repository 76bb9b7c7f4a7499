//! Request/response messaging between host and guest.
//!
//! Provides:
//! - `Messenger` - Envelope framing, reply correlation, timeouts, dispatch
//! - `Handler` trait and `handler_fn` adapter
//! - `HandlerRegistry` - Two-level (category, action) handler lookup

pub mod handler;
pub mod messenger;

pub use handler::{Handler, HandlerError, HandlerRegistry, handler_fn};
pub use messenger::{Messenger, MessengerError};
