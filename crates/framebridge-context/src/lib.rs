//! Context synchronization and coordination on top of a messenger.
//!
//! Provides:
//! - `ContextStore` - Shared context, shallow merge, bounded history, sync
//! - `NavigationCoordinator` - Route transitions, back-navigation, breadcrumbs
//! - `ModalCoordinator` / `ModalClient` - Host/guest modal request and close

pub mod modal;
pub mod navigation;
pub mod store;

#[cfg(test)]
mod testing;

pub use modal::{ModalClient, ModalCoordinator, ModalError, ModalRequest};
pub use navigation::{NavigationCoordinator, NavigationEvent};
pub use store::{ContextError, ContextStore};
