//! Inbound message handlers.

use std::{collections::HashMap, future::Future, sync::Arc};

use async_trait::async_trait;
use framebridge_core::{Category, Envelope};
use serde_json::Value;
use thiserror::Error;

/// Handler error. Turned into an error reply when the sender awaits one.
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("Invalid payload: {0}")]
    InvalidPayload(#[from] serde_json::Error),
    #[error("{0}")]
    Failed(String),
}

/// Trait for handling inbound requests and notifications.
///
/// The returned value is sent back as the reply when the inbound envelope
/// requires a response, and discarded otherwise.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, envelope: Envelope) -> Result<Value, HandlerError>;
}

/// Adapter turning an async closure into a [`Handler`].
pub struct FnHandler<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> Handler for FnHandler<F>
where
    F: Fn(Envelope) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, HandlerError>> + Send + 'static,
{
    async fn handle(&self, envelope: Envelope) -> Result<Value, HandlerError> {
        (self.f)(envelope).await
    }
}

/// Wrap an async closure as a shareable handler.
#[must_use]
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn Handler>
where
    F: Fn(Envelope) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, HandlerError>> + Send + 'static,
{
    Arc::new(FnHandler { f })
}

/// Handler lookup by `(category, action)`, falling back to `category`.
///
/// At most one handler per key; registering again replaces.
#[derive(Default)]
pub struct HandlerRegistry {
    actions: HashMap<(Category, String), Arc<dyn Handler>>,
    categories: HashMap<Category, Arc<dyn Handler>>,
}

impl HandlerRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a whole-category handler. Returns the one it replaced.
    pub fn on(
        &mut self,
        category: Category,
        handler: Arc<dyn Handler>,
    ) -> Option<Arc<dyn Handler>> {
        self.categories.insert(category, handler)
    }

    /// Register an action-scoped handler. Returns the one it replaced.
    pub fn on_action(
        &mut self,
        category: Category,
        action: impl Into<String>,
        handler: Arc<dyn Handler>,
    ) -> Option<Arc<dyn Handler>> {
        self.actions.insert((category, action.into()), handler)
    }

    /// Remove the handler registered under exactly this key.
    ///
    /// Without an action only the whole-category handler goes; action-scoped
    /// handlers of the same category stay.
    pub fn off(&mut self, category: Category, action: Option<&str>) -> bool {
        match action {
            Some(action) => self
                .actions
                .remove(&(category, action.to_string()))
                .is_some(),
            None => self.categories.remove(&category).is_some(),
        }
    }

    /// Find the handler for an envelope. Exact matches win.
    #[must_use]
    pub fn resolve(&self, category: Category, action: &str) -> Option<Arc<dyn Handler>> {
        self.actions
            .get(&(category, action.to_string()))
            .or_else(|| self.categories.get(&category))
            .cloned()
    }

    /// Number of registered handlers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.actions.len() + self.categories.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove every handler.
    pub fn clear(&mut self) {
        self.actions.clear();
        self.categories.clear();
    }
}
