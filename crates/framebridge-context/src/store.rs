//! Shared context store with bounded history.

use std::{
    collections::VecDeque,
    sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard},
    time::Duration,
};

use framebridge_core::{
    Category, Context, ContextConfig, ContextPatch, Envelope, PatchError, envelope::actions,
};
use framebridge_messenger::{Handler, HandlerError, Messenger, MessengerError, handler_fn};
use futures::{StreamExt, stream::BoxStream};
use serde_json::{Value, json};
use tokio::{sync::broadcast, task::JoinHandle};
use tokio_stream::wrappers::{BroadcastStream, errors::BroadcastStreamRecvError};

/// Context store error.
#[derive(Debug, thiserror::Error)]
pub enum ContextError {
    #[error(transparent)]
    InvalidPatch(#[from] PatchError),
    #[error("Messenger error: {0}")]
    Messenger(#[from] MessengerError),
    #[error("Invalid context payload: {0}")]
    InvalidPayload(#[from] serde_json::Error),
}

struct Inner {
    context: Context,
    history: VecDeque<Context>,
}

/// Keeps one side's copy of the shared context and propagates changes.
///
/// Every mutation snapshots the previous context into a bounded FIFO
/// history and is broadcast to local subscribers.
pub struct ContextStore {
    messenger: Arc<Messenger>,
    config: ContextConfig,
    inner: RwLock<Inner>,
    sender: broadcast::Sender<Context>,
}

impl ContextStore {
    /// Create a store with a fresh context and register its `state/*` handlers.
    #[must_use]
    pub fn new(messenger: Arc<Messenger>, config: ContextConfig) -> Arc<Self> {
        let initial = Context::new(config.initial_route.clone(), config.environment.clone());
        Self::with_context(messenger, config, initial)
    }

    /// Create a store starting from `context`.
    #[must_use]
    pub fn with_context(
        messenger: Arc<Messenger>,
        config: ContextConfig,
        context: Context,
    ) -> Arc<Self> {
        let (sender, _) = broadcast::channel(256);
        let store = Arc::new(Self {
            messenger,
            inner: RwLock::new(Inner {
                context,
                history: VecDeque::with_capacity(config.history_limit),
            }),
            config,
            sender,
        });
        store.register_handlers();
        store
    }

    fn register_handlers(self: &Arc<Self>) {
        let messenger = &self.messenger;

        messenger.on_action(
            Category::State,
            actions::state::UPDATE,
            self.state_handler(|store, envelope| {
                let patch = patch_from(envelope.data)?;
                store
                    .apply(&patch)
                    .map_err(|e| HandlerError::Failed(e.to_string()))?;
                Ok(json!({ "success": true }))
            }),
        );
        messenger.on_action(
            Category::State,
            actions::state::REQUEST,
            self.state_handler(|store, _| Ok(serde_json::to_value(store.context())?)),
        );
        messenger.on_action(
            Category::State,
            actions::state::SYNC,
            self.state_handler(|store, envelope| {
                let patch = patch_from(envelope.data)?;
                store
                    .apply(&patch)
                    .map_err(|e| HandlerError::Failed(e.to_string()))?;
                Ok(json!({ "success": true }))
            }),
        );
        messenger.on_action(
            Category::State,
            actions::state::RESET,
            self.state_handler(|store, _| {
                store.reset_local();
                Ok(json!({ "success": true }))
            }),
        );
    }

    /// Wrap a synchronous store operation as a handler that does not keep the store alive.
    fn state_handler<F>(self: &Arc<Self>, f: F) -> Arc<dyn Handler>
    where
        F: Fn(&Self, Envelope) -> Result<Value, HandlerError> + Send + Sync + 'static,
    {
        let store = Arc::downgrade(self);
        handler_fn(move |envelope| {
            let result = store.upgrade().map_or_else(
                || Err(HandlerError::Failed("context store dropped".to_string())),
                |store| f(&store, envelope),
            );
            async move { result }
        })
    }

    /// The messenger this store propagates through.
    #[must_use]
    pub fn messenger(&self) -> &Arc<Messenger> {
        &self.messenger
    }

    /// Snapshot of the current context.
    #[must_use]
    pub fn context(&self) -> Context {
        read(&self.inner).context.clone()
    }

    /// Prior snapshots, oldest first.
    #[must_use]
    pub fn history(&self) -> Vec<Context> {
        read(&self.inner).history.iter().cloned().collect()
    }

    /// Receiver for live context changes.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<Context> {
        self.sender.subscribe()
    }

    /// Stream that yields the current context first, then live changes.
    #[must_use]
    pub fn stream(&self) -> BoxStream<'static, Context> {
        let rx = self.sender.subscribe();
        let current = self.context();

        let live = BroadcastStream::new(rx).filter_map(|res| async move {
            match res {
                Ok(context) => Some(context),
                Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Context stream lagged, changes dropped");
                    None
                }
            }
        });
        futures::stream::once(async move { current })
            .chain(live)
            .boxed()
    }

    /// Merge `patch` into the context and, if `notify`, tell the peer.
    ///
    /// The peer notification is fire-and-forget: failing to send it is logged,
    /// the local update stands.
    ///
    /// # Errors
    /// Returns error if the patch would make the context invalid.
    pub async fn update_context(
        &self,
        patch: ContextPatch,
        notify: bool,
    ) -> Result<Context, ContextError> {
        let context = self.apply(&patch)?;
        if notify {
            self.notify_update(patch).await;
        }
        Ok(context)
    }

    /// Build a patch from the current context and merge it, without letting
    /// another update land in between.
    ///
    /// `build` runs under the store's write lock, so it must not block.
    ///
    /// # Errors
    /// Returns error if the patch would make the context invalid.
    pub async fn modify<F>(&self, build: F, notify: bool) -> Result<Context, ContextError>
    where
        F: FnOnce(&Context) -> ContextPatch,
    {
        let (context, patch) = {
            let inner = write(&self.inner);
            let patch = build(&inner.context);
            let next = inner.context.merged(&patch)?;
            (self.install(inner, next), patch)
        };
        if notify {
            self.notify_update(patch).await;
        }
        Ok(context)
    }

    async fn notify_update(&self, patch: ContextPatch) {
        if let Err(e) = self
            .messenger
            .send(Category::State, actions::state::UPDATE, patch.into_value())
            .await
        {
            tracing::warn!("Failed to notify peer of context update: {e}");
        }
    }

    /// Merge a pushed snapshot, or pull the peer's context when none is given.
    ///
    /// Failures are logged and the last known local context is kept.
    pub async fn sync_context(&self, remote: Option<ContextPatch>) -> Context {
        let synced = match remote {
            Some(patch) => self.apply(&patch).map_err(ContextError::from),
            None => self.pull().await,
        };
        synced.unwrap_or_else(|e| {
            tracing::warn!("Context sync failed, keeping local context: {e}");
            self.context()
        })
    }

    async fn pull(&self) -> Result<Context, ContextError> {
        let value = self
            .messenger
            .request(Category::State, actions::state::REQUEST, Value::Null)
            .await?;
        let remote: Context = serde_json::from_value(value)?;
        Ok(self.apply(&ContextPatch::full(&remote))?)
    }

    /// Push the whole local context to the peer as `state/sync`.
    ///
    /// # Errors
    /// Returns error if the message cannot be sent.
    pub async fn push_context(&self) -> Result<(), ContextError> {
        let patch = ContextPatch::full(&self.context());
        self.messenger
            .send(Category::State, actions::state::SYNC, patch.into_value())
            .await?;
        Ok(())
    }

    /// Re-apply history entry `index` (oldest is 0) as the current context.
    ///
    /// Returns false if there is no such entry.
    pub async fn restore_from_history(&self, index: usize) -> bool {
        let snapshot = read(&self.inner).history.get(index).cloned();
        let Some(snapshot) = snapshot else {
            return false;
        };
        match self.update_context(ContextPatch::full(&snapshot), true).await {
            Ok(_) => true,
            Err(e) => {
                tracing::warn!(index, "Failed to restore context from history: {e}");
                false
            }
        }
    }

    /// Replace the context with a fresh one and, if `notify`, tell the peer.
    ///
    /// # Errors
    /// Returns error if the peer cannot be notified.
    pub async fn reset(&self, notify: bool) -> Result<Context, ContextError> {
        let context = self.reset_local();
        if notify {
            self.messenger
                .send(Category::State, actions::state::RESET, Value::Null)
                .await?;
        }
        Ok(context)
    }

    /// Start pulling the peer's context on the configured interval.
    ///
    /// Returns `None` when no interval is configured. The first pull happens
    /// immediately; the task ends once the store is dropped.
    #[must_use]
    pub fn spawn_periodic_sync(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        let every = self.config.sync_interval()?;
        Some(self.spawn_sync_every(every))
    }

    fn spawn_sync_every(self: &Arc<Self>, every: Duration) -> JoinHandle<()> {
        let store = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            loop {
                ticker.tick().await;
                let Some(store) = store.upgrade() else {
                    break;
                };
                store.sync_context(None).await;
            }
        })
    }

    fn apply(&self, patch: &ContextPatch) -> Result<Context, PatchError> {
        let inner = write(&self.inner);
        let next = inner.context.merged(patch)?;
        Ok(self.install(inner, next))
    }

    fn reset_local(&self) -> Context {
        let inner = write(&self.inner);
        let mut fresh = Context::new(
            self.config.initial_route.clone(),
            self.config.environment.clone(),
        );
        fresh.updated_at = fresh.updated_at.max(inner.context.updated_at.saturating_add(1));
        self.install(inner, fresh)
    }

    /// Swap in `next`, remember the old context, then release the lock and broadcast.
    fn install(&self, mut inner: RwLockWriteGuard<'_, Inner>, next: Context) -> Context {
        let previous = std::mem::replace(&mut inner.context, next.clone());
        self.remember(&mut inner, previous);
        drop(inner);

        let _ = self.sender.send(next.clone()); // live listeners
        next
    }

    fn remember(&self, inner: &mut Inner, snapshot: Context) {
        let limit = self.config.history_limit;
        if limit == 0 {
            return;
        }
        while inner.history.len() >= limit {
            inner.history.pop_front();
        }
        inner.history.push_back(snapshot);
    }
}

fn patch_from(data: Value) -> Result<ContextPatch, HandlerError> {
    ContextPatch::from_value(data)
        .ok_or_else(|| HandlerError::Failed("context patch must be a JSON object".to_string()))
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}
