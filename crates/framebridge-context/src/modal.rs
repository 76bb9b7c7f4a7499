//! Modal request/response coordination.
//!
//! The host opens a modal inside a guest with `ui/modal_open` and waits for
//! the guest to answer with `ui/modal_close`. Sessions are keyed by the id of
//! the opening envelope (`modalId`), so several modals may be open for the
//! same guest at once without clobbering each other.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock},
};

use framebridge_core::{Category, Envelope, MessageId, envelope::actions};
use framebridge_messenger::{HandlerError, Messenger, MessengerError, handler_fn};
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::sync::{broadcast, oneshot};

/// Modal error.
#[derive(Debug, thiserror::Error)]
pub enum ModalError {
    #[error("Unknown guest: {0}")]
    UnknownGuest(String),
    #[error("Modal dismissed without a result")]
    Dismissed,
    #[error("Messenger error: {0}")]
    Messenger(#[from] MessengerError),
}

/// Body of a `ui/modal_open` envelope.
#[derive(Debug, Clone, PartialEq, Deserialize)]
struct ModalOpen {
    route: String,
    #[serde(default)]
    data: Value,
}

/// Body of a `ui/modal_close` envelope.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ModalClose {
    #[serde(default)]
    modal_id: Option<MessageId>,
    #[serde(default)]
    result: Value,
}

struct ModalSession {
    guest_id: String,
    modal_id: MessageId,
    resolver: oneshot::Sender<Value>,
}

/// Drops a session whose opener stopped waiting, or failed to send.
///
/// A settled session is already gone from the stack, so this is a no-op then.
struct SessionGuard<'a> {
    stack: &'a Mutex<Vec<ModalSession>>,
    modal_id: &'a str,
}

impl Drop for SessionGuard<'_> {
    fn drop(&mut self) {
        lock(self.stack).retain(|session| session.modal_id != self.modal_id);
    }
}

/// Host-side coordinator for modals opened across several guests.
#[derive(Default)]
pub struct ModalCoordinator {
    guests: RwLock<HashMap<String, Arc<Messenger>>>,
    /// Open sessions, oldest first.
    stack: Mutex<Vec<ModalSession>>,
}

impl ModalCoordinator {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Track a guest and listen for its `ui/modal_close` notifications.
    pub fn register_guest(
        self: &Arc<Self>,
        guest_id: impl Into<String>,
        messenger: Arc<Messenger>,
    ) {
        let guest_id = guest_id.into();
        let coordinator = Arc::downgrade(self);
        let closing_guest = guest_id.clone();

        messenger.on_action(
            Category::Ui,
            actions::ui::MODAL_CLOSE,
            handler_fn(move |envelope: Envelope| {
                let result = serde_json::from_value::<ModalClose>(envelope.data)
                    .map_err(HandlerError::from)
                    .map(|close| {
                        let closed = coordinator.upgrade().is_some_and(|coordinator| {
                            coordinator.close(
                                &closing_guest,
                                close.modal_id.as_deref(),
                                close.result,
                            )
                        });
                        json!({ "closed": closed })
                    });
                async move { result }
            }),
        );

        let replaced = write(&self.guests).insert(guest_id, Arc::clone(&messenger));
        if let Some(previous) = replaced.filter(|previous| !Arc::ptr_eq(previous, &messenger)) {
            previous.off(Category::Ui, Some(actions::ui::MODAL_CLOSE));
        }
    }

    /// Forget a guest. Its open modals are dismissed.
    pub fn unregister_guest(&self, guest_id: &str) -> bool {
        let Some(messenger) = write(&self.guests).remove(guest_id) else {
            return false;
        };
        messenger.off(Category::Ui, Some(actions::ui::MODAL_CLOSE));
        // Dropping the resolvers fails the waiting callers with `Dismissed`.
        lock(&self.stack).retain(|session| session.guest_id != guest_id);
        true
    }

    /// Open a modal in `guest_id` and wait until the guest closes it.
    ///
    /// # Errors
    /// Returns error if the guest is unknown, the open cannot be sent, or the
    /// session is dismissed before a result arrives.
    pub async fn open(
        &self,
        guest_id: &str,
        route: impl Into<String>,
        data: Value,
    ) -> Result<Value, ModalError> {
        let messenger = read(&self.guests)
            .get(guest_id)
            .cloned()
            .ok_or_else(|| ModalError::UnknownGuest(guest_id.to_string()))?;

        let envelope = messenger.prepare(
            Category::Ui,
            actions::ui::MODAL_OPEN,
            json!({ "route": route.into(), "data": data }),
            false,
        );

        // Registered before sending so an immediate close finds the session.
        let (resolver, resolved) = oneshot::channel();
        lock(&self.stack).push(ModalSession {
            guest_id: guest_id.to_string(),
            modal_id: envelope.id.clone(),
            resolver,
        });
        let _session = SessionGuard {
            stack: &self.stack,
            modal_id: &envelope.id,
        };

        messenger.transmit(&envelope).await?;
        tracing::debug!(guest_id, modal_id = %envelope.id, "Modal opened");

        resolved.await.map_err(|_| ModalError::Dismissed)
    }

    /// Settle a modal of `guest_id` with `result`.
    ///
    /// Without a `modal_id` the guest's most recently opened modal is closed.
    /// Returns false if no matching session is open.
    pub fn close(&self, guest_id: &str, modal_id: Option<&str>, result: Value) -> bool {
        let session = {
            let mut stack = lock(&self.stack);
            let position = match modal_id {
                Some(id) => stack
                    .iter()
                    .position(|s| s.guest_id == guest_id && s.modal_id == id),
                None => stack.iter().rposition(|s| s.guest_id == guest_id),
            };
            position.map(|p| stack.remove(p))
        };

        let Some(session) = session else {
            tracing::debug!(guest_id, ?modal_id, "No open modal to close");
            return false;
        };
        tracing::debug!(guest_id, modal_id = %session.modal_id, "Modal closed");
        // The opener may have stopped waiting.
        let _ = session.resolver.send(result);
        true
    }

    /// Guest ids of open modals, oldest first.
    #[must_use]
    pub fn open_stack(&self) -> Vec<String> {
        lock(&self.stack)
            .iter()
            .map(|s| s.guest_id.clone())
            .collect()
    }

    /// Whether `guest_id` has at least one modal open.
    #[must_use]
    pub fn is_open(&self, guest_id: &str) -> bool {
        lock(&self.stack).iter().any(|s| s.guest_id == guest_id)
    }
}

/// A modal the host asked this guest to show.
#[derive(Debug, Clone, PartialEq)]
pub struct ModalRequest {
    pub modal_id: MessageId,
    pub route: String,
    pub data: Value,
}

/// Guest-side counterpart of [`ModalCoordinator`].
pub struct ModalClient {
    messenger: Arc<Messenger>,
    open: Arc<Mutex<Vec<ModalRequest>>>,
    requests: broadcast::Sender<ModalRequest>,
}

impl ModalClient {
    /// Create a client and register its `ui/modal_open` handler.
    #[must_use]
    pub fn new(messenger: Arc<Messenger>) -> Arc<Self> {
        let (requests, _) = broadcast::channel(32);
        let open = Arc::new(Mutex::new(Vec::new()));

        let tracked = Arc::clone(&open);
        let announce = requests.clone();
        messenger.on_action(
            Category::Ui,
            actions::ui::MODAL_OPEN,
            handler_fn(move |envelope: Envelope| {
                let modal_id = envelope.id;
                let result = serde_json::from_value::<ModalOpen>(envelope.data)
                    .map_err(HandlerError::from)
                    .map(|body| {
                        let request = ModalRequest {
                            modal_id,
                            route: body.route,
                            data: body.data,
                        };
                        lock(&tracked).push(request.clone());
                        let _ = announce.send(request);
                        json!({ "success": true })
                    });
                async move { result }
            }),
        );

        Arc::new(Self {
            messenger,
            open,
            requests,
        })
    }

    /// Receiver for modals the host opens.
    #[must_use]
    pub fn requests(&self) -> broadcast::Receiver<ModalRequest> {
        self.requests.subscribe()
    }

    /// Modals currently shown, oldest first.
    #[must_use]
    pub fn open_modals(&self) -> Vec<ModalRequest> {
        lock(&self.open).clone()
    }

    /// Close the most recently opened modal with `result`.
    ///
    /// # Errors
    /// Returns error if the close notification cannot be sent.
    pub async fn close(&self, result: Value) -> Result<MessageId, MessengerError> {
        let modal_id = lock(&self.open).pop().map(|m| m.modal_id);
        self.send_close(modal_id, result).await
    }

    /// Close a specific modal with `result`.
    ///
    /// # Errors
    /// Returns error if the close notification cannot be sent.
    pub async fn close_modal(
        &self,
        modal_id: &str,
        result: Value,
    ) -> Result<MessageId, MessengerError> {
        lock(&self.open).retain(|m| m.modal_id != modal_id);
        self.send_close(Some(modal_id.to_string()), result).await
    }

    async fn send_close(
        &self,
        modal_id: Option<MessageId>,
        result: Value,
    ) -> Result<MessageId, MessengerError> {
        self.messenger
            .send(
                Category::Ui,
                actions::ui::MODAL_CLOSE,
                json!({ "modalId": modal_id, "result": result }),
            )
            .await
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn read<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}
