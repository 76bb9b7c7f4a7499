//! Request/response messenger bound to one channel.

use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use framebridge_core::{
    Category, Envelope, ErrorPayload, Inbound, MessageId, MessengerConfig, Role, Transport,
    TransportError,
    config::ANY_ORIGIN,
    envelope::actions,
};
use futures::{
    FutureExt, StreamExt,
    future::{self, BoxFuture},
    stream::BoxStream,
};
use serde_json::Value;
use tokio::{sync::oneshot, task::JoinHandle};

use crate::handler::{Handler, HandlerError, HandlerRegistry};

/// Messenger error.
#[derive(Debug, thiserror::Error)]
pub enum MessengerError {
    #[error("Request timed out after {}ms", .after.as_millis())]
    Timeout { after: Duration },
    #[error("Messenger destroyed")]
    Destroyed,
    #[error("Transport not ready")]
    NotReady,
    #[error("Transport error: {0}")]
    Transport(TransportError),
    #[error("Remote error ({code}): {message}")]
    Remote { code: String, message: String },
}

impl From<TransportError> for MessengerError {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::NotReady => Self::NotReady,
            other => Self::Transport(other),
        }
    }
}

/// Terminal state of a request.
///
/// A request sits in the pending table while awaiting its reply and leaves
/// it exactly once, through whichever of these happens first.
#[derive(Debug)]
enum Settlement {
    Replied(Value),
    TimedOut(Duration),
    Destroyed,
}

impl Settlement {
    fn into_result(self) -> Result<Value, MessengerError> {
        match self {
            Self::Replied(data) => match ErrorPayload::from_value(&data) {
                Some(payload) => Err(MessengerError::Remote {
                    code: payload.error.code,
                    message: payload.error.message,
                }),
                None => Ok(data),
            },
            Self::TimedOut(after) => Err(MessengerError::Timeout { after }),
            Self::Destroyed => Err(MessengerError::Destroyed),
        }
    }
}

struct PendingRequest {
    reply_tx: oneshot::Sender<Settlement>,
    timer: JoinHandle<()>,
}

struct Inner {
    config: MessengerConfig,
    transport: Arc<dyn Transport>,
    pending: Mutex<HashMap<MessageId, PendingRequest>>,
    registry: RwLock<HandlerRegistry>,
    destroyed: AtomicBool,
}

/// Owns one channel: frames envelopes, correlates replies, dispatches requests.
///
/// Inbound traffic is read by a background task started in [`Messenger::spawn`].
pub struct Messenger {
    inner: Arc<Inner>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl Messenger {
    /// Bind a messenger to `transport` and start reading inbound traffic.
    ///
    /// Must be called from within a Tokio runtime.
    #[must_use]
    pub fn spawn<T>(config: MessengerConfig, transport: T) -> Arc<Self>
    where
        T: Transport + 'static,
    {
        Self::spawn_shared(config, Arc::new(transport))
    }

    /// Like [`Messenger::spawn`], for a transport that is already shared.
    #[must_use]
    pub fn spawn_shared(config: MessengerConfig, transport: Arc<dyn Transport>) -> Arc<Self> {
        let inbound = transport.subscribe();
        let inner = Arc::new(Inner {
            config,
            transport,
            pending: Mutex::new(HashMap::new()),
            registry: RwLock::new(HandlerRegistry::new()),
            destroyed: AtomicBool::new(false),
        });

        let reader_inner = Arc::clone(&inner);
        let reader = tokio::spawn(async move {
            reader_inner.read_loop(inbound).await;
        });

        Arc::new(Self {
            inner,
            reader: Mutex::new(Some(reader)),
        })
    }

    #[must_use]
    pub fn config(&self) -> &MessengerConfig {
        &self.inner.config
    }

    #[must_use]
    pub fn role(&self) -> Role {
        self.inner.config.role
    }

    /// Build an envelope stamped by this side without sending it.
    #[must_use]
    pub fn prepare(
        &self,
        category: Category,
        action: impl Into<String>,
        data: Value,
        requires_response: bool,
    ) -> Envelope {
        self.inner.prepare(category, action, data, requires_response)
    }

    /// Send a previously prepared envelope.
    ///
    /// # Errors
    /// Returns error if the messenger is destroyed or the transport fails.
    pub async fn transmit(&self, envelope: &Envelope) -> Result<(), MessengerError> {
        self.inner.transmit(envelope).await
    }

    /// Fire-and-forget send. Returns the envelope id.
    ///
    /// # Errors
    /// Returns error if the messenger is destroyed or the transport fails.
    pub async fn send(
        &self,
        category: Category,
        action: impl Into<String>,
        data: Value,
    ) -> Result<MessageId, MessengerError> {
        let envelope = self.prepare(category, action, data, false);
        self.transmit(&envelope).await?;
        Ok(envelope.id)
    }

    /// Send a request and wait for the correlated reply, using the configured timeout.
    ///
    /// # Errors
    /// Returns error on timeout, teardown, transport failure, or an error reply.
    pub async fn request(
        &self,
        category: Category,
        action: impl Into<String>,
        data: Value,
    ) -> Result<Value, MessengerError> {
        let timeout = self.inner.config.timeout();
        self.request_with_timeout(category, action, data, timeout)
            .await
    }

    /// Send a request and wait up to `timeout` for the correlated reply.
    ///
    /// Timed-out attempts are re-sent as new envelopes while
    /// `retry_attempts` allows.
    ///
    /// # Errors
    /// Returns error on timeout, teardown, transport failure, or an error reply.
    pub async fn request_with_timeout(
        &self,
        category: Category,
        action: impl Into<String>,
        data: Value,
        timeout: Duration,
    ) -> Result<Value, MessengerError> {
        let action = action.into();
        let mut attempt = 0;
        loop {
            match self
                .inner
                .request_once(category, &action, data.clone(), timeout)
                .await
            {
                Err(MessengerError::Timeout { .. })
                    if attempt < self.inner.config.retry_attempts =>
                {
                    attempt += 1;
                    tracing::debug!(%category, action = %action, attempt, "Request timed out, retrying");
                }
                other => return other,
            }
        }
    }

    /// Reply to an inbound request.
    ///
    /// A reply whose request already timed out on the other side is simply
    /// dropped there.
    ///
    /// # Errors
    /// Returns error if the messenger is destroyed or the transport fails.
    pub async fn respond(
        &self,
        original: &Envelope,
        data: Value,
    ) -> Result<MessageId, MessengerError> {
        self.inner.respond(original, data).await
    }

    /// `data/request` passthrough for UI bindings.
    ///
    /// # Errors
    /// See [`Messenger::request`].
    pub async fn request_data(&self, data: Value) -> Result<Value, MessengerError> {
        self.request(Category::Data, actions::data::REQUEST, data)
            .await
    }

    /// `data/update` passthrough for UI bindings.
    ///
    /// # Errors
    /// See [`Messenger::send`].
    pub async fn send_data(&self, data: Value) -> Result<MessageId, MessengerError> {
        self.send(Category::Data, actions::data::UPDATE, data).await
    }

    /// Register a whole-category handler, replacing any existing one.
    pub fn on(&self, category: Category, handler: Arc<dyn Handler>) {
        write(&self.inner.registry).on(category, handler);
    }

    /// Register a `(category, action)` handler, replacing any existing one.
    pub fn on_action(
        &self,
        category: Category,
        action: impl Into<String>,
        handler: Arc<dyn Handler>,
    ) {
        write(&self.inner.registry).on_action(category, action, handler);
    }

    /// Remove the handler registered under exactly this key.
    pub fn off(&self, category: Category, action: Option<&str>) -> bool {
        write(&self.inner.registry).off(category, action)
    }

    /// Number of requests still awaiting a reply.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        lock(&self.inner.pending).len()
    }

    #[must_use]
    pub fn is_destroyed(&self) -> bool {
        self.inner.destroyed.load(Ordering::SeqCst)
    }

    /// Detach from the transport and fail every pending request.
    ///
    /// Pending callers receive [`MessengerError::Destroyed`]. Idempotent.
    pub fn destroy(&self) {
        if let Some(reader) = lock(&self.reader).take() {
            reader.abort();
        }
        self.inner.teardown();
    }
}

impl Drop for Messenger {
    fn drop(&mut self) {
        self.destroy();
    }
}

impl Inner {
    fn prepare(
        &self,
        category: Category,
        action: impl Into<String>,
        data: Value,
        requires_response: bool,
    ) -> Envelope {
        Envelope::new(
            self.config.role,
            self.config.origin.clone(),
            category,
            action,
            data,
            requires_response,
        )
    }

    async fn transmit(&self, envelope: &Envelope) -> Result<(), MessengerError> {
        if self.destroyed.load(Ordering::SeqCst) {
            return Err(MessengerError::Destroyed);
        }
        if !self.transport.is_ready() {
            return Err(MessengerError::NotReady);
        }
        self.transport
            .transmit(envelope, &self.config.target_origin)
            .await?;
        tracing::trace!(
            id = %envelope.id,
            category = %envelope.category,
            action = %envelope.action,
            "Sent envelope"
        );
        Ok(())
    }

    async fn request_once(
        self: &Arc<Self>,
        category: Category,
        action: &str,
        data: Value,
        timeout: Duration,
    ) -> Result<Value, MessengerError> {
        let envelope = self.prepare(category, action, data, true);
        let id = envelope.id.clone();
        let (reply_tx, reply_rx) = oneshot::channel();

        // The timer cannot observe the table before the entry is in it.
        {
            let mut pending = lock(&self.pending);
            let timer_inner = Arc::clone(self);
            let timer_id = id.clone();
            let timer = tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                if timer_inner.settle(&timer_id, Settlement::TimedOut(timeout)) {
                    tracing::debug!(id = %timer_id, ?timeout, "Request timed out");
                }
            });
            pending.insert(id.clone(), PendingRequest { reply_tx, timer });
        }

        if let Err(e) = self.transmit(&envelope).await {
            if let Some(pending) = lock(&self.pending).remove(&id) {
                pending.timer.abort();
            }
            return Err(e);
        }

        reply_rx
            .await
            .map_or(Err(MessengerError::Destroyed), Settlement::into_result)
    }

    /// Remove a pending request and hand it its outcome. False if already gone.
    fn settle(&self, id: &str, outcome: Settlement) -> bool {
        let Some(pending) = lock(&self.pending).remove(id) else {
            return false;
        };
        if !matches!(outcome, Settlement::TimedOut(_)) {
            pending.timer.abort();
        }
        // The caller may have stopped waiting.
        let _ = pending.reply_tx.send(outcome);
        true
    }

    async fn respond(&self, original: &Envelope, data: Value) -> Result<MessageId, MessengerError> {
        let reply = Envelope::reply(
            self.config.role,
            self.config.origin.clone(),
            original,
            data,
        );
        self.transmit(&reply).await?;
        Ok(reply.id)
    }

    fn teardown(&self) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        let drained: Vec<_> = lock(&self.pending).drain().collect();
        if !drained.is_empty() {
            tracing::debug!(count = drained.len(), "Failing pending requests on destroy");
        }
        for (_, pending) in drained {
            pending.timer.abort();
            let _ = pending.reply_tx.send(Settlement::Destroyed);
        }
        write(&self.registry).clear();
    }

    async fn read_loop(self: Arc<Self>, mut inbound: BoxStream<'static, Inbound>) {
        while let Some(message) = inbound.next().await {
            if self.destroyed.load(Ordering::SeqCst) {
                break;
            }
            self.dispatch(message).await;
        }
        tracing::debug!(role = %self.config.role, "Inbound stream closed");
    }

    async fn dispatch(self: &Arc<Self>, message: Inbound) {
        let Inbound { data, origin } = message;

        if !self.config.accepts_origin(&origin) {
            self.log_drop(&origin, "unauthorized origin");
            return;
        }
        let Ok(mut envelope) = serde_json::from_value::<Envelope>(data) else {
            self.log_drop(&origin, "malformed envelope");
            return;
        };
        if envelope.expected_origin != ANY_ORIGIN && envelope.expected_origin != origin {
            self.log_drop(&origin, "origin assertion mismatch");
            return;
        }
        if envelope.sender == self.config.role {
            self.log_drop(&origin, "own echo");
            return;
        }

        if let Some(original) = envelope.response_to.take() {
            let data = std::mem::take(&mut envelope.data);
            if !self.settle(&original, Settlement::Replied(data)) {
                self.log_drop(&origin, "unroutable reply");
            }
            return;
        }

        self.handle_request(envelope).await;
    }

    async fn handle_request(self: &Arc<Self>, envelope: Envelope) {
        let handler = read(&self.registry).resolve(envelope.category, &envelope.action);

        let Some(handler) = handler else {
            if envelope.requires_response {
                let payload = ErrorPayload::no_handler(envelope.category, &envelope.action);
                self.finish(&envelope, Ok(payload.to_value())).await;
            } else {
                tracing::debug!(
                    category = %envelope.category,
                    action = %envelope.action,
                    "No handler for notification"
                );
            }
            return;
        };

        // Poll once inline. A handler that suspends finishes on its own task,
        // since it may be waiting on replies that this read loop delivers.
        let request = envelope.clone();
        let mut run: BoxFuture<'static, Result<Value, HandlerError>> =
            async move { handler.handle(request).await }.boxed();

        let ready = future::poll_immediate(&mut run).await;
        match ready {
            Some(result) => self.finish(&envelope, result).await,
            None => {
                let inner = Arc::clone(self);
                tokio::spawn(async move {
                    let result = run.await;
                    inner.finish(&envelope, result).await;
                });
            }
        }
    }

    async fn finish(&self, envelope: &Envelope, result: Result<Value, HandlerError>) {
        let payload = match result {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!(
                    category = %envelope.category,
                    action = %envelope.action,
                    "Handler failed: {e}"
                );
                ErrorPayload::handler_failed(e.to_string()).to_value()
            }
        };
        if !envelope.requires_response {
            return;
        }
        match self.respond(envelope, payload).await {
            Ok(_) => {}
            Err(MessengerError::Destroyed) => {
                tracing::debug!(id = %envelope.id, "Dropped reply, messenger destroyed");
            }
            Err(e) => tracing::error!(id = %envelope.id, "Failed to send reply: {e}"),
        }
    }

    fn log_drop(&self, origin: &str, reason: &str) {
        if self.config.debug {
            tracing::debug!(role = %self.config.role, origin, reason, "Dropped inbound message");
        } else {
            tracing::trace!(role = %self.config.role, origin, reason, "Dropped inbound message");
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use framebridge_transport::{MemoryTransport, pair, pair_unready};
    use serde_json::json;
    use tokio::sync::mpsc;

    use super::*;
    use crate::handler::handler_fn;

    const HOST: &str = "https://host.test";
    const GUEST: &str = "https://guest.test";

    struct Fixture {
        host: Arc<Messenger>,
        guest: Arc<Messenger>,
        guest_transport: MemoryTransport,
    }

    fn connect(host_config: MessengerConfig, guest_config: MessengerConfig) -> Fixture {
        let (host_transport, guest_transport) = pair(HOST, GUEST);
        Fixture {
            host: Messenger::spawn(host_config, host_transport),
            guest: Messenger::spawn(guest_config, guest_transport.clone()),
            guest_transport,
        }
    }

    fn connected() -> Fixture {
        connect(
            MessengerConfig::host(HOST, GUEST),
            MessengerConfig::guest(GUEST, HOST),
        )
    }

    /// Handler forwarding each envelope's data to a channel.
    fn recorder() -> (Arc<dyn Handler>, mpsc::UnboundedReceiver<Value>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handler = handler_fn(move |envelope: Envelope| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(envelope.data);
                Ok(Value::Null)
            }
        });
        (handler, rx)
    }

    #[tokio::test]
    async fn test_reply_resolves_request() {
        let fx = connected();
        fx.host.on_action(
            Category::Data,
            "request",
            handler_fn(|envelope: Envelope| async move {
                assert_eq!(envelope.data["type"], "user-info");
                Ok(json!({"id": "123"}))
            }),
        );

        let reply = fx
            .guest
            .request_data(json!({"type": "user-info"}))
            .await
            .unwrap();

        assert_eq!(reply, json!({"id": "123"}));
        assert_eq!(fx.guest.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unanswered_request_times_out() {
        let (host_transport, _guest_transport) = pair(HOST, GUEST);
        let host = Messenger::spawn(MessengerConfig::host(HOST, GUEST), host_transport);

        let err = host
            .request_with_timeout(
                Category::State,
                "request",
                Value::Null,
                Duration::from_millis(100),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, MessengerError::Timeout { after } if after == Duration::from_millis(100)));
        assert_eq!(host.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_reply_is_dropped() {
        let fx = connected();
        fx.host.on_action(
            Category::Data,
            "request",
            handler_fn(|_| async {
                tokio::time::sleep(Duration::from_millis(500)).await;
                Ok(json!("late"))
            }),
        );

        let err = fx
            .guest
            .request_with_timeout(Category::Data, "request", Value::Null, Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, MessengerError::Timeout { .. }));

        // Let the late reply arrive; it must find nothing to settle.
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(fx.guest.pending_count(), 0);
        assert!(!fx.guest.is_destroyed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_destroy_fails_pending_requests() {
        let (host_transport, _guest_transport) = pair(HOST, GUEST);
        let host = Messenger::spawn(MessengerConfig::host(HOST, GUEST), host_transport);

        let waiting = Arc::clone(&host);
        let call = tokio::spawn(async move {
            waiting
                .request(Category::State, "request", Value::Null)
                .await
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(host.pending_count(), 1);

        host.destroy();

        let err = call.await.unwrap().unwrap_err();
        assert!(matches!(err, MessengerError::Destroyed));
        assert_eq!(host.pending_count(), 0);

        let err = host.send(Category::Ui, "focus", Value::Null).await.unwrap_err();
        assert!(matches!(err, MessengerError::Destroyed));
    }

    #[tokio::test]
    async fn test_foreign_origin_never_reaches_handler() {
        let fx = connected();
        let (handler, mut seen) = recorder();
        fx.guest.on(Category::Ui, handler);

        let forged = Envelope::new(Role::Host, "https://evil.test", Category::Ui, "focus", json!("evil"), false);
        fx.guest_transport
            .inject(serde_json::to_value(&forged).unwrap(), "https://evil.test");

        // Claims the host origin but arrives from elsewhere.
        let spoofed = Envelope::new(Role::Host, HOST, Category::Ui, "focus", json!("spoofed"), false);
        fx.guest_transport
            .inject(serde_json::to_value(&spoofed).unwrap(), "https://evil.test");

        // Arrives from the host origin but asserts another one.
        let mismatched = Envelope::new(Role::Host, "https://evil.test", Category::Ui, "focus", json!("mismatched"), false);
        fx.guest_transport
            .inject(serde_json::to_value(&mismatched).unwrap(), HOST);

        fx.host.send(Category::Ui, "focus", json!("legit")).await.unwrap();

        assert_eq!(seen.recv().await, Some(json!("legit")));
    }

    #[tokio::test]
    async fn test_malformed_envelopes_are_dropped() {
        let fx = connected();
        let (handler, mut seen) = recorder();
        fx.guest.on(Category::Ui, handler);

        fx.guest_transport.inject(json!({"garbage": true}), HOST);
        fx.guest_transport.inject(
            json!({"id": 7, "category": "ui", "action": "focus", "sentAt": 1, "sender": "host", "expectedOrigin": HOST}),
            HOST,
        );
        fx.host.send(Category::Ui, "blur", json!("legit")).await.unwrap();

        assert_eq!(seen.recv().await, Some(json!("legit")));
    }

    #[tokio::test]
    async fn test_exact_handler_wins() {
        let fx = connected();
        fx.host.on(Category::Ui, handler_fn(|_| async { Ok(json!("category")) }));
        fx.host.on_action(Category::Ui, "resize", handler_fn(|_| async { Ok(json!("exact")) }));

        let exact = fx.guest.request(Category::Ui, "resize", Value::Null).await.unwrap();
        let fallback = fx.guest.request(Category::Ui, "focus", Value::Null).await.unwrap();

        assert_eq!(exact, json!("exact"));
        assert_eq!(fallback, json!("category"));
    }

    #[tokio::test]
    async fn test_missing_handler_replies_with_error() {
        let fx = connected();

        let err = fx
            .guest
            .request(Category::Auth, "login", Value::Null)
            .await
            .unwrap_err();

        match err {
            MessengerError::Remote { code, message } => {
                assert_eq!(code, ErrorPayload::NO_HANDLER);
                assert!(message.contains("auth/login"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_failing_handler_replies_with_error() {
        let fx = connected();
        fx.host.on_action(
            Category::Data,
            "request",
            handler_fn(|_| async { Err(HandlerError::Failed("backend down".into())) }),
        );

        let err = fx.guest.request_data(Value::Null).await.unwrap_err();
        assert!(matches!(err, MessengerError::Remote { code, .. } if code == ErrorPayload::HANDLER_FAILED));
    }

    #[tokio::test]
    async fn test_off_removes_category_handler_only() {
        let fx = connected();
        fx.host.on(Category::Data, handler_fn(|_| async { Ok(json!("category")) }));
        fx.host.on_action(Category::Data, "request", handler_fn(|_| async { Ok(json!("exact")) }));

        assert!(fx.host.off(Category::Data, None));

        let exact = fx.guest.request_data(Value::Null).await.unwrap();
        assert_eq!(exact, json!("exact"));
        let err = fx.guest.request(Category::Data, "other", Value::Null).await.unwrap_err();
        assert!(matches!(err, MessengerError::Remote { .. }));
    }

    #[tokio::test]
    async fn test_send_before_ready_fails_fast() {
        let (host_transport, guest_transport) = pair_unready(HOST, GUEST);
        let host = Messenger::spawn(MessengerConfig::host(HOST, GUEST), host_transport);

        let err = host.send(Category::Ui, "focus", Value::Null).await.unwrap_err();
        assert!(matches!(err, MessengerError::NotReady));
        let err = host.request(Category::Ui, "focus", Value::Null).await.unwrap_err();
        assert!(matches!(err, MessengerError::NotReady));
        assert_eq!(host.pending_count(), 0);

        guest_transport.set_ready(true);
        host.send(Category::Ui, "focus", Value::Null).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_timed_out_request_is_retried_when_configured() {
        let fx = connect(
            MessengerConfig::host(HOST, GUEST),
            MessengerConfig::guest(GUEST, HOST)
                .with_timeout(Duration::from_millis(100))
                .with_retry_attempts(1),
        );
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        fx.host.on_action(
            Category::Data,
            "request",
            handler_fn(move |_| {
                let call = counter.fetch_add(1, Ordering::SeqCst);
                async move {
                    if call == 0 {
                        tokio::time::sleep(Duration::from_secs(10)).await;
                    }
                    Ok(json!({"call": call}))
                }
            }),
        );

        let reply = fx.guest.request_data(Value::Null).await.unwrap();

        assert_eq!(reply, json!({"call": 1}));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_handler_can_await_peer_while_suspended() {
        let fx = connected();
        fx.guest.on_action(
            Category::Ui,
            "focus",
            handler_fn(|_| async { Ok(json!({"focused": true})) }),
        );
        let host = Arc::downgrade(&fx.host);
        fx.host.on_action(
            Category::Data,
            "request",
            handler_fn(move |_| {
                let host = host.clone();
                async move {
                    let host = host
                        .upgrade()
                        .ok_or_else(|| HandlerError::Failed("host gone".into()))?;
                    host.request(Category::Ui, "focus", Value::Null)
                        .await
                        .map_err(|e| HandlerError::Failed(e.to_string()))
                }
            }),
        );

        let reply = fx.guest.request_data(Value::Null).await.unwrap();
        assert_eq!(reply, json!({"focused": true}));
    }

    #[tokio::test(start_paused = true)]
    async fn test_handler_finishing_after_destroy_sends_nothing() {
        let fx = connected();
        let release = Arc::new(tokio::sync::Notify::new());
        let (entered_tx, mut entered) = mpsc::unbounded_channel();
        let gate = Arc::clone(&release);
        fx.guest.on_action(
            Category::Data,
            "request",
            handler_fn(move |envelope: Envelope| {
                let gate = Arc::clone(&gate);
                let entered_tx = entered_tx.clone();
                async move {
                    let _ = entered_tx.send(envelope);
                    gate.notified().await;
                    Ok(json!("too late"))
                }
            }),
        );

        let host = Arc::clone(&fx.host);
        let request = tokio::spawn(async move {
            host.request_with_timeout(
                Category::Data,
                "request",
                Value::Null,
                Duration::from_millis(100),
            )
            .await
        });
        let envelope = entered.recv().await.unwrap();

        fx.guest.destroy();
        release.notify_one();

        let err = request.await.unwrap().unwrap_err();
        assert!(matches!(err, MessengerError::Timeout { .. }));
        assert!(matches!(
            fx.guest.respond(&envelope, json!("direct")).await,
            Err(MessengerError::Destroyed)
        ));
    }

    #[tokio::test]
    async fn test_own_echo_is_ignored() {
        let fx = connected();
        let (handler, mut seen) = recorder();
        fx.guest.on(Category::Ui, handler);

        let echo = fx.guest.prepare(Category::Ui, "focus", json!("echo"), false);
        let mut raw = serde_json::to_value(&echo).unwrap();
        raw["expectedOrigin"] = json!(HOST);
        fx.guest_transport.inject(raw, HOST);
        fx.host.send(Category::Ui, "focus", json!("peer")).await.unwrap();

        assert_eq!(seen.recv().await, Some(json!("peer")));
    }
}
