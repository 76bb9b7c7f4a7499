//! Navigation bookkeeping over the context store.

use std::sync::Arc;

use framebridge_core::{
    Breadcrumb, Category, Context, ContextPatch, Envelope, MessageId, envelope::actions,
};
use framebridge_messenger::{HandlerError, Messenger, handler_fn};
use serde_json::{Map, Value, json};
use tokio::sync::broadcast;

use crate::store::{ContextError, ContextStore};

/// Route a back-navigation falls back to when there is no previous route.
pub const ROOT_ROUTE: &str = "/";

/// Navigation request received from the peer.
#[derive(Debug, Clone, PartialEq)]
pub enum NavigationEvent {
    NavigateTo {
        route: String,
        params: Map<String, Value>,
        state: Option<Value>,
    },
    GoBack {
        route: String,
    },
    Reload,
    Close,
}

/// Route transitions, back-navigation and breadcrumbs.
pub struct NavigationCoordinator {
    store: Arc<ContextStore>,
    events: broadcast::Sender<NavigationEvent>,
}

impl NavigationCoordinator {
    /// Create a coordinator and register its `navigation/*` handlers.
    #[must_use]
    pub fn new(store: Arc<ContextStore>) -> Arc<Self> {
        let (events, _) = broadcast::channel(64);
        let coordinator = Arc::new(Self { store, events });
        coordinator.register_handlers();
        coordinator
    }

    fn register_handlers(&self) {
        let messenger = self.messenger();
        for action in [
            actions::navigation::NAVIGATE_TO,
            actions::navigation::GO_BACK,
            actions::navigation::RELOAD,
            actions::navigation::CLOSE,
        ] {
            let events = self.events.clone();
            messenger.on_action(
                Category::Navigation,
                action,
                handler_fn(move |envelope| {
                    let result = parse_event(envelope).map(|event| {
                        // Nobody listening is fine.
                        let _ = events.send(event);
                        json!({ "success": true })
                    });
                    async move { result }
                }),
            );
        }
    }

    fn messenger(&self) -> &Arc<Messenger> {
        self.store.messenger()
    }

    /// Receiver for navigation requests coming from the peer.
    #[must_use]
    pub fn events(&self) -> broadcast::Receiver<NavigationEvent> {
        self.events.subscribe()
    }

    #[must_use]
    pub fn current_route(&self) -> String {
        self.store.context().navigation.current_route
    }

    #[must_use]
    pub fn breadcrumbs(&self) -> Vec<Breadcrumb> {
        self.store.context().navigation.breadcrumbs
    }

    /// Move to `route`, remembering where we came from, and tell the peer.
    ///
    /// # Errors
    /// Returns error if the context update is rejected.
    pub async fn navigate(
        &self,
        route: impl Into<String>,
        params: Map<String, Value>,
        state: Option<Value>,
    ) -> Result<Context, ContextError> {
        let route = route.into();
        let context = self
            .store
            .modify(
                |current| transition(current, &route, &params, state.as_ref()),
                true,
            )
            .await?;

        self.notify(
            actions::navigation::NAVIGATE_TO,
            json!({ "route": route, "params": params, "state": state }),
        )
        .await;
        Ok(context)
    }

    /// Go to the previous route, or the root if there is none.
    ///
    /// # Errors
    /// Returns error if the context update is rejected.
    pub async fn go_back(&self) -> Result<Context, ContextError> {
        let mut route = String::new();
        let context = self
            .store
            .modify(
                |current| {
                    route = current
                        .navigation
                        .previous_route
                        .clone()
                        .unwrap_or_else(|| ROOT_ROUTE.to_string());
                    transition(current, &route, &Map::new(), None)
                },
                true,
            )
            .await?;

        self.notify(
            actions::navigation::NAVIGATE_TO,
            json!({ "route": route, "params": {}, "state": null }),
        )
        .await;
        self.notify(actions::navigation::GO_BACK, json!({ "route": route }))
            .await;
        Ok(context)
    }

    /// Record a breadcrumb.
    ///
    /// Revisiting a path already on the trail drops everything after it.
    ///
    /// # Errors
    /// Returns error if the context update is rejected.
    pub async fn add_breadcrumb(
        &self,
        label: impl Into<String>,
        path: impl Into<String>,
        params: Option<Map<String, Value>>,
    ) -> Result<Context, ContextError> {
        let (label, path) = (label.into(), path.into());
        self.store
            .modify(
                |current| {
                    let mut navigation = current.navigation.clone();
                    let trail = &mut navigation.breadcrumbs;
                    if let Some(pos) = trail.iter().position(|crumb| crumb.path == path) {
                        trail.truncate(pos + 1);
                    } else {
                        trail.push(Breadcrumb {
                            label,
                            path,
                            params,
                        });
                    }
                    ContextPatch::new().navigation(&navigation)
                },
                true,
            )
            .await
    }

    /// Ask the peer to reload.
    ///
    /// # Errors
    /// Returns error if the message cannot be sent.
    pub async fn reload(&self) -> Result<MessageId, ContextError> {
        Ok(self
            .messenger()
            .send(Category::Navigation, actions::navigation::RELOAD, Value::Null)
            .await?)
    }

    /// Ask the peer to close.
    ///
    /// # Errors
    /// Returns error if the message cannot be sent.
    pub async fn close(&self) -> Result<MessageId, ContextError> {
        Ok(self
            .messenger()
            .send(Category::Navigation, actions::navigation::CLOSE, Value::Null)
            .await?)
    }

    async fn notify(&self, action: &str, data: Value) {
        if let Err(e) = self
            .messenger()
            .send(Category::Navigation, action, data)
            .await
        {
            tracing::warn!(action, "Failed to notify peer of navigation: {e}");
        }
    }
}

/// Patch moving `current` to `route`, with the old route as `previous_route`.
fn transition(
    current: &Context,
    route: &str,
    params: &Map<String, Value>,
    state: Option<&Value>,
) -> ContextPatch {
    let mut navigation = current.navigation.clone();
    navigation.previous_route = Some(std::mem::replace(
        &mut navigation.current_route,
        route.to_string(),
    ));
    navigation.params = params.clone();
    navigation.state = state.cloned();
    ContextPatch::new().route(route).navigation(&navigation)
}

fn parse_event(envelope: Envelope) -> Result<NavigationEvent, HandlerError> {
    let data = envelope.data;
    let route = || {
        data.get("route")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| HandlerError::Failed("navigation payload needs a route".to_string()))
    };

    match envelope.action.as_str() {
        actions::navigation::NAVIGATE_TO => Ok(NavigationEvent::NavigateTo {
            route: route()?,
            params: data
                .get("params")
                .and_then(Value::as_object)
                .cloned()
                .unwrap_or_default(),
            state: data.get("state").filter(|s| !s.is_null()).cloned(),
        }),
        actions::navigation::GO_BACK => Ok(NavigationEvent::GoBack { route: route()? }),
        actions::navigation::RELOAD => Ok(NavigationEvent::Reload),
        actions::navigation::CLOSE => Ok(NavigationEvent::Close),
        other => Err(HandlerError::Failed(format!(
            "unknown navigation action: {other}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use framebridge_core::ContextConfig;

    use super::*;
    use crate::testing::sides;

    struct Fixture {
        host: Arc<NavigationCoordinator>,
        guest: Arc<NavigationCoordinator>,
        guest_store: Arc<ContextStore>,
    }

    fn fixture() -> Fixture {
        let sides = sides();
        let host_store = ContextStore::new(sides.host, ContextConfig::default());
        let guest_store = ContextStore::new(sides.guest, ContextConfig::default());
        Fixture {
            host: NavigationCoordinator::new(host_store),
            guest: NavigationCoordinator::new(Arc::clone(&guest_store)),
            guest_store,
        }
    }

    fn params(page: u64) -> Map<String, Value> {
        let mut params = Map::new();
        params.insert("page".to_string(), json!(page));
        params
    }

    #[tokio::test]
    async fn test_navigate_records_previous_route() {
        let fx = fixture();

        let context = fx
            .guest
            .navigate("/list", params(2), Some(json!({"scroll": 10})))
            .await
            .unwrap();

        assert_eq!(context.route, "/list");
        assert_eq!(context.navigation.current_route, "/list");
        assert_eq!(context.navigation.previous_route.as_deref(), Some("/"));
        assert_eq!(context.navigation.params, params(2));
        assert_eq!(context.navigation.state, Some(json!({"scroll": 10})));
    }

    #[tokio::test]
    async fn test_peer_sees_navigate_to() {
        let fx = fixture();
        let mut events = fx.host.events();

        fx.guest.navigate("/list", params(3), None).await.unwrap();

        assert_eq!(
            events.recv().await.unwrap(),
            NavigationEvent::NavigateTo {
                route: "/list".to_string(),
                params: params(3),
                state: None,
            }
        );
        assert_eq!(fx.host.current_route(), "/list");
    }

    #[tokio::test]
    async fn test_go_back_returns_to_previous_route() {
        let fx = fixture();
        let mut events = fx.host.events();
        fx.guest.navigate("/a", Map::new(), None).await.unwrap();
        fx.guest.navigate("/b", Map::new(), None).await.unwrap();

        let context = fx.guest.go_back().await.unwrap();

        assert_eq!(context.route, "/a");
        assert_eq!(context.navigation.previous_route.as_deref(), Some("/b"));

        let mut seen = Vec::new();
        for _ in 0..4 {
            seen.push(events.recv().await.unwrap());
        }
        assert_eq!(
            seen.last(),
            Some(&NavigationEvent::GoBack {
                route: "/a".to_string()
            })
        );
    }

    #[tokio::test]
    async fn test_go_back_without_history_goes_to_root() {
        let fx = fixture();
        fx.guest_store
            .update_context(ContextPatch::new().route("/x"), false)
            .await
            .unwrap();

        let context = fx.guest.go_back().await.unwrap();
        assert_eq!(context.route, ROOT_ROUTE);
    }

    #[tokio::test]
    async fn test_revisiting_breadcrumb_truncates_trail() {
        let fx = fixture();

        fx.guest.add_breadcrumb("Home", "/", None).await.unwrap();
        fx.guest.add_breadcrumb("List", "/list", None).await.unwrap();
        let context = fx.guest.add_breadcrumb("Home", "/", None).await.unwrap();

        assert_eq!(context.navigation.breadcrumbs, vec![Breadcrumb::new("Home", "/")]);
    }

    #[tokio::test]
    async fn test_breadcrumbs_append_in_order() {
        let fx = fixture();

        fx.guest.add_breadcrumb("Home", "/", None).await.unwrap();
        fx.guest.add_breadcrumb("List", "/list", None).await.unwrap();
        fx.guest
            .add_breadcrumb("Item", "/list/7", Some(params(1)))
            .await
            .unwrap();
        fx.guest.add_breadcrumb("List", "/list", None).await.unwrap();

        let paths: Vec<String> = fx.guest.breadcrumbs().into_iter().map(|b| b.path).collect();
        assert_eq!(paths, vec!["/", "/list"]);
    }

    #[tokio::test]
    async fn test_reload_and_close_reach_peer() {
        let fx = fixture();
        let mut events = fx.guest.events();

        fx.host.reload().await.unwrap();
        fx.host.close().await.unwrap();

        assert_eq!(events.recv().await.unwrap(), NavigationEvent::Reload);
        assert_eq!(events.recv().await.unwrap(), NavigationEvent::Close);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn test_concurrent_breadcrumbs_are_all_kept() {
        let fx = fixture();

        let tasks: Vec<_> = (0..200)
            .map(|i| {
                let guest = Arc::clone(&fx.guest);
                tokio::spawn(async move {
                    guest
                        .add_breadcrumb(format!("c{i}"), format!("/c{i}"), None)
                        .await
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        let mut paths: Vec<String> = fx.guest.breadcrumbs().into_iter().map(|b| b.path).collect();
        paths.sort();
        let mut expected: Vec<String> = (0..200).map(|i| format!("/c{i}")).collect();
        expected.sort();
        assert_eq!(paths, expected);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_navigations_chain_previous_routes() {
        let fx = fixture();

        let tasks: Vec<_> = (0..50)
            .map(|i| {
                let guest = Arc::clone(&fx.guest);
                tokio::spawn(async move { guest.navigate(format!("/r{i}"), Map::new(), None).await })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        // Every snapshot's route is the next one's previous route.
        let mut chain = fx.guest_store.history();
        chain.push(fx.guest_store.context());
        for pair in chain.windows(2) {
            assert_eq!(
                pair[1].navigation.previous_route.as_deref(),
                Some(pair[0].route.as_str())
            );
        }
    }

    #[test]
    fn test_navigate_to_without_route_is_rejected() {
        let envelope = Envelope::new(
            framebridge_core::Role::Host,
            "*",
            Category::Navigation,
            actions::navigation::NAVIGATE_TO,
            json!({"params": {}}),
            false,
        );
        assert!(parse_event(envelope).is_err());
    }
}
