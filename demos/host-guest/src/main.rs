//! Host page and embedded guest talking over an in-memory channel.
//!
//! Run with: cargo run -p host-guest-demo
//!
//! Set `RUST_LOG=framebridge_messenger=trace` to watch envelopes go by.

use std::{sync::Arc, time::Duration};

use anyhow::Context as _;
use framebridge_context::{ContextStore, ModalClient, ModalCoordinator, NavigationCoordinator};
use framebridge_core::{Category, ContextConfig, Envelope, MessengerConfig};
use framebridge_messenger::{Messenger, handler_fn};
use framebridge_transport::pair_unready;
use serde_json::{Map, json};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const HOST_ORIGIN: &str = "https://app.example";
const GUEST_ORIGIN: &str = "https://widget.example";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let (host_transport, guest_transport) = pair_unready(HOST_ORIGIN, GUEST_ORIGIN);

    let host = Messenger::spawn(
        MessengerConfig::host(HOST_ORIGIN, GUEST_ORIGIN).with_debug(true),
        host_transport,
    );
    if let Err(e) = host.send(Category::Lifecycle, "ping", json!({})).await {
        tracing::info!("Guest not loaded yet, send refused: {e}");
    }

    // The embedding layer flips readiness once the guest document has loaded.
    let guest = Messenger::spawn(
        MessengerConfig::guest(GUEST_ORIGIN, HOST_ORIGIN).with_timeout(Duration::from_secs(2)),
        guest_transport.clone(),
    );
    guest_transport.set_ready(true);

    let sync_config = ContextConfig {
        sync_interval_ms: Some(30_000),
        ..ContextConfig::default()
    };
    let host_store = ContextStore::new(Arc::clone(&host), sync_config);
    let guest_store = ContextStore::new(Arc::clone(&guest), ContextConfig::default());
    let host_nav = NavigationCoordinator::new(Arc::clone(&host_store));
    let guest_nav = NavigationCoordinator::new(Arc::clone(&guest_store));
    let sync_task = host_store.spawn_periodic_sync();

    host.on_action(
        Category::Data,
        "request",
        handler_fn(|envelope: Envelope| async move {
            tracing::info!(request = %envelope.data, "Host serving data request");
            Ok(json!({ "id": "123", "name": "Ada" }))
        }),
    );

    let user = guest
        .request_data(json!({ "type": "user-info" }))
        .await
        .context("user-info request failed")?;
    tracing::info!(%user, "Guest received user info");

    guest_nav.add_breadcrumb("Home", "/", None).await?;
    guest_nav.add_breadcrumb("Orders", "/orders", None).await?;
    guest_nav.navigate("/orders", Map::new(), None).await?;
    tokio::time::sleep(Duration::from_millis(20)).await;
    tracing::info!(
        route = %host_nav.current_route(),
        crumbs = host_nav.breadcrumbs().len(),
        "Host mirrors guest navigation"
    );

    let modals = ModalCoordinator::new();
    modals.register_guest("widget", Arc::clone(&host));
    let modal_client = ModalClient::new(Arc::clone(&guest));
    let mut shown = modal_client.requests();

    let opener = Arc::clone(&modals);
    let opened = tokio::spawn(async move {
        opener
            .open("widget", "/confirm", json!({ "question": "Delete order?" }))
            .await
    });
    let request = shown.recv().await?;
    tracing::info!(route = %request.route, "Guest shows modal");
    modal_client
        .close_modal(&request.modal_id, json!({ "confirmed": true }))
        .await?;
    let answer = opened.await??;
    tracing::info!(%answer, "Host received modal result");

    if let Some(task) = sync_task {
        task.abort();
    }
    guest.destroy();
    host.destroy();
    Ok(())
}
