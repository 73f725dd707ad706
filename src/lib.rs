// src/lib.rs
pub mod broadcast;
pub mod client_pool;
pub mod config;
pub mod error;
pub mod heartbeat;
pub mod http_handlers;
pub mod listener;
pub mod metadata;
pub mod packet;
pub mod persist;
pub mod socket_handlers;
pub mod state;
pub mod subscriber;
pub mod supervisor;
pub mod types;
pub mod updater;
pub mod upstream;

#[cfg(test)]
mod testing;

use axum::{
    routing::{get, post, put},
    Router,
};
use broadcast::BroadcastRouter;
use config::Config;
use listener::ListenerContext;
use metadata::{BiliApi, MetadataResolver};
use persist::EventSink;
use state::RoomState;
use std::sync::Arc;
use subscriber::SubscriptionRegistry;
use supervisor::RoomSupervisor;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use upstream::{DanmakuConnector, UpstreamConnector};

/// Service instances shared by every handler. Cheap to clone.
#[derive(Clone)]
pub struct ServerState {
    pub config: Arc<Config>,
    pub registry: SubscriptionRegistry,
    pub rooms: RoomState,
    pub router: BroadcastRouter,
    pub resolver: Arc<dyn MetadataResolver>,
    pub supervisor: RoomSupervisor,
}

impl ServerState {
    pub fn new(
        config: Arc<Config>,
        resolver: Arc<dyn MetadataResolver>,
        connector: Arc<dyn UpstreamConnector>,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        let registry = SubscriptionRegistry::new();
        let rooms = RoomState::new();
        let router = BroadcastRouter::new(
            registry.clone(),
            rooms.clone(),
            config.subscription_expiry,
        );
        let ctx = ListenerContext {
            config: config.clone(),
            rooms: rooms.clone(),
            resolver: resolver.clone(),
            connector,
            sink,
            router: router.clone(),
        };
        let supervisor = RoomSupervisor::new(ctx, registry.clone());

        Self {
            config,
            registry,
            rooms,
            router,
            resolver,
            supervisor,
        }
    }
}

pub fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "live_relay=info,tower_http=info,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Production collaborators: the bilibili API, the danmaku connector and the
/// configured event sink.
pub async fn setup_shared_state(config: Arc<Config>) -> ServerState {
    let api = BiliApi::new(&config);
    if config.reset_low_latency {
        api.reset_low_latency();
        info!("🧹 [API] Low latency host cache cleared");
    }
    let connector = DanmakuConnector::new(&config);
    let sink = persist::open_sink(config.database_url.as_deref()).await;

    ServerState::new(config, Arc::new(api), Arc::new(connector), sink)
}

pub fn build_router(state: ServerState) -> Router {
    let listening = Router::new()
        .route("/listening", get(http_handlers::listening_handler))
        .route(
            "/listening/{room_id}",
            get(http_handlers::listening_room_handler),
        );
    // polled by dashboards, so it can be kept out of the request log
    let listening = if state.config.quiet_listening_log {
        listening
    } else {
        listening.layer(TraceLayer::new_for_http())
    };

    let api = Router::new()
        .route("/", get(http_handlers::index_handler))
        .route("/validate", post(http_handlers::validate_handler))
        .route(
            "/subscribe",
            get(http_handlers::get_subscriptions_handler)
                .post(http_handlers::subscribe_handler)
                .delete(http_handlers::clear_subscribe_handler),
        )
        .route("/subscribe/add", put(http_handlers::add_subscribe_handler))
        .route(
            "/subscribe/remove",
            put(http_handlers::remove_subscribe_handler),
        )
        .route("/ws", get(socket_handlers::ws_handler))
        .route("/ws/global", get(socket_handlers::global_ws_handler))
        .layer(TraceLayer::new_for_http());

    api.merge(listening).with_state(state).layer(
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any),
    )
}
