// src/http_handlers.rs
use super::{
    error::{AppError, ResolveError},
    metadata::fetch_listening_info,
    subscriber::client_identifier,
    types::{ListeningInfo, ListeningSummary, RoomId, RoomSet, SubscribePayload, ValidateQuery},
    ServerState,
};
use axum::{
    extract::{ConnectInfo, Path, Query, State},
    http::{header::AUTHORIZATION, HeaderMap, StatusCode},
    Json,
};
use serde_json::{json, Value};
use std::net::SocketAddr;
use tracing::{info, warn};

/// `{ip}@{Authorization header}` of the caller.
fn caller(addr: &SocketAddr, headers: &HeaderMap) -> String {
    let credential = headers.get(AUTHORIZATION).and_then(|v| v.to_str().ok());
    client_identifier(addr.ip(), credential)
}

pub async fn index_handler() -> Json<Value> {
    Json(json!({ "status": "working" }))
}

/// 200 only when the caller holds a non-empty subscription.
pub async fn validate_handler(
    State(state): State<ServerState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Result<StatusCode, AppError> {
    match state.registry.get(&caller(&addr, &headers)) {
        None => Err(AppError::NoSubscription),
        Some(rooms) if rooms.is_empty() => Err(AppError::EmptySubscribes),
        Some(_) => Ok(StatusCode::OK),
    }
}

pub async fn get_subscriptions_handler(
    State(state): State<ServerState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Json<RoomSet> {
    Json(state.registry.get(&caller(&addr, &headers)).unwrap_or_default())
}

pub async fn subscribe_handler(
    State(state): State<ServerState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Query(query): Query<ValidateQuery>,
    Json(payload): Json<SubscribePayload>,
) -> Result<Json<RoomSet>, AppError> {
    let identifier = caller(&addr, &headers);
    let rooms = collect_rooms(&state, payload, query.validate.unwrap_or(true)).await?;
    info!("📝 [HTTP] {} sets subscription {:?}", identifier, rooms);

    arm_first_expiry(&state, &identifier);
    Ok(Json(state.registry.replace(&identifier, rooms).await))
}

pub async fn add_subscribe_handler(
    State(state): State<ServerState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Query(query): Query<ValidateQuery>,
    Json(payload): Json<SubscribePayload>,
) -> Result<Json<RoomSet>, AppError> {
    let identifier = caller(&addr, &headers);
    let rooms = collect_rooms(&state, payload, query.validate.unwrap_or(true)).await?;
    info!("➕ [HTTP] {} adds {:?}", identifier, rooms);

    arm_first_expiry(&state, &identifier);
    Ok(Json(state.registry.add(&identifier, rooms).await))
}

/// A live WebSocket keeps the subscription alive, so only unconnected
/// first-time subscribers get a timer.
fn arm_first_expiry(state: &ServerState, identifier: &str) {
    if state.router.is_connected(identifier) {
        return;
    }
    state
        .registry
        .arm_expiry(identifier, state.config.subscription_expiry);
}

/// Removal never validates: a room that stopped existing must still be removable.
pub async fn remove_subscribe_handler(
    State(state): State<ServerState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(payload): Json<SubscribePayload>,
) -> Result<Json<RoomSet>, AppError> {
    let identifier = caller(&addr, &headers);
    let rooms = collect_rooms(&state, payload, false).await?;
    let remaining = state
        .registry
        .remove(&identifier, rooms)
        .await
        .map_err(|_| AppError::NoSubscription)?;
    Ok(Json(remaining))
}

pub async fn clear_subscribe_handler(
    State(state): State<ServerState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> StatusCode {
    state.registry.delete(&caller(&addr, &headers)).await;
    StatusCode::OK
}

/// Request rooms as a set. With `validate`, each id is replaced by its
/// canonical room and ids of missing rooms are dropped.
async fn collect_rooms(
    state: &ServerState,
    payload: SubscribePayload,
    validate: bool,
) -> Result<RoomSet, AppError> {
    let requested = payload.subscribes.ok_or(AppError::MissingSubscribes)?;
    if requested.is_empty() {
        return Err(AppError::EmptySubscribes);
    }
    if !validate {
        return Ok(requested.into_iter().collect());
    }

    let mut rooms = RoomSet::new();
    for room in requested {
        match state.resolver.resolve_room(room, false).await {
            Ok(info) => {
                rooms.insert(info.room_id);
            }
            Err(ResolveError::NotFound) => {
                warn!("⚠️ [HTTP] Room {} does not exist, filtered out", room);
            }
            Err(e) => return Err(e.into()),
        }
    }
    Ok(rooms)
}

pub async fn listening_handler(State(state): State<ServerState>) -> Json<ListeningSummary> {
    let entered = state.supervisor.entered_rooms();
    let mut rooms: Vec<RoomId> = entered.iter().copied().collect();
    rooms.sort_unstable();

    Json(ListeningSummary {
        total_started_count: state.supervisor.listening_rooms().len(),
        excepted_count: state.supervisor.excepted_rooms().len(),
        total_listening_count: entered.len(),
        rooms,
    })
}

pub async fn listening_room_handler(
    State(state): State<ServerState>,
    Path(room_id): Path<RoomId>,
) -> Result<Json<ListeningInfo>, AppError> {
    match fetch_listening_info(state.resolver.as_ref(), room_id).await {
        Ok(info) => Ok(Json(info)),
        Err(ResolveError::NotFound) => Err(AppError::RoomNotFound),
        Err(e) => Err(e.into()),
    }
}
