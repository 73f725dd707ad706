// src/socket_handlers.rs
use super::{
    broadcast::{ConnectionHandle, Downstream},
    error::AppError,
    subscriber::client_identifier,
    types::{GlobalWsQuery, WsQuery},
    ServerState,
};
use async_trait::async_trait;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        ConnectInfo, Query, State,
    },
    response::Response,
};
use futures_util::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use std::net::SocketAddr;
use tracing::{debug, info, warn};

/// Write half of an accepted WebSocket.
struct WsDownstream {
    sink: SplitSink<WebSocket, Message>,
}

#[async_trait]
impl Downstream for WsDownstream {
    async fn send_text(&mut self, text: &str) -> anyhow::Result<()> {
        self.sink.send(Message::Text(text.into())).await?;
        Ok(())
    }

    async fn close(&mut self) {
        let _ = self.sink.send(Message::Close(None)).await;
        let _ = self.sink.close().await;
    }
}

/// `GET /ws?id=..`: a subscriber connection keyed like the HTTP caller.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<ServerState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Query(query): Query<WsQuery>,
) -> Response {
    let identifier = client_identifier(addr.ip(), query.id.as_deref());
    ws.on_upgrade(move |socket| async move {
        let (sink, stream) = socket.split();
        let handle = state
            .router
            .connect(&identifier, Box::new(WsDownstream { sink }))
            .await;
        serve_connection(state, handle, stream).await;
    })
}

/// `GET /ws/global?token=..`: receives every relayed message.
pub async fn global_ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<ServerState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Query(query): Query<GlobalWsQuery>,
) -> Result<Response, AppError> {
    if let Some(expected) = state.config.global_token.as_deref() {
        if query.token.as_deref() != Some(expected) {
            warn!("🚫 [WS] Global connection from {} rejected", addr.ip());
            return Err(AppError::Forbidden);
        }
    }

    let identifier = format!("{}@global", addr.ip());
    Ok(ws.on_upgrade(move |socket| async move {
        let (sink, stream) = socket.split();
        let handle = state
            .router
            .connect_global(&identifier, Box::new(WsDownstream { sink }));
        serve_connection(state, handle, stream).await;
    }))
}

/// Drains the read half until the client goes away. Inbound data is ignored.
async fn serve_connection(
    state: ServerState,
    handle: ConnectionHandle,
    mut stream: SplitStream<WebSocket>,
) {
    while let Some(frame) = stream.next().await {
        match frame {
            Ok(Message::Close(_)) => break,
            Ok(Message::Text(text)) => {
                debug!("[WS] {} sent {} bytes, ignored", handle.identifier, text.len());
            }
            Ok(_) => {}
            Err(e) => {
                info!("⚠️ [WS] {} read error: {}", handle.identifier, e);
                break;
            }
        }
    }
    state.router.release(&handle);
}
