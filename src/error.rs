// src/error.rs
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use thiserror::Error;

/// Failure kinds of the metadata collaborator.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ResolveError {
    /// The room or its owner does not exist. Permanent.
    #[error("room or owner not found")]
    NotFound,

    /// Upstream rejected the request for being too frequent.
    #[error("rate limited by upstream")]
    RateLimited,

    #[error("transient error: {0}")]
    Transient(String),
}

impl From<reqwest::Error> for ResolveError {
    fn from(e: reqwest::Error) -> Self {
        ResolveError::Transient(e.to_string())
    }
}

impl From<serde_json::Error> for ResolveError {
    fn from(e: serde_json::Error) -> Self {
        ResolveError::Transient(format!("decode: {}", e))
    }
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum RegistryError {
    #[error("{0} has no subscription")]
    NotFound(String),
}

/// Errors from the danmaku packet codec. Always scoped to one frame.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("truncated packet: need {needed} bytes, have {available}")]
    Truncated { needed: usize, available: usize },

    #[error("invalid header length {0}")]
    InvalidHeader(usize),

    #[error("unsupported protocol version {0}")]
    UnsupportedProtocol(u16),

    #[error("decompression failed: {0}")]
    Decompress(#[from] std::io::Error),

    #[error("invalid message body: {0}")]
    Json(#[from] serde_json::Error),

    #[error("message body has no cmd field")]
    MissingCommand,
}

#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("connect failed: {0}")]
    Connect(String),

    #[error("connect timed out")]
    Timeout,

    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("frame decode error: {0}")]
    Decode(#[from] FrameError),
}

impl UpstreamError {
    /// Decode errors only poison one frame; the connection is still usable.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, UpstreamError::Decode(_))
    }
}

impl From<std::io::Error> for UpstreamError {
    fn from(e: std::io::Error) -> Self {
        UpstreamError::Connect(e.to_string())
    }
}

/// Errors surfaced by the HTTP request layer.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("missing `subscribes` (subscription list)")]
    MissingSubscribes,

    #[error("subscription list is empty")]
    EmptySubscribes,

    #[error("you have not submitted any subscription yet")]
    NoSubscription,

    #[error("room does not exist")]
    RoomNotFound,

    #[error("global connections require a valid token")]
    Forbidden,

    #[error(transparent)]
    Resolve(#[from] ResolveError),

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        tracing::warn!("HTTP Handler Error: {}", self);

        let status = match &self {
            AppError::RoomNotFound | AppError::Resolve(ResolveError::NotFound) => {
                StatusCode::NOT_FOUND
            }
            AppError::Forbidden => StatusCode::FORBIDDEN,
            AppError::Resolve(ResolveError::RateLimited) => StatusCode::TOO_MANY_REQUESTS,
            AppError::Resolve(ResolveError::Transient(_)) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::BAD_REQUEST,
        };

        (status, Json(serde_json::json!({ "error": self.to_string() }))).into_response()
    }
}
