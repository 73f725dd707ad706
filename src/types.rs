// src/types.rs
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

pub type RoomId = i64;

/// A subscriber's interest set. Ordered so API responses are stable.
pub type RoomSet = BTreeSet<RoomId>;

/// Command name the relay uses for heartbeat replies (popularity updates).
pub const HEARTBEAT_REPLY_CMD: &str = "HEARTBEAT_REPLY";
/// Command name the upstream sends when a room goes live.
pub const LIVE_CMD: &str = "LIVE";

/// Room details as returned by the metadata collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoomInfo {
    /// Canonical room id; differs from the requested id when that was a short id.
    pub room_id: RoomId,
    pub uid: i64,
    pub title: String,
    pub cover: String,
}

/// Owner (streamer) details as returned by the metadata collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OwnerInfo {
    pub name: String,
    pub face: String,
    pub bio: String,
    /// -1 when the owner has no official verification.
    pub official_role: i32,
}

/// Metadata attached to every envelope delivered downstream.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LiveInfo {
    pub room_id: RoomId,
    pub uid: i64,
    pub title: String,
    pub name: String,
    pub cover: String,
    pub user_face: String,
    pub user_description: String,
}

impl LiveInfo {
    pub fn new(room: RoomInfo, owner: &OwnerInfo) -> Self {
        Self {
            room_id: room.room_id,
            uid: room.uid,
            title: room.title,
            name: owner.name.clone(),
            cover: room.cover,
            user_face: owner.face.clone(),
            user_description: owner.bio.clone(),
        }
    }
}

/// Response body of `GET /listening/{room_id}`.
#[derive(Debug, Clone, Serialize)]
pub struct ListeningInfo {
    #[serde(flatten)]
    pub live_info: LiveInfo,
    pub official_role: i32,
}

/// One decoded upstream message. `raw` is the JSON body as received.
#[derive(Debug, Clone, PartialEq)]
pub struct LiveMessage {
    pub cmd: String,
    pub raw: Bytes,
}

impl LiveMessage {
    pub fn new(cmd: impl Into<String>, raw: impl Into<Bytes>) -> Self {
        Self {
            cmd: cmd.into(),
            raw: raw.into(),
        }
    }

    pub fn heartbeat_reply(popularity: u32) -> Self {
        Self::new(
            HEARTBEAT_REPLY_CMD,
            format!("{{\"popularity\": {}}}", popularity),
        )
    }

    pub fn is_heartbeat_reply(&self) -> bool {
        self.cmd == HEARTBEAT_REPLY_CMD
    }

    pub fn is_live_start(&self) -> bool {
        self.cmd == LIVE_CMD
    }

    /// Body as JSON, or the lossy string when it isn't valid JSON.
    pub fn content(&self) -> serde_json::Value {
        serde_json::from_slice(&self.raw).unwrap_or_else(|_| {
            serde_json::Value::String(String::from_utf8_lossy(&self.raw).into_owned())
        })
    }
}

/// Envelope written to downstream connections.
#[derive(Debug, Serialize)]
pub struct BroadcastEnvelope<'a> {
    pub command: &'a str,
    pub live_info: &'a LiveInfo,
    pub content: serde_json::Value,
}

/// Request body for the subscription endpoints.
#[derive(Debug, Clone, Deserialize)]
pub struct SubscribePayload {
    pub subscribes: Option<Vec<RoomId>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ValidateQuery {
    pub validate: Option<bool>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WsQuery {
    pub id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GlobalWsQuery {
    pub token: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ListeningSummary {
    pub total_started_count: usize,
    pub excepted_count: usize,
    pub total_listening_count: usize,
    pub rooms: Vec<RoomId>,
}
