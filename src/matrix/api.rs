//! Client-server API payloads used by the Matrix transport.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Response of `GET /sync`, reduced to joined room timelines.
#[derive(Deserialize, Debug)]
pub struct SyncResponse {
    pub next_batch: String,
    #[serde(default)]
    pub rooms: SyncRooms,
}

#[derive(Deserialize, Debug, Default)]
pub struct SyncRooms {
    #[serde(default)]
    pub join: HashMap<String, JoinedRoom>,
}

#[derive(Deserialize, Debug, Default)]
pub struct JoinedRoom {
    #[serde(default)]
    pub timeline: Timeline,
}

#[derive(Deserialize, Debug, Default)]
pub struct Timeline {
    #[serde(default)]
    pub events: Vec<RoomEvent>,
}

/// A timeline event. Only message events are interpreted.
#[derive(Deserialize, Debug, Clone)]
pub struct RoomEvent {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub event_id: String,
    #[serde(default)]
    pub sender: String,
    /// Milliseconds since the Unix epoch, stamped by the originating homeserver.
    #[serde(default)]
    pub origin_server_ts: i64,
    #[serde(default)]
    pub content: serde_json::Value,
}

impl RoomEvent {
    /// Parses the content of an `m.room.message` event.
    pub fn message(&self) -> Option<MessageContent> {
        if self.kind != "m.room.message" {
            return None;
        }
        serde_json::from_value(self.content.clone()).ok()
    }
}

#[derive(Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageContent {
    #[serde(default)]
    pub msgtype: String,
    #[serde(default)]
    pub body: String,
}

/// Body of an outgoing `m.room.message`.
#[derive(Serialize, Debug)]
pub struct TextMessage<'a> {
    pub msgtype: &'a str,
    pub body: &'a str,
}

#[derive(Deserialize, Debug)]
pub struct JoinResponse {
    pub room_id: String,
}

#[derive(Deserialize, Debug)]
pub struct SendResponse {
    pub event_id: String,
}

/// Standard error body of the client-server API.
#[derive(Deserialize, Debug, Default)]
pub struct ErrorResponse {
    #[serde(default)]
    pub errcode: String,
    #[serde(default)]
    pub error: String,
}
