//! Wire payload types for the media control channel.
//!
//! Inbound messages are JSON objects with a `type` discriminant and the
//! command parameters either inline or under `requestData`. Outbound
//! messages are MEDIA_STATUS snapshots and error payloads.

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;
use std::collections::HashSet;
use std::fmt;

use crate::session::{
    ItemId, MediaSession, QueueItem, RepeatMode, SeekResumeState, TrackId,
};

pub const MESSAGE_TYPE_LOAD: &str = "LOAD";
pub const MESSAGE_TYPE_STOP: &str = "STOP";
pub const MESSAGE_TYPE_PAUSE: &str = "PAUSE";
pub const MESSAGE_TYPE_PLAY: &str = "PLAY";
pub const MESSAGE_TYPE_SEEK: &str = "SEEK";
pub const MESSAGE_TYPE_SET_VOLUME: &str = "SET_VOLUME";
pub const MESSAGE_TYPE_GET_STATUS: &str = "GET_STATUS";
pub const MESSAGE_TYPE_EDIT_TRACKS_INFO: &str = "EDIT_TRACKS_INFO";
pub const MESSAGE_TYPE_QUEUE_LOAD: &str = "QUEUE_LOAD";
pub const MESSAGE_TYPE_QUEUE_UPDATE: &str = "QUEUE_UPDATE";
pub const MESSAGE_TYPE_QUEUE_INSERT: &str = "QUEUE_INSERT";
pub const MESSAGE_TYPE_QUEUE_REMOVE: &str = "QUEUE_REMOVE";
pub const MESSAGE_TYPE_QUEUE_REORDER: &str = "QUEUE_REORDER";
pub const MESSAGE_TYPE_PRELOAD: &str = "PRELOAD";
pub const MESSAGE_TYPE_CANCEL_PRELOAD: &str = "CANCEL_PRELOAD";

pub const MESSAGE_TYPE_MEDIA_STATUS: &str = "MEDIA_STATUS";

/// Every command type this receiver understands at the dispatch level,
/// including the ones it understands only well enough to refuse.
pub static RECOGNIZED_TYPES: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    HashSet::from([
        MESSAGE_TYPE_LOAD,
        MESSAGE_TYPE_STOP,
        MESSAGE_TYPE_PAUSE,
        MESSAGE_TYPE_PLAY,
        MESSAGE_TYPE_SEEK,
        MESSAGE_TYPE_SET_VOLUME,
        MESSAGE_TYPE_GET_STATUS,
        MESSAGE_TYPE_EDIT_TRACKS_INFO,
        MESSAGE_TYPE_QUEUE_LOAD,
        MESSAGE_TYPE_QUEUE_UPDATE,
        MESSAGE_TYPE_QUEUE_INSERT,
        MESSAGE_TYPE_QUEUE_REMOVE,
        MESSAGE_TYPE_QUEUE_REORDER,
        MESSAGE_TYPE_PRELOAD,
        MESSAGE_TYPE_CANCEL_PRELOAD,
    ])
});

/// A sender-chosen request correlation id.
///
/// Value 0 means "no request": statuses the receiver originates on its own
/// carry it, and the stored request id is reset to it after every reply.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(transparent)]
pub struct RequestId(pub i32);

impl RequestId {
    pub const NONE: RequestId = RequestId(0);

    pub fn is_none(self) -> bool {
        self == RequestId::NONE
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorType {
    InvalidPlayerState,
    LoadFailed,
    LoadCancelled,
    InvalidRequest,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorReason {
    InvalidCommand,
    InvalidParams,
    InvalidMediaSessionId,
    DuplicateRequestId,
}

/// Raw inbound message before command-specific parsing.
///
/// `requestData` carries the parameters when present; otherwise the
/// parameters sit inline next to `type` and are collected in `rest`.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawMessage {
    #[serde(rename = "type")]
    pub typ: Option<String>,

    pub sender_id: Option<String>,
    pub request_data: Option<serde_json::Value>,

    #[serde(flatten)]
    pub rest: serde_json::Map<String, serde_json::Value>,
}

/// A normalized command ready for dispatch: who sent it, what it is, and
/// one JSON object holding its parameters.
#[derive(Clone, Debug)]
pub struct CommandEnvelope {
    pub sender_id: Option<String>,
    pub typ: Option<String>,
    pub data: serde_json::Value,
}

impl CommandEnvelope {
    /// Normalizes a raw message. The connection-scoped sender id wins over
    /// any sender id claimed inside the message body.
    pub fn from_raw(raw: RawMessage, connection_sender: Option<&str>) -> CommandEnvelope {
        let data = raw
            .request_data
            .unwrap_or_else(|| serde_json::Value::Object(raw.rest));
        CommandEnvelope {
            sender_id: connection_sender.map(str::to_string).or(raw.sender_id),
            typ: raw.typ,
            data,
        }
    }

    /// The request id carried by this command, if any.
    pub fn request_id(&self) -> Option<RequestId> {
        self.data
            .get("requestId")
            .and_then(serde_json::Value::as_i64)
            .map(|id| RequestId(id as i32))
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadRequestData {
    pub request_id: Option<RequestId>,

    #[serde(default)]
    pub media: crate::session::Media,

    pub autoplay: Option<bool>,
    pub current_time: Option<f64>,
    pub custom_data: Option<serde_json::Value>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueLoadRequestData {
    pub request_id: Option<RequestId>,

    #[serde(default)]
    pub items: Vec<QueueItem>,

    pub start_index: Option<usize>,
    pub repeat_mode: Option<RepeatMode>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueInsertRequestData {
    pub request_id: Option<RequestId>,

    #[serde(default)]
    pub items: Vec<QueueItem>,

    /// Existing item the new block lands before; absent appends.
    pub insert_before: Option<ItemId>,

    /// Queue position to switch playback to after the insert.
    pub current_item_index: Option<usize>,

    /// Item id to switch playback to after the insert.
    pub current_item_id: Option<ItemId>,

    pub current_time: Option<f64>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueUpdateRequestData {
    pub request_id: Option<RequestId>,
    pub current_item_id: Option<ItemId>,

    /// Signed distance from the current item, with wraparound.
    pub jump: Option<i64>,

    pub repeat_mode: Option<RepeatMode>,
    pub current_time: Option<f64>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueRemoveRequestData {
    pub request_id: Option<RequestId>,
    pub item_ids: Option<Vec<ItemId>>,
    pub current_item_id: Option<ItemId>,
    pub current_time: Option<f64>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueReorderRequestData {
    pub request_id: Option<RequestId>,
    pub item_ids: Option<Vec<ItemId>>,
    pub insert_before: Option<ItemId>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SeekRequestData {
    pub request_id: Option<RequestId>,
    pub current_time: Option<f64>,
    pub resume_state: Option<SeekResumeState>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeRequest {
    pub level: Option<f64>,
    pub muted: Option<bool>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetVolumeRequestData {
    pub request_id: Option<RequestId>,
    pub volume: VolumeRequest,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EditTracksInfoRequestData {
    pub request_id: Option<RequestId>,
    pub active_track_ids: Option<Vec<TrackId>>,
    pub text_track_style: Option<serde_json::Value>,
}

/// Parameters shared by commands that carry nothing but a request id.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenericRequestData {
    pub request_id: Option<RequestId>,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaStatusMessage {
    #[serde(rename = "type")]
    pub typ: &'static str,

    pub request_id: RequestId,

    /// Zero or one session snapshots; empty after STOP tears the session
    /// down.
    pub status: Vec<MediaSession>,
}

#[skip_serializing_none]
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorMessage {
    #[serde(rename = "type")]
    pub typ: ErrorType,

    pub request_id: RequestId,
    pub reason: Option<ErrorReason>,
}

/// Any message the receiver emits on the channel.
#[derive(Clone, Debug, Serialize)]
#[serde(untagged)]
pub enum OutboundMessage {
    Status(MediaStatusMessage),
    Error(ErrorMessage),
}

impl OutboundMessage {
    pub fn status(request_id: RequestId, status: Vec<MediaSession>) -> OutboundMessage {
        OutboundMessage::Status(MediaStatusMessage {
            typ: MESSAGE_TYPE_MEDIA_STATUS,
            request_id,
            status,
        })
    }

    pub fn error(
        typ: ErrorType,
        request_id: RequestId,
        reason: Option<ErrorReason>,
    ) -> OutboundMessage {
        OutboundMessage::Error(ErrorMessage {
            typ,
            request_id,
            reason,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    #[test]
    fn envelope_prefers_request_data_over_inline_fields() {
        let raw: RawMessage = serde_json::from_value(json!({
            "type": "SEEK",
            "requestData": { "requestId": 4, "currentTime": 30.0 },
            "requestId": 99,
        }))
        .unwrap();
        let envelope = CommandEnvelope::from_raw(raw, Some("sender-1"));
        assert_eq!(envelope.typ.as_deref(), Some("SEEK"));
        assert_eq!(envelope.request_id(), Some(RequestId(4)));

        let data: SeekRequestData = serde_json::from_value(envelope.data).unwrap();
        assert_eq!(data.current_time, Some(30.0));
    }

    #[test]
    fn envelope_falls_back_to_inline_fields() {
        let raw: RawMessage = serde_json::from_value(json!({
            "type": "PLAY",
            "requestId": 7,
        }))
        .unwrap();
        let envelope = CommandEnvelope::from_raw(raw, None);
        assert_eq!(envelope.request_id(), Some(RequestId(7)));
    }

    #[test]
    fn connection_sender_wins_over_claimed_sender() {
        let raw: RawMessage = serde_json::from_value(json!({
            "type": "GET_STATUS",
            "senderId": "spoofed",
        }))
        .unwrap();
        let envelope = CommandEnvelope::from_raw(raw, Some("sender-3"));
        assert_eq!(envelope.sender_id.as_deref(), Some("sender-3"));
    }

    #[test]
    fn error_message_wire_shape() {
        let msg = OutboundMessage::error(
            ErrorType::InvalidRequest,
            RequestId(12),
            Some(ErrorReason::InvalidCommand),
        );
        assert_eq!(
            serde_json::to_value(&msg).unwrap(),
            json!({
                "type": "INVALID_REQUEST",
                "requestId": 12,
                "reason": "INVALID_COMMAND",
            })
        );

        let msg = OutboundMessage::error(ErrorType::LoadFailed, RequestId::NONE, None);
        assert_eq!(
            serde_json::to_value(&msg).unwrap(),
            json!({ "type": "LOAD_FAILED", "requestId": 0 })
        );
    }

    #[test]
    fn empty_status_message_keeps_status_array() {
        let msg = OutboundMessage::status(RequestId(3), vec![]);
        assert_eq!(
            serde_json::to_value(&msg).unwrap(),
            json!({ "type": "MEDIA_STATUS", "requestId": 3, "status": [] })
        );
    }

    #[test]
    fn recognized_types_cover_preload() {
        assert!(RECOGNIZED_TYPES.contains("PRELOAD"));
        assert!(RECOGNIZED_TYPES.contains("CANCEL_PRELOAD"));
        assert!(!RECOGNIZED_TYPES.contains("MEDIA_STATUS"));
    }
}
