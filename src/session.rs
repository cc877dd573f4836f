//! Media session data model.
//!
//! A `MediaSession` is the receiver-side record of "what is loaded and how
//! it behaves": the loaded media descriptor, the play queue, ad-break
//! bookkeeping and the externally visible player state. Exactly one session
//! is live at a time; every successful LOAD / QUEUE_LOAD replaces it.

use crate::ads::{AdBreakClipInfo, AdBreakInfo, AdBreakStatus, AdMeta};
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;

/// Monotonically increasing session identifier, never reused within a
/// process lifetime.
pub type SessionId = i32;

/// Queue item identifier, unique within one session's queue.
pub type ItemId = i32;

/// Track identifier within `media.tracks`.
pub type TrackId = i32;

/// Bitmask of media commands supported by this receiver.
///
/// Expressed as a summation of the supported command flags.
pub mod command {
    pub const PAUSE: u32 = 1;
    pub const SEEK: u32 = 2;
    pub const STREAM_VOLUME: u32 = 4;
    pub const STREAM_MUTE: u32 = 8;
    pub const ALL_BASIC_MEDIA: u32 = PAUSE + SEEK + STREAM_VOLUME + STREAM_MUTE;
    pub const QUEUE_NEXT: u32 = 64;
    pub const QUEUE_PREV: u32 = 128;
    pub const QUEUE_SHUFFLE: u32 = 256;

    /// What this receiver reports in every session snapshot.
    pub const SUPPORTED_MEDIA_COMMANDS: u32 =
        ALL_BASIC_MEDIA + QUEUE_NEXT + QUEUE_PREV + QUEUE_SHUFFLE;
}

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PlayerState {
    Idle,
    Buffering,
    Playing,
    Paused,
}

/// Why the player is in the IDLE state.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IdleReason {
    Cancelled,
    Interrupted,
    Finished,
    Error,
}

#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RepeatMode {
    /// When the queue is completed the media session is terminated.
    #[default]
    RepeatOff,

    /// All items play indefinitely; after the last item the first plays
    /// again.
    RepeatAll,

    /// The current item plays repeatedly.
    RepeatSingle,

    /// Like `RepeatAll`, but the queue is shuffled in place each time the
    /// end is reached.
    RepeatAllAndShuffle,
}

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TrackType {
    Text,
    Audio,
    Video,
}

/// Follows the HTML5 text track type definitions.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TextTrackType {
    Subtitles,
    Captions,
    Descriptions,
    Chapters,
    Metadata,
}

/// Playback state requested after a SEEK completes.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SeekResumeState {
    PlaybackStart,
    PlaybackPause,
}

/// Content reference of a track.
///
/// Text tracks carry the sidecar URL / player caption id as a string;
/// audio tracks carry the player's track index.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(untagged)]
pub enum TrackContentId {
    Index(i64),
    Id(String),
}

impl TrackContentId {
    pub fn matches_str(&self, other: &str) -> bool {
        match self {
            TrackContentId::Id(s) => s == other,
            TrackContentId::Index(_) => false,
        }
    }

    pub fn as_index(&self) -> Option<i64> {
        match self {
            TrackContentId::Index(i) => Some(*i),
            TrackContentId::Id(_) => None,
        }
    }
}

#[skip_serializing_none]
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Track {
    pub track_id: TrackId,

    #[serde(rename = "type")]
    pub track_type: TrackType,

    pub track_content_id: Option<TrackContentId>,
    pub name: Option<String>,
    pub subtype: Option<TextTrackType>,
}

#[skip_serializing_none]
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Metadata {
    #[serde(default)]
    pub metadata_type: u32,
    pub title: Option<String>,
    pub subtitle: Option<String>,
    pub series_title: Option<String>,
    pub artist: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<Image>,
}

#[skip_serializing_none]
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Image {
    pub url: String,
    pub width: Option<u32>,
    pub height: Option<u32>,
}

/// One entry of an advertising schedule, keyed by break id in
/// `customData.advertising.schedule`.
#[skip_serializing_none]
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AdBreakSchedule {
    /// `"pre"`, `"post"`, `"NN%"`, `"mm:ss"` or plain seconds.
    pub offset: String,

    /// Ad tag; matched against the tag reported by ad metadata events.
    pub tag: Option<String>,
}

#[skip_serializing_none]
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Advertising {
    pub client: Option<String>,

    #[serde(default, skip_serializing_if = "std::collections::BTreeMap::is_empty")]
    pub schedule: std::collections::BTreeMap<String, AdBreakSchedule>,
}

/// Free-form side-channel data attached to a media descriptor.
///
/// Advertising and DRM settings arrive here; everything else is carried
/// through untouched.
#[skip_serializing_none]
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaCustomData {
    pub mediaid: Option<String>,
    pub advertising: Option<Advertising>,
    pub drm: Option<serde_json::Value>,

    #[serde(flatten, skip_serializing_if = "serde_json::Map::is_empty")]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl MediaCustomData {
    pub fn is_empty(&self) -> bool {
        self.mediaid.is_none()
            && self.advertising.is_none()
            && self.drm.is_none()
            && self.extra.is_empty()
    }
}

/// A media descriptor as loaded by a sender.
#[skip_serializing_none]
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Media {
    #[serde(default)]
    pub content_id: String,

    pub content_url: Option<String>,

    #[serde(default)]
    pub stream_type: String,

    #[serde(default)]
    pub content_type: String,

    pub metadata: Option<Metadata>,

    /// Total duration in seconds; 0 while unknown.
    #[serde(default)]
    pub duration: f64,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tracks: Vec<Track>,

    /// Ad break schedule, resolved lazily as duration becomes known.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub breaks: Vec<AdBreakInfo>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub break_clips: Vec<AdBreakClipInfo>,

    #[serde(default, skip_serializing_if = "MediaCustomData::is_empty")]
    pub custom_data: MediaCustomData,
}

impl Media {
    /// Next unused track id: highest existing id plus one, starting at 1.
    ///
    /// Recomputed per call so it stays correct across caption-list and
    /// audio-track discovery events arriving independently.
    pub fn next_track_id(&self) -> TrackId {
        self.tracks.iter().map(|t| t.track_id).max().unwrap_or(0) + 1
    }

    pub fn track_by_id(&self, track_id: TrackId) -> Option<&Track> {
        self.tracks.iter().find(|t| t.track_id == track_id)
    }
}

/// One entry in the play queue.
#[skip_serializing_none]
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueItem {
    /// Assigned by the receiver at insertion time, never by the sender.
    pub item_id: Option<ItemId>,

    #[serde(default)]
    pub media: Media,

    /// Absent means autoplay.
    pub autoplay: Option<bool>,

    pub start_time: Option<f64>,

    /// One-shot start position override; consumed by the next load of this
    /// item and never serialized.
    #[serde(skip)]
    pub start_time_override: Option<f64>,

    pub custom_data: Option<serde_json::Value>,
}

impl QueueItem {
    pub fn from_media(media: Media) -> QueueItem {
        QueueItem {
            item_id: None,
            media,
            autoplay: None,
            start_time: None,
            start_time_override: None,
            custom_data: None,
        }
    }

    pub fn autoplay(&self) -> bool {
        self.autoplay.unwrap_or(true)
    }
}

#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Volume {
    pub level: f64,
    pub muted: bool,
}

/// Session-level custom data; carries transient ad metadata while an ad
/// plays.
#[skip_serializing_none]
#[derive(Clone, Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionCustomData {
    pub ad_meta: Option<AdMeta>,
}

impl SessionCustomData {
    pub fn is_empty(&self) -> bool {
        self.ad_meta.is_none()
    }
}

/// The single currently active playback context, serialized as one entry
/// of the MEDIA_STATUS `status` array.
#[skip_serializing_none]
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaSession {
    pub media_session_id: SessionId,
    pub player_state: PlayerState,

    /// Set only while `player_state` is IDLE.
    pub idle_reason: Option<IdleReason>,

    pub current_time: f64,
    pub playback_rate: f32,
    pub supported_media_commands: u32,

    pub media: Option<Media>,

    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub items: Vec<QueueItem>,

    pub current_item_id: Option<ItemId>,
    pub repeat_mode: Option<RepeatMode>,

    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub active_track_ids: Vec<TrackId>,

    /// Present only while an ad break is actively playing.
    pub break_status: Option<AdBreakStatus>,

    pub volume: Option<Volume>,

    #[serde(skip_serializing_if = "SessionCustomData::is_empty")]
    pub custom_data: SessionCustomData,

    /// High-water mark of assigned queue item ids, so removed ids are
    /// never handed out again.
    #[serde(skip)]
    pub last_item_id: ItemId,
}

impl MediaSession {
    pub fn new(media_session_id: SessionId) -> MediaSession {
        MediaSession {
            media_session_id,
            player_state: PlayerState::Idle,
            idle_reason: None,
            current_time: 0.0,
            playback_rate: 1.0,
            supported_media_commands: command::SUPPORTED_MEDIA_COMMANDS,
            media: None,
            items: Vec::new(),
            current_item_id: None,
            repeat_mode: None,
            active_track_ids: Vec::new(),
            break_status: None,
            volume: None,
            custom_data: SessionCustomData::default(),
            last_item_id: 0,
        }
    }

    /// Position of `item_id` in the queue, or `None` when absent.
    ///
    /// Index 0 is a valid result; only a missing item maps to `None`.
    pub fn index_of_item(&self, item_id: ItemId) -> Option<usize> {
        self.items.iter().position(|it| it.item_id == Some(item_id))
    }

    /// Position of the currently loaded queue item.
    pub fn current_queue_index(&self) -> Option<usize> {
        self.current_item_id.and_then(|id| self.index_of_item(id))
    }

    /// Next unused queue item id, starting at 1. Ids are never reused,
    /// even after the highest item is removed from the queue.
    pub fn next_item_id(&self) -> ItemId {
        self.items
            .iter()
            .filter_map(|it| it.item_id)
            .max()
            .unwrap_or(0)
            .max(self.last_item_id)
            + 1
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn item(id: ItemId) -> QueueItem {
        let mut it = QueueItem::from_media(Media {
            content_id: format!("content-{id}"),
            ..Media::default()
        });
        it.item_id = Some(id);
        it
    }

    #[test]
    fn enum_wire_spellings() {
        assert_eq!(
            serde_json::to_value(PlayerState::Buffering).unwrap(),
            serde_json::json!("BUFFERING")
        );
        assert_eq!(
            serde_json::to_value(IdleReason::Cancelled).unwrap(),
            serde_json::json!("CANCELLED")
        );
        assert_eq!(
            serde_json::to_value(RepeatMode::RepeatAllAndShuffle).unwrap(),
            serde_json::json!("REPEAT_ALL_AND_SHUFFLE")
        );
        assert_eq!(
            serde_json::to_value(SeekResumeState::PlaybackStart).unwrap(),
            serde_json::json!("PLAYBACK_START")
        );
    }

    #[test]
    fn supported_commands_summation() {
        assert_eq!(command::SUPPORTED_MEDIA_COMMANDS, 15 + 64 + 128 + 256);
    }

    #[test]
    fn next_item_id_skips_removed_ids() {
        let mut session = MediaSession::new(1);
        assert_eq!(session.next_item_id(), 1);

        session.items = vec![item(1), item(2), item(5)];
        session.last_item_id = 5;
        assert_eq!(session.next_item_id(), 6);

        // Removing the highest id does not free it for reuse.
        session.items.pop();
        assert_eq!(session.next_item_id(), 6);
    }

    #[test]
    fn index_of_item_treats_zero_as_valid() {
        let mut session = MediaSession::new(1);
        session.items = vec![item(7), item(8)];
        assert_eq!(session.index_of_item(7), Some(0));
        assert_eq!(session.index_of_item(8), Some(1));
        assert_eq!(session.index_of_item(9), None);
    }

    #[test]
    fn snapshot_omits_absent_fields() {
        let session = MediaSession::new(3);
        let value = serde_json::to_value(&session).unwrap();
        let obj = value.as_object().unwrap();

        assert_eq!(obj["mediaSessionId"], serde_json::json!(3));
        assert_eq!(obj["playerState"], serde_json::json!("IDLE"));
        assert!(!obj.contains_key("idleReason"));
        assert!(!obj.contains_key("items"));
        assert!(!obj.contains_key("activeTrackIds"));
        assert!(!obj.contains_key("breakStatus"));
        assert!(!obj.contains_key("customData"));
    }

    #[test]
    fn queue_item_autoplay_defaults_to_true() {
        let json = serde_json::json!({ "media": { "contentId": "a" } });
        let it: QueueItem = serde_json::from_value(json).unwrap();
        assert!(it.autoplay());

        let json = serde_json::json!({
            "media": { "contentId": "a" },
            "autoplay": false,
        });
        let it: QueueItem = serde_json::from_value(json).unwrap();
        assert!(!it.autoplay());
    }

    #[test]
    fn track_content_id_matching() {
        let id = TrackContentId::Id("captions-en.vtt".into());
        assert!(id.matches_str("captions-en.vtt"));
        assert!(!id.matches_str("captions-de.vtt"));
        assert_eq!(id.as_index(), None);

        let idx = TrackContentId::Index(2);
        assert_eq!(idx.as_index(), Some(2));
        assert!(!idx.matches_str("2"));
    }

    #[test]
    fn media_custom_data_round_trip() {
        let json = serde_json::json!({
            "mediaid": "m-1",
            "advertising": {
                "client": "vast",
                "schedule": {
                    "break-1": { "offset": "pre", "tag": "https://ads/1" },
                },
            },
            "analytics": { "label": "x" },
        });
        let cd: MediaCustomData = serde_json::from_value(json).unwrap();
        let advertising = cd.advertising.as_ref().unwrap();
        assert_eq!(advertising.client.as_deref(), Some("vast"));
        assert_eq!(advertising.schedule["break-1"].offset, "pre");
        assert!(cd.extra.contains_key("analytics"));
    }
}
