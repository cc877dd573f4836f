//! Boundary between session management and the underlying media player.
//!
//! The manager drives the player only through [`PlayerAdapter`] and learns
//! about playback only through [`PlayerEvent`] values. Every event is
//! tagged with the session id it belongs to; the manager discards events
//! from sessions that are no longer current.

use crate::ads::AdMeta;
use crate::session::SessionId;

/// Sentinel caption index meaning "captions off". Player caption lists
/// put the off entry at index 0, so real tracks start at 1.
pub const TRACK_DISABLED: usize = 0;

/// Everything the player needs to start playback of one media item.
#[derive(Clone, Debug, Default)]
pub struct PlayerSetup {
    pub content_id: String,
    pub content_url: Option<String>,
    pub content_type: String,
    pub autostart: bool,
    pub ad_client: Option<String>,
    pub ad_schedule: Option<serde_json::Value>,
    pub drm: Option<serde_json::Value>,
    pub text_tracks: Vec<SideloadedTrack>,
}

/// A sidecar text track handed to the player at setup.
#[derive(Clone, Debug)]
pub struct SideloadedTrack {
    pub url: String,
    pub label: Option<String>,
}

/// One entry of the player's caption list. Index 0 is the off entry.
#[derive(Clone, Debug, PartialEq)]
pub struct CaptionTrack {
    pub id: String,
    pub label: Option<String>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct AudioTrack {
    pub name: Option<String>,
}

/// Commands the session layer issues to the player.
///
/// Commands are fire-and-forget; outcomes come back as [`PlayerEvent`]s.
/// The `force` flag on play and pause marks receiver-originated calls
/// that must apply even during ad playback.
pub trait PlayerAdapter: Send {
    fn setup(&mut self, setup: PlayerSetup, session_id: SessionId);
    fn play(&mut self, force: bool);
    fn pause(&mut self, force: bool);
    fn stop(&mut self);
    fn seek(&mut self, position: f64);

    /// Volume in percent, 0 to 100.
    fn set_volume(&mut self, level: u32);
    fn set_mute(&mut self, mute: bool);

    fn caption_list(&self) -> Vec<CaptionTrack>;
    fn current_captions(&self) -> usize;
    fn set_current_captions(&mut self, index: usize);

    /// Index of the active audio track, or -1 when none is reported.
    fn current_audio_track(&self) -> i64;
    fn set_current_audio_track(&mut self, index: i64);
}

#[derive(Clone, Debug)]
pub struct PlayerEvent {
    /// Session the player was set up with when it emitted this event.
    pub session_id: SessionId,
    pub kind: PlayerEventKind,
}

#[derive(Clone, Debug)]
pub enum PlayerEventKind {
    /// Player finished setup and can accept seeks.
    Ready,

    Buffer,
    Idle,
    Pause,
    Play,

    Time { position: f64, duration: f64 },
    Seek { position: Option<f64> },
    Seeked,
    Complete,

    SetupError { message: String },
    MediaError { message: String },

    CaptionList {
        tracks: Vec<CaptionTrack>,
        current: usize,
    },
    AudioTracks { tracks: Vec<AudioTrack> },

    /// Native ad metadata raised when an ad clip begins.
    AdMeta { meta: AdMeta },

    /// Synthesized ad impression carrying the same metadata shape.
    AdImpression { meta: AdMeta },

    AdPlay,
    AdPause,
    AdTime { position: f64, duration: f64 },
    AdComplete { clip_id: String },
    AdError { message: String },
}

impl PlayerEvent {
    pub fn new(session_id: SessionId, kind: PlayerEventKind) -> PlayerEvent {
        PlayerEvent { session_id, kind }
    }
}
