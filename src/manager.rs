//! Media session manager.
//!
//! One `MediaManager` owns the single live media session, the play queue
//! and the ad bookkeeping. All mutation happens on one task: commands,
//! player events and expired timers are handled to completion, one at a
//! time, by [`ReceiverTask::main`]. Nothing in here blocks; work that has
//! to wait for the player is parked as a pending load or a deferred
//! action and picked up when the matching signal arrives.

use futures::StreamExt;
use rand::Rng;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::time::DelayQueue;
use tracing::{debug, error, info, trace, warn};

use crate::ads::{self, AdBreakClipInfo, AdBreakStatus, AdMeta, NOT_SKIPPABLE};
use crate::events::{topic, BusEvent, EventBus};
use crate::payload::{
    CommandEnvelope, EditTracksInfoRequestData, ErrorReason, ErrorType, GenericRequestData,
    LoadRequestData, OutboundMessage, QueueInsertRequestData, QueueLoadRequestData,
    QueueRemoveRequestData, QueueReorderRequestData, QueueUpdateRequestData, RequestId,
    SeekRequestData, SetVolumeRequestData, MESSAGE_TYPE_CANCEL_PRELOAD,
    MESSAGE_TYPE_EDIT_TRACKS_INFO, MESSAGE_TYPE_GET_STATUS, MESSAGE_TYPE_LOAD,
    MESSAGE_TYPE_PAUSE, MESSAGE_TYPE_PLAY, MESSAGE_TYPE_PRELOAD, MESSAGE_TYPE_QUEUE_INSERT,
    MESSAGE_TYPE_QUEUE_LOAD, MESSAGE_TYPE_QUEUE_REMOVE, MESSAGE_TYPE_QUEUE_REORDER,
    MESSAGE_TYPE_QUEUE_UPDATE, MESSAGE_TYPE_SEEK, MESSAGE_TYPE_SET_VOLUME, MESSAGE_TYPE_STOP,
};
use crate::player::{
    AudioTrack, CaptionTrack, PlayerAdapter, PlayerEvent, PlayerEventKind, PlayerSetup,
    SideloadedTrack, TRACK_DISABLED,
};
use crate::session::{
    IdleReason, MediaSession, PlayerState, QueueItem, RepeatMode, SessionId, Track,
    TrackContentId, TrackType, TextTrackType, Volume,
};
use crate::transport::{ChannelAdapter, MessageOutbox, TransportEvent};
use crate::Result;

/// How long a media error is shown before the queue advances past the
/// broken item.
pub const ERROR_RECOVERY_TIMEOUT: Duration = Duration::from_millis(5000);

/// How long the receiver idles without playback or sender commands before
/// shutting down.
pub const INACTIVITY_TIMEOUT: Duration = Duration::from_secs(20 * 60);

/// A load whose completion waits on the player. Resolved by the first
/// timing signal of the same session, or failed by a setup error.
#[derive(Clone, Debug)]
struct PendingLoad {
    session_id: SessionId,
    sender_id: Option<String>,
    request_id: Option<RequestId>,
}

/// Work the manager wants executed later. Each action carries the session
/// it was scheduled for and is dropped if that session is gone by the
/// time it fires.
#[derive(Clone, Copy, Debug)]
pub enum DeferredAction {
    AdvanceAfterError { session_id: SessionId },
}

#[derive(Clone, Copy, Debug)]
pub struct ScheduledAction {
    pub delay: Duration,
    pub action: DeferredAction,
}

pub struct MediaManager<M: MessageOutbox, P: PlayerAdapter> {
    outbox: M,
    player: P,
    events: EventBus,

    status: Option<MediaSession>,
    last_session_id: SessionId,

    /// Request id of the most recent session-scoped command, echoed by the
    /// next status message and reset afterwards.
    current_request_id: RequestId,

    is_loading: bool,
    pending_load: Option<PendingLoad>,
    pending_seek_request_id: Option<RequestId>,
    pending_start_time: Option<f64>,

    player_attached: bool,

    /// Wall-clock start of the current ad pod.
    ad_pod_start: Option<Instant>,

    scheduled: Vec<ScheduledAction>,
    activity: bool,
}

impl<M: MessageOutbox, P: PlayerAdapter> MediaManager<M, P> {
    pub fn new(outbox: M, player: P) -> MediaManager<M, P> {
        MediaManager {
            outbox,
            player,
            events: EventBus::new(),
            status: None,
            last_session_id: 0,
            current_request_id: RequestId::NONE,
            is_loading: false,
            pending_load: None,
            pending_seek_request_id: None,
            pending_start_time: None,
            player_attached: false,
            ad_pod_start: None,
            scheduled: Vec::new(),
            activity: false,
        }
    }

    pub fn events_mut(&mut self) -> &mut EventBus {
        &mut self.events
    }

    pub fn outbox_mut(&mut self) -> &mut M {
        &mut self.outbox
    }

    pub fn player_state(&self) -> Option<PlayerState> {
        self.status.as_ref().map(|st| st.player_state)
    }

    /// Timer requests produced since the last call.
    pub fn take_scheduled(&mut self) -> Vec<ScheduledAction> {
        std::mem::take(&mut self.scheduled)
    }

    /// Whether anything happened since the last call that should reset the
    /// inactivity watchdog.
    pub fn take_activity(&mut self) -> bool {
        std::mem::take(&mut self.activity)
    }

    pub fn shutdown(&mut self) {
        if self.player_attached {
            self.player.stop();
        }
    }

    // ---- Command dispatch ----------------------------------------------

    pub fn dispatch(&mut self, envelope: CommandEnvelope) {
        let Some(typ) = envelope.typ.clone() else {
            warn!(sender = ?envelope.sender_id, "message without type");
            self.send_error(
                &envelope,
                ErrorType::InvalidRequest,
                Some(ErrorReason::InvalidCommand),
            );
            return;
        };
        debug!(typ, sender = ?envelope.sender_id, "command received");

        if typ != MESSAGE_TYPE_GET_STATUS {
            self.activity = true;
            self.events.publish(
                topic::USER_ACTIVITY,
                BusEvent::UserActivity {
                    command: typ.clone(),
                },
            );
        }

        // These three are valid without a live session.
        match typ.as_str() {
            MESSAGE_TYPE_LOAD => return self.on_load(envelope),
            MESSAGE_TYPE_QUEUE_LOAD => return self.on_queue_load(envelope),
            MESSAGE_TYPE_GET_STATUS => return self.on_get_status(envelope),
            _ => {}
        }

        if self.status.is_none() {
            self.send_error(&envelope, ErrorType::InvalidPlayerState, None);
            return;
        }

        if let Some(request_id) = envelope.request_id() {
            if !request_id.is_none() && request_id == self.current_request_id {
                self.send_error(
                    &envelope,
                    ErrorType::InvalidRequest,
                    Some(ErrorReason::DuplicateRequestId),
                );
                return;
            }
            self.current_request_id = request_id;
        }

        match typ.as_str() {
            MESSAGE_TYPE_STOP => self.on_stop(envelope),
            MESSAGE_TYPE_PAUSE => self.on_pause(envelope),
            MESSAGE_TYPE_PLAY => self.on_play(envelope),
            MESSAGE_TYPE_SEEK => self.on_seek(envelope),
            MESSAGE_TYPE_SET_VOLUME => self.on_set_volume(envelope),
            MESSAGE_TYPE_EDIT_TRACKS_INFO => self.on_edit_tracks_info(envelope),
            MESSAGE_TYPE_QUEUE_INSERT => self.on_queue_insert(envelope),
            MESSAGE_TYPE_QUEUE_UPDATE => self.on_queue_update(envelope),
            MESSAGE_TYPE_QUEUE_REMOVE => self.on_queue_remove(envelope),
            MESSAGE_TYPE_QUEUE_REORDER => self.on_queue_reorder(envelope),
            MESSAGE_TYPE_PRELOAD | MESSAGE_TYPE_CANCEL_PRELOAD => {
                self.send_error(
                    &envelope,
                    ErrorType::InvalidRequest,
                    Some(ErrorReason::InvalidCommand),
                );
            }
            _ => {
                debug_assert!(!crate::payload::RECOGNIZED_TYPES.contains(typ.as_str()));
                warn!(typ, "unrecognized command");
                self.send_error(
                    &envelope,
                    ErrorType::InvalidRequest,
                    Some(ErrorReason::InvalidCommand),
                );
            }
        }
    }

    fn on_load(&mut self, envelope: CommandEnvelope) {
        let Some(data) = self.parse::<LoadRequestData>(&envelope) else {
            return;
        };

        self.cancel_pending_load();
        self.create_media_session();

        let mut item = QueueItem::from_media(data.media);
        item.autoplay = data.autoplay;
        item.start_time = data.current_time;
        item.custom_data = data.custom_data;

        self.events.publish(
            topic::QUEUE_LOAD,
            BusEvent::QueueLoad {
                items: vec![item.clone()],
                repeat_mode: None,
            },
        );

        let request_id = data.request_id.or_else(|| envelope.request_id());
        self.load_item(item, envelope.sender_id, request_id);
    }

    fn on_queue_load(&mut self, envelope: CommandEnvelope) {
        let Some(data) = self.parse::<QueueLoadRequestData>(&envelope) else {
            return;
        };
        let start_index = data.start_index.unwrap_or(0);
        if data.items.is_empty() || start_index >= data.items.len() {
            self.send_error_invalid_params(&envelope);
            return;
        }

        self.cancel_pending_load();
        self.create_media_session();

        let repeat_mode = data.repeat_mode.unwrap_or_default();
        let items = {
            let Some(st) = self.status.as_mut() else {
                return;
            };
            let mut items = data.items;
            for (index, item) in items.iter_mut().enumerate() {
                item.item_id = Some(index as i32 + 1);
            }
            st.last_item_id = items.len() as i32;
            st.items = items;
            st.repeat_mode = Some(repeat_mode);
            st.items.clone()
        };

        self.events.publish(
            topic::QUEUE_LOAD,
            BusEvent::QueueLoad {
                items,
                repeat_mode: Some(repeat_mode),
            },
        );

        let request_id = data.request_id.or_else(|| envelope.request_id());
        self.load_item_at(start_index, envelope.sender_id, request_id);
    }

    fn on_get_status(&mut self, envelope: CommandEnvelope) {
        let request_id = envelope.request_id();
        self.send_status(envelope.sender_id.as_deref(), request_id);
    }

    fn on_stop(&mut self, envelope: CommandEnvelope) {
        if !self.player_attached {
            self.send_error(&envelope, ErrorType::InvalidPlayerState, None);
            return;
        }
        self.player.stop();
        self.pending_load = None;
        self.is_loading = false;
        if let Some(st) = self.status.as_mut() {
            st.player_state = PlayerState::Idle;
            st.idle_reason = Some(IdleReason::Cancelled);
            st.break_status = None;
            st.custom_data.ad_meta = None;
        }
        info!("playback stopped by sender");
        self.broadcast_status(None);
    }

    fn on_pause(&mut self, envelope: CommandEnvelope) {
        let Some(_data) = self.parse::<GenericRequestData>(&envelope) else {
            return;
        };
        self.player.pause(true);
        // During an ad break the player reports ad events instead of
        // content state, so the visible state is forced here.
        self.force_state_during_ad(PlayerState::Paused);
    }

    fn on_play(&mut self, envelope: CommandEnvelope) {
        let Some(_data) = self.parse::<GenericRequestData>(&envelope) else {
            return;
        };
        self.player.play(true);
        self.force_state_during_ad(PlayerState::Playing);
    }

    fn force_state_during_ad(&mut self, state: PlayerState) {
        let ad_active = self
            .status
            .as_ref()
            .is_some_and(|st| st.break_status.is_some());
        if !ad_active {
            return;
        }
        if let Some(st) = self.status.as_mut() {
            st.player_state = state;
        }
        self.broadcast_status(None);
    }

    fn on_seek(&mut self, envelope: CommandEnvelope) {
        let Some(data) = self.parse::<SeekRequestData>(&envelope) else {
            return;
        };
        let Some(position) = data.current_time else {
            self.send_error_invalid_params(&envelope);
            return;
        };

        if position >= 0.0 {
            self.pending_seek_request_id = data.request_id.or_else(|| envelope.request_id());
            self.player.seek(position);
        }

        if let Some(resume) = data.resume_state {
            match resume {
                crate::session::SeekResumeState::PlaybackStart => self.player.play(true),
                crate::session::SeekResumeState::PlaybackPause => self.player.pause(true),
            }
        }
    }

    fn on_set_volume(&mut self, envelope: CommandEnvelope) {
        let Some(data) = self.parse::<SetVolumeRequestData>(&envelope) else {
            return;
        };

        if let Some(level) = data.volume.level {
            let percent = (level.clamp(0.0, 1.0) * 100.0).round() as u32;
            self.player.set_volume(percent);
        }
        if let Some(muted) = data.volume.muted {
            self.player.set_mute(muted);
        }

        if let Some(st) = self.status.as_mut() {
            let mut volume = st.volume.unwrap_or(Volume {
                level: 1.0,
                muted: false,
            });
            if let Some(level) = data.volume.level {
                volume.level = level.clamp(0.0, 1.0);
            }
            if let Some(muted) = data.volume.muted {
                volume.muted = muted;
            }
            st.volume = Some(volume);
        }
        self.broadcast_status(None);
    }

    fn on_edit_tracks_info(&mut self, envelope: CommandEnvelope) {
        let Some(data) = self.parse::<EditTracksInfoRequestData>(&envelope) else {
            return;
        };

        if let Some(active_ids) = data.active_track_ids {
            let tracks: Vec<Track> = {
                let Some(st) = self.status.as_ref() else {
                    return;
                };
                let media_tracks = st.media.as_ref().map(|m| &m.tracks);
                active_ids
                    .iter()
                    .filter_map(|id| {
                        let found = media_tracks
                            .and_then(|ts| ts.iter().find(|t| t.track_id == *id))
                            .cloned();
                        if found.is_none() {
                            warn!(track_id = id, "ignoring unknown track id");
                        }
                        found
                    })
                    .collect()
            };

            let mut keep_captions = false;
            for track in tracks {
                match track.track_type {
                    TrackType::Text => {
                        let captions = self.player.caption_list();
                        let index = captions.iter().position(|c| {
                            track
                                .track_content_id
                                .as_ref()
                                .is_some_and(|id| id.matches_str(&c.id))
                        });
                        if let Some(index) = index {
                            keep_captions = true;
                            if self.player.current_captions() != index {
                                self.player.set_current_captions(index);
                            }
                        }
                    }
                    TrackType::Audio => {
                        if let Some(index) =
                            track.track_content_id.as_ref().and_then(|c| c.as_index())
                        {
                            if self.player.current_audio_track() != index {
                                self.player.set_current_audio_track(index);
                            }
                        }
                    }
                    TrackType::Video => {}
                }
            }

            if !keep_captions && self.player_attached {
                self.player.set_current_captions(TRACK_DISABLED);
            }
        }

        self.broadcast_status(None);
    }

    // ---- Queue commands ------------------------------------------------

    fn on_queue_insert(&mut self, envelope: CommandEnvelope) {
        let Some(data) = self.parse::<QueueInsertRequestData>(&envelope) else {
            return;
        };
        if data.items.is_empty() {
            self.send_error_invalid_params(&envelope);
            return;
        }

        let anchor_index = {
            let Some(st) = self.status.as_ref() else {
                return;
            };
            match data.insert_before {
                None => Ok(None),
                Some(anchor) => st.index_of_item(anchor).map(Some).ok_or(()),
            }
        };
        let anchor_index = match anchor_index {
            Ok(index) => index,
            Err(()) => {
                self.send_error_invalid_params(&envelope);
                return;
            }
        };

        let (items, current_item_id) = {
            let Some(st) = self.status.as_mut() else {
                return;
            };
            let mut next_id = st.next_item_id();
            let mut incoming = data.items;
            for item in &mut incoming {
                item.item_id = Some(next_id);
                next_id += 1;
            }
            st.last_item_id = next_id - 1;
            match anchor_index {
                Some(index) => {
                    st.items.splice(index..index, incoming);
                }
                None => st.items.extend(incoming),
            }
            (st.items.clone(), st.current_item_id)
        };
        self.events
            .publish(topic::QUEUE_UPDATE, BusEvent::QueueUpdate { items });

        if let Some(index) = data.current_item_index {
            let len = self.status.as_ref().map(|st| st.items.len()).unwrap_or(0);
            if index >= len {
                self.send_error_invalid_params(&envelope);
                return;
            }
            self.set_start_override(index, data.current_time);
            self.load_item_at(index, None, None);
        } else if let Some(item_id) = data.current_item_id {
            if Some(item_id) != current_item_id {
                let index = self.status.as_ref().and_then(|st| st.index_of_item(item_id));
                let Some(index) = index else {
                    self.send_error_invalid_params(&envelope);
                    return;
                };
                self.set_start_override(index, data.current_time);
                self.load_item_at(index, None, None);
            } else {
                self.broadcast_status(None);
            }
        } else {
            self.broadcast_status(None);
        }
    }

    fn on_queue_update(&mut self, envelope: CommandEnvelope) {
        let Some(data) = self.parse::<QueueUpdateRequestData>(&envelope) else {
            return;
        };

        if let Some(repeat_mode) = data.repeat_mode {
            if let Some(st) = self.status.as_mut() {
                st.repeat_mode = Some(repeat_mode);
            }
        }

        if let Some(item_id) = data.current_item_id {
            let index = self.status.as_ref().and_then(|st| st.index_of_item(item_id));
            let Some(index) = index else {
                self.send_error_invalid_params(&envelope);
                return;
            };
            self.set_start_override(index, data.current_time);
            self.load_item_at(index, None, None);
            return;
        }

        if let Some(jump) = data.jump.filter(|j| *j != 0) {
            let target = {
                let Some(st) = self.status.as_ref() else {
                    return;
                };
                match (st.current_queue_index(), st.items.len()) {
                    (Some(current), len) if len > 0 => {
                        Some((current as i64 + jump).rem_euclid(len as i64) as usize)
                    }
                    _ => None,
                }
            };
            if let Some(index) = target {
                self.set_start_override(index, data.current_time);
                self.load_item_at(index, None, None);
                return;
            }
        }

        self.broadcast_status(None);
    }

    fn on_queue_remove(&mut self, envelope: CommandEnvelope) {
        let Some(data) = self.parse::<QueueRemoveRequestData>(&envelope) else {
            return;
        };
        let Some(item_ids) = data.item_ids.filter(|ids| !ids.is_empty()) else {
            self.send_error_invalid_params(&envelope);
            return;
        };

        let had_items = self.status.as_ref().is_some_and(|st| !st.items.is_empty());
        if !had_items {
            self.send_error(&envelope, ErrorType::InvalidPlayerState, None);
            return;
        }

        let (items, current_item_id) = {
            let Some(st) = self.status.as_mut() else {
                return;
            };
            for id in &item_ids {
                if let Some(index) = st.index_of_item(*id) {
                    st.items.remove(index);
                }
            }
            (st.items.clone(), st.current_item_id)
        };
        self.events
            .publish(topic::QUEUE_UPDATE, BusEvent::QueueUpdate { items });

        let switch_to = data
            .current_item_id
            .filter(|id| Some(*id) != current_item_id);
        if let Some(item_id) = switch_to {
            let index = self.status.as_ref().and_then(|st| st.index_of_item(item_id));
            let Some(index) = index else {
                self.send_error_invalid_params(&envelope);
                return;
            };
            self.set_start_override(index, data.current_time);
            self.load_item_at(index, None, None);
            return;
        }

        let current_removed = self
            .status
            .as_ref()
            .is_some_and(|st| st.current_queue_index().is_none());
        if current_removed {
            if self.player_attached {
                self.player.stop();
            }
            if let Some(st) = self.status.as_mut() {
                st.current_item_id = None;
                st.player_state = PlayerState::Idle;
                st.idle_reason = Some(IdleReason::Cancelled);
            }
        }
        self.broadcast_status(None);
    }

    fn on_queue_reorder(&mut self, envelope: CommandEnvelope) {
        let Some(data) = self.parse::<QueueReorderRequestData>(&envelope) else {
            return;
        };
        let Some(item_ids) = data.item_ids else {
            self.send_error(
                &envelope,
                ErrorType::InvalidRequest,
                Some(ErrorReason::InvalidCommand),
            );
            return;
        };

        if let Some(anchor) = data.insert_before {
            let known = self
                .status
                .as_ref()
                .is_some_and(|st| st.index_of_item(anchor).is_some());
            if !known {
                self.send_error_invalid_params(&envelope);
                return;
            }
        }

        let items = {
            let Some(st) = self.status.as_mut() else {
                return;
            };
            // Moved one at a time, preserving the relative order of the
            // listed items: each lands just before the anchor's position
            // at that moment, or at the tail without an anchor.
            for id in item_ids {
                let Some(from) = st.index_of_item(id) else {
                    continue;
                };
                let item = st.items.remove(from);
                let to = match data.insert_before {
                    Some(anchor) => st.index_of_item(anchor).unwrap_or(st.items.len()),
                    None => st.items.len(),
                };
                st.items.insert(to, item);
            }
            st.items.clone()
        };
        self.events
            .publish(topic::QUEUE_UPDATE, BusEvent::QueueUpdate { items });
        self.broadcast_status(None);
    }

    // ---- Loading -------------------------------------------------------

    fn create_media_session(&mut self) {
        if self.player_attached {
            self.player.stop();
        }
        self.last_session_id += 1;
        self.pending_load = None;
        self.pending_seek_request_id = None;
        self.pending_start_time = None;
        self.ad_pod_start = None;
        self.is_loading = false;
        self.status = Some(MediaSession::new(self.last_session_id));
        debug!(session = self.last_session_id, "created media session");
    }

    /// Sends the superseded load's LOAD_CANCELLED error, if one is in
    /// flight. Last load wins.
    fn cancel_pending_load(&mut self) {
        if !self.is_loading {
            return;
        }
        let pending = self.pending_load.take();
        self.is_loading = false;
        let request_id = pending
            .as_ref()
            .and_then(|p| p.request_id)
            .unwrap_or(RequestId::NONE);
        info!(%request_id, "cancelling superseded load");
        let message = OutboundMessage::error(ErrorType::LoadCancelled, request_id, None);
        match pending.and_then(|p| p.sender_id) {
            Some(sender) => self.outbox.send_to(&sender, &message),
            None => self.outbox.broadcast(&message),
        }
    }

    fn set_start_override(&mut self, index: usize, position: Option<f64>) {
        let Some(position) = position else {
            return;
        };
        if let Some(item) = self
            .status
            .as_mut()
            .and_then(|st| st.items.get_mut(index))
        {
            item.start_time_override = Some(position);
        }
    }

    /// Loads the queue item at `index`, consuming its one-shot start
    /// override.
    fn load_item_at(&mut self, index: usize, sender_id: Option<String>, request_id: Option<RequestId>) {
        let item = {
            let Some(st) = self.status.as_mut() else {
                return;
            };
            let Some(slot) = st.items.get_mut(index) else {
                return;
            };
            let override_position = slot.start_time_override.take();
            let mut item = slot.clone();
            item.start_time_override = override_position;
            item
        };
        self.load_item(item, sender_id, request_id);
    }

    fn load_item(&mut self, item: QueueItem, sender_id: Option<String>, request_id: Option<RequestId>) {
        self.events.publish(
            topic::MEDIA_LOAD,
            BusEvent::MediaLoad { item: item.clone() },
        );

        let autostart = item.autoplay();
        let mut media = item.media.clone();
        let content_id = media.content_id.clone();

        let schedule = media
            .custom_data
            .advertising
            .as_ref()
            .map(|a| a.schedule.clone())
            .unwrap_or_default();
        let known_duration = if media.duration > 0.0 {
            Some(media.duration)
        } else {
            None
        };
        media.break_clips.clear();
        media.breaks = match known_duration {
            Some(duration) => ads::resolve_schedule(&schedule, Some(duration)),
            None => Vec::new(),
        };
        let pre_roll = ads::has_pre_roll(&schedule);

        let setup = PlayerSetup {
            content_id: content_id.clone(),
            content_url: media.content_url.clone(),
            content_type: media.content_type.clone(),
            autostart,
            ad_client: media
                .custom_data
                .advertising
                .as_ref()
                .and_then(|a| a.client.clone()),
            ad_schedule: if schedule.is_empty() {
                None
            } else {
                serde_json::to_value(&schedule).ok()
            },
            drm: media.custom_data.drm.clone(),
            text_tracks: media
                .tracks
                .iter()
                .filter(|t| t.track_type == TrackType::Text)
                .filter_map(|t| match &t.track_content_id {
                    Some(TrackContentId::Id(url)) => Some(SideloadedTrack {
                        url: url.clone(),
                        label: t.name.clone(),
                    }),
                    _ => None,
                })
                .collect(),
        };

        let session_id = {
            let Some(st) = self.status.as_mut() else {
                return;
            };
            st.current_time = 0.0;
            self.pending_start_time = None;
            if let Some(position) = item.start_time_override.or(item.start_time) {
                st.current_time = position;
                self.pending_start_time = Some(position);
            }
            st.player_state = if autostart {
                PlayerState::Buffering
            } else {
                PlayerState::Paused
            };
            st.idle_reason = None;
            st.current_item_id = item.item_id;
            st.active_track_ids.clear();
            st.break_status = None;
            st.custom_data.ad_meta = None;
            st.media = Some(media);
            st.media_session_id
        };

        info!(session = session_id, content = %content_id, autostart, "loading media item");
        self.player.setup(setup, session_id);
        self.player_attached = true;

        self.is_loading = true;
        self.pending_load = Some(PendingLoad {
            session_id,
            sender_id,
            request_id,
        });

        // A pre-roll ad starts before the content ever reports a duration;
        // waiting on a timing signal would deadlock the load.
        if pre_roll && known_duration.is_none() {
            self.resolve_pending_load();
        }
    }

    fn resolve_pending_load(&mut self) {
        let Some(pending) = self.pending_load.take() else {
            return;
        };
        self.is_loading = false;

        if let Some(media) = self.status.as_ref().and_then(|st| st.media.clone()) {
            self.events
                .publish(topic::MEDIA_LOADED, BusEvent::MediaLoaded { media });
        }

        match pending.sender_id {
            Some(sender) => self.send_status(Some(&sender), pending.request_id),
            None => self.broadcast_status(pending.request_id),
        }
    }

    // ---- Queue advancement ---------------------------------------------

    /// The item that would play after the current one, without mutating
    /// the queue.
    fn next_item_in_queue(&self) -> Option<QueueItem> {
        let st = self.status.as_ref()?;
        if st.items.is_empty() {
            return None;
        }
        let index = st.current_queue_index();
        match st.repeat_mode.unwrap_or_default() {
            RepeatMode::RepeatOff => st.items.get(1).cloned(),
            RepeatMode::RepeatAll => index.map(|i| st.items[(i + 1) % st.items.len()].clone()),
            RepeatMode::RepeatSingle => index.map(|i| st.items[i].clone()),
            RepeatMode::RepeatAllAndShuffle => index.and_then(|i| st.items.get(i + 1).cloned()),
        }
    }

    fn load_next_media_item(&mut self) {
        enum Next {
            Load(usize),
            Restart,
            Finished,
            Nothing,
        }

        let next = {
            let Some(st) = self.status.as_mut() else {
                return;
            };
            if st.items.is_empty() {
                Next::Nothing
            } else {
                match st.repeat_mode.unwrap_or_default() {
                    RepeatMode::RepeatOff => {
                        st.items.remove(0);
                        if st.items.is_empty() {
                            Next::Finished
                        } else {
                            Next::Load(0)
                        }
                    }
                    RepeatMode::RepeatAll => match st.current_queue_index() {
                        Some(index) => Next::Load((index + 1) % st.items.len()),
                        None => Next::Nothing,
                    },
                    RepeatMode::RepeatSingle => Next::Restart,
                    RepeatMode::RepeatAllAndShuffle => match st.current_queue_index() {
                        Some(index) if index + 1 < st.items.len() => Next::Load(index + 1),
                        Some(_) => {
                            let mut rng = rand::thread_rng();
                            for i in (1..st.items.len()).rev() {
                                st.items.swap(i, rng.gen_range(0..=i));
                            }
                            Next::Load(0)
                        }
                        None => Next::Nothing,
                    },
                }
            }
        };

        match next {
            Next::Load(index) => self.load_item_at(index, None, None),
            Next::Restart => {
                self.player.seek(0.0);
                self.player.play(true);
            }
            Next::Finished => {
                if let Some(st) = self.status.as_mut() {
                    st.player_state = PlayerState::Idle;
                    st.idle_reason = Some(IdleReason::Finished);
                }
                info!("queue finished");
                self.broadcast_status(None);
            }
            Next::Nothing => {}
        }
    }

    // ---- Player events -------------------------------------------------

    pub fn handle_player_event(&mut self, event: PlayerEvent) {
        let Some(current) = self.status.as_ref().map(|st| st.media_session_id) else {
            trace!(?event, "player event without session");
            return;
        };
        if event.session_id != current {
            debug!(
                event_session = event.session_id,
                current, "discarding stale player event"
            );
            return;
        }

        match event.kind {
            PlayerEventKind::Ready => {
                self.events.publish(topic::READY, BusEvent::Ready);
                if let Some(position) = self.pending_start_time.take() {
                    self.player.seek(position);
                }
            }
            PlayerEventKind::Buffer => self.update_player_state(PlayerState::Buffering, false),
            PlayerEventKind::Idle => self.update_player_state(PlayerState::Idle, false),
            PlayerEventKind::Pause => self.update_player_state(PlayerState::Paused, false),
            PlayerEventKind::Play => self.update_player_state(PlayerState::Playing, false),
            PlayerEventKind::Time { position, duration } => self.handle_time(position, duration),
            PlayerEventKind::Seek { position } => {
                self.events
                    .publish(topic::MEDIA_SEEK, BusEvent::MediaSeek { position });
            }
            PlayerEventKind::Seeked => self.handle_seeked(),
            PlayerEventKind::Complete => self.handle_complete(),
            PlayerEventKind::SetupError { message } => {
                if let Some(pending) = self.pending_load.take() {
                    if let Some(request_id) = pending.request_id {
                        self.current_request_id = request_id;
                    }
                }
                self.handle_setup_error(&message);
            }
            PlayerEventKind::MediaError { message } => self.handle_media_error(&message),
            PlayerEventKind::CaptionList { tracks, current } => {
                self.handle_caption_list(tracks, current)
            }
            PlayerEventKind::AudioTracks { tracks } => self.handle_audio_tracks(tracks),
            PlayerEventKind::AdMeta { meta } | PlayerEventKind::AdImpression { meta } => {
                self.handle_ad_meta(meta)
            }
            PlayerEventKind::AdPlay => {
                self.events.publish(topic::AD_PLAY, BusEvent::AdPlay);
                self.update_player_state(PlayerState::Playing, true);
            }
            PlayerEventKind::AdPause => {
                self.events.publish(topic::AD_PAUSE, BusEvent::AdPause);
                self.update_player_state(PlayerState::Paused, true);
            }
            PlayerEventKind::AdTime { position, duration } => {
                self.handle_ad_time(position, duration)
            }
            PlayerEventKind::AdComplete { clip_id } => self.handle_ad_complete(clip_id),
            PlayerEventKind::AdError { message } => self.handle_ad_error(&message),
        }
    }

    fn update_player_state(&mut self, new_state: PlayerState, during_ad: bool) {
        let old_state = {
            let Some(st) = self.status.as_mut() else {
                return;
            };
            let old_state = st.player_state;
            st.player_state = new_state;
            if new_state != PlayerState::Idle {
                st.idle_reason = None;
            }
            old_state
        };
        if !during_ad && old_state != new_state {
            self.activity = true;
            self.events.publish(
                topic::STATE_CHANGE,
                BusEvent::StateChange {
                    old_state,
                    new_state,
                },
            );
        }
        self.broadcast_status(None);
    }

    fn handle_time(&mut self, position: f64, duration: f64) {
        self.events
            .publish(topic::MEDIA_TIME, BusEvent::MediaTime { position, duration });

        let mut duration_changed = false;
        {
            let Some(st) = self.status.as_mut() else {
                return;
            };
            st.current_time = position;
            if let Some(media) = st.media.as_mut() {
                if duration >= 0.0 && media.duration != duration {
                    media.duration = duration;
                    duration_changed = true;
                    let schedule = media
                        .custom_data
                        .advertising
                        .as_ref()
                        .map(|a| a.schedule.clone())
                        .unwrap_or_default();
                    if !schedule.is_empty() {
                        ads::merge_breaks(
                            &mut media.breaks,
                            ads::resolve_schedule(&schedule, Some(duration)),
                        );
                    }
                }
            }
        }

        if self.pending_load.is_some() && duration >= 0.0 {
            self.resolve_pending_load();
        } else if duration_changed {
            self.broadcast_status(None);
        }
    }

    fn handle_seeked(&mut self) {
        self.events.publish(topic::MEDIA_SEEKED, BusEvent::MediaSeeked);
        let request_id = self.pending_seek_request_id.take();
        self.broadcast_status(request_id);
    }

    fn handle_complete(&mut self) {
        if let Some(media) = self.status.as_ref().and_then(|st| st.media.clone()) {
            self.events
                .publish(topic::MEDIA_COMPLETE, BusEvent::MediaComplete { media });
        }
        self.load_next_media_item();
    }

    fn handle_setup_error(&mut self, message: &str) {
        error!(message, "media setup failed");
        let message_out =
            OutboundMessage::error(ErrorType::LoadFailed, self.current_request_id, None);
        self.outbox.broadcast(&message_out);
        self.current_request_id = RequestId::NONE;
        self.is_loading = false;
        self.pending_load = None;
        if let Some(st) = self.status.as_mut() {
            st.player_state = PlayerState::Idle;
            st.idle_reason = Some(IdleReason::Error);
        }
        self.broadcast_status(None);
    }

    fn handle_media_error(&mut self, message: &str) {
        error!(message, "media error");
        let next_item = self.next_item_in_queue();
        let (will_advance, current_media, session_id) = {
            let Some(st) = self.status.as_ref() else {
                return;
            };
            let shuffle_wrap = st.repeat_mode == Some(RepeatMode::RepeatAllAndShuffle)
                && st.items.len() > 2;
            (
                next_item.is_some() || shuffle_wrap,
                st.media.clone(),
                st.media_session_id,
            )
        };

        self.events.publish(
            topic::MEDIA_ERROR,
            BusEvent::MediaError {
                message: message.to_string(),
                current_media,
                next_item,
                will_advance,
                timeout_ms: ERROR_RECOVERY_TIMEOUT.as_millis() as u64,
            },
        );

        if let Some(st) = self.status.as_mut() {
            st.player_state = PlayerState::Idle;
            st.idle_reason = Some(IdleReason::Error);
        }
        self.broadcast_status(None);

        if will_advance {
            self.scheduled.push(ScheduledAction {
                delay: ERROR_RECOVERY_TIMEOUT,
                action: DeferredAction::AdvanceAfterError { session_id },
            });
        }
    }

    /// Runs a timer that came due. Actions fenced to a replaced session
    /// are dropped.
    pub fn handle_deferred(&mut self, action: DeferredAction) {
        match action {
            DeferredAction::AdvanceAfterError { session_id } => {
                let current = self.status.as_ref().map(|st| st.media_session_id);
                if current != Some(session_id) {
                    debug!(session_id, "dropping deferred advance for replaced session");
                    return;
                }
                self.load_next_media_item();
            }
        }
    }

    // ---- Tracks --------------------------------------------------------

    /// Recomputes `activeTrackIds` from what the player reports. Returns
    /// whether the set changed.
    fn update_active_tracks(&mut self) -> bool {
        let mut active = Vec::new();
        if self.player_attached {
            if let Some(media) = self.status.as_ref().and_then(|st| st.media.as_ref()) {
                let caption_index = self.player.current_captions();
                if caption_index > TRACK_DISABLED {
                    if let Some(caption) =
                        self.player.caption_list().into_iter().nth(caption_index)
                    {
                        if let Some(track) = media.tracks.iter().find(|t| {
                            t.track_type == TrackType::Text
                                && t.track_content_id
                                    .as_ref()
                                    .is_some_and(|c| c.matches_str(&caption.id))
                        }) {
                            active.push(track.track_id);
                        }
                    }
                }

                let audio_index = self.player.current_audio_track();
                if audio_index >= 0 {
                    if let Some(track) = media.tracks.iter().find(|t| {
                        t.track_type == TrackType::Audio
                            && t.track_content_id.as_ref().and_then(|c| c.as_index())
                                == Some(audio_index)
                    }) {
                        active.push(track.track_id);
                    }
                }
            }
        }

        let Some(st) = self.status.as_mut() else {
            return false;
        };
        let changed = st.active_track_ids != active;
        st.active_track_ids = active;
        changed
    }

    fn handle_caption_list(&mut self, tracks: Vec<CaptionTrack>, current: usize) {
        let mut changed = false;
        {
            let Some(media) = self.status.as_mut().and_then(|st| st.media.as_mut()) else {
                return;
            };
            // Index 0 is the player's "off" entry.
            for caption in tracks.iter().skip(1) {
                let exists = media.tracks.iter().any(|t| {
                    t.track_type == TrackType::Text
                        && t.track_content_id
                            .as_ref()
                            .is_some_and(|c| c.matches_str(&caption.id))
                });
                if !exists {
                    let track_id = media.next_track_id();
                    media.tracks.push(Track {
                        track_id,
                        track_type: TrackType::Text,
                        track_content_id: Some(TrackContentId::Id(caption.id.clone())),
                        name: caption.label.clone(),
                        subtype: Some(TextTrackType::Captions),
                    });
                    changed = true;
                }
            }
        }
        if current == TRACK_DISABLED && !changed {
            changed = self.update_active_tracks();
        }
        if changed {
            self.broadcast_status(None);
        }
    }

    fn handle_audio_tracks(&mut self, tracks: Vec<AudioTrack>) {
        let mut changed = false;
        {
            let Some(media) = self.status.as_mut().and_then(|st| st.media.as_mut()) else {
                return;
            };
            for (index, audio) in tracks.iter().enumerate() {
                let exists = media.tracks.iter().any(|t| {
                    t.track_type == TrackType::Audio
                        && t.track_content_id.as_ref().and_then(|c| c.as_index())
                            == Some(index as i64)
                });
                if !exists {
                    let track_id = media.next_track_id();
                    media.tracks.push(Track {
                        track_id,
                        track_type: TrackType::Audio,
                        track_content_id: Some(TrackContentId::Index(index as i64)),
                        name: audio.name.clone(),
                        subtype: None,
                    });
                    changed = true;
                }
            }
        }
        if changed {
            self.update_active_tracks();
            self.broadcast_status(None);
        }
    }

    // ---- Ads -----------------------------------------------------------

    fn handle_ad_meta(&mut self, meta: AdMeta) {
        self.events.publish(
            topic::AD_IMPRESSION,
            BusEvent::AdImpression { meta: meta.clone() },
        );

        // Sequence 1 (or none at all) marks the start of a new pod.
        if meta.sequence.map_or(true, |s| s <= 1) {
            self.ad_pod_start = Some(Instant::now());
        }

        {
            let Some(st) = self.status.as_mut() else {
                return;
            };
            st.custom_data.ad_meta = Some(meta.clone());
            st.player_state = PlayerState::Playing;

            if let Some(media) = st.media.as_mut() {
                let schedule = media
                    .custom_data
                    .advertising
                    .as_ref()
                    .map(|a| a.schedule.clone())
                    .unwrap_or_default();
                if !schedule.is_empty() {
                    if media.breaks.is_empty() {
                        media.breaks = ads::resolve_schedule(&schedule, None);
                    }

                    let break_id = meta.tag.as_deref().and_then(|tag| {
                        schedule
                            .iter()
                            .find(|(_, entry)| entry.tag.as_deref() == Some(tag))
                            .map(|(id, _)| id.clone())
                    });

                    let clip = AdBreakClipInfo {
                        id: meta.id.clone(),
                        duration: 0.0,
                        click_through_url: meta.clickthrough.clone(),
                        content_url: None,
                        mime_type: meta.creativetype.clone(),
                        title: meta.title.clone(),
                    };
                    if let Some(id) = &break_id {
                        if let Some(brk) = media.breaks.iter_mut().find(|b| b.id == *id) {
                            if !brk.break_clip_ids.contains(&clip.id) {
                                brk.break_clip_ids.push(clip.id.clone());
                            }
                        }
                    }
                    media.break_clips.retain(|c| c.id != clip.id);
                    media.break_clips.push(clip.clone());

                    st.break_status = Some(AdBreakStatus {
                        current_break_time: 0.0,
                        current_break_clip_time: 0.0,
                        break_id,
                        break_clip_id: Some(clip.id),
                        when_skippable: meta.skipoffset.unwrap_or(NOT_SKIPPABLE),
                    });
                }
            }
        }
        self.broadcast_status(None);
    }

    fn handle_ad_time(&mut self, position: f64, duration: f64) {
        self.events
            .publish(topic::AD_TIME, BusEvent::AdTime { position, duration });

        let pod_elapsed = self
            .ad_pod_start
            .map(|start| start.elapsed().as_secs_f64())
            .unwrap_or(0.0);

        let Some(st) = self.status.as_mut() else {
            return;
        };
        let (break_id, clip_id) = match st.break_status.as_mut() {
            Some(break_status) => {
                break_status.current_break_clip_time = position;
                break_status.current_break_time = pod_elapsed;
                (
                    break_status.break_id.clone(),
                    break_status.break_clip_id.clone(),
                )
            }
            None => return,
        };

        if let Some(media) = st.media.as_mut() {
            if let Some(clip_id) = clip_id {
                if let Some(clip) = media.break_clips.iter_mut().find(|c| c.id == clip_id) {
                    clip.duration = duration;
                }
            }
            if let Some(break_id) = break_id {
                if let Some(brk) = media.breaks.iter().position(|b| b.id == break_id) {
                    let total: f64 = media.breaks[brk]
                        .break_clip_ids
                        .iter()
                        .filter_map(|id| media.break_clips.iter().find(|c| c.id == *id))
                        .map(|c| c.duration)
                        .sum();
                    media.breaks[brk].duration = total;
                }
            }
        }
    }

    fn handle_ad_complete(&mut self, clip_id: String) {
        self.events.publish(
            topic::AD_COMPLETE,
            BusEvent::AdComplete {
                clip_id: clip_id.clone(),
            },
        );

        {
            let Some(st) = self.status.as_mut() else {
                return;
            };
            let pod_finished = st
                .custom_data
                .ad_meta
                .as_ref()
                .map_or(true, |meta| match (meta.sequence, meta.podcount) {
                    (Some(sequence), Some(count)) => sequence >= count,
                    _ => true,
                });
            if pod_finished {
                if let Some(media) = st.media.as_mut() {
                    if let Some(brk) = media
                        .breaks
                        .iter_mut()
                        .find(|b| b.break_clip_ids.contains(&clip_id))
                    {
                        brk.is_watched = true;
                    }
                }
            }
            st.custom_data.ad_meta = None;
            st.break_status = None;
        }
        self.broadcast_status(None);
    }

    fn handle_ad_error(&mut self, message: &str) {
        error!(message, "ad playback error");
        self.events.publish(
            topic::AD_ERROR,
            BusEvent::AdError {
                message: message.to_string(),
            },
        );
        if let Some(st) = self.status.as_mut() {
            st.custom_data.ad_meta = None;
            st.break_status = None;
        }
        self.broadcast_status(None);
    }

    // ---- Status and errors ---------------------------------------------

    fn serialize_status(&mut self, explicit: Option<RequestId>) -> OutboundMessage {
        self.update_active_tracks();
        let request_id = explicit.unwrap_or(self.current_request_id);
        self.current_request_id = RequestId::NONE;
        let status = self.status.clone().into_iter().collect();
        OutboundMessage::status(request_id, status)
    }

    /// Broadcasts a status snapshot. Suppressed while a load is in flight
    /// so senders never observe a half-initialized session.
    fn broadcast_status(&mut self, explicit: Option<RequestId>) {
        if self.is_loading {
            debug!("status broadcast suppressed while loading");
            return;
        }
        let message = self.serialize_status(explicit);
        self.outbox.broadcast(&message);
    }

    fn send_status(&mut self, sender_id: Option<&str>, explicit: Option<RequestId>) {
        if self.is_loading {
            debug!("status reply suppressed while loading");
            return;
        }
        let message = self.serialize_status(explicit);
        match sender_id {
            Some(sender) => self.outbox.send_to(sender, &message),
            None => self.outbox.broadcast(&message),
        }
    }

    fn send_error(
        &mut self,
        envelope: &CommandEnvelope,
        typ: ErrorType,
        reason: Option<ErrorReason>,
    ) {
        let request_id = envelope.request_id().unwrap_or(RequestId::NONE);
        let message = OutboundMessage::error(typ, request_id, reason);
        match envelope.sender_id.as_deref() {
            Some(sender) => self.outbox.send_to(sender, &message),
            None => self.outbox.broadcast(&message),
        }
    }

    fn send_error_invalid_params(&mut self, envelope: &CommandEnvelope) {
        self.send_error(
            envelope,
            ErrorType::InvalidRequest,
            Some(ErrorReason::InvalidParams),
        );
    }

    fn parse<T: serde::de::DeserializeOwned>(&mut self, envelope: &CommandEnvelope) -> Option<T> {
        match serde_json::from_value(envelope.data.clone()) {
            Ok(data) => Some(data),
            Err(err) => {
                warn!(%err, typ = ?envelope.typ, "malformed command data");
                self.send_error_invalid_params(envelope);
                None
            }
        }
    }
}

/// Owns the manager and serializes every input source onto one task:
/// sender commands, player events and expired timers, plus the
/// inactivity watchdog.
pub struct ReceiverTask<P: PlayerAdapter> {
    manager: MediaManager<ChannelAdapter, P>,
    transport_rx: mpsc::Receiver<TransportEvent>,
    player_rx: mpsc::Receiver<PlayerEvent>,
    deferred: DelayQueue<DeferredAction>,
}

impl<P: PlayerAdapter> ReceiverTask<P> {
    /// Builds the task. `make_player` receives the sender the player
    /// should emit its events on.
    pub fn new<F>(make_player: F) -> (ReceiverTask<P>, mpsc::Sender<TransportEvent>)
    where
        F: FnOnce(mpsc::Sender<PlayerEvent>) -> P,
    {
        let (transport_tx, transport_rx) = mpsc::channel(64);
        let (player_tx, player_rx) = mpsc::channel(64);
        let task = ReceiverTask {
            manager: MediaManager::new(ChannelAdapter::new(), make_player(player_tx)),
            transport_rx,
            player_rx,
            deferred: DelayQueue::new(),
        };
        (task, transport_tx)
    }

    pub fn manager_mut(&mut self) -> &mut MediaManager<ChannelAdapter, P> {
        &mut self.manager
    }

    pub async fn main(mut self) -> Result<()> {
        let mut deadline = tokio::time::Instant::now() + INACTIVITY_TIMEOUT;
        loop {
            tokio::select! {
                event = self.transport_rx.recv() => match event {
                    Some(TransportEvent::Connected { sender_id, outbound }) => {
                        self.manager.outbox_mut().register(sender_id, outbound);
                    }
                    Some(TransportEvent::Disconnected { sender_id }) => {
                        self.manager.outbox_mut().unregister(&sender_id);
                    }
                    Some(TransportEvent::Command(envelope)) => self.manager.dispatch(envelope),
                    None => {
                        info!("transport channel closed, stopping");
                        break;
                    }
                },
                event = self.player_rx.recv() => match event {
                    Some(event) => self.manager.handle_player_event(event),
                    None => {
                        info!("player channel closed, stopping");
                        break;
                    }
                },
                Some(expired) = self.deferred.next(), if !self.deferred.is_empty() => {
                    self.manager.handle_deferred(expired.into_inner());
                },
                _ = tokio::time::sleep_until(deadline) => {
                    match self.manager.player_state() {
                        Some(PlayerState::Playing) | Some(PlayerState::Buffering) => {
                            deadline = tokio::time::Instant::now() + INACTIVITY_TIMEOUT;
                        }
                        _ => {
                            info!(
                                timeout_secs = INACTIVITY_TIMEOUT.as_secs(),
                                "no activity, shutting down"
                            );
                            self.manager.shutdown();
                            break;
                        }
                    }
                }
            }

            for scheduled in self.manager.take_scheduled() {
                self.deferred.insert(scheduled.action, scheduled.delay);
            }
            if self.manager.take_activity() {
                deadline = tokio::time::Instant::now() + INACTIVITY_TIMEOUT;
            }
        }
        Ok(())
    }
}
