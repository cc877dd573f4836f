//! In-process publish/subscribe bus.
//!
//! Listeners are plain closures invoked synchronously, in subscription
//! order, on the thread that publishes. Topics are string keys; an event
//! published to a topic nobody listens on is dropped silently.

use chrono::{DateTime, Utc};
use std::collections::HashMap;

use crate::ads::AdMeta;
use crate::session::{Media, PlayerState, QueueItem, RepeatMode};

/// Topic names published by the media manager.
pub mod topic {
    pub const READY: &str = "ready";
    pub const STATE_CHANGE: &str = "stateChange";
    pub const MEDIA_LOAD: &str = "mediaLoad";
    pub const MEDIA_LOADED: &str = "mediaLoaded";
    pub const MEDIA_SEEK: &str = "mediaSeek";
    pub const MEDIA_SEEKED: &str = "mediaSeeked";
    pub const MEDIA_TIME: &str = "mediaTime";
    pub const MEDIA_COMPLETE: &str = "mediaComplete";
    pub const MEDIA_ERROR: &str = "mediaError";
    pub const QUEUE_LOAD: &str = "queueLoad";
    pub const QUEUE_UPDATE: &str = "queueUpdate";
    pub const AD_IMPRESSION: &str = "adImpression";
    pub const AD_PLAY: &str = "adPlay";
    pub const AD_PAUSE: &str = "adPause";
    pub const AD_TIME: &str = "adTime";
    pub const AD_COMPLETE: &str = "adComplete";
    pub const AD_ERROR: &str = "adError";
    pub const USER_ACTIVITY: &str = "userActivity";
}

#[derive(Clone, Debug)]
pub enum BusEvent {
    Ready,

    /// A sender issued any command other than a status poll.
    UserActivity { command: String },

    StateChange {
        old_state: PlayerState,
        new_state: PlayerState,
    },

    MediaLoad { item: QueueItem },
    MediaLoaded { media: Media },
    MediaSeek { position: Option<f64> },
    MediaSeeked,
    MediaTime { position: f64, duration: f64 },
    MediaComplete { media: Media },

    MediaError {
        message: String,
        current_media: Option<Media>,
        next_item: Option<QueueItem>,
        will_advance: bool,
        timeout_ms: u64,
    },

    QueueLoad {
        items: Vec<QueueItem>,
        repeat_mode: Option<RepeatMode>,
    },
    QueueUpdate { items: Vec<QueueItem> },

    AdImpression { meta: AdMeta },
    AdPlay,
    AdPause,
    AdTime { position: f64, duration: f64 },
    AdComplete { clip_id: String },
    AdError { message: String },
}

/// An event with the instant it was published.
#[derive(Clone, Debug)]
pub struct BusMessage {
    pub time: DateTime<Utc>,
    pub event: BusEvent,
}

type Listener = Box<dyn FnMut(&BusMessage) + Send>;

/// Handle returned by [`EventBus::subscribe`], used to remove the
/// listener again.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Subscription {
    topic: String,
    id: u64,
}

#[derive(Default)]
pub struct EventBus {
    topics: HashMap<String, Vec<(u64, Listener)>>,
    next_id: u64,
}

impl EventBus {
    pub fn new() -> EventBus {
        EventBus::default()
    }

    pub fn subscribe<F>(&mut self, topic: &str, listener: F) -> Subscription
    where
        F: FnMut(&BusMessage) + Send + 'static,
    {
        let id = self.next_id;
        self.next_id += 1;
        self.topics
            .entry(topic.to_string())
            .or_default()
            .push((id, Box::new(listener)));
        Subscription {
            topic: topic.to_string(),
            id,
        }
    }

    /// Removes a listener. Unsubscribing twice is a no-op.
    pub fn unsubscribe(&mut self, subscription: &Subscription) {
        if let Some(listeners) = self.topics.get_mut(&subscription.topic) {
            listeners.retain(|(id, _)| *id != subscription.id);
        }
    }

    /// Delivers `event` to every listener of `topic`, in subscription
    /// order, before returning.
    pub fn publish(&mut self, topic: &str, event: BusEvent) {
        let Some(listeners) = self.topics.get_mut(topic) else {
            return;
        };
        let message = BusMessage {
            time: Utc::now(),
            event,
        };
        for (_, listener) in listeners.iter_mut() {
            listener(&message);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn recorder(log: &Arc<Mutex<Vec<String>>>, label: &str) -> impl FnMut(&BusMessage) + Send {
        let log = Arc::clone(log);
        let label = label.to_string();
        move |_| log.lock().unwrap().push(label.clone())
    }

    #[test]
    fn listeners_run_in_subscription_order() {
        let mut bus = EventBus::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        bus.subscribe(topic::READY, recorder(&log, "first"));
        bus.subscribe(topic::READY, recorder(&log, "second"));
        bus.subscribe(topic::READY, recorder(&log, "third"));

        bus.publish(topic::READY, BusEvent::Ready);
        assert_eq!(*log.lock().unwrap(), vec!["first", "second", "third"]);
    }

    #[test]
    fn unsubscribe_removes_only_that_listener() {
        let mut bus = EventBus::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        let first = bus.subscribe(topic::AD_PLAY, recorder(&log, "first"));
        bus.subscribe(topic::AD_PLAY, recorder(&log, "second"));

        bus.unsubscribe(&first);
        bus.unsubscribe(&first);

        bus.publish(topic::AD_PLAY, BusEvent::AdPlay);
        assert_eq!(*log.lock().unwrap(), vec!["second"]);
    }

    #[test]
    fn publish_without_listeners_is_silent() {
        let mut bus = EventBus::new();
        bus.publish(topic::MEDIA_SEEKED, BusEvent::MediaSeeked);
    }

    #[test]
    fn topics_are_independent() {
        let mut bus = EventBus::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        bus.subscribe(topic::AD_PLAY, recorder(&log, "ad"));
        bus.subscribe(topic::MEDIA_TIME, recorder(&log, "time"));

        bus.publish(
            topic::MEDIA_TIME,
            BusEvent::MediaTime {
                position: 1.0,
                duration: 10.0,
            },
        );
        assert_eq!(*log.lock().unwrap(), vec!["time"]);
    }
}
