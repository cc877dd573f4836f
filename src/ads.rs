//! Ad break scheduling and playback status.
//!
//! Break schedules arrive in `customData.advertising.schedule` keyed by
//! break id. Offsets are resolved to absolute content positions as soon
//! as enough is known: pre-roll and absolute offsets immediately,
//! percentage and post-roll offsets once the content duration is known.

use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;
use std::collections::BTreeMap;

use crate::session::AdBreakSchedule;

/// Sentinel for "not skippable" in `AdBreakStatus::when_skippable`.
pub const NOT_SKIPPABLE: f64 = -1.0;

/// A scheduled ad break at a resolved content position.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AdBreakInfo {
    pub id: String,

    /// Content position in seconds at which the break plays.
    pub position: f64,

    pub is_watched: bool,

    /// Total break duration; accumulated from clip durations.
    pub duration: f64,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub break_clip_ids: Vec<String>,
}

impl AdBreakInfo {
    pub fn new(id: String, position: f64) -> AdBreakInfo {
        AdBreakInfo {
            id,
            position,
            is_watched: false,
            duration: 0.0,
            break_clip_ids: Vec::new(),
        }
    }
}

/// One clip within an ad break, discovered from ad metadata at play time.
#[skip_serializing_none]
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AdBreakClipInfo {
    pub id: String,
    pub duration: f64,
    pub click_through_url: Option<String>,
    pub content_url: Option<String>,
    pub mime_type: Option<String>,
    pub title: Option<String>,
}

/// Live progress of the currently playing ad break.
///
/// Attached to the session snapshot only while an ad is on screen.
#[skip_serializing_none]
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AdBreakStatus {
    /// Seconds since the break (pod) started, wall clock.
    pub current_break_time: f64,

    /// Playback position within the current clip.
    pub current_break_clip_time: f64,

    pub break_id: Option<String>,
    pub break_clip_id: Option<String>,

    /// Seconds into the clip at which it becomes skippable, or -1.
    pub when_skippable: f64,
}

/// Metadata reported by the player when an ad starts.
#[skip_serializing_none]
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct AdMeta {
    pub id: String,
    pub tag: Option<String>,
    pub client: Option<String>,

    /// 1-based position of this clip within its pod.
    pub sequence: Option<u32>,
    pub podcount: Option<u32>,

    pub creativetype: Option<String>,
    pub skipoffset: Option<f64>,
    pub clickthrough: Option<String>,
    pub title: Option<String>,
}

/// A schedule offset before resolution against the content duration.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum AdOffset {
    Pre,
    Post,
    Percent(f64),
    Seconds(f64),
}

impl AdOffset {
    /// Parses the schedule offset syntax: `pre`, `post`, `NN%`,
    /// `[hh:]mm:ss` or plain seconds. Unparseable offsets yield `None`.
    pub fn parse(offset: &str) -> Option<AdOffset> {
        let offset = offset.trim();
        match offset {
            "pre" => return Some(AdOffset::Pre),
            "post" => return Some(AdOffset::Post),
            _ => {}
        }

        if let Some(percent) = offset.strip_suffix('%') {
            return percent.parse::<f64>().ok().map(AdOffset::Percent);
        }

        if offset.contains(':') {
            let mut seconds = 0.0;
            for part in offset.split(':') {
                seconds = seconds * 60.0 + part.parse::<f64>().ok()?;
            }
            return Some(AdOffset::Seconds(seconds));
        }

        offset.parse::<f64>().ok().map(AdOffset::Seconds)
    }

    /// Absolute content position, or `None` when the offset still needs a
    /// duration that is not known yet.
    pub fn resolve(&self, duration: Option<f64>) -> Option<f64> {
        match *self {
            AdOffset::Pre => Some(0.0),
            AdOffset::Seconds(s) => Some(s),
            AdOffset::Post => duration,
            AdOffset::Percent(p) => duration.map(|d| d * p / 100.0),
        }
    }

    /// Whether the offset resolves without knowing the duration.
    pub fn is_immediate(&self) -> bool {
        matches!(self, AdOffset::Pre | AdOffset::Seconds(_))
    }
}

/// Breaks whose offsets resolve against `duration`.
///
/// With `duration == None` only pre-roll and absolute offsets are
/// returned; percentage and post-roll entries stay pending until the
/// duration is known. Offsets that fail to parse are skipped.
pub fn resolve_schedule(
    schedule: &BTreeMap<String, AdBreakSchedule>,
    duration: Option<f64>,
) -> Vec<AdBreakInfo> {
    schedule
        .iter()
        .filter_map(|(id, entry)| {
            let offset = AdOffset::parse(&entry.offset)?;
            let position = offset.resolve(duration)?;
            Some(AdBreakInfo::new(id.clone(), position))
        })
        .collect()
}

/// Whether the schedule contains a break playing at content position 0.
pub fn has_pre_roll(schedule: &BTreeMap<String, AdBreakSchedule>) -> bool {
    schedule
        .values()
        .filter_map(|entry| AdOffset::parse(&entry.offset))
        .any(|offset| offset.resolve(None) == Some(0.0))
}

/// Merges newly resolved breaks into `breaks`, deduplicating by break id
/// so late duration discovery never doubles an entry.
pub fn merge_breaks(breaks: &mut Vec<AdBreakInfo>, resolved: Vec<AdBreakInfo>) {
    for brk in resolved {
        if breaks.iter().any(|existing| existing.id == brk.id) {
            continue;
        }
        breaks.push(brk);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn schedule(entries: &[(&str, &str)]) -> BTreeMap<String, AdBreakSchedule> {
        entries
            .iter()
            .map(|(id, offset)| {
                (
                    id.to_string(),
                    AdBreakSchedule {
                        offset: offset.to_string(),
                        tag: None,
                    },
                )
            })
            .collect()
    }

    #[test]
    fn offset_parsing() {
        assert_eq!(AdOffset::parse("pre"), Some(AdOffset::Pre));
        assert_eq!(AdOffset::parse("post"), Some(AdOffset::Post));
        assert_eq!(AdOffset::parse("50%"), Some(AdOffset::Percent(50.0)));
        assert_eq!(AdOffset::parse("00:30"), Some(AdOffset::Seconds(30.0)));
        assert_eq!(AdOffset::parse("1:02:03"), Some(AdOffset::Seconds(3723.0)));
        assert_eq!(AdOffset::parse("12"), Some(AdOffset::Seconds(12.0)));
        assert_eq!(AdOffset::parse("bogus"), None);
        assert_eq!(AdOffset::parse("a:b"), None);
    }

    #[test]
    fn percentage_resolves_only_with_duration() {
        let half = AdOffset::Percent(50.0);
        assert_eq!(half.resolve(None), None);
        assert_eq!(half.resolve(Some(100.0)), Some(50.0));

        assert_eq!(AdOffset::Post.resolve(None), None);
        assert_eq!(AdOffset::Post.resolve(Some(42.0)), Some(42.0));
    }

    #[test]
    fn schedule_resolution_without_duration_keeps_relative_pending() {
        let sched = schedule(&[
            ("b-mid", "50%"),
            ("b-post", "post"),
            ("b-pre", "pre"),
            ("b-ten", "10"),
        ]);

        let immediate = resolve_schedule(&sched, None);
        let ids: Vec<&str> = immediate.iter().map(|b| b.id.as_str()).collect();
        assert_eq!(ids, vec!["b-pre", "b-ten"]);

        let all = resolve_schedule(&sched, Some(200.0));
        assert_eq!(all.len(), 4);
        let mid = all.iter().find(|b| b.id == "b-mid").unwrap();
        assert_eq!(mid.position, 100.0);
        let post = all.iter().find(|b| b.id == "b-post").unwrap();
        assert_eq!(post.position, 200.0);
    }

    #[test]
    fn merge_deduplicates_by_break_id() {
        let sched = schedule(&[("b-pre", "pre"), ("b-mid", "50%")]);
        let mut breaks = resolve_schedule(&sched, None);
        assert_eq!(breaks.len(), 1);

        // Late duration discovery resolves the full schedule again; the
        // pre-roll must not be duplicated.
        merge_breaks(&mut breaks, resolve_schedule(&sched, Some(100.0)));
        assert_eq!(breaks.len(), 2);
        assert!(breaks.iter().any(|b| b.id == "b-mid" && b.position == 50.0));
    }

    #[test]
    fn pre_roll_detection() {
        assert!(has_pre_roll(&schedule(&[("a", "pre")])));
        assert!(has_pre_roll(&schedule(&[("a", "0")])));
        assert!(!has_pre_roll(&schedule(&[("a", "post"), ("b", "25%")])));
        assert!(!has_pre_roll(&BTreeMap::new()));
    }
}
