use serde::{Deserialize, Serialize};

/// Media-server verbs the bridge reacts to.
///
/// Webhook payloads carry dotted names (`media.play`, `playback.started`);
/// both the dotted and bare spellings parse to the same verb. Anything else
/// yields `None` from [`EventVerb::parse`] and the event is discarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventVerb {
    Play,
    Resume,
    Pause,
    Stop,
    Scrobble,
}

impl EventVerb {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "play" | "media.play" | "playback.started" => Some(Self::Play),
            "resume" | "media.resume" => Some(Self::Resume),
            "pause" | "media.pause" => Some(Self::Pause),
            "stop" | "media.stop" => Some(Self::Stop),
            "scrobble" | "media.scrobble" => Some(Self::Scrobble),
            _ => None,
        }
    }
}

/// Kind of item the event describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    Movie,
    Episode,
}

/// A normalized media event as handed to the coalescer.
///
/// Ephemeral input: never persisted as-is. The webhook parser is responsible
/// for tolerating the media server's payload quirks and producing this shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaEvent {
    /// Stable identifier of the playing device.
    pub player_id: String,
    /// Identifier of the media server that emitted the event.
    pub server_id: String,
    /// Server-local identifier of the media item.
    pub rating_key: String,
    pub verb: EventVerb,
    pub kind: MediaKind,
    pub view_offset_ms: i64,
    pub duration_ms: i64,
    /// External identifiers, when the server exposes them.
    pub tmdb_id: Option<u64>,
    pub tvdb_id: Option<u64>,
    pub imdb_id: Option<String>,
    /// Raw platform GUID, used as a fallback for shows.
    pub guid: Option<String>,
    pub title: Option<String>,
    pub year: Option<u16>,
    /// Show context for episodes.
    pub show_title: Option<String>,
    pub season: Option<u32>,
    pub episode: Option<u32>,
}

impl MediaEvent {
    /// Progress through the item in whole percent, clamped to 0..=100.
    ///
    /// A zero or negative duration yields `None`; the caller falls back to
    /// previously cached progress.
    pub fn progress_percent(&self) -> Option<i32> {
        if self.duration_ms <= 0 {
            return None;
        }
        let pct =
            (self.view_offset_ms as f64 / self.duration_ms as f64) * 100.0;
        Some((pct.round() as i32).clamp(0, 100))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verbs_parse_dotted_and_bare() {
        assert_eq!(EventVerb::parse("media.play"), Some(EventVerb::Play));
        assert_eq!(
            EventVerb::parse("playback.started"),
            Some(EventVerb::Play)
        );
        assert_eq!(EventVerb::parse("pause"), Some(EventVerb::Pause));
        assert_eq!(
            EventVerb::parse("media.scrobble"),
            Some(EventVerb::Scrobble)
        );
        assert_eq!(EventVerb::parse("media.rate"), None);
    }

    fn event(view_offset_ms: i64, duration_ms: i64) -> MediaEvent {
        MediaEvent {
            player_id: "player".into(),
            server_id: "server".into(),
            rating_key: "12345".into(),
            verb: EventVerb::Play,
            kind: MediaKind::Movie,
            view_offset_ms,
            duration_ms,
            tmdb_id: None,
            tvdb_id: None,
            imdb_id: None,
            guid: None,
            title: None,
            year: None,
            show_title: None,
            season: None,
            episode: None,
        }
    }

    #[test]
    fn progress_rounds_to_whole_percent() {
        assert_eq!(event(6_900_000, 7_200_000).progress_percent(), Some(96));
        assert_eq!(event(0, 7_200_000).progress_percent(), Some(0));
        assert_eq!(event(7_200_000, 7_200_000).progress_percent(), Some(100));
    }

    #[test]
    fn progress_undefined_without_duration() {
        assert_eq!(event(1_000, 0).progress_percent(), None);
        assert_eq!(event(1_000, -5).progress_percent(), None);
    }

    #[test]
    fn progress_clamps_overrun() {
        assert_eq!(event(8_000_000, 7_200_000).progress_percent(), Some(100));
    }
}
