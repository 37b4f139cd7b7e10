use serde::{Deserialize, Serialize};

/// Scrobble phase, doubling as the upstream URL path segment and the queue
/// `action` column value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScrobbleAction {
    Start,
    Pause,
    Stop,
}

impl ScrobbleAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Pause => "pause",
            Self::Stop => "stop",
        }
    }
}

impl std::fmt::Display for ScrobbleAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ScrobbleAction {
    type Err = crate::error::ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "start" => Ok(Self::Start),
            "pause" => Ok(Self::Pause),
            "stop" => Ok(Self::Stop),
            other => Err(crate::error::ModelError::UnknownVariant {
                kind: "scrobble action",
                value: other.to_string(),
            }),
        }
    }
}

/// External identifiers for a movie or show.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaIds {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tmdb: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tvdb: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub imdb: Option<String>,
}

impl MediaIds {
    pub fn is_empty(&self) -> bool {
        self.tmdb.is_none() && self.tvdb.is_none() && self.imdb.is_none()
    }
}

/// Identifiers for one episode.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EpisodeIds {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tvdb: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tmdb: Option<u64>,
}

/// A movie or show branch of the scrobble body.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScrobbleItem {
    #[serde(skip_serializing_if = "MediaIds::is_empty", default)]
    pub ids: MediaIds,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub year: Option<u16>,
}

/// The episode branch of the scrobble body.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScrobbleEpisode {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ids: Option<EpisodeIds>,
    pub season: u32,
    pub number: u32,
}

/// The wire object POSTed to `/scrobble/{start|pause|stop}`.
///
/// Exactly one of `movie` or `show` is set; `episode` accompanies `show`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScrobbleBody {
    pub progress: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub movie: Option<ScrobbleItem>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub show: Option<ScrobbleItem>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub episode: Option<ScrobbleEpisode>,
}

impl ScrobbleBody {
    /// Whether the body identifies anything at all.
    pub fn identifies_media(&self) -> bool {
        match (&self.movie, &self.show) {
            (Some(movie), _) => {
                !movie.ids.is_empty()
                    || (movie.title.is_some() && movie.year.is_some())
            }
            (_, Some(show)) => {
                (!show.ids.is_empty() || show.title.is_some())
                    && self.episode.is_some()
            }
            _ => false,
        }
    }

    /// Title used for notifications and logs.
    pub fn display_title(&self) -> String {
        if let Some(movie) = &self.movie {
            return movie.title.clone().unwrap_or_else(|| "movie".into());
        }
        if let Some(show) = &self.show {
            let name =
                show.title.clone().unwrap_or_else(|| "show".to_string());
            if let Some(ep) = &self.episode {
                return format!("{name} {}x{:02}", ep.season, ep.number);
            }
            return name;
        }
        "unknown media".into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn action_round_trips() {
        for action in
            [ScrobbleAction::Start, ScrobbleAction::Pause, ScrobbleAction::Stop]
        {
            let parsed: ScrobbleAction = action.as_str().parse().unwrap();
            assert_eq!(parsed, action);
        }
    }

    #[test]
    fn movie_body_serializes_without_show_branch() {
        let body = ScrobbleBody {
            progress: 96,
            movie: Some(ScrobbleItem {
                ids: MediaIds {
                    tmdb: Some(603),
                    ..MediaIds::default()
                },
                title: Some("The Matrix".into()),
                year: Some(1999),
            }),
            ..ScrobbleBody::default()
        };
        let json = serde_json::to_value(&body).unwrap();
        assert!(json.get("show").is_none());
        assert!(json.get("episode").is_none());
        assert_eq!(json["progress"], 96);
        assert_eq!(json["movie"]["ids"]["tmdb"], 603);
    }

    #[test]
    fn identification_rules() {
        let mut body = ScrobbleBody::default();
        assert!(!body.identifies_media());

        body.movie = Some(ScrobbleItem {
            title: Some("Alien".into()),
            year: Some(1979),
            ..ScrobbleItem::default()
        });
        assert!(body.identifies_media());

        let show_only = ScrobbleBody {
            show: Some(ScrobbleItem {
                ids: MediaIds {
                    tvdb: Some(73739),
                    ..MediaIds::default()
                },
                ..ScrobbleItem::default()
            }),
            ..ScrobbleBody::default()
        };
        // A show without an episode cannot be scrobbled.
        assert!(!show_only.identifies_media());
    }

    #[test]
    fn display_title_for_episodes() {
        let body = ScrobbleBody {
            progress: 50,
            show: Some(ScrobbleItem {
                title: Some("Lost".into()),
                ..ScrobbleItem::default()
            }),
            episode: Some(ScrobbleEpisode {
                ids: None,
                season: 4,
                number: 8,
            }),
            ..ScrobbleBody::default()
        };
        assert_eq!(body.display_title(), "Lost 4x08");
    }
}
