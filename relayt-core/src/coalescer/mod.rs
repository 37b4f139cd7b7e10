//! Per-playback serialization and action inference.
//!
//! Events about the same `(player_id, rating_key)` are strictly serialized
//! by a per-key mutex held from [`EventCoalescer::prepare`] through
//! [`EventCoalescer::commit`]; the broadcaster dispatches in between.
//! Redundant progress reports are suppressed against the cached state.

pub mod guid;

use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, warn};

use relayt_model::{
    CachedState, EpisodeIds, EventVerb, MediaEvent, MediaIds, MediaKind,
    ScrobbleAction, ScrobbleBody, ScrobbleEpisode, ScrobbleItem,
};

use crate::error::Result;
use crate::storage::Storage;
use guid::{GuidProvider, parse_show_guid};

type PlaybackKey = (String, String);

/// A scrobble ready for dispatch, holding the playback lock until
/// committed or dropped.
pub struct PreparedScrobble {
    pub action: ScrobbleAction,
    pub progress: i32,
    pub body: ScrobbleBody,
    key: PlaybackKey,
    server_id: String,
    _guard: OwnedMutexGuard<()>,
}

impl std::fmt::Debug for PreparedScrobble {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PreparedScrobble")
            .field("action", &self.action)
            .field("progress", &self.progress)
            .field("key", &self.key)
            .finish_non_exhaustive()
    }
}

pub struct EventCoalescer {
    storage: Arc<dyn Storage>,
    locks: DashMap<PlaybackKey, Arc<Mutex<()>>>,
    progress_threshold: i32,
}

impl std::fmt::Debug for EventCoalescer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventCoalescer")
            .field("locked_keys", &self.locks.len())
            .finish_non_exhaustive()
    }
}

impl EventCoalescer {
    pub fn new(storage: Arc<dyn Storage>, progress_threshold: i32) -> Self {
        Self {
            storage,
            locks: DashMap::new(),
            progress_threshold,
        }
    }

    /// Serialize on the playback key, infer the action, and suppress
    /// duplicates. `Ok(None)` means the event is spent: unidentifiable,
    /// redundant, or malformed. None of those are errors.
    pub async fn prepare(
        &self,
        event: &MediaEvent,
    ) -> Result<Option<PreparedScrobble>> {
        if event.player_id.is_empty() || event.rating_key.is_empty() {
            debug!("Dropping event without a playback key");
            return Ok(None);
        }

        let key = (event.player_id.clone(), event.rating_key.clone());
        let lock = self
            .locks
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let guard = lock.lock_owned().await;

        // Hot-path persistence failures never block processing.
        let cached = match self
            .storage
            .get_cached_state(&event.player_id, &event.rating_key)
            .await
        {
            Ok(cached) => cached,
            Err(e) => {
                warn!("Failed to read cached state: {e}");
                None
            }
        };

        let mut progress = event
            .progress_percent()
            .or(cached.as_ref().map(|c| c.last_progress_percent))
            .unwrap_or(0);

        let action = match event.verb {
            EventVerb::Play | EventVerb::Resume => ScrobbleAction::Start,
            EventVerb::Pause | EventVerb::Stop => {
                if progress >= self.progress_threshold {
                    ScrobbleAction::Stop
                } else {
                    ScrobbleAction::Pause
                }
            }
            EventVerb::Scrobble => {
                progress = progress.max(self.progress_threshold);
                ScrobbleAction::Stop
            }
        };

        if let Some(cached) = &cached
            && cached.server_id == event.server_id
            && (cached.last_action == ScrobbleAction::Stop
                || (cached.last_action == action
                    && cached.last_progress_percent == progress))
        {
            debug!(
                player_id = %event.player_id,
                rating_key = %event.rating_key,
                %action,
                progress,
                "Suppressing duplicate event"
            );
            return Ok(None);
        }

        // Reuse the body built on first sight of this item.
        let body = match cached
            .filter(|c| c.scrobble_body.identifies_media())
            .map(|c| c.scrobble_body)
        {
            Some(mut body) => {
                body.progress = progress;
                body
            }
            None => match self.build_body(event, progress) {
                Some(body) => body,
                None => {
                    info!(
                        rating_key = %event.rating_key,
                        "Could not identify media, skipping event"
                    );
                    return Ok(None);
                }
            },
        };

        Ok(Some(PreparedScrobble {
            action,
            progress,
            body,
            key,
            server_id: event.server_id.clone(),
            _guard: guard,
        }))
    }

    /// Record the dispatched action in the cache and release the playback
    /// lock.
    pub async fn commit(&self, prepared: PreparedScrobble) {
        let PreparedScrobble {
            action,
            progress,
            body,
            key,
            server_id,
            _guard,
        } = prepared;

        let state = CachedState {
            player_id: key.0.clone(),
            server_id,
            rating_key: key.1.clone(),
            last_action: action,
            last_progress_percent: progress,
            scrobble_body: body,
            updated_at: Utc::now(),
        };
        if let Err(e) = self.storage.write_cached_state(&state).await {
            warn!("Failed to update cached state: {e}");
        }

        drop(_guard);
        // Opportunistic cleanup once nobody else waits on the key.
        self.locks
            .remove_if(&key, |_, lock| Arc::strong_count(lock) == 1);
    }

    fn build_body(
        &self,
        event: &MediaEvent,
        progress: i32,
    ) -> Option<ScrobbleBody> {
        match event.kind {
            MediaKind::Movie => {
                let ids = MediaIds {
                    tmdb: event.tmdb_id,
                    tvdb: event.tvdb_id,
                    imdb: event.imdb_id.clone(),
                };
                if ids.is_empty()
                    && (event.title.is_none() || event.year.is_none())
                {
                    return None;
                }
                Some(ScrobbleBody {
                    progress,
                    movie: Some(ScrobbleItem {
                        ids,
                        title: event.title.clone(),
                        year: event.year,
                    }),
                    ..ScrobbleBody::default()
                })
            }
            MediaKind::Episode => self.build_episode_body(event, progress),
        }
    }

    fn build_episode_body(
        &self,
        event: &MediaEvent,
        progress: i32,
    ) -> Option<ScrobbleBody> {
        // Direct external ids name the episode itself.
        if (event.tvdb_id.is_some() || event.tmdb_id.is_some())
            && let (Some(season), Some(number)) =
                (event.season, event.episode)
        {
            return Some(ScrobbleBody {
                progress,
                show: Some(ScrobbleItem {
                    title: event.show_title.clone(),
                    ..ScrobbleItem::default()
                }),
                episode: Some(ScrobbleEpisode {
                    ids: Some(EpisodeIds {
                        tvdb: event.tvdb_id,
                        tmdb: event.tmdb_id,
                    }),
                    season,
                    number,
                }),
                ..ScrobbleBody::default()
            });
        }

        // Legacy agents: recover the show id from the GUID.
        if let Some(guid) =
            event.guid.as_deref().and_then(parse_show_guid)
        {
            let mut ids = MediaIds::default();
            match guid.provider {
                GuidProvider::Tvdb => ids.tvdb = Some(guid.id),
                GuidProvider::Tmdb => ids.tmdb = Some(guid.id),
            }
            return Some(ScrobbleBody {
                progress,
                show: Some(ScrobbleItem {
                    ids,
                    title: event.show_title.clone(),
                    ..ScrobbleItem::default()
                }),
                episode: Some(ScrobbleEpisode {
                    ids: None,
                    season: guid.season,
                    number: guid.episode,
                }),
                ..ScrobbleBody::default()
            });
        }

        // Last resort: show title plus position.
        if let (Some(title), Some(season), Some(number)) =
            (&event.show_title, event.season, event.episode)
        {
            return Some(ScrobbleBody {
                progress,
                show: Some(ScrobbleItem {
                    title: Some(title.clone()),
                    ..ScrobbleItem::default()
                }),
                episode: Some(ScrobbleEpisode {
                    ids: None,
                    season,
                    number,
                }),
                ..ScrobbleBody::default()
            });
        }

        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MockStorage;
    use std::time::Duration;

    fn movie_event(verb: EventVerb, offset_ms: i64) -> MediaEvent {
        MediaEvent {
            player_id: "player-1".into(),
            server_id: "server-1".into(),
            rating_key: "42".into(),
            verb,
            kind: MediaKind::Movie,
            view_offset_ms: offset_ms,
            duration_ms: 7_200_000,
            tmdb_id: Some(603),
            tvdb_id: None,
            imdb_id: None,
            guid: None,
            title: Some("The Matrix".into()),
            year: Some(1999),
            show_title: None,
            season: None,
            episode: None,
        }
    }

    fn storage_without_state() -> MockStorage {
        let mut storage = MockStorage::new();
        storage.expect_get_cached_state().returning(|_, _| Ok(None));
        storage.expect_write_cached_state().returning(|_| Ok(()));
        storage
    }

    fn cached(
        action: ScrobbleAction,
        progress: i32,
        server_id: &str,
    ) -> CachedState {
        CachedState {
            player_id: "player-1".into(),
            server_id: server_id.into(),
            rating_key: "42".into(),
            last_action: action,
            last_progress_percent: progress,
            scrobble_body: ScrobbleBody {
                progress,
                movie: Some(ScrobbleItem {
                    ids: MediaIds {
                        tmdb: Some(603),
                        ..MediaIds::default()
                    },
                    title: Some("The Matrix".into()),
                    year: Some(1999),
                }),
                ..ScrobbleBody::default()
            },
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn scrobble_verb_becomes_stop_with_clamped_progress() {
        let coalescer =
            EventCoalescer::new(Arc::new(storage_without_state()), 90);
        let prepared = coalescer
            .prepare(&movie_event(EventVerb::Scrobble, 6_900_000))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(prepared.action, ScrobbleAction::Stop);
        assert_eq!(prepared.progress, 96);

        // Early scrobble clamps upward to the threshold.
        let early = coalescer
            .prepare(&{
                let mut event = movie_event(EventVerb::Scrobble, 1_000_000);
                event.player_id = "player-2".into();
                event
            })
            .await
            .unwrap()
            .unwrap();
        assert_eq!(early.progress, 90);
    }

    #[tokio::test]
    async fn pause_splits_on_threshold() {
        let coalescer =
            EventCoalescer::new(Arc::new(storage_without_state()), 90);

        let midway = coalescer
            .prepare(&movie_event(EventVerb::Pause, 3_240_000))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(midway.action, ScrobbleAction::Pause);
        assert_eq!(midway.progress, 45);

        let near_end = coalescer
            .prepare(&{
                let mut event = movie_event(EventVerb::Stop, 6_900_000);
                event.player_id = "player-2".into();
                event
            })
            .await
            .unwrap()
            .unwrap();
        assert_eq!(near_end.action, ScrobbleAction::Stop);
    }

    #[tokio::test]
    async fn duplicate_pause_is_suppressed() {
        let mut storage = MockStorage::new();
        storage.expect_get_cached_state().returning(|_, _| {
            Ok(Some(cached(ScrobbleAction::Pause, 45, "server-1")))
        });
        let coalescer = EventCoalescer::new(Arc::new(storage), 90);

        let result = coalescer
            .prepare(&movie_event(EventVerb::Pause, 3_240_000))
            .await
            .unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn finished_playback_swallows_further_events() {
        let mut storage = MockStorage::new();
        storage.expect_get_cached_state().returning(|_, _| {
            Ok(Some(cached(ScrobbleAction::Stop, 96, "server-1")))
        });
        let coalescer = EventCoalescer::new(Arc::new(storage), 90);

        let result = coalescer
            .prepare(&movie_event(EventVerb::Play, 100_000))
            .await
            .unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn same_progress_from_other_server_is_not_suppressed() {
        let mut storage = MockStorage::new();
        storage.expect_get_cached_state().returning(|_, _| {
            Ok(Some(cached(ScrobbleAction::Pause, 45, "server-other")))
        });
        let coalescer = EventCoalescer::new(Arc::new(storage), 90);

        let result = coalescer
            .prepare(&movie_event(EventVerb::Pause, 3_240_000))
            .await
            .unwrap();
        assert!(result.is_some());
    }

    #[tokio::test]
    async fn unidentifiable_media_is_skipped() {
        let coalescer =
            EventCoalescer::new(Arc::new(storage_without_state()), 90);
        let mut event = movie_event(EventVerb::Play, 0);
        event.tmdb_id = None;
        event.title = None;

        let result = coalescer.prepare(&event).await.unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn episode_falls_back_to_guid() {
        let coalescer =
            EventCoalescer::new(Arc::new(storage_without_state()), 90);
        let mut event = movie_event(EventVerb::Play, 0);
        event.kind = MediaKind::Episode;
        event.tmdb_id = None;
        event.title = None;
        event.show_title = Some("Lost".into());
        event.guid = Some(
            "com.plexapp.agents.thetvdb://73739/4/8?lang=en".into(),
        );

        let prepared = coalescer.prepare(&event).await.unwrap().unwrap();
        let show = prepared.body.show.as_ref().unwrap();
        assert_eq!(show.ids.tvdb, Some(73739));
        let episode = prepared.body.episode.as_ref().unwrap();
        assert_eq!((episode.season, episode.number), (4, 8));
    }

    #[tokio::test]
    async fn same_playback_is_serialized() {
        let coalescer = Arc::new(EventCoalescer::new(
            Arc::new(storage_without_state()),
            90,
        ));

        let first = coalescer
            .prepare(&movie_event(EventVerb::Play, 0))
            .await
            .unwrap()
            .unwrap();

        // A second event for the same key must wait for the first commit.
        let contender = {
            let coalescer = coalescer.clone();
            tokio::spawn(async move {
                coalescer
                    .prepare(&movie_event(EventVerb::Pause, 3_240_000))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!contender.is_finished());

        coalescer.commit(first).await;
        let second = contender.await.unwrap().unwrap();
        assert!(second.is_some());
    }

    #[tokio::test]
    async fn cache_read_failure_does_not_block_processing() {
        let mut storage = MockStorage::new();
        storage.expect_get_cached_state().returning(|_, _| {
            Err(crate::error::BridgeError::Database("down".into()))
        });
        let coalescer = EventCoalescer::new(Arc::new(storage), 90);

        let result = coalescer
            .prepare(&movie_event(EventVerb::Play, 0))
            .await
            .unwrap();
        assert!(result.is_some());
    }
}
