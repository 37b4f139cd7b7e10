//! Webhook ingestion.
//!
//! Plex posts `multipart/form-data` with a JSON `payload` part; some
//! compatible servers post bare JSON. Decoding is deliberately tolerant —
//! unknown fields (including the rating arrays whose shape varies by
//! client) are ignored, and any malformed payload is logged and dropped.
//! The endpoint answers `200` no matter what: a non-2xx here only provokes
//! redelivery storms from the media server.

use axum::extract::{FromRequest, Multipart, Query, Request, State};
use axum::http::{StatusCode, header};
use serde::{Deserialize, Deserializer};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use relayt_core::BroadcastRequest;
use relayt_model::{EventVerb, MediaEvent, MediaKind, UserId};

use crate::state::AppState;

const BODY_LIMIT: usize = 1024 * 1024;

#[derive(Debug, Default, Deserialize)]
pub struct WebhookParams {
    /// Which onboarded user this webhook belongs to.
    #[serde(default)]
    pub id: Option<String>,
}

/// `POST /webhook?id={user_id}`
pub async fn handle(
    State(state): State<AppState>,
    params: Query<WebhookParams>,
    request: Request,
) -> StatusCode {
    // Anything short of a valid user id is logged and swallowed; a non-200
    // would only make the media server hammer us with redeliveries.
    let user_id = params
        .0
        .id
        .and_then(|id| id.parse::<UserId>().ok());
    let Some(user_id) = user_id else {
        warn!("Webhook without a usable id parameter");
        return StatusCode::OK;
    };

    let Some(raw) = extract_payload(request).await else {
        return StatusCode::OK;
    };

    let payload: PlexPayload = match serde_json::from_slice(&raw) {
        Ok(payload) => payload,
        Err(e) => {
            warn!("Undecodable webhook payload: {e}");
            return StatusCode::OK;
        }
    };

    process(state, user_id, payload).await;
    StatusCode::OK
}

async fn extract_payload(request: Request) -> Option<Vec<u8>> {
    let is_multipart = request
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.starts_with("multipart/form-data"));

    if is_multipart {
        let mut multipart =
            match Multipart::from_request(request, &()).await {
                Ok(multipart) => multipart,
                Err(e) => {
                    warn!("Bad multipart webhook: {e}");
                    return None;
                }
            };
        loop {
            match multipart.next_field().await {
                Ok(Some(field)) if field.name() == Some("payload") => {
                    return match field.bytes().await {
                        Ok(bytes) => Some(bytes.to_vec()),
                        Err(e) => {
                            warn!("Unreadable payload part: {e}");
                            None
                        }
                    };
                }
                Ok(Some(_)) => continue,
                Ok(None) => {
                    debug!("Webhook without a payload part");
                    return None;
                }
                Err(e) => {
                    warn!("Bad multipart webhook: {e}");
                    return None;
                }
            }
        }
    }

    match axum::body::to_bytes(request.into_body(), BODY_LIMIT).await {
        Ok(bytes) if !bytes.is_empty() => Some(bytes.to_vec()),
        Ok(_) => None,
        Err(e) => {
            warn!("Unreadable webhook body: {e}");
            None
        }
    }
}

async fn process(state: AppState, user_id: UserId, payload: PlexPayload) {
    let user = match state.storage.get_user(user_id).await {
        Ok(Some(user)) => user,
        Ok(None) => {
            warn!(%user_id, "Webhook for unknown user");
            return;
        }
        Err(e) => {
            warn!("Could not load webhook user: {e}");
            return;
        }
    };

    let Some(event) = normalize(&payload, &user.username) else {
        return;
    };
    let event_id = Uuid::now_v7().to_string();

    let group = match state
        .storage
        .get_group_by_plex_username(&user.username)
        .await
    {
        Ok(Some(group)) => group,
        Ok(None) => {
            debug!(
                username = user.username,
                "No family group bound to this account"
            );
            return;
        }
        Err(e) => {
            warn!("Could not load group: {e}");
            return;
        }
    };

    let members = match state.storage.list_members(group.id).await {
        Ok(members) => members,
        Err(e) => {
            warn!("Could not load members: {e}");
            return;
        }
    };
    let members: Vec<_> = members
        .into_iter()
        .filter(|member| member.is_dispatchable())
        .collect();
    if members.is_empty() {
        debug!(group = %group.id, "No authorized members to scrobble for");
        return;
    }

    let prepared = match state.coalescer.prepare(&event).await {
        Ok(Some(prepared)) => prepared,
        Ok(None) => return,
        Err(e) => {
            warn!("Coalescer failed: {e}");
            return;
        }
    };

    let media_title = prepared.body.display_title();
    info!(
        event_id,
        action = %prepared.action,
        progress = prepared.progress,
        media = media_title,
        members = members.len(),
        "Broadcasting scrobble"
    );

    let errors = state
        .broadcaster
        .broadcast(
            &CancellationToken::new(),
            &members,
            BroadcastRequest {
                action: prepared.action,
                body: &prepared.body,
                event_id: &event_id,
                media_title: &media_title,
                player_id: &event.player_id,
                rating_key: &event.rating_key,
            },
        )
        .await;
    if !errors.is_empty() {
        warn!(
            event_id,
            failures = errors.len(),
            "Broadcast finished with member failures"
        );
    }

    state.coalescer.commit(prepared).await;
}

/// Turn a tolerated payload into the normalized event, or nothing.
fn normalize(payload: &PlexPayload, username: &str) -> Option<MediaEvent> {
    let verb = EventVerb::parse(&payload.event)?;

    // Shared servers emit webhooks for every account; only the configured
    // one is ours.
    if let Some(account) = &payload.account
        && !account.title.trim().eq_ignore_ascii_case(username)
    {
        debug!(
            account = account.title,
            "Ignoring event for another account"
        );
        return None;
    }

    let metadata = payload.metadata.as_ref()?;
    if metadata.rating_key.is_empty() {
        debug!("Ignoring event without a rating key");
        return None;
    }
    let kind = match metadata.media_type.as_str() {
        "movie" => MediaKind::Movie,
        "episode" => MediaKind::Episode,
        other => {
            debug!(media_type = other, "Ignoring unsupported media type");
            return None;
        }
    };

    let mut tmdb_id = None;
    let mut tvdb_id = None;
    let mut imdb_id = None;
    for guid in &metadata.guids {
        match guid.id.split_once("://") {
            Some(("tmdb", id)) => tmdb_id = id.parse().ok(),
            Some(("tvdb", id)) => tvdb_id = id.parse().ok(),
            Some(("imdb", id)) => imdb_id = Some(id.to_string()),
            _ => {}
        }
    }

    let (title, show_title) = match kind {
        MediaKind::Movie => (metadata.title.clone(), None),
        MediaKind::Episode => (
            metadata.title.clone(),
            metadata.grandparent_title.clone(),
        ),
    };

    Some(MediaEvent {
        player_id: payload
            .player
            .as_ref()
            .map(|p| p.uuid.clone())
            .filter(|uuid| !uuid.is_empty())?,
        server_id: payload
            .server
            .as_ref()
            .map(|s| s.uuid.clone())
            .unwrap_or_default(),
        rating_key: metadata.rating_key.clone(),
        verb,
        kind,
        view_offset_ms: metadata.view_offset.unwrap_or(0),
        duration_ms: metadata.duration.unwrap_or(0),
        tmdb_id,
        tvdb_id,
        imdb_id,
        guid: metadata.guid.clone(),
        title,
        year: metadata.year,
        show_title,
        season: metadata.parent_index,
        episode: metadata.index,
    })
}

#[derive(Debug, Deserialize)]
pub struct PlexPayload {
    #[serde(default)]
    pub event: String,
    #[serde(rename = "Account")]
    pub account: Option<PlexAccount>,
    #[serde(rename = "Server")]
    pub server: Option<PlexServer>,
    #[serde(rename = "Player")]
    pub player: Option<PlexPlayer>,
    #[serde(rename = "Metadata")]
    pub metadata: Option<PlexMetadata>,
}

#[derive(Debug, Deserialize)]
pub struct PlexAccount {
    #[serde(default)]
    pub title: String,
}

#[derive(Debug, Deserialize)]
pub struct PlexServer {
    #[serde(default)]
    pub uuid: String,
}

#[derive(Debug, Deserialize)]
pub struct PlexPlayer {
    #[serde(default)]
    pub uuid: String,
}

#[derive(Debug, Deserialize)]
pub struct PlexMetadata {
    #[serde(rename = "ratingKey", default)]
    pub rating_key: String,
    #[serde(rename = "type", default)]
    pub media_type: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(rename = "grandparentTitle", default)]
    pub grandparent_title: Option<String>,
    #[serde(default)]
    pub year: Option<u16>,
    #[serde(rename = "parentIndex", default)]
    pub parent_index: Option<u32>,
    #[serde(default)]
    pub index: Option<u32>,
    /// Milliseconds.
    #[serde(default)]
    pub duration: Option<i64>,
    #[serde(rename = "viewOffset", default)]
    pub view_offset: Option<i64>,
    #[serde(default)]
    pub guid: Option<String>,
    #[serde(rename = "Guid", default, deserialize_with = "lenient_guids")]
    pub guids: Vec<PlexGuid>,
}

#[derive(Debug, Deserialize)]
pub struct PlexGuid {
    #[serde(default)]
    pub id: String,
}

/// Accept the `Guid` field in whatever shape the server sends: an array of
/// objects, a single object, or junk (ignored).
fn lenient_guids<'de, D>(deserializer: D) -> Result<Vec<PlexGuid>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    let entries = match value {
        serde_json::Value::Array(entries) => entries,
        object @ serde_json::Value::Object(_) => vec![object],
        _ => return Ok(Vec::new()),
    };
    Ok(entries
        .into_iter()
        .filter_map(|entry| serde_json::from_value(entry).ok())
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scrobble_payload() -> &'static str {
        r#"{
            "event": "media.scrobble",
            "Account": {"title": "Household", "thumb": "ignored"},
            "Server": {"uuid": "server-1"},
            "Player": {"uuid": "player-1", "local": true},
            "Metadata": {
                "ratingKey": "42",
                "type": "movie",
                "title": "The Matrix",
                "year": 1999,
                "duration": 7200000,
                "viewOffset": 6900000,
                "Guid": [
                    {"id": "tmdb://603"},
                    {"id": "imdb://tt0133093"}
                ],
                "Rating": [{"image": "imdb://image.rating", "value": 8.7}]
            }
        }"#
    }

    #[test]
    fn normalizes_a_scrobble_event() {
        let payload: PlexPayload =
            serde_json::from_str(scrobble_payload()).unwrap();
        let event = normalize(&payload, "household").unwrap();
        assert_eq!(event.verb, EventVerb::Scrobble);
        assert_eq!(event.kind, MediaKind::Movie);
        assert_eq!(event.tmdb_id, Some(603));
        assert_eq!(event.imdb_id.as_deref(), Some("tt0133093"));
        assert_eq!(event.progress_percent(), Some(96));
    }

    #[test]
    fn ignores_other_accounts() {
        let payload: PlexPayload =
            serde_json::from_str(scrobble_payload()).unwrap();
        assert!(normalize(&payload, "somebody-else").is_none());
    }

    #[test]
    fn ignores_unknown_events_and_types() {
        let mut payload: PlexPayload =
            serde_json::from_str(scrobble_payload()).unwrap();
        payload.event = "media.rate".into();
        assert!(normalize(&payload, "household").is_none());

        let mut payload: PlexPayload =
            serde_json::from_str(scrobble_payload()).unwrap();
        payload.metadata.as_mut().unwrap().media_type = "track".into();
        assert!(normalize(&payload, "household").is_none());
    }

    #[test]
    fn tolerates_nonstandard_guid_shapes() {
        let raw = r#"{
            "event": "media.pause",
            "Account": {"title": "household"},
            "Player": {"uuid": "player-1"},
            "Metadata": {
                "ratingKey": "7",
                "type": "episode",
                "grandparentTitle": "Lost",
                "parentIndex": 4,
                "index": 8,
                "guid": "com.plexapp.agents.thetvdb://73739/4/8?lang=en",
                "Guid": "tmdb://not-an-array"
            }
        }"#;
        let payload: PlexPayload = serde_json::from_str(raw).unwrap();
        let event = normalize(&payload, "household").unwrap();
        assert_eq!(event.tmdb_id, None);
        assert_eq!(event.season, Some(4));
        assert_eq!(
            event.guid.as_deref(),
            Some("com.plexapp.agents.thetvdb://73739/4/8?lang=en")
        );
    }

    #[test]
    fn missing_player_is_rejected() {
        let raw = r#"{
            "event": "media.play",
            "Metadata": {"ratingKey": "7", "type": "movie"}
        }"#;
        let payload: PlexPayload = serde_json::from_str(raw).unwrap();
        assert!(normalize(&payload, "household").is_none());
    }
}
