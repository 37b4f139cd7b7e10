//! Admin JSON surface: onboarding, group management, notifications, queue
//! and telemetry visibility.

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use relayt_core::{HealthState, QueueStatus, TelemetryEvent};
use relayt_model::{
    AuthorizationStatus, FamilyGroup, GroupId, GroupMember, MemberId,
    Notification, NotificationId, RetryItem, User, UserId,
    group::{MAX_GROUP_MEMBERS, MIN_GROUP_MEMBERS},
    sanitize_display_name,
};

use crate::errors::{AppError, AppResult};
use crate::state::AppState;

/// Member shape exposed to the admin surface; tokens stay server-side.
#[derive(Debug, Serialize)]
pub struct MemberView {
    pub id: MemberId,
    pub temp_label: String,
    pub trakt_username: Option<String>,
    pub authorization_status: AuthorizationStatus,
    pub token_expiry: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl From<GroupMember> for MemberView {
    fn from(member: GroupMember) -> Self {
        Self {
            id: member.id,
            temp_label: member.temp_label,
            trakt_username: member.trakt_username,
            authorization_status: member.authorization_status,
            token_expiry: member.token_expiry,
            created_at: member.created_at,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct GroupView {
    #[serde(flatten)]
    pub group: FamilyGroup,
    pub members: Vec<MemberView>,
}

// -- Liveness --

#[derive(Debug, Serialize)]
pub struct Healthz {
    pub status: &'static str,
    pub storage: &'static str,
    pub upstream: HealthState,
}

pub async fn healthz(State(state): State<AppState>) -> Json<Healthz> {
    let storage = match state.storage.ping().await {
        Ok(()) => "up",
        Err(_) => "down",
    };
    Json(Healthz {
        status: if storage == "up" { "ok" } else { "degraded" },
        storage,
        upstream: state.health.state(),
    })
}

// -- User onboarding --

#[derive(Debug, Deserialize)]
pub struct OnboardUserRequest {
    pub username: String,
    /// OAuth authorization code from the upstream consent flow.
    pub code: String,
}

#[derive(Debug, Serialize)]
pub struct UserView {
    pub id: UserId,
    pub username: String,
    pub display_name: Option<String>,
    pub token_expiry: DateTime<Utc>,
}

pub async fn onboard_user(
    State(state): State<AppState>,
    Json(request): Json<OnboardUserRequest>,
) -> AppResult<(StatusCode, Json<UserView>)> {
    if request.username.trim().is_empty() {
        return Err(AppError::bad_request("username must be non-empty"));
    }
    if state
        .storage
        .get_user_by_name(&request.username)
        .await?
        .is_some()
    {
        return Err(AppError::conflict("username already onboarded"));
    }

    let grant = state
        .api
        .exchange_code(&request.code)
        .await
        .map_err(|e| AppError::bad_request(e.to_string()))?;

    let mut user = User::new(
        &request.username,
        grant.access_token.clone(),
        grant.refresh_token.clone(),
        grant.expiry(),
    );
    if let Ok(settings) = state.api.user_settings(&grant.access_token).await
        && let Some((name, truncated)) = settings.display_name()
    {
        if truncated {
            info!(username = user.username, "Display name truncated");
        }
        user.display_name = Some(name);
    }
    state.storage.write_user(&user).await?;
    info!(username = user.username, "User onboarded");

    Ok((
        StatusCode::CREATED,
        Json(UserView {
            id: user.id,
            username: user.username,
            display_name: user.display_name,
            token_expiry: user.token_expiry,
        }),
    ))
}

pub async fn list_users(
    State(state): State<AppState>,
) -> AppResult<Json<Vec<UserView>>> {
    let users = state.storage.list_users().await?;
    Ok(Json(
        users
            .into_iter()
            .map(|user| UserView {
                id: user.id,
                username: user.username,
                display_name: user.display_name,
                token_expiry: user.token_expiry,
            })
            .collect(),
    ))
}

// -- Family groups --

#[derive(Debug, Deserialize)]
pub struct CreateGroupRequest {
    pub plex_username: String,
    /// One label per seat; members start `pending` until they authorize.
    pub member_labels: Vec<String>,
}

pub async fn create_group(
    State(state): State<AppState>,
    Json(request): Json<CreateGroupRequest>,
) -> AppResult<(StatusCode, Json<GroupView>)> {
    if request.member_labels.len() < MIN_GROUP_MEMBERS
        || request.member_labels.len() > MAX_GROUP_MEMBERS
    {
        return Err(AppError::bad_request(format!(
            "groups need between {MIN_GROUP_MEMBERS} and {MAX_GROUP_MEMBERS} members"
        )));
    }
    if state
        .storage
        .get_group_by_plex_username(&request.plex_username)
        .await?
        .is_some()
    {
        return Err(AppError::conflict("group already exists"));
    }

    let group = FamilyGroup::new(&request.plex_username)
        .map_err(|e| AppError::bad_request(e.to_string()))?;
    state.storage.create_group(&group).await?;

    let mut members = Vec::with_capacity(request.member_labels.len());
    for label in &request.member_labels {
        let member = GroupMember::new(group.id, label)
            .map_err(|e| AppError::bad_request(e.to_string()))?;
        state.storage.upsert_member(&member).await?;
        members.push(member.into());
    }
    info!(group = %group.id, "Family group created");

    Ok((
        StatusCode::CREATED,
        Json(GroupView { group, members }),
    ))
}

pub async fn list_groups(
    State(state): State<AppState>,
) -> AppResult<Json<Vec<FamilyGroup>>> {
    Ok(Json(state.storage.list_groups().await?))
}

pub async fn get_group(
    State(state): State<AppState>,
    Path(group_id): Path<GroupId>,
) -> AppResult<Json<GroupView>> {
    let group = state
        .storage
        .get_group(group_id)
        .await?
        .ok_or_else(|| AppError::not_found("no such group"))?;
    let members = state.storage.list_members(group_id).await?;
    Ok(Json(GroupView {
        group,
        members: members.into_iter().map(Into::into).collect(),
    }))
}

pub async fn delete_group(
    State(state): State<AppState>,
    Path(group_id): Path<GroupId>,
) -> AppResult<StatusCode> {
    state.storage.delete_group(group_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
pub struct AddMemberRequest {
    pub temp_label: String,
}

pub async fn add_member(
    State(state): State<AppState>,
    Path(group_id): Path<GroupId>,
    Json(request): Json<AddMemberRequest>,
) -> AppResult<(StatusCode, Json<MemberView>)> {
    let group = state
        .storage
        .get_group(group_id)
        .await?
        .ok_or_else(|| AppError::not_found("no such group"))?;
    let members = state.storage.list_members(group_id).await?;
    if members.len() >= MAX_GROUP_MEMBERS {
        return Err(AppError::conflict(format!(
            "group is full ({MAX_GROUP_MEMBERS} members)"
        )));
    }

    let member = GroupMember::new(group.id, &request.temp_label)
        .map_err(|e| AppError::bad_request(e.to_string()))?;
    state.storage.upsert_member(&member).await?;
    state.notifier.member_added(group.id, &member).await;

    Ok((StatusCode::CREATED, Json(member.into())))
}

pub async fn remove_member(
    State(state): State<AppState>,
    Path(member_id): Path<MemberId>,
) -> AppResult<StatusCode> {
    let member = state
        .storage
        .get_member(member_id)
        .await?
        .ok_or_else(|| AppError::not_found("no such member"))?;
    let members = state
        .storage
        .list_members(member.family_group_id)
        .await?;
    if members.len() <= MIN_GROUP_MEMBERS {
        return Err(AppError::conflict(format!(
            "groups keep at least {MIN_GROUP_MEMBERS} members"
        )));
    }

    state.storage.delete_member(member_id).await?;
    state
        .notifier
        .member_removed(member.family_group_id, member.label())
        .await;
    Ok(StatusCode::NO_CONTENT)
}

// -- OAuth code exchange --

#[derive(Debug, Deserialize)]
pub struct ExchangeRequest {
    pub member_id: MemberId,
    pub code: String,
}

pub async fn exchange_member_code(
    State(state): State<AppState>,
    Json(request): Json<ExchangeRequest>,
) -> AppResult<Json<MemberView>> {
    let mut member = state
        .storage
        .get_member(request.member_id)
        .await?
        .ok_or_else(|| AppError::not_found("no such member"))?;

    let grant = state
        .api
        .exchange_code(&request.code)
        .await
        .map_err(|e| AppError::bad_request(e.to_string()))?;
    let settings = state
        .api
        .user_settings(&grant.access_token)
        .await
        .map_err(|e| AppError::bad_request(e.to_string()))?;
    let username = settings
        .username()
        .map(|name| sanitize_display_name(name).0)
        .ok_or_else(|| {
            AppError::bad_request("upstream did not report a username")
        })?;

    member.authorize(
        &username,
        grant.access_token.clone(),
        grant.refresh_token.clone(),
        grant.expiry(),
    );
    state.storage.upsert_member(&member).await?;
    info!(
        member = %member.id,
        username, "Member authorized"
    );

    Ok(Json(member.into()))
}

// -- Notifications --

#[derive(Debug, Deserialize)]
pub struct NotificationsQuery {
    pub group_id: GroupId,
    #[serde(default)]
    pub include_dismissed: bool,
}

pub async fn list_notifications(
    State(state): State<AppState>,
    Query(query): Query<NotificationsQuery>,
) -> AppResult<Json<Vec<Notification>>> {
    Ok(Json(
        state
            .storage
            .get_notifications(query.group_id, query.include_dismissed)
            .await?,
    ))
}

pub async fn dismiss_notification(
    State(state): State<AppState>,
    Path(notification_id): Path<NotificationId>,
) -> AppResult<StatusCode> {
    state.storage.dismiss_notification(notification_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn delete_notification(
    State(state): State<AppState>,
    Path(notification_id): Path<NotificationId>,
) -> AppResult<StatusCode> {
    state.storage.delete_notification(notification_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

// -- Retry queue visibility --

pub async fn list_group_retries(
    State(state): State<AppState>,
    Path(group_id): Path<GroupId>,
) -> AppResult<Json<Vec<RetryItem>>> {
    Ok(Json(state.storage.list_retry_items(group_id).await?))
}

// -- Queue status --

#[derive(Debug, Serialize)]
pub struct QueueOverview {
    pub mode: relayt_core::Mode,
    pub queues: Vec<UserQueue>,
    pub drainers: Vec<QueueStatus>,
}

#[derive(Debug, Serialize)]
pub struct UserQueue {
    pub user_id: UserId,
    pub queue_size: usize,
}

pub async fn queue_status(
    State(state): State<AppState>,
) -> AppResult<Json<QueueOverview>> {
    let users = state.storage.users_with_queued_events().await?;
    let mut queues = Vec::with_capacity(users.len());
    for user_id in users {
        let queue_size = state.storage.queue_size(user_id).await?;
        queues.push(UserQueue {
            user_id,
            queue_size,
        });
    }
    Ok(Json(QueueOverview {
        mode: state.health.mode(),
        queues,
        drainers: state.drainer.status(),
    }))
}

// -- Telemetry --

#[derive(Debug, Deserialize)]
pub struct TelemetryQuery {
    #[serde(default = "default_telemetry_limit")]
    pub limit: usize,
}

fn default_telemetry_limit() -> usize {
    50
}

pub async fn telemetry(
    State(state): State<AppState>,
    Query(query): Query<TelemetryQuery>,
) -> Json<Vec<TelemetryEvent>> {
    Json(state.telemetry.recent(query.limit))
}
