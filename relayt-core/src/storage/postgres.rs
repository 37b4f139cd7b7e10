use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use tracing::{debug, info};
use uuid::Uuid;

use relayt_model::{
    AuthorizationStatus, CachedState, FamilyGroup, GroupId, GroupMember,
    MemberId, Notification, NotificationId, NotificationType, QueuedEvent,
    QueuedEventId, RetryItem, RetryItemId, RetryStatus, User, UserId,
};

use super::Storage;
use crate::error::{BridgeError, Result};

/// Authoritative backend. The only one that can run the retry engine: the
/// lease relies on `FOR UPDATE SKIP LOCKED`.
#[derive(Debug, Clone)]
pub struct PostgresStorage {
    pool: PgPool,
}

impl PostgresStorage {
    pub async fn new(connection_string: &str) -> Result<Self> {
        info!("Connecting to PostgreSQL");

        let pool = PgPoolOptions::new()
            .max_connections(20)
            .connect(connection_string)
            .await
            .map_err(|e| {
                BridgeError::Database(format!(
                    "Failed to connect to PostgreSQL: {e}"
                ))
            })?;

        info!("Successfully connected to PostgreSQL");

        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create the schema when it does not exist yet.
    pub async fn initialize_schema(&self) -> Result<()> {
        info!("Ensuring database schema");

        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(|e| {
                    BridgeError::Database(format!(
                        "Schema statement failed: {e}"
                    ))
                })?;
        }

        Ok(())
    }

    fn map_user(row: &sqlx::postgres::PgRow) -> Result<User> {
        Ok(User {
            id: UserId(row.get::<Uuid, _>("id")),
            username: row.get("username"),
            access_token: row.get("access_token"),
            refresh_token: row.get("refresh_token"),
            token_expiry: row.get("token_expiry"),
            display_name: row.get("display_name"),
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
        })
    }

    fn map_member(row: &sqlx::postgres::PgRow) -> Result<GroupMember> {
        let status: String = row.get("authorization_status");
        Ok(GroupMember {
            id: MemberId(row.get::<Uuid, _>("id")),
            family_group_id: GroupId(row.get::<Uuid, _>("family_group_id")),
            temp_label: row.get("temp_label"),
            trakt_username: row.get("trakt_username"),
            access_token: row.get("access_token"),
            refresh_token: row.get("refresh_token"),
            token_expiry: row.get("token_expiry"),
            authorization_status: status
                .parse::<AuthorizationStatus>()
                .map_err(|e| BridgeError::Database(e.to_string()))?,
            created_at: row.get("created_at"),
        })
    }

    fn map_retry_item(row: &sqlx::postgres::PgRow) -> Result<RetryItem> {
        let status: String = row.get("status");
        Ok(RetryItem {
            id: RetryItemId(row.get::<Uuid, _>("id")),
            family_group_id: GroupId(row.get::<Uuid, _>("family_group_id")),
            group_member_id: MemberId(row.get::<Uuid, _>("group_member_id")),
            payload: row.get("payload"),
            attempt_count: i32::from(row.get::<i16, _>("attempt_count")),
            next_attempt_at: row.get("next_attempt_at"),
            last_error: row.get("last_error"),
            status: status
                .parse::<RetryStatus>()
                .map_err(|e| BridgeError::Database(e.to_string()))?,
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
        })
    }

    fn map_queued_event(row: &sqlx::postgres::PgRow) -> Result<QueuedEvent> {
        let action: String = row.get("action");
        Ok(QueuedEvent {
            id: QueuedEventId(row.get::<Uuid, _>("id")),
            user_id: UserId(row.get::<Uuid, _>("user_id")),
            scrobble_body: serde_json::from_value(row.get("scrobble_body"))?,
            action: action
                .parse()
                .map_err(|e: relayt_model::ModelError| {
                    BridgeError::Database(e.to_string())
                })?,
            progress: row.get("progress"),
            created_at: row.get("created_at"),
            retry_count: row.get("retry_count"),
            last_attempt: row.get("last_attempt"),
            player_id: row.get("player_uuid"),
            rating_key: row.get("rating_key"),
        })
    }

    fn map_notification(row: &sqlx::postgres::PgRow) -> Result<Notification> {
        let kind: String = row.get("notification_type");
        Ok(Notification {
            id: NotificationId(row.get::<Uuid, _>("id")),
            family_group_id: GroupId(row.get::<Uuid, _>("family_group_id")),
            group_member_id: row
                .get::<Option<Uuid>, _>("group_member_id")
                .map(MemberId),
            notification_type: kind
                .parse::<NotificationType>()
                .map_err(|e| BridgeError::Database(e.to_string()))?,
            message: row.get("message"),
            metadata: row.get("metadata"),
            dismissed: row.get("dismissed"),
            created_at: row.get("created_at"),
        })
    }
}

#[async_trait]
impl Storage for PostgresStorage {
    async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| BridgeError::Database(format!("Ping failed: {e}")))?;
        Ok(())
    }

    fn supports_retry_queue(&self) -> bool {
        true
    }

    async fn write_user(&self, user: &User) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO users (id, username, access_token, refresh_token,
                               token_expiry, display_name, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, NOW())
            ON CONFLICT (id) DO UPDATE
            SET username = EXCLUDED.username,
                access_token = EXCLUDED.access_token,
                refresh_token = EXCLUDED.refresh_token,
                token_expiry = EXCLUDED.token_expiry,
                display_name = EXCLUDED.display_name,
                updated_at = NOW()
            "#,
        )
        .bind(user.id.to_uuid())
        .bind(&user.username)
        .bind(&user.access_token)
        .bind(&user.refresh_token)
        .bind(user.token_expiry)
        .bind(&user.display_name)
        .bind(user.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            BridgeError::Database(format!("Failed to write user: {e}"))
        })?;
        Ok(())
    }

    async fn get_user(&self, id: UserId) -> Result<Option<User>> {
        let row = sqlx::query("SELECT * FROM users WHERE id = $1")
            .bind(id.to_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| {
                BridgeError::Database(format!("Failed to get user: {e}"))
            })?;
        row.as_ref().map(Self::map_user).transpose()
    }

    async fn get_user_by_name(&self, username: &str) -> Result<Option<User>> {
        let row =
            sqlx::query("SELECT * FROM users WHERE username = LOWER($1)")
                .bind(username)
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| {
                    BridgeError::Database(format!(
                        "Failed to get user by name: {e}"
                    ))
                })?;
        row.as_ref().map(Self::map_user).transpose()
    }

    async fn delete_user(&self, id: UserId) -> Result<()> {
        sqlx::query("DELETE FROM users WHERE id = $1")
            .bind(id.to_uuid())
            .execute(&self.pool)
            .await
            .map_err(|e| {
                BridgeError::Database(format!("Failed to delete user: {e}"))
            })?;
        Ok(())
    }

    async fn list_users(&self) -> Result<Vec<User>> {
        let rows =
            sqlx::query("SELECT * FROM users ORDER BY updated_at DESC")
                .fetch_all(&self.pool)
                .await
                .map_err(|e| {
                    BridgeError::Database(format!(
                        "Failed to list users: {e}"
                    ))
                })?;
        rows.iter().map(Self::map_user).collect()
    }

    async fn get_cached_state(
        &self,
        player_id: &str,
        rating_key: &str,
    ) -> Result<Option<CachedState>> {
        let cutoff = Utc::now() - Duration::seconds(CachedState::TTL_SECS);
        let row = sqlx::query(
            r#"
            SELECT * FROM cached_states
            WHERE player_id = $1 AND rating_key = $2 AND updated_at > $3
            "#,
        )
        .bind(player_id)
        .bind(rating_key)
        .bind(cutoff)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            BridgeError::Database(format!("Failed to get cached state: {e}"))
        })?;

        row.map(|row| {
            let action: String = row.get("last_action");
            Ok(CachedState {
                player_id: row.get("player_id"),
                server_id: row.get("server_id"),
                rating_key: row.get("rating_key"),
                last_action: action.parse().map_err(
                    |e: relayt_model::ModelError| {
                        BridgeError::Database(e.to_string())
                    },
                )?,
                last_progress_percent: row.get("last_progress_percent"),
                scrobble_body: serde_json::from_value(
                    row.get("scrobble_body"),
                )?,
                updated_at: row.get("updated_at"),
            })
        })
        .transpose()
    }

    async fn write_cached_state(&self, state: &CachedState) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO cached_states (player_id, server_id, rating_key,
                                       last_action, last_progress_percent,
                                       scrobble_body, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, NOW())
            ON CONFLICT (player_id, rating_key) DO UPDATE
            SET server_id = EXCLUDED.server_id,
                last_action = EXCLUDED.last_action,
                last_progress_percent = EXCLUDED.last_progress_percent,
                scrobble_body = EXCLUDED.scrobble_body,
                updated_at = NOW()
            "#,
        )
        .bind(&state.player_id)
        .bind(&state.server_id)
        .bind(&state.rating_key)
        .bind(state.last_action.as_str())
        .bind(state.last_progress_percent)
        .bind(serde_json::to_value(&state.scrobble_body)?)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            BridgeError::Database(format!(
                "Failed to write cached state: {e}"
            ))
        })?;
        Ok(())
    }

    async fn create_group(&self, group: &FamilyGroup) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO family_groups (id, plex_username, created_at, updated_at)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(group.id.to_uuid())
        .bind(&group.plex_username)
        .bind(group.created_at)
        .bind(group.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            BridgeError::Database(format!("Failed to create group: {e}"))
        })?;
        Ok(())
    }

    async fn get_group(&self, id: GroupId) -> Result<Option<FamilyGroup>> {
        let row = sqlx::query("SELECT * FROM family_groups WHERE id = $1")
            .bind(id.to_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| {
                BridgeError::Database(format!("Failed to get group: {e}"))
            })?;
        Ok(row.map(|row| FamilyGroup {
            id: GroupId(row.get::<Uuid, _>("id")),
            plex_username: row.get("plex_username"),
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
        }))
    }

    async fn get_group_by_plex_username(
        &self,
        plex_username: &str,
    ) -> Result<Option<FamilyGroup>> {
        let row = sqlx::query(
            "SELECT * FROM family_groups WHERE plex_username = LOWER($1)",
        )
        .bind(plex_username)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            BridgeError::Database(format!(
                "Failed to get group by name: {e}"
            ))
        })?;
        Ok(row.map(|row| FamilyGroup {
            id: GroupId(row.get::<Uuid, _>("id")),
            plex_username: row.get("plex_username"),
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
        }))
    }

    async fn delete_group(&self, id: GroupId) -> Result<()> {
        // Members, retry items, and notifications go with it via FK cascade.
        sqlx::query("DELETE FROM family_groups WHERE id = $1")
            .bind(id.to_uuid())
            .execute(&self.pool)
            .await
            .map_err(|e| {
                BridgeError::Database(format!("Failed to delete group: {e}"))
            })?;
        Ok(())
    }

    async fn list_groups(&self) -> Result<Vec<FamilyGroup>> {
        let rows = sqlx::query(
            "SELECT * FROM family_groups ORDER BY updated_at DESC",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            BridgeError::Database(format!("Failed to list groups: {e}"))
        })?;
        Ok(rows
            .into_iter()
            .map(|row| FamilyGroup {
                id: GroupId(row.get::<Uuid, _>("id")),
                plex_username: row.get("plex_username"),
                created_at: row.get("created_at"),
                updated_at: row.get("updated_at"),
            })
            .collect())
    }

    async fn upsert_member(&self, member: &GroupMember) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO group_members (id, family_group_id, temp_label,
                                       trakt_username, access_token,
                                       refresh_token, token_expiry,
                                       authorization_status, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (id) DO UPDATE
            SET temp_label = EXCLUDED.temp_label,
                trakt_username = EXCLUDED.trakt_username,
                access_token = EXCLUDED.access_token,
                refresh_token = EXCLUDED.refresh_token,
                token_expiry = EXCLUDED.token_expiry,
                authorization_status = EXCLUDED.authorization_status
            "#,
        )
        .bind(member.id.to_uuid())
        .bind(member.family_group_id.to_uuid())
        .bind(&member.temp_label)
        .bind(&member.trakt_username)
        .bind(&member.access_token)
        .bind(&member.refresh_token)
        .bind(member.token_expiry)
        .bind(member.authorization_status.as_str())
        .bind(member.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            BridgeError::Database(format!("Failed to upsert member: {e}"))
        })?;
        Ok(())
    }

    async fn get_member(&self, id: MemberId) -> Result<Option<GroupMember>> {
        let row = sqlx::query("SELECT * FROM group_members WHERE id = $1")
            .bind(id.to_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| {
                BridgeError::Database(format!("Failed to get member: {e}"))
            })?;
        row.as_ref().map(Self::map_member).transpose()
    }

    async fn list_members(&self, group: GroupId) -> Result<Vec<GroupMember>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM group_members
            WHERE family_group_id = $1
            ORDER BY created_at ASC
            "#,
        )
        .bind(group.to_uuid())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            BridgeError::Database(format!("Failed to list members: {e}"))
        })?;
        rows.iter().map(Self::map_member).collect()
    }

    async fn delete_member(&self, id: MemberId) -> Result<()> {
        sqlx::query("DELETE FROM group_members WHERE id = $1")
            .bind(id.to_uuid())
            .execute(&self.pool)
            .await
            .map_err(|e| {
                BridgeError::Database(format!(
                    "Failed to delete member: {e}"
                ))
            })?;
        Ok(())
    }

    async fn set_member_status(
        &self,
        id: MemberId,
        status: AuthorizationStatus,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE group_members SET authorization_status = $1 WHERE id = $2",
        )
        .bind(status.as_str())
        .bind(id.to_uuid())
        .execute(&self.pool)
        .await
        .map_err(|e| {
            BridgeError::Database(format!(
                "Failed to set member status: {e}"
            ))
        })?;
        Ok(())
    }

    async fn enqueue_scrobble(
        &self,
        event: &QueuedEvent,
        capacity: usize,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO queued_scrobbles (id, user_id, scrobble_body, action,
                                          progress, created_at, retry_count,
                                          last_attempt, player_uuid, rating_key)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (player_uuid, rating_key) DO UPDATE
            SET scrobble_body = EXCLUDED.scrobble_body,
                action = EXCLUDED.action,
                progress = EXCLUDED.progress,
                retry_count = 0,
                last_attempt = NULL
            "#,
        )
        .bind(event.id.to_uuid())
        .bind(event.user_id.to_uuid())
        .bind(serde_json::to_value(&event.scrobble_body)?)
        .bind(event.action.as_str())
        .bind(event.progress)
        .bind(event.created_at)
        .bind(event.retry_count)
        .bind(event.last_attempt)
        .bind(&event.player_id)
        .bind(&event.rating_key)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            BridgeError::Database(format!(
                "Failed to enqueue scrobble: {e}"
            ))
        })?;

        // FIFO eviction past the per-user cap.
        let evicted = sqlx::query(
            r#"
            DELETE FROM queued_scrobbles
            WHERE id IN (
                SELECT id FROM queued_scrobbles
                WHERE user_id = $1
                ORDER BY created_at DESC
                OFFSET $2
            )
            "#,
        )
        .bind(event.user_id.to_uuid())
        .bind(capacity as i64)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            BridgeError::Database(format!("Queue eviction failed: {e}"))
        })?;

        if evicted.rows_affected() > 0 {
            debug!(
                user_id = %event.user_id,
                evicted = evicted.rows_affected(),
                "Evicted oldest queued scrobbles past capacity"
            );
        }

        Ok(())
    }

    async fn dequeue_oldest(
        &self,
        user_id: UserId,
        limit: i64,
    ) -> Result<Vec<QueuedEvent>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM queued_scrobbles
            WHERE user_id = $1
            ORDER BY created_at ASC
            LIMIT $2
            "#,
        )
        .bind(user_id.to_uuid())
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            BridgeError::Database(format!("Failed to dequeue: {e}"))
        })?;
        rows.iter().map(Self::map_queued_event).collect()
    }

    async fn delete_queued_scrobble(&self, id: QueuedEventId) -> Result<()> {
        sqlx::query("DELETE FROM queued_scrobbles WHERE id = $1")
            .bind(id.to_uuid())
            .execute(&self.pool)
            .await
            .map_err(|e| {
                BridgeError::Database(format!(
                    "Failed to delete queued scrobble: {e}"
                ))
            })?;
        Ok(())
    }

    async fn update_retry_count(
        &self,
        id: QueuedEventId,
        retry_count: i32,
        last_attempt: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE queued_scrobbles
            SET retry_count = $1, last_attempt = $2
            WHERE id = $3
            "#,
        )
        .bind(retry_count)
        .bind(last_attempt)
        .bind(id.to_uuid())
        .execute(&self.pool)
        .await
        .map_err(|e| {
            BridgeError::Database(format!(
                "Failed to update retry count: {e}"
            ))
        })?;
        Ok(())
    }

    async fn queue_size(&self, user_id: UserId) -> Result<usize> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM queued_scrobbles WHERE user_id = $1",
        )
        .bind(user_id.to_uuid())
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            BridgeError::Database(format!("Failed to size queue: {e}"))
        })?;
        Ok(count as usize)
    }

    async fn users_with_queued_events(&self) -> Result<Vec<UserId>> {
        let rows = sqlx::query(
            "SELECT DISTINCT user_id FROM queued_scrobbles",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            BridgeError::Database(format!(
                "Failed to list queued users: {e}"
            ))
        })?;
        Ok(rows
            .into_iter()
            .map(|row| UserId(row.get::<Uuid, _>("user_id")))
            .collect())
    }

    async fn purge_queue_for_user(&self, user_id: UserId) -> Result<()> {
        sqlx::query("DELETE FROM queued_scrobbles WHERE user_id = $1")
            .bind(user_id.to_uuid())
            .execute(&self.pool)
            .await
            .map_err(|e| {
                BridgeError::Database(format!("Failed to purge queue: {e}"))
            })?;
        Ok(())
    }

    async fn enqueue_retry_item(&self, item: &RetryItem) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO retry_queue_items (id, family_group_id, group_member_id,
                                           payload, attempt_count,
                                           next_attempt_at, last_error, status,
                                           created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(item.id.to_uuid())
        .bind(item.family_group_id.to_uuid())
        .bind(item.group_member_id.to_uuid())
        .bind(&item.payload)
        .bind(item.attempt_count as i16)
        .bind(item.next_attempt_at)
        .bind(&item.last_error)
        .bind(item.status.as_str())
        .bind(item.created_at)
        .bind(item.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            BridgeError::Database(format!(
                "Failed to enqueue retry item: {e}"
            ))
        })?;
        Ok(())
    }

    async fn lease_due_retry_items(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<RetryItem>> {
        let mut tx = self.pool.begin().await.map_err(|e| {
            BridgeError::Database(format!("Failed to begin lease tx: {e}"))
        })?;

        // Due `retrying` rows qualify too: that is how items stranded by a
        // crashed worker come back without a separate reaper.
        let rows = sqlx::query(
            r#"
            UPDATE retry_queue_items
            SET status = 'retrying', updated_at = NOW()
            WHERE id = ANY(
                SELECT id FROM retry_queue_items
                WHERE status IN ('queued', 'retrying')
                  AND next_attempt_at <= $1
                ORDER BY next_attempt_at ASC
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            RETURNING *
            "#,
        )
        .bind(now)
        .bind(limit)
        .fetch_all(&mut *tx)
        .await
        .map_err(|e| {
            BridgeError::Database(format!("Lease select failed: {e}"))
        })?;

        tx.commit().await.map_err(|e| {
            BridgeError::Database(format!("Lease commit failed: {e}"))
        })?;

        rows.iter().map(Self::map_retry_item).collect()
    }

    async fn mark_retry_success(&self, id: RetryItemId) -> Result<()> {
        sqlx::query("DELETE FROM retry_queue_items WHERE id = $1")
            .bind(id.to_uuid())
            .execute(&self.pool)
            .await
            .map_err(|e| {
                BridgeError::Database(format!(
                    "Failed to finalize retry success: {e}"
                ))
            })?;
        Ok(())
    }

    async fn mark_retry_failure(
        &self,
        id: RetryItemId,
        attempt_count: i32,
        next_attempt_at: DateTime<Utc>,
        last_error: &str,
        permanent: bool,
    ) -> Result<()> {
        let status = if permanent {
            RetryStatus::PermanentFailure
        } else {
            RetryStatus::Queued
        };
        sqlx::query(
            r#"
            UPDATE retry_queue_items
            SET attempt_count = $1,
                next_attempt_at = $2,
                last_error = $3,
                status = $4,
                updated_at = NOW()
            WHERE id = $5
            "#,
        )
        .bind(attempt_count as i16)
        .bind(next_attempt_at)
        .bind(last_error)
        .bind(status.as_str())
        .bind(id.to_uuid())
        .execute(&self.pool)
        .await
        .map_err(|e| {
            BridgeError::Database(format!(
                "Failed to record retry failure: {e}"
            ))
        })?;
        Ok(())
    }

    async fn list_retry_items(
        &self,
        group: GroupId,
    ) -> Result<Vec<RetryItem>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM retry_queue_items
            WHERE family_group_id = $1
            ORDER BY next_attempt_at ASC
            "#,
        )
        .bind(group.to_uuid())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            BridgeError::Database(format!(
                "Failed to list retry items: {e}"
            ))
        })?;
        rows.iter().map(Self::map_retry_item).collect()
    }

    async fn create_notification(
        &self,
        notification: &Notification,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO notifications (id, family_group_id, group_member_id,
                                       notification_type, message, metadata,
                                       dismissed, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(notification.id.to_uuid())
        .bind(notification.family_group_id.to_uuid())
        .bind(notification.group_member_id.map(|id| id.to_uuid()))
        .bind(notification.notification_type.as_str())
        .bind(&notification.message)
        .bind(&notification.metadata)
        .bind(notification.dismissed)
        .bind(notification.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            BridgeError::Database(format!(
                "Failed to create notification: {e}"
            ))
        })?;
        Ok(())
    }

    async fn get_notifications(
        &self,
        group: GroupId,
        include_dismissed: bool,
    ) -> Result<Vec<Notification>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM notifications
            WHERE family_group_id = $1 AND (dismissed = FALSE OR $2)
            ORDER BY created_at DESC
            "#,
        )
        .bind(group.to_uuid())
        .bind(include_dismissed)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            BridgeError::Database(format!(
                "Failed to get notifications: {e}"
            ))
        })?;
        rows.iter().map(Self::map_notification).collect()
    }

    async fn dismiss_notification(&self, id: NotificationId) -> Result<()> {
        sqlx::query(
            "UPDATE notifications SET dismissed = TRUE WHERE id = $1",
        )
        .bind(id.to_uuid())
        .execute(&self.pool)
        .await
        .map_err(|e| {
            BridgeError::Database(format!(
                "Failed to dismiss notification: {e}"
            ))
        })?;
        Ok(())
    }

    async fn delete_notification(&self, id: NotificationId) -> Result<()> {
        sqlx::query("DELETE FROM notifications WHERE id = $1")
            .bind(id.to_uuid())
            .execute(&self.pool)
            .await
            .map_err(|e| {
                BridgeError::Database(format!(
                    "Failed to delete notification: {e}"
                ))
            })?;
        Ok(())
    }
}

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS users (
        id UUID PRIMARY KEY,
        username TEXT UNIQUE NOT NULL CHECK (length(username) > 0),
        access_token TEXT NOT NULL,
        refresh_token TEXT NOT NULL,
        token_expiry TIMESTAMPTZ NOT NULL,
        display_name TEXT,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS family_groups (
        id UUID PRIMARY KEY,
        plex_username TEXT UNIQUE NOT NULL CHECK (length(plex_username) > 0),
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS group_members (
        id UUID PRIMARY KEY,
        family_group_id UUID NOT NULL
            REFERENCES family_groups(id) ON DELETE CASCADE,
        temp_label TEXT NOT NULL
            CHECK (length(temp_label) BETWEEN 1 AND 100),
        trakt_username TEXT,
        access_token TEXT,
        refresh_token TEXT,
        token_expiry TIMESTAMPTZ,
        authorization_status TEXT NOT NULL
            CHECK (authorization_status IN
                ('pending', 'authorized', 'expired', 'failed')),
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        UNIQUE (family_group_id, trakt_username)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS retry_queue_items (
        id UUID PRIMARY KEY,
        family_group_id UUID NOT NULL
            REFERENCES family_groups(id) ON DELETE CASCADE,
        group_member_id UUID NOT NULL
            REFERENCES group_members(id) ON DELETE CASCADE,
        payload JSONB NOT NULL,
        attempt_count SMALLINT NOT NULL DEFAULT 0
            CHECK (attempt_count BETWEEN 0 AND 5),
        next_attempt_at TIMESTAMPTZ NOT NULL,
        last_error TEXT,
        status TEXT NOT NULL
            CHECK (status IN ('queued', 'retrying', 'permanent_failure')),
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_retry_queue_due
        ON retry_queue_items (status, next_attempt_at)
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS notifications (
        id UUID PRIMARY KEY,
        family_group_id UUID NOT NULL
            REFERENCES family_groups(id) ON DELETE CASCADE,
        group_member_id UUID
            REFERENCES group_members(id) ON DELETE CASCADE,
        notification_type TEXT NOT NULL
            CHECK (notification_type IN
                ('permanent_failure', 'authorization_expired',
                 'member_added', 'member_removed')),
        message TEXT NOT NULL,
        metadata JSONB,
        dismissed BOOLEAN NOT NULL DEFAULT FALSE,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_notifications_feed
        ON notifications (family_group_id, dismissed, created_at DESC)
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS queued_scrobbles (
        id UUID PRIMARY KEY,
        user_id UUID NOT NULL REFERENCES users(id) ON DELETE CASCADE,
        scrobble_body JSONB NOT NULL,
        action TEXT NOT NULL CHECK (action IN ('start', 'pause', 'stop')),
        progress INTEGER NOT NULL CHECK (progress BETWEEN 0 AND 100),
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        retry_count INTEGER NOT NULL DEFAULT 0
            CHECK (retry_count BETWEEN 0 AND 5),
        last_attempt TIMESTAMPTZ,
        player_uuid TEXT NOT NULL,
        rating_key TEXT NOT NULL,
        UNIQUE (player_uuid, rating_key)
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_queued_scrobbles_user
        ON queued_scrobbles (user_id, created_at)
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS cached_states (
        player_id TEXT NOT NULL,
        server_id TEXT NOT NULL,
        rating_key TEXT NOT NULL,
        last_action TEXT NOT NULL
            CHECK (last_action IN ('start', 'pause', 'stop')),
        last_progress_percent INTEGER NOT NULL,
        scrobble_body JSONB NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        PRIMARY KEY (player_id, rating_key)
    )
    "#,
];
