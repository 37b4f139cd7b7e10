use std::sync::Arc;

use serde_json::json;
use tracing::{debug, error};

use relayt_model::{
    GroupId, GroupMember, Notification, NotificationType,
};

use crate::storage::Storage;

/// Records owner-facing banners.
///
/// Never blocks the hot path: a failed write is logged and dropped, the
/// banner is advisory.
#[derive(Clone)]
pub struct Notifier {
    storage: Arc<dyn Storage>,
}

impl std::fmt::Debug for Notifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Notifier").finish_non_exhaustive()
    }
}

impl Notifier {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self { storage }
    }

    /// A retry item exhausted its attempts.
    pub async fn permanent_failure(
        &self,
        group: GroupId,
        member: &GroupMember,
        media_title: &str,
        last_error: &str,
    ) {
        let notification = Notification::new(
            group,
            Some(member.id),
            NotificationType::PermanentFailure,
            format!(
                "Could not record \"{media_title}\" for {} after repeated attempts",
                member.label()
            ),
            Some(json!({
                "media_title": media_title,
                "last_error": last_error,
            })),
        );
        self.write(notification).await;
    }

    /// The upstream rejected a member's credentials.
    pub async fn authorization_expired(
        &self,
        group: GroupId,
        member: &GroupMember,
    ) {
        let notification = Notification::new(
            group,
            Some(member.id),
            NotificationType::AuthorizationExpired,
            format!(
                "{} needs to re-authorize their Trakt account",
                member.label()
            ),
            None,
        );
        self.write(notification).await;
    }

    pub async fn member_added(&self, group: GroupId, member: &GroupMember) {
        let notification = Notification::new(
            group,
            Some(member.id),
            NotificationType::MemberAdded,
            format!("{} joined the group", member.label()),
            None,
        );
        self.write(notification).await;
    }

    pub async fn member_removed(&self, group: GroupId, label: &str) {
        let notification = Notification::new(
            group,
            None,
            NotificationType::MemberRemoved,
            format!("{label} left the group"),
            None,
        );
        self.write(notification).await;
    }

    async fn write(&self, notification: Notification) {
        debug!(
            group = %notification.family_group_id,
            kind = %notification.notification_type,
            "Recording notification"
        );
        if let Err(e) = self.storage.create_notification(&notification).await
        {
            error!("Failed to persist notification: {e}");
        }
    }
}
