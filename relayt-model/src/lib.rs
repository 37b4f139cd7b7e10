//! Core data model definitions shared across Relayt crates.
#![allow(missing_docs)]

pub mod display_name;
pub mod error;
pub mod event;
pub mod group;
pub mod ids;
pub mod notification;
pub mod queue;
pub mod retry;
pub mod scrobble;
pub mod user;

// Intentionally curated re-exports for downstream consumers.
pub use display_name::sanitize_display_name;
pub use error::{ModelError, Result as ModelResult};
pub use event::{EventVerb, MediaEvent, MediaKind};
pub use group::{AuthorizationStatus, FamilyGroup, GroupMember};
pub use ids::{
    GroupId, MemberId, NotificationId, QueuedEventId, RetryItemId, UserId,
};
pub use notification::{Notification, NotificationType};
pub use queue::{CachedState, QueuedEvent};
pub use retry::{RetryItem, RetryStatus};
pub use scrobble::{
    EpisodeIds, MediaIds, ScrobbleAction, ScrobbleBody, ScrobbleEpisode,
    ScrobbleItem,
};
pub use user::User;
