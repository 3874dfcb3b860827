//! Read-side notification API: listing, unread summaries, mark-read, and
//! preference management. Every operation is scoped to the requesting user's
//! own rows.

use crate::error::{StoreError, bounded};
use crate::notify::kinds::Category;
use crate::store::{
    EntityKind, EntityRef, MessageStore, Notification, NotificationId, NotificationPreferences,
    UserId,
};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument};

/// Where a notification without a linkable entity sends the user.
pub const FALLBACK_URL: &str = "/notifications";

/// A notification enriched with display metadata.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NotificationView {
    #[serde(flatten)]
    pub notification: Notification,
    pub icon: &'static str,
    pub color: &'static str,
    pub action_url: String,
}

impl From<Notification> for NotificationView {
    fn from(notification: Notification) -> Self {
        Self {
            icon: notification.kind.icon(),
            color: notification.kind.color(),
            action_url: action_url(&notification),
            notification,
        }
    }
}

/// Unread counts, in total and per preference category.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct UnreadSummary {
    pub total: u64,
    pub by_category: BTreeMap<Category, u64>,
}

/// The deep link for a notification, based on the entity it points at.
pub fn action_url(notification: &Notification) -> String {
    match notification.entity {
        Some(EntityRef {
            kind: EntityKind::Post,
            id,
        }) => format!("/posts/{id}"),
        Some(EntityRef {
            kind: EntityKind::Question,
            id,
        }) => format!("/questions/{id}"),
        Some(EntityRef {
            kind: EntityKind::Job,
            id,
        }) => format!("/jobs/{id}"),
        Some(EntityRef {
            kind: EntityKind::Profile,
            id,
        }) => format!("/profile/{id}"),
        Some(EntityRef {
            kind: EntityKind::Message,
            ..
        }) => match notification.actor_id {
            Some(actor) => format!("/messages/{actor}"),
            None => "/messages".to_string(),
        },
        Some(EntityRef {
            kind: EntityKind::Comment,
            ..
        })
        | None => FALLBACK_URL.to_string(),
    }
}

/// See the module docs.
#[derive(Clone)]
pub struct NotificationInbox {
    store: Arc<dyn MessageStore>,
    db_timeout: Duration,
}

impl NotificationInbox {
    pub fn new(store: Arc<dyn MessageStore>, db_timeout: Duration) -> Self {
        Self { store, db_timeout }
    }

    /// Up to `limit` notifications for `user_id`, newest first.
    #[instrument(skip(self))]
    pub async fn list(
        &self,
        user_id: UserId,
        limit: usize,
    ) -> Result<Vec<NotificationView>, StoreError> {
        let rows = bounded(self.db_timeout, self.store.notifications(user_id, limit)).await?;
        Ok(rows.into_iter().map(NotificationView::from).collect())
    }

    #[instrument(skip(self))]
    pub async fn unread_summary(&self, user_id: UserId) -> Result<UnreadSummary, StoreError> {
        let counts = bounded(self.db_timeout, self.store.unread_counts(user_id)).await?;
        let mut summary = UnreadSummary::default();
        for (kind, count) in counts {
            summary.total += count;
            *summary.by_category.entry(kind.category()).or_default() += count;
        }
        Ok(summary)
    }

    /// Marks the listed rows read. Ids belonging to other users are ignored.
    #[instrument(skip(self, ids), fields(requested = ids.len()))]
    pub async fn mark_read(
        &self,
        user_id: UserId,
        ids: &[NotificationId],
    ) -> Result<u64, StoreError> {
        if ids.is_empty() {
            return Ok(0);
        }
        let updated = bounded(
            self.db_timeout,
            self.store.mark_notifications_read(user_id, ids),
        )
        .await?;
        debug!(updated, "Marked notifications read");
        Ok(updated)
    }

    #[instrument(skip(self))]
    pub async fn mark_all_read(&self, user_id: UserId) -> Result<u64, StoreError> {
        bounded(self.db_timeout, self.store.mark_all_notifications_read(user_id)).await
    }

    /// The user's preferences, creating the default row if none exists.
    pub async fn preferences(&self, user_id: UserId) -> Result<NotificationPreferences, StoreError> {
        if let Some(prefs) = bounded(self.db_timeout, self.store.preferences(user_id)).await? {
            return Ok(prefs);
        }
        bounded(
            self.db_timeout,
            self.store
                .insert_preferences(NotificationPreferences::defaults(user_id)),
        )
        .await
    }

    pub async fn update_preferences(&self, prefs: NotificationPreferences) -> Result<(), StoreError> {
        bounded(self.db_timeout, self.store.update_preferences(prefs)).await
    }
}
