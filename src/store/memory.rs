//! An in-process [`MessageStore`] backed by plain collections.
//!
//! Used by the test suite and the demo server. It behaves like a single-node
//! relational store: ids are generated sequentially and every call observes
//! the writes of the calls that completed before it.

use super::{
    ChatMessage, EntityRef, MessageId, MessageStore, NewMessage, NewNotification,
    Notification, NotificationId, NotificationPreferences, UserId, UserProfile,
};
use crate::error::StoreError;
use crate::notify::kinds::NotificationKind;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::RwLock;

#[derive(Debug, Default)]
struct Tables {
    users: BTreeMap<UserId, UserProfile>,
    owners: HashMap<EntityRef, UserId>,
    comment_parents: HashMap<i64, EntityRef>,
    messages: Vec<ChatMessage>,
    notifications: Vec<Notification>,
    preferences: HashMap<UserId, NotificationPreferences>,
    next_message_id: MessageId,
    next_notification_id: NotificationId,
}

/// See the module docs.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
    fail_notification_writes: AtomicBool,
    delay_ms: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds (or replaces) a user, initially offline.
    pub async fn add_user(&self, id: UserId, username: &str) {
        self.tables.write().await.users.insert(
            id,
            UserProfile {
                id,
                username: username.to_string(),
                profile_ref: None,
                is_online: false,
                last_seen: None,
            },
        );
    }

    pub async fn set_profile_ref(&self, id: UserId, profile_ref: &str) {
        if let Some(user) = self.tables.write().await.users.get_mut(&id) {
            user.profile_ref = Some(profile_ref.to_string());
        }
    }

    /// Records `owner` as the author of a post/question or the employer of a job.
    pub async fn add_content(&self, entity: EntityRef, owner: UserId) {
        self.tables.write().await.owners.insert(entity, owner);
    }

    /// Records a comment written by `author` on `parent`.
    pub async fn add_comment(&self, comment_id: i64, author: UserId, parent: EntityRef) {
        let mut tables = self.tables.write().await;
        tables.owners.insert(EntityRef::comment(comment_id), author);
        tables.comment_parents.insert(comment_id, parent);
    }

    /// Makes every subsequent notification insert fail with a backend error.
    pub fn fail_notification_writes(&self, fail: bool) {
        self.fail_notification_writes.store(fail, Ordering::SeqCst);
    }

    /// Delays every call by `delay`, for exercising deadlines.
    pub fn set_delay(&self, delay: Duration) {
        self.delay_ms.store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Every notification row, in insertion order.
    pub async fn all_notifications(&self) -> Vec<Notification> {
        self.tables.read().await.notifications.clone()
    }

    async fn latency(&self) {
        let ms = self.delay_ms.load(Ordering::SeqCst);
        if ms > 0 {
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }
    }
}

fn is_pair(message: &ChatMessage, a: UserId, b: UserId) -> bool {
    (message.sender_id == a && message.recipient_id == b)
        || (message.sender_id == b && message.recipient_id == a)
}

#[async_trait]
impl MessageStore for MemoryStore {
    async fn insert_message(&self, message: NewMessage) -> Result<ChatMessage, StoreError> {
        self.latency().await;
        let mut tables = self.tables.write().await;
        tables.next_message_id += 1;
        let stored = ChatMessage {
            id: tables.next_message_id,
            sender_id: message.sender_id,
            recipient_id: message.recipient_id,
            content: message.content,
            created_at: message.created_at,
            read_at: None,
        };
        tables.messages.push(stored.clone());
        Ok(stored)
    }

    async fn conversation(
        &self,
        a: UserId,
        b: UserId,
        limit: usize,
    ) -> Result<Vec<ChatMessage>, StoreError> {
        self.latency().await;
        let tables = self.tables.read().await;
        let mut pair: Vec<ChatMessage> = tables
            .messages
            .iter()
            .filter(|m| is_pair(m, a, b))
            .cloned()
            .collect();
        pair.sort_by(|x, y| x.created_at.cmp(&y.created_at).then(x.id.cmp(&y.id)));
        let skip = pair.len().saturating_sub(limit);
        Ok(pair.split_off(skip))
    }

    async fn mark_conversation_read(
        &self,
        reader: UserId,
        peer: UserId,
        at: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        self.latency().await;
        let mut tables = self.tables.write().await;
        let mut updated = 0;
        for message in tables
            .messages
            .iter_mut()
            .filter(|m| m.sender_id == peer && m.recipient_id == reader && m.read_at.is_none())
        {
            message.read_at = Some(at);
            updated += 1;
        }
        Ok(updated)
    }

    async fn set_presence(
        &self,
        user_id: UserId,
        online: bool,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.latency().await;
        let mut tables = self.tables.write().await;
        let user = tables.users.get_mut(&user_id).ok_or(StoreError::NotFound {
            entity: "user",
            id: user_id,
        })?;
        user.is_online = online;
        user.last_seen = Some(at);
        Ok(())
    }

    async fn user_profile(&self, user_id: UserId) -> Result<Option<UserProfile>, StoreError> {
        self.latency().await;
        Ok(self.tables.read().await.users.get(&user_id).cloned())
    }

    async fn user_ids_except(&self, exclude: Option<UserId>) -> Result<Vec<UserId>, StoreError> {
        self.latency().await;
        Ok(self
            .tables
            .read()
            .await
            .users
            .keys()
            .copied()
            .filter(|id| Some(*id) != exclude)
            .collect())
    }

    async fn content_owner(&self, entity: EntityRef) -> Result<Option<UserId>, StoreError> {
        self.latency().await;
        Ok(self.tables.read().await.owners.get(&entity).copied())
    }

    async fn comment_parent(&self, comment_id: i64) -> Result<Option<EntityRef>, StoreError> {
        self.latency().await;
        Ok(self
            .tables
            .read()
            .await
            .comment_parents
            .get(&comment_id)
            .copied())
    }

    async fn insert_notification(
        &self,
        notification: NewNotification,
    ) -> Result<NotificationId, StoreError> {
        self.latency().await;
        if self.fail_notification_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Backend("notification insert rejected".into()));
        }
        let mut tables = self.tables.write().await;
        tables.next_notification_id += 1;
        let id = tables.next_notification_id;
        tables.notifications.push(Notification {
            id,
            user_id: notification.user_id,
            kind: notification.kind,
            title: notification.title,
            message: notification.message,
            entity: notification.entity,
            actor_id: notification.actor_id,
            actor_username: notification.actor_username,
            actor_profile_ref: notification.actor_profile_ref,
            read: false,
            created_at: notification.created_at,
        });
        Ok(id)
    }

    async fn notifications(
        &self,
        user_id: UserId,
        limit: usize,
    ) -> Result<Vec<Notification>, StoreError> {
        self.latency().await;
        let tables = self.tables.read().await;
        let mut rows: Vec<Notification> = tables
            .notifications
            .iter()
            .filter(|n| n.user_id == user_id)
            .cloned()
            .collect();
        rows.sort_by(|x, y| y.created_at.cmp(&x.created_at).then(y.id.cmp(&x.id)));
        rows.truncate(limit);
        Ok(rows)
    }

    async fn unread_counts(
        &self,
        user_id: UserId,
    ) -> Result<Vec<(NotificationKind, u64)>, StoreError> {
        self.latency().await;
        let tables = self.tables.read().await;
        let mut counts: HashMap<NotificationKind, u64> = HashMap::new();
        for row in tables
            .notifications
            .iter()
            .filter(|n| n.user_id == user_id && !n.read)
        {
            *counts.entry(row.kind).or_default() += 1;
        }
        Ok(counts.into_iter().collect())
    }

    async fn mark_notifications_read(
        &self,
        user_id: UserId,
        ids: &[NotificationId],
    ) -> Result<u64, StoreError> {
        self.latency().await;
        let mut tables = self.tables.write().await;
        let mut updated = 0;
        for row in tables
            .notifications
            .iter_mut()
            .filter(|n| n.user_id == user_id && !n.read && ids.contains(&n.id))
        {
            row.read = true;
            updated += 1;
        }
        Ok(updated)
    }

    async fn mark_all_notifications_read(&self, user_id: UserId) -> Result<u64, StoreError> {
        self.latency().await;
        let mut tables = self.tables.write().await;
        let mut updated = 0;
        for row in tables
            .notifications
            .iter_mut()
            .filter(|n| n.user_id == user_id && !n.read)
        {
            row.read = true;
            updated += 1;
        }
        Ok(updated)
    }

    async fn preferences(
        &self,
        user_id: UserId,
    ) -> Result<Option<NotificationPreferences>, StoreError> {
        self.latency().await;
        Ok(self.tables.read().await.preferences.get(&user_id).cloned())
    }

    async fn insert_preferences(
        &self,
        prefs: NotificationPreferences,
    ) -> Result<NotificationPreferences, StoreError> {
        self.latency().await;
        let mut tables = self.tables.write().await;
        Ok(tables
            .preferences
            .entry(prefs.user_id)
            .or_insert(prefs)
            .clone())
    }

    async fn update_preferences(&self, prefs: NotificationPreferences) -> Result<(), StoreError> {
        self.latency().await;
        self.tables
            .write()
            .await
            .preferences
            .insert(prefs.user_id, prefs);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;

    #[tokio::test]
    async fn conversation_is_symmetric_and_time_ordered() {
        let store = MemoryStore::new();
        let base = Utc::now();
        for (i, (from, to)) in [(1, 2), (2, 1), (1, 3), (1, 2)].into_iter().enumerate() {
            store
                .insert_message(NewMessage {
                    sender_id: from,
                    recipient_id: to,
                    content: format!("m{i}"),
                    // Inserted out of time order on purpose.
                    created_at: base - TimeDelta::seconds(i as i64),
                })
                .await
                .unwrap();
        }

        let forward = store.conversation(1, 2, 10).await.unwrap();
        let backward = store.conversation(2, 1, 10).await.unwrap();
        assert_eq!(forward, backward);
        assert_eq!(forward.len(), 3);
        assert!(forward.windows(2).all(|w| w[0].created_at <= w[1].created_at));
    }

    #[tokio::test]
    async fn insert_preferences_keeps_the_existing_row() {
        let store = MemoryStore::new();
        let mut custom = NotificationPreferences::defaults(7);
        custom.likes = false;
        store.update_preferences(custom.clone()).await.unwrap();

        let stored = store
            .insert_preferences(NotificationPreferences::defaults(7))
            .await
            .unwrap();
        assert_eq!(stored, custom);
    }
}
