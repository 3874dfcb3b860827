//! The durable store seam.
//!
//! The hub never talks to a database directly. Everything it persists (chat
//! messages, presence flags, notification rows, preferences) goes through the
//! [`MessageStore`] trait, so the relational backend stays an external
//! collaborator. [`memory::MemoryStore`] is a complete in-process
//! implementation used by the test suite and the demo server.

pub mod memory;

use crate::error::StoreError;
use crate::notify::kinds::{Category, NotificationKind};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Authenticated user identifier. `0` is never a valid user.
pub type UserId = i64;
/// Identifier of a persisted chat message.
pub type MessageId = i64;
/// Identifier of a notification row.
pub type NotificationId = i64;

/// Distinguishes persisted chat traffic from ephemeral typing indicators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Chat,
    Typing,
}

/// A chat message as stored. Typing indicators are never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: MessageId,
    pub sender_id: UserId,
    pub recipient_id: UserId,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub read_at: Option<DateTime<Utc>>,
}

/// A chat message ready to be inserted. The store assigns the id.
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub sender_id: UserId,
    pub recipient_id: UserId,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

/// The durable view of a user that the hub needs for presence and display fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserProfile {
    pub id: UserId,
    pub username: String,
    /// Avatar or profile-picture reference, if any.
    pub profile_ref: Option<String>,
    pub is_online: bool,
    pub last_seen: Option<DateTime<Utc>>,
}

/// The kind of content a notification points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Post,
    Question,
    Comment,
    Job,
    Message,
    Profile,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Post => "post",
            Self::Question => "question",
            Self::Comment => "comment",
            Self::Job => "job",
            Self::Message => "message",
            Self::Profile => "profile",
        }
    }
}

/// A typed reference to a piece of content owned by some user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntityRef {
    #[serde(rename = "entity_type")]
    pub kind: EntityKind,
    #[serde(rename = "entity_id")]
    pub id: i64,
}

impl EntityRef {
    pub fn new(kind: EntityKind, id: i64) -> Self {
        Self { kind, id }
    }

    pub fn post(id: i64) -> Self {
        Self::new(EntityKind::Post, id)
    }

    pub fn question(id: i64) -> Self {
        Self::new(EntityKind::Question, id)
    }

    pub fn comment(id: i64) -> Self {
        Self::new(EntityKind::Comment, id)
    }

    pub fn job(id: i64) -> Self {
        Self::new(EntityKind::Job, id)
    }
}

/// A notification row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub id: NotificationId,
    pub user_id: UserId,
    #[serde(rename = "type")]
    pub kind: NotificationKind,
    pub title: String,
    pub message: String,
    #[serde(flatten)]
    pub entity: Option<EntityRef>,
    pub actor_id: Option<UserId>,
    pub actor_username: Option<String>,
    pub actor_profile_ref: Option<String>,
    pub read: bool,
    pub created_at: DateTime<Utc>,
}

/// A notification row ready to be inserted, with actor display fields already resolved.
#[derive(Debug, Clone)]
pub struct NewNotification {
    pub user_id: UserId,
    pub kind: NotificationKind,
    pub title: String,
    pub message: String,
    pub entity: Option<EntityRef>,
    pub actor_id: Option<UserId>,
    pub actor_username: Option<String>,
    pub actor_profile_ref: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Per-user switches, one per [`Category`]. A missing row means "everything on".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationPreferences {
    pub user_id: UserId,
    pub new_posts: bool,
    pub new_questions: bool,
    pub comments: bool,
    pub likes: bool,
    pub messages: bool,
    pub job_postings: bool,
    pub job_applications: bool,
    pub announcements: bool,
}

impl NotificationPreferences {
    /// The all-enabled row created lazily on first read.
    pub fn defaults(user_id: UserId) -> Self {
        Self {
            user_id,
            new_posts: true,
            new_questions: true,
            comments: true,
            likes: true,
            messages: true,
            job_postings: true,
            job_applications: true,
            announcements: true,
        }
    }

    pub fn allows(&self, category: Category) -> bool {
        match category {
            Category::NewPosts => self.new_posts,
            Category::NewQuestions => self.new_questions,
            Category::Comments => self.comments,
            Category::Likes => self.likes,
            Category::Messages => self.messages,
            Category::JobPostings => self.job_postings,
            Category::JobApplications => self.job_applications,
            Category::Announcements => self.announcements,
        }
    }

    pub fn set(&mut self, category: Category, enabled: bool) {
        let slot = match category {
            Category::NewPosts => &mut self.new_posts,
            Category::NewQuestions => &mut self.new_questions,
            Category::Comments => &mut self.comments,
            Category::Likes => &mut self.likes,
            Category::Messages => &mut self.messages,
            Category::JobPostings => &mut self.job_postings,
            Category::JobApplications => &mut self.job_applications,
            Category::Announcements => &mut self.announcements,
        };
        *slot = enabled;
    }
}

/// Durable persistence used by the hub, the presence tracker and the fan-out engine.
///
/// Implementations only need row-level atomicity; nothing here requires
/// cross-row transactions.
#[async_trait]
pub trait MessageStore: Send + Sync + 'static {
    // --- chat ---

    /// Persists a chat message and returns it with its generated id.
    async fn insert_message(&self, message: NewMessage) -> Result<ChatMessage, StoreError>;

    /// The most recent `limit` messages exchanged between `a` and `b` (either
    /// direction), returned oldest first by `created_at`, ties broken by id.
    async fn conversation(
        &self,
        a: UserId,
        b: UserId,
        limit: usize,
    ) -> Result<Vec<ChatMessage>, StoreError>;

    /// Stamps `read_at` on unread messages sent by `peer` to `reader`. Returns the row count.
    async fn mark_conversation_read(
        &self,
        reader: UserId,
        peer: UserId,
        at: DateTime<Utc>,
    ) -> Result<u64, StoreError>;

    // --- users and presence ---

    async fn set_presence(
        &self,
        user_id: UserId,
        online: bool,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    async fn user_profile(&self, user_id: UserId) -> Result<Option<UserProfile>, StoreError>;

    /// Every known user id, minus `exclude` when given.
    async fn user_ids_except(&self, exclude: Option<UserId>) -> Result<Vec<UserId>, StoreError>;

    // --- content ownership (recipient resolution) ---

    /// The author of a post, question or comment, or the employer of a job.
    async fn content_owner(&self, entity: EntityRef) -> Result<Option<UserId>, StoreError>;

    /// The post or question a comment was left on.
    async fn comment_parent(&self, comment_id: i64) -> Result<Option<EntityRef>, StoreError>;

    // --- notifications ---

    async fn insert_notification(
        &self,
        notification: NewNotification,
    ) -> Result<NotificationId, StoreError>;

    /// Up to `limit` rows for `user_id`, newest first.
    async fn notifications(
        &self,
        user_id: UserId,
        limit: usize,
    ) -> Result<Vec<Notification>, StoreError>;

    /// Unread row counts for `user_id`, grouped by kind. Kinds with no unread rows are omitted.
    async fn unread_counts(
        &self,
        user_id: UserId,
    ) -> Result<Vec<(NotificationKind, u64)>, StoreError>;

    /// Marks the listed rows read, restricted to rows owned by `user_id`.
    async fn mark_notifications_read(
        &self,
        user_id: UserId,
        ids: &[NotificationId],
    ) -> Result<u64, StoreError>;

    async fn mark_all_notifications_read(&self, user_id: UserId) -> Result<u64, StoreError>;

    // --- preferences ---

    async fn preferences(
        &self,
        user_id: UserId,
    ) -> Result<Option<NotificationPreferences>, StoreError>;

    /// Inserts `prefs` unless a row already exists, and returns whichever row is stored.
    async fn insert_preferences(
        &self,
        prefs: NotificationPreferences,
    ) -> Result<NotificationPreferences, StoreError>;

    async fn update_preferences(&self, prefs: NotificationPreferences) -> Result<(), StoreError>;
}
