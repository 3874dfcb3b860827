//! Domain events and the rules that turn each one into a recipient set.
//!
//! Every event names an [`Audience`]. Each audience is resolved by one small
//! function that issues its own store query; the engine then writes one
//! notification per resolved recipient.

use crate::error::{StoreError, bounded};
use crate::notify::kinds::NotificationKind;
use crate::store::{EntityKind, EntityRef, MessageId, MessageStore, UserId};
use serde::{Deserialize, Serialize};
use std::time::Duration;

const PREVIEW_CHARS: usize = 80;

/// Something that happened elsewhere in the application and may notify users.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum DomainEvent {
    PostCreated {
        post_id: i64,
        author_id: UserId,
        title: String,
    },
    QuestionCreated {
        question_id: i64,
        author_id: UserId,
        title: String,
    },
    /// A comment left on a post or a question.
    CommentAdded {
        target: EntityRef,
        comment_id: i64,
        commenter_id: UserId,
    },
    /// A like on a post, a question or a comment.
    Liked { target: EntityRef, liker_id: UserId },
    MessageSent {
        message_id: MessageId,
        sender_id: UserId,
        recipient_id: UserId,
        content: String,
    },
    JobPosted {
        job_id: i64,
        employer_id: UserId,
        title: String,
    },
    JobApplication {
        job_id: i64,
        applicant_id: UserId,
        job_title: String,
    },
    Announcement {
        author_id: Option<UserId>,
        title: String,
        body: String,
    },
}

/// Who an event is addressed to, before preferences are applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Audience {
    /// Every user, minus an optional author.
    Everyone { except: Option<UserId> },
    /// The owner of `entity`, skipped when it equals `unless`.
    OwnerOf {
        entity: EntityRef,
        unless: Option<UserId>,
    },
    /// Exactly one user.
    User(UserId),
}

/// A single notification to write, before actor display fields are resolved.
#[derive(Debug, Clone, PartialEq)]
pub struct NotificationDraft {
    pub recipient_id: UserId,
    pub kind: NotificationKind,
    pub title: String,
    pub message: String,
    pub entity: Option<EntityRef>,
    pub actor_id: Option<UserId>,
}

impl DomainEvent {
    /// The notification kind this event produces, or `None` when the target
    /// cannot carry that kind of interaction (a comment on a job, say).
    pub fn kind(&self) -> Option<NotificationKind> {
        Some(match self {
            Self::PostCreated { .. } => NotificationKind::NewPost,
            Self::QuestionCreated { .. } => NotificationKind::NewQuestion,
            Self::CommentAdded { target, .. } => match target.kind {
                EntityKind::Post => NotificationKind::PostComment,
                EntityKind::Question => NotificationKind::QuestionComment,
                _ => return None,
            },
            Self::Liked { target, .. } => match target.kind {
                EntityKind::Post => NotificationKind::PostLike,
                EntityKind::Question => NotificationKind::QuestionLike,
                EntityKind::Comment => NotificationKind::CommentLike,
                _ => return None,
            },
            Self::MessageSent { .. } => NotificationKind::Message,
            Self::JobPosted { .. } => NotificationKind::JobPosted,
            Self::JobApplication { .. } => NotificationKind::JobApplication,
            Self::Announcement { .. } => NotificationKind::Announcement,
        })
    }

    /// The user who caused the event.
    pub fn actor(&self) -> Option<UserId> {
        match self {
            Self::PostCreated { author_id, .. } | Self::QuestionCreated { author_id, .. } => {
                Some(*author_id)
            }
            Self::CommentAdded { commenter_id, .. } => Some(*commenter_id),
            Self::Liked { liker_id, .. } => Some(*liker_id),
            Self::MessageSent { sender_id, .. } => Some(*sender_id),
            Self::JobPosted { employer_id, .. } => Some(*employer_id),
            Self::JobApplication { applicant_id, .. } => Some(*applicant_id),
            Self::Announcement { author_id, .. } => *author_id,
        }
    }

    pub fn audience(&self) -> Audience {
        match self {
            Self::PostCreated { author_id, .. } | Self::QuestionCreated { author_id, .. } => {
                Audience::Everyone {
                    except: Some(*author_id),
                }
            }
            Self::CommentAdded {
                target,
                commenter_id,
                ..
            } => Audience::OwnerOf {
                entity: *target,
                unless: Some(*commenter_id),
            },
            Self::Liked { target, liker_id } => Audience::OwnerOf {
                entity: *target,
                unless: Some(*liker_id),
            },
            Self::MessageSent { recipient_id, .. } => Audience::User(*recipient_id),
            Self::JobPosted { employer_id, .. } => Audience::Everyone {
                except: Some(*employer_id),
            },
            Self::JobApplication { job_id, .. } => Audience::OwnerOf {
                entity: EntityRef::job(*job_id),
                unless: None,
            },
            Self::Announcement { .. } => Audience::Everyone { except: None },
        }
    }

    /// The entity the notification links to. Likes on a comment link to the
    /// comment's parent, which has to be looked up; see [`resolve`].
    fn direct_link(&self) -> Option<EntityRef> {
        match self {
            Self::PostCreated { post_id, .. } => Some(EntityRef::post(*post_id)),
            Self::QuestionCreated { question_id, .. } => Some(EntityRef::question(*question_id)),
            Self::CommentAdded { target, .. } => Some(*target),
            Self::Liked { target, .. } if target.kind != EntityKind::Comment => Some(*target),
            Self::Liked { .. } => None,
            Self::MessageSent { message_id, .. } => {
                Some(EntityRef::new(EntityKind::Message, *message_id))
            }
            Self::JobPosted { job_id, .. } | Self::JobApplication { job_id, .. } => {
                Some(EntityRef::job(*job_id))
            }
            Self::Announcement { .. } => None,
        }
    }

    fn title_and_message(&self, kind: NotificationKind) -> (String, String) {
        match self {
            Self::PostCreated { title, .. } => {
                ("New post".into(), format!("published a new post: {title}"))
            }
            Self::QuestionCreated { title, .. } => {
                ("New question".into(), format!("asked a new question: {title}"))
            }
            Self::CommentAdded { .. } => {
                let what = if kind == NotificationKind::QuestionComment {
                    "question"
                } else {
                    "post"
                };
                ("New comment".into(), format!("commented on your {what}"))
            }
            Self::Liked { target, .. } => {
                ("New like".into(), format!("liked your {}", target.kind.as_str()))
            }
            Self::MessageSent { content, .. } => ("New message".into(), preview(content)),
            Self::JobPosted { title, .. } => {
                ("New job posted".into(), format!("posted a new job: {title}"))
            }
            Self::JobApplication { job_title, .. } => (
                "New application".into(),
                format!("applied to your job: {job_title}"),
            ),
            Self::Announcement { title, body, .. } => (title.clone(), body.clone()),
        }
    }
}

fn preview(content: &str) -> String {
    let mut chars = content.chars();
    let head: String = chars.by_ref().take(PREVIEW_CHARS).collect();
    if chars.next().is_some() {
        format!("{head}...")
    } else {
        head
    }
}

/// Store access for resolvers, with every call bounded by the same deadline.
#[derive(Clone, Copy)]
pub struct ResolveCtx<'a> {
    pub store: &'a dyn MessageStore,
    pub db_timeout: Duration,
}

/// Every user except `except`.
pub async fn everyone_except(
    ctx: ResolveCtx<'_>,
    except: Option<UserId>,
) -> Result<Vec<UserId>, StoreError> {
    bounded(ctx.db_timeout, ctx.store.user_ids_except(except)).await
}

/// The owner of `entity`, unless the owner is `unless` or unknown.
pub async fn owner_unless(
    ctx: ResolveCtx<'_>,
    entity: EntityRef,
    unless: Option<UserId>,
) -> Result<Vec<UserId>, StoreError> {
    let owner = bounded(ctx.db_timeout, ctx.store.content_owner(entity)).await?;
    Ok(owner
        .filter(|owner| Some(*owner) != unless)
        .into_iter()
        .collect())
}

pub async fn recipients(ctx: ResolveCtx<'_>, audience: Audience) -> Result<Vec<UserId>, StoreError> {
    match audience {
        Audience::Everyone { except } => everyone_except(ctx, except).await,
        Audience::OwnerOf { entity, unless } => owner_unless(ctx, entity, unless).await,
        Audience::User(user_id) => Ok(vec![user_id]),
    }
}

/// Resolves `event` into one draft per recipient. Events whose target cannot
/// carry the interaction resolve to nothing.
pub async fn resolve(
    ctx: ResolveCtx<'_>,
    event: &DomainEvent,
) -> Result<Vec<NotificationDraft>, StoreError> {
    let Some(kind) = event.kind() else {
        return Ok(Vec::new());
    };
    let targets = recipients(ctx, event.audience()).await?;
    if targets.is_empty() {
        return Ok(Vec::new());
    }

    let link = match event {
        DomainEvent::Liked { target, .. } if target.kind == EntityKind::Comment => {
            bounded(ctx.db_timeout, ctx.store.comment_parent(target.id)).await?
        }
        _ => event.direct_link(),
    };
    let (title, message) = event.title_and_message(kind);
    let actor_id = event.actor();

    Ok(targets
        .into_iter()
        .map(|recipient_id| NotificationDraft {
            recipient_id,
            kind,
            title: title.clone(),
            message: message.clone(),
            entity: link,
            actor_id,
        })
        .collect())
}
