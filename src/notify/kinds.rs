//! Notification kinds, the preference categories that gate them, and their
//! display metadata.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A preference category. Each user holds one on/off switch per category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    NewPosts,
    NewQuestions,
    Comments,
    Likes,
    Messages,
    JobPostings,
    JobApplications,
    Announcements,
}

impl Category {
    pub const ALL: [Category; 8] = [
        Category::NewPosts,
        Category::NewQuestions,
        Category::Comments,
        Category::Likes,
        Category::Messages,
        Category::JobPostings,
        Category::JobApplications,
        Category::Announcements,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NewPosts => "new_posts",
            Self::NewQuestions => "new_questions",
            Self::Comments => "comments",
            Self::Likes => "likes",
            Self::Messages => "messages",
            Self::JobPostings => "job_postings",
            Self::JobApplications => "job_applications",
            Self::Announcements => "announcements",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The type stored on every notification row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    NewPost,
    NewQuestion,
    PostComment,
    QuestionComment,
    PostLike,
    QuestionLike,
    CommentLike,
    Message,
    JobPosted,
    JobApplication,
    Announcement,
}

impl NotificationKind {
    /// The preference category consulted before a notification of this kind is written.
    pub fn category(&self) -> Category {
        match self {
            Self::NewPost => Category::NewPosts,
            Self::NewQuestion => Category::NewQuestions,
            Self::PostComment | Self::QuestionComment => Category::Comments,
            Self::PostLike | Self::QuestionLike | Self::CommentLike => Category::Likes,
            Self::Message => Category::Messages,
            Self::JobPosted => Category::JobPostings,
            Self::JobApplication => Category::JobApplications,
            Self::Announcement => Category::Announcements,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NewPost => "new_post",
            Self::NewQuestion => "new_question",
            Self::PostComment => "post_comment",
            Self::QuestionComment => "question_comment",
            Self::PostLike => "post_like",
            Self::QuestionLike => "question_like",
            Self::CommentLike => "comment_like",
            Self::Message => "message",
            Self::JobPosted => "job_posted",
            Self::JobApplication => "job_application",
            Self::Announcement => "announcement",
        }
    }

    /// Icon name rendered next to the notification.
    pub fn icon(&self) -> &'static str {
        match self {
            Self::NewPost => "file-text",
            Self::NewQuestion => "help-circle",
            Self::PostComment | Self::QuestionComment => "message-square",
            Self::PostLike | Self::QuestionLike | Self::CommentLike => "heart",
            Self::Message => "mail",
            Self::JobPosted => "briefcase",
            Self::JobApplication => "user-check",
            Self::Announcement => "megaphone",
        }
    }

    /// Accent color (CSS hex) rendered with the icon.
    pub fn color(&self) -> &'static str {
        match self {
            Self::NewPost => "#3b82f6",
            Self::NewQuestion => "#8b5cf6",
            Self::PostComment | Self::QuestionComment => "#10b981",
            Self::PostLike | Self::QuestionLike | Self::CommentLike => "#ef4444",
            Self::Message => "#0ea5e9",
            Self::JobPosted => "#f59e0b",
            Self::JobApplication => "#14b8a6",
            Self::Announcement => "#6366f1",
        }
    }
}

impl fmt::Display for NotificationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_like_kind_shares_the_likes_category() {
        for kind in [
            NotificationKind::PostLike,
            NotificationKind::QuestionLike,
            NotificationKind::CommentLike,
        ] {
            assert_eq!(kind.category(), Category::Likes);
        }
    }

    #[test]
    fn kinds_serialize_as_their_wire_names() {
        let json = serde_json::to_string(&NotificationKind::NewQuestion).unwrap();
        assert_eq!(json, "\"new_question\"");
        let json = serde_json::to_string(&Category::JobPostings).unwrap();
        assert_eq!(json, "\"job_postings\"");
    }
}
