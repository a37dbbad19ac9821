//! Response shapes served by the backend.
//!
//! Records from the catalog are joined with their owners here, once, so
//! handlers never guess at optional fields.

use std::collections::HashMap;

use serde::Serialize;

use crate::catalog::{
    CommentRecord, NotificationKind, NotificationRecord, ReactionSummary, UserRecord, VideoRecord,
    VideoStatus, Visibility,
};

pub const UNKNOWN_AUTHOR: &str = "Unknown User";

/// Display name for a user: channel name, then name, then handle.
pub fn author_name(user: Option<&UserRecord>) -> String {
    let Some(user) = user else {
        return UNKNOWN_AUTHOR.to_string();
    };
    [&user.channel_name, &user.name, &user.handle]
        .into_iter()
        .flatten()
        .map(|value| value.trim())
        .find(|value| !value.is_empty())
        .unwrap_or(UNKNOWN_AUTHOR)
        .to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthorView {
    pub id: String,
    pub name: String,
    pub handle: Option<String>,
    pub avatar_url: Option<String>,
}

impl AuthorView {
    pub fn assemble(id: &str, user: Option<&UserRecord>) -> Self {
        Self {
            id: id.to_string(),
            name: author_name(user),
            handle: user.and_then(|user| user.handle.clone()),
            avatar_url: user.and_then(|user| user.avatar_url.clone()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoView {
    pub id: String,
    pub remote_video_id: Option<String>,
    pub title: String,
    pub description: String,
    pub tags: Vec<String>,
    pub category_id: Option<String>,
    pub thumbnail_url: Option<String>,
    pub thumbnail_time_ms: Option<i64>,
    pub status: VideoStatus,
    pub visibility: Visibility,
    pub views: i64,
    pub duration: Option<i64>,
    pub created_at: String,
    pub author: AuthorView,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reactions: Option<ReactionSummary>,
}

impl VideoView {
    pub fn assemble(video: VideoRecord, owner: Option<&UserRecord>) -> Self {
        let author = AuthorView::assemble(&video.owner_id, owner);
        Self {
            id: video.id,
            remote_video_id: video.remote_video_id,
            title: video.title,
            description: video.description,
            tags: video.tags,
            category_id: video.category_id,
            thumbnail_url: video.thumbnail_url,
            thumbnail_time_ms: video.thumbnail_time_ms,
            status: video.status,
            visibility: video.visibility,
            views: video.views,
            duration: video.duration,
            created_at: video.created_at,
            author,
            reactions: None,
        }
    }

    pub fn with_reactions(mut self, reactions: ReactionSummary) -> Self {
        self.reactions = Some(reactions);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CommentView {
    pub id: String,
    pub video_id: String,
    pub text: String,
    pub created_at: String,
    pub author: AuthorView,
}

impl CommentView {
    pub fn assemble(comment: CommentRecord, author: Option<&UserRecord>) -> Self {
        Self {
            author: AuthorView::assemble(&comment.author_id, author),
            id: comment.id,
            video_id: comment.video_id,
            text: comment.text,
            created_at: comment.created_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelView {
    pub owner: AuthorView,
    pub subscriber_count: i64,
    pub subscribed: bool,
    pub videos: Vec<VideoView>,
}

impl ChannelView {
    pub fn assemble(
        owner: &UserRecord,
        subscriber_count: i64,
        subscribed: bool,
        videos: Vec<VideoRecord>,
    ) -> Self {
        Self {
            owner: AuthorView::assemble(&owner.id, Some(owner)),
            subscriber_count,
            subscribed,
            videos: videos
                .into_iter()
                .map(|video| VideoView::assemble(video, Some(owner)))
                .collect(),
        }
    }
}

/// Per-kind payload of a notification, serialized with a `kind` tag.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NotificationDetail {
    #[serde(rename_all = "camelCase")]
    Comment {
        actor: AuthorView,
        video_id: Option<String>,
        video_title: Option<String>,
        comment_id: Option<String>,
        excerpt: Option<String>,
    },
    Subscription { actor: AuthorView },
    #[serde(rename_all = "camelCase")]
    UploadReady {
        channel: AuthorView,
        video_id: Option<String>,
        video_title: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationView {
    pub id: String,
    pub read: bool,
    pub created_at: String,
    #[serde(flatten)]
    pub detail: NotificationDetail,
}

impl NotificationView {
    /// `users` and `video_titles` only need the ids the record mentions.
    pub fn assemble(
        record: NotificationRecord,
        users: &HashMap<String, UserRecord>,
        video_titles: &HashMap<String, String>,
    ) -> Self {
        let actor_id = record.actor_id.unwrap_or_default();
        let actor = AuthorView::assemble(&actor_id, users.get(&actor_id));
        let video_title = record
            .video_id
            .as_ref()
            .and_then(|id| video_titles.get(id))
            .cloned();
        let detail = match record.kind {
            NotificationKind::Comment => NotificationDetail::Comment {
                actor,
                video_id: record.video_id,
                video_title,
                comment_id: record.comment_id,
                excerpt: record.message,
            },
            NotificationKind::Subscription => NotificationDetail::Subscription { actor },
            NotificationKind::UploadReady => NotificationDetail::UploadReady {
                channel: actor,
                video_id: record.video_id,
                video_title,
            },
        };
        Self {
            id: record.id,
            read: record.read,
            created_at: record.created_at,
            detail,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn user() -> UserRecord {
        UserRecord {
            id: "u1".into(),
            handle: Some("creator".into()),
            name: Some("Ada".into()),
            channel_name: Some("Ada Teaches".into()),
            avatar_url: None,
            created_at: "2025-01-01T00:00:00Z".into(),
        }
    }

    fn video() -> VideoRecord {
        VideoRecord {
            id: "v1".into(),
            owner_id: "u1".into(),
            remote_video_id: Some("r1".into()),
            title: "Demo".into(),
            description: String::new(),
            tags: vec![],
            category_id: Some("education".into()),
            thumbnail_url: None,
            thumbnail_time_ms: Some(2_500),
            status: VideoStatus::Ready,
            visibility: Visibility::Public,
            views: 3,
            duration: None,
            created_at: "2025-01-01T00:00:00Z".into(),
            updated_at: "2025-01-01T00:00:00Z".into(),
        }
    }

    #[test]
    fn author_name_precedence() {
        let mut owner = user();
        assert_eq!(author_name(Some(&owner)), "Ada Teaches");
        owner.channel_name = Some("  ".into());
        assert_eq!(author_name(Some(&owner)), "Ada");
        owner.name = None;
        assert_eq!(author_name(Some(&owner)), "creator");
        owner.handle = None;
        assert_eq!(author_name(Some(&owner)), UNKNOWN_AUTHOR);
        assert_eq!(author_name(None), UNKNOWN_AUTHOR);
    }

    #[test]
    fn video_view_serializes_camel_case() {
        let view = VideoView::assemble(video(), Some(&user()));
        let value = serde_json::to_value(&view).unwrap();
        assert_eq!(value["author"]["name"], "Ada Teaches");
        assert_eq!(value["thumbnailTimeMs"], 2_500);
        assert_eq!(value["status"], "ready");
        assert!(value.get("reactions").is_none());
    }

    #[test]
    fn notifications_are_tagged_by_kind() {
        let record = NotificationRecord {
            id: "n1".into(),
            user_id: "fan".into(),
            kind: NotificationKind::UploadReady,
            actor_id: Some("u1".into()),
            video_id: Some("v1".into()),
            comment_id: None,
            message: None,
            read: false,
            created_at: "2025-01-01T00:00:00Z".into(),
        };
        let users = HashMap::from([("u1".to_string(), user())]);
        let titles = HashMap::from([("v1".to_string(), "Demo".to_string())]);
        let value = serde_json::to_value(NotificationView::assemble(record, &users, &titles)).unwrap();
        assert_eq!(value["kind"], "upload_ready");
        assert_eq!(value["videoTitle"], json!("Demo"));
        assert_eq!(value["channel"]["name"], "Ada Teaches");
        assert_eq!(value["read"], false);
    }

    #[test]
    fn missing_actor_falls_back_to_unknown() {
        let record = NotificationRecord {
            id: "n2".into(),
            user_id: "u1".into(),
            kind: NotificationKind::Subscription,
            actor_id: Some("gone".into()),
            video_id: None,
            comment_id: None,
            message: None,
            read: true,
            created_at: "2025-01-01T00:00:00Z".into(),
        };
        let view = NotificationView::assemble(record, &HashMap::new(), &HashMap::new());
        match view.detail {
            NotificationDetail::Subscription { actor } => assert_eq!(actor.name, UNKNOWN_AUTHOR),
            other => panic!("unexpected detail {other:?}"),
        }
    }
}
