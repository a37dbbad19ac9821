//! Relational catalog for vidshare: users, channels, videos and everything
//! viewers attach to them.
//!
//! Structs here mirror the rows stored in SQLite. API response shapes live in
//! [`crate::view`].

use std::{fmt, path::Path, str::FromStr, sync::Arc};

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use libsql::{
    Builder, Connection, Database, Row, Transaction, TransactionBehavior, params,
    params::IntoParams,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use crate::{
    error::FieldError,
    provider::RemoteVideoId,
    session::{
        MAX_DESCRIPTION_CHARS, MAX_TAG_CHARS, MAX_TAGS, MAX_TITLE_CHARS, ThumbnailRef,
    },
};

pub const MAX_SUGGESTIONS: i64 = 8;
pub const MAX_RECENT_SEARCHES: i64 = 10;
const COMMENT_EXCERPT_CHARS: usize = 100;

const DEFAULT_CATEGORIES: [(&str, &str); 10] = [
    ("education", "Education"),
    ("entertainment", "Entertainment"),
    ("gaming", "Gaming"),
    ("music", "Music"),
    ("news", "News"),
    ("sports", "Sports"),
    ("science-technology", "Science & Technology"),
    ("howto-style", "Howto & Style"),
    ("travel", "Travel"),
    ("comedy", "Comedy"),
];

macro_rules! string_enum {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(self) -> &'static str {
                match self {
                    $(Self::$variant => $text,)+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = anyhow::Error;

            fn from_str(value: &str) -> Result<Self> {
                match value {
                    $($text => Ok(Self::$variant),)+
                    other => Err(anyhow!("unknown {} `{other}`", stringify!($name))),
                }
            }
        }
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VideoStatus {
    Uploading,
    Processing,
    Ready,
    Failed,
}

string_enum!(VideoStatus {
    Uploading => "uploading",
    Processing => "processing",
    Ready => "ready",
    Failed => "failed",
});

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Visibility {
    #[default]
    Public,
    Private,
}

string_enum!(Visibility {
    Public => "public",
    Private => "private",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReactionKind {
    Like,
    Dislike,
}

string_enum!(ReactionKind {
    Like => "like",
    Dislike => "dislike",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    Comment,
    Subscription,
    UploadReady,
}

string_enum!(NotificationKind {
    Comment => "comment",
    Subscription => "subscription",
    UploadReady => "upload_ready",
});

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRecord {
    pub id: String,
    pub handle: Option<String>,
    pub name: Option<String>,
    /// Display name of the user's channel, when they set one.
    pub channel_name: Option<String>,
    pub avatar_url: Option<String>,
    pub created_at: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryRecord {
    pub id: String,
    pub name: String,
}

/// Row stored in the `videos` table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoRecord {
    pub id: String,
    pub owner_id: String,
    pub remote_video_id: Option<String>,
    pub title: String,
    pub description: String,
    pub tags: Vec<String>,
    pub category_id: Option<String>,
    pub thumbnail_url: Option<String>,
    /// Offset of the generated frame picked as thumbnail. `None` together
    /// with no `thumbnail_url` means the provider hosts a custom image.
    pub thumbnail_time_ms: Option<i64>,
    pub status: VideoStatus,
    pub visibility: Visibility,
    pub views: i64,
    pub duration: Option<i64>,
    pub created_at: String,
    pub updated_at: String,
}

impl VideoRecord {
    pub fn is_listed(&self) -> bool {
        self.status == VideoStatus::Ready && self.visibility == Visibility::Public
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommentRecord {
    pub id: String,
    pub video_id: String,
    pub author_id: String,
    pub text: String,
    pub created_at: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationRecord {
    pub id: String,
    pub user_id: String,
    pub kind: NotificationKind,
    pub actor_id: Option<String>,
    pub video_id: Option<String>,
    pub comment_id: Option<String>,
    pub message: Option<String>,
    pub read: bool,
    pub created_at: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReactionSummary {
    pub likes: i64,
    pub dislikes: i64,
    pub mine: Option<ReactionKind>,
}

/// Video row created directly through the API rather than the upload flow.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewVideo {
    #[serde(skip)]
    pub owner_id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub tags: Vec<String>,
    pub category_id: Option<String>,
    #[serde(default)]
    pub visibility: Visibility,
    pub remote_video_id: Option<String>,
    pub thumbnail_url: Option<String>,
}

/// Partial update; absent fields keep their stored value.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoPatch {
    pub title: Option<String>,
    pub description: Option<String>,
    pub tags: Option<Vec<String>>,
    pub category_id: Option<String>,
    pub visibility: Option<Visibility>,
    pub thumbnail_url: Option<String>,
}

impl VideoPatch {
    pub fn problems(&self) -> Vec<FieldError> {
        let mut problems = Vec::new();
        if let Some(title) = &self.title {
            check_title(title, &mut problems);
        }
        if let Some(description) = &self.description {
            if description.chars().count() > MAX_DESCRIPTION_CHARS {
                problems.push(FieldError::new(
                    "description",
                    format!("must be at most {MAX_DESCRIPTION_CHARS} characters"),
                ));
            }
        }
        if let Some(tags) = &self.tags {
            check_tags(tags, &mut problems);
        }
        if matches!(&self.category_id, Some(category) if category.trim().is_empty()) {
            problems.push(FieldError::new("category_id", "cannot be blank"));
        }
        problems
    }
}

impl NewVideo {
    pub fn problems(&self) -> Vec<FieldError> {
        let mut problems = Vec::new();
        check_title(&self.title, &mut problems);
        if self.description.chars().count() > MAX_DESCRIPTION_CHARS {
            problems.push(FieldError::new(
                "description",
                format!("must be at most {MAX_DESCRIPTION_CHARS} characters"),
            ));
        }
        check_tags(&self.tags, &mut problems);
        problems
    }
}

fn check_title(title: &str, problems: &mut Vec<FieldError>) {
    let length = title.trim().chars().count();
    if length == 0 {
        problems.push(FieldError::new("title", "is required"));
    } else if length > MAX_TITLE_CHARS {
        problems.push(FieldError::new(
            "title",
            format!("must be at most {MAX_TITLE_CHARS} characters"),
        ));
    }
}

fn check_tags(tags: &[String], problems: &mut Vec<FieldError>) {
    if tags.len() > MAX_TAGS {
        problems.push(FieldError::new("tags", format!("at most {MAX_TAGS} tags")));
    }
    if tags.iter().any(|tag| tag.chars().count() > MAX_TAG_CHARS) {
        problems.push(FieldError::new(
            "tags",
            format!("each tag must be at most {MAX_TAG_CHARS} characters"),
        ));
    }
}

/// What the upload flow persists once the details step validates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoDetails {
    pub title: String,
    pub description: String,
    pub tags: Vec<String>,
    pub category_id: String,
    pub thumbnail: ThumbnailRef,
    pub visibility: Visibility,
}

/// Persistence boundary of the upload flow.
#[async_trait]
pub trait VideoCatalog: Send + Sync {
    /// Stores the submitted details for the video held by the provider under
    /// `remote`. Returns the catalog id.
    async fn save_details(
        &self,
        owner_id: &str,
        remote: &RemoteVideoId,
        details: &VideoDetails,
    ) -> Result<String>;

    /// Records that the provider can play the video.
    async fn mark_ready(&self, remote: &RemoteVideoId) -> Result<()>;
}

async fn configure_connection(conn: &Connection) -> Result<()> {
    configure_session(conn).await?;
    conn.execute_batch("PRAGMA journal_mode=WAL;").await?;
    Ok(())
}

/// Per-connection settings; the journal mode is stored in the file itself.
async fn configure_session(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        PRAGMA busy_timeout=5000;
        PRAGMA synchronous=NORMAL;
        PRAGMA foreign_keys=ON;
        "#,
    )
    .await?;
    Ok(())
}

async fn ensure_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS users (
            id TEXT PRIMARY KEY,
            handle TEXT UNIQUE,
            name TEXT,
            channel_name TEXT,
            avatar_url TEXT,
            created_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS categories (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS videos (
            id TEXT PRIMARY KEY,
            owner_id TEXT NOT NULL,
            remote_video_id TEXT UNIQUE,
            title TEXT NOT NULL,
            description TEXT NOT NULL DEFAULT '',
            tags_json TEXT NOT NULL DEFAULT '[]',
            category_id TEXT,
            thumbnail_url TEXT,
            thumbnail_time_ms INTEGER,
            status TEXT NOT NULL DEFAULT 'uploading',
            visibility TEXT NOT NULL DEFAULT 'public',
            views INTEGER NOT NULL DEFAULT 0,
            duration INTEGER,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS comments (
            id TEXT PRIMARY KEY,
            video_id TEXT NOT NULL,
            author_id TEXT NOT NULL,
            text TEXT NOT NULL,
            created_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS subscriptions (
            subscriber_id TEXT NOT NULL,
            channel_id TEXT NOT NULL,
            created_at TEXT NOT NULL,
            PRIMARY KEY (subscriber_id, channel_id)
        );

        CREATE TABLE IF NOT EXISTS reactions (
            video_id TEXT NOT NULL,
            user_id TEXT NOT NULL,
            kind TEXT NOT NULL,
            PRIMARY KEY (video_id, user_id)
        );

        CREATE TABLE IF NOT EXISTS notifications (
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL,
            kind TEXT NOT NULL,
            actor_id TEXT,
            video_id TEXT,
            comment_id TEXT,
            message TEXT,
            read INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS watch_history (
            user_id TEXT NOT NULL,
            video_id TEXT NOT NULL,
            watched_at TEXT NOT NULL,
            PRIMARY KEY (user_id, video_id)
        );

        CREATE TABLE IF NOT EXISTS search_history (
            user_id TEXT NOT NULL,
            query TEXT NOT NULL,
            searched_at TEXT NOT NULL,
            PRIMARY KEY (user_id, query)
        );

        CREATE INDEX IF NOT EXISTS idx_videos_owner ON videos(owner_id);
        CREATE INDEX IF NOT EXISTS idx_comments_video ON comments(video_id);
        CREATE INDEX IF NOT EXISTS idx_subscriptions_channel ON subscriptions(channel_id);
        CREATE INDEX IF NOT EXISTS idx_notifications_user ON notifications(user_id);
        "#,
    )
    .await?;

    for (id, name) in DEFAULT_CATEGORIES {
        conn.execute(
            "INSERT OR IGNORE INTO categories (id, name) VALUES (?1, ?2)",
            params![id, name],
        )
        .await?;
    }
    Ok(())
}

fn now() -> String {
    chrono::Utc::now().to_rfc3339()
}

fn new_id() -> String {
    Uuid::new_v4().to_string()
}

/// Escapes `%`, `_` and `\` so user input matches literally in `LIKE ... ESCAPE '\'`.
fn like_literal(input: &str) -> String {
    let mut escaped = String::with_capacity(input.len());
    for ch in input.to_lowercase().chars() {
        if matches!(ch, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(ch);
    }
    escaped
}

fn excerpt(text: &str) -> String {
    let mut chars = text.chars();
    let head: String = chars.by_ref().take(COMMENT_EXCERPT_CHARS).collect();
    if chars.next().is_some() {
        format!("{head}…")
    } else {
        head
    }
}

const VIDEO_COLUMNS: &str = r#"
    id, owner_id, remote_video_id, title, description, tags_json, category_id,
    thumbnail_url, thumbnail_time_ms, status, visibility, views, duration,
    created_at, updated_at
"#;

const USER_COLUMNS: &str = "id, handle, name, channel_name, avatar_url, created_at";

const NOTIFICATION_COLUMNS: &str =
    "id, user_id, kind, actor_id, video_id, comment_id, message, read, created_at";

/// Handle to the catalog database. Cheap to clone; clones share the
/// connection used for single statements. Every write transaction runs on
/// a connection of its own.
#[derive(Clone)]
pub struct Catalog {
    db: Arc<Database>,
    conn: Connection,
}

impl fmt::Debug for Catalog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Catalog").finish_non_exhaustive()
    }
}

impl Catalog {
    /// Opens (and if necessary creates) the database and its schema.
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating catalog directory {}", parent.display()))?;
        }

        let db = Builder::new_local(path)
            .build()
            .await
            .with_context(|| format!("opening catalog DB {}", path.display()))?;

        let conn = db.connect()?;
        configure_connection(&conn).await?;
        ensure_schema(&conn).await?;
        Ok(Self {
            db: Arc::new(db),
            conn,
        })
    }

    /// Starts an IMMEDIATE transaction on a fresh connection, so concurrent
    /// callers never share a BEGIN/COMMIT pair and writers queue on the
    /// busy timeout instead of failing on a stale read snapshot.
    async fn begin_write(&self) -> Result<Transaction> {
        let conn = self.db.connect()?;
        configure_session(&conn).await?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .await?;
        Ok(tx)
    }

    // Users and channels.

    pub async fn upsert_user(&self, user: &UserRecord) -> Result<()> {
        self.conn
            .execute(
                r#"
                INSERT INTO users (id, handle, name, channel_name, avatar_url, created_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                ON CONFLICT(id) DO UPDATE SET
                    handle = excluded.handle,
                    name = excluded.name,
                    channel_name = excluded.channel_name,
                    avatar_url = excluded.avatar_url
                "#,
                params![
                    user.id.as_str(),
                    user.handle.as_deref(),
                    user.name.as_deref(),
                    user.channel_name.as_deref(),
                    user.avatar_url.as_deref(),
                    user.created_at.as_str(),
                ],
            )
            .await
            .with_context(|| format!("saving user {}", user.id))?;
        Ok(())
    }

    /// Creates a bare row for identities first seen through the auth header.
    pub async fn ensure_user(&self, id: &str) -> Result<()> {
        self.conn
            .execute(
                "INSERT OR IGNORE INTO users (id, created_at) VALUES (?1, ?2)",
                params![id, now()],
            )
            .await?;
        Ok(())
    }

    pub async fn get_user(&self, id: &str) -> Result<Option<UserRecord>> {
        self.fetch_user("WHERE id = ?1", [id]).await
    }

    pub async fn user_by_handle(&self, handle: &str) -> Result<Option<UserRecord>> {
        let handle = handle.trim_start_matches('@');
        self.fetch_user("WHERE lower(handle) = lower(?1)", [handle])
            .await
    }

    async fn fetch_user(&self, filter: &str, args: impl IntoParams) -> Result<Option<UserRecord>> {
        let mut rows = self
            .conn
            .query(&format!("SELECT {USER_COLUMNS} FROM users {filter}"), args)
            .await?;
        match rows.next().await? {
            Some(row) => Ok(Some(row_to_user(&row)?)),
            None => Ok(None),
        }
    }

    pub async fn subscriber_count(&self, channel_id: &str) -> Result<i64> {
        self.count(
            "SELECT COUNT(*) FROM subscriptions WHERE channel_id = ?1",
            [channel_id],
        )
        .await
    }

    pub async fn is_subscribed(&self, subscriber_id: &str, channel_id: &str) -> Result<bool> {
        let found = self
            .count(
                "SELECT COUNT(*) FROM subscriptions WHERE subscriber_id = ?1 AND channel_id = ?2",
                [subscriber_id, channel_id],
            )
            .await?;
        Ok(found > 0)
    }

    /// Returns `false` when the subscription already existed. A new
    /// subscription notifies the channel owner.
    pub async fn subscribe(&self, subscriber_id: &str, channel_id: &str) -> Result<bool> {
        let tx = self.begin_write().await?;
        let inserted = tx
            .execute(
                r#"
                INSERT OR IGNORE INTO subscriptions (subscriber_id, channel_id, created_at)
                VALUES (?1, ?2, ?3)
                "#,
                params![subscriber_id, channel_id, now()],
            )
            .await?;
        if inserted > 0 {
            insert_notification(
                &tx,
                channel_id,
                NotificationKind::Subscription,
                Some(subscriber_id),
                None,
                None,
                None,
            )
            .await?;
        }
        tx.commit().await?;
        Ok(inserted > 0)
    }

    pub async fn unsubscribe(&self, subscriber_id: &str, channel_id: &str) -> Result<bool> {
        let removed = self
            .conn
            .execute(
                "DELETE FROM subscriptions WHERE subscriber_id = ?1 AND channel_id = ?2",
                params![subscriber_id, channel_id],
            )
            .await?;
        Ok(removed > 0)
    }

    // Categories.

    pub async fn list_categories(&self) -> Result<Vec<CategoryRecord>> {
        let mut rows = self
            .conn
            .query("SELECT id, name FROM categories ORDER BY name", params![])
            .await?;
        let mut categories = Vec::new();
        while let Some(row) = rows.next().await? {
            categories.push(CategoryRecord {
                id: row.get(0)?,
                name: row.get(1)?,
            });
        }
        Ok(categories)
    }

    /// Looks a category up by id or, case-insensitively, by name.
    pub async fn find_category(&self, id_or_name: &str) -> Result<Option<CategoryRecord>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, name FROM categories WHERE id = ?1 OR lower(name) = lower(?1)",
                [id_or_name.trim()],
            )
            .await?;
        match rows.next().await? {
            Some(row) => Ok(Some(CategoryRecord {
                id: row.get(0)?,
                name: row.get(1)?,
            })),
            None => Ok(None),
        }
    }

    // Videos.

    pub async fn create_video(&self, video: &NewVideo) -> Result<VideoRecord> {
        let id = new_id();
        let created = now();
        let tags_json = serde_json::to_string(&video.tags).context("serializing tags")?;
        self.conn
            .execute(
                &format!(
                    r#"
                    INSERT INTO videos ({VIDEO_COLUMNS})
                    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, NULL, ?9, ?10, 0, NULL, ?11, ?11)
                    "#
                ),
                params![
                    id.as_str(),
                    video.owner_id.as_str(),
                    video.remote_video_id.as_deref(),
                    video.title.trim(),
                    video.description.as_str(),
                    tags_json,
                    video.category_id.as_deref(),
                    video.thumbnail_url.as_deref(),
                    VideoStatus::Uploading.as_str(),
                    video.visibility.as_str(),
                    created.as_str(),
                ],
            )
            .await
            .context("inserting video")?;
        self.get_video(&id)
            .await?
            .context("video vanished right after insert")
    }

    pub async fn get_video(&self, id: &str) -> Result<Option<VideoRecord>> {
        Ok(self.fetch_videos("WHERE id = ?1", [id]).await?.pop())
    }

    pub async fn video_by_remote_id(&self, remote: &str) -> Result<Option<VideoRecord>> {
        Ok(self
            .fetch_videos("WHERE remote_video_id = ?1", [remote])
            .await?
            .pop())
    }

    /// Ready, public videos, newest first.
    pub async fn list_public_videos(&self, category: Option<&str>) -> Result<Vec<VideoRecord>> {
        match category {
            Some(category) => {
                self.fetch_videos(
                    "WHERE status = 'ready' AND visibility = 'public' AND category_id = ?1
                     ORDER BY created_at DESC, rowid DESC",
                    [category],
                )
                .await
            }
            None => {
                self.fetch_videos(
                    "WHERE status = 'ready' AND visibility = 'public'
                     ORDER BY created_at DESC, rowid DESC",
                    params![],
                )
                .await
            }
        }
    }

    pub async fn channel_videos(&self, owner_id: &str) -> Result<Vec<VideoRecord>> {
        self.fetch_videos(
            "WHERE owner_id = ?1 AND status = 'ready' AND visibility = 'public'
             ORDER BY created_at DESC, rowid DESC",
            [owner_id],
        )
        .await
    }

    pub async fn update_video(&self, id: &str, patch: &VideoPatch) -> Result<Option<VideoRecord>> {
        let tags_json = patch
            .tags
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .context("serializing tags")?;
        let updated = self
            .conn
            .execute(
                r#"
                UPDATE videos SET
                    title = COALESCE(?2, title),
                    description = COALESCE(?3, description),
                    tags_json = COALESCE(?4, tags_json),
                    category_id = COALESCE(?5, category_id),
                    visibility = COALESCE(?6, visibility),
                    thumbnail_url = COALESCE(?7, thumbnail_url),
                    updated_at = ?8
                WHERE id = ?1
                "#,
                params![
                    id,
                    patch.title.as_deref().map(str::trim),
                    patch.description.as_deref(),
                    tags_json,
                    patch.category_id.as_deref(),
                    patch.visibility.map(Visibility::as_str),
                    patch.thumbnail_url.as_deref(),
                    now(),
                ],
            )
            .await
            .with_context(|| format!("updating video {id}"))?;
        if updated == 0 {
            return Ok(None);
        }
        self.get_video(id).await
    }

    /// Removes the video and everything hanging off it.
    pub async fn delete_video(&self, id: &str) -> Result<bool> {
        let tx = self.begin_write().await?;
        for table in ["comments", "reactions", "watch_history", "notifications"] {
            tx.execute(
                &format!("DELETE FROM {table} WHERE video_id = ?1"),
                params![id],
            )
            .await?;
        }
        let removed = tx
            .execute("DELETE FROM videos WHERE id = ?1", params![id])
            .await?;
        tx.commit().await?;
        Ok(removed > 0)
    }

    /// Moves a video to `status`, returning the updated row. Reaching
    /// `ready` for the first time notifies the owner's subscribers.
    pub async fn set_status_by_remote_id(
        &self,
        remote: &str,
        status: VideoStatus,
    ) -> Result<Option<VideoRecord>> {
        let tx = self.begin_write().await?;
        let changed = tx
            .execute(
                r#"
                UPDATE videos SET status = ?2, updated_at = ?3
                WHERE remote_video_id = ?1 AND status != ?2
                "#,
                params![remote, status.as_str(), now()],
            )
            .await?;

        if changed > 0 && status == VideoStatus::Ready {
            let mut rows = tx
                .query(
                    r#"
                    SELECT v.id, v.owner_id, s.subscriber_id
                    FROM videos v
                    JOIN subscriptions s ON s.channel_id = v.owner_id
                    WHERE v.remote_video_id = ?1
                    "#,
                    [remote],
                )
                .await?;
            let mut recipients = Vec::new();
            while let Some(row) = rows.next().await? {
                recipients.push((
                    row.get::<String>(0)?,
                    row.get::<String>(1)?,
                    row.get::<String>(2)?,
                ));
            }
            drop(rows);
            for (video_id, owner_id, subscriber_id) in &recipients {
                insert_notification(
                    &tx,
                    subscriber_id,
                    NotificationKind::UploadReady,
                    Some(owner_id),
                    Some(video_id),
                    None,
                    None,
                )
                .await?;
            }
            info!(remote, notified = recipients.len(), "video is ready");
        }
        tx.commit().await?;
        self.video_by_remote_id(remote).await
    }

    /// Bumps the view counter and, for signed-in viewers, the watch history.
    /// `None` when the video does not exist.
    pub async fn record_view(&self, video_id: &str, viewer: Option<&str>) -> Result<Option<i64>> {
        let updated = self
            .conn
            .execute(
                "UPDATE videos SET views = views + 1 WHERE id = ?1",
                params![video_id],
            )
            .await?;
        if updated == 0 {
            return Ok(None);
        }
        if let Some(viewer) = viewer {
            self.conn
                .execute(
                    r#"
                    INSERT INTO watch_history (user_id, video_id, watched_at)
                    VALUES (?1, ?2, ?3)
                    ON CONFLICT(user_id, video_id) DO UPDATE SET watched_at = excluded.watched_at
                    "#,
                    params![viewer, video_id, now()],
                )
                .await?;
        }
        let views = self
            .count("SELECT views FROM videos WHERE id = ?1", [video_id])
            .await?;
        Ok(Some(views))
    }

    /// Video ids the user watched, most recent first.
    pub async fn watch_history(&self, user_id: &str) -> Result<Vec<String>> {
        let mut rows = self
            .conn
            .query(
                "SELECT video_id FROM watch_history WHERE user_id = ?1 ORDER BY watched_at DESC, rowid DESC",
                [user_id],
            )
            .await?;
        let mut ids = Vec::new();
        while let Some(row) = rows.next().await? {
            ids.push(row.get(0)?);
        }
        Ok(ids)
    }

    async fn fetch_videos(&self, tail: &str, args: impl IntoParams) -> Result<Vec<VideoRecord>> {
        let mut rows = self
            .conn
            .query(&format!("SELECT {VIDEO_COLUMNS} FROM videos {tail}"), args)
            .await?;
        let mut videos = Vec::new();
        while let Some(row) = rows.next().await? {
            videos.push(row_to_video(&row)?);
        }
        Ok(videos)
    }

    // Comments.

    /// Stores a comment and notifies the video owner unless they wrote it.
    pub async fn add_comment(
        &self,
        video_id: &str,
        author_id: &str,
        text: &str,
    ) -> Result<Option<CommentRecord>> {
        let Some(video) = self.get_video(video_id).await? else {
            return Ok(None);
        };
        let comment = CommentRecord {
            id: new_id(),
            video_id: video_id.to_string(),
            author_id: author_id.to_string(),
            text: text.trim().to_string(),
            created_at: now(),
        };
        let tx = self.begin_write().await?;
        tx.execute(
            r#"
            INSERT INTO comments (id, video_id, author_id, text, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
            params![
                comment.id.as_str(),
                comment.video_id.as_str(),
                comment.author_id.as_str(),
                comment.text.as_str(),
                comment.created_at.as_str(),
            ],
        )
        .await?;
        if video.owner_id != author_id {
            insert_notification(
                &tx,
                &video.owner_id,
                NotificationKind::Comment,
                Some(author_id),
                Some(video_id),
                Some(&comment.id),
                Some(&excerpt(&comment.text)),
            )
            .await?;
        }
        tx.commit().await?;
        Ok(Some(comment))
    }

    /// Oldest first.
    pub async fn list_comments(&self, video_id: &str) -> Result<Vec<CommentRecord>> {
        let mut rows = self
            .conn
            .query(
                r#"
                SELECT id, video_id, author_id, text, created_at
                FROM comments
                WHERE video_id = ?1
                ORDER BY created_at ASC, rowid ASC
                "#,
                [video_id],
            )
            .await?;
        let mut comments = Vec::new();
        while let Some(row) = rows.next().await? {
            comments.push(CommentRecord {
                id: row.get(0)?,
                video_id: row.get(1)?,
                author_id: row.get(2)?,
                text: row.get(3)?,
                created_at: row.get(4)?,
            });
        }
        Ok(comments)
    }

    // Reactions.

    /// Replaces the user's reaction; `None` clears it.
    pub async fn set_reaction(
        &self,
        video_id: &str,
        user_id: &str,
        kind: Option<ReactionKind>,
    ) -> Result<ReactionSummary> {
        match kind {
            Some(kind) => {
                self.conn
                    .execute(
                        r#"
                        INSERT INTO reactions (video_id, user_id, kind) VALUES (?1, ?2, ?3)
                        ON CONFLICT(video_id, user_id) DO UPDATE SET kind = excluded.kind
                        "#,
                        params![video_id, user_id, kind.as_str()],
                    )
                    .await?;
            }
            None => {
                self.conn
                    .execute(
                        "DELETE FROM reactions WHERE video_id = ?1 AND user_id = ?2",
                        params![video_id, user_id],
                    )
                    .await?;
            }
        }
        self.reactions(video_id, Some(user_id)).await
    }

    pub async fn reactions(&self, video_id: &str, viewer: Option<&str>) -> Result<ReactionSummary> {
        let mut rows = self
            .conn
            .query(
                r#"
                SELECT
                    COALESCE(SUM(kind = 'like'), 0),
                    COALESCE(SUM(kind = 'dislike'), 0),
                    MAX(CASE WHEN user_id = ?2 THEN kind END)
                FROM reactions WHERE video_id = ?1
                "#,
                params![video_id, viewer.unwrap_or_default()],
            )
            .await?;
        let Some(row) = rows.next().await? else {
            return Ok(ReactionSummary::default());
        };
        let mine = row
            .get::<Option<String>>(2)?
            .map(|kind| kind.parse())
            .transpose()?;
        Ok(ReactionSummary {
            likes: row.get(0)?,
            dislikes: row.get(1)?,
            mine: viewer.and(mine),
        })
    }

    // Notifications.

    /// Newest first.
    pub async fn list_notifications(&self, user_id: &str) -> Result<Vec<NotificationRecord>> {
        let mut rows = self
            .conn
            .query(
                &format!(
                    "SELECT {NOTIFICATION_COLUMNS} FROM notifications WHERE user_id = ?1
                     ORDER BY created_at DESC, rowid DESC"
                ),
                [user_id],
            )
            .await?;
        let mut notifications = Vec::new();
        while let Some(row) = rows.next().await? {
            notifications.push(row_to_notification(&row)?);
        }
        Ok(notifications)
    }

    pub async fn mark_notification_read(&self, user_id: &str, id: &str) -> Result<bool> {
        let updated = self
            .conn
            .execute(
                "UPDATE notifications SET read = 1 WHERE id = ?1 AND user_id = ?2",
                params![id, user_id],
            )
            .await?;
        Ok(updated > 0)
    }

    pub async fn mark_all_notifications_read(&self, user_id: &str) -> Result<u64> {
        Ok(self
            .conn
            .execute(
                "UPDATE notifications SET read = 1 WHERE user_id = ?1 AND read = 0",
                params![user_id],
            )
            .await?)
    }

    pub async fn delete_notification(&self, user_id: &str, id: &str) -> Result<bool> {
        let removed = self
            .conn
            .execute(
                "DELETE FROM notifications WHERE id = ?1 AND user_id = ?2",
                params![id, user_id],
            )
            .await?;
        Ok(removed > 0)
    }

    // Search.

    /// Titles of listed videos matching `query`: prefix matches first, then
    /// any substring match.
    pub async fn search_suggestions(&self, query: &str) -> Result<Vec<String>> {
        let query = query.trim();
        if query.is_empty() {
            return Ok(Vec::new());
        }
        let pattern = like_literal(query);
        let mut rows = self
            .conn
            .query(
                r#"
                SELECT title, MIN(CASE WHEN lower(title) LIKE ?1 || '%' ESCAPE '\' THEN 0 ELSE 1 END) AS rank
                FROM videos
                WHERE status = 'ready' AND visibility = 'public'
                  AND lower(title) LIKE '%' || ?1 || '%' ESCAPE '\'
                GROUP BY title
                ORDER BY rank, title
                LIMIT ?2
                "#,
                params![pattern, MAX_SUGGESTIONS],
            )
            .await?;
        let mut titles = Vec::new();
        while let Some(row) = rows.next().await? {
            titles.push(row.get(0)?);
        }
        Ok(titles)
    }

    pub async fn record_search(&self, user_id: &str, query: &str) -> Result<()> {
        let query = query.trim();
        if query.is_empty() {
            return Ok(());
        }
        self.conn
            .execute(
                r#"
                INSERT INTO search_history (user_id, query, searched_at) VALUES (?1, ?2, ?3)
                ON CONFLICT(user_id, query) DO UPDATE SET searched_at = excluded.searched_at
                "#,
                params![user_id, query, now()],
            )
            .await?;
        Ok(())
    }

    pub async fn recent_searches(&self, user_id: &str) -> Result<Vec<String>> {
        let mut rows = self
            .conn
            .query(
                r#"
                SELECT query FROM search_history WHERE user_id = ?1
                ORDER BY searched_at DESC, rowid DESC
                LIMIT ?2
                "#,
                params![user_id, MAX_RECENT_SEARCHES],
            )
            .await?;
        let mut queries = Vec::new();
        while let Some(row) = rows.next().await? {
            queries.push(row.get(0)?);
        }
        Ok(queries)
    }

    /// Every video regardless of status or visibility, filtered by title,
    /// description or provider id.
    pub async fn admin_search(&self, query: &str) -> Result<Vec<VideoRecord>> {
        let query = query.trim();
        if query.is_empty() {
            return self
                .fetch_videos("ORDER BY created_at DESC, rowid DESC", params![])
                .await;
        }
        self.fetch_videos(
            r#"
            WHERE lower(title) LIKE '%' || ?1 || '%' ESCAPE '\'
               OR lower(description) LIKE '%' || ?1 || '%' ESCAPE '\'
               OR lower(COALESCE(remote_video_id, '')) LIKE '%' || ?1 || '%' ESCAPE '\'
            ORDER BY created_at DESC, rowid DESC
            "#,
            [like_literal(query)],
        )
        .await
    }

    async fn count(&self, sql: &str, args: impl IntoParams) -> Result<i64> {
        let mut rows = self.conn.query(sql, args).await?;
        let row = rows.next().await?.context("count query returned no row")?;
        Ok(row.get(0)?)
    }
}

#[async_trait]
impl VideoCatalog for Catalog {
    async fn save_details(
        &self,
        owner_id: &str,
        remote: &RemoteVideoId,
        details: &VideoDetails,
    ) -> Result<String> {
        let (thumbnail_url, thumbnail_time_ms) = match details.thumbnail {
            ThumbnailRef::Frame { offset_ms } => (None::<String>, Some(offset_ms as i64)),
            ThumbnailRef::Custom => (None, None),
        };
        let tags_json = serde_json::to_string(&details.tags).context("serializing tags")?;
        let timestamp = now();
        self.conn
            .execute(
                &format!(
                    r#"
                    INSERT INTO videos ({VIDEO_COLUMNS})
                    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, 'processing', ?10, 0, NULL, ?11, ?11)
                    ON CONFLICT(remote_video_id) DO UPDATE SET
                        title = excluded.title,
                        description = excluded.description,
                        tags_json = excluded.tags_json,
                        category_id = excluded.category_id,
                        thumbnail_url = excluded.thumbnail_url,
                        thumbnail_time_ms = excluded.thumbnail_time_ms,
                        visibility = excluded.visibility,
                        status = CASE WHEN videos.status = 'uploading' THEN 'processing' ELSE videos.status END,
                        updated_at = excluded.updated_at
                    "#
                ),
                params![
                    new_id(),
                    owner_id,
                    remote.as_str(),
                    details.title.trim(),
                    details.description.as_str(),
                    tags_json,
                    details.category_id.as_str(),
                    thumbnail_url,
                    thumbnail_time_ms,
                    details.visibility.as_str(),
                    timestamp,
                ],
            )
            .await
            .with_context(|| format!("saving details for remote video {remote}"))?;

        let video = self
            .video_by_remote_id(remote.as_str())
            .await?
            .with_context(|| format!("remote video {remote} missing after save"))?;
        debug!(video = %video.id, %remote, "saved video details");
        Ok(video.id)
    }

    async fn mark_ready(&self, remote: &RemoteVideoId) -> Result<()> {
        self.set_status_by_remote_id(remote.as_str(), VideoStatus::Ready)
            .await?
            .with_context(|| format!("no catalog entry for remote video {remote}"))?;
        Ok(())
    }
}

async fn insert_notification(
    conn: &Connection,
    user_id: &str,
    kind: NotificationKind,
    actor_id: Option<&str>,
    video_id: Option<&str>,
    comment_id: Option<&str>,
    message: Option<&str>,
) -> Result<()> {
    conn.execute(
        &format!(
            "INSERT INTO notifications ({NOTIFICATION_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 0, ?8)"
        ),
        params![
            new_id(),
            user_id,
            kind.as_str(),
            actor_id,
            video_id,
            comment_id,
            message,
            now(),
        ],
    )
    .await?;
    Ok(())
}

fn row_to_user(row: &Row) -> Result<UserRecord> {
    Ok(UserRecord {
        id: row.get(0)?,
        handle: row.get(1)?,
        name: row.get(2)?,
        channel_name: row.get(3)?,
        avatar_url: row.get(4)?,
        created_at: row.get(5)?,
    })
}

/// Column order must match `VIDEO_COLUMNS`.
fn row_to_video(row: &Row) -> Result<VideoRecord> {
    let tags_json: String = row.get(5)?;
    let tags: Vec<String> = serde_json::from_str(&tags_json).context("parsing stored tags JSON")?;
    let status: String = row.get(9)?;
    let visibility: String = row.get(10)?;
    Ok(VideoRecord {
        id: row.get(0)?,
        owner_id: row.get(1)?,
        remote_video_id: row.get(2)?,
        title: row.get(3)?,
        description: row.get(4)?,
        tags,
        category_id: row.get(6)?,
        thumbnail_url: row.get(7)?,
        thumbnail_time_ms: row.get(8)?,
        status: status.parse()?,
        visibility: visibility.parse()?,
        views: row.get(11)?,
        duration: row.get(12)?,
        created_at: row.get(13)?,
        updated_at: row.get(14)?,
    })
}

fn row_to_notification(row: &Row) -> Result<NotificationRecord> {
    let kind: String = row.get(2)?;
    Ok(NotificationRecord {
        id: row.get(0)?,
        user_id: row.get(1)?,
        kind: kind.parse()?,
        actor_id: row.get(3)?,
        video_id: row.get(4)?,
        comment_id: row.get(5)?,
        message: row.get(6)?,
        read: row.get::<i64>(7).map(|value| value != 0)?,
        created_at: row.get(8)?,
    })
}
