#![forbid(unsafe_code)]

//! Axum backend for vidshare.
//!
//! Serves the catalog API, receives the streaming provider's completion
//! webhook and hands every other path to the single page app in `WWW_ROOT`.
//! Identity comes from the `x-user-id` header, which the auth proxy in front
//! of this process sets; nothing here verifies it further.

use std::{
    collections::HashMap,
    net::{IpAddr, SocketAddr},
    path::{Component, Path, PathBuf},
    sync::Arc,
};

use anyhow::{Context, Result, anyhow};
use axum::{
    Json, Router,
    body::Body,
    extract::{Path as AxumPath, Query, State, rejection::JsonRejection},
    http::{HeaderMap, Request, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use mime_guess::MimeGuess;
use serde::{Deserialize, Serialize};
use tokio::{fs::File, signal};
use tokio_util::io::ReaderStream;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use vidshare::{
    cache::{self, TtlCache},
    catalog::{
        Catalog, CategoryRecord, NewVideo, ReactionKind, ReactionSummary, UserRecord, VideoPatch,
        VideoRecord, VideoStatus,
    },
    config::{CATALOG_DB_FILE, RuntimeOverrides, resolve_runtime_settings},
    error::DetailsError,
    provider::WebhookEvent,
    security::{AccessError, ensure_not_root, ensure_owner},
    view::{ChannelView, CommentView, NotificationView, VideoView},
};

const USER_HEADER: &str = "x-user-id";

#[derive(Debug, Clone)]
struct BackendArgs {
    data_root: PathBuf,
    www_root: PathBuf,
    vidshare_port: u16,
    listen_host: IpAddr,
    library_id: Option<String>,
}

impl BackendArgs {
    fn parse() -> Result<Self> {
        Self::from_iter(std::env::args().skip(1))
    }

    fn from_iter<I>(iter: I) -> Result<Self>
    where
        I: IntoIterator<Item = String>,
    {
        let mut data_root_override: Option<PathBuf> = None;
        let mut www_root_override: Option<PathBuf> = None;
        let mut port_override: Option<u16> = None;
        let mut host_override: Option<IpAddr> = None;
        let mut env_path: Option<PathBuf> = None;
        let mut args = iter.into_iter();
        while let Some(arg) = args.next() {
            if let Some(value) = arg.strip_prefix("--data-root=") {
                data_root_override = Some(PathBuf::from(value));
                continue;
            }
            if let Some(value) = arg.strip_prefix("--www-root=") {
                www_root_override = Some(PathBuf::from(value));
                continue;
            }
            if let Some(value) = arg.strip_prefix("--port=") {
                port_override = Some(parse_port_arg(value)?);
                continue;
            }
            if let Some(value) = arg.strip_prefix("--host=") {
                host_override = Some(parse_host_arg(value)?);
                continue;
            }
            if let Some(value) = arg.strip_prefix("--env-file=") {
                env_path = Some(PathBuf::from(value));
                continue;
            }

            match arg.as_str() {
                "--data-root" => {
                    let value = args
                        .next()
                        .ok_or_else(|| anyhow!("--data-root requires a value"))?;
                    data_root_override = Some(PathBuf::from(value));
                }
                "--www-root" => {
                    let value = args
                        .next()
                        .ok_or_else(|| anyhow!("--www-root requires a value"))?;
                    www_root_override = Some(PathBuf::from(value));
                }
                "--port" => {
                    let value = args
                        .next()
                        .ok_or_else(|| anyhow!("--port requires a value"))?;
                    port_override = Some(parse_port_arg(&value)?);
                }
                "--host" => {
                    let value = args
                        .next()
                        .ok_or_else(|| anyhow!("--host requires a value"))?;
                    host_override = Some(parse_host_arg(&value)?);
                }
                "--env-file" => {
                    let value = args
                        .next()
                        .ok_or_else(|| anyhow!("--env-file requires a value"))?;
                    env_path = Some(PathBuf::from(value));
                }
                _ => return Err(anyhow!("unknown argument: {arg}")),
            }
        }

        let settings = resolve_runtime_settings(RuntimeOverrides {
            data_root: data_root_override,
            www_root: www_root_override,
            vidshare_port: port_override,
            env_path,
            ..RuntimeOverrides::default()
        })?;
        let listen_host = match host_override {
            Some(host) => host,
            None => parse_host_arg(&settings.vidshare_host)?,
        };

        Ok(Self {
            data_root: settings.data_root,
            www_root: settings.www_root,
            vidshare_port: settings.vidshare_port,
            listen_host,
            library_id: settings.provider.library_id,
        })
    }
}

fn parse_port_arg(value: &str) -> Result<u16> {
    value
        .parse::<u16>()
        .context("expected a numeric port between 0 and 65535")
}

fn parse_host_arg(value: &str) -> Result<IpAddr> {
    value
        .parse::<IpAddr>()
        .context("expected a valid IPv4 or IPv6 address for --host/VIDSHARE_HOST")
}

#[derive(Clone)]
struct AppState {
    catalog: Catalog,
    /// Caller-independent channel pages keyed by lowercase handle.
    channels: Arc<TtlCache<String, ChannelView>>,
    recent_searches: Arc<TtlCache<String, Vec<String>>>,
    www_root: Arc<PathBuf>,
    /// Webhooks for any other library are refused when this is set.
    library_id: Option<String>,
}

impl AppState {
    fn new(catalog: Catalog, www_root: PathBuf, library_id: Option<String>) -> Self {
        Self {
            catalog,
            channels: Arc::new(TtlCache::default()),
            recent_searches: Arc::new(TtlCache::default()),
            www_root: Arc::new(www_root),
            library_id,
        }
    }

    async fn forget_channel_of(&self, owner_id: &str) -> ApiResult<()> {
        if let Some(handle) = self
            .catalog
            .get_user(owner_id)
            .await?
            .and_then(|owner| owner.handle)
        {
            self.channels.expire(&channel_key(&handle));
        }
        Ok(())
    }

    async fn load_users<'a>(
        &self,
        ids: impl IntoIterator<Item = &'a str>,
    ) -> ApiResult<HashMap<String, UserRecord>> {
        let mut users = HashMap::new();
        for id in ids {
            if users.contains_key(id) {
                continue;
            }
            if let Some(user) = self.catalog.get_user(id).await? {
                users.insert(id.to_string(), user);
            }
        }
        Ok(users)
    }

    async fn video_views(&self, videos: Vec<VideoRecord>) -> ApiResult<Vec<VideoView>> {
        let owners = self
            .load_users(videos.iter().map(|video| video.owner_id.as_str()).collect::<Vec<_>>())
            .await?;
        Ok(videos
            .into_iter()
            .map(|video| {
                let owner = owners.get(&video.owner_id);
                VideoView::assemble(video, owner)
            })
            .collect())
    }

    /// The video as `caller` may see it: unlisted rows only reach their owner.
    async fn visible_video(&self, id: &str, caller: Option<&str>) -> ApiResult<VideoRecord> {
        let video = self
            .catalog
            .get_video(id)
            .await?
            .ok_or_else(|| ApiError::not_found("video not found"))?;
        if video.is_listed() || caller == Some(video.owner_id.as_str()) {
            Ok(video)
        } else {
            Err(ApiError::not_found("video not found"))
        }
    }

    /// The video `caller` is allowed to change.
    async fn owned_video(&self, id: &str, caller: Option<&str>) -> ApiResult<VideoRecord> {
        let video = self
            .catalog
            .get_video(id)
            .await?
            .ok_or_else(|| ApiError::not_found("video not found"))?;
        ensure_owner(caller, &video.owner_id)?;
        Ok(video)
    }
}

fn channel_key(handle: &str) -> String {
    handle.trim_start_matches('@').to_lowercase()
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    fn unauthorized(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::UNAUTHORIZED,
            message: message.into(),
        }
    }

    fn forbidden(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::FORBIDDEN,
            message: message.into(),
        }
    }

    /// Creates a 404 error with the provided message.
    fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
        }
    }

    /// Creates a 500 error with the provided message.
    fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
        }
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        error!(error = %format!("{err:#}"), "request failed");
        Self::internal("internal server error")
    }
}

impl From<AccessError> for ApiError {
    fn from(err: AccessError) -> Self {
        match err {
            AccessError::Anonymous => Self::unauthorized(err.to_string()),
            AccessError::NotOwner { .. } => Self::forbidden(err.to_string()),
        }
    }
}

impl From<DetailsError> for ApiError {
    fn from(err: DetailsError) -> Self {
        Self::bad_request(err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "error": self.message,
        });
        (self.status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

fn caller(headers: &HeaderMap) -> Option<String> {
    headers
        .get(USER_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

fn require_caller(headers: &HeaderMap) -> ApiResult<String> {
    caller(headers).ok_or_else(|| ApiError::from(AccessError::Anonymous))
}

fn json_body<T>(payload: Result<Json<T>, JsonRejection>) -> ApiResult<T> {
    payload
        .map(|Json(value)| value)
        .map_err(|rejection| ApiError::bad_request(rejection.body_text()))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let BackendArgs {
        data_root,
        www_root,
        vidshare_port,
        listen_host,
        library_id,
    } = BackendArgs::parse()?;

    ensure_not_root("backend")?;

    let catalog = Catalog::open(&data_root.join(CATALOG_DB_FILE))
        .await
        .context("opening catalog")?;
    if library_id.is_none() {
        warn!("STREAM_LIBRARY_ID not set; webhooks from any library are accepted");
    }
    let state = AppState::new(catalog, www_root, library_id);
    cache::spawn_purge(&state.channels, "channels");
    cache::spawn_purge(&state.recent_searches, "recent_searches");

    let addr = SocketAddr::new(listen_host, vidshare_port);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding to {addr}"))?;
    info!(%addr, "API server listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("running API server")?;

    Ok(())
}

fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/videos", get(list_videos).post(create_video))
        .route(
            "/api/videos/{id}",
            get(get_video).patch(update_video).delete(delete_video),
        )
        .route("/api/videos/{id}/views", post(record_view))
        .route(
            "/api/videos/{id}/comments",
            get(list_comments).post(add_comment),
        )
        .route("/api/videos/{id}/reaction", post(set_reaction))
        .route("/api/channels/{handle}", get(get_channel))
        .route(
            "/api/channels/{handle}/subscription",
            post(subscribe).delete(unsubscribe),
        )
        .route("/api/categories", get(list_categories))
        .route("/api/search/suggestions", get(search_suggestions))
        .route("/api/search/recent", get(recent_searches))
        .route("/api/notifications", get(list_notifications))
        .route("/api/notifications/read-all", post(mark_all_read))
        .route(
            "/api/notifications/{id}",
            axum::routing::delete(delete_notification),
        )
        .route("/api/notifications/{id}/read", post(mark_read))
        .route("/api/admin/videos", get(admin_videos))
        .route("/api/webhooks/stream", post(stream_webhook))
        .fallback(static_fallback)
        .with_state(state)
}

async fn shutdown_signal() {
    // Only graceful shutdown depends on this; Ctrl+C still ends the process.
    if let Err(err) = signal::ctrl_c().await {
        warn!(%err, "failed to install Ctrl+C handler");
    }
}

#[derive(Debug, Default, Deserialize)]
struct ListQuery {
    category: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct SearchQuery {
    #[serde(default)]
    q: String,
}

#[derive(Debug, Deserialize)]
struct NewComment {
    text: String,
}

#[derive(Debug, Deserialize)]
struct ReactionRequest {
    /// `null` clears the caller's reaction.
    kind: Option<ReactionKind>,
}

#[derive(Debug, Serialize, PartialEq, Eq)]
struct ViewCount {
    views: i64,
}

#[derive(Debug, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
struct SubscriptionState {
    subscribed: bool,
    subscriber_count: i64,
}

#[derive(Debug, Serialize, PartialEq, Eq)]
struct ReadAll {
    updated: u64,
}

#[derive(Debug, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
struct WebhookAck {
    video_id: Option<String>,
    status: Option<VideoStatus>,
}

async fn list_videos(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> ApiResult<Json<Vec<VideoView>>> {
    let category = query
        .category
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty());
    let videos = state.catalog.list_public_videos(category).await?;
    Ok(Json(state.video_views(videos).await?))
}

async fn ensure_category(state: &AppState, category_id: Option<&str>) -> ApiResult<()> {
    let Some(category_id) = category_id else {
        return Ok(());
    };
    let known = state
        .catalog
        .list_categories()
        .await?
        .iter()
        .any(|category| category.id == category_id);
    if known {
        Ok(())
    } else {
        Err(ApiError::bad_request(format!(
            "category_id: unknown category `{category_id}`"
        )))
    }
}

async fn create_video(
    State(state): State<AppState>,
    headers: HeaderMap,
    payload: Result<Json<NewVideo>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<VideoView>)> {
    let user = require_caller(&headers)?;
    let mut video = json_body(payload)?;
    let fields = video.problems();
    if !fields.is_empty() {
        return Err(DetailsError { fields }.into());
    }
    ensure_category(&state, video.category_id.as_deref()).await?;

    state.catalog.ensure_user(&user).await?;
    video.owner_id = user;
    let record = state.catalog.create_video(&video).await?;
    info!(video = %record.id, owner = %record.owner_id, "video created");
    state.forget_channel_of(&record.owner_id).await?;
    let owner = state.catalog.get_user(&record.owner_id).await?;
    Ok((
        StatusCode::CREATED,
        Json(VideoView::assemble(record, owner.as_ref())),
    ))
}

async fn get_video(
    State(state): State<AppState>,
    headers: HeaderMap,
    AxumPath(id): AxumPath<String>,
) -> ApiResult<Json<VideoView>> {
    let user = caller(&headers);
    let video = state.visible_video(&id, user.as_deref()).await?;
    let reactions = state.catalog.reactions(&id, user.as_deref()).await?;
    let owner = state.catalog.get_user(&video.owner_id).await?;
    Ok(Json(
        VideoView::assemble(video, owner.as_ref()).with_reactions(reactions),
    ))
}

async fn update_video(
    State(state): State<AppState>,
    headers: HeaderMap,
    AxumPath(id): AxumPath<String>,
    payload: Result<Json<VideoPatch>, JsonRejection>,
) -> ApiResult<Json<VideoView>> {
    let user = caller(&headers);
    let video = state.owned_video(&id, user.as_deref()).await?;
    let patch = json_body(payload)?;
    let fields = patch.problems();
    if !fields.is_empty() {
        return Err(DetailsError { fields }.into());
    }
    ensure_category(&state, patch.category_id.as_deref()).await?;

    let updated = state
        .catalog
        .update_video(&id, &patch)
        .await?
        .ok_or_else(|| ApiError::not_found("video not found"))?;
    state.forget_channel_of(&video.owner_id).await?;
    let owner = state.catalog.get_user(&updated.owner_id).await?;
    Ok(Json(VideoView::assemble(updated, owner.as_ref())))
}

async fn delete_video(
    State(state): State<AppState>,
    headers: HeaderMap,
    AxumPath(id): AxumPath<String>,
) -> ApiResult<StatusCode> {
    let user = caller(&headers);
    let video = state.owned_video(&id, user.as_deref()).await?;
    if !state.catalog.delete_video(&id).await? {
        return Err(ApiError::not_found("video not found"));
    }
    info!(video = %id, "video deleted");
    state.forget_channel_of(&video.owner_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn record_view(
    State(state): State<AppState>,
    headers: HeaderMap,
    AxumPath(id): AxumPath<String>,
) -> ApiResult<Json<ViewCount>> {
    let user = caller(&headers);
    state.visible_video(&id, user.as_deref()).await?;
    if let Some(user) = user.as_deref() {
        state.catalog.ensure_user(user).await?;
    }
    let views = state
        .catalog
        .record_view(&id, user.as_deref())
        .await?
        .ok_or_else(|| ApiError::not_found("video not found"))?;
    Ok(Json(ViewCount { views }))
}

async fn list_comments(
    State(state): State<AppState>,
    headers: HeaderMap,
    AxumPath(id): AxumPath<String>,
) -> ApiResult<Json<Vec<CommentView>>> {
    let user = caller(&headers);
    state.visible_video(&id, user.as_deref()).await?;
    let comments = state.catalog.list_comments(&id).await?;
    let authors = state
        .load_users(comments.iter().map(|comment| comment.author_id.as_str()).collect::<Vec<_>>())
        .await?;
    Ok(Json(
        comments
            .into_iter()
            .map(|comment| {
                let author = authors.get(&comment.author_id);
                CommentView::assemble(comment, author)
            })
            .collect(),
    ))
}

async fn add_comment(
    State(state): State<AppState>,
    headers: HeaderMap,
    AxumPath(id): AxumPath<String>,
    payload: Result<Json<NewComment>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<CommentView>)> {
    let user = require_caller(&headers)?;
    let NewComment { text } = json_body(payload)?;
    if text.trim().is_empty() {
        return Err(ApiError::bad_request("text: is required"));
    }
    state.visible_video(&id, Some(&user)).await?;
    state.catalog.ensure_user(&user).await?;
    let comment = state
        .catalog
        .add_comment(&id, &user, &text)
        .await?
        .ok_or_else(|| ApiError::not_found("video not found"))?;
    let author = state.catalog.get_user(&user).await?;
    Ok((
        StatusCode::CREATED,
        Json(CommentView::assemble(comment, author.as_ref())),
    ))
}

async fn set_reaction(
    State(state): State<AppState>,
    headers: HeaderMap,
    AxumPath(id): AxumPath<String>,
    payload: Result<Json<ReactionRequest>, JsonRejection>,
) -> ApiResult<Json<ReactionSummary>> {
    let user = require_caller(&headers)?;
    let ReactionRequest { kind } = json_body(payload)?;
    state.visible_video(&id, Some(&user)).await?;
    state.catalog.ensure_user(&user).await?;
    let summary = state.catalog.set_reaction(&id, &user, kind).await?;
    Ok(Json(summary))
}

async fn get_channel(
    State(state): State<AppState>,
    headers: HeaderMap,
    AxumPath(handle): AxumPath<String>,
) -> ApiResult<Json<ChannelView>> {
    let key = channel_key(&handle);
    let mut channel = match state.channels.get(&key) {
        Some(channel) => channel,
        None => {
            let owner = state
                .catalog
                .user_by_handle(&key)
                .await?
                .ok_or_else(|| ApiError::not_found("channel not found"))?;
            let subscribers = state.catalog.subscriber_count(&owner.id).await?;
            let videos = state.catalog.channel_videos(&owner.id).await?;
            let channel = ChannelView::assemble(&owner, subscribers, false, videos);
            state.channels.set(key, channel.clone());
            channel
        }
    };
    if let Some(user) = caller(&headers) {
        channel.subscribed = state
            .catalog
            .is_subscribed(&user, &channel.owner.id)
            .await?;
    }
    Ok(Json(channel))
}

async fn change_subscription(
    state: &AppState,
    headers: &HeaderMap,
    handle: &str,
    subscribe: bool,
) -> ApiResult<SubscriptionState> {
    let user = require_caller(headers)?;
    let channel = state
        .catalog
        .user_by_handle(handle)
        .await?
        .ok_or_else(|| ApiError::not_found("channel not found"))?;
    if channel.id == user {
        return Err(ApiError::bad_request("cannot subscribe to your own channel"));
    }
    state.catalog.ensure_user(&user).await?;
    if subscribe {
        state.catalog.subscribe(&user, &channel.id).await?;
    } else {
        state.catalog.unsubscribe(&user, &channel.id).await?;
    }
    state.channels.expire(&channel_key(handle));
    Ok(SubscriptionState {
        subscribed: subscribe,
        subscriber_count: state.catalog.subscriber_count(&channel.id).await?,
    })
}

async fn subscribe(
    State(state): State<AppState>,
    headers: HeaderMap,
    AxumPath(handle): AxumPath<String>,
) -> ApiResult<Json<SubscriptionState>> {
    Ok(Json(
        change_subscription(&state, &headers, &handle, true).await?,
    ))
}

async fn unsubscribe(
    State(state): State<AppState>,
    headers: HeaderMap,
    AxumPath(handle): AxumPath<String>,
) -> ApiResult<Json<SubscriptionState>> {
    Ok(Json(
        change_subscription(&state, &headers, &handle, false).await?,
    ))
}

async fn list_categories(State(state): State<AppState>) -> ApiResult<Json<Vec<CategoryRecord>>> {
    Ok(Json(state.catalog.list_categories().await?))
}

async fn search_suggestions(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<SearchQuery>,
) -> ApiResult<Json<Vec<String>>> {
    let suggestions = state.catalog.search_suggestions(&query.q).await?;
    if let Some(user) = caller(&headers)
        && !query.q.trim().is_empty()
    {
        state.catalog.ensure_user(&user).await?;
        state.catalog.record_search(&user, &query.q).await?;
        state.recent_searches.expire(&user);
    }
    Ok(Json(suggestions))
}

async fn recent_searches(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> ApiResult<Json<Vec<String>>> {
    let user = require_caller(&headers)?;
    if let Some(recent) = state.recent_searches.get(&user) {
        return Ok(Json(recent));
    }
    let recent = state.catalog.recent_searches(&user).await?;
    state.recent_searches.set(user, recent.clone());
    Ok(Json(recent))
}

async fn list_notifications(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> ApiResult<Json<Vec<NotificationView>>> {
    let user = require_caller(&headers)?;
    let records = state.catalog.list_notifications(&user).await?;
    let users = state
        .load_users(records.iter().filter_map(|record| record.actor_id.as_deref()).collect::<Vec<_>>())
        .await?;
    let mut titles = HashMap::new();
    for video_id in records.iter().filter_map(|record| record.video_id.as_deref()) {
        if titles.contains_key(video_id) {
            continue;
        }
        if let Some(video) = state.catalog.get_video(video_id).await? {
            titles.insert(video.id, video.title);
        }
    }
    Ok(Json(
        records
            .into_iter()
            .map(|record| NotificationView::assemble(record, &users, &titles))
            .collect(),
    ))
}

async fn mark_read(
    State(state): State<AppState>,
    headers: HeaderMap,
    AxumPath(id): AxumPath<String>,
) -> ApiResult<StatusCode> {
    let user = require_caller(&headers)?;
    if state.catalog.mark_notification_read(&user, &id).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::not_found("notification not found"))
    }
}

async fn mark_all_read(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> ApiResult<Json<ReadAll>> {
    let user = require_caller(&headers)?;
    let updated = state.catalog.mark_all_notifications_read(&user).await?;
    Ok(Json(ReadAll { updated }))
}

async fn delete_notification(
    State(state): State<AppState>,
    headers: HeaderMap,
    AxumPath(id): AxumPath<String>,
) -> ApiResult<StatusCode> {
    let user = require_caller(&headers)?;
    if state.catalog.delete_notification(&user, &id).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::not_found("notification not found"))
    }
}

async fn admin_videos(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<SearchQuery>,
) -> ApiResult<Json<Vec<VideoView>>> {
    require_caller(&headers)?;
    let videos = state.catalog.admin_search(&query.q).await?;
    Ok(Json(state.video_views(videos).await?))
}

/// Completion callback from the streaming provider. Playable statuses move
/// the video to `ready`, failures to `failed`; everything else is noted and
/// acknowledged.
async fn stream_webhook(
    State(state): State<AppState>,
    payload: Result<Json<WebhookEvent>, JsonRejection>,
) -> ApiResult<Json<WebhookAck>> {
    let event = json_body(payload)?;
    if let Some(expected) = state.library_id.as_deref()
        && expected != event.video_library_id.to_string()
    {
        warn!(library = event.video_library_id, "webhook for another library");
        return Err(ApiError::forbidden("webhook is for another library"));
    }

    let remote = event.video_id();
    let remote_status = event
        .remote_status()
        .ok_or_else(|| ApiError::bad_request(format!("unknown status code {}", event.status)))?;
    let status = if remote_status.is_ready() {
        VideoStatus::Ready
    } else if remote_status.is_failed() {
        VideoStatus::Failed
    } else {
        info!(remote = %remote, status = ?remote_status, "webhook acknowledged");
        return Ok(Json(WebhookAck {
            video_id: None,
            status: None,
        }));
    };

    let video = state
        .catalog
        .set_status_by_remote_id(remote.as_str(), status)
        .await?
        .ok_or_else(|| ApiError::not_found("no video for this provider id"))?;
    info!(remote = %remote, video = %video.id, %status, "webhook applied");
    state.forget_channel_of(&video.owner_id).await?;
    Ok(Json(WebhookAck {
        video_id: Some(video.id),
        status: Some(video.status),
    }))
}

async fn static_fallback(State(state): State<AppState>, req: Request<Body>) -> Response {
    let path = req.uri().path();
    if path == "/api" || path.starts_with("/api/") {
        return ApiError::not_found("endpoint not found").into_response();
    }

    match serve_www_path(&state.www_root, path).await {
        Ok(response) => response,
        Err(err) => err.into_response(),
    }
}

async fn serve_www_path(root: &Path, request_path: &str) -> ApiResult<Response> {
    let target = resolve_www_path(root, request_path)?;
    match tokio::fs::metadata(&target).await {
        Ok(meta) if meta.is_dir() => stream_file(root.join("index.html")).await,
        Ok(_) => stream_file(target).await,
        Err(_) if should_fallback_to_index(request_path) => {
            stream_file(root.join("index.html")).await
        }
        Err(_) => Err(ApiError::not_found("file not found")),
    }
}

fn resolve_www_path(root: &Path, request_path: &str) -> ApiResult<PathBuf> {
    let trimmed = request_path.trim_start_matches('/');
    if trimmed.is_empty() {
        return Ok(root.join("index.html"));
    }
    let candidate = Path::new(trimmed);
    if candidate
        .components()
        .any(|component| !matches!(component, Component::Normal(_)))
    {
        return Err(ApiError::not_found("file not found"));
    }
    Ok(root.join(candidate))
}

/// Client-side routes have no extension; missing assets do.
fn should_fallback_to_index(request_path: &str) -> bool {
    let trimmed = request_path.trim_start_matches('/');
    trimmed.is_empty() || Path::new(trimmed).extension().is_none()
}

async fn stream_file(path: PathBuf) -> ApiResult<Response> {
    let file = File::open(&path)
        .await
        .map_err(|_| ApiError::not_found("file not found"))?;
    let mut response = Body::from_stream(ReaderStream::new(file)).into_response();
    if let Some(mime) = MimeGuess::from_path(&path).first()
        && let Ok(value) = mime.to_string().parse()
    {
        response.headers_mut().insert(header::CONTENT_TYPE, value);
    }
    Ok(response)
}
