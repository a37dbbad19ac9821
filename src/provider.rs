//! Client for the external video streaming provider.
//!
//! The provider owns storage, transcoding and delivery. We only ask it to
//! create a video slot, hand out signed upload credentials, accept a
//! thumbnail and report processing status.

use std::{fmt, time::Duration};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info};

use crate::{
    config::ProviderSettings, error::ProviderError, security::upload_signature,
    thumbnails::ImageData,
};

const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Identifier the provider assigns when a video is created. Doubles as the
/// idempotency key for every later call about the same upload.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RemoteVideoId(String);

impl RemoteVideoId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RemoteVideoId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Processing states reported by the provider (numeric codes on the wire).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoteStatus {
    Created,
    Uploaded,
    Processing,
    Transcoding,
    Finished,
    Error,
    UploadFailed,
}

impl RemoteStatus {
    pub fn from_code(code: i64) -> Option<Self> {
        Some(match code {
            0 => Self::Created,
            1 => Self::Uploaded,
            2 => Self::Processing,
            3 => Self::Transcoding,
            4 => Self::Finished,
            5 => Self::Error,
            6 => Self::UploadFailed,
            _ => return None,
        })
    }

    /// Playable: the first rendition exists once transcoding starts.
    pub fn is_ready(self) -> bool {
        matches!(self, Self::Transcoding | Self::Finished)
    }

    pub fn is_failed(self) -> bool {
        matches!(self, Self::Error | Self::UploadFailed)
    }
}

/// Short-lived authorization for the resumable upload endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadCredential {
    pub video_id: RemoteVideoId,
    pub library_id: String,
    pub signature: String,
    /// Unix seconds.
    pub expires: i64,
    pub endpoint: String,
}

impl UploadCredential {
    pub fn headers(&self) -> [(&'static str, String); 4] {
        [
            ("AuthorizationSignature", self.signature.clone()),
            ("AuthorizationExpire", self.expires.to_string()),
            ("VideoId", self.video_id.to_string()),
            ("LibraryId", self.library_id.clone()),
        ]
    }
}

#[async_trait]
pub trait StreamingProvider: Send + Sync {
    async fn create_video(&self, title: &str) -> Result<RemoteVideoId, ProviderError>;

    async fn upload_credential(
        &self,
        id: &RemoteVideoId,
        ttl: Duration,
    ) -> Result<UploadCredential, ProviderError>;

    async fn upload_thumbnail(
        &self,
        id: &RemoteVideoId,
        image: &ImageData,
    ) -> Result<(), ProviderError>;

    async fn video_status(&self, id: &RemoteVideoId) -> Result<RemoteStatus, ProviderError>;
}

/// Completion callback body posted by the provider.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct WebhookEvent {
    pub video_library_id: i64,
    pub video_guid: String,
    pub status: i64,
}

impl WebhookEvent {
    pub fn video_id(&self) -> RemoteVideoId {
        RemoteVideoId::new(self.video_guid.clone())
    }

    pub fn remote_status(&self) -> Option<RemoteStatus> {
        RemoteStatus::from_code(self.status)
    }
}

#[derive(Deserialize)]
struct CreatedVideo {
    guid: String,
}

#[derive(Deserialize)]
struct VideoState {
    status: i64,
}

/// HTTP implementation. `ureq` is blocking, so every call hops onto the
/// blocking pool.
#[derive(Clone)]
pub struct HttpStreamProvider {
    agent: ureq::Agent,
    library_id: String,
    api_key: String,
    api_base: String,
    upload_endpoint: String,
}

impl HttpStreamProvider {
    pub fn new(settings: &ProviderSettings) -> anyhow::Result<Self> {
        let (library_id, api_key) = settings.credentials()?;
        Ok(Self {
            agent: ureq::AgentBuilder::new().timeout(HTTP_TIMEOUT).build(),
            library_id: library_id.to_string(),
            api_key: api_key.to_string(),
            api_base: settings.api_base.trim_end_matches('/').to_string(),
            upload_endpoint: settings.upload_endpoint.clone(),
        })
    }

    fn video_url(&self, id: &RemoteVideoId) -> String {
        format!(
            "{}/library/{}/videos/{}",
            self.api_base, self.library_id, id
        )
    }

    /// Signs locally; the api key never leaves this process.
    pub fn sign_upload(&self, id: &RemoteVideoId, expires: i64) -> UploadCredential {
        UploadCredential {
            video_id: id.clone(),
            library_id: self.library_id.clone(),
            signature: upload_signature(&self.library_id, &self.api_key, expires, id.as_str()),
            expires,
            endpoint: self.upload_endpoint.clone(),
        }
    }
}

pub(crate) async fn run_blocking<T, F>(operation: &'static str, job: F) -> Result<T, ProviderError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, ProviderError> + Send + 'static,
{
    tokio::task::spawn_blocking(job)
        .await
        .map_err(|err| ProviderError::Transport {
            operation,
            message: err.to_string(),
        })?
}

pub(crate) fn map_ureq_error(operation: &'static str, err: ureq::Error) -> ProviderError {
    match err {
        ureq::Error::Status(status, response) => ProviderError::Status {
            operation,
            status,
            body: response.into_string().unwrap_or_default(),
        },
        ureq::Error::Transport(transport) => ProviderError::Transport {
            operation,
            message: transport.to_string(),
        },
    }
}

fn decode_error(operation: &'static str, err: impl fmt::Display) -> ProviderError {
    ProviderError::Decode {
        operation,
        message: err.to_string(),
    }
}

#[async_trait]
impl StreamingProvider for HttpStreamProvider {
    async fn create_video(&self, title: &str) -> Result<RemoteVideoId, ProviderError> {
        const OP: &str = "create video";
        let url = format!("{}/library/{}/videos", self.api_base, self.library_id);
        let agent = self.agent.clone();
        let api_key = self.api_key.clone();
        let body = json!({ "title": title });
        let created: CreatedVideo = run_blocking(OP, move || {
            agent
                .post(&url)
                .set("AccessKey", &api_key)
                .set("Accept", "application/json")
                .send_json(body)
                .map_err(|err| map_ureq_error(OP, err))?
                .into_json()
                .map_err(|err| decode_error(OP, err))
        })
        .await?;
        if created.guid.trim().is_empty() {
            return Err(decode_error(OP, "empty guid"));
        }
        info!(video = %created.guid, "created remote video");
        Ok(RemoteVideoId::new(created.guid))
    }

    async fn upload_credential(
        &self,
        id: &RemoteVideoId,
        ttl: Duration,
    ) -> Result<UploadCredential, ProviderError> {
        let expires = chrono::Utc::now().timestamp() + ttl.as_secs() as i64;
        debug!(video = %id, expires, "signed upload credential");
        Ok(self.sign_upload(id, expires))
    }

    async fn upload_thumbnail(
        &self,
        id: &RemoteVideoId,
        image: &ImageData,
    ) -> Result<(), ProviderError> {
        const OP: &str = "upload thumbnail";
        let url = format!("{}/thumbnail", self.video_url(id));
        let agent = self.agent.clone();
        let api_key = self.api_key.clone();
        let image = image.clone();
        run_blocking(OP, move || {
            agent
                .post(&url)
                .set("AccessKey", &api_key)
                .set("Content-Type", &image.mime)
                .send_bytes(&image.bytes)
                .map_err(|err| map_ureq_error(OP, err))?;
            Ok(())
        })
        .await?;
        info!(video = %id, "uploaded custom thumbnail");
        Ok(())
    }

    async fn video_status(&self, id: &RemoteVideoId) -> Result<RemoteStatus, ProviderError> {
        const OP: &str = "video status";
        let url = self.video_url(id);
        let agent = self.agent.clone();
        let api_key = self.api_key.clone();
        let state: VideoState = run_blocking(OP, move || {
            agent
                .get(&url)
                .set("AccessKey", &api_key)
                .set("Accept", "application/json")
                .call()
                .map_err(|err| map_ureq_error(OP, err))?
                .into_json()
                .map_err(|err| decode_error(OP, err))
        })
        .await?;
        RemoteStatus::from_code(state.status)
            .ok_or_else(|| decode_error(OP, format!("unknown status code {}", state.status)))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// In-memory provider that records every call.
    #[derive(Default)]
    pub(crate) struct FakeProvider {
        pub created: AtomicUsize,
        pub credentials: AtomicUsize,
        pub thumbnails: Mutex<Vec<(RemoteVideoId, ImageData)>>,
        pub status_calls: AtomicUsize,
        /// Popped per status call; once empty the last answer repeats.
        pub statuses: Mutex<VecDeque<RemoteStatus>>,
        pub fail_create: Mutex<Option<ProviderError>>,
    }

    impl FakeProvider {
        pub(crate) fn with_statuses(statuses: &[RemoteStatus]) -> Self {
            Self {
                statuses: Mutex::new(statuses.iter().copied().collect()),
                ..Self::default()
            }
        }
    }

    #[async_trait]
    impl StreamingProvider for FakeProvider {
        async fn create_video(&self, _title: &str) -> Result<RemoteVideoId, ProviderError> {
            if let Some(err) = self.fail_create.lock().take() {
                return Err(err);
            }
            let index = self.created.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(RemoteVideoId::new(format!("remote-{index}")))
        }

        async fn upload_credential(
            &self,
            id: &RemoteVideoId,
            ttl: Duration,
        ) -> Result<UploadCredential, ProviderError> {
            self.credentials.fetch_add(1, Ordering::SeqCst);
            Ok(UploadCredential {
                video_id: id.clone(),
                library_id: "lib".into(),
                signature: "sig".into(),
                expires: ttl.as_secs() as i64,
                endpoint: "https://upload.test/tus".into(),
            })
        }

        async fn upload_thumbnail(
            &self,
            id: &RemoteVideoId,
            image: &ImageData,
        ) -> Result<(), ProviderError> {
            self.thumbnails.lock().push((id.clone(), image.clone()));
            Ok(())
        }

        async fn video_status(&self, _id: &RemoteVideoId) -> Result<RemoteStatus, ProviderError> {
            self.status_calls.fetch_add(1, Ordering::SeqCst);
            let mut statuses = self.statuses.lock();
            let status = if statuses.len() > 1 {
                statuses.pop_front()
            } else {
                statuses.front().copied()
            };
            Ok(status.unwrap_or(RemoteStatus::Processing))
        }
    }

    #[test]
    fn status_codes_map_to_states() {
        assert_eq!(RemoteStatus::from_code(0), Some(RemoteStatus::Created));
        assert_eq!(RemoteStatus::from_code(4), Some(RemoteStatus::Finished));
        assert_eq!(RemoteStatus::from_code(9), None);
        assert!(RemoteStatus::Transcoding.is_ready());
        assert!(RemoteStatus::Finished.is_ready());
        assert!(!RemoteStatus::Processing.is_ready());
        assert!(RemoteStatus::UploadFailed.is_failed());
    }

    #[test]
    fn webhook_payload_parses() {
        let event: WebhookEvent = serde_json::from_str(
            r#"{"VideoLibraryId": 133, "VideoGuid": "abc-123", "Status": 3}"#,
        )
        .unwrap();
        assert_eq!(event.video_id().as_str(), "abc-123");
        assert_eq!(event.remote_status(), Some(RemoteStatus::Transcoding));
    }

    #[test]
    fn signed_credentials_carry_expiry_and_signature() {
        let provider = HttpStreamProvider::new(&ProviderSettings {
            library_id: Some("77".into()),
            api_key: Some("key".into()),
            ..ProviderSettings::default()
        })
        .unwrap();
        let id = RemoteVideoId::new("vid");
        let credential = provider.sign_upload(&id, 1_000);
        assert_eq!(credential.signature, upload_signature("77", "key", 1_000, "vid"));
        let headers = credential.headers();
        assert_eq!(headers[1], ("AuthorizationExpire", "1000".to_string()));
        assert_eq!(headers[3], ("LibraryId", "77".to_string()));
    }

    #[test]
    fn provider_requires_credentials() {
        assert!(HttpStreamProvider::new(&ProviderSettings::default()).is_err());
    }

    #[tokio::test]
    async fn credential_expiry_is_in_the_future() {
        let provider = HttpStreamProvider::new(&ProviderSettings {
            library_id: Some("1".into()),
            api_key: Some("k".into()),
            ..ProviderSettings::default()
        })
        .unwrap();
        let now = chrono::Utc::now().timestamp();
        let credential = provider
            .upload_credential(&RemoteVideoId::new("v"), Duration::from_secs(3600))
            .await
            .unwrap();
        assert!(credential.expires >= now + 3600);
    }
}
