//! Resumable chunked uploads over the tus 1.0 protocol.

use std::{collections::HashMap, future::Future, io::SeekFrom, sync::Arc, time::Duration};

use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    error::{ProviderError, UploadError},
    provider::{UploadCredential, map_ureq_error, run_blocking},
    session::SelectedFile,
};

pub const DEFAULT_CHUNK_SIZE: usize = 5 * 1024 * 1024;
/// Waits before each retry of a failed request; the first attempt is immediate.
pub const DEFAULT_RETRY_DELAYS: [Duration; 5] = [
    Duration::from_secs(0),
    Duration::from_secs(3),
    Duration::from_secs(5),
    Duration::from_secs(10),
    Duration::from_secs(20),
];

const TUS_VERSION: &str = "1.0.0";

/// `Upload-Metadata` header: comma separated `key base64(value)` pairs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UploadMetadata(Vec<(String, String)>);

impl UploadMetadata {
    pub fn for_file(file: &SelectedFile, title: &str) -> Self {
        let mut metadata = Self::default();
        metadata.push("filename", &file.name);
        metadata.push("filetype", &file.mime);
        if !title.trim().is_empty() {
            metadata.push("title", title.trim());
        }
        metadata
    }

    pub fn push(&mut self, key: &str, value: &str) {
        self.0.push((key.to_string(), value.to_string()));
    }

    pub fn to_header(&self) -> String {
        self.0
            .iter()
            .map(|(key, value)| format!("{key} {}", BASE64.encode(value)))
            .collect::<Vec<_>>()
            .join(",")
    }
}

/// One tus endpoint. Implementations only speak the protocol; retries,
/// resumption and cancellation live in [`ResumableUpload`].
#[async_trait]
pub trait ChunkTransport: Send + Sync {
    /// Creates an upload and returns its URL.
    async fn create(
        &self,
        credential: &UploadCredential,
        length: u64,
        metadata: &UploadMetadata,
    ) -> Result<String, ProviderError>;

    /// Current offset the server holds for `upload_url`.
    async fn offset(
        &self,
        credential: &UploadCredential,
        upload_url: &str,
    ) -> Result<u64, ProviderError>;

    /// Sends `chunk` at `offset` and returns the server's new offset.
    async fn patch(
        &self,
        credential: &UploadCredential,
        upload_url: &str,
        offset: u64,
        chunk: &[u8],
    ) -> Result<u64, ProviderError>;
}

#[derive(Clone)]
pub struct TusTransport {
    agent: ureq::Agent,
}

impl Default for TusTransport {
    fn default() -> Self {
        Self {
            agent: ureq::AgentBuilder::new()
                .timeout_connect(Duration::from_secs(10))
                .timeout_read(Duration::from_secs(120))
                .timeout_write(Duration::from_secs(120))
                .build(),
        }
    }
}

fn signed(request: ureq::Request, credential: &UploadCredential) -> ureq::Request {
    credential
        .headers()
        .iter()
        .fold(request.set("Tus-Resumable", TUS_VERSION), |request, (name, value)| {
            request.set(name, value)
        })
}

fn header_offset(operation: &'static str, response: &ureq::Response) -> Result<u64, ProviderError> {
    response
        .header("Upload-Offset")
        .and_then(|value| value.trim().parse().ok())
        .ok_or_else(|| ProviderError::Decode {
            operation,
            message: "missing Upload-Offset header".into(),
        })
}

/// Resolves a `Location` header that may be relative to the endpoint.
fn resolve_location(endpoint: &str, location: &str) -> String {
    if location.starts_with("http://") || location.starts_with("https://") {
        return location.to_string();
    }
    let origin_end = endpoint
        .find("://")
        .map(|scheme| {
            endpoint[scheme + 3..]
                .find('/')
                .map_or(endpoint.len(), |path| scheme + 3 + path)
        })
        .unwrap_or(endpoint.len());
    if location.starts_with('/') {
        format!("{}{location}", &endpoint[..origin_end])
    } else {
        format!("{}/{location}", endpoint.trim_end_matches('/'))
    }
}

#[async_trait]
impl ChunkTransport for TusTransport {
    async fn create(
        &self,
        credential: &UploadCredential,
        length: u64,
        metadata: &UploadMetadata,
    ) -> Result<String, ProviderError> {
        const OP: &str = "create upload";
        let agent = self.agent.clone();
        let credential = credential.clone();
        let metadata = metadata.to_header();
        run_blocking(OP, move || {
            let response = signed(agent.post(&credential.endpoint), &credential)
                .set("Upload-Length", &length.to_string())
                .set("Upload-Metadata", &metadata)
                .call()
                .map_err(|err| map_ureq_error(OP, err))?;
            let location = response.header("Location").ok_or(ProviderError::Decode {
                operation: OP,
                message: "missing Location header".into(),
            })?;
            Ok(resolve_location(&credential.endpoint, location))
        })
        .await
    }

    async fn offset(
        &self,
        credential: &UploadCredential,
        upload_url: &str,
    ) -> Result<u64, ProviderError> {
        const OP: &str = "query upload offset";
        let agent = self.agent.clone();
        let credential = credential.clone();
        let url = upload_url.to_string();
        run_blocking(OP, move || {
            let response = signed(agent.head(&url), &credential)
                .call()
                .map_err(|err| map_ureq_error(OP, err))?;
            header_offset(OP, &response)
        })
        .await
    }

    async fn patch(
        &self,
        credential: &UploadCredential,
        upload_url: &str,
        offset: u64,
        chunk: &[u8],
    ) -> Result<u64, ProviderError> {
        const OP: &str = "upload chunk";
        let agent = self.agent.clone();
        let credential = credential.clone();
        let url = upload_url.to_string();
        let chunk = chunk.to_vec();
        run_blocking(OP, move || {
            let response = signed(agent.request("PATCH", &url), &credential)
                .set("Upload-Offset", &offset.to_string())
                .set("Content-Type", "application/offset+octet-stream")
                .send_bytes(&chunk)
                .map_err(|err| map_ureq_error(OP, err))?;
            header_offset(OP, &response)
        })
        .await
    }
}

/// Upload URLs of interrupted transfers, keyed by [`fingerprint`].
#[derive(Debug, Clone, Default)]
pub struct PreviousUploads {
    inner: Arc<Mutex<HashMap<String, String>>>,
}

impl PreviousUploads {
    pub fn get(&self, fingerprint: &str) -> Option<String> {
        self.inner.lock().get(fingerprint).cloned()
    }

    pub fn remember(&self, fingerprint: &str, upload_url: &str) {
        self.inner
            .lock()
            .insert(fingerprint.to_string(), upload_url.to_string());
    }

    pub fn forget(&self, fingerprint: &str) {
        self.inner.lock().remove(fingerprint);
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Identifies "the same file to the same remote video".
pub fn fingerprint(credential: &UploadCredential, file: &SelectedFile) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(credential.video_id.as_str().as_bytes());
    hasher.update(&[0]);
    hasher.update(file.name.as_bytes());
    hasher.update(&[0]);
    hasher.update(&file.size.to_le_bytes());
    let modified = file
        .modified
        .and_then(|time| time.duration_since(std::time::UNIX_EPOCH).ok())
        .map_or(0, |elapsed| elapsed.as_nanos());
    hasher.update(&modified.to_le_bytes());
    hasher.finalize().to_hex().to_string()
}

#[derive(Debug, Clone)]
pub struct TransferOptions {
    pub chunk_size: usize,
    pub retry_delays: Vec<Duration>,
}

impl Default for TransferOptions {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            retry_delays: DEFAULT_RETRY_DELAYS.to_vec(),
        }
    }
}

pub struct ResumableUpload {
    transport: Arc<dyn ChunkTransport>,
    previous: PreviousUploads,
    options: TransferOptions,
}

impl ResumableUpload {
    pub fn new(
        transport: Arc<dyn ChunkTransport>,
        previous: PreviousUploads,
        options: TransferOptions,
    ) -> Self {
        Self {
            transport,
            previous,
            options,
        }
    }

    /// Sends `file`, resuming an earlier upload of the same file to the same
    /// remote video when the server still has it. `on_progress` receives
    /// `(bytes_sent, bytes_total)` after every acknowledged chunk.
    pub async fn run<F>(
        &self,
        credential: &UploadCredential,
        file: &SelectedFile,
        metadata: &UploadMetadata,
        cancel: &CancellationToken,
        mut on_progress: F,
    ) -> Result<(), UploadError>
    where
        F: FnMut(u64, u64) + Send,
    {
        let key = fingerprint(credential, file);
        let total = file.size;
        let transport = self.transport.as_ref();

        let mut resumed = None;
        if let Some(url) = self.previous.get(&key) {
            let known = url.as_str();
            let lookup = self
                .with_retry("query upload offset", cancel, move || {
                    transport.offset(credential, known)
                })
                .await;
            match lookup {
                Ok(offset) => resumed = Some((url, offset)),
                Err(UploadError::Provider(err)) if err.is_gone() => {
                    info!(video = %credential.video_id, "previous upload expired; starting over");
                    self.previous.forget(&key);
                }
                Err(err) => return Err(err),
            }
        }

        let (url, mut offset) = match resumed {
            Some((url, offset)) => {
                info!(video = %credential.video_id, offset, "resuming upload");
                (url, offset)
            }
            None => {
                let url = self
                    .with_retry("create upload", cancel, move || {
                        transport.create(credential, total, metadata)
                    })
                    .await?;
                self.previous.remember(&key, &url);
                debug!(%url, "created upload");
                (url, 0)
            }
        };
        on_progress(offset.min(total), total);

        let mut source = tokio::fs::File::open(&file.path)
            .await
            .map_err(|err| UploadError::Source(err.to_string()))?;
        let mut chunk = Vec::with_capacity(self.options.chunk_size.min(total as usize));

        while offset < total {
            if cancel.is_cancelled() {
                return Err(UploadError::Cancelled);
            }
            source
                .seek(SeekFrom::Start(offset))
                .await
                .map_err(|err| UploadError::Source(err.to_string()))?;
            chunk.clear();
            let wanted = (total - offset).min(self.options.chunk_size as u64);
            (&mut source)
                .take(wanted)
                .read_to_end(&mut chunk)
                .await
                .map_err(|err| UploadError::Source(err.to_string()))?;
            if chunk.is_empty() {
                return Err(UploadError::Source(format!(
                    "{} ended at byte {offset} of {total}",
                    file.name
                )));
            }

            let bytes = chunk.as_slice();
            let url = url.as_str();
            let at = offset;
            let next = self
                .with_retry("upload chunk", cancel, move || {
                    transport.patch(credential, url, at, bytes)
                })
                .await?;
            if next <= offset {
                return Err(ProviderError::Decode {
                    operation: "upload chunk",
                    message: format!("server offset {next} did not advance past {offset}"),
                }
                .into());
            }
            offset = next.min(total);
            on_progress(offset, total);
        }

        self.previous.forget(&key);
        info!(video = %credential.video_id, bytes = total, "upload finished");
        Ok(())
    }

    async fn with_retry<T, F, Fut>(
        &self,
        operation: &'static str,
        cancel: &CancellationToken,
        mut call: F,
    ) -> Result<T, UploadError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        let mut delays = self.options.retry_delays.iter();
        loop {
            let result = tokio::select! {
                _ = cancel.cancelled() => return Err(UploadError::Cancelled),
                result = call() => result,
            };
            let err = match result {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };
            let delay = match delays.next() {
                Some(delay) if err.is_transient() => *delay,
                _ => return Err(err.into()),
            };
            warn!(operation, error = %err, retry_in = ?delay, "transient upload failure");
            tokio::select! {
                _ = cancel.cancelled() => return Err(UploadError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}
