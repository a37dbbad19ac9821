//! Upload workflow controller.
//!
//! Owns one [`UploadSession`] and moves it through select, upload, details,
//! processing and complete. Every mutation goes through [`Shared::update`],
//! which also publishes the current step to observers.

use std::{sync::Arc, time::Duration};

use parking_lot::Mutex;
use tokio::{sync::watch, task::JoinHandle, time::Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    catalog::{VideoCatalog, VideoDetails, Visibility},
    config::DEFAULT_MAX_UPLOAD_BYTES,
    error::{UploadError, WorkflowError},
    polling::{CompletionSource, ProcessingTimings, confirm_processing},
    progress::{ProgressMeter, UploadProgress},
    provider::{RemoteVideoId, StreamingProvider},
    session::{SelectedFile, Step, ThumbnailChoice, UploadSession},
    thumbnails::{DEFAULT_THUMBNAIL_COUNT, FrameExtractor, generate_thumbnails},
    transfer::{ChunkTransport, PreviousUploads, ResumableUpload, TransferOptions, UploadMetadata},
};

pub const DEFAULT_CREDENTIAL_TTL: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Clone)]
pub struct UploadConfig {
    /// Catalog user the video belongs to.
    pub owner_id: String,
    pub max_file_bytes: u64,
    pub thumbnail_count: usize,
    pub credential_ttl: Duration,
    pub visibility: Visibility,
    pub transfer: TransferOptions,
    pub processing: ProcessingTimings,
}

impl UploadConfig {
    pub fn new(owner_id: impl Into<String>) -> Self {
        Self {
            owner_id: owner_id.into(),
            max_file_bytes: DEFAULT_MAX_UPLOAD_BYTES,
            thumbnail_count: DEFAULT_THUMBNAIL_COUNT,
            credential_ttl: DEFAULT_CREDENTIAL_TTL,
            visibility: Visibility::Public,
            transfer: TransferOptions::default(),
            processing: ProcessingTimings::default(),
        }
    }
}

/// External collaborators of the flow.
#[derive(Clone)]
pub struct UploadServices {
    pub provider: Arc<dyn StreamingProvider>,
    pub transport: Arc<dyn ChunkTransport>,
    pub extractor: Arc<dyn FrameExtractor>,
    pub catalog: Arc<dyn VideoCatalog>,
}

struct Shared {
    config: UploadConfig,
    services: UploadServices,
    previous_uploads: PreviousUploads,
    session: Mutex<UploadSession>,
    steps: watch::Sender<Step>,
    /// Bumped after every session change; waiters re-check their condition.
    revision: watch::Sender<u64>,
    processing: Mutex<Option<JoinHandle<CompletionSource>>>,
    completed: Mutex<Option<CompletionSource>>,
}

impl Shared {
    /// Applies `change` under the session lock, then notifies observers with
    /// the lock released.
    fn update<R>(&self, change: impl FnOnce(&mut UploadSession) -> R) -> R {
        let (result, step) = {
            let mut session = self.session.lock();
            let result = change(&mut session);
            (result, session.step)
        };
        self.steps.send_if_modified(|current| {
            if *current == step {
                return false;
            }
            info!(from = %current, to = %step, "upload step changed");
            *current = step;
            true
        });
        self.revision.send_modify(|revision| *revision += 1);
        result
    }

    /// Sends a pending custom thumbnail once a remote video exists.
    async fn flush_thumbnail(&self) -> Result<(), WorkflowError> {
        let (id, image) = {
            let session = self.session.lock();
            match (&session.remote_video_id, &session.chosen_thumbnail) {
                (Some(id), Some(ThumbnailChoice::Custom(image))) if session.thumbnail_pending => {
                    (id.clone(), image.clone())
                }
                _ => return Ok(()),
            }
        };
        self.services.provider.upload_thumbnail(&id, &image).await?;
        self.update(|session| {
            if matches!(&session.chosen_thumbnail, Some(ThumbnailChoice::Custom(current)) if *current == image)
            {
                session.thumbnail_pending = false;
            }
        });
        Ok(())
    }

    async fn confirm(self: Arc<Self>, remote: RemoteVideoId) -> CompletionSource {
        let source = confirm_processing(
            self.services.provider.clone(),
            &remote,
            self.config.processing,
        )
        .await;
        if let Err(err) = self.services.catalog.mark_ready(&remote).await {
            warn!(video = %remote, error = %format!("{err:#}"), "recording ready status failed");
        }
        *self.completed.lock() = Some(source);
        self.update(|session| session.step = Step::Complete);
        source
    }
}

/// Drives one upload session. Must be used inside a Tokio runtime.
pub struct UploadController {
    shared: Arc<Shared>,
}

impl UploadController {
    pub fn new(config: UploadConfig, services: UploadServices) -> Self {
        Self::with_previous_uploads(config, services, PreviousUploads::default())
    }

    /// Shares the resumable-upload store with other sessions of the same
    /// process so a new session can resume an interrupted transfer.
    pub fn with_previous_uploads(
        config: UploadConfig,
        services: UploadServices,
        previous_uploads: PreviousUploads,
    ) -> Self {
        let (steps, _) = watch::channel(Step::Select);
        let (revision, _) = watch::channel(0);
        Self {
            shared: Arc::new(Shared {
                config,
                services,
                previous_uploads,
                session: Mutex::new(UploadSession::default()),
                steps,
                revision,
                processing: Mutex::new(None),
                completed: Mutex::new(None),
            }),
        }
    }

    pub fn snapshot(&self) -> UploadSession {
        self.shared.session.lock().clone()
    }

    pub fn step(&self) -> Step {
        self.shared.session.lock().step
    }

    pub fn progress(&self) -> UploadProgress {
        self.shared.session.lock().upload_progress
    }

    pub fn subscribe(&self) -> watch::Receiver<Step> {
        self.shared.steps.subscribe()
    }

    pub fn config(&self) -> &UploadConfig {
        &self.shared.config
    }

    fn require_editable(&self, operation: &'static str) -> Result<(), WorkflowError> {
        let step = self.step();
        if step >= Step::Processing {
            return Err(WorkflowError::InvalidStep { operation, step });
        }
        Ok(())
    }

    /// Accepts a video file, defaults the title from its name and starts
    /// thumbnail generation in the background.
    pub fn set_file(&self, file: SelectedFile) -> Result<(), WorkflowError> {
        let step = self.step();
        if step != Step::Select {
            return Err(WorkflowError::InvalidStep {
                operation: "set_file",
                step,
            });
        }
        if let Err(err) = file.validate(self.shared.config.max_file_bytes) {
            let err = WorkflowError::from(err);
            self.shared
                .update(|session| session.last_error = Some(err.clone()));
            return Err(err);
        }

        let path = file.path.clone();
        info!(file = %file.name, size = file.size, mime = %file.mime, "file selected");
        let attempt = self.shared.update(|session| {
            session.attempt += 1;
            session.release_file();
            if session.metadata.title.trim().is_empty() {
                session.metadata.title = file.default_title();
            }
            session.selected_file = Some(file);
            session.last_error = None;
            session.attempt
        });

        let shared = self.shared.clone();
        let extractor = shared.services.extractor.clone();
        let count = shared.config.thumbnail_count;
        tokio::spawn(async move {
            let thumbnails =
                tokio::task::spawn_blocking(move || generate_thumbnails(extractor, &path, count))
                    .await
                    .unwrap_or_else(|err| {
                        warn!(error = %err, "thumbnail worker stopped");
                        Vec::new()
                    });
            debug!(count = thumbnails.len(), "thumbnails settled");
            shared.update(|session| {
                if session.attempt == attempt {
                    session.generated_thumbnails = thumbnails;
                    session.thumbnails_ready = true;
                }
            });
        });
        Ok(())
    }

    /// Resolves once thumbnail generation for the current file has settled
    /// or the file was released.
    pub async fn wait_for_thumbnails(&self) {
        let shared = &self.shared;
        let mut revisions = shared.revision.subscribe();
        let _ = revisions
            .wait_for(|_| {
                let session = shared.session.lock();
                session.thumbnails_ready || session.selected_file.is_none()
            })
            .await;
    }

    pub async fn choose_thumbnail(&self, choice: ThumbnailChoice) -> Result<(), WorkflowError> {
        self.require_editable("choose_thumbnail")?;
        let upload_now = self.shared.update(|session| {
            if let ThumbnailChoice::Generated(index) = choice {
                if index >= session.generated_thumbnails.len() {
                    return Err(WorkflowError::UnknownThumbnail(index));
                }
            }
            session.thumbnail_pending = matches!(choice, ThumbnailChoice::Custom(_));
            session.chosen_thumbnail = Some(choice);
            Ok(session.thumbnail_pending && session.remote_video_id.is_some())
        })?;
        if upload_now {
            self.shared.flush_thumbnail().await?;
        }
        Ok(())
    }

    pub fn set_title(&self, title: impl Into<String>) -> Result<(), WorkflowError> {
        self.require_editable("set_title")?;
        let title = title.into();
        self.shared.update(|session| session.metadata.title = title);
        Ok(())
    }

    pub fn set_description(&self, description: impl Into<String>) -> Result<(), WorkflowError> {
        self.require_editable("set_description")?;
        let description = description.into();
        self.shared
            .update(|session| session.metadata.description = description);
        Ok(())
    }

    pub fn set_category(&self, category_id: impl Into<String>) -> Result<(), WorkflowError> {
        self.require_editable("set_category")?;
        let category_id = category_id.into();
        self.shared
            .update(|session| session.metadata.category_id = category_id);
        Ok(())
    }

    /// `false` when the tag was blank, a duplicate or the set is full.
    pub fn add_tag(&self, tag: &str) -> Result<bool, WorkflowError> {
        self.require_editable("add_tag")?;
        Ok(self.shared.update(|session| session.metadata.tags.insert(tag)))
    }

    pub fn remove_tag(&self, tag: &str) -> Result<bool, WorkflowError> {
        self.require_editable("remove_tag")?;
        Ok(self.shared.update(|session| session.metadata.tags.remove(tag)))
    }

    /// Creates the remote video if needed and sends the file. Calls made
    /// while an upload is running, or after it finished, return immediately.
    pub async fn start_upload(&self) -> Result<(), WorkflowError> {
        let started = self.shared.update(|session| {
            if session.uploading || session.step > Step::Upload {
                return Ok(None);
            }
            if session.selected_file.is_none() {
                return Err(WorkflowError::NoFile);
            }
            let token = CancellationToken::new();
            session.uploading = true;
            session.step = Step::Upload;
            session.last_error = None;
            session.cancel = Some(token.clone());
            Ok(Some((session.attempt, token)))
        })?;
        let Some((attempt, token)) = started else {
            debug!("upload already running or finished");
            return Ok(());
        };

        let result = self.run_upload(attempt, &token).await;
        self.shared.update(|session| {
            if session.attempt != attempt {
                return;
            }
            session.uploading = false;
            session.cancel = None;
            match &result {
                Ok(()) => session.step = Step::Details,
                Err(err) if err.is_cancelled() => {}
                Err(err) => session.last_error = Some(err.clone()),
            }
        });
        if let Err(err) = &result {
            if !err.is_cancelled() {
                warn!(error = %err, "upload failed");
            }
        }
        result
    }

    async fn run_upload(&self, attempt: u64, token: &CancellationToken) -> Result<(), WorkflowError> {
        self.wait_for_thumbnails().await;
        let shared = &self.shared;
        let (file, title, existing) = {
            let session = shared.session.lock();
            // Cancelling releases the file under this lock.
            if token.is_cancelled() {
                return Err(UploadError::Cancelled.into());
            }
            let file = session.selected_file.clone().ok_or(WorkflowError::NoFile)?;
            (file, session.metadata.title.clone(), session.remote_video_id.clone())
        };

        let id = match existing {
            Some(id) => id,
            None => {
                // Never abandoned half way: the id must be kept even when the
                // operator cancels meanwhile.
                let created = shared.services.provider.create_video(&title).await?;
                shared.update(|session| {
                    session
                        .remote_video_id
                        .get_or_insert_with(|| created.clone())
                        .clone()
                })
            }
        };
        if token.is_cancelled() {
            return Err(UploadError::Cancelled.into());
        }

        if let Err(err) = shared.flush_thumbnail().await {
            warn!(video = %id, error = %err, "custom thumbnail upload failed; will retry on submit");
        }

        let credential = shared
            .services
            .provider
            .upload_credential(&id, shared.config.credential_ttl)
            .await?;
        let upload = ResumableUpload::new(
            shared.services.transport.clone(),
            shared.previous_uploads.clone(),
            shared.config.transfer.clone(),
        );
        let metadata = UploadMetadata::for_file(&file, &title);
        let mut meter = ProgressMeter::new();
        upload
            .run(&credential, &file, &metadata, token, |sent, total| {
                let progress = meter.record(Instant::now(), sent, total);
                shared.update(|session| {
                    if session.attempt == attempt && session.uploading {
                        session.upload_progress = progress;
                    }
                });
            })
            .await?;
        info!(video = %id, file = %file.name, "upload complete");
        Ok(())
    }

    /// Aborts the transfer and returns to file selection.
    pub fn cancel_upload(&self) -> Result<(), WorkflowError> {
        self.shared.update(|session| {
            if session.step > Step::Upload {
                return Err(WorkflowError::InvalidStep {
                    operation: "cancel_upload",
                    step: session.step,
                });
            }
            if let Some(token) = session.cancel.take() {
                token.cancel();
            }
            session.uploading = false;
            session.upload_progress = UploadProgress::default();
            session.step = Step::Select;
            session.last_error = None;
            session.attempt += 1;
            session.release_file();
            Ok(())
        })?;
        info!("upload cancelled");
        Ok(())
    }

    pub async fn retry_upload(&self) -> Result<(), WorkflowError> {
        self.shared.update(|session| {
            if session.step != Step::Upload {
                return Err(WorkflowError::InvalidStep {
                    operation: "retry_upload",
                    step: session.step,
                });
            }
            session.last_error = None;
            Ok(())
        })?;
        self.start_upload().await
    }

    /// Validates the details form, persists it and starts confirming that the
    /// provider finished processing.
    pub async fn validate_and_submit_details(&self) -> Result<(), WorkflowError> {
        let shared = &self.shared;
        let submission = shared.update(|session| {
            if session.step != Step::Details {
                return Err(WorkflowError::InvalidStep {
                    operation: "validate_and_submit_details",
                    step: session.step,
                });
            }
            if session.submitting {
                return Ok(None);
            }
            let thumbnail = match session.validate_details() {
                Ok(thumbnail) => thumbnail,
                Err(err) => {
                    let err = WorkflowError::from(err);
                    session.last_error = Some(err.clone());
                    return Err(err);
                }
            };
            let remote = session
                .remote_video_id
                .clone()
                .ok_or(WorkflowError::MissingRemoteVideo)?;
            session.submitting = true;
            session.last_error = None;
            let metadata = &session.metadata;
            let details = VideoDetails {
                title: metadata.title.trim().to_string(),
                description: metadata.description.clone(),
                tags: metadata.tags.to_vec(),
                category_id: metadata.category_id.trim().to_string(),
                thumbnail,
                visibility: shared.config.visibility,
            };
            Ok(Some((remote, details)))
        })?;
        let Some((remote, details)) = submission else {
            return Ok(());
        };

        let saved = match shared.flush_thumbnail().await {
            Ok(()) => shared
                .services
                .catalog
                .save_details(&shared.config.owner_id, &remote, &details)
                .await
                .map_err(|err| WorkflowError::Catalog(format!("{err:#}"))),
            Err(err) => Err(err),
        };
        let video_id = match saved {
            Ok(video_id) => video_id,
            Err(err) => {
                shared.update(|session| {
                    session.submitting = false;
                    session.last_error = Some(err.clone());
                });
                return Err(err);
            }
        };

        info!(video = %video_id, remote = %remote, "details saved");
        shared.update(|session| {
            session.submitting = false;
            session.step = Step::Processing;
        });
        let handle = tokio::spawn(shared.clone().confirm(remote));
        *shared.processing.lock() = Some(handle);
        Ok(())
    }

    /// Waits for the processing race and reports which branch settled it.
    pub async fn wait_for_completion(&self) -> Result<CompletionSource, WorkflowError> {
        let handle = self.shared.processing.lock().take();
        if let Some(handle) = handle {
            return handle
                .await
                .map_err(|err| WorkflowError::Interrupted(err.to_string()));
        }
        match *self.shared.completed.lock() {
            Some(source) => Ok(source),
            None => Err(WorkflowError::InvalidStep {
                operation: "wait_for_completion",
                step: self.step(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        catalog::Catalog,
        error::{FileError, ProviderError},
        provider::{RemoteStatus, tests::FakeProvider},
        session::ThumbnailRef,
        thumbnails::{ImageData, tests::FakeExtractor},
        transfer::{DEFAULT_RETRY_DELAYS, tests::FakeTransport},
    };
    use std::{
        io::Write,
        sync::atomic::Ordering,
    };
    use tempfile::TempDir;

    #[derive(Default)]
    struct RecordingCatalog {
        saved: Mutex<Vec<(String, RemoteVideoId, VideoDetails)>>,
        ready: Mutex<Vec<RemoteVideoId>>,
    }

    #[async_trait::async_trait]
    impl VideoCatalog for RecordingCatalog {
        async fn save_details(
            &self,
            owner_id: &str,
            remote: &RemoteVideoId,
            details: &VideoDetails,
        ) -> anyhow::Result<String> {
            self.saved
                .lock()
                .push((owner_id.to_string(), remote.clone(), details.clone()));
            Ok(format!("video-{remote}"))
        }

        async fn mark_ready(&self, remote: &RemoteVideoId) -> anyhow::Result<()> {
            self.ready.lock().push(remote.clone());
            Ok(())
        }
    }

    struct Harness {
        controller: UploadController,
        provider: Arc<FakeProvider>,
        transport: Arc<FakeTransport>,
        catalog: Arc<RecordingCatalog>,
        file: SelectedFile,
        _dir: TempDir,
    }

    fn video_file(dir: &TempDir, name: &str, len: usize) -> SelectedFile {
        let path = dir.path().join(name);
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(&vec![7u8; len]).unwrap();
        SelectedFile::from_path(&path).unwrap()
    }

    fn config(processing: ProcessingTimings) -> UploadConfig {
        UploadConfig {
            transfer: TransferOptions {
                chunk_size: 256,
                retry_delays: DEFAULT_RETRY_DELAYS.to_vec(),
            },
            processing,
            ..UploadConfig::new("owner")
        }
    }

    fn harness(provider: FakeProvider, processing: ProcessingTimings) -> Harness {
        harness_with_extractor(
            provider,
            processing,
            FakeExtractor::new(Duration::from_secs(60)),
        )
    }

    fn harness_with_extractor(
        provider: FakeProvider,
        processing: ProcessingTimings,
        extractor: FakeExtractor,
    ) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let file = video_file(&dir, "demo.mp4", 1_000);
        let provider = Arc::new(provider);
        let transport = Arc::new(FakeTransport::default());
        let catalog = Arc::new(RecordingCatalog::default());
        let controller = UploadController::new(
            config(processing),
            UploadServices {
                provider: provider.clone(),
                transport: transport.clone(),
                extractor: Arc::new(extractor),
                catalog: catalog.clone(),
            },
        );
        Harness {
            controller,
            provider,
            transport,
            catalog,
            file,
            _dir: dir,
        }
    }

    fn default_harness() -> Harness {
        harness(
            FakeProvider::with_statuses(&[RemoteStatus::Processing]),
            ProcessingTimings::default(),
        )
    }

    /// Selects the file, uploads it and fills in a valid form.
    async fn reach_details(h: &Harness) {
        h.controller.set_file(h.file.clone()).unwrap();
        h.controller.wait_for_thumbnails().await;
        h.controller
            .choose_thumbnail(ThumbnailChoice::Generated(1))
            .await
            .unwrap();
        h.controller.start_upload().await.unwrap();
        h.controller.set_category("education").unwrap();
        assert_eq!(h.controller.step(), Step::Details);
    }

    #[tokio::test]
    async fn rejects_files_that_are_not_video() {
        let h = default_harness();
        let err = h
            .controller
            .set_file(SelectedFile::new("/tmp/notes.txt", 10, "text/plain"))
            .unwrap_err();
        assert!(matches!(err, WorkflowError::File(FileError::UnsupportedType { .. })));
        let session = h.controller.snapshot();
        assert_eq!(session.step(), Step::Select);
        assert!(session.selected_file().is_none());
        assert!(session.last_error().is_some());
    }

    #[tokio::test]
    async fn rejects_files_over_the_size_limit() {
        let h = default_harness();
        let err = h
            .controller
            .set_file(SelectedFile::new(
                "/tmp/huge.mp4",
                DEFAULT_MAX_UPLOAD_BYTES + 1,
                "video/mp4",
            ))
            .unwrap_err();
        assert!(matches!(err, WorkflowError::File(FileError::TooLarge { .. })));
        assert_eq!(h.controller.step(), Step::Select);
    }

    #[tokio::test]
    async fn selecting_a_file_defaults_the_title_and_generates_thumbnails() {
        let h = default_harness();
        h.controller.set_file(h.file.clone()).unwrap();
        h.controller.wait_for_thumbnails().await;
        let session = h.controller.snapshot();
        assert_eq!(session.metadata().title, "demo");
        assert_eq!(session.generated_thumbnails().len(), 3);
        assert!(session.is_ready_to_upload());
    }

    #[tokio::test]
    async fn existing_title_is_not_overwritten() {
        let h = default_harness();
        h.controller.set_title("My talk").unwrap();
        h.controller.set_file(h.file.clone()).unwrap();
        assert_eq!(h.controller.snapshot().metadata().title, "My talk");
    }

    #[tokio::test]
    async fn unknown_generated_thumbnail_is_rejected() {
        let h = default_harness();
        h.controller.set_file(h.file.clone()).unwrap();
        h.controller.wait_for_thumbnails().await;
        let err = h
            .controller
            .choose_thumbnail(ThumbnailChoice::Generated(7))
            .await
            .unwrap_err();
        assert_eq!(err, WorkflowError::UnknownThumbnail(7));
    }

    #[tokio::test]
    async fn concurrent_start_calls_run_one_upload() {
        let h = default_harness();
        h.controller.set_file(h.file.clone()).unwrap();
        let (first, second) = tokio::join!(h.controller.start_upload(), h.controller.start_upload());
        first.unwrap();
        second.unwrap();
        h.controller.start_upload().await.unwrap();

        assert_eq!(h.provider.created.load(Ordering::SeqCst), 1);
        assert_eq!(h.provider.credentials.load(Ordering::SeqCst), 1);
        assert_eq!(*h.transport.creates.lock(), 1);
        assert_eq!(h.controller.step(), Step::Details);
        let progress = h.controller.progress();
        assert_eq!(progress.bytes_sent, 1_000);
        assert!(progress.is_finished());
    }

    #[tokio::test]
    async fn submission_uses_the_remote_id_from_the_upload() {
        let h = default_harness();
        reach_details(&h).await;
        let remote = h.controller.snapshot().remote_video_id().cloned().unwrap();
        assert!(!remote.as_str().is_empty());

        h.controller.add_tag("intro").unwrap();
        h.controller.validate_and_submit_details().await.unwrap();
        assert_eq!(h.controller.step(), Step::Processing);

        let saved = h.catalog.saved.lock();
        assert_eq!(saved.len(), 1);
        let (owner, saved_remote, details) = &saved[0];
        assert_eq!(owner, "owner");
        assert_eq!(saved_remote, &remote);
        assert_eq!(details.title, "demo");
        assert_eq!(details.thumbnail, ThumbnailRef::Frame { offset_ms: 30_000 });
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_during_upload_resets_to_select() {
        let h = default_harness();
        h.transport.patch_failures.lock().extend([
            None,
            Some(ProviderError::Transport {
                operation: "upload chunk",
                message: "reset".into(),
            }),
            Some(ProviderError::Transport {
                operation: "upload chunk",
                message: "reset".into(),
            }),
        ]);
        h.controller.set_file(h.file.clone()).unwrap();
        h.controller.wait_for_thumbnails().await;

        let cancel = async {
            tokio::time::sleep(Duration::from_secs(1)).await;
            h.controller.cancel_upload().unwrap();
        };
        let (result, ()) = tokio::join!(h.controller.start_upload(), cancel);

        assert!(result.unwrap_err().is_cancelled());
        let session = h.controller.snapshot();
        assert_eq!(session.upload_progress().bytes_sent, 0);
        assert_eq!(session.step(), Step::Select);
        assert!(session.selected_file().is_none());
        assert!(session.generated_thumbnails().is_empty());
        assert!(!session.is_uploading());
        assert!(session.last_error().is_none());
    }

    #[tokio::test]
    async fn failed_upload_stays_in_upload_and_retry_reuses_the_remote_video() {
        let h = default_harness();
        h.transport
            .patch_failures
            .lock()
            .push_back(Some(ProviderError::Status {
                operation: "upload chunk",
                status: 403,
                body: "expired".into(),
            }));
        h.controller.set_file(h.file.clone()).unwrap();

        assert!(h.controller.start_upload().await.is_err());
        let session = h.controller.snapshot();
        assert_eq!(session.step(), Step::Upload);
        assert!(session.last_error().is_some());
        assert!(!session.is_uploading());

        h.controller.retry_upload().await.unwrap();
        let session = h.controller.snapshot();
        assert_eq!(session.step(), Step::Details);
        assert!(session.last_error().is_none());
        assert_eq!(h.provider.created.load(Ordering::SeqCst), 1);
        assert_eq!(*h.transport.creates.lock(), 1);
    }

    #[tokio::test]
    async fn failure_mid_transfer_keeps_partial_progress_and_resumes() {
        let h = default_harness();
        h.transport.patch_failures.lock().extend([
            None,
            Some(ProviderError::Status {
                operation: "upload chunk",
                status: 403,
                body: "expired".into(),
            }),
        ]);
        h.controller.set_file(h.file.clone()).unwrap();

        let err = h.controller.start_upload().await.unwrap_err();
        assert!(!err.is_cancelled());
        let session = h.controller.snapshot();
        assert_eq!(session.step(), Step::Upload);
        assert_eq!(session.upload_progress().bytes_sent, 256);
        assert_eq!(session.upload_progress().bytes_total, 1_000);
        assert_eq!(session.last_error(), Some(&err));

        h.controller.retry_upload().await.unwrap();
        assert_eq!(h.controller.step(), Step::Details);
        assert_eq!(h.controller.progress().bytes_sent, 1_000);
        assert_eq!(*h.transport.creates.lock(), 1);
        assert_eq!(*h.transport.patches.lock(), 5);
        assert_eq!(h.transport.stored(), vec![vec![7u8; 1_000]]);
    }

    #[tokio::test]
    async fn reselecting_after_cancel_reuses_the_remote_video() {
        let h = default_harness();
        let token = CancellationToken::new();
        *h.transport.cancel_after.lock() = Some((512, token.clone()));
        h.controller.set_file(h.file.clone()).unwrap();

        let upload = h.controller.start_upload();
        let cancel = async {
            token.cancelled().await;
            h.controller.cancel_upload().unwrap();
        };
        let (result, ()) = tokio::join!(upload, cancel);
        assert!(result.unwrap_err().is_cancelled());
        assert_eq!(h.controller.step(), Step::Select);
        *h.transport.cancel_after.lock() = None;

        h.controller.set_file(h.file.clone()).unwrap();
        h.controller.start_upload().await.unwrap();
        assert_eq!(h.controller.step(), Step::Details);
        assert_eq!(h.provider.created.load(Ordering::SeqCst), 1);
        assert_eq!(
            h.controller.snapshot().remote_video_id().map(|id| id.as_str()),
            Some("remote-1")
        );
        // Same remote video and file, so the stored upload URL is resumed.
        assert_eq!(*h.transport.creates.lock(), 1);
        assert_eq!(h.transport.stored(), vec![vec![7u8; 1_000]]);
    }

    #[tokio::test]
    async fn cancel_while_thumbnails_generate_reports_cancellation() {
        let mut extractor = FakeExtractor::new(Duration::from_secs(60));
        extractor.delay = Some(Duration::from_millis(300));
        let h = harness_with_extractor(
            FakeProvider::with_statuses(&[RemoteStatus::Processing]),
            ProcessingTimings::default(),
            extractor,
        );
        h.controller.set_file(h.file.clone()).unwrap();

        let cancel = async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            h.controller.cancel_upload().unwrap();
        };
        let (result, ()) = tokio::join!(h.controller.start_upload(), cancel);

        assert!(result.unwrap_err().is_cancelled());
        assert_eq!(h.provider.created.load(Ordering::SeqCst), 0);
        let session = h.controller.snapshot();
        assert_eq!(session.step(), Step::Select);
        assert!(session.last_error().is_none());
        assert!(!session.is_uploading());
    }

    #[tokio::test]
    async fn failed_remote_creation_can_be_retried() {
        let h = default_harness();
        *h.provider.fail_create.lock() = Some(ProviderError::Status {
            operation: "create video",
            status: 503,
            body: "maintenance".into(),
        });
        h.controller.set_file(h.file.clone()).unwrap();

        let err = h.controller.start_upload().await.unwrap_err();
        assert!(err.is_transient());
        let session = h.controller.snapshot();
        assert_eq!(session.step(), Step::Upload);
        assert!(session.remote_video_id().is_none());
        assert_eq!(*h.transport.creates.lock(), 0);

        h.controller.retry_upload().await.unwrap();
        assert_eq!(h.controller.step(), Step::Details);
        assert_eq!(h.provider.created.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn custom_thumbnail_waits_for_the_remote_video() {
        let h = default_harness();
        h.controller.set_file(h.file.clone()).unwrap();
        let image = ImageData::new("image/png", vec![1, 2, 3]).unwrap();
        h.controller
            .choose_thumbnail(ThumbnailChoice::Custom(image.clone()))
            .await
            .unwrap();
        assert!(h.provider.thumbnails.lock().is_empty());

        h.controller.start_upload().await.unwrap();
        let uploaded = h.provider.thumbnails.lock().clone();
        assert_eq!(uploaded.len(), 1);
        assert_eq!(uploaded[0].0.as_str(), "remote-1");
        assert_eq!(uploaded[0].1, image);

        let replacement = ImageData::new("image/jpeg", vec![9]).unwrap();
        h.controller
            .choose_thumbnail(ThumbnailChoice::Custom(replacement))
            .await
            .unwrap();
        assert_eq!(h.provider.thumbnails.lock().len(), 2);
    }

    #[tokio::test]
    async fn tags_are_capped_and_deduplicated() {
        let h = default_harness();
        assert!(h.controller.add_tag("intro").unwrap());
        assert!(!h.controller.add_tag("Intro").unwrap());
        for index in 0..20 {
            h.controller.add_tag(&format!("tag-{index}")).unwrap();
        }
        assert_eq!(h.controller.snapshot().metadata().tags.len(), 15);
    }

    #[tokio::test]
    async fn missing_category_keeps_the_details_step() {
        let h = default_harness();
        reach_details(&h).await;
        h.controller.set_category("").unwrap();

        let err = h.controller.validate_and_submit_details().await.unwrap_err();
        let WorkflowError::Details(details) = err else {
            panic!("expected a details error, got {err:?}");
        };
        assert!(details.field("category_id").is_some());
        assert_eq!(h.controller.step(), Step::Details);
        assert!(h.catalog.saved.lock().is_empty());
    }

    #[tokio::test]
    async fn details_require_a_thumbnail() {
        let h = default_harness();
        h.controller.set_file(h.file.clone()).unwrap();
        h.controller.start_upload().await.unwrap();
        h.controller.set_category("education").unwrap();

        let err = h.controller.validate_and_submit_details().await.unwrap_err();
        let WorkflowError::Details(details) = err else {
            panic!("expected a details error, got {err:?}");
        };
        assert_eq!(details.fields.len(), 1);
        assert!(details.field("thumbnail").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn poll_ready_before_the_fallback_completes() {
        let h = harness(
            FakeProvider::with_statuses(&[RemoteStatus::Processing, RemoteStatus::Finished]),
            ProcessingTimings::default(),
        );
        reach_details(&h).await;
        h.controller.validate_and_submit_details().await.unwrap();

        let started = Instant::now();
        let source = h.controller.wait_for_completion().await.unwrap();
        assert_eq!(source, CompletionSource::StatusPoll);
        assert!(started.elapsed() < Duration::from_secs(15));
        assert_eq!(h.controller.step(), Step::Complete);
        assert_eq!(h.catalog.ready.lock().len(), 1);

        // The fallback deadline passing later changes nothing.
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(h.catalog.ready.lock().len(), 1);
        assert_eq!(h.controller.wait_for_completion().await.unwrap(), source);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_forces_completion_with_one_ready_update() {
        let h = harness(
            FakeProvider::with_statuses(&[RemoteStatus::Processing]),
            ProcessingTimings {
                simulated_completion: None,
                ..ProcessingTimings::default()
            },
        );
        reach_details(&h).await;
        h.controller.validate_and_submit_details().await.unwrap();

        let source = h.controller.wait_for_completion().await.unwrap();
        assert_eq!(source, CompletionSource::Timeout);
        assert_eq!(h.controller.step(), Step::Complete);
        let ready = h.catalog.ready.lock();
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].as_str(), "remote-1");
    }

    #[tokio::test]
    async fn editing_is_closed_once_processing_starts() {
        let h = default_harness();
        reach_details(&h).await;
        h.controller.validate_and_submit_details().await.unwrap();
        assert!(matches!(
            h.controller.set_title("late"),
            Err(WorkflowError::InvalidStep { step: Step::Processing, .. })
        ));
        assert!(h.controller.cancel_upload().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn demo_upload_ends_public_and_ready() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("demo.mp4");
        std::fs::File::create(&path)?.set_len(50_000_000)?;
        let catalog = Arc::new(Catalog::open(&dir.path().join("catalog.db")).await?);
        let provider = Arc::new(FakeProvider::with_statuses(&[RemoteStatus::Processing]));
        let transport = Arc::new(FakeTransport::default());
        let controller = UploadController::new(
            UploadConfig::new("creator"),
            UploadServices {
                provider: provider.clone(),
                transport: transport.clone(),
                extractor: Arc::new(FakeExtractor::new(Duration::from_secs(120))),
                catalog: catalog.clone(),
            },
        );
        let mut steps = controller.subscribe();

        controller.set_file(SelectedFile::from_path(&path)?)?;
        assert_eq!(controller.snapshot().metadata().title, "demo");
        controller.wait_for_thumbnails().await;
        assert_eq!(controller.snapshot().generated_thumbnails().len(), 3);
        controller
            .choose_thumbnail(ThumbnailChoice::Generated(1))
            .await?;
        controller.start_upload().await?;

        let education = catalog.find_category("Education").await?.unwrap();
        controller.set_category(education.id)?;
        controller.add_tag("intro")?;
        controller.add_tag("tutorial")?;
        controller.validate_and_submit_details().await?;

        let started = Instant::now();
        let source = controller.wait_for_completion().await?;
        assert_eq!(source, CompletionSource::SimulatedWebhook);
        assert_eq!(started.elapsed().as_secs(), 15);
        assert_eq!(*steps.borrow_and_update(), Step::Complete);

        let remote = controller.snapshot().remote_video_id().cloned().unwrap();
        let video = catalog.video_by_remote_id(remote.as_str()).await?.unwrap();
        assert!(video.is_listed());
        assert_eq!(video.title, "demo");
        assert_eq!(video.tags, vec!["intro".to_string(), "tutorial".to_string()]);
        assert_eq!(video.category_id.as_deref(), Some("education"));
        assert_eq!(video.thumbnail_time_ms, Some(60_000));
        assert_eq!(transport.stored()[0].len(), 50_000_000);
        Ok(())
    }
}
