#![forbid(unsafe_code)]

//! Command-line uploader: runs one video through the whole upload flow
//! (file checks, thumbnails, resumable transfer, details, processing) and
//! publishes it in the catalog.

use std::{
    future::Future,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use anyhow::{Context, Result, anyhow, bail};
use clap::Parser;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use vidshare::{
    UploadConfig, UploadController, UploadServices,
    catalog::{Catalog, Visibility},
    config::{RuntimeOverrides, resolve_runtime_settings},
    error::WorkflowError,
    polling::CompletionSource,
    progress::{UploadProgress, format_bytes},
    provider::HttpStreamProvider,
    security::ensure_not_root,
    session::{SelectedFile, ThumbnailChoice},
    thumbnails::{FfmpegExtractor, ImageData},
    transfer::TusTransport,
};

const PROGRESS_INTERVAL: Duration = Duration::from_secs(1);
const MAX_UPLOAD_RETRIES: u32 = 3;
const RETRY_PAUSE: Duration = Duration::from_secs(5);

#[derive(Debug, Parser)]
#[command(author, version, about = "Upload a video and publish it on vidshare", long_about = None)]
struct UploadArgs {
    /// Video file to upload
    file: PathBuf,
    /// Catalog user id that will own the video
    #[arg(long)]
    owner: String,
    /// Defaults to the file name without its extension
    #[arg(long)]
    title: Option<String>,
    #[arg(long, default_value = "")]
    description: String,
    /// Repeat for several tags
    #[arg(long = "tag")]
    tags: Vec<String>,
    /// Category id or name, e.g. `education` or "Science & Technology"
    #[arg(long)]
    category: String,
    /// Generated thumbnail to use, counting from 1
    #[arg(long, conflicts_with = "thumbnail_file")]
    thumbnail: Option<usize>,
    /// Image file or `data:image/...;base64,` URI to use instead of a
    /// generated thumbnail
    #[arg(long, value_name = "PATH|DATA_URI")]
    thumbnail_file: Option<String>,
    #[arg(long)]
    private: bool,
    /// Wait for the provider status (or the timeout) only
    #[arg(long)]
    no_simulated_completion: bool,
    /// Overrides DATA_ROOT
    #[arg(long)]
    data_root: Option<PathBuf>,
    /// Read settings from this file instead of `./.env`
    #[arg(long)]
    env_file: Option<PathBuf>,
}

impl UploadArgs {
    fn thumbnail_choice(&self) -> Result<ThumbnailChoice> {
        if let Some(source) = &self.thumbnail_file {
            let image = if source.trim_start().starts_with("data:") {
                ImageData::from_data_uri(source).context("--thumbnail-file")?
            } else {
                ImageData::from_file(Path::new(source))?
            };
            return Ok(ThumbnailChoice::Custom(image));
        }
        match self.thumbnail.unwrap_or(1) {
            0 => bail!("--thumbnail counts from 1"),
            number => Ok(ThumbnailChoice::Generated(number - 1)),
        }
    }

    fn upload_config(&self, max_file_bytes: u64) -> UploadConfig {
        let mut config = UploadConfig::new(self.owner.trim());
        config.max_file_bytes = max_file_bytes;
        if self.private {
            config.visibility = Visibility::Private;
        }
        if self.no_simulated_completion {
            config.processing.simulated_completion = None;
        }
        config
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = UploadArgs::parse();
    ensure_not_root("upload")?;

    let settings = resolve_runtime_settings(RuntimeOverrides {
        data_root: args.data_root.clone(),
        env_path: args.env_file.clone(),
        ..RuntimeOverrides::default()
    })?;
    let catalog = Catalog::open(&settings.catalog_path())
        .await
        .context("opening catalog")?;
    let category = catalog
        .find_category(&args.category)
        .await?
        .ok_or_else(|| anyhow!("unknown category `{}`", args.category))?;
    catalog.ensure_user(args.owner.trim()).await?;
    let thumbnail = args.thumbnail_choice()?;

    let services = UploadServices {
        provider: Arc::new(HttpStreamProvider::new(&settings.provider)?),
        transport: Arc::new(TusTransport::default()),
        extractor: Arc::new(FfmpegExtractor::default()),
        catalog: Arc::new(catalog),
    };
    let controller = UploadController::new(args.upload_config(settings.max_upload_bytes), services);

    controller.set_file(SelectedFile::from_path(&args.file)?)?;
    if let Some(title) = &args.title {
        controller.set_title(title.as_str())?;
    }
    controller.set_description(args.description.as_str())?;
    for tag in &args.tags {
        if !controller.add_tag(tag)? {
            warn!(tag = %tag, "tag skipped (duplicate or over the limit)");
        }
    }
    controller.set_category(category.id.as_str())?;

    controller.wait_for_thumbnails().await;
    let generated = controller.snapshot().generated_thumbnails().len();
    println!("Generated {generated} thumbnail(s)");
    controller.choose_thumbnail(thumbnail).await?;

    upload_with_retries(&controller).await?;
    let session = controller.snapshot();
    let remote = session
        .remote_video_id()
        .map(ToString::to_string)
        .unwrap_or_default();
    println!("Upload finished (provider id {remote})");

    controller.validate_and_submit_details().await?;
    println!("Details saved; waiting for processing");
    let source = controller.wait_for_completion().await?;
    match source {
        CompletionSource::StatusPoll => println!("Provider reports the video as ready"),
        CompletionSource::SimulatedWebhook => {
            println!("Marked ready after the simulated completion")
        }
        CompletionSource::Timeout => println!("Processing timed out; video marked ready"),
    }
    info!(remote = %remote, ?source, "upload complete");
    Ok(())
}

/// Uploads the file, retrying transient provider failures a few times. Each
/// retry resumes from the offset the provider already stored.
async fn upload_with_retries(controller: &UploadController) -> Result<()> {
    let mut retries = 0;
    let mut result = upload_with_progress(controller, controller.start_upload()).await;
    while let Err(err) = &result {
        if !should_retry(err, retries) {
            break;
        }
        retries += 1;
        warn!(error = %err, retry = retries, "upload failed; retrying");
        println!("Upload failed ({err}); retry {retries} of {MAX_UPLOAD_RETRIES}");
        tokio::select! {
            _ = tokio::time::sleep(RETRY_PAUSE) => {}
            interrupted = signal::ctrl_c() => {
                interrupted.context("listening for Ctrl+C")?;
                controller.cancel_upload()?;
                bail!("upload cancelled");
            }
        }
        result = upload_with_progress(controller, controller.retry_upload()).await;
    }
    result
}

fn should_retry(err: &anyhow::Error, retries: u32) -> bool {
    retries < MAX_UPLOAD_RETRIES
        && err
            .downcast_ref::<WorkflowError>()
            .is_some_and(WorkflowError::is_transient)
}

/// Drives `upload` while printing progress; Ctrl+C cancels the transfer.
async fn upload_with_progress(
    controller: &UploadController,
    upload: impl Future<Output = Result<(), WorkflowError>>,
) -> Result<()> {
    tokio::pin!(upload);
    let mut ticker = tokio::time::interval(PROGRESS_INTERVAL);
    let mut cancelled = false;
    let result = loop {
        tokio::select! {
            result = &mut upload => break result,
            _ = ticker.tick() => {
                if let Some(line) = progress_line(&controller.progress()) {
                    println!("{line}");
                }
            }
            interrupted = signal::ctrl_c(), if !cancelled => {
                interrupted.context("listening for Ctrl+C")?;
                cancelled = true;
                println!("Cancelling upload");
                controller.cancel_upload()?;
            }
        }
    };
    result?;
    Ok(())
}

fn progress_line(progress: &UploadProgress) -> Option<String> {
    if progress.bytes_total == 0 {
        return None;
    }
    let eta = progress
        .estimated_seconds_remaining
        .map(|seconds| format!(", {seconds:.0}s left"))
        .unwrap_or_default();
    Some(format!(
        "{:>5.1}%  {} / {}  ({}/s{eta})",
        progress.percent(),
        format_bytes(progress.bytes_sent),
        format_bytes(progress.bytes_total),
        format_bytes(progress.instantaneous_rate as u64),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::error::ErrorKind;
    use vidshare::error::{ProviderError, UploadError};

    fn parse(extra: &[&str]) -> Result<UploadArgs, clap::Error> {
        let mut argv = vec!["upload", "demo.mp4", "--owner", "u1", "--category", "Education"];
        argv.extend_from_slice(extra);
        UploadArgs::try_parse_from(argv)
    }

    #[test]
    fn tags_repeat_and_defaults_apply() {
        let args = parse(&["--tag", "intro", "--tag", "tutorial"]).unwrap();
        assert_eq!(args.tags, vec!["intro", "tutorial"]);
        assert_eq!(args.file, PathBuf::from("demo.mp4"));
        assert!(args.title.is_none());
        assert_eq!(
            args.thumbnail_choice().unwrap(),
            ThumbnailChoice::Generated(0)
        );
    }

    #[test]
    fn thumbnail_numbers_count_from_one() {
        let args = parse(&["--thumbnail", "2"]).unwrap();
        assert_eq!(
            args.thumbnail_choice().unwrap(),
            ThumbnailChoice::Generated(1)
        );
        let zero = parse(&["--thumbnail", "0"]).unwrap();
        assert!(zero.thumbnail_choice().is_err());
    }

    #[test]
    fn thumbnail_sources_are_exclusive() {
        let err = parse(&["--thumbnail", "1", "--thumbnail-file", "cover.jpg"]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ArgumentConflict);
    }

    #[test]
    fn thumbnail_file_accepts_a_data_uri() {
        let args = parse(&["--thumbnail-file", "data:image/png;base64,AQID"]).unwrap();
        let ThumbnailChoice::Custom(image) = args.thumbnail_choice().unwrap() else {
            panic!("expected a custom thumbnail");
        };
        assert_eq!(image.mime, "image/png");
        assert_eq!(image.bytes, vec![1, 2, 3]);

        let broken = parse(&["--thumbnail-file", "data:image/png,AQID"]).unwrap();
        assert!(broken.thumbnail_choice().is_err());
    }

    #[test]
    fn thumbnail_file_reads_images_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cover.jpg");
        std::fs::write(&path, [9u8, 8]).unwrap();
        let args = parse(&["--thumbnail-file", path.to_str().unwrap()]).unwrap();
        let ThumbnailChoice::Custom(image) = args.thumbnail_choice().unwrap() else {
            panic!("expected a custom thumbnail");
        };
        assert_eq!(image.mime, "image/jpeg");
        assert_eq!(image.bytes, vec![9, 8]);
    }

    #[test]
    fn only_transient_failures_are_retried() {
        let reset: anyhow::Error = WorkflowError::from(UploadError::Provider(
            ProviderError::Transport {
                operation: "upload chunk",
                message: "connection reset".into(),
            },
        ))
        .into();
        assert!(should_retry(&reset, 0));
        assert!(should_retry(&reset, MAX_UPLOAD_RETRIES - 1));
        assert!(!should_retry(&reset, MAX_UPLOAD_RETRIES));

        let forbidden: anyhow::Error = WorkflowError::from(ProviderError::Status {
            operation: "upload chunk",
            status: 403,
            body: String::new(),
        })
        .into();
        assert!(!should_retry(&forbidden, 0));

        let cancelled: anyhow::Error = WorkflowError::from(UploadError::Cancelled).into();
        assert!(!should_retry(&cancelled, 0));
        assert!(!should_retry(&anyhow!("listening for Ctrl+C"), 0));
    }

    #[test]
    fn env_file_is_optional() {
        assert!(parse(&[]).unwrap().env_file.is_none());
        let args = parse(&["--env-file", "/etc/vidshare.env"]).unwrap();
        assert_eq!(args.env_file, Some(PathBuf::from("/etc/vidshare.env")));
    }

    #[test]
    fn owner_and_category_are_required() {
        let err = UploadArgs::try_parse_from(["upload", "demo.mp4"]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MissingRequiredArgument);
    }

    #[test]
    fn config_follows_flags() {
        let args = parse(&["--private", "--no-simulated-completion"]).unwrap();
        let config = args.upload_config(1_000);
        assert_eq!(config.owner_id, "u1");
        assert_eq!(config.max_file_bytes, 1_000);
        assert_eq!(config.visibility, Visibility::Private);
        assert!(config.processing.simulated_completion.is_none());

        let defaults = parse(&[]).unwrap().upload_config(1_000);
        assert_eq!(defaults.visibility, Visibility::Public);
        assert!(defaults.processing.simulated_completion.is_some());
    }

    #[test]
    fn progress_lines_need_a_total() {
        assert!(progress_line(&UploadProgress::default()).is_none());
        let line = progress_line(&UploadProgress {
            bytes_sent: 512,
            bytes_total: 1_024,
            instantaneous_rate: 256.0,
            estimated_seconds_remaining: Some(2.0),
        })
        .unwrap();
        assert!(line.contains("50.0%"));
        assert!(line.contains("2s left"));
    }
}
