//! Candidate still frames for the thumbnail picker.
//!
//! Frames are decoded locally with `ffprobe`/`ffmpeg`; nothing here talks to
//! the server. A [`ThumbnailFrames`] iterator decodes one frame per `next()`
//! and is consumed by value, so a new set requires selecting the file again.

use std::{
    fmt,
    path::{Path, PathBuf},
    process::Command,
    sync::Arc,
    time::Duration,
};

use base64::{Engine, engine::general_purpose::STANDARD};
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, warn};

pub const DEFAULT_THUMBNAIL_COUNT: usize = 3;

#[derive(Debug, Error)]
pub enum ThumbnailError {
    #[error("probing {path} failed: {message}")]
    Probe { path: String, message: String },
    #[error("decoding a frame at {offset:?} failed: {message}")]
    Decode { offset: Duration, message: String },
    #[error("not a base64 image data URI")]
    InvalidDataUri,
    #[error("{0} is not an image type")]
    NotAnImage(String),
}

/// Encoded image bytes plus their MIME type.
#[derive(Clone, PartialEq, Eq)]
pub struct ImageData {
    pub mime: String,
    pub bytes: Vec<u8>,
}

impl ImageData {
    pub fn jpeg(bytes: Vec<u8>) -> Self {
        Self {
            mime: "image/jpeg".to_string(),
            bytes,
        }
    }

    pub fn new(mime: impl Into<String>, bytes: Vec<u8>) -> Result<Self, ThumbnailError> {
        let mime = mime.into();
        if !mime.starts_with("image/") {
            return Err(ThumbnailError::NotAnImage(mime));
        }
        Ok(Self { mime, bytes })
    }

    /// Reads an operator-supplied replacement image from disk.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        use anyhow::Context;
        let mime = mime_guess::from_path(path)
            .first_raw()
            .unwrap_or("application/octet-stream");
        let bytes =
            std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
        Ok(Self::new(mime, bytes)?)
    }

    /// Parses `data:image/png;base64,....`.
    pub fn from_data_uri(uri: &str) -> Result<Self, ThumbnailError> {
        let rest = uri
            .trim()
            .strip_prefix("data:")
            .ok_or(ThumbnailError::InvalidDataUri)?;
        let (header, payload) = rest.split_once(',').ok_or(ThumbnailError::InvalidDataUri)?;
        let mime = header
            .strip_suffix(";base64")
            .ok_or(ThumbnailError::InvalidDataUri)?;
        let bytes = STANDARD
            .decode(payload)
            .map_err(|_| ThumbnailError::InvalidDataUri)?;
        Self::new(mime, bytes)
    }

    pub fn to_data_uri(&self) -> String {
        format!("data:{};base64,{}", self.mime, STANDARD.encode(&self.bytes))
    }
}

impl fmt::Debug for ImageData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImageData")
            .field("mime", &self.mime)
            .field("len", &self.bytes.len())
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Thumbnail {
    pub index: usize,
    pub offset: Duration,
    pub image: ImageData,
}

/// Media decoding backend.
pub trait FrameExtractor: Send + Sync {
    fn duration(&self, path: &Path) -> Result<Duration, ThumbnailError>;
    fn extract(&self, path: &Path, offset: Duration) -> Result<ImageData, ThumbnailError>;
}

/// Shells out to `ffprobe` and `ffmpeg`.
#[derive(Debug, Clone)]
pub struct FfmpegExtractor {
    ffmpeg: PathBuf,
    ffprobe: PathBuf,
}

impl Default for FfmpegExtractor {
    fn default() -> Self {
        Self {
            ffmpeg: PathBuf::from("ffmpeg"),
            ffprobe: PathBuf::from("ffprobe"),
        }
    }
}

#[derive(Deserialize)]
struct ProbeOutput {
    format: ProbeFormat,
}

#[derive(Deserialize)]
struct ProbeFormat {
    duration: Option<String>,
}

impl FfmpegExtractor {
    pub fn with_binaries(ffmpeg: impl Into<PathBuf>, ffprobe: impl Into<PathBuf>) -> Self {
        Self {
            ffmpeg: ffmpeg.into(),
            ffprobe: ffprobe.into(),
        }
    }
}

impl FrameExtractor for FfmpegExtractor {
    fn duration(&self, path: &Path) -> Result<Duration, ThumbnailError> {
        let probe_error = |message: String| ThumbnailError::Probe {
            path: path.display().to_string(),
            message,
        };
        let output = Command::new(&self.ffprobe)
            .args(["-v", "quiet", "-print_format", "json", "-show_format"])
            .arg(path)
            .output()
            .map_err(|err| probe_error(err.to_string()))?;
        if !output.status.success() {
            return Err(probe_error(format!("ffprobe exited with {}", output.status)));
        }
        let parsed: ProbeOutput =
            serde_json::from_slice(&output.stdout).map_err(|err| probe_error(err.to_string()))?;
        let seconds = parsed
            .format
            .duration
            .as_deref()
            .and_then(|value| value.parse::<f64>().ok())
            .filter(|value| value.is_finite() && *value > 0.0)
            .ok_or_else(|| probe_error("no duration reported".to_string()))?;
        Ok(Duration::from_secs_f64(seconds))
    }

    fn extract(&self, path: &Path, offset: Duration) -> Result<ImageData, ThumbnailError> {
        let decode_error = |message: String| ThumbnailError::Decode { offset, message };
        let output = Command::new(&self.ffmpeg)
            .args(["-v", "error", "-ss"])
            .arg(format!("{:.3}", offset.as_secs_f64()))
            .arg("-i")
            .arg(path)
            .args([
                "-frames:v", "1", "-q:v", "2", "-f", "image2pipe", "-vcodec", "mjpeg", "-",
            ])
            .output()
            .map_err(|err| decode_error(err.to_string()))?;
        if !output.status.success() || output.stdout.is_empty() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(decode_error(format!(
                "ffmpeg exited with {}: {}",
                output.status,
                stderr.trim()
            )));
        }
        Ok(ImageData::jpeg(output.stdout))
    }
}

/// Evenly spaced offsets that avoid the very first and last frame.
pub fn sample_offsets(duration: Duration, count: usize) -> Vec<Duration> {
    let step = duration.as_secs_f64() / (count + 1) as f64;
    (1..=count)
        .map(|index| Duration::from_secs_f64(step * index as f64))
        .collect()
}

/// Lazy, finite frame sequence. Not `Clone`: once drained it is gone.
pub struct ThumbnailFrames {
    extractor: Arc<dyn FrameExtractor>,
    path: PathBuf,
    offsets: std::iter::Enumerate<std::vec::IntoIter<Duration>>,
}

impl ThumbnailFrames {
    pub fn open(
        extractor: Arc<dyn FrameExtractor>,
        path: impl Into<PathBuf>,
        count: usize,
    ) -> Result<Self, ThumbnailError> {
        let path = path.into();
        let duration = extractor.duration(&path)?;
        debug!(path = %path.display(), ?duration, count, "sampling thumbnail frames");
        Ok(Self {
            extractor,
            path,
            offsets: sample_offsets(duration, count).into_iter().enumerate(),
        })
    }
}

impl Iterator for ThumbnailFrames {
    type Item = Result<Thumbnail, ThumbnailError>;

    fn next(&mut self) -> Option<Self::Item> {
        let (index, offset) = self.offsets.next()?;
        Some(
            self.extractor
                .extract(&self.path, offset)
                .map(|image| Thumbnail {
                    index,
                    offset,
                    image,
                }),
        )
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.offsets.size_hint()
    }
}

/// Drains a fresh [`ThumbnailFrames`]. Any failure is logged and yields an
/// empty list so the upload can continue without candidates.
pub fn generate_thumbnails(
    extractor: Arc<dyn FrameExtractor>,
    path: &Path,
    count: usize,
) -> Vec<Thumbnail> {
    let frames = match ThumbnailFrames::open(extractor, path, count) {
        Ok(frames) => frames,
        Err(err) => {
            warn!(path = %path.display(), error = %err, "thumbnail generation unavailable");
            return Vec::new();
        }
    };
    match frames.collect::<Result<Vec<_>, _>>() {
        Ok(thumbnails) => thumbnails,
        Err(err) => {
            warn!(path = %path.display(), error = %err, "thumbnail generation failed");
            Vec::new()
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use parking_lot::Mutex;

    /// Deterministic extractor: every frame encodes its offset in milliseconds.
    pub(crate) struct FakeExtractor {
        pub duration: Option<Duration>,
        pub fail_at: Option<usize>,
        /// Blocks the worker thread before reporting the duration.
        pub delay: Option<Duration>,
        pub calls: Mutex<Vec<Duration>>,
    }

    impl FakeExtractor {
        pub(crate) fn new(duration: Duration) -> Self {
            Self {
                duration: Some(duration),
                fail_at: None,
                delay: None,
                calls: Mutex::new(Vec::new()),
            }
        }
    }

    impl FrameExtractor for FakeExtractor {
        fn duration(&self, path: &Path) -> Result<Duration, ThumbnailError> {
            if let Some(delay) = self.delay {
                std::thread::sleep(delay);
            }
            self.duration.ok_or_else(|| ThumbnailError::Probe {
                path: path.display().to_string(),
                message: "unsupported codec".into(),
            })
        }

        fn extract(&self, _path: &Path, offset: Duration) -> Result<ImageData, ThumbnailError> {
            let mut calls = self.calls.lock();
            if self.fail_at == Some(calls.len()) {
                return Err(ThumbnailError::Decode {
                    offset,
                    message: "corrupt frame".into(),
                });
            }
            calls.push(offset);
            Ok(ImageData::jpeg(offset.as_millis().to_string().into_bytes()))
        }
    }

    #[test]
    fn offsets_are_evenly_spaced() {
        let offsets = sample_offsets(Duration::from_secs(60), 3);
        assert_eq!(
            offsets,
            vec![
                Duration::from_secs(15),
                Duration::from_secs(30),
                Duration::from_secs(45)
            ]
        );
    }

    #[test]
    fn frames_are_decoded_lazily() {
        let extractor = Arc::new(FakeExtractor::new(Duration::from_secs(40)));
        let mut frames = ThumbnailFrames::open(extractor.clone(), "demo.mp4", 3).unwrap();
        assert!(extractor.calls.lock().is_empty());

        let first = frames.next().unwrap().unwrap();
        assert_eq!(first.index, 0);
        assert_eq!(first.offset, Duration::from_secs(10));
        assert_eq!(extractor.calls.lock().len(), 1);

        assert_eq!(frames.by_ref().count(), 2);
        assert!(frames.next().is_none());
    }

    #[test]
    fn generate_collects_every_frame() {
        let extractor = Arc::new(FakeExtractor::new(Duration::from_secs(8)));
        let thumbnails = generate_thumbnails(extractor, Path::new("clip.mp4"), 3);
        assert_eq!(thumbnails.len(), 3);
        assert_eq!(thumbnails[1].image.bytes, b"4000".to_vec());
    }

    #[test]
    fn unreadable_duration_leaves_list_empty() {
        let mut extractor = FakeExtractor::new(Duration::from_secs(8));
        extractor.duration = None;
        let thumbnails = generate_thumbnails(Arc::new(extractor), Path::new("clip.mkv"), 3);
        assert!(thumbnails.is_empty());
    }

    #[test]
    fn decode_failure_leaves_list_empty() {
        let mut extractor = FakeExtractor::new(Duration::from_secs(8));
        extractor.fail_at = Some(1);
        let thumbnails = generate_thumbnails(Arc::new(extractor), Path::new("clip.mkv"), 3);
        assert!(thumbnails.is_empty());
    }

    #[test]
    fn data_uri_parsing() {
        let image = ImageData::new("image/png", vec![1, 2, 3]).unwrap();
        let uri = image.to_data_uri();
        assert_eq!(uri, "data:image/png;base64,AQID");
        assert_eq!(ImageData::from_data_uri(&uri).unwrap(), image);

        assert!(matches!(
            ImageData::from_data_uri("data:image/png,AQID"),
            Err(ThumbnailError::InvalidDataUri)
        ));
        assert!(matches!(
            ImageData::from_data_uri("data:text/plain;base64,AQID"),
            Err(ThumbnailError::NotAnImage(_))
        ));
    }
}
