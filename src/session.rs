//! The mutable record behind one pass through the upload flow.

use std::{
    fmt,
    path::{Path, PathBuf},
    time::SystemTime,
};

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::{
    error::{DetailsError, FieldError, FileError, WorkflowError},
    progress::UploadProgress,
    provider::RemoteVideoId,
    thumbnails::{ImageData, Thumbnail},
};

pub const MAX_TAGS: usize = 15;
pub const MAX_TAG_CHARS: usize = 30;
pub const MAX_TITLE_CHARS: usize = 100;
pub const MAX_DESCRIPTION_CHARS: usize = 5000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Step {
    Select,
    Upload,
    Details,
    Processing,
    Complete,
}

impl Step {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Select => "select",
            Self::Upload => "upload",
            Self::Details => "details",
            Self::Processing => "processing",
            Self::Complete => "complete",
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ordered, de-duplicated, capped tag list.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct TagSet {
    tags: Vec<String>,
}

impl TagSet {
    /// Adds a trimmed tag. Blank tags, case-insensitive duplicates and tags
    /// past the fifteenth are ignored; returns whether the set grew.
    pub fn insert(&mut self, tag: &str) -> bool {
        let tag = tag.trim();
        if tag.is_empty() || self.tags.len() >= MAX_TAGS || self.contains(tag) {
            return false;
        }
        self.tags.push(tag.to_string());
        true
    }

    pub fn remove(&mut self, tag: &str) -> bool {
        let before = self.tags.len();
        let tag = tag.trim();
        self.tags.retain(|existing| !existing.eq_ignore_ascii_case(tag));
        self.tags.len() != before
    }

    pub fn contains(&self, tag: &str) -> bool {
        let tag = tag.trim();
        self.tags
            .iter()
            .any(|existing| existing.eq_ignore_ascii_case(tag))
    }

    pub fn len(&self) -> usize {
        self.tags.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tags.is_empty()
    }

    pub fn as_slice(&self) -> &[String] {
        &self.tags
    }

    pub fn to_vec(&self) -> Vec<String> {
        self.tags.clone()
    }
}

impl<S: AsRef<str>> FromIterator<S> for TagSet {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        let mut set = Self::default();
        for tag in iter {
            set.insert(tag.as_ref());
        }
        set
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoMetadata {
    pub title: String,
    pub description: String,
    pub tags: TagSet,
    pub category_id: String,
}

impl VideoMetadata {
    /// Collects every field problem instead of stopping at the first.
    pub fn problems(&self) -> Vec<FieldError> {
        let mut problems = Vec::new();
        let title = self.title.trim();
        if title.is_empty() {
            problems.push(FieldError::new("title", "title is required"));
        } else if title.chars().count() > MAX_TITLE_CHARS {
            problems.push(FieldError::new(
                "title",
                format!("title must be at most {MAX_TITLE_CHARS} characters"),
            ));
        }
        if self.description.chars().count() > MAX_DESCRIPTION_CHARS {
            problems.push(FieldError::new(
                "description",
                format!("description must be at most {MAX_DESCRIPTION_CHARS} characters"),
            ));
        }
        if self.tags.len() > MAX_TAGS {
            problems.push(FieldError::new(
                "tags",
                format!("at most {MAX_TAGS} tags are allowed"),
            ));
        }
        if let Some(tag) = self
            .tags
            .as_slice()
            .iter()
            .find(|tag| tag.chars().count() > MAX_TAG_CHARS)
        {
            problems.push(FieldError::new(
                "tags",
                format!("tag \"{tag}\" is longer than {MAX_TAG_CHARS} characters"),
            ));
        }
        if self.category_id.trim().is_empty() {
            problems.push(FieldError::new("category_id", "category is required"));
        }
        problems
    }

    pub fn validate(&self) -> Result<(), DetailsError> {
        let fields = self.problems();
        if fields.is_empty() {
            Ok(())
        } else {
            Err(DetailsError { fields })
        }
    }
}

/// Local file handed to the flow by the operator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectedFile {
    pub path: PathBuf,
    pub name: String,
    pub size: u64,
    pub mime: String,
    pub modified: Option<SystemTime>,
}

impl SelectedFile {
    pub fn new(path: impl Into<PathBuf>, size: u64, mime: impl Into<String>) -> Self {
        let path = path.into();
        let name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        Self {
            path,
            name,
            size,
            mime: mime.into(),
            modified: None,
        }
    }

    /// Stats the file and guesses its MIME type from the extension.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, FileError> {
        let path = path.as_ref();
        let metadata = std::fs::metadata(path).map_err(|err| FileError::Unreadable {
            path: path.display().to_string(),
            message: err.to_string(),
        })?;
        if !metadata.is_file() {
            return Err(FileError::Unreadable {
                path: path.display().to_string(),
                message: "not a regular file".to_string(),
            });
        }
        let mime = mime_guess::from_path(path)
            .first_raw()
            .unwrap_or("application/octet-stream");
        let mut file = Self::new(path, metadata.len(), mime);
        file.modified = metadata.modified().ok();
        Ok(file)
    }

    pub fn validate(&self, max_bytes: u64) -> Result<(), FileError> {
        if !self.mime.starts_with("video/") {
            return Err(FileError::UnsupportedType {
                name: self.name.clone(),
                mime: self.mime.clone(),
            });
        }
        if self.size > max_bytes {
            return Err(FileError::TooLarge {
                name: self.name.clone(),
                size: self.size,
                max: max_bytes,
            });
        }
        Ok(())
    }

    /// File name without its extension: `demo.mp4` becomes `demo`.
    pub fn default_title(&self) -> String {
        Path::new(&self.name)
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.name.clone())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ThumbnailChoice {
    /// Index into the generated thumbnails.
    Generated(usize),
    /// Operator-supplied replacement, uploaded once a remote video exists.
    Custom(ImageData),
}

/// What the catalog records about the chosen thumbnail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ThumbnailRef {
    Frame { offset_ms: u64 },
    Custom,
}

#[derive(Debug, Clone)]
pub struct UploadSession {
    pub(crate) step: Step,
    pub(crate) selected_file: Option<SelectedFile>,
    pub(crate) generated_thumbnails: Vec<Thumbnail>,
    pub(crate) thumbnails_ready: bool,
    pub(crate) chosen_thumbnail: Option<ThumbnailChoice>,
    pub(crate) thumbnail_pending: bool,
    pub(crate) metadata: VideoMetadata,
    pub(crate) remote_video_id: Option<RemoteVideoId>,
    pub(crate) upload_progress: UploadProgress,
    pub(crate) last_error: Option<WorkflowError>,
    pub(crate) uploading: bool,
    pub(crate) submitting: bool,
    /// Bumped on every cancel and file change so late callbacks from an
    /// abandoned attempt can recognise themselves and back off.
    pub(crate) attempt: u64,
    pub(crate) cancel: Option<CancellationToken>,
}

impl Default for UploadSession {
    fn default() -> Self {
        Self {
            step: Step::Select,
            selected_file: None,
            generated_thumbnails: Vec::new(),
            thumbnails_ready: false,
            chosen_thumbnail: None,
            thumbnail_pending: false,
            metadata: VideoMetadata::default(),
            remote_video_id: None,
            upload_progress: UploadProgress::default(),
            last_error: None,
            uploading: false,
            submitting: false,
            attempt: 0,
            cancel: None,
        }
    }
}

impl UploadSession {
    pub fn step(&self) -> Step {
        self.step
    }

    pub fn selected_file(&self) -> Option<&SelectedFile> {
        self.selected_file.as_ref()
    }

    pub fn generated_thumbnails(&self) -> &[Thumbnail] {
        &self.generated_thumbnails
    }

    pub fn thumbnails_ready(&self) -> bool {
        self.thumbnails_ready
    }

    pub fn chosen_thumbnail(&self) -> Option<&ThumbnailChoice> {
        self.chosen_thumbnail.as_ref()
    }

    pub fn metadata(&self) -> &VideoMetadata {
        &self.metadata
    }

    pub fn remote_video_id(&self) -> Option<&RemoteVideoId> {
        self.remote_video_id.as_ref()
    }

    pub fn upload_progress(&self) -> UploadProgress {
        self.upload_progress
    }

    pub fn last_error(&self) -> Option<&WorkflowError> {
        self.last_error.as_ref()
    }

    pub fn is_uploading(&self) -> bool {
        self.uploading
    }

    /// `[ready]` in the state diagram: a file is held and thumbnail
    /// generation has settled.
    pub fn is_ready_to_upload(&self) -> bool {
        self.step == Step::Select && self.selected_file.is_some() && self.thumbnails_ready
    }

    pub(crate) fn thumbnail_ref(&self) -> Option<ThumbnailRef> {
        match self.chosen_thumbnail.as_ref()? {
            ThumbnailChoice::Generated(index) => self
                .generated_thumbnails
                .get(*index)
                .map(|thumbnail| ThumbnailRef::Frame {
                    offset_ms: thumbnail.offset.as_millis() as u64,
                }),
            ThumbnailChoice::Custom(_) => Some(ThumbnailRef::Custom),
        }
    }

    /// Metadata schema plus the thumbnail requirement of the details step.
    pub(crate) fn validate_details(&self) -> Result<ThumbnailRef, DetailsError> {
        let mut fields = self.metadata.problems();
        let thumbnail = self.thumbnail_ref();
        if thumbnail.is_none() {
            fields.push(FieldError::new("thumbnail", "choose a thumbnail"));
        }
        match thumbnail {
            Some(thumbnail) if fields.is_empty() => Ok(thumbnail),
            _ => Err(DetailsError { fields }),
        }
    }

    pub(crate) fn release_file(&mut self) {
        self.selected_file = None;
        self.generated_thumbnails.clear();
        self.thumbnails_ready = false;
        if matches!(self.chosen_thumbnail, Some(ThumbnailChoice::Generated(_))) {
            self.chosen_thumbnail = None;
        }
    }
}
