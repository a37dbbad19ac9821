//! Typed failures surfaced by the upload workflow.

use std::fmt;

use serde::Serialize;
use thiserror::Error;

use crate::session::Step;

/// Rejections from `set_file`. The flow stays at the select step.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FileError {
    #[error("{name} is not a video (detected {mime})")]
    UnsupportedType { name: String, mime: String },
    #[error("{name} is {size} bytes; the upload limit is {max} bytes")]
    TooLarge { name: String, size: u64, max: u64 },
    #[error("cannot read {path}: {message}")]
    Unreadable { path: String, message: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldError {
    pub field: &'static str,
    pub message: String,
}

impl FieldError {
    pub fn new(field: &'static str, message: impl Into<String>) -> Self {
        Self {
            field,
            message: message.into(),
        }
    }
}

impl fmt::Display for FieldError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Every field problem found in one validation pass.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("video details are invalid ({})", join_fields(.fields))]
pub struct DetailsError {
    pub fields: Vec<FieldError>,
}

impl DetailsError {
    pub fn field(&self, name: &str) -> Option<&FieldError> {
        self.fields.iter().find(|error| error.field == name)
    }
}

fn join_fields(fields: &[FieldError]) -> String {
    fields
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProviderError {
    #[error("provider rejected {operation} with HTTP {status}: {body}")]
    Status {
        operation: &'static str,
        status: u16,
        body: String,
    },
    #[error("network error during {operation}: {message}")]
    Transport {
        operation: &'static str,
        message: String,
    },
    #[error("unexpected provider response to {operation}: {message}")]
    Decode {
        operation: &'static str,
        message: String,
    },
}

impl ProviderError {
    /// Network failures, server errors, locks and conflicts are worth retrying;
    /// other 4xx answers will not change on their own.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transport { .. } => true,
            Self::Status { status, .. } => *status >= 500 || matches!(status, 409 | 423 | 429),
            Self::Decode { .. } => false,
        }
    }

    pub fn is_gone(&self) -> bool {
        matches!(self, Self::Status { status: 404 | 410, .. })
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum UploadError {
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error("upload cancelled")]
    Cancelled,
    #[error("cannot read the selected file: {0}")]
    Source(String),
}

/// Everything an operator can see in `last_error` or get back from a
/// controller call.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum WorkflowError {
    #[error(transparent)]
    File(#[from] FileError),
    #[error(transparent)]
    Details(#[from] DetailsError),
    #[error(transparent)]
    Upload(#[from] UploadError),
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error("saving video details failed: {0}")]
    Catalog(String),
    #[error("{operation} is not available at the {step} step")]
    InvalidStep { operation: &'static str, step: Step },
    #[error("no file selected")]
    NoFile,
    #[error("thumbnail #{0} was not generated")]
    UnknownThumbnail(usize),
    #[error("the remote video has not been created yet")]
    MissingRemoteVideo,
    #[error("processing confirmation stopped: {0}")]
    Interrupted(String),
}

impl WorkflowError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Upload(UploadError::Cancelled))
    }

    /// A provider failure that may succeed when the upload is retried.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Upload(UploadError::Provider(err)) | Self::Provider(err) => err.is_transient(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn details_error_lists_every_field() {
        let err = DetailsError {
            fields: vec![
                FieldError::new("title", "required"),
                FieldError::new("category_id", "required"),
            ],
        };
        let text = err.to_string();
        assert!(text.contains("title: required"));
        assert!(text.contains("category_id: required"));
        assert_eq!(err.field("title").unwrap().message, "required");
        assert!(err.field("tags").is_none());
    }

    #[test]
    fn transient_classification() {
        let transport = ProviderError::Transport {
            operation: "patch",
            message: "reset".into(),
        };
        let server = ProviderError::Status {
            operation: "patch",
            status: 502,
            body: String::new(),
        };
        let locked = ProviderError::Status {
            operation: "patch",
            status: 423,
            body: String::new(),
        };
        let forbidden = ProviderError::Status {
            operation: "patch",
            status: 403,
            body: String::new(),
        };
        assert!(transport.is_transient());
        assert!(server.is_transient());
        assert!(locked.is_transient());
        assert!(!forbidden.is_transient());
    }

    #[test]
    fn workflow_errors_expose_transient_provider_failures() {
        let reset = ProviderError::Transport {
            operation: "patch",
            message: "reset".into(),
        };
        assert!(WorkflowError::from(UploadError::Provider(reset.clone())).is_transient());
        assert!(WorkflowError::from(reset).is_transient());
        assert!(!WorkflowError::from(UploadError::Cancelled).is_transient());
        assert!(!WorkflowError::from(UploadError::Source("gone".into())).is_transient());
        assert!(!WorkflowError::NoFile.is_transient());
    }

    #[test]
    fn gone_uploads_are_detected() {
        let gone = ProviderError::Status {
            operation: "head",
            status: 410,
            body: String::new(),
        };
        assert!(gone.is_gone());
        assert!(!gone.is_transient());
    }

    #[test]
    fn cancelled_is_recognised_through_conversion() {
        let err: WorkflowError = UploadError::Cancelled.into();
        assert!(err.is_cancelled());
    }
}
