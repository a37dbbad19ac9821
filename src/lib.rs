//! vidshare: upload workflow, streaming-provider plumbing and the catalog
//! behind the video sharing backend.

pub mod cache;
pub mod catalog;
pub mod config;
pub mod controller;
pub mod error;
pub mod polling;
pub mod progress;
pub mod provider;
pub mod security;
pub mod session;
pub mod thumbnails;
pub mod transfer;
pub mod view;

pub use controller::{UploadConfig, UploadController, UploadServices};
pub use error::WorkflowError;
pub use session::{Step, UploadSession};
