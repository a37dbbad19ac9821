#![forbid(unsafe_code)]

//! Security helpers shared by the vidshare binaries and the provider client.

use anyhow::{Result, bail};
use nix::unistd::Uid;
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Fails fast when a binary is started as root.
pub fn ensure_not_root(process: &str) -> Result<()> {
    ensure_not_root_for(Uid::current(), process)
}

fn ensure_not_root_for(uid: Uid, process: &str) -> Result<()> {
    if uid.is_root() {
        bail!(
            "{process} must not be run as root; use a regular user or a dedicated service account"
        );
    }
    Ok(())
}

/// Signature the streaming provider expects on resumable uploads:
/// `hex(sha256(library_id + api_key + expires + video_id))`.
pub fn upload_signature(library_id: &str, api_key: &str, expires: i64, video_id: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(library_id.as_bytes());
    hasher.update(api_key.as_bytes());
    hasher.update(expires.to_string().as_bytes());
    hasher.update(video_id.as_bytes());
    hex::encode(hasher.finalize())
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AccessError {
    #[error("sign in required")]
    Anonymous,
    #[error("{user} does not own this resource")]
    NotOwner { user: String },
}

/// The identity comes from the auth provider and is trusted as-is; this only
/// compares it with the owner recorded in the catalog.
pub fn ensure_owner(user: Option<&str>, owner_id: &str) -> Result<(), AccessError> {
    match user {
        None => Err(AccessError::Anonymous),
        Some(user) if user == owner_id => Ok(()),
        Some(user) => Err(AccessError::NotOwner {
            user: user.to_string(),
        }),
    }
}
