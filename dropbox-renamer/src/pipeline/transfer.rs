use std::io;
use std::path::Path;
use std::time::Duration;

use futures_util::StreamExt;
use tempfile::NamedTempFile;
use thiserror::Error;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

use super::content_hash::ContentHasher;
use super::remote::{ByteStream, RemoteError};
use super::retry::Retryable;

#[derive(Debug, Error)]
pub enum TransferError {
    #[error(transparent)]
    Remote(#[from] RemoteError),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("download integrity check failed: expected {expected}, got {actual}")]
    IntegrityMismatch { expected: String, actual: String },
    #[error("download cancelled")]
    Cancelled,
}

impl Retryable for TransferError {
    fn is_transient(&self) -> bool {
        match self {
            TransferError::Remote(err) => err.is_transient(),
            // A corrupted body is worth fetching again.
            TransferError::IntegrityMismatch { .. } => true,
            TransferError::Io(_) | TransferError::Cancelled => false,
        }
    }

    fn retry_after(&self) -> Option<Duration> {
        match self {
            TransferError::Remote(err) => err.retry_after(),
            _ => None,
        }
    }
}

const STAGING_SUFFIX: &str = ".partial";

/// Streams `stream` into a fresh staging file next to `target`, verifies the
/// Dropbox content hash when one is expected, syncs, then moves it to `target`.
/// Returns the number of bytes written.
///
/// The staging file is created exclusively under a random name and is removed
/// whenever the call fails. The final move refuses to replace an existing
/// `target`, so no file already on disk is ever truncated or overwritten.
pub async fn write_atomically(
    stream: ByteStream,
    target: &Path,
    expected_hash: Option<&str>,
    cancel: &CancellationToken,
) -> Result<u64, TransferError> {
    let dir = match target.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    tokio::fs::create_dir_all(dir).await?;

    let (file, staged) = staging_file(dir, target)?.into_parts();
    let written = write_staged(stream, File::from_std(file), expected_hash, cancel).await?;
    staged.persist_noclobber(target).map_err(|err| {
        tracing::warn!(path = %target.display(), error = %err.error, "could not move download into place");
        err.error
    })?;
    Ok(written)
}

fn staging_file(dir: &Path, target: &Path) -> io::Result<NamedTempFile> {
    let name = target
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    let prefix = format!(".{name}.");
    tempfile::Builder::new()
        .prefix(&prefix)
        .suffix(STAGING_SUFFIX)
        .tempfile_in(dir)
}

/// Whether `name` is one of the staging files created by [`write_atomically`].
pub fn is_staging_name(name: &str) -> bool {
    name.starts_with('.') && name.ends_with(STAGING_SUFFIX)
}

async fn write_staged(
    mut stream: ByteStream,
    mut file: File,
    expected_hash: Option<&str>,
    cancel: &CancellationToken,
) -> Result<u64, TransferError> {
    let mut hasher = expected_hash.map(|_| ContentHasher::new());
    let mut written = 0u64;

    loop {
        let chunk = tokio::select! {
            _ = cancel.cancelled() => return Err(TransferError::Cancelled),
            chunk = stream.next() => chunk,
        };
        let Some(chunk) = chunk else { break };
        let chunk = chunk?;
        file.write_all(&chunk).await?;
        if let Some(hasher) = hasher.as_mut() {
            hasher.update(&chunk);
        }
        written += chunk.len() as u64;
    }

    file.flush().await?;
    file.sync_all().await?;

    if let (Some(expected), Some(hasher)) = (expected_hash, hasher) {
        let actual = hasher.finalize();
        if !actual.eq_ignore_ascii_case(expected) {
            return Err(TransferError::IntegrityMismatch {
                expected: expected.to_ascii_lowercase(),
                actual,
            });
        }
    }
    Ok(written)
}
