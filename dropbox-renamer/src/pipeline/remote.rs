//! Typed boundary between the pipeline and a remote storage service.
//!
//! Everything the enumerator and orchestrator know about the remote side goes
//! through [`RemoteStore`]; transport and HTTP details stay in the adapter.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::BoxStream;
use thiserror::Error;

use super::descriptor::FileDescriptor;

pub type ByteStream = BoxStream<'static, Result<Bytes, RemoteError>>;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RemoteError {
    #[error("authentication rejected: {0}")]
    Auth(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("permission denied: {0}")]
    Permission(String),
    #[error("quota exceeded: {0}")]
    Quota(String),
    #[error("rate limited: {message}")]
    RateLimited {
        retry_after: Option<Duration>,
        message: String,
    },
    #[error("transient failure: {0}")]
    Transient(String),
    #[error("remote error: {0}")]
    Other(String),
}

impl RemoteError {
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            RemoteError::Transient(_) | RemoteError::RateLimited { .. }
        )
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            RemoteError::RateLimited { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageRequest<'a> {
    Start { folder: &'a str, recursive: bool },
    Continue { cursor: &'a str },
}

/// A listed file before timestamp normalization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteFile {
    pub id: String,
    pub path: String,
    pub name: String,
    pub size: u64,
    pub server_modified: Option<String>,
    pub client_modified: Option<String>,
    pub content_hash: Option<String>,
    pub rev: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteEntry {
    File(RemoteFile),
    Folder { path: String },
    Deleted { path: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListingPage {
    pub entries: Vec<RemoteEntry>,
    pub cursor: Option<String>,
    pub has_more: bool,
}

#[async_trait]
pub trait RemoteStore: Send + Sync {
    async fn list_page(&self, request: PageRequest<'_>) -> Result<ListingPage, RemoteError>;

    async fn download(&self, file: &FileDescriptor) -> Result<ByteStream, RemoteError>;
}
