//! [`RemoteStore`] backed by the Dropbox HTTP API.

use async_trait::async_trait;
use dropbox_core::{ApiErrorClass, DropboxClient, DropboxError, FileDownload, Metadata};
use futures_util::StreamExt;
use futures_util::stream;

use super::descriptor::FileDescriptor;
use super::remote::{
    ByteStream, ListingPage, PageRequest, RemoteEntry, RemoteError, RemoteFile, RemoteStore,
};

pub struct DropboxRemote {
    client: DropboxClient,
    page_limit: Option<u32>,
}

impl DropboxRemote {
    pub fn new(client: DropboxClient) -> Self {
        Self {
            client,
            page_limit: None,
        }
    }

    /// Caps entries per listing page; Dropbox treats the value as a hint.
    pub fn with_page_limit(mut self, limit: u32) -> Self {
        self.page_limit = Some(limit);
        self
    }
}

impl From<DropboxError> for RemoteError {
    fn from(err: DropboxError) -> Self {
        let message = err.to_string();
        match err.classification() {
            ApiErrorClass::Auth => RemoteError::Auth(message),
            ApiErrorClass::NotFound => RemoteError::NotFound(message),
            ApiErrorClass::Permission => RemoteError::Permission(message),
            ApiErrorClass::Quota => RemoteError::Quota(message),
            ApiErrorClass::RateLimit => RemoteError::RateLimited {
                retry_after: err.retry_after(),
                message,
            },
            ApiErrorClass::Transient => RemoteError::Transient(message),
            ApiErrorClass::Permanent => RemoteError::Other(message),
        }
    }
}

fn to_entry(metadata: Metadata) -> RemoteEntry {
    match metadata {
        Metadata::File(file) => {
            let path = file
                .path_display
                .or(file.path_lower)
                .unwrap_or_else(|| format!("/{}", file.name));
            RemoteEntry::File(RemoteFile {
                id: file.id,
                path,
                name: file.name,
                size: file.size,
                server_modified: file.server_modified,
                client_modified: file.client_modified,
                content_hash: file.content_hash,
                rev: file.rev,
            })
        }
        Metadata::Folder(folder) => RemoteEntry::Folder {
            path: folder.path_display.or(folder.path_lower).unwrap_or(folder.name),
        },
        Metadata::Deleted(deleted) => RemoteEntry::Deleted {
            path: deleted
                .path_display
                .or(deleted.path_lower)
                .unwrap_or(deleted.name),
        },
    }
}

fn body_stream(download: FileDownload) -> ByteStream {
    stream::unfold(Some(download), |state| async move {
        let mut download = state?;
        match download.chunk().await {
            Ok(Some(chunk)) => Some((Ok(chunk), Some(download))),
            Ok(None) => None,
            // The status was already accepted, so a failure here is a cut connection.
            Err(err) => Some((Err(RemoteError::Transient(err.to_string())), None)),
        }
    })
    .boxed()
}

#[async_trait]
impl RemoteStore for DropboxRemote {
    async fn list_page(&self, request: PageRequest<'_>) -> Result<ListingPage, RemoteError> {
        let result = match request {
            PageRequest::Start { folder, recursive } => {
                self.client
                    .list_folder(folder, recursive, self.page_limit)
                    .await?
            }
            PageRequest::Continue { cursor } => self.client.list_folder_continue(cursor).await?,
        };
        Ok(ListingPage {
            entries: result.entries.into_iter().map(to_entry).collect(),
            cursor: Some(result.cursor),
            has_more: result.has_more,
        })
    }

    async fn download(&self, file: &FileDescriptor) -> Result<ByteStream, RemoteError> {
        let download = self.client.download(&file.remote_path).await?;
        let resolved_id = download.metadata.as_ref().map(|meta| meta.id.as_str());
        if let Some(got) = resolved_id.filter(|id| *id != file.id) {
            tracing::debug!(
                expected = %file.id,
                got = %got,
                path = %file.remote_path,
                "download resolved to a different file id"
            );
        }
        Ok(body_stream(download))
    }
}
