//! Page-by-page listing of a remote folder into [`FileDescriptor`]s.

use std::collections::HashSet;
use std::sync::Arc;

use thiserror::Error;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tokio_util::sync::CancellationToken;

use super::descriptor::{FileDescriptor, TimestampSource};
use super::paths::{is_excluded, relative_dir};
use super::remote::{PageRequest, RemoteEntry, RemoteError, RemoteFile, RemoteStore};
use super::retry::RetryPolicy;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ListingError {
    #[error("folder not found: {0}")]
    FolderNotFound(String),
    #[error("listing rejected credentials: {0}")]
    Auth(String),
    #[error("listing failed after {attempts} attempt(s): {error}")]
    Remote { error: RemoteError, attempts: u32 },
    #[error("listing cancelled")]
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Position {
    Start,
    Continue(String),
    Done,
}

pub struct ListingEnumerator<S: RemoteStore + ?Sized> {
    store: Arc<S>,
    folder: String,
    recursive: bool,
    excluded: Vec<String>,
    retry: RetryPolicy,
    cancel: CancellationToken,
    position: Position,
    seen: HashSet<String>,
    discovered_at: OffsetDateTime,
}

impl<S: RemoteStore + ?Sized> ListingEnumerator<S> {
    /// `folder` is an API path; the root folder is the empty string.
    pub fn new(
        store: Arc<S>,
        folder: impl Into<String>,
        recursive: bool,
        retry: RetryPolicy,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            store,
            folder: folder.into(),
            recursive,
            excluded: Vec::new(),
            retry,
            cancel,
            position: Position::Start,
            seen: HashSet::new(),
            discovered_at: OffsetDateTime::now_utc(),
        }
    }

    /// Folder names whose contents are skipped in recursive listings.
    pub fn with_excluded(mut self, excluded: Vec<String>) -> Self {
        self.excluded = excluded;
        self
    }

    /// Next batch of new descriptors, or `None` once the listing is complete.
    /// A page whose entries were all filtered yields an empty batch.
    pub async fn next_page(&mut self) -> Result<Option<Vec<FileDescriptor>>, ListingError> {
        if self.position != Position::Done && self.cancel.is_cancelled() {
            self.position = Position::Done;
            return Err(ListingError::Cancelled);
        }
        let request = match &self.position {
            Position::Done => return Ok(None),
            Position::Start => PageRequest::Start {
                folder: &self.folder,
                recursive: self.recursive,
            },
            Position::Continue(cursor) => PageRequest::Continue { cursor },
        };
        let label = match request {
            PageRequest::Start { .. } => "list_folder",
            PageRequest::Continue { .. } => "list_folder/continue",
        };

        let store = &self.store;
        let outcome = self
            .retry
            .run(label, &self.cancel, |_| store.list_page(request))
            .await;
        let page = match outcome {
            Ok(retried) => retried.value,
            Err(failure) => {
                self.position = Position::Done;
                return Err(self.listing_error(failure.error, failure.attempts));
            }
        };

        let entries = page.entries.len();
        self.position = match (page.has_more, page.cursor) {
            (true, Some(cursor)) => Position::Continue(cursor),
            (true, None) => {
                tracing::warn!(folder = %self.folder, "listing reported more entries without a cursor");
                Position::Done
            }
            (false, _) => Position::Done,
        };

        let mut batch = Vec::new();
        for entry in page.entries {
            let RemoteEntry::File(file) = entry else {
                continue;
            };
            if let Some(descriptor) = self.descriptor_for(file) {
                batch.push(descriptor);
            }
        }
        tracing::debug!(
            folder = %self.folder,
            entries,
            new_files = batch.len(),
            has_more = matches!(self.position, Position::Continue(_)),
            "listed page"
        );
        Ok(Some(batch))
    }

    /// Drains every remaining page.
    pub async fn collect_all(&mut self) -> Result<Vec<FileDescriptor>, ListingError> {
        let mut all = Vec::new();
        while let Some(batch) = self.next_page().await? {
            all.extend(batch);
        }
        Ok(all)
    }

    fn listing_error(&self, error: RemoteError, attempts: u32) -> ListingError {
        if self.cancel.is_cancelled() {
            return ListingError::Cancelled;
        }
        match error {
            RemoteError::NotFound(_) => ListingError::FolderNotFound(self.folder.clone()),
            RemoteError::Auth(message) => ListingError::Auth(message),
            error => ListingError::Remote { error, attempts },
        }
    }

    fn descriptor_for(&mut self, mut file: RemoteFile) -> Option<FileDescriptor> {
        let id = if file.id.is_empty() {
            file.path.to_lowercase()
        } else {
            std::mem::take(&mut file.id)
        };
        if self.seen.contains(&id) {
            return None;
        }

        let relative = if self.recursive {
            relative_dir(&self.folder, &file.path).unwrap_or_else(|| {
                tracing::warn!(path = %file.path, folder = %self.folder, "entry outside source folder");
                String::new()
            })
        } else {
            String::new()
        };
        if self.recursive && is_excluded(&relative, &self.excluded) {
            tracing::debug!(path = %file.path, "skipping entry in excluded folder");
            return None;
        }

        let (modified, modified_source) = self.modified_time(&file);
        self.seen.insert(id.clone());
        Some(FileDescriptor {
            id,
            remote_path: file.path,
            name: file.name,
            size: file.size,
            modified,
            modified_source,
            content_hash: file.content_hash,
            rev: file.rev,
            relative_dir: relative,
        })
    }

    fn modified_time(&self, file: &RemoteFile) -> (OffsetDateTime, TimestampSource) {
        let parse = |value: Option<&String>| {
            value.and_then(|raw| OffsetDateTime::parse(raw, &Rfc3339).ok())
        };
        if let Some(at) = parse(file.server_modified.as_ref()) {
            return (at, TimestampSource::Server);
        }
        if let Some(at) = parse(file.client_modified.as_ref()) {
            tracing::warn!(path = %file.path, "server_modified unusable, using client_modified");
            return (at, TimestampSource::Client);
        }
        tracing::warn!(path = %file.path, "no usable modification time, using discovery time");
        (self.discovered_at, TimestampSource::Discovered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::backoff::Backoff;
    use crate::pipeline::remote::{ByteStream, ListingPage};
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::time::Duration;

    /// Serves scripted listing responses in order and records the requests.
    #[derive(Default)]
    struct ScriptedStore {
        responses: Mutex<VecDeque<Result<ListingPage, RemoteError>>>,
        requests: Mutex<Vec<String>>,
    }

    impl ScriptedStore {
        fn new(responses: Vec<Result<ListingPage, RemoteError>>) -> Arc<Self> {
            Arc::new(Self {
                responses: Mutex::new(responses.into()),
                requests: Mutex::default(),
            })
        }

        fn requests(&self) -> Vec<String> {
            self.requests.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl RemoteStore for ScriptedStore {
        async fn list_page(&self, request: PageRequest<'_>) -> Result<ListingPage, RemoteError> {
            let label = match request {
                PageRequest::Start { folder, recursive } => format!("start {folder} {recursive}"),
                PageRequest::Continue { cursor } => format!("continue {cursor}"),
            };
            self.requests.lock().unwrap().push(label);
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(RemoteError::Other("script exhausted".into())))
        }

        async fn download(&self, _file: &FileDescriptor) -> Result<ByteStream, RemoteError> {
            Err(RemoteError::Other("not used".into()))
        }
    }

    fn file(id: &str, path: &str) -> RemoteEntry {
        let name = path.rsplit('/').next().unwrap_or(path).to_string();
        RemoteEntry::File(RemoteFile {
            id: id.into(),
            path: path.into(),
            name,
            size: 10,
            server_modified: Some("2024-03-01T10:00:00Z".into()),
            client_modified: None,
            content_hash: None,
            rev: None,
        })
    }

    fn page(entries: Vec<RemoteEntry>, cursor: &str, has_more: bool) -> Result<ListingPage, RemoteError> {
        Ok(ListingPage {
            entries,
            cursor: Some(cursor.into()),
            has_more,
        })
    }

    fn fast_retry(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::new(
            max_attempts,
            Backoff::new(Duration::from_millis(1), Duration::from_millis(1), false),
        )
    }

    fn enumerator(store: Arc<ScriptedStore>, recursive: bool) -> ListingEnumerator<ScriptedStore> {
        ListingEnumerator::new(
            store,
            "/Invoices",
            recursive,
            fast_retry(3),
            CancellationToken::new(),
        )
    }

    #[tokio::test]
    async fn overlapping_pages_are_deduplicated() {
        let store = ScriptedStore::new(vec![
            page(vec![file("id:1", "/Invoices/1.pdf"), file("id:2", "/Invoices/2.pdf")], "c1", true),
            page(vec![file("id:2", "/Invoices/2.pdf"), file("id:3", "/Invoices/3.pdf")], "c2", false),
        ]);
        let ids: Vec<_> = enumerator(store.clone(), false)
            .collect_all()
            .await
            .unwrap()
            .into_iter()
            .map(|d| d.id)
            .collect();

        assert_eq!(ids, vec!["id:1", "id:2", "id:3"]);
        assert_eq!(store.requests(), vec!["start /Invoices false", "continue c1"]);
    }

    #[tokio::test]
    async fn empty_folder_is_an_empty_listing() {
        let store = ScriptedStore::new(vec![page(vec![], "c0", false)]);
        let mut listing = enumerator(store, false);
        assert_eq!(listing.next_page().await.unwrap(), Some(vec![]));
        assert_eq!(listing.next_page().await.unwrap(), None);
    }

    #[tokio::test]
    async fn folders_and_deleted_entries_are_not_yielded() {
        let store = ScriptedStore::new(vec![page(
            vec![
                RemoteEntry::Folder {
                    path: "/Invoices/2023".into(),
                },
                RemoteEntry::Deleted {
                    path: "/Invoices/gone.pdf".into(),
                },
                file("id:a", "/Invoices/a.pdf"),
            ],
            "c",
            false,
        )]);
        let all = enumerator(store, false).collect_all().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].name, "a.pdf");
        assert_eq!(all[0].relative_dir, "");
    }

    #[tokio::test]
    async fn recursive_listing_keeps_relative_dirs_and_skips_excluded() {
        let store = ScriptedStore::new(vec![page(
            vec![
                file("id:a", "/Invoices/2023/Q4/a.pdf"),
                file("id:b", "/Invoices/DEAD file/b.pdf"),
                file("id:c", "/invoices/c.pdf"),
            ],
            "c",
            false,
        )]);
        let all = enumerator(store.clone(), true)
            .with_excluded(vec!["DEAD file".into()])
            .collect_all()
            .await
            .unwrap();

        let dirs: Vec<_> = all
            .iter()
            .map(|d| (d.id.as_str(), d.relative_dir.as_str()))
            .collect();
        assert_eq!(dirs, vec![("id:a", "2023/Q4"), ("id:c", "")]);
        assert_eq!(store.requests(), vec!["start /Invoices true"]);
    }

    #[tokio::test]
    async fn missing_folder_is_reported_distinctly() {
        let store = ScriptedStore::new(vec![Err(RemoteError::NotFound(
            "path/not_found/".into(),
        ))]);
        let err = enumerator(store.clone(), false)
            .collect_all()
            .await
            .expect_err("folder is missing");
        assert_eq!(err, ListingError::FolderNotFound("/Invoices".into()));
        assert_eq!(store.requests().len(), 1);
    }

    #[tokio::test]
    async fn transient_page_failures_are_retried() {
        let store = ScriptedStore::new(vec![
            page(vec![file("id:1", "/Invoices/1.pdf")], "c1", true),
            Err(RemoteError::Transient("503".into())),
            page(vec![file("id:2", "/Invoices/2.pdf")], "c2", false),
        ]);
        let all = enumerator(store.clone(), false).collect_all().await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(
            store.requests(),
            vec!["start /Invoices false", "continue c1", "continue c1"]
        );
    }

    #[tokio::test]
    async fn exhausted_retries_surface_after_earlier_pages() {
        let store = ScriptedStore::new(vec![
            page(vec![file("id:1", "/Invoices/1.pdf")], "c1", true),
            Err(RemoteError::Transient("503".into())),
            Err(RemoteError::Transient("503".into())),
            Err(RemoteError::Transient("503".into())),
        ]);
        let mut listing = enumerator(store, false);
        assert_eq!(listing.next_page().await.unwrap().map(|b| b.len()), Some(1));
        let err = listing.next_page().await.expect_err("retries exhausted");
        assert!(matches!(err, ListingError::Remote { attempts: 3, .. }));
        assert_eq!(listing.next_page().await.unwrap(), None);
    }

    #[tokio::test]
    async fn timestamps_fall_back_in_order() {
        let mut client_only = RemoteFile {
            id: "id:c".into(),
            path: "/Invoices/c.pdf".into(),
            name: "c.pdf".into(),
            size: 1,
            server_modified: Some("garbage".into()),
            client_modified: Some("2023-12-31T23:59:59Z".into()),
            content_hash: None,
            rev: None,
        };
        let listing = enumerator(ScriptedStore::new(vec![]), false);
        let (at, source) = listing.modified_time(&client_only);
        assert_eq!(source, TimestampSource::Client);
        assert_eq!(at, time::macros::datetime!(2023-12-31 23:59:59 UTC));

        client_only.client_modified = None;
        let (at, source) = listing.modified_time(&client_only);
        assert_eq!(source, TimestampSource::Discovered);
        assert_eq!(at, listing.discovered_at);
    }

    #[tokio::test]
    async fn descriptor_keeps_remote_id_and_server_time() {
        let store = ScriptedStore::new(vec![page(vec![file("id:a", "/Invoices/a.pdf")], "c", false)]);
        let all = enumerator(store, false).collect_all().await.unwrap();
        assert_eq!(all[0].id, "id:a");
        assert_eq!(all[0].remote_path, "/Invoices/a.pdf");
        assert_eq!(all[0].modified_source, TimestampSource::Server);
        assert_eq!(all[0].modified, time::macros::datetime!(2024-03-01 10:00:00 UTC));
    }

    #[tokio::test]
    async fn missing_id_falls_back_to_lowercased_path() {
        let store = ScriptedStore::new(vec![page(
            vec![file("", "/Invoices/Report.PDF"), file("", "/invoices/report.pdf")],
            "c",
            false,
        )]);
        let all = enumerator(store, false).collect_all().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].id, "/invoices/report.pdf");
    }
}
