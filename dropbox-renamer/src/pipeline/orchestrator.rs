//! Drives one run: listing, naming, downloading and reporting.
//!
//! The enumerator runs in its own task and hands descriptors over a bounded
//! channel. Downloads run in spawned tasks, at most `concurrency` at a time.
//! Every descriptor that leaves the enumerator comes back as exactly one
//! [`DownloadOutcome`], including when the run is cancelled.

use std::collections::HashSet;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use futures_util::FutureExt;
use futures_util::StreamExt;
use futures_util::stream::FuturesUnordered;
use thiserror::Error;
use time::OffsetDateTime;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::content_hash::hash_file;
use super::descriptor::FileDescriptor;
use super::enumerator::{ListingEnumerator, ListingError};
use super::naming::{NameError, NameResolver};
use super::paths::local_dir_for;
use super::remote::RemoteStore;
use super::report::{
    DownloadOutcome, FailureKind, FailureRecord, Interruption, RunReport, RunSummary, SkipReason,
};
use super::retry::RetryPolicy;
use super::transfer::write_atomically;
use crate::config::RunConfig;

#[derive(Debug, Error)]
pub enum RunError {
    #[error("source folder not found: {0}")]
    FolderNotFound(String),
    #[error("credentials rejected: {0}")]
    Auth(String),
    #[error(transparent)]
    Listing(ListingError),
    #[error("cannot create destination {path:?}: {source}")]
    Destination {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("listing task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl From<ListingError> for RunError {
    fn from(err: ListingError) -> Self {
        match err {
            ListingError::FolderNotFound(folder) => RunError::FolderNotFound(folder),
            ListingError::Auth(message) => RunError::Auth(message),
            err => RunError::Listing(err),
        }
    }
}

/// Per-file work: skip check, naming, download and atomic write.
pub struct Orchestrator<S: RemoteStore + ?Sized> {
    store: Arc<S>,
    destination: PathBuf,
    resolver: NameResolver,
    retry: RetryPolicy,
    assigned: Mutex<HashSet<PathBuf>>,
    cancel: CancellationToken,
}

impl<S: RemoteStore + ?Sized> Orchestrator<S> {
    pub fn new(
        store: Arc<S>,
        destination: PathBuf,
        resolver: NameResolver,
        retry: RetryPolicy,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            store,
            destination,
            resolver,
            retry,
            assigned: Mutex::new(HashSet::new()),
            cancel,
        }
    }

    pub fn destination(&self) -> &Path {
        &self.destination
    }

    pub async fn process(&self, descriptor: &FileDescriptor) -> DownloadOutcome {
        if self.cancel.is_cancelled() {
            return DownloadOutcome::Skipped(SkipReason::Cancelled);
        }
        let dir = match local_dir_for(&self.destination, &descriptor.relative_dir) {
            Ok(dir) => dir,
            Err(err) => {
                return DownloadOutcome::Failed(FailureRecord::new(
                    FailureKind::LocalIo,
                    err.to_string(),
                    0,
                ));
            }
        };

        if let Some(path) = self.find_existing_copy(&dir, descriptor).await {
            tracing::debug!(path = %path.display(), remote = %descriptor.remote_path, "already downloaded");
            return DownloadOutcome::Skipped(SkipReason::AlreadyPresent { path });
        }

        let target = match self.claim(&dir, descriptor) {
            Ok(target) => target,
            Err(err) => {
                let kind = FailureKind::from(&err);
                return DownloadOutcome::Failed(FailureRecord::new(kind, err.to_string(), 0));
            }
        };

        let expected_hash = descriptor.content_hash.as_deref();
        let target_path = target.as_path();
        let result = self
            .retry
            .run(&descriptor.remote_path, &self.cancel, |attempt| async move {
                tracing::debug!(remote = %descriptor.remote_path, attempt, "downloading");
                let stream = self.store.download(descriptor).await?;
                write_atomically(stream, target_path, expected_hash, &self.cancel).await
            })
            .await;

        match result {
            Ok(retried) => DownloadOutcome::Succeeded {
                path: target,
                bytes_written: retried.value,
            },
            Err(failure) => {
                self.release(&target);
                let kind = match FailureKind::from(&failure.error) {
                    FailureKind::Transient | FailureKind::RateLimited | FailureKind::Integrity
                        if self.cancel.is_cancelled() =>
                    {
                        FailureKind::Cancelled
                    }
                    kind => kind,
                };
                DownloadOutcome::Failed(FailureRecord::new(
                    kind,
                    failure.error.to_string(),
                    failure.attempts,
                ))
            }
        }
    }

    fn assigned(&self) -> MutexGuard<'_, HashSet<PathBuf>> {
        self.assigned
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn claim(&self, dir: &Path, descriptor: &FileDescriptor) -> Result<PathBuf, NameError> {
        let mut assigned = self.assigned();
        let path = self.resolver.resolve(dir, descriptor, &assigned)?;
        assigned.insert(path.clone());
        Ok(path)
    }

    fn release(&self, path: &Path) {
        self.assigned().remove(path);
    }

    /// A file left by an earlier run under one of this descriptor's candidate
    /// names with identical content. Candidates are filled in order, so the
    /// search stops at the first free name.
    async fn find_existing_copy(&self, dir: &Path, descriptor: &FileDescriptor) -> Option<PathBuf> {
        let expected = descriptor.content_hash.as_deref()?;
        for name in self.resolver.candidates(descriptor) {
            let path = dir.join(name);
            if self.assigned().contains(&path) {
                continue;
            }
            let Ok(metadata) = tokio::fs::metadata(&path).await else {
                break;
            };
            if !metadata.is_file() || metadata.len() != descriptor.size {
                continue;
            }
            match hash_file(&path).await {
                Ok(actual) if actual.eq_ignore_ascii_case(expected) => return Some(path),
                Ok(_) => {}
                Err(err) => {
                    tracing::warn!(path = %path.display(), error = %err, "could not hash existing file");
                }
            }
        }
        None
    }
}

/// Tracks outcomes that stop the run early.
struct Tally {
    report: RunReport,
    consecutive_local: u32,
    local_limit: u32,
}

impl Tally {
    fn record(
        &mut self,
        descriptor: FileDescriptor,
        outcome: DownloadOutcome,
        cancel: &CancellationToken,
    ) {
        let local_failure =
            matches!(&outcome, DownloadOutcome::Failed(f) if f.kind == FailureKind::LocalIo);
        if !local_failure {
            self.consecutive_local = 0;
        }
        match &outcome {
            DownloadOutcome::Succeeded {
                path,
                bytes_written,
            } => {
                tracing::debug!(
                    remote = %descriptor.remote_path,
                    path = %path.display(),
                    bytes = bytes_written,
                    "downloaded"
                );
            }
            DownloadOutcome::Skipped(_) => {}
            DownloadOutcome::Failed(failure) => {
                tracing::error!(
                    remote = %descriptor.remote_path,
                    kind = %failure.kind,
                    attempts = failure.attempts,
                    error = %failure.message,
                    "download failed"
                );
                match failure.kind {
                    FailureKind::Auth => {
                        self.report
                            .interrupt(Interruption::Auth(failure.message.clone()));
                        cancel.cancel();
                    }
                    FailureKind::LocalIo => {
                        self.consecutive_local += 1;
                        if self.local_limit > 0 && self.consecutive_local >= self.local_limit {
                            self.report.interrupt(Interruption::LocalStorage {
                                consecutive: self.consecutive_local,
                            });
                            cancel.cancel();
                        }
                    }
                    _ => {}
                }
            }
        }
        self.report.record(descriptor, outcome);
    }
}

/// Runs the whole pipeline for `config` and returns the summary.
///
/// Fails before any download when the folder is missing, the credentials are
/// rejected, or the first listing page cannot be fetched. Later listing
/// failures only mark the summary as interrupted.
pub async fn run<S>(
    store: Arc<S>,
    config: &RunConfig,
    cancel: CancellationToken,
) -> Result<RunSummary, RunError>
where
    S: RemoteStore + ?Sized + 'static,
{
    let destination = config.destination_dir(OffsetDateTime::now_utc());
    tokio::fs::create_dir_all(&destination)
        .await
        .map_err(|source| RunError::Destination {
            path: destination.clone(),
            source,
        })?;

    let retry = config.retry.policy();
    let orchestrator = Arc::new(Orchestrator::new(
        Arc::clone(&store),
        destination,
        config.name_resolver(),
        retry,
        cancel.clone(),
    ));
    let workers = config.worker_limit();
    tracing::info!(
        folder = %config.source_folder,
        destination = %orchestrator.destination().display(),
        recursive = config.recursive,
        workers,
        "starting run"
    );

    let (tx, mut rx) = mpsc::channel::<FileDescriptor>(workers * 4);
    let mut enumerator = ListingEnumerator::new(
        store,
        config.source_folder.clone(),
        config.recursive,
        retry,
        cancel.clone(),
    )
    .with_excluded(config.excluded_folders.clone());
    let lister = tokio::spawn(async move {
        let mut yielded = 0usize;
        loop {
            match enumerator.next_page().await {
                Ok(Some(batch)) => {
                    for descriptor in batch {
                        if tx.send(descriptor).await.is_err() {
                            return (yielded, None);
                        }
                        yielded += 1;
                    }
                }
                Ok(None) => return (yielded, None),
                Err(err) => return (yielded, Some(err)),
            }
        }
    });

    let mut tally = Tally {
        report: RunReport::new(),
        consecutive_local: 0,
        local_limit: config.max_consecutive_local_failures,
    };
    let mut in_flight = FuturesUnordered::new();
    let mut listing_open = true;

    loop {
        tokio::select! {
            Some((descriptor, outcome)) = in_flight.next(), if !in_flight.is_empty() => {
                tally.record(descriptor, outcome, &cancel);
            }
            received = rx.recv(), if listing_open && in_flight.len() < workers => {
                let Some(descriptor) = received else {
                    listing_open = false;
                    continue;
                };
                let worker = Arc::clone(&orchestrator);
                let fallback = descriptor.clone();
                let task = tokio::spawn(async move {
                    let outcome = worker.process(&descriptor).await;
                    (descriptor, outcome)
                });
                in_flight.push(task.map(move |joined| {
                    joined.unwrap_or_else(|err| {
                        let message = format!("worker task failed: {err}");
                        let record = FailureRecord::new(FailureKind::Remote, message, 0);
                        (fallback, DownloadOutcome::Failed(record))
                    })
                }));
            }
            else => break,
        }
    }

    let (yielded, listing_error) = lister.await?;
    let mut report = tally.report;
    match listing_error {
        Some(ListingError::Cancelled) => report.interrupt(Interruption::Cancelled),
        Some(err) if yielded == 0 && report.interruption().is_none() => return Err(err.into()),
        Some(err) => {
            tracing::error!(error = %err, yielded, "listing stopped early");
            report.interrupt(Interruption::Listing(err));
        }
        None => {}
    }
    if cancel.is_cancelled() {
        report.interrupt(Interruption::Cancelled);
    }

    let summary = report.summary();
    tracing::info!(
        listed = yielded,
        succeeded = summary.succeeded,
        skipped = summary.skipped,
        failed = summary.failed,
        bytes = summary.bytes_written,
        "run finished"
    );
    Ok(summary)
}
