use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;

use super::descriptor::FileDescriptor;
use super::enumerator::ListingError;
use super::naming::NameError;
use super::remote::RemoteError;
use super::transfer::TransferError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// A file from an earlier run with the same content already exists.
    AlreadyPresent { path: PathBuf },
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    Auth,
    NotFound,
    Transient,
    RateLimited,
    Permission,
    Quota,
    LocalIo,
    NameCollisionExhausted,
    Integrity,
    Cancelled,
    Remote,
}

impl FailureKind {
    pub fn as_str(self) -> &'static str {
        match self {
            FailureKind::Auth => "auth",
            FailureKind::NotFound => "not_found",
            FailureKind::Transient => "transient",
            FailureKind::RateLimited => "rate_limited",
            FailureKind::Permission => "permission",
            FailureKind::Quota => "quota",
            FailureKind::LocalIo => "local_io",
            FailureKind::NameCollisionExhausted => "name_collision_exhausted",
            FailureKind::Integrity => "integrity",
            FailureKind::Cancelled => "cancelled",
            FailureKind::Remote => "remote",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<&RemoteError> for FailureKind {
    fn from(err: &RemoteError) -> Self {
        match err {
            RemoteError::Auth(_) => FailureKind::Auth,
            RemoteError::NotFound(_) => FailureKind::NotFound,
            RemoteError::Permission(_) => FailureKind::Permission,
            RemoteError::Quota(_) => FailureKind::Quota,
            RemoteError::RateLimited { .. } => FailureKind::RateLimited,
            RemoteError::Transient(_) => FailureKind::Transient,
            RemoteError::Other(_) => FailureKind::Remote,
        }
    }
}

impl From<&TransferError> for FailureKind {
    fn from(err: &TransferError) -> Self {
        match err {
            TransferError::Remote(remote) => remote.into(),
            TransferError::Io(_) => FailureKind::LocalIo,
            TransferError::IntegrityMismatch { .. } => FailureKind::Integrity,
            TransferError::Cancelled => FailureKind::Cancelled,
        }
    }
}

impl From<&NameError> for FailureKind {
    fn from(err: &NameError) -> Self {
        match err {
            NameError::CollisionExhausted { .. } => FailureKind::NameCollisionExhausted,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureRecord {
    pub kind: FailureKind,
    pub message: String,
    pub attempts: u32,
}

impl FailureRecord {
    pub fn new(kind: FailureKind, message: impl Into<String>, attempts: u32) -> Self {
        Self {
            kind,
            message: message.into(),
            attempts,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownloadOutcome {
    Succeeded { path: PathBuf, bytes_written: u64 },
    Skipped(SkipReason),
    Failed(FailureRecord),
}

/// Why a run stopped before every listed file was handled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Interruption {
    Listing(ListingError),
    Auth(String),
    LocalStorage { consecutive: u32 },
    Cancelled,
}

impl fmt::Display for Interruption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Interruption::Listing(err) => write!(f, "listing stopped early: {err}"),
            Interruption::Auth(message) => write!(f, "credentials rejected: {message}"),
            Interruption::LocalStorage { consecutive } => {
                write!(f, "stopped after {consecutive} consecutive local write failures")
            }
            Interruption::Cancelled => f.write_str("cancelled"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedFile {
    pub descriptor: FileDescriptor,
    pub failure: FailureRecord,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub succeeded: usize,
    pub skipped: usize,
    pub failed: usize,
    pub bytes_written: u64,
    pub failures: Vec<FailedFile>,
    pub interruption: Option<Interruption>,
}

impl RunSummary {
    pub fn total(&self) -> usize {
        self.succeeded + self.skipped + self.failed
    }

    pub fn is_success(&self) -> bool {
        self.failed == 0 && self.interruption.is_none()
    }

    pub fn exit_code(&self) -> u8 {
        if self.is_success() { 0 } else { 1 }
    }
}

/// Outcomes keyed by descriptor id. Recording the same id twice keeps the latest.
#[derive(Debug, Default)]
pub struct RunReport {
    outcomes: HashMap<String, (FileDescriptor, DownloadOutcome)>,
    interruption: Option<Interruption>,
}

impl RunReport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, descriptor: FileDescriptor, outcome: DownloadOutcome) {
        self.outcomes
            .insert(descriptor.id.clone(), (descriptor, outcome));
    }

    /// The first interruption wins; later ones are consequences of it.
    pub fn interrupt(&mut self, interruption: Interruption) {
        if self.interruption.is_none() {
            self.interruption = Some(interruption);
        }
    }

    pub fn interruption(&self) -> Option<&Interruption> {
        self.interruption.as_ref()
    }

    pub fn len(&self) -> usize {
        self.outcomes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outcomes.is_empty()
    }

    pub fn outcome(&self, id: &str) -> Option<&DownloadOutcome> {
        self.outcomes.get(id).map(|(_, outcome)| outcome)
    }

    pub fn summary(&self) -> RunSummary {
        summarize(
            self.outcomes.values().map(|(d, o)| (d, o)),
            self.interruption.clone(),
        )
    }
}

/// Folds outcomes into counts. Failures are listed in remote path order.
pub fn summarize<'a>(
    outcomes: impl IntoIterator<Item = (&'a FileDescriptor, &'a DownloadOutcome)>,
    interruption: Option<Interruption>,
) -> RunSummary {
    let mut summary = outcomes
        .into_iter()
        .fold(RunSummary::default(), |mut acc, (descriptor, outcome)| {
            match outcome {
                DownloadOutcome::Succeeded { bytes_written, .. } => {
                    acc.succeeded += 1;
                    acc.bytes_written += bytes_written;
                }
                DownloadOutcome::Skipped(_) => acc.skipped += 1,
                DownloadOutcome::Failed(failure) => {
                    acc.failed += 1;
                    acc.failures.push(FailedFile {
                        descriptor: descriptor.clone(),
                        failure: failure.clone(),
                    });
                }
            }
            acc
        });
    summary
        .failures
        .sort_by(|a, b| a.descriptor.remote_path.cmp(&b.descriptor.remote_path));
    summary.interruption = interruption;
    summary
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::descriptor::TimestampSource;
    use time::macros::datetime;

    fn descriptor(id: &str, path: &str) -> FileDescriptor {
        FileDescriptor {
            id: id.into(),
            remote_path: path.into(),
            name: path.rsplit('/').next().unwrap_or(path).into(),
            size: 3,
            modified: datetime!(2024-03-01 10:00:00 UTC),
            modified_source: TimestampSource::Server,
            content_hash: None,
            rev: None,
            relative_dir: String::new(),
        }
    }

    #[test]
    fn counts_each_outcome_kind() {
        let mut report = RunReport::new();
        report.record(
            descriptor("id:a", "/a.pdf"),
            DownloadOutcome::Succeeded {
                path: "/out/2024-03-01_a.pdf".into(),
                bytes_written: 3,
            },
        );
        report.record(
            descriptor("id:b", "/b.pdf"),
            DownloadOutcome::Succeeded {
                path: "/out/2024-03-01_b.pdf".into(),
                bytes_written: 5,
            },
        );
        report.record(
            descriptor("id:c", "/c.pdf"),
            DownloadOutcome::Skipped(SkipReason::Cancelled),
        );
        report.record(
            descriptor("id:d", "/d.pdf"),
            DownloadOutcome::Failed(FailureRecord::new(FailureKind::Quota, "full", 1)),
        );

        let summary = report.summary();
        assert_eq!(summary.succeeded, 2);
        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.total(), 4);
        assert_eq!(summary.bytes_written, 8);
        assert_eq!(summary.failures[0].descriptor.id, "id:d");
        assert_eq!(summary.failures[0].failure.kind, FailureKind::Quota);
        assert!(!summary.is_success());
        assert_eq!(summary.exit_code(), 1);
    }

    #[test]
    fn summary_does_not_depend_on_arrival_order() {
        let outcomes = vec![
            (
                descriptor("id:b", "/b.pdf"),
                DownloadOutcome::Failed(FailureRecord::new(FailureKind::NotFound, "gone", 1)),
            ),
            (
                descriptor("id:a", "/a.pdf"),
                DownloadOutcome::Failed(FailureRecord::new(FailureKind::Transient, "503", 5)),
            ),
        ];
        let forward = summarize(outcomes.iter().map(|(d, o)| (d, o)), None);
        let backward = summarize(outcomes.iter().rev().map(|(d, o)| (d, o)), None);
        assert_eq!(forward, backward);
        assert_eq!(forward.failures[0].descriptor.remote_path, "/a.pdf");
    }

    #[test]
    fn interruption_marks_run_incomplete() {
        let mut report = RunReport::new();
        report.record(
            descriptor("id:a", "/a.pdf"),
            DownloadOutcome::Skipped(SkipReason::AlreadyPresent {
                path: "/out/2024-03-01_a.pdf".into(),
            }),
        );
        assert!(report.summary().is_success());

        report.interrupt(Interruption::Cancelled);
        report.interrupt(Interruption::LocalStorage { consecutive: 5 });
        let summary = report.summary();
        assert_eq!(summary.interruption, Some(Interruption::Cancelled));
        assert_eq!(summary.exit_code(), 1);
    }

    #[test]
    fn listing_interruption_is_carried_into_summary() {
        let mut report = RunReport::new();
        report.interrupt(Interruption::Listing(ListingError::Remote {
            error: RemoteError::Transient("503".into()),
            attempts: 5,
        }));
        let first = report.summary();
        let second = first.clone();
        assert_eq!(first, report.summary());
        assert_eq!(second.exit_code(), 1);
        assert!(
            second
                .interruption
                .is_some_and(|i| i.to_string().contains("after 5 attempt(s)"))
        );
    }

    #[test]
    fn recording_same_id_twice_keeps_one_outcome() {
        let mut report = RunReport::new();
        let d = descriptor("id:a", "/a.pdf");
        report.record(d.clone(), DownloadOutcome::Skipped(SkipReason::Cancelled));
        report.record(
            d,
            DownloadOutcome::Succeeded {
                path: "/out/a".into(),
                bytes_written: 1,
            },
        );
        assert_eq!(report.len(), 1);
        assert_eq!(report.summary().succeeded, 1);
    }

    #[test]
    fn failure_kinds_follow_remote_errors() {
        let rate = RemoteError::RateLimited {
            retry_after: None,
            message: "slow".into(),
        };
        assert_eq!(FailureKind::from(&rate), FailureKind::RateLimited);
        let transfer = TransferError::Remote(RemoteError::Permission("no".into()));
        assert_eq!(FailureKind::from(&transfer), FailureKind::Permission);
        assert_eq!(
            FailureKind::from(&TransferError::Io(std::io::Error::other("disk"))),
            FailureKind::LocalIo
        );
    }
}
