pub mod backoff;
pub mod content_hash;
pub mod descriptor;
pub mod dropbox;
pub mod enumerator;
pub mod naming;
pub mod orchestrator;
pub mod paths;
pub mod remote;
pub mod report;
pub mod retry;
pub mod transfer;

pub use descriptor::{FileDescriptor, TimestampSource};
pub use dropbox::DropboxRemote;
pub use orchestrator::{Orchestrator, RunError, run};
pub use remote::{RemoteError, RemoteStore};
pub use report::{DownloadOutcome, FailureKind, Interruption, RunSummary, SkipReason};
