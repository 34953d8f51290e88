use std::path::PathBuf;
use std::time::Duration;

use time::OffsetDateTime;

use crate::pipeline::backoff::Backoff;
use crate::pipeline::naming::{DEFAULT_MAX_DISAMBIGUATOR, NameResolver};
use crate::pipeline::paths::run_folder_name;
use crate::pipeline::retry::{DEFAULT_MAX_ATTEMPTS, RetryPolicy};

pub const DEFAULT_DEST_DIR: &str = "Customers";
pub const DEFAULT_CONCURRENCY: usize = 4;
pub const DEFAULT_EXCLUDED_FOLDER: &str = "DEAD file";
pub const DEFAULT_MAX_CONSECUTIVE_LOCAL_FAILURES: u32 = 5;
const DEFAULT_BASE_DELAY_MS: u64 = 500;
const DEFAULT_MAX_DELAY_SECS: u64 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryConfig {
    /// Total calls per operation, the first one included.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter: bool,
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.max_attempts,
            Backoff::new(self.base_delay, self.max_delay, self.jitter),
        )
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay: Duration::from_millis(DEFAULT_BASE_DELAY_MS),
            max_delay: Duration::from_secs(DEFAULT_MAX_DELAY_SECS),
            jitter: true,
        }
    }
}

/// Everything one run needs. Built by the binary; the pipeline never reads
/// the environment itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunConfig {
    /// Dropbox API path of the source folder; `""` is the account root.
    pub source_folder: String,
    pub destination_root: PathBuf,
    pub recursive: bool,
    pub concurrency: usize,
    pub retry: RetryConfig,
    pub max_disambiguator: u32,
    /// Keep names that already start with a date instead of prefixing them again.
    pub keep_existing_prefix: bool,
    pub excluded_folders: Vec<String>,
    /// Write into `dropbox_download_<stamp>` below the destination root.
    pub run_subfolder: bool,
    /// Stop after this many local write failures in a row; 0 never stops.
    pub max_consecutive_local_failures: u32,
}

impl RunConfig {
    pub fn new(source_folder: impl Into<String>, destination_root: impl Into<PathBuf>) -> Self {
        Self {
            source_folder: source_folder.into(),
            destination_root: destination_root.into(),
            ..Self::default()
        }
    }

    pub fn destination_dir(&self, started_at: OffsetDateTime) -> PathBuf {
        if self.run_subfolder {
            self.destination_root.join(run_folder_name(started_at))
        } else {
            self.destination_root.clone()
        }
    }

    pub fn name_resolver(&self) -> NameResolver {
        NameResolver::new(self.keep_existing_prefix, self.max_disambiguator)
    }

    pub fn worker_limit(&self) -> usize {
        self.concurrency.max(1)
    }
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            source_folder: String::new(),
            destination_root: PathBuf::from(DEFAULT_DEST_DIR),
            recursive: false,
            concurrency: DEFAULT_CONCURRENCY,
            retry: RetryConfig::default(),
            max_disambiguator: DEFAULT_MAX_DISAMBIGUATOR,
            keep_existing_prefix: true,
            excluded_folders: vec![DEFAULT_EXCLUDED_FOLDER.to_string()],
            run_subfolder: false,
            max_consecutive_local_failures: DEFAULT_MAX_CONSECUTIVE_LOCAL_FAILURES,
        }
    }
}
