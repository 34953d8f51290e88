//! Local file names: `YYYY-MM-DD_<original name>` with collision avoidance.
//!
//! Dates are always rendered in UTC so the same remote file maps to the same
//! name on every machine. Candidates are tried in a fixed order:
//!
//! 1. `2024-03-01_report.pdf`
//! 2. `2024-03-01_101500_report.pdf`
//! 3. `2024-03-01_101500_report_1.pdf`, `_2`, ... up to the configured bound
//!
//! Names that already start with a date keep their original name, and only
//! gain a `_n` suffix on collision.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use thiserror::Error;
use time::macros::format_description;
use time::{OffsetDateTime, UtcOffset};

use super::descriptor::FileDescriptor;

pub const DEFAULT_MAX_DISAMBIGUATOR: u32 = 999;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum NameError {
    #[error("no free name for {name} in {dir:?} after {tried} candidates")]
    CollisionExhausted {
        name: String,
        dir: PathBuf,
        tried: u32,
    },
}

pub fn date_prefix(modified: OffsetDateTime) -> String {
    let utc = modified.to_offset(UtcOffset::UTC);
    utc.format(format_description!("[year]-[month]-[day]"))
        .unwrap_or_else(|_| utc.date().to_string())
}

fn time_of_day(modified: OffsetDateTime) -> String {
    let utc = modified.to_offset(UtcOffset::UTC);
    utc.format(format_description!("[hour][minute][second]"))
        .unwrap_or_else(|_| utc.time().to_string())
}

/// `YYYYMMDD` or `YYYY-MM-DD` (19xx/20xx) at the start, followed by a
/// separator or the end of the name.
pub fn has_date_prefix(name: &str) -> bool {
    let bytes = name.as_bytes();
    let century = |b: &[u8]| b.starts_with(b"19") || b.starts_with(b"20");
    let boundary = |at: usize| {
        bytes
            .get(at)
            .is_none_or(|b| b.is_ascii_whitespace() || *b == b'_')
    };
    let digits = |range: std::ops::Range<usize>| {
        bytes
            .get(range)
            .is_some_and(|part| part.iter().all(u8::is_ascii_digit))
    };

    let compact = digits(0..8) && century(bytes) && boundary(8);
    let dashed = digits(0..4)
        && bytes.get(4) == Some(&b'-')
        && digits(5..7)
        && bytes.get(7) == Some(&b'-')
        && digits(8..10)
        && century(bytes)
        && boundary(10);
    compact || dashed
}

fn split_extension(name: &str) -> (&str, Option<&str>) {
    match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => (stem, Some(ext)),
        _ => (name, None),
    }
}

fn with_suffix(prefix: &str, name: &str, n: u32) -> String {
    match split_extension(name) {
        (stem, Some(ext)) => format!("{prefix}{stem}_{n}.{ext}"),
        (stem, None) => format!("{prefix}{stem}_{n}"),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NameResolver {
    keep_existing_prefix: bool,
    max_disambiguator: u32,
}

impl NameResolver {
    pub fn new(keep_existing_prefix: bool, max_disambiguator: u32) -> Self {
        Self {
            keep_existing_prefix,
            max_disambiguator,
        }
    }

    fn keeps_name(&self, descriptor: &FileDescriptor) -> bool {
        self.keep_existing_prefix && has_date_prefix(&descriptor.name)
    }

    /// Candidate file names in preference order. Finite.
    pub fn candidates<'a>(
        &'a self,
        descriptor: &'a FileDescriptor,
    ) -> impl Iterator<Item = String> + 'a {
        let keeps = self.keeps_name(descriptor);
        let (base, timed) = if keeps {
            (descriptor.name.clone(), None)
        } else {
            let date = date_prefix(descriptor.modified);
            let timed = format!("{date}_{}_", time_of_day(descriptor.modified));
            (format!("{date}_{}", descriptor.name), Some(timed))
        };
        let suffix_prefix = timed.clone().unwrap_or_default();
        let name = descriptor.name.as_str();

        std::iter::once(base)
            .chain(timed.map(|prefix| format!("{prefix}{name}")))
            .chain((1..=self.max_disambiguator).map(move |n| with_suffix(&suffix_prefix, name, n)))
    }

    /// First candidate in `dir` that is neither assigned in this run nor present on disk.
    pub fn resolve(
        &self,
        dir: &Path,
        descriptor: &FileDescriptor,
        assigned: &HashSet<PathBuf>,
    ) -> Result<PathBuf, NameError> {
        let mut tried = 0u32;
        for name in self.candidates(descriptor) {
            tried += 1;
            let path = dir.join(name);
            if !assigned.contains(&path) && std::fs::symlink_metadata(&path).is_err() {
                return Ok(path);
            }
        }
        Err(NameError::CollisionExhausted {
            name: descriptor.name.clone(),
            dir: dir.to_path_buf(),
            tried,
        })
    }
}

impl Default for NameResolver {
    fn default() -> Self {
        Self::new(true, DEFAULT_MAX_DISAMBIGUATOR)
    }
}
