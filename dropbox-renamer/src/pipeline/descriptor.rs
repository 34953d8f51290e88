use time::OffsetDateTime;

/// Where a descriptor's modification time came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimestampSource {
    Server,
    Client,
    /// Neither remote timestamp was usable; the listing time was used instead.
    Discovered,
}

/// Metadata for one remote file. Immutable once listed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileDescriptor {
    pub id: String,
    pub remote_path: String,
    pub name: String,
    pub size: u64,
    pub modified: OffsetDateTime,
    pub modified_source: TimestampSource,
    pub content_hash: Option<String>,
    pub rev: Option<String>,
    /// Parent folder relative to the source folder, `/`-separated; empty at the top level.
    pub relative_dir: String,
}
