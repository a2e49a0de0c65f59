/// Top-level error type for one ingestion run. Anything that reaches the
/// caller as an `IngestError` aborted the run; recoverable problems are
/// recorded as [`crate::book::Diagnostic`]s instead.
#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("Format detection failed: {0}")]
    Detect(#[from] DetectError),

    #[error("Read error: {0}")]
    Read(#[from] ReadError),

    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("Security violation: {0}")]
    Security(#[from] SecurityError),

    #[error("Source file is no longer available: {path}")]
    SourceUnavailable { path: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum SecurityError {
    #[error("Archive entry {entry} expands {ratio}x, over the security.max_compression_ratio limit of {limit}x")]
    ZipBomb { entry: String, ratio: u64, limit: u64 },

    #[error("Archive entry {path} points outside the book")]
    PathTraversal { path: String },

    #[error("Archive has {count} entries, over the limit of {limit}")]
    TooManyFiles { count: u64, limit: u64 },

    #[error("{name} is {size_mb} MB, over the {limit_mb} MB limit for a single source file or entry")]
    OversizedResource {
        name: String,
        size_mb: u64,
        limit_mb: u64,
    },

    #[error("Book would unpack to {extracted_mb} MB, over the security.max_file_size_mb limit of {limit_mb} MB")]
    ArchiveTooLarge { extracted_mb: u64, limit_mb: u64 },

    #[error("Book is DRM protected ({drm_type})")]
    DrmProtected { drm_type: String },
}

#[derive(Debug, thiserror::Error)]
pub enum DetectError {
    #[error("Unsupported source format: {0}")]
    Unsupported(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum ReadError {
    /// The container could not be opened or its package document located.
    #[error("Corrupt EPUB archive: {detail}")]
    CorruptArchive { detail: String },

    /// No candidate encoding decoded the text with a tolerable error rate.
    #[error("Unsupported text encoding: {detail}")]
    UnsupportedEncoding { detail: String },

    #[error("Missing archive entry: {0}")]
    MissingEntry(String),

    #[error(transparent)]
    Security(#[from] SecurityError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl ReadError {
    pub(crate) fn corrupt(detail: impl Into<String>) -> Self {
        ReadError::CorruptArchive {
            detail: detail.into(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("No cached book at {0}")]
    Missing(String),

    #[error("Cached book at {path} is corrupted: {detail}")]
    Corrupted { path: String, detail: String },

    #[error("Refusing to cache an inconsistent book: {0}")]
    Inconsistent(String),

    #[error("Failed to serialize book record: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid config file {path}: {detail}")]
    Invalid { path: String, detail: String },

    #[error("Unknown split strategy '{0}' (expected headings, patterns or blank-runs)")]
    UnknownStrategy(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
