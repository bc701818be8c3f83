use thiserror::Error;

pub type RelayResult<T> = Result<T, RelayError>;

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("manifest line {line}: expected `<hex-digest>  <filename>`, got {content:?}")]
    MalformedManifestLine { line: usize, content: String },

    #[error("manifest line {line}: digest has {actual} hex chars, expected {expected}")]
    InvalidDigestLength {
        line: usize,
        expected: usize,
        actual: usize,
    },

    #[error("unsafe chunk filename {0:?}: must be a bare name inside the chunks directory")]
    UnsafeChunkName(String),

    #[error("origin {base}: chunk index {index} appears more than once")]
    DuplicateChunkIndex { base: String, index: u32 },

    #[error("origin {base}: manifest lists both the whole file and split parts")]
    ConflictingOrigin { base: String },

    /// `missing` lists the first absent indexes; `count` is the full tally
    #[error("origin {base}: incomplete, {count} part(s) missing, starting with {missing:?}")]
    IncompleteGroup {
        base: String,
        count: u64,
        missing: Vec<u32>,
    },

    #[error("origin {base}: chunk {chunk} rejected ({reason}), re-fetch it")]
    ChunkRejected {
        base: String,
        chunk: String,
        reason: String,
    },

    #[error("fetch failed for {name}: {reason}")]
    FetchFailed { name: String, reason: String },

    #[error("remote delete failed for {name}: {reason}")]
    DeleteFailed { name: String, reason: String },

    #[error("remote store rejected credentials: {0}")]
    AuthFailed(String),

    #[error("run cancelled")]
    Cancelled,

    #[error("config error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl RelayError {
    /// Errors that must stop the whole run rather than a single chunk or group.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            RelayError::MalformedManifestLine { .. }
                | RelayError::InvalidDigestLength { .. }
                | RelayError::UnsafeChunkName(_)
                | RelayError::DuplicateChunkIndex { .. }
                | RelayError::ConflictingOrigin { .. }
                | RelayError::AuthFailed(_)
                | RelayError::Cancelled
        )
    }
}
