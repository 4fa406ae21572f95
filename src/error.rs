//! Error types for the sync core.

use std::path::PathBuf;

/// Invalid offsets or lengths handed to a piece table.
///
/// These are programming errors at the call site and are never recovered.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RangeError {
    #[error("offset {offset} is outside document of length {len}")]
    OutOfBounds { offset: usize, len: usize },
    #[error("invalid range {start}..{end} for document of length {len}")]
    InvalidRange { start: usize, end: usize, len: usize },
    #[error("offset {0} is not on a UTF-8 character boundary")]
    NotCharBoundary(usize),
    #[error("invalid piece table snapshot: {0}")]
    InvalidSnapshot(String),
}

/// Errors surfaced by the tracker, observer and session.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error(transparent)]
    Range(#[from] RangeError),
    /// Disk read/write/stat failure. Recoverable: the tracker keeps its last
    /// known state and retries on the next observer signal.
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("path is not tracked: {0}")]
    NotTracked(PathBuf),
    #[error("path is already tracked: {0}")]
    AlreadyTracked(PathBuf),
    /// Local content is edited as text, so tracked bytes must be UTF-8.
    #[error("{0} is not valid UTF-8")]
    InvalidUtf8(PathBuf),
    /// A background feature could not be set up. Degrades, never fatal.
    #[error("capability unavailable: {0}")]
    Capability(String),
    #[error("observer error: {0}")]
    Observer(#[from] notify::Error),
    #[error("state file error: {0}")]
    StateFile(String),
}

impl SyncError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        SyncError::Io {
            path: path.into(),
            source,
        }
    }

    /// Whether the tracker state is still valid after this error.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            SyncError::Io { .. } | SyncError::Capability(_) | SyncError::InvalidUtf8(_)
        )
    }
}
