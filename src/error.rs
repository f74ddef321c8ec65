use std::path::PathBuf;
use thiserror::Error;

/// Generic result type for surveyor operations
pub type Result<T> = core::result::Result<T, SurveyError>;

/**
Crate-wide error taxonomy.

Per-path walker failures are reported through the walk's error callback and
never abort the whole traversal; everything else propagates through
[`Result`]. The `ch` engine accumulates non-`ENOENT` failures into
[`SurveyError::Multiple`] and surfaces them once the run completes.
*/
#[derive(Debug, Error)]
pub enum SurveyError {
    /// An underlying syscall or write failed; carries the offending path where known
    #[error("{}: {source}", String::from_utf8_lossy(.path))]
    Io {
        path: Box<[u8]>,
        #[source]
        source: std::io::Error,
    },

    /// An absolute path plus one filename component exceeded the fixed path ceiling
    #[error("path too long ({len} bytes): {}", String::from_utf8_lossy(.path))]
    NameTooLong { path: Box<[u8]>, len: usize },

    /// Malformed rules TSV
    #[error("invalid rule on line {line}: {reason}")]
    InvalidRuleFormat { line: usize, reason: String },

    /// Malformed persisted rollup row
    #[error("invalid rollup row: {0}")]
    InvalidDgutaFormat(String),

    /// Queried directory absent from every opened store
    #[error("directory not found in any store: {}", String::from_utf8_lossy(.0))]
    NotFound(Box<[u8]>),

    /// A store file is already present at the target path
    #[error("store already exists: {}", .0.display())]
    AlreadyExists(PathBuf),

    /// The user cancelled the operation
    #[error("cancelled")]
    Cancelled,

    /// Duplicate submission at the output-files layer
    #[error("duplicate job: {0}")]
    DuplicateJob(String),

    /// Embedded KV store failure; opening a corrupt store lands here and is fatal
    #[error("store error: {0}")]
    Store(String),

    /// Several accumulated failures, reported together
    #[error("{} errors: [{}]", .0.len(), .0.iter().map(ToString::to_string).collect::<Vec<_>>().join("; "))]
    Multiple(Vec<SurveyError>),
}

impl SurveyError {
    /// Wrap an `io::Error` together with the path it concerned
    #[inline]
    pub fn io(path: &[u8], source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Wrap the current `errno` together with the path it concerned
    #[inline]
    pub fn last_os_error(path: &[u8]) -> Self {
        Self::io(path, std::io::Error::last_os_error())
    }
}

// redb exposes one error type per phase; collapse them all into `Store`,
// keeping the message (callers only distinguish fatal-vs-not).
macro_rules! impl_from_store_error {
    ($($err:ty),+ $(,)?) => {
        $(impl From<$err> for SurveyError {
            #[inline]
            fn from(e: $err) -> Self {
                Self::Store(e.to_string())
            }
        })+
    };
}

impl_from_store_error!(
    redb::DatabaseError,
    redb::TransactionError,
    redb::TableError,
    redb::StorageError,
    redb::CommitError,
);

impl From<std::io::Error> for SurveyError {
    #[inline]
    fn from(e: std::io::Error) -> Self {
        Self::Io {
            path: Box::default(),
            source: e,
        }
    }
}
