//! Error types for file handle operations.

use std::io;
use std::sync::Arc;

use thiserror::Error;

/// Result type alias for file handle operations.
pub type FileResult<T> = Result<T, FileError>;

/// Coarse classification of a [`FileError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FileErrorKind {
    /// The path could not be opened (missing, permission denied, bad flags).
    Open,
    /// The descriptor no longer matches the file at the path.
    StaleHandle,
    /// The advisory lock stayed unavailable for the whole retry budget.
    LockContention,
    /// The call violated a precondition of the handle.
    InvalidOperation,
    /// A memory mapping could not be created.
    Mapping,
    /// An OS-level I/O call failed.
    Io,
}

/// Error variants for file handle operations.
///
/// Errors are cheap to clone so that the same value can be returned to the
/// caller and kept as the handle's last error.
#[derive(Debug, Clone, Error)]
pub enum FileError {
    /// Opening the path failed.
    #[error("Failed to open {path}: {source}")]
    Open {
        /// The path that was being opened.
        path: String,
        /// The underlying OS error.
        source: Arc<io::Error>,
    },

    /// The file was replaced on disk and could not be recovered.
    #[error("Stale handle for {path}: file was replaced on disk during locking")]
    StaleHandle {
        /// The path whose identity kept changing.
        path: String,
    },

    /// The lock could not be acquired within the retry budget.
    #[error("Lock contention on {path}: gave up after {attempts} attempts")]
    LockContention {
        /// The contended path.
        path: String,
        /// Number of lock attempts made, including the first one.
        attempts: u32,
    },

    /// The handle has no open descriptor.
    #[error("File handle for {path} is not open")]
    NotOpen {
        /// The path of the closed handle.
        path: String,
    },

    /// The requested operation is not permitted by the open mode.
    #[error("Invalid operation on {path}: {reason}")]
    InvalidOperation {
        /// The path of the handle.
        path: String,
        /// Why the operation was rejected.
        reason: &'static str,
    },

    /// The requested range cannot be mapped.
    #[error("Invalid map range on {path}: offset {offset}, length {length}, file size {file_size}")]
    InvalidRange {
        /// The path of the handle.
        path: String,
        /// Requested start offset.
        offset: u64,
        /// Requested length in bytes.
        length: u64,
        /// File size at the time of the request.
        file_size: u64,
    },

    /// The OS refused to create the mapping.
    #[error("Mapping failed on {path}: {source}")]
    Mapping {
        /// The path of the handle.
        path: String,
        /// The underlying OS error.
        source: Arc<io::Error>,
    },

    /// Wraps OS-level I/O errors.
    #[error("I/O error: {0}")]
    Io(#[source] Arc<io::Error>),
}

impl FileError {
    /// Returns the taxonomy bucket of this error.
    pub fn kind(&self) -> FileErrorKind {
        match self {
            FileError::Open { .. } => FileErrorKind::Open,
            FileError::StaleHandle { .. } => FileErrorKind::StaleHandle,
            FileError::LockContention { .. } => FileErrorKind::LockContention,
            FileError::NotOpen { .. } | FileError::InvalidOperation { .. } => {
                FileErrorKind::InvalidOperation
            }
            FileError::InvalidRange { .. } | FileError::Mapping { .. } => FileErrorKind::Mapping,
            FileError::Io(_) => FileErrorKind::Io,
        }
    }

    /// Returns the platform error code, if this error came from the OS.
    pub fn raw_os_error(&self) -> Option<i32> {
        match self {
            FileError::Open { source, .. } | FileError::Mapping { source, .. } => {
                source.raw_os_error()
            }
            FileError::Io(err) => err.raw_os_error(),
            _ => None,
        }
    }

    pub(crate) fn open(path: &str, err: io::Error) -> Self {
        FileError::Open {
            path: path.to_string(),
            source: Arc::new(err),
        }
    }

    pub(crate) fn mapping(path: &str, err: io::Error) -> Self {
        FileError::Mapping {
            path: path.to_string(),
            source: Arc::new(err),
        }
    }

    /// Error reported by descriptor-based queries on a closed handle.
    pub(crate) fn bad_descriptor() -> Self {
        FileError::Io(Arc::new(io::Error::from_raw_os_error(libc::EBADF)))
    }
}

impl From<io::Error> for FileError {
    fn from(err: io::Error) -> Self {
        FileError::Io(Arc::new(err))
    }
}
