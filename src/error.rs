//! Error taxonomy shared by every layer of the engine.

use std::fmt;
use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Which storage operation an I/O error came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoErrorKind {
    Read,
    Write,
    Fsync,
    Truncate,
    Delete,
    Access,
    Lock,
    Close,
}

impl fmt::Display for IoErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            IoErrorKind::Read => "read",
            IoErrorKind::Write => "write",
            IoErrorKind::Fsync => "fsync",
            IoErrorKind::Truncate => "truncate",
            IoErrorKind::Delete => "delete",
            IoErrorKind::Access => "access",
            IoErrorKind::Lock => "lock",
            IoErrorKind::Close => "close",
        };
        f.write_str(name)
    }
}

/// Primary result code of an [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    Busy,
    Locked,
    IoErr,
    Corrupt,
    Full,
    CantOpen,
    Misuse,
    NotADatabase,
    ReadOnly,
}

/// Errors surfaced by the pager, the B-tree and the file layer.
#[derive(Error, Debug)]
pub enum Error {
    #[error("database is busy")]
    Busy,

    #[error("database handle is locked by another thread")]
    Locked,

    #[error("disk I/O error ({kind}): {source}")]
    Io {
        kind: IoErrorKind,
        #[source]
        source: io::Error,
    },

    #[error("database disk image is malformed: {0}")]
    Corrupt(String),

    #[error("database or disk is full")]
    Full,

    #[error("unable to open database file '{}'", path.display())]
    CantOpen {
        path: PathBuf,
        #[source]
        source: Option<io::Error>,
    },

    #[error("library routine called out of sequence: {0}")]
    Misuse(String),

    #[error("file is not a database")]
    NotADatabase,

    #[error("attempt to write a readonly database")]
    ReadOnly,
}

impl Error {
    pub fn io(kind: IoErrorKind, source: io::Error) -> Self {
        if kind == IoErrorKind::Write && is_disk_full(&source) {
            return Error::Full;
        }
        Error::Io { kind, source }
    }

    pub fn corrupt(detail: impl Into<String>) -> Self {
        Error::Corrupt(detail.into())
    }

    pub fn misuse(detail: impl Into<String>) -> Self {
        Error::Misuse(detail.into())
    }

    pub fn cant_open(path: impl Into<PathBuf>, source: Option<io::Error>) -> Self {
        Error::CantOpen {
            path: path.into(),
            source,
        }
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            Error::Busy => ErrorCode::Busy,
            Error::Locked => ErrorCode::Locked,
            Error::Io { .. } => ErrorCode::IoErr,
            Error::Corrupt(_) => ErrorCode::Corrupt,
            Error::Full => ErrorCode::Full,
            Error::CantOpen { .. } => ErrorCode::CantOpen,
            Error::Misuse(_) => ErrorCode::Misuse,
            Error::NotADatabase => ErrorCode::NotADatabase,
            Error::ReadOnly => ErrorCode::ReadOnly,
        }
    }

    /// The I/O sub-kind, when this is an I/O error.
    pub fn io_kind(&self) -> Option<IoErrorKind> {
        match self {
            Error::Io { kind, .. } => Some(*kind),
            _ => None,
        }
    }

    /// Lock contention can be retried; everything else is a hard failure
    /// of the current operation.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Busy | Error::Locked)
    }
}

fn is_disk_full(err: &io::Error) -> bool {
    #[cfg(unix)]
    {
        if err.raw_os_error() == Some(libc::ENOSPC) {
            return true;
        }
    }
    err.kind() == io::ErrorKind::StorageFull
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;
