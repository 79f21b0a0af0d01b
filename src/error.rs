//! Error codes and the crate-wide `Result` alias.
//!
//! Codes split into two families the callers care about: retryable
//! (`Busy`, `Locked` — another connection holds a lock, try again) and
//! fatal-to-the-transaction (`Corrupt`, the `IoErr*` group — the caller
//! must roll back; no partial recovery is attempted).

use std::fmt;

/// Primary result codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ErrorCode {
    /// Successful result (never carried by an `Error`)
    Ok = 0,
    /// Generic error
    Error = 1,
    /// Internal logic error
    Internal = 2,
    /// Access permission denied
    Perm = 3,
    /// Callback requested an abort
    Abort = 4,
    /// A file-level lock could not be obtained
    Busy = 5,
    /// A table-level lock conflict inside a shared cache
    Locked = 6,
    /// Allocation failed
    NoMem = 7,
    /// Attempt to write a readonly database
    ReadOnly = 8,
    /// Operation interrupted
    Interrupt = 9,
    /// Disk I/O error (see sub-codes)
    IoErr = 10,
    /// The database disk image is malformed
    Corrupt = 11,
    /// Item not found (file control, registry lookups)
    NotFound = 12,
    /// Database or rowid space is full
    Full = 13,
    /// Unable to open the database file
    CantOpen = 14,
    /// Database lock protocol error
    Protocol = 15,
    /// Schema changed under a prepared statement
    Schema = 17,
    /// String or blob exceeds size limit
    TooBig = 18,
    /// Constraint violation
    Constraint = 19,
    /// Data type mismatch
    Mismatch = 20,
    /// Library used incorrectly
    Misuse = 21,
    /// Parameter out of range
    Range = 25,
    /// File opened that is not a database file
    NotADb = 26,
    /// I/O error during read
    IoErrRead = 266,
    /// Read returned fewer bytes than requested
    IoErrShortRead = 522,
    /// I/O error during write
    IoErrWrite = 778,
    /// I/O error during fsync
    IoErrFsync = 1034,
    /// I/O error during truncate
    IoErrTruncate = 1546,
    /// I/O error while acquiring an advisory lock
    IoErrLock = 3850,
    /// I/O error while releasing an advisory lock
    IoErrUnlock = 2058,
    /// I/O error while deleting a file
    IoErrDelete = 2570,
    /// I/O error while testing file existence
    IoErrAccess = 3338,
}

impl ErrorCode {
    /// Human-readable description, matching the classic message strings.
    pub fn message(self) -> &'static str {
        match self {
            ErrorCode::Ok => "not an error",
            ErrorCode::Error => "SQL logic error",
            ErrorCode::Internal => "internal logic error",
            ErrorCode::Perm => "access permission denied",
            ErrorCode::Abort => "query aborted",
            ErrorCode::Busy => "database is locked",
            ErrorCode::Locked => "database table is locked",
            ErrorCode::NoMem => "out of memory",
            ErrorCode::ReadOnly => "attempt to write a readonly database",
            ErrorCode::Interrupt => "interrupted",
            ErrorCode::IoErr
            | ErrorCode::IoErrRead
            | ErrorCode::IoErrShortRead
            | ErrorCode::IoErrWrite
            | ErrorCode::IoErrFsync
            | ErrorCode::IoErrTruncate
            | ErrorCode::IoErrLock
            | ErrorCode::IoErrUnlock
            | ErrorCode::IoErrDelete
            | ErrorCode::IoErrAccess => "disk I/O error",
            ErrorCode::Corrupt => "database disk image is malformed",
            ErrorCode::NotFound => "unknown operation",
            ErrorCode::Full => "database or disk is full",
            ErrorCode::CantOpen => "unable to open database file",
            ErrorCode::Protocol => "locking protocol",
            ErrorCode::Schema => "database schema has changed",
            ErrorCode::TooBig => "string or blob too big",
            ErrorCode::Constraint => "constraint failed",
            ErrorCode::Mismatch => "datatype mismatch",
            ErrorCode::Misuse => "bad parameter or other API misuse",
            ErrorCode::Range => "column index out of range",
            ErrorCode::NotADb => "file is not a database",
        }
    }

    /// The primary code with any sub-code stripped.
    pub fn primary(self) -> ErrorCode {
        match self {
            ErrorCode::IoErrRead
            | ErrorCode::IoErrShortRead
            | ErrorCode::IoErrWrite
            | ErrorCode::IoErrFsync
            | ErrorCode::IoErrTruncate
            | ErrorCode::IoErrLock
            | ErrorCode::IoErrUnlock
            | ErrorCode::IoErrDelete
            | ErrorCode::IoErrAccess => ErrorCode::IoErr,
            other => other,
        }
    }
}

/// An error raised by the storage engine.
#[derive(Debug, Clone)]
pub struct Error {
    pub code: ErrorCode,
    pub message: Option<String>,
}

impl Error {
    pub fn new(code: ErrorCode) -> Self {
        Error {
            code,
            message: None,
        }
    }

    pub fn with_message<S: Into<String>>(code: ErrorCode, message: S) -> Self {
        Error {
            code,
            message: Some(message.into()),
        }
    }

    /// True for codes a caller may retry after backing off (`Busy`,
    /// `Locked`). Everything else requires rolling back the transaction.
    pub fn is_retryable(&self) -> bool {
        matches!(self.code, ErrorCode::Busy | ErrorCode::Locked)
    }

    /// True for the `IoErr` family, sub-codes included.
    pub fn is_io(&self) -> bool {
        self.code.primary() == ErrorCode::IoErr
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.message {
            Some(msg) => write!(f, "{} ({})", self.code.message(), msg),
            None => write!(f, "{}", self.code.message()),
        }
    }
}

impl std::error::Error for Error {}

impl From<ErrorCode> for Error {
    fn from(code: ErrorCode) -> Self {
        Error::new(code)
    }
}

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_split() {
        assert!(Error::new(ErrorCode::Busy).is_retryable());
        assert!(Error::new(ErrorCode::Locked).is_retryable());
        assert!(!Error::new(ErrorCode::Corrupt).is_retryable());
        assert!(!Error::new(ErrorCode::IoErrWrite).is_retryable());
    }

    #[test]
    fn test_io_subcodes_share_primary() {
        assert_eq!(ErrorCode::IoErrFsync.primary(), ErrorCode::IoErr);
        assert_eq!(ErrorCode::IoErrShortRead.primary(), ErrorCode::IoErr);
        assert_eq!(ErrorCode::Busy.primary(), ErrorCode::Busy);
        assert!(Error::new(ErrorCode::IoErrLock).is_io());
    }

    #[test]
    fn test_display_with_and_without_message() {
        let plain = Error::new(ErrorCode::Busy);
        assert_eq!(format!("{}", plain), "database is locked");
        let detailed = Error::with_message(ErrorCode::Corrupt, "page 7: cell overrun");
        assert_eq!(
            format!("{}", detailed),
            "database disk image is malformed (page 7: cell overrun)"
        );
    }
}
