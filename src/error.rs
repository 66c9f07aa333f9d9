use thiserror::Error;

/// Result type used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Key/data pair already exists
    #[error("key/data pair already exists")]
    KeyExist,
    /// Key/data pair not found
    #[error("key/data pair not found")]
    NotFound,
    /// Requested page not found - this usually indicates corruption
    #[error("requested page not found")]
    PageNotFound,
    /// Located page was wrong type
    #[error("located page was of the wrong type")]
    Corrupted,
    /// Update of meta page failed or environment had a fatal error
    #[error("update of meta page failed or environment had fatal error")]
    Panic,
    /// Environment file format version mismatch
    #[error("environment version mismatch")]
    VersionMismatch,
    /// File is not a valid database file
    #[error("file is not a valid database file")]
    Invalid,
    /// Environment mapsize reached
    #[error("environment mapsize limit reached")]
    MapFull,
    /// Environment maxdbs reached
    #[error("environment maxdbs limit reached")]
    DbsFull,
    /// Environment maxreaders reached
    #[error("environment maxreaders limit reached")]
    ReadersFull,
    /// Transaction has too many dirty pages, even after spilling
    #[error("transaction has too many dirty pages")]
    TxnFull,
    /// Cursor stack too deep - tree depth would exceed its limit
    #[error("cursor stack limit reached")]
    CursorFull,
    /// Page has not enough space. Internal: a split always follows.
    #[error("page has no more space")]
    PageFull,
    /// Database contents grew beyond this process's map size
    #[error("database contents grew beyond environment mapsize")]
    MapResized,
    /// Operation and DB incompatible, or DB type changed
    #[error("operation incompatible with the database flags")]
    Incompatible,
    /// Invalid reuse of a reader locktable slot
    #[error("invalid reuse of reader locktable slot")]
    BadReaderSlot,
    /// Transaction must abort, has a child, or is invalid
    #[error("transaction must abort, has a child, or is invalid")]
    BadTxn,
    /// Unsupported size of key, or wrong DUPFIXED data size
    #[error("unsupported size of key/DB name/data, or wrong DUPFIXED size")]
    BadValSize,
    /// The specified DBI handle was closed or altered unexpectedly
    #[error("the specified DBI handle was closed or is invalid")]
    BadDbi,
    /// An invalid parameter was specified
    #[error("invalid parameter")]
    InvalidArg,
    /// Couldn't open a backing file
    #[error("opening a backing file failed")]
    Open(#[source] std::io::Error),
    /// Couldn't lock a backing file
    #[error("failed to lock a backing file")]
    Lock(#[source] std::io::Error),
    /// An I/O operation on a backing file failed
    #[error("I/O on a backing file failed")]
    Io(#[source] std::io::Error),
    /// Couldn't synchronize to a backing file
    #[error("synchronizing to a backing file failed")]
    Sync(#[source] std::io::Error),
    /// Couldn't map or resize the backing file
    #[error("can't map the backing file. Wanted 0x{requested:x} bytes")]
    MapFailed {
        requested: usize,
        source: std::io::Error,
    },
}

impl Error {
    /// Stable integer identifier for this error.
    ///
    /// Engine-specific errors occupy a private range; OS-level errors
    /// report the underlying `errno` when one exists.
    pub fn code(&self) -> i32 {
        match self {
            Error::KeyExist => -30799,
            Error::NotFound => -30798,
            Error::PageNotFound => -30797,
            Error::Corrupted => -30796,
            Error::Panic => -30795,
            Error::VersionMismatch => -30794,
            Error::Invalid => -30793,
            Error::MapFull => -30792,
            Error::DbsFull => -30791,
            Error::ReadersFull => -30790,
            Error::TxnFull => -30788,
            Error::CursorFull => -30787,
            Error::PageFull => -30786,
            Error::MapResized => -30785,
            Error::Incompatible => -30784,
            Error::BadReaderSlot => -30783,
            Error::BadTxn => -30782,
            Error::BadValSize => -30781,
            Error::BadDbi => -30780,
            Error::InvalidArg => einval(),
            Error::Open(e) | Error::Lock(e) | Error::Io(e) | Error::Sync(e) => {
                e.raw_os_error().unwrap_or(-1)
            }
            Error::MapFailed { source, .. } => source.raw_os_error().unwrap_or(-1),
        }
    }

    /// Reconstruct an engine error from its stable code, if it is one.
    pub fn from_code(code: i32) -> Option<Error> {
        Some(match code {
            -30799 => Error::KeyExist,
            -30798 => Error::NotFound,
            -30797 => Error::PageNotFound,
            -30796 => Error::Corrupted,
            -30795 => Error::Panic,
            -30794 => Error::VersionMismatch,
            -30793 => Error::Invalid,
            -30792 => Error::MapFull,
            -30791 => Error::DbsFull,
            -30790 => Error::ReadersFull,
            -30788 => Error::TxnFull,
            -30787 => Error::CursorFull,
            -30786 => Error::PageFull,
            -30785 => Error::MapResized,
            -30784 => Error::Incompatible,
            -30783 => Error::BadReaderSlot,
            -30782 => Error::BadTxn,
            -30781 => Error::BadValSize,
            -30780 => Error::BadDbi,
            _ => return None,
        })
    }

    /// True for the errors a caller is expected to handle during normal
    /// operation rather than treat as a fault.
    pub fn is_miss(&self) -> bool {
        matches!(self, Error::NotFound | Error::KeyExist)
    }
}

#[cfg(unix)]
fn einval() -> i32 {
    libc::EINVAL
}

#[cfg(not(unix))]
fn einval() -> i32 {
    22
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_round_trip() {
        for code in -30799..=-30780 {
            if code == -30789 {
                // Gap in the historical numbering.
                assert!(Error::from_code(code).is_none());
                continue;
            }
            let err = Error::from_code(code).expect("known code");
            assert_eq!(err.code(), code);
        }
        assert!(Error::from_code(0).is_none());
    }
}
