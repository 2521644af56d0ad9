//! The single error kind shared by every vfskit crate.
//!
//! Every fallible operation in the virtual filesystem and fiber kernel
//! returns one of these. There is no per-error payload: callers that need
//! more context (a path, a handle number) attach it themselves at the
//! call site, the way the underlying C library this is modeled on passes
//! back a bare status code.

#![cfg_attr(not(feature = "std"), no_std)]

use thiserror::Error;

/// Closed set of failure reasons. Adding a variant is a breaking change:
/// callers are expected to match on all of them, not wildcard through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum ErrorKind {
    /// Not actually an error; placeholder for APIs that report a status
    /// alongside a successful result.
    #[error("no error")]
    None,
    /// Generic I/O failure from a backing device or host.
    #[error("I/O error")]
    Io,
    /// A caller-supplied argument was malformed (bad mode, null handle).
    #[error("invalid argument")]
    Invalid,
    /// A bounded wait expired before the operation could complete.
    #[error("timed out")]
    TimedOut,
    /// The resource is currently in use and cannot be acquired right now.
    #[error("busy")]
    Busy,
    /// A non-blocking poll found nothing ready.
    #[error("would block")]
    Again,
    /// The object being waited on was destroyed while a fiber waited on it.
    #[error("canceled")]
    Canceled,
    /// Allocation from a pool or heap failed.
    #[error("out of memory")]
    NoMemory,
    /// The target already exists (exclusive create, rename onto existing).
    #[error("already exists")]
    Exist,
    /// The producer/consumer side is not ready (empty queue on a
    /// non-blocking receive, full queue on a non-blocking send).
    #[error("not ready")]
    NotReady,
    /// Permission was denied.
    #[error("access denied")]
    Access,
    /// No such file, directory or mount point.
    #[error("no such entry")]
    NoEntry,
    /// The backend does not implement this operation.
    #[error("not supported")]
    NotSupported,
    /// The other end of a pipe/mailbox/channel has gone away.
    #[error("disconnected")]
    Disconnected,
    /// The operation is already underway (duplicate mount, double close).
    #[error("in progress")]
    InProgress,
    /// Caller violated a usage protocol (unlocking a mutex it doesn't
    /// hold, releasing a semaphore more times than acquired).
    #[error("protocol violation")]
    Protocol,
    /// Too many of something: open files, mounts, waiters.
    #[error("too many")]
    Many,
    /// A value (offset, size, priority) fell outside its valid range.
    #[error("out of range")]
    Range,
    /// On-disk or on-wire data failed a structural/consistency check.
    #[error("corrupt data")]
    Broken,
    /// A path or name exceeded its maximum length.
    #[error("name too long")]
    NameTooLong,
    /// A name contained characters or a form that is never valid.
    #[error("invalid name")]
    InvalidName,
    /// Expected a file, found a directory.
    #[error("is a directory")]
    IsDirectory,
    /// Expected a directory, found a file.
    #[error("not a directory")]
    NotDirectory,
    /// Directory removal/rename target was not empty.
    #[error("directory not empty")]
    NotEmpty,
    /// Backing store has no space left.
    #[error("no space left")]
    NoSpace,
    /// An invariant the implementation relies on was violated; this
    /// indicates a bug rather than a caller mistake.
    #[error("internal error")]
    Internal,
    /// Catch-all for a backend-specific failure with no closer match.
    #[error("other error")]
    Other,
}

impl ErrorKind {
    /// A rough POSIX errno mapping, useful when a backend needs to report
    /// through a C-style numeric status channel.
    pub const fn to_errno(self) -> i32 {
        match self {
            ErrorKind::None => 0,
            ErrorKind::Io => 5,        // EIO
            ErrorKind::Invalid => 22,  // EINVAL
            ErrorKind::TimedOut => 110,// ETIMEDOUT
            ErrorKind::Busy => 16,     // EBUSY
            ErrorKind::Again => 11,    // EAGAIN
            ErrorKind::Canceled => 125,// ECANCELED
            ErrorKind::NoMemory => 12, // ENOMEM
            ErrorKind::Exist => 17,    // EEXIST
            ErrorKind::NotReady => 11, // EAGAIN
            ErrorKind::Access => 13,   // EACCES
            ErrorKind::NoEntry => 2,   // ENOENT
            ErrorKind::NotSupported => 95, // ENOTSUP
            ErrorKind::Disconnected => 32, // EPIPE
            ErrorKind::InProgress => 115,  // EINPROGRESS
            ErrorKind::Protocol => 71, // EPROTO
            ErrorKind::Many => 24,     // EMFILE
            ErrorKind::Range => 34,    // ERANGE
            ErrorKind::Broken => 52,   // EBADE... nearest: "invalid exchange"
            ErrorKind::NameTooLong => 36, // ENAMETOOLONG
            ErrorKind::InvalidName => 22,  // EINVAL
            ErrorKind::IsDirectory => 21,  // EISDIR
            ErrorKind::NotDirectory => 20, // ENOTDIR
            ErrorKind::NotEmpty => 39,     // ENOTEMPTY
            ErrorKind::NoSpace => 28,      // ENOSPC
            ErrorKind::Internal => 5,      // EIO, closest generic fit
            ErrorKind::Other => 5,         // EIO
        }
    }

    /// True for failures that are expected to clear on their own if the
    /// caller simply retries (as opposed to a programming mistake).
    pub const fn is_transient(self) -> bool {
        matches!(
            self,
            ErrorKind::Busy | ErrorKind::Again | ErrorKind::NotReady | ErrorKind::TimedOut
        )
    }
}

/// Convenience alias used throughout the other vfskit crates.
pub type Result<T> = core::result::Result<T, ErrorKind>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_mapping_is_stable_for_common_cases() {
        assert_eq!(ErrorKind::NoEntry.to_errno(), 2);
        assert_eq!(ErrorKind::Exist.to_errno(), 17);
        assert_eq!(ErrorKind::NoSpace.to_errno(), 28);
    }

    #[test]
    fn transient_classification() {
        assert!(ErrorKind::Busy.is_transient());
        assert!(ErrorKind::Again.is_transient());
        assert!(!ErrorKind::Broken.is_transient());
        assert!(!ErrorKind::Internal.is_transient());
    }
}
