//! The kernel-wide error type.
//!
//! Every fallible operation in this crate and in the project crates built
//! on top of it returns `Result<T, Error>` rather than an ad-hoc sentinel.
//! `Error` groups the handful of failure kinds a teaching kernel's storage
//! and paging core actually needs to distinguish, not the full POSIX errno
//! space.

use core::fmt;

/// Kernel-wide error type.
///
/// Variants are grouped by the kind of failure they represent (see the
/// module doc): resource exhaustion, "not found", invariant violation, and
/// illegal caller input. Two variants carry a `&'static str` context so a
/// log line can say *which* invariant tripped without allocating.
#[derive(Debug, Eq, PartialEq, Clone, Copy)]
pub enum Error {
    /// No free sector, swap slot, frame, or cache entry was available.
    ResourceExhausted,
    /// IO against a block device failed.
    IoError,
    /// The requested identity (sector, upage, file offset) has no entry.
    NotFound,
    /// An on-disk or in-memory structure failed a sanity check.
    ///
    /// Carries a short, static description of what was violated (e.g. the
    /// inode magic, or an on-disk size assertion).
    InvariantViolation(&'static str),
    /// The caller asked for something that is not permitted right now
    /// (e.g. writing to a deny-write inode, mapping an already-mapped
    /// region).
    InvalidArgument,
    /// The operation would need to block and the caller asked not to.
    WouldBlock,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::ResourceExhausted => write!(f, "resource exhausted"),
            Error::IoError => write!(f, "device i/o error"),
            Error::NotFound => write!(f, "entry not found"),
            Error::InvariantViolation(what) => write!(f, "invariant violated: {what}"),
            Error::InvalidArgument => write!(f, "invalid argument"),
            Error::WouldBlock => write!(f, "operation would block"),
        }
    }
}

impl core::error::Error for Error {}

/// Convenience alias used throughout this crate and its dependents.
pub type Result<T> = core::result::Result<T, Error>;
