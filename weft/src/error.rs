//! Error handling utils.
//!
//! Errors fall into a small number of kinds: translated I/O errors carrying
//! a host errno, timeouts raised when a companion clock fires before the
//! awaited descriptor becomes ready, and refusals for POSIX surfaces that
//! have no WASI Preview 1 mapping. Transient errors (`EAGAIN` and friends)
//! never surface here: the evented helpers recover from them locally by
//! suspending the calling fiber.

use std::io;

use crate::ffi::wasi::{self as sys, Errno};

/// A specialized [`Result`] type for the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Represents all error cases for all routines of the crate.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    #[error("io error: {0}")]
    IO(#[from] io::Error),

    /// A companion clock fired before the awaited condition was satisfied.
    #[error("operation timed out")]
    TimedOut,

    /// The descriptor was closed while fibers were still waiting on it.
    #[error("closed stream")]
    Closed,

    /// The operation has no WASI Preview 1 mapping. Fatal to the operation,
    /// never to the process, and never a silent no-op.
    #[error("{0} is not available in the WASI sandbox")]
    Unsupported(&'static str),

    /// A fiber whose entry already returned cannot run again.
    #[error("cannot resume a dead fiber")]
    DeadFiber,

    #[error("path contains an embedded NUL byte")]
    NulInPath,
}

impl Error {
    /// Translate a WASI errno into a typed I/O error carrying the
    /// corresponding host errno.
    #[inline]
    pub fn from_wasi(errno: Errno) -> Self {
        Error::IO(io::Error::from_raw_os_error(host_errno(errno)))
    }
}

/// Map a WASI errno onto the host errno taxonomy. Codes without a dedicated
/// mapping degrade to `EIO`; the table is total, so translation can never
/// fail.
pub fn host_errno(errno: Errno) -> i32 {
    match errno {
        e if e == sys::ERRNO_ACCES => libc::EACCES,
        e if e == sys::ERRNO_NOENT => libc::ENOENT,
        e if e == sys::ERRNO_EXIST => libc::EEXIST,
        e if e == sys::ERRNO_ISDIR => libc::EISDIR,
        e if e == sys::ERRNO_NOTDIR => libc::ENOTDIR,
        e if e == sys::ERRNO_INVAL => libc::EINVAL,
        e if e == sys::ERRNO_BADF => libc::EBADF,
        _ => libc::EIO,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_table_is_total() {
        // Every raw Preview 1 errno value maps to something without
        // panicking; unknown codes degrade to EIO.
        for raw in 0..=76u16 {
            let errno = unsafe { std::mem::transmute::<u16, Errno>(raw) };
            let host = host_errno(errno);
            assert!(host > 0, "errno {} mapped to non-positive {}", raw, host);
        }
    }

    #[test]
    fn dedicated_mappings() {
        assert_eq!(host_errno(sys::ERRNO_ACCES), libc::EACCES);
        assert_eq!(host_errno(sys::ERRNO_NOENT), libc::ENOENT);
        assert_eq!(host_errno(sys::ERRNO_EXIST), libc::EEXIST);
        assert_eq!(host_errno(sys::ERRNO_ISDIR), libc::EISDIR);
        assert_eq!(host_errno(sys::ERRNO_NOTDIR), libc::ENOTDIR);
        assert_eq!(host_errno(sys::ERRNO_INVAL), libc::EINVAL);
        assert_eq!(host_errno(sys::ERRNO_BADF), libc::EBADF);
        // Anything else is EIO.
        assert_eq!(host_errno(sys::ERRNO_AGAIN), libc::EIO);
    }

    #[test]
    fn error_display_does_not_need_the_substrate() {
        let err = Error::Unsupported("socket");
        assert_eq!(
            err.to_string(),
            "socket is not available in the WASI sandbox"
        );
        assert!(!Error::TimedOut.to_string().is_empty());
    }
}
