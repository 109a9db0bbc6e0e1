//! Thin wrappers over the WASI Preview 1 syscalls the runtime uses, plus
//! re-exports of the `wasi` crate types they traffic in.
//!
//! Everything unsafe about talking to the host funnels through here. On
//! non-wasm targets the wrappers abort: the types still exist so that the
//! event loop's subscription building and the open-translation tables can
//! be unit tested on the host.

pub use ::wasi::{
    Ciovec, Clockid, Errno, Event, EventFdReadwrite, Eventtype, Fd, Fdflags, Iovec, Lookupflags,
    Oflags, Prestat, Rights, Size, Subclockflags, Subscription, SubscriptionClock,
    SubscriptionFdReadwrite, SubscriptionU, SubscriptionUU, Timestamp, Userdata,
};

pub use ::wasi::{
    CLOCKID_MONOTONIC, CLOCKID_REALTIME, ERRNO_ACCES, ERRNO_AGAIN, ERRNO_BADF, ERRNO_EXIST,
    ERRNO_INVAL, ERRNO_ISDIR, ERRNO_NOENT, ERRNO_NOTDIR, ERRNO_SUCCESS, EVENTTYPE_CLOCK,
    EVENTTYPE_FD_READ, EVENTTYPE_FD_WRITE, FDFLAGS_APPEND, FDFLAGS_NONBLOCK, FDFLAGS_SYNC,
    LOOKUPFLAGS_SYMLINK_FOLLOW, OFLAGS_CREAT, OFLAGS_EXCL, OFLAGS_TRUNC, PREOPENTYPE_DIR,
    RIGHTS_FD_ALLOCATE, RIGHTS_FD_DATASYNC, RIGHTS_FD_FILESTAT_GET, RIGHTS_FD_FILESTAT_SET_SIZE,
    RIGHTS_FD_FILESTAT_SET_TIMES, RIGHTS_FD_READ, RIGHTS_FD_READDIR, RIGHTS_FD_SEEK,
    RIGHTS_FD_SYNC, RIGHTS_FD_TELL, RIGHTS_FD_WRITE, RIGHTS_POLL_FD_READWRITE,
};

/// Concurrently poll for the readiness of every subscription in
/// `subs[..nsubscriptions]`. Returns how many events were written to `out`.
///
/// # Safety
/// `out` must have room for `nsubscriptions` events.
#[cfg(target_arch = "wasm32")]
#[inline]
pub unsafe fn poll_oneoff(
    subs: *const Subscription,
    out: *mut Event,
    nsubscriptions: Size,
) -> Result<Size, Errno> {
    ::wasi::poll_oneoff(subs, out, nsubscriptions)
}

/// Current value of the given clock, in nanoseconds.
#[cfg(target_arch = "wasm32")]
#[inline]
pub unsafe fn clock_time_get(id: Clockid, precision: Timestamp) -> Result<Timestamp, Errno> {
    ::wasi::clock_time_get(id, precision)
}

/// Scatter-read from a descriptor.
#[cfg(target_arch = "wasm32")]
#[inline]
pub unsafe fn fd_read(fd: Fd, iovs: &[Iovec]) -> Result<Size, Errno> {
    ::wasi::fd_read(fd, iovs)
}

/// Gather-write to a descriptor.
#[cfg(target_arch = "wasm32")]
#[inline]
pub unsafe fn fd_write(fd: Fd, iovs: &[Ciovec]) -> Result<Size, Errno> {
    ::wasi::fd_write(fd, iovs)
}

#[cfg(target_arch = "wasm32")]
#[inline]
pub unsafe fn fd_close(fd: Fd) -> Result<(), Errno> {
    ::wasi::fd_close(fd)
}

/// Open a path relative to an already-open directory descriptor.
#[cfg(target_arch = "wasm32")]
#[inline]
#[allow(clippy::too_many_arguments)]
pub unsafe fn path_open(
    fd: Fd,
    dirflags: Lookupflags,
    path: &str,
    oflags: Oflags,
    fs_rights_base: Rights,
    fs_rights_inheriting: Rights,
    fdflags: Fdflags,
) -> Result<Fd, Errno> {
    ::wasi::path_open(
        fd,
        dirflags,
        path,
        oflags,
        fs_rights_base,
        fs_rights_inheriting,
        fdflags,
    )
}

/// Describe a preopened descriptor; `ERRNO_BADF` past the last one.
#[cfg(target_arch = "wasm32")]
#[inline]
pub unsafe fn fd_prestat_get(fd: Fd) -> Result<Prestat, Errno> {
    ::wasi::fd_prestat_get(fd)
}

/// Fetch the path prefix a preopened directory was granted under.
///
/// # Safety
/// `path` must have room for `path_len` bytes.
#[cfg(target_arch = "wasm32")]
#[inline]
pub unsafe fn fd_prestat_dir_name(fd: Fd, path: *mut u8, path_len: Size) -> Result<(), Errno> {
    ::wasi::fd_prestat_dir_name(fd, path, path_len)
}

/// Terminate the sandbox with the given exit code.
#[cfg(target_arch = "wasm32")]
pub unsafe fn proc_exit(code: u32) -> ! {
    ::wasi::proc_exit(code);
    unreachable!("proc_exit returned")
}

#[cfg(not(target_arch = "wasm32"))]
mod stubs {
    use super::*;

    fn no_host() -> ! {
        unimplemented!("WASI syscalls are only available on wasm32 targets")
    }

    pub unsafe fn poll_oneoff(
        _subs: *const Subscription,
        _out: *mut Event,
        _nsubscriptions: Size,
    ) -> Result<Size, Errno> {
        no_host()
    }

    pub unsafe fn clock_time_get(_id: Clockid, _precision: Timestamp) -> Result<Timestamp, Errno> {
        no_host()
    }

    pub unsafe fn fd_read(_fd: Fd, _iovs: &[Iovec]) -> Result<Size, Errno> {
        no_host()
    }

    pub unsafe fn fd_write(_fd: Fd, _iovs: &[Ciovec]) -> Result<Size, Errno> {
        no_host()
    }

    pub unsafe fn fd_close(_fd: Fd) -> Result<(), Errno> {
        no_host()
    }

    pub unsafe fn path_open(
        _fd: Fd,
        _dirflags: Lookupflags,
        _path: &str,
        _oflags: Oflags,
        _fs_rights_base: Rights,
        _fs_rights_inheriting: Rights,
        _fdflags: Fdflags,
    ) -> Result<Fd, Errno> {
        no_host()
    }

    pub unsafe fn fd_prestat_get(_fd: Fd) -> Result<Prestat, Errno> {
        no_host()
    }

    pub unsafe fn fd_prestat_dir_name(_fd: Fd, _path: *mut u8, _path_len: Size) -> Result<(), Errno> {
        no_host()
    }

    pub unsafe fn proc_exit(code: u32) -> ! {
        std::process::exit(code as i32)
    }
}

#[cfg(not(target_arch = "wasm32"))]
pub use stubs::*;
