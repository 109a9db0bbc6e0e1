//! Opening files through WASI preopens.
//!
//! Path-based I/O in the sandbox resolves against the directory descriptors
//! the host granted at startup. Opening a file means rewriting its path
//! into `(parent descriptor, relative path)`, translating the POSIX open
//! flags and permission intent into `path_open` arguments, and mapping WASI
//! failures back onto the host errno taxonomy.

use std::rc::Rc;

use bitflags::bitflags;
use once_cell::unsync::OnceCell;

use crate::error::{Error, Result};
use crate::ffi::wasi as sys;
use crate::io::FileDescriptor;

bitflags! {
    /// POSIX open(2) bits understood by the sandbox, excluding the access
    /// mode field.
    pub struct OpenFlags: i32 {
        const CREAT = libc::O_CREAT;
        const TRUNC = libc::O_TRUNC;
        const EXCL = libc::O_EXCL;
        const APPEND = libc::O_APPEND;
        const NONBLOCK = libc::O_NONBLOCK;
        const SYNC = libc::O_SYNC;
    }
}

/// Rights requested for a descriptor opened readable.
const READ_RIGHTS: sys::Rights = sys::RIGHTS_FD_READ
    | sys::RIGHTS_FD_SEEK
    | sys::RIGHTS_FD_TELL
    | sys::RIGHTS_FD_FILESTAT_GET
    | sys::RIGHTS_FD_READDIR
    | sys::RIGHTS_POLL_FD_READWRITE;

/// Rights requested for a descriptor opened writable.
const WRITE_RIGHTS: sys::Rights = sys::RIGHTS_FD_WRITE
    | sys::RIGHTS_FD_SEEK
    | sys::RIGHTS_FD_TELL
    | sys::RIGHTS_FD_FILESTAT_GET
    | sys::RIGHTS_FD_DATASYNC
    | sys::RIGHTS_FD_SYNC
    | sys::RIGHTS_FD_ALLOCATE
    | sys::RIGHTS_FD_FILESTAT_SET_SIZE
    | sys::RIGHTS_FD_FILESTAT_SET_TIMES
    | sys::RIGHTS_POLL_FD_READWRITE;

////////////////////////////////////////////////////////////////////////////////
// PreopenTable
////////////////////////////////////////////////////////////////////////////////

/// The host-granted directory descriptors, keyed by path prefix.
pub struct PreopenTable {
    entries: Vec<Preopen>,
}

#[derive(Debug)]
struct Preopen {
    fd: sys::Fd,
    prefix: String,
}

impl PreopenTable {
    /// Walk descriptors upward from 3 until the host reports `EBADF`,
    /// collecting every preopened directory and its prefix.
    pub fn discover() -> Self {
        let mut entries = Vec::new();
        let mut fd: sys::Fd = 3;
        loop {
            let prestat = match unsafe { sys::fd_prestat_get(fd) } {
                Ok(prestat) => prestat,
                Err(errno) if errno == sys::ERRNO_BADF => break,
                Err(errno) => {
                    log::warn!("fd_prestat_get({}) failed: {:?}", fd, errno);
                    fd += 1;
                    continue;
                }
            };
            if prestat.tag == sys::PREOPENTYPE_DIR.raw() {
                let len = unsafe { prestat.u.dir.pr_name_len };
                let mut name = vec![0u8; len];
                match unsafe { sys::fd_prestat_dir_name(fd, name.as_mut_ptr(), len) } {
                    Ok(()) => {
                        let prefix = String::from_utf8_lossy(&name)
                            .trim_end_matches('\0')
                            .to_string();
                        entries.push(Preopen { fd, prefix });
                    }
                    Err(errno) => log::warn!("fd_prestat_dir_name({}) failed: {:?}", fd, errno),
                }
            }
            fd += 1;
        }
        PreopenTable { entries }
    }

    #[cfg(test)]
    fn with_entries(entries: Vec<(sys::Fd, &str)>) -> Self {
        PreopenTable {
            entries: entries
                .into_iter()
                .map(|(fd, prefix)| Preopen {
                    fd,
                    prefix: prefix.to_string(),
                })
                .collect(),
        }
    }

    /// Rewrite `path` into `(parent descriptor, relative path)` using the
    /// longest matching prefix; later grants win ties. Relative paths
    /// resolve against the `.` preopen.
    pub fn resolve(&self, path: &str) -> Option<(sys::Fd, String)> {
        let mut best: Option<(&Preopen, usize)> = None;
        for preopen in &self.entries {
            if let Some(len) = prefix_match(&preopen.prefix, path) {
                if best.map_or(true, |(_, best_len)| len >= best_len) {
                    best = Some((preopen, len));
                }
            }
        }
        best.map(|(preopen, len)| {
            let rest = path[len..].trim_start_matches('/');
            let rel = if rest.is_empty() { "." } else { rest };
            (preopen.fd, rel.to_string())
        })
    }
}

/// How many bytes of `path` the preopen prefix covers, or `None` if it does
/// not apply. A prefix only matches at a component boundary.
fn prefix_match(prefix: &str, path: &str) -> Option<usize> {
    if !path.starts_with('/') {
        return if prefix == "." { Some(0) } else { None };
    }
    if prefix == "/" {
        return Some(1);
    }
    if !path.starts_with(prefix) {
        return None;
    }
    if path.len() == prefix.len() || path.as_bytes()[prefix.len()] == b'/' {
        Some(prefix.len())
    } else {
        None
    }
}

thread_local! {
    static PREOPENS: OnceCell<PreopenTable> = OnceCell::new();
}

/// Access the preopen table, discovering it on first use.
pub fn with_preopens<R>(f: impl FnOnce(&PreopenTable) -> R) -> R {
    PREOPENS.with(|cell| f(cell.get_or_init(PreopenTable::discover)))
}

////////////////////////////////////////////////////////////////////////////////
// open
////////////////////////////////////////////////////////////////////////////////

/// Open `path` with POSIX open(2) semantics against the preopen table.
///
/// The permission bits are accepted for interface compatibility; WASI has
/// no mode to give them to. The returned descriptor always reports
/// blocking: WASI I/O is effectively blocking whatever `O_NONBLOCK` says.
pub fn open(path: &str, flags: i32, _mode: u32) -> Result<Rc<FileDescriptor>> {
    if path.bytes().any(|b| b == 0) {
        return Err(Error::NulInPath);
    }
    let (dir_fd, rel) = with_preopens(|table| table.resolve(path))
        .ok_or_else(|| Error::IO(std::io::Error::from_raw_os_error(libc::ENOENT)))?;
    let (oflags, fdflags) = translate_flags(OpenFlags::from_bits_truncate(flags));
    let rights = rights_for(flags);
    let fd = unsafe {
        sys::path_open(
            dir_fd,
            sys::LOOKUPFLAGS_SYMLINK_FOLLOW,
            &rel,
            oflags,
            rights,
            // Inherited descriptors get the same capability set.
            rights,
            fdflags,
        )
    }
    .map_err(Error::from_wasi)?;
    Ok(FileDescriptor::new(fd))
}

/// Split the POSIX flag bits into `path_open`'s open flags and descriptor
/// flags.
fn translate_flags(flags: OpenFlags) -> (sys::Oflags, sys::Fdflags) {
    let mut oflags: sys::Oflags = 0;
    if flags.contains(OpenFlags::CREAT) {
        oflags |= sys::OFLAGS_CREAT;
    }
    if flags.contains(OpenFlags::TRUNC) {
        oflags |= sys::OFLAGS_TRUNC;
    }
    if flags.contains(OpenFlags::EXCL) {
        oflags |= sys::OFLAGS_EXCL;
    }
    let mut fdflags: sys::Fdflags = 0;
    if flags.contains(OpenFlags::APPEND) {
        fdflags |= sys::FDFLAGS_APPEND;
    }
    if flags.contains(OpenFlags::NONBLOCK) {
        fdflags |= sys::FDFLAGS_NONBLOCK;
    }
    if flags.contains(OpenFlags::SYNC) {
        fdflags |= sys::FDFLAGS_SYNC;
    }
    (oflags, fdflags)
}

/// Derive the rights sets from the access mode. Write-only gets the
/// writable set, read-write both, and anything else defaults to readable.
fn rights_for(flags: i32) -> sys::Rights {
    match flags & libc::O_ACCMODE {
        mode if mode == libc::O_RDWR => READ_RIGHTS | WRITE_RIGHTS,
        mode if mode == libc::O_WRONLY => WRITE_RIGHTS,
        _ => READ_RIGHTS,
    }
}
