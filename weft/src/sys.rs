//! POSIX surfaces with no WASI Preview 1 mapping.
//!
//! Each operation fails with a descriptive [`Error::Unsupported`]; nothing
//! here silently no-ops. The refusal is fatal to the operation, never to
//! the process.

use crate::error::{Error, Result};

#[inline(always)]
fn unavailable(op: &'static str) -> Error {
    Error::Unsupported(op)
}

/// WASI Preview 1 has no sockets.
pub fn socket(_domain: i32, _kind: i32) -> Result<u32> {
    Err(unavailable("socket"))
}

pub fn pipe() -> Result<(u32, u32)> {
    Err(unavailable("pipe"))
}

/// The sandbox is a single process; there is nothing to fork.
pub fn fork() -> Result<i32> {
    Err(unavailable("fork"))
}

/// No signals reach the sandbox and none can leave it.
pub fn kill(_pid: i32, _signal: i32) -> Result<()> {
    Err(unavailable("kill"))
}

pub fn chown(_path: &str, _uid: u32, _gid: u32) -> Result<()> {
    Err(unavailable("chown"))
}

/// Preopens hide the host layout; paths cannot be canonicalized.
pub fn realpath(_path: &str) -> Result<String> {
    Err(unavailable("realpath"))
}

pub fn flock(_fd: u32, _operation: i32) -> Result<()> {
    Err(unavailable("flock"))
}

pub fn hostname() -> Result<String> {
    Err(unavailable("hostname"))
}

pub fn isatty(_fd: u32) -> Result<bool> {
    Err(unavailable("isatty"))
}

pub fn user_lookup(_name: &str) -> Result<u32> {
    Err(unavailable("user_lookup"))
}

pub fn group_lookup(_name: &str) -> Result<u32> {
    Err(unavailable("group_lookup"))
}
