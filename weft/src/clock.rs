//! Time values derived from the host's WASI clocks.
//!
//! Functions returning seconds come as `f64`; names with a `64` suffix
//! return a 64-bit number of nanoseconds.
//!
//! - [time()](fn.time.html) - Wall clock time in seconds
//! - [time64()](fn.time64.html) - Wall clock time in nanoseconds
//! - [monotonic()](fn.monotonic.html) - Monotonic time in seconds
//! - [monotonic64()](fn.monotonic64.html) - Monotonic time in nanoseconds
//!
//! The monotonic clock is the one the event loop's timers run on.

use std::time::Duration;

use crate::ffi::wasi as ffi;

pub const INFINITY: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

/// Clock readings ask the host for nanosecond precision; it may round.
const PRECISION_NS: u64 = 1_000;

/// The wall clock time in seconds since the epoch, as adjusted by the host.
#[inline(always)]
pub fn time() -> f64 {
    time64() as f64 / 1e9
}

/// The wall clock time in nanoseconds since the epoch.
#[inline(always)]
pub fn time64() -> u64 {
    unsafe { ffi::clock_time_get(ffi::CLOCKID_REALTIME, PRECISION_NS) }.unwrap_or(0)
}

/// The monotonic time in seconds since an unspecified origin.
///
/// Unaffected by host clock adjustments; the right clock for timeouts and
/// for measuring elapsed time.
#[inline(always)]
pub fn monotonic() -> f64 {
    monotonic64() as f64 / 1e9
}

/// See: [monotonic()](fn.monotonic.html)
#[inline(always)]
pub fn monotonic64() -> u64 {
    unsafe { ffi::clock_time_get(ffi::CLOCKID_MONOTONIC, PRECISION_NS) }.unwrap_or(0)
}
