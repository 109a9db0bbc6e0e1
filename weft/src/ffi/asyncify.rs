//! ABI of the unwind boundary module (`boundary/boundary.wat`).
//!
//! The instrumentation pass rewrites every function in the module, except
//! the ones named in [`REMOVELIST`], so that it can save its locals into a
//! per-fiber buffer while returning (unwind) and replay itself back to the
//! saved call site later (rewind). The five primitives plus the two stack
//! pointer accessors below are exported by a helper module that is merged
//! in *after* the pass and therefore never transformed.
//!
//! Two rules the caller must keep, both enforced by the boundary driver:
//! - between an unwind return and [`stop_unwind`], and between
//!   [`start_rewind`] and the re-entry into the unwound path, nothing
//!   instrumented may run;
//! - the unwind state must be read through [`get_state`], never through a
//!   flag kept in instrumented memory.

/// `get_state` value: no unwind or rewind in progress.
pub const STATE_NORMAL: i32 = 0;
/// `get_state` value: instrumented frames are saving themselves and
/// returning toward the boundary driver.
pub const STATE_UNWINDING: i32 = 1;
/// `get_state` value: a saved frame chain is being replayed.
pub const STATE_REWINDING: i32 = 2;

/// Functions that must be excluded from the instrumentation pass. Mirrors
/// `boundary/removelist.txt`; a unit test keeps the two in sync. If the
/// driver ends up instrumented the first suspension deadlocks, because the
/// driver unwinds along with everything else.
pub const REMOVELIST: &[&str] = &[
    "weft_start",
    "weft_driver_loop",
    "weft_run_main",
    "weft_fiber_trampoline",
];

/// The per-fiber save area header, 2 words in linear memory.
///
/// `current` is the pass's write cursor and `end` the exclusive limit of
/// the window. A fiber that has never been suspended has `current == null`;
/// initialization reserves 16 bytes for this header at the start of the
/// window before the data area begins.
#[repr(C)]
#[derive(Debug)]
pub struct UnwindBuffer {
    pub current: *mut u8,
    pub end: *mut u8,
}

#[cfg(target_arch = "wasm32")]
#[link(wasm_import_module = "boundary")]
extern "C" {
    /// One call performs either half of a context switch: during a rewind it
    /// stops the replay so the caller resumes transparently; otherwise it
    /// begins unwinding into `buf` and the caller's whole instrumented frame
    /// chain saves itself and returns.
    pub fn switch(buf: *mut UnwindBuffer);

    /// Leave the unwinding state. Only the boundary driver calls this, and
    /// it must do so before any instrumented code runs again.
    pub fn stop_unwind();

    /// Begin replaying the frame chain saved in `buf`. The caller must
    /// re-enter the unwound path immediately afterwards.
    pub fn start_rewind(buf: *mut UnwindBuffer);

    /// Terminate a replay; called by `switch` when re-entered while
    /// rewinding.
    pub fn stop_rewind();

    /// Uninstrumented view of the unwind state: one of [`STATE_NORMAL`],
    /// [`STATE_UNWINDING`], [`STATE_REWINDING`].
    pub fn get_state() -> i32;

    /// Read the module's `__stack_pointer` global.
    pub fn stack_pointer_get() -> *mut u8;

    /// Replace the module's `__stack_pointer` global. The driver uses this
    /// to move between fiber stack windows.
    pub fn stack_pointer_set(sp: *mut u8);
}

#[cfg(not(target_arch = "wasm32"))]
mod stubs {
    use super::UnwindBuffer;

    pub unsafe fn switch(_buf: *mut UnwindBuffer) {
        unimplemented!("the unwind boundary exists only in instrumented wasm builds")
    }

    pub unsafe fn stop_unwind() {
        unimplemented!("the unwind boundary exists only in instrumented wasm builds")
    }

    pub unsafe fn start_rewind(_buf: *mut UnwindBuffer) {
        unimplemented!("the unwind boundary exists only in instrumented wasm builds")
    }

    pub unsafe fn stop_rewind() {
        unimplemented!("the unwind boundary exists only in instrumented wasm builds")
    }

    pub unsafe fn get_state() -> i32 {
        super::STATE_NORMAL
    }

    pub unsafe fn stack_pointer_get() -> *mut u8 {
        unimplemented!("the unwind boundary exists only in instrumented wasm builds")
    }

    pub unsafe fn stack_pointer_set(_sp: *mut u8) {
        unimplemented!("the unwind boundary exists only in instrumented wasm builds")
    }
}

#[cfg(not(target_arch = "wasm32"))]
pub use stubs::*;

#[cfg(test)]
mod tests {
    #[test]
    fn removelist_matches_boundary_contract() {
        let file = include_str!("../../../boundary/removelist.txt");
        let from_file: Vec<&str> = file.lines().filter(|l| !l.is_empty()).collect();
        assert_eq!(from_file, super::REMOVELIST);
    }
}
