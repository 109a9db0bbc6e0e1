//! FFI bindings to the runtime substrate:
//! 1. The unwind boundary module merged in after instrumentation.
//! 2. The WASI Preview 1 host interface.
//! 3. The linker-synthesized constructor and destructor lists.
//!
//! Non-wasm builds get stub definitions with identical signatures so the
//! crate's pure logic stays compilable and unit-testable on the host; the
//! stubs abort if anything actually reaches the substrate.

pub mod asyncify;
pub mod wasi;

#[cfg(target_arch = "wasm32")]
extern "C" {
    fn __wasm_call_ctors();
    fn __wasm_call_dtors();
}

/// Run the module's static constructor list (synthesized by `wasm-ld`).
///
/// # Safety
/// Must be called exactly once, before any other runtime code.
#[cfg(target_arch = "wasm32")]
pub unsafe fn call_ctors() {
    __wasm_call_ctors();
}

/// Run the module's static destructor list (synthesized by `wasm-ld`).
///
/// # Safety
/// Must be called exactly once, after the boundary driver has exited.
#[cfg(target_arch = "wasm32")]
pub unsafe fn call_dtors() {
    __wasm_call_dtors();
}

#[cfg(not(target_arch = "wasm32"))]
pub unsafe fn call_ctors() {}

#[cfg(not(target_arch = "wasm32"))]
pub unsafe fn call_dtors() {}
