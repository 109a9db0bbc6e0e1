//! Cooperative fiber runtime core for WebAssembly targets exposing WASI
//! Preview 1.
//!
//! WebAssembly has no directly addressable call stack, so this runtime
//! synthesizes fiber switching out of a post-compile instrumentation pass:
//! every function (minus a small removelist) learns to save its frame into
//! a per-fiber buffer while returning, and to replay itself back down to
//! the saved call site. On top of that sit a cooperative scheduler and a
//! single-threaded event loop that turns every blocking wait into one
//! `poll_oneoff` against the host.
//!
//! This library contains the following pieces:
//!
//! - [Fibers: builder, spawn/resume/yield, channels](fiber)
//! - [The unwind state machine and boundary driver](runtime)
//! - [The event loop](event)
//! - [Evented descriptors and retry helpers](io)
//! - [Preopens and file opening](fs)
//! - [Clocks](clock)
//! - [Logging](mod@log) (see <https://docs.rs/log/>)
//! - [Error handling](error)
//! - [Sandbox refusals](sys)
//!
//! The build contract lives next to the crate in `boundary/`: the helper
//! module that is merged in after instrumentation, and the removelist the
//! pass must honor. Modules must be produced with the legacy exception
//! handling instruction set; conversion to `exnref` may only happen after
//! instrumentation.
//!
//! Scheduling is single-threaded and cooperative. Control transfers only
//! at explicit yields, suspending I/O, and timer waits; there is no
//! preemption and no parallelism inside the sandbox.

pub mod clock;
pub mod error;
pub mod event;
pub mod ffi;
pub mod fiber;
pub mod fs;
pub mod io;
pub mod log;
pub mod runtime;
pub mod sys;
#[cfg(feature = "test")]
pub mod test;

pub use error::Result;
pub type StdResult<T, E> = std::result::Result<T, E>;
