//! The unwind state machine, run queue and boundary driver.
//!
//! WebAssembly has no addressable call stack, so a context switch has to be
//! synthesized: every instrumented function can save its frame into a
//! per-fiber buffer while returning (unwind), and later replay itself back
//! down to the saved call site (rewind). This module owns the state machine
//! around those two motions, the queue of runnable fibers, and the single
//! non-instrumented loop that drives everything: detect an unwind, stop it,
//! pick the next fiber, rewind into it or start it fresh.
//!
//! Two ordering rules the driver lives by:
//! 1. It inspects the unwind state through the boundary module's
//!    `get_state`, never through [`state`]: an instrumented read would save
//!    and restore itself mid-unwind and deliver a stale value.
//! 2. It calls `stop_unwind` before any instrumented code runs again;
//!    instrumented code executed while still unwinding saves itself and
//!    returns, which turns the call into a no-op.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::rc::Rc;

use crate::event;
use crate::ffi::{self, asyncify};
use crate::fiber::Fiber;

/// Unwind runtime state. Values match what the boundary module's
/// `get_state` reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum State {
    Normal = 0,
    Unwinding = 1,
    Rewinding = 2,
}

/// Size of the driver's private bookkeeping stack. The driver must not
/// touch a suspended fiber's stack window between dispatches, so it gets a
/// small window of its own.
const DRIVER_STACK_SIZE: usize = 64 * 1024;

struct RuntimeState {
    state: Cell<State>,
    /// The fiber the driver should dispatch next. Written by the suspending
    /// side, read and cleared by the driver.
    next: RefCell<Option<Rc<Fiber>>>,
    current: RefCell<Option<Rc<Fiber>>>,
    main: RefCell<Option<Rc<Fiber>>>,
    runnable: RefCell<VecDeque<Rc<Fiber>>>,
    main_entry: RefCell<Option<Box<dyn FnOnce()>>>,
    exit_code: Cell<i32>,
    // Observability: how many rewinds re-entered through each path.
    rewinds_main: Cell<u64>,
    rewinds_trampoline: Cell<u64>,
}

thread_local! {
    static RUNTIME: RuntimeState = RuntimeState {
        state: Cell::new(State::Normal),
        next: RefCell::new(None),
        current: RefCell::new(None),
        main: RefCell::new(None),
        runnable: RefCell::new(VecDeque::new()),
        main_entry: RefCell::new(None),
        exit_code: Cell::new(0),
        rewinds_main: Cell::new(0),
        rewinds_trampoline: Cell::new(0),
    };
}

// Handoff cells for the windows in which the driver may not call
// instrumented code. Plain statics: the trampoline reads them with nothing
// but a raw load while a rewind is armed.
static mut TRAMPOLINE_TARGET: *const Fiber = std::ptr::null();
static mut DRIVER_STACK_BASE: *mut u8 = std::ptr::null_mut();

fn with<R>(f: impl FnOnce(&RuntimeState) -> R) -> R {
    RUNTIME.with(f)
}

/// The runtime's own copy of the unwind state. Valid only from instrumented
/// code running normally; the driver uses the boundary module instead.
pub fn state() -> State {
    with(|rt| rt.state.get())
}

/// Rewind re-entry counters: `(via run_main, via the spawn trampoline)`.
/// A suspended fiber must re-enter through the same path it unwound
/// through, so these never cross over.
pub fn rewind_counts() -> (u64, u64) {
    with(|rt| (rt.rewinds_main.get(), rt.rewinds_trampoline.get()))
}

/// The fiber currently executing.
///
/// # Panics
/// If the runtime has not been started.
pub(crate) fn current_fiber() -> Rc<Fiber> {
    with(|rt| rt.current.borrow().clone()).expect("the fiber runtime is not running")
}

pub(crate) fn set_exit_code(code: i32) {
    with(|rt| rt.exit_code.set(code));
}

/// Append a fiber to the back of the run queue.
pub(crate) fn enqueue(fiber: Rc<Fiber>) {
    with(|rt| rt.runnable.borrow_mut().push_back(fiber));
}

/// Put a fiber at the front of the run queue, ahead of everything else.
pub(crate) fn enqueue_front(fiber: Rc<Fiber>) {
    with(|rt| rt.runnable.borrow_mut().push_front(fiber));
}

/// Make a parked fiber runnable again. Dead fibers are dropped silently:
/// stale wakeups outlive their fiber routinely.
pub(crate) fn unpark(fiber: Rc<Fiber>) {
    if !fiber.is_dead() {
        enqueue(fiber);
    }
}

fn pop_runnable() -> Option<Rc<Fiber>> {
    with(|rt| {
        let mut queue = rt.runnable.borrow_mut();
        while let Some(f) = queue.pop_front() {
            if !f.is_dead() {
                return Some(f);
            }
        }
        None
    })
}

/// Suspend the current fiber, handing the driver `next` to dispatch (or
/// nothing, which makes the driver wind the program down).
///
/// Everything after the `switch` call belongs to the resumed future: during
/// the unwind the whole instrumented caller chain saves itself and returns;
/// when the driver later replays it, `switch` terminates the replay and
/// control continues after the call as if nothing had happened.
fn suspend_current(next: Option<Rc<Fiber>>) {
    let current = current_fiber();
    current.set_resumable(true);
    with(|rt| {
        *rt.next.borrow_mut() = next;
        rt.state.set(State::Unwinding);
    });
    unsafe { asyncify::switch(current.context().buffer_ptr()) };
    with(|rt| rt.state.set(State::Normal));
}

/// Transfer control to `next`. Switching to the current fiber is a no-op.
pub(crate) fn switch_to(next: Rc<Fiber>) {
    if Rc::ptr_eq(&current_fiber(), &next) {
        return;
    }
    suspend_current(Some(next));
}

/// Requeue the current fiber behind everything runnable and let the head of
/// the queue run.
pub(crate) fn yield_now() {
    enqueue(current_fiber());
    if let Some(next) = pop_runnable() {
        switch_to(next);
    }
}

/// Park the current fiber until something re-enqueues it.
///
/// Runs the event loop on behalf of the whole runtime while nothing is
/// runnable. Wakeups can be spurious: callers re-check their condition.
pub(crate) fn park() {
    loop {
        if let Some(next) = pop_runnable() {
            if Rc::ptr_eq(&next, &current_fiber()) {
                // Woken while this fiber itself was polling.
                return;
            }
            switch_to(next);
            return;
        }
        if event::with_loop(|lp| lp.has_pending()) {
            event::with_loop(|lp| lp.run(true));
            continue;
        }
        // No runnable fiber and nothing to wait for: the program cannot
        // make progress. Hand the driver nothing so it winds down.
        log::warn!("all fibers are suspended with no pending events; shutting down");
        suspend_current(None);
        return;
    }
}

/// Find the fiber to hand the driver when the current fiber is about to
/// die. `None` means the program is done.
fn successor_for_exit() -> Option<Rc<Fiber>> {
    loop {
        if let Some(next) = pop_runnable() {
            return Some(next);
        }
        if event::with_loop(|lp| lp.has_pending()) {
            event::with_loop(|lp| lp.run(true));
            continue;
        }
        return None;
    }
}

/// Run `main` as the program's initial fiber and drive every fiber it
/// spawns to completion. This is the body of the program entry: it invokes
/// the module constructor list, executes the main fiber, runs the boundary
/// driver until nothing is left to do, invokes the destructor list and
/// exits with the recorded status.
pub fn start(main: impl FnOnce() + 'static) -> ! {
    with(|rt| *rt.main_entry.borrow_mut() = Some(Box::new(main)));
    start_inner()
}

/// Record `code` as the process exit status and terminate immediately.
pub fn exit(code: i32) -> ! {
    set_exit_code(code);
    unsafe {
        ffi::call_dtors();
        ffi::wasi::proc_exit(code as u32)
    }
}

#[cfg_attr(target_arch = "wasm32", export_name = "weft_start")]
#[inline(never)]
fn start_inner() -> ! {
    let main_fiber = Fiber::new_main();
    main_fiber.context().init_unwind_buffer();
    with(|rt| {
        *rt.main.borrow_mut() = Some(main_fiber.clone());
        *rt.current.borrow_mut() = Some(main_fiber);
    });

    let driver_stack = Box::leak(vec![0u8; DRIVER_STACK_SIZE].into_boxed_slice());
    let top = unsafe { driver_stack.as_mut_ptr().add(DRIVER_STACK_SIZE) };
    unsafe { DRIVER_STACK_BASE = ((top as usize) & !15) as *mut u8 };

    unsafe { ffi::call_ctors() };
    driver_loop();
    unsafe { ffi::call_dtors() };
    let code = with(|rt| rt.exit_code.get());
    unsafe { ffi::wasi::proc_exit(code as u32) }
}

/// The boundary driver. Excluded from instrumentation: this is the frame
/// every unwind stops at and every rewind starts from.
#[cfg_attr(target_arch = "wasm32", export_name = "weft_driver_loop")]
#[inline(never)]
fn driver_loop() {
    // The main fiber runs on the program stack; remember where it starts so
    // rewinds re-enter with the same shadow stack layout.
    let program_sp = unsafe { asyncify::stack_pointer_get() };
    with(|rt| {
        if let Some(main) = rt.main.borrow().as_ref() {
            main.context().set_stack_base(program_sp);
        }
    });

    run_main();
    loop {
        // Restricted window: nothing instrumented until stop_unwind is done
        // and the stack pointer is off the suspended fiber's window.
        unsafe {
            while asyncify::get_state() == asyncify::STATE_UNWINDING {
                asyncify::stop_unwind();
            }
            asyncify::stack_pointer_set(DRIVER_STACK_BASE);
        }
        with(|rt| rt.state.set(State::Normal));

        let next = match with(|rt| rt.next.borrow_mut().take()) {
            Some(f) => f,
            None => break,
        };
        if next.is_dead() || !next.is_resumable() {
            break;
        }
        // Mirror the atomicity a native swapcontext would provide: the
        // fiber stops being resumable the moment it is chosen.
        next.set_resumable(false);
        with(|rt| *rt.current.borrow_mut() = Some(next.clone()));

        let fresh = next.context().is_fresh();
        let main_path = next.is_main();
        if fresh {
            next.context().init_unwind_buffer();
        } else {
            with(|rt| {
                if main_path {
                    rt.rewinds_main.set(rt.rewinds_main.get() + 1);
                } else {
                    rt.rewinds_trampoline.set(rt.rewinds_trampoline.get() + 1);
                }
                rt.state.set(State::Rewinding);
            });
        }
        unsafe {
            TRAMPOLINE_TARGET = Rc::as_ptr(&next);
            asyncify::stack_pointer_set(next.context().stack_base());
            if fresh {
                fiber_trampoline();
            } else {
                // Restricted window again: arm the rewind and immediately
                // re-enter along the path the fiber unwound through.
                asyncify::start_rewind(next.context().buffer_ptr());
                if main_path {
                    run_main();
                } else {
                    fiber_trampoline();
                }
            }
        }
    }
    unsafe { asyncify::stack_pointer_set(program_sp) };
}

/// Entry path of the main fiber. Every rewind of a suspended main fiber
/// re-enters through this exact function; excluded from instrumentation.
#[cfg_attr(target_arch = "wasm32", export_name = "weft_run_main")]
#[inline(never)]
fn run_main() {
    main_fiber_entry();
}

/// Entry path of spawned fibers, both for the first run and for every
/// rewind; excluded from instrumentation. Nothing here may call
/// instrumented code other than `fiber_entry` itself: on the rewind path
/// the replay is already armed.
#[cfg_attr(target_arch = "wasm32", export_name = "weft_fiber_trampoline")]
#[inline(never)]
fn fiber_trampoline() {
    let fiber = unsafe { &*TRAMPOLINE_TARGET };
    fiber_entry(fiber);
}

fn main_fiber_entry() {
    let entry = with(|rt| rt.main_entry.borrow_mut().take());
    if let Some(entry) = entry {
        if panic::catch_unwind(AssertUnwindSafe(entry)).is_err() {
            log::error!("main fiber terminated by panic");
            set_exit_code(1);
        }
    }
    current_fiber().set_dead(true);
    // Returning with no next fiber ends the program.
}

fn fiber_entry(fiber: &Fiber) {
    let entry = fiber.take_entry();
    if let Some(entry) = entry {
        if panic::catch_unwind(AssertUnwindSafe(entry)).is_err() {
            // An uncaught panic kills this fiber only; peers keep running.
            log::error!("fiber '{}' terminated by panic", fiber.name());
        }
    }
    fiber.set_dead(true);
    if let Some(next) = successor_for_exit() {
        with(|rt| *rt.next.borrow_mut() = Some(next));
    }
}
