//! Fibers: cooperatively scheduled strands of execution.
//!
//! Each fiber owns one heap region split into two fixed-size windows: the
//! shadow stack its instrumented code runs on, and the save area its
//! frames unwind into whenever the fiber suspends. Nothing is ever taken
//! from a fiber by force — control moves only when it asks, through
//! [`yield_now`], an explicit [`resume`](Fiber::resume), or a suspending
//! wait on I/O, a timer or a [channel](channel). The run queue is FIFO, so
//! spawn order is also first-run order. Sizes are fixed at spawn time
//! through [`Builder`]; an overflow of the save area cannot be caught, so
//! size it generously.

use std::alloc::{self, Layout};
use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::event;
use crate::ffi::asyncify::UnwindBuffer;
use crate::runtime;

pub mod channel;
pub use channel::{
    channel, Receiver, RecvError, Sender, SendError, TryRecvError, TrySendError,
};

/// Default size of a spawned fiber's shadow stack window.
pub const DEFAULT_STACK_SIZE: usize = 512 * 1024;

/// Default size of the save area the instrumentation pass unwinds into. It
/// must cover the fiber's deepest instrumented call chain; overflowing it is
/// unrecoverable, so the default is generous and the build step is expected
/// to size it against the program's call depth plus a safety margin.
pub const DEFAULT_UNWIND_SIZE: usize = 64 * 1024;

/// Smallest stack window a fiber may be built with.
pub const MIN_STACK_SIZE: usize = 16 * 1024;

/// Bytes reserved at the start of the unwind window for the buffer header.
const UNWIND_HEADER: usize = 16;

thread_local! {
    static NEXT_ID: Cell<u64> = Cell::new(0);
}

fn default_name() -> String {
    NEXT_ID.with(|c| {
        let id = c.get();
        c.set(id + 1);
        format!("fiber-{}", id)
    })
}

////////////////////////////////////////////////////////////////////////////////
// Fiber
////////////////////////////////////////////////////////////////////////////////

/// A fiber is a set of instructions executed with cooperative multitasking.
///
/// A fiber has three possible states: **running**, **suspended** or
/// **dead**. A spawned fiber starts **suspended**; it becomes **running**
/// when the scheduler first dispatches it, and **dead** when its entry
/// returns, normally or by panic. A panic kills only the fiber it happened
/// on.
///
/// Example:
/// ```no_run
/// use weft::fiber;
///
/// let handle = fiber::spawn(|| println!("I'm a fiber"));
/// fiber::yield_now();
/// assert!(handle.is_dead());
/// ```
pub struct Fiber {
    name: String,
    context: FiberContext,
    dead: Cell<bool>,
    resumable: Cell<bool>,
    /// Deadline guard for pending timer events. A timer resumes this fiber
    /// only while its deadline is still the armed one; delivery clears it,
    /// which suppresses a raced timer from the same poll batch.
    wake_at: Cell<Option<u64>>,
    entry: RefCell<Option<Box<dyn FnOnce()>>>,
}

impl Fiber {
    fn with_entry(
        name: String,
        stack_size: usize,
        unwind_size: usize,
        f: Box<dyn FnOnce()>,
    ) -> Rc<Self> {
        Rc::new(Fiber {
            name,
            context: FiberContext::spawned(stack_size, unwind_size),
            dead: Cell::new(false),
            resumable: Cell::new(true),
            wake_at: Cell::new(None),
            entry: RefCell::new(Some(f)),
        })
    }

    /// The context rooted at the program's initial call path. Its stack
    /// window is the program stack itself; the driver records the base.
    pub(crate) fn new_main() -> Rc<Self> {
        Rc::new(Fiber {
            name: "main".into(),
            context: FiberContext::main(),
            dead: Cell::new(false),
            resumable: Cell::new(false),
            wake_at: Cell::new(None),
            entry: RefCell::new(None),
        })
    }

    #[inline(always)]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// `true` once the fiber's entry has returned.
    #[inline(always)]
    pub fn is_dead(&self) -> bool {
        self.dead.get()
    }

    pub(crate) fn set_dead(&self, dead: bool) {
        self.dead.set(dead);
    }

    /// `true` while the fiber is suspended and may legally be dispatched.
    #[inline(always)]
    pub fn is_resumable(&self) -> bool {
        self.resumable.get()
    }

    pub(crate) fn set_resumable(&self, resumable: bool) {
        self.resumable.set(resumable);
    }

    /// `true` for the fiber rooted at the program entry. Suspended main
    /// fibers rewind through the entry path, never the spawn trampoline.
    #[inline(always)]
    pub fn is_main(&self) -> bool {
        self.context.main_fiber
    }

    /// `true` until the scheduler dispatches the fiber for the first time;
    /// the save cursor stays null until then.
    pub fn is_fresh(&self) -> bool {
        self.context.is_fresh()
    }

    pub(crate) fn context(&self) -> &FiberContext {
        &self.context
    }

    pub(crate) fn take_entry(&self) -> Option<Box<dyn FnOnce()>> {
        self.entry.borrow_mut().take()
    }

    pub(crate) fn set_deadline(&self, deadline: Option<u64>) {
        self.wake_at.set(deadline);
    }

    pub(crate) fn deadline(&self) -> Option<u64> {
        self.wake_at.get()
    }

    /// Whether a timer armed for `deadline` should still wake this fiber.
    pub(crate) fn deadline_matches(&self, deadline: u64, now: u64) -> bool {
        self.wake_at.get() == Some(deadline) && now >= deadline
    }

    /// Transfer control to this fiber immediately. The calling fiber goes
    /// to the front of the run queue, so the target's next yield (or its
    /// death) hands control straight back.
    pub fn resume(self: &Rc<Self>) -> Result<()> {
        if self.is_dead() {
            return Err(Error::DeadFiber);
        }
        let current = runtime::current_fiber();
        if Rc::ptr_eq(&current, self) {
            return Ok(());
        }
        runtime::enqueue_front(current);
        runtime::switch_to(self.clone());
        Ok(())
    }

    /// The fiber's save area, for embedders that treat suspended frames as
    /// conservative collection roots. Contents are opaque.
    pub fn unwind_region(&self) -> (*const u8, usize) {
        (
            self.context.region.ptr as *const u8,
            self.context.unwind_size,
        )
    }
}

impl fmt::Debug for Fiber {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Fiber")
            .field("name", &self.name)
            .field("dead", &self.dead.get())
            .field("resumable", &self.resumable.get())
            .finish_non_exhaustive()
    }
}

////////////////////////////////////////////////////////////////////////////////
// FiberContext
////////////////////////////////////////////////////////////////////////////////

/// Per-fiber save area and stack window.
///
/// One region per fiber: the unwind window sits at the bottom with its
/// 2-word header at the very start, and the shadow stack occupies the rest,
/// growing down from `stack_base`. The main fiber's region holds only the
/// unwind window; its stack is the program stack.
pub(crate) struct FiberContext {
    region: Region,
    unwind_size: usize,
    /// Initial `__stack_pointer` for this fiber. Every dispatch, fresh or
    /// rewind, starts from here so replayed frames land on the addresses
    /// they were unwound from.
    stack_base: Cell<*mut u8>,
    main_fiber: bool,
}

impl FiberContext {
    fn spawned(stack_size: usize, unwind_size: usize) -> Self {
        let total = round_up(unwind_size + stack_size, 16);
        let region = Region::alloc(total);
        let stack_base = unsafe { region.ptr.add(total) };
        FiberContext {
            region,
            unwind_size,
            stack_base: Cell::new(stack_base),
            main_fiber: false,
        }
    }

    fn main() -> Self {
        let unwind_size = round_up(DEFAULT_UNWIND_SIZE, 16);
        FiberContext {
            region: Region::alloc(unwind_size),
            unwind_size,
            stack_base: Cell::new(std::ptr::null_mut()),
            main_fiber: true,
        }
    }

    pub(crate) fn buffer_ptr(&self) -> *mut UnwindBuffer {
        self.region.ptr as *mut UnwindBuffer
    }

    /// A fiber that has never been suspended: the save cursor is null until
    /// the first schedule initializes the buffer.
    pub(crate) fn is_fresh(&self) -> bool {
        unsafe { (*self.buffer_ptr()).current.is_null() }
    }

    pub(crate) fn init_unwind_buffer(&self) {
        unsafe {
            let buffer = self.buffer_ptr();
            (*buffer).current = self.region.ptr.add(UNWIND_HEADER);
            (*buffer).end = self.region.ptr.add(self.unwind_size);
        }
    }

    pub(crate) fn stack_base(&self) -> *mut u8 {
        self.stack_base.get()
    }

    pub(crate) fn set_stack_base(&self, sp: *mut u8) {
        self.stack_base.set(sp);
    }
}

fn round_up(n: usize, align: usize) -> usize {
    (n + align - 1) & !(align - 1)
}

/// A 16-aligned, zero-initialized allocation. Zeroing matters: a null save
/// cursor is what marks the fiber as fresh.
struct Region {
    ptr: *mut u8,
    layout: Layout,
}

impl Region {
    fn alloc(size: usize) -> Self {
        let layout = match Layout::from_size_align(size, 16) {
            Ok(layout) => layout,
            Err(_) => panic!("fiber region of {} bytes is not representable", size),
        };
        let ptr = unsafe { alloc::alloc_zeroed(layout) };
        if ptr.is_null() {
            alloc::handle_alloc_error(layout);
        }
        Region { ptr, layout }
    }
}

impl Drop for Region {
    fn drop(&mut self) {
        unsafe { alloc::dealloc(self.ptr, self.layout) };
    }
}

////////////////////////////////////////////////////////////////////////////////
// Builder
////////////////////////////////////////////////////////////////////////////////

/// Fiber factory which can be used to configure the properties of the new
/// fiber.
///
/// The currently supported configurations are:
///
/// * `name`: an associated name for diagnostics
/// * `stack_size`: the shadow stack window
/// * `unwind_size`: the save area for suspended frames
pub struct Builder {
    name: Option<String>,
    stack_size: usize,
    unwind_size: usize,
}

impl Builder {
    pub fn new() -> Self {
        Builder {
            name: None,
            stack_size: DEFAULT_STACK_SIZE,
            unwind_size: DEFAULT_UNWIND_SIZE,
        }
    }

    /// Names the fiber-to-be.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Sets the size of the stack window (in bytes) for the new fiber.
    /// Values below [`MIN_STACK_SIZE`] are raised to it.
    pub fn stack_size(mut self, stack_size: usize) -> Self {
        self.stack_size = stack_size.max(MIN_STACK_SIZE);
        self
    }

    /// Sets the size of the save area (in bytes) for the new fiber.
    pub fn unwind_size(mut self, unwind_size: usize) -> Self {
        self.unwind_size = round_up(unwind_size.max(UNWIND_HEADER * 2), 16);
        self
    }

    /// Create the fiber without scheduling it. It runs when something
    /// resumes it.
    pub fn finish<F>(self, f: F) -> Rc<Fiber>
    where
        F: FnOnce() + 'static,
    {
        let name = self.name.unwrap_or_else(default_name);
        Fiber::with_entry(name, self.stack_size, self.unwind_size, Box::new(f))
    }

    /// Create the fiber and append it to the run queue. The current fiber
    /// keeps running; the new fiber gets its first slice at the caller's
    /// next yield.
    pub fn spawn<F>(self, f: F) -> Rc<Fiber>
    where
        F: FnOnce() + 'static,
    {
        let fiber = self.finish(f);
        runtime::enqueue(fiber.clone());
        fiber
    }
}

impl Default for Builder {
    fn default() -> Self {
        Self::new()
    }
}

////////////////////////////////////////////////////////////////////////////////
// Free functions
////////////////////////////////////////////////////////////////////////////////

/// Create a new fiber with default parameters and schedule it. Spawn order
/// is first-run order: two fibers spawned back to back get their first
/// slices in spawn order at the caller's next yield.
pub fn spawn<F>(f: F) -> Rc<Fiber>
where
    F: FnOnce() + 'static,
{
    Builder::new().spawn(f)
}

/// The currently executing fiber.
pub fn current() -> Rc<Fiber> {
    runtime::current_fiber()
}

/// Yield control to the scheduler, keeping the current fiber runnable
/// behind everything already queued.
pub fn yield_now() {
    runtime::yield_now()
}

/// Put the whole runtime to sleep for at least `time`.
///
/// This blocks on the host with a single clock poll; it is not a fiber
/// switch and no other fiber runs in the meantime.
pub fn sleep(time: Duration) {
    let ns = time.as_nanos().min(i64::MAX as u128) as i64;
    event::with_loop(|lp| lp.sleep(ns));
}
