//! The single-threaded WASI event loop.
//!
//! Every declared interest — a timer, or readiness of a descriptor with an
//! optional timeout — is a [`PendingEvent`]. One [`EventLoop::run`] drains
//! them all into a single `poll_oneoff`, dispatches what fired and
//! re-queues the rest. Descriptor timeouts become *companion* clock
//! subscriptions sharing an even/odd userdata pair with the descriptor
//! subscription; when both fire in one batch the readiness wins and the
//! companion is suppressed.
//!
//! The loop promises callers at most one dispatch per pending event per
//! `run`. It never raises: dispatch-time faults are converted into a
//! resume with `timed_out` set.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::{Rc, Weak};
use std::time::Duration;

use crate::clock;
use crate::ffi::wasi as sys;
use crate::fiber::Fiber;
use crate::io::EventedIo;
use crate::runtime;

/// Poll window used when the loop blocks with nothing registered, to yield
/// to the host without spinning.
const IDLE_POLL_NS: u64 = 100_000_000;

/// Userdata of the zero-duration filler subscription that makes a
/// non-blocking poll return immediately.
const SENTINEL: u64 = u64::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Timeout,
    FdRead,
    FdWrite,
}

/// A declared interest, bound to the loop it was created by.
///
/// Timeout events weakly reference the fiber they resume; descriptor events
/// weakly reference their I/O target. The references are weak on purpose:
/// an event must never keep its waiter alive.
pub struct Event {
    kind: EventKind,
    fiber: Option<Weak<Fiber>>,
    target: Option<Weak<dyn EventedIo>>,
    fd: sys::Fd,
    /// Armed deadline of a Timeout event; the waiter's own deadline must
    /// still match at dispatch time or the timer is stale.
    deadline: Cell<Option<u64>>,
}

impl Event {
    #[inline(always)]
    pub fn kind(&self) -> EventKind {
        self.kind
    }

    /// Register the interest with the loop.
    ///
    /// With a duration, descriptor kinds get a companion clock and Timeout
    /// kinds fire after the duration. With `None`, a Timeout event fires on
    /// the loop's next run and descriptor kinds wait indefinitely.
    pub fn add(self: &Rc<Self>, timeout: Option<Duration>) {
        let timeout_ns = timeout.map(duration_ns);
        if self.kind == EventKind::Timeout {
            if let Some(ns) = timeout_ns {
                let deadline = clock::monotonic64().saturating_add(ns);
                self.deadline.set(Some(deadline));
                if let Some(fiber) = self.fiber.as_ref().and_then(Weak::upgrade) {
                    fiber.set_deadline(Some(deadline));
                }
            } else {
                self.deadline.set(None);
            }
        }
        with_loop(|lp| {
            lp.pending.borrow_mut().push_back(PendingEvent {
                event: self.clone(),
                timeout_ns,
            })
        });
    }

    /// Remove the interest if currently registered. Safe to call
    /// repeatedly.
    pub fn delete(self: &Rc<Self>) {
        with_loop(|lp| {
            lp.pending
                .borrow_mut()
                .retain(|pe| !Rc::ptr_eq(&pe.event, self))
        });
    }
}

/// An interest waiting for the next `poll_oneoff`.
struct PendingEvent {
    event: Rc<Event>,
    timeout_ns: Option<u64>,
}

pub struct EventLoop {
    /// The loop's only mutable state: interests in registration order.
    pending: RefCell<VecDeque<PendingEvent>>,
}

thread_local! {
    static EVENT_LOOP: EventLoop = EventLoop {
        pending: RefCell::new(VecDeque::new()),
    };
}

/// Access the process-wide event loop.
pub fn with_loop<R>(f: impl FnOnce(&EventLoop) -> R) -> R {
    EVENT_LOOP.with(f)
}

impl EventLoop {
    pub fn create_timeout_event(&self, fiber: &Rc<Fiber>) -> Rc<Event> {
        Rc::new(Event {
            kind: EventKind::Timeout,
            fiber: Some(Rc::downgrade(fiber)),
            target: None,
            fd: 0,
            deadline: Cell::new(None),
        })
    }

    pub fn create_fd_read_event(&self, io: Rc<dyn EventedIo>) -> Rc<Event> {
        Rc::new(Event {
            kind: EventKind::FdRead,
            fiber: None,
            fd: io.fd(),
            target: Some(Rc::downgrade(&io)),
            deadline: Cell::new(None),
        })
    }

    pub fn create_fd_write_event(&self, io: Rc<dyn EventedIo>) -> Rc<Event> {
        Rc::new(Event {
            kind: EventKind::FdWrite,
            fiber: None,
            fd: io.fd(),
            target: Some(Rc::downgrade(&io)),
            deadline: Cell::new(None),
        })
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.borrow().is_empty()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.borrow().len()
    }

    /// One tick: submit every pending interest in a single `poll_oneoff`,
    /// dispatch readiness, re-queue what did not fire.
    ///
    /// With `blocking == false` a zero-duration filler subscription makes
    /// the syscall return immediately. Always reports more work possible:
    /// in a single-threaded sandbox the loop cannot know otherwise.
    pub fn run(&self, blocking: bool) -> bool {
        let drained: Vec<PendingEvent> = self.pending.borrow_mut().drain(..).collect();
        let subs = subscriptions_for(&drained, blocking);
        let mut out: Vec<sys::Event> = Vec::with_capacity(subs.len());
        let received = unsafe { sys::poll_oneoff(subs.as_ptr(), out.as_mut_ptr(), subs.len()) };
        let received = match received {
            Ok(n) => n,
            Err(errno) => {
                // The loop never raises; every waiter resumes as timed out.
                log::error!("poll_oneoff failed: {:?}", errno);
                for pe in &drained {
                    deliver(pe, true);
                }
                return true;
            }
        };
        // `out` is bare capacity. On success the host has written one fully
        // initialized `Event` per returned subscription, never more than
        // `subs.len()`, so exactly the first `received` slots may be
        // exposed.
        unsafe { out.set_len(received.min(subs.len())) };

        let (plan, fired) = dispatch_plan(drained.len(), &out);
        for &(index, timed_out) in &plan {
            deliver(&drained[index], timed_out);
        }
        let mut pending = self.pending.borrow_mut();
        for (index, pe) in drained.into_iter().enumerate() {
            if !fired[index] {
                pending.push_back(pe);
            }
        }
        true
    }

    /// Block the whole runtime on one clock subscription. Not a fiber
    /// switch; negative durations clamp to zero.
    pub fn sleep(&self, timeout_ns: i64) {
        let ns = if timeout_ns < 0 { 0 } else { timeout_ns as u64 };
        let sub = clock_subscription(SENTINEL, ns);
        let mut out: Vec<sys::Event> = Vec::with_capacity(1);
        if let Err(errno) = unsafe { sys::poll_oneoff(&sub, out.as_mut_ptr(), 1) } {
            log::error!("sleep poll failed: {:?}", errno);
        }
    }

    /// Wake the loop from another thread. There are no other threads in the
    /// sandbox, so this does nothing.
    pub fn interrupt(&self) {}
}

/// Hand a fired (or faulted) interest to its waiter.
fn deliver(pe: &PendingEvent, timed_out: bool) {
    match pe.event.kind {
        EventKind::Timeout => {
            let fiber = match pe.event.fiber.as_ref().and_then(Weak::upgrade) {
                Some(fiber) => fiber,
                None => return,
            };
            match pe.event.deadline.get() {
                // A stale timer must not wake a fiber whose wait was
                // already satisfied: the armed deadline has to match.
                Some(deadline) => {
                    if fiber.deadline_matches(deadline, clock::monotonic64()) {
                        fiber.set_deadline(None);
                        runtime::unpark(fiber);
                    }
                }
                // Zero-duration wakeup with no guard in force.
                None => runtime::unpark(fiber),
            }
        }
        EventKind::FdRead => {
            if let Some(target) = pe.event.target.as_ref().and_then(Weak::upgrade) {
                target.resume_read(timed_out);
            }
        }
        EventKind::FdWrite => {
            if let Some(target) = pe.event.target.as_ref().and_then(Weak::upgrade) {
                target.resume_write(timed_out);
            }
        }
    }
}

/// Build the subscription set for one poll, in registration order: the
/// subscription for pending index `i` carries userdata `2i`, its companion
/// clock `2i + 1`.
fn subscriptions_for(pending: &[PendingEvent], blocking: bool) -> Vec<sys::Subscription> {
    if pending.is_empty() {
        // Nothing registered: one minimal clock, long enough to yield to
        // the host when blocking, zero otherwise.
        let ns = if blocking { IDLE_POLL_NS } else { 0 };
        return vec![clock_subscription(SENTINEL, ns)];
    }
    let mut subs = Vec::with_capacity(pending.len() * 2 + 1);
    for (index, pe) in pending.iter().enumerate() {
        let userdata = (index as u64) * 2;
        match pe.event.kind {
            EventKind::Timeout => {
                subs.push(clock_subscription(userdata, pe.timeout_ns.unwrap_or(0)));
            }
            EventKind::FdRead => {
                subs.push(fd_subscription(userdata, sys::EVENTTYPE_FD_READ, pe.event.fd));
                if let Some(ns) = pe.timeout_ns {
                    subs.push(clock_subscription(userdata + 1, ns));
                }
            }
            EventKind::FdWrite => {
                subs.push(fd_subscription(userdata, sys::EVENTTYPE_FD_WRITE, pe.event.fd));
                if let Some(ns) = pe.timeout_ns {
                    subs.push(clock_subscription(userdata + 1, ns));
                }
            }
        }
    }
    if !blocking {
        subs.push(clock_subscription(SENTINEL, 0));
    }
    subs
}

/// Decide which pending indices to dispatch, in what order, and whether as
/// a timeout. Primaries outrank their companions: readiness and its timeout
/// may both fire in one batch, and the timeout wins only if the descriptor
/// did not. A subscription-level error also dispatches as a timeout.
fn dispatch_plan(pending_len: usize, results: &[sys::Event]) -> (Vec<(usize, bool)>, Vec<bool>) {
    let mut fired = vec![false; pending_len];
    let mut plan = Vec::with_capacity(results.len());
    for &companion_pass in &[false, true] {
        for ev in results {
            let (index, companion) = match decode_userdata(ev.userdata) {
                Some(decoded) => decoded,
                None => continue,
            };
            if companion != companion_pass || index >= pending_len || fired[index] {
                continue;
            }
            fired[index] = true;
            plan.push((index, companion || ev.error != sys::ERRNO_SUCCESS));
        }
    }
    (plan, fired)
}

/// `(pending index, is companion)` from a result's userdata; `None` for the
/// filler sentinel.
fn decode_userdata(userdata: u64) -> Option<(usize, bool)> {
    if userdata == SENTINEL {
        return None;
    }
    Some(((userdata / 2) as usize, userdata & 1 == 1))
}

fn duration_ns(d: Duration) -> u64 {
    d.as_nanos().min(u64::MAX as u128) as u64
}

fn clock_subscription(userdata: u64, timeout_ns: u64) -> sys::Subscription {
    sys::Subscription {
        userdata,
        u: sys::SubscriptionU {
            tag: sys::EVENTTYPE_CLOCK.raw(),
            u: sys::SubscriptionUU {
                clock: sys::SubscriptionClock {
                    id: sys::CLOCKID_MONOTONIC,
                    timeout: timeout_ns,
                    precision: 0,
                    // Relative to now.
                    flags: 0,
                },
            },
        },
    }
}

fn fd_subscription(userdata: u64, kind: sys::Eventtype, fd: sys::Fd) -> sys::Subscription {
    let fd_readwrite = sys::SubscriptionFdReadwrite {
        file_descriptor: fd,
    };
    sys::Subscription {
        userdata,
        u: sys::SubscriptionU {
            tag: kind.raw(),
            u: if kind == sys::EVENTTYPE_FD_WRITE {
                sys::SubscriptionUU {
                    fd_write: fd_readwrite,
                }
            } else {
                sys::SubscriptionUU {
                    fd_read: fd_readwrite,
                }
            },
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::FileDescriptor;
    use pretty_assertions::assert_eq;

    fn timeout_pending(ns: Option<u64>) -> PendingEvent {
        let fiber = crate::fiber::Builder::new().name("t").finish(|| {});
        let event = with_loop(|lp| lp.create_timeout_event(&fiber));
        // Keep the fiber alive through the weak reference for the test's
        // duration by leaking a strong handle.
        std::mem::forget(fiber);
        PendingEvent {
            event,
            timeout_ns: ns,
        }
    }

    fn fd_pending(kind: EventKind, fd: u32, ns: Option<u64>) -> PendingEvent {
        let target = FileDescriptor::new(fd);
        let event = with_loop(|lp| match kind {
            EventKind::FdRead => lp.create_fd_read_event(target.clone()),
            EventKind::FdWrite => lp.create_fd_write_event(target.clone()),
            EventKind::Timeout => unreachable!(),
        });
        std::mem::forget(target);
        PendingEvent {
            event,
            timeout_ns: ns,
        }
    }

    fn result_event(userdata: u64, type_: sys::Eventtype, error: sys::Errno) -> sys::Event {
        sys::Event {
            userdata,
            error,
            type_,
            fd_readwrite: sys::EventFdReadwrite {
                nbytes: 0,
                flags: 0,
            },
        }
    }

    #[test]
    fn empty_pending_yields_one_idle_clock() {
        let subs = subscriptions_for(&[], true);
        assert_eq!(subs.len(), 1);
        assert_eq!(subs[0].userdata, SENTINEL);
        assert_eq!(unsafe { subs[0].u.u.clock.timeout }, IDLE_POLL_NS);

        let subs = subscriptions_for(&[], false);
        assert_eq!(unsafe { subs[0].u.u.clock.timeout }, 0);
    }

    #[test]
    fn fd_event_with_timeout_gets_companion_clock() {
        let pending = vec![fd_pending(EventKind::FdRead, 7, Some(5_000_000))];
        let subs = subscriptions_for(&pending, true);
        assert_eq!(subs.len(), 2);
        assert_eq!(subs[0].userdata, 0);
        assert_eq!(subs[0].u.tag, sys::EVENTTYPE_FD_READ.raw());
        assert_eq!(unsafe { subs[0].u.u.fd_read.file_descriptor }, 7);
        assert_eq!(subs[1].userdata, 1);
        assert_eq!(subs[1].u.tag, sys::EVENTTYPE_CLOCK.raw());
        assert_eq!(unsafe { subs[1].u.u.clock.timeout }, 5_000_000);
    }

    #[test]
    fn nonblocking_run_appends_filler_sentinel() {
        let pending = vec![timeout_pending(Some(1))];
        let subs = subscriptions_for(&pending, false);
        assert_eq!(subs.last().map(|s| s.userdata), Some(SENTINEL));
        assert_eq!(unsafe { subs.last().unwrap().u.u.clock.timeout }, 0);
    }

    #[test]
    fn subscriptions_keep_registration_order() {
        let pending = vec![
            timeout_pending(Some(1)),
            fd_pending(EventKind::FdWrite, 4, None),
            fd_pending(EventKind::FdRead, 5, Some(2)),
        ];
        let subs = subscriptions_for(&pending, true);
        assert_eq!(
            subs.iter().map(|s| s.userdata).collect::<Vec<_>>(),
            vec![0, 2, 4, 5]
        );
    }

    #[test]
    fn userdata_round_trip() {
        assert_eq!(decode_userdata(0), Some((0, false)));
        assert_eq!(decode_userdata(1), Some((0, true)));
        assert_eq!(decode_userdata(6), Some((3, false)));
        assert_eq!(decode_userdata(7), Some((3, true)));
        assert_eq!(decode_userdata(SENTINEL), None);
    }

    #[test]
    fn readiness_outranks_companion_in_same_batch() {
        // Companion (ud 1) reported before the descriptor (ud 0); the
        // descriptor must still win and the index fires once.
        let results = vec![
            result_event(1, sys::EVENTTYPE_CLOCK, sys::ERRNO_SUCCESS),
            result_event(0, sys::EVENTTYPE_FD_READ, sys::ERRNO_SUCCESS),
        ];
        let (plan, fired) = dispatch_plan(1, &results);
        assert_eq!(plan, vec![(0, false)]);
        assert_eq!(fired, vec![true]);
    }

    #[test]
    fn companion_alone_dispatches_as_timeout() {
        let results = vec![result_event(3, sys::EVENTTYPE_CLOCK, sys::ERRNO_SUCCESS)];
        let (plan, fired) = dispatch_plan(2, &results);
        assert_eq!(plan, vec![(1, true)]);
        assert_eq!(fired, vec![false, true]);
    }

    #[test]
    fn subscription_error_counts_as_timeout() {
        let results = vec![result_event(0, sys::EVENTTYPE_FD_READ, sys::ERRNO_BADF)];
        let (plan, _) = dispatch_plan(1, &results);
        assert_eq!(plan, vec![(0, true)]);
    }

    #[test]
    fn sentinel_and_stale_results_are_ignored() {
        let results = vec![
            result_event(SENTINEL, sys::EVENTTYPE_CLOCK, sys::ERRNO_SUCCESS),
            // Userdata beyond the drained set (e.g. from a forgotten
            // subscription) must not dispatch anything.
            result_event(10, sys::EVENTTYPE_FD_READ, sys::ERRNO_SUCCESS),
        ];
        let (plan, fired) = dispatch_plan(2, &results);
        assert!(plan.is_empty());
        assert_eq!(fired, vec![false, false]);
    }

    #[test]
    fn at_most_one_dispatch_per_index() {
        let results = vec![
            result_event(0, sys::EVENTTYPE_FD_READ, sys::ERRNO_SUCCESS),
            result_event(0, sys::EVENTTYPE_FD_READ, sys::ERRNO_SUCCESS),
            result_event(1, sys::EVENTTYPE_CLOCK, sys::ERRNO_SUCCESS),
        ];
        let (plan, _) = dispatch_plan(1, &results);
        assert_eq!(plan.len(), 1);
    }

    #[test]
    fn delete_is_idempotent_and_removes_registration() {
        let fiber = crate::fiber::Builder::new().name("d").finish(|| {});
        let event = with_loop(|lp| lp.create_timeout_event(&fiber));
        with_loop(|lp| {
            lp.pending.borrow_mut().push_back(PendingEvent {
                event: event.clone(),
                timeout_ns: Some(1),
            })
        });
        assert!(with_loop(|lp| lp.has_pending()));
        event.delete();
        assert_eq!(with_loop(|lp| lp.pending_count()), 0);
        event.delete();
        assert_eq!(with_loop(|lp| lp.pending_count()), 0);
    }
}
