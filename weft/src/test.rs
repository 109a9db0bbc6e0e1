//! Harness for behavior that only exists under real unwinding: the
//! scenario suite registers here and executes inside the instrumented
//! module (see the `tests` workspace member).
//!
//! [`run`] gives every case a fiber of its own, so a failing case takes
//! down nothing but itself, and checks between cases that the runtime went
//! quiescent again: unwind state back at rest, no pending events left
//! behind, and the waiting runner rewound through the program-entry path.

use std::panic;

use crate::event;
use crate::fiber;
use crate::runtime::{self, State};

pub struct TestCase {
    name: &'static str,
    f: fn(),
}

impl TestCase {
    pub const fn named(name: &'static str, f: fn()) -> Self {
        TestCase { name, f }
    }
}

/// Declare scenario cases.
///
/// # Example
/// ```ignore
/// weft::scenarios! {
///     fn switches_back_and_forth() {
///         weft::fiber::yield_now();
///     }
/// }
/// ```
#[macro_export]
macro_rules! scenarios {
    ($(fn $case:ident () $body:block)+) => {
        $(
            #[::linkme::distributed_slice($crate::test::SCENARIOS)]
            #[allow(non_upper_case_globals)]
            static $case: $crate::test::TestCase =
                $crate::test::TestCase::named(::std::stringify!($case), || $body);
        )+
    }
}

#[linkme::distributed_slice]
pub static SCENARIOS: [TestCase] = [..];

/// Run every registered case, each on a freshly spawned fiber, while the
/// calling fiber parks on the verdict. Call it from the program's initial
/// fiber. Returns the failure count; details go through the log.
pub fn run() -> usize {
    let mut failed = 0;
    for case in SCENARIOS.iter() {
        log::info!("scenario {} ...", case.name);
        let (entry_rewinds_before, _) = runtime::rewind_counts();
        let (verdict_tx, verdict_rx) = fiber::channel::<bool>(0);
        let f = case.f;
        fiber::Builder::new().name(case.name).spawn(move || {
            let passed = panic::catch_unwind(f).is_ok();
            let _ = verdict_tx.send(passed);
        });
        if verdict_rx.recv() != Some(true) {
            log::error!("scenario {} FAILED", case.name);
            failed += 1;
        }
        // Parking on the verdict suspended this fiber, so collecting it
        // must have rewound us through the program-entry path; anything
        // else is a quiescence violation a later case would trip over.
        let (entry_rewinds_after, _) = runtime::rewind_counts();
        if runtime::state() != State::Normal
            || event::with_loop(|lp| lp.pending_count()) != 0
            || entry_rewinds_after == entry_rewinds_before
        {
            log::error!("scenario {} left the runtime dirty", case.name);
            failed += 1;
        }
    }
    log::info!("{} scenario(s), {} failed", SCENARIOS.len(), failed);
    failed
}
