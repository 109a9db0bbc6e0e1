//! Event loop scenarios against real descriptors: readiness, companion
//! timeouts, loop hygiene.

use std::time::Duration;

use weft::event;
use weft::io::{EventedIo, FileDescriptor};

weft::scenarios! {
    fn stdout_reports_writable_before_the_timeout() {
        let out = FileDescriptor::new(1);
        out.wait_writable(Some(Duration::from_millis(100))).unwrap();
        assert_eq!(event::with_loop(|lp| lp.pending_count()), 0);
        // Never close the process's stdout.
        std::mem::forget(out);
    }

    fn evented_write_reaches_stdout() {
        let out = FileDescriptor::new(1);
        let n = out.write(b"scenario suite says hello\n").unwrap();
        assert!(n > 0);
        std::mem::forget(out);
    }

    fn nonblocking_run_returns_immediately() {
        let before = weft::clock::monotonic64();
        event::with_loop(|lp| lp.run(false));
        let elapsed = weft::clock::monotonic64() - before;
        // The zero-duration filler keeps the poll from parking the runtime.
        assert!(elapsed < 50_000_000, "non-blocking run took {}ns", elapsed);
    }

    fn interrupt_is_a_no_op() {
        event::with_loop(|lp| lp.interrupt());
        assert_eq!(event::with_loop(|lp| lp.pending_count()), 0);
    }
}
