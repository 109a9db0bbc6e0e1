//! Scenario-test runner.
//!
//! Everything registered through `weft::scenarios!` needs real unwinding,
//! so this binary only means anything after the full build pipeline:
//!
//! ```sh
//! cargo build --target wasm32-wasip1 -p weft-scenario-tests
//! # instrument + merge the boundary module, see boundary/README.md
//! wasmtime run --dir=. merged.wasm
//! ```

use log::LevelFilter;

mod channels;
mod events;
mod fibers;
mod files;

fn main() {
    weft::log::init(LevelFilter::Info);
    weft::runtime::start(|| {
        let failed = weft::test::run();
        // Nothing may be left behind once the suite is done.
        assert_eq!(weft::runtime::state(), weft::runtime::State::Normal);
        assert_eq!(weft::event::with_loop(|lp| lp.pending_count()), 0);
        if failed > 0 {
            weft::runtime::exit(1);
        }
    });
}
