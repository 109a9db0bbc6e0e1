//! Channel scenarios: handoff across fibers, rendezvous ordering, receive
//! timeouts.

use std::rc::Rc;
use std::cell::RefCell;
use std::time::Duration;

use weft::event;
use weft::fiber::{self, channel::RecvError};

weft::scenarios! {
    fn values_cross_fibers_in_send_order() {
        let (tx, rx) = fiber::channel::<u32>(1);
        fiber::spawn(move || {
            tx.send(7).unwrap();
            tx.send(8).unwrap();
        });
        assert_eq!(rx.recv(), Some(7));
        assert_eq!(rx.recv(), Some(8));
        assert_eq!(rx.recv(), None);
    }

    fn rendezvous_pairs_drain_in_order() {
        let (tx, rx) = fiber::channel::<u32>(0);
        for value in 1..=3 {
            let tx = tx.clone();
            fiber::spawn(move || tx.send(value).unwrap());
        }
        drop(tx);
        // Let all three senders park on the rendezvous.
        fiber::yield_now();
        fiber::yield_now();
        fiber::yield_now();
        let got: Vec<u32> = (0..3).map(|_| rx.recv().unwrap()).collect();
        assert_eq!(got, vec![1, 2, 3]);
        assert_eq!(rx.recv(), None);
    }

    fn recv_timeout_expires_and_cleans_up() {
        let (tx, rx) = fiber::channel::<u32>(0);
        let before = weft::clock::monotonic64();
        let result = rx.recv_timeout(Duration::from_millis(10));
        let elapsed = weft::clock::monotonic64() - before;
        assert_eq!(result, Err(RecvError::Timeout));
        assert!(elapsed >= 10_000_000, "timed out after only {}ns", elapsed);
        assert_eq!(event::with_loop(|lp| lp.pending_count()), 0);
        drop(tx);
    }

    fn send_timeout_returns_the_value() {
        let (tx, rx) = fiber::channel::<u32>(0);
        let err = tx.send_timeout(5, Duration::from_millis(5)).unwrap_err();
        assert_eq!(err.into_inner(), 5);
        assert_eq!(event::with_loop(|lp| lp.pending_count()), 0);
        drop(rx);
    }

    fn a_timed_out_sender_does_not_ghost_deliver() {
        let (tx, rx) = fiber::channel::<u32>(0);
        let log: Rc<RefCell<Vec<u32>>> = Rc::new(RefCell::new(Vec::new()));
        let l2 = log.clone();
        let tx2 = tx.clone();
        fiber::spawn(move || {
            // Times out: nothing receives for 5ms.
            if tx2.send_timeout(1, Duration::from_millis(5)).is_err() {
                l2.borrow_mut().push(100);
            }
        });
        // Parking on a second channel spins the event loop long enough for
        // the sender's timeout to fire and be observed.
        let (_keep, parked) = fiber::channel::<u32>(0);
        assert_eq!(
            parked.recv_timeout(Duration::from_millis(20)),
            Err(RecvError::Timeout)
        );
        assert!(log.borrow().contains(&100));
        // The timed-out value must be gone: only the fresh send arrives.
        fiber::spawn(move || tx.send(2).unwrap());
        fiber::yield_now();
        assert_eq!(rx.recv(), Some(2));
    }
}
