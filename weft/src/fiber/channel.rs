//! Fiber-aware channels.
//!
//! Semantics are derived from the cooperative scheduler rather than from a
//! lock-based design: a channel keeps FIFO queues of parked senders and
//! receivers next to its buffer, and every handoff either moves a value
//! through the buffer or passes it directly to the longest-parked peer.
//! Rendezvous channels (capacity zero) with any number of pending pairs
//! drain strictly in order.
//!
//! All waiting goes through the scheduler's park/unpark and, for the
//! `*_timeout` forms, a timer event; wakeups may be spurious, so every wait
//! re-checks its condition.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::Rc;
use std::time::Duration;

use crate::event;
use crate::fiber::Fiber;
use crate::runtime;
use crate::StdResult;

/// Creates a new channel, returning the sender/receiver halves.
///
/// `capacity` is the number of values the channel buffers; zero makes every
/// send rendezvous with a receive. Values arrive in send order, and both
/// halves can be cloned.
pub fn channel<T>(capacity: usize) -> (Sender<T>, Receiver<T>) {
    let chan = Rc::new(Chan {
        capacity,
        buffer: RefCell::new(VecDeque::new()),
        send_waiters: RefCell::new(VecDeque::new()),
        recv_waiters: RefCell::new(VecDeque::new()),
        tx_count: Cell::new(1),
        rx_count: Cell::new(1),
    });
    (Sender(chan.clone()), Receiver(chan))
}

/// A fiber parked on the channel. The slot is full while a sender waits to
/// hand its value over, and empty while a receiver waits to be handed one.
struct Waiter<T> {
    fiber: Rc<Fiber>,
    slot: Cell<Option<T>>,
}

impl<T> Waiter<T> {
    fn slot_is_empty(&self) -> bool {
        let value = self.slot.take();
        let empty = value.is_none();
        self.slot.set(value);
        empty
    }
}

struct Chan<T> {
    capacity: usize,
    buffer: RefCell<VecDeque<T>>,
    send_waiters: RefCell<VecDeque<Rc<Waiter<T>>>>,
    recv_waiters: RefCell<VecDeque<Rc<Waiter<T>>>>,
    tx_count: Cell<usize>,
    rx_count: Cell<usize>,
}

impl<T> Chan<T> {
    fn send(&self, value: T, timeout: Option<Duration>) -> StdResult<(), SendError<T>> {
        if self.rx_count.get() == 0 {
            return Err(SendError::Disconnected(value));
        }
        // Direct handoff to the longest-parked receiver keeps pairs FIFO.
        if let Some(waiter) = self.pop_parked_receiver() {
            waiter.slot.set(Some(value));
            waiter.fiber.set_deadline(None);
            runtime::unpark(waiter.fiber.clone());
            return Ok(());
        }
        if self.buffer.borrow().len() < self.capacity {
            self.buffer.borrow_mut().push_back(value);
            return Ok(());
        }
        // Park with the value until a receiver takes it.
        let waiter = Rc::new(Waiter {
            fiber: runtime::current_fiber(),
            slot: Cell::new(Some(value)),
        });
        self.send_waiters.borrow_mut().push_back(waiter.clone());
        let timer = arm_timer(&waiter.fiber, timeout);
        loop {
            runtime::park();
            if waiter.slot_is_empty() {
                break;
            }
            // An armed timer that cleared the deadline has fired.
            if self.rx_count.get() == 0 || (timer.is_some() && waiter.fiber.deadline().is_none()) {
                break;
            }
        }
        disarm_timer(&waiter.fiber, timer);
        match waiter.slot.take() {
            None => Ok(()),
            Some(value) => {
                // Still undelivered: give the value back.
                self.remove_waiter(&self.send_waiters, &waiter);
                if self.rx_count.get() == 0 {
                    Err(SendError::Disconnected(value))
                } else {
                    Err(SendError::Timeout(value))
                }
            }
        }
    }

    fn recv(&self, timeout: Option<Duration>) -> StdResult<T, RecvError> {
        if let Some(value) = self.try_take() {
            return Ok(value);
        }
        if self.tx_count.get() == 0 {
            return Err(RecvError::Disconnected);
        }
        let waiter = Rc::new(Waiter {
            fiber: runtime::current_fiber(),
            slot: Cell::new(None),
        });
        self.recv_waiters.borrow_mut().push_back(waiter.clone());
        let timer = arm_timer(&waiter.fiber, timeout);
        loop {
            runtime::park();
            if !waiter.slot_is_empty() {
                break;
            }
            if self.tx_count.get() == 0 || (timer.is_some() && waiter.fiber.deadline().is_none()) {
                break;
            }
        }
        disarm_timer(&waiter.fiber, timer);
        match waiter.slot.take() {
            Some(value) => Ok(value),
            None => {
                self.remove_waiter(&self.recv_waiters, &waiter);
                // One more look at the buffer: a sender may have pushed
                // between the wakeup and this point.
                if let Some(value) = self.try_take() {
                    return Ok(value);
                }
                if self.tx_count.get() == 0 {
                    Err(RecvError::Disconnected)
                } else {
                    Err(RecvError::Timeout)
                }
            }
        }
    }

    /// Non-suspending take: the buffer first, then a parked sender.
    fn try_take(&self) -> Option<T> {
        let front = self.buffer.borrow_mut().pop_front();
        if let Some(value) = front {
            // Backfill the freed capacity from the longest-parked sender.
            if let Some(refill) = self.pop_parked_sender_value() {
                self.buffer.borrow_mut().push_back(refill);
            }
            return Some(value);
        }
        self.pop_parked_sender_value()
    }

    /// Pop the next parked sender, take its value and wake it.
    fn pop_parked_sender_value(&self) -> Option<T> {
        loop {
            let waiter = self.send_waiters.borrow_mut().pop_front()?;
            if let Some(value) = waiter.slot.take() {
                waiter.fiber.set_deadline(None);
                runtime::unpark(waiter.fiber.clone());
                return Some(value);
            }
            // Emptied by a raced timeout removal; skip it.
        }
    }

    fn pop_parked_receiver(&self) -> Option<Rc<Waiter<T>>> {
        loop {
            let waiter = self.recv_waiters.borrow_mut().pop_front()?;
            if waiter.slot_is_empty() {
                return Some(waiter);
            }
        }
    }

    fn remove_waiter(&self, queue: &RefCell<VecDeque<Rc<Waiter<T>>>>, waiter: &Rc<Waiter<T>>) {
        queue.borrow_mut().retain(|w| !Rc::ptr_eq(w, waiter));
    }

    fn wake_all(&self, queue: &RefCell<VecDeque<Rc<Waiter<T>>>>) {
        loop {
            let waiter = queue.borrow_mut().pop_front();
            match waiter {
                Some(waiter) => {
                    waiter.fiber.set_deadline(None);
                    runtime::unpark(waiter.fiber.clone());
                }
                None => break,
            }
        }
    }
}

fn arm_timer(fiber: &Rc<Fiber>, timeout: Option<Duration>) -> Option<Rc<event::Event>> {
    timeout.map(|timeout| {
        let timer = event::with_loop(|lp| lp.create_timeout_event(fiber));
        timer.add(Some(timeout));
        timer
    })
}

fn disarm_timer(fiber: &Rc<Fiber>, timer: Option<Rc<event::Event>>) {
    if let Some(timer) = timer {
        timer.delete();
    }
    fiber.set_deadline(None);
}

////////////////////////////////////////////////////////////////////////////////
// Sender
////////////////////////////////////////////////////////////////////////////////

/// The sending half of a channel. Can be cloned.
pub struct Sender<T>(Rc<Chan<T>>);

impl<T> Sender<T> {
    /// Send a value, suspending the calling fiber while the channel is
    /// full. Returns the value back if every receiver is gone.
    pub fn send(&self, value: T) -> StdResult<(), T> {
        self.0.send(value, None).map_err(|e| match e {
            SendError::Disconnected(value) => value,
            SendError::Timeout(_) => unreachable!("untimed send cannot time out"),
        })
    }

    /// Send with a deadline; on timeout the value comes back in the error.
    pub fn send_timeout(&self, value: T, timeout: Duration) -> StdResult<(), SendError<T>> {
        self.0.send(value, Some(timeout))
    }

    /// Send only if it can complete without suspending.
    pub fn try_send(&self, value: T) -> StdResult<(), TrySendError<T>> {
        if self.0.rx_count.get() == 0 {
            return Err(TrySendError::Disconnected(value));
        }
        if let Some(waiter) = self.0.pop_parked_receiver() {
            waiter.slot.set(Some(value));
            waiter.fiber.set_deadline(None);
            runtime::unpark(waiter.fiber.clone());
            return Ok(());
        }
        if self.0.buffer.borrow().len() < self.0.capacity {
            self.0.buffer.borrow_mut().push_back(value);
            return Ok(());
        }
        Err(TrySendError::Full(value))
    }
}

impl<T> Clone for Sender<T> {
    fn clone(&self) -> Self {
        self.0.tx_count.set(self.0.tx_count.get() + 1);
        Sender(self.0.clone())
    }
}

impl<T> Drop for Sender<T> {
    fn drop(&mut self) {
        let remaining = self.0.tx_count.get() - 1;
        self.0.tx_count.set(remaining);
        if remaining == 0 {
            // Parked receivers will observe the disconnect.
            self.0.wake_all(&self.0.recv_waiters);
        }
    }
}

////////////////////////////////////////////////////////////////////////////////
// Receiver
////////////////////////////////////////////////////////////////////////////////

/// The receiving half of a channel. Can be cloned.
pub struct Receiver<T>(Rc<Chan<T>>);

impl<T> Receiver<T> {
    /// Receive a value, suspending the calling fiber until one is
    /// available. `None` once the channel is empty and every sender is
    /// gone.
    pub fn recv(&self) -> Option<T> {
        match self.0.recv(None) {
            Ok(value) => Some(value),
            Err(RecvError::Disconnected) => None,
            Err(RecvError::Timeout) => unreachable!("untimed recv cannot time out"),
        }
    }

    /// Receive with a deadline.
    pub fn recv_timeout(&self, timeout: Duration) -> StdResult<T, RecvError> {
        self.0.recv(Some(timeout))
    }

    /// Receive only if a value is already available.
    pub fn try_recv(&self) -> StdResult<T, TryRecvError> {
        if let Some(value) = self.0.try_take() {
            return Ok(value);
        }
        if self.0.tx_count.get() == 0 {
            Err(TryRecvError::Disconnected)
        } else {
            Err(TryRecvError::Empty)
        }
    }

    pub fn iter(&self) -> Iter<'_, T> {
        Iter { rx: self }
    }
}

pub struct Iter<'a, T: 'a> {
    rx: &'a Receiver<T>,
}

impl<'a, T> Iterator for Iter<'a, T> {
    type Item = T;

    fn next(&mut self) -> Option<T> {
        self.rx.recv()
    }
}

impl<'a, T> IntoIterator for &'a Receiver<T> {
    type Item = T;
    type IntoIter = Iter<'a, T>;

    fn into_iter(self) -> Iter<'a, T> {
        self.iter()
    }
}

impl<T> Clone for Receiver<T> {
    fn clone(&self) -> Self {
        self.0.rx_count.set(self.0.rx_count.get() + 1);
        Receiver(self.0.clone())
    }
}

impl<T> Drop for Receiver<T> {
    fn drop(&mut self) {
        let remaining = self.0.rx_count.get() - 1;
        self.0.rx_count.set(remaining);
        if remaining == 0 {
            // Parked senders will observe the disconnect and keep their
            // values.
            self.0.wake_all(&self.0.send_waiters);
        }
    }
}

////////////////////////////////////////////////////////////////////////////////
// Errors
////////////////////////////////////////////////////////////////////////////////

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum SendError<T> {
    Timeout(T),
    Disconnected(T),
}

impl<T> SendError<T> {
    pub fn into_inner(self) -> T {
        match self {
            Self::Timeout(value) | Self::Disconnected(value) => value,
        }
    }
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum TrySendError<T> {
    Full(T),
    Disconnected(T),
}

impl<T> TrySendError<T> {
    pub fn into_inner(self) -> T {
        match self {
            Self::Full(value) | Self::Disconnected(value) => value,
        }
    }
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum RecvError {
    Timeout,
    Disconnected,
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum TryRecvError {
    Empty,
    Disconnected,
}

impl From<RecvError> for TryRecvError {
    fn from(e: RecvError) -> Self {
        match e {
            RecvError::Disconnected => Self::Disconnected,
            RecvError::Timeout => Self::Empty,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn try_send_and_try_recv_without_a_scheduler() {
        // Buffered paths never touch the scheduler, so they are exercisable
        // on the host.
        let (tx, rx) = channel::<u32>(2);
        tx.try_send(1).unwrap();
        tx.try_send(2).unwrap();
        assert_eq!(tx.try_send(3), Err(TrySendError::Full(3)));
        assert_eq!(rx.try_recv(), Ok(1));
        assert_eq!(rx.try_recv(), Ok(2));
        assert_eq!(rx.try_recv(), Err(TryRecvError::Empty));
    }

    #[test]
    fn disconnect_is_observable() {
        let (tx, rx) = channel::<u32>(1);
        tx.try_send(7).unwrap();
        drop(tx);
        assert_eq!(rx.try_recv(), Ok(7));
        assert_eq!(rx.try_recv(), Err(TryRecvError::Disconnected));

        let (tx, rx) = channel::<u32>(0);
        drop(rx);
        assert_eq!(tx.try_send(1), Err(TrySendError::Disconnected(1)));
    }

    #[test]
    fn cloned_halves_share_the_counts() {
        let (tx, rx) = channel::<u32>(1);
        let tx2 = tx.clone();
        drop(tx);
        tx2.try_send(9).unwrap();
        drop(tx2);
        assert_eq!(rx.try_recv(), Ok(9));
        assert_eq!(rx.try_recv(), Err(TryRecvError::Disconnected));
    }
}
