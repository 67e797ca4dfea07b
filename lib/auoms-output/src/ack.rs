//! In-flight acknowledgement tracking (spec.md §4.6: "an optional
//! `AckQueue` (a ring of in-flight event ids, default 100 slots)").
//!
//! The ring doubles as the backpressure valve ack-mode outputs use: once
//! `capacity` ids are in flight, [`AckQueue::push`] blocks until the ack
//! reader thread drains one (spec.md §8 "Oversubscribed cursor (commit-mode
//! with ack_queue_size=1) blocks the output at one in-flight event until
//! acked").

use std::collections::VecDeque;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use auoms_common::writer::EventId;

/// One pending delivery: the event's identity plus the queue coordinates
/// needed to commit the cursor once it is acked (spec.md §4.6 step 5).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingAck {
    pub id: EventId,
    pub priority: u32,
    pub seq: u64,
}

struct Inner {
    entries: VecDeque<PendingAck>,
    closed: bool,
}

/// A bounded FIFO of events awaiting acknowledgement from the peer.
pub struct AckQueue {
    capacity: usize,
    state: Mutex<Inner>,
    not_full: Condvar,
    not_empty: Condvar,
}

impl AckQueue {
    pub fn new(capacity: usize) -> Self {
        AckQueue {
            capacity: capacity.max(1),
            state: Mutex::new(Inner {
                entries: VecDeque::new(),
                closed: false,
            }),
            not_full: Condvar::new(),
            not_empty: Condvar::new(),
        }
    }

    /// Pushes a pending ack, blocking while the ring is full. Returns
    /// `false` if the queue was closed before room became available.
    pub fn push(&self, entry: PendingAck) -> bool {
        let mut inner = self.state.lock();
        while inner.entries.len() >= self.capacity && !inner.closed {
            self.not_full.wait(&mut inner);
        }
        if inner.closed {
            return false;
        }
        inner.entries.push_back(entry);
        self.not_empty.notify_one();
        true
    }

    /// Pops every entry whose id is `<= up_to` (spec.md §6 "Ack ...
    /// acknowledging all events with id ≤ this"), returning the highest
    /// `(priority, seq)` committed per priority.
    pub fn ack_up_to(&self, up_to: EventId) -> Vec<PendingAck> {
        let mut inner = self.state.lock();
        let mut acked = Vec::new();
        while let Some(front) = inner.entries.front() {
            if front.id > up_to {
                break;
            }
            acked.push(inner.entries.pop_front().unwrap());
        }
        if !acked.is_empty() {
            self.not_full.notify_all();
        }
        acked
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Waits briefly for in-flight acks to drain (spec.md §4.6 "Stopping
    /// ... waits briefly for in-flight acks").
    pub fn wait_drained(&self, timeout: Duration) {
        let mut inner = self.state.lock();
        let deadline = std::time::Instant::now() + timeout;
        while !inner.entries.is_empty() {
            let now = std::time::Instant::now();
            if now >= deadline {
                return;
            }
            let result = self.not_empty.wait_for(&mut inner, deadline - now);
            if result.timed_out() {
                return;
            }
        }
    }

    /// Unblocks every waiter; subsequent pushes fail immediately.
    pub fn close(&self) {
        let mut inner = self.state.lock();
        inner.closed = true;
        self.not_full.notify_all();
        self.not_empty.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(serial: u64) -> EventId {
        EventId::new(1, 0, serial)
    }

    #[test]
    fn push_and_ack_in_order() {
        let queue = AckQueue::new(4);
        assert!(queue.push(PendingAck { id: id(1), priority: 0, seq: 1 }));
        assert!(queue.push(PendingAck { id: id(2), priority: 0, seq: 2 }));
        assert!(queue.push(PendingAck { id: id(3), priority: 0, seq: 3 }));

        let acked = queue.ack_up_to(id(2));
        assert_eq!(acked.len(), 2);
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn full_queue_blocks_until_drained() {
        use std::sync::Arc;
        use std::thread;

        let queue = Arc::new(AckQueue::new(1));
        assert!(queue.push(PendingAck { id: id(1), priority: 0, seq: 1 }));

        let q2 = queue.clone();
        let handle = thread::spawn(move || q2.push(PendingAck { id: id(2), priority: 0, seq: 2 }));

        thread::sleep(Duration::from_millis(30));
        assert_eq!(queue.len(), 1, "second push should still be blocked");

        queue.ack_up_to(id(1));
        assert!(handle.join().unwrap());
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn close_unblocks_pending_pushers() {
        use std::sync::Arc;
        use std::thread;

        let queue = Arc::new(AckQueue::new(1));
        assert!(queue.push(PendingAck { id: id(1), priority: 0, seq: 1 }));

        let q2 = queue.clone();
        let handle = thread::spawn(move || q2.push(PendingAck { id: id(2), priority: 0, seq: 2 }));
        thread::sleep(Duration::from_millis(30));
        queue.close();
        assert!(!handle.join().unwrap());
    }
}
