//! Readiness signaling primitive.
//!
//! Ported from the original `Gate` class: a tiny open/closed state guarded by
//! a condition variable, used to let one thread block until another reaches
//! a particular state (e.g. the main thread waiting for the netlink
//! collector to finish acquiring the audit pid, or a test waiting for a
//! background thread's transition).

use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateState {
    Open,
    Closed,
}

pub struct Gate {
    state: Mutex<GateState>,
    cond: Condvar,
}

impl Gate {
    pub fn new(initial: GateState) -> Self {
        Gate {
            state: Mutex::new(initial),
            cond: Condvar::new(),
        }
    }

    pub fn open(&self) {
        let mut state = self.state.lock().unwrap();
        if *state != GateState::Open {
            *state = GateState::Open;
            self.cond.notify_all();
        }
    }

    pub fn close(&self) {
        let mut state = self.state.lock().unwrap();
        if *state != GateState::Closed {
            *state = GateState::Closed;
            self.cond.notify_all();
        }
    }

    pub fn state(&self) -> GateState {
        *self.state.lock().unwrap()
    }

    /// Blocks until the gate reaches `target`, or returns `false` on timeout.
    pub fn wait(&self, target: GateState, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock().unwrap();
        while *state != target {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (guard, result) = self.cond.wait_timeout(state, deadline - now).unwrap();
            state = guard;
            if result.timed_out() && *state != target {
                return false;
            }
        }
        true
    }
}

impl Default for Gate {
    fn default() -> Self {
        Gate::new(GateState::Closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn wait_returns_once_opened_from_another_thread() {
        let gate = Arc::new(Gate::default());
        let g2 = gate.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            g2.open();
        });
        assert!(gate.wait(GateState::Open, Duration::from_secs(1)));
    }

    #[test]
    fn wait_times_out_when_never_opened() {
        let gate = Gate::default();
        assert!(!gate.wait(GateState::Open, Duration::from_millis(20)));
    }
}
