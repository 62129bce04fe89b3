//! Bounded admission of client sessions.
//!
//! The accept loop waits for capacity, accepts, and only then takes a
//! [`Permit`] which it hands to the session. Dropping the permit frees the
//! slot and wakes one blocked waiter, so the release happens exactly once
//! whatever way the session ends.

use std::num::NonZeroUsize;
use std::sync::Arc;

use parking_lot::{Condvar, Mutex, MutexGuard};
use tracing::debug;

pub struct AdmissionGate {
    max: usize,
    state: Mutex<GateState>,
    freed: Condvar,
}

struct GateState {
    active: usize,
    closed: bool,
}

impl AdmissionGate {
    pub fn new(max: NonZeroUsize) -> Arc<Self> {
        Arc::new(Self {
            max: max.get(),
            state: Mutex::new(GateState {
                active: 0,
                closed: false,
            }),
            freed: Condvar::new(),
        })
    }

    pub fn active(&self) -> usize {
        self.state.lock().active
    }

    /// Blocks until a slot is free without taking it. Returns `false` once the gate is closed.
    pub fn wait_for_capacity(&self) -> bool {
        let mut state = self.state.lock();
        self.wait_while_full(&mut state);
        !state.closed
    }

    /// Takes a slot if one is free right now.
    pub fn try_admit(self: &Arc<Self>) -> Option<Permit> {
        let mut state = self.state.lock();
        self.admit_locked(&mut state)
    }

    /// Refuses further admissions and wakes every blocked waiter.
    pub fn close(&self) {
        self.state.lock().closed = true;
        self.freed.notify_all();
    }

    fn wait_while_full(&self, state: &mut MutexGuard<'_, GateState>) {
        while state.active >= self.max && !state.closed {
            debug!(active = state.active, max = self.max, "at capacity, waiting");
            self.freed.wait(state);
        }
    }

    fn admit_locked(self: &Arc<Self>, state: &mut GateState) -> Option<Permit> {
        if state.closed || state.active >= self.max {
            return None;
        }
        state.active += 1;
        Some(Permit {
            gate: Arc::clone(self),
        })
    }

    fn release(&self) {
        let mut state = self.state.lock();
        state.active -= 1;
        debug!(active = state.active, max = self.max, "slot released");
        self.freed.notify_one();
    }
}

/// One occupied slot of an [`AdmissionGate`].
pub struct Permit {
    gate: Arc<AdmissionGate>,
}

impl Permit {
    pub fn active(&self) -> usize {
        self.gate.active()
    }
}

impl Drop for Permit {
    fn drop(&mut self) {
        self.gate.release();
    }
}

#[cfg(test)]
mod tests {
    use std::thread;
    use std::time::Duration;

    use crossbeam_channel::{bounded, RecvTimeoutError};

    use super::*;

    fn gate(max: usize) -> Arc<AdmissionGate> {
        AdmissionGate::new(NonZeroUsize::new(max).expect("non-zero"))
    }

    /// Admits the way the accept loop does, retrying if another admitter won the slot.
    fn admit(gate: &Arc<AdmissionGate>) -> Option<Permit> {
        loop {
            if !gate.wait_for_capacity() {
                return None;
            }
            if let Some(permit) = gate.try_admit() {
                return Some(permit);
            }
        }
    }

    #[test]
    fn admits_up_to_the_limit_then_waits() {
        let gate = gate(2);
        let first = gate.try_admit().expect("first");
        let _second = gate.try_admit().expect("second");
        assert_eq!(gate.active(), 2);
        assert!(gate.try_admit().is_none(), "full gate refuses");

        let (tx, rx) = bounded(1);
        let waiter = {
            let gate = Arc::clone(&gate);
            thread::spawn(move || {
                let permit = admit(&gate);
                let _ = tx.send(permit.is_some());
                permit
            })
        };
        assert_eq!(
            rx.recv_timeout(Duration::from_millis(100)).err(),
            Some(RecvTimeoutError::Timeout),
            "third admission waits"
        );

        drop(first);
        assert!(rx.recv_timeout(Duration::from_secs(2)).expect("admitted"));
        let third = waiter.join().expect("waiter");
        assert!(third.is_some());
        assert_eq!(gate.active(), 2);
    }

    #[test]
    fn capacity_wait_does_not_take_the_slot() {
        let gate = gate(1);
        assert!(gate.wait_for_capacity());
        assert_eq!(gate.active(), 0);

        let held = gate.try_admit().expect("free slot");

        let (tx, rx) = bounded(1);
        {
            let gate = Arc::clone(&gate);
            thread::spawn(move || {
                let _ = tx.send(gate.wait_for_capacity());
            });
        }
        assert_eq!(
            rx.recv_timeout(Duration::from_millis(50)).err(),
            Some(RecvTimeoutError::Timeout),
            "waits while full"
        );

        drop(held);
        assert!(rx.recv_timeout(Duration::from_secs(2)).expect("woken"));
        assert_eq!(gate.active(), 0);
    }

    #[test]
    fn close_releases_blocked_waiters() {
        let gate = gate(1);
        let _held = gate.try_admit().expect("held");

        let (tx, rx) = bounded(1);
        {
            let gate = Arc::clone(&gate);
            thread::spawn(move || {
                let _ = tx.send(gate.wait_for_capacity());
            });
        }
        thread::sleep(Duration::from_millis(50));
        gate.close();

        assert!(
            !rx.recv_timeout(Duration::from_secs(2)).expect("woken"),
            "closed gate reports no capacity"
        );
        assert!(gate.try_admit().is_none());
    }

    #[test]
    fn never_exceeds_the_limit_under_contention() {
        let gate = gate(3);
        let peak = Arc::new(Mutex::new(0usize));

        let workers: Vec<_> = (0..8)
            .map(|_| {
                let gate = Arc::clone(&gate);
                let peak = Arc::clone(&peak);
                thread::spawn(move || {
                    for _ in 0..50 {
                        let permit = admit(&gate).expect("open gate");
                        {
                            let mut peak = peak.lock();
                            *peak = (*peak).max(permit.active());
                        }
                        thread::yield_now();
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().expect("worker");
        }

        assert!(*peak.lock() <= 3);
        assert_eq!(gate.active(), 0);
    }
}
