//! Quiescence barrier between invocations and session close
//!
//! Entry increments the in-flight counter and then checks the closing flag;
//! close sets the flag and then waits for the counter to drain. Both sides
//! use `SeqCst`, so an invocation either sees the flag and backs out, or is
//! counted before close starts waiting.

use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

#[derive(Debug, Default)]
pub struct InvocationGate {
    closing: AtomicBool,
    in_flight: AtomicUsize,
    lock: Mutex<()>,
    drained: Condvar,
}

impl InvocationGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Admit one invocation, or `None` once closing has begun
    pub fn enter(&self) -> Option<InvocationGuard<'_>> {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        if self.closing.load(Ordering::SeqCst) {
            self.exit();
            return None;
        }
        Some(InvocationGuard { gate: self })
    }

    fn exit(&self) {
        let previous = self.in_flight.fetch_sub(1, Ordering::SeqCst);
        if previous == 1 && self.closing.load(Ordering::SeqCst) {
            let _lock = self.lock.lock();
            self.drained.notify_all();
        }
    }

    /// Refuse new invocations and block until in-flight ones have returned
    ///
    /// Returns `true` for the call that actually closed the gate. Must not be
    /// called from inside an invocation admitted by this gate.
    pub fn close(&self) -> bool {
        let first = !self.closing.swap(true, Ordering::SeqCst);
        let mut lock = self.lock.lock();
        while self.in_flight.load(Ordering::SeqCst) != 0 {
            self.drained.wait(&mut lock);
        }
        first
    }

    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }
}

/// Admission ticket for one invocation; leaving scope exits the gate
#[derive(Debug)]
pub struct InvocationGuard<'a> {
    gate: &'a InvocationGate,
}

impl Drop for InvocationGuard<'_> {
    fn drop(&mut self) {
        self.gate.exit();
    }
}
