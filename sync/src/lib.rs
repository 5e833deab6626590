// SPDX-FileCopyrightText: 2023 Rivos Inc.
//
// SPDX-License-Identifier: Apache-2.0

//! # Synchronization primitives.
//!
//! Spin locks for short critical sections are re-exported from the `spin`
//! crate. On top of those this crate provides the two blocking primitives the
//! driver core needs: a condition-variable backed [`WaitQueue`] and a
//! [`SignalToken`] modelling per-task signal-pending state for interruptible
//! waits.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

pub use spin::{Mutex as SpinMutex, MutexGuard as SpinMutexGuard, Once, RwLock as SpinRwLock};

/// Returned by interruptible waits when a signal became pending before the
/// wait condition was satisfied.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Interrupted;

/// Per-task signal-pending state. Cloning shares the underlying flag so a
/// test (or an embedder's signal handler) can raise a signal against a thread
/// that is blocked in the core.
#[derive(Clone, Default)]
pub struct SignalToken {
    pending: Arc<AtomicBool>,
}

impl SignalToken {
    /// Creates a token with no signal pending.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns whether a signal is pending.
    pub fn pending(&self) -> bool {
        self.pending.load(Ordering::Acquire)
    }

    /// Marks a signal as pending, interrupting future (and in-progress)
    /// interruptible waits against this token.
    pub fn raise(&self) {
        self.pending.store(true, Ordering::Release);
    }

    /// Clears the pending state.
    pub fn clear(&self) {
        self.pending.store(false, Ordering::Release);
    }

    /// Sleeps for `dur`, waking early with `Err(Interrupted)` if a signal
    /// becomes pending. The sleep is chunked; delivery latency is bounded by
    /// the chunk interval.
    pub fn sleep_interruptible(&self, dur: Duration) -> Result<(), Interrupted> {
        const CHUNK: Duration = Duration::from_millis(1);
        let mut remaining = dur;
        while !remaining.is_zero() {
            if self.pending() {
                return Err(Interrupted);
            }
            let step = remaining.min(CHUNK);
            std::thread::sleep(step);
            remaining -= step;
        }
        if self.pending() {
            return Err(Interrupted);
        }
        Ok(())
    }
}

/// A wait queue in the kernel `wait_event()` mold: waiters block until a
/// caller-supplied predicate holds, wakers call [`WaitQueue::notify_all`]
/// after publishing the state change.
///
/// The internal mutex is only a rendezvous point. Wakers must publish their
/// state change before notifying and must not hold their own state locks
/// across the notify call; a waiter holds the queue lock from predicate
/// check to sleep, so a concurrent notify cannot slip in between.
pub struct WaitQueue {
    lock: Mutex<()>,
    cond: Condvar,
}

impl WaitQueue {
    pub const fn new() -> Self {
        Self {
            lock: Mutex::new(()),
            cond: Condvar::new(),
        }
    }

    /// Wakes every thread blocked on this queue.
    pub fn notify_all(&self) {
        let _guard = self.lock.lock().unwrap();
        self.cond.notify_all();
    }

    /// Blocks until `cond()` returns true.
    pub fn wait_until<F: FnMut() -> bool>(&self, mut cond: F) {
        let mut guard = self.lock.lock().unwrap();
        while !cond() {
            guard = self.cond.wait(guard).unwrap();
        }
    }

    /// Blocks until `cond()` returns true or a signal is raised on
    /// `signals`. Signal delivery has no waker attached to the queue, so the
    /// wait polls on a short timeout.
    pub fn wait_interruptible<F: FnMut() -> bool>(
        &self,
        signals: &SignalToken,
        mut cond: F,
    ) -> Result<(), Interrupted> {
        const POLL: Duration = Duration::from_millis(2);
        let mut guard = self.lock.lock().unwrap();
        loop {
            if cond() {
                return Ok(());
            }
            if signals.pending() {
                return Err(Interrupted);
            }
            let (next, _timeout) = self.cond.wait_timeout(guard, POLL).unwrap();
            guard = next;
        }
    }
}

impl Default for WaitQueue {
    fn default() -> Self {
        Self::new()
    }
}
