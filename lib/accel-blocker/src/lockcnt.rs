// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A usage counter which can be closed to new users.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex};

const LOCKED: usize = 1;
const COUNT_STEP: usize = 2;

/// Reference count combined with an exclusion mode.
///
/// While the counter is open, [`GuardedCounter::increment`] and
/// [`GuardedCounter::decrement`] are single atomic operations on a word which
/// holds both the in-flight count and the lock bit.  Once
/// [`GuardedCounter::lock`] sets that bit, no further increment can complete
/// until [`GuardedCounter::unlock`], while those already counted remain free
/// to decrement.  Because both the increment and the lock are CAS operations
/// on the same word, an increment racing with `lock()` is either counted
/// before the lock took effect, or parks until the counter is unlocked.
///
/// The lock holder is expected to poll [`GuardedCounter::count`] until it
/// drains; this type does not itself wait for the count to reach zero.
pub struct GuardedCounter {
    state: AtomicUsize,
    park: Mutex<()>,
    cv: Condvar,
}

impl GuardedCounter {
    /// Create an open counter with no users.
    pub const fn new() -> Self {
        Self::with_state(0)
    }

    /// Create a counter already in the locked (barrier-active) mode.
    pub const fn new_locked() -> Self {
        Self::with_state(LOCKED)
    }

    const fn with_state(state: usize) -> Self {
        Self {
            state: AtomicUsize::new(state),
            park: Mutex::new(()),
            cv: Condvar::new(),
        }
    }

    /// Register a new user, blocking while the counter is locked.
    pub fn increment(&self) {
        let mut cur = self.state.load(Ordering::Relaxed);
        loop {
            if cur & LOCKED != 0 {
                self.wait_unlocked();
                cur = self.state.load(Ordering::Relaxed);
                continue;
            }
            match self.state.compare_exchange_weak(
                cur,
                cur + COUNT_STEP,
                Ordering::SeqCst,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(actual) => cur = actual,
            }
        }
    }

    /// Drop a user registered by [`GuardedCounter::increment`].
    ///
    /// Never blocks, regardless of the lock state.
    pub fn decrement(&self) {
        let prev = self.state.fetch_sub(COUNT_STEP, Ordering::SeqCst);
        assert!(prev >= COUNT_STEP, "guarded counter decremented below zero");
    }

    /// Close the counter to new users.
    ///
    /// If some other holder already has the counter locked, this waits for
    /// that holder to unlock it first.  A thread locking a counter it
    /// already holds never returns.
    pub fn lock(&self) {
        let mut cur = self.state.load(Ordering::Relaxed);
        loop {
            if cur & LOCKED != 0 {
                self.wait_unlocked();
                cur = self.state.load(Ordering::Relaxed);
                continue;
            }
            match self.state.compare_exchange_weak(
                cur,
                cur | LOCKED,
                Ordering::SeqCst,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(actual) => cur = actual,
            }
        }
    }

    /// Reopen the counter, releasing any parked incrementers.
    pub fn unlock(&self) {
        let prev = self.state.fetch_and(!LOCKED, Ordering::SeqCst);
        assert!(prev & LOCKED != 0, "guarded counter unlocked while open");

        // Parked threads check the lock bit while holding `park`, so taking
        // it here orders the notify after any such check.
        let _guard = self.park.lock().unwrap();
        self.cv.notify_all();
    }

    /// Current number of users.
    pub fn count(&self) -> usize {
        self.state.load(Ordering::SeqCst) / COUNT_STEP
    }

    pub fn is_locked(&self) -> bool {
        self.state.load(Ordering::SeqCst) & LOCKED != 0
    }

    fn wait_unlocked(&self) {
        let guard = self.park.lock().unwrap();
        let _guard = self
            .cv
            .wait_while(guard, |_| {
                self.state.load(Ordering::SeqCst) & LOCKED != 0
            })
            .unwrap();
    }
}

impl Default for GuardedCounter {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for GuardedCounter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GuardedCounter")
            .field("count", &self.count())
            .field("locked", &self.is_locked())
            .finish()
    }
}
