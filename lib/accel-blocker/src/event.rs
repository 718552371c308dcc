// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Manual-reset wake event.

use std::sync::atomic::{fence, AtomicU8, Ordering};
use std::sync::{Condvar, Mutex};

const SET: u8 = 0;
const FREE: u8 = 1;
/// FREE, with a waiter which has committed to sleeping
const BUSY: u8 = 2;

/// Binary event used by the barrier holder to sleep until a marker exits.
///
/// The waiter follows the pattern of `reset()`, check its condition, and then
/// `wait()`.  Any `set()` issued after the `reset()` is guaranteed to be
/// observed by the `wait()`, whether it lands before or during the sleep.
/// Setters only touch the parking lock when a waiter has announced itself by
/// moving the state to BUSY.
pub struct QuiescenceEvent {
    state: AtomicU8,
    park: Mutex<()>,
    cv: Condvar,
}

impl QuiescenceEvent {
    pub const fn new(set: bool) -> Self {
        Self {
            state: AtomicU8::new(if set { SET } else { FREE }),
            park: Mutex::new(()),
            cv: Condvar::new(),
        }
    }

    /// Move the event to SET, waking any waiter.
    pub fn set(&self) {
        // Order the caller's prior writes (a counter decrement) against our
        // read of the event state, pairing with the waiter's reset-then-check.
        fence(Ordering::SeqCst);
        if self.state.load(Ordering::SeqCst) != SET
            && self.state.swap(SET, Ordering::SeqCst) == BUSY
        {
            let _guard = self.park.lock().unwrap();
            self.cv.notify_all();
        }
    }

    /// Move a SET event back to FREE.
    ///
    /// An event which is already FREE (or BUSY, with a waiter present) is
    /// left unchanged.
    pub fn reset(&self) {
        let _ = self.state.compare_exchange(
            SET,
            FREE,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
    }

    /// Block until the event is SET.
    pub fn wait(&self) {
        match self.state.load(Ordering::SeqCst) {
            SET => return,
            FREE => {
                if let Err(SET) = self.state.compare_exchange(
                    FREE,
                    BUSY,
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                ) {
                    return;
                }
            }
            _ => {}
        }

        let guard = self.park.lock().unwrap();
        let _guard = self
            .cv
            .wait_while(guard, |_| self.state.load(Ordering::SeqCst) == BUSY)
            .unwrap();
    }

    pub fn is_set(&self) -> bool {
        self.state.load(Ordering::SeqCst) == SET
    }
}

impl Default for QuiescenceEvent {
    fn default() -> Self {
        Self::new(false)
    }
}

impl std::fmt::Debug for QuiescenceEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = match self.state.load(Ordering::SeqCst) {
            SET => "set",
            FREE => "free",
            _ => "busy",
        };
        f.debug_struct("QuiescenceEvent").field("state", &state).finish()
    }
}
