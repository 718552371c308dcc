// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The management-level exclusive context which barrier holders must own.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

/// Query for whether the calling thread holds the exclusive context.
///
/// Threads holding it are never counted as markers, and only they may raise
/// a quiescence barrier.
pub trait ExclusiveContext: Send + Sync {
    fn held_by_current_thread(&self) -> bool;
}

impl<F> ExclusiveContext for F
where
    F: Fn() -> bool + Send + Sync,
{
    fn held_by_current_thread(&self) -> bool {
        self()
    }
}

/// Process-wide management lock which records its owning thread.
///
/// Ownership checks are a single atomic load, cheap enough for every
/// accelerator call to make.
#[derive(Default)]
pub struct BigLock {
    inner: Mutex<()>,
    /// Token of the owning thread, or 0 when unowned
    owner: AtomicU64,
}

/// Nonzero token identifying the calling thread.
fn thread_token() -> u64 {
    static NEXT: AtomicU64 = AtomicU64::new(1);
    thread_local! {
        static TOKEN: u64 = NEXT.fetch_add(1, Ordering::Relaxed);
    }
    TOKEN.with(|t| *t)
}

impl BigLock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lock(&self) -> BigLockGuard<'_> {
        assert!(
            !self.is_held_by_current_thread(),
            "big lock is not recursive"
        );
        let guard = self.inner.lock().unwrap();
        self.guard(guard)
    }

    pub fn try_lock(&self) -> Option<BigLockGuard<'_>> {
        let guard = self.inner.try_lock().ok()?;
        Some(self.guard(guard))
    }

    pub fn is_held_by_current_thread(&self) -> bool {
        // Only the owner ever stores its own token, so a relaxed load cannot
        // yield a false positive.
        self.owner.load(Ordering::Relaxed) == thread_token()
    }

    fn guard<'a>(&'a self, inner: MutexGuard<'a, ()>) -> BigLockGuard<'a> {
        self.owner.store(thread_token(), Ordering::Relaxed);
        BigLockGuard { lock: self, _inner: inner }
    }
}

impl ExclusiveContext for BigLock {
    fn held_by_current_thread(&self) -> bool {
        self.is_held_by_current_thread()
    }
}

pub struct BigLockGuard<'a> {
    lock: &'a BigLock,
    _inner: MutexGuard<'a, ()>,
}

impl Drop for BigLockGuard<'_> {
    fn drop(&mut self) {
        // Clear ownership before `_inner` releases the lock itself
        self.lock.owner.store(0, Ordering::Relaxed);
    }
}
