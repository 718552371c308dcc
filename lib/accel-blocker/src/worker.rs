// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Worker (vCPU) threads as seen by the quiescence barrier.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use thiserror::Error;

use crate::lockcnt::GuardedCounter;

/// Identifier for a worker thread, typically the vCPU id.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WorkerId(pub u32);

impl std::fmt::Display for WorkerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "worker-{}", self.0)
    }
}

/// Per-worker count of in-flight accelerator calls.
#[derive(Debug, Default)]
pub struct WorkerGuard(GuardedCounter);

impl WorkerGuard {
    pub const fn new() -> Self {
        Self(GuardedCounter::new())
    }

    /// Create a guard for a worker joining while a barrier is held.
    ///
    /// The barrier holder will unlock it in `end_quiescence` along with all
    /// the other worker guards.  Registering such a worker while no barrier
    /// is held is a misuse, and panics the next `begin_quiescence`.
    pub const fn new_locked() -> Self {
        Self(GuardedCounter::new_locked())
    }

    /// Number of accelerator calls the worker currently has in flight.
    pub fn in_flight(&self) -> usize {
        self.0.count()
    }

    pub fn is_locked(&self) -> bool {
        self.0.is_locked()
    }

    pub(crate) fn counter(&self) -> &GuardedCounter {
        &self.0
    }
}

/// A worker thread which issues accelerator calls.
pub trait Worker: Send + Sync {
    fn id(&self) -> WorkerId;

    /// The guard marked around this worker's accelerator calls.
    fn guard(&self) -> &WorkerGuard;

    /// Nudge the worker out of a blocking accelerator call.
    ///
    /// This must not block, and must be harmless if the worker is not
    /// currently in such a call.
    fn kick(&self);
}

/// The set of currently live workers.
pub trait WorkerRegistry: Send + Sync {
    type Worker: Worker + ?Sized;

    /// Call `f` once for each registered worker.
    ///
    /// Membership must not change for the duration of the call.
    fn for_each_worker(&self, f: &mut dyn FnMut(&Self::Worker));
}

impl<R: WorkerRegistry + ?Sized> WorkerRegistry for Arc<R> {
    type Worker = R::Worker;

    fn for_each_worker(&self, f: &mut dyn FnMut(&Self::Worker)) {
        (**self).for_each_worker(f)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("{0} is already registered")]
    Duplicate(WorkerId),

    #[error("{0} is not registered")]
    NotFound(WorkerId),
}

/// Registry of workers ordered by id.
pub struct Registry<W: ?Sized> {
    workers: Mutex<BTreeMap<WorkerId, Arc<W>>>,
}

impl<W: Worker + ?Sized> Registry<W> {
    pub fn new() -> Self {
        Self { workers: Mutex::new(BTreeMap::new()) }
    }

    pub fn register(&self, worker: Arc<W>) -> Result<(), RegistryError> {
        let mut workers = self.workers.lock().unwrap();
        let id = worker.id();
        if workers.contains_key(&id) {
            return Err(RegistryError::Duplicate(id));
        }
        workers.insert(id, worker);
        Ok(())
    }

    pub fn unregister(&self, id: WorkerId) -> Result<Arc<W>, RegistryError> {
        self.workers
            .lock()
            .unwrap()
            .remove(&id)
            .ok_or(RegistryError::NotFound(id))
    }

    pub fn get(&self, id: WorkerId) -> Option<Arc<W>> {
        self.workers.lock().unwrap().get(&id).cloned()
    }

    pub fn len(&self) -> usize {
        self.workers.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<W: Worker + ?Sized> Default for Registry<W> {
    fn default() -> Self {
        Self::new()
    }
}

impl<W: Worker + ?Sized> WorkerRegistry for Registry<W> {
    type Worker = W;

    fn for_each_worker(&self, f: &mut dyn FnMut(&W)) {
        let workers = self.workers.lock().unwrap();
        for worker in workers.values() {
            f(worker);
        }
    }
}
