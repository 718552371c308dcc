// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Barrier which pauses all in-flight accelerator calls.
//!
//! Worker threads bracket each accelerator ioctl with
//! [`AccelBlocker::mark_enter`] and [`AccelBlocker::mark_exit`], which in the
//! common case are a single atomic increment or decrement on the guard for
//! the chosen [`Scope`].  A thread holding the exclusive context can raise a
//! barrier with [`AccelBlocker::begin_quiescence`]: every guard is closed to
//! new entries, and the holder waits for the calls already in flight to
//! drain, kicking the workers so that blocking calls return promptly.  Once
//! it returns, no accelerator call is running until
//! [`AccelBlocker::end_quiescence`] reopens the guards.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use slog::{debug, o, trace};

use crate::event::QuiescenceEvent;
use crate::exclusive::ExclusiveContext;
use crate::lockcnt::GuardedCounter;
use crate::worker::{Worker, WorkerGuard, WorkerRegistry};

#[usdt::provider(provider = "accel_blocker")]
mod probes {
    fn quiesce_begin() {}
    fn quiesce_wait(total: u64) {}
    fn quiesce_kick(worker: u64) {}
    fn quiesce_done(waits: u64) {}
    fn quiesce_end() {}
}

/// Which guard an accelerator call is accounted against.
#[derive(Copy, Clone, Debug)]
pub enum Scope<'a> {
    /// Calls not tied to a particular worker (VM-wide ioctls).
    Global,
    /// Calls made from within a worker, on its own behalf.
    ///
    /// The guard must belong to a worker in the blocker's registry: calls
    /// marked against any other guard are invisible to barriers.
    Worker(&'a WorkerGuard),
}

/// Counters describing barrier activity since creation.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct BarrierStats {
    /// Barriers successfully established.
    pub barriers: u64,
    /// Times the barrier holder slept waiting for markers to exit.
    pub waits: u64,
    /// Kicks delivered to workers.
    pub kicks: u64,
}

#[derive(Default)]
struct Stats {
    barriers: AtomicU64,
    waits: AtomicU64,
    kicks: AtomicU64,
}

/// Quiescence barrier for the accelerator calls of a single VM.
pub struct AccelBlocker<R, X> {
    global: GuardedCounter,
    event: QuiescenceEvent,
    registry: R,
    exclusive: X,
    active: AtomicBool,
    stats: Stats,
    log: slog::Logger,
}

impl<R: WorkerRegistry, X: ExclusiveContext> AccelBlocker<R, X> {
    pub fn new(registry: R, exclusive: X, log: &slog::Logger) -> Self {
        Self {
            global: GuardedCounter::new(),
            event: QuiescenceEvent::new(false),
            registry,
            exclusive,
            active: AtomicBool::new(false),
            stats: Stats::default(),
            log: log.new(o!("component" => "accel-blocker")),
        }
    }

    pub fn registry(&self) -> &R {
        &self.registry
    }

    pub fn exclusive(&self) -> &X {
        &self.exclusive
    }

    fn counter<'a>(&'a self, scope: Scope<'a>) -> &'a GuardedCounter {
        match scope {
            Scope::Global => &self.global,
            Scope::Worker(guard) => guard.counter(),
        }
    }

    /// Mark the start of an accelerator call.
    ///
    /// Blocks if a barrier is currently held.  Threads holding the exclusive
    /// context are not accounted, since they are the ones raising barriers.
    pub fn mark_enter(&self, scope: Scope<'_>) {
        if self.exclusive.held_by_current_thread() {
            return;
        }
        self.counter(scope).increment();
    }

    /// Mark the end of an accelerator call begun with
    /// [`AccelBlocker::mark_enter`].
    pub fn mark_exit(&self, scope: Scope<'_>) {
        if self.exclusive.held_by_current_thread() {
            return;
        }
        self.exit_counted(scope);
    }

    fn exit_counted(&self, scope: Scope<'_>) {
        self.counter(scope).decrement();
        // Let a waiting barrier holder recheck the totals
        self.event.set();
    }

    /// Mark an accelerator call for the lifetime of the returned guard.
    ///
    /// Whether the call was accounted is decided once, on entry, so taking or
    /// dropping the exclusive context while the guard is live cannot
    /// unbalance the count.
    pub fn enter<'a>(&'a self, scope: Scope<'a>) -> IoctlGuard<'a, R, X> {
        let counted = !self.exclusive.held_by_current_thread();
        if counted {
            self.counter(scope).increment();
        }
        IoctlGuard { blocker: self, scope, counted }
    }

    /// Total accelerator calls in flight, across the global guard and every
    /// registered worker.
    pub fn in_flight(&self) -> usize {
        let mut total = self.global.count();
        self.registry.for_each_worker(&mut |w| total += w.guard().in_flight());
        total
    }

    /// Kick every registered worker out of any blocking accelerator call.
    pub fn kick_all(&self) {
        let mut kicks = 0;
        self.registry.for_each_worker(&mut |w| {
            probes::quiesce_kick!(|| w.id().0 as u64);
            w.kick();
            kicks += 1;
        });
        self.stats.kicks.fetch_add(kicks, Ordering::Relaxed);
    }

    /// Wait for all in-flight accelerator calls to complete, and prevent any
    /// more from starting until [`AccelBlocker::end_quiescence`].
    ///
    /// # Panics
    ///
    /// If the calling thread does not hold the exclusive context, or a
    /// barrier is already held.
    pub fn begin_quiescence(&self) {
        assert!(
            self.exclusive.held_by_current_thread(),
            "barrier entered without exclusive context"
        );
        assert!(
            !self.active.swap(true, Ordering::AcqRel),
            "barrier entered while already held"
        );
        probes::quiesce_begin!(|| ());

        // Workers first, then the global guard.  `end_quiescence` releases
        // the global guard first.
        self.registry.for_each_worker(&mut |w| {
            // Only a worker registered with a locked guard outside of a
            // barrier gets here; locking it again would never return.
            assert!(
                !w.guard().is_locked(),
                "{} guard locked outside of a barrier",
                w.id()
            );
            w.guard().counter().lock();
        });
        self.global.lock();

        let mut waits = 0u64;
        loop {
            if self.in_flight() == 0 {
                break;
            }
            self.event.reset();

            // Any marker exiting after the reset will set the event, so a
            // nonzero total observed here cannot lead to a missed wakeup.
            let total = self.in_flight();
            if total == 0 {
                break;
            }
            trace!(self.log, "waiting on in-flight accelerator calls";
                "total" => total);
            probes::quiesce_wait!(|| total as u64);
            self.kick_all();
            self.event.wait();
            waits += 1;
        }

        self.stats.barriers.fetch_add(1, Ordering::Relaxed);
        self.stats.waits.fetch_add(waits, Ordering::Relaxed);
        probes::quiesce_done!(|| waits);
        debug!(self.log, "accelerator calls quiesced"; "waits" => waits);
    }

    /// Release a barrier established by [`AccelBlocker::begin_quiescence`].
    ///
    /// # Panics
    ///
    /// If the calling thread does not hold the exclusive context, or no
    /// barrier is held.
    pub fn end_quiescence(&self) {
        assert!(
            self.exclusive.held_by_current_thread(),
            "barrier released without exclusive context"
        );
        assert!(
            self.active.swap(false, Ordering::AcqRel),
            "barrier released while not held"
        );

        self.global.unlock();
        self.registry.for_each_worker(&mut |w| w.guard().counter().unlock());

        probes::quiesce_end!(|| ());
        debug!(self.log, "accelerator calls resumed");
    }

    /// Establish a barrier for the lifetime of the returned guard.
    pub fn quiesce(&self) -> QuiescedGuard<'_, R, X> {
        self.begin_quiescence();
        QuiescedGuard { blocker: self }
    }

    /// Whether a barrier is currently held.
    pub fn is_quiescing(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> BarrierStats {
        BarrierStats {
            barriers: self.stats.barriers.load(Ordering::Relaxed),
            waits: self.stats.waits.load(Ordering::Relaxed),
            kicks: self.stats.kicks.load(Ordering::Relaxed),
        }
    }

    #[cfg(test)]
    fn global_guard(&self) -> &GuardedCounter {
        &self.global
    }
}

/// An accelerator call in flight; marks its exit when dropped.
pub struct IoctlGuard<'a, R: WorkerRegistry, X: ExclusiveContext> {
    blocker: &'a AccelBlocker<R, X>,
    scope: Scope<'a>,
    counted: bool,
}

impl<R: WorkerRegistry, X: ExclusiveContext> Drop for IoctlGuard<'_, R, X> {
    fn drop(&mut self) {
        if self.counted {
            self.blocker.exit_counted(self.scope);
        }
    }
}

/// A held barrier; released when dropped.
pub struct QuiescedGuard<'a, R: WorkerRegistry, X: ExclusiveContext> {
    blocker: &'a AccelBlocker<R, X>,
}

impl<R: WorkerRegistry, X: ExclusiveContext> Drop for QuiescedGuard<'_, R, X> {
    fn drop(&mut self) {
        self.blocker.end_quiescence();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::AtomicUsize;
    use std::sync::{Arc, Mutex, OnceLock, Weak};

    use slog::KV;

    use crate::exclusive::BigLock;
    use crate::worker::{Registry, WorkerId};

    type TestBlocker = AccelBlocker<Registry<ExitOnKick>, BigLock>;

    /// Worker whose accelerator call completes as soon as it is kicked.
    struct ExitOnKick {
        id: WorkerId,
        guard: WorkerGuard,
        kicks: AtomicUsize,
        blocker: OnceLock<Weak<TestBlocker>>,
    }
    impl Worker for ExitOnKick {
        fn id(&self) -> WorkerId {
            self.id
        }
        fn guard(&self) -> &WorkerGuard {
            &self.guard
        }
        fn kick(&self) {
            self.kicks.fetch_add(1, Ordering::Relaxed);
            if self.guard.in_flight() > 0 {
                // The kick arrives on the barrier thread, where markers are
                // bypassed, so complete the exit by hand.
                self.guard.counter().decrement();
                if let Some(blocker) = self.blocker.get().and_then(Weak::upgrade)
                {
                    blocker.event.set();
                }
            }
        }
    }

    fn exit_on_kick(id: u32, guard: WorkerGuard) -> Arc<ExitOnKick> {
        Arc::new(ExitOnKick {
            id: WorkerId(id),
            guard,
            kicks: AtomicUsize::new(0),
            blocker: OnceLock::new(),
        })
    }

    fn logger() -> slog::Logger {
        slog::Logger::root(slog::Discard, o!())
    }

    #[test]
    fn no_workers() {
        let blocker =
            AccelBlocker::new(Registry::<ExitOnKick>::new(), || true, &logger());
        blocker.begin_quiescence();
        assert!(blocker.is_quiescing());
        assert!(blocker.global_guard().is_locked());
        blocker.end_quiescence();

        assert!(!blocker.is_quiescing());
        assert!(!blocker.global_guard().is_locked());
        assert_eq!(
            blocker.stats(),
            BarrierStats { barriers: 1, waits: 0, kicks: 0 }
        );
    }

    #[test]
    fn bypass_under_exclusive_context() {
        let blocker =
            AccelBlocker::new(Registry::<ExitOnKick>::new(), || true, &logger());
        blocker.mark_enter(Scope::Global);
        assert_eq!(blocker.global_guard().count(), 0);
        blocker.mark_exit(Scope::Global);
        assert_eq!(blocker.global_guard().count(), 0);
    }

    #[test]
    fn marker_guard() {
        let blocker = AccelBlocker::new(
            Registry::<ExitOnKick>::new(),
            || false,
            &logger(),
        );
        let worker = exit_on_kick(0, WorkerGuard::new());
        blocker.registry().register(worker.clone()).unwrap();
        {
            let _g = blocker.enter(Scope::Worker(worker.guard()));
            let _h = blocker.enter(Scope::Global);
            assert_eq!(worker.guard().in_flight(), 1);
            assert_eq!(blocker.in_flight(), 2);
        }
        assert_eq!(worker.guard().in_flight(), 0);
        assert_eq!(blocker.in_flight(), 0);
    }

    #[test]
    fn kick_drains_in_flight() {
        // Each kick completes the worker's call synchronously, so the barrier
        // sequence runs entirely on this thread.
        let blocker: Arc<TestBlocker> = Arc::new(AccelBlocker::new(
            Registry::new(),
            BigLock::new(),
            &logger(),
        ));
        let workers: Vec<_> = (0..3)
            .map(|id| {
                let w = exit_on_kick(id, WorkerGuard::new());
                let _ = w.blocker.set(Arc::downgrade(&blocker));
                blocker.registry().register(w.clone()).unwrap();
                w
            })
            .collect();

        blocker.mark_enter(Scope::Worker(&workers[1].guard));
        assert_eq!(blocker.in_flight(), 1);

        let _big = blocker.exclusive().lock();
        {
            let _barrier = blocker.quiesce();
            assert_eq!(blocker.in_flight(), 0);
            assert!(blocker.global_guard().is_locked());
            for w in workers.iter() {
                assert!(w.guard().is_locked());
                assert_eq!(w.kicks.load(Ordering::Relaxed), 1);
            }
        }
        for w in workers.iter() {
            assert!(!w.guard().is_locked());
        }
        assert!(!blocker.global_guard().is_locked());
        assert_eq!(
            blocker.stats(),
            BarrierStats { barriers: 1, waits: 1, kicks: 3 }
        );
    }

    #[test]
    fn idle_round_trip() {
        let blocker =
            AccelBlocker::new(Registry::<ExitOnKick>::new(), || true, &logger());
        for _ in 0..3 {
            let _barrier = blocker.quiesce();
        }
        assert!(!blocker.global_guard().is_locked());
        assert_eq!(blocker.global_guard().count(), 0);
        assert_eq!(blocker.stats().barriers, 3);
    }

    #[test]
    #[should_panic(expected = "without exclusive context")]
    fn begin_requires_context() {
        let blocker = AccelBlocker::new(
            Registry::<ExitOnKick>::new(),
            || false,
            &logger(),
        );
        blocker.begin_quiescence();
    }

    #[test]
    #[should_panic(expected = "already held")]
    fn nested_begin() {
        let blocker =
            AccelBlocker::new(Registry::<ExitOnKick>::new(), || true, &logger());
        blocker.begin_quiescence();
        blocker.begin_quiescence();
    }

    #[test]
    #[should_panic(expected = "while not held")]
    fn unpaired_end() {
        let blocker =
            AccelBlocker::new(Registry::<ExitOnKick>::new(), || true, &logger());
        blocker.end_quiescence();
    }

    #[test]
    #[should_panic(expected = "guard locked outside of a barrier")]
    fn stray_locked_worker() {
        let blocker =
            AccelBlocker::new(Registry::<ExitOnKick>::new(), || true, &logger());
        blocker
            .registry()
            .register(exit_on_kick(0, WorkerGuard::new_locked()))
            .unwrap();
        blocker.begin_quiescence();
    }

    #[derive(Copy, Clone, Debug, PartialEq, Eq)]
    enum Step {
        /// A worker guard went from open to locked
        Lock,
        /// A worker guard went from locked to open
        Unlock,
        /// A worker was visited without changing its guard
        Read,
        Kick,
    }

    type RecBlocker = AccelBlocker<RecordingRegistry, BigLock>;

    /// Log of registry activity, each step tagged with whether the global
    /// guard was locked at the time.
    #[derive(Default)]
    struct Recorder {
        steps: Mutex<Vec<(Step, bool)>>,
        blocker: OnceLock<Weak<RecBlocker>>,
    }
    impl Recorder {
        fn push(&self, step: Step) {
            let global_locked = self
                .blocker
                .get()
                .and_then(Weak::upgrade)
                .map_or(false, |b| b.global_guard().is_locked());
            self.steps.lock().unwrap().push((step, global_locked));
        }
    }

    struct RecWorker {
        id: WorkerId,
        guard: WorkerGuard,
        recorder: Arc<Recorder>,
    }
    impl Worker for RecWorker {
        fn id(&self) -> WorkerId {
            self.id
        }
        fn guard(&self) -> &WorkerGuard {
            &self.guard
        }
        fn kick(&self) {
            self.recorder.push(Step::Kick);
            if self.guard.in_flight() > 0 {
                self.guard.counter().decrement();
                if let Some(blocker) =
                    self.recorder.blocker.get().and_then(Weak::upgrade)
                {
                    blocker.event.set();
                }
            }
        }
    }

    struct RecordingRegistry {
        workers: Vec<Arc<RecWorker>>,
        recorder: Arc<Recorder>,
    }
    impl WorkerRegistry for RecordingRegistry {
        type Worker = RecWorker;

        fn for_each_worker(&self, f: &mut dyn FnMut(&RecWorker)) {
            for w in self.workers.iter() {
                let before = w.guard.is_locked();
                f(w);
                let step = match (before, w.guard.is_locked()) {
                    (false, true) => Step::Lock,
                    (true, false) => Step::Unlock,
                    _ => Step::Read,
                };
                self.recorder.push(step);
            }
        }
    }

    #[test]
    fn guard_ordering() {
        let recorder = Arc::new(Recorder::default());
        let workers: Vec<_> = (0..2)
            .map(|id| {
                Arc::new(RecWorker {
                    id: WorkerId(id),
                    guard: WorkerGuard::new(),
                    recorder: recorder.clone(),
                })
            })
            .collect();
        let blocker: Arc<RecBlocker> = Arc::new(AccelBlocker::new(
            RecordingRegistry {
                workers: workers.clone(),
                recorder: recorder.clone(),
            },
            BigLock::new(),
            &logger(),
        ));
        let _ = recorder.blocker.set(Arc::downgrade(&blocker));

        blocker.mark_enter(Scope::Worker(workers[0].guard()));

        let _big = blocker.exclusive().lock();
        blocker.begin_quiescence();
        blocker.end_quiescence();

        use Step::*;
        let steps = recorder.steps.lock().unwrap().clone();
        assert_eq!(
            steps,
            vec![
                // Workers are locked while the global guard is still open
                (Lock, false),
                (Lock, false),
                // Sum, then recheck after the reset
                (Read, true),
                (Read, true),
                (Read, true),
                (Read, true),
                // Every worker is kicked under the global guard
                (Kick, true),
                (Read, true),
                (Kick, true),
                (Read, true),
                // Woken by the exit, the sum is now zero
                (Read, true),
                (Read, true),
                // Global guard is released before the workers
                (Unlock, false),
                (Unlock, false),
            ]
        );
        assert_eq!(
            blocker.stats(),
            BarrierStats { barriers: 1, waits: 1, kicks: 2 }
        );
    }

    /// Collects the keys of every record logged through it.
    #[derive(Clone, Default)]
    struct KeyCapture(Arc<Mutex<Vec<Vec<String>>>>);

    struct KeyNames<'a>(&'a mut Vec<String>);
    impl slog::Serializer for KeyNames<'_> {
        fn emit_arguments(
            &mut self,
            key: slog::Key,
            _val: &std::fmt::Arguments,
        ) -> slog::Result {
            self.0.push(key.to_string());
            Ok(())
        }
    }

    impl slog::Drain for KeyCapture {
        type Ok = ();
        type Err = slog::Never;

        fn log(
            &self,
            record: &slog::Record,
            values: &slog::OwnedKVList,
        ) -> Result<(), slog::Never> {
            let mut keys = Vec::new();
            record.kv().serialize(record, &mut KeyNames(&mut keys)).unwrap();
            values.serialize(record, &mut KeyNames(&mut keys)).unwrap();
            self.0.lock().unwrap().push(keys);
            Ok(())
        }
    }

    #[test]
    fn log_context() {
        let capture = KeyCapture::default();
        let root = slog::Logger::root(capture.clone(), o!("vm" => "testvm"));
        let blocker =
            AccelBlocker::new(Registry::<ExitOnKick>::new(), || true, &root);
        drop(blocker.quiesce());

        let records = capture.0.lock().unwrap();
        assert!(!records.is_empty());
        for keys in records.iter() {
            let component =
                keys.iter().filter(|k| k.as_str() == "component").count();
            assert_eq!(component, 1, "keys: {:?}", keys);
            assert!(keys.iter().any(|k| k == "vm"));
        }
    }
}
