// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use accel_blocker::usdt::register_probes;
use accel_blocker::{
    AccelBlocker, BigLock, Registry, Scope, Worker, WorkerGuard, WorkerId,
};
use anyhow::Context;
use clap::Parser;
use slog::{o, Drain};

mod config;

type Blocker = AccelBlocker<Registry<SimVcpu>, BigLock>;

/// A vCPU whose accelerator calls are simulated by a timed sleep.
struct SimVcpu {
    id: WorkerId,
    guard: WorkerGuard,
    kicked: Mutex<bool>,
    cv: Condvar,
    kicks: AtomicU64,
}
impl SimVcpu {
    fn new(id: u32) -> Arc<Self> {
        Arc::new(Self {
            id: WorkerId(id),
            guard: WorkerGuard::new(),
            kicked: Mutex::new(false),
            cv: Condvar::new(),
            kicks: AtomicU64::new(0),
        })
    }

    /// Run a simulated accelerator call for at most `max`.
    ///
    /// Returns `false` if the call was cut short by a kick, in the manner of
    /// a vCPU run ioctl returning EINTR.
    fn ioctl(&self, max: Duration) -> bool {
        let guard = self.kicked.lock().unwrap();
        let (mut guard, res) =
            self.cv.wait_timeout_while(guard, max, |k| !*k).unwrap();
        *guard = false;
        res.timed_out()
    }
}
impl Worker for SimVcpu {
    fn id(&self) -> WorkerId {
        self.id
    }
    fn guard(&self) -> &WorkerGuard {
        &self.guard
    }
    fn kick(&self) {
        self.kicks.fetch_add(1, Ordering::Relaxed);
        *self.kicked.lock().unwrap() = true;
        self.cv.notify_all();
    }
}

/// State shared between the vCPU threads and the control loop.
#[derive(Default)]
struct Shared {
    /// Accelerator calls actually executing right now
    in_call: AtomicUsize,
    /// Bumped by the control loop while every call is paused
    generation: AtomicU64,
    stop: AtomicBool,
}

#[derive(Default, Debug)]
struct VcpuTotals {
    calls: u64,
    interrupted: u64,
}

fn vcpu_loop(
    blocker: &Blocker,
    vcpu: &SimVcpu,
    shared: &Shared,
    main: &config::Main,
    log: slog::Logger,
) -> VcpuTotals {
    let mut totals = VcpuTotals::default();
    let mut local_gen = shared.generation.load(Ordering::Acquire);
    while !shared.stop.load(Ordering::Relaxed) {
        let scope = match main.global_every {
            Some(n) if totals.calls % u64::from(n) == 0 => Scope::Global,
            _ => Scope::Worker(vcpu.guard()),
        };

        let call = blocker.enter(scope);
        shared.in_call.fetch_add(1, Ordering::SeqCst);
        let completed = vcpu.ioctl(main.ioctl_time());
        shared.in_call.fetch_sub(1, Ordering::SeqCst);
        drop(call);

        totals.calls += 1;
        if !completed {
            totals.interrupted += 1;
        }

        let cur_gen = shared.generation.load(Ordering::Acquire);
        if cur_gen != local_gen {
            slog::trace!(log, "observed new generation"; "gen" => cur_gen);
            local_gen = cur_gen;
        }
    }
    slog::debug!(log, "vCPU exiting";
        "calls" => totals.calls,
        "interrupted" => totals.interrupted,
        "kicks" => vcpu.kicks.load(Ordering::Relaxed)
    );
    totals
}

fn control_loop(
    blocker: &Blocker,
    shared: &Shared,
    main: &config::Main,
    cycles: Option<u32>,
    log: &slog::Logger,
) -> anyhow::Result<()> {
    let mut cycle = 0u32;
    let mut worst = Duration::ZERO;
    while !shared.stop.load(Ordering::Relaxed)
        && cycles.map_or(true, |c| cycle < c)
    {
        std::thread::sleep(main.interval());

        let big = blocker.exclusive().lock();
        let start = Instant::now();
        let barrier = blocker.quiesce();
        let latency = start.elapsed();

        let in_call = shared.in_call.load(Ordering::SeqCst);
        anyhow::ensure!(
            in_call == 0,
            "{} accelerator calls running under barrier",
            in_call
        );
        let gen = shared.generation.fetch_add(1, Ordering::AcqRel) + 1;
        std::thread::sleep(main.hold_time());

        drop(barrier);
        drop(big);

        worst = worst.max(latency);
        slog::debug!(log, "barrier complete";
            "cycle" => cycle,
            "gen" => gen,
            "latency_us" => latency.as_micros() as u64
        );
        cycle += 1;
    }
    slog::info!(log, "control loop finished";
        "cycles" => cycle, "worst_latency_us" => worst.as_micros() as u64);
    Ok(())
}

fn build_log() -> (slog::Logger, slog_async::AsyncGuard) {
    let decorator = slog_term::TermDecorator::new().build();
    let drain = slog_term::CompactFormat::new(decorator).build().fuse();
    let (drain, guard) = slog_async::Async::new(drain).build_with_guard();
    (slog::Logger::root(drain.fuse(), o!()), guard)
}

#[derive(clap::Parser)]
/// Exercise the accelerator quiescence barrier against simulated vCPUs.
struct Args {
    /// The simulated machine config file.
    #[clap(value_name = "CONFIG", action)]
    config: String,

    /// Number of barriers to raise, overriding the config file.
    #[clap(short, long, action)]
    cycles: Option<u32>,
}

fn main() -> anyhow::Result<()> {
    let Args { config, cycles } = Args::parse();

    // Ensure proper setup of USDT probes
    register_probes().context("Failed to setup USDT probes")?;

    let (log, _log_async_guard) = build_log();

    let config = config::parse(&config)?;
    let main = Arc::new(config.main);
    let cycles = cycles.or(main.cycles);
    slog::info!(log, "Starting machine";
        "name" => &main.name, "cpus" => main.cpus);

    let blocker: Arc<Blocker> =
        Arc::new(AccelBlocker::new(Registry::new(), BigLock::new(), &log));
    let shared = Arc::new(Shared::default());

    let stop_shared = shared.clone();
    let signal_log = log.clone();
    ctrlc::set_handler(move || {
        slog::info!(signal_log, "Stopping...");
        stop_shared.stop.store(true, Ordering::Relaxed);
    })
    .context("Failed to register Ctrl-C signal handler.")?;

    let mut vcpu_threads = Vec::new();
    for id in 0..u32::from(main.cpus) {
        let vcpu = SimVcpu::new(id);
        blocker
            .registry()
            .register(vcpu.clone())
            .context("registering vCPU")?;

        let blocker = blocker.clone();
        let shared = shared.clone();
        let main = main.clone();
        let task_log = log.new(o!("vcpu" => id));
        let hdl = std::thread::Builder::new()
            .name(format!("vcpu-{}", id))
            .spawn(move || {
                vcpu_loop(&blocker, &vcpu, &shared, &main, task_log)
            })
            .context("spawning vCPU thread")?;
        vcpu_threads.push(hdl);
    }

    let res = control_loop(&blocker, &shared, &main, cycles, &log);

    shared.stop.store(true, Ordering::Relaxed);
    let mut totals = VcpuTotals::default();
    for hdl in vcpu_threads {
        let t = hdl
            .join()
            .map_err(|_| anyhow::anyhow!("vCPU thread panicked"))?;
        totals.calls += t.calls;
        totals.interrupted += t.interrupted;
    }

    let stats = blocker.stats();
    slog::info!(log, "Machine stopped";
        "calls" => totals.calls,
        "interrupted" => totals.interrupted,
        "barriers" => stats.barriers,
        "waits" => stats.waits,
        "kicks" => stats.kicks
    );
    res
}
