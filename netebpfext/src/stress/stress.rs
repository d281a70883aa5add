use std::{
    any::Any,
    fmt, hint,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    thread,
    time::{Duration, Instant},
};

use anyhow::Result;
use hook::{Link, ProgramDispatch, ProviderStats, Registrar};
use log::{debug, info, warn};
use serde::Serialize;
use uuid::Uuid;

use crate::{
    helpers::signals::Running,
    hooks::RegisteredHook,
    profiles::{HookProfile, StressProfile},
};

/// Counters shared by the invokers and the programs of a hook.
#[derive(Default)]
struct HookCounters {
    calls: AtomicU64,
    program_runs: AtomicU64,
    acted: AtomicU64,
    errors: AtomicU64,
    late_runs: AtomicU64,
    unbound: AtomicU64,
    max_detach_us: AtomicU64,
}

struct Target<'a> {
    profile: &'a HookProfile,
    hook: RegisteredHook,
    counters: Arc<HookCounters>,
}

/// A program attached for one cycle.
struct Attached {
    link: Link,
    detached: Arc<AtomicBool>,
}

#[derive(Debug, Serialize)]
pub(crate) struct HookSummary {
    pub(crate) name: String,
    pub(crate) attach_type: Uuid,
    pub(crate) invokers: usize,
    /// Hook invocations made by the invoker threads.
    pub(crate) calls: u64,
    /// Times an attached program ran.
    pub(crate) program_runs: u64,
    /// Invocations whose outcome was decided by a program.
    pub(crate) acted: u64,
    pub(crate) errors: u64,
    /// Program runs started after the program was detached. Always 0 unless
    /// rundown protection is broken.
    pub(crate) late_runs: u64,
    /// Cycles in which the hook refused the program.
    pub(crate) unbound: u64,
    pub(crate) max_detach_us: u64,
    pub(crate) clients: ProviderStats,
}

#[derive(Debug, Serialize)]
pub(crate) struct StressSummary {
    pub(crate) cycles: u64,
    pub(crate) requested_cycles: u64,
    pub(crate) interrupted: bool,
    pub(crate) duration_ms: u64,
    pub(crate) hooks: Vec<HookSummary>,
}

impl StressSummary {
    pub(crate) fn late_runs(&self) -> u64 {
        self.hooks.iter().map(|h| h.late_runs).sum()
    }
}

impl fmt::Display for StressSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{}/{} cycle(s) in {} ms{}",
            self.cycles,
            self.requested_cycles,
            self.duration_ms,
            if self.interrupted { " (interrupted)" } else { "" }
        )?;

        for hook in self.hooks.iter() {
            writeln!(f, "  {} ({})", hook.name, hook.attach_type)?;
            writeln!(
                f,
                "    {} invoker(s): {} call(s), {} program run(s), {} acted, {} error(s)",
                hook.invokers, hook.calls, hook.program_runs, hook.acted, hook.errors
            )?;
            writeln!(
                f,
                "    clients: {} attached, {} denied, {} detached, {} unbound cycle(s)",
                hook.clients.attached, hook.clients.denied, hook.clients.detached, hook.unbound
            )?;
            writeln!(
                f,
                "    max detach time: {} us, late program runs: {}",
                hook.max_detach_us, hook.late_runs
            )?;
        }
        Ok(())
    }
}

/// Program attached in each cycle. It flags any run starting after its
/// detach completed.
fn program(
    counters: Arc<HookCounters>,
    detached: Arc<AtomicBool>,
    result: u32,
    delay: Duration,
) -> Arc<dyn ProgramDispatch> {
    Arc::new(move |_: &mut dyn Any| -> hook::Result<u32> {
        counters.program_runs.fetch_add(1, Ordering::Relaxed);
        if detached.load(Ordering::Acquire) {
            counters.late_runs.fetch_add(1, Ordering::Relaxed);
        }

        // XDP programs run at dispatch level: spin, don't sleep.
        let start = Instant::now();
        while start.elapsed() < delay {
            hint::spin_loop();
        }
        Ok(result)
    })
}

fn invoke_loop(target: &Target, seq: &AtomicU64, running: &Running) {
    let counters = &target.counters;

    while running.running() {
        counters.calls.fetch_add(1, Ordering::Relaxed);
        match target.hook.invoke(target.profile, seq) {
            Ok(true) => {
                counters.acted.fetch_add(1, Ordering::Relaxed);
            }
            Ok(false) => (),
            Err(_) => {
                counters.errors.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

fn detach(target: &Target, attached: Attached) -> Result<()> {
    let start = Instant::now();
    attached.link.detach()?;
    attached.detached.store(true, Ordering::Release);

    let elapsed = start.elapsed().as_micros() as u64;
    target
        .counters
        .max_detach_us
        .fetch_max(elapsed, Ordering::Relaxed);
    Ok(())
}

/// Attach a program to every target, hold, then detach them all.
fn cycle(registrar: &Registrar, targets: &[Target], profile: &StressProfile) -> Result<()> {
    let mut attached = Vec::with_capacity(targets.len());

    for target in targets.iter() {
        let detached = Arc::new(AtomicBool::new(false));
        let link = Link::attach(
            registrar,
            target.hook.provider().attach_type(),
            RegisteredHook::client_data(target.profile),
            program(
                Arc::clone(&target.counters),
                Arc::clone(&detached),
                target.profile.program_result(),
                Duration::from_micros(profile.invoke_delay_us),
            ),
        );

        match link {
            Ok(link) => {
                if !link.is_bound() {
                    target.counters.unbound.fetch_add(1, Ordering::Relaxed);
                }
                attached.push(Attached { link, detached });
            }
            Err(e) => {
                // Leave no program behind, the hooks are unregistered next.
                targets
                    .iter()
                    .zip(attached)
                    .try_for_each(|(target, attached)| detach(target, attached))?;
                return Err(e.into());
            }
        }
    }

    thread::sleep(Duration::from_micros(profile.hold_us));

    targets
        .iter()
        .zip(attached)
        .try_for_each(|(target, attached)| detach(target, attached))
}

/// Run a stress profile until all its cycles are done or `running` is
/// terminated. `running` is terminated on return.
pub(crate) fn run_stress(profile: &StressProfile, running: &Running) -> Result<StressSummary> {
    let registrar = Registrar::new();

    let mut targets = Vec::new();
    for hook in profile.hooks.iter() {
        let registered = RegisteredHook::register(&registrar, hook.kind)?;
        debug!(
            "Registered {} hook, {} invoker(s)",
            registered.provider().name(),
            hook.invokers
        );
        targets.push(Target {
            profile: hook,
            hook: registered,
            counters: Arc::new(HookCounters::default()),
        });
    }

    let seq = AtomicU64::new(0);
    let start = Instant::now();
    let mut cycles = 0;

    thread::scope(|s| -> Result<()> {
        let res = (|| -> Result<()> {
            for target in targets.iter() {
                for i in 0..target.profile.invokers {
                    let seq = &seq;
                    thread::Builder::new()
                        .name(format!("{}-invoker-{i}", target.hook.provider().name()))
                        .spawn_scoped(s, move || invoke_loop(target, seq, running))?;
                }
            }

            while cycles < profile.cycles && running.running() {
                cycle(&registrar, &targets, profile)?;
                cycles += 1;
            }
            Ok(())
        })();

        // Stop the invokers, they are joined when the scope ends.
        running.terminate();
        res
    })?;

    let duration = start.elapsed();
    info!("{cycles} cycle(s) done in {} ms", duration.as_millis());

    let mut hooks = Vec::with_capacity(targets.len());
    for target in targets.into_iter() {
        let provider = target.hook.provider();
        let counters = &target.counters;
        let summary = HookSummary {
            name: provider.name().to_string(),
            attach_type: provider.attach_type(),
            invokers: target.profile.invokers,
            calls: counters.calls.load(Ordering::Relaxed),
            program_runs: counters.program_runs.load(Ordering::Relaxed),
            acted: counters.acted.load(Ordering::Relaxed),
            errors: counters.errors.load(Ordering::Relaxed),
            late_runs: counters.late_runs.load(Ordering::Relaxed),
            unbound: counters.unbound.load(Ordering::Relaxed),
            max_detach_us: counters.max_detach_us.load(Ordering::Relaxed),
            clients: provider.stats(),
        };
        if summary.late_runs > 0 {
            warn!(
                "{}: {} program run(s) after detach",
                summary.name, summary.late_runs
            );
        }

        target.hook.unregister()?;
        hooks.push(summary);
    }

    Ok(StressSummary {
        cycles,
        requested_cycles: profile.cycles,
        interrupted: cycles < profile.cycles,
        duration_ms: duration.as_millis() as u64,
        hooks,
    })
}
