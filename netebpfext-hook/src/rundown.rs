//! # Rundown protection
//!
//! Rundown protection lets any number of callers enter and leave a protected
//! region without ever blocking, while a single owner can deactivate the
//! protection and wait for every caller already inside to leave. Once
//! deactivated, entering is refused forever.
//!
//! The whole state fits in one atomic word: the top bit marks the protection
//! as inactive and the remaining bits count the callers inside. Entering is a
//! compare-and-increment refusing to proceed once the top bit is set, so the
//! deactivation and the decision to wait are atomic with respect to entrants.
use std::{
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        OnceLock,
    },
    thread::{self, Thread},
};

use crate::level::{self, ExecutionLevel};

const INACTIVE: u64 = 1 << 63;
const COUNT_MASK: u64 = INACTIVE - 1;

pub struct Rundown {
    state: AtomicU64,
    /// Thread waiting for the entrants to drain. Set once, right before the
    /// protection is deactivated.
    waiter: OnceLock<Thread>,
}

impl Rundown {
    pub const fn new() -> Self {
        Self {
            state: AtomicU64::new(0),
            waiter: OnceLock::new(),
        }
    }

    /// Try entering the protected region. Never blocks, whatever the level.
    /// Returns false once the protection was deactivated; the caller must
    /// then consider the protected object gone.
    pub fn enter(&self, _level: ExecutionLevel) -> bool {
        self.state
            .fetch_update(Ordering::Acquire, Ordering::Relaxed, |state| {
                if state & INACTIVE != 0 {
                    return None;
                }
                if state & COUNT_MASK == COUNT_MASK {
                    panic!("Rundown entrant count overflow");
                }
                Some(state + 1)
            })
            .is_ok()
    }

    /// Leave the protected region. Never blocks. The last caller leaving an
    /// inactive protection wakes up the waiter.
    pub fn leave(&self, _level: ExecutionLevel) {
        let previous = self.state.fetch_sub(1, Ordering::AcqRel);
        if previous & COUNT_MASK == 0 {
            panic!("Rundown released more times than acquired");
        }

        if previous == INACTIVE | 1 {
            if let Some(waiter) = self.waiter.get() {
                waiter.unpark();
            }
        }
    }

    /// Enter the protected region and return a guard leaving it on drop.
    pub fn try_acquire(&self, level: ExecutionLevel) -> Option<RundownRef<'_>> {
        match self.enter(level) {
            true => Some(RundownRef {
                rundown: self,
                level,
            }),
            false => None,
        }
    }

    /// Refuse all future entrants and block until the ones already inside
    /// have left. Only callable where blocking is allowed, and only once.
    pub fn deactivate_and_wait(&self) {
        level::assert_blockable("Rundown::deactivate_and_wait");

        if self.waiter.set(thread::current()).is_err() {
            panic!("Rundown protection deactivated twice");
        }

        self.state.fetch_or(INACTIVE, Ordering::AcqRel);

        // Unparking before we park is fine, the token is kept. Spurious
        // wake ups are handled by re-checking the state.
        while self.state.load(Ordering::Acquire) != INACTIVE {
            thread::park();
        }
    }

    /// Is the protection still accepting entrants?
    pub fn is_active(&self) -> bool {
        self.state.load(Ordering::Acquire) & INACTIVE == 0
    }

    /// Number of callers currently inside the protected region.
    pub fn entrants(&self) -> u64 {
        self.state.load(Ordering::Acquire) & COUNT_MASK
    }

    /// Was the protection deactivated and fully drained?
    pub fn is_drained(&self) -> bool {
        self.state.load(Ordering::Acquire) == INACTIVE
    }
}

impl Default for Rundown {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Rundown {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Rundown")
            .field("active", &self.is_active())
            .field("entrants", &self.entrants())
            .finish()
    }
}

/// Proof of being inside a rundown protected region. Leaves it on drop.
pub struct RundownRef<'a> {
    rundown: &'a Rundown,
    level: ExecutionLevel,
}

impl RundownRef<'_> {
    pub fn level(&self) -> ExecutionLevel {
        self.level
    }
}

impl Drop for RundownRef<'_> {
    fn drop(&mut self) {
        self.rundown.leave(self.level);
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{
            atomic::{AtomicBool, AtomicUsize},
            Arc, Barrier,
        },
        time::Duration,
    };

    use super::*;

    const LEVEL: ExecutionLevel = ExecutionLevel::Dispatch;

    #[test]
    fn enter_leave() {
        let rundown = Rundown::new();

        assert!(rundown.enter(LEVEL));
        assert!(rundown.enter(LEVEL));
        assert_eq!(rundown.entrants(), 2);
        rundown.leave(LEVEL);
        rundown.leave(LEVEL);
        assert_eq!(rundown.entrants(), 0);
        assert!(rundown.is_active());
    }

    #[test]
    fn deactivate_without_entrants() {
        let rundown = Rundown::new();

        rundown.deactivate_and_wait();
        assert!(!rundown.is_active());
        assert!(rundown.is_drained());
        assert!(!rundown.enter(LEVEL));
        assert!(rundown.try_acquire(LEVEL).is_none());
        assert_eq!(rundown.entrants(), 0);
    }

    #[test]
    fn guard_leaves_on_drop() {
        let rundown = Rundown::new();

        {
            let guard = rundown.try_acquire(LEVEL).unwrap();
            assert_eq!(guard.level(), LEVEL);
            assert_eq!(rundown.entrants(), 1);
        }
        assert_eq!(rundown.entrants(), 0);
    }

    #[test]
    #[should_panic(expected = "deactivated twice")]
    fn double_deactivation() {
        let rundown = Rundown::new();

        rundown.deactivate_and_wait();
        rundown.deactivate_and_wait();
    }

    #[test]
    #[should_panic(expected = "more times than acquired")]
    fn unbalanced_leave() {
        let rundown = Rundown::new();
        rundown.leave(LEVEL);
    }

    #[test]
    fn wait_for_entrants() {
        const ENTRANTS: usize = 3;
        let rundown = Arc::new(Rundown::new());
        let entered = Arc::new(Barrier::new(ENTRANTS + 1));
        let release = Arc::new(AtomicBool::new(false));
        let left = Arc::new(AtomicUsize::new(0));

        let entrants: Vec<_> = (0..ENTRANTS)
            .map(|_| {
                let (rundown, entered, release, left) =
                    (rundown.clone(), entered.clone(), release.clone(), left.clone());
                thread::spawn(move || {
                    let _level = level::raise_to_dispatch();
                    assert!(rundown.enter(LEVEL));
                    entered.wait();
                    while !release.load(Ordering::Acquire) {
                        thread::yield_now();
                    }
                    left.fetch_add(1, Ordering::AcqRel);
                    rundown.leave(LEVEL);
                })
            })
            .collect();

        entered.wait();
        let waiter = {
            let rundown = rundown.clone();
            thread::spawn(move || rundown.deactivate_and_wait())
        };

        // The deactivation must be visible, yet the waiter still blocked.
        while rundown.is_active() {
            thread::yield_now();
        }
        assert!(!rundown.enter(LEVEL));
        thread::sleep(Duration::from_millis(50));
        assert!(!waiter.is_finished());
        assert_eq!(rundown.entrants(), ENTRANTS as u64);

        release.store(true, Ordering::Release);
        waiter.join().unwrap();
        assert_eq!(left.load(Ordering::Acquire), ENTRANTS);
        assert!(rundown.is_drained());

        entrants.into_iter().for_each(|t| t.join().unwrap());
    }

    #[test]
    fn racing_entrants() {
        const THREADS: usize = 8;
        let rundown = Arc::new(Rundown::new());
        let start = Arc::new(Barrier::new(THREADS + 1));
        let inside = Arc::new(AtomicUsize::new(0));

        let threads: Vec<_> = (0..THREADS)
            .map(|_| {
                let (rundown, start, inside) = (rundown.clone(), start.clone(), inside.clone());
                thread::spawn(move || {
                    start.wait();
                    let mut entered = 0;
                    while let Some(_guard) = rundown.try_acquire(LEVEL) {
                        inside.fetch_add(1, Ordering::AcqRel);
                        entered += 1;
                        inside.fetch_sub(1, Ordering::AcqRel);
                    }
                    entered
                })
            })
            .collect();

        start.wait();
        thread::sleep(Duration::from_millis(10));
        rundown.deactivate_and_wait();

        // Nobody can be inside once the wait returned.
        assert_eq!(inside.load(Ordering::Acquire), 0);
        assert_eq!(rundown.entrants(), 0);
        assert!(!rundown.enter(LEVEL));

        threads.into_iter().for_each(|t| {
            t.join().unwrap();
        });
    }
}
