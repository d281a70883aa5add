/// # Signals
///
/// Termination condition shared by the threads of a run, set either by one
/// of them or when a termination signal is received.
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
};

use anyhow::Result;
use log::info;
use signal_hook::iterator::Signals;

#[derive(Clone)]
pub(crate) struct Running {
    terminated: Arc<AtomicBool>,
}

impl Running {
    /// Stop on SIGINT, SIGTERM or SIGQUIT.
    pub(crate) fn new() -> Result<Running> {
        Self::with_signals(signal_hook::consts::TERM_SIGNALS)
    }

    /// Stop on any of the given signals.
    pub(crate) fn with_signals(signals: &[i32]) -> Result<Running> {
        let mut sigs = Signals::new(signals)?;

        let run = Self::ignore_signals();
        let terminated = Arc::clone(&run.terminated);

        thread::Builder::new()
            .name("signals".to_string())
            .spawn(move || {
                if let Some(sig) = sigs.wait().next() {
                    info!("Received signal {sig}, stopping");
                    terminated.store(true, Ordering::Relaxed);
                }
            })?;

        Ok(run)
    }

    /// Termination is only triggered by `terminate()`.
    pub(crate) fn ignore_signals() -> Running {
        Self {
            terminated: Arc::new(AtomicBool::new(false)),
        }
    }

    pub(crate) fn running(&self) -> bool {
        !self.terminated.load(Ordering::Relaxed)
    }

    pub(crate) fn terminate(&self) {
        self.terminated.store(true, Ordering::Relaxed);
    }
}
