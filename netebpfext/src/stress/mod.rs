//! # Stress
//!
//! Stress is a CLI subcommand attaching and detaching programs on hooks in a
//! loop, while other threads keep invoking the hooks. It reports any program
//! invocation observed after its detach completed.

pub(crate) mod cli;
pub(crate) use cli::StressCmd;

#[allow(clippy::module_inception)]
pub(crate) mod stress;
pub(crate) use stress::*;
