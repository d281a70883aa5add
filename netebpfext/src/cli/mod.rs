//! # Cli
//!
//! Command line interface: the main options shared by all subcommands, and
//! the subcommands the tool supports.

#[allow(clippy::module_inception)]
pub(crate) mod cli;

// Re-export cli.rs
pub(crate) use cli::*;
