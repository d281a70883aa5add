//! # List
//!
//! List is a CLI subcommand showing the hooks of the profile, as they are
//! published once registered.

pub(crate) mod cli;
pub(crate) use cli::ListCmd;
