use std::path::PathBuf;

use anyhow::{bail, Result};
use clap::{builder::PossibleValuesParser, Args, Parser, Subcommand};
use log::{debug, LevelFilter};

use crate::{list::ListCmd, profiles::StressProfile, stress::StressCmd};

/// Subcommands implement this to be run once the command line is parsed.
pub(crate) trait SubCommandParserRunner {
    fn run(&mut self, main_config: &MainConfig) -> Result<()>;
}

/// Options shared by all subcommands.
#[derive(Args, Debug, Default)]
pub(crate) struct MainConfig {
    #[arg(
        long,
        value_parser=PossibleValuesParser::new(["error", "warn", "info", "debug", "trace"]),
        default_value = "info",
        help = "Log level",
    )]
    pub(crate) log_level: String,
    #[arg(
        long,
        short,
        help = "Stress profile to use (YAML). A built-in profile is used if not set"
    )]
    pub(crate) config: Option<PathBuf>,
}

impl MainConfig {
    pub(crate) fn log_level_filter(&self) -> Result<LevelFilter> {
        Ok(match self.log_level.as_str() {
            "error" => LevelFilter::Error,
            "warn" => LevelFilter::Warn,
            "info" => LevelFilter::Info,
            "debug" => LevelFilter::Debug,
            "trace" => LevelFilter::Trace,
            x => bail!("Invalid log_level: {}", x),
        })
    }

    /// Load the stress profile given with --config, or the built-in one.
    pub(crate) fn profile(&self) -> Result<StressProfile> {
        match &self.config {
            Some(path) => {
                debug!("Loading profile from {}", path.display());
                StressProfile::load(path)
            }
            None => Ok(StressProfile::default()),
        }
    }
}

#[derive(Debug, Subcommand)]
pub(crate) enum SubCommands {
    Stress(StressCmd),
    List(ListCmd),
}

/// Exercise network stack hooks and the programs attached to them
///
/// Hooks are registered in-process; programs are attached to and detached
/// from them while other threads keep invoking them.
#[derive(Debug, Parser)]
#[command(name = "netebpfext", version, disable_help_subcommand = true)]
pub(crate) struct NetebpfextCli {
    #[command(flatten)]
    pub(crate) main_config: MainConfig,
    #[command(subcommand)]
    pub(crate) subcommand: SubCommands,
}

impl NetebpfextCli {
    /// Parse the given arguments. Used by unit tests; the binary calls
    /// `NetebpfextCli::parse()`.
    #[cfg(test)]
    pub(crate) fn build_from<I, T>(args: I) -> Result<Self, clap::Error>
    where
        I: IntoIterator<Item = T>,
        T: Into<std::ffi::OsString> + Clone,
    {
        Self::try_parse_from(args)
    }

    pub(crate) fn run(mut self) -> Result<()> {
        let runner: &mut dyn SubCommandParserRunner = match &mut self.subcommand {
            SubCommands::Stress(cmd) => cmd,
            SubCommands::List(cmd) => cmd,
        };
        runner.run(&self.main_config)
    }
}
