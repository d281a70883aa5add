use anyhow::Result;
use clap::Parser;

mod cli;
mod helpers;
mod hooks;
mod list;
mod profiles;
mod stress;

use crate::{cli::NetebpfextCli, helpers::logger::Logger};

fn main() -> Result<()> {
    let cli = NetebpfextCli::parse();
    let _logger = Logger::init(cli.main_config.log_level_filter()?)?;

    cli.run()
}
