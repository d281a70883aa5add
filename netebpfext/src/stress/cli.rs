use std::io::{stdout, Write};

use anyhow::{bail, Result};
use clap::Args;
use log::info;

use super::run_stress;
use crate::{
    cli::*,
    helpers::signals::Running,
    profiles::{HookKind, StressProfile},
};

/// Attach and detach programs while the hooks are being invoked.
///
/// Hooks from the profile (--config, or the built-in one) are registered and
/// invoked continuously by dedicated threads, the XDP ones at dispatch level.
/// Meanwhile programs are attached to and detached from every hook, cycle
/// after cycle. The run stops once all cycles are done or on SIGINT/SIGTERM.
#[derive(Args, Debug, Default)]
pub(crate) struct StressCmd {
    #[arg(long, help = "Number of attach/detach cycles, overriding the profile")]
    pub(crate) cycles: Option<u64>,
    // Use the plural in the struct but singular for the cli parameter as we're
    // dealing with a list here.
    #[arg(
        id = "hook",
        long = "hook",
        value_delimiter = ',',
        help = "Comma-separated list of hooks to stress. All hooks of the profile are used if not set"
    )]
    pub(crate) hooks: Vec<HookKind>,
    #[arg(long, help = "Number of invoker threads per hook, overriding the profile")]
    pub(crate) invokers: Option<usize>,
    #[arg(long, help = "Print the summary in JSON")]
    pub(crate) json: bool,
}

impl StressCmd {
    /// Apply the command line overrides to a profile.
    pub(crate) fn apply(&self, profile: &mut StressProfile) -> Result<()> {
        if let Some(cycles) = self.cycles {
            profile.cycles = cycles;
        }
        profile.retain_hooks(&self.hooks);
        if let Some(invokers) = self.invokers {
            profile.hooks.iter_mut().for_each(|h| h.invokers = invokers);
        }

        profile.validate()?;
        Ok(())
    }
}

impl SubCommandParserRunner for StressCmd {
    fn run(&mut self, main_config: &MainConfig) -> Result<()> {
        let mut profile = main_config.profile()?;
        self.apply(&mut profile)?;

        let running = Running::new()?;
        let summary = run_stress(&profile, &running)?;
        info!("Stress run done");

        let mut out = stdout().lock();
        match self.json {
            true => {
                serde_json::to_writer_pretty(&mut out, &summary)?;
                writeln!(out)?;
            }
            false => write!(out, "{summary}")?,
        }

        let late = summary.late_runs();
        if late > 0 {
            bail!("{late} program run(s) observed after their detach completed");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profiles::HookProfile;

    #[test]
    fn apply() -> Result<()> {
        let mut profile = StressProfile::default();
        StressCmd::default().apply(&mut profile)?;
        assert_eq!(profile, StressProfile::default());

        let cmd = StressCmd {
            cycles: Some(7),
            hooks: vec![HookKind::Xdp],
            invokers: Some(8),
            json: false,
        };
        cmd.apply(&mut profile)?;
        assert_eq!(profile.cycles, 7);
        assert_eq!(
            profile.hooks,
            vec![HookProfile {
                invokers: 8,
                ..HookProfile::new(HookKind::Xdp)
            }]
        );

        let cmd = StressCmd {
            invokers: Some(0),
            ..Default::default()
        };
        assert!(cmd.apply(&mut profile).is_err());
        Ok(())
    }
}
