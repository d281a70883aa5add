use std::io::{stdout, Write};

use anyhow::Result;
use clap::Args;
use hook::Registrar;

use crate::{
    cli::*,
    hooks::{HookInfo, RegisteredHook},
    profiles::StressProfile,
};

/// List the hooks of the profile.
///
/// Each hook is registered on its own, its published attach parameters are
/// read back, then it is unregistered.
#[derive(Args, Debug, Default)]
pub(crate) struct ListCmd {
    #[arg(long, help = "Print the list in JSON")]
    pub(crate) json: bool,
}

impl ListCmd {
    fn collect(profile: &StressProfile) -> Result<Vec<HookInfo>> {
        let registrar = Registrar::new();

        profile
            .hooks
            .iter()
            .map(|h| {
                let hook = RegisteredHook::register(&registrar, h.kind)?;
                let info = hook.info();
                hook.unregister()?;
                info
            })
            .collect()
    }
}

impl SubCommandParserRunner for ListCmd {
    fn run(&mut self, main_config: &MainConfig) -> Result<()> {
        let hooks = Self::collect(&main_config.profile()?)?;

        let mut out = stdout().lock();
        if self.json {
            serde_json::to_writer_pretty(&mut out, &hooks)?;
            writeln!(out)?;
            return Ok(());
        }

        for hook in hooks.iter() {
            writeln!(
                out,
                "{:6} attach type {} program type {} ({} level, bpf attach type {})",
                hook.name,
                hook.attach_type,
                hook.program_type,
                hook.execution_level,
                hook.bpf_attach_type
            )?;
        }
        Ok(())
    }
}
