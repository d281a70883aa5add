use std::{collections::HashSet, fs::read_to_string, path::Path};

use anyhow::Result;
use clap::ValueEnum;
use serde::{Deserialize, Serialize};

/// Hooks the tool knows how to drive.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Deserialize, Serialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub(crate) enum HookKind {
    Xdp,
    Bind,
}

impl HookKind {
    /// Program result used when the profile does not set one: pass packets,
    /// permit binds.
    pub(crate) fn default_result(&self) -> u32 {
        match self {
            HookKind::Xdp => 2,
            HookKind::Bind => 0,
        }
    }
}

#[derive(thiserror::Error, Debug, Eq, PartialEq)]
pub(crate) enum ProfileError {
    #[error("profile has no hook")]
    NoHook,
    #[error("hook {0:?} is listed more than once")]
    DuplicateHook(HookKind),
    #[error("hook {0:?} has no invoker thread")]
    NoInvoker(HookKind),
    #[error("interface index only applies to the xdp hook")]
    UnexpectedIfindex,
}

/// Per hook stress parameters.
#[derive(Clone, Debug, Eq, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct HookProfile {
    pub(crate) kind: HookKind,
    /// Number of threads invoking the hook.
    #[serde(default = "default_invokers")]
    pub(crate) invokers: usize,
    /// Interface the program attaches to (xdp only). 0 means all of them.
    #[serde(default)]
    pub(crate) ifindex: Option<u32>,
    /// Value returned by the attached programs.
    #[serde(default)]
    pub(crate) result: Option<u32>,
}

fn default_invokers() -> usize {
    2
}

impl HookProfile {
    pub(crate) fn new(kind: HookKind) -> Self {
        Self {
            kind,
            invokers: default_invokers(),
            ifindex: None,
            result: None,
        }
    }

    pub(crate) fn program_result(&self) -> u32 {
        self.result.unwrap_or_else(|| self.kind.default_result())
    }
}

/// Stress profile.
#[derive(Clone, Debug, Eq, PartialEq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub(crate) struct StressProfile {
    pub(crate) hooks: Vec<HookProfile>,
    /// Number of attach/detach cycles.
    pub(crate) cycles: u64,
    /// Time a program stays attached in each cycle, in microseconds.
    pub(crate) hold_us: u64,
    /// Time spent in each program invocation, in microseconds.
    pub(crate) invoke_delay_us: u64,
}

impl Default for StressProfile {
    fn default() -> Self {
        Self {
            hooks: vec![HookProfile::new(HookKind::Xdp), HookProfile::new(HookKind::Bind)],
            cycles: 100,
            hold_us: 500,
            invoke_delay_us: 0,
        }
    }
}

impl StressProfile {
    /// Load a profile from a path.
    pub(crate) fn load(path: &Path) -> Result<StressProfile> {
        let contents = read_to_string(path)?;
        StressProfile::from_str(contents.as_str())
    }

    /// Load a profile from a string.
    pub(crate) fn from_str(contents: &str) -> Result<StressProfile> {
        let profile: StressProfile = serde_yaml::from_str(contents)?;
        profile.validate()?;
        Ok(profile)
    }

    pub(crate) fn validate(&self) -> Result<(), ProfileError> {
        if self.hooks.is_empty() {
            return Err(ProfileError::NoHook);
        }

        let mut seen = HashSet::new();
        for hook in self.hooks.iter() {
            if !seen.insert(hook.kind) {
                return Err(ProfileError::DuplicateHook(hook.kind));
            }
            if hook.invokers == 0 {
                return Err(ProfileError::NoInvoker(hook.kind));
            }
            if hook.kind != HookKind::Xdp && hook.ifindex.is_some() {
                return Err(ProfileError::UnexpectedIfindex);
            }
        }
        Ok(())
    }

    /// Only keep the given hooks, in the order they appear in the profile.
    pub(crate) fn retain_hooks(&mut self, kinds: &[HookKind]) {
        if !kinds.is_empty() {
            self.hooks.retain(|h| kinds.contains(&h.kind));
        }
    }
}
