//! # Execution levels
//!
//! Hooks run either at a level where the caller may block (passive) or at a
//! level where it must never block (dispatch). The current level is tracked
//! per thread so that blocking operations can refuse to run at dispatch
//! level instead of silently deadlocking the network stack.
use std::{cell::Cell, fmt, marker::PhantomData, str::FromStr};

use serde::{Deserialize, Serialize};

/// Execution level of a hook, or of the code calling into it.
#[derive(
    Clone, Copy, Debug, Default, Deserialize, Serialize, Eq, Hash, PartialEq, PartialOrd, Ord,
)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionLevel {
    #[default]
    Passive,
    Dispatch,
}

impl ExecutionLevel {
    /// Is blocking allowed at this level?
    pub fn can_block(self) -> bool {
        self == ExecutionLevel::Passive
    }

    /// Can code running at `caller` enter a hook registered at this level? A
    /// dispatch hook can be entered from any level, a passive hook only from
    /// passive level.
    pub fn allows_entry_from(self, caller: ExecutionLevel) -> bool {
        caller <= self
    }
}

impl fmt::Display for ExecutionLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutionLevel::Passive => write!(f, "passive"),
            ExecutionLevel::Dispatch => write!(f, "dispatch"),
        }
    }
}

impl FromStr for ExecutionLevel {
    type Err = String;

    fn from_str(val: &str) -> Result<Self, Self::Err> {
        Ok(match val {
            "passive" => ExecutionLevel::Passive,
            "dispatch" => ExecutionLevel::Dispatch,
            x => return Err(format!("Unknown execution level ({x})")),
        })
    }
}

thread_local! {
    static CURRENT: Cell<ExecutionLevel> = const { Cell::new(ExecutionLevel::Passive) };
}

/// Level the calling thread currently runs at.
pub fn current() -> ExecutionLevel {
    CURRENT.with(|c| c.get())
}

/// Raise the calling thread to dispatch level until the returned guard is
/// dropped. Guards nest.
pub fn raise_to_dispatch() -> DispatchGuard {
    let previous = CURRENT.with(|c| c.replace(ExecutionLevel::Dispatch));
    DispatchGuard {
        previous,
        _not_send: PhantomData,
    }
}

/// Keeps the thread at dispatch level while alive. Not `Send`: the level
/// belongs to the thread which raised it.
#[must_use = "the level is restored as soon as the guard is dropped"]
pub struct DispatchGuard {
    previous: ExecutionLevel,
    _not_send: PhantomData<*const ()>,
}

impl Drop for DispatchGuard {
    fn drop(&mut self) {
        CURRENT.with(|c| c.set(self.previous));
    }
}

/// Fail loudly if `op`, which may block, is called at dispatch level.
#[track_caller]
pub fn assert_blockable(op: &str) {
    if !current().can_block() {
        panic!("{op} may block and can't be called at dispatch level");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guard_nesting() {
        assert_eq!(current(), ExecutionLevel::Passive);
        {
            let _outer = raise_to_dispatch();
            assert_eq!(current(), ExecutionLevel::Dispatch);
            {
                let _inner = raise_to_dispatch();
                assert_eq!(current(), ExecutionLevel::Dispatch);
            }
            assert_eq!(current(), ExecutionLevel::Dispatch);
        }
        assert_eq!(current(), ExecutionLevel::Passive);
    }

    #[test]
    fn entry_compatibility() {
        use ExecutionLevel::*;

        assert!(Dispatch.allows_entry_from(Passive));
        assert!(Dispatch.allows_entry_from(Dispatch));
        assert!(Passive.allows_entry_from(Passive));
        assert!(!Passive.allows_entry_from(Dispatch));
    }

    #[test]
    fn parse() {
        assert_eq!("dispatch".parse::<ExecutionLevel>(), Ok(ExecutionLevel::Dispatch));
        assert_eq!("passive".parse::<ExecutionLevel>(), Ok(ExecutionLevel::Passive));
        assert!("irql".parse::<ExecutionLevel>().is_err());
    }

    #[test]
    #[should_panic(expected = "can't be called at dispatch level")]
    fn blocking_at_dispatch() {
        let _guard = raise_to_dispatch();
        assert_blockable("test");
    }
}
