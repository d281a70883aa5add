//! # Invocation dispatcher
//!
//! Call-out from the network stack into the program attached to a hook. The
//! dispatcher does no synchronization of its own: callers must hold rundown
//! on the client for the whole invocation.
use std::any::Any;

use crate::{
    client::{ClientRef, HookClient},
    error::Result,
    level::ExecutionLevel,
    provider::HookProvider,
};

/// Entry point of an attached program, as handed over by the client at
/// attach time.
pub trait ProgramDispatch: Send + Sync {
    /// Run the program on `context` and return its result. An error is only
    /// returned when resources needed to run the program could not be
    /// obtained.
    fn invoke(&self, context: &mut dyn Any) -> Result<u32>;
}

impl<F> ProgramDispatch for F
where
    F: Fn(&mut dyn Any) -> Result<u32> + Send + Sync,
{
    fn invoke(&self, context: &mut dyn Any) -> Result<u32> {
        self(context)
    }
}

/// Invoke the program attached through `client`. The caller must hold
/// rundown on the client (see `HookClient::enter_rundown`); doing otherwise
/// is a bug and panics.
pub fn invoke_program(client: &HookClient, context: &mut dyn Any) -> Result<u32> {
    assert!(
        client.rundown().entrants() > 0,
        "Program of client {} invoked without holding rundown",
        client.id()
    );
    client.dispatch().invoke(context)
}

impl HookClient {
    /// See `invoke_program`.
    pub fn invoke_program(&self, context: &mut dyn Any) -> Result<u32> {
        invoke_program(self, context)
    }
}

impl ClientRef<'_> {
    /// Invoke the client's program; rundown is held by construction.
    pub fn invoke(&self, context: &mut dyn Any) -> Result<u32> {
        invoke_program(self, context)
    }
}

/// Outcome of invoking the program attached to a hook.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum InvokeOutcome {
    /// The program ran and returned this value.
    Invoked(u32),
    /// No client was attached, or it was being detached.
    NotInvoked,
}

/// Invoke the first client attached to `provider`, if any. Only the first
/// client is ever invoked: a hook point runs a single program at a time, the
/// others stay attached but idle.
pub fn invoke_first_attached(
    provider: &HookProvider,
    level: ExecutionLevel,
    context: &mut dyn Any,
) -> Result<InvokeOutcome> {
    let client = match provider.get_attached_client() {
        Some(client) => client,
        None => return Ok(InvokeOutcome::NotInvoked),
    };

    let held = match client.acquire_rundown(level) {
        Some(held) => held,
        None => return Ok(InvokeOutcome::NotInvoked),
    };

    held.invoke(context).map(InvokeOutcome::Invoked)
}
