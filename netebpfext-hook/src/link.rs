//! # Program links
//!
//! A link is the client side of a hook binding: it registers an attached
//! program with the registrar under the hook's attach type, and hands the
//! program's dispatch table to the provider accepting it.
use std::sync::Arc;

use log::debug;
use uuid::Uuid;

use crate::{
    data::ExtensionData,
    dispatch::ProgramDispatch,
    error::Result,
    registrar::{BindingId, Characteristics, ClientModule, Registrar, RegistrationHandle},
};

struct LinkState {
    program: Arc<dyn ProgramDispatch>,
    bindings: spin::Mutex<Vec<BindingId>>,
}

impl ClientModule for LinkState {
    fn dispatch(&self) -> Option<Arc<dyn ProgramDispatch>> {
        Some(self.program.clone())
    }

    fn on_bound(&self, binding: BindingId, provider: &Characteristics) {
        debug!("Link bound to provider {} ({binding})", provider.module_id);
        self.bindings.lock().push(binding);
    }

    fn on_unbound(&self, binding: BindingId) {
        self.bindings.lock().retain(|b| *b != binding);
    }
}

pub struct Link {
    registrar: Registrar,
    handle: RegistrationHandle,
    module_id: Uuid,
    state: Arc<LinkState>,
}

impl Link {
    /// Attach `program` to the hooks of type `attach_type`, passing them
    /// `client_data` as attach parameters. Succeeds even if no hook accepted
    /// the program; see `Link::is_bound`.
    pub fn attach(
        registrar: &Registrar,
        attach_type: Uuid,
        client_data: ExtensionData,
        program: Arc<dyn ProgramDispatch>,
    ) -> Result<Self> {
        let module_id = Uuid::new_v4();
        let state = Arc::new(LinkState {
            program,
            bindings: spin::Mutex::new(Vec::new()),
        });

        let handle = registrar.register_client(
            Characteristics {
                npi_id: attach_type,
                module_id,
                npi_specific: client_data,
            },
            state.clone(),
        )?;

        Ok(Self {
            registrar: registrar.clone(),
            handle,
            module_id,
            state,
        })
    }

    /// Detach the program from all hooks. Blocks until no hook can invoke it
    /// anymore.
    pub fn detach(self) -> Result<()> {
        self.registrar.deregister_client(self.handle)
    }

    pub fn module_id(&self) -> Uuid {
        self.module_id
    }

    /// Is the program attached to at least one hook?
    pub fn is_bound(&self) -> bool {
        !self.state.bindings.lock().is_empty()
    }

    pub fn bindings(&self) -> Vec<BindingId> {
        self.state.bindings.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use std::any::Any;

    use super::*;

    #[test]
    fn unbound_link() {
        let registrar = Registrar::new();
        let program = |_: &mut dyn Any| -> Result<u32> { Ok(0) };

        let link = Link::attach(
            &registrar,
            Uuid::new_v4(),
            ExtensionData::empty(),
            Arc::new(program),
        )
        .unwrap();
        assert!(!link.is_bound());
        assert!(link.bindings().is_empty());
        assert!(link.detach().is_ok());
    }
}
