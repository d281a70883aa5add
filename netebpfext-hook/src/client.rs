//! # Hook client
//!
//! A hook client is the provider side binding context of one attached
//! program instance (a link). It keeps the attach-time data, the program's
//! dispatch table and the rundown protection guarding invocations against
//! the client being detached.
use std::{any::Any, fmt, ops::Deref, sync::Arc};

use uuid::Uuid;

use crate::{
    data::ExtensionData,
    dispatch::ProgramDispatch,
    level::ExecutionLevel,
    registrar::BindingId,
    rundown::{Rundown, RundownRef},
};

/// Stable handle of a hook client: the binding it was created for.
pub type ClientId = BindingId;

type ProviderData = Arc<dyn Any + Send + Sync>;

pub struct HookClient {
    id: ClientId,
    /// Module identifier of the attached client.
    module_id: Uuid,
    /// Attach type of the owning provider.
    attach_type: Uuid,
    /// Attach parameters, immutable once the client exists.
    client_data: ExtensionData,
    dispatch: Arc<dyn ProgramDispatch>,
    /// Hook-specific data. Only hook modules give it a meaning.
    provider_data: spin::RwLock<Option<ProviderData>>,
    rundown: Rundown,
    /// Execution level of the owning provider.
    level: ExecutionLevel,
}

impl HookClient {
    pub(crate) fn new(
        id: ClientId,
        module_id: Uuid,
        attach_type: Uuid,
        client_data: ExtensionData,
        dispatch: Arc<dyn ProgramDispatch>,
        level: ExecutionLevel,
    ) -> Self {
        Self {
            id,
            module_id,
            attach_type,
            client_data,
            dispatch,
            provider_data: spin::RwLock::new(None),
            rundown: Rundown::new(),
            level,
        }
    }

    pub fn id(&self) -> ClientId {
        self.id
    }

    pub fn module_id(&self) -> Uuid {
        self.module_id
    }

    pub fn attach_type(&self) -> Uuid {
        self.attach_type
    }

    pub fn execution_level(&self) -> ExecutionLevel {
        self.level
    }

    /// Attach parameters received from the client.
    pub fn client_data(&self) -> &ExtensionData {
        &self.client_data
    }

    /// Store hook-specific data on the client, replacing any previous value.
    /// The hook module owns its lifetime and any synchronization it needs
    /// beyond the slot itself.
    pub fn set_provider_data<T>(&self, data: Arc<T>)
    where
        T: Any + Send + Sync,
    {
        *self.provider_data.write() = Some(data);
    }

    /// Retrieve the hook-specific data, if set and of type `T`.
    pub fn provider_data<T>(&self) -> Option<Arc<T>>
    where
        T: Any + Send + Sync,
    {
        self.provider_data
            .read()
            .clone()
            .and_then(|data| data.downcast::<T>().ok())
    }

    pub fn clear_provider_data(&self) {
        self.provider_data.write().take();
    }

    #[track_caller]
    fn check_level(&self, level: ExecutionLevel) {
        if !self.level.allows_entry_from(level) {
            panic!(
                "Client {} of a {} hook entered at {level} level",
                self.id, self.level
            );
        }
    }

    /// Acquire rundown on the client. Returns false if the client is being
    /// detached, in which case its program must not be invoked. Never blocks.
    pub fn enter_rundown(&self, level: ExecutionLevel) -> bool {
        self.check_level(level);
        self.rundown.enter(level)
    }

    /// Release rundown acquired with `enter_rundown`. Never blocks.
    pub fn leave_rundown(&self, level: ExecutionLevel) {
        self.check_level(level);
        self.rundown.leave(level)
    }

    /// Acquire rundown and return a guard releasing it on drop.
    pub fn acquire_rundown(&self, level: ExecutionLevel) -> Option<ClientRef<'_>> {
        self.check_level(level);
        self.rundown.try_acquire(level).map(|rundown| ClientRef {
            client: self,
            _rundown: rundown,
        })
    }

    pub(crate) fn rundown(&self) -> &Rundown {
        &self.rundown
    }

    pub(crate) fn dispatch(&self) -> &dyn ProgramDispatch {
        self.dispatch.as_ref()
    }
}

impl fmt::Debug for HookClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HookClient")
            .field("id", &self.id)
            .field("module_id", &self.module_id)
            .field("attach_type", &self.attach_type)
            .field("client_data", &self.client_data)
            .field("level", &self.level)
            .field("rundown", &self.rundown)
            .finish()
    }
}

/// A client on which rundown is held. Dereferences to the client; rundown is
/// released when dropped.
pub struct ClientRef<'a> {
    client: &'a HookClient,
    _rundown: RundownRef<'a>,
}

impl Deref for ClientRef<'_> {
    type Target = HookClient;

    fn deref(&self) -> &Self::Target {
        self.client
    }
}
