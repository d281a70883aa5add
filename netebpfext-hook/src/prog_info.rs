//! # Program information provider
//!
//! Publishes the description of a program type (its context layout and the
//! helpers programs of this type may call) to the program verification
//! layer. Registration only: no program is ever invoked through it, hence no
//! rundown protection.
//!
//! The program data travels as the provider's interface specific data,
//! serialized to JSON.
use std::sync::{Arc, Mutex, OnceLock};

use log::{debug, info};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    data::ExtensionData,
    dispatch::ProgramDispatch,
    error::{HookError, Result},
    level,
    registrar::{
        BindingId, Characteristics, DeregisterStatus, ProviderModule, Registrar,
        RegistrationHandle,
    },
};

/// Layout of the context passed to programs of a given type. Offsets of the
/// packet pointers are `None` if the context has no such field.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct ContextDescriptor {
    pub size: u32,
    pub data: Option<u32>,
    pub data_end: Option<u32>,
    pub meta: Option<u32>,
}

#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct ProgramTypeDescriptor {
    pub name: String,
    pub context_descriptor: ContextDescriptor,
    /// Overwritten with the provider's program type at registration.
    pub program_type: Uuid,
    /// Matching Linux program type number, if any.
    pub bpf_prog_type: u32,
    pub is_privileged: bool,
}

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HelperReturnType {
    Integer,
    PtrToMapValueOrNull,
}

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HelperArgType {
    Anything,
    PtrToCtx,
    PtrToMap,
    PtrToMapKey,
    PtrToMapValue,
    PtrToReadableMem,
    PtrToWritableMem,
    ConstSize,
}

/// Prototype of a helper function programs of this type can call.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct HelperPrototype {
    pub helper_id: u32,
    pub name: String,
    pub return_type: HelperReturnType,
    pub arguments: Vec<HelperArgType>,
}

#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct ProgramInfo {
    pub program_type_descriptor: ProgramTypeDescriptor,
    pub helpers: Vec<HelperPrototype>,
}

#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct ProgramData {
    pub program_info: ProgramInfo,
}

impl ProgramData {
    pub fn to_extension_data(&self) -> Result<ExtensionData> {
        let data = serde_json::to_vec(self)
            .map_err(|e| HookError::InvalidArgument(format!("program data: {e}")))?;
        Ok(ExtensionData::new(ExtensionData::CURRENT_VERSION, data))
    }

    pub fn from_extension_data(data: &ExtensionData) -> Result<Self> {
        serde_json::from_slice(data.data())
            .map_err(|e| HookError::InvalidArgument(format!("program data: {e}")))
    }
}

#[derive(Clone, Debug)]
pub struct ProgramInfoProviderParameters {
    pub program_type: Uuid,
    pub provider_module_id: Uuid,
    pub program_data: ProgramData,
}

/// Binding context of a client of the program information provider.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ProgramInfoClient {
    pub binding: BindingId,
    pub client_module_id: Uuid,
}

pub struct ProgramInfoProvider {
    program_type: Uuid,
    registrar: Registrar,
    handle: OnceLock<RegistrationHandle>,
    clients: Mutex<Vec<ProgramInfoClient>>,
}

impl ProgramInfoProvider {
    /// Register the program information provider. The interface identifier
    /// it registers under is the program type itself.
    pub fn register(
        registrar: &Registrar,
        mut params: ProgramInfoProviderParameters,
    ) -> Result<Arc<Self>> {
        if params.program_type.is_nil() {
            return Err(HookError::InvalidArgument("nil program type".to_string()));
        }

        params
            .program_data
            .program_info
            .program_type_descriptor
            .program_type = params.program_type;

        let characteristics = Characteristics {
            npi_id: params.program_type,
            module_id: params.provider_module_id,
            npi_specific: params.program_data.to_extension_data()?,
        };

        let provider = Arc::new(Self {
            program_type: params.program_type,
            registrar: registrar.clone(),
            handle: OnceLock::new(),
            clients: Mutex::new(Vec::new()),
        });

        let handle = registrar.register_provider(characteristics, provider.clone())?;
        let _ = provider.handle.set(handle);

        info!(
            "Registered program information provider for {} ({})",
            params.program_data.program_info.program_type_descriptor.name, params.program_type
        );
        Ok(provider)
    }

    /// Deregister the provider, waiting for bound clients to be detached.
    pub fn unregister(self: Arc<Self>) -> Result<()> {
        level::assert_blockable("ProgramInfoProvider::unregister");

        if let Some(handle) = self.handle.get() {
            if self.registrar.deregister_provider(*handle)? == DeregisterStatus::Pending {
                self.registrar.wait_for_provider_deregister_complete(*handle);
            }
        }
        Ok(())
    }

    pub fn program_type(&self) -> Uuid {
        self.program_type
    }

    pub fn clients(&self) -> Vec<ProgramInfoClient> {
        self.clients.lock().unwrap().clone()
    }
}

impl ProviderModule for ProgramInfoProvider {
    fn attach_client(
        &self,
        binding: BindingId,
        client: &Characteristics,
        _: Option<Arc<dyn ProgramDispatch>>,
    ) -> Result<()> {
        let mut clients = self.clients.lock().unwrap();
        clients.try_reserve(1).map_err(|_| HookError::NoMemory)?;
        clients.push(ProgramInfoClient {
            binding,
            client_module_id: client.module_id,
        });

        debug!(
            "Program information client {} attached ({binding})",
            client.module_id
        );
        Ok(())
    }

    fn detach_client(&self, binding: BindingId) {
        self.clients.lock().unwrap().retain(|c| c.binding != binding);
    }
}
