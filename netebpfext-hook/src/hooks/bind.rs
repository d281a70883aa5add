//! # Bind hook
//!
//! Lets a program authorize socket binds. Runs at passive level and accepts
//! a single program at a time.
use std::{
    net::SocketAddr,
    sync::{Arc, Mutex},
};

use uuid::Uuid;

use super::AttachProviderData;
use crate::{
    client::{ClientId, HookClient},
    data::ExtensionData,
    dispatch::{invoke_first_attached, InvokeOutcome},
    error::{AttachDenial, Result},
    level::{self, ExecutionLevel},
    provider::{HookModule, HookProvider, HookProviderParameters},
    registrar::Registrar,
};

pub const BIND_ATTACH_TYPE: Uuid = Uuid::from_u128(0xb9707e04_8127_4c72_833e_05b1fb439496);
pub const BIND_PROGRAM_TYPE: Uuid = Uuid::from_u128(0x608c517c_6c52_4a26_b677_bb1c34425adf);
const BIND_PROVIDER_MODULE_ID: Uuid = Uuid::from_u128(0x3f1d8b5e_0c47_4e2a_a9c6_52d4e8b7f013);
const BPF_CGROUP_INET4_BIND: u32 = 8;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum BindOperation {
    Bind,
    PostBind,
    Unbind,
}

/// Socket bind request handed to bind programs.
#[derive(Clone, Debug)]
pub struct BindContext {
    pub process_id: u64,
    pub socket_address: SocketAddr,
    pub protocol: u8,
    pub operation: BindOperation,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum BindAction {
    Permit,
    Deny,
    Redirect,
}

impl From<u32> for BindAction {
    /// Unknown program results deny the bind.
    fn from(result: u32) -> Self {
        match result {
            0 => BindAction::Permit,
            2 => BindAction::Redirect,
            _ => BindAction::Deny,
        }
    }
}

#[derive(Default)]
struct BindHookModule {
    attached: Mutex<Option<ClientId>>,
}

impl HookModule for BindHookModule {
    fn on_client_attach(&self, client: &HookClient) -> std::result::Result<(), AttachDenial> {
        let mut attached = self.attached.lock().unwrap();
        if let Some(id) = *attached {
            return Err(AttachDenial::AccessDenied(format!(
                "bind hook already used by client {id}"
            )));
        }
        *attached = Some(client.id());
        Ok(())
    }

    fn on_client_detach(&self, client: &HookClient) {
        let mut attached = self.attached.lock().unwrap();
        if *attached == Some(client.id()) {
            *attached = None;
        }
    }
}

pub struct BindHook {
    provider: Arc<HookProvider>,
}

impl BindHook {
    pub fn register(registrar: &Registrar) -> Result<Self> {
        let params = HookProviderParameters {
            name: "bind".to_string(),
            attach_type: BIND_ATTACH_TYPE,
            provider_module_id: BIND_PROVIDER_MODULE_ID,
            provider_data: AttachProviderData {
                supported_program_type: BIND_PROGRAM_TYPE,
                bpf_attach_type: BPF_CGROUP_INET4_BIND,
            }
            .to_extension_data(),
            supported_program_types: vec![BIND_PROGRAM_TYPE],
            execution_level: ExecutionLevel::Passive,
        };

        Ok(Self {
            provider: HookProvider::register(registrar, params, BindHookModule::default())?,
        })
    }

    pub fn unregister(self) -> Result<()> {
        self.provider.unregister()
    }

    pub fn provider(&self) -> &Arc<HookProvider> {
        &self.provider
    }

    /// Client data of bind links. The hook takes no attach parameter.
    pub fn client_data() -> ExtensionData {
        ExtensionData::empty()
    }

    /// Ask the attached program whether a bind is allowed. Binds are
    /// permitted when no program is attached.
    pub fn authorize(&self, ctx: &mut BindContext) -> Result<BindAction> {
        level::assert_blockable("BindHook::authorize");

        Ok(
            match invoke_first_attached(&self.provider, ExecutionLevel::Passive, ctx)? {
                InvokeOutcome::Invoked(result) => BindAction::from(result),
                InvokeOutcome::NotInvoked => BindAction::Permit,
            },
        )
    }
}
