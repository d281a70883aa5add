//! # XDP hook
//!
//! Runs the attached program on every received packet, at dispatch level.
//! Links pass the interface index they attach to as a little endian u32;
//! no data, or index 0, means all interfaces. Only the first attached
//! program is ever run, so the hook accepts a single link at a time whatever
//! its interface.
use std::sync::{Arc, Mutex};

use uuid::Uuid;

use super::AttachProviderData;
use crate::{
    client::{ClientId, HookClient},
    data::ExtensionData,
    error::{AttachDenial, Result},
    level::{self, ExecutionLevel},
    provider::{HookModule, HookProvider, HookProviderParameters},
    registrar::Registrar,
};

pub const XDP_ATTACH_TYPE: Uuid = Uuid::from_u128(0x85e0d8ef_579e_4931_b072_8ee226bb2e9d);
pub const XDP_PROGRAM_TYPE: Uuid = Uuid::from_u128(0xf1832a85_85d5_45b0_98a0_7069d63013b0);
const XDP_PROVIDER_MODULE_ID: Uuid = Uuid::from_u128(0x6c9f2a2e_1b5a_4c0e_9d3c_7b7e0a3f5d21);
const BPF_XDP: u32 = 37;

/// Packet handed to XDP programs.
#[derive(Clone, Debug, Default)]
pub struct XdpContext {
    pub data: Vec<u8>,
    pub ingress_ifindex: u32,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum XdpAction {
    Aborted,
    Drop,
    Pass,
    Tx,
}

impl From<u32> for XdpAction {
    /// Unknown program results abort the packet processing.
    fn from(result: u32) -> Self {
        match result {
            1 => XdpAction::Drop,
            2 => XdpAction::Pass,
            3 => XdpAction::Tx,
            _ => XdpAction::Aborted,
        }
    }
}

/// Interface a client is attached to; 0 for all of them.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
struct XdpClientData {
    ifindex: u32,
}

impl XdpClientData {
    fn parse(data: &ExtensionData) -> std::result::Result<Self, AttachDenial> {
        let ifindex = match data.data() {
            [] => 0,
            [a, b, c, d] => u32::from_le_bytes([*a, *b, *c, *d]),
            raw => {
                return Err(AttachDenial::InvalidArgument(format!(
                    "XDP client data must be a 4 bytes interface index, got {} bytes",
                    raw.len()
                )))
            }
        };
        Ok(Self { ifindex })
    }
}

#[derive(Default)]
struct XdpHookModule {
    /// The attached client and its interface.
    attached: Mutex<Option<(ClientId, XdpClientData)>>,
}

impl HookModule for XdpHookModule {
    fn on_client_attach(&self, client: &HookClient) -> std::result::Result<(), AttachDenial> {
        let data = XdpClientData::parse(client.client_data())?;

        let mut attached = self.attached.lock().unwrap();
        if let Some((id, claimed)) = *attached {
            return Err(AttachDenial::AccessDenied(format!(
                "XDP hook already used by client {id} (interface {})",
                claimed.ifindex
            )));
        }
        *attached = Some((client.id(), data));

        client.set_provider_data(Arc::new(data));
        Ok(())
    }

    fn on_client_detach(&self, client: &HookClient) {
        let mut attached = self.attached.lock().unwrap();
        if matches!(*attached, Some((id, _)) if id == client.id()) {
            *attached = None;
        }
    }
}

pub struct XdpHook {
    provider: Arc<HookProvider>,
}

impl XdpHook {
    pub fn register(registrar: &Registrar) -> Result<Self> {
        let params = HookProviderParameters {
            name: "xdp".to_string(),
            attach_type: XDP_ATTACH_TYPE,
            provider_module_id: XDP_PROVIDER_MODULE_ID,
            provider_data: AttachProviderData {
                supported_program_type: XDP_PROGRAM_TYPE,
                bpf_attach_type: BPF_XDP,
            }
            .to_extension_data(),
            supported_program_types: vec![XDP_PROGRAM_TYPE],
            execution_level: ExecutionLevel::Dispatch,
        };

        Ok(Self {
            provider: HookProvider::register(registrar, params, XdpHookModule::default())?,
        })
    }

    pub fn unregister(self) -> Result<()> {
        self.provider.unregister()
    }

    pub fn provider(&self) -> &Arc<HookProvider> {
        &self.provider
    }

    /// Client data attaching a link to a single interface.
    pub fn client_data(ifindex: u32) -> ExtensionData {
        ExtensionData::from_bytes(&ifindex.to_le_bytes())
    }

    /// Run the attached program on a received packet. Packets are passed
    /// when no program is attached to their interface.
    pub fn process_packet(&self, ctx: &mut XdpContext) -> Result<XdpAction> {
        let _level = level::raise_to_dispatch();

        let client = match self.provider.get_attached_client() {
            Some(client) => client,
            None => return Ok(XdpAction::Pass),
        };

        match client.provider_data::<XdpClientData>() {
            Some(data) if data.ifindex == 0 || data.ifindex == ctx.ingress_ifindex => (),
            _ => return Ok(XdpAction::Pass),
        }

        let held = match client.acquire_rundown(ExecutionLevel::Dispatch) {
            Some(held) => held,
            None => return Ok(XdpAction::Pass),
        };

        held.invoke(ctx).map(XdpAction::from)
    }
}
