//! # Hooks
//!
//! Glue between the profiles and the hook modules: registering a hook of a
//! given kind, building its attach parameters and a sample invocation.
use std::{
    net::SocketAddr,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use anyhow::Result;
use hook::{
    hooks::{
        AttachProviderData, BindAction, BindContext, BindHook, BindOperation, XdpAction,
        XdpContext, XdpHook,
    },
    ExtensionData, HookProvider, Registrar,
};
use serde::Serialize;
use uuid::Uuid;

use crate::profiles::{HookKind, HookProfile};

/// Description of a registered hook.
#[derive(Clone, Debug, Serialize)]
pub(crate) struct HookInfo {
    pub(crate) name: String,
    pub(crate) attach_type: Uuid,
    pub(crate) program_type: Uuid,
    pub(crate) bpf_attach_type: u32,
    pub(crate) execution_level: String,
}

pub(crate) enum RegisteredHook {
    Xdp(XdpHook),
    Bind(BindHook),
}

impl RegisteredHook {
    pub(crate) fn register(registrar: &Registrar, kind: HookKind) -> Result<Self> {
        Ok(match kind {
            HookKind::Xdp => RegisteredHook::Xdp(XdpHook::register(registrar)?),
            HookKind::Bind => RegisteredHook::Bind(BindHook::register(registrar)?),
        })
    }

    pub(crate) fn provider(&self) -> &Arc<HookProvider> {
        match self {
            RegisteredHook::Xdp(hook) => hook.provider(),
            RegisteredHook::Bind(hook) => hook.provider(),
        }
    }

    pub(crate) fn info(&self) -> Result<HookInfo> {
        let provider = self.provider();
        let data = AttachProviderData::from_extension_data(provider.provider_data())?;

        Ok(HookInfo {
            name: provider.name().to_string(),
            attach_type: provider.attach_type(),
            program_type: data.supported_program_type,
            bpf_attach_type: data.bpf_attach_type,
            execution_level: provider.execution_level().to_string(),
        })
    }

    /// Attach parameters of the programs attached by a profile.
    pub(crate) fn client_data(profile: &HookProfile) -> ExtensionData {
        match profile.kind {
            HookKind::Xdp => match profile.ifindex {
                Some(ifindex) => XdpHook::client_data(ifindex),
                None => ExtensionData::empty(),
            },
            HookKind::Bind => BindHook::client_data(),
        }
    }

    /// Run the hook once on a made up packet or bind request. Returns true
    /// if the outcome is not the one of a hook without program.
    pub(crate) fn invoke(&self, profile: &HookProfile, seq: &AtomicU64) -> Result<bool> {
        let seq = seq.fetch_add(1, Ordering::Relaxed);

        Ok(match self {
            RegisteredHook::Xdp(hook) => {
                let mut ctx = XdpContext {
                    data: seq.to_be_bytes().to_vec(),
                    ingress_ifindex: match profile.ifindex {
                        Some(0) | None => 1,
                        Some(ifindex) => ifindex,
                    },
                };
                hook.process_packet(&mut ctx)? != XdpAction::Pass
            }
            RegisteredHook::Bind(hook) => {
                let mut ctx = BindContext {
                    process_id: seq,
                    socket_address: SocketAddr::from(([127, 0, 0, 1], (seq % 65536) as u16)),
                    protocol: 6,
                    operation: BindOperation::Bind,
                };
                hook.authorize(&mut ctx)? != BindAction::Permit
            }
        })
    }

    pub(crate) fn unregister(self) -> Result<()> {
        match self {
            RegisteredHook::Xdp(hook) => hook.unregister()?,
            RegisteredHook::Bind(hook) => hook.unregister()?,
        }
        Ok(())
    }
}
