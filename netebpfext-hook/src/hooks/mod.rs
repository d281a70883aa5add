//! # Hook modules
//!
//! Concrete hook points built on top of the hook provider: XDP, invoked for
//! every received packet at dispatch level, and bind, invoked at passive
//! level when a socket binds.
use uuid::Uuid;

use crate::{data::ExtensionData, error::HookError};

pub mod bind;
pub use bind::*;
pub mod xdp;
pub use xdp::*;

/// Data published by hook providers to attaching links: the program type
/// the hook runs and the matching Linux attach type.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct AttachProviderData {
    pub supported_program_type: Uuid,
    pub bpf_attach_type: u32,
}

impl AttachProviderData {
    const SIZE: usize = 20;

    pub fn to_extension_data(&self) -> ExtensionData {
        let mut data = Vec::with_capacity(Self::SIZE);
        data.extend_from_slice(self.supported_program_type.as_bytes());
        data.extend_from_slice(&self.bpf_attach_type.to_le_bytes());
        ExtensionData::new(ExtensionData::CURRENT_VERSION, data)
    }

    pub fn from_extension_data(data: &ExtensionData) -> Result<Self, HookError> {
        let raw = data.data();
        if raw.len() != Self::SIZE {
            return Err(HookError::InvalidArgument(format!(
                "attach provider data is {} bytes, expected {}",
                raw.len(),
                Self::SIZE
            )));
        }

        // Lengths were checked above.
        let mut program_type = [0u8; 16];
        program_type.copy_from_slice(&raw[..16]);
        let mut attach_type = [0u8; 4];
        attach_type.copy_from_slice(&raw[16..]);

        Ok(Self {
            supported_program_type: Uuid::from_bytes(program_type),
            bpf_attach_type: u32::from_le_bytes(attach_type),
        })
    }
}
