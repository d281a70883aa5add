//! # Extension data
//!
//! Opaque, versioned payloads exchanged between providers and clients at
//! registration and attach time. The framework stores and forwards them; only
//! the hook modules give them a meaning.
use std::{fmt, sync::Arc};

/// Versioned opaque blob. Cloning is cheap as the payload is shared.
#[derive(Clone, PartialEq, Eq)]
pub struct ExtensionData {
    pub version: u16,
    data: Arc<[u8]>,
}

impl ExtensionData {
    pub const CURRENT_VERSION: u16 = 0;

    pub fn new<D>(version: u16, data: D) -> Self
    where
        D: Into<Arc<[u8]>>,
    {
        Self {
            version,
            data: data.into(),
        }
    }

    /// Extension data at the current version wrapping `data`.
    pub fn from_bytes(data: &[u8]) -> Self {
        Self::new(Self::CURRENT_VERSION, data)
    }

    pub fn empty() -> Self {
        Self::new(Self::CURRENT_VERSION, Vec::new())
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl Default for ExtensionData {
    fn default() -> Self {
        Self::empty()
    }
}

impl fmt::Debug for ExtensionData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ExtensionData(v{}, {} bytes)", self.version, self.size())
    }
}
