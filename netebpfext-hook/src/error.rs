use thiserror::Error;

/// Errors reported by the registrar when registering or deregistering a
/// module.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistrarError {
    #[error("A module is already registered with this identifier")]
    Duplicate,
    #[error("Unknown registration handle")]
    NotFound,
    #[error("Module is being deregistered")]
    Deregistering,
}

/// Errors returned by the hook framework.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HookError {
    #[error("Not enough memory to allocate resources")]
    NoMemory,
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
    #[error("Access denied: {0}")]
    AccessDenied(String),
    #[error("Registration failed: {0}")]
    Registrar(#[from] RegistrarError),
}

pub type Result<T> = std::result::Result<T, HookError>;

/// Decision returned by a hook module refusing a client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttachDenial {
    /// The hook-specific policy does not allow this client.
    AccessDenied(String),
    /// The client data can't be understood by the hook.
    InvalidArgument(String),
}

impl From<AttachDenial> for HookError {
    fn from(denial: AttachDenial) -> Self {
        match denial {
            AttachDenial::AccessDenied(reason) => HookError::AccessDenied(reason),
            AttachDenial::InvalidArgument(reason) => HookError::InvalidArgument(reason),
        }
    }
}
