//! # Hook
//!
//! This crate implements the binding between network stack hook points and
//! the eBPF programs attached to them. A hook point registers a
//! [`HookProvider`] with a [`Registrar`]; programs attach to it as
//! [`HookClient`]s, and the network stack invokes them under rundown
//! protection so that detaching a program never races with an invocation
//! still in flight.

pub mod error;
pub use error::*;

pub mod data;
pub use data::*;

pub mod level;
pub use level::ExecutionLevel;

pub mod rundown;
pub use rundown::*;

pub mod client;
pub use client::*;

pub mod provider;
pub use provider::*;

pub mod dispatch;
pub use dispatch::*;

pub mod registrar;
pub use registrar::{
    BindingId, Characteristics, ClientModule, DeregisterStatus, ProviderModule, Registrar,
    RegistrationHandle,
};

pub mod link;
pub use link::Link;

pub mod prog_info;
pub mod hooks;
