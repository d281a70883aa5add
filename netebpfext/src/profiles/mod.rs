//! # Profiles
//!
//! Stress profiles describe which hooks to exercise and how hard. They are
//! read from YAML files; a built-in default is used when none is given.

#[allow(clippy::module_inception)]
pub(crate) mod profiles;
pub(crate) use profiles::*;
