//! Application layer: port traits, use-case services and the provisioner
//! facade.

pub mod ports;
pub mod provisioner;
pub mod services;

pub use provisioner::{Provisioner, ShellRequest};
