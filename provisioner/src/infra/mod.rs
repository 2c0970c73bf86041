//! Infrastructure layer: concrete implementations of application port traits.
//!
//! Backend adapters talk to a Swarm manager through the Engine API or to a
//! Kubernetes API server over REST. Imports from `crate::domain` and
//! `crate::application::ports` are allowed.

pub mod kubernetes;
pub mod memory;
pub mod swarm;
pub mod tls;
