//! Convoy provisioner: reconciles application processes onto a container
//! cluster (Docker Swarm or Kubernetes) and runs builds, deploys and
//! commands on it.
//!
//! Layers:
//! - `domain` holds pure types and spec-building logic.
//! - `application` holds port traits, use-case services and the
//!   [`Provisioner`] facade.
//! - `infra` holds the backend adapters and local stores.

pub mod application;
pub mod domain;
pub mod infra;
pub mod telemetry;

pub use application::{Provisioner, ShellRequest};
pub use domain::{EngineConfig, ProvisionError};
