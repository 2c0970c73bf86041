//! Application services: use-case orchestration over ports.
//!
//! Each service imports only from `crate::domain` and
//! `crate::application::ports`.

pub mod cluster;
pub mod exec;
pub mod membership;
pub mod reconciler;
pub mod runner;
pub mod translator;
