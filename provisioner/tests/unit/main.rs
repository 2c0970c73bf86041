//! Unit tests for the convoy provisioner
//!
//! These tests drive the services and the facade against an in-memory
//! cluster and run fast without external I/O.

mod architecture;
mod fake_cluster;
mod membership;
mod provisioner_facade;
