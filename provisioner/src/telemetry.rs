//! Tracing subscriber setup for hosts embedding the engine.

use anyhow::Result;
use tracing_subscriber::EnvFilter;

/// Install a fmt subscriber filtered by `RUST_LOG`, falling back to
/// `default_directive` (e.g. `"info"` or `"convoy_provisioner=debug"`).
///
/// # Errors
///
/// Returns an error if a global subscriber is already installed.
pub fn init(default_directive: &str) -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive)),
        )
        .with_target(true)
        .try_init()
        .map_err(|e| anyhow::anyhow!("installing tracing subscriber: {e}"))
}
