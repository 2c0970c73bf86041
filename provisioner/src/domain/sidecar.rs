//! Platform-wide sidecars: one global service per pool scope, running on
//! every matching node.

use std::collections::BTreeMap;

use convoy_common::{LabelSet, keys};

use super::error::ProvisionError;
use super::spec::{BindMount, HealthCheck, PlacementConstraint, RestartPolicy, ServiceMode, ServiceSpec};

/// Sidecar definition as registered by an operator.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SidecarConfig {
    pub name: String,
    pub image: String,
    pub env: BTreeMap<String, String>,
    pub entrypoint: Vec<String>,
    pub args: Vec<String>,
    pub working_dir: Option<String>,
    pub user: Option<String>,
    pub tty: bool,
    /// `src:dst[:ro]` host binds.
    pub binds: Vec<String>,
    pub health_check: Option<HealthCheck>,
    pub labels: LabelSet,
}

/// Which pools a sidecar runs in. Both empty means every pool.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PoolFilter {
    pub include: Vec<String>,
    pub exclude: Vec<String>,
}

impl PoolFilter {
    /// Pool scopes that get their own object: each included pool, or the
    /// single all-pools scope (empty string).
    #[must_use]
    pub fn scopes(&self) -> Vec<&str> {
        if self.include.is_empty() {
            vec![""]
        } else {
            self.include.iter().map(String::as_str).collect()
        }
    }
}

#[must_use]
pub fn sidecar_service_name(name: &str, pool: &str) -> String {
    let scope = if pool.is_empty() { "all" } else { pool };
    format!("node-container-{name}-{scope}")
}

/// Placement for one scope: pinned to `pool`, or every pool minus the
/// excluded ones.
#[must_use]
pub fn sidecar_constraints(pool: &str, filter: &PoolFilter) -> Vec<PlacementConstraint> {
    if pool.is_empty() {
        filter
            .exclude
            .iter()
            .map(|p| PlacementConstraint::ne(keys::NODE_POOL, p))
            .collect()
    } else {
        vec![PlacementConstraint::eq(keys::NODE_POOL, pool)]
    }
}

/// Global-mode spec for a sidecar in one pool scope.
///
/// # Errors
///
/// Returns `InvalidSpec` for a nameless sidecar or a malformed bind.
pub fn build_sidecar_spec(
    config: &SidecarConfig,
    pool: &str,
    filter: &PoolFilter,
) -> Result<ServiceSpec, ProvisionError> {
    if config.name.is_empty() {
        return Err(ProvisionError::InvalidSpec("sidecar name is required".into()));
    }
    let mounts = config
        .binds
        .iter()
        .map(|b| {
            BindMount::parse(b)
                .ok_or_else(|| ProvisionError::InvalidSpec(format!("invalid bind '{b}'")))
        })
        .collect::<Result<Vec<_>, _>>()?;

    let mut labels = config.labels.clone();
    labels.set(keys::IS_CONVOY, "true");
    labels.set(keys::IS_NODE_CONTAINER, "true");
    labels.set(keys::NODE_CONTAINER_NAME, config.name.as_str());
    labels.set(keys::NODE_CONTAINER_POOL, pool);

    let mut command = config.entrypoint.clone();
    command.extend(config.args.iter().cloned());

    Ok(ServiceSpec {
        name: sidecar_service_name(&config.name, pool),
        image: config.image.clone(),
        env: config.env.clone(),
        command,
        working_dir: config.working_dir.clone(),
        user: config.user.clone(),
        tty: config.tty,
        mode: ServiceMode::Global,
        replicas: 0,
        restart_policy: RestartPolicy::Always,
        constraints: sidecar_constraints(pool, filter),
        network: None,
        endpoint_port: None,
        health_check: config.health_check.clone(),
        mounts,
        labels,
    })
}
