//! Backend-neutral service specs.
//!
//! Each backend adapter renders a [`ServiceSpec`] into its own object shape
//! (Swarm service, Kubernetes deployment or pod) and reads it back.

use std::collections::BTreeMap;
use std::time::Duration;

use convoy_common::LabelSet;
use serde::{Deserialize, Serialize};

/// What happens when an instance exits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RestartPolicy {
    /// Long-running processes are always restarted.
    #[default]
    Always,
    /// Ephemeral runs must surface failure instead of retrying.
    Never,
}

/// Replicated services carry a count; global services run once per node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceMode {
    #[default]
    Replicated,
    Global,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConstraintOp {
    Eq,
    Ne,
}

/// Pin instances to nodes whose metadata label matches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlacementConstraint {
    pub label: String,
    pub op: ConstraintOp,
    pub value: String,
}

impl PlacementConstraint {
    #[must_use]
    pub fn eq(label: &str, value: &str) -> Self {
        Self {
            label: label.to_string(),
            op: ConstraintOp::Eq,
            value: value.to_string(),
        }
    }

    #[must_use]
    pub fn ne(label: &str, value: &str) -> Self {
        Self {
            label: label.to_string(),
            op: ConstraintOp::Ne,
            value: value.to_string(),
        }
    }

    /// Swarm constraint expression, e.g. `node.labels.pool == blue`.
    #[must_use]
    pub fn to_swarm_expr(&self) -> String {
        let op = match self.op {
            ConstraintOp::Eq => "==",
            ConstraintOp::Ne => "!=",
        };
        format!("node.labels.{} {op} {}", self.label, self.value)
    }
}

/// Container health check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthCheck {
    /// Command run inside the instance; exit 0 means healthy.
    pub test: Vec<String>,
    pub interval: Duration,
    pub timeout: Duration,
    pub retries: u32,
}

/// Host path bound into the instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BindMount {
    pub source: String,
    pub target: String,
    pub read_only: bool,
}

impl BindMount {
    /// Parse `src:dst[:ro]` notation.
    #[must_use]
    pub fn parse(bind: &str) -> Option<Self> {
        let mut parts = bind.split(':');
        let source = parts.next().filter(|s| !s.is_empty())?;
        let target = parts.next().filter(|s| !s.is_empty())?;
        let read_only = parts.next() == Some("ro");
        Some(Self {
            source: source.to_string(),
            target: target.to_string(),
            read_only,
        })
    }
}

/// Desired state for one backend service object.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceSpec {
    pub name: String,
    pub image: String,
    pub env: BTreeMap<String, String>,
    /// Entrypoint plus arguments. Empty keeps the image default.
    pub command: Vec<String>,
    pub working_dir: Option<String>,
    pub user: Option<String>,
    pub tty: bool,
    pub mode: ServiceMode,
    /// Replica count sent to the backend. Ignored in global mode.
    pub replicas: u64,
    pub restart_policy: RestartPolicy,
    pub constraints: Vec<PlacementConstraint>,
    pub network: Option<String>,
    /// Port published through the cluster's ingress, targeting this
    /// container port.
    pub endpoint_port: Option<u16>,
    pub health_check: Option<HealthCheck>,
    pub mounts: Vec<BindMount>,
    pub labels: LabelSet,
}

impl ServiceSpec {
    /// Environment as `KEY=value` strings, in key order.
    #[must_use]
    pub fn env_list(&self) -> Vec<String> {
        self.env.iter().map(|(k, v)| format!("{k}={v}")).collect()
    }

    /// Parse `KEY=value` strings back into a map. Entries without `=` are
    /// kept with an empty value.
    #[must_use]
    pub fn env_from_list<S: AsRef<str>>(list: &[S]) -> BTreeMap<String, String> {
        list.iter()
            .map(|entry| {
                let entry = entry.as_ref();
                match entry.split_once('=') {
                    Some((k, v)) => (k.to_string(), v.to_string()),
                    None => (entry.to_string(), String::new()),
                }
            })
            .collect()
    }
}

/// A service object as stored by the backend: spec, id and version token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceObject {
    pub id: String,
    pub version: VersionToken,
    pub spec: ServiceSpec,
    /// Port published on every node for the endpoint, once assigned.
    pub published_port: Option<u16>,
}

/// Optimistic-concurrency marker returned by the backend. Opaque to the
/// engine: Swarm uses a numeric index, Kubernetes a resource version.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct VersionToken(pub String);

impl VersionToken {
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<u64> for VersionToken {
    fn from(index: u64) -> Self {
        Self(index.to_string())
    }
}

impl From<String> for VersionToken {
    fn from(s: String) -> Self {
        Self(s)
    }
}
