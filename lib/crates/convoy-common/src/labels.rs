use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Label keys stamped on backend objects by convoy.
pub mod keys {
    /// Prefix shared by every platform-owned label.
    pub const PREFIX: &str = "convoy.";

    /// Marks an object as managed by convoy.
    /// Value: "true"
    pub const IS_CONVOY: &str = "convoy.is-convoy";

    /// Long-running application process service.
    pub const IS_SERVICE: &str = "convoy.is-service";

    /// Ephemeral image build service.
    pub const IS_BUILD: &str = "convoy.is-build";

    /// Ephemeral isolated command run.
    pub const IS_ISOLATED_RUN: &str = "convoy.is-isolated-run";

    /// Platform-wide sidecar (node container).
    pub const IS_NODE_CONTAINER: &str = "convoy.is-node-container";

    /// Sidecar name, without the pool suffix.
    pub const NODE_CONTAINER_NAME: &str = "convoy.node-container-name";

    /// Pool a sidecar object is scoped to; empty for every pool.
    pub const NODE_CONTAINER_POOL: &str = "convoy.node-container-pool";

    pub const APP_NAME: &str = "convoy.app-name";
    pub const PROCESS: &str = "convoy.process";
    pub const PLATFORM: &str = "convoy.app-platform";
    pub const POOL: &str = "convoy.app-pool";
    pub const PROVISIONER: &str = "convoy.provisioner";

    /// Recorded scale intent. Survives stop and sleep.
    /// Value: decimal replica count
    pub const REPLICAS: &str = "convoy.replicas";

    /// Bumped on every restart so the backend sees a changed spec.
    /// Value: decimal counter
    pub const RESTART_COUNT: &str = "convoy.restart-count";

    pub const STOPPED: &str = "convoy.stopped";
    pub const ASLEEP: &str = "convoy.asleep";

    /// Image a build service is producing.
    pub const BUILD_IMAGE: &str = "convoy.build-image";

    /// Name of the service object an instance belongs to.
    pub const SERVICE_NAME: &str = "convoy.service";

    /// Address the platform registered a node under.
    pub const NODE_ADDR: &str = "convoy.node-addr";

    /// Node metadata key used for pool placement. Unprefixed: it is
    /// user-supplied node metadata, not a platform counter.
    pub const NODE_POOL: &str = "pool";
}

/// Which kind of object a label set describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ObjectKind {
    #[default]
    Service,
    Build,
    IsolatedRun,
}

/// String labels embedded in a backend object.
///
/// Backends have no structured field for replica intent, restart counters
/// or lifecycle flags, so those travel here. Absent or unparsable counters
/// read as zero and absent flags read as `false`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LabelSet(BTreeMap<String, String>);

impl LabelSet {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn from_map(map: BTreeMap<String, String>) -> Self {
        Self(map)
    }

    #[must_use]
    pub fn as_map(&self) -> &BTreeMap<String, String> {
        &self.0
    }

    #[must_use]
    pub fn into_map(self) -> BTreeMap<String, String> {
        self.0
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.0.remove(key)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Merge `other` into `self`, `other` winning on key collisions.
    pub fn merge(&mut self, other: &LabelSet) {
        for (k, v) in other.iter() {
            self.set(k, v);
        }
    }

    /// Render as a `k=v,k=v` selector, in key order.
    #[must_use]
    pub fn selector(&self) -> String {
        self.iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(",")
    }

    fn flag(&self, key: &str) -> bool {
        self.get(key) == Some("true")
    }

    fn counter(&self, key: &str) -> u64 {
        self.get(key).and_then(|v| v.parse().ok()).unwrap_or(0)
    }

    fn set_flag(&mut self, key: &str, value: bool) {
        self.set(key, value.to_string());
    }

    // ── Counters ──────────────────────────────────────────────────────────────

    #[must_use]
    pub fn replicas(&self) -> u64 {
        self.counter(keys::REPLICAS)
    }

    pub fn set_replicas(&mut self, replicas: u64) {
        self.set(keys::REPLICAS, replicas.to_string());
    }

    #[must_use]
    pub fn restarts(&self) -> u64 {
        self.counter(keys::RESTART_COUNT)
    }

    pub fn set_restarts(&mut self, restarts: u64) {
        self.set(keys::RESTART_COUNT, restarts.to_string());
    }

    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.flag(keys::STOPPED)
    }

    pub fn set_stopped(&mut self, stopped: bool) {
        self.set_flag(keys::STOPPED, stopped);
    }

    #[must_use]
    pub fn is_asleep(&self) -> bool {
        self.flag(keys::ASLEEP)
    }

    pub fn set_asleep(&mut self, asleep: bool) {
        self.set_flag(keys::ASLEEP, asleep);
    }

    // ── Identity ──────────────────────────────────────────────────────────────

    #[must_use]
    pub fn app_name(&self) -> Option<&str> {
        self.get(keys::APP_NAME)
    }

    #[must_use]
    pub fn process(&self) -> Option<&str> {
        self.get(keys::PROCESS)
    }

    #[must_use]
    pub fn platform(&self) -> Option<&str> {
        self.get(keys::PLATFORM)
    }

    #[must_use]
    pub fn build_image(&self) -> Option<&str> {
        self.get(keys::BUILD_IMAGE)
    }

    #[must_use]
    pub fn is_service(&self) -> bool {
        self.flag(keys::IS_SERVICE)
    }

    #[must_use]
    pub fn is_build(&self) -> bool {
        self.flag(keys::IS_BUILD)
    }

    #[must_use]
    pub fn is_isolated_run(&self) -> bool {
        self.flag(keys::IS_ISOLATED_RUN)
    }

    #[must_use]
    pub fn is_node_container(&self) -> bool {
        self.flag(keys::IS_NODE_CONTAINER)
    }

    #[must_use]
    pub fn node_addr(&self) -> Option<&str> {
        self.get(keys::NODE_ADDR)
    }

    #[must_use]
    pub fn pool(&self) -> Option<&str> {
        self.get(keys::NODE_POOL)
    }
}

impl From<BTreeMap<String, String>> for LabelSet {
    fn from(map: BTreeMap<String, String>) -> Self {
        Self(map)
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for LabelSet {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

/// Inputs for the labels of one application process object.
#[derive(Debug, Clone, Default)]
pub struct ServiceLabels<'a> {
    pub kind: ObjectKind,
    pub app: &'a str,
    pub process: &'a str,
    pub platform: &'a str,
    pub pool: &'a str,
    pub provisioner: &'a str,
    pub build_image: Option<&'a str>,
    pub replicas: u64,
    pub restarts: u64,
    pub stopped: bool,
    pub asleep: bool,
}

impl ServiceLabels<'_> {
    #[must_use]
    pub fn to_label_set(&self) -> LabelSet {
        let mut labels = LabelSet::new();
        labels.set_flag(keys::IS_CONVOY, true);
        labels.set_flag(keys::IS_SERVICE, self.kind == ObjectKind::Service);
        labels.set_flag(keys::IS_BUILD, self.kind == ObjectKind::Build);
        labels.set_flag(keys::IS_ISOLATED_RUN, self.kind == ObjectKind::IsolatedRun);
        labels.set(keys::APP_NAME, self.app);
        labels.set(keys::PROCESS, self.process);
        labels.set(keys::PLATFORM, self.platform);
        labels.set(keys::POOL, self.pool);
        labels.set(keys::PROVISIONER, self.provisioner);
        if let Some(image) = self.build_image {
            labels.set(keys::BUILD_IMAGE, image);
        }
        if self.kind == ObjectKind::Service {
            labels.set_replicas(self.replicas);
            labels.set_restarts(self.restarts);
            labels.set_stopped(self.stopped);
            labels.set_asleep(self.asleep);
        }
        labels
    }
}
