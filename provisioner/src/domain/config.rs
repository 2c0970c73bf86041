//! Engine configuration.
//!
//! One explicit struct, built once and handed to every component. Loaded
//! from `CONVOY_*` environment variables with `envy`.

use std::time::Duration;

use anyhow::{Context, Result, ensure};
use serde::Deserialize;

/// Environment variable prefix for every setting.
pub const ENV_PREFIX: &str = "CONVOY_";

/// Which cluster API the engine talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    Swarm,
    Kubernetes,
}

impl BackendKind {
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            BackendKind::Swarm => "swarm",
            BackendKind::Kubernetes => "kubernetes",
        }
    }
}

fn default_swarm_port() -> u16 {
    2377
}
fn default_max_managers() -> usize {
    7
}
fn default_dial_timeout_secs() -> u64 {
    5
}
fn default_full_timeout_secs() -> u64 {
    15 * 60
}
fn default_task_wait_timeout_secs() -> u64 {
    5 * 60
}
fn default_task_poll_interval_ms() -> u64 {
    100
}
fn default_attach_inspect_interval_secs() -> u64 {
    20
}
fn default_node_ready_timeout_secs() -> u64 {
    120
}
fn default_pod_ready_timeout_secs() -> u64 {
    60
}
fn default_namespace() -> String {
    "default".to_string()
}
fn default_web_port() -> u16 {
    8888
}

/// Engine settings. Every field has a default.
#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub backend: BackendKind,
    #[serde(default = "default_swarm_port")]
    pub swarm_port: u16,
    /// Upper bound on manager-role nodes.
    #[serde(default = "default_max_managers")]
    pub max_managers: usize,
    #[serde(default = "default_dial_timeout_secs")]
    pub dial_timeout_secs: u64,
    #[serde(default = "default_full_timeout_secs")]
    pub full_timeout_secs: u64,
    #[serde(default = "default_task_wait_timeout_secs")]
    pub task_wait_timeout_secs: u64,
    #[serde(default = "default_task_poll_interval_ms")]
    pub task_poll_interval_ms: u64,
    #[serde(default = "default_attach_inspect_interval_secs")]
    pub attach_inspect_interval_secs: u64,
    #[serde(default = "default_node_ready_timeout_secs")]
    pub node_ready_timeout_secs: u64,
    #[serde(default = "default_pod_ready_timeout_secs")]
    pub pod_ready_timeout_secs: u64,
    /// Kubernetes namespace for app objects.
    #[serde(default = "default_namespace")]
    pub namespace: String,
    /// Control-plane API host handed to units and build hooks.
    #[serde(default)]
    pub api_host: Option<String>,
    /// User app containers run as.
    #[serde(default)]
    pub docker_user: Option<String>,
    /// Registry built images are pushed to. No push when unset.
    #[serde(default)]
    pub registry: Option<String>,
    #[serde(default)]
    pub registry_username: Option<String>,
    #[serde(default)]
    pub registry_password: Option<String>,
    #[serde(default)]
    pub registry_email: Option<String>,
    /// Port the web process listens on inside its instance.
    #[serde(default = "default_web_port")]
    pub web_port: u16,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::default(),
            swarm_port: default_swarm_port(),
            max_managers: default_max_managers(),
            dial_timeout_secs: default_dial_timeout_secs(),
            full_timeout_secs: default_full_timeout_secs(),
            task_wait_timeout_secs: default_task_wait_timeout_secs(),
            task_poll_interval_ms: default_task_poll_interval_ms(),
            attach_inspect_interval_secs: default_attach_inspect_interval_secs(),
            node_ready_timeout_secs: default_node_ready_timeout_secs(),
            pod_ready_timeout_secs: default_pod_ready_timeout_secs(),
            namespace: default_namespace(),
            api_host: None,
            docker_user: None,
            registry: None,
            registry_username: None,
            registry_password: None,
            registry_email: None,
            web_port: default_web_port(),
        }
    }
}

/// Registry push target and credentials.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryAuth {
    pub address: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub email: Option<String>,
}

/// Timeout and sampling interval for one polling loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollSettings {
    pub timeout: Duration,
    pub interval: Duration,
}

impl EngineConfig {
    /// Load from the process environment.
    ///
    /// # Errors
    ///
    /// Returns an error if a variable fails to parse or the result is invalid.
    pub fn from_env() -> Result<Self> {
        let config: Self = envy::prefixed(ENV_PREFIX)
            .from_env()
            .context("failed to load CONVOY_* configuration")?;
        config.validate()?;
        Ok(config)
    }

    /// Load from explicit `(KEY, value)` pairs, keys carrying the prefix.
    ///
    /// # Errors
    ///
    /// Returns an error if a value fails to parse or the result is invalid.
    pub fn from_vars<I>(vars: I) -> Result<Self>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let config: Self = envy::prefixed(ENV_PREFIX)
            .from_iter(vars)
            .context("failed to load CONVOY_* configuration")?;
        config.validate()?;
        Ok(config)
    }

    /// # Errors
    ///
    /// Returns an error for a zero manager cap or a zero poll interval.
    pub fn validate(&self) -> Result<()> {
        ensure!(self.max_managers > 0, "max_managers must be at least 1");
        ensure!(
            self.task_poll_interval_ms > 0,
            "task_poll_interval_ms must be positive"
        );
        ensure!(
            self.attach_inspect_interval_secs > 0,
            "attach_inspect_interval_secs must be positive"
        );
        Ok(())
    }

    #[must_use]
    pub fn dial_timeout(&self) -> Duration {
        Duration::from_secs(self.dial_timeout_secs)
    }

    #[must_use]
    pub fn full_timeout(&self) -> Duration {
        Duration::from_secs(self.full_timeout_secs)
    }

    /// Polling for ephemeral tasks to reach their wanted state.
    #[must_use]
    pub fn task_wait(&self) -> PollSettings {
        PollSettings {
            timeout: Duration::from_secs(self.task_wait_timeout_secs),
            interval: Duration::from_millis(self.task_poll_interval_ms),
        }
    }

    #[must_use]
    pub fn attach_inspect_interval(&self) -> Duration {
        Duration::from_secs(self.attach_inspect_interval_secs)
    }

    /// Polling for a freshly added node to answer.
    #[must_use]
    pub fn node_ready(&self) -> PollSettings {
        PollSettings {
            timeout: Duration::from_secs(self.node_ready_timeout_secs),
            interval: Duration::from_secs(1),
        }
    }

    #[must_use]
    pub fn pod_ready(&self) -> PollSettings {
        PollSettings {
            timeout: Duration::from_secs(self.pod_ready_timeout_secs),
            interval: Duration::from_millis(self.task_poll_interval_ms),
        }
    }

    /// `None` when no registry is configured.
    #[must_use]
    pub fn registry_auth(&self) -> Option<RegistryAuth> {
        let address = self.registry.as_ref().filter(|r| !r.is_empty())?;
        Some(RegistryAuth {
            address: address.clone(),
            username: self.registry_username.clone(),
            password: self.registry_password.clone(),
            email: self.registry_email.clone(),
        })
    }
}
