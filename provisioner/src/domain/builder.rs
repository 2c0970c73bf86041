//! Service spec construction.
//!
//! Pure: the next spec is a function of the app snapshot, the requested
//! transition and the spec currently stored in the backend. Counters
//! (`replicas`, `restart-count`, `stopped`, `asleep`) are read back from the
//! stored spec's labels before anything else, otherwise they would reset on
//! every call.

use std::time::Duration;

use convoy_common::{LabelSet, ObjectKind, ProcessState, ServiceLabels, keys};

use super::app::{AppInfo, ImageHealthcheck};
use super::config::EngineConfig;
use super::error::ProvisionError;
use super::net::app_network_name;
use super::spec::{HealthCheck, PlacementConstraint, RestartPolicy, ServiceMode, ServiceSpec};

const HEALTHCHECK_INTERVAL: Duration = Duration::from_secs(3);
const HEALTHCHECK_TIMEOUT: Duration = Duration::from_secs(60);

/// Inputs for one service spec.
#[derive(Debug, Clone)]
pub struct SpecRequest<'a> {
    pub app: &'a AppInfo,
    /// Empty for builds and isolated runs that are not tied to a process.
    pub process: &'a str,
    pub image: &'a str,
    pub kind: ObjectKind,
    pub state: ProcessState,
    pub command: Vec<String>,
    pub healthcheck: Option<&'a ImageHealthcheck>,
    /// Image a build produces.
    pub build_image: Option<&'a str>,
}

/// Deterministic object name for an app process.
///
/// Build and isolated-run objects carry a suffix so they never collide with
/// the long-running service of the same process.
#[must_use]
pub fn service_name(app: &str, process: &str, kind: ObjectKind) -> String {
    let base = if process.is_empty() {
        app.to_string()
    } else {
        format!("{app}-{process}")
    };
    match kind {
        ObjectKind::Service => base,
        ObjectKind::Build => format!("{base}-build"),
        ObjectKind::IsolatedRun => format!("{base}-isolated-run"),
    }
}

/// Counters recovered from a stored spec.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Counters {
    replicas: u64,
    restarts: u64,
    stopped: bool,
    asleep: bool,
}

impl Counters {
    fn read(previous: Option<&ServiceSpec>) -> Self {
        let Some(spec) = previous else {
            return Self::default();
        };
        let labels = &spec.labels;
        let mut replicas = labels.replicas();
        if replicas == 0 && spec.mode == ServiceMode::Replicated {
            replicas = spec.replicas;
        }
        Self {
            replicas,
            restarts: labels.restarts(),
            stopped: labels.is_stopped(),
            asleep: labels.is_asleep(),
        }
    }

    fn apply(mut self, state: ProcessState) -> Result<Self, ProvisionError> {
        let current = self.replicas;
        self.replicas = i128::from(current)
            .checked_add(i128::from(state.increment))
            .and_then(|n| u64::try_from(n).ok())
            .ok_or(ProvisionError::InvalidScale {
                current,
                increment: state.increment,
            })?;
        if state.start || state.restart {
            self.replicas = self.replicas.max(1);
            self.stopped = false;
            self.asleep = false;
        }
        if state.restart {
            self.restarts += 1;
        }
        if state.stop {
            self.stopped = true;
        }
        if state.sleep {
            self.asleep = true;
        }
        Ok(self)
    }

    /// Replica count the backend should run.
    fn effective(self) -> u64 {
        if self.stopped { 0 } else { self.replicas }
    }
}

/// Build the next spec for an app process object.
///
/// # Errors
///
/// Returns `InvalidScale` when the increment would take the replica count
/// below zero. Nothing is built in that case.
pub fn build_spec(
    req: &SpecRequest<'_>,
    previous: Option<&ServiceSpec>,
    config: &EngineConfig,
) -> Result<ServiceSpec, ProvisionError> {
    let app = req.app;
    let ephemeral = req.kind != ObjectKind::Service;

    let (replicas, labels) = if ephemeral {
        let labels = ServiceLabels {
            kind: req.kind,
            app: &app.name,
            process: req.process,
            platform: &app.platform,
            pool: &app.pool,
            provisioner: config.backend.name(),
            build_image: req.build_image,
            ..ServiceLabels::default()
        }
        .to_label_set();
        (1, labels)
    } else {
        let counters = Counters::read(previous).apply(req.state)?;
        let labels = ServiceLabels {
            kind: req.kind,
            app: &app.name,
            process: req.process,
            platform: &app.platform,
            pool: &app.pool,
            provisioner: config.backend.name(),
            build_image: None,
            replicas: counters.replicas,
            restarts: counters.restarts,
            stopped: counters.stopped,
            asleep: counters.asleep,
        }
        .to_label_set();
        (counters.effective(), labels)
    };

    let constraints = vec![PlacementConstraint::eq(keys::NODE_POOL, &app.pool)];

    Ok(ServiceSpec {
        name: service_name(&app.name, req.process, req.kind),
        image: req.image.to_string(),
        env: environment(req, config),
        command: req.command.clone(),
        working_dir: None,
        user: config.docker_user.clone(),
        tty: false,
        mode: ServiceMode::Replicated,
        replicas,
        restart_policy: if ephemeral {
            RestartPolicy::Never
        } else {
            RestartPolicy::Always
        },
        constraints,
        network: (!ephemeral).then(|| app_network_name(&app.name)),
        endpoint_port: (!ephemeral).then_some(config.web_port),
        health_check: if ephemeral {
            None
        } else {
            req.healthcheck.map(|hc| health_check(hc, config.web_port))
        },
        mounts: Vec::new(),
        labels,
    })
}

/// Runtime objects get the process name and port; builds get the API host
/// the deploy agent reports back to.
fn environment(
    req: &SpecRequest<'_>,
    config: &EngineConfig,
) -> std::collections::BTreeMap<String, String> {
    let mut env = req.app.envs.clone();
    match req.kind {
        ObjectKind::Build => {
            if let Some(host) = &config.api_host {
                env.insert("CONVOY_HOST".to_string(), host.clone());
            }
        }
        ObjectKind::Service | ObjectKind::IsolatedRun => {
            if !req.process.is_empty() {
                env.insert("CONVOY_PROCESSNAME".to_string(), req.process.to_string());
            }
            env.insert("PORT".to_string(), config.web_port.to_string());
        }
    }
    env
}

fn health_check(hc: &ImageHealthcheck, port: u16) -> HealthCheck {
    let path = hc.path.trim_start_matches('/');
    HealthCheck {
        test: vec![
            "CMD-SHELL".to_string(),
            format!(
                "curl -fsSL -o /dev/null -X{} -w '%{{http_code}}' http://localhost:{port}/{path} | grep -q '^{}$'",
                hc.method, hc.status
            ),
        ],
        interval: HEALTHCHECK_INTERVAL,
        timeout: HEALTHCHECK_TIMEOUT,
        retries: hc.allowed_failures.max(1),
    }
}

/// Labels selecting every long-running object of an app.
#[must_use]
pub fn app_selector(app: &str) -> LabelSet {
    [(keys::APP_NAME, app), (keys::IS_SERVICE, "true")]
        .into_iter()
        .collect()
}
