//! Domain specs and observations to and from Engine API models.

use std::collections::HashMap;
use std::time::Duration;

use bollard::models::{
    EndpointPortConfig, EndpointPortConfigProtocolEnum, EndpointPortConfigPublishModeEnum,
    EndpointSpec, HealthConfig, Mount, MountTypeEnum, NetworkAttachmentConfig, Node as DockerNode,
    NodeSpec as DockerNodeSpec, NodeSpecAvailabilityEnum, NodeSpecRoleEnum, Service,
    ServiceSpec as DockerServiceSpec, ServiceSpecMode, ServiceSpecModeReplicated,
    Task as DockerTask, TaskSpec, TaskSpecContainerSpec, TaskSpecPlacement, TaskSpecRestartPolicy,
    TaskSpecRestartPolicyConditionEnum,
};
use convoy_common::{Availability, LabelSet, NodeRole};

use crate::domain::{
    BindMount, ConstraintOp, HealthCheck, NativeState, Node, NodeSpec, PlacementConstraint,
    RestartPolicy, ServiceMode, ServiceObject, ServiceSpec, SwarmTaskState, Task, VersionToken,
};

fn label_map(labels: &LabelSet) -> HashMap<String, String> {
    labels
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

fn nanos(d: Duration) -> i64 {
    i64::try_from(d.as_nanos()).unwrap_or(i64::MAX)
}

fn from_nanos(n: Option<i64>) -> Duration {
    Duration::from_nanos(n.and_then(|n| u64::try_from(n).ok()).unwrap_or(0))
}

pub(crate) fn to_docker_spec(spec: &ServiceSpec) -> DockerServiceSpec {
    let labels = label_map(&spec.labels);
    let (command, args) = match spec.command.split_first() {
        Some((entry, rest)) => (Some(vec![entry.clone()]), Some(rest.to_vec())),
        None => (None, None),
    };
    let container_spec = TaskSpecContainerSpec {
        image: Some(spec.image.clone()),
        labels: Some(labels.clone()),
        command,
        args,
        env: Some(spec.env_list()),
        dir: spec.working_dir.clone(),
        user: spec.user.clone(),
        tty: Some(spec.tty),
        open_stdin: Some(spec.tty || spec.restart_policy == RestartPolicy::Never),
        health_check: spec.health_check.as_ref().map(|hc| HealthConfig {
            test: Some(hc.test.clone()),
            interval: Some(nanos(hc.interval)),
            timeout: Some(nanos(hc.timeout)),
            retries: Some(i64::from(hc.retries)),
            ..Default::default()
        }),
        mounts: (!spec.mounts.is_empty()).then(|| {
            spec.mounts
                .iter()
                .map(|m| Mount {
                    typ: Some(MountTypeEnum::BIND),
                    source: Some(m.source.clone()),
                    target: Some(m.target.clone()),
                    read_only: Some(m.read_only),
                    ..Default::default()
                })
                .collect()
        }),
        ..Default::default()
    };
    let condition = match spec.restart_policy {
        RestartPolicy::Always => TaskSpecRestartPolicyConditionEnum::ANY,
        RestartPolicy::Never => TaskSpecRestartPolicyConditionEnum::NONE,
    };
    let task_template = TaskSpec {
        container_spec: Some(container_spec),
        restart_policy: Some(TaskSpecRestartPolicy {
            condition: Some(condition),
            ..Default::default()
        }),
        placement: Some(TaskSpecPlacement {
            constraints: Some(spec.constraints.iter().map(PlacementConstraint::to_swarm_expr).collect()),
            ..Default::default()
        }),
        networks: spec.network.as_ref().map(|n| {
            vec![NetworkAttachmentConfig {
                target: Some(n.clone()),
                ..Default::default()
            }]
        }),
        ..Default::default()
    };
    let mode = match spec.mode {
        ServiceMode::Replicated => ServiceSpecMode {
            replicated: Some(ServiceSpecModeReplicated {
                replicas: Some(i64::try_from(spec.replicas).unwrap_or(i64::MAX)),
            }),
            ..Default::default()
        },
        ServiceMode::Global => ServiceSpecMode {
            global: Some(HashMap::new()),
            ..Default::default()
        },
    };
    let endpoint_spec = spec.endpoint_port.map(|port| EndpointSpec {
        ports: Some(vec![EndpointPortConfig {
            protocol: Some(EndpointPortConfigProtocolEnum::TCP),
            target_port: Some(i64::from(port)),
            publish_mode: Some(EndpointPortConfigPublishModeEnum::INGRESS),
            ..Default::default()
        }]),
        ..Default::default()
    });
    DockerServiceSpec {
        name: Some(spec.name.clone()),
        labels: Some(labels),
        task_template: Some(task_template),
        mode: Some(mode),
        endpoint_spec,
        ..Default::default()
    }
}

fn parse_constraint(expr: &str) -> Option<PlacementConstraint> {
    let (lhs, op, rhs) = if let Some((l, r)) = expr.split_once("==") {
        (l, ConstraintOp::Eq, r)
    } else if let Some((l, r)) = expr.split_once("!=") {
        (l, ConstraintOp::Ne, r)
    } else {
        return None;
    };
    let label = lhs.trim().strip_prefix("node.labels.")?;
    Some(PlacementConstraint {
        label: label.to_string(),
        op,
        value: rhs.trim().to_string(),
    })
}

pub(crate) fn from_docker_spec(spec: DockerServiceSpec) -> ServiceSpec {
    let template = spec.task_template.unwrap_or_default();
    let container = template.container_spec.unwrap_or_default();
    let mut command = container.command.unwrap_or_default();
    command.extend(container.args.unwrap_or_default());
    let (mode, replicas) = match spec.mode {
        Some(ServiceSpecMode {
            global: Some(_), ..
        }) => (ServiceMode::Global, 0),
        Some(ServiceSpecMode {
            replicated: Some(r),
            ..
        }) => (
            ServiceMode::Replicated,
            r.replicas.and_then(|n| u64::try_from(n).ok()).unwrap_or(0),
        ),
        _ => (ServiceMode::Replicated, 0),
    };
    let restart_policy = match template.restart_policy.and_then(|p| p.condition) {
        Some(TaskSpecRestartPolicyConditionEnum::NONE) => RestartPolicy::Never,
        _ => RestartPolicy::Always,
    };
    ServiceSpec {
        name: spec.name.unwrap_or_default(),
        image: container.image.unwrap_or_default(),
        env: ServiceSpec::env_from_list(&container.env.unwrap_or_default()),
        command,
        working_dir: container.dir,
        user: container.user,
        tty: container.tty.unwrap_or(false),
        mode,
        replicas,
        restart_policy,
        constraints: template
            .placement
            .and_then(|p| p.constraints)
            .unwrap_or_default()
            .iter()
            .filter_map(|c| parse_constraint(c))
            .collect(),
        network: template
            .networks
            .and_then(|n| n.into_iter().find_map(|a| a.target)),
        endpoint_port: spec
            .endpoint_spec
            .and_then(|e| e.ports)
            .and_then(|ports| ports.into_iter().find_map(|p| p.target_port))
            .and_then(|p| u16::try_from(p).ok()),
        health_check: container.health_check.map(|hc| HealthCheck {
            test: hc.test.unwrap_or_default(),
            interval: from_nanos(hc.interval),
            timeout: from_nanos(hc.timeout),
            retries: hc.retries.and_then(|r| u32::try_from(r).ok()).unwrap_or(0),
        }),
        mounts: container
            .mounts
            .unwrap_or_default()
            .into_iter()
            .filter_map(|m| {
                Some(BindMount {
                    source: m.source?,
                    target: m.target?,
                    read_only: m.read_only.unwrap_or(false),
                })
            })
            .collect(),
        labels: spec.labels.unwrap_or_default().into_iter().collect(),
    }
}

pub(crate) fn from_docker_service(service: Service) -> ServiceObject {
    let published_port = service
        .endpoint
        .and_then(|e| e.ports)
        .and_then(|ports| ports.into_iter().find_map(|p| p.published_port))
        .and_then(|p| u16::try_from(p).ok());
    ServiceObject {
        id: service.id.unwrap_or_default(),
        version: service
            .version
            .and_then(|v| v.index)
            .map(VersionToken::from)
            .unwrap_or_default(),
        spec: service.spec.map(from_docker_spec).unwrap_or_default(),
        published_port,
    }
}

fn swarm_state(name: Option<String>) -> NativeState {
    NativeState::Swarm(
        name.as_deref()
            .and_then(SwarmTaskState::from_name)
            .unwrap_or(SwarmTaskState::New),
    )
}

pub(crate) fn from_docker_task(task: DockerTask) -> Task {
    let status = task.status.unwrap_or_default();
    let container = status.container_status.unwrap_or_default();
    let labels = task
        .spec
        .and_then(|s| s.container_spec)
        .and_then(|c| c.labels)
        .or(task.labels)
        .unwrap_or_default();
    Task {
        id: task.id.unwrap_or_default(),
        service_id: task.service_id.unwrap_or_default(),
        node_id: task.node_id.unwrap_or_default(),
        container_id: container.container_id.unwrap_or_default(),
        state: swarm_state(status.state.map(|s| s.to_string())),
        desired_state: swarm_state(task.desired_state.map(|s| s.to_string())),
        message: status.message.unwrap_or_default(),
        error: status.err.unwrap_or_default(),
        exit_code: container.exit_code,
        labels: labels.into_iter().collect(),
    }
}

pub(crate) fn from_docker_node(node: DockerNode) -> Node {
    let spec = node.spec.unwrap_or_default();
    let labels: LabelSet = spec.labels.unwrap_or_default().into_iter().collect();
    let role = match spec.role {
        Some(NodeSpecRoleEnum::MANAGER) => Some(NodeRole::Manager),
        Some(NodeSpecRoleEnum::WORKER) => Some(NodeRole::Worker),
        _ => None,
    };
    let availability = match spec.availability {
        Some(NodeSpecAvailabilityEnum::PAUSE) => Availability::Pause,
        Some(NodeSpecAvailabilityEnum::DRAIN) => Availability::Drain,
        _ => Availability::Active,
    };
    Node {
        id: node.id.unwrap_or_default(),
        version: node
            .version
            .and_then(|v| v.index)
            .map(VersionToken::from)
            .unwrap_or_default(),
        address: labels.node_addr().map(str::to_string),
        spec: NodeSpec {
            role,
            availability,
            labels,
        },
        status: node
            .status
            .and_then(|s| s.state)
            .map(|s| s.to_string())
            .unwrap_or_else(|| "unknown".to_string()),
    }
}

pub(crate) fn to_docker_node_spec(spec: &NodeSpec) -> DockerNodeSpec {
    DockerNodeSpec {
        labels: Some(label_map(&spec.labels)),
        role: spec.role.map(|r| match r {
            NodeRole::Manager => NodeSpecRoleEnum::MANAGER,
            NodeRole::Worker => NodeSpecRoleEnum::WORKER,
        }),
        availability: Some(match spec.availability {
            Availability::Active => NodeSpecAvailabilityEnum::ACTIVE,
            Availability::Pause => NodeSpecAvailabilityEnum::PAUSE,
            Availability::Drain => NodeSpecAvailabilityEnum::DRAIN,
        }),
        ..Default::default()
    }
}
