//! Kubernetes object manifests rendered from, and read back into, domain
//! types.
//!
//! A replicated spec becomes a Deployment, a global spec a DaemonSet and a
//! never-restarting spec a bare Pod. The full spec is stored as an
//! annotation so it reads back losslessly.
//!
//! Image work has no API server counterpart. It runs in pods that drive the
//! node's Docker daemon through its socket: a committer sidecar next to each
//! build, and one-off tag pods.

use std::collections::BTreeMap;

use convoy_common::{Availability, LabelSet, keys};
use serde_json::{Value, json};

use crate::domain::{
    ConstraintOp, NativeState, Node, NodeSpec, PodPhase, RegistryAuth, RestartPolicy, ServiceMode,
    ServiceSpec, Task, TaskFilter, VersionToken,
};

pub(crate) const SPEC_ANNOTATION: &str = "convoy.spec";
pub(crate) const CONTAINER_NAME: &str = "main";
pub(crate) const COMMITTER_NAME: &str = "committer";
const DOCKER_CLI_IMAGE: &str = "docker:cli";
const DOCKER_SOCKET: &str = "/var/run/docker.sock";

const LOGIN_SCRIPT: &str = r#"if [ -n "$REGISTRY_USER" ]; then
  printf '%s' "$REGISTRY_PASSWORD" | docker login -u "$REGISTRY_USER" --password-stdin "$REGISTRY"
fi
"#;

const PUSH_SCRIPT: &str = r#"if [ -n "$REGISTRY" ]; then docker push "$IMAGE"; fi
"#;

/// Waits for the build container of its own pod to exit, then commits it
/// unless the build failed.
const COMMIT_SCRIPT: &str = r#"while :; do
  id=$(docker ps -aq --filter status=exited \
    --filter "label=io.kubernetes.pod.namespace=$POD_NAMESPACE" \
    --filter "label=io.kubernetes.pod.name=$POD_NAME" \
    --filter "label=io.kubernetes.container.name=main" | head -n 1)
  [ -n "$id" ] && break
  sleep 1
done
[ "$(docker inspect -f '{{.State.ExitCode}}' "$id")" = 0 ] || exit 0
docker commit "$id" "$IMAGE"
"#;

const TAG_SCRIPT: &str = r#"docker image inspect "$SOURCE" >/dev/null 2>&1 || docker pull "$SOURCE"
docker tag "$SOURCE" "$IMAGE"
"#;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WorkloadKind {
    Deployment,
    DaemonSet,
    Pod,
}

impl WorkloadKind {
    pub(crate) const ALL: [WorkloadKind; 3] = [Self::Deployment, Self::DaemonSet, Self::Pod];

    pub(crate) fn for_spec(spec: &ServiceSpec) -> Self {
        match (spec.mode, spec.restart_policy) {
            (_, RestartPolicy::Never) => Self::Pod,
            (ServiceMode::Global, RestartPolicy::Always) => Self::DaemonSet,
            (ServiceMode::Replicated, RestartPolicy::Always) => Self::Deployment,
        }
    }

    pub(crate) fn collection_path(self, namespace: &str) -> String {
        match self {
            Self::Deployment => format!("/apis/apps/v1/namespaces/{namespace}/deployments"),
            Self::DaemonSet => format!("/apis/apps/v1/namespaces/{namespace}/daemonsets"),
            Self::Pod => format!("/api/v1/namespaces/{namespace}/pods"),
        }
    }

    pub(crate) fn item_path(self, namespace: &str, name: &str) -> String {
        format!("{}/{name}", self.collection_path(namespace))
    }
}

fn object_labels(spec: &ServiceSpec) -> BTreeMap<String, String> {
    let mut labels: BTreeMap<String, String> = spec
        .labels
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    labels.insert(keys::SERVICE_NAME.to_string(), spec.name.clone());
    labels
}

fn affinity(spec: &ServiceSpec) -> Option<Value> {
    let excluded: Vec<Value> = spec
        .constraints
        .iter()
        .filter(|c| c.op == ConstraintOp::Ne)
        .map(|c| json!({"key": c.label, "operator": "NotIn", "values": [c.value]}))
        .collect();
    (!excluded.is_empty()).then(|| {
        json!({
            "nodeAffinity": {
                "requiredDuringSchedulingIgnoredDuringExecution": {
                    "nodeSelectorTerms": [{"matchExpressions": excluded}]
                }
            }
        })
    })
}

fn container(spec: &ServiceSpec) -> Value {
    let mut c = json!({
        "name": CONTAINER_NAME,
        "image": spec.image,
        "env": spec.env.iter().map(|(k, v)| json!({"name": k, "value": v})).collect::<Vec<_>>(),
        "tty": spec.tty,
        "stdin": spec.restart_policy == RestartPolicy::Never,
        "stdinOnce": spec.restart_policy == RestartPolicy::Never,
    });
    if !spec.command.is_empty() {
        c["command"] = json!(spec.command);
    }
    if let Some(dir) = &spec.working_dir {
        c["workingDir"] = json!(dir);
    }
    if let Some(uid) = spec.user.as_deref().and_then(|u| u.parse::<i64>().ok()) {
        c["securityContext"] = json!({"runAsUser": uid});
    }
    if let Some(port) = spec.endpoint_port {
        c["ports"] = json!([{"containerPort": port}]);
    }
    if let Some(hc) = &spec.health_check {
        let command: Vec<&str> = match hc.test.first().map(String::as_str) {
            Some("CMD-SHELL") => {
                let mut cmd = vec!["/bin/sh", "-c"];
                cmd.extend(hc.test.iter().skip(1).map(String::as_str));
                cmd
            }
            Some("CMD") => hc.test.iter().skip(1).map(String::as_str).collect(),
            _ => hc.test.iter().map(String::as_str).collect(),
        };
        c["readinessProbe"] = json!({
            "exec": {"command": command},
            "periodSeconds": hc.interval.as_secs().max(1),
            "timeoutSeconds": hc.timeout.as_secs().max(1),
            "failureThreshold": hc.retries.max(1),
        });
    }
    if !spec.mounts.is_empty() {
        c["volumeMounts"] = json!(
            spec.mounts
                .iter()
                .enumerate()
                .map(|(i, m)| json!({
                    "name": format!("bind-{i}"),
                    "mountPath": m.target,
                    "readOnly": m.read_only,
                }))
                .collect::<Vec<_>>()
        );
    }
    c
}

fn pod_spec(spec: &ServiceSpec) -> Value {
    let node_selector: BTreeMap<&str, &str> = spec
        .constraints
        .iter()
        .filter(|c| c.op == ConstraintOp::Eq)
        .map(|c| (c.label.as_str(), c.value.as_str()))
        .collect();
    let mut pod = json!({
        "restartPolicy": match spec.restart_policy {
            RestartPolicy::Always => "Always",
            RestartPolicy::Never => "Never",
        },
        "containers": [container(spec)],
    });
    if !node_selector.is_empty() {
        pod["nodeSelector"] = json!(node_selector);
    }
    if let Some(affinity) = affinity(spec) {
        pod["affinity"] = affinity;
    }
    if !spec.mounts.is_empty() {
        pod["volumes"] = json!(
            spec.mounts
                .iter()
                .enumerate()
                .map(|(i, m)| json!({"name": format!("bind-{i}"), "hostPath": {"path": m.source}}))
                .collect::<Vec<_>>()
        );
    }
    pod
}

/// Workload object for `spec`; `resource_version` guards replacements.
///
/// # Errors
///
/// Returns an error if the spec cannot be serialized into the annotation.
pub(crate) fn workload(
    spec: &ServiceSpec,
    resource_version: Option<&str>,
) -> Result<Value, serde_json::Error> {
    let labels = object_labels(spec);
    let mut metadata = json!({
        "name": spec.name,
        "labels": labels,
        "annotations": {SPEC_ANNOTATION: serde_json::to_string(spec)?},
    });
    if let Some(rv) = resource_version {
        metadata["resourceVersion"] = json!(rv);
    }
    let selector = json!({"matchLabels": {keys::SERVICE_NAME: spec.name}});
    let template = json!({"metadata": {"labels": labels}, "spec": pod_spec(spec)});
    Ok(match WorkloadKind::for_spec(spec) {
        WorkloadKind::Deployment => json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": metadata,
            "spec": {"replicas": spec.replicas, "selector": selector, "template": template},
        }),
        WorkloadKind::DaemonSet => json!({
            "apiVersion": "apps/v1",
            "kind": "DaemonSet",
            "metadata": metadata,
            "spec": {"selector": selector, "template": template},
        }),
        WorkloadKind::Pod => json!({
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": metadata,
            "spec": pod_spec(spec),
        }),
    })
}

/// NodePort service publishing `port` of the workload's pods on every node.
pub(crate) fn node_port_service(spec: &ServiceSpec, port: u16) -> Value {
    json!({
        "apiVersion": "v1",
        "kind": "Service",
        "metadata": {"name": spec.name, "labels": object_labels(spec)},
        "spec": {
            "type": "NodePort",
            "selector": {keys::SERVICE_NAME: spec.name},
            "ports": [{"port": port, "targetPort": port, "protocol": "TCP"}],
        },
    })
}

pub(crate) fn resource_version(obj: &Value) -> VersionToken {
    VersionToken::from(
        obj["metadata"]["resourceVersion"]
            .as_str()
            .unwrap_or_default()
            .to_string(),
    )
}

/// Spec stored on a workload, `None` for objects this engine did not create.
pub(crate) fn stored_spec(obj: &Value) -> Option<ServiceSpec> {
    let raw = obj["metadata"]["annotations"][SPEC_ANNOTATION].as_str()?;
    serde_json::from_str(raw).ok()
}

pub(crate) fn node_port(service: &Value) -> Option<u16> {
    service["spec"]["ports"]
        .as_array()?
        .iter()
        .find_map(|p| p["nodePort"].as_u64())
        .and_then(|p| u16::try_from(p).ok())
}

fn labels_of(obj: &Value) -> LabelSet {
    obj["metadata"]["labels"]
        .as_object()
        .map(|m| {
            m.iter()
                .filter_map(|(k, v)| Some((k.clone(), v.as_str()?.to_string())))
                .collect()
        })
        .unwrap_or_default()
}

fn registry_env(registry: Option<&RegistryAuth>) -> Vec<Value> {
    let Some(auth) = registry else {
        return Vec::new();
    };
    let mut env = vec![json!({"name": "REGISTRY", "value": auth.address})];
    if let Some(user) = &auth.username {
        env.push(json!({"name": "REGISTRY_USER", "value": user}));
        env.push(json!({
            "name": "REGISTRY_PASSWORD",
            "value": auth.password.clone().unwrap_or_default(),
        }));
    }
    env
}

fn docker_socket_volume() -> Value {
    json!({"name": "docker-socket", "hostPath": {"path": DOCKER_SOCKET, "type": "Socket"}})
}

/// Container running `script` against the node's Docker daemon. The
/// registry login runs first, and the push of `$IMAGE` last when a
/// registry is configured.
fn docker_container(
    name: &str,
    script: &str,
    mut env: Vec<Value>,
    registry: Option<&RegistryAuth>,
) -> Value {
    env.extend(registry_env(registry));
    json!({
        "name": name,
        "image": DOCKER_CLI_IMAGE,
        "command": ["/bin/sh", "-ec", format!("{LOGIN_SCRIPT}{script}{PUSH_SCRIPT}")],
        "env": env,
        "volumeMounts": [{"name": "docker-socket", "mountPath": DOCKER_SOCKET}],
    })
}

/// Add the committer sidecar to a build pod so `image` is committed and
/// pushed from the node the build ran on.
pub(crate) fn add_committer(pod: &mut Value, image: &str, registry: Option<&RegistryAuth>) {
    let env = vec![
        json!({"name": "IMAGE", "value": image}),
        json!({"name": "POD_NAME", "valueFrom": {"fieldRef": {"fieldPath": "metadata.name"}}}),
        json!({
            "name": "POD_NAMESPACE",
            "valueFrom": {"fieldRef": {"fieldPath": "metadata.namespace"}},
        }),
    ];
    let committer = docker_container(COMMITTER_NAME, COMMIT_SCRIPT, env, registry);
    if let Some(containers) = pod["spec"]["containers"].as_array_mut() {
        containers.push(committer);
    }
    if pod["spec"]["volumes"].is_null() {
        pod["spec"]["volumes"] = json!([]);
    }
    if let Some(volumes) = pod["spec"]["volumes"].as_array_mut() {
        volumes.push(docker_socket_volume());
    }
}

/// One-off pod tagging `source` as `image`.
pub(crate) fn tag_pod(
    name: &str,
    source: &str,
    image: &str,
    registry: Option<&RegistryAuth>,
) -> Value {
    let env = vec![
        json!({"name": "SOURCE", "value": source}),
        json!({"name": "IMAGE", "value": image}),
    ];
    json!({
        "apiVersion": "v1",
        "kind": "Pod",
        "metadata": {"name": name},
        "spec": {
            "restartPolicy": "Never",
            "containers": [docker_container(CONTAINER_NAME, TAG_SCRIPT, env, registry)],
            "volumes": [docker_socket_volume()],
        },
    })
}

fn container_status<'a>(pod: &'a Value, name: &str) -> Option<&'a Value> {
    pod["status"]["containerStatuses"]
        .as_array()?
        .iter()
        .find(|s| s["name"] == name)
}

/// Exit code of the named container once it terminated.
pub(crate) fn container_exit_code(pod: &Value, name: &str) -> Option<i64> {
    container_status(pod, name)?["state"]["terminated"]["exitCode"].as_i64()
}

pub(crate) fn has_container(pod: &Value, name: &str) -> bool {
    pod["spec"]["containers"]
        .as_array()
        .is_some_and(|cs| cs.iter().any(|c| c["name"] == name))
}

pub(crate) fn pod_to_task(pod: &Value) -> Task {
    let labels = labels_of(pod);
    let name = pod["metadata"]["name"].as_str().unwrap_or_default().to_string();
    let phase = PodPhase::from_name(pod["status"]["phase"].as_str().unwrap_or_default());
    let desired = if pod["metadata"]["deletionTimestamp"].is_string() {
        PodPhase::Succeeded
    } else {
        PodPhase::Running
    };
    Task {
        id: name.clone(),
        service_id: labels.get(keys::SERVICE_NAME).unwrap_or_default().to_string(),
        node_id: pod["spec"]["nodeName"].as_str().unwrap_or_default().to_string(),
        container_id: name,
        state: NativeState::Pod(phase),
        desired_state: NativeState::Pod(desired),
        message: pod["status"]["message"].as_str().unwrap_or_default().to_string(),
        error: pod["status"]["reason"].as_str().unwrap_or_default().to_string(),
        exit_code: pod_exit_code(pod),
        labels,
    }
}

/// Exit code of the pod's main container once it terminated.
pub(crate) fn pod_exit_code(pod: &Value) -> Option<i64> {
    container_exit_code(pod, CONTAINER_NAME)
}

pub(crate) fn node_from_json(node: &Value) -> Node {
    let labels = labels_of(node);
    let internal_ip = node["status"]["addresses"]
        .as_array()
        .and_then(|addrs| {
            addrs
                .iter()
                .find(|a| a["type"] == "InternalIP")
                .and_then(|a| a["address"].as_str())
        })
        .map(str::to_string);
    let ready = node["status"]["conditions"]
        .as_array()
        .and_then(|cs| cs.iter().find(|c| c["type"] == "Ready"))
        .map(|c| c["status"] == "True");
    let availability = if node["spec"]["unschedulable"].as_bool().unwrap_or(false) {
        Availability::Drain
    } else {
        Availability::Active
    };
    Node {
        id: node["metadata"]["name"].as_str().unwrap_or_default().to_string(),
        version: resource_version(node),
        address: labels.node_addr().map(str::to_string).or(internal_ip),
        spec: NodeSpec {
            role: None,
            availability,
            labels,
        },
        status: match ready {
            Some(true) => "ready",
            Some(false) => "not ready",
            None => "unknown",
        }
        .to_string(),
    }
}

/// Write `spec` onto a fetched node object for a guarded replace.
pub(crate) fn apply_node_spec(node: &mut Value, version: &VersionToken, spec: &NodeSpec) {
    let labels: BTreeMap<&str, &str> = spec.labels.iter().collect();
    node["metadata"]["labels"] = json!(labels);
    node["metadata"]["resourceVersion"] = json!(version.as_str());
    node["spec"]["unschedulable"] = json!(spec.availability != Availability::Active);
}

pub(crate) fn label_selector(filter: &TaskFilter) -> String {
    let mut labels = filter.labels.clone();
    if let Some(service) = &filter.service {
        labels.set(keys::SERVICE_NAME, service.as_str());
    }
    labels.selector()
}
