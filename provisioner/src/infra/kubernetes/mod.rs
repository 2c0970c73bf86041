//! Kubernetes backend over the API server's REST interface.
//!
//! The cluster has a single member: its API endpoint. Bootstrap and join
//! have no counterpart here and report `Unsupported`. Exec and stdin attach
//! run over the API server's WebSocket channels; image commit, tag and push
//! run in pods that drive the node's Docker daemon.

mod channel;
mod manifest;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::Context;
use futures::StreamExt;
use reqwest::{Method, StatusCode};
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, mpsc};

use crate::application::ports::{
    BackendConnector, ClusterInit, ClusterJoin, CredentialStore, ExecBackend, InstanceBackend,
    MembershipBackend, NodeBackend, ServiceBackend, Stdio,
};
use crate::domain::{
    BackendError, EngineConfig, ExecStatus, InstanceState, Node, NodeSpec, PodPhase,
    ProvisionError, RegistryAuth, ServiceObject, ServiceSpec, Task, TaskFilter, TtySize,
    VersionToken,
};
use crate::infra::tls;

use manifest::WorkloadKind;

const BACKEND: &str = "kubernetes";

/// Opens [`KubernetesBackend`] clients.
pub struct KubernetesConnector<K> {
    credentials: K,
    namespace: String,
    dial_timeout: Duration,
    full_timeout: Duration,
    pod_poll: Duration,
    registry: Option<RegistryAuth>,
}

impl<K: CredentialStore> KubernetesConnector<K> {
    pub fn new(config: &EngineConfig, credentials: K) -> Self {
        Self {
            credentials,
            namespace: config.namespace.clone(),
            dial_timeout: config.dial_timeout(),
            full_timeout: config.full_timeout(),
            pod_poll: config.pod_ready().interval,
            registry: config.registry_auth(),
        }
    }
}

impl<K: CredentialStore> BackendConnector for KubernetesConnector<K> {
    type Backend = KubernetesBackend;

    async fn connect(&self, address: &str) -> Result<KubernetesBackend, ProvisionError> {
        let creds = self.credentials.node_credentials(address).await?;
        let connect_error = |source: anyhow::Error| ProvisionError::Transport {
            operation: "connect",
            object: address.to_string(),
            source: BackendError::Api(source),
        };
        // Log follows and exec sessions last as long as the command does.
        let client = |timeout: Option<Duration>| {
            let mut builder = reqwest::Client::builder().connect_timeout(self.dial_timeout);
            if let Some(timeout) = timeout {
                builder = builder.timeout(timeout);
            }
            if let Some(creds) = &creds {
                builder = tls::configure_reqwest(builder, creds)?;
            }
            builder.build().context("building API server client")
        };
        let http = client(Some(self.full_timeout)).map_err(connect_error)?;
        let streams = client(None).map_err(connect_error)?;
        tracing::debug!(endpoint = %address, namespace = %self.namespace, "API server client ready");
        Ok(KubernetesBackend {
            http,
            streams,
            base: address.trim_end_matches('/').to_string(),
            namespace: self.namespace.clone(),
            pod_poll: self.pod_poll,
            registry: self.registry.clone(),
            execs: Mutex::new(HashMap::new()),
            next_exec: AtomicU64::new(0),
        })
    }
}

/// Client for one Kubernetes API server.
pub struct KubernetesBackend {
    http: reqwest::Client,
    /// No overall timeout, for long-lived streams.
    streams: reqwest::Client,
    base: String,
    namespace: String,
    pod_poll: Duration,
    registry: Option<RegistryAuth>,
    execs: Mutex<HashMap<String, ExecSession>>,
    next_exec: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ExecPhase {
    Created,
    Running,
    Exited(Option<i64>),
}

/// Exec session created but not necessarily started yet.
struct ExecSession {
    pod: String,
    cmd: Vec<String>,
    stdin: bool,
    phase: ExecPhase,
    resize: Option<mpsc::UnboundedSender<TtySize>>,
}

fn unsupported(operation: &'static str) -> BackendError {
    BackendError::Unsupported {
        operation,
        backend: BACKEND,
    }
}

fn transport(e: reqwest::Error) -> BackendError {
    BackendError::Api(e.into())
}

impl KubernetesBackend {
    async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
    ) -> Result<reqwest::Response, BackendError> {
        let mut req = self.http.request(method, format!("{}{path}", self.base));
        if let Some(body) = body {
            req = req.json(body);
        }
        let resp = req.send().await.map_err(transport)?;
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let text = resp.text().await.unwrap_or_default();
        Err(match status {
            StatusCode::NOT_FOUND => BackendError::NotFound,
            StatusCode::CONFLICT => BackendError::Conflict(text),
            _ => BackendError::Api(anyhow::anyhow!("API server returned {status}: {text}")),
        })
    }

    async fn json(&self, method: Method, path: &str, body: Option<&Value>) -> Result<Value, BackendError> {
        self.request(method, path, body)
            .await?
            .json()
            .await
            .map_err(transport)
    }

    /// Workload named `name` whichever kind it is.
    async fn find_workload(&self, name: &str) -> Result<(WorkloadKind, Value), BackendError> {
        for kind in WorkloadKind::ALL {
            match self
                .json(Method::GET, &kind.item_path(&self.namespace, name), None)
                .await
            {
                Ok(obj) => return Ok((kind, obj)),
                Err(BackendError::NotFound) => {}
                Err(e) => return Err(e),
            }
        }
        Err(BackendError::NotFound)
    }

    fn service_path(&self, name: &str) -> String {
        format!("/api/v1/namespaces/{}/services/{name}", self.namespace)
    }

    fn pod_path(&self, name: &str) -> String {
        WorkloadKind::Pod.item_path(&self.namespace, name)
    }

    fn url(&self, path: &str) -> Result<reqwest::Url, BackendError> {
        reqwest::Url::parse(&format!("{}{path}", self.base)).map_err(|e| BackendError::Api(e.into()))
    }

    /// URL of a pod's `exec` or `attach` subresource on its main container.
    fn channel_url(
        &self,
        pod: &str,
        subresource: &str,
        stdin: bool,
        tty: bool,
    ) -> Result<reqwest::Url, BackendError> {
        let mut url = self.url(&format!("{}/{subresource}", self.pod_path(pod)))?;
        url.query_pairs_mut()
            .append_pair("container", manifest::CONTAINER_NAME)
            .append_pair("stdin", if stdin { "true" } else { "false" })
            .append_pair("stdout", "true")
            .append_pair("stderr", if tty { "false" } else { "true" })
            .append_pair("tty", if tty { "true" } else { "false" });
        Ok(url)
    }

    /// Exit code of a pod's main container, polling until it terminates.
    async fn wait_exit(&self, name: &str) -> Result<i64, BackendError> {
        self.poll_pod(name, |pod| {
            if let Some(code) = manifest::pod_exit_code(pod) {
                return Some(code);
            }
            match PodPhase::from_name(pod["status"]["phase"].as_str().unwrap_or_default()) {
                PodPhase::Succeeded => Some(0),
                PodPhase::Failed => Some(1),
                _ => None,
            }
        })
        .await
    }

    /// Poll pod `name` until `done` yields a value.
    async fn poll_pod<T>(
        &self,
        name: &str,
        mut done: impl FnMut(&Value) -> Option<T>,
    ) -> Result<T, BackendError> {
        loop {
            let pod = self.json(Method::GET, &self.pod_path(name), None).await?;
            if let Some(value) = done(&pod) {
                return Ok(value);
            }
            tokio::time::sleep(self.pod_poll).await;
        }
    }

    async fn ensure_node_port(&self, spec: &ServiceSpec) -> Result<(), BackendError> {
        let Some(port) = spec.endpoint_port else {
            return Ok(());
        };
        let body = manifest::node_port_service(spec, port);
        let path = format!("/api/v1/namespaces/{}/services", self.namespace);
        match self.request(Method::POST, &path, Some(&body)).await {
            Ok(_) | Err(BackendError::Conflict(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn delete(&self, path: &str) -> Result<(), BackendError> {
        self.request(
            Method::DELETE,
            &format!("{path}?propagationPolicy=Background"),
            None,
        )
        .await?;
        Ok(())
    }
}

fn encode(spec: &ServiceSpec, rv: Option<&str>) -> Result<Value, BackendError> {
    manifest::workload(spec, rv).map_err(|e| BackendError::Api(e.into()))
}

impl ServiceBackend for KubernetesBackend {
    async fn create_service(&self, spec: &ServiceSpec) -> Result<String, BackendError> {
        let kind = WorkloadKind::for_spec(spec);
        let mut body = encode(spec, None)?;
        if let (WorkloadKind::Pod, Some(image)) = (kind, spec.labels.build_image()) {
            manifest::add_committer(&mut body, image, self.registry.as_ref());
        }
        self.request(
            Method::POST,
            &kind.collection_path(&self.namespace),
            Some(&body),
        )
        .await?;
        self.ensure_node_port(spec).await?;
        Ok(spec.name.clone())
    }

    async fn update_service(
        &self,
        id: &str,
        version: &VersionToken,
        spec: &ServiceSpec,
    ) -> Result<(), BackendError> {
        let kind = WorkloadKind::for_spec(spec);
        let body = encode(spec, Some(version.as_str()))?;
        self.request(
            Method::PUT,
            &kind.item_path(&self.namespace, id),
            Some(&body),
        )
        .await?;
        self.ensure_node_port(spec).await
    }

    async fn inspect_service(&self, name_or_id: &str) -> Result<ServiceObject, BackendError> {
        let (_, obj) = self.find_workload(name_or_id).await?;
        let spec = manifest::stored_spec(&obj).ok_or_else(|| {
            BackendError::Api(anyhow::anyhow!("{name_or_id} was not created by this engine"))
        })?;
        let published_port = match spec.endpoint_port {
            Some(_) => match self.json(Method::GET, &self.service_path(name_or_id), None).await {
                Ok(svc) => manifest::node_port(&svc),
                Err(BackendError::NotFound) => None,
                Err(e) => return Err(e),
            },
            None => None,
        };
        Ok(ServiceObject {
            id: name_or_id.to_string(),
            version: manifest::resource_version(&obj),
            spec,
            published_port,
        })
    }

    async fn remove_service(&self, name_or_id: &str) -> Result<(), BackendError> {
        let (kind, _) = self.find_workload(name_or_id).await?;
        self.delete(&kind.item_path(&self.namespace, name_or_id))
            .await?;
        match self.delete(&self.service_path(name_or_id)).await {
            Ok(()) | Err(BackendError::NotFound) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn create_network(&self, name: &str) -> Result<(), BackendError> {
        tracing::debug!(network = %name, "pod network is flat; nothing to create");
        Ok(())
    }

    async fn remove_network(&self, _name: &str) -> Result<(), BackendError> {
        Ok(())
    }
}

impl InstanceBackend for KubernetesBackend {
    async fn list_tasks(&self, filter: &TaskFilter) -> Result<Vec<Task>, BackendError> {
        let mut url = reqwest::Url::parse(&format!(
            "{}{}",
            self.base,
            WorkloadKind::Pod.collection_path(&self.namespace)
        ))
        .map_err(|e| BackendError::Api(e.into()))?;
        {
            let mut query = url.query_pairs_mut();
            let selector = manifest::label_selector(filter);
            if !selector.is_empty() {
                query.append_pair("labelSelector", &selector);
            }
            if let Some(node) = &filter.node {
                query.append_pair("fieldSelector", &format!("spec.nodeName={node}"));
            }
        }
        let resp = self.http.get(url).send().await.map_err(transport)?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(BackendError::Api(anyhow::anyhow!(
                "listing pods returned {status}: {text}"
            )));
        }
        let list: Value = resp.json().await.map_err(transport)?;
        Ok(list["items"]
            .as_array()
            .map(|items| items.iter().map(manifest::pod_to_task).collect())
            .unwrap_or_default())
    }

    async fn inspect_instance(&self, task: &Task) -> Result<InstanceState, BackendError> {
        let pod = self
            .json(Method::GET, &self.pod_path(&task.container_id), None)
            .await?;
        let phase = PodPhase::from_name(pod["status"]["phase"].as_str().unwrap_or_default());
        let exit_code = manifest::pod_exit_code(&pod);
        Ok(InstanceState {
            running: exit_code.is_none() && matches!(phase, PodPhase::Pending | PodPhase::Running),
            exit_code: exit_code.unwrap_or(0),
        })
    }

    async fn attach_instance(&self, task: &Task, stdio: Stdio<'_>) -> Result<(), BackendError> {
        if stdio.stdin.is_some() {
            let url = self.channel_url(&task.container_id, "attach", true, false)?;
            let session = channel::open(&self.streams, url).await?;
            // Attach carries no resizes.
            let (_, resizes) = mpsc::unbounded_channel();
            session.relay(stdio, resizes).await?;
            return Ok(());
        }
        let mut url = self.url(&format!("{}/log", self.pod_path(&task.container_id)))?;
        url.query_pairs_mut()
            .append_pair("container", manifest::CONTAINER_NAME)
            .append_pair("follow", "true");
        let resp = self.streams.get(url).send().await.map_err(transport)?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(match status {
                StatusCode::NOT_FOUND => BackendError::NotFound,
                _ => BackendError::Api(anyhow::anyhow!("following logs returned {status}: {text}")),
            });
        }
        let stdout = stdio.stdout;
        let mut body = resp.bytes_stream();
        while let Some(chunk) = body.next().await {
            let chunk = chunk.map_err(transport)?;
            stdout
                .write_all(&chunk)
                .await
                .map_err(|e| BackendError::Api(e.into()))?;
        }
        Ok(())
    }

    async fn wait_instance(&self, task: &Task) -> Result<i64, BackendError> {
        self.wait_exit(&task.container_id).await
    }

    /// The build pod's committer sidecar does the commit; this waits for it.
    async fn commit_instance(&self, task: &Task, repo: &str, tag: &str) -> Result<(), BackendError> {
        let pod = &task.container_id;
        let code = self
            .poll_pod(pod, |pod| {
                if !manifest::has_container(pod, manifest::COMMITTER_NAME) {
                    return Some(None);
                }
                manifest::container_exit_code(pod, manifest::COMMITTER_NAME).map(Some)
            })
            .await?;
        match code {
            None => Err(unsupported("commit without a committer sidecar")),
            Some(0) => {
                tracing::info!(pod = %pod, image = %format!("{repo}:{tag}"), "build image committed");
                Ok(())
            }
            Some(code) => Err(BackendError::Api(anyhow::anyhow!(
                "committing {repo}:{tag} from pod {pod} exited with {code}"
            ))),
        }
    }

    async fn tag_image(&self, source: &str, repo: &str, tag: &str) -> Result<(), BackendError> {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        let name = format!("convoy-tag-{nanos:x}");
        let image = format!("{repo}:{tag}");
        let pod = manifest::tag_pod(&name, source, &image, self.registry.as_ref());
        self.request(
            Method::POST,
            &WorkloadKind::Pod.collection_path(&self.namespace),
            Some(&pod),
        )
        .await?;
        let code = self.wait_exit(&name).await;
        if let Err(e) = self.delete(&self.pod_path(&name)).await {
            tracing::warn!(pod = %name, error = %e, "failed to remove tag pod");
        }
        match code? {
            0 => Ok(()),
            code => Err(BackendError::Api(anyhow::anyhow!(
                "tagging {source} as {image} exited with {code}"
            ))),
        }
    }

    /// Images are pushed by the pod that commits or tags them.
    async fn push_image(
        &self,
        repo: &str,
        tag: &str,
        _auth: Option<&RegistryAuth>,
    ) -> Result<(), BackendError> {
        tracing::debug!(image = %format!("{repo}:{tag}"), "pushed by the producing pod");
        Ok(())
    }
}

impl NodeBackend for KubernetesBackend {
    async fn list_nodes(&self) -> Result<Vec<Node>, BackendError> {
        let list = self.json(Method::GET, "/api/v1/nodes", None).await?;
        Ok(list["items"]
            .as_array()
            .map(|items| items.iter().map(manifest::node_from_json).collect())
            .unwrap_or_default())
    }

    async fn inspect_node(&self, id: &str) -> Result<Node, BackendError> {
        let node = self
            .json(Method::GET, &format!("/api/v1/nodes/{id}"), None)
            .await?;
        Ok(manifest::node_from_json(&node))
    }

    async fn update_node(
        &self,
        id: &str,
        version: &VersionToken,
        spec: &NodeSpec,
    ) -> Result<(), BackendError> {
        let path = format!("/api/v1/nodes/{id}");
        let mut node = self.json(Method::GET, &path, None).await?;
        manifest::apply_node_spec(&mut node, version, spec);
        self.request(Method::PUT, &path, Some(&node)).await?;
        Ok(())
    }

    async fn remove_node(&self, id: &str, _force: bool) -> Result<(), BackendError> {
        self.request(Method::DELETE, &format!("/api/v1/nodes/{id}"), None)
            .await?;
        Ok(())
    }

    async fn evict_instance(&self, task: &Task) -> Result<(), BackendError> {
        match self.delete(&self.pod_path(&task.container_id)).await {
            Ok(()) | Err(BackendError::NotFound) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

impl MembershipBackend for KubernetesBackend {
    fn endpoint(&self) -> &str {
        &self.base
    }

    async fn ping(&self) -> Result<(), BackendError> {
        self.request(Method::GET, "/version", None).await?;
        Ok(())
    }

    async fn init_cluster(&self, _req: &ClusterInit) -> Result<(), BackendError> {
        Err(unsupported("init cluster"))
    }

    async fn join_token(&self) -> Result<String, BackendError> {
        Err(unsupported("join token"))
    }

    async fn manager_peers(&self) -> Result<Vec<String>, BackendError> {
        Err(unsupported("list manager peers"))
    }

    async fn join_cluster(&self, _req: &ClusterJoin) -> Result<(), BackendError> {
        Err(unsupported("join cluster"))
    }

    async fn local_node_id(&self) -> Result<String, BackendError> {
        Err(unsupported("read node id"))
    }

    async fn leave_cluster(&self, _force: bool) -> Result<(), BackendError> {
        Err(unsupported("leave cluster"))
    }

    fn nodes_are_members(&self) -> bool {
        false
    }
}

impl ExecBackend for KubernetesBackend {
    async fn create_exec(
        &self,
        task: &Task,
        cmd: &[String],
        _tty: bool,
        attach_stdin: bool,
    ) -> Result<String, BackendError> {
        let id = format!(
            "{}-exec-{}",
            task.container_id,
            self.next_exec.fetch_add(1, Ordering::Relaxed)
        );
        self.execs.lock().await.insert(
            id.clone(),
            ExecSession {
                pod: task.container_id.clone(),
                cmd: cmd.to_vec(),
                stdin: attach_stdin,
                phase: ExecPhase::Created,
                resize: None,
            },
        );
        Ok(id)
    }

    async fn start_exec(&self, exec_id: &str, tty: bool, stdio: Stdio<'_>) -> Result<(), BackendError> {
        let (pod, cmd, stdin) = {
            let execs = self.execs.lock().await;
            let session = execs.get(exec_id).ok_or(BackendError::NotFound)?;
            (session.pod.clone(), session.cmd.clone(), session.stdin)
        };
        let mut url = self.channel_url(&pod, "exec", stdin, tty)?;
        {
            let mut query = url.query_pairs_mut();
            for arg in &cmd {
                query.append_pair("command", arg);
            }
        }
        let opened = channel::open(&self.streams, url).await;
        let (resize_tx, resizes) = mpsc::unbounded_channel();
        let relayed = match opened {
            Ok(session) => {
                self.set_exec(exec_id, ExecPhase::Running, Some(resize_tx))
                    .await;
                session.relay(stdio, resizes).await
            }
            Err(e) => Err(e),
        };
        let exit_code = relayed.as_ref().ok().copied().flatten();
        self.set_exec(exec_id, ExecPhase::Exited(exit_code), None)
            .await;
        relayed.map(drop)
    }

    async fn inspect_exec(&self, exec_id: &str) -> Result<ExecStatus, BackendError> {
        let execs = self.execs.lock().await;
        let session = execs.get(exec_id).ok_or(BackendError::NotFound)?;
        Ok(match session.phase {
            ExecPhase::Created => ExecStatus {
                running: false,
                exit_code: None,
            },
            ExecPhase::Running => ExecStatus {
                running: true,
                exit_code: None,
            },
            ExecPhase::Exited(exit_code) => ExecStatus {
                running: false,
                exit_code,
            },
        })
    }

    async fn resize_exec(&self, exec_id: &str, size: TtySize) -> Result<(), BackendError> {
        let execs = self.execs.lock().await;
        let sender = execs
            .get(exec_id)
            .and_then(|s| s.resize.as_ref())
            .ok_or(BackendError::NotFound)?;
        sender
            .send(size)
            .map_err(|_| BackendError::Api(anyhow::anyhow!("exec {exec_id} already ended")))
    }
}

impl KubernetesBackend {
    async fn set_exec(
        &self,
        exec_id: &str,
        phase: ExecPhase,
        resize: Option<mpsc::UnboundedSender<TtySize>>,
    ) {
        if let Some(session) = self.execs.lock().await.get_mut(exec_id) {
            session.phase = phase;
            session.resize = resize;
        }
    }
}
