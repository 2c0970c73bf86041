//! In-memory cluster shared by every client the fake connector opens.
//!
//! Each backend call is recorded as a short string (`"create_service web"`)
//! so tests can assert on ordering and counts. Failures are injected per
//! operation name.

#![allow(clippy::expect_used, clippy::unwrap_used, dead_code)]

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use convoy_common::{Availability, LabelSet, NodeRole, Unit, keys};
use convoy_provisioner::application::ports::{
    AppRegistry, BackendConnector, ClusterInit, ClusterJoin, ExecBackend, ImageStore,
    InstanceBackend, MembershipBackend, NodeBackend, ServiceBackend, Stdio,
};
use convoy_provisioner::domain::{
    AppInfo, BackendError, ExecStatus, ImageMetadata, InstanceState, NativeState, Node, NodeSpec,
    ProvisionError, RegistryAuth, ServiceObject, ServiceSpec, SwarmTaskState, Task, TaskFilter,
    TtySize, VersionToken,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

// ── Failure injection ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fail {
    NotFound,
    Conflict,
    Api,
}

impl Fail {
    fn error(self) -> BackendError {
        match self {
            Fail::NotFound => BackendError::NotFound,
            Fail::Conflict => BackendError::Conflict("update out of sequence".into()),
            Fail::Api => BackendError::Api(anyhow::anyhow!("injected failure")),
        }
    }
}

// ── Cluster state ─────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct ClusterState {
    pub services: BTreeMap<String, ServiceObject>,
    pub tasks: Vec<Task>,
    pub nodes: Vec<Node>,
    pub calls: Vec<String>,
    pub fail: HashMap<&'static str, Fail>,
    /// Addresses whose ping fails.
    pub unreachable: HashSet<String>,
    /// Membership records hold the cluster API endpoint, not node addresses.
    pub endpoint_registered: bool,
    /// Addresses already part of a cluster.
    pub swarm_members: HashSet<String>,
    /// Node ID each address was given when it joined.
    pub node_ids: HashMap<String, String>,
    /// Published port assigned to services with an endpoint.
    pub published_port: Option<u16>,
    /// State given to tasks created for ephemeral services.
    pub spawn_state: Option<NativeState>,
    /// Exit code recorded on tasks created for ephemeral services.
    pub spawn_exit: Option<i64>,
    pub instance_exit: i64,
    pub instance_output: Vec<u8>,
    /// Attach and wait never return.
    pub attach_hangs: bool,
    pub exec_exit: i64,
    /// Finished sessions report no exit code.
    pub exec_exit_unknown: bool,
    /// Inspections that still report running after a session ends.
    pub exec_settle_inspects: usize,
    pub exec_output: Vec<u8>,
    pub finished_execs: HashSet<String>,
    pub stdin_seen: Vec<u8>,
    pub next_id: u64,
}

impl ClusterState {
    fn id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{prefix}-{}", self.next_id)
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.calls.iter().filter(|c| c.starts_with(prefix)).count()
    }

    pub fn service(&self, name: &str) -> Option<&ServiceObject> {
        self.services.get(name)
    }

    fn find_service_key(&self, name_or_id: &str) -> Option<String> {
        if self.services.contains_key(name_or_id) {
            return Some(name_or_id.to_string());
        }
        self.services
            .iter()
            .find(|(_, s)| s.id == name_or_id)
            .map(|(k, _)| k.clone())
    }

    /// Register a valid node reachable at `address`.
    pub fn add_node(&mut self, id: &str, address: &str, role: NodeRole, pool: Option<&str>) {
        let mut labels = LabelSet::new();
        labels.set(keys::NODE_ADDR, address);
        if let Some(pool) = pool {
            labels.set(keys::NODE_POOL, pool);
        }
        self.nodes.push(Node {
            id: id.to_string(),
            version: VersionToken::from(1),
            spec: NodeSpec {
                role: Some(role),
                availability: Availability::Active,
                labels,
            },
            address: Some(address.to_string()),
            status: "ready".to_string(),
        });
        self.node_ids.insert(address.to_string(), id.to_string());
        self.swarm_members.insert(address.to_string());
    }

    /// Add a running task of `service` on `node_id`.
    pub fn add_task(&mut self, service: &str, node_id: &str, container_id: &str) -> Task {
        let svc = self.services.get(service).expect("service exists").clone();
        let task = Task {
            id: self.id("task"),
            service_id: svc.id.clone(),
            node_id: node_id.to_string(),
            container_id: container_id.to_string(),
            state: NativeState::Swarm(SwarmTaskState::Running),
            desired_state: NativeState::Swarm(SwarmTaskState::Running),
            message: "started".into(),
            error: String::new(),
            exit_code: None,
            labels: svc.spec.labels.clone(),
        };
        self.tasks.push(task.clone());
        task
    }
}

pub type SharedState = Arc<Mutex<ClusterState>>;

// ── Connector ─────────────────────────────────────────────────────────────────

#[derive(Clone, Default)]
pub struct FakeConnector {
    pub state: SharedState,
    pub refused: Arc<Mutex<HashSet<String>>>,
}

impl FakeConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> std::sync::MutexGuard<'_, ClusterState> {
        self.state.lock().unwrap()
    }

    pub fn refuse(&self, address: &str) {
        self.refused.lock().unwrap().insert(address.to_string());
    }
}

impl BackendConnector for FakeConnector {
    type Backend = FakeBackend;

    async fn connect(&self, address: &str) -> Result<FakeBackend, ProvisionError> {
        self.state().calls.push(format!("connect {address}"));
        if self.refused.lock().unwrap().contains(address) {
            return Err(ProvisionError::Transport {
                operation: "connect",
                object: address.to_string(),
                source: BackendError::Api(anyhow::anyhow!("connection refused")),
            });
        }
        Ok(FakeBackend {
            state: Arc::clone(&self.state),
            address: address.to_string(),
        })
    }
}

// ── Backend ───────────────────────────────────────────────────────────────────

pub struct FakeBackend {
    state: SharedState,
    pub address: String,
}

impl FakeBackend {
    fn record(&self, op: &'static str, detail: &str) -> Result<(), BackendError> {
        let mut st = self.state.lock().unwrap();
        st.calls.push(format!("{op} {detail}"));
        match st.fail.get(op) {
            Some(fail) => Err(fail.error()),
            None => Ok(()),
        }
    }

    fn with<T>(&self, f: impl FnOnce(&mut ClusterState) -> T) -> T {
        f(&mut self.state.lock().unwrap())
    }
}

impl ServiceBackend for FakeBackend {
    async fn create_service(&self, spec: &ServiceSpec) -> Result<String, BackendError> {
        self.record("create_service", &spec.name)?;
        Ok(self.with(|st| {
            let id = st.id("svc");
            st.services.insert(
                spec.name.clone(),
                ServiceObject {
                    id: id.clone(),
                    version: VersionToken::from(1),
                    spec: spec.clone(),
                    published_port: spec.endpoint_port.and(st.published_port),
                },
            );
            if let Some(state) = st.spawn_state {
                let node_id = st.nodes.first().map(|n| n.id.clone()).unwrap_or_default();
                let task_id = st.id("task");
                let container_id = st.id("ctr");
                st.tasks.push(Task {
                    id: task_id,
                    service_id: id.clone(),
                    node_id,
                    container_id,
                    state,
                    desired_state: NativeState::Swarm(SwarmTaskState::Running),
                    message: String::new(),
                    error: if state.is_failed() {
                        "task: non-zero exit (1)".into()
                    } else {
                        String::new()
                    },
                    exit_code: st.spawn_exit,
                    labels: spec.labels.clone(),
                });
            }
            id
        }))
    }

    async fn update_service(
        &self,
        id: &str,
        version: &VersionToken,
        spec: &ServiceSpec,
    ) -> Result<(), BackendError> {
        self.record("update_service", &spec.name)?;
        self.with(|st| {
            let key = st.find_service_key(id).ok_or(BackendError::NotFound)?;
            let svc = st.services.get_mut(&key).ok_or(BackendError::NotFound)?;
            if &svc.version != version {
                return Err(BackendError::Conflict("update out of sequence".into()));
            }
            let next: u64 = svc.version.as_str().parse().unwrap_or(0) + 1;
            svc.version = VersionToken::from(next);
            svc.spec = spec.clone();
            Ok(())
        })
    }

    async fn inspect_service(&self, name_or_id: &str) -> Result<ServiceObject, BackendError> {
        self.record("inspect_service", name_or_id)?;
        self.with(|st| {
            st.find_service_key(name_or_id)
                .and_then(|k| st.services.get(&k).cloned())
                .ok_or(BackendError::NotFound)
        })
    }

    async fn remove_service(&self, name_or_id: &str) -> Result<(), BackendError> {
        self.record("remove_service", name_or_id)?;
        self.with(|st| {
            let key = st.find_service_key(name_or_id).ok_or(BackendError::NotFound)?;
            if let Some(svc) = st.services.remove(&key) {
                st.tasks.retain(|t| t.service_id != svc.id);
            }
            Ok(())
        })
    }

    async fn create_network(&self, name: &str) -> Result<(), BackendError> {
        self.record("create_network", name)
    }

    async fn remove_network(&self, name: &str) -> Result<(), BackendError> {
        self.record("remove_network", name)
    }
}

fn matches(task: &Task, filter: &TaskFilter) -> bool {
    filter.service.as_ref().is_none_or(|s| &task.service_id == s)
        && filter.node.as_ref().is_none_or(|n| &task.node_id == n)
        && filter.labels.iter().all(|(k, v)| task.labels.get(k) == Some(v))
}

impl InstanceBackend for FakeBackend {
    async fn list_tasks(&self, filter: &TaskFilter) -> Result<Vec<Task>, BackendError> {
        self.record("list_tasks", filter.service.as_deref().unwrap_or("*"))?;
        Ok(self.with(|st| st.tasks.iter().filter(|t| matches(t, filter)).cloned().collect()))
    }

    async fn inspect_instance(&self, task: &Task) -> Result<InstanceState, BackendError> {
        self.record("inspect_instance", &task.container_id)?;
        Ok(self.with(|st| InstanceState {
            running: false,
            exit_code: st.instance_exit,
        }))
    }

    async fn attach_instance(&self, task: &Task, stdio: Stdio<'_>) -> Result<(), BackendError> {
        self.record("attach_instance", &task.container_id)?;
        let (hangs, output) = self.with(|st| (st.attach_hangs, st.instance_output.clone()));
        if hangs {
            std::future::pending::<()>().await;
        }
        if let Some(stdin) = stdio.stdin {
            let mut buf = Vec::new();
            stdin.read_to_end(&mut buf).await.expect("read stdin");
            self.with(|st| st.stdin_seen = buf);
        }
        stdio.stdout.write_all(&output).await.expect("write stdout");
        Ok(())
    }

    async fn wait_instance(&self, task: &Task) -> Result<i64, BackendError> {
        self.record("wait_instance", &task.container_id)?;
        Ok(self.with(|st| st.instance_exit))
    }

    async fn commit_instance(&self, task: &Task, repo: &str, tag: &str) -> Result<(), BackendError> {
        self.record("commit_instance", &format!("{} {repo}:{tag}", task.container_id))
    }

    async fn tag_image(&self, source: &str, repo: &str, tag: &str) -> Result<(), BackendError> {
        self.record("tag_image", &format!("{source} {repo}:{tag}"))
    }

    async fn push_image(
        &self,
        repo: &str,
        tag: &str,
        _auth: Option<&RegistryAuth>,
    ) -> Result<(), BackendError> {
        self.record("push_image", &format!("{repo}:{tag}"))
    }
}

impl NodeBackend for FakeBackend {
    async fn list_nodes(&self) -> Result<Vec<Node>, BackendError> {
        self.record("list_nodes", "")?;
        Ok(self.with(|st| st.nodes.clone()))
    }

    async fn inspect_node(&self, id: &str) -> Result<Node, BackendError> {
        self.record("inspect_node", id)?;
        self.with(|st| {
            st.nodes
                .iter()
                .find(|n| n.id == id)
                .cloned()
                .ok_or(BackendError::NotFound)
        })
    }

    async fn update_node(
        &self,
        id: &str,
        version: &VersionToken,
        spec: &NodeSpec,
    ) -> Result<(), BackendError> {
        self.record("update_node", id)?;
        self.with(|st| {
            let node = st
                .nodes
                .iter_mut()
                .find(|n| n.id == id)
                .ok_or(BackendError::NotFound)?;
            if &node.version != version {
                return Err(BackendError::Conflict("update out of sequence".into()));
            }
            let next: u64 = node.version.as_str().parse().unwrap_or(0) + 1;
            node.version = VersionToken::from(next);
            node.spec = spec.clone();
            node.address = spec.labels.node_addr().map(str::to_string);
            Ok(())
        })
    }

    async fn remove_node(&self, id: &str, _force: bool) -> Result<(), BackendError> {
        self.record("remove_node", id)?;
        self.with(|st| st.nodes.retain(|n| n.id != id));
        Ok(())
    }

    async fn evict_instance(&self, task: &Task) -> Result<(), BackendError> {
        self.record("evict_instance", &task.id)
    }
}

impl MembershipBackend for FakeBackend {
    fn endpoint(&self) -> &str {
        &self.address
    }

    async fn ping(&self) -> Result<(), BackendError> {
        self.record("ping", &self.address)?;
        if self.with(|st| st.unreachable.contains(&self.address)) {
            return Err(BackendError::Api(anyhow::anyhow!("no route to host")));
        }
        Ok(())
    }

    async fn init_cluster(&self, req: &ClusterInit) -> Result<(), BackendError> {
        self.record("init_cluster", &req.advertise_addr)?;
        self.join_as(NodeRole::Manager)
    }

    async fn join_token(&self) -> Result<String, BackendError> {
        self.record("join_token", &self.address)?;
        Ok("SWMTKN-1-fake".to_string())
    }

    async fn manager_peers(&self) -> Result<Vec<String>, BackendError> {
        self.record("manager_peers", &self.address)?;
        Ok(self.with(|st| {
            st.nodes
                .iter()
                .filter(|n| n.is_manager())
                .filter_map(|n| n.address.clone())
                .collect()
        }))
    }

    async fn join_cluster(&self, req: &ClusterJoin) -> Result<(), BackendError> {
        self.record("join_cluster", &req.advertise_addr)?;
        self.join_as(NodeRole::Worker)
    }

    async fn local_node_id(&self) -> Result<String, BackendError> {
        self.record("local_node_id", &self.address)?;
        self.with(|st| st.node_ids.get(&self.address).cloned().ok_or(BackendError::NotFound))
    }

    async fn leave_cluster(&self, force: bool) -> Result<(), BackendError> {
        self.record("leave_cluster", &format!("{} force={force}", self.address))?;
        if self.with(|st| st.endpoint_registered) {
            return Err(BackendError::Unsupported {
                operation: "leave cluster",
                backend: "fake",
            });
        }
        self.with(|st| {
            st.swarm_members.remove(&self.address);
            st.nodes.clear();
        });
        Ok(())
    }

    fn nodes_are_members(&self) -> bool {
        !self.with(|st| st.endpoint_registered)
    }
}

impl FakeBackend {
    fn join_as(&self, role: NodeRole) -> Result<(), BackendError> {
        self.with(|st| {
            if !st.swarm_members.insert(self.address.clone()) {
                return Err(BackendError::AlreadyMember);
            }
            let id = st.id("node");
            st.nodes.push(Node {
                id: id.clone(),
                version: VersionToken::from(1),
                spec: NodeSpec {
                    role: Some(role),
                    ..NodeSpec::default()
                },
                address: None,
                status: "ready".into(),
            });
            st.node_ids.insert(self.address.clone(), id);
            Ok(())
        })
    }
}

impl ExecBackend for FakeBackend {
    async fn create_exec(
        &self,
        task: &Task,
        cmd: &[String],
        tty: bool,
        _attach_stdin: bool,
    ) -> Result<String, BackendError> {
        self.record(
            "create_exec",
            &format!("{} tty={tty} {}", task.container_id, cmd.join(" ")),
        )?;
        Ok(self.with(|st| st.id("exec")))
    }

    async fn start_exec(&self, exec_id: &str, _tty: bool, stdio: Stdio<'_>) -> Result<(), BackendError> {
        self.record("start_exec", exec_id)?;
        // A live session is still pending when first polled.
        tokio::task::yield_now().await;
        let output = self.with(|st| st.exec_output.clone());
        stdio.stdout.write_all(&output).await.expect("write stdout");
        self.with(|st| st.finished_execs.insert(exec_id.to_string()));
        Ok(())
    }

    async fn inspect_exec(&self, exec_id: &str) -> Result<ExecStatus, BackendError> {
        self.record("inspect_exec", exec_id)?;
        Ok(self.with(|st| {
            if !st.finished_execs.contains(exec_id) {
                return ExecStatus {
                    running: true,
                    exit_code: None,
                };
            }
            if st.exec_settle_inspects > 0 {
                st.exec_settle_inspects -= 1;
                return ExecStatus {
                    running: true,
                    exit_code: None,
                };
            }
            ExecStatus {
                running: false,
                exit_code: (!st.exec_exit_unknown).then_some(st.exec_exit),
            }
        }))
    }

    async fn resize_exec(&self, exec_id: &str, size: TtySize) -> Result<(), BackendError> {
        self.record("resize_exec", &format!("{exec_id} {}x{}", size.width, size.height))
    }
}

// ── Collaborators ─────────────────────────────────────────────────────────────

#[derive(Clone, Default)]
pub struct FakeApps {
    pub apps: Arc<Mutex<HashMap<String, AppInfo>>>,
    pub bound: Arc<Mutex<Vec<Unit>>>,
    pub update_platform: Arc<Mutex<Vec<(String, bool)>>>,
    pub lookups: Arc<Mutex<usize>>,
}

impl FakeApps {
    pub fn with(apps: &[AppInfo]) -> Self {
        let fake = Self::default();
        for app in apps {
            fake.apps.lock().unwrap().insert(app.name.clone(), app.clone());
        }
        fake
    }
}

impl AppRegistry for FakeApps {
    async fn get_app(&self, name: &str) -> Result<AppInfo> {
        *self.lookups.lock().unwrap() += 1;
        self.apps
            .lock()
            .unwrap()
            .get(name)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("app {name} not found"))
    }

    async fn set_update_platform(&self, app: &str, update: bool) -> Result<()> {
        self.update_platform
            .lock()
            .unwrap()
            .push((app.to_string(), update));
        Ok(())
    }

    async fn bind_unit(&self, _app: &str, unit: &Unit) -> Result<()> {
        self.bound.lock().unwrap().push(unit.clone());
        Ok(())
    }
}

#[derive(Clone, Default)]
pub struct FakeImages {
    pub current: Arc<Mutex<HashMap<String, String>>>,
    pub metadata: Arc<Mutex<HashMap<String, ImageMetadata>>>,
    pub custom_data: Arc<Mutex<HashMap<String, serde_json::Value>>>,
    pub next_version: Arc<Mutex<u32>>,
}

impl FakeImages {
    pub fn deployed(app: &str, image: &str, processes: &[(&str, &str)]) -> Self {
        let fake = Self::default();
        fake.current
            .lock()
            .unwrap()
            .insert(app.to_string(), image.to_string());
        fake.metadata.lock().unwrap().insert(
            image.to_string(),
            ImageMetadata {
                processes: processes
                    .iter()
                    .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
                    .collect(),
                healthcheck: None,
            },
        );
        fake
    }
}

impl ImageStore for FakeImages {
    async fn current_image(&self, app: &str) -> Result<Option<String>> {
        Ok(self.current.lock().unwrap().get(app).cloned())
    }

    async fn new_image_name(&self, app: &str) -> Result<String> {
        let mut v = self.next_version.lock().unwrap();
        *v += 1;
        Ok(format!("registry.example/app-{app}:v{}", *v))
    }

    async fn platform_image(&self, platform: &str) -> Result<String> {
        Ok(format!("convoy/{platform}:latest"))
    }

    async fn image_metadata(&self, image: &str) -> Result<ImageMetadata> {
        Ok(self
            .metadata
            .lock()
            .unwrap()
            .get(image)
            .cloned()
            .unwrap_or_default())
    }

    async fn save_image_metadata(&self, image: &str, meta: &ImageMetadata) -> Result<()> {
        self.metadata
            .lock()
            .unwrap()
            .insert(image.to_string(), meta.clone());
        Ok(())
    }

    async fn save_custom_data(&self, image: &str, data: &serde_json::Value) -> Result<()> {
        self.custom_data
            .lock()
            .unwrap()
            .insert(image.to_string(), data.clone());
        Ok(())
    }
}
