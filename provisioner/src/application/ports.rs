//! Port trait definitions for the Application layer.
//!
//! Ports are the interfaces (contracts) that infrastructure must fulfill.
//! This file imports only from `crate::domain` and `convoy_common`.

use anyhow::Result;
use convoy_common::Unit;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::domain::{
    AppInfo, BackendError, ExecStatus, ImageMetadata, InstanceState, Node, NodeSpec,
    ProvisionError, RegistryAuth, ServiceObject, ServiceSpec, Task, TaskFilter, TtySize,
    VersionToken,
};

// ── Value Types ───────────────────────────────────────────────────────────────

/// Streams bound to an instance's stdio.
pub struct Stdio<'a> {
    pub stdin: Option<&'a mut (dyn AsyncRead + Unpin + Send)>,
    pub stdout: &'a mut (dyn AsyncWrite + Unpin + Send),
    /// `None` merges stderr into stdout.
    pub stderr: Option<&'a mut (dyn AsyncWrite + Unpin + Send)>,
}

impl<'a> Stdio<'a> {
    /// Output only, stderr merged into `out`.
    pub fn output(out: &'a mut (dyn AsyncWrite + Unpin + Send)) -> Self {
        Self {
            stdin: None,
            stdout: out,
            stderr: None,
        }
    }

    /// Borrow the same streams for one more session.
    pub fn reborrow(&mut self) -> Stdio<'_> {
        Stdio {
            stdin: self.stdin.as_deref_mut().map(|s| s as _),
            stdout: &mut *self.stdout,
            stderr: self.stderr.as_deref_mut().map(|s| s as _),
        }
    }
}

/// PEM-encoded TLS material for one node or cluster endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct NodeCredentials {
    pub ca_pem: Vec<u8>,
    pub cert_pem: Vec<u8>,
    pub key_pem: Vec<u8>,
}

/// Bootstrap request for the first node of a cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterInit {
    pub listen_addr: String,
    pub advertise_addr: String,
}

/// Join request for every further node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterJoin {
    pub listen_addr: String,
    pub advertise_addr: String,
    pub remote_addrs: Vec<String>,
    pub join_token: String,
}

// ── Collaborator Ports ────────────────────────────────────────────────────────

/// Application records owned by the control plane.
#[allow(async_fn_in_trait)]
pub trait AppRegistry {
    /// Look up an application by name.
    async fn get_app(&self, name: &str) -> Result<AppInfo>;
    /// Flag the app for a platform image update on its next deploy.
    async fn set_update_platform(&self, app: &str, update: bool) -> Result<()>;
    /// Record a unit as belonging to the app.
    async fn bind_unit(&self, app: &str, unit: &Unit) -> Result<()>;
}

/// Image names and per-image metadata.
#[allow(async_fn_in_trait)]
pub trait ImageStore {
    /// Image currently deployed for the app, `None` before the first deploy.
    async fn current_image(&self, app: &str) -> Result<Option<String>>;
    /// Name the next built image of the app will be pushed as.
    async fn new_image_name(&self, app: &str) -> Result<String>;
    /// Base image builds of `platform` run on.
    async fn platform_image(&self, platform: &str) -> Result<String>;
    /// Processes and health check declared by `image`.
    async fn image_metadata(&self, image: &str) -> Result<ImageMetadata>;
    /// Persist what a deploy learned about `image`.
    async fn save_image_metadata(&self, image: &str, meta: &ImageMetadata) -> Result<()>;
    /// Persist opaque data a unit reported for the image it built.
    async fn save_custom_data(&self, image: &str, data: &serde_json::Value) -> Result<()>;
}

/// TLS material per node address.
#[allow(async_fn_in_trait)]
pub trait CredentialStore {
    async fn node_credentials(&self, address: &str) -> Result<Option<NodeCredentials>>;
    async fn store_node_credentials(&self, address: &str, creds: &NodeCredentials) -> Result<()>;
}

/// Addresses of known cluster members.
#[allow(async_fn_in_trait)]
pub trait MembershipStore {
    async fn member_addresses(&self) -> Result<Vec<String>>;
    /// Replace the whole member list.
    async fn set_members(&self, addresses: &[String]) -> Result<()>;
    async fn clear(&self) -> Result<()>;
}

// ── Cluster Backend Ports ─────────────────────────────────────────────────────

/// Service objects: one per app process, build or isolated run.
#[allow(async_fn_in_trait)]
pub trait ServiceBackend {
    /// Create a service object; returns its backend ID.
    async fn create_service(&self, spec: &ServiceSpec) -> Result<String, BackendError>;
    /// Replace a stored spec, guarded by the version read alongside it.
    async fn update_service(
        &self,
        id: &str,
        version: &VersionToken,
        spec: &ServiceSpec,
    ) -> Result<(), BackendError>;
    /// Look up a service object by name or ID.
    async fn inspect_service(&self, name_or_id: &str) -> Result<ServiceObject, BackendError>;
    async fn remove_service(&self, name_or_id: &str) -> Result<(), BackendError>;
    async fn create_network(&self, name: &str) -> Result<(), BackendError>;
    async fn remove_network(&self, name: &str) -> Result<(), BackendError>;
}

/// Running instances and their images.
#[allow(async_fn_in_trait)]
pub trait InstanceBackend {
    async fn list_tasks(&self, filter: &TaskFilter) -> Result<Vec<Task>, BackendError>;
    async fn inspect_instance(&self, task: &Task) -> Result<InstanceState, BackendError>;
    /// Stream instance output until the stream closes.
    async fn attach_instance(&self, task: &Task, stdio: Stdio<'_>) -> Result<(), BackendError>;
    /// Block until the instance exits; returns its exit code.
    async fn wait_instance(&self, task: &Task) -> Result<i64, BackendError>;
    /// Snapshot the instance filesystem as `repo:tag`.
    async fn commit_instance(&self, task: &Task, repo: &str, tag: &str) -> Result<(), BackendError>;
    async fn tag_image(&self, source: &str, repo: &str, tag: &str) -> Result<(), BackendError>;
    async fn push_image(
        &self,
        repo: &str,
        tag: &str,
        auth: Option<&RegistryAuth>,
    ) -> Result<(), BackendError>;
}

/// Cluster nodes.
#[allow(async_fn_in_trait)]
pub trait NodeBackend {
    async fn list_nodes(&self) -> Result<Vec<Node>, BackendError>;
    async fn inspect_node(&self, id: &str) -> Result<Node, BackendError>;
    async fn update_node(
        &self,
        id: &str,
        version: &VersionToken,
        spec: &NodeSpec,
    ) -> Result<(), BackendError>;
    async fn remove_node(&self, id: &str, force: bool) -> Result<(), BackendError>;
    /// Move one instance off its (draining) node.
    async fn evict_instance(&self, task: &Task) -> Result<(), BackendError>;
}

/// Cluster bootstrap and membership, issued against one node.
#[allow(async_fn_in_trait)]
pub trait MembershipBackend {
    /// Address this client was opened for.
    fn endpoint(&self) -> &str;
    async fn ping(&self) -> Result<(), BackendError>;
    /// `AlreadyMember` when the node already belongs to a cluster.
    async fn init_cluster(&self, req: &ClusterInit) -> Result<(), BackendError>;
    /// Token workers join with.
    async fn join_token(&self) -> Result<String, BackendError>;
    /// Manager addresses known to this node.
    async fn manager_peers(&self) -> Result<Vec<String>, BackendError>;
    /// `AlreadyMember` when the node already belongs to a cluster.
    async fn join_cluster(&self, req: &ClusterJoin) -> Result<(), BackendError>;
    /// Cluster ID of the node this client talks to.
    async fn local_node_id(&self) -> Result<String, BackendError>;
    /// `Unsupported` where the cluster outlives its nodes.
    async fn leave_cluster(&self, force: bool) -> Result<(), BackendError>;

    /// Whether the membership records hold node addresses. When false they
    /// hold the cluster API endpoint, which no node removal touches.
    fn nodes_are_members(&self) -> bool {
        true
    }
}

/// Commands inside running instances.
#[allow(async_fn_in_trait)]
pub trait ExecBackend {
    /// Prepare an exec session; returns its ID.
    async fn create_exec(
        &self,
        task: &Task,
        cmd: &[String],
        tty: bool,
        attach_stdin: bool,
    ) -> Result<String, BackendError>;
    /// Run the session bound to `stdio` until its streams close.
    async fn start_exec(&self, exec_id: &str, tty: bool, stdio: Stdio<'_>)
    -> Result<(), BackendError>;
    async fn inspect_exec(&self, exec_id: &str) -> Result<ExecStatus, BackendError>;
    async fn resize_exec(&self, exec_id: &str, size: TtySize) -> Result<(), BackendError>;
}

/// Composite trait: any type implementing every backend sub-trait is a
/// `ClusterBackend`.
pub trait ClusterBackend:
    ServiceBackend + InstanceBackend + NodeBackend + MembershipBackend + ExecBackend
{
}

/// Blanket implementation: any type implementing every backend sub-trait is
/// a `ClusterBackend`.
impl<T> ClusterBackend for T where
    T: ServiceBackend + InstanceBackend + NodeBackend + MembershipBackend + ExecBackend
{
}

/// Opens authenticated, timeout-bounded clients to cluster endpoints.
#[allow(async_fn_in_trait)]
pub trait BackendConnector {
    type Backend: ClusterBackend;

    /// Client for the node or cluster endpoint at `address`.
    async fn connect(&self, address: &str) -> Result<Self::Backend, ProvisionError>;
}
