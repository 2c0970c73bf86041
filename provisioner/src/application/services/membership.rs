//! Cluster membership: bootstrap, join, manager quorum, node removal and
//! node updates.
//!
//! Membership records are only ever replaced wholesale from the backend's
//! own node list, so concurrent control-plane instances converge on what
//! the cluster reports.

use std::collections::BTreeMap;

use convoy_common::{Availability, NodeRole, keys};

use crate::application::ports::{
    BackendConnector, ClusterBackend, ClusterInit, ClusterJoin, CredentialStore,
    InstanceBackend, MembershipBackend, MembershipStore, NodeBackend, NodeCredentials,
};
use crate::application::services::cluster::{cluster_client, wait_ready};
use crate::domain::net::url_to_host;
use crate::domain::{
    BackendError, BackendResultExt, EngineConfig, Node, ProvisionError, TaskFilter,
};

/// Request to add a node to the cluster.
#[derive(Debug, Clone, Default)]
pub struct AddNodeRequest {
    pub address: String,
    /// Platform metadata stamped on the node, e.g. `pool`.
    pub metadata: BTreeMap<String, String>,
    pub credentials: Option<NodeCredentials>,
}

/// Changes to an existing node.
#[derive(Debug, Clone, Default)]
pub struct UpdateNodeRequest {
    pub address: String,
    /// Empty value deletes the key, anything else upserts it.
    pub metadata: BTreeMap<String, String>,
    pub availability: Option<Availability>,
}

/// Initialize a new cluster rooted at `new_node`.
///
/// # Errors
///
/// Returns `Transport` unless the init succeeds or the node is already a
/// member.
pub async fn bootstrap(
    new_node: &impl MembershipBackend,
    config: &EngineConfig,
    address: &str,
) -> Result<(), ProvisionError> {
    let req = ClusterInit {
        listen_addr: format!("0.0.0.0:{}", config.swarm_port),
        advertise_addr: url_to_host(address),
    };
    match new_node.init_cluster(&req).await {
        Ok(()) => {
            tracing::info!(node = %address, "cluster initialized");
            Ok(())
        }
        Err(BackendError::AlreadyMember) => {
            tracing::info!(node = %address, "node already in a cluster");
            Ok(())
        }
        Err(e) => Err(e).op("init cluster", address),
    }
}

/// Join `new_node` as a worker through the managers `existing` knows.
///
/// # Errors
///
/// Returns `NotFound` when `existing` knows no manager, and `Transport`
/// for other backend failures.
pub async fn join(
    existing: &impl MembershipBackend,
    new_node: &impl MembershipBackend,
    config: &EngineConfig,
    address: &str,
) -> Result<(), ProvisionError> {
    let join_token = existing.join_token().await.op("read join token", address)?;
    let remote_addrs = existing
        .manager_peers()
        .await
        .op("list manager peers", address)?;
    if remote_addrs.is_empty() {
        return Err(ProvisionError::NotFound {
            kind: "cluster manager",
            name: address.to_string(),
        });
    }
    let req = ClusterJoin {
        listen_addr: format!("0.0.0.0:{}", config.swarm_port),
        advertise_addr: url_to_host(address),
        remote_addrs,
        join_token,
    };
    match new_node.join_cluster(&req).await {
        Ok(()) => tracing::info!(node = %address, "node joined cluster"),
        Err(BackendError::AlreadyMember) => {
            tracing::info!(node = %address, "node already in a cluster");
        }
        Err(e) => return Err(e).op("join cluster", address),
    }
    Ok(())
}

/// Nodes carrying the platform's address label.
///
/// # Errors
///
/// Returns `Transport` when listing fails.
pub async fn list_valid_nodes(backend: &impl NodeBackend) -> Result<Vec<Node>, ProvisionError> {
    let nodes = backend.list_nodes().await.op("list nodes", "cluster")?;
    Ok(nodes.into_iter().filter(Node::is_valid).collect())
}

/// Promote workers in list order until `min(valid nodes, cap)` managers
/// exist. Returns how many nodes were promoted.
///
/// # Errors
///
/// Returns the first failed promotion; earlier promotions stay applied.
pub async fn redistribute_managers(
    backend: &impl NodeBackend,
    cap: usize,
) -> Result<usize, ProvisionError> {
    let nodes = list_valid_nodes(backend).await?;
    let target = nodes.len().min(cap);
    let mut managers = nodes.iter().filter(|n| n.is_manager()).count();
    let mut promoted = 0;
    for node in &nodes {
        if managers >= target {
            break;
        }
        if node.is_manager() {
            continue;
        }
        let mut spec = node.spec.clone();
        spec.role = Some(NodeRole::Manager);
        backend
            .update_node(&node.id, &node.version, &spec)
            .await
            .op("promote node", &node.id)?;
        tracing::info!(node = %node.id, "node promoted to manager");
        managers += 1;
        promoted += 1;
    }
    Ok(promoted)
}

/// Valid node registered under `address`.
///
/// # Errors
///
/// Returns `NotFound` when no valid node has that address.
pub async fn find_node(backend: &impl NodeBackend, address: &str) -> Result<Node, ProvisionError> {
    list_valid_nodes(backend)
        .await?
        .into_iter()
        .find(|n| n.address.as_deref() == Some(address))
        .ok_or_else(|| ProvisionError::NotFound {
            kind: "node",
            name: address.to_string(),
        })
}

/// Add a node: store its credentials, wait for it, bootstrap or join, label
/// it and refresh the membership records.
///
/// # Errors
///
/// Returns `Timeout` when the node never answers, and any bootstrap, join or
/// labelling failure.
pub async fn add_node<C: BackendConnector>(
    connector: &C,
    credentials: &impl CredentialStore,
    members: &impl MembershipStore,
    config: &EngineConfig,
    req: &AddNodeRequest,
) -> Result<(), ProvisionError> {
    let address = req.address.as_str();
    if let Some(creds) = &req.credentials {
        credentials.store_node_credentials(address, creds).await?;
    }
    let new_node = connector.connect(address).await?;
    wait_ready(&new_node, address, config.node_ready()).await?;

    let existing = match cluster_client(connector, members).await {
        Ok(client) => Some(client),
        Err(ProvisionError::BackendUnavailable) => None,
        Err(e) => return Err(e),
    };
    match &existing {
        None => bootstrap(&new_node, config, address).await?,
        Some(cluster) => join(cluster, &new_node, config, address).await?,
    }

    let cluster = existing.as_ref().unwrap_or(&new_node);
    let node_id = new_node
        .local_node_id()
        .await
        .op("read node id", address)?;
    let node = cluster
        .inspect_node(&node_id)
        .await
        .op("inspect node", &node_id)?;
    let mut spec = node.spec.clone();
    spec.labels.set(keys::NODE_ADDR, address);
    for (k, v) in &req.metadata {
        spec.labels.set(k.as_str(), v.as_str());
    }
    cluster
        .update_node(&node.id, &node.version, &spec)
        .await
        .op("label node", &node.id)?;

    if existing.is_some() {
        redistribute_managers(cluster, config.max_managers).await?;
    }
    refresh_members(cluster, members).await?;
    tracing::info!(node = %address, id = %node_id, "node added");
    Ok(())
}

/// Register a Kubernetes API endpoint as the cluster's only member.
///
/// # Errors
///
/// Returns `Timeout` when the endpoint never answers.
pub async fn register_cluster_endpoint<C: BackendConnector>(
    connector: &C,
    credentials: &impl CredentialStore,
    members: &impl MembershipStore,
    config: &EngineConfig,
    req: &AddNodeRequest,
) -> Result<(), ProvisionError> {
    if let Some(creds) = &req.credentials {
        credentials
            .store_node_credentials(&req.address, creds)
            .await?;
    }
    let client = connector.connect(&req.address).await?;
    wait_ready(&client, &req.address, config.node_ready()).await?;
    members.set_members(std::slice::from_ref(&req.address)).await?;
    tracing::info!(endpoint = %req.address, "cluster endpoint registered");
    Ok(())
}

/// Remove a node, optionally draining it first.
///
/// The last member cannot remove itself, so it leaves the cluster and the
/// membership records are cleared instead. Clusters registered by their
/// API endpoint never leave: their nodes are deleted one by one.
///
/// # Errors
///
/// Returns `NotFound` for an unknown address, the first eviction failure
/// when draining, and `Transport` for other backend failures.
pub async fn remove_node<C: BackendConnector>(
    connector: &C,
    cluster: &C::Backend,
    members: &impl MembershipStore,
    address: &str,
    rebalance: bool,
) -> Result<(), ProvisionError> {
    if !cluster.nodes_are_members() {
        return remove_endpoint_node(cluster, members, address, rebalance).await;
    }

    let nodes = list_valid_nodes(cluster).await?;
    let node = nodes
        .iter()
        .find(|n| n.address.as_deref() == Some(address))
        .ok_or_else(|| ProvisionError::NotFound {
            kind: "node",
            name: address.to_string(),
        })?;

    if rebalance {
        drain(cluster, node).await?;
    }

    if nodes.len() == 1 {
        let client = connector.connect(address).await?;
        client.leave_cluster(true).await.op("leave cluster", address)?;
        members.clear().await?;
        tracing::info!(node = %address, "last node left the cluster");
        return Ok(());
    }

    cluster
        .remove_node(&node.id, true)
        .await
        .op("remove node", &node.id)?;
    let remaining: Vec<String> = nodes
        .iter()
        .filter(|n| n.id != node.id)
        .filter_map(|n| n.address.clone())
        .collect();
    members.set_members(&remaining).await?;
    tracing::info!(node = %address, "node removed");
    Ok(())
}

/// Removal on a cluster registered by its API endpoint. Removing the
/// endpoint itself unregisters the cluster; any other address is drained
/// and deleted, leaving the records alone.
async fn remove_endpoint_node<B: ClusterBackend>(
    cluster: &B,
    members: &impl MembershipStore,
    address: &str,
    rebalance: bool,
) -> Result<(), ProvisionError> {
    if members.member_addresses().await?.iter().any(|m| m == address) {
        members.clear().await?;
        tracing::info!(endpoint = %address, "cluster endpoint unregistered");
        return Ok(());
    }
    let nodes = list_valid_nodes(cluster).await?;
    let node = nodes
        .iter()
        .find(|n| n.address.as_deref() == Some(address))
        .ok_or_else(|| ProvisionError::NotFound {
            kind: "node",
            name: address.to_string(),
        })?;
    if rebalance {
        drain(cluster, node).await?;
    }
    cluster
        .remove_node(&node.id, true)
        .await
        .op("remove node", &node.id)?;
    tracing::info!(node = %address, "node removed");
    Ok(())
}

/// Mark a node draining, then evict its running instances one by one.
/// The first eviction failure aborts.
async fn drain<B: NodeBackend + InstanceBackend>(
    backend: &B,
    node: &Node,
) -> Result<(), ProvisionError> {
    let mut spec = node.spec.clone();
    spec.availability = Availability::Drain;
    backend
        .update_node(&node.id, &node.version, &spec)
        .await
        .op("drain node", &node.id)?;
    let tasks = backend
        .list_tasks(&TaskFilter::for_node(&node.id))
        .await
        .op("list tasks", &node.id)?;
    for task in tasks.iter().filter(|t| !t.desired_state.is_terminal_desire()) {
        backend
            .evict_instance(task)
            .await
            .op("evict instance", &task.id)?;
    }
    tracing::info!(node = %node.id, evicted = tasks.len(), "node drained");
    Ok(())
}

/// Toggle availability and merge metadata on a node.
///
/// # Errors
///
/// Returns `NotFound` for an unknown address and `Conflict` when the node
/// changed since it was read.
pub async fn update_node(
    backend: &impl NodeBackend,
    req: &UpdateNodeRequest,
) -> Result<(), ProvisionError> {
    let node = find_node(backend, &req.address).await?;
    let mut spec = node.spec.clone();
    for (k, v) in &req.metadata {
        if v.is_empty() {
            spec.labels.remove(k);
        } else {
            spec.labels.set(k.as_str(), v.as_str());
        }
    }
    if let Some(availability) = req.availability {
        spec.availability = availability;
    }
    backend
        .update_node(&node.id, &node.version, &spec)
        .await
        .op("update node", &node.id)
}

/// Replace the membership records with the cluster's valid node addresses.
///
/// # Errors
///
/// Returns `Transport` when listing fails.
pub async fn refresh_members(
    cluster: &impl ClusterBackend,
    members: &impl MembershipStore,
) -> Result<(), ProvisionError> {
    let addresses: Vec<String> = list_valid_nodes(cluster)
        .await?
        .into_iter()
        .filter_map(|n| n.address)
        .collect();
    members.set_members(&addresses).await?;
    Ok(())
}
