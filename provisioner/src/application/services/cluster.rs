//! Client selection: which endpoint an operation talks to.

use crate::application::ports::{BackendConnector, MembershipBackend, MembershipStore, NodeBackend};
use crate::domain::{BackendResultExt, PollSettings, ProvisionError};

/// Client for the cluster, through the first stored member that answers.
///
/// # Errors
///
/// Returns `BackendUnavailable` when no member is stored, or the last
/// connection failure when none answers.
pub async fn cluster_client<C: BackendConnector>(
    connector: &C,
    members: &impl MembershipStore,
) -> Result<C::Backend, ProvisionError> {
    let addresses = members.member_addresses().await?;
    let mut last_err = ProvisionError::BackendUnavailable;
    for address in &addresses {
        let client = match connector.connect(address).await {
            Ok(client) => client,
            Err(e) => {
                tracing::warn!(member = %address, error = %e, "cannot connect to cluster member");
                last_err = e;
                continue;
            }
        };
        match client.ping().await {
            Ok(()) => return Ok(client),
            Err(e) => {
                tracing::warn!(member = %address, error = %e, "cluster member not answering");
                last_err = ProvisionError::Transport {
                    operation: "ping",
                    object: address.clone(),
                    source: e,
                };
            }
        }
    }
    Err(last_err)
}

/// Client scoped to the node an instance runs on. Clusters registered by
/// their API endpoint reach every node through that endpoint.
///
/// # Errors
///
/// Returns `NotFound` when the node is gone or was never registered with an
/// address.
pub async fn node_client<C: BackendConnector>(
    connector: &C,
    cluster: &(impl NodeBackend + MembershipBackend),
    node_id: &str,
) -> Result<C::Backend, ProvisionError> {
    if !cluster.nodes_are_members() {
        return connector.connect(cluster.endpoint()).await;
    }
    let node = cluster
        .inspect_node(node_id)
        .await
        .op("inspect node", node_id)?;
    let address = node.address.ok_or_else(|| ProvisionError::NotFound {
        kind: "node address",
        name: node_id.to_string(),
    })?;
    connector.connect(&address).await
}

/// Poll `ping` until the endpoint answers.
///
/// # Errors
///
/// Returns `Timeout` once `poll.timeout` has elapsed without an answer.
pub async fn wait_ready(
    client: &impl MembershipBackend,
    address: &str,
    poll: PollSettings,
) -> Result<(), ProvisionError> {
    let ping_until_ok = async {
        loop {
            match client.ping().await {
                Ok(()) => return,
                Err(e) => tracing::debug!(node = %address, error = %e, "node not ready yet"),
            }
            tokio::time::sleep(poll.interval).await;
        }
    };
    tokio::select! {
        () = ping_until_ok => Ok(()),
        () = tokio::time::sleep(poll.timeout) => Err(ProvisionError::Timeout {
            what: format!("node {address} to answer"),
            after: poll.timeout,
        }),
    }
}
