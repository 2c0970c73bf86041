//! Cluster membership: bootstrap, join, manager quorum and node removal.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::collections::BTreeMap;
use std::time::Duration;

use convoy_common::{Availability, NodeRole, keys};
use convoy_provisioner::application::ports::{
    BackendConnector, CredentialStore, MembershipStore, NodeCredentials,
};
use convoy_provisioner::application::services::membership::{
    AddNodeRequest, UpdateNodeRequest, add_node, redistribute_managers, remove_node, update_node,
};
use convoy_provisioner::domain::{EngineConfig, ProvisionError};
use convoy_provisioner::infra::memory::{InMemoryCredentialStore, InMemoryMembershipStore};

use crate::fake_cluster::{Fail, FakeConnector};

const FIRST: &str = "https://10.0.0.1:2376";
const SECOND: &str = "https://10.0.0.2:2376";

fn config() -> EngineConfig {
    EngineConfig {
        node_ready_timeout_secs: 10,
        ..EngineConfig::default()
    }
}

fn add_request(address: &str, pool: &str) -> AddNodeRequest {
    AddNodeRequest {
        address: address.to_string(),
        metadata: BTreeMap::from([("pool".to_string(), pool.to_string())]),
        credentials: None,
    }
}

fn managers(conn: &FakeConnector) -> usize {
    conn.state().nodes.iter().filter(|n| n.is_manager()).count()
}

// ── redistribute_managers ─────────────────────────────────────────────────────

#[tokio::test]
async fn promotion_is_capped_and_idempotent() {
    let conn = FakeConnector::new();
    {
        let mut st = conn.state();
        st.add_node("n1", "tcp://10.0.0.1:2376", NodeRole::Manager, None);
        for i in 2..=6 {
            st.add_node(&format!("n{i}"), &format!("tcp://10.0.0.{i}:2376"), NodeRole::Worker, None);
        }
    }
    let backend = conn.connect(FIRST).await.expect("connect");

    let promoted = redistribute_managers(&backend, 3).await.expect("redistribute");
    assert_eq!(promoted, 2);
    assert_eq!(managers(&conn), 3);

    let promoted = redistribute_managers(&backend, 3).await.expect("second run");
    assert_eq!(promoted, 0);
    assert_eq!(conn.state().count("update_node"), 2);
}

#[tokio::test]
async fn nodes_without_address_do_not_count_towards_quorum() {
    let conn = FakeConnector::new();
    {
        let mut st = conn.state();
        st.add_node("n1", "tcp://10.0.0.1:2376", NodeRole::Worker, None);
        st.add_node("n2", "tcp://10.0.0.2:2376", NodeRole::Worker, None);
        st.nodes[1].address = None;
    }
    let backend = conn.connect(FIRST).await.expect("connect");

    let promoted = redistribute_managers(&backend, 7).await.expect("redistribute");

    assert_eq!(promoted, 1);
    let st = conn.state();
    assert!(st.nodes[0].is_manager());
    assert!(!st.nodes[1].is_manager());
}

// ── add_node ──────────────────────────────────────────────────────────────────

#[tokio::test]
async fn first_node_bootstraps_the_cluster() {
    let conn = FakeConnector::new();
    let creds = InMemoryCredentialStore::default();
    let members = InMemoryMembershipStore::default();
    let tls = NodeCredentials {
        ca_pem: b"ca".to_vec(),
        cert_pem: b"cert".to_vec(),
        key_pem: b"key".to_vec(),
    };
    let req = AddNodeRequest {
        credentials: Some(tls.clone()),
        ..add_request(FIRST, "pool1")
    };

    add_node(&conn, &creds, &members, &config(), &req)
        .await
        .expect("bootstrap");

    assert_eq!(members.member_addresses().await.unwrap(), vec![FIRST.to_string()]);
    assert_eq!(creds.node_credentials(FIRST).await.unwrap(), Some(tls));
    let st = conn.state();
    assert_eq!(st.count("init_cluster"), 1);
    assert_eq!(st.count("join_cluster"), 0);
    let node = &st.nodes[0];
    assert!(node.is_manager());
    assert_eq!(node.spec.labels.get(keys::NODE_ADDR), Some(FIRST));
    assert_eq!(node.pool(), Some("pool1"));
}

#[tokio::test]
async fn further_nodes_join_and_get_promoted() {
    let conn = FakeConnector::new();
    let creds = InMemoryCredentialStore::default();
    let members = InMemoryMembershipStore::default();
    add_node(&conn, &creds, &members, &config(), &add_request(FIRST, "pool1"))
        .await
        .expect("bootstrap");

    add_node(&conn, &creds, &members, &config(), &add_request(SECOND, "pool2"))
        .await
        .expect("join");

    let mut addresses = members.member_addresses().await.unwrap();
    addresses.sort();
    assert_eq!(addresses, vec![FIRST.to_string(), SECOND.to_string()]);
    assert_eq!(conn.state().count("join_cluster"), 1);
    assert_eq!(managers(&conn), 2);
}

#[tokio::test]
async fn node_already_in_a_cluster_is_still_labelled() {
    let conn = FakeConnector::new();
    conn.state().swarm_members.insert(FIRST.to_string());
    conn.state().node_ids.insert(FIRST.to_string(), "n1".into());
    conn.state().add_node("n1", "", NodeRole::Manager, None);
    let members = InMemoryMembershipStore::default();

    add_node(
        &conn,
        &InMemoryCredentialStore::default(),
        &members,
        &config(),
        &add_request(FIRST, "pool1"),
    )
    .await
    .expect("already member is fine");

    assert_eq!(conn.state().nodes[0].address.as_deref(), Some(FIRST));
    assert_eq!(members.member_addresses().await.unwrap(), vec![FIRST.to_string()]);
}

#[tokio::test(start_paused = true)]
async fn unreachable_node_times_out() {
    let conn = FakeConnector::new();
    conn.state().unreachable.insert(FIRST.to_string());

    let err = add_node(
        &conn,
        &InMemoryCredentialStore::default(),
        &InMemoryMembershipStore::default(),
        &config(),
        &add_request(FIRST, "pool1"),
    )
    .await
    .expect_err("never answers");

    assert!(
        matches!(err, ProvisionError::Timeout { after, .. } if after == Duration::from_secs(10))
    );
    assert_eq!(conn.state().count("init_cluster"), 0);
}

// ── remove_node ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn last_node_leaves_and_clears_members() {
    let conn = FakeConnector::new();
    conn.state().add_node("n1", FIRST, NodeRole::Manager, None);
    let members = InMemoryMembershipStore::with_members(vec![FIRST.to_string()]);
    let cluster = conn.connect(FIRST).await.expect("connect");

    remove_node(&conn, &cluster, &members, FIRST, false)
        .await
        .expect("leave");

    assert!(members.member_addresses().await.unwrap().is_empty());
    let st = conn.state();
    assert_eq!(st.count("leave_cluster"), 1);
    assert_eq!(st.count("remove_node"), 0);
}

#[tokio::test]
async fn removing_one_of_many_keeps_the_rest() {
    let conn = FakeConnector::new();
    {
        let mut st = conn.state();
        st.add_node("n1", FIRST, NodeRole::Manager, None);
        st.add_node("n2", SECOND, NodeRole::Worker, None);
    }
    let members =
        InMemoryMembershipStore::with_members(vec![FIRST.to_string(), SECOND.to_string()]);
    let cluster = conn.connect(FIRST).await.expect("connect");

    remove_node(&conn, &cluster, &members, SECOND, false)
        .await
        .expect("remove");

    assert_eq!(members.member_addresses().await.unwrap(), vec![FIRST.to_string()]);
    assert_eq!(conn.state().count("remove_node n2"), 1);
}

const API_ENDPOINT: &str = "https://10.0.0.100:6443";
const WORKER: &str = "10.0.0.7";

#[tokio::test]
async fn single_endpoint_cluster_node_is_deleted_not_left() {
    let conn = FakeConnector::new();
    {
        let mut st = conn.state();
        st.endpoint_registered = true;
        st.add_node("worker-1", WORKER, NodeRole::Worker, None);
    }
    let members = InMemoryMembershipStore::with_members(vec![API_ENDPOINT.to_string()]);
    let cluster = conn.connect(API_ENDPOINT).await.expect("connect");

    remove_node(&conn, &cluster, &members, WORKER, false)
        .await
        .expect("remove");

    assert_eq!(
        members.member_addresses().await.unwrap(),
        vec![API_ENDPOINT.to_string()]
    );
    let st = conn.state();
    assert_eq!(st.count("remove_node worker-1"), 1);
    assert_eq!(st.count("leave_cluster"), 0);
    assert!(st.nodes.is_empty());
}

#[tokio::test]
async fn removing_the_endpoint_unregisters_the_cluster() {
    let conn = FakeConnector::new();
    {
        let mut st = conn.state();
        st.endpoint_registered = true;
        st.add_node("worker-1", WORKER, NodeRole::Worker, None);
    }
    let members = InMemoryMembershipStore::with_members(vec![API_ENDPOINT.to_string()]);
    let cluster = conn.connect(API_ENDPOINT).await.expect("connect");

    remove_node(&conn, &cluster, &members, API_ENDPOINT, false)
        .await
        .expect("unregister");

    assert!(members.member_addresses().await.unwrap().is_empty());
    let st = conn.state();
    assert_eq!(st.count("remove_node"), 0);
    assert_eq!(st.nodes.len(), 1);
}

#[tokio::test]
async fn failed_eviction_aborts_the_drain() {
    let conn = FakeConnector::new();
    {
        let mut st = conn.state();
        st.add_node("n1", FIRST, NodeRole::Manager, None);
        st.add_node("n2", SECOND, NodeRole::Worker, None);
        st.services.insert(
            "myapp-web".into(),
            convoy_provisioner::domain::ServiceObject {
                id: "svc-web".into(),
                version: 1u64.into(),
                spec: convoy_provisioner::domain::ServiceSpec::default(),
                published_port: None,
            },
        );
        st.add_task("myapp-web", "n2", "ctr-1");
        st.add_task("myapp-web", "n2", "ctr-2");
        st.fail.insert("evict_instance", Fail::Api);
    }
    let members =
        InMemoryMembershipStore::with_members(vec![FIRST.to_string(), SECOND.to_string()]);
    let cluster = conn.connect(FIRST).await.expect("connect");

    let err = remove_node(&conn, &cluster, &members, SECOND, true)
        .await
        .expect_err("eviction fails");

    assert!(matches!(
        err,
        ProvisionError::Transport {
            operation: "evict instance",
            ..
        }
    ));
    let st = conn.state();
    assert_eq!(st.count("evict_instance"), 1);
    assert_eq!(st.count("remove_node"), 0);
    let drained = st.nodes.iter().find(|n| n.id == "n2").expect("node kept");
    assert_eq!(drained.spec.availability, Availability::Drain);
}

#[tokio::test]
async fn unknown_address_is_not_found() {
    let conn = FakeConnector::new();
    conn.state().add_node("n1", FIRST, NodeRole::Manager, None);
    let cluster = conn.connect(FIRST).await.expect("connect");

    let err = remove_node(
        &conn,
        &cluster,
        &InMemoryMembershipStore::default(),
        "https://10.9.9.9:2376",
        true,
    )
    .await
    .expect_err("unknown node");

    assert!(err.is_not_found());
}

// ── update_node ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn update_merges_metadata_and_sets_availability() {
    let conn = FakeConnector::new();
    conn.state().add_node("n1", FIRST, NodeRole::Manager, Some("pool1"));
    let backend = conn.connect(FIRST).await.expect("connect");

    let req = UpdateNodeRequest {
        address: FIRST.to_string(),
        metadata: BTreeMap::from([
            ("pool".to_string(), String::new()),
            ("zone".to_string(), "eu-1".to_string()),
        ]),
        availability: Some(Availability::Pause),
    };
    update_node(&backend, &req).await.expect("update");

    let st = conn.state();
    let node = &st.nodes[0];
    assert_eq!(node.pool(), None);
    assert_eq!(node.spec.labels.get("zone"), Some("eu-1"));
    assert_eq!(node.spec.labels.get(keys::NODE_ADDR), Some(FIRST));
    assert_eq!(node.spec.availability, Availability::Pause);
}
