//! Facade operations end to end against the in-memory cluster.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::collections::BTreeMap;

use convoy_common::{LabelSet, NodeRole, ObjectKind, keys};
use convoy_provisioner::application::ports::Stdio;
use convoy_provisioner::application::services::membership::AddNodeRequest;
use convoy_provisioner::domain::{
    AppInfo, BackendKind, EngineConfig, ImageMetadata, NativeState, PoolFilter, ProvisionError,
    ServiceObject, ServiceSpec, SidecarConfig, SwarmTaskState,
};
use convoy_provisioner::infra::memory::{InMemoryCredentialStore, InMemoryMembershipStore};
use convoy_provisioner::{Provisioner, ShellRequest};

use crate::fake_cluster::{Fail, FakeApps, FakeConnector, FakeImages};

const FIRST: &str = "https://10.0.0.1:2376";
const SECOND: &str = "https://10.0.0.2:2376";

type TestProvisioner = Provisioner<
    FakeConnector,
    FakeApps,
    FakeImages,
    InMemoryCredentialStore,
    InMemoryMembershipStore,
>;

struct Harness {
    conn: FakeConnector,
    apps: FakeApps,
    images: FakeImages,
    provisioner: TestProvisioner,
}

fn app() -> AppInfo {
    AppInfo {
        deploys: 1,
        ..AppInfo::new("myapp", "pool1", "python")
    }
}

fn harness(config: EngineConfig, members: &[&str], images: FakeImages) -> Harness {
    let conn = FakeConnector::new();
    let apps = FakeApps::with(&[app()]);
    let members = InMemoryMembershipStore::with_members(
        members.iter().map(|m| (*m).to_string()).collect(),
    );
    let provisioner = Provisioner::new(
        config,
        conn.clone(),
        apps.clone(),
        images.clone(),
        InMemoryCredentialStore::default(),
        members,
    );
    Harness {
        conn,
        apps,
        images,
        provisioner,
    }
}

/// Two-node cluster with `myapp` deployed as `web` and `worker`.
fn cluster(config: EngineConfig) -> Harness {
    let h = harness(
        config,
        &[FIRST],
        FakeImages::deployed("myapp", "img:v1", &[("web", "./server"), ("worker", "./jobs")]),
    );
    {
        let mut st = h.conn.state();
        st.add_node("n1", FIRST, NodeRole::Manager, Some("pool1"));
        st.add_node("n2", SECOND, NodeRole::Worker, Some("pool2"));
    }
    h
}

// ── Reads without a cluster ───────────────────────────────────────────────────

#[tokio::test]
async fn reads_without_cluster_are_empty() {
    let h = harness(EngineConfig::default(), &[], FakeImages::default());

    assert!(h.provisioner.units(&app()).await.expect("units").is_empty());
    assert!(h.provisioner.list_nodes(&[]).await.expect("nodes").is_empty());
    assert_eq!(h.conn.state().count("connect"), 0);
}

#[tokio::test]
async fn startup_message_without_nodes() {
    let h = harness(EngineConfig::default(), &[], FakeImages::default());

    let msg = h.provisioner.startup_message().await.expect("message");

    assert_eq!(
        msg,
        "swarm provisioner reports the following nodes:\n    No node available.\n"
    );
}

#[tokio::test]
async fn startup_message_lists_nodes() {
    let h = cluster(EngineConfig::default());

    let msg = h.provisioner.startup_message().await.expect("message");

    assert_eq!(
        msg,
        "swarm provisioner reports the following nodes:\n\
         \x20   Node: https://10.0.0.1:2376 [ready] [manager]\n\
         \x20   Node: https://10.0.0.2:2376 [ready] [worker]\n"
    );
}

#[tokio::test]
async fn unreachable_members_make_writes_fail() {
    let h = cluster(EngineConfig::default());
    h.conn.refuse(FIRST);

    let err = h.provisioner.start(&app(), "web").await.expect_err("no member answers");

    assert!(matches!(err, ProvisionError::Transport { operation: "connect", .. }));
}

// ── Units ─────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn add_and_remove_units_reconcile_replicas() {
    let h = cluster(EngineConfig::default());
    let app = app();

    h.provisioner.add_units(&app, 3, "web").await.expect("add");
    h.provisioner.remove_units(&app, 1, "web").await.expect("remove");
    let err = h
        .provisioner
        .remove_units(&app, 5, "web")
        .await
        .expect_err("below zero");

    assert!(matches!(err, ProvisionError::InvalidScale { current: 2, increment: -5 }));
    let st = h.conn.state();
    let web = st.service("myapp-web").expect("web");
    assert_eq!(web.spec.replicas, 2);
    assert_eq!(web.spec.image, "img:v1");
}

#[tokio::test]
async fn empty_process_applies_to_every_process() {
    let h = cluster(EngineConfig::default());

    h.provisioner.start(&app(), "").await.expect("start all");

    let st = h.conn.state();
    assert!(st.service("myapp-web").is_some());
    assert!(st.service("myapp-worker").is_some());
}

#[tokio::test]
async fn lifecycle_needs_a_deployed_image() {
    let h = harness(EngineConfig::default(), &[FIRST], FakeImages::default());

    let err = h.provisioner.stop(&app(), "web").await.expect_err("never deployed");

    assert!(err.is_not_found());
}

#[tokio::test]
async fn units_are_reported_per_running_task() {
    let h = cluster(EngineConfig::default());
    h.provisioner.start(&app(), "web").await.expect("start");
    {
        let mut st = h.conn.state();
        st.add_task("myapp-web", "n1", "ctr-1");
        st.add_task("myapp-web", "n2", "ctr-2");
    }

    let units = h.provisioner.units(&app()).await.expect("units");

    let mut ips: Vec<&str> = units.iter().map(|u| u.ip.as_str()).collect();
    ips.sort_unstable();
    assert_eq!(ips, vec!["10.0.0.1", "10.0.0.2"]);
    assert!(units.iter().all(|u| u.process_name == "web"));
}

#[tokio::test]
async fn routable_addresses_cover_pool_nodes() {
    let h = cluster(EngineConfig::default());
    h.conn.state().published_port = Some(30001);
    h.provisioner.start(&app(), "web").await.expect("start");

    let addresses = h
        .provisioner
        .routable_addresses(&app())
        .await
        .expect("addresses");

    assert_eq!(addresses, vec!["http://10.0.0.1:30001".to_string()]);
}

#[tokio::test]
async fn destroy_removes_processes_and_tolerates_missing_network() {
    let h = cluster(EngineConfig::default());
    h.provisioner.provision(&app()).await.expect("provision");
    h.provisioner.start(&app(), "").await.expect("start");
    h.conn.state().fail.insert("remove_network", Fail::NotFound);

    h.provisioner.destroy(&app()).await.expect("destroy");

    let st = h.conn.state();
    assert!(st.services.is_empty());
    assert_eq!(st.count("create_network app-myapp-overlay"), 1);
    assert_eq!(st.count("remove_network app-myapp-overlay"), 1);
}

// ── Register unit ─────────────────────────────────────────────────────────────

#[tokio::test]
async fn service_unit_is_bound_to_its_app() {
    let h = cluster(EngineConfig::default());
    h.provisioner.start(&app(), "web").await.expect("start");
    h.conn.state().add_task("myapp-web", "n1", "abcdef123456");

    h.provisioner
        .register_unit(&app(), "abcdef", None)
        .await
        .expect("register");

    let bound = h.apps.bound.lock().unwrap();
    assert_eq!(bound.len(), 1);
    assert_eq!(bound[0].id, "abcdef123456");
}

#[tokio::test]
async fn build_unit_stores_custom_data_for_its_image() {
    let h = cluster(EngineConfig::default());
    {
        let mut st = h.conn.state();
        let labels = convoy_common::ServiceLabels {
            kind: ObjectKind::Build,
            app: "myapp",
            build_image: Some("registry.example/app-myapp:v2"),
            ..Default::default()
        }
        .to_label_set();
        st.services.insert(
            "myapp-build".into(),
            ServiceObject {
                id: "svc-build".into(),
                version: 1u64.into(),
                spec: ServiceSpec {
                    name: "myapp-build".into(),
                    labels,
                    ..ServiceSpec::default()
                },
                published_port: None,
            },
        );
        st.add_task("myapp-build", "n1", "build123");
    }
    let data = serde_json::json!({"procfile": "web: ./server"});

    h.provisioner
        .register_unit(&app(), "build123", Some(&data))
        .await
        .expect("register");

    let saved = h.images.custom_data.lock().unwrap();
    assert_eq!(saved.get("registry.example/app-myapp:v2"), Some(&data));
    assert!(h.apps.bound.lock().unwrap().is_empty());
}

#[tokio::test]
async fn unknown_unit_is_reported() {
    let h = cluster(EngineConfig::default());

    let err = h
        .provisioner
        .register_unit(&app(), "nope", None)
        .await
        .expect_err("unknown");

    assert!(matches!(err, ProvisionError::UnitNotFound(ref id) if id == "nope"));
}

// ── Deploys ───────────────────────────────────────────────────────────────────

#[tokio::test]
async fn image_deploy_reads_procfile_retags_and_rolls_out() {
    let h = harness(EngineConfig::default(), &[FIRST], FakeImages::default());
    {
        let mut st = h.conn.state();
        st.add_node("n1", FIRST, NodeRole::Manager, Some("pool1"));
        st.spawn_state = Some(NativeState::Swarm(SwarmTaskState::Running));
        st.instance_output = b"web: ./server\nworker: ./jobs\n".to_vec();
    }

    let mut out = Vec::new();
    let image = h
        .provisioner
        .image_deploy(&app(), "myorg/myimage", &mut out)
        .await
        .expect("deploy");

    assert_eq!(image, "registry.example/app-myapp:v1");
    let log = String::from_utf8(out).unwrap();
    assert!(log.contains("    web: ./server"), "log was {log}");
    let meta = h.images.metadata.lock().unwrap().get(&image).cloned().expect("saved");
    assert_eq!(meta.processes.len(), 2);
    assert_eq!(
        *h.apps.update_platform.lock().unwrap(),
        vec![("myapp".to_string(), true)]
    );
    let st = h.conn.state();
    assert_eq!(
        st.count("tag_image myorg/myimage:latest registry.example/app-myapp:v1"),
        1
    );
    assert_eq!(st.count("push_image"), 0);
    assert!(st.service("myapp-build").is_none());
    assert_eq!(st.service("myapp-web").expect("web").spec.image, image);
    assert_eq!(st.service("myapp-worker").expect("worker").spec.replicas, 1);
}

#[tokio::test]
async fn image_without_processes_is_rejected() {
    let h = harness(EngineConfig::default(), &[FIRST], FakeImages::default());
    {
        let mut st = h.conn.state();
        st.add_node("n1", FIRST, NodeRole::Manager, None);
        st.spawn_state = Some(NativeState::Swarm(SwarmTaskState::Running));
        st.instance_output = b"# nothing here\n".to_vec();
    }

    let mut out = Vec::new();
    let err = h
        .provisioner
        .image_deploy(&app(), "myorg/myimage:v9", &mut out)
        .await
        .expect_err("no processes");

    assert!(matches!(err, ProvisionError::InvalidSpec(_)));
    assert_eq!(h.conn.state().count("tag_image"), 0);
}

#[tokio::test]
async fn archive_deploy_builds_commits_and_pushes() {
    let config = EngineConfig {
        registry: Some("registry.example".into()),
        ..EngineConfig::default()
    };
    let h = cluster(config);
    h.conn.state().spawn_state = Some(NativeState::Swarm(SwarmTaskState::Running));
    h.images.metadata.lock().unwrap().insert(
        "registry.example/app-myapp:v1".into(),
        ImageMetadata {
            processes: BTreeMap::from([("web".to_string(), "./server".to_string())]),
            healthcheck: None,
        },
    );

    let mut out = Vec::new();
    let image = h
        .provisioner
        .archive_deploy(&app(), "https://files.example/myapp.tar.gz", &mut out)
        .await
        .expect("deploy");

    let st = h.conn.state();
    assert_eq!(st.count("commit_instance"), 1);
    assert_eq!(st.count("push_image registry.example/app-myapp:v1"), 1);
    assert!(st.service("myapp-build").is_none());
    assert_eq!(st.service("myapp-web").expect("web").spec.image, image);
}

#[tokio::test]
async fn failed_build_is_cleaned_up_and_not_deployed() {
    let h = cluster(EngineConfig::default());
    {
        let mut st = h.conn.state();
        st.spawn_state = Some(NativeState::Swarm(SwarmTaskState::Running));
        st.instance_exit = 1;
    }

    let mut out = Vec::new();
    let err = h
        .provisioner
        .archive_deploy(&app(), "https://files.example/myapp.tar.gz", &mut out)
        .await
        .expect_err("build fails");

    assert_eq!(err.exit_code(), Some(1));
    let st = h.conn.state();
    assert_eq!(st.count("commit_instance"), 0);
    assert_eq!(st.count("remove_service"), 1);
    assert!(st.services.is_empty());
}

#[tokio::test]
async fn upload_deploy_streams_the_archive_into_the_build() {
    let h = cluster(EngineConfig::default());
    h.conn.state().spawn_state = Some(NativeState::Swarm(SwarmTaskState::Running));

    let mut archive: &[u8] = b"tarball-bytes";
    let mut out = Vec::new();
    h.provisioner
        .upload_deploy(&app(), &mut archive, false, &mut out)
        .await
        .expect("deploy");

    assert_eq!(h.conn.state().stdin_seen, b"tarball-bytes");
}

#[tokio::test]
async fn upload_deploy_with_build_is_unsupported() {
    let h = cluster(EngineConfig::default());

    let mut archive: &[u8] = b"";
    let mut out = Vec::new();
    let err = h
        .provisioner
        .upload_deploy(&app(), &mut archive, true, &mut out)
        .await
        .expect_err("unsupported");

    assert!(matches!(err, ProvisionError::Unsupported { .. }));
}

// ── Commands ──────────────────────────────────────────────────────────────────

fn running_web(h: &Harness) {
    let mut st = h.conn.state();
    st.add_task("myapp-web", "n1", "ctr-1");
    st.add_task("myapp-web", "n2", "ctr-2");
}

#[tokio::test]
async fn command_runs_in_every_unit() {
    let h = cluster(EngineConfig::default());
    h.provisioner.start(&app(), "web").await.expect("start");
    running_web(&h);

    let mut out = Vec::new();
    h.provisioner
        .execute_command(&app(), Stdio::output(&mut out), "ls", &["-la".to_string()])
        .await
        .expect("exec");

    let st = h.conn.state();
    assert_eq!(st.count("create_exec ctr-1 tty=false /bin/sh -lc ls -la"), 1);
    assert_eq!(st.count("create_exec ctr-2 tty=false /bin/sh -lc ls -la"), 1);
}

#[tokio::test]
async fn command_stops_at_first_failure() {
    let h = cluster(EngineConfig::default());
    h.provisioner.start(&app(), "web").await.expect("start");
    running_web(&h);
    h.conn.state().exec_exit = 1;

    let mut out = Vec::new();
    let err = h
        .provisioner
        .execute_command(&app(), Stdio::output(&mut out), "false", &[])
        .await
        .expect_err("fails");

    assert_eq!(err.exit_code(), Some(1));
    assert_eq!(h.conn.state().count("create_exec"), 1);
}

#[tokio::test]
async fn command_without_units_is_empty_app() {
    let h = cluster(EngineConfig::default());

    let mut out = Vec::new();
    let err = h
        .provisioner
        .execute_command_once(&app(), Stdio::output(&mut out), "ls", &[])
        .await
        .expect_err("nothing runs");

    assert!(matches!(err, ProvisionError::EmptyApp(ref name) if name == "myapp"));
}

#[tokio::test]
async fn isolated_command_needs_a_deploy() {
    let h = cluster(EngineConfig::default());
    let fresh = AppInfo::new("myapp", "pool1", "python");

    let mut out = Vec::new();
    let err = h
        .provisioner
        .execute_command_isolated(&fresh, Stdio::output(&mut out), "make", &[])
        .await
        .expect_err("never deployed");

    assert!(err.is_not_found());
    assert_eq!(h.conn.state().count("create_service"), 0);
}

#[tokio::test]
async fn isolated_command_runs_once_and_cleans_up() {
    let h = cluster(EngineConfig::default());
    {
        let mut st = h.conn.state();
        st.spawn_state = Some(NativeState::Swarm(SwarmTaskState::Running));
        st.instance_output = b"done\n".to_vec();
    }

    let mut out = Vec::new();
    h.provisioner
        .execute_command_isolated(&app(), Stdio::output(&mut out), "make", &["migrate".into()])
        .await
        .expect("run");

    assert_eq!(out, b"done\n");
    let st = h.conn.state();
    assert_eq!(st.count("create_service myapp-isolated-run"), 1);
    assert!(st.service("myapp-isolated-run").is_none());
}

#[tokio::test]
async fn shell_into_unknown_unit_fails() {
    let h = cluster(EngineConfig::default());
    h.provisioner.start(&app(), "web").await.expect("start");
    running_web(&h);

    let mut out = Vec::new();
    let err = h
        .provisioner
        .shell(
            &app(),
            ShellRequest {
                unit: Some("zzz"),
                term: "xterm",
                size: None,
                stdio: Stdio::output(&mut out),
            },
        )
        .await
        .expect_err("unknown unit");

    assert!(matches!(err, ProvisionError::UnitNotFound(_)));
}

#[tokio::test]
async fn shell_opens_a_login_shell_in_the_chosen_unit() {
    let h = cluster(EngineConfig::default());
    h.provisioner.start(&app(), "web").await.expect("start");
    running_web(&h);

    let mut out = Vec::new();
    h.provisioner
        .shell(
            &app(),
            ShellRequest {
                unit: Some("ctr-2"),
                term: "xterm",
                size: None,
                stdio: Stdio::output(&mut out),
            },
        )
        .await
        .expect("shell");

    assert_eq!(
        h.conn
            .state()
            .count("create_exec ctr-2 tty=true /usr/bin/env TERM=xterm bash -l"),
        1
    );
}

// ── Nodes ─────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn kubernetes_accepts_only_the_cluster_endpoint() {
    let config = EngineConfig {
        backend: BackendKind::Kubernetes,
        ..EngineConfig::default()
    };
    let h = harness(config, &[], FakeImages::default());

    let err = h
        .provisioner
        .add_node(&AddNodeRequest {
            address: FIRST.into(),
            ..AddNodeRequest::default()
        })
        .await
        .expect_err("plain node");
    assert!(matches!(err, ProvisionError::Unsupported { backend: "kubernetes", .. }));

    h.provisioner
        .add_node(&AddNodeRequest {
            address: FIRST.into(),
            metadata: BTreeMap::from([("cluster".to_string(), "true".to_string())]),
            credentials: None,
        })
        .await
        .expect("cluster endpoint");
    assert_eq!(h.conn.state().count("init_cluster"), 0);
}

#[tokio::test]
async fn node_lookup_by_instance_then_address() {
    let h = cluster(EngineConfig::default());
    h.provisioner.start(&app(), "web").await.expect("start");
    running_web(&h);

    let by_instance = h
        .provisioner
        .node_for_instances(&["ctr-2".to_string()], &[])
        .await
        .expect("by instance");
    assert_eq!(by_instance.id, "n2");

    let by_address = h
        .provisioner
        .node_for_instances(&["gone".to_string()], &[SECOND.to_string()])
        .await
        .expect("by address");
    assert_eq!(by_address.id, "n2");

    let err = h
        .provisioner
        .node_for_instances(&[], &["https://10.9.9.9:2376".to_string()])
        .await
        .expect_err("nothing matches");
    assert!(err.is_not_found());
}

#[tokio::test]
async fn list_and_get_nodes_filter_by_address() {
    let h = cluster(EngineConfig::default());

    let nodes = h
        .provisioner
        .list_nodes(&[SECOND.to_string()])
        .await
        .expect("list");
    assert_eq!(nodes.len(), 1);
    assert_eq!(nodes[0].pool(), Some("pool2"));

    let node = h.provisioner.get_node(FIRST).await.expect("get");
    assert!(node.is_manager());
}

#[tokio::test]
async fn removing_a_node_refreshes_members() {
    let h = cluster(EngineConfig::default());

    h.provisioner.remove_node(SECOND, false).await.expect("remove");

    assert_eq!(h.conn.state().nodes.len(), 1);
}

// ── Sidecars ──────────────────────────────────────────────────────────────────

#[tokio::test]
async fn sidecar_gets_one_object_per_pool_scope() {
    let h = cluster(EngineConfig::default());
    let sidecar = SidecarConfig {
        name: "agent".into(),
        image: "convoy/agent:v1".into(),
        labels: LabelSet::new(),
        ..SidecarConfig::default()
    };
    let filter = PoolFilter {
        include: vec!["pool1".into(), "pool2".into()],
        exclude: Vec::new(),
    };

    h.provisioner
        .upgrade_sidecar(&sidecar, &filter, false)
        .await
        .expect("upgrade");
    h.provisioner
        .remove_sidecar("agent", "pool1")
        .await
        .expect("remove");

    let st = h.conn.state();
    assert!(st.service("node-container-agent-pool1").is_none());
    let pool2 = st.service("node-container-agent-pool2").expect("pool2 scope");
    assert_eq!(pool2.spec.labels.get(keys::NODE_CONTAINER_POOL), Some("pool2"));
}

#[tokio::test]
async fn sidecar_calls_without_cluster_are_no_ops() {
    let h = harness(EngineConfig::default(), &[], FakeImages::default());
    let sidecar = SidecarConfig {
        name: "agent".into(),
        image: "convoy/agent:v1".into(),
        ..SidecarConfig::default()
    };

    h.provisioner
        .upgrade_sidecar(&sidecar, &PoolFilter::default(), false)
        .await
        .expect("no-op");
    h.provisioner
        .remove_sidecar("agent", "")
        .await
        .expect("no-op");
}
