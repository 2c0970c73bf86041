//! Ephemeral task runner: one-off service objects for builds and isolated
//! commands.
//!
//! `run_once` creates the object, waits for its single task, streams the
//! output and reports the exit code. It never deletes what it created:
//! the caller runs [`cleanup`] on every path, including timeouts.

use std::time::Duration;

use crate::application::ports::{
    BackendConnector, InstanceBackend, MembershipBackend, NodeBackend, ServiceBackend, Stdio,
};
use crate::application::services::cluster::node_client;
use crate::domain::net::split_image;
use crate::domain::{
    BackendResultExt, PollSettings, ProvisionError, RegistryAuth, RestartPolicy, ServiceSpec,
    Task, TaskFailure, TaskFilter,
};

/// Result of one ephemeral run.
#[derive(Debug)]
pub struct RunOutcome {
    /// Set as soon as the backend object exists, whatever happened next.
    pub service_id: Option<String>,
    pub result: Result<CompletedRun, ProvisionError>,
}

/// A run whose instance exited zero.
#[derive(Debug, Clone)]
pub struct CompletedRun {
    pub task: Task,
}

/// Run `spec` once to completion.
///
/// The spec is forced to a single replica with no restarts so a failing
/// command surfaces instead of retrying.
pub async fn run_once<C: BackendConnector>(
    connector: &C,
    cluster: &C::Backend,
    mut spec: ServiceSpec,
    stdio: Stdio<'_>,
    wait: PollSettings,
    attach_inspect_every: Duration,
) -> RunOutcome {
    spec.replicas = 1;
    spec.restart_policy = RestartPolicy::Never;

    let service_id = match cluster.create_service(&spec).await {
        Ok(id) => id,
        Err(e) => {
            return RunOutcome {
                service_id: None,
                result: Err(e).op("create service", &spec.name),
            };
        }
    };
    tracing::debug!(service = %spec.name, id = %service_id, "ephemeral service created");

    let result = async {
        let tasks = wait_for_tasks(cluster, &service_id, &spec.name, wait).await?;
        let task = tasks
            .into_iter()
            .next()
            .ok_or_else(|| ProvisionError::NotFound {
                kind: "task",
                name: spec.name.clone(),
            })?;
        let node = node_client(connector, cluster, &task.node_id).await?;
        let exit_code = attach_and_wait(&node, &task, stdio, attach_inspect_every).await?;
        if exit_code != 0 {
            return Err(ProvisionError::TaskFailed {
                object: spec.name.clone(),
                failure: TaskFailure::ExitCode(exit_code),
            });
        }
        Ok(CompletedRun { task })
    }
    .await;

    RunOutcome {
        service_id: Some(service_id),
        result,
    }
}

/// Remove an ephemeral object. Best-effort: failures are logged, never
/// returned.
pub async fn cleanup(backend: &impl ServiceBackend, service_id: Option<&str>) {
    let Some(id) = service_id else {
        return;
    };
    if let Err(e) = backend.remove_service(id).await {
        tracing::error!(service = %id, error = %e, "failed to remove ephemeral service");
    }
}

/// Poll the tasks of `service_id` until at least one is running or done.
///
/// # Errors
///
/// Returns `TaskFailed` as soon as a task is failed or rejected, carrying
/// its exit code when the container recorded one, and
/// `Timeout` after `poll.timeout`.
pub async fn wait_for_tasks(
    backend: &impl InstanceBackend,
    service_id: &str,
    name: &str,
    poll: PollSettings,
) -> Result<Vec<Task>, ProvisionError> {
    let filter = TaskFilter::for_service(service_id);
    let poll_tasks = async {
        loop {
            let tasks = backend
                .list_tasks(&filter)
                .await
                .op("list tasks", name)?;
            if let Some(failed) = tasks.iter().find(|t| t.state.is_failed()) {
                let failure = match failed.exit_code {
                    Some(code) if code != 0 => TaskFailure::ExitCode(code),
                    _ => TaskFailure::Status(failed.status_message()),
                };
                return Err(ProvisionError::TaskFailed {
                    object: name.to_string(),
                    failure,
                });
            }
            let started: Vec<Task> = tasks
                .into_iter()
                .filter(|t| t.state.has_started() || t.state == t.desired_state)
                .collect();
            if !started.is_empty() {
                return Ok(started);
            }
            tokio::time::sleep(poll.interval).await;
        }
    };
    tokio::select! {
        result = poll_tasks => result,
        () = tokio::time::sleep(poll.timeout) => Err(ProvisionError::Timeout {
            what: format!("tasks of {name}"),
            after: poll.timeout,
        }),
    }
}

/// Attach to an instance and wait for it to exit.
///
/// Attach can hang on some runtimes, so the instance is also inspected every
/// `inspect_every`; once it is seen stopped, its recorded exit code wins.
///
/// # Errors
///
/// Returns `Transport` when attach, wait or inspect fail.
pub async fn attach_and_wait(
    backend: &impl InstanceBackend,
    task: &Task,
    stdio: Stdio<'_>,
    inspect_every: Duration,
) -> Result<i64, ProvisionError> {
    let id = task.container_id.as_str();
    let attached = async {
        backend
            .attach_instance(task, stdio)
            .await
            .op("attach instance", id)?;
        backend.wait_instance(task).await.op("wait instance", id)
    };
    tokio::pin!(attached);
    loop {
        tokio::select! {
            result = &mut attached => return result,
            () = tokio::time::sleep(inspect_every) => {
                let state = backend
                    .inspect_instance(task)
                    .await
                    .op("inspect instance", id)?;
                if !state.running {
                    tracing::warn!(
                        instance = %id,
                        exit_code = state.exit_code,
                        "instance stopped while attach was still pending"
                    );
                    return Ok(state.exit_code);
                }
            }
        }
    }
}

/// Commit a finished build instance as `image` and push it when a registry
/// is configured.
///
/// # Errors
///
/// Returns `Transport` when commit or push fail.
pub async fn commit_push_build_image(
    node: &impl InstanceBackend,
    task: &Task,
    image: &str,
    registry: Option<&RegistryAuth>,
) -> Result<(), ProvisionError> {
    let (repo, tag) = split_image(image);
    node.commit_instance(task, repo, tag)
        .await
        .op("commit instance", &task.container_id)?;
    if let Some(auth) = registry {
        node.push_image(repo, tag, Some(auth))
            .await
            .op("push image", image)?;
        tracing::info!(image = %image, registry = %auth.address, "build image pushed");
    }
    Ok(())
}

/// Same node scope as the task, for the follow-up commit or exec.
///
/// # Errors
///
/// Returns `NotFound` when the task's node has no address.
pub async fn task_node<C: BackendConnector>(
    connector: &C,
    cluster: &(impl NodeBackend + MembershipBackend),
    task: &Task,
) -> Result<C::Backend, ProvisionError> {
    node_client(connector, cluster, &task.node_id).await
}
