//! Tasks to canonical units.

use std::collections::HashMap;

use convoy_common::Unit;

use crate::application::ports::{AppRegistry, NodeBackend, ServiceBackend};
use crate::domain::net::url_to_host;
use crate::domain::{AppInfo, BackendResultExt, Node, ProvisionError, ServiceObject, Task};

/// Lookups made while translating one batch. Each distinct node, service or
/// app is fetched at most once per batch.
#[derive(Default)]
struct LookupCache {
    nodes: HashMap<String, Node>,
    services: HashMap<String, ServiceObject>,
    apps: HashMap<String, AppInfo>,
}

/// Translate app tasks into units.
///
/// Skipped: tasks of anything but a long-running app service, tasks the
/// scheduler is already shutting down, and tasks not yet bound to a node
/// or service.
///
/// # Errors
///
/// Returns the first failed node, service or app lookup.
pub async fn tasks_to_units<B: ServiceBackend + NodeBackend>(
    backend: &B,
    apps: &impl AppRegistry,
    tasks: &[Task],
) -> Result<Vec<Unit>, ProvisionError> {
    let mut cache = LookupCache::default();
    let mut units = Vec::with_capacity(tasks.len());
    for task in tasks {
        if !task.labels.is_service()
            || task.desired_state.is_terminal_desire()
            || task.node_id.is_empty()
            || task.service_id.is_empty()
        {
            continue;
        }
        let Some(app_name) = task.labels.app_name() else {
            continue;
        };

        if !cache.nodes.contains_key(&task.node_id) {
            let node = backend
                .inspect_node(&task.node_id)
                .await
                .op("inspect node", &task.node_id)?;
            cache.nodes.insert(task.node_id.clone(), node);
        }
        if !cache.services.contains_key(&task.service_id) {
            let service = backend
                .inspect_service(&task.service_id)
                .await
                .op("inspect service", &task.service_id)?;
            cache.services.insert(task.service_id.clone(), service);
        }
        if !cache.apps.contains_key(app_name) {
            let app = apps.get_app(app_name).await?;
            cache.apps.insert(app_name.to_string(), app);
        }

        let node = &cache.nodes[&task.node_id];
        let service = &cache.services[&task.service_id];
        let app = &cache.apps[app_name];
        units.push(task_to_unit(task, node, service, app));
    }
    Ok(units)
}

fn task_to_unit(task: &Task, node: &Node, service: &ServiceObject, app: &AppInfo) -> Unit {
    let ip = node.address.as_deref().map(url_to_host).unwrap_or_default();
    let address = service
        .published_port
        .filter(|_| !ip.is_empty())
        .map(|port| format!("http://{ip}:{port}"));
    Unit {
        id: if task.container_id.is_empty() {
            task.id.clone()
        } else {
            task.container_id.clone()
        },
        app_name: app.name.clone(),
        process_name: task.labels.process().unwrap_or_default().to_string(),
        platform: app.platform.clone(),
        ip,
        status: task.state.unit_status(),
        address,
    }
}

/// First task whose container ID starts with `instance_id`.
#[must_use]
pub fn find_task_by_container_id<'a>(tasks: &'a [Task], instance_id: &str) -> Option<&'a Task> {
    tasks.iter().find(|t| t.matches_instance_id(instance_id))
}
