//! Service reconciliation: apply built specs to the backend.
//!
//! Create when absent, update in place with the stored version token when
//! present. No retries here: a stale token surfaces as `Conflict` for the
//! caller to retry.

use convoy_common::{ObjectKind, ProcessState};

use crate::application::ports::ServiceBackend;
use crate::domain::commands::process_command;
use crate::domain::{
    AppInfo, BackendError, BackendResultExt, EngineConfig, ImageMetadata, MultiError,
    ProvisionError, ServiceObject, ServiceSpec, SpecRequest, build_spec, service_name,
};

/// One process transition.
#[derive(Debug, Clone, Copy)]
pub struct DeployRequest<'a> {
    pub app: &'a AppInfo,
    pub process: &'a str,
    pub image: &'a str,
    pub meta: &'a ImageMetadata,
    pub state: ProcessState,
}

/// Stored object by name, `None` when absent.
///
/// # Errors
///
/// Returns `Transport` for any failure other than not-found.
pub async fn find_service(
    backend: &impl ServiceBackend,
    name: &str,
) -> Result<Option<ServiceObject>, ProvisionError> {
    match backend.inspect_service(name).await {
        Ok(service) => Ok(Some(service)),
        Err(BackendError::NotFound) => Ok(None),
        Err(e) => Err(e).op("inspect service", name),
    }
}

/// Bring one app process to the requested state.
///
/// # Errors
///
/// Returns `InvalidScale` before touching the backend when the increment
/// would go negative, `Conflict` when the stored spec changed underneath,
/// and `Transport` for other backend failures.
pub async fn deploy(
    backend: &impl ServiceBackend,
    config: &EngineConfig,
    req: &DeployRequest<'_>,
) -> Result<(), ProvisionError> {
    let name = service_name(&req.app.name, req.process, ObjectKind::Service);
    let existing = find_service(backend, &name).await?;
    let spec = build_spec(
        &SpecRequest {
            app: req.app,
            process: req.process,
            image: req.image,
            kind: ObjectKind::Service,
            state: req.state,
            command: process_command(req.meta, req.process)?,
            healthcheck: req.meta.healthcheck.as_ref(),
            build_image: None,
        },
        existing.as_ref().map(|s| &s.spec),
        config,
    )?;
    match existing {
        None => {
            let id = backend
                .create_service(&spec)
                .await
                .op("create service", &name)?;
            tracing::info!(service = %name, id = %id, replicas = spec.replicas, "service created");
        }
        Some(current) => {
            backend
                .update_service(&current.id, &current.version, &spec)
                .await
                .op("update service", &name)?;
            tracing::info!(service = %name, replicas = spec.replicas, "service updated");
        }
    }
    Ok(())
}

/// Delete one app process object. Absent objects count as removed.
///
/// # Errors
///
/// Returns `Transport` for any failure other than not-found.
pub async fn remove(
    backend: &impl ServiceBackend,
    app: &str,
    process: &str,
) -> Result<(), ProvisionError> {
    let name = service_name(app, process, ObjectKind::Service);
    remove_by_name(backend, &name).await
}

/// # Errors
///
/// Returns `Transport` for any failure other than not-found.
pub async fn remove_by_name(
    backend: &impl ServiceBackend,
    name: &str,
) -> Result<(), ProvisionError> {
    match backend.remove_service(name).await {
        Ok(()) => {
            tracing::info!(service = %name, "service removed");
            Ok(())
        }
        Err(BackendError::NotFound) => Ok(()),
        Err(e) => Err(e).op("remove service", name),
    }
}

/// Apply `state` to every process in `processes`, collecting failures.
///
/// # Errors
///
/// Returns every per-process failure once all processes were attempted.
pub async fn deploy_each(
    backend: &impl ServiceBackend,
    config: &EngineConfig,
    app: &AppInfo,
    image: &str,
    meta: &ImageMetadata,
    processes: &[&str],
    state: ProcessState,
) -> Result<(), ProvisionError> {
    let mut errors = MultiError::new();
    for &process in processes {
        let req = DeployRequest {
            app,
            process,
            image,
            meta,
            state,
        };
        if let Err(e) = deploy(backend, config, &req).await {
            tracing::warn!(app = %app.name, process = %process, error = %e, "process update failed");
            errors.push(e);
        }
    }
    errors.into_result()
}

/// Roll every process of a new image out. New processes start with one
/// replica, existing ones keep their counters, and processes the new image
/// dropped are removed.
///
/// # Errors
///
/// Returns every per-process failure once all processes were attempted.
pub async fn deploy_processes(
    backend: &impl ServiceBackend,
    config: &EngineConfig,
    app: &AppInfo,
    image: &str,
    meta: &ImageMetadata,
    previous: Option<&ImageMetadata>,
) -> Result<(), ProvisionError> {
    let mut errors = MultiError::new();
    for process in meta.processes.keys() {
        let name = service_name(&app.name, process, ObjectKind::Service);
        let state = match find_service(backend, &name).await {
            Ok(Some(_)) => ProcessState::default(),
            Ok(None) => ProcessState::start(),
            Err(e) => {
                errors.push(e);
                continue;
            }
        };
        let req = DeployRequest {
            app,
            process: process.as_str(),
            image,
            meta,
            state,
        };
        if let Err(e) = deploy(backend, config, &req).await {
            errors.push(e);
        }
    }
    if let Some(previous) = previous {
        for process in previous.processes.keys() {
            if meta.processes.contains_key(process) {
                continue;
            }
            if let Err(e) = remove(backend, &app.name, process).await {
                errors.push(e);
            }
        }
    }
    errors.into_result()
}

/// Create or update an arbitrary spec by name. With `placement_only`, an
/// existing object keeps everything but its placement constraints.
///
/// # Errors
///
/// Returns `Conflict` or `Transport` on backend failures.
pub async fn upsert_spec(
    backend: &impl ServiceBackend,
    spec: &ServiceSpec,
    placement_only: bool,
) -> Result<(), ProvisionError> {
    match find_service(backend, &spec.name).await? {
        None => {
            backend
                .create_service(spec)
                .await
                .op("create service", &spec.name)?;
        }
        Some(current) => {
            let next = if placement_only {
                ServiceSpec {
                    constraints: spec.constraints.clone(),
                    ..current.spec.clone()
                }
            } else {
                spec.clone()
            };
            backend
                .update_service(&current.id, &current.version, &next)
                .await
                .op("update service", &spec.name)?;
        }
    }
    Ok(())
}
