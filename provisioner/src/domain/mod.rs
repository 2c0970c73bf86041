//! Domain layer: pure types and logic.
//!
//! Nothing here performs I/O or imports from `crate::application` or
//! `crate::infra`.

pub mod app;
pub mod builder;
pub mod commands;
pub mod config;
pub mod error;
pub mod net;
pub mod sidecar;
pub mod spec;
pub mod status;
pub mod task;

pub use app::{AppInfo, ImageHealthcheck, ImageMetadata};
pub use builder::{SpecRequest, app_selector, build_spec, service_name};
pub use config::{BackendKind, EngineConfig, PollSettings, RegistryAuth};
pub use error::{BackendError, BackendResultExt, MultiError, ProvisionError, TaskFailure};
pub use sidecar::{PoolFilter, SidecarConfig, build_sidecar_spec, sidecar_service_name};
pub use spec::{
    BindMount, ConstraintOp, HealthCheck, PlacementConstraint, RestartPolicy, ServiceMode,
    ServiceObject, ServiceSpec, VersionToken,
};
pub use task::{
    ExecStatus, InstanceState, NativeState, Node, NodeSpec, PodPhase, SwarmTaskState, Task,
    TaskFilter, TtySize,
};
