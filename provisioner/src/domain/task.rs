//! Instances and nodes as observed from a backend.

use convoy_common::{Availability, LabelSet, NodeRole};

use super::spec::VersionToken;

/// Swarm task state, in scheduler order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SwarmTaskState {
    New,
    Allocated,
    Pending,
    Assigned,
    Accepted,
    Preparing,
    Ready,
    Starting,
    Running,
    Complete,
    Shutdown,
    Failed,
    Rejected,
    Remove,
    Orphaned,
}

impl SwarmTaskState {
    /// Parse the lowercase state name the Engine API reports.
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "new" => Self::New,
            "allocated" => Self::Allocated,
            "pending" => Self::Pending,
            "assigned" => Self::Assigned,
            "accepted" => Self::Accepted,
            "preparing" => Self::Preparing,
            "ready" => Self::Ready,
            "starting" => Self::Starting,
            "running" => Self::Running,
            "complete" => Self::Complete,
            "shutdown" => Self::Shutdown,
            "failed" => Self::Failed,
            "rejected" => Self::Rejected,
            "remove" => Self::Remove,
            "orphaned" => Self::Orphaned,
            _ => return None,
        })
    }
}

/// Kubernetes pod phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PodPhase {
    Pending,
    Running,
    Succeeded,
    Failed,
    Unknown,
}

impl PodPhase {
    /// Unknown phases collapse to [`PodPhase::Unknown`].
    #[must_use]
    pub fn from_name(name: &str) -> Self {
        match name {
            "Pending" => Self::Pending,
            "Running" => Self::Running,
            "Succeeded" => Self::Succeeded,
            "Failed" => Self::Failed,
            _ => Self::Unknown,
        }
    }
}

/// Backend-native state of an instance. The unit status tables in
/// `domain::status` are the only place that interprets it per backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NativeState {
    Swarm(SwarmTaskState),
    Pod(PodPhase),
}

impl NativeState {
    /// The backend gave up on this instance.
    #[must_use]
    pub fn is_failed(self) -> bool {
        matches!(
            self,
            NativeState::Swarm(SwarmTaskState::Failed | SwarmTaskState::Rejected)
                | NativeState::Pod(PodPhase::Failed)
        )
    }

    /// The instance is running or has already run to completion.
    #[must_use]
    pub fn has_started(self) -> bool {
        matches!(
            self,
            NativeState::Swarm(
                SwarmTaskState::Running | SwarmTaskState::Complete | SwarmTaskState::Shutdown
            ) | NativeState::Pod(PodPhase::Running | PodPhase::Succeeded)
        )
    }

    /// As a desired state: the scheduler wants the instance gone.
    #[must_use]
    pub fn is_terminal_desire(self) -> bool {
        matches!(
            self,
            NativeState::Swarm(
                SwarmTaskState::Shutdown | SwarmTaskState::Remove | SwarmTaskState::Complete
            ) | NativeState::Pod(PodPhase::Succeeded | PodPhase::Failed)
        )
    }

    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            NativeState::Swarm(s) => match s {
                SwarmTaskState::New => "new",
                SwarmTaskState::Allocated => "allocated",
                SwarmTaskState::Pending => "pending",
                SwarmTaskState::Assigned => "assigned",
                SwarmTaskState::Accepted => "accepted",
                SwarmTaskState::Preparing => "preparing",
                SwarmTaskState::Ready => "ready",
                SwarmTaskState::Starting => "starting",
                SwarmTaskState::Running => "running",
                SwarmTaskState::Complete => "complete",
                SwarmTaskState::Shutdown => "shutdown",
                SwarmTaskState::Failed => "failed",
                SwarmTaskState::Rejected => "rejected",
                SwarmTaskState::Remove => "remove",
                SwarmTaskState::Orphaned => "orphaned",
            },
            NativeState::Pod(p) => match p {
                PodPhase::Pending => "Pending",
                PodPhase::Running => "Running",
                PodPhase::Succeeded => "Succeeded",
                PodPhase::Failed => "Failed",
                PodPhase::Unknown => "Unknown",
            },
        }
    }
}

/// One scheduled instance of a service object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Task {
    pub id: String,
    pub service_id: String,
    pub node_id: String,
    /// Empty until the runtime has created the container.
    pub container_id: String,
    pub state: NativeState,
    pub desired_state: NativeState,
    pub message: String,
    pub error: String,
    pub exit_code: Option<i64>,
    /// Labels of the service object the task was created from.
    pub labels: LabelSet,
}

impl Task {
    /// Last status of the task, for failure reports.
    #[must_use]
    pub fn status_message(&self) -> String {
        format!(
            "state: {:?}, err: {:?}, msg: {:?}, container exit: {}",
            self.state.name(),
            self.error,
            self.message,
            self.exit_code.unwrap_or(0)
        )
    }

    /// Short-ID lookup: the caller may hand in any prefix of the
    /// container ID.
    #[must_use]
    pub fn matches_instance_id(&self, instance_id: &str) -> bool {
        !instance_id.is_empty() && self.container_id.starts_with(instance_id)
    }
}

/// Which tasks to list. Empty fields do not filter.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskFilter {
    pub service: Option<String>,
    pub node: Option<String>,
    pub labels: LabelSet,
}

impl TaskFilter {
    #[must_use]
    pub fn for_service(service_id: &str) -> Self {
        Self {
            service: Some(service_id.to_string()),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn for_node(node_id: &str) -> Self {
        Self {
            node: Some(node_id.to_string()),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_labels(labels: LabelSet) -> Self {
        Self {
            labels,
            ..Self::default()
        }
    }
}

/// Container runtime state read by inspecting an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InstanceState {
    pub running: bool,
    pub exit_code: i64,
}

/// Exec session state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecStatus {
    pub running: bool,
    pub exit_code: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TtySize {
    pub width: u16,
    pub height: u16,
}

/// Writable part of a node object.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct NodeSpec {
    /// `None` on backends without a manager/worker split.
    pub role: Option<NodeRole>,
    pub availability: Availability,
    pub labels: LabelSet,
}

/// A cluster member.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    pub id: String,
    pub version: VersionToken,
    pub spec: NodeSpec,
    /// Address the platform knows the node by. Nodes without one are still
    /// being provisioned.
    pub address: Option<String>,
    /// Backend health string, e.g. `ready` or `down`.
    pub status: String,
}

impl Node {
    /// Fully provisioned from the platform's point of view.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.address.as_deref().is_some_and(|a| !a.is_empty())
    }

    #[must_use]
    pub fn is_manager(&self) -> bool {
        self.spec.role == Some(NodeRole::Manager)
    }

    #[must_use]
    pub fn pool(&self) -> Option<&str> {
        self.spec.labels.pool()
    }
}
