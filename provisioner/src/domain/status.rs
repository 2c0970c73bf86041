//! Backend-native state to canonical unit status.
//!
//! One fixed table per backend. Anything a table does not name maps to
//! `UnitStatus::default()`.

use convoy_common::UnitStatus;

use super::task::{NativeState, PodPhase, SwarmTaskState};

impl NativeState {
    #[must_use]
    pub fn unit_status(self) -> UnitStatus {
        match self {
            NativeState::Swarm(state) => swarm_status(state),
            NativeState::Pod(phase) => pod_status(phase),
        }
    }
}

fn swarm_status(state: SwarmTaskState) -> UnitStatus {
    match state {
        SwarmTaskState::New => UnitStatus::Created,
        SwarmTaskState::Allocated
        | SwarmTaskState::Pending
        | SwarmTaskState::Assigned
        | SwarmTaskState::Accepted
        | SwarmTaskState::Preparing
        | SwarmTaskState::Ready
        | SwarmTaskState::Starting => UnitStatus::Starting,
        SwarmTaskState::Running => UnitStatus::Started,
        SwarmTaskState::Complete | SwarmTaskState::Shutdown => UnitStatus::Stopped,
        SwarmTaskState::Failed | SwarmTaskState::Rejected => UnitStatus::Error,
        SwarmTaskState::Remove | SwarmTaskState::Orphaned => UnitStatus::default(),
    }
}

fn pod_status(phase: PodPhase) -> UnitStatus {
    match phase {
        PodPhase::Pending => UnitStatus::Created,
        PodPhase::Running => UnitStatus::Started,
        PodPhase::Succeeded => UnitStatus::Stopped,
        PodPhase::Failed | PodPhase::Unknown => UnitStatus::Error,
    }
}
