//! Engine API failures classified for the engine.

use bollard::errors::Error as DockerError;

use crate::domain::BackendError;

/// Message the manager returns when a spec was written with a stale
/// version index.
const OUT_OF_SEQUENCE: &str = "update out of sequence";
const ALREADY_IN_SWARM: &str = "already part of a swarm";

pub(crate) fn classify(err: DockerError) -> BackendError {
    match err {
        DockerError::DockerResponseServerError {
            status_code: 404, ..
        } => BackendError::NotFound,
        DockerError::DockerResponseServerError { message, .. }
            if message.contains(OUT_OF_SEQUENCE) =>
        {
            BackendError::Conflict(message)
        }
        DockerError::DockerResponseServerError { message, .. }
            if message.contains(ALREADY_IN_SWARM) =>
        {
            BackendError::AlreadyMember
        }
        other => BackendError::Api(other.into()),
    }
}

/// Same classification for the raw HTTP calls bollard does not cover.
pub(crate) fn classify_status(status: reqwest::StatusCode, body: String) -> BackendError {
    if status == reqwest::StatusCode::NOT_FOUND {
        BackendError::NotFound
    } else if body.contains(ALREADY_IN_SWARM) {
        BackendError::AlreadyMember
    } else if body.contains(OUT_OF_SEQUENCE) {
        BackendError::Conflict(body)
    } else {
        BackendError::Api(anyhow::anyhow!("engine API returned {status}: {body}"))
    }
}

pub(crate) fn is_conflict_status(err: &DockerError) -> bool {
    matches!(
        err,
        DockerError::DockerResponseServerError {
            status_code: 409,
            ..
        }
    )
}
