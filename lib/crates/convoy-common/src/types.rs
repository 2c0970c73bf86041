use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Canonical status of one application unit, independent of backend.
///
/// `Created` is the explicit fallback for any backend state the status
/// tables do not know.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnitStatus {
    #[default]
    Created,
    Starting,
    Started,
    Stopped,
    Error,
}

impl fmt::Display for UnitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            UnitStatus::Created => "created",
            UnitStatus::Starting => "starting",
            UnitStatus::Started => "started",
            UnitStatus::Stopped => "stopped",
            UnitStatus::Error => "error",
        };
        f.write_str(s)
    }
}

/// One running or terminated instance of an application process, as
/// reported to callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Unit {
    pub id: String,
    pub app_name: String,
    pub process_name: String,
    #[serde(rename = "type")]
    pub platform: String,
    pub ip: String,
    pub status: UnitStatus,
    /// `http://ip[:port]` for units reachable from outside the cluster.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
}

/// Transition intent for one application process.
///
/// `increment` combines with at most one lifecycle transition, e.g. a
/// scale-up of a running process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ProcessState {
    #[serde(default)]
    pub start: bool,
    #[serde(default)]
    pub stop: bool,
    #[serde(default)]
    pub restart: bool,
    #[serde(default)]
    pub sleep: bool,
    #[serde(default)]
    pub increment: i64,
}

impl ProcessState {
    #[must_use]
    pub fn scale(increment: i64) -> Self {
        Self {
            increment,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn start() -> Self {
        Self {
            start: true,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn stop() -> Self {
        Self {
            stop: true,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn restart() -> Self {
        Self {
            start: true,
            restart: true,
            ..Self::default()
        }
    }

    /// Sleep is a stop that keeps the asleep marker.
    #[must_use]
    pub fn sleep() -> Self {
        Self {
            stop: true,
            sleep: true,
            ..Self::default()
        }
    }
}

/// Cluster-membership role of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeRole {
    Manager,
    Worker,
}

impl fmt::Display for NodeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            NodeRole::Manager => "manager",
            NodeRole::Worker => "worker",
        })
    }
}

/// Scheduling availability of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Availability {
    #[default]
    Active,
    Pause,
    Drain,
}

impl fmt::Display for Availability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Availability::Active => "active",
            Availability::Pause => "pause",
            Availability::Drain => "drain",
        })
    }
}

#[derive(Debug, Error)]
#[error("unknown availability '{0}': expected active, pause or drain")]
pub struct ParseAvailabilityError(String);

impl FromStr for Availability {
    type Err = ParseAvailabilityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Availability::Active),
            "pause" => Ok(Availability::Pause),
            "drain" => Ok(Availability::Drain),
            other => Err(ParseAvailabilityError(other.to_string())),
        }
    }
}
