//! Read-only snapshots handed over by the application and image
//! collaborators.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// An application as seen during one call. Never mutated by the engine.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AppInfo {
    pub name: String,
    pub pool: String,
    pub platform: String,
    pub envs: BTreeMap<String, String>,
    /// Number of successful deploys so far.
    pub deploys: u64,
}

impl AppInfo {
    #[must_use]
    pub fn new(name: &str, pool: &str, platform: &str) -> Self {
        Self {
            name: name.to_string(),
            pool: pool.to_string(),
            platform: platform.to_string(),
            ..Self::default()
        }
    }
}

/// HTTP health check declared by an image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageHealthcheck {
    pub path: String,
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default = "default_status")]
    pub status: u16,
    #[serde(default)]
    pub allowed_failures: u32,
}

fn default_method() -> String {
    "GET".to_string()
}

fn default_status() -> u16 {
    200
}

/// What an image declares about itself: its processes and health check.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ImageMetadata {
    /// Process name to shell command, as read from the Procfile.
    #[serde(default)]
    pub processes: BTreeMap<String, String>,
    #[serde(default)]
    pub healthcheck: Option<ImageHealthcheck>,
}

impl ImageMetadata {
    /// The process receiving HTTP traffic: `web` when declared, otherwise
    /// the only process, otherwise none.
    #[must_use]
    pub fn web_process(&self) -> Option<&str> {
        if self.processes.contains_key("web") {
            return Some("web");
        }
        if self.processes.len() == 1 {
            return self.processes.keys().next().map(String::as_str);
        }
        None
    }
}
