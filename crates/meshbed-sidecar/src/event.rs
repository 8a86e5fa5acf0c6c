//! Events delivered to the sidecar.
//!
//! Events arrive as newline-delimited JSON:
//!
//! ```text
//! {"type":"configure","container_id":"abc123","netns_path":"/proc/42/ns/net","config":{...}}
//! {"type":"configure","container_id":"abc123","pid":42,"config":{...}}
//! {"type":"release","container_id":"abc123"}
//! ```

use std::path::PathBuf;

use meshbed_common::{ContainerId, MeshbedPaths, MeshbedResult, NetworkConfig};
use serde::{Deserialize, Serialize};

/// Where a container's network namespace lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum NetnsRef {
    /// Namespace file path.
    Path {
        /// e.g. `/proc/42/ns/net` or `/var/run/netns/x`.
        netns_path: PathBuf,
    },
    /// PID of a process inside the container.
    Pid {
        /// Process ID.
        pid: u32,
    },
}

impl NetnsRef {
    /// Resolve to a namespace file path.
    #[must_use]
    pub fn resolve(&self, paths: &MeshbedPaths) -> PathBuf {
        match self {
            Self::Path { netns_path } => netns_path.clone(),
            Self::Pid { pid } => paths.netns_of_pid(*pid),
        }
    }
}

/// One sidecar event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// Converge a container's network towards a config.
    Configure {
        /// Target container.
        container_id: ContainerId,
        /// Its network namespace.
        #[serde(flatten)]
        netns: NetnsRef,
        /// Desired state.
        config: NetworkConfig,
    },
    /// Stop managing a container.
    Release {
        /// Target container.
        container_id: ContainerId,
    },
}

impl Event {
    /// Parse one line.
    ///
    /// # Errors
    ///
    /// Returns a serialization error for malformed events.
    pub fn from_line(line: &str) -> MeshbedResult<Self> {
        Ok(serde_json::from_str(line)?)
    }

    /// The container this event is about.
    #[must_use]
    pub fn container_id(&self) -> &ContainerId {
        match self {
            Self::Configure { container_id, .. } | Self::Release { container_id } => container_id,
        }
    }
}
