//! Container engine adapter.
//!
//! The lifecycle core talks to the host's container runtime only through
//! [`ContainerEngine`]. Implementations map whatever the runtime returns
//! into the fixed shapes below at the boundary, so loosely-typed engine
//! responses never reach the lifecycle or backup code.
//!
//! ```text
//! LifecycleManager ──┐
//! BackupEngine ──────┼──▶ dyn ContainerEngine ──▶ DockerEngine (bollard)
//! LogReader ─────────┘                       └──▶ FakeEngine (tests)
//! ```

mod detect;
mod docker;

pub use detect::{DockerDetection, DockerStatus, Platform, check_docker};
pub use docker::{DockerEngine, connect_docker};

use std::collections::HashMap;
use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::EngineError;

/// Result type for engine calls.
pub type EngineResult<T> = std::result::Result<T, EngineError>;

/// A host-port to container-port TCP binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortMapping {
    pub host_port: u16,
    pub container_port: u16,
}

/// A host directory exposed inside the container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BindMount {
    pub host_path: String,
    pub container_path: String,
    pub read_only: bool,
}

impl BindMount {
    /// Render in the engine's `host:container:mode` form.
    pub fn to_bind_string(&self) -> String {
        let mode = if self.read_only { "ro" } else { "rw" };
        format!("{}:{}:{}", self.host_path, self.container_path, mode)
    }

    /// Parse the engine's `host:container[:mode]` form.
    pub fn parse(raw: &str) -> Option<Self> {
        let mut parts = raw.splitn(3, ':');
        let host_path = parts.next().filter(|p| !p.is_empty())?.to_string();
        let container_path = parts.next().filter(|p| !p.is_empty())?.to_string();
        let read_only = parts
            .next()
            .map(|opts| opts.split(',').any(|o| o == "ro"))
            .unwrap_or(false);
        Some(Self {
            host_path,
            container_path,
            read_only,
        })
    }
}

/// Everything needed to create one workload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSpec {
    /// Engine-visible container name.
    pub name: String,
    /// Image reference.
    pub image: String,
    /// Environment variables: (name, value).
    pub env: Vec<(String, String)>,
    /// Published ports.
    pub ports: Vec<PortMapping>,
    /// Bind mounts.
    pub binds: Vec<BindMount>,
    /// Labels identifying the workload as managed.
    pub labels: HashMap<String, String>,
}

/// Label set on every container this crate creates.
pub const MANAGED_LABEL: &str = "io.helix.managed";

/// Execution state as reported by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContainerState {
    Created,
    Running,
    Paused,
    Restarting,
    Exited,
    Removing,
    Dead,
    Unknown,
}

impl ContainerState {
    /// Whether the workload process is executing.
    pub fn is_running(&self) -> bool {
        matches!(self, Self::Running | Self::Restarting)
    }

    /// Map the engine's textual state.
    pub fn from_engine(raw: &str) -> Self {
        match raw.to_ascii_lowercase().as_str() {
            "created" => Self::Created,
            "running" => Self::Running,
            "paused" => Self::Paused,
            "restarting" => Self::Restarting,
            "exited" => Self::Exited,
            "removing" => Self::Removing,
            "dead" => Self::Dead,
            _ => Self::Unknown,
        }
    }
}

impl fmt::Display for ContainerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Created => "created",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Restarting => "restarting",
            Self::Exited => "exited",
            Self::Removing => "removing",
            Self::Dead => "dead",
            Self::Unknown => "unknown",
        };
        write!(f, "{}", s)
    }
}

/// Result of inspecting a single container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ContainerDetails {
    pub id: String,
    pub state: ContainerState,
    pub bind_mounts: Vec<BindMount>,
}

/// One row of the engine's container listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ContainerSummary {
    pub id: String,
    pub name: String,
    /// Host ports published by this container.
    pub ports: Vec<u16>,
    pub image: String,
    pub state: ContainerState,
}

/// Point-in-time resource usage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ContainerStats {
    pub memory_usage_bytes: u64,
    pub cpu_usage_units: u64,
}

impl ContainerStats {
    /// Memory usage in MiB, for display.
    pub fn memory_usage_mb(&self) -> f64 {
        self.memory_usage_bytes as f64 / (1024.0 * 1024.0)
    }
}

/// Engine operations, used for logging and failure injection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EngineOp {
    Create,
    Start,
    Stop,
    Restart,
    Remove,
    Inspect,
    List,
    Logs,
    Stats,
}

impl EngineOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Start => "start",
            Self::Stop => "stop",
            Self::Restart => "restart",
            Self::Remove => "remove",
            Self::Inspect => "inspect",
            Self::List => "list",
            Self::Logs => "logs",
            Self::Stats => "stats",
        }
    }
}

/// Capability boundary over the host's container runtime.
///
/// Stopping an already-stopped container and starting an already-running
/// one must succeed; implementations absorb the runtime's "not modified"
/// replies.
#[async_trait]
pub trait ContainerEngine: Send + Sync {
    /// Create (but do not start) a container, returning its id.
    async fn create_container(&self, spec: &ContainerSpec) -> EngineResult<String>;

    async fn start_container(&self, id: &str) -> EngineResult<()>;

    async fn stop_container(&self, id: &str) -> EngineResult<()>;

    async fn restart_container(&self, id: &str) -> EngineResult<()>;

    async fn remove_container(&self, id: &str, force: bool) -> EngineResult<()>;

    async fn inspect_container(&self, id: &str) -> EngineResult<ContainerDetails>;

    async fn list_containers(&self, all: bool) -> EngineResult<Vec<ContainerSummary>>;

    /// Raw log bytes for the last `tail` records.
    async fn stream_logs(&self, id: &str, tail: usize, timestamps: bool) -> EngineResult<Vec<u8>>;

    async fn stats(&self, id: &str) -> EngineResult<ContainerStats>;

    /// Host ports currently published by any container.
    async fn bound_ports(&self) -> EngineResult<Vec<u16>> {
        let containers = self.list_containers(true).await?;
        Ok(containers
            .into_iter()
            .flat_map(|c| c.ports.into_iter())
            .collect())
    }
}
