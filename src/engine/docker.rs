//! `ContainerEngine` backed by the Docker daemon via bollard.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use bollard::Docker;
use bollard::container::{
    Config, CreateContainerOptions, ListContainersOptions, LogsOptions, RemoveContainerOptions,
    RestartContainerOptions, StartContainerOptions, StatsOptions, StopContainerOptions,
};
use bollard::models::{HostConfig, PortBinding};
use futures::StreamExt;

use crate::engine::{
    BindMount, ContainerDetails, ContainerEngine, ContainerSpec, ContainerState, ContainerStats,
    ContainerSummary, EngineOp, EngineResult,
};
use crate::error::EngineError;

/// Connect to the local Docker daemon.
///
/// Tries bollard's defaults first (which honour `DOCKER_HOST`), then the
/// per-user sockets used by Docker Desktop and rootless Docker.
pub async fn connect_docker() -> EngineResult<Docker> {
    let mut last_error = match Docker::connect_with_local_defaults() {
        Ok(docker) => match docker.ping().await {
            Ok(_) => return Ok(docker),
            Err(e) => e.to_string(),
        },
        Err(e) => e.to_string(),
    };

    for socket in fallback_sockets() {
        if !socket.exists() {
            continue;
        }
        let Some(path) = socket.to_str() else {
            continue;
        };
        match Docker::connect_with_socket(path, 120, bollard::API_DEFAULT_VERSION) {
            Ok(docker) => match docker.ping().await {
                Ok(_) => {
                    tracing::debug!("Connected to Docker via {}", path);
                    return Ok(docker);
                }
                Err(e) => last_error = e.to_string(),
            },
            Err(e) => last_error = e.to_string(),
        }
    }

    Err(EngineError::Unavailable { reason: last_error })
}

fn fallback_sockets() -> Vec<PathBuf> {
    let mut sockets = Vec::new();
    if cfg!(unix) {
        if let Some(home) = dirs::home_dir() {
            sockets.push(home.join(".docker/run/docker.sock"));
            sockets.push(home.join(".docker/desktop/docker.sock"));
        }
        if let Ok(runtime_dir) = std::env::var("XDG_RUNTIME_DIR") {
            sockets.push(PathBuf::from(runtime_dir).join("docker.sock"));
        }
    }
    sockets
}

/// Docker-backed engine adapter.
pub struct DockerEngine {
    docker: Docker,
    stop_timeout: Duration,
}

impl DockerEngine {
    pub fn new(docker: Docker, stop_timeout: Duration) -> Self {
        Self {
            docker,
            stop_timeout,
        }
    }

    /// Connect to the local daemon and wrap it.
    pub async fn connect(stop_timeout: Duration) -> EngineResult<Self> {
        Ok(Self::new(connect_docker().await?, stop_timeout))
    }
}

/// Map a bollard error into the adapter's error kinds.
fn map_err(op: EngineOp, id: &str, err: bollard::errors::Error) -> EngineError {
    use bollard::errors::Error as BollardError;

    match err {
        BollardError::DockerResponseServerError {
            status_code: 404, ..
        } => EngineError::NotFound { id: id.to_string() },
        BollardError::DockerResponseServerError {
            status_code: 409,
            message,
        } if op == EngineOp::Create => {
            tracing::debug!("Create conflict for {}: {}", id, message);
            EngineError::NameConflict {
                name: id.to_string(),
            }
        }
        BollardError::DockerResponseServerError { message, .. }
            if message.contains("port is already allocated")
                || message.contains("address already in use") =>
        {
            EngineError::PortConflict {
                port: port_from_message(&message).unwrap_or(0),
            }
        }
        other => EngineError::Unavailable {
            reason: format!("{} {}: {}", op.as_str(), id, other),
        },
    }
}

/// Pull the host port out of a bind failure such as
/// `Bind for 0.0.0.0:25565 failed: port is already allocated`.
fn port_from_message(message: &str) -> Option<u16> {
    let idx = message.find("0.0.0.0:").map(|i| i + "0.0.0.0:".len())?;
    let digits: String = message[idx..]
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect();
    digits.parse().ok()
}

/// `304 Not Modified` means the container is already in the requested state.
fn is_not_modified(err: &bollard::errors::Error) -> bool {
    matches!(
        err,
        bollard::errors::Error::DockerResponseServerError {
            status_code: 304,
            ..
        }
    )
}

#[async_trait]
impl ContainerEngine for DockerEngine {
    async fn create_container(&self, spec: &ContainerSpec) -> EngineResult<String> {
        let mut port_bindings = HashMap::new();
        let mut exposed_ports: HashMap<String, HashMap<(), ()>> = HashMap::new();
        for mapping in &spec.ports {
            let key = format!("{}/tcp", mapping.container_port);
            port_bindings.insert(
                key.clone(),
                Some(vec![PortBinding {
                    host_ip: None,
                    host_port: Some(mapping.host_port.to_string()),
                }]),
            );
            exposed_ports.insert(key, HashMap::new());
        }

        let env: Vec<String> = spec
            .env
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();

        let binds: Vec<String> = spec.binds.iter().map(BindMount::to_bind_string).collect();

        let host_config = HostConfig {
            port_bindings: Some(port_bindings),
            binds: if binds.is_empty() { None } else { Some(binds) },
            auto_remove: Some(false),
            ..Default::default()
        };

        let config = Config {
            image: Some(spec.image.clone()),
            env: if env.is_empty() { None } else { Some(env) },
            exposed_ports: Some(exposed_ports),
            labels: Some(spec.labels.clone()),
            host_config: Some(host_config),
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: spec.name.clone(),
            ..Default::default()
        };

        let response = self
            .docker
            .create_container(Some(options), config)
            .await
            .map_err(|e| match map_err(EngineOp::Create, &spec.name, e) {
                EngineError::PortConflict { .. } => EngineError::PortConflict {
                    port: spec.ports.first().map(|p| p.host_port).unwrap_or(0),
                },
                other => other,
            })?;

        for warning in &response.warnings {
            tracing::warn!("Engine warning creating {}: {}", spec.name, warning);
        }

        Ok(response.id)
    }

    async fn start_container(&self, id: &str) -> EngineResult<()> {
        match self
            .docker
            .start_container(id, None::<StartContainerOptions<String>>)
            .await
        {
            Ok(()) => Ok(()),
            Err(e) if is_not_modified(&e) => Ok(()),
            Err(e) => Err(map_err(EngineOp::Start, id, e)),
        }
    }

    async fn stop_container(&self, id: &str) -> EngineResult<()> {
        let options = StopContainerOptions {
            t: self.stop_timeout.as_secs() as i64,
        };
        match self.docker.stop_container(id, Some(options)).await {
            Ok(()) => Ok(()),
            Err(e) if is_not_modified(&e) => Ok(()),
            Err(e) => Err(map_err(EngineOp::Stop, id, e)),
        }
    }

    async fn restart_container(&self, id: &str) -> EngineResult<()> {
        let options = RestartContainerOptions {
            t: self.stop_timeout.as_secs() as isize,
        };
        self.docker
            .restart_container(id, Some(options))
            .await
            .map_err(|e| map_err(EngineOp::Restart, id, e))
    }

    async fn remove_container(&self, id: &str, force: bool) -> EngineResult<()> {
        self.docker
            .remove_container(
                id,
                Some(RemoveContainerOptions {
                    force,
                    ..Default::default()
                }),
            )
            .await
            .map_err(|e| map_err(EngineOp::Remove, id, e))
    }

    async fn inspect_container(&self, id: &str) -> EngineResult<ContainerDetails> {
        let info = self
            .docker
            .inspect_container(id, None)
            .await
            .map_err(|e| map_err(EngineOp::Inspect, id, e))?;

        let state = match info.state.as_ref() {
            Some(s) if s.running == Some(true) => ContainerState::Running,
            Some(s) => s
                .status
                .map(|status| ContainerState::from_engine(&status.to_string()))
                .unwrap_or(ContainerState::Unknown),
            None => ContainerState::Unknown,
        };

        let bind_mounts = info
            .host_config
            .and_then(|hc| hc.binds)
            .unwrap_or_default()
            .iter()
            .filter_map(|raw| BindMount::parse(raw))
            .collect();

        Ok(ContainerDetails {
            id: info.id.unwrap_or_else(|| id.to_string()),
            state,
            bind_mounts,
        })
    }

    async fn list_containers(&self, all: bool) -> EngineResult<Vec<ContainerSummary>> {
        let options = ListContainersOptions::<String> {
            all,
            ..Default::default()
        };
        let containers = self
            .docker
            .list_containers(Some(options))
            .await
            .map_err(|e| map_err(EngineOp::List, "*", e))?;

        Ok(containers
            .into_iter()
            .map(|c| ContainerSummary {
                id: c.id.unwrap_or_default(),
                name: c
                    .names
                    .and_then(|names| names.into_iter().next())
                    .map(|n| n.trim_start_matches('/').to_string())
                    .unwrap_or_default(),
                ports: c
                    .ports
                    .unwrap_or_default()
                    .iter()
                    .filter_map(|p| p.public_port)
                    .collect(),
                image: c.image.unwrap_or_default(),
                state: c
                    .state
                    .as_deref()
                    .map(ContainerState::from_engine)
                    .unwrap_or(ContainerState::Unknown),
            })
            .collect())
    }

    async fn stream_logs(&self, id: &str, tail: usize, timestamps: bool) -> EngineResult<Vec<u8>> {
        let options = LogsOptions::<String> {
            stdout: true,
            stderr: true,
            timestamps,
            tail: tail.to_string(),
            ..Default::default()
        };

        let mut stream = self.docker.logs(id, Some(options));
        let mut buf = Vec::new();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| map_err(EngineOp::Logs, id, e))?;
            buf.extend_from_slice(&chunk.into_bytes());
        }
        Ok(buf)
    }

    async fn stats(&self, id: &str) -> EngineResult<ContainerStats> {
        let options = StatsOptions {
            stream: false,
            one_shot: true,
        };
        let mut stream = self.docker.stats(id, Some(options));
        match stream.next().await {
            Some(Ok(stats)) => Ok(ContainerStats {
                memory_usage_bytes: stats.memory_stats.usage.unwrap_or(0),
                cpu_usage_units: stats.cpu_stats.cpu_usage.total_usage,
            }),
            Some(Err(e)) => Err(map_err(EngineOp::Stats, id, e)),
            None => Err(EngineError::Unavailable {
                reason: format!("stats {}: engine returned no sample", id),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server_error(status_code: u16, message: &str) -> bollard::errors::Error {
        bollard::errors::Error::DockerResponseServerError {
            status_code,
            message: message.to_string(),
        }
    }

    #[test]
    fn test_not_found_mapping() {
        let err = map_err(EngineOp::Start, "abc", server_error(404, "No such container"));
        assert_eq!(
            err,
            EngineError::NotFound {
                id: "abc".to_string()
            }
        );
    }

    #[test]
    fn test_conflict_mapping_only_on_create() {
        let err = map_err(EngineOp::Create, "alpha", server_error(409, "name in use"));
        assert!(matches!(err, EngineError::NameConflict { .. }));

        let err = map_err(EngineOp::Remove, "alpha", server_error(409, "removal in progress"));
        assert!(matches!(err, EngineError::Unavailable { .. }));
    }

    #[test]
    fn test_port_conflict_mapping() {
        let err = map_err(
            EngineOp::Start,
            "abc",
            server_error(
                500,
                "driver failed programming external connectivity: Bind for 0.0.0.0:25565 failed: port is already allocated",
            ),
        );
        assert_eq!(err, EngineError::PortConflict { port: 25565 });
    }

    #[test]
    fn test_not_modified_detection() {
        assert!(is_not_modified(&server_error(304, "")));
        assert!(!is_not_modified(&server_error(500, "")));
    }
}
