//! Docker availability check for `helix doctor`.
//!
//! Reports whether the `docker` binary is on PATH and whether the daemon
//! answers a ping, with platform-appropriate hints when it does not.
//! Rootless and Docker Desktop sockets are covered by the fallback list in
//! [`connect_docker`](super::connect_docker); `DOCKER_HOST` still wins when set.

/// Docker daemon availability status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DockerStatus {
    /// Binary on PATH and daemon responding to ping.
    Available,
    /// `docker` binary not found on PATH.
    NotInstalled,
    /// Binary found but daemon not responding.
    NotRunning,
}

impl DockerStatus {
    pub fn is_ok(&self) -> bool {
        matches!(self, DockerStatus::Available)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DockerStatus::Available => "available",
            DockerStatus::NotInstalled => "not installed",
            DockerStatus::NotRunning => "not running",
        }
    }
}

/// Host platform, for guidance text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    MacOS,
    Linux,
    Windows,
}

impl Platform {
    pub fn current() -> Self {
        match std::env::consts::OS {
            "macos" => Platform::MacOS,
            "windows" => Platform::Windows,
            _ => Platform::Linux,
        }
    }

    /// Shown when no Docker client or socket can be found.
    pub fn install_hint(&self) -> &'static str {
        match self {
            Platform::Linux => {
                "helix needs a Docker daemon. Install docker-ce or podman-docker, \
                 or set DOCKER_HOST to a reachable daemon, then run `helix doctor`"
            }
            Platform::MacOS | Platform::Windows => {
                "helix needs a Docker daemon. Install Docker Desktop (or colima), \
                 or set DOCKER_HOST to a reachable daemon, then run `helix doctor`"
            }
        }
    }

    /// Shown when a Docker client exists but the daemon does not answer.
    pub fn start_hint(&self) -> &'static str {
        match self {
            Platform::Linux => {
                "Docker daemon is not answering. Start it (systemctl start docker) \
                 or check DOCKER_HOST, then rerun `helix doctor`"
            }
            Platform::MacOS | Platform::Windows => {
                "Docker daemon is not answering. Launch Docker Desktop or check \
                 DOCKER_HOST, then rerun `helix doctor`"
            }
        }
    }
}

/// Result of a Docker detection check.
#[derive(Debug, Clone, Copy)]
pub struct DockerDetection {
    pub status: DockerStatus,
    pub platform: Platform,
}

impl DockerDetection {
    /// What the operator should do next, if anything.
    pub fn hint(&self) -> Option<&'static str> {
        match self.status {
            DockerStatus::Available => None,
            DockerStatus::NotInstalled => Some(self.platform.install_hint()),
            DockerStatus::NotRunning => Some(self.platform.start_hint()),
        }
    }
}

/// Check whether Docker is installed and running.
pub async fn check_docker() -> DockerDetection {
    let platform = Platform::current();

    if !docker_binary_exists() {
        return DockerDetection {
            status: DockerStatus::NotInstalled,
            platform,
        };
    }

    let status = match super::connect_docker().await {
        Ok(_) => DockerStatus::Available,
        Err(e) => {
            tracing::debug!("Docker ping failed: {}", e);
            DockerStatus::NotRunning
        }
    };

    DockerDetection { status, platform }
}

fn docker_binary_exists() -> bool {
    let finder = if cfg!(windows) { "where" } else { "which" };
    std::process::Command::new(finder)
        .arg("docker")
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .status()
        .is_ok_and(|s| s.success())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hints_follow_status() {
        let detection = DockerDetection {
            status: DockerStatus::NotInstalled,
            platform: Platform::Linux,
        };
        assert_eq!(detection.hint(), Some(Platform::Linux.install_hint()));

        let detection = DockerDetection {
            status: DockerStatus::NotRunning,
            platform: Platform::MacOS,
        };
        assert_eq!(detection.hint(), Some(Platform::MacOS.start_hint()));

        let detection = DockerDetection {
            status: DockerStatus::Available,
            platform: Platform::Windows,
        };
        assert_eq!(detection.hint(), None);
    }

    #[test]
    fn test_docker_status_display() {
        assert_eq!(DockerStatus::Available.as_str(), "available");
        assert_eq!(DockerStatus::NotInstalled.as_str(), "not installed");
        assert_eq!(DockerStatus::NotRunning.as_str(), "not running");
        assert!(DockerStatus::Available.is_ok());
        assert!(!DockerStatus::NotRunning.is_ok());
    }

    #[tokio::test]
    async fn test_check_docker_returns_a_status() {
        let result = check_docker().await;
        assert!(!result.status.as_str().is_empty());
    }
}
