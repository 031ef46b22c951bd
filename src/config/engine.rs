use std::time::Duration;

use crate::config::helpers::parse_optional_env;
use crate::error::ConfigError;

/// Container engine settings. The socket itself comes from `DOCKER_HOST`
/// or the platform default, as bollard resolves it.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Grace period given to a workload before the engine kills it on stop.
    pub stop_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            stop_timeout: Duration::from_secs(30),
        }
    }
}

impl EngineConfig {
    pub(crate) fn resolve() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            stop_timeout: Duration::from_secs(parse_optional_env(
                "HELIX_STOP_TIMEOUT_SECS",
                defaults.stop_timeout.as_secs(),
            )?),
        })
    }
}
