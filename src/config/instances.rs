use std::ops::RangeInclusive;
use std::path::{Path, PathBuf};

use regex::Regex;

use crate::config::helpers::{optional_env, parse_optional_env};
use crate::error::ConfigError;

/// How new instances are shaped: image, host paths, ports, and env defaults.
#[derive(Debug, Clone)]
pub struct InstanceConfig {
    /// Workload image every instance runs.
    pub image: String,
    /// Root directory holding one data directory per instance name.
    pub data_root: PathBuf,
    /// Root directory holding one backup directory per instance name.
    pub backup_root: PathBuf,
    /// Where the data directory is mounted inside the container.
    pub container_data_path: String,
    /// Fixed internal service port; also the preferred host port.
    pub service_port: u16,
    /// First port of the ephemeral draw range.
    pub port_range_start: u16,
    /// Last port of the ephemeral draw range (inclusive).
    pub port_range_end: u16,
    /// Upper bound on allocation attempts before giving up.
    pub port_max_attempts: u32,
    /// Version used when the caller omits one.
    pub default_version: String,
    /// `MEMORY` value used when the caller omits one.
    pub default_memory: String,
    /// Accepted shape of `MEMORY` values.
    pub memory_pattern: Regex,
}

impl Default for InstanceConfig {
    fn default() -> Self {
        Self {
            image: "itzg/minecraft-server:latest".to_string(),
            data_root: PathBuf::from("/helix/minecraft-data"),
            backup_root: PathBuf::from("/helix/minecraft-backups"),
            container_data_path: "/data".to_string(),
            service_port: 25565,
            port_range_start: 25566,
            port_range_end: 25665,
            port_max_attempts: 64,
            default_version: "LATEST".to_string(),
            default_memory: "2G".to_string(),
            memory_pattern: default_memory_pattern(),
        }
    }
}

fn default_memory_pattern() -> Regex {
    Regex::new(r"^[1-8]G$").expect("static memory pattern is valid")
}

impl InstanceConfig {
    pub(crate) fn resolve() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let memory_pattern = match optional_env("HELIX_MEMORY_PATTERN")? {
            Some(raw) => Regex::new(&raw).map_err(|e| ConfigError::InvalidValue {
                key: "HELIX_MEMORY_PATTERN".to_string(),
                message: e.to_string(),
            })?,
            None => defaults.memory_pattern,
        };

        let config = Self {
            image: optional_env("HELIX_IMAGE")?.unwrap_or(defaults.image),
            data_root: optional_env("HELIX_DATA_DIR")?
                .map(PathBuf::from)
                .unwrap_or(defaults.data_root),
            backup_root: optional_env("HELIX_BACKUP_DIR")?
                .map(PathBuf::from)
                .unwrap_or(defaults.backup_root),
            container_data_path: optional_env("HELIX_CONTAINER_DATA_PATH")?
                .unwrap_or(defaults.container_data_path),
            service_port: parse_optional_env("HELIX_SERVICE_PORT", defaults.service_port)?,
            port_range_start: parse_optional_env(
                "HELIX_PORT_RANGE_START",
                defaults.port_range_start,
            )?,
            port_range_end: parse_optional_env("HELIX_PORT_RANGE_END", defaults.port_range_end)?,
            port_max_attempts: parse_optional_env(
                "HELIX_PORT_MAX_ATTEMPTS",
                defaults.port_max_attempts,
            )?,
            default_version: optional_env("HELIX_DEFAULT_VERSION")?
                .unwrap_or(defaults.default_version),
            default_memory: optional_env("HELIX_DEFAULT_MEMORY")?
                .unwrap_or(defaults.default_memory),
            memory_pattern,
        };

        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.port_range_start > self.port_range_end {
            return Err(ConfigError::InvalidValue {
                key: "HELIX_PORT_RANGE_START".to_string(),
                message: format!(
                    "range start {} is above range end {}",
                    self.port_range_start, self.port_range_end
                ),
            });
        }
        if self.port_max_attempts == 0 {
            return Err(ConfigError::InvalidValue {
                key: "HELIX_PORT_MAX_ATTEMPTS".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        if !self.memory_pattern.is_match(&self.default_memory) {
            return Err(ConfigError::InvalidValue {
                key: "HELIX_DEFAULT_MEMORY".to_string(),
                message: format!(
                    "'{}' does not match the memory pattern {}",
                    self.default_memory,
                    self.memory_pattern.as_str()
                ),
            });
        }
        Ok(())
    }

    /// The ephemeral port range.
    pub fn port_range(&self) -> RangeInclusive<u16> {
        self.port_range_start..=self.port_range_end
    }

    /// Data directory for an instance name.
    pub fn data_path(&self, name: &str) -> PathBuf {
        self.data_root.join(name)
    }

    /// Backup directory for an instance name.
    pub fn backup_dir(&self, name: &str) -> PathBuf {
        self.backup_root.join(name)
    }

    /// Whether `path` is a direct child of the data root.
    pub fn owns_data_path(&self, path: &Path) -> bool {
        path.parent() == Some(self.data_root.as_path())
    }

    /// Point both roots at a scratch directory (used by tests and dry runs).
    pub fn rooted_at(root: &Path) -> Self {
        Self {
            data_root: root.join("data"),
            backup_root: root.join("backups"),
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = InstanceConfig::default();
        config.validate().unwrap();
        assert_eq!(config.service_port, 25565);
        assert!(!config.port_range().contains(&config.service_port));
    }

    #[test]
    fn test_memory_pattern() {
        let config = InstanceConfig::default();
        assert!(config.memory_pattern.is_match("2G"));
        assert!(config.memory_pattern.is_match("8G"));
        assert!(!config.memory_pattern.is_match("12G"));
        assert!(!config.memory_pattern.is_match("1024M"));
    }

    #[test]
    fn test_inverted_range_rejected() {
        let config = InstanceConfig {
            port_range_start: 30000,
            port_range_end: 20000,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_data_paths_derive_from_name() {
        let config = InstanceConfig::rooted_at(Path::new("/srv/helix"));
        let path = config.data_path("alpha");
        assert_eq!(path, PathBuf::from("/srv/helix/data/alpha"));
        assert!(config.owns_data_path(&path));
        assert!(!config.owns_data_path(Path::new("/srv/helix/data")));
        assert!(!config.owns_data_path(Path::new("/etc/alpha")));
        assert_eq!(
            config.backup_dir("alpha"),
            PathBuf::from("/srv/helix/backups/alpha")
        );
    }
}
