use std::path::PathBuf;

use crate::config::helpers::optional_env;
use crate::error::ConfigError;

/// Which registry backend to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DatabaseBackend {
    /// libSQL embedded database file (default).
    #[default]
    LibSql,
    /// Process-local map; nothing survives a restart.
    Memory,
}

impl std::fmt::Display for DatabaseBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::LibSql => write!(f, "libsql"),
            Self::Memory => write!(f, "memory"),
        }
    }
}

impl std::str::FromStr for DatabaseBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "libsql" | "sqlite" | "turso" => Ok(Self::LibSql),
            "memory" | "mem" => Ok(Self::Memory),
            _ => Err(format!(
                "invalid database backend '{}', expected 'libsql' or 'memory'",
                s
            )),
        }
    }
}

/// Registry database configuration.
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    /// Which backend to use (default: libSQL).
    pub backend: DatabaseBackend,
    /// Path to the libSQL database file (default: ~/.helix/helix.db).
    pub path: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            backend: DatabaseBackend::default(),
            path: default_db_path(),
        }
    }
}

impl DatabaseConfig {
    pub(crate) fn resolve() -> Result<Self, ConfigError> {
        let backend: DatabaseBackend = if let Some(b) = optional_env("HELIX_DB_BACKEND")? {
            b.parse().map_err(|e| ConfigError::InvalidValue {
                key: "HELIX_DB_BACKEND".to_string(),
                message: e,
            })?
        } else {
            DatabaseBackend::default()
        };

        let path = optional_env("HELIX_DB_PATH")?
            .map(PathBuf::from)
            .unwrap_or_else(default_db_path);

        Ok(Self { backend, path })
    }
}

/// Base directory for helix state (~/.helix).
pub fn helix_base_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".helix")
}

/// Default registry database path (~/.helix/helix.db).
pub fn default_db_path() -> PathBuf {
    helix_base_dir().join("helix.db")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_parsing() {
        assert_eq!(
            "libsql".parse::<DatabaseBackend>().unwrap(),
            DatabaseBackend::LibSql
        );
        assert_eq!(
            "SQLite".parse::<DatabaseBackend>().unwrap(),
            DatabaseBackend::LibSql
        );
        assert_eq!(
            "memory".parse::<DatabaseBackend>().unwrap(),
            DatabaseBackend::Memory
        );
        assert!("postgres".parse::<DatabaseBackend>().is_err());
    }

    #[test]
    fn test_default_path_ends_with_db_file() {
        assert!(default_db_path().ends_with(".helix/helix.db"));
    }
}
