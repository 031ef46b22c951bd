//! Configuration resolved from the environment.
//!
//! Each section owns a `resolve()` that reads its `HELIX_*` variables and
//! falls back to its `Default`. Call [`Config::from_env`] after
//! `dotenvy::dotenv()` so a local `.env` file is honoured.

mod database;
mod engine;
pub(crate) mod helpers;
mod instances;

pub use database::{DatabaseBackend, DatabaseConfig, default_db_path, helix_base_dir};
pub use engine::EngineConfig;
pub use instances::InstanceConfig;

use crate::error::ConfigError;

/// Full manager configuration.
#[derive(Debug, Clone, Default)]
pub struct Config {
    pub instances: InstanceConfig,
    pub database: DatabaseConfig,
    pub engine: EngineConfig,
}

impl Config {
    /// Resolve every section from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            instances: InstanceConfig::resolve()?,
            database: DatabaseConfig::resolve()?,
            engine: EngineConfig::resolve()?,
        })
    }
}
