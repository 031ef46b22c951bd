//! Error types for the instance manager.
//!
//! `ManagerError` is what every exposed operation returns. The narrower
//! enums describe failures at a single boundary (engine adapter, registry
//! store, configuration) and are mapped into `ManagerError` by the layer
//! that knows which instance and operation were involved.

use std::path::PathBuf;

use thiserror::Error;

/// Result type for instance manager operations.
pub type Result<T> = std::result::Result<T, ManagerError>;

/// Errors surfaced by the lifecycle, backup, and log operations.
#[derive(Debug, Error)]
pub enum ManagerError {
    /// Caller-supplied name or environment failed validation.
    #[error("Invalid configuration for '{key}': {reason}")]
    InvalidConfig {
        /// Offending name, env key, or setting.
        key: String,
        /// What was wrong with it.
        reason: String,
    },

    /// Another active instance already holds this name.
    #[error("An active instance named '{name}' already exists")]
    DuplicateName {
        /// The contested name.
        name: String,
    },

    /// No free host port was found within the retry bound.
    #[error("No free host port found after {attempts} attempts")]
    AllocationExhausted {
        /// How many candidates were tried.
        attempts: u32,
    },

    /// The instance (or backup) does not exist.
    #[error("{what} not found")]
    NotFound {
        /// Human-readable description of the missing thing.
        what: String,
    },

    /// A container engine call failed or timed out.
    #[error("Engine call '{operation}' failed for instance '{instance}': {reason}")]
    EngineUnavailable {
        /// Engine operation that failed.
        operation: &'static str,
        /// Instance name or id.
        instance: String,
        /// Underlying error.
        reason: String,
    },

    /// The engine resource is gone but the data directory could not be deleted.
    #[error("Removal of '{instance}' incomplete: could not delete {}: {reason}; retry remove to finish cleanup", .path.display())]
    RemovalIncomplete {
        /// Instance name.
        instance: String,
        /// Data directory left behind.
        path: PathBuf,
        /// Underlying error.
        reason: String,
    },

    /// The archive step (or the quiesce before it) failed.
    #[error("Backup of '{instance}' failed: {reason}{}", resume_suffix(.resume_error))]
    BackupFailed {
        /// Instance name.
        instance: String,
        /// Why the archive could not be produced.
        reason: String,
        /// Set when bringing the instance back up afterwards also failed.
        resume_error: Option<String>,
    },

    /// A backup or restore is already running for this instance.
    #[error("Instance '{instance}' is busy with another backup or restore")]
    InstanceBusy {
        /// Instance name.
        instance: String,
    },

    /// The archive is empty or structurally invalid.
    #[error("Backup '{backup}' is corrupt: {reason}")]
    CorruptBackup {
        /// Backup identifier.
        backup: String,
        /// What failed validation.
        reason: String,
    },

    /// The instance's current status does not permit the operation.
    #[error("Instance '{instance}' cannot go from {from} to {to}")]
    InvalidTransition {
        /// Instance name.
        instance: String,
        /// Current status.
        from: String,
        /// Requested status.
        to: String,
    },

    /// Registry persistence failed.
    #[error("Registry error: {0}")]
    Database(#[from] DatabaseError),
}

fn resume_suffix(resume_error: &Option<String>) -> String {
    match resume_error {
        Some(e) => format!(" (instance could not be restarted: {e})"),
        None => String::new(),
    }
}

impl ManagerError {
    /// Shorthand for a missing instance.
    pub fn instance_not_found(id: &str) -> Self {
        Self::NotFound {
            what: format!("Instance '{id}'"),
        }
    }

    /// Whether the caller can reasonably retry the same operation.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::EngineUnavailable { .. }
                | Self::RemovalIncomplete { .. }
                | Self::InstanceBusy { .. }
                | Self::AllocationExhausted { .. }
        )
    }
}

/// Errors reported by a `ContainerEngine` implementation.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EngineError {
    /// No container with this id or name.
    #[error("container '{id}' not found")]
    NotFound { id: String },

    /// A container with this name already exists at the engine.
    #[error("container name '{name}' already in use")]
    NameConflict { name: String },

    /// The requested host port is already bound.
    #[error("host port {port} is already allocated")]
    PortConflict { port: u16 },

    /// The engine could not be reached or rejected the call.
    #[error("engine unavailable: {reason}")]
    Unavailable { reason: String },
}

/// Registry persistence errors.
#[derive(Debug, Error)]
pub enum DatabaseError {
    #[error("Connection error: {0}")]
    Pool(String),

    #[error("Migration error: {0}")]
    Migration(String),

    #[error("Query error: {0}")]
    Query(String),

    #[error("Corrupt row for instance '{id}': {reason}")]
    Corrupt { id: String, reason: String },
}

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required configuration: {key}. {hint}")]
    MissingRequired { key: String, hint: String },

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}
