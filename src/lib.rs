//! Helix - lifecycle management for containerised game servers.
//!
//! Helix runs one container per named instance on a single host. It owns:
//!
//! - **Ports**: a preferred host port with a randomised fallback range,
//!   checked against both the registry and the engine's live bindings
//! - **Registry**: durable instance records with a guarded status machine
//! - **Lifecycle**: create, start, stop, restart, remove, status, stats
//! - **Backups**: crash-consistent tar.gz archives taken with the instance
//!   stopped, and restores that swap data directories atomically
//! - **Logs**: tails of the container console with engine framing removed
//!
//! The container runtime is reached only through [`engine::ContainerEngine`];
//! [`engine::DockerEngine`] is the production adapter.

pub mod backup;
pub mod cli;
pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod lifecycle;
pub mod logs;
pub mod ports;
pub mod registry;
pub mod testing;

pub use config::Config;
pub use error::{ManagerError, Result};
