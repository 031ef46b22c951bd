//! Registry persistence.
//!
//! [`InstanceStore`] is the narrow read/write interface the registry sits on.
//! Two implementations exist:
//!
//! - `libsql` (default feature): embedded SQLite-compatible file via libSQL
//! - [`MemoryStore`]: process-local map, for tests and throwaway runs

#[cfg(feature = "libsql")]
pub mod libsql_backend;

mod memory;

pub use memory::MemoryStore;

use std::sync::Arc;

use async_trait::async_trait;

use crate::config::{DatabaseBackend, DatabaseConfig};
use crate::error::DatabaseError;
use crate::registry::{Instance, InstanceStatus};

/// Create a store from configuration, run migrations, and return it.
pub async fn connect_from_config(
    config: &DatabaseConfig,
) -> Result<Arc<dyn InstanceStore>, DatabaseError> {
    match config.backend {
        #[cfg(feature = "libsql")]
        DatabaseBackend::LibSql => {
            let backend = libsql_backend::LibSqlBackend::new_local(&config.path).await?;
            backend.run_migrations().await?;
            tracing::debug!("Registry opened at {}", config.path.display());
            Ok(Arc::new(backend))
        }
        #[cfg(not(feature = "libsql"))]
        DatabaseBackend::LibSql => Err(DatabaseError::Pool(
            "libSQL backend not compiled in. Enable the 'libsql' feature or set HELIX_DB_BACKEND=memory."
                .to_string(),
        )),
        DatabaseBackend::Memory => {
            tracing::warn!("Using in-memory registry; instance records will not survive restart");
            let store = MemoryStore::new();
            store.run_migrations().await?;
            Ok(Arc::new(store))
        }
    }
}

/// Backend-agnostic instance persistence.
///
/// Rows are keyed by engine-assigned container id. Removed rows are kept so
/// the history survives; name lookups only consider active rows.
#[async_trait]
pub trait InstanceStore: Send + Sync {
    /// Run schema migrations for this backend.
    async fn run_migrations(&self) -> Result<(), DatabaseError>;

    /// Insert a row, or replace the one with the same id.
    async fn upsert_instance(&self, instance: &Instance) -> Result<(), DatabaseError>;

    /// Update status and cleanup flag. Returns false if no row has this id.
    async fn update_status(
        &self,
        id: &str,
        status: InstanceStatus,
        cleanup_pending: bool,
    ) -> Result<bool, DatabaseError>;

    async fn get_instance(&self, id: &str) -> Result<Option<Instance>, DatabaseError>;

    /// The non-removed row holding `name`, if any.
    async fn find_active_by_name(&self, name: &str) -> Result<Option<Instance>, DatabaseError>;

    /// Every row, newest first.
    async fn list_instances(&self) -> Result<Vec<Instance>, DatabaseError>;
}
