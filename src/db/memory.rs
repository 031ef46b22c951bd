//! In-memory `InstanceStore`.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::db::InstanceStore;
use crate::error::DatabaseError;
use crate::registry::{Instance, InstanceStatus};

/// Process-local store. Contents are lost on exit.
#[derive(Default)]
pub struct MemoryStore {
    rows: RwLock<HashMap<String, Instance>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl InstanceStore for MemoryStore {
    async fn run_migrations(&self) -> Result<(), DatabaseError> {
        Ok(())
    }

    async fn upsert_instance(&self, instance: &Instance) -> Result<(), DatabaseError> {
        self.rows
            .write()
            .await
            .insert(instance.id.clone(), instance.clone());
        Ok(())
    }

    async fn update_status(
        &self,
        id: &str,
        status: InstanceStatus,
        cleanup_pending: bool,
    ) -> Result<bool, DatabaseError> {
        let mut rows = self.rows.write().await;
        match rows.get_mut(id) {
            Some(row) => {
                row.status = status;
                row.cleanup_pending = cleanup_pending;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn get_instance(&self, id: &str) -> Result<Option<Instance>, DatabaseError> {
        Ok(self.rows.read().await.get(id).cloned())
    }

    async fn find_active_by_name(&self, name: &str) -> Result<Option<Instance>, DatabaseError> {
        Ok(self
            .rows
            .read()
            .await
            .values()
            .find(|row| row.name == name && row.is_active())
            .cloned())
    }

    async fn list_instances(&self) -> Result<Vec<Instance>, DatabaseError> {
        let mut rows: Vec<Instance> = self.rows.read().await.values().cloned().collect();
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(rows)
    }
}
